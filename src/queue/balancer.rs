use std::collections::HashMap;
use std::sync::Arc;

use crate::fleet::Label;
use crate::queue::consistent_hash::ConsistentHash;
use crate::queue::offer::JobOffer;
use crate::task::{SubTask, Task};
use crate::work::WorkUnitContext;

/// One candidate executor slot offered to the load balancer.
#[derive(Debug, Clone)]
pub struct WorksheetSlot {
    pub executor_id: u64,
    pub node_name: String,
    /// Executor count of the slot's node, for weighting.
    pub node_executors: u32,
}

/// Everything a load balancer needs to place one buildable item: the work
/// list (primary slice first) and the candidate slots that passed the
/// `can_take` checks.
pub struct MappingWorksheet {
    pub item_id: u64,
    pub task: Arc<dyn Task>,
    pub assigned_label: Option<Label>,
    /// Display names of the work slices to place, primary first.
    pub works: Vec<String>,
    pub slots: Vec<WorksheetSlot>,
}

/// A complete placement: one distinct slot per work slice.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Mapping {
    /// `assignments[w]` is the index into `worksheet.slots` for work `w`.
    pub assignments: Vec<usize>,
}

impl Mapping {
    pub fn is_valid(&self, worksheet: &MappingWorksheet) -> bool {
        if self.assignments.len() != worksheet.works.len() {
            return false;
        }
        let mut seen = vec![false; worksheet.slots.len()];
        for &slot in &self.assignments {
            if slot >= worksheet.slots.len() || seen[slot] {
                return false;
            }
            seen[slot] = true;
        }
        true
    }

    /// Carry the placement out: cut one work unit per work slice from the
    /// context and hand each to its mapped offer, waking the parked
    /// executor. The caller validates the mapping first.
    pub(crate) fn execute(
        &self,
        worksheet: &MappingWorksheet,
        context: &Arc<WorkUnitContext>,
        subs: &[Arc<dyn SubTask>],
        parked: &mut HashMap<u64, JobOffer>,
    ) {
        for (work_idx, slot_idx) in self.assignments.iter().enumerate() {
            let unit = if work_idx == 0 {
                context.create_main_work_unit()
            } else {
                context.create_sub_work_unit(subs[work_idx - 1].clone())
            };
            let executor_id = worksheet.slots[*slot_idx].executor_id;
            match parked.get_mut(&executor_id) {
                Some(offer) => {
                    if let Err(e) = offer.assign(unit) {
                        tracing::error!(error = %e, "load balancer produced a conflicting mapping");
                    }
                }
                None => tracing::error!(executor_id, "mapped executor vanished mid-dispatch"),
            }
        }
    }
}

/// Chooses executors for a buildable item. Returning `None` leaves the item
/// in the buildable stage for a later pass.
pub trait LoadBalancer: Send + Sync {
    fn map(&self, task: &Arc<dyn Task>, worksheet: &MappingWorksheet) -> Option<Mapping>;
}

/// Default balancer: prefers nodes in consistent-hash order keyed by the
/// task's full name, so repeat builds of a task land on the same node while
/// the fleet is stable.
#[derive(Debug, Default)]
pub struct ConsistentHashBalancer;

impl LoadBalancer for ConsistentHashBalancer {
    fn map(&self, task: &Arc<dyn Task>, worksheet: &MappingWorksheet) -> Option<Mapping> {
        if worksheet.works.is_empty() || worksheet.slots.is_empty() {
            return None;
        }

        let mut ring = ConsistentHash::new();
        for slot in &worksheet.slots {
            // add() ignores repeats of the same name only via identical
            // replica points, so inserting a node twice is harmless.
            ring.add(&slot.node_name, slot.node_executors.max(1) as usize * 100);
        }
        let preference = ring.list(&task.full_display_name());

        let mut used = vec![false; worksheet.slots.len()];
        let mut assignments = Vec::with_capacity(worksheet.works.len());
        for _work in &worksheet.works {
            let slot = preference.iter().find_map(|node| {
                worksheet
                    .slots
                    .iter()
                    .enumerate()
                    .find(|(idx, s)| &s.node_name == node && !used[*idx])
                    .map(|(idx, _)| idx)
            })?;
            used[slot] = true;
            assignments.push(slot);
        }

        let mapping = Mapping { assignments };
        debug_assert!(mapping.is_valid(worksheet));
        Some(mapping)
    }
}
