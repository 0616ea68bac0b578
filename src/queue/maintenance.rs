use std::collections::HashSet;
use std::sync::Arc;

use chrono::Utc;

use crate::queue::balancer::{MappingWorksheet, WorksheetSlot};
use crate::queue::consistent_hash::ConsistentHash;
use crate::queue::item::{BlockedItem, BuildableItem, ItemView, PendingItem};
use crate::queue::offer::JobOffer;
use crate::queue::store::ItemStore;
use crate::queue::{BuildQueue, QueueState};
use crate::task::{SubTask, Task};
use crate::work::WorkUnitContext;

impl BuildQueue {
    /// One maintenance pass: unblock, drain waiting, dispatch. Caller holds
    /// the maintainer lock.
    ///
    /// The write lock is released and re-acquired between phases, so items
    /// observed early in a pass may be gone by the time they would be moved;
    /// every move therefore re-checks against the live containers.
    pub(crate) fn maintain_locked(&self) {
        tracing::trace!("queue maintenance started");
        self.unblock_phase();
        self.drain_waiting_phase();
        self.dispatch_phase();
    }

    /// Whether the item should stay out of the buildable stage.
    pub(crate) fn is_still_blocked(&self, item: &ItemView<'_>) -> bool {
        if item.task.is_build_blocked() {
            return true;
        }
        if !self.resources.can_run(&item.task.resource_list()) {
            return true;
        }
        self.hooks.can_run(item).is_some()
    }

    /// Never two buildable/pending entries for the same task unless it
    /// declares concurrent builds.
    fn allow_new_buildable(store: &ItemStore, task: &dyn Task) -> bool {
        if task.is_concurrent_build() {
            return true;
        }
        !store.buildable_contains(task) && !store.pending_contains(task)
    }

    /// Phase A: promote blocked items whose conditions cleared.
    fn unblock_phase(&self) {
        // Snapshot under the read lock; evaluate blocks without any lock.
        let blocked: Vec<(u64, Arc<dyn Task>, Vec<Arc<dyn crate::queue::actions::Action>>)> = {
            let st = self.state.read();
            st.store
                .blocked
                .iter()
                .map(|i| (i.id(), i.task().clone(), i.actions().to_vec()))
                .collect()
        };

        let mut unblocked = HashSet::new();
        for (id, task, actions) in &blocked {
            let view = ItemView {
                id: *id,
                stage: crate::queue::item::Stage::Blocked,
                task,
                actions,
            };
            if !self.is_still_blocked(&view) {
                unblocked.insert(*id);
            }
        }
        if unblocked.is_empty() {
            return;
        }

        // Re-walk the live blocked list: someone may have purged the queue
        // since the snapshot.
        let mut st = self.state.write();
        let state = &mut *st;
        let mut idx = 0;
        while idx < state.store.blocked.len() {
            let item = &state.store.blocked[idx];
            if unblocked.contains(&item.id())
                && Self::allow_new_buildable(&state.store, item.task().as_ref())
            {
                let item = state.store.blocked.remove(idx);
                tracing::debug!(
                    task = %item.task().full_display_name(),
                    id = item.id(),
                    "no longer blocked"
                );
                self.make_buildable(state, BuildableItem::from(item));
            } else {
                idx += 1;
            }
        }
    }

    /// Phase B: move due waiting items to buildable or blocked.
    fn drain_waiting_phase(&self) {
        loop {
            let top = {
                let mut st = self.state.write();
                st.store.pop_waiting_due(Utc::now())
            };
            let Some(top) = top else {
                break;
            };

            let blocked_now = self.is_still_blocked(&top.view());
            let mut st = self.state.write();
            let state = &mut *st;
            if !blocked_now && Self::allow_new_buildable(&state.store, top.task().as_ref()) {
                tracing::debug!(
                    task = %top.task().full_display_name(),
                    id = top.id(),
                    "ready to build"
                );
                self.make_buildable(state, BuildableItem::from(top));
            } else {
                tracing::debug!(
                    task = %top.task().full_display_name(),
                    id = top.id(),
                    "blocked on leaving the quiet period"
                );
                state.store.blocked.push(BlockedItem::from(top));
            }
        }
    }

    /// Phase C: offer buildable items to parked executors.
    fn dispatch_phase(&self) {
        if let Some(sorter) = self.sorter() {
            let mut st = self.state.write();
            sorter.sort(&mut st.store.buildable);
        }

        let mut st = self.state.write();
        let state = &mut *st;
        let mut idx = 0;
        while idx < state.store.buildable.len() {
            // one last check: the item may have become blocked again
            if self.is_still_blocked(&state.store.buildable[idx].view()) {
                let item = state.store.buildable.remove(idx);
                tracing::debug!(
                    task = %item.task().full_display_name(),
                    id = item.id(),
                    "buildable item became blocked again"
                );
                state.store.blocked.push(BlockedItem::from(item));
                continue;
            }

            let placement = {
                let item = &state.store.buildable[idx];
                let worksheet = self.build_worksheet(item, &state.parked);
                self.load_balancer()
                    .map(item.task(), &worksheet)
                    .filter(|m| m.is_valid(&worksheet))
                    .map(|m| (m, worksheet))
            };

            let Some((mapping, worksheet)) = placement else {
                // no executor fits; try the next buildable item
                idx += 1;
                continue;
            };

            let item = state.store.buildable.remove(idx);
            let subs = item.task().sub_tasks();
            let context = WorkUnitContext::new(
                item.id(),
                item.task().clone(),
                item.actions().to_vec(),
                item.core.promise.clone(),
            );
            mapping.execute(&worksheet, &context, &subs, &mut state.parked);
            if context.unit_count() > 0 {
                tracing::info!(
                    task = %item.task().full_display_name(),
                    id = item.id(),
                    context = %context.id(),
                    "item dispatched to executors"
                );
                state.store.pending.push(PendingItem::from(item));
            }
        }
    }

    fn build_worksheet(
        &self,
        item: &BuildableItem,
        parked: &std::collections::HashMap<u64, JobOffer>,
    ) -> MappingWorksheet {
        let view = item.view();
        let mut slots = Vec::new();
        for (executor_id, offer) in parked {
            if !self.offer_can_take(offer, &view) {
                continue;
            }
            let node_name = offer.executor().computer().node_name().to_string();
            let node_executors = self
                .fleet
                .node(&node_name)
                .map(|n| n.num_executors)
                .unwrap_or(1);
            slots.push(WorksheetSlot {
                executor_id: *executor_id,
                node_name,
                node_executors,
            });
        }

        let mut works = vec![item.task().display_name()];
        works.extend(item.task().sub_tasks().iter().map(|s| s.display_name()));

        MappingWorksheet {
            item_id: item.id(),
            task: item.task().clone(),
            assigned_label: item.assigned_label(),
            works,
            slots,
        }
    }

    /// Whether the parked offer's executor is capable of running the item.
    pub(crate) fn offer_can_take(&self, offer: &JobOffer, item: &ItemView<'_>) -> bool {
        let computer = offer.executor().computer();
        let Some(node) = self.fleet.node(computer.node_name()) else {
            // the node left the fleet while its executor was parked
            return false;
        };
        if node.can_take(item).is_some() {
            return false;
        }
        if self.hooks.can_take(&node, item).is_some() {
            return false;
        }
        offer.is_idle() && computer.is_online() && computer.is_accepting_tasks()
    }

    /// Insert into buildable, or place a flyweight task directly on a node.
    ///
    /// Flyweight tasks walk a consistent-hash ring over the fleet so repeat
    /// builds stick to the same node while the fleet is stable; if no node
    /// accepts, the task queues like any other.
    pub(crate) fn make_buildable(&self, state: &mut QueueState, item: BuildableItem) {
        let task = item.task().clone();
        let shutdown_blocked = self.fleet.is_quiescing() && !task.is_non_blocking();
        if task.is_flyweight() && !shutdown_blocked {
            let mut ring = ConsistentHash::new();
            for node in self.fleet.nodes() {
                ring.add(&node.name, node.num_executors.max(1) as usize * 100);
            }

            let label = item.assigned_label();
            for name in ring.list(&task.full_display_name()) {
                let Some(node) = self.fleet.node(&name) else {
                    continue;
                };
                let Some(computer) = self.fleet.computer(&name) else {
                    continue;
                };
                if !computer.is_online() {
                    continue;
                }
                if let Some(label) = &label {
                    if !label.matches(&node) {
                        continue;
                    }
                }
                if node.can_take(&item.view()).is_some() {
                    continue;
                }

                let context = WorkUnitContext::new(
                    item.id(),
                    task.clone(),
                    item.actions().to_vec(),
                    item.core.promise.clone(),
                );
                computer.start_flyweight(context.create_main_work_unit());
                tracing::info!(
                    task = %task.full_display_name(),
                    id = item.id(),
                    node = %name,
                    "flyweight task placed"
                );
                state.store.pending.push(PendingItem::from(item));
                return;
            }
            // nowhere to place it right now; queue it like a normal task
        }

        state.store.buildable.push(item);
    }
}
