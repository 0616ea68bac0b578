use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};

use crate::queue::item::{
    BlockedItem, BuildableItem, ItemSnapshot, PendingItem, WaitingItem,
};
use crate::task::Task;

/// The four stage containers.
///
/// The waiting set is keyed by `(due_at, id)` so iteration order is the
/// eligibility order; a timestamp mutation therefore re-inserts the entry.
/// The other stages are plain vectors with linear by-task lookup, preserving
/// insertion order for the sorter and the dispatch loop.
#[derive(Default)]
pub(crate) struct ItemStore {
    pub(crate) waiting: BTreeMap<(DateTime<Utc>, u64), WaitingItem>,
    pub(crate) blocked: Vec<BlockedItem>,
    pub(crate) buildable: Vec<BuildableItem>,
    pub(crate) pending: Vec<PendingItem>,
}

impl ItemStore {
    pub fn insert_waiting(&mut self, item: WaitingItem) {
        self.waiting.insert((item.due_at(), item.id()), item);
    }

    pub fn peek_waiting(&self) -> Option<&WaitingItem> {
        self.waiting.values().next()
    }

    /// Remove and return the smallest waiting item if it is due.
    pub fn pop_waiting_due(&mut self, now: DateTime<Utc>) -> Option<WaitingItem> {
        let key = {
            let (key, item) = self.waiting.iter().next()?;
            if item.due_at() > now {
                return None;
            }
            *key
        };
        self.waiting.remove(&key)
    }

    /// Move a waiting item to a new due time, keeping the set sorted.
    pub fn reset_waiting_due(&mut self, id: u64, due_at: DateTime<Utc>) -> bool {
        let Some(key) = self
            .waiting
            .iter()
            .find(|(_, item)| item.id() == id)
            .map(|(key, _)| *key)
        else {
            return false;
        };
        let Some(mut item) = self.waiting.remove(&key) else {
            return false;
        };
        item.due_at = due_at;
        self.insert_waiting(item);
        true
    }

    pub fn remove_waiting_by_id(&mut self, id: u64) -> Option<WaitingItem> {
        let key = self
            .waiting
            .iter()
            .find(|(_, item)| item.id() == id)
            .map(|(key, _)| *key)?;
        self.waiting.remove(&key)
    }

    /// First waiting item for the task, in eligibility order.
    pub fn first_waiting_for(&self, task: &dyn Task) -> Option<&WaitingItem> {
        self.waiting.values().find(|i| i.task().same_task(task))
    }

    pub fn remove_blocked_by_id(&mut self, id: u64) -> Option<BlockedItem> {
        let idx = self.blocked.iter().position(|i| i.id() == id)?;
        Some(self.blocked.remove(idx))
    }

    pub fn remove_blocked_by_task(&mut self, task: &dyn Task) -> Option<BlockedItem> {
        let idx = self.blocked.iter().position(|i| i.task().same_task(task))?;
        Some(self.blocked.remove(idx))
    }

    pub fn remove_buildable_by_id(&mut self, id: u64) -> Option<BuildableItem> {
        let idx = self.buildable.iter().position(|i| i.id() == id)?;
        Some(self.buildable.remove(idx))
    }

    pub fn remove_buildable_by_task(&mut self, task: &dyn Task) -> Option<BuildableItem> {
        let idx = self
            .buildable
            .iter()
            .position(|i| i.task().same_task(task))?;
        Some(self.buildable.remove(idx))
    }

    pub fn remove_pending_by_id(&mut self, id: u64) -> Option<PendingItem> {
        let idx = self.pending.iter().position(|i| i.id() == id)?;
        Some(self.pending.remove(idx))
    }

    pub fn buildable_contains(&self, task: &dyn Task) -> bool {
        self.buildable.iter().any(|i| i.task().same_task(task))
    }

    pub fn pending_contains(&self, task: &dyn Task) -> bool {
        self.pending.iter().any(|i| i.task().same_task(task))
    }

    pub fn contains(&self, task: &dyn Task) -> bool {
        self.blocked.iter().any(|i| i.task().same_task(task))
            || self.buildable_contains(task)
            || self.pending_contains(task)
            || self.waiting.values().any(|i| i.task().same_task(task))
    }

    pub fn is_empty(&self) -> bool {
        self.waiting.is_empty()
            && self.blocked.is_empty()
            && self.buildable.is_empty()
            && self.pending.is_empty()
    }

    /// Snapshot of every item: waiting in eligibility order, then blocked,
    /// then buildable and pending with the soonest-to-build entries last.
    pub fn snapshots(&self) -> Vec<ItemSnapshot> {
        let mut out = Vec::with_capacity(
            self.waiting.len() + self.blocked.len() + self.buildable.len() + self.pending.len(),
        );
        out.extend(self.waiting.values().map(WaitingItem::snapshot));
        out.extend(self.blocked.iter().map(BlockedItem::snapshot));
        out.extend(self.buildable.iter().rev().map(BuildableItem::snapshot));
        out.extend(self.pending.iter().rev().map(PendingItem::snapshot));
        out
    }

    /// All items for the task: blocked, buildable, pending, then waiting.
    pub fn snapshots_for(&self, task: &dyn Task) -> Vec<ItemSnapshot> {
        let mut out = Vec::new();
        out.extend(
            self.blocked
                .iter()
                .filter(|i| i.task().same_task(task))
                .map(BlockedItem::snapshot),
        );
        out.extend(
            self.buildable
                .iter()
                .filter(|i| i.task().same_task(task))
                .map(BuildableItem::snapshot),
        );
        out.extend(
            self.pending
                .iter()
                .filter(|i| i.task().same_task(task))
                .map(PendingItem::snapshot),
        );
        out.extend(
            self.waiting
                .values()
                .filter(|i| i.task().same_task(task))
                .map(WaitingItem::snapshot),
        );
        out
    }

    pub fn snapshot_by_id(&self, id: u64) -> Option<ItemSnapshot> {
        if let Some(i) = self.waiting.values().find(|i| i.id() == id) {
            return Some(i.snapshot());
        }
        if let Some(i) = self.blocked.iter().find(|i| i.id() == id) {
            return Some(i.snapshot());
        }
        if let Some(i) = self.buildable.iter().find(|i| i.id() == id) {
            return Some(i.snapshot());
        }
        self.pending
            .iter()
            .find(|i| i.id() == id)
            .map(PendingItem::snapshot)
    }

    pub fn unblocked_tasks(&self) -> Vec<Arc<dyn Task>> {
        let mut out: Vec<Arc<dyn Task>> = Vec::new();
        let mut push = |task: &Arc<dyn Task>| {
            if !out.iter().any(|t| t.same_task(task.as_ref())) {
                out.push(task.clone());
            }
        };
        for i in self.waiting.values() {
            push(i.task());
        }
        for i in &self.buildable {
            push(i.task());
        }
        for i in &self.pending {
            push(i.task());
        }
        out
    }
}
