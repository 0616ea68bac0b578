//! The build queue scheduler.
//!
//! Submissions enter through [`BuildQueue::schedule`] and move through four
//! stages: waiting (quiet period), blocked, buildable, and pending. A
//! periodic timer and event triggers drive [`BuildQueue::maintain`], which
//! migrates items between stages and assigns buildable items to parked
//! executors; executors fetch their work through [`BuildQueue::pop`].

pub mod actions;
pub mod balancer;
pub mod hooks;
pub mod item;
pub mod persist;

mod consistent_hash;
mod maintenance;
mod offer;
mod store;

use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use parking_lot::RwLock;
use tokio::sync::Mutex;

use crate::config::QueueConfig;
use crate::error::{ConveyorError, Result};
use crate::fleet::{Computer, Executor, ExecutorKind, Fleet, Label};
use crate::resource::ResourceController;
use crate::task::{CauseOfBlockage, SubTask, Task};
use crate::work::WorkUnit;

use actions::Action;
use balancer::{ConsistentHashBalancer, LoadBalancer};
use hooks::{HookRegistry, QueueDecisionHandler, QueueSorter, QueueTaskDispatcher};
use item::{BuildableItem, CompletionState, IdAllocator, ItemSnapshot, Stage, WaitingItem};
use offer::JobOffer;
use persist::TaskResolver;
use store::ItemStore;

/// Everything guarded by the queue's fair reader-writer lock: the four
/// stage containers and the parked-executor map.
pub(crate) struct QueueState {
    pub(crate) store: ItemStore,
    pub(crate) parked: HashMap<u64, JobOffer>,
}

/// Bounded-staleness copy of the items view for UI consumers.
struct CachedItems {
    view: RwLock<Arc<Vec<ItemSnapshot>>>,
    expires_at_ms: AtomicI64,
}

/// The scheduler. One instance per controller; collaborators receive it
/// explicitly as `Arc<BuildQueue>`.
pub struct BuildQueue {
    config: QueueConfig,
    fleet: Arc<Fleet>,
    resources: Arc<ResourceController>,
    resolver: Arc<dyn TaskResolver>,
    pub(crate) state: RwLock<QueueState>,
    /// Serializes `maintain` and the non-waiting sections of `pop`.
    maintainer: Mutex<()>,
    ids: IdAllocator,
    pub(crate) hooks: HookRegistry,
    sorter: RwLock<Option<Arc<dyn QueueSorter>>>,
    balancer: RwLock<Arc<dyn LoadBalancer>>,
    cache: CachedItems,
}

impl BuildQueue {
    pub fn new(
        config: QueueConfig,
        fleet: Arc<Fleet>,
        resources: Arc<ResourceController>,
        resolver: Arc<dyn TaskResolver>,
    ) -> Arc<Self> {
        let queue = Arc::new(Self {
            config,
            fleet,
            resources,
            resolver,
            state: RwLock::new(QueueState {
                store: ItemStore::default(),
                parked: HashMap::new(),
            }),
            maintainer: Mutex::new(()),
            ids: IdAllocator::new(),
            hooks: HookRegistry::default(),
            sorter: RwLock::new(None),
            balancer: RwLock::new(Arc::new(ConsistentHashBalancer)),
            cache: CachedItems {
                view: RwLock::new(Arc::new(Vec::new())),
                expires_at_ms: AtomicI64::new(0),
            },
        });
        Self::spawn_maintenance_timer(&queue);
        queue
    }

    pub fn fleet(&self) -> &Arc<Fleet> {
        &self.fleet
    }

    pub fn resources(&self) -> &Arc<ResourceController> {
        &self.resources
    }

    pub(crate) fn resolver(&self) -> &Arc<dyn TaskResolver> {
        &self.resolver
    }

    pub(crate) fn config(&self) -> &QueueConfig {
        &self.config
    }

    /// If all the executors are busy none of them triggers maintenance via
    /// `pop`, so a timer keeps the queue moving. It holds only a weak
    /// reference and cancels itself once the queue is dropped.
    fn spawn_maintenance_timer(queue: &Arc<Self>) {
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            tracing::debug!("no tokio runtime at construction; periodic maintenance disabled");
            return;
        };
        let weak = Arc::downgrade(queue);
        let period = queue.config.maintenance_interval;
        handle.spawn(async move {
            let start = tokio::time::Instant::now() + period;
            let mut tick = tokio::time::interval_at(start, period);
            loop {
                tick.tick().await;
                match weak.upgrade() {
                    Some(queue) => queue.maintain().await,
                    None => break,
                }
            }
        });
    }

    // ---- strategies & extension registries ----

    pub fn load_balancer(&self) -> Arc<dyn LoadBalancer> {
        self.balancer.read().clone()
    }

    pub fn set_load_balancer(&self, balancer: Arc<dyn LoadBalancer>) {
        *self.balancer.write() = balancer;
    }

    pub fn sorter(&self) -> Option<Arc<dyn QueueSorter>> {
        self.sorter.read().clone()
    }

    pub fn set_sorter(&self, sorter: Option<Arc<dyn QueueSorter>>) {
        *self.sorter.write() = sorter;
    }

    pub fn register_decision_handler(&self, handler: Arc<dyn QueueDecisionHandler>) {
        self.hooks.decision_handlers.write().push(handler);
    }

    pub fn register_dispatcher(&self, dispatcher: Arc<dyn QueueTaskDispatcher>) {
        self.hooks.dispatchers.write().push(dispatcher);
    }

    // ---- admission ----

    /// Schedule an execution of a task after the given quiet period.
    ///
    /// Returns `None` when a decision handler vetoed the submission or the
    /// task was already queued and the new request folded into the existing
    /// item. Invalid (negative) quiet periods clamp to zero.
    pub fn schedule(
        &self,
        task: Arc<dyn Task>,
        quiet_period_secs: i64,
        actions: Vec<Arc<dyn Action>>,
    ) -> Option<ItemSnapshot> {
        if !self.hooks.should_schedule(&task, &actions) {
            tracing::debug!(task = %task.full_display_name(), "submission vetoed");
            return None;
        }

        let due = Utc::now() + chrono::Duration::seconds(quiet_period_secs.max(0));
        let mut added = None;
        let mut updated = false;
        {
            let mut st = self.state.write();
            let duplicates = Self::find_duplicates(&st.store, task.as_ref(), &actions);

            if duplicates.is_empty() {
                let id = self.ids.next();
                let item = WaitingItem::new(id, task.clone(), actions, due);
                tracing::info!(task = %task.full_display_name(), id, "task added to queue");
                added = Some(item.snapshot());
                st.store.insert_waiting(item);
            } else {
                tracing::debug!(task = %task.full_display_name(), "task is already in the queue");
                for (stage, id) in &duplicates {
                    Self::fold_into(&mut st.store, *stage, *id, &task, &actions);
                }
                for (stage, id) in &duplicates {
                    if *stage != Stage::Waiting {
                        continue;
                    }
                    let Some(current) = st
                        .store
                        .waiting
                        .values()
                        .find(|i| i.id() == *id)
                        .map(|i| i.due_at())
                    else {
                        continue;
                    };
                    if quiet_period_secs <= 0 {
                        // the caller wants the build now: pull the
                        // timestamp in, but never push it back
                        if due >= current {
                            continue;
                        }
                    } else {
                        // quiet period reset: start the period over
                        if due <= current {
                            continue;
                        }
                    }
                    updated |= st.store.reset_waiting_due(*id, due);
                }
            }
        }
        if added.is_some() || updated {
            self.schedule_maintenance();
        }
        added
    }

    /// Items whose queue actions (on either side) do not insist on a
    /// separate execution.
    fn find_duplicates(
        store: &ItemStore,
        task: &dyn Task,
        new_actions: &[Arc<dyn Action>],
    ) -> Vec<(Stage, u64)> {
        let mut duplicates = Vec::new();
        let mut consider = |stage: Stage, id: u64, existing: &[Arc<dyn Action>]| {
            let mut separate = false;
            for action in existing {
                if let Some(qa) = action.as_queue_action() {
                    separate |= qa.should_schedule(new_actions);
                }
            }
            for action in new_actions {
                if let Some(qa) = action.as_queue_action() {
                    separate |= qa.should_schedule(existing);
                }
            }
            if !separate {
                duplicates.push((stage, id));
            }
        };

        for i in store.blocked.iter().filter(|i| i.task().same_task(task)) {
            consider(Stage::Blocked, i.id(), i.actions());
        }
        for i in store.buildable.iter().filter(|i| i.task().same_task(task)) {
            consider(Stage::Buildable, i.id(), i.actions());
        }
        for i in store.pending.iter().filter(|i| i.task().same_task(task)) {
            consider(Stage::Pending, i.id(), i.actions());
        }
        for i in store.waiting.values().filter(|i| i.task().same_task(task)) {
            consider(Stage::Waiting, i.id(), i.actions());
        }
        duplicates
    }

    fn fold_into(
        store: &mut ItemStore,
        stage: Stage,
        id: u64,
        task: &Arc<dyn Task>,
        new_actions: &[Arc<dyn Action>],
    ) {
        let actions = match stage {
            Stage::Waiting => store
                .waiting
                .values_mut()
                .find(|i| i.id() == id)
                .map(|i| &mut i.core.actions),
            Stage::Blocked => store
                .blocked
                .iter_mut()
                .find(|i| i.id() == id)
                .map(|i| &mut i.core.actions),
            Stage::Buildable => store
                .buildable
                .iter_mut()
                .find(|i| i.id() == id)
                .map(|i| &mut i.core.actions),
            Stage::Pending => store
                .pending
                .iter_mut()
                .find(|i| i.id() == id)
                .map(|i| &mut i.core.actions),
        };
        let Some(actions) = actions else {
            return;
        };
        let mut target = actions::FoldTarget {
            id,
            stage,
            actions,
        };
        for action in new_actions {
            if let Some(foldable) = action.as_foldable() {
                foldable.fold_into_existing(&mut target, task, new_actions);
            }
        }
    }

    // ---- cancellation ----

    /// Cancel the first queued occurrence of the task, searching waiting,
    /// blocked, and buildable in that order. Pending items are already
    /// dispatched and stay untouched.
    pub fn cancel_task(&self, task: &dyn Task) -> bool {
        let mut st = self.state.write();
        let waiting_id = st.store.first_waiting_for(task).map(|i| i.id());
        if let Some(item) = waiting_id.and_then(|id| st.store.remove_waiting_by_id(id)) {
            item.core.on_cancelled();
            return true;
        }
        if let Some(item) = st.store.remove_blocked_by_task(task) {
            item.core.on_cancelled();
            return true;
        }
        if let Some(item) = st.store.remove_buildable_by_task(task) {
            item.core.on_cancelled();
            return true;
        }
        false
    }

    /// Cancel a specific item by id. Returns false for unknown ids and for
    /// items already handed to an executor.
    pub fn cancel_item(&self, id: u64) -> bool {
        let mut st = self.state.write();
        if let Some(item) = st.store.remove_waiting_by_id(id) {
            item.core.on_cancelled();
            return true;
        }
        if let Some(item) = st.store.remove_blocked_by_id(id) {
            item.core.on_cancelled();
            return true;
        }
        if let Some(item) = st.store.remove_buildable_by_id(id) {
            item.core.on_cancelled();
            return true;
        }
        false
    }

    /// Cancel everything in waiting, blocked, and buildable at once.
    pub fn clear(&self) {
        {
            let mut st = self.state.write();
            let waiting = std::mem::take(&mut st.store.waiting);
            for item in waiting.into_values() {
                item.core.on_cancelled();
            }
            for item in st.store.blocked.drain(..) {
                item.core.on_cancelled();
            }
            for item in st.store.buildable.drain(..) {
                item.core.on_cancelled();
            }
        }
        tracing::info!("queue cleared");
        self.schedule_maintenance();
    }

    // ---- queries ----

    pub fn is_empty(&self) -> bool {
        self.state.read().store.is_empty()
    }

    pub fn contains(&self, task: &dyn Task) -> bool {
        self.state.read().store.contains(task)
    }

    pub fn is_pending(&self, task: &dyn Task) -> bool {
        self.state.read().store.pending_contains(task)
    }

    /// Snapshot of every queued item, in the order used for persistence.
    pub fn items(&self) -> Vec<ItemSnapshot> {
        self.state.read().store.snapshots()
    }

    pub fn items_for(&self, task: &dyn Task) -> Vec<ItemSnapshot> {
        self.state.read().store.snapshots_for(task)
    }

    pub fn item_by_id(&self, id: u64) -> Option<ItemSnapshot> {
        self.state.read().store.snapshot_by_id(id)
    }

    /// The queue item for the task, preferring the stage closest to
    /// execution.
    pub fn item_for(&self, task: &dyn Task) -> Option<ItemSnapshot> {
        let st = self.state.read();
        if let Some(i) = st.store.blocked.iter().find(|i| i.task().same_task(task)) {
            return Some(i.snapshot());
        }
        if let Some(i) = st.store.buildable.iter().find(|i| i.task().same_task(task)) {
            return Some(i.snapshot());
        }
        if let Some(i) = st.store.pending.iter().find(|i| i.task().same_task(task)) {
            return Some(i.snapshot());
        }
        st.store.first_waiting_for(task).map(|i| i.snapshot())
    }

    /// Buildable plus pending items.
    pub fn buildable_items(&self) -> Vec<ItemSnapshot> {
        let st = self.state.read();
        let mut out: Vec<ItemSnapshot> =
            st.store.buildable.iter().map(BuildableItem::snapshot).collect();
        out.extend(st.store.pending.iter().map(item::PendingItem::snapshot));
        out
    }

    /// Buildable and pending items the given computer's node could run.
    pub fn buildable_items_for_computer(&self, computer: &Computer) -> Vec<ItemSnapshot> {
        let Some(node) = self.fleet.node(computer.node_name()) else {
            return Vec::new();
        };
        let st = self.state.read();
        let mut out = Vec::new();
        for i in &st.store.buildable {
            if node.can_take(&i.view()).is_none() {
                out.push(i.snapshot());
            }
        }
        for i in &st.store.pending {
            if node.can_take(&i.view()).is_none() {
                out.push(i.snapshot());
            }
        }
        out
    }

    pub fn pending_items(&self) -> Vec<ItemSnapshot> {
        let st = self.state.read();
        st.store.pending.iter().map(item::PendingItem::snapshot).collect()
    }

    /// All queued items that are not blocked.
    pub fn unblocked_items(&self) -> Vec<ItemSnapshot> {
        let st = self.state.read();
        let mut out: Vec<ItemSnapshot> =
            st.store.waiting.values().map(WaitingItem::snapshot).collect();
        out.extend(st.store.buildable.iter().map(BuildableItem::snapshot));
        out.extend(st.store.pending.iter().map(item::PendingItem::snapshot));
        out
    }

    pub fn unblocked_tasks(&self) -> Vec<Arc<dyn Task>> {
        self.state.read().store.unblocked_tasks()
    }

    pub fn count_buildable_items(&self) -> usize {
        let st = self.state.read();
        st.store.buildable.len() + st.store.pending.len()
    }

    pub fn count_buildable_items_for(&self, label: &Label) -> usize {
        let st = self.state.read();
        st.store
            .buildable
            .iter()
            .filter(|i| i.assigned_label().as_ref() == Some(label))
            .count()
            + st.store
                .pending
                .iter()
                .filter(|i| i.snapshot().assigned_label().as_ref() == Some(label))
                .count()
    }

    /// Why the item cannot proceed right now, if it is queued and blocked
    /// on something.
    pub fn cause_of_blockage(&self, id: u64) -> Option<CauseOfBlockage> {
        let snapshot = self.item_by_id(id)?;
        match snapshot.stage {
            Stage::Waiting => {
                let remaining_ms =
                    (snapshot.due_at? - Utc::now()).num_milliseconds().max(0);
                Some(CauseOfBlockage::InQuietPeriod { remaining_ms })
            }
            Stage::Blocked => {
                let st = self.state.read();
                let task = &snapshot.task;
                if !task.is_concurrent_build()
                    && (st.store.buildable_contains(task.as_ref())
                        || st.store.pending_contains(task.as_ref()))
                {
                    return Some(CauseOfBlockage::AnotherBuildInProgress);
                }
                drop(st);
                if let Some(resource) =
                    self.resources.blocking_resource(&task.resource_list())
                {
                    return Some(CauseOfBlockage::ResourceInUse { resource });
                }
                let view = item::ItemView {
                    id: snapshot.id,
                    stage: Stage::Blocked,
                    task,
                    actions: &snapshot.actions,
                };
                if let Some(cause) = self.hooks.can_run(&view) {
                    return Some(cause);
                }
                task.cause_of_blockage()
            }
            Stage::Buildable | Stage::Pending => {
                if self.fleet.is_quiescing() && !snapshot.task.is_non_blocking() {
                    return Some(CauseOfBlockage::ShuttingDown);
                }
                if let Some(label) = snapshot.assigned_label() {
                    if !self.fleet.label_has_online_node(&label) {
                        return Some(CauseOfBlockage::LabelOffline { label });
                    }
                }
                Some(CauseOfBlockage::WaitingForExecutor)
            }
        }
    }

    /// Whether a buildable item has been starving for an executor for so
    /// long that something is probably wrong.
    pub fn is_stuck(&self, id: u64) -> bool {
        let Some(snapshot) = self.item_by_id(id) else {
            return false;
        };
        if snapshot.stage != Stage::Buildable {
            return false;
        }
        if let Some(label) = snapshot.assigned_label() {
            if !self.fleet.label_has_online_node(&label) {
                return true;
            }
        }
        let Some(entered) = snapshot.entered_non_waiting_at else {
            return false;
        };
        let elapsed = (Utc::now() - entered)
            .to_std()
            .unwrap_or(Duration::ZERO);
        match snapshot.task.estimated_duration() {
            Some(estimate) => elapsed > estimate.max(Duration::from_secs(60)) * 10,
            None => elapsed > Duration::from_secs(24 * 60 * 60),
        }
    }

    /// The cached items view, at most roughly one second stale. Concurrent
    /// callers during a refresh may still read the previous copy.
    pub fn approximate_items(&self) -> Arc<Vec<ItemSnapshot>> {
        let now = Utc::now().timestamp_millis();
        let expiry = self.cache.expires_at_ms.load(Ordering::Acquire);
        if now > expiry {
            let ttl = self.config.snapshot_ttl.as_millis() as i64;
            if self
                .cache
                .expires_at_ms
                .compare_exchange(expiry, now + ttl, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                *self.cache.view.write() = Arc::new(self.items());
            }
        }
        self.cache.view.read().clone()
    }

    // ---- maintenance triggers ----

    /// Wake one parked idle executor; it will re-enter `pop` and run a
    /// maintenance pass on its own thread.
    pub fn schedule_maintenance(&self) {
        let wake = {
            let st = self.state.read();
            st.parked
                .values()
                .find(|offer| offer.is_idle())
                .map(JobOffer::wake_handle)
        };
        if let Some(wake) = wake {
            wake.notify_one();
        }
    }

    /// Run one maintenance pass. Serialized: concurrent callers queue up
    /// behind the maintainer lock.
    pub async fn maintain(&self) {
        let _serial = self.maintainer.lock().await;
        self.maintain_locked();
    }

    // ---- executor parking ----

    /// Called by an executor to fetch its next work unit, parking until the
    /// assignment engine hands it one.
    ///
    /// One-off executors with a preassigned unit return immediately; their
    /// pickup retires the matching pending item. If the calling future is
    /// dropped while an assignment is in hand, the work unit context is
    /// aborted and another maintenance pass is scheduled so a different
    /// executor takes over.
    pub async fn pop(&self, executor: &Arc<Executor>) -> Result<Arc<WorkUnit>> {
        if executor.kind() == ExecutorKind::OneOff {
            let unit = executor.take_preassigned().ok_or_else(|| {
                ConveyorError::Internal(format!(
                    "one-off executor {} has no preassigned work unit",
                    executor.id()
                ))
            })?;
            let mut st = self.state.write();
            st.store.remove_pending_by_id(unit.context().item_id());
            return Ok(unit);
        }

        loop {
            let wake;
            let park_for;
            {
                let _serial = self.maintainer.lock().await;
                {
                    let mut st = self.state.write();
                    if st.parked.contains_key(&executor.id()) {
                        return Err(ConveyorError::AlreadyParked(executor.id()));
                    }
                    let offer = JobOffer::new(executor.clone());
                    wake = offer.wake_handle();
                    st.parked.insert(executor.id(), offer);
                }

                // reuse this executor's task to make progress
                self.maintain_locked();

                park_for = {
                    let st = self.state.read();
                    st.store.peek_waiting().map(|w| {
                        let remaining = (w.due_at() - Utc::now()).num_milliseconds();
                        let floor = self.config.min_park.as_millis() as i64;
                        Duration::from_millis(remaining.max(floor) as u64)
                    })
                };
            }

            let mut guard = ParkGuard {
                queue: self,
                executor_id: executor.id(),
                armed: true,
            };

            match park_for {
                // wait until the first waiting item is due
                Some(duration) => {
                    let _ = tokio::time::timeout(duration, wake.notified()).await;
                }
                None => wake.notified().await,
            }

            let _serial = self.maintainer.lock().await;
            let unit = {
                let mut st = self.state.write();
                let unit = st
                    .parked
                    .remove(&executor.id())
                    .and_then(JobOffer::into_work_unit);
                if let Some(unit) = &unit {
                    if unit.is_main() {
                        st.store.remove_pending_by_id(unit.context().item_id());
                    }
                }
                unit
            };
            guard.armed = false;

            if let Some(unit) = unit {
                tracing::debug!(
                    executor = executor.id(),
                    unit = %unit.display_name(),
                    "pop returning work unit"
                );
                return Ok(unit);
            }
            // woken without an assignment: run another maintenance pass
        }
    }

    // ---- persistence entry points (bodies in persist.rs) ----

    /// Await the resolution of an item's completion future.
    pub async fn wait_for(&self, id: u64) -> Option<CompletionState> {
        let mut future = self.item_by_id(id)?.future;
        Some(future.resolved().await)
    }
}

/// Cleans up after a `pop` future dropped mid-park: the offer is retracted,
/// an already-assigned work unit is aborted, and another executor is poked
/// to take over the maintenance duty this one may have been chosen for.
struct ParkGuard<'a> {
    queue: &'a BuildQueue,
    executor_id: u64,
    armed: bool,
}

impl Drop for ParkGuard<'_> {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        let abandoned = {
            let mut st = self.queue.state.write();
            let unit = st
                .parked
                .remove(&self.executor_id)
                .and_then(JobOffer::into_work_unit);
            if let Some(unit) = &unit {
                st.store.remove_pending_by_id(unit.context().item_id());
            }
            unit
        };
        if let Some(unit) = abandoned {
            unit.context().abort();
        }
        self.queue.schedule_maintenance();
    }
}

#[cfg(test)]
pub(crate) mod tests_support {
    use std::sync::Arc;

    use crate::task::{Executable, SubTask, Task};

    struct NoopExecutable;

    impl Executable for NoopExecutable {
        fn run(&self) {}
    }

    struct NoopTask {
        name: String,
    }

    impl SubTask for NoopTask {
        fn display_name(&self) -> String {
            self.name.clone()
        }

        fn create_executable(&self) -> Arc<dyn Executable> {
            Arc::new(NoopExecutable)
        }
    }

    impl Task for NoopTask {
        fn full_display_name(&self) -> String {
            self.name.clone()
        }
    }

    pub(crate) fn noop_task(name: &str) -> Arc<dyn Task> {
        Arc::new(NoopTask {
            name: name.to_string(),
        })
    }
}
