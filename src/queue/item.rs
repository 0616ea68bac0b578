use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::sync::watch;

use crate::fleet::Label;
use crate::queue::actions::Action;
use crate::task::{SubTask, Task};

/// Allocates process-unique, monotonically increasing item ids. The same id
/// follows a request through every stage of the queue.
#[derive(Debug, Default)]
pub struct IdAllocator(AtomicU64);

impl IdAllocator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn next(&self) -> u64 {
        self.0.fetch_add(1, Ordering::SeqCst) + 1
    }

    /// Raise the allocator so future ids stay above everything restored
    /// from disk.
    pub fn prime(&self, floor: u64) {
        self.0.fetch_max(floor, Ordering::SeqCst);
    }
}

/// Terminal (or not-yet-terminal) state of a queue item's future.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompletionState {
    Pending,
    /// The item was cancelled while still queued.
    Cancelled,
    /// An executor picked the work up and the build began.
    Started,
}

/// Write half of an item's completion future. Resolves at most once.
#[derive(Clone)]
pub struct CompletionPromise {
    tx: Arc<watch::Sender<CompletionState>>,
}

impl CompletionPromise {
    pub(crate) fn pair() -> (Self, CompletionFuture) {
        let (tx, rx) = watch::channel(CompletionState::Pending);
        (Self { tx: Arc::new(tx) }, CompletionFuture { rx })
    }

    fn resolve(&self, state: CompletionState) {
        self.tx.send_if_modified(|current| {
            if *current == CompletionState::Pending {
                *current = state;
                true
            } else {
                false
            }
        });
    }

    pub(crate) fn cancel(&self) {
        self.resolve(CompletionState::Cancelled);
    }

    pub(crate) fn start(&self) {
        self.resolve(CompletionState::Started);
    }

    pub fn subscribe(&self) -> CompletionFuture {
        CompletionFuture {
            rx: self.tx.subscribe(),
        }
    }
}

/// Read half of an item's completion future. Cloneable; every clone
/// observes the single resolution.
#[derive(Clone)]
pub struct CompletionFuture {
    rx: watch::Receiver<CompletionState>,
}

impl CompletionFuture {
    pub fn current(&self) -> CompletionState {
        *self.rx.borrow()
    }

    /// Wait until the item is cancelled or its build starts.
    pub async fn resolved(&mut self) -> CompletionState {
        match self.rx.wait_for(|s| *s != CompletionState::Pending).await {
            Ok(state) => *state,
            // Writer gone without resolving: the queue was torn down.
            Err(_) => CompletionState::Cancelled,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Waiting,
    Blocked,
    Buildable,
    Pending,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Stage::Waiting => f.write_str("waiting"),
            Stage::Blocked => f.write_str("blocked"),
            Stage::Buildable => f.write_str("buildable"),
            Stage::Pending => f.write_str("pending"),
        }
    }
}

/// The item's assigned label: `LabelAssignmentAction`s take precedence over
/// the task's own label.
pub(crate) fn assigned_label_of(task: &Arc<dyn Task>, actions: &[Arc<dyn Action>]) -> Option<Label> {
    for action in actions {
        if let Some(laa) = action.as_label_assignment() {
            if let Some(label) = laa.assigned_label(task) {
                return Some(label);
            }
        }
    }
    task.assigned_label()
}

/// Borrowed, stage-agnostic view of an item, handed to extension points.
#[derive(Clone, Copy)]
pub struct ItemView<'a> {
    pub id: u64,
    pub stage: Stage,
    pub task: &'a Arc<dyn Task>,
    pub actions: &'a [Arc<dyn Action>],
}

impl ItemView<'_> {
    pub fn assigned_label(&self) -> Option<Label> {
        assigned_label_of(self.task, self.actions)
    }
}

/// Owned copy of an item at some observation point. What all read-side
/// queries return; mutating it does not touch the queue.
#[derive(Clone)]
pub struct ItemSnapshot {
    pub id: u64,
    pub stage: Stage,
    pub task: Arc<dyn Task>,
    pub actions: Vec<Arc<dyn Action>>,
    pub in_queue_since: DateTime<Utc>,
    /// Waiting items only: earliest instant the item may leave the stage.
    pub due_at: Option<DateTime<Utc>>,
    /// Blocked/buildable/pending items only.
    pub entered_non_waiting_at: Option<DateTime<Utc>>,
    pub future: CompletionFuture,
}

impl ItemSnapshot {
    pub fn assigned_label(&self) -> Option<Label> {
        assigned_label_of(&self.task, &self.actions)
    }
}

/// Payload shared by every stage; survives stage transitions unchanged.
pub(crate) struct ItemCore {
    pub(crate) id: u64,
    pub(crate) task: Arc<dyn Task>,
    pub(crate) actions: Vec<Arc<dyn Action>>,
    pub(crate) in_queue_since: DateTime<Utc>,
    pub(crate) promise: CompletionPromise,
}

impl ItemCore {
    fn new(id: u64, task: Arc<dyn Task>, actions: Vec<Arc<dyn Action>>) -> Self {
        Self::restored(id, task, actions, Utc::now())
    }

    fn restored(
        id: u64,
        task: Arc<dyn Task>,
        actions: Vec<Arc<dyn Action>>,
        in_queue_since: DateTime<Utc>,
    ) -> Self {
        let (promise, _) = CompletionPromise::pair();
        Self {
            id,
            task,
            actions,
            in_queue_since,
            promise,
        }
    }

    pub(crate) fn on_cancelled(&self) {
        tracing::debug!(id = self.id, task = %self.task.full_display_name(), "item cancelled");
        self.promise.cancel();
    }

    fn snapshot(
        &self,
        stage: Stage,
        due_at: Option<DateTime<Utc>>,
        entered_non_waiting_at: Option<DateTime<Utc>>,
    ) -> ItemSnapshot {
        ItemSnapshot {
            id: self.id,
            stage,
            task: self.task.clone(),
            actions: self.actions.clone(),
            in_queue_since: self.in_queue_since,
            due_at,
            entered_non_waiting_at,
            future: self.promise.subscribe(),
        }
    }
}

/// Item inside its quiet period.
pub struct WaitingItem {
    pub(crate) core: ItemCore,
    pub(crate) due_at: DateTime<Utc>,
}

impl WaitingItem {
    pub(crate) fn new(
        id: u64,
        task: Arc<dyn Task>,
        actions: Vec<Arc<dyn Action>>,
        due_at: DateTime<Utc>,
    ) -> Self {
        Self {
            core: ItemCore::new(id, task, actions),
            due_at,
        }
    }

    pub(crate) fn restored(
        id: u64,
        task: Arc<dyn Task>,
        actions: Vec<Arc<dyn Action>>,
        in_queue_since: DateTime<Utc>,
        due_at: DateTime<Utc>,
    ) -> Self {
        Self {
            core: ItemCore::restored(id, task, actions, in_queue_since),
            due_at,
        }
    }

    pub fn id(&self) -> u64 {
        self.core.id
    }

    pub fn task(&self) -> &Arc<dyn Task> {
        &self.core.task
    }

    pub fn actions(&self) -> &[Arc<dyn Action>] {
        &self.core.actions
    }

    pub fn due_at(&self) -> DateTime<Utc> {
        self.due_at
    }

    pub fn in_queue_since(&self) -> DateTime<Utc> {
        self.core.in_queue_since
    }

    pub fn future(&self) -> CompletionFuture {
        self.core.promise.subscribe()
    }

    pub(crate) fn view(&self) -> ItemView<'_> {
        ItemView {
            id: self.core.id,
            stage: Stage::Waiting,
            task: &self.core.task,
            actions: &self.core.actions,
        }
    }

    pub(crate) fn snapshot(&self) -> ItemSnapshot {
        self.core.snapshot(Stage::Waiting, Some(self.due_at), None)
    }
}

/// Item whose blocking conditions have not yet cleared.
pub struct BlockedItem {
    pub(crate) core: ItemCore,
    pub(crate) entered_non_waiting_at: DateTime<Utc>,
}

impl BlockedItem {
    pub(crate) fn restored(
        id: u64,
        task: Arc<dyn Task>,
        actions: Vec<Arc<dyn Action>>,
        in_queue_since: DateTime<Utc>,
        entered_non_waiting_at: DateTime<Utc>,
    ) -> Self {
        Self {
            core: ItemCore::restored(id, task, actions, in_queue_since),
            entered_non_waiting_at,
        }
    }

    pub fn id(&self) -> u64 {
        self.core.id
    }

    pub fn task(&self) -> &Arc<dyn Task> {
        &self.core.task
    }

    pub fn actions(&self) -> &[Arc<dyn Action>] {
        &self.core.actions
    }

    pub fn entered_non_waiting_at(&self) -> DateTime<Utc> {
        self.entered_non_waiting_at
    }

    pub(crate) fn view(&self) -> ItemView<'_> {
        ItemView {
            id: self.core.id,
            stage: Stage::Blocked,
            task: &self.core.task,
            actions: &self.core.actions,
        }
    }

    pub(crate) fn snapshot(&self) -> ItemSnapshot {
        self.core
            .snapshot(Stage::Blocked, None, Some(self.entered_non_waiting_at))
    }
}

impl From<WaitingItem> for BlockedItem {
    fn from(item: WaitingItem) -> Self {
        Self {
            core: item.core,
            entered_non_waiting_at: Utc::now(),
        }
    }
}

impl From<BuildableItem> for BlockedItem {
    fn from(item: BuildableItem) -> Self {
        Self {
            core: item.core,
            entered_non_waiting_at: item.entered_non_waiting_at,
        }
    }
}

/// Item with no outstanding blocks, awaiting an executor.
pub struct BuildableItem {
    pub(crate) core: ItemCore,
    pub(crate) entered_non_waiting_at: DateTime<Utc>,
}

impl BuildableItem {
    pub(crate) fn restored(
        id: u64,
        task: Arc<dyn Task>,
        actions: Vec<Arc<dyn Action>>,
        in_queue_since: DateTime<Utc>,
        entered_non_waiting_at: DateTime<Utc>,
    ) -> Self {
        Self {
            core: ItemCore::restored(id, task, actions, in_queue_since),
            entered_non_waiting_at,
        }
    }

    pub fn id(&self) -> u64 {
        self.core.id
    }

    pub fn task(&self) -> &Arc<dyn Task> {
        &self.core.task
    }

    pub fn actions(&self) -> &[Arc<dyn Action>] {
        &self.core.actions
    }

    pub fn in_queue_since(&self) -> DateTime<Utc> {
        self.core.in_queue_since
    }

    pub fn entered_non_waiting_at(&self) -> DateTime<Utc> {
        self.entered_non_waiting_at
    }

    pub fn assigned_label(&self) -> Option<Label> {
        assigned_label_of(&self.core.task, &self.core.actions)
    }

    pub(crate) fn view(&self) -> ItemView<'_> {
        ItemView {
            id: self.core.id,
            stage: Stage::Buildable,
            task: &self.core.task,
            actions: &self.core.actions,
        }
    }

    pub(crate) fn snapshot(&self) -> ItemSnapshot {
        self.core
            .snapshot(Stage::Buildable, None, Some(self.entered_non_waiting_at))
    }
}

impl From<WaitingItem> for BuildableItem {
    fn from(item: WaitingItem) -> Self {
        Self {
            core: item.core,
            entered_non_waiting_at: Utc::now(),
        }
    }
}

impl From<BlockedItem> for BuildableItem {
    fn from(item: BlockedItem) -> Self {
        Self {
            core: item.core,
            entered_non_waiting_at: item.entered_non_waiting_at,
        }
    }
}

/// Item handed to an executor whose build has not started yet.
pub struct PendingItem {
    pub(crate) core: ItemCore,
    pub(crate) entered_non_waiting_at: DateTime<Utc>,
}

impl PendingItem {
    pub fn id(&self) -> u64 {
        self.core.id
    }

    pub fn task(&self) -> &Arc<dyn Task> {
        &self.core.task
    }

    pub fn actions(&self) -> &[Arc<dyn Action>] {
        &self.core.actions
    }

    pub(crate) fn view(&self) -> ItemView<'_> {
        ItemView {
            id: self.core.id,
            stage: Stage::Pending,
            task: &self.core.task,
            actions: &self.core.actions,
        }
    }

    pub(crate) fn snapshot(&self) -> ItemSnapshot {
        self.core
            .snapshot(Stage::Pending, None, Some(self.entered_non_waiting_at))
    }
}

impl From<BuildableItem> for PendingItem {
    fn from(item: BuildableItem) -> Self {
        Self {
            core: item.core,
            entered_non_waiting_at: item.entered_non_waiting_at,
        }
    }
}
