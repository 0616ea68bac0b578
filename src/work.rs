use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use uuid::Uuid;

use crate::queue::actions::Action;
use crate::queue::item::CompletionPromise;
use crate::task::{Executable, SubTask, Task};

/// Everything shared by the work units cut from one dispatched item.
///
/// Created when the assignment engine maps a buildable item onto executors.
/// The context outlives the queue item: it carries the completion promise so
/// the executor side can resolve it, and the abort flag used when a parked
/// executor dies with an assignment in hand.
pub struct WorkUnitContext {
    id: Uuid,
    item_id: u64,
    task: Arc<dyn Task>,
    actions: Vec<Arc<dyn Action>>,
    promise: CompletionPromise,
    aborted: AtomicBool,
    units_created: AtomicUsize,
}

impl WorkUnitContext {
    pub(crate) fn new(
        item_id: u64,
        task: Arc<dyn Task>,
        actions: Vec<Arc<dyn Action>>,
        promise: CompletionPromise,
    ) -> Arc<Self> {
        Arc::new(Self {
            id: Uuid::new_v4(),
            item_id,
            task,
            actions,
            promise,
            aborted: AtomicBool::new(false),
            units_created: AtomicUsize::new(0),
        })
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn item_id(&self) -> u64 {
        self.item_id
    }

    pub fn task(&self) -> &Arc<dyn Task> {
        &self.task
    }

    pub fn actions(&self) -> &[Arc<dyn Action>] {
        &self.actions
    }

    pub(crate) fn create_main_work_unit(self: &Arc<Self>) -> Arc<WorkUnit> {
        self.units_created.fetch_add(1, Ordering::SeqCst);
        Arc::new(WorkUnit {
            context: self.clone(),
            source: WorkSource::Primary,
            is_main: true,
        })
    }

    pub(crate) fn create_sub_work_unit(self: &Arc<Self>, sub: Arc<dyn SubTask>) -> Arc<WorkUnit> {
        self.units_created.fetch_add(1, Ordering::SeqCst);
        Arc::new(WorkUnit {
            context: self.clone(),
            source: WorkSource::Sub(sub),
            is_main: false,
        })
    }

    pub fn unit_count(&self) -> usize {
        self.units_created.load(Ordering::SeqCst)
    }

    /// Resolve the completion promise as started. Called by the executor
    /// side once the build begins.
    pub fn mark_started(&self) {
        self.promise.start();
    }

    /// Abandon this dispatch: the item's future resolves as cancelled and
    /// the abort is logged. Safe to call more than once.
    pub fn abort(&self) {
        if !self.aborted.swap(true, Ordering::SeqCst) {
            tracing::warn!(
                context = %self.id,
                task = %self.task.full_display_name(),
                "work unit context aborted before execution"
            );
            self.promise.cancel();
        }
    }

    pub fn is_aborted(&self) -> bool {
        self.aborted.load(Ordering::SeqCst)
    }
}

impl fmt::Debug for WorkUnitContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkUnitContext")
            .field("id", &self.id)
            .field("item_id", &self.item_id)
            .field("task", &self.task.full_display_name())
            .field("aborted", &self.is_aborted())
            .finish()
    }
}

enum WorkSource {
    /// The task's own primary slice.
    Primary,
    Sub(Arc<dyn SubTask>),
}

/// One subtask's assignment to one executor.
pub struct WorkUnit {
    context: Arc<WorkUnitContext>,
    source: WorkSource,
    is_main: bool,
}

impl WorkUnit {
    pub fn context(&self) -> &Arc<WorkUnitContext> {
        &self.context
    }

    /// The main work unit is the one whose pickup retires the pending item.
    pub fn is_main(&self) -> bool {
        self.is_main
    }

    pub fn display_name(&self) -> String {
        match &self.source {
            WorkSource::Primary => self.context.task.display_name(),
            WorkSource::Sub(sub) => sub.display_name(),
        }
    }

    pub fn create_executable(&self) -> Arc<dyn Executable> {
        match &self.source {
            WorkSource::Primary => self.context.task.create_executable(),
            WorkSource::Sub(sub) => sub.create_executable(),
        }
    }
}

impl fmt::Debug for WorkUnit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkUnit")
            .field("context", &self.context.id)
            .field("name", &self.display_name())
            .field("is_main", &self.is_main)
            .finish()
    }
}
