use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use crate::fleet::Label;
use crate::resource::ResourceList;

/// Why an item cannot leave its current stage right now.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CauseOfBlockage {
    /// The item is still inside its quiet period.
    InQuietPeriod { remaining_ms: i64 },
    /// Another build of the same task is in progress.
    AnotherBuildInProgress,
    /// Blocked by some other named activity.
    BlockedBy { activity: String },
    /// A required resource is held elsewhere.
    ResourceInUse { resource: String },
    /// The node that could run this item is offline.
    NodeOffline { node: String },
    /// Every node carrying the assigned label is offline.
    LabelOffline { label: Label },
    /// The node does not carry the item's assigned label.
    NodeLabelMismatch { node: String },
    /// The node only accepts tasks explicitly tied to it.
    ExclusiveNode { node: String },
    /// No idle executor is available yet.
    WaitingForExecutor,
    /// The controller is quiescing.
    ShuttingDown,
    /// Free-form cause supplied by an extension.
    Message(String),
}

impl fmt::Display for CauseOfBlockage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InQuietPeriod { remaining_ms } => {
                write!(f, "in the quiet period for another {remaining_ms}ms")
            }
            Self::AnotherBuildInProgress => write!(f, "a build of this task is already in progress"),
            Self::BlockedBy { activity } => write!(f, "blocked by {activity}"),
            Self::ResourceInUse { resource } => write!(f, "resource {resource} is in use"),
            Self::NodeOffline { node } => write!(f, "node {node} is offline"),
            Self::LabelOffline { label } => write!(f, "all nodes labelled {label} are offline"),
            Self::NodeLabelMismatch { node } => write!(f, "node {node} does not carry the label"),
            Self::ExclusiveNode { node } => write!(f, "node {node} is reserved for tied tasks"),
            Self::WaitingForExecutor => write!(f, "waiting for the next available executor"),
            Self::ShuttingDown => write!(f, "the controller is about to shut down"),
            Self::Message(m) => f.write_str(m),
        }
    }
}

/// The runnable body handed to an executor. Opaque to the scheduler.
pub trait Executable: Send + Sync {
    /// Perform the work. Invoked on a blocking-capable thread.
    fn run(&self);

    fn estimated_duration(&self) -> Option<Duration> {
        None
    }
}

/// One schedulable slice of a task. The primary slice is the task itself;
/// additional slices let one queue item occupy several executors at once.
pub trait SubTask: Send + Sync {
    fn display_name(&self) -> String;

    /// Label this slice must run under, if any.
    fn assigned_label(&self) -> Option<Label> {
        None
    }

    fn estimated_duration(&self) -> Option<Duration> {
        None
    }

    fn create_executable(&self) -> Arc<dyn Executable>;
}

/// A unit of work submitted to the queue.
///
/// Value equality (via [`Task::same_task`]) is what collapses duplicate
/// submissions into one queue item, so implementations sharing a full
/// display name are treated as the same task.
pub trait Task: SubTask {
    /// Globally unique, human-readable name. Doubles as the persistence key.
    fn full_display_name(&self) -> String;

    /// Temporary reason the task itself refuses to run, if any.
    fn cause_of_blockage(&self) -> Option<CauseOfBlockage> {
        None
    }

    fn is_build_blocked(&self) -> bool {
        self.cause_of_blockage().is_some()
    }

    /// Whether several builds of this task may run at the same time.
    fn is_concurrent_build(&self) -> bool {
        false
    }

    /// Extra slices beyond the primary one. Usually empty.
    fn sub_tasks(&self) -> Vec<Arc<dyn SubTask>> {
        Vec::new()
    }

    fn resource_list(&self) -> ResourceList {
        ResourceList::default()
    }

    /// Tasks answering `false` are skipped when the queue is persisted.
    fn is_persistent(&self) -> bool {
        true
    }

    /// Flyweight tasks do not consume an executor slot and are placed
    /// directly on a node via consistent hashing.
    fn is_flyweight(&self) -> bool {
        false
    }

    /// Non-blocking tasks keep running while the controller quiesces.
    fn is_non_blocking(&self) -> bool {
        false
    }

    fn same_task(&self, other: &dyn Task) -> bool {
        self.full_display_name() == other.full_display_name()
    }
}
