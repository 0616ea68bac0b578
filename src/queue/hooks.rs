use std::sync::Arc;

use parking_lot::RwLock;

use crate::fleet::Node;
use crate::queue::actions::Action;
use crate::queue::item::{BuildableItem, ItemView};
use crate::task::{CauseOfBlockage, Task};

/// Consulted on every submission; any `false` vetoes admission outright.
pub trait QueueDecisionHandler: Send + Sync {
    fn should_schedule(&self, task: &Arc<dyn Task>, actions: &[Arc<dyn Action>]) -> bool;
}

/// Lets an extension keep an item out of the buildable stage (`can_run`) or
/// off a particular node (`can_take`). `None` means "no objection".
pub trait QueueTaskDispatcher: Send + Sync {
    fn can_run(&self, _item: &ItemView<'_>) -> Option<CauseOfBlockage> {
        None
    }

    fn can_take(&self, _node: &Node, _item: &ItemView<'_>) -> Option<CauseOfBlockage> {
        None
    }
}

/// Reorders the buildable list before each dispatch pass. Earlier entries
/// are offered to executors first.
pub trait QueueSorter: Send + Sync {
    fn sort(&self, buildables: &mut Vec<BuildableItem>);
}

/// The scheduler-owned registries of decision handlers and dispatchers,
/// populated at startup.
#[derive(Default)]
pub(crate) struct HookRegistry {
    pub(crate) decision_handlers: RwLock<Vec<Arc<dyn QueueDecisionHandler>>>,
    pub(crate) dispatchers: RwLock<Vec<Arc<dyn QueueTaskDispatcher>>>,
}

impl HookRegistry {
    pub fn should_schedule(&self, task: &Arc<dyn Task>, actions: &[Arc<dyn Action>]) -> bool {
        self.decision_handlers
            .read()
            .iter()
            .all(|h| h.should_schedule(task, actions))
    }

    pub fn can_run(&self, item: &ItemView<'_>) -> Option<CauseOfBlockage> {
        self.dispatchers
            .read()
            .iter()
            .find_map(|d| d.can_run(item))
    }

    pub fn can_take(&self, node: &Node, item: &ItemView<'_>) -> Option<CauseOfBlockage> {
        self.dispatchers
            .read()
            .iter()
            .find_map(|d| d.can_take(node, item))
    }
}
