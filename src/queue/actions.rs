use std::any::Any;
use std::sync::Arc;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::fleet::Label;
use crate::queue::item::Stage;
use crate::task::Task;

/// Per-request metadata attached to a queue item.
///
/// Actions are opaque to the scheduler except for three sub-capabilities,
/// probed through the `as_*` hooks, and an optional persisted form.
pub trait Action: Send + Sync {
    fn display_name(&self) -> Option<String> {
        None
    }

    fn as_any(&self) -> &dyn Any;

    fn as_queue_action(&self) -> Option<&dyn QueueAction> {
        None
    }

    fn as_foldable(&self) -> Option<&dyn FoldableAction> {
        None
    }

    fn as_label_assignment(&self) -> Option<&dyn LabelAssignmentAction> {
        None
    }

    /// Actions without a persisted form are dropped on save.
    fn to_persisted(&self) -> Option<PersistedAction> {
        None
    }
}

/// Lets an action veto duplicate coalescing: returning `true` means the new
/// submission is different enough to deserve its own item.
pub trait QueueAction: Action {
    fn should_schedule(&self, other_actions: &[Arc<dyn Action>]) -> bool;
}

/// Mutable handle on an existing queued item, passed to folding actions.
pub struct FoldTarget<'a> {
    pub id: u64,
    pub stage: Stage,
    pub actions: &'a mut Vec<Arc<dyn Action>>,
}

/// Lets a new submission's action merge its side effects into the existing
/// duplicate item instead of creating a second one.
pub trait FoldableAction: Action {
    fn fold_into_existing(
        &self,
        target: &mut FoldTarget<'_>,
        task: &Arc<dyn Task>,
        new_actions: &[Arc<dyn Action>],
    );
}

/// Overrides the task's own label for this particular item.
pub trait LabelAssignmentAction: Action {
    fn assigned_label(&self, task: &Arc<dyn Task>) -> Option<Label>;
}

/// Records why a build was requested. Duplicate submissions fold their
/// notes into the existing item's cause action.
pub struct CauseAction {
    notes: Mutex<Vec<String>>,
}

impl CauseAction {
    pub fn new(note: impl Into<String>) -> Self {
        Self {
            notes: Mutex::new(vec![note.into()]),
        }
    }

    pub fn notes(&self) -> Vec<String> {
        self.notes.lock().clone()
    }

    fn merge(&self, incoming: Vec<String>) {
        let mut notes = self.notes.lock();
        for note in incoming {
            if !notes.contains(&note) {
                notes.push(note);
            }
        }
    }
}

impl Action for CauseAction {
    fn display_name(&self) -> Option<String> {
        Some(self.notes.lock().join(", "))
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_foldable(&self) -> Option<&dyn FoldableAction> {
        Some(self)
    }

    fn to_persisted(&self) -> Option<PersistedAction> {
        Some(PersistedAction::Cause {
            notes: self.notes(),
        })
    }
}

impl FoldableAction for CauseAction {
    fn fold_into_existing(
        &self,
        target: &mut FoldTarget<'_>,
        _task: &Arc<dyn Task>,
        _new_actions: &[Arc<dyn Action>],
    ) {
        for existing in target.actions.iter() {
            if let Some(cause) = existing.as_any().downcast_ref::<CauseAction>() {
                cause.merge(self.notes());
                return;
            }
        }
        target.actions.push(Arc::new(CauseAction {
            notes: Mutex::new(self.notes()),
        }));
    }
}

/// Pins the item to a label, overriding the task default.
pub struct AssignLabelAction {
    label: Label,
}

impl AssignLabelAction {
    pub fn new(label: Label) -> Self {
        Self { label }
    }
}

impl Action for AssignLabelAction {
    fn display_name(&self) -> Option<String> {
        Some(format!("assigned to {}", self.label))
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_label_assignment(&self) -> Option<&dyn LabelAssignmentAction> {
        Some(self)
    }

    fn to_persisted(&self) -> Option<PersistedAction> {
        Some(PersistedAction::AssignedLabel {
            label: self.label.0.clone(),
        })
    }
}

impl LabelAssignmentAction for AssignLabelAction {
    fn assigned_label(&self, _task: &Arc<dyn Task>) -> Option<Label> {
        Some(self.label.clone())
    }
}

/// On-disk form of the actions that survive persistence.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum PersistedAction {
    Cause { notes: Vec<String> },
    AssignedLabel { label: String },
}

impl PersistedAction {
    pub fn revive(&self) -> Arc<dyn Action> {
        match self {
            Self::Cause { notes } => {
                let action = CauseAction {
                    notes: Mutex::new(notes.clone()),
                };
                Arc::new(action)
            }
            Self::AssignedLabel { label } => {
                Arc::new(AssignLabelAction::new(Label::new(label.clone())))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cause_action_folds_into_existing_cause() {
        let existing: Arc<dyn Action> = Arc::new(CauseAction::new("timer"));
        let mut actions = vec![existing.clone()];
        let incoming = CauseAction::new("scm change");

        let task: Arc<dyn Task> = crate::queue::tests_support::noop_task("t");
        let mut target = FoldTarget {
            id: 1,
            stage: Stage::Waiting,
            actions: &mut actions,
        };
        incoming.fold_into_existing(&mut target, &task, &[]);

        assert_eq!(actions.len(), 1);
        let cause = actions[0].as_any().downcast_ref::<CauseAction>().unwrap();
        assert_eq!(cause.notes(), vec!["timer".to_string(), "scm change".to_string()]);
    }

    #[test]
    fn persisted_actions_round_trip() {
        let original = PersistedAction::AssignedLabel {
            label: "linux".into(),
        };
        let json = serde_json::to_string(&original).unwrap();
        let back: PersistedAction = serde_json::from_str(&json).unwrap();
        assert_eq!(original, back);

        let revived = back.revive();
        let label = revived
            .as_label_assignment()
            .unwrap()
            .assigned_label(&crate::queue::tests_support::noop_task("t"))
            .unwrap();
        assert_eq!(label, Label::new("linux"));
    }
}
