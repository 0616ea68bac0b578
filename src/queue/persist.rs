use std::fs;
use std::path::PathBuf;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::queue::actions::PersistedAction;
use crate::queue::item::{BlockedItem, BuildableItem, ItemSnapshot, Stage, WaitingItem};
use crate::queue::BuildQueue;
use crate::task::Task;

/// Name of the structured queue state file inside the state directory.
pub const QUEUE_FILE: &str = "queue.json";
/// Pre-structured format: one task name per line, migrated once on load.
pub const LEGACY_QUEUE_FILE: &str = "queue.txt";

/// Resolves persisted task names back to live task handles. Items are
/// persisted by full name only; a name without a referent is dropped.
pub trait TaskResolver: Send + Sync {
    fn resolve(&self, full_name: &str) -> Option<Arc<dyn Task>>;
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(untagged)]
enum PersistedEntry {
    Item(PersistedItem),
    /// Bare task name, scheduled with a zero quiet period on load.
    Legacy(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
enum PersistedStage {
    Waiting,
    Blocked,
    Buildable,
}

#[derive(Debug, Serialize, Deserialize)]
struct PersistedItem {
    id: u64,
    #[serde(default)]
    task: Option<String>,
    stage: PersistedStage,
    in_queue_since: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    due_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    entered_non_waiting_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    actions: Vec<PersistedAction>,
}

fn to_persisted(snapshot: &ItemSnapshot) -> Option<PersistedItem> {
    let stage = match snapshot.stage {
        Stage::Waiting => PersistedStage::Waiting,
        Stage::Blocked => PersistedStage::Blocked,
        Stage::Buildable => PersistedStage::Buildable,
        // dispatched work is not rescheduled on restart
        Stage::Pending => return None,
    };
    Some(PersistedItem {
        id: snapshot.id,
        task: Some(snapshot.task.full_display_name()),
        stage,
        in_queue_since: snapshot.in_queue_since,
        due_at: snapshot.due_at,
        entered_non_waiting_at: snapshot.entered_non_waiting_at,
        actions: snapshot
            .actions
            .iter()
            .filter_map(|a| a.to_persisted())
            .collect(),
    })
}

impl BuildQueue {
    fn queue_file(&self) -> PathBuf {
        self.config().state_dir.join(QUEUE_FILE)
    }

    fn legacy_queue_file(&self) -> PathBuf {
        self.config().state_dir.join(LEGACY_QUEUE_FILE)
    }

    /// Persist the queue contents. Pending items and transient tasks are
    /// excluded. I/O failures are logged, never propagated.
    pub fn save(&self) {
        let entries: Vec<PersistedEntry> = self
            .items()
            .iter()
            .filter(|s| s.task.is_persistent())
            .filter_map(to_persisted)
            .map(PersistedEntry::Item)
            .collect();

        let path = self.queue_file();
        let write = serde_json::to_vec_pretty(&entries)
            .map_err(crate::error::ConveyorError::from)
            .and_then(|bytes| fs::write(&path, bytes).map_err(Into::into));
        match write {
            Ok(()) => tracing::debug!(path = %path.display(), items = entries.len(), "queue state saved"),
            Err(e) => {
                tracing::warn!(path = %path.display(), error = %e, "failed to write out the queue file")
            }
        }
    }

    /// Restore queue contents saved by [`BuildQueue::save`].
    ///
    /// A legacy `queue.txt` takes precedence and is migrated by scheduling
    /// each named task with a zero quiet period. The structured file is
    /// renamed to a `.bak` sibling after a successful read; on a failed
    /// read it stays in place for inspection and whatever loaded is kept.
    pub fn load(&self) {
        let legacy = self.legacy_queue_file();
        if legacy.exists() {
            match fs::read_to_string(&legacy) {
                Ok(text) => {
                    for name in text.lines().map(str::trim).filter(|l| !l.is_empty()) {
                        self.schedule_by_name(name);
                    }
                    if let Err(e) = fs::remove_file(&legacy) {
                        tracing::warn!(path = %legacy.display(), error = %e, "failed to discard the legacy queue file");
                    }
                }
                Err(e) => {
                    tracing::warn!(path = %legacy.display(), error = %e, "failed to load the legacy queue file")
                }
            }
            return;
        }

        let path = self.queue_file();
        if !path.exists() {
            return;
        }
        let entries: Vec<PersistedEntry> = match fs::read(&path)
            .map_err(crate::error::ConveyorError::from)
            .and_then(|bytes| serde_json::from_slice(&bytes).map_err(Into::into))
        {
            Ok(entries) => entries,
            Err(e) => {
                tracing::warn!(path = %path.display(), error = %e, "failed to load the queue file");
                return;
            }
        };

        let mut max_id = 0;
        let mut legacy_names = Vec::new();
        {
            let mut st = self.state.write();
            for entry in entries {
                let record = match entry {
                    PersistedEntry::Legacy(name) => {
                        legacy_names.push(name);
                        continue;
                    }
                    PersistedEntry::Item(record) => record,
                };
                let Some(name) = record.task.as_deref().filter(|n| !n.is_empty()) else {
                    // botched persistence; throw this one away
                    tracing::debug!(id = record.id, "dropping persisted item without a task");
                    continue;
                };
                max_id = max_id.max(record.id);
                let Some(task) = self.resolver().resolve(name) else {
                    tracing::warn!(task = name, "dropping persisted item for unknown task");
                    continue;
                };

                let actions = record.actions.iter().map(PersistedAction::revive).collect();
                let since = record.in_queue_since;
                match record.stage {
                    PersistedStage::Waiting => {
                        let due = record.due_at.unwrap_or(since);
                        st.store.insert_waiting(WaitingItem::restored(
                            record.id, task, actions, since, due,
                        ));
                    }
                    PersistedStage::Blocked => {
                        let entered = record.entered_non_waiting_at.unwrap_or(since);
                        st.store.blocked.push(BlockedItem::restored(
                            record.id, task, actions, since, entered,
                        ));
                    }
                    PersistedStage::Buildable => {
                        let entered = record.entered_non_waiting_at.unwrap_or(since);
                        st.store.buildable.push(BuildableItem::restored(
                            record.id, task, actions, since, entered,
                        ));
                    }
                }
            }
        }
        self.ids.prime(max_id);

        for name in legacy_names {
            self.schedule_by_name(&name);
        }

        // keep the old contents around for post-mortem
        let backup = path.with_extension("json.bak");
        let _ = fs::remove_file(&backup);
        if let Err(e) = fs::rename(&path, &backup) {
            tracing::warn!(path = %path.display(), error = %e, "failed to retire the queue file");
        }

        self.schedule_maintenance();
    }

    fn schedule_by_name(&self, name: &str) {
        match self.resolver().resolve(name) {
            Some(task) => {
                self.schedule(task, 0, Vec::new());
            }
            None => tracing::warn!(task = name, "dropping persisted entry for unknown task"),
        }
    }
}
