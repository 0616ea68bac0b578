use std::sync::Arc;

use tokio::sync::Notify;

use crate::error::{ConveyorError, Result};
use crate::fleet::Executor;
use crate::work::WorkUnit;

/// An idle executor parked inside the queue, waiting for an assignment.
///
/// Exists only between registration and retraction inside `pop`. A non-empty
/// work unit means the offer uniquely owns that unit and the matching item
/// has already moved to pending.
pub struct JobOffer {
    executor: Arc<Executor>,
    work_unit: Option<Arc<WorkUnit>>,
    wake: Arc<Notify>,
}

impl JobOffer {
    pub(crate) fn new(executor: Arc<Executor>) -> Self {
        Self {
            executor,
            work_unit: None,
            wake: Arc::new(Notify::new()),
        }
    }

    pub fn executor(&self) -> &Arc<Executor> {
        &self.executor
    }

    pub fn is_idle(&self) -> bool {
        self.work_unit.is_none()
    }

    pub fn work_unit(&self) -> Option<&Arc<WorkUnit>> {
        self.work_unit.as_ref()
    }

    /// Executor side: the handle `pop` parks on.
    pub(crate) fn wake_handle(&self) -> Arc<Notify> {
        self.wake.clone()
    }

    /// Assignment engine side: hand a work unit to this offer and wake the
    /// parked executor. Assigning twice is a protocol violation.
    pub(crate) fn assign(&mut self, unit: Arc<WorkUnit>) -> Result<()> {
        if self.work_unit.is_some() {
            return Err(ConveyorError::OfferAlreadyTaken(self.executor.id()));
        }
        tracing::debug!(
            executor = self.executor.id(),
            unit = %unit.display_name(),
            "work unit assigned to parked executor"
        );
        self.work_unit = Some(unit);
        self.wake.notify_one();
        Ok(())
    }

    pub(crate) fn into_work_unit(self) -> Option<Arc<WorkUnit>> {
        self.work_unit
    }
}
