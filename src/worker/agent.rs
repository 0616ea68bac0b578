use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use crate::fleet::Executor;
use crate::queue::BuildQueue;
use crate::task::{Executable, Task};
use crate::work::WorkUnit;

/// Drives one executor slot: parks in `pop`, runs whatever work unit comes
/// back, and re-triggers maintenance when the build finishes so the freed
/// slot is offered out again.
pub struct ExecutorAgent {
    queue: Arc<BuildQueue>,
    executor: Arc<Executor>,
    shutdown: CancellationToken,
}

impl ExecutorAgent {
    pub fn new(
        queue: Arc<BuildQueue>,
        executor: Arc<Executor>,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            queue,
            executor,
            shutdown,
        }
    }

    pub async fn run(self) {
        tracing::info!(
            executor = self.executor.id(),
            node = %self.executor.computer().node_name(),
            "executor agent started"
        );
        loop {
            let unit = tokio::select! {
                _ = self.shutdown.cancelled() => break,
                popped = self.queue.pop(&self.executor) => match popped {
                    Ok(unit) => unit,
                    Err(e) => {
                        tracing::error!(executor = self.executor.id(), error = %e, "pop failed");
                        break;
                    }
                },
            };
            self.execute(unit).await;
        }
        tracing::info!(executor = self.executor.id(), "executor agent stopped");
    }

    async fn execute(&self, unit: Arc<WorkUnit>) {
        let context = unit.context().clone();
        let resources = context.task().resource_list();

        self.queue.resources().reserve(&resources);
        context.mark_started();
        tracing::info!(
            executor = self.executor.id(),
            unit = %unit.display_name(),
            context = %context.id(),
            "build started"
        );

        let executable = unit.create_executable();
        let run = tokio::task::spawn_blocking(move || executable.run()).await;
        match run {
            Ok(()) => tracing::info!(
                executor = self.executor.id(),
                unit = %unit.display_name(),
                "build completed"
            ),
            Err(e) => tracing::error!(
                executor = self.executor.id(),
                unit = %unit.display_name(),
                error = %e,
                "build panicked"
            ),
        }

        self.queue.resources().release(&resources);
        // a finished build may unblock queued work
        self.queue.schedule_maintenance();
    }
}
