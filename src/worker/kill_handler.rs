use tracing::info;

use super::core::WorkerCore;

/// Policy applied when the broker sends `KILL_WORKER`
pub trait KillWorkerHandler: Send + Sync {
    fn kill_worker(&self, worker: &WorkerCore);
}

/// Default policy: stop the connection loop and let running tasks finish
#[derive(Debug, Default, Clone, Copy)]
pub struct GracefulStop;

impl KillWorkerHandler for GracefulStop {
    fn kill_worker(&self, worker: &WorkerCore) {
        info!(
            process_id = %worker.process_id(),
            running_tasks = worker.running_task_count(),
            "Kill requested by broker, stopping gracefully"
        );
        worker.stop();
    }
}
