use std::any::Any;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use tracing::debug;

use crate::executors::{TaskExecutor, TaskExecutorFactory, TaskOutcome, UnregisteredTaskExecutor};
use crate::network::Parameters;

/// One task assignment, ready to run on the pool
pub struct TaskRun {
    task_id: i64,
    task_type: String,
    parameters: Parameters,
    factory: Option<Arc<dyn TaskExecutorFactory>>,
}

impl TaskRun {
    /// `factory` is `None` when no factory is registered for `task_type`; the
    /// run then fails with an error naming the type
    pub fn new(
        task_id: i64,
        task_type: impl Into<String>,
        parameters: Parameters,
        factory: Option<Arc<dyn TaskExecutorFactory>>,
    ) -> Self {
        Self {
            task_id,
            task_type: task_type.into(),
            parameters,
            factory,
        }
    }

    pub fn task_id(&self) -> i64 {
        self.task_id
    }

    pub fn task_type(&self) -> &str {
        &self.task_type
    }

    /// Execute the task, reporting `Running` and then exactly one terminal
    /// outcome
    ///
    /// Executor errors and panics, including panics in the factory, become
    /// [`TaskOutcome::Error`].
    pub fn run(self, mut report: impl FnMut(i64, TaskOutcome)) {
        let task_id = self.task_id;
        report(task_id, TaskOutcome::Running);

        let mut results = Parameters::new();
        let executed = catch_unwind(AssertUnwindSafe(|| {
            let mut executor = self.create_executor();
            executor.execute_task(&self.parameters, &mut results)
        }));

        let outcome = match executed {
            Ok(Ok(())) => TaskOutcome::Finished { results },
            Ok(Err(e)) => TaskOutcome::Error {
                results,
                error: format!("{e:#}"),
            },
            Err(panic) => TaskOutcome::Error {
                results,
                error: format!("task executor panicked: {}", panic_message(panic.as_ref())),
            },
        };

        debug!(
            task_id = task_id,
            task_type = %self.task_type,
            status = %outcome.status(),
            "Task execution completed"
        );

        report(task_id, outcome);
    }

    fn create_executor(&self) -> Box<dyn TaskExecutor> {
        match &self.factory {
            Some(factory) => factory.create_task_executor(&self.parameters),
            None => Box::new(UnregisteredTaskExecutor::new(self.task_type.clone())),
        }
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> &str {
    if let Some(message) = panic.downcast_ref::<&'static str>() {
        message
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message
    } else {
        "unknown panic"
    }
}
