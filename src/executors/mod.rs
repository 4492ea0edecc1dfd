//! # Task Executors
//!
//! Pluggable task execution. A worker keeps one [`TaskExecutorFactory`] per
//! task type; each assignment gets a fresh [`TaskExecutor`] from it, run on
//! the worker's bounded pool.
//!
//! Closures implement both traits, which keeps simple executors short:
//!
//! ```rust
//! use dodo_core::executors::{TaskExecutor, TaskExecutorFactory};
//! use dodo_core::network::Parameters;
//!
//! let factory = |_parameters: &Parameters| -> Box<dyn TaskExecutor> {
//!     Box::new(|parameters: &Parameters, results: &mut Parameters| -> anyhow::Result<()> {
//!         results.insert("echo".to_string(), parameters.len().into());
//!         Ok(())
//!     })
//! };
//!
//! let mut executor = factory.create_task_executor(&Parameters::new());
//! let mut results = Parameters::new();
//! executor.execute_task(&Parameters::new(), &mut results).unwrap();
//! assert_eq!(results["echo"], 0);
//! ```

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::network::Parameters;

/// Status reported for a task on the wire
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskExecutorStatus {
    Running,
    Finished,
    Error,
    NeedsRecovery,
}

impl TaskExecutorStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskExecutorStatus::Running => "RUNNING",
            TaskExecutorStatus::Finished => "FINISHED",
            TaskExecutorStatus::Error => "ERROR",
            TaskExecutorStatus::NeedsRecovery => "NEEDS_RECOVERY",
        }
    }
}

impl fmt::Display for TaskExecutorStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TaskExecutorStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "RUNNING" => Ok(TaskExecutorStatus::Running),
            "FINISHED" => Ok(TaskExecutorStatus::Finished),
            "ERROR" => Ok(TaskExecutorStatus::Error),
            "NEEDS_RECOVERY" => Ok(TaskExecutorStatus::NeedsRecovery),
            other => Err(format!("unknown task status: {other}")),
        }
    }
}

/// Progress of a single task execution
#[derive(Debug, Clone, PartialEq)]
pub enum TaskOutcome {
    /// Intermediate, never reported to the broker
    Running,
    Finished {
        results: Parameters,
    },
    /// `results` holds whatever the executor produced before failing
    Error {
        results: Parameters,
        error: String,
    },
    /// Not supported by this worker
    NeedsRecovery,
}

impl TaskOutcome {
    pub fn status(&self) -> TaskExecutorStatus {
        match self {
            TaskOutcome::Running => TaskExecutorStatus::Running,
            TaskOutcome::Finished { .. } => TaskExecutorStatus::Finished,
            TaskOutcome::Error { .. } => TaskExecutorStatus::Error,
            TaskOutcome::NeedsRecovery => TaskExecutorStatus::NeedsRecovery,
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, TaskOutcome::Running)
    }
}

/// Executes one task
pub trait TaskExecutor: Send {
    /// Run the task; anything written to `results` is reported to the broker
    fn execute_task(&mut self, parameters: &Parameters, results: &mut Parameters)
        -> anyhow::Result<()>;
}

impl<F> TaskExecutor for F
where
    F: FnMut(&Parameters, &mut Parameters) -> anyhow::Result<()> + Send,
{
    fn execute_task(
        &mut self,
        parameters: &Parameters,
        results: &mut Parameters,
    ) -> anyhow::Result<()> {
        self(parameters, results)
    }
}

/// Builds executors for one task type
pub trait TaskExecutorFactory: Send + Sync {
    fn create_task_executor(&self, parameters: &Parameters) -> Box<dyn TaskExecutor>;
}

impl<F> TaskExecutorFactory for F
where
    F: Fn(&Parameters) -> Box<dyn TaskExecutor> + Send + Sync,
{
    fn create_task_executor(&self, parameters: &Parameters) -> Box<dyn TaskExecutor> {
        self(parameters)
    }
}

/// Stand-in executor for task types without a registered factory
#[derive(Debug, Clone)]
pub struct UnregisteredTaskExecutor {
    task_type: String,
}

impl UnregisteredTaskExecutor {
    pub fn new(task_type: impl Into<String>) -> Self {
        Self {
            task_type: task_type.into(),
        }
    }
}

impl TaskExecutor for UnregisteredTaskExecutor {
    fn execute_task(
        &mut self,
        _parameters: &Parameters,
        _results: &mut Parameters,
    ) -> anyhow::Result<()> {
        anyhow::bail!(
            "factory for type {} is not registered on this worker",
            self.task_type
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_round_trips_through_str() {
        for status in [
            TaskExecutorStatus::Running,
            TaskExecutorStatus::Finished,
            TaskExecutorStatus::Error,
            TaskExecutorStatus::NeedsRecovery,
        ] {
            assert_eq!(status.as_str().parse::<TaskExecutorStatus>(), Ok(status));
            assert_eq!(
                serde_json::to_value(status).unwrap(),
                serde_json::Value::from(status.as_str())
            );
        }
        assert!("DONE".parse::<TaskExecutorStatus>().is_err());
    }

    #[test]
    fn test_unregistered_executor_names_type() {
        let mut executor = UnregisteredTaskExecutor::new("thumbnail");
        let err = executor
            .execute_task(&Parameters::new(), &mut Parameters::new())
            .unwrap_err();
        assert!(err.to_string().contains("thumbnail"));
    }

    #[test]
    fn test_outcome_status() {
        assert!(!TaskOutcome::Running.is_terminal());
        assert!(TaskOutcome::NeedsRecovery.is_terminal());
        let error = TaskOutcome::Error {
            results: Parameters::new(),
            error: "x".to_string(),
        };
        assert_eq!(error.status(), TaskExecutorStatus::Error);
    }
}
