//! # Worker Core
//!
//! Ties a worker together: the [`ConnectionManager`] keeps a channel to the
//! broker, inbound messages are dispatched here, task assignments run on the
//! bounded [`TaskPool`], and terminal task outcomes travel back to the broker
//! as one-way `TASK_FINISHED` messages.
//!
//! ```rust,no_run
//! use dodo_core::config::WorkerConfig;
//! use dodo_core::executors::TaskExecutor;
//! use dodo_core::network::{tcp::TcpBrokerLocator, Parameters};
//! use dodo_core::worker::WorkerCore;
//! use std::sync::Arc;
//!
//! # async fn example() -> dodo_core::Result<()> {
//! let config = WorkerConfig::from_env()?;
//! let locator = Arc::new(TcpBrokerLocator::from_config(&config));
//! let worker = WorkerCore::new(config, locator, None)?;
//!
//! worker.register_task_executor_factory(
//!     "echo",
//!     Arc::new(|_: &Parameters| -> Box<dyn TaskExecutor> {
//!         Box::new(|parameters: &Parameters, results: &mut Parameters| -> anyhow::Result<()> {
//!             results.extend(parameters.clone());
//!             Ok(())
//!         })
//!     }),
//! );
//!
//! worker.start()?;
//! worker.join().await;
//! # Ok(())
//! # }
//! ```

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Weak};
use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::broker_locator::BrokerLocator;
use super::connection_manager::{ConnectionManager, ConnectionState};
use super::kill_handler::{GracefulStop, KillWorkerHandler};
use super::status_listener::{NoopStatusListener, WorkerStatusListener};
use super::task_pool::TaskPool;
use super::task_runner::TaskRun;
use crate::config::{WorkerConfig, WorkerIdentity};
use crate::error::{DodoError, Result};
use crate::executors::{TaskExecutorFactory, TaskExecutorStatus, TaskOutcome};
use crate::logging::{log_error, log_task_operation};
use crate::network::{Channel, InboundMessagesReceiver, Message, MessageType};

/// Introspection record for a task currently executing on this worker
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunningTask {
    pub task_id: i64,
    pub task_type: String,
    pub started_at: DateTime<Utc>,
}

pub struct WorkerCore {
    config: WorkerConfig,
    identity: WorkerIdentity,
    connection: Arc<ConnectionManager>,
    pool: TaskPool,
    factories: DashMap<String, Arc<dyn TaskExecutorFactory>>,
    running_tasks: DashMap<i64, RunningTask>,
    kill_handler: RwLock<Arc<dyn KillWorkerHandler>>,
    runner: Mutex<Option<JoinHandle<()>>>,
    myself: Weak<WorkerCore>,
}

impl WorkerCore {
    /// Build a worker; nothing connects until [`WorkerCore::start`]
    ///
    /// Must be called inside a tokio runtime.
    pub fn new(
        config: WorkerConfig,
        locator: Arc<dyn BrokerLocator>,
        listener: Option<Arc<dyn WorkerStatusListener>>,
    ) -> Result<Arc<Self>> {
        config.validate()?;
        let runtime = Handle::try_current().map_err(|e| {
            DodoError::ConfigurationError(format!("worker requires a tokio runtime: {e}"))
        })?;

        let identity = config.identity();
        let listener = listener.unwrap_or_else(|| Arc::new(NoopStatusListener));
        let connection = Arc::new(ConnectionManager::new(
            identity.clone(),
            locator,
            listener,
            config.reconnect_interval(),
            config.shutdown_notice_timeout(),
        ));
        let pool = TaskPool::with_runtime(
            runtime,
            config.max_threads,
            &config.maximum_thread_per_tag,
        );

        info!(
            process_id = %identity.process_id,
            worker_id = %identity.worker_id,
            location = %identity.location,
            max_threads = config.max_threads,
            "Worker created"
        );

        Ok(Arc::new_cyclic(|myself| Self {
            config,
            identity,
            connection,
            pool,
            factories: DashMap::new(),
            running_tasks: DashMap::new(),
            kill_handler: RwLock::new(Arc::new(GracefulStop)),
            runner: Mutex::new(None),
            myself: myself.clone(),
        }))
    }

    /// Register the factory used for tasks of `task_type`, replacing any
    /// previous one
    pub fn register_task_executor_factory(
        &self,
        task_type: impl Into<String>,
        factory: Arc<dyn TaskExecutorFactory>,
    ) {
        let task_type = task_type.into();
        debug!(task_type = %task_type, "Registered task executor factory");
        self.factories.insert(task_type, factory);
    }

    pub fn set_kill_worker_handler(&self, handler: Arc<dyn KillWorkerHandler>) {
        *self.kill_handler.write() = handler;
    }

    /// Spawn the connection loop
    pub fn start(&self) -> Result<()> {
        let mut runner = self.runner.lock();
        if runner.is_some() {
            return Err(DodoError::ConnectionError(
                "worker already started".to_string(),
            ));
        }
        let Some(receiver) = self.myself.upgrade() else {
            return Err(DodoError::ConnectionError("worker is being dropped".to_string()));
        };

        let connection = self.connection.clone();
        *runner = Some(tokio::spawn(async move {
            connection.run(receiver).await;
        }));
        Ok(())
    }

    /// Request shutdown; running tasks finish on their own
    pub fn stop(&self) {
        self.connection.stop();
    }

    /// Wait for the connection loop to end
    pub async fn join(&self) {
        let runner = self.runner.lock().take();
        if let Some(runner) = runner {
            if let Err(e) = runner.await {
                error!(error = %e, "Connection loop ended abnormally");
            }
        }
    }

    pub fn identity(&self) -> &WorkerIdentity {
        &self.identity
    }

    pub fn process_id(&self) -> &str {
        &self.identity.process_id
    }

    pub fn worker_id(&self) -> &str {
        &self.identity.worker_id
    }

    pub fn location(&self) -> &str {
        &self.identity.location
    }

    pub fn max_threads(&self) -> usize {
        self.config.max_threads
    }

    pub fn maximum_thread_per_tag(&self) -> &HashMap<String, usize> {
        &self.config.maximum_thread_per_tag
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.connection.state()
    }

    pub fn is_connected(&self) -> bool {
        self.connection_state() == ConnectionState::Connected
    }

    pub fn is_stopped(&self) -> bool {
        self.connection.is_stopped()
    }

    pub fn current_channel(&self) -> Option<Arc<dyn Channel>> {
        self.connection.current_channel()
    }

    /// Snapshot of the tasks currently executing
    pub fn running_tasks(&self) -> Vec<RunningTask> {
        let mut tasks: Vec<_> = self
            .running_tasks
            .iter()
            .map(|entry| entry.value().clone())
            .collect();
        tasks.sort_by_key(|task| task.task_id);
        tasks
    }

    pub fn running_task_count(&self) -> usize {
        self.running_tasks.len()
    }

    /// Handle a task state change reported by an execution
    ///
    /// Terminal outcomes remove the task from the running set and produce
    /// exactly one `TASK_FINISHED` message. `NeedsRecovery` is not supported
    /// and panics.
    pub fn task_status_changed(&self, task_id: i64, outcome: TaskOutcome) {
        match outcome {
            TaskOutcome::Running => {
                debug!(task_id = task_id, "Task running");
            }
            TaskOutcome::Finished { results } => {
                self.finish_task(task_id);
                self.send_task_result(
                    task_id,
                    Message::task_finished(
                        self.process_id(),
                        task_id,
                        TaskExecutorStatus::Finished,
                        Some(results),
                        None,
                    ),
                );
            }
            TaskOutcome::Error { results, error } => {
                self.finish_task(task_id);
                let results = (!results.is_empty()).then_some(results);
                self.send_task_result(
                    task_id,
                    Message::task_finished(
                        self.process_id(),
                        task_id,
                        TaskExecutorStatus::Error,
                        results,
                        Some(&error),
                    ),
                );
            }
            TaskOutcome::NeedsRecovery => {
                self.finish_task(task_id);
                log_error(
                    "worker",
                    "task_status_changed",
                    "task recovery requested",
                    Some(&format!("task_id={task_id}")),
                );
                unimplemented!("task recovery is not supported by this worker");
            }
        }
    }

    fn finish_task(&self, task_id: i64) {
        if let Some((_, task)) = self.running_tasks.remove(&task_id) {
            let elapsed_ms = (Utc::now() - task.started_at).num_milliseconds();
            log_task_operation(
                "finish",
                Some(task_id),
                Some(&task.task_type),
                "DONE",
                Some(&format!("elapsed_ms={elapsed_ms}")),
            );
        }
    }

    fn start_task(&self, message: &Message) {
        let Some(task_id) = message.task_id() else {
            warn!(%message, "Task assignment without task id, ignoring");
            return;
        };
        let task_type = message.task_type().unwrap_or_default().to_string();

        match self.running_tasks.entry(task_id) {
            dashmap::mapref::entry::Entry::Occupied(_) => {
                warn!(task_id = task_id, "Task is already running, ignoring assignment");
                return;
            }
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                slot.insert(RunningTask {
                    task_id,
                    task_type: task_type.clone(),
                    started_at: Utc::now(),
                });
            }
        }

        let factory = self.factories.get(&task_type).map(|f| f.value().clone());
        if factory.is_none() {
            warn!(task_id = task_id, task_type = %task_type, "No factory registered for task type");
        }

        log_task_operation("assign", Some(task_id), Some(&task_type), "QUEUED", None);

        let run = TaskRun::new(task_id, task_type.clone(), message.parameters.clone(), factory);
        let worker = self.myself.clone();
        self.pool.submit(Some(&task_type), move || {
            run.run(|task_id, outcome| {
                if let Some(worker) = worker.upgrade() {
                    worker.task_status_changed(task_id, outcome);
                }
            });
        });
    }

    /// Best effort: a result that cannot reach the broker is lost, the
    /// broker learns about the task through its own bookkeeping
    fn send_task_result(&self, task_id: i64, message: Message) {
        let Some(channel) = self.current_channel() else {
            error!(task_id = task_id, %message, "Not connected to a broker, task result lost");
            return;
        };
        channel.send_one_way(
            message,
            Box::new(move |message, error| {
                if let Some(error) = error {
                    error!(
                        task_id = task_id,
                        %message,
                        error = %error,
                        "Task result not delivered to broker"
                    );
                }
            }),
        );
    }
}

impl InboundMessagesReceiver for WorkerCore {
    fn message_received(&self, message: Message) -> anyhow::Result<()> {
        match message.message_type {
            MessageType::KillWorker => {
                let handler = self.kill_handler.read().clone();
                handler.kill_worker(self);
            }
            MessageType::TaskAssigned => self.start_task(&message),
            MessageType::Ping => {
                if let Some(channel) = self.current_channel() {
                    channel.send_reply(&message, Message::ack(&message));
                }
            }
            _ => {
                debug!(%message, "Ignoring message");
            }
        }
        Ok(())
    }

    fn channel_closed(&self) {
        self.connection.channel_closed();
    }
}

impl fmt::Debug for WorkerCore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkerCore")
            .field("identity", &self.identity)
            .field("connection", &self.connection_state())
            .field("running_tasks", &self.running_task_count())
            .field("pool", &self.pool)
            .finish()
    }
}
