//! # Worker
//!
//! Worker-side runtime: broker discovery, the self-healing connection loop,
//! inbound dispatch and bounded task execution.

pub mod broker_locator;
pub mod connection_manager;
pub mod core;
pub mod kill_handler;
pub mod status_listener;
pub mod task_pool;
pub mod task_runner;

pub use broker_locator::{BrokerLocator, BrokerLocatorError};
pub use connection_manager::{ConnectionManager, ConnectionState, ConnectionStats};
pub use self::core::{RunningTask, WorkerCore};
pub use kill_handler::{GracefulStop, KillWorkerHandler};
pub use status_listener::{ConnectionEvent, NoopStatusListener, WorkerStatusListener};
pub use task_pool::TaskPool;
pub use task_runner::TaskRun;
