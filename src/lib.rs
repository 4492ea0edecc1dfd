#![allow(clippy::doc_markdown)] // Allow technical terms in docs
#![allow(clippy::missing_errors_doc)] // Allow public functions without # Errors sections
#![allow(clippy::must_use_candidate)] // Allow methods without must_use when context is clear

//! # Dodo Core
//!
//! Communication and coordination core of a distributed job scheduler: a broker
//! assigns tasks to remote workers over a network connection and workers report
//! completion back.
//!
//! ## Overview
//!
//! The hard part is not running tasks (that is delegated to pluggable
//! executors) but making an asynchronous, connection-oriented transport behave
//! like a reliable request/response system, and keeping a worker connected to
//! its broker while brokers come and go.
//!
//! ## Architecture
//!
//! - A [`Channel`](network::Channel) carries [`Message`](network::Message)s in
//!   both directions with one-way, reply and request/reply sends.
//! - A [`ReplyCorrelator`](network::ReplyCorrelator) matches replies to their
//!   requests and guarantees every request is resolved exactly once.
//! - A [`ConnectionManager`](worker::ConnectionManager) acquires a channel
//!   through a [`BrokerLocator`](worker::BrokerLocator), backs off while no
//!   broker is available and reconnects after disconnection.
//! - [`WorkerCore`](worker::WorkerCore) dispatches inbound messages, runs
//!   assigned tasks on a bounded pool and reports their outcomes.
//!
//! ## Module Organization
//!
//! - [`network`] - Messages, channels, correlation and transports
//! - [`worker`] - Connection loop, dispatch and task execution
//! - [`executors`] - Pluggable task executor contracts
//! - [`config`] - Worker configuration
//! - [`error`] - Structured error handling
//! - [`logging`] - Structured logging setup
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use dodo_core::config::WorkerConfig;
//! use dodo_core::logging::init_structured_logging;
//! use dodo_core::network::tcp::TcpBrokerLocator;
//! use dodo_core::worker::WorkerCore;
//! use std::sync::Arc;
//!
//! # async fn example() -> dodo_core::Result<()> {
//! init_structured_logging();
//!
//! let config = WorkerConfig::from_env()?;
//! let locator = Arc::new(TcpBrokerLocator::from_config(&config));
//! let worker = WorkerCore::new(config, locator, None)?;
//! worker.start()?;
//! worker.join().await;
//! # Ok(())
//! # }
//! ```
//!
//! ## Testing
//!
//! ```bash
//! cargo test --lib    # Unit tests
//! cargo test          # Unit, integration and doc tests
//! ```

pub mod config;
pub mod constants;
pub mod error;
pub mod executors;
pub mod logging;
pub mod network;
pub mod worker;

pub use config::{WorkerConfig, WorkerIdentity};
pub use error::{DodoError, Result};
pub use executors::{TaskExecutor, TaskExecutorFactory, TaskExecutorStatus, TaskOutcome};
pub use network::{Channel, ChannelError, InboundMessagesReceiver, Message, MessageType, Parameters};
pub use worker::{BrokerLocator, BrokerLocatorError, WorkerCore};
