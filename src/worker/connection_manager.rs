//! # Connection Manager
//!
//! Keeps a worker connected to its broker. The manager runs as a single
//! cooperative task that owns the connect/backoff sequence:
//!
//! ```text
//! Disconnected --connect--> Connecting --ok--> Connected
//!      ^                        |                  |
//!      |                 not available       channel closed
//!      +------ backoff <--------+------------------+
//!
//! rejected / interrupted / stop --> ShuttingDown --> Disconnected (loop ends)
//! ```
//!
//! Every wait in the loop (backoff, connected idle, connecting) is interrupted
//! by [`ConnectionManager::stop`], and the connected wait is also woken by
//! [`ConnectionManager::channel_closed`]. Time is read only through tokio's
//! clock, so tests can drive the loop with a paused clock.

use parking_lot::RwLock;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{oneshot, Notify};
use tracing::{debug, error, info, warn};

use super::broker_locator::{BrokerLocator, BrokerLocatorError};
use super::status_listener::{ConnectionEvent, WorkerStatusListener};
use crate::config::WorkerIdentity;
use crate::logging::log_connection_event;
use crate::network::{Channel, InboundMessagesReceiver, Message};

/// Where the connection loop currently is
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    ShuttingDown,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
            ConnectionState::ShuttingDown => "shutting_down",
        };
        f.write_str(name)
    }
}

/// Counters describing the loop's history
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ConnectionStats {
    pub connect_attempts: u64,
    pub connections: u64,
    pub backoff_cycles: u64,
}

pub struct ConnectionManager {
    identity: WorkerIdentity,
    locator: Arc<dyn BrokerLocator>,
    listener: Arc<dyn WorkerStatusListener>,
    reconnect_interval: Duration,
    shutdown_notice_timeout: Duration,

    /// Replaced wholesale on reconnect, `None` while disconnected
    channel: RwLock<Option<Arc<dyn Channel>>>,
    state: RwLock<ConnectionState>,
    stopped: AtomicBool,
    wakeup: Notify,

    connect_attempts: AtomicU64,
    connections: AtomicU64,
    backoff_cycles: AtomicU64,
}

impl ConnectionManager {
    pub fn new(
        identity: WorkerIdentity,
        locator: Arc<dyn BrokerLocator>,
        listener: Arc<dyn WorkerStatusListener>,
        reconnect_interval: Duration,
        shutdown_notice_timeout: Duration,
    ) -> Self {
        Self {
            identity,
            locator,
            listener,
            reconnect_interval,
            shutdown_notice_timeout,
            channel: RwLock::new(None),
            state: RwLock::new(ConnectionState::Disconnected),
            stopped: AtomicBool::new(false),
            wakeup: Notify::new(),
            connect_attempts: AtomicU64::new(0),
            connections: AtomicU64::new(0),
            backoff_cycles: AtomicU64::new(0),
        }
    }

    pub fn identity(&self) -> &WorkerIdentity {
        &self.identity
    }

    /// Channel to the broker, if connected
    pub fn current_channel(&self) -> Option<Arc<dyn Channel>> {
        self.channel.read().clone()
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.read()
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }

    pub fn stats(&self) -> ConnectionStats {
        ConnectionStats {
            connect_attempts: self.connect_attempts.load(Ordering::SeqCst),
            connections: self.connections.load(Ordering::SeqCst),
            backoff_cycles: self.backoff_cycles.load(Ordering::SeqCst),
        }
    }

    /// Ask the loop to shut down; returns immediately
    pub fn stop(&self) {
        if !self.stopped.swap(true, Ordering::SeqCst) {
            info!(process_id = %self.identity.process_id, "Stop requested");
        }
        self.wakeup.notify_one();
    }

    /// Notification that a channel handed out by the locator has closed
    ///
    /// Stale notifications for a channel that was already replaced are
    /// harmless: the loop re-checks the current channel when woken.
    pub fn channel_closed(&self) {
        self.wakeup.notify_one();
    }

    /// Drive the connection loop until stopped or terminally rejected
    ///
    /// Inbound messages of every channel opened go to `receiver`.
    pub async fn run(&self, receiver: Arc<dyn InboundMessagesReceiver>) {
        info!(
            process_id = %self.identity.process_id,
            worker_id = %self.identity.worker_id,
            "🚀 Connection manager started"
        );

        loop {
            if self.is_stopped() {
                break;
            }

            if let Some(channel) = self.current_channel() {
                if !channel.is_closed() {
                    self.wakeup.notified().await;
                    continue;
                }
                self.disconnect();
                self.backoff().await;
                continue;
            }

            match self.connect(receiver.clone()).await {
                Ok(()) => {}
                Err(e) if e.is_transient() => {
                    debug!(error = %e, "Broker not available, backing off");
                    self.backoff().await;
                }
                Err(BrokerLocatorError::Interrupted) => {
                    debug!("Connect interrupted");
                    self.stopped.store(true, Ordering::SeqCst);
                    break;
                }
                Err(e) => {
                    error!(
                        process_id = %self.identity.process_id,
                        error = %e,
                        "Broker connection failed terminally, shutting down"
                    );
                    self.stopped.store(true, Ordering::SeqCst);
                    break;
                }
            }
        }

        self.shutdown().await;

        info!(process_id = %self.identity.process_id, "Connection manager finished");
    }

    async fn connect(
        &self,
        receiver: Arc<dyn InboundMessagesReceiver>,
    ) -> Result<(), BrokerLocatorError> {
        self.set_state(ConnectionState::Connecting);
        self.connect_attempts.fetch_add(1, Ordering::SeqCst);

        let result = tokio::select! {
            result = self.locator.connect(receiver) => result,
            _ = self.wait_for_stop() => Err(BrokerLocatorError::Interrupted),
        };

        let channel = match result {
            Ok(channel) => channel,
            Err(e) => {
                self.set_state(ConnectionState::Disconnected);
                return Err(e);
            }
        };

        let channel_id = channel.channel_id().to_string();
        *self.channel.write() = Some(channel);
        self.set_state(ConnectionState::Connected);
        self.connections.fetch_add(1, Ordering::SeqCst);

        self.emit(ConnectionEvent::Connected, Some(&channel_id));
        Ok(())
    }

    fn disconnect(&self) {
        let Some(channel) = self.channel.write().take() else {
            return;
        };
        channel.close();
        self.set_state(ConnectionState::Disconnected);
        self.emit(ConnectionEvent::Disconnected, Some(channel.channel_id()));
    }

    async fn backoff(&self) {
        self.backoff_cycles.fetch_add(1, Ordering::SeqCst);
        tokio::select! {
            _ = tokio::time::sleep(self.reconnect_interval) => {}
            _ = self.wait_for_stop() => {}
        }
    }

    async fn wait_for_stop(&self) {
        while !self.is_stopped() {
            self.wakeup.notified().await;
        }
    }

    /// Tell the broker we are leaving, then drop the connection
    async fn shutdown(&self) {
        self.set_state(ConnectionState::ShuttingDown);

        let Some(channel) = self.channel.write().take() else {
            self.set_state(ConnectionState::Disconnected);
            return;
        };

        if !channel.is_closed() {
            let (sent_tx, sent_rx) = oneshot::channel();
            channel.send_one_way(
                Message::worker_shutdown(&self.identity.process_id),
                Box::new(move |_, error| {
                    let _ = sent_tx.send(error);
                }),
            );

            match tokio::time::timeout(self.shutdown_notice_timeout, sent_rx).await {
                Ok(Ok(None)) => debug!("Shutdown notice sent"),
                Ok(Ok(Some(e))) => warn!(error = %e, "Shutdown notice not delivered"),
                Ok(Err(_)) => warn!("Shutdown notice outcome lost"),
                Err(_) => warn!(
                    timeout_ms = self.shutdown_notice_timeout.as_millis() as u64,
                    "Shutdown notice not confirmed in time"
                ),
            }
        }

        channel.close();
        self.set_state(ConnectionState::Disconnected);
        self.emit(ConnectionEvent::Disconnected, Some(channel.channel_id()));
    }

    fn set_state(&self, state: ConnectionState) {
        let previous = std::mem::replace(&mut *self.state.write(), state);
        if previous != state {
            debug!(from = %previous, to = %state, "Connection state changed");
        }
    }

    fn emit(&self, event: ConnectionEvent, channel_id: Option<&str>) {
        log_connection_event(event, &self.identity, channel_id);
        self.listener.connection_event(event, &self.identity);
    }
}

impl fmt::Debug for ConnectionManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionManager")
            .field("identity", &self.identity)
            .field("state", &self.state())
            .field("stopped", &self.is_stopped())
            .field("reconnect_interval", &self.reconnect_interval)
            .finish()
    }
}
