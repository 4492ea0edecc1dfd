use std::fmt;

use crate::config::WorkerIdentity;
use crate::constants::connection_events;

/// Connection lifecycle notifications
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionEvent {
    Connected,
    Disconnected,
}

impl ConnectionEvent {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectionEvent::Connected => connection_events::CONNECTED,
            ConnectionEvent::Disconnected => connection_events::DISCONNECTED,
        }
    }
}

impl fmt::Display for ConnectionEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Observer of a worker's broker connection
///
/// A hook for monitoring only; the connection manager never waits on it for
/// scheduling decisions.
pub trait WorkerStatusListener: Send + Sync {
    fn connection_event(&self, _event: ConnectionEvent, _worker: &WorkerIdentity) {}
}

/// Listener used when none is configured
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopStatusListener;

impl WorkerStatusListener for NoopStatusListener {}
