use async_trait::async_trait;
use std::sync::Arc;

use crate::network::{Channel, InboundMessagesReceiver};

/// Broker discovery errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BrokerLocatorError {
    /// Transient, the worker retries after its backoff interval
    #[error("no broker available: {0}")]
    BrokerNotAvailable(String),

    /// Terminal, the worker shuts its connection loop down
    #[error("broker rejected connection: {0}")]
    BrokerRejectedConnection(String),

    /// Terminal, connecting was interrupted by a stop request
    #[error("interrupted while connecting to broker")]
    Interrupted,
}

impl BrokerLocatorError {
    pub fn is_transient(&self) -> bool {
        matches!(self, BrokerLocatorError::BrokerNotAvailable(_))
    }
}

/// Finds the current broker and opens a channel to it
#[async_trait]
pub trait BrokerLocator: Send + Sync {
    /// Open a channel whose inbound messages go to `receiver`
    async fn connect(
        &self,
        receiver: Arc<dyn InboundMessagesReceiver>,
    ) -> Result<Arc<dyn Channel>, BrokerLocatorError>;
}
