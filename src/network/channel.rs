//! Transport-agnostic bidirectional messaging contract

use async_trait::async_trait;
use std::fmt::Debug;
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::sync::oneshot;

use super::message::Message;

/// Invoked exactly once after the transport accepted or rejected a message
pub type SendResultCallback =
    Box<dyn FnOnce(&Message, Option<ChannelError>) + Send + Sync + 'static>;

/// Invoked exactly once with `(original, reply, error)`; exactly one of
/// `reply` and `error` is set
pub type ReplyCallback =
    Box<dyn FnOnce(Message, Option<Message>, Option<ChannelError>) + Send + Sync + 'static>;

/// Bidirectional messaging channel between a broker and a worker
///
/// All operations may be called concurrently from any thread or task. Apart
/// from [`Channel::send_with_reply`] none of them waits for the network;
/// outcomes are reported through callbacks that run on a callback executor,
/// never on the transport's own reader or writer.
///
/// # Examples
///
/// ```rust,no_run
/// use dodo_core::network::{Channel, Message, MessageType};
/// use std::time::Duration;
///
/// # async fn example(channel: &dyn Channel) -> Result<(), Box<dyn std::error::Error>> {
/// let reply = channel
///     .send_with_reply(Message::new(MessageType::Ping), Duration::from_secs(5))
///     .await?;
/// println!("broker answered {reply}");
/// # Ok(())
/// # }
/// ```
#[async_trait]
pub trait Channel: Send + Sync + Debug {
    /// Identifier used in logs
    fn channel_id(&self) -> &str;

    /// True once the channel has been closed locally or by the transport
    fn is_closed(&self) -> bool;

    /// Fire-and-forget send; `on_sent` reports delivery to the transport layer
    fn send_one_way(&self, message: Message, on_sent: SendResultCallback);

    /// Send `message` as the answer to `in_reply_to`
    ///
    /// Failures are logged and never surfaced to the replier.
    fn send_reply(&self, in_reply_to: &Message, message: Message);

    /// Send `message` and resolve `on_reply` once with the matching reply, a
    /// send failure or the channel closing, whichever comes first
    fn send_with_async_reply(&self, message: Message, on_reply: ReplyCallback);

    /// Tear down the transport and fail every pending request with
    /// [`ChannelError::Closed`]
    fn close(&self);

    /// Request/reply built on [`Channel::send_with_async_reply`]
    ///
    /// A timeout does not cancel the pending registration: a reply arriving
    /// later is dropped, and closing the channel reaps the entry.
    async fn send_with_reply(
        &self,
        message: Message,
        timeout: Duration,
    ) -> Result<Message, ChannelError> {
        let (tx, rx) = oneshot::channel();
        self.send_with_async_reply(
            message,
            Box::new(move |_original, reply, error| {
                let outcome = match (reply, error) {
                    (_, Some(error)) => Err(error),
                    (Some(reply), None) => Ok(reply),
                    (None, None) => Err(ChannelError::Closed),
                };
                // Waiter may already have timed out
                let _ = tx.send(outcome);
            }),
        );

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(_)) => Err(ChannelError::Closed),
            Err(_) => Err(ChannelError::Timeout {
                timeout_ms: timeout.as_millis() as u64,
            }),
        }
    }
}

/// Channel errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ChannelError {
    #[error("communication channel is closed, cannot wait for pending messages")]
    Closed,

    #[error("connection is not active")]
    NotActive,

    #[error("no reply received within {timeout_ms}ms")]
    Timeout { timeout_ms: u64 },

    #[error("failed to send message: {message}")]
    SendFailed { message: String },

    #[error("inbound message receiver failed: {message}")]
    ReceiverFailed { message: String },
}

/// Execution context for channel callbacks
///
/// Callbacks are user code that may block, so they go to the runtime's
/// blocking pool. Submissions after runtime shutdown are silently discarded.
#[derive(Debug, Clone)]
pub struct CallbackExecutor {
    runtime: Handle,
}

impl CallbackExecutor {
    pub fn new(runtime: Handle) -> Self {
        Self { runtime }
    }

    /// Bind to the runtime of the calling task
    ///
    /// Panics when called outside a tokio runtime, like `tokio::spawn`.
    pub fn current() -> Self {
        Self::new(Handle::current())
    }

    pub fn submit<F>(&self, callback: F)
    where
        F: FnOnce() + Send + 'static,
    {
        drop(self.runtime.spawn_blocking(callback));
    }
}
