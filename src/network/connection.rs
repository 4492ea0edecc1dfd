//! Concrete channel shared by every transport
//!
//! A transport driver owns the actual socket (or in-process pipe). It pulls
//! [`OutboundFrame`]s from its [`TransportEndpoint`], reports each write
//! through [`OutboundFrame::complete`], feeds decoded messages into
//! [`NetworkChannel::deliver_inbound`] and calls
//! [`NetworkChannel::transport_closed`] when the connection drops.

use parking_lot::Mutex;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::channel::{CallbackExecutor, Channel, ChannelError, ReplyCallback, SendResultCallback};
use super::correlator::{PendingRequest, ReplyCorrelator};
use super::message::{Message, MessageType};
use super::receiver::InboundMessagesReceiver;

/// Message queued for the transport together with its delivery callback
///
/// Dropping a frame without completing it reports [`ChannelError::NotActive`],
/// so frames left behind by a closing transport still resolve their callback.
pub struct OutboundFrame {
    message: Message,
    on_sent: Option<SendResultCallback>,
    callbacks: CallbackExecutor,
}

impl OutboundFrame {
    pub fn message(&self) -> &Message {
        &self.message
    }

    /// Report the transport outcome for this frame
    pub fn complete(mut self, result: Result<(), ChannelError>) {
        if let Some(on_sent) = self.on_sent.take() {
            let message = std::mem::replace(&mut self.message, Message::new(MessageType::Ack));
            self.callbacks
                .submit(move || on_sent(&message, result.err()));
        }
    }
}

impl Drop for OutboundFrame {
    fn drop(&mut self) {
        if let Some(on_sent) = self.on_sent.take() {
            let message = self.message.clone();
            self.callbacks
                .submit(move || on_sent(&message, Some(ChannelError::NotActive)));
        }
    }
}

impl fmt::Debug for OutboundFrame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OutboundFrame")
            .field("message", &self.message)
            .finish()
    }
}

/// Transport side of a [`NetworkChannel`]
#[derive(Debug)]
pub struct TransportEndpoint {
    /// Frames to write, in submission order
    pub outbound: mpsc::UnboundedReceiver<OutboundFrame>,
    /// Becomes `true` once the channel is closed
    pub shutdown: watch::Receiver<bool>,
}

/// Channel implementation independent of the underlying transport
///
/// # Examples
///
/// ```rust,no_run
/// use dodo_core::network::{InboundMessagesReceiver, Message, NetworkChannel};
/// use std::sync::Arc;
///
/// struct Printer;
///
/// impl InboundMessagesReceiver for Printer {
///     fn message_received(&self, message: Message) -> anyhow::Result<()> {
///         println!("received {message}");
///         Ok(())
///     }
/// }
///
/// # async fn example() {
/// let (channel, endpoint) = NetworkChannel::new(Arc::new(Printer));
/// // hand `endpoint` to a transport driver
/// # drop((channel, endpoint));
/// # }
/// ```
pub struct NetworkChannel {
    channel_id: String,

    /// Transport handle, `None` once closed
    outbound: Mutex<Option<mpsc::UnboundedSender<OutboundFrame>>>,

    correlator: ReplyCorrelator,

    receiver: Arc<dyn InboundMessagesReceiver>,

    /// Ordered queue towards the receiver dispatcher task
    inbound: mpsc::UnboundedSender<Message>,

    callbacks: CallbackExecutor,

    closed: AtomicBool,

    shutdown: watch::Sender<bool>,

    myself: Weak<NetworkChannel>,
}

impl NetworkChannel {
    /// Create a channel and the endpoint its transport driver consumes
    ///
    /// Must be called inside a tokio runtime: the inbound dispatcher task is
    /// spawned here.
    pub fn new(receiver: Arc<dyn InboundMessagesReceiver>) -> (Arc<Self>, TransportEndpoint) {
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let channel = Arc::new_cyclic(|myself| Self {
            channel_id: Uuid::new_v4().to_string(),
            outbound: Mutex::new(Some(outbound_tx)),
            correlator: ReplyCorrelator::new(),
            receiver,
            inbound: inbound_tx,
            callbacks: CallbackExecutor::current(),
            closed: AtomicBool::new(false),
            shutdown: shutdown_tx,
            myself: myself.clone(),
        });

        tokio::spawn(Self::dispatch_inbound(Arc::downgrade(&channel), inbound_rx));

        debug!(channel_id = %channel.channel_id, "Channel created");

        (
            channel,
            TransportEndpoint {
                outbound: outbound_rx,
                shutdown: shutdown_rx,
            },
        )
    }

    /// Number of requests still waiting for a reply
    pub fn pending_requests(&self) -> usize {
        self.correlator.pending_count()
    }

    /// Fail requests that have waited at least `max_age` with
    /// [`ChannelError::Timeout`]; returns how many expired
    ///
    /// Timed-out [`Channel::send_with_reply`] calls leave their registration
    /// behind, this reclaims them on long-lived channels.
    pub fn expire_pending(&self, max_age: Duration) -> usize {
        let expired = self.correlator.take_expired(max_age);
        let count = expired.len();
        let timeout_ms = max_age.as_millis() as u64;
        for request in expired {
            self.callbacks
                .submit(move || request.fail(ChannelError::Timeout { timeout_ms }));
        }
        if count > 0 {
            debug!(channel_id = %self.channel_id, expired = count, "Expired pending requests");
        }
        count
    }

    /// Route a message decoded by the transport
    ///
    /// Replies go to the correlator (unmatched ones are dropped); anything
    /// else is queued for the receiver in arrival order.
    pub fn deliver_inbound(&self, message: Message) {
        if self.is_closed() {
            debug!(channel_id = %self.channel_id, %message, "Discarding message on closed channel");
            return;
        }

        if message.is_reply() {
            if let Some(request) = self.correlator.take_for_reply(&message) {
                self.callbacks.submit(move || request.resolve(message));
            }
            return;
        }

        if self.inbound.send(message).is_err() {
            warn!(channel_id = %self.channel_id, "Inbound dispatcher is gone, dropping message");
        }
    }

    /// Called by the transport when the connection is lost
    pub fn transport_closed(&self, reason: &str) {
        if !self.is_closed() {
            info!(channel_id = %self.channel_id, reason = %reason, "Transport closed");
        }
        self.close();
    }

    async fn dispatch_inbound(
        channel: Weak<NetworkChannel>,
        mut inbound: mpsc::UnboundedReceiver<Message>,
    ) {
        while let Some(message) = inbound.recv().await {
            // Messages accepted before a close are still delivered
            let Some(channel) = channel.upgrade() else {
                break;
            };

            let description = message.to_string();
            let receiver = channel.receiver.clone();
            let outcome =
                tokio::task::spawn_blocking(move || receiver.message_received(message)).await;

            let failure = match outcome {
                Ok(Ok(())) => None,
                Ok(Err(e)) => Some(format!("{e:#}")),
                Err(join_error) if join_error.is_panic() => {
                    Some(format!("receiver panicked: {join_error}"))
                }
                Err(join_error) => Some(join_error.to_string()),
            };

            if let Some(failure) = failure {
                let error = ChannelError::ReceiverFailed { message: failure };
                error!(
                    channel_id = %channel.channel_id,
                    message = %description,
                    error = %error,
                    "Closing channel after receiver failure"
                );
                channel.close();
                break;
            }
        }
    }
}

impl Channel for NetworkChannel {
    fn channel_id(&self) -> &str {
        &self.channel_id
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    fn send_one_way(&self, mut message: Message, on_sent: SendResultCallback) {
        message.ensure_id();

        let frame = OutboundFrame {
            message,
            on_sent: Some(on_sent),
            callbacks: self.callbacks.clone(),
        };

        // A frame that cannot be queued is dropped, which reports NotActive
        match self.outbound.lock().as_ref() {
            Some(sender) => {
                if sender.send(frame).is_err() {
                    debug!(channel_id = %self.channel_id, "Transport writer is gone");
                }
            }
            None => drop(frame),
        }
    }

    fn send_reply(&self, in_reply_to: &Message, mut message: Message) {
        if self.is_closed() {
            debug!(
                channel_id = %self.channel_id,
                %message,
                "Channel not active, discarding reply"
            );
            return;
        }

        let Some(reply_to) = in_reply_to.message_id.clone() else {
            warn!(
                channel_id = %self.channel_id,
                request = %in_reply_to,
                "Cannot reply to a message without an id, discarding reply"
            );
            return;
        };

        message.reply_message_id = Some(reply_to);
        let channel_id = self.channel_id.clone();
        self.send_one_way(
            message,
            Box::new(move |message, error| {
                if let Some(error) = error {
                    warn!(channel_id = %channel_id, %message, error = %error, "Reply not delivered");
                }
            }),
        );
    }

    fn send_with_async_reply(&self, message: Message, on_reply: ReplyCallback) {
        let request = PendingRequest::new(message, on_reply);
        let message_id = request.message_id().to_string();

        if self.is_closed() {
            self.callbacks
                .submit(move || request.fail(ChannelError::NotActive));
            return;
        }

        let outbound_message = request.original().clone();
        if let Err(request) = self.correlator.register(request) {
            let error = ChannelError::SendFailed {
                message: format!("message id {message_id} already awaits a reply"),
            };
            self.callbacks.submit(move || request.fail(error));
            return;
        }

        // close() may have drained the map between the check and the insert
        if self.is_closed() {
            if let Some(request) = self.correlator.take(&message_id) {
                self.callbacks
                    .submit(move || request.fail(ChannelError::Closed));
            }
            return;
        }

        let channel = self.myself.clone();
        self.send_one_way(
            outbound_message,
            Box::new(move |message, error| {
                let Some(error) = error else {
                    return;
                };
                warn!(%message, error = %error, "Request could not be sent");
                if let Some(channel) = channel.upgrade() {
                    if let Some(request) = channel.correlator.take(&message_id) {
                        request.fail(error);
                    }
                }
            }),
        );
    }

    fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }

        info!(channel_id = %self.channel_id, "Closing channel");

        self.outbound.lock().take();
        let _ = self.shutdown.send(true);

        let pending = self.correlator.drain();
        if !pending.is_empty() {
            debug!(
                channel_id = %self.channel_id,
                pending = pending.len(),
                "Failing pending requests"
            );
        }
        for request in pending {
            self.callbacks
                .submit(move || request.fail(ChannelError::Closed));
        }

        let receiver = self.receiver.clone();
        self.callbacks.submit(move || receiver.channel_closed());
    }
}

impl fmt::Debug for NetworkChannel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NetworkChannel")
            .field("channel_id", &self.channel_id)
            .field("closed", &self.is_closed())
            .field("pending_requests", &self.pending_requests())
            .finish()
    }
}
