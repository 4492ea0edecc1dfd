use super::message::Message;

/// Consumer of the non-reply messages arriving on a channel
///
/// One receiver is registered per channel at construction. Returning an
/// error (or panicking) makes the channel close itself; the failure never
/// propagates past the channel.
pub trait InboundMessagesReceiver: Send + Sync {
    fn message_received(&self, message: Message) -> anyhow::Result<()>;

    /// The channel delivering to this receiver has closed
    fn channel_closed(&self) {}
}
