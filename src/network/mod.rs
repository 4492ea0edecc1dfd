//! # Network
//!
//! Messages, the [`Channel`] contract, reply correlation and the transports
//! that carry messages between brokers and workers.

pub mod channel;
pub mod connection;
pub mod correlator;
pub mod local;
pub mod message;
pub mod receiver;
pub mod tcp;

pub use channel::{CallbackExecutor, Channel, ChannelError, ReplyCallback, SendResultCallback};
pub use connection::{NetworkChannel, OutboundFrame, TransportEndpoint};
pub use correlator::{PendingRequest, ReplyCorrelator};
pub use message::{Message, MessageType, Parameters};
pub use receiver::InboundMessagesReceiver;
