//! In-process transport
//!
//! Connects two [`NetworkChannel`]s directly, which lets a broker and a worker
//! live in the same process and gives tests a transport without sockets.

use std::sync::{Arc, Weak};
use tracing::debug;

use super::channel::{Channel, ChannelError};
use super::connection::{NetworkChannel, TransportEndpoint};
use super::receiver::InboundMessagesReceiver;

/// Create two channels wired to each other
///
/// Messages sent on one side are delivered to the other side's receiver (or
/// correlator) in send order. Closing either side closes both, like a socket.
pub fn channel_pair(
    left_receiver: Arc<dyn InboundMessagesReceiver>,
    right_receiver: Arc<dyn InboundMessagesReceiver>,
) -> (Arc<NetworkChannel>, Arc<NetworkChannel>) {
    let (left, left_endpoint) = NetworkChannel::new(left_receiver);
    let (right, right_endpoint) = NetworkChannel::new(right_receiver);

    tokio::spawn(pipe(
        left_endpoint,
        Arc::downgrade(&left),
        Arc::downgrade(&right),
    ));
    tokio::spawn(pipe(
        right_endpoint,
        Arc::downgrade(&right),
        Arc::downgrade(&left),
    ));

    (left, right)
}

async fn pipe(endpoint: TransportEndpoint, local: Weak<NetworkChannel>, peer: Weak<NetworkChannel>) {
    let TransportEndpoint {
        mut outbound,
        mut shutdown,
    } = endpoint;

    loop {
        tokio::select! {
            frame = outbound.recv() => {
                let Some(frame) = frame else {
                    break;
                };
                match peer.upgrade() {
                    Some(peer) if !peer.is_closed() => {
                        peer.deliver_inbound(frame.message().clone());
                        frame.complete(Ok(()));
                    }
                    _ => {
                        frame.complete(Err(ChannelError::SendFailed {
                            message: "peer channel is closed".to_string(),
                        }));
                        break;
                    }
                }
            }
            _ = shutdown.changed() => {
                break;
            }
        }
    }

    debug!("Local pipe finished");

    if let Some(local) = local.upgrade() {
        local.transport_closed("local pipe finished");
    }
    if let Some(peer) = peer.upgrade() {
        peer.transport_closed("peer channel closed");
    }
}
