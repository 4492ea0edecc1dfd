//! TCP transport: newline-delimited JSON frames over a tokio `TcpStream`

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tokio::time::timeout;
use tracing::{debug, error, info, warn};

use super::channel::{Channel, ChannelError};
use super::connection::{NetworkChannel, OutboundFrame, TransportEndpoint};
use super::message::{Message, MessageType};
use super::receiver::InboundMessagesReceiver;
use crate::config::WorkerConfig;
use crate::constants::{params, MAX_FRAME_BYTES};
use crate::worker::{BrokerLocator, BrokerLocatorError};

/// Wrap a connected stream into a channel
///
/// Spawns one reader and one writer task. Works for both ends of a
/// connection: brokers attach accepted streams, workers attach dialed ones.
pub fn attach(stream: TcpStream, receiver: Arc<dyn InboundMessagesReceiver>) -> Arc<NetworkChannel> {
    attach_with_frame_limit(stream, receiver, MAX_FRAME_BYTES)
}

/// [`attach`] with a custom cap on inbound frame size
///
/// Frames longer than `max_frame_bytes` are logged and dropped without
/// closing the connection.
pub fn attach_with_frame_limit(
    stream: TcpStream,
    receiver: Arc<dyn InboundMessagesReceiver>,
    max_frame_bytes: usize,
) -> Arc<NetworkChannel> {
    let peer = stream
        .peer_addr()
        .map(|addr| addr.to_string())
        .unwrap_or_else(|_| "unknown".to_string());
    if let Err(e) = stream.set_nodelay(true) {
        debug!(peer = %peer, error = %e, "Could not disable Nagle");
    }

    let (channel, endpoint) = NetworkChannel::new(receiver);
    let TransportEndpoint { outbound, shutdown } = endpoint;
    let (reader, writer) = stream.into_split();

    info!(channel_id = %channel.channel_id(), peer = %peer, "TCP channel attached");

    tokio::spawn(write_frames(
        writer,
        outbound,
        shutdown.clone(),
        Arc::downgrade(&channel),
    ));
    tokio::spawn(read_frames(
        BufReader::new(reader),
        max_frame_bytes,
        shutdown,
        Arc::downgrade(&channel),
    ));

    channel
}

/// Dial `address` and wrap the stream into a channel
pub async fn connect(
    address: &str,
    receiver: Arc<dyn InboundMessagesReceiver>,
    connect_timeout: Duration,
) -> std::io::Result<Arc<NetworkChannel>> {
    let stream = match timeout(connect_timeout, TcpStream::connect(address)).await {
        Ok(stream) => stream?,
        Err(_) => {
            return Err(std::io::Error::new(
                std::io::ErrorKind::TimedOut,
                format!("connection to {address} timed out"),
            ))
        }
    };
    Ok(attach(stream, receiver))
}

/// Parse one frame; protocol errors are logged and skipped
pub fn parse_message(frame: &[u8]) -> Option<Message> {
    let frame = frame.trim_ascii();
    if frame.is_empty() {
        return None;
    }

    match serde_json::from_slice::<Message>(frame) {
        Ok(message) => Some(message),
        Err(e) => {
            warn!(
                "Failed to parse message: {} - line: {}",
                e,
                String::from_utf8_lossy(frame)
            );
            None
        }
    }
}

async fn write_frames(
    mut writer: OwnedWriteHalf,
    mut outbound: mpsc::UnboundedReceiver<OutboundFrame>,
    mut shutdown: watch::Receiver<bool>,
    channel: Weak<NetworkChannel>,
) {
    loop {
        tokio::select! {
            frame = outbound.recv() => {
                let Some(frame) = frame else {
                    break;
                };
                let json = match serde_json::to_string(frame.message()) {
                    Ok(json) => json,
                    Err(e) => {
                        error!("Failed to serialize message: {}", e);
                        frame.complete(Err(ChannelError::SendFailed { message: e.to_string() }));
                        continue;
                    }
                };

                let line = format!("{json}\n");
                if let Err(e) = writer.write_all(line.as_bytes()).await {
                    error!("Failed to write message: {}", e);
                    frame.complete(Err(ChannelError::SendFailed { message: e.to_string() }));
                    if let Some(channel) = channel.upgrade() {
                        channel.transport_closed(&format!("write failed: {e}"));
                    }
                    break;
                }
                frame.complete(Ok(()));
            }
            _ = shutdown.changed() => {
                break;
            }
        }
    }

    let _ = writer.shutdown().await;
    debug!("TCP writer finished");
}

async fn read_frames(
    reader: BufReader<OwnedReadHalf>,
    max_frame_bytes: usize,
    mut shutdown: watch::Receiver<bool>,
    channel: Weak<NetworkChannel>,
) {
    let frame_limit = max_frame_bytes as u64 + 1;
    let mut reader = reader.take(frame_limit);
    let mut frame = Vec::new();
    // Inside an oversized frame, dropping bytes up to its newline
    let mut discarding = false;
    let reason = loop {
        reader.set_limit(frame_limit);
        tokio::select! {
            read_result = reader.read_until(b'\n', &mut frame) => {
                match read_result {
                    Ok(0) => break "connection closed by peer".to_string(),
                    Ok(_) => {
                        let complete = frame.last() == Some(&b'\n');
                        if discarding {
                            discarding = !complete;
                        } else if !complete && frame.len() > max_frame_bytes {
                            warn!(limit = max_frame_bytes, "Dropping oversized frame");
                            discarding = true;
                        } else {
                            let Some(channel) = channel.upgrade() else {
                                break "channel dropped".to_string();
                            };
                            if let Some(message) = parse_message(&frame) {
                                channel.deliver_inbound(message);
                            }
                        }
                        frame.clear();
                    }
                    Err(e) => break format!("read failed: {e}"),
                }
            }
            _ = shutdown.changed() => {
                break "channel closed".to_string();
            }
        }
    };

    if let Some(channel) = channel.upgrade() {
        channel.transport_closed(&reason);
    }
    debug!(reason = %reason, "TCP reader finished");
}

/// Locates a broker among a fixed list of TCP addresses
///
/// Addresses are tried in order. Once a transport connects, the worker sends
/// a `WORKER_CONNECTION_REQUEST` and waits for the broker's verdict:
///
/// - `ACK` accepts the connection
/// - `ERROR` rejects it, which is terminal for the worker
/// - timeout or closure during the handshake counts as "not available"
#[derive(Debug, Clone)]
pub struct TcpBrokerLocator {
    addresses: Vec<String>,
    process_id: String,
    worker_id: String,
    location: String,
    max_threads: usize,
    maximum_thread_per_tag: HashMap<String, usize>,
    shared_secret: Option<String>,
    connect_timeout: Duration,
    handshake_timeout: Duration,
}

impl TcpBrokerLocator {
    pub fn from_config(config: &WorkerConfig) -> Self {
        Self {
            addresses: config.broker_addresses.clone(),
            process_id: config.process_id.clone(),
            worker_id: config.worker_id.clone(),
            location: config.location.clone(),
            max_threads: config.max_threads,
            maximum_thread_per_tag: config.maximum_thread_per_tag.clone(),
            shared_secret: config.shared_secret.clone(),
            connect_timeout: config.connect_timeout(),
            handshake_timeout: config.handshake_timeout(),
        }
    }

    pub fn addresses(&self) -> &[String] {
        &self.addresses
    }

    async fn handshake(
        &self,
        address: &str,
        channel: Arc<NetworkChannel>,
    ) -> Result<Arc<dyn Channel>, BrokerLocatorError> {
        let request = Message::worker_connection_request(
            &self.process_id,
            &self.worker_id,
            &self.location,
            self.max_threads,
            &self.maximum_thread_per_tag,
            self.shared_secret.as_deref(),
        );

        match channel.send_with_reply(request, self.handshake_timeout).await {
            Ok(reply) if reply.message_type == MessageType::Ack => {
                info!(address = %address, channel_id = %channel.channel_id(), "Broker accepted connection");
                Ok(channel)
            }
            Ok(reply) => {
                channel.close();
                let reason = reply
                    .string_parameter(params::ERROR)
                    .unwrap_or("no reason given")
                    .to_string();
                warn!(address = %address, reason = %reason, "Broker rejected connection");
                Err(BrokerLocatorError::BrokerRejectedConnection(reason))
            }
            Err(e) => {
                channel.close();
                Err(BrokerLocatorError::BrokerNotAvailable(format!(
                    "handshake with {address} failed: {e}"
                )))
            }
        }
    }
}

#[async_trait]
impl BrokerLocator for TcpBrokerLocator {
    async fn connect(
        &self,
        receiver: Arc<dyn InboundMessagesReceiver>,
    ) -> Result<Arc<dyn Channel>, BrokerLocatorError> {
        if self.addresses.is_empty() {
            return Err(BrokerLocatorError::BrokerNotAvailable(
                "no broker address configured".to_string(),
            ));
        }

        let mut failures = Vec::new();
        for address in &self.addresses {
            match connect(address, receiver.clone(), self.connect_timeout).await {
                Ok(channel) => return self.handshake(address, channel).await,
                Err(e) => {
                    debug!(address = %address, error = %e, "Broker not reachable");
                    failures.push(format!("{address}: {e}"));
                }
            }
        }

        Err(BrokerLocatorError::BrokerNotAvailable(failures.join(", ")))
    }
}
