//! Shared helpers for integration tests: recording receivers, an in-process
//! broker locator and a loopback TCP broker.

#![allow(dead_code)]

use async_trait::async_trait;
use dodo_core::network::{
    local, tcp, Channel, InboundMessagesReceiver, Message, MessageType, NetworkChannel,
};
use dodo_core::worker::{BrokerLocator, BrokerLocatorError};
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::mpsc;

pub const WAIT: Duration = Duration::from_secs(5);

/// Receiver that forwards everything it sees to the test
pub struct Recorder {
    messages: mpsc::UnboundedSender<Message>,
    closed: mpsc::UnboundedSender<()>,
}

impl InboundMessagesReceiver for Recorder {
    fn message_received(&self, message: Message) -> anyhow::Result<()> {
        let _ = self.messages.send(message);
        Ok(())
    }

    fn channel_closed(&self) {
        let _ = self.closed.send(());
    }
}

pub struct Recorded {
    pub messages: mpsc::UnboundedReceiver<Message>,
    pub closed: mpsc::UnboundedReceiver<()>,
}

pub fn recorder() -> (Arc<Recorder>, Recorded) {
    let (messages, messages_rx) = mpsc::unbounded_channel();
    let (closed, closed_rx) = mpsc::unbounded_channel();
    (
        Arc::new(Recorder { messages, closed }),
        Recorded {
            messages: messages_rx,
            closed: closed_rx,
        },
    )
}

pub async fn next_message(messages: &mut mpsc::UnboundedReceiver<Message>) -> Message {
    tokio::time::timeout(WAIT, messages.recv())
        .await
        .expect("no message within timeout")
        .expect("message stream ended")
}

/// Next message of the given type, skipping others
pub async fn next_of_type(
    messages: &mut mpsc::UnboundedReceiver<Message>,
    message_type: MessageType,
) -> Message {
    loop {
        let message = next_message(messages).await;
        if message.message_type == message_type {
            return message;
        }
    }
}

pub async fn wait_until(mut condition: impl FnMut() -> bool) {
    let deadline = tokio::time::Instant::now() + WAIT;
    while !condition() {
        assert!(
            tokio::time::Instant::now() < deadline,
            "condition not reached within timeout"
        );
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

/// Locator handing out in-process channels whose broker side records
/// everything the worker sends
pub struct LocalBroker {
    inbox: Arc<Recorder>,
    channels: Mutex<Vec<Arc<NetworkChannel>>>,
}

impl LocalBroker {
    pub fn new() -> (Arc<Self>, Recorded) {
        let (inbox, recorded) = recorder();
        (
            Arc::new(Self {
                inbox,
                channels: Mutex::new(Vec::new()),
            }),
            recorded,
        )
    }

    pub fn connections(&self) -> usize {
        self.channels.lock().len()
    }

    /// Broker side of the most recent connection, once there is one
    pub async fn channel(&self) -> Arc<NetworkChannel> {
        wait_until(|| self.connections() > 0).await;
        let channels = self.channels.lock();
        channels[channels.len() - 1].clone()
    }
}

#[async_trait]
impl BrokerLocator for LocalBroker {
    async fn connect(
        &self,
        receiver: Arc<dyn InboundMessagesReceiver>,
    ) -> Result<Arc<dyn Channel>, BrokerLocatorError> {
        let (worker, broker) = local::channel_pair(receiver, self.inbox.clone());
        self.channels.lock().push(broker);
        Ok(worker)
    }
}

/// How the loopback broker answers connection requests
#[derive(Debug, Clone, Copy)]
pub enum Handshake {
    Accept,
    Reject(&'static str),
    Ignore,
}

/// TCP broker on 127.0.0.1 speaking just enough protocol for the tests
pub struct FakeBroker {
    pub address: String,
    pub messages: mpsc::UnboundedReceiver<Message>,
    channels: Arc<Mutex<Vec<Arc<NetworkChannel>>>>,
}

impl FakeBroker {
    pub async fn start(handshake: Handshake) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = listener.local_addr().unwrap().to_string();
        let (forward, messages) = mpsc::unbounded_channel();
        let channels = Arc::new(Mutex::new(Vec::new()));

        let accepted = channels.clone();
        tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                let (receiver, mut recorded) = recorder();
                let channel = tcp::attach(stream, receiver);
                accepted.lock().push(channel.clone());

                let forward = forward.clone();
                tokio::spawn(async move {
                    while let Some(message) = recorded.messages.recv().await {
                        if message.message_type == MessageType::WorkerConnectionRequest {
                            match handshake {
                                Handshake::Accept => {
                                    channel.send_reply(&message, Message::ack(&message))
                                }
                                Handshake::Reject(reason) => {
                                    channel.send_reply(&message, Message::error(&message, reason))
                                }
                                Handshake::Ignore => {}
                            }
                        }
                        let _ = forward.send(message);
                    }
                });
            }
        });

        Self {
            address,
            messages,
            channels,
        }
    }

    pub fn connections(&self) -> usize {
        self.channels.lock().len()
    }

    pub async fn channel(&self, index: usize) -> Arc<NetworkChannel> {
        wait_until(|| self.connections() > index).await;
        self.channels.lock()[index].clone()
    }
}
