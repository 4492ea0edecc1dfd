//! Channel behavior over the in-process transport: request/reply, close
//! semantics, timeouts and receiver failures.

mod common;

use common::{next_message, recorder, wait_until, WAIT};
use dodo_core::network::{
    local, Channel, ChannelError, InboundMessagesReceiver, Message, MessageType, NetworkChannel,
};
use futures::future::join_all;
use std::sync::{Arc, OnceLock, Weak};
use std::time::{Duration, Instant};
use tokio::sync::mpsc;

/// Answers every PING with an ACK echoing the request's parameters, after
/// an optional delay
#[derive(Default)]
struct Responder {
    channel: OnceLock<Weak<NetworkChannel>>,
    delay: Duration,
}

impl InboundMessagesReceiver for Responder {
    fn message_received(&self, message: Message) -> anyhow::Result<()> {
        if message.message_type != MessageType::Ping {
            return Ok(());
        }
        let Some(channel) = self.channel.get().and_then(Weak::upgrade) else {
            anyhow::bail!("responder has no channel");
        };
        std::thread::sleep(self.delay);
        let mut reply = Message::new(MessageType::Ack).with_parameter("payload", "PONG");
        reply.parameters.extend(message.parameters.clone());
        channel.send_reply(&message, reply);
        Ok(())
    }
}

/// Fails on every message
struct Failing;

impl InboundMessagesReceiver for Failing {
    fn message_received(&self, _message: Message) -> anyhow::Result<()> {
        anyhow::bail!("receiver cannot handle anything")
    }
}

/// Requesting side and the responding side, which must be kept alive
fn responding_pair() -> (Arc<NetworkChannel>, Arc<NetworkChannel>) {
    let (left, right, _requester) = delayed_responding_pair(Duration::ZERO);
    (left, right)
}

/// Like [`responding_pair`], also recording what reaches the requesting
/// side's receiver
fn delayed_responding_pair(
    delay: Duration,
) -> (Arc<NetworkChannel>, Arc<NetworkChannel>, common::Recorded) {
    let (requester_receiver, requester) = recorder();
    let responder = Arc::new(Responder {
        delay,
        ..Responder::default()
    });
    let (left, right) = local::channel_pair(requester_receiver, responder.clone());
    let _ = responder.channel.set(Arc::downgrade(&right));
    (left, right, requester)
}

fn reply_sink() -> (
    dodo_core::network::ReplyCallback,
    mpsc::UnboundedReceiver<(Option<Message>, Option<ChannelError>)>,
) {
    let (tx, rx) = mpsc::unbounded_channel();
    (
        Box::new(move |_original, reply, error| {
            let _ = tx.send((reply, error));
        }),
        rx,
    )
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_request_receives_correlated_reply() {
    let (channel, _responder) = responding_pair();

    let reply = channel
        .send_with_reply(Message::new(MessageType::Ping).with_id("m1"), WAIT)
        .await
        .unwrap();

    assert_eq!(reply.message_type, MessageType::Ack);
    assert_eq!(reply.reply_message_id.as_deref(), Some("m1"));
    assert_eq!(reply.string_parameter("payload"), Some("PONG"));
    assert_eq!(channel.pending_requests(), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_requests_get_their_own_replies() {
    let (channel, _responder) = responding_pair();

    let requests = (0..50).map(|seq| {
        let channel = channel.clone();
        async move {
            let reply = channel
                .send_with_reply(
                    Message::new(MessageType::Ping).with_parameter("seq", seq),
                    WAIT,
                )
                .await
                .unwrap();
            (seq, reply)
        }
    });

    for (seq, reply) in join_all(requests).await {
        assert_eq!(reply.parameter("seq").unwrap(), seq);
    }
    assert_eq!(channel.pending_requests(), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_close_fails_every_pending_request_once() {
    let (left_receiver, _left) = recorder();
    let (right_receiver, mut right) = recorder();
    let (left, _right) = local::channel_pair(left_receiver, right_receiver);

    let (tx, mut rx) = mpsc::unbounded_channel();
    for i in 0..10 {
        let tx = tx.clone();
        left.send_with_async_reply(
            Message::new(MessageType::Ping).with_id(format!("req-{i}")),
            Box::new(move |original, reply, error| {
                let _ = tx.send((original.message_id, reply, error));
            }),
        );
    }
    drop(tx);

    // Requests reach the peer, which never answers
    for _ in 0..10 {
        next_message(&mut right.messages).await;
    }
    assert_eq!(left.pending_requests(), 10);

    left.close();

    let mut failed = Vec::new();
    while let Some((id, reply, error)) = tokio::time::timeout(WAIT, rx.recv()).await.unwrap() {
        assert!(reply.is_none());
        assert_eq!(error, Some(ChannelError::Closed));
        failed.push(id.unwrap());
    }
    failed.sort();
    failed.dedup();
    assert_eq!(failed.len(), 10);
    assert_eq!(left.pending_requests(), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_request_times_out_without_reply() {
    let (left_receiver, _left) = recorder();
    let (right_receiver, _right) = recorder();
    let (left, _right_channel) = local::channel_pair(left_receiver, right_receiver);

    let started = Instant::now();
    let result = left
        .send_with_reply(
            Message::new(MessageType::Ping),
            Duration::from_millis(50),
        )
        .await;
    let elapsed = started.elapsed();

    assert_eq!(result, Err(ChannelError::Timeout { timeout_ms: 50 }));
    assert!(elapsed >= Duration::from_millis(50));
    assert!(elapsed < Duration::from_millis(150), "took {elapsed:?}");

    // The registration outlives the wait until the channel closes
    assert_eq!(left.pending_requests(), 1);
    left.close();
    assert_eq!(left.pending_requests(), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_late_reply_after_timeout_is_absorbed() {
    let (channel, _responder, mut requester) =
        delayed_responding_pair(Duration::from_millis(100));

    let result = channel
        .send_with_reply(
            Message::new(MessageType::Ping).with_id("late"),
            Duration::from_millis(50),
        )
        .await;
    assert_eq!(result, Err(ChannelError::Timeout { timeout_ms: 50 }));
    assert_eq!(channel.pending_requests(), 1);

    // The reply resolves the abandoned registration instead of reaching the
    // general receiver
    let watched = channel.clone();
    wait_until(move || watched.pending_requests() == 0).await;
    assert!(
        tokio::time::timeout(Duration::from_millis(100), requester.messages.recv())
            .await
            .is_err()
    );
    assert!(!channel.is_closed());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_reply_to_message_without_id_is_discarded() {
    let (left_receiver, _left) = recorder();
    let (right_receiver, mut right) = recorder();
    let (left, _right_channel) = local::channel_pair(left_receiver, right_receiver);

    left.send_reply(
        &Message::new(MessageType::Ping),
        Message::new(MessageType::Ack).with_parameter("payload", "orphan"),
    );
    left.send_one_way(Message::new(MessageType::Notification), Box::new(|_, _| {}));

    // Only the notification shows up on the other side
    let message = next_message(&mut right.messages).await;
    assert_eq!(message.message_type, MessageType::Notification);
    assert!(
        tokio::time::timeout(Duration::from_millis(100), right.messages.recv())
            .await
            .is_err()
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_sends_on_closed_channel_report_not_active() {
    let (left_receiver, _left) = recorder();
    let (right_receiver, mut right) = recorder();
    let (left, _right_channel) = local::channel_pair(left_receiver, right_receiver);
    left.close();
    assert!(left.is_closed());

    let (tx, mut rx) = mpsc::unbounded_channel();
    left.send_one_way(
        Message::new(MessageType::Notification),
        Box::new(move |_, error| {
            let _ = tx.send(error);
        }),
    );
    let error = tokio::time::timeout(WAIT, rx.recv()).await.unwrap().unwrap();
    assert_eq!(error, Some(ChannelError::NotActive));

    let (callback, mut replies) = reply_sink();
    left.send_with_async_reply(Message::new(MessageType::Ping), callback);
    let (reply, error) = tokio::time::timeout(WAIT, replies.recv())
        .await
        .unwrap()
        .unwrap();
    assert!(reply.is_none());
    assert_eq!(error, Some(ChannelError::NotActive));

    // Replies on a closed channel are silently discarded
    left.send_reply(
        &Message::new(MessageType::Ping).with_id("x"),
        Message::new(MessageType::Ack),
    );
    assert!(
        tokio::time::timeout(Duration::from_millis(100), right.messages.recv())
            .await
            .map_or(true, |message| message.is_none())
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_close_is_idempotent_and_notifies_receiver_once() {
    let (left_receiver, mut left) = recorder();
    let (right_receiver, _right) = recorder();
    let (channel, _peer) = local::channel_pair(left_receiver, right_receiver);

    channel.close();
    channel.close();

    tokio::time::timeout(WAIT, left.closed.recv())
        .await
        .unwrap()
        .unwrap();
    assert!(
        tokio::time::timeout(Duration::from_millis(100), left.closed.recv())
            .await
            .is_err()
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_receiver_failure_closes_channel() {
    let (left_receiver, mut left) = recorder();
    let (left_channel, right_channel) = local::channel_pair(left_receiver, Arc::new(Failing));

    left_channel.send_one_way(Message::new(MessageType::Notification), Box::new(|_, _| {}));

    tokio::time::timeout(WAIT, left.closed.recv())
        .await
        .unwrap()
        .unwrap();
    assert!(right_channel.is_closed());
    assert!(left_channel.is_closed());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_unmatched_reply_is_dropped() {
    let (left_receiver, mut left) = recorder();
    let (right_receiver, _right) = recorder();
    let (left_channel, right_channel) = local::channel_pair(left_receiver, right_receiver);

    let mut stray = Message::new(MessageType::Ack);
    stray.reply_message_id = Some("nobody-asked".to_string());
    right_channel.send_one_way(stray, Box::new(|_, _| {}));
    right_channel.send_one_way(Message::new(MessageType::Notification), Box::new(|_, _| {}));

    // Only the notification reaches the receiver
    let message = next_message(&mut left.messages).await;
    assert_eq!(message.message_type, MessageType::Notification);
    assert!(!left_channel.is_closed());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_abandoned_requests_can_be_expired() {
    let (left_receiver, _left) = recorder();
    let (right_receiver, _right) = recorder();
    let (left, _right_channel) = local::channel_pair(left_receiver, right_receiver);

    let (callback, mut replies) = reply_sink();
    left.send_with_async_reply(Message::new(MessageType::Ping), callback);
    assert_eq!(left.expire_pending(Duration::from_secs(60)), 0);

    tokio::time::sleep(Duration::from_millis(30)).await;
    assert_eq!(left.expire_pending(Duration::from_millis(20)), 1);
    assert_eq!(left.pending_requests(), 0);

    let (reply, error) = tokio::time::timeout(WAIT, replies.recv())
        .await
        .unwrap()
        .unwrap();
    assert!(reply.is_none());
    assert_eq!(error, Some(ChannelError::Timeout { timeout_ms: 20 }));
}
