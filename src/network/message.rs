//! Message envelope exchanged between broker and worker

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;
use uuid::Uuid;

use crate::constants::params;
use crate::executors::TaskExecutorStatus;

/// Loosely typed message payload
pub type Parameters = HashMap<String, Value>;

/// Fixed set of message kinds understood by both ends of a connection
///
/// A frame carrying any other type fails to deserialize and is treated as a
/// protocol error by the transport that read it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MessageType {
    /// Generic positive reply
    Ack,
    /// Generic negative reply, `error` parameter holds the reason
    Error,
    Ping,
    /// One-way notification without protocol meaning
    Notification,
    WorkerConnectionRequest,
    TaskAssigned,
    TaskFinished,
    KillWorker,
    WorkerShutdown,
}

/// Unified message structure for broker/worker communication
///
/// # Examples
///
/// ```rust
/// use dodo_core::network::{Message, MessageType};
///
/// let request = Message::new(MessageType::Ping).with_id("m1");
/// let reply = Message::ack(&request);
///
/// assert_eq!(reply.reply_message_id.as_deref(), Some("m1"));
/// assert!(reply.is_reply());
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    /// Correlation key, assigned by the sending channel when absent
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message_id: Option<String>,

    #[serde(rename = "type")]
    pub message_type: MessageType,

    #[serde(default)]
    pub parameters: Parameters,

    /// Id of the request this message answers
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reply_message_id: Option<String>,
}

impl Message {
    pub fn new(message_type: MessageType) -> Self {
        Self {
            message_id: None,
            message_type,
            parameters: Parameters::new(),
            reply_message_id: None,
        }
    }

    pub fn with_parameters(message_type: MessageType, parameters: Parameters) -> Self {
        Self {
            parameters,
            ..Self::new(message_type)
        }
    }

    /// Set an explicit message id
    pub fn with_id(mut self, message_id: impl Into<String>) -> Self {
        self.message_id = Some(message_id.into());
        self
    }

    /// Add a single parameter
    pub fn with_parameter(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.parameters.insert(key.into(), value.into());
        self
    }

    /// Assign a fresh id if none is set and return the effective id
    pub fn ensure_id(&mut self) -> &str {
        self.message_id
            .get_or_insert_with(|| Uuid::new_v4().to_string())
            .as_str()
    }

    /// Replies are routed to the correlator, never to the general receiver
    pub fn is_reply(&self) -> bool {
        self.reply_message_id.is_some()
    }

    pub fn parameter(&self, key: &str) -> Option<&Value> {
        self.parameters.get(key)
    }

    pub fn string_parameter(&self, key: &str) -> Option<&str> {
        self.parameters.get(key).and_then(Value::as_str)
    }

    pub fn task_id(&self) -> Option<i64> {
        self.parameters.get(params::TASK_ID).and_then(Value::as_i64)
    }

    pub fn task_type(&self) -> Option<&str> {
        self.string_parameter(params::TASK_TYPE)
    }

    /// Task assignment sent by the broker
    pub fn task_assigned(task_id: i64, task_type: &str, mut parameters: Parameters) -> Self {
        parameters.insert(params::TASK_ID.to_string(), Value::from(task_id));
        parameters.insert(params::TASK_TYPE.to_string(), Value::from(task_type));
        Self::with_parameters(MessageType::TaskAssigned, parameters)
    }

    /// Terminal task report sent by the worker
    ///
    /// `results` is omitted from the wire when absent; `error` is present only
    /// for failed tasks.
    pub fn task_finished(
        process_id: &str,
        task_id: i64,
        status: TaskExecutorStatus,
        results: Option<Parameters>,
        error: Option<&str>,
    ) -> Self {
        let mut message = Self::new(MessageType::TaskFinished)
            .with_parameter(params::PROCESS_ID, process_id)
            .with_parameter(params::TASK_ID, task_id)
            .with_parameter(params::STATUS, status.as_str());

        if let Some(results) = results {
            message.parameters.insert(
                params::RESULTS.to_string(),
                Value::Object(results.into_iter().collect()),
            );
        }
        if let Some(error) = error {
            message
                .parameters
                .insert(params::ERROR.to_string(), Value::from(error));
        }
        message
    }

    pub fn kill_worker() -> Self {
        Self::new(MessageType::KillWorker)
    }

    pub fn worker_shutdown(process_id: &str) -> Self {
        Self::new(MessageType::WorkerShutdown).with_parameter(params::PROCESS_ID, process_id)
    }

    /// Handshake request sent by a worker right after the transport connects
    pub fn worker_connection_request(
        process_id: &str,
        worker_id: &str,
        location: &str,
        max_threads: usize,
        maximum_thread_per_tag: &HashMap<String, usize>,
        secret: Option<&str>,
    ) -> Self {
        let mut message = Self::new(MessageType::WorkerConnectionRequest)
            .with_parameter(params::PROCESS_ID, process_id)
            .with_parameter(params::WORKER_ID, worker_id)
            .with_parameter(params::LOCATION, location)
            .with_parameter(params::MAX_THREADS, max_threads);

        if !maximum_thread_per_tag.is_empty() {
            let caps: serde_json::Map<String, Value> = maximum_thread_per_tag
                .iter()
                .map(|(tag, cap)| (tag.clone(), Value::from(*cap)))
                .collect();
            message
                .parameters
                .insert(params::MAX_THREADS_BY_TAG.to_string(), Value::Object(caps));
        }
        if let Some(secret) = secret {
            message
                .parameters
                .insert(params::SECRET.to_string(), Value::from(secret));
        }
        message
    }

    /// Positive reply correlated to `request`
    pub fn ack(request: &Message) -> Self {
        let mut reply = Self::new(MessageType::Ack);
        reply.reply_message_id = request.message_id.clone();
        reply
    }

    /// Negative reply correlated to `request`
    pub fn error(request: &Message, error: &str) -> Self {
        let mut reply = Self::new(MessageType::Error).with_parameter(params::ERROR, error);
        reply.reply_message_id = request.message_id.clone();
        reply
    }
}

impl fmt::Display for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Message{{type={:?}, id={}, replyTo={}, parameters={}}}",
            self.message_type,
            self.message_id.as_deref().unwrap_or("-"),
            self.reply_message_id.as_deref().unwrap_or("-"),
            self.parameters.len()
        )
    }
}
