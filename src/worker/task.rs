//! Task types
//!
//! Tasks travel as `(type tag, opaque payload bytes)`. Inside the process
//! they are a closed [`Task`] enum; [`TaskKind`] is the tag registry and
//! [`Task::decode`] the decoder that turns a delivered message back into a
//! typed task.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use uuid::Uuid;

use super::error::{QueueError, TaskError};
use super::state::TaskState;

pub const TASK_SEND_VERIFY_EMAIL: &str = "send-verify-email";

/// Default retry budget when a producer does not set one
pub const DEFAULT_MAX_RETRY: u32 = 25;

// ============================================================================
// Queue classes
// ============================================================================

/// Priority partition of the queue backend
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QueueClass {
    Critical,
    Default,
    Low,
}

impl QueueClass {
    pub const ALL: [QueueClass; 3] = [QueueClass::Critical, QueueClass::Default, QueueClass::Low];

    pub fn as_str(&self) -> &'static str {
        match self {
            QueueClass::Critical => "critical",
            QueueClass::Default => "default",
            QueueClass::Low => "low",
        }
    }
}

impl fmt::Display for QueueClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ============================================================================
// Task registry
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TaskKind {
    SendVerifyEmail,
}

impl TaskKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskKind::SendVerifyEmail => TASK_SEND_VERIFY_EMAIL,
        }
    }

    pub fn from_tag(tag: &str) -> Option<Self> {
        match tag {
            TASK_SEND_VERIFY_EMAIL => Some(TaskKind::SendVerifyEmail),
            _ => None,
        }
    }
}

impl fmt::Display for TaskKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PayloadSendVerifyEmail {
    pub username: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Task {
    SendVerifyEmail(PayloadSendVerifyEmail),
}

impl Task {
    pub fn kind(&self) -> TaskKind {
        match self {
            Task::SendVerifyEmail(_) => TaskKind::SendVerifyEmail,
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>, QueueError> {
        let bytes = match self {
            Task::SendVerifyEmail(payload) => serde_json::to_vec(payload)?,
        };
        Ok(bytes)
    }

    /// Decode a delivered payload
    ///
    /// An unknown tag or malformed payload is permanent: the bytes will never
    /// become valid on a later attempt.
    pub fn decode(tag: &str, payload: &[u8]) -> Result<Task, TaskError> {
        let kind = TaskKind::from_tag(tag)
            .ok_or_else(|| TaskError::Permanent(format!("unknown task type: {tag}")))?;
        match kind {
            TaskKind::SendVerifyEmail => serde_json::from_slice(payload)
                .map(Task::SendVerifyEmail)
                .map_err(|e| TaskError::Permanent(format!("unmarshal payload: {e}"))),
        }
    }
}

// ============================================================================
// Delivery options
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EnqueueOptions {
    pub queue: QueueClass,
    pub max_retry: u32,
    /// Earliest delivery time; `None` means immediately
    pub not_before: Option<DateTime<Utc>>,
}

impl Default for EnqueueOptions {
    fn default() -> Self {
        Self {
            queue: QueueClass::Default,
            max_retry: DEFAULT_MAX_RETRY,
            not_before: None,
        }
    }
}

impl EnqueueOptions {
    pub fn queue(mut self, queue: QueueClass) -> Self {
        self.queue = queue;
        self
    }

    pub fn max_retry(mut self, max_retry: u32) -> Self {
        self.max_retry = max_retry;
        self
    }

    pub fn process_at(mut self, at: DateTime<Utc>) -> Self {
        self.not_before = Some(at);
        self
    }

    /// Delay delivery relative to now
    pub fn process_in(self, delay: Duration) -> Self {
        let now = Utc::now();
        let at = chrono::Duration::from_std(delay)
            .ok()
            .and_then(|d| now.checked_add_signed(d))
            .unwrap_or(DateTime::<Utc>::MAX_UTC);
        self.process_at(at)
    }
}

// ============================================================================
// Wire message
// ============================================================================

/// Task as stored by the queue backend
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskMessage {
    pub id: Uuid,
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(with = "base64_bytes")]
    pub payload: Vec<u8>,
    pub queue: QueueClass,
    pub max_retry: u32,
    pub retry_count: u32,
    pub not_before: DateTime<Utc>,
    pub enqueued_at: DateTime<Utc>,
    #[serde(default)]
    pub last_error: Option<String>,
}

impl TaskMessage {
    pub fn new(task: &Task, opts: &EnqueueOptions) -> Result<Self, QueueError> {
        Ok(Self::raw(task.kind().as_str(), task.encode()?, opts))
    }

    /// Build a message from an arbitrary tag and payload
    pub fn raw(kind: &str, payload: Vec<u8>, opts: &EnqueueOptions) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            kind: kind.to_string(),
            payload,
            queue: opts.queue,
            max_retry: opts.max_retry,
            retry_count: 0,
            not_before: opts.not_before.unwrap_or(now),
            enqueued_at: now,
            last_error: None,
        }
    }

    /// State a freshly enqueued message starts in
    pub fn initial_state(&self, now: DateTime<Utc>) -> TaskState {
        if self.not_before > now {
            TaskState::Scheduled
        } else {
            TaskState::Pending
        }
    }

    pub fn info(&self, state: TaskState) -> TaskInfo {
        TaskInfo {
            id: self.id,
            kind: self.kind.clone(),
            queue: self.queue,
            max_retry: self.max_retry,
            retry_count: self.retry_count,
            state,
            next_process_at: self.not_before,
            last_error: self.last_error.clone(),
        }
    }
}

/// Snapshot of a task handed back to producers and inspectors
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TaskInfo {
    pub id: Uuid,
    pub kind: String,
    pub queue: QueueClass,
    pub max_retry: u32,
    pub retry_count: u32,
    pub state: TaskState,
    pub next_process_at: DateTime<Utc>,
    pub last_error: Option<String>,
}

mod base64_bytes {
    use base64::{Engine, engine::general_purpose::STANDARD};
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        STANDARD
            .decode(encoded)
            .map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tag_registry() {
        assert_eq!(
            TaskKind::from_tag("send-verify-email"),
            Some(TaskKind::SendVerifyEmail)
        );
        assert_eq!(TaskKind::from_tag("task:unknown"), None);
        assert_eq!(TaskKind::SendVerifyEmail.to_string(), TASK_SEND_VERIFY_EMAIL);
    }

    #[test]
    fn test_decode_valid_payload() {
        let task = Task::decode(TASK_SEND_VERIFY_EMAIL, br#"{"username":"alice"}"#).unwrap();
        assert_eq!(
            task,
            Task::SendVerifyEmail(PayloadSendVerifyEmail {
                username: "alice".into()
            })
        );
    }

    #[test]
    fn test_decode_garbage_is_permanent() {
        let err = Task::decode(TASK_SEND_VERIFY_EMAIL, b"{not json").unwrap_err();
        assert!(err.is_permanent());
    }

    #[test]
    fn test_decode_unknown_type_is_permanent() {
        let err = Task::decode("task:mystery", b"{}").unwrap_err();
        assert!(err.is_permanent());
    }

    #[test]
    fn test_message_defaults() {
        let task = Task::SendVerifyEmail(PayloadSendVerifyEmail {
            username: "alice".into(),
        });
        let msg = TaskMessage::new(&task, &EnqueueOptions::default()).unwrap();
        assert_eq!(msg.queue, QueueClass::Default);
        assert_eq!(msg.max_retry, DEFAULT_MAX_RETRY);
        assert_eq!(msg.retry_count, 0);
        assert_eq!(msg.initial_state(Utc::now()), TaskState::Pending);
    }

    #[test]
    fn test_delayed_message_is_scheduled() {
        let opts = EnqueueOptions::default()
            .queue(QueueClass::Critical)
            .process_in(Duration::from_secs(10));
        let msg = TaskMessage::raw(TASK_SEND_VERIFY_EMAIL, vec![], &opts);
        assert_eq!(msg.initial_state(Utc::now()), TaskState::Scheduled);
        assert!(msg.not_before > msg.enqueued_at);
    }

    #[test]
    fn test_payload_stored_as_base64() {
        let msg = TaskMessage::raw("x", vec![0xff, 0x00, 0x7b], &EnqueueOptions::default());
        let json = serde_json::to_string(&msg).unwrap();
        assert!(json.contains(r#""payload":"/wB7""#));
        let back: TaskMessage = serde_json::from_str(&json).unwrap();
        assert_eq!(back.payload, vec![0xff, 0x00, 0x7b]);
    }

    #[test]
    fn test_queue_class_names() {
        assert_eq!(
            serde_json::to_string(&QueueClass::Critical).unwrap(),
            r#""critical""#
        );
        assert_eq!(QueueClass::Low.as_str(), "low");
    }
}
