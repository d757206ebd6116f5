//! Observer events.
//!
//! The engine publishes these on a broadcast channel (see
//! [`FileService::subscribe`](crate::transfer::FileService::subscribe)).
//! Field names are camelCase so the events can be forwarded to a UI as
//! JSON unchanged.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Event name for task snapshots.
pub const EVENT_TASKS: &str = "file.tasks";
/// Event name for directory listings.
pub const EVENT_LIST: &str = "file.list";
/// Event name for text previews.
pub const EVENT_TEXT: &str = "file.text";
/// Event name for incoming offers.
pub const EVENT_OFFER: &str = "file.offer";

/// Everything the engine tells its observers.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", content = "data")]
pub enum FileEvent {
    /// Snapshot of every task
    #[serde(rename = "file.tasks")]
    Tasks(TasksEvent),
    /// A directory listing arrived
    #[serde(rename = "file.list")]
    List(ListEvent),
    /// A text preview arrived
    #[serde(rename = "file.text")]
    Text(TextEvent),
    /// A peer offered a file and is waiting for a decision
    #[serde(rename = "file.offer")]
    Offer(OfferEvent),
}

impl FileEvent {
    /// Event name as published on the bus.
    pub const fn name(&self) -> &'static str {
        match self {
            Self::Tasks(_) => EVENT_TASKS,
            Self::List(_) => EVENT_LIST,
            Self::Text(_) => EVENT_TEXT,
            Self::Offer(_) => EVENT_OFFER,
        }
    }
}

/// Snapshot of all tasks.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TasksEvent {
    /// Tasks in creation order
    pub tasks: Vec<TaskView>,
    /// When the snapshot was taken
    pub updated_at: DateTime<Utc>,
}

/// Directory listing from a node.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ListEvent {
    /// Node that was listed
    pub node_id: u32,
    /// Directory that was listed
    pub dir: String,
    /// Response code, `1` on success
    pub code: u16,
    /// Status message
    pub msg: String,
    /// Subdirectories, sorted
    pub dirs: Vec<String>,
    /// Files, sorted
    pub files: Vec<String>,
}

/// Text preview from a node.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TextEvent {
    /// Node the file lives on
    pub node_id: u32,
    /// Directory of the file
    pub dir: String,
    /// File name
    pub name: String,
    /// Response code, `1` on success
    pub code: u16,
    /// Status message
    pub msg: String,
    /// Full file size
    pub size: u64,
    /// Preview text
    pub text: String,
    /// Whether `text` stops before the end of the file
    pub truncated: bool,
}

/// Offer awaiting a decision via `confirm_offer`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OfferEvent {
    /// Session to pass back to `confirm_offer`
    pub session_id: String,
    /// Offering node
    pub provider: u32,
    /// This node
    pub consumer: u32,
    /// Directory on the provider
    pub dir: String,
    /// File name
    pub name: String,
    /// File size
    pub size: u64,
    /// Expected digest, if any
    pub sha256: String,
    /// Suggested save directory
    pub suggest_dir: String,
}

/// Observer-facing copy of a task.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskView {
    /// Task identifier
    pub task_id: String,
    /// Empty until a session is bound
    pub session_id: String,
    /// RFC 3339
    pub created_at: String,
    /// RFC 3339
    pub updated_at: String,
    /// `pull` or `offer`
    pub op: String,
    /// `upload` or `download`
    pub direction: String,
    /// Current state
    pub status: String,
    /// Reason for the last failure
    pub last_error: String,
    /// Node holding the file
    pub provider: u32,
    /// Node receiving the file
    pub consumer: u32,
    /// The other side of the transfer
    pub peer: u32,
    /// Directory on the provider
    pub dir: String,
    /// File name on the provider
    pub name: String,
    /// File size
    pub size: u64,
    /// Expected digest, if any
    pub sha256: String,
    /// Whether a digest was requested
    pub want_hash: bool,
    /// Save directory for downloads
    pub local_dir: String,
    /// Save name for downloads
    pub local_name: String,
    /// Final local path
    pub local_path: String,
    /// Source file for uploads
    pub file_path: String,
    /// Bytes handed to the transport
    pub sent_bytes: u64,
    /// Bytes acknowledged by the consumer
    pub acked_bytes: u64,
    /// Bytes written contiguously
    pub done_bytes: u64,
}
