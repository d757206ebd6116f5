//! Task records and their state machine.
//!
//! A [`Task`] is the observer-visible record of one transfer attempt. It is
//! shared between the registry and whichever session drives it, so it
//! lives behind a short-held lock. Once a task reaches a terminal state it
//! never changes status again; retrying creates a new task.

use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;

use chrono::{DateTime, SecondsFormat, Utc};
use parking_lot::Mutex;
use uuid::Uuid;

use crate::events::TaskView;
use crate::protocol::SessionId;

/// Lifecycle states of a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TaskStatus {
    /// Pull request sent, waiting for the provider
    WaitingResponse,
    /// Offer sent, waiting for the consumer to decide
    WaitingRemote,
    /// Offer received, waiting for the local user
    WaitingConfirm,
    /// Offer being set up
    Preparing,
    /// Computing the digest before offering
    Hashing,
    /// Data frames going out
    Sending,
    /// Data frames coming in
    Receiving,
    /// Everything sent, waiting for the final ack
    WaitingAck,
    /// Done and verified
    Completed,
    /// Gave up; see `last_error`
    Failed,
    /// Stopped locally
    Canceled,
    /// Offer refused by the consumer
    Rejected,
}

impl TaskStatus {
    /// Wire/observer name of the state.
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::WaitingResponse => "waiting_response",
            Self::WaitingRemote => "waiting_remote",
            Self::WaitingConfirm => "waiting_confirm",
            Self::Preparing => "preparing",
            Self::Hashing => "hashing",
            Self::Sending => "sending",
            Self::Receiving => "receiving",
            Self::WaitingAck => "waiting_ack",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Canceled => "canceled",
            Self::Rejected => "rejected",
        }
    }

    /// Whether the state is final.
    pub const fn is_terminal(self) -> bool {
        matches!(
            self,
            Self::Completed | Self::Failed | Self::Canceled | Self::Rejected
        )
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How the transfer was initiated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskOp {
    /// Consumer asked the provider for a file
    Pull,
    /// Provider pushed a file to the consumer
    Offer,
}

impl TaskOp {
    /// Wire name of the op.
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Pull => "pull",
            Self::Offer => "offer",
        }
    }
}

/// Which way the bytes flow from this node's point of view.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// This node sends
    Upload,
    /// This node receives
    Download,
}

impl Direction {
    /// Observer name of the direction.
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Upload => "upload",
            Self::Download => "download",
        }
    }
}

/// Mutable task fields.
#[derive(Debug, Clone)]
pub struct TaskData {
    /// Task identifier
    pub task_id: String,
    /// Bound transfer session
    pub session_id: Option<SessionId>,
    /// Creation time
    pub created_at: DateTime<Utc>,
    /// Last change
    pub updated_at: DateTime<Utc>,
    /// How the transfer started
    pub op: TaskOp,
    /// Byte flow direction
    pub direction: Direction,
    /// Node holding the file
    pub provider: u32,
    /// Node receiving the file
    pub consumer: u32,
    /// Directory on the provider
    pub dir: String,
    /// Name on the provider
    pub name: String,
    /// File size, once known
    pub size: u64,
    /// Expected digest, empty when not hashing
    pub sha256: String,
    /// Whether a digest was requested
    pub want_hash: bool,
    /// Save directory for downloads
    pub local_dir: String,
    /// Save name for downloads
    pub local_name: String,
    /// Final local path for downloads
    pub local_path: Option<PathBuf>,
    /// Source path for uploads
    pub file_path: Option<PathBuf>,
    /// Current state
    pub status: TaskStatus,
    /// Reason for the last failure
    pub last_error: String,
    /// Bytes handed to the transport
    pub sent_bytes: u64,
    /// Bytes acknowledged by the consumer
    pub acked_bytes: u64,
    /// Bytes written contiguously
    pub done_bytes: u64,
}

impl TaskData {
    /// Fresh task data in `status`.
    pub fn new(
        op: TaskOp,
        direction: Direction,
        provider: u32,
        consumer: u32,
        dir: &str,
        name: &str,
        status: TaskStatus,
    ) -> Self {
        let now = Utc::now();
        Self {
            task_id: Uuid::new_v4().to_string(),
            session_id: None,
            created_at: now,
            updated_at: now,
            op,
            direction,
            provider,
            consumer,
            dir: dir.to_string(),
            name: name.to_string(),
            size: 0,
            sha256: String::new(),
            want_hash: false,
            local_dir: String::new(),
            local_name: String::new(),
            local_path: None,
            file_path: None,
            status,
            last_error: String::new(),
            sent_bytes: 0,
            acked_bytes: 0,
            done_bytes: 0,
        }
    }

    /// The other side of the transfer.
    pub const fn peer(&self) -> u32 {
        match self.direction {
            Direction::Upload => self.consumer,
            Direction::Download => self.provider,
        }
    }
}

/// Shared handle to one task.
#[derive(Clone)]
pub struct Task(Arc<Mutex<TaskData>>);

impl Task {
    /// Wrap task data.
    pub fn new(data: TaskData) -> Self {
        Self(Arc::new(Mutex::new(data)))
    }

    /// Task identifier.
    pub fn id(&self) -> String {
        self.0.lock().task_id.clone()
    }

    /// Current state.
    pub fn status(&self) -> TaskStatus {
        self.0.lock().status
    }

    /// Bound session, if any.
    pub fn session_id(&self) -> Option<SessionId> {
        self.0.lock().session_id
    }

    /// Copy of the current fields.
    pub fn data(&self) -> TaskData {
        self.0.lock().clone()
    }

    /// Move to `status`, recording `reason` when non-empty.
    ///
    /// Returns `false` without touching anything if the task is already
    /// terminal.
    pub fn set_status(&self, status: TaskStatus, reason: &str) -> bool {
        self.transition(status, reason, |_| {})
    }

    /// Apply `f` and move to `status` in one step, unless already terminal.
    pub fn transition(
        &self,
        status: TaskStatus,
        reason: &str,
        f: impl FnOnce(&mut TaskData),
    ) -> bool {
        let mut data = self.0.lock();
        if data.status.is_terminal() {
            return false;
        }
        f(&mut data);
        data.status = status;
        let reason = reason.trim();
        if !reason.is_empty() {
            data.last_error = reason.to_string();
        }
        data.updated_at = Utc::now();
        true
    }

    /// Update progress fields without changing state.
    pub fn update(&self, f: impl FnOnce(&mut TaskData)) {
        let mut data = self.0.lock();
        f(&mut data);
        data.updated_at = Utc::now();
    }

    /// Whether both handles point at the same task.
    pub fn ptr_eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }

    /// Observer snapshot.
    pub fn view(&self) -> TaskView {
        let data = self.0.lock();
        let path_text = |p: &Option<PathBuf>| {
            p.as_ref()
                .map(|p| p.display().to_string())
                .unwrap_or_default()
        };
        TaskView {
            task_id: data.task_id.clone(),
            session_id: data
                .session_id
                .map(|sid| sid.to_string())
                .unwrap_or_default(),
            created_at: data.created_at.to_rfc3339_opts(SecondsFormat::Secs, true),
            updated_at: data.updated_at.to_rfc3339_opts(SecondsFormat::Secs, true),
            op: data.op.as_str().to_string(),
            direction: data.direction.as_str().to_string(),
            status: data.status.as_str().to_string(),
            last_error: data.last_error.clone(),
            provider: data.provider,
            consumer: data.consumer,
            peer: data.peer(),
            dir: data.dir.clone(),
            name: data.name.clone(),
            size: data.size,
            sha256: data.sha256.clone(),
            want_hash: data.want_hash,
            local_dir: data.local_dir.clone(),
            local_name: data.local_name.clone(),
            local_path: path_text(&data.local_path),
            file_path: path_text(&data.file_path),
            sent_bytes: data.sent_bytes,
            acked_bytes: data.acked_bytes,
            done_bytes: data.done_bytes,
        }
    }
}

impl fmt::Debug for Task {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let data = self.0.lock();
        f.debug_struct("Task")
            .field("task_id", &data.task_id)
            .field("status", &data.status)
            .finish_non_exhaustive()
    }
}
