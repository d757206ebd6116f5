//! Send sessions and the pump that streams data frames.

use std::io::SeekFrom;
use std::path::PathBuf;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::fs::File;
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tokio_util::sync::CancellationToken;

use super::task::{Task, TaskStatus};
use super::FileService;
use crate::protocol::{encode_data, SessionId};
use crate::transport::{Route, Transport};

#[derive(Debug, Default)]
struct SendProgress {
    sha256: String,
    start_from: u64,
    acked_until: u64,
    sent_eof: bool,
}

/// What an incoming ack did to a send session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AckOutcome {
    /// Highest acknowledged offset so far
    pub acked_until: u64,
    /// Everything was sent and acknowledged
    pub complete: bool,
}

/// Provider side of one transfer.
pub struct SendSession {
    /// Transfer session
    pub id: SessionId,
    /// This node
    pub provider: u32,
    /// Receiving node
    pub consumer: u32,
    /// Directory as requested
    pub dir: String,
    /// Name as requested
    pub name: String,
    /// Source file
    pub file_path: PathBuf,
    /// Source size at session start
    pub size: u64,
    /// Task driven by this session
    pub task: Task,
    /// Stops the pump
    pub cancel: CancellationToken,
    progress: Mutex<SendProgress>,
}

impl SendSession {
    /// New session starting at offset zero.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        id: SessionId,
        provider: u32,
        consumer: u32,
        dir: &str,
        name: &str,
        file_path: PathBuf,
        size: u64,
        task: Task,
    ) -> Self {
        Self {
            id,
            provider,
            consumer,
            dir: dir.to_string(),
            name: name.to_string(),
            file_path,
            size,
            task,
            cancel: CancellationToken::new(),
            progress: Mutex::new(SendProgress::default()),
        }
    }

    /// Digest advertised for the file, empty when not hashing.
    pub fn sha256(&self) -> String {
        self.progress.lock().sha256.clone()
    }

    /// Record the digest.
    pub fn set_sha256(&self, sha256: String) {
        self.progress.lock().sha256 = sha256;
    }

    /// Offset the pump starts from.
    pub fn start_from(&self) -> u64 {
        self.progress.lock().start_from
    }

    /// Set the resume point. Bytes before it count as acknowledged.
    pub fn set_start_from(&self, start_from: u64) {
        let mut progress = self.progress.lock();
        progress.start_from = start_from;
        progress.acked_until = progress.acked_until.max(start_from);
    }

    /// Apply a cumulative ack.
    ///
    /// Acks beyond the file size are ignored and the acknowledged offset
    /// never moves backward.
    pub fn on_ack(&self, offset: u64) -> Option<AckOutcome> {
        if offset > self.size {
            return None;
        }
        let mut progress = self.progress.lock();
        progress.acked_until = progress.acked_until.max(offset);
        Some(AckOutcome {
            acked_until: progress.acked_until,
            complete: progress.sent_eof && progress.acked_until == self.size,
        })
    }

    /// Mark the last frame as sent; returns whether the final ack is
    /// already in.
    pub fn mark_eof(&self) -> bool {
        let mut progress = self.progress.lock();
        progress.sent_eof = true;
        progress.acked_until == self.size
    }
}

impl std::fmt::Debug for SendSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SendSession")
            .field("id", &self.id)
            .field("consumer", &self.consumer)
            .field("file_path", &self.file_path)
            .field("size", &self.size)
            .finish_non_exhaustive()
    }
}

enum PumpExit {
    Finished,
    Canceled,
    Failed(&'static str),
}

impl<T: Transport> FileService<T> {
    /// Start streaming `sess` in the background.
    pub(crate) fn spawn_sender(&self, sess: Arc<SendSession>) {
        let service = self.clone();
        tokio::spawn(async move {
            service.run_sender(sess).await;
        });
    }

    async fn run_sender(&self, sess: Arc<SendSession>) {
        let chunk_bytes = self.config().chunk_bytes;
        match self.pump(&sess, chunk_bytes).await {
            PumpExit::Finished => {
                tracing::debug!(session_id = %sess.id, size = sess.size, "All data frames sent");
                let acked = sess.mark_eof();
                self.set_status(&sess.task, TaskStatus::WaitingAck, "");
                if acked {
                    self.complete_send(&sess);
                }
            }
            PumpExit::Canceled => {
                tracing::debug!(session_id = %sess.id, "Send pump canceled");
                self.set_status(&sess.task, TaskStatus::Canceled, "");
            }
            PumpExit::Failed(reason) => {
                self.set_status(&sess.task, TaskStatus::Failed, reason);
                self.inner.registry.remove_send(&sess.id);
            }
        }
    }

    async fn pump(&self, sess: &SendSession, chunk_bytes: usize) -> PumpExit {
        let start = sess.start_from();
        let mut file = match File::open(&sess.file_path).await {
            Ok(file) => file,
            Err(e) => {
                tracing::warn!(path = %sess.file_path.display(), "Failed to open source: {e}");
                return PumpExit::Failed("open failed");
            }
        };
        if start > 0 && file.seek(SeekFrom::Start(start)).await.is_err() {
            return PumpExit::Failed("seek failed");
        }

        let route = Route::message(sess.provider, sess.consumer);
        if sess.size == 0 {
            if sess.cancel.is_cancelled() {
                return PumpExit::Canceled;
            }
            let frame = encode_data(sess.id, 0, true, &[]);
            if let Err(e) = self.inner.transport.send(route, frame).await {
                tracing::warn!(session_id = %sess.id, "Failed to send data frame: {e}");
                return PumpExit::Failed("send failed");
            }
            return PumpExit::Finished;
        }

        let mut buf = vec![0u8; chunk_bytes.max(1)];
        let mut offset = start;
        while offset < sess.size {
            if sess.cancel.is_cancelled() {
                return PumpExit::Canceled;
            }
            let want = usize::try_from(sess.size - offset).map_or(buf.len(), |r| r.min(buf.len()));
            let n = match file.read(&mut buf[..want]).await {
                Ok(0) => {
                    tracing::warn!(path = %sess.file_path.display(), offset, "Source shrank during transfer");
                    return PumpExit::Failed("read failed");
                }
                Ok(n) => n,
                Err(e) => {
                    tracing::warn!(path = %sess.file_path.display(), "Failed to read source: {e}");
                    return PumpExit::Failed("read failed");
                }
            };

            let fin = offset + n as u64 == sess.size;
            let frame = encode_data(sess.id, offset, fin, &buf[..n]);
            if let Err(e) = self.inner.transport.send(route, frame).await {
                tracing::warn!(session_id = %sess.id, "Failed to send data frame: {e}");
                return PumpExit::Failed("send failed");
            }

            offset += n as u64;
            sess.task.update(|d| d.sent_bytes = offset);
            self.emit_tasks(false);
        }
        PumpExit::Finished
    }

    /// Finish a send session whose last byte has been acknowledged.
    pub(crate) fn complete_send(&self, sess: &SendSession) {
        let size = sess.size;
        let changed = sess.task.transition(TaskStatus::Completed, "", |d| {
            d.acked_bytes = size;
        });
        self.inner.registry.remove_send(&sess.id);
        if changed {
            tracing::info!(session_id = %sess.id, path = %sess.file_path.display(), size, "Upload completed");
            self.emit_tasks(true);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transfer::task::{Direction, TaskData, TaskOp};

    fn session(size: u64) -> SendSession {
        let task = Task::new(TaskData::new(
            TaskOp::Pull,
            Direction::Upload,
            1,
            2,
            "",
            "f.bin",
            TaskStatus::Sending,
        ));
        SendSession::new(
            SessionId::random(),
            1,
            2,
            "",
            "f.bin",
            PathBuf::from("f.bin"),
            size,
            task,
        )
    }

    #[test]
    fn test_ack_never_moves_backward() {
        let sess = session(100);
        assert_eq!(sess.on_ack(60).expect("ack").acked_until, 60);
        assert_eq!(sess.on_ack(20).expect("ack").acked_until, 60);
        assert!(sess.on_ack(101).is_none());
    }

    #[test]
    fn test_completion_needs_eof_and_full_ack() {
        let sess = session(100);
        let outcome = sess.on_ack(100).expect("ack");
        assert!(!outcome.complete);
        assert!(sess.mark_eof());

        let sess = session(100);
        assert!(!sess.mark_eof());
        assert!(sess.on_ack(100).expect("ack").complete);
    }

    #[test]
    fn test_resume_point_counts_as_acked() {
        let sess = session(100);
        sess.set_start_from(40);
        assert_eq!(sess.start_from(), 40);
        assert_eq!(sess.on_ack(10).expect("ack").acked_until, 40);
    }
}
