//! Receive sessions: reassembly, acks and the final verify-and-rename.
//!
//! Frames for one session are handled under the session's async lock, so
//! the file cursor, the running digest and the reorder buffer always agree.

use std::collections::BTreeMap;
use std::io::SeekFrom;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use sha2::{Digest, Sha256};
use tokio::fs::{File, OpenOptions};
use tokio::io::{AsyncSeekExt, AsyncWriteExt};
use tokio::sync::Mutex;

use super::task::Task;
use crate::config::FileConfig;
use crate::digest::{digest_matches, finish_hex, hash_prefix};
use crate::protocol::SessionId;

/// When cumulative acks go out.
#[derive(Debug, Clone)]
pub struct AckPolicy {
    every_bytes: u64,
    every: Duration,
    last_offset: u64,
    last_at: Instant,
}

impl AckPolicy {
    /// Policy starting from `offset`.
    pub fn new(every_bytes: u64, every: Duration, offset: u64) -> Self {
        Self {
            every_bytes,
            every,
            last_offset: offset,
            last_at: Instant::now(),
        }
    }

    /// Offset to acknowledge now, if any.
    pub fn evaluate(&mut self, cursor: u64, force: bool, now: Instant) -> Option<u64> {
        if cursor < self.last_offset {
            return None;
        }
        let due = force
            || cursor - self.last_offset >= self.every_bytes
            || now.duration_since(self.last_at) >= self.every;
        if !due {
            return None;
        }
        self.last_offset = cursor;
        self.last_at = now;
        Some(cursor)
    }
}

/// How a receive session ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecvEnd {
    /// Verified and renamed into place
    Completed(PathBuf),
    /// Gave up with a short reason
    Failed(&'static str),
}

/// Result of handling one data frame.
#[derive(Debug, Default)]
pub struct Verdict {
    /// Cumulative ack to send
    pub ack: Option<u64>,
    /// Set when the session is over
    pub end: Option<RecvEnd>,
}

/// Fixed parameters of a receive session.
#[derive(Debug, Clone)]
pub struct RecvSpec {
    /// Transfer session
    pub id: SessionId,
    /// Sending node
    pub provider: u32,
    /// This node
    pub consumer: u32,
    /// Where the file ends up
    pub final_path: PathBuf,
    /// Staging file
    pub part_path: PathBuf,
    /// Expected size
    pub size: u64,
    /// Expected digest, empty to skip verification
    pub sha256: String,
    /// Replace an existing final file
    pub overwrite: bool,
    /// Task driven by this session
    pub task: Task,
}

struct Pending {
    body: Vec<u8>,
    fin: bool,
}

struct RecvState {
    file: Option<File>,
    hasher: Option<Sha256>,
    expected: u64,
    pending: BTreeMap<u64, Pending>,
    pending_bytes: u64,
    fin_seen: bool,
    done: bool,
    ack: AckPolicy,
}

impl RecvState {
    async fn append(&mut self, body: &[u8]) -> std::io::Result<()> {
        let file = self
            .file
            .as_mut()
            .ok_or_else(|| std::io::Error::other("staging file closed"))?;
        file.write_all(body).await?;
        if let Some(hasher) = self.hasher.as_mut() {
            hasher.update(body);
        }
        self.expected += body.len() as u64;
        Ok(())
    }

    fn prune_pending(&mut self) {
        self.pending = self.pending.split_off(&self.expected);
        self.pending_bytes = self.pending.values().map(|p| p.body.len() as u64).sum();
    }
}

/// Consumer side of one transfer.
pub struct RecvSession {
    /// Transfer session
    pub id: SessionId,
    /// Sending node
    pub provider: u32,
    /// This node
    pub consumer: u32,
    /// Where the file ends up
    pub final_path: PathBuf,
    /// Staging file
    pub part_path: PathBuf,
    /// Expected size
    pub size: u64,
    /// Expected digest
    pub sha256: String,
    /// Replace an existing final file
    pub overwrite: bool,
    /// Task driven by this session
    pub task: Task,
    max_pending: u64,
    state: Mutex<RecvState>,
}

impl RecvSession {
    /// Wrap an opened staging file positioned at `start_from`.
    pub fn new(
        spec: RecvSpec,
        file: File,
        hasher: Option<Sha256>,
        start_from: u64,
        config: &FileConfig,
    ) -> Self {
        let state = RecvState {
            file: Some(file),
            hasher,
            expected: start_from,
            pending: BTreeMap::new(),
            pending_bytes: 0,
            fin_seen: false,
            done: false,
            ack: AckPolicy::new(config.ack_every_bytes, config.ack_every, start_from),
        };
        Self {
            id: spec.id,
            provider: spec.provider,
            consumer: spec.consumer,
            final_path: spec.final_path,
            part_path: spec.part_path,
            size: spec.size,
            sha256: spec.sha256,
            overwrite: spec.overwrite,
            task: spec.task,
            max_pending: config.max_pending_bytes(),
            state: Mutex::new(state),
        }
    }

    /// Handle one data frame.
    pub async fn accept(&self, offset: u64, fin: bool, body: &[u8]) -> Verdict {
        let mut guard = self.state.lock().await;
        let st = &mut *guard;
        if st.done {
            return Verdict::default();
        }
        let len = body.len() as u64;

        match offset.cmp(&st.expected) {
            std::cmp::Ordering::Less => {
                tracing::debug!(session_id = %self.id, offset, expected = st.expected, "Duplicate data frame");
            }
            std::cmp::Ordering::Greater => {
                if st.pending.contains_key(&offset) {
                    tracing::debug!(session_id = %self.id, offset, "Frame already buffered");
                } else if st.pending_bytes + len > self.max_pending {
                    tracing::debug!(session_id = %self.id, offset, "Reorder buffer full, dropping frame");
                } else {
                    st.pending.insert(
                        offset,
                        Pending {
                            body: body.to_vec(),
                            fin,
                        },
                    );
                    st.pending_bytes += len;
                }
            }
            std::cmp::Ordering::Equal => {
                if st.expected + len > self.size {
                    tracing::debug!(session_id = %self.id, offset, len, "Frame overruns file size");
                } else {
                    if let Some(reason) = self.write_run(st, body, fin).await {
                        return self.fail(st, reason).await;
                    }
                    let done = st.expected;
                    self.task.update(|d| d.done_bytes = done);
                }
            }
        }

        let complete = st.fin_seen && st.expected == self.size;
        let ack = st.ack.evaluate(st.expected, complete, Instant::now());
        let end = if complete {
            Some(self.finish(st).await)
        } else {
            None
        };
        Verdict { ack, end }
    }

    async fn write_run(&self, st: &mut RecvState, body: &[u8], fin: bool) -> Option<&'static str> {
        if let Err(e) = st.append(body).await {
            tracing::warn!(path = %self.part_path.display(), "Failed to write staging file: {e}");
            return Some("write failed");
        }
        st.fin_seen |= fin;

        while let Some(next) = st.pending.remove(&st.expected) {
            st.pending_bytes -= next.body.len() as u64;
            if st.expected + next.body.len() as u64 > self.size {
                return Some("overflow");
            }
            if let Err(e) = st.append(&next.body).await {
                tracing::warn!(path = %self.part_path.display(), "Failed to write staging file: {e}");
                return Some("write failed");
            }
            st.fin_seen |= next.fin;
        }
        st.prune_pending();
        None
    }

    async fn fail(&self, st: &mut RecvState, reason: &'static str) -> Verdict {
        st.done = true;
        if let Some(mut file) = st.file.take() {
            let _ = file.flush().await;
        }
        Verdict {
            ack: None,
            end: Some(RecvEnd::Failed(reason)),
        }
    }

    async fn finish(&self, st: &mut RecvState) -> RecvEnd {
        st.done = true;
        if let Some(mut file) = st.file.take() {
            if file.flush().await.is_err() || file.sync_all().await.is_err() {
                return RecvEnd::Failed("write failed");
            }
        }

        if self.size > 0 {
            match tokio::fs::metadata(&self.part_path).await {
                Ok(meta) if meta.len() == self.size => {}
                _ => return RecvEnd::Failed("integrity failed"),
            }
        }

        if let Some(hasher) = st.hasher.take() {
            if !self.sha256.trim().is_empty() {
                let got = finish_hex(hasher);
                if !digest_matches(&got, &self.sha256) {
                    tracing::warn!(
                        session_id = %self.id,
                        expected = %self.sha256,
                        got = %got,
                        "Digest mismatch, keeping staging file"
                    );
                    return RecvEnd::Failed("integrity failed");
                }
            }
        }

        if self.overwrite {
            if let Err(e) = tokio::fs::remove_file(&self.final_path).await {
                if e.kind() != std::io::ErrorKind::NotFound {
                    tracing::debug!(path = %self.final_path.display(), "Failed to remove old file: {e}");
                }
            }
        }
        if let Err(e) = tokio::fs::rename(&self.part_path, &self.final_path).await {
            tracing::warn!(path = %self.final_path.display(), "Failed to rename staging file: {e}");
            return RecvEnd::Failed("rename failed");
        }
        RecvEnd::Completed(self.final_path.clone())
    }

    /// Release the staging file. Safe to call more than once.
    pub async fn close(&self) {
        let mut st = self.state.lock().await;
        st.done = true;
        if let Some(mut file) = st.file.take() {
            let _ = file.flush().await;
        }
    }
}

impl std::fmt::Debug for RecvSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RecvSession")
            .field("id", &self.id)
            .field("provider", &self.provider)
            .field("part_path", &self.part_path)
            .field("size", &self.size)
            .finish_non_exhaustive()
    }
}

/// Open (or create) a staging file, cut it to `start_from` and position
/// the cursor there. With `hash`, the retained prefix is fed into a fresh
/// hasher.
pub async fn open_part(
    part_path: &Path,
    start_from: u64,
    hash: bool,
) -> Result<(File, Option<Sha256>), &'static str> {
    let mut file = OpenOptions::new()
        .create(true)
        .read(true)
        .write(true)
        .truncate(false)
        .open(part_path)
        .await
        .map_err(|e| {
            tracing::warn!(path = %part_path.display(), "Failed to open staging file: {e}");
            "open failed"
        })?;
    file.set_len(start_from).await.map_err(|_| "truncate failed")?;

    let hasher = if hash {
        let mut hasher = Sha256::new();
        hash_prefix(&mut file, &mut hasher, start_from)
            .await
            .map_err(|_| "hash failed")?;
        Some(hasher)
    } else {
        None
    };
    file.seek(SeekFrom::Start(start_from))
        .await
        .map_err(|_| "seek failed")?;
    Ok((file, hasher))
}
