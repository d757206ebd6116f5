//! Transfer engine.
//!
//! [`FileService`] is the single entry point. The host session feeds it
//! [`TransportEvent`]s (directly through [`FileService::handle_event`] or
//! by handing a channel to [`FileService::run`]); the service answers peers
//! through the [`Transport`] it was built with and reports progress to
//! observers on a broadcast channel.
//!
//! ## Pull
//!
//! ```text
//! consumer                     hub                    provider
//!    │── read{pull} ───────────▶│──────────────────────▶│
//!    │◀───────────────────────── read_resp{session_id} ─│
//!    │◀──────────────────────────────────── data ... ───│
//!    │── ack ──────────────────────────────────────────▶│
//! ```
//!
//! An offer is the same exchange started by the provider with
//! `write{offer}` and answered by `write_resp{accept}`.

mod handlers;
mod janitor;
pub mod receiver;
pub mod registry;
pub mod sender;
pub mod task;

use std::sync::Arc;

use chrono::Utc;
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use tokio::sync::{broadcast, mpsc};
use tokio_util::sync::CancellationToken;

use crate::config::{FileConfig, MAX_CHUNK_BYTES};
use crate::digest::sha256_file;
use crate::error::{Error, Result};
use crate::events::{FileEvent, ListEvent, TaskView, TasksEvent, TextEvent};
use crate::local;
use crate::path::{normalize_dir, resolve_paths, sanitize_dir, sanitize_name};
use crate::protocol::{encode_ctrl, Action, ReadOp, ReadReq, SessionId, WriteReq, CODE_OK, OP_OFFER};
use crate::transport::{InboundFrame, Route, Transport, TransportEvent};

pub use janitor::sweep_once;
pub use registry::Registry;
pub use sender::SendSession;
pub use receiver::RecvSession;
pub use task::{Direction, Task, TaskData, TaskOp, TaskStatus};

use registry::PullKey;

/// Observer channel capacity.
const EVENT_CAPACITY: usize = 256;

/// Reason recorded when the session drops without saying why.
const DEFAULT_DISCONNECT_REASON: &str = "connection closed";

#[derive(Debug, Clone, Copy, Default)]
struct Identity {
    node: u32,
    hub: u32,
}

struct Inner<T> {
    transport: T,
    config: RwLock<FileConfig>,
    identity: RwLock<Identity>,
    registry: Registry,
    events: broadcast::Sender<FileEvent>,
    janitor: Mutex<Option<CancellationToken>>,
}

/// File transfer service for one node.
///
/// Cloning is cheap; all clones share the same state.
pub struct FileService<T: Transport> {
    inner: Arc<Inner<T>>,
}

impl<T: Transport> Clone for FileService<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T: Transport> std::fmt::Debug for FileService<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FileService")
            .field("identity", &*self.inner.identity.read())
            .field("registry", &self.inner.registry)
            .finish_non_exhaustive()
    }
}

impl<T: Transport> FileService<T> {
    /// Create a service sending through `transport`.
    ///
    /// `chunk_bytes` above [`MAX_CHUNK_BYTES`] is clamped.
    pub fn new(transport: T, config: FileConfig) -> Self {
        let mut config = config.normalized();
        config.chunk_bytes = config.chunk_bytes.min(MAX_CHUNK_BYTES);
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            inner: Arc::new(Inner {
                transport,
                config: RwLock::new(config),
                identity: RwLock::new(Identity::default()),
                registry: Registry::new(),
                events,
                janitor: Mutex::new(None),
            }),
        }
    }

    /// Set this node's id and the hub's id.
    pub fn set_identity(&self, node: u32, hub: u32) {
        *self.inner.identity.write() = Identity { node, hub };
    }

    /// This node's id, `0` until known.
    pub fn node_id(&self) -> u32 {
        self.inner.identity.read().node
    }

    /// Replace the configuration. Running sessions keep their settings.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidConfig`] if the normalized config is invalid.
    pub fn set_config(&self, config: FileConfig) -> Result<()> {
        let config = config.normalized();
        config.validate()?;
        *self.inner.config.write() = config;
        Ok(())
    }

    /// Current configuration.
    pub fn config(&self) -> FileConfig {
        self.inner.config.read().clone()
    }

    /// Subscribe to observer events.
    pub fn subscribe(&self) -> broadcast::Receiver<FileEvent> {
        self.inner.events.subscribe()
    }

    /// Number of live send and receive sessions.
    pub fn active_sessions(&self) -> usize {
        self.inner.registry.total_sessions()
    }

    /// Process one event from the host session.
    pub async fn handle_event(&self, event: TransportEvent) {
        match event {
            TransportEvent::Frame(frame) => self.handle_frame(frame).await,
            TransportEvent::Connected => tracing::debug!("Session connected"),
            TransportEvent::Disconnected(reason) | TransportEvent::Error(reason) => {
                self.on_disconnect(&reason).await;
            }
        }
    }

    /// Process events until the channel closes, then stop background work.
    pub async fn run(self, mut events: mpsc::Receiver<TransportEvent>) {
        while let Some(event) = events.recv().await {
            self.handle_event(event).await;
        }
        tracing::debug!("Event channel closed, stopping file service");
        self.close();
    }

    /// List `dir` on `target`.
    ///
    /// A local target is answered immediately; the listing (or the error)
    /// is published as a [`FileEvent::List`] either way. Remote listings
    /// arrive later as events.
    ///
    /// # Errors
    ///
    /// Returns an error for a local listing failure, missing identity, or
    /// a transport failure.
    pub async fn list(&self, target: u32, dir: &str, recursive: bool) -> Result<()> {
        if target == 0 {
            return Err(Error::MissingArgument("target"));
        }
        let dir = normalize_dir(dir);
        if target == self.node_id() {
            let result = local::list(&self.config().base_dir, &dir).await;
            let mut event = ListEvent {
                node_id: target,
                dir: dir.clone(),
                ..ListEvent::default()
            };
            match &result {
                Ok(listing) => {
                    event.code = CODE_OK;
                    event.msg = "ok".to_string();
                    event.dirs.clone_from(&listing.dirs);
                    event.files.clone_from(&listing.files);
                }
                Err(e) => {
                    event.code = e.response_code().unwrap_or(404);
                    event.msg = e.to_string();
                }
            }
            self.publish(FileEvent::List(event));
            return result.map(|_| ());
        }

        let req = ReadReq {
            op: ReadOp::List.as_str().to_string(),
            target,
            dir,
            recursive,
            ..ReadReq::default()
        };
        self.send_to_hub(Action::Read, &req).await
    }

    /// Preview up to `max_bytes` of `dir/name` on `target` as text.
    ///
    /// Local targets behave like [`list`](Self::list).
    ///
    /// # Errors
    ///
    /// Returns an error for a local read failure, missing identity, or a
    /// transport failure.
    pub async fn read_text(&self, target: u32, dir: &str, name: &str, max_bytes: u32) -> Result<()> {
        if target == 0 {
            return Err(Error::MissingArgument("target"));
        }
        let dir = normalize_dir(dir);
        let name = name.trim().to_string();
        if target == self.node_id() {
            let result = local::read_text(&self.config().base_dir, &dir, &name, max_bytes).await;
            let mut event = TextEvent {
                node_id: target,
                dir,
                name,
                ..TextEvent::default()
            };
            match &result {
                Ok(preview) => {
                    event.code = CODE_OK;
                    event.msg = "ok".to_string();
                    event.size = preview.size;
                    event.text.clone_from(&preview.text);
                    event.truncated = preview.truncated;
                }
                Err(e) => {
                    event.code = 415;
                    event.msg = e.to_string();
                }
            }
            self.publish(FileEvent::Text(event));
            return result.map(|_| ());
        }

        let req = ReadReq {
            op: ReadOp::ReadText.as_str().to_string(),
            target,
            dir,
            name,
            max_bytes,
            ..ReadReq::default()
        };
        self.send_to_hub(Action::Read, &req).await
    }

    /// Download `dir/name` from `provider`.
    ///
    /// The file is saved as `save_dir/save_name` under the base directory
    /// (blank means the remote directory and name). An existing
    /// `.part` file for that target is resumed.
    ///
    /// # Errors
    ///
    /// Returns an error for invalid arguments, missing identity, or a
    /// transport failure (the task is then marked failed).
    pub async fn start_pull(
        &self,
        provider: u32,
        dir: &str,
        name: &str,
        save_dir: &str,
        save_name: &str,
        want_hash: bool,
    ) -> Result<TaskView> {
        if provider == 0 {
            return Err(Error::MissingArgument("provider"));
        }
        let node = self.require_identity()?.node;
        let dir = sanitize_dir(&normalize_dir(dir))?;
        let name = sanitize_name(name)?;
        let save_dir = if save_dir.trim().is_empty() {
            dir.clone()
        } else {
            sanitize_dir(&normalize_dir(save_dir))?
        };
        let save_name = if save_name.trim().is_empty() {
            name.clone()
        } else {
            sanitize_name(save_name)?
        };

        let resolved = resolve_paths(&self.config().base_dir, &save_dir, &save_name)?;
        if let Some(parent) = resolved.final_path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let resume_from = match tokio::fs::metadata(&resolved.part_path).await {
            Ok(meta) if meta.is_file() => meta.len(),
            _ => 0,
        };

        let mut data = TaskData::new(
            TaskOp::Pull,
            Direction::Download,
            provider,
            node,
            &dir,
            &name,
            TaskStatus::WaitingResponse,
        );
        data.want_hash = want_hash;
        data.local_dir = save_dir;
        data.local_name = save_name;
        data.local_path = Some(resolved.final_path);
        let task = Task::new(data);
        self.inner.registry.add_task(task.clone());
        self.inner
            .registry
            .insert_pending_pull(PullKey::new(provider, &dir, &name), task.clone());
        self.emit_tasks(true);

        let req = ReadReq {
            op: ReadOp::Pull.as_str().to_string(),
            target: provider,
            dir,
            name,
            overwrite: Some(true),
            resume_from,
            want_hash: Some(want_hash),
            ..ReadReq::default()
        };
        if let Err(e) = self.send_to_hub(Action::Read, &req).await {
            self.inner.registry.remove_pending_pull_for(&task);
            self.set_status(&task, TaskStatus::Failed, "send failed");
            return Err(e);
        }
        tracing::info!(provider, dir = %req.dir, name = %req.name, resume_from, "Pull requested");
        Ok(task.view())
    }

    /// Offer the local file `dir/name` to `consumer`.
    ///
    /// Returns once the task is registered; hashing and sending the offer
    /// happen in the background.
    ///
    /// # Errors
    ///
    /// Returns an error for invalid arguments, a missing or oversized
    /// file, missing identity, or when the session limit is reached.
    pub async fn start_offer(&self, consumer: u32, dir: &str, name: &str, want_hash: bool) -> Result<TaskView> {
        if consumer == 0 {
            return Err(Error::MissingArgument("consumer"));
        }
        let node = self.require_identity()?.node;
        let config = self.config();
        let dir = sanitize_dir(&normalize_dir(dir))?;
        let name = sanitize_name(name)?;
        let resolved = resolve_paths(&config.base_dir, &dir, &name)?;

        let meta = match tokio::fs::metadata(&resolved.final_path).await {
            Ok(meta) if meta.is_file() => meta,
            _ => return Err(Error::NotFound(resolved.final_path.display().to_string())),
        };
        let size = meta.len();
        if config.max_size_bytes > 0 && size > config.max_size_bytes {
            return Err(Error::TooLarge {
                size,
                limit: config.max_size_bytes,
            });
        }
        if self.inner.registry.total_sessions() >= config.max_concurrent {
            return Err(Error::TooManySessions);
        }

        let sid = SessionId::random();
        let mut data = TaskData::new(
            TaskOp::Offer,
            Direction::Upload,
            node,
            consumer,
            &dir,
            &name,
            TaskStatus::Preparing,
        );
        data.session_id = Some(sid);
        data.size = size;
        data.want_hash = want_hash;
        data.file_path = Some(resolved.final_path.clone());
        let task = Task::new(data);
        let sess = Arc::new(SendSession::new(
            sid,
            node,
            consumer,
            &dir,
            &name,
            resolved.final_path,
            size,
            task.clone(),
        ));
        self.inner.registry.add_task(task.clone());
        self.inner.registry.add_send(Arc::clone(&sess));
        self.emit_tasks(true);

        let service = self.clone();
        tokio::spawn(async move {
            service.prepare_offer(sess, want_hash).await;
        });
        Ok(task.view())
    }

    async fn prepare_offer(&self, sess: Arc<SendSession>, want_hash: bool) {
        let mut sha256 = String::new();
        if want_hash {
            self.set_status(&sess.task, TaskStatus::Hashing, "");
            match sha256_file(&sess.file_path).await {
                Ok(hex) => sha256 = hex,
                Err(e) => {
                    tracing::warn!(path = %sess.file_path.display(), "Hashing failed, offering without digest: {e}");
                }
            }
        }
        if sess.cancel.is_cancelled() {
            return;
        }
        sess.set_sha256(sha256.clone());
        let changed = sess
            .task
            .transition(TaskStatus::WaitingRemote, "", |d| d.sha256.clone_from(&sha256));
        if !changed {
            return;
        }
        self.emit_tasks(false);

        let req = WriteReq {
            op: OP_OFFER.to_string(),
            target: sess.consumer,
            session_id: sess.id.to_string(),
            dir: sess.dir.clone(),
            name: sess.name.clone(),
            size: sess.size,
            sha256,
            overwrite: Some(true),
        };
        if let Err(e) = self.send_to_hub(Action::Write, &req).await {
            tracing::warn!(session_id = %sess.id, "Failed to send offer: {e}");
            self.set_status(&sess.task, TaskStatus::Failed, "send failed");
            self.inner.registry.remove_send(&sess.id);
        }
    }

    /// Accept or reject an offer announced by [`FileEvent::Offer`].
    ///
    /// # Errors
    ///
    /// Returns [`Error::OfferNotFound`] for an unknown session, or the
    /// reason acceptance failed (the peer is told as well).
    pub async fn confirm_offer(&self, session_id: &str, accept: bool, save_dir: &str) -> Result<()> {
        let session_id = session_id.trim();
        if session_id.is_empty() {
            return Err(Error::MissingArgument("session id"));
        }
        let pending = self
            .inner
            .registry
            .take_pending_offer(session_id)
            .ok_or_else(|| Error::OfferNotFound(session_id.to_string()))?;
        if accept {
            self.accept_offer(pending.provider, &pending.req, save_dir).await
        } else {
            self.reject_offer(pending.provider, &pending.req).await;
            Ok(())
        }
    }

    /// Views of every task, oldest first.
    pub fn tasks_snapshot(&self) -> Vec<TaskView> {
        self.inner.registry.tasks().iter().map(Task::view).collect()
    }

    /// Start a fresh attempt with the parameters of an earlier task.
    ///
    /// # Errors
    ///
    /// Returns [`Error::TaskNotFound`], or whatever starting the new
    /// attempt returns. Incoming offers cannot be retried from this side.
    pub async fn retry_task(&self, task_id: &str) -> Result<TaskView> {
        let task = self
            .inner
            .registry
            .find_task(task_id)
            .ok_or_else(|| Error::TaskNotFound(task_id.trim().to_string()))?;
        let data = task.data();
        match (data.op, data.direction) {
            (TaskOp::Pull, Direction::Download) => {
                self.start_pull(
                    data.provider,
                    &data.dir,
                    &data.name,
                    &data.local_dir,
                    &data.local_name,
                    data.want_hash,
                )
                .await
            }
            (TaskOp::Offer, Direction::Upload) if data.file_path.is_some() => {
                self.start_offer(data.consumer, &data.dir, &data.name, data.want_hash)
                    .await
            }
            _ => Err(Error::MissingArgument("file path")),
        }
    }

    /// Stop a task. Finished tasks are left as they are.
    ///
    /// # Errors
    ///
    /// Returns [`Error::TaskNotFound`] for an unknown id.
    pub async fn cancel_task(&self, task_id: &str) -> Result<()> {
        let task = self
            .inner
            .registry
            .find_task(task_id)
            .ok_or_else(|| Error::TaskNotFound(task_id.trim().to_string()))?;
        if !self.set_status(&task, TaskStatus::Canceled, "") {
            return Ok(());
        }

        match task.session_id() {
            Some(sid) => {
                self.inner.registry.remove_send(&sid);
                if let Some(sess) = self.inner.registry.remove_recv(&sid) {
                    sess.close().await;
                }
                self.inner.registry.take_pending_offer(&sid.to_string());
            }
            None => self.inner.registry.remove_pending_pull_for(&task),
        }
        tracing::info!(task_id = %task.id(), "Task canceled");
        Ok(())
    }

    /// Tear down every session after the host session dropped.
    ///
    /// Every unfinished task fails with `reason`.
    pub async fn on_disconnect(&self, reason: &str) {
        let reason = match reason.trim() {
            "" => DEFAULT_DISCONNECT_REASON,
            r => r,
        };
        let (recv, send) = self.inner.registry.drain_sessions();
        self.inner.registry.clear_pending();
        for task in self.inner.registry.tasks() {
            task.set_status(TaskStatus::Failed, reason);
        }
        for sess in &recv {
            sess.close().await;
        }
        tracing::info!(
            recv = recv.len(),
            send = send.len(),
            reason,
            "Session lost, transfers aborted"
        );
        self.emit_tasks(true);
    }

    /// Stop background work.
    pub fn close(&self) {
        if let Some(token) = self.inner.janitor.lock().take() {
            token.cancel();
        }
    }

    fn require_identity(&self) -> Result<Identity> {
        let identity = *self.inner.identity.read();
        if identity.node == 0 || identity.hub == 0 {
            return Err(Error::IdentityNotSet);
        }
        Ok(identity)
    }

    /// This node's id, adopting the frame's target when not yet known.
    fn local_node_for(&self, frame: &InboundFrame) -> u32 {
        let node = self.node_id();
        if node != 0 || frame.target_id == 0 {
            return node;
        }
        let mut identity = self.inner.identity.write();
        if identity.node == 0 {
            identity.node = frame.target_id;
        }
        identity.node
    }

    /// Send a control message to the hub for forwarding.
    async fn send_to_hub<M: Serialize>(&self, action: Action, msg: &M) -> Result<()> {
        let identity = self.require_identity()?;
        let payload = encode_ctrl(action, msg)?;
        self.inner
            .transport
            .send(Route::command(identity.node, identity.hub), payload)
            .await
    }

    /// Reply directly to `target`.
    async fn send_reply<M: Serialize>(&self, action: Action, target: u32, msg: &M) -> Result<()> {
        let payload = encode_ctrl(action, msg)?;
        self.inner
            .transport
            .send(Route::command(self.node_id(), target), payload)
            .await
    }

    /// Move `task` to `status` and notify observers.
    ///
    /// Returns `false` if the task had already finished.
    pub(crate) fn set_status(&self, task: &Task, status: TaskStatus, reason: &str) -> bool {
        if !task.set_status(status, reason) {
            return false;
        }
        if status == TaskStatus::Failed {
            tracing::warn!(task_id = %task.id(), reason, "Transfer failed");
        }
        self.emit_tasks(status.is_terminal());
        true
    }

    /// Publish a task snapshot, throttled unless `force`.
    pub(crate) fn emit_tasks(&self, force: bool) {
        if !self.inner.registry.should_emit(force) {
            return;
        }
        self.publish(FileEvent::Tasks(TasksEvent {
            tasks: self.tasks_snapshot(),
            updated_at: Utc::now(),
        }));
    }

    fn publish(&self, event: FileEvent) {
        // No subscribers is fine.
        let _ = self.inner.events.send(event);
    }
}
