//! Inbound frame handling.
//!
//! Nothing here returns an error to the host session: bad frames are
//! dropped (logged at debug), refused requests get a coded response, and
//! local failures end up in the affected task's status.

use std::sync::Arc;

use super::receiver::{open_part, RecvEnd, RecvSession, RecvSpec};
use super::registry::{PendingOffer, PullKey};
use super::sender::SendSession;
use super::task::{Direction, Task, TaskData, TaskOp, TaskStatus};
use super::FileService;
use crate::digest::{sha256_file, verify_part};
use crate::error::{Error, Result};
use crate::events::{FileEvent, ListEvent, OfferEvent, TextEvent};
use crate::local;
use crate::path::{normalize_dir, resolve_paths, sanitize_dir, sanitize_name, ResolvedPaths};
use crate::protocol::{
    decode_frame, encode_ack, Action, BinHeader, Envelope, Frame, ReadOp, ReadReq, ReadResp,
    SessionId, WriteReq, WriteResp, CODE_OK, OP_OFFER,
};
use crate::transport::{InboundFrame, Route, Transport};

impl<T: Transport> FileService<T> {
    pub(crate) async fn handle_frame(&self, frame: InboundFrame) {
        if frame.sub_proto != crate::SUB_PROTO_FILE {
            return;
        }
        match decode_frame(&frame.payload) {
            Ok(Frame::Ctrl(envelope)) => {
                self.handle_ctrl(&frame, &envelope).await;
                self.ensure_janitor();
            }
            Ok(Frame::Data { header, body }) => self.handle_data(&frame, header, body).await,
            Ok(Frame::Ack(header)) => self.handle_ack(&frame, header),
            Err(e) => {
                tracing::debug!(source = frame.source_id, "Dropping file frame: {e}");
            }
        }
    }

    async fn handle_ctrl(&self, frame: &InboundFrame, envelope: &Envelope) {
        match envelope.action() {
            Some(Action::Read) => match envelope.decode_data::<ReadReq>() {
                Ok(req) => self.handle_read(frame, req).await,
                Err(_) => {
                    self.reply_read(frame.source_id, ReadResp::error(400, "invalid read", ""))
                        .await;
                }
            },
            Some(Action::Write) => match envelope.decode_data::<WriteReq>() {
                Ok(req) => self.handle_write(frame, req).await,
                Err(_) => {
                    let resp = WriteResp {
                        code: 400,
                        msg: "invalid write".to_string(),
                        ..WriteResp::default()
                    };
                    self.reply_write(frame.source_id, resp).await;
                }
            },
            Some(Action::ReadResp) => match envelope.decode_data::<ReadResp>() {
                Ok(resp) => self.handle_read_resp(frame, resp).await,
                Err(e) => tracing::debug!("Dropping malformed read_resp: {e}"),
            },
            Some(Action::WriteResp) => match envelope.decode_data::<WriteResp>() {
                Ok(resp) => self.handle_write_resp(resp),
                Err(e) => tracing::debug!("Dropping malformed write_resp: {e}"),
            },
            None => tracing::debug!(action = %envelope.action, "Unknown file action"),
        }
    }

    async fn handle_read(&self, frame: &InboundFrame, req: ReadReq) {
        let Some(op) = req.read_op() else {
            let op = req.op.trim().to_ascii_lowercase();
            self.reply_read(frame.source_id, ReadResp::error(400, "invalid op", &op))
                .await;
            return;
        };
        let local = self.local_node_for(frame);
        if local == 0 {
            return;
        }
        let requester = frame.source_id;
        let target = match (req.target, op) {
            (0, ReadOp::List) => local,
            (target, _) => target,
        };
        if target == 0 {
            self.reply_read(requester, ReadResp::error(400, "target required", op.as_str()))
                .await;
            return;
        }
        if target != local {
            tracing::debug!(target, local, "Ignoring read addressed to another node");
            return;
        }

        match op {
            ReadOp::Pull => self.serve_pull(requester, local, &req).await,
            ReadOp::List => self.serve_list(requester, local, &req).await,
            ReadOp::ReadText => self.serve_text(requester, local, &req).await,
        }
    }

    async fn serve_list(&self, requester: u32, local: u32, req: &ReadReq) {
        let dir = normalize_dir(&req.dir);
        let mut resp = ReadResp {
            op: ReadOp::List.as_str().to_string(),
            provider: local,
            ..ReadResp::default()
        };
        match local::list(&self.config().base_dir, &dir).await {
            Ok(listing) => {
                resp.code = CODE_OK;
                resp.msg = "ok".to_string();
                resp.dir = listing.dir;
                resp.dirs = listing.dirs;
                resp.files = listing.files;
            }
            Err(Error::InvalidDir(_) | Error::InvalidPath(_)) => {
                resp.code = 400;
                resp.msg = "invalid dir".to_string();
                resp.dir = dir;
            }
            Err(_) => {
                resp.code = 404;
                resp.msg = "not found".to_string();
                resp.dir = dir;
            }
        }
        self.reply_read(requester, resp).await;
    }

    async fn serve_text(&self, requester: u32, local: u32, req: &ReadReq) {
        let dir = normalize_dir(&req.dir);
        let name = req.name.trim().to_string();
        let mut resp = ReadResp {
            op: ReadOp::ReadText.as_str().to_string(),
            provider: local,
            ..ReadResp::default()
        };
        match local::read_text(&self.config().base_dir, &dir, &name, req.max_bytes).await {
            Ok(preview) => {
                resp.code = CODE_OK;
                resp.msg = "ok".to_string();
                resp.size = preview.size;
                resp.text = preview.text;
                resp.truncated = preview.truncated;
            }
            Err(e) => {
                resp.code = 415;
                resp.msg = e.to_string();
            }
        }
        resp.dir = dir;
        resp.name = name;
        self.reply_read(requester, resp).await;
    }

    async fn serve_pull(&self, consumer: u32, provider: u32, req: &ReadReq) {
        let config = self.config();
        let dir = normalize_dir(&req.dir);
        let name = req.name.trim().to_string();
        let refuse = |code: u16, msg: &str, size: u64| ReadResp {
            code,
            msg: msg.to_string(),
            op: ReadOp::Pull.as_str().to_string(),
            provider,
            consumer,
            dir: dir.clone(),
            name: name.clone(),
            size,
            ..ReadResp::default()
        };

        let Ok(resolved) = resolve_paths(&config.base_dir, &dir, &name) else {
            self.reply_read(consumer, refuse(400, "invalid path", 0)).await;
            return;
        };
        let size = match tokio::fs::metadata(&resolved.final_path).await {
            Ok(meta) if meta.is_file() => meta.len(),
            _ => {
                self.reply_read(consumer, refuse(404, "not found", 0)).await;
                return;
            }
        };
        if config.max_size_bytes > 0 && size > config.max_size_bytes {
            self.reply_read(consumer, refuse(413, "too large", size)).await;
            return;
        }
        if self.inner.registry.total_sessions() >= config.max_concurrent {
            self.reply_read(consumer, refuse(429, "too many sessions", size))
                .await;
            return;
        }

        let want_hash = req.want_hash.unwrap_or(config.want_sha256);
        let start_from = if req.resume_from > 0 && req.resume_from < size {
            req.resume_from
        } else {
            0
        };

        let sid = SessionId::random();
        let mut data = TaskData::new(
            TaskOp::Pull,
            Direction::Upload,
            provider,
            consumer,
            &dir,
            &name,
            if want_hash {
                TaskStatus::Hashing
            } else {
                TaskStatus::Sending
            },
        );
        data.session_id = Some(sid);
        data.size = size;
        data.want_hash = want_hash;
        data.file_path = Some(resolved.final_path.clone());
        data.sent_bytes = start_from;
        data.acked_bytes = start_from;
        let task = Task::new(data);

        let sess = Arc::new(SendSession::new(
            sid,
            provider,
            consumer,
            &dir,
            &name,
            resolved.final_path,
            size,
            task.clone(),
        ));
        sess.set_start_from(start_from);
        // Registered before hashing so the session counts toward the limit.
        self.inner.registry.add_task(task);
        self.inner.registry.add_send(Arc::clone(&sess));
        self.emit_tasks(true);

        let service = self.clone();
        tokio::spawn(async move {
            service.prepare_pull(sess, want_hash).await;
        });
    }

    /// Hash the source if asked, answer the pull and start streaming.
    async fn prepare_pull(&self, sess: Arc<SendSession>, want_hash: bool) {
        let mut sha256 = String::new();
        if want_hash {
            match sha256_file(&sess.file_path).await {
                Ok(hex) => sha256 = hex,
                Err(e) => {
                    tracing::warn!(path = %sess.file_path.display(), "Hashing failed, serving without digest: {e}");
                }
            }
        }
        if sess.cancel.is_cancelled() {
            return;
        }
        sess.set_sha256(sha256.clone());
        let changed = sess
            .task
            .transition(TaskStatus::Sending, "", |d| d.sha256.clone_from(&sha256));
        if !changed {
            return;
        }

        let start_from = sess.start_from();
        let resp = ReadResp {
            code: CODE_OK,
            msg: "ok".to_string(),
            op: ReadOp::Pull.as_str().to_string(),
            provider: sess.provider,
            consumer: sess.consumer,
            dir: sess.dir.clone(),
            name: sess.name.clone(),
            session_id: sess.id.to_string(),
            size: sess.size,
            sha256,
            start_from,
            chunk_bytes: u32::try_from(self.config().chunk_bytes).unwrap_or(u32::MAX),
            ..ReadResp::default()
        };
        if let Err(e) = self.send_reply(Action::ReadResp, sess.consumer, &resp).await {
            tracing::warn!(session_id = %sess.id, "Failed to answer pull: {e}");
            self.set_status(&sess.task, TaskStatus::Failed, "send failed");
            self.inner.registry.remove_send(&sess.id);
            return;
        }
        tracing::info!(session_id = %sess.id, consumer = sess.consumer, size = sess.size, start_from, "Serving pull");
        self.emit_tasks(true);
        self.spawn_sender(sess);
    }

    async fn handle_read_resp(&self, frame: &InboundFrame, resp: ReadResp) {
        let node_id = if resp.provider == 0 {
            frame.source_id
        } else {
            resp.provider
        };
        match ReadOp::parse(&resp.op) {
            Some(ReadOp::List) => self.publish(FileEvent::List(ListEvent {
                node_id,
                dir: normalize_dir(&resp.dir),
                code: resp.code,
                msg: resp.msg.trim().to_string(),
                dirs: resp.dirs,
                files: resp.files,
            })),
            Some(ReadOp::ReadText) => self.publish(FileEvent::Text(TextEvent {
                node_id,
                dir: normalize_dir(&resp.dir),
                name: resp.name.trim().to_string(),
                code: resp.code,
                msg: resp.msg.trim().to_string(),
                size: resp.size,
                text: resp.text,
                truncated: resp.truncated,
            })),
            Some(ReadOp::Pull) => self.begin_download(frame, resp).await,
            None => tracing::debug!(op = %resp.op, "Dropping read_resp with unknown op"),
        }
    }

    /// Consumer side of an answered pull.
    async fn begin_download(&self, frame: &InboundFrame, resp: ReadResp) {
        let provider = frame.source_id;
        let consumer = self.local_node_for(frame);
        if consumer == 0 {
            return;
        }
        if (resp.consumer != 0 && resp.consumer != consumer)
            || (resp.provider != 0 && resp.provider != provider)
        {
            tracing::debug!(provider, consumer, "Dropping pull response for other nodes");
            return;
        }
        let dir = normalize_dir(&resp.dir);
        let name = resp.name.trim().to_string();
        let key = PullKey::new(provider, &dir, &name);

        if resp.code != CODE_OK {
            if let Some(task) = self.inner.registry.take_pending_pull(&key) {
                let reason = format!("{} {}", resp.code, resp.msg.trim());
                self.set_status(&task, TaskStatus::Failed, &reason);
            }
            return;
        }
        let Ok(sid) = resp.session_id.parse::<SessionId>() else {
            tracing::debug!(session_id = %resp.session_id, "Dropping pull response with bad session id");
            return;
        };
        if self.inner.registry.recv(&sid).is_some() {
            return;
        }

        let config = self.config();
        let task = if let Some(task) = self.inner.registry.take_pending_pull(&key) {
            task
        } else {
            let mut data = TaskData::new(
                TaskOp::Pull,
                Direction::Download,
                provider,
                consumer,
                &dir,
                &name,
                TaskStatus::Receiving,
            );
            data.want_hash = config.want_sha256;
            let task = Task::new(data);
            self.inner.registry.add_task(task.clone());
            task
        };

        let data = task.data();
        let local_dir = match data.local_dir.trim() {
            "" => dir.clone(),
            d => normalize_dir(d),
        };
        let local_name = match data.local_name.trim() {
            "" => name.clone(),
            n => n.to_string(),
        };
        let Ok(resolved) = resolve_paths(&config.base_dir, &local_dir, &local_name) else {
            self.set_status(&task, TaskStatus::Failed, "invalid save path");
            return;
        };
        if config.max_size_bytes > 0 && resp.size > config.max_size_bytes {
            self.set_status(&task, TaskStatus::Failed, "too large");
            return;
        }
        if self.inner.registry.total_sessions() >= config.max_concurrent {
            self.set_status(&task, TaskStatus::Failed, "too many sessions");
            return;
        }
        if let Some(parent) = resolved.final_path.parent() {
            if tokio::fs::create_dir_all(parent).await.is_err() {
                self.set_status(&task, TaskStatus::Failed, "mkdir failed");
                return;
            }
        }

        let start_from = if resp.start_from > resp.size {
            0
        } else {
            resp.start_from
        };
        let sha256 = resp.sha256.trim().to_string();
        let hash = data.want_hash && !sha256.is_empty();
        let (file, hasher) = match open_part(&resolved.part_path, start_from, hash).await {
            Ok(opened) => opened,
            Err(reason) => {
                self.set_status(&task, TaskStatus::Failed, reason);
                return;
            }
        };

        let size = resp.size;
        let changed = task.transition(TaskStatus::Receiving, "", |d| {
            d.session_id = Some(sid);
            d.size = size;
            d.sha256.clone_from(&sha256);
            d.local_dir.clone_from(&local_dir);
            d.local_name.clone_from(&local_name);
            d.local_path = Some(resolved.final_path.clone());
            d.done_bytes = start_from;
        });
        if !changed {
            tracing::debug!(session_id = %sid, "Pull was canceled before it started");
            return;
        }
        self.inner.registry.bind_session(sid, task.clone());

        let sess = RecvSession::new(
            RecvSpec {
                id: sid,
                provider,
                consumer,
                final_path: resolved.final_path,
                part_path: resolved.part_path,
                size,
                sha256,
                overwrite: true,
                task,
            },
            file,
            hasher,
            start_from,
            &config,
        );
        self.inner.registry.add_recv(Arc::new(sess));
        tracing::info!(session_id = %sid, provider, size, start_from, "Download started");
        self.emit_tasks(false);
    }

    async fn handle_write(&self, frame: &InboundFrame, req: WriteReq) {
        let op = req.op.trim().to_ascii_lowercase();
        let sid_text = req.session_id.trim().to_string();
        if op != OP_OFFER {
            let resp = WriteResp {
                op,
                ..WriteResp::refuse(400, "invalid op", "")
            };
            self.reply_write(frame.source_id, resp).await;
            return;
        }
        let local = self.local_node_for(frame);
        if local == 0 {
            return;
        }
        let provider = frame.source_id;
        if req.target == 0 || req.target != local {
            self.reply_write(provider, WriteResp::refuse(400, "target mismatch", &sid_text))
                .await;
            return;
        }
        let Ok(sid) = sid_text.parse::<SessionId>() else {
            self.reply_write(provider, WriteResp::refuse(400, "invalid session", &sid_text))
                .await;
            return;
        };
        let config = self.config();
        if config.max_size_bytes > 0 && req.size > config.max_size_bytes {
            self.reply_write(provider, WriteResp::refuse(413, "too large", &sid_text))
                .await;
            return;
        }
        if self.inner.registry.total_sessions() >= config.max_concurrent {
            self.reply_write(provider, WriteResp::refuse(429, "too many sessions", &sid_text))
                .await;
            return;
        }
        let Ok(dir) = sanitize_dir(&normalize_dir(&req.dir)) else {
            self.reply_write(provider, WriteResp::refuse(400, "invalid dir", &sid_text))
                .await;
            return;
        };
        let Ok(name) = sanitize_name(&req.name) else {
            self.reply_write(provider, WriteResp::refuse(400, "invalid name", &sid_text))
                .await;
            return;
        };
        if self.inner.registry.recv(&sid).is_some() {
            tracing::debug!(session_id = %sid, "Ignoring repeated offer");
            return;
        }

        let sha256 = req.sha256.trim().to_string();
        let task = self.offer_task(sid, provider, local, &dir, &name, req.size, &sha256);
        self.set_status(&task, TaskStatus::WaitingConfirm, "");

        if config.auto_accept {
            if let Err(e) = self.accept_offer(provider, &req, &dir).await {
                tracing::debug!(session_id = %sid, "Auto-accept failed: {e}");
            }
            return;
        }

        self.inner.registry.insert_pending_offer(
            sid_text.clone(),
            PendingOffer {
                provider,
                req: req.clone(),
            },
        );
        tracing::info!(session_id = %sid, provider, name = %name, size = req.size, "Offer waiting for confirmation");
        self.publish(FileEvent::Offer(OfferEvent {
            session_id: sid_text,
            provider,
            consumer: local,
            dir: dir.clone(),
            name,
            size: req.size,
            sha256,
            suggest_dir: dir,
        }));
    }

    /// Task for an incoming offer, created on first sight.
    #[allow(clippy::too_many_arguments)]
    fn offer_task(
        &self,
        sid: SessionId,
        provider: u32,
        consumer: u32,
        dir: &str,
        name: &str,
        size: u64,
        sha256: &str,
    ) -> Task {
        if let Some(task) = self.inner.registry.task_by_session(&sid) {
            return task;
        }
        let mut data = TaskData::new(
            TaskOp::Offer,
            Direction::Download,
            provider,
            consumer,
            dir,
            name,
            TaskStatus::WaitingConfirm,
        );
        data.session_id = Some(sid);
        data.size = size;
        data.sha256 = sha256.to_string();
        data.want_hash = !sha256.is_empty();
        let task = Task::new(data);
        self.inner.registry.add_task(task.clone());
        task
    }

    /// Accept an offer and start receiving into `save_dir`.
    pub(crate) async fn accept_offer(&self, provider: u32, req: &WriteReq, save_dir: &str) -> Result<()> {
        let local = self.node_id();
        if local == 0 {
            return Err(Error::IdentityNotSet);
        }
        let sid_text = req.session_id.trim();
        let parsed = sid_text.parse::<SessionId>();
        let task = parsed
            .as_ref()
            .ok()
            .and_then(|sid| self.inner.registry.task_by_session(sid));
        let config = self.config();

        if self.inner.registry.total_sessions() >= config.max_concurrent {
            self.refuse_offer(provider, sid_text, task.as_ref(), 429, "too many sessions")
                .await;
            return Err(Error::TooManySessions);
        }
        let sid = match parsed {
            Ok(sid) => sid,
            Err(e) => {
                self.refuse_offer(provider, sid_text, task.as_ref(), 400, "invalid session")
                    .await;
                return Err(e);
            }
        };
        let dir = match sanitize_dir(&normalize_dir(save_dir)) {
            Ok(dir) => dir,
            Err(e) => {
                self.refuse_offer(provider, sid_text, task.as_ref(), 400, "invalid dir")
                    .await;
                return Err(e);
            }
        };
        let name = req.name.trim().to_string();
        let resolved = match resolve_paths(&config.base_dir, &dir, &name) {
            Ok(resolved) => resolved,
            Err(e) => {
                self.refuse_offer(provider, sid_text, task.as_ref(), 400, "invalid path")
                    .await;
                return Err(e);
            }
        };
        if let Some(parent) = resolved.final_path.parent() {
            if let Err(e) = tokio::fs::create_dir_all(parent).await {
                self.refuse_offer(provider, sid_text, task.as_ref(), 500, "mkdir failed")
                    .await;
                return Err(e.into());
            }
        }
        let overwrite = req.overwrite.unwrap_or(true);
        if !overwrite && tokio::fs::metadata(&resolved.final_path).await.is_ok() {
            self.refuse_offer(provider, sid_text, task.as_ref(), 409, "exists")
                .await;
            return Err(Error::AlreadyExists(resolved.final_path.display().to_string()));
        }

        let sha256 = req.sha256.trim().to_string();
        let mut resume_from = match tokio::fs::metadata(&resolved.part_path).await {
            Ok(meta) if meta.is_file() && meta.len() <= req.size => meta.len(),
            Ok(meta) if meta.is_file() => {
                let _ = tokio::fs::remove_file(&resolved.part_path).await;
                0
            }
            _ => 0,
        };
        let task = task.unwrap_or_else(|| {
            self.offer_task(sid, provider, local, &normalize_dir(&req.dir), &name, req.size, &sha256)
        });
        let accepted = WriteResp {
            code: CODE_OK,
            msg: "ok".to_string(),
            op: OP_OFFER.to_string(),
            session_id: sid_text.to_string(),
            provider,
            consumer: local,
            dir: normalize_dir(&req.dir),
            name: name.clone(),
            size: req.size,
            sha256: sha256.clone(),
            accept: true,
            resume_from: 0,
        };

        if req.size != 0 && resume_from == req.size {
            if self
                .adopt_finished_part(&resolved, req.size, &sha256, overwrite)
                .await
            {
                let size = req.size;
                task.transition(TaskStatus::Completed, "", |d| {
                    d.local_dir.clone_from(&dir);
                    d.local_path = Some(resolved.final_path.clone());
                    d.done_bytes = size;
                });
                self.emit_tasks(true);
                tracing::info!(session_id = %sid, "Offered file already present, nothing to transfer");
                let resp = WriteResp {
                    resume_from,
                    ..accepted
                };
                return self.send_reply(Action::WriteResp, provider, &resp).await;
            }
            resume_from = 0;
        }

        let (file, hasher) = match open_part(&resolved.part_path, resume_from, !sha256.is_empty()).await {
            Ok(opened) => opened,
            Err(reason) => {
                self.refuse_offer(provider, sid_text, Some(&task), 500, reason)
                    .await;
                return Err(Error::Internal(reason.to_string()));
            }
        };

        let size = req.size;
        task.transition(TaskStatus::Receiving, "", |d| {
            d.local_dir.clone_from(&dir);
            d.local_path = Some(resolved.final_path.clone());
            d.size = size;
            d.sha256.clone_from(&sha256);
            d.done_bytes = resume_from;
        });
        let sess = Arc::new(RecvSession::new(
            RecvSpec {
                id: sid,
                provider,
                consumer: local,
                final_path: resolved.final_path,
                part_path: resolved.part_path,
                size,
                sha256,
                overwrite,
                task: task.clone(),
            },
            file,
            hasher,
            resume_from,
            &config,
        ));
        self.inner.registry.add_recv(Arc::clone(&sess));
        self.emit_tasks(false);

        let resp = WriteResp {
            resume_from,
            ..accepted
        };
        if let Err(e) = self.send_reply(Action::WriteResp, provider, &resp).await {
            self.inner.registry.remove_recv(&sid);
            sess.close().await;
            self.set_status(&task, TaskStatus::Failed, "send failed");
            return Err(e);
        }
        tracing::info!(session_id = %sid, provider, size, resume_from, "Offer accepted");
        Ok(())
    }

    /// Move a staging file that already holds the whole offer into place.
    ///
    /// An unusable staging file is deleted so the transfer restarts.
    async fn adopt_finished_part(&self, paths: &ResolvedPaths, size: u64, sha256: &str, overwrite: bool) -> bool {
        if !verify_part(&paths.part_path, size, sha256).await {
            let _ = tokio::fs::remove_file(&paths.part_path).await;
            return false;
        }
        if overwrite {
            let _ = tokio::fs::remove_file(&paths.final_path).await;
        }
        match tokio::fs::rename(&paths.part_path, &paths.final_path).await {
            Ok(()) => true,
            Err(e) => {
                tracing::warn!(path = %paths.final_path.display(), "Failed to adopt staging file: {e}");
                let _ = tokio::fs::remove_file(&paths.part_path).await;
                false
            }
        }
    }

    async fn refuse_offer(&self, provider: u32, sid_text: &str, task: Option<&Task>, code: u16, msg: &str) {
        if let Some(task) = task {
            self.set_status(task, TaskStatus::Failed, &format!("{code} {msg}"));
        }
        self.reply_write(provider, WriteResp::refuse(code, msg, sid_text))
            .await;
    }

    pub(crate) async fn reject_offer(&self, provider: u32, req: &WriteReq) {
        let sid_text = req.session_id.trim();
        if let Ok(sid) = sid_text.parse::<SessionId>() {
            if let Some(task) = self.inner.registry.task_by_session(&sid) {
                self.set_status(&task, TaskStatus::Rejected, "rejected");
            }
        }
        self.reply_write(provider, WriteResp::refuse(403, "rejected", sid_text))
            .await;
    }

    fn handle_write_resp(&self, resp: WriteResp) {
        if !resp.op.trim().eq_ignore_ascii_case(OP_OFFER) {
            return;
        }
        let Ok(sid) = resp.session_id.parse::<SessionId>() else {
            return;
        };
        let Some(sess) = self.inner.registry.send(&sid) else {
            return;
        };

        if resp.code != CODE_OK || !resp.accept {
            let status = if resp.code == 403 {
                TaskStatus::Rejected
            } else {
                TaskStatus::Failed
            };
            let reason = format!("{} {}", resp.code, resp.msg.trim());
            self.set_status(&sess.task, status, &reason);
            self.inner.registry.remove_send(&sid);
            return;
        }

        let start_from = resp.resume_from.min(sess.size);
        sess.set_start_from(start_from);
        let changed = sess.task.transition(TaskStatus::Sending, "", |d| {
            d.sent_bytes = start_from;
            d.acked_bytes = start_from;
        });
        if !changed {
            self.inner.registry.remove_send(&sid);
            return;
        }
        self.emit_tasks(false);

        if sess.size > 0 && resp.resume_from >= sess.size {
            sess.mark_eof();
            self.complete_send(&sess);
            return;
        }
        tracing::info!(session_id = %sid, consumer = sess.consumer, start_from, "Offer accepted by peer");
        self.spawn_sender(sess);
    }

    async fn handle_data(&self, frame: &InboundFrame, header: BinHeader, body: &[u8]) {
        let Some(sess) = self.inner.registry.recv(&header.session_id) else {
            tracing::debug!(session_id = %header.session_id, "Data for unknown session");
            return;
        };
        if frame.source_id != sess.provider || frame.target_id != sess.consumer {
            tracing::debug!(
                session_id = %sess.id,
                source = frame.source_id,
                target = frame.target_id,
                "Data frame from unexpected route"
            );
            return;
        }

        let verdict = sess.accept(header.offset, header.fin(), body).await;
        if let Some(offset) = verdict.ack {
            let route = Route::message(sess.consumer, sess.provider);
            if let Err(e) = self
                .inner
                .transport
                .send(route, encode_ack(sess.id, offset))
                .await
            {
                tracing::debug!(session_id = %sess.id, offset, "Failed to send ack: {e}");
            }
        }

        match verdict.end {
            Some(RecvEnd::Completed(path)) => {
                self.inner.registry.remove_recv(&sess.id);
                let changed = sess.task.transition(TaskStatus::Completed, "", |d| {
                    d.local_path = Some(path.clone());
                    d.done_bytes = d.size;
                });
                if changed {
                    tracing::info!(session_id = %sess.id, path = %path.display(), size = sess.size, "Download completed");
                    self.emit_tasks(true);
                }
            }
            Some(RecvEnd::Failed(reason)) => {
                self.inner.registry.remove_recv(&sess.id);
                sess.close().await;
                self.set_status(&sess.task, TaskStatus::Failed, reason);
            }
            None => self.emit_tasks(false),
        }
    }

    fn handle_ack(&self, frame: &InboundFrame, header: BinHeader) {
        let Some(sess) = self.inner.registry.send(&header.session_id) else {
            return;
        };
        if frame.target_id != sess.provider || frame.source_id != sess.consumer {
            tracing::debug!(session_id = %sess.id, "Ack from unexpected route");
            return;
        }
        let Some(outcome) = sess.on_ack(header.offset) else {
            tracing::debug!(session_id = %sess.id, offset = header.offset, "Ack beyond file size");
            return;
        };
        sess.task.update(|d| d.acked_bytes = outcome.acked_until);
        if outcome.complete {
            self.complete_send(&sess);
        } else {
            self.emit_tasks(false);
        }
    }

    async fn reply_read(&self, target: u32, resp: ReadResp) {
        if let Err(e) = self.send_reply(Action::ReadResp, target, &resp).await {
            tracing::debug!(target, "Failed to send read_resp: {e}");
        }
    }

    async fn reply_write(&self, target: u32, resp: WriteResp) {
        if let Err(e) = self.send_reply(Action::WriteResp, target, &resp).await {
            tracing::debug!(target, "Failed to send write_resp: {e}");
        }
    }
}
