//! Session registry.
//!
//! One coarse lock guards every map. It is only ever held for map
//! operations, never across an `.await`; per-session state has its own
//! lock inside the session.

use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use super::receiver::RecvSession;
use super::sender::SendSession;
use super::task::Task;
use crate::protocol::{SessionId, WriteReq};

/// Minimum gap between throttled task snapshots.
pub const EMIT_INTERVAL: Duration = Duration::from_millis(200);

/// Pending pulls are keyed by what was asked for.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PullKey {
    /// Provider node
    pub provider: u32,
    /// Requested directory
    pub dir: String,
    /// Requested name
    pub name: String,
}

impl PullKey {
    /// Build a key, trimming `dir` and `name`.
    pub fn new(provider: u32, dir: &str, name: &str) -> Self {
        Self {
            provider,
            dir: dir.trim().to_string(),
            name: name.trim().to_string(),
        }
    }
}

/// An offer waiting for a local decision.
#[derive(Debug, Clone)]
pub struct PendingOffer {
    /// Offering node
    pub provider: u32,
    /// The offer as received
    pub req: WriteReq,
}

#[derive(Default)]
struct State {
    recv: HashMap<SessionId, Arc<RecvSession>>,
    send: HashMap<SessionId, Arc<SendSession>>,
    pending_pull: HashMap<PullKey, Task>,
    pending_offer: HashMap<String, PendingOffer>,
    tasks: Vec<Task>,
    task_by_sid: HashMap<SessionId, Task>,
    last_emit: Option<Instant>,
}

/// All live transfer state for one node.
#[derive(Default)]
pub struct Registry {
    state: Mutex<State>,
}

impl Registry {
    /// Empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Live send plus receive sessions.
    pub fn total_sessions(&self) -> usize {
        let state = self.state.lock();
        state.recv.len() + state.send.len()
    }

    /// Register a receive session, replacing none.
    pub fn add_recv(&self, sess: Arc<RecvSession>) {
        self.state.lock().recv.entry(sess.id).or_insert(sess);
    }

    /// Register a send session, replacing none.
    pub fn add_send(&self, sess: Arc<SendSession>) {
        self.state.lock().send.entry(sess.id).or_insert(sess);
    }

    /// Look up a receive session.
    pub fn recv(&self, id: &SessionId) -> Option<Arc<RecvSession>> {
        self.state.lock().recv.get(id).cloned()
    }

    /// Look up a send session.
    pub fn send(&self, id: &SessionId) -> Option<Arc<SendSession>> {
        self.state.lock().send.get(id).cloned()
    }

    /// Unregister a receive session.
    ///
    /// The caller owns closing the returned session's file.
    pub fn remove_recv(&self, id: &SessionId) -> Option<Arc<RecvSession>> {
        self.state.lock().recv.remove(id)
    }

    /// Unregister a send session and stop its pump.
    pub fn remove_send(&self, id: &SessionId) -> Option<Arc<SendSession>> {
        let sess = self.state.lock().send.remove(id);
        if let Some(sess) = &sess {
            sess.cancel.cancel();
        }
        sess
    }

    /// Unregister every session. Send pumps are cancelled.
    pub fn drain_sessions(&self) -> (Vec<Arc<RecvSession>>, Vec<Arc<SendSession>>) {
        let (recv, send) = {
            let mut state = self.state.lock();
            let recv: Vec<_> = state.recv.drain().map(|(_, s)| s).collect();
            let send: Vec<_> = state.send.drain().map(|(_, s)| s).collect();
            (recv, send)
        };
        for sess in &send {
            sess.cancel.cancel();
        }
        (recv, send)
    }

    /// Staging paths owned by live receive sessions.
    pub fn active_part_paths(&self) -> HashSet<PathBuf> {
        self.state
            .lock()
            .recv
            .values()
            .map(|s| s.part_path.clone())
            .collect()
    }

    /// Remember a pull waiting for its response.
    pub fn insert_pending_pull(&self, key: PullKey, task: Task) {
        self.state.lock().pending_pull.insert(key, task);
    }

    /// Take the pull waiting on `key`.
    pub fn take_pending_pull(&self, key: &PullKey) -> Option<Task> {
        self.state.lock().pending_pull.remove(key)
    }

    /// Drop a pending pull only if it still belongs to `task`.
    pub fn remove_pending_pull_for(&self, task: &Task) {
        self.state
            .lock()
            .pending_pull
            .retain(|_, pending| !pending.ptr_eq(task));
    }

    /// Remember an offer awaiting confirmation.
    pub fn insert_pending_offer(&self, session_id: String, offer: PendingOffer) {
        self.state.lock().pending_offer.insert(session_id, offer);
    }

    /// Take the offer awaiting confirmation under `session_id`.
    pub fn take_pending_offer(&self, session_id: &str) -> Option<PendingOffer> {
        self.state.lock().pending_offer.remove(session_id)
    }

    /// Forget every pending pull and offer.
    pub fn clear_pending(&self) {
        let mut state = self.state.lock();
        state.pending_pull.clear();
        state.pending_offer.clear();
    }

    /// Track a new task, indexing it by session when it has one.
    pub fn add_task(&self, task: Task) {
        let sid = task.session_id();
        let mut state = self.state.lock();
        if let Some(sid) = sid {
            state.task_by_sid.insert(sid, task.clone());
        }
        state.tasks.push(task);
    }

    /// Index an existing task by session.
    pub fn bind_session(&self, sid: SessionId, task: Task) {
        self.state.lock().task_by_sid.insert(sid, task);
    }

    /// Task bound to `sid`.
    pub fn task_by_session(&self, sid: &SessionId) -> Option<Task> {
        self.state.lock().task_by_sid.get(sid).cloned()
    }

    /// Task with the given textual id.
    pub fn find_task(&self, task_id: &str) -> Option<Task> {
        let task_id = task_id.trim();
        if task_id.is_empty() {
            return None;
        }
        self.tasks().into_iter().find(|t| t.id() == task_id)
    }

    /// Every task in creation order.
    pub fn tasks(&self) -> Vec<Task> {
        self.state.lock().tasks.clone()
    }

    /// Whether a task snapshot should go out now.
    ///
    /// `force` bypasses the throttle but still resets it.
    pub fn should_emit(&self, force: bool) -> bool {
        let now = Instant::now();
        let mut state = self.state.lock();
        let recent = state
            .last_emit
            .is_some_and(|last| now.duration_since(last) < EMIT_INTERVAL);
        if recent && !force {
            return false;
        }
        state.last_emit = Some(now);
        true
    }
}

impl std::fmt::Debug for Registry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.lock();
        f.debug_struct("Registry")
            .field("recv", &state.recv.len())
            .field("send", &state.send.len())
            .field("tasks", &state.tasks.len())
            .finish_non_exhaustive()
    }
}
