use common::tasks::{SessionSnapshot, TaskId, TaskKind, TaskState};
use std::{
  collections::HashMap,
  sync::{
    Arc,
    atomic::{AtomicBool, AtomicU64, Ordering},
  },
};
use telemetry::metrics::ACTIVE_SESSIONS;
use tokio::sync::RwLock;

use crate::error::CoordinatorError;

/// In-memory handle to one live processing loop.
///
/// Never authoritative: the result sink owns the task state. The loop updates
/// the counters, external operations only read them.
#[derive(Debug)]
pub struct Session {
  task_id: TaskId,
  kind: TaskKind,
  running: AtomicBool,
  frames_processed: AtomicU64,
  checkpoint: std::sync::RwLock<Checkpoint>,
}

#[derive(Debug, Clone, Copy)]
struct Checkpoint {
  state: TaskState,
  frame: u64,
}

impl Session {
  fn new(task_id: TaskId, kind: TaskKind) -> Self {
    Self {
      task_id,
      kind,
      running: AtomicBool::new(true),
      frames_processed: AtomicU64::new(0),
      checkpoint: std::sync::RwLock::new(Checkpoint {
        state: TaskState::Running,
        frame: 0,
      }),
    }
  }

  pub fn task_id(&self) -> &str {
    &self.task_id
  }

  pub fn kind(&self) -> TaskKind {
    self.kind
  }

  pub fn is_running(&self) -> bool {
    self.running.load(Ordering::Acquire)
  }

  pub fn mark_finished(&self) {
    self.running.store(false, Ordering::Release);
  }

  pub fn frames_processed(&self) -> u64 {
    self.frames_processed.load(Ordering::Acquire)
  }

  /// Count one consumed frame and return the new total
  pub fn frame_consumed(&self) -> u64 {
    self.frames_processed.fetch_add(1, Ordering::AcqRel) + 1
  }

  /// Remember the authoritative state seen at the current frame count
  pub fn record_check(&self, state: TaskState) {
    let frame = self.frames_processed();
    if let Ok(mut checkpoint) = self.checkpoint.write() {
      *checkpoint = Checkpoint { state, frame };
    }
  }

  pub fn last_checked_state(&self) -> TaskState {
    self
      .checkpoint
      .read()
      .map(|c| c.state)
      .unwrap_or(TaskState::Running)
  }

  pub fn snapshot(&self) -> SessionSnapshot {
    let (last_checked_state, last_check_frame) = self
      .checkpoint
      .read()
      .map(|c| (c.state, c.frame))
      .unwrap_or((TaskState::Running, 0));
    SessionSnapshot {
      running: self.is_running(),
      frames_processed: self.frames_processed(),
      last_checked_state,
      last_check_frame,
    }
  }
}

/// Live sessions keyed by task id; at most one per task.
#[derive(Clone, Default)]
pub struct SessionRegistry {
  sessions: Arc<RwLock<HashMap<TaskId, Arc<Session>>>>,
}

impl SessionRegistry {
  pub fn new() -> Self {
    Self::default()
  }

  pub async fn register(
    &self,
    task_id: &str,
    kind: TaskKind,
  ) -> Result<Arc<Session>, CoordinatorError> {
    let mut sessions = self.sessions.write().await;
    if sessions.contains_key(task_id) {
      return Err(CoordinatorError::AlreadyRunning(task_id.to_string()));
    }
    let session = Arc::new(Session::new(task_id.to_string(), kind));
    sessions.insert(task_id.to_string(), session.clone());
    ACTIVE_SESSIONS.set(sessions.len() as i64);
    Ok(session)
  }

  /// Idempotent; returns whether a session was removed
  pub async fn unregister(&self, task_id: &str) -> bool {
    let mut sessions = self.sessions.write().await;
    let removed = sessions.remove(task_id);
    if let Some(session) = &removed {
      session.mark_finished();
    }
    ACTIVE_SESSIONS.set(sessions.len() as i64);
    removed.is_some()
  }

  pub async fn lookup(&self, task_id: &str) -> Option<Arc<Session>> {
    self.sessions.read().await.get(task_id).cloned()
  }

  pub async fn contains(&self, task_id: &str) -> bool {
    self.sessions.read().await.contains_key(task_id)
  }

  pub async fn active_count(&self) -> usize {
    self.sessions.read().await.len()
  }

  pub async fn active_ids(&self) -> Vec<TaskId> {
    let mut ids: Vec<TaskId> = self.sessions.read().await.keys().cloned().collect();
    ids.sort();
    ids
  }
}
