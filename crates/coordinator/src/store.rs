use async_trait::async_trait;
use common::{
  tasks::{
    ClassSummary, DetectionQuery, DetectionRecord, NewDetection, TaskId, TaskRecord, TaskState,
  },
  validation::safe_unix_millis,
};
use std::collections::HashMap;
use thiserror::Error;
use tokio::sync::RwLock;

use crate::error::CoordinatorError;

#[derive(Debug, Clone, Error, PartialEq)]
pub enum SinkError {
  #[error("task {0} not found")]
  NotFound(TaskId),

  /// Compare-and-set lost: the stored state is no longer the expected one
  #[error("task state changed concurrently (now {current})")]
  Conflict { current: TaskState },

  /// Detection rejected because the owning task is not running
  #[error("task is {state}, detections are only accepted while running")]
  NotRunning { state: TaskState },

  #[error("result sink backend error: {0}")]
  Backend(String),
}

pub type SinkResult<T> = Result<T, SinkError>;

impl From<SinkError> for CoordinatorError {
  fn from(err: SinkError) -> Self {
    match err {
      SinkError::NotFound(task_id) => CoordinatorError::NotFound(task_id),
      other => CoordinatorError::Storage(other.to_string()),
    }
  }
}

/// Authoritative store for task records and their detections.
///
/// `transition_state` is a compare-and-set: it only writes `to` while the
/// stored state still equals `from`. `write_detection` checks that the task is
/// running atomically with the insert.
#[async_trait]
pub trait ResultSink: Send + Sync {
  /// Insert a new task row
  async fn create_task(&self, record: &TaskRecord) -> SinkResult<()>;

  async fn get_task(&self, task_id: &str) -> SinkResult<TaskRecord>;

  /// All tasks, newest first, optionally filtered by state
  async fn list_tasks(&self, state: Option<TaskState>) -> SinkResult<Vec<TaskRecord>>;

  async fn read_state(&self, task_id: &str) -> SinkResult<TaskState>;

  /// Apply `from -> to`, stamping `started_at` on the first run and `ended_at`
  /// on terminal states. `reason` is stored as `last_error` when given.
  async fn transition_state(
    &self,
    task_id: &str,
    from: TaskState,
    to: TaskState,
    reason: Option<&str>,
  ) -> SinkResult<TaskRecord>;

  async fn record_progress(&self, task_id: &str, frames_processed: u64) -> SinkResult<()>;

  async fn write_detection(
    &self,
    task_id: &str,
    detection: &NewDetection,
  ) -> SinkResult<DetectionRecord>;

  /// Detections in frame order
  async fn list_detections(
    &self,
    task_id: &str,
    query: &DetectionQuery,
  ) -> SinkResult<Vec<DetectionRecord>>;

  /// Per-class counts, most frequent first
  async fn detection_summary(&self, task_id: &str) -> SinkResult<Vec<ClassSummary>>;

  /// Remove a task and all of its detections in one step; returns the number
  /// of detections removed
  async fn delete_task_cascade(&self, task_id: &str) -> SinkResult<u64>;

  async fn health_check(&self) -> SinkResult<bool> {
    Ok(true)
  }
}

/// Apply the timestamp and reason bookkeeping shared by all sinks
pub(crate) fn stamp_transition(
  record: &mut TaskRecord,
  to: TaskState,
  reason: Option<&str>,
  now: u64,
) {
  record.state = to;
  if to == TaskState::Running && record.started_at.is_none() {
    record.started_at = Some(now);
  }
  if to.is_terminal() {
    record.ended_at = Some(now);
  }
  if let Some(reason) = reason {
    record.last_error = Some(reason.to_string());
  }
}

#[derive(Default)]
pub struct MemoryResultSink {
  inner: RwLock<SinkInner>,
}

#[derive(Default)]
struct SinkInner {
  tasks: HashMap<TaskId, TaskRecord>,
  detections: HashMap<TaskId, Vec<DetectionRecord>>,
  next_detection_id: u64,
}

impl MemoryResultSink {
  pub fn new() -> Self {
    Self::default()
  }
}

#[async_trait]
impl ResultSink for MemoryResultSink {
  async fn create_task(&self, record: &TaskRecord) -> SinkResult<()> {
    let mut inner = self.inner.write().await;
    if inner.tasks.contains_key(&record.id) {
      return Err(SinkError::Backend(format!(
        "task {} already exists",
        record.id
      )));
    }
    inner.tasks.insert(record.id.clone(), record.clone());
    inner.detections.insert(record.id.clone(), Vec::new());
    Ok(())
  }

  async fn get_task(&self, task_id: &str) -> SinkResult<TaskRecord> {
    let inner = self.inner.read().await;
    inner
      .tasks
      .get(task_id)
      .cloned()
      .ok_or_else(|| SinkError::NotFound(task_id.to_string()))
  }

  async fn list_tasks(&self, state: Option<TaskState>) -> SinkResult<Vec<TaskRecord>> {
    let inner = self.inner.read().await;
    let mut out: Vec<TaskRecord> = inner
      .tasks
      .values()
      .filter(|r| state.is_none_or(|s| r.state == s))
      .cloned()
      .collect();
    out.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(a.id.cmp(&b.id)));
    Ok(out)
  }

  async fn read_state(&self, task_id: &str) -> SinkResult<TaskState> {
    let inner = self.inner.read().await;
    inner
      .tasks
      .get(task_id)
      .map(|r| r.state)
      .ok_or_else(|| SinkError::NotFound(task_id.to_string()))
  }

  async fn transition_state(
    &self,
    task_id: &str,
    from: TaskState,
    to: TaskState,
    reason: Option<&str>,
  ) -> SinkResult<TaskRecord> {
    let mut inner = self.inner.write().await;
    let record = inner
      .tasks
      .get_mut(task_id)
      .ok_or_else(|| SinkError::NotFound(task_id.to_string()))?;
    if record.state != from {
      return Err(SinkError::Conflict {
        current: record.state,
      });
    }
    stamp_transition(record, to, reason, safe_unix_millis());
    Ok(record.clone())
  }

  async fn record_progress(&self, task_id: &str, frames_processed: u64) -> SinkResult<()> {
    let mut inner = self.inner.write().await;
    let record = inner
      .tasks
      .get_mut(task_id)
      .ok_or_else(|| SinkError::NotFound(task_id.to_string()))?;
    record.frames_processed = record.frames_processed.max(frames_processed);
    Ok(())
  }

  async fn write_detection(
    &self,
    task_id: &str,
    detection: &NewDetection,
  ) -> SinkResult<DetectionRecord> {
    let mut inner = self.inner.write().await;
    let state = inner
      .tasks
      .get(task_id)
      .map(|r| r.state)
      .ok_or_else(|| SinkError::NotFound(task_id.to_string()))?;
    if state != TaskState::Running {
      return Err(SinkError::NotRunning { state });
    }

    inner.next_detection_id += 1;
    let record = DetectionRecord::new(inner.next_detection_id, task_id, detection);
    inner
      .detections
      .entry(task_id.to_string())
      .or_default()
      .push(record.clone());
    Ok(record)
  }

  async fn list_detections(
    &self,
    task_id: &str,
    query: &DetectionQuery,
  ) -> SinkResult<Vec<DetectionRecord>> {
    let inner = self.inner.read().await;
    if !inner.tasks.contains_key(task_id) {
      return Err(SinkError::NotFound(task_id.to_string()));
    }
    let Some(records) = inner.detections.get(task_id) else {
      return Ok(Vec::new());
    };

    let mut matching: Vec<&DetectionRecord> = records
      .iter()
      .filter(|r| {
        query
          .class_name
          .as_deref()
          .is_none_or(|class| r.class_name == class)
      })
      .collect();
    matching.sort_by_key(|r| (r.frame_seq, r.id));

    Ok(
      matching
        .into_iter()
        .skip(query.offset as usize)
        .take(query.effective_limit() as usize)
        .cloned()
        .collect(),
    )
  }

  async fn detection_summary(&self, task_id: &str) -> SinkResult<Vec<ClassSummary>> {
    let inner = self.inner.read().await;
    if !inner.tasks.contains_key(task_id) {
      return Err(SinkError::NotFound(task_id.to_string()));
    }

    let mut totals: HashMap<&str, (u64, f64)> = HashMap::new();
    for record in inner.detections.get(task_id).into_iter().flatten() {
      let entry = totals.entry(record.class_name.as_str()).or_default();
      entry.0 += 1;
      entry.1 += f64::from(record.confidence);
    }

    let mut out: Vec<ClassSummary> = totals
      .into_iter()
      .map(|(class_name, (count, sum))| ClassSummary {
        class_name: class_name.to_string(),
        count,
        mean_confidence: (sum / count as f64) as f32,
      })
      .collect();
    out.sort_by(|a, b| b.count.cmp(&a.count).then(a.class_name.cmp(&b.class_name)));
    Ok(out)
  }

  async fn delete_task_cascade(&self, task_id: &str) -> SinkResult<u64> {
    let mut inner = self.inner.write().await;
    if inner.tasks.remove(task_id).is_none() {
      return Err(SinkError::NotFound(task_id.to_string()));
    }
    let removed = inner
      .detections
      .remove(task_id)
      .map(|d| d.len() as u64)
      .unwrap_or(0);
    Ok(removed)
  }
}
