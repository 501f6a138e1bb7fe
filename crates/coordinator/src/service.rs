//! External-facing task operations.
//!
//! Operations only ever write the authoritative state through validated
//! transitions; they never reach into a live session. Loops observe changes
//! at their next state check.

use common::{
  tasks::{
    ClassSummary, DetectionQuery, DetectionRecord, TaskId, TaskRecord, TaskSpec, TaskState,
    TaskStatus,
  },
  validation::{safe_unix_millis, validate_name, validate_unit_interval},
};
use std::sync::Arc;
use telemetry::metrics::{TASK_OPERATIONS, TASKS_CREATED};
use tokio_util::{sync::CancellationToken, task::TaskTracker};
use tracing::{info, warn};
use uuid::Uuid;

use crate::{
  config::LoopSettings,
  detector::Detector,
  error::CoordinatorError,
  lifecycle::{apply_transition, apply_transition_from},
  processing::ProcessingLoop,
  registry::SessionRegistry,
  source::SourceOpener,
  store::ResultSink,
};

pub const RESTART_REASON: &str = "interrupted by coordinator restart";

type OpResult<T> = Result<T, CoordinatorError>;

/// Task/session coordinator. Cheap to clone.
#[derive(Clone)]
pub struct Coordinator {
  inner: Arc<CoordinatorInner>,
}

struct CoordinatorInner {
  sink: Arc<dyn ResultSink>,
  registry: SessionRegistry,
  opener: Arc<dyn SourceOpener>,
  detector: Arc<dyn Detector>,
  settings: LoopSettings,
  shutdown: CancellationToken,
  tracker: TaskTracker,
}

fn observe<T>(operation: &str, result: &OpResult<T>) {
  let status = match result {
    Ok(_) => "ok",
    Err(e) => e.code(),
  };
  TASK_OPERATIONS
    .with_label_values(&[operation, status])
    .inc();
}

impl Coordinator {
  pub fn new(
    sink: Arc<dyn ResultSink>,
    opener: Arc<dyn SourceOpener>,
    detector: Arc<dyn Detector>,
    settings: LoopSettings,
  ) -> Self {
    Self {
      inner: Arc::new(CoordinatorInner {
        sink,
        registry: SessionRegistry::new(),
        opener,
        detector,
        settings,
        shutdown: CancellationToken::new(),
        tracker: TaskTracker::new(),
      }),
    }
  }

  pub fn sink(&self) -> Arc<dyn ResultSink> {
    self.inner.sink.clone()
  }

  pub fn registry(&self) -> &SessionRegistry {
    &self.inner.registry
  }

  pub fn settings(&self) -> &LoopSettings {
    &self.inner.settings
  }

  fn validate_spec(&self, spec: &TaskSpec) -> OpResult<()> {
    let invalid = |e: &dyn std::fmt::Display| CoordinatorError::InvalidSpec(e.to_string());
    validate_unit_interval(spec.params.confidence_threshold, "confidence_threshold")
      .map_err(|e| invalid(&e))?;
    validate_unit_interval(spec.params.iou_threshold, "iou_threshold").map_err(|e| invalid(&e))?;
    if let Some(name) = &spec.name {
      validate_name(name, "name").map_err(|e| invalid(&e))?;
    }
    self
      .inner
      .opener
      .validate(spec.kind, &spec.source_ref)
      .map_err(|e| invalid(&e))
  }

  /// Register a task in `pending`; no session is created.
  pub async fn create_task(&self, spec: TaskSpec) -> OpResult<TaskId> {
    let result = self.create_task_inner(spec).await;
    observe("create", &result);
    result
  }

  async fn create_task_inner(&self, spec: TaskSpec) -> OpResult<TaskId> {
    self.validate_spec(&spec)?;

    let record = TaskRecord {
      id: Uuid::new_v4().to_string(),
      kind: spec.kind,
      source_ref: spec.source_ref.trim().to_string(),
      name: spec.name,
      params: spec.params,
      state: TaskState::Pending,
      created_at: safe_unix_millis(),
      started_at: None,
      ended_at: None,
      frames_processed: 0,
      last_error: None,
    };
    self.inner.sink.create_task(&record).await?;

    TASKS_CREATED
      .with_label_values(&[record.kind.as_str()])
      .inc();
    info!(task_id = %record.id, kind = %record.kind, source = %record.source_ref, "task created");
    Ok(record.id)
  }

  /// Move a pending task to `running` and spawn its processing loop.
  ///
  /// `Ok` means the authoritative state is `running` and a session exists.
  pub async fn start_task(&self, task_id: &str) -> OpResult<TaskRecord> {
    let result = self.start_task_inner(task_id).await;
    observe("start", &result);
    result
  }

  async fn start_task_inner(&self, task_id: &str) -> OpResult<TaskRecord> {
    if self.inner.shutdown.is_cancelled() {
      return Err(CoordinatorError::ShuttingDown);
    }

    let task = self.inner.sink.get_task(task_id).await?;
    if task.state != TaskState::Pending {
      if self.inner.registry.contains(task_id).await {
        return Err(CoordinatorError::AlreadyRunning(task_id.to_string()));
      }
      return Err(CoordinatorError::InvalidTransition {
        task_id: task_id.to_string(),
        from: task.state,
        to: TaskState::Running,
      });
    }

    let session = self.inner.registry.register(task_id, task.kind).await?;

    let record = match apply_transition_from(
      self.inner.sink.as_ref(),
      task_id,
      Some(TaskState::Pending),
      TaskState::Running,
      None,
    )
    .await
    {
      Ok(record) => record,
      Err(e) => {
        self.inner.registry.unregister(task_id).await;
        return Err(e);
      }
    };

    let processing = ProcessingLoop::new(
      record.clone(),
      session,
      self.inner.registry.clone(),
      self.inner.sink.clone(),
      self.inner.opener.clone(),
      self.inner.detector.clone(),
      self.inner.settings.clone(),
      self.inner.shutdown.clone(),
    );
    self.inner.tracker.spawn(processing.run());

    Ok(record)
  }

  pub async fn pause_task(&self, task_id: &str) -> OpResult<TaskRecord> {
    let result = apply_transition(self.inner.sink.as_ref(), task_id, TaskState::Paused, None).await;
    observe("pause", &result);
    result
  }

  /// `paused -> running` only; a pending task must go through `start_task`.
  pub async fn resume_task(&self, task_id: &str) -> OpResult<TaskRecord> {
    let result = apply_transition_from(
      self.inner.sink.as_ref(),
      task_id,
      Some(TaskState::Paused),
      TaskState::Running,
      None,
    )
    .await;
    observe("resume", &result);
    result
  }

  /// Request a stop. The loop, if any, exits within one state-check interval.
  pub async fn stop_task(&self, task_id: &str) -> OpResult<TaskRecord> {
    let result = apply_transition(self.inner.sink.as_ref(), task_id, TaskState::Stopped, None).await;
    observe("stop", &result);
    result
  }

  /// Delete a terminal task together with its detections; returns the number
  /// of detections removed.
  pub async fn delete_task(&self, task_id: &str) -> OpResult<u64> {
    let result = self.delete_task_inner(task_id).await;
    observe("delete", &result);
    result
  }

  async fn delete_task_inner(&self, task_id: &str) -> OpResult<u64> {
    let state = self.inner.sink.read_state(task_id).await?;
    if !state.is_terminal() {
      return Err(CoordinatorError::TaskActive {
        task_id: task_id.to_string(),
        state,
      });
    }
    // terminal states are absorbing, so the check above cannot go stale
    let removed = self.inner.sink.delete_task_cascade(task_id).await?;
    info!(task_id, detections = removed, "task deleted");
    Ok(removed)
  }

  pub async fn get_status(&self, task_id: &str) -> OpResult<TaskStatus> {
    let task = self.inner.sink.get_task(task_id).await?;
    let session = self
      .inner
      .registry
      .lookup(task_id)
      .await
      .map(|s| s.snapshot());
    Ok(TaskStatus { task, session })
  }

  pub async fn list_tasks(&self, state: Option<TaskState>) -> OpResult<Vec<TaskRecord>> {
    Ok(self.inner.sink.list_tasks(state).await?)
  }

  pub async fn list_detections(
    &self,
    task_id: &str,
    query: &DetectionQuery,
  ) -> OpResult<Vec<DetectionRecord>> {
    Ok(self.inner.sink.list_detections(task_id, query).await?)
  }

  pub async fn detection_summary(&self, task_id: &str) -> OpResult<Vec<ClassSummary>> {
    Ok(self.inner.sink.detection_summary(task_id).await?)
  }

  /// Fail tasks left `running` or `paused` without a live session, e.g. after
  /// a crash. Returns the ids that were failed.
  pub async fn reconcile_orphans(&self) -> OpResult<Vec<TaskId>> {
    let mut failed = Vec::new();
    for state in [TaskState::Running, TaskState::Paused] {
      for task in self.inner.sink.list_tasks(Some(state)).await? {
        if self.inner.registry.contains(&task.id).await {
          continue;
        }
        match apply_transition(
          self.inner.sink.as_ref(),
          &task.id,
          TaskState::Failed,
          Some(RESTART_REASON),
        )
        .await
        {
          Ok(_) => {
            warn!(task_id = %task.id, previous = %state, "orphaned task marked failed");
            failed.push(task.id);
          }
          // ended concurrently
          Err(CoordinatorError::InvalidTransition { .. } | CoordinatorError::NotFound(_)) => {}
          Err(e) => return Err(e),
        }
      }
    }
    if !failed.is_empty() {
      info!(count = failed.len(), "reconciled orphaned tasks");
    }
    Ok(failed)
  }

  /// Cancel every loop and wait (bounded) for them to stop their tasks.
  /// Returns `true` if all loops drained in time.
  pub async fn shutdown(&self) -> bool {
    let active = self.inner.registry.active_count().await;
    info!(active, "coordinator shutting down");
    self.inner.shutdown.cancel();
    self.inner.tracker.close();

    let grace = self.inner.settings.shutdown_grace;
    match tokio::time::timeout(grace, self.inner.tracker.wait()).await {
      Ok(()) => {
        info!("all processing loops stopped");
        true
      }
      Err(_) => {
        warn!(
          remaining = ?self.inner.registry.active_ids().await,
          grace_secs = grace.as_secs(),
          "processing loops did not stop within grace period"
        );
        false
      }
    }
  }
}
