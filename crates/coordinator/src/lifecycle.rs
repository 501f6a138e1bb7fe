//! Task lifecycle state machine.
//!
//! The transition table lives here and nowhere else. Transitions are applied
//! as read, validate, compare-and-set; a lost compare-and-set re-reads and
//! re-validates so concurrent requests are linearised.

use common::tasks::{TaskRecord, TaskState};
use telemetry::metrics::TASK_TRANSITIONS;
use tracing::{debug, info};

use crate::{
  error::CoordinatorError,
  store::{ResultSink, SinkError},
};

/// Compare-and-set attempts before giving up on a hot task row
pub const MAX_TRANSITION_ATTEMPTS: usize = 8;

pub fn is_allowed(from: TaskState, to: TaskState) -> bool {
  use TaskState::*;
  if from == to {
    return false;
  }
  matches!(
    (from, to),
    (Pending, Running)
      | (Pending, Stopped)
      | (Running, Paused)
      | (Paused, Running)
      | (Running | Paused, Stopped | Completed | Failed)
  )
}

pub fn check_transition(task_id: &str, from: TaskState, to: TaskState) -> Result<(), CoordinatorError> {
  if is_allowed(from, to) {
    Ok(())
  } else {
    Err(CoordinatorError::InvalidTransition {
      task_id: task_id.to_string(),
      from,
      to,
    })
  }
}

/// Move a task to `to` from whatever state it is in, if the table allows it.
pub async fn apply_transition(
  sink: &dyn ResultSink,
  task_id: &str,
  to: TaskState,
  reason: Option<&str>,
) -> Result<TaskRecord, CoordinatorError> {
  apply_transition_from(sink, task_id, None, to, reason).await
}

/// Like [`apply_transition`], but when `required_from` is set the task must
/// currently be in that state; anything else is an `InvalidTransition`.
pub async fn apply_transition_from(
  sink: &dyn ResultSink,
  task_id: &str,
  required_from: Option<TaskState>,
  to: TaskState,
  reason: Option<&str>,
) -> Result<TaskRecord, CoordinatorError> {
  let mut current = sink.read_state(task_id).await?;

  for attempt in 1..=MAX_TRANSITION_ATTEMPTS {
    if required_from.is_some_and(|required| required != current) {
      return Err(CoordinatorError::InvalidTransition {
        task_id: task_id.to_string(),
        from: current,
        to,
      });
    }
    check_transition(task_id, current, to)?;

    match sink.transition_state(task_id, current, to, reason).await {
      Ok(record) => {
        TASK_TRANSITIONS
          .with_label_values(&[current.as_str(), to.as_str()])
          .inc();
        info!(task_id, from = %current, to = %to, "task state changed");
        return Ok(record);
      }
      Err(SinkError::Conflict { current: observed }) => {
        debug!(task_id, expected = %current, observed = %observed, attempt, "transition lost race, retrying");
        current = observed;
      }
      Err(err) => return Err(err.into()),
    }
  }

  Err(CoordinatorError::Storage(format!(
    "task {task_id}: state kept changing during transition to {to}"
  )))
}
