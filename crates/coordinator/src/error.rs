use axum::{
  Json,
  http::StatusCode,
  response::{IntoResponse, Response},
};
use common::tasks::{TaskId, TaskState};
use serde::Serialize;
use thiserror::Error;

/// Errors returned by coordinator operations
#[derive(Debug, Clone, Error, PartialEq)]
pub enum CoordinatorError {
  #[error("task {task_id}: transition {from} -> {to} is not allowed")]
  InvalidTransition {
    task_id: TaskId,
    from: TaskState,
    to: TaskState,
  },

  #[error("task {0} already has a live processing session")]
  AlreadyRunning(TaskId),

  #[error("task {0} not found")]
  NotFound(TaskId),

  #[error("task {task_id} is still {state}; stop it before deleting")]
  TaskActive { task_id: TaskId, state: TaskState },

  #[error("invalid task spec: {0}")]
  InvalidSpec(String),

  #[error("frame source error: {0}")]
  SourceRead(String),

  #[error("detector error: {0}")]
  Detector(String),

  #[error("detection write failed: {0}")]
  SinkWrite(String),

  #[error("storage error: {0}")]
  Storage(String),

  #[error("coordinator is shutting down")]
  ShuttingDown,
}

impl CoordinatorError {
  /// Stable machine-readable identifier
  pub fn code(&self) -> &'static str {
    match self {
      CoordinatorError::InvalidTransition { .. } => "invalid_transition",
      CoordinatorError::AlreadyRunning(_) => "already_running",
      CoordinatorError::NotFound(_) => "not_found",
      CoordinatorError::TaskActive { .. } => "task_active",
      CoordinatorError::InvalidSpec(_) => "invalid_spec",
      CoordinatorError::SourceRead(_) => "source_read_error",
      CoordinatorError::Detector(_) => "detector_error",
      CoordinatorError::SinkWrite(_) => "sink_write_error",
      CoordinatorError::Storage(_) => "storage_error",
      CoordinatorError::ShuttingDown => "shutting_down",
    }
  }

  pub fn status(&self) -> StatusCode {
    match self {
      CoordinatorError::NotFound(_) => StatusCode::NOT_FOUND,
      CoordinatorError::InvalidTransition { .. }
      | CoordinatorError::AlreadyRunning(_)
      | CoordinatorError::TaskActive { .. } => StatusCode::CONFLICT,
      CoordinatorError::InvalidSpec(_) => StatusCode::BAD_REQUEST,
      CoordinatorError::ShuttingDown => StatusCode::SERVICE_UNAVAILABLE,
      _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
  }
}

#[derive(Debug)]
pub struct ApiError {
  status: StatusCode,
  code: &'static str,
  message: String,
}

impl ApiError {
  pub fn new(status: StatusCode, code: &'static str, message: impl Into<String>) -> Self {
    Self {
      status,
      code,
      message: message.into(),
    }
  }

  pub fn bad_request(message: impl Into<String>) -> Self {
    Self::new(StatusCode::BAD_REQUEST, "bad_request", message)
  }

  pub fn unavailable(message: impl Into<String>) -> Self {
    Self::new(StatusCode::SERVICE_UNAVAILABLE, "unavailable", message)
  }

  pub fn internal(message: impl Into<String>) -> Self {
    Self::new(StatusCode::INTERNAL_SERVER_ERROR, "internal", message)
  }

  pub fn status(&self) -> StatusCode {
    self.status
  }
}

impl From<CoordinatorError> for ApiError {
  fn from(err: CoordinatorError) -> Self {
    Self::new(err.status(), err.code(), err.to_string())
  }
}

impl IntoResponse for ApiError {
  fn into_response(self) -> Response {
    if self.status.is_server_error() {
      tracing::error!(code = self.code, error = %self.message, "request failed");
    }
    let body = Json(ErrorBody {
      error: self.message,
      code: self.code,
    });
    (self.status, body).into_response()
  }
}

impl std::fmt::Display for ApiError {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    write!(f, "{} ({})", self.message, self.status)
  }
}

impl std::error::Error for ApiError {}

#[derive(Serialize)]
struct ErrorBody {
  error: String,
  code: &'static str,
}
