use crate::{error::ApiError, state::CoordinatorState};
use axum::{
  Json, Router,
  extract::{Path, Query, State},
  http::{StatusCode, header},
  response::IntoResponse,
  routing::{get, post},
};
use common::tasks::{
  CreateTaskResponse, DeleteTaskResponse, DetectionPage, DetectionQuery,
  DetectionSummaryResponse, TaskListResponse, TaskRecord, TaskSpec, TaskState, TaskStatus,
};
use serde::Deserialize;
use tower_http::trace::TraceLayer;

pub fn router(state: CoordinatorState) -> Router {
  Router::new()
    .route("/healthz", get(healthz))
    .route("/readyz", get(readyz))
    .route("/metrics", get(metrics))
    .route("/v1/tasks", get(list_tasks).post(create_task))
    .route("/v1/tasks/:id", get(get_task).delete(delete_task))
    .route("/v1/tasks/:id/start", post(start_task))
    .route("/v1/tasks/:id/pause", post(pause_task))
    .route("/v1/tasks/:id/resume", post(resume_task))
    .route("/v1/tasks/:id/stop", post(stop_task))
    .route("/v1/tasks/:id/detections", get(list_detections))
    .route("/v1/tasks/:id/summary", get(detection_summary))
    .layer(TraceLayer::new_for_http())
    .with_state(state)
}

async fn healthz() -> &'static str {
  "ok"
}

async fn readyz(State(state): State<CoordinatorState>) -> Result<&'static str, ApiError> {
  let sink = state.coordinator().sink();
  match sink.health_check().await {
    Ok(true) => Ok("ready"),
    Ok(false) => Err(ApiError::unavailable("result sink not ready")),
    Err(e) => Err(ApiError::unavailable(format!("health check failed: {}", e))),
  }
}

async fn metrics() -> Result<impl IntoResponse, ApiError> {
  let body = telemetry::metrics::encode_metrics()
    .map_err(|e| ApiError::internal(format!("failed to encode metrics: {}", e)))?;
  Ok((
    [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
    body,
  ))
}

#[derive(Debug, Deserialize)]
struct ListTasksQuery {
  state: Option<String>,
}

async fn list_tasks(
  State(state): State<CoordinatorState>,
  Query(query): Query<ListTasksQuery>,
) -> Result<Json<TaskListResponse>, ApiError> {
  let filter = match query.state.as_deref().map(str::trim) {
    None | Some("") => None,
    Some(raw) => Some(
      raw
        .parse::<TaskState>()
        .map_err(|_| ApiError::bad_request(format!("unknown task state '{}'", raw)))?,
    ),
  };
  let tasks = state.coordinator().list_tasks(filter).await?;
  Ok(Json(TaskListResponse { tasks }))
}

async fn create_task(
  State(state): State<CoordinatorState>,
  Json(spec): Json<TaskSpec>,
) -> Result<(StatusCode, Json<CreateTaskResponse>), ApiError> {
  let task_id = state.coordinator().create_task(spec).await?;
  Ok((StatusCode::CREATED, Json(CreateTaskResponse { task_id })))
}

async fn get_task(
  State(state): State<CoordinatorState>,
  Path(task_id): Path<String>,
) -> Result<Json<TaskStatus>, ApiError> {
  Ok(Json(state.coordinator().get_status(&task_id).await?))
}

async fn delete_task(
  State(state): State<CoordinatorState>,
  Path(task_id): Path<String>,
) -> Result<Json<DeleteTaskResponse>, ApiError> {
  let deleted_detections = state.coordinator().delete_task(&task_id).await?;
  Ok(Json(DeleteTaskResponse {
    task_id,
    deleted_detections,
  }))
}

async fn start_task(
  State(state): State<CoordinatorState>,
  Path(task_id): Path<String>,
) -> Result<Json<TaskRecord>, ApiError> {
  Ok(Json(state.coordinator().start_task(&task_id).await?))
}

async fn pause_task(
  State(state): State<CoordinatorState>,
  Path(task_id): Path<String>,
) -> Result<Json<TaskRecord>, ApiError> {
  Ok(Json(state.coordinator().pause_task(&task_id).await?))
}

async fn resume_task(
  State(state): State<CoordinatorState>,
  Path(task_id): Path<String>,
) -> Result<Json<TaskRecord>, ApiError> {
  Ok(Json(state.coordinator().resume_task(&task_id).await?))
}

async fn stop_task(
  State(state): State<CoordinatorState>,
  Path(task_id): Path<String>,
) -> Result<Json<TaskRecord>, ApiError> {
  Ok(Json(state.coordinator().stop_task(&task_id).await?))
}

async fn list_detections(
  State(state): State<CoordinatorState>,
  Path(task_id): Path<String>,
  Query(query): Query<DetectionQuery>,
) -> Result<Json<DetectionPage>, ApiError> {
  let detections = state
    .coordinator()
    .list_detections(&task_id, &query)
    .await?;
  Ok(Json(DetectionPage {
    task_id,
    detections,
  }))
}

async fn detection_summary(
  State(state): State<CoordinatorState>,
  Path(task_id): Path<String>,
) -> Result<Json<DetectionSummaryResponse>, ApiError> {
  let classes = state.coordinator().detection_summary(&task_id).await?;
  let total = classes.iter().map(|c| c.count).sum();
  Ok(Json(DetectionSummaryResponse {
    task_id,
    total,
    classes,
  }))
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::{
    config::{CoordinatorConfig, LoopSettings},
    detector::MockDetector,
    service::Coordinator,
    source::{FrameSource, SourceError, SourceOpener},
    store::MemoryResultSink,
  };
  use async_trait::async_trait;
  use axum::body::Body;
  use axum::http::Request;
  use common::tasks::TaskKind;
  use serde_json::json;
  use std::sync::Arc;
  use tower::ServiceExt;

  struct RejectingOpener;

  #[async_trait]
  impl SourceOpener for RejectingOpener {
    fn validate(&self, _kind: TaskKind, source_ref: &str) -> Result<(), SourceError> {
      if source_ref == "bad" {
        Err(SourceError::Open("unknown source".into()))
      } else {
        Ok(())
      }
    }

    async fn open(
      &self,
      _kind: TaskKind,
      _source_ref: &str,
    ) -> Result<Box<dyn FrameSource>, SourceError> {
      Err(SourceError::Open("no devices in tests".into()))
    }
  }

  fn test_state() -> CoordinatorState {
    let config = CoordinatorConfig::from_lookup(|_| None).unwrap();
    let coordinator = Coordinator::new(
      Arc::new(MemoryResultSink::new()),
      Arc::new(RejectingOpener),
      Arc::new(MockDetector::new()),
      LoopSettings::default(),
    );
    CoordinatorState::new(config, coordinator)
  }

  async fn send(app: &Router, method: &str, uri: &str, body: Option<serde_json::Value>) -> (StatusCode, serde_json::Value) {
    let mut builder = Request::builder().method(method).uri(uri);
    let body = match body {
      Some(value) => {
        builder = builder.header("content-type", "application/json");
        Body::from(value.to_string())
      }
      None => Body::empty(),
    };
    let resp = app
      .clone()
      .oneshot(builder.body(body).unwrap())
      .await
      .unwrap();
    let status = resp.status();
    let bytes = axum::body::to_bytes(resp.into_body(), usize::MAX)
      .await
      .unwrap();
    let value = serde_json::from_slice(&bytes).unwrap_or(serde_json::Value::Null);
    (status, value)
  }

  #[tokio::test]
  async fn create_then_get() {
    let app = router(test_state());
    let (status, body) = send(
      &app,
      "POST",
      "/v1/tasks",
      Some(json!({"kind": "realtime_camera", "source_ref": "0", "name": "lobby"})),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);
    let task_id = body["task_id"].as_str().unwrap().to_string();

    let (status, body) = send(&app, "GET", &format!("/v1/tasks/{task_id}"), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["task"]["state"], "pending");
    assert_eq!(body["task"]["name"], "lobby");
    assert!(body.get("session").is_none());
  }

  #[tokio::test]
  async fn invalid_spec_is_bad_request() {
    let app = router(test_state());
    let (status, body) = send(
      &app,
      "POST",
      "/v1/tasks",
      Some(json!({"kind": "video_file", "source_ref": "bad"})),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["code"], "invalid_spec");

    let (status, _) = send(
      &app,
      "POST",
      "/v1/tasks",
      Some(json!({"kind": "video_file", "source_ref": "clip.mp4", "params": {"confidence_threshold": 1.5}})),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
  }

  #[tokio::test]
  async fn unknown_task_is_not_found() {
    let app = router(test_state());
    let (status, body) = send(&app, "POST", "/v1/tasks/missing/pause", None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["code"], "not_found");
  }

  #[tokio::test]
  async fn disallowed_transition_is_conflict() {
    let app = router(test_state());
    let (_, body) = send(
      &app,
      "POST",
      "/v1/tasks",
      Some(json!({"kind": "realtime_camera", "source_ref": "0"})),
    )
    .await;
    let task_id = body["task_id"].as_str().unwrap().to_string();

    let (status, body) = send(&app, "POST", &format!("/v1/tasks/{task_id}/resume"), None).await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(body["code"], "invalid_transition");

    let (status, body) = send(&app, "DELETE", &format!("/v1/tasks/{task_id}"), None).await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(body["code"], "task_active");
  }

  #[tokio::test]
  async fn list_rejects_unknown_state_filter() {
    let app = router(test_state());
    let (status, _) = send(&app, "GET", "/v1/tasks?state=sleeping", None).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    let (status, body) = send(&app, "GET", "/v1/tasks?state=pending", None).await;
    assert_eq!(status, StatusCode::OK);
    assert!(body["tasks"].as_array().unwrap().is_empty());
  }

  #[tokio::test]
  async fn health_and_metrics() {
    let app = router(test_state());
    let resp = app
      .clone()
      .oneshot(Request::builder().uri("/readyz").body(Body::empty()).unwrap())
      .await
      .unwrap();
    assert_eq!(resp.status(), StatusCode::OK);

    let resp = app
      .oneshot(Request::builder().uri("/metrics").body(Body::empty()).unwrap())
      .await
      .unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
  }
}
