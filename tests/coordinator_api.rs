//! HTTP-level tests for the coordinator API

mod support;

use axum_test::TestServer;
use common::tasks::{
    CreateTaskResponse, DeleteTaskResponse, DetectionPage, DetectionSummaryResponse,
    TaskListResponse, TaskRecord, TaskState, TaskStatus,
};
use coordinator::{config::CoordinatorConfig, routes, state::CoordinatorState};
use serde_json::{json, Value};
use support::{Harness, Script, ScriptedOpener};

fn test_server(harness: &Harness) -> anyhow::Result<TestServer> {
    let config = CoordinatorConfig::from_lookup(|_| None)?;
    let state = CoordinatorState::new(config, harness.coordinator.clone());
    TestServer::new(routes::router(state))
}

async fn create(server: &TestServer, body: Value) -> String {
    let response = server.post("/v1/tasks").json(&body).await;
    assert_eq!(response.status_code(), 201);
    response.json::<CreateTaskResponse>().task_id
}

#[tokio::test]
async fn test_video_file_lifecycle_over_http() -> anyhow::Result<()> {
    let harness = Harness::new(ScriptedOpener::new().with("clip.mp4", Script::finite(10)));
    let server = test_server(&harness)?;

    let task_id = create(
        &server,
        json!({"kind": "video_file", "source_ref": "clip.mp4", "name": "dock camera export"}),
    )
    .await;

    let response = server.post(&format!("/v1/tasks/{task_id}/start")).await;
    assert_eq!(response.status_code(), 200);
    let record: TaskRecord = response.json();
    assert_eq!(record.state, TaskState::Running);

    assert!(harness.wait_for_state(&task_id, TaskState::Completed).await);
    assert!(harness.wait_for_exit(&task_id).await);

    let status: TaskStatus = server.get(&format!("/v1/tasks/{task_id}")).await.json();
    assert_eq!(status.task.state, TaskState::Completed);
    assert_eq!(status.task.frames_processed, 10);
    assert!(status.session.is_none());

    let summary: DetectionSummaryResponse = server
        .get(&format!("/v1/tasks/{task_id}/summary"))
        .await
        .json();
    assert!(summary.total >= 10);
    assert_eq!(
        summary.total,
        summary.classes.iter().map(|c| c.count).sum::<u64>()
    );

    let page: DetectionPage = server
        .get(&format!("/v1/tasks/{task_id}/detections"))
        .add_query_param("limit", 5)
        .await
        .json();
    assert_eq!(page.detections.len(), 5);
    assert!(page
        .detections
        .windows(2)
        .all(|pair| pair[0].frame_seq <= pair[1].frame_seq));

    let person: DetectionPage = server
        .get(&format!("/v1/tasks/{task_id}/detections"))
        .add_query_param("class", "person")
        .await
        .json();
    assert!(person.detections.iter().all(|d| d.class_name == "person"));

    let response = server.delete(&format!("/v1/tasks/{task_id}")).await;
    assert_eq!(response.status_code(), 200);
    let deleted: DeleteTaskResponse = response.json();
    assert_eq!(deleted.deleted_detections, summary.total);

    let response = server.get(&format!("/v1/tasks/{task_id}")).await;
    assert_eq!(response.status_code(), 404);
    Ok(())
}

#[tokio::test]
async fn test_pause_resume_stop_over_http() -> anyhow::Result<()> {
    let harness = Harness::new(ScriptedOpener::new());
    let server = test_server(&harness)?;
    let task_id = create(&server, json!({"kind": "realtime_camera", "source_ref": "0"})).await;

    server
        .post(&format!("/v1/tasks/{task_id}/start"))
        .await
        .assert_status_ok();

    // a second start finds the live session
    let response = server.post(&format!("/v1/tasks/{task_id}/start")).await;
    assert_eq!(response.status_code(), 409);
    let body: Value = response.json();
    assert_eq!(body["code"], "already_running");

    let record: TaskRecord = server
        .post(&format!("/v1/tasks/{task_id}/pause"))
        .await
        .json();
    assert_eq!(record.state, TaskState::Paused);

    let response = server.post(&format!("/v1/tasks/{task_id}/pause")).await;
    assert_eq!(response.status_code(), 409);
    let body: Value = response.json();
    assert_eq!(body["code"], "invalid_transition");
    assert!(body["error"].as_str().unwrap_or_default().contains("paused -> paused"));

    let record: TaskRecord = server
        .post(&format!("/v1/tasks/{task_id}/resume"))
        .await
        .json();
    assert_eq!(record.state, TaskState::Running);

    let response = server.delete(&format!("/v1/tasks/{task_id}")).await;
    assert_eq!(response.status_code(), 409);
    let body: Value = response.json();
    assert_eq!(body["code"], "task_active");

    let record: TaskRecord = server
        .post(&format!("/v1/tasks/{task_id}/stop"))
        .await
        .json();
    assert_eq!(record.state, TaskState::Stopped);
    assert!(harness.wait_for_exit(&task_id).await);

    let stopped: TaskListResponse = server
        .get("/v1/tasks")
        .add_query_param("state", "stopped")
        .await
        .json();
    assert_eq!(stopped.tasks.len(), 1);
    assert_eq!(stopped.tasks[0].id, task_id);

    server
        .delete(&format!("/v1/tasks/{task_id}"))
        .await
        .assert_status_ok();
    Ok(())
}

#[tokio::test]
async fn test_failed_task_reports_reason() -> anyhow::Result<()> {
    let harness = Harness::new(ScriptedOpener::new().with("rtsp://yard", Script::failing_after(2)));
    let server = test_server(&harness)?;
    let task_id = create(
        &server,
        json!({"kind": "realtime_camera", "source_ref": "rtsp://yard"}),
    )
    .await;

    server
        .post(&format!("/v1/tasks/{task_id}/start"))
        .await
        .assert_status_ok();
    assert!(harness.wait_for_state(&task_id, TaskState::Failed).await);
    assert!(harness.wait_for_exit(&task_id).await);

    let status: TaskStatus = server.get(&format!("/v1/tasks/{task_id}")).await.json();
    assert_eq!(status.task.state, TaskState::Failed);
    assert!(status
        .task
        .last_error
        .unwrap_or_default()
        .contains("decoder hiccup"));

    let response = server.post(&format!("/v1/tasks/{task_id}/resume")).await;
    assert_eq!(response.status_code(), 409);
    Ok(())
}

#[tokio::test]
async fn test_create_rejects_bad_input() -> anyhow::Result<()> {
    let harness = Harness::new(ScriptedOpener::new());
    let server = test_server(&harness)?;

    let response = server
        .post("/v1/tasks")
        .json(&json!({"kind": "video_file", "source_ref": "  "}))
        .await;
    assert_eq!(response.status_code(), 400);
    let body: Value = response.json();
    assert_eq!(body["code"], "invalid_spec");

    let response = server
        .post("/v1/tasks")
        .json(&json!({
            "kind": "realtime_camera",
            "source_ref": "0",
            "params": {"confidence_threshold": 0.5, "iou_threshold": -0.1}
        }))
        .await;
    assert_eq!(response.status_code(), 400);

    let tasks: TaskListResponse = server.get("/v1/tasks").await.json();
    assert!(tasks.tasks.is_empty());
    Ok(())
}

#[tokio::test]
async fn test_start_during_shutdown_is_unavailable() -> anyhow::Result<()> {
    let harness = Harness::new(ScriptedOpener::new());
    let server = test_server(&harness)?;
    let task_id = create(
        &server,
        json!({"kind": "realtime_camera", "source_ref": "rtsp://gate"}),
    )
    .await;

    assert!(harness.coordinator.shutdown().await);

    let response = server.post(&format!("/v1/tasks/{task_id}/start")).await;
    assert_eq!(response.status_code(), 503);
    let body: Value = response.json();
    assert_eq!(body["code"], "shutting_down");

    let status: TaskStatus = server.get(&format!("/v1/tasks/{task_id}")).await.json();
    assert_eq!(status.task.state, TaskState::Pending);
    Ok(())
}
