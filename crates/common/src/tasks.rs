//! Detection task contracts shared by the coordinator, its stores and its API.
//!
//! This module defines the task lifecycle vocabulary, the detection record
//! shape persisted by result sinks, and the wire format spoken with external
//! inference servers.

use serde::{Deserialize, Serialize};
use std::{fmt, str::FromStr};

/// Opaque task identifier (UUID v4 string).
pub type TaskId = String;

/// What a task analyses
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskKind {
    /// Live camera device or network stream
    RealtimeCamera,

    /// Uploaded or mounted video file
    VideoFile,
}

impl TaskKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskKind::RealtimeCamera => "realtime_camera",
            TaskKind::VideoFile => "video_file",
        }
    }
}

impl fmt::Display for TaskKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TaskKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "realtime_camera" => Ok(TaskKind::RealtimeCamera),
            "video_file" => Ok(TaskKind::VideoFile),
            _ => Err(format!("unknown task kind '{s}'")),
        }
    }
}

/// Authoritative lifecycle state of a task
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskState {
    /// Created, no processing loop yet
    Pending,

    /// Loop is consuming frames and persisting detections
    Running,

    /// Loop is alive but must not persist detections
    Paused,

    /// Source was exhausted
    Completed,

    /// Unrecoverable error
    Failed,

    /// Stopped on request
    Stopped,
}

impl TaskState {
    pub const ALL: [TaskState; 6] = [
        TaskState::Pending,
        TaskState::Running,
        TaskState::Paused,
        TaskState::Completed,
        TaskState::Failed,
        TaskState::Stopped,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            TaskState::Pending => "pending",
            TaskState::Running => "running",
            TaskState::Paused => "paused",
            TaskState::Completed => "completed",
            TaskState::Failed => "failed",
            TaskState::Stopped => "stopped",
        }
    }

    /// No transition leaves a terminal state.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskState::Completed | TaskState::Failed | TaskState::Stopped
        )
    }

    /// States in which a processing loop is expected to exist.
    pub fn is_active(&self) -> bool {
        matches!(self, TaskState::Running | TaskState::Paused)
    }
}

impl fmt::Display for TaskState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TaskState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "pending" => Ok(TaskState::Pending),
            "running" => Ok(TaskState::Running),
            "paused" => Ok(TaskState::Paused),
            "completed" => Ok(TaskState::Completed),
            "failed" => Ok(TaskState::Failed),
            "stopped" => Ok(TaskState::Stopped),
            _ => Err(format!("unknown task state '{s}'")),
        }
    }
}

/// Detector thresholds attached to a task
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct DetectionParams {
    /// Minimum confidence for a detection to be persisted (0.0 to 1.0)
    #[serde(default = "default_confidence_threshold")]
    pub confidence_threshold: f32,

    /// IoU threshold handed to the detector's non-max suppression (0.0 to 1.0)
    #[serde(default = "default_iou_threshold")]
    pub iou_threshold: f32,
}

fn default_confidence_threshold() -> f32 {
    0.5
}

fn default_iou_threshold() -> f32 {
    0.45
}

impl Default for DetectionParams {
    fn default() -> Self {
        Self {
            confidence_threshold: default_confidence_threshold(),
            iou_threshold: default_iou_threshold(),
        }
    }
}

/// Request body for task creation
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskSpec {
    pub kind: TaskKind,

    /// Camera index / stream URL, or video file path
    pub source_ref: String,

    /// Optional display name
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,

    #[serde(default)]
    pub params: DetectionParams,
}

/// Authoritative task row
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskRecord {
    pub id: TaskId,
    pub kind: TaskKind,
    pub source_ref: String,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,

    pub params: DetectionParams,
    pub state: TaskState,

    /// Unix timestamp in milliseconds
    pub created_at: u64,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at: Option<u64>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub ended_at: Option<u64>,

    /// Frames consumed by the processing loop, as of its last checkpoint
    pub frames_processed: u64,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
}

/// Axis-aligned box in frame pixel coordinates
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BoundingBox {
    pub x1: f32,
    pub y1: f32,
    pub x2: f32,
    pub y2: f32,
}

impl BoundingBox {
    pub fn center(&self) -> (f32, f32) {
        ((self.x1 + self.x2) / 2.0, (self.y1 + self.y2) / 2.0)
    }

    pub fn width(&self) -> f32 {
        (self.x2 - self.x1).max(0.0)
    }

    pub fn height(&self) -> f32 {
        (self.y2 - self.y1).max(0.0)
    }
}

/// One object reported by a detector
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DetectedObject {
    #[serde(rename = "class")]
    pub class_name: String,
    pub confidence: f32,
    pub bbox: BoundingBox,
}

/// Detection about to be written; the sink assigns the record id
#[derive(Debug, Clone, PartialEq)]
pub struct NewDetection {
    pub frame_seq: u64,
    pub class_name: String,
    pub confidence: f32,
    pub bbox: BoundingBox,
    pub detected_at: u64,
}

impl NewDetection {
    pub fn from_object(frame_seq: u64, detected_at: u64, object: DetectedObject) -> Self {
        Self {
            frame_seq,
            class_name: object.class_name,
            confidence: object.confidence,
            bbox: object.bbox,
            detected_at,
        }
    }
}

/// Persisted detection, owned by exactly one task
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DetectionRecord {
    pub id: u64,
    pub task_id: TaskId,
    pub frame_seq: u64,
    #[serde(rename = "class")]
    pub class_name: String,
    pub confidence: f32,
    pub bbox: BoundingBox,
    pub center_x: f32,
    pub center_y: f32,

    /// Unix timestamp in milliseconds
    pub detected_at: u64,
}

impl DetectionRecord {
    pub fn new(id: u64, task_id: &str, detection: &NewDetection) -> Self {
        let (center_x, center_y) = detection.bbox.center();
        Self {
            id,
            task_id: task_id.to_string(),
            frame_seq: detection.frame_seq,
            class_name: detection.class_name.clone(),
            confidence: detection.confidence,
            bbox: detection.bbox,
            center_x,
            center_y,
            detected_at: detection.detected_at,
        }
    }
}

/// Paging and filtering for detection browsing
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DetectionQuery {
    #[serde(default, rename = "class", skip_serializing_if = "Option::is_none")]
    pub class_name: Option<String>,

    #[serde(default = "default_page_limit")]
    pub limit: u32,

    #[serde(default)]
    pub offset: u32,
}

pub const MAX_PAGE_LIMIT: u32 = 1000;

fn default_page_limit() -> u32 {
    100
}

impl Default for DetectionQuery {
    fn default() -> Self {
        Self {
            class_name: None,
            limit: default_page_limit(),
            offset: 0,
        }
    }
}

impl DetectionQuery {
    pub fn effective_limit(&self) -> u32 {
        self.limit.clamp(1, MAX_PAGE_LIMIT)
    }
}

/// Per-class aggregate for a task
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClassSummary {
    #[serde(rename = "class")]
    pub class_name: String,
    pub count: u64,
    pub mean_confidence: f32,
}

/// In-memory view of a live processing loop
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionSnapshot {
    pub running: bool,
    pub frames_processed: u64,
    pub last_checked_state: TaskState,
    pub last_check_frame: u64,
}

/// Result of `get_status`: the authoritative record plus the session, if any
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskStatus {
    pub task: TaskRecord,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub session: Option<SessionSnapshot>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateTaskResponse {
    pub task_id: TaskId,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeleteTaskResponse {
    pub task_id: TaskId,
    pub deleted_detections: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskListResponse {
    pub tasks: Vec<TaskRecord>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DetectionPage {
    pub task_id: TaskId,
    pub detections: Vec<DetectionRecord>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DetectionSummaryResponse {
    pub task_id: TaskId,
    pub total: u64,
    pub classes: Vec<ClassSummary>,
}

/// Frame submitted to an external inference server
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InferenceRequest {
    pub width: u32,
    pub height: u32,

    /// Image format of `data` (e.g., "jpeg")
    pub format: String,

    /// Image bytes, base64 encoded for JSON transport
    pub data: String,

    pub confidence_threshold: f32,
    pub iou_threshold: f32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InferenceResponse {
    #[serde(default)]
    pub detections: Vec<DetectedObject>,

    /// Processing latency reported by the server
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub processing_time_ms: Option<u64>,
}
