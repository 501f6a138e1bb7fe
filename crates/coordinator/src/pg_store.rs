use anyhow::{Context, Result};
use async_trait::async_trait;
use common::{
  tasks::{
    BoundingBox, ClassSummary, DetectionParams, DetectionQuery, DetectionRecord, NewDetection,
    TaskKind, TaskRecord, TaskState,
  },
  validation::safe_unix_millis,
};
use sqlx::{PgPool, Row, postgres::PgPoolOptions, postgres::PgRow};
use tracing::info;

use crate::store::{ResultSink, SinkError, SinkResult};

const TASK_COLUMNS: &str = "task_id, kind, source_ref, name, confidence_threshold, iou_threshold, \
  state, created_at, started_at, ended_at, frames_processed, last_error";

const DETECTION_COLUMNS: &str = "id, task_id, frame_seq, class_name, confidence, \
  x1, y1, x2, y2, center_x, center_y, detected_at";

/// PostgreSQL-backed result sink
#[derive(Clone)]
pub struct PgResultSink {
  pool: PgPool,
}

impl From<sqlx::Error> for SinkError {
  fn from(err: sqlx::Error) -> Self {
    SinkError::Backend(err.to_string())
  }
}

impl PgResultSink {
  /// Connect, then apply the embedded migrations
  pub async fn connect(database_url: &str, max_connections: u32) -> Result<Self> {
    let pool = PgPoolOptions::new()
      .max_connections(max_connections)
      .connect(database_url)
      .await
      .context("failed to connect to database")?;

    sqlx::migrate!("./migrations")
      .run(&pool)
      .await
      .context("failed to run migrations")?;

    info!(max_connections, "result sink connected to PostgreSQL");
    Ok(Self { pool })
  }

  pub fn from_pool(pool: PgPool) -> Self {
    Self { pool }
  }

  pub fn pool(&self) -> &PgPool {
    &self.pool
  }

  fn task_from_row(row: &PgRow) -> SinkResult<TaskRecord> {
    let kind: String = row.try_get("kind")?;
    let state: String = row.try_get("state")?;
    Ok(TaskRecord {
      id: row.try_get("task_id")?,
      kind: kind.parse::<TaskKind>().map_err(SinkError::Backend)?,
      source_ref: row.try_get("source_ref")?,
      name: row.try_get("name")?,
      params: DetectionParams {
        confidence_threshold: row.try_get("confidence_threshold")?,
        iou_threshold: row.try_get("iou_threshold")?,
      },
      state: state.parse::<TaskState>().map_err(SinkError::Backend)?,
      created_at: to_u64(row.try_get("created_at")?),
      started_at: row.try_get::<Option<i64>, _>("started_at")?.map(to_u64),
      ended_at: row.try_get::<Option<i64>, _>("ended_at")?.map(to_u64),
      frames_processed: to_u64(row.try_get("frames_processed")?),
      last_error: row.try_get("last_error")?,
    })
  }

  fn detection_from_row(row: &PgRow) -> SinkResult<DetectionRecord> {
    Ok(DetectionRecord {
      id: to_u64(row.try_get("id")?),
      task_id: row.try_get("task_id")?,
      frame_seq: to_u64(row.try_get("frame_seq")?),
      class_name: row.try_get("class_name")?,
      confidence: row.try_get("confidence")?,
      bbox: BoundingBox {
        x1: row.try_get("x1")?,
        y1: row.try_get("y1")?,
        x2: row.try_get("x2")?,
        y2: row.try_get("y2")?,
      },
      center_x: row.try_get("center_x")?,
      center_y: row.try_get("center_y")?,
      detected_at: to_u64(row.try_get("detected_at")?),
    })
  }

  async fn require_task(&self, task_id: &str) -> SinkResult<()> {
    self.read_state(task_id).await.map(|_| ())
  }
}

fn to_i64(value: u64) -> i64 {
  i64::try_from(value).unwrap_or(i64::MAX)
}

fn to_u64(value: i64) -> u64 {
  u64::try_from(value).unwrap_or(0)
}

fn parse_state(value: &str) -> SinkResult<TaskState> {
  value.parse::<TaskState>().map_err(SinkError::Backend)
}

#[async_trait]
impl ResultSink for PgResultSink {
  async fn create_task(&self, record: &TaskRecord) -> SinkResult<()> {
    sqlx::query(
      r#"
      INSERT INTO detection_tasks (task_id, kind, source_ref, name, confidence_threshold,
                                   iou_threshold, state, created_at, started_at, ended_at,
                                   frames_processed, last_error)
      VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)
      "#,
    )
    .bind(&record.id)
    .bind(record.kind.as_str())
    .bind(&record.source_ref)
    .bind(&record.name)
    .bind(record.params.confidence_threshold)
    .bind(record.params.iou_threshold)
    .bind(record.state.as_str())
    .bind(to_i64(record.created_at))
    .bind(record.started_at.map(to_i64))
    .bind(record.ended_at.map(to_i64))
    .bind(to_i64(record.frames_processed))
    .bind(&record.last_error)
    .execute(&self.pool)
    .await?;
    Ok(())
  }

  async fn get_task(&self, task_id: &str) -> SinkResult<TaskRecord> {
    let sql = format!("SELECT {TASK_COLUMNS} FROM detection_tasks WHERE task_id = $1");
    let row = sqlx::query(&sql)
      .bind(task_id)
      .fetch_optional(&self.pool)
      .await?
      .ok_or_else(|| SinkError::NotFound(task_id.to_string()))?;
    Self::task_from_row(&row)
  }

  async fn list_tasks(&self, state: Option<TaskState>) -> SinkResult<Vec<TaskRecord>> {
    let sql = format!(
      "SELECT {TASK_COLUMNS} FROM detection_tasks \
       WHERE ($1::TEXT IS NULL OR state = $1) \
       ORDER BY created_at DESC, task_id"
    );
    let rows = sqlx::query(&sql)
      .bind(state.map(|s| s.as_str()))
      .fetch_all(&self.pool)
      .await?;
    rows.iter().map(Self::task_from_row).collect()
  }

  async fn read_state(&self, task_id: &str) -> SinkResult<TaskState> {
    let state: Option<String> =
      sqlx::query_scalar("SELECT state FROM detection_tasks WHERE task_id = $1")
        .bind(task_id)
        .fetch_optional(&self.pool)
        .await?;
    match state {
      Some(state) => parse_state(&state),
      None => Err(SinkError::NotFound(task_id.to_string())),
    }
  }

  async fn transition_state(
    &self,
    task_id: &str,
    from: TaskState,
    to: TaskState,
    reason: Option<&str>,
  ) -> SinkResult<TaskRecord> {
    let sql = format!(
      r#"
      UPDATE detection_tasks SET
          state = $3,
          started_at = CASE WHEN $3 = 'running' THEN COALESCE(started_at, $4) ELSE started_at END,
          ended_at = CASE WHEN $5 THEN $4 ELSE ended_at END,
          last_error = COALESCE($6, last_error)
      WHERE task_id = $1 AND state = $2
      RETURNING {TASK_COLUMNS}
      "#
    );
    let updated = sqlx::query(&sql)
      .bind(task_id)
      .bind(from.as_str())
      .bind(to.as_str())
      .bind(to_i64(safe_unix_millis()))
      .bind(to.is_terminal())
      .bind(reason)
      .fetch_optional(&self.pool)
      .await?;

    match updated {
      Some(row) => Self::task_from_row(&row),
      None => {
        let current = self.read_state(task_id).await?;
        Err(SinkError::Conflict { current })
      }
    }
  }

  async fn record_progress(&self, task_id: &str, frames_processed: u64) -> SinkResult<()> {
    let result = sqlx::query(
      "UPDATE detection_tasks SET frames_processed = GREATEST(frames_processed, $2) \
       WHERE task_id = $1",
    )
    .bind(task_id)
    .bind(to_i64(frames_processed))
    .execute(&self.pool)
    .await?;
    if result.rows_affected() == 0 {
      return Err(SinkError::NotFound(task_id.to_string()));
    }
    Ok(())
  }

  async fn write_detection(
    &self,
    task_id: &str,
    detection: &NewDetection,
  ) -> SinkResult<DetectionRecord> {
    let mut tx = self.pool.begin().await?;

    // The share lock blocks concurrent state updates until the insert commits
    let state: Option<String> =
      sqlx::query_scalar("SELECT state FROM detection_tasks WHERE task_id = $1 FOR SHARE")
        .bind(task_id)
        .fetch_optional(&mut *tx)
        .await?;
    let state = match state {
      Some(state) => parse_state(&state)?,
      None => return Err(SinkError::NotFound(task_id.to_string())),
    };
    if state != TaskState::Running {
      return Err(SinkError::NotRunning { state });
    }

    let (center_x, center_y) = detection.bbox.center();
    let id: i64 = sqlx::query_scalar(
      r#"
      INSERT INTO detections (task_id, frame_seq, class_name, confidence,
                              x1, y1, x2, y2, center_x, center_y, detected_at)
      VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
      RETURNING id
      "#,
    )
    .bind(task_id)
    .bind(to_i64(detection.frame_seq))
    .bind(&detection.class_name)
    .bind(detection.confidence)
    .bind(detection.bbox.x1)
    .bind(detection.bbox.y1)
    .bind(detection.bbox.x2)
    .bind(detection.bbox.y2)
    .bind(center_x)
    .bind(center_y)
    .bind(to_i64(detection.detected_at))
    .fetch_one(&mut *tx)
    .await?;

    tx.commit().await?;
    Ok(DetectionRecord::new(to_u64(id), task_id, detection))
  }

  async fn list_detections(
    &self,
    task_id: &str,
    query: &DetectionQuery,
  ) -> SinkResult<Vec<DetectionRecord>> {
    self.require_task(task_id).await?;
    let sql = format!(
      "SELECT {DETECTION_COLUMNS} FROM detections \
       WHERE task_id = $1 AND ($2::TEXT IS NULL OR class_name = $2) \
       ORDER BY frame_seq, id LIMIT $3 OFFSET $4"
    );
    let rows = sqlx::query(&sql)
      .bind(task_id)
      .bind(query.class_name.as_deref())
      .bind(i64::from(query.effective_limit()))
      .bind(i64::from(query.offset))
      .fetch_all(&self.pool)
      .await?;
    rows.iter().map(Self::detection_from_row).collect()
  }

  async fn detection_summary(&self, task_id: &str) -> SinkResult<Vec<ClassSummary>> {
    self.require_task(task_id).await?;
    let rows = sqlx::query(
      r#"
      SELECT class_name, COUNT(*) AS count, AVG(confidence)::REAL AS mean_confidence
      FROM detections
      WHERE task_id = $1
      GROUP BY class_name
      ORDER BY count DESC, class_name
      "#,
    )
    .bind(task_id)
    .fetch_all(&self.pool)
    .await?;

    rows
      .iter()
      .map(|row| -> SinkResult<ClassSummary> {
        Ok(ClassSummary {
          class_name: row.try_get("class_name")?,
          count: to_u64(row.try_get("count")?),
          mean_confidence: row.try_get("mean_confidence")?,
        })
      })
      .collect()
  }

  async fn delete_task_cascade(&self, task_id: &str) -> SinkResult<u64> {
    let mut tx = self.pool.begin().await?;

    // Children first so the task row never disappears ahead of its detections
    let detections = sqlx::query("DELETE FROM detections WHERE task_id = $1")
      .bind(task_id)
      .execute(&mut *tx)
      .await?
      .rows_affected();

    let tasks = sqlx::query("DELETE FROM detection_tasks WHERE task_id = $1")
      .bind(task_id)
      .execute(&mut *tx)
      .await?
      .rows_affected();

    if tasks == 0 {
      tx.rollback().await?;
      return Err(SinkError::NotFound(task_id.to_string()));
    }

    tx.commit().await?;
    Ok(detections)
  }

  async fn health_check(&self) -> SinkResult<bool> {
    sqlx::query("SELECT 1").execute(&self.pool).await?;
    Ok(true)
  }
}
