//! Per-task processing loop.
//!
//! The loop owns its frame source and session. It never decides the task's
//! state on its own: it re-reads the authoritative state every
//! `check_interval_frames` frames, persists detections only while that state
//! is `running`, and writes a state itself only to end the task (completed,
//! failed, or stopped on shutdown).

use common::{
  tasks::{NewDetection, TaskKind, TaskRecord, TaskState},
  validation::safe_unix_millis,
};
use std::{sync::Arc, time::Instant};
use telemetry::metrics::{
  DETECTIONS_WRITTEN, DETECTOR_LATENCY, FRAMES_PROCESSED, LOOP_FAILURES, SINK_WRITE_RETRIES,
};
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, info, info_span, warn};

use crate::{
  config::LoopSettings,
  detector::Detector,
  error::CoordinatorError,
  lifecycle::apply_transition,
  registry::{Session, SessionRegistry},
  source::{Frame, FrameRead, FrameSource, SourceOpener},
  store::{ResultSink, SinkError},
};

pub const SHUTDOWN_REASON: &str = "coordinator shutdown";

/// How a processing loop ended
#[derive(Debug, Clone, PartialEq)]
pub enum LoopExit {
  /// The loop itself moved the task to this terminal state
  Finished(TaskState),
  /// Someone else ended the task; the loop complied
  Observed(TaskState),
  /// The task row disappeared
  TaskDeleted,
}

enum WriteOutcome {
  Written,
  /// The sink refused because the task is no longer running
  Rejected,
  Failed(SinkError),
}

pub struct ProcessingLoop {
  task: TaskRecord,
  session: Arc<Session>,
  registry: SessionRegistry,
  sink: Arc<dyn ResultSink>,
  opener: Arc<dyn SourceOpener>,
  detector: Arc<dyn Detector>,
  settings: LoopSettings,
  shutdown: CancellationToken,
}

impl ProcessingLoop {
  #[allow(clippy::too_many_arguments)]
  pub fn new(
    task: TaskRecord,
    session: Arc<Session>,
    registry: SessionRegistry,
    sink: Arc<dyn ResultSink>,
    opener: Arc<dyn SourceOpener>,
    detector: Arc<dyn Detector>,
    settings: LoopSettings,
    shutdown: CancellationToken,
  ) -> Self {
    Self {
      task,
      session,
      registry,
      sink,
      opener,
      detector,
      settings,
      shutdown,
    }
  }

  pub async fn run(self) -> LoopExit {
    let span = info_span!("processing_loop", task_id = %self.task.id, kind = %self.task.kind);
    async move {
      info!(source = %self.task.source_ref, "processing loop started");

      let exit = match self.opener.open(self.task.kind, &self.task.source_ref).await {
        Ok(mut source) => {
          let exit = self.drive(source.as_mut()).await;
          source.close().await;
          exit
        }
        Err(e) => {
          LOOP_FAILURES
            .with_label_values(&["frame_source", "fatal"])
            .inc();
          self
            .finish(TaskState::Failed, Some(format!("failed to open source: {e}")))
            .await
        }
      };

      let frames = self.session.frames_processed();
      match self.sink.record_progress(&self.task.id, frames).await {
        Ok(()) | Err(SinkError::NotFound(_)) => {}
        Err(e) => warn!(error = %e, "failed to persist final progress"),
      }
      self.registry.unregister(&self.task.id).await;

      info!(frames, exit = ?exit, "processing loop exited");
      exit
    }
    .instrument(span)
    .await
  }

  async fn drive(&self, source: &mut dyn FrameSource) -> LoopExit {
    let task_id = self.task.id.as_str();
    let check_every = self.settings.check_interval_frames.max(1);
    let mut observed = TaskState::Running;
    let mut since_check = 0u64;
    let mut source_failures = 0u32;
    let mut detector_failures = 0u32;
    // Frame read but not yet processed when a file task got paused
    let mut held: Option<Frame> = None;

    loop {
      if self.shutdown.is_cancelled() {
        return self.stop_for_shutdown().await;
      }

      if observed == TaskState::Paused && self.task.kind == TaskKind::VideoFile {
        tokio::select! {
          _ = self.shutdown.cancelled() => return self.stop_for_shutdown().await,
          _ = tokio::time::sleep(self.settings.pause_poll_interval) => {}
        }
        match self.refresh(observed).await {
          Ok(state) => {
            observed = state;
            since_check = 0;
          }
          Err(exit) => return exit,
        }
        continue;
      }

      let frame = match held.take() {
        Some(frame) => frame,
        None => {
          let read = tokio::select! {
            biased;
            _ = self.shutdown.cancelled() => return self.stop_for_shutdown().await,
            read = source.read() => read,
          };

          match read {
            Ok(FrameRead::Frame(frame)) => {
              source_failures = 0;
              self.session.frame_consumed();
              FRAMES_PROCESSED
                .with_label_values(&[self.task.kind.as_str()])
                .inc();
              since_check += 1;
              frame
            }
            Ok(FrameRead::EndOfStream) => {
              info!("source exhausted");
              return self.finish(TaskState::Completed, None).await;
            }
            Err(e) => {
              source_failures += 1;
              if source_failures >= self.settings.source_retry_budget {
                LOOP_FAILURES
                  .with_label_values(&["frame_source", "fatal"])
                  .inc();
                return self
                  .finish(TaskState::Failed, Some(CoordinatorError::SourceRead(e.to_string()).to_string()))
                  .await;
              }
              LOOP_FAILURES
                .with_label_values(&["frame_source", "retried"])
                .inc();
              warn!(error = %e, failures = source_failures, "frame read failed");
              continue;
            }
          }
        }
      };

      if since_check >= check_every {
        since_check = 0;
        match self.refresh(observed).await {
          Ok(state) => observed = state,
          Err(exit) => return exit,
        }
      }

      if observed != TaskState::Running {
        if self.task.kind == TaskKind::VideoFile {
          held = Some(frame);
        }
        // cameras keep draining so the live feed does not back up
        continue;
      }

      let started = Instant::now();
      let objects = match self.detector.infer(&frame, &self.task.params).await {
        Ok(objects) => {
          DETECTOR_LATENCY
            .with_label_values(&[self.detector.id()])
            .observe(started.elapsed().as_secs_f64());
          detector_failures = 0;
          objects
        }
        Err(e) => {
          detector_failures += 1;
          if detector_failures >= self.settings.detector_retry_budget {
            LOOP_FAILURES
              .with_label_values(&["detector", "fatal"])
              .inc();
            return self
              .finish(TaskState::Failed, Some(CoordinatorError::Detector(e.to_string()).to_string()))
              .await;
          }
          LOOP_FAILURES
            .with_label_values(&["detector", "retried"])
            .inc();
          warn!(frame = frame.sequence, error = %e, failures = detector_failures, "detector failed, skipping frame");
          continue;
        }
      };

      let threshold = self.task.params.confidence_threshold;
      let detected_at = safe_unix_millis();
      for object in objects.into_iter().filter(|o| o.confidence >= threshold) {
        let detection = NewDetection::from_object(frame.sequence, detected_at, object);
        match self.write(&detection).await {
          WriteOutcome::Written => {}
          WriteOutcome::Rejected => {
            debug!(task_id, frame = frame.sequence, "write rejected, re-checking state");
            since_check = 0;
            match self.refresh(observed).await {
              Ok(state) => observed = state,
              Err(exit) => return exit,
            }
            break;
          }
          WriteOutcome::Failed(e) => {
            LOOP_FAILURES.with_label_values(&["sink", "fatal"]).inc();
            return self
              .finish(TaskState::Failed, Some(CoordinatorError::SinkWrite(e.to_string()).to_string()))
              .await;
          }
        }
      }
    }
  }

  /// Persist one detection, retrying a backend failure once
  async fn write(&self, detection: &NewDetection) -> WriteOutcome {
    let mut last_error = None;
    for attempt in 0..2 {
      match self.sink.write_detection(&self.task.id, detection).await {
        Ok(_) => {
          DETECTIONS_WRITTEN.inc();
          return WriteOutcome::Written;
        }
        Err(SinkError::NotRunning { .. }) | Err(SinkError::NotFound(_)) => {
          return WriteOutcome::Rejected;
        }
        Err(e) => {
          if attempt == 0 {
            SINK_WRITE_RETRIES.inc();
            warn!(frame = detection.frame_seq, error = %e, "detection write failed, retrying");
          }
          last_error = Some(e);
        }
      }
    }
    WriteOutcome::Failed(
      last_error.unwrap_or_else(|| SinkError::Backend("detection write failed".to_string())),
    )
  }

  /// Re-read the authoritative state. `Err` means the loop must exit.
  async fn refresh(&self, previous: TaskState) -> Result<TaskState, LoopExit> {
    let state = match self.sink.read_state(&self.task.id).await {
      Ok(state) => state,
      Err(SinkError::NotFound(_)) => {
        info!("task deleted, exiting");
        return Err(LoopExit::TaskDeleted);
      }
      Err(e) => {
        warn!(error = %e, "state check failed, keeping last known state");
        return Ok(previous);
      }
    };

    self.session.record_check(state);
    if let Err(e) = self
      .sink
      .record_progress(&self.task.id, self.session.frames_processed())
      .await
    {
      debug!(error = %e, "progress checkpoint failed");
    }

    if state.is_terminal() {
      info!(state = %state, "task ended externally, exiting");
      return Err(LoopExit::Observed(state));
    }
    if state != previous {
      info!(from = %previous, to = %state, "observed state change");
    }
    Ok(state)
  }

  /// Move the task to a terminal state; an external transition that got there
  /// first wins.
  async fn finish(&self, to: TaskState, reason: Option<String>) -> LoopExit {
    match apply_transition(self.sink.as_ref(), &self.task.id, to, reason.as_deref()).await {
      Ok(_) => {
        if let Some(reason) = &reason {
          warn!(state = %to, reason = %reason, "task ended by processing loop");
        }
        LoopExit::Finished(to)
      }
      Err(CoordinatorError::InvalidTransition { from, .. }) => LoopExit::Observed(from),
      Err(CoordinatorError::NotFound(_)) => LoopExit::TaskDeleted,
      Err(e) => {
        warn!(error = %e, state = %to, "failed to record final state");
        LoopExit::Observed(self.session.last_checked_state())
      }
    }
  }

  async fn stop_for_shutdown(&self) -> LoopExit {
    info!("shutdown requested, stopping task");
    self
      .finish(TaskState::Stopped, Some(SHUTDOWN_REASON.to_string()))
      .await
  }
}
