//! Frame sources: where a processing loop pulls decoded frames from.

pub mod ffmpeg;

use async_trait::async_trait;
use common::tasks::TaskKind;
use std::time::Duration;
use thiserror::Error;

pub use ffmpeg::{FfmpegSourceOpener, SourceInput};

/// One decoded frame, packed RGB24
#[derive(Debug, Clone)]
pub struct Frame {
  /// Zero-based position in the stream
  pub sequence: u64,
  pub width: u32,
  pub height: u32,
  /// Unix timestamp in milliseconds
  pub captured_at: u64,
  pub pixels: Vec<u8>,
}

#[derive(Debug)]
pub enum FrameRead {
  Frame(Frame),
  EndOfStream,
}

#[derive(Debug, Clone, Error, PartialEq)]
pub enum SourceError {
  #[error("failed to open source: {0}")]
  Open(String),

  #[error("failed to read frame: {0}")]
  Read(String),

  #[error("no frame within {0:?}")]
  Timeout(Duration),

  #[error("source is closed")]
  Closed,
}

#[async_trait]
pub trait FrameSource: Send {
  async fn read(&mut self) -> Result<FrameRead, SourceError>;

  /// Release the underlying device or process; safe to call more than once
  async fn close(&mut self);
}

#[async_trait]
pub trait SourceOpener: Send + Sync {
  /// Reject source references that can never be opened; run at task creation
  fn validate(&self, _kind: TaskKind, _source_ref: &str) -> Result<(), SourceError> {
    Ok(())
  }

  async fn open(
    &self,
    kind: TaskKind,
    source_ref: &str,
  ) -> Result<Box<dyn FrameSource>, SourceError>;
}
