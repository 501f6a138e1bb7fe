pub mod http;
pub mod mock;

use async_trait::async_trait;
use common::tasks::{DetectedObject, DetectionParams};
use thiserror::Error;

use crate::source::Frame;

pub use http::HttpDetector;
pub use mock::{MockDetector, MockDetectorConfig};

#[derive(Debug, Clone, Error, PartialEq)]
pub enum DetectorError {
  #[error("inference request failed: {0}")]
  Request(String),

  #[error("invalid inference response: {0}")]
  Response(String),

  #[error("failed to encode frame: {0}")]
  Encode(String),
}

/// Object detector capability; model internals stay behind this trait
#[async_trait]
pub trait Detector: Send + Sync {
  /// Short identifier used in logs and metric labels
  fn id(&self) -> &'static str;

  /// Detect objects in one frame. Implementations may return objects below
  /// `params.confidence_threshold`; the caller filters.
  async fn infer(
    &self,
    frame: &Frame,
    params: &DetectionParams,
  ) -> Result<Vec<DetectedObject>, DetectorError>;
}
