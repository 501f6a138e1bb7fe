//! Deterministic detector for development and tests
use async_trait::async_trait;
use common::tasks::{BoundingBox, DetectedObject, DetectionParams};
use serde::{Deserialize, Serialize};
use std::time::Duration;

use super::{Detector, DetectorError};
use crate::source::Frame;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MockDetectorConfig {
  /// Classes to cycle through
  #[serde(default = "default_classes")]
  pub classes: Vec<String>,

  /// Simulated inference delay in milliseconds
  #[serde(default)]
  pub simulated_delay_ms: u64,
}

fn default_classes() -> Vec<String> {
  vec!["person".to_string(), "car".to_string(), "dog".to_string()]
}

impl Default for MockDetectorConfig {
  fn default() -> Self {
    Self {
      classes: default_classes(),
      simulated_delay_ms: 0,
    }
  }
}

pub struct MockDetector {
  config: MockDetectorConfig,
}

impl MockDetector {
  pub fn new() -> Self {
    Self::with_config(MockDetectorConfig::default())
  }

  pub fn with_config(config: MockDetectorConfig) -> Self {
    Self { config }
  }
}

impl Default for MockDetector {
  fn default() -> Self {
    Self::new()
  }
}

#[async_trait]
impl Detector for MockDetector {
  fn id(&self) -> &'static str {
    "mock"
  }

  async fn infer(
    &self,
    frame: &Frame,
    params: &DetectionParams,
  ) -> Result<Vec<DetectedObject>, DetectorError> {
    if self.config.simulated_delay_ms > 0 {
      tokio::time::sleep(Duration::from_millis(self.config.simulated_delay_ms)).await;
    }
    if self.config.classes.is_empty() {
      return Ok(Vec::new());
    }

    // 1-3 objects per frame, varied but a pure function of the sequence
    let count = (frame.sequence % 3) + 1;
    let classes = self.config.classes.len() as u64;
    let half_w = u64::from(frame.width / 2).max(1);
    let half_h = u64::from(frame.height / 2).max(1);
    let threshold = params.confidence_threshold.clamp(0.0, 1.0);

    let objects = (0..count)
      .map(|i| {
        let class_name = self.config.classes[((frame.sequence + i) % classes) as usize].clone();
        let seed = frame.sequence.wrapping_mul(7).wrapping_add(i.wrapping_mul(13));
        let x1 = (seed % half_w) as f32;
        let y1 = ((seed / 2) % half_h) as f32;
        let side = ((seed % 200) + 50) as f32;
        let confidence = (threshold + (seed % 50) as f32 / 100.0).min(1.0);

        DetectedObject {
          class_name,
          confidence,
          bbox: BoundingBox {
            x1,
            y1,
            x2: (x1 + side).min(frame.width as f32),
            y2: (y1 + side).min(frame.height as f32),
          },
        }
      })
      .collect();

    Ok(objects)
  }
}
