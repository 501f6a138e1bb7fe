//! Client for an external YOLO inference server.
//!
//! Frames are JPEG encoded and posted as base64 JSON to `{base_url}/v1/infer`.

use async_trait::async_trait;
use base64::Engine;
use common::tasks::{DetectedObject, DetectionParams, InferenceRequest, InferenceResponse};
use image::{ImageFormat, RgbImage};
use std::{io::Cursor, time::Duration};
use tracing::debug;

use super::{Detector, DetectorError};
use crate::source::Frame;

pub struct HttpDetector {
  client: reqwest::Client,
  endpoint: String,
}

impl HttpDetector {
  pub fn new(base_url: &str, timeout: Duration) -> Result<Self, DetectorError> {
    let client = reqwest::Client::builder()
      .timeout(timeout)
      .build()
      .map_err(|e| DetectorError::Request(e.to_string()))?;
    Ok(Self {
      client,
      endpoint: format!("{}/v1/infer", base_url.trim_end_matches('/')),
    })
  }

  pub fn endpoint(&self) -> &str {
    &self.endpoint
  }
}

/// Encode an RGB24 frame as JPEG
pub fn encode_jpeg(frame: &Frame) -> Result<Vec<u8>, DetectorError> {
  let image = RgbImage::from_raw(frame.width, frame.height, frame.pixels.clone()).ok_or_else(|| {
    DetectorError::Encode(format!(
      "{} bytes do not form a {}x{} RGB frame",
      frame.pixels.len(),
      frame.width,
      frame.height
    ))
  })?;
  let mut out = Cursor::new(Vec::new());
  image
    .write_to(&mut out, ImageFormat::Jpeg)
    .map_err(|e| DetectorError::Encode(e.to_string()))?;
  Ok(out.into_inner())
}

pub fn build_request(frame: &Frame, params: &DetectionParams) -> Result<InferenceRequest, DetectorError> {
  let jpeg = encode_jpeg(frame)?;
  Ok(InferenceRequest {
    width: frame.width,
    height: frame.height,
    format: "jpeg".to_string(),
    data: base64::engine::general_purpose::STANDARD.encode(jpeg),
    confidence_threshold: params.confidence_threshold,
    iou_threshold: params.iou_threshold,
  })
}

#[async_trait]
impl Detector for HttpDetector {
  fn id(&self) -> &'static str {
    "http"
  }

  async fn infer(
    &self,
    frame: &Frame,
    params: &DetectionParams,
  ) -> Result<Vec<DetectedObject>, DetectorError> {
    let request = build_request(frame, params)?;

    let response = self
      .client
      .post(&self.endpoint)
      .json(&request)
      .send()
      .await
      .map_err(|e| DetectorError::Request(e.to_string()))?;

    if !response.status().is_success() {
      return Err(DetectorError::Response(format!(
        "inference server returned {}",
        response.status()
      )));
    }

    let body = response
      .json::<InferenceResponse>()
      .await
      .map_err(|e| DetectorError::Response(e.to_string()))?;

    debug!(
      frame = frame.sequence,
      detections = body.detections.len(),
      server_ms = ?body.processing_time_ms,
      "inference completed"
    );
    Ok(body.detections)
  }
}
