//! ffmpeg-backed frame source.
//!
//! One ffmpeg child per task decodes the input to raw RGB24 at a fixed
//! resolution and streams it over stdout; each read takes exactly one frame.

use async_trait::async_trait;
use common::{
  tasks::TaskKind,
  validation::{resolve_media_path, safe_unix_millis, validate_uri},
};
use std::{path::PathBuf, process::Stdio, time::Duration};
use tokio::{
  io::AsyncReadExt,
  process::{Child, ChildStdout, Command},
  time::timeout,
};
use tracing::{debug, warn};

use super::{Frame, FrameRead, FrameSource, SourceError, SourceOpener};
use crate::config::SourceSettings;

const NETWORK_SCHEMES: [&str; 4] = ["rtsp://", "rtsps://", "http://", "https://"];

/// Resolved ffmpeg input for a task's source reference
#[derive(Debug, Clone, PartialEq)]
pub enum SourceInput {
  /// Local capture device read through an ffmpeg input format (e.g. v4l2)
  CameraDevice { device: String, format: String },
  NetworkStream(String),
  File(PathBuf),
}

pub struct FfmpegSourceOpener {
  settings: SourceSettings,
}

impl FfmpegSourceOpener {
  pub fn new(settings: SourceSettings) -> Self {
    Self { settings }
  }

  /// Map a task's source reference to an ffmpeg input
  pub fn resolve(&self, kind: TaskKind, source_ref: &str) -> Result<SourceInput, SourceError> {
    let source_ref = source_ref.trim();
    match kind {
      TaskKind::RealtimeCamera => {
        validate_uri(source_ref, "source_ref").map_err(|e| SourceError::Open(e.to_string()))?;
        if let Ok(index) = source_ref.parse::<u32>() {
          return Ok(SourceInput::CameraDevice {
            device: self
              .settings
              .camera_device_template
              .replace("{index}", &index.to_string()),
            format: self.settings.camera_input_format.clone(),
          });
        }
        if NETWORK_SCHEMES
          .iter()
          .any(|scheme| source_ref.to_ascii_lowercase().starts_with(scheme))
        {
          return Ok(SourceInput::NetworkStream(source_ref.to_string()));
        }
        if source_ref.starts_with("/dev/") {
          return Ok(SourceInput::CameraDevice {
            device: source_ref.to_string(),
            format: self.settings.camera_input_format.clone(),
          });
        }
        Err(SourceError::Open(format!(
          "camera source '{source_ref}' is neither a device index nor a stream URL"
        )))
      }
      TaskKind::VideoFile => resolve_media_path(source_ref, &self.settings.media_root)
        .map(SourceInput::File)
        .map_err(|e| SourceError::Open(e.to_string())),
    }
  }

  pub fn build_args(&self, input: &SourceInput) -> Vec<String> {
    let mut args: Vec<String> = ["-hide_banner", "-loglevel", "error", "-nostdin"]
      .iter()
      .map(|s| s.to_string())
      .collect();

    match input {
      SourceInput::CameraDevice { device, format } => {
        args.extend(["-f".to_string(), format.clone(), "-i".to_string(), device.clone()]);
      }
      SourceInput::NetworkStream(url) => {
        if url.to_ascii_lowercase().starts_with("rtsp") {
          args.extend(["-rtsp_transport".to_string(), "tcp".to_string()]);
        }
        args.extend(["-i".to_string(), url.clone()]);
      }
      SourceInput::File(path) => {
        args.extend(["-i".to_string(), path.to_string_lossy().to_string()]);
      }
    }

    args.extend([
      "-an".to_string(),
      "-vf".to_string(),
      format!(
        "scale={}:{}",
        self.settings.frame_width, self.settings.frame_height
      ),
      "-pix_fmt".to_string(),
      "rgb24".to_string(),
      "-f".to_string(),
      "rawvideo".to_string(),
      "pipe:1".to_string(),
    ]);
    args
  }
}

#[async_trait]
impl SourceOpener for FfmpegSourceOpener {
  fn validate(&self, kind: TaskKind, source_ref: &str) -> Result<(), SourceError> {
    self.resolve(kind, source_ref).map(|_| ())
  }

  async fn open(
    &self,
    kind: TaskKind,
    source_ref: &str,
  ) -> Result<Box<dyn FrameSource>, SourceError> {
    let input = self.resolve(kind, source_ref)?;
    let args = self.build_args(&input);
    debug!(args = ?args, "spawning ffmpeg frame source");

    let mut child = Command::new(&self.settings.ffmpeg_bin)
      .args(&args)
      .stdin(Stdio::null())
      .stdout(Stdio::piped())
      .stderr(Stdio::null())
      .kill_on_drop(true)
      .spawn()
      .map_err(|e| SourceError::Open(format!("failed to spawn {}: {e}", self.settings.ffmpeg_bin)))?;

    let stdout = child
      .stdout
      .take()
      .ok_or_else(|| SourceError::Open("ffmpeg stdout was not captured".to_string()))?;

    let width = self.settings.frame_width;
    let height = self.settings.frame_height;
    Ok(Box::new(FfmpegSource {
      child,
      stdout,
      width,
      height,
      buffer: vec![0; width as usize * height as usize * 3],
      filled: 0,
      next_sequence: 0,
      read_timeout: self.settings.read_timeout,
      closed: false,
    }))
  }
}

struct FfmpegSource {
  child: Child,
  stdout: ChildStdout,
  width: u32,
  height: u32,
  /// Partially filled frame; survives a timed-out read
  buffer: Vec<u8>,
  filled: usize,
  next_sequence: u64,
  read_timeout: Duration,
  closed: bool,
}

impl FfmpegSource {
  /// Fill the frame buffer; `false` means stdout hit EOF first
  async fn fill_frame(&mut self) -> std::io::Result<bool> {
    while self.filled < self.buffer.len() {
      let n = self.stdout.read(&mut self.buffer[self.filled..]).await?;
      if n == 0 {
        return Ok(false);
      }
      self.filled += n;
    }
    Ok(true)
  }

  async fn end_of_stream(&mut self) -> Result<FrameRead, SourceError> {
    self.closed = true;
    if self.filled > 0 {
      warn!(bytes = self.filled, "discarding truncated trailing frame");
    }
    match self.child.wait().await {
      Ok(status) if status.success() => Ok(FrameRead::EndOfStream),
      Ok(status) => Err(SourceError::Read(format!("ffmpeg exited with {status}"))),
      Err(e) => Err(SourceError::Read(format!("failed to reap ffmpeg: {e}"))),
    }
  }
}

#[async_trait]
impl FrameSource for FfmpegSource {
  async fn read(&mut self) -> Result<FrameRead, SourceError> {
    if self.closed {
      return Err(SourceError::Closed);
    }

    match timeout(self.read_timeout, self.fill_frame()).await {
      Err(_) => Err(SourceError::Timeout(self.read_timeout)),
      Ok(Err(e)) => Err(SourceError::Read(e.to_string())),
      Ok(Ok(false)) => self.end_of_stream().await,
      Ok(Ok(true)) => {
        let pixels = std::mem::replace(&mut self.buffer, vec![0; self.filled]);
        self.filled = 0;
        let sequence = self.next_sequence;
        self.next_sequence += 1;
        Ok(FrameRead::Frame(Frame {
          sequence,
          width: self.width,
          height: self.height,
          captured_at: safe_unix_millis(),
          pixels,
        }))
      }
    }
  }

  async fn close(&mut self) {
    if let Ok(Some(_)) = self.child.try_wait() {
      self.closed = true;
      return;
    }
    if let Err(e) = self.child.start_kill() {
      debug!(error = %e, "ffmpeg already gone");
    }
    let _ = self.child.wait().await;
    self.closed = true;
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use std::fs;
  use tempfile::TempDir;

  fn opener(media_root: PathBuf) -> FfmpegSourceOpener {
    FfmpegSourceOpener::new(SourceSettings {
      media_root,
      ..SourceSettings::default()
    })
  }

  #[test]
  fn camera_index_maps_to_device() {
    let opener = opener(PathBuf::from("./media"));
    let input = opener.resolve(TaskKind::RealtimeCamera, "2").unwrap();
    assert_eq!(
      input,
      SourceInput::CameraDevice {
        device: "/dev/video2".into(),
        format: "v4l2".into()
      }
    );

    let args = opener.build_args(&input);
    let joined = args.join(" ");
    assert!(joined.contains("-f v4l2 -i /dev/video2"));
    assert!(joined.ends_with("-pix_fmt rgb24 -f rawvideo pipe:1"));
    assert!(joined.contains("scale=640:480"));
  }

  #[test]
  fn rtsp_streams_use_tcp() {
    let opener = opener(PathBuf::from("./media"));
    let input = opener
      .resolve(TaskKind::RealtimeCamera, "rtsp://cam.local/stream1")
      .unwrap();
    let args = opener.build_args(&input);
    let pos = args.iter().position(|a| a == "-rtsp_transport").unwrap();
    assert_eq!(args[pos + 1], "tcp");
    assert!(args.contains(&"rtsp://cam.local/stream1".to_string()));
  }

  #[test]
  fn camera_rejects_garbage_and_injection() {
    let opener = opener(PathBuf::from("./media"));
    assert!(opener.resolve(TaskKind::RealtimeCamera, "front door").is_err());
    assert!(
      opener
        .resolve(TaskKind::RealtimeCamera, "rtsp://cam;rm -rf /")
        .is_err()
    );
    assert!(opener.resolve(TaskKind::RealtimeCamera, "").is_err());
  }

  #[test]
  fn video_files_resolve_under_media_root() {
    let dir = TempDir::new().unwrap();
    fs::write(dir.path().join("clip.mp4"), b"x").unwrap();
    let opener = opener(dir.path().to_path_buf());

    match opener.resolve(TaskKind::VideoFile, "clip.mp4").unwrap() {
      SourceInput::File(path) => assert!(path.ends_with("clip.mp4")),
      other => panic!("unexpected input {other:?}"),
    }
    assert!(opener.validate(TaskKind::VideoFile, "missing.mp4").is_err());
    assert!(opener.validate(TaskKind::VideoFile, "../clip.mp4").is_err());
  }
}
