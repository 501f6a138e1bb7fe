use anyhow::{Context, Result};
use std::{env, net::SocketAddr, path::PathBuf, str::FromStr, time::Duration};

#[derive(Clone, Debug, PartialEq)]
pub enum TaskStoreType {
  Memory,
  Postgres,
}

/// Tunables of the per-task processing loop
#[derive(Clone, Debug, PartialEq)]
pub struct LoopSettings {
  /// Frames between authoritative state checks (`K`)
  pub check_interval_frames: u64,
  /// Consecutive frame read failures tolerated before a task fails
  pub source_retry_budget: u32,
  /// Consecutive detector failures tolerated before a task fails
  pub detector_retry_budget: u32,
  /// Re-check period for a paused video file task
  pub pause_poll_interval: Duration,
  /// How long `shutdown` waits for loops to drain
  pub shutdown_grace: Duration,
}

impl Default for LoopSettings {
  fn default() -> Self {
    Self {
      check_interval_frames: 30,
      source_retry_budget: 3,
      detector_retry_budget: 3,
      pause_poll_interval: Duration::from_millis(500),
      shutdown_grace: Duration::from_secs(10),
    }
  }
}

#[derive(Clone, Debug, PartialEq)]
pub struct SourceSettings {
  pub ffmpeg_bin: String,
  pub frame_width: u32,
  pub frame_height: u32,
  pub read_timeout: Duration,
  pub media_root: PathBuf,
  /// Device path pattern for numeric camera references; `{index}` is substituted
  pub camera_device_template: String,
  pub camera_input_format: String,
}

impl Default for SourceSettings {
  fn default() -> Self {
    Self {
      ffmpeg_bin: "ffmpeg".to_string(),
      frame_width: 640,
      frame_height: 480,
      read_timeout: Duration::from_millis(5000),
      media_root: PathBuf::from("./media"),
      camera_device_template: "/dev/video{index}".to_string(),
      camera_input_format: "v4l2".to_string(),
    }
  }
}

#[derive(Clone, Debug, PartialEq)]
pub struct DetectorSettings {
  /// Base URL of the inference server; the mock detector is used when unset
  pub url: Option<String>,
  pub timeout: Duration,
}

impl Default for DetectorSettings {
  fn default() -> Self {
    Self {
      url: None,
      timeout: Duration::from_millis(10_000),
    }
  }
}

#[derive(Clone, Debug)]
pub struct CoordinatorConfig {
  pub bind_addr: SocketAddr,
  pub store_type: TaskStoreType,
  pub database_url: Option<String>,
  pub database_max_connections: u32,
  pub loop_settings: LoopSettings,
  pub source: SourceSettings,
  pub detector: DetectorSettings,
}

impl CoordinatorConfig {
  pub fn from_env() -> Result<Self> {
    Self::from_lookup(|key| env::var(key).ok())
  }

  /// Build the configuration from an arbitrary key lookup.
  ///
  /// Unparseable numbers fall back to their defaults and zero counts or
  /// intervals are raised to 1.
  pub fn from_lookup<F>(lookup: F) -> Result<Self>
  where
    F: Fn(&str) -> Option<String>,
  {
    let bind = lookup("COORDINATOR_ADDR").unwrap_or_else(|| "0.0.0.0:8090".to_string());
    let bind_addr: SocketAddr = bind.parse().context("invalid COORDINATOR_ADDR")?;

    let store_type_str = lookup("TASK_STORE_TYPE").unwrap_or_else(|| "memory".to_string());
    let store_type = match store_type_str.to_lowercase().as_str() {
      "postgres" | "postgresql" => TaskStoreType::Postgres,
      _ => TaskStoreType::Memory,
    };

    let database_url = lookup("DATABASE_URL").filter(|v| !v.trim().is_empty());
    if store_type == TaskStoreType::Postgres && database_url.is_none() {
      anyhow::bail!("DATABASE_URL required for Postgres store");
    }

    let loop_defaults = LoopSettings::default();
    let loop_settings = LoopSettings {
      check_interval_frames: positive(
        &lookup,
        "STATE_CHECK_INTERVAL_FRAMES",
        loop_defaults.check_interval_frames,
      ),
      source_retry_budget: positive(
        &lookup,
        "SOURCE_RETRY_BUDGET",
        loop_defaults.source_retry_budget,
      ),
      detector_retry_budget: positive(
        &lookup,
        "DETECTOR_RETRY_BUDGET",
        loop_defaults.detector_retry_budget,
      ),
      pause_poll_interval: Duration::from_millis(positive(&lookup, "PAUSE_POLL_INTERVAL_MS", 500)),
      shutdown_grace: Duration::from_secs(positive(&lookup, "SHUTDOWN_GRACE_SECS", 10)),
    };

    let source_defaults = SourceSettings::default();
    let source = SourceSettings {
      ffmpeg_bin: lookup("FFMPEG_BIN").unwrap_or(source_defaults.ffmpeg_bin),
      frame_width: positive(&lookup, "FRAME_WIDTH", source_defaults.frame_width),
      frame_height: positive(&lookup, "FRAME_HEIGHT", source_defaults.frame_height),
      read_timeout: Duration::from_millis(positive(&lookup, "FRAME_READ_TIMEOUT_MS", 5000)),
      media_root: lookup("MEDIA_ROOT")
        .map(PathBuf::from)
        .unwrap_or(source_defaults.media_root),
      camera_device_template: lookup("CAMERA_DEVICE_TEMPLATE")
        .unwrap_or(source_defaults.camera_device_template),
      camera_input_format: lookup("CAMERA_INPUT_FORMAT")
        .unwrap_or(source_defaults.camera_input_format),
    };

    let detector = DetectorSettings {
      url: lookup("DETECTOR_URL")
        .map(|v| v.trim().trim_end_matches('/').to_string())
        .filter(|v| !v.is_empty()),
      timeout: Duration::from_millis(positive(&lookup, "DETECTOR_TIMEOUT_MS", 10_000)),
    };

    Ok(Self {
      bind_addr,
      store_type,
      database_url,
      database_max_connections: positive(&lookup, "DATABASE_MAX_CONNECTIONS", 10),
      loop_settings,
      source,
      detector,
    })
  }
}

fn positive<F, T>(lookup: &F, key: &str, default: T) -> T
where
  F: Fn(&str) -> Option<String>,
  T: FromStr + PartialOrd + From<u8>,
{
  let value = lookup(key)
    .and_then(|v| v.trim().parse::<T>().ok())
    .unwrap_or(default);
  if value < T::from(1) { T::from(1) } else { value }
}
