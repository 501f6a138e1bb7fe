use anyhow::{Context, Result};
use coordinator::{
  config::{CoordinatorConfig, TaskStoreType},
  detector::{Detector, HttpDetector, MockDetector},
  pg_store::PgResultSink,
  routes,
  service::Coordinator,
  source::FfmpegSourceOpener,
  state::CoordinatorState,
  store::{MemoryResultSink, ResultSink},
};
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::{info, warn};

#[tokio::main]
async fn main() -> Result<()> {
  let _log_guard = telemetry::init_with_service("coordinator");

  let config = CoordinatorConfig::from_env()?;
  let bind_addr = config.bind_addr;

  let sink: Arc<dyn ResultSink> = match config.store_type {
    TaskStoreType::Memory => {
      warn!("using in-memory result sink; tasks and detections are lost on restart");
      Arc::new(MemoryResultSink::new())
    }
    TaskStoreType::Postgres => {
      let database_url = config
        .database_url
        .as_deref()
        .context("DATABASE_URL required for Postgres")?;
      Arc::new(PgResultSink::connect(database_url, config.database_max_connections).await?)
    }
  };

  let detector: Arc<dyn Detector> = match &config.detector.url {
    Some(url) => {
      info!(url = %url, "using HTTP inference server");
      Arc::new(
        HttpDetector::new(url, config.detector.timeout).context("failed to build detector client")?,
      )
    }
    None => {
      warn!("DETECTOR_URL not set, using mock detector");
      Arc::new(MockDetector::new())
    }
  };

  let opener = Arc::new(FfmpegSourceOpener::new(config.source.clone()));
  let coordinator = Coordinator::new(sink, opener, detector, config.loop_settings.clone());

  let orphaned = coordinator
    .reconcile_orphans()
    .await
    .context("failed to reconcile tasks left over from a previous run")?;
  if !orphaned.is_empty() {
    warn!(tasks = ?orphaned, "failed tasks interrupted by restart");
  }

  let state = CoordinatorState::new(config.clone(), coordinator.clone());
  let app = routes::router(state);
  let listener = TcpListener::bind(bind_addr).await?;

  info!(
      addr = %bind_addr,
      check_interval_frames = config.loop_settings.check_interval_frames,
      media_root = %config.source.media_root.display(),
      "coordinator listening"
  );

  axum::serve(listener, app.into_make_service())
    .with_graceful_shutdown(shutdown_signal())
    .await?;

  if !coordinator.shutdown().await {
    warn!("exiting with processing loops still running");
  }

  Ok(())
}

async fn shutdown_signal() {
  let ctrl_c = async {
    let _ = tokio::signal::ctrl_c().await;
  };

  #[cfg(unix)]
  let terminate = async {
    use tokio::signal::unix::{SignalKind, signal};
    if let Ok(mut sigterm) = signal(SignalKind::terminate()) {
      let _ = sigterm.recv().await;
    }
  };

  #[cfg(not(unix))]
  let terminate = std::future::pending::<()>();

  tokio::select! {
      _ = ctrl_c => {},
      _ = terminate => {},
  }

  info!("shutdown signal received");
}
