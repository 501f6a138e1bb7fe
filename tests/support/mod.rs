#![allow(dead_code)]

use async_trait::async_trait;
use common::tasks::{
    ClassSummary, DetectedObject, DetectionParams, DetectionQuery, DetectionRecord, NewDetection,
    TaskKind, TaskRecord, TaskSpec, TaskState,
};
use coordinator::{
    config::LoopSettings,
    detector::{Detector, DetectorError, MockDetector},
    source::{Frame, FrameRead, FrameSource, SourceError, SourceOpener},
    store::{MemoryResultSink, ResultSink, SinkError, SinkResult},
    Coordinator,
};
use std::{
    collections::HashMap,
    future::Future,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc, Mutex,
    },
    time::Duration,
};

pub const CHECK_INTERVAL: u64 = 5;

/// How a scripted source behaves once opened
#[derive(Debug, Clone)]
pub struct Script {
    /// `None` streams forever
    pub frames: Option<u64>,
    /// Every read after this many frames fails
    pub fail_after: Option<u64>,
    /// Every n-th read call fails without consuming a frame
    pub fail_every: Option<u64>,
    pub frame_delay: Duration,
    pub open_error: bool,
}

impl Script {
    pub fn finite(frames: u64) -> Self {
        Self {
            frames: Some(frames),
            fail_after: None,
            fail_every: None,
            frame_delay: Duration::from_millis(1),
            open_error: false,
        }
    }

    pub fn endless() -> Self {
        Self {
            frames: None,
            fail_after: None,
            fail_every: None,
            frame_delay: Duration::from_millis(2),
            open_error: false,
        }
    }

    pub fn failing_after(frames: u64) -> Self {
        Self {
            fail_after: Some(frames),
            ..Self::endless()
        }
    }

    /// Endless stream where every `every`-th read errors between good frames
    pub fn hiccuping_every(every: u64) -> Self {
        Self {
            fail_every: Some(every),
            ..Self::endless()
        }
    }

    pub fn unopenable() -> Self {
        Self {
            open_error: true,
            ..Self::endless()
        }
    }
}

/// Opens in-memory sources by `source_ref`; unknown refs get an endless stream
#[derive(Default)]
pub struct ScriptedOpener {
    scripts: Mutex<HashMap<String, Script>>,
    opened: AtomicUsize,
    closed: Arc<AtomicUsize>,
}

impl ScriptedOpener {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(self, source_ref: &str, script: Script) -> Self {
        self.scripts
            .lock()
            .unwrap()
            .insert(source_ref.to_string(), script);
        self
    }

    pub fn opened(&self) -> usize {
        self.opened.load(Ordering::SeqCst)
    }

    pub fn closed(&self) -> usize {
        self.closed.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl SourceOpener for ScriptedOpener {
    fn validate(&self, _kind: TaskKind, source_ref: &str) -> Result<(), SourceError> {
        if source_ref.trim().is_empty() {
            return Err(SourceError::Open("empty source reference".into()));
        }
        Ok(())
    }

    async fn open(
        &self,
        _kind: TaskKind,
        source_ref: &str,
    ) -> Result<Box<dyn FrameSource>, SourceError> {
        let script = self
            .scripts
            .lock()
            .unwrap()
            .get(source_ref)
            .cloned()
            .unwrap_or_else(Script::endless);
        if script.open_error {
            return Err(SourceError::Open(format!("{source_ref}: no such device")));
        }
        self.opened.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(ScriptedSource {
            script,
            next: 0,
            reads: 0,
            closed: false,
            close_counter: self.closed.clone(),
        }))
    }
}

struct ScriptedSource {
    script: Script,
    next: u64,
    reads: u64,
    closed: bool,
    close_counter: Arc<AtomicUsize>,
}

#[async_trait]
impl FrameSource for ScriptedSource {
    async fn read(&mut self) -> Result<FrameRead, SourceError> {
        if self.closed {
            return Err(SourceError::Closed);
        }
        tokio::time::sleep(self.script.frame_delay).await;
        self.reads += 1;

        if let Some(every) = self.script.fail_every {
            if every > 0 && self.reads % every == 0 {
                return Err(SourceError::Read("dropped packet".into()));
            }
        }

        if let Some(limit) = self.script.fail_after {
            if self.next >= limit {
                return Err(SourceError::Read("decoder hiccup".into()));
            }
        }
        if let Some(total) = self.script.frames {
            if self.next >= total {
                return Ok(FrameRead::EndOfStream);
            }
        }

        let sequence = self.next;
        self.next += 1;
        Ok(FrameRead::Frame(Frame {
            sequence,
            width: 4,
            height: 4,
            captured_at: sequence * 40,
            pixels: vec![(sequence % 255) as u8; 4 * 4 * 3],
        }))
    }

    async fn close(&mut self) {
        if !self.closed {
            self.closed = true;
            self.close_counter.fetch_add(1, Ordering::SeqCst);
        }
    }
}

/// Detector that always fails
pub struct FailingDetector;

#[async_trait]
impl Detector for FailingDetector {
    fn id(&self) -> &'static str {
        "failing"
    }

    async fn infer(
        &self,
        _frame: &Frame,
        _params: &DetectionParams,
    ) -> Result<Vec<DetectedObject>, DetectorError> {
        Err(DetectorError::Request("connection refused".into()))
    }
}

/// Detector that fails every other call, starting with the first
#[derive(Default)]
pub struct AlternatingDetector {
    inner: MockDetector,
    calls: AtomicUsize,
}

impl AlternatingDetector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn failures(&self) -> usize {
        self.calls.load(Ordering::SeqCst).div_ceil(2)
    }
}

#[async_trait]
impl Detector for AlternatingDetector {
    fn id(&self) -> &'static str {
        "alternating"
    }

    async fn infer(
        &self,
        frame: &Frame,
        params: &DetectionParams,
    ) -> Result<Vec<DetectedObject>, DetectorError> {
        if self.calls.fetch_add(1, Ordering::SeqCst) % 2 == 0 {
            return Err(DetectorError::Request("inference timed out".into()));
        }
        self.inner.infer(frame, params).await
    }
}

/// Memory sink whose next `remaining` detection writes fail with a backend error
pub struct UnreliableSink {
    inner: Arc<MemoryResultSink>,
    remaining: AtomicUsize,
    injected: AtomicUsize,
}

impl UnreliableSink {
    pub fn failing(inner: Arc<MemoryResultSink>, writes: usize) -> Self {
        Self {
            inner,
            remaining: AtomicUsize::new(writes),
            injected: AtomicUsize::new(0),
        }
    }

    /// Every detection write fails
    pub fn broken(inner: Arc<MemoryResultSink>) -> Self {
        Self::failing(inner, usize::MAX)
    }

    /// Writes that were failed so far
    pub fn injected(&self) -> usize {
        self.injected.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ResultSink for UnreliableSink {
    async fn create_task(&self, record: &TaskRecord) -> SinkResult<()> {
        self.inner.create_task(record).await
    }
    async fn get_task(&self, task_id: &str) -> SinkResult<TaskRecord> {
        self.inner.get_task(task_id).await
    }
    async fn list_tasks(&self, state: Option<TaskState>) -> SinkResult<Vec<TaskRecord>> {
        self.inner.list_tasks(state).await
    }
    async fn read_state(&self, task_id: &str) -> SinkResult<TaskState> {
        self.inner.read_state(task_id).await
    }
    async fn transition_state(
        &self,
        task_id: &str,
        from: TaskState,
        to: TaskState,
        reason: Option<&str>,
    ) -> SinkResult<TaskRecord> {
        self.inner.transition_state(task_id, from, to, reason).await
    }
    async fn record_progress(&self, task_id: &str, frames: u64) -> SinkResult<()> {
        self.inner.record_progress(task_id, frames).await
    }
    async fn write_detection(
        &self,
        task_id: &str,
        detection: &NewDetection,
    ) -> SinkResult<DetectionRecord> {
        let fail = self
            .remaining
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if fail {
            self.injected.fetch_add(1, Ordering::SeqCst);
            return Err(SinkError::Backend("db down".into()));
        }
        self.inner.write_detection(task_id, detection).await
    }
    async fn list_detections(
        &self,
        task_id: &str,
        query: &DetectionQuery,
    ) -> SinkResult<Vec<DetectionRecord>> {
        self.inner.list_detections(task_id, query).await
    }
    async fn detection_summary(&self, task_id: &str) -> SinkResult<Vec<ClassSummary>> {
        self.inner.detection_summary(task_id).await
    }
    async fn delete_task_cascade(&self, task_id: &str) -> SinkResult<u64> {
        self.inner.delete_task_cascade(task_id).await
    }
}

pub fn loop_settings() -> LoopSettings {
    LoopSettings {
        check_interval_frames: CHECK_INTERVAL,
        source_retry_budget: 3,
        detector_retry_budget: 3,
        pause_poll_interval: Duration::from_millis(10),
        shutdown_grace: Duration::from_secs(5),
    }
}

pub struct Harness {
    pub coordinator: Coordinator,
    pub sink: Arc<MemoryResultSink>,
    pub opener: Arc<ScriptedOpener>,
}

impl Harness {
    pub fn new(opener: ScriptedOpener) -> Self {
        Self::with_detector(opener, Arc::new(MockDetector::new()))
    }

    pub fn with_detector(opener: ScriptedOpener, detector: Arc<dyn Detector>) -> Self {
        let sink = Arc::new(MemoryResultSink::new());
        Self::build(opener, detector, sink.clone(), sink)
    }

    /// Route the coordinator through `sink`; `memory` is the store it wraps
    pub fn with_sink(
        opener: ScriptedOpener,
        memory: Arc<MemoryResultSink>,
        sink: Arc<dyn ResultSink>,
    ) -> Self {
        Self::build(opener, Arc::new(MockDetector::new()), memory, sink)
    }

    fn build(
        opener: ScriptedOpener,
        detector: Arc<dyn Detector>,
        memory: Arc<MemoryResultSink>,
        sink: Arc<dyn ResultSink>,
    ) -> Self {
        let opener = Arc::new(opener);
        let coordinator = Coordinator::new(sink, opener.clone(), detector, loop_settings());
        Self {
            coordinator,
            sink: memory,
            opener,
        }
    }

    pub async fn create(&self, kind: TaskKind, source_ref: &str) -> String {
        self.coordinator
            .create_task(TaskSpec {
                kind,
                source_ref: source_ref.to_string(),
                name: None,
                params: DetectionParams::default(),
            })
            .await
            .unwrap()
    }

    pub async fn state(&self, task_id: &str) -> TaskState {
        self.sink.read_state(task_id).await.unwrap()
    }

    pub async fn detection_count(&self, task_id: &str) -> u64 {
        self.sink
            .detection_summary(task_id)
            .await
            .map(|classes| classes.iter().map(|c| c.count).sum())
            .unwrap_or(0)
    }

    /// Wait until the task's loop has unregistered its session
    pub async fn wait_for_exit(&self, task_id: &str) -> bool {
        let registry = self.coordinator.registry().clone();
        let id = task_id.to_string();
        wait_for(Duration::from_secs(5), move || {
            let registry = registry.clone();
            let id = id.clone();
            async move { !registry.contains(&id).await }
        })
        .await
    }

    pub async fn wait_for_state(&self, task_id: &str, state: TaskState) -> bool {
        let sink = self.sink.clone();
        let id = task_id.to_string();
        wait_for(Duration::from_secs(5), move || {
            let sink = sink.clone();
            let id = id.clone();
            async move { sink.read_state(&id).await.ok() == Some(state) }
        })
        .await
    }
}

/// Poll `check` until it holds or `timeout` elapses
pub async fn wait_for<F, Fut>(timeout: Duration, mut check: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if check().await {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}
