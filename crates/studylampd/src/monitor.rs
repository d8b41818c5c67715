use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use studylamp_core::detector::DetectorError;
use studylamp_core::{
    Detection, LoadError, ModelLoader, PresenceDebouncer, PresenceState, SessionContext, SingleFlight,
};
use studylamp_hw::{CameraError, CameraSessionManager, CaptureConstraints, CaptureState, FrameSource};
use thiserror::Error;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

#[derive(Error, Debug)]
pub enum ProbeError {
    #[error("camera error: {0}")]
    Camera(#[from] CameraError),
    #[error("detector error: {0}")]
    Detector(#[from] DetectorError),
}

#[derive(Error, Debug)]
pub enum MonitorError {
    #[error("presence monitor exited")]
    ChannelClosed,
}

/// Invoked with the new stable value on every presence transition.
pub type PresenceCallback = Arc<dyn Fn(bool) + Send + Sync>;

/// Blocking access to "grab a frame and run the model".
pub trait PresenceProbe: Send + Sync + 'static {
    /// Whether a capture session and a model are both available.
    fn ready(&self) -> bool;

    /// One capture + inference. `None` when there was nothing to read.
    fn probe(&self) -> Option<Result<Detection, ProbeError>>;

    /// Frames seen so far that were too dark to be useful.
    fn dark_frames(&self) -> u64 {
        0
    }
}

/// Probe backed by the live camera session and the loaded model.
pub struct CameraProbe {
    frames: FrameSource,
    loader: Arc<ModelLoader>,
    dark_frames: AtomicU64,
}

impl CameraProbe {
    pub fn new(frames: FrameSource, loader: Arc<ModelLoader>) -> Self {
        Self {
            frames,
            loader,
            dark_frames: AtomicU64::new(0),
        }
    }
}

impl PresenceProbe for CameraProbe {
    fn ready(&self) -> bool {
        self.frames.is_active() && self.loader.get().is_some()
    }

    fn probe(&self) -> Option<Result<Detection, ProbeError>> {
        let model = self.loader.get()?;
        let frame = match self.frames.read_frame()? {
            Ok(frame) => frame,
            Err(e) => return Some(Err(e.into())),
        };
        if frame.is_dark {
            self.dark_frames.fetch_add(1, Ordering::Relaxed);
            tracing::trace!(seq = frame.sequence, "dark frame");
        }
        Some(
            model
                .infer(&frame.data, frame.width, frame.height)
                .map_err(ProbeError::from),
        )
    }

    fn dark_frames(&self) -> u64 {
        self.dark_frames.load(Ordering::Relaxed)
    }
}

/// Load the model, then start capture.
///
/// Capture is never attempted while the model is unavailable. Safe to call
/// again after a failure: the loader retries and `start` replaces any
/// existing session.
pub async fn start_capture(
    loader: &ModelLoader,
    camera: &CameraSessionManager,
    constraints: &CaptureConstraints,
) -> Result<CaptureState, LoadError> {
    if let Err(e) = loader.ensure_loaded().await {
        tracing::error!(error = %e, "presence detection unavailable");
        return Err(e);
    }
    let state = camera.start(constraints).await;
    match state {
        CaptureState::Active => {}
        CaptureState::PermissionDenied => {
            tracing::error!("camera permission denied; presence detection disabled")
        }
        state => tracing::warn!(?state, "camera did not start"),
    }
    Ok(state)
}

/// Point-in-time view of the monitor.
#[derive(Debug, Clone, Serialize)]
pub struct MonitorSnapshot {
    pub presence: PresenceState,
    pub paused: bool,
    pub polling: bool,
    pub polls: u64,
    pub skipped_busy: u64,
    pub skipped_not_ready: u64,
    pub failures: u64,
    pub dark_frames: u64,
}

/// Messages sent from D-Bus handlers to the monitor task.
enum MonitorRequest {
    Pause { reply: oneshot::Sender<()> },
    Resume { reply: oneshot::Sender<()> },
    Snapshot { reply: oneshot::Sender<MonitorSnapshot> },
}

/// Clone-safe handle to the monitor task.
#[derive(Clone)]
pub struct MonitorHandle {
    tx: mpsc::Sender<MonitorRequest>,
    presence: watch::Receiver<bool>,
}

impl MonitorHandle {
    /// Stop polling. The stable presence value is kept.
    pub async fn pause(&self) -> Result<(), MonitorError> {
        let (reply, rx) = oneshot::channel();
        self.request(MonitorRequest::Pause { reply }).await?;
        rx.await.map_err(|_| MonitorError::ChannelClosed)
    }

    /// Restart polling with fresh hysteresis counters.
    pub async fn resume(&self) -> Result<(), MonitorError> {
        let (reply, rx) = oneshot::channel();
        self.request(MonitorRequest::Resume { reply }).await?;
        rx.await.map_err(|_| MonitorError::ChannelClosed)
    }

    pub async fn snapshot(&self) -> Result<MonitorSnapshot, MonitorError> {
        let (reply, rx) = oneshot::channel();
        self.request(MonitorRequest::Snapshot { reply }).await?;
        rx.await.map_err(|_| MonitorError::ChannelClosed)
    }

    /// Current stable presence value.
    pub fn is_present(&self) -> bool {
        *self.presence.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<bool> {
        self.presence.clone()
    }

    async fn request(&self, req: MonitorRequest) -> Result<(), MonitorError> {
        self.tx.send(req).await.map_err(|_| MonitorError::ChannelClosed)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TickOutcome {
    Submitted,
    Busy,
    NotReady,
    Paused,
}

/// Poll outcome tagged with the epoch it was started in.
type PollResult = (u64, Option<Result<Detection, ProbeError>>);

struct Monitor<P: PresenceProbe> {
    probe: Arc<P>,
    ctx: Arc<SessionContext>,
    on_change: PresenceCallback,
    debouncer: PresenceDebouncer,
    flight: Arc<SingleFlight>,
    paused: bool,
    /// Bumped on pause/resume; results from an older epoch are dropped.
    epoch: u64,
    presence_tx: watch::Sender<bool>,
    polls: u64,
    skipped_busy: u64,
    skipped_not_ready: u64,
    failures: u64,
}

impl<P: PresenceProbe> Monitor<P> {
    fn new(probe: P, ctx: Arc<SessionContext>, on_change: PresenceCallback) -> Self {
        let (presence_tx, _) = watch::channel(false);
        Self {
            probe: Arc::new(probe),
            ctx,
            on_change,
            debouncer: PresenceDebouncer::new(),
            flight: Arc::new(SingleFlight::new()),
            paused: false,
            epoch: 0,
            presence_tx,
            polls: 0,
            skipped_busy: 0,
            skipped_not_ready: 0,
            failures: 0,
        }
    }

    fn polling_enabled(&self) -> bool {
        !self.paused || self.ctx.auto_pause_override()
    }

    fn on_tick(&mut self, results: &mpsc::UnboundedSender<PollResult>) -> TickOutcome {
        if !self.polling_enabled() {
            return TickOutcome::Paused;
        }
        let Some(permit) = self.flight.try_acquire_owned() else {
            self.skipped_busy += 1;
            tracing::trace!("poll still in flight; skipping tick");
            return TickOutcome::Busy;
        };
        if !self.probe.ready() {
            self.skipped_not_ready += 1;
            return TickOutcome::NotReady;
        }

        let probe = Arc::clone(&self.probe);
        let epoch = self.epoch;
        let results = results.clone();
        tokio::task::spawn_blocking(move || {
            let _permit = permit;
            let outcome = probe.probe();
            let _ = results.send((epoch, outcome));
        });
        TickOutcome::Submitted
    }

    fn on_result(&mut self, epoch: u64, outcome: Option<Result<Detection, ProbeError>>) {
        if epoch != self.epoch || !self.polling_enabled() {
            tracing::trace!(epoch, current = self.epoch, "discarding stale poll result");
            return;
        }
        let detection = match outcome {
            Some(Ok(detection)) => detection,
            Some(Err(e)) => {
                self.failures += 1;
                tracing::debug!(error = %e, "presence poll failed; skipping");
                return;
            }
            None => {
                self.skipped_not_ready += 1;
                return;
            }
        };

        self.polls += 1;
        if let Some(present) = self.debouncer.observe(detection.classify()) {
            tracing::info!(present, confidence = detection.confidence, "presence changed");
            self.presence_tx.send_replace(present);
            (self.on_change)(present);
        }
    }

    fn pause(&mut self) {
        if !self.paused {
            tracing::info!("presence polling paused");
        }
        self.paused = true;
        if !self.ctx.auto_pause_override() {
            self.epoch += 1;
        }
    }

    fn resume(&mut self) {
        if self.paused {
            tracing::info!("presence polling resumed");
        }
        self.paused = false;
        self.epoch += 1;
        self.debouncer.reset_counters();
    }

    fn snapshot(&self) -> MonitorSnapshot {
        MonitorSnapshot {
            presence: self.debouncer.state(),
            paused: self.paused,
            polling: self.polling_enabled(),
            polls: self.polls,
            skipped_busy: self.skipped_busy,
            skipped_not_ready: self.skipped_not_ready,
            failures: self.failures,
            dark_frames: self.probe.dark_frames(),
        }
    }

    async fn run(
        mut self,
        interval: Duration,
        mut requests: mpsc::Receiver<MonitorRequest>,
        cancel: CancellationToken,
    ) {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let (result_tx, mut result_rx) = mpsc::unbounded_channel::<PollResult>();
        let ctx = Arc::clone(&self.ctx);
        let mut was_polling = self.polling_enabled();

        tracing::info!(interval_ms = interval.as_millis() as u64, "presence monitor started");
        loop {
            // Register for flag changes before reading them so a flip in
            // between still wakes this iteration.
            let changed = ctx.notified();
            tokio::pin!(changed);
            changed.as_mut().enable();

            let polling = self.polling_enabled();
            if polling && !was_polling {
                ticker.reset();
            }
            was_polling = polling;

            tokio::select! {
                _ = cancel.cancelled() => break,
                req = requests.recv() => match req {
                    Some(MonitorRequest::Pause { reply }) => {
                        self.pause();
                        let _ = reply.send(());
                    }
                    Some(MonitorRequest::Resume { reply }) => {
                        self.resume();
                        let _ = reply.send(());
                    }
                    Some(MonitorRequest::Snapshot { reply }) => {
                        let _ = reply.send(self.snapshot());
                    }
                    None => break,
                },
                Some((epoch, outcome)) = result_rx.recv() => self.on_result(epoch, outcome),
                _ = ticker.tick(), if polling => {
                    self.on_tick(&result_tx);
                }
                _ = &mut changed => {}
            }
        }
        tracing::info!("presence monitor stopped");
    }
}

/// Spawn the presence monitor task.
///
/// Polls `probe` every `interval` and calls `on_change` on stable transitions
/// until `cancel` fires or every handle is dropped.
pub fn spawn_monitor<P: PresenceProbe>(
    probe: P,
    ctx: Arc<SessionContext>,
    interval: Duration,
    on_change: PresenceCallback,
    cancel: CancellationToken,
) -> (MonitorHandle, JoinHandle<()>) {
    let monitor = Monitor::new(probe, ctx, on_change);
    let presence = monitor.presence_tx.subscribe();
    let (tx, rx) = mpsc::channel(8);
    let task = tokio::spawn(monitor.run(interval, rx, cancel));
    (MonitorHandle { tx, presence }, task)
}
