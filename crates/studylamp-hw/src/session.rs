//! Capture session lifecycle.
//!
//! [`CameraSessionManager`] owns the one live capture track. Starting a new
//! session always releases the previous track first, and dropping the
//! manager releases whatever is still held.

use crate::backoff::Backoff;
use crate::camera::{CameraError, CaptureConstraints};
use crate::frame::Frame;
use serde::Serialize;
use std::sync::{Arc, Mutex, MutexGuard};
use studylamp_core::SessionContext;
use tokio::sync::watch;

/// A live video track. Dropping it releases the underlying device.
pub trait VideoTrack: Send {
    /// Blocking read of the next frame.
    fn read_frame(&mut self) -> Result<Frame, CameraError>;

    fn label(&self) -> &str;
}

/// Something that can hand out video tracks.
pub trait CaptureDevice: Send + Sync {
    /// Blocking device acquisition.
    fn acquire(&self, constraints: &CaptureConstraints) -> Result<Box<dyn VideoTrack>, CameraError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CaptureState {
    Stopped,
    Starting,
    Active,
    PermissionDenied,
    Error,
}

/// A track plus its label, so the label can be read without waiting on a frame read.
struct LiveTrack {
    label: String,
    track: Mutex<Box<dyn VideoTrack>>,
}

struct TrackSlot {
    track: Option<Arc<LiveTrack>>,
    /// Bumped on every start/stop; a start whose generation is stale gives up.
    generation: u64,
}

fn lock(slot: &Mutex<TrackSlot>) -> MutexGuard<'_, TrackSlot> {
    slot.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Read-only view of the active track, handed to frame consumers.
#[derive(Clone)]
pub struct FrameSource {
    slot: Arc<Mutex<TrackSlot>>,
}

impl FrameSource {
    pub fn is_active(&self) -> bool {
        lock(&self.slot).track.is_some()
    }

    /// Blocking read from the active track. `None` when no session is active.
    ///
    /// The slot lock is only held long enough to grab the track, so `stop`
    /// never waits on a frame. A track released mid-read is closed once the
    /// read returns.
    pub fn read_frame(&self) -> Option<Result<Frame, CameraError>> {
        let live = lock(&self.slot).track.clone()?;
        let mut track = live.track.lock().unwrap_or_else(|p| p.into_inner());
        Some(track.read_frame())
    }
}

pub struct CameraSessionManager {
    device: Arc<dyn CaptureDevice>,
    ctx: Arc<SessionContext>,
    backoff: Backoff,
    slot: Arc<Mutex<TrackSlot>>,
    generation: watch::Sender<u64>,
    start_lock: tokio::sync::Mutex<()>,
    state: watch::Sender<CaptureState>,
}

impl CameraSessionManager {
    pub fn new(device: impl CaptureDevice + 'static, ctx: Arc<SessionContext>) -> Self {
        let (generation, _) = watch::channel(0);
        let (state, _) = watch::channel(CaptureState::Stopped);
        Self {
            device: Arc::new(device),
            ctx,
            backoff: Backoff::default(),
            slot: Arc::new(Mutex::new(TrackSlot {
                track: None,
                generation: 0,
            })),
            generation,
            start_lock: tokio::sync::Mutex::new(()),
            state,
        }
    }

    pub fn with_backoff(mut self, backoff: Backoff) -> Self {
        self.backoff = backoff;
        self
    }

    /// Release any current track and acquire a new one.
    ///
    /// Permission errors are final and recorded on the session context.
    /// Other errors are retried per the backoff policy; once it is exhausted
    /// the session reports [`CaptureState::Error`]. If another `start` or a
    /// `stop` arrives meanwhile, this call gives up and returns
    /// [`CaptureState::Stopped`].
    pub async fn start(&self, constraints: &CaptureConstraints) -> CaptureState {
        let generation = self.supersede();
        let _serial = self.start_lock.lock().await;
        let mut generation_rx = self.generation.subscribe();
        if *generation_rx.borrow_and_update() != generation {
            return CaptureState::Stopped;
        }

        self.publish(generation, CaptureState::Starting);
        let mut delays = self.backoff.delays();
        let mut attempt = 0u32;

        loop {
            attempt += 1;
            let device = Arc::clone(&self.device);
            let request = constraints.clone();
            let result = tokio::task::spawn_blocking(move || device.acquire(&request))
                .await
                .unwrap_or_else(|e| {
                    Err(CameraError::CaptureFailed(format!("acquire task failed: {e}")))
                });

            match result {
                Ok(track) => {
                    let mut slot = lock(&self.slot);
                    if slot.generation != generation {
                        drop(slot);
                        tracing::debug!(label = track.label(), "start superseded; releasing new track");
                        return CaptureState::Stopped;
                    }
                    tracing::info!(label = track.label(), attempt, "capture session active");
                    slot.track = Some(Arc::new(LiveTrack {
                        label: track.label().to_string(),
                        track: Mutex::new(track),
                    }));
                    drop(slot);
                    self.ctx.set_permission_denied(false);
                    self.publish(generation, CaptureState::Active);
                    return CaptureState::Active;
                }
                Err(e) if e.is_permission_denied() => {
                    tracing::warn!(error = %e, "camera permission denied");
                    self.ctx.set_permission_denied(true);
                    self.publish(generation, CaptureState::PermissionDenied);
                    return CaptureState::PermissionDenied;
                }
                Err(e) => match delays.next() {
                    Some(delay) => {
                        tracing::warn!(
                            error = %e,
                            attempt,
                            retry_in_ms = delay.as_millis() as u64,
                            "camera start failed; retrying"
                        );
                        tokio::select! {
                            _ = tokio::time::sleep(delay) => {}
                            _ = generation_rx.changed() => {}
                        }
                        if *self.generation.borrow() != generation {
                            tracing::debug!("start superseded during backoff");
                            return CaptureState::Stopped;
                        }
                    }
                    None => {
                        tracing::error!(error = %e, attempt, "camera start failed; giving up");
                        self.publish(generation, CaptureState::Error);
                        return CaptureState::Error;
                    }
                },
            }
        }
    }

    /// Release the active track, if any, and cancel a pending start.
    pub fn stop(&self) {
        let generation = self.supersede();
        self.publish(generation, CaptureState::Stopped);
    }

    pub fn state(&self) -> CaptureState {
        *self.state.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<CaptureState> {
        self.state.subscribe()
    }

    pub fn frame_source(&self) -> FrameSource {
        FrameSource {
            slot: Arc::clone(&self.slot),
        }
    }

    /// Start a new generation and release the current track.
    fn supersede(&self) -> u64 {
        let (released, generation) = {
            let mut slot = lock(&self.slot);
            slot.generation += 1;
            (slot.track.take(), slot.generation)
        };
        self.generation.send_replace(generation);
        if let Some(live) = released {
            tracing::info!(label = %live.label, "releasing capture track");
        }
        generation
    }

    fn publish(&self, generation: u64, state: CaptureState) {
        if lock(&self.slot).generation == generation {
            self.state.send_replace(state);
        }
    }
}

impl Drop for CameraSessionManager {
    fn drop(&mut self) {
        if let Some(live) = lock(&self.slot).track.take() {
            tracing::info!(label = %live.label, "releasing capture track on teardown");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[derive(Clone, Copy)]
    enum Outcome {
        Ok,
        Busy,
        Denied,
    }

    struct FakeTrack {
        live: Arc<AtomicUsize>,
        frames: u32,
        read_delay: Duration,
    }

    impl VideoTrack for FakeTrack {
        fn read_frame(&mut self) -> Result<Frame, CameraError> {
            std::thread::sleep(self.read_delay);
            self.frames += 1;
            Ok(Frame::from_rgb(vec![90u8; 4 * 3], 2, 2, self.frames))
        }

        fn label(&self) -> &str {
            "fake"
        }
    }

    impl Drop for FakeTrack {
        fn drop(&mut self) {
            self.live.fetch_sub(1, Ordering::SeqCst);
        }
    }

    struct FakeDevice {
        live: Arc<AtomicUsize>,
        max_live: Arc<AtomicUsize>,
        acquisitions: Arc<AtomicUsize>,
        script: Mutex<VecDeque<Outcome>>,
        read_delay: Duration,
    }

    impl FakeDevice {
        fn new(script: &[Outcome]) -> Self {
            Self {
                live: Arc::new(AtomicUsize::new(0)),
                max_live: Arc::new(AtomicUsize::new(0)),
                acquisitions: Arc::new(AtomicUsize::new(0)),
                script: Mutex::new(script.iter().copied().collect()),
                read_delay: Duration::ZERO,
            }
        }
    }

    impl CaptureDevice for FakeDevice {
        fn acquire(&self, _: &CaptureConstraints) -> Result<Box<dyn VideoTrack>, CameraError> {
            self.acquisitions.fetch_add(1, Ordering::SeqCst);
            let outcome = self.script.lock().unwrap().pop_front().unwrap_or(Outcome::Ok);
            match outcome {
                Outcome::Ok => {
                    let now = self.live.fetch_add(1, Ordering::SeqCst) + 1;
                    self.max_live.fetch_max(now, Ordering::SeqCst);
                    Ok(Box::new(FakeTrack {
                        live: Arc::clone(&self.live),
                        frames: 0,
                        read_delay: self.read_delay,
                    }))
                }
                Outcome::Busy => Err(CameraError::DeviceBusy),
                Outcome::Denied => Err(CameraError::PermissionDenied("/dev/video0".into())),
            }
        }
    }

    fn manager(script: &[Outcome]) -> (CameraSessionManager, Arc<AtomicUsize>, Arc<AtomicUsize>, Arc<AtomicUsize>) {
        let device = FakeDevice::new(script);
        let live = Arc::clone(&device.live);
        let max_live = Arc::clone(&device.max_live);
        let acquisitions = Arc::clone(&device.acquisitions);
        let mgr = CameraSessionManager::new(device, Arc::new(SessionContext::new()))
            .with_backoff(Backoff::default().without_jitter());
        (mgr, live, max_live, acquisitions)
    }

    #[tokio::test]
    async fn test_start_twice_leaves_one_handle() {
        let (mgr, live, max_live, acquisitions) = manager(&[]);
        let c = CaptureConstraints::default();

        assert_eq!(mgr.start(&c).await, CaptureState::Active);
        assert_eq!(mgr.start(&c).await, CaptureState::Active);

        assert_eq!(acquisitions.load(Ordering::SeqCst), 2);
        assert_eq!(live.load(Ordering::SeqCst), 1);
        assert_eq!(max_live.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_concurrent_starts_never_overlap_handles() {
        let (mgr, live, max_live, _) = manager(&[]);
        let mgr = Arc::new(mgr);
        let c = CaptureConstraints::default();

        let a = tokio::spawn({
            let (m, c) = (Arc::clone(&mgr), c.clone());
            async move { m.start(&c).await }
        });
        let b = tokio::spawn({
            let (m, c) = (Arc::clone(&mgr), c.clone());
            async move { m.start(&c).await }
        });
        let results = [a.await.unwrap(), b.await.unwrap()];

        assert!(results.contains(&CaptureState::Active));
        assert_eq!(live.load(Ordering::SeqCst), 1);
        assert_eq!(max_live.load(Ordering::SeqCst), 1);
        assert_eq!(mgr.state(), CaptureState::Active);
    }

    #[tokio::test]
    async fn test_permission_denied_is_recorded_and_not_retried() {
        let device = FakeDevice::new(&[Outcome::Denied]);
        let acquisitions = Arc::clone(&device.acquisitions);
        let ctx = Arc::new(SessionContext::new());
        let mgr = CameraSessionManager::new(device, Arc::clone(&ctx));

        assert_eq!(mgr.start(&CaptureConstraints::default()).await, CaptureState::PermissionDenied);
        assert!(ctx.permission_denied());
        assert_eq!(acquisitions.load(Ordering::SeqCst), 1);
        assert_eq!(mgr.state(), CaptureState::PermissionDenied);
        assert!(!mgr.frame_source().is_active());
    }

    #[tokio::test(start_paused = true)]
    async fn test_transient_errors_retry_with_backoff() {
        let (mgr, live, _, acquisitions) = manager(&[Outcome::Busy, Outcome::Busy]);
        let started = tokio::time::Instant::now();

        assert_eq!(mgr.start(&CaptureConstraints::default()).await, CaptureState::Active);

        // 1s then 2s of backoff before the third attempt.
        assert!(started.elapsed() >= Duration::from_secs(3));
        assert_eq!(acquisitions.load(Ordering::SeqCst), 3);
        assert_eq!(live.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_persistent_error_gives_up_after_cap() {
        let device = FakeDevice::new(&[Outcome::Busy; 10]);
        let acquisitions = Arc::clone(&device.acquisitions);
        let mgr = CameraSessionManager::new(device, Arc::new(SessionContext::new()))
            .with_backoff(Backoff::fixed(Duration::from_secs(1), 3));

        assert_eq!(mgr.start(&CaptureConstraints::default()).await, CaptureState::Error);
        assert_eq!(acquisitions.load(Ordering::SeqCst), 4);
        assert_eq!(mgr.state(), CaptureState::Error);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_cancels_pending_retry() {
        let (mgr, live, _, acquisitions) = manager(&[Outcome::Busy; 5]);
        let mgr = Arc::new(mgr);
        let pending = tokio::spawn({
            let m = Arc::clone(&mgr);
            async move { m.start(&CaptureConstraints::default()).await }
        });

        tokio::time::sleep(Duration::from_millis(500)).await;
        mgr.stop();

        assert_eq!(pending.await.unwrap(), CaptureState::Stopped);
        assert_eq!(acquisitions.load(Ordering::SeqCst), 1);
        assert_eq!(live.load(Ordering::SeqCst), 0);
        assert_eq!(mgr.state(), CaptureState::Stopped);
    }

    #[tokio::test]
    async fn test_stop_and_drop_release_track() {
        let (mgr, live, _, _) = manager(&[]);
        let c = CaptureConstraints::default();

        mgr.start(&c).await;
        assert_eq!(live.load(Ordering::SeqCst), 1);
        mgr.stop();
        assert_eq!(live.load(Ordering::SeqCst), 0);
        assert_eq!(mgr.state(), CaptureState::Stopped);

        mgr.start(&c).await;
        assert_eq!(live.load(Ordering::SeqCst), 1);
        drop(mgr);
        assert_eq!(live.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_frame_source_follows_session() {
        let (mgr, _, _, _) = manager(&[]);
        let source = mgr.frame_source();
        assert!(source.read_frame().is_none());

        mgr.start(&CaptureConstraints::default()).await;
        let frame = source.read_frame().unwrap().unwrap();
        assert_eq!((frame.width, frame.height), (2, 2));

        mgr.stop();
        assert!(!source.is_active());
    }

    #[tokio::test]
    async fn test_stop_does_not_wait_for_inflight_read() {
        let mut device = FakeDevice::new(&[]);
        device.read_delay = Duration::from_secs(2);
        let live = Arc::clone(&device.live);
        let mgr = CameraSessionManager::new(device, Arc::new(SessionContext::new()));
        assert_eq!(mgr.start(&CaptureConstraints::default()).await, CaptureState::Active);

        let source = mgr.frame_source();
        let reader = tokio::task::spawn_blocking(move || source.read_frame());
        tokio::time::sleep(Duration::from_millis(200)).await;

        let started = std::time::Instant::now();
        mgr.stop();
        assert!(started.elapsed() < Duration::from_millis(500));
        assert_eq!(mgr.state(), CaptureState::Stopped);
        assert!(!mgr.frame_source().is_active());

        // The released track closes as soon as the pending read returns.
        assert!(matches!(reader.await.unwrap(), Some(Ok(_))));
        assert_eq!(live.load(Ordering::SeqCst), 0);
    }
}
