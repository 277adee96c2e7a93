//! Threaded frame-processing pipeline.
//!
//! A [`PipelineController`] owns one frame source and one [`FrameProcessor`]
//! (detector, tracker, counting line). On [`PipelineController::start`] both
//! move into a worker thread, which reads, masks, detects, tracks, counts and
//! annotates frames and sends them down a bounded channel. Joining the worker
//! hands the processor back, so tracking state is never shared.

use std::fmt;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use anyhow::anyhow;
use crossbeam_channel::{Receiver, SendTimeoutError, Sender, TrySendError};
use serde::Serialize;
use tracing::{debug, error, info, warn};

use crate::config::Config;
use crate::counting::{CountingLine, Point};
use crate::detection::{DetectionFilter, Detector};
use crate::error::{ConfigError, Error, Result};
use crate::frame::{Frame, FrameSource, Overlay, TrackOverlay};
use crate::tracker::{StepReport, Tracker};

/// Re-check interval for a paused worker and for a worker blocked on a full
/// event queue.
pub const POLL_INTERVAL: Duration = Duration::from_millis(100);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum PipelineState {
    Idle,
    Loaded,
    Running,
    Paused,
    Stopped,
}

impl fmt::Display for PipelineState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            PipelineState::Idle => "idle",
            PipelineState::Loaded => "loaded",
            PipelineState::Running => "running",
            PipelineState::Paused => "paused",
            PipelineState::Stopped => "stopped",
        };
        f.write_str(name)
    }
}

/// Why the run loop exited.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum StopReason {
    Requested,
    EndOfStream,
    DecodeFailure(String),
    DetectorFailure(String),
    FrameFailure(String),
}

#[derive(Debug)]
pub struct FrameEvent<F> {
    /// 1-based decode position.
    pub index: u64,
    /// Annotated frame.
    pub frame: F,
    pub count: usize,
    pub newly_counted: Vec<u64>,
    pub tracks: Vec<TrackOverlay>,
}

#[derive(Debug)]
pub enum PipelineEvent<F> {
    Frame(FrameEvent<F>),
    /// Sent once when the run loop exits, if the queue has room.
    Finished(StopReason),
}

/// Result of one cycle of [`FrameProcessor::process_frame`].
#[derive(Debug)]
pub struct ProcessedFrame<F> {
    pub frame: F,
    pub count: usize,
    pub newly_counted: Vec<u64>,
    pub tracks: Vec<TrackOverlay>,
    pub report: StepReport,
}

/// Per-frame engine: detect, filter, track, count, annotate.
pub struct FrameProcessor<D> {
    detector: D,
    filter: DetectionFilter,
    tracker: Tracker,
    line: CountingLine,
}

impl<D> FrameProcessor<D> {
    pub fn new(config: &Config, detector: D) -> Result<Self, ConfigError> {
        Ok(FrameProcessor {
            detector,
            filter: DetectionFilter::from_config(&config.classes)?,
            tracker: Tracker::new(&config.tracker),
            line: CountingLine::from_config(&config.line),
        })
    }

    /// Detection runs on the masked frame; the overlay is drawn on the
    /// original one.
    pub fn process_frame<F>(&mut self, mut frame: F, mask: Option<&F::Mask>) -> Result<ProcessedFrame<F>>
    where
        F: Frame,
        D: Detector<F>,
    {
        let raw = match mask {
            Some(mask) => {
                let (frame_size, mask_size) = (frame.size(), F::mask_size(mask));
                if frame_size != mask_size {
                    return Err(Error::Frame(anyhow!(
                        "frame size {frame_size} does not match mask size {mask_size}"
                    )));
                }
                let masked = frame.apply_mask(mask).map_err(Error::Frame)?;
                self.detector.detect(&masked)
            }
            None => self.detector.detect(&frame),
        }
        .map_err(Error::Detector)?;

        let detections = self.filter.apply(raw);
        let report = self.tracker.step(&detections);
        let newly_counted = self.line.evaluate(self.tracker.confirmed_tracks());

        let tracks: Vec<TrackOverlay> = self.tracker.confirmed_tracks().map(TrackOverlay::from_track).collect();
        let overlay = Overlay::new(&self.line, tracks.clone(), !newly_counted.is_empty());
        frame.annotate(&overlay).map_err(Error::Frame)?;

        Ok(ProcessedFrame {
            frame,
            count: self.line.count(),
            newly_counted,
            tracks,
            report,
        })
    }

    pub fn tracker(&self) -> &Tracker {
        &self.tracker
    }

    pub fn counting_line(&self) -> &CountingLine {
        &self.line
    }

    fn clear(&mut self) {
        self.tracker.reset();
        self.line.reset();
    }
}

#[derive(Debug, Clone, Copy)]
struct LineUpdate {
    start: Point,
    end: Point,
    band: i32,
}

#[derive(Debug)]
struct Control {
    state: PipelineState,
    stop_requested: bool,
    line_update: Option<LineUpdate>,
}

#[derive(Debug)]
struct Shared {
    control: Mutex<Control>,
    wake: Condvar,
    position: AtomicU64,
    count: AtomicUsize,
}

enum Gate {
    Run(Option<LineUpdate>),
    Stop,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, Control> {
        self.control.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn state(&self) -> PipelineState {
        self.lock().state
    }

    fn set_state(&self, state: PipelineState) {
        self.lock().state = state;
        self.wake.notify_all();
    }

    fn stop_requested(&self) -> bool {
        self.lock().stop_requested
    }

    /// Block while paused. Returns at once when running or asked to stop.
    fn gate(&self) -> Gate {
        let mut ctl = self.lock();
        loop {
            if ctl.stop_requested {
                return Gate::Stop;
            }
            match ctl.state {
                PipelineState::Running => return Gate::Run(ctl.line_update.take()),
                PipelineState::Paused => {
                    ctl = self
                        .wake
                        .wait_timeout(ctl, POLL_INTERVAL)
                        .unwrap_or_else(PoisonError::into_inner)
                        .0;
                }
                _ => return Gate::Stop,
            }
        }
    }

    /// Blocking send that gives up once a stop is requested.
    fn send<F>(&self, tx: &Sender<PipelineEvent<F>>, event: PipelineEvent<F>) -> bool {
        let mut event = event;
        loop {
            match tx.send_timeout(event, POLL_INTERVAL) {
                Ok(()) => return true,
                Err(SendTimeoutError::Timeout(back)) => {
                    if self.stop_requested() {
                        return false;
                    }
                    event = back;
                }
                Err(SendTimeoutError::Disconnected(_)) => return false,
            }
        }
    }
}

struct WorkerExit<D, M> {
    engine: FrameProcessor<D>,
    mask: Option<M>,
    reason: StopReason,
    error: Option<Error>,
}

fn run_worker<S, D>(
    shared: Arc<Shared>,
    tx: Sender<PipelineEvent<S::Frame>>,
    mut source: S,
    mut engine: FrameProcessor<D>,
    mask: Option<<S::Frame as Frame>::Mask>,
) -> WorkerExit<D, <S::Frame as Frame>::Mask>
where
    S: FrameSource,
    D: Detector<S::Frame>,
{
    let (reason, error) = loop {
        match shared.gate() {
            Gate::Stop => break (StopReason::Requested, None),
            Gate::Run(Some(update)) => {
                debug!(?update, "applying counting line update");
                engine.line.set_endpoints(update.start, update.end, update.band);
            }
            Gate::Run(None) => {}
        }

        let frame = match source.read() {
            Ok(Some(frame)) => frame,
            Ok(None) => break (StopReason::EndOfStream, None),
            Err(e) => {
                warn!("frame decode failed: {e:#}");
                break (StopReason::DecodeFailure(format!("{e:#}")), None);
            }
        };
        let index = shared.position.fetch_add(1, Ordering::SeqCst) + 1;

        match engine.process_frame(frame, mask.as_ref()) {
            Ok(out) => {
                shared.count.store(out.count, Ordering::SeqCst);
                let event = PipelineEvent::Frame(FrameEvent {
                    index,
                    frame: out.frame,
                    count: out.count,
                    newly_counted: out.newly_counted,
                    tracks: out.tracks,
                });
                if !shared.send(&tx, event) {
                    break (StopReason::Requested, None);
                }
            }
            Err(e) => {
                error!(frame = index, "pipeline cycle failed: {e}");
                let reason = match &e {
                    Error::Detector(inner) => StopReason::DetectorFailure(format!("{inner:#}")),
                    other => StopReason::FrameFailure(other.to_string()),
                };
                break (reason, Some(e));
            }
        }
    };

    source.release();
    shared.set_state(PipelineState::Stopped);
    info!(?reason, frames = shared.position.load(Ordering::SeqCst), "pipeline stopped");

    let finished = PipelineEvent::Finished(reason.clone());
    match reason {
        StopReason::Requested => {
            if let Err(TrySendError::Full(_)) = tx.try_send(finished) {
                debug!("event queue full, finished event dropped");
            }
        }
        _ => {
            shared.send(&tx, finished);
        }
    }

    WorkerExit {
        engine,
        mask,
        reason,
        error,
    }
}

/// Play / pause / resume / stop controller around one worker thread.
pub struct PipelineController<S: FrameSource, D> {
    shared: Arc<Shared>,
    events_tx: Sender<PipelineEvent<S::Frame>>,
    events_rx: Receiver<PipelineEvent<S::Frame>>,
    engine: Option<FrameProcessor<D>>,
    source: Option<S>,
    mask: Option<<S::Frame as Frame>::Mask>,
    worker: Option<JoinHandle<WorkerExit<D, <S::Frame as Frame>::Mask>>>,
    finished: Option<StopReason>,
    pending_error: Option<Error>,
}

impl<S, D> PipelineController<S, D>
where
    S: FrameSource,
    D: Detector<S::Frame> + 'static,
{
    pub fn new(config: &Config, detector: D) -> Result<Self> {
        config.validate()?;
        let engine = FrameProcessor::new(config, detector)?;
        let (events_tx, events_rx) = crossbeam_channel::bounded(config.pipeline.queue_capacity);
        Ok(PipelineController {
            shared: Arc::new(Shared {
                control: Mutex::new(Control {
                    state: PipelineState::Idle,
                    stop_requested: false,
                    line_update: None,
                }),
                wake: Condvar::new(),
                position: AtomicU64::new(0),
                count: AtomicUsize::new(0),
            }),
            events_tx,
            events_rx,
            engine: Some(engine),
            source: None,
            mask: None,
            worker: None,
            finished: None,
            pending_error: None,
        })
    }

    /// Frame sink. Every clone reads from the same queue.
    pub fn events(&self) -> Receiver<PipelineEvent<S::Frame>> {
        self.events_rx.clone()
    }

    pub fn state(&self) -> PipelineState {
        self.shared.state()
    }

    /// Frames read from the current source.
    pub fn position(&self) -> u64 {
        self.shared.position.load(Ordering::SeqCst)
    }

    /// Running count, readable while the worker runs.
    pub fn count(&self) -> usize {
        self.shared.count.load(Ordering::SeqCst)
    }

    /// `None` while the worker owns the tracker.
    pub fn tracker(&self) -> Option<&Tracker> {
        self.engine.as_ref().map(FrameProcessor::tracker)
    }

    /// `None` while the worker owns the counting line.
    pub fn counting_line(&self) -> Option<&CountingLine> {
        self.engine.as_ref().map(FrameProcessor::counting_line)
    }

    fn invalid(&self, op: &'static str) -> Error {
        Error::InvalidTransition {
            op,
            state: self.state(),
        }
    }

    fn engine_mut(&mut self) -> Result<&mut FrameProcessor<D>> {
        self.engine.as_mut().ok_or(Error::WorkerPanicked)
    }

    /// Open a new source at frame 0. Counts and tracks carry over.
    pub fn load(&mut self, source: S) -> Result<()> {
        self.reap();
        match self.state() {
            PipelineState::Idle | PipelineState::Loaded | PipelineState::Stopped => {}
            _ => return Err(self.invalid("load")),
        }

        if let Some(mask) = &self.mask {
            let mask_size = S::Frame::mask_size(mask);
            let frame_size = source.frame_size();
            if mask_size != frame_size {
                let mut source = source;
                source.release();
                return Err(ConfigError::MaskSizeMismatch {
                    mask: mask_size,
                    frame: frame_size,
                }
                .into());
            }
        }

        if let Some(mut old) = self.source.take() {
            old.release();
        }
        info!(size = %source.frame_size(), "source loaded");
        self.source = Some(source);
        self.engine_mut()?.detector.reset();
        self.shared.position.store(0, Ordering::SeqCst);
        {
            let mut ctl = self.shared.lock();
            ctl.state = PipelineState::Loaded;
            ctl.stop_requested = false;
        }
        self.finished = None;
        self.pending_error = None;
        Ok(())
    }

    /// Load a source and clear counts and tracks; identities restart at 1.
    pub fn restart(&mut self, source: S) -> Result<()> {
        self.load(source)?;
        self.engine_mut()?.clear();
        self.shared.count.store(0, Ordering::SeqCst);
        info!("counts cleared");
        Ok(())
    }

    /// Install a binary mask. Requires a loaded source of the same size.
    pub fn set_mask(&mut self, mask: <S::Frame as Frame>::Mask) -> Result<()> {
        self.reap();
        match self.state() {
            PipelineState::Running | PipelineState::Paused => return Err(self.invalid("set mask")),
            _ => {}
        }
        let source = self.source.as_ref().ok_or(ConfigError::MissingSource)?;
        let mask_size = S::Frame::mask_size(&mask);
        let frame_size = source.frame_size();
        if mask_size != frame_size {
            return Err(ConfigError::MaskSizeMismatch {
                mask: mask_size,
                frame: frame_size,
            }
            .into());
        }
        debug!(size = %mask_size, "mask set");
        self.mask = Some(mask);
        Ok(())
    }

    pub fn clear_mask(&mut self) -> Result<()> {
        self.reap();
        match self.state() {
            PipelineState::Running | PipelineState::Paused => Err(self.invalid("clear mask")),
            _ => {
                self.mask = None;
                Ok(())
            }
        }
    }

    /// Spawn the worker on the loaded source.
    pub fn start(&mut self) -> Result<()> {
        self.reap();
        match self.state() {
            PipelineState::Loaded => {}
            PipelineState::Idle | PipelineState::Stopped => return Err(ConfigError::MissingSource.into()),
            _ => return Err(self.invalid("start")),
        }
        let source = self.source.take().ok_or(ConfigError::MissingSource)?;
        if let Some(mask) = &self.mask {
            let mask_size = S::Frame::mask_size(mask);
            let frame_size = source.frame_size();
            if mask_size != frame_size {
                self.source = Some(source);
                return Err(ConfigError::MaskSizeMismatch {
                    mask: mask_size,
                    frame: frame_size,
                }
                .into());
            }
        }
        let engine = self.engine.take().ok_or(Error::WorkerPanicked)?;
        let mask = self.mask.take();

        {
            let mut ctl = self.shared.lock();
            ctl.state = PipelineState::Running;
            ctl.stop_requested = false;
        }
        let shared = Arc::clone(&self.shared);
        let tx = self.events_tx.clone();
        let handle = thread::Builder::new()
            .name("pipeline-worker".into())
            .spawn(move || run_worker(shared, tx, source, engine, mask))
            .map_err(|e| {
                self.shared.set_state(PipelineState::Stopped);
                Error::Spawn(e)
            })?;
        self.worker = Some(handle);
        info!("pipeline started");
        Ok(())
    }

    pub fn pause(&mut self) -> Result<()> {
        let mut ctl = self.shared.lock();
        if ctl.state != PipelineState::Running {
            let state = ctl.state;
            return Err(Error::InvalidTransition { op: "pause", state });
        }
        ctl.state = PipelineState::Paused;
        drop(ctl);
        self.shared.wake.notify_all();
        info!("pipeline paused");
        Ok(())
    }

    pub fn resume(&mut self) -> Result<()> {
        let mut ctl = self.shared.lock();
        if ctl.state != PipelineState::Paused {
            let state = ctl.state;
            return Err(Error::InvalidTransition { op: "resume", state });
        }
        ctl.state = PipelineState::Running;
        drop(ctl);
        self.shared.wake.notify_all();
        info!("pipeline resumed");
        Ok(())
    }

    /// Stop the run loop and wait for the worker to exit.
    ///
    /// Returns `Err` once for a run that ended in a detector or frame
    /// failure; later calls return the recorded [`StopReason`].
    pub fn stop(&mut self) -> Result<StopReason> {
        match self.state() {
            PipelineState::Running | PipelineState::Paused | PipelineState::Stopped => {
                self.join_worker();
                self.outcome()
            }
            PipelineState::Loaded => {
                if let Some(mut source) = self.source.take() {
                    source.release();
                }
                self.shared.set_state(PipelineState::Stopped);
                self.finished = Some(StopReason::Requested);
                info!("pipeline stopped before start");
                Ok(StopReason::Requested)
            }
            PipelineState::Idle => Err(self.invalid("stop")),
        }
    }

    /// Block until the run loop ends on its own.
    pub fn wait(&mut self) -> Result<StopReason> {
        match self.state() {
            PipelineState::Running => {
                let mut ctl = self.shared.lock();
                while ctl.state == PipelineState::Running {
                    if self.worker.as_ref().map_or(true, JoinHandle::is_finished) {
                        break;
                    }
                    ctl = self
                        .shared
                        .wake
                        .wait_timeout(ctl, POLL_INTERVAL)
                        .unwrap_or_else(PoisonError::into_inner)
                        .0;
                }
                drop(ctl);
                self.join_worker();
                self.outcome()
            }
            PipelineState::Stopped => {
                self.join_worker();
                self.outcome()
            }
            _ => Err(self.invalid("wait")),
        }
    }

    /// Move the counting line. Rejected while running; queued for the next
    /// frame while paused.
    pub fn set_line(&mut self, start: Point, end: Point, band: i32) -> Result<()> {
        if band < 0 {
            return Err(ConfigError::Invalid(format!("line band {band} is negative")).into());
        }
        let mut ctl = self.shared.lock();
        let state = ctl.state;
        match state {
            PipelineState::Running => Err(Error::InvalidTransition { op: "move line", state }),
            PipelineState::Paused => {
                ctl.line_update = Some(LineUpdate { start, end, band });
                Ok(())
            }
            _ => {
                drop(ctl);
                self.reap();
                self.engine_mut()?.line.set_endpoints(start, end, band);
                Ok(())
            }
        }
    }

    /// Join the worker if it has already left the run loop.
    fn reap(&mut self) {
        let exited = match &self.worker {
            Some(handle) => handle.is_finished() || self.state() == PipelineState::Stopped,
            None => false,
        };
        if exited {
            self.join_worker();
        }
    }

    /// Ask the worker to stop and join it, taking back its state.
    fn join_worker(&mut self) {
        let Some(handle) = self.worker.take() else {
            return;
        };
        {
            let mut ctl = self.shared.lock();
            ctl.stop_requested = true;
        }
        self.shared.wake.notify_all();

        match handle.join() {
            Ok(exit) => {
                let mut engine = exit.engine;
                if let Some(update) = self.shared.lock().line_update.take() {
                    engine.line.set_endpoints(update.start, update.end, update.band);
                }
                self.engine = Some(engine);
                self.mask = exit.mask;
                self.finished = Some(exit.reason);
                self.pending_error = exit.error;
            }
            Err(_) => {
                error!("pipeline worker panicked");
                self.finished = None;
                self.pending_error = Some(Error::WorkerPanicked);
            }
        }
        self.shared.set_state(PipelineState::Stopped);
    }

    fn outcome(&mut self) -> Result<StopReason> {
        if let Some(e) = self.pending_error.take() {
            return Err(e);
        }
        self.finished.clone().ok_or(Error::WorkerPanicked)
    }
}

impl<S: FrameSource, D> Drop for PipelineController<S, D> {
    fn drop(&mut self) {
        if let Some(handle) = self.worker.take() {
            self.shared.lock().stop_requested = true;
            self.shared.wake.notify_all();
            if handle.join().is_err() {
                error!("pipeline worker panicked");
            }
        }
        if let Some(mut source) = self.source.take() {
            source.release();
        }
    }
}
