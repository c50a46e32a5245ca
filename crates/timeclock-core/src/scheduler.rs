//! Detection loop: frame → embedding → identity → debounced event.
//!
//! One loop instance is a single tokio task. It suspends only while grabbing
//! a frame, while the extractor runs, and while the sink handles a fresh
//! recognition. Extractions never overlap: the loop awaits each one before
//! the next tick is considered, and the in-flight flag records that for
//! outside observers (a stuck extraction shows up as a flag that never
//! clears).

use crate::cooldown::{CooldownState, Verdict, DEFAULT_COOLDOWN};
use crate::extractor::{check_embedding, EmbeddingExtractor, ExtractError};
use crate::resolver::{EuclideanMatcher, Matcher, ResolveError, DEFAULT_MATCH_THRESHOLD};
use crate::source::FrameSource;
use crate::types::{Embedding, Identity, IdentityId, Registry};
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::sync::{mpsc, watch, Notify};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

/// Minimum delay between two extraction attempts.
pub const DEFAULT_CADENCE: Duration = Duration::from_millis(250);

/// How long one extraction may run before it is reported as stalled.
pub const DEFAULT_STALL_AFTER: Duration = Duration::from_secs(10);

#[derive(Error, Debug)]
pub enum LoopError {
    #[error("invalid loop configuration: {0}")]
    InvalidConfig(String),
    #[error(transparent)]
    Resolve(#[from] ResolveError),
    #[error("detection loop task failed: {0}")]
    TaskFailed(String),
}

#[derive(Debug, Clone)]
pub struct LoopConfig {
    /// Maximum Euclidean distance for a match (strict).
    pub threshold: f32,
    /// Suppression window after a recognition.
    pub cooldown: Duration,
    /// Minimum inter-attempt delay.
    pub cadence: Duration,
    pub stall_after: Duration,
}

impl Default for LoopConfig {
    fn default() -> Self {
        Self {
            threshold: DEFAULT_MATCH_THRESHOLD,
            cooldown: DEFAULT_COOLDOWN,
            cadence: DEFAULT_CADENCE,
            stall_after: DEFAULT_STALL_AFTER,
        }
    }
}

impl LoopConfig {
    pub fn validate(&self) -> Result<(), LoopError> {
        if !(self.threshold.is_finite() && self.threshold > 0.0) {
            return Err(LoopError::InvalidConfig(format!(
                "threshold must be positive, got {}",
                self.threshold
            )));
        }
        if self.cadence.is_zero() {
            return Err(LoopError::InvalidConfig("cadence must be non-zero".into()));
        }
        if self.cooldown.is_zero() {
            return Err(LoopError::InvalidConfig("cooldown must be non-zero".into()));
        }
        if self.stall_after.is_zero() {
            return Err(LoopError::InvalidConfig("stall_after must be non-zero".into()));
        }
        Ok(())
    }
}

/// What the kiosk should currently display.
#[derive(Debug, Clone, PartialEq)]
pub enum DetectionStatus {
    Starting,
    /// A face matched an enrolled identity (shown while the face stays).
    Recognized {
        identity: IdentityId,
        display_name: String,
        distance: f32,
    },
    NotRecognized,
    NoFace,
    CameraUnavailable,
    ModelNotReady,
    ExtractorFailed,
    /// The current extraction has been running longer than `stall_after`.
    ExtractionStalled,
    Stopped,
}

/// What the sink wants done with the cooldown after handling an event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    /// An action was recorded: clear the cooldown so the same person can
    /// trigger the opposite action right away.
    Consume,
    /// Keep suppressing until the window runs out or the face changes.
    Hold,
}

/// Receives recognition events and status changes from a detection loop.
pub trait RecognitionSink: Send + Sync {
    /// Called once per debounced recognition. The loop waits for the returned
    /// future before starting its next cycle.
    fn on_identity_recognized(
        &self,
        identity: &Identity,
        distance: f32,
    ) -> impl Future<Output = Disposition> + Send;

    /// Called whenever the display status changes.
    fn on_status(&self, _status: &DetectionStatus) {}
}

/// Counters accumulated over the life of a loop.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LoopStats {
    pub cycles: u64,
    pub frames: u64,
    pub faces: u64,
    pub no_face: u64,
    pub matches: u64,
    pub no_match: u64,
    pub fired: u64,
    pub suppressed: u64,
    pub transient_errors: u64,
    pub consumed: u64,
    pub stalls: u64,
}

/// Point-in-time view of a running loop.
#[derive(Debug, Clone, PartialEq)]
pub struct LoopSnapshot {
    pub status: DetectionStatus,
    pub cooling: Option<IdentityId>,
    pub stats: LoopStats,
}

enum Command {
    Consume(IdentityId),
}

struct Shared {
    stopped: AtomicBool,
    in_flight: AtomicBool,
    notify: Notify,
}

impl Shared {
    fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::Acquire)
    }

    /// Resolves once `stop` has been requested.
    async fn stopped(&self) {
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.is_stopped() {
                return;
            }
            notified.await;
        }
    }
}

/// Clone-safe handle to a running detection loop.
#[derive(Clone)]
pub struct LoopHandle {
    shared: Arc<Shared>,
    commands: mpsc::UnboundedSender<Command>,
    registry: Arc<watch::Sender<Registry>>,
    snapshot: watch::Receiver<LoopSnapshot>,
}

impl LoopHandle {
    /// Request the loop to stop. Idempotent; an in-flight extraction's result
    /// is discarded and no further callbacks fire.
    pub fn stop(&self) {
        if !self.shared.stopped.swap(true, Ordering::AcqRel) {
            tracing::debug!("detection loop stop requested");
        }
        self.shared.notify.notify_waiters();
    }

    pub fn is_stopped(&self) -> bool {
        self.shared.is_stopped()
    }

    /// Clear the cooldown for `id` (e.g. after a punch was recorded). Ignored
    /// if `id` is no longer the cooling identity.
    pub fn consume(&self, id: IdentityId) {
        if self.commands.send(Command::Consume(id)).is_err() {
            tracing::debug!("consume after loop exit ignored");
        }
    }

    /// Publish a new registry snapshot; the next cycle resolves against it.
    pub fn update_registry(&self, registry: Registry) {
        tracing::debug!(identities = registry.len(), "registry snapshot updated");
        self.registry.send_replace(registry);
    }

    /// True while an extraction is running.
    pub fn extraction_in_flight(&self) -> bool {
        self.shared.in_flight.load(Ordering::Acquire)
    }

    pub fn snapshot(&self) -> LoopSnapshot {
        self.snapshot.borrow().clone()
    }

    /// Subscribe to snapshot changes.
    pub fn watch(&self) -> watch::Receiver<LoopSnapshot> {
        self.snapshot.clone()
    }
}

/// A spawned detection loop and the task driving it.
pub struct RunningLoop {
    handle: LoopHandle,
    task: JoinHandle<Result<LoopStats, LoopError>>,
}

impl RunningLoop {
    pub fn handle(&self) -> LoopHandle {
        self.handle.clone()
    }

    /// Stop the loop and wait for it to exit.
    pub async fn shutdown(self) -> Result<LoopStats, LoopError> {
        self.handle.stop();
        self.join().await
    }

    /// Wait for the loop to exit on its own (stopped elsewhere, or failed).
    pub async fn join(self) -> Result<LoopStats, LoopError> {
        self.task
            .await
            .map_err(|e| LoopError::TaskFailed(e.to_string()))?
    }
}

/// Spawn a detection loop on the current tokio runtime.
pub fn spawn<S, E, K>(
    source: S,
    extractor: E,
    registry: Registry,
    sink: K,
    config: LoopConfig,
) -> Result<RunningLoop, LoopError>
where
    S: FrameSource + 'static,
    E: EmbeddingExtractor + 'static,
    K: RecognitionSink + 'static,
{
    config.validate()?;
    let matcher = EuclideanMatcher::new(config.threshold)?;

    let shared = Arc::new(Shared {
        stopped: AtomicBool::new(false),
        in_flight: AtomicBool::new(false),
        notify: Notify::new(),
    });
    let (commands_tx, commands_rx) = mpsc::unbounded_channel();
    let (registry_tx, registry_rx) = watch::channel(registry);
    let initial = LoopSnapshot {
        status: DetectionStatus::Starting,
        cooling: None,
        stats: LoopStats::default(),
    };
    let (snapshot_tx, snapshot_rx) = watch::channel(initial);

    let detection_loop = DetectionLoop {
        source,
        extractor,
        ctl: Control {
            sink,
            shared: shared.clone(),
            matcher,
            config,
            cooldown: CooldownState::new(),
            status: DetectionStatus::Starting,
            stats: LoopStats::default(),
            snapshot: snapshot_tx,
        },
        commands: commands_rx,
        registry: registry_rx,
    };

    let task = tokio::spawn(detection_loop.run());

    Ok(RunningLoop {
        handle: LoopHandle {
            shared,
            commands: commands_tx,
            registry: Arc::new(registry_tx),
            snapshot: snapshot_rx,
        },
        task,
    })
}

struct DetectionLoop<S, E, K> {
    source: S,
    extractor: E,
    ctl: Control<K>,
    commands: mpsc::UnboundedReceiver<Command>,
    registry: watch::Receiver<Registry>,
}

/// Loop state other than the I/O collaborators, split out so it can be
/// mutated while a frame grab or extraction borrows the collaborators.
struct Control<K> {
    sink: K,
    shared: Arc<Shared>,
    matcher: EuclideanMatcher,
    config: LoopConfig,
    cooldown: CooldownState,
    status: DetectionStatus,
    stats: LoopStats,
    snapshot: watch::Sender<LoopSnapshot>,
}

/// Why a cycle ended early.
enum Interrupt {
    Stopped,
    Fatal(LoopError),
}

impl<S, E, K> DetectionLoop<S, E, K>
where
    S: FrameSource,
    E: EmbeddingExtractor,
    K: RecognitionSink,
{
    async fn run(mut self) -> Result<LoopStats, LoopError> {
        tracing::info!(
            threshold = self.ctl.config.threshold,
            cooldown_ms = self.ctl.config.cooldown.as_millis() as u64,
            cadence_ms = self.ctl.config.cadence.as_millis() as u64,
            "detection loop started"
        );

        let mut ticker = tokio::time::interval(self.ctl.config.cadence);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let outcome = loop {
            tokio::select! {
                biased;
                _ = self.ctl.shared.stopped() => break Ok(()),
                Some(cmd) = self.commands.recv() => {
                    self.ctl.apply(cmd);
                    continue;
                }
                _ = ticker.tick() => {}
            }

            match self.cycle().await {
                Ok(()) => {}
                Err(Interrupt::Stopped) => break Ok(()),
                Err(Interrupt::Fatal(err)) => break Err(err),
            }
        };

        self.ctl.shared.stopped.store(true, Ordering::Release);
        self.ctl.set_status(DetectionStatus::Stopped);
        let stats = self.ctl.stats;

        match outcome {
            Ok(()) => {
                tracing::info!(?stats, "detection loop stopped");
                Ok(stats)
            }
            Err(err) => {
                tracing::error!(error = %err, ?stats, "detection loop aborted");
                Err(err)
            }
        }
    }

    async fn cycle(&mut self) -> Result<(), Interrupt> {
        while let Ok(cmd) = self.commands.try_recv() {
            self.ctl.apply(cmd);
        }
        self.ctl.stats.cycles += 1;

        let registry = self.registry.borrow_and_update().clone();

        let frame = match race_stop(&self.ctl.shared, self.source.current_frame()).await {
            None => return Err(Interrupt::Stopped),
            Some(Ok(frame)) => frame,
            Some(Err(err)) => {
                tracing::debug!(error = %err, "no frame this cycle");
                self.ctl.stats.transient_errors += 1;
                self.ctl.set_status(DetectionStatus::CameraUnavailable);
                return Ok(());
            }
        };
        self.ctl.stats.frames += 1;

        let was_in_flight = self.ctl.shared.in_flight.swap(true, Ordering::AcqRel);
        debug_assert!(!was_in_flight, "extraction started while another is in flight");
        if was_in_flight {
            tracing::error!("extraction already in flight; skipping cycle");
            return Ok(());
        }

        let result = {
            let extraction = self.extractor.extract(&frame);
            tokio::pin!(extraction);
            let stall = tokio::time::sleep(self.ctl.config.stall_after);
            tokio::pin!(stall);
            let started = Instant::now();
            let mut stalled = false;

            loop {
                tokio::select! {
                    biased;
                    _ = self.ctl.shared.stopped() => break None,
                    out = &mut extraction => break Some(out),
                    _ = &mut stall, if !stalled => {
                        stalled = true;
                        self.ctl.report_stall(started.elapsed());
                    }
                }
            }
        };
        self.ctl.shared.in_flight.store(false, Ordering::Release);

        // A stop that raced with a completed extraction still wins.
        let result = match result {
            Some(result) if !self.ctl.shared.is_stopped() => result,
            _ => return Err(Interrupt::Stopped),
        };

        let detection = match result.and_then(|d| check_embedding(&d.embedding).map(|()| d)) {
            Ok(detection) => detection,
            Err(ExtractError::NoFaceFound) => {
                // Occlusion clears the display but not a running cooldown.
                if self.ctl.cooldown.expire(Instant::now()) {
                    tracing::debug!("cooldown expired with no face in view");
                }
                self.ctl.stats.no_face += 1;
                self.ctl.set_status(DetectionStatus::NoFace);
                return Ok(());
            }
            Err(ExtractError::NotReady(msg)) => {
                tracing::debug!(reason = %msg, "extractor not ready");
                self.ctl.stats.transient_errors += 1;
                self.ctl.set_status(DetectionStatus::ModelNotReady);
                return Ok(());
            }
            Err(ExtractError::Failed(msg)) => {
                tracing::warn!(reason = %msg, "extraction failed; retrying next cycle");
                self.ctl.stats.transient_errors += 1;
                self.ctl.set_status(DetectionStatus::ExtractorFailed);
                return Ok(());
            }
        };
        self.ctl.stats.faces += 1;

        self.ctl.handle_detection(&detection.embedding, &registry).await
    }
}

impl<K: RecognitionSink> Control<K> {
    fn apply(&mut self, cmd: Command) {
        match cmd {
            Command::Consume(id) => {
                if self.cooldown.consume(&id) {
                    self.stats.consumed += 1;
                    tracing::debug!(identity = %id, "cooldown consumed");
                    self.publish();
                }
            }
        }
    }

    async fn handle_detection(
        &mut self,
        embedding: &Embedding,
        registry: &Registry,
    ) -> Result<(), Interrupt> {
        let matched = self
            .matcher
            .compare(embedding, registry)
            .map_err(|e| Interrupt::Fatal(e.into()))?;

        let Some(result) = matched else {
            self.stats.no_match += 1;
            self.cooldown.observe(None, Instant::now(), self.config.cooldown);
            self.set_status(DetectionStatus::NotRecognized);
            return Ok(());
        };

        self.stats.matches += 1;
        let id = result.identity.id.clone();
        let verdict = self
            .cooldown
            .observe(Some(&id), Instant::now(), self.config.cooldown);
        self.set_status(DetectionStatus::Recognized {
            identity: id.clone(),
            display_name: result.identity.display_name.clone(),
            distance: result.distance,
        });

        match verdict {
            Verdict::Fire => {
                self.stats.fired += 1;
                tracing::info!(
                    identity = %id,
                    name = %result.identity.display_name,
                    distance = result.distance,
                    "identity recognized"
                );
                let disposition = self
                    .sink
                    .on_identity_recognized(&result.identity, result.distance)
                    .await;
                if disposition == Disposition::Consume && self.cooldown.consume(&id) {
                    self.stats.consumed += 1;
                }
                self.publish();
            }
            Verdict::Suppress => {
                self.stats.suppressed += 1;
                tracing::trace!(identity = %id, "recognition suppressed by cooldown");
            }
            Verdict::Idle => {}
        }
        Ok(())
    }

    fn report_stall(&mut self, elapsed: Duration) {
        self.stats.stalls += 1;
        tracing::warn!(
            elapsed_ms = elapsed.as_millis() as u64,
            "extraction stalled; still waiting"
        );
        self.set_status(DetectionStatus::ExtractionStalled);
    }

    fn set_status(&mut self, status: DetectionStatus) {
        if self.status != status {
            self.sink.on_status(&status);
            self.status = status;
        }
        self.publish();
    }

    fn publish(&self) {
        self.snapshot.send_replace(LoopSnapshot {
            status: self.status.clone(),
            cooling: self.cooldown.active_identity().cloned(),
            stats: self.stats,
        });
    }
}

/// Drive `fut` unless a stop arrives first.
async fn race_stop<F: Future>(shared: &Shared, fut: F) -> Option<F::Output> {
    tokio::select! {
        biased;
        _ = shared.stopped() => None,
        out = fut => Some(out),
    }
}
