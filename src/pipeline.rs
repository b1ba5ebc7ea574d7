//! Pipeline orchestration: admission, fault surfacing, and shutdown.
//!
//! ```text
//!                    ┌─────────────┐      ┌──────────────┐
//!  submit() ────────▶│  admission  │─────▶│  resolver    │──┐
//!  (acquisition      │  semaphore  │      │  workers ×R  │  │ completions
//!   loop)            └─────────────┘      └──────────────┘  ▼
//!                           ▲                      ┌───────────────┐
//!                           │ one permit returned  │  broadcaster  │──▶ sink
//!                           │ per broadcast point  │  (reordering) │
//!                           └──────────────────────┴───────────────┘
//! ```
//!
//! # State Machine
//!
//! ```text
//! ┌──────┐  shutdown()   ┌──────────┐  drained/timeout  ┌────────┐
//! │ Open │──────────────▶│ Draining │──────────────────▶│ Closed │
//! └──────┘               └──────────┘                   └────────┘
//!     │                                                     ▲
//!     │  shutdown_now()                                     │
//!     └─────────────────────────────────────────────────────┘
//! ```
//!
//! `submit` is only valid while `Open`; afterwards it fails fast instead of
//! blocking a producer forever. Both terminal transitions run the sink's
//! `complete_collection` exactly once.
//!
//! # Fault surfacing
//!
//! The first resolution or persistence fault is held in a cell and returned
//! by the producer's *next* call (`submit`, `shutdown`, or `shutdown_now`),
//! then cleared. A producer that never calls again never observes the fault;
//! surfacing is opportunistic, not proactive, and that trade-off is part of
//! the contract.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::{mpsc, Mutex, Semaphore};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::broadcast::{DrainSummary, OrderedBroadcaster, SharedSink};
use crate::config::PipelineConfig;
use crate::error::{PipelineError, PipelineResult};
use crate::point::{ScanPoint, SequencedPoint};
use crate::resolver;
use crate::sink::ScanSink;

/// Pipeline lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum PipelineState {
    /// Accepting points.
    Open,
    /// Shutdown requested; admitted points are still resolving.
    Draining,
    /// Terminal; no further points are accepted.
    Closed,
}

impl std::fmt::Display for PipelineState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PipelineState::Open => write!(f, "open"),
            PipelineState::Draining => write!(f, "draining"),
            PipelineState::Closed => write!(f, "closed"),
        }
    }
}

/// First-fault-wins cell holding the error that will abort the scan.
///
/// Whichever worker faults first owns the record; later faults are logged
/// and dropped. The record is cleared only by being surfaced to the
/// producer, so each fault is reported exactly once.
#[derive(Debug, Default)]
struct FaultCell {
    slot: parking_lot::Mutex<Option<PipelineError>>,
}

impl FaultCell {
    fn record(&self, fault: PipelineError) {
        let mut slot = self.slot.lock();
        if let Some(existing) = slot.as_ref() {
            warn!("suppressing later fault ({fault}); first fault still pending: {existing}");
        } else {
            *slot = Some(fault);
        }
    }

    fn take(&self) -> Option<PipelineError> {
        self.slot.lock().take()
    }

    fn peek(&self) -> Option<String> {
        self.slot.lock().as_ref().map(ToString::to_string)
    }
}

/// State shared between the producer handle, the resolver workers, and the
/// broadcaster.
pub(crate) struct PipelineShared {
    /// Admission permits; one per in-flight point. Closed on fault or
    /// teardown so a blocked producer wakes up.
    pub(crate) admission: Semaphore,
    fault: FaultCell,
    submitted: AtomicU64,
    broadcast: AtomicU64,
}

impl PipelineShared {
    pub(crate) fn new(config: &PipelineConfig) -> Self {
        Self {
            admission: Semaphore::new(config.capacity),
            fault: FaultCell::default(),
            submitted: AtomicU64::new(0),
            broadcast: AtomicU64::new(0),
        }
    }

    /// Record a fault (first-fault-wins) and stop admitting points.
    pub(crate) fn fail(&self, fault: PipelineError) {
        self.fault.record(fault);
        self.admission.close();
    }

    /// Return one admission slot after a point was broadcast.
    pub(crate) fn release_slot(&self) {
        self.broadcast.fetch_add(1, Ordering::Relaxed);
        self.admission.add_permits(1);
    }

    pub(crate) fn record_submitted(&self) {
        self.submitted.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn submitted(&self) -> u64 {
        self.submitted.load(Ordering::Relaxed)
    }

    pub(crate) fn broadcast_count(&self) -> u64 {
        self.broadcast.load(Ordering::Relaxed)
    }

    /// Points admitted but not yet broadcast.
    pub(crate) fn in_flight(&self) -> usize {
        self.submitted().saturating_sub(self.broadcast_count()) as usize
    }

    pub(crate) fn take_fault(&self) -> Option<PipelineError> {
        self.fault.take()
    }

    /// Rendered form of the pending fault, if any, without clearing it.
    pub(crate) fn fault_pending(&self) -> Option<String> {
        self.fault.peek()
    }
}

/// Cheap diagnostic snapshot of the pipeline.
#[derive(Debug, Clone, Serialize)]
pub struct PipelineStatus {
    /// Lifecycle state at snapshot time.
    pub state: PipelineState,
    /// Points admitted so far.
    pub submitted: u64,
    /// Points delivered to the sink so far.
    pub broadcast: u64,
    /// Points admitted but not yet delivered.
    pub in_flight: usize,
    /// Admission capacity (maximum in-flight points).
    pub capacity: usize,
    /// Resolver worker count.
    pub parallelism: usize,
    /// Whether an unsurfaced fault is pending.
    pub faulted: bool,
}

/// The scan data point pipeline.
///
/// Owns the admission semaphore, the resolver pool, and the broadcaster.
/// One producer (the acquisition loop) drives it: [`submit`](Self::submit)
/// per point, then exactly one of [`shutdown`](Self::shutdown) or
/// [`shutdown_now`](Self::shutdown_now). The sink observes points in exact
/// submission order however the resolutions interleave.
pub struct ScanPipeline {
    state: PipelineState,
    config: PipelineConfig,
    next_seq: u64,
    shared: Arc<PipelineShared>,
    work_tx: Option<mpsc::Sender<SequencedPoint>>,
    broadcaster: Option<JoinHandle<DrainSummary>>,
    sink: SharedSink,
}

impl ScanPipeline {
    /// Build a pipeline delivering to `sink` and spawn its tasks.
    ///
    /// Must be called from within a Tokio runtime.
    ///
    /// # Errors
    ///
    /// [`PipelineError::Configuration`] if `config` does not validate.
    pub fn new(sink: Box<dyn ScanSink>, config: PipelineConfig) -> PipelineResult<Self> {
        config.validate()?;

        let shared = Arc::new(PipelineShared::new(&config));
        let sink: SharedSink = Arc::new(Mutex::new(sink));

        let (work_tx, work_rx) = mpsc::channel(config.capacity);
        let (done_tx, done_rx) = mpsc::channel(config.capacity);

        resolver::spawn_workers(
            config.parallelism,
            Arc::new(Mutex::new(work_rx)),
            done_tx,
            Arc::clone(&shared),
        );
        let broadcaster = tokio::spawn(
            OrderedBroadcaster::new(done_rx, Arc::clone(&sink), Arc::clone(&shared)).run(),
        );

        info!(
            capacity = config.capacity,
            parallelism = config.parallelism,
            "scan pipeline opened"
        );

        Ok(Self {
            state: PipelineState::Open,
            config,
            next_seq: 0,
            shared,
            work_tx: Some(work_tx),
            broadcaster: Some(broadcaster),
            sink,
        })
    }

    /// Submit one point for resolution and ordered delivery.
    ///
    /// Suspends while the pipeline is at capacity and resumes once the
    /// broadcaster frees a slot; returns without waiting for the point to
    /// resolve. A pending fault from an earlier point is surfaced (and
    /// cleared) by this call before anything else happens.
    ///
    /// # Errors
    ///
    /// [`PipelineError::Closed`] once shutdown has begun; otherwise the
    /// pending fault, if one exists.
    pub async fn submit(&mut self, point: ScanPoint) -> PipelineResult<()> {
        if let Some(fault) = self.shared.take_fault() {
            return Err(fault);
        }
        if self.state != PipelineState::Open {
            return Err(PipelineError::Closed);
        }
        let Some(work_tx) = self.work_tx.as_ref() else {
            return Err(PipelineError::Closed);
        };

        let permit = match self.shared.admission.acquire().await {
            Ok(permit) => permit,
            // Admission closes when a fault is recorded or the pipeline is
            // torn down; surface whichever it was.
            Err(_) => return Err(self.shared.take_fault().unwrap_or(PipelineError::Closed)),
        };

        // A fault may have landed while this call was suspended on admission.
        if let Some(fault) = self.shared.take_fault() {
            drop(permit);
            return Err(fault);
        }

        let seq = self.next_seq;
        let sequenced = SequencedPoint { seq, point };
        debug!(seq, label = sequenced.point.label(), "point admitted");

        if work_tx.send(sequenced).await.is_err() {
            drop(permit);
            return Err(PipelineError::Closed);
        }

        // Forget the permit - the broadcaster re-adds it once the point is
        // delivered.
        std::mem::forget(permit);
        self.next_seq += 1;
        self.shared.record_submitted();
        Ok(())
    }

    /// Stop accepting points, drain admitted ones, and finalize the sink.
    ///
    /// Waits up to `timeout` for every admitted point to be resolved and
    /// broadcast. The sink's `complete_collection` runs regardless of the
    /// outcome. Calling this again once the pipeline is fully closed is a
    /// no-op apart from surfacing a still-pending fault. A terminal call
    /// whose future was dropped mid-drain (a lost `select!` race, say)
    /// leaves the drain unfinished; the next `shutdown` or `shutdown_now`
    /// picks it back up and still finalizes the sink.
    ///
    /// # Errors
    ///
    /// In priority order: a pending fault, then
    /// [`PipelineError::DrainTimeout`], then a sink finalization error.
    pub async fn shutdown(&mut self, timeout: Duration) -> PipelineResult<()> {
        if self.state == PipelineState::Closed && self.broadcaster.is_none() {
            return self.surface_pending_fault();
        }
        if self.state == PipelineState::Open {
            self.state = PipelineState::Draining;
            info!(
                timeout_ms = timeout.as_millis() as u64,
                in_flight = self.shared.in_flight(),
                "draining scan pipeline"
            );
        } else {
            debug!("resuming interrupted drain");
        }

        // Closing the work channel lets the resolver workers finish what was
        // admitted and exit; the broadcaster exits once their completions
        // are all in.
        self.work_tx = None;

        // The broadcaster handle stays in place until its join completes, so
        // a shutdown future dropped at this await can be resumed by the next
        // terminal call.
        let mut timed_out = false;
        if let Some(handle) = self.broadcaster.as_mut() {
            match tokio::time::timeout(timeout, &mut *handle).await {
                Ok(Ok(summary)) => {
                    debug!(
                        delivered = summary.delivered,
                        undelivered = summary.undelivered,
                        halted = summary.halted,
                        "drain complete"
                    );
                }
                Ok(Err(join_err)) => {
                    if join_err.is_cancelled() {
                        // An earlier interrupted shutdown_now already aborted
                        // the task; nothing left to wait for.
                        debug!("broadcaster was already aborted");
                    } else {
                        error!("broadcaster task failed: {join_err}");
                    }
                }
                Err(_) => {
                    timed_out = true;
                    warn!(
                        in_flight = self.shared.in_flight(),
                        "drain timed out, abandoning undelivered points"
                    );
                    handle.abort();
                    // Joining the aborted task ensures the sink lock is free
                    // before complete_collection runs.
                    let _ = (&mut *handle).await;
                }
            }
        }
        self.broadcaster = None;

        self.state = PipelineState::Closed;
        self.shared.admission.close();
        let finalized = self.finalize_sink().await;

        if let Some(fault) = self.shared.take_fault() {
            return Err(fault);
        }
        if timed_out {
            return Err(PipelineError::DrainTimeout {
                timeout,
                outstanding: self.shared.in_flight(),
            });
        }
        finalized
    }

    /// Stop immediately, discarding undelivered points, and finalize the sink.
    ///
    /// Resolver tasks are not cancelled (an in-flight readout belongs to its
    /// hardware driver); their late completions are simply never acted on.
    /// Like [`shutdown`](Self::shutdown), this also finishes a drain left
    /// behind by a dropped terminal-call future.
    ///
    /// # Errors
    ///
    /// A pending fault if one exists, else a sink finalization error.
    pub async fn shutdown_now(&mut self) -> PipelineResult<()> {
        if self.state == PipelineState::Closed && self.broadcaster.is_none() {
            return self.surface_pending_fault();
        }
        self.state = PipelineState::Closed;
        warn!(
            in_flight = self.shared.in_flight(),
            "immediate shutdown, undelivered points will be discarded"
        );

        self.work_tx = None;
        self.shared.admission.close();
        // As in shutdown, the handle is cleared only after the join so an
        // interrupted call can be resumed.
        if let Some(handle) = self.broadcaster.as_mut() {
            handle.abort();
            // Joining the aborted task ensures the sink lock is free before
            // complete_collection runs.
            let _ = (&mut *handle).await;
        }
        self.broadcaster = None;

        let finalized = self.finalize_sink().await;
        if let Some(fault) = self.shared.take_fault() {
            return Err(fault);
        }
        finalized
    }

    /// Current lifecycle state.
    #[must_use]
    pub fn state(&self) -> PipelineState {
        self.state
    }

    /// Diagnostic snapshot of counters and state.
    #[must_use]
    pub fn status(&self) -> PipelineStatus {
        PipelineStatus {
            state: self.state,
            submitted: self.shared.submitted(),
            broadcast: self.shared.broadcast_count(),
            in_flight: self.shared.in_flight(),
            capacity: self.config.capacity,
            parallelism: self.config.parallelism,
            faulted: self.shared.fault_pending().is_some(),
        }
    }

    /// Surface (and clear) a pending fault on a repeated terminal call.
    fn surface_pending_fault(&self) -> PipelineResult<()> {
        match self.shared.take_fault() {
            Some(fault) => Err(fault),
            None => Ok(()),
        }
    }

    async fn finalize_sink(&self) -> PipelineResult<()> {
        debug!("completing collection");
        let mut sink = self.sink.lock().await;
        sink.complete_collection()
            .await
            .map_err(|err| PipelineError::Finalize(err.into()))
    }
}

impl Drop for ScanPipeline {
    fn drop(&mut self) {
        if self.state == PipelineState::Open {
            warn!("scan pipeline dropped while open, the sink was never finalized");
        }
    }
}
