//! Resolver worker pool: turns admitted points into fully-resolved points.
//!
//! A fixed number of long-lived tasks share one queue of admitted points.
//! Each task takes one point at a time and resolves its slots sequentially;
//! distinct points resolve concurrently, bounded by the pool size, so one
//! slow detector readout never serializes the whole scan.
//!
//! On a resolution failure the worker records the fault for the producer
//! (first-fault-wins, see [`crate::pipeline`]) and still forwards a *failed*
//! completion carrying only the sequence number, so the broadcaster's
//! sequence accounting never stalls waiting for a point that will not come.

use std::sync::Arc;

use tokio::sync::{mpsc, Mutex};
use tracing::{debug, error};

use crate::error::PipelineError;
use crate::pipeline::PipelineShared;
use crate::point::{ScanPoint, SequencedPoint};

/// Outcome of resolving one admitted point, keyed by its sequence number.
pub(crate) enum Completion {
    /// Every slot resolved; the point is ready for broadcast.
    Resolved(SequencedPoint),
    /// Resolution failed; the fault is recorded and the data discarded.
    Failed(u64),
}

impl Completion {
    pub(crate) fn seq(&self) -> u64 {
        match self {
            Completion::Resolved(sp) => sp.seq,
            Completion::Failed(seq) => *seq,
        }
    }
}

/// Shared handle to the admitted-point queue.
pub(crate) type WorkQueue = Arc<Mutex<mpsc::Receiver<SequencedPoint>>>;

/// Spawn `parallelism` resolver workers draining `queue` into `completions`.
///
/// Workers exit on their own once the queue is closed and drained. They are
/// deliberately never aborted: an in-flight readout belongs to a hardware
/// driver, and cancelling the task would not cancel the hardware operation.
pub(crate) fn spawn_workers(
    parallelism: usize,
    queue: WorkQueue,
    completions: mpsc::Sender<Completion>,
    shared: Arc<PipelineShared>,
) {
    for worker in 0..parallelism {
        let queue = Arc::clone(&queue);
        let completions = completions.clone();
        let shared = Arc::clone(&shared);
        tokio::spawn(async move {
            run_worker(worker, queue, completions, shared).await;
        });
    }
}

async fn run_worker(
    worker: usize,
    queue: WorkQueue,
    completions: mpsc::Sender<Completion>,
    shared: Arc<PipelineShared>,
) {
    debug!(worker, "resolver worker started");
    loop {
        // Hold the queue lock only while waiting for one point; resolution
        // runs outside the lock so workers overlap.
        let next = queue.lock().await.recv().await;
        let Some(mut sp) = next else {
            break;
        };
        let seq = sp.seq;
        debug!(worker, seq, label = sp.point.label(), "resolving point");

        let completion = match resolve_point(&mut sp.point).await {
            Ok(()) => Completion::Resolved(sp),
            Err(err) => {
                let fault = PipelineError::SlotResolution {
                    seq,
                    label: sp.point.label().to_string(),
                    source: err.into(),
                };
                error!(worker, seq, "point resolution failed: {fault}");
                shared.fail(fault);
                Completion::Failed(seq)
            }
        };

        if completions.send(completion).await.is_err() {
            // Broadcaster is gone (immediate shutdown); late results go nowhere.
            debug!(worker, seq, "dropping completion, pipeline is tearing down");
        }
    }
    debug!(worker, "resolver worker exiting");
}

/// Resolve every slot of `point`, sequentially and in slot order.
///
/// Slots are independent instrument readings; racing them against each other
/// within one point buys nothing while the point occupies a worker, and
/// sequential resolution keeps the per-point behavior deterministic.
pub(crate) async fn resolve_point(point: &mut ScanPoint) -> anyhow::Result<()> {
    for slot in point.slots_mut() {
        slot.resolve().await?;
    }
    Ok(())
}
