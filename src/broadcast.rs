//! Ordered broadcast of resolved points to the sink.
//!
//! Resolver workers finish points in whatever order the hardware answers, so
//! completions arrive here shuffled. A single broadcaster task owns the
//! reordering cursor: completions park in a buffer keyed by sequence number
//! and are released strictly at `next_expected`. Because only this task
//! touches the sink during a scan, persist and notify never interleave
//! between points.
//!
//! A failed completion halts the broadcast at that gap. Points buffered
//! behind the failure stay undelivered; forwarding them would fabricate a
//! record with a hole the sink cannot represent. The broadcaster keeps
//! draining its channel while halted so workers never block on a full
//! completions queue during teardown.

use std::collections::BTreeMap;
use std::sync::Arc;

use tokio::sync::{mpsc, Mutex};
use tracing::{debug, warn};

use crate::error::PipelineError;
use crate::pipeline::PipelineShared;
use crate::point::SequencedPoint;
use crate::resolver::Completion;
use crate::sink::ScanSink;

/// Sink handle shared between the broadcaster and pipeline finalization.
pub(crate) type SharedSink = Arc<Mutex<Box<dyn ScanSink>>>;

/// What the broadcaster had done by the time its channel closed.
#[derive(Debug, Clone, Copy)]
pub(crate) struct DrainSummary {
    /// Points delivered to the sink, which is also the next expected
    /// sequence number.
    pub(crate) delivered: u64,
    /// Completions still parked in the buffer, withheld behind a failure.
    pub(crate) undelivered: usize,
    /// Whether delivery stopped at a failed point.
    pub(crate) halted: bool,
}

/// Single-task reordering stage between the resolver pool and the sink.
pub(crate) struct OrderedBroadcaster {
    completions: mpsc::Receiver<Completion>,
    sink: SharedSink,
    shared: Arc<PipelineShared>,
    next_expected: u64,
    buffer: BTreeMap<u64, Completion>,
    halted: bool,
}

impl OrderedBroadcaster {
    pub(crate) fn new(
        completions: mpsc::Receiver<Completion>,
        sink: SharedSink,
        shared: Arc<PipelineShared>,
    ) -> Self {
        Self {
            completions,
            sink,
            shared,
            next_expected: 0,
            buffer: BTreeMap::new(),
            halted: false,
        }
    }

    /// Run until every worker has dropped its completion sender.
    pub(crate) async fn run(mut self) -> DrainSummary {
        while let Some(completion) = self.completions.recv().await {
            self.buffer.insert(completion.seq(), completion);
            self.dispatch_ready().await;
        }

        if !self.buffer.is_empty() {
            warn!(
                withheld = self.buffer.len(),
                next_expected = self.next_expected,
                "broadcast ended with undelivered points"
            );
        }
        DrainSummary {
            delivered: self.next_expected,
            undelivered: self.buffer.len(),
            halted: self.halted,
        }
    }

    /// Release the contiguous run of buffered completions at the cursor.
    async fn dispatch_ready(&mut self) {
        while !self.halted {
            let Some(completion) = self.buffer.remove(&self.next_expected) else {
                break;
            };
            match completion {
                Completion::Resolved(sequenced) => {
                    if let Err(fault) = self.deliver(&sequenced).await {
                        warn!(seq = sequenced.seq, "halting broadcast: {fault}");
                        self.shared.fail(fault);
                        self.halted = true;
                    } else {
                        self.next_expected += 1;
                        self.shared.release_slot();
                    }
                }
                Completion::Failed(seq) => {
                    warn!(seq, "halting broadcast at failed point, later points withheld");
                    self.halted = true;
                }
            }
        }
    }

    async fn deliver(&mut self, sequenced: &SequencedPoint) -> Result<(), PipelineError> {
        let mut sink = self.sink.lock().await;
        debug!(
            seq = sequenced.seq,
            label = sequenced.point.label(),
            "broadcasting point"
        );
        sink.persist(&sequenced.point)
            .await
            .map_err(|err| PipelineError::Persist {
                seq: sequenced.seq,
                label: sequenced.point.label().to_string(),
                source: err.into(),
            })?;
        // Notification is best-effort, observers must not stall the scan.
        if let Err(err) = sink.notify(sequenced.point.scan_id(), &sequenced.point).await {
            warn!(seq = sequenced.seq, "sink notification failed: {err:#}");
        }
        Ok(())
    }
}
