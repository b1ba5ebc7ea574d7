//! Scan data point model: values, deferred readouts, slots, and points.
//!
//! A [`ScanPoint`] is one row of synchronized measurement data produced by a
//! single step of a scan. Each entry (a [`Slot`]) pairs a channel name with
//! either a value that was cheap to read synchronously, or a boxed
//! [`DeferredValue`] representing a readout still in flight on hardware. The
//! pipeline resolves deferred slots on its worker pool; producers only
//! construct points and submit them.
//!
//! ## One-shot readouts
//!
//! [`DeferredValue::produce`] consumes the producer object
//! (`self: Box<Self>`), so a deferred readout can be invoked at most once by
//! construction. Drivers that complete readouts from their own tasks can hand
//! the pipeline the receiving half of a oneshot channel instead; see the
//! [`tokio::sync::oneshot::Receiver`] implementation below.

use std::fmt;

use anyhow::Context;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// A single resolved measurement value.
///
/// Covers the channel shapes a scan produces: scalar positions and readings,
/// array detector data, and textual values such as detector file references.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum ScanValue {
    /// A scalar position or reading.
    Scalar(f64),
    /// A one-dimensional array reading, e.g. an MCA spectrum.
    Vector(Vec<f64>),
    /// A textual value, e.g. a detector image file reference.
    Text(String),
}

impl ScanValue {
    /// Returns the scalar value, if this is a scalar channel.
    #[must_use]
    pub fn as_scalar(&self) -> Option<f64> {
        match self {
            ScanValue::Scalar(v) => Some(*v),
            _ => None,
        }
    }
}

impl fmt::Display for ScanValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ScanValue::Scalar(v) => write!(f, "{v}"),
            ScanValue::Vector(values) => {
                write!(f, "[")?;
                for (i, v) in values.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{v}")?;
                }
                write!(f, "]")
            }
            ScanValue::Text(s) => f.write_str(s),
        }
    }
}

impl From<f64> for ScanValue {
    fn from(v: f64) -> Self {
        ScanValue::Scalar(v)
    }
}

impl From<Vec<f64>> for ScanValue {
    fn from(v: Vec<f64>) -> Self {
        ScanValue::Vector(v)
    }
}

impl From<String> for ScanValue {
    fn from(v: String) -> Self {
        ScanValue::Text(v)
    }
}

impl From<&str> for ScanValue {
    fn from(v: &str) -> Self {
        ScanValue::Text(v.to_string())
    }
}

/// A one-shot, lazily-invoked hardware readout.
///
/// Created by the producer when a reading is too slow to await synchronously;
/// consumed by exactly one resolver invocation; discarded after resolution.
/// `produce` may suspend for the duration of the hardware operation. Retry
/// policy, if any, belongs to the implementation; the pipeline never retries
/// a failed readout.
#[async_trait]
pub trait DeferredValue: Send + Sync {
    /// Produce the value, consuming the readout.
    async fn produce(self: Box<Self>) -> anyhow::Result<ScanValue>;
}

/// Drivers that fulfill readouts from their own tasks can submit the
/// receiving half of a oneshot channel as the deferred value. A sender
/// dropped without sending resolves to an error.
///
/// # Example
///
/// ```
/// use scan_pipeline::{DeferredValue, ScanValue};
/// use tokio::sync::oneshot;
///
/// # tokio_test::block_on(async {
/// let (tx, rx) = oneshot::channel::<anyhow::Result<ScanValue>>();
/// tx.send(Ok(ScanValue::Scalar(42.0))).unwrap();
///
/// let producer: Box<dyn DeferredValue> = Box::new(rx);
/// let value = producer.produce().await.unwrap();
/// assert_eq!(value.as_scalar(), Some(42.0));
/// # })
/// ```
#[async_trait]
impl DeferredValue for tokio::sync::oneshot::Receiver<anyhow::Result<ScanValue>> {
    async fn produce(self: Box<Self>) -> anyhow::Result<ScanValue> {
        match (*self).await {
            Ok(result) => result,
            Err(_) => Err(anyhow::anyhow!("readout was abandoned before completing")),
        }
    }
}

enum SlotState {
    Resolved(ScanValue),
    Deferred(Box<dyn DeferredValue>),
    Spent,
}

/// One entry of a point: a channel name plus its resolved or still-deferred
/// value.
///
/// Once resolved, a slot never changes again. A slot whose readout failed is
/// left spent; the owning point is considered failed as a whole.
pub struct Slot {
    channel: String,
    state: SlotState,
}

impl Slot {
    fn resolved(channel: String, value: ScanValue) -> Self {
        Self {
            channel,
            state: SlotState::Resolved(value),
        }
    }

    fn deferred(channel: String, producer: Box<dyn DeferredValue>) -> Self {
        Self {
            channel,
            state: SlotState::Deferred(producer),
        }
    }

    /// The channel (scannable or detector) name this slot belongs to.
    #[must_use]
    pub fn channel(&self) -> &str {
        &self.channel
    }

    /// Whether the slot holds a resolved value.
    #[must_use]
    pub fn is_resolved(&self) -> bool {
        matches!(self.state, SlotState::Resolved(_))
    }

    /// The resolved value, if resolution has happened.
    #[must_use]
    pub fn value(&self) -> Option<&ScanValue> {
        match &self.state {
            SlotState::Resolved(value) => Some(value),
            _ => None,
        }
    }

    /// Resolve the slot in place.
    ///
    /// Already-resolved slots return immediately with no side effect. A
    /// deferred readout is invoked exactly once; on failure the slot is left
    /// spent and the error names the channel.
    pub(crate) async fn resolve(&mut self) -> anyhow::Result<()> {
        match std::mem::replace(&mut self.state, SlotState::Spent) {
            SlotState::Resolved(value) => {
                self.state = SlotState::Resolved(value);
                Ok(())
            }
            SlotState::Deferred(producer) => {
                let value = producer
                    .produce()
                    .await
                    .with_context(|| format!("readout of channel '{}' failed", self.channel))?;
                self.state = SlotState::Resolved(value);
                Ok(())
            }
            SlotState::Spent => Err(anyhow::anyhow!(
                "channel '{}' was consumed by a failed readout",
                self.channel
            )),
        }
    }
}

impl fmt::Debug for Slot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut dbg = f.debug_struct("Slot");
        dbg.field("channel", &self.channel);
        match &self.state {
            SlotState::Resolved(value) => dbg.field("value", value),
            SlotState::Deferred(_) => dbg.field("value", &"<deferred>"),
            SlotState::Spent => dbg.field("value", &"<spent>"),
        };
        dbg.finish()
    }
}

/// One row of synchronized measurement data produced by a single scan step.
///
/// Slot count and order are fixed once the point is submitted; the pipeline
/// only ever transitions slot contents from deferred to resolved. A point is
/// submitted once, resolved once, broadcast once, then released.
#[derive(Debug)]
pub struct ScanPoint {
    scan_id: String,
    label: String,
    slots: Vec<Slot>,
}

impl ScanPoint {
    /// Create an empty point belonging to the given scan.
    #[must_use]
    pub fn new(scan_id: impl Into<String>, label: impl Into<String>) -> Self {
        Self {
            scan_id: scan_id.into(),
            label: label.into(),
            slots: Vec::new(),
        }
    }

    /// Append a channel whose value is already known.
    pub fn add_resolved(&mut self, channel: impl Into<String>, value: impl Into<ScanValue>) {
        self.slots.push(Slot::resolved(channel.into(), value.into()));
    }

    /// Append a channel whose readout is still in flight.
    pub fn add_deferred(&mut self, channel: impl Into<String>, producer: Box<dyn DeferredValue>) {
        self.slots.push(Slot::deferred(channel.into(), producer));
    }

    /// Builder-style [`Self::add_resolved`].
    #[must_use]
    pub fn with_resolved(mut self, channel: impl Into<String>, value: impl Into<ScanValue>) -> Self {
        self.add_resolved(channel, value);
        self
    }

    /// Builder-style [`Self::add_deferred`].
    #[must_use]
    pub fn with_deferred(
        mut self,
        channel: impl Into<String>,
        producer: Box<dyn DeferredValue>,
    ) -> Self {
        self.add_deferred(channel, producer);
        self
    }

    /// Identifier of the owning scan.
    #[must_use]
    pub fn scan_id(&self) -> &str {
        &self.scan_id
    }

    /// Human-readable label, e.g. `"point 12"`.
    #[must_use]
    pub fn label(&self) -> &str {
        &self.label
    }

    /// The slots in channel order.
    #[must_use]
    pub fn slots(&self) -> &[Slot] {
        &self.slots
    }

    pub(crate) fn slots_mut(&mut self) -> &mut [Slot] {
        &mut self.slots
    }

    /// Number of channels in this point.
    #[must_use]
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    /// Whether the point carries no channels.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// Whether every slot holds a resolved value.
    #[must_use]
    pub fn is_fully_resolved(&self) -> bool {
        self.slots.iter().all(Slot::is_resolved)
    }

    /// Channel names in slot order.
    pub fn channels(&self) -> impl Iterator<Item = &str> {
        self.slots.iter().map(Slot::channel)
    }
}

impl fmt::Display for ScanPoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} [{}]", self.label, self.scan_id)?;
        for (i, slot) in self.slots.iter().enumerate() {
            let sep = if i == 0 { ": " } else { ", " };
            match slot.value() {
                Some(value) => write!(f, "{sep}{}={value}", slot.channel())?,
                None => write!(f, "{sep}{}=<pending>", slot.channel())?,
            }
        }
        Ok(())
    }
}

/// A point paired with the dense sequence number assigned at admission.
#[derive(Debug)]
pub(crate) struct SequencedPoint {
    pub(crate) seq: u64,
    pub(crate) point: ScanPoint,
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    struct CountingValue {
        value: f64,
        invocations: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl DeferredValue for CountingValue {
        async fn produce(self: Box<Self>) -> anyhow::Result<ScanValue> {
            self.invocations.fetch_add(1, Ordering::SeqCst);
            Ok(ScanValue::Scalar(self.value))
        }
    }

    struct FailingValue;

    #[async_trait]
    impl DeferredValue for FailingValue {
        async fn produce(self: Box<Self>) -> anyhow::Result<ScanValue> {
            Err(anyhow::anyhow!("motor controller offline"))
        }
    }

    #[tokio::test]
    async fn deferred_slot_is_invoked_exactly_once() {
        let invocations = Arc::new(AtomicUsize::new(0));
        let mut point = ScanPoint::new("scan-1", "point 0").with_deferred(
            "energy",
            Box::new(CountingValue {
                value: 8.05,
                invocations: Arc::clone(&invocations),
            }),
        );

        point.slots_mut()[0].resolve().await.unwrap();
        // Second resolve must be a no-op on the already-resolved slot.
        point.slots_mut()[0].resolve().await.unwrap();

        assert_eq!(invocations.load(Ordering::SeqCst), 1);
        assert_eq!(point.slots()[0].value(), Some(&ScanValue::Scalar(8.05)));
        assert!(point.is_fully_resolved());
    }

    #[tokio::test]
    async fn resolved_slot_resolves_without_side_effects() {
        let mut point = ScanPoint::new("scan-1", "point 0").with_resolved("stage_x", 1.25);
        point.slots_mut()[0].resolve().await.unwrap();
        assert_eq!(point.slots()[0].value(), Some(&ScanValue::Scalar(1.25)));
    }

    #[tokio::test]
    async fn failed_readout_leaves_slot_spent() {
        let mut point =
            ScanPoint::new("scan-1", "point 3").with_deferred("mca", Box::new(FailingValue));

        let err = point.slots_mut()[0].resolve().await.unwrap_err();
        assert!(err.to_string().contains("mca"), "error was: {err:#}");
        assert!(!point.slots()[0].is_resolved());

        // The spent slot keeps failing rather than re-invoking the readout.
        let err = point.slots_mut()[0].resolve().await.unwrap_err();
        assert!(err.to_string().contains("consumed"), "error was: {err:#}");
    }

    #[tokio::test]
    async fn oneshot_receiver_acts_as_deferred_value() {
        let (tx, rx) = tokio::sync::oneshot::channel();
        let producer: Box<dyn DeferredValue> = Box::new(rx);
        tx.send(Ok(ScanValue::Scalar(42.0))).unwrap();
        let value = producer.produce().await.unwrap();
        assert_eq!(value, ScanValue::Scalar(42.0));
    }

    #[tokio::test]
    async fn dropped_oneshot_sender_fails_the_readout() {
        let (tx, rx) = tokio::sync::oneshot::channel::<anyhow::Result<ScanValue>>();
        drop(tx);
        let producer: Box<dyn DeferredValue> = Box::new(rx);
        let err = producer.produce().await.unwrap_err();
        assert!(err.to_string().contains("abandoned"), "error was: {err:#}");
    }

    #[test]
    fn point_display_shows_channels_and_pending_slots() {
        let point = ScanPoint::new("scan-9", "point 2")
            .with_resolved("stage_x", 1.5)
            .with_deferred("det", Box::new(FailingValue));
        let rendered = point.to_string();
        assert_eq!(rendered, "point 2 [scan-9]: stage_x=1.5, det=<pending>");
    }

    #[test]
    fn value_display_formats() {
        assert_eq!(ScanValue::Scalar(3.25).to_string(), "3.25");
        assert_eq!(ScanValue::Vector(vec![1.0, 2.5]).to_string(), "[1, 2.5]");
        assert_eq!(ScanValue::from("ref-0001").to_string(), "ref-0001");
    }

    #[test]
    fn channel_order_is_preserved() {
        let point = ScanPoint::new("scan-1", "point 0")
            .with_resolved("a", 0.0)
            .with_resolved("b", 1.0)
            .with_resolved("c", 2.0);
        let channels: Vec<&str> = point.channels().collect();
        assert_eq!(channels, ["a", "b", "c"]);
        assert_eq!(point.len(), 3);
        assert!(!point.is_empty());
    }

    // Worker tasks resolve points and sinks borrow them across awaits, so
    // the whole data model has to cross thread boundaries. This fails to
    // compile if a field (the boxed producer included) loses Send or Sync.
    #[test]
    fn points_are_shareable_across_worker_threads() {
        fn assert_shareable<T: Send + Sync>() {}
        assert_shareable::<ScanValue>();
        assert_shareable::<Slot>();
        assert_shareable::<ScanPoint>();
        assert_shareable::<Box<dyn DeferredValue>>();
    }
}
