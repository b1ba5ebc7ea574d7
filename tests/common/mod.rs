//! Shared fixtures for the pipeline integration tests.

// Each test binary compiles its own copy of this module and not every binary
// uses every helper.
#![allow(dead_code)]

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use scan_pipeline::{DeferredValue, ScanPoint, ScanSink, ScanValue};
use tokio::sync::Semaphore;

/// Hand-operated latch controlling when a deferred readout may finish.
///
/// Releases accumulate, so a test may release before the readout has
/// started waiting.
#[derive(Clone)]
pub struct Gate {
    permits: Arc<Semaphore>,
}

impl Gate {
    pub fn new() -> Self {
        Self {
            permits: Arc::new(Semaphore::new(0)),
        }
    }

    /// Let one pending readout through.
    pub fn release(&self) {
        self.permits.add_permits(1);
    }
}

/// Readout that waits on its gate, then yields the value.
pub struct GatedValue {
    gate: Gate,
    value: f64,
}

impl GatedValue {
    pub fn new(gate: &Gate, value: f64) -> Self {
        Self {
            gate: gate.clone(),
            value,
        }
    }
}

#[async_trait]
impl DeferredValue for GatedValue {
    async fn produce(self: Box<Self>) -> anyhow::Result<ScanValue> {
        self.gate.permits.acquire().await?.forget();
        Ok(ScanValue::Scalar(self.value))
    }
}

/// Readout that waits on its gate, then fails with the given message.
pub struct GatedFailingValue {
    gate: Gate,
    message: &'static str,
}

impl GatedFailingValue {
    pub fn new(gate: &Gate, message: &'static str) -> Self {
        Self {
            gate: gate.clone(),
            message,
        }
    }
}

#[async_trait]
impl DeferredValue for GatedFailingValue {
    async fn produce(self: Box<Self>) -> anyhow::Result<ScanValue> {
        self.gate.permits.acquire().await?.forget();
        anyhow::bail!("{}", self.message)
    }
}

/// Readout that fails immediately.
pub struct FailingValue(pub &'static str);

#[async_trait]
impl DeferredValue for FailingValue {
    async fn produce(self: Box<Self>) -> anyhow::Result<ScanValue> {
        anyhow::bail!("{}", self.0)
    }
}

/// Readout that resolves after a fixed delay.
pub struct DelayedValue {
    pub delay: Duration,
    pub value: f64,
}

#[async_trait]
impl DeferredValue for DelayedValue {
    async fn produce(self: Box<Self>) -> anyhow::Result<ScanValue> {
        tokio::time::sleep(self.delay).await;
        Ok(ScanValue::Scalar(self.value))
    }
}

/// Sink that records every call in arrival order.
#[derive(Clone, Default)]
pub struct RecordingSink {
    events: Arc<parking_lot::Mutex<Vec<String>>>,
    scan_ids: Arc<parking_lot::Mutex<Vec<String>>>,
    completions: Arc<AtomicUsize>,
}

impl RecordingSink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every persist and notify call, in arrival order.
    pub fn events(&self) -> Vec<String> {
        self.events.lock().clone()
    }

    /// Labels of persisted points, in arrival order.
    pub fn persisted(&self) -> Vec<String> {
        self.events
            .lock()
            .iter()
            .filter_map(|event| event.strip_prefix("persist ").map(str::to_string))
            .collect()
    }

    /// Scan ids observed by notify calls.
    pub fn scan_ids(&self) -> Vec<String> {
        self.scan_ids.lock().clone()
    }

    /// How many times `complete_collection` ran.
    pub fn complete_count(&self) -> usize {
        self.completions.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ScanSink for RecordingSink {
    async fn persist(&mut self, point: &ScanPoint) -> anyhow::Result<()> {
        self.events.lock().push(format!("persist {}", point.label()));
        Ok(())
    }

    async fn notify(&mut self, scan_id: &str, point: &ScanPoint) -> anyhow::Result<()> {
        self.events.lock().push(format!("notify {}", point.label()));
        self.scan_ids.lock().push(scan_id.to_string());
        Ok(())
    }

    async fn complete_collection(&mut self) -> anyhow::Result<()> {
        self.completions.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// Sink whose deliveries succeed but whose finalization fails.
#[derive(Clone, Default)]
pub struct BrokenFinalizeSink {
    completions: Arc<AtomicUsize>,
}

impl BrokenFinalizeSink {
    pub fn attempts(&self) -> usize {
        self.completions.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ScanSink for BrokenFinalizeSink {
    async fn persist(&mut self, _point: &ScanPoint) -> anyhow::Result<()> {
        Ok(())
    }

    async fn notify(&mut self, _scan_id: &str, _point: &ScanPoint) -> anyhow::Result<()> {
        Ok(())
    }

    async fn complete_collection(&mut self) -> anyhow::Result<()> {
        self.completions.fetch_add(1, Ordering::SeqCst);
        anyhow::bail!("file handle lost")
    }
}

/// A point with a single pre-resolved position channel.
pub fn resolved_point(scan_id: &str, step: u64) -> ScanPoint {
    ScanPoint::new(scan_id, format!("point {step}")).with_resolved("stage_x", step as f64)
}
