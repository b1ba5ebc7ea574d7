//! In-memory cache of notified points for UI and scripting lookups.
//!
//! Plotting and scripting layers repeatedly ask for "every position channel X
//! has visited so far" while a scan is still running. Re-walking all stored
//! points per lookup is quadratic in scan length, so [`PointCache`] keeps one
//! `f64` column per channel, appended to as points are notified, making each
//! lookup a single column fetch. [`CachingSink`] wires the cache into the
//! pipeline as a decorator around any other [`ScanSink`].

use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::RwLock;
use tracing::{debug, warn};

use crate::point::{ScanPoint, ScanValue};
use crate::sink::ScanSink;

/// Per-channel history of scalar values for the scan in progress.
///
/// Columns are keyed by channel name and re-initialized whenever a point from
/// a different scan arrives. Non-scalar channels are recorded as NaN so
/// column lengths stay aligned with the number of points seen.
#[derive(Debug, Default)]
pub struct PointCache {
    scan_id: Option<String>,
    columns: Vec<(String, Vec<f64>)>,
    points_seen: usize,
}

impl PointCache {
    /// Create an empty cache.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Record one notified point.
    ///
    /// The first point of a scan defines the channel set; a later point with
    /// a different channel count is skipped with a warning rather than
    /// misaligning the columns.
    pub fn observe(&mut self, point: &ScanPoint) {
        if self.scan_id.as_deref() != Some(point.scan_id()) {
            self.reset_for(point);
        }
        if point.len() != self.columns.len() {
            warn!(
                label = point.label(),
                expected = self.columns.len(),
                got = point.len(),
                "skipping cache update for point with unexpected channel count"
            );
            return;
        }
        for (slot, (_, column)) in point.slots().iter().zip(self.columns.iter_mut()) {
            let value = slot
                .value()
                .and_then(ScanValue::as_scalar)
                .unwrap_or(f64::NAN);
            column.push(value);
        }
        self.points_seen += 1;
    }

    fn reset_for(&mut self, point: &ScanPoint) {
        debug!(
            scan_id = point.scan_id(),
            channels = point.len(),
            "initializing point cache for new scan"
        );
        self.scan_id = Some(point.scan_id().to_string());
        self.columns = point
            .channels()
            .map(|name| (name.to_string(), Vec::new()))
            .collect();
        self.points_seen = 0;
    }

    /// All cached values of one channel, in point order.
    #[must_use]
    pub fn positions_for(&self, channel: &str) -> Option<&[f64]> {
        self.columns
            .iter()
            .find(|(name, _)| name == channel)
            .map(|(_, column)| column.as_slice())
    }

    /// Identifier of the scan currently cached, if any.
    #[must_use]
    pub fn scan_id(&self) -> Option<&str> {
        self.scan_id.as_deref()
    }

    /// Number of points cached for the current scan.
    #[must_use]
    pub fn len(&self) -> usize {
        self.points_seen
    }

    /// Whether no points have been cached yet.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.points_seen == 0
    }

    /// Drop all cached columns.
    pub fn clear(&mut self) {
        self.scan_id = None;
        self.columns.clear();
        self.points_seen = 0;
    }
}

/// Decorator sink that mirrors every notified point into a shared
/// [`PointCache`] before forwarding to the inner sink.
///
/// Take a [`CachingSink::cache`] handle before the sink moves into the
/// pipeline; UI and scripting layers read positions through it while the
/// scan runs.
pub struct CachingSink {
    inner: Box<dyn ScanSink>,
    cache: Arc<RwLock<PointCache>>,
}

impl CachingSink {
    /// Wrap an inner sink.
    #[must_use]
    pub fn new(inner: Box<dyn ScanSink>) -> Self {
        Self {
            inner,
            cache: Arc::new(RwLock::new(PointCache::new())),
        }
    }

    /// Shared handle to the cache.
    #[must_use]
    pub fn cache(&self) -> Arc<RwLock<PointCache>> {
        Arc::clone(&self.cache)
    }
}

#[async_trait]
impl ScanSink for CachingSink {
    async fn persist(&mut self, point: &ScanPoint) -> anyhow::Result<()> {
        self.inner.persist(point).await
    }

    async fn notify(&mut self, scan_id: &str, point: &ScanPoint) -> anyhow::Result<()> {
        self.cache.write().observe(point);
        self.inner.notify(scan_id, point).await
    }

    async fn complete_collection(&mut self) -> anyhow::Result<()> {
        self.inner.complete_collection().await
    }
}
