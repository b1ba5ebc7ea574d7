//! Sink seam for resolved points: persistence plus observer notification.
//!
//! [`ScanSink`] is the pipeline's one outward-facing collaborator. The
//! broadcaster delivers every fully-resolved point to it in submission order,
//! `persist` before `notify`, and exactly one `complete_collection` call when
//! the pipeline shuts down.
//!
//! `persist` must not fail for transient reasons: any error it returns is
//! non-retryable, fatal for the corresponding point, and halts broadcasting.
//! `notify` is best-effort; failures are logged and delivery continues.

use async_trait::async_trait;

use crate::point::ScanPoint;

#[cfg(feature = "storage_csv")]
use std::fs::File;
#[cfg(feature = "storage_csv")]
use std::io::Write;
#[cfg(feature = "storage_csv")]
use std::path::{Path, PathBuf};

#[cfg(feature = "storage_csv")]
use anyhow::Context;
#[cfg(feature = "storage_csv")]
use tracing::{debug, info};

/// Destination for fully-resolved points.
///
/// Implementations are driven from the broadcaster task, so calls arrive
/// strictly in submission order and never concurrently.
#[async_trait]
pub trait ScanSink: Send + Sync {
    /// Persist one resolved point. Errors are fatal for the collection.
    async fn persist(&mut self, point: &ScanPoint) -> anyhow::Result<()>;

    /// Notify observers (UI, scripting layers) that a point was recorded.
    async fn notify(&mut self, scan_id: &str, point: &ScanPoint) -> anyhow::Result<()>;

    /// Close out the collection. Called exactly once at shutdown, whether or
    /// not a fault occurred.
    async fn complete_collection(&mut self) -> anyhow::Result<()>;
}

/// A sink writing one CSV file per collection.
///
/// The file is created lazily when the first point arrives: a `# `-prefixed
/// JSON metadata line (scan id, creation time), a header row built from the
/// first point's channel names, then one row per point. The writer is
/// flushed and closed by `complete_collection`. A later point whose channel
/// list deviates from the header is rejected, which faults the collection.
#[cfg(feature = "storage_csv")]
pub struct CsvSink {
    path: PathBuf,
    writer: Option<csv::Writer<File>>,
    header: Vec<String>,
    rows_written: u64,
}

#[cfg(feature = "storage_csv")]
impl CsvSink {
    /// Create a sink that will write to `path` once the first point arrives.
    #[must_use]
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            writer: None,
            header: Vec::new(),
            rows_written: 0,
        }
    }

    /// Path of the collection file.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn create_file(&mut self, point: &ScanPoint) -> anyhow::Result<()> {
        let mut file = File::create(&self.path)
            .with_context(|| format!("failed to create CSV file '{}'", self.path.display()))?;

        let metadata = serde_json::json!({
            "scan_id": point.scan_id(),
            "created": chrono::Utc::now().to_rfc3339(),
        });
        file.write_all(b"# ")
            .and_then(|()| file.write_all(metadata.to_string().as_bytes()))
            .and_then(|()| file.write_all(b"\n"))
            .context("failed to write CSV metadata line")?;

        self.header = point.channels().map(str::to_string).collect();

        let mut writer = csv::Writer::from_writer(file);
        let mut record = vec!["label".to_string()];
        record.extend(self.header.iter().cloned());
        writer
            .write_record(&record)
            .context("failed to write CSV header")?;
        self.writer = Some(writer);

        debug!(
            path = %self.path.display(),
            columns = self.header.len(),
            "CSV collection file created"
        );
        Ok(())
    }
}

#[cfg(feature = "storage_csv")]
#[async_trait]
impl ScanSink for CsvSink {
    async fn persist(&mut self, point: &ScanPoint) -> anyhow::Result<()> {
        if self.writer.is_none() {
            self.create_file(point)?;
        }

        if !self.header.iter().map(String::as_str).eq(point.channels()) {
            anyhow::bail!(
                "point '{}' channels do not match the collection header",
                point.label()
            );
        }

        let mut record = vec![point.label().to_string()];
        for slot in point.slots() {
            let value = slot
                .value()
                .with_context(|| format!("channel '{}' is unresolved", slot.channel()))?;
            record.push(value.to_string());
        }

        if let Some(writer) = self.writer.as_mut() {
            writer
                .write_record(&record)
                .context("failed to write CSV row")?;
        }
        self.rows_written += 1;
        Ok(())
    }

    async fn notify(&mut self, _scan_id: &str, _point: &ScanPoint) -> anyhow::Result<()> {
        // File storage has no observers to notify.
        Ok(())
    }

    async fn complete_collection(&mut self) -> anyhow::Result<()> {
        if let Some(mut writer) = self.writer.take() {
            writer.flush().context("failed to flush CSV writer")?;
        }
        info!(
            path = %self.path.display(),
            rows = self.rows_written,
            "CSV collection closed"
        );
        Ok(())
    }
}

#[cfg(all(test, feature = "storage_csv"))]
mod tests {
    use super::*;

    fn point(label: &str, x: f64, counts: f64) -> ScanPoint {
        ScanPoint::new("scan-42", label)
            .with_resolved("stage_x", x)
            .with_resolved("counts", counts)
    }

    #[tokio::test]
    async fn writes_metadata_header_and_rows() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("collection.csv");
        let mut sink = CsvSink::new(&path);

        sink.persist(&point("point 0", 0.0, 100.0)).await.unwrap();
        sink.persist(&point("point 1", 0.5, 180.0)).await.unwrap();
        sink.complete_collection().await.unwrap();

        let contents = std::fs::read_to_string(&path).unwrap();
        let mut lines = contents.lines();
        let meta = lines.next().unwrap();
        assert!(meta.starts_with("# "), "metadata line was: {meta}");
        assert!(meta.contains("scan-42"), "metadata line was: {meta}");
        assert_eq!(lines.next().unwrap(), "label,stage_x,counts");
        assert_eq!(lines.next().unwrap(), "point 0,0,100");
        assert_eq!(lines.next().unwrap(), "point 1,0.5,180");
    }

    #[tokio::test]
    async fn rejects_points_with_mismatched_channels() {
        let dir = tempfile::tempdir().unwrap();
        let mut sink = CsvSink::new(dir.path().join("collection.csv"));

        sink.persist(&point("point 0", 0.0, 1.0)).await.unwrap();

        let stray = ScanPoint::new("scan-42", "point 1").with_resolved("other", 9.0);
        let err = sink.persist(&stray).await.unwrap_err();
        assert!(
            err.to_string().contains("do not match"),
            "error was: {err:#}"
        );
    }

    #[tokio::test]
    async fn completing_an_empty_collection_creates_no_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("collection.csv");
        let mut sink = CsvSink::new(&path);
        sink.complete_collection().await.unwrap();
        assert!(!path.exists());
    }
}
