//! # Scan Data Point Pipeline
//!
//! This crate is the staging stage between an acquisition loop and its data
//! sink. During a scan, motors step through positions while detectors expose;
//! position values are known the moment a point is created, detector values
//! trickle in as hardware finishes reading out. The pipeline lets the
//! acquisition loop hand over each point the moment it is assembled and move
//! to the next position, while detector readouts complete concurrently in
//! the background and points are delivered to the sink in exact submission
//! order.
//!
//! ## Crate Structure
//!
//! The library is organized into several modules, each with a distinct
//! responsibility:
//!
//! - **`point`**: The data model: `ScanValue`, the `DeferredValue` readout
//!   trait, `Slot`, and `ScanPoint` itself.
//! - **`pipeline`**: The `ScanPipeline` producer handle plus the admission,
//!   fault, and shutdown machinery behind it.
//! - **`sink`**: The `ScanSink` delivery trait and the CSV file sink
//!   (`storage_csv` feature).
//! - **`cache`**: An in-memory column cache fed from sink notifications, for
//!   live plotting during a scan.
//! - **`config`**: Figment-based layered settings. See `config::Settings`
//!   and `config::PipelineConfig`.
//! - **`error`**: The `PipelineError` enum surfaced to the acquisition loop.
//! - **`logging`**: `tracing` subscriber setup for host processes.
//!
//! Internally, `resolver` runs the worker pool that invokes deferred
//! readouts and `broadcast` restores submission order before the sink sees
//! anything; neither is part of the public API.
//!
//! ## Example
//!
//! ```no_run
//! use scan_pipeline::{PipelineConfig, ScanPipeline, ScanPoint};
//! use scan_pipeline::sink::CsvSink;
//! use std::time::Duration;
//!
//! # async fn scan() -> Result<(), Box<dyn std::error::Error>> {
//! let sink = Box::new(CsvSink::new("scan-42.csv"));
//! let mut pipeline = ScanPipeline::new(sink, PipelineConfig::default())?;
//!
//! for (step, position) in [0.0, 0.5, 1.0].into_iter().enumerate() {
//!     // move motor, trigger detector, collect the readout future...
//!     let point = ScanPoint::new("scan-42", format!("point {step}"))
//!         .with_resolved("stage_x", position);
//!     pipeline.submit(point).await?;
//! }
//!
//! pipeline.shutdown(Duration::from_secs(30)).await?;
//! # Ok(())
//! # }
//! ```

pub mod cache;
pub mod config;
pub mod error;
pub mod logging;
pub mod pipeline;
pub mod point;
pub mod sink;

mod broadcast;
mod resolver;

pub use cache::{CachingSink, PointCache};
pub use config::{PipelineConfig, Settings};
pub use error::{PipelineError, PipelineResult};
pub use pipeline::{PipelineState, PipelineStatus, ScanPipeline};
pub use point::{DeferredValue, ScanPoint, ScanValue, Slot};
#[cfg(feature = "storage_csv")]
pub use sink::CsvSink;
pub use sink::ScanSink;
