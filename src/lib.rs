//! GangForge Core - Gang Sheet Layout Engine
//!
//! Composites print-ready designs onto large raster canvases for roll/sheet
//! printers, under a hard memory ceiling.
//!
//! # The Guarantees (Non-Negotiable)
//! 1. Every line item is placed or recorded skipped with a reason
//! 2. No part exceeds the configured canvas dimensions
//! 3. One canvas buffer live per part, decoded designs released eagerly
//! 4. Configuration errors fail before allocation
//! 5. The summary says which items landed in which files

pub mod canvas;
pub mod config;
pub mod finalize;
pub mod job;
pub mod memory;
pub mod placement;
pub mod planner;
pub mod source;

pub use canvas::{Canvas, CanvasBackingStore, CanvasError};
pub use config::{
    CanvasConfiguration, CanvasDimensions, ConfigError, EngineConfig, MemoryBudget, PixelFormat,
    Printer, RetryPolicy, SizingMode,
};
pub use finalize::{DirectorySink, GangSheetPart, PartMetadata, PartSink, SinkError};
pub use job::{
    CancelToken, EngineError, GangSheetJob, JobRunner, JobState, JobStatus, JobSummary,
    OrderLineItem, SkipReason, SkippedItem,
};
pub use memory::{MemoryMonitor, MemoryPressure, MemorySample};
pub use placement::{PlacementEngine, PlacementRecord, SubBatchOutcome};
pub use planner::{BatchPlan, BatchPlanner, SubBatch};
pub use source::{DesignImage, DirectorySource, ImageSource, InMemorySource, SourceError};

pub const ENGINE_VERSION: &str = env!("CARGO_PKG_VERSION");
