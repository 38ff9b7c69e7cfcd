//! Job Orchestration - State Machine and Summary
//!
//! The single entry point for running a gang sheet job. Configuration errors
//! fail the whole job before any allocation; everything else recovers locally
//! and lands in the summary. Losing a paid line item silently is the worst
//! failure this system can have, so the summary enumerates every skipped item
//! with a machine-readable reason.

use crate::canvas::CanvasBackingStore;
use crate::config::{
    CanvasConfiguration, CanvasDimensions, ConfigError, EngineConfig, MemoryBudget, Printer,
};
use crate::finalize::{GangSheetPart, PartSink};
use crate::memory::MemoryMonitor;
use crate::placement::PlacementEngine;
use crate::planner::BatchPlanner;
use crate::source::ImageSource;
use crate::ENGINE_VERSION;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use thiserror::Error;
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("Invalid configuration: {0}")]
    Configuration(#[from] ConfigError),
}

/// One order line item: a design and how many copies of it must land on the
/// sheets. `target_size` is (width, height) in inches at the printer's dpi.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OrderLineItem {
    pub design_reference: String,
    pub quantity: u32,
    #[serde(default)]
    pub target_size: Option<(f64, f64)>,
}

/// Machine-readable reason an item did not land in an emitted part.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SkipReason {
    MissingSourceImage,
    DecodeFailed,
    OutOfMemory,
    TooLargeForCanvas,
    OutputSinkFailure,
    Cancelled,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SkippedItem {
    pub design_reference: String,
    pub reason: SkipReason,
    pub message: String,
}

impl SkippedItem {
    pub fn new(design_reference: &str, reason: SkipReason, message: impl Into<String>) -> Self {
        Self {
            design_reference: design_reference.to_string(),
            reason,
            message: message.into(),
        }
    }
}

/// A complete job request. The caller (storefront, queue worker, CLI) has
/// already resolved printer and canvas configuration; the engine only
/// validates and executes.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GangSheetJob {
    #[serde(default)]
    pub job_id: Option<String>,
    pub items: Vec<OrderLineItem>,
    pub printer: Printer,
    pub canvas: CanvasConfiguration,
    pub memory: MemoryBudget,
    #[serde(default)]
    pub engine: EngineConfig,
}

impl GangSheetJob {
    fn validate(&self) -> Result<CanvasDimensions, ConfigError> {
        self.memory.validate()?;
        for item in &self.items {
            if item.quantity == 0 {
                return Err(ConfigError::ZeroQuantity(item.design_reference.clone()));
            }
        }
        CanvasDimensions::derive(&self.printer, &self.canvas)
    }
}

/// Per-job state machine. Transitions are logged; terminal failure states
/// are reflected in the summary status rather than a bare error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobState {
    Planning,
    Packing,
    FinalizingPart,
    SubBatchComplete,
    SubBatchFailed,
    JobComplete,
    JobPartiallyFailed,
}

impl std::fmt::Display for JobState {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        let name = match self {
            JobState::Planning => "PLANNING",
            JobState::Packing => "PACKING",
            JobState::FinalizingPart => "FINALIZING_PART",
            JobState::SubBatchComplete => "SUB_BATCH_COMPLETE",
            JobState::SubBatchFailed => "SUB_BATCH_FAILED",
            JobState::JobComplete => "JOB_COMPLETE",
            JobState::JobPartiallyFailed => "JOB_PARTIALLY_FAILED",
        };
        f.write_str(name)
    }
}

impl JobState {
    /// Logged state transition. The machine itself is advisory; terminal
    /// outcomes are carried by [`JobStatus`] in the summary.
    pub(crate) fn enter(&mut self, job_id: &str, to: JobState) {
        tracing::debug!(%job_id, from = %self, to = %to, "state transition");
        *self = to;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    /// Every requested copy landed in an emitted part.
    Completed,
    /// All sub-batches ran, but some items were skipped.
    CompletedWithSkips,
    /// Some sub-batches failed or the job was cancelled; completed parts are
    /// still returned.
    PartiallyFailed,
    /// Nothing was emitted.
    Failed,
}

/// The structured result of a job. Always enumerates skipped items; never a
/// bare error with no indication of which items landed in which files.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct JobSummary {
    pub job_id: String,
    pub status: JobStatus,
    pub parts: Vec<GangSheetPart>,
    pub skipped_items: Vec<SkippedItem>,
    pub requested_copies: u64,
    pub placed_copies: u64,
    pub sub_batches: u32,
    pub failed_sub_batches: u32,
    pub peak_memory_bytes: u64,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub engine_version: String,
}

/// Job-level cancellation. Checked only between sub-batches: a part is
/// atomic once begun.
#[derive(Clone, Default)]
pub struct CancelToken {
    flag: Arc<AtomicBool>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.flag.store(true, Ordering::Release);
    }

    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::Acquire)
    }
}

/// Runs gang sheet jobs against one image source and one part sink.
pub struct JobRunner<'a> {
    source: &'a dyn ImageSource,
    sink: &'a mut dyn PartSink,
}

impl<'a> JobRunner<'a> {
    pub fn new(source: &'a dyn ImageSource, sink: &'a mut dyn PartSink) -> Self {
        Self { source, sink }
    }

    pub fn run(&mut self, job: &GangSheetJob) -> Result<JobSummary, EngineError> {
        self.run_with_cancel(job, &CancelToken::new())
    }

    pub fn run_with_cancel(
        &mut self,
        job: &GangSheetJob,
        cancel: &CancelToken,
    ) -> Result<JobSummary, EngineError> {
        let started_at = Utc::now();
        let dims = job.validate()?;
        let job_id = job
            .job_id
            .clone()
            .unwrap_or_else(|| Uuid::new_v4().to_string());
        let requested_copies: u64 = job.items.iter().map(|i| i.quantity as u64).sum();

        let mut state = JobState::Planning;
        tracing::info!(%job_id, state = %state, items = job.items.len(), "job started");

        let monitor = MemoryMonitor::new(job.memory.clone());
        let planner = BatchPlanner::new(&job.memory, &job.engine, dims.required_bytes());
        let plan = planner.plan(&job.items, |r| self.source.dimensions(r));

        let store = CanvasBackingStore::new(
            Arc::clone(&monitor),
            job.engine.mmap_threshold_bytes,
            job.engine.scratch_dir.clone(),
            job.engine.sizing_mode,
        );
        let engine = PlacementEngine::new(
            self.source,
            &store,
            Arc::clone(&monitor),
            &job.engine,
            dims,
            job.printer.dpi,
        );

        let mut parts: Vec<GangSheetPart> = Vec::new();
        let mut skipped = plan.skipped.clone();
        let mut placed_copies: u64 = 0;
        let mut failed_sub_batches: u32 = 0;
        let mut cancelled = false;
        let mut next_part_index: u32 = 1;

        for (batch_no, sub_batch) in plan.sub_batches.iter().enumerate() {
            if cancel.is_cancelled() {
                cancelled = true;
                for item in &sub_batch.items {
                    skipped.push(SkippedItem::new(
                        &item.design_reference,
                        SkipReason::Cancelled,
                        "job cancelled between sub-batches",
                    ));
                }
                continue;
            }

            state.enter(&job_id, JobState::Packing);
            tracing::info!(
                %job_id,
                batch = batch_no + 1,
                items = sub_batch.items.len(),
                estimated_bytes = sub_batch.estimated_bytes,
                "packing sub-batch"
            );

            let outcome = engine.pack(
                &sub_batch.items,
                self.sink,
                &job_id,
                next_part_index,
                &mut state,
            );
            next_part_index += outcome.parts.len() as u32;
            placed_copies += outcome.placed_items;
            parts.extend(outcome.parts);
            skipped.extend(outcome.skipped);

            if outcome.failure.is_some() {
                failed_sub_batches += 1;
                state.enter(&job_id, JobState::SubBatchFailed);
            } else {
                state.enter(&job_id, JobState::SubBatchComplete);
            }

            // Everything the sub-batch owned is dropped by now; give the
            // pages back before the next sub-batch starts allocating.
            monitor.reclaim();
        }

        let status = if failed_sub_batches > 0 || cancelled {
            if parts.is_empty() {
                JobStatus::Failed
            } else {
                JobStatus::PartiallyFailed
            }
        } else if skipped.is_empty() {
            JobStatus::Completed
        } else {
            JobStatus::CompletedWithSkips
        };

        let terminal = match status {
            JobStatus::Completed | JobStatus::CompletedWithSkips => JobState::JobComplete,
            _ => JobState::JobPartiallyFailed,
        };
        state.enter(&job_id, terminal);

        Ok(JobSummary {
            job_id,
            status,
            parts,
            skipped_items: skipped,
            requested_copies,
            placed_copies,
            sub_batches: plan.sub_batches.len() as u32,
            failed_sub_batches,
            peak_memory_bytes: monitor.peak_bytes(),
            started_at,
            finished_at: Utc::now(),
            engine_version: ENGINE_VERSION.to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn state_machine_walks_through_finalizing_part() {
        let mut state = JobState::Planning;
        state.enter("t", JobState::Packing);
        state.enter("t", JobState::FinalizingPart);
        assert_eq!(state, JobState::FinalizingPart);
        assert_eq!(state.to_string(), "FINALIZING_PART");
        state.enter("t", JobState::SubBatchComplete);
        assert_eq!(state.to_string(), "SUB_BATCH_COMPLETE");
    }
}
