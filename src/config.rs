//! Job Configuration - Printer, Canvas, Memory Budget
//!
//! All numeric preconditions are checked up front: a bad dpi or a zero-height
//! canvas is a setup error, not a runtime condition, and fails the whole job
//! before any pixel buffer is allocated.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Printer dpi must be positive, got {0}")]
    InvalidDpi(u32),

    #[error("Printer max width must be positive, got {0}")]
    InvalidPrintWidth(f64),

    #[error("Canvas max height must be positive, got {0}")]
    InvalidCanvasHeight(f64),

    #[error("Canvas resolves to a zero-pixel dimension ({width_px}x{height_px})")]
    DegenerateCanvas { width_px: u32, height_px: u32 },

    #[error("Memory ceiling must be positive")]
    InvalidCeiling,

    #[error("Budget ratios must satisfy 0 < warning <= critical <= emergency <= 1, got {warning}/{critical}/{emergency}")]
    InvalidRatios {
        warning: f64,
        critical: f64,
        emergency: f64,
    },

    #[error("Line item {0} has zero quantity")]
    ZeroQuantity(String),
}

/// Physical printer parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Printer {
    pub dpi: u32,
    pub max_width_inches: f64,
}

impl Printer {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.dpi == 0 {
            return Err(ConfigError::InvalidDpi(self.dpi));
        }
        if self.max_width_inches <= 0.0 {
            return Err(ConfigError::InvalidPrintWidth(self.max_width_inches));
        }
        Ok(())
    }
}

/// Canvas template parameters. Combined with a [`Printer`] this fixes the
/// pixel dimensions of every gang sheet part.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CanvasConfiguration {
    pub max_height_inches: f64,
}

impl CanvasConfiguration {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_height_inches <= 0.0 {
            return Err(ConfigError::InvalidCanvasHeight(self.max_height_inches));
        }
        Ok(())
    }
}

/// Pixel dimensions of a full canvas, derived from printer + canvas config.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CanvasDimensions {
    pub width_px: u32,
    pub height_px: u32,
}

impl CanvasDimensions {
    pub fn derive(printer: &Printer, canvas: &CanvasConfiguration) -> Result<Self, ConfigError> {
        printer.validate()?;
        canvas.validate()?;
        let width_px = (printer.max_width_inches * printer.dpi as f64).floor() as u32;
        let height_px = (canvas.max_height_inches * printer.dpi as f64).floor() as u32;
        if width_px == 0 || height_px == 0 {
            return Err(ConfigError::DegenerateCanvas {
                width_px,
                height_px,
            });
        }
        Ok(Self {
            width_px,
            height_px,
        })
    }

    /// Full RGBA byte size of a canvas at these dimensions.
    pub fn required_bytes(&self) -> u64 {
        self.width_px as u64 * self.height_px as u64 * BYTES_PER_PIXEL
    }
}

pub const BYTES_PER_PIXEL: u64 = 4;

/// Memory ceiling and pressure thresholds for one job.
///
/// `ceiling_bytes` is the host limit minus whatever safety margin the
/// operator chose; the engine never second-guesses it.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MemoryBudget {
    pub ceiling_bytes: u64,
    #[serde(default = "default_warning_ratio")]
    pub warning_ratio: f64,
    #[serde(default = "default_critical_ratio")]
    pub critical_ratio: f64,
    #[serde(default = "default_emergency_ratio")]
    pub emergency_ratio: f64,
}

fn default_warning_ratio() -> f64 {
    0.70
}
fn default_critical_ratio() -> f64 {
    0.85
}
fn default_emergency_ratio() -> f64 {
    0.95
}

impl MemoryBudget {
    pub fn new(ceiling_bytes: u64) -> Self {
        Self {
            ceiling_bytes,
            warning_ratio: default_warning_ratio(),
            critical_ratio: default_critical_ratio(),
            emergency_ratio: default_emergency_ratio(),
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.ceiling_bytes == 0 {
            return Err(ConfigError::InvalidCeiling);
        }
        let ok = self.warning_ratio > 0.0
            && self.warning_ratio <= self.critical_ratio
            && self.critical_ratio <= self.emergency_ratio
            && self.emergency_ratio <= 1.0;
        if !ok {
            return Err(ConfigError::InvalidRatios {
                warning: self.warning_ratio,
                critical: self.critical_ratio,
                emergency: self.emergency_ratio,
            });
        }
        Ok(())
    }

    /// Budget the planner partitions against. Deliberately the warning
    /// threshold, not the ceiling: planning is an estimate and needs headroom
    /// for the admission checks during packing to still mean something.
    pub fn planning_budget(&self) -> u64 {
        (self.ceiling_bytes as f64 * self.warning_ratio) as u64
    }
}

/// Canvas sizing strategy, chosen once at job start.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SizingMode {
    /// Always allocate the full configured maximum. Predictable output.
    #[default]
    Fixed,
    /// Start at estimated content height, grow by doubling up to the cap.
    Growable,
}

/// Output pixel format. Only RGBA8 is produced today; typed so the job
/// request stays forward compatible.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PixelFormat {
    #[default]
    Rgba8,
}

/// Bounded retry for the two I/O edges (source fetch, sink emit).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RetryPolicy {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_backoff_ms")]
    pub base_backoff_ms: u64,
}

fn default_max_attempts() -> u32 {
    3
}
fn default_backoff_ms() -> u64 {
    50
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            base_backoff_ms: default_backoff_ms(),
        }
    }
}

/// Engine tunables. Everything here has a documented default and can be
/// overridden per job.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EngineConfig {
    /// Planning estimate for a design whose dimensions are not declared.
    /// 32 MiB is a ~2835x2835 RGBA design (about 9.45" square at 300 dpi).
    /// A heuristic, not a derivation: override it when your catalog skews
    /// larger or smaller.
    #[serde(default = "default_avg_decoded_bytes")]
    pub avg_decoded_bytes_estimate: u64,

    /// Fixed per-sub-batch overhead charged by the planner (decode scratch,
    /// encode buffers, bookkeeping).
    #[serde(default = "default_fixed_overhead")]
    pub fixed_overhead_bytes: u64,

    /// Canvas buffers at or above this size go to a memory-mapped scratch
    /// file instead of the heap.
    #[serde(default = "default_mmap_threshold")]
    pub mmap_threshold_bytes: u64,

    /// Hard cap on unique designs per sub-batch, independent of the memory
    /// estimate. None means memory-only partitioning.
    #[serde(default)]
    pub max_items_per_sub_batch: Option<usize>,

    #[serde(default)]
    pub sizing_mode: SizingMode,

    /// Re-sort the packing queue by decreasing pixel area. Off by default:
    /// input order is the contract unless the caller opts in.
    #[serde(default)]
    pub efficiency_sort: bool,

    #[serde(default)]
    pub output_format: PixelFormat,

    /// Directory for disk-backed canvas scratch files. None uses the
    /// system temp dir.
    #[serde(default)]
    pub scratch_dir: Option<PathBuf>,

    #[serde(default)]
    pub retry: RetryPolicy,
}

fn default_avg_decoded_bytes() -> u64 {
    32 * 1024 * 1024
}
fn default_fixed_overhead() -> u64 {
    16 * 1024 * 1024
}
fn default_mmap_threshold() -> u64 {
    256 * 1024 * 1024
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            avg_decoded_bytes_estimate: default_avg_decoded_bytes(),
            fixed_overhead_bytes: default_fixed_overhead(),
            mmap_threshold_bytes: default_mmap_threshold(),
            max_items_per_sub_batch: None,
            sizing_mode: SizingMode::default(),
            efficiency_sort: false,
            output_format: PixelFormat::default(),
            scratch_dir: None,
            retry: RetryPolicy::default(),
        }
    }
}
