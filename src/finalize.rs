//! Part Finalizer - Crop, Encode, Emit, Release
//!
//! A part is atomic once begun: by the time control returns from here the
//! encoded file has been handed to the sink (or the part has failed past its
//! retry budget) and every buffer the part owned is gone. The next part
//! starts from a clean slate.

use crate::canvas::{Canvas, CanvasError};
use crate::config::{RetryPolicy, BYTES_PER_PIXEL};
use crate::memory::MemoryMonitor;
use serde::Serialize;
use sha2::{Digest, Sha256};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

/// Reclaim passes run after a part's buffers are dropped. Two is enough to
/// drain the pending-release counter and give glibc a second look at arenas
/// freed by the first trim.
const RECLAIM_PASSES_PER_PART: u32 = 2;

#[derive(Debug, Error)]
pub enum SinkError {
    #[error("Transient sink failure: {0}")]
    Transient(String),

    #[error("Sink failure: {0}")]
    Fatal(String),
}

#[derive(Debug, Error)]
pub enum FinalizeError {
    #[error(transparent)]
    Canvas(#[from] CanvasError),

    #[error("Failed to encode part {part_index}: {message}")]
    Encode { part_index: u32, message: String },

    #[error("Sink rejected part {part_index} after {attempts} attempts: {message}")]
    SinkExhausted {
        part_index: u32,
        attempts: u32,
        message: String,
    },
}

/// One finished output file of a gang sheet job.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GangSheetPart {
    pub part_index: u32,
    pub placed_item_count: u32,
    pub actual_width_px: u32,
    pub actual_height_px: u32,
    pub file_path: String,
    pub content_sha256: String,
    pub bytes_freed: u64,
}

/// Metadata handed to the sink alongside the encoded bytes.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PartMetadata {
    pub part_index: u32,
    pub placed_item_count: u32,
    pub width_px: u32,
    pub height_px: u32,
    pub content_sha256: String,
}

/// Destination for finished parts. `emit` returns a sink-assigned locator
/// (a file path for directory sinks).
pub trait PartSink {
    fn emit(
        &mut self,
        job_id: &str,
        metadata: &PartMetadata,
        bytes: &[u8],
    ) -> Result<String, SinkError>;
}

/// Writes `part_<n>.png` files into one directory.
pub struct DirectorySink {
    out_dir: std::path::PathBuf,
}

impl DirectorySink {
    pub fn new(out_dir: impl Into<std::path::PathBuf>) -> Self {
        Self {
            out_dir: out_dir.into(),
        }
    }
}

impl PartSink for DirectorySink {
    fn emit(
        &mut self,
        _job_id: &str,
        metadata: &PartMetadata,
        bytes: &[u8],
    ) -> Result<String, SinkError> {
        std::fs::create_dir_all(&self.out_dir)
            .map_err(|e| SinkError::Fatal(format!("create output dir: {e}")))?;
        let path = self.out_dir.join(format!("part_{:03}.png", metadata.part_index));
        std::fs::write(&path, bytes).map_err(|e| SinkError::Transient(e.to_string()))?;
        Ok(path.to_string_lossy().into_owned())
    }
}

fn sha256_hex(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hasher
        .finalize()
        .iter()
        .map(|b| format!("{b:02x}"))
        .collect()
}

pub struct PartFinalizer<'a> {
    job_id: &'a str,
    sink: &'a mut dyn PartSink,
    monitor: Arc<MemoryMonitor>,
    retry: &'a RetryPolicy,
}

impl<'a> PartFinalizer<'a> {
    pub fn new(
        job_id: &'a str,
        sink: &'a mut dyn PartSink,
        monitor: Arc<MemoryMonitor>,
        retry: &'a RetryPolicy,
    ) -> Self {
        Self {
            job_id,
            sink,
            monitor,
            retry,
        }
    }

    /// Finish one part: crop the canvas to the written extent, encode PNG,
    /// emit through the sink with bounded retry, then release everything and
    /// run the reclaim passes. Consumes the canvas either way.
    pub fn finalize(
        &mut self,
        part_index: u32,
        placed_item_count: u32,
        canvas: Canvas,
        content_width: u32,
        content_height: u32,
    ) -> Result<GangSheetPart, FinalizeError> {
        let crop_w = content_width.clamp(1, canvas.cap().width_px);
        let crop_h = content_height.clamp(1, canvas.cap().height_px);

        let cropped = canvas.crop_to(crop_w, crop_h);
        let _crop_guard = self
            .monitor
            .register(crop_w as u64 * crop_h as u64 * BYTES_PER_PIXEL);

        let mut encoded = Vec::new();
        cropped
            .write_to(
                &mut std::io::Cursor::new(&mut encoded),
                image::ImageFormat::Png,
            )
            .map_err(|e| FinalizeError::Encode {
                part_index,
                message: e.to_string(),
            })?;
        let content_sha256 = sha256_hex(&encoded);

        let metadata = PartMetadata {
            part_index,
            placed_item_count,
            width_px: crop_w,
            height_px: crop_h,
            content_sha256: content_sha256.clone(),
        };

        let emit_result = self.emit_with_retry(&metadata, &encoded);

        // Release order is fixed regardless of the emit outcome: encoded
        // bytes, cropped buffer, then the canvas itself, then the reclaim
        // passes. A sink failure must not leak a part's buffers.
        drop(encoded);
        drop(cropped);
        drop(_crop_guard);
        let dispose_result = canvas.dispose();
        if let Err(e) = &dispose_result {
            tracing::warn!(part_index, error = %e, "canvas teardown failed");
        }
        let mut bytes_freed = 0;
        for _ in 0..RECLAIM_PASSES_PER_PART {
            bytes_freed += self.monitor.reclaim();
        }

        // When both the sink and the teardown fail, the sink error is the one
        // the caller acts on; the teardown failure is already logged.
        let file_path = emit_result?;
        dispose_result?;
        tracing::info!(
            part_index,
            placed_item_count,
            width_px = crop_w,
            height_px = crop_h,
            bytes_freed,
            "part finalized"
        );

        Ok(GangSheetPart {
            part_index,
            placed_item_count,
            actual_width_px: crop_w,
            actual_height_px: crop_h,
            file_path,
            content_sha256,
            bytes_freed,
        })
    }

    fn emit_with_retry(
        &mut self,
        metadata: &PartMetadata,
        bytes: &[u8],
    ) -> Result<String, FinalizeError> {
        let attempts = self.retry.max_attempts.max(1);
        let mut last_message = String::new();
        for attempt in 1..=attempts {
            match self.sink.emit(self.job_id, metadata, bytes) {
                Ok(path) => return Ok(path),
                Err(SinkError::Transient(msg)) if attempt < attempts => {
                    tracing::warn!(
                        part_index = metadata.part_index,
                        attempt,
                        error = %msg,
                        "transient sink failure, retrying"
                    );
                    std::thread::sleep(Duration::from_millis(
                        self.retry.base_backoff_ms * attempt as u64,
                    ));
                    last_message = msg;
                }
                Err(SinkError::Transient(msg)) => last_message = msg,
                Err(SinkError::Fatal(msg)) => {
                    return Err(FinalizeError::SinkExhausted {
                        part_index: metadata.part_index,
                        attempts: attempt,
                        message: msg,
                    })
                }
            }
        }
        Err(FinalizeError::SinkExhausted {
            part_index: metadata.part_index,
            attempts,
            message: last_message,
        })
    }
}
