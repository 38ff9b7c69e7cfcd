//! Placement Engine - Row Packing Under a Memory Ceiling
//!
//! Shelf packing with a single cursor: fill a row left to right, open a new
//! row when the current one is out of width, open a new part when the canvas
//! is out of height. Designs are decoded on demand and their buffers dropped
//! the instant the last copy is placed — that early release is what bounds
//! peak memory to one canvas plus the designs currently mid-placement,
//! instead of one canvas plus the whole sub-batch.

use crate::canvas::CanvasBackingStore;
use crate::config::{CanvasDimensions, EngineConfig, BYTES_PER_PIXEL};
use crate::finalize::{FinalizeError, GangSheetPart, PartFinalizer, PartSink};
use crate::job::{JobState, OrderLineItem, SkipReason, SkippedItem};
use crate::memory::{AllocationGuard, MemoryMonitor, MemoryPressure};
use crate::source::{fetch_with_retry, ImageSource, SourceError};
use image::RgbaImage;
use std::sync::Arc;

/// Ephemeral per-design packing state.
#[derive(Debug, Clone)]
pub struct PlacementRecord {
    pub design_reference: String,
    pub remaining_copies: u32,
    /// Pixel size the design is resized to before placement, when the line
    /// item carries a target size.
    pub target_px: Option<(u32, u32)>,
}

/// Why a sub-batch stopped early. Already-finalized parts are kept either
/// way.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubBatchFailure {
    OutOfMemory,
    SinkFailure,
}

#[derive(Debug)]
pub struct SubBatchOutcome {
    pub parts: Vec<GangSheetPart>,
    pub skipped: Vec<SkippedItem>,
    pub placed_items: u64,
    pub failure: Option<SubBatchFailure>,
}

impl SubBatchOutcome {
    fn finish(
        parts: Vec<GangSheetPart>,
        skipped: Vec<SkippedItem>,
        failure: Option<SubBatchFailure>,
    ) -> Self {
        let placed_items = parts.iter().map(|p| p.placed_item_count as u64).sum();
        Self {
            parts,
            skipped,
            placed_items,
            failure,
        }
    }
}

/// Decoded pixels plus the accounting guard that must die with them.
struct DecodedDesign {
    image: RgbaImage,
    _guard: AllocationGuard,
}

#[derive(Default)]
struct Cursor {
    x: u32,
    y: u32,
    row_height: u32,
}

/// State of the part currently being filled.
struct OpenPart {
    canvas: crate::canvas::Canvas,
    cursor: Cursor,
    placed_count: u32,
    content_width: u32,
    content_height: u32,
    /// Copies written into this part, per design, so an aborted part can
    /// account for every one of them in the skip ledger.
    placed_by_design: Vec<(String, u32)>,
}

impl OpenPart {
    fn new(canvas: crate::canvas::Canvas) -> Self {
        Self {
            canvas,
            cursor: Cursor::default(),
            placed_count: 0,
            content_width: 0,
            content_height: 0,
            placed_by_design: Vec::new(),
        }
    }

    fn record_placement(&mut self, reference: &str) {
        self.placed_count += 1;
        match self.placed_by_design.last_mut() {
            Some((r, n)) if r == reference => *n += 1,
            _ => self.placed_by_design.push((reference.to_string(), 1)),
        }
    }
}

enum FetchOutcome {
    Decoded(DecodedDesign),
    Skipped,
    OutOfMemory,
}

struct PartFailure {
    error: FinalizeError,
    placed_by_design: Vec<(String, u32)>,
}

pub struct PlacementEngine<'a> {
    source: &'a dyn ImageSource,
    store: &'a CanvasBackingStore,
    monitor: Arc<MemoryMonitor>,
    config: &'a EngineConfig,
    dims: CanvasDimensions,
    dpi: u32,
}

impl<'a> PlacementEngine<'a> {
    pub fn new(
        source: &'a dyn ImageSource,
        store: &'a CanvasBackingStore,
        monitor: Arc<MemoryMonitor>,
        config: &'a EngineConfig,
        dims: CanvasDimensions,
        dpi: u32,
    ) -> Self {
        Self {
            source,
            store,
            monitor,
            config,
            dims,
            dpi,
        }
    }

    fn build_queue(&self, items: &[OrderLineItem]) -> Vec<PlacementRecord> {
        let mut queue: Vec<PlacementRecord> = items
            .iter()
            .map(|item| PlacementRecord {
                design_reference: item.design_reference.clone(),
                remaining_copies: item.quantity,
                target_px: item.target_size.map(|(w_in, h_in)| {
                    (
                        ((w_in * self.dpi as f64).round() as u32).max(1),
                        ((h_in * self.dpi as f64).round() as u32).max(1),
                    )
                }),
            })
            .collect();

        if self.config.efficiency_sort {
            // Opt-in only: callers that care about material usage more than
            // input order. Stable, so equal-area designs keep their order.
            queue.sort_by_key(|r| {
                let (w, h) = r
                    .target_px
                    .or_else(|| self.source.dimensions(&r.design_reference))
                    .unwrap_or((0, 0));
                std::cmp::Reverse(w as u64 * h as u64)
            });
        }
        queue
    }

    /// Pack one sub-batch. Parts are numbered from `first_part_index`. Every
    /// line item ends up either placed in a finalized part or in the skip
    /// ledger; nothing is silently dropped.
    pub fn pack(
        &self,
        items: &[OrderLineItem],
        sink: &mut dyn PartSink,
        job_id: &str,
        first_part_index: u32,
        state: &mut JobState,
    ) -> SubBatchOutcome {
        let mut finalizer =
            PartFinalizer::new(job_id, sink, Arc::clone(&self.monitor), &self.config.retry);

        let mut parts: Vec<GangSheetPart> = Vec::new();
        let mut skipped: Vec<SkippedItem> = Vec::new();
        let mut open: Option<OpenPart> = None;
        let mut next_index = first_part_index;

        let mut records = self.build_queue(items).into_iter();
        while let Some(mut record) = records.next() {
            let decoded = match self.fetch_and_decode(&record, &mut skipped) {
                FetchOutcome::Decoded(d) => d,
                FetchOutcome::Skipped => continue,
                FetchOutcome::OutOfMemory => {
                    self.abort(
                        open.take(),
                        &mut record,
                        records,
                        &mut skipped,
                        SkipReason::OutOfMemory,
                        "part aborted: memory admission failed after reclaim",
                    );
                    return SubBatchOutcome::finish(
                        parts,
                        skipped,
                        Some(SubBatchFailure::OutOfMemory),
                    );
                }
            };

            let (w, h) = decoded.image.dimensions();
            if w > self.dims.width_px || h > self.dims.height_px {
                skipped.push(SkippedItem::new(
                    &record.design_reference,
                    SkipReason::TooLargeForCanvas,
                    format!(
                        "design is {}x{} px, canvas maximum is {}x{} px",
                        w, h, self.dims.width_px, self.dims.height_px
                    ),
                ));
                continue;
            }

            while record.remaining_copies > 0 {
                if open.is_none() {
                    match self.open_part(&record) {
                        Ok(p) => open = Some(p),
                        Err(e) => {
                            drop(decoded);
                            self.abort(
                                None,
                                &mut record,
                                records,
                                &mut skipped,
                                SkipReason::OutOfMemory,
                                &format!("canvas allocation failed: {e}"),
                            );
                            return SubBatchOutcome::finish(
                                parts,
                                skipped,
                                Some(SubBatchFailure::OutOfMemory),
                            );
                        }
                    }
                }

                // Out of width: new row.
                {
                    let part = open.as_mut().expect("part opened above");
                    if part.cursor.x > 0 && part.cursor.x + w > self.dims.width_px {
                        part.cursor.y += part.cursor.row_height;
                        part.cursor.x = 0;
                        part.cursor.row_height = 0;
                    }
                }

                // Out of height and unable to grow: the canvas is full.
                let grown = {
                    let part = open.as_mut().expect("part opened above");
                    let needed = part.cursor.y + h;
                    part.canvas.ensure_height(needed)
                };
                match grown {
                    Ok(true) => {}
                    Ok(false) => {
                        let full = open.take().expect("part opened above");
                        match self.close_part(full, &mut finalizer, next_index, job_id, state) {
                            Ok(done) => {
                                next_index += 1;
                                parts.push(done);
                                state.enter(job_id, JobState::Packing);
                                // remaining_copies carries over to the fresh
                                // canvas on the next loop turn.
                                continue;
                            }
                            Err(failure) => {
                                drop(decoded);
                                skipped.extend(failure.lost_placement_skips());
                                self.abort(
                                    None,
                                    &mut record,
                                    records,
                                    &mut skipped,
                                    SkipReason::OutputSinkFailure,
                                    &format!("part {next_index} failed: {}", failure.error),
                                );
                                return SubBatchOutcome::finish(
                                    parts,
                                    skipped,
                                    Some(SubBatchFailure::SinkFailure),
                                );
                            }
                        }
                    }
                    Err(e) => {
                        drop(decoded);
                        self.abort(
                            open.take(),
                            &mut record,
                            records,
                            &mut skipped,
                            SkipReason::OutOfMemory,
                            &format!("canvas growth failed: {e}"),
                        );
                        return SubBatchOutcome::finish(
                            parts,
                            skipped,
                            Some(SubBatchFailure::OutOfMemory),
                        );
                    }
                }

                {
                    let part = open.as_mut().expect("part opened above");
                    part.canvas
                        .write_pixels(part.cursor.x, part.cursor.y, &decoded.image);
                    part.cursor.x += w;
                    part.cursor.row_height = part.cursor.row_height.max(h);
                    part.content_width = part.content_width.max(part.cursor.x);
                    part.content_height = part.content_height.max(part.cursor.y + h);
                    record.remaining_copies -= 1;
                    part.record_placement(&record.design_reference);
                }

                // Admission said yes, but estimates can lie. Past the
                // emergency threshold the part stops, full stop.
                if self.monitor.pressure() == MemoryPressure::Emergency {
                    drop(decoded);
                    self.abort(
                        open.take(),
                        &mut record,
                        records,
                        &mut skipped,
                        SkipReason::OutOfMemory,
                        "part aborted: emergency memory pressure",
                    );
                    return SubBatchOutcome::finish(
                        parts,
                        skipped,
                        Some(SubBatchFailure::OutOfMemory),
                    );
                }
            }

            // Last copy placed: the decoded buffer dies here, not at part or
            // job end.
            drop(decoded);
            self.monitor.reclaim();
        }

        // Queue exhausted: finalize the last (possibly partial) canvas.
        if let Some(last) = open.take() {
            if last.placed_count > 0 {
                match self.close_part(last, &mut finalizer, next_index, job_id, state) {
                    Ok(done) => parts.push(done),
                    Err(failure) => {
                        skipped.extend(failure.lost_placement_skips());
                        return SubBatchOutcome::finish(
                            parts,
                            skipped,
                            Some(SubBatchFailure::SinkFailure),
                        );
                    }
                }
            } else {
                let _ = last.canvas.dispose();
            }
        }

        SubBatchOutcome::finish(parts, skipped, None)
    }

    fn open_part(&self, next: &PlacementRecord) -> Result<OpenPart, crate::canvas::CanvasError> {
        // Growable sizing starts around the first design's footprint; the
        // canvas doubles from there on demand.
        let estimated_height = next
            .target_px
            .or_else(|| self.source.dimensions(&next.design_reference))
            .map(|(_, h)| h.saturating_mul(2));
        let canvas = self.store.allocate(self.dims, estimated_height)?;
        Ok(OpenPart::new(canvas))
    }

    fn close_part(
        &self,
        part: OpenPart,
        finalizer: &mut PartFinalizer,
        index: u32,
        job_id: &str,
        state: &mut JobState,
    ) -> Result<GangSheetPart, PartFailure> {
        state.enter(job_id, JobState::FinalizingPart);
        let placed_by_design = part.placed_by_design.clone();
        finalizer
            .finalize(
                index,
                part.placed_count,
                part.canvas,
                part.content_width,
                part.content_height,
            )
            .map_err(|error| PartFailure {
                error,
                placed_by_design,
            })
    }

    fn fetch_and_decode(
        &self,
        record: &PlacementRecord,
        skipped: &mut Vec<SkippedItem>,
    ) -> FetchOutcome {
        let fetched =
            match fetch_with_retry(self.source, &record.design_reference, &self.config.retry) {
                Ok(img) => img,
                Err(e @ (SourceError::NotFound(_) | SourceError::Io { .. })) => {
                    skipped.push(SkippedItem::new(
                        &record.design_reference,
                        SkipReason::MissingSourceImage,
                        e.to_string(),
                    ));
                    return FetchOutcome::Skipped;
                }
                Err(e @ SourceError::Decode { .. }) => {
                    skipped.push(SkippedItem::new(
                        &record.design_reference,
                        SkipReason::DecodeFailed,
                        e.to_string(),
                    ));
                    return FetchOutcome::Skipped;
                }
            };

        // Admission on the declared size, plus the resize target when one is
        // set (decoded and resized buffers briefly coexist).
        let mut estimate = fetched.estimated_decoded_bytes();
        if let Some((tw, th)) = record.target_px {
            estimate += tw as u64 * th as u64 * BYTES_PER_PIXEL;
        }
        if !self.monitor.can_allocate(estimate) {
            self.monitor.reclaim();
            if !self.monitor.can_allocate(estimate) {
                // One reclaim, one recheck. If the ceiling is real, looping
                // will not make room.
                return FetchOutcome::OutOfMemory;
            }
        }

        let image = match fetched.decode() {
            Ok(img) => img,
            Err(e) => {
                skipped.push(SkippedItem::new(
                    &record.design_reference,
                    SkipReason::DecodeFailed,
                    e.to_string(),
                ));
                return FetchOutcome::Skipped;
            }
        };
        let guard = self
            .monitor
            .register(image.width() as u64 * image.height() as u64 * BYTES_PER_PIXEL);

        let decoded = match record.target_px {
            Some((tw, th)) if (tw, th) != image.dimensions() => {
                let resized =
                    image::imageops::resize(&image, tw, th, image::imageops::FilterType::Lanczos3);
                let resized_guard = self
                    .monitor
                    .register(tw as u64 * th as u64 * BYTES_PER_PIXEL);
                // The full-size decode drops here, before placement begins.
                drop(image);
                drop(guard);
                DecodedDesign {
                    image: resized,
                    _guard: resized_guard,
                }
            }
            _ => DecodedDesign {
                image,
                _guard: guard,
            },
        };
        FetchOutcome::Decoded(decoded)
    }

    /// Abort the current part: dispose the canvas un-emitted and record every
    /// affected copy — already written, mid-design remainder, and the rest of
    /// the queue — in the skip ledger.
    fn abort(
        &self,
        open: Option<OpenPart>,
        current: &mut PlacementRecord,
        rest: std::vec::IntoIter<PlacementRecord>,
        skipped: &mut Vec<SkippedItem>,
        reason: SkipReason,
        message: &str,
    ) {
        if let Some(part) = open {
            for (reference, copies) in &part.placed_by_design {
                skipped.push(SkippedItem::new(
                    reference,
                    reason,
                    format!("{message} ({copies} copies were written to the aborted part)"),
                ));
            }
            let _ = part.canvas.dispose();
        }
        if current.remaining_copies > 0 {
            skipped.push(SkippedItem::new(
                &current.design_reference,
                reason,
                format!("{message} ({} copies unplaced)", current.remaining_copies),
            ));
            current.remaining_copies = 0;
        }
        for record in rest {
            skipped.push(SkippedItem::new(
                &record.design_reference,
                reason,
                message.to_string(),
            ));
        }
        self.monitor.reclaim();
    }
}

impl PartFailure {
    fn lost_placement_skips(&self) -> Vec<SkippedItem> {
        self.placed_by_design
            .iter()
            .map(|(reference, copies)| {
                SkippedItem::new(
                    reference,
                    SkipReason::OutputSinkFailure,
                    format!(
                        "{} ({copies} copies were written to the failed part)",
                        self.error
                    ),
                )
            })
            .collect()
    }
}
