//! Contract Invariant Tests
//!
//! These tests verify the non-negotiable guarantees: conservation of line
//! items, dimension bounds, memory-ceiling honor, and the failure-isolation
//! scenarios.

use gangforge_core::{
    CanvasConfiguration, DesignImage, EngineConfig, GangSheetJob, ImageSource, InMemorySource,
    JobRunner, JobStatus, MemoryBudget, OrderLineItem, PartMetadata, PartSink, Printer, SinkError,
    SizingMode, SkipReason, SourceError,
};
use image::{Rgba, RgbaImage};

const RED: Rgba<u8> = Rgba([255, 0, 0, 255]);
const GREEN: Rgba<u8> = Rgba([0, 255, 0, 255]);
const BLUE: Rgba<u8> = Rgba([0, 0, 255, 255]);

fn design(w: u32, h: u32, color: Rgba<u8>) -> RgbaImage {
    RgbaImage::from_pixel(w, h, color)
}

fn item(reference: &str, quantity: u32) -> OrderLineItem {
    OrderLineItem {
        design_reference: reference.to_string(),
        quantity,
        target_size: None,
    }
}

/// A 10px-per-inch printer keeps the pixel math legible in tests.
fn job(width_in: f64, height_in: f64, items: Vec<OrderLineItem>) -> GangSheetJob {
    GangSheetJob {
        job_id: Some("test-job".to_string()),
        items,
        printer: Printer {
            dpi: 10,
            max_width_inches: width_in,
        },
        canvas: CanvasConfiguration {
            max_height_inches: height_in,
        },
        memory: MemoryBudget::new(1 << 30),
        engine: EngineConfig::default(),
    }
}

/// Collects emitted parts in memory and can be made to fail.
#[derive(Default)]
struct MemorySink {
    parts: Vec<(PartMetadata, Vec<u8>)>,
    transient_failures_left: u32,
}

impl PartSink for MemorySink {
    fn emit(
        &mut self,
        _job_id: &str,
        metadata: &PartMetadata,
        bytes: &[u8],
    ) -> Result<String, SinkError> {
        if self.transient_failures_left > 0 {
            self.transient_failures_left -= 1;
            return Err(SinkError::Transient("simulated outage".into()));
        }
        let locator = format!("mem://part/{}", metadata.part_index);
        self.parts.push((metadata.clone(), bytes.to_vec()));
        Ok(locator)
    }
}

fn decode(bytes: &[u8]) -> RgbaImage {
    image::load_from_memory(bytes).unwrap().to_rgba8()
}

#[test]
fn invariant_all_quantities_placed_without_failures() {
    let mut source = InMemorySource::new();
    source.insert("a.png", &design(10, 10, RED));
    source.insert("b.png", &design(7, 9, GREEN));
    source.insert("c.png", &design(13, 4, BLUE));

    let job = job(
        10.0,
        10.0,
        vec![item("a.png", 6), item("b.png", 4), item("c.png", 7)],
    );
    let mut sink = MemorySink::default();
    let summary = JobRunner::new(&source, &mut sink).run(&job).unwrap();

    assert_eq!(summary.status, JobStatus::Completed);
    assert_eq!(summary.requested_copies, 17);
    assert_eq!(summary.placed_copies, 17);
    let total: u64 = summary
        .parts
        .iter()
        .map(|p| p.placed_item_count as u64)
        .sum();
    assert_eq!(total, 17);
    assert!(summary.skipped_items.is_empty());
}

#[test]
fn invariant_part_dimensions_never_exceed_configuration() {
    let mut source = InMemorySource::new();
    source.insert("a.png", &design(9, 9, RED));
    source.insert("b.png", &design(14, 6, GREEN));

    let job = job(3.0, 2.5, vec![item("a.png", 11), item("b.png", 9)]);
    let mut sink = MemorySink::default();
    let summary = JobRunner::new(&source, &mut sink).run(&job).unwrap();

    assert!(!summary.parts.is_empty());
    for part in &summary.parts {
        assert!(part.actual_width_px <= 30, "part {} too wide", part.part_index);
        assert!(part.actual_height_px <= 25, "part {} too tall", part.part_index);
    }
    // Monotonic numbering from 1 in emission order.
    for (i, part) in summary.parts.iter().enumerate() {
        assert_eq!(part.part_index as usize, i + 1);
    }
}

#[test]
fn invariant_peak_memory_stays_under_critical_threshold() {
    let mut source = InMemorySource::new();
    source.insert("a.png", &design(10, 10, RED));
    source.insert("b.png", &design(10, 10, GREEN));

    // Ceiling sized so the job fits but not extravagantly: canvas is
    // 100x100x4 = 40_000 bytes, designs 400 bytes each.
    let mut job = job(10.0, 10.0, vec![item("a.png", 20), item("b.png", 20)]);
    job.memory = MemoryBudget::new(200_000);
    job.engine.fixed_overhead_bytes = 0;

    let mut sink = MemorySink::default();
    let summary = JobRunner::new(&source, &mut sink).run(&job).unwrap();

    assert_eq!(summary.status, JobStatus::Completed);
    let critical = (200_000.0 * job.memory.critical_ratio) as u64;
    assert!(
        summary.peak_memory_bytes <= critical,
        "peak {} exceeded critical threshold {}",
        summary.peak_memory_bytes,
        critical
    );
    assert!(summary.peak_memory_bytes >= 40_000, "canvas not accounted");
}

#[test]
fn scenario_a_single_row_single_part_in_input_order() {
    let mut source = InMemorySource::new();
    source.insert("a.png", &design(10, 10, RED));
    source.insert("b.png", &design(10, 10, GREEN));
    source.insert("c.png", &design(10, 10, BLUE));

    // Canvas 100x10 px: one row of exactly 10 items.
    let job = job(
        10.0,
        1.0,
        vec![item("a.png", 5), item("b.png", 3), item("c.png", 2)],
    );
    let mut sink = MemorySink::default();
    let summary = JobRunner::new(&source, &mut sink).run(&job).unwrap();

    assert_eq!(summary.status, JobStatus::Completed);
    assert_eq!(summary.parts.len(), 1);
    let part = &summary.parts[0];
    assert_eq!(part.placed_item_count, 10);
    assert_eq!((part.actual_width_px, part.actual_height_px), (100, 10));

    // Input order on the sheet: 5 red, 3 green, 2 blue, left to right.
    let sheet = decode(&sink.parts[0].1);
    assert_eq!(sheet.get_pixel(5, 5), &RED);
    assert_eq!(sheet.get_pixel(45, 5), &RED);
    assert_eq!(sheet.get_pixel(55, 5), &GREEN);
    assert_eq!(sheet.get_pixel(75, 5), &GREEN);
    assert_eq!(sheet.get_pixel(85, 5), &BLUE);
    assert_eq!(sheet.get_pixel(95, 5), &BLUE);
}

#[test]
fn scenario_b_oversized_estimate_skipped_before_allocation() {
    let mut source = InMemorySource::new();
    source.insert("ok.png", &design(10, 10, RED));
    // Declared dimensions only: 4000x4000 RGBA is 64 MB of decode.
    source.insert_phantom("giant.png", 4000, 4000);

    let mut job = job(10.0, 10.0, vec![item("ok.png", 2), item("giant.png", 1)]);
    job.memory = MemoryBudget::new(10 * 1024 * 1024);
    job.engine.fixed_overhead_bytes = 0;

    let mut sink = MemorySink::default();
    let summary = JobRunner::new(&source, &mut sink).run(&job).unwrap();

    assert_eq!(summary.status, JobStatus::CompletedWithSkips);
    assert_eq!(summary.skipped_items.len(), 1);
    let skip = &summary.skipped_items[0];
    assert_eq!(skip.design_reference, "giant.png");
    assert_eq!(skip.reason, SkipReason::OutOfMemory);
    assert!(skip.message.contains("planning budget"));
    assert_eq!(summary.placed_copies, 2);
}

#[test]
fn invariant_mid_part_memory_abort_keeps_finished_parts() {
    /// Understates one design's dimensions so admission passes on the
    /// declared size and the ceiling is only crossed after decode, the way a
    /// stale catalog entry would.
    struct UnderreportingSource {
        inner: InMemorySource,
        lie_about: String,
    }
    impl ImageSource for UnderreportingSource {
        fn fetch(&self, reference: &str) -> Result<DesignImage, SourceError> {
            let mut img = self.inner.fetch(reference)?;
            if reference == self.lie_about {
                img.width_px = 1;
                img.height_px = 1;
            }
            Ok(img)
        }
        fn dimensions(&self, reference: &str) -> Option<(u32, u32)> {
            if reference == self.lie_about {
                Some((1, 1))
            } else {
                self.inner.dimensions(reference)
            }
        }
    }

    let mut inner = InMemorySource::new();
    inner.insert("good.png", &design(10, 10, RED));
    inner.insert("sneaky.png", &design(64, 64, GREEN));
    inner.insert("tail.png", &design(10, 10, BLUE));
    let source = UnderreportingSource {
        inner,
        lie_about: "sneaky.png".to_string(),
    };

    // Canvas 100x100x4 = 40_000 bytes. The sneaky design really decodes to
    // 64x64x4 = 16_384 bytes, so canvas + decode crosses the emergency
    // threshold (0.95 * 58_000 = 55_100) right after the first copy lands.
    let mut job = job(
        10.0,
        10.0,
        vec![item("good.png", 1), item("sneaky.png", 2), item("tail.png", 1)],
    );
    job.memory = MemoryBudget::new(58_000);
    job.engine.fixed_overhead_bytes = 0;
    // One item per sub-batch isolates the abort from its neighbors.
    job.engine.max_items_per_sub_batch = Some(1);

    let mut sink = MemorySink::default();
    let summary = JobRunner::new(&source, &mut sink).run(&job).unwrap();

    assert_eq!(summary.status, JobStatus::PartiallyFailed);
    assert_eq!(summary.sub_batches, 3);
    assert_eq!(summary.failed_sub_batches, 1);

    // The parts finalized before and after the aborted sub-batch survive,
    // with continuous numbering.
    assert_eq!(summary.parts.len(), 2);
    assert_eq!(summary.parts[0].part_index, 1);
    assert_eq!(summary.parts[1].part_index, 2);
    assert_eq!(summary.placed_copies, 2);

    // Both sneaky copies are accounted for: the one written to the aborted
    // part and the one never placed.
    assert_eq!(summary.skipped_items.len(), 2);
    assert!(summary
        .skipped_items
        .iter()
        .all(|s| s.design_reference == "sneaky.png" && s.reason == SkipReason::OutOfMemory));
}

#[test]
fn scenario_c_rollover_keeps_designs_ordered_across_parts() {
    let mut source = InMemorySource::new();
    source.insert("a.png", &design(10, 10, RED));
    source.insert("b.png", &design(10, 10, GREEN));

    // Canvas 30x20 px: 3 per row, 2 rows, 6 items per part.
    let job = job(3.0, 2.0, vec![item("a.png", 4), item("b.png", 4)]);
    let mut sink = MemorySink::default();
    let summary = JobRunner::new(&source, &mut sink).run(&job).unwrap();

    assert_eq!(summary.status, JobStatus::Completed);
    assert_eq!(summary.parts.len(), 2);
    assert_eq!(summary.parts[0].placed_item_count, 6);
    assert_eq!(summary.parts[1].placed_item_count, 2);

    // Part 1 carries all of A and the first two B copies.
    let part1 = decode(&sink.parts[0].1);
    assert_eq!(part1.get_pixel(5, 5), &RED);
    assert_eq!(part1.get_pixel(25, 5), &RED);
    assert_eq!(part1.get_pixel(5, 15), &RED);
    assert_eq!(part1.get_pixel(15, 15), &GREEN);
    assert_eq!(part1.get_pixel(25, 15), &GREEN);

    // Part 2 holds only the B remainder.
    let part2 = decode(&sink.parts[1].1);
    assert_eq!(part2.get_pixel(5, 5), &GREEN);
    assert_eq!(part2.get_pixel(15, 5), &GREEN);
    assert_eq!((part2.width(), part2.height()), (20, 10));
}

#[test]
fn scenario_d_missing_design_skipped_others_placed() {
    let mut source = InMemorySource::new();
    for name in ["a.png", "b.png", "d.png", "e.png"] {
        source.insert(name, &design(10, 10, RED));
    }
    // "c.png" is never inserted.

    let items = vec![
        item("a.png", 2),
        item("b.png", 2),
        item("c.png", 2),
        item("d.png", 2),
        item("e.png", 2),
    ];
    let job = job(10.0, 10.0, items);
    let mut sink = MemorySink::default();
    let summary = JobRunner::new(&source, &mut sink).run(&job).unwrap();

    assert_eq!(summary.status, JobStatus::CompletedWithSkips);
    assert_eq!(summary.skipped_items.len(), 1);
    assert_eq!(summary.skipped_items[0].design_reference, "c.png");
    assert_eq!(
        summary.skipped_items[0].reason,
        SkipReason::MissingSourceImage
    );
    assert_eq!(summary.placed_copies, 8);
}

#[test]
fn invariant_crop_matches_content_extent() {
    let mut source = InMemorySource::new();
    source.insert("a.png", &design(12, 8, RED));

    // Canvas 100x100 px, 3 copies in one 36x8 row.
    let job = job(10.0, 10.0, vec![item("a.png", 3)]);
    let mut sink = MemorySink::default();
    let summary = JobRunner::new(&source, &mut sink).run(&job).unwrap();

    let part = &summary.parts[0];
    assert_eq!((part.actual_width_px, part.actual_height_px), (36, 8));

    // Re-read the emitted file: dimensions match, corners are content.
    let sheet = decode(&sink.parts[0].1);
    assert_eq!(sheet.dimensions(), (36, 8));
    assert_eq!(sheet.get_pixel(0, 0), &RED);
    assert_eq!(sheet.get_pixel(35, 7), &RED);
}

#[test]
fn invariant_target_size_resizes_before_placement() {
    let mut source = InMemorySource::new();
    source.insert("a.png", &design(40, 40, RED));

    let mut items = vec![item("a.png", 2)];
    // 1.5 x 1.0 inches at 10 dpi: 15x10 px on the sheet.
    items[0].target_size = Some((1.5, 1.0));
    let job = job(10.0, 10.0, items);
    let mut sink = MemorySink::default();
    let summary = JobRunner::new(&source, &mut sink).run(&job).unwrap();

    let part = &summary.parts[0];
    assert_eq!((part.actual_width_px, part.actual_height_px), (30, 10));
}

#[test]
fn invariant_item_wider_than_canvas_is_skipped_not_lost() {
    let mut source = InMemorySource::new();
    source.insert("wide.png", &design(50, 10, RED));
    source.insert("ok.png", &design(10, 10, GREEN));

    // Canvas 30 px wide: "wide" can never fit any part.
    let job = job(3.0, 10.0, vec![item("wide.png", 1), item("ok.png", 1)]);
    let mut sink = MemorySink::default();
    let summary = JobRunner::new(&source, &mut sink).run(&job).unwrap();

    assert_eq!(summary.status, JobStatus::CompletedWithSkips);
    assert_eq!(summary.skipped_items.len(), 1);
    assert_eq!(summary.skipped_items[0].reason, SkipReason::TooLargeForCanvas);
    assert_eq!(summary.placed_copies, 1);
}

#[test]
fn invariant_transient_sink_failure_recovers_within_budget() {
    let mut source = InMemorySource::new();
    source.insert("a.png", &design(10, 10, RED));

    let mut job = job(10.0, 10.0, vec![item("a.png", 3)]);
    job.engine.retry.base_backoff_ms = 0;
    let mut sink = MemorySink {
        transient_failures_left: 2,
        ..MemorySink::default()
    };
    let summary = JobRunner::new(&source, &mut sink).run(&job).unwrap();

    assert_eq!(summary.status, JobStatus::Completed);
    assert_eq!(sink.parts.len(), 1);
}

#[test]
fn invariant_sink_exhaustion_fails_part_and_records_items() {
    let mut source = InMemorySource::new();
    source.insert("a.png", &design(10, 10, RED));

    let mut job = job(10.0, 10.0, vec![item("a.png", 3)]);
    job.engine.retry.max_attempts = 2;
    job.engine.retry.base_backoff_ms = 0;
    let mut sink = MemorySink {
        transient_failures_left: 99,
        ..MemorySink::default()
    };
    let summary = JobRunner::new(&source, &mut sink).run(&job).unwrap();

    assert_eq!(summary.status, JobStatus::Failed);
    assert!(summary.parts.is_empty());
    assert!(!summary.skipped_items.is_empty());
    assert!(summary
        .skipped_items
        .iter()
        .all(|s| s.reason == SkipReason::OutputSinkFailure));
}

#[test]
fn invariant_cancellation_between_sub_batches() {
    use gangforge_core::CancelToken;

    struct CancellingSink {
        inner: MemorySink,
        token: CancelToken,
    }
    impl PartSink for CancellingSink {
        fn emit(
            &mut self,
            job_id: &str,
            metadata: &PartMetadata,
            bytes: &[u8],
        ) -> Result<String, SinkError> {
            let result = self.inner.emit(job_id, metadata, bytes);
            // Operator pulls the plug after the first part lands.
            self.token.cancel();
            result
        }
    }

    let mut source = InMemorySource::new();
    source.insert("a.png", &design(10, 10, RED));
    source.insert("b.png", &design(10, 10, GREEN));

    let mut job = job(10.0, 10.0, vec![item("a.png", 1), item("b.png", 1)]);
    // Force two sub-batches so the token check between them fires.
    job.engine.max_items_per_sub_batch = Some(1);

    let token = CancelToken::new();
    let mut sink = CancellingSink {
        inner: MemorySink::default(),
        token: token.clone(),
    };
    let summary = JobRunner::new(&source, &mut sink)
        .run_with_cancel(&job, &token)
        .unwrap();

    assert_eq!(summary.status, JobStatus::PartiallyFailed);
    assert_eq!(summary.parts.len(), 1);
    assert_eq!(summary.skipped_items.len(), 1);
    assert_eq!(summary.skipped_items[0].design_reference, "b.png");
    assert_eq!(summary.skipped_items[0].reason, SkipReason::Cancelled);
}

#[test]
fn invariant_invalid_configuration_fails_whole_job() {
    let source = InMemorySource::new();
    let mut bad = job(10.0, 10.0, vec![item("a.png", 1)]);
    bad.printer.dpi = 0;

    let mut sink = MemorySink::default();
    let result = JobRunner::new(&source, &mut sink).run(&bad);
    assert!(result.is_err());
    assert!(result.unwrap_err().to_string().contains("dpi"));
    assert!(sink.parts.is_empty());
}

#[test]
fn invariant_growable_sizing_produces_same_output() {
    let mut source = InMemorySource::new();
    source.insert("a.png", &design(10, 10, RED));
    source.insert("b.png", &design(10, 10, GREEN));
    let items = vec![item("a.png", 4), item("b.png", 4)];

    let fixed_job = job(3.0, 2.0, items.clone());
    let mut fixed_sink = MemorySink::default();
    let fixed = JobRunner::new(&source, &mut fixed_sink)
        .run(&fixed_job)
        .unwrap();

    let mut growable_job = job(3.0, 2.0, items);
    growable_job.engine.sizing_mode = SizingMode::Growable;
    let mut growable_sink = MemorySink::default();
    let growable = JobRunner::new(&source, &mut growable_sink)
        .run(&growable_job)
        .unwrap();

    assert_eq!(fixed.parts.len(), growable.parts.len());
    for (f, g) in fixed.parts.iter().zip(&growable.parts) {
        assert_eq!(f.placed_item_count, g.placed_item_count);
        assert_eq!(f.actual_width_px, g.actual_width_px);
        assert_eq!(f.actual_height_px, g.actual_height_px);
        assert_eq!(f.content_sha256, g.content_sha256);
    }
}

#[test]
fn invariant_efficiency_sort_places_largest_first() {
    let mut source = InMemorySource::new();
    source.insert("small.png", &design(5, 5, GREEN));
    source.insert("big.png", &design(10, 10, RED));

    let mut job = job(10.0, 10.0, vec![item("small.png", 1), item("big.png", 1)]);
    job.engine.efficiency_sort = true;
    let mut sink = MemorySink::default();
    let summary = JobRunner::new(&source, &mut sink).run(&job).unwrap();

    assert_eq!(summary.placed_copies, 2);
    let sheet = decode(&sink.parts[0].1);
    // Big lands at the origin despite arriving second in the input.
    assert_eq!(sheet.get_pixel(0, 0), &RED);
    assert_eq!(sheet.get_pixel(12, 2), &GREEN);
}

#[test]
fn invariant_multi_sub_batch_job_emits_all_parts() {
    let mut source = InMemorySource::new();
    source.insert("a.png", &design(10, 10, RED));
    source.insert("b.png", &design(10, 10, GREEN));
    source.insert("c.png", &design(10, 10, BLUE));

    let mut job = job(
        10.0,
        1.0,
        vec![item("a.png", 10), item("b.png", 10), item("c.png", 10)],
    );
    job.engine.max_items_per_sub_batch = Some(1);
    let mut sink = MemorySink::default();
    let summary = JobRunner::new(&source, &mut sink).run(&job).unwrap();

    assert_eq!(summary.status, JobStatus::Completed);
    assert_eq!(summary.sub_batches, 3);
    assert_eq!(summary.placed_copies, 30);
    // Each sub-batch fills one 10-wide row exactly; part numbering is
    // continuous across sub-batches.
    assert_eq!(summary.parts.len(), 3);
    for (i, part) in summary.parts.iter().enumerate() {
        assert_eq!(part.part_index as usize, i + 1);
        assert_eq!(part.placed_item_count, 10);
    }
}
