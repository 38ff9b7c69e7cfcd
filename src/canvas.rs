//! Canvas Backing Store - One PixelBuffer Capability, Two Backings
//!
//! Whether a gang sheet's pixels live on the heap or in a memory-mapped
//! scratch file is a size decision made once at allocation, not something the
//! placement loop gets to see. Both backings expose the same write/crop/grow
//! capability; disposal of a mapped buffer deletes its backing file.

use crate::config::{CanvasDimensions, SizingMode, BYTES_PER_PIXEL};
use crate::memory::{AllocationGuard, MemoryMonitor};
use image::{imageops, RgbaImage};
use memmap2::MmapMut;
use std::path::PathBuf;
use std::sync::Arc;
use tempfile::NamedTempFile;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum CanvasError {
    #[error("Scratch file error: {0}")]
    Scratch(#[from] std::io::Error),

    #[error("Canvas growth to {requested_px} rows exceeds configured cap of {cap_px}")]
    GrowthBeyondCap { requested_px: u32, cap_px: u32 },
}

/// The single capability the placement engine sees. Pixels are RGBA8,
/// row-major, transparent-black initialized.
trait PixelBuffer {
    fn width(&self) -> u32;
    fn height(&self) -> u32;
    fn write_pixels(&mut self, x: u32, y: u32, img: &RgbaImage);
    /// Copy out the `w x h` top-left region.
    fn crop_to(&self, w: u32, h: u32) -> RgbaImage;
    fn grow_to_height(&mut self, new_height: u32) -> Result<(), CanvasError>;
    /// Explicit teardown. Mapped buffers delete their scratch file here.
    fn dispose(self: Box<Self>) -> Result<(), CanvasError>;
}

struct HeapBuffer {
    pixels: RgbaImage,
}

impl PixelBuffer for HeapBuffer {
    fn width(&self) -> u32 {
        self.pixels.width()
    }

    fn height(&self) -> u32 {
        self.pixels.height()
    }

    fn write_pixels(&mut self, x: u32, y: u32, img: &RgbaImage) {
        debug_assert!(x + img.width() <= self.width() && y + img.height() <= self.height());
        imageops::replace(&mut self.pixels, img, x as i64, y as i64);
    }

    fn crop_to(&self, w: u32, h: u32) -> RgbaImage {
        imageops::crop_imm(&self.pixels, 0, 0, w, h).to_image()
    }

    fn grow_to_height(&mut self, new_height: u32) -> Result<(), CanvasError> {
        let mut grown = RgbaImage::new(self.width(), new_height);
        imageops::replace(&mut grown, &self.pixels, 0, 0);
        self.pixels = grown;
        Ok(())
    }

    fn dispose(self: Box<Self>) -> Result<(), CanvasError> {
        Ok(())
    }
}

struct MappedBuffer {
    file: NamedTempFile,
    map: MmapMut,
    width: u32,
    height: u32,
}

impl MappedBuffer {
    fn create(width: u32, height: u32, scratch_dir: Option<&PathBuf>) -> Result<Self, CanvasError> {
        let builder = {
            let mut b = tempfile::Builder::new();
            b.prefix("gangforge-canvas-").suffix(".rgba");
            b
        };
        let file = match scratch_dir {
            Some(dir) => builder.tempfile_in(dir)?,
            None => builder.tempfile()?,
        };
        file.as_file()
            .set_len(width as u64 * height as u64 * BYTES_PER_PIXEL)?;
        let map = unsafe { MmapMut::map_mut(file.as_file())? };
        Ok(Self {
            file,
            map,
            width,
            height,
        })
    }

    fn row_bytes(&self) -> usize {
        self.width as usize * BYTES_PER_PIXEL as usize
    }
}

impl PixelBuffer for MappedBuffer {
    fn width(&self) -> u32 {
        self.width
    }

    fn height(&self) -> u32 {
        self.height
    }

    fn write_pixels(&mut self, x: u32, y: u32, img: &RgbaImage) {
        debug_assert!(x + img.width() <= self.width && y + img.height() <= self.height);
        let row_bytes = self.row_bytes();
        let src_row_bytes = img.width() as usize * BYTES_PER_PIXEL as usize;
        let src = img.as_raw();
        for row in 0..img.height() as usize {
            let dst_off = (y as usize + row) * row_bytes + x as usize * BYTES_PER_PIXEL as usize;
            let src_off = row * src_row_bytes;
            self.map[dst_off..dst_off + src_row_bytes]
                .copy_from_slice(&src[src_off..src_off + src_row_bytes]);
        }
    }

    fn crop_to(&self, w: u32, h: u32) -> RgbaImage {
        let row_bytes = self.row_bytes();
        let out_row_bytes = w as usize * BYTES_PER_PIXEL as usize;
        let mut out = Vec::with_capacity(out_row_bytes * h as usize);
        for row in 0..h as usize {
            let off = row * row_bytes;
            out.extend_from_slice(&self.map[off..off + out_row_bytes]);
        }
        RgbaImage::from_raw(w, h, out).expect("crop buffer sized to w*h*4")
    }

    fn grow_to_height(&mut self, new_height: u32) -> Result<(), CanvasError> {
        // Remap after extending the file; existing rows keep their offsets.
        self.file
            .as_file()
            .set_len(self.width as u64 * new_height as u64 * BYTES_PER_PIXEL)?;
        self.map = unsafe { MmapMut::map_mut(self.file.as_file())? };
        self.height = new_height;
        Ok(())
    }

    fn dispose(self: Box<Self>) -> Result<(), CanvasError> {
        drop(self.map);
        self.file.close()?;
        Ok(())
    }
}

/// One live gang sheet buffer plus its memory-accounting guard. At most one
/// of these exists per part.
pub struct Canvas {
    buffer: Box<dyn PixelBuffer>,
    guard: AllocationGuard,
    cap: CanvasDimensions,
    sizing: SizingMode,
}

impl Canvas {
    pub fn width(&self) -> u32 {
        self.buffer.width()
    }

    pub fn height(&self) -> u32 {
        self.buffer.height()
    }

    pub fn cap(&self) -> CanvasDimensions {
        self.cap
    }

    pub fn write_pixels(&mut self, x: u32, y: u32, img: &RgbaImage) {
        self.buffer.write_pixels(x, y, img);
    }

    pub fn crop_to(&self, w: u32, h: u32) -> RgbaImage {
        self.buffer.crop_to(w.min(self.width()), h.min(self.height()))
    }

    /// Make at least `needed_height` rows available. Returns false when the
    /// canvas cannot satisfy it (fixed sizing, or the configured cap): the
    /// caller rolls over to a new part.
    pub fn ensure_height(&mut self, needed_height: u32) -> Result<bool, CanvasError> {
        if needed_height <= self.height() {
            return Ok(true);
        }
        if self.sizing != SizingMode::Growable || needed_height > self.cap.height_px {
            return Ok(false);
        }
        // Double to amortize remaps, clamped to the cap.
        let new_height = (self.height().saturating_mul(2))
            .max(needed_height)
            .min(self.cap.height_px);
        let grown_bytes = self.width() as u64 * new_height as u64 * BYTES_PER_PIXEL;
        self.buffer.grow_to_height(new_height)?;
        self.guard.resize(grown_bytes);
        Ok(true)
    }

    /// Tear down the buffer and its accounting. Mapped scratch files are
    /// deleted here, not at some later GC point.
    pub fn dispose(self) -> Result<(), CanvasError> {
        self.buffer.dispose()?;
        drop(self.guard);
        Ok(())
    }
}

/// Chooses heap vs. mapped backing by estimated size and allocates canvases
/// for the placement engine.
pub struct CanvasBackingStore {
    monitor: Arc<MemoryMonitor>,
    mmap_threshold_bytes: u64,
    scratch_dir: Option<PathBuf>,
    sizing: SizingMode,
}

impl CanvasBackingStore {
    pub fn new(
        monitor: Arc<MemoryMonitor>,
        mmap_threshold_bytes: u64,
        scratch_dir: Option<PathBuf>,
        sizing: SizingMode,
    ) -> Self {
        Self {
            monitor,
            mmap_threshold_bytes,
            scratch_dir,
            sizing,
        }
    }

    /// Allocate a canvas for one part. Under growable sizing the initial
    /// height is the content estimate (clamped to the cap); fixed sizing
    /// always allocates the full configured maximum.
    pub fn allocate(
        &self,
        cap: CanvasDimensions,
        estimated_content_height: Option<u32>,
    ) -> Result<Canvas, CanvasError> {
        let height = match (self.sizing, estimated_content_height) {
            (SizingMode::Growable, Some(h)) => h.clamp(1, cap.height_px),
            _ => cap.height_px,
        };
        let required = cap.width_px as u64 * height as u64 * BYTES_PER_PIXEL;
        let buffer: Box<dyn PixelBuffer> = if required >= self.mmap_threshold_bytes {
            tracing::debug!(required, height, "allocating mapped canvas");
            Box::new(MappedBuffer::create(
                cap.width_px,
                height,
                self.scratch_dir.as_ref(),
            )?)
        } else {
            tracing::debug!(required, height, "allocating heap canvas");
            Box::new(HeapBuffer {
                pixels: RgbaImage::new(cap.width_px, height),
            })
        };
        let guard = self.monitor.register(required);
        Ok(Canvas {
            buffer,
            guard,
            cap,
            sizing: self.sizing,
        })
    }
}
