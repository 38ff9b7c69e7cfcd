//! Image Source - Design Bytes By Reference
//!
//! The engine never browses a catalog; it asks for one design at a time and
//! assumes the reference was validated upstream. Fetching is the first of the
//! two I/O edges, so it carries the bounded-retry policy.

use crate::config::RetryPolicy;
use image::{GenericImageView, RgbaImage};
use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum SourceError {
    #[error("Design not found: {0}")]
    NotFound(String),

    #[error("Failed to read design {reference}: {message}")]
    Io { reference: String, message: String },

    #[error("Failed to decode design {reference}: {message}")]
    Decode { reference: String, message: String },
}

impl SourceError {
    /// I/O failures may be transient (network blip, NFS hiccup); a missing
    /// design or a corrupt encoding never heals on retry.
    pub fn is_transient(&self) -> bool {
        matches!(self, SourceError::Io { .. })
    }
}

/// One fetched design: still-encoded bytes plus the dimensions the source
/// declares for it. Decoding is deferred so admission control can run on the
/// declared size first.
#[derive(Debug, Clone)]
pub struct DesignImage {
    pub reference: String,
    pub bytes: Vec<u8>,
    pub width_px: u32,
    pub height_px: u32,
}

impl DesignImage {
    /// RGBA byte size this design will occupy once decoded.
    pub fn estimated_decoded_bytes(&self) -> u64 {
        self.width_px as u64 * self.height_px as u64 * crate::config::BYTES_PER_PIXEL
    }

    pub fn decode(&self) -> Result<RgbaImage, SourceError> {
        let dynamic =
            image::load_from_memory(&self.bytes).map_err(|e| SourceError::Decode {
                reference: self.reference.clone(),
                message: e.to_string(),
            })?;
        Ok(dynamic.to_rgba8())
    }
}

/// Supplies design bytes and dimension metadata by reference.
pub trait ImageSource {
    fn fetch(&self, reference: &str) -> Result<DesignImage, SourceError>;

    /// Cheap dimension peek for planning, without pulling the full bytes.
    /// None when the source cannot answer without a fetch.
    fn dimensions(&self, reference: &str) -> Option<(u32, u32)>;
}

/// Fetch with the configured retry budget. Only transient errors retry;
/// NOT_FOUND and decode failures surface immediately.
pub fn fetch_with_retry(
    source: &dyn ImageSource,
    reference: &str,
    retry: &RetryPolicy,
) -> Result<DesignImage, SourceError> {
    let attempts = retry.max_attempts.max(1);
    let mut last = None;
    for attempt in 1..=attempts {
        match source.fetch(reference) {
            Ok(img) => return Ok(img),
            Err(e) if e.is_transient() && attempt < attempts => {
                tracing::warn!(reference, attempt, error = %e, "transient fetch failure, retrying");
                std::thread::sleep(Duration::from_millis(
                    retry.base_backoff_ms * attempt as u64,
                ));
                last = Some(e);
            }
            Err(e) => return Err(e),
        }
    }
    Err(last.unwrap_or_else(|| SourceError::NotFound(reference.to_string())))
}

/// Directory-backed source: `<dir>/<reference>` must be an image file
/// (the reference includes its extension).
pub struct DirectorySource {
    root: PathBuf,
}

impl DirectorySource {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn path_for(&self, reference: &str) -> PathBuf {
        self.root.join(reference)
    }
}

impl ImageSource for DirectorySource {
    fn fetch(&self, reference: &str) -> Result<DesignImage, SourceError> {
        let path = self.path_for(reference);
        if !path.is_file() {
            return Err(SourceError::NotFound(reference.to_string()));
        }
        let bytes = std::fs::read(&path).map_err(|e| SourceError::Io {
            reference: reference.to_string(),
            message: e.to_string(),
        })?;
        let (width_px, height_px) =
            image::load_from_memory(&bytes)
                .map(|d| (d.width(), d.height()))
                .map_err(|e| SourceError::Decode {
                    reference: reference.to_string(),
                    message: e.to_string(),
                })?;
        Ok(DesignImage {
            reference: reference.to_string(),
            bytes,
            width_px,
            height_px,
        })
    }

    fn dimensions(&self, reference: &str) -> Option<(u32, u32)> {
        image::image_dimensions(self.path_for(reference)).ok()
    }
}

/// In-memory source for tests and embedded callers.
#[derive(Default)]
pub struct InMemorySource {
    designs: HashMap<String, DesignImage>,
}

impl InMemorySource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, reference: &str, img: &RgbaImage) {
        let mut bytes = Vec::new();
        let mut cursor = std::io::Cursor::new(&mut bytes);
        img.write_to(&mut cursor, image::ImageFormat::Png)
            .expect("png encode of in-memory design");
        self.designs.insert(
            reference.to_string(),
            DesignImage {
                reference: reference.to_string(),
                bytes,
                width_px: img.width(),
                height_px: img.height(),
            },
        );
    }

    /// Declare a design's dimensions without any backing bytes. Fetch will
    /// report it missing; the planner still sees its size. Used to model
    /// catalog metadata that outlives the stored file.
    pub fn insert_phantom(&mut self, reference: &str, width_px: u32, height_px: u32) {
        self.designs.insert(
            reference.to_string(),
            DesignImage {
                reference: reference.to_string(),
                bytes: Vec::new(),
                width_px,
                height_px,
            },
        );
    }
}

impl ImageSource for InMemorySource {
    fn fetch(&self, reference: &str) -> Result<DesignImage, SourceError> {
        match self.designs.get(reference) {
            Some(img) if !img.bytes.is_empty() => Ok(img.clone()),
            _ => Err(SourceError::NotFound(reference.to_string())),
        }
    }

    fn dimensions(&self, reference: &str) -> Option<(u32, u32)> {
        self.designs
            .get(reference)
            .map(|d| (d.width_px, d.height_px))
    }
}
