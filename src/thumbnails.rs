//! Multi-resolution rendition cache stored in the `thumb<size>` tables.
//!
//! Each ladder rendition is scaled so its shorter side equals the ladder
//! size. A missing rendition is built from the next larger one that
//! qualifies, or from the original blob when none does; the recursion only
//! ever moves up the fixed ladder, so it is at most `LADDER.len()` deep.

use std::sync::atomic::AtomicBool;
use std::sync::Arc;

use image::imageops::FilterType;
use image::DynamicImage;

use crate::db::{images, ConnectionPool, LADDER};
use crate::error::{Result, StoreError};
use crate::index::ReferenceIndex;
use crate::media::metadata::{decode, encode_jpeg, read_dimensions};
use crate::tasks::is_cancelled;
use crate::writer::{DeferredWriter, WriteCommand};

/// Smallest ladder size that covers `requested` and that the source can
/// downscale into at least twice over.
pub fn ladder_size_for(requested: u32, source_shorter_side: u32) -> Option<u32> {
    LADDER
        .iter()
        .copied()
        .find(|&size| size >= requested && source_shorter_side >= size * 2)
}

/// Dimensions that make the shorter side exactly `size`, keeping aspect.
pub fn cover_dimensions(width: u32, height: u32, size: u32) -> (u32, u32) {
    let shorter = width.min(height).max(1) as f64;
    let scale = size as f64 / shorter;
    let w = ((width as f64 * scale).round() as u32).max(1);
    let h = ((height as f64 * scale).round() as u32).max(1);
    (w, h)
}

pub struct ThumbnailPyramid {
    pool: Arc<ConnectionPool>,
    index: Arc<ReferenceIndex>,
    writer: Arc<DeferredWriter>,
    quality: u8,
}

impl ThumbnailPyramid {
    pub fn new(
        pool: Arc<ConnectionPool>,
        index: Arc<ReferenceIndex>,
        writer: Arc<DeferredWriter>,
        quality: u8,
    ) -> Self {
        Self {
            pool,
            index,
            writer,
            quality,
        }
    }

    /// Pixels for `id` fitted inside `requested`×`requested`.
    ///
    /// Returns `Ok(None)` when `cancel` was raised before decoding or before
    /// returning.
    pub fn fetch(&self, id: i64, requested: u32, cancel: &AtomicBool) -> Result<Option<DynamicImage>> {
        if is_cancelled(cancel) {
            return Ok(None);
        }

        let (width, height) = self.source_dimensions(id)?;
        let source = match ladder_size_for(requested.max(1), width.min(height)) {
            Some(size) => decode(&self.rendition(id, size, width.min(height))?)?,
            None => {
                tracing::debug!(id, requested, "Serving from original");
                decode(&self.original(id)?)?
            }
        };

        let fitted = source.resize(requested.max(1), requested.max(1), FilterType::Triangle);
        if is_cancelled(cancel) {
            return Ok(None);
        }
        Ok(Some(fitted))
    }

    fn source_dimensions(&self, id: i64) -> Result<(u32, u32)> {
        let image = self.index.get(id).ok_or(StoreError::NotFound(id))?;
        match (image.width, image.height) {
            (Some(w), Some(h)) => Ok((w, h)),
            _ => read_dimensions(&self.original(id)?),
        }
    }

    fn original(&self, id: i64) -> Result<Vec<u8>> {
        let conn = self.pool.acquire();
        images::image_data(conn.get()?, id)
    }

    /// Encoded rendition at a ladder size, generating and persisting it if absent.
    fn rendition(&self, id: i64, size: u32, shorter_side: u32) -> Result<Vec<u8>> {
        let cached = {
            let conn = self.pool.acquire();
            images::load_thumbnail(conn.get()?, id, size)?
        };
        if let Some(data) = cached {
            return Ok(data);
        }

        let larger = LADDER
            .iter()
            .copied()
            .find(|&s| s > size && shorter_side >= s * 2);
        let source = match larger {
            Some(s) => decode(&self.rendition(id, s, shorter_side)?)?,
            None => decode(&self.original(id)?)?,
        };

        let (w, h) = cover_dimensions(source.width(), source.height(), size);
        let scaled = source.resize_exact(w, h, FilterType::Triangle);
        let data = encode_jpeg(&scaled, self.quality)?;
        tracing::debug!(id, size, bytes = data.len(), "Generated rendition");

        self.writer.submit(WriteCommand::StoreThumbnail {
            id,
            size,
            data: data.clone(),
        })?;
        Ok(data)
    }
}
