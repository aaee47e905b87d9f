//! Writing images and catalogue listings out of the store.

use std::fs::File;
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use image::{imageops, DynamicImage, ImageFormat, RgbaImage};
use serde::Serialize;

use crate::error::{Result, StoreError};
use crate::index::ImageRef;

/// Options for [`crate::ImageStore::export_to_disk`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ExportFlags {
    /// Center each rendition on a transparent `size`×`size` canvas.
    pub pad_to_fit: bool,
}

/// Listing format options
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ListingFormat {
    Json,
    Csv,
}

impl ListingFormat {
    /// Pick a format from a file extension.
    pub fn from_path(path: &Path) -> Option<Self> {
        match path.extension()?.to_str()?.to_ascii_lowercase().as_str() {
            "json" => Some(ListingFormat::Json),
            "csv" => Some(ListingFormat::Csv),
            _ => None,
        }
    }
}

/// One catalogue entry as written to a listing.
#[derive(Debug, Serialize)]
pub struct ListedImage {
    pub id: i64,
    pub hash: String,
    pub date: String,
    pub width: Option<u32>,
    pub height: Option<u32>,
    pub format: Option<String>,
    pub byte_size: Option<u64>,
    pub perceptual_hash: Option<String>,
    pub url: Option<String>,
    pub tags: Vec<String>,
    pub deleted: bool,
}

impl From<&ImageRef> for ListedImage {
    fn from(image: &ImageRef) -> Self {
        let date = chrono::DateTime::from_timestamp(image.date, 0)
            .map(|d| d.to_rfc3339())
            .unwrap_or_default();
        Self {
            id: image.id,
            hash: image.hash.clone(),
            date,
            width: image.width,
            height: image.height,
            format: image.format.clone(),
            byte_size: image.byte_size,
            perceptual_hash: image.perceptual_hash.map(|h| format!("{:016x}", h)),
            url: image.url.clone(),
            tags: image.tags.iter().cloned().collect(),
            deleted: image.deleted,
        }
    }
}

fn io_error(e: impl std::fmt::Display) -> StoreError {
    StoreError::Io(io::Error::other(e.to_string()))
}

/// Write a listing of `images` to `output_path`; returns the number of entries.
pub fn write_listing(images: &[ImageRef], output_path: &Path, format: ListingFormat) -> Result<usize> {
    let listed: Vec<ListedImage> = images.iter().map(ListedImage::from).collect();

    match format {
        ListingFormat::Json => write_json(&listed, output_path)?,
        ListingFormat::Csv => write_csv(&listed, output_path)?,
    }

    Ok(listed.len())
}

fn write_json(images: &[ListedImage], output_path: &Path) -> Result<()> {
    let json = serde_json::to_string_pretty(images).map_err(io_error)?;
    let mut file = File::create(output_path)?;
    file.write_all(json.as_bytes())?;
    Ok(())
}

fn write_csv(images: &[ListedImage], output_path: &Path) -> Result<()> {
    let mut wtr = csv::Writer::from_path(output_path).map_err(io_error)?;

    wtr.write_record([
        "id",
        "hash",
        "date",
        "width",
        "height",
        "format",
        "byte_size",
        "perceptual_hash",
        "url",
        "tags",
        "deleted",
    ])
    .map_err(io_error)?;

    for image in images {
        let opt = |v: Option<String>| v.unwrap_or_default();
        let record: [String; 11] = [
            image.id.to_string(),
            image.hash.clone(),
            image.date.clone(),
            opt(image.width.map(|v| v.to_string())),
            opt(image.height.map(|v| v.to_string())),
            opt(image.format.clone()),
            opt(image.byte_size.map(|v| v.to_string())),
            opt(image.perceptual_hash.clone()),
            opt(image.url.clone()),
            image.tags.join(";"),
            if image.deleted { "1" } else { "0" }.to_string(),
        ];
        wtr.write_record(&record).map_err(io_error)?;
    }

    wtr.flush()?;
    Ok(())
}

/// Center `image` on a transparent square canvas.
pub fn pad_to_square(image: &DynamicImage, size: u32) -> RgbaImage {
    let mut canvas = RgbaImage::new(size, size);
    let x = size.saturating_sub(image.width()) / 2;
    let y = size.saturating_sub(image.height()) / 2;
    imageops::overlay(&mut canvas, &image.to_rgba8(), x as i64, y as i64);
    canvas
}

/// Write one exported rendition as `<dir>/<id>.png`.
pub fn write_rendition(
    image: &DynamicImage,
    dir: &Path,
    id: i64,
    size: u32,
    flags: ExportFlags,
) -> Result<PathBuf> {
    let path = dir.join(format!("{}.png", id));
    let result = if flags.pad_to_fit {
        pad_to_square(image, size).save_with_format(&path, ImageFormat::Png)
    } else {
        image.save_with_format(&path, ImageFormat::Png)
    };
    result.map_err(|e| StoreError::Encode(e.to_string()))?;
    Ok(path)
}
