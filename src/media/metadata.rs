use std::io::Cursor;

use image::codecs::jpeg::JpegEncoder;
use image::{DynamicImage, ImageFormat, ImageReader};

use super::hashing::perceptual_hash;
use crate::error::{Result, StoreError};

/// Decoded facts about one encoded image, as persisted on its row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageMetadata {
    pub format: String,
    pub width: u32,
    pub height: u32,
    pub byte_size: u64,
    pub pixel_format: String,
    pub perceptual_hash: u64,
}

/// Run the full metadata pipeline over raw encoded bytes.
pub fn extract_metadata(data: &[u8]) -> Result<ImageMetadata> {
    let format = guess_format(data)?;
    let image = decode(data)?;

    Ok(ImageMetadata {
        format: format_name(format),
        width: image.width(),
        height: image.height(),
        byte_size: data.len() as u64,
        pixel_format: format!("{:?}", image.color()),
        perceptual_hash: perceptual_hash(&image),
    })
}

pub fn guess_format(data: &[u8]) -> Result<ImageFormat> {
    image::guess_format(data).map_err(|e| StoreError::Decode(e.to_string()))
}

/// Lowercase format name stored in the catalogue (`jpeg`, `png`, `webp`, ...).
pub fn format_name(format: ImageFormat) -> String {
    format!("{:?}", format).to_lowercase()
}

/// Pixel dimensions read from the header alone.
pub fn read_dimensions(data: &[u8]) -> Result<(u32, u32)> {
    ImageReader::new(Cursor::new(data))
        .with_guessed_format()?
        .into_dimensions()
        .map_err(|e| StoreError::Decode(e.to_string()))
}

pub fn decode(data: &[u8]) -> Result<DynamicImage> {
    image::load_from_memory(data).map_err(|e| StoreError::Decode(e.to_string()))
}

/// Encode as baseline JPEG. Alpha is dropped.
pub fn encode_jpeg(image: &DynamicImage, quality: u8) -> Result<Vec<u8>> {
    let rgb = image.to_rgb8();
    let mut buf = Vec::new();
    JpegEncoder::new_with_quality(&mut buf, quality)
        .encode_image(&rgb)
        .map_err(|e| StoreError::Encode(e.to_string()))?;
    Ok(buf)
}

pub fn encode_png(image: &DynamicImage) -> Result<Vec<u8>> {
    let mut buf = Vec::new();
    image
        .write_to(&mut Cursor::new(&mut buf), ImageFormat::Png)
        .map_err(|e| StoreError::Encode(e.to_string()))?;
    Ok(buf)
}
