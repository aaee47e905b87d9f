pub mod dct;
pub mod discovery;
pub mod hashing;
pub mod metadata;

pub use hashing::{content_hash, hamming_distance, perceptual_hash};
pub use metadata::{extract_metadata, ImageMetadata};
