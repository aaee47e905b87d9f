//! Persistence and media-indexing core for an image catalogue.
//!
//! [`ImageStore`] is the entry point: a content-addressable SQLite store with
//! a tag index, a single background writer, perceptual-hash duplicate
//! detection and a cached thumbnail pyramid.

pub mod config;
pub mod db;
pub mod duplicates;
pub mod error;
pub mod export;
pub mod index;
pub mod logging;
pub mod media;
pub mod store;
pub mod tasks;
pub mod thumbnails;
pub mod writer;

pub use error::{Result, StoreError};
pub use export::{ExportFlags, ListingFormat};
pub use index::ImageRef;
pub use media::ImageMetadata;
pub use store::{ImageStore, StoreConfig};
pub use tasks::{TaskProgress, TaskUpdate};
