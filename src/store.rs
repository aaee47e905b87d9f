//! Public entry point composing the pool, index, writer and pyramid.
//!
//! Reads go to the reference index or to pooled connections. Mutations are
//! applied to the index first and then queued on the writer; operations
//! whose result depends on the database (ingest, purge, rebuild) wait for
//! the writer's reply.

use std::path::{Path, PathBuf};
use std::sync::atomic::AtomicBool;
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::Arc;

use image::DynamicImage;
use rayon::prelude::*;

use crate::db::{images, ConnectionPool, Migrator};
use crate::duplicates::find_clusters;
use crate::error::{Result, StoreError};
use crate::export::{self, ExportFlags, ListingFormat};
use crate::index::{ImageRef, ReferenceIndex};
use crate::media::metadata::{decode, encode_jpeg};
use crate::media::{content_hash, extract_metadata};
use crate::tasks::TaskUpdate;
use crate::thumbnails::ThumbnailPyramid;
use crate::writer::{DeferredWriter, WriteCommand, METADATA_STALE_KEY};

#[derive(Debug, Clone)]
pub struct StoreConfig {
    pub db_path: PathBuf,
    /// JPEG quality for pyramid renditions and bulk re-encode.
    pub thumbnail_quality: u8,
    pub writer_queue_capacity: usize,
}

impl StoreConfig {
    pub fn new(db_path: impl Into<PathBuf>) -> Self {
        Self {
            db_path: db_path.into(),
            thumbnail_quality: 92,
            writer_queue_capacity: 1024,
        }
    }
}

pub struct ImageStore {
    config: StoreConfig,
    pool: Arc<ConnectionPool>,
    index: Arc<ReferenceIndex>,
    writer: Arc<DeferredWriter>,
    pyramid: ThumbnailPyramid,
}

impl ImageStore {
    /// Open (creating if needed) the catalogue at `config.db_path`.
    ///
    /// Runs pending schema upgrades before anything else touches the file; a
    /// failed upgrade or a database from a newer build is returned as
    /// [`StoreError::Schema`].
    pub fn open(config: StoreConfig) -> Result<Self> {
        let pool = ConnectionPool::new(config.db_path.clone());

        let index = {
            let mut handle = pool.acquire();
            let version = {
                let _lock = pool.write_lock();
                Migrator::default().run(handle.get_mut()?)?
            };
            let conn = handle.get()?;
            if images::meta_get(conn, METADATA_STALE_KEY)?.as_deref() == Some("1") {
                tracing::warn!("Stored image metadata is out of date; run a metadata rebuild");
            }
            let index = ReferenceIndex::load(conn)?;
            tracing::info!(
                path = %config.db_path.display(),
                version,
                images = index.len(),
                "Opened image store"
            );
            Arc::new(index)
        };

        let writer = Arc::new(DeferredWriter::spawn(
            Arc::clone(&pool),
            Arc::clone(&index),
            config.writer_queue_capacity,
        )?);
        let pyramid = ThumbnailPyramid::new(
            Arc::clone(&pool),
            Arc::clone(&index),
            Arc::clone(&writer),
            config.thumbnail_quality,
        );

        Ok(Self {
            config,
            pool,
            index,
            writer,
            pyramid,
        })
    }

    pub fn db_path(&self) -> &Path {
        &self.config.db_path
    }

    /// Store `data`, returning its id. Bytes already in the catalogue return
    /// the existing id without writing anything.
    ///
    /// Bytes that cannot be decoded are still stored, with empty decoded
    /// columns; pixel fetches for them fail with [`StoreError::Decode`].
    pub fn ingest(&self, data: &[u8], url: Option<&str>) -> Result<i64> {
        let hash = content_hash(data);
        if let Some(existing) = self.index.find_hash(&hash) {
            tracing::debug!(id = existing.id, "Content already stored");
            return Ok(existing.id);
        }

        let metadata = match extract_metadata(data) {
            Ok(metadata) => Some(metadata),
            Err(StoreError::Decode(reason)) => {
                tracing::warn!(url = ?url, %reason, "Storing image without decoded metadata");
                None
            }
            Err(e) => return Err(e),
        };
        let (id, created) = self.writer.request(|reply| WriteCommand::InsertImage {
            hash,
            url: url.map(str::to_string),
            metadata,
            data: data.to_vec(),
            reply,
        })?;
        if created {
            tracing::info!(id, url = ?url, "Ingested image");
        }
        Ok(id)
    }

    /// Ingest on the worker pool; the receiver yields `(url, result)` once done.
    pub fn submit_image(self: &Arc<Self>, url: String, data: Vec<u8>) -> Receiver<(String, Result<i64>)> {
        let (tx, rx) = mpsc::channel();
        let store = Arc::clone(self);
        rayon::spawn(move || {
            let result = store.ingest(&data, Some(&url));
            if let Err(e) = &result {
                tracing::warn!(url = %url, error = %e, "Couldn't ingest downloaded image");
            }
            let _ = tx.send((url, result));
        });
        rx
    }

    /// Tag each id; returns the ids that did not already carry the tag.
    pub fn add_tag(&self, ids: &[i64], tag: &str) -> Result<Vec<i64>> {
        let tag = tag.trim();
        if tag.is_empty() {
            return Ok(Vec::new());
        }
        let changed = self.index.add_tag(ids, tag);
        if !changed.is_empty() {
            self.writer.submit(WriteCommand::AddTag {
                ids: changed.clone(),
                tag: tag.to_string(),
            })?;
        }
        Ok(changed)
    }

    pub fn remove_tag(&self, ids: &[i64], tag: &str) -> Result<Vec<i64>> {
        let tag = tag.trim();
        let changed = self.index.remove_tag(ids, tag);
        if !changed.is_empty() {
            self.writer.submit(WriteCommand::RemoveTag {
                ids: changed.clone(),
                tag: tag.to_string(),
            })?;
        }
        Ok(changed)
    }

    /// Soft-delete (or restore) images; returns the ids whose flag changed.
    pub fn set_deleted(&self, ids: &[i64], deleted: bool) -> Result<Vec<i64>> {
        let changed = self.index.set_deleted(ids, deleted);
        if !changed.is_empty() {
            self.writer.submit(WriteCommand::SetDeleted {
                ids: changed.clone(),
                deleted,
            })?;
        }
        Ok(changed)
    }

    /// Irreversibly remove every soft-deleted image with its blob, tags and renditions.
    pub fn purge_deleted(&self) -> Result<Vec<i64>> {
        let purged = self.writer.request(|reply| WriteCommand::PurgeDeleted { reply })?;
        tracing::info!(count = purged.len(), "Purged deleted images");
        Ok(purged)
    }

    /// Near-duplicate groups among `ids`, or among all live images when `None`.
    pub fn find_duplicates(&self, ids: Option<&[i64]>, max_distance: u32) -> Vec<Vec<i64>> {
        let entries = match ids {
            Some(ids) => self.index.perceptual_hashes(ids),
            None => {
                let live: Vec<i64> = self.index.snapshot(false).iter().map(|i| i.id).collect();
                self.index.perceptual_hashes(&live)
            }
        };
        find_clusters(&entries, max_distance)
    }

    /// Pixels fitted inside `size`×`size`; `Ok(None)` if cancelled.
    pub fn fetch_pixels(&self, id: i64, size: u32, cancel: &AtomicBool) -> Result<Option<DynamicImage>> {
        self.pyramid.fetch(id, size, cancel)
    }

    /// The stored encoded bytes.
    pub fn image_data(&self, id: i64) -> Result<Vec<u8>> {
        let conn = self.pool.acquire();
        images::image_data(conn.get()?, id)
    }

    pub fn get(&self, id: i64) -> Option<ImageRef> {
        self.index.get(id)
    }

    pub fn len(&self) -> usize {
        self.index.len()
    }

    pub fn is_empty(&self) -> bool {
        self.index.is_empty()
    }

    /// Every image, newest first.
    pub fn list_all(&self, include_deleted: bool) -> Vec<ImageRef> {
        self.index.snapshot(include_deleted)
    }

    /// Live images carrying all of `tags`.
    pub fn search(&self, tags: &[String]) -> Vec<ImageRef> {
        self.index.search(tags)
    }

    pub fn tag_frequency(&self, ids: Option<&[i64]>) -> Vec<(String, usize)> {
        self.index.tag_counts(ids)
    }

    pub fn find_hash(&self, hash: &str) -> Option<ImageRef> {
        self.index.find_hash(hash)
    }

    pub fn hash_by_id(&self, id: i64) -> Option<String> {
        self.index.get(id).map(|image| image.hash)
    }

    pub fn tags_by_id(&self, id: i64) -> Vec<String> {
        self.index
            .get(id)
            .map(|image| image.tags.into_iter().collect())
            .unwrap_or_default()
    }

    /// Convert non-JPEG images to JPEG in place; returns how many were converted.
    ///
    /// Content hashes are kept, so re-ingesting an original stays a no-op.
    pub fn reencode_to_jpeg(&self, ids: &[i64]) -> Result<usize> {
        let candidates: Vec<i64> = ids
            .iter()
            .filter_map(|&id| self.index.get(id))
            .filter(|image| image.format.as_deref() != Some("jpeg"))
            .map(|image| image.id)
            .collect();

        let quality = self.config.thumbnail_quality;
        let converted: Vec<i64> = candidates
            .par_iter()
            .filter_map(|&id| match self.reencode_one(id, quality) {
                Ok(()) => Some(id),
                Err(e) if e.is_per_row() => {
                    tracing::warn!(id, error = %e, "Skipping image during re-encode");
                    None
                }
                Err(e) => {
                    tracing::error!(id, error = %e, "Re-encode failed");
                    None
                }
            })
            .collect();

        tracing::info!(count = converted.len(), "Re-encoded images to JPEG");
        Ok(converted.len())
    }

    fn reencode_one(&self, id: i64, quality: u8) -> Result<()> {
        let original = self.image_data(id)?;
        let jpeg = encode_jpeg(&decode(&original)?, quality)?;
        let metadata = extract_metadata(&jpeg)?;
        self.writer.request(|reply| WriteCommand::ReplaceImageData {
            id,
            data: jpeg,
            metadata,
            reply,
        })
    }

    /// Render each image at `size` into `<dir>/<id>.png`; returns the count written.
    pub fn export_to_disk(&self, ids: &[i64], dir: &Path, size: u32, flags: ExportFlags) -> Result<usize> {
        std::fs::create_dir_all(dir)?;
        let never = AtomicBool::new(false);

        let written = ids
            .par_iter()
            .filter(|&&id| {
                let result = self
                    .fetch_pixels(id, size, &never)
                    .and_then(|pixels| pixels.ok_or(StoreError::NotFound(id)))
                    .and_then(|pixels| export::write_rendition(&pixels, dir, id, size, flags));
                match result {
                    Ok(path) => {
                        tracing::debug!(id, path = %path.display(), "Exported image");
                        true
                    }
                    Err(e) => {
                        tracing::warn!(id, error = %e, "Skipping image during export");
                        false
                    }
                }
            })
            .count();

        Ok(written)
    }

    /// Write a JSON or CSV listing of the catalogue.
    pub fn export_listing(&self, path: &Path, format: ListingFormat, include_deleted: bool) -> Result<usize> {
        let mut images = self.index.snapshot(include_deleted);
        images.reverse();
        export::write_listing(&images, path, format)
    }

    /// Recompute stored metadata from every blob and drop all renditions.
    pub fn rebuild_metadata(
        &self,
        progress: Option<Sender<TaskUpdate>>,
        cancel: Arc<AtomicBool>,
    ) -> Result<usize> {
        self.writer.request(|reply| WriteCommand::RebuildMetadata {
            progress,
            cancel,
            reply,
        })
    }

    pub fn meta_get(&self, key: &str) -> Result<Option<String>> {
        let conn = self.pool.acquire();
        images::meta_get(conn.get()?, key)
    }

    pub fn meta_put(&self, key: &str, value: &str) -> Result<()> {
        self.writer.submit(WriteCommand::MetaPut {
            key: key.to_string(),
            value: value.to_string(),
        })
    }

    /// Wait for every queued write to commit.
    pub fn sync(&self) -> Result<()> {
        self.writer.sync()
    }

    /// Drain the write queue and stop the writer thread.
    pub fn shutdown(&self) {
        self.writer.shutdown();
        tracing::info!("Image store closed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{Rgb, RgbImage};
    use tempfile::tempdir;

    fn png(seed: u32) -> Vec<u8> {
        let img = RgbImage::from_fn(96, 64, |x, y| Rgb([(x * 2 + seed) as u8, (y * 3) as u8, seed as u8]));
        crate::media::metadata::encode_png(&DynamicImage::ImageRgb8(img)).unwrap()
    }

    #[test]
    fn test_reopen_sees_committed_state() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("store.imgdb");

        let id = {
            let store = ImageStore::open(StoreConfig::new(&path)).unwrap();
            let id = store.ingest(&png(1), Some("http://example.com/1.png")).unwrap();
            store.add_tag(&[id], "kept").unwrap();
            store.meta_put("last_import", "today").unwrap();
            store.shutdown();
            id
        };

        let store = ImageStore::open(StoreConfig::new(&path)).unwrap();
        assert_eq!(store.tags_by_id(id), vec!["kept".to_string()]);
        assert_eq!(store.get(id).unwrap().url.as_deref(), Some("http://example.com/1.png"));
        assert_eq!(store.meta_get("last_import").unwrap().as_deref(), Some("today"));
    }

    #[test]
    fn test_undecodable_bytes_are_stored_without_metadata() {
        let dir = tempdir().unwrap();
        let store = ImageStore::open(StoreConfig::new(dir.path().join("s.imgdb"))).unwrap();
        let id = store.ingest(b"nope", None).unwrap();
        assert_eq!(store.ingest(b"nope", None).unwrap(), id);

        let image = store.get(id).unwrap();
        assert_eq!((image.width, image.format, image.perceptual_hash), (None, None, None));
        assert_eq!(store.image_data(id).unwrap(), b"nope".to_vec());
        assert!(matches!(
            store.fetch_pixels(id, 40, &AtomicBool::new(false)),
            Err(StoreError::Decode(_))
        ));
        assert!(store.find_duplicates(None, 64).is_empty());
        assert_eq!(store.reencode_to_jpeg(&[id]).unwrap(), 0);
    }

    #[test]
    fn test_reencode_keeps_hash_and_switches_format() {
        let dir = tempdir().unwrap();
        let store = ImageStore::open(StoreConfig::new(dir.path().join("s.imgdb"))).unwrap();
        let data = png(3);
        let id = store.ingest(&data, None).unwrap();
        let hash = store.hash_by_id(id).unwrap();

        assert_eq!(store.reencode_to_jpeg(&[id]).unwrap(), 1);
        let image = store.get(id).unwrap();
        assert_eq!(image.format.as_deref(), Some("jpeg"));
        assert_eq!(image.hash, hash);
        assert_eq!(store.ingest(&data, None).unwrap(), id);
        assert_eq!(store.reencode_to_jpeg(&[id]).unwrap(), 0);
    }

    #[test]
    fn test_submit_image_yields_url_and_id() {
        let dir = tempdir().unwrap();
        let store = Arc::new(ImageStore::open(StoreConfig::new(dir.path().join("s.imgdb"))).unwrap());
        let rx = store.submit_image("http://example.com/x.png".into(), png(5));
        let (url, result) = rx.recv().unwrap();
        assert_eq!(url, "http://example.com/x.png");
        let id = result.unwrap();
        let again = store.submit_image("http://mirror/x.png".into(), png(5));
        assert_eq!(again.recv().unwrap().1.unwrap(), id);
    }
}
