//! In-memory projection of the image table for hot read paths.
//!
//! Facade mutations update this index first and then queue the durable
//! write, so readers see a change before it lands on disk. Readers get
//! cloned [`ImageRef`] values and never hold the lock past a call.
//!
//! Each optimistic change counts as one in-flight write per id until the
//! writer settles it. A record whose write failed is re-read from the
//! database only once no other write for that id is still queued, so the
//! reload cannot discard changes that have not landed yet.

use std::collections::hash_map::Entry;
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::sync::{PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use rusqlite::Connection;
use serde::Serialize;

use crate::db::images::{self, ImageRow};
use crate::error::Result;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ImageRef {
    pub id: i64,
    pub hash: String,
    pub date: i64,
    pub width: Option<u32>,
    pub height: Option<u32>,
    pub perceptual_hash: Option<u64>,
    pub url: Option<String>,
    pub format: Option<String>,
    pub byte_size: Option<u64>,
    pub pixel_format: Option<String>,
    pub deleted: bool,
    pub tags: BTreeSet<String>,
}

impl ImageRef {
    pub fn from_row(row: ImageRow, tags: impl IntoIterator<Item = String>) -> Self {
        Self {
            id: row.id,
            hash: row.hash,
            date: row.date,
            width: row.width,
            height: row.height,
            perceptual_hash: row.perceptual_hash,
            url: row.url,
            format: row.format,
            byte_size: row.byte_size,
            pixel_format: row.pixel_format,
            deleted: row.deleted,
            tags: tags.into_iter().collect(),
        }
    }

    pub fn has_all_tags(&self, tags: &[String]) -> bool {
        tags.iter().all(|t| self.tags.contains(t))
    }

    /// Take the decoded columns from `row`; tags and the deletion flag stay.
    fn set_metadata(&mut self, row: ImageRow) {
        self.width = row.width;
        self.height = row.height;
        self.perceptual_hash = row.perceptual_hash;
        self.format = row.format;
        self.byte_size = row.byte_size;
        self.pixel_format = row.pixel_format;
    }
}

#[derive(Default)]
struct Records {
    by_id: HashMap<i64, ImageRef>,
    by_hash: HashMap<String, i64>,
    in_flight: HashMap<i64, usize>,
    stale: HashSet<i64>,
}

impl Records {
    fn begin_writes(&mut self, ids: &[i64]) {
        for &id in ids {
            *self.in_flight.entry(id).or_default() += 1;
        }
    }

    fn finish_write(&mut self, id: i64) {
        if let Entry::Occupied(mut count) = self.in_flight.entry(id) {
            *count.get_mut() -= 1;
            if *count.get() == 0 {
                count.remove();
            }
        }
    }

    fn put(&mut self, image: ImageRef) {
        self.by_hash.insert(image.hash.clone(), image.id);
        self.by_id.insert(image.id, image);
    }

    fn drop_id(&mut self, id: i64) -> Option<ImageRef> {
        let removed = self.by_id.remove(&id)?;
        if self.by_hash.get(&removed.hash) == Some(&id) {
            self.by_hash.remove(&removed.hash);
        }
        Some(removed)
    }
}

#[derive(Default)]
pub struct ReferenceIndex {
    records: RwLock<Records>,
}

impl ReferenceIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build the index from every image row and tag association.
    pub fn load(conn: &Connection) -> Result<Self> {
        let index = Self::new();
        index.reload_all(conn)?;
        Ok(index)
    }

    fn reload_all(&self, conn: &Connection) -> Result<()> {
        let rows = images::load_images(conn)?;
        let mut tags = images::load_tags(conn)?;

        let mut fresh = Records::default();
        for row in rows {
            let row_tags = tags.remove(&row.id).unwrap_or_default();
            fresh.put(ImageRef::from_row(row, row_tags));
        }

        let count = fresh.by_id.len();
        *self.write() = fresh;
        tracing::debug!(count, "Loaded reference index");
        Ok(())
    }

    /// Re-read specific ids from the database, dropping ids that no longer exist.
    pub fn reload(&self, conn: &Connection, ids: &[i64]) -> Result<()> {
        let mut fetched = Vec::with_capacity(ids.len());
        for &id in ids {
            let image = match images::load_image(conn, id)? {
                Some(row) => Some(ImageRef::from_row(row, images::tags_for(conn, id)?)),
                None => None,
            };
            fetched.push((id, image));
        }

        let mut records = self.write();
        for (id, image) in fetched {
            match image {
                Some(image) => records.put(image),
                None => {
                    records.drop_id(id);
                }
            }
        }
        Ok(())
    }

    /// Copy the decoded columns of `rows` onto the matching records.
    pub fn apply_metadata(&self, rows: impl IntoIterator<Item = ImageRow>) {
        let mut records = self.write();
        for row in rows {
            if let Some(image) = records.by_id.get_mut(&row.id) {
                image.set_metadata(row);
            }
        }
    }

    /// Mark one queued write as finished for every id in `done`.
    ///
    /// Ids in `stale` belong to writes that did not land. They are re-read
    /// from `conn` as soon as no write for them is in flight; until then
    /// they stay marked and are retried on a later call.
    pub fn settle(&self, conn: &Connection, done: &[i64], stale: &[i64]) -> Result<()> {
        let mut records = self.write();
        for &id in done {
            records.finish_write(id);
        }
        records.stale.extend(stale.iter().copied());

        let ready: Vec<i64> = records
            .stale
            .iter()
            .copied()
            .filter(|id| !records.in_flight.contains_key(id))
            .collect();
        for id in ready {
            match images::load_image(conn, id)? {
                Some(row) => {
                    let tags = images::tags_for(conn, id)?;
                    records.put(ImageRef::from_row(row, tags));
                }
                None => {
                    records.drop_id(id);
                }
            }
            records.stale.remove(&id);
            tracing::debug!(id, "Reloaded index record after failed write");
        }
        Ok(())
    }

    fn read(&self) -> RwLockReadGuard<'_, Records> {
        self.records.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, Records> {
        self.records.write().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn len(&self) -> usize {
        self.read().by_id.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn insert(&self, image: ImageRef) {
        self.write().put(image);
    }

    pub fn remove(&self, ids: &[i64]) {
        let mut records = self.write();
        for &id in ids {
            records.drop_id(id);
        }
    }

    pub fn get(&self, id: i64) -> Option<ImageRef> {
        self.read().by_id.get(&id).cloned()
    }

    pub fn find_hash(&self, hash: &str) -> Option<ImageRef> {
        let records = self.read();
        records
            .by_hash
            .get(hash)
            .and_then(|id| records.by_id.get(id))
            .cloned()
    }

    /// Add `tag` to each id; returns the ids whose tag set changed.
    pub fn add_tag(&self, ids: &[i64], tag: &str) -> Vec<i64> {
        let mut records = self.write();
        let changed: Vec<i64> = ids
            .iter()
            .copied()
            .filter(|id| {
                records
                    .by_id
                    .get_mut(id)
                    .map(|image| image.tags.insert(tag.to_string()))
                    .unwrap_or(false)
            })
            .collect();
        records.begin_writes(&changed);
        changed
    }

    pub fn remove_tag(&self, ids: &[i64], tag: &str) -> Vec<i64> {
        let mut records = self.write();
        let changed: Vec<i64> = ids
            .iter()
            .copied()
            .filter(|id| {
                records
                    .by_id
                    .get_mut(id)
                    .map(|image| image.tags.remove(tag))
                    .unwrap_or(false)
            })
            .collect();
        records.begin_writes(&changed);
        changed
    }

    pub fn set_deleted(&self, ids: &[i64], deleted: bool) -> Vec<i64> {
        let mut records = self.write();
        let changed: Vec<i64> = ids
            .iter()
            .copied()
            .filter(|id| match records.by_id.get_mut(id) {
                Some(image) if image.deleted != deleted => {
                    image.deleted = deleted;
                    true
                }
                _ => false,
            })
            .collect();
        records.begin_writes(&changed);
        changed
    }

    /// All records, newest id first.
    pub fn snapshot(&self, include_deleted: bool) -> Vec<ImageRef> {
        let records = self.read();
        let mut out: Vec<ImageRef> = records
            .by_id
            .values()
            .filter(|image| include_deleted || !image.deleted)
            .cloned()
            .collect();
        out.sort_by(|a, b| b.id.cmp(&a.id));
        out
    }

    /// Live images carrying every tag in `tags` (all images when empty).
    pub fn search(&self, tags: &[String]) -> Vec<ImageRef> {
        let mut out: Vec<ImageRef> = self
            .read()
            .by_id
            .values()
            .filter(|image| !image.deleted && image.has_all_tags(tags))
            .cloned()
            .collect();
        out.sort_by(|a, b| b.id.cmp(&a.id));
        out
    }

    /// Tag histogram over `ids`, or over every live image when `ids` is `None`.
    ///
    /// Sorted by count descending, then tag.
    pub fn tag_counts(&self, ids: Option<&[i64]>) -> Vec<(String, usize)> {
        let records = self.read();
        let mut counts: BTreeMap<String, usize> = BTreeMap::new();

        let mut tally = |image: &ImageRef| {
            for tag in &image.tags {
                *counts.entry(tag.clone()).or_default() += 1;
            }
        };

        match ids {
            Some(ids) => ids.iter().filter_map(|id| records.by_id.get(id)).for_each(&mut tally),
            None => records.by_id.values().filter(|i| !i.deleted).for_each(&mut tally),
        }

        let mut out: Vec<(String, usize)> = counts.into_iter().collect();
        out.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
        out
    }

    /// `(id, perceptual hash)` for the given ids, skipping rows without a hash.
    pub fn perceptual_hashes(&self, ids: &[i64]) -> Vec<(i64, u64)> {
        let records = self.read();
        ids.iter()
            .filter_map(|id| records.by_id.get(id))
            .filter_map(|image| image.perceptual_hash.map(|h| (image.id, h)))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn image(id: i64, tags: &[&str]) -> ImageRef {
        ImageRef {
            id,
            hash: format!("hash{}", id),
            date: 0,
            width: Some(10),
            height: Some(10),
            perceptual_hash: Some(id as u64),
            url: None,
            format: Some("png".into()),
            byte_size: Some(100),
            pixel_format: None,
            deleted: false,
            tags: tags.iter().map(|t| t.to_string()).collect(),
        }
    }

    #[test]
    fn test_tag_changes_report_only_changed_ids() {
        let index = ReferenceIndex::new();
        index.insert(image(1, &["cat"]));
        index.insert(image(2, &[]));

        assert_eq!(index.add_tag(&[1, 2, 3], "cat"), vec![2]);
        assert_eq!(index.remove_tag(&[1, 2], "cat"), vec![1, 2]);
        assert!(index.remove_tag(&[1], "cat").is_empty());
    }

    #[test]
    fn test_search_and_histogram() {
        let index = ReferenceIndex::new();
        index.insert(image(1, &["cat", "cute"]));
        index.insert(image(2, &["cat"]));
        index.insert(image(3, &["dog"]));
        index.set_deleted(&[3], true);

        let hits: Vec<i64> = index
            .search(&["cat".to_string()])
            .iter()
            .map(|i| i.id)
            .collect();
        assert_eq!(hits, vec![2, 1]);

        assert_eq!(
            index.tag_counts(None),
            vec![("cat".to_string(), 2), ("cute".to_string(), 1)]
        );
        assert_eq!(index.tag_counts(Some(&[3])), vec![("dog".to_string(), 1)]);
    }

    #[test]
    fn test_metadata_refresh_keeps_live_tags() {
        let index = ReferenceIndex::new();
        index.insert(image(1, &["kept"]));
        index.add_tag(&[1], "queued");

        let mut row_source = image(1, &[]);
        row_source.width = Some(640);
        row_source.format = Some("jpeg".into());
        index.apply_metadata([ImageRow {
            id: 1,
            hash: row_source.hash,
            date: 0,
            width: row_source.width,
            height: Some(480),
            perceptual_hash: Some(9),
            url: None,
            format: row_source.format,
            byte_size: Some(5),
            pixel_format: Some("Rgb8".into()),
            deleted: false,
        }]);

        let record = index.get(1).unwrap();
        assert_eq!((record.width, record.height), (Some(640), Some(480)));
        assert_eq!(record.format.as_deref(), Some("jpeg"));
        assert!(record.tags.contains("kept") && record.tags.contains("queued"));
    }

    #[test]
    fn test_failed_write_reloads_only_when_nothing_queued() {
        let mut conn = Connection::open_in_memory().unwrap();
        crate::db::Migrator::default().run(&mut conn).unwrap();
        let meta = crate::media::ImageMetadata {
            format: "png".into(),
            width: 10,
            height: 10,
            byte_size: 1,
            pixel_format: "Rgb8".into(),
            perceptual_hash: 1,
        };
        let (id, _) = images::insert_image(&conn, "hash1", None, Some(&meta), b"x").unwrap();

        let index = ReferenceIndex::load(&conn).unwrap();
        assert_eq!(index.add_tag(&[id], "failed"), vec![id]);
        assert_eq!(index.add_tag(&[id], "queued"), vec![id]);

        // First write failed while the second is still queued.
        index.settle(&conn, &[id], &[id]).unwrap();
        assert!(index.get(id).unwrap().tags.contains("queued"));

        images::add_tag(&conn, &[id], "queued").unwrap();
        index.settle(&conn, &[id], &[]).unwrap();
        let tags: Vec<String> = index.get(id).unwrap().tags.into_iter().collect();
        assert_eq!(tags, vec!["queued".to_string()]);
    }

    #[test]
    fn test_snapshot_and_hash_lookup() {
        let index = ReferenceIndex::new();
        index.insert(image(1, &[]));
        index.insert(image(2, &[]));
        assert_eq!(index.set_deleted(&[2], true), vec![2]);
        assert!(index.set_deleted(&[2], true).is_empty());

        assert_eq!(index.snapshot(false).len(), 1);
        assert_eq!(index.snapshot(true).len(), 2);
        assert_eq!(index.find_hash("hash2").map(|i| i.id), Some(2));

        index.remove(&[2]);
        assert!(index.find_hash("hash2").is_none());
        assert_eq!(index.len(), 1);
    }
}
