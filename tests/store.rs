use std::collections::BTreeMap;
use std::sync::atomic::AtomicBool;
use std::sync::{mpsc, Arc};
use std::thread;

use image::{DynamicImage, Rgb, RgbImage};
use rusqlite::Connection;
use tempfile::{tempdir, TempDir};
use thumper::db::{images, thumb_table};
use thumper::media::metadata::encode_png;
use thumper::{ExportFlags, ImageStore, ListingFormat, StoreConfig, StoreError, TaskUpdate};

fn open_store() -> (TempDir, ImageStore) {
    let dir = tempdir().unwrap();
    let store = ImageStore::open(StoreConfig::new(dir.path().join("catalogue.imgdb"))).unwrap();
    (dir, store)
}

fn gradient(width: u32, height: u32, seed: u32) -> Vec<u8> {
    let img = RgbImage::from_fn(width, height, |x, y| {
        Rgb([
            ((x * 255) / width.max(1)) as u8,
            ((y * 255) / height.max(1)) as u8,
            (((x * 255) / width.max(1) + seed * 40) % 256) as u8,
        ])
    });
    encode_png(&DynamicImage::ImageRgb8(img)).unwrap()
}

fn count(store: &ImageStore, table: &str) -> i64 {
    let conn = Connection::open(store.db_path()).unwrap();
    conn.query_row(&format!("SELECT COUNT(*) FROM {}", table), [], |r| r.get(0))
        .unwrap()
}

#[test]
fn test_ingest_is_idempotent() {
    let (_dir, store) = open_store();
    let data = gradient(64, 48, 1);

    let first = store.ingest(&data, Some("http://example.com/a.png")).unwrap();
    let second = store.ingest(&data, None).unwrap();
    assert_eq!(first, second);

    store.sync().unwrap();
    assert_eq!(count(&store, "image"), 1);
    assert_eq!(count(&store, "blob"), 1);
    assert_eq!(store.image_data(first).unwrap(), data);

    let image = store.get(first).unwrap();
    assert_eq!((image.width, image.height), (Some(64), Some(48)));
    assert_eq!(image.format.as_deref(), Some("png"));
    assert_eq!(store.find_hash(&image.hash).map(|i| i.id), Some(first));
}

#[test]
fn test_add_then_remove_tag_restores_tags() {
    let (_dir, store) = open_store();
    let a = store.ingest(&gradient(32, 32, 1), None).unwrap();
    let b = store.ingest(&gradient(32, 32, 2), None).unwrap();
    store.add_tag(&[a], "existing").unwrap();
    store.sync().unwrap();
    let before = store.tags_by_id(a);

    assert_eq!(store.add_tag(&[a, b], "new").unwrap(), vec![a, b]);
    assert!(store.add_tag(&[a, b], "new").unwrap().is_empty());
    assert_eq!(store.remove_tag(&[a, b], "new").unwrap(), vec![a, b]);
    assert!(store.remove_tag(&[a, b], "new").unwrap().is_empty());
    store.sync().unwrap();

    assert_eq!(store.tags_by_id(a), before);
    let conn = Connection::open(store.db_path()).unwrap();
    assert_eq!(images::tags_for(&conn, a).unwrap(), before);
    assert!(images::tags_for(&conn, b).unwrap().is_empty());
}

#[test]
fn test_optimistic_reads_before_commit() {
    let (_dir, store) = open_store();
    let id = store.ingest(&gradient(16, 16, 0), None).unwrap();
    store.add_tag(&[id], "fresh").unwrap();
    // Visible through the index before any sync.
    assert_eq!(store.search(&["fresh".to_string()]).len(), 1);
    store.set_deleted(&[id], true).unwrap();
    assert!(store.list_all(false).is_empty());
    assert_eq!(store.list_all(true).len(), 1);
}

#[test]
fn test_purge_removes_rows_together() {
    let (_dir, store) = open_store();
    let keep = store.ingest(&gradient(32, 32, 1), None).unwrap();
    let gone = store.ingest(&gradient(32, 32, 2), None).unwrap();
    store.add_tag(&[keep, gone], "t").unwrap();
    store.set_deleted(&[gone], true).unwrap();

    assert_eq!(store.purge_deleted().unwrap(), vec![gone]);
    assert!(store.get(gone).is_none());
    assert!(matches!(store.image_data(gone), Err(StoreError::NotFound(_))));
    assert_eq!(count(&store, "image"), 1);
    assert_eq!(count(&store, "blob"), 1);
    assert_eq!(count(&store, "tag"), 1);
    assert!(store.purge_deleted().unwrap().is_empty());
}

fn execute(store: &ImageStore, sql: &str) {
    Connection::open(store.db_path()).unwrap().execute_batch(sql).unwrap();
}

#[test]
fn test_failed_purge_keeps_everything() {
    let (_dir, store) = open_store();
    let id = store.ingest(&gradient(32, 32, 1), None).unwrap();
    store.add_tag(&[id], "t").unwrap();
    store.set_deleted(&[id], true).unwrap();
    store.sync().unwrap();

    execute(
        &store,
        "CREATE TRIGGER keep_blobs BEFORE DELETE ON blob BEGIN SELECT RAISE(ABORT, 'blobs are kept'); END;",
    );
    assert!(store.purge_deleted().is_err());

    assert_eq!(count(&store, "image"), 1);
    assert_eq!(count(&store, "blob"), 1);
    assert_eq!(count(&store, "tag"), 1);
    assert!(store.get(id).unwrap().deleted);
    store.sync().unwrap();

    execute(&store, "DROP TRIGGER keep_blobs;");
    assert_eq!(store.purge_deleted().unwrap(), vec![id]);
    assert_eq!(count(&store, "image"), 0);
}

#[test]
fn test_failed_write_reported_to_its_thread_only() {
    let (_dir, store) = open_store();
    let id = store.ingest(&gradient(32, 32, 1), None).unwrap();
    execute(
        &store,
        "CREATE TRIGGER reserved BEFORE INSERT ON tag WHEN NEW.tag = 'red' \
         BEGIN SELECT RAISE(ABORT, 'reserved tag'); END;",
    );

    let (submitted_tx, submitted_rx) = mpsc::channel();
    let (checked_tx, checked_rx) = mpsc::channel::<()>();
    let store = &store;
    thread::scope(|s| {
        let tagger = s.spawn(move || {
            assert_eq!(store.add_tag(&[id], "red").unwrap(), vec![id]);
            submitted_tx.send(()).unwrap();
            checked_rx.recv().unwrap();
            store.sync()
        });

        submitted_rx.recv().unwrap();
        // Runs after the failed write; the failure belongs to the tagger.
        store.sync().unwrap();
        checked_tx.send(()).unwrap();
        assert!(matches!(tagger.join().unwrap(), Err(StoreError::Transaction(_))));
    });

    assert!(store.tags_by_id(id).is_empty());
    store.sync().unwrap();
}

#[test]
fn test_changes_made_during_rebuild_are_kept() {
    let (_dir, store) = open_store();
    let ids: Vec<i64> = (0..40u32)
        .map(|n| store.ingest(&gradient(64 + n, 64, n), None).unwrap())
        .collect();

    let (tx, rx) = mpsc::channel();
    let store = &store;
    thread::scope(|s| {
        let rebuild = s.spawn(move || store.rebuild_metadata(Some(tx), Arc::new(AtomicBool::new(false))));

        while !matches!(rx.recv().unwrap(), TaskUpdate::Started { .. }) {}
        store.add_tag(&[ids[0]], "late").unwrap();
        store.set_deleted(&[ids[1]], true).unwrap();

        assert_eq!(rebuild.join().unwrap().unwrap(), ids.len());
    });
    store.sync().unwrap();

    let conn = Connection::open(store.db_path()).unwrap();
    for &id in &ids {
        assert_eq!(images::tags_for(&conn, id).unwrap(), store.tags_by_id(id));
        let row = images::load_image(&conn, id).unwrap().unwrap();
        assert_eq!(row.deleted, store.get(id).unwrap().deleted);
    }
    assert_eq!(store.tags_by_id(ids[0]), vec!["late".to_string()]);
    assert!(store.get(ids[1]).unwrap().deleted);
}

#[test]
fn test_fetch_pixels_bounded_and_repeatable() {
    let (_dir, store) = open_store();
    let id = store.ingest(&gradient(640, 400, 3), None).unwrap();
    let never = AtomicBool::new(false);

    for requested in [30, 100, 150, 500] {
        let pixels = store.fetch_pixels(id, requested, &never).unwrap().unwrap();
        assert!(pixels.width().max(pixels.height()) <= requested);
        assert!(pixels.width().max(pixels.height()) >= requested - 1);
    }
    store.sync().unwrap();

    // 100 px is served from the 160 rendition, which now exists.
    let conn = Connection::open(store.db_path()).unwrap();
    assert!(images::load_thumbnail(&conn, id, 160).unwrap().is_some());
    let rows: i64 = conn
        .query_row(&format!("SELECT COUNT(*) FROM {}", thumb_table(1280)), [], |r| r.get(0))
        .unwrap();
    assert_eq!(rows, 0);

    let first = store.fetch_pixels(id, 100, &never).unwrap().unwrap();
    let second = store.fetch_pixels(id, 100, &never).unwrap().unwrap();
    assert_eq!(first.as_bytes(), second.as_bytes());
}

#[test]
fn test_cancelled_fetch_returns_nothing() {
    let (_dir, store) = open_store();
    let id = store.ingest(&gradient(64, 64, 1), None).unwrap();
    let cancelled = AtomicBool::new(true);
    assert!(store.fetch_pixels(id, 40, &cancelled).unwrap().is_none());
    assert!(matches!(
        store.fetch_pixels(9999, 40, &AtomicBool::new(false)),
        Err(StoreError::NotFound(9999))
    ));
}

#[test]
fn test_concurrent_tagging_loses_nothing() {
    const THREADS: usize = 8;
    const TAGS: usize = 10;
    const PER_THREAD: usize = 3;

    let (_dir, store) = open_store();
    let store = Arc::new(store);
    let ids: Vec<i64> = (0..THREADS * PER_THREAD)
        .map(|n| store.ingest(&gradient(16, 16, n as u32), None).unwrap())
        .collect();

    let handles: Vec<_> = ids
        .chunks(PER_THREAD)
        .map(|chunk| {
            let store = Arc::clone(&store);
            let chunk = chunk.to_vec();
            thread::spawn(move || {
                for t in 0..TAGS {
                    store.add_tag(&chunk, &format!("tag{}", t)).unwrap();
                }
            })
        })
        .collect();
    for handle in handles {
        handle.join().unwrap();
    }
    store.sync().unwrap();

    let expected: Vec<(String, usize)> = {
        let mut tags: Vec<String> = (0..TAGS).map(|t| format!("tag{}", t)).collect();
        tags.sort();
        tags.into_iter().map(|t| (t, THREADS * PER_THREAD)).collect()
    };
    assert_eq!(store.tag_frequency(None), expected);

    let conn = Connection::open(store.db_path()).unwrap();
    let mut stmt = conn.prepare("SELECT tag, COUNT(*) FROM tag GROUP BY tag").unwrap();
    let durable: BTreeMap<String, i64> = stmt
        .query_map([], |r| Ok((r.get(0)?, r.get(1)?)))
        .unwrap()
        .map(|r| r.unwrap())
        .collect();
    assert_eq!(durable.len(), TAGS);
    assert!(durable.values().all(|&n| n == (THREADS * PER_THREAD) as i64));
}

#[test]
fn test_duplicates_of_reencoded_and_scaled_copies() {
    let (_dir, store) = open_store();
    let original = store.ingest(&gradient(256, 256, 0), None).unwrap();
    let scaled = store.ingest(&gradient(512, 512, 0), None).unwrap();

    let clusters = store.find_duplicates(None, 8);
    assert!(clusters.iter().any(|c| c.contains(&original) && c.contains(&scaled)));
    assert!(store.find_duplicates(Some(&[original]), 8).is_empty());
}

#[test]
fn test_export_and_listing() {
    let (dir, store) = open_store();
    let a = store.ingest(&gradient(200, 100, 1), None).unwrap();
    let b = store.ingest(&gradient(100, 100, 2), None).unwrap();
    store.add_tag(&[a], "wide").unwrap();

    let out = dir.path().join("out");
    let written = store
        .export_to_disk(&[a, b, 424242], &out, 64, ExportFlags { pad_to_fit: true })
        .unwrap();
    assert_eq!(written, 2);
    let exported = image::open(out.join(format!("{}.png", a))).unwrap();
    assert_eq!((exported.width(), exported.height()), (64, 64));

    let listing = dir.path().join("catalogue.csv");
    assert_eq!(store.export_listing(&listing, ListingFormat::Csv, false).unwrap(), 2);
    let text = std::fs::read_to_string(&listing).unwrap();
    assert!(text.lines().count() == 3 && text.contains("wide"));
}

#[test]
fn test_rebuild_metadata_clears_pyramid() {
    let (_dir, store) = open_store();
    let id = store.ingest(&gradient(400, 400, 4), None).unwrap();
    store.fetch_pixels(id, 40, &AtomicBool::new(false)).unwrap();
    store.sync().unwrap();
    assert!(count(&store, "thumb40") > 0);

    let (tx, rx) = std::sync::mpsc::channel();
    let updated = store
        .rebuild_metadata(Some(tx), Arc::new(AtomicBool::new(false)))
        .unwrap();
    assert_eq!(updated, 1);
    assert_eq!(count(&store, "thumb40"), 0);
    let updates: Vec<_> = rx.try_iter().collect();
    assert!(matches!(updates.first(), Some(TaskUpdate::Started { total: 1 })));
    assert!(matches!(updates.last(), Some(TaskUpdate::Completed { .. })));
    assert_eq!(store.meta_get("metadata_stale").unwrap().as_deref(), Some("0"));
}
