//! Row-level queries over the image, blob, tag, meta and thumbnail tables.
//!
//! Everything here takes a plain `&Connection` so the same functions run on
//! pooled read handles and inside the writer's transactions and savepoints
//! (both deref to `Connection`). Callers own transaction boundaries.

use std::collections::HashMap;

use rusqlite::{params, Connection, OptionalExtension, Row};
use serde::Serialize;

use super::schema::{thumb_table, LADDER};
use crate::error::{Result, StoreError};
use crate::media::ImageMetadata;

/// One row of the `image` table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ImageRow {
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
}

const IMAGE_COLUMNS: &str =
    "id, hash, date, width, height, phash, url, format, filesize, pixelformat, deleted";

fn row_to_image(row: &Row<'_>) -> rusqlite::Result<ImageRow> {
    Ok(ImageRow {
        id: row.get(0)?,
        hash: row.get(1)?,
        date: row.get(2)?,
        width: row.get(3)?,
        height: row.get(4)?,
        // Stored as the signed reinterpretation of the 64 hash bits.
        perceptual_hash: row.get::<_, Option<i64>>(5)?.map(|h| h as u64),
        url: row.get(6)?,
        format: row.get(7)?,
        byte_size: row.get::<_, Option<i64>>(8)?.map(|s| s.max(0) as u64),
        pixel_format: row.get(9)?,
        deleted: row.get::<_, i64>(10)? != 0,
    })
}

/// Insert a new image and its blob, or return the id already holding `hash`.
///
/// `meta` is `None` for bytes that could not be decoded; the decoded columns
/// stay NULL until a metadata rebuild fills them. The boolean is `true` when
/// a row was created.
pub fn insert_image(
    conn: &Connection,
    hash: &str,
    url: Option<&str>,
    meta: Option<&ImageMetadata>,
    data: &[u8],
) -> Result<(i64, bool)> {
    let date = chrono::Utc::now().timestamp();
    let inserted = conn.execute(
        r#"
        INSERT OR IGNORE INTO image
            (hash, date, width, height, phash, url, format, filesize, pixelformat)
        VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
        "#,
        params![
            hash,
            date,
            meta.map(|m| m.width),
            meta.map(|m| m.height),
            meta.map(|m| m.perceptual_hash as i64),
            url,
            meta.map(|m| m.format.as_str()),
            data.len() as i64,
            meta.map(|m| m.pixel_format.as_str()),
        ],
    )?;

    if inserted == 0 {
        let id = id_by_hash(conn, hash)?.ok_or_else(|| {
            StoreError::ConstraintViolation(format!("hash {} ignored but not present", hash))
        })?;
        return Ok((id, false));
    }

    let id = conn.last_insert_rowid();
    conn.execute("INSERT INTO blob (id, data) VALUES (?1, ?2)", params![id, data])?;
    Ok((id, true))
}

pub fn id_by_hash(conn: &Connection, hash: &str) -> Result<Option<i64>> {
    Ok(conn
        .query_row("SELECT id FROM image WHERE hash = ?1", [hash], |row| row.get(0))
        .optional()?)
}

pub fn hash_by_id(conn: &Connection, id: i64) -> Result<Option<String>> {
    Ok(conn
        .query_row("SELECT hash FROM image WHERE id = ?1", [id], |row| row.get(0))
        .optional()?)
}

pub fn load_image(conn: &Connection, id: i64) -> Result<Option<ImageRow>> {
    let sql = format!("SELECT {} FROM image WHERE id = ?1", IMAGE_COLUMNS);
    Ok(conn.query_row(&sql, [id], row_to_image).optional()?)
}

pub fn load_images(conn: &Connection) -> Result<Vec<ImageRow>> {
    let sql = format!("SELECT {} FROM image ORDER BY id", IMAGE_COLUMNS);
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt
        .query_map([], row_to_image)?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(rows)
}

pub fn all_ids(conn: &Connection) -> Result<Vec<i64>> {
    let mut stmt = conn.prepare("SELECT id FROM image ORDER BY id")?;
    let ids = stmt
        .query_map([], |row| row.get(0))?
        .collect::<rusqlite::Result<Vec<i64>>>()?;
    Ok(ids)
}

/// Every tag association, grouped by image id.
pub fn load_tags(conn: &Connection) -> Result<HashMap<i64, Vec<String>>> {
    let mut stmt = conn.prepare("SELECT id, tag FROM tag ORDER BY id, tag")?;
    let mut tags: HashMap<i64, Vec<String>> = HashMap::new();
    let rows = stmt.query_map([], |row| Ok((row.get::<_, i64>(0)?, row.get::<_, String>(1)?)))?;
    for row in rows {
        let (id, tag) = row?;
        tags.entry(id).or_default().push(tag);
    }
    Ok(tags)
}

pub fn tags_for(conn: &Connection, id: i64) -> Result<Vec<String>> {
    let mut stmt = conn.prepare("SELECT tag FROM tag WHERE id = ?1 ORDER BY tag")?;
    let tags = stmt
        .query_map([id], |row| row.get(0))?
        .collect::<rusqlite::Result<Vec<String>>>()?;
    Ok(tags)
}

/// Returns the number of associations actually created. Ids without an
/// image row are skipped.
pub fn add_tag(conn: &Connection, ids: &[i64], tag: &str) -> Result<usize> {
    let mut stmt = conn.prepare_cached(
        "INSERT OR IGNORE INTO tag (id, tag) SELECT ?1, ?2 WHERE EXISTS (SELECT 1 FROM image WHERE id = ?1)",
    )?;
    let mut changed = 0;
    for id in ids {
        changed += stmt.execute(params![id, tag])?;
    }
    Ok(changed)
}

pub fn remove_tag(conn: &Connection, ids: &[i64], tag: &str) -> Result<usize> {
    let mut stmt = conn.prepare_cached("DELETE FROM tag WHERE id = ?1 AND tag = ?2")?;
    let mut changed = 0;
    for id in ids {
        changed += stmt.execute(params![id, tag])?;
    }
    Ok(changed)
}

pub fn set_deleted(conn: &Connection, ids: &[i64], deleted: bool) -> Result<usize> {
    let mut stmt = conn.prepare_cached("UPDATE image SET deleted = ?1 WHERE id = ?2 AND deleted != ?1")?;
    let mut changed = 0;
    for id in ids {
        changed += stmt.execute(params![deleted as i64, id])?;
    }
    Ok(changed)
}

/// Hard-delete every soft-deleted image with its blob, tags and renditions.
///
/// Must run inside a transaction so the four tables change together.
pub fn purge_deleted(conn: &Connection) -> Result<Vec<i64>> {
    let mut stmt = conn.prepare("SELECT id FROM image WHERE deleted = 1 ORDER BY id")?;
    let ids = stmt
        .query_map([], |row| row.get(0))?
        .collect::<rusqlite::Result<Vec<i64>>>()?;
    if ids.is_empty() {
        return Ok(ids);
    }

    const DELETED: &str = "(SELECT id FROM image WHERE deleted = 1)";
    conn.execute(&format!("DELETE FROM tag WHERE id IN {}", DELETED), [])?;
    conn.execute(&format!("DELETE FROM blob WHERE id IN {}", DELETED), [])?;
    for size in LADDER {
        conn.execute(
            &format!("DELETE FROM {} WHERE id IN {}", thumb_table(size), DELETED),
            [],
        )?;
    }
    conn.execute("DELETE FROM image WHERE deleted = 1", [])?;
    Ok(ids)
}

pub fn image_data(conn: &Connection, id: i64) -> Result<Vec<u8>> {
    conn.query_row("SELECT data FROM blob WHERE id = ?1", [id], |row| row.get(0))
        .optional()?
        .ok_or(StoreError::NotFound(id))
}

/// Overwrite the decoded columns of one image.
pub fn update_metadata(conn: &Connection, id: i64, meta: &ImageMetadata) -> Result<()> {
    conn.execute(
        r#"
        UPDATE image
        SET width = ?1, height = ?2, phash = ?3, format = ?4, filesize = ?5, pixelformat = ?6
        WHERE id = ?7
        "#,
        params![
            meta.width,
            meta.height,
            meta.perceptual_hash as i64,
            meta.format,
            meta.byte_size as i64,
            meta.pixel_format,
            id,
        ],
    )?;
    Ok(())
}

/// Swap the stored bytes of an image for a re-encoded version.
///
/// The content hash is left alone; renditions of the old bytes are dropped.
pub fn replace_image_data(conn: &Connection, id: i64, data: &[u8], meta: &ImageMetadata) -> Result<()> {
    let updated = conn.execute("UPDATE blob SET data = ?1 WHERE id = ?2", params![data, id])?;
    if updated == 0 {
        return Err(StoreError::NotFound(id));
    }
    conn.execute(
        "UPDATE image SET format = ?1, filesize = ?2, pixelformat = ?3 WHERE id = ?4",
        params![meta.format, meta.byte_size as i64, meta.pixel_format, id],
    )?;
    delete_thumbnails_for(conn, id)?;
    Ok(())
}

pub fn load_thumbnail(conn: &Connection, id: i64, size: u32) -> Result<Option<Vec<u8>>> {
    let sql = format!("SELECT data FROM {} WHERE id = ?1", thumb_table(size));
    Ok(conn.query_row(&sql, [id], |row| row.get(0)).optional()?)
}

/// Persist a rendition; returns `false` when the image no longer exists.
pub fn store_thumbnail(conn: &Connection, id: i64, size: u32, data: &[u8]) -> Result<bool> {
    let sql = format!(
        "INSERT OR REPLACE INTO {} (id, data) SELECT ?1, ?2 WHERE EXISTS (SELECT 1 FROM image WHERE id = ?1)",
        thumb_table(size)
    );
    Ok(conn.execute(&sql, params![id, data])? > 0)
}

pub fn delete_thumbnails_for(conn: &Connection, id: i64) -> Result<()> {
    for size in LADDER {
        conn.execute(&format!("DELETE FROM {} WHERE id = ?1", thumb_table(size)), [id])?;
    }
    Ok(())
}

/// Empty every pyramid table.
pub fn clear_thumbnails(conn: &Connection) -> Result<()> {
    for size in LADDER {
        conn.execute(&format!("DELETE FROM {}", thumb_table(size)), [])?;
    }
    Ok(())
}

/// Read a meta scalar as text (numbers are rendered in SQL).
pub fn meta_get(conn: &Connection, key: &str) -> Result<Option<String>> {
    Ok(conn
        .query_row(
            "SELECT CAST(value AS TEXT) FROM meta WHERE key = ?1",
            [key],
            |row| row.get::<_, Option<String>>(0),
        )
        .optional()?
        .flatten())
}

pub fn meta_put(conn: &Connection, key: &str, value: &str) -> Result<()> {
    conn.execute(
        "INSERT OR REPLACE INTO meta (key, value) VALUES (?1, ?2)",
        params![key, value],
    )?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::Migrator;

    fn setup() -> Connection {
        let mut conn = Connection::open_in_memory().unwrap();
        Migrator::default().run(&mut conn).unwrap();
        conn
    }

    fn meta(phash: u64) -> ImageMetadata {
        ImageMetadata {
            format: "png".into(),
            width: 10,
            height: 20,
            byte_size: 3,
            pixel_format: "Rgb8".into(),
            perceptual_hash: phash,
        }
    }

    fn count(conn: &Connection, table: &str) -> i64 {
        conn.query_row(&format!("SELECT COUNT(*) FROM {}", table), [], |r| r.get(0))
            .unwrap()
    }

    #[test]
    fn test_insert_is_idempotent_on_hash() {
        let conn = setup();
        let (a, created) = insert_image(&conn, "h1", Some("http://x/a.png"), Some(&meta(1)), b"abc").unwrap();
        assert!(created);
        let (b, created) = insert_image(&conn, "h1", None, Some(&meta(1)), b"abc").unwrap();
        assert!(!created);
        assert_eq!(a, b);
        assert_eq!(count(&conn, "blob"), 1);
        assert_eq!(id_by_hash(&conn, "h1").unwrap(), Some(a));
        assert_eq!(hash_by_id(&conn, a).unwrap().as_deref(), Some("h1"));
    }

    #[test]
    fn test_high_bit_phash_round_trips() {
        let conn = setup();
        let (id, _) = insert_image(&conn, "h", None, Some(&meta(u64::MAX - 5)), b"abc").unwrap();
        let row = load_image(&conn, id).unwrap().unwrap();
        assert_eq!(row.perceptual_hash, Some(u64::MAX - 5));
        assert_eq!(row.url, None);
        assert!(!row.deleted);
    }

    #[test]
    fn test_tag_changes_count_only_real_changes() {
        let conn = setup();
        let (a, _) = insert_image(&conn, "a", None, Some(&meta(0)), b"a").unwrap();
        let (b, _) = insert_image(&conn, "b", None, Some(&meta(0)), b"b").unwrap();
        assert_eq!(add_tag(&conn, &[a, b], "cat").unwrap(), 2);
        assert_eq!(add_tag(&conn, &[a, b], "cat").unwrap(), 0);
        assert_eq!(tags_for(&conn, a).unwrap(), vec!["cat".to_string()]);
        assert_eq!(remove_tag(&conn, &[a], "cat").unwrap(), 1);
        assert_eq!(remove_tag(&conn, &[a], "cat").unwrap(), 0);
        let all = load_tags(&conn).unwrap();
        assert!(!all.contains_key(&a));
        assert_eq!(all[&b], vec!["cat".to_string()]);
    }

    #[test]
    fn test_purge_removes_all_rows() {
        let conn = setup();
        let (a, _) = insert_image(&conn, "a", None, Some(&meta(0)), b"a").unwrap();
        let (b, _) = insert_image(&conn, "b", None, Some(&meta(0)), b"b").unwrap();
        add_tag(&conn, &[a, b], "t").unwrap();
        store_thumbnail(&conn, a, 40, b"thumb").unwrap();
        assert_eq!(set_deleted(&conn, &[a], true).unwrap(), 1);
        assert_eq!(set_deleted(&conn, &[a], true).unwrap(), 0);

        assert_eq!(purge_deleted(&conn).unwrap(), vec![a]);
        assert_eq!(count(&conn, "image"), 1);
        assert_eq!(count(&conn, "blob"), 1);
        assert_eq!(count(&conn, "tag"), 1);
        assert_eq!(count(&conn, "thumb40"), 0);
        assert!(matches!(image_data(&conn, a), Err(StoreError::NotFound(_))));
    }

    #[test]
    fn test_purge_rolled_back_leaves_rows() {
        let mut conn = setup();
        let (a, _) = insert_image(&conn, "a", None, Some(&meta(0)), b"a").unwrap();
        add_tag(&conn, &[a], "t").unwrap();
        set_deleted(&conn, &[a], true).unwrap();
        {
            let tx = conn.transaction().unwrap();
            purge_deleted(&tx).unwrap();
            // dropped without commit
        }
        assert_eq!(count(&conn, "image"), 1);
        assert_eq!(count(&conn, "blob"), 1);
        assert_eq!(count(&conn, "tag"), 1);
    }

    #[test]
    fn test_replace_image_data_drops_renditions() {
        let conn = setup();
        let (a, _) = insert_image(&conn, "a", None, Some(&meta(0)), b"a").unwrap();
        store_thumbnail(&conn, a, 80, b"x").unwrap();
        let mut jpeg = meta(0);
        jpeg.format = "jpeg".into();
        jpeg.byte_size = 4;
        replace_image_data(&conn, a, b"jpeg", &jpeg).unwrap();
        assert_eq!(image_data(&conn, a).unwrap(), b"jpeg".to_vec());
        assert_eq!(load_thumbnail(&conn, a, 80).unwrap(), None);
        let row = load_image(&conn, a).unwrap().unwrap();
        assert_eq!(row.format.as_deref(), Some("jpeg"));
        assert_eq!(row.hash, "a");
        assert!(matches!(replace_image_data(&conn, 99, b"x", &jpeg), Err(StoreError::NotFound(99))));
    }

    #[test]
    fn test_undecoded_insert_leaves_metadata_null() {
        let conn = setup();
        let (id, created) = insert_image(&conn, "raw", None, None, b"not an image").unwrap();
        assert!(created);
        let row = load_image(&conn, id).unwrap().unwrap();
        assert_eq!((row.width, row.height, row.perceptual_hash), (None, None, None));
        assert_eq!(row.format, None);
        assert_eq!(row.byte_size, Some(12));
        assert_eq!(image_data(&conn, id).unwrap(), b"not an image".to_vec());
    }

    #[test]
    fn test_writes_for_missing_images_are_dropped() {
        let conn = setup();
        let (a, _) = insert_image(&conn, "a", None, Some(&meta(0)), b"a").unwrap();
        assert!(store_thumbnail(&conn, a, 40, b"x").unwrap());
        assert!(!store_thumbnail(&conn, a + 1, 40, b"x").unwrap());
        assert_eq!(add_tag(&conn, &[a, a + 1], "t").unwrap(), 1);
        assert_eq!(count(&conn, "thumb40"), 1);
        assert_eq!(count(&conn, "tag"), 1);
    }

    #[test]
    fn test_meta_round_trip() {
        let conn = setup();
        assert_eq!(meta_get(&conn, "missing").unwrap(), None);
        meta_put(&conn, "greeting", "hello").unwrap();
        assert_eq!(meta_get(&conn, "greeting").unwrap().as_deref(), Some("hello"));
        assert_eq!(meta_get(&conn, "version").unwrap().as_deref(), Some("4"));
    }
}
