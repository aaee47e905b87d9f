//! Table layout, expressed as the ordered list of schema upgrade steps.

/// Target sizes of the thumbnail pyramid, ascending.
pub const LADDER: [u32; 6] = [40, 80, 160, 320, 640, 1280];

/// Name of the rendition table for a ladder size (`thumb40` … `thumb1280`).
pub fn thumb_table(size: u32) -> String {
    format!("thumb{}", size)
}

/// Bootstrap DDL run before the version is read; must stay idempotent.
pub const META_TABLE: &str = "CREATE TABLE IF NOT EXISTS meta (key TEXT PRIMARY KEY, value)";

pub const META_VERSION_KEY: &str = "version";

/// One upgrade step: applying `sql` moves the schema from `version - 1` to `version`.
#[derive(Debug, Clone, Copy)]
pub struct MigrationStep {
    pub version: u32,
    pub sql: &'static str,
}

pub const MIGRATIONS: &[MigrationStep] = &[
    MigrationStep {
        version: 1,
        sql: r#"
-- Images: one row per unique content hash
CREATE TABLE image (
    id INTEGER PRIMARY KEY,
    hash TEXT NOT NULL UNIQUE,
    date INTEGER NOT NULL
);

-- Original encoded bytes
CREATE TABLE blob (
    id INTEGER PRIMARY KEY,
    data BLOB NOT NULL
);

-- Tag associations
CREATE TABLE tag (
    id INTEGER NOT NULL,
    tag TEXT NOT NULL,
    PRIMARY KEY (id, tag)
);

CREATE INDEX tag_index ON tag (tag);
"#,
    },
    MigrationStep {
        version: 2,
        sql: r#"
-- Decoded metadata, backfilled by a metadata rebuild
ALTER TABLE image ADD COLUMN width INTEGER;
ALTER TABLE image ADD COLUMN height INTEGER;
ALTER TABLE image ADD COLUMN phash INTEGER;
ALTER TABLE image ADD COLUMN format TEXT;
ALTER TABLE image ADD COLUMN filesize INTEGER;
ALTER TABLE image ADD COLUMN pixelformat TEXT;

UPDATE image SET filesize = (SELECT length(data) FROM blob WHERE blob.id = image.id);
INSERT OR REPLACE INTO meta (key, value) VALUES ('metadata_stale', 1);
"#,
    },
    MigrationStep {
        version: 3,
        sql: r#"
ALTER TABLE image ADD COLUMN url TEXT;
ALTER TABLE image ADD COLUMN deleted INTEGER NOT NULL DEFAULT 0;

CREATE INDEX image_deleted ON image (deleted);
CREATE INDEX image_phash ON image (phash);
"#,
    },
    MigrationStep {
        version: 4,
        sql: r#"
-- Thumbnail pyramid, one table per ladder size
CREATE TABLE thumb40 (id INTEGER PRIMARY KEY, data BLOB NOT NULL);
CREATE TABLE thumb80 (id INTEGER PRIMARY KEY, data BLOB NOT NULL);
CREATE TABLE thumb160 (id INTEGER PRIMARY KEY, data BLOB NOT NULL);
CREATE TABLE thumb320 (id INTEGER PRIMARY KEY, data BLOB NOT NULL);
CREATE TABLE thumb640 (id INTEGER PRIMARY KEY, data BLOB NOT NULL);
CREATE TABLE thumb1280 (id INTEGER PRIMARY KEY, data BLOB NOT NULL);
"#,
    },
];

/// Highest schema version this build knows how to produce.
pub fn current_version() -> u32 {
    MIGRATIONS.last().map(|step| step.version).unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_steps_are_contiguous() {
        for (i, step) in MIGRATIONS.iter().enumerate() {
            assert_eq!(step.version, i as u32 + 1);
        }
        assert_eq!(current_version(), MIGRATIONS.len() as u32);
    }

    #[test]
    fn test_every_ladder_size_has_a_table() {
        let ddl: String = MIGRATIONS.iter().map(|s| s.sql).collect();
        for size in LADDER {
            assert!(ddl.contains(&format!("CREATE TABLE {} ", thumb_table(size))));
        }
    }
}
