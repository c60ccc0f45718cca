pub mod models;
pub mod queries;

use rusqlite::Connection;
use std::path::Path;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum DbError {
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("Corrupt column in {table}: {message}")]
    Corrupt { table: String, message: String },
}

pub type Result<T> = std::result::Result<T, DbError>;

pub struct Database {
    pub conn: Connection,
}

impl Database {
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).ok();
        }
        let conn = Connection::open(path)?;
        let db = Self { conn };
        db.init()?;
        Ok(db)
    }

    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        let db = Self { conn };
        db.init()?;
        Ok(db)
    }

    fn init(&self) -> Result<()> {
        // WAL mode for better concurrent read performance
        self.conn.pragma_update(None, "journal_mode", "WAL")?;
        self.conn.pragma_update(None, "synchronous", "NORMAL")?;
        self.conn.pragma_update(None, "foreign_keys", "ON")?;
        self.migrate()?;
        Ok(())
    }

    fn migrate(&self) -> Result<()> {
        let version: i32 = self
            .conn
            .pragma_query_value(None, "user_version", |row| row.get(0))
            .unwrap_or(0);

        if version < 1 {
            self.migrate_v1()?;
        }
        if version < 2 {
            self.migrate_v2()?;
        }
        if version < 3 {
            self.migrate_v3()?;
        }
        if version < 4 {
            self.migrate_v4()?;
        }

        self.conn.pragma_update(None, "user_version", 4)?;
        Ok(())
    }

    /// V1: recordings, per-recording spike streams, cluster-channel table,
    /// and the pass-through settings store.
    ///
    /// Cluster ids are persisted 1-indexed and channels 0-indexed; all
    /// conversion happens in `queries.rs`.
    fn migrate_v1(&self) -> Result<()> {
        self.conn.execute_batch(
            "
            CREATE TABLE IF NOT EXISTS recordings (
                id               INTEGER PRIMARY KEY AUTOINCREMENT,
                day              TEXT NOT NULL,
                rec              TEXT NOT NULL,
                tower            TEXT NOT NULL,
                probe            INTEGER NOT NULL,
                grouped          INTEGER NOT NULL,
                duration_samples INTEGER NOT NULL,
                sample_rate      REAL NOT NULL,
                aux_only         INTEGER NOT NULL DEFAULT 0,
                created_at       TEXT NOT NULL DEFAULT (datetime('now')),
                UNIQUE(day, rec, tower, probe)
            );
            CREATE INDEX IF NOT EXISTS idx_recordings_day ON recordings(day);

            -- One row per recording. Numeric arrays are little-endian blobs;
            -- *_dims columns hold JSON shape vectors for the 3-D arrays.
            CREATE TABLE IF NOT EXISTS spike_streams (
                recording_id      INTEGER PRIMARY KEY
                                  REFERENCES recordings(id) ON DELETE CASCADE,
                n_spikes          INTEGER NOT NULL,
                spike_times       BLOB NOT NULL,
                cluster_ids       BLOB NOT NULL,
                temp_scaling_amps BLOB NOT NULL,
                pc_feat           BLOB NOT NULL,
                pc_dims           TEXT NOT NULL,
                templates         BLOB NOT NULL,
                template_dims     TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS clusters (
                recording_id   INTEGER NOT NULL
                               REFERENCES recordings(id) ON DELETE CASCADE,
                cluster_id     INTEGER NOT NULL,
                best_channel   INTEGER NOT NULL,
                worst_channel  INTEGER NOT NULL,
                quality        TEXT NOT NULL,
                local_channels TEXT NOT NULL,
                PRIMARY KEY (recording_id, cluster_id)
            );
            CREATE INDEX IF NOT EXISTS idx_clusters_channel
                ON clusters(recording_id, best_channel);

            CREATE TABLE IF NOT EXISTS settings (
                key   TEXT PRIMARY KEY,
                value TEXT NOT NULL
            );
            ",
        )?;
        Ok(())
    }

    /// V2: per-(cluster, time-window) isolation frames.
    fn migrate_v2(&self) -> Result<()> {
        self.conn.execute_batch(
            "
            CREATE TABLE IF NOT EXISTS isolation_frames (
                recording_id INTEGER NOT NULL
                             REFERENCES recordings(id) ON DELETE CASCADE,
                cluster_id   INTEGER NOT NULL,
                frame_index  INTEGER NOT NULL,
                t_start      REAL NOT NULL,
                n_spikes     INTEGER NOT NULL,
                score        REAL,
                signal_mean  TEXT NOT NULL,
                noise_mean   TEXT NOT NULL,
                noise_std    TEXT NOT NULL,
                verdict      INTEGER NOT NULL DEFAULT 0,
                clu_wf       BLOB NOT NULL,
                noise_wf     BLOB NOT NULL,
                neighbors    TEXT NOT NULL,
                PRIMARY KEY (recording_id, cluster_id, frame_index)
            );
            ",
        )?;
        Ok(())
    }

    /// V3: trial-aligned rasters, own and per-neighbor.
    fn migrate_v3(&self) -> Result<()> {
        self.conn.execute_batch(
            "
            CREATE TABLE IF NOT EXISTS rasters (
                recording_id INTEGER NOT NULL
                             REFERENCES recordings(id) ON DELETE CASCADE,
                cluster_id   INTEGER NOT NULL,
                trial_spikes TEXT NOT NULL,
                rt           TEXT NOT NULL,
                PRIMARY KEY (recording_id, cluster_id)
            );

            CREATE TABLE IF NOT EXISTS neighbor_rasters (
                recording_id INTEGER NOT NULL
                             REFERENCES recordings(id) ON DELETE CASCADE,
                cluster_id   INTEGER NOT NULL,
                neighbor_id  INTEGER NOT NULL,
                trial_spikes TEXT NOT NULL,
                rt           TEXT NOT NULL,
                PRIMARY KEY (recording_id, cluster_id, neighbor_id)
            );
            ",
        )?;
        Ok(())
    }

    /// V4: stitch tables plus the isolated-subset columns appended by the
    /// isolated-unit selector.
    fn migrate_v4(&self) -> Result<()> {
        self.conn.execute_batch(
            "
            CREATE TABLE IF NOT EXISTS stitch_tables (
                id         INTEGER PRIMARY KEY AUTOINCREMENT,
                day        TEXT NOT NULL,
                tower      TEXT NOT NULL,
                probe      INTEGER NOT NULL,
                recordings TEXT NOT NULL,
                scope      TEXT NOT NULL,
                created_at TEXT NOT NULL DEFAULT (datetime('now'))
            );

            CREATE TABLE IF NOT EXISTS stitch_rows (
                stitch_id INTEGER NOT NULL
                          REFERENCES stitch_tables(id) ON DELETE CASCADE,
                row_index INTEGER NOT NULL,
                entries   TEXT NOT NULL,
                PRIMARY KEY (stitch_id, row_index)
            );
            ",
        )?;
        try_add_column(&self.conn, "spike_streams", "iso_spike_times BLOB")?;
        try_add_column(&self.conn, "spike_streams", "iso_cluster_ids BLOB")?;
        try_add_column(&self.conn, "clusters", "isolated INTEGER NOT NULL DEFAULT 0")?;
        Ok(())
    }
}

/// Helper: try to add a column, ignore if it already exists.
fn try_add_column(conn: &Connection, table: &str, column_def: &str) -> Result<()> {
    let sql = format!("ALTER TABLE {table} ADD COLUMN {column_def}");
    match conn.execute(&sql, []) {
        Ok(_) | Err(rusqlite::Error::SqliteFailure(_, _)) => Ok(()),
        Err(e) => Err(e.into()),
    }
}
