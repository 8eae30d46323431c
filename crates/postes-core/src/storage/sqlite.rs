use async_trait::async_trait;
use chrono::{DateTime, Utc};
use r2d2::{Pool, PooledConnection};
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::types::Value;
use rusqlite::{params, OptionalExtension, Row};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, info, warn};

use super::{BackendError, RecordStore, StoreCounts, StoreError};
use crate::models::{NewRecord, Record, SyncStatus};

const SCHEMA: &str = "
    CREATE TABLE IF NOT EXISTS postes (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        cidade TEXT NOT NULL,
        bairro TEXT NOT NULL,
        zonautm INTEGER NOT NULL,
        localizacao_utm_x REAL NOT NULL,
        localizacao_utm_y REAL NOT NULL,
        observacoes TEXT,
        foto_uri TEXT,
        status_sync INTEGER NOT NULL DEFAULT 0,
        tentativas INTEGER NOT NULL DEFAULT 0,
        ultimo_erro TEXT,
        criado_em TEXT NOT NULL DEFAULT ''
    );
    CREATE INDEX IF NOT EXISTS idx_postes_status_sync ON postes (status_sync);
    CREATE TABLE IF NOT EXISTS sync_lease (
        id INTEGER PRIMARY KEY CHECK (id = 1),
        holder TEXT NOT NULL,
        expires_at INTEGER NOT NULL
    );
";

/// Columns added after the first released schema. Databases created by the
/// older client lack them and get them on initialize.
const LATE_COLUMNS: &[(&str, &str)] = &[
    ("foto_uri", "TEXT"),
    ("tentativas", "INTEGER NOT NULL DEFAULT 0"),
    ("ultimo_erro", "TEXT"),
    ("criado_em", "TEXT NOT NULL DEFAULT ''"),
];

const SELECT_COLUMNS: &str = "id, cidade, bairro, zonautm, localizacao_utm_x, localizacao_utm_y, \
     observacoes, foto_uri, status_sync, tentativas, ultimo_erro, criado_em";

/// SQLite-backed record store.
///
/// Connections come from an r2d2 pool and every statement runs on the
/// blocking thread pool, so callers on the async runtime never block.
#[derive(Clone)]
pub struct LocalDb {
    pool: Pool<SqliteConnectionManager>,
    path: Option<PathBuf>,
}

impl LocalDb {
    /// Open (creating if needed) the database file at `path`.
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| StoreError::Init(e.into()))?;
        }
        let manager = SqliteConnectionManager::file(path)
            .with_init(|conn| conn.execute_batch("PRAGMA busy_timeout = 5000;"));
        let pool = Pool::new(manager).map_err(|e| StoreError::Init(e.into()))?;
        Ok(Self {
            pool,
            path: Some(path.to_path_buf()),
        })
    }

    /// Private in-memory database, used by tests and ephemeral sessions.
    pub fn open_in_memory() -> Result<Self, StoreError> {
        // Every in-memory connection is its own database, so the pool must
        // hand out the same single connection.
        let pool = Pool::builder()
            .max_size(1)
            .build(SqliteConnectionManager::memory())
            .map_err(|e| StoreError::Init(e.into()))?;
        Ok(Self { pool, path: None })
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    async fn run<T, F>(&self, f: F) -> Result<T, BackendError>
    where
        T: Send + 'static,
        F: FnOnce(&mut PooledConnection<SqliteConnectionManager>) -> Result<T, BackendError>
            + Send
            + 'static,
    {
        let pool = self.pool.clone();
        tokio::task::spawn_blocking(move || {
            let mut conn = pool.get()?;
            f(&mut conn)
        })
        .await
        .map_err(|e| BackendError::Task(e.to_string()))?
    }

    async fn list_by_status(&self, status: SyncStatus) -> Result<Vec<Record>, StoreError> {
        self.run(move |conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {SELECT_COLUMNS} FROM postes WHERE status_sync = ?1 ORDER BY id ASC"
            ))?;
            let rows = stmt.query_map(params![status.as_i64()], RawRow::from_row)?;
            let mut out = Vec::new();
            for row in rows {
                out.push(row?.into_record()?);
            }
            Ok(out)
        })
        .await
        .map_err(StoreError::Read)
    }

    async fn write<F>(&self, f: F) -> Result<usize, StoreError>
    where
        F: FnOnce(&rusqlite::Connection) -> rusqlite::Result<usize> + Send + 'static,
    {
        self.run(move |conn| Ok(f(conn)?))
            .await
            .map_err(StoreError::Write)
    }
}

fn add_missing_columns(conn: &rusqlite::Connection) -> Result<(), BackendError> {
    let mut stmt = conn.prepare("PRAGMA table_info(postes)")?;
    let existing = stmt
        .query_map([], |row| row.get::<_, String>(1))?
        .collect::<Result<Vec<_>, _>>()?;

    for (column, decl) in LATE_COLUMNS {
        if !existing.iter().any(|c| c == column) {
            info!(column, "upgrading local schema");
            conn.execute_batch(&format!("ALTER TABLE postes ADD COLUMN {column} {decl};"))?;
        }
    }
    Ok(())
}

/// Row as stored, before enum/path/date decoding.
///
/// Rows written by the older client may hold NULL or empty text in the
/// capture columns, so those are read untyped.
struct RawRow {
    id: i64,
    city: Value,
    neighborhood: Value,
    utm_zone: Value,
    utm_easting: Value,
    utm_northing: Value,
    notes: Option<String>,
    photo: Option<String>,
    status: i64,
    attempts: i64,
    last_error: Option<String>,
    created_at: String,
}

fn text_or_empty(value: Value) -> String {
    match value {
        Value::Text(s) => s,
        Value::Integer(n) => n.to_string(),
        Value::Real(f) => f.to_string(),
        Value::Null | Value::Blob(_) => String::new(),
    }
}

fn lenient_f64(value: &Value) -> Option<f64> {
    match value {
        Value::Integer(n) => Some(*n as f64),
        Value::Real(f) => Some(*f),
        Value::Text(s) => s.trim().parse().ok(),
        Value::Null | Value::Blob(_) => None,
    }
}

fn lenient_i64(value: &Value) -> Option<i64> {
    match value {
        Value::Integer(n) => Some(*n),
        Value::Real(f) => Some(*f as i64),
        Value::Text(s) => s.trim().parse().ok(),
        Value::Null | Value::Blob(_) => None,
    }
}

impl RawRow {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            city: row.get(1)?,
            neighborhood: row.get(2)?,
            utm_zone: row.get(3)?,
            utm_easting: row.get(4)?,
            utm_northing: row.get(5)?,
            notes: row.get(6)?,
            photo: row.get(7)?,
            status: row.get(8)?,
            attempts: row.get::<_, Option<i64>>(9)?.unwrap_or(0),
            last_error: row.get(10)?,
            created_at: row.get::<_, Option<String>>(11)?.unwrap_or_default(),
        })
    }

    fn into_record(self) -> Result<Record, BackendError> {
        let sync_status = SyncStatus::from_i64(self.status).ok_or_else(|| BackendError::Corrupt {
            id: self.id,
            reason: format!("unknown status_sync {}", self.status),
        })?;
        // Rows migrated from the old schema have no creation time.
        let created_at = DateTime::parse_from_rfc3339(&self.created_at)
            .map(|d| d.with_timezone(&Utc))
            .unwrap_or_default();

        // Incomplete captures are still handed to the server, which rejects
        // them per record instead of the whole queue failing to load.
        let utm_zone = lenient_i64(&self.utm_zone);
        let utm_easting = lenient_f64(&self.utm_easting);
        let utm_northing = lenient_f64(&self.utm_northing);
        let city = text_or_empty(self.city);
        let neighborhood = text_or_empty(self.neighborhood);
        let incomplete = city.is_empty()
            || neighborhood.is_empty()
            || utm_zone.is_none()
            || utm_easting.is_none()
            || utm_northing.is_none();
        if incomplete {
            warn!(id = self.id, "record has missing capture fields");
        }

        Ok(Record {
            id: self.id,
            city,
            neighborhood,
            utm_zone: utm_zone.unwrap_or(0),
            utm_easting: utm_easting.unwrap_or(0.0),
            utm_northing: utm_northing.unwrap_or(0.0),
            notes: self.notes,
            photo_ref: self.photo.filter(|p| !p.is_empty()).map(PathBuf::from),
            sync_status,
            attempts: u32::try_from(self.attempts).unwrap_or(0),
            last_error: self.last_error,
            created_at,
        })
    }
}

#[async_trait]
impl RecordStore for LocalDb {
    async fn initialize(&self) -> Result<(), StoreError> {
        let in_memory = self.path.is_none();
        self.run(move |conn| {
            if !in_memory {
                // journal_mode returns a row, so it cannot go through execute_batch
                conn.query_row("PRAGMA journal_mode = WAL", [], |_| Ok(()))?;
            }
            conn.execute_batch(SCHEMA)?;
            add_missing_columns(conn)?;
            Ok(())
        })
        .await
        .map_err(StoreError::Init)?;
        debug!(path = ?self.path, "local record store ready");
        Ok(())
    }

    async fn insert_pending(&self, record: &NewRecord) -> Result<i64, StoreError> {
        let record = record.clone();
        self.run(move |conn| {
            conn.execute(
                "INSERT INTO postes (cidade, bairro, zonautm, localizacao_utm_x, localizacao_utm_y,
                                     observacoes, foto_uri, status_sync, tentativas, criado_em)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, 0, ?9)",
                params![
                    record.city,
                    record.neighborhood,
                    record.utm_zone,
                    record.utm_easting,
                    record.utm_northing,
                    record.notes,
                    record.photo_ref.as_ref().map(|p| p.to_string_lossy().to_string()),
                    SyncStatus::Pending.as_i64(),
                    Utc::now().to_rfc3339(),
                ],
            )?;
            Ok(conn.last_insert_rowid())
        })
        .await
        .map_err(StoreError::Write)
    }

    async fn list_pending(&self) -> Result<Vec<Record>, StoreError> {
        self.list_by_status(SyncStatus::Pending).await
    }

    async fn get(&self, id: i64) -> Result<Option<Record>, StoreError> {
        self.run(move |conn| {
            let raw = conn
                .query_row(
                    &format!("SELECT {SELECT_COLUMNS} FROM postes WHERE id = ?1"),
                    params![id],
                    RawRow::from_row,
                )
                .optional()?;
            raw.map(RawRow::into_record).transpose()
        })
        .await
        .map_err(StoreError::Read)
    }

    async fn mark_synced(&self, id: i64) -> Result<(), StoreError> {
        self.write(move |conn| {
            conn.execute(
                "UPDATE postes SET status_sync = ?2 WHERE id = ?1 AND status_sync = ?3",
                params![id, SyncStatus::Synced.as_i64(), SyncStatus::Pending.as_i64()],
            )
        })
        .await?;
        Ok(())
    }

    async fn remove(&self, id: i64) -> Result<(), StoreError> {
        self.write(move |conn| conn.execute("DELETE FROM postes WHERE id = ?1", params![id]))
            .await?;
        Ok(())
    }

    async fn record_failure(&self, id: i64, reason: &str) -> Result<Option<u32>, StoreError> {
        let reason = reason.to_string();
        self.run(move |conn| {
            let attempts: Option<i64> = conn
                .query_row(
                    "UPDATE postes SET tentativas = tentativas + 1, ultimo_erro = ?2
                     WHERE id = ?1 AND status_sync = ?3
                     RETURNING tentativas",
                    params![id, reason, SyncStatus::Pending.as_i64()],
                    |row| row.get(0),
                )
                .optional()?;
            Ok(attempts.map(|n| u32::try_from(n).unwrap_or(u32::MAX)))
        })
        .await
        .map_err(StoreError::Write)
    }

    async fn mark_failed(&self, id: i64) -> Result<(), StoreError> {
        self.write(move |conn| {
            conn.execute(
                "UPDATE postes SET status_sync = ?2 WHERE id = ?1 AND status_sync = ?3",
                params![id, SyncStatus::Failed.as_i64(), SyncStatus::Pending.as_i64()],
            )
        })
        .await?;
        Ok(())
    }

    async fn list_failed(&self) -> Result<Vec<Record>, StoreError> {
        self.list_by_status(SyncStatus::Failed).await
    }

    async fn requeue(&self, id: i64) -> Result<bool, StoreError> {
        let changed = self
            .write(move |conn| {
                conn.execute(
                    "UPDATE postes SET status_sync = ?2, tentativas = 0
                     WHERE id = ?1 AND status_sync = ?3",
                    params![id, SyncStatus::Pending.as_i64(), SyncStatus::Failed.as_i64()],
                )
            })
            .await?;
        Ok(changed > 0)
    }

    async fn acquire_sync_lease(&self, holder: &str, ttl: Duration) -> Result<bool, StoreError> {
        let holder = holder.to_string();
        let ttl_ms = i64::try_from(ttl.as_millis()).unwrap_or(i64::MAX);
        // One upsert, so two processes racing for an expired lease cannot both win.
        let changed = self
            .write(move |conn| {
                let now = Utc::now().timestamp_millis();
                conn.execute(
                    "INSERT INTO sync_lease (id, holder, expires_at) VALUES (1, ?1, ?2)
                     ON CONFLICT(id) DO UPDATE SET holder = excluded.holder, expires_at = excluded.expires_at
                     WHERE sync_lease.holder = ?1 OR sync_lease.expires_at <= ?3",
                    params![holder, now.saturating_add(ttl_ms), now],
                )
            })
            .await?;
        Ok(changed > 0)
    }

    async fn release_sync_lease(&self, holder: &str) -> Result<(), StoreError> {
        let holder = holder.to_string();
        self.write(move |conn| {
            conn.execute("DELETE FROM sync_lease WHERE id = 1 AND holder = ?1", params![holder])
        })
        .await?;
        Ok(())
    }

    async fn counts(&self) -> Result<StoreCounts, StoreError> {
        self.run(|conn| {
            let mut stmt = conn.prepare("SELECT status_sync, COUNT(*) FROM postes GROUP BY status_sync")?;
            let rows = stmt.query_map([], |row| Ok((row.get::<_, i64>(0)?, row.get::<_, i64>(1)?)))?;
            let mut counts = StoreCounts::default();
            for row in rows {
                let (status, n) = row?;
                let n = u64::try_from(n).unwrap_or(0);
                match SyncStatus::from_i64(status) {
                    Some(SyncStatus::Pending) => counts.pending = n,
                    Some(SyncStatus::Synced) => counts.synced = n,
                    Some(SyncStatus::Failed) => counts.failed = n,
                    None => {}
                }
            }
            Ok(counts)
        })
        .await
        .map_err(StoreError::Read)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::utm::UtmCoordinate;

    fn sample(city: &str) -> NewRecord {
        let utm = UtmCoordinate { zone: 23, band: 'K', easting: 683_000.5, northing: 7_465_000.25 };
        NewRecord::new(city, "Centro", utm)
    }

    async fn memory_db() -> LocalDb {
        let db = LocalDb::open_in_memory().unwrap();
        db.initialize().await.unwrap();
        db
    }

    #[tokio::test]
    async fn initialize_is_idempotent() {
        let db = memory_db().await;
        db.insert_pending(&sample("Rio")).await.unwrap();
        db.initialize().await.unwrap();
        assert_eq!(db.list_pending().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn insert_assigns_increasing_ids_and_lists_in_order() {
        let db = memory_db().await;
        let a = db.insert_pending(&sample("A")).await.unwrap();
        let b = db.insert_pending(&sample("B").with_notes("leaning")).await.unwrap();
        assert!(b > a);

        let pending = db.list_pending().await.unwrap();
        let cities: Vec<_> = pending.iter().map(|r| r.city.as_str()).collect();
        assert_eq!(cities, ["A", "B"]);
        assert_eq!(pending[1].notes.as_deref(), Some("leaning"));
        assert!(pending.iter().all(|r| r.sync_status == SyncStatus::Pending));
    }

    #[tokio::test]
    async fn mark_synced_and_remove_are_idempotent() {
        let db = memory_db().await;
        let id = db.insert_pending(&sample("Rio")).await.unwrap();

        db.mark_synced(id).await.unwrap();
        db.mark_synced(id).await.unwrap();
        assert_eq!(db.get(id).await.unwrap().unwrap().sync_status, SyncStatus::Synced);
        assert!(db.list_pending().await.unwrap().is_empty());

        db.remove(id).await.unwrap();
        db.remove(id).await.unwrap();
        db.mark_synced(id).await.unwrap();
        assert!(db.get(id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn synced_rows_never_return_to_pending() {
        let db = memory_db().await;
        let id = db.insert_pending(&sample("Rio")).await.unwrap();
        db.mark_synced(id).await.unwrap();

        assert_eq!(db.record_failure(id, "late").await.unwrap(), None);
        db.mark_failed(id).await.unwrap();
        assert!(!db.requeue(id).await.unwrap());
        assert_eq!(db.get(id).await.unwrap().unwrap().sync_status, SyncStatus::Synced);
    }

    #[tokio::test]
    async fn dead_letter_lifecycle() {
        let db = memory_db().await;
        let id = db.insert_pending(&sample("Rio")).await.unwrap();

        assert_eq!(db.record_failure(id, "invalid city").await.unwrap(), Some(1));
        assert_eq!(db.record_failure(id, "invalid city").await.unwrap(), Some(2));
        db.mark_failed(id).await.unwrap();

        let failed = db.list_failed().await.unwrap();
        assert_eq!(failed.len(), 1);
        assert_eq!(failed[0].attempts, 2);
        assert_eq!(failed[0].last_error.as_deref(), Some("invalid city"));
        assert!(db.list_pending().await.unwrap().is_empty());

        assert!(db.requeue(id).await.unwrap());
        let pending = db.list_pending().await.unwrap();
        assert_eq!(pending[0].attempts, 0);
    }

    #[tokio::test]
    async fn counts_by_status() {
        let db = memory_db().await;
        let a = db.insert_pending(&sample("A")).await.unwrap();
        let b = db.insert_pending(&sample("B")).await.unwrap();
        db.insert_pending(&sample("C")).await.unwrap();
        db.mark_synced(a).await.unwrap();
        db.mark_failed(b).await.unwrap();

        let counts = db.counts().await.unwrap();
        assert_eq!(counts, StoreCounts { pending: 1, synced: 1, failed: 1 });
    }

    #[tokio::test]
    async fn photo_reference_round_trips() {
        let db = memory_db().await;
        let id = db
            .insert_pending(&sample("Rio").with_photo("/data/photos/p1.jpg"))
            .await
            .unwrap();
        let record = db.get(id).await.unwrap().unwrap();
        assert_eq!(record.photo_ref, Some(PathBuf::from("/data/photos/p1.jpg")));
    }

    #[tokio::test]
    async fn upgrades_the_legacy_schema() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("postes.db");
        {
            let conn = rusqlite::Connection::open(&path).unwrap();
            conn.execute_batch(
                "CREATE TABLE postes (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    cidade TEXT, bairro TEXT, zonautm INTEGER,
                    localizacao_utm_x REAL, localizacao_utm_y REAL,
                    observacoes TEXT, status_sync INTEGER DEFAULT 0
                 );
                 INSERT INTO postes (cidade, bairro, zonautm, localizacao_utm_x, localizacao_utm_y, observacoes, status_sync)
                 VALUES ('Rio', 'Centro', 23, 1.0, 2.0, NULL, 0);
                 INSERT INTO postes (cidade, bairro, zonautm, localizacao_utm_x, localizacao_utm_y, observacoes, status_sync)
                 VALUES ('7', NULL, '', NULL, NULL, 'sem bairro', 0);
                 INSERT INTO postes (cidade, bairro, zonautm, localizacao_utm_x, localizacao_utm_y, observacoes, status_sync)
                 VALUES ('7', '42', '23', '683000.5', 7465000.25, NULL, 0);",
            )
            .unwrap();
        }

        let db = LocalDb::open(&path).unwrap();
        db.initialize().await.unwrap();
        let pending = db.list_pending().await.unwrap();
        assert_eq!(pending.len(), 3);
        assert_eq!(pending[0].city, "Rio");
        assert_eq!(pending[0].photo_ref, None);
        assert_eq!(pending[0].attempts, 0);

        // Incomplete captures load with blanks instead of failing the list.
        assert_eq!(pending[1].city, "7");
        assert_eq!(pending[1].neighborhood, "");
        assert_eq!(pending[1].utm_zone, 0);
        assert_eq!(pending[1].notes.as_deref(), Some("sem bairro"));

        assert_eq!(pending[2].neighborhood, "42");
        assert_eq!(pending[2].utm_zone, 23);
        assert_eq!(pending[2].utm_easting, 683_000.5);
    }

    #[tokio::test]
    async fn sync_lease_is_exclusive_across_handles() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("postes.db");
        let daemon = LocalDb::open(&path).unwrap();
        daemon.initialize().await.unwrap();
        let cli = LocalDb::open(&path).unwrap();
        cli.initialize().await.unwrap();
        let ttl = Duration::from_secs(60);

        assert!(daemon.acquire_sync_lease("daemon", ttl).await.unwrap());
        assert!(!cli.acquire_sync_lease("cli", ttl).await.unwrap());
        // Renewal by the holder succeeds.
        assert!(daemon.acquire_sync_lease("daemon", ttl).await.unwrap());

        // Releasing someone else's lease does nothing.
        cli.release_sync_lease("cli").await.unwrap();
        assert!(!cli.acquire_sync_lease("cli", ttl).await.unwrap());

        daemon.release_sync_lease("daemon").await.unwrap();
        assert!(cli.acquire_sync_lease("cli", ttl).await.unwrap());
    }

    #[tokio::test]
    async fn expired_sync_lease_can_be_taken_over() {
        let db = memory_db().await;
        assert!(db.acquire_sync_lease("crashed", Duration::ZERO).await.unwrap());
        assert!(db.acquire_sync_lease("next", Duration::from_secs(60)).await.unwrap());
        assert!(!db.acquire_sync_lease("crashed", Duration::from_secs(60)).await.unwrap());
    }

    #[tokio::test]
    async fn unopenable_path_is_an_init_error() {
        let dir = tempfile::tempdir().unwrap();
        let blocker = dir.path().join("file");
        std::fs::write(&blocker, b"x").unwrap();
        let result = LocalDb::open(&blocker.join("postes.db"));
        assert!(matches!(result, Err(StoreError::Init(_))));
    }
}
