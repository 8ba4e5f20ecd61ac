//! Durable account snapshots.
//!
//! A live session writes a [`SessionSnapshot`] after every ledger change and
//! reloads the most recent one at startup. `save` returns only once the data
//! has reached durable storage.

use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use cta_core::{Error, OrderIntent, PersistenceConfig, ReservationId, Result, SnapshotBackend};
use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::position::AccountSnapshot;

/// An order waiting on the exchange, with the hold placed for it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OpenOrder {
    pub intent: OrderIntent,
    pub reservation: ReservationId,
}

/// Everything a live session needs to resume.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionSnapshot {
    pub account: AccountSnapshot,
    pub open_orders: Vec<OpenOrder>,
    pub next_order_id: u64,
}

/// Durable storage for the latest session snapshot.
pub trait SnapshotStore: Send + Sync {
    /// Persist `snapshot`. Must not return before the write is durable.
    fn save(&self, snapshot: &SessionSnapshot) -> Result<()>;

    /// Most recently saved snapshot, if any.
    fn load(&self) -> Result<Option<SessionSnapshot>>;
}

/// Open the store named by the persistence config.
pub fn open_store(config: &PersistenceConfig) -> Result<Box<dyn SnapshotStore>> {
    Ok(match config.backend {
        SnapshotBackend::Json => Box::new(JsonFileStore::new(&config.snapshot_path)),
        SnapshotBackend::Sqlite => Box::new(SqliteSnapshotStore::open(&config.snapshot_path)?),
    })
}

/// Single JSON file, replaced atomically on every save.
#[derive(Debug, Clone)]
pub struct JsonFileStore {
    path: PathBuf,
}

impl JsonFileStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn temp_path(&self) -> PathBuf {
        let mut name = self.path.file_name().map(|n| n.to_os_string()).unwrap_or_default();
        name.push(".tmp");
        self.path.with_file_name(name)
    }

    /// Flush the directory entry so the rename itself survives a crash.
    #[cfg(unix)]
    fn sync_parent(&self) -> Result<()> {
        let parent = match self.path.parent() {
            Some(p) if !p.as_os_str().is_empty() => p,
            _ => Path::new("."),
        };
        File::open(parent)?.sync_all()?;
        Ok(())
    }

    #[cfg(not(unix))]
    fn sync_parent(&self) -> Result<()> {
        Ok(())
    }
}

impl SnapshotStore for JsonFileStore {
    fn save(&self, snapshot: &SessionSnapshot) -> Result<()> {
        let body = serde_json::to_vec_pretty(snapshot)?;
        let tmp = self.temp_path();

        let mut file = File::create(&tmp)?;
        file.write_all(&body)?;
        file.sync_all()?;
        drop(file);
        fs::rename(&tmp, &self.path)?;
        self.sync_parent()?;

        debug!(path = %self.path.display(), bytes = body.len(), "snapshot written");
        Ok(())
    }

    fn load(&self) -> Result<Option<SessionSnapshot>> {
        if !self.path.exists() {
            return Ok(None);
        }
        let raw = fs::read_to_string(&self.path)?;
        let snapshot = serde_json::from_str(&raw)?;
        info!(path = %self.path.display(), "snapshot loaded");
        Ok(Some(snapshot))
    }
}

/// Latest snapshot in a single-row SQLite table, replaced on every save.
pub struct SqliteSnapshotStore {
    conn: Mutex<Connection>,
}

fn db_err(e: rusqlite::Error) -> Error {
    Error::database(e.to_string())
}

impl SqliteSnapshotStore {
    /// Open or create the database at `path`.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let conn = Connection::open(path.as_ref()).map_err(db_err)?;
        Self::with_connection(conn)
    }

    pub fn in_memory() -> Result<Self> {
        Self::with_connection(Connection::open_in_memory().map_err(db_err)?)
    }

    fn with_connection(conn: Connection) -> Result<Self> {
        conn.execute_batch(
            "PRAGMA synchronous = FULL;
             CREATE TABLE IF NOT EXISTS account_snapshots (
                 id            INTEGER PRIMARY KEY CHECK (id = 1),
                 updated_at_ms INTEGER NOT NULL,
                 body          TEXT NOT NULL
             );",
        )
        .map_err(db_err)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn conn(&self) -> Result<std::sync::MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| Error::database("snapshot connection lock poisoned"))
    }

    /// Number of snapshot rows stored (0 or 1).
    pub fn count(&self) -> Result<usize> {
        let n: i64 = self
            .conn()?
            .query_row("SELECT COUNT(*) FROM account_snapshots", [], |row| row.get(0))
            .map_err(db_err)?;
        Ok(n as usize)
    }
}

impl SnapshotStore for SqliteSnapshotStore {
    fn save(&self, snapshot: &SessionSnapshot) -> Result<()> {
        let body = serde_json::to_string(snapshot)?;
        self.conn()?
            .execute(
                "INSERT OR REPLACE INTO account_snapshots (id, updated_at_ms, body) VALUES (1, ?1, ?2)",
                params![snapshot.account.updated_at_ms, body],
            )
            .map_err(db_err)?;
        debug!(updated_at_ms = snapshot.account.updated_at_ms, "snapshot row replaced");
        Ok(())
    }

    fn load(&self) -> Result<Option<SessionSnapshot>> {
        let body: Option<String> = self
            .conn()?
            .query_row(
                "SELECT body FROM account_snapshots WHERE id = 1",
                [],
                |row| row.get(0),
            )
            .optional()
            .map_err(db_err)?;
        body.map(|b| serde_json::from_str(&b).map_err(Error::from))
            .transpose()
    }
}
