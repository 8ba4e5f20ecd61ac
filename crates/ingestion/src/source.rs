//! Historical bar sources.
//!
//! The engine only sees the [`BarSource`] trait; storage is somebody else's
//! problem. Two implementations ship here: an in-memory source for tests and
//! replays, and a SQLite table reader.

use std::path::Path;

use cta_core::{Bar, Error, Interval, Result, TimestampMs};
use rusqlite::{params, Connection};
use tracing::{debug, info};

/// Something that can produce the bars for `[start, end)`.
pub trait BarSource {
    /// Load bars for one symbol/interval with `start <= ts_ms < end`.
    fn load(
        &self,
        symbol: &str,
        interval: Interval,
        start: TimestampMs,
        end: TimestampMs,
    ) -> Result<Vec<Bar>>;
}

/// In-memory bar source.
///
/// Bars are returned in insertion order, unsorted, so callers see exactly
/// the sequence they supplied.
#[derive(Debug, Clone, Default)]
pub struct VecBarSource {
    bars: Vec<Bar>,
}

impl VecBarSource {
    pub fn new(bars: Vec<Bar>) -> Self {
        Self { bars }
    }

    pub fn len(&self) -> usize {
        self.bars.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bars.is_empty()
    }
}

impl BarSource for VecBarSource {
    fn load(
        &self,
        symbol: &str,
        interval: Interval,
        start: TimestampMs,
        end: TimestampMs,
    ) -> Result<Vec<Bar>> {
        let bars: Vec<Bar> = self
            .bars
            .iter()
            .filter(|b| b.symbol == symbol && b.interval == interval)
            .filter(|b| b.ts_ms >= start && b.ts_ms < end)
            .cloned()
            .collect();
        debug!(symbol, count = bars.len(), "loaded bars from memory");
        Ok(bars)
    }
}

fn db_err(err: rusqlite::Error) -> Error {
    Error::database(err.to_string())
}

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS bars (
    symbol   TEXT    NOT NULL,
    interval TEXT    NOT NULL,
    ts_ms    INTEGER NOT NULL,
    open     REAL    NOT NULL,
    high     REAL    NOT NULL,
    low      REAL    NOT NULL,
    close    REAL    NOT NULL,
    volume   REAL    NOT NULL,
    PRIMARY KEY (symbol, interval, ts_ms)
);";

/// Bar source backed by a SQLite `bars` table.
pub struct SqliteBarSource {
    conn: Connection,
}

impl SqliteBarSource {
    /// Open (or create) a database file.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let conn = Connection::open(path.as_ref()).map_err(db_err)?;
        Self::with_connection(conn)
    }

    /// Private in-memory database.
    pub fn in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().map_err(db_err)?;
        Self::with_connection(conn)
    }

    fn with_connection(conn: Connection) -> Result<Self> {
        conn.execute_batch(SCHEMA).map_err(db_err)?;
        Ok(Self { conn })
    }

    /// Upsert bars in a single transaction. Returns the number written.
    pub fn insert_bars(&mut self, bars: &[Bar]) -> Result<usize> {
        let tx = self.conn.transaction().map_err(db_err)?;
        {
            let mut stmt = tx
                .prepare(
                    "INSERT OR REPLACE INTO bars
                     (symbol, interval, ts_ms, open, high, low, close, volume)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                )
                .map_err(db_err)?;
            for bar in bars {
                bar.validate()?;
                stmt.execute(params![
                    bar.symbol,
                    bar.interval.as_str(),
                    bar.ts_ms,
                    bar.open,
                    bar.high,
                    bar.low,
                    bar.close,
                    bar.volume,
                ])
                .map_err(db_err)?;
            }
        }
        tx.commit().map_err(db_err)?;
        info!(count = bars.len(), "stored bars");
        Ok(bars.len())
    }
}

impl BarSource for SqliteBarSource {
    fn load(
        &self,
        symbol: &str,
        interval: Interval,
        start: TimestampMs,
        end: TimestampMs,
    ) -> Result<Vec<Bar>> {
        let mut stmt = self
            .conn
            .prepare(
                "SELECT ts_ms, open, high, low, close, volume FROM bars
                 WHERE symbol = ?1 AND interval = ?2 AND ts_ms >= ?3 AND ts_ms < ?4
                 ORDER BY ts_ms ASC",
            )
            .map_err(db_err)?;

        let rows = stmt
            .query_map(params![symbol, interval.as_str(), start, end], |row| {
                Ok(Bar {
                    symbol: symbol.to_string(),
                    interval,
                    ts_ms: row.get(0)?,
                    open: row.get(1)?,
                    high: row.get(2)?,
                    low: row.get(3)?,
                    close: row.get(4)?,
                    volume: row.get(5)?,
                })
            })
            .map_err(db_err)?;

        let bars = rows.collect::<std::result::Result<Vec<_>, _>>().map_err(db_err)?;
        info!(symbol, interval = interval.as_str(), count = bars.len(), "loaded bars from sqlite");
        Ok(bars)
    }
}
