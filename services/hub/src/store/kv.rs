//! Ordered byte-key storage engine.
//!
//! The hub only assumes an ordered key -> value map with range scans; the
//! [`Kv`] trait is that seam.  The provided engine keeps everything in one
//! SQLite table with a BLOB primary key, which SQLite orders by memcmp —
//! exactly the ordering the key schemes rely on.

use std::path::Path;

use rusqlite::{Connection, params};

#[derive(Debug, thiserror::Error)]
#[error("kv engine: {0}")]
pub struct KvError(pub String);

impl From<rusqlite::Error> for KvError {
    fn from(e: rusqlite::Error) -> Self {
        KvError(e.to_string())
    }
}

/// An ordered byte-keyed persistent map.
pub trait Kv: Send {
    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>, KvError>;

    fn put(&mut self, key: &[u8], value: &[u8]) -> Result<(), KvError>;

    fn delete(&mut self, key: &[u8]) -> Result<(), KvError>;

    /// Up to `limit` entries with `from <= key < to`, ascending by key.
    fn scan(&self, from: &[u8], to: &[u8], limit: usize)
    -> Result<Vec<(Vec<u8>, Vec<u8>)>, KvError>;
}

/// SQLite-backed [`Kv`].
pub struct SqliteKv {
    conn: Connection,
}

impl SqliteKv {
    /// Open (or create) the store at `path`.
    pub fn open(path: &Path) -> Result<Self, KvError> {
        let conn = Connection::open(path)?;
        Self::init(conn)
    }

    /// Volatile in-memory store for tests.
    pub fn open_in_memory() -> Result<Self, KvError> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> Result<Self, KvError> {
        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA synchronous = NORMAL;
             CREATE TABLE IF NOT EXISTS kv (
                 key   BLOB PRIMARY KEY,
                 value BLOB NOT NULL
             ) WITHOUT ROWID;",
        )?;
        Ok(SqliteKv { conn })
    }
}

impl Kv for SqliteKv {
    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>, KvError> {
        let mut stmt = self.conn.prepare_cached("SELECT value FROM kv WHERE key = ?1")?;
        let mut rows = stmt.query(params![key])?;
        match rows.next()? {
            Some(row) => Ok(Some(row.get(0)?)),
            None => Ok(None),
        }
    }

    fn put(&mut self, key: &[u8], value: &[u8]) -> Result<(), KvError> {
        self.conn
            .prepare_cached("INSERT OR REPLACE INTO kv (key, value) VALUES (?1, ?2)")?
            .execute(params![key, value])?;
        Ok(())
    }

    fn delete(&mut self, key: &[u8]) -> Result<(), KvError> {
        self.conn.prepare_cached("DELETE FROM kv WHERE key = ?1")?.execute(params![key])?;
        Ok(())
    }

    fn scan(
        &self,
        from: &[u8],
        to: &[u8],
        limit: usize,
    ) -> Result<Vec<(Vec<u8>, Vec<u8>)>, KvError> {
        let mut stmt = self.conn.prepare_cached(
            "SELECT key, value FROM kv WHERE key >= ?1 AND key < ?2 ORDER BY key LIMIT ?3",
        )?;
        let rows = stmt.query_map(params![from, to, limit as i64], |row| {
            Ok((row.get::<_, Vec<u8>>(0)?, row.get::<_, Vec<u8>>(1)?))
        })?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }
}
