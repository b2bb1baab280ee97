//! Typed MsgPack layer over the ordered key-value engine.
//!
//! Everything the hub persists goes through [`Store`]: values are
//! MsgPack-encoded structs, keys are ASCII strings with `/`-separated
//! prefixes (`raw/`, `sens/<name>/`, `sensinfo/`).  The encoding is stable
//! across restarts and shared with the RPC wire.

pub mod kv;

use std::sync::Mutex;

use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::trace;

pub use kv::{Kv, KvError, SqliteKv};

const SCAN_BATCH: usize = 256;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("key not found")]
    NotFound,
    #[error(transparent)]
    Engine(#[from] KvError),
    #[error("encoding value for key {key}: {source}")]
    Encode { key: String, source: rmp_serde::encode::Error },
    #[error("decoding value for key {key}: {source}")]
    Decode { key: String, source: rmp_serde::decode::Error },
    #[error("bad key: {0}")]
    BadKey(String),
    #[error("{0}")]
    Aborted(String),
}

/// Shared typed store.  All engine access is funneled through one mutex;
/// the critical sections are short (a point lookup or one scan batch).
pub struct Store {
    kv: Mutex<Box<dyn Kv>>,
}

impl Store {
    pub fn new(kv: Box<dyn Kv>) -> Self {
        Store { kv: Mutex::new(kv) }
    }

    /// Look a key up and decode its value.
    pub fn get<T: DeserializeOwned>(&self, key: &str) -> Result<T, StoreError> {
        trace!(key, "get");
        let data = self
            .kv
            .lock()
            .expect("kv lock")
            .get(key.as_bytes())?
            .ok_or(StoreError::NotFound)?;
        rmp_serde::from_slice(&data)
            .map_err(|source| StoreError::Decode { key: key.to_string(), source })
    }

    /// Encode and write a value; `None` deletes the key.
    pub fn put<T: Serialize>(&self, key: &str, value: Option<&T>) -> Result<(), StoreError> {
        trace!(key, "put");
        let mut kv = self.kv.lock().expect("kv lock");
        match value {
            Some(v) => {
                let data = rmp_serde::to_vec_named(v)
                    .map_err(|source| StoreError::Encode { key: key.to_string(), source })?;
                kv.put(key.as_bytes(), &data)?;
            }
            None => kv.delete(key.as_bytes())?,
        }
        Ok(())
    }

    /// Iterate the half-open key range `[from, to)` in order, decoding each
    /// value and handing it to `f`.  An empty `to` means "all keys sharing
    /// `from` as a prefix" (the limit becomes `from` + 0xFF).  The first
    /// error `f` returns aborts the iteration and is passed through.
    pub fn iterate<T, F>(&self, from: &str, to: &str, mut f: F) -> Result<(), StoreError>
    where
        T: DeserializeOwned,
        F: FnMut(&str, T) -> Result<(), StoreError>,
    {
        let mut cursor = from.as_bytes().to_vec();
        let upper = if to.is_empty() {
            let mut v = from.as_bytes().to_vec();
            v.push(0xFF);
            v
        } else {
            to.as_bytes().to_vec()
        };

        loop {
            let batch = self.kv.lock().expect("kv lock").scan(&cursor, &upper, SCAN_BATCH)?;
            let Some((last_key, _)) = batch.last() else {
                return Ok(());
            };
            // resume after the last key seen
            cursor = last_key.clone();
            cursor.push(0x00);

            let done = batch.len() < SCAN_BATCH;
            for (key_bytes, value_bytes) in batch {
                let key = String::from_utf8_lossy(&key_bytes);
                let value = rmp_serde::from_slice(&value_bytes)
                    .map_err(|source| StoreError::Decode { key: key.to_string(), source })?;
                f(&key, value)?;
            }
            if done {
                return Ok(());
            }
        }
    }

    /// One decoded scan batch, `[from, to)`, at most `limit` entries.
    pub fn scan<T: DeserializeOwned>(
        &self,
        from: &str,
        to: &str,
        limit: usize,
    ) -> Result<Vec<(String, T)>, StoreError> {
        let batch = self.kv.lock().expect("kv lock").scan(from.as_bytes(), to.as_bytes(), limit)?;
        batch
            .into_iter()
            .map(|(key_bytes, value_bytes)| {
                let key = String::from_utf8_lossy(&key_bytes).into_owned();
                let value = rmp_serde::from_slice(&value_bytes)
                    .map_err(|source| StoreError::Decode { key: key.clone(), source })?;
                Ok((key, value))
            })
            .collect()
    }
}
