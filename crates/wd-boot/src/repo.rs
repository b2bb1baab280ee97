//! Sketch repository: pairing table, node-type → sketch map, firmware cache.
//!
//! Backed by a single JSON config file holding two objects back to back —
//! the pairing map (`hwIdHex → [nodeType, groupId, nodeId]`) and the sketch
//! map (`nodeType → hexFile`) — plus the Intel-HEX files it references.
//! `#` starts a comment anywhere on a line.
//!
//! The config file and every referenced HEX file are watched; a config
//! change rebuilds all three maps wholesale, a HEX change reloads just that
//! cache entry.  Reloads run on the single watcher thread and swap state
//! under one mutex, so readers never observe a half-updated repository.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, mpsc};

use notify::{RecursiveMode, Watcher};
use tracing::{debug, info, warn};

use crate::hexfile::{self, HexError};

/// Key under which the default assignment for unknown hardware IDs lives.
pub const DEFAULT_HW_ID: &str = "00000000000000000000000000000000";

/// One pairing table row.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PairingInfo {
    pub node_type: u16,
    pub group_id: u8,
    pub node_id: u8,
}

#[derive(Debug, thiserror::Error)]
pub enum RepoError {
    #[error("reading {path}: {source}")]
    Io { path: PathBuf, source: std::io::Error },
    #[error("config JSON: {0}")]
    Json(#[from] serde_json::Error),
    #[error("config is missing the {0} object")]
    MissingSection(&'static str),
    #[error("no sketch is configured for node type {0}")]
    NoSketch(u16),
    #[error("sketch {path}: {source}")]
    Hex { path: PathBuf, source: HexError },
    #[error("file watcher: {0}")]
    Watch(#[from] notify::Error),
}

#[derive(Default)]
struct RepoInner {
    pairing: HashMap<String, PairingInfo>,
    sketches: HashMap<u16, String>,
    software: HashMap<u16, Arc<Vec<u8>>>,
}

/// Shared, hot-reloadable sketch repository.
pub struct SketchRepo {
    config_path: PathBuf,
    /// HEX paths in the config are relative to the config file's directory.
    dir: PathBuf,
    inner: Mutex<RepoInner>,
}

impl SketchRepo {
    /// Load the repository from its config file.  A missing or unparsable
    /// config is fatal at startup (later reload failures only log).
    pub fn open(config_path: impl Into<PathBuf>) -> Result<Arc<Self>, RepoError> {
        let config_path: PathBuf = config_path.into();
        let config_path = config_path.canonicalize().unwrap_or(config_path);
        let dir = config_path.parent().map_or_else(|| PathBuf::from("."), Path::to_path_buf);
        let repo = SketchRepo { config_path, dir, inner: Mutex::new(RepoInner::default()) };
        repo.reload_config()?;
        Ok(Arc::new(repo))
    }

    /// Look up a hex-encoded hardware ID, falling back to the all-zero
    /// default assignment for unknown nodes.
    pub fn pair_lookup(&self, hw_id_hex: &str) -> Option<PairingInfo> {
        let inner = self.inner.lock().expect("repo lock");
        inner.pairing.get(hw_id_hex).or_else(|| inner.pairing.get(DEFAULT_HW_ID)).copied()
    }

    /// Resolve the firmware image for a node type, loading and caching the
    /// HEX file on first use.
    pub fn find_software(&self, node_type: u16) -> Result<Arc<Vec<u8>>, RepoError> {
        let mut inner = self.inner.lock().expect("repo lock");
        if let Some(sw) = inner.software.get(&node_type) {
            debug!(node_type, "using cached software");
            return Ok(Arc::clone(sw));
        }
        let file = inner.sketches.get(&node_type).ok_or(RepoError::NoSketch(node_type))?;
        let path = self.dir.join(file);
        let sw = Arc::new(load_hex(&path)?);
        info!(node_type, path = %path.display(), bytes = sw.len(), "loaded sketch");
        inner.software.insert(node_type, Arc::clone(&sw));
        Ok(sw)
    }

    /// Absolute paths of every HEX file the current config references.
    pub fn hex_paths(&self) -> Vec<PathBuf> {
        let inner = self.inner.lock().expect("repo lock");
        inner
            .sketches
            .values()
            .map(|f| {
                let p = self.dir.join(f);
                p.canonicalize().unwrap_or(p)
            })
            .collect()
    }

    /// Re-read the config file and swap in fresh maps (software cache
    /// cleared).  On failure the previous state is kept.
    pub fn reload_config(&self) -> Result<(), RepoError> {
        let text = std::fs::read_to_string(&self.config_path)
            .map_err(|source| RepoError::Io { path: self.config_path.clone(), source })?;
        let (pairing, sketches) = parse_config(&text)?;
        for (hw_id, info) in &pairing {
            debug!(hw_id, node_type = info.node_type, group = info.group_id, node = info.node_id,
                "pairing entry");
        }
        for (node_type, file) in &sketches {
            debug!(node_type, file, "sketch entry");
        }
        let mut inner = self.inner.lock().expect("repo lock");
        *inner = RepoInner { pairing, sketches, software: HashMap::new() };
        Ok(())
    }

    /// Re-parse one changed HEX file into the cache.  On parse failure the
    /// stale entry is evicted so the next lookup retries from disk.
    pub fn reload_hex(&self, path: &Path) {
        let mut inner = self.inner.lock().expect("repo lock");
        let types: Vec<u16> = inner
            .sketches
            .iter()
            .filter(|(_, f)| {
                let p = self.dir.join(f.as_str());
                p.canonicalize().unwrap_or(p) == path
            })
            .map(|(&t, _)| t)
            .collect();
        if types.is_empty() {
            return;
        }
        match load_hex(path) {
            Ok(sw) => {
                let sw = Arc::new(sw);
                info!(path = %path.display(), bytes = sw.len(), "reloaded sketch");
                for t in types {
                    inner.software.insert(t, Arc::clone(&sw));
                }
            }
            Err(e) => {
                warn!(path = %path.display(), error = %e, "sketch reload failed, evicting");
                for t in types {
                    inner.software.remove(&t);
                }
            }
        }
    }
}

fn load_hex(path: &Path) -> Result<Vec<u8>, RepoError> {
    let text = std::fs::read_to_string(path)
        .map_err(|source| RepoError::Io { path: path.to_path_buf(), source })?;
    hexfile::parse(&text).map_err(|source| RepoError::Hex { path: path.to_path_buf(), source })
}

// ---------------------------------------------------------------------------
// Config parsing
// ---------------------------------------------------------------------------

type ConfigMaps = (HashMap<String, PairingInfo>, HashMap<u16, String>);

fn parse_config(text: &str) -> Result<ConfigMaps, RepoError> {
    // strip # comments before handing the rest to the JSON parser
    let cleaned: String =
        text.lines().map(|l| l.split('#').next().unwrap_or("")).collect::<Vec<_>>().join("\n");

    let mut stream = serde_json::Deserializer::from_str(&cleaned).into_iter::<serde_json::Value>();
    let pairing_value = stream.next().ok_or(RepoError::MissingSection("pairing"))??;
    let sketch_value = stream.next().ok_or(RepoError::MissingSection("sketch"))??;

    let pairing_raw: HashMap<String, [u16; 3]> = serde_json::from_value(pairing_value)?;
    let pairing = pairing_raw
        .into_iter()
        .map(|(hw_id, v)| {
            (hw_id, PairingInfo { node_type: v[0], group_id: v[1] as u8, node_id: v[2] as u8 })
        })
        .collect();

    let sketches_raw: HashMap<String, String> = serde_json::from_value(sketch_value)?;
    let sketches = sketches_raw
        .into_iter()
        .filter_map(|(k, v)| k.parse::<u16>().ok().map(|t| (t, v)))
        .collect();

    Ok((pairing, sketches))
}

// ---------------------------------------------------------------------------
// File watching
// ---------------------------------------------------------------------------

/// Watch the config file and all referenced HEX files; reload on change.
///
/// Runs until the process exits.  The watcher and its thread are detached
/// on purpose: the repository lives as long as the hub does.
pub fn spawn_watcher(repo: &Arc<SketchRepo>) -> Result<(), RepoError> {
    let (tx, rx) = mpsc::channel();
    let mut watcher = notify::recommended_watcher(move |res| {
        let _ = tx.send(res);
    })?;

    watcher.watch(&repo.config_path, RecursiveMode::NonRecursive)?;
    let mut watched: Vec<PathBuf> = Vec::new();
    for p in repo.hex_paths() {
        match watcher.watch(&p, RecursiveMode::NonRecursive) {
            Ok(()) => watched.push(p),
            Err(e) => warn!(path = %p.display(), error = %e, "cannot watch sketch"),
        }
    }

    let repo = Arc::clone(repo);
    std::thread::Builder::new()
        .name("sketch-watcher".into())
        .spawn(move || watcher_loop(&repo, watcher, watched, &rx))
        .map_err(|source| RepoError::Io { path: PathBuf::from("<watcher thread>"), source })?;
    Ok(())
}

fn watcher_loop(
    repo: &Arc<SketchRepo>,
    mut watcher: notify::RecommendedWatcher,
    mut watched: Vec<PathBuf>,
    rx: &mpsc::Receiver<Result<notify::Event, notify::Error>>,
) {
    for res in rx {
        let event = match res {
            Ok(ev) => ev,
            Err(e) => {
                warn!(error = %e, "watch error");
                continue;
            }
        };
        if !(event.kind.is_create() || event.kind.is_modify()) {
            continue;
        }

        if event.paths.iter().any(|p| *p == repo.config_path) {
            info!(config = %repo.config_path.display(), "boot config changed, reloading");
            match repo.reload_config() {
                Ok(()) => {
                    // the sketch set may have changed; re-register HEX watches
                    for p in watched.drain(..) {
                        let _ = watcher.unwatch(&p);
                    }
                    for p in repo.hex_paths() {
                        match watcher.watch(&p, RecursiveMode::NonRecursive) {
                            Ok(()) => watched.push(p),
                            Err(e) => {
                                warn!(path = %p.display(), error = %e, "cannot watch sketch");
                            }
                        }
                    }
                }
                Err(e) => warn!(error = %e, "config reload failed, keeping previous"),
            }
            continue;
        }

        for path in &event.paths {
            if watched.contains(path) {
                repo.reload_hex(path);
            }
        }
    }
}
