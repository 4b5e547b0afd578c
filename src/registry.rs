//! Durable registry of process identifiers owned by this application's sessions.
//!
//! The on-disk form is the snapshot used by the next run's recovery sweep, so
//! every write goes through write-temp-then-rename and every read degrades to
//! "no tracked processes" instead of failing.

use std::collections::BTreeSet;
use std::fs::{self, File};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;

use crate::error::{Error, Result};

/// Schema version written into every registry file.
pub const REGISTRY_VERSION: u32 = 1;

#[derive(Debug, Serialize, Deserialize)]
struct RegistryFile {
    version: u32,
    #[serde(default)]
    pids: Vec<i64>,
}

/// Process identifiers tracked by one controller instance.
#[derive(Debug)]
pub struct ProcessRegistry {
    path: PathBuf,
    pids: BTreeSet<u32>,
}

impl ProcessRegistry {
    /// Create an empty registry stored at `path`. Nothing is read or written.
    #[must_use]
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            pids: BTreeSet::new(),
        }
    }

    /// Location of the registry file.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Read the identifiers persisted by a previous run.
    #[must_use]
    pub fn load(&self) -> BTreeSet<u32> {
        load_registry(&self.path)
    }

    /// Atomically replace the file with the current in-memory set.
    ///
    /// # Errors
    /// Returns an error if the temporary file cannot be written or renamed.
    pub fn persist(&self) -> Result<()> {
        write_registry(&self.path, &self.pids).map_err(Error::Registry)
    }

    /// Start tracking `pid`. Returns false if it was already tracked.
    pub fn track(&mut self, pid: u32) -> bool {
        self.pids.insert(pid)
    }

    /// Stop tracking `pid`. Returns false if it was not tracked.
    pub fn untrack(&mut self, pid: u32) -> bool {
        self.pids.remove(&pid)
    }

    /// Forget every tracked identifier.
    pub fn clear(&mut self) {
        self.pids.clear();
    }

    /// Currently tracked identifiers.
    #[must_use]
    pub fn pids(&self) -> &BTreeSet<u32> {
        &self.pids
    }
}

/// Read a registry file, recovering what it can from corrupt payloads.
fn load_registry(path: &Path) -> BTreeSet<u32> {
    let raw = match fs::read_to_string(path) {
        Ok(raw) => raw,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return BTreeSet::new(),
        Err(e) => {
            tracing::warn!(path = %path.display(), error = %e, "failed to read process registry");
            return BTreeSet::new();
        }
    };

    if raw.trim().is_empty() {
        return BTreeSet::new();
    }

    match serde_json::from_str::<RegistryFile>(&raw) {
        Ok(file) => {
            if file.version > REGISTRY_VERSION {
                tracing::debug!(
                    "registry written by newer schema version {}, reading pids only",
                    file.version
                );
            }
            file.pids.into_iter().filter_map(valid_pid).collect()
        }
        Err(e) => match recover_pids(&raw) {
            Some(pids) => {
                tracing::warn!(
                    path = %path.display(),
                    error = %e,
                    recovered = pids.len(),
                    "process registry was corrupt, recovered identifiers"
                );
                pids
            }
            None => {
                tracing::warn!(
                    path = %path.display(),
                    error = %e,
                    "process registry was corrupt and unrecoverable"
                );
                BTreeSet::new()
            }
        },
    }
}

static PIDS_ARRAY: LazyLock<Option<Regex>> =
    LazyLock::new(|| Regex::new(r#""pids"\s*:\s*\[([^\]]*)"#).ok());

static INTEGER_TOKEN: LazyLock<Option<Regex>> =
    LazyLock::new(|| Regex::new(r"-?\d+(?:\.\d+)?").ok());

/// Best-effort scan of a damaged payload for the `"pids": [...]` array.
///
/// Returns `None` when no such array is present. A truncated array (no closing
/// bracket) is read up to the end of the payload.
#[must_use]
pub fn recover_pids(raw: &str) -> Option<BTreeSet<u32>> {
    let body = PIDS_ARRAY.as_ref()?.captures(raw)?.get(1)?.as_str();
    let tokens = INTEGER_TOKEN.as_ref()?;
    Some(
        tokens
            .find_iter(body)
            .filter(|token| !token.as_str().contains('.'))
            .filter_map(|token| token.as_str().parse::<i64>().ok())
            .filter_map(valid_pid)
            .collect(),
    )
}

fn valid_pid(value: i64) -> Option<u32> {
    if value <= 0 || value > i64::from(i32::MAX) {
        return None;
    }
    u32::try_from(value).ok()
}

/// Write `pids` to `path` via a temporary file and rename.
fn write_registry(path: &Path, pids: &BTreeSet<u32>) -> io::Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)?;
        }
    }

    let file = RegistryFile {
        version: REGISTRY_VERSION,
        pids: pids.iter().map(|pid| i64::from(*pid)).collect(),
    };
    let json = serde_json::to_vec_pretty(&file).map_err(io::Error::other)?;

    let temp_path = path.with_extension("tmp");
    let mut temp = File::create(&temp_path)?;
    temp.write_all(&json)?;
    temp.sync_all()?;
    drop(temp);

    fs::rename(&temp_path, path)
}

#[derive(Clone, Debug, Default)]
struct Snapshot {
    seq: u64,
    pids: BTreeSet<u32>,
}

/// Background task that persists registry snapshots off the caller's path.
///
/// Only the newest snapshot is written; intermediate ones are skipped.
pub(crate) struct RegistryWriter {
    snapshot_tx: watch::Sender<Snapshot>,
    persisted_rx: watch::Receiver<u64>,
}

impl RegistryWriter {
    /// Spawn the writer task. Must be called within a Tokio runtime.
    pub(crate) fn spawn(path: PathBuf) -> Self {
        let (snapshot_tx, mut snapshot_rx) = watch::channel(Snapshot::default());
        let (persisted_tx, persisted_rx) = watch::channel(0u64);

        tokio::spawn(async move {
            while snapshot_rx.changed().await.is_ok() {
                let snapshot = snapshot_rx.borrow_and_update().clone();
                let registry = ProcessRegistry {
                    path: path.clone(),
                    pids: snapshot.pids,
                };
                match tokio::task::spawn_blocking(move || registry.persist()).await {
                    Ok(Ok(())) => tracing::debug!("persisted process registry (seq {})", snapshot.seq),
                    Ok(Err(e)) => {
                        tracing::warn!(path = %path.display(), error = %e, "failed to persist process registry");
                    }
                    Err(e) => tracing::warn!("registry write task failed: {}", e),
                }
                let _ = persisted_tx.send(snapshot.seq);
            }
            tracing::debug!("Registry writer finished");
        });

        Self {
            snapshot_tx,
            persisted_rx,
        }
    }

    /// Queue `pids` as the next snapshot to write.
    pub(crate) fn submit(&self, pids: &BTreeSet<u32>) {
        self.snapshot_tx.send_modify(|snapshot| {
            snapshot.seq += 1;
            snapshot.pids.clone_from(pids);
        });
    }

    /// Wait until the most recently submitted snapshot has been written.
    pub(crate) async fn flush(&self) {
        let target = self.snapshot_tx.borrow().seq;
        let mut persisted = self.persisted_rx.clone();
        let _ = persisted.wait_for(|seq| *seq >= target).await;
    }
}
