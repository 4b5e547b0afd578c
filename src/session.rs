//! Session types and the per-pane session table.

use std::collections::HashMap;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use portable_pty::{ChildKiller, MasterPty};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::dialect::ShellKind;

/// Caller-assigned identifier of a pane.
#[derive(Clone, Debug, Hash, Eq, PartialEq, Ord, PartialOrd, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PaneId(String);

impl PaneId {
    /// Create a pane identifier.
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// The identifier as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for PaneId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for PaneId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

impl From<String> for PaneId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

impl From<&PaneId> for PaneId {
    fn from(id: &PaneId) -> Self {
        id.clone()
    }
}

/// Pane dimensions in rows and columns.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct PaneSize {
    /// Number of rows.
    pub rows: u16,
    /// Number of columns.
    pub cols: u16,
}

impl PaneSize {
    /// Create a new pane size.
    #[must_use]
    pub fn new(rows: u16, cols: u16) -> Self {
        Self { rows, cols }
    }
}

impl Default for PaneSize {
    fn default() -> Self {
        Self::new(24, 80)
    }
}

/// Lifecycle state of a pane.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum SessionState {
    /// No session is bound to the pane.
    Absent,
    /// A process is being spawned for the pane.
    Starting,
    /// The process is running.
    Running,
    /// The process has exited and remaining output is being drained.
    Exiting,
}

/// Read-only description of a live session.
#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionInfo {
    /// Pane the session is bound to.
    pub pane_id: PaneId,
    /// Interpreter the session was started with.
    pub shell_kind: ShellKind,
    /// Working directory of the process.
    pub working_directory: PathBuf,
    /// OS process identifier, when the platform reports one.
    pub pid: Option<u32>,
    /// When the session was started.
    pub started_at: DateTime<Utc>,
}

/// A live interactive process bound to one pane.
pub(crate) struct Session {
    pub info: SessionInfo,
    /// Distinguishes successive sessions of the same pane.
    pub generation: u64,
    pub input_tx: mpsc::Sender<Vec<u8>>,
    pub pty_master: Box<dyn MasterPty + Send>,
    pub killer: Box<dyn ChildKiller + Send + Sync>,
    pub forwarder: JoinHandle<()>,
    pub exiting: bool,
}

impl Session {
    /// Send the termination signal. The exit event follows asynchronously.
    pub fn terminate(&mut self) {
        if let Err(e) = self.killer.kill() {
            tracing::debug!("kill for pane {} failed: {}", self.info.pane_id, e);
        }
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("info", &self.info)
            .field("generation", &self.generation)
            .field("exiting", &self.exiting)
            .finish_non_exhaustive()
    }
}

/// In-memory map from pane to its single live session.
#[derive(Debug, Default)]
pub(crate) struct SessionTable {
    sessions: HashMap<PaneId, Session>,
}

impl SessionTable {
    /// Bind `session` to its pane, returning any session it displaced.
    pub fn insert(&mut self, session: Session) -> Option<Session> {
        self.sessions.insert(session.info.pane_id.clone(), session)
    }

    pub fn get(&self, pane_id: &PaneId) -> Option<&Session> {
        self.sessions.get(pane_id)
    }

    pub fn get_mut(&mut self, pane_id: &PaneId) -> Option<&mut Session> {
        self.sessions.get_mut(pane_id)
    }

    pub fn remove(&mut self, pane_id: &PaneId) -> Option<Session> {
        self.sessions.remove(pane_id)
    }

    /// Remove the pane's session only if it is still the given generation.
    pub fn remove_generation(&mut self, pane_id: &PaneId, generation: u64) -> Option<Session> {
        if self.sessions.get(pane_id)?.generation != generation {
            return None;
        }
        self.sessions.remove(pane_id)
    }

    pub fn drain(&mut self) -> Vec<Session> {
        self.sessions.drain().map(|(_, session)| session).collect()
    }

    pub fn infos(&self) -> Vec<SessionInfo> {
        let mut infos: Vec<_> = self.sessions.values().map(|s| s.info.clone()).collect();
        infos.sort_by(|a, b| a.pane_id.cmp(&b.pane_id));
        infos
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }
}
