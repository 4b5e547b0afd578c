//! Error types for the panekeeper crate.

use std::path::PathBuf;

use thiserror::Error;

use crate::session::PaneId;

/// Result type alias using panekeeper's Error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in panekeeper operations.
#[derive(Debug, Error)]
pub enum Error {
    /// No live session is bound to the pane.
    #[error("no session for pane: {0}")]
    SessionNotFound(PaneId),

    /// The session's input channel has been closed.
    #[error("pane has been closed")]
    PaneClosed,

    /// Failed to spawn a PTY process.
    #[error("failed to spawn PTY: {0}")]
    PtySpawn(#[from] std::io::Error),

    /// Anyhow error from portable-pty.
    #[error("PTY error: {0}")]
    Pty(#[from] anyhow::Error),

    /// Failed to create PTY pair.
    #[error("failed to create PTY: {0}")]
    PtyCreate(String),

    /// PTY resize failed.
    #[error("failed to resize PTY: {0}")]
    Resize(String),

    /// A structured command could not be started.
    #[error("failed to spawn command '{command}': {source}")]
    CommandSpawn {
        /// The command text that was being launched.
        command: String,
        /// Underlying OS error.
        #[source]
        source: std::io::Error,
    },

    /// The working directory lies outside every configured workspace root.
    #[error("working directory is outside the workspace: {}", .0.display())]
    OutsideWorkspace(PathBuf),

    /// Reading or writing the process registry failed.
    #[error("process registry I/O failed: {0}")]
    Registry(#[source] std::io::Error),
}
