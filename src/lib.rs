//! # Panekeeper
//!
//! Terminal session and process lifecycle management for multi-pane workspaces.
//!
//! Panekeeper owns every shell process a workspace spawns. Each pane runs in its
//! own PTY (pseudo-terminal); process identifiers are recorded in a durable
//! registry so that, after a crash, the next run can terminate whatever was
//! left behind.
//!
//! ## Features
//!
//! - **PTY Sessions**: One interactive shell per pane using `portable-pty`
//! - **Crash Recovery**: Orphaned processes from a previous run are reaped at start-up
//! - **Dialect Proxying**: Extended-shell commands pasted into legacy panes still run
//! - **Structured Commands**: One-shot runs with captured output and exit code
//! - **Risk Tagging**: Destructive commands are flagged for confirmation UIs
//!
//! ## Example
//!
//! ```no_run
//! use panekeeper::{ControllerConfig, PaneEvent, PaneId, SessionController, ShellKind};
//!
//! #[tokio::main]
//! async fn main() -> panekeeper::Result<()> {
//!     let controller = SessionController::new(ControllerConfig::for_app("my-workspace"));
//!     let mut events = controller.subscribe();
//!
//!     // Reap anything a previous crash left running
//!     controller.initialize().await;
//!
//!     let pane = PaneId::from("left");
//!     controller.start_session(&pane, ShellKind::PosixLike, "/tmp").await;
//!     controller.execute_in_session(&pane, "echo hello", false).await?;
//!
//!     while let Some(event) = events.recv().await {
//!         if let PaneEvent::Data { data, .. } = &event {
//!             print!("{}", String::from_utf8_lossy(data));
//!         }
//!     }
//!
//!     controller.shutdown().await;
//!     Ok(())
//! }
//! ```

#![forbid(unsafe_code)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod classifier;
mod config;
mod controller;
pub mod dialect;
mod error;
mod events;
mod pty;
pub mod reaper;
pub mod registry;
mod runner;
mod session;

// Re-export public API
pub use classifier::is_destructive;
pub use config::{ControllerConfig, WorkspacePolicy, REGISTRY_FILE_NAME};
pub use controller::{SessionController, SUBMIT_TOKEN};
pub use dialect::{SyntaxHeuristic, DialectProxy, LaunchSpec, ShellKind};
pub use error::{Error, Result};
pub use events::{EventBus, EventStream, PaneEvent};
pub use pty::{SPAWN_FAILED_EXIT_CODE, UNKNOWN_EXIT_CODE};
pub use reaper::{OsReaper, ProcessReaper, SignalOutcome, SweepReport};
pub use registry::ProcessRegistry;
pub use runner::{CommandRecord, CommandRunner};
pub use session::{PaneId, PaneSize, SessionInfo, SessionState};
