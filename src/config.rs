//! Controller configuration.

use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{Error, Result};
use crate::session::PaneSize;

/// File name of the process registry inside the application data directory.
pub const REGISTRY_FILE_NAME: &str = "process-registry.json";

/// How working directories handed to the controller are validated.
#[derive(Clone, Debug, Default)]
pub enum WorkspacePolicy {
    /// The caller has already validated the directory.
    #[default]
    Trusted,
    /// The directory must resolve under one of these roots.
    Enforce(Vec<PathBuf>),
}

impl WorkspacePolicy {
    /// Check `cwd` against the policy.
    ///
    /// # Errors
    /// Returns [`Error::OutsideWorkspace`] if the directory does not exist or
    /// lies outside every root.
    pub fn check(&self, cwd: &Path) -> Result<()> {
        let Self::Enforce(roots) = self else {
            return Ok(());
        };
        let outside = || Error::OutsideWorkspace(cwd.to_path_buf());
        let resolved = cwd.canonicalize().map_err(|_| outside())?;
        let inside = roots
            .iter()
            .filter_map(|root| root.canonicalize().ok())
            .any(|root| resolved.starts_with(root));
        if inside {
            Ok(())
        } else {
            Err(outside())
        }
    }
}

/// Configuration for the session controller.
#[derive(Clone, Debug)]
pub struct ControllerConfig {
    /// Where the process registry is persisted.
    pub registry_path: PathBuf,
    /// Size of newly spawned PTYs.
    pub initial_size: PaneSize,
    /// Delay before the second submit of a forced submission.
    pub resubmit_delay: Duration,
    /// How long output is drained after a process reports exit.
    pub exit_drain_grace: Duration,
    /// How long replace and shutdown wait for a stopped session's exit event.
    pub stop_grace: Duration,
    /// Upper bound on structured command runtime. `None` means unbounded.
    pub command_timeout: Option<Duration>,
    /// Validation applied to working directories.
    pub workspace_policy: WorkspacePolicy,
    /// Extra environment for spawned shells.
    pub env: Vec<(String, String)>,
}

impl ControllerConfig {
    /// Create a configuration persisting the registry at `registry_path`.
    #[must_use]
    pub fn new(registry_path: impl Into<PathBuf>) -> Self {
        Self {
            registry_path: registry_path.into(),
            initial_size: PaneSize::default(),
            resubmit_delay: Duration::from_millis(50),
            exit_drain_grace: Duration::from_millis(200),
            stop_grace: Duration::from_secs(1),
            command_timeout: None,
            workspace_policy: WorkspacePolicy::Trusted,
            env: vec![
                ("TERM".to_string(), "xterm-256color".to_string()),
                ("COLORTERM".to_string(), "truecolor".to_string()),
            ],
        }
    }

    /// Configuration with the registry under the per-user data directory of `app_name`.
    ///
    /// Falls back to the temp directory when no data directory is known.
    #[must_use]
    pub fn for_app(app_name: &str) -> Self {
        let base = dirs::data_local_dir().unwrap_or_else(std::env::temp_dir);
        Self::new(base.join(app_name).join(REGISTRY_FILE_NAME))
    }

    /// Set the initial PTY size.
    #[must_use]
    pub fn initial_size(mut self, size: PaneSize) -> Self {
        self.initial_size = size;
        self
    }

    /// Set the delay before the forced second submit.
    #[must_use]
    pub fn resubmit_delay(mut self, delay: Duration) -> Self {
        self.resubmit_delay = delay;
        self
    }

    /// Set how long output is drained after exit.
    #[must_use]
    pub fn exit_drain_grace(mut self, grace: Duration) -> Self {
        self.exit_drain_grace = grace;
        self
    }

    /// Set how long stops wait for the exit event.
    #[must_use]
    pub fn stop_grace(mut self, grace: Duration) -> Self {
        self.stop_grace = grace;
        self
    }

    /// Cap structured command runtime.
    #[must_use]
    pub fn command_timeout(mut self, timeout: Duration) -> Self {
        self.command_timeout = Some(timeout);
        self
    }

    /// Require working directories to lie under `roots`.
    #[must_use]
    pub fn enforce_workspace_roots(mut self, roots: Vec<PathBuf>) -> Self {
        self.workspace_policy = WorkspacePolicy::Enforce(roots);
        self
    }

    /// Add an environment variable for spawned shells.
    #[must_use]
    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self::for_app(env!("CARGO_PKG_NAME"))
    }
}
