//! Session controller - owner of every interactive shell process.
//!
//! The controller binds at most one session to each pane, records every
//! session's process identifier in the [`ProcessRegistry`], and on the next
//! start-up terminates whatever a crashed run left behind.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use chrono::Utc;
use parking_lot::Mutex;
use tokio::task::JoinHandle;

use crate::config::ControllerConfig;
use crate::dialect::{launch_spec_for, SyntaxHeuristic, DialectProxy, ShellKind};
use crate::error::{Error, Result};
use crate::events::{EventBus, EventStream, PaneEvent};
use crate::pty::{self, PtyRequest, SessionObserver, SessionWiring, SPAWN_FAILED_EXIT_CODE};
use crate::reaper::{self, OsReaper, ProcessReaper, SweepReport};
use crate::registry::{ProcessRegistry, RegistryWriter};
use crate::runner::{CommandRecord, CommandRunner};
use crate::session::{PaneId, PaneSize, Session, SessionInfo, SessionState, SessionTable};

/// Keystroke that submits a line to the interpreter.
pub const SUBMIT_TOKEN: &[u8] = b"\r";

/// State guarded by the controller's lock. Never held across an await.
struct ControllerState {
    sessions: SessionTable,
    registry: ProcessRegistry,
    /// Panes with a spawn in flight. A stop removes the pane to cancel it.
    starting: HashSet<PaneId>,
}

struct Inner {
    config: ControllerConfig,
    state: Mutex<ControllerState>,
    events: EventBus,
    registry_writer: RegistryWriter,
    /// Serializes initialize, start and shutdown.
    lifecycle: tokio::sync::Mutex<()>,
    dialect: Arc<dyn DialectProxy>,
    reaper: Arc<dyn ProcessReaper>,
    runner: CommandRunner,
    next_generation: AtomicU64,
}

/// Central manager for all interactive sessions.
///
/// Cloning yields another handle to the same controller.
#[derive(Clone)]
pub struct SessionController {
    inner: Arc<Inner>,
}

impl SessionController {
    /// Create a controller with the default dialect heuristics and OS reaper.
    ///
    /// # Panics
    /// Panics if called outside a Tokio runtime.
    #[must_use]
    pub fn new(config: ControllerConfig) -> Self {
        Self::with_components(config, Arc::new(SyntaxHeuristic), Arc::new(OsReaper))
    }

    /// Create a controller with custom dialect handling and process reaping.
    ///
    /// # Panics
    /// Panics if called outside a Tokio runtime.
    #[must_use]
    pub fn with_components(
        config: ControllerConfig,
        dialect: Arc<dyn DialectProxy>,
        reaper: Arc<dyn ProcessReaper>,
    ) -> Self {
        let events = EventBus::new();
        let runner = CommandRunner::new(
            events.clone(),
            config.command_timeout,
            config.workspace_policy.clone(),
        );
        let registry_writer = RegistryWriter::spawn(config.registry_path.clone());
        let state = ControllerState {
            sessions: SessionTable::default(),
            registry: ProcessRegistry::new(config.registry_path.clone()),
            starting: HashSet::new(),
        };

        Self {
            inner: Arc::new(Inner {
                config,
                state: Mutex::new(state),
                events,
                registry_writer,
                lifecycle: tokio::sync::Mutex::new(()),
                dialect,
                reaper,
                runner,
                next_generation: AtomicU64::new(1),
            }),
        }
    }

    /// Subscribe to data and exit events of every pane.
    ///
    /// Every subscriber has its own unbounded queue and should be drained.
    #[must_use]
    pub fn subscribe(&self) -> EventStream {
        self.inner.events.subscribe()
    }

    /// Recover from a previous run: terminate every still-alive process it
    /// tracked, then persist the (empty) registry of this run.
    ///
    /// Call once at start-up, before starting sessions.
    pub async fn initialize(&self) -> SweepReport {
        let _lifecycle = self.inner.lifecycle.lock().await;

        let path = self.inner.config.registry_path.clone();
        let reaper = Arc::clone(&self.inner.reaper);
        let report = tokio::task::spawn_blocking(move || {
            let previous = ProcessRegistry::new(path).load();
            reaper::sweep(reaper.as_ref(), &previous)
        })
        .await
        .unwrap_or_else(|e| {
            tracing::warn!("recovery sweep task failed: {}", e);
            SweepReport::default()
        });

        self.inner.persist_registry();
        self.inner.registry_writer.flush().await;

        tracing::info!(
            tracked = report.tracked,
            signalled = report.signalled.len(),
            failed = report.failed.len(),
            "recovery sweep complete"
        );
        report
    }

    /// Start an interactive session for `pane_id`, replacing any existing one.
    ///
    /// Spawn failures are reported as an exit event with
    /// [`SPAWN_FAILED_EXIT_CODE`].
    pub async fn start_session(
        &self,
        pane_id: impl Into<PaneId>,
        kind: ShellKind,
        cwd: impl Into<PathBuf>,
    ) {
        let pane_id = pane_id.into();
        let cwd = cwd.into();
        let _lifecycle = self.inner.lifecycle.lock().await;

        if let Some(previous) = self.inner.detach(&pane_id) {
            tracing::debug!("replacing session for pane {}", pane_id);
            self.inner.await_exit(vec![previous]).await;
        }

        if let Err(e) = self.inner.config.workspace_policy.check(&cwd) {
            tracing::warn!(pane = %pane_id, error = %e, "refusing to start session");
            self.inner.publish_spawn_failure(&pane_id);
            return;
        }

        self.inner.state.lock().starting.insert(pane_id.clone());
        let request = PtyRequest {
            spec: launch_spec_for(kind),
            cwd: cwd.clone(),
            size: self.inner.config.initial_size,
            env: self.inner.config.env.clone(),
        };
        let spawned = tokio::task::spawn_blocking(move || pty::spawn_pty(&request)).await;

        let mut state = self.inner.state.lock();
        let cancelled = !state.starting.remove(&pane_id);

        let spawned = match spawned {
            Ok(Ok(spawned)) => spawned,
            Ok(Err(e)) => {
                drop(state);
                tracing::warn!(pane = %pane_id, error = %e, "failed to spawn session");
                self.inner.publish_spawn_failure(&pane_id);
                return;
            }
            Err(e) => {
                drop(state);
                tracing::warn!(pane = %pane_id, error = %e, "spawn task failed");
                self.inner.publish_spawn_failure(&pane_id);
                return;
            }
        };

        let generation = self.inner.next_generation.fetch_add(1, Ordering::SeqCst);
        let pid = spawned.pid;
        let observer = Arc::downgrade(&self.inner);
        let observer: Weak<dyn SessionObserver> = observer;
        // Tasks start under the lock so an instant exit still finds the session.
        let mut running = spawned.start(SessionWiring {
            pane_id: pane_id.clone(),
            generation,
            drain_grace: self.inner.config.exit_drain_grace,
            events: self.inner.events.clone(),
            observer,
        });

        if cancelled {
            // Stopped while spawning: the process never becomes a session and
            // its forwarder still reports the exit.
            drop(state);
            if let Err(e) = running.killer.kill() {
                tracing::debug!("kill for cancelled pane {} failed: {}", pane_id, e);
            }
            tracing::info!(pane = %pane_id, pid = ?pid, "session stopped while starting");
            return;
        }

        state.sessions.insert(Session {
            info: SessionInfo {
                pane_id: pane_id.clone(),
                shell_kind: kind,
                working_directory: cwd,
                pid,
                started_at: Utc::now(),
            },
            generation,
            input_tx: running.input_tx,
            pty_master: running.pty_master,
            killer: running.killer,
            forwarder: running.forwarder,
            exiting: false,
        });
        if let Some(pid) = pid {
            state.registry.track(pid);
            self.inner.registry_writer.submit(state.registry.pids());
        }
        drop(state);

        tracing::info!(pane = %pane_id, pid = ?pid, shell = %kind, "session started");
    }

    /// Terminate the pane's session. No-op if there is none.
    ///
    /// The exit event follows asynchronously.
    pub fn stop_session(&self, pane_id: &PaneId) {
        if self.inner.state.lock().starting.remove(pane_id) {
            tracing::debug!("cancelling spawn for pane {}", pane_id);
        }
        if self.inner.detach(pane_id).is_some() {
            tracing::info!(pane = %pane_id, "session stopped");
        }
    }

    /// Forward raw bytes to the pane's process.
    ///
    /// # Errors
    /// Returns [`Error::SessionNotFound`] if the pane has no session and
    /// [`Error::PaneClosed`] if its input stream is gone.
    pub async fn send_input(&self, pane_id: &PaneId, data: &[u8]) -> Result<()> {
        let (_, input_tx) = self.inner.input_channel(pane_id)?;
        input_tx
            .send(data.to_vec())
            .await
            .map_err(|_| Error::PaneClosed)
    }

    /// Type `command` into the pane's shell and submit it.
    ///
    /// Extended-shell syntax sent to a legacy session is proxied through the
    /// extended shell. With `force_submit`, a second submit keystroke follows
    /// after the configured delay, for interpreters still initializing.
    ///
    /// # Errors
    /// Returns [`Error::SessionNotFound`] if the pane has no session and
    /// [`Error::PaneClosed`] if its input stream is gone.
    pub async fn execute_in_session(
        &self,
        pane_id: &PaneId,
        command: &str,
        force_submit: bool,
    ) -> Result<()> {
        let (kind, input_tx) = self.inner.input_channel(pane_id)?;

        let text = match self.inner.dialect.rewrite(kind, command) {
            Some(proxied) => {
                tracing::debug!("proxying command for legacy pane {}", pane_id);
                proxied
            }
            None => command.to_string(),
        };

        input_tx
            .send(text.into_bytes())
            .await
            .map_err(|_| Error::PaneClosed)?;
        // Some programs only react to a submit that arrives as its own write.
        input_tx
            .send(SUBMIT_TOKEN.to_vec())
            .await
            .map_err(|_| Error::PaneClosed)?;

        if force_submit {
            let delay = self.inner.config.resubmit_delay;
            tokio::spawn(async move {
                tokio::time::sleep(delay).await;
                let _ = input_tx.send(SUBMIT_TOKEN.to_vec()).await;
            });
        }
        Ok(())
    }

    /// Resize the pane's PTY. No-op if there is no session.
    ///
    /// # Errors
    /// Returns an error if the OS rejects the resize.
    pub fn resize(&self, pane_id: &PaneId, cols: u16, rows: u16) -> Result<()> {
        let state = self.inner.state.lock();
        match state.sessions.get(pane_id) {
            Some(session) => pty::resize_pty(session.pty_master.as_ref(), PaneSize::new(rows, cols)),
            None => Ok(()),
        }
    }

    /// Run a one-shot command to completion.
    ///
    /// # Errors
    /// Returns an error if the working directory is rejected or the process
    /// cannot be spawned. A non-zero exit code is not an error.
    pub async fn run(
        &self,
        pane_id: impl Into<PaneId>,
        kind: ShellKind,
        cwd: &Path,
        command: &str,
    ) -> Result<CommandRecord> {
        self.inner.runner.run(pane_id.into(), kind, cwd, command).await
    }

    /// Stop every session and persist an empty registry.
    pub async fn shutdown(&self) {
        let _lifecycle = self.inner.lifecycle.lock().await;

        let stopped = {
            let mut state = self.inner.state.lock();
            let mut sessions = state.sessions.drain();
            for session in &mut sessions {
                session.terminate();
            }
            state.registry.clear();
            state.starting.clear();
            self.inner.registry_writer.submit(state.registry.pids());
            sessions
        };

        let count = stopped.len();
        self.inner.await_exit(stopped).await;
        self.inner.registry_writer.flush().await;
        tracing::info!(stopped = count, "session controller shut down");
    }

    /// Lifecycle state of `pane_id`.
    #[must_use]
    pub fn state(&self, pane_id: &PaneId) -> SessionState {
        let state = self.inner.state.lock();
        if state.starting.contains(pane_id) {
            return SessionState::Starting;
        }
        match state.sessions.get(pane_id) {
            Some(session) if session.exiting => SessionState::Exiting,
            Some(_) => SessionState::Running,
            None => SessionState::Absent,
        }
    }

    /// Descriptions of all live sessions, ordered by pane.
    #[must_use]
    pub fn sessions(&self) -> Vec<SessionInfo> {
        self.inner.state.lock().sessions.infos()
    }

    /// Number of live sessions.
    #[must_use]
    pub fn session_count(&self) -> usize {
        self.inner.state.lock().sessions.len()
    }

    /// Process identifiers currently tracked in the registry.
    #[must_use]
    pub fn tracked_pids(&self) -> Vec<u32> {
        self.inner.state.lock().registry.pids().iter().copied().collect()
    }

    /// Wait until the latest registry change has been written to disk.
    pub async fn flush_registry(&self) {
        self.inner.registry_writer.flush().await;
    }

    /// Path of the registry file.
    #[must_use]
    pub fn registry_path(&self) -> &Path {
        &self.inner.config.registry_path
    }
}

impl std::fmt::Debug for SessionController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionController")
            .field("registry_path", &self.inner.config.registry_path)
            .field("sessions", &self.session_count())
            .finish_non_exhaustive()
    }
}

impl Inner {
    /// Remove the pane's session, signal it and untrack its pid.
    fn detach(&self, pane_id: &PaneId) -> Option<Session> {
        let mut state = self.state.lock();
        let mut session = state.sessions.remove(pane_id)?;
        session.terminate();
        if let Some(pid) = session.info.pid {
            state.registry.untrack(pid);
            self.registry_writer.submit(state.registry.pids());
        }
        Some(session)
    }

    /// Wait (bounded by `stop_grace`) for stopped sessions to publish their exit.
    async fn await_exit(&self, sessions: Vec<Session>) {
        let deadline = tokio::time::Instant::now() + self.config.stop_grace;
        let forwarders: Vec<JoinHandle<()>> =
            sessions.into_iter().map(|session| session.forwarder).collect();
        for forwarder in forwarders {
            if tokio::time::timeout_at(deadline, forwarder).await.is_err() {
                tracing::debug!("stopped session did not exit within the grace period");
            }
        }
    }

    fn input_channel(
        &self,
        pane_id: &PaneId,
    ) -> Result<(ShellKind, tokio::sync::mpsc::Sender<Vec<u8>>)> {
        let state = self.state.lock();
        let session = state
            .sessions
            .get(pane_id)
            .ok_or_else(|| Error::SessionNotFound(pane_id.clone()))?;
        Ok((session.info.shell_kind, session.input_tx.clone()))
    }

    fn persist_registry(&self) {
        let state = self.state.lock();
        self.registry_writer.submit(state.registry.pids());
    }

    fn publish_spawn_failure(&self, pane_id: &PaneId) {
        self.events.publish(&PaneEvent::Exit {
            pane_id: pane_id.clone(),
            code: SPAWN_FAILED_EXIT_CODE,
        });
    }
}

impl SessionObserver for Inner {
    fn on_exiting(&self, pane_id: &PaneId, generation: u64) {
        let mut state = self.state.lock();
        if let Some(session) = state.sessions.get_mut(pane_id) {
            if session.generation == generation {
                session.exiting = true;
            }
        }
    }

    fn on_exited(&self, pane_id: &PaneId, generation: u64) {
        let mut state = self.state.lock();
        let Some(session) = state.sessions.remove_generation(pane_id, generation) else {
            return;
        };
        if let Some(pid) = session.info.pid {
            state.registry.untrack(pid);
            self.registry_writer.submit(state.registry.pids());
        }
        drop(state);
        tracing::info!(pane = %pane_id, "session exited");
    }
}
