//! One-shot structured command execution.
//!
//! Structured runs never touch the session table or the process registry: they
//! are short-lived and finish (or hit the configured timeout) on their own.
//! On Unix each run leads its own process group, so a timeout takes down
//! everything the command started.

use std::path::Path;
use std::process::Stdio;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::Command;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::classifier;
use crate::config::WorkspacePolicy;
use crate::dialect::{exec_spec_for, ShellKind};
use crate::error::{Error, Result};
use crate::events::{EventBus, PaneEvent};
use crate::pty::UNKNOWN_EXIT_CODE;
use crate::session::PaneId;

/// Immutable result of one structured command.
#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CommandRecord {
    id: String,
    pane_id: PaneId,
    command: String,
    output: String,
    exit_code: Option<i32>,
    started_at: DateTime<Utc>,
    completed_at: Option<DateTime<Utc>>,
    timed_out: bool,
}

impl CommandRecord {
    fn started(pane_id: PaneId, command: &str) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            pane_id,
            command: command.to_string(),
            output: String::new(),
            exit_code: None,
            started_at: Utc::now(),
            completed_at: None,
            timed_out: false,
        }
    }

    fn finish(self, output: &[u8], exit_code: i32, timed_out: bool) -> Self {
        Self {
            output: String::from_utf8_lossy(output).into_owned(),
            exit_code: Some(exit_code),
            completed_at: Some(Utc::now()),
            timed_out,
            ..self
        }
    }

    /// Unique record identifier.
    #[must_use]
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Pane the command was run for.
    #[must_use]
    pub fn pane_id(&self) -> &PaneId {
        &self.pane_id
    }

    /// The command text, verbatim.
    #[must_use]
    pub fn command(&self) -> &str {
        &self.command
    }

    /// Combined stdout and stderr in arrival order.
    #[must_use]
    pub fn output(&self) -> &str {
        &self.output
    }

    /// Exit code; `-1` when the process could not report one.
    #[must_use]
    pub fn exit_code(&self) -> Option<i32> {
        self.exit_code
    }

    /// When the command was launched.
    #[must_use]
    pub fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }

    /// When the process closed.
    #[must_use]
    pub fn completed_at(&self) -> Option<DateTime<Utc>> {
        self.completed_at
    }

    /// Whether the command was killed by the configured timeout.
    #[must_use]
    pub fn timed_out(&self) -> bool {
        self.timed_out
    }

    /// Whether the command matches a destructive pattern.
    #[must_use]
    pub fn is_destructive(&self) -> bool {
        classifier::is_destructive(&self.command)
    }

    /// Non-blocking warning to show alongside the result.
    #[must_use]
    pub fn warning(&self) -> Option<String> {
        classifier::matched_rule(&self.command)
            .map(|rule| format!("potentially destructive command ({rule})"))
    }
}

/// Runs structured commands and mirrors their output onto the event channel.
#[derive(Clone, Debug)]
pub struct CommandRunner {
    events: EventBus,
    timeout: Option<Duration>,
    workspace_policy: WorkspacePolicy,
}

impl CommandRunner {
    /// Create a runner publishing output to `events`.
    #[must_use]
    pub fn new(
        events: EventBus,
        timeout: Option<Duration>,
        workspace_policy: WorkspacePolicy,
    ) -> Self {
        Self {
            events,
            timeout,
            workspace_policy,
        }
    }

    /// Run `command` to completion under the interpreter for `kind`.
    ///
    /// A non-zero exit is a normal outcome.
    ///
    /// # Errors
    /// Returns an error if `cwd` violates the workspace policy or the process
    /// cannot be spawned.
    pub async fn run(
        &self,
        pane_id: PaneId,
        kind: ShellKind,
        cwd: &Path,
        command: &str,
    ) -> Result<CommandRecord> {
        self.workspace_policy.check(cwd)?;

        let record = CommandRecord::started(pane_id, command);
        let spec = exec_spec_for(kind, command);

        let mut command_builder = Command::new(&spec.program);
        command_builder
            .args(&spec.args)
            .current_dir(cwd)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        #[cfg(unix)]
        command_builder.process_group(0);

        let mut child = command_builder
            .spawn()
            .map_err(|source| {
                tracing::warn!(error = %source, command, "failed to spawn structured command");
                Error::CommandSpawn {
                    command: command.to_string(),
                    source,
                }
            })?;

        tracing::debug!(pane = %record.pane_id, pid = ?child.id(), "structured command started");

        let (chunk_tx, mut chunk_rx) = mpsc::channel::<Vec<u8>>(64);
        let mut readers = Vec::with_capacity(2);
        if let Some(stdout) = child.stdout.take() {
            readers.push(spawn_pipe_reader(stdout, chunk_tx.clone()));
        }
        if let Some(stderr) = child.stderr.take() {
            readers.push(spawn_pipe_reader(stderr, chunk_tx.clone()));
        }
        drop(chunk_tx);

        let mut output = Vec::new();
        let collect = async {
            while let Some(chunk) = chunk_rx.recv().await {
                self.publish(&record.pane_id, &chunk);
                output.extend_from_slice(&chunk);
            }
            child.wait().await
        };

        let finished = match self.timeout {
            Some(limit) => tokio::time::timeout(limit, collect).await.ok(),
            None => Some(collect.await),
        };

        let (status, timed_out) = match finished {
            Some(status) => (status, false),
            None => {
                tracing::warn!(pane = %record.pane_id, command, "structured command timed out");
                kill_process_tree(&mut child);
                let status = child.wait().await;
                // Output already in flight; the pipes close once the group is gone.
                let drain = async {
                    while let Some(chunk) = chunk_rx.recv().await {
                        self.publish(&record.pane_id, &chunk);
                        output.extend_from_slice(&chunk);
                    }
                };
                if tokio::time::timeout(PIPE_DRAIN_GRACE, drain).await.is_err() {
                    tracing::debug!(pane = %record.pane_id, "pipes still open after timeout kill");
                }
                for reader in &readers {
                    reader.abort();
                }
                (status, true)
            }
        };

        let exit_code = match status {
            Ok(status) if !timed_out => status.code().unwrap_or(UNKNOWN_EXIT_CODE),
            Ok(_) => UNKNOWN_EXIT_CODE,
            Err(e) => {
                tracing::warn!(error = %e, "failed to wait for structured command");
                UNKNOWN_EXIT_CODE
            }
        };

        Ok(record.finish(&output, exit_code, timed_out))
    }

    fn publish(&self, pane_id: &PaneId, chunk: &[u8]) {
        self.events.publish(&PaneEvent::Data {
            pane_id: pane_id.clone(),
            data: chunk.to_vec(),
        });
    }
}

/// How long pipes are drained after a timeout kill.
const PIPE_DRAIN_GRACE: Duration = Duration::from_millis(200);

/// Kill the command and everything in its process group.
#[cfg(unix)]
fn kill_process_tree(child: &mut tokio::process::Child) {
    use nix::sys::signal::{killpg, Signal};
    use nix::unistd::Pid;

    let group = child
        .id()
        .and_then(|pid| i32::try_from(pid).ok())
        .map(Pid::from_raw);
    if let Some(group) = group {
        if let Err(e) = killpg(group, Signal::SIGKILL) {
            tracing::debug!("killpg after timeout failed: {}", e);
        }
    }
    if let Err(e) = child.start_kill() {
        tracing::debug!("kill after timeout failed: {}", e);
    }
}

#[cfg(not(unix))]
fn kill_process_tree(child: &mut tokio::process::Child) {
    if let Err(e) = child.start_kill() {
        tracing::debug!("kill after timeout failed: {}", e);
    }
}

fn spawn_pipe_reader<R>(mut pipe: R, chunk_tx: mpsc::Sender<Vec<u8>>) -> JoinHandle<()>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut buf = [0u8; 4096];
        loop {
            match pipe.read(&mut buf).await {
                Ok(0) => break,
                Ok(n) => {
                    if chunk_tx.send(buf[..n].to_vec()).await.is_err() {
                        break;
                    }
                }
                Err(e) => {
                    tracing::debug!("pipe read error: {}", e);
                    break;
                }
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::EventStream;

    fn runner(timeout: Option<Duration>) -> (CommandRunner, EventStream) {
        let events = EventBus::new();
        let rx = events.subscribe();
        (
            CommandRunner::new(events, timeout, WorkspacePolicy::Trusted),
            rx,
        )
    }

    #[test]
    fn test_record_warning() {
        let record = CommandRecord::started(PaneId::from("p"), "git push --force");
        assert!(record.is_destructive());
        assert_eq!(
            record.warning().as_deref(),
            Some("potentially destructive command (force push)")
        );
        assert!(record.exit_code().is_none());
        assert!(record.completed_at().is_none());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_exit_code_is_captured() {
        let (runner, _rx) = runner(None);
        let cwd = std::env::temp_dir();
        let record = runner
            .run(PaneId::from("p"), ShellKind::LegacyCmd, &cwd, "exit 3")
            .await
            .unwrap();

        assert_eq!(record.exit_code(), Some(3));
        assert!(record.completed_at().is_some());
        assert!(!record.timed_out());
        assert_eq!(record.command(), "exit 3");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_output_is_combined_and_mirrored() {
        let (runner, mut rx) = runner(None);
        let cwd = std::env::temp_dir();
        let record = runner
            .run(
                PaneId::from("p"),
                ShellKind::PosixLike,
                &cwd,
                "echo one; sleep 0.1; echo two >&2; sleep 0.1; echo three",
            )
            .await
            .unwrap();

        assert_eq!(record.output(), "one\ntwo\nthree\n");
        assert_eq!(record.exit_code(), Some(0));

        let mut mirrored = String::new();
        while let Ok(event) = rx.try_recv() {
            assert_eq!(event.pane_id(), &PaneId::from("p"));
            mirrored.push_str(&event.text().unwrap());
        }
        assert_eq!(mirrored, record.output());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_timeout_kills_whole_process_tree() {
        use nix::errno::Errno;
        use nix::sys::signal::kill;
        use nix::unistd::Pid;

        let (runner, _rx) = runner(Some(Duration::from_millis(300)));
        let cwd = std::env::temp_dir();
        let record = runner
            .run(
                PaneId::from("p"),
                ShellKind::LegacyCmd,
                &cwd,
                "sleep 30 & echo child=$!; wait; echo after",
            )
            .await
            .unwrap();

        assert!(record.timed_out());
        assert_eq!(record.exit_code(), Some(UNKNOWN_EXIT_CODE));
        assert!(!record.output().contains("after"));

        let grandchild: i32 = record
            .output()
            .lines()
            .find_map(|line| line.strip_prefix("child="))
            .and_then(|pid| pid.trim().parse().ok())
            .expect("grandchild pid in output");

        // A killed orphan may linger as a zombie until init reaps it.
        let is_gone = |pid: i32| {
            kill(Pid::from_raw(pid), None) == Err(Errno::ESRCH)
                || std::fs::read_to_string(format!("/proc/{pid}/stat")).is_ok_and(|stat| {
                    stat.rsplit(')')
                        .next()
                        .is_some_and(|rest| rest.trim_start().starts_with('Z'))
                })
        };
        let mut gone = false;
        for _ in 0..40 {
            if is_gone(grandchild) {
                gone = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        assert!(gone, "grandchild {grandchild} survived the timeout");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_flooding_pane_keeps_quiet_pane_output() {
        let (runner, mut rx) = runner(None);
        let cwd = std::env::temp_dir();

        runner
            .run(PaneId::from("quiet"), ShellKind::LegacyCmd, &cwd, "echo marker-quiet")
            .await
            .unwrap();
        let flood = runner
            .run(
                PaneId::from("flood"),
                ShellKind::LegacyCmd,
                &cwd,
                "head -c 8000000 /dev/zero",
            )
            .await
            .unwrap();
        assert_eq!(flood.output().len(), 8_000_000);

        let first = rx.try_recv().unwrap();
        assert_eq!(first.pane_id(), &PaneId::from("quiet"));
        assert_eq!(first.text().as_deref(), Some("marker-quiet\n"));

        let mut flooded = 0;
        while let Ok(PaneEvent::Data { data, .. }) = rx.try_recv() {
            flooded += data.len();
        }
        assert_eq!(flooded, 8_000_000);
    }

    #[tokio::test]
    async fn test_spawn_failure_rejects() {
        let (runner, _rx) = runner(None);
        let missing = std::env::temp_dir().join("panekeeper-missing-dir-for-test");
        let result = runner
            .run(PaneId::from("p"), ShellKind::LegacyCmd, &missing, "echo hi")
            .await;
        assert!(matches!(result, Err(Error::CommandSpawn { .. })));
    }

    #[tokio::test]
    async fn test_workspace_policy_rejects() {
        let root = tempfile::TempDir::new().unwrap();
        let runner = CommandRunner::new(
            EventBus::new(),
            None,
            WorkspacePolicy::Enforce(vec![root.path().join("only-here")]),
        );
        let result = runner
            .run(PaneId::from("p"), ShellKind::LegacyCmd, root.path(), "echo hi")
            .await;
        assert!(matches!(result, Err(Error::OutsideWorkspace(_))));
    }
}
