//! PTY spawning and I/O management.

use std::io::{Read, Write};
use std::path::PathBuf;
use std::sync::Weak;
use std::time::Duration;

use portable_pty::{native_pty_system, Child, ChildKiller, CommandBuilder, MasterPty, PtySize};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

use crate::dialect::LaunchSpec;
use crate::error::{Error, Result};
use crate::events::{EventBus, PaneEvent};
use crate::session::{PaneId, PaneSize};

/// Exit code reported when the process could not report one.
pub const UNKNOWN_EXIT_CODE: i32 = -1;

/// Exit code of the synthetic exit event published when a session fails to spawn.
pub const SPAWN_FAILED_EXIT_CODE: i32 = -2;

/// Callbacks from a session's forwarder back to its owner.
pub(crate) trait SessionObserver: Send + Sync {
    /// The process reported exit; output is still being drained.
    fn on_exiting(&self, pane_id: &PaneId, generation: u64);

    /// The session is finished. Called right before its exit event is published.
    fn on_exited(&self, pane_id: &PaneId, generation: u64);
}

/// Everything needed to spawn one interactive process.
pub(crate) struct PtyRequest {
    pub spec: LaunchSpec,
    pub cwd: PathBuf,
    pub size: PaneSize,
    pub env: Vec<(String, String)>,
}

/// A spawned process whose I/O tasks have not been started yet.
pub(crate) struct SpawnedPty {
    pub pid: Option<u32>,
    pub pty_master: Box<dyn MasterPty + Send>,
    child: Box<dyn Child + Send + Sync>,
    reader: Box<dyn Read + Send>,
    writer: Box<dyn Write + Send>,
}

/// Wiring for a session's I/O tasks.
pub(crate) struct SessionWiring {
    pub pane_id: PaneId,
    pub generation: u64,
    pub drain_grace: Duration,
    pub events: EventBus,
    pub observer: Weak<dyn SessionObserver>,
}

/// Handles kept by the session once its I/O tasks are running.
pub(crate) struct RunningPty {
    pub input_tx: mpsc::Sender<Vec<u8>>,
    pub pty_master: Box<dyn MasterPty + Send>,
    pub killer: Box<dyn ChildKiller + Send + Sync>,
    pub forwarder: JoinHandle<()>,
}

/// Spawns a new PTY process.
///
/// Blocking; run it off the async executor.
///
/// # Errors
/// Returns an error if PTY creation or process spawning fails.
pub(crate) fn spawn_pty(request: &PtyRequest) -> Result<SpawnedPty> {
    let pty_system = native_pty_system();

    let pty_pair = pty_system
        .openpty(to_pty_size(request.size))
        .map_err(|e| Error::PtyCreate(e.to_string()))?;

    let mut cmd = CommandBuilder::new(&request.spec.program);
    cmd.args(&request.spec.args);
    cmd.cwd(&request.cwd);
    for (key, value) in &request.env {
        cmd.env(key, value);
    }

    let child = pty_pair.slave.spawn_command(cmd)?;
    // Our copy of the slave must close so the reader sees EOF on exit.
    drop(pty_pair.slave);

    let reader = pty_pair.master.try_clone_reader()?;
    let writer = pty_pair.master.take_writer()?;

    Ok(SpawnedPty {
        pid: child.process_id(),
        pty_master: pty_pair.master,
        child,
        reader,
        writer,
    })
}

impl SpawnedPty {
    /// Start the reader, writer, waiter and forwarder tasks.
    pub(crate) fn start(self, wiring: SessionWiring) -> RunningPty {
        let SpawnedPty {
            pid: _,
            pty_master,
            child,
            reader,
            writer,
        } = self;

        let (input_tx, input_rx) = mpsc::channel::<Vec<u8>>(256);
        let (output_tx, output_rx) = mpsc::channel::<Vec<u8>>(256);
        let (exit_tx, exit_rx) = oneshot::channel::<i32>();

        let killer = child.clone_killer();

        spawn_reader_task(wiring.pane_id.clone(), reader, output_tx);
        spawn_writer_task(writer, input_rx);
        spawn_waiter_task(wiring.pane_id.clone(), child, exit_tx);
        let forwarder = tokio::spawn(forward_session(wiring, output_rx, exit_rx));

        RunningPty {
            input_tx,
            pty_master,
            killer,
            forwarder,
        }
    }
}

/// Resize a PTY.
///
/// # Errors
/// Returns an error if the resize operation fails.
pub(crate) fn resize_pty(pty_master: &dyn MasterPty, size: PaneSize) -> Result<()> {
    pty_master
        .resize(to_pty_size(size))
        .map_err(|e| Error::Resize(e.to_string()))
}

fn to_pty_size(size: PaneSize) -> PtySize {
    PtySize {
        rows: size.rows,
        cols: size.cols,
        pixel_width: 0,
        pixel_height: 0,
    }
}

/// Spawns the task that reads PTY output.
fn spawn_reader_task(
    pane_id: PaneId,
    mut reader: Box<dyn Read + Send>,
    output_tx: mpsc::Sender<Vec<u8>>,
) -> JoinHandle<()> {
    tokio::task::spawn_blocking(move || {
        let mut buf = [0u8; 4096];

        loop {
            match reader.read(&mut buf) {
                Ok(0) => break,
                Ok(n) => {
                    if output_tx.blocking_send(buf[..n].to_vec()).is_err() {
                        // Forwarder finished; nobody is listening anymore.
                        break;
                    }
                }
                Err(e) => {
                    // EIO here is the normal end of a Linux PTY.
                    tracing::debug!("PTY read error for pane {}: {}", pane_id, e);
                    break;
                }
            }
        }

        tracing::debug!("Reader task for pane {} finished", pane_id);
    })
}

/// Spawns the task that writes to PTY.
fn spawn_writer_task(
    mut writer: Box<dyn Write + Send>,
    mut input_rx: mpsc::Receiver<Vec<u8>>,
) -> JoinHandle<()> {
    tokio::task::spawn_blocking(move || {
        while let Some(data) = input_rx.blocking_recv() {
            if let Err(e) = writer.write_all(&data) {
                tracing::debug!("PTY write error: {}", e);
                break;
            }
            if let Err(e) = writer.flush() {
                tracing::debug!("PTY flush error: {}", e);
                break;
            }
        }

        tracing::debug!("Writer task finished");
    })
}

/// Spawns the task that waits for process exit.
fn spawn_waiter_task(
    pane_id: PaneId,
    mut child: Box<dyn Child + Send + Sync>,
    exit_tx: oneshot::Sender<i32>,
) -> JoinHandle<()> {
    tokio::task::spawn_blocking(move || {
        let code = match child.wait() {
            Ok(status) => i32::try_from(status.exit_code()).unwrap_or(UNKNOWN_EXIT_CODE),
            Err(e) => {
                tracing::warn!(pane = %pane_id, error = %e, "failed to wait for session process");
                UNKNOWN_EXIT_CODE
            }
        };
        let _ = exit_tx.send(code);

        tracing::debug!("Waiter task for pane {} finished", pane_id);
    })
}

/// Sole publisher of a session's events, so the exit event is always last.
async fn forward_session(
    wiring: SessionWiring,
    mut output_rx: mpsc::Receiver<Vec<u8>>,
    mut exit_rx: oneshot::Receiver<i32>,
) {
    let SessionWiring {
        pane_id,
        generation,
        drain_grace,
        events,
        observer,
    } = wiring;

    let publish = |data: Vec<u8>| {
        events.publish(&PaneEvent::Data {
            pane_id: pane_id.clone(),
            data,
        });
    };

    let code = loop {
        tokio::select! {
            chunk = output_rx.recv() => match chunk {
                Some(data) => publish(data),
                None => break (&mut exit_rx).await.unwrap_or(UNKNOWN_EXIT_CODE),
            },
            status = &mut exit_rx => {
                if let Some(observer) = observer.upgrade() {
                    observer.on_exiting(&pane_id, generation);
                }
                // Grandchildren may keep the PTY open; drain for a bounded time only.
                let deadline = tokio::time::sleep(drain_grace);
                tokio::pin!(deadline);
                loop {
                    tokio::select! {
                        chunk = output_rx.recv() => match chunk {
                            Some(data) => publish(data),
                            None => break,
                        },
                        () = &mut deadline => break,
                    }
                }
                break status.unwrap_or(UNKNOWN_EXIT_CODE);
            }
        }
    };

    if let Some(observer) = observer.upgrade() {
        observer.on_exited(&pane_id, generation);
    }
    events.publish(&PaneEvent::Exit {
        pane_id: pane_id.clone(),
        code,
    });

    tracing::debug!("Forwarder for pane {} finished (exit code {})", pane_id, code);
}
