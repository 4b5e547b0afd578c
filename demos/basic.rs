//! Basic example demonstrating panekeeper's session lifecycle.
//!
//! Run with: cargo run --example basic
//!
//! Every line read from stdin is typed into a single pane. End input with
//! Ctrl+D to shut the session down.

use std::time::Duration;

use anyhow::Context;
use panekeeper::{ControllerConfig, PaneEvent, PaneId, SessionController, ShellKind};
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let controller = SessionController::new(
        ControllerConfig::for_app("panekeeper-demo").command_timeout(Duration::from_secs(30)),
    );
    let mut events = controller.subscribe();

    // Reap anything a previous crash left running
    let report = controller.initialize().await;
    if !report.signalled.is_empty() {
        eprintln!("terminated orphans: {:?}", report.signalled);
    }

    let pane = PaneId::from("main");
    let cwd = std::env::current_dir().context("failed to read current directory")?;
    controller.start_session(&pane, ShellKind::PosixLike, cwd).await;

    // Print pane output as it arrives
    let printer = tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            match event {
                PaneEvent::Data { data, .. } => print!("{}", String::from_utf8_lossy(&data)),
                PaneEvent::Exit { pane_id, code } => {
                    println!("\n[{pane_id} exited with {code}]");
                }
            }
        }
    });

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await.context("failed to read stdin")? {
        if panekeeper::is_destructive(&line) {
            eprintln!("[warning: potentially destructive command]");
        }
        if let Err(e) = controller.execute_in_session(&pane, &line, false).await {
            eprintln!("[{e}]");
            break;
        }
    }

    controller.shutdown().await;
    printer.abort();
    Ok(())
}
