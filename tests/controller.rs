//! End-to-end lifecycle tests against real shells.
#![cfg(unix)]

use std::os::unix::process::ExitStatusExt;
use std::path::Path;
use std::process::Command;
use std::time::Duration;

use panekeeper::registry::ProcessRegistry;
use panekeeper::{
    ControllerConfig, Error, EventStream, PaneEvent, PaneId, PaneSize, SessionController,
    SessionState, ShellKind, SPAWN_FAILED_EXIT_CODE,
};
use tempfile::TempDir;

const WAIT: Duration = Duration::from_secs(10);

fn config(dir: &TempDir) -> ControllerConfig {
    ControllerConfig::new(dir.path().join("registry.json")).initial_size(PaneSize::new(40, 200))
}

/// Collect a pane's output until its exit event.
async fn output_until_exit(rx: &mut EventStream, pane: &PaneId) -> (String, i32) {
    let mut output = String::new();
    let collect = async {
        loop {
            match rx.recv().await.expect("event stream closed") {
                PaneEvent::Data { pane_id, data } if &pane_id == pane => {
                    output.push_str(&String::from_utf8_lossy(&data));
                }
                PaneEvent::Exit { pane_id, code } if &pane_id == pane => return code,
                _ => {}
            }
        }
    };
    let code = tokio::time::timeout(WAIT, collect).await.expect("pane never exited");
    (output, code)
}

/// Collect a pane's output until it contains `needle`.
async fn output_until(rx: &mut EventStream, pane: &PaneId, needle: &str) -> String {
    let mut output = String::new();
    let collect = async {
        while !output.contains(needle) {
            let event = rx.recv().await.expect("event stream closed");
            if let PaneEvent::Data { pane_id, data } = event {
                if &pane_id == pane {
                    output.push_str(&String::from_utf8_lossy(&data));
                }
            }
        }
    };
    tokio::time::timeout(WAIT, collect)
        .await
        .unwrap_or_else(|_| panic!("never saw {needle:?}"));
    output
}

fn cwd() -> std::path::PathBuf {
    std::env::temp_dir()
}

#[tokio::test]
async fn test_output_precedes_exit_event() {
    let dir = TempDir::new().unwrap();
    let controller = SessionController::new(config(&dir));
    let mut rx = controller.subscribe();
    let pane = PaneId::from("ordering");

    controller.start_session(&pane, ShellKind::LegacyCmd, cwd()).await;
    assert_eq!(controller.state(&pane), SessionState::Running);
    controller
        .execute_in_session(&pane, "echo al''pha; echo be''ta; exit 0", false)
        .await
        .unwrap();

    let (output, code) = output_until_exit(&mut rx, &pane).await;
    assert_eq!(code, 0);
    let alpha = output.find("alpha").expect("missing alpha");
    let beta = output.find("beta").expect("missing beta");
    assert!(alpha < beta);

    // Nothing for the pane after its exit event.
    tokio::time::sleep(Duration::from_millis(300)).await;
    while let Ok(event) = rx.try_recv() {
        assert_ne!(event.pane_id(), &pane, "event after exit: {event:?}");
    }
    assert_eq!(controller.state(&pane), SessionState::Absent);
    assert!(controller.tracked_pids().is_empty());
}

#[tokio::test]
async fn test_restart_replaces_session() {
    let dir = TempDir::new().unwrap();
    let controller = SessionController::new(config(&dir));
    let mut rx = controller.subscribe();
    let pane = PaneId::from("replace");

    controller.start_session(&pane, ShellKind::LegacyCmd, cwd()).await;
    let first = controller.tracked_pids();
    assert_eq!(first.len(), 1);

    controller.start_session(&pane, ShellKind::PosixLike, cwd()).await;
    let second = controller.tracked_pids();
    assert_eq!(controller.session_count(), 1);
    assert_eq!(second.len(), 1);
    assert_ne!(first, second);

    let sessions = controller.sessions();
    assert_eq!(sessions[0].shell_kind, ShellKind::PosixLike);
    assert_eq!(sessions[0].pid, Some(second[0]));

    // The replaced session reported its exit.
    let (_, _) = output_until_exit(&mut rx, &pane).await;

    controller.flush_registry().await;
    let on_disk = ProcessRegistry::new(controller.registry_path()).load();
    assert_eq!(on_disk.into_iter().collect::<Vec<_>>(), second);

    controller.shutdown().await;
}

#[tokio::test]
async fn test_shutdown_stops_everything() {
    let dir = TempDir::new().unwrap();
    let controller = SessionController::new(config(&dir));
    let mut rx = controller.subscribe();
    let left = PaneId::from("left");
    let right = PaneId::from("right");

    controller.start_session(&left, ShellKind::PosixLike, cwd()).await;
    controller.start_session(&right, ShellKind::LegacyCmd, cwd()).await;
    assert_eq!(controller.tracked_pids().len(), 2);

    controller.shutdown().await;

    assert_eq!(controller.session_count(), 0);
    assert!(controller.tracked_pids().is_empty());
    assert!(ProcessRegistry::new(controller.registry_path()).load().is_empty());

    let mut exited = Vec::new();
    while let Ok(event) = rx.try_recv() {
        if let PaneEvent::Exit { pane_id, .. } = event {
            exited.push(pane_id);
        }
    }
    exited.sort();
    assert_eq!(exited, vec![left, right]);
}

#[tokio::test]
async fn test_stop_session_is_idempotent() {
    let dir = TempDir::new().unwrap();
    let controller = SessionController::new(config(&dir));
    let mut rx = controller.subscribe();
    let pane = PaneId::from("stop");

    controller.stop_session(&pane);
    controller.start_session(&pane, ShellKind::LegacyCmd, cwd()).await;
    controller.stop_session(&pane);
    controller.stop_session(&pane);

    assert_eq!(controller.state(&pane), SessionState::Absent);
    assert!(controller.tracked_pids().is_empty());
    let (_, code) = output_until_exit(&mut rx, &pane).await;
    assert_ne!(code, SPAWN_FAILED_EXIT_CODE);
}

#[tokio::test]
async fn test_missing_session_errors() {
    let dir = TempDir::new().unwrap();
    let controller = SessionController::new(config(&dir));
    let pane = PaneId::from("nobody");

    assert!(matches!(
        controller.send_input(&pane, b"ls\r").await,
        Err(Error::SessionNotFound(_))
    ));
    assert!(matches!(
        controller.execute_in_session(&pane, "ls", true).await,
        Err(Error::SessionNotFound(_))
    ));
    assert!(controller.resize(&pane, 100, 30).is_ok());
    assert_eq!(controller.state(&pane), SessionState::Absent);
}

#[tokio::test]
async fn test_legacy_session_proxies_extended_syntax() {
    let dir = TempDir::new().unwrap();
    let controller = SessionController::new(config(&dir));
    let mut rx = controller.subscribe();
    let pane = PaneId::from("legacy");
    let payload = "ZWNobyB7MS4uM30="; // base64 of "echo {1..3}"

    controller.start_session(&pane, ShellKind::LegacyCmd, cwd()).await;
    controller
        .execute_in_session(&pane, "echo {1..3}", false)
        .await
        .unwrap();

    // Only the proxied bash expands the range; plain sh would print it as-is.
    let output = output_until(&mut rx, &pane, "1 2 3").await;
    assert!(output.contains(payload));
    assert!(!output.contains("echo {1..3}"));

    controller.shutdown().await;
}

#[tokio::test]
async fn test_extended_session_receives_text_verbatim() {
    let dir = TempDir::new().unwrap();
    let controller = SessionController::new(config(&dir));
    let mut rx = controller.subscribe();
    let pane = PaneId::from("extended");

    controller.start_session(&pane, ShellKind::PosixLike, cwd()).await;
    controller
        .execute_in_session(&pane, "echo {1..3}", false)
        .await
        .unwrap();
    let output = output_until(&mut rx, &pane, "1 2 3").await;
    assert!(output.contains("echo {1..3}"));
    assert!(!output.contains("base64"));

    controller.shutdown().await;
}

#[tokio::test]
async fn test_force_submit_sends_second_submit() {
    let dir = TempDir::new().unwrap();
    let controller = SessionController::new(config(&dir));
    let mut rx = controller.subscribe();
    let pane = PaneId::from("resubmit");

    controller.start_session(&pane, ShellKind::LegacyCmd, cwd()).await;
    // The first submit runs the line; `read` then consumes the delayed second one.
    controller
        .execute_in_session(&pane, "read reply; echo re''submitted", true)
        .await
        .unwrap();
    output_until(&mut rx, &pane, "resubmitted").await;

    controller.shutdown().await;
}

#[tokio::test]
async fn test_without_force_submit_no_second_submit() {
    let dir = TempDir::new().unwrap();
    let controller = SessionController::new(config(&dir));
    let mut rx = controller.subscribe();
    let pane = PaneId::from("single-submit");

    controller.start_session(&pane, ShellKind::LegacyCmd, cwd()).await;
    controller
        .execute_in_session(&pane, "read reply; echo re''submitted", false)
        .await
        .unwrap();

    tokio::time::sleep(Duration::from_millis(500)).await;
    controller.stop_session(&pane);
    let (output, _) = output_until_exit(&mut rx, &pane).await;
    assert!(!output.contains("resubmitted"));
}

#[tokio::test]
async fn test_send_input_and_resize() {
    let dir = TempDir::new().unwrap();
    let controller = SessionController::new(config(&dir));
    let mut rx = controller.subscribe();
    let pane = PaneId::from("resize");

    controller.start_session(&pane, ShellKind::LegacyCmd, cwd()).await;
    controller.resize(&pane, 120, 33).unwrap();
    controller
        .send_input(&pane, b"stty size; echo si''zed\r")
        .await
        .unwrap();
    let output = output_until(&mut rx, &pane, "sized").await;
    assert!(output.contains("33 120"), "unexpected output: {output:?}");

    controller.shutdown().await;
}

#[tokio::test]
async fn test_rejected_workspace_reports_spawn_failure() {
    let dir = TempDir::new().unwrap();
    let root = TempDir::new().unwrap();
    let controller = SessionController::new(
        config(&dir).enforce_workspace_roots(vec![root.path().to_path_buf()]),
    );
    let mut rx = controller.subscribe();
    let pane = PaneId::from("outside");

    controller.start_session(&pane, ShellKind::LegacyCmd, dir.path()).await;

    let (_, code) = output_until_exit(&mut rx, &pane).await;
    assert_eq!(code, SPAWN_FAILED_EXIT_CODE);
    assert_eq!(controller.state(&pane), SessionState::Absent);
    assert!(controller.tracked_pids().is_empty());
}

#[tokio::test]
async fn test_unlaunchable_shell_reports_spawn_failure() {
    let dir = TempDir::new().unwrap();
    // The extended shell is resolved through PATH, which now finds nothing.
    let controller =
        SessionController::new(config(&dir).env("PATH", "/nonexistent-panekeeper-path"));
    let mut rx = controller.subscribe();
    let pane = PaneId::from("unlaunchable");

    controller.start_session(&pane, ShellKind::PosixLike, cwd()).await;

    let (output, code) = output_until_exit(&mut rx, &pane).await;
    assert_eq!(code, SPAWN_FAILED_EXIT_CODE);
    assert!(output.is_empty());
    assert_eq!(controller.state(&pane), SessionState::Absent);
    assert_eq!(controller.session_count(), 0);
    assert!(controller.tracked_pids().is_empty());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_stop_while_starting_cancels_session() {
    let dir = TempDir::new().unwrap();
    let controller = SessionController::new(config(&dir));
    let mut rx = controller.subscribe();

    // The starting window is short; retry until a stop lands inside it.
    let mut cancelled = None;
    for attempt in 0..50 {
        let pane = PaneId::new(format!("starting-{attempt}"));
        let starter = {
            let controller = controller.clone();
            let pane = pane.clone();
            tokio::spawn(async move {
                controller.start_session(&pane, ShellKind::LegacyCmd, cwd()).await;
            })
        };

        let mut saw_starting = false;
        while !starter.is_finished() {
            if controller.state(&pane) == SessionState::Starting {
                controller.stop_session(&pane);
                saw_starting = true;
                break;
            }
            std::hint::spin_loop();
        }
        starter.await.unwrap();

        if saw_starting {
            cancelled = Some(pane);
            break;
        }
        controller.stop_session(&pane);
    }
    let pane = cancelled.expect("never observed a starting session");

    assert_eq!(controller.state(&pane), SessionState::Absent);
    assert!(controller.sessions().iter().all(|info| info.pane_id != pane));
    assert!(controller.tracked_pids().is_empty());

    // The cancelled process still reports its exit.
    let (_, code) = output_until_exit(&mut rx, &pane).await;
    assert_ne!(code, SPAWN_FAILED_EXIT_CODE);

    controller.shutdown().await;
    assert_eq!(controller.session_count(), 0);
}

#[tokio::test]
async fn test_initialize_reaps_orphans_from_previous_run() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("registry.json");

    let mut orphans: Vec<_> = (0..2)
        .map(|_| Command::new("sleep").arg("30").spawn().unwrap())
        .collect();
    let mut finished = Command::new("true").spawn().unwrap();
    let dead_pid = finished.id();
    finished.wait().unwrap();

    let mut previous = ProcessRegistry::new(&path);
    for orphan in &orphans {
        previous.track(orphan.id());
    }
    previous.track(dead_pid);
    previous.persist().unwrap();

    let controller = SessionController::new(ControllerConfig::new(&path));
    let report = controller.initialize().await;

    let mut expected: Vec<u32> = orphans.iter().map(std::process::Child::id).collect();
    expected.sort_unstable();
    assert_eq!(report.tracked, 3);
    assert_eq!(report.signalled, expected);
    assert_eq!(report.already_gone, vec![dead_pid]);
    assert!(ProcessRegistry::new(&path).load().is_empty());

    for orphan in &mut orphans {
        assert!(orphan.wait().unwrap().signal().is_some());
    }
}

#[tokio::test]
async fn test_initialize_tolerates_missing_and_corrupt_registry() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("registry.json");

    let controller = SessionController::new(ControllerConfig::new(&path));
    let report = controller.initialize().await;
    assert_eq!(report.tracked, 0);
    assert!(Path::new(&path).exists());

    std::fs::write(&path, "{\"version\": 1, \"pids\": [0, -1, ").unwrap();
    let report = controller.initialize().await;
    assert_eq!(report.tracked, 0);
    assert!(ProcessRegistry::new(&path).load().is_empty());
}

#[tokio::test]
async fn test_structured_run_through_controller() {
    let dir = TempDir::new().unwrap();
    let controller = SessionController::new(config(&dir));
    let mut rx = controller.subscribe();

    let record = controller
        .run("runner", ShellKind::LegacyCmd, &cwd(), "echo out; echo err >&2; exit 3")
        .await
        .unwrap();

    assert_eq!(record.exit_code(), Some(3));
    assert!(record.completed_at().is_some());
    assert!(record.output().contains("out"));
    assert!(record.output().contains("err"));
    assert!(record.warning().is_none());
    assert!(controller.tracked_pids().is_empty());

    let event = rx.try_recv().unwrap();
    assert_eq!(event.pane_id(), &PaneId::from("runner"));
    assert!(event.text().is_some());
}
