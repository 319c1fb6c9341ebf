//! Unit tests for the process supervisor.
//!
//! Uses `sh` and `sleep` as stand-ins for the real collaborators.

use std::time::Duration;

use nix::sys::signal::kill;
use nix::unistd::Pid;
use vdesk_orchestrator::models::session::{ExitOutcome, ProcessRole};
use vdesk_orchestrator::orchestrator::supervisor::{LaunchSpec, ProcessSupervisor};
use vdesk_orchestrator::AppError;

fn sh(role: ProcessRole, script: &str) -> LaunchSpec {
    LaunchSpec {
        role,
        program: "sh".into(),
        args: vec!["-c".into(), script.into()],
        env: Vec::new(),
        current_dir: None,
    }
}

fn supervisor() -> ProcessSupervisor {
    ProcessSupervisor::new(Duration::from_millis(300))
}

/// Live and not a zombie. Orphans may sit unreaped when init does not reap.
fn alive(pid: u32) -> bool {
    if kill(Pid::from_raw(i32::try_from(pid).expect("pid")), None).is_err() {
        return false;
    }
    match std::fs::read_to_string(format!("/proc/{pid}/stat")) {
        Ok(stat) => stat
            .rsplit_once(')')
            .and_then(|(_, rest)| rest.trim_start().chars().next())
            .is_some_and(|state| state != 'Z'),
        Err(_) => false,
    }
}

#[tokio::test]
async fn reports_exit_code() {
    let handle = supervisor()
        .launch("t", sh(ProcessRole::Application, "exit 3"))
        .expect("launch");
    let outcome = tokio::time::timeout(Duration::from_secs(5), handle.wait_for_exit())
        .await
        .expect("exits");
    assert_eq!(outcome, ExitOutcome::Exited { code: 3 });
    assert!(handle.has_exited());
    assert_eq!(handle.exit_outcome(), Some(outcome));
}

#[tokio::test]
async fn missing_program_is_launch_failure() {
    let spec = LaunchSpec {
        role: ProcessRole::Display,
        program: "/nonexistent/vdesk-display".into(),
        args: Vec::new(),
        env: Vec::new(),
        current_dir: None,
    };
    let err = supervisor().launch("t", spec).expect_err("not found");
    assert!(matches!(err, AppError::Launch(_)));
    assert!(err.to_string().contains("display"), "{err}");
}

#[tokio::test]
async fn terminate_kills_and_reaps() {
    let handle = supervisor()
        .launch("t", sh(ProcessRole::Bridge, "exec sleep 300"))
        .expect("launch");
    let pid = handle.pid().expect("pid");
    assert!(!handle.has_exited());

    let outcome = tokio::time::timeout(Duration::from_secs(5), handle.terminate())
        .await
        .expect("terminated");
    assert_eq!(outcome, ExitOutcome::Signaled { signal: 15 });
    assert!(!alive(pid), "process {pid} must be reaped");
}

#[tokio::test]
async fn terminate_reaches_the_whole_group() {
    let handle = supervisor()
        .launch(
            "t",
            sh(ProcessRole::FrameExport, "sleep 300 & echo $!; wait"),
        )
        .expect("launch");

    let grandchild = wait_for_output(&handle).await;
    let grandchild: u32 = grandchild.trim().parse().expect("pid line");
    assert!(alive(grandchild));

    handle.terminate().await;
    // The grandchild is reaped by init; give it a moment.
    let gone = wait_until(Duration::from_secs(3), || !alive(grandchild)).await;
    assert!(gone, "grandchild {grandchild} survived group termination");
}

#[tokio::test]
async fn sigterm_ignored_escalates_to_sigkill() {
    let handle = supervisor()
        .launch(
            "t",
            sh(ProcessRole::WindowManager, "trap '' TERM; echo armed; while true; do sleep 0.05; done"),
        )
        .expect("launch");
    wait_for_output(&handle).await;

    let outcome = tokio::time::timeout(Duration::from_secs(5), handle.terminate())
        .await
        .expect("killed");
    assert_eq!(outcome, ExitOutcome::Signaled { signal: 9 });
}

#[tokio::test]
async fn terminate_is_idempotent() {
    let handle = supervisor()
        .launch("t", sh(ProcessRole::Bridge, "exec sleep 300"))
        .expect("launch");
    let (first, second) = tokio::join!(handle.terminate(), handle.terminate());
    assert_eq!(first, second);
    assert_eq!(handle.terminate().await, first);
}

#[tokio::test]
async fn terminate_after_exit_returns_recorded_outcome() {
    let handle = supervisor()
        .launch("t", sh(ProcessRole::Application, "exit 0"))
        .expect("launch");
    handle.wait_for_exit().await;
    assert_eq!(handle.terminate().await, ExitOutcome::Exited { code: 0 });
}

#[tokio::test]
async fn terminate_after_leader_exit_clears_the_group() {
    let handle = supervisor()
        .launch(
            "t",
            sh(ProcessRole::Application, "sleep 300 & echo $!; sleep 0.2; exit 1"),
        )
        .expect("launch");

    let straggler: u32 = wait_for_output(&handle).await.trim().parse().expect("pid line");
    assert_eq!(handle.wait_for_exit().await, ExitOutcome::Exited { code: 1 });
    assert!(alive(straggler), "background job should outlive its leader");

    let outcome = tokio::time::timeout(Duration::from_secs(5), handle.terminate())
        .await
        .expect("sweep finishes");
    assert_eq!(outcome, ExitOutcome::Exited { code: 1 });
    let gone = wait_until(Duration::from_secs(3), || !alive(straggler)).await;
    assert!(gone, "background job {straggler} survived terminate");
}

#[tokio::test]
async fn captures_output_and_environment() {
    let mut spec = sh(ProcessRole::Application, "echo \"display=$DISPLAY\"; echo oops >&2");
    spec.env.push(("DISPLAY".into(), ":123".into()));
    let handle = supervisor().launch("t", spec).expect("launch");
    handle.wait_for_exit().await;

    let ok = wait_until(Duration::from_secs(2), || handle.recent_output().len() == 2).await;
    assert!(ok, "output: {:?}", handle.recent_output());
    let output = handle.recent_output();
    assert!(output.contains(&"display=:123".to_owned()));
    assert!(output.contains(&"oops".to_owned()));

    let details = handle.details();
    assert_eq!(details.role, ProcessRole::Application);
    assert_eq!(details.exit, Some(ExitOutcome::Exited { code: 0 }));
}

#[tokio::test]
async fn output_buffer_is_bounded() {
    let handle = supervisor()
        .launch("t", sh(ProcessRole::Application, "i=0; while [ $i -lt 500 ]; do echo line$i; i=$((i+1)); done"))
        .expect("launch");
    handle.wait_for_exit().await;

    let done = wait_until(Duration::from_secs(2), || {
        handle.recent_output().last().map(String::as_str) == Some("line499")
    })
    .await;
    assert!(done);
    let output = handle.recent_output();
    assert_eq!(output.len(), 200);
    assert_eq!(output[0], "line300");
}

#[tokio::test]
async fn dropping_the_handle_kills_the_process() {
    let handle = supervisor()
        .launch("t", sh(ProcessRole::Bridge, "exec sleep 300"))
        .expect("launch");
    let pid = handle.pid().expect("pid");
    drop(handle);

    let gone = wait_until(Duration::from_secs(3), || !alive(pid)).await;
    assert!(gone, "process {pid} outlived its handle");
}

#[tokio::test]
async fn runs_in_requested_directory() {
    let dir = tempfile::tempdir().expect("tempdir");
    let mut spec = sh(ProcessRole::Application, "pwd");
    spec.current_dir = Some(dir.path().to_path_buf());
    let handle = supervisor().launch("t", spec).expect("launch");
    handle.wait_for_exit().await;

    let expected = dir.path().canonicalize().expect("canonical");
    let ok = wait_until(Duration::from_secs(2), || {
        handle
            .recent_output()
            .first()
            .is_some_and(|line| std::path::Path::new(line).canonicalize().ok() == Some(expected.clone()))
    })
    .await;
    assert!(ok, "output: {:?}", handle.recent_output());
}

async fn wait_for_output(
    handle: &vdesk_orchestrator::orchestrator::supervisor::ProcessHandle,
) -> String {
    for _ in 0..100 {
        if let Some(line) = handle.recent_output().first() {
            return line.clone();
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("no output from {}", handle.program());
}

async fn wait_until(limit: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + limit;
    while tokio::time::Instant::now() < deadline {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    condition()
}
