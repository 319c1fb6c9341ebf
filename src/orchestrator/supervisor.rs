//! Supervised child processes.
//!
//! Every process a session owns is launched through [`ProcessSupervisor::launch`],
//! which returns a [`ProcessHandle`]. A background task owns the
//! `tokio::process::Child`; the handle talks to it through channels:
//!
//! - exit is published on a `watch` channel, so any number of observers can
//!   await it without blocking the orchestration flow;
//! - termination is requested through a `oneshot`, so it happens at most
//!   once and only while the child is still unreaped (its pid cannot have
//!   been recycled).
//!
//! Children run in their own process group. Termination sends `SIGTERM`
//! to the group, waits the configured grace, then `SIGKILL`s the group.
//! The group is swept the same way after the leader is reaped, so members
//! that outlive their leader are not left behind.
//! Standard output and error are captured for diagnostics only.

use std::collections::VecDeque;
use std::path::PathBuf;
use std::process::{ExitStatus, Stdio};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use nix::errno::Errno;
use nix::sys::signal::{killpg, Signal};
use nix::unistd::Pid;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::{oneshot, watch};
use tracing::{debug, info, warn};

use crate::models::session::{ExitOutcome, ProcessDetails, ProcessRole};
use crate::{AppError, Result};

/// Lines of output retained per process.
const OUTPUT_LINES: usize = 200;

/// Poll interval while waiting for a process group to empty.
const GROUP_POLL: Duration = Duration::from_millis(20);

/// Fully expanded command line for one collaborator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchSpec {
    /// Role of the process within its session.
    pub role: ProcessRole,
    /// Executable name or path.
    pub program: String,
    /// Arguments.
    pub args: Vec<String>,
    /// Variables added to (or replacing) the inherited environment.
    pub env: Vec<(String, String)>,
    /// Working directory of the child, if any.
    pub current_dir: Option<PathBuf>,
}

#[derive(Debug, Default)]
struct OutputLog {
    lines: VecDeque<String>,
}

impl OutputLog {
    fn push_line(&mut self, line: String) {
        self.lines.push_back(line);
        while self.lines.len() > OUTPUT_LINES {
            self.lines.pop_front();
        }
    }
}

/// Handle to one supervised child process.
#[derive(Debug)]
pub struct ProcessHandle {
    role: ProcessRole,
    program: String,
    session_id: String,
    pid: Option<u32>,
    group: Option<Pid>,
    grace: Duration,
    exit_rx: watch::Receiver<Option<ExitOutcome>>,
    kill_tx: Mutex<Option<oneshot::Sender<()>>>,
    output: Arc<Mutex<OutputLog>>,
}

impl ProcessHandle {
    /// Role of this process.
    #[must_use]
    pub fn role(&self) -> ProcessRole {
        self.role
    }

    /// Program the process was launched from.
    #[must_use]
    pub fn program(&self) -> &str {
        &self.program
    }

    /// OS process id.
    #[must_use]
    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    /// Exit outcome, if the process has ended.
    #[must_use]
    pub fn exit_outcome(&self) -> Option<ExitOutcome> {
        self.exit_rx.borrow().clone()
    }

    /// Whether the process has ended and been reaped.
    #[must_use]
    pub fn has_exited(&self) -> bool {
        self.exit_rx.borrow().is_some()
    }

    /// Receiver that flips to `Some` when the process ends.
    #[must_use]
    pub fn exit_watch(&self) -> watch::Receiver<Option<ExitOutcome>> {
        self.exit_rx.clone()
    }

    /// Wait until the process ends.
    pub async fn wait_for_exit(&self) -> ExitOutcome {
        wait_exit(self.exit_rx.clone()).await
    }

    /// Terminate the process, wait until it has been reaped, then clear
    /// out any other member of its process group.
    ///
    /// Safe to call on an exited or already-terminated handle: the recorded
    /// outcome is returned and the group sweep finds nothing to signal.
    pub async fn terminate(&self) -> ExitOutcome {
        let sender = self
            .kill_tx
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(sender) = sender {
            // The supervising task may already have finished; that is fine.
            let _ = sender.send(());
        }
        let outcome = self.wait_for_exit().await;
        if let Some(group) = self.group {
            sweep_group(group, self.grace, self.role, &self.session_id).await;
        }
        outcome
    }

    /// Most recent lines of stdout/stderr.
    #[must_use]
    pub fn recent_output(&self) -> Vec<String> {
        self.output
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .lines
            .iter()
            .cloned()
            .collect()
    }

    /// Diagnostic snapshot.
    #[must_use]
    pub fn details(&self) -> ProcessDetails {
        ProcessDetails {
            role: self.role,
            pid: self.pid,
            exit: self.exit_outcome(),
            recent_output: self.recent_output(),
        }
    }
}

/// Wait on an exit receiver until it carries an outcome.
pub async fn wait_exit(mut rx: watch::Receiver<Option<ExitOutcome>>) -> ExitOutcome {
    let outcome = rx
        .wait_for(Option::is_some)
        .await
        .map(|value| value.clone())
        .ok()
        .flatten();
    outcome.unwrap_or_else(|| ExitOutcome::Lost {
        reason: "supervisor task ended without reporting".into(),
    })
}

/// Launches and supervises child processes.
#[derive(Debug, Clone)]
pub struct ProcessSupervisor {
    terminate_grace: Duration,
}

impl ProcessSupervisor {
    /// Create a supervisor with the given SIGTERM→SIGKILL grace period.
    #[must_use]
    pub fn new(terminate_grace: Duration) -> Self {
        Self { terminate_grace }
    }

    /// Spawn a process and start supervising it.
    ///
    /// Must be called from within a Tokio runtime.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Launch` if the program cannot be found or exec'd.
    pub fn launch(&self, session_id: &str, spec: LaunchSpec) -> Result<ProcessHandle> {
        let mut cmd = Command::new(&spec.program);
        cmd.args(&spec.args)
            .envs(spec.env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .process_group(0)
            .kill_on_drop(true);
        if let Some(dir) = &spec.current_dir {
            cmd.current_dir(dir);
        }

        let mut child = cmd.spawn().map_err(|err| {
            AppError::Launch(format!(
                "failed to launch {} ({}): {err}",
                spec.role, spec.program
            ))
        })?;

        let pid = child.id();
        let group = pid.and_then(|p| i32::try_from(p).ok()).map(Pid::from_raw);
        let output = Arc::new(Mutex::new(OutputLog::default()));
        if let Some(stdout) = child.stdout.take() {
            spawn_output_reader(stdout, "stdout", spec.role, session_id, Arc::clone(&output));
        }
        if let Some(stderr) = child.stderr.take() {
            spawn_output_reader(stderr, "stderr", spec.role, session_id, Arc::clone(&output));
        }

        info!(
            session_id,
            role = %spec.role,
            program = spec.program,
            pid = pid.unwrap_or(0),
            "process launched"
        );

        let (exit_tx, exit_rx) = watch::channel(None);
        let (kill_tx, kill_rx) = oneshot::channel();
        tokio::spawn(supervise(
            child,
            group,
            spec.role,
            session_id.to_owned(),
            self.terminate_grace,
            kill_rx,
            exit_tx,
        ));

        Ok(ProcessHandle {
            role: spec.role,
            program: spec.program,
            session_id: session_id.to_owned(),
            pid,
            group,
            grace: self.terminate_grace,
            exit_rx,
            kill_tx: Mutex::new(Some(kill_tx)),
            output,
        })
    }
}

fn spawn_output_reader<R>(
    stream: R,
    stream_name: &'static str,
    role: ProcessRole,
    session_id: &str,
    output: Arc<Mutex<OutputLog>>,
) where
    R: AsyncRead + Unpin + Send + 'static,
{
    let session_id = session_id.to_owned();
    tokio::spawn(async move {
        let mut lines = BufReader::new(stream).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            debug!(session_id, role = %role, stream = stream_name, "{line}");
            output
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .push_line(line);
        }
    });
}

async fn supervise(
    mut child: Child,
    group: Option<Pid>,
    role: ProcessRole,
    session_id: String,
    grace: Duration,
    mut kill_rx: oneshot::Receiver<()>,
    exit_tx: watch::Sender<Option<ExitOutcome>>,
) {
    // A dropped handle counts as a termination request.
    let outcome = tokio::select! {
        status = child.wait() => outcome_from(status),
        _ = &mut kill_rx => terminate_child(&mut child, group, role, &session_id, grace).await,
    };

    let pid = group.map_or(0, Pid::as_raw);
    info!(session_id, role = %role, pid, %outcome, "process ended");
    exit_tx.send_replace(Some(outcome));
}

async fn terminate_child(
    child: &mut Child,
    group: Option<Pid>,
    role: ProcessRole,
    session_id: &str,
    grace: Duration,
) -> ExitOutcome {
    if let Some(group) = group {
        signal_group(group, Signal::SIGTERM, role, session_id);
        if let Ok(status) = tokio::time::timeout(grace, child.wait()).await {
            return outcome_from(status);
        }
        warn!(session_id, role = %role, "process ignored SIGTERM, sending SIGKILL");
        // The leader is still unreaped, so the group id cannot have been reused.
        signal_group(group, Signal::SIGKILL, role, session_id);
    }

    if let Err(err) = child.kill().await {
        debug!(session_id, role = %role, %err, "kill after SIGKILL failed");
    }
    outcome_from(child.wait().await)
}

/// Signal a process group. Returns `false` once the group has no members.
fn signal_group(group: Pid, signal: Signal, role: ProcessRole, session_id: &str) -> bool {
    match killpg(group, signal) {
        Ok(()) => true,
        Err(Errno::ESRCH) => false,
        Err(err) => {
            warn!(session_id, role = %role, %err, ?signal, "failed to signal process group");
            false
        }
    }
}

/// Terminate members left in `group` after its leader was reaped:
/// `SIGTERM`, up to `grace` for the group to empty, then `SIGKILL`.
async fn sweep_group(group: Pid, grace: Duration, role: ProcessRole, session_id: &str) {
    if !signal_group(group, Signal::SIGTERM, role, session_id) {
        return;
    }
    debug!(session_id, role = %role, pgid = group.as_raw(), "process group outlived its leader");

    let deadline = tokio::time::Instant::now() + grace;
    while tokio::time::Instant::now() < deadline {
        tokio::time::sleep(GROUP_POLL).await;
        if killpg(group, None).is_err() {
            return;
        }
    }
    warn!(session_id, role = %role, pgid = group.as_raw(), "process group ignored SIGTERM, sending SIGKILL");
    signal_group(group, Signal::SIGKILL, role, session_id);
}

fn outcome_from(status: std::io::Result<ExitStatus>) -> ExitOutcome {
    use std::os::unix::process::ExitStatusExt;

    match status {
        Ok(status) => match (status.code(), status.signal()) {
            (Some(code), _) => ExitOutcome::Exited { code },
            (None, Some(signal)) => ExitOutcome::Signaled { signal },
            (None, None) => ExitOutcome::Lost {
                reason: "no code or signal".into(),
            },
        },
        Err(err) => ExitOutcome::Lost {
            reason: format!("wait error: {err}"),
        },
    }
}
