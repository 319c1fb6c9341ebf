//! `xrandr`-backed display controller.

use std::process::Stdio;
use std::time::Duration;

use tokio::process::Command;
use tracing::debug;

use crate::AppError;

use super::{ControlFuture, DisplayController, Modeline};

/// Runs the configured `xrandr` program against a display.
#[derive(Debug, Clone)]
pub struct XrandrController {
    program: String,
    timeout: Duration,
}

impl XrandrController {
    /// Create a controller invoking `program`, bounding each call by `timeout`.
    #[must_use]
    pub fn new(program: String, timeout: Duration) -> Self {
        Self { program, timeout }
    }

    /// Run one invocation. Returns the trimmed stderr on failure.
    async fn run(&self, display_name: &str, args: Vec<String>) -> std::result::Result<(), String> {
        debug!(display = %display_name, program = self.program, ?args, "running display control");

        let mut cmd = Command::new(&self.program);
        cmd.args(&args)
            .env("DISPLAY", display_name)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let output = match tokio::time::timeout(self.timeout, cmd.output()).await {
            Ok(Ok(output)) => output,
            Ok(Err(err)) => return Err(format!("failed to run {}: {err}", self.program)),
            Err(_) => return Err(format!("{} timed out after {:?}", self.program, self.timeout)),
        };

        if output.status.success() {
            Ok(())
        } else {
            let stderr = String::from_utf8_lossy(&output.stderr).trim().to_owned();
            Err(format!("{} {}: {stderr}", self.program, output.status))
        }
    }
}

impl DisplayController for XrandrController {
    fn register_mode<'a>(&'a self, display_name: &'a str, mode: &'a Modeline) -> ControlFuture<'a> {
        Box::pin(async move {
            let mut args = vec!["--newmode".to_owned()];
            args.extend(mode.newmode_args());
            match self.run(display_name, args).await {
                Ok(()) => Ok(()),
                // X reports a duplicate mode name as BadName.
                Err(stderr) if stderr.contains("BadName") => {
                    debug!(display = %display_name, mode = %mode.name, "mode already registered");
                    Ok(())
                }
                Err(stderr) => Err(AppError::Geometry(format!("register mode: {stderr}"))),
            }
        })
    }

    fn attach_mode<'a>(
        &'a self,
        display_name: &'a str,
        output: &'a str,
        name: &'a str,
    ) -> ControlFuture<'a> {
        Box::pin(async move {
            let args = vec!["--addmode".to_owned(), output.to_owned(), name.to_owned()];
            self.run(display_name, args)
                .await
                .map_err(|stderr| AppError::Geometry(format!("attach mode: {stderr}")))
        })
    }

    fn activate_mode<'a>(
        &'a self,
        display_name: &'a str,
        output: &'a str,
        name: &'a str,
    ) -> ControlFuture<'a> {
        Box::pin(async move {
            let args = vec![
                "--output".to_owned(),
                output.to_owned(),
                "--mode".to_owned(),
                name.to_owned(),
            ];
            self.run(display_name, args)
                .await
                .map_err(|stderr| AppError::Geometry(format!("activate mode: {stderr}")))
        })
    }
}
