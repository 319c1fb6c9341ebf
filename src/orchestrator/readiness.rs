//! Display readiness.
//!
//! In `socket` mode the orchestrator polls the X server's Unix socket until
//! it accepts a connection; in `settle` mode it waits a fixed delay. Either
//! way, the display process exiting first is a launch failure.

use std::path::{Path, PathBuf};
use std::time::Duration;

use tokio::net::UnixStream;
use tracing::{debug, info};

use crate::config::{ReadinessMode, TimingConfig};
use crate::orchestrator::supervisor::ProcessHandle;
use crate::{AppError, Result};

const POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Socket path of display `number` under `socket_dir`.
#[must_use]
pub fn x11_socket_path(socket_dir: &Path, number: u32) -> PathBuf {
    socket_dir.join(format!("X{number}"))
}

/// Wait until the display launched as `process` is usable.
///
/// # Errors
///
/// Returns `AppError::Launch` if the display exits first or, in `socket`
/// mode, does not accept connections within the configured timeout.
pub async fn wait_for_display(
    process: &ProcessHandle,
    number: u32,
    timing: &TimingConfig,
) -> Result<()> {
    let ready = async {
        match timing.display_readiness {
            ReadinessMode::Settle => {
                tokio::time::sleep(timing.display_settle()).await;
                Ok(())
            }
            ReadinessMode::Socket => {
                let socket = x11_socket_path(&timing.x11_socket_dir, number);
                tokio::time::timeout(timing.display_ready_timeout(), poll_socket(&socket))
                    .await
                    .map_err(|_| {
                        AppError::Launch(format!(
                            "display :{number} not ready after {:?}",
                            timing.display_ready_timeout()
                        ))
                    })
            }
        }
    };

    tokio::select! {
        result = ready => {
            if result.is_ok() {
                info!(display = number, "display ready");
            }
            result
        }
        outcome = process.wait_for_exit() => Err(AppError::Launch(format!(
            "display :{number} {outcome} before becoming ready"
        ))),
    }
}

async fn poll_socket(socket: &Path) {
    loop {
        match UnixStream::connect(socket).await {
            Ok(_) => return,
            Err(err) => debug!(%err, socket = %socket.display(), "display socket not ready"),
        }
        tokio::time::sleep(POLL_INTERVAL).await;
    }
}
