//! Session model and lifecycle helpers.

use std::fmt::{Display, Formatter};
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{AppError, Result};

/// Lifecycle state of a desktop session.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    /// Resources allocated, startup sequence in progress.
    Provisioning,
    /// All collaborators launched; session usable.
    Running,
    /// A geometry change is being applied; returns to `Running`.
    Resizing,
    /// Teardown in progress.
    Terminating,
    /// All owned processes reaped and the working directory removed.
    Terminated,
}

impl SessionState {
    /// Determine whether a lifecycle transition is permitted.
    #[must_use]
    pub fn can_transition_to(self, next: Self) -> bool {
        matches!(
            (self, next),
            (Self::Provisioning, Self::Running)
                | (Self::Running, Self::Resizing)
                | (Self::Resizing, Self::Running)
                | (
                    Self::Provisioning | Self::Running | Self::Resizing,
                    Self::Terminating
                )
                | (Self::Terminating, Self::Terminated)
        )
    }

    /// Whether teardown has started or finished.
    #[must_use]
    pub fn is_ending(self) -> bool {
        matches!(self, Self::Terminating | Self::Terminated)
    }
}

/// Role a supervised process plays within a session.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "snake_case")]
pub enum ProcessRole {
    /// Virtual display server.
    Display,
    /// Window manager attached to the display.
    WindowManager,
    /// Remote-framebuffer exporter.
    FrameExport,
    /// Byte-stream bridge in front of the exporter.
    Bridge,
    /// The session's application; its exit ends the session.
    Application,
}

impl ProcessRole {
    /// All roles in startup order.
    pub const ALL: [Self; 5] = [
        Self::Display,
        Self::WindowManager,
        Self::FrameExport,
        Self::Bridge,
        Self::Application,
    ];

    /// Key used for this role under `[programs]` in the config file.
    #[must_use]
    pub fn config_key(self) -> &'static str {
        match self {
            Self::Display => "display",
            Self::WindowManager => "window_manager",
            Self::FrameExport => "frame_export",
            Self::Bridge => "bridge",
            Self::Application => "application",
        }
    }
}

impl Display for ProcessRole {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.config_key())
    }
}

/// A positive screen size in pixels.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct ScreenSize {
    /// Width in pixels.
    pub width: u32,
    /// Height in pixels.
    pub height: u32,
}

impl ScreenSize {
    /// Build a size from a client request.
    ///
    /// Returns `Ok(None)` unless both dimensions are positive.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Geometry` if a positive dimension does not fit in
    /// `u32`.
    pub fn from_request(width: i64, height: i64) -> Result<Option<Self>> {
        if width <= 0 || height <= 0 {
            return Ok(None);
        }
        match (u32::try_from(width), u32::try_from(height)) {
            (Ok(width), Ok(height)) => Ok(Some(Self { width, height })),
            _ => Err(AppError::Geometry(format!(
                "{width}x{height} is not a representable screen size"
            ))),
        }
    }

    /// Whether both dimensions fit within `max`.
    #[must_use]
    pub fn fits_within(&self, max: Self) -> bool {
        self.width <= max.width && self.height <= max.height
    }
}

impl Display for ScreenSize {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}x{}", self.width, self.height)
    }
}

/// How a supervised process ended.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case", tag = "kind")]
pub enum ExitOutcome {
    /// Process exited on its own with a status code.
    Exited {
        /// Exit status code.
        code: i32,
    },
    /// Process was terminated by a signal.
    Signaled {
        /// Signal number.
        signal: i32,
    },
    /// Exit status could not be collected.
    Lost {
        /// Why the status is unknown.
        reason: String,
    },
}

impl ExitOutcome {
    /// Exit code, when the process exited normally.
    #[must_use]
    pub fn code(&self) -> Option<i32> {
        match self {
            Self::Exited { code } => Some(*code),
            Self::Signaled { .. } | Self::Lost { .. } => None,
        }
    }
}

impl Display for ExitOutcome {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Exited { code } => write!(f, "exited with code {code}"),
            Self::Signaled { signal } => write!(f, "terminated by signal {signal}"),
            Self::Lost { reason } => write!(f, "status unknown ({reason})"),
        }
    }
}

/// Why a session ended.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case", tag = "kind")]
pub enum TerminationReason {
    /// Explicit stop request.
    Stopped,
    /// The application process exited.
    ApplicationExited {
        /// How it exited.
        outcome: ExitOutcome,
    },
    /// A collaborator other than the application died.
    UnexpectedExit {
        /// Role of the process that died.
        role: ProcessRole,
        /// How it exited.
        outcome: ExitOutcome,
    },
    /// Provisioning failed before the session became usable.
    StartupFailed {
        /// Failure description.
        detail: String,
    },
    /// The orchestrator is shutting down.
    Shutdown,
}

impl Display for TerminationReason {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Stopped => f.write_str("stop requested"),
            Self::ApplicationExited { outcome } => write!(f, "application {outcome}"),
            Self::UnexpectedExit { role, outcome } => write!(f, "{role} {outcome}"),
            Self::StartupFailed { detail } => write!(f, "startup failed: {detail}"),
            Self::Shutdown => f.write_str("orchestrator shutdown"),
        }
    }
}

/// Public view of a live session.
///
/// Deliberately excludes process handles and internal resources.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct SessionSummary {
    /// Opaque session identifier.
    pub id: String,
    /// Display number the session's desktop runs on.
    pub display: u32,
    /// Externally reachable bridge port.
    pub bridge_port: u16,
    /// Creation timestamp.
    pub created_at: DateTime<Utc>,
}

impl SessionSummary {
    /// X display name, e.g. `:100`.
    #[must_use]
    pub fn display_name(&self) -> String {
        format!(":{}", self.display)
    }
}

/// Diagnostic view of one supervised process.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct ProcessDetails {
    /// Role within the session.
    pub role: ProcessRole,
    /// OS process id, if the process was started.
    pub pid: Option<u32>,
    /// Exit outcome once the process has ended.
    pub exit: Option<ExitOutcome>,
    /// Most recent stdout/stderr lines.
    pub recent_output: Vec<String>,
}

/// Diagnostic view of a live session.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct SessionDetails {
    /// Opaque session identifier.
    pub id: String,
    /// Current lifecycle state.
    pub state: SessionState,
    /// Display number.
    pub display: u32,
    /// Frame-export port.
    pub export_port: u16,
    /// Bridge port.
    pub bridge_port: u16,
    /// Current screen geometry.
    pub geometry: ScreenSize,
    /// Working directory.
    pub work_dir: PathBuf,
    /// Creation timestamp.
    pub created_at: DateTime<Utc>,
    /// Supervised processes in startup order.
    pub processes: Vec<ProcessDetails>,
}
