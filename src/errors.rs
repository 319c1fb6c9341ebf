//! Error types shared across the orchestrator.

use std::fmt::{Display, Formatter};

/// Shared application result type.
pub type Result<T> = std::result::Result<T, AppError>;

/// Application error enumeration covering all orchestration failure modes.
#[derive(Debug)]
pub enum AppError {
    /// Configuration parsing or validation failure.
    Config(String),
    /// No display number or port pair is available.
    AllocationExhausted(String),
    /// A required external program could not be started or never became ready.
    Launch(String),
    /// A display mode could not be computed or applied.
    Geometry(String),
    /// A supervised process other than the application died prematurely.
    UnexpectedExit(String),
    /// Requested session does not exist.
    NotFound(String),
    /// Local control socket failure.
    Ipc(String),
    /// File-system or I/O operation failure.
    Io(String),
}

impl AppError {
    /// Whether this error is the "unknown session" outcome.
    #[must_use]
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_))
    }
}

impl Display for AppError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Config(msg) => write!(f, "config: {msg}"),
            Self::AllocationExhausted(msg) => write!(f, "allocation exhausted: {msg}"),
            Self::Launch(msg) => write!(f, "launch failure: {msg}"),
            Self::Geometry(msg) => write!(f, "geometry failure: {msg}"),
            Self::UnexpectedExit(msg) => write!(f, "unexpected exit: {msg}"),
            Self::NotFound(msg) => write!(f, "not found: {msg}"),
            Self::Ipc(msg) => write!(f, "ipc: {msg}"),
            Self::Io(msg) => write!(f, "io: {msg}"),
        }
    }
}

impl std::error::Error for AppError {}

impl From<toml::de::Error> for AppError {
    fn from(err: toml::de::Error) -> Self {
        Self::Config(format!("invalid config: {err}"))
    }
}

impl From<std::io::Error> for AppError {
    fn from(err: std::io::Error) -> Self {
        Self::Io(err.to_string())
    }
}
