#![forbid(unsafe_code)]

//! Virtual desktop session orchestration.
//!
//! Allocates a display number and port pair per session, launches the
//! display, window manager, frame exporter, bridge and application in
//! order, keeps the display geometry in step with client resizes, and
//! tears every session down without leaking processes or directories.

pub mod config;
pub mod errors;
pub mod geometry;
pub mod ipc;
pub mod models;
pub mod orchestrator;

pub use config::GlobalConfig;
pub use errors::{AppError, Result};
pub use orchestrator::SessionRegistry;
