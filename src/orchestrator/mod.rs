//! Session orchestration.
//!
//! Covers resource allocation, process supervision, the per-session
//! startup and teardown sequence, and the registry of live sessions.

pub mod allocator;
pub mod launch;
pub mod profile;
pub mod readiness;
pub mod registry;
pub mod session;
pub mod supervisor;

pub use allocator::{AvailabilityProbe, ResourceAllocator, ResourceLease, SystemProbe};
pub use registry::{RegistryEvent, SessionRegistry};
pub use session::{Session, SessionEvent, SessionServices};
pub use supervisor::{LaunchSpec, ProcessHandle, ProcessSupervisor};
