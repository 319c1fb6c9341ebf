//! Display number and port allocation.
//!
//! Slot `k` of the pool maps to display `base_display + k`, frame-export
//! port `base_export_port + k` and bridge port `base_bridge_port + k`.
//! All three axes advance together, so uniqueness of the slot implies
//! uniqueness of every value in it. Allocation is serialized behind a
//! single mutex; the critical section never awaits.

use std::net::{Ipv4Addr, TcpListener};
use std::path::PathBuf;
use std::sync::{Arc, Mutex, PoisonError};

use tracing::{debug, info};

use crate::config::{AllocationConfig, AllocationPolicy};
use crate::{AppError, Result};

/// Resources owned by one session for its whole lifetime.
///
/// Not `Clone`: a lease is returned to the allocator exactly once.
#[derive(Debug, PartialEq, Eq)]
pub struct ResourceLease {
    slot: u16,
    display: u32,
    export_port: u16,
    bridge_port: u16,
}

impl ResourceLease {
    /// Pool slot index.
    #[must_use]
    pub fn slot(&self) -> u16 {
        self.slot
    }

    /// Display number.
    #[must_use]
    pub fn display(&self) -> u32 {
        self.display
    }

    /// X display name, e.g. `:100`.
    #[must_use]
    pub fn display_name(&self) -> String {
        format!(":{}", self.display)
    }

    /// Frame-export port.
    #[must_use]
    pub fn export_port(&self) -> u16 {
        self.export_port
    }

    /// Bridge port.
    #[must_use]
    pub fn bridge_port(&self) -> u16 {
        self.bridge_port
    }
}

/// Checks whether a slot's resources are free on the host.
pub trait AvailabilityProbe: Send + Sync {
    /// `true` when nothing outside this process holds the display or ports.
    fn is_available(&self, display: u32, export_port: u16, bridge_port: u16) -> bool;
}

/// Probe backed by the local system: TCP binds and X server lock files.
#[derive(Debug, Clone)]
pub struct SystemProbe {
    x11_socket_dir: PathBuf,
    lock_dir: PathBuf,
}

impl SystemProbe {
    /// Build a probe that looks for X sockets in `x11_socket_dir` and lock
    /// files (`.X{n}-lock`) in `lock_dir`.
    #[must_use]
    pub fn new(x11_socket_dir: PathBuf, lock_dir: PathBuf) -> Self {
        Self {
            x11_socket_dir,
            lock_dir,
        }
    }

    fn port_free(port: u16) -> bool {
        TcpListener::bind((Ipv4Addr::UNSPECIFIED, port)).is_ok()
    }
}

impl AvailabilityProbe for SystemProbe {
    fn is_available(&self, number: u32, export_port: u16, bridge_port: u16) -> bool {
        let lock = self.lock_dir.join(format!(".X{number}-lock"));
        let socket = self.x11_socket_dir.join(format!("X{number}"));
        if lock.exists() || socket.exists() {
            debug!(display = number, "display number held by a foreign X server");
            return false;
        }
        Self::port_free(export_port) && Self::port_free(bridge_port)
    }
}

#[derive(Debug)]
struct PoolState {
    in_use: Vec<bool>,
    next_monotonic: u16,
}

/// Process-wide allocator for display numbers and port pairs.
pub struct ResourceAllocator {
    config: AllocationConfig,
    probe: Option<Arc<dyn AvailabilityProbe>>,
    state: Mutex<PoolState>,
}

impl std::fmt::Debug for ResourceAllocator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResourceAllocator")
            .field("config", &self.config)
            .field("probing", &self.probe.is_some())
            .finish_non_exhaustive()
    }
}

impl ResourceAllocator {
    /// Create an allocator without host probing.
    #[must_use]
    pub fn new(config: AllocationConfig) -> Self {
        let slots = usize::from(config.capacity);
        Self {
            config,
            probe: None,
            state: Mutex::new(PoolState {
                in_use: vec![false; slots],
                next_monotonic: 0,
            }),
        }
    }

    /// Attach a host availability probe.
    #[must_use]
    pub fn with_probe(mut self, probe: Arc<dyn AvailabilityProbe>) -> Self {
        self.probe = Some(probe);
        self
    }

    /// Hand out the next free slot.
    ///
    /// Under [`AllocationPolicy::Recycle`] the lowest free slot is chosen;
    /// under [`AllocationPolicy::Monotonic`] slots are issued strictly
    /// increasing and never revisited.
    ///
    /// # Errors
    ///
    /// Returns `AppError::AllocationExhausted` when every slot is leased,
    /// consumed, or held by a foreign process.
    pub fn allocate(&self) -> Result<ResourceLease> {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);

        let slot = match self.config.policy {
            AllocationPolicy::Recycle => (0..self.config.capacity)
                .find(|&slot| !state.in_use[usize::from(slot)] && self.slot_available(slot)),
            AllocationPolicy::Monotonic => {
                let mut found = None;
                while state.next_monotonic < self.config.capacity {
                    let candidate = state.next_monotonic;
                    state.next_monotonic += 1;
                    if self.slot_available(candidate) {
                        found = Some(candidate);
                        break;
                    }
                }
                found
            }
        };

        let Some(slot) = slot else {
            return Err(AppError::AllocationExhausted(format!(
                "no free slot among {} ({} leased)",
                self.config.capacity,
                state.in_use.iter().filter(|used| **used).count()
            )));
        };

        state.in_use[usize::from(slot)] = true;
        let lease = self.lease_for(slot);
        info!(
            slot,
            display = lease.display,
            export_port = lease.export_port,
            bridge_port = lease.bridge_port,
            "resources allocated"
        );
        Ok(lease)
    }

    /// Return a lease to the pool.
    ///
    /// Under the monotonic policy the slot is marked idle but never reissued.
    pub fn release(&self, lease: ResourceLease) {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(used) = state.in_use.get_mut(usize::from(lease.slot)) {
            *used = false;
        }
        debug!(slot = lease.slot, display = lease.display, "resources released");
    }

    /// Number of slots currently leased.
    #[must_use]
    pub fn leased(&self) -> usize {
        let state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        state.in_use.iter().filter(|used| **used).count()
    }

    /// Total number of slots.
    #[must_use]
    pub fn capacity(&self) -> u16 {
        self.config.capacity
    }

    fn slot_available(&self, slot: u16) -> bool {
        let Some(probe) = &self.probe else {
            return true;
        };
        let lease = self.lease_for(slot);
        probe.is_available(lease.display, lease.export_port, lease.bridge_port)
    }

    // Config validation guarantees every base + slot sum fits its type.
    fn lease_for(&self, slot: u16) -> ResourceLease {
        ResourceLease {
            slot,
            display: self.config.base_display + u32::from(slot),
            export_port: self.config.base_export_port + slot,
            bridge_port: self.config.base_bridge_port + slot,
        }
    }
}
