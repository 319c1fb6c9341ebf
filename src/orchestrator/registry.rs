//! Process-wide table of live sessions.
//!
//! Entries are inserted only after a session finishes provisioning and are
//! removed exactly once, whether the trigger is a stop request, a process
//! exit observed by the session itself, or orchestrator shutdown. Removal
//! is keyed on the map: only the caller that actually takes the entry out
//! publishes [`RegistryEvent::Removed`].

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, PoisonError, Weak};

use futures_util::future::join_all;
use tokio::sync::{broadcast, mpsc, watch};
use tracing::{debug, info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::config::GlobalConfig;
use crate::geometry::GeometryReconfigurer;
use crate::models::session::{ScreenSize, SessionDetails, SessionSummary, TerminationReason};
use crate::orchestrator::allocator::{ResourceAllocator, SystemProbe};
use crate::orchestrator::session::{Session, SessionEvent, SessionServices};
use crate::orchestrator::supervisor::ProcessSupervisor;
use crate::{AppError, Result};

const SESSION_EVENT_CAPACITY: usize = 64;
const REGISTRY_EVENT_CAPACITY: usize = 64;
const X11_LOCK_DIR: &str = "/tmp";

/// Changes to the registry's membership.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RegistryEvent {
    /// A provisioned session became visible.
    Inserted {
        /// Session identifier.
        session_id: String,
    },
    /// A session left the table. Emitted once per session.
    Removed {
        /// Session identifier.
        session_id: String,
        /// Why it ended.
        reason: TerminationReason,
    },
}

struct Entry {
    seq: u64,
    session: Arc<Session>,
}

#[derive(Default)]
struct Table {
    entries: HashMap<String, Entry>,
    next_seq: u64,
    closed: bool,
}

/// Owner of every live [`Session`].
pub struct SessionRegistry {
    services: Arc<SessionServices>,
    table: Mutex<Table>,
    events: broadcast::Sender<RegistryEvent>,
    /// Creates that are past the closed check but not yet inserted.
    provisioning: watch::Sender<usize>,
}

/// Counts one in-flight create for as long as it is alive.
struct ProvisioningGuard<'a> {
    counter: &'a watch::Sender<usize>,
}

impl Drop for ProvisioningGuard<'_> {
    fn drop(&mut self) {
        self.counter.send_modify(|n| *n = n.saturating_sub(1));
    }
}

impl std::fmt::Debug for SessionRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionRegistry")
            .field("live", &self.len())
            .finish_non_exhaustive()
    }
}

impl SessionRegistry {
    /// Build a registry with the standard collaborators derived from
    /// `config`.
    ///
    /// Must be called from within a Tokio runtime.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Config` if `config` fails validation.
    pub fn new(config: GlobalConfig) -> Result<Arc<Self>> {
        config.validate()?;

        let mut allocator = ResourceAllocator::new(config.allocation.clone());
        if config.allocation.probe_availability {
            allocator = allocator.with_probe(Arc::new(SystemProbe::new(
                config.timing.x11_socket_dir.clone(),
                PathBuf::from(X11_LOCK_DIR),
            )));
        }
        let geometry = GeometryReconfigurer::from_config(&config.geometry);

        Ok(Self::with_collaborators(
            config,
            Arc::new(allocator),
            geometry,
        ))
    }

    /// Build a registry around explicit collaborators.
    ///
    /// Must be called from within a Tokio runtime.
    #[must_use]
    pub fn with_collaborators(
        config: GlobalConfig,
        allocator: Arc<ResourceAllocator>,
        geometry: GeometryReconfigurer,
    ) -> Arc<Self> {
        let (session_tx, session_rx) = mpsc::channel(SESSION_EVENT_CAPACITY);
        let (events, _) = broadcast::channel(REGISTRY_EVENT_CAPACITY);

        let services = Arc::new(SessionServices {
            supervisor: ProcessSupervisor::new(config.timing.terminate_grace()),
            config: Arc::new(config),
            allocator,
            geometry,
            events: session_tx,
        });

        let (provisioning, _) = watch::channel(0);
        let registry = Arc::new(Self {
            services,
            table: Mutex::new(Table::default()),
            events,
            provisioning,
        });

        tokio::spawn(consume_session_events(
            Arc::downgrade(&registry),
            session_rx,
        ));

        registry
    }

    /// Global configuration in effect.
    #[must_use]
    pub fn config(&self) -> &GlobalConfig {
        &self.services.config
    }

    /// Allocator sessions draw resources from.
    #[must_use]
    pub fn allocator(&self) -> &ResourceAllocator {
        &self.services.allocator
    }

    /// Subscribe to membership changes.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<RegistryEvent> {
        self.events.subscribe()
    }

    /// Size a new session starts at: the requested size when both
    /// dimensions are positive and fit the framebuffer, otherwise the
    /// configured default.
    fn initial_geometry(&self, width: Option<i64>, height: Option<i64>) -> ScreenSize {
        let config = &self.services.config.geometry;
        let fallback = ScreenSize {
            width: config.default_width,
            height: config.default_height,
        };
        let (Some(w), Some(h)) = (width, height) else {
            return fallback;
        };
        match ScreenSize::from_request(w, h) {
            Ok(Some(size)) if size.fits_within(self.services.geometry.framebuffer()) => size,
            Ok(None) => fallback,
            Ok(Some(size)) => {
                warn!(requested = %size, %fallback, "requested size exceeds the framebuffer, using default");
                fallback
            }
            Err(err) => {
                warn!(%err, %fallback, "requested size unusable, using default");
                fallback
            }
        }
    }

    /// Provision a new session and make it visible.
    ///
    /// A size is only honored when both dimensions are positive and fit the
    /// display framebuffer; otherwise the configured default geometry is used.
    ///
    /// # Errors
    ///
    /// Returns `AppError::AllocationExhausted` if no resources are free,
    /// `AppError::Launch` if provisioning fails or the registry is shutting
    /// down, or `AppError::Io` if the working directory cannot be prepared.
    pub async fn create(&self, width: Option<i64>, height: Option<i64>) -> Result<SessionSummary> {
        let _provisioning = self.begin_provisioning()?;
        let geometry = self.initial_geometry(width, height);

        let lease = self.services.allocator.allocate()?;
        let id = Uuid::new_v4().to_string();
        let span = info_span!("create_session", session_id = %id, %geometry);

        async move {
            let session = Session::new(id, lease, geometry, Arc::clone(&self.services));
            session.provision().await?;

            let inserted = {
                let mut table = self.table.lock().unwrap_or_else(PoisonError::into_inner);
                if table.closed {
                    false
                } else {
                    let seq = table.next_seq;
                    table.next_seq += 1;
                    table.entries.insert(
                        session.id().to_owned(),
                        Entry {
                            seq,
                            session: Arc::clone(&session),
                        },
                    );
                    true
                }
            };

            if !inserted {
                session.terminate(TerminationReason::Shutdown).await;
                return Err(AppError::Launch("orchestrator is shutting down".into()));
            }

            let _ = self.events.send(RegistryEvent::Inserted {
                session_id: session.id().to_owned(),
            });
            session.arm();

            let summary = session.summary();
            info!(
                display = summary.display,
                bridge_port = summary.bridge_port,
                "session created"
            );
            Ok(summary)
        }
        .instrument(span)
        .await
    }

    /// Live sessions in insertion order.
    #[must_use]
    pub fn list(&self) -> Vec<SessionSummary> {
        let mut live: Vec<(u64, SessionSummary)> = {
            let table = self.table.lock().unwrap_or_else(PoisonError::into_inner);
            table
                .entries
                .values()
                .filter(|entry| !entry.session.state().is_ending())
                .map(|entry| (entry.seq, entry.session.summary()))
                .collect()
        };
        live.sort_by_key(|(seq, _)| *seq);
        live.into_iter().map(|(_, summary)| summary).collect()
    }

    /// Number of entries in the table, including sessions mid-teardown.
    #[must_use]
    pub fn len(&self) -> usize {
        self.table
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entries
            .len()
    }

    /// Whether the table is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Summary of one live session.
    ///
    /// # Errors
    ///
    /// Returns `AppError::NotFound` for an unknown or ending session.
    pub fn get(&self, id: &str) -> Result<SessionSummary> {
        self.live(id).map(|session| session.summary())
    }

    /// Diagnostic snapshot of one live session.
    ///
    /// # Errors
    ///
    /// Returns `AppError::NotFound` for an unknown or ending session.
    pub fn inspect(&self, id: &str) -> Result<SessionDetails> {
        self.live(id).map(|session| session.details())
    }

    /// Stop a session. Returns `false` if `id` is unknown.
    pub async fn stop(&self, id: &str) -> bool {
        let Some(session) = self.lookup(id) else {
            debug!(session_id = id, "stop for unknown session");
            return false;
        };
        session.terminate(TerminationReason::Stopped).await;
        self.remove(id, TerminationReason::Stopped);
        true
    }

    /// Resize a live session's display.
    ///
    /// # Errors
    ///
    /// Returns `AppError::NotFound` for an unknown session, or
    /// `AppError::Geometry` if the new mode cannot be applied.
    pub async fn resize(&self, id: &str, width: i64, height: i64) -> Result<()> {
        let session = self.live(id)?;
        session.resize(width, height).await
    }

    /// Refuse further creates, let in-flight creates finish (they tear
    /// themselves down instead of inserting), then tear down every live
    /// session.
    ///
    /// Returns the number of live sessions torn down.
    pub async fn shutdown(&self) -> usize {
        self.table
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .closed = true;

        let mut pending = self.provisioning.subscribe();
        let in_flight = *pending.borrow_and_update();
        if in_flight > 0 {
            info!(creates = in_flight, "waiting for in-flight creates");
        }
        let _ = pending.wait_for(|n| *n == 0).await;

        let sessions: Vec<Arc<Session>> = {
            let table = self.table.lock().unwrap_or_else(PoisonError::into_inner);
            table
                .entries
                .values()
                .map(|entry| Arc::clone(&entry.session))
                .collect()
        };

        info!(sessions = sessions.len(), "shutting down sessions");
        join_all(
            sessions
                .iter()
                .map(|session| session.terminate(TerminationReason::Shutdown)),
        )
        .await;

        for session in &sessions {
            let reason = session
                .termination_reason()
                .unwrap_or(TerminationReason::Shutdown);
            self.remove(session.id(), reason);
        }
        sessions.len()
    }

    fn begin_provisioning(&self) -> Result<ProvisioningGuard<'_>> {
        let table = self.table.lock().unwrap_or_else(PoisonError::into_inner);
        if table.closed {
            return Err(AppError::Launch("orchestrator is shutting down".into()));
        }
        self.provisioning.send_modify(|n| *n += 1);
        Ok(ProvisioningGuard {
            counter: &self.provisioning,
        })
    }

    fn lookup(&self, id: &str) -> Option<Arc<Session>> {
        self.table
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entries
            .get(id)
            .map(|entry| Arc::clone(&entry.session))
    }

    fn live(&self, id: &str) -> Result<Arc<Session>> {
        self.lookup(id)
            .filter(|session| !session.state().is_ending())
            .ok_or_else(|| AppError::NotFound(format!("session {id}")))
    }

    /// Take `id` out of the table. Only the call that finds the entry
    /// publishes the removal.
    fn remove(&self, id: &str, reason: TerminationReason) -> bool {
        let removed = self
            .table
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entries
            .remove(id)
            .is_some();

        if removed {
            info!(session_id = id, %reason, "session removed");
            let _ = self.events.send(RegistryEvent::Removed {
                session_id: id.to_owned(),
                reason,
            });
        }
        removed
    }
}

/// Drain termination notices from sessions and drop their entries.
async fn consume_session_events(
    registry: Weak<SessionRegistry>,
    mut rx: mpsc::Receiver<SessionEvent>,
) {
    while let Some(event) = rx.recv().await {
        let Some(registry) = registry.upgrade() else {
            warn!("session event after registry dropped");
            break;
        };
        match event {
            SessionEvent::Terminated { session_id, reason } => {
                registry.remove(&session_id, reason);
            }
        }
    }
    debug!("session event loop stopped");
}
