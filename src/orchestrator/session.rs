//! One desktop session: resources, supervised processes, lifecycle.
//!
//! A session is driven through `Provisioning → Running ⇄ Resizing →
//! Terminating → Terminated`. The state lives in a `watch` channel so that
//! transitions are atomic compare-and-set operations and so that callers
//! arriving at teardown second can wait for the first caller to finish.
//!
//! When teardown completes the session emits [`SessionEvent::Terminated`]
//! on the channel handed to it at construction; the registry listens there.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures_util::future::join_all;
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;
use tracing::{info, info_span, warn, Instrument};

use crate::config::GlobalConfig;
use crate::geometry::GeometryReconfigurer;
use crate::models::session::{
    ProcessRole, ScreenSize, SessionDetails, SessionState, SessionSummary, TerminationReason,
};
use crate::orchestrator::allocator::{ResourceAllocator, ResourceLease};
use crate::orchestrator::launch::LaunchContext;
use crate::orchestrator::profile::{remove_work_dir, WorkDir};
use crate::orchestrator::readiness::wait_for_display;
use crate::orchestrator::supervisor::{wait_exit, ProcessHandle, ProcessSupervisor};
use crate::{AppError, Result};

/// Lifecycle notifications emitted by sessions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    /// Teardown finished: processes reaped, directory removed, lease returned.
    Terminated {
        /// Session that ended.
        session_id: String,
        /// Why it ended.
        reason: TerminationReason,
    },
}

/// Collaborators shared by every session.
#[derive(Debug, Clone)]
pub struct SessionServices {
    /// Global configuration.
    pub config: Arc<GlobalConfig>,
    /// Display/port allocator leases are returned to.
    pub allocator: Arc<ResourceAllocator>,
    /// Process launcher.
    pub supervisor: ProcessSupervisor,
    /// Display geometry control.
    pub geometry: GeometryReconfigurer,
    /// Channel teardown completion is reported on.
    pub events: mpsc::Sender<SessionEvent>,
}

/// A provisioned desktop session.
#[derive(Debug)]
pub struct Session {
    id: String,
    display: u32,
    export_port: u16,
    bridge_port: u16,
    work_dir: PathBuf,
    created_at: DateTime<Utc>,
    lease: Mutex<Option<ResourceLease>>,
    state: watch::Sender<SessionState>,
    geometry: Mutex<ScreenSize>,
    processes: Mutex<BTreeMap<ProcessRole, Arc<ProcessHandle>>>,
    termination: Mutex<Option<TerminationReason>>,
    resize_lock: tokio::sync::Mutex<()>,
    cancel: CancellationToken,
    services: Arc<SessionServices>,
}

impl Session {
    /// Construct a session in `Provisioning` state. Nothing is launched yet.
    #[must_use]
    pub fn new(
        id: String,
        lease: ResourceLease,
        geometry: ScreenSize,
        services: Arc<SessionServices>,
    ) -> Arc<Self> {
        let work_dir = services.config.work_dir_for(&id);
        let (state, _) = watch::channel(SessionState::Provisioning);
        Arc::new(Self {
            display: lease.display(),
            export_port: lease.export_port(),
            bridge_port: lease.bridge_port(),
            id,
            work_dir,
            created_at: Utc::now(),
            lease: Mutex::new(Some(lease)),
            state,
            geometry: Mutex::new(geometry),
            processes: Mutex::new(BTreeMap::new()),
            termination: Mutex::new(None),
            resize_lock: tokio::sync::Mutex::new(()),
            cancel: CancellationToken::new(),
            services,
        })
    }

    /// Session identifier.
    #[must_use]
    pub fn id(&self) -> &str {
        &self.id
    }

    /// X display name, e.g. `:100`.
    #[must_use]
    pub fn display_name(&self) -> String {
        format!(":{}", self.display)
    }

    /// Working directory path.
    #[must_use]
    pub fn work_dir(&self) -> &Path {
        &self.work_dir
    }

    /// Current lifecycle state.
    #[must_use]
    pub fn state(&self) -> SessionState {
        *self.state.borrow()
    }

    /// Current geometry.
    #[must_use]
    pub fn geometry(&self) -> ScreenSize {
        *self.geometry.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Why the session ended, once teardown has started.
    #[must_use]
    pub fn termination_reason(&self) -> Option<TerminationReason> {
        self.termination
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Public summary.
    #[must_use]
    pub fn summary(&self) -> SessionSummary {
        SessionSummary {
            id: self.id.clone(),
            display: self.display,
            bridge_port: self.bridge_port,
            created_at: self.created_at,
        }
    }

    /// Diagnostic snapshot.
    #[must_use]
    pub fn details(&self) -> SessionDetails {
        let processes = self
            .processes
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .map(|handle| handle.details())
            .collect();
        SessionDetails {
            id: self.id.clone(),
            state: self.state(),
            display: self.display,
            export_port: self.export_port,
            bridge_port: self.bridge_port,
            geometry: self.geometry(),
            work_dir: self.work_dir.clone(),
            created_at: self.created_at,
            processes,
        }
    }

    /// Run the ordered startup sequence.
    ///
    /// On failure the session is torn down before the error is returned.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Launch` if a collaborator cannot be started or
    /// the display never becomes ready, or `AppError::Io` if the working
    /// directory cannot be prepared.
    pub async fn provision(&self) -> Result<()> {
        let span = info_span!("provision", session_id = %self.id, display = self.display);
        let result = self.run_startup().instrument(span).await;

        match result {
            Ok(()) => {
                if self.transition(SessionState::Provisioning, SessionState::Running) {
                    info!(
                        session_id = %self.id,
                        display = self.display,
                        bridge_port = self.bridge_port,
                        "session running"
                    );
                    Ok(())
                } else {
                    Err(AppError::Launch(format!(
                        "session {} ended during provisioning",
                        self.id
                    )))
                }
            }
            Err(err) => {
                warn!(session_id = %self.id, %err, "provisioning failed");
                self.terminate(TerminationReason::StartupFailed {
                    detail: err.to_string(),
                })
                .await;
                Err(err)
            }
        }
    }

    async fn run_startup(&self) -> Result<()> {
        let config = &self.services.config;

        let work_dir =
            WorkDir::prepare(self.work_dir.clone(), config.template_profile.as_deref()).await?;

        let display = self.launch(&self.launch_context(&work_dir)?, ProcessRole::Display)?;
        wait_for_display(&display, self.display, &config.timing).await?;
        let geometry = &self.services.geometry;
        if let Err(err) = geometry
            .apply_initial(&self.display_name(), self.geometry())
            .await
        {
            // The display keeps the size it was started with.
            let fallback = geometry.framebuffer();
            warn!(session_id = %self.id, %err, "initial geometry not applied, display stays at {fallback}");
            *self.geometry.lock().unwrap_or_else(PoisonError::into_inner) = fallback;
        }

        let ctx = self.launch_context(&work_dir)?;
        let window_manager = self.launch(&ctx, ProcessRole::WindowManager)?;
        settle(&window_manager, config.timing.window_manager_settle()).await?;

        self.launch(&ctx, ProcessRole::FrameExport)?;
        self.launch(&ctx, ProcessRole::Bridge)?;
        self.launch(&ctx, ProcessRole::Application)?;
        Ok(())
    }

    fn launch_context(&self, work_dir: &WorkDir) -> Result<LaunchContext> {
        let lease = self.lease.lock().unwrap_or_else(PoisonError::into_inner);
        let lease = lease
            .as_ref()
            .ok_or_else(|| AppError::Launch("session lease already released".into()))?;
        Ok(LaunchContext::new(
            &self.id,
            lease,
            work_dir.path(),
            work_dir.wm_config(),
            self.geometry(),
            &self.services.config,
        ))
    }

    fn launch(&self, ctx: &LaunchContext, role: ProcessRole) -> Result<Arc<ProcessHandle>> {
        let spec = ctx.spec(role, self.services.config.programs.for_role(role));
        let handle = Arc::new(self.services.supervisor.launch(&self.id, spec)?);
        self.processes
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(role, Arc::clone(&handle));
        Ok(handle)
    }

    /// Start watching every owned process. The first exit ends the session:
    /// the application's exit is a normal end, any other is unexpected.
    ///
    /// Called once the session is reachable from the registry so that an
    /// exit is always followed by a removal.
    pub fn arm(self: &Arc<Self>) {
        let handles: Vec<(ProcessRole, Arc<ProcessHandle>)> = self
            .processes
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(|(role, handle)| (*role, Arc::clone(handle)))
            .collect();

        for (role, handle) in handles {
            let session = Arc::clone(self);
            let cancel = self.cancel.clone();
            tokio::spawn(async move {
                tokio::select! {
                    () = cancel.cancelled() => {}
                    outcome = wait_exit(handle.exit_watch()) => {
                        let reason = if role == ProcessRole::Application {
                            info!(session_id = %session.id, %outcome, "application exited");
                            TerminationReason::ApplicationExited { outcome }
                        } else {
                            let err = AppError::UnexpectedExit(format!(
                                "{role} ({}) {outcome}",
                                handle.program()
                            ));
                            warn!(session_id = %session.id, role = %role, %err, "ending session");
                            TerminationReason::UnexpectedExit { role, outcome }
                        };
                        session.terminate(reason).await;
                    }
                }
            });
        }
    }

    /// Resize the session's display.
    ///
    /// A request with a non-positive dimension is a no-op success and leaves
    /// the stored geometry untouched. On failure the previous geometry is
    /// restored and the session keeps running.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Geometry` if the size is not representable or the
    /// mode cannot be applied, or
    /// `AppError::NotFound` if the session is not running.
    pub async fn resize(&self, width: i64, height: i64) -> Result<()> {
        let Some(size) = ScreenSize::from_request(width, height)? else {
            return Ok(());
        };

        let _serial = self.resize_lock.lock().await;
        if !self.transition(SessionState::Running, SessionState::Resizing) {
            return Err(AppError::NotFound(format!(
                "session {} is {:?}",
                self.id,
                self.state()
            )));
        }

        let previous = std::mem::replace(
            &mut *self.geometry.lock().unwrap_or_else(PoisonError::into_inner),
            size,
        );
        let span = info_span!("resize", session_id = %self.id, width = size.width, height = size.height);
        let result = self
            .services
            .geometry
            .apply_size(&self.display_name(), size)
            .instrument(span)
            .await;

        if let Err(err) = &result {
            warn!(session_id = %self.id, %err, "resize failed, keeping {previous}");
            *self.geometry.lock().unwrap_or_else(PoisonError::into_inner) = previous;
        }
        self.transition(SessionState::Resizing, SessionState::Running);
        result
    }

    /// Tear the session down.
    ///
    /// The first caller kills every owned process, removes the working
    /// directory, returns the lease and emits [`SessionEvent::Terminated`].
    /// Later or concurrent callers wait for that to finish and do nothing.
    /// Returns `true` for the caller that performed the teardown.
    pub async fn terminate(&self, reason: TerminationReason) -> bool {
        let started = self.state.send_if_modified(|state| {
            if state.can_transition_to(SessionState::Terminating) {
                *state = SessionState::Terminating;
                true
            } else {
                false
            }
        });

        if !started {
            let mut rx = self.state.subscribe();
            let _ = rx.wait_for(|state| *state == SessionState::Terminated).await;
            return false;
        }

        let span = info_span!("teardown", session_id = %self.id, reason = %reason);
        self.run_teardown(reason).instrument(span).await;
        true
    }

    async fn run_teardown(&self, reason: TerminationReason) {
        *self
            .termination
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(reason.clone());
        self.cancel.cancel();

        let handles: Vec<Arc<ProcessHandle>> = std::mem::take(
            &mut *self.processes.lock().unwrap_or_else(PoisonError::into_inner),
        )
        .into_values()
        .collect();
        let outcomes = join_all(handles.iter().map(|handle| handle.terminate())).await;
        for (handle, outcome) in handles.iter().zip(outcomes) {
            info!(
                role = %handle.role(),
                program = handle.program(),
                pid = handle.pid().unwrap_or(0),
                %outcome,
                "process reaped"
            );
        }

        let removed = remove_work_dir(&self.work_dir).await;

        let lease = self
            .lease
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(lease) = lease {
            self.services.allocator.release(lease);
        }

        self.state.send_replace(SessionState::Terminated);
        info!(work_dir_removed = removed, %reason, "session terminated");

        let event = SessionEvent::Terminated {
            session_id: self.id.clone(),
            reason,
        };
        if self.services.events.send(event).await.is_err() {
            warn!(session_id = %self.id, "session event receiver closed");
        }
    }

    fn transition(&self, from: SessionState, to: SessionState) -> bool {
        self.state.send_if_modified(|state| {
            if *state == from && from.can_transition_to(to) {
                *state = to;
                true
            } else {
                false
            }
        })
    }
}

/// Wait a fixed settle delay, failing if `process` exits meanwhile.
async fn settle(process: &ProcessHandle, delay: Duration) -> Result<()> {
    tokio::select! {
        () = tokio::time::sleep(delay) => Ok(()),
        outcome = process.wait_for_exit() => Err(AppError::Launch(format!(
            "{} {outcome} during startup",
            process.role()
        ))),
    }
}
