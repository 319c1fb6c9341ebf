//! Global configuration parsing, validation, and environment overrides.

use std::collections::BTreeMap;
use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

use crate::models::session::ProcessRole;
use crate::{AppError, Result};

/// How display numbers and ports are handed back after a session ends.
#[derive(Debug, Clone, Copy, Default, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum AllocationPolicy {
    /// Released slots return to the pool and are reused lowest-first.
    #[default]
    Recycle,
    /// Slots are issued strictly increasing and never reused.
    Monotonic,
}

/// Display number and port range configuration.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct AllocationConfig {
    /// First display number handed out.
    #[serde(default = "default_base_display")]
    pub base_display: u32,
    /// First frame-export (VNC) port handed out.
    #[serde(default = "default_base_export_port")]
    pub base_export_port: u16,
    /// First bridge (websocket) port handed out.
    #[serde(default = "default_base_bridge_port")]
    pub base_bridge_port: u16,
    /// Number of slots in each range.
    #[serde(default = "default_capacity")]
    pub capacity: u16,
    /// Reuse strategy for released slots.
    #[serde(default)]
    pub policy: AllocationPolicy,
    /// Skip slots whose ports or display are already taken by a foreign process.
    #[serde(default = "default_true")]
    pub probe_availability: bool,
}

impl Default for AllocationConfig {
    fn default() -> Self {
        Self {
            base_display: default_base_display(),
            base_export_port: default_base_export_port(),
            base_bridge_port: default_base_bridge_port(),
            capacity: default_capacity(),
            policy: AllocationPolicy::default(),
            probe_availability: true,
        }
    }
}

fn default_base_display() -> u32 {
    100
}

fn default_base_export_port() -> u16 {
    5900
}

fn default_base_bridge_port() -> u16 {
    6080
}

fn default_capacity() -> u16 {
    64
}

fn default_true() -> bool {
    true
}

/// Screen geometry defaults and the display-control collaborator.
#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(rename_all = "snake_case")]
pub struct GeometryConfig {
    /// Width applied when a session is created without an explicit size.
    #[serde(default = "default_width")]
    pub default_width: u32,
    /// Height applied when a session is created without an explicit size.
    #[serde(default = "default_height")]
    pub default_height: u32,
    /// Framebuffer width the virtual display is started with.
    #[serde(default = "default_max_width")]
    pub max_width: u32,
    /// Framebuffer height the virtual display is started with.
    #[serde(default = "default_max_height")]
    pub max_height: u32,
    /// Color depth of the virtual display.
    #[serde(default = "default_depth")]
    pub depth: u32,
    /// Vertical refresh used when generating modes.
    #[serde(default = "default_refresh_hz")]
    pub refresh_hz: f64,
    /// Name of the display's single logical output.
    #[serde(default = "default_output_name")]
    pub output_name: String,
    /// Program used to register and activate modes.
    #[serde(default = "default_xrandr_program")]
    pub xrandr_program: String,
    /// Delay before the first mode operation against a fresh display.
    #[serde(default = "default_grace_ms")]
    pub grace_ms: u64,
    /// Upper bound for each individual mode operation.
    #[serde(default = "default_command_timeout_ms")]
    pub command_timeout_ms: u64,
}

impl Default for GeometryConfig {
    fn default() -> Self {
        Self {
            default_width: default_width(),
            default_height: default_height(),
            max_width: default_max_width(),
            max_height: default_max_height(),
            depth: default_depth(),
            refresh_hz: default_refresh_hz(),
            output_name: default_output_name(),
            xrandr_program: default_xrandr_program(),
            grace_ms: default_grace_ms(),
            command_timeout_ms: default_command_timeout_ms(),
        }
    }
}

impl GeometryConfig {
    /// Grace delay before touching a display that may still be initializing.
    #[must_use]
    pub fn grace(&self) -> Duration {
        Duration::from_millis(self.grace_ms)
    }

    /// Timeout applied to each external mode operation.
    #[must_use]
    pub fn command_timeout(&self) -> Duration {
        Duration::from_millis(self.command_timeout_ms)
    }
}

fn default_width() -> u32 {
    1920
}

fn default_height() -> u32 {
    1080
}

fn default_max_width() -> u32 {
    3840
}

fn default_max_height() -> u32 {
    2160
}

fn default_depth() -> u32 {
    24
}

fn default_refresh_hz() -> f64 {
    60.0
}

fn default_output_name() -> String {
    "screen".into()
}

fn default_xrandr_program() -> String {
    "xrandr".into()
}

fn default_grace_ms() -> u64 {
    250
}

fn default_command_timeout_ms() -> u64 {
    5000
}

/// How the orchestrator decides the virtual display is usable.
#[derive(Debug, Clone, Copy, Default, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ReadinessMode {
    /// Poll the display's X socket until it accepts a connection.
    #[default]
    Socket,
    /// Wait a fixed settle delay.
    Settle,
}

/// Startup wait points and teardown grace.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct TimingConfig {
    /// Readiness strategy for the virtual display.
    #[serde(default)]
    pub display_readiness: ReadinessMode,
    /// Fixed delay after launching the display in `settle` mode.
    #[serde(default = "default_settle_ms")]
    pub display_settle_ms: u64,
    /// Upper bound on socket readiness polling.
    #[serde(default = "default_ready_timeout_ms")]
    pub display_ready_timeout_ms: u64,
    /// Directory holding the X server sockets.
    #[serde(default = "default_x11_socket_dir")]
    pub x11_socket_dir: PathBuf,
    /// Fixed delay after launching the window manager.
    #[serde(default = "default_settle_ms")]
    pub window_manager_settle_ms: u64,
    /// Time a child gets between SIGTERM and SIGKILL.
    #[serde(default = "default_terminate_grace_ms")]
    pub terminate_grace_ms: u64,
}

impl Default for TimingConfig {
    fn default() -> Self {
        Self {
            display_readiness: ReadinessMode::default(),
            display_settle_ms: default_settle_ms(),
            display_ready_timeout_ms: default_ready_timeout_ms(),
            x11_socket_dir: default_x11_socket_dir(),
            window_manager_settle_ms: default_settle_ms(),
            terminate_grace_ms: default_terminate_grace_ms(),
        }
    }
}

impl TimingConfig {
    /// Settle delay after the display launch.
    #[must_use]
    pub fn display_settle(&self) -> Duration {
        Duration::from_millis(self.display_settle_ms)
    }

    /// Bound on display readiness polling.
    #[must_use]
    pub fn display_ready_timeout(&self) -> Duration {
        Duration::from_millis(self.display_ready_timeout_ms)
    }

    /// Settle delay after the window-manager launch.
    #[must_use]
    pub fn window_manager_settle(&self) -> Duration {
        Duration::from_millis(self.window_manager_settle_ms)
    }

    /// Grace between SIGTERM and SIGKILL.
    #[must_use]
    pub fn terminate_grace(&self) -> Duration {
        Duration::from_millis(self.terminate_grace_ms)
    }
}

fn default_settle_ms() -> u64 {
    500
}

fn default_ready_timeout_ms() -> u64 {
    10_000
}

fn default_x11_socket_dir() -> PathBuf {
    PathBuf::from("/tmp/.X11-unix")
}

fn default_terminate_grace_ms() -> u64 {
    3000
}

/// Command line and environment for one external collaborator.
///
/// Arguments may contain `{placeholder}` tokens that are expanded per
/// session; see [`crate::orchestrator::launch::LaunchContext`].
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct ProgramConfig {
    /// Executable name or path.
    pub command: String,
    /// Argument templates.
    #[serde(default)]
    pub args: Vec<String>,
    /// Extra environment variables (values may contain placeholders).
    #[serde(default)]
    pub env: BTreeMap<String, String>,
}

impl ProgramConfig {
    fn new(command: &str, args: &[&str]) -> Self {
        Self {
            command: command.to_owned(),
            args: args.iter().map(|a| (*a).to_owned()).collect(),
            env: BTreeMap::new(),
        }
    }
}

/// The five collaborators that make up one session.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct ProgramsConfig {
    /// Virtual display server.
    #[serde(default = "default_display_program")]
    pub display: ProgramConfig,
    /// Window manager.
    #[serde(default = "default_window_manager_program")]
    pub window_manager: ProgramConfig,
    /// Remote-framebuffer exporter.
    #[serde(default = "default_frame_export_program")]
    pub frame_export: ProgramConfig,
    /// Websocket-to-TCP bridge.
    #[serde(default = "default_bridge_program")]
    pub bridge: ProgramConfig,
    /// The session's application; its exit ends the session.
    #[serde(default = "default_application_program")]
    pub application: ProgramConfig,
}

impl Default for ProgramsConfig {
    fn default() -> Self {
        Self {
            display: default_display_program(),
            window_manager: default_window_manager_program(),
            frame_export: default_frame_export_program(),
            bridge: default_bridge_program(),
            application: default_application_program(),
        }
    }
}

impl ProgramsConfig {
    /// Program configuration for a role.
    #[must_use]
    pub fn for_role(&self, role: ProcessRole) -> &ProgramConfig {
        match role {
            ProcessRole::Display => &self.display,
            ProcessRole::WindowManager => &self.window_manager,
            ProcessRole::FrameExport => &self.frame_export,
            ProcessRole::Bridge => &self.bridge,
            ProcessRole::Application => &self.application,
        }
    }
}

fn default_display_program() -> ProgramConfig {
    ProgramConfig::new(
        "Xvfb",
        &[
            "{display}",
            "-screen",
            "0",
            "{max_width}x{max_height}x{depth}",
            "-nolisten",
            "tcp",
        ],
    )
}

fn default_window_manager_program() -> ProgramConfig {
    ProgramConfig::new("fluxbox", &["-display", "{display}", "-rc", "{wm_config}"])
}

fn default_frame_export_program() -> ProgramConfig {
    ProgramConfig::new(
        "x11vnc",
        &[
            "-display",
            "{display}",
            "-rfbport",
            "{export_port}",
            "-forever",
            "-shared",
            "-nopw",
        ],
    )
}

fn default_bridge_program() -> ProgramConfig {
    ProgramConfig::new(
        "websockify",
        &["{bridge_host}:{bridge_port}", "localhost:{export_port}"],
    )
}

fn default_application_program() -> ProgramConfig {
    let mut program = ProgramConfig::new(
        "antigravity",
        &[
            "--wait",
            "--user-data-dir",
            "{work_dir}",
            "--start-maximized",
            "--no-sandbox",
            "--disable-gpu",
            "--disable-software-rasterizer",
            "--window-size={width},{height}",
        ],
    );
    program
        .env
        .insert("LIBGL_ALWAYS_SOFTWARE".into(), "1".into());
    program.env.insert("ELECTRON_DISABLE_GPU".into(), "1".into());
    program
}

fn default_work_root() -> PathBuf {
    env::temp_dir()
}

fn default_work_dir_prefix() -> String {
    "vdesk".into()
}

fn default_ipc_name() -> String {
    "vdesk-orchestrator".into()
}

fn default_bridge_host() -> String {
    "0.0.0.0".into()
}

/// Global configuration parsed from `config.toml`.
///
/// Every field has a default, so an empty document is a valid config.
#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(rename_all = "snake_case")]
pub struct GlobalConfig {
    /// Root under which per-session working directories are created.
    #[serde(default = "default_work_root")]
    pub work_root: PathBuf,
    /// Prefix of each working directory name (`{prefix}-{session_id}`).
    #[serde(default = "default_work_dir_prefix")]
    pub work_dir_prefix: String,
    /// Profile directory copied into every working directory as `User/`.
    #[serde(default)]
    pub template_profile: Option<PathBuf>,
    /// Extensions directory handed to the application when it exists.
    #[serde(default)]
    pub extensions_dir: Option<PathBuf>,
    /// Host the bridge listens on.
    #[serde(default = "default_bridge_host")]
    pub bridge_host: String,
    /// Named pipe / Unix socket identifier for the control surface.
    #[serde(default = "default_ipc_name")]
    pub ipc_name: String,
    /// Display and port ranges.
    #[serde(default)]
    pub allocation: AllocationConfig,
    /// Screen geometry settings.
    #[serde(default)]
    pub geometry: GeometryConfig,
    /// Startup wait points and teardown grace.
    #[serde(default)]
    pub timing: TimingConfig,
    /// External collaborator command lines.
    #[serde(default)]
    pub programs: ProgramsConfig,
}

impl Default for GlobalConfig {
    fn default() -> Self {
        Self {
            work_root: default_work_root(),
            work_dir_prefix: default_work_dir_prefix(),
            template_profile: None,
            extensions_dir: None,
            bridge_host: default_bridge_host(),
            ipc_name: default_ipc_name(),
            allocation: AllocationConfig::default(),
            geometry: GeometryConfig::default(),
            timing: TimingConfig::default(),
            programs: ProgramsConfig::default(),
        }
    }
}

impl GlobalConfig {
    /// Load configuration from a TOML file, apply `VDESK_*` environment
    /// overrides, then validate.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Config` if the file cannot be read, contains
    /// invalid TOML, carries an unparsable override, or fails validation.
    pub fn load_from_path(path: impl AsRef<Path>) -> Result<Self> {
        let raw = fs::read_to_string(path)
            .map_err(|err| AppError::Config(format!("failed to read config: {err}")))?;
        let mut config: Self = toml::from_str(&raw)?;
        config.apply_overrides(|key| env::var(key).ok())?;
        config.validate()?;
        Ok(config)
    }

    /// Parse configuration from a TOML string and validate it.
    ///
    /// Environment overrides are not applied.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Config` if parsing or validation fails.
    pub fn from_toml_str(raw: &str) -> Result<Self> {
        let config: Self = toml::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    /// Apply overrides from a key lookup (normally the process environment).
    ///
    /// Recognized keys: `VDESK_DISPLAY_BASE`, `VDESK_EXPORT_PORT_BASE`,
    /// `VDESK_BRIDGE_PORT_BASE`, `VDESK_WINDOW_MANAGER`, `VDESK_APPLICATION`,
    /// `VDESK_BRIDGE_HOST`.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Config` if a numeric override does not parse.
    pub fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<()> {
        if let Some(value) = lookup("VDESK_DISPLAY_BASE") {
            self.allocation.base_display = parse_override("VDESK_DISPLAY_BASE", &value)?;
        }
        if let Some(value) = lookup("VDESK_EXPORT_PORT_BASE") {
            self.allocation.base_export_port = parse_override("VDESK_EXPORT_PORT_BASE", &value)?;
        }
        if let Some(value) = lookup("VDESK_BRIDGE_PORT_BASE") {
            self.allocation.base_bridge_port = parse_override("VDESK_BRIDGE_PORT_BASE", &value)?;
        }
        if let Some(value) = lookup("VDESK_WINDOW_MANAGER") {
            self.programs.window_manager.command = value;
        }
        if let Some(value) = lookup("VDESK_APPLICATION") {
            self.programs.application.command = value;
        }
        if let Some(value) = lookup("VDESK_BRIDGE_HOST") {
            self.bridge_host = value;
        }
        Ok(())
    }

    /// Working directory path for a session identifier.
    #[must_use]
    pub fn work_dir_for(&self, session_id: &str) -> PathBuf {
        self.work_root
            .join(format!("{}-{session_id}", self.work_dir_prefix))
    }

    /// Check cross-field invariants.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Config` describing the first violated invariant.
    pub fn validate(&self) -> Result<()> {
        let alloc = &self.allocation;
        if alloc.capacity == 0 {
            return Err(AppError::Config(
                "allocation.capacity must be greater than zero".into(),
            ));
        }

        let export_end = u32::from(alloc.base_export_port) + u32::from(alloc.capacity);
        let bridge_end = u32::from(alloc.base_bridge_port) + u32::from(alloc.capacity);
        if export_end > u32::from(u16::MAX) + 1 || bridge_end > u32::from(u16::MAX) + 1 {
            return Err(AppError::Config(
                "port ranges must fit below 65536".into(),
            ));
        }
        let export_start = u32::from(alloc.base_export_port);
        let bridge_start = u32::from(alloc.base_bridge_port);
        if export_start < bridge_end && bridge_start < export_end {
            return Err(AppError::Config(format!(
                "export ports [{export_start}, {export_end}) overlap bridge ports [{bridge_start}, {bridge_end})"
            )));
        }
        if alloc
            .base_display
            .checked_add(u32::from(alloc.capacity))
            .is_none()
        {
            return Err(AppError::Config("display range overflows".into()));
        }

        let geo = &self.geometry;
        if geo.default_width == 0 || geo.default_height == 0 {
            return Err(AppError::Config(
                "default geometry must be positive".into(),
            ));
        }
        if geo.default_width > geo.max_width || geo.default_height > geo.max_height {
            return Err(AppError::Config(
                "default geometry exceeds the maximum display size".into(),
            ));
        }
        if !(geo.refresh_hz.is_finite() && geo.refresh_hz > 0.0) {
            return Err(AppError::Config("refresh_hz must be positive".into()));
        }

        for role in ProcessRole::ALL {
            if self.programs.for_role(role).command.trim().is_empty() {
                return Err(AppError::Config(format!(
                    "programs.{} command must not be empty",
                    role.config_key()
                )));
            }
        }

        if self.work_dir_prefix.is_empty() || self.work_dir_prefix.contains('/') {
            return Err(AppError::Config(
                "work_dir_prefix must be a non-empty single path component".into(),
            ));
        }

        Ok(())
    }
}

fn parse_override<T: std::str::FromStr>(key: &str, value: &str) -> Result<T>
where
    T::Err: std::fmt::Display,
{
    value
        .trim()
        .parse()
        .map_err(|err| AppError::Config(format!("{key}={value:?} is invalid: {err}")))
}
