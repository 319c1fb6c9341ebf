//! Per-session expansion of collaborator command lines.

use std::path::{Path, PathBuf};

use crate::config::{GlobalConfig, ProgramConfig};
use crate::models::session::{ProcessRole, ScreenSize};
use crate::orchestrator::allocator::ResourceLease;
use crate::orchestrator::supervisor::LaunchSpec;

/// Values substituted into `{placeholder}` tokens of program arguments
/// and environment values.
#[derive(Debug, Clone)]
pub struct LaunchContext {
    display_name: String,
    work_dir: PathBuf,
    extensions_dir: Option<PathBuf>,
    values: Vec<(&'static str, String)>,
}

impl LaunchContext {
    /// Build the substitution table for one session.
    #[must_use]
    pub fn new(
        session_id: &str,
        lease: &ResourceLease,
        work_dir: &Path,
        wm_config: &Path,
        geometry: ScreenSize,
        config: &GlobalConfig,
    ) -> Self {
        let display_name = lease.display_name();
        let values = vec![
            ("session_id", session_id.to_owned()),
            ("display", display_name.clone()),
            ("display_number", lease.display().to_string()),
            ("export_port", lease.export_port().to_string()),
            ("bridge_port", lease.bridge_port().to_string()),
            ("bridge_host", config.bridge_host.clone()),
            ("work_dir", work_dir.display().to_string()),
            ("wm_config", wm_config.display().to_string()),
            ("width", geometry.width.to_string()),
            ("height", geometry.height.to_string()),
            ("max_width", config.geometry.max_width.to_string()),
            ("max_height", config.geometry.max_height.to_string()),
            ("depth", config.geometry.depth.to_string()),
        ];
        Self {
            display_name,
            work_dir: work_dir.to_path_buf(),
            extensions_dir: config.extensions_dir.clone(),
            values,
        }
    }

    /// Replace every known `{key}` in `template`. Unknown keys are kept verbatim.
    #[must_use]
    pub fn expand(&self, template: &str) -> String {
        let mut out = String::with_capacity(template.len());
        let mut rest = template;
        while let Some(open) = rest.find('{') {
            out.push_str(&rest[..open]);
            let after = &rest[open + 1..];
            let Some(close) = after.find('}') else {
                out.push_str(&rest[open..]);
                return out;
            };
            let key = &after[..close];
            match self.lookup(key) {
                Some(value) => out.push_str(value),
                None => {
                    out.push('{');
                    out.push_str(key);
                    out.push('}');
                }
            }
            rest = &after[close + 1..];
        }
        out.push_str(rest);
        out
    }

    /// Build the launch spec for `role` from its program configuration.
    ///
    /// Every role except the display gets `DISPLAY` pointed at the session's
    /// display. The application additionally runs inside the working
    /// directory and receives `--extensions-dir` when one is configured and
    /// present on disk.
    #[must_use]
    pub fn spec(&self, role: ProcessRole, program: &ProgramConfig) -> LaunchSpec {
        let mut args: Vec<String> = program.args.iter().map(|a| self.expand(a)).collect();
        let mut env = Vec::with_capacity(program.env.len() + 1);
        if role != ProcessRole::Display {
            env.push(("DISPLAY".to_owned(), self.display_name.clone()));
        }
        env.extend(
            program
                .env
                .iter()
                .map(|(key, value)| (key.clone(), self.expand(value))),
        );

        let mut current_dir = None;
        if role == ProcessRole::Application {
            if let Some(dir) = self.extensions_dir.as_ref().filter(|d| d.is_dir()) {
                args.push("--extensions-dir".into());
                args.push(dir.display().to_string());
            }
            current_dir = Some(self.work_dir.clone());
        }

        LaunchSpec {
            role,
            program: self.expand(&program.command),
            args,
            env,
            current_dir,
        }
    }

    fn lookup(&self, key: &str) -> Option<&str> {
        self.values
            .iter()
            .find(|(name, _)| *name == key)
            .map(|(_, value)| value.as_str())
    }
}
