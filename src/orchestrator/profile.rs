//! Per-session working directory.
//!
//! Each session gets `{work_root}/{prefix}-{session_id}`, which serves as
//! the application's isolated profile location and holds the window
//! manager's configuration files.

use std::path::{Path, PathBuf};

use tracing::{debug, info, warn};
use walkdir::WalkDir;

use crate::{AppError, Result};

/// File name of the window-manager init file.
pub const WM_INIT_FILE: &str = "fluxbox-init";

/// File name of the window-manager per-application rules file.
pub const WM_APPS_FILE: &str = "fluxbox-apps";

/// Directory (inside the working directory) the template profile is copied to.
pub const PROFILE_SUBDIR: &str = "User";

/// Rules applied to every window: no decorations, maximized, desktop layer.
pub const WM_APPS_RULES: &str = "\
[app] (name=.*)
  [Deco] {NONE}
  [Maximize] {yes}
  [Layer] {DESKTOP}
[end]
";

/// Render the window-manager init file pointing at `apps_file`.
#[must_use]
pub fn render_wm_init(apps_file: &Path) -> String {
    format!(
        "session.screen0.toolbar.visible: false\n\
         session.screen0.toolbar.tools: prevworkspace, workspacename, nextworkspace, iconbar, systemtray, clock\n\
         session.screen0.workspaces: 1\n\
         session.appsFile: {}\n",
        apps_file.display()
    )
}

/// A prepared working directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkDir {
    path: PathBuf,
    wm_init: PathBuf,
    wm_apps: PathBuf,
}

impl WorkDir {
    /// Create the directory, copy the template profile into it (best-effort)
    /// and write the window-manager configuration.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Io` if the directory or the window-manager files
    /// cannot be written. A missing or unreadable template is only logged.
    pub async fn prepare(path: PathBuf, template: Option<&Path>) -> Result<Self> {
        tokio::fs::create_dir_all(&path).await.map_err(|err| {
            AppError::Io(format!("failed to create {}: {err}", path.display()))
        })?;

        if let Some(template) = template {
            let source = template.to_path_buf();
            let target = path.join(PROFILE_SUBDIR);
            let copied =
                tokio::task::spawn_blocking(move || copy_profile(&source, &target)).await;
            match copied {
                Ok(Ok(files)) => info!(files, template = %template.display(), "template profile copied"),
                Ok(Err(err)) => warn!(%err, template = %template.display(), "template profile not copied"),
                Err(err) => warn!(%err, "template copy task failed"),
            }
        }

        let wm_init = path.join(WM_INIT_FILE);
        let wm_apps = path.join(WM_APPS_FILE);
        tokio::fs::write(&wm_init, render_wm_init(&wm_apps))
            .await
            .map_err(|err| AppError::Io(format!("failed to write window manager init: {err}")))?;
        tokio::fs::write(&wm_apps, WM_APPS_RULES)
            .await
            .map_err(|err| AppError::Io(format!("failed to write window manager apps: {err}")))?;

        Ok(Self {
            path,
            wm_init,
            wm_apps,
        })
    }

    /// Root of the working directory.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Window-manager init file, passed via `{wm_config}`.
    #[must_use]
    pub fn wm_config(&self) -> &Path {
        &self.wm_init
    }

    /// Window-manager application rules file.
    #[must_use]
    pub fn wm_apps(&self) -> &Path {
        &self.wm_apps
    }
}

/// Recursively copy `source` into `target`.
///
/// Returns the number of regular files copied.
///
/// # Errors
///
/// Returns `AppError::Io` if `source` is not a directory or any entry fails
/// to copy.
pub fn copy_profile(source: &Path, target: &Path) -> Result<u64> {
    if !source.is_dir() {
        return Err(AppError::Io(format!(
            "template {} is not a directory",
            source.display()
        )));
    }

    let mut files = 0;
    for entry in WalkDir::new(source).follow_links(false) {
        let entry = entry.map_err(|err| AppError::Io(err.to_string()))?;
        let relative = entry
            .path()
            .strip_prefix(source)
            .map_err(|err| AppError::Io(err.to_string()))?;
        let destination = target.join(relative);
        let file_type = entry.file_type();

        if file_type.is_dir() {
            std::fs::create_dir_all(&destination)?;
        } else if file_type.is_file() {
            std::fs::copy(entry.path(), &destination)?;
            files += 1;
        } else {
            debug!(path = %entry.path().display(), "skipping non-regular template entry");
        }
    }
    Ok(files)
}

/// Remove a working directory tree. Best-effort; returns whether the
/// directory is gone afterwards.
pub async fn remove_work_dir(path: &Path) -> bool {
    match tokio::fs::remove_dir_all(path).await {
        Ok(()) => true,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => true,
        Err(err) => {
            warn!(%err, path = %path.display(), "failed to remove working directory");
            false
        }
    }
}
