//! Geometry reconfiguration of a running virtual display.
//!
//! A resize is three sequential external operations against the display's
//! single logical output: register a mode, attach it to the output, then
//! activate it. The mode itself comes from a [`ModeGenerator`]; the
//! operations go through a [`DisplayController`]. Any failing step aborts
//! the resize and leaves the previous mode active.

pub mod cvt;
pub mod xrandr;

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use tracing::{info, info_span, warn, Instrument};

use crate::config::GeometryConfig;
use crate::models::session::ScreenSize;
use crate::{AppError, Result};

pub use cvt::{CvtGenerator, Modeline};
pub use xrandr::XrandrController;

/// Boxed future returned by [`DisplayController`] operations.
pub type ControlFuture<'a> = Pin<Box<dyn Future<Output = Result<()>> + Send + 'a>>;

/// Derives a mode descriptor for a screen size.
pub trait ModeGenerator: Send + Sync {
    /// Produce a named timing for `size` at `refresh_hz`.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Geometry` if no timing can be produced.
    fn generate(&self, size: ScreenSize, refresh_hz: f64) -> Result<Modeline>;
}

/// Applies modes to a display.
pub trait DisplayController: Send + Sync {
    /// Register `mode` with the display. An already-registered mode is not
    /// an error.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Geometry` if the display rejects the mode.
    fn register_mode<'a>(&'a self, display: &'a str, mode: &'a Modeline) -> ControlFuture<'a>;

    /// Attach the registered mode `name` to `output`.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Geometry` if the display rejects the operation.
    fn attach_mode<'a>(&'a self, display: &'a str, output: &'a str, name: &'a str)
        -> ControlFuture<'a>;

    /// Make `name` the active mode of `output`.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Geometry` if the display rejects the operation.
    fn activate_mode<'a>(
        &'a self,
        display: &'a str,
        output: &'a str,
        name: &'a str,
    ) -> ControlFuture<'a>;
}

/// Computes and applies display geometry.
#[derive(Clone)]
pub struct GeometryReconfigurer {
    generator: Arc<dyn ModeGenerator>,
    controller: Arc<dyn DisplayController>,
    output_name: String,
    refresh_hz: f64,
    max: ScreenSize,
    grace: Duration,
}

impl std::fmt::Debug for GeometryReconfigurer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GeometryReconfigurer")
            .field("output_name", &self.output_name)
            .field("refresh_hz", &self.refresh_hz)
            .field("max", &self.max)
            .field("grace", &self.grace)
            .finish_non_exhaustive()
    }
}

impl GeometryReconfigurer {
    /// Build a reconfigurer with the in-process CVT generator and the
    /// configured `xrandr` program.
    #[must_use]
    pub fn from_config(config: &GeometryConfig) -> Self {
        Self::new(
            Arc::new(CvtGenerator),
            Arc::new(XrandrController::new(
                config.xrandr_program.clone(),
                config.command_timeout(),
            )),
            config,
        )
    }

    /// Build a reconfigurer from explicit collaborators.
    #[must_use]
    pub fn new(
        generator: Arc<dyn ModeGenerator>,
        controller: Arc<dyn DisplayController>,
        config: &GeometryConfig,
    ) -> Self {
        Self {
            generator,
            controller,
            output_name: config.output_name.clone(),
            refresh_hz: config.refresh_hz,
            max: ScreenSize {
                width: config.max_width,
                height: config.max_height,
            },
            grace: config.grace(),
        }
    }

    /// Largest size the display can take; also its size at startup.
    #[must_use]
    pub fn framebuffer(&self) -> ScreenSize {
        self.max
    }

    /// Apply a client-requested size to `display_name`.
    ///
    /// If `width` and `height` are not both positive this is a no-op
    /// success.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Geometry` if the size exceeds the display's
    /// framebuffer or any mode operation fails.
    pub async fn apply(&self, display_name: &str, width: i64, height: i64) -> Result<()> {
        match ScreenSize::from_request(width, height)? {
            Some(size) => self.apply_size(display_name, size).await,
            None => Ok(()),
        }
    }

    /// Apply the initial geometry to a display that may still be
    /// initializing, after the configured grace delay.
    ///
    /// # Errors
    ///
    /// Same as [`apply_size`](Self::apply_size).
    pub async fn apply_initial(&self, display_name: &str, size: ScreenSize) -> Result<()> {
        tokio::time::sleep(self.grace).await;
        self.apply_size(display_name, size).await
    }

    /// Apply a validated size to `display_name`.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Geometry` if the size exceeds the display's
    /// framebuffer or any mode operation fails.
    pub async fn apply_size(&self, display_name: &str, size: ScreenSize) -> Result<()> {
        let span = info_span!(
            "apply_geometry",
            display = %display_name,
            width = size.width,
            height = size.height
        );
        async move {
            if !size.fits_within(self.max) {
                return Err(AppError::Geometry(format!(
                    "{size} exceeds the display framebuffer {}",
                    self.max
                )));
            }

            let mode = self.generator.generate(size, self.refresh_hz)?;
            let output = self.output_name.as_str();

            let result = async {
                self.controller.register_mode(display_name, &mode).await?;
                self.controller.attach_mode(display_name, output, &mode.name).await?;
                self.controller.activate_mode(display_name, output, &mode.name).await
            }
            .await;

            match &result {
                Ok(()) => info!(mode = %mode.name, "geometry applied"),
                Err(err) => warn!(mode = %mode.name, %err, "geometry not applied"),
            }
            result
        }
        .instrument(span)
        .await
    }
}
