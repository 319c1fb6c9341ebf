//! Unit tests for geometry reconfiguration against a recording controller.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use vdesk_orchestrator::config::GeometryConfig;
use vdesk_orchestrator::geometry::{
    ControlFuture, CvtGenerator, DisplayController, GeometryReconfigurer, ModeGenerator,
    Modeline, XrandrController,
};
use vdesk_orchestrator::models::session::ScreenSize;
use vdesk_orchestrator::{AppError, Result};

/// Records every call; optionally fails one step.
#[derive(Default)]
struct Recorder {
    calls: Mutex<Vec<String>>,
    fail_on: Option<&'static str>,
}

impl Recorder {
    fn failing(step: &'static str) -> Self {
        Self {
            calls: Mutex::new(Vec::new()),
            fail_on: Some(step),
        }
    }

    fn record(&self, step: &'static str, call: String) -> Result<()> {
        self.calls.lock().unwrap().push(call);
        if self.fail_on == Some(step) {
            Err(AppError::Geometry(format!("{step} rejected")))
        } else {
            Ok(())
        }
    }

    fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }
}

impl DisplayController for Recorder {
    fn register_mode<'a>(&'a self, display: &'a str, mode: &'a Modeline) -> ControlFuture<'a> {
        Box::pin(async move { self.record("register", format!("register {display} {}", mode.name)) })
    }

    fn attach_mode<'a>(
        &'a self,
        display: &'a str,
        output: &'a str,
        name: &'a str,
    ) -> ControlFuture<'a> {
        Box::pin(async move { self.record("attach", format!("attach {display} {output} {name}")) })
    }

    fn activate_mode<'a>(
        &'a self,
        display: &'a str,
        output: &'a str,
        name: &'a str,
    ) -> ControlFuture<'a> {
        Box::pin(async move { self.record("activate", format!("activate {display} {output} {name}")) })
    }
}

struct BrokenGenerator;

impl ModeGenerator for BrokenGenerator {
    fn generate(&self, _size: ScreenSize, _refresh_hz: f64) -> Result<Modeline> {
        Err(AppError::Geometry("no timing".into()))
    }
}

fn geometry_config() -> GeometryConfig {
    GeometryConfig {
        grace_ms: 0,
        ..GeometryConfig::default()
    }
}

fn reconfigurer(recorder: &Arc<Recorder>) -> GeometryReconfigurer {
    GeometryReconfigurer::new(
        Arc::new(CvtGenerator),
        Arc::clone(recorder) as Arc<dyn DisplayController>,
        &geometry_config(),
    )
}

#[tokio::test]
async fn apply_runs_three_steps_in_order() {
    let recorder = Arc::new(Recorder::default());
    reconfigurer(&recorder)
        .apply(":100", 1280, 720)
        .await
        .expect("applied");

    assert_eq!(
        recorder.calls(),
        [
            "register :100 1280x720_60.00",
            "attach :100 screen 1280x720_60.00",
            "activate :100 screen 1280x720_60.00",
        ]
    );
}

#[tokio::test]
async fn non_positive_size_is_noop_success() {
    let recorder = Arc::new(Recorder::default());
    let geometry = reconfigurer(&recorder);
    for (w, h) in [(0, 720), (1280, 0), (-5, 720), (1280, -1)] {
        geometry.apply(":100", w, h).await.expect("no-op");
    }
    assert!(recorder.calls().is_empty());
}

#[tokio::test]
async fn failing_step_aborts_remaining_steps() {
    let recorder = Arc::new(Recorder::failing("attach"));
    let err = reconfigurer(&recorder)
        .apply(":100", 1024, 768)
        .await
        .expect_err("attach fails");

    assert!(matches!(err, AppError::Geometry(_)));
    assert_eq!(recorder.calls().len(), 2, "activate must not run");
}

#[tokio::test]
async fn oversized_request_rejected_before_any_call() {
    let recorder = Arc::new(Recorder::default());
    let err = reconfigurer(&recorder)
        .apply(":100", 5000, 1080)
        .await
        .expect_err("exceeds framebuffer");
    assert!(matches!(err, AppError::Geometry(_)));
    assert!(recorder.calls().is_empty());
}

#[tokio::test]
async fn unrepresentable_request_is_an_error_not_a_noop() {
    let recorder = Arc::new(Recorder::default());
    let err = reconfigurer(&recorder)
        .apply(":100", i64::from(u32::MAX) + 1, 1080)
        .await
        .expect_err("does not fit u32");
    assert!(matches!(err, AppError::Geometry(_)), "{err}");
    assert!(recorder.calls().is_empty());
}

#[tokio::test]
async fn generator_failure_is_reported() {
    let recorder = Arc::new(Recorder::default());
    let geometry = GeometryReconfigurer::new(
        Arc::new(BrokenGenerator),
        Arc::clone(&recorder) as Arc<dyn DisplayController>,
        &geometry_config(),
    );
    assert!(geometry.apply(":100", 800, 600).await.is_err());
    assert!(recorder.calls().is_empty());
}

#[tokio::test]
async fn initial_apply_waits_grace() {
    let recorder = Arc::new(Recorder::default());
    let config = GeometryConfig {
        grace_ms: 100,
        ..GeometryConfig::default()
    };
    let geometry = GeometryReconfigurer::new(
        Arc::new(CvtGenerator),
        Arc::clone(&recorder) as Arc<dyn DisplayController>,
        &config,
    );

    let started = tokio::time::Instant::now();
    geometry
        .apply_initial(":100", ScreenSize { width: 1920, height: 1080 })
        .await
        .expect("applied");
    assert!(started.elapsed() >= Duration::from_millis(100));
    assert_eq!(recorder.calls().len(), 3);
}

#[tokio::test]
async fn xrandr_controller_succeeds_with_true() {
    let controller = XrandrController::new("true".into(), Duration::from_secs(5));
    let mode = CvtGenerator
        .generate(ScreenSize { width: 800, height: 600 }, 60.0)
        .expect("mode");
    controller.register_mode(":100", &mode).await.expect("register");
    controller
        .activate_mode(":100", "screen", &mode.name)
        .await
        .expect("activate");
}

#[tokio::test]
async fn xrandr_controller_reports_failure() {
    let controller = XrandrController::new("false".into(), Duration::from_secs(5));
    let err = controller
        .attach_mode(":100", "screen", "800x600_60.00")
        .await
        .expect_err("false exits 1");
    assert!(err.to_string().starts_with("geometry failure: attach mode"), "{err}");
}

#[tokio::test]
async fn xrandr_duplicate_mode_is_not_an_error() {
    let dir = tempfile::tempdir().expect("tempdir");
    let script = dir.path().join("fake-xrandr");
    std::fs::write(
        &script,
        "#!/bin/sh\necho 'X Error of failed request:  BadName (named color or font does not exist)' >&2\nexit 1\n",
    )
    .expect("script");
    make_executable(&script);

    let controller = XrandrController::new(script.display().to_string(), Duration::from_secs(5));
    let mode = CvtGenerator
        .generate(ScreenSize { width: 800, height: 600 }, 60.0)
        .expect("mode");
    controller
        .register_mode(":100", &mode)
        .await
        .expect("duplicate tolerated");
    assert!(controller.attach_mode(":100", "screen", &mode.name).await.is_err());
}

fn make_executable(path: &std::path::Path) {
    use std::os::unix::fs::PermissionsExt;
    let mut perms = std::fs::metadata(path).expect("metadata").permissions();
    perms.set_mode(0o755);
    std::fs::set_permissions(path, perms).expect("chmod");
}
