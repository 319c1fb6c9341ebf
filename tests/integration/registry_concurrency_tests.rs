//! Concurrent creation and racing teardown triggers.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use futures_util::future::join_all;
use tokio::sync::broadcast::error::TryRecvError;
use vdesk_orchestrator::geometry::{
    ControlFuture, CvtGenerator, DisplayController, GeometryReconfigurer, Modeline,
};
use vdesk_orchestrator::models::session::ProcessRole;
use vdesk_orchestrator::orchestrator::{RegistryEvent, ResourceAllocator};
use vdesk_orchestrator::SessionRegistry;

use super::test_helpers::{registry, set_script, test_config, wait_until};

fn removals_of(events: &mut tokio::sync::broadcast::Receiver<RegistryEvent>, id: &str) -> usize {
    let mut count = 0;
    loop {
        match events.try_recv() {
            Ok(RegistryEvent::Removed { session_id, .. }) if session_id == id => count += 1,
            Ok(_) | Err(TryRecvError::Lagged(_)) => {}
            Err(TryRecvError::Empty | TryRecvError::Closed) => return count,
        }
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_creates_get_distinct_resources() {
    let root = tempfile::tempdir().expect("tempdir");
    let registry = registry(test_config(root.path()));

    let results = join_all((0..8).map(|_| registry.create(None, None))).await;
    let summaries: Vec<_> = results
        .into_iter()
        .map(|r| r.expect("created"))
        .collect();

    let displays: HashSet<u32> = summaries.iter().map(|s| s.display).collect();
    let bridges: HashSet<u16> = summaries.iter().map(|s| s.bridge_port).collect();
    let exports: HashSet<u16> = summaries
        .iter()
        .map(|s| registry.inspect(&s.id).expect("details").export_port)
        .collect();
    assert_eq!(displays.len(), 8);
    assert_eq!(bridges.len(), 8);
    assert_eq!(exports.len(), 8);
    assert_eq!(registry.list().len(), 8);

    assert_eq!(registry.shutdown().await, 8);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_stops_remove_once() {
    let root = tempfile::tempdir().expect("tempdir");
    let registry = registry(test_config(root.path()));
    let mut events = registry.subscribe();

    let summary = registry.create(None, None).await.expect("created");
    let (a, b) = tokio::join!(registry.stop(&summary.id), registry.stop(&summary.id));
    assert!(a || b, "at least one stop must find the session");

    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(removals_of(&mut events, &summary.id), 1);
    assert!(registry.list().is_empty());
    assert_eq!(registry.allocator().leased(), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn stop_racing_application_exit_removes_once() {
    let root = tempfile::tempdir().expect("tempdir");
    let mut config = test_config(root.path());
    set_script(&mut config, ProcessRole::Application, "sleep 0.2; exit 0");
    let registry = registry(config);
    let mut events = registry.subscribe();

    let summary = registry.create(None, None).await.expect("created");
    tokio::time::sleep(Duration::from_millis(190)).await;
    registry.stop(&summary.id).await;

    assert!(
        wait_until(Duration::from_secs(5), || registry.is_empty()).await,
        "entry never removed"
    );
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(removals_of(&mut events, &summary.id), 1);
    assert_eq!(registry.allocator().leased(), 0);
}

/// Stalls every activation of a 1280x720 mode.
struct StallingController;

impl DisplayController for StallingController {
    fn register_mode<'a>(&'a self, _display: &'a str, _mode: &'a Modeline) -> ControlFuture<'a> {
        Box::pin(async { Ok(()) })
    }

    fn attach_mode<'a>(
        &'a self,
        _display: &'a str,
        _output: &'a str,
        _name: &'a str,
    ) -> ControlFuture<'a> {
        Box::pin(async { Ok(()) })
    }

    fn activate_mode<'a>(
        &'a self,
        _display: &'a str,
        _output: &'a str,
        name: &'a str,
    ) -> ControlFuture<'a> {
        Box::pin(async move {
            if name.starts_with("1280x720") {
                tokio::time::sleep(Duration::from_secs(30)).await;
            }
            Ok(())
        })
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn hung_resize_does_not_stall_other_sessions() {
    let root = tempfile::tempdir().expect("tempdir");
    let config = test_config(root.path());
    let allocator = Arc::new(ResourceAllocator::new(config.allocation.clone()));
    let geometry = GeometryReconfigurer::new(
        Arc::new(CvtGenerator),
        Arc::new(StallingController),
        &config.geometry,
    );
    let registry = SessionRegistry::with_collaborators(config, allocator, geometry);

    let stuck = registry.create(None, None).await.expect("created");
    let other = registry.create(None, None).await.expect("created");

    let resize = {
        let registry = Arc::clone(&registry);
        let id = stuck.id.clone();
        tokio::spawn(async move { registry.resize(&id, 1280, 720).await })
    };
    tokio::time::sleep(Duration::from_millis(50)).await;

    let started = tokio::time::Instant::now();
    assert!(registry.stop(&other.id).await);
    assert!(registry.create(None, None).await.is_ok());
    assert!(started.elapsed() < Duration::from_secs(5));
    assert!(!resize.is_finished());

    // Teardown of the stuck session itself is not held up by its resize.
    assert!(registry.stop(&stuck.id).await);
    resize.abort();
    registry.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn many_sessions_exiting_at_once_are_all_removed() {
    let root = tempfile::tempdir().expect("tempdir");
    let mut config = test_config(root.path());
    set_script(&mut config, ProcessRole::Application, "sleep 0.4; exit 0");
    let registry = registry(config);

    let results = join_all((0..6).map(|_| registry.create(None, None))).await;
    assert!(results.iter().all(Result::is_ok));

    assert!(
        wait_until(Duration::from_secs(8), || registry.is_empty()).await,
        "sessions remained: {}",
        registry.len()
    );
    assert!(
        wait_until(Duration::from_secs(2), || registry.allocator().leased() == 0).await
    );
}
