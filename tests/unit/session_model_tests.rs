//! Unit tests for session model types and lifecycle transitions.

use chrono::Utc;
use vdesk_orchestrator::models::session::{
    ExitOutcome, ProcessRole, ScreenSize, SessionState, SessionSummary, TerminationReason,
};
use vdesk_orchestrator::AppError;

#[test]
fn lifecycle_happy_path_is_allowed() {
    use SessionState::{Provisioning, Resizing, Running, Terminated, Terminating};
    assert!(Provisioning.can_transition_to(Running));
    assert!(Running.can_transition_to(Resizing));
    assert!(Resizing.can_transition_to(Running));
    assert!(Running.can_transition_to(Terminating));
    assert!(Terminating.can_transition_to(Terminated));
}

#[test]
fn any_live_state_can_start_teardown() {
    for state in [
        SessionState::Provisioning,
        SessionState::Running,
        SessionState::Resizing,
    ] {
        assert!(state.can_transition_to(SessionState::Terminating), "{state:?}");
        assert!(!state.is_ending());
    }
}

#[test]
fn teardown_cannot_be_reentered() {
    assert!(!SessionState::Terminating.can_transition_to(SessionState::Terminating));
    assert!(!SessionState::Terminated.can_transition_to(SessionState::Terminating));
    assert!(!SessionState::Terminated.can_transition_to(SessionState::Running));
    assert!(SessionState::Terminating.is_ending());
    assert!(SessionState::Terminated.is_ending());
}

#[test]
fn provisioning_cannot_resize() {
    assert!(!SessionState::Provisioning.can_transition_to(SessionState::Resizing));
}

#[test]
fn oversized_request_is_a_geometry_error() {
    let err = ScreenSize::from_request(i64::MAX, 720).expect_err("too wide");
    assert!(matches!(err, AppError::Geometry(_)), "{err}");
    let err = ScreenSize::from_request(1280, i64::from(u32::MAX) + 1).expect_err("too tall");
    assert!(matches!(err, AppError::Geometry(_)), "{err}");
}

#[test]
fn fits_within_checks_both_dimensions() {
    let max = ScreenSize {
        width: 3840,
        height: 2160,
    };
    assert!(ScreenSize { width: 3840, height: 2160 }.fits_within(max));
    assert!(!ScreenSize { width: 3841, height: 1080 }.fits_within(max));
    assert!(!ScreenSize { width: 1920, height: 2161 }.fits_within(max));
}

#[test]
fn screen_size_requires_positive_dimensions() {
    assert_eq!(
        ScreenSize::from_request(1280, 720).expect("representable"),
        Some(ScreenSize {
            width: 1280,
            height: 720
        })
    );
    assert_eq!(ScreenSize::from_request(0, 720).expect("no-op"), None);
    assert_eq!(ScreenSize::from_request(1280, -1).expect("no-op"), None);
    assert_eq!(ScreenSize::from_request(-1, i64::MAX).expect("no-op"), None);
    assert_eq!(
        ScreenSize {
            width: 800,
            height: 600
        }
        .to_string(),
        "800x600"
    );
}

#[test]
fn roles_serialize_as_config_keys() {
    for role in ProcessRole::ALL {
        let json = serde_json::to_value(role).expect("serialize");
        assert_eq!(json, serde_json::Value::String(role.config_key().into()));
        assert_eq!(role.to_string(), role.config_key());
    }
}

#[test]
fn exit_outcome_display_and_code() {
    let exited = ExitOutcome::Exited { code: 1 };
    assert_eq!(exited.code(), Some(1));
    assert_eq!(exited.to_string(), "exited with code 1");

    let signaled = ExitOutcome::Signaled { signal: 15 };
    assert_eq!(signaled.code(), None);
    assert_eq!(signaled.to_string(), "terminated by signal 15");
}

#[test]
fn termination_reason_serializes_with_kind_tag() {
    let reason = TerminationReason::UnexpectedExit {
        role: ProcessRole::Display,
        outcome: ExitOutcome::Signaled { signal: 9 },
    };
    let json = serde_json::to_value(&reason).expect("serialize");
    assert_eq!(json["kind"], "unexpected_exit");
    assert_eq!(json["role"], "display");
    assert_eq!(json["outcome"]["kind"], "signaled");
    assert_eq!(reason.to_string(), "display terminated by signal 9");
}

#[test]
fn summary_exposes_only_public_fields() {
    let summary = SessionSummary {
        id: "abc".into(),
        display: 100,
        bridge_port: 6080,
        created_at: Utc::now(),
    };
    assert_eq!(summary.display_name(), ":100");

    let json = serde_json::to_value(&summary).expect("serialize");
    let mut keys: Vec<_> = json.as_object().expect("object").keys().cloned().collect();
    keys.sort();
    assert_eq!(keys, ["bridge_port", "created_at", "display", "id"]);
}
