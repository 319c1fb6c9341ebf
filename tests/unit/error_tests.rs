//! Unit tests for `AppError` display format and classification.

use vdesk_orchestrator::AppError;

#[test]
fn every_variant_has_its_prefix() {
    let cases = [
        (AppError::Config("x".into()), "config: x"),
        (
            AppError::AllocationExhausted("x".into()),
            "allocation exhausted: x",
        ),
        (AppError::Launch("x".into()), "launch failure: x"),
        (AppError::Geometry("x".into()), "geometry failure: x"),
        (AppError::UnexpectedExit("x".into()), "unexpected exit: x"),
        (AppError::NotFound("x".into()), "not found: x"),
        (AppError::Ipc("x".into()), "ipc: x"),
        (AppError::Io("x".into()), "io: x"),
    ];
    for (err, expected) in cases {
        assert_eq!(err.to_string(), expected);
    }
}

#[test]
fn only_not_found_is_not_found() {
    assert!(AppError::NotFound("session 1".into()).is_not_found());
    assert!(!AppError::Launch("Xvfb".into()).is_not_found());
    assert!(!AppError::Geometry("mode".into()).is_not_found());
}

#[test]
fn io_error_converts_to_io_variant() {
    let io = std::io::Error::new(std::io::ErrorKind::PermissionDenied, "denied");
    let err: AppError = io.into();
    assert!(matches!(err, AppError::Io(_)));
    assert_eq!(err.to_string(), "io: denied");
}

#[test]
fn toml_error_converts_to_config_variant() {
    let parse = toml::from_str::<toml::Value>("key = ").expect_err("broken toml");
    let err: AppError = parse.into();
    assert!(err.to_string().starts_with("config: invalid config"), "{err}");
}

#[test]
fn error_message_no_trailing_period() {
    let err = AppError::Launch("failed to launch display (Xvfb): not found".into());
    assert!(!err.to_string().ends_with('.'));
}
