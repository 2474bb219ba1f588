mod common;

use common::file_checker;
use connguard::telemetry::{MemorySink, MulticastSink, LogSink, ThrottleEvent};
use connguard::{AuthRequest, AuthStatus, GuardError, ManualClock, ThrottleConfig, ThrottleLayer};
use std::convert::Infallible;
use std::sync::Arc;
use tower::{ServiceBuilder, ServiceExt};

async fn verify(req: AuthRequest) -> Result<AuthStatus, Infallible> {
    Ok(if req.credential == b"open sesame" { AuthStatus::Success } else { AuthStatus::Failure })
}

#[tokio::test]
async fn layer_over_file_store_locks_out_and_recovers() {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
    let dir = tempfile::tempdir().unwrap();
    let clock = ManualClock::starting_at(50_000);
    let events = MemorySink::new();
    let checker = Arc::new(
        file_checker(dir.path(), ThrottleConfig::new(2, 1), &clock)
            .await
            .with_sink(MulticastSink::new(LogSink, events.clone())),
    );
    let svc = ServiceBuilder::new()
        .layer(ThrottleLayer::from_shared(checker.clone()))
        .service_fn(verify);

    for _ in 0..2 {
        let status = svc.clone().oneshot(AuthRequest::new("ali", false, "guess")).await.unwrap();
        assert_eq!(status, AuthStatus::Failure);
    }
    let err = svc.clone().oneshot(AuthRequest::new("ali", false, "open sesame")).await.unwrap_err();
    assert!(matches!(err, GuardError::Denied { retry_after_minutes: 1, .. }));

    // An operator clears the lockout early.
    assert!(checker.forgive("ali").await.unwrap());
    let status = svc.oneshot(AuthRequest::new("ali", false, "open sesame")).await.unwrap();
    assert_eq!(status, AuthStatus::Success);

    let kinds: Vec<_> = events
        .events()
        .into_iter()
        .map(|e| match e {
            ThrottleEvent::FailureRecorded { .. } => "recorded",
            ThrottleEvent::Denied { .. } => "denied",
            ThrottleEvent::Cleared { .. } => "cleared",
            _ => "other",
        })
        .collect();
    assert_eq!(kinds, vec!["recorded", "recorded", "denied", "cleared"]);
}
