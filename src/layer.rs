//! Host hook: tower middleware that runs the attempt checker after credential verification.
//!
//! The wrapped service is the host's verifier. Its [`AuthStatus`] drives the bookkeeping and the
//! checker's verdict decides whether the status reaches the caller.
//!
//! ```rust
//! use connguard::{AttemptChecker, AuthRequest, AuthStatus, InMemoryRecordStore, LocalLock};
//! use connguard::{ThrottleConfig, ThrottleLayer};
//! use std::convert::Infallible;
//! use tower::{ServiceBuilder, ServiceExt};
//!
//! # #[tokio::main]
//! # async fn main() {
//! let checker = AttemptChecker::new(
//!     InMemoryRecordStore::new(),
//!     LocalLock::new(),
//!     ThrottleConfig::new(3, 10),
//! );
//! let svc = ServiceBuilder::new()
//!     .layer(ThrottleLayer::new(checker))
//!     .service_fn(|req: AuthRequest| async move {
//!         Ok::<_, Infallible>(if req.credential == b"hunter2" {
//!             AuthStatus::Success
//!         } else {
//!             AuthStatus::Failure
//!         })
//!     });
//!
//! let status = svc.oneshot(AuthRequest::new("alice", false, "hunter2")).await.unwrap();
//! assert_eq!(status, AuthStatus::Success);
//! # }
//! ```

use crate::checker::{Attempt, AttemptChecker, AuthOutcome};
use crate::error::ThrottleError;
use crate::lock::LockManager;
use crate::policy::Verdict;
use crate::store::RecordStore;
use crate::telemetry::ThrottleEvent;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use tower_layer::Layer;
use tower_service::Service;

/// Connection credentials as handed to the host's verifier.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthRequest {
    pub identity: String,
    pub ssl_active: bool,
    pub credential: Vec<u8>,
}

impl AuthRequest {
    pub fn new(identity: impl Into<String>, ssl_active: bool, credential: impl Into<Vec<u8>>) -> Self {
        Self { identity: identity.into(), ssl_active, credential: credential.into() }
    }
}

/// Verifier result.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthStatus {
    Success,
    Failure,
    /// Neither; passed through without bookkeeping.
    Other,
}

impl From<AuthStatus> for AuthOutcome {
    fn from(status: AuthStatus) -> Self {
        match status {
            AuthStatus::Success => AuthOutcome::Success,
            AuthStatus::Failure => AuthOutcome::Failure,
            AuthStatus::Other => AuthOutcome::Other,
        }
    }
}

/// Errors surfaced by [`ThrottleService`].
#[derive(Debug)]
pub enum GuardError<E> {
    /// The identity is locked out. `message` is meant for the connecting party.
    Denied { retry_after_minutes: u32, message: String },
    /// The check could not complete; the attempt must be refused.
    Throttle(ThrottleError),
    /// The verifier itself failed.
    Inner(E),
}

impl<E> GuardError<E> {
    pub fn is_denied(&self) -> bool {
        matches!(self, GuardError::Denied { .. })
    }
}

impl<E: fmt::Display> fmt::Display for GuardError<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Denied { message, .. } => write!(f, "{}", message),
            Self::Throttle(e) => write!(f, "login throttle unavailable: {}", e),
            Self::Inner(e) => write!(f, "{}", e),
        }
    }
}

impl<E: std::error::Error + 'static> std::error::Error for GuardError<E> {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Throttle(e) => Some(e),
            Self::Inner(e) => Some(e),
            Self::Denied { .. } => None,
        }
    }
}

/// Layer that wraps a verifier in a [`ThrottleService`].
pub struct ThrottleLayer<S, L, T> {
    checker: Arc<AttemptChecker<S, L, T>>,
}

impl<S, L, T> ThrottleLayer<S, L, T> {
    pub fn new(checker: AttemptChecker<S, L, T>) -> Self {
        Self { checker: Arc::new(checker) }
    }

    /// Use a checker the host also keeps, e.g. for admin operations or config reload.
    pub fn from_shared(checker: Arc<AttemptChecker<S, L, T>>) -> Self {
        Self { checker }
    }
}

impl<S, L, T> Clone for ThrottleLayer<S, L, T> {
    fn clone(&self) -> Self {
        Self { checker: self.checker.clone() }
    }
}

impl<V, S, L, T> Layer<V> for ThrottleLayer<S, L, T> {
    type Service = ThrottleService<V, S, L, T>;

    fn layer(&self, inner: V) -> Self::Service {
        ThrottleService { inner, checker: self.checker.clone() }
    }
}

/// Verifier wrapped with failure throttling.
pub struct ThrottleService<V, S, L, T> {
    inner: V,
    checker: Arc<AttemptChecker<S, L, T>>,
}

impl<V: Clone, S, L, T> Clone for ThrottleService<V, S, L, T> {
    fn clone(&self) -> Self {
        Self { inner: self.inner.clone(), checker: self.checker.clone() }
    }
}

impl<V, S, L, T> Service<AuthRequest> for ThrottleService<V, S, L, T>
where
    V: Service<AuthRequest, Response = AuthStatus> + Clone + Send + 'static,
    V::Future: Send + 'static,
    V::Error: Send + 'static,
    S: RecordStore + 'static,
    L: LockManager + 'static,
    T: Service<ThrottleEvent, Response = ()> + Clone + Send + Sync + 'static,
    T::Error: std::error::Error + Send + 'static,
    T::Future: Send + 'static,
{
    type Response = AuthStatus;
    type Error = GuardError<V::Error>;
    type Future = Pin<Box<dyn Future<Output = Result<Self::Response, Self::Error>> + Send>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx).map_err(GuardError::Inner)
    }

    fn call(&mut self, req: AuthRequest) -> Self::Future {
        let checker = self.checker.clone();
        let mut inner = self.inner.clone();

        Box::pin(async move {
            let identity = req.identity.clone();
            let ssl_active = req.ssl_active;
            let status = inner.call(req).await.map_err(GuardError::Inner)?;

            let attempt = Attempt::new(identity, ssl_active, status.into());
            match checker.check_attempt(&attempt).await {
                Ok(Verdict::Admit) => Ok(status),
                Ok(verdict @ Verdict::Deny { retry_after_minutes }) => Err(GuardError::Denied {
                    retry_after_minutes,
                    message: verdict.denial_message().unwrap_or_default(),
                }),
                Err(e) => Err(GuardError::Throttle(e)),
            }
        })
    }
}
