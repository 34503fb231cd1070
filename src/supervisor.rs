//! Restart-on-runtime-error policy, run as an async task beside the session.
//!
//! The session never retries on its own. This task watches the state
//! events a delegate forwards and calls `start()` again after a capture
//! runtime failure, backing off linearly, until the attempt budget runs out.

use std::time::Duration;

use flume::Receiver;
use tracing::{debug, error, info, warn};

use crate::error::CameraError;
use crate::session::{SessionControl, SessionEvent, SessionState};
use crate::RetryConfig;

/// Something the supervisor can restart
pub trait Restart: Send + Sync {
    fn restart(&self);
}

impl Restart for SessionControl {
    fn restart(&self) {
        self.start();
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SupervisorExit {
    /// Every event sender was dropped
    EventsClosed,
    /// `max_attempts` restarts in a row did not bring streaming back
    GaveUp { attempts: u32 },
}

pub async fn supervise<R: Restart>(
    target: R,
    policy: RetryConfig,
    events: Receiver<SessionEvent>,
) -> SupervisorExit {
    let mut attempts = 0u32;

    while let Ok(event) = events.recv_async().await {
        match event {
            SessionEvent {
                state: SessionState::Streaming,
                error: None,
            } => {
                if attempts > 0 {
                    info!(attempts, "capture recovered");
                }
                attempts = 0;
            }
            SessionEvent {
                error: Some(CameraError::CaptureSessionRuntimeError),
                ..
            } if policy.enabled => {
                if attempts >= policy.max_attempts {
                    error!(attempts, "giving up on capture restarts");
                    return SupervisorExit::GaveUp { attempts };
                }

                attempts += 1;
                let delay = Duration::from_millis(policy.backoff_ms.saturating_mul(u64::from(attempts)));
                warn!(attempts, ?delay, "restarting capture after runtime error");
                tokio::time::sleep(delay).await;
                target.restart();
            }
            SessionEvent {
                state,
                error: Some(error),
            } => debug!(?state, %error, "session error"),
            SessionEvent { state, error: None } => debug!(?state, "session state"),
        }
    }

    SupervisorExit::EventsClosed
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    #[derive(Clone, Default)]
    struct Counter(Arc<AtomicU32>);

    impl Restart for Counter {
        fn restart(&self) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn policy(max_attempts: u32) -> RetryConfig {
        RetryConfig {
            enabled: true,
            backoff_ms: 1,
            max_attempts,
        }
    }

    fn runtime_error() -> SessionEvent {
        SessionEvent {
            state: SessionState::Error,
            error: Some(CameraError::CaptureSessionRuntimeError),
        }
    }

    fn streaming() -> SessionEvent {
        SessionEvent {
            state: SessionState::Streaming,
            error: None,
        }
    }

    #[tokio::test]
    async fn gives_up_after_max_attempts() {
        let counter = Counter::default();
        let (tx, rx) = flume::unbounded();
        for _ in 0..4 {
            tx.send(runtime_error()).unwrap();
        }

        let exit = supervise(counter.clone(), policy(3), rx).await;
        assert_eq!(exit, SupervisorExit::GaveUp { attempts: 3 });
        assert_eq!(counter.0.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn streaming_resets_the_budget() {
        let counter = Counter::default();
        let (tx, rx) = flume::unbounded();
        for event in [runtime_error(), streaming(), runtime_error(), streaming(), runtime_error()] {
            tx.send(event).unwrap();
        }
        drop(tx);

        let exit = supervise(counter.clone(), policy(1), rx).await;
        assert_eq!(exit, SupervisorExit::EventsClosed);
        assert_eq!(counter.0.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn other_errors_and_disabled_policy_never_restart() {
        let counter = Counter::default();
        let (tx, rx) = flume::unbounded();
        tx.send(SessionEvent {
            state: SessionState::Error,
            error: Some(CameraError::RequestedHardwareNotFound),
        })
        .unwrap();
        tx.send(SessionEvent {
            state: SessionState::Streaming,
            error: Some(CameraError::FailedToRetrieveTimestamp),
        })
        .unwrap();
        tx.send(runtime_error()).unwrap();
        drop(tx);

        let disabled = RetryConfig {
            enabled: false,
            ..policy(5)
        };
        assert_eq!(supervise(counter.clone(), disabled, rx).await, SupervisorExit::EventsClosed);
        assert_eq!(counter.0.load(Ordering::SeqCst), 0);
    }
}
