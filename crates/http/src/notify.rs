//! User-facing notification and navigation surfaces

use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use reqwest::StatusCode;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

/// Shown when the session ends and the user has to sign in again
pub const SESSION_EXPIRED_MESSAGE: &str = "Your session has expired. Please sign in again.";

/// How prominent a notice is
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Severity {
    Info,
    Warning,
    Error,
}

/// A message for the user
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Notice {
    pub severity: Severity,
    pub message: String,
}

impl Notice {
    pub fn info(message: impl Into<String>) -> Self {
        Self {
            severity: Severity::Info,
            message: message.into(),
        }
    }

    pub fn warning(message: impl Into<String>) -> Self {
        Self {
            severity: Severity::Warning,
            message: message.into(),
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self {
            severity: Severity::Error,
            message: message.into(),
        }
    }
}

/// Toast-style notification surface. Fire and forget.
pub trait Notifier: Send + Sync {
    fn notify(&self, notice: Notice);
}

/// Sends the user back to the sign-in screen
pub trait Navigator: Send + Sync {
    fn redirect_to_login(&self);
}

impl<T: Notifier + ?Sized> Notifier for std::sync::Arc<T> {
    fn notify(&self, notice: Notice) {
        (**self).notify(notice);
    }
}

impl<T: Navigator + ?Sized> Navigator for std::sync::Arc<T> {
    fn redirect_to_login(&self) {
        (**self).redirect_to_login();
    }
}

/// Emits notices as log events
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingNotifier;

impl Notifier for TracingNotifier {
    fn notify(&self, notice: Notice) {
        match notice.severity {
            Severity::Info => info!(target: "lectern::notice", "{}", notice.message),
            Severity::Warning => warn!(target: "lectern::notice", "{}", notice.message),
            Severity::Error => error!(target: "lectern::notice", "{}", notice.message),
        }
    }
}

/// Logs the redirect instead of performing one, for headless hosts
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingNavigator;

impl Navigator for TracingNavigator {
    fn redirect_to_login(&self) {
        warn!("Session ended; sign in again to continue");
    }
}

/// Drops a notice identical to one shown within the last `window`
pub struct DedupNotifier<N> {
    inner: N,
    window: Duration,
    recent: Mutex<HashMap<Notice, Instant>>,
}

impl<N: Notifier> DedupNotifier<N> {
    pub fn new(inner: N, window: Duration) -> Self {
        Self {
            inner,
            window,
            recent: Mutex::new(HashMap::new()),
        }
    }
}

impl<N: Notifier> Notifier for DedupNotifier<N> {
    fn notify(&self, notice: Notice) {
        let now = Instant::now();
        {
            let mut recent = self.recent.lock().unwrap_or_else(PoisonError::into_inner);
            recent.retain(|_, shown_at| now.duration_since(*shown_at) < self.window);
            if recent.contains_key(&notice) {
                debug!(message = %notice.message, "Suppressing duplicate notice");
                return;
            }
            recent.insert(notice.clone(), now);
        }
        self.inner.notify(notice);
    }
}

/// Notice for a response status the call site should not have to handle
pub fn notice_for_status(status: StatusCode) -> Option<Notice> {
    if status == StatusCode::FORBIDDEN {
        Some(Notice::error(
            "You don't have permission to access this resource.",
        ))
    } else if status.is_server_error() {
        Some(Notice::error(
            "Something went wrong on our end. Please try again later.",
        ))
    } else {
        None
    }
}

/// Notice for a request that never produced a response
pub fn notice_for_transport(error: &reqwest::Error) -> Notice {
    if error.is_timeout() {
        Notice::error("The request timed out. Please try again.")
    } else if error.is_connect() {
        Notice::error(
            "Connection error. Please check your internet connection and try again.",
        )
    } else {
        Notice::error("A network error occurred. Please try again.")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[derive(Default, Clone)]
    struct Recording(Arc<Mutex<Vec<Notice>>>);

    impl Notifier for Recording {
        fn notify(&self, notice: Notice) {
            self.0.lock().unwrap().push(notice);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_dedup_suppresses_within_window() {
        let recording = Recording::default();
        let notifier = DedupNotifier::new(recording.clone(), Duration::from_secs(3));

        notifier.notify(Notice::error("offline"));
        notifier.notify(Notice::error("offline"));
        notifier.notify(Notice::warning("offline"));
        assert_eq!(recording.0.lock().unwrap().len(), 2);

        tokio::time::advance(Duration::from_secs(4)).await;
        notifier.notify(Notice::error("offline"));
        assert_eq!(recording.0.lock().unwrap().len(), 3);
    }

    #[test]
    fn test_status_notices() {
        assert!(notice_for_status(StatusCode::FORBIDDEN).is_some());
        assert!(notice_for_status(StatusCode::SERVICE_UNAVAILABLE).is_some());
        assert!(notice_for_status(StatusCode::NOT_FOUND).is_none());
        assert!(notice_for_status(StatusCode::UNAUTHORIZED).is_none());
        assert!(notice_for_status(StatusCode::OK).is_none());
    }
}
