//! Periodic session expiry checks.
//!
//! Requests only discover an expired token when the user acts. The
//! [`ExpiryNotifier`] runs on a timer instead: it picks up token changes made
//! through shared storage, warns once before the token runs out, ends a
//! session that has no token left, and lets the refresh coordinator decide
//! whether a refresh is due.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use lectern_core::{ExpiryConfig, SessionStore, TokenInspector};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{self, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::client::SessionClient;
use crate::notify::{Notice, Notifier};
use crate::refresh::RefreshCoordinator;

/// What a single check did
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TickReport {
    /// The in-memory session was replaced from durable storage
    pub reconciled: bool,
    /// The expiry warning was shown
    pub warned: bool,
    /// No token was left and the session was ended
    pub logged_out: bool,
    /// The coordinator reported a usable access token
    pub valid: bool,
}

pub struct ExpiryNotifier {
    store: Arc<SessionStore>,
    coordinator: RefreshCoordinator,
    notifier: Arc<dyn Notifier>,
    inspector: TokenInspector,
    warning_window: chrono::Duration,
    /// Token the warning was last shown for
    warned_for: Option<String>,
}

impl ExpiryNotifier {
    pub fn new(
        coordinator: RefreshCoordinator,
        notifier: Arc<dyn Notifier>,
        warning_window: chrono::Duration,
    ) -> Self {
        Self {
            store: coordinator.store().clone(),
            inspector: coordinator.inspector(),
            coordinator,
            notifier,
            warning_window,
            warned_for: None,
        }
    }

    /// Notifier sharing the client's coordinator and notification surface
    pub fn for_client(client: &SessionClient, config: &ExpiryConfig) -> Self {
        Self::new(
            client.coordinator().clone(),
            client.notifier().clone(),
            config.warning_window(),
        )
    }

    /// Run one check
    pub async fn tick(&mut self) -> TickReport {
        let mut report = TickReport::default();

        let had_session = !self.store.snapshot().is_empty();
        report.reconciled = match self.store.reconcile_from_storage() {
            Ok(changed) => changed,
            Err(e) => {
                warn!("Could not re-read durable session: {e}");
                false
            }
        };

        let Some(token) = self.store.access_token() else {
            self.warned_for = None;
            report.logged_out = true;
            if report.reconciled && had_session {
                // Storage was already cleared by whoever signed out
                self.coordinator.announce_session_end();
            } else {
                self.coordinator.force_logout();
            }
            return report;
        };

        if self.warned_for.as_deref() != Some(token.as_str()) {
            self.warned_for = None;
        }

        let now = Utc::now();
        if self.warned_for.is_none()
            && self
                .inspector
                .expires_within_at(Some(&token), self.warning_window, now)
        {
            let minutes = self.inspector.minutes_until_expiry_at(Some(&token), now);
            info!(minutes_remaining = minutes, "Session about to expire");
            self.notifier.notify(Notice::warning(expiry_warning(minutes)));
            self.warned_for = Some(token);
            report.warned = true;
        }

        report.valid = self.coordinator.ensure_valid(false).await;
        debug!(?report, "Expiry check finished");
        report
    }

    /// Run checks every `period` on a background task. The first check runs
    /// right away.
    pub fn spawn(mut self, period: Duration) -> ExpiryHandle {
        let (shutdown, mut shutdown_rx) = watch::channel(false);

        let task = tokio::spawn(async move {
            let mut interval = time::interval(period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Skip);

            loop {
                tokio::select! {
                    changed = shutdown_rx.changed() => {
                        if changed.is_err() || *shutdown_rx.borrow() {
                            break;
                        }
                    }
                    _ = interval.tick() => {
                        self.tick().await;
                    }
                }
            }
            debug!("Expiry notifier stopped");
        });

        ExpiryHandle {
            shutdown,
            task: Some(task),
        }
    }
}

fn expiry_warning(minutes: u64) -> String {
    match minutes {
        0 => "Your session is about to expire. Save your work.".to_string(),
        1 => "Your session will expire in 1 minute. Save your work.".to_string(),
        n => format!("Your session will expire in {n} minutes. Save your work."),
    }
}

/// Stops the background checks when dropped
pub struct ExpiryHandle {
    shutdown: watch::Sender<bool>,
    task: Option<JoinHandle<()>>,
}

impl ExpiryHandle {
    /// Stop checking and wait for an in-progress check to finish
    pub async fn stop(mut self) {
        self.shutdown.send_replace(true);
        if let Some(task) = self.task.take()
            && let Err(e) = task.await
        {
            warn!("Expiry notifier task failed: {e}");
        }
    }
}

impl Drop for ExpiryHandle {
    fn drop(&mut self) {
        self.shutdown.send_replace(true);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::error::RefreshError;
    use crate::notify::Navigator;
    use crate::refresh::TokenRefresher;
    use crate::types::TokenGrant;
    use async_trait::async_trait;
    use jsonwebtoken::{EncodingKey, Header, encode};
    use lectern_core::{DurableStorage, MemoryStorage, Session};
    use serde_json::json;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct Recorder {
        notices: Mutex<Vec<Notice>>,
        redirects: AtomicUsize,
    }

    impl Recorder {
        fn warnings(&self) -> usize {
            self.notices
                .lock()
                .unwrap()
                .iter()
                .filter(|notice| notice.message.contains("Save your work"))
                .count()
        }
    }

    impl Notifier for Recorder {
        fn notify(&self, notice: Notice) {
            self.notices.lock().unwrap().push(notice);
        }
    }

    impl Navigator for Recorder {
        fn redirect_to_login(&self) {
            self.redirects.fetch_add(1, Ordering::SeqCst);
        }
    }

    /// Hands back whatever token it is currently set to
    struct FixedRefresher {
        token: Mutex<String>,
    }

    #[async_trait]
    impl TokenRefresher for FixedRefresher {
        async fn refresh(&self, _refresh_token: &str) -> Result<TokenGrant, RefreshError> {
            Ok(TokenGrant {
                access_token: self.token.lock().unwrap().clone(),
                refresh_token: None,
                user: None,
            })
        }
    }

    fn token_expiring_in(minutes: i64, jti: &str) -> String {
        let exp = (Utc::now() + chrono::Duration::minutes(minutes)).timestamp();
        encode(
            &Header::default(),
            &json!({ "sub": "learner", "exp": exp, "jti": jti }),
            &EncodingKey::from_secret(b"test-secret"),
        )
        .unwrap()
    }

    fn notifier_with(
        storage: Arc<MemoryStorage>,
        refresher: Arc<dyn TokenRefresher>,
    ) -> (ExpiryNotifier, Arc<Recorder>) {
        let store = Arc::new(SessionStore::new(storage).unwrap());
        let recorder = Arc::new(Recorder::default());
        let coordinator = RefreshCoordinator::new(
            store,
            refresher,
            recorder.clone(),
            recorder.clone(),
            TokenInspector::default(),
        );
        let notifier = ExpiryNotifier::new(
            coordinator,
            recorder.clone(),
            chrono::Duration::minutes(15),
        );
        (notifier, recorder)
    }

    #[tokio::test]
    async fn test_warns_once_per_token() {
        let expiring = token_expiring_in(10, "first");
        let refresher = Arc::new(FixedRefresher {
            token: Mutex::new(expiring.clone()),
        });
        let (mut notifier, recorder) =
            notifier_with(Arc::new(MemoryStorage::new()), refresher.clone());
        notifier
            .store
            .set_session(Session::new(expiring).with_refresh_token("refresh"))
            .unwrap();

        let first = notifier.tick().await;
        let second = notifier.tick().await;
        assert!(first.warned);
        assert!(!second.warned);
        assert_eq!(recorder.warnings(), 1);

        // A refresh that yields a new, still short-lived token warns again
        *refresher.token.lock().unwrap() = token_expiring_in(12, "second");
        notifier.coordinator.refresh().await.unwrap();

        assert!(notifier.tick().await.warned);
        assert_eq!(recorder.warnings(), 2);
        assert_eq!(recorder.redirects.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_no_warning_for_long_lived_token() {
        let token = token_expiring_in(60, "long");
        let refresher = Arc::new(FixedRefresher {
            token: Mutex::new(token.clone()),
        });
        let (mut notifier, recorder) = notifier_with(Arc::new(MemoryStorage::new()), refresher);
        notifier
            .store
            .set_session(Session::new(token).with_refresh_token("refresh"))
            .unwrap();

        let report = notifier.tick().await;
        assert!(!report.warned);
        assert!(report.valid);
        assert!(recorder.notices.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_missing_token_forces_logout_once() {
        let refresher = Arc::new(FixedRefresher {
            token: Mutex::new(String::new()),
        });
        let (mut notifier, recorder) = notifier_with(Arc::new(MemoryStorage::new()), refresher);
        notifier
            .store
            .set_refresh_token(Some("refresh".to_string()))
            .unwrap();

        assert!(notifier.tick().await.logged_out);
        assert!(notifier.tick().await.logged_out);

        assert!(notifier.store.snapshot().is_empty());
        assert_eq!(recorder.redirects.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_sign_out_elsewhere_is_announced() {
        let storage = Arc::new(MemoryStorage::new());
        let token = token_expiring_in(60, "shared");
        let refresher = Arc::new(FixedRefresher {
            token: Mutex::new(token.clone()),
        });
        let (mut notifier, recorder) = notifier_with(storage.clone(), refresher);
        notifier
            .store
            .set_session(Session::new(token).with_refresh_token("refresh"))
            .unwrap();

        storage.remove_many(&lectern_core::storage::SESSION_KEYS).unwrap();

        let report = notifier.tick().await;
        assert!(report.reconciled);
        assert!(report.logged_out);
        assert_eq!(recorder.redirects.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_spawned_notifier_runs_until_stopped() {
        let refresher = Arc::new(FixedRefresher {
            token: Mutex::new(String::new()),
        });
        let (notifier, recorder) = notifier_with(Arc::new(MemoryStorage::new()), refresher);
        notifier
            .store
            .set_refresh_token(Some("refresh".to_string()))
            .unwrap();

        let handle = notifier.spawn(Duration::from_secs(240));
        time::sleep(Duration::from_secs(1)).await;
        handle.stop().await;

        assert_eq!(recorder.redirects.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_warning_text() {
        assert_eq!(
            expiry_warning(1),
            "Your session will expire in 1 minute. Save your work."
        );
        assert!(expiry_warning(12).contains("12 minutes"));
    }
}
