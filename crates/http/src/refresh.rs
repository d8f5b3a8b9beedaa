//! Single-flight token refresh.
//!
//! [`RefreshCoordinator`] makes sure at most one refresh call is in flight
//! for the whole client. Callers that arrive while a refresh is running are
//! queued and receive the same outcome when it settles. The refresh itself
//! runs on its own task so a caller giving up cannot cancel it, and the
//! coordinator always returns to idle once it settles.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use lectern_core::{SessionStore, TokenInspector};
use reqwest::{Client, header};
use tokio::sync::oneshot;
use tracing::{debug, error, info, warn};

use crate::client::error::RefreshError;
use crate::notify::{Navigator, Notice, Notifier, SESSION_EXPIRED_MESSAGE};
use crate::types::{RefreshTokenRequest, TokenGrant};

/// Exchanges a refresh token for a new grant
#[async_trait]
pub trait TokenRefresher: Send + Sync {
    async fn refresh(&self, refresh_token: &str) -> Result<TokenGrant, RefreshError>;
}

/// Calls the backend refresh endpoint
#[derive(Clone)]
pub struct HttpTokenRefresher {
    client: Client,
    url: String,
}

impl HttpTokenRefresher {
    pub fn new(client: Client, url: impl Into<String>) -> Self {
        Self {
            client,
            url: url.into(),
        }
    }

    pub fn url(&self) -> &str {
        &self.url
    }
}

#[async_trait]
impl TokenRefresher for HttpTokenRefresher {
    async fn refresh(&self, refresh_token: &str) -> Result<TokenGrant, RefreshError> {
        let response = self
            .client
            .post(&self.url)
            .header(header::CONTENT_TYPE, "application/json")
            .json(&RefreshTokenRequest {
                refresh_token: refresh_token.to_string(),
            })
            .send()
            .await
            .map_err(|e| RefreshError::Network(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let message = response.text().await.unwrap_or_else(|_| status.to_string());
            return Err(RefreshError::Rejected {
                status: status.as_u16(),
                message,
            });
        }

        response
            .json::<TokenGrant>()
            .await
            .map_err(|e| RefreshError::InvalidResponse(e.to_string()))
    }
}

/// Observable state of the coordinator
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefreshState {
    Idle,
    Refreshing,
}

type RefreshOutcome = Result<String, RefreshError>;

enum Phase {
    Idle,
    Refreshing(Vec<oneshot::Sender<RefreshOutcome>>),
}

struct Inner {
    store: Arc<SessionStore>,
    refresher: Arc<dyn TokenRefresher>,
    navigator: Arc<dyn Navigator>,
    notifier: Arc<dyn Notifier>,
    inspector: TokenInspector,
    phase: Mutex<Phase>,
}

/// Sole authority on refreshing, and on ending, the current session
#[derive(Clone)]
pub struct RefreshCoordinator {
    inner: Arc<Inner>,
}

impl RefreshCoordinator {
    pub fn new(
        store: Arc<SessionStore>,
        refresher: Arc<dyn TokenRefresher>,
        navigator: Arc<dyn Navigator>,
        notifier: Arc<dyn Notifier>,
        inspector: TokenInspector,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                store,
                refresher,
                navigator,
                notifier,
                inspector,
                phase: Mutex::new(Phase::Idle),
            }),
        }
    }

    pub fn state(&self) -> RefreshState {
        match *self.inner.lock_phase() {
            Phase::Idle => RefreshState::Idle,
            Phase::Refreshing(_) => RefreshState::Refreshing,
        }
    }

    pub fn store(&self) -> &Arc<SessionStore> {
        &self.inner.store
    }

    pub fn inspector(&self) -> TokenInspector {
        self.inner.inspector
    }

    /// Make sure the session holds a usable access token.
    ///
    /// Without a refresh token the access token is dropped and `false` is
    /// returned. A token that is not expiring soon is accepted as is unless
    /// `force_refresh` is set. Otherwise a refresh is started, or joined if
    /// one is already running.
    pub async fn ensure_valid(&self, force_refresh: bool) -> bool {
        let store = &self.inner.store;
        if store.refresh_token().is_none() {
            debug!("No refresh token, dropping access token and user");
            if let Err(e) = store.clear_access_token() {
                warn!("Failed to clear access token: {e}");
            }
            return false;
        }

        if !force_refresh {
            let token = store.access_token();
            if token.is_some() && !self.inner.inspector.is_expiring_soon(token.as_deref()) {
                return true;
            }
        }

        self.refresh().await.is_ok()
    }

    /// Recover from a 401 received while using `stale_token`.
    ///
    /// Without a refresh token the session ends right away. If the session
    /// already holds a different access token, someone refreshed in the
    /// meantime and that token is returned without another refresh call.
    pub async fn recover_from_unauthorized(
        &self,
        stale_token: Option<&str>,
    ) -> Result<String, RefreshError> {
        let store = &self.inner.store;
        if store.refresh_token().is_none() {
            self.inner.end_session(&RefreshError::NoRefreshToken);
            return Err(RefreshError::NoRefreshToken);
        }

        if let Some(current) = store.access_token()
            && Some(current.as_str()) != stale_token
            && self.state() == RefreshState::Idle
        {
            debug!("Access token already replaced, retrying with it");
            return Ok(current);
        }

        self.refresh().await
    }

    /// Refresh the access token, joining the in-flight refresh if any
    pub async fn refresh(&self) -> Result<String, RefreshError> {
        let (sender, receiver) = oneshot::channel();
        {
            let mut phase = self.inner.lock_phase();
            match &mut *phase {
                Phase::Refreshing(waiters) => {
                    waiters.push(sender);
                    debug!(queued = waiters.len(), "Refresh in flight, queueing caller");
                }
                Phase::Idle => {
                    *phase = Phase::Refreshing(vec![sender]);
                    let inner = Arc::clone(&self.inner);
                    tokio::spawn(async move {
                        let flight = Flight {
                            inner: &inner,
                            settled: false,
                        };
                        let outcome = inner.perform_refresh().await;
                        flight.settle(outcome);
                    });
                }
            }
        }

        receiver.await.unwrap_or(Err(RefreshError::Abandoned))
    }

    /// Clear the session and send the user back to sign in.
    ///
    /// Safe to call repeatedly; the user is only notified and redirected
    /// when there was something to clear.
    pub fn force_logout(&self) {
        info!("Forcing logout");
        self.inner.clear_session();
    }

    /// Tell the user a session ended outside this client, e.g. by another
    /// process signing out through shared storage
    pub(crate) fn announce_session_end(&self) {
        info!("Session ended elsewhere");
        self.inner.announce_session_end();
    }
}

impl Inner {
    fn lock_phase(&self) -> MutexGuard<'_, Phase> {
        self.phase.lock().unwrap_or_else(PoisonError::into_inner)
    }

    async fn perform_refresh(&self) -> RefreshOutcome {
        let refresh_token = self
            .store
            .refresh_token()
            .ok_or(RefreshError::NoRefreshToken)?;

        debug!("Refreshing access token");
        let grant = self.refresher.refresh(&refresh_token).await?;

        let Some(expires_at) = self.inspector.expires_at(&grant.access_token) else {
            return Err(RefreshError::InvalidResponse(
                "refreshed access token carries no readable expiry".to_string(),
            ));
        };
        if self.inspector.is_expired(Some(&grant.access_token)) {
            warn!(%expires_at, "Refreshed access token is already inside the expiry margin");
        }

        self.store
            .update_tokens(grant.access_token.clone(), grant.refresh_token, grant.user)
            .map_err(|e| RefreshError::Storage(e.to_string()))?;

        info!(
            minutes_remaining = self.inspector.minutes_until_expiry(Some(&grant.access_token)),
            "Access token refreshed"
        );
        Ok(grant.access_token)
    }

    fn end_session(&self, reason: &RefreshError) {
        match reason {
            RefreshError::NoRefreshToken => info!("Ending session: no refresh token"),
            RefreshError::Rejected { status, .. } => {
                warn!(status, "Ending session: refresh token rejected");
            }
            RefreshError::Network(e) => error!("Ending session: refresh request failed: {e}"),
            other => warn!("Ending session: {other}"),
        }
        self.clear_session();
    }

    fn clear_session(&self) {
        let had_session = !self.store.snapshot().is_empty();
        if let Err(e) = self.store.logout() {
            error!("Failed to clear session storage: {e}");
        }
        if had_session {
            self.announce_session_end();
        }
    }

    fn announce_session_end(&self) {
        self.notifier.notify(Notice::warning(SESSION_EXPIRED_MESSAGE));
        self.navigator.redirect_to_login();
    }
}

/// Settles the in-flight refresh exactly once, even if the refresh task
/// unwinds before reporting
struct Flight<'a> {
    inner: &'a Inner,
    settled: bool,
}

impl Flight<'_> {
    fn settle(mut self, outcome: RefreshOutcome) {
        self.settled = true;
        settle(self.inner, outcome);
    }
}

impl Drop for Flight<'_> {
    fn drop(&mut self) {
        if !self.settled {
            settle(self.inner, Err(RefreshError::Abandoned));
        }
    }
}

fn settle(inner: &Inner, outcome: RefreshOutcome) {
    if let Err(e) = &outcome {
        inner.end_session(e);
    }

    let waiters = match std::mem::replace(&mut *inner.lock_phase(), Phase::Idle) {
        Phase::Refreshing(waiters) => waiters,
        Phase::Idle => Vec::new(),
    };
    debug!(
        waiters = waiters.len(),
        success = outcome.is_ok(),
        "Refresh settled"
    );

    for waiter in waiters {
        // A receiver that went away no longer cares about the outcome
        let _ = waiter.send(outcome.clone());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, Utc};
    use jsonwebtoken::{EncodingKey, Header, encode};
    use lectern_core::{MemoryStorage, Session, UserProfile};
    use mockall::mock;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    mock! {
        pub Refresher {}

        #[async_trait]
        impl TokenRefresher for Refresher {
            async fn refresh(&self, refresh_token: &str) -> Result<TokenGrant, RefreshError>;
        }
    }

    #[derive(Default)]
    struct Recorder {
        notices: Mutex<Vec<Notice>>,
        redirects: AtomicUsize,
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

    /// Refresher that counts calls and answers after a delay
    struct SlowRefresher {
        calls: AtomicUsize,
        result: Result<TokenGrant, RefreshError>,
    }

    #[async_trait]
    impl TokenRefresher for SlowRefresher {
        async fn refresh(&self, _refresh_token: &str) -> Result<TokenGrant, RefreshError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(std::time::Duration::from_millis(50)).await;
            self.result.clone()
        }
    }

    fn token_expiring_in(minutes: i64) -> String {
        let exp = (Utc::now() + Duration::minutes(minutes)).timestamp();
        encode(
            &Header::default(),
            &json!({ "sub": "learner", "exp": exp, "jti": minutes }),
            &EncodingKey::from_secret(b"test-secret"),
        )
        .unwrap()
    }

    fn coordinator(
        session: Session,
        refresher: Arc<dyn TokenRefresher>,
    ) -> (RefreshCoordinator, Arc<Recorder>) {
        let store = Arc::new(SessionStore::new(Arc::new(MemoryStorage::new())).unwrap());
        store.set_session(session).unwrap();
        let recorder = Arc::new(Recorder::default());
        let coordinator = RefreshCoordinator::new(
            store,
            refresher,
            recorder.clone(),
            recorder.clone(),
            TokenInspector::default(),
        );
        (coordinator, recorder)
    }

    #[tokio::test]
    async fn test_fast_path_makes_no_refresh_call() {
        let mut refresher = MockRefresher::new();
        refresher.expect_refresh().times(0);

        let session = Session::new(token_expiring_in(60)).with_refresh_token("refresh");
        let (coordinator, _) = coordinator(session, Arc::new(refresher));

        assert!(coordinator.ensure_valid(false).await);
        assert_eq!(coordinator.state(), RefreshState::Idle);
    }

    #[tokio::test]
    async fn test_missing_refresh_token_fails_closed() {
        let mut refresher = MockRefresher::new();
        refresher.expect_refresh().times(0);

        let (coordinator, recorder) =
            coordinator(Session::new(token_expiring_in(60)), Arc::new(refresher));

        assert!(!coordinator.ensure_valid(false).await);
        assert!(coordinator.store().access_token().is_none());
        assert_eq!(recorder.redirects.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_missing_refresh_token_drops_user_with_token() {
        let mut refresher = MockRefresher::new();
        refresher.expect_refresh().times(0);

        let user = UserProfile {
            id: "1".to_string(),
            name: None,
            email: None,
            role: None,
            avatar: None,
        };
        let storage = Arc::new(MemoryStorage::new());
        let store = Arc::new(SessionStore::new(storage.clone()).unwrap());
        store
            .set_session(
                Session::new("opaque")
                    .with_user(user)
                    .with_program_type("bootcamp"),
            )
            .unwrap();
        let recorder = Arc::new(Recorder::default());
        let coordinator = RefreshCoordinator::new(
            store,
            Arc::new(refresher),
            recorder.clone(),
            recorder,
            TokenInspector::default(),
        );

        assert!(!coordinator.ensure_valid(false).await);
        let session = coordinator.store().snapshot();
        assert!(session.access_token.is_none());
        assert!(session.user.is_none());
        assert_eq!(session.program_type.as_deref(), Some("bootcamp"));

        // Nothing stale comes back on the next start either
        let reloaded = SessionStore::new(storage).unwrap();
        assert!(reloaded.snapshot().user.is_none());
        assert!(reloaded.snapshot().access_token.is_none());
    }

    #[tokio::test]
    async fn test_expiring_token_is_refreshed() {
        let fresh = token_expiring_in(60);
        let mut refresher = MockRefresher::new();
        let grant = TokenGrant {
            access_token: fresh.clone(),
            refresh_token: Some("rotated".to_string()),
            user: None,
        };
        refresher
            .expect_refresh()
            .times(1)
            .returning(move |token| {
                assert_eq!(token, "refresh");
                Ok(grant.clone())
            });

        let session = Session::new(token_expiring_in(10)).with_refresh_token("refresh");
        let (coordinator, _) = coordinator(session, Arc::new(refresher));

        assert!(coordinator.ensure_valid(false).await);
        let session = coordinator.store().snapshot();
        assert_eq!(session.access_token, Some(fresh));
        assert_eq!(session.refresh_token.as_deref(), Some("rotated"));
    }

    #[tokio::test]
    async fn test_concurrent_callers_share_one_refresh() {
        let fresh = token_expiring_in(60);
        let refresher = Arc::new(SlowRefresher {
            calls: AtomicUsize::new(0),
            result: Ok(TokenGrant {
                access_token: fresh.clone(),
                refresh_token: None,
                user: None,
            }),
        });

        let session = Session::new(token_expiring_in(-1)).with_refresh_token("refresh");
        let (coordinator, _) = coordinator(session, refresher.clone());

        let mut tasks = tokio::task::JoinSet::new();
        for _ in 0..8 {
            let coordinator = coordinator.clone();
            tasks.spawn(async move { coordinator.refresh().await });
        }

        while let Some(result) = tasks.join_next().await {
            assert_eq!(result.unwrap(), Ok(fresh.clone()));
        }
        assert_eq!(refresher.calls.load(Ordering::SeqCst), 1);
        assert_eq!(coordinator.state(), RefreshState::Idle);
    }

    #[tokio::test]
    async fn test_network_failure_ends_session_once() {
        let refresher = Arc::new(SlowRefresher {
            calls: AtomicUsize::new(0),
            result: Err(RefreshError::Network("connection refused".to_string())),
        });

        let session = Session::new(token_expiring_in(-1)).with_refresh_token("refresh");
        let (coordinator, recorder) = coordinator(session, refresher.clone());

        let mut tasks = tokio::task::JoinSet::new();
        for _ in 0..4 {
            let coordinator = coordinator.clone();
            tasks.spawn(async move { coordinator.refresh().await });
        }

        while let Some(result) = tasks.join_next().await {
            assert!(matches!(result.unwrap(), Err(RefreshError::Network(_))));
        }
        assert_eq!(refresher.calls.load(Ordering::SeqCst), 1);
        assert!(coordinator.store().snapshot().is_empty());
        assert_eq!(recorder.redirects.load(Ordering::SeqCst), 1);
        assert_eq!(coordinator.state(), RefreshState::Idle);
    }

    #[tokio::test]
    async fn test_undecodable_grant_is_rejected() {
        let mut refresher = MockRefresher::new();
        refresher.expect_refresh().times(1).returning(|_| {
            Ok(TokenGrant {
                access_token: "opaque".to_string(),
                refresh_token: None,
                user: None,
            })
        });

        let session = Session::new(token_expiring_in(1)).with_refresh_token("refresh");
        let (coordinator, recorder) = coordinator(session, Arc::new(refresher));

        assert!(matches!(
            coordinator.refresh().await,
            Err(RefreshError::InvalidResponse(_))
        ));
        assert!(!coordinator.store().is_authenticated());
        assert_eq!(recorder.redirects.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_force_logout_is_idempotent() {
        let refresher = MockRefresher::new();
        let session = Session::new(token_expiring_in(60)).with_refresh_token("refresh");
        let (coordinator, recorder) = coordinator(session, Arc::new(refresher));

        coordinator.force_logout();
        coordinator.force_logout();

        assert!(coordinator.store().snapshot().is_empty());
        assert_eq!(recorder.redirects.load(Ordering::SeqCst), 1);
        assert_eq!(recorder.notices.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_unauthorized_with_replaced_token_skips_refresh() {
        let mut refresher = MockRefresher::new();
        refresher.expect_refresh().times(0);

        let current = token_expiring_in(60);
        let session = Session::new(current.clone()).with_refresh_token("refresh");
        let (coordinator, _) = coordinator(session, Arc::new(refresher));

        let token = coordinator
            .recover_from_unauthorized(Some("stale"))
            .await
            .unwrap();
        assert_eq!(token, current);
    }
}
