//! Session-aware HTTP client.
//!
//! Every request goes through one pipeline: the current access token is
//! attached unless the request is an auth endpoint or explicitly skips auth,
//! a 401 triggers a single-flight refresh followed by one retry with the new
//! token, and error statuses the call site should not have to handle are
//! surfaced to the user.

pub mod auth;
pub mod error;
pub mod request;

use std::sync::Arc;
use std::time::Duration;

use error::ClientError;
use lectern_core::{EndpointConfig, ExpiryConfig, SessionConfig, SessionStore, TokenInspector};
use request::ApiRequest;
use reqwest::{Client, ClientBuilder, Response, StatusCode, header};
use tracing::{debug, warn};

use crate::expiry::ExpiryNotifier;
use crate::notify::{
    DedupNotifier, Navigator, Notifier, TracingNavigator, TracingNotifier, notice_for_status,
    notice_for_transport,
};
use crate::refresh::{HttpTokenRefresher, RefreshCoordinator, TokenRefresher};

const DEFAULT_USER_AGENT: &str = concat!("lectern-client/", env!("CARGO_PKG_VERSION"));
const DEFAULT_DEDUP_WINDOW: Duration = Duration::from_secs(3);

/// API client that keeps the session's bearer token fresh
#[derive(Clone)]
pub struct SessionClient {
    client: Client,
    base_url: String,
    endpoints: EndpointConfig,
    store: Arc<SessionStore>,
    coordinator: RefreshCoordinator,
    notifier: Arc<dyn Notifier>,
}

impl SessionClient {
    /// Create a new client builder
    pub fn builder() -> SessionClientBuilder {
        SessionClientBuilder::default()
    }

    /// Get the base URL
    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    pub fn store(&self) -> &Arc<SessionStore> {
        &self.store
    }

    pub fn coordinator(&self) -> &RefreshCoordinator {
        &self.coordinator
    }

    pub fn endpoints(&self) -> &EndpointConfig {
        &self.endpoints
    }

    /// Notification surface, with duplicate suppression applied
    pub fn notifier(&self) -> &Arc<dyn Notifier> {
        &self.notifier
    }

    /// Expiry notifier sharing this client's session and surfaces
    pub fn expiry_notifier(&self, config: &ExpiryConfig) -> ExpiryNotifier {
        ExpiryNotifier::for_client(self, config)
    }

    /// Login, signup and refresh never carry credentials
    fn is_auth_endpoint(&self, route: &str) -> bool {
        route == self.endpoints.login
            || route == self.endpoints.signup
            || route == self.endpoints.refresh
    }

    fn bearer_for(&self, request: &ApiRequest) -> Option<String> {
        if request.is_skip_auth() || self.is_auth_endpoint(request.route()) {
            None
        } else {
            self.store.access_token()
        }
    }

    /// Send a request through the auth pipeline.
    ///
    /// Responses other than 401 are returned unchanged, error statuses
    /// included. A 401 is recovered by refreshing the session and retrying
    /// once; if that is not possible the call fails with
    /// [`ClientError::AuthenticationFailed`] or [`ClientError::Refresh`].
    pub async fn send(&self, mut request: ApiRequest) -> Result<Response, ClientError> {
        let token = self.bearer_for(&request);
        let response = self.dispatch(&request, token.as_deref()).await?;
        if response.status() != StatusCode::UNAUTHORIZED {
            self.surface_status(response.status());
            return Ok(response);
        }

        if request.is_skip_auth()
            || self.is_auth_endpoint(request.route())
            || !request.refreshes_on_unauthorized()
            || request.is_retried()
        {
            debug!(path = request.route(), "Unauthorized, not eligible for refresh");
            return Err(unauthorized(response).await);
        }

        request.mark_retried();
        let token = self
            .coordinator
            .recover_from_unauthorized(token.as_deref())
            .await?;

        debug!(path = request.route(), "Retrying with refreshed token");
        let response = self.dispatch(&request, Some(&token)).await?;
        if response.status() == StatusCode::UNAUTHORIZED {
            warn!(path = request.route(), "Still unauthorized after refresh");
            return Err(unauthorized(response).await);
        }

        self.surface_status(response.status());
        Ok(response)
    }

    /// Send a request and decode a successful JSON response
    pub async fn execute<T: serde::de::DeserializeOwned>(
        &self,
        request: ApiRequest,
    ) -> Result<T, ClientError> {
        let response = self.send(request).await?;
        let status = response.status();

        if status.is_success() {
            Ok(response.json().await?)
        } else {
            let message = response.text().await.unwrap_or_else(|_| status.to_string());
            Err(ClientError::from_status(status, message))
        }
    }

    async fn dispatch(
        &self,
        request: &ApiRequest,
        token: Option<&str>,
    ) -> Result<Response, ClientError> {
        let url = format!("{}{}", self.base_url, request.path());

        let mut headers = request.headers().clone();
        headers.remove(header::AUTHORIZATION);
        let mut builder = self
            .client
            .request(request.method().clone(), url)
            .headers(headers);

        if let Some(token) = token {
            builder = builder.bearer_auth(token);
        }
        if !request.query_pairs().is_empty() {
            builder = builder.query(request.query_pairs());
        }
        if let Some(body) = request.body() {
            builder = builder.json(body);
        }
        if let Some(timeout) = request.request_timeout() {
            builder = builder.timeout(timeout);
        }

        builder.send().await.map_err(|e| {
            warn!(path = request.route(), "Request failed without a response: {e}");
            self.notifier.notify(notice_for_transport(&e));
            ClientError::Request(e)
        })
    }

    fn surface_status(&self, status: StatusCode) {
        if let Some(notice) = notice_for_status(status) {
            self.notifier.notify(notice);
        }
    }
}

async fn unauthorized(response: Response) -> ClientError {
    let status = response.status();
    let message = response.text().await.unwrap_or_else(|_| status.to_string());
    ClientError::AuthenticationFailed(message)
}

/// Builder for SessionClient
#[derive(Default)]
pub struct SessionClientBuilder {
    base_url: Option<String>,
    timeout: Option<Duration>,
    user_agent: Option<String>,
    endpoints: Option<EndpointConfig>,
    inspector: Option<TokenInspector>,
    dedup_window: Option<Duration>,
    store: Option<Arc<SessionStore>>,
    refresher: Option<Arc<dyn TokenRefresher>>,
    notifier: Option<Arc<dyn Notifier>>,
    navigator: Option<Arc<dyn Navigator>>,
}

impl SessionClientBuilder {
    /// Take base URL, timeout, user agent, endpoints and expiry margins
    /// from the configuration
    pub fn config(mut self, config: &SessionConfig) -> Self {
        self.base_url = Some(config.api.base_url.clone());
        self.timeout = Some(config.api.timeout());
        self.user_agent = Some(config.api.user_agent.clone());
        self.endpoints = Some(config.endpoints.clone());
        self.inspector = Some(TokenInspector::from_config(&config.expiry));
        self.dedup_window = Some(config.notifications.dedup_window());
        self
    }

    /// Set the base URL
    pub fn base_url(mut self, url: impl Into<String>) -> Self {
        self.base_url = Some(url.into());
        self
    }

    /// Set the request timeout
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Set the user agent
    pub fn user_agent(mut self, agent: impl Into<String>) -> Self {
        self.user_agent = Some(agent.into());
        self
    }

    pub fn endpoints(mut self, endpoints: EndpointConfig) -> Self {
        self.endpoints = Some(endpoints);
        self
    }

    pub fn inspector(mut self, inspector: TokenInspector) -> Self {
        self.inspector = Some(inspector);
        self
    }

    /// Session store shared with the rest of the application
    pub fn store(mut self, store: Arc<SessionStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Replace the HTTP call to the refresh endpoint
    pub fn refresher(mut self, refresher: Arc<dyn TokenRefresher>) -> Self {
        self.refresher = Some(refresher);
        self
    }

    /// Notification surface; wrapped in a [`DedupNotifier`]
    pub fn notifier(mut self, notifier: Arc<dyn Notifier>) -> Self {
        self.notifier = Some(notifier);
        self
    }

    pub fn navigator(mut self, navigator: Arc<dyn Navigator>) -> Self {
        self.navigator = Some(navigator);
        self
    }

    /// Build the client
    pub fn build(self) -> Result<SessionClient, ClientError> {
        let base_url = self
            .base_url
            .ok_or_else(|| ClientError::Configuration("base_url is required".into()))?;
        let store = self
            .store
            .ok_or_else(|| ClientError::Configuration("session store is required".into()))?;

        // Ensure base_url ends without a trailing slash
        let base_url = base_url.trim_end_matches('/').to_string();
        let endpoints = self.endpoints.unwrap_or_default();

        let mut client_builder = ClientBuilder::new()
            .user_agent(self.user_agent.as_deref().unwrap_or(DEFAULT_USER_AGENT));
        if let Some(timeout) = self.timeout {
            client_builder = client_builder.timeout(timeout);
        }
        let client = client_builder.build()?;

        let notifier: Arc<dyn Notifier> = Arc::new(DedupNotifier::new(
            self.notifier
                .unwrap_or_else(|| Arc::new(TracingNotifier)),
            self.dedup_window.unwrap_or(DEFAULT_DEDUP_WINDOW),
        ));
        let navigator = self
            .navigator
            .unwrap_or_else(|| Arc::new(TracingNavigator));
        let refresher = self.refresher.unwrap_or_else(|| {
            Arc::new(HttpTokenRefresher::new(
                client.clone(),
                format!("{base_url}{}", endpoints.refresh),
            ))
        });

        let coordinator = RefreshCoordinator::new(
            store.clone(),
            refresher,
            navigator,
            notifier.clone(),
            self.inspector.unwrap_or_default(),
        );

        Ok(SessionClient {
            client,
            base_url,
            endpoints,
            store,
            coordinator,
            notifier,
        })
    }
}
