//! Lectern HTTP client.
//!
//! A [`SessionClient`] attaches the signed-in user's bearer token to every
//! request and recovers from a 401 by refreshing the session once, shared
//! between all requests that failed at the same time. An [`ExpiryNotifier`]
//! watches the token in the background so idle sessions are warned about
//! and ended before the next request fails.

pub mod client;
pub mod expiry;
pub mod notify;
pub mod refresh;
pub mod types;

pub use client::error::{ClientError, RefreshError};
pub use client::request::ApiRequest;
pub use client::{SessionClient, SessionClientBuilder};
pub use expiry::{ExpiryHandle, ExpiryNotifier, TickReport};
pub use notify::{
    DedupNotifier, Navigator, Notice, Notifier, SESSION_EXPIRED_MESSAGE, Severity,
    TracingNavigator, TracingNotifier,
};
pub use refresh::{HttpTokenRefresher, RefreshCoordinator, RefreshState, TokenRefresher};
pub use types::{Credentials, LogoutRequest, Registration, RefreshTokenRequest, TokenGrant};

pub type Result<T> = std::result::Result<T, ClientError>;
