//! Client-side inspection of bearer token expiry.
//!
//! Tokens are decoded without verifying their signature. The result is only a
//! hint for deciding when to refresh or warn; the server remains the authority
//! on whether a token is accepted. Every decode failure is reported as an
//! already expired token.

use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use chrono::{DateTime, Duration, Utc};
use serde::Deserialize;
use serde_json::Value;

use crate::config::ExpiryConfig;

/// Margin before the real expiry at which a token counts as expired
pub const DEFAULT_EXPIRED_MARGIN_SECS: i64 = 5 * 60;

/// Window in which a token counts as expiring soon and gets refreshed early
pub const DEFAULT_EXPIRING_SOON_SECS: i64 = 30 * 60;

#[derive(Deserialize)]
struct ExpiryClaim {
    exp: Option<Value>,
}

/// Extract the `exp` claim of a JWT-shaped token.
///
/// Returns `None` for anything that is not a dot-separated token with a
/// base64url JSON payload carrying a numeric `exp`.
pub fn decode_expiry(token: &str) -> Option<DateTime<Utc>> {
    let payload = token.split('.').nth(1)?;
    if payload.is_empty() {
        return None;
    }

    // Accept padded and standard-alphabet payloads as well
    let normalized: String = payload
        .trim_end_matches('=')
        .chars()
        .map(|c| match c {
            '+' => '-',
            '/' => '_',
            other => other,
        })
        .collect();

    let bytes = URL_SAFE_NO_PAD.decode(normalized).ok()?;
    let claim: ExpiryClaim = serde_json::from_slice(&bytes).ok()?;

    match claim.exp? {
        Value::Number(n) => {
            if let Some(secs) = n.as_i64() {
                DateTime::from_timestamp(secs, 0)
            } else {
                let secs = n.as_f64()?;
                if !secs.is_finite() {
                    return None;
                }
                DateTime::from_timestamp_millis((secs * 1000.0) as i64)
            }
        }
        _ => None,
    }
}

/// Whole seconds as a [`Duration`], clamped to the largest representable span
pub(crate) fn seconds_saturating(secs: i64) -> Duration {
    Duration::try_seconds(secs).unwrap_or(if secs < 0 { Duration::MIN } else { Duration::MAX })
}

/// Answers expiry questions about bearer tokens
#[derive(Debug, Clone, Copy)]
pub struct TokenInspector {
    expired_margin: Duration,
    expiring_soon: Duration,
}

impl Default for TokenInspector {
    fn default() -> Self {
        Self {
            expired_margin: Duration::seconds(DEFAULT_EXPIRED_MARGIN_SECS),
            expiring_soon: Duration::seconds(DEFAULT_EXPIRING_SOON_SECS),
        }
    }
}

impl TokenInspector {
    /// Create an inspector with custom margins
    pub fn new(expired_margin: Duration, expiring_soon: Duration) -> Self {
        Self {
            expired_margin,
            expiring_soon,
        }
    }

    /// Create an inspector from the expiry section of the configuration
    pub fn from_config(config: &ExpiryConfig) -> Self {
        Self::new(
            seconds_saturating(config.expired_margin_secs),
            seconds_saturating(config.expiring_soon_secs),
        )
    }

    /// Expiry instant of the token, if it can be decoded
    pub fn expires_at(&self, token: &str) -> Option<DateTime<Utc>> {
        decode_expiry(token)
    }

    /// Whether the token is missing, malformed or inside the expiry margin
    pub fn is_expired(&self, token: Option<&str>) -> bool {
        self.is_expired_at(token, Utc::now())
    }

    /// [`is_expired`](Self::is_expired) against a fixed clock
    pub fn is_expired_at(&self, token: Option<&str>, now: DateTime<Utc>) -> bool {
        self.expires_within_at(token, self.expired_margin, now)
    }

    /// Whether the token should be refreshed before it is used again
    pub fn is_expiring_soon(&self, token: Option<&str>) -> bool {
        self.is_expiring_soon_at(token, Utc::now())
    }

    /// [`is_expiring_soon`](Self::is_expiring_soon) against a fixed clock
    pub fn is_expiring_soon_at(&self, token: Option<&str>, now: DateTime<Utc>) -> bool {
        self.expires_within_at(token, self.expiring_soon, now)
    }

    /// Whether the token expires before `now + window`. Missing and
    /// malformed tokens always do.
    pub fn expires_within_at(
        &self,
        token: Option<&str>,
        window: Duration,
        now: DateTime<Utc>,
    ) -> bool {
        match token.and_then(decode_expiry) {
            // A window reaching past the representable range covers every token
            Some(expires_at) => now
                .checked_add_signed(window)
                .is_none_or(|deadline| expires_at < deadline),
            None => true,
        }
    }

    /// Whole minutes left before the token expires, 0 when expired or unreadable
    pub fn minutes_until_expiry(&self, token: Option<&str>) -> u64 {
        self.minutes_until_expiry_at(token, Utc::now())
    }

    /// [`minutes_until_expiry`](Self::minutes_until_expiry) against a fixed clock
    pub fn minutes_until_expiry_at(&self, token: Option<&str>, now: DateTime<Utc>) -> u64 {
        token
            .and_then(decode_expiry)
            .map(|expires_at| (expires_at - now).num_seconds())
            .filter(|secs| *secs > 0)
            .map_or(0, |secs| (secs / 60) as u64)
    }
}
