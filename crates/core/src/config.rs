//! Configuration for session-aware clients

use std::path::{Path, PathBuf};
use std::time::Duration;

use directories::ProjectDirs;
use serde::{Deserialize, Serialize};

use crate::token::{DEFAULT_EXPIRED_MARGIN_SECS, DEFAULT_EXPIRING_SOON_SECS};
use crate::{CoreError, CoreResult};

/// Environment variable prefix, e.g. `LECTERN_API__BASE_URL`
pub const ENV_PREFIX: &str = "LECTERN";

/// Upper bound for every expiry window and the check interval, 30 days
pub const MAX_EXPIRY_WINDOW_SECS: i64 = 30 * 24 * 60 * 60;

/// Main client configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Backend API configuration
    pub api: ApiConfig,

    /// Auth endpoint paths, relative to the base URL
    pub endpoints: EndpointConfig,

    /// Token expiry thresholds
    pub expiry: ExpiryConfig,

    /// User-facing notification behaviour
    pub notifications: NotificationConfig,

    /// Durable storage location
    pub storage: StorageConfig,
}

/// Backend API configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ApiConfig {
    pub base_url: String,

    /// Per-request timeout in seconds
    pub timeout_secs: u64,

    pub user_agent: String,
}

/// Auth endpoint paths
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EndpointConfig {
    pub login: String,
    pub signup: String,
    pub refresh: String,
    pub logout: String,
    pub current_user: String,
}

/// Token expiry thresholds, in seconds
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExpiryConfig {
    /// Tokens this close to expiry count as expired
    pub expired_margin_secs: i64,

    /// Tokens this close to expiry are refreshed ahead of time
    pub expiring_soon_secs: i64,

    /// Tokens this close to expiry trigger a one-time warning
    pub warning_secs: i64,

    /// How often the expiry notifier checks the session
    pub check_interval_secs: u64,
}

/// User-facing notification behaviour
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct NotificationConfig {
    /// Identical messages inside this window are shown once
    pub dedup_window_ms: u64,
}

/// Durable storage location
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Directory holding the session file; platform data dir when unset
    pub dir: Option<PathBuf>,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:8000/api".to_string(),
            timeout_secs: 30,
            user_agent: concat!("lectern-client/", env!("CARGO_PKG_VERSION")).to_string(),
        }
    }
}

impl Default for EndpointConfig {
    fn default() -> Self {
        Self {
            login: "/login".to_string(),
            signup: "/signup".to_string(),
            refresh: "/refresh-token".to_string(),
            logout: "/logout".to_string(),
            current_user: "/current-user".to_string(),
        }
    }
}

impl Default for ExpiryConfig {
    fn default() -> Self {
        Self {
            expired_margin_secs: DEFAULT_EXPIRED_MARGIN_SECS,
            expiring_soon_secs: DEFAULT_EXPIRING_SOON_SECS,
            warning_secs: 15 * 60,
            check_interval_secs: 4 * 60,
        }
    }
}

impl Default for NotificationConfig {
    fn default() -> Self {
        Self {
            dedup_window_ms: 3_000,
        }
    }
}

impl ApiConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

impl ExpiryConfig {
    pub fn warning_window(&self) -> chrono::Duration {
        crate::token::seconds_saturating(self.warning_secs)
    }

    pub fn check_interval(&self) -> Duration {
        Duration::from_secs(self.check_interval_secs)
    }
}

impl NotificationConfig {
    pub fn dedup_window(&self) -> Duration {
        Duration::from_millis(self.dedup_window_ms)
    }
}

impl StorageConfig {
    /// Resolve the storage directory, falling back to the platform data dir
    pub fn resolve_dir(&self) -> PathBuf {
        if let Some(dir) = &self.dir {
            return dir.clone();
        }

        ProjectDirs::from("org", "Lectern", "lectern")
            .map(|dirs| dirs.data_dir().to_path_buf())
            .unwrap_or_else(|| PathBuf::from("./.lectern"))
    }
}

impl SessionConfig {
    /// Load configuration from a file, overridden by environment variables
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read, parsed or validated
    pub fn from_file<P: AsRef<Path>>(path: P) -> CoreResult<Self> {
        let settings = ::config::Config::builder()
            .add_source(::config::File::from(path.as_ref()))
            .add_source(Self::environment())
            .build()?;

        let config: Self = settings.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from defaults and environment variables
    ///
    /// # Errors
    ///
    /// Returns an error if environment variables cannot be parsed or the
    /// result fails validation
    pub fn from_env() -> CoreResult<Self> {
        let settings = ::config::Config::builder()
            .add_source(Self::environment())
            .build()?;

        let config: Self = settings.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Load from `path` when given, otherwise from the environment alone
    pub fn load(path: Option<&Path>) -> CoreResult<Self> {
        match path {
            Some(path) => Self::from_file(path),
            None => Self::from_env(),
        }
    }

    fn environment() -> ::config::Environment {
        ::config::Environment::with_prefix(ENV_PREFIX)
            .separator("__")
            .try_parsing(true)
    }

    /// Check that the configuration is usable
    pub fn validate(&self) -> CoreResult<()> {
        if self.api.base_url.trim().is_empty() {
            return Err(CoreError::invalid_config("api.base_url must not be empty"));
        }

        let expiry = &self.expiry;
        if expiry.expired_margin_secs < 0 {
            return Err(CoreError::invalid_config(
                "expiry.expired_margin_secs must not be negative",
            ));
        }
        if expiry.expired_margin_secs > expiry.warning_secs
            || expiry.warning_secs > expiry.expiring_soon_secs
        {
            return Err(CoreError::invalid_config(
                "expiry margins must satisfy expired_margin <= warning <= expiring_soon",
            ));
        }
        if expiry.expiring_soon_secs > MAX_EXPIRY_WINDOW_SECS {
            return Err(CoreError::invalid_config(format!(
                "expiry.expiring_soon_secs must not exceed {MAX_EXPIRY_WINDOW_SECS}"
            )));
        }
        if expiry.check_interval_secs > MAX_EXPIRY_WINDOW_SECS as u64 {
            return Err(CoreError::invalid_config(format!(
                "expiry.check_interval_secs must not exceed {MAX_EXPIRY_WINDOW_SECS}"
            )));
        }
        if expiry.check_interval_secs == 0 {
            return Err(CoreError::invalid_config(
                "expiry.check_interval_secs must be greater than zero",
            ));
        }

        for (name, path) in [
            ("login", &self.endpoints.login),
            ("signup", &self.endpoints.signup),
            ("refresh", &self.endpoints.refresh),
            ("logout", &self.endpoints.logout),
            ("current_user", &self.endpoints.current_user),
        ] {
            if !path.starts_with('/') {
                return Err(CoreError::invalid_config(format!(
                    "endpoints.{name} must start with '/'"
                )));
            }
        }

        Ok(())
    }
}
