//! Registry configuration.

use std::{borrow::Cow, fmt, str::FromStr, time::Duration};

use serde::{Deserialize, Serialize};
use percent_encoding::percent_decode_str;
use thiserror::Error;
use url::Url;

/// Shared store URL.
pub const ENV_URL: &str = "SESSION_REGISTRY_URL";
/// Shared store password.
pub const ENV_PASSWORD: &str = "SESSION_REGISTRY_PASSWORD";
/// Record lifetime in seconds.
pub const ENV_TTL: &str = "SESSION_REGISTRY_TTL";
/// Key prefix in the shared store.
pub const ENV_NAMESPACE: &str = "SESSION_REGISTRY_NAMESPACE";
/// Per-operation debug tracing.
pub const ENV_DEBUG: &str = "SESSION_REGISTRY_DEBUG";
/// Refuse to start without a shared store.
pub const ENV_STRICT: &str = "SESSION_REGISTRY_STRICT";
/// Shared store round-trip bound in milliseconds.
pub const ENV_TIMEOUT_MS: &str = "SESSION_REGISTRY_TIMEOUT_MS";
/// Delay between dial attempts after a failure, in milliseconds.
pub const ENV_COOLDOWN_MS: &str = "SESSION_REGISTRY_COOLDOWN_MS";
/// Age in seconds after which a local copy is refreshed.
pub const ENV_REFRESH_SECS: &str = "SESSION_REGISTRY_REFRESH_SECS";

/// Longest accepted record lifetime. Keeps `SETEX` arguments and local
/// deadlines in range.
pub const MAX_TTL_SECONDS: u64 = 2_147_483_647;

const DEFAULT_PORT: u16 = 6379;

/// Configuration error. Only raised at startup.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("Shared store required but no endpoint configured")]
    MissingEndpoint,
    #[error("Invalid store endpoint {endpoint:?}: {reason}")]
    InvalidEndpoint { endpoint: String, reason: String },
    #[error("ttl_seconds must be between 1 and {}", MAX_TTL_SECONDS)]
    InvalidTtl,
    #[error("key_namespace must not be empty")]
    InvalidNamespace,
}

/// Registry configuration snapshot.
#[derive(Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RegistryConfig {
    /// Shared store URL (`redis://[user][:password@]host[:port][/db]`).
    /// Absent means local-only from process start.
    pub store_endpoint: Option<String>,
    /// Password for the shared store. Overrides one embedded in the URL.
    pub store_credential: Option<String>,
    /// Lifetime of every record written.
    pub ttl_seconds: u64,
    /// Prefix for every key written to the shared store.
    pub key_namespace: String,
    /// Per-operation debug tracing.
    pub debug_enabled: bool,
    /// Refuse to start without a shared store endpoint.
    pub require_shared_store: bool,
    /// Bound on every shared store round trip.
    pub op_timeout_ms: u64,
    /// Minimum delay between dial attempts after a failure.
    pub retry_cooldown_ms: u64,
    /// Age after which a local copy is refreshed from the shared store.
    pub refresh_after_secs: u64,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            store_endpoint: None,
            store_credential: None,
            ttl_seconds: 3600,
            key_namespace: "session_registry".to_string(),
            debug_enabled: false,
            require_shared_store: false,
            op_timeout_ms: 250,
            retry_cooldown_ms: 5_000,
            refresh_after_secs: 300,
        }
    }
}

impl fmt::Debug for RegistryConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RegistryConfig")
            .field("store_endpoint", &self.store_endpoint.as_deref().map(redact_url))
            .field(
                "store_credential",
                &self.store_credential.as_ref().map(|_| "<redacted>"),
            )
            .field("ttl_seconds", &self.ttl_seconds)
            .field("key_namespace", &self.key_namespace)
            .field("debug_enabled", &self.debug_enabled)
            .field("require_shared_store", &self.require_shared_store)
            .field("op_timeout_ms", &self.op_timeout_ms)
            .field("retry_cooldown_ms", &self.retry_cooldown_ms)
            .field("refresh_after_secs", &self.refresh_after_secs)
            .finish()
    }
}

impl RegistryConfig {
    /// Build a configuration from the process environment.
    #[must_use]
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build a configuration from an arbitrary variable lookup.
    ///
    /// Unparseable values keep their default.
    #[must_use]
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();
        let non_empty = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        Self {
            store_endpoint: non_empty(ENV_URL),
            store_credential: non_empty(ENV_PASSWORD),
            ttl_seconds: parse_or(ENV_TTL, non_empty(ENV_TTL), defaults.ttl_seconds),
            key_namespace: non_empty(ENV_NAMESPACE).unwrap_or(defaults.key_namespace),
            debug_enabled: non_empty(ENV_DEBUG).map_or(defaults.debug_enabled, |v| parse_flag(&v)),
            require_shared_store: non_empty(ENV_STRICT)
                .map_or(defaults.require_shared_store, |v| parse_flag(&v)),
            op_timeout_ms: parse_or(
                ENV_TIMEOUT_MS,
                non_empty(ENV_TIMEOUT_MS),
                defaults.op_timeout_ms,
            ),
            retry_cooldown_ms: parse_or(
                ENV_COOLDOWN_MS,
                non_empty(ENV_COOLDOWN_MS),
                defaults.retry_cooldown_ms,
            ),
            refresh_after_secs: parse_or(
                ENV_REFRESH_SECS,
                non_empty(ENV_REFRESH_SECS),
                defaults.refresh_after_secs,
            ),
        }
    }

    /// Whether a shared store endpoint is configured.
    #[must_use]
    pub fn shared_store_configured(&self) -> bool {
        self.store_endpoint.is_some()
    }

    /// Check startup invariants.
    ///
    /// # Errors
    /// Returns error if strict mode lacks an endpoint, the endpoint does not
    /// parse, the TTL is zero or above `MAX_TTL_SECONDS`, or the namespace
    /// is empty.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(1..=MAX_TTL_SECONDS).contains(&self.ttl_seconds) {
            return Err(ConfigError::InvalidTtl);
        }
        if self.key_namespace.trim().is_empty() {
            return Err(ConfigError::InvalidNamespace);
        }
        if self.require_shared_store && self.store_endpoint.is_none() {
            return Err(ConfigError::MissingEndpoint);
        }
        self.endpoint().map(|_| ())
    }

    /// Parsed endpoint with the configured credential applied.
    ///
    /// # Errors
    /// Returns error if the endpoint URL is malformed.
    pub fn endpoint(&self) -> Result<Option<StoreEndpoint>, ConfigError> {
        let Some(raw) = self.store_endpoint.as_deref() else {
            return Ok(None);
        };
        let mut endpoint: StoreEndpoint = raw.parse()?;
        if let Some(credential) = &self.store_credential {
            endpoint.password = Some(credential.clone());
        }
        Ok(Some(endpoint))
    }

    #[must_use]
    pub const fn op_timeout(&self) -> Duration {
        Duration::from_millis(self.op_timeout_ms)
    }

    #[must_use]
    pub const fn retry_cooldown(&self) -> Duration {
        Duration::from_millis(self.retry_cooldown_ms)
    }

    #[must_use]
    pub const fn refresh_after(&self) -> Duration {
        Duration::from_secs(self.refresh_after_secs)
    }

    #[must_use]
    pub const fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl_seconds)
    }
}

fn parse_or<T: FromStr + Copy + fmt::Display>(key: &str, raw: Option<String>, default: T) -> T {
    match raw {
        None => default,
        Some(value) => value.trim().parse().unwrap_or_else(|_| {
            tracing::warn!(key, value = %value, %default, "Ignoring unparseable setting");
            default
        }),
    }
}

fn parse_flag(raw: &str) -> bool {
    matches!(
        raw.trim().to_ascii_lowercase().as_str(),
        "1" | "true" | "yes" | "on"
    )
}

fn redact_url(raw: &str) -> String {
    match Url::parse(raw) {
        Ok(mut url) if url.password().is_some() => {
            let _ = url.set_password(Some("redacted"));
            url.to_string()
        }
        Ok(url) => url.to_string(),
        Err(_) => "<invalid>".to_string(),
    }
}

/// Credentials in a URL are percent-encoded; the store expects them raw.
fn decode_userinfo(raw: &str, field: &str) -> Result<String, ConfigError> {
    percent_decode_str(raw)
        .decode_utf8()
        .map(Cow::into_owned)
        .map_err(|_| ConfigError::InvalidEndpoint {
            endpoint: "<redacted>".to_string(),
            reason: format!("{field} is not valid UTF-8 once decoded"),
        })
}

/// Parsed shared store address.
#[derive(Clone, PartialEq, Eq)]
pub struct StoreEndpoint {
    pub host: String,
    pub port: u16,
    pub db: u32,
    pub username: Option<String>,
    pub password: Option<String>,
}

impl StoreEndpoint {
    /// `host:port` form for dialing.
    #[must_use]
    pub fn address(&self) -> String {
        if self.host.contains(':') {
            format!("[{}]:{}", self.host, self.port)
        } else {
            format!("{}:{}", self.host, self.port)
        }
    }
}

impl fmt::Debug for StoreEndpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StoreEndpoint")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("db", &self.db)
            .field("username", &self.username)
            .field("password", &self.password.as_ref().map(|_| "<redacted>"))
            .finish()
    }
}

impl fmt::Display for StoreEndpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "redis://{}/{}", self.address(), self.db)
    }
}

impl FromStr for StoreEndpoint {
    type Err = ConfigError;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        let invalid = |reason: &str| ConfigError::InvalidEndpoint {
            endpoint: redact_url(raw),
            reason: reason.to_string(),
        };

        let url = Url::parse(raw).map_err(|e| invalid(&e.to_string()))?;
        if url.scheme() != "redis" {
            return Err(invalid("unsupported scheme, expected redis://"));
        }
        let host = url
            .host_str()
            .filter(|h| !h.is_empty())
            .ok_or_else(|| invalid("missing host"))?
            .trim_start_matches('[')
            .trim_end_matches(']')
            .to_string();

        let db = match url.path().trim_start_matches('/') {
            "" => 0,
            path => path
                .parse()
                .map_err(|_| invalid("database must be a number"))?,
        };

        Ok(Self {
            host,
            port: url.port().unwrap_or(DEFAULT_PORT),
            db,
            username: Some(url.username())
                .filter(|u| !u.is_empty())
                .map(|u| decode_userinfo(u, "username"))
                .transpose()?,
            password: url
                .password()
                .map(|p| decode_userinfo(p, "password"))
                .transpose()?,
        })
    }
}
