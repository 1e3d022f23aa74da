//! Settings for the pool and the session gate.
//!
//! Both halves can be built by hand, starting from `Default` and adjusted with the
//! `with_*` setters, or read from the process environment with [`Config::from_env`].
//!
//! | Variable | Setting | Default |
//! |----------|---------|---------|
//! | `MONGODB_URI` | [`PoolConfig::uri`] | required |
//! | `MONGODB_GLOBAL` | [`PoolConfig::default_tenant`] | `control-plane` |
//! | `NEXTAUTH_SECRET` | [`AuthConfig::secret`] | unset |
//! | `TENEMENT_CONNECT_TIMEOUT_SECS` | [`PoolConfig::connect_timeout`] | 10 |
//! | `TENEMENT_IDLE_TIMEOUT_SECS` | [`PoolConfig::idle_timeout`] | 300 |
//! | `TENEMENT_SWEEP_INTERVAL_SECS` | [`PoolConfig::sweep_interval`] | 120 |
//! | `TENEMENT_SHUTDOWN_TIMEOUT_SECS` | [`PoolConfig::shutdown_timeout`] | 30 |

use std::fmt;
use std::time::Duration;

use thiserror::Error;

use crate::pool::ConnectionOptions;

const DEFAULT_TENANT: &str = "control-plane";
const SESSION_COOKIE: &str = "authjs.session-token";

/// Error building a configuration.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[non_exhaustive]
pub enum ConfigError {
    /// No connection string was provided.
    #[error("MONGODB_URI must be set")]
    MissingUri,

    /// A setting has a value which can't be used.
    #[error("invalid value for {key}: {value:?}")]
    Invalid {
        /// The setting.
        key: &'static str,

        /// The rejected value.
        value: String,
    },
}

/// Configuration for a [`TenantPool`](crate::TenantPool).
#[derive(Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub struct PoolConfig {
    /// Connection string for the document store, shared by every tenant.
    pub uri: String,

    /// Tenant used when a request names none.
    pub default_tenant: String,

    /// Options passed through to the store driver.
    pub options: ConnectionOptions,

    /// How long creating a connection may take before the attempt fails.
    pub connect_timeout: Duration,

    /// How long an unused connection stays open.
    pub idle_timeout: Duration,

    /// How often idle connections are looked for.
    pub sweep_interval: Duration,

    /// How long shutdown waits for connections to close.
    pub shutdown_timeout: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            uri: String::new(),
            default_tenant: DEFAULT_TENANT.to_owned(),
            options: ConnectionOptions::default(),
            connect_timeout: Duration::from_secs(10),
            idle_timeout: Duration::from_secs(5 * 60),
            sweep_interval: Duration::from_secs(2 * 60),
            shutdown_timeout: Duration::from_secs(30),
        }
    }
}

impl PoolConfig {
    /// Default configuration for the store at `uri`.
    pub fn new(uri: impl Into<String>) -> Self {
        Self {
            uri: uri.into(),
            ..Default::default()
        }
    }

    /// Set the default tenant.
    pub fn with_default_tenant(mut self, tenant: impl Into<String>) -> Self {
        self.default_tenant = tenant.into();
        self
    }

    /// Set the driver options.
    pub fn with_options(mut self, options: ConnectionOptions) -> Self {
        self.options = options;
        self
    }

    /// Set the connection creation timeout.
    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Set the idle timeout.
    pub fn with_idle_timeout(mut self, timeout: Duration) -> Self {
        self.idle_timeout = timeout;
        self
    }

    /// Set the interval between idle sweeps.
    pub fn with_sweep_interval(mut self, interval: Duration) -> Self {
        self.sweep_interval = interval;
        self
    }

    /// Set the shutdown timeout.
    pub fn with_shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.shutdown_timeout = timeout;
        self
    }

    /// Check that the configuration can be used.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.uri.trim().is_empty() {
            return Err(ConfigError::MissingUri);
        }

        if self.default_tenant.trim().is_empty() {
            return Err(ConfigError::Invalid {
                key: "default_tenant",
                value: self.default_tenant.clone(),
            });
        }

        for (key, value) in [
            ("connect_timeout", self.connect_timeout),
            ("sweep_interval", self.sweep_interval),
        ] {
            if value.is_zero() {
                return Err(ConfigError::Invalid {
                    key,
                    value: format!("{value:?}"),
                });
            }
        }

        Ok(())
    }
}

/// Configuration for verifying session tokens.
#[derive(Clone, PartialEq, Eq)]
#[non_exhaustive]
pub struct AuthConfig {
    /// Secret the session tokens are signed with. Requests are denied while unset.
    pub secret: Option<String>,

    /// Salt the session tokens are derived with.
    pub salt: String,

    /// Name of the cookie carrying the session token.
    pub cookie_name: String,
}

impl fmt::Debug for AuthConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AuthConfig")
            .field("secret", &self.secret.as_ref().map(|_| "<redacted>"))
            .field("salt", &self.salt)
            .field("cookie_name", &self.cookie_name)
            .finish()
    }
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            secret: None,
            salt: SESSION_COOKIE.to_owned(),
            cookie_name: SESSION_COOKIE.to_owned(),
        }
    }
}

impl AuthConfig {
    /// Default configuration signed with `secret`.
    pub fn new(secret: impl Into<String>) -> Self {
        Self {
            secret: Some(secret.into()),
            ..Default::default()
        }
    }

    /// Set the token salt.
    pub fn with_salt(mut self, salt: impl Into<String>) -> Self {
        self.salt = salt.into();
        self
    }

    /// Set the session cookie name.
    pub fn with_cookie_name(mut self, name: impl Into<String>) -> Self {
        self.cookie_name = name.into();
        self
    }

    /// The signing secret, if one is set and not blank.
    pub fn secret(&self) -> Option<&str> {
        self.secret.as_deref().filter(|secret| !secret.is_empty())
    }
}

/// Complete configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
#[non_exhaustive]
pub struct Config {
    /// Pool settings.
    pub pool: PoolConfig,

    /// Session settings.
    pub auth: AuthConfig,
}

impl Config {
    /// Read the configuration from the process environment, after loading a `.env`
    /// file if there is one.
    pub fn from_env() -> Result<Self, ConfigError> {
        dotenvy::dotenv().ok();
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Read the configuration from `lookup`, which maps variable names to values.
    pub fn from_lookup<L>(lookup: L) -> Result<Self, ConfigError>
    where
        L: Fn(&str) -> Option<String>,
    {
        let read = |key: &str| lookup(key).filter(|value| !value.trim().is_empty());

        let uri = read("MONGODB_URI").ok_or(ConfigError::MissingUri)?;
        let mut pool = PoolConfig::new(uri);

        if let Some(tenant) = read("MONGODB_GLOBAL") {
            pool.default_tenant = tenant;
        }

        if let Some(timeout) = seconds(&read, "TENEMENT_CONNECT_TIMEOUT_SECS")? {
            pool.connect_timeout = timeout;
        }
        if let Some(timeout) = seconds(&read, "TENEMENT_IDLE_TIMEOUT_SECS")? {
            pool.idle_timeout = timeout;
        }
        if let Some(interval) = seconds(&read, "TENEMENT_SWEEP_INTERVAL_SECS")? {
            pool.sweep_interval = interval;
        }
        if let Some(timeout) = seconds(&read, "TENEMENT_SHUTDOWN_TIMEOUT_SECS")? {
            pool.shutdown_timeout = timeout;
        }

        pool.validate()?;

        let auth = AuthConfig {
            secret: read("NEXTAUTH_SECRET"),
            ..Default::default()
        };

        if auth.secret.is_none() {
            tracing::warn!("NEXTAUTH_SECRET is not set, every session will be denied");
        }

        Ok(Config { pool, auth })
    }
}

fn seconds<R>(read: &R, key: &'static str) -> Result<Option<Duration>, ConfigError>
where
    R: Fn(&str) -> Option<String>,
{
    read(key)
        .map(|value| {
            value
                .trim()
                .parse::<u64>()
                .map(Duration::from_secs)
                .map_err(|_| ConfigError::Invalid { key, value })
        })
        .transpose()
}
