// Client configuration: credentials, API version, restriction policy and
// transport limits. Plain structs with `Default`, optionally read from the
// environment.

use b24_core::{ApiVersion, B24Error, RestrictionPolicy, MAX_BATCH_SIZE};
use std::time::Duration;
use url::Url;

pub const ENV_WEBHOOK_URL: &str = "B24_WEBHOOK_URL";
pub const ENV_API_VERSION: &str = "B24_API_VERSION";
pub const ENV_POLICY: &str = "B24_POLICY";
pub const ENV_MAX_BATCH_SIZE: &str = "B24_MAX_BATCH_SIZE";
pub const ENV_TIMEOUT_MS: &str = "B24_TIMEOUT_MS";

/// How requests are authorized
#[derive(Clone, PartialEq, Eq)]
pub enum Credentials {
    /// `https://portal/rest/{user}/{secret}/`; the secret lives in the URL
    Webhook { url: Url },
    /// Embedded application: `auth=<token>` is added to every call
    Application { rest_url: Url, access_token: String },
}

impl Credentials {
    pub fn webhook(url: &str) -> Result<Self, B24Error> {
        Ok(Credentials::Webhook {
            url: parse_base(url)?,
        })
    }

    pub fn application(rest_url: &str, access_token: impl Into<String>) -> Result<Self, B24Error> {
        Ok(Credentials::Application {
            rest_url: parse_base(rest_url)?,
            access_token: access_token.into(),
        })
    }

    /// REST base URL, always ending with '/'
    pub fn base_url(&self) -> &str {
        match self {
            Credentials::Webhook { url } => url.as_str(),
            Credentials::Application { rest_url, .. } => rest_url.as_str(),
        }
    }

    pub fn access_token(&self) -> Option<&str> {
        match self {
            Credentials::Webhook { .. } => None,
            Credentials::Application { access_token, .. } => Some(access_token),
        }
    }
}

// webhook secrets and tokens must not end up in logs
impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Credentials::Webhook { url } => f
                .debug_struct("Webhook")
                .field("host", &url.host_str())
                .finish_non_exhaustive(),
            Credentials::Application { rest_url, .. } => f
                .debug_struct("Application")
                .field("rest_url", &rest_url.as_str())
                .finish_non_exhaustive(),
        }
    }
}

fn parse_base(raw: &str) -> Result<Url, B24Error> {
    let trimmed = raw.trim();
    let with_slash = if trimmed.ends_with('/') {
        trimmed.to_string()
    } else {
        format!("{}/", trimmed)
    };
    let url = Url::parse(&with_slash)
        .map_err(|e| B24Error::configuration(format!("invalid REST url '{}': {}", raw, e)))?;
    if !matches!(url.scheme(), "http" | "https") {
        return Err(B24Error::configuration(format!(
            "REST url must be http(s), got '{}'",
            url.scheme()
        )));
    }
    Ok(url)
}

/// Client configuration
#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub credentials: Credentials,
    /// Version used by `call_method`
    pub version: ApiVersion,
    pub policy: RestrictionPolicy,
    /// Commands per physical batch, at most 50
    pub max_batch_size: usize,
    /// Request timeout in milliseconds
    pub request_timeout_ms: u64,
    pub user_agent: String,
}

impl ClientConfig {
    pub fn new(credentials: Credentials) -> Self {
        Self {
            credentials,
            version: ApiVersion::default(),
            policy: RestrictionPolicy::default(),
            max_batch_size: MAX_BATCH_SIZE,
            request_timeout_ms: 30_000,
            user_agent: concat!("b24-rs/", env!("CARGO_PKG_VERSION")).to_string(),
        }
    }

    pub fn webhook(url: &str) -> Result<Self, B24Error> {
        Ok(Self::new(Credentials::webhook(url)?))
    }

    /// Read the configuration from `B24_*` environment variables
    pub fn from_env() -> Result<Self, B24Error> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub(crate) fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, B24Error> {
        let url = lookup(ENV_WEBHOOK_URL)
            .ok_or_else(|| B24Error::configuration(format!("{} is not set", ENV_WEBHOOK_URL)))?;
        let mut config = Self::webhook(&url)?;

        if let Some(version) = lookup(ENV_API_VERSION) {
            config.version = version.parse().map_err(B24Error::Configuration)?;
        }
        if let Some(policy) = lookup(ENV_POLICY) {
            config.policy = policy.parse().map_err(B24Error::Configuration)?;
        }
        if let Some(size) = lookup(ENV_MAX_BATCH_SIZE) {
            config.max_batch_size = size.parse().map_err(|_| {
                B24Error::configuration(format!("{} must be a number, got '{}'", ENV_MAX_BATCH_SIZE, size))
            })?;
        }
        if let Some(timeout) = lookup(ENV_TIMEOUT_MS) {
            config.request_timeout_ms = timeout.parse().map_err(|_| {
                B24Error::configuration(format!("{} must be a number, got '{}'", ENV_TIMEOUT_MS, timeout))
            })?;
        }

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), B24Error> {
        if self.max_batch_size == 0 || self.max_batch_size > MAX_BATCH_SIZE {
            return Err(B24Error::configuration(format!(
                "max_batch_size must be within 1..={}, got {}",
                MAX_BATCH_SIZE, self.max_batch_size
            )));
        }
        self.policy.validate().map_err(B24Error::Configuration)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }
}
