//! Service configuration
//!
//! All settings come from `SHOP_SYNC_*` environment variables; CLI flags
//! override the few that operators change per invocation. Secrets are held
//! here but never logged: the `Debug` impls redact them.
//!
//! | Variable | Default |
//! |----------|---------|
//! | `SHOP_SYNC_WEBHOOK_SECRET` | none (webhooks answer 500 until set) |
//! | `SHOP_SYNC_WEBHOOK_URL` | none (sign the body only) |
//! | `SHOP_SYNC_SIGNATURE_HEADER` | `x-square-hmacsha256-signature` |
//! | `SHOP_SYNC_PROVIDER_BASE_URL` | `https://connect.squareup.com` |
//! | `SHOP_SYNC_PROVIDER_TOKEN` | none (required for sweeps) |
//! | `SHOP_SYNC_LOCATION_ID` | none |
//! | `SHOP_SYNC_PAGE_SIZE` | `100` |
//! | `SHOP_SYNC_PAGE_TIMEOUT_SECS` | `30` |
//! | `SHOP_SYNC_MAX_RETRIES` | `3` |
//! | `SHOP_SYNC_LOOKBACK_DAYS` | `7` |
//! | `SHOP_SYNC_LOOKAHEAD_DAYS` | `30` |
//! | `SHOP_SYNC_LOCK_TTL_SECS` | `7200` |
//! | `SHOP_SYNC_DATA_DIR` | `./data` |
//! | `SHOP_SYNC_BIND` | `127.0.0.1:3001` |

use std::fmt;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use url::Url;

use crate::error::ConfigError;
use crate::sweep::RetryPolicy;

/// Default header carrying the webhook signature
pub const DEFAULT_SIGNATURE_HEADER: &str = "x-square-hmacsha256-signature";

/// Default provider API root
pub const DEFAULT_PROVIDER_BASE_URL: &str = "https://connect.squareup.com";

/// Webhook receiver settings
#[derive(Clone)]
pub struct WebhookConfig {
    /// Shared signing secret; `None` makes every delivery fail with 500
    pub secret: Option<String>,
    /// Public URL the provider posts to, prepended to the body when signing
    pub notification_url: Option<String>,
    /// Header name holding the signature
    pub signature_header: String,
    /// How long delivered event ids are remembered
    pub dedupe_ttl: Duration,
    /// Maximum remembered event ids
    pub dedupe_capacity: usize,
}

impl Default for WebhookConfig {
    fn default() -> Self {
        Self {
            secret: None,
            notification_url: None,
            signature_header: DEFAULT_SIGNATURE_HEADER.to_string(),
            dedupe_ttl: Duration::from_secs(24 * 60 * 60),
            dedupe_capacity: 10_000,
        }
    }
}

impl fmt::Debug for WebhookConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WebhookConfig")
            .field("secret", &self.secret.as_ref().map(|_| "<redacted>"))
            .field("notification_url", &self.notification_url)
            .field("signature_header", &self.signature_header)
            .field("dedupe_ttl", &self.dedupe_ttl)
            .field("dedupe_capacity", &self.dedupe_capacity)
            .finish()
    }
}

/// Provider API client settings
#[derive(Clone)]
pub struct ProviderConfig {
    /// API root, e.g. `https://connect.squareup.com`
    pub base_url: Url,
    /// Bearer token
    pub access_token: Option<String>,
    /// Location bookings are listed for
    pub location_id: Option<String>,
    /// Bookings requested per page
    pub page_size: u32,
    /// Timeout for a single request attempt
    pub request_timeout: Duration,
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self {
            base_url: Url::parse(DEFAULT_PROVIDER_BASE_URL).expect("default base URL is valid"),
            access_token: None,
            location_id: None,
            page_size: 100,
            request_timeout: Duration::from_secs(30),
        }
    }
}

impl fmt::Debug for ProviderConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProviderConfig")
            .field("base_url", &self.base_url.as_str())
            .field("access_token", &self.access_token.as_ref().map(|_| "<redacted>"))
            .field("location_id", &self.location_id)
            .field("page_size", &self.page_size)
            .field("request_timeout", &self.request_timeout)
            .finish()
    }
}

/// Reconciliation sweep settings
#[derive(Debug, Clone)]
pub struct SweepConfig {
    /// How far before the last successful run a default window starts
    pub lookback: chrono::Duration,
    /// How far past now a default window ends
    pub lookahead: chrono::Duration,
    /// Bound on page fetch retries
    pub retry: RetryPolicy,
    /// Per-attempt timeout on provider calls
    pub page_timeout: Duration,
    /// Age after which a held lock is considered abandoned
    pub lock_ttl: Duration,
}

impl Default for SweepConfig {
    fn default() -> Self {
        Self {
            lookback: chrono::Duration::days(7),
            lookahead: chrono::Duration::days(30),
            retry: RetryPolicy::default(),
            page_timeout: Duration::from_secs(30),
            lock_ttl: Duration::from_secs(2 * 60 * 60),
        }
    }
}

/// Complete service configuration
#[derive(Debug, Clone)]
pub struct SyncConfig {
    /// Webhook receiver
    pub webhook: WebhookConfig,
    /// Provider API
    pub provider: ProviderConfig,
    /// Sweep behavior
    pub sweep: SweepConfig,
    /// Directory for sync state, audit log and datastore snapshot
    pub data_dir: PathBuf,
    /// HTTP listen address
    pub bind_addr: SocketAddr,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            webhook: WebhookConfig::default(),
            provider: ProviderConfig::default(),
            sweep: SweepConfig::default(),
            data_dir: PathBuf::from("./data"),
            bind_addr: SocketAddr::from(([127, 0, 0, 1], 3001)),
        }
    }
}

impl SyncConfig {
    /// Load configuration from the process environment
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load configuration through an arbitrary variable lookup
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());
        let mut config = Self::default();

        config.webhook.secret = get("SHOP_SYNC_WEBHOOK_SECRET");
        config.webhook.notification_url = get("SHOP_SYNC_WEBHOOK_URL");
        if let Some(header) = get("SHOP_SYNC_SIGNATURE_HEADER") {
            config.webhook.signature_header = header.to_ascii_lowercase();
        }

        if let Some(base) = get("SHOP_SYNC_PROVIDER_BASE_URL") {
            config.provider.base_url =
                Url::parse(&base).map_err(|e| ConfigError::Invalid {
                    name: "SHOP_SYNC_PROVIDER_BASE_URL",
                    message: e.to_string(),
                })?;
        }
        config.provider.access_token = get("SHOP_SYNC_PROVIDER_TOKEN");
        config.provider.location_id = get("SHOP_SYNC_LOCATION_ID");
        if let Some(size) = parse_var::<u32>(&get, "SHOP_SYNC_PAGE_SIZE")? {
            if size == 0 {
                return Err(ConfigError::Invalid {
                    name: "SHOP_SYNC_PAGE_SIZE",
                    message: "must be greater than zero".to_string(),
                });
            }
            config.provider.page_size = size;
        }
        if let Some(secs) = parse_var::<u64>(&get, "SHOP_SYNC_PAGE_TIMEOUT_SECS")? {
            config.provider.request_timeout = Duration::from_secs(secs);
            config.sweep.page_timeout = Duration::from_secs(secs);
        }

        if let Some(retries) = parse_var::<u32>(&get, "SHOP_SYNC_MAX_RETRIES")? {
            config.sweep.retry.max_retries = retries;
        }
        if let Some(days) = parse_var::<i64>(&get, "SHOP_SYNC_LOOKBACK_DAYS")? {
            config.sweep.lookback = chrono::Duration::days(days);
        }
        if let Some(days) = parse_var::<i64>(&get, "SHOP_SYNC_LOOKAHEAD_DAYS")? {
            config.sweep.lookahead = chrono::Duration::days(days);
        }
        if let Some(secs) = parse_var::<u64>(&get, "SHOP_SYNC_LOCK_TTL_SECS")? {
            config.sweep.lock_ttl = Duration::from_secs(secs);
        }

        if let Some(dir) = get("SHOP_SYNC_DATA_DIR") {
            config.data_dir = PathBuf::from(dir);
        }
        if let Some(addr) = parse_var::<SocketAddr>(&get, "SHOP_SYNC_BIND")? {
            config.bind_addr = addr;
        }

        Ok(config)
    }

    /// Configuration for tests: fixed secret, no retry delays worth waiting for
    pub fn test_config() -> Self {
        let mut config = Self::default();
        config.webhook.secret = Some("test-signing-secret".to_string());
        config.provider.access_token = Some("test-token".to_string());
        config.sweep.retry = RetryPolicy {
            max_retries: 3,
            initial_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(5),
            backoff_multiplier: 2.0,
            jitter: false,
        };
        config.sweep.page_timeout = Duration::from_secs(5);
        config
    }

    /// Sync state directory
    pub fn state_dir(&self) -> PathBuf {
        self.data_dir.join("sync")
    }

    /// Audit log file
    pub fn audit_path(&self) -> PathBuf {
        self.data_dir.join("audit.jsonl")
    }

    /// Datastore snapshot file
    pub fn store_path(&self) -> PathBuf {
        self.data_dir.join("store.json")
    }
}

fn parse_var<T>(
    get: &impl Fn(&str) -> Option<String>,
    name: &'static str,
) -> Result<Option<T>, ConfigError>
where
    T: FromStr,
    T::Err: fmt::Display,
{
    get(name)
        .map(|raw| {
            raw.trim().parse::<T>().map_err(|e| ConfigError::Invalid {
                name,
                message: e.to_string(),
            })
        })
        .transpose()
}
