//! Configuration management for the sync runtime.

use std::env;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;
use tether_engine::RetryPolicy;

/// Runtime configuration loaded from environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    /// Base URL of the remote REST endpoint
    pub remote_url: Option<String>,
    /// Directory of the durable file storage
    pub data_dir: PathBuf,
    /// Backoff and attempt limit for queue replay
    pub retry: RetryPolicy,
    /// Bound on every remote call
    pub request_timeout: Duration,
    /// Bound on one initialization sequence
    pub init_timeout: Duration,
    /// How long a connectivity change must hold before it is reported
    pub stability_window: Duration,
    /// Period of background syncs while online; `None` disables them
    pub sync_interval: Option<Duration>,
    /// Replays dispatched concurrently (always one per record)
    pub max_concurrent_replays: usize,
    /// Queue size limit; `None` means unbounded
    pub queue_capacity: Option<usize>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            remote_url: None,
            data_dir: PathBuf::from("./tether-data"),
            retry: RetryPolicy::default(),
            request_timeout: Duration::from_secs(15),
            init_timeout: Duration::from_secs(10),
            stability_window: Duration::from_secs(2),
            sync_interval: Some(Duration::from_secs(300)),
            max_concurrent_replays: 4,
            queue_capacity: None,
        }
    }
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| env::var(name).ok())
    }

    /// Load configuration from any variable source, falling back to the
    /// defaults for unset variables.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();
        let parse = |name: &'static str| parse_var::<u64, _>(&lookup, name);

        let remote_url = lookup("TETHER_REMOTE_URL").filter(|url| !url.trim().is_empty());
        let data_dir = lookup("TETHER_DATA_DIR")
            .map(PathBuf::from)
            .unwrap_or(defaults.data_dir);

        let max_attempts = match parse_var::<u32, _>(&lookup, "TETHER_MAX_ATTEMPTS")? {
            Some(0) => return Err(ConfigError::Invalid { var: "TETHER_MAX_ATTEMPTS" }),
            Some(n) => n,
            None => defaults.retry.max_attempts,
        };
        let retry = RetryPolicy::new(
            max_attempts,
            parse("TETHER_BACKOFF_BASE_MS")?
                .map(Duration::from_millis)
                .unwrap_or(defaults.retry.base_delay),
            parse("TETHER_BACKOFF_CAP_MS")?
                .map(Duration::from_millis)
                .unwrap_or(defaults.retry.max_delay),
        );

        let request_timeout = parse("TETHER_REQUEST_TIMEOUT_MS")?
            .map(Duration::from_millis)
            .unwrap_or(defaults.request_timeout);
        let init_timeout = parse("TETHER_INIT_TIMEOUT_MS")?
            .map(Duration::from_millis)
            .unwrap_or(defaults.init_timeout);
        let stability_window = parse("TETHER_STABILITY_WINDOW_MS")?
            .map(Duration::from_millis)
            .unwrap_or(defaults.stability_window);

        let sync_interval = match parse("TETHER_SYNC_INTERVAL_SECS")? {
            Some(0) => None,
            Some(secs) => Some(Duration::from_secs(secs)),
            None => defaults.sync_interval,
        };

        let max_concurrent_replays =
            match parse_var::<usize, _>(&lookup, "TETHER_MAX_CONCURRENT_REPLAYS")? {
                Some(0) => {
                    return Err(ConfigError::Invalid {
                        var: "TETHER_MAX_CONCURRENT_REPLAYS",
                    })
                }
                Some(n) => n,
                None => defaults.max_concurrent_replays,
            };

        let queue_capacity = parse_var::<usize, _>(&lookup, "TETHER_QUEUE_CAPACITY")?;

        Ok(Self {
            remote_url,
            data_dir,
            retry,
            request_timeout,
            init_timeout,
            stability_window,
            sync_interval,
            max_concurrent_replays,
            queue_capacity,
        })
    }
}

fn parse_var<T, F>(lookup: &F, name: &'static str) -> Result<Option<T>, ConfigError>
where
    T: FromStr,
    F: Fn(&str) -> Option<String>,
{
    match lookup(name) {
        None => Ok(None),
        Some(raw) if raw.trim().is_empty() => Ok(None),
        Some(raw) => raw
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| ConfigError::Invalid { var: name }),
    }
}

/// Configuration errors.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    #[error("TETHER_REMOTE_URL environment variable is required")]
    MissingRemoteUrl,

    #[error("Invalid {var} value")]
    Invalid { var: &'static str },
}
