use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use mandi_adapters::{DataGovConfig, DataGovSource, DEFAULT_API_URL};
use mandi_storage::{BackoffPolicy, HttpClientConfig, HttpFetcher, LockOptions};
use reqwest::Url;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("{var}={value:?} is invalid: {reason}")]
    Invalid {
        var: &'static str,
        value: String,
        reason: String,
    },
    #[error("{var} must be set")]
    Missing { var: &'static str },
    #[error("building http client: {0}")]
    HttpClient(String),
}

#[derive(Debug, Clone)]
pub struct SyncConfig {
    pub archive_dir: PathBuf,
    pub api_url: String,
    pub api_key: Option<String>,
    pub page_size: usize,
    pub max_pages: usize,
    pub http_timeout: Duration,
    pub backoff: BackoffPolicy,
    pub lock: LockOptions,
    /// Days re-fetched before the end of the last successful window.
    pub lookback_days: u64,
    /// Fraction of fetched rows that may be rejected before the run aborts.
    pub max_reject_ratio: f64,
    /// Rows normalized, merged and staged per pass; bounds run memory.
    pub batch_rows: usize,
    pub parquet_mirror: bool,
    pub user_agent: String,
}

impl SyncConfig {
    /// Defaults for an archive at `archive_dir`.
    pub fn for_archive(archive_dir: impl Into<PathBuf>) -> Self {
        Self {
            archive_dir: archive_dir.into(),
            api_url: DEFAULT_API_URL.to_string(),
            api_key: None,
            page_size: 10_000,
            max_pages: 200,
            http_timeout: Duration::from_secs(60),
            backoff: BackoffPolicy::default(),
            lock: LockOptions::default(),
            lookback_days: 2,
            max_reject_ratio: 0.5,
            batch_rows: 100_000,
            parquet_mirror: false,
            user_agent: "mandi-archive/0.1".to_string(),
        }
    }

    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Builds the config from any variable lookup; `from_env` passes the
    /// process environment.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let get = |names: &[&'static str]| -> Option<(&'static str, String)> {
            names.iter().find_map(|name| {
                lookup(*name)
                    .map(|v| v.trim().to_string())
                    .filter(|v| !v.is_empty())
                    .map(|v| (*name, v))
            })
        };

        let mut config = Self::for_archive(
            get(&["MANDI_ARCHIVE_DIR", "DATA_DIR"])
                .map(|(_, v)| PathBuf::from(v))
                .unwrap_or_else(|| PathBuf::from("./data/commodity-prices")),
        );

        if let Some((_, value)) = get(&["MANDI_API_URL"]) {
            config.api_url = value;
            config.parsed_api_url()?;
        }
        config.api_key = get(&["MANDI_API_KEY", "API_KEY"]).map(|(_, v)| v);

        if let Some(v) = parsed::<usize>(get(&["MANDI_PAGE_SIZE"]))? {
            config.page_size = positive("MANDI_PAGE_SIZE", v)?;
        }
        if let Some(v) = parsed::<usize>(get(&["MANDI_MAX_PAGES"]))? {
            config.max_pages = positive("MANDI_MAX_PAGES", v)?;
        }
        if let Some(v) = parsed::<u64>(get(&["MANDI_HTTP_TIMEOUT_SECS"]))? {
            config.http_timeout = Duration::from_secs(positive("MANDI_HTTP_TIMEOUT_SECS", v)?);
        }
        if let Some(v) = parsed::<usize>(get(&["MANDI_MAX_RETRIES"]))? {
            config.backoff.max_retries = v;
        }
        if let Some(v) = parsed::<u64>(get(&["MANDI_RETRY_BASE_MS"]))? {
            config.backoff.base_delay = Duration::from_millis(v);
        }
        if let Some(v) = parsed::<u64>(get(&["MANDI_RETRY_MAX_MS"]))? {
            config.backoff.max_delay = Duration::from_millis(v);
        }
        if let Some(v) = parsed::<u64>(get(&["MANDI_LOCK_TIMEOUT_SECS"]))? {
            config.lock.timeout = Duration::from_secs(v);
        }
        if let Some(v) = parsed::<u64>(get(&["MANDI_LOCK_STALE_SECS"]))? {
            config.lock.stale_after = Duration::from_secs(positive("MANDI_LOCK_STALE_SECS", v)?);
        }
        if let Some(v) = parsed::<u64>(get(&["MANDI_LOOKBACK_DAYS"]))? {
            config.lookback_days = v;
        }
        if let Some(v) = parsed::<f64>(get(&["MANDI_MAX_REJECT_RATIO"]))? {
            if !(0.0..=1.0).contains(&v) {
                return Err(ConfigError::Invalid {
                    var: "MANDI_MAX_REJECT_RATIO",
                    value: v.to_string(),
                    reason: "must be between 0 and 1".to_string(),
                });
            }
            config.max_reject_ratio = v;
        }
        if let Some(v) = parsed::<usize>(get(&["MANDI_BATCH_ROWS"]))? {
            config.batch_rows = positive("MANDI_BATCH_ROWS", v)?;
        }
        if let Some((var, value)) = get(&["MANDI_PARQUET_MIRROR"]) {
            config.parquet_mirror = parse_flag(var, &value)?;
        }
        if let Some((_, value)) = get(&["MANDI_USER_AGENT"]) {
            config.user_agent = value;
        }

        if config.backoff.base_delay > config.backoff.max_delay {
            return Err(ConfigError::Invalid {
                var: "MANDI_RETRY_BASE_MS",
                value: config.backoff.base_delay.as_millis().to_string(),
                reason: "exceeds MANDI_RETRY_MAX_MS".to_string(),
            });
        }
        Ok(config)
    }

    pub fn parsed_api_url(&self) -> Result<Url, ConfigError> {
        Url::parse(&self.api_url).map_err(|e| ConfigError::Invalid {
            var: "MANDI_API_URL",
            value: self.api_url.clone(),
            reason: e.to_string(),
        })
    }

    pub fn http_client_config(&self) -> HttpClientConfig {
        HttpClientConfig {
            timeout: self.http_timeout,
            user_agent: Some(self.user_agent.clone()),
            backoff: self.backoff,
        }
    }

    /// The upstream API source; requires an API key.
    pub fn data_gov_source(&self) -> Result<DataGovSource, ConfigError> {
        let api_key = self
            .api_key
            .clone()
            .ok_or(ConfigError::Missing { var: "MANDI_API_KEY" })?;
        let http = HttpFetcher::new(self.http_client_config())
            .map_err(|e| ConfigError::HttpClient(format!("{e:#}")))?;
        Ok(DataGovSource::new(
            http,
            DataGovConfig {
                api_url: self.parsed_api_url()?,
                api_key,
                page_size: self.page_size,
                max_pages: self.max_pages,
            },
        ))
    }
}

fn parsed<T>(entry: Option<(&'static str, String)>) -> Result<Option<T>, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match entry {
        None => Ok(None),
        Some((var, value)) => value
            .parse::<T>()
            .map(Some)
            .map_err(|e| ConfigError::Invalid {
                var,
                value,
                reason: e.to_string(),
            }),
    }
}

fn positive<T: PartialEq + Default + ToString>(var: &'static str, value: T) -> Result<T, ConfigError> {
    if value == T::default() {
        return Err(ConfigError::Invalid {
            var,
            value: value.to_string(),
            reason: "must be greater than zero".to_string(),
        });
    }
    Ok(value)
}

fn parse_flag(var: &'static str, value: &str) -> Result<bool, ConfigError> {
    match value.to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(ConfigError::Invalid {
            var,
            value: value.to_string(),
            reason: "expected true or false".to_string(),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |name| map.get(name).cloned()
    }

    #[test]
    fn defaults_apply_when_unset() {
        let config = SyncConfig::from_lookup(lookup(&[])).expect("config");
        assert_eq!(config.archive_dir, PathBuf::from("./data/commodity-prices"));
        assert_eq!(config.page_size, 10_000);
        assert_eq!(config.batch_rows, 100_000);
        assert_eq!(config.lock.timeout, Duration::ZERO);
        assert_eq!(config.lock.stale_after, Duration::from_secs(21_600));
        assert!(config.api_key.is_none());
        assert!(!config.parquet_mirror);
        assert_eq!(config.api_url, DEFAULT_API_URL);
    }

    #[test]
    fn legacy_aliases_are_honoured() {
        let config =
            SyncConfig::from_lookup(lookup(&[("DATA_DIR", "/srv/mandi"), ("API_KEY", "abc")]))
                .expect("config");
        assert_eq!(config.archive_dir, PathBuf::from("/srv/mandi"));
        assert_eq!(config.api_key.as_deref(), Some("abc"));

        let config = SyncConfig::from_lookup(lookup(&[
            ("DATA_DIR", "/srv/legacy"),
            ("MANDI_ARCHIVE_DIR", "/srv/mandi"),
        ]))
        .unwrap();
        assert_eq!(config.archive_dir, PathBuf::from("/srv/mandi"));
    }

    #[test]
    fn overrides_are_parsed() {
        let config = SyncConfig::from_lookup(lookup(&[
            ("MANDI_LOCK_TIMEOUT_SECS", "30"),
            ("MANDI_MAX_RETRIES", "0"),
            ("MANDI_MAX_REJECT_RATIO", "0.1"),
            ("MANDI_PARQUET_MIRROR", "yes"),
            ("MANDI_RETRY_BASE_MS", "250"),
            ("MANDI_BATCH_ROWS", "5000"),
        ]))
        .unwrap();
        assert_eq!(config.lock.timeout, Duration::from_secs(30));
        assert_eq!(config.backoff.max_retries, 0);
        assert_eq!(config.backoff.base_delay, Duration::from_millis(250));
        assert!((config.max_reject_ratio - 0.1).abs() < f64::EPSILON);
        assert!(config.parquet_mirror);
        assert_eq!(config.batch_rows, 5000);
    }

    #[test]
    fn invalid_values_are_errors_not_defaults() {
        for vars in [
            [("MANDI_PAGE_SIZE", "lots")],
            [("MANDI_PAGE_SIZE", "0")],
            [("MANDI_BATCH_ROWS", "0")],
            [("MANDI_MAX_REJECT_RATIO", "1.5")],
            [("MANDI_PARQUET_MIRROR", "maybe")],
            [("MANDI_API_URL", "not a url")],
        ] {
            let err = SyncConfig::from_lookup(lookup(&vars)).unwrap_err();
            assert!(matches!(err, ConfigError::Invalid { .. }), "{vars:?}: {err}");
        }
    }

    #[test]
    fn api_source_requires_key() {
        let config = SyncConfig::for_archive("/tmp/mandi");
        assert!(matches!(
            config.data_gov_source(),
            Err(ConfigError::Missing { var: "MANDI_API_KEY" })
        ));
    }
}
