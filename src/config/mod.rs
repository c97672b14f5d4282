//! Configuration for the metadata indexer.
//!
//! The configuration is a YAML document (default `dipdup.yml`). `${VAR}`
//! and `${VAR:-default}` references are substituted from the environment
//! before parsing, then [`Config::validate`] checks everything the
//! indexers rely on at startup.

use crate::types::models::MetadataKind;
use crate::utils::error::{MetadataIndexerError, Result};
use regex::{Captures, Regex};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;

/// Hard cap of the chain observer on `contract.in` filters.
pub const MAX_ACCOUNTS: usize = 50;

/// Configuration file used when none is given.
pub const DEFAULT_CONFIG_FILE: &str = "dipdup.yml";

fn default_ipfs_timeout() -> u64 {
    10
}

fn default_http_timeout() -> u64 {
    10
}

fn default_max_retry() -> u16 {
    3
}

fn default_index() -> Vec<String> {
    vec![
        MetadataKind::Token.as_str().to_string(),
        MetadataKind::Contract.as_str().to_string(),
    ]
}

fn default_max_cpu() -> usize {
    4
}

fn default_http_max_file_size_mb() -> u64 {
    20
}

fn default_thumbnail_max_file_size_mb() -> u64 {
    50
}

fn default_queue_capacity() -> usize {
    15
}

fn default_flush_interval() -> u64 {
    60
}

/// `metadata.settings`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Settings {
    /// IPFS gateways, tried in shuffled order (required, non-empty).
    pub ipfs_gateways: Vec<String>,
    /// IPFS nodes receiving pin requests for resolved documents.
    #[serde(default)]
    pub ipfs_pinning: Vec<String>,
    /// Seconds.
    #[serde(default = "default_ipfs_timeout")]
    pub ipfs_timeout: u64,
    /// Seconds.
    #[serde(default = "default_http_timeout")]
    pub http_timeout: u64,
    #[serde(default = "default_max_retry")]
    pub max_retry_count_on_error: u16,
    /// Metadata kinds to index: `metadata`, `token_metadata`.
    #[serde(default = "default_index")]
    pub index: Vec<String>,
    /// Worker threads of the runtime.
    #[serde(default = "default_max_cpu")]
    pub max_cpu: usize,
    #[serde(default = "default_http_max_file_size_mb")]
    pub http_max_file_size_mb: u64,
    /// Read by the external thumbnail worker.
    #[serde(default = "default_thumbnail_max_file_size_mb")]
    pub thumbnail_max_file_size_mb: u64,
    /// Disables the private network guard of the HTTP adapter.
    #[serde(default)]
    pub allow_private_networks: bool,
    /// Known hash of `sha256://` documents that need no fetch.
    #[serde(default)]
    pub sha256_expected_hash: Option<String>,
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,
    /// Seconds between timer flushes of the resolution queues.
    #[serde(default = "default_flush_interval")]
    pub flush_interval: u64,
}

impl Settings {
    /// Default settings around `ipfs_gateways`.
    #[must_use]
    pub fn new(ipfs_gateways: Vec<String>) -> Self {
        Self {
            ipfs_gateways,
            ipfs_pinning: Vec::new(),
            ipfs_timeout: default_ipfs_timeout(),
            http_timeout: default_http_timeout(),
            max_retry_count_on_error: default_max_retry(),
            index: default_index(),
            max_cpu: default_max_cpu(),
            http_max_file_size_mb: default_http_max_file_size_mb(),
            thumbnail_max_file_size_mb: default_thumbnail_max_file_size_mb(),
            allow_private_networks: false,
            sha256_expected_hash: None,
            queue_capacity: default_queue_capacity(),
            flush_interval: default_flush_interval(),
        }
    }

    /// Indexed metadata kinds; unknown names are dropped.
    #[must_use]
    pub fn kinds(&self) -> Vec<MetadataKind> {
        self.index
            .iter()
            .filter_map(|name| MetadataKind::from_name(name))
            .collect()
    }

    /// Whether `kind` is indexed.
    #[must_use]
    pub fn indexes(&self, kind: MetadataKind) -> bool {
        self.index.iter().any(|name| name == kind.as_str())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Filters {
    /// Contracts to follow; empty means every contract.
    #[serde(default)]
    pub accounts: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Datasources {
    /// Chain observer base URL.
    pub tzkt: String,
}

/// `metadata.indexers.<network>`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexerConfig {
    #[serde(default)]
    pub filters: Filters,
    pub datasources: Datasources,
}

/// `metadata`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetadataConfig {
    pub settings: Settings,
    #[serde(default)]
    pub indexers: BTreeMap<String, IndexerConfig>,
}

impl MetadataConfig {
    /// # Errors
    ///
    /// `ConfigError` naming the first offending key.
    pub fn validate(&self) -> Result<()> {
        let settings = &self.settings;
        if settings.ipfs_gateways.is_empty() {
            return Err(config_error("metadata.settings.ipfs_gateways must not be empty"));
        }
        for gateway in settings.ipfs_gateways.iter().chain(&settings.ipfs_pinning) {
            url::Url::parse(gateway)
                .map_err(|e| config_error(&format!("invalid IPFS node URL {gateway}: {e}")))?;
        }
        if settings.max_retry_count_on_error == 0 {
            return Err(config_error(
                "metadata.settings.max_retry_count_on_error must be positive",
            ));
        }
        if let Some(name) = settings
            .index
            .iter()
            .find(|name| MetadataKind::from_name(name).is_none())
        {
            return Err(config_error(&format!("unknown index {name}")));
        }
        if self.indexers.is_empty() {
            return Err(config_error("metadata.indexers must declare a network"));
        }

        for (network, indexer) in &self.indexers {
            if indexer.filters.accounts.len() > MAX_ACCOUNTS {
                return Err(config_error(&format!(
                    "{network}: at most {MAX_ACCOUNTS} accounts are allowed, got {}",
                    indexer.filters.accounts.len()
                )));
            }
            let tzkt = url::Url::parse(&indexer.datasources.tzkt).map_err(|e| {
                config_error(&format!(
                    "{network}: invalid tzkt datasource {}: {e}",
                    indexer.datasources.tzkt
                ))
            })?;
            if tzkt.cannot_be_a_base() {
                return Err(config_error(&format!(
                    "{network}: tzkt datasource must be an absolute URL"
                )));
            }
        }
        Ok(())
    }
}

/// Persistence backend selector.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DatabaseKind {
    #[default]
    Postgres,
    Elastic,
    Memory,
}

/// `database`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    pub kind: DatabaseKind,
    /// Full connection URL; takes precedence over the split fields.
    pub url: Option<String>,
    pub host: Option<String>,
    pub port: Option<u16>,
    pub user: Option<String>,
    pub password: Option<String>,
    pub database: Option<String>,
    /// Search cluster nodes.
    pub hosts: Vec<String>,
    /// Request timeout in seconds (search backend).
    pub timeout: u64,
    pub max_connections: u32,
    /// Directory of `<index>.json` mapping files.
    pub mappings_dir: PathBuf,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            kind: DatabaseKind::default(),
            url: None,
            host: None,
            port: None,
            user: None,
            password: None,
            database: None,
            hosts: Vec::new(),
            timeout: 10,
            max_connections: 10,
            mappings_dir: PathBuf::from("mappings"),
        }
    }
}

impl DatabaseConfig {
    /// Relational connection URL.
    ///
    /// # Errors
    ///
    /// `ConfigError` without `url` or `host` + `database`.
    pub fn connection_string(&self) -> Result<String> {
        if let Some(url) = self.url.as_deref().filter(|u| !u.is_empty()) {
            return Ok(url.to_string());
        }
        let (Some(host), Some(database)) = (&self.host, &self.database) else {
            return Err(config_error("database needs either url or host and database"));
        };

        let credentials = match (&self.user, &self.password) {
            (Some(user), Some(password)) => format!(
                "{}:{}@",
                urlencoding::encode(user),
                urlencoding::encode(password)
            ),
            (Some(user), None) => format!("{}@", urlencoding::encode(user)),
            _ => String::new(),
        };
        let port = self.port.unwrap_or(5432);
        Ok(format!("postgres://{credentials}{host}:{port}/{database}"))
    }

    /// Search cluster nodes, falling back to `url`.
    ///
    /// # Errors
    ///
    /// `ConfigError` when neither is set.
    pub fn hosts(&self) -> Result<Vec<String>> {
        if !self.hosts.is_empty() {
            return Ok(self.hosts.clone());
        }
        match self.url.as_deref().filter(|u| !u.is_empty()) {
            Some(url) => Ok(vec![url.to_string()]),
            None => Err(config_error("elastic database needs hosts or url")),
        }
    }
}

/// Whole configuration document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub database: DatabaseConfig,
    pub metadata: MetadataConfig,
    /// Default log filter when `RUST_LOG` is unset.
    #[serde(default)]
    pub log_level: Option<String>,
}

impl Config {
    /// Reads, substitutes, parses and validates `path`.
    ///
    /// # Errors
    ///
    /// `ConfigError` when the file is unreadable or invalid.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|e| {
            config_error(&format!("cannot read {}: {e}", path.display()))
        })?;
        Self::from_yaml(&raw)
    }

    /// Parses and validates a YAML document.
    ///
    /// # Errors
    ///
    /// `ConfigError` for unset variables, bad YAML or failed validation.
    pub fn from_yaml(raw: &str) -> Result<Self> {
        let expanded = substitute_env(raw)?;
        let config: Config = serde_yaml::from_str(&expanded)?;
        config.validate()?;
        Ok(config)
    }

    /// # Errors
    ///
    /// See [`MetadataConfig::validate`].
    pub fn validate(&self) -> Result<()> {
        self.metadata.validate()
    }
}

fn env_regex() -> &'static Regex {
    static ENV: OnceLock<Regex> = OnceLock::new();
    ENV.get_or_init(|| {
        Regex::new(r"\$\{([A-Za-z_][A-Za-z0-9_]*)(?::-([^}]*))?\}").expect("valid env regex")
    })
}

/// Replaces `${VAR}` and `${VAR:-default}` with values from the environment.
///
/// # Errors
///
/// `ConfigError` listing variables that are unset and have no default.
pub fn substitute_env(raw: &str) -> Result<String> {
    let mut missing = Vec::new();
    let expanded = env_regex().replace_all(raw, |caps: &Captures<'_>| {
        let name = &caps[1];
        match (std::env::var(name), caps.get(2)) {
            (Ok(value), _) => value,
            (Err(_), Some(default)) => default.as_str().to_string(),
            (Err(_), None) => {
                missing.push(name.to_string());
                String::new()
            }
        }
    });

    if missing.is_empty() {
        Ok(expanded.into_owned())
    } else {
        Err(config_error(&format!(
            "unset environment variables: {}",
            missing.join(", ")
        )))
    }
}

fn config_error(message: &str) -> MetadataIndexerError {
    MetadataIndexerError::ConfigError(message.to_string())
}
