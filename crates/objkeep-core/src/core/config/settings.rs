use std::collections::HashMap;
use std::env;
use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use camino::Utf8PathBuf;
use objkeep_domain::Enlistment;
use url::Url;

pub const DEFAULT_RETRY_ATTEMPTS: u32 = 6;
pub const DEFAULT_PACK_BATCH_SIZE: u64 = 2 * 1024 * 1024 * 1024;
pub const DEFAULT_HTTP_TIMEOUT: Duration = Duration::from_secs(60);

#[derive(Debug, Clone)]
pub(crate) struct EnvSnapshot {
    vars: HashMap<String, String>,
}

impl EnvSnapshot {
    pub(crate) fn capture() -> Self {
        Self {
            vars: env::vars().collect(),
        }
    }

    pub(crate) fn flag_is_enabled(&self, key: &str) -> bool {
        matches!(self.vars.get(key).map(String::as_str), Some("1"))
    }

    pub(crate) fn var(&self, key: &str) -> Option<&str> {
        self.vars
            .get(key)
            .map(String::as_str)
            .filter(|value| !value.trim().is_empty())
    }

    #[cfg(test)]
    pub(crate) fn testing(pairs: &[(&str, &str)]) -> Self {
        let vars = pairs
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect();
        Self { vars }
    }
}

#[derive(Debug, Clone)]
pub struct Config {
    pub(crate) store: StoreConfig,
    pub(crate) network: NetworkConfig,
    pub(crate) maintenance: MaintenanceConfig,
}

impl Config {
    /// Builds a configuration snapshot from the current process environment.
    ///
    /// # Errors
    /// Returns an error if a URL or numeric override cannot be parsed.
    pub fn from_env() -> Result<Self> {
        Self::from_snapshot(&EnvSnapshot::capture())
    }

    pub(crate) fn from_snapshot(snapshot: &EnvSnapshot) -> Result<Self> {
        Ok(Self {
            store: StoreConfig {
                objects_root: snapshot.var("OBJKEEP_OBJECTS_ROOT").map(Utf8PathBuf::from),
                smart_protocol: snapshot.flag_is_enabled("OBJKEEP_SMART_PROTOCOL"),
            },
            network: NetworkConfig {
                repo_url: parse_url(snapshot, "OBJKEEP_REPO_URL")?,
                cache_server_url: parse_url(snapshot, "OBJKEEP_CACHE_SERVER_URL")?,
                retry_attempts: parse_number(snapshot, "OBJKEEP_RETRY_ATTEMPTS")?
                    .unwrap_or(DEFAULT_RETRY_ATTEMPTS),
                http_timeout: parse_number::<u64>(snapshot, "OBJKEEP_HTTP_TIMEOUT_SECS")?
                    .map_or(DEFAULT_HTTP_TIMEOUT, Duration::from_secs),
            },
            maintenance: MaintenanceConfig {
                unattended: snapshot.flag_is_enabled("OBJKEEP_UNATTENDED"),
                pack_batch_size: parse_number(snapshot, "OBJKEEP_PACK_BATCH_SIZE")?
                    .unwrap_or(DEFAULT_PACK_BATCH_SIZE),
            },
        })
    }

    /// Lay the configured store and servers over an enlistment rooted at `root`.
    ///
    /// # Errors
    /// Returns an error when `root` is not valid UTF-8.
    pub fn enlistment(&self, root: &Path) -> Result<Enlistment> {
        let mut enlistment = Enlistment::from_path(root)?
            .with_repo_url(self.network.repo_url.clone())
            .with_cache_server(self.network.cache_server_url.clone())
            .with_smart_protocol(self.store.smart_protocol);
        if let Some(objects_root) = &self.store.objects_root {
            enlistment = enlistment.with_objects_root(objects_root.clone());
        }
        Ok(enlistment)
    }

    #[must_use]
    pub fn store(&self) -> &StoreConfig {
        &self.store
    }

    #[must_use]
    pub fn network(&self) -> &NetworkConfig {
        &self.network
    }

    #[must_use]
    pub fn maintenance(&self) -> &MaintenanceConfig {
        &self.maintenance
    }
}

#[derive(Debug, Clone)]
pub struct StoreConfig {
    pub objects_root: Option<Utf8PathBuf>,
    pub smart_protocol: bool,
}

#[derive(Debug, Clone)]
pub struct NetworkConfig {
    pub repo_url: Option<Url>,
    pub cache_server_url: Option<Url>,
    pub retry_attempts: u32,
    pub http_timeout: Duration,
}

#[derive(Debug, Clone, Copy)]
pub struct MaintenanceConfig {
    pub unattended: bool,
    pub pack_batch_size: u64,
}

impl Default for MaintenanceConfig {
    fn default() -> Self {
        Self {
            unattended: false,
            pack_batch_size: DEFAULT_PACK_BATCH_SIZE,
        }
    }
}

fn parse_url(snapshot: &EnvSnapshot, key: &str) -> Result<Option<Url>> {
    snapshot
        .var(key)
        .map(|raw| Url::parse(raw.trim()).with_context(|| format!("{key} is not a valid URL: {raw}")))
        .transpose()
}

fn parse_number<T>(snapshot: &EnvSnapshot, key: &str) -> Result<Option<T>>
where
    T: std::str::FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    snapshot
        .var(key)
        .map(|raw| {
            raw.trim()
                .parse::<T>()
                .with_context(|| format!("{key} must be a number, got {raw}"))
        })
        .transpose()
}
