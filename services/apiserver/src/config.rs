//! Command-line and environment configuration.

use anyhow::{bail, Context, Result};
use clap::{Parser, ValueEnum};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;
use url::Url;

use crate::store::nacos::NacosSettings;

/// Environment override for the post-mutation sync sleep of the remote
/// backend (a humantime duration such as `500ms` or `2s`).
pub const CACHE_SYNC_DELAY_ENV: &str = "NACOS_CACHE_SYNC_DELAY";

const DEFAULT_CACHE_SYNC_DELAY: Duration = Duration::from_millis(500);

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
pub enum StorageMode {
    File,
    Nacos,
}

#[derive(Clone, Debug, Parser)]
#[command(name = "osprey-apiserver", about = "Kubernetes-compatible API server over file or Nacos storage")]
pub struct Options {
    /// The storage mode.
    #[arg(long = "storage", value_enum, default_value = "nacos")]
    pub storage: StorageMode,

    /// Root directory of the file backend.
    #[arg(long = "file-root-dir", default_value = "./conf")]
    pub file_root_dir: PathBuf,

    /// URLs of the Nacos service, e.g. http://localhost:8848/nacos.
    #[arg(long = "nacos-server", value_delimiter = ',')]
    pub nacos_server: Vec<String>,

    /// Username for the Nacos service; leave empty when auth is disabled.
    #[arg(long = "nacos-username", default_value = "")]
    pub nacos_username: String,

    /// Password for the Nacos service; leave empty when auth is disabled.
    #[arg(long = "nacos-password", default_value = "")]
    pub nacos_password: String,

    /// Namespace ID the configurations are stored in.
    #[arg(long = "nacos-ns-id", default_value = "osprey-system")]
    pub nacos_ns_id: String,

    /// Read timeout against the Nacos service, in milliseconds.
    #[arg(long = "nacos-timeout", default_value_t = 5000)]
    pub nacos_timeout_ms: u64,

    /// File containing the AES key for sensitive payloads (16, 24 or 32
    /// bytes). Unset disables data encryption.
    #[arg(long = "nacos-encryption-key-file")]
    pub nacos_encryption_key_file: Option<PathBuf>,

    /// Directory for Nacos client logs.
    #[arg(long = "nacos-log-dir", default_value = "/tmp/nacos/log")]
    pub nacos_log_dir: PathBuf,

    /// Directory for Nacos client cache data.
    #[arg(long = "nacos-cache-dir", default_value = "/tmp/nacos/cache")]
    pub nacos_cache_dir: PathBuf,

    /// Interval between config-list refresh passes, in seconds.
    #[arg(long = "nacos-refresh-interval", default_value_t = 10)]
    pub nacos_refresh_interval_secs: u64,

    /// Page size for config searches.
    #[arg(long = "nacos-search-page-size", default_value_t = 50)]
    pub nacos_search_page_size: u32,

    /// Whether to enable authentication and authorization.
    #[arg(long = "auth-enabled", default_value_t = false)]
    pub auth_enabled: bool,

    /// API bind address.
    #[arg(long = "bind-addr", default_value = "0.0.0.0:8443")]
    pub bind_addr: SocketAddr,

    /// Metrics bind address.
    #[arg(long = "metrics-bind", default_value = "0.0.0.0:8080")]
    pub metrics_bind: SocketAddr,
}

impl Options {
    pub fn validate(&self) -> Result<()> {
        match self.storage {
            StorageMode::File => {
                if self.file_root_dir.as_os_str().is_empty() {
                    bail!("--file-root-dir must be set");
                }
                if self.file_root_dir.exists() && !self.file_root_dir.is_dir() {
                    bail!("--file-root-dir must be a directory path");
                }
            }
            StorageMode::Nacos => {
                self.nacos_server_urls()?;
                self.load_encryption_key()?;
            }
        }
        Ok(())
    }

    /// Parses and validates the configured server URLs. Only plain HTTP
    /// endpoints are accepted.
    pub fn nacos_server_urls(&self) -> Result<Vec<Url>> {
        if self.nacos_server.is_empty() {
            bail!("--nacos-server must be set");
        }
        let mut urls = Vec::with_capacity(self.nacos_server.len());
        for server in &self.nacos_server {
            let url = Url::parse(server).with_context(|| format!("invalid URL format: {server}"))?;
            if url.scheme() != "http" {
                bail!("only HTTP URLs are acceptable: {server}");
            }
            if url.host_str().is_none() {
                bail!("URL has no host: {server}");
            }
            urls.push(url);
        }
        Ok(urls)
    }

    /// Reads the AES key file when configured; key length selects the
    /// cipher.
    pub fn load_encryption_key(&self) -> Result<Option<Vec<u8>>> {
        let Some(path) = &self.nacos_encryption_key_file else {
            return Ok(None);
        };
        let key = std::fs::read(path)
            .with_context(|| format!("failed to read encryption key file {}", path.display()))?;
        match key.len() {
            16 | 24 | 32 => Ok(Some(key)),
            len => bail!("invalid encryption key length: {len}"),
        }
    }

    pub fn nacos_settings(&self) -> NacosSettings {
        NacosSettings {
            refresh_interval: Duration::from_secs(self.nacos_refresh_interval_secs.max(1)),
            search_page_size: self.nacos_search_page_size.max(1),
            cache_sync_delay: cache_sync_delay_from_env(),
        }
    }

    pub fn nacos_timeout(&self) -> Duration {
        Duration::from_millis(self.nacos_timeout_ms)
    }
}

/// Resolves the post-mutation sync sleep, preferring the environment
/// override. Unparsable values fall back to the default and are logged.
pub fn cache_sync_delay_from_env() -> Duration {
    match std::env::var(CACHE_SYNC_DELAY_ENV) {
        Ok(raw) if !raw.is_empty() => match humantime::parse_duration(&raw) {
            Ok(delay) => delay,
            Err(err) => {
                tracing::error!(
                    value = %raw,
                    error = %err,
                    "failed to parse {CACHE_SYNC_DELAY_ENV}, using default"
                );
                DEFAULT_CACHE_SYNC_DELAY
            }
        },
        _ => DEFAULT_CACHE_SYNC_DELAY,
    }
}
