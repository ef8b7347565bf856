//! Client seam for the remote configuration service.
//!
//! # Purpose
//! The remote backend only needs six operations from the config registry:
//! point reads, CAS publishes, deletes, paginated blur search, and
//! per-record change subscriptions. [`ConfigClient`] is that seam;
//! [`http::HttpConfigClient`] speaks the Nacos open-api over HTTP and
//! [`memory::MemoryConfigClient`] backs the test suite.

use async_trait::async_trait;
use std::sync::Arc;
use thiserror::Error;

pub mod http;
pub mod memory;

pub use http::HttpConfigClient;
pub use memory::MemoryConfigClient;

/// Group every record without an explicit group lands in.
pub const DEFAULT_GROUP: &str = "DEFAULT_GROUP";

/// Returns the group a record is actually stored under. The service has no
/// notion of an empty group.
pub fn effective_group(group: &str) -> &str {
    if group.is_empty() {
        DEFAULT_GROUP
    } else {
        group
    }
}

/// MD5 hex of a raw payload, the service's CAS witness and the remote
/// backend's resource version.
pub fn content_md5(content: &str) -> String {
    format!("{:x}", md5::compute(content.as_bytes()))
}

#[derive(Clone, Debug)]
pub struct ConfigItem {
    pub data_id: String,
    pub group: String,
    pub content: String,
}

#[derive(Clone, Debug, Default)]
pub struct ConfigPage {
    pub total_count: u32,
    pub page_number: u32,
    pub pages_available: u32,
    pub items: Vec<ConfigItem>,
}

/// Payload delivered to a change subscription.
#[derive(Clone, Debug)]
pub struct ConfigChange {
    pub data_id: String,
    pub group: String,
    pub content: String,
}

/// Subscription callback. Handlers must not block; long work is spawned.
pub type ChangeHandler = Arc<dyn Fn(ConfigChange) + Send + Sync>;

#[derive(Debug, Error)]
pub enum NacosError {
    #[error("config service request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("config service returned status {status}: {body}")]
    Status { status: u16, body: String },
    #[error("config service response was not understood: {0}")]
    BadResponse(String),
    #[error("{0}")]
    Other(String),
}

/// The operations the remote backend relies on.
#[async_trait]
pub trait ConfigClient: Send + Sync {
    /// Point read. `Ok(None)` when the record does not exist.
    async fn get_config(&self, data_id: &str, group: &str) -> Result<Option<String>, NacosError>;

    /// Publishes `content`, guarded by the MD5 of the expected previous
    /// payload when `cas_md5` is set. Returns `false` when the service
    /// rejects the publish (CAS mismatch).
    async fn publish_config(
        &self,
        data_id: &str,
        group: &str,
        content: &str,
        cas_md5: Option<&str>,
    ) -> Result<bool, NacosError>;

    /// Returns `false` when the service reports the delete did not happen.
    async fn delete_config(&self, data_id: &str, group: &str) -> Result<bool, NacosError>;

    /// Paginated blur search. An empty `group` searches every group; the
    /// pattern uses `*` wildcards (`<plural>.*`).
    async fn search_configs(
        &self,
        data_id_pattern: &str,
        group: &str,
        page_no: u32,
        page_size: u32,
    ) -> Result<ConfigPage, NacosError>;

    /// Subscribes to changes of one record. At most one subscription per
    /// (data_id, group); a second `listen` replaces the handler.
    async fn listen(
        &self,
        data_id: &str,
        group: &str,
        handler: ChangeHandler,
    ) -> Result<(), NacosError>;

    async fn cancel_listen(&self, data_id: &str, group: &str);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn effective_group_defaults_empty() {
        assert_eq!(effective_group(""), DEFAULT_GROUP);
        assert_eq!(effective_group("osprey-system"), "osprey-system");
    }

    #[test]
    fn content_md5_matches_known_vector() {
        // md5("abc") is a fixed vector.
        assert_eq!(content_md5("abc"), "900150983cd24fb0d6963f7d28e17f72");
    }
}
