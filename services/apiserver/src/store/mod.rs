//! Storage backends and the contract they share.
//!
//! # Purpose
//! Every managed kind is served by one [`Storage`] instance: file-backed
//! ([`file::FileStore`]) or remote-config-backed ([`nacos::NacosStore`]).
//! The backend is chosen once at registration; callers only see this trait.
//!
//! # Semantics shared by both backends
//! - One record per (kind, namespace, name); namespace and name are
//!   re-asserted from the record key on every read.
//! - Optimistic concurrency through the object's `resourceVersion`: a
//!   non-empty stale version on update is a conflict.
//! - Every observed change reaches each eligible watcher exactly once,
//!   after an initial snapshot replay of the current list.

use async_trait::async_trait;
use osprey_kube::{KubeObject, ListOptions, RequestContext, ResourceInfo, StorageResult};
use osprey_kube::selector::{AttrFn, SelectionPredicate};
use osprey_kube::StorageError;
use std::sync::Arc;

pub mod file;
pub mod nacos;
pub mod watch;

pub use watch::WatchStream;

/// The single namespace the server manages for namespaced kinds.
pub const DEFAULT_NAMESPACE: &str = "osprey-system";

/// Admission hook for create and delete.
pub type Validator<O> = Box<dyn Fn(&O) -> Result<(), String> + Send + Sync>;
/// Admission hook for update, receiving `(new, old)`.
pub type UpdateValidator<O> = Box<dyn Fn(&O, &O) -> Result<(), String> + Send + Sync>;
/// Produces the updated object from the current one (`None` when absent).
pub type Updater<O> = Box<dyn FnOnce(Option<&O>) -> StorageResult<O> + Send>;

/// Uniform operations every backend implements for one resource kind.
#[async_trait]
pub trait Storage<O: KubeObject>: Send + Sync {
    fn resource_info(&self) -> &ResourceInfo;

    /// Point read; the namespace comes from `ctx`. The returned object has
    /// a non-empty `resourceVersion`.
    async fn get(&self, ctx: &RequestContext, name: &str) -> StorageResult<O>;

    /// Enumerates all records of the kind, filtered by the request's label
    /// and field selectors (both default to match-everything).
    async fn list(&self, ctx: &RequestContext, options: &ListOptions) -> StorageResult<Vec<O>>;

    /// First write for a key; an existing record is a conflict.
    async fn create(
        &self,
        ctx: &RequestContext,
        obj: O,
        validate: Option<&Validator<O>>,
    ) -> StorageResult<O>;

    /// Read-modify-write with optimistic concurrency. Returns the stored
    /// object and whether the call created it (`force_allow_create` on a
    /// missing key).
    #[allow(clippy::too_many_arguments)]
    async fn update(
        &self,
        ctx: &RequestContext,
        name: &str,
        updater: Updater<O>,
        create_validate: Option<&Validator<O>>,
        update_validate: Option<&UpdateValidator<O>>,
        force_allow_create: bool,
    ) -> StorageResult<(O, bool)>;

    /// Removes the record, returning the object the `Deleted` event carries.
    async fn delete(
        &self,
        ctx: &RequestContext,
        name: &str,
        validate: Option<&Validator<O>>,
    ) -> StorageResult<(O, bool)>;

    /// Deletes every record matching the selectors and returns them.
    async fn delete_collection(
        &self,
        ctx: &RequestContext,
        validate: Option<&Validator<O>>,
        options: &ListOptions,
    ) -> StorageResult<Vec<O>>;

    /// Streams the filtered current state as synthetic `Added` events, then
    /// live changes passing the watcher's filter.
    async fn watch(
        &self,
        ctx: &RequestContext,
        options: &ListOptions,
    ) -> StorageResult<WatchStream<O>>;

    /// Stops background observers and releases every watcher.
    fn destroy(&self);
}

/// MD5 hex of a stored payload, the remote backend's resource version and
/// the file backend's fallback for payloads that carry no metadata.
pub fn content_hash(payload: &[u8]) -> String {
    format!("{:x}", md5::compute(payload))
}

/// Creation timestamp at second precision, the resolution Kubernetes
/// serializes. Sub-second precision would not survive an encode/decode
/// round trip.
pub fn creation_timestamp_now() -> k8s_openapi::apimachinery::pkg::apis::meta::v1::Time {
    use chrono::Timelike;
    let now = chrono::Utc::now();
    k8s_openapi::apimachinery::pkg::apis::meta::v1::Time(now.with_nanosecond(0).unwrap_or(now))
}

/// Builds the selection predicate for a request; unparsable selectors are a
/// caller error.
pub fn build_predicate<O: KubeObject>(
    options: &ListOptions,
    attrs: &AttrFn<O>,
) -> StorageResult<SelectionPredicate<O>> {
    SelectionPredicate::from_options(options, Arc::clone(attrs)).map_err(StorageError::BadRequest)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn content_hash_is_md5_hex() {
        assert_eq!(content_hash(b"abc"), "900150983cd24fb0d6963f7d28e17f72");
    }
}
