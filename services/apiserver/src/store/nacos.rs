//! Remote-config-backed storage: one keyed record per object.
//!
//! # Key scheme
//! `data_id = <lowercased plural>.<name>`, `group = namespace` (records
//! without a namespace land in the service's default group). A per-kind
//! roster record `<plural>.__names__` in the default group lists every known
//! `<group>/<data_id>` and accelerates discovery of added/removed records;
//! the service rejects empty content, so an empty roster stores the literal
//! `EMPTY`.
//!
//! # Change detection
//! A background ticker re-runs the paginated search and diffs the observed
//! key set against the previously known one: additions emit `Added` and gain
//! a per-record subscription, removals are unsubscribed and emit `Deleted`.
//! Each subscription emits `Modified` with the decoded payload. The roster
//! record itself is subscribed once and triggers an out-of-band refresh.
//!
//! # Consistency
//! The service's read-your-writes is eventual; every mutation sleeps a
//! configurable delay before returning so a follow-up list observes the
//! write. Publishes carry the MD5 of the previous payload as a CAS witness;
//! a rejected publish is a conflict.

use super::watch::{WatcherHub, WatchStream};
use super::{
    build_predicate, content_hash, creation_timestamp_now, Storage, UpdateValidator, Updater,
    Validator, DEFAULT_NAMESPACE,
};
use crate::nacos::{
    content_md5, effective_group, ChangeHandler, ConfigChange, ConfigClient, ConfigItem,
    DEFAULT_GROUP,
};
use async_trait::async_trait;
use osprey_codec::Codec;
use osprey_crypto::PayloadCipher;
use osprey_kube::object::normalize_object_meta;
use osprey_kube::selector::AttrFn;
use osprey_kube::{
    Event, KubeObject, ListOptions, RequestContext, ResourceInfo, StorageError, StorageResult,
};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;
use tokio::task::JoinHandle;

const DATA_ID_SEPARATOR: &str = ".";
const NAMES_SUFFIX: &str = "__names__";
const EMPTY_NAMES_PLACEHOLDER: &str = "EMPTY";
const NACOS_WATCH_BUFFER: usize = 1024;

/// Tunables resolved from flags and environment at startup.
#[derive(Clone, Debug)]
pub struct NacosSettings {
    pub refresh_interval: Duration,
    pub search_page_size: u32,
    pub cache_sync_delay: Duration,
}

impl Default for NacosSettings {
    fn default() -> Self {
        Self {
            refresh_interval: Duration::from_secs(10),
            search_page_size: 50,
            cache_sync_delay: Duration::from_millis(500),
        }
    }
}

struct NacosInner<O: KubeObject> {
    info: ResourceInfo,
    codec: Box<dyn Codec<O>>,
    client: Arc<dyn ConfigClient>,
    attrs: AttrFn<O>,
    cipher: Option<PayloadCipher>,
    hub: WatcherHub<O>,
    data_id_prefix: String,
    names_data_id: String,
    settings: NacosSettings,
    /// Records observed by the last refresh pass, keyed `<group>/<data_id>`.
    /// The refresh mutex doubles as the pass serializer.
    known: tokio::sync::Mutex<HashMap<String, ConfigItem>>,
    names_listened: AtomicBool,
    background_started: AtomicBool,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    /// Back-reference handed to subscription callbacks and background
    /// tasks; the store handle is the only strong owner.
    weak: Weak<NacosInner<O>>,
}

/// Remote-config-backed [`Storage`] for one resource kind.
pub struct NacosStore<O: KubeObject> {
    inner: Arc<NacosInner<O>>,
}

impl<O: KubeObject> NacosStore<O> {
    pub fn new(
        info: ResourceInfo,
        codec: Box<dyn Codec<O>>,
        client: Arc<dyn ConfigClient>,
        attrs: AttrFn<O>,
        cipher: Option<PayloadCipher>,
        settings: NacosSettings,
    ) -> Self {
        let data_id_prefix = info.plural.to_lowercase();
        let names_data_id = format!("{data_id_prefix}{DATA_ID_SEPARATOR}{NAMES_SUFFIX}");
        let inner = Arc::new_cyclic(|weak| NacosInner {
            hub: WatcherHub::new(&info.plural),
            info,
            codec,
            client,
            attrs,
            cipher,
            data_id_prefix,
            names_data_id,
            settings,
            known: tokio::sync::Mutex::new(HashMap::new()),
            names_listened: AtomicBool::new(false),
            background_started: AtomicBool::new(false),
            tasks: Mutex::new(Vec::new()),
            weak: weak.clone(),
        });
        inner.start_background();
        Self { inner }
    }
}

impl<O: KubeObject> NacosInner<O> {
    fn object_data_id(&self, name: &str) -> String {
        format!("{}{DATA_ID_SEPARATOR}{name}", self.data_id_prefix)
    }

    fn search_pattern(&self) -> String {
        format!("{}{DATA_ID_SEPARATOR}*", self.data_id_prefix)
    }

    fn name_from_data_id<'a>(&self, data_id: &'a str) -> &'a str {
        data_id
            .strip_prefix(&format!("{}{DATA_ID_SEPARATOR}", self.data_id_prefix))
            .unwrap_or(data_id)
    }

    fn namespace_for_group(&self, group: &str) -> Option<String> {
        if !self.info.namespaced {
            return None;
        }
        if group.is_empty() || group == DEFAULT_GROUP {
            Some(DEFAULT_NAMESPACE.to_string())
        } else {
            Some(group.to_string())
        }
    }

    fn is_roster_item(&self, item: &ConfigItem) -> bool {
        item.data_id == self.names_data_id && item.group == DEFAULT_GROUP
    }

    /// Decrypts (when sealed) and decodes a raw payload.
    fn decode_payload(&self, raw: &str) -> StorageResult<O> {
        let bytes = if osprey_crypto::is_sealed(raw) {
            match &self.cipher {
                Some(cipher) => cipher.open(raw).map_err(|err| {
                    StorageError::Internal(anyhow::anyhow!("failed to decrypt payload: {err}"))
                })?,
                None => {
                    return Err(StorageError::Internal(anyhow::anyhow!(
                        "payload is encrypted but no encryption key is configured"
                    )))
                }
            }
        } else {
            raw.as_bytes().to_vec()
        };
        self.codec
            .decode(&bytes)
            .map_err(|err| StorageError::Internal(anyhow::anyhow!("failed to decode payload: {err}")))
    }

    /// Full read pipeline for one record: decode, re-assert identity from
    /// the record key, recompute the resource version from the raw payload.
    fn decode_record(&self, group: &str, data_id: &str, raw: &str) -> StorageResult<O> {
        let mut obj = self.decode_payload(raw)?;
        let name = self.name_from_data_id(data_id).to_string();
        let namespace = self.namespace_for_group(group);
        normalize_object_meta(&mut obj, namespace.as_deref(), &name);
        obj.set_resource_version(Some(content_hash(raw.as_bytes())));
        Ok(obj)
    }

    /// Encodes and, for sensitive kinds, seals an object. The stored payload
    /// never carries a resource version.
    fn encode_payload(&self, obj: &O) -> StorageResult<String> {
        let mut to_store = obj.clone();
        to_store.set_resource_version(None);
        let plain = self
            .codec
            .encode(&to_store)
            .map_err(|err| StorageError::Internal(anyhow::anyhow!("failed to encode: {err}")))?;
        match &self.cipher {
            Some(cipher) => cipher.seal(plain.as_bytes()).map_err(|err| {
                StorageError::Internal(anyhow::anyhow!("failed to encrypt payload: {err}"))
            }),
            None => Ok(plain),
        }
    }

    async fn read(&self, group: &str, data_id: &str) -> StorageResult<Option<(O, String)>> {
        let raw = self
            .client
            .get_config(data_id, group)
            .await
            .map_err(|err| StorageError::Internal(err.into()))?;
        match raw {
            Some(raw) if !raw.is_empty() => {
                let obj = self.decode_record(group, data_id, &raw)?;
                Ok(Some((obj, raw)))
            }
            _ => Ok(None),
        }
    }

    /// Paginated blur search, roster record filtered out.
    async fn collect_configs(&self, group: &str) -> StorageResult<Vec<ConfigItem>> {
        let pattern = self.search_pattern();
        let mut items = Vec::new();
        let mut page_no = 1u32;
        loop {
            let page = self
                .client
                .search_configs(&pattern, group, page_no, self.settings.search_page_size)
                .await
                .map_err(|err| StorageError::Internal(err.into()))?;
            if page.pages_available == 0 {
                break;
            }
            for item in page.items {
                if !self.is_roster_item(&item) {
                    items.push(item);
                }
            }
            if page.pages_available <= page_no {
                break;
            }
            page_no += 1;
        }
        Ok(items)
    }

    async fn wait_for_cache_sync(&self) {
        if self.settings.cache_sync_delay > Duration::ZERO {
            tokio::time::sleep(self.settings.cache_sync_delay).await;
        }
    }

    fn start_background(&self) {
        if self.background_started.swap(true, Ordering::SeqCst) {
            return;
        }
        let Some(inner) = self.weak.upgrade() else {
            return;
        };
        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(inner.settings.refresh_interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                inner.ensure_names_listener().await;
                inner.refresh_config_list().await;
            }
        });
        self.tasks.lock().expect("tasks lock").push(task);
    }

    /// Installs the roster subscription once; any roster change triggers an
    /// out-of-band refresh.
    async fn ensure_names_listener(&self) {
        if self.names_listened.load(Ordering::SeqCst) {
            return;
        }
        let weak = self.weak.clone();
        let handler: ChangeHandler = Arc::new(move |_change: ConfigChange| {
            if let Some(inner) = weak.upgrade() {
                tokio::spawn(async move {
                    inner.refresh_config_list().await;
                });
            }
        });
        match self
            .client
            .listen(&self.names_data_id, DEFAULT_GROUP, handler)
            .await
        {
            Ok(()) => self.names_listened.store(true, Ordering::SeqCst),
            Err(err) => {
                tracing::error!(kind = %self.info.plural, error = %err, "failed to watch names config");
            }
        }
    }

    /// One refresh pass: search, reconcile the roster, diff against the
    /// known set, emit and (un)subscribe accordingly. Transient errors abort
    /// the pass; the next tick retries.
    async fn refresh_config_list(&self) {
        let mut known = self.known.lock().await;

        let items = match self.collect_configs("").await {
            Ok(items) => items,
            Err(err) => {
                tracing::warn!(kind = %self.info.plural, error = %err, "config list refresh failed");
                return;
            }
        };
        let mut observed: HashMap<String, ConfigItem> = items
            .into_iter()
            .map(|item| (format!("{}/{}", item.group, item.data_id), item))
            .collect();

        self.reconcile_roster(&observed).await;

        let added_keys: Vec<String> = observed
            .keys()
            .filter(|key| !known.contains_key(*key))
            .cloned()
            .collect();
        let removed_keys: Vec<String> = known
            .keys()
            .filter(|key| !observed.contains_key(*key))
            .cloned()
            .collect();

        for key in added_keys {
            let item = observed.get(&key).expect("observed key").clone();
            let obj = match self.decode_record(&item.group, &item.data_id, &item.content) {
                Ok(obj) => obj,
                Err(err) => {
                    tracing::error!(%key, error = %err, "failed to decode discovered config");
                    // Leave it out of the known set so the next pass retries.
                    observed.remove(&key);
                    continue;
                }
            };
            tracing::info!(%key, kind = %self.info.plural, "config added");
            self.hub.broadcast(Event::added(obj)).await;
            self.listen_record(&item).await;
        }

        for key in removed_keys {
            let item = known.get(&key).expect("known key").clone();
            self.client.cancel_listen(&item.data_id, &item.group).await;
            match self.decode_record(&item.group, &item.data_id, &item.content) {
                Ok(obj) => {
                    tracing::info!(%key, kind = %self.info.plural, "config deleted");
                    self.hub.broadcast(Event::deleted(obj)).await;
                }
                Err(err) => {
                    tracing::error!(%key, error = %err, "failed to decode removed config");
                }
            }
        }

        *known = observed;
    }

    /// Rewrites the roster when the observed key set has drifted from it.
    async fn reconcile_roster(&self, observed: &HashMap<String, ConfigItem>) {
        if observed.is_empty() {
            return;
        }
        let mut keys: Vec<&String> = observed.keys().collect();
        keys.sort();
        let expected = keys
            .iter()
            .map(|key| format!("{key}\n"))
            .collect::<String>();

        let current = match self.client.get_config(&self.names_data_id, DEFAULT_GROUP).await {
            Ok(current) => current,
            Err(err) => {
                tracing::error!(error = %err, "failed to read names config");
                return;
            }
        };
        let current_raw = current.clone().unwrap_or_default();
        if current_raw == expected {
            return;
        }
        let cas = current.as_deref().map(content_md5);
        if let Err(err) = self
            .client
            .publish_config(&self.names_data_id, DEFAULT_GROUP, &expected, cas.as_deref())
            .await
        {
            tracing::error!(error = %err, "failed to update names config");
        }
    }

    async fn listen_record(&self, item: &ConfigItem) {
        let weak = self.weak.clone();
        let handler: ChangeHandler = Arc::new(move |change: ConfigChange| {
            if let Some(inner) = weak.upgrade() {
                tokio::spawn(async move {
                    inner.handle_record_change(change).await;
                });
            }
        });
        if let Err(err) = self.client.listen(&item.data_id, &item.group, handler).await {
            tracing::error!(
                data_id = %item.data_id,
                group = %item.group,
                error = %err,
                "failed to listen config"
            );
        }
    }

    async fn handle_record_change(&self, change: ConfigChange) {
        if change.content.is_empty() {
            // Deletion; the roster refresh owns the Deleted event.
            return;
        }
        let obj = match self.decode_record(&change.group, &change.data_id, &change.content) {
            Ok(obj) => obj,
            Err(err) => {
                tracing::error!(
                    data_id = %change.data_id,
                    error = %err,
                    "failed to decode changed config"
                );
                return;
            }
        };
        // Keep the known snapshot fresh so a later Deleted carries the last
        // observed state.
        {
            let mut known = self.known.lock().await;
            let key = format!("{}/{}", change.group, change.data_id);
            if let Some(item) = known.get_mut(&key) {
                item.content = change.content.clone();
            }
        }
        tracing::info!(data_id = %change.data_id, group = %change.group, "config changed");
        self.hub.broadcast(Event::modified(obj)).await;
    }

    /// Appends one `<group>/<data_id>` line to the roster. Failures are
    /// logged; the refresh pass repairs drift.
    async fn roster_append(&self, key: &str) {
        let current = match self.client.get_config(&self.names_data_id, DEFAULT_GROUP).await {
            Ok(current) => current,
            Err(err) => {
                tracing::error!(error = %err, "failed to read names config");
                return;
            }
        };
        let current_raw = current.clone().unwrap_or_default();
        let base = if current_raw == EMPTY_NAMES_PLACEHOLDER {
            String::new()
        } else {
            current_raw.clone()
        };
        if base.lines().any(|line| line == key) {
            return;
        }
        let updated = format!("{base}{key}\n");
        let cas = current.as_deref().map(content_md5);
        if let Err(err) = self
            .client
            .publish_config(&self.names_data_id, DEFAULT_GROUP, &updated, cas.as_deref())
            .await
        {
            tracing::error!(error = %err, "failed to update names config");
        }
    }

    /// Removes one line from the roster, writing the placeholder when it
    /// would otherwise become empty.
    async fn roster_remove(&self, key: &str) {
        let current = match self.client.get_config(&self.names_data_id, DEFAULT_GROUP).await {
            Ok(Some(current)) => current,
            Ok(None) => return,
            Err(err) => {
                tracing::error!(error = %err, "failed to read names config");
                return;
            }
        };
        let updated = current.replace(&format!("{key}\n"), "");
        let updated = if updated.is_empty() {
            EMPTY_NAMES_PLACEHOLDER.to_string()
        } else {
            updated
        };
        if updated == current {
            return;
        }
        if let Err(err) = self
            .client
            .publish_config(
                &self.names_data_id,
                DEFAULT_GROUP,
                &updated,
                Some(&content_md5(&current)),
            )
            .await
        {
            tracing::error!(error = %err, "failed to update names config");
        }
    }

    async fn do_delete(
        &self,
        ctx: &RequestContext,
        name: &str,
        validate: Option<&Validator<O>>,
        wait_for_cache_sync: bool,
    ) -> StorageResult<(O, bool)> {
        let group = ctx.namespace().to_string();
        let data_id = self.object_data_id(name);

        let old = match self.read(&group, &data_id).await? {
            Some((obj, _)) => obj,
            None => return Err(StorageError::not_found(&self.info.group_resource(), name)),
        };
        if let Some(validate) = validate {
            validate(&old).map_err(StorageError::BadRequest)?;
        }

        let deleted = self
            .client
            .delete_config(&data_id, &group)
            .await
            .map_err(|err| StorageError::Internal(err.into()))?;
        if !deleted {
            return Err(StorageError::Internal(anyhow::anyhow!(
                "delete config failed: {data_id}"
            )));
        }

        let key = format!("{}/{}", effective_group(&group), data_id);
        self.roster_remove(&key).await;

        if wait_for_cache_sync {
            self.wait_for_cache_sync().await;
        }
        self.record_op("delete");
        Ok((old, true))
    }

    fn record_op(&self, op: &'static str) {
        metrics::counter!(
            "osprey_storage_ops_total",
            "backend" => "nacos",
            "kind" => self.info.plural.clone(),
            "op" => op,
        )
        .increment(1);
    }
}

#[async_trait]
impl<O: KubeObject> Storage<O> for NacosStore<O> {
    fn resource_info(&self) -> &ResourceInfo {
        &self.inner.info
    }

    async fn get(&self, ctx: &RequestContext, name: &str) -> StorageResult<O> {
        let inner = &self.inner;
        let group = ctx.namespace().to_string();
        match inner.read(&group, &inner.object_data_id(name)).await? {
            Some((obj, _)) => Ok(obj),
            None => Err(StorageError::not_found(&inner.info.group_resource(), name)),
        }
    }

    async fn list(&self, ctx: &RequestContext, options: &ListOptions) -> StorageResult<Vec<O>> {
        let inner = &self.inner;
        let predicate = build_predicate(options, &inner.attrs)?;
        let group = ctx.namespace().to_string();

        let mut items = Vec::new();
        for item in inner.collect_configs(&group).await? {
            match inner.decode_record(&item.group, &item.data_id, &item.content) {
                Ok(obj) => {
                    if predicate.matches(&obj) {
                        items.push(obj);
                    }
                }
                Err(err) => {
                    // Undecodable records (e.g. sealed without a key) are
                    // skipped, not fatal to the list.
                    tracing::error!(
                        data_id = %item.data_id,
                        group = %item.group,
                        error = %err,
                        "failed to decode config"
                    );
                }
            }
        }
        tracing::debug!(kind = %inner.info.plural, namespace = %group, count = items.len(), "list");
        inner.record_op("list");
        Ok(items)
    }

    async fn create(
        &self,
        ctx: &RequestContext,
        mut obj: O,
        validate: Option<&Validator<O>>,
    ) -> StorageResult<O> {
        let inner = &self.inner;
        if let Some(validate) = validate {
            validate(&obj).map_err(StorageError::BadRequest)?;
        }
        let name = obj.name().to_string();
        if name.is_empty() {
            return Err(StorageError::BadRequest("object has no name".to_string()));
        }
        let group = ctx.namespace().to_string();
        let data_id = inner.object_data_id(&name);

        let existing = inner
            .client
            .get_config(&data_id, &group)
            .await
            .map_err(|err| StorageError::Internal(err.into()))?;
        if existing.is_some_and(|raw| !raw.is_empty()) {
            return Err(StorageError::already_exists(
                &inner.info.group_resource(),
                &name,
            ));
        }

        let namespace = inner.namespace_for_group(&group);
        normalize_object_meta(&mut obj, namespace.as_deref(), &name);
        obj.metadata_mut().creation_timestamp = Some(creation_timestamp_now());

        let content = inner.encode_payload(&obj)?;
        let published = inner
            .client
            .publish_config(&data_id, &group, &content, None)
            .await
            .map_err(|err| StorageError::Internal(err.into()))?;
        if !published {
            return Err(StorageError::Internal(anyhow::anyhow!(
                "failed to publish config {data_id}"
            )));
        }
        obj.set_resource_version(Some(content_hash(content.as_bytes())));

        let key = format!("{}/{}", effective_group(&group), data_id);
        inner.roster_append(&key).await;

        inner.wait_for_cache_sync().await;
        inner.record_op("create");
        Ok(obj)
    }

    async fn update(
        &self,
        ctx: &RequestContext,
        name: &str,
        updater: Updater<O>,
        create_validate: Option<&Validator<O>>,
        update_validate: Option<&UpdateValidator<O>>,
        force_allow_create: bool,
    ) -> StorageResult<(O, bool)> {
        let inner = &self.inner;
        let group = ctx.namespace().to_string();
        let data_id = inner.object_data_id(name);

        let current = inner.read(&group, &data_id).await?;
        let old = match current {
            Some((obj, _)) => obj,
            None => {
                if !force_allow_create {
                    return Err(StorageError::not_found(&inner.info.group_resource(), name));
                }
                let obj = updater(None)?;
                let created = self.create(ctx, obj, create_validate).await?;
                return Ok((created, true));
            }
        };

        let mut updated = updater(Some(&old))?;
        if let Some(validate) = update_validate {
            validate(&updated, &old).map_err(StorageError::BadRequest)?;
        }

        let current_version = old.resource_version().to_string();
        let supplied_version = updated.resource_version().to_string();
        if !supplied_version.is_empty() && supplied_version != current_version {
            return Err(StorageError::conflict(
                &inner.info.group_resource(),
                name,
                "resource version mismatch",
            ));
        }

        let namespace = inner.namespace_for_group(&group);
        normalize_object_meta(&mut updated, namespace.as_deref(), name);

        let content = inner.encode_payload(&updated)?;
        // The current resource version is the MD5 of the stored payload and
        // doubles as the CAS witness.
        let published = inner
            .client
            .publish_config(&data_id, &group, &content, Some(&current_version))
            .await
            .map_err(|err| {
                StorageError::conflict(
                    &inner.info.group_resource(),
                    name,
                    format!("publish failed: {err}"),
                )
            })?;
        if !published {
            return Err(StorageError::conflict(
                &inner.info.group_resource(),
                name,
                "compare-and-swap rejected",
            ));
        }
        updated.set_resource_version(Some(content_hash(content.as_bytes())));

        inner.wait_for_cache_sync().await;
        inner.record_op("update");
        Ok((updated, false))
    }

    async fn delete(
        &self,
        ctx: &RequestContext,
        name: &str,
        validate: Option<&Validator<O>>,
    ) -> StorageResult<(O, bool)> {
        self.inner.do_delete(ctx, name, validate, true).await
    }

    async fn delete_collection(
        &self,
        ctx: &RequestContext,
        validate: Option<&Validator<O>>,
        options: &ListOptions,
    ) -> StorageResult<Vec<O>> {
        let matching = self.list(ctx, options).await?;
        let mut deleted = Vec::with_capacity(matching.len());
        for obj in matching {
            // Per-delete cache-sync waits are suppressed here; one delayed
            // observation at the end is enough for a follow-up list.
            match self
                .inner
                .do_delete(ctx, obj.name(), validate, false)
                .await
            {
                Ok((obj, _)) => deleted.push(obj),
                Err(StorageError::NotFound { .. }) => {}
                Err(err) => return Err(err),
            }
        }
        self.inner.wait_for_cache_sync().await;
        Ok(deleted)
    }

    async fn watch(
        &self,
        ctx: &RequestContext,
        options: &ListOptions,
    ) -> StorageResult<WatchStream<O>> {
        let inner = &self.inner;
        inner.start_background();
        let predicate = build_predicate(options, &inner.attrs)?;
        let snapshot = self.list(ctx, options).await?;
        let (pending, stream) =
            inner
                .hub
                .subscribe(ctx.namespace.clone(), predicate, NACOS_WATCH_BUFFER);
        if snapshot.len() <= NACOS_WATCH_BUFFER {
            // The buffer holds the whole snapshot, so replay cannot block
            // and the watcher is registered before this call returns.
            for obj in snapshot {
                if !pending.replay(Event::added(obj)).await {
                    return Ok(stream);
                }
            }
            pending.register();
        } else {
            tokio::spawn(async move {
                for obj in snapshot {
                    if !pending.replay(Event::added(obj)).await {
                        return;
                    }
                }
                pending.register();
            });
        }
        Ok(stream)
    }

    fn destroy(&self) {
        let inner = &self.inner;
        let tasks: Vec<JoinHandle<()>> = {
            let mut tasks = inner.tasks.lock().expect("tasks lock");
            tasks.drain(..).collect()
        };
        for task in tasks {
            task.abort();
        }
        inner.hub.clear();

        // Subscriptions are cancelled asynchronously; the client outlives
        // the store handle.
        let client = Arc::clone(&inner.client);
        let names_data_id = inner.names_data_id.clone();
        let known = match inner.known.try_lock() {
            Ok(known) => known.values().cloned().collect::<Vec<_>>(),
            Err(_) => Vec::new(),
        };
        tokio::spawn(async move {
            client.cancel_listen(&names_data_id, DEFAULT_GROUP).await;
            for item in known {
                client.cancel_listen(&item.data_id, &item.group).await;
            }
        });
    }
}
