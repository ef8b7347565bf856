//! File-backed storage: one YAML file per object.
//!
//! # Layout
//! `<root>/<lowercased plural>/<name>.yaml`. Namespaces are flattened out of
//! the path; the backend manages a single namespace for namespaced kinds and
//! re-asserts it on every read.
//!
//! # Write protocol
//! Writes are staged through `<name>.yaml.tmp` created with
//! `O_CREATE|O_EXCL`, then renamed over the final path. An existing temp
//! file younger than a 5 s TTL means another writer is mid-flight and the
//! write conflicts; an older one is leftover debris, removed, and the write
//! retried once.
//!
//! # Change detection
//! A `notify` observer feeds create/write events into a pending map and
//! remove/rename events into immediate `Deleted` emissions. A 100 ms ticker
//! decodes pending paths that have gone quiet for a full interval, compares
//! them against a decoded-content cache and emits `Added`/`Modified`.
//! Writes performed through this store land in the cache first, so the
//! observer's echo of our own write decodes equal and produces no second
//! event.

use super::watch::{WatcherHub, WatchStream};
use super::{
    build_predicate, content_hash, creation_timestamp_now, Storage, UpdateValidator, Updater,
    Validator, DEFAULT_NAMESPACE,
};
use anyhow::Context as _;
use async_trait::async_trait;
use notify::event::{ModifyKind, RenameMode};
use notify::{EventKind, RecommendedWatcher, RecursiveMode, Watcher as _};
use osprey_codec::Codec;
use osprey_kube::object::normalize_object_meta;
use osprey_kube::selector::AttrFn;
use osprey_kube::{
    Event, KubeObject, ListOptions, RequestContext, ResourceInfo, StorageError, StorageResult,
};
use std::collections::HashMap;
use std::fs;
use std::io::Write as _;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

const FILE_CHANGE_PROCESS_INTERVAL: Duration = Duration::from_millis(100);
const TMP_FILE_TTL: Duration = Duration::from_secs(5);
const FILE_WATCH_BUFFER: usize = 10;
const OBJECT_EXTENSION: &str = "yaml";

struct FileState<O> {
    pending: HashMap<PathBuf, Instant>,
    cache: HashMap<PathBuf, O>,
}

struct FileInner<O: KubeObject> {
    info: ResourceInfo,
    codec: Box<dyn Codec<O>>,
    root: PathBuf,
    attrs: AttrFn<O>,
    hub: WatcherHub<O>,
    state: Mutex<FileState<O>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    observer: Mutex<Option<RecommendedWatcher>>,
}

/// File-backed [`Storage`] for one resource kind.
pub struct FileStore<O: KubeObject> {
    inner: Arc<FileInner<O>>,
}

impl<O: KubeObject> FileStore<O> {
    /// Creates the kind directory if missing, primes the content cache from
    /// the files already present, and starts the observer and ticker.
    pub fn new(
        info: ResourceInfo,
        codec: Box<dyn Codec<O>>,
        root_dir: &Path,
        attrs: AttrFn<O>,
    ) -> anyhow::Result<Self> {
        let root = root_dir.join(info.plural.to_lowercase());
        fs::create_dir_all(&root)
            .with_context(|| format!("unable to create data dir {}", root.display()))?;

        let inner = Arc::new(FileInner {
            hub: WatcherHub::new(&info.plural),
            info,
            codec,
            root,
            attrs,
            state: Mutex::new(FileState {
                pending: HashMap::new(),
                cache: HashMap::new(),
            }),
            tasks: Mutex::new(Vec::new()),
            observer: Mutex::new(None),
        });

        // Prime the cache so pre-existing files produce no startup events
        // and external deletions can still carry the last decoded object.
        let primed = inner
            .visit_dir()
            .map_err(|err| anyhow::anyhow!("failed to sync file cache: {err}"))?;
        {
            let mut state = inner.state.lock().expect("file state lock");
            for (path, obj) in primed {
                state.cache.insert(path, obj);
            }
        }

        let (tx, rx) = mpsc::unbounded_channel();
        let mut observer = notify::recommended_watcher(
            move |res: Result<notify::Event, notify::Error>| {
                let _ = tx.send(res);
            },
        )
        .with_context(|| "failed to create file observer")?;
        observer
            .watch(&inner.root, RecursiveMode::Recursive)
            .with_context(|| format!("unable to watch data dir {}", inner.root.display()))?;
        *inner.observer.lock().expect("observer lock") = Some(observer);

        let event_inner = Arc::clone(&inner);
        let event_task = tokio::spawn(async move {
            let mut rx = rx;
            while let Some(res) = rx.recv().await {
                match res {
                    Ok(event) => event_inner.handle_fs_event(event).await,
                    Err(err) => {
                        tracing::warn!(error = %err, "file observer error");
                    }
                }
            }
        });

        let tick_inner = Arc::clone(&inner);
        let tick_task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(FILE_CHANGE_PROCESS_INTERVAL);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                tick_inner.process_pending_changes().await;
            }
        });

        {
            let mut tasks = inner.tasks.lock().expect("tasks lock");
            tasks.push(event_task);
            tasks.push(tick_task);
        }

        Ok(Self { inner })
    }
}

impl<O: KubeObject> FileInner<O> {
    fn namespace(&self) -> Option<&str> {
        if self.info.namespaced {
            Some(DEFAULT_NAMESPACE)
        } else {
            None
        }
    }

    fn object_path(&self, name: &str) -> PathBuf {
        self.root.join(format!("{name}.{OBJECT_EXTENSION}"))
    }

    fn name_from_path(path: &Path) -> String {
        path.file_stem()
            .map(|stem| stem.to_string_lossy().into_owned())
            .unwrap_or_default()
    }

    /// Reads and decodes one file. A missing file is `Ok(None)`; anything
    /// else that goes wrong is internal.
    fn read_path(&self, path: &Path) -> StorageResult<Option<O>> {
        match fs::metadata(path) {
            Ok(_) => {}
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(err) => {
                return Err(StorageError::Internal(anyhow::anyhow!(
                    "failed to stat file {}: {err}",
                    path.display()
                )))
            }
        }
        let payload = fs::read(path).map_err(|err| {
            StorageError::Internal(anyhow::anyhow!(
                "failed to read file {}: {err}",
                path.display()
            ))
        })?;
        let mut obj = self.codec.decode(&payload).map_err(|err| {
            StorageError::Internal(anyhow::anyhow!(
                "failed to decode file {}: {err}",
                path.display()
            ))
        })?;
        normalize_object_meta(&mut obj, self.namespace(), &Self::name_from_path(path));
        if !self.codec.carries_object_meta() {
            obj.set_resource_version(Some(content_hash(&payload)));
        }
        Ok(Some(obj))
    }

    /// The decoded form of a freshly written payload, exactly as a future
    /// read will see it. Cached so the observer's echo of our own write
    /// compares equal and emits nothing. This matters for codecs that drop
    /// metadata on encode: the round trip loses fields such as the creation
    /// timestamp.
    fn cached_form(&self, payload: &[u8], name: &str) -> StorageResult<O> {
        let mut obj = self.codec.decode(payload).map_err(|err| {
            StorageError::Internal(anyhow::anyhow!("failed to re-decode written payload: {err}"))
        })?;
        normalize_object_meta(&mut obj, self.namespace(), name);
        if !self.codec.carries_object_meta() {
            obj.set_resource_version(Some(content_hash(payload)));
        }
        Ok(obj)
    }

    /// Stages the payload through a temp file and renames it into place.
    /// Returns the bytes written so callers can hash them.
    fn write_object(&self, name: &str, obj: &O) -> StorageResult<Vec<u8>> {
        let path = self.object_path(name);
        let payload = self
            .codec
            .encode(obj)
            .map_err(|err| StorageError::Internal(anyhow::anyhow!("failed to encode: {err}")))?
            .into_bytes();

        let tmp_path = self.root.join(format!("{name}.{OBJECT_EXTENSION}.tmp"));
        let mut retried = false;
        loop {
            match self.write_temp_file(&tmp_path, &payload) {
                Ok(()) => break,
                Err(TempFileError::Busy) => {
                    let modified = fs::metadata(&tmp_path)
                        .and_then(|meta| meta.modified())
                        .ok();
                    let expired = modified
                        .and_then(|at| at.elapsed().ok())
                        .is_some_and(|age| age > TMP_FILE_TTL);
                    if !expired {
                        return Err(StorageError::conflict(
                            &self.info.group_resource(),
                            name,
                            "file is being processed",
                        ));
                    }
                    tracing::info!(path = %tmp_path.display(), "removing expired temp file");
                    if let Err(err) = fs::remove_file(&tmp_path) {
                        return Err(StorageError::Internal(anyhow::anyhow!(
                            "failed to remove expired temp file {}: {err}",
                            tmp_path.display()
                        )));
                    }
                    if retried {
                        return Err(StorageError::conflict(
                            &self.info.group_resource(),
                            name,
                            "file is being processed",
                        ));
                    }
                    retried = true;
                }
                Err(TempFileError::Io(err)) => {
                    return Err(StorageError::Internal(anyhow::anyhow!(
                        "failed to write temp file {}: {err}",
                        tmp_path.display()
                    )))
                }
            }
        }

        if let Err(err) = fs::rename(&tmp_path, &path) {
            let _ = fs::remove_file(&tmp_path);
            return Err(StorageError::Internal(anyhow::anyhow!(
                "failed to move {} into place: {err}",
                tmp_path.display()
            )));
        }
        Ok(payload)
    }

    fn write_temp_file(&self, tmp_path: &Path, payload: &[u8]) -> Result<(), TempFileError> {
        let mut options = fs::OpenOptions::new();
        options.write(true).create_new(true);
        #[cfg(unix)]
        {
            use std::os::unix::fs::OpenOptionsExt;
            options.mode(0o755);
        }
        let mut file = options.open(tmp_path).map_err(|err| {
            if err.kind() == std::io::ErrorKind::AlreadyExists {
                TempFileError::Busy
            } else {
                TempFileError::Io(err)
            }
        })?;
        file.write_all(payload).map_err(TempFileError::Io)
    }

    /// Decodes every object file under the kind directory.
    fn visit_dir(&self) -> StorageResult<Vec<(PathBuf, O)>> {
        let entries = fs::read_dir(&self.root).map_err(|err| {
            StorageError::Internal(anyhow::anyhow!(
                "failed to read dir {}: {err}",
                self.root.display()
            ))
        })?;
        let mut objects = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|err| StorageError::Internal(err.into()))?;
            let path = entry.path();
            if !path.is_file() || path.extension().and_then(|ext| ext.to_str()) != Some(OBJECT_EXTENSION)
            {
                continue;
            }
            if let Some(obj) = self.read_path(&path)? {
                objects.push((path, obj));
            }
        }
        Ok(objects)
    }

    async fn handle_fs_event(&self, event: notify::Event) {
        for path in &event.paths {
            if path.extension().and_then(|ext| ext.to_str()) != Some(OBJECT_EXTENSION) {
                continue;
            }
            match event.kind {
                EventKind::Remove(_) | EventKind::Modify(ModifyKind::Name(RenameMode::From)) => {
                    self.handle_removed(path).await;
                }
                EventKind::Create(_) | EventKind::Modify(_) => {
                    let mut state = self.state.lock().expect("file state lock");
                    state.pending.insert(path.clone(), Instant::now());
                }
                _ => {}
            }
        }
    }

    async fn handle_removed(&self, path: &Path) {
        let cached = {
            let mut state = self.state.lock().expect("file state lock");
            state.pending.remove(path);
            state.cache.remove(path)
        };
        if let Some(obj) = cached {
            self.hub.broadcast(Event::deleted(obj)).await;
        }
    }

    /// One ticker pass: decode pending paths that have been quiet for a full
    /// interval and emit the resulting events. A burst of writes to the same
    /// path coalesces into one event, and a path that decodes equal to the
    /// cache (our own write echoed back) emits nothing.
    async fn process_pending_changes(&self) {
        let due: Vec<PathBuf> = {
            let mut state = self.state.lock().expect("file state lock");
            let now = Instant::now();
            let (ready, waiting): (Vec<_>, Vec<_>) = state
                .pending
                .drain()
                .partition(|(_, at)| now.duration_since(*at) >= FILE_CHANGE_PROCESS_INTERVAL);
            state.pending.extend(waiting);
            ready.into_iter().map(|(path, _)| path).collect()
        };

        for path in due {
            let obj = match self.read_path(&path) {
                Ok(Some(obj)) => obj,
                Ok(None) => continue,
                Err(err) => {
                    tracing::debug!(path = %path.display(), error = %err, "skipping unreadable pending file");
                    continue;
                }
            };
            let event = {
                let mut state = self.state.lock().expect("file state lock");
                match state.cache.get(&path) {
                    Some(cached) if *cached == obj => None,
                    Some(_) => {
                        state.cache.insert(path.clone(), obj.clone());
                        Some(Event::modified(obj))
                    }
                    None => {
                        state.cache.insert(path.clone(), obj.clone());
                        Some(Event::added(obj))
                    }
                }
            };
            if let Some(event) = event {
                self.hub.broadcast(event).await;
            }
        }
    }

    fn record_op(&self, op: &'static str) {
        metrics::counter!(
            "osprey_storage_ops_total",
            "backend" => "file",
            "kind" => self.info.plural.clone(),
            "op" => op,
        )
        .increment(1);
    }
}

enum TempFileError {
    /// The temp file already exists: another writer is mid-flight.
    Busy,
    Io(std::io::Error),
}

#[async_trait]
impl<O: KubeObject> Storage<O> for FileStore<O> {
    fn resource_info(&self) -> &ResourceInfo {
        &self.inner.info
    }

    async fn get(&self, _ctx: &RequestContext, name: &str) -> StorageResult<O> {
        let inner = &self.inner;
        match inner.read_path(&inner.object_path(name))? {
            Some(obj) => Ok(obj),
            None => Err(StorageError::not_found(&inner.info.group_resource(), name)),
        }
    }

    async fn list(&self, _ctx: &RequestContext, options: &ListOptions) -> StorageResult<Vec<O>> {
        let inner = &self.inner;
        let predicate = build_predicate(options, &inner.attrs)?;
        let items: Vec<O> = inner
            .visit_dir()?
            .into_iter()
            .map(|(_, obj)| obj)
            .filter(|obj| predicate.matches(obj))
            .collect();
        tracing::debug!(kind = %inner.info.plural, count = items.len(), "list");
        inner.record_op("list");
        Ok(items)
    }

    async fn create(
        &self,
        _ctx: &RequestContext,
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
        let path = inner.object_path(&name);
        if path.exists() {
            return Err(StorageError::already_exists(
                &inner.info.group_resource(),
                &name,
            ));
        }

        normalize_object_meta(&mut obj, inner.namespace(), &name);
        obj.metadata_mut().creation_timestamp = Some(creation_timestamp_now());
        if inner.codec.carries_object_meta() {
            obj.set_resource_version(Some("1".to_string()));
        } else {
            obj.set_resource_version(None);
        }

        let payload = inner.write_object(&name, &obj)?;
        if !inner.codec.carries_object_meta() {
            obj.set_resource_version(Some(content_hash(&payload)));
        }
        let cached = inner.cached_form(&payload, &name)?;
        {
            let mut state = inner.state.lock().expect("file state lock");
            state.cache.insert(path, cached);
        }
        inner.hub.broadcast(Event::added(obj.clone())).await;
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
        let current = inner.read_path(&inner.object_path(name))?;

        let old = match current {
            Some(old) => old,
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
        if !supplied_version.is_empty()
            && !current_version.is_empty()
            && supplied_version != current_version
        {
            return Err(StorageError::conflict(
                &inner.info.group_resource(),
                name,
                "resource version mismatch",
            ));
        }

        normalize_object_meta(&mut updated, inner.namespace(), name);
        if inner.codec.carries_object_meta() {
            let next_version = if current_version.is_empty() {
                1
            } else {
                current_version
                    .parse::<u64>()
                    .map_err(|err| {
                        StorageError::Internal(anyhow::anyhow!(
                            "stored resource version {current_version:?} is not an integer: {err}"
                        ))
                    })?
                    + 1
            };
            updated.set_resource_version(Some(next_version.to_string()));
        } else {
            updated.set_resource_version(None);
        }

        let payload = inner.write_object(name, &updated)?;
        if !inner.codec.carries_object_meta() {
            updated.set_resource_version(Some(content_hash(&payload)));
        }
        let cached = inner.cached_form(&payload, name)?;
        {
            let mut state = inner.state.lock().expect("file state lock");
            state.cache.insert(inner.object_path(name), cached);
        }
        inner.hub.broadcast(Event::modified(updated.clone())).await;
        inner.record_op("update");
        Ok((updated, false))
    }

    async fn delete(
        &self,
        ctx: &RequestContext,
        name: &str,
        validate: Option<&Validator<O>>,
    ) -> StorageResult<(O, bool)> {
        let inner = &self.inner;
        let path = inner.object_path(name);
        if !path.exists() {
            return Err(StorageError::not_found(&inner.info.group_resource(), name));
        }
        let old = self.get(ctx, name).await?;
        if let Some(validate) = validate {
            validate(&old).map_err(StorageError::BadRequest)?;
        }
        fs::remove_file(&path).map_err(|err| {
            StorageError::Internal(anyhow::anyhow!(
                "failed to remove {}: {err}",
                path.display()
            ))
        })?;
        {
            let mut state = inner.state.lock().expect("file state lock");
            state.cache.remove(&path);
            state.pending.remove(&path);
        }
        inner.hub.broadcast(Event::deleted(old.clone())).await;
        inner.record_op("delete");
        Ok((old, true))
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
            match self.delete(ctx, obj.name(), validate).await {
                Ok((obj, _)) => deleted.push(obj),
                // Lost a race with an external deletion; the record is gone
                // either way.
                Err(StorageError::NotFound { .. }) => {}
                Err(err) => return Err(err),
            }
        }
        Ok(deleted)
    }

    async fn watch(
        &self,
        ctx: &RequestContext,
        options: &ListOptions,
    ) -> StorageResult<WatchStream<O>> {
        let inner = &self.inner;
        let predicate = build_predicate(options, &inner.attrs)?;
        let snapshot = self.list(ctx, options).await?;
        let (pending, stream) =
            inner
                .hub
                .subscribe(ctx.namespace.clone(), predicate, FILE_WATCH_BUFFER);
        if snapshot.len() <= FILE_WATCH_BUFFER {
            // The buffer holds the whole snapshot, so replay cannot block
            // and the watcher is registered before this call returns.
            for obj in snapshot {
                if !pending.replay(Event::added(obj)).await {
                    return Ok(stream);
                }
            }
            pending.register();
        } else {
            // Oversized snapshots drain as the consumer reads; the watcher
            // joins the fan-out map once the replay is fully enqueued.
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
        if let Some(observer) = inner.observer.lock().expect("observer lock").take() {
            drop(observer);
        }
        let tasks: Vec<JoinHandle<()>> = {
            let mut tasks = inner.tasks.lock().expect("tasks lock");
            tasks.drain(..).collect()
        };
        for task in tasks {
            task.abort();
        }
        inner.hub.clear();
    }
}
