//! Resource registration and backend selection.
//!
//! # Purpose
//! For each managed kind, a registration supplies the resource identity, a
//! codec, an attribute extractor and a sensitivity flag; the factory builds
//! a [`Storage`] of the configured backend and wraps it in the object-safe
//! [`DynStorage`] the HTTP glue dispatches on. The backend variant is chosen
//! once at construction; the typed stores never branch on it again.

use crate::nacos::ConfigClient;
use crate::store::file::FileStore;
use crate::store::nacos::{NacosSettings, NacosStore};
use crate::store::{Storage, Updater, WatchStream};
use async_trait::async_trait;
use futures::stream::BoxStream;
use futures::StreamExt;
use k8s_openapi::api::admissionregistration::v1::{
    MutatingWebhookConfiguration, ValidatingWebhookConfiguration,
};
use k8s_openapi::api::core::v1::{ConfigMap, Endpoints, Namespace, Node, Pod, Secret, Service};
use k8s_openapi::api::networking::v1::{Ingress, IngressClass};
use osprey_codec::{Codec, FlatIngressCodec, YamlCodec};
use osprey_crypto::PayloadCipher;
use osprey_kube::selector::{cluster_scoped_attrs, namespace_scoped_attrs, AttrFn};
use osprey_kube::{
    DynamicObject, KubeObject, ListOptions, RequestContext, ResourceInfo, StorageError,
    StorageResult,
};
use serde_json::Value;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

/// Which persistence engine backs every registered kind.
pub enum StorageBackend {
    File {
        root: PathBuf,
    },
    Nacos {
        client: Arc<dyn ConfigClient>,
        encryption_key: Option<Vec<u8>>,
        settings: NacosSettings,
    },
}

/// Object-safe storage surface the HTTP glue dispatches on; payloads cross
/// this boundary as JSON values.
#[async_trait]
pub trait DynStorage: Send + Sync {
    fn info(&self) -> &ResourceInfo;

    async fn get(&self, ctx: &RequestContext, name: &str) -> StorageResult<Value>;
    async fn list(&self, ctx: &RequestContext, options: &ListOptions) -> StorageResult<Value>;
    async fn create(&self, ctx: &RequestContext, body: Value) -> StorageResult<Value>;
    async fn update(
        &self,
        ctx: &RequestContext,
        name: &str,
        body: Value,
    ) -> StorageResult<(Value, bool)>;
    async fn delete(&self, ctx: &RequestContext, name: &str) -> StorageResult<Value>;
    async fn delete_collection(
        &self,
        ctx: &RequestContext,
        options: &ListOptions,
    ) -> StorageResult<Value>;
    async fn watch(
        &self,
        ctx: &RequestContext,
        options: &ListOptions,
    ) -> StorageResult<BoxStream<'static, osprey_kube::Event<Value>>>;
    fn destroy(&self);
}

/// Typed-to-dynamic adapter around one [`Storage`] instance.
struct TypedStorage<O: KubeObject> {
    storage: Arc<dyn Storage<O>>,
}

impl<O: KubeObject> TypedStorage<O> {
    fn decode(&self, body: Value) -> StorageResult<O> {
        serde_json::from_value(body)
            .map_err(|err| StorageError::BadRequest(format!("invalid object payload: {err}")))
    }

    fn encode(&self, obj: &O) -> StorageResult<Value> {
        serde_json::to_value(obj).map_err(|err| StorageError::Internal(err.into()))
    }

    fn list_document(&self, items: Vec<O>) -> StorageResult<Value> {
        let info = self.storage.resource_info();
        let items = items
            .iter()
            .map(|obj| self.encode(obj))
            .collect::<StorageResult<Vec<_>>>()?;
        Ok(serde_json::json!({
            "apiVersion": info.api_version(),
            "kind": info.list_kind(),
            "metadata": {},
            "items": items,
        }))
    }
}

#[async_trait]
impl<O: KubeObject> DynStorage for TypedStorage<O> {
    fn info(&self) -> &ResourceInfo {
        self.storage.resource_info()
    }

    async fn get(&self, ctx: &RequestContext, name: &str) -> StorageResult<Value> {
        let obj = self.storage.get(ctx, name).await?;
        self.encode(&obj)
    }

    async fn list(&self, ctx: &RequestContext, options: &ListOptions) -> StorageResult<Value> {
        let items = self.storage.list(ctx, options).await?;
        self.list_document(items)
    }

    async fn create(&self, ctx: &RequestContext, body: Value) -> StorageResult<Value> {
        let obj = self.decode(body)?;
        let created = self.storage.create(ctx, obj, None).await?;
        self.encode(&created)
    }

    async fn update(
        &self,
        ctx: &RequestContext,
        name: &str,
        body: Value,
    ) -> StorageResult<(Value, bool)> {
        let obj = self.decode(body)?;
        if !obj.name().is_empty() && obj.name() != name {
            return Err(StorageError::BadRequest(format!(
                "object name {:?} does not match request path {name:?}",
                obj.name()
            )));
        }
        let updater: Updater<O> = Box::new(move |_current| Ok(obj));
        let (updated, created) = self
            .storage
            .update(ctx, name, updater, None, None, false)
            .await?;
        Ok((self.encode(&updated)?, created))
    }

    async fn delete(&self, ctx: &RequestContext, name: &str) -> StorageResult<Value> {
        let (deleted, _) = self.storage.delete(ctx, name, None).await?;
        self.encode(&deleted)
    }

    async fn delete_collection(
        &self,
        ctx: &RequestContext,
        options: &ListOptions,
    ) -> StorageResult<Value> {
        let deleted = self.storage.delete_collection(ctx, None, options).await?;
        self.list_document(deleted)
    }

    async fn watch(
        &self,
        ctx: &RequestContext,
        options: &ListOptions,
    ) -> StorageResult<BoxStream<'static, osprey_kube::Event<Value>>> {
        let stream: WatchStream<O> = self.storage.watch(ctx, options).await?;
        let mapped = stream.filter_map(|event| async move {
            match serde_json::to_value(&event.object) {
                Ok(object) => Some(osprey_kube::Event {
                    event_type: event.event_type,
                    object,
                }),
                Err(err) => {
                    tracing::error!(error = %err, "failed to encode watch event");
                    None
                }
            }
        });
        Ok(mapped.boxed())
    }

    fn destroy(&self) {
        self.storage.destroy();
    }
}

/// Read-only surface for the embedded CRD catalog: lists are empty and every
/// mutation is rejected.
struct ImmutableCollection {
    info: ResourceInfo,
}

impl ImmutableCollection {
    fn reject<T>(&self) -> StorageResult<T> {
        Err(StorageError::ServiceUnavailable(format!(
            "{} is a read-only collection",
            self.info.plural
        )))
    }
}

#[async_trait]
impl DynStorage for ImmutableCollection {
    fn info(&self) -> &ResourceInfo {
        &self.info
    }

    async fn get(&self, _ctx: &RequestContext, name: &str) -> StorageResult<Value> {
        Err(StorageError::not_found(&self.info.group_resource(), name))
    }

    async fn list(&self, _ctx: &RequestContext, _options: &ListOptions) -> StorageResult<Value> {
        Ok(serde_json::json!({
            "apiVersion": self.info.api_version(),
            "kind": self.info.list_kind(),
            "metadata": {},
            "items": [],
        }))
    }

    async fn create(&self, _ctx: &RequestContext, _body: Value) -> StorageResult<Value> {
        self.reject()
    }

    async fn update(
        &self,
        _ctx: &RequestContext,
        _name: &str,
        _body: Value,
    ) -> StorageResult<(Value, bool)> {
        self.reject()
    }

    async fn delete(&self, _ctx: &RequestContext, _name: &str) -> StorageResult<Value> {
        self.reject()
    }

    async fn delete_collection(
        &self,
        _ctx: &RequestContext,
        _options: &ListOptions,
    ) -> StorageResult<Value> {
        self.reject()
    }

    async fn watch(
        &self,
        _ctx: &RequestContext,
        _options: &ListOptions,
    ) -> StorageResult<BoxStream<'static, osprey_kube::Event<Value>>> {
        Ok(futures::stream::pending().boxed())
    }

    fn destroy(&self) {}
}

/// All registered storages, keyed by (group, version, plural).
pub struct Registry {
    entries: HashMap<(String, String, String), Arc<dyn DynStorage>>,
}

impl Registry {
    pub fn get(&self, group: &str, version: &str, plural: &str) -> Option<Arc<dyn DynStorage>> {
        self.entries
            .get(&(group.to_string(), version.to_string(), plural.to_string()))
            .cloned()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<dyn DynStorage>> {
        self.entries.values()
    }

    /// Distinct (group, version) pairs for discovery documents.
    pub fn group_versions(&self) -> Vec<(String, String)> {
        let mut pairs: Vec<(String, String)> = self
            .entries
            .keys()
            .map(|(group, version, _)| (group.clone(), version.clone()))
            .collect();
        pairs.sort();
        pairs.dedup();
        pairs
    }

    pub fn destroy_all(&self) {
        for storage in self.entries.values() {
            storage.destroy();
        }
    }
}

fn resource_info(
    group: &str,
    version: &str,
    kind: &str,
    singular: &str,
    plural: &str,
    namespaced: bool,
) -> ResourceInfo {
    ResourceInfo {
        group: group.to_string(),
        version: version.to_string(),
        kind: kind.to_string(),
        singular: singular.to_string(),
        plural: plural.to_string(),
        namespaced,
    }
}

/// Builds one kind's storage on the configured backend. The flat Ingress
/// codec only applies to the file backend, so the codec is supplied per
/// backend variant.
fn make_storage<O: KubeObject>(
    backend: &StorageBackend,
    info: ResourceInfo,
    file_codec: Box<dyn Codec<O>>,
    nacos_codec: Box<dyn Codec<O>>,
    attrs: AttrFn<O>,
    sensitive: bool,
) -> anyhow::Result<Arc<dyn DynStorage>> {
    let storage: Arc<dyn Storage<O>> = match backend {
        StorageBackend::File { root } => {
            Arc::new(FileStore::new(info, file_codec, root, attrs)?)
        }
        StorageBackend::Nacos {
            client,
            encryption_key,
            settings,
        } => {
            let cipher = match (sensitive, encryption_key) {
                (true, Some(key)) => Some(PayloadCipher::new(key)?),
                _ => None,
            };
            Arc::new(NacosStore::new(
                info,
                nacos_codec,
                Arc::clone(client),
                attrs,
                cipher,
                settings.clone(),
            ))
        }
    };
    Ok(Arc::new(TypedStorage { storage }))
}

fn register<O: KubeObject>(
    entries: &mut HashMap<(String, String, String), Arc<dyn DynStorage>>,
    backend: &StorageBackend,
    info: ResourceInfo,
    attrs: AttrFn<O>,
    sensitive: bool,
) -> anyhow::Result<()> {
    let key = (info.group.clone(), info.version.clone(), info.plural.clone());
    let storage = make_storage::<O>(
        backend,
        info,
        Box::new(YamlCodec::new()),
        Box::new(YamlCodec::new()),
        attrs,
        sensitive,
    )?;
    entries.insert(key, storage);
    Ok(())
}

fn default_attrs<O: KubeObject>(namespaced: bool) -> AttrFn<O> {
    if namespaced {
        namespace_scoped_attrs::<O>()
    } else {
        cluster_scoped_attrs::<O>()
    }
}

/// Attribute extractor for Secret: the namespaced defaults plus `type`,
/// which Secret exposes as a field selector.
pub fn secret_attrs() -> AttrFn<Secret> {
    let base = namespace_scoped_attrs::<Secret>();
    Arc::new(move |secret: &Secret| {
        let mut attrs = base(secret);
        attrs.fields.insert(
            "type".to_string(),
            secret.type_.clone().unwrap_or_default(),
        );
        attrs
    })
}

/// Registers every kind the gateway control plane consumes.
pub fn build_registry(backend: &StorageBackend) -> anyhow::Result<Registry> {
    let mut entries = HashMap::new();

    register::<ConfigMap>(
        &mut entries,
        backend,
        resource_info("", "v1", "ConfigMap", "configmap", "configmaps", true),
        default_attrs(true),
        false,
    )?;
    register::<Secret>(
        &mut entries,
        backend,
        resource_info("", "v1", "Secret", "secret", "secrets", true),
        secret_attrs(),
        true,
    )?;
    register::<Service>(
        &mut entries,
        backend,
        resource_info("", "v1", "Service", "service", "services", true),
        default_attrs(true),
        false,
    )?;
    register::<Endpoints>(
        &mut entries,
        backend,
        resource_info("", "v1", "Endpoints", "endpoints", "endpoints", true),
        default_attrs(true),
        false,
    )?;
    register::<Pod>(
        &mut entries,
        backend,
        resource_info("", "v1", "Pod", "pod", "pods", true),
        default_attrs(true),
        false,
    )?;
    register::<Node>(
        &mut entries,
        backend,
        resource_info("", "v1", "Node", "node", "nodes", false),
        default_attrs(false),
        false,
    )?;
    register::<Namespace>(
        &mut entries,
        backend,
        resource_info("", "v1", "Namespace", "namespace", "namespaces", false),
        default_attrs(false),
        false,
    )?;

    // Ingress keeps the standard codec on the remote backend but uses the
    // flat on-disk form in the file backend.
    let ingress_info = resource_info(
        "networking.k8s.io",
        "v1",
        "Ingress",
        "ingress",
        "ingresses",
        true,
    );
    let ingress_key = (
        ingress_info.group.clone(),
        ingress_info.version.clone(),
        ingress_info.plural.clone(),
    );
    let ingress_storage = make_storage::<Ingress>(
        backend,
        ingress_info,
        Box::new(FlatIngressCodec::new()),
        Box::new(YamlCodec::new()),
        default_attrs(true),
        false,
    )?;
    entries.insert(ingress_key, ingress_storage);

    register::<IngressClass>(
        &mut entries,
        backend,
        resource_info(
            "networking.k8s.io",
            "v1",
            "IngressClass",
            "ingressclass",
            "ingressclasses",
            false,
        ),
        default_attrs(false),
        false,
    )?;
    register::<MutatingWebhookConfiguration>(
        &mut entries,
        backend,
        resource_info(
            "admissionregistration.k8s.io",
            "v1",
            "MutatingWebhookConfiguration",
            "mutatingwebhookconfiguration",
            "mutatingwebhookconfigurations",
            false,
        ),
        default_attrs(false),
        false,
    )?;
    register::<ValidatingWebhookConfiguration>(
        &mut entries,
        backend,
        resource_info(
            "admissionregistration.k8s.io",
            "v1",
            "ValidatingWebhookConfiguration",
            "validatingwebhookconfiguration",
            "validatingwebhookconfigurations",
            false,
        ),
        default_attrs(false),
        false,
    )?;

    // Gateway-api kinds have no generated types; they are carried as
    // dynamic objects.
    register::<DynamicObject>(
        &mut entries,
        backend,
        resource_info(
            "gateway.networking.k8s.io",
            "v1",
            "GatewayClass",
            "gatewayclass",
            "gatewayclasses",
            false,
        ),
        default_attrs(false),
        false,
    )?;
    register::<DynamicObject>(
        &mut entries,
        backend,
        resource_info(
            "gateway.networking.k8s.io",
            "v1",
            "Gateway",
            "gateway",
            "gateways",
            true,
        ),
        default_attrs(true),
        false,
    )?;
    register::<DynamicObject>(
        &mut entries,
        backend,
        resource_info(
            "gateway.networking.k8s.io",
            "v1",
            "HTTPRoute",
            "httproute",
            "httproutes",
            true,
        ),
        default_attrs(true),
        false,
    )?;

    // The embedded CRD catalog is served read-only; clients may list it but
    // never mutate it.
    let crd_info = resource_info(
        "apiextensions.k8s.io",
        "v1",
        "CustomResourceDefinition",
        "customresourcedefinition",
        "customresourcedefinitions",
        false,
    );
    entries.insert(
        (
            crd_info.group.clone(),
            crd_info.version.clone(),
            crd_info.plural.clone(),
        ),
        Arc::new(ImmutableCollection { info: crd_info }),
    );

    Ok(Registry { entries })
}
