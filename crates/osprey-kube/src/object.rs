//! Uniform object access for typed and dynamic Kubernetes resources.
//!
//! # Purpose
//! The backends mutate and inspect object metadata without knowing the
//! concrete kind. [`KubeObject`] is that seam: `k8s-openapi` types opt in via
//! [`impl_kube_object!`], and kinds without generated types (gateway-api)
//! are carried as [`DynamicObject`].

use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Object trait every stored kind implements.
///
/// The only required surface is metadata access; the helpers derive from it.
/// `PartialEq` lets the file backend tell a real external edit from the echo
/// of its own write.
pub trait KubeObject:
    Clone + fmt::Debug + PartialEq + Serialize + DeserializeOwned + Send + Sync + 'static
{
    fn metadata(&self) -> &ObjectMeta;
    fn metadata_mut(&mut self) -> &mut ObjectMeta;

    fn name(&self) -> &str {
        self.metadata().name.as_deref().unwrap_or("")
    }

    fn namespace(&self) -> &str {
        self.metadata().namespace.as_deref().unwrap_or("")
    }

    fn resource_version(&self) -> &str {
        self.metadata().resource_version.as_deref().unwrap_or("")
    }

    fn set_resource_version(&mut self, version: Option<String>) {
        self.metadata_mut().resource_version = version.filter(|v| !v.is_empty());
    }

    fn labels(&self) -> BTreeMap<String, String> {
        self.metadata().labels.clone().unwrap_or_default()
    }
}

/// Implements [`KubeObject`] for types carrying a `metadata: ObjectMeta`
/// field, which is every generated `k8s-openapi` resource.
#[macro_export]
macro_rules! impl_kube_object {
    ($($ty:ty),+ $(,)?) => {
        $(
            impl $crate::object::KubeObject for $ty {
                fn metadata(&self) -> &k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta {
                    &self.metadata
                }

                fn metadata_mut(&mut self) -> &mut k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta {
                    &mut self.metadata
                }
            }
        )+
    };
}

impl_kube_object!(
    k8s_openapi::api::core::v1::ConfigMap,
    k8s_openapi::api::core::v1::Secret,
    k8s_openapi::api::core::v1::Service,
    k8s_openapi::api::core::v1::Endpoints,
    k8s_openapi::api::core::v1::Pod,
    k8s_openapi::api::core::v1::Node,
    k8s_openapi::api::core::v1::Namespace,
    k8s_openapi::api::networking::v1::Ingress,
    k8s_openapi::api::networking::v1::IngressClass,
    k8s_openapi::api::admissionregistration::v1::MutatingWebhookConfiguration,
    k8s_openapi::api::admissionregistration::v1::ValidatingWebhookConfiguration,
);

/// Schema-less object for kinds without generated types.
///
/// `apiVersion`/`kind` are kept verbatim and everything besides `metadata`
/// stays in `data`, so round-tripping preserves unknown fields.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct DynamicObject {
    #[serde(rename = "apiVersion", default, skip_serializing_if = "String::is_empty")]
    pub api_version: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub kind: String,
    #[serde(default)]
    pub metadata: ObjectMeta,
    #[serde(flatten)]
    pub data: serde_json::Map<String, serde_json::Value>,
}

impl KubeObject for DynamicObject {
    fn metadata(&self) -> &ObjectMeta {
        &self.metadata
    }

    fn metadata_mut(&mut self) -> &mut ObjectMeta {
        &mut self.metadata
    }
}

/// Re-asserts namespace and name from the record key, overriding whatever the
/// payload claimed. Cluster-scoped kinds pass `None` and end up with no
/// namespace.
pub fn normalize_object_meta<O: KubeObject>(obj: &mut O, namespace: Option<&str>, name: &str) {
    let meta = obj.metadata_mut();
    meta.namespace = namespace.map(|ns| ns.to_string());
    meta.name = Some(name.to_string());
}
