//! Flat on-disk form for Ingress objects.
//!
//! A flat document exposes only `labels`, `annotations`, `defaultBackend`,
//! `tls` and `rules` at the top level, with no Kubernetes envelope. Decoding
//! falls back to the inner codec when the input carries `apiVersion` and
//! `kind`, so standard manifests keep working next to flat ones.

use crate::{Codec, CodecError, YamlCodec};
use k8s_openapi::api::networking::v1::{
    Ingress, IngressBackend, IngressRule, IngressSpec, IngressTLS,
};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
struct FlatIngress {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    labels: Option<BTreeMap<String, String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    annotations: Option<BTreeMap<String, String>>,
    #[serde(rename = "defaultBackend", default, skip_serializing_if = "Option::is_none")]
    default_backend: Option<IngressBackend>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    tls: Option<Vec<IngressTLS>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    rules: Option<Vec<IngressRule>>,
}

impl FlatIngress {
    fn from_ingress(ingress: &Ingress) -> Self {
        let spec = ingress.spec.clone().unwrap_or_default();
        Self {
            labels: ingress.metadata.labels.clone(),
            annotations: ingress.metadata.annotations.clone(),
            default_backend: spec.default_backend,
            tls: spec.tls,
            rules: spec.rules,
        }
    }

    fn into_ingress(self) -> Ingress {
        let mut ingress = Ingress::default();
        ingress.metadata.labels = self.labels;
        ingress.metadata.annotations = self.annotations;
        ingress.spec = Some(IngressSpec {
            default_backend: self.default_backend,
            tls: self.tls,
            rules: self.rules,
            ..Default::default()
        });
        ingress
    }
}

/// `true` when the document carries both `apiVersion` and `kind`, i.e. it is
/// a standard manifest rather than a flat one.
fn has_api_version_and_kind(value: &serde_yaml::Value) -> bool {
    let mapping = match value {
        serde_yaml::Value::Mapping(mapping) => mapping,
        _ => return false,
    };
    let non_empty = |key: &str| {
        mapping
            .get(key)
            .and_then(|v| v.as_str())
            .is_some_and(|v| !v.is_empty())
    };
    non_empty("apiVersion") && non_empty("kind")
}

/// Codec decorator for `networking.k8s.io` Ingress in the file backend.
///
/// Encode always emits the flat form. Decode accepts both forms.
pub struct FlatIngressCodec {
    inner: YamlCodec<Ingress>,
}

impl FlatIngressCodec {
    pub fn new() -> Self {
        Self {
            inner: YamlCodec::new(),
        }
    }
}

impl Default for FlatIngressCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl Codec<Ingress> for FlatIngressCodec {
    fn encode(&self, obj: &Ingress) -> Result<String, CodecError> {
        Ok(serde_yaml::to_string(&FlatIngress::from_ingress(obj))?)
    }

    fn decode(&self, data: &[u8]) -> Result<Ingress, CodecError> {
        let value: serde_yaml::Value = serde_yaml::from_slice(data)?;
        if has_api_version_and_kind(&value) {
            return self.inner.decode(data);
        }
        let flat: FlatIngress = serde_yaml::from_value(value)?;
        Ok(flat.into_ingress())
    }

    fn carries_object_meta(&self) -> bool {
        false
    }
}
