//! Resource identity and request scoping.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Group + plural resource name, the identity an error or a storage instance
/// carries for one kind. The core group is the empty string.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct GroupResource {
    pub group: String,
    pub resource: String,
}

impl GroupResource {
    pub fn new(group: impl Into<String>, resource: impl Into<String>) -> Self {
        Self {
            group: group.into(),
            resource: resource.into(),
        }
    }
}

impl fmt::Display for GroupResource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.group.is_empty() {
            write!(f, "{}", self.resource)
        } else {
            write!(f, "{}.{}", self.resource, self.group)
        }
    }
}

/// Everything the registry knows about one managed kind.
#[derive(Clone, Debug)]
pub struct ResourceInfo {
    pub group: String,
    pub version: String,
    pub kind: String,
    pub singular: String,
    pub plural: String,
    pub namespaced: bool,
}

impl ResourceInfo {
    pub fn group_resource(&self) -> GroupResource {
        GroupResource::new(self.group.clone(), self.plural.clone())
    }

    pub fn api_version(&self) -> String {
        if self.group.is_empty() {
            self.version.clone()
        } else {
            format!("{}/{}", self.group, self.version)
        }
    }

    pub fn list_kind(&self) -> String {
        format!("{}List", self.kind)
    }
}

/// Per-request scope handed from the HTTP layer into the storage layer.
///
/// Only the namespace matters to the backends; an absent namespace means a
/// cluster-scoped request or an all-namespaces list.
#[derive(Clone, Debug, Default)]
pub struct RequestContext {
    pub namespace: Option<String>,
}

impl RequestContext {
    pub fn namespaced(namespace: impl Into<String>) -> Self {
        Self {
            namespace: Some(namespace.into()),
        }
    }

    pub fn cluster() -> Self {
        Self { namespace: None }
    }

    pub fn namespace(&self) -> &str {
        self.namespace.as_deref().unwrap_or("")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn group_resource_display() {
        assert_eq!(GroupResource::new("", "secrets").to_string(), "secrets");
        assert_eq!(
            GroupResource::new("networking.k8s.io", "ingresses").to_string(),
            "ingresses.networking.k8s.io"
        );
    }

    #[test]
    fn api_version_for_core_and_named_groups() {
        let core = ResourceInfo {
            group: String::new(),
            version: "v1".to_string(),
            kind: "ConfigMap".to_string(),
            singular: "configmap".to_string(),
            plural: "configmaps".to_string(),
            namespaced: true,
        };
        assert_eq!(core.api_version(), "v1");
        assert_eq!(core.list_kind(), "ConfigMapList");

        let grouped = ResourceInfo {
            group: "networking.k8s.io".to_string(),
            version: "v1".to_string(),
            kind: "Ingress".to_string(),
            singular: "ingress".to_string(),
            plural: "ingresses".to_string(),
            namespaced: true,
        };
        assert_eq!(grouped.api_version(), "networking.k8s.io/v1");
    }
}
