//! Backing service identity and classification

use crate::{APIService, Service};
use kube::ResourceExt;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Identity of the Service an APIService routes to
#[derive(Clone, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ServiceRef {
    /// Namespace of the Service
    pub namespace: String,
    /// Name of the Service
    pub name: String,
}

impl ServiceRef {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
        }
    }

    /// Backend reference of a registration, `None` for locally served groups
    pub fn from_api_service(api_service: &APIService) -> Option<Self> {
        let service = api_service.spec.as_ref()?.service.as_ref()?;
        Some(Self {
            namespace: service.namespace.clone().unwrap_or_default(),
            name: service.name.clone().unwrap_or_default(),
        })
    }

    /// Identity of a watched Service object
    pub fn from_service(service: &Service) -> Self {
        Self {
            namespace: service.namespace().unwrap_or_default(),
            name: service.name_any(),
        }
    }

    /// In-cluster DNS name: `<name>.<namespace>.svc`
    pub fn dns_name(&self) -> String {
        format!("{}.{}.svc", self.name, self.namespace)
    }
}

impl fmt::Display for ServiceRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

/// Kubernetes Service type
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ServiceType {
    ClusterIP,
    NodePort,
    LoadBalancer,
    ExternalName,
    Other(String),
}

impl ServiceType {
    /// Parse the `spec.type` field. An unset type is `ClusterIP`, as defaulted by the API server.
    pub fn from_spec(type_: Option<&str>) -> Self {
        match type_ {
            None | Some("ClusterIP") => ServiceType::ClusterIP,
            Some("NodePort") => ServiceType::NodePort,
            Some("LoadBalancer") => ServiceType::LoadBalancer,
            Some("ExternalName") => ServiceType::ExternalName,
            Some(other) => ServiceType::Other(other.to_string()),
        }
    }

    /// Type of a Service object
    pub fn of(service: &Service) -> Self {
        Self::from_spec(service.spec.as_ref().and_then(|s| s.type_.as_deref()))
    }

    /// Whether services of this type are reached through their cluster IP
    pub fn uses_cluster_ip(&self) -> bool {
        matches!(
            self,
            ServiceType::ClusterIP | ServiceType::NodePort | ServiceType::LoadBalancer
        )
    }
}
