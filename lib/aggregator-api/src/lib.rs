//! Resource types for the aggregated API registration controller
//!
//! This library exposes the two watched collections:
//! - APIService: a registration routing an API group/version to a backend
//! - Service: the backing network service supplying the reachable address
//!
//! Both are the upstream `k8s-openapi` types. The helpers here derive the
//! pieces the controller cares about: the backend reference identity, the
//! service type classification and the `Available` condition.

pub mod condition;
pub mod service;

pub use condition::{is_available, is_condition_true, AVAILABLE};
pub use service::{ServiceRef, ServiceType};

pub use k8s_openapi::api::core::v1::{Service, ServiceSpec};
pub use k8s_openapi::kube_aggregator::pkg::apis::apiregistration::v1::{
    APIService, APIServiceCondition, APIServiceSpec, APIServiceStatus, ServiceReference,
};

