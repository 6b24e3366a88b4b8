//! Destination resolution for APIService registrations

use crate::cache::ServiceLister;
use aggregator_api::{APIService, ServiceRef, ServiceType};
use tracing::{debug, warn};

/// Resolve the address requests for `api_service` should be sent to.
///
/// Registrations without a service reference are served locally and resolve
/// to an empty destination. Otherwise the cluster IP of the referenced
/// Service is used for ClusterIP, NodePort and LoadBalancer services, and the
/// `<name>.<namespace>.svc` DNS name in every other case, including when the
/// Service cannot be looked up. The result must not be cached: the Service
/// changes independently of the registration.
pub fn resolve_destination(api_service: &APIService, services: &dyn ServiceLister) -> String {
    let Some(service_ref) = ServiceRef::from_api_service(api_service) else {
        return String::new();
    };

    let dns_name = service_ref.dns_name();
    let service = match services.get(&service_ref.namespace, &service_ref.name) {
        Ok(Some(service)) => service,
        Ok(None) => {
            debug!("Service {} not found, using {}", service_ref, dns_name);
            return dns_name;
        }
        Err(e) => {
            warn!("Failed to look up service {}, using {}: {}", service_ref, dns_name, e);
            return dns_name;
        }
    };

    if !ServiceType::of(&service).uses_cluster_ip() {
        return dns_name;
    }

    // Headless or unassigned services have no routable cluster IP. Those go
    // by DNS name instead of handing back an empty string or "None".
    match service.spec.as_ref().and_then(|spec| spec.cluster_ip.as_deref()) {
        Some(ip) if !ip.is_empty() && ip != "None" => ip.to_string(),
        _ => {
            debug!("Service {} has no cluster IP, using {}", service_ref, dns_name);
            dns_name
        }
    }
}
