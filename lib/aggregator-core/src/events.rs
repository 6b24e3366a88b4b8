//! Routing of watch notifications onto the registration queue.
//!
//! APIService changes enqueue their own name. Service changes enqueue every
//! APIService pointing at the Service.

use crate::cache::RegistrationLister;
use crate::controller::APIServiceRegistrationController;
use crate::informer::{Deleted, ResourceEventHandler};
use aggregator_api::{APIService, Service, ServiceRef};
use kube::ResourceExt;
use std::sync::Arc;
use tracing::{debug, error, warn};

impl APIServiceRegistrationController {
    /// APIServices routing to `service`.
    ///
    /// There aren't very many APIServices, so every Service change scans all
    /// of them. Revisit with an index keyed by service if that stops holding.
    pub(crate) fn api_services_for(&self, service: &ServiceRef) -> Vec<Arc<APIService>> {
        let api_services = match self.api_services().list() {
            Ok(api_services) => api_services,
            Err(e) => {
                warn!("Failed to list APIServices for service {}: {}", service, e);
                return Vec::new();
            }
        };

        api_services
            .into_iter()
            .filter(|api_service| {
                ServiceRef::from_api_service(api_service).as_ref() == Some(service)
            })
            .collect()
    }

    fn enqueue_for_service(&self, service: &Service) {
        let service_ref = ServiceRef::from_service(service);
        for api_service in self.api_services_for(&service_ref) {
            debug!(
                "Service {} changed, enqueueing {}",
                service_ref,
                api_service.name_any()
            );
            self.enqueue(&api_service);
        }
    }
}

fn unwrap_deleted<K>(deleted: Deleted<K>, kind: &str) -> Option<Arc<K>> {
    match deleted {
        Deleted::Final(obj) => Some(obj),
        Deleted::Unknown(tombstone) => match tombstone.obj {
            Some(obj) => Some(obj),
            None => {
                error!("Couldn't get {} from tombstone {:?}", kind, tombstone.key);
                None
            }
        },
    }
}

impl ResourceEventHandler<APIService> for APIServiceRegistrationController {
    fn on_add(&self, obj: &Arc<APIService>) {
        debug!("Adding {}", obj.name_any());
        self.enqueue(obj);
    }

    fn on_update(&self, _old: &Arc<APIService>, new: &Arc<APIService>) {
        debug!("Updating {}", new.name_any());
        self.enqueue(new);
    }

    fn on_delete(&self, deleted: Deleted<APIService>) {
        let Some(obj) = unwrap_deleted(deleted, "APIService") else {
            return;
        };
        debug!("Deleting {:?}", obj.name_any());
        self.enqueue(&obj);
    }
}

impl ResourceEventHandler<Service> for APIServiceRegistrationController {
    fn on_add(&self, obj: &Arc<Service>) {
        self.enqueue_for_service(obj);
    }

    fn on_update(&self, _old: &Arc<Service>, new: &Arc<Service>) {
        self.enqueue_for_service(new);
    }

    fn on_delete(&self, deleted: Deleted<Service>) {
        if let Some(obj) = unwrap_deleted(deleted, "Service") {
            self.enqueue_for_service(&obj);
        }
    }
}
