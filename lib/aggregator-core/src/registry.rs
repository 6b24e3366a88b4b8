//! Endpoint registry holding the handler for every available APIService

use crate::{ApiHandlerManager, RegisteredEndpoint};
use aggregator_api::{APIService, ServiceRef};
use async_trait::async_trait;
use chrono::Utc;
use kube::ResourceExt;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, info};

/// EndpointRegistry maps registration names to their resolved destination
pub struct EndpointRegistry {
    endpoints: Arc<RwLock<HashMap<String, RegisteredEndpoint>>>,
}

impl EndpointRegistry {
    pub fn new() -> Self {
        Self {
            endpoints: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Get a registered endpoint
    pub async fn get_endpoint(&self, name: &str) -> Option<RegisteredEndpoint> {
        let endpoints = self.endpoints.read().await;
        endpoints.get(name).cloned()
    }

    /// List all endpoints, sorted by name
    pub async fn list_endpoints(&self) -> Vec<RegisteredEndpoint> {
        let endpoints = self.endpoints.read().await;
        let mut list: Vec<_> = endpoints.values().cloned().collect();
        list.sort_by(|a, b| a.name.cmp(&b.name));
        list
    }

    /// Get count of registered endpoints
    pub async fn endpoint_count(&self) -> usize {
        let endpoints = self.endpoints.read().await;
        endpoints.len()
    }
}

impl Default for EndpointRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ApiHandlerManager for EndpointRegistry {
    async fn add_endpoint(&self, api_service: &APIService, destination: &str) {
        let name = api_service.name_any();
        let mut endpoints = self.endpoints.write().await;

        let registered_at = endpoints
            .get(&name)
            .map(|existing| existing.registered_at)
            .unwrap_or_else(Utc::now);
        let endpoint = RegisteredEndpoint {
            name: name.clone(),
            group: api_service.spec.as_ref().and_then(|spec| spec.group.clone()),
            version: api_service.spec.as_ref().and_then(|spec| spec.version.clone()),
            destination: destination.to_string(),
            service: ServiceRef::from_api_service(api_service),
            registered_at,
        };
        let previous = endpoints.insert(name.clone(), endpoint);

        match previous {
            Some(previous) if previous.destination == destination => {
                debug!("Refreshed endpoint {} at {:?}", name, destination)
            }
            Some(previous) => info!(
                "Updated endpoint {}: {:?} -> {:?}",
                name, previous.destination, destination
            ),
            None => info!("Registered endpoint {} at {:?}", name, destination),
        }
    }

    async fn remove_endpoint(&self, name: &str) {
        let mut endpoints = self.endpoints.write().await;
        if endpoints.remove(name).is_some() {
            info!("Deregistered endpoint {}", name);
        } else {
            debug!("Endpoint {} not registered, nothing to remove", name);
        }
    }
}
