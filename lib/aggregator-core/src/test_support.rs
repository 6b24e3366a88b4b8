//! Fixtures shared by unit tests

use crate::{ApiHandlerManager, CoreError, RegistrationLister, Result};
use aggregator_api::{
    APIService, APIServiceCondition, APIServiceSpec, APIServiceStatus, Service, ServiceReference,
    ServiceSpec, AVAILABLE,
};
use async_trait::async_trait;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::ResourceExt;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

pub fn api_service(name: &str, service: Option<(&str, &str)>, available: bool) -> APIService {
    APIService {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            ..Default::default()
        },
        spec: Some(APIServiceSpec {
            service: service.map(|(namespace, name)| ServiceReference {
                namespace: Some(namespace.to_string()),
                name: Some(name.to_string()),
                port: Some(443),
            }),
            ..Default::default()
        }),
        status: Some(APIServiceStatus {
            conditions: Some(vec![APIServiceCondition {
                type_: AVAILABLE.to_string(),
                status: if available { "True" } else { "False" }.to_string(),
                ..Default::default()
            }]),
        }),
    }
}

pub fn service(namespace: &str, name: &str, type_: &str, cluster_ip: &str) -> Service {
    Service {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            namespace: Some(namespace.to_string()),
            ..Default::default()
        },
        spec: Some(ServiceSpec {
            type_: Some(type_.to_string()),
            cluster_ip: Some(cluster_ip.to_string()),
            ..Default::default()
        }),
        ..Default::default()
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Call {
    Add(String, String),
    Remove(String),
}

/// Handler manager recording every call
#[derive(Default)]
pub struct RecordingHandler {
    calls: Mutex<Vec<Call>>,
}

impl RecordingHandler {
    pub fn calls(&self) -> Vec<Call> {
        self.calls.lock().clone()
    }
}

#[async_trait]
impl ApiHandlerManager for RecordingHandler {
    async fn add_endpoint(&self, api_service: &APIService, destination: &str) {
        self.calls
            .lock()
            .push(Call::Add(api_service.name_any(), destination.to_string()));
    }

    async fn remove_endpoint(&self, name: &str) {
        self.calls.lock().push(Call::Remove(name.to_string()));
    }
}

/// Registration lister failing the first `failures` lookups
pub struct FlakyRegistrations<L> {
    pub inner: L,
    pub failures: AtomicU32,
}

impl<L> FlakyRegistrations<L> {
    pub fn new(inner: L, failures: u32) -> Self {
        Self {
            inner,
            failures: AtomicU32::new(failures),
        }
    }
}

impl<L: RegistrationLister> RegistrationLister for FlakyRegistrations<L> {
    fn get(&self, key: &str) -> Result<Option<Arc<APIService>>> {
        let remaining = self.failures.load(Ordering::SeqCst);
        if remaining > 0 {
            self.failures.store(remaining - 1, Ordering::SeqCst);
            return Err(CoreError::CacheLookup {
                key: key.to_string(),
                message: "simulated lookup failure".to_string(),
            });
        }
        self.inner.get(key)
    }

    fn list(&self) -> Result<Vec<Arc<APIService>>> {
        self.inner.list()
    }
}
