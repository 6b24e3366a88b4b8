//! Core reconciliation for aggregated API endpoints
//!
//! This library provides:
//! - A deduplicating, rate-limited work queue
//! - Informer bridge from `kube` watches to add/update/delete callbacks
//! - Destination resolution for APIService registrations
//! - The registration controller: event routing, sync and the run loop
//! - An in-memory endpoint registry implementing the handler manager contract

pub mod cache;
pub mod config;
pub mod controller;
pub mod endpoint;
pub mod error;
pub mod events;
pub mod handler;
pub mod informer;
pub mod registry;
pub mod resolver;
pub mod workqueue;

#[cfg(test)]
mod test_support;

pub use cache::{object_key, HasSynced, MemoryStore, RegistrationLister, ServiceLister, SyncFlag};
pub use config::{ControllerConfig, LogFormat};
pub use controller::{wait_for_cache_sync, APIServiceRegistrationController, Caches, CONTROLLER_NAME};
pub use endpoint::RegisteredEndpoint;
pub use error::{CoreError, Result};
pub use handler::ApiHandlerManager;
pub use informer::{Deleted, DeletedFinalStateUnknown, Informer, ResourceEventHandler};
pub use registry::EndpointRegistry;
pub use resolver::resolve_destination;
pub use workqueue::{ControllerMetrics, RateLimiter, RateLimitingQueue, WorkQueue};
