//! Contract of the component serving aggregated API traffic

use aggregator_api::APIService;
use async_trait::async_trait;

/// ApiHandlerManager installs and removes proxy handlers for registrations.
///
/// Both operations must be idempotent. The controller never calls them
/// concurrently.
#[async_trait]
pub trait ApiHandlerManager: Send + Sync {
    /// Install or replace the handler for `api_service`, sending traffic to `destination`
    async fn add_endpoint(&self, api_service: &APIService, destination: &str);

    /// Remove the handler registered under `name`, if any
    async fn remove_endpoint(&self, name: &str);
}
