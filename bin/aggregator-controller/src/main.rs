use aggregator_api::{APIService, Service};
use aggregator_core::{
    APIServiceRegistrationController, Caches, ControllerConfig, ControllerMetrics,
    EndpointRegistry, Informer, LogFormat,
};
use anyhow::Result;
use kube::{Api, Client};
use kube_runtime::{watcher, WatchStreamExt};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

mod server;

use server::ServerState;

#[tokio::main]
async fn main() -> Result<()> {
    let config = ControllerConfig::from_env()?;
    init_tracing(config.log_format);

    info!("Starting aggregator-controller...");

    let client = Client::try_default().await?;
    let metrics = ControllerMetrics::new()?;
    let registry = Arc::new(EndpointRegistry::new());

    let mut api_service_informer = Informer::<APIService>::new("apiservices");
    let mut service_informer = Informer::<Service>::new("services");

    let caches = Caches {
        api_services: Arc::new(api_service_informer.store()),
        api_services_synced: api_service_informer.synced(),
        services: Arc::new(service_informer.store()),
        services_synced: service_informer.synced(),
    };
    let controller = Arc::new(APIServiceRegistrationController::from_config(
        caches,
        registry.clone(),
        &config,
        Some(&metrics),
    ));
    api_service_informer.add_event_handler(controller.clone());
    service_informer.add_event_handler(controller.clone());

    let cancel = CancellationToken::new();

    // Watch APIServices and Services cluster-wide
    let api_services: Api<APIService> = Api::all(client.clone());
    let services: Api<Service> = Api::all(client);
    tokio::spawn(api_service_informer.run(
        watcher(api_services, watcher::Config::default()).default_backoff(),
        cancel.child_token(),
    ));
    tokio::spawn(service_informer.run(
        watcher(services, watcher::Config::default()).default_backoff(),
        cancel.child_token(),
    ));

    let state = Arc::new(ServerState {
        controller: controller.clone(),
        registry,
        metrics,
    });
    let server = {
        let cancel = cancel.child_token();
        let addr = config.metrics_addr;
        tokio::spawn(async move {
            if let Err(e) = server::serve(addr, state, cancel).await {
                error!("Health and metrics server error: {}", e);
            }
        })
    };

    let run = tokio::spawn(controller.run(cancel.child_token()));

    tokio::signal::ctrl_c().await?;
    info!("Shutdown signal received, exiting...");
    cancel.cancel();

    if let Err(e) = run.await {
        error!("Controller task failed: {}", e);
    }
    if let Err(e) = server.await {
        error!("Server task failed: {}", e);
    }

    Ok(())
}

fn init_tracing(format: LogFormat) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    match format {
        LogFormat::Text => builder.init(),
        LogFormat::Json => builder.json().init(),
    }
}
