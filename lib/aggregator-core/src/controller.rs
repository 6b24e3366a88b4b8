//! APIService registration controller
//!
//! Keeps the handler manager in line with the APIService and Service
//! caches. Change notifications only enqueue registration names; a single
//! worker then recomputes the full state for each name, so duplicate or
//! missed notifications converge to the same result.

use crate::cache::{HasSynced, RegistrationLister, ServiceLister};
use crate::config::ControllerConfig;
use crate::resolver::resolve_destination;
use crate::workqueue::{controller_rate_limiter, ControllerMetrics, RateLimitingQueue};
use crate::{object_key, ApiHandlerManager, Result};
use aggregator_api::{is_available, APIService};
use futures::FutureExt;
use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

/// Name of the controller and its work queue
pub const CONTROLLER_NAME: &str = "APIServiceRegistrationController";

/// Read-only caches the controller reconciles from
pub struct Caches {
    pub api_services: Arc<dyn RegistrationLister>,
    pub api_services_synced: Arc<dyn HasSynced>,
    pub services: Arc<dyn ServiceLister>,
    pub services_synced: Arc<dyn HasSynced>,
}

pub struct APIServiceRegistrationController {
    handler: Arc<dyn ApiHandlerManager>,
    api_services: Arc<dyn RegistrationLister>,
    api_services_synced: Arc<dyn HasSynced>,
    // Used to resolve the destination of each APIService
    services: Arc<dyn ServiceLister>,
    services_synced: Arc<dyn HasSynced>,
    queue: RateLimitingQueue<String>,
    cache_sync_poll_interval: Duration,
}

impl APIServiceRegistrationController {
    pub fn new(
        caches: Caches,
        handler: Arc<dyn ApiHandlerManager>,
        queue: RateLimitingQueue<String>,
    ) -> Self {
        Self {
            handler,
            api_services: caches.api_services,
            api_services_synced: caches.api_services_synced,
            services: caches.services,
            services_synced: caches.services_synced,
            queue,
            cache_sync_poll_interval: ControllerConfig::default().cache_sync_poll_interval,
        }
    }

    /// Build the controller and its queue from configuration
    pub fn from_config(
        caches: Caches,
        handler: Arc<dyn ApiHandlerManager>,
        config: &ControllerConfig,
        metrics: Option<&ControllerMetrics>,
    ) -> Self {
        let limiter = controller_rate_limiter(
            config.queue_base_delay,
            config.queue_max_delay,
            config.queue_qps,
            config.queue_burst,
        );
        let queue = match metrics {
            Some(metrics) => RateLimitingQueue::with_metrics(
                CONTROLLER_NAME,
                limiter,
                metrics.for_queue(CONTROLLER_NAME),
            ),
            None => RateLimitingQueue::new(CONTROLLER_NAME, limiter),
        };

        let mut controller = Self::new(caches, handler, queue);
        controller.cache_sync_poll_interval = config.cache_sync_poll_interval;
        controller
    }

    pub fn queue(&self) -> &RateLimitingQueue<String> {
        &self.queue
    }

    /// Whether both caches have completed their initial list
    pub fn has_synced(&self) -> bool {
        self.api_services_synced.has_synced() && self.services_synced.has_synced()
    }

    /// Reconcile the handler for the APIService named `key`
    pub async fn sync(&self, key: &str) -> Result<()> {
        let api_service = match self.api_services.get(key)? {
            Some(api_service) => api_service,
            None => {
                self.handler.remove_endpoint(key).await;
                return Ok(());
            }
        };

        // Unavailable APIServices get no handler
        if !is_available(&api_service) {
            self.handler.remove_endpoint(key).await;
            return Ok(());
        }

        let destination = resolve_destination(&api_service, self.services.as_ref());
        self.handler.add_endpoint(&api_service, &destination).await;
        Ok(())
    }

    /// Process keys until `cancel` fires.
    ///
    /// Nothing is processed unless both caches sync first. A single worker
    /// runs: handler registration is not safe to run concurrently.
    pub async fn run(self: Arc<Self>, cancel: CancellationToken) {
        info!("Starting {}", CONTROLLER_NAME);

        let sources: [Arc<dyn HasSynced>; 2] =
            [self.api_services_synced.clone(), self.services_synced.clone()];
        if !wait_for_cache_sync(CONTROLLER_NAME, self.cache_sync_poll_interval, &cancel, &sources)
            .await
        {
            self.queue.shut_down();
            info!("Shutting down {}", CONTROLLER_NAME);
            return;
        }

        let worker = {
            let controller = self.clone();
            tokio::spawn(async move { controller.run_worker().await })
        };

        cancel.cancelled().await;
        self.queue.shut_down();

        if let Err(e) = worker.await {
            error!("{} worker exited abnormally: {}", CONTROLLER_NAME, e);
        }
        info!("Shutting down {}", CONTROLLER_NAME);
    }

    async fn run_worker(&self) {
        while self.process_next_work_item().await {}
    }

    /// Handle one key off the queue. Returns false once the queue is shut down.
    pub async fn process_next_work_item(&self) -> bool {
        let Some(key) = self.queue.get().await else {
            return false;
        };

        match AssertUnwindSafe(self.sync(&key)).catch_unwind().await {
            Ok(Ok(())) => self.queue.forget(&key),
            Ok(Err(e)) => {
                error!("{} failed with: {}", key, e);
                self.queue.add_rate_limited(key.clone());
            }
            Err(panic) => {
                error!("{} panicked: {}", key, panic_message(panic.as_ref()));
                self.queue.add_rate_limited(key.clone());
            }
        }

        self.queue.done(&key);
        true
    }

    pub(crate) fn enqueue(&self, api_service: &APIService) {
        match object_key(api_service) {
            Ok(key) => self.queue.add(key),
            Err(e) => error!("Couldn't get key for object {:?}: {}", api_service.metadata, e),
        }
    }

    pub(crate) fn api_services(&self) -> &dyn RegistrationLister {
        self.api_services.as_ref()
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> &str {
    if let Some(message) = panic.downcast_ref::<&str>() {
        message
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message
    } else {
        "unknown panic"
    }
}

/// Poll `sources` until all of them have synced.
///
/// Returns false if `cancel` fires first.
pub async fn wait_for_cache_sync(
    controller_name: &str,
    poll_interval: Duration,
    cancel: &CancellationToken,
    sources: &[Arc<dyn HasSynced>],
) -> bool {
    info!("Waiting for caches to sync for {}", controller_name);
    loop {
        if sources.iter().all(|source| source.has_synced()) {
            info!("Caches are synced for {}", controller_name);
            return true;
        }
        tokio::select! {
            _ = cancel.cancelled() => {
                error!("Unable to sync caches for {}", controller_name);
                return false;
            }
            _ = tokio::time::sleep(poll_interval) => {
                debug!("Caches not yet synced for {}", controller_name);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{api_service, service, Call, FlakyRegistrations, RecordingHandler};
    use crate::workqueue::ItemExponentialFailureRateLimiter;
    use crate::{MemoryStore, SyncFlag};
    use aggregator_api::Service;
    use tokio::time::timeout;

    struct Fixture {
        controller: Arc<APIServiceRegistrationController>,
        handler: Arc<RecordingHandler>,
        api_services: Arc<MemoryStore<APIService>>,
        services: Arc<MemoryStore<Service>>,
        api_services_synced: Arc<SyncFlag>,
        services_synced: Arc<SyncFlag>,
    }

    fn test_queue() -> RateLimitingQueue<String> {
        RateLimitingQueue::new(
            CONTROLLER_NAME,
            ItemExponentialFailureRateLimiter::new(Duration::from_millis(5), Duration::from_secs(1)),
        )
    }

    fn fixture_with(api_services_lister: Option<Arc<dyn RegistrationLister>>) -> Fixture {
        let handler = Arc::new(RecordingHandler::default());
        let api_services = Arc::new(MemoryStore::new());
        let services = Arc::new(MemoryStore::new());
        let api_services_synced = Arc::new(SyncFlag::new());
        let services_synced = Arc::new(SyncFlag::new());

        let lister: Arc<dyn RegistrationLister> = match api_services_lister {
            Some(lister) => lister,
            None => api_services.clone(),
        };
        let caches = Caches {
            api_services: lister,
            api_services_synced: api_services_synced.clone(),
            services: services.clone(),
            services_synced: services_synced.clone(),
        };
        let mut controller = APIServiceRegistrationController::new(caches, handler.clone(), test_queue());
        controller.cache_sync_poll_interval = Duration::from_millis(5);

        Fixture {
            controller: Arc::new(controller),
            handler,
            api_services,
            services,
            api_services_synced,
            services_synced,
        }
    }

    fn fixture() -> Fixture {
        fixture_with(None)
    }

    fn add(name: &str, destination: &str) -> Call {
        Call::Add(name.to_string(), destination.to_string())
    }

    fn remove(name: &str) -> Call {
        Call::Remove(name.to_string())
    }

    #[tokio::test]
    async fn test_sync_missing_registration_removes_endpoint() {
        let f = fixture();
        for _ in 0..3 {
            f.controller.sync("v1.gone.io").await.unwrap();
        }
        assert_eq!(f.handler.calls(), vec![remove("v1.gone.io"); 3]);
    }

    #[tokio::test]
    async fn test_sync_unavailable_registration_removes_endpoint() {
        let f = fixture();
        f.api_services
            .insert(api_service("with-ref", Some(("n", "s")), false))
            .unwrap();
        f.api_services.insert(api_service("local", None, false)).unwrap();

        f.controller.sync("with-ref").await.unwrap();
        f.controller.sync("local").await.unwrap();
        assert_eq!(f.handler.calls(), vec![remove("with-ref"), remove("local")]);
    }

    #[tokio::test]
    async fn test_sync_available_registration_resolves_destination() {
        let f = fixture();
        f.api_services.insert(api_service("r", Some(("n", "s")), true)).unwrap();

        f.controller.sync("r").await.unwrap();

        f.services.insert(service("n", "s", "ClusterIP", "10.0.0.5")).unwrap();
        f.controller.sync("r").await.unwrap();

        f.services.insert(service("n", "s", "ExternalName", "")).unwrap();
        f.controller.sync("r").await.unwrap();

        assert_eq!(
            f.handler.calls(),
            vec![add("r", "s.n.svc"), add("r", "10.0.0.5"), add("r", "s.n.svc")]
        );
    }

    #[tokio::test]
    async fn test_sync_local_registration_has_empty_destination() {
        let f = fixture();
        f.api_services.insert(api_service("v1.", None, true)).unwrap();
        f.controller.sync("v1.").await.unwrap();
        assert_eq!(f.handler.calls(), vec![add("v1.", "")]);
    }

    #[tokio::test]
    async fn test_sync_register_then_delete() {
        let f = fixture();
        f.api_services.insert(api_service("R1", Some(("ns1", "svcA")), true)).unwrap();
        f.services
            .insert(service("ns1", "svcA", "LoadBalancer", "1.2.3.4"))
            .unwrap();

        f.controller.sync("R1").await.unwrap();
        f.api_services.remove("R1");
        f.controller.sync("R1").await.unwrap();

        assert_eq!(f.handler.calls(), vec![add("R1", "1.2.3.4"), remove("R1")]);
    }

    #[tokio::test]
    async fn test_sync_propagates_lookup_errors() {
        let inner = MemoryStore::<APIService>::new();
        let flaky: Arc<dyn RegistrationLister> = Arc::new(FlakyRegistrations::new(inner, 1));
        let f = fixture_with(Some(flaky));

        assert!(f.controller.sync("r").await.is_err());
        assert!(f.handler.calls().is_empty());
        f.controller.sync("r").await.unwrap();
        assert_eq!(f.handler.calls(), vec![remove("r")]);
    }

    #[tokio::test]
    async fn test_duplicate_enqueues_processed_once() {
        let f = fixture();
        let r = api_service("r", None, true);
        f.controller.enqueue(&r);
        f.controller.enqueue(&r);
        f.controller.enqueue(&r);
        assert_eq!(f.controller.queue().len(), 1);

        assert!(f.controller.process_next_work_item().await);
        assert!(f.controller.queue().is_empty());
        assert_eq!(f.handler.calls(), vec![remove("r")]);
    }

    #[tokio::test]
    async fn test_failed_sync_retried_then_forgotten() {
        let inner = MemoryStore::new();
        inner.insert(api_service("r", Some(("n", "s")), true)).unwrap();
        let flaky: Arc<dyn RegistrationLister> = Arc::new(FlakyRegistrations::new(inner, 1));
        let f = fixture_with(Some(flaky));
        let key = "r".to_string();

        f.controller.queue().add(key.clone());
        assert!(f.controller.process_next_work_item().await);
        assert_eq!(f.controller.queue().num_requeues(&key), 1);
        // Not retried immediately
        assert!(f.controller.queue().is_empty());

        let processed = timeout(Duration::from_secs(1), f.controller.process_next_work_item())
            .await
            .unwrap();
        assert!(processed);
        assert_eq!(f.controller.queue().num_requeues(&key), 0);
        assert_eq!(f.handler.calls(), vec![add("r", "s.n.svc")]);

        tokio::time::sleep(Duration::from_millis(30)).await;
        assert!(f.controller.queue().is_empty());
        assert_eq!(f.controller.queue().num_requeues(&key), 0);
    }

    struct PanickingHandler;

    #[async_trait::async_trait]
    impl ApiHandlerManager for PanickingHandler {
        async fn add_endpoint(&self, _api_service: &APIService, _destination: &str) {
            panic!("handler exploded");
        }

        async fn remove_endpoint(&self, _name: &str) {}
    }

    #[tokio::test]
    async fn test_panicking_sync_is_requeued() {
        let api_services = Arc::new(MemoryStore::new());
        api_services.insert(api_service("r", None, true)).unwrap();
        let caches = Caches {
            api_services,
            api_services_synced: Arc::new(SyncFlag::new()),
            services: Arc::new(MemoryStore::<Service>::new()),
            services_synced: Arc::new(SyncFlag::new()),
        };
        let controller =
            APIServiceRegistrationController::new(caches, Arc::new(PanickingHandler), test_queue());

        controller.queue().add("r".to_string());
        assert!(controller.process_next_work_item().await);
        assert_eq!(controller.queue().num_requeues(&"r".to_string()), 1);
    }

    #[tokio::test]
    async fn test_process_returns_false_after_shutdown() {
        let f = fixture();
        f.controller.queue().shut_down();
        assert!(!f.controller.process_next_work_item().await);
    }

    #[tokio::test]
    async fn test_run_processes_until_cancelled() {
        let f = fixture();
        f.api_services_synced.mark_synced();
        f.services_synced.mark_synced();
        f.api_services.insert(api_service("r", None, true)).unwrap();
        f.controller.queue().add("r".to_string());

        let cancel = CancellationToken::new();
        let run = tokio::spawn(f.controller.clone().run(cancel.clone()));

        for _ in 0..100 {
            if !f.handler.calls().is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert_eq!(f.handler.calls(), vec![add("r", "")]);

        cancel.cancel();
        timeout(Duration::from_secs(1), run).await.unwrap().unwrap();
        assert!(f.controller.queue().is_shutting_down());
    }

    #[tokio::test]
    async fn test_run_waits_for_cache_sync() {
        let f = fixture();
        f.controller.queue().add("r".to_string());

        let cancel = CancellationToken::new();
        let run = tokio::spawn(f.controller.clone().run(cancel.clone()));

        tokio::time::sleep(Duration::from_millis(30)).await;
        assert!(f.handler.calls().is_empty());

        cancel.cancel();
        timeout(Duration::from_secs(1), run).await.unwrap().unwrap();
        assert!(f.handler.calls().is_empty());
    }

    #[tokio::test]
    async fn test_wait_for_cache_sync() {
        let first = Arc::new(SyncFlag::new());
        let second = Arc::new(SyncFlag::new());
        let sources: Vec<Arc<dyn HasSynced>> = vec![first.clone(), second.clone()];
        let cancel = CancellationToken::new();

        first.mark_synced();
        let waiter = {
            let cancel = cancel.clone();
            tokio::spawn(async move {
                wait_for_cache_sync("test", Duration::from_millis(5), &cancel, &sources).await
            })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());

        second.mark_synced();
        assert!(timeout(Duration::from_secs(1), waiter).await.unwrap().unwrap());
    }

    #[tokio::test]
    async fn test_wait_for_cache_sync_cancelled() {
        let sources: Vec<Arc<dyn HasSynced>> = vec![Arc::new(SyncFlag::new())];
        let cancel = CancellationToken::new();
        cancel.cancel();
        assert!(!wait_for_cache_sync("test", Duration::from_millis(5), &cancel, &sources).await);
    }
}
