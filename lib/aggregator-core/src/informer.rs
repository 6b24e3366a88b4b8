//! Informer: feeds a `kube` watch stream into a reflector store and
//! dispatches add/update/delete callbacks to registered handlers.
//!
//! A watch relist can drop objects without a delete event ever being
//! observed. Those objects are reported through [`Deleted::Unknown`]
//! carrying the last state held by the store.

use crate::cache::{object_key, HasSynced, SyncFlag};
use futures::{Stream, StreamExt};
use kube::Resource;
use kube_runtime::reflector::{self, ObjectRef, Store};
use kube_runtime::watcher;
use std::collections::HashMap;
use std::fmt::Debug;
use std::hash::Hash;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Last known state of an object whose deletion was missed
#[derive(Clone, Debug)]
pub struct DeletedFinalStateUnknown<K> {
    /// Cache key of the deleted object
    pub key: String,
    /// Last state held in the cache, if any
    pub obj: Option<Arc<K>>,
}

/// Payload of a delete notification
#[derive(Clone, Debug)]
pub enum Deleted<K> {
    /// The object as it was when the delete was observed
    Final(Arc<K>),
    /// Tombstone for a delete detected on relist
    Unknown(DeletedFinalStateUnknown<K>),
}

/// Relist in progress. Handlers only hear about it once the store holds
/// the new list.
struct Relist<K>
where
    K: Resource,
    K::DynamicType: Eq + Hash,
{
    /// Store contents when the relist began, minus everything relisted since
    previous: HashMap<ObjectRef<K>, Arc<K>>,
    applied: Vec<(Option<Arc<K>>, Arc<K>)>,
}

/// Callbacks invoked for changes to a watched collection. Implementations must not block.
pub trait ResourceEventHandler<K>: Send + Sync {
    fn on_add(&self, obj: &Arc<K>);
    fn on_update(&self, old: &Arc<K>, new: &Arc<K>);
    fn on_delete(&self, deleted: Deleted<K>);
}

/// Watches one collection and keeps a local cache of it
pub struct Informer<K>
where
    K: Resource + Clone + 'static,
    K::DynamicType: Eq + Hash + Clone,
{
    name: String,
    store: Store<K>,
    writer: reflector::store::Writer<K>,
    synced: Arc<SyncFlag>,
    handlers: Vec<Arc<dyn ResourceEventHandler<K>>>,
}

impl<K> Informer<K>
where
    K: Resource + Clone + Debug + Send + Sync + 'static,
    K::DynamicType: Eq + Hash + Clone + Default,
{
    pub fn new(name: impl Into<String>) -> Self {
        let (store, writer) = reflector::store();
        Self {
            name: name.into(),
            store,
            writer,
            synced: Arc::new(SyncFlag::new()),
            handlers: Vec::new(),
        }
    }

    /// Read handle on the cache
    pub fn store(&self) -> Store<K> {
        self.store.clone()
    }

    /// Flag set once the first full list has been applied
    pub fn synced(&self) -> Arc<SyncFlag> {
        self.synced.clone()
    }

    pub fn add_event_handler(&mut self, handler: Arc<dyn ResourceEventHandler<K>>) {
        self.handlers.push(handler);
    }

    /// Consume watch events until the stream ends or `cancel` fires
    pub async fn run<S>(mut self, events: S, cancel: CancellationToken)
    where
        S: Stream<Item = Result<watcher::Event<K>, watcher::Error>> + Send,
    {
        info!("Starting informer {}", self.name);
        futures::pin_mut!(events);

        let mut relist: Option<Relist<K>> = None;

        loop {
            let event = tokio::select! {
                _ = cancel.cancelled() => break,
                event = events.next() => match event {
                    Some(event) => event,
                    None => break,
                },
            };

            match event {
                Ok(event) => self.handle(event, &mut relist),
                Err(e) => warn!("Informer {} watch error: {}", self.name, e),
            }
        }

        info!("Stopping informer {}", self.name);
    }

    fn handle(
        &mut self,
        event: watcher::Event<K>,
        relist: &mut Option<Relist<K>>,
    ) {
        match &event {
            watcher::Event::Init => {
                debug!("Informer {} relist started", self.name);
                *relist = Some(Relist {
                    previous: self
                        .store
                        .state()
                        .into_iter()
                        .map(|obj| (ObjectRef::from_obj(obj.as_ref()), obj))
                        .collect(),
                    applied: Vec::new(),
                });
                self.writer.apply_watcher_event(&event);
            }
            watcher::Event::InitApply(obj) => {
                let obj_ref = ObjectRef::from_obj(obj);
                self.writer.apply_watcher_event(&event);
                match relist.as_mut() {
                    // The writer buffers relisted objects until InitDone
                    Some(pending) => {
                        let previous = pending.previous.remove(&obj_ref);
                        pending.applied.push((previous, Arc::new(obj.clone())));
                    }
                    None => {
                        let previous = self.store.get(&obj_ref);
                        self.dispatch_apply(previous, Arc::new(obj.clone()));
                    }
                }
            }
            watcher::Event::InitDone => {
                self.writer.apply_watcher_event(&event);
                if let Some(done) = relist.take() {
                    for (previous, obj) in done.applied {
                        self.dispatch_apply(previous, obj);
                    }
                    for (_, obj) in done.previous {
                        self.dispatch_tombstone(obj);
                    }
                }
                if !self.synced.has_synced() {
                    info!("Informer {} synced", self.name);
                    self.synced.mark_synced();
                }
            }
            watcher::Event::Apply(obj) => {
                let previous = self.store.get(&ObjectRef::from_obj(obj));
                self.writer.apply_watcher_event(&event);
                self.dispatch_apply(previous, Arc::new(obj.clone()));
            }
            watcher::Event::Delete(obj) => {
                self.writer.apply_watcher_event(&event);
                let obj = Arc::new(obj.clone());
                for handler in &self.handlers {
                    handler.on_delete(Deleted::Final(obj.clone()));
                }
            }
        }
    }

    fn dispatch_apply(&self, previous: Option<Arc<K>>, obj: Arc<K>) {
        for handler in &self.handlers {
            match &previous {
                Some(old) => handler.on_update(old, &obj),
                None => handler.on_add(&obj),
            }
        }
    }

    fn dispatch_tombstone(&self, obj: Arc<K>) {
        let key = match object_key(obj.as_ref()) {
            Ok(key) => key,
            Err(e) => {
                warn!("Informer {} dropped tombstone: {}", self.name, e);
                return;
            }
        };
        for handler in &self.handlers {
            handler.on_delete(Deleted::Unknown(DeletedFinalStateUnknown {
                key: key.clone(),
                obj: Some(obj.clone()),
            }));
        }
    }
}
