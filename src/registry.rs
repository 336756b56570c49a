// TODO LATER: Implement `Drop` for a connection guard to enable automatic disconnection. This requires a wrapper holding a shared reference to the `Registry` to call `disconnect_with`.
// TODO LATER: Add a concurrent send variant that still returns responses in registration order.

use crate::{
    error::{panic_message, ReceiverFault},
    receiver::{Callable, Handle, LiveReceiver, Receiver, ReceiverKey},
    response::{Response, Responses, SendOptions},
};
use futures::FutureExt;
use parking_lot::Mutex;
use std::{
    collections::HashMap,
    fmt,
    hash::Hash,
    panic::AssertUnwindSafe,
    sync::atomic::{AtomicBool, Ordering},
    sync::Arc,
};
use tokio::task::spawn_blocking;
use tracing::{error, warn};

/// Identifies who is emitting a dispatch. Receivers connect either to every
/// unscoped dispatch ([`Sender::Any`], the default) or to dispatches from
/// exactly one sender ([`Sender::Only`]). Scopes are exact buckets, not a
/// hierarchy: a dispatch from `Only(x)` reaches the `Only(x)` bucket and
/// nothing else.
#[derive(Clone, Debug, Default, PartialEq, Eq, Hash)]
pub enum Sender<S> {
    /// The bucket used by registrations and dispatches without a scope.
    #[default]
    Any,
    /// A specific sender value.
    Only(S),
}

impl<S> From<S> for Sender<S> {
    fn from(sender: S) -> Self {
        Sender::Only(sender)
    }
}

struct Entry<P, R> {
    key: ReceiverKey,
    handle: Handle<P, R>,
}

/// The dispatch engine behind [`Signal`](crate::Signal): a table of
/// receivers keyed by sender scope, plus the send algorithms that call them.
///
/// `P` is the payload type every receiver takes (cloned once per receiver,
/// wrap it in an `Arc` when cloning is expensive), `R` the value each
/// receiver returns, and `S` the sender type used for [`Sender::Only`]
/// scoping. Most code goes through a [`Signal`](crate::Signal); the registry
/// is public for callers that want to embed the engine directly.
///
/// Receivers are held weakly by default: dropping the last `Receiver` clone
/// (or the owner object, for bound methods) is enough to stop deliveries,
/// and the stale entry is reaped on the next access. No disconnect call is
/// required for that.
pub struct Registry<P, R = (), S = ()> {
    label: Option<String>,
    /// One bucket per sender scope, each in registration order.
    buckets: Mutex<HashMap<Sender<S>, Vec<Entry<P, R>>>>,
    /// Set when a dead handle is noticed in one bucket. The next locked
    /// access sweeps every bucket, so a death seen anywhere reaps the same
    /// owner's entries everywhere.
    dirty: AtomicBool,
}

impl<P, R, S> Registry<P, R, S> {
    /// Creates an empty, unlabeled registry.
    pub fn new() -> Self {
        Registry {
            label: None,
            buckets: Mutex::new(HashMap::new()),
            dirty: AtomicBool::new(false),
        }
    }

    /// Creates an empty registry carrying a label. The label shows up in
    /// `Debug` output and in the logs written when receivers fail, which is
    /// what tells dispatches of several signals apart.
    pub fn labeled(label: impl Into<String>) -> Self {
        Registry {
            label: Some(label.into()),
            ..Self::new()
        }
    }

    /// The label given at construction, if any.
    pub fn label(&self) -> Option<&str> {
        self.label.as_deref()
    }
}

impl<P, R, S> Default for Registry<P, R, S> {
    fn default() -> Self {
        Self::new()
    }
}

impl<P, R, S> Registry<P, R, S>
where
    P: 'static,
    R: 'static,
    S: Eq + Hash,
{
    /// Reaps dead handles in every bucket. Runs only when an earlier access
    /// raised the dirty flag.
    fn sweep_if_dirty(&self, buckets: &mut HashMap<Sender<S>, Vec<Entry<P, R>>>) {
        if !self.dirty.swap(false, Ordering::AcqRel) {
            return;
        }
        buckets.retain(|_, entries| {
            entries.retain(|entry| !entry.handle.is_dead());
            !entries.is_empty()
        });
    }

    /// Reaps dead handles in one bucket, raising the dirty flag when
    /// anything was dropped so the rest of the map gets swept on the next
    /// access.
    fn purge_bucket(&self, entries: &mut Vec<Entry<P, R>>) {
        let before = entries.len();
        entries.retain(|entry| !entry.handle.is_dead());
        if entries.len() < before {
            self.dirty.store(true, Ordering::Release);
        }
    }

    /// Resolves one bucket into live, ready-to-call entries, preserving
    /// registration order. Entries whose referent died are dropped on the
    /// spot and the dirty flag is raised for the rest of the map.
    fn snapshot_bucket(&self, entries: &mut Vec<Entry<P, R>>) -> Vec<LiveReceiver<P, R>> {
        let mut snapshot = Vec::with_capacity(entries.len());
        entries.retain(|entry| match entry.handle.resolve() {
            Some(callable) => {
                snapshot.push(LiveReceiver {
                    key: entry.key,
                    callable,
                });
                true
            }
            None => {
                self.dirty.store(true, Ordering::Release);
                false
            }
        });
        snapshot
    }

    /// Connects `receiver` to dispatches from `scope`, weakly when `weak` is
    /// true. Connecting a key that is already in the bucket is a no-op: the
    /// first registration, including its weak or strong mode, wins.
    pub fn connect_with(
        &self,
        receiver: &Receiver<P, R>,
        scope: Sender<S>,
        weak: bool,
    ) -> ReceiverKey {
        let key = receiver.key();
        let mut buckets = self.buckets.lock();
        self.sweep_if_dirty(&mut buckets);
        let entries = buckets.entry(scope).or_default();
        self.purge_bucket(entries);
        if !entries.iter().any(|entry| entry.key == key) {
            entries.push(Entry {
                key,
                handle: receiver.make_handle(weak),
            });
        }
        key
    }

    /// Connects `receiver` weakly to unscoped dispatches. The caller keeps
    /// ownership: once the last `Receiver` clone (or the bound method's
    /// owner) is dropped, the registration dies with it.
    pub fn connect(&self, receiver: &Receiver<P, R>) -> ReceiverKey {
        self.connect_with(receiver, Sender::Any, true)
    }

    /// Connects `receiver` weakly to dispatches from one specific sender.
    pub fn connect_from(&self, sender: S, receiver: &Receiver<P, R>) -> ReceiverKey {
        self.connect_with(receiver, Sender::Only(sender), true)
    }

    /// Connects `receiver` so the registration itself keeps it alive until
    /// disconnected. For bound methods this pins the owner object.
    pub fn connect_strong(&self, receiver: &Receiver<P, R>) -> ReceiverKey {
        self.connect_with(receiver, Sender::Any, false)
    }

    /// Disconnects one registration. Unknown keys and scopes are a silent
    /// no-op, so callers never have to track whether the receiver is still
    /// (or was ever) connected.
    pub fn disconnect_with(&self, scope: Sender<S>, key: ReceiverKey) {
        let mut buckets = self.buckets.lock();
        self.sweep_if_dirty(&mut buckets);
        let entries = match buckets.get_mut(&scope) {
            Some(entries) => entries,
            None => return,
        };
        entries.retain(|entry| entry.key != key);
        if entries.is_empty() {
            buckets.remove(&scope);
        }
    }

    /// Disconnects one registration from the unscoped bucket.
    pub fn disconnect(&self, key: ReceiverKey) {
        self.disconnect_with(Sender::Any, key)
    }

    /// Disconnects one registration from a specific sender's bucket.
    pub fn disconnect_from(&self, sender: S, key: ReceiverKey) {
        self.disconnect_with(Sender::Only(sender), key)
    }

    /// Drops every registration in one scope. Absent scopes are a no-op.
    pub fn disconnect_all_with(&self, scope: Sender<S>) {
        self.buckets.lock().remove(&scope);
    }

    /// Drops every registration in every scope.
    pub fn disconnect_all(&self) {
        let mut buckets = self.buckets.lock();
        buckets.clear();
        self.dirty.store(false, Ordering::Release);
    }

    /// The live receivers a dispatch from `scope` would reach, in
    /// registration order. Each returned entry holds its resolved callable,
    /// so the receivers stay alive (and callable) until the snapshot is
    /// dropped, even if their last outside reference goes away in between.
    pub fn live_receivers_with(&self, scope: Sender<S>) -> Vec<LiveReceiver<P, R>> {
        let mut buckets = self.buckets.lock();
        self.sweep_if_dirty(&mut buckets);
        let entries = match buckets.get_mut(&scope) {
            Some(entries) => entries,
            None => return Vec::new(),
        };
        let snapshot = self.snapshot_bucket(entries);
        if entries.is_empty() {
            buckets.remove(&scope);
        }
        snapshot
    }

    /// The live receivers of the unscoped bucket, in registration order.
    pub fn live_receivers(&self) -> Vec<LiveReceiver<P, R>> {
        self.live_receivers_with(Sender::Any)
    }

    /// True while `key` is registered in `scope` and its receiver is alive.
    pub fn is_connected_with(&self, scope: Sender<S>, key: ReceiverKey) -> bool {
        let mut buckets = self.buckets.lock();
        self.sweep_if_dirty(&mut buckets);
        let entries = match buckets.get_mut(&scope) {
            Some(entries) => entries,
            None => return false,
        };
        self.purge_bucket(entries);
        let connected = entries.iter().any(|entry| entry.key == key);
        if entries.is_empty() {
            buckets.remove(&scope);
        }
        connected
    }

    /// True while `key` is registered in the unscoped bucket and alive.
    pub fn is_connected(&self, key: ReceiverKey) -> bool {
        self.is_connected_with(Sender::Any, key)
    }

    /// Number of live receivers registered in `scope`.
    pub fn receiver_count_with(&self, scope: Sender<S>) -> usize {
        let mut buckets = self.buckets.lock();
        self.sweep_if_dirty(&mut buckets);
        let entries = match buckets.get_mut(&scope) {
            Some(entries) => entries,
            None => return 0,
        };
        self.purge_bucket(entries);
        let count = entries.len();
        if count == 0 {
            buckets.remove(&scope);
        }
        count
    }

    /// Number of live receivers in the unscoped bucket.
    pub fn receiver_count(&self) -> usize {
        self.receiver_count_with(Sender::Any)
    }
}

impl<P, R, S> Registry<P, R, S>
where
    P: Clone + Send + 'static,
    R: Send + 'static,
    S: Eq + Hash,
{
    /// Dispatches `payload` to every receiver of the unscoped bucket,
    /// awaiting each one in registration order.
    pub async fn send(&self, payload: P) -> Responses<R> {
        self.send_with(Sender::Any, payload, SendOptions::new())
            .await
    }

    /// Dispatches `payload` as coming from one specific sender.
    pub async fn send_from(&self, sender: S, payload: P) -> Responses<R> {
        self.send_with(Sender::Only(sender), payload, SendOptions::new())
            .await
    }

    /// Full-control dispatch: picks the scope and the [`SendOptions`].
    ///
    /// The receiver set is snapshotted up front, so connects, disconnects
    /// and receiver deaths during the dispatch only affect later sends.
    /// Receivers run strictly one after the other: async receivers are
    /// awaited in place, blocking ones are handed to the blocking worker
    /// pool and their completion awaited. A failing or panicking receiver
    /// never stops the dispatch; its fault is logged (unless the options say
    /// to expect it) and recorded in the returned responses, one
    /// `(key, response)` pair per receiver in registration order.
    ///
    /// Example:
    /// ```rust
    /// use dispatch_hub::{BoxError, Receiver, Registry, SendOptions, Sender};
    ///
    /// #[tokio::main]
    /// async fn main() {
    ///     let registry: Registry<u32, u32> = Registry::new();
    ///     let double = Receiver::blocking(|x: u32| Ok::<_, BoxError>(x * 2));
    ///     registry.connect(&double);
    ///
    ///     let responses = registry.send_with(Sender::Any, 21, SendOptions::new()).await;
    ///     assert_eq!(responses[0].1.value(), Some(&42));
    /// }
    /// ```
    pub async fn send_with(
        &self,
        scope: Sender<S>,
        payload: P,
        options: SendOptions,
    ) -> Responses<R> {
        let snapshot = self.live_receivers_with(scope);
        let mut responses = Responses::with_capacity(snapshot.len());
        for live in snapshot {
            let response = match &live.callable {
                Callable::Async(factory) => {
                    let created =
                        std::panic::catch_unwind(AssertUnwindSafe(|| (**factory)(payload.clone())));
                    match created {
                        Ok(fut) => match AssertUnwindSafe(fut).catch_unwind().await {
                            Ok(Ok(value)) => Response::Value(value),
                            Ok(Err(error)) => Response::Fault(ReceiverFault::Failed(error)),
                            Err(panic) => {
                                Response::Fault(ReceiverFault::Panicked(panic_message(panic)))
                            }
                        },
                        Err(panic) => Response::Fault(ReceiverFault::Panicked(panic_message(panic))),
                    }
                }
                Callable::Blocking(f) => {
                    let f = Arc::clone(f);
                    let payload = payload.clone();
                    match spawn_blocking(move || (*f)(payload)).await {
                        Ok(Ok(value)) => Response::Value(value),
                        Ok(Err(error)) => Response::Fault(ReceiverFault::Failed(error)),
                        Err(join) if join.is_panic() => Response::Fault(ReceiverFault::Panicked(
                            panic_message(join.into_panic()),
                        )),
                        Err(_) => Response::Fault(ReceiverFault::Cancelled),
                    }
                }
            };
            self.record_fault(&live, &response, &options);
            responses.push((live.key, response));
        }
        responses
    }

    /// Dispatches without an executor. Blocking receivers run inline on the
    /// calling thread; async receivers cannot be awaited here, so each one
    /// is invoked to create its call, a warning is logged, and the unawaited
    /// call comes back as [`Response::Deferred`]. Nothing of a deferred
    /// receiver has run until the caller awaits it.
    pub fn sync_send(&self, payload: P) -> Responses<R> {
        self.sync_send_with(Sender::Any, payload, SendOptions::new())
    }

    /// Executor-free dispatch scoped to one specific sender.
    pub fn sync_send_from(&self, sender: S, payload: P) -> Responses<R> {
        self.sync_send_with(Sender::Only(sender), payload, SendOptions::new())
    }

    /// Full-control counterpart of [`Registry::sync_send`], with the same
    /// snapshot, ordering and containment rules as [`Registry::send_with`].
    pub fn sync_send_with(
        &self,
        scope: Sender<S>,
        payload: P,
        options: SendOptions,
    ) -> Responses<R> {
        let snapshot = self.live_receivers_with(scope);
        let mut responses = Responses::with_capacity(snapshot.len());
        for live in snapshot {
            let response = match &live.callable {
                Callable::Blocking(f) => {
                    match std::panic::catch_unwind(AssertUnwindSafe(|| (**f)(payload.clone()))) {
                        Ok(Ok(value)) => Response::Value(value),
                        Ok(Err(error)) => Response::Fault(ReceiverFault::Failed(error)),
                        Err(panic) => Response::Fault(ReceiverFault::Panicked(panic_message(panic))),
                    }
                }
                Callable::Async(factory) => {
                    warn!(
                        signal = self.label.as_deref(),
                        receiver = %live.key,
                        "async receiver invoked by sync_send; its future is returned unawaited"
                    );
                    match std::panic::catch_unwind(AssertUnwindSafe(|| (**factory)(payload.clone())))
                    {
                        Ok(call) => Response::Deferred(call),
                        Err(panic) => Response::Fault(ReceiverFault::Panicked(panic_message(panic))),
                    }
                }
            };
            self.record_fault(&live, &response, &options);
            responses.push((live.key, response));
        }
        responses
    }

    fn record_fault(&self, live: &LiveReceiver<P, R>, response: &Response<R>, options: &SendOptions) {
        let fault = match response {
            Response::Fault(fault) => fault,
            _ => return,
        };
        if options.ignores(fault) {
            return;
        }
        error!(
            signal = self.label.as_deref(),
            receiver = %live.key,
            %fault,
            "receiver failed during dispatch"
        );
    }
}

impl<P, R, S> fmt::Debug for Registry<P, R, S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Registry")
            .field("label", &self.label)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::BoxError;
    use std::sync::atomic::AtomicUsize;
    use thiserror::Error;
    use tracing_subscriber::layer::SubscriberExt;

    #[derive(Debug, Error)]
    #[error("backend unavailable")]
    struct BackendDown;

    struct Worker {
        jobs: AtomicUsize,
    }

    impl Worker {
        fn on_job(&self, _job: u32) -> Result<u32, BoxError> {
            let seen = self.jobs.fetch_add(1, Ordering::SeqCst) as u32;
            Ok(seen)
        }
    }

    fn counting_receiver(hits: &Arc<AtomicUsize>) -> Receiver<u32, u32> {
        let hits = Arc::clone(hits);
        Receiver::blocking(move |x: u32| {
            hits.fetch_add(1, Ordering::SeqCst);
            Ok::<_, BoxError>(x)
        })
    }

    type CapturedEvents = Arc<Mutex<Vec<(tracing::Level, String)>>>;

    #[derive(Clone, Default)]
    struct CaptureLayer {
        events: CapturedEvents,
    }

    struct MessageVisitor(String);

    impl tracing::field::Visit for MessageVisitor {
        fn record_debug(&mut self, field: &tracing::field::Field, value: &dyn fmt::Debug) {
            if field.name() == "message" {
                self.0 = format!("{value:?}");
            }
        }
    }

    impl<Sub: tracing::Subscriber> tracing_subscriber::Layer<Sub> for CaptureLayer {
        fn on_event(
            &self,
            event: &tracing::Event<'_>,
            _ctx: tracing_subscriber::layer::Context<'_, Sub>,
        ) {
            let mut visitor = MessageVisitor(String::new());
            event.record(&mut visitor);
            self.events
                .lock()
                .push((*event.metadata().level(), visitor.0));
        }
    }

    fn capture() -> (tracing::subscriber::DefaultGuard, CapturedEvents) {
        let layer = CaptureLayer::default();
        let events = Arc::clone(&layer.events);
        let subscriber = tracing_subscriber::registry().with(layer);
        (tracing::subscriber::set_default(subscriber), events)
    }

    fn events_at(events: &CapturedEvents, level: tracing::Level) -> usize {
        events.lock().iter().filter(|(l, _)| *l == level).count()
    }

    #[tokio::test]
    async fn test_send_on_an_empty_registry_returns_no_responses() {
        let registry: Registry<u32> = Registry::new();
        assert!(registry.send(1).await.is_empty());
        assert_eq!(registry.receiver_count(), 0);
    }

    #[test]
    fn test_sync_send_on_an_empty_registry_returns_no_responses() {
        let registry: Registry<u32> = Registry::new();
        assert!(registry.sync_send(1).is_empty());
        assert_eq!(registry.receiver_count(), 0);
    }

    #[tokio::test]
    async fn test_connect_is_idempotent() {
        let hits = Arc::new(AtomicUsize::new(0));
        let registry: Registry<u32, u32> = Registry::new();
        let receiver = counting_receiver(&hits);

        let first = registry.connect(&receiver);
        let second = registry.connect(&receiver);
        assert_eq!(first, second);
        assert_eq!(registry.receiver_count(), 1);

        registry.send(7).await;
        assert_eq!(hits.load(Ordering::SeqCst), 1); // Delivered once, not twice.
    }

    #[tokio::test]
    async fn test_reconnect_does_not_reset_the_weak_mode() {
        let hits = Arc::new(AtomicUsize::new(0));
        let registry: Registry<u32, u32> = Registry::new();
        let receiver = counting_receiver(&hits);

        let key = registry.connect(&receiver);
        // The first registration's mode wins: a later strong connect of the
        // same receiver must not upgrade the original weak one.
        assert_eq!(registry.connect_with(&receiver, Sender::Any, false), key);
        assert_eq!(registry.receiver_count(), 1);

        drop(receiver);
        assert!(!registry.is_connected(key));
        assert!(registry.send(1).await.is_empty());
        assert_eq!(hits.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_connect_makes_the_receiver_queryable() {
        let registry: Registry<u32, u32> = Registry::new();
        let receiver: Receiver<u32, u32> = Receiver::blocking(|x| Ok::<_, BoxError>(x));
        let key = registry.connect(&receiver);
        assert_eq!(key, receiver.key());
        assert!(registry.is_connected(key));
        assert_eq!(registry.live_receivers().len(), 1);
    }

    #[tokio::test]
    async fn test_weak_receiver_vanishes_once_dropped() {
        let hits = Arc::new(AtomicUsize::new(0));
        let registry: Registry<u32, u32> = Registry::new();
        let receiver = counting_receiver(&hits);
        let key = registry.connect(&receiver);

        registry.send(1).await;
        assert_eq!(hits.load(Ordering::SeqCst), 1);

        drop(receiver);
        assert!(!registry.is_connected(key));
        assert!(registry.send(2).await.is_empty());
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_strong_receiver_survives_the_drop() {
        let hits = Arc::new(AtomicUsize::new(0));
        let registry: Registry<u32, u32> = Registry::new();
        let key = registry.connect_strong(&counting_receiver(&hits));

        let responses = registry.send(5).await;
        assert_eq!(responses.len(), 1);
        assert_eq!(hits.load(Ordering::SeqCst), 1);

        registry.disconnect(key);
        assert!(registry.send(5).await.is_empty());
    }

    #[tokio::test]
    async fn test_bound_method_receiver_dies_with_its_owner() {
        let worker = Arc::new(Worker {
            jobs: AtomicUsize::new(0),
        });
        let registry: Registry<u32, u32> = Registry::new();
        let key = registry.connect(&Receiver::method(&worker, Worker::on_job));

        registry.send(1).await;
        assert_eq!(worker.jobs.load(Ordering::SeqCst), 1);

        drop(worker);
        assert!(!registry.is_connected(key));
        assert!(registry.send(2).await.is_empty());
    }

    #[test]
    fn test_disconnect_tolerates_unknown_keys() {
        let registry: Registry<u32, u32> = Registry::new();
        let connected: Receiver<u32, u32> = Receiver::blocking(|x| Ok::<_, BoxError>(x));
        let stranger: Receiver<u32, u32> = Receiver::blocking(|x| Ok::<_, BoxError>(x));
        registry.connect(&connected);

        registry.disconnect(stranger.key()); // Never connected.
        registry.disconnect_from((), stranger.key()); // No such bucket either.
        assert_eq!(registry.receiver_count(), 1);

        registry.disconnect(connected.key());
        assert_eq!(registry.receiver_count(), 0);
        registry.disconnect(connected.key()); // Already gone.
    }

    #[tokio::test]
    async fn test_disconnect_all_clears_every_scope() {
        let hits = Arc::new(AtomicUsize::new(0));
        let registry: Registry<u32, u32, &'static str> = Registry::new();
        let any = counting_receiver(&hits);
        let scoped = counting_receiver(&hits);
        registry.connect(&any);
        registry.connect_from("disk", &scoped);

        registry.disconnect_all();
        assert!(registry.send(1).await.is_empty());
        assert!(registry.send_from("disk", 1).await.is_empty());
        assert_eq!(hits.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_disconnect_all_with_only_touches_one_scope() {
        let hits = Arc::new(AtomicUsize::new(0));
        let registry: Registry<u32, u32, &'static str> = Registry::new();
        let any = counting_receiver(&hits);
        let scoped = counting_receiver(&hits);
        registry.connect(&any);
        registry.connect_from("disk", &scoped);

        registry.disconnect_all_with(Sender::Only("disk"));
        assert!(registry.send_from("disk", 1).await.is_empty());
        assert_eq!(registry.send(1).await.len(), 1);
    }

    #[tokio::test]
    async fn test_sender_scopes_are_exact_buckets() {
        let any_hits = Arc::new(AtomicUsize::new(0));
        let disk_hits = Arc::new(AtomicUsize::new(0));
        let registry: Registry<u32, u32, &'static str> = Registry::new();
        let any = counting_receiver(&any_hits);
        let disk = counting_receiver(&disk_hits);
        registry.connect(&any);
        registry.connect_from("disk", &disk);

        registry.send(1).await;
        assert_eq!(any_hits.load(Ordering::SeqCst), 1);
        assert_eq!(disk_hits.load(Ordering::SeqCst), 0);

        registry.send_from("disk", 1).await;
        assert_eq!(any_hits.load(Ordering::SeqCst), 1);
        assert_eq!(disk_hits.load(Ordering::SeqCst), 1);

        registry.send_from("net", 1).await; // Nobody listens to "net".
        assert_eq!(any_hits.load(Ordering::SeqCst), 1);
        assert_eq!(disk_hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_noticing_a_death_sweeps_every_bucket() {
        let worker = Arc::new(Worker {
            jobs: AtomicUsize::new(0),
        });
        let registry: Registry<u32, u32, &'static str> = Registry::new();
        registry.connect_from("disk", &Receiver::method(&worker, Worker::on_job));
        registry.connect_from("net", &Receiver::method(&worker, Worker::on_job));
        drop(worker);

        // Purging one bucket raises the dirty flag for the rest of the map.
        assert_eq!(registry.receiver_count_with(Sender::Only("disk")), 0);
        assert!(registry.dirty.load(Ordering::SeqCst));

        // The next access sweeps the other bucket without naming it.
        assert_eq!(registry.receiver_count_with(Sender::Only("disk")), 0);
        assert!(registry.buckets.lock().get(&Sender::Only("net")).is_none());
    }

    #[test]
    fn test_snapshot_keeps_its_receivers_alive() {
        let hits = Arc::new(AtomicUsize::new(0));
        let registry: Registry<u32, u32> = Registry::new();
        let receiver = counting_receiver(&hits);
        registry.connect(&receiver);

        let snapshot = registry.live_receivers();
        drop(receiver);

        // The snapshot pins its entries, so the registration stays live
        // until the snapshot is dropped.
        assert_eq!(registry.receiver_count(), 1);
        assert_eq!(snapshot.len(), 1);
        assert!(!snapshot[0].is_async());

        drop(snapshot);
        assert_eq!(registry.receiver_count(), 0);
    }

    #[tokio::test]
    async fn test_send_preserves_registration_order() {
        let registry: Registry<u32, u32> = Registry::new();
        let first: Receiver<u32, u32> = Receiver::blocking(|x| Ok::<_, BoxError>(x + 1));
        let second: Receiver<u32, u32> =
            Receiver::async_fn(|x| async move { Ok::<_, BoxError>(x + 2) });
        let third: Receiver<u32, u32> = Receiver::blocking(|x| Ok::<_, BoxError>(x + 3));
        let keys = [
            registry.connect(&first),
            registry.connect(&second),
            registry.connect(&third),
        ];

        let responses = registry.send(10).await;
        let response_keys: Vec<_> = responses.iter().map(|(key, _)| *key).collect();
        assert_eq!(response_keys, keys);

        let values: Vec<_> = responses
            .into_iter()
            .map(|(_, response)| response.into_value().unwrap())
            .collect();
        assert_eq!(values, vec![11, 12, 13]);
    }

    #[tokio::test]
    async fn test_one_failing_receiver_does_not_stop_the_rest() {
        let registry: Registry<u32, u32> = Registry::new();
        let ok_before: Receiver<u32, u32> = Receiver::blocking(|x| Ok::<_, BoxError>(x));
        let failing: Receiver<u32, u32> = Receiver::blocking(|_| Err::<u32, _>(BackendDown));
        let ok_after: Receiver<u32, u32> = Receiver::blocking(|x| Ok::<_, BoxError>(x));
        registry.connect(&ok_before);
        registry.connect(&failing);
        registry.connect(&ok_after);

        let responses = registry.send(9).await;
        assert_eq!(responses.len(), 3);
        assert!(responses[0].1.is_value());
        assert!(responses[1].1.fault().unwrap().failure_is::<BackendDown>());
        assert!(responses[2].1.is_value());
    }

    #[tokio::test]
    async fn test_async_receiver_errors_are_recorded() {
        async fn refuse(_: u32) -> Result<u32, BoxError> {
            Err(BackendDown.into())
        }

        let registry: Registry<u32, u32> = Registry::new();
        let receiver: Receiver<u32, u32> = Receiver::async_fn(refuse);
        registry.connect(&receiver);

        let responses = registry.send(1).await;
        assert!(responses[0].1.fault().unwrap().failure_is::<BackendDown>());
    }

    #[tokio::test]
    async fn test_panicking_receivers_are_contained() {
        async fn explode(_: u32) -> Result<u32, BoxError> {
            panic!("async boom")
        }

        let registry: Registry<u32, u32> = Registry::new();
        let blocking_boom: Receiver<u32, u32> =
            Receiver::blocking(|_| -> Result<u32, BoxError> { panic!("blocking boom") });
        let async_boom: Receiver<u32, u32> = Receiver::async_fn(explode);
        let survivor: Receiver<u32, u32> = Receiver::blocking(|x| Ok::<_, BoxError>(x));
        registry.connect(&blocking_boom);
        registry.connect(&async_boom);
        registry.connect(&survivor);

        let responses = registry.send(1).await;
        assert!(matches!(
            responses[0].1.fault(),
            Some(ReceiverFault::Panicked(msg)) if msg == "blocking boom"
        ));
        assert!(matches!(
            responses[1].1.fault(),
            Some(ReceiverFault::Panicked(msg)) if msg == "async boom"
        ));
        assert!(responses[2].1.is_value());
    }

    #[test]
    fn test_sync_send_runs_blocking_receivers_inline() {
        let hits = Arc::new(AtomicUsize::new(0));
        let registry: Registry<u32, u32> = Registry::new();
        let receiver = counting_receiver(&hits);
        registry.connect(&receiver);

        // Plain #[test]: sync_send must work without any executor around.
        let responses = registry.sync_send(4);
        assert_eq!(responses.len(), 1);
        assert_eq!(responses[0].1.value(), Some(&4));
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_sync_send_contains_inline_panics() {
        let registry: Registry<u32, u32> = Registry::new();
        let boom: Receiver<u32, u32> =
            Receiver::blocking(|_| -> Result<u32, BoxError> { panic!("inline boom") });
        let survivor: Receiver<u32, u32> = Receiver::blocking(|x| Ok::<_, BoxError>(x));
        registry.connect(&boom);
        registry.connect(&survivor);

        let responses = registry.sync_send(1);
        assert!(matches!(
            responses[0].1.fault(),
            Some(ReceiverFault::Panicked(msg)) if msg == "inline boom"
        ));
        assert_eq!(responses[1].1.value(), Some(&1));
    }

    #[tokio::test]
    async fn test_sync_send_defers_async_receivers() {
        let hits = Arc::new(AtomicUsize::new(0));
        let registry: Registry<u32, u32> = Registry::new();
        let seen = Arc::clone(&hits);
        let receiver: Receiver<u32, u32> = Receiver::async_fn(move |x| {
            let seen = Arc::clone(&seen);
            async move {
                seen.fetch_add(1, Ordering::SeqCst);
                Ok::<_, BoxError>(x * 2)
            }
        });
        registry.connect(&receiver);

        let mut responses = registry.sync_send(21);
        assert_eq!(responses.len(), 1);
        // The call exists but nothing has run: delivery happens at await time.
        assert_eq!(hits.load(Ordering::SeqCst), 0);

        let deferred = responses.pop().unwrap().1.into_deferred().unwrap();
        assert_eq!(deferred.await.unwrap(), 42);
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_receivers_can_connect_during_dispatch() {
        let registry: Arc<Registry<u32, u32>> = Arc::new(Registry::new());
        let late_hits = Arc::new(AtomicUsize::new(0));
        let late = counting_receiver(&late_hits);

        let inner = Arc::clone(&registry);
        let recruit = late.clone();
        let recruiter: Receiver<u32, u32> = Receiver::blocking(move |x| {
            // Connecting mid-dispatch must not deadlock; the running
            // snapshot is already fixed.
            inner.connect(&recruit);
            Ok::<_, BoxError>(x)
        });
        registry.connect(&recruiter);

        let responses = registry.send(1).await;
        assert_eq!(responses.len(), 1);
        assert_eq!(late_hits.load(Ordering::SeqCst), 0);

        assert_eq!(registry.send(2).await.len(), 2);
        assert_eq!(late_hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_ignored_errors_are_recorded_but_not_logged() {
        let (_guard, events) = capture();
        let registry: Registry<u32, u32> = Registry::labeled("job_done");
        let failing: Receiver<u32, u32> = Receiver::blocking(|_| Err::<u32, _>(BackendDown));
        registry.connect(&failing);

        let quiet = registry.sync_send_with(
            Sender::Any,
            1,
            SendOptions::new().ignore_errors_of::<BackendDown>(),
        );
        assert!(quiet[0].1.fault().unwrap().failure_is::<BackendDown>());
        assert_eq!(events_at(&events, tracing::Level::ERROR), 0);

        let loud = registry.sync_send(1);
        assert!(loud[0].1.is_fault());
        assert_eq!(events_at(&events, tracing::Level::ERROR), 1);
    }

    #[tokio::test]
    async fn test_send_with_suppresses_ignored_errors_too() {
        let (_guard, events) = capture();
        let registry: Registry<u32, u32> = Registry::labeled("job_failed");
        let failing: Receiver<u32, u32> = Receiver::blocking(|_| Err::<u32, _>(BackendDown));
        registry.connect(&failing);

        let quiet = registry
            .send_with(
                Sender::Any,
                1,
                SendOptions::new().ignore_errors_of::<BackendDown>(),
            )
            .await;
        assert!(quiet[0].1.fault().unwrap().failure_is::<BackendDown>());
        assert_eq!(events_at(&events, tracing::Level::ERROR), 0);

        let loud = registry.send(1).await;
        assert!(loud[0].1.is_fault());
        assert_eq!(events_at(&events, tracing::Level::ERROR), 1);
    }

    #[test]
    fn test_sync_send_warns_about_async_receivers() {
        let (_guard, events) = capture();
        let registry: Registry<u32, u32> = Registry::labeled("tick");
        let receiver: Receiver<u32, u32> =
            Receiver::async_fn(|x| async move { Ok::<_, BoxError>(x) });
        registry.connect(&receiver);

        let responses = registry.sync_send(3);
        assert!(responses[0].1.is_deferred());
        assert_eq!(events_at(&events, tracing::Level::WARN), 1);
        assert_eq!(events_at(&events, tracing::Level::ERROR), 0);
    }

    #[test]
    fn test_sender_conversion_and_default() {
        assert_eq!(Sender::from("disk"), Sender::Only("disk"));
        assert_eq!(Sender::<&str>::default(), Sender::Any);
    }

    #[test]
    fn test_labels_show_up_in_debug_output() {
        let registry: Registry<u32> = Registry::labeled("config_reloaded");
        assert_eq!(registry.label(), Some("config_reloaded"));
        assert!(format!("{registry:?}").contains("config_reloaded"));
    }
}
