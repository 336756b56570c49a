use crate::{
    receiver::{LiveReceiver, Receiver, ReceiverKey},
    registry::{Registry, Sender},
    response::{Responses, SendOptions},
};
use std::fmt;
use std::hash::Hash;

/// A named dispatch point. `Signal` is the surface most code uses: it owns a
/// [`Registry`] and forwards every call to it, adding nothing but the
/// convention that one `Signal` value stands for one event in the program.
///
/// `P` is the payload receivers take, `R` what they return, `S` the sender
/// type for scoped dispatches. Share a signal by wrapping it in an `Arc`;
/// every method takes `&self`.
///
/// Example:
/// ```rust
/// use dispatch_hub::{BoxError, Receiver, Signal};
///
/// #[tokio::main]
/// async fn main() {
///     let saved: Signal<String, usize> = Signal::named("file_saved");
///     let measure = Receiver::blocking(|path: String| Ok::<_, BoxError>(path.len()));
///     saved.connect(&measure);
///
///     let responses = saved.send("notes.txt".to_owned()).await;
///     assert_eq!(responses[0].1.value(), Some(&9));
/// }
/// ```
pub struct Signal<P, R = (), S = ()> {
    registry: Registry<P, R, S>,
}

impl<P, R, S> Signal<P, R, S> {
    /// Creates an anonymous signal.
    pub fn new() -> Self {
        Signal {
            registry: Registry::new(),
        }
    }

    /// Creates a signal carrying a name. The name shows up in `Debug` output
    /// and in the logs written when receivers fail.
    pub fn named(name: impl Into<String>) -> Self {
        Signal {
            registry: Registry::labeled(name),
        }
    }

    /// The name given at construction, if any.
    pub fn name(&self) -> Option<&str> {
        self.registry.label()
    }

    /// The engine underneath, for calls this facade does not mirror.
    pub fn registry(&self) -> &Registry<P, R, S> {
        &self.registry
    }
}

impl<P, R, S> Default for Signal<P, R, S> {
    fn default() -> Self {
        Self::new()
    }
}

impl<P, R, S> Signal<P, R, S>
where
    P: 'static,
    R: 'static,
    S: Eq + Hash,
{
    /// Connects `receiver` weakly to unscoped dispatches. See
    /// [`Registry::connect`].
    pub fn connect(&self, receiver: &Receiver<P, R>) -> ReceiverKey {
        self.registry.connect(receiver)
    }

    /// Connects `receiver` weakly to dispatches from one specific sender.
    pub fn connect_from(&self, sender: S, receiver: &Receiver<P, R>) -> ReceiverKey {
        self.registry.connect_from(sender, receiver)
    }

    /// Connects `receiver` so the registration keeps it alive until
    /// disconnected. A strong receiver that captures an `Arc` of this
    /// signal's owner builds a reference cycle, so prefer weak connections
    /// for anything self-referential.
    pub fn connect_strong(&self, receiver: &Receiver<P, R>) -> ReceiverKey {
        self.registry.connect_strong(receiver)
    }

    /// Explicit-scope connect. See [`Registry::connect_with`].
    pub fn connect_with(
        &self,
        receiver: &Receiver<P, R>,
        scope: Sender<S>,
        weak: bool,
    ) -> ReceiverKey {
        self.registry.connect_with(receiver, scope, weak)
    }

    /// Disconnects one registration. Unknown keys are a silent no-op.
    pub fn disconnect(&self, key: ReceiverKey) {
        self.registry.disconnect(key)
    }

    /// Disconnects one registration from a specific sender's bucket.
    pub fn disconnect_from(&self, sender: S, key: ReceiverKey) {
        self.registry.disconnect_from(sender, key)
    }

    /// Explicit-scope disconnect. See [`Registry::disconnect_with`].
    pub fn disconnect_with(&self, scope: Sender<S>, key: ReceiverKey) {
        self.registry.disconnect_with(scope, key)
    }

    /// Drops every registration in every scope.
    pub fn disconnect_all(&self) {
        self.registry.disconnect_all()
    }

    /// Drops every registration in one scope.
    pub fn disconnect_all_with(&self, scope: Sender<S>) {
        self.registry.disconnect_all_with(scope)
    }

    /// The live receivers an unscoped dispatch would reach, in registration
    /// order.
    pub fn live_receivers(&self) -> Vec<LiveReceiver<P, R>> {
        self.registry.live_receivers()
    }

    /// The live receivers a dispatch from `scope` would reach.
    pub fn live_receivers_with(&self, scope: Sender<S>) -> Vec<LiveReceiver<P, R>> {
        self.registry.live_receivers_with(scope)
    }

    /// True while `key` is connected and its receiver is alive.
    pub fn is_connected(&self, key: ReceiverKey) -> bool {
        self.registry.is_connected(key)
    }

    /// Scoped form of [`Signal::is_connected`].
    pub fn is_connected_with(&self, scope: Sender<S>, key: ReceiverKey) -> bool {
        self.registry.is_connected_with(scope, key)
    }

    /// Number of live receivers on the unscoped bucket.
    pub fn receiver_count(&self) -> usize {
        self.registry.receiver_count()
    }

    /// Number of live receivers registered in `scope`.
    pub fn receiver_count_with(&self, scope: Sender<S>) -> usize {
        self.registry.receiver_count_with(scope)
    }
}

impl<P, R, S> Signal<P, R, S>
where
    P: Clone + Send + 'static,
    R: Send + 'static,
    S: Eq + Hash,
{
    /// Dispatches `payload` to every connected receiver, awaiting each in
    /// registration order. See [`Registry::send_with`] for the full rules.
    pub async fn send(&self, payload: P) -> Responses<R> {
        self.registry.send(payload).await
    }

    /// Dispatches `payload` as coming from one specific sender.
    pub async fn send_from(&self, sender: S, payload: P) -> Responses<R> {
        self.registry.send_from(sender, payload).await
    }

    /// Full-control dispatch with explicit scope and [`SendOptions`].
    pub async fn send_with(
        &self,
        scope: Sender<S>,
        payload: P,
        options: SendOptions,
    ) -> Responses<R> {
        self.registry.send_with(scope, payload, options).await
    }

    /// Executor-free dispatch: blocking receivers run inline, async ones
    /// come back as [`Response::Deferred`](crate::Response::Deferred). See
    /// [`Registry::sync_send`].
    pub fn sync_send(&self, payload: P) -> Responses<R> {
        self.registry.sync_send(payload)
    }

    /// Executor-free dispatch scoped to one specific sender.
    pub fn sync_send_from(&self, sender: S, payload: P) -> Responses<R> {
        self.registry.sync_send_from(sender, payload)
    }

    /// Full-control counterpart of [`Signal::sync_send`].
    pub fn sync_send_with(&self, scope: Sender<S>, payload: P, options: SendOptions) -> Responses<R> {
        self.registry.sync_send_with(scope, payload, options)
    }
}

impl<P, R, S> fmt::Debug for Signal<P, R, S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Signal")
            .field("name", &self.name())
            .finish_non_exhaustive()
    }
}
