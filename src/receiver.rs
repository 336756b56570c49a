use crate::error::BoxError;
use futures::future::BoxFuture;
use std::{
    any::Any,
    fmt,
    future::Future,
    sync::{Arc, Weak},
};

/// The call shape of a blocking receiver: takes the payload by value,
/// returns a result right away.
pub type BlockingFn<P, R> = dyn Fn(P) -> Result<R, BoxError> + Send + Sync;

/// The call shape of an async receiver: takes the payload by value, returns
/// the future that will produce the result once awaited.
pub type FutureFn<P, R> = dyn Fn(P) -> BoxFuture<'static, Result<R, BoxError>> + Send + Sync;

/// An owner object with its concrete type erased. Bound-method receivers
/// track liveness through this, not through the adapter that calls the
/// method.
type OwnerRef = Arc<dyn Any + Send + Sync>;
type WeakOwner = Weak<dyn Any + Send + Sync>;

type BlockingInvoke<P, R> =
    Arc<dyn Fn(&(dyn Any + Send + Sync), P) -> Result<R, BoxError> + Send + Sync>;
type AsyncInvoke<P, R> =
    Arc<dyn Fn(OwnerRef, P) -> BoxFuture<'static, Result<R, BoxError>> + Send + Sync>;

/// Identity of a receiver inside a registry.
///
/// For a plain callable this is the address of the callable itself, so two
/// structurally identical closures still count as two receivers. For a bound
/// method it is the (owner address, method address) pair, so building the
/// same `Receiver::method(&owner, O::handle)` twice yields the same key even
/// though each call builds a fresh adapter. The key stays stable for the
/// owner's whole lifetime.
///
/// One caveat of the address derivation: the method part is a function
/// pointer, and the optimizer may merge functions with identical bodies.
/// Two merged methods of the same owner then share one key, and connecting
/// the second counts as a duplicate of the first. Keep method bodies
/// distinct where that distinction matters.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct ReceiverKey {
    owner: usize,
    func: usize,
}

impl ReceiverKey {
    fn of_callable(address: usize) -> Self {
        ReceiverKey {
            owner: address,
            func: 0,
        }
    }

    fn of_method(owner: usize, func: usize) -> Self {
        ReceiverKey { owner, func }
    }

    /// Address of the owning object (the callable itself for plain
    /// receivers). Only meaningful as an identifier, never dereferenced.
    pub fn owner_address(&self) -> usize {
        self.owner
    }
}

impl fmt::Debug for ReceiverKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.func == 0 {
            write!(f, "ReceiverKey({:#x})", self.owner)
        } else {
            write!(f, "ReceiverKey({:#x}.{:#x})", self.owner, self.func)
        }
    }
}

impl fmt::Display for ReceiverKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

fn thin_address<T: ?Sized>(arc: &Arc<T>) -> usize {
    Arc::as_ptr(arc) as *const () as usize
}

/// A ready-to-call receiver form, resolved from a handle. Holding one keeps
/// the receiver (and its owner, for bound methods) alive, which is exactly
/// what a dispatch snapshot relies on.
pub(crate) enum Callable<P, R> {
    Blocking(Arc<BlockingFn<P, R>>),
    Async(Arc<FutureFn<P, R>>),
}

impl<P, R> Clone for Callable<P, R> {
    fn clone(&self) -> Self {
        match self {
            Callable::Blocking(f) => Callable::Blocking(Arc::clone(f)),
            Callable::Async(f) => Callable::Async(Arc::clone(f)),
        }
    }
}

impl<P, R> Callable<P, R> {
    pub(crate) fn is_async(&self) -> bool {
        matches!(self, Callable::Async(_))
    }

    fn downgrade(&self) -> WeakCallable<P, R> {
        match self {
            Callable::Blocking(f) => WeakCallable::Blocking(Arc::downgrade(f)),
            Callable::Async(f) => WeakCallable::Async(Arc::downgrade(f)),
        }
    }
}

/// Non-owning counterpart of [`Callable`], stored by weak registrations of
/// plain callables.
pub(crate) enum WeakCallable<P, R> {
    Blocking(Weak<BlockingFn<P, R>>),
    Async(Weak<FutureFn<P, R>>),
}

impl<P, R> WeakCallable<P, R> {
    fn upgrade(&self) -> Option<Callable<P, R>> {
        match self {
            WeakCallable::Blocking(f) => f.upgrade().map(Callable::Blocking),
            WeakCallable::Async(f) => f.upgrade().map(Callable::Async),
        }
    }

    fn is_dead(&self) -> bool {
        match self {
            WeakCallable::Blocking(f) => f.strong_count() == 0,
            WeakCallable::Async(f) => f.strong_count() == 0,
        }
    }
}

/// Calls a bound method once handed the upgraded owner. Holds no strong
/// reference to the owner itself.
pub(crate) enum MethodInvoke<P, R> {
    Blocking(BlockingInvoke<P, R>),
    Async(AsyncInvoke<P, R>),
}

impl<P, R> Clone for MethodInvoke<P, R> {
    fn clone(&self) -> Self {
        match self {
            MethodInvoke::Blocking(invoke) => MethodInvoke::Blocking(Arc::clone(invoke)),
            MethodInvoke::Async(invoke) => MethodInvoke::Async(Arc::clone(invoke)),
        }
    }
}

impl<P, R> MethodInvoke<P, R> {
    fn is_async(&self) -> bool {
        matches!(self, MethodInvoke::Async(_))
    }

    /// Binds an upgraded owner into a ready-to-call form. The returned
    /// callable owns the `Arc`, so the owner stays alive as long as the
    /// callable does.
    fn bind(&self, owner: OwnerRef) -> Callable<P, R>
    where
        P: 'static,
        R: 'static,
    {
        match self {
            MethodInvoke::Blocking(invoke) => {
                let invoke = Arc::clone(invoke);
                Callable::Blocking(Arc::new(move |payload| (*invoke)(owner.as_ref(), payload)))
            }
            MethodInvoke::Async(invoke) => {
                let invoke = Arc::clone(invoke);
                Callable::Async(Arc::new(move |payload| {
                    (*invoke)(Arc::clone(&owner), payload)
                }))
            }
        }
    }
}

/// Registry-side handle for one registration.
pub(crate) enum Handle<P, R> {
    /// Owning form: keeps the callable (and therefore the owner, for bound
    /// methods) alive until disconnected.
    Strong(Callable<P, R>),
    /// Non-owning form over a plain callable. Dead once the caller drops
    /// the last `Receiver` clone holding it.
    Weak(WeakCallable<P, R>),
    /// Non-owning bound method. Liveness follows the owner object alone.
    Method {
        owner: WeakOwner,
        invoke: MethodInvoke<P, R>,
    },
}

impl<P: 'static, R: 'static> Handle<P, R> {
    /// True once the underlying callable or owner has been dropped. Strong
    /// handles never die on their own.
    pub(crate) fn is_dead(&self) -> bool {
        match self {
            Handle::Strong(_) => false,
            Handle::Weak(weak) => weak.is_dead(),
            Handle::Method { owner, .. } => owner.strong_count() == 0,
        }
    }

    /// Resolves the handle to a live callable, or `None` when the referent
    /// is gone. Never panics, never blocks.
    pub(crate) fn resolve(&self) -> Option<Callable<P, R>> {
        match self {
            Handle::Strong(callable) => Some(callable.clone()),
            Handle::Weak(weak) => weak.upgrade(),
            Handle::Method { owner, invoke } => owner.upgrade().map(|owner| invoke.bind(owner)),
        }
    }
}

enum ReceiverForm<P, R> {
    /// The `Receiver` itself owns the callable; weak registrations stay
    /// alive for as long as the caller keeps the `Receiver` (or a clone).
    Callable(Callable<P, R>),
    /// Bound method. The caller's owner `Arc` governs liveness; the
    /// `Receiver` value is just a connect-time descriptor.
    Method {
        owner: WeakOwner,
        invoke: MethodInvoke<P, R>,
    },
}

impl<P, R> Clone for ReceiverForm<P, R> {
    fn clone(&self) -> Self {
        match self {
            ReceiverForm::Callable(callable) => ReceiverForm::Callable(callable.clone()),
            ReceiverForm::Method { owner, invoke } => ReceiverForm::Method {
                owner: owner.clone(),
                invoke: invoke.clone(),
            },
        }
    }
}

/// A receiver: the callable a signal will invoke on dispatch, bundled with
/// its identity.
///
/// Build one with [`Receiver::blocking`] or [`Receiver::async_fn`] for plain
/// callables, or [`Receiver::method`] / [`Receiver::async_method`] to attach
/// a method of a shared object. Clones share the same identity and the same
/// underlying callable.
pub struct Receiver<P, R = ()> {
    key: ReceiverKey,
    form: ReceiverForm<P, R>,
}

impl<P, R> Clone for Receiver<P, R> {
    fn clone(&self) -> Self {
        Receiver {
            key: self.key,
            form: self.form.clone(),
        }
    }
}

impl<P, R> fmt::Debug for Receiver<P, R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Receiver")
            .field("key", &self.key)
            .field("kind", &if self.is_async() { "async" } else { "blocking" })
            .finish()
    }
}

impl<P, R> Receiver<P, R> {
    /// Wraps a blocking callable. The error type only has to convert into
    /// [`BoxError`], so receivers can keep returning their own error enums.
    ///
    /// Example:
    /// ```rust
    /// use dispatch_hub::{BoxError, Receiver};
    ///
    /// let double = Receiver::blocking(|x: u32| Ok::<_, BoxError>(x * 2));
    /// ```
    pub fn blocking<F, E>(f: F) -> Self
    where
        F: Fn(P) -> Result<R, E> + Send + Sync + 'static,
        E: Into<BoxError>,
    {
        let callable: Arc<BlockingFn<P, R>> =
            Arc::new(move |payload: P| f(payload).map_err(Into::into));
        Receiver {
            key: ReceiverKey::of_callable(thin_address(&callable)),
            form: ReceiverForm::Callable(Callable::Blocking(callable)),
        }
    }

    /// Wraps an async callable. During `send` the returned future is awaited
    /// before the next receiver starts; during `sync_send` it is handed back
    /// unawaited.
    pub fn async_fn<F, Fut, E>(f: F) -> Self
    where
        F: Fn(P) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<R, E>> + Send + 'static,
        E: Into<BoxError>,
    {
        let callable: Arc<FutureFn<P, R>> = Arc::new(
            move |payload: P| -> BoxFuture<'static, Result<R, BoxError>> {
                let fut = f(payload);
                Box::pin(async move { fut.await.map_err(Into::into) })
            },
        );
        Receiver {
            key: ReceiverKey::of_callable(thin_address(&callable)),
            form: ReceiverForm::Callable(Callable::Async(callable)),
        }
    }

    /// Wraps a method of a shared object. Registered weakly (the default),
    /// the registration never keeps `owner` alive and reports dead once the
    /// caller drops their last `Arc<O>`; registered strongly, it pins the
    /// owner for the life of the registration.
    ///
    /// Identity is the (owner, method) pair, so re-building this receiver
    /// for the same pair is recognized as the same registration.
    ///
    /// Example:
    /// ```rust
    /// use dispatch_hub::{BoxError, Receiver, Signal};
    /// use std::sync::Arc;
    ///
    /// struct Cache;
    ///
    /// impl Cache {
    ///     fn invalidate(&self, _key: String) -> Result<(), BoxError> {
    ///         Ok(())
    ///     }
    /// }
    ///
    /// let cache = Arc::new(Cache);
    /// let signal: Signal<String> = Signal::named("entry_changed");
    /// signal.connect(&Receiver::method(&cache, Cache::invalidate));
    /// ```
    pub fn method<O, E>(owner: &Arc<O>, f: fn(&O, P) -> Result<R, E>) -> Self
    where
        O: Send + Sync + 'static,
        P: 'static,
        R: 'static,
        E: Into<BoxError> + 'static,
    {
        let key = ReceiverKey::of_method(Arc::as_ptr(owner) as usize, f as usize);
        let shared = Arc::clone(owner);
        let erased: OwnerRef = shared;
        let invoke: BlockingInvoke<P, R> = Arc::new(
            move |owner: &(dyn Any + Send + Sync), payload: P| match owner.downcast_ref::<O>() {
                Some(target) => f(target, payload).map_err(Into::into),
                // The weak owner and this adapter are built from the same `O`.
                None => Err("receiver owner type mismatch".into()),
            },
        );
        Receiver {
            key,
            form: ReceiverForm::Method {
                owner: Arc::downgrade(&erased),
                invoke: MethodInvoke::Blocking(invoke),
            },
        }
    }

    /// Async counterpart of [`Receiver::method`]. The owner `Arc` is passed
    /// to the method by value so the future can own it across await points.
    pub fn async_method<O, Fut, E>(owner: &Arc<O>, f: fn(Arc<O>, P) -> Fut) -> Self
    where
        O: Send + Sync + 'static,
        Fut: Future<Output = Result<R, E>> + Send + 'static,
        P: 'static,
        R: 'static,
        E: Into<BoxError> + 'static,
    {
        let key = ReceiverKey::of_method(Arc::as_ptr(owner) as usize, f as usize);
        let shared = Arc::clone(owner);
        let erased: OwnerRef = shared;
        let invoke: AsyncInvoke<P, R> = Arc::new(
            move |owner: OwnerRef, payload: P| -> BoxFuture<'static, Result<R, BoxError>> {
                match owner.downcast::<O>() {
                    Ok(target) => {
                        let fut = f(target, payload);
                        Box::pin(async move { fut.await.map_err(Into::into) })
                    }
                    // Same-allocation guarantee as the blocking form.
                    Err(_) => Box::pin(async move { Err("receiver owner type mismatch".into()) }),
                }
            },
        );
        Receiver {
            key,
            form: ReceiverForm::Method {
                owner: Arc::downgrade(&erased),
                invoke: MethodInvoke::Async(invoke),
            },
        }
    }

    /// The identity this receiver registers under.
    pub fn key(&self) -> ReceiverKey {
        self.key
    }

    /// True for receivers built with [`Receiver::async_fn`] or
    /// [`Receiver::async_method`].
    pub fn is_async(&self) -> bool {
        match &self.form {
            ReceiverForm::Callable(callable) => callable.is_async(),
            ReceiverForm::Method { invoke, .. } => invoke.is_async(),
        }
    }

    /// Builds the registry-side handle for this receiver.
    pub(crate) fn make_handle(&self, weak: bool) -> Handle<P, R>
    where
        P: 'static,
        R: 'static,
    {
        match (&self.form, weak) {
            (ReceiverForm::Callable(callable), false) => Handle::Strong(callable.clone()),
            (ReceiverForm::Callable(callable), true) => Handle::Weak(callable.downgrade()),
            (ReceiverForm::Method { owner, invoke }, true) => Handle::Method {
                owner: owner.clone(),
                invoke: invoke.clone(),
            },
            (ReceiverForm::Method { owner, invoke }, false) => match owner.upgrade() {
                // Strong mode pins the owner for the life of the registration.
                Some(target) => Handle::Strong(invoke.bind(target)),
                // An already-dead owner still registers; the entry reports
                // dead and purges at the next access.
                None => Handle::Method {
                    owner: owner.clone(),
                    invoke: invoke.clone(),
                },
            },
        }
    }
}

/// One live entry of a dispatch snapshot: the resolved callable plus the key
/// it is registered under. Holding a snapshot keeps its receivers alive
/// until the snapshot is dropped.
pub struct LiveReceiver<P, R = ()> {
    pub(crate) key: ReceiverKey,
    pub(crate) callable: Callable<P, R>,
}

impl<P, R> LiveReceiver<P, R> {
    /// The identity of the receiver behind this entry.
    pub fn key(&self) -> ReceiverKey {
        self.key
    }

    /// True when the receiver is async.
    pub fn is_async(&self) -> bool {
        self.callable.is_async()
    }
}

impl<P, R> fmt::Debug for LiveReceiver<P, R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LiveReceiver")
            .field("key", &self.key)
            .field("kind", &if self.is_async() { "async" } else { "blocking" })
            .finish()
    }
}
