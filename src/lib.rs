//! # DispatchHub Library
//!
//! `dispatch_hub` is an in-process publish/subscribe library built around typed signals.
//! Receivers subscribe to a [`Signal`]; sending a payload calls every live receiver, one
//! after the other, and hands back each receiver's result. Registrations are weak by
//! default, so dropping a receiver (or the object behind a bound method) is enough to
//! unsubscribe it.
//!
//! # Examples
//!
//! The example below connects two receivers to a signal, dispatches a payload and
//! inspects the per-receiver responses:
//!
//! ```rust
//! use dispatch_hub::{BoxError, Receiver, Signal};
//!
//! #[tokio::main]
//! async fn main() {
//!     // Create a named signal: String payload in, usize out.
//!     let saved: Signal<String, usize> = Signal::named("file_saved");
//!
//!     // A blocking receiver and an async one. Keep them alive: connections
//!     // are weak by default.
//!     let measure = Receiver::blocking(|path: String| Ok::<_, BoxError>(path.len()));
//!     let resolve = Receiver::async_fn(|path: String| async move {
//!         Ok::<_, BoxError>(path.trim_start_matches('/').len())
//!     });
//!     saved.connect(&measure);
//!     saved.connect(&resolve);
//!
//!     // send awaits each receiver in registration order.
//!     let responses = saved.send("/notes.txt".to_owned()).await;
//!     assert_eq!(responses.len(), 2);
//!     assert_eq!(responses[0].1.value(), Some(&10));
//!     assert_eq!(responses[1].1.value(), Some(&9));
//! }
//! ```
//! ## Modules
//! This crate is organized into the following modules:

/// Contains the main `Signal` structure and its associated methods.
///
/// This module defines `Signal`, the dispatch point most code interacts with.
/// A signal owns a `Registry` and forwards every call to it, so one signal
/// value stands for one event in the program.
///
/// ### Key Types:
/// - `Signal<P, R, S>`: A named dispatch point taking payloads of type `P`.
pub mod signal;

/// Contains the `Registry` dispatch engine.
///
/// This module holds the receiver table and the two dispatch algorithms.
/// Receivers are grouped into per-sender buckets, held weakly by default,
/// and reaped lazily: a death noticed in one bucket raises a dirty flag that
/// sweeps the whole table on the next access.
///
/// ### Key Types:
/// - `Registry<P, R, S>`: The receiver table plus `send` and `sync_send`.
/// - `Sender<S>`: The scope a receiver listens to, either `Any` or `Only(s)`.
pub mod registry;

/// Contains the receiver wrappers and their identity scheme.
///
/// This module defines how callables of any shape (blocking or async, plain
/// or bound to a shared object) become receivers with a stable identity and
/// a weak or strong lifetime.
///
/// ### Key Types:
/// - `Receiver<P, R>`: A callable plus the identity it registers under.
/// - `ReceiverKey`: The identity, derived from addresses, never from values.
/// - `LiveReceiver<P, R>`: One resolved entry of a dispatch snapshot.
pub mod receiver;

/// Contains the per-receiver dispatch outcomes and the dispatch options.
///
/// Every dispatch returns one `(ReceiverKey, Response)` pair per receiver.
/// A response is a value, a recorded fault, or (for async receivers invoked
/// through `sync_send`) a deferred call the caller still has to await.
///
/// ### Key Types:
/// - `Response<R>` / `Responses<R>`: What one dispatch hands back.
/// - `DeferredCall<R>`: A created but not-yet-awaited receiver call.
/// - `SendOptions`: Per-dispatch tuning, such as which faults to expect.
pub mod response;

/// Contains definitions related to error types and handling.
///
/// This module provides `ReceiverFault`, the recorded reason a receiver
/// produced no value during a dispatch, and the `BoxError` alias receivers
/// return their own errors through.
///
/// ### Example
/// ```rust
/// use dispatch_hub::error::ReceiverFault;
///
/// let fault = ReceiverFault::Panicked("overflow".to_owned());
/// match fault {
///     ReceiverFault::Failed(source) => println!("receiver returned an error: {source}"),
///     ReceiverFault::Panicked(message) => println!("receiver panicked: {message}"),
///     ReceiverFault::Cancelled => println!("worker cancelled"),
/// }
/// ```
pub mod error;

// Flat re-exports of the surface most callers touch.
pub use error::{BoxError, ReceiverFault};
pub use receiver::{LiveReceiver, Receiver, ReceiverKey};
pub use registry::{Registry, Sender};
pub use response::{DeferredCall, Response, Responses, SendOptions};
pub use signal::Signal;
