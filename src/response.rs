use crate::error::{BoxError, ReceiverFault};
use crate::receiver::ReceiverKey;
use futures::future::BoxFuture;
use std::{fmt, sync::Arc};

/// A not-yet-awaited receiver call, handed back by `sync_send` when it meets
/// an async receiver. Await it to run the receiver.
pub type DeferredCall<R> = BoxFuture<'static, Result<R, BoxError>>;

/// What a dispatch returns: one `(key, response)` pair per live receiver, in
/// registration order.
pub type Responses<R> = Vec<(ReceiverKey, Response<R>)>;

/// The outcome of invoking one receiver.
pub enum Response<R> {
    /// The receiver ran and returned a value.
    Value(R),
    /// The receiver failed. The fault is recorded here instead of aborting
    /// the dispatch, so later receivers still run.
    Fault(ReceiverFault),
    /// An async receiver invoked through `sync_send`: the call was created
    /// but not awaited. Nothing has run yet.
    Deferred(DeferredCall<R>),
}

impl<R> Response<R> {
    pub fn is_value(&self) -> bool {
        matches!(self, Response::Value(_))
    }

    pub fn is_fault(&self) -> bool {
        matches!(self, Response::Fault(_))
    }

    pub fn is_deferred(&self) -> bool {
        matches!(self, Response::Deferred(_))
    }

    /// The returned value, if the receiver produced one.
    pub fn value(&self) -> Option<&R> {
        match self {
            Response::Value(value) => Some(value),
            _ => None,
        }
    }

    /// Consumes the response, keeping only a value.
    pub fn into_value(self) -> Option<R> {
        match self {
            Response::Value(value) => Some(value),
            _ => None,
        }
    }

    /// The recorded fault, if the receiver failed.
    pub fn fault(&self) -> Option<&ReceiverFault> {
        match self {
            Response::Fault(fault) => Some(fault),
            _ => None,
        }
    }

    /// Consumes the response, keeping only a deferred call.
    pub fn into_deferred(self) -> Option<DeferredCall<R>> {
        match self {
            Response::Deferred(call) => Some(call),
            _ => None,
        }
    }
}

impl<R> fmt::Debug for Response<R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Response::Value(_) => write!(f, "Value(..)"),
            Response::Fault(fault) => write!(f, "Fault({fault:?})"),
            Response::Deferred(_) => write!(f, "Deferred(..)"),
        }
    }
}

/// Per-dispatch tuning. The only knob today is which receiver faults to
/// treat as expected: those are still recorded in the responses but skip the
/// error log.
///
/// Example:
/// ```rust
/// use dispatch_hub::SendOptions;
/// use std::io;
///
/// let options = SendOptions::new().ignore_errors_of::<io::Error>();
/// ```
#[derive(Clone, Default)]
pub struct SendOptions {
    ignore: Option<Arc<dyn Fn(&ReceiverFault) -> bool + Send + Sync>>,
}

impl SendOptions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Treats receiver errors of type `E` as expected. Panics and
    /// cancellations are never matched by this.
    pub fn ignore_errors_of<E>(self) -> Self
    where
        E: std::error::Error + 'static,
    {
        self.ignore_if(|fault| fault.failure_is::<E>())
    }

    /// Treats every fault the predicate accepts as expected.
    pub fn ignore_if<F>(mut self, predicate: F) -> Self
    where
        F: Fn(&ReceiverFault) -> bool + Send + Sync + 'static,
    {
        self.ignore = Some(Arc::new(predicate));
        self
    }

    pub(crate) fn ignores(&self, fault: &ReceiverFault) -> bool {
        match &self.ignore {
            Some(predicate) => (**predicate)(fault),
            None => false,
        }
    }
}

impl fmt::Debug for SendOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SendOptions")
            .field("ignore", &self.ignore.as_ref().map(|_| "<predicate>"))
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use thiserror::Error;

    #[derive(Debug, Error)]
    #[error("expected failure")]
    struct Expected;

    #[derive(Debug, Error)]
    #[error("unexpected failure")]
    struct Unexpected;

    #[test]
    fn test_response_accessors() {
        let value: Response<u32> = Response::Value(7);
        assert!(value.is_value());
        assert_eq!(value.value(), Some(&7));
        assert_eq!(value.into_value(), Some(7));

        let fault: Response<u32> = Response::Fault(ReceiverFault::Failed(Box::new(Expected)));
        assert!(fault.is_fault());
        assert!(fault.value().is_none());
        assert!(fault.fault().is_some());

        let deferred: Response<u32> = Response::Deferred(Box::pin(async { Ok(3) }));
        assert!(deferred.is_deferred());
        assert!(deferred.into_deferred().is_some());
    }

    #[test]
    fn test_ignore_errors_of_matches_only_that_type() {
        let options = SendOptions::new().ignore_errors_of::<Expected>();
        assert!(options.ignores(&ReceiverFault::Failed(Box::new(Expected))));
        assert!(!options.ignores(&ReceiverFault::Failed(Box::new(Unexpected))));
        assert!(!options.ignores(&ReceiverFault::Panicked("boom".into())));
    }

    #[test]
    fn test_default_options_ignore_nothing() {
        let options = SendOptions::new();
        assert!(!options.ignores(&ReceiverFault::Failed(Box::new(Expected))));
        assert!(!options.ignores(&ReceiverFault::Cancelled));
    }

    #[test]
    fn test_ignore_if_uses_the_predicate() {
        let options =
            SendOptions::new().ignore_if(|fault| matches!(fault, ReceiverFault::Cancelled));
        assert!(options.ignores(&ReceiverFault::Cancelled));
        assert!(!options.ignores(&ReceiverFault::Panicked("boom".into())));
    }
}
