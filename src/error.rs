use std::any::Any;
use thiserror::Error;

/// The type-erased error a receiver may return. The original error value is
/// kept inside the box, so callers can recover it with `downcast_ref` when
/// they need to react to a specific failure.
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// What went wrong with one receiver during one dispatch.
///
/// Faults never escape `send`/`sync_send`: they are recorded as that
/// receiver's response so every other receiver still gets its turn.
#[derive(Debug, Error)]
pub enum ReceiverFault {
    /// The receiver ran and returned an `Err`. The error value it returned
    /// is the source, untouched.
    #[error("receiver returned an error: {0}")]
    Failed(#[source] BoxError),
    /// The receiver panicked. The payload message is kept when it is a
    /// string, which covers `panic!("...")` and friends.
    #[error("receiver panicked: {0}")]
    Panicked(String),
    /// The blocking worker running the receiver was cancelled before it
    /// could finish, which only happens when the runtime shuts down in the
    /// middle of a dispatch.
    #[error("blocking worker was cancelled before the receiver finished")]
    Cancelled,
}

impl ReceiverFault {
    /// Returns `true` when this fault is a [`ReceiverFault::Failed`] whose
    /// error value is an `E`. This is how the per-call ignore selector
    /// matches "expected" failures by type.
    pub fn failure_is<E: std::error::Error + 'static>(&self) -> bool {
        match self {
            ReceiverFault::Failed(source) => source.downcast_ref::<E>().is_some(),
            _ => false,
        }
    }
}

/// Turns a panic payload into something printable. Panics carry `&str` or
/// `String` payloads in practice; anything else gets a placeholder.
pub(crate) fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(message) = payload.downcast_ref::<&'static str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Error)]
    #[error("boom")]
    struct Boom;

    #[test]
    fn test_failure_is_matches_the_boxed_type() {
        let fault = ReceiverFault::Failed(Box::new(Boom));
        assert!(fault.failure_is::<Boom>());
        assert!(!fault.failure_is::<std::io::Error>());
    }

    #[test]
    fn test_failure_is_never_matches_panics() {
        let fault = ReceiverFault::Panicked("boom".to_string());
        assert!(!fault.failure_is::<Boom>());
        assert!(!ReceiverFault::Cancelled.failure_is::<Boom>());
    }

    #[test]
    fn test_panic_message_extraction() {
        assert_eq!(panic_message(Box::new("static str")), "static str");
        assert_eq!(panic_message(Box::new("owned".to_string())), "owned");
        assert_eq!(panic_message(Box::new(42_u8)), "non-string panic payload");
    }
}
