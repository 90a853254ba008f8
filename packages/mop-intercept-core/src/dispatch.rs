//! Guarded handler invocation.

use std::any::Any;
use std::panic::{catch_unwind, AssertUnwindSafe};

use thiserror::Error;

use crate::error::ReconstructError;
use crate::guard::RecursionGuard;
use crate::intercept_debug_log;
use crate::kind::EventKind;
use crate::registry::HandlerRegistry;

/// Why a handler invocation did not complete normally.
///
/// Never propagates into the instrumented program.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum DispatchFailure {
    #[error("handler raised: {0}")]
    Handler(String),

    #[error("handler panicked: {0}")]
    Panicked(String),

    #[error("could not build event record: {0}")]
    Reconstruct(#[from] ReconstructError),
}

/// Outcome of one attempt to deliver an event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Delivery {
    /// This thread is already inside a handler.
    Suppressed,
    /// No handler registered for the kind.
    Idle,
    Delivered,
    Failed(DispatchFailure),
}

impl Delivery {
    pub fn was_attempted(&self) -> bool {
        matches!(self, Delivery::Delivered | Delivery::Failed(_))
    }
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

/// Deliver one event of `kind` to its registered handler.
///
/// Checks the recursion guard, then the registry; sets the guard for exactly the
/// duration of `invoke` and clears it on every exit path. The handler `Arc` is cloned
/// out of the registry so the slot lock is not held while `invoke` runs.
pub fn deliver<K, H, F>(registry: &HandlerRegistry<K, H>, kind: K, invoke: F) -> Delivery
where
    K: EventKind,
    F: FnOnce(&H) -> Result<(), DispatchFailure>,
{
    if RecursionGuard::is_active() {
        return Delivery::Suppressed;
    }
    let Some(handler) = registry.get(kind) else {
        return Delivery::Idle;
    };
    let Some(_guard) = RecursionGuard::enter() else {
        return Delivery::Suppressed;
    };

    let outcome = catch_unwind(AssertUnwindSafe(|| invoke(&handler)))
        .unwrap_or_else(|payload| Err(DispatchFailure::Panicked(panic_message(payload))));

    match outcome {
        Ok(()) => {
            intercept_debug_log!("{} {} delivered", K::INTERCEPTOR, kind);
            Delivery::Delivered
        }
        Err(failure) => {
            log::debug!("{} {} handler failed: {}", K::INTERCEPTOR, kind, failure);
            Delivery::Failed(failure)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kind::{CompareOp, IterationKind};
    use std::cell::Cell;

    #[test]
    fn test_idle_without_handler() {
        let registry: HandlerRegistry<CompareOp, ()> = HandlerRegistry::new();
        let called = Cell::new(false);
        let delivery = deliver(&registry, CompareOp::Eq, |_| {
            called.set(true);
            Ok(())
        });
        assert_eq!(delivery, Delivery::Idle);
        assert!(!called.get());
    }

    #[test]
    fn test_guard_set_only_during_invoke() {
        let registry: HandlerRegistry<IterationKind, &str> = HandlerRegistry::new();
        registry.replace(IterationKind::Start, "h");

        let delivery = deliver(&registry, IterationKind::Start, |h| {
            assert_eq!(*h, "h");
            assert!(RecursionGuard::is_active());
            Ok(())
        });
        assert_eq!(delivery, Delivery::Delivered);
        assert!(!RecursionGuard::is_active());
    }

    #[test]
    fn test_nested_delivery_is_suppressed() {
        let registry: HandlerRegistry<CompareOp, ()> = HandlerRegistry::new();
        registry.replace(CompareOp::Eq, ());
        let calls = Cell::new(0);

        let outer = deliver(&registry, CompareOp::Eq, |_| {
            calls.set(calls.get() + 1);
            let inner = deliver(&registry, CompareOp::Eq, |_| {
                calls.set(calls.get() + 1);
                Ok(())
            });
            assert_eq!(inner, Delivery::Suppressed);
            Ok(())
        });
        assert_eq!(outer, Delivery::Delivered);
        assert_eq!(calls.get(), 1);
    }

    #[test]
    fn test_failure_and_panic_are_contained() {
        let registry: HandlerRegistry<CompareOp, ()> = HandlerRegistry::new();
        registry.replace(CompareOp::Lt, ());

        let failed = deliver(&registry, CompareOp::Lt, |_| {
            Err(DispatchFailure::Handler("ValueError: boom".into()))
        });
        assert_eq!(
            failed,
            Delivery::Failed(DispatchFailure::Handler("ValueError: boom".into()))
        );
        assert!(!RecursionGuard::is_active());

        let panicked = deliver(&registry, CompareOp::Lt, |_| panic!("kaboom"));
        assert_eq!(
            panicked,
            Delivery::Failed(DispatchFailure::Panicked("kaboom".into()))
        );
        assert!(panicked.was_attempted());
        assert!(!RecursionGuard::is_active());
    }
}
