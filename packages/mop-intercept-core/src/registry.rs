//! Handler registry: at most one handler per event kind.

use std::marker::PhantomData;
use std::sync::Arc;

use parking_lot::RwLock;

use crate::kind::EventKind;

/// One slot per kind in `K::ALL`.
///
/// Readers clone the `Arc` out of the slot and release the lock before invoking the
/// handler, so a handler may replace or clear itself without deadlocking and a
/// replaced handler stays alive until the invocation holding it returns.
pub struct HandlerRegistry<K, H> {
    slots: Vec<RwLock<Option<Arc<H>>>>,
    _kind: PhantomData<fn() -> K>,
}

impl<K: EventKind, H> HandlerRegistry<K, H> {
    pub fn new() -> Self {
        HandlerRegistry {
            slots: K::ALL.iter().map(|_| RwLock::new(None)).collect(),
            _kind: PhantomData,
        }
    }

    pub fn get(&self, kind: K) -> Option<Arc<H>> {
        self.slots[kind.index()].read().clone()
    }

    pub fn is_registered(&self, kind: K) -> bool {
        self.slots[kind.index()].read().is_some()
    }

    /// Install `handler`, returning the one it replaced.
    pub fn replace(&self, kind: K, handler: H) -> Option<Arc<H>> {
        self.slots[kind.index()].write().replace(Arc::new(handler))
    }

    pub fn take(&self, kind: K) -> Option<Arc<H>> {
        self.slots[kind.index()].write().take()
    }

    pub fn registered(&self) -> Vec<K> {
        K::ALL
            .iter()
            .copied()
            .filter(|kind| self.is_registered(*kind))
            .collect()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.iter().all(|slot| slot.read().is_none())
    }
}

impl<K: EventKind, H> Default for HandlerRegistry<K, H> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kind::{CompareOp, IterationKind};

    #[test]
    fn test_replace_returns_previous_handler() {
        let registry: HandlerRegistry<CompareOp, &'static str> = HandlerRegistry::new();
        assert!(registry.is_empty());
        assert!(registry.replace(CompareOp::Eq, "first").is_none());

        let previous = registry.replace(CompareOp::Eq, "second").unwrap();
        assert_eq!(*previous, "first");
        assert_eq!(*registry.get(CompareOp::Eq).unwrap(), "second");
        assert!(registry.get(CompareOp::Ne).is_none());
    }

    #[test]
    fn test_take_clears_only_that_kind() {
        let registry: HandlerRegistry<IterationKind, u32> = HandlerRegistry::new();
        registry.replace(IterationKind::Start, 1);
        registry.replace(IterationKind::End, 3);
        assert_eq!(
            registry.registered(),
            vec![IterationKind::Start, IterationKind::End]
        );

        assert_eq!(registry.take(IterationKind::Start).as_deref(), Some(&1));
        assert!(registry.take(IterationKind::Start).is_none());
        assert_eq!(registry.registered(), vec![IterationKind::End]);
        assert!(!registry.is_empty());
    }

    #[test]
    fn test_in_flight_handler_outlives_replacement() {
        let registry: HandlerRegistry<CompareOp, String> = HandlerRegistry::new();
        registry.replace(CompareOp::Lt, "old".to_string());
        let in_flight = registry.get(CompareOp::Lt).unwrap();
        registry.replace(CompareOp::Lt, "new".to_string());
        assert_eq!(in_flight.as_str(), "old");
        assert_eq!(Arc::strong_count(&in_flight), 1);
    }
}
