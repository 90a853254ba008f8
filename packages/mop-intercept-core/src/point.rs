//! Dispatch points: a handler registry bound to the patch table it keeps installed.

use std::sync::Arc;

use parking_lot::{Mutex, RwLock};

use crate::dispatch::{self, Delivery, DispatchFailure};
use crate::error::InterceptError;
use crate::intercept_debug_log;
use crate::kind::EventKind;
use crate::patch::{DispatchSlot, PatchTable};
use crate::registry::HandlerRegistry;

/// Result of a successful registration.
#[derive(Debug)]
pub struct Registration<H> {
    /// Handler previously registered for the same kind, if any.
    pub replaced: Option<Arc<H>>,
    /// True if this registration installed the patches.
    pub newly_patched: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PointStatus {
    pub name: &'static str,
    pub patched: bool,
    pub holders: usize,
    pub handlers: Vec<&'static str>,
    pub slots: Vec<String>,
}

/// Registry, patch table and holder count of one interceptor family.
///
/// Every registered kind holds one reference on the patch table. The first reference
/// installs all patches, dropping the last one restores them, whatever order kinds
/// were registered and unregistered in. Re-registering a kind that already has a
/// handler replaces the handler without taking another reference.
pub struct DispatchPoint<K, H, S: DispatchSlot> {
    handlers: HandlerRegistry<K, H>,
    table: RwLock<PatchTable<S>>,
    // Serializes registration; the count itself is the number of registered kinds.
    holders: Mutex<usize>,
}

impl<K: EventKind, H, S: DispatchSlot> DispatchPoint<K, H, S> {
    pub fn new(slots: impl IntoIterator<Item = S>) -> Self {
        DispatchPoint {
            handlers: HandlerRegistry::new(),
            table: RwLock::new(PatchTable::new(slots)),
            holders: Mutex::new(0),
        }
    }

    pub fn name(&self) -> &'static str {
        K::INTERCEPTOR
    }

    pub fn register(&self, kind: K, handler: H) -> Result<Registration<H>, InterceptError> {
        let mut holders = self.holders.lock();
        let already = self.handlers.is_registered(kind);

        let mut newly_patched = false;
        if !already && *holders == 0 {
            // install_all undoes its own partial work on failure
            newly_patched = self.table.write().install_all()? > 0;
        }

        let replaced = self.handlers.replace(kind, handler);
        if !already {
            *holders += 1;
        }
        intercept_debug_log!("{} {} registered, holders={}", K::INTERCEPTOR, kind, *holders);
        Ok(Registration {
            replaced,
            newly_patched,
        })
    }

    /// Remove the handler for `kind`, returning it. `None` if none was registered.
    ///
    /// Removed handlers are handed back instead of dropped so that releasing them
    /// happens after the registration lock is let go.
    pub fn unregister(&self, kind: K) -> Result<Option<Arc<H>>, InterceptError> {
        let mut holders = self.holders.lock();
        let Some(removed) = self.handlers.take(kind) else {
            return Ok(None);
        };
        *holders = holders.saturating_sub(1);
        intercept_debug_log!("{} {} unregistered, holders={}", K::INTERCEPTOR, kind, *holders);
        let restored = if *holders == 0 {
            self.table.write().restore_all().map(drop)
        } else {
            Ok(())
        };
        drop(holders);
        restored.map(|()| Some(removed))
    }

    /// Remove every handler and restore the patches.
    pub fn unregister_all(&self) -> Result<Vec<Arc<H>>, InterceptError> {
        let mut holders = self.holders.lock();
        let removed: Vec<Arc<H>> = K::ALL
            .iter()
            .filter_map(|&kind| self.handlers.take(kind))
            .collect();
        *holders = 0;
        let restored = self.table.write().restore_all().map(drop);
        drop(holders);
        restored.map(|()| removed)
    }

    pub fn handler(&self, kind: K) -> Option<Arc<H>> {
        self.handlers.get(kind)
    }

    pub fn registry(&self) -> &HandlerRegistry<K, H> {
        &self.handlers
    }

    pub fn holders(&self) -> usize {
        *self.holders.lock()
    }

    pub fn is_patched(&self) -> bool {
        self.table.read().is_installed()
    }

    /// Swap in a new slot set. Refused while patched.
    pub fn reconfigure(&self, slots: impl IntoIterator<Item = S>) -> Result<(), InterceptError> {
        let _holders = self.holders.lock();
        self.table.write().replace_slots(K::INTERCEPTOR, slots)
    }

    pub fn deliver<F>(&self, kind: K, invoke: F) -> Delivery
    where
        F: FnOnce(&H) -> Result<(), DispatchFailure>,
    {
        dispatch::deliver(&self.handlers, kind, invoke)
    }

    pub fn status(&self) -> PointStatus {
        let holders = self.holders.lock();
        let table = self.table.read();
        PointStatus {
            name: K::INTERCEPTOR,
            patched: table.is_installed(),
            holders: *holders,
            handlers: self.handlers.registered().into_iter().map(K::name).collect(),
            slots: table.labels(),
        }
    }
}
