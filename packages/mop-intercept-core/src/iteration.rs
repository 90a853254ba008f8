//! Iteration dispatch: start/step/end notifications around a wrapped iterator.

use crate::dispatch::{Delivery, DispatchFailure};
use crate::kind::IterationKind;
use crate::location::{LocationResolver, SourceLocation};
use crate::patch::DispatchSlot;
use crate::point::DispatchPoint;

/// Record handed to an iteration handler. `subject` is the container for START and
/// the wrapped iterator for STEP and END.
#[derive(Debug)]
pub struct IterationEvent<'a, V: ?Sized> {
    pub kind: IterationKind,
    pub subject: &'a V,
    pub location: SourceLocation,
}

fn notify_kind<H, S, V, L, N>(
    point: &DispatchPoint<IterationKind, H, S>,
    kind: IterationKind,
    subject: &V,
    resolver: &L,
    notify: N,
) -> Delivery
where
    S: DispatchSlot,
    V: ?Sized,
    L: LocationResolver + ?Sized,
    N: FnOnce(&H, &IterationEvent<'_, V>) -> Result<(), DispatchFailure>,
{
    point.deliver(kind, |handler| {
        let event = IterationEvent {
            kind,
            subject,
            location: resolver.resolve_or_unknown(),
        };
        notify(handler, &event)
    })
}

/// State of one traversal through an iteration proxy.
///
/// Once exhaustion was observed it is latched: further advancement reports exhaustion
/// without calling the wrapped iterator and without notifying anyone.
#[derive(Debug, Default, Clone)]
pub struct Traversal {
    exhausted: bool,
    steps: u64,
}

impl Traversal {
    pub fn new() -> Self {
        Self::default()
    }

    /// Deliver START for a freshly wrapped iterator over `container`.
    pub fn start<H, S, V, L, N>(
        point: &DispatchPoint<IterationKind, H, S>,
        container: &V,
        resolver: &L,
        notify: N,
    ) -> (Traversal, Delivery)
    where
        S: DispatchSlot,
        V: ?Sized,
        L: LocationResolver + ?Sized,
        N: FnOnce(&H, &IterationEvent<'_, V>) -> Result<(), DispatchFailure>,
    {
        let delivery = notify_kind(point, IterationKind::Start, container, resolver, notify);
        (Traversal::new(), delivery)
    }

    pub fn is_exhausted(&self) -> bool {
        self.exhausted
    }

    /// Elements produced so far.
    pub fn steps(&self) -> u64 {
        self.steps
    }

    /// Advance the wrapped iterator once.
    ///
    /// `next` yields `Ok(Some(item))` for an element, `Ok(None)` for exhaustion and
    /// `Err` for any other failure. Elements and errors are passed through unchanged;
    /// errors are not events and do not latch exhaustion.
    pub fn advance<H, S, V, L, N, X, T, E>(
        &mut self,
        point: &DispatchPoint<IterationKind, H, S>,
        iterator: &V,
        resolver: &L,
        notify: N,
        next: X,
    ) -> Result<Option<T>, E>
    where
        S: DispatchSlot,
        V: ?Sized,
        L: LocationResolver + ?Sized,
        N: FnOnce(&H, &IterationEvent<'_, V>) -> Result<(), DispatchFailure>,
        X: FnOnce() -> Result<Option<T>, E>,
    {
        if self.exhausted {
            return Ok(None);
        }
        match next()? {
            Some(item) => {
                self.steps += 1;
                notify_kind(point, IterationKind::Step, iterator, resolver, notify);
                Ok(Some(item))
            }
            None => {
                self.exhausted = true;
                notify_kind(point, IterationKind::End, iterator, resolver, notify);
                Ok(None)
            }
        }
    }
}
