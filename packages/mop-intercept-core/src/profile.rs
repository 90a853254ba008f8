//! Call/return reconstruction from an executing frame.
//!
//! A call's bindings are split by reference identity: a local whose value is the very
//! object bound in the caller's locals or in the globals counts as inherited context,
//! everything else as the callee's own argument. Identity is cheap and needs no
//! knowledge of the callee's signature, but any value shared by reference with the
//! outer scopes (small interned integers and strings in particular) is classified as
//! inherited even when it was passed explicitly.

use std::collections::HashSet;

use crate::dispatch::{Delivery, DispatchFailure};
use crate::error::ReconstructError;
use crate::kind::ProfileKind;
use crate::location::SourceLocation;
use crate::patch::DispatchSlot;
use crate::point::DispatchPoint;

/// What the profiler needs to know about an executing frame.
pub trait FrameIntrospect {
    type Value: Clone;

    fn function_name(&self) -> Result<String, ReconstructError>;
    fn location(&self) -> Result<SourceLocation, ReconstructError>;
    /// Every name bound in the frame's local scope, in binding order.
    fn local_bindings(&self) -> Result<Vec<(String, Self::Value)>, ReconstructError>;
    /// Values bound in the calling frame's locals. Empty when there is no caller.
    fn caller_values(&self) -> Result<Vec<Self::Value>, ReconstructError>;
    fn global_values(&self) -> Result<Vec<Self::Value>, ReconstructError>;
    /// Reference identity of `value`.
    fn identity(&self, value: &Self::Value) -> usize;
}

#[derive(Debug, Clone, PartialEq)]
pub struct Bindings<V> {
    pub all: Vec<(String, V)>,
    pub own: Vec<(String, V)>,
    pub inherited: Vec<(String, V)>,
}

impl<V> Bindings<V> {
    pub fn own_names(&self) -> impl Iterator<Item = &str> {
        self.own.iter().map(|(name, _)| name.as_str())
    }

    pub fn inherited_names(&self) -> impl Iterator<Item = &str> {
        self.inherited.iter().map(|(name, _)| name.as_str())
    }
}

pub fn classify_bindings<F: FrameIntrospect>(
    frame: &F,
) -> Result<Bindings<F::Value>, ReconstructError> {
    let outer: HashSet<usize> = frame
        .caller_values()?
        .iter()
        .chain(frame.global_values()?.iter())
        .map(|value| frame.identity(value))
        .collect();

    let all = frame.local_bindings()?;
    let (inherited, own): (Vec<_>, Vec<_>) = all
        .iter()
        .cloned()
        .partition(|(_, value)| outer.contains(&frame.identity(value)));

    Ok(Bindings {
        all,
        own,
        inherited,
    })
}

/// Everything delivered for one call or return event.
#[derive(Debug, Clone, PartialEq)]
pub struct CallRecord<V> {
    pub function: String,
    pub location: SourceLocation,
    pub bindings: Bindings<V>,
    /// Present for return events only.
    pub returned: Option<V>,
}

pub fn reconstruct<F: FrameIntrospect>(
    frame: &F,
    returned: Option<F::Value>,
) -> Result<CallRecord<F::Value>, ReconstructError> {
    Ok(CallRecord {
        function: frame.function_name()?,
        location: frame.location()?,
        bindings: classify_bindings(frame)?,
        returned,
    })
}

/// Reconstruct `frame` and deliver it to the handler for `kind`.
///
/// Reconstruction only happens when a handler is registered and the thread is not
/// already inside one. A reconstruction failure drops this one event.
pub fn dispatch_frame_event<H, S, F, N>(
    point: &DispatchPoint<ProfileKind, H, S>,
    kind: ProfileKind,
    frame: &F,
    returned: Option<F::Value>,
    notify: N,
) -> Delivery
where
    S: DispatchSlot,
    F: FrameIntrospect,
    N: FnOnce(&H, &CallRecord<F::Value>) -> Result<(), DispatchFailure>,
{
    point.deliver(kind, |handler| {
        let record = reconstruct(frame, returned)?;
        notify(handler, &record)
    })
}
