//! Comparison dispatch: notify the operator's handler, then run the original.

use crate::dispatch::DispatchFailure;
use crate::kind::CompareOp;
use crate::location::{LocationResolver, SourceLocation};
use crate::patch::DispatchSlot;
use crate::point::DispatchPoint;

/// Record handed to a comparison handler.
#[derive(Debug)]
pub struct ComparisonEvent<'a, V: ?Sized> {
    pub op: CompareOp,
    pub lhs: &'a V,
    pub rhs: &'a V,
    pub location: SourceLocation,
}

/// Run one intercepted comparison.
///
/// `notify` is called at most once, with the recursion guard set, and only if a
/// handler is registered for `op`. Its failure is discarded. `original` always runs,
/// after `notify` has returned, and its value is returned unchanged.
pub fn intercept_compare<H, S, V, L, N, O, R>(
    point: &DispatchPoint<CompareOp, H, S>,
    op: CompareOp,
    lhs: &V,
    rhs: &V,
    resolver: &L,
    notify: N,
    original: O,
) -> R
where
    S: DispatchSlot,
    V: ?Sized,
    L: LocationResolver + ?Sized,
    N: FnOnce(&H, &ComparisonEvent<'_, V>) -> Result<(), DispatchFailure>,
    O: FnOnce() -> R,
{
    point.deliver(op, |handler| {
        let event = ComparisonEvent {
            op,
            lhs,
            rhs,
            location: resolver.resolve_or_unknown(),
        };
        notify(handler, &event)
    });
    original()
}
