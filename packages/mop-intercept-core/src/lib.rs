//! mop-intercept-core: host-independent event interception and dispatch.
//!
//! The core knows nothing about any particular interpreter. A host supplies:
//!
//! - **Dispatch slots** ([`DispatchSlot`]): places where an operation's implementation
//!   can be read, replaced and written back.
//! - **Handlers**: opaque values stored in a [`HandlerRegistry`] and invoked through
//!   closures the host passes to the dispatch algorithms.
//! - **Frame introspection** ([`FrameIntrospect`]): function identity, source location
//!   and scope bindings of an executing call frame.
//!
//! # Architecture
//!
//! - **Recursion guard**: thread-local suppression while a handler runs
//! - **Dispatch points**: handler registry + patch table + symmetric reference count
//! - **Fallback first**: every algorithm ends in the original behavior, handler
//!   failures are swallowed at the dispatch boundary

pub mod compare;
pub mod config;
pub mod dispatch;
pub mod error;
pub mod guard;
pub mod iteration;
pub mod kind;
pub mod location;
pub mod logging;
pub mod patch;
pub mod point;
pub mod profile;
pub mod registry;

// Re-exports for convenience
pub use compare::{intercept_compare, ComparisonEvent};
pub use config::{ErrorReporting, InterceptConfig, COMPARISON_TYPE_NAMES, ITERATION_TYPE_NAMES};
pub use dispatch::{deliver, Delivery, DispatchFailure};
pub use error::{InterceptError, ReconstructError};
pub use guard::RecursionGuard;
pub use iteration::{IterationEvent, Traversal};
pub use kind::{CompareOp, EventKind, IterationKind, ProfileKind};
pub use location::{LocationResolver, SourceLocation};
pub use patch::{DispatchSlot, PatchRecord, PatchTable};
pub use point::{DispatchPoint, PointStatus, Registration};
pub use profile::{classify_bindings, dispatch_frame_event, reconstruct, Bindings, CallRecord, FrameIntrospect};
pub use registry::HandlerRegistry;
