//! Compile-time gated debug logging for the dispatch hot path.

/// Emit per-event trace records only when the `intercept_debug_logs` Cargo feature is
/// enabled.
///
/// With the feature disabled (default), this macro compiles to a no-op while
/// still type-checking format arguments. Comparisons and iterator steps fire far too
/// often for an unconditional `log::trace!` call on every event.
#[macro_export]
macro_rules! intercept_debug_log {
    ($($arg:tt)*) => {{
        #[cfg(feature = "intercept_debug_logs")]
        {
            ::log::trace!($($arg)*);
        }
        #[cfg(not(feature = "intercept_debug_logs"))]
        {
            let _ = format_args!($($arg)*);
        }
    }};
}
