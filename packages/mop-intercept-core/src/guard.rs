//! Thread-local recursion guard.
//!
//! While a handler triggered by this thread's instrumentation runs, every instrumented
//! operation the same thread performs falls straight through to original behavior.
//! Other threads are unaffected: the flag lives in thread-local storage and is never
//! shared.

use std::cell::Cell;
use std::marker::PhantomData;

thread_local! {
    static IN_HANDLER: Cell<bool> = const { Cell::new(false) };
}

/// RAII token proving the current thread is inside a handler invocation.
///
/// Dropping the token clears the flag, including during unwinding. The token is
/// `!Send` so it can only clear the flag of the thread that set it.
#[derive(Debug)]
pub struct RecursionGuard {
    _not_send: PhantomData<*const ()>,
}

impl RecursionGuard {
    /// True while this thread is inside a guarded handler invocation.
    pub fn is_active() -> bool {
        IN_HANDLER.with(Cell::get)
    }

    /// Set the flag. Returns `None` if it was already set on this thread.
    pub fn enter() -> Option<RecursionGuard> {
        IN_HANDLER.with(|flag| {
            if flag.get() {
                None
            } else {
                flag.set(true);
                Some(RecursionGuard {
                    _not_send: PhantomData,
                })
            }
        })
    }
}

impl Drop for RecursionGuard {
    fn drop(&mut self) {
        IN_HANDLER.with(|flag| flag.set(false));
    }
}
