//! mop-intercept: comparison, iteration and call/return interception for CPython.
//!
//! Splices into built-in type slots (`tp_richcompare`, `tp_iter`) and the
//! interpreter's profile hook, and forwards event records to Python handlers
//! registered per event kind. The dispatch logic lives in `mop-intercept-core`;
//! this crate supplies the slots, the replacement slot functions, the iteration
//! proxy, the profile hook and frame introspection.
//!
//! # Architecture
//!
//! - **Slot functions**: `intercepted_richcompare` / `intercepted_iter` route through
//!   the core and always end in the captured original
//! - **Dispatch points**: one process-wide point per interceptor family
//! - **Handlers never leak**: exceptions are reported per `handler-errors`, never raised
//!   into the instrumented program

pub mod compare;
pub mod error;
pub mod handler;
pub mod iteration;
pub mod lifecycle;
pub mod location;
pub mod profiler;
pub mod settings;
pub mod type_slot;

use mop_intercept_core::location::{UNKNOWN_FILE, UNKNOWN_LINE};
use pyo3::prelude::*;

// Re-exports for convenience
pub use compare::{intercepted_richcompare, RichCompareSlot, COMPARISON};
pub use error::intercept_error_to_pyerr;
pub use handler::PyHandler;
pub use iteration::{intercepted_iter, IterSlot, IterationProxy, ITERATION};
pub use profiler::{ProfileHook, ProfileSlot, PyFrameView, PROFILE};
pub use type_slot::TypeRef;

#[pymodule]
pub fn mop_intercept(m: &Bound<'_, PyModule>) -> PyResult<()> {
    compare::add_functions(m)?;
    iteration::add_functions(m)?;
    profiler::add_functions(m)?;
    settings::add_functions(m)?;
    lifecycle::add_functions(m)?;
    m.add("UNKNOWN_FILE", UNKNOWN_FILE)?;
    m.add("UNKNOWN_LINE", UNKNOWN_LINE)?;
    Ok(())
}

#[cfg(test)]
pub(crate) mod test_support {
    //! Tests here patch process-wide state, so they run one at a time and always
    //! leave the interpreter unpatched with the default configuration.

    use std::ffi::CStr;

    use mop_intercept_core::InterceptConfig;
    use parking_lot::{Mutex, MutexGuard};
    use pyo3::prelude::*;
    use pyo3::types::PyDict;

    static TEST_LOCK: Mutex<()> = Mutex::new(());

    pub(crate) struct Serialized {
        _lock: MutexGuard<'static, ()>,
    }

    impl Drop for Serialized {
        fn drop(&mut self) {
            Python::attach(|py| {
                crate::lifecycle::shutdown(py).expect("shutdown failed");
                crate::settings::apply(InterceptConfig::default()).expect("config reset failed");
            });
        }
    }

    pub(crate) fn serialized() -> Serialized {
        Serialized {
            _lock: TEST_LOCK.lock(),
        }
    }

    pub(crate) fn run(py: Python<'_>, ns: &Bound<'_, PyDict>, code: &CStr) {
        py.run(code, Some(ns), Some(ns)).unwrap();
    }

    #[test]
    fn test_module_exports() {
        let _guard = serialized();
        Python::attach(|py| {
            let module = PyModule::new(py, "mop_intercept").unwrap();
            crate::mop_intercept(&module).unwrap();
            for name in [
                "register_comparison_handler",
                "unregister_comparison_handler",
                "patch_eq",
                "unpatch_le",
                "register_iteration_handler",
                "unregister_iteration",
                "patch_for_next",
                "unpatch_for",
                "register_call_handler",
                "on_return",
                "configure",
                "load_config",
                "status",
                "shutdown",
                "WrappedIterator",
                "ProfileHook",
            ] {
                assert!(module.hasattr(name).unwrap(), "missing {name}");
            }
            let unknown: String = module.getattr("UNKNOWN_FILE").unwrap().extract().unwrap();
            assert_eq!(unknown, "<unknown>");
        });
    }
}
