//! Mapping of core errors onto Python exceptions.

use mop_intercept_core::{DispatchFailure, InterceptError, ReconstructError};
use pyo3::exceptions::{PyRuntimeError, PyTypeError, PyValueError};
use pyo3::PyErr;

pub fn intercept_error_to_pyerr(e: InterceptError) -> PyErr {
    match e {
        InterceptError::NotCallable { .. } => PyTypeError::new_err(e.to_string()),
        InterceptError::UnknownKind { .. }
        | InterceptError::UnknownType { .. }
        | InterceptError::DuplicateType { .. } => {
            PyValueError::new_err(e.to_string())
        }
        _ => PyRuntimeError::new_err(e.to_string()),
    }
}

/// A Python error hit while reading frame data or building handler arguments.
pub fn host_failure(err: PyErr) -> DispatchFailure {
    DispatchFailure::Reconstruct(ReconstructError::host(err.to_string()))
}

/// Slot errors raised by the interpreter while installing or restoring a hook.
pub fn slot_failure(slot: &str, err: PyErr) -> InterceptError {
    InterceptError::slot(slot, err.to_string())
}
