//! Logging setup, status reporting and teardown.

use mop_intercept_core::PointStatus;
use pyo3::prelude::*;
use pyo3::types::PyDict;

use crate::compare::COMPARISON;
use crate::error::intercept_error_to_pyerr;
use crate::iteration::ITERATION;
use crate::profiler::PROFILE;

/// Install an `env_logger` logger driven by `RUST_LOG`.
///
/// Returns False if a logger was already installed.
#[pyfunction]
pub fn init_logging() -> bool {
    env_logger::Builder::from_env(env_logger::Env::default())
        .format_timestamp(None)
        .try_init()
        .is_ok()
}

fn status_dict<'py>(py: Python<'py>, status: PointStatus) -> PyResult<Bound<'py, PyDict>> {
    let dict = PyDict::new(py);
    dict.set_item("patched", status.patched)?;
    dict.set_item("handlers", status.handlers)?;
    dict.set_item("holders", status.holders)?;
    dict.set_item("types", status.slots)?;
    Ok(dict)
}

/// One entry per dispatch point: `patched`, `handlers`, `holders`, `types`.
#[pyfunction]
pub fn status(py: Python<'_>) -> PyResult<Bound<'_, PyDict>> {
    let dict = PyDict::new(py);
    let profile = py.detach(|| PROFILE.status());
    for point in [COMPARISON.status(), ITERATION.status(), profile] {
        dict.set_item(point.name, status_dict(py, point)?)?;
    }
    Ok(dict)
}

/// Unregister every handler and restore every patched slot.
///
/// All three points are torn down even if one fails; the first failure is raised.
#[pyfunction]
pub fn shutdown(py: Python<'_>) -> PyResult<()> {
    let results = [
        COMPARISON.unregister_all().map(|removed| removed.len()),
        ITERATION.unregister_all().map(|removed| removed.len()),
        // Restoring the profiler runs Python code under the point's lock.
        py.detach(|| PROFILE.unregister_all().map(|removed| removed.len())),
    ];
    let mut first_err = None;
    for result in results {
        match result {
            Ok(0) => {}
            Ok(removed) => log::info!("shutdown released {removed} handler(s)"),
            Err(err) => {
                first_err.get_or_insert(err);
            }
        }
    }
    match first_err {
        Some(err) => Err(intercept_error_to_pyerr(err)),
        None => Ok(()),
    }
}

pub(crate) fn add_functions(m: &Bound<'_, PyModule>) -> PyResult<()> {
    m.add_function(wrap_pyfunction!(init_logging, m)?)?;
    m.add_function(wrap_pyfunction!(status, m)?)?;
    m.add_function(wrap_pyfunction!(shutdown, m)?)?;
    Ok(())
}
