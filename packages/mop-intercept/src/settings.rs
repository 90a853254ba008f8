//! Process-wide configuration and its Python surface.

use std::path::PathBuf;

use mop_intercept_core::{ErrorReporting, InterceptConfig, InterceptError};
use once_cell::sync::Lazy;
use parking_lot::RwLock;
use pyo3::exceptions::PyValueError;
use pyo3::prelude::*;
use pyo3::types::PyDict;

use crate::compare::{comparison_slots, COMPARISON};
use crate::error::intercept_error_to_pyerr;
use crate::iteration::{iteration_slots, ITERATION};
use crate::profiler::{profile_slots, PROFILE};

static CONFIG: Lazy<RwLock<InterceptConfig>> = Lazy::new(|| RwLock::new(InterceptConfig::default()));

pub fn snapshot() -> InterceptConfig {
    CONFIG.read().clone()
}

pub fn error_reporting() -> ErrorReporting {
    CONFIG.read().handler_errors
}

/// Make `next` the active configuration.
///
/// Slot sets are only rebuilt for the dispatch points whose inputs changed, and a
/// point that is currently patched refuses any change. Nothing is applied unless
/// every change is allowed.
///
/// Takes the dispatch points' locks; attached callers go through [`apply_detached`].
pub fn apply(next: InterceptConfig) -> Result<(), InterceptError> {
    next.validate()?;
    let current = snapshot();
    let comparison_changed = next.comparison_types != current.comparison_types;
    let iteration_changed = next.iteration_types != current.iteration_types;
    let profile_changed = next.profile_new_threads != current.profile_new_threads;

    for (changed, patched, name) in [
        (comparison_changed, COMPARISON.is_patched(), COMPARISON.name()),
        (iteration_changed, ITERATION.is_patched(), ITERATION.name()),
        (profile_changed, PROFILE.is_patched(), PROFILE.name()),
    ] {
        if changed && patched {
            return Err(InterceptError::patch_active(name));
        }
    }

    if comparison_changed {
        COMPARISON.reconfigure(comparison_slots(&next.comparison_types)?)?;
    }
    if iteration_changed {
        ITERATION.reconfigure(iteration_slots(&next.iteration_types)?)?;
    }
    if profile_changed {
        PROFILE.reconfigure(profile_slots(next.profile_new_threads))?;
    }
    log::debug!("configuration applied: {next:?}");
    *CONFIG.write() = next;
    Ok(())
}

/// [`apply`] without holding the GIL while waiting on a point's lock.
pub fn apply_detached(py: Python<'_>, next: InterceptConfig) -> PyResult<()> {
    py.detach(|| apply(next)).map_err(intercept_error_to_pyerr)
}

/// Update selected configuration keys. Omitted keys keep their current value.
#[pyfunction]
#[pyo3(signature = (comparison_types=None, iteration_types=None, handler_errors=None, profile_new_threads=None))]
pub fn configure(
    py: Python<'_>,
    comparison_types: Option<Vec<String>>,
    iteration_types: Option<Vec<String>>,
    handler_errors: Option<String>,
    profile_new_threads: Option<bool>,
) -> PyResult<()> {
    let mut next = snapshot();
    if let Some(types) = comparison_types {
        next.comparison_types = types;
    }
    if let Some(types) = iteration_types {
        next.iteration_types = types;
    }
    if let Some(mode) = handler_errors {
        next.handler_errors = ErrorReporting::parse(&mode).ok_or_else(|| {
            PyValueError::new_err(format!(
                "handler_errors must be 'log', 'silent' or 'unraisable', got {mode:?}"
            ))
        })?;
    }
    if let Some(flag) = profile_new_threads {
        next.profile_new_threads = flag;
    }
    apply_detached(py, next)
}

/// Load configuration from `path`, or from the nearest pyproject.toml with a
/// `[tool.mop-intercept]` table. Returns the resulting configuration.
#[pyfunction]
#[pyo3(signature = (path=None))]
pub fn load_config(py: Python<'_>, path: Option<PathBuf>) -> PyResult<Bound<'_, PyDict>> {
    let config = InterceptConfig::load(path.as_deref()).map_err(intercept_error_to_pyerr)?;
    apply_detached(py, config)?;
    current_config(py)
}

#[pyfunction]
pub fn current_config(py: Python<'_>) -> PyResult<Bound<'_, PyDict>> {
    let config = snapshot();
    let dict = PyDict::new(py);
    dict.set_item("comparison_types", config.comparison_types)?;
    dict.set_item("iteration_types", config.iteration_types)?;
    dict.set_item("handler_errors", config.handler_errors.as_str())?;
    dict.set_item("profile_new_threads", config.profile_new_threads)?;
    Ok(dict)
}

pub(crate) fn add_functions(m: &Bound<'_, PyModule>) -> PyResult<()> {
    m.add_function(wrap_pyfunction!(configure, m)?)?;
    m.add_function(wrap_pyfunction!(load_config, m)?)?;
    m.add_function(wrap_pyfunction!(current_config, m)?)?;
    Ok(())
}
