use mop_intercept_core::{DispatchFailure, ErrorReporting, InterceptError};
use pyo3::prelude::*;
use pyo3::types::PyTuple;

use crate::error::intercept_error_to_pyerr;
use crate::settings;

/// A registered Python callable and the interceptor family it belongs to.
#[derive(Debug)]
pub struct PyHandler {
    callable: Py<PyAny>,
    interceptor: &'static str,
}

impl PyHandler {
    pub fn new(callable: &Bound<'_, PyAny>, interceptor: &'static str) -> PyResult<Self> {
        if !callable.is_callable() {
            return Err(intercept_error_to_pyerr(InterceptError::not_callable(
                interceptor,
            )));
        }
        Ok(PyHandler {
            callable: callable.clone().unbind(),
            interceptor,
        })
    }

    pub fn bind<'py>(&self, py: Python<'py>) -> &Bound<'py, PyAny> {
        self.callable.bind(py)
    }

    /// Call the handler and discard its return value.
    ///
    /// An exception is reported according to `handler-errors` and comes back as a
    /// failure; the interpreter's error indicator is left clear either way.
    pub fn call(
        &self,
        py: Python<'_>,
        args: PyResult<Bound<'_, PyTuple>>,
    ) -> Result<(), DispatchFailure> {
        let args = args.map_err(crate::error::host_failure)?;
        match self.bind(py).call1(args) {
            Ok(_) => Ok(()),
            Err(err) => {
                let message = err.to_string();
                self.report(py, err);
                Err(DispatchFailure::Handler(message))
            }
        }
    }

    fn report(&self, py: Python<'_>, err: PyErr) {
        match settings::error_reporting() {
            ErrorReporting::Log => {
                log::warn!("{} handler raised: {}", self.interceptor, err);
            }
            ErrorReporting::Silent => {}
            ErrorReporting::Unraisable => err.write_unraisable(py, Some(self.bind(py))),
        }
    }
}
