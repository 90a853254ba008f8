//! Iteration interception through `tp_iter`.

use mop_intercept_core::{
    DispatchPoint, DispatchSlot, EventKind, InterceptError, IterationEvent, IterationKind,
    Traversal,
};
use once_cell::sync::Lazy;
use pyo3::exceptions::PyStopIteration;
use pyo3::ffi;
use pyo3::prelude::*;
use pyo3::types::PyTuple;
use pyo3::IntoPyObject;

use crate::error::intercept_error_to_pyerr;
use crate::handler::PyHandler;
use crate::location::current_location;
use crate::settings;
use crate::type_slot::{OriginalSlots, TypeRef};

/// The `tp_iter` slot of one built-in type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IterSlot {
    ty: TypeRef,
}

impl IterSlot {
    pub fn new(ty: TypeRef) -> Self {
        IterSlot { ty }
    }
}

impl DispatchSlot for IterSlot {
    type Func = ffi::getiterfunc;

    fn label(&self) -> String {
        format!("{}.tp_iter", self.ty.name())
    }

    fn current(&self) -> Option<ffi::getiterfunc> {
        unsafe { (*self.ty.as_ptr()).tp_iter }
    }

    fn is_replacement(&self, func: &ffi::getiterfunc) -> bool {
        is_intercepted(*func)
    }

    fn install(&self) -> Result<(), InterceptError> {
        unsafe {
            let slot = &mut (*self.ty.as_ptr()).tp_iter;
            if let Some(func) = *slot {
                if !is_intercepted(func) {
                    ORIGINAL_ITER.publish(self.ty, func as usize);
                }
            }
            *slot = Some(intercepted_iter);
            self.ty.modified();
        }
        Ok(())
    }

    fn restore(&self, original: Option<ffi::getiterfunc>) -> Result<(), InterceptError> {
        unsafe {
            (*self.ty.as_ptr()).tp_iter = original;
            self.ty.modified();
        }
        Ok(())
    }
}

pub type IterationPoint = DispatchPoint<IterationKind, PyHandler, IterSlot>;

pub static ITERATION: Lazy<IterationPoint> = Lazy::new(|| {
    let types = settings::snapshot().iteration_types;
    DispatchPoint::new(iteration_slots(&types).unwrap_or_default())
});

pub fn iteration_slots(types: &[String]) -> Result<Vec<IterSlot>, InterceptError> {
    Ok(TypeRef::resolve_all(IterationKind::INTERCEPTOR, types)?
        .into_iter()
        .map(IterSlot::new)
        .collect())
}

static ORIGINAL_ITER: OriginalSlots = OriginalSlots::new();

fn is_intercepted(func: ffi::getiterfunc) -> bool {
    func as usize == intercepted_iter as usize
}

unsafe fn original_iter(obj: *mut ffi::PyObject) -> Option<ffi::getiterfunc> {
    let ty = unsafe { TypeRef::of(obj) }?;
    ORIGINAL_ITER.lookup(ty).map(|addr| {
        // SAFETY: only tp_iter functions are published to this table.
        unsafe { std::mem::transmute::<usize, ffi::getiterfunc>(addr) }
    })
}

fn event_args<'py>(
    py: Python<'py>,
    event: &IterationEvent<'_, Bound<'py, PyAny>>,
) -> PyResult<Bound<'py, PyTuple>> {
    (event.subject, &event.location.filename, event.location.line).into_pyobject(py)
}

/// Iterator handed out in place of a patched type's own iterator.
///
/// Owns the real iterator and forwards every advancement to it. The traversal is
/// one-shot: after exhaustion it keeps reporting exhaustion without touching the
/// real iterator again.
#[pyclass(name = "WrappedIterator", module = "mop_intercept")]
pub struct IterationProxy {
    inner: Py<PyAny>,
    advance: Option<ffi::iternextfunc>,
    traversal: Traversal,
}

impl IterationProxy {
    fn wrap<'py>(py: Python<'py>, container: &Bound<'py, PyAny>) -> PyResult<Bound<'py, IterationProxy>> {
        let raw = unsafe {
            match original_iter(container.as_ptr()) {
                Some(produce) => produce(container.as_ptr()),
                None => ffi::PySeqIter_New(container.as_ptr()),
            }
        };
        if raw.is_null() {
            return Err(PyErr::fetch(py));
        }
        let inner = unsafe { Bound::from_owned_ptr(py, raw) };
        let advance = unsafe { (*ffi::Py_TYPE(raw)).tp_iternext };

        let (traversal, _) = Traversal::start(
            &ITERATION,
            container,
            &|| current_location(py),
            |handler: &PyHandler, event| handler.call(py, event_args(py, event)),
        );
        Bound::new(
            py,
            IterationProxy {
                inner: inner.unbind(),
                advance,
                traversal,
            },
        )
    }
}

/// Advance `inner` once. `Ok(None)` on exhaustion.
fn advance_inner<'py>(
    py: Python<'py>,
    inner: &Bound<'py, PyAny>,
    advance: Option<ffi::iternextfunc>,
) -> PyResult<Option<Bound<'py, PyAny>>> {
    let Some(next) = advance else {
        return match inner.call_method0("__next__") {
            Ok(item) => Ok(Some(item)),
            Err(err) if err.is_instance_of::<PyStopIteration>(py) => Ok(None),
            Err(err) => Err(err),
        };
    };
    let raw = unsafe { next(inner.as_ptr()) };
    if !raw.is_null() {
        return Ok(Some(unsafe { Bound::from_owned_ptr(py, raw) }));
    }
    match PyErr::take(py) {
        None => Ok(None),
        Some(err) if err.is_instance_of::<PyStopIteration>(py) => Ok(None),
        Some(err) => Err(err),
    }
}

#[pymethods]
impl IterationProxy {
    fn __iter__(slf: PyRef<'_, Self>) -> PyRef<'_, Self> {
        slf
    }

    fn __next__(&mut self, py: Python<'_>) -> PyResult<Option<Py<PyAny>>> {
        let inner = self.inner.bind(py).clone();
        let advance = self.advance;
        let item = self.traversal.advance(
            &ITERATION,
            &inner,
            &|| current_location(py),
            |handler: &PyHandler, event| handler.call(py, event_args(py, event)),
            || advance_inner(py, &inner, advance),
        )?;
        Ok(item.map(Bound::unbind))
    }

    /// Elements produced so far.
    #[getter]
    fn steps(&self) -> u64 {
        self.traversal.steps()
    }

    #[getter]
    fn exhausted(&self) -> bool {
        self.traversal.is_exhausted()
    }

    fn __repr__(&self, py: Python<'_>) -> PyResult<String> {
        Ok(format!("<WrappedIterator of {}>", self.inner.bind(py).repr()?))
    }
}

/// Replacement written into every patched `tp_iter`.
pub unsafe extern "C" fn intercepted_iter(container: *mut ffi::PyObject) -> *mut ffi::PyObject {
    // SAFETY: the interpreter only calls type slots from attached threads.
    let py = unsafe { Python::assume_attached() };
    let container = unsafe { Bound::from_borrowed_ptr(py, container) };
    match IterationProxy::wrap(py, &container) {
        Ok(proxy) => proxy.into_ptr(),
        Err(err) => {
            err.restore(py);
            std::ptr::null_mut()
        }
    }
}

fn parse_kind(kind: &str) -> PyResult<IterationKind> {
    IterationKind::parse(kind).map_err(intercept_error_to_pyerr)
}

fn register(py: Python<'_>, kind: IterationKind, handler: &Bound<'_, PyAny>) -> PyResult<()> {
    let handler = PyHandler::new(handler, IterationKind::INTERCEPTOR)?;
    // Create the proxy type before any tp_iter is replaced.
    let _ = py.get_type::<IterationProxy>();
    let registration = ITERATION
        .register(kind, handler)
        .map_err(intercept_error_to_pyerr)?;
    if registration.newly_patched {
        log::info!("iteration interception enabled");
    }
    Ok(())
}

/// Route `kind` (`"start"`, `"step"`/`"next"`, `"end"`) iteration events to `handler`.
#[pyfunction]
pub fn register_iteration_handler(
    py: Python<'_>,
    kind: &str,
    handler: &Bound<'_, PyAny>,
) -> PyResult<()> {
    register(py, parse_kind(kind)?, handler)
}

#[pyfunction]
pub fn unregister_iteration_handler(kind: &str) -> PyResult<()> {
    let removed = ITERATION
        .unregister(parse_kind(kind)?)
        .map_err(intercept_error_to_pyerr)?;
    if removed.is_some() && !ITERATION.is_patched() {
        log::info!("iteration interception disabled");
    }
    Ok(())
}

/// Clear all three iteration handlers and restore the original iterator slots.
#[pyfunction]
pub fn unregister_iteration() -> PyResult<()> {
    let removed = ITERATION.unregister_all().map_err(intercept_error_to_pyerr)?;
    if !removed.is_empty() {
        log::info!("iteration interception disabled");
    }
    Ok(())
}

#[pyfunction]
pub fn patch_for_start(py: Python<'_>, handler: &Bound<'_, PyAny>) -> PyResult<()> {
    register(py, IterationKind::Start, handler)
}

#[pyfunction]
pub fn patch_for_next(py: Python<'_>, handler: &Bound<'_, PyAny>) -> PyResult<()> {
    register(py, IterationKind::Step, handler)
}

#[pyfunction]
pub fn patch_for_end(py: Python<'_>, handler: &Bound<'_, PyAny>) -> PyResult<()> {
    register(py, IterationKind::End, handler)
}

#[pyfunction]
pub fn unpatch_for() -> PyResult<()> {
    unregister_iteration()
}

pub(crate) fn add_functions(m: &Bound<'_, PyModule>) -> PyResult<()> {
    m.add_class::<IterationProxy>()?;
    m.add_function(wrap_pyfunction!(register_iteration_handler, m)?)?;
    m.add_function(wrap_pyfunction!(unregister_iteration_handler, m)?)?;
    m.add_function(wrap_pyfunction!(unregister_iteration, m)?)?;
    m.add_function(wrap_pyfunction!(patch_for_start, m)?)?;
    m.add_function(wrap_pyfunction!(patch_for_next, m)?)?;
    m.add_function(wrap_pyfunction!(patch_for_end, m)?)?;
    m.add_function(wrap_pyfunction!(unpatch_for, m)?)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{run, serialized};
    use pyo3::types::PyDict;

    const RECORDER: &std::ffi::CStr = c"events = []\n\
data = [1, 2, 3]\n\
def on_start(obj, filename, line):\n    if obj is data:\n        events.append(('start', line))\n\
def on_step(it, filename, line):\n    if filename == '<string>':\n        events.append(('step', type(it).__name__))\n\
def on_end(it, filename, line):\n    if filename == '<string>':\n        events.append(('end', type(it).__name__))\n\
def explode(*args):\n    raise RuntimeError('handler failure')\n";

    fn setup(py: Python<'_>) -> Bound<'_, PyDict> {
        let ns = PyDict::new(py);
        run(py, &ns, RECORDER);
        ns
    }

    fn handler<'py>(ns: &Bound<'py, PyDict>, name: &str) -> Bound<'py, PyAny> {
        ns.get_item(name).unwrap().unwrap()
    }

    fn events<'py>(ns: &Bound<'py, PyDict>) -> Vec<(String, Bound<'py, PyAny>)> {
        handler(ns, "events").extract().unwrap()
    }

    fn count(events: &[(String, Bound<'_, PyAny>)], kind: &str) -> usize {
        events.iter().filter(|(k, _)| k == kind).count()
    }

    #[test]
    fn test_three_element_loop_events() {
        let _guard = serialized();
        Python::attach(|py| {
            let ns = setup(py);
            register_iteration_handler(py, "start", &handler(&ns, "on_start")).unwrap();
            register_iteration_handler(py, "step", &handler(&ns, "on_step")).unwrap();
            register_iteration_handler(py, "end", &handler(&ns, "on_end")).unwrap();

            run(py, &ns, c"seen = []\nfor v in data:\n    seen.append(v)\n");

            let seen: Vec<i64> = handler(&ns, "seen").extract().unwrap();
            assert_eq!(seen, vec![1, 2, 3]);
            let events = events(&ns);
            assert_eq!(count(&events, "start"), 1);
            assert_eq!(count(&events, "step"), 3);
            assert_eq!(count(&events, "end"), 1);
            assert_eq!(events[0].1.extract::<i64>().unwrap(), 2);
            assert_eq!(events[1].1.extract::<String>().unwrap(), "list_iterator");
        });
    }

    #[test]
    fn test_step_count_independent_of_other_handlers() {
        let _guard = serialized();
        Python::attach(|py| {
            let ns = setup(py);
            patch_for_next(py, &handler(&ns, "on_step")).unwrap();
            run(py, &ns, c"total = 0\nfor v in data:\n    total += v\n");
            assert_eq!(handler(&ns, "total").extract::<i64>().unwrap(), 6);
            assert_eq!(count(&events(&ns), "step"), 3);
        });
    }

    #[test]
    fn test_proxy_is_not_restartable() {
        let _guard = serialized();
        Python::attach(|py| {
            let ns = setup(py);
            patch_for_end(py, &handler(&ns, "on_end")).unwrap();
            run(
                py,
                &ns,
                c"it = iter((7,))\nfirst = list(it)\nsecond = list(it)\nexhausted = it.exhausted\nkind = type(it).__name__\n",
            );
            assert_eq!(handler(&ns, "first").extract::<Vec<i64>>().unwrap(), vec![7]);
            assert!(handler(&ns, "second").extract::<Vec<i64>>().unwrap().is_empty());
            assert!(handler(&ns, "exhausted").extract::<bool>().unwrap());
            assert_eq!(handler(&ns, "kind").extract::<String>().unwrap(), "WrappedIterator");
            assert_eq!(count(&events(&ns), "end"), 1);
        });
    }

    #[test]
    fn test_raising_handlers_keep_elements() {
        let _guard = serialized();
        Python::attach(|py| {
            let ns = setup(py);
            settings::configure(py, None, None, Some("silent".into()), None).unwrap();
            let explode = handler(&ns, "explode");
            for kind in ["start", "next", "end"] {
                register_iteration_handler(py, kind, &explode).unwrap();
            }
            run(py, &ns, c"out = [c for c in 'abc']\n");
            assert_eq!(handler(&ns, "out").extract::<Vec<String>>().unwrap(), vec!["a", "b", "c"]);
            assert!(PyErr::take(py).is_none());
        });
    }

    #[test]
    fn test_unregister_iteration_restores_slots() {
        let _guard = serialized();
        Python::attach(|py| {
            let tuple = TypeRef::builtin("tuple").unwrap();
            let before = IterSlot::new(tuple).current().map(|f| f as usize);
            let ns = setup(py);
            patch_for_start(py, &handler(&ns, "on_start")).unwrap();
            patch_for_end(py, &handler(&ns, "on_end")).unwrap();
            unregister_iteration_handler("start").unwrap();
            assert!(ITERATION.is_patched());
            unpatch_for().unwrap();
            assert!(!ITERATION.is_patched());
            assert_eq!(IterSlot::new(tuple).current().map(|f| f as usize), before);

            run(py, &ns, c"kind = type(iter(data)).__name__\n");
            assert_eq!(handler(&ns, "kind").extract::<String>().unwrap(), "list_iterator");
        });
    }

    #[test]
    fn test_errors_from_real_iterator_propagate() {
        let _guard = serialized();
        Python::attach(|py| {
            let ns = setup(py);
            patch_for_next(py, &handler(&ns, "on_step")).unwrap();
            run(
                py,
                &ns,
                c"d = {'a': 1}\ntry:\n    for k in d:\n        d['b'] = 2\n    outcome = 'no error'\nexcept RuntimeError as exc:\n    outcome = type(exc).__name__\n",
            );
            assert_eq!(handler(&ns, "outcome").extract::<String>().unwrap(), "RuntimeError");
        });
    }
}
