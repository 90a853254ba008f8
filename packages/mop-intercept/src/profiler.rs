//! Call/return profiling through the interpreter's profile hook.

use mop_intercept_core::{
    dispatch_frame_event, CallRecord, DispatchPoint, DispatchSlot, EventKind, FrameIntrospect,
    InterceptError, ProfileKind, ReconstructError, SourceLocation,
};
use once_cell::sync::Lazy;
use pyo3::prelude::*;
use pyo3::types::{PyDict, PyString, PyTuple};
use pyo3::IntoPyObject;

use crate::error::{intercept_error_to_pyerr, slot_failure};
use crate::handler::PyHandler;
use crate::location::frame_location;
use crate::settings;

/// Where the hook gets installed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProfileSlot {
    /// `sys.setprofile`: the registering thread.
    Current,
    /// `threading.setprofile`: threads started later through `threading`.
    NewThreads,
}

impl ProfileSlot {
    fn module(self) -> &'static str {
        match self {
            ProfileSlot::Current => "sys",
            ProfileSlot::NewThreads => "threading",
        }
    }

    fn installed<'py>(self, py: Python<'py>) -> PyResult<Bound<'py, PyAny>> {
        let module = py.import(self.module())?;
        match self {
            ProfileSlot::Current => module.getattr("getprofile")?.call0(),
            // threading.getprofile only exists on 3.10+
            ProfileSlot::NewThreads => match module.getattr("getprofile") {
                Ok(getter) => getter.call0(),
                Err(_) => module.getattr("_profile_hook"),
            },
        }
    }

    fn set(self, py: Python<'_>, hook: Option<&Bound<'_, PyAny>>) -> PyResult<()> {
        let setter = py.import(self.module())?.getattr("setprofile")?;
        match hook {
            Some(hook) => setter.call1((hook,))?,
            None => setter.call1((py.None(),))?,
        };
        Ok(())
    }
}

impl DispatchSlot for ProfileSlot {
    type Func = Py<PyAny>;

    fn label(&self) -> String {
        format!("{}.setprofile", self.module())
    }

    /// The profiler installed by someone else, if any.
    fn current(&self) -> Option<Py<PyAny>> {
        Python::attach(|py| {
            let installed = self.installed(py).ok()?;
            if installed.is_none() || installed.is_instance_of::<ProfileHook>() {
                return None;
            }
            if !installed.is_callable() {
                log::warn!(
                    "{} holds a non-callable profiler; it will not be chained",
                    self.label()
                );
                return None;
            }
            Some(installed.unbind())
        })
    }

    fn is_replacement(&self, func: &Py<PyAny>) -> bool {
        Python::attach(|py| func.bind(py).is_instance_of::<ProfileHook>())
    }

    fn install(&self) -> Result<(), InterceptError> {
        Python::attach(|py| {
            let hook = Bound::new(
                py,
                ProfileHook {
                    previous: self.current(),
                },
            )?;
            self.set(py, Some(hook.as_any()))
        })
        .map_err(|err| slot_failure(&self.label(), err))
    }

    fn restore(&self, original: Option<Py<PyAny>>) -> Result<(), InterceptError> {
        Python::attach(|py| self.set(py, original.as_ref().map(|p| p.bind(py))))
            .map_err(|err| slot_failure(&self.label(), err))
    }
}

pub type ProfilePoint = DispatchPoint<ProfileKind, PyHandler, ProfileSlot>;

pub static PROFILE: Lazy<ProfilePoint> =
    Lazy::new(|| DispatchPoint::new(profile_slots(settings::snapshot().profile_new_threads)));

pub fn profile_slots(new_threads: bool) -> Vec<ProfileSlot> {
    if new_threads {
        vec![ProfileSlot::Current, ProfileSlot::NewThreads]
    } else {
        vec![ProfileSlot::Current]
    }
}

/// A Python frame seen through the profiler's eyes.
pub struct PyFrameView<'py> {
    frame: Bound<'py, PyAny>,
}

fn attr<'py>(
    obj: &Bound<'py, PyAny>,
    name: &'static str,
) -> Result<Bound<'py, PyAny>, ReconstructError> {
    obj.getattr(name)
        .map_err(|_| ReconstructError::MissingAttribute(name))
}

fn host(err: PyErr) -> ReconstructError {
    ReconstructError::host(err.to_string())
}

/// Values of a mapping (dict or frame-locals proxy).
fn mapping_values<'py>(
    mapping: &Bound<'py, PyAny>,
) -> Result<Vec<Bound<'py, PyAny>>, ReconstructError> {
    mapping
        .call_method0("values")
        .and_then(|values| values.try_iter())
        .map_err(host)?
        .map(|value| value.map_err(host))
        .collect()
}

impl<'py> FrameIntrospect for PyFrameView<'py> {
    type Value = Bound<'py, PyAny>;

    fn function_name(&self) -> Result<String, ReconstructError> {
        let code = self
            .frame
            .getattr("f_code")
            .map_err(|_| ReconstructError::MissingCode)?;
        attr(&code, "co_name")?.extract::<String>().map_err(host)
    }

    fn location(&self) -> Result<SourceLocation, ReconstructError> {
        frame_location(&self.frame).ok_or(ReconstructError::MissingCode)
    }

    fn local_bindings(&self) -> Result<Vec<(String, Bound<'py, PyAny>)>, ReconstructError> {
        let locals = attr(&self.frame, "f_locals")?;
        let items = locals
            .call_method0("items")
            .and_then(|items| items.try_iter())
            .map_err(host)?;
        let mut bindings = Vec::new();
        for item in items {
            let (name, value): (Bound<'py, PyAny>, Bound<'py, PyAny>) =
                item.and_then(|item| item.extract()).map_err(host)?;
            // Non-string keys only appear in locals mutated through the dict directly.
            if let Ok(name) = name.extract::<String>() {
                bindings.push((name, value));
            }
        }
        Ok(bindings)
    }

    fn caller_values(&self) -> Result<Vec<Bound<'py, PyAny>>, ReconstructError> {
        let caller = attr(&self.frame, "f_back")?;
        if caller.is_none() {
            return Ok(Vec::new());
        }
        mapping_values(&attr(&caller, "f_locals")?)
    }

    fn global_values(&self) -> Result<Vec<Bound<'py, PyAny>>, ReconstructError> {
        mapping_values(&attr(&self.frame, "f_globals")?)
    }

    fn identity(&self, value: &Bound<'py, PyAny>) -> usize {
        value.as_ptr() as usize
    }
}

fn bindings_dict<'py>(
    py: Python<'py>,
    bindings: &[(String, Bound<'py, PyAny>)],
) -> PyResult<Bound<'py, PyDict>> {
    let dict = PyDict::new(py);
    for (name, value) in bindings {
        dict.set_item(name, value)?;
    }
    Ok(dict)
}

/// `(function_name, filename, line, locals, own, inherited[, return_value])`
fn record_args<'py>(
    py: Python<'py>,
    record: &CallRecord<Bound<'py, PyAny>>,
) -> PyResult<Bound<'py, PyTuple>> {
    let mut args = vec![
        PyString::new(py, &record.function).into_any(),
        PyString::new(py, &record.location.filename).into_any(),
        record.location.line.into_pyobject(py)?.into_any(),
        bindings_dict(py, &record.bindings.all)?.into_any(),
        bindings_dict(py, &record.bindings.own)?.into_any(),
        bindings_dict(py, &record.bindings.inherited)?.into_any(),
    ];
    if let Some(returned) = &record.returned {
        args.push(returned.clone());
    }
    PyTuple::new(py, args)
}

/// The callable installed with `setprofile`.
///
/// Forwards every event to the profiler that was installed before it, then
/// dispatches `call` and `return` events. Never raises: a profile function that
/// raises is uninstalled by the interpreter.
#[pyclass(frozen, name = "ProfileHook", module = "mop_intercept")]
pub struct ProfileHook {
    previous: Option<Py<PyAny>>,
}

#[pymethods]
impl ProfileHook {
    fn __call__(
        &self,
        py: Python<'_>,
        frame: Bound<'_, PyAny>,
        event: &str,
        arg: Bound<'_, PyAny>,
    ) {
        if let Some(previous) = &self.previous {
            if let Err(err) = previous.bind(py).call1((&frame, event, &arg)) {
                log::debug!("chained profiler raised: {err}");
            }
        }

        let Some(kind) = ProfileKind::from_event(event) else {
            return;
        };
        let returned = (kind == ProfileKind::Return).then(|| arg.clone());
        let view = PyFrameView { frame };
        dispatch_frame_event(&PROFILE, kind, &view, returned, |handler: &PyHandler, record| {
            handler.call(py, record_args(py, record))
        });
    }

    #[getter]
    fn previous(&self, py: Python<'_>) -> Option<Py<PyAny>> {
        self.previous.as_ref().map(|p| p.clone_ref(py))
    }
}

// Installing and removing the hook runs Python code under the point's lock, and that
// code may let the GIL go. Registration therefore waits for the lock detached, so a
// thread blocked on it never holds the GIL the lock owner needs.
fn register(kind: ProfileKind, handler: &Bound<'_, PyAny>) -> PyResult<()> {
    let py = handler.py();
    let handler = PyHandler::new(handler, ProfileKind::INTERCEPTOR)?;
    let registration = py
        .detach(|| PROFILE.register(kind, handler))
        .map_err(intercept_error_to_pyerr)?;
    if registration.newly_patched {
        log::info!("profile hook installed");
    }
    Ok(())
}

fn unregister(py: Python<'_>, kind: ProfileKind) -> PyResult<()> {
    let (removed, patched) = py
        .detach(|| PROFILE.unregister(kind).map(|removed| (removed, PROFILE.is_patched())))
        .map_err(intercept_error_to_pyerr)?;
    if removed.is_some() && !patched {
        log::info!("profile hook removed");
    }
    Ok(())
}

#[pyfunction]
pub fn register_call_handler(handler: &Bound<'_, PyAny>) -> PyResult<()> {
    register(ProfileKind::Call, handler)
}

#[pyfunction]
pub fn register_return_handler(handler: &Bound<'_, PyAny>) -> PyResult<()> {
    register(ProfileKind::Return, handler)
}

#[pyfunction]
pub fn unregister_call_handler(py: Python<'_>) -> PyResult<()> {
    unregister(py, ProfileKind::Call)
}

#[pyfunction]
pub fn unregister_return_handler(py: Python<'_>) -> PyResult<()> {
    unregister(py, ProfileKind::Return)
}

#[pyfunction]
pub fn on_call(handler: &Bound<'_, PyAny>) -> PyResult<()> {
    register(ProfileKind::Call, handler)
}

#[pyfunction]
pub fn on_return(handler: &Bound<'_, PyAny>) -> PyResult<()> {
    register(ProfileKind::Return, handler)
}

pub(crate) fn add_functions(m: &Bound<'_, PyModule>) -> PyResult<()> {
    m.add_class::<ProfileHook>()?;
    m.add_function(wrap_pyfunction!(register_call_handler, m)?)?;
    m.add_function(wrap_pyfunction!(register_return_handler, m)?)?;
    m.add_function(wrap_pyfunction!(unregister_call_handler, m)?)?;
    m.add_function(wrap_pyfunction!(unregister_return_handler, m)?)?;
    m.add_function(wrap_pyfunction!(on_call, m)?)?;
    m.add_function(wrap_pyfunction!(on_return, m)?)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{run, serialized};

    const PROGRAM: &std::ffi::CStr = c"import sys\n\
calls = []\n\
returns = []\n\
g = 5\n\
def f(x):\n    y = x + g\n    return y\n\
def on_call(name, filename, line, local_vars, own, inherited):\n    if name == 'f':\n        calls.append((dict(local_vars), dict(own), dict(inherited), line))\n\
def on_return(name, filename, line, local_vars, own, inherited, value):\n    if name == 'f':\n        returns.append((dict(own), value))\n";

    fn setup(py: Python<'_>) -> Bound<'_, PyDict> {
        let ns = PyDict::new(py);
        run(py, &ns, PROGRAM);
        ns
    }

    fn item<'py>(ns: &Bound<'py, PyDict>, name: &str) -> Bound<'py, PyAny> {
        ns.get_item(name).unwrap().unwrap()
    }

    #[test]
    fn test_call_record_separates_own_arguments_from_globals() {
        let _guard = serialized();
        Python::attach(|py| {
            let ns = setup(py);
            register_call_handler(&item(&ns, "on_call")).unwrap();
            register_return_handler(&item(&ns, "on_return")).unwrap();
            run(py, &ns, c"result = f(x=1000)\n");

            assert_eq!(item(&ns, "result").extract::<i64>().unwrap(), 1005);

            let calls = item(&ns, "calls");
            assert_eq!(calls.len().unwrap(), 1);
            let (locals, own, _inherited, line): (
                Bound<'_, PyDict>,
                Bound<'_, PyDict>,
                Bound<'_, PyDict>,
                i64,
            ) = calls.get_item(0).unwrap().extract().unwrap();
            assert!(locals.contains("x").unwrap());
            assert!(own.contains("x").unwrap());
            assert!(!own.contains("g").unwrap());
            assert_eq!(line, 5);

            let returns = item(&ns, "returns");
            assert_eq!(returns.len().unwrap(), 1);
            let (own, value): (Bound<'_, PyDict>, i64) =
                returns.get_item(0).unwrap().extract().unwrap();
            assert_eq!(value, 1005);
            assert!(own.contains("y").unwrap());
        });
    }

    #[test]
    fn test_hook_installed_and_removed_with_handlers() {
        let _guard = serialized();
        Python::attach(|py| {
            let ns = setup(py);
            let sys = py.import("sys").unwrap();
            assert!(sys.getattr("getprofile").unwrap().call0().unwrap().is_none());

            register_call_handler(&item(&ns, "on_call")).unwrap();
            let installed = sys.getattr("getprofile").unwrap().call0().unwrap();
            assert!(installed.is_instance_of::<ProfileHook>());

            register_return_handler(&item(&ns, "on_return")).unwrap();
            unregister_call_handler(py).unwrap();
            assert!(PROFILE.is_patched());
            unregister_return_handler(py).unwrap();
            assert!(sys.getattr("getprofile").unwrap().call0().unwrap().is_none());
        });
    }

    #[test]
    fn test_previous_profiler_keeps_receiving_events() {
        let _guard = serialized();
        Python::attach(|py| {
            let ns = setup(py);
            run(
                py,
                &ns,
                c"seen = []\ndef outer(frame, event, arg):\n    seen.append(event)\nsys.setprofile(outer)\n",
            );
            register_call_handler(&item(&ns, "on_call")).unwrap();
            run(py, &ns, c"f(1)\nlen('abc')\n");

            let seen: Vec<String> = item(&ns, "seen").extract().unwrap();
            assert!(seen.iter().any(|e| e == "call"));
            assert!(seen.iter().any(|e| e == "c_call"));
            assert_eq!(item(&ns, "calls").len().unwrap(), 1);

            unregister_call_handler(py).unwrap();
            let restored = py
                .import("sys")
                .unwrap()
                .getattr("getprofile")
                .unwrap()
                .call0()
                .unwrap();
            assert!(restored.is(&item(&ns, "outer")));
            run(py, &ns, c"sys.setprofile(None)\n");
        });
    }

    #[test]
    fn test_concurrent_registration_from_threads() {
        let _guard = serialized();
        Python::attach(|py| {
            let ns = setup(py);
            let sys = py.import("sys").unwrap();
            let interval = sys.getattr("getswitchinterval").unwrap().call0().unwrap();
            // Force frequent GIL hand-offs while the hook is being swapped.
            sys.getattr("setswitchinterval").unwrap().call1((1e-6,)).unwrap();

            let handler = item(&ns, "on_call").unbind();
            let workers: Vec<_> = (0..4)
                .map(|worker| {
                    let handler = handler.clone_ref(py);
                    std::thread::spawn(move || {
                        Python::attach(|py| {
                            for _ in 0..25 {
                                if worker % 2 == 0 {
                                    register_call_handler(handler.bind(py)).unwrap();
                                    unregister_call_handler(py).unwrap();
                                } else {
                                    register_return_handler(handler.bind(py)).unwrap();
                                    unregister_return_handler(py).unwrap();
                                }
                            }
                        })
                    })
                })
                .collect();
            py.detach(|| {
                for worker in workers {
                    worker.join().unwrap();
                }
            });

            sys.getattr("setswitchinterval").unwrap().call1((interval,)).unwrap();
            assert!(!PROFILE.is_patched());
            assert_eq!(PROFILE.holders(), 0);
        });
    }

    #[test]
    fn test_raising_handler_does_not_disable_hook() {
        let _guard = serialized();
        Python::attach(|py| {
            let ns = setup(py);
            settings::configure(py, None, None, Some("silent".into()), None).unwrap();
            run(
                py,
                &ns,
                c"hits = []\ndef explode(name, *rest):\n    if name == 'f':\n        hits.append(name)\n        raise KeyError(name)\n",
            );
            on_call(&item(&ns, "explode")).unwrap();
            run(py, &ns, c"a = f(1)\nb = f(2)\n");
            assert_eq!(item(&ns, "b").extract::<i64>().unwrap(), 7);
            assert_eq!(item(&ns, "hits").len().unwrap(), 2);
            assert!(PyErr::take(py).is_none());
        });
    }
}
