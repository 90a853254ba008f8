//! Comparison interception through `tp_richcompare`.

use std::os::raw::c_int;

use mop_intercept_core::{
    intercept_compare, CompareOp, DispatchPoint, DispatchSlot, EventKind, InterceptError,
};
use once_cell::sync::Lazy;
use pyo3::ffi;
use pyo3::prelude::*;
use pyo3::IntoPyObject;

use crate::error::intercept_error_to_pyerr;
use crate::handler::PyHandler;
use crate::location::current_location;
use crate::settings;
use crate::type_slot::{OriginalSlots, TypeRef};

/// The `tp_richcompare` slot of one built-in type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RichCompareSlot {
    ty: TypeRef,
}

impl RichCompareSlot {
    pub fn new(ty: TypeRef) -> Self {
        RichCompareSlot { ty }
    }
}

impl DispatchSlot for RichCompareSlot {
    type Func = ffi::richcmpfunc;

    fn label(&self) -> String {
        format!("{}.tp_richcompare", self.ty.name())
    }

    fn current(&self) -> Option<ffi::richcmpfunc> {
        unsafe { (*self.ty.as_ptr()).tp_richcompare }
    }

    fn is_replacement(&self, func: &ffi::richcmpfunc) -> bool {
        is_intercepted(*func)
    }

    fn install(&self) -> Result<(), InterceptError> {
        unsafe {
            let slot = &mut (*self.ty.as_ptr()).tp_richcompare;
            if let Some(func) = *slot {
                if !is_intercepted(func) {
                    ORIGINAL_RICHCOMPARE.publish(self.ty, func as usize);
                }
            }
            *slot = Some(intercepted_richcompare);
            self.ty.modified();
        }
        Ok(())
    }

    fn restore(&self, original: Option<ffi::richcmpfunc>) -> Result<(), InterceptError> {
        unsafe {
            (*self.ty.as_ptr()).tp_richcompare = original;
            self.ty.modified();
        }
        Ok(())
    }
}

pub type ComparisonPoint = DispatchPoint<CompareOp, PyHandler, RichCompareSlot>;

pub static COMPARISON: Lazy<ComparisonPoint> = Lazy::new(|| {
    let types = settings::snapshot().comparison_types;
    DispatchPoint::new(comparison_slots(&types).unwrap_or_default())
});

pub fn comparison_slots(types: &[String]) -> Result<Vec<RichCompareSlot>, InterceptError> {
    Ok(TypeRef::resolve_all(CompareOp::INTERCEPTOR, types)?
        .into_iter()
        .map(RichCompareSlot::new)
        .collect())
}

static ORIGINAL_RICHCOMPARE: OriginalSlots = OriginalSlots::new();

fn is_intercepted(func: ffi::richcmpfunc) -> bool {
    func as usize == intercepted_richcompare as usize
}

/// Original comparison of the nearest patched type in `obj`'s lineage.
unsafe fn original_richcompare(obj: *mut ffi::PyObject) -> Option<ffi::richcmpfunc> {
    let ty = unsafe { TypeRef::of(obj) }?;
    ORIGINAL_RICHCOMPARE.lookup(ty).map(|addr| {
        // SAFETY: only tp_richcompare functions are published to this table.
        unsafe { std::mem::transmute::<usize, ffi::richcmpfunc>(addr) }
    })
}

unsafe fn call_original(
    original: Option<ffi::richcmpfunc>,
    a: *mut ffi::PyObject,
    b: *mut ffi::PyObject,
    op: c_int,
) -> *mut ffi::PyObject {
    match original {
        Some(func) => unsafe { func(a, b, op) },
        None => unsafe {
            // Lets the interpreter fall back to the reflected or identity comparison.
            let not_implemented = ffi::Py_NotImplemented();
            ffi::Py_IncRef(not_implemented);
            not_implemented
        },
    }
}

/// Replacement written into every patched `tp_richcompare`.
///
/// `a` is always an instance of the type (or a subtype of the type) whose slot is
/// being called.
pub unsafe extern "C" fn intercepted_richcompare(
    a: *mut ffi::PyObject,
    b: *mut ffi::PyObject,
    op: c_int,
) -> *mut ffi::PyObject {
    // SAFETY: the interpreter only calls type slots from attached threads.
    let py = unsafe { Python::assume_attached() };
    let original = unsafe { original_richcompare(a) };
    let Some(op_kind) = CompareOp::from_raw(op) else {
        return unsafe { call_original(original, a, b, op) };
    };

    let lhs = unsafe { Bound::from_borrowed_ptr(py, a) };
    let rhs = unsafe { Bound::from_borrowed_ptr(py, b) };
    intercept_compare(
        &COMPARISON,
        op_kind,
        &lhs,
        &rhs,
        &|| current_location(py),
        |handler: &PyHandler, event| {
            let args = (
                event.lhs,
                event.rhs,
                &event.location.filename,
                event.location.line,
            )
                .into_pyobject(py);
            handler.call(py, args)
        },
        || unsafe { call_original(original, a, b, op) },
    )
}

fn register(op: CompareOp, handler: &Bound<'_, PyAny>) -> PyResult<()> {
    let handler = PyHandler::new(handler, CompareOp::INTERCEPTOR)?;
    let registration = COMPARISON
        .register(op, handler)
        .map_err(intercept_error_to_pyerr)?;
    if registration.newly_patched {
        log::info!("comparison interception enabled");
    }
    Ok(())
}

fn unregister(op: CompareOp) -> PyResult<()> {
    let removed = COMPARISON.unregister(op).map_err(intercept_error_to_pyerr)?;
    if removed.is_some() && !COMPARISON.is_patched() {
        log::info!("comparison interception disabled");
    }
    Ok(())
}

fn parse_op(op: &str) -> PyResult<CompareOp> {
    CompareOp::parse(op).map_err(intercept_error_to_pyerr)
}

/// Route comparisons with operator `op` (`"eq"`, `"EQ"`, `"=="`, ...) to `handler`.
#[pyfunction]
pub fn register_comparison_handler(op: &str, handler: &Bound<'_, PyAny>) -> PyResult<()> {
    register(parse_op(op)?, handler)
}

#[pyfunction]
pub fn unregister_comparison_handler(op: &str) -> PyResult<()> {
    unregister(parse_op(op)?)
}

macro_rules! comparison_aliases {
    ($($patch:ident, $unpatch:ident => $op:expr;)*) => {
        $(
            #[pyfunction]
            pub fn $patch(handler: &Bound<'_, PyAny>) -> PyResult<()> {
                register($op, handler)
            }

            #[pyfunction]
            pub fn $unpatch() -> PyResult<()> {
                unregister($op)
            }
        )*

        pub(crate) fn add_functions(m: &Bound<'_, PyModule>) -> PyResult<()> {
            m.add_function(wrap_pyfunction!(register_comparison_handler, m)?)?;
            m.add_function(wrap_pyfunction!(unregister_comparison_handler, m)?)?;
            $(
                m.add_function(wrap_pyfunction!($patch, m)?)?;
                m.add_function(wrap_pyfunction!($unpatch, m)?)?;
            )*
            Ok(())
        }
    };
}

comparison_aliases! {
    patch_eq, unpatch_eq => CompareOp::Eq;
    patch_ne, unpatch_ne => CompareOp::Ne;
    patch_gt, unpatch_gt => CompareOp::Gt;
    patch_lt, unpatch_lt => CompareOp::Lt;
    patch_ge, unpatch_ge => CompareOp::Ge;
    patch_le, unpatch_le => CompareOp::Le;
}
