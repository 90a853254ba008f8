//! Raw access to built-in type objects.

use std::ffi::CStr;
use std::ptr::{addr_of_mut, NonNull};
use std::sync::atomic::{AtomicUsize, Ordering};

use mop_intercept_core::InterceptError;
use pyo3::ffi;

/// Built-in types whose slots can be patched.
pub const BUILTIN_TYPES: [&str; 7] = ["float", "int", "str", "list", "dict", "tuple", "set"];

/// Pointer to a type object that lives for the whole interpreter lifetime.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct TypeRef(NonNull<ffi::PyTypeObject>);

// SAFETY: only built-in static type objects and types reached through an object's
// type lineage are wrapped; every read and write through them happens while attached.
unsafe impl Send for TypeRef {}
unsafe impl Sync for TypeRef {}

impl TypeRef {
    /// Static type object of a built-in type, by its Python name.
    pub fn builtin(name: &str) -> Option<TypeRef> {
        // SAFETY: taking the address of an extern static does not read it.
        let ptr = unsafe {
            match name {
                "float" => addr_of_mut!(ffi::PyFloat_Type),
                "int" => addr_of_mut!(ffi::PyLong_Type),
                "str" => addr_of_mut!(ffi::PyUnicode_Type),
                "list" => addr_of_mut!(ffi::PyList_Type),
                "dict" => addr_of_mut!(ffi::PyDict_Type),
                "tuple" => addr_of_mut!(ffi::PyTuple_Type),
                "set" => addr_of_mut!(ffi::PySet_Type),
                _ => return None,
            }
        };
        NonNull::new(ptr).map(TypeRef)
    }

    /// Position of this type in [`BUILTIN_TYPES`].
    pub fn builtin_index(self) -> Option<usize> {
        BUILTIN_TYPES
            .iter()
            .position(|name| TypeRef::builtin(name) == Some(self))
    }

    /// Resolve configured names, rejecting any the interceptor does not support.
    pub fn resolve_all(
        interceptor: &'static str,
        names: &[String],
    ) -> Result<Vec<TypeRef>, InterceptError> {
        names
            .iter()
            .map(|name| {
                TypeRef::builtin(name)
                    .ok_or_else(|| InterceptError::unknown_type(interceptor, name.as_str()))
            })
            .collect()
    }

    /// Type of `obj`.
    ///
    /// # Safety
    /// `obj` must point to a live object and the caller must be attached.
    pub unsafe fn of(obj: *mut ffi::PyObject) -> Option<TypeRef> {
        NonNull::new(unsafe { ffi::Py_TYPE(obj) }).map(TypeRef)
    }

    pub fn as_ptr(self) -> *mut ffi::PyTypeObject {
        self.0.as_ptr()
    }

    pub fn name(self) -> String {
        // SAFETY: tp_name is a NUL-terminated string owned by the type object.
        unsafe { CStr::from_ptr((*self.as_ptr()).tp_name) }
            .to_string_lossy()
            .into_owned()
    }

    /// This type followed by its `tp_base` chain up to `object`.
    pub fn lineage(self) -> impl Iterator<Item = TypeRef> {
        std::iter::successors(Some(self), |ty| {
            // SAFETY: tp_base of a ready type is either NULL or another live type.
            NonNull::new(unsafe { (*ty.as_ptr()).tp_base }).map(TypeRef)
        })
    }

    /// Tell the interpreter that a slot of this type changed.
    ///
    /// # Safety
    /// Caller must be attached.
    pub unsafe fn modified(self) {
        unsafe { ffi::PyType_Modified(self.as_ptr()) }
    }
}

/// Original slot functions of one slot kind, readable from slot functions without
/// taking any lock.
///
/// An entry is written when the slot of a built-in type is patched and never cleared:
/// types created while the slot was patched inherit the replacement and still need
/// the original after restoration.
pub struct OriginalSlots {
    entries: [AtomicUsize; BUILTIN_TYPES.len()],
}

impl OriginalSlots {
    pub const fn new() -> Self {
        const EMPTY: AtomicUsize = AtomicUsize::new(0);
        OriginalSlots {
            entries: [EMPTY; BUILTIN_TYPES.len()],
        }
    }

    /// Record the address of `ty`'s original slot function.
    pub fn publish(&self, ty: TypeRef, addr: usize) {
        if let Some(idx) = ty.builtin_index() {
            self.entries[idx].store(addr, Ordering::Release);
        }
    }

    /// Original of the nearest type in `ty`'s lineage that has one.
    pub fn lookup(&self, ty: TypeRef) -> Option<usize> {
        ty.lineage()
            .filter_map(TypeRef::builtin_index)
            .map(|idx| self.entries[idx].load(Ordering::Acquire))
            .find(|&addr| addr != 0)
    }
}

impl Default for OriginalSlots {
    fn default() -> Self {
        Self::new()
    }
}
