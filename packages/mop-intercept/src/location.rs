//! Source locations of executing Python frames.

use mop_intercept_core::location::UNKNOWN_LINE;
use mop_intercept_core::SourceLocation;
use pyo3::prelude::*;

/// Location of a frame object. `None` if it has no code object or filename.
pub fn frame_location(frame: &Bound<'_, PyAny>) -> Option<SourceLocation> {
    if frame.is_none() {
        return None;
    }
    let code = frame.getattr("f_code").ok()?;
    let filename = code.getattr("co_filename").ok()?.extract::<String>().ok()?;
    // f_lineno is None while a frame is being set up on some versions
    let line = frame
        .getattr("f_lineno")
        .ok()
        .and_then(|line| line.extract::<Option<i64>>().ok().flatten())
        .unwrap_or(UNKNOWN_LINE);
    Some(SourceLocation::new(filename, line))
}

/// Location of the innermost Python frame on this thread.
///
/// Native code pushes no frames, so from inside a slot function this is the frame
/// whose bytecode triggered the intercepted operation.
pub fn current_location(py: Python<'_>) -> Option<SourceLocation> {
    let frame = py
        .import("sys")
        .ok()?
        .getattr("_getframe")
        .ok()?
        .call0()
        .ok()?;
    frame_location(&frame)
}
