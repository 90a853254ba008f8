//! Source locations attached to event records.

use std::fmt;

/// Filename reported when the executing frame cannot be determined.
pub const UNKNOWN_FILE: &str = "<unknown>";

/// Line reported when the executing frame cannot be determined.
pub const UNKNOWN_LINE: i64 = -1;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SourceLocation {
    pub filename: String,
    pub line: i64,
}

impl SourceLocation {
    pub fn new(filename: impl Into<String>, line: i64) -> Self {
        SourceLocation {
            filename: filename.into(),
            line,
        }
    }

    pub fn unknown() -> Self {
        Self::new(UNKNOWN_FILE, UNKNOWN_LINE)
    }

    pub fn is_unknown(&self) -> bool {
        self.filename == UNKNOWN_FILE && self.line == UNKNOWN_LINE
    }
}

impl fmt::Display for SourceLocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.filename, self.line)
    }
}

/// Supplies the location of the code currently executing on this thread.
///
/// Resolution runs only after the recursion guard is set and a handler is known to be
/// registered, so hosts may do relatively expensive frame lookups here.
pub trait LocationResolver {
    fn resolve(&self) -> Option<SourceLocation>;

    fn resolve_or_unknown(&self) -> SourceLocation {
        self.resolve().unwrap_or_else(SourceLocation::unknown)
    }
}

impl<F> LocationResolver for F
where
    F: Fn() -> Option<SourceLocation>,
{
    fn resolve(&self) -> Option<SourceLocation> {
        self()
    }
}

/// Resolver for hosts with no frame information at all.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoLocation;

impl LocationResolver for NoLocation {
    fn resolve(&self) -> Option<SourceLocation> {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_closure_resolver() {
        let resolver = || Some(SourceLocation::new("app.py", 12));
        assert_eq!(resolver.resolve_or_unknown().to_string(), "app.py:12");
    }

    #[test]
    fn test_missing_location_falls_back_to_unknown() {
        let location = NoLocation.resolve_or_unknown();
        assert!(location.is_unknown());
        assert_eq!(location.to_string(), "<unknown>:-1");
    }
}
