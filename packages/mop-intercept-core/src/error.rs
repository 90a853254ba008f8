//! Error types for registration, configuration and frame reconstruction.

use thiserror::Error;

/// Errors surfaced to whoever registers handlers or configures the interceptors.
///
/// None of these ever reach the instrumented program through an intercepted
/// operation; they only come back from registration, configuration and teardown calls.
#[derive(Debug, Error)]
pub enum InterceptError {
    #[error("{interceptor} handler must be callable")]
    NotCallable { interceptor: &'static str },

    #[error("unknown {interceptor} event kind: {name:?}")]
    UnknownKind {
        interceptor: &'static str,
        name: String,
    },

    #[error("unknown {interceptor} target type: {name:?}")]
    UnknownType {
        interceptor: &'static str,
        name: String,
    },

    #[error("{interceptor} target type listed twice: {name:?}")]
    DuplicateType {
        interceptor: &'static str,
        name: String,
    },

    #[error("{interceptor} dispatch point is patched; unregister its handlers first")]
    PatchActive { interceptor: &'static str },

    #[error("dispatch slot {slot}: {message}")]
    Slot { slot: String, message: String },

    #[error("invalid configuration: {0}")]
    Config(#[from] toml::de::Error),

    #[error("configuration I/O: {0}")]
    Io(#[from] std::io::Error),
}

impl InterceptError {
    pub fn not_callable(interceptor: &'static str) -> Self {
        InterceptError::NotCallable { interceptor }
    }

    pub fn unknown_kind(interceptor: &'static str, name: impl Into<String>) -> Self {
        InterceptError::UnknownKind {
            interceptor,
            name: name.into(),
        }
    }

    pub fn unknown_type(interceptor: &'static str, name: impl Into<String>) -> Self {
        InterceptError::UnknownType {
            interceptor,
            name: name.into(),
        }
    }

    pub fn duplicate_type(interceptor: &'static str, name: impl Into<String>) -> Self {
        InterceptError::DuplicateType {
            interceptor,
            name: name.into(),
        }
    }

    pub fn patch_active(interceptor: &'static str) -> Self {
        InterceptError::PatchActive { interceptor }
    }

    pub fn slot(slot: impl Into<String>, message: impl Into<String>) -> Self {
        InterceptError::Slot {
            slot: slot.into(),
            message: message.into(),
        }
    }
}

/// Failure to read the data a call/return record is built from.
///
/// Aborts delivery of the single event being reconstructed and nothing else.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ReconstructError {
    #[error("frame has no code object")]
    MissingCode,

    #[error("frame attribute {0} unavailable")]
    MissingAttribute(&'static str),

    #[error("host lookup failed: {0}")]
    Host(String),
}

impl ReconstructError {
    pub fn host(message: impl Into<String>) -> Self {
        ReconstructError::Host(message.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = InterceptError::not_callable("comparison");
        assert_eq!(err.to_string(), "comparison handler must be callable");

        let err = InterceptError::unknown_kind("iteration", "middle");
        assert!(err.to_string().contains("\"middle\""));

        let err = InterceptError::slot("int.tp_richcompare", "null type");
        assert_eq!(
            err.to_string(),
            "dispatch slot int.tp_richcompare: null type"
        );
    }

    #[test]
    fn test_config_error_converts() {
        let parse = toml::from_str::<toml::Value>("= broken").unwrap_err();
        let err: InterceptError = parse.into();
        assert!(err.to_string().starts_with("invalid configuration"));
    }
}
