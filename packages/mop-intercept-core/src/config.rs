//! Configuration loading for mop-intercept
//!
//! Loads configuration from a standalone TOML file or from the
//! `[tool.mop-intercept]` section of pyproject.toml

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::error::InterceptError;

/// Table name inside `[tool]`
pub const TOOL_TABLE: &str = "mop-intercept";

/// Built-in types whose comparison slot can be patched
pub const COMPARISON_TYPE_NAMES: &[&str] = &["float", "int", "str", "list", "dict", "tuple", "set"];

/// Built-in types whose iterator slot can be patched
pub const ITERATION_TYPE_NAMES: &[&str] = &["list", "tuple", "dict", "set", "str"];

/// What happens to an exception raised by a handler
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ErrorReporting {
    /// Write a warning through the `log` facade
    #[default]
    Log,
    /// Drop it
    Silent,
    /// Hand it to `sys.unraisablehook`
    Unraisable,
}

impl ErrorReporting {
    pub fn as_str(self) -> &'static str {
        match self {
            ErrorReporting::Log => "log",
            ErrorReporting::Silent => "silent",
            ErrorReporting::Unraisable => "unraisable",
        }
    }

    pub fn parse(text: &str) -> Option<Self> {
        match text.trim().to_ascii_lowercase().as_str() {
            "log" => Some(ErrorReporting::Log),
            "silent" => Some(ErrorReporting::Silent),
            "unraisable" => Some(ErrorReporting::Unraisable),
            _ => None,
        }
    }
}

/// Main configuration structure
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case")]
pub struct InterceptConfig {
    /// Types whose comparisons are intercepted
    #[serde(default = "default_comparison_types")]
    pub comparison_types: Vec<String>,

    /// Types whose iterators are wrapped
    #[serde(default = "default_iteration_types")]
    pub iteration_types: Vec<String>,

    #[serde(default)]
    pub handler_errors: ErrorReporting,

    /// Also install the profile hook for threads started later via `threading`
    #[serde(default = "default_profile_new_threads")]
    pub profile_new_threads: bool,
}

fn default_comparison_types() -> Vec<String> {
    COMPARISON_TYPE_NAMES.iter().map(|s| s.to_string()).collect()
}

fn default_iteration_types() -> Vec<String> {
    ITERATION_TYPE_NAMES.iter().map(|s| s.to_string()).collect()
}

fn default_profile_new_threads() -> bool {
    true
}

impl Default for InterceptConfig {
    fn default() -> Self {
        Self {
            comparison_types: default_comparison_types(),
            iteration_types: default_iteration_types(),
            handler_errors: ErrorReporting::default(),
            profile_new_threads: default_profile_new_threads(),
        }
    }
}

fn check_types(
    interceptor: &'static str,
    names: &[String],
    supported: &[&str],
) -> Result<(), InterceptError> {
    if let Some(unknown) = names.iter().find(|name| !supported.contains(&name.as_str())) {
        return Err(InterceptError::unknown_type(interceptor, unknown.as_str()));
    }
    // Two entries for one type would mean two patch records for one slot.
    for (idx, name) in names.iter().enumerate() {
        if names[..idx].contains(name) {
            return Err(InterceptError::duplicate_type(interceptor, name.as_str()));
        }
    }
    Ok(())
}

impl InterceptConfig {
    /// Reject type names the interceptors do not support, and repeated ones
    pub fn validate(&self) -> Result<(), InterceptError> {
        check_types("comparison", &self.comparison_types, COMPARISON_TYPE_NAMES)?;
        check_types("iteration", &self.iteration_types, ITERATION_TYPE_NAMES)
    }

    /// Parse a standalone TOML document
    pub fn from_toml_str(content: &str) -> Result<Self, InterceptError> {
        let config: InterceptConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Parse the `[tool.mop-intercept]` table of a pyproject.toml, if present
    pub fn from_pyproject_str(content: &str) -> Result<Option<Self>, InterceptError> {
        let value: toml::Value = toml::from_str(content)?;
        let Some(table) = value.get("tool").and_then(|tool| tool.get(TOOL_TABLE)) else {
            return Ok(None);
        };
        let config: InterceptConfig = table.clone().try_into()?;
        config.validate()?;
        Ok(Some(config))
    }

    /// Load from `path`, or discover a pyproject.toml from the current directory.
    ///
    /// A file named `pyproject.toml` is read through its tool table; anything else is
    /// a standalone document. Falls back to defaults when nothing is found.
    pub fn load(path: Option<&Path>) -> Result<Self, InterceptError> {
        let config_path = match path {
            Some(p) => p.to_path_buf(),
            None => match find_config_pyproject_toml(&std::env::current_dir()?) {
                Some(found) => found,
                None => return Ok(Self::default()),
            },
        };

        let content = std::fs::read_to_string(&config_path)?;
        let config = if is_pyproject(&config_path) {
            Self::from_pyproject_str(&content)?.unwrap_or_default()
        } else {
            Self::from_toml_str(&content)?
        };
        log::info!("loaded mop-intercept configuration from {}", config_path.display());
        Ok(config)
    }
}

fn is_pyproject(path: &Path) -> bool {
    path.file_name().is_some_and(|name| name == "pyproject.toml")
}

/// Find pyproject.toml with a [tool.mop-intercept] section, walking up from `start_path`
pub fn find_config_pyproject_toml(start_path: &Path) -> Option<PathBuf> {
    let mut current = if start_path.is_file() {
        start_path.parent()?
    } else {
        start_path
    };

    loop {
        let pyproject = current.join("pyproject.toml");
        if pyproject.exists() {
            if let Ok(content) = std::fs::read_to_string(&pyproject) {
                if let Ok(value) = toml::from_str::<toml::Value>(&content) {
                    if let Some(tool) = value.get("tool") {
                        if tool.get(TOOL_TABLE).is_some() {
                            return Some(pyproject);
                        }
                    }
                }
            }
        }

        current = current.parent()?;
    }
}
