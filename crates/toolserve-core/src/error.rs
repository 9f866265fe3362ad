use std::path::PathBuf;

use thiserror::Error;

use crate::schema::DataType;

/// Which hook a script failure came from
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Hook {
    Pre,
    Post,
}

impl std::fmt::Display for Hook {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Pre => f.write_str("pre-script"),
            Self::Post => f.write_str("post-script"),
        }
    }
}

/// Coarse classification used by the transport to pick a response status
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    /// The caller can fix the request
    Request,
    /// The host environment needs fixing (missing project root, install failure)
    Environment,
    /// The configured pre-/post-script raised
    Script,
    Internal,
}

#[derive(Debug, Error)]
pub enum Error {
    #[error("Post request containing unexpected inputs: {names:?}")]
    UnexpectedInput { names: Vec<String> },

    #[error("Post request missing required input: {name}.")]
    MissingInput { name: String },

    #[error("Input value for {name} is empty.")]
    EmptyInput { name: String },

    #[error("Input {name}: expected {expected}, but got {found}: {value}")]
    InputTypeMismatch {
        name: String,
        expected: DataType,
        found: &'static str,
        value: String,
    },

    #[error("Unsupported endpoint data type for {name}: {data_type}")]
    UnsupportedDataType { name: String, data_type: String },

    #[error("Tool returned outputs not defined in the config file: {names:?}")]
    UnexpectedOutput { names: Vec<String> },

    #[error("Output value for {name} is empty.")]
    EmptyOutput { name: String },

    #[error("Output {name}: expected {expected}, but got {found}: {value}")]
    OutputTypeMismatch {
        name: String,
        expected: DataType,
        found: &'static str,
        value: String,
    },

    #[error("No project root containing '{marker}' found above {}", start.display())]
    ProjectRootNotFound { start: PathBuf, marker: String },

    #[error("Failed to install missing dependency '{module}': {reason}")]
    DependencyInstallFailed { module: String, reason: String },

    #[error("{hook} raised {kind}: {message}")]
    UnhandledScriptError {
        hook: Hook,
        kind: String,
        message: String,
        traceback: String,
    },

    #[error("{hook} produced no readable result: {reason}")]
    ScriptProtocol { hook: Hook, reason: String },

    #[error("{context}: {source}")]
    Io {
        context: String,
        #[source]
        source: std::io::Error,
    },
}

impl Error {
    pub fn io(context: impl Into<String>, source: std::io::Error) -> Self {
        Self::Io {
            context: context.into(),
            source,
        }
    }

    pub const fn category(&self) -> ErrorCategory {
        match self {
            Self::UnexpectedInput { .. }
            | Self::MissingInput { .. }
            | Self::EmptyInput { .. }
            | Self::InputTypeMismatch { .. }
            | Self::UnsupportedDataType { .. }
            | Self::UnexpectedOutput { .. }
            | Self::EmptyOutput { .. }
            | Self::OutputTypeMismatch { .. } => ErrorCategory::Request,
            Self::ProjectRootNotFound { .. } | Self::DependencyInstallFailed { .. } => {
                ErrorCategory::Environment
            }
            Self::UnhandledScriptError { .. } => ErrorCategory::Script,
            Self::ScriptProtocol { .. } | Self::Io { .. } => ErrorCategory::Internal,
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
