//! Invocation-level failures
//!
//! None of these ever escape the dispatcher: each one becomes an HTTP-shaped
//! error reply on the invocation's reply channel.

use live_lambda_common::error_response;
use serde_json::Value;
use std::path::PathBuf;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum InvocationError {
    #[error("Invocation context carries no function name or ARN")]
    MissingIdentity,

    #[error("No manifest entry for function '{0}'")]
    FunctionNotFound(String),

    #[error("Failed to read manifest {}: {source}", .path.display())]
    ManifestRead {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Failed to parse manifest {}: {source}", .path.display())]
    ManifestParse {
        path: PathBuf,
        source: serde_json::Error,
    },

    #[error("Function '{0}' has no execution role")]
    MissingRole(String),

    #[error("{operation} failed: {message}")]
    ControlPlane {
        operation: &'static str,
        message: String,
    },

    #[error("Invalid handler '{0}'")]
    InvalidHandler(String),

    #[error("No handler code found under {}", .0.display())]
    SourceNotFound(PathBuf),

    #[error("Bundling {} failed: {message}", .entry.display())]
    Bundle { entry: PathBuf, message: String },

    #[error("{error_type}: {message}")]
    Handler {
        error_type: String,
        message: String,
        trace: Vec<String>,
    },

    #[error("Task timed out after {0}ms")]
    Timeout(u64),

    #[error("Runtime error: {0}")]
    Runtime(String),
}

impl InvocationError {
    /// Lambda-style error type reported to the caller
    pub fn error_type(&self) -> &str {
        match self {
            InvocationError::MissingIdentity => "InvalidRequest",
            InvocationError::FunctionNotFound(_) => "FunctionNotFound",
            InvocationError::ManifestRead { .. } | InvocationError::ManifestParse { .. } => {
                "ManifestError"
            }
            InvocationError::MissingRole(_) => "MissingExecutionRole",
            InvocationError::ControlPlane { .. } => "ControlPlaneError",
            InvocationError::InvalidHandler(_) => "Runtime.HandlerNotFound",
            InvocationError::SourceNotFound(_) => "Runtime.ImportModuleError",
            InvocationError::Bundle { .. } => "Runtime.BundleError",
            InvocationError::Handler { error_type, .. } => error_type,
            InvocationError::Timeout(_) => "Sandbox.Timedout",
            InvocationError::Runtime(_) => "Runtime.ExitError",
        }
    }

    /// Error reply published in place of the handler's result
    pub fn to_reply(&self) -> Value {
        match self {
            InvocationError::Handler {
                error_type,
                message,
                trace,
            } => error_response(500, error_type, message, trace),
            other => error_response(500, other.error_type(), &other.to_string(), &[]),
        }
    }
}

impl From<std::io::Error> for InvocationError {
    fn from(e: std::io::Error) -> Self {
        InvocationError::Runtime(e.to_string())
    }
}
