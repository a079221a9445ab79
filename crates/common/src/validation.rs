//! Input validation for identifiers that end up in channel names, STS calls
//! or the runtime bootstrap
//!
//! Request ids arrive from the relay and are embedded in the reply channel
//! name, so they must stay a single channel segment.

use once_cell::sync::Lazy;
use regex::Regex;
use thiserror::Error;

/// Request ids are one channel segment (relay restriction: alphanumerics and
/// dashes, at most 50)
static REQUEST_ID_REGEX: Lazy<Regex> = Lazy::new(|| Regex::new(r"^[A-Za-z0-9-]{1,50}$").unwrap());

/// Channel namespaces (relay restriction)
static NAMESPACE_REGEX: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[A-Za-z0-9](?:[A-Za-z0-9-]{0,48}[A-Za-z0-9])?$").unwrap());

/// JavaScript identifier naming a handler export
static EXPORT_NAME_REGEX: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[A-Za-z_$][A-Za-z0-9_$]*$").unwrap());

/// Validation errors
#[derive(Debug, Error)]
pub enum ValidationError {
    #[error("Invalid request ID format: {0}")]
    InvalidRequestId(String),

    #[error("Invalid channel namespace: {0}")]
    InvalidNamespace(String),

    #[error("Invalid handler export name: {0}")]
    InvalidExportName(String),
}

/// Validate request ID format
///
/// # Examples
///
/// ```
/// use live_lambda_common::validation::validate_request_id;
///
/// assert!(validate_request_id("c6af9ac6-7b61-11e6-9a41-93e8deadbeef").is_ok());
/// assert!(validate_request_id("../requests").is_err());
/// ```
pub fn validate_request_id(id: &str) -> Result<(), ValidationError> {
    if !REQUEST_ID_REGEX.is_match(id) {
        return Err(ValidationError::InvalidRequestId(
            id.chars().take(50).collect::<String>(), // Limit error message
        ));
    }
    Ok(())
}

/// Validate a channel namespace
pub fn validate_namespace(namespace: &str) -> Result<(), ValidationError> {
    if !NAMESPACE_REGEX.is_match(namespace) {
        return Err(ValidationError::InvalidNamespace(
            namespace.chars().take(50).collect::<String>(),
        ));
    }
    Ok(())
}

/// Validate the export half of a `file.export` handler string
pub fn validate_export_name(name: &str) -> Result<(), ValidationError> {
    if !EXPORT_NAME_REGEX.is_match(name) {
        return Err(ValidationError::InvalidExportName(
            name.chars().take(50).collect::<String>(),
        ));
    }
    Ok(())
}
