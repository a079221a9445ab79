//! Build manifest lookup
//!
//! The manifest maps stack name to stack outputs. Each tunneled function
//! contributes a group of keys sharing a prefix:
//!
//! ```json
//! {
//!   "Stack": {
//!     "FnArn": "arn:aws:lambda:us-east-1:123:function:f1",
//!     "FnHandler": "index.handler",
//!     "FnCdkOutAssetPath": "/out/f1"
//!   }
//! }
//! ```
//!
//! The file is read again on every lookup since deployments rewrite it while
//! the tunnel keeps running.

use crate::error::InvocationError;
use live_lambda_common::constants::{DEFAULT_HANDLER_EXPORT, DEFAULT_HANDLER_FILE};
use live_lambda_common::protocol::function_name_from_arn;
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tracing::debug;

const ARN_SUFFIX: &str = "Arn";
const HANDLER_SUFFIX: &str = "Handler";
const ASSET_PATH_SUFFIX: &str = "CdkOutAssetPath";
const ROLE_ARN_SUFFIX: &str = "RoleArn";
const SOURCE_MAP_SUFFIX: &str = "SourceMap";

/// One function's group of manifest outputs
#[derive(Debug, Clone, PartialEq)]
pub struct FunctionManifestEntry {
    /// `{stack}/{prefix}`
    pub logical_id: String,
    pub function_arn: String,
    pub function_name: Option<String>,
    pub role_arn: Option<String>,
    /// Declared `file.export` handler string
    pub handler: String,
    pub asset_path: PathBuf,
    pub source_map: Option<PathBuf>,
}

impl FunctionManifestEntry {
    fn matches(&self, identity: &str) -> bool {
        if self.function_arn == identity {
            return true;
        }
        let wanted = function_name_from_arn(identity).unwrap_or(identity);
        self.function_name.as_deref() == Some(wanted)
    }
}

/// What the sandbox needs to run a function
#[derive(Debug, Clone, PartialEq)]
pub struct ResolvedFunction {
    pub logical_id: String,
    pub function_arn: String,
    pub role_arn: Option<String>,
    /// Module path relative to the asset directory, without extension
    pub handler_file: String,
    pub handler_export: String,
    pub asset_path: PathBuf,
    pub source_map: Option<PathBuf>,
}

/// Reads the manifest at a fixed path
#[derive(Debug, Clone)]
pub struct ManifestResolver {
    path: PathBuf,
}

impl ManifestResolver {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Look a function up by ARN or name. `Ok(None)` means no entry matches.
    pub async fn resolve(
        &self,
        identity: &str,
    ) -> Result<Option<ResolvedFunction>, InvocationError> {
        let entries = self.load().await?;
        let found = entries.into_iter().find(|entry| entry.matches(identity));

        Ok(found.map(|entry| {
            let (handler_file, handler_export) = split_handler(&entry.handler);
            debug!(
                "Resolved {} to {} ({}.{})",
                identity, entry.logical_id, handler_file, handler_export
            );
            ResolvedFunction {
                logical_id: entry.logical_id,
                function_arn: entry.function_arn,
                role_arn: entry.role_arn,
                handler_file,
                handler_export,
                asset_path: entry.asset_path,
                source_map: entry.source_map,
            }
        }))
    }

    /// Every function entry currently in the manifest
    pub async fn load(&self) -> Result<Vec<FunctionManifestEntry>, InvocationError> {
        let raw = tokio::fs::read_to_string(&self.path)
            .await
            .map_err(|source| InvocationError::ManifestRead {
                path: self.path.clone(),
                source,
            })?;
        let manifest: BTreeMap<String, Value> =
            serde_json::from_str(&raw).map_err(|source| InvocationError::ManifestParse {
                path: self.path.clone(),
                source,
            })?;

        Ok(manifest
            .iter()
            .filter_map(|(stack, outputs)| outputs.as_object().map(|o| (stack, o)))
            .flat_map(|(stack, outputs)| parse_stack(stack, outputs))
            .collect())
    }
}

/// Collect the function groups of one stack; unrelated outputs are ignored
fn parse_stack(stack: &str, outputs: &Map<String, Value>) -> Vec<FunctionManifestEntry> {
    let text = |key: String| outputs.get(&key).and_then(Value::as_str).map(str::to_string);

    outputs
        .keys()
        .filter_map(|key| key.strip_suffix(HANDLER_SUFFIX))
        .filter_map(|prefix| {
            let function_arn = text(format!("{prefix}{ARN_SUFFIX}"))?;
            let handler = text(format!("{prefix}{HANDLER_SUFFIX}"))?;
            let asset_path = text(format!("{prefix}{ASSET_PATH_SUFFIX}"))?;

            Some(FunctionManifestEntry {
                logical_id: format!("{stack}/{prefix}"),
                function_name: function_name_from_arn(&function_arn).map(str::to_string),
                function_arn,
                role_arn: text(format!("{prefix}{ROLE_ARN_SUFFIX}")),
                handler,
                asset_path: PathBuf::from(asset_path),
                source_map: text(format!("{prefix}{SOURCE_MAP_SUFFIX}")).map(PathBuf::from),
            })
        })
        .collect()
}

/// Split `file.export` at the last dot. Handlers pointing into a wrapper
/// layer (absolute paths such as `/opt/...`) fall back to `index.handler`.
pub fn split_handler(handler: &str) -> (String, String) {
    let fallback = || {
        (
            DEFAULT_HANDLER_FILE.to_string(),
            DEFAULT_HANDLER_EXPORT.to_string(),
        )
    };

    if handler.starts_with('/') {
        return fallback();
    }
    match handler.rsplit_once('.') {
        Some((file, export)) if !file.is_empty() && !export.is_empty() => {
            (file.to_string(), export.to_string())
        }
        _ => fallback(),
    }
}
