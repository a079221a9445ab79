//! Locating handler code and compiling original sources on demand

use crate::error::InvocationError;
use crate::manifest::ResolvedFunction;
use async_trait::async_trait;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use tokio::process::Command;
use tracing::debug;

const COMPILED_EXTENSIONS: &[&str] = &["js", "mjs", "cjs"];

/// Code to run for one invocation
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HandlerSource {
    /// Deployed build output, loaded as is
    Compiled(PathBuf),
    /// Developer's source found through the source map; must be bundled first
    Original(PathBuf),
}

#[async_trait]
pub trait SourceResolver: Send + Sync {
    async fn resolve(&self, function: &ResolvedFunction) -> Result<HandlerSource, InvocationError>;
}

/// Prefers the original source referenced by the compiled artifact's source
/// map, so edits take effect without a rebuild
#[derive(Debug, Clone, Default)]
pub struct SourceMapResolver;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SourceMap {
    #[serde(default)]
    source_root: Option<String>,
    #[serde(default)]
    sources: Vec<String>,
}

#[async_trait]
impl SourceResolver for SourceMapResolver {
    async fn resolve(&self, function: &ResolvedFunction) -> Result<HandlerSource, InvocationError> {
        let compiled = find_compiled(&function.asset_path, &function.handler_file).await;

        let map_path = match (&function.source_map, &compiled) {
            (Some(map), _) => Some(function.asset_path.join(map)),
            (None, Some(compiled)) => Some(append_extension(compiled, "map")),
            (None, None) => None,
        };
        if let Some(map_path) = map_path {
            if let Some(original) = original_source(&map_path, &function.handler_file).await {
                debug!("Using original source {}", original.display());
                return Ok(HandlerSource::Original(original));
            }
        }

        compiled
            .map(HandlerSource::Compiled)
            .ok_or_else(|| InvocationError::SourceNotFound(function.asset_path.clone()))
    }
}

async fn find_compiled(asset_path: &Path, handler_file: &str) -> Option<PathBuf> {
    for ext in COMPILED_EXTENSIONS {
        let candidate = asset_path.join(format!("{}.{}", handler_file, ext));
        if is_file(&candidate).await {
            return Some(candidate);
        }
    }
    None
}

/// First-party source file the map points at. Sources under `node_modules`
/// and entries that do not exist locally are generated and skipped. A
/// source named like the handler wins; otherwise the last remaining one,
/// which is where bundlers emit the entry point.
async fn original_source(map_path: &Path, handler_file: &str) -> Option<PathBuf> {
    let raw = tokio::fs::read_to_string(map_path).await.ok()?;
    let map: SourceMap = serde_json::from_str(&raw).ok()?;
    let base = map_path.parent()?.join(map.source_root.unwrap_or_default());

    let mut candidates = Vec::new();
    for source in &map.sources {
        if source.contains("node_modules") || source.contains("://") {
            continue;
        }
        let path = base.join(source);
        match tokio::fs::canonicalize(&path).await {
            Ok(path) if is_file(&path).await => candidates.push(path),
            _ => {}
        }
    }

    let handler_stem = Path::new(handler_file).file_stem();
    candidates
        .iter()
        .find(|path| path.file_stem() == handler_stem)
        .or(candidates.last())
        .cloned()
}

async fn is_file(path: &Path) -> bool {
    tokio::fs::metadata(path)
        .await
        .map(|m| m.is_file())
        .unwrap_or(false)
}

fn append_extension(path: &Path, ext: &str) -> PathBuf {
    let mut raw = path.as_os_str().to_owned();
    raw.push(".");
    raw.push(ext);
    PathBuf::from(raw)
}

/// Compiles an original source file into a module the runtime can load
#[async_trait]
pub trait Bundler: Send + Sync {
    async fn bundle(&self, entry: &Path, output: &Path) -> Result<(), InvocationError>;
}

/// Runs esbuild: bundle, node platform, CommonJS output, no type checking
#[derive(Debug, Clone)]
pub struct EsbuildBundler {
    command: String,
}

impl EsbuildBundler {
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
        }
    }
}

#[async_trait]
impl Bundler for EsbuildBundler {
    async fn bundle(&self, entry: &Path, output: &Path) -> Result<(), InvocationError> {
        let bundle_error = |message: String| InvocationError::Bundle {
            entry: entry.to_path_buf(),
            message,
        };

        if let Some(dir) = output.parent() {
            tokio::fs::create_dir_all(dir)
                .await
                .map_err(|e| bundle_error(e.to_string()))?;
        }

        debug!("Bundling {} -> {}", entry.display(), output.display());
        let result = Command::new(&self.command)
            .arg(entry)
            .arg("--bundle")
            .arg("--platform=node")
            .arg("--format=cjs")
            .arg("--sourcemap=inline")
            .arg("--log-level=error")
            .arg(format!("--outfile={}", output.display()))
            .stdin(Stdio::null())
            .output()
            .await
            .map_err(|e| bundle_error(format!("failed to start {}: {}", self.command, e)))?;

        if !result.status.success() {
            let stderr = String::from_utf8_lossy(&result.stderr);
            return Err(bundle_error(format!(
                "{} exited with {}: {}",
                self.command,
                result.status,
                stderr.trim()
            )));
        }
        Ok(())
    }
}
