//! Local execution of tunneled invocations
//!
//! Each invocation resolves its manifest entry, fetches the deployed
//! function's configuration, assumes its execution role and runs the handler
//! in a fresh runtime process with an environment built for that invocation
//! alone. Nothing here touches the tunnel's own process environment, so
//! concurrent invocations cannot see each other's credentials.

pub mod environment;
pub mod runner;
pub mod source;

pub use environment::{EnvironmentSnapshot, InvocationEnvironment, LambdaRuntimeInfo};
pub use runner::{HandlerInvocation, HandlerRunner, NodeRunner};
pub use source::{Bundler, EsbuildBundler, HandlerSource, SourceMapResolver, SourceResolver};

use crate::config::SandboxConfig;
use crate::dispatcher::Executor;
use crate::error::InvocationError;
use crate::manifest::{ManifestResolver, ResolvedFunction};
use async_trait::async_trait;
use live_lambda_common::constants::DEFAULT_INVOCATION_TIMEOUT_MS;
use live_lambda_common::protocol::function_name_from_arn;
use live_lambda_common::validation::validate_export_name;
use live_lambda_common::{
    Credentials, InvocationRequest, current_timestamp_millis, generate_session_name,
};
use serde_json::Value;
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, error, info};

/// Live configuration of a deployed function
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FunctionConfiguration {
    pub role_arn: Option<String>,
    pub variables: BTreeMap<String, String>,
    pub timeout_secs: Option<u64>,
    pub memory_mb: Option<i32>,
    pub version: Option<String>,
}

/// Control-plane lookup of a function's configuration
#[async_trait]
pub trait FunctionConfigSource: Send + Sync {
    async fn function_configuration(
        &self,
        function_name: &str,
    ) -> Result<FunctionConfiguration, InvocationError>;
}

/// Issues temporary credentials for an execution role
#[async_trait]
pub trait RoleAssumer: Send + Sync {
    async fn assume_role(
        &self,
        role_arn: &str,
        session_name: &str,
    ) -> Result<Credentials, InvocationError>;
}

pub struct Sandbox {
    manifest: ManifestResolver,
    snapshot: Arc<EnvironmentSnapshot>,
    functions: Arc<dyn FunctionConfigSource>,
    roles: Arc<dyn RoleAssumer>,
    sources: Arc<dyn SourceResolver>,
    bundler: Arc<dyn Bundler>,
    runner: Arc<dyn HandlerRunner>,
    build_dir: PathBuf,
    region: String,
}

impl Sandbox {
    /// Sandbox running handlers with the configured runtime and bundler
    pub fn new(
        config: &SandboxConfig,
        snapshot: EnvironmentSnapshot,
        functions: Arc<dyn FunctionConfigSource>,
        roles: Arc<dyn RoleAssumer>,
    ) -> Self {
        Self {
            manifest: ManifestResolver::new(&config.manifest_path),
            snapshot: Arc::new(snapshot),
            functions,
            roles,
            sources: Arc::new(SourceMapResolver),
            bundler: Arc::new(EsbuildBundler::new(&config.bundler)),
            runner: Arc::new(NodeRunner::new(&config.runtime)),
            build_dir: config.build_dir.clone(),
            region: config.region.clone(),
        }
    }

    pub fn with_sources(mut self, sources: Arc<dyn SourceResolver>) -> Self {
        self.sources = sources;
        self
    }

    pub fn with_bundler(mut self, bundler: Arc<dyn Bundler>) -> Self {
        self.bundler = bundler;
        self
    }

    pub fn with_runner(mut self, runner: Arc<dyn HandlerRunner>) -> Self {
        self.runner = runner;
        self
    }

    /// Run one invocation. Always produces a reply: the handler's result,
    /// or an error response describing why it could not run.
    pub async fn execute(&self, request: &InvocationRequest) -> Value {
        let started = Instant::now();
        let identity = request.context.function_identity().unwrap_or("<unknown>");

        match self.try_execute(request).await {
            Ok(result) => {
                info!(
                    "[{}] {} completed in {}ms",
                    request.request_id,
                    identity,
                    started.elapsed().as_millis()
                );
                result
            }
            Err(e) => {
                error!(
                    "[{}] {} failed after {}ms: {}",
                    request.request_id,
                    identity,
                    started.elapsed().as_millis(),
                    e
                );
                e.to_reply()
            }
        }
    }

    async fn try_execute(&self, request: &InvocationRequest) -> Result<Value, InvocationError> {
        let context = &request.context;
        let identity = context
            .function_identity()
            .ok_or(InvocationError::MissingIdentity)?;
        let function = self
            .manifest
            .resolve(identity)
            .await?
            .ok_or_else(|| InvocationError::FunctionNotFound(identity.to_string()))?;
        let function_name = context
            .resolved_function_name()
            .or_else(|| function_name_from_arn(&function.function_arn).map(str::to_string))
            .unwrap_or_else(|| identity.to_string());

        // control-plane clients were built from the startup environment
        let configuration = self
            .functions
            .function_configuration(&function_name)
            .await?;
        let role_arn = configuration
            .role_arn
            .clone()
            .or_else(|| function.role_arn.clone())
            .or_else(|| context.role_arn.clone())
            .ok_or_else(|| InvocationError::MissingRole(function_name.clone()))?;

        let session_name = generate_session_name(&function_name, current_timestamp_millis());
        let credentials = self.roles.assume_role(&role_arn, &session_name).await?;
        debug!(
            "[{}] Assumed {} as {}",
            request.request_id, role_arn, session_name
        );

        let memory = configuration
            .memory_mb
            .map(|m| m.to_string())
            .or_else(|| context.memory_limit_in_mb.clone());
        let environment = InvocationEnvironment::from_baseline(&self.snapshot)
            .with_function_variables(&configuration.variables)
            .with_credentials(&credentials)
            .with_runtime_info(&LambdaRuntimeInfo {
                function_name: &function_name,
                region: context.region.as_deref().unwrap_or(&self.region),
                function_version: context
                    .function_version
                    .as_deref()
                    .or(configuration.version.as_deref()),
                memory_mb: memory.as_deref(),
                task_root: function.asset_path.to_str(),
            });

        validate_export_name(&function.handler_export).map_err(|_| {
            InvocationError::InvalidHandler(format!(
                "{}.{}",
                function.handler_file, function.handler_export
            ))
        })?;

        let (module, bundled) = match self.sources.resolve(&function).await? {
            HandlerSource::Compiled(path) => (path, false),
            HandlerSource::Original(entry) => {
                let output = self.build_dir.join(format!("{}.cjs", request.request_id));
                self.bundler.bundle(&entry, &output).await?;
                (output, true)
            }
        };
        info!(
            "[{}] Running {} ({}) from {}",
            request.request_id,
            function.logical_id,
            function.handler_export,
            module.display()
        );

        let invocation = HandlerInvocation {
            request_id: request.request_id.clone(),
            module: module.clone(),
            task_root: function.asset_path.clone(),
            export: function.handler_export.clone(),
            event: request.event_payload.clone(),
            context: handler_context(request, &function_name, &function)?,
            environment,
            timeout: invocation_timeout(request, &configuration),
        };
        let result = self.runner.run(invocation).await;

        if bundled {
            if let Err(e) = tokio::fs::remove_file(&module).await {
                debug!("Failed to remove bundle {}: {}", module.display(), e);
            }
        }
        result
    }
}

#[async_trait]
impl Executor for Sandbox {
    async fn execute(&self, request: &InvocationRequest) -> Value {
        Sandbox::execute(self, request).await
    }
}

/// Context object handed to the handler, completed from what the tunnel knows
fn handler_context(
    request: &InvocationRequest,
    function_name: &str,
    function: &ResolvedFunction,
) -> Result<Value, InvocationError> {
    let mut context = request.context.clone();
    context
        .function_name
        .get_or_insert_with(|| function_name.to_string());
    context
        .invoked_function_arn
        .get_or_insert_with(|| function.function_arn.clone());
    context
        .aws_request_id
        .get_or_insert_with(|| request.request_id.clone());

    serde_json::to_value(&context).map_err(|e| InvocationError::Runtime(e.to_string()))
}

/// Deadline from the context first, then the function's configured timeout
fn invocation_timeout(request: &InvocationRequest, configuration: &FunctionConfiguration) -> Duration {
    let millis = request
        .context
        .remaining_ms(current_timestamp_millis())
        .or_else(|| configuration.timeout_secs.map(|secs| secs * 1000))
        .unwrap_or(DEFAULT_INVOCATION_TIMEOUT_MS);
    Duration::from_millis(millis)
}

#[cfg(test)]
mod tests;
