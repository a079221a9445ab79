//! AWS control-plane adapters for the sandbox

use crate::error::InvocationError;
use crate::sandbox::{FunctionConfigSource, FunctionConfiguration, RoleAssumer};
use async_trait::async_trait;
use aws_config::SdkConfig;
use aws_sdk_lambda::Client as LambdaClient;
use aws_sdk_lambda::error::DisplayErrorContext;
use aws_sdk_sts::Client as StsClient;
use chrono::{DateTime, Utc};
use live_lambda_common::Credentials;
use live_lambda_common::constants::ASSUMED_ROLE_DURATION_SECS;
use std::collections::BTreeMap;
use std::time::SystemTime;
use tracing::debug;

/// `GetFunctionConfiguration` through the Lambda API
pub struct LambdaFunctionConfigs {
    client: LambdaClient,
}

impl LambdaFunctionConfigs {
    pub fn new(config: &SdkConfig) -> Self {
        Self {
            client: LambdaClient::new(config),
        }
    }
}

#[async_trait]
impl FunctionConfigSource for LambdaFunctionConfigs {
    async fn function_configuration(
        &self,
        function_name: &str,
    ) -> Result<FunctionConfiguration, InvocationError> {
        let output = self
            .client
            .get_function_configuration()
            .function_name(function_name)
            .send()
            .await
            .map_err(|e| InvocationError::ControlPlane {
                operation: "GetFunctionConfiguration",
                message: DisplayErrorContext(&e).to_string(),
            })?;

        let variables: BTreeMap<String, String> = output
            .environment()
            .and_then(|env| env.variables())
            .map(|vars| {
                vars.iter()
                    .map(|(k, v)| (k.clone(), v.clone()))
                    .collect()
            })
            .unwrap_or_default();
        debug!(
            "Fetched configuration of {} ({} variables)",
            function_name,
            output
                .environment()
                .and_then(|env| env.variables())
                .map_or(0, |vars| vars.len())
        );

        Ok(FunctionConfiguration {
            role_arn: output.role().map(str::to_string),
            variables,
            timeout_secs: output.timeout().and_then(|t| u64::try_from(t).ok()),
            memory_mb: output.memory_size(),
            version: output.version().map(str::to_string),
        })
    }
}

/// `AssumeRole` through STS
pub struct StsRoleAssumer {
    client: StsClient,
}

impl StsRoleAssumer {
    pub fn new(config: &SdkConfig) -> Self {
        Self {
            client: StsClient::new(config),
        }
    }
}

#[async_trait]
impl RoleAssumer for StsRoleAssumer {
    async fn assume_role(
        &self,
        role_arn: &str,
        session_name: &str,
    ) -> Result<Credentials, InvocationError> {
        let output = self
            .client
            .assume_role()
            .role_arn(role_arn)
            .role_session_name(session_name)
            .duration_seconds(ASSUMED_ROLE_DURATION_SECS)
            .send()
            .await
            .map_err(|e| InvocationError::ControlPlane {
                operation: "AssumeRole",
                message: DisplayErrorContext(&e).to_string(),
            })?;

        let issued = output
            .credentials()
            .ok_or_else(|| InvocationError::ControlPlane {
                operation: "AssumeRole",
                message: format!("no credentials returned for {}", role_arn),
            })?;

        let mut credentials = Credentials::new(issued.access_key_id(), issued.secret_access_key())
            .with_session_token(issued.session_token());
        if let Ok(expiry) = SystemTime::try_from(*issued.expiration()) {
            credentials = credentials.with_expiry(DateTime::<Utc>::from(expiry));
        }
        Ok(credentials)
    }
}
