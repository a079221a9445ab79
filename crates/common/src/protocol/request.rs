use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::constants::RESPONSE_CHANNEL_PREFIX;

/// One tunneled invocation, as published by the deployed stand-in on the
/// request channel
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InvocationRequest {
    /// Identifier assigned by the stand-in, unique per invocation
    pub request_id: String,

    /// Lambda context of the original invocation
    #[serde(default)]
    pub context: InvocationContext,

    /// Event payload, opaque to the tunnel
    #[serde(default)]
    pub event_payload: Value,
}

impl InvocationRequest {
    /// Channel the reply for this invocation is published on
    pub fn reply_channel(&self) -> String {
        reply_channel(&self.request_id)
    }
}

/// Reply channel for a request id: `response/{request_id}`
pub fn reply_channel(request_id: &str) -> String {
    format!("{}/{}", RESPONSE_CHANNEL_PREFIX, request_id)
}

/// Invocation context forwarded by the stand-in
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct InvocationContext {
    /// Deployed function name
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub function_name: Option<String>,

    /// Full ARN the function was invoked through
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub invoked_function_arn: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub function_version: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub memory_limit_in_mb: Option<String>,

    /// Request id assigned by Lambda to the stand-in's invocation
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub aws_request_id: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub region: Option<String>,

    /// Execution deadline (Unix epoch in milliseconds)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deadline_ms: Option<u64>,

    /// Execution role ARN when the stand-in already knows it
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub role_arn: Option<String>,
}

impl InvocationContext {
    /// Identity used to look the function up: the invoked ARN when present,
    /// otherwise the function name
    pub fn function_identity(&self) -> Option<&str> {
        self.invoked_function_arn
            .as_deref()
            .or(self.function_name.as_deref())
            .filter(|s| !s.is_empty())
    }

    /// Function name, derived from the ARN when only the ARN is known
    pub fn resolved_function_name(&self) -> Option<String> {
        if let Some(name) = self.function_name.as_deref().filter(|s| !s.is_empty()) {
            return Some(name.to_string());
        }
        self.invoked_function_arn
            .as_deref()
            .and_then(function_name_from_arn)
            .map(str::to_string)
    }

    /// Milliseconds left until the deadline, `None` without a deadline
    pub fn remaining_ms(&self, now_ms: u64) -> Option<u64> {
        self.deadline_ms.map(|deadline| deadline.saturating_sub(now_ms))
    }
}

/// Extract the function name from `arn:aws:lambda:{region}:{account}:function:{name}[:{qualifier}]`
pub fn function_name_from_arn(arn: &str) -> Option<&str> {
    let mut parts = arn.split(':');
    if parts.next() != Some("arn") {
        return None;
    }
    parts.find(|p| *p == "function")?;
    parts.next().filter(|name| !name.is_empty())
}
