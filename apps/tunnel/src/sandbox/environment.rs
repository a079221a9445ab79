//! Per-invocation environment, derived from a snapshot taken at startup
//!
//! The tunnel process never changes its own environment. Every invocation
//! gets an owned copy of the baseline with its own variables and credentials
//! applied, and hands that copy to the handler process it spawns.

use live_lambda_common::Credentials;
use std::collections::BTreeMap;

/// Variables that would let a handler fall back to the developer's own
/// long-lived credentials instead of the assumed execution role
pub const AMBIENT_CREDENTIAL_KEYS: &[&str] = &[
    "AWS_PROFILE",
    "AWS_DEFAULT_PROFILE",
    "AWS_ACCESS_KEY_ID",
    "AWS_SECRET_ACCESS_KEY",
    "AWS_SESSION_TOKEN",
    "AWS_SECURITY_TOKEN",
    "AWS_CREDENTIAL_EXPIRATION",
    "AWS_SHARED_CREDENTIALS_FILE",
    "AWS_CONFIG_FILE",
    "AWS_ROLE_ARN",
    "AWS_ROLE_SESSION_NAME",
    "AWS_WEB_IDENTITY_TOKEN_FILE",
    "AWS_CONTAINER_CREDENTIALS_FULL_URI",
    "AWS_CONTAINER_CREDENTIALS_RELATIVE_URI",
    "AWS_CONTAINER_AUTHORIZATION_TOKEN",
];

/// Process environment as it was when the tunnel started
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EnvironmentSnapshot {
    vars: BTreeMap<String, String>,
}

impl EnvironmentSnapshot {
    /// Capture the current process environment. Non-UTF-8 entries are skipped.
    pub fn capture() -> Self {
        let vars = std::env::vars_os()
            .filter_map(|(k, v)| Some((k.into_string().ok()?, v.into_string().ok()?)))
            .collect();
        Self { vars }
    }

    pub fn from_vars<I, K, V>(vars: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        Self {
            vars: vars
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        }
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.vars.get(key).map(String::as_str)
    }

    pub fn vars(&self) -> &BTreeMap<String, String> {
        &self.vars
    }
}

/// Lambda context details exported to the handler's environment
#[derive(Debug, Clone, Default)]
pub struct LambdaRuntimeInfo<'a> {
    pub function_name: &'a str,
    pub region: &'a str,
    pub function_version: Option<&'a str>,
    pub memory_mb: Option<&'a str>,
    pub task_root: Option<&'a str>,
}

/// Environment of one handler execution
#[derive(Clone, PartialEq, Eq)]
pub struct InvocationEnvironment {
    vars: BTreeMap<String, String>,
}

// values carry secrets, only the keys are printed
impl std::fmt::Debug for InvocationEnvironment {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_set().entries(self.vars.keys()).finish()
    }
}

impl InvocationEnvironment {
    /// Baseline copy with every ambient credential source removed
    pub fn from_baseline(snapshot: &EnvironmentSnapshot) -> Self {
        let mut vars = snapshot.vars.clone();
        for key in AMBIENT_CREDENTIAL_KEYS {
            vars.remove(*key);
        }
        Self { vars }
    }

    /// Variables configured on the deployed function
    pub fn with_function_variables(mut self, variables: &BTreeMap<String, String>) -> Self {
        self.vars
            .extend(variables.iter().map(|(k, v)| (k.clone(), v.clone())));
        self
    }

    /// Credentials of the assumed execution role. Applied last so nothing
    /// configured earlier can shadow them.
    pub fn with_credentials(mut self, credentials: &Credentials) -> Self {
        self.vars.insert(
            "AWS_ACCESS_KEY_ID".to_string(),
            credentials.access_key_id.clone(),
        );
        self.vars.insert(
            "AWS_SECRET_ACCESS_KEY".to_string(),
            credentials.secret_access_key.clone(),
        );
        match &credentials.session_token {
            Some(token) => {
                self.vars
                    .insert("AWS_SESSION_TOKEN".to_string(), token.clone());
            }
            None => {
                self.vars.remove("AWS_SESSION_TOKEN");
            }
        }
        self
    }

    /// Reserved variables the Lambda runtime normally provides
    pub fn with_runtime_info(mut self, info: &LambdaRuntimeInfo<'_>) -> Self {
        let mut set = |key: &str, value: &str| {
            self.vars.insert(key.to_string(), value.to_string());
        };
        set("AWS_LAMBDA_FUNCTION_NAME", info.function_name);
        set("AWS_REGION", info.region);
        set("AWS_DEFAULT_REGION", info.region);
        set(
            "AWS_LAMBDA_FUNCTION_VERSION",
            info.function_version.unwrap_or("$LATEST"),
        );
        if let Some(memory) = info.memory_mb {
            set("AWS_LAMBDA_FUNCTION_MEMORY_SIZE", memory);
        }
        if let Some(root) = info.task_root {
            set("LAMBDA_TASK_ROOT", root);
        }
        self
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.vars.get(key).map(String::as_str)
    }

    pub fn vars(&self) -> &BTreeMap<String, String> {
        &self.vars
    }
}
