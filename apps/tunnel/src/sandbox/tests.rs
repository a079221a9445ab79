use super::*;
use live_lambda_common::InvocationContext;
use serde_json::json;
use std::io::Write;
use std::path::Path;
use std::sync::Mutex;
use tempfile::{NamedTempFile, TempDir};

const F1_ARN: &str = "arn:aws:lambda:us-east-1:123456789012:function:f1";
const F2_ARN: &str = "arn:aws:lambda:us-east-1:123456789012:function:f2";

struct MockFunctions {
    role_arn: Option<String>,
    calls: Mutex<Vec<String>>,
}

#[async_trait]
impl FunctionConfigSource for MockFunctions {
    async fn function_configuration(
        &self,
        function_name: &str,
    ) -> Result<FunctionConfiguration, InvocationError> {
        self.calls.lock().unwrap().push(function_name.to_string());
        let mut variables = BTreeMap::new();
        variables.insert("TABLE_NAME".to_string(), format!("{}-table", function_name));
        Ok(FunctionConfiguration {
            role_arn: self
                .role_arn
                .as_ref()
                .map(|role| format!("{}-{}", role, function_name)),
            variables,
            timeout_secs: Some(30),
            memory_mb: Some(256),
            version: None,
        })
    }
}

/// Hands out credentials named after the role, so tests can tell them apart
#[derive(Default)]
struct MockRoles {
    calls: Mutex<Vec<(String, String)>>,
}

#[async_trait]
impl RoleAssumer for MockRoles {
    async fn assume_role(
        &self,
        role_arn: &str,
        session_name: &str,
    ) -> Result<Credentials, InvocationError> {
        self.calls
            .lock()
            .unwrap()
            .push((role_arn.to_string(), session_name.to_string()));
        Ok(Credentials::new(format!("ASIA-{}", role_arn), "assumed-secret").with_session_token("session"))
    }
}

/// Control plane that is unreachable for every call
struct UnreachableControlPlane {
    operation: &'static str,
}

#[async_trait]
impl FunctionConfigSource for UnreachableControlPlane {
    async fn function_configuration(
        &self,
        _function_name: &str,
    ) -> Result<FunctionConfiguration, InvocationError> {
        Err(InvocationError::ControlPlane {
            operation: self.operation,
            message: "service unavailable".to_string(),
        })
    }
}

#[async_trait]
impl RoleAssumer for UnreachableControlPlane {
    async fn assume_role(
        &self,
        _role_arn: &str,
        _session_name: &str,
    ) -> Result<Credentials, InvocationError> {
        Err(InvocationError::ControlPlane {
            operation: self.operation,
            message: "AccessDenied: not authorized to assume role".to_string(),
        })
    }
}

struct FixedSource(HandlerSource);

#[async_trait]
impl SourceResolver for FixedSource {
    async fn resolve(&self, _function: &ResolvedFunction) -> Result<HandlerSource, InvocationError> {
        Ok(self.0.clone())
    }
}

#[derive(Default)]
struct RecordingBundler {
    calls: Mutex<Vec<(PathBuf, PathBuf)>>,
}

#[async_trait]
impl Bundler for RecordingBundler {
    async fn bundle(&self, entry: &Path, output: &Path) -> Result<(), InvocationError> {
        self.calls
            .lock()
            .unwrap()
            .push((entry.to_path_buf(), output.to_path_buf()));
        Ok(())
    }
}

enum Behavior {
    Return(Value),
    Throw(&'static str),
    Slow(Duration),
}

struct MockRunner {
    behavior: Behavior,
    seen: Mutex<Vec<HandlerInvocation>>,
}

impl MockRunner {
    fn new(behavior: Behavior) -> Arc<Self> {
        Arc::new(Self {
            behavior,
            seen: Mutex::new(Vec::new()),
        })
    }

    fn seen(&self) -> Vec<HandlerInvocation> {
        self.seen.lock().unwrap().clone()
    }
}

#[async_trait]
impl HandlerRunner for MockRunner {
    async fn run(&self, invocation: HandlerInvocation) -> Result<Value, InvocationError> {
        self.seen.lock().unwrap().push(invocation.clone());
        match &self.behavior {
            Behavior::Return(value) => Ok(value.clone()),
            Behavior::Throw(message) => Err(InvocationError::Handler {
                error_type: "Error".to_string(),
                message: message.to_string(),
                trace: vec![format!("Error: {}", message)],
            }),
            Behavior::Slow(delay) => {
                tokio::time::sleep(*delay).await;
                Ok(json!({"statusCode": 200}))
            }
        }
    }
}

struct Fixture {
    _manifest: NamedTempFile,
    _build: TempDir,
    functions: Arc<MockFunctions>,
    roles: Arc<MockRoles>,
    sandbox: Sandbox,
}

fn write_manifest() -> NamedTempFile {
    let mut manifest = NamedTempFile::new().unwrap();
    write!(
        manifest,
        r#"{{
            "Stack": {{
                "F1Arn": "{F1_ARN}",
                "F1Handler": "index.handler",
                "F1CdkOutAssetPath": "/out/f1",
                "F2Arn": "{F2_ARN}",
                "F2Handler": "/opt/wrapper/index.handler",
                "F2CdkOutAssetPath": "/out/f2"
            }}
        }}"#
    )
    .unwrap();
    manifest
}

fn sandbox_config(manifest: &NamedTempFile, build: &TempDir) -> SandboxConfig {
    SandboxConfig {
        manifest_path: manifest.path().to_path_buf(),
        region: "us-east-1".to_string(),
        runtime: "node".to_string(),
        bundler: "esbuild".to_string(),
        build_dir: build.path().to_path_buf(),
        max_concurrency: 4,
    }
}

fn fixture(role_arn: Option<&str>, runner: Arc<MockRunner>) -> Fixture {
    let manifest = write_manifest();
    let build = TempDir::new().unwrap();
    let config = sandbox_config(&manifest, &build);
    let functions = Arc::new(MockFunctions {
        role_arn: role_arn.map(str::to_string),
        calls: Mutex::new(Vec::new()),
    });
    let roles = Arc::new(MockRoles::default());
    let snapshot = EnvironmentSnapshot::from_vars([
        ("PATH", "/usr/bin"),
        ("AWS_PROFILE", "developer"),
        ("AWS_ACCESS_KEY_ID", "AKIALONGTERM"),
    ]);

    let sandbox = Sandbox::new(&config, snapshot, functions.clone(), roles.clone())
        .with_sources(Arc::new(FixedSource(HandlerSource::Compiled(
            PathBuf::from("/out/f1/index.js"),
        ))))
        .with_runner(runner);

    Fixture {
        _manifest: manifest,
        _build: build,
        functions,
        roles,
        sandbox,
    }
}

fn request(id: &str, arn: &str) -> InvocationRequest {
    InvocationRequest {
        request_id: id.to_string(),
        context: InvocationContext {
            invoked_function_arn: Some(arn.to_string()),
            ..Default::default()
        },
        event_payload: json!({"a": 1}),
    }
}

fn error_body(reply: &Value) -> Value {
    assert_eq!(reply["statusCode"], 500);
    serde_json::from_str(reply["body"].as_str().unwrap()).unwrap()
}

#[tokio::test]
async fn test_successful_invocation() {
    let runner = MockRunner::new(Behavior::Return(json!({"statusCode": 200, "body": "ok"})));
    let fx = fixture(Some("arn:aws:iam::123456789012:role/exec"), runner.clone());

    let reply = fx.sandbox.execute(&request("r1", F1_ARN)).await;
    assert_eq!(reply, json!({"statusCode": 200, "body": "ok"}));

    assert_eq!(*fx.functions.calls.lock().unwrap(), vec!["f1".to_string()]);
    let (role, session) = fx.roles.calls.lock().unwrap()[0].clone();
    assert_eq!(role, "arn:aws:iam::123456789012:role/exec-f1");
    assert!(session.starts_with("f1-"));

    let seen = runner.seen();
    assert_eq!(seen.len(), 1);
    let invocation = &seen[0];
    assert_eq!(invocation.module, PathBuf::from("/out/f1/index.js"));
    assert_eq!(invocation.export, "handler");
    assert_eq!(invocation.event, json!({"a": 1}));
    assert_eq!(invocation.context["functionName"], "f1");
    assert_eq!(invocation.context["awsRequestId"], "r1");
    assert_eq!(invocation.timeout, Duration::from_secs(30));

    let env = &invocation.environment;
    assert_eq!(
        env.get("AWS_ACCESS_KEY_ID"),
        Some("ASIA-arn:aws:iam::123456789012:role/exec-f1")
    );
    assert_eq!(env.get("AWS_SESSION_TOKEN"), Some("session"));
    assert_eq!(env.get("TABLE_NAME"), Some("f1-table"));
    assert_eq!(env.get("AWS_REGION"), Some("us-east-1"));
    assert_eq!(env.get("AWS_LAMBDA_FUNCTION_MEMORY_SIZE"), Some("256"));
    assert_eq!(env.get("PATH"), Some("/usr/bin"));
    assert!(env.get("AWS_PROFILE").is_none());
}

#[tokio::test]
async fn test_manifest_miss_is_error_reply() {
    let runner = MockRunner::new(Behavior::Return(json!("unused")));
    let fx = fixture(Some("arn:aws:iam::1:role/exec"), runner.clone());

    let reply = fx
        .sandbox
        .execute(&request("r1", "arn:aws:lambda:us-east-1:1:function:missing"))
        .await;

    let body = error_body(&reply);
    assert_eq!(body["errorType"], "FunctionNotFound");
    assert!(fx.functions.calls.lock().unwrap().is_empty());
    assert!(runner.seen().is_empty());
}

#[tokio::test]
async fn test_missing_identity_is_error_reply() {
    let runner = MockRunner::new(Behavior::Return(json!("unused")));
    let fx = fixture(Some("arn:aws:iam::1:role/exec"), runner.clone());

    let reply = fx
        .sandbox
        .execute(&InvocationRequest {
            request_id: "r1".to_string(),
            context: InvocationContext::default(),
            event_payload: Value::Null,
        })
        .await;
    assert_eq!(error_body(&reply)["errorType"], "InvalidRequest");
}

#[tokio::test]
async fn test_missing_role_is_terminal() {
    let runner = MockRunner::new(Behavior::Return(json!("unused")));
    let fx = fixture(None, runner.clone());

    let reply = fx.sandbox.execute(&request("r1", F1_ARN)).await;

    assert_eq!(error_body(&reply)["errorType"], "MissingExecutionRole");
    assert!(fx.roles.calls.lock().unwrap().is_empty());
    assert!(runner.seen().is_empty());
}

#[tokio::test]
async fn test_handler_error_becomes_500() {
    let runner = MockRunner::new(Behavior::Throw("boom"));
    let fx = fixture(Some("arn:aws:iam::1:role/exec"), runner);

    let reply = fx.sandbox.execute(&request("r1", F1_ARN)).await;

    assert!(reply["body"].as_str().unwrap().contains("boom"));
    let body = error_body(&reply);
    assert_eq!(body["errorType"], "Error");
    assert_eq!(body["errorMessage"], "boom");
}

#[tokio::test]
async fn test_wrapper_handler_uses_default_export() {
    let runner = MockRunner::new(Behavior::Return(Value::Null));
    let fx = fixture(Some("arn:aws:iam::1:role/exec"), runner.clone());

    fx.sandbox.execute(&request("r2", F2_ARN)).await;
    assert_eq!(runner.seen()[0].export, "handler");
}

#[tokio::test]
async fn test_original_source_is_bundled_per_request() {
    let runner = MockRunner::new(Behavior::Return(json!("done")));
    let bundler = Arc::new(RecordingBundler::default());
    let fx = fixture(Some("arn:aws:iam::1:role/exec"), runner.clone());
    let build_dir = fx._build.path().to_path_buf();
    let sandbox = fx
        .sandbox
        .with_sources(Arc::new(FixedSource(HandlerSource::Original(
            PathBuf::from("/project/src/orders.ts"),
        ))))
        .with_bundler(bundler.clone());

    let reply = sandbox.execute(&request("r7", F1_ARN)).await;
    assert_eq!(reply, json!("done"));

    let calls = bundler.calls.lock().unwrap().clone();
    assert_eq!(
        calls,
        vec![(
            PathBuf::from("/project/src/orders.ts"),
            build_dir.join("r7.cjs")
        )]
    );
    let invocation = &runner.seen()[0];
    assert_eq!(invocation.module, build_dir.join("r7.cjs"));
    // the bundle lives in the build dir but runs from the function's asset
    assert_eq!(invocation.task_root, PathBuf::from("/out/f1"));
}

#[tokio::test]
async fn test_deadline_bounds_timeout() {
    let runner = MockRunner::new(Behavior::Return(Value::Null));
    let fx = fixture(Some("arn:aws:iam::1:role/exec"), runner.clone());

    let mut req = request("r1", F1_ARN);
    req.context.deadline_ms = Some(current_timestamp_millis() + 5_000);
    fx.sandbox.execute(&req).await;

    let timeout = runner.seen()[0].timeout;
    assert!(timeout <= Duration::from_secs(5));
    assert!(timeout > Duration::from_secs(3));
}

#[tokio::test]
async fn test_concurrent_invocations_keep_their_own_credentials() {
    let runner = MockRunner::new(Behavior::Slow(Duration::from_millis(50)));
    let fx = fixture(Some("arn:aws:iam::1:role/exec"), runner.clone());

    let first = request("r1", F1_ARN);
    let second = request("r2", F2_ARN);
    let (a, b) = tokio::join!(fx.sandbox.execute(&first), fx.sandbox.execute(&second));
    assert_eq!(a["statusCode"], 200);
    assert_eq!(b["statusCode"], 200);

    for invocation in runner.seen() {
        let expected_fn = if invocation.request_id == "r1" { "f1" } else { "f2" };
        assert_eq!(
            invocation.environment.get("AWS_ACCESS_KEY_ID"),
            Some(format!("ASIA-arn:aws:iam::1:role/exec-{}", expected_fn).as_str())
        );
        assert_eq!(
            invocation.environment.get("AWS_LAMBDA_FUNCTION_NAME"),
            Some(expected_fn)
        );
    }
}

#[tokio::test]
async fn test_process_environment_is_untouched() {
    let before = EnvironmentSnapshot::capture();

    let runner = MockRunner::new(Behavior::Throw("boom"));
    let fx = fixture(Some("arn:aws:iam::1:role/exec"), runner);
    fx.sandbox.execute(&request("r1", F1_ARN)).await;

    let runner = MockRunner::new(Behavior::Return(json!({"statusCode": 200})));
    let fx = fixture(Some("arn:aws:iam::1:role/exec"), runner);
    fx.sandbox.execute(&request("r2", F1_ARN)).await;

    assert_eq!(EnvironmentSnapshot::capture(), before);
}

#[tokio::test]
async fn test_role_assumption_failure_is_error_reply() {
    let manifest = write_manifest();
    let build = TempDir::new().unwrap();
    let runner = MockRunner::new(Behavior::Return(json!("unused")));
    let functions = Arc::new(MockFunctions {
        role_arn: Some("arn:aws:iam::1:role/exec".to_string()),
        calls: Mutex::new(Vec::new()),
    });
    let sandbox = Sandbox::new(
        &sandbox_config(&manifest, &build),
        EnvironmentSnapshot::from_vars([("PATH", "/usr/bin")]),
        functions,
        Arc::new(UnreachableControlPlane {
            operation: "AssumeRole",
        }),
    )
    .with_runner(runner.clone());

    let reply = sandbox.execute(&request("r1", F1_ARN)).await;

    let body = error_body(&reply);
    assert_eq!(body["errorType"], "ControlPlaneError");
    assert!(body["errorMessage"].as_str().unwrap().contains("AssumeRole"));
    assert!(runner.seen().is_empty());
}

#[tokio::test]
async fn test_configuration_lookup_failure_is_error_reply() {
    let manifest = write_manifest();
    let build = TempDir::new().unwrap();
    let runner = MockRunner::new(Behavior::Return(json!("unused")));
    let roles = Arc::new(MockRoles::default());
    let sandbox = Sandbox::new(
        &sandbox_config(&manifest, &build),
        EnvironmentSnapshot::from_vars([("PATH", "/usr/bin")]),
        Arc::new(UnreachableControlPlane {
            operation: "GetFunctionConfiguration",
        }),
        roles.clone(),
    )
    .with_runner(runner.clone());

    let reply = sandbox.execute(&request("r1", F1_ARN)).await;

    assert_eq!(error_body(&reply)["errorType"], "ControlPlaneError");
    assert!(roles.calls.lock().unwrap().is_empty());
    assert!(runner.seen().is_empty());
}
