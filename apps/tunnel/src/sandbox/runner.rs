//! Runs a handler in its own runtime process
//!
//! The child gets an explicit environment, reads `{module, exportName,
//! event, context}` from stdin and reports its outcome on a single marker
//! line on stdout. Every other output line is forwarded to the log.

use super::environment::InvocationEnvironment;
use crate::error::InvocationError;
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{Value, json};
use std::path::PathBuf;
use std::process::{ExitStatus, Stdio};
use live_lambda_common::constants::OUTPUT_DRAIN_MS;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::Command;
use tokio::sync::oneshot;
use tokio::time::Instant;
use tracing::{debug, info, warn};

pub const RESULT_MARKER: &str = "__LIVE_LAMBDA_RESULT__";

const BOOTSTRAP: &str = r#"
const { pathToFileURL } = require('node:url');
const MARKER = '__LIVE_LAMBDA_RESULT__';

const report = (outcome) => {
  process.stdout.write('\n' + MARKER + JSON.stringify(outcome) + '\n', () => process.exit(0));
};
const fail = (err) => report({
  status: 'failure',
  errorType: (err && err.name) || 'Error',
  errorMessage: err && err.message !== undefined ? String(err.message) : String(err),
  trace: err && err.stack ? String(err.stack).split('\n') : [],
});

let input = '';
process.stdin.setEncoding('utf8');
process.stdin.on('data', (chunk) => { input += chunk; });
process.stdin.on('end', async () => {
  try {
    const { module, exportName, event, context } = JSON.parse(input);
    const loaded = await import(pathToFileURL(module).href);
    const fn = loaded[exportName] ?? (loaded.default && loaded.default[exportName]);
    if (typeof fn !== 'function') {
      report({
        status: 'failure',
        errorType: 'Runtime.HandlerNotFound',
        errorMessage: `${module}.${exportName} is not a function`,
        trace: [],
      });
      return;
    }

    const deadline = context.deadlineMs;
    const lambdaContext = {
      ...context,
      callbackWaitsForEmptyEventLoop: true,
      getRemainingTimeInMillis: () => (deadline ? Math.max(0, deadline - Date.now()) : 0),
    };
    const result = fn.length >= 3
      ? await new Promise((resolve, reject) => {
          const done = (err, value) => (err ? reject(err) : resolve(value));
          const returned = fn(event, lambdaContext, done);
          if (returned && typeof returned.then === 'function') returned.then(resolve, reject);
        })
      : await fn(event, lambdaContext);
    report({ status: 'success', result: result === undefined ? null : result });
  } catch (err) {
    fail(err);
  }
});
"#;

/// Everything needed to run one handler
#[derive(Debug, Clone)]
pub struct HandlerInvocation {
    pub request_id: String,
    pub module: PathBuf,
    /// Working directory of the runtime process, the function's asset directory
    pub task_root: PathBuf,
    pub export: String,
    pub event: Value,
    pub context: Value,
    pub environment: InvocationEnvironment,
    pub timeout: Duration,
}

#[async_trait]
pub trait HandlerRunner: Send + Sync {
    async fn run(&self, invocation: HandlerInvocation) -> Result<Value, InvocationError>;
}

/// Outcome line written by the bootstrap
#[derive(Debug, Deserialize, PartialEq)]
#[serde(tag = "status", rename_all = "lowercase")]
enum HandlerOutcome {
    Success {
        #[serde(default)]
        result: Value,
    },
    #[serde(rename_all = "camelCase")]
    Failure {
        error_type: String,
        error_message: String,
        #[serde(default)]
        trace: Vec<String>,
    },
}

/// Spawns `node` (or a compatible runtime) per invocation
#[derive(Debug, Clone)]
pub struct NodeRunner {
    command: String,
}

impl NodeRunner {
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
        }
    }
}

#[async_trait]
impl HandlerRunner for NodeRunner {
    async fn run(&self, invocation: HandlerInvocation) -> Result<Value, InvocationError> {
        let input = serde_json::to_vec(&json!({
            "module": &invocation.module,
            "exportName": &invocation.export,
            "event": &invocation.event,
            "context": &invocation.context,
        }))
        .map_err(|e| InvocationError::Runtime(e.to_string()))?;

        let mut command = Command::new(&self.command);
        command
            .arg("-e")
            .arg(BOOTSTRAP)
            .env_clear()
            .envs(invocation.environment.vars())
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .current_dir(&invocation.task_root)
            .kill_on_drop(true);

        let mut child = command.spawn().map_err(|e| {
            InvocationError::Runtime(format!("failed to start {}: {}", self.command, e))
        })?;
        debug!(
            "[{}] Started {} for {}",
            invocation.request_id,
            self.command,
            invocation.module.display()
        );

        let (Some(mut stdin), Some(stdout), Some(stderr)) =
            (child.stdin.take(), child.stdout.take(), child.stderr.take())
        else {
            return Err(InvocationError::Runtime(
                "handler process has no stdio".to_string(),
            ));
        };

        // the outcome is handed over as soon as the marker line arrives; a
        // process left behind by the handler may keep stdout open for longer
        let (outcome_tx, outcome_rx) = oneshot::channel();
        let request_id = invocation.request_id.clone();
        let mut stdout_task = tokio::spawn(async move {
            let mut lines = BufReader::new(stdout).lines();
            let mut outcome_tx = Some(outcome_tx);
            while let Ok(Some(line)) = lines.next_line().await {
                match line.strip_prefix(RESULT_MARKER) {
                    Some(rest) => {
                        if let Some(tx) = outcome_tx.take() {
                            let _ = tx.send(rest.to_string());
                        }
                    }
                    None if line.is_empty() => {}
                    None => info!("[{}] {}", request_id, line),
                }
            }
        });
        let request_id = invocation.request_id.clone();
        let mut stderr_task = tokio::spawn(async move {
            let mut lines = BufReader::new(stderr).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                warn!("[{}] {}", request_id, line);
            }
        });

        let deadline = Instant::now() + invocation.timeout;

        // a child that dies before reading its input still reports through its exit status
        match tokio::time::timeout_at(deadline, stdin.write_all(&input)).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                debug!("[{}] Failed to write handler input: {}", invocation.request_id, e)
            }
            Err(_) => debug!("[{}] Handler input not consumed", invocation.request_id),
        }
        drop(stdin);

        let status = match tokio::time::timeout_at(deadline, child.wait()).await {
            Ok(status) => status?,
            Err(_) => {
                let _ = child.kill().await;
                stdout_task.abort();
                stderr_task.abort();
                return Err(InvocationError::Timeout(
                    invocation.timeout.as_millis() as u64,
                ));
            }
        };

        let drain = Duration::from_millis(OUTPUT_DRAIN_MS);
        let outcome = tokio::time::timeout(drain, outcome_rx).await.ok().and_then(Result::ok);
        for task in [&mut stdout_task, &mut stderr_task] {
            if tokio::time::timeout(drain, &mut *task).await.is_err() {
                debug!(
                    "[{}] Handler output still open after exit, detaching",
                    invocation.request_id
                );
                task.abort();
            }
        }

        parse_outcome(outcome.as_deref(), status)
    }
}

/// Turn the bootstrap's marker line into the handler's result
fn parse_outcome(line: Option<&str>, status: ExitStatus) -> Result<Value, InvocationError> {
    let Some(line) = line else {
        return Err(InvocationError::Runtime(format!(
            "handler process exited ({}) without reporting a result",
            status
        )));
    };

    match serde_json::from_str(line) {
        Ok(HandlerOutcome::Success { result }) => Ok(result),
        Ok(HandlerOutcome::Failure {
            error_type,
            error_message,
            trace,
        }) => Err(InvocationError::Handler {
            error_type,
            message: error_message,
            trace,
        }),
        Err(e) => Err(InvocationError::Runtime(format!(
            "unreadable handler outcome: {}",
            e
        ))),
    }
}
