//! Shell script executor
//!
//! Runs a snapshot's script body with `sh -c`. Resolved params are exported
//! as `FLOWSCHED_PARAM_<NAME>` environment variables; string values are
//! passed raw, everything else as JSON. Exit status 75 (EX_TEMPFAIL) means
//! the script was turned away by admission control and should be retried
//! later.

use super::executor::{ExecutionRequest, Executor, ExecutorError};
use crate::signals::CancellationToken;
use crate::store::{NodeOutput, ResourceUsage};
use async_trait::async_trait;
use std::process::{ExitStatus, Stdio};
use std::time::Instant;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::{Child, Command};
use tracing::debug;

#[cfg(unix)]
use std::os::unix::process::ExitStatusExt;

/// Exit status scripts use to report a resource rejection
pub const EX_TEMPFAIL: i32 = 75;

const PARAM_ENV_PREFIX: &str = "FLOWSCHED_PARAM_";

#[derive(Debug, Clone)]
pub struct ShellExecutor {
    shell: String,
}

impl Default for ShellExecutor {
    fn default() -> Self {
        Self::new()
    }
}

impl ShellExecutor {
    pub fn new() -> Self {
        Self {
            shell: "sh".to_string(),
        }
    }

    fn build_command(&self, request: &ExecutionRequest) -> Command {
        let mut cmd = Command::new(&self.shell);
        cmd.arg("-c").arg(&request.snapshot.script_body);

        cmd.env("FLOWSCHED_EXECUTION_ID", request.execution_id.to_string())
            .env("FLOWSCHED_NODE_ID", &request.node_id)
            .env("FLOWSCHED_ATTEMPT", request.attempt.to_string());
        for (name, value) in &request.params {
            cmd.env(param_env_name(name), param_env_value(value));
        }

        cmd.stdout(Stdio::piped());
        cmd.stderr(Stdio::piped());
        cmd.stdin(Stdio::null());
        cmd.kill_on_drop(true);
        cmd
    }
}

#[async_trait]
impl Executor for ShellExecutor {
    fn name(&self) -> &str {
        "shell"
    }

    async fn execute(
        &self,
        request: &ExecutionRequest,
        cancel: CancellationToken,
    ) -> Result<NodeOutput, ExecutorError> {
        let start = Instant::now();
        let mut child = self.build_command(request).spawn()?;
        debug!(
            execution_id = request.execution_id,
            node_id = %request.node_id,
            pid = ?child.id(),
            "script spawned"
        );

        let waited = tokio::select! {
            output = wait_for_child_output(&mut child) => Some(output),
            _ = cancel.cancelled() => None,
        };
        let Some(output) = waited else {
            let _ = child.kill().await;
            return Err(ExecutorError::Cancelled);
        };
        let (stdout, stderr, status) = output?;

        let exit_status = exit_status_code(&status);
        if exit_status == Some(EX_TEMPFAIL) {
            let reason = last_line(&stderr)
                .or_else(|| last_line(&stdout))
                .unwrap_or("script exited with EX_TEMPFAIL")
                .to_string();
            return Err(ExecutorError::ResourceRejected { reason });
        }
        if !status.success() {
            return Err(ExecutorError::failed(exit_status, stdout, stderr));
        }

        let result_data = serde_json::from_str(stdout.trim()).ok();
        Ok(NodeOutput {
            result_data,
            stdout,
            stderr,
            exit_status,
            usage: ResourceUsage {
                duration_ms: u64::try_from(start.elapsed().as_millis()).ok(),
                ..Default::default()
            },
        })
    }
}

/// `FLOWSCHED_PARAM_` followed by the upper-cased name, non-alphanumerics as `_`
pub fn param_env_name(name: &str) -> String {
    let suffix: String = name
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() {
                c.to_ascii_uppercase()
            } else {
                '_'
            }
        })
        .collect();
    format!("{}{}", PARAM_ENV_PREFIX, suffix)
}

fn param_env_value(value: &serde_json::Value) -> String {
    match value {
        serde_json::Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn last_line(text: &str) -> Option<&str> {
    text.lines().map(str::trim).rev().find(|l| !l.is_empty())
}

fn exit_status_code_parts(code: Option<i32>, _signal: Option<i32>) -> Option<i32> {
    if let Some(code) = code {
        return Some(code);
    }
    #[cfg(unix)]
    {
        if let Some(signal) = _signal {
            return Some(128 + signal);
        }
    }
    None
}

/// Exit code, or 128+signal for signal-terminated processes on Unix
fn exit_status_code(status: &ExitStatus) -> Option<i32> {
    #[cfg(unix)]
    let signal = status.signal();
    #[cfg(not(unix))]
    let signal = None;
    exit_status_code_parts(status.code(), signal)
}

async fn read_pipe<R: AsyncRead + Unpin>(pipe: Option<R>) -> std::io::Result<String> {
    let mut buf = Vec::new();
    if let Some(mut pipe) = pipe {
        pipe.read_to_end(&mut buf).await?;
    }
    Ok(String::from_utf8_lossy(&buf).into_owned())
}

/// Read stdout and stderr concurrently, then reap the child
async fn wait_for_child_output(
    child: &mut Child,
) -> Result<(String, String, ExitStatus), ExecutorError> {
    let stdout_pipe = child.stdout.take();
    let stderr_pipe = child.stderr.take();

    let (stdout, stderr) = match tokio::try_join!(read_pipe(stdout_pipe), read_pipe(stderr_pipe)) {
        Ok(output) => output,
        Err(e) => {
            let _ = child.kill().await;
            return Err(ExecutorError::Spawn(e));
        }
    };

    let status = child.wait().await?;
    Ok((stdout, stderr, status))
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::workflow::{NodeSnapshot, ScriptReference};
    use std::collections::BTreeMap;
    use std::time::Duration;

    fn request(script: &str, params: BTreeMap<String, serde_json::Value>) -> ExecutionRequest {
        ExecutionRequest {
            execution_id: 1,
            entry_id: 1,
            node_id: "n".into(),
            attempt: 1,
            snapshot: NodeSnapshot {
                node_id: "n".into(),
                name: "n".into(),
                script: ScriptReference::Custom("n".into()),
                script_body: script.into(),
                params: BTreeMap::new(),
            },
            params,
            timeout: Duration::from_secs(5),
        }
    }

    #[test]
    fn test_exit_code_parts() {
        assert_eq!(exit_status_code_parts(Some(0), None), Some(0));
        assert_eq!(exit_status_code_parts(Some(42), None), Some(42));
        // SIGKILL
        assert_eq!(exit_status_code_parts(None, Some(9)), Some(137));
        assert_eq!(exit_status_code_parts(None, None), None);
    }

    #[test]
    fn test_param_env_name() {
        assert_eq!(param_env_name("region"), "FLOWSCHED_PARAM_REGION");
        assert_eq!(param_env_name("batch-size.max"), "FLOWSCHED_PARAM_BATCH_SIZE_MAX");
    }

    #[tokio::test]
    async fn test_json_stdout_becomes_result_data() {
        let output = ShellExecutor::new()
            .execute(&request(r#"printf '{"rows": 3}'"#, BTreeMap::new()), CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(output.result_data, Some(serde_json::json!({"rows": 3})));
        assert_eq!(output.exit_status, Some(0));
        assert!(output.usage.duration_ms.is_some());
    }

    #[tokio::test]
    async fn test_plain_stdout_has_no_result_data() {
        let output = ShellExecutor::new()
            .execute(&request("echo hello; echo warn >&2", BTreeMap::new()), CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(output.result_data, None);
        assert_eq!(output.stdout, "hello\n");
        assert_eq!(output.stderr, "warn\n");
    }

    #[tokio::test]
    async fn test_params_are_exported() {
        let params = BTreeMap::from([
            ("region".to_string(), serde_json::json!("eu-west")),
            ("limit".to_string(), serde_json::json!(10)),
        ]);
        let output = ShellExecutor::new()
            .execute(
                &request(
                    r#"printf '%s %s' "$FLOWSCHED_PARAM_REGION" "$FLOWSCHED_PARAM_LIMIT""#,
                    params,
                ),
                CancellationToken::new(),
            )
            .await
            .unwrap();
        assert_eq!(output.stdout, "eu-west 10");
    }

    #[tokio::test]
    async fn test_nonzero_exit_is_failure() {
        let err = ShellExecutor::new()
            .execute(&request("echo bad >&2; exit 3", BTreeMap::new()), CancellationToken::new())
            .await
            .unwrap_err();
        match err {
            ExecutorError::Failed { exit_code, message, .. } => {
                assert_eq!(exit_code, Some(3));
                assert_eq!(message, "exit status 3: bad");
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_tempfail_is_resource_rejection() {
        let err = ShellExecutor::new()
            .execute(&request("echo 'quota exhausted' >&2; exit 75", BTreeMap::new()), CancellationToken::new())
            .await
            .unwrap_err();
        match err {
            ExecutorError::ResourceRejected { reason } => assert_eq!(reason, "quota exhausted"),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_cancel_kills_script() {
        let token = CancellationToken::new();
        let canceller = token.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            canceller.cancel();
        });

        let started = Instant::now();
        let err = ShellExecutor::new()
            .execute(&request("sleep 10", BTreeMap::new()), token)
            .await
            .unwrap_err();
        assert!(matches!(err, ExecutorError::Cancelled));
        assert!(started.elapsed() < Duration::from_secs(5));
    }
}
