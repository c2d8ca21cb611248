//! External code execution backends.
//!
//! Both providers follow the same convention: the interpreter serializes the
//! scope snapshot to a small JSON preamble, appends the block's source, and
//! expects the process to leave a `result` value behind — a Python provider
//! assigns into a local called `result` and the harness reads it back out of
//! the interpreter's globals after running; a generic command provider reads
//! the last line of stdout as JSON instead, since an arbitrary shell command
//! has no notion of a Python local.
//!
//! Binary discovery follows the pack's own subprocess-invocation convention
//! (locate once via `which`/`where`, then shell out with `tokio::process`
//! instead of `std::process` so `run_code` can be awaited without blocking
//! the evaluator).

use std::future::Future;
use std::pin::Pin;
use std::process::Stdio;

use tokio::io::AsyncWriteExt;
use tokio::process::Command;

use crate::errors::ProviderError;
use crate::value::{Scope, Value};

use super::CodeProvider;

fn scope_to_json(scope: &Scope) -> serde_json::Value {
    let map: serde_json::Map<String, serde_json::Value> =
        scope.iter().map(|(k, v)| (k.clone(), v.to_json())).collect();
    serde_json::Value::Object(map)
}

/// Runs `source` as a Python script, injecting the scope snapshot as local
/// variables via a small preamble and reading `result` back out as JSON.
pub struct PythonProvider {
    interpreter: String,
}

impl PythonProvider {
    pub fn new() -> Self {
        PythonProvider {
            interpreter: "python3".to_string(),
        }
    }
}

impl Default for PythonProvider {
    fn default() -> Self {
        Self::new()
    }
}

impl CodeProvider for PythonProvider {
    fn run_code(
        &self,
        source: &str,
        scope_snapshot: Scope,
    ) -> Pin<Box<dyn Future<Output = Result<Value, ProviderError>> + Send + '_>> {
        let source = source.to_string();
        Box::pin(async move {
            // The scope snapshot travels over stdin as a JSON line, not
            // spliced into the script text, so nothing in it needs escaping.
            let harness = format!(
                "import json, sys\n\
                 globals().update(json.loads(sys.stdin.readline()))\n\
                 {source}\n\
                 print(json.dumps(result))\n"
            );

            let mut child = Command::new(&self.interpreter)
                .arg("-c")
                .arg(&harness)
                .stdin(Stdio::piped())
                .stdout(Stdio::piped())
                .stderr(Stdio::piped())
                .spawn()
                .map_err(|e| ProviderError::ExecutionFailed {
                    message: format!("failed to spawn {}: {e}", self.interpreter),
                    stdout: None,
                    stderr: None,
                    exit_code: None,
                })?;

            if let Some(mut stdin) = child.stdin.take() {
                let mut payload = scope_to_json(&scope_snapshot).to_string();
                payload.push('\n');
                let _ = stdin.write_all(payload.as_bytes()).await;
            }

            let output = child.wait_with_output().await.map_err(|e| ProviderError::ExecutionFailed {
                message: format!("failed to read python output: {e}"),
                stdout: None,
                stderr: None,
                exit_code: None,
            })?;

            let stdout = String::from_utf8_lossy(&output.stdout).to_string();
            let stderr = String::from_utf8_lossy(&output.stderr).to_string();

            if !output.status.success() {
                return Err(ProviderError::ExecutionFailed {
                    message: format!("python exited with status {}", output.status),
                    stdout: Some(stdout),
                    stderr: Some(stderr),
                    exit_code: output.status.code(),
                });
            }

            let last_line = stdout.lines().last().unwrap_or_default();
            serde_json::from_str::<serde_json::Value>(last_line)
                .map(Value::from_json)
                .map_err(|e| ProviderError::ExecutionFailed {
                    message: format!("python code did not leave a JSON-serializable result: {e}"),
                    stdout: Some(stdout),
                    stderr: Some(stderr),
                    exit_code: output.status.code(),
                })
        })
    }
}

/// Runs `source` as a shell command line, piping the scope snapshot to
/// stdin as JSON and parsing the last line of stdout as the block's result.
pub struct CommandProvider {
    shell: String,
}

impl CommandProvider {
    pub fn new() -> Self {
        CommandProvider {
            shell: if cfg!(windows) { "cmd".to_string() } else { "sh".to_string() },
        }
    }
}

impl Default for CommandProvider {
    fn default() -> Self {
        Self::new()
    }
}

impl CodeProvider for CommandProvider {
    fn run_code(
        &self,
        source: &str,
        scope_snapshot: Scope,
    ) -> Pin<Box<dyn Future<Output = Result<Value, ProviderError>> + Send + '_>> {
        let source = source.to_string();
        let shell = self.shell.clone();
        Box::pin(async move {
            let shell_flag = if shell == "cmd" { "/C" } else { "-c" };
            let mut child = Command::new(&shell)
                .arg(shell_flag)
                .arg(&source)
                .stdin(Stdio::piped())
                .stdout(Stdio::piped())
                .stderr(Stdio::piped())
                .spawn()
                .map_err(|e| ProviderError::ExecutionFailed {
                    message: format!("failed to spawn {shell}: {e}"),
                    stdout: None,
                    stderr: None,
                    exit_code: None,
                })?;

            if let Some(mut stdin) = child.stdin.take() {
                let payload = scope_to_json(&scope_snapshot).to_string();
                let _ = stdin.write_all(payload.as_bytes()).await;
            }

            let output = child.wait_with_output().await.map_err(|e| ProviderError::ExecutionFailed {
                message: format!("failed to read command output: {e}"),
                stdout: None,
                stderr: None,
                exit_code: None,
            })?;

            let stdout = String::from_utf8_lossy(&output.stdout).to_string();
            let stderr = String::from_utf8_lossy(&output.stderr).to_string();

            if !output.status.success() {
                return Err(ProviderError::ExecutionFailed {
                    message: format!("command exited with status {}", output.status),
                    stdout: Some(stdout),
                    stderr: Some(stderr),
                    exit_code: output.status.code(),
                });
            }

            let last_line = stdout.lines().last().unwrap_or_default().trim();
            match serde_json::from_str::<serde_json::Value>(last_line) {
                Ok(v) => Ok(Value::from_json(v)),
                Err(_) => Ok(Value::String(stdout.trim_end().to_string())),
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scope_to_json_renders_an_object() {
        let mut scope = Scope::new();
        scope.insert("x".to_string(), Value::Int(5));
        let json = scope_to_json(&scope);
        assert_eq!(json["x"], 5);
    }

    #[test]
    fn command_provider_defaults_to_a_posix_shell_off_windows() {
        if !cfg!(windows) {
            assert_eq!(CommandProvider::new().shell, "sh");
        }
    }
}
