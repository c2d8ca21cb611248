//! Standard input / file backend for `read` blocks.

use std::future::Future;
use std::io::Write as _;
use std::pin::Pin;

use tokio::io::{AsyncBufReadExt, AsyncReadExt, BufReader};

use crate::errors::ProviderError;

use super::ReadProvider;

/// Reads from a named file when `path` is given, otherwise from standard
/// input. `multiline` controls whether stdin reads to EOF or to the first
/// newline; an optional `message` is written to standard error as a prompt
/// before an interactive read (never before a file read).
pub struct StdReadProvider;

impl StdReadProvider {
    pub fn new() -> Self {
        StdReadProvider
    }
}

impl Default for StdReadProvider {
    fn default() -> Self {
        Self::new()
    }
}

impl ReadProvider for StdReadProvider {
    fn read_input(
        &self,
        path: Option<&str>,
        message: Option<&str>,
        multiline: bool,
    ) -> Pin<Box<dyn Future<Output = Result<String, ProviderError>> + Send + '_>> {
        let path = path.map(str::to_string);
        let message = message.map(str::to_string);
        Box::pin(async move {
            if let Some(path) = path {
                return tokio::fs::read_to_string(&path).await.map_err(|e| ProviderError::Other {
                    message: format!("failed to read {path}: {e}"),
                    provider: Some("read".to_string()),
                    retryable: false,
                });
            }

            if let Some(message) = &message {
                let mut stderr = std::io::stderr();
                let _ = write!(stderr, "{message}");
                let _ = stderr.flush();
            }

            let mut stdin = BufReader::new(tokio::io::stdin());
            if multiline {
                let mut buffer = String::new();
                stdin
                    .read_to_string(&mut buffer)
                    .await
                    .map_err(|e| ProviderError::Other {
                        message: format!("failed to read standard input: {e}"),
                        provider: Some("read".to_string()),
                        retryable: false,
                    })?;
                Ok(buffer)
            } else {
                let mut line = String::new();
                stdin.read_line(&mut line).await.map_err(|e| ProviderError::Other {
                    message: format!("failed to read standard input: {e}"),
                    provider: Some("read".to_string()),
                    retryable: false,
                })?;
                if line.ends_with('\n') {
                    line.pop();
                    if line.ends_with('\r') {
                        line.pop();
                    }
                }
                Ok(line)
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn reads_a_file_verbatim() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("input.txt");
        std::fs::write(&path, "hello there\n").unwrap();

        let provider = StdReadProvider::new();
        let content = provider
            .read_input(Some(path.to_str().unwrap()), None, true)
            .await
            .unwrap();
        assert_eq!(content, "hello there\n");
    }
}
