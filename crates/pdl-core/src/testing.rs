//! Concrete fake providers for tests — not a mock framework. Each fake
//! records its calls and returns a canned answer: a handwritten struct over
//! `mockall`-style expectation builders, so a test failure points at a plain
//! assertion rather than an unmet-expectation panic from inside a macro.

use std::future::Future;
use std::pin::Pin;
use std::sync::Mutex;

use crate::errors::ProviderError;
use crate::providers::{ApiProvider, CodeProvider, ModelProvider, ReadProvider, SamplingParams};
use crate::value::{ChatMessage, Scope, Value};

/// Returns the same text for every call, recording the messages it was
/// invoked with.
pub struct FakeModelProvider {
    response: String,
    pub calls: Mutex<Vec<(String, Vec<ChatMessage>)>>,
}

impl FakeModelProvider {
    pub fn new(response: impl Into<String>) -> Self {
        FakeModelProvider {
            response: response.into(),
            calls: Mutex::new(Vec::new()),
        }
    }
}

impl ModelProvider for FakeModelProvider {
    fn generate_text(
        &self,
        model_id: &str,
        messages: &[ChatMessage],
        _params: &SamplingParams,
    ) -> Pin<Box<dyn Future<Output = Result<String, ProviderError>> + Send + '_>> {
        self.calls.lock().unwrap().push((model_id.to_string(), messages.to_vec()));
        let response = self.response.clone();
        Box::pin(async move { Ok(response) })
    }
}

/// Always fails with the given error, for exercising provider-error paths.
pub struct FailingModelProvider {
    error: ProviderError,
}

impl FailingModelProvider {
    pub fn new(error: ProviderError) -> Self {
        FailingModelProvider { error }
    }
}

impl ModelProvider for FailingModelProvider {
    fn generate_text(
        &self,
        _model_id: &str,
        _messages: &[ChatMessage],
        _params: &SamplingParams,
    ) -> Pin<Box<dyn Future<Output = Result<String, ProviderError>> + Send + '_>> {
        let error = self.error.clone();
        Box::pin(async move { Err(error) })
    }
}

/// Returns one canned response per call, in order, ignoring the actual
/// source and scope it was given — tests supply the queue up front and
/// assert on what the evaluator does with each result in turn.
pub struct FakeCodeProvider {
    responses: Mutex<Vec<Result<Value, ProviderError>>>,
    pub scopes_seen: Mutex<Vec<Scope>>,
}

impl FakeCodeProvider {
    pub fn with_responses(responses: Vec<Result<Value, ProviderError>>) -> Self {
        FakeCodeProvider {
            responses: Mutex::new(responses.into_iter().rev().collect()),
            scopes_seen: Mutex::new(Vec::new()),
        }
    }
}

impl CodeProvider for FakeCodeProvider {
    fn run_code(
        &self,
        _source: &str,
        scope_snapshot: Scope,
    ) -> Pin<Box<dyn Future<Output = Result<Value, ProviderError>> + Send + '_>> {
        self.scopes_seen.lock().unwrap().push(scope_snapshot);
        let next = self.responses.lock().unwrap().pop().unwrap_or(Ok(Value::Null));
        Box::pin(async move { next })
    }
}

/// Returns the same value for every `api` call, recording the URLs it saw.
pub struct FakeApiProvider {
    response: Value,
    pub urls_seen: Mutex<Vec<String>>,
}

impl FakeApiProvider {
    pub fn new(response: Value) -> Self {
        FakeApiProvider {
            response,
            urls_seen: Mutex::new(Vec::new()),
        }
    }
}

impl ApiProvider for FakeApiProvider {
    fn http_get(&self, url: &str) -> Pin<Box<dyn Future<Output = Result<Value, ProviderError>> + Send + '_>> {
        self.urls_seen.lock().unwrap().push(url.to_string());
        let response = self.response.clone();
        Box::pin(async move { Ok(response) })
    }
}

/// Returns one canned line of input per call, simulating stdin/file reads
/// without touching the filesystem or a terminal.
pub struct FakeReadProvider {
    lines: Mutex<Vec<String>>,
}

impl FakeReadProvider {
    pub fn with_lines(lines: Vec<String>) -> Self {
        FakeReadProvider {
            lines: Mutex::new(lines.into_iter().rev().collect()),
        }
    }
}

impl ReadProvider for FakeReadProvider {
    fn read_input(
        &self,
        _path: Option<&str>,
        _message: Option<&str>,
        _multiline: bool,
    ) -> Pin<Box<dyn Future<Output = Result<String, ProviderError>> + Send + '_>> {
        let next = self.lines.lock().unwrap().pop().unwrap_or_default();
        Box::pin(async move { Ok(next) })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn fake_model_provider_records_calls_and_returns_its_canned_response() {
        let provider = FakeModelProvider::new("hello");
        let messages = vec![ChatMessage { role: None, content: "hi".to_string() }];
        let result = provider
            .generate_text("openai/gpt-4", &messages, &SamplingParams::default())
            .await
            .unwrap();
        assert_eq!(result, "hello");
        assert_eq!(provider.calls.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn fake_code_provider_returns_responses_in_order() {
        let provider = FakeCodeProvider::with_responses(vec![
            Ok(Value::String("first".to_string())),
            Ok(Value::String("second".to_string())),
        ]);
        let first = provider.run_code("ignored", Scope::new()).await.unwrap();
        let second = provider.run_code("ignored", Scope::new()).await.unwrap();
        assert_eq!(first.as_text(), "first");
        assert_eq!(second.as_text(), "second");
    }

    #[tokio::test]
    async fn fake_api_provider_records_urls() {
        let provider = FakeApiProvider::new(Value::String("body".to_string()));
        provider.http_get("https://example.com/x").await.unwrap();
        assert_eq!(provider.urls_seen.lock().unwrap()[0], "https://example.com/x");
    }

    #[tokio::test]
    async fn fake_read_provider_yields_queued_lines() {
        let provider = FakeReadProvider::with_lines(vec!["a".to_string(), "b".to_string()]);
        assert_eq!(provider.read_input(None, None, false).await.unwrap(), "a");
        assert_eq!(provider.read_input(None, None, false).await.unwrap(), "b");
    }
}
