//! Provider traits and the registry that dispatches to them.
//!
//! # Design decisions
//!
//! - **Explicit `Pin<Box<dyn Future>>`** instead of `#[async_trait]` — no
//!   macro magic, the actual return type is visible at the trait definition.
//! - **`Send + Sync` on the trait itself** — errors at impl site, not
//!   scattered across call sites.
//! - **`Arc<dyn Trait>`** over generics — the registry loads providers by
//!   name at runtime; there is no static set of provider types to monomorphize
//!   over.
//!
//! Each provider exposes one narrow verb, matching §4.5: `generate_text`,
//! `run_code`, `http_get`, `read_input`.

pub mod code;
pub mod http;
pub mod model;
pub mod read;

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex};

use crate::errors::ProviderError;
use crate::value::{ChatMessage, Scope, Value};

/// Sampling parameters for a model invocation. Defaults per §6.
#[derive(Debug, Clone)]
pub struct SamplingParams {
    pub decoding: String,
    pub max_new_tokens: u32,
    pub min_new_tokens: u32,
    pub repetition_penalty: f64,
    pub include_stop_sequence: bool,
    pub stop_sequences: Vec<String>,
}

impl Default for SamplingParams {
    fn default() -> Self {
        SamplingParams {
            decoding: "greedy".to_string(),
            max_new_tokens: 1024,
            min_new_tokens: 1,
            repetition_penalty: 1.07,
            include_stop_sequence: false,
            stop_sequences: Vec::new(),
        }
    }
}

/// A large-language-model completion backend, dispatched by platform prefix
/// (the part of a model id before the first `/`).
pub trait ModelProvider: Send + Sync {
    /// Generate text for the given model id and chat history.
    fn generate_text(
        &self,
        model_id: &str,
        messages: &[ChatMessage],
        params: &SamplingParams,
    ) -> Pin<Box<dyn Future<Output = Result<String, ProviderError>> + Send + '_>>;
}

/// An external-code execution backend, dispatched by language (`python`,
/// `command`, …).
pub trait CodeProvider: Send + Sync {
    /// Run `source` against a snapshot of the enclosing scope. Convention:
    /// the code sets a variable named `result`; its final value becomes the
    /// block's result. Mutations to any other name in the snapshot are
    /// invisible to the caller (§4.7, P5) — the provider receives an owned
    /// copy, not a reference into the live scope.
    fn run_code(
        &self,
        source: &str,
        scope_snapshot: Scope,
    ) -> Pin<Box<dyn Future<Output = Result<Value, ProviderError>> + Send + '_>>;
}

/// An HTTP backend for `api` blocks.
pub trait ApiProvider: Send + Sync {
    fn http_get(&self, url: &str) -> Pin<Box<dyn Future<Output = Result<Value, ProviderError>> + Send + '_>>;
}

/// A backend for `read` blocks: files or standard input.
pub trait ReadProvider: Send + Sync {
    fn read_input(
        &self,
        path: Option<&str>,
        message: Option<&str>,
        multiline: bool,
    ) -> Pin<Box<dyn Future<Output = Result<String, ProviderError>> + Send + '_>>;
}

/// Dispatches model/code/api/read requests to pluggable providers, mounted
/// by name. The only process-wide state in the interpreter; constructed
/// once and passed into `eval` as a parameter so tests can substitute fakes
/// (see [`crate::testing`]).
///
/// Mount/get-by-name, one map per provider kind rather than a single
/// tool/provider slot map.
pub struct ProviderRegistry {
    model_providers: Mutex<HashMap<String, Arc<dyn ModelProvider>>>,
    code_providers: Mutex<HashMap<String, Arc<dyn CodeProvider>>>,
    api_provider: Mutex<Option<Arc<dyn ApiProvider>>>,
    read_provider: Mutex<Option<Arc<dyn ReadProvider>>>,
}

impl ProviderRegistry {
    pub fn new() -> Self {
        ProviderRegistry {
            model_providers: Mutex::new(HashMap::new()),
            code_providers: Mutex::new(HashMap::new()),
            api_provider: Mutex::new(None),
            read_provider: Mutex::new(None),
        }
    }

    /// Builds a registry with the model/code/api/read providers a real
    /// program needs: Bam/Watsonx/OpenAI model backends (credentials read
    /// lazily from the environment, see [`crate::config`]), `python`/`command`
    /// code backends, one `reqwest`-backed HTTP client, and a stdin/file
    /// reader.
    pub fn with_default_providers() -> Self {
        let registry = Self::new();
        registry.mount_model_provider("bam", Arc::new(model::BamProvider::new()));
        registry.mount_model_provider("watsonx", Arc::new(model::WatsonxProvider::new()));
        registry.mount_model_provider("openai", Arc::new(model::OpenAiProvider::new()));
        registry.mount_code_provider("python", Arc::new(code::PythonProvider::new()));
        registry.mount_code_provider("command", Arc::new(code::CommandProvider::new()));
        registry.set_api_provider(Arc::new(http::ReqwestApiProvider::new()));
        registry.set_read_provider(Arc::new(read::StdReadProvider::new()));
        registry
    }

    pub fn mount_model_provider(&self, platform: &str, provider: Arc<dyn ModelProvider>) {
        self.model_providers
            .lock()
            .unwrap()
            .insert(platform.to_string(), provider);
    }

    pub fn get_model_provider(&self, platform: &str) -> Option<Arc<dyn ModelProvider>> {
        self.model_providers.lock().unwrap().get(platform).cloned()
    }

    pub fn unmount_model_provider(&self, platform: &str) {
        self.model_providers.lock().unwrap().remove(platform);
    }

    pub fn mount_code_provider(&self, language: &str, provider: Arc<dyn CodeProvider>) {
        self.code_providers
            .lock()
            .unwrap()
            .insert(language.to_string(), provider);
    }

    pub fn get_code_provider(&self, language: &str) -> Option<Arc<dyn CodeProvider>> {
        self.code_providers.lock().unwrap().get(language).cloned()
    }

    pub fn set_api_provider(&self, provider: Arc<dyn ApiProvider>) {
        *self.api_provider.lock().unwrap() = Some(provider);
    }

    pub fn get_api_provider(&self) -> Option<Arc<dyn ApiProvider>> {
        self.api_provider.lock().unwrap().clone()
    }

    pub fn set_read_provider(&self, provider: Arc<dyn ReadProvider>) {
        *self.read_provider.lock().unwrap() = Some(provider);
    }

    pub fn get_read_provider(&self) -> Option<Arc<dyn ReadProvider>> {
        self.read_provider.lock().unwrap().clone()
    }
}

impl Default for ProviderRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Splits a model id like `watsonx/ibm/granite-34b-code-instruct` into its
/// platform prefix and the remainder. A model id with no `/` has no
/// recognized platform.
pub fn split_platform(model_id: &str) -> (Option<&str>, &str) {
    match model_id.split_once('/') {
        Some((platform, rest)) => (Some(platform), rest),
        None => (None, model_id),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Compile-time object-safety check.
    #[test]
    fn traits_are_object_safe() {
        fn _assert_model(_: Arc<dyn ModelProvider>) {}
        fn _assert_code(_: Arc<dyn CodeProvider>) {}
        fn _assert_api(_: Arc<dyn ApiProvider>) {}
        fn _assert_read(_: Arc<dyn ReadProvider>) {}
    }

    #[test]
    fn split_platform_on_slash() {
        assert_eq!(
            split_platform("watsonx/ibm/granite-34b-code-instruct"),
            (Some("watsonx"), "ibm/granite-34b-code-instruct")
        );
        assert_eq!(split_platform("unprefixed-model"), (None, "unprefixed-model"));
    }

    #[test]
    fn mount_and_get_model_provider_round_trips() {
        struct Noop;
        impl ModelProvider for Noop {
            fn generate_text(
                &self,
                _model_id: &str,
                _messages: &[ChatMessage],
                _params: &SamplingParams,
            ) -> Pin<Box<dyn Future<Output = Result<String, ProviderError>> + Send + '_>> {
                Box::pin(async { Ok(String::new()) })
            }
        }

        let registry = ProviderRegistry::new();
        assert!(registry.get_model_provider("openai").is_none());
        registry.mount_model_provider("openai", Arc::new(Noop));
        assert!(registry.get_model_provider("openai").is_some());
        registry.unmount_model_provider("openai");
        assert!(registry.get_model_provider("openai").is_none());
    }
}
