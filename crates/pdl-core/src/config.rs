//! Environment-derived configuration: provider credentials and sampling
//! defaults.
//!
//! A small typed wrapper with accessors that return a `ConfigMissing`-style
//! error, reading from `std::env` — the recognized configuration surface is
//! a fixed set of environment variables rather than a config file.
//!
//! Credentials are resolved lazily, per platform, not eagerly at process
//! start: constructing a [`ProviderCredentials`] never fails, and a missing
//! `WATSONX_PROJECT_ID` only becomes an error if a program actually invokes
//! a Watsonx-backed model (§4.5).

use std::env;

use crate::errors::ProviderError;
use crate::providers::SamplingParams;

/// Recognized environment variables (§6).
pub const GENAI_KEY: &str = "GENAI_KEY";
pub const GENAI_API: &str = "GENAI_API";
pub const WATSONX_KEY: &str = "WATSONX_KEY";
pub const WATSONX_API: &str = "WATSONX_API";
pub const WATSONX_PROJECT_ID: &str = "WATSONX_PROJECT_ID";
pub const OPENAI_BASE_URL: &str = "OPENAI_BASE_URL";
pub const OPENAI_API_KEY: &str = "OPENAI_API_KEY";

/// Bam (GenAI) credentials, read on first use by [`crate::providers::model::BamProvider`].
#[derive(Debug, Clone)]
pub struct BamCredentials {
    pub key: String,
    pub api: Option<String>,
}

impl BamCredentials {
    pub fn from_env() -> Result<Self, ProviderError> {
        let key = env::var(GENAI_KEY).map_err(|_| missing(GENAI_KEY, "bam"))?;
        Ok(BamCredentials {
            key,
            api: env::var(GENAI_API).ok(),
        })
    }
}

/// Watsonx credentials, read on first use by [`crate::providers::model::WatsonxProvider`].
#[derive(Debug, Clone)]
pub struct WatsonxCredentials {
    pub key: String,
    pub api: Option<String>,
    pub project_id: String,
}

impl WatsonxCredentials {
    pub fn from_env() -> Result<Self, ProviderError> {
        let key = env::var(WATSONX_KEY).map_err(|_| missing(WATSONX_KEY, "watsonx"))?;
        let project_id = env::var(WATSONX_PROJECT_ID).map_err(|_| missing(WATSONX_PROJECT_ID, "watsonx"))?;
        Ok(WatsonxCredentials {
            key,
            api: env::var(WATSONX_API).ok(),
            project_id,
        })
    }
}

/// OpenAI-style credentials, read on first use by [`crate::providers::model::OpenAiProvider`].
#[derive(Debug, Clone)]
pub struct OpenAiCredentials {
    pub api_key: Option<String>,
    pub base_url: String,
}

impl OpenAiCredentials {
    /// Unlike Bam/Watsonx, a missing `OPENAI_API_KEY` is not itself fatal
    /// here — some OpenAI-compatible endpoints (local model servers) don't
    /// require one. The request still goes out; the provider surfaces an
    /// `Authentication` error only if the endpoint actually rejects it.
    pub fn from_env() -> Self {
        OpenAiCredentials {
            api_key: env::var(OPENAI_API_KEY).ok(),
            base_url: env::var(OPENAI_BASE_URL).unwrap_or_else(|_| "https://api.openai.com/v1".to_string()),
        }
    }
}

fn missing(var: &str, provider: &str) -> ProviderError {
    ProviderError::Authentication {
        message: format!("missing required environment variable: {var}"),
        provider: Some(provider.to_string()),
    }
}

/// Applies §6's documented defaults on top of whatever a `model` block's
/// `parameters` field already set.
pub fn default_sampling_params() -> SamplingParams {
    SamplingParams::default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_bam_key_is_an_authentication_error() {
        // SAFETY: test runs single-threaded within this process's env,
        // and nothing else reads GENAI_KEY concurrently in this test binary.
        unsafe {
            env::remove_var(GENAI_KEY);
        }
        let err = BamCredentials::from_env().unwrap_err();
        assert!(matches!(err, ProviderError::Authentication { .. }));
    }

    #[test]
    fn openai_credentials_default_base_url() {
        unsafe {
            env::remove_var(OPENAI_BASE_URL);
        }
        let creds = OpenAiCredentials::from_env();
        assert_eq!(creds.base_url, "https://api.openai.com/v1");
    }

    #[test]
    fn default_sampling_params_match_the_documented_defaults() {
        let params = default_sampling_params();
        assert_eq!(params.decoding, "greedy");
        assert_eq!(params.max_new_tokens, 1024);
        assert_eq!(params.min_new_tokens, 1);
        assert_eq!(params.repetition_penalty, 1.07);
        assert!(!params.include_stop_sequence);
    }
}
