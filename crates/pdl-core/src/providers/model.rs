//! Bam/Watsonx/OpenAI-style model backends.
//!
//! Each provider memoizes its client(s) lazily, per model id: constructing
//! the provider never touches the environment, and the first
//! `generate_text` call for a given model id is the one that resolves
//! credentials and builds the `reqwest::Client`, grounded on the original's
//! `BamModel`/`WatsonxModel`/`OpenAIModel` static-memoized-client pattern
//! (`pdl_llms.py`).

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Mutex;

use serde_json::json;

use crate::config::{BamCredentials, OpenAiCredentials, WatsonxCredentials};
use crate::errors::ProviderError;
use crate::value::ChatMessage;

use super::{ModelProvider, SamplingParams};

fn messages_to_json(messages: &[ChatMessage]) -> Vec<serde_json::Value> {
    messages
        .iter()
        .map(|m| {
            json!({
                "role": m.role.map(|r| r.to_string()).unwrap_or_else(|| "user".to_string()),
                "content": m.content,
            })
        })
        .collect()
}

fn http_error(err: reqwest::Error, provider: &str) -> ProviderError {
    if err.is_timeout() {
        ProviderError::Timeout {
            message: err.to_string(),
            provider: Some(provider.to_string()),
        }
    } else {
        ProviderError::Unavailable {
            message: err.to_string(),
            provider: Some(provider.to_string()),
            status_code: err.status().map(|s| s.as_u16()),
        }
    }
}

/// A single memoized Bam client, created on first use.
pub struct BamProvider {
    client: Mutex<Option<(reqwest::Client, BamCredentials)>>,
}

impl BamProvider {
    pub fn new() -> Self {
        BamProvider {
            client: Mutex::new(None),
        }
    }

    fn client(&self) -> Result<(reqwest::Client, BamCredentials), ProviderError> {
        let mut guard = self.client.lock().unwrap();
        if guard.is_none() {
            let creds = BamCredentials::from_env()?;
            *guard = Some((reqwest::Client::new(), creds));
        }
        Ok(guard.as_ref().unwrap().clone())
    }
}

impl Default for BamProvider {
    fn default() -> Self {
        Self::new()
    }
}

impl ModelProvider for BamProvider {
    fn generate_text(
        &self,
        model_id: &str,
        messages: &[ChatMessage],
        params: &SamplingParams,
    ) -> Pin<Box<dyn Future<Output = Result<String, ProviderError>> + Send + '_>> {
        let model_id = model_id.to_string();
        let prompt = messages
            .iter()
            .map(|m| m.content.clone())
            .collect::<Vec<_>>()
            .join("\n");
        let params = params.clone();
        Box::pin(async move {
            let (client, creds) = self.client()?;
            let api = creds.api.clone().unwrap_or_else(|| "https://bam-api.res.ibm.com".to_string());
            let body = json!({
                "model_id": model_id,
                "input": prompt,
                "parameters": {
                    "decoding_method": params.decoding,
                    "max_new_tokens": params.max_new_tokens,
                    "min_new_tokens": params.min_new_tokens,
                    "repetition_penalty": params.repetition_penalty,
                    "include_stop_sequence": params.include_stop_sequence,
                },
            });
            let response = client
                .post(format!("{api}/v2/text/generation"))
                .bearer_auth(&creds.key)
                .json(&body)
                .send()
                .await
                .map_err(|e| http_error(e, "bam"))?;
            if !response.status().is_success() {
                return Err(ProviderError::Unavailable {
                    message: format!("bam request failed with status {}", response.status()),
                    provider: Some("bam".to_string()),
                    status_code: Some(response.status().as_u16()),
                });
            }
            let parsed: serde_json::Value = response.json().await.map_err(|e| http_error(e, "bam"))?;
            Ok(parsed["results"][0]["generated_text"].as_str().unwrap_or_default().to_string())
        })
    }
}

/// Watsonx model clients, memoized per model id (not just per platform) —
/// the original keys its cache dict by model id, since separate model ids
/// on the same project need separate inference handles.
pub struct WatsonxProvider {
    clients: Mutex<HashMap<String, (reqwest::Client, WatsonxCredentials)>>,
}

impl WatsonxProvider {
    pub fn new() -> Self {
        WatsonxProvider {
            clients: Mutex::new(HashMap::new()),
        }
    }

    fn client_for(&self, model_id: &str) -> Result<(reqwest::Client, WatsonxCredentials), ProviderError> {
        let mut clients = self.clients.lock().unwrap();
        if let Some(entry) = clients.get(model_id) {
            return Ok(entry.clone());
        }
        let creds = WatsonxCredentials::from_env()?;
        let entry = (reqwest::Client::new(), creds);
        clients.insert(model_id.to_string(), entry.clone());
        Ok(entry)
    }
}

impl Default for WatsonxProvider {
    fn default() -> Self {
        Self::new()
    }
}

impl ModelProvider for WatsonxProvider {
    fn generate_text(
        &self,
        model_id: &str,
        messages: &[ChatMessage],
        params: &SamplingParams,
    ) -> Pin<Box<dyn Future<Output = Result<String, ProviderError>> + Send + '_>> {
        let model_id = model_id.to_string();
        let messages = messages_to_json(messages);
        let params = params.clone();
        Box::pin(async move {
            let (client, creds) = self.client_for(&model_id)?;
            let api = creds.api.clone().unwrap_or_else(|| "https://us-south.ml.cloud.ibm.com".to_string());
            let body = json!({
                "model_id": model_id,
                "project_id": creds.project_id,
                "messages": messages,
                "parameters": {
                    "decoding_method": params.decoding,
                    "max_new_tokens": params.max_new_tokens,
                    "min_new_tokens": params.min_new_tokens,
                    "repetition_penalty": params.repetition_penalty,
                },
            });
            let response = client
                .post(format!("{api}/ml/v1/text/chat"))
                .bearer_auth(&creds.key)
                .json(&body)
                .send()
                .await
                .map_err(|e| http_error(e, "watsonx"))?;
            if !response.status().is_success() {
                return Err(ProviderError::Unavailable {
                    message: format!("watsonx request failed with status {}", response.status()),
                    provider: Some("watsonx".to_string()),
                    status_code: Some(response.status().as_u16()),
                });
            }
            let parsed: serde_json::Value = response.json().await.map_err(|e| http_error(e, "watsonx"))?;
            Ok(parsed["choices"][0]["message"]["content"]
                .as_str()
                .unwrap_or_default()
                .to_string())
        })
    }
}

/// An OpenAI-compatible chat-completions backend.
pub struct OpenAiProvider {
    client: reqwest::Client,
    credentials: OpenAiCredentials,
}

impl OpenAiProvider {
    pub fn new() -> Self {
        OpenAiProvider {
            client: reqwest::Client::new(),
            credentials: OpenAiCredentials::from_env(),
        }
    }
}

impl Default for OpenAiProvider {
    fn default() -> Self {
        Self::new()
    }
}

impl ModelProvider for OpenAiProvider {
    fn generate_text(
        &self,
        model_id: &str,
        messages: &[ChatMessage],
        params: &SamplingParams,
    ) -> Pin<Box<dyn Future<Output = Result<String, ProviderError>> + Send + '_>> {
        let model_id = model_id.to_string();
        let messages = messages_to_json(messages);
        let params = params.clone();
        Box::pin(async move {
            let mut request = self
                .client
                .post(format!("{}/chat/completions", self.credentials.base_url))
                .json(&json!({
                    "model": model_id,
                    "messages": messages,
                    "max_tokens": params.max_new_tokens,
                    "stop": if params.stop_sequences.is_empty() { None } else { Some(params.stop_sequences.clone()) },
                }));
            if let Some(key) = &self.credentials.api_key {
                request = request.bearer_auth(key);
            }
            let response = request.send().await.map_err(|e| http_error(e, "openai"))?;
            if response.status() == reqwest::StatusCode::UNAUTHORIZED {
                return Err(ProviderError::Authentication {
                    message: "openai rejected the request's credentials".to_string(),
                    provider: Some("openai".to_string()),
                });
            }
            if !response.status().is_success() {
                return Err(ProviderError::Unavailable {
                    message: format!("openai request failed with status {}", response.status()),
                    provider: Some("openai".to_string()),
                    status_code: Some(response.status().as_u16()),
                });
            }
            let parsed: serde_json::Value = response.json().await.map_err(|e| http_error(e, "openai"))?;
            Ok(parsed["choices"][0]["message"]["content"]
                .as_str()
                .unwrap_or_default()
                .to_string())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::value::Role;

    #[test]
    fn messages_to_json_defaults_missing_role_to_user() {
        let messages = vec![ChatMessage {
            role: None,
            content: "hi".to_string(),
        }];
        let json = messages_to_json(&messages);
        assert_eq!(json[0]["role"], "user");
    }

    #[test]
    fn messages_to_json_preserves_assistant_role() {
        let messages = vec![ChatMessage {
            role: Some(Role::Assistant),
            content: "hi".to_string(),
        }];
        let json = messages_to_json(&messages);
        assert_eq!(json[0]["role"], "assistant");
    }
}
