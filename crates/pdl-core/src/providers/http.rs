//! HTTP backend for `api` blocks.

use std::future::Future;
use std::pin::Pin;

use crate::errors::ProviderError;
use crate::value::Value;

use super::ApiProvider;

pub struct ReqwestApiProvider {
    client: reqwest::Client,
}

impl ReqwestApiProvider {
    pub fn new() -> Self {
        ReqwestApiProvider {
            client: reqwest::Client::new(),
        }
    }
}

impl Default for ReqwestApiProvider {
    fn default() -> Self {
        Self::new()
    }
}

impl ApiProvider for ReqwestApiProvider {
    fn http_get(&self, url: &str) -> Pin<Box<dyn Future<Output = Result<Value, ProviderError>> + Send + '_>> {
        let url = url.to_string();
        Box::pin(async move {
            let response = self.client.get(&url).send().await.map_err(|e| {
                if e.is_timeout() {
                    ProviderError::Timeout {
                        message: e.to_string(),
                        provider: Some("api".to_string()),
                    }
                } else {
                    ProviderError::Unavailable {
                        message: e.to_string(),
                        provider: Some("api".to_string()),
                        status_code: e.status().map(|s| s.as_u16()),
                    }
                }
            })?;

            if response.status() == reqwest::StatusCode::TOO_MANY_REQUESTS {
                return Err(ProviderError::RateLimit {
                    message: format!("rate limited fetching {url}"),
                    provider: Some("api".to_string()),
                    retry_after: response
                        .headers()
                        .get("retry-after")
                        .and_then(|v| v.to_str().ok())
                        .and_then(|v| v.parse::<f64>().ok()),
                });
            }
            if !response.status().is_success() {
                return Err(ProviderError::Unavailable {
                    message: format!("request to {url} failed with status {}", response.status()),
                    provider: Some("api".to_string()),
                    status_code: Some(response.status().as_u16()),
                });
            }

            let content_type = response
                .headers()
                .get(reqwest::header::CONTENT_TYPE)
                .and_then(|v| v.to_str().ok())
                .unwrap_or_default()
                .to_string();

            if content_type.contains("json") {
                let parsed: serde_json::Value = response.json().await.map_err(|e| ProviderError::Unavailable {
                    message: format!("response from {url} was not valid JSON: {e}"),
                    provider: Some("api".to_string()),
                    status_code: None,
                })?;
                Ok(Value::from_json(parsed))
            } else {
                let text = response.text().await.map_err(|e| ProviderError::Unavailable {
                    message: format!("failed to read response body from {url}: {e}"),
                    provider: Some("api".to_string()),
                    status_code: None,
                })?;
                Ok(Value::String(text))
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn provider_constructs_without_touching_the_network() {
        let _provider = ReqwestApiProvider::new();
    }
}
