//! memoization of model completion requests.
//!
//! the key is the request plus its connection options with the credential (`token`)
//! and call site (`source`) removed, so identical requests issued under different
//! credentials or from different places share an entry.
use futures::future::{self, Either};
use log::*;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::future::Future;
use std::sync::Arc;

use super::{Cache, CacheKind, CacheOptions, CacheRegistry};
use crate::cancel::CancellationToken;
use crate::error::CacheError;

pub const DEFAULT_CHAT_CACHE_NAME: &str = "chat";
pub const DEFAULT_CHAT_CACHE_KIND: CacheKind = CacheKind::BlobFile;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatMessage {
    pub role: String,
    pub content: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
}

impl ChatMessage {
    pub fn new(role: &str, content: &str) -> ChatMessage {
        ChatMessage {
            role: role.to_string(),
            content: Value::String(content.to_string()),
            name: None,
            tool_call_id: None,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatCompletionRequest {
    pub model: String,
    pub messages: Vec<ChatMessage>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub top_p: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub seed: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response_format: Option<Value>,
    /// tool schemas, passed through as json
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tools: Vec<Value>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionOptions {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub base_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provider: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_version: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,
    /// where the call came from; informational only
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
}

impl ConnectionOptions {
    /// a copy without the fields that must not influence the cache key
    pub fn without_credentials(&self) -> ConnectionOptions {
        ConnectionOptions {
            token: None,
            source: None,
            ..self.clone()
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Usage {
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
    pub total_tokens: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolCall {
    pub id: String,
    pub name: String,
    pub arguments: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatCompletionResponse {
    pub text: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finish_reason: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub usage: Option<Usage>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tool_calls: Vec<ToolCall>,
}

/// the hashed key: request fields and sanitized connection options side by side
#[derive(Debug, Serialize)]
pub struct ChatCacheKey<'a> {
    #[serde(flatten)]
    request: &'a ChatCompletionRequest,
    #[serde(flatten)]
    connection: ConnectionOptions,
}

impl<'a> ChatCacheKey<'a> {
    pub fn new(request: &'a ChatCompletionRequest, options: &ConnectionOptions) -> Self {
        ChatCacheKey {
            request,
            connection: options.without_credentials(),
        }
    }
}

/// outcome of `ChatCompletionCache::complete`
#[derive(Debug, Clone, PartialEq)]
pub struct Completion {
    pub response: ChatCompletionResponse,
    pub cached: bool,
}

#[derive(Debug, Clone)]
pub struct ChatCompletionCache {
    // None when caching is disabled by an unusable name
    cache: Option<Arc<Cache>>,
}

impl ChatCompletionCache {
    /// open (or reuse) the completion cache; defaults to the shared `chat` blob cache
    pub async fn open(
        registry: &CacheRegistry,
        name: Option<&str>,
        kind: Option<CacheKind>,
    ) -> ChatCompletionCache {
        let name = name.unwrap_or(DEFAULT_CHAT_CACHE_NAME);
        let kind = kind.unwrap_or(DEFAULT_CHAT_CACHE_KIND);
        let cache = registry.create_cache(name, CacheOptions::new(kind)).await;
        if cache.is_none() {
            warn!("chat cache name '{}' is unusable, caching disabled", name);
        }

        ChatCompletionCache { cache }
    }

    pub fn is_enabled(&self) -> bool {
        self.cache.is_some()
    }

    pub fn cache(&self) -> Option<&Arc<Cache>> {
        self.cache.as_ref()
    }

    pub async fn get(
        &self,
        request: &ChatCompletionRequest,
        options: &ConnectionOptions,
    ) -> Option<ChatCompletionResponse> {
        let cache = self.cache.as_ref()?;
        cache.get(&ChatCacheKey::new(request, options)).await
    }

    pub async fn set(
        &self,
        request: &ChatCompletionRequest,
        options: &ConnectionOptions,
        response: &ChatCompletionResponse,
    ) -> Result<(), CacheError> {
        match &self.cache {
            Some(cache) => cache.set(&ChatCacheKey::new(request, options), response).await,
            None => Ok(()),
        }
    }

    /// serve the request from the cache, or run `producer` and remember its response.
    ///
    /// the lookup and the producer both stop with `CacheError::Cancelled` when the
    /// token fires; a cancelled producer stores nothing.
    pub async fn complete<F, Fut>(
        &self,
        request: &ChatCompletionRequest,
        options: &ConnectionOptions,
        token: &CancellationToken,
        producer: F,
    ) -> anyhow::Result<Completion>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = anyhow::Result<ChatCompletionResponse>>,
    {
        if let Some(cache) = &self.cache {
            let key = ChatCacheKey::new(request, options);
            if let Some(response) = cache.get_cancellable(&key, token).await? {
                debug!("chat cache hit for model {}", request.model);
                return Ok(Completion {
                    response,
                    cached: true,
                });
            }
        } else {
            token.check()?;
        }

        let produce = Box::pin(producer());
        let cancelled = Box::pin(token.cancelled());
        let response = match future::select(produce, cancelled).await {
            Either::Left((response, _)) => response?,
            Either::Right(_) => return Err(CacheError::Cancelled.into()),
        };

        self.set(request, options, &response).await?;
        Ok(Completion {
            response,
            cached: false,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::compute_sha;

    fn request() -> ChatCompletionRequest {
        ChatCompletionRequest {
            model: "openai:gpt-4o".to_string(),
            messages: vec![
                ChatMessage::new("system", "be brief"),
                ChatMessage::new("user", "hello"),
            ],
            temperature: Some(0.2),
            ..Default::default()
        }
    }

    fn options(token: &str, source: &str) -> ConnectionOptions {
        ConnectionOptions {
            base_url: Some("https://api.example.com/v1".to_string()),
            provider: Some("openai".to_string()),
            token: Some(token.to_string()),
            source: Some(source.to_string()),
            ..Default::default()
        }
    }

    fn response(text: &str) -> ChatCompletionResponse {
        ChatCompletionResponse {
            text: text.to_string(),
            finish_reason: Some("stop".to_string()),
            usage: Some(Usage {
                prompt_tokens: 10,
                completion_tokens: 2,
                total_tokens: 12,
            }),
            tool_calls: vec![],
        }
    }

    #[test]
    fn key_ignores_token_and_source() {
        let req = request();
        let a = compute_sha(&ChatCacheKey::new(&req, &options("secret-1", "script a"))).unwrap();
        let b = compute_sha(&ChatCacheKey::new(&req, &options("secret-2", "script b"))).unwrap();
        assert_eq!(a, b);

        let key = serde_json::to_value(ChatCacheKey::new(&req, &options("secret", "x"))).unwrap();
        assert!(key.get("token").is_none());
        assert!(key.get("source").is_none());
        assert_eq!(key["model"], "openai:gpt-4o");
    }

    #[test]
    fn key_tracks_request_fields() {
        let req = request();
        let mut hotter = request();
        hotter.temperature = Some(0.9);
        let opts = options("t", "s");

        assert_ne!(
            compute_sha(&ChatCacheKey::new(&req, &opts)).unwrap(),
            compute_sha(&ChatCacheKey::new(&hotter, &opts)).unwrap()
        );

        let mut other_host = opts.clone();
        other_host.base_url = Some("https://other.example.com".to_string());
        assert_ne!(
            compute_sha(&ChatCacheKey::new(&req, &opts)).unwrap(),
            compute_sha(&ChatCacheKey::new(&req, &other_host)).unwrap()
        );
    }

    #[test]
    fn complete_memoizes_across_credentials() {
        async_std::task::block_on(async move {
            let root = tempfile::tempdir().unwrap();
            let registry = CacheRegistry::new(root.path());
            let cache = ChatCompletionCache::open(&registry, None, None).await;
            assert!(cache.is_enabled());
            assert_eq!(cache.cache().unwrap().kind(), CacheKind::BlobFile);

            let token = CancellationToken::new();
            let req = request();

            let first = cache
                .complete(&req, &options("one", "a"), &token, || async {
                    Ok(response("hi"))
                })
                .await
                .unwrap();
            assert!(!first.cached);

            let second = cache
                .complete(&req, &options("two", "b"), &token, || async {
                    Err(anyhow::anyhow!("should not be called"))
                })
                .await
                .unwrap();
            assert!(second.cached);
            assert_eq!(second.response, response("hi"));
            assert!(root.path().join(DEFAULT_CHAT_CACHE_NAME).is_dir());
        });
    }

    #[test]
    fn disabled_cache_is_a_no_op() {
        async_std::task::block_on(async move {
            let registry = CacheRegistry::new("unused");
            let cache = ChatCompletionCache::open(&registry, Some(""), None).await;
            assert!(!cache.is_enabled());

            let req = request();
            let opts = options("t", "s");
            assert!(cache.set(&req, &opts, &response("x")).await.is_ok());
            assert!(cache.get(&req, &opts).await.is_none());

            let token = CancellationToken::new();
            let done = cache
                .complete(&req, &opts, &token, || async { Ok(response("y")) })
                .await
                .unwrap();
            assert!(!done.cached);
        });
    }

    #[test]
    fn cancelled_completion_stores_nothing() {
        async_std::task::block_on(async move {
            let registry = CacheRegistry::new("unused");
            let cache = ChatCompletionCache::open(&registry, Some("cancel"), Some(CacheKind::Memory)).await;

            let token = CancellationToken::new();
            token.cancel();

            let req = request();
            let opts = options("t", "s");
            let result = cache
                .complete(&req, &opts, &token, || async { Ok(response("late")) })
                .await;
            assert!(result.is_err());
            assert!(cache.get(&req, &opts).await.is_none());
        });
    }
}
