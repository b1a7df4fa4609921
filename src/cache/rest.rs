//! REST 数据源
//!
//! 读请求通过 [`FetchCache`] 走读穿透缓存；写请求成功后立即失效调用方指定的 key。

use serde::Serialize;
use serde_json::Value;

use super::fetch::{cache_key, FetchCache};
use crate::config::CacheConfig;
use crate::error::{Error, Result};

/// REST JSON 数据源
#[derive(Clone)]
pub struct RestSource {
    base_url: String,
    /// 上下文（租户 / 用户）查询参数名
    context_param: String,
    client: reqwest::Client,
    cache: FetchCache<Value>,
}

impl RestSource {
    /// 创建数据源
    pub fn new(base_url: &str, config: CacheConfig) -> Result<Self> {
        let client = reqwest::Client::builder().gzip(true).build()?;
        Ok(Self::with_client(base_url, client, FetchCache::new(config)))
    }

    /// 使用已有的 HTTP client 与缓存
    pub fn with_client(base_url: &str, client: reqwest::Client, cache: FetchCache<Value>) -> Self {
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            context_param: "context".to_string(),
            client,
            cache,
        }
    }

    /// 设置上下文查询参数名（默认 `context`）
    pub fn with_context_param(mut self, name: &str) -> Self {
        self.context_param = name.to_string();
        self
    }

    pub fn cache(&self) -> &FetchCache<Value> {
        &self.cache
    }

    /// 资源 URL，上下文作为经过编码的查询参数
    pub fn resource_url(&self, resource: &str, context: &str) -> Result<reqwest::Url> {
        let raw = format!("{}/{}", self.base_url, resource.trim_start_matches('/'));
        let mut url = reqwest::Url::parse(&raw)
            .map_err(|e| Error::Config(format!("无效的资源 URL {}: {}", raw, e)))?;
        url.query_pairs_mut().append_pair(&self.context_param, context);
        Ok(url)
    }

    /// 读取资源（缓存 key 为 `resource:context`）
    pub async fn get_json(&self, resource: &str, context: &str) -> Result<Value> {
        let key = cache_key(resource, context);
        let url = self.resource_url(resource, context)?;
        let client = self.client.clone();

        self.cache
            .get(key, move || async move {
                tracing::debug!("🌐 GET {}", url);
                let response = client.get(url).send().await?.error_for_status()?;
                Ok(response.json::<Value>().await?)
            })
            .await
    }

    /// 写入并失效受影响的缓存 key
    ///
    /// 仅在请求成功后失效；失败时缓存保持不变。
    pub async fn post_json<B>(&self, path: &str, body: &B, invalidates: &[String]) -> Result<Value>
    where
        B: Serialize + ?Sized,
    {
        let url = format!("{}/{}", self.base_url, path.trim_start_matches('/'));
        tracing::debug!("🌐 POST {}", url);

        let response = self
            .client
            .post(&url)
            .json(body)
            .send()
            .await?
            .error_for_status()?;

        let bytes = response.bytes().await?;
        let value = if bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&bytes)?
        };

        for key in invalidates {
            self.cache.invalidate(key);
        }

        Ok(value)
    }

    /// 失效单个资源
    pub fn invalidate(&self, resource: &str, context: &str) {
        self.cache.invalidate(&cache_key(resource, context));
    }
}
