//! 读穿透缓存 + 请求合并
//!
//! - 命中未过期条目：直接返回，不调用 producer
//! - 同一 key 已有请求在途：复用同一个结果（请求合并）
//! - 否则调用 producer，成功后以完成时刻为时间戳写入缓存
//!
//! 过期条目在下一次查找时惰性清除，也可以调用 [`FetchCache::purge_expired`] 主动清理。
//!
//! ## 失效
//!
//! 缓存无法感知绕过它的写入。写操作成功后，调用方必须立即对受影响的 key
//! 调用 [`FetchCache::invalidate`]；这是手动失效约定，不是自动一致性。

use std::collections::HashMap;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures_util::future::{BoxFuture, Shared};
use futures_util::FutureExt;
use parking_lot::Mutex;
use thiserror::Error;
use tokio::time::Instant;

use crate::config::CacheConfig;
use crate::error::{Error, Result};

/// 组合 REST 资源的缓存 key：`resource:context`
pub fn cache_key(resource: &str, context: &str) -> String {
    format!("{}:{}", resource, context)
}

/// 缓存条目
struct CacheEntry<V> {
    value: V,
    stored_at: Instant,
    ttl: Duration,
}

impl<V> CacheEntry<V> {
    fn is_fresh(&self, now: Instant) -> bool {
        now.saturating_duration_since(self.stored_at) <= self.ttl
    }
}

/// 在途请求的失败原因（可克隆，分发给所有合并的调用方）
#[derive(Debug, Clone, Error)]
enum FetchFailure {
    #[error("{0:#}")]
    Producer(Arc<anyhow::Error>),
    #[error("超时 ({0:?})")]
    Timeout(Duration),
    #[error("producer panicked")]
    Panicked,
    #[error("任务被中止: {0}")]
    Aborted(String),
}

impl FetchFailure {
    fn into_error(self, key: &str) -> Error {
        let key = key.to_string();
        match self {
            FetchFailure::Producer(cause) => Error::Fetch { key, cause },
            FetchFailure::Timeout(after) => Error::Timeout { key, after },
            other => Error::Fetch {
                key,
                cause: Arc::new(anyhow::anyhow!(other.to_string())),
            },
        }
    }
}

type FetchOutcome<V> = std::result::Result<V, FetchFailure>;
type SharedFetch<V> = Shared<BoxFuture<'static, FetchOutcome<V>>>;

/// 缓存表与在途表放在同一把锁下，查找与结算都是原子的
struct Tables<V> {
    entries: HashMap<String, CacheEntry<V>>,
    in_flight: HashMap<String, SharedFetch<V>>,
}

/// 命中统计
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    /// 合并到在途请求上的调用次数
    pub collapsed: u64,
}

#[derive(Default)]
struct Counters {
    hits: AtomicU64,
    misses: AtomicU64,
    collapsed: AtomicU64,
}

struct Inner<V> {
    config: CacheConfig,
    tables: Mutex<Tables<V>>,
    counters: Counters,
}

impl<V: Clone> Inner<V> {
    /// producer 结束：清除在途标记，成功则写入缓存
    fn settle(&self, key: &str, ttl: Duration, outcome: &FetchOutcome<V>) {
        let mut tables = self.tables.lock();
        tables.in_flight.remove(key);

        match outcome {
            Ok(value) => {
                tables.entries.insert(
                    key.to_string(),
                    CacheEntry {
                        value: value.clone(),
                        stored_at: Instant::now(),
                        ttl,
                    },
                );
                tracing::debug!("💾 缓存写入: key={}", key);
            }
            Err(failure) => {
                tracing::warn!("获取失败，不缓存: key={}, {}", key, failure);
            }
        }
    }
}

/// 读穿透缓存
///
/// 克隆得到的是同一个缓存的句柄。
pub struct FetchCache<V> {
    inner: Arc<Inner<V>>,
}

impl<V> Clone for FetchCache<V> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<V> Default for FetchCache<V>
where
    V: Clone + Send + Sync + 'static,
{
    fn default() -> Self {
        Self::new(CacheConfig::default())
    }
}

impl<V> FetchCache<V>
where
    V: Clone + Send + Sync + 'static,
{
    /// 创建缓存
    pub fn new(config: CacheConfig) -> Self {
        Self {
            inner: Arc::new(Inner {
                config,
                tables: Mutex::new(Tables {
                    entries: HashMap::new(),
                    in_flight: HashMap::new(),
                }),
                counters: Counters::default(),
            }),
        }
    }

    /// 创建指定 TTL 的缓存
    pub fn with_ttl(ttl: Duration) -> Self {
        Self::new(CacheConfig::default().with_ttl(ttl))
    }

    pub fn ttl(&self) -> Duration {
        self.inner.config.ttl
    }

    /// 读取 key，未命中时调用 producer
    ///
    /// producer 失败时不写缓存，错误分发给所有合并到该请求的调用方。
    /// producer 在独立任务中运行，调用方被取消不会中断它。
    pub async fn get<F, Fut>(&self, key: impl Into<String>, producer: F) -> Result<V>
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = anyhow::Result<V>> + Send + 'static,
    {
        let ttl = self.inner.config.ttl;
        self.get_with_ttl(key, ttl, producer).await
    }

    /// 同 [`get`](Self::get)，但本次写入的条目使用指定 TTL
    pub async fn get_with_ttl<F, Fut>(&self, key: impl Into<String>, ttl: Duration, producer: F) -> Result<V>
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = anyhow::Result<V>> + Send + 'static,
    {
        let key = key.into();

        let fetch = {
            let mut tables = self.inner.tables.lock();

            if let Some(entry) = tables.entries.get(&key) {
                if entry.is_fresh(Instant::now()) {
                    self.inner.counters.hits.fetch_add(1, Ordering::Relaxed);
                    tracing::trace!("缓存命中: key={}", key);
                    return Ok(entry.value.clone());
                }
            }

            // 走到这里的条目一定已过期
            if tables.entries.remove(&key).is_some() {
                tracing::trace!("缓存过期: key={}", key);
            }

            match tables.in_flight.get(&key).cloned() {
                Some(shared) => {
                    self.inner.counters.collapsed.fetch_add(1, Ordering::Relaxed);
                    tracing::debug!("🔗 合并到在途请求: key={}", key);
                    shared
                }
                None => {
                    self.inner.counters.misses.fetch_add(1, Ordering::Relaxed);
                    tracing::debug!("📡 发起获取: key={}", key);
                    // 持锁期间登记在途标记，结算必然发生在登记之后
                    let shared = self.spawn_fetch(key.clone(), ttl, producer);
                    tables.in_flight.insert(key.clone(), shared.clone());
                    shared
                }
            }
        };

        fetch.await.map_err(|failure| failure.into_error(&key))
    }

    fn spawn_fetch<F, Fut>(&self, key: String, ttl: Duration, producer: F) -> SharedFetch<V>
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = anyhow::Result<V>> + Send + 'static,
    {
        let inner = Arc::clone(&self.inner);
        let timeout = self.inner.config.fetch_timeout;

        let task = tokio::spawn(async move {
            let run = async move {
                match timeout {
                    Some(limit) => match tokio::time::timeout(limit, producer()).await {
                        Ok(result) => result.map_err(|e| FetchFailure::Producer(Arc::new(e))),
                        Err(_) => Err(FetchFailure::Timeout(limit)),
                    },
                    None => producer()
                        .await
                        .map_err(|e| FetchFailure::Producer(Arc::new(e))),
                }
            };

            let outcome = match AssertUnwindSafe(run).catch_unwind().await {
                Ok(outcome) => outcome,
                Err(_) => Err(FetchFailure::Panicked),
            };

            inner.settle(&key, ttl, &outcome);
            outcome
        });

        async move {
            match task.await {
                Ok(outcome) => outcome,
                Err(e) => Err(FetchFailure::Aborted(e.to_string())),
            }
        }
        .boxed()
        .shared()
    }

    /// 删除 key 的缓存条目，不影响在途请求
    pub fn invalidate(&self, key: &str) {
        if self.inner.tables.lock().entries.remove(key).is_some() {
            tracing::debug!("🗑️ 缓存失效: key={}", key);
        }
    }

    /// 删除所有缓存条目
    pub fn clear(&self) {
        let mut tables = self.inner.tables.lock();
        let count = tables.entries.len();
        tables.entries.clear();
        tracing::debug!("🧹 缓存清空: {} 条", count);
    }

    /// 主动清除所有过期条目，返回清除数量
    pub fn purge_expired(&self) -> usize {
        let now = Instant::now();
        let mut tables = self.inner.tables.lock();
        let before = tables.entries.len();
        tables.entries.retain(|_, entry| entry.is_fresh(now));
        before - tables.entries.len()
    }

    /// 当前条目数（包括尚未惰性清除的过期条目）
    pub fn len(&self) -> usize {
        self.inner.tables.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// 在途请求数
    pub fn in_flight_count(&self) -> usize {
        self.inner.tables.lock().in_flight.len()
    }

    /// key 是否有未过期条目
    pub fn contains(&self, key: &str) -> bool {
        self.inner
            .tables
            .lock()
            .entries
            .get(key)
            .is_some_and(|entry| entry.is_fresh(Instant::now()))
    }

    pub fn stats(&self) -> CacheStats {
        let counters = &self.inner.counters;
        CacheStats {
            hits: counters.hits.load(Ordering::Relaxed),
            misses: counters.misses.load(Ordering::Relaxed),
            collapsed: counters.collapsed.load(Ordering::Relaxed),
        }
    }
}
