//! セキュリティ情報・セッション一覧・なりすまし記録のキャッシュ
//!
//! Redis（ConnectionManager）とプロセス内メモリの2実装を `CacheStore` で抽象化する。
//! 読み取りはキャッシュ優先、ミス時に DB から読み込んで TTL 付きで保存する。
//! キャッシュ障害はログ出力のみで握りつぶし、DB を正とする。

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use redis::{AsyncCommands, Client, aio::ConnectionManager};
use serde::{Serialize, de::DeserializeOwned};
use tokio::sync::Mutex;
use uuid::Uuid;

#[derive(Debug, thiserror::Error)]
pub enum CacheError {
    #[error("Redis エラー: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("キャッシュ値のシリアライズエラー: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// キャッシュキー
pub mod keys {
    use super::Uuid;

    pub fn user_security(user_id: Uuid) -> String {
        format!("user:security:{user_id}")
    }

    pub fn user_sessions(user_id: Uuid) -> String {
        format!("user:sessions:{user_id}")
    }

    pub fn impersonation(impersonation_id: &str) -> String {
        format!("impersonation:{impersonation_id}")
    }
}

/// キャッシュバックエンド
#[async_trait]
pub trait CacheStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<String>, CacheError>;

    async fn set_ex(&self, key: &str, value: String, ttl_secs: u64) -> Result<(), CacheError>;

    /// # Returns
    /// 削除されたキー数
    async fn delete(&self, keys: &[String]) -> Result<u64, CacheError>;

    /// 残り TTL（秒）。キーが存在しなければ None
    async fn ttl(&self, key: &str) -> Result<Option<u64>, CacheError>;
}

/// Redis バックエンド
pub struct RedisCache {
    connection_manager: ConnectionManager,
}

impl RedisCache {
    pub async fn connect(url: &str) -> Result<Self, CacheError> {
        let client = Client::open(url)?;
        let connection_manager = ConnectionManager::new(client).await?;
        tracing::info!("Redis 接続完了");
        Ok(Self { connection_manager })
    }
}

#[async_trait]
impl CacheStore for RedisCache {
    async fn get(&self, key: &str) -> Result<Option<String>, CacheError> {
        let mut conn = self.connection_manager.clone();
        let value: Option<String> = conn.get(key).await?;
        Ok(value)
    }

    async fn set_ex(&self, key: &str, value: String, ttl_secs: u64) -> Result<(), CacheError> {
        let mut conn = self.connection_manager.clone();
        conn.set_ex::<_, _, ()>(key, value, ttl_secs).await?;
        Ok(())
    }

    async fn delete(&self, keys: &[String]) -> Result<u64, CacheError> {
        if keys.is_empty() {
            return Ok(0);
        }
        let mut conn = self.connection_manager.clone();
        let deleted: u64 = conn.del(keys.to_vec()).await?;
        Ok(deleted)
    }

    async fn ttl(&self, key: &str) -> Result<Option<u64>, CacheError> {
        let mut conn = self.connection_manager.clone();
        let ttl: i64 = conn.ttl(key).await?;
        // -2: キーなし, -1: 期限なし
        Ok(match ttl {
            -2 => None,
            -1 => Some(u64::MAX),
            secs => Some(secs.max(0) as u64),
        })
    }
}

/// プロセス内メモリバックエンド（Redis 未設定時・テスト用）
#[derive(Default)]
pub struct MemoryCache {
    entries: Mutex<HashMap<String, (String, Instant)>>,
}

impl MemoryCache {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl CacheStore for MemoryCache {
    async fn get(&self, key: &str) -> Result<Option<String>, CacheError> {
        let mut entries = self.entries.lock().await;
        let now = Instant::now();
        let expired = match entries.get(key) {
            Some((value, expires_at)) if *expires_at > now => return Ok(Some(value.clone())),
            Some(_) => true,
            None => false,
        };
        if expired {
            entries.remove(key);
        }
        Ok(None)
    }

    async fn set_ex(&self, key: &str, value: String, ttl_secs: u64) -> Result<(), CacheError> {
        let expires_at = Instant::now() + Duration::from_secs(ttl_secs);
        let mut entries = self.entries.lock().await;
        // 期限切れエントリを掃除
        let now = Instant::now();
        entries.retain(|_, (_, at)| *at > now);
        entries.insert(key.to_string(), (value, expires_at));
        Ok(())
    }

    async fn delete(&self, keys: &[String]) -> Result<u64, CacheError> {
        let mut entries = self.entries.lock().await;
        Ok(keys.iter().filter(|key| entries.remove(*key).is_some()).count() as u64)
    }

    async fn ttl(&self, key: &str) -> Result<Option<u64>, CacheError> {
        let entries = self.entries.lock().await;
        let now = Instant::now();
        Ok(entries
            .get(key)
            .filter(|(_, expires_at)| *expires_at > now)
            .map(|(_, expires_at)| {
                let remaining = *expires_at - now;
                remaining.as_millis().div_ceil(1000) as u64
            }))
    }
}

/// 型付きキャッシュアクセス
#[derive(Clone)]
pub struct Cache {
    store: Arc<dyn CacheStore>,
}

impl Cache {
    pub fn new(store: Arc<dyn CacheStore>) -> Self {
        Self { store }
    }

    pub fn memory() -> Self {
        Self::new(Arc::new(MemoryCache::new()))
    }

    pub fn redis(store: RedisCache) -> Self {
        Self::new(Arc::new(store))
    }

    pub async fn get_json<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>, CacheError> {
        match self.store.get(key).await? {
            Some(raw) => Ok(Some(serde_json::from_str(&raw)?)),
            None => Ok(None),
        }
    }

    pub async fn set_json<T: Serialize>(
        &self,
        key: &str,
        value: &T,
        ttl_secs: u64,
    ) -> Result<(), CacheError> {
        let raw = serde_json::to_string(value)?;
        self.store.set_ex(key, raw, ttl_secs).await
    }

    pub async fn delete(&self, keys: &[String]) -> Result<u64, CacheError> {
        self.store.delete(keys).await
    }

    pub async fn ttl(&self, key: &str) -> Result<Option<u64>, CacheError> {
        self.store.ttl(key).await
    }

    /// キャッシュ優先で読み取り、ミス時は loader の結果を TTL 付きで保存
    ///
    /// キャッシュの読み書き失敗は warn ログのみで、loader の結果を返す
    pub async fn get_or_load<T, E, F, Fut>(&self, key: &str, ttl_secs: u64, loader: F) -> Result<T, E>
    where
        T: Serialize + DeserializeOwned,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        match self.get_json::<T>(key).await {
            Ok(Some(value)) => {
                tracing::debug!(key = %key, "キャッシュヒット");
                return Ok(value);
            }
            Ok(None) => tracing::debug!(key = %key, "キャッシュミス"),
            Err(e) => tracing::warn!(key = %key, error = %e, "キャッシュ読み取り失敗"),
        }

        let value = loader().await?;

        if let Err(e) = self.set_json(key, &value, ttl_secs).await {
            tracing::warn!(key = %key, error = %e, "キャッシュ書き込み失敗");
        }

        Ok(value)
    }

    /// キーを削除（失敗は warn ログのみ）
    pub async fn invalidate(&self, keys: &[String]) {
        if let Err(e) = self.delete(keys).await {
            tracing::warn!(keys = ?keys, error = %e, "キャッシュ無効化失敗");
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;

    #[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
    struct Dto {
        count: i32,
    }

    #[tokio::test]
    async fn test_memory_set_get_delete() {
        let cache = Cache::memory();
        cache.set_json("k", &Dto { count: 1 }, 60).await.unwrap();
        assert_eq!(
            cache.get_json::<Dto>("k").await.unwrap(),
            Some(Dto { count: 1 })
        );

        let deleted = cache
            .delete(&["k".to_string(), "missing".to_string()])
            .await
            .unwrap();
        assert_eq!(deleted, 1);
        assert_eq!(cache.get_json::<Dto>("k").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_memory_zero_ttl_expires_immediately() {
        let cache = Cache::memory();
        cache.set_json("k", &Dto { count: 1 }, 0).await.unwrap();
        assert_eq!(cache.get_json::<Dto>("k").await.unwrap(), None);
        assert_eq!(cache.ttl("k").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_get_or_load_populates_once() {
        let cache = Cache::memory();
        let loads = AtomicUsize::new(0);

        for _ in 0..3 {
            let value: Result<Dto, CacheError> = cache
                .get_or_load("user:security:1", 60, || async {
                    loads.fetch_add(1, Ordering::SeqCst);
                    Ok(Dto { count: 7 })
                })
                .await;
            assert_eq!(value.unwrap(), Dto { count: 7 });
        }

        assert_eq!(loads.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_invalidate_forces_reload_with_same_ttl() {
        let cache = Cache::memory();
        let loads = AtomicUsize::new(0);
        let key = keys::user_sessions(Uuid::new_v4());

        let load = |count: i32| {
            loads.fetch_add(1, Ordering::SeqCst);
            async move { Ok::<_, CacheError>(Dto { count }) }
        };

        cache.get_or_load(&key, 30, || load(1)).await.unwrap();
        let first_ttl = cache.ttl(&key).await.unwrap().unwrap();
        assert!((29..=30).contains(&first_ttl));

        cache.invalidate(std::slice::from_ref(&key)).await;
        assert_eq!(cache.ttl(&key).await.unwrap(), None);

        let reloaded = cache.get_or_load(&key, 30, || load(2)).await.unwrap();
        assert_eq!(reloaded, Dto { count: 2 });
        assert_eq!(loads.load(Ordering::SeqCst), 2);

        let second_ttl = cache.ttl(&key).await.unwrap().unwrap();
        assert!((29..=30).contains(&second_ttl));
    }

    #[tokio::test]
    async fn test_loader_error_not_cached() {
        let cache = Cache::memory();
        let result: Result<Dto, &str> = cache.get_or_load("k", 60, || async { Err("db") }).await;
        assert_eq!(result, Err("db"));
        assert_eq!(cache.get_json::<Dto>("k").await.unwrap(), None);
    }

    #[test]
    fn test_key_format() {
        let id = Uuid::nil();
        assert_eq!(
            keys::user_security(id),
            "user:security:00000000-0000-0000-0000-000000000000"
        );
        assert_eq!(keys::impersonation("imp_x"), "impersonation:imp_x");
    }
}
