//! Redis存储实现
//!
//! 多副本共享的计数器与全局聚合存储。
//!
//! # 特性
//!
//! - **连接管理**: 使用 `ConnectionManager`，断线后自动重连
//! - **重试机制**: 指数退避重试
//! - **Lua脚本**: 每个操作在服务器端原子执行
//!
//! # 数据布局
//!
//! - 计数器: `{key_prefix}c:{key}` 哈希 `{count, expires_at}`
//! - 全局聚合: `{key_prefix}g:{key}` 成员集合 + `{key_prefix}g:{key}:exp` 过期时间

use crate::clock::{add_duration, Clock, SystemClock};
use crate::error::StorageError;
use crate::lua_scripts::LuaScripts;
use crate::storage::{CounterRecord, CounterStore, GlobalStore, RegistrationPolicy};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use redis::{aio::ConnectionManager, Client, IntoConnectionInfo};
use secrecy::{ExposeSecret, Secret};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// 最大键总长度
const MAX_KEY_LENGTH: usize = 1024;

/// Redis配置
#[derive(Clone)]
pub struct RedisConfig {
    /// Redis连接URL
    pub url: String,
    /// 数据库索引
    pub db: i64,
    /// 密码（使用 Secret 包装以防止意外泄露）
    pub password: Option<Secret<String>>,
    /// 所有键的命名空间
    pub key_prefix: String,
    /// 最大重试次数
    pub max_retries: u32,
    /// 重试初始退避时间
    pub retry_initial_backoff: Duration,
}

impl std::fmt::Debug for RedisConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisConfig")
            .field("url", &self.url)
            .field("db", &self.db)
            .field("password", &self.password.as_ref().map(|_| "***"))
            .field("key_prefix", &self.key_prefix)
            .field("max_retries", &self.max_retries)
            .field("retry_initial_backoff", &self.retry_initial_backoff)
            .finish()
    }
}

impl Default for RedisConfig {
    fn default() -> Self {
        Self {
            url: "redis://127.0.0.1:6379".to_string(),
            db: 0,
            password: None,
            key_prefix: "antiflood:".to_string(),
            max_retries: 3,
            retry_initial_backoff: Duration::from_millis(100),
        }
    }
}

impl RedisConfig {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            ..Default::default()
        }
    }

    /// 设置数据库索引
    pub fn db(mut self, db: i64) -> Self {
        self.db = db;
        self
    }

    /// 设置密码
    pub fn password(mut self, password: impl Into<String>) -> Self {
        self.password = Some(Secret::new(password.into()));
        self
    }

    /// 设置键命名空间
    pub fn key_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.key_prefix = prefix.into();
        self
    }

    /// 设置最大重试次数
    pub fn max_retries(mut self, retries: u32) -> Self {
        self.max_retries = retries;
        self
    }

    /// 设置重试初始退避时间
    pub fn retry_initial_backoff(mut self, backoff: Duration) -> Self {
        self.retry_initial_backoff = backoff;
        self
    }

    fn counter_key(&self, key: &str) -> String {
        format!("{}c:{}", self.key_prefix, key)
    }

    fn aggregate_keys(&self, key: &str) -> (String, String) {
        let members = format!("{}g:{}", self.key_prefix, key);
        let exp = format!("{}:exp", members);
        (members, exp)
    }
}

fn validate_key(key: &str) -> Result<(), StorageError> {
    if key.is_empty() {
        return Err(StorageError::QueryError("键不能为空".to_string()));
    }
    if key.len() > MAX_KEY_LENGTH {
        return Err(StorageError::QueryError(format!(
            "键长度超过限制（最大 {} 字符）",
            MAX_KEY_LENGTH
        )));
    }
    if key.contains('\0') {
        return Err(StorageError::QueryError("键包含非法字符".to_string()));
    }
    Ok(())
}

fn millis(duration: Duration) -> i64 {
    i64::try_from(duration.as_millis()).unwrap_or(i64::MAX)
}

/// Redis存储
#[derive(Clone)]
pub struct RedisStorage {
    conn: ConnectionManager,
    config: RedisConfig,
    scripts: Arc<LuaScripts>,
    clock: Arc<dyn Clock>,
}

impl std::fmt::Debug for RedisStorage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisStorage")
            .field("config", &self.config)
            .field("clock", &self.clock)
            .finish()
    }
}

impl RedisStorage {
    /// 连接 Redis
    pub async fn new(config: RedisConfig) -> Result<Self, StorageError> {
        Self::with_clock(config, Arc::new(SystemClock::new())).await
    }

    /// 连接 Redis，使用指定时钟计算过期时间
    pub async fn with_clock(
        config: RedisConfig,
        clock: Arc<dyn Clock>,
    ) -> Result<Self, StorageError> {
        info!("Connecting to Redis at {}", config.url);

        let mut info = config.url.as_str().into_connection_info().map_err(|e| {
            error!("Invalid Redis URL: {}", e);
            StorageError::ConnectionError(format!("无效的Redis URL: {}", e))
        })?;
        info.redis.db = config.db;
        if let Some(password) = &config.password {
            info.redis.password = Some(password.expose_secret().clone());
        }

        let client = Client::open(info).map_err(|e| {
            error!("Failed to create Redis client: {}", e);
            StorageError::ConnectionError(format!("创建Redis客户端失败: {}", e))
        })?;

        let conn = ConnectionManager::new(client).await.map_err(|e| {
            error!("Failed to create Redis connection manager: {}", e);
            StorageError::ConnectionError(format!("创建Redis连接管理器失败: {}", e))
        })?;

        info!("Redis connection established");
        Ok(Self {
            conn,
            config,
            scripts: Arc::new(LuaScripts::new()),
            clock,
        })
    }

    /// 检查Redis连接
    pub async fn ping(&self) -> Result<(), StorageError> {
        self.execute_with_retry(|| async {
            let mut conn = self.conn.clone();
            let _: String = redis::cmd("PING").query_async(&mut conn).await?;
            Ok::<_, StorageError>(())
        })
        .await
    }

    /// 带重试的执行
    async fn execute_with_retry<F, Fut, T>(&self, f: F) -> Result<T, StorageError>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = Result<T, StorageError>>,
    {
        let mut backoff = self.config.retry_initial_backoff;
        let mut attempt = 0;

        loop {
            match f().await {
                Ok(result) => {
                    if attempt > 0 {
                        debug!("Redis operation succeeded after {} retries", attempt);
                    }
                    return Ok(result);
                }
                // 脚本、数据错误和写入冲突重试无意义
                Err(e @ StorageError::QueryError(_))
                | Err(e @ StorageError::SerializationError(_))
                | Err(e @ StorageError::ConflictError(_)) => {
                    return Err(e);
                }
                Err(e) if attempt < self.config.max_retries => {
                    attempt += 1;
                    warn!(
                        "Redis operation failed, retrying in {:?} ({}/{}): {}",
                        backoff, attempt, self.config.max_retries, e
                    );
                    tokio::time::sleep(backoff).await;
                    backoff = backoff.saturating_mul(2);
                }
                Err(e) => {
                    error!("Redis operation failed after {} retries: {}", attempt, e);
                    return Err(e);
                }
            }
        }
    }
}

#[async_trait]
impl CounterStore for RedisStorage {
    async fn get(&self, key: &str) -> Result<Option<CounterRecord>, StorageError> {
        validate_key(key)?;
        let redis_key = self.config.counter_key(key);
        let now = self.clock.now().timestamp_millis();

        let values: Vec<i64> = self
            .execute_with_retry(|| async {
                let mut conn = self.conn.clone();
                Ok::<_, StorageError>(
                    self.scripts
                        .counter_get
                        .key(&redis_key)
                        .arg(now)
                        .invoke_async::<_, Vec<i64>>(&mut conn)
                        .await?,
                )
            })
            .await?;

        match values.as_slice() {
            [] => Ok(None),
            [count, expires_at] => {
                let count = u64::try_from(*count).map_err(|_| {
                    StorageError::SerializationError(format!("无效的计数: {}", count))
                })?;
                let expires_at = DateTime::<Utc>::from_timestamp_millis(*expires_at)
                    .ok_or_else(|| {
                        StorageError::SerializationError(format!(
                            "无效的过期时间: {}",
                            expires_at
                        ))
                    })?;
                Ok(Some(CounterRecord::new(count, expires_at)))
            }
            other => Err(StorageError::SerializationError(format!(
                "计数器脚本返回了 {} 个值",
                other.len()
            ))),
        }
    }

    async fn set(
        &self,
        key: &str,
        count: u64,
        window: Duration,
    ) -> Result<CounterRecord, StorageError> {
        validate_key(key)?;
        let redis_key = self.config.counter_key(key);
        let expires_at = add_duration(self.clock.now(), window);
        let ttl = millis(window).max(1);

        self.execute_with_retry(|| async {
            let mut conn = self.conn.clone();
            let _: i64 = self
                .scripts
                .counter_set
                .key(&redis_key)
                .arg(count)
                .arg(expires_at.timestamp_millis())
                .arg(ttl)
                .invoke_async(&mut conn)
                .await?;
            Ok::<_, StorageError>(())
        })
        .await?;

        Ok(CounterRecord::new(count, expires_at))
    }

    async fn compare_and_set(
        &self,
        key: &str,
        expected: Option<&CounterRecord>,
        count: u64,
        window: Duration,
    ) -> Result<Option<CounterRecord>, StorageError> {
        validate_key(key)?;
        let redis_key = self.config.counter_key(key);
        let now = self.clock.now();
        let expires_at = add_duration(now, window);
        let ttl = millis(window).max(1);
        let (expected_count, expected_expires_at) = match expected {
            Some(record) => (
                i64::try_from(record.count).map_err(|_| {
                    StorageError::SerializationError(format!("无效的计数: {}", record.count))
                })?,
                record.expires_at.timestamp_millis(),
            ),
            None => (-1, 0),
        };

        let written: i64 = self
            .execute_with_retry(|| async {
                let mut conn = self.conn.clone();
                Ok::<_, StorageError>(
                    self.scripts
                        .counter_cas
                        .key(&redis_key)
                        .arg(expected_count)
                        .arg(expected_expires_at)
                        .arg(count)
                        .arg(expires_at.timestamp_millis())
                        .arg(ttl)
                        .arg(now.timestamp_millis())
                        .invoke_async::<_, i64>(&mut conn)
                        .await?,
                )
            })
            .await?;

        if written == 1 {
            Ok(Some(CounterRecord::new(count, expires_at)))
        } else {
            debug!("Conditional write on {} lost to a concurrent writer", key);
            Ok(None)
        }
    }

    async fn delete(&self, key: &str) -> Result<(), StorageError> {
        validate_key(key)?;
        let redis_key = self.config.counter_key(key);

        self.execute_with_retry(|| async {
            let mut conn = self.conn.clone();
            let _: i64 = redis::cmd("DEL")
                .arg(&redis_key)
                .query_async(&mut conn)
                .await?;
            Ok::<_, StorageError>(())
        })
        .await
    }
}

#[async_trait]
impl GlobalStore for RedisStorage {
    async fn add_to_global(
        &self,
        global_key: &str,
        local_key: &str,
        policy: RegistrationPolicy,
    ) -> Result<u64, StorageError> {
        validate_key(global_key)?;
        validate_key(local_key)?;
        let (members_key, exp_key) = self.config.aggregate_keys(global_key);
        let now = self.clock.now();
        let limit_expires_at = add_duration(now, policy.time_limit);
        let blocked_expires_at = add_duration(now, policy.time_blocked);

        self.execute_with_retry(|| async {
            let mut conn = self.conn.clone();
            Ok::<_, StorageError>(
                self.scripts
                    .global_add
                    .key(&members_key)
                    .key(&exp_key)
                    .arg(local_key)
                    .arg(now.timestamp_millis())
                    .arg(limit_expires_at.timestamp_millis())
                    .arg(blocked_expires_at.timestamp_millis())
                    .arg(policy.blocks_limit)
                    .arg(u8::from(policy.reset_time_on_retry))
                    .invoke_async::<_, u64>(&mut conn)
                    .await?,
            )
        })
        .await
    }

    async fn count_elements_global(&self, global_key: &str) -> Result<u64, StorageError> {
        validate_key(global_key)?;
        let (members_key, exp_key) = self.config.aggregate_keys(global_key);
        let now = self.clock.now().timestamp_millis();

        self.execute_with_retry(|| async {
            let mut conn = self.conn.clone();
            Ok::<_, StorageError>(
                self.scripts
                    .global_count
                    .key(&members_key)
                    .key(&exp_key)
                    .arg(now)
                    .invoke_async::<_, u64>(&mut conn)
                    .await?,
            )
        })
        .await
    }
}
