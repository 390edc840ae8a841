//! 存储抽象层
//!
//! 定义计数器存储与全局聚合存储接口，以及基于 DashMap 的内存实现。
//!
//! # 过期语义
//!
//! - `expires_at <= now` 的记录在逻辑上不存在，读操作一律返回 `None`
//! - 写操作整体替换旧记录，不在原记录上累加
//! - 过期记录在下一次读取时惰性删除，也可以通过后台清理任务回收

use crate::clock::{add_duration, Clock, SystemClock};
use crate::constants::DEFAULT_CLEANUP_INTERVAL_SECS;
use crate::error::StorageError;
use ahash::AHashSet as HashSet;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, info, trace};

/// 计数器记录
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CounterRecord {
    /// 当前窗口内的尝试次数
    pub count: u64,
    /// 绝对过期时间
    pub expires_at: DateTime<Utc>,
}

impl CounterRecord {
    pub fn new(count: u64, expires_at: DateTime<Utc>) -> Self {
        Self { count, expires_at }
    }

    /// 是否已过期
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at <= now
    }
}

/// 全局聚合记录
///
/// 成员集合只用于计数，同一个本地键重复加入不改变计数。
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GlobalAggregateRecord {
    /// 已被封禁的本地键
    pub members: HashSet<String>,
    /// 聚合窗口过期时间
    pub expires_at: DateTime<Utc>,
}

impl GlobalAggregateRecord {
    fn empty(now: DateTime<Utc>) -> Self {
        Self {
            members: HashSet::new(),
            expires_at: now,
        }
    }

    /// 是否已过期
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at <= now
    }
}

/// 全局登记参数
///
/// 窗口由存储在登记的同一个原子步骤里按登记后的成员数选择：
/// 成员数达到 `blocks_limit` 时使用 `time_blocked`，否则使用 `time_limit`。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RegistrationPolicy {
    pub blocks_limit: u64,
    pub time_limit: Duration,
    pub time_blocked: Duration,
    /// 已存在的成员再次登记时是否重新计时
    pub reset_time_on_retry: bool,
}

impl RegistrationPolicy {
    /// 与成员数无关的固定窗口
    pub fn fixed(window: Duration, reset_time_on_retry: bool) -> Self {
        Self {
            blocks_limit: u64::MAX,
            time_limit: window,
            time_blocked: window,
            reset_time_on_retry,
        }
    }

    /// 成员数为 `members` 时的窗口
    pub fn window(&self, members: u64) -> Duration {
        if members >= self.blocks_limit {
            self.time_blocked
        } else {
            self.time_limit
        }
    }
}

/// 计数器存储接口
///
/// 单进程内 [`Governor`](crate::governor::Governor) 按键串行化 读取-决策-写入；
/// 多个进程共享存储时由 [`compare_and_set`](CounterStore::compare_and_set) 保证同一个键不会被重复计数。
#[async_trait]
pub trait CounterStore: Send + Sync {
    /// 获取未过期的记录
    async fn get(&self, key: &str) -> Result<Option<CounterRecord>, StorageError>;

    /// 用新记录替换旧记录，`expires_at = now + window`
    async fn set(
        &self,
        key: &str,
        count: u64,
        window: Duration,
    ) -> Result<CounterRecord, StorageError>;

    /// 只有当前记录仍等于 `expected` 时才写入
    ///
    /// `expected` 为 `None` 表示期望记录不存在（或已过期）。
    ///
    /// # 返回
    /// - `Some(record)`: 写入成功
    /// - `None`: 记录已被其他评估修改，调用方应重新读取
    ///
    /// 默认实现先读后写，只在单进程内（由键锁串行化）成立；共享存储的后端应覆盖为原子操作。
    async fn compare_and_set(
        &self,
        key: &str,
        expected: Option<&CounterRecord>,
        count: u64,
        window: Duration,
    ) -> Result<Option<CounterRecord>, StorageError> {
        let current = self.get(key).await?;
        if current.as_ref() != expected {
            return Ok(None);
        }
        self.set(key, count, window).await.map(Some)
    }

    /// 删除记录（重置计数）
    async fn delete(&self, key: &str) -> Result<(), StorageError>;
}

/// 全局聚合存储接口
#[async_trait]
pub trait GlobalStore: Send + Sync {
    /// 将本地键登记为聚合键的成员
    ///
    /// 新成员把过期时间延长到 `now + policy.window(登记后的成员数)`（取较晚者）；
    /// 已存在的成员只在 `reset_time_on_retry` 时重新计时，窗口按当前成员数选择。
    ///
    /// # 返回
    /// - 登记后的成员数
    async fn add_to_global(
        &self,
        global_key: &str,
        local_key: &str,
        policy: RegistrationPolicy,
    ) -> Result<u64, StorageError>;

    /// 聚合键当前的成员数，窗口过期后为 0
    async fn count_elements_global(&self, global_key: &str) -> Result<u64, StorageError>;
}

/// 同时实现两种存储接口的后端
pub trait AdmissionStore: CounterStore + GlobalStore {}

impl<T: CounterStore + GlobalStore> AdmissionStore for T {}

/// 内存存储实现
///
/// 单进程内的参考实现。所有时间通过注入的 [`Clock`] 计算。
pub struct MemoryStorage {
    counters: Arc<DashMap<String, CounterRecord>>,
    aggregates: Arc<DashMap<String, GlobalAggregateRecord>>,
    clock: Arc<dyn Clock>,
    /// 后台清理任务句柄
    cleanup_handle: parking_lot::Mutex<Option<JoinHandle<()>>>,
}

impl std::fmt::Debug for MemoryStorage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryStorage")
            .field("counters", &self.counters.len())
            .field("aggregates", &self.aggregates.len())
            .field("clock", &self.clock)
            .finish()
    }
}

impl MemoryStorage {
    /// 创建使用系统时钟的内存存储
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock::new()))
    }

    /// 创建使用指定时钟的内存存储
    ///
    /// # 示例
    /// ```rust
    /// use antiflood::clock::MockClock;
    /// use antiflood::storage::MemoryStorage;
    /// use std::sync::Arc;
    ///
    /// let clock = MockClock::at_epoch();
    /// let storage = MemoryStorage::with_clock(Arc::new(clock.clone()));
    /// ```
    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            counters: Arc::new(DashMap::new()),
            aggregates: Arc::new(DashMap::new()),
            clock,
            cleanup_handle: parking_lot::Mutex::new(None),
        }
    }

    /// 存储使用的时钟
    pub fn clock(&self) -> Arc<dyn Clock> {
        self.clock.clone()
    }

    /// 当前占用存储的计数器数量（包含尚未回收的过期记录）
    pub fn counter_entries(&self) -> usize {
        self.counters.len()
    }

    /// 当前占用存储的聚合记录数量（包含尚未回收的过期记录）
    pub fn aggregate_entries(&self) -> usize {
        self.aggregates.len()
    }

    /// 立即回收所有过期记录
    ///
    /// 判断与删除在同一个分片锁内完成，已被新记录替换的键不会被误删。
    ///
    /// # 返回
    /// - 回收的记录数
    pub fn purge_expired(&self) -> u64 {
        purge(&self.counters, &self.aggregates, self.clock.now())
    }

    /// 启动后台清理任务
    ///
    /// 重复调用会先停止已有任务。
    pub fn start_cleanup_task(&self, interval: Duration) {
        let counters = self.counters.clone();
        let aggregates = self.aggregates.clone();
        let clock = self.clock.clone();

        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;
                let removed = purge(&counters, &aggregates, clock.now());
                if removed > 0 {
                    debug!("Expiry sweep removed {} records", removed);
                }
            }
        });

        if let Some(previous) = self.cleanup_handle.lock().replace(handle) {
            previous.abort();
        }
        info!("Expiry sweep started (interval: {:?})", interval);
    }

    /// 以默认间隔启动后台清理任务
    pub fn start_default_cleanup_task(&self) {
        self.start_cleanup_task(Duration::from_secs(DEFAULT_CLEANUP_INTERVAL_SECS));
    }

    /// 停止后台清理任务
    pub fn stop_cleanup_task(&self) {
        if let Some(handle) = self.cleanup_handle.lock().take() {
            handle.abort();
            info!("Expiry sweep stopped");
        }
    }

    /// 后台清理任务是否在运行
    pub fn is_cleanup_running(&self) -> bool {
        self.cleanup_handle
            .lock()
            .as_ref()
            .map(|h| !h.is_finished())
            .unwrap_or(false)
    }
}

fn purge(
    counters: &DashMap<String, CounterRecord>,
    aggregates: &DashMap<String, GlobalAggregateRecord>,
    now: DateTime<Utc>,
) -> u64 {
    let mut removed = 0;
    counters.retain(|_, record| {
        let keep = !record.is_expired(now);
        if !keep {
            removed += 1;
        }
        keep
    });
    aggregates.retain(|_, record| {
        let keep = !record.is_expired(now);
        if !keep {
            removed += 1;
        }
        keep
    });
    removed
}

impl Default for MemoryStorage {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for MemoryStorage {
    fn drop(&mut self) {
        if let Some(handle) = self.cleanup_handle.get_mut().take() {
            handle.abort();
        }
    }
}

#[async_trait]
impl CounterStore for MemoryStorage {
    async fn get(&self, key: &str) -> Result<Option<CounterRecord>, StorageError> {
        let now = self.clock.now();
        // 先释放读引用再删除，避免同一分片上的死锁
        let record = self.counters.get(key).map(|entry| entry.clone());

        match record {
            Some(record) if !record.is_expired(now) => Ok(Some(record)),
            Some(_) => {
                self.counters.remove_if(key, |_, r| r.is_expired(now));
                trace!("Lazily removed expired counter {}", key);
                Ok(None)
            }
            None => Ok(None),
        }
    }

    async fn set(
        &self,
        key: &str,
        count: u64,
        window: Duration,
    ) -> Result<CounterRecord, StorageError> {
        let record = CounterRecord::new(count, add_duration(self.clock.now(), window));
        self.counters.insert(key.to_string(), record.clone());
        Ok(record)
    }

    async fn compare_and_set(
        &self,
        key: &str,
        expected: Option<&CounterRecord>,
        count: u64,
        window: Duration,
    ) -> Result<Option<CounterRecord>, StorageError> {
        let now = self.clock.now();
        let entry = self.counters.entry(key.to_string());

        // 比较与写入在同一个分片锁内完成，过期记录按不存在处理
        let unchanged = match &entry {
            Entry::Occupied(occupied) if !occupied.get().is_expired(now) => {
                Some(occupied.get()) == expected
            }
            _ => expected.is_none(),
        };
        if !unchanged {
            return Ok(None);
        }

        let record = CounterRecord::new(count, add_duration(now, window));
        entry.insert(record.clone());
        Ok(Some(record))
    }

    async fn delete(&self, key: &str) -> Result<(), StorageError> {
        self.counters.remove(key);
        Ok(())
    }
}

#[async_trait]
impl GlobalStore for MemoryStorage {
    async fn add_to_global(
        &self,
        global_key: &str,
        local_key: &str,
        policy: RegistrationPolicy,
    ) -> Result<u64, StorageError> {
        let now = self.clock.now();

        let mut entry = self
            .aggregates
            .entry(global_key.to_string())
            .or_insert_with(|| GlobalAggregateRecord::empty(now));

        // 过期的聚合整体清空，不允许部分成员残留
        if entry.is_expired(now) {
            *entry = GlobalAggregateRecord::empty(now);
        }

        // 窗口在分片锁内按登记后的成员数选择，并发登记不会读到过时的成员数
        let added = entry.members.insert(local_key.to_string());
        let members = entry.members.len() as u64;
        let expires_at = add_duration(now, policy.window(members));

        if added {
            entry.expires_at = entry.expires_at.max(expires_at);
        } else if policy.reset_time_on_retry {
            entry.expires_at = expires_at;
        }

        Ok(members)
    }

    async fn count_elements_global(&self, global_key: &str) -> Result<u64, StorageError> {
        let now = self.clock.now();
        let snapshot = self
            .aggregates
            .get(global_key)
            .map(|entry| (entry.members.len() as u64, entry.is_expired(now)));

        match snapshot {
            Some((count, false)) => Ok(count),
            Some((_, true)) => {
                self.aggregates.remove_if(global_key, |_, r| r.is_expired(now));
                Ok(0)
            }
            None => Ok(0),
        }
    }
}
