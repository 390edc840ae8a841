//! Governor 主控制器
//!
//! 单次请求的准入编排：
//!
//! 1. 提取身份并派生存储键
//! 2. 获取该键的锁，串行化进程内的 读取-决策-写入
//! 3. 读取全局聚合的成员数
//! 4. 本地层：读取计数器、决策、条件写回（冲突时重新读取）；刚达到上限时登记到全局聚合
//! 5. 全局层：成员数达到 `blocks_limit` 时以全局拒绝覆盖本地结果，本地计数照常进行
//! 6. 在持有键锁时分发事件
//! 7. 放行时调用续体，拒绝时调用拒绝处理器

use crate::clock::{add_duration, Clock, SystemClock};
use crate::config::AntifloodConfig;
use crate::constants::{MAX_WRITE_ATTEMPTS, UNKNOWN_IDENTITY};
use crate::decision::{decide, Decision, DecisionSource, Outcome, Thresholds};
use crate::error::{AntifloodError, StorageError};
use crate::extractors::{IpKeyExtractor, IpScopeExtractor, KeyExtractor, RequestContext};
use crate::key::store_key;
use crate::notify::{AdmissionEvent, Extension, NotificationHub};
use crate::response::{RejectionHandler, Response, TooManyRequests};
use crate::storage::{AdmissionStore, CounterRecord, CounterStore, GlobalStore, MemoryStorage};
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use std::future::Future;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, error, info, instrument, warn};

/// 一次评估的结果
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Admission {
    pub outcome: Outcome,
    pub source: DecisionSource,
    /// 本地存储键
    pub key: String,
    /// 评估后的计数
    pub count: Option<u64>,
    /// 拒绝时最早可以重试的时间
    pub next_valid_request_date: Option<DateTime<Utc>>,
}

impl Admission {
    pub fn is_admitted(&self) -> bool {
        self.outcome.is_admitted()
    }

    fn to_event(&self, now: DateTime<Utc>) -> AdmissionEvent {
        AdmissionEvent::new(self.outcome, self.source, self.key.clone(), now)
            .with_count(self.count)
            .with_next_valid_request_date(self.next_valid_request_date)
    }
}

/// [`Governor::handle`] 的返回值
#[derive(Debug)]
pub struct Handled<T> {
    pub admission: Admission,
    /// 续体的返回值，拒绝时为 `None`
    pub output: Option<T>,
}

/// Governor 主控制器
pub struct Governor {
    config: AntifloodConfig,
    thresholds: Thresholds,
    counter_store: Arc<dyn CounterStore>,
    global_store: Option<Arc<dyn GlobalStore>>,
    clock: Arc<dyn Clock>,
    key_extractor: Arc<dyn KeyExtractor>,
    scope_extractor: Arc<dyn KeyExtractor>,
    rejection_handler: Arc<dyn RejectionHandler>,
    global_rejection_handler: Arc<dyn RejectionHandler>,
    hub: NotificationHub,
    /// 按存储键的锁表，空闲的锁在使用后移除
    locks: DashMap<String, Arc<Mutex<()>>>,
}

impl std::fmt::Debug for Governor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Governor")
            .field("config", &self.config)
            .field("key_extractor", &self.key_extractor.name())
            .field("scope_extractor", &self.scope_extractor.name())
            .field("hub", &self.hub)
            .field("locks", &self.locks.len())
            .finish()
    }
}

impl Governor {
    /// 使用默认组件创建（内存存储、系统时钟、客户端 IP 作为身份）
    pub fn new(config: AntifloodConfig) -> Result<Self, AntifloodError> {
        GovernorBuilder::new(config).build()
    }

    pub fn builder() -> GovernorBuilder {
        GovernorBuilder::default()
    }

    pub fn config(&self) -> &AntifloodConfig {
        &self.config
    }

    /// 正在使用的键锁数量
    pub fn active_locks(&self) -> usize {
        self.locks.len()
    }

    /// 处理一次请求
    ///
    /// 放行时调用 `next` 并返回其结果；拒绝时调用拒绝处理器，`next` 不会被调用。
    ///
    /// # 示例
    /// ```rust
    /// use antiflood::prelude::*;
    ///
    /// # tokio_test::block_on(async {
    /// let governor = Governor::new(AntifloodConfig::default()).unwrap();
    /// let ctx = RequestContext::new().with_client_ip("127.0.0.1");
    /// let mut response = Response::new();
    ///
    /// let handled = governor.handle(&ctx, &mut response, || async { "ok" }).await;
    /// assert_eq!(handled.output, Some("ok"));
    /// # });
    /// ```
    pub async fn handle<F, Fut, T>(
        &self,
        context: &RequestContext,
        response: &mut Response,
        next: F,
    ) -> Handled<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = T>,
    {
        let admission = self.evaluate(context).await;

        if admission.is_admitted() {
            let output = next().await;
            return Handled {
                admission,
                output: Some(output),
            };
        }

        let retry_at = admission
            .next_valid_request_date
            .unwrap_or_else(|| self.clock.now());
        let handler = match admission.source {
            DecisionSource::Global => &self.global_rejection_handler,
            DecisionSource::Local | DecisionSource::Fallback => &self.rejection_handler,
        };
        handler.reject(context, response, retry_at);

        Handled {
            admission,
            output: None,
        }
    }

    /// 评估一次请求
    ///
    /// 存储故障按配置的降级策略处理，总是返回结果，并且只分发一个事件。
    #[instrument(skip_all, fields(key))]
    pub async fn evaluate(&self, context: &RequestContext) -> Admission {
        let key = self.derive_key(context).await;
        tracing::Span::current().record("key", key.as_str());

        let lock = self.lock_for(&key);
        let admission = {
            let _guard = lock.lock().await;
            let admission = match self.evaluate_locked(context, &key).await {
                Ok(admission) => admission,
                Err(e) => {
                    let fallback =
                        self.config
                            .fallback
                            .resolve(&e, self.clock.now(), self.thresholds.time_limit);
                    Admission {
                        outcome: fallback.outcome,
                        source: DecisionSource::Fallback,
                        key: key.clone(),
                        count: None,
                        next_valid_request_date: fallback.next_valid_request_date,
                    }
                }
            };
            self.emit(&admission);
            admission
        };
        drop(lock);
        self.release_lock(&key);

        admission
    }

    /// 评估一次请求，存储故障直接返回给调用方
    ///
    /// 出错时不分发事件。
    #[instrument(skip_all, fields(key))]
    pub async fn try_evaluate(&self, context: &RequestContext) -> Result<Admission, StorageError> {
        let key = self.derive_key(context).await;
        tracing::Span::current().record("key", key.as_str());

        let lock = self.lock_for(&key);
        let result = {
            let _guard = lock.lock().await;
            let result = self.evaluate_locked(context, &key).await;
            if let Ok(admission) = &result {
                self.emit(admission);
            }
            result
        };
        drop(lock);
        self.release_lock(&key);

        result
    }

    /// 清除调用方的计数
    pub async fn reset(&self, context: &RequestContext) -> Result<(), StorageError> {
        let key = self.derive_key(context).await;
        let lock = self.lock_for(&key);
        let result = {
            let _guard = lock.lock().await;
            self.counter_store.delete(&key).await
        };
        drop(lock);
        self.release_lock(&key);

        if result.is_ok() {
            info!("Counter reset for key {}", key);
        }
        result
    }

    /// 派生本地存储键
    pub async fn derive_key(&self, context: &RequestContext) -> String {
        let identity = self.key_extractor.extract(context).await.unwrap_or_else(|| {
            warn!(
                "{} found no identity, using the shared {:?} bucket",
                self.key_extractor.name(),
                UNKNOWN_IDENTITY
            );
            UNKNOWN_IDENTITY.to_string()
        });
        store_key(&self.config.prefix, &identity)
    }

    async fn derive_global_key(&self, context: &RequestContext, prefix: &str) -> String {
        let scope = self
            .scope_extractor
            .extract(context)
            .await
            .unwrap_or_else(|| UNKNOWN_IDENTITY.to_string());
        store_key(prefix, &scope)
    }

    async fn evaluate_locked(
        &self,
        context: &RequestContext,
        key: &str,
    ) -> Result<Admission, StorageError> {
        let global = match (&self.config.global, &self.global_store) {
            (Some(config), Some(store)) => {
                let global_key = self.derive_global_key(context, &config.prefix).await;
                let members = store.count_elements_global(&global_key).await?;
                Some((config, store, global_key, members))
            }
            _ => None,
        };

        let (decision, current) = self.count_attempt(key).await?;
        let count = current.as_ref().map(|record| record.count);

        debug!(
            "Evaluated {}: outcome={}, count={:?}",
            key, decision.outcome, count
        );

        match decision.outcome {
            Outcome::LimitJustReached => {
                if let Some((config, store, global_key, _)) = &global {
                    // 本地写入已提交，登记失败不改变本次结果
                    match store
                        .add_to_global(global_key, key, config.registration_policy())
                        .await
                    {
                        Ok(total) => debug!(
                            "Registered {} in scope {} ({} members)",
                            key, global_key, total
                        ),
                        Err(e) => error!(
                            "Failed to register {} in scope {}: {}",
                            key, global_key, e
                        ),
                    }
                }
            }
            Outcome::Blocked => {
                warn!(
                    "Blocked {} until {:?}",
                    key, decision.next_valid_request_date
                );
            }
            Outcome::Allowed => {}
        }

        if let Some((config, _, global_key, members)) = &global {
            if *members >= config.blocks_limit {
                let retry_at = current
                    .as_ref()
                    .map(|record| record.expires_at)
                    .unwrap_or_else(|| add_duration(self.clock.now(), config.time_blocked()));
                warn!(
                    "Global block: scope {} has {} blocked members (limit {})",
                    global_key, members, config.blocks_limit
                );
                return Ok(Admission {
                    outcome: Outcome::Blocked,
                    source: DecisionSource::Global,
                    key: key.to_string(),
                    count,
                    next_valid_request_date: Some(retry_at),
                });
            }
        }

        Ok(Admission {
            outcome: decision.outcome,
            source: DecisionSource::Local,
            key: key.to_string(),
            count,
            next_valid_request_date: decision.next_valid_request_date,
        })
    }

    /// 本地计数的 读取-决策-写入
    ///
    /// 写入以读到的记录为前提，记录已被其他进程修改时重新读取并决策。
    ///
    /// # 返回
    /// - 本次决策，以及评估后存储中的记录（`Blocked` 时为未改动的上一条记录）
    async fn count_attempt(
        &self,
        key: &str,
    ) -> Result<(Decision, Option<CounterRecord>), StorageError> {
        for attempt in 1..=MAX_WRITE_ATTEMPTS {
            let previous = self.counter_store.get(key).await?;
            let decision = decide(previous.as_ref(), &self.thresholds);

            let write = match decision.write {
                Some(write) => write,
                None => return Ok((decision, previous)),
            };

            let committed = self
                .counter_store
                .compare_and_set(key, previous.as_ref(), write.count, write.window)
                .await?;
            match committed {
                Some(record) => return Ok((decision, Some(record))),
                None => debug!("Write conflict on {} (attempt {})", key, attempt),
            }
        }

        warn!(
            "Giving up on {} after {} conflicting writes",
            key, MAX_WRITE_ATTEMPTS
        );
        Err(StorageError::ConflictError(format!(
            "{} 次写入均冲突: {}",
            MAX_WRITE_ATTEMPTS, key
        )))
    }

    fn emit(&self, admission: &Admission) {
        if !self.hub.is_empty() {
            self.hub.emit(&admission.to_event(self.clock.now()));
        }
    }

    fn lock_for(&self, key: &str) -> Arc<Mutex<()>> {
        self.locks.entry(key.to_string()).or_default().clone()
    }

    /// 只有锁表本身持有引用时才移除
    fn release_lock(&self, key: &str) {
        self.locks
            .remove_if(key, |_, lock| Arc::strong_count(lock) == 1);
    }
}

/// Governor 构建器
///
/// 不可序列化的组件（存储、时钟、提取器、拒绝处理器、扩展）都通过构建器提供。
#[derive(Default)]
pub struct GovernorBuilder {
    config: AntifloodConfig,
    counter_store: Option<Arc<dyn CounterStore>>,
    global_store: Option<Arc<dyn GlobalStore>>,
    clock: Option<Arc<dyn Clock>>,
    key_extractor: Option<Arc<dyn KeyExtractor>>,
    scope_extractor: Option<Arc<dyn KeyExtractor>>,
    rejection_handler: Option<Arc<dyn RejectionHandler>>,
    global_rejection_handler: Option<Arc<dyn RejectionHandler>>,
    extensions: Vec<Box<dyn Extension>>,
}

impl GovernorBuilder {
    pub fn new(config: AntifloodConfig) -> Self {
        Self {
            config,
            ..Default::default()
        }
    }

    pub fn config(mut self, config: AntifloodConfig) -> Self {
        self.config = config;
        self
    }

    /// 同时作为计数器存储和全局聚合存储
    pub fn store<S>(mut self, store: Arc<S>) -> Self
    where
        S: AdmissionStore + 'static,
    {
        self.counter_store = Some(store.clone());
        self.global_store = Some(store);
        self
    }

    pub fn counter_store(mut self, store: Arc<dyn CounterStore>) -> Self {
        self.counter_store = Some(store);
        self
    }

    pub fn global_store(mut self, store: Arc<dyn GlobalStore>) -> Self {
        self.global_store = Some(store);
        self
    }

    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    /// 身份提取器，默认 [`IpKeyExtractor`]
    pub fn key_extractor(mut self, extractor: impl KeyExtractor + 'static) -> Self {
        self.key_extractor = Some(Arc::new(extractor));
        self
    }

    /// 全局作用域提取器，默认 [`IpScopeExtractor`]
    pub fn scope_extractor(mut self, extractor: impl KeyExtractor + 'static) -> Self {
        self.scope_extractor = Some(Arc::new(extractor));
        self
    }

    /// 本地拒绝处理器，默认 [`TooManyRequests`]
    pub fn rejection_handler(mut self, handler: impl RejectionHandler + 'static) -> Self {
        self.rejection_handler = Some(Arc::new(handler));
        self
    }

    /// 全局拒绝处理器，默认 [`TooManyRequests`]
    pub fn global_rejection_handler(mut self, handler: impl RejectionHandler + 'static) -> Self {
        self.global_rejection_handler = Some(Arc::new(handler));
        self
    }

    /// 注册扩展，按添加顺序调用
    pub fn extension(mut self, extension: impl Extension + 'static) -> Self {
        self.extensions.push(Box::new(extension));
        self
    }

    pub fn extensions<I>(mut self, extensions: I) -> Self
    where
        I: IntoIterator<Item = Box<dyn Extension>>,
    {
        self.extensions.extend(extensions);
        self
    }

    /// 校验配置并构建
    ///
    /// # 错误
    /// - 配置校验失败
    /// - 配置了全局层但只提供了计数器存储
    pub fn build(self) -> Result<Governor, AntifloodError> {
        self.config.validate().map_err(AntifloodError::ConfigError)?;

        let clock = self
            .clock
            .unwrap_or_else(|| Arc::new(SystemClock::new()));

        let (counter_store, global_store) = match (self.counter_store, self.global_store) {
            (Some(counter), global) => (counter, global),
            (None, global) => {
                let memory = Arc::new(MemoryStorage::with_clock(clock.clone()));
                let counter: Arc<dyn CounterStore> = memory.clone();
                let global = global.or_else(|| Some(memory as Arc<dyn GlobalStore>));
                (counter, global)
            }
        };

        if self.config.global.is_some() && global_store.is_none() {
            return Err(AntifloodError::ConfigError(
                "启用全局层时必须提供全局聚合存储".to_string(),
            ));
        }

        let mut hub = NotificationHub::new();
        for extension in &self.extensions {
            hub.register(extension.as_ref());
        }

        let thresholds = Thresholds {
            tries: self.config.tries,
            time_limit: self.config.time_limit(),
            time_blocked: self.config.time_blocked(),
        };

        info!(
            "Governor ready: tries={}, time_limit={:?}, time_blocked={:?}, global={}, observers={}",
            thresholds.tries,
            thresholds.time_limit,
            thresholds.time_blocked,
            self.config.global.is_some(),
            hub.len()
        );

        Ok(Governor {
            config: self.config,
            thresholds,
            counter_store,
            global_store,
            clock,
            key_extractor: self
                .key_extractor
                .unwrap_or_else(|| Arc::new(IpKeyExtractor::new())),
            scope_extractor: self
                .scope_extractor
                .unwrap_or_else(|| Arc::new(IpScopeExtractor::default())),
            rejection_handler: self
                .rejection_handler
                .unwrap_or_else(|| Arc::new(TooManyRequests)),
            global_rejection_handler: self
                .global_rejection_handler
                .unwrap_or_else(|| Arc::new(TooManyRequests)),
            hub,
            locks: DashMap::new(),
        })
    }
}
