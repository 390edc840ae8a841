//! 通知中心
//!
//! 把每次评估的结果分发给已注册的观察者。观察者只能旁观，不能修改结果。
//!
//! - 订阅在 [`Governor`](crate::governor::Governor) 构建时完成，之后订阅表不可变
//! - 同一结果种类的观察者按注册顺序同步调用
//! - 观察者返回错误或 panic 时只记录日志，继续调用下一个观察者

use crate::decision::{DecisionSource, Outcome};
use crate::error::ObserverError;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use tracing::warn;
use uuid::Uuid;

/// 可订阅的结果种类
pub type OutcomeKind = Outcome;

/// 一次评估产生的事件
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AdmissionEvent {
    /// 事件ID
    pub id: Uuid,
    /// 结果种类
    pub kind: OutcomeKind,
    /// 决策来源
    pub source: DecisionSource,
    /// 存储键（身份摘要，不含原始身份）
    pub key: String,
    /// 写入后的计数；未读到计数器时为 `None`
    pub count: Option<u64>,
    /// 拒绝时的重试时间
    pub next_valid_request_date: Option<DateTime<Utc>>,
    /// 事件时间
    pub occurred_at: DateTime<Utc>,
}

impl AdmissionEvent {
    pub fn new(
        kind: OutcomeKind,
        source: DecisionSource,
        key: impl Into<String>,
        occurred_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            kind,
            source,
            key: key.into(),
            count: None,
            next_valid_request_date: None,
            occurred_at,
        }
    }

    pub fn with_count(mut self, count: Option<u64>) -> Self {
        self.count = count;
        self
    }

    pub fn with_next_valid_request_date(mut self, date: Option<DateTime<Utc>>) -> Self {
        self.next_valid_request_date = date;
        self
    }
}

/// 观察者
pub type Observer = Arc<dyn Fn(&AdmissionEvent) -> Result<(), ObserverError> + Send + Sync>;

/// 扩展
///
/// 构建时调用一次 `register`，通过 [`Subscriber`] 订阅结果。
/// 任何 `Fn(&mut Subscriber)` 闭包都是扩展。
pub trait Extension: Send + Sync {
    fn register(&self, subscriber: &mut Subscriber);
}

impl<F> Extension for F
where
    F: Fn(&mut Subscriber) + Send + Sync,
{
    fn register(&self, subscriber: &mut Subscriber) {
        self(subscriber)
    }
}

/// 订阅句柄
#[derive(Default)]
pub struct Subscriber {
    subscriptions: Vec<(OutcomeKind, Observer)>,
}

impl Subscriber {
    /// 订阅一种结果
    pub fn subscribe<F>(&mut self, kind: OutcomeKind, observer: F) -> &mut Self
    where
        F: Fn(&AdmissionEvent) -> Result<(), ObserverError> + Send + Sync + 'static,
    {
        self.subscriptions.push((kind, Arc::new(observer)));
        self
    }

    /// 订阅全部三种结果，三个订阅共享同一个观察者
    pub fn subscribe_all<F>(&mut self, observer: F) -> &mut Self
    where
        F: Fn(&AdmissionEvent) -> Result<(), ObserverError> + Send + Sync + 'static,
    {
        let observer: Observer = Arc::new(observer);
        for kind in OutcomeKind::ALL {
            self.subscriptions.push((kind, observer.clone()));
        }
        self
    }
}

/// 通知中心
#[derive(Default)]
pub struct NotificationHub {
    subscriptions: Vec<(OutcomeKind, Observer)>,
}

impl std::fmt::Debug for NotificationHub {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let kinds: Vec<&OutcomeKind> = self.subscriptions.iter().map(|(k, _)| k).collect();
        f.debug_struct("NotificationHub")
            .field("subscriptions", &kinds)
            .finish()
    }
}

impl NotificationHub {
    pub fn new() -> Self {
        Self::default()
    }

    /// 调用扩展的注册函数
    pub fn register(&mut self, extension: &dyn Extension) {
        let mut subscriber = Subscriber::default();
        extension.register(&mut subscriber);
        self.subscriptions.append(&mut subscriber.subscriptions);
    }

    /// 订阅数量
    pub fn len(&self) -> usize {
        self.subscriptions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.subscriptions.is_empty()
    }

    /// 分发事件
    ///
    /// # 返回
    /// - 成功处理事件的观察者数量
    pub fn emit(&self, event: &AdmissionEvent) -> usize {
        let mut delivered = 0;
        for (index, (kind, observer)) in self.subscriptions.iter().enumerate() {
            if *kind != event.kind {
                continue;
            }

            match catch_unwind(AssertUnwindSafe(|| observer(event))) {
                Ok(Ok(())) => delivered += 1,
                Ok(Err(e)) => {
                    warn!(
                        "Observer #{} failed on {} event {}: {}",
                        index, event.kind, event.id, e
                    );
                }
                Err(_) => {
                    warn!(
                        "Observer #{} panicked on {} event {}",
                        index, event.kind, event.id
                    );
                }
            }
        }
        delivered
    }
}
