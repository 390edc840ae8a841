//! 降级策略实现
//!
//! 存储后端故障时的准入策略。策略必须显式配置，默认 [`FallbackStrategy::FailOpen`]。

use crate::clock::add_duration;
use crate::decision::Outcome;
use crate::error::StorageError;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::error;

/// 降级策略
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FallbackStrategy {
    /// 故障时放行（降级为全开放）
    #[default]
    FailOpen,
    /// 故障时拒绝（降级为全关闭）
    FailClosed,
}

/// 降级结果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FallbackDecision {
    pub outcome: Outcome,
    /// 仅在拒绝时存在
    pub next_valid_request_date: Option<DateTime<Utc>>,
}

impl FallbackStrategy {
    /// 根据策略把存储错误转换为准入结果
    ///
    /// # 参数
    /// - `err`: 存储错误（仅用于日志）
    /// - `now`: 当前时间
    /// - `time_limit`: 本地窗口长度，拒绝时提示 `now + time_limit` 后重试
    pub fn resolve(
        &self,
        err: &StorageError,
        now: DateTime<Utc>,
        time_limit: Duration,
    ) -> FallbackDecision {
        error!("Counter store failure, applying {:?}: {}", self, err);
        match self {
            FallbackStrategy::FailOpen => FallbackDecision {
                outcome: Outcome::Allowed,
                next_valid_request_date: None,
            },
            FallbackStrategy::FailClosed => FallbackDecision {
                outcome: Outcome::Blocked,
                next_valid_request_date: Some(add_duration(now, time_limit)),
            },
        }
    }
}
