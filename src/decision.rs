//! 准入决策
//!
//! 纯函数：给定上一条计数记录和阈值，计算本次结果以及需要写回存储的新记录。
//! 函数本身没有副作用，写入由 [`Governor`](crate::governor::Governor) 在持有键锁时执行。

use crate::storage::CounterRecord;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// 准入结果
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Outcome {
    /// 放行
    Allowed,
    /// 本次请求恰好达到上限，仍然放行，之后进入封禁窗口
    LimitJustReached,
    /// 拒绝
    Blocked,
}

impl Outcome {
    /// 全部结果种类
    pub const ALL: [Outcome; 3] = [
        Outcome::Allowed,
        Outcome::LimitJustReached,
        Outcome::Blocked,
    ];

    /// 是否继续执行后续处理
    pub fn is_admitted(&self) -> bool {
        !matches!(self, Outcome::Blocked)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Outcome::Allowed => "allowed",
            Outcome::LimitJustReached => "limit_just_reached",
            Outcome::Blocked => "blocked",
        }
    }
}

impl std::fmt::Display for Outcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 决策来源
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DecisionSource {
    /// 本地计数器
    Local,
    /// 全局聚合
    Global,
    /// 存储故障后的降级策略
    Fallback,
}

/// 本地决策阈值
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Thresholds {
    pub tries: u64,
    pub time_limit: Duration,
    pub time_blocked: Duration,
}

/// 待写入的计数记录
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PendingWrite {
    pub count: u64,
    pub window: Duration,
}

/// 一次评估的决策
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Decision {
    pub outcome: Outcome,
    /// `Blocked` 时为 `None`，存储不变
    pub write: Option<PendingWrite>,
    /// 仅 `Blocked` 时存在：上一条记录的过期时间
    pub next_valid_request_date: Option<DateTime<Utc>>,
}

/// 计算决策
///
/// - 无记录：`Allowed`，写入 `count = 1`，窗口 `time_limit`
/// - `count >= tries`：`Blocked`，不写入
/// - `count + 1 == tries`：`LimitJustReached`，写入 `count = tries`，窗口 `time_blocked`
/// - 其他：`Allowed`，写入 `count + 1`，窗口 `time_limit`
///
/// # 示例
/// ```rust
/// use antiflood::decision::{decide, Outcome, Thresholds};
/// use std::time::Duration;
///
/// let thresholds = Thresholds {
///     tries: 1,
///     time_limit: Duration::from_secs(60),
///     time_blocked: Duration::from_secs(300),
/// };
/// assert_eq!(decide(None, &thresholds).outcome, Outcome::LimitJustReached);
/// ```
pub fn decide(previous: Option<&CounterRecord>, thresholds: &Thresholds) -> Decision {
    let next_count = previous.map_or(1, |record| record.count.saturating_add(1));

    if let Some(record) = previous {
        if record.count >= thresholds.tries {
            return Decision {
                outcome: Outcome::Blocked,
                write: None,
                next_valid_request_date: Some(record.expires_at),
            };
        }
    }

    let (outcome, window) = if next_count == thresholds.tries {
        (Outcome::LimitJustReached, thresholds.time_blocked)
    } else {
        (Outcome::Allowed, thresholds.time_limit)
    };

    Decision {
        outcome,
        write: Some(PendingWrite {
            count: next_count,
            window,
        }),
        next_valid_request_date: None,
    }
}
