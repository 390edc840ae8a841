//! 时钟抽象
//!
//! 所有过期时间都通过 [`Clock`] 计算，生产环境使用 [`SystemClock`]，
//! 测试中使用 [`MockClock`] 显式推进虚拟时间。

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::fmt::Debug;
use std::sync::Arc;
use std::time::Duration;

/// 时钟接口
pub trait Clock: Send + Sync + Debug {
    /// 当前时间
    fn now(&self) -> DateTime<Utc>;
}

/// 系统时钟
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl SystemClock {
    pub fn new() -> Self {
        Self
    }
}

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// 可控时钟（测试用）
///
/// 所有克隆共享同一个时间值，在一个克隆上推进时间会影响全部克隆。
///
/// # 示例
/// ```rust
/// use antiflood::clock::{Clock, MockClock};
/// use std::time::Duration;
///
/// let clock = MockClock::at_epoch();
/// let start = clock.now();
/// clock.advance(Duration::from_millis(1500));
/// assert_eq!((clock.now() - start).num_milliseconds(), 1500);
/// ```
#[derive(Debug, Clone)]
pub struct MockClock {
    current_time: Arc<Mutex<DateTime<Utc>>>,
}

impl MockClock {
    /// 从指定时间开始
    pub fn new(start: DateTime<Utc>) -> Self {
        Self {
            current_time: Arc::new(Mutex::new(start)),
        }
    }

    /// 从 Unix 纪元开始，便于断言绝对时间
    pub fn at_epoch() -> Self {
        Self::new(DateTime::<Utc>::UNIX_EPOCH)
    }

    /// 推进时间
    pub fn advance(&self, duration: Duration) {
        let mut time = self.current_time.lock();
        *time += chrono::Duration::from_std(duration).unwrap_or(chrono::Duration::MAX);
    }

    /// 设置为指定时间
    pub fn set(&self, instant: DateTime<Utc>) {
        *self.current_time.lock() = instant;
    }
}

impl Default for MockClock {
    fn default() -> Self {
        Self::new(Utc::now())
    }
}

impl Clock for MockClock {
    fn now(&self) -> DateTime<Utc> {
        *self.current_time.lock()
    }
}

/// `now + duration`，溢出时饱和到最大时间
pub(crate) fn add_duration(now: DateTime<Utc>, duration: Duration) -> DateTime<Utc> {
    chrono::Duration::from_std(duration)
        .ok()
        .and_then(|d| now.checked_add_signed(d))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}
