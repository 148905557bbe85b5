//! 单调时钟模块
//!
//! 为日志记录生成严格递增的主键时间戳。多个采集器可以共享同一个时钟实例，
//! 所有调用者观察到的值构成全序，且任意两次调用不会返回相同的值。

use crate::mlcommon::models::Timestamp;
use chrono::Utc;
use std::sync::Mutex;

/// 严格单调递增的 UTC 时钟
#[derive(Debug)]
pub struct MonotonicClock {
    last: Mutex<i64>,
}

impl Default for MonotonicClock {
    fn default() -> Self {
        Self::new()
    }
}

impl MonotonicClock {
    pub fn new() -> Self {
        Self { last: Mutex::new(i64::MIN) }
    }

    /// 以已有的最大时间戳为起点，重启后接着已持久化的数据继续递增
    pub fn starting_after(last: Timestamp) -> Self {
        Self { last: Mutex::new(last.0) }
    }

    /// 返回当前 UTC 时间；若不大于上一次返回值，则返回 `上一次 + 1µs`
    pub fn now(&self) -> Timestamp {
        let wall = Utc::now().timestamp_micros();
        // 临界区只做一次比较和赋值；锁中毒时沿用内部值，时钟本身没有可破坏的不变量
        let mut last = match self.last.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        let value = if wall > *last { wall } else { *last + 1 };
        *last = value;
        Timestamp(value)
    }

    /// 最近一次返回的时间戳
    pub fn last(&self) -> Option<Timestamp> {
        let last = match self.last.lock() {
            Ok(guard) => *guard,
            Err(poisoned) => *poisoned.into_inner(),
        };
        (last != i64::MIN).then_some(Timestamp(last))
    }
}
