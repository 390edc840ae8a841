//! 拒绝响应
//!
//! [`Response`] 是与宿主框架无关的响应载体，拒绝处理器只能通过它向调用方发出信号。
//! 默认处理器 [`TooManyRequests`] 写入 429 和
//! `{"error": {"text": "Too many requests.", "nextValidRequestDate": ...}}`。

use crate::constants::{TOO_MANY_REQUESTS_STATUS, TOO_MANY_REQUESTS_TEXT};
use crate::extractors::RequestContext;
use ahash::AHashMap as HashMap;
use chrono::{DateTime, Utc};
use serde_json::{json, Value};

/// 响应载体
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Response {
    status: Option<u16>,
    headers: HashMap<String, String>,
    body: Option<Value>,
}

impl Response {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_status(&mut self, status: u16) -> &mut Self {
        self.status = Some(status);
        self
    }

    /// 设置响应头（键为小写）
    pub fn set_header(&mut self, key: &str, value: &str) -> &mut Self {
        self.headers.insert(key.to_lowercase(), value.to_string());
        self
    }

    /// 写入 JSON 响应体
    pub fn send(&mut self, body: Value) -> &mut Self {
        self.headers
            .insert("content-type".to_string(), "application/json".to_string());
        self.body = Some(body);
        self
    }

    pub fn status(&self) -> Option<u16> {
        self.status
    }

    pub fn header(&self, key: &str) -> Option<&str> {
        self.headers.get(&key.to_lowercase()).map(String::as_str)
    }

    pub fn body(&self) -> Option<&Value> {
        self.body.as_ref()
    }

    /// 是否已被写入
    pub fn is_written(&self) -> bool {
        self.status.is_some() || self.body.is_some()
    }
}

/// 拒绝处理器
///
/// 只在结果为 `Blocked` 时调用。处理器拿不到后续处理的续体，因此无法放行被拒绝的请求。
pub trait RejectionHandler: Send + Sync {
    /// 写入拒绝响应
    ///
    /// 参数里没有续体：被拒绝的请求不会继续执行，处理器只能决定响应内容。
    ///
    /// # 参数
    /// - `context`: 原始请求（未修改）
    /// - `response`: 响应载体
    /// - `next_valid_request_date`: 最早可以重试的时间
    fn reject(
        &self,
        context: &RequestContext,
        response: &mut Response,
        next_valid_request_date: DateTime<Utc>,
    );
}

impl<F> RejectionHandler for F
where
    F: Fn(&RequestContext, &mut Response, DateTime<Utc>) + Send + Sync,
{
    fn reject(
        &self,
        context: &RequestContext,
        response: &mut Response,
        next_valid_request_date: DateTime<Utc>,
    ) {
        self(context, response, next_valid_request_date)
    }
}

/// 默认拒绝处理器
#[derive(Debug, Clone, Copy, Default)]
pub struct TooManyRequests;

impl TooManyRequests {
    /// 默认响应体
    pub fn payload(next_valid_request_date: DateTime<Utc>) -> Value {
        json!({
            "error": {
                "text": TOO_MANY_REQUESTS_TEXT,
                "nextValidRequestDate": next_valid_request_date,
            }
        })
    }
}

impl RejectionHandler for TooManyRequests {
    fn reject(
        &self,
        _context: &RequestContext,
        response: &mut Response,
        next_valid_request_date: DateTime<Utc>,
    ) {
        response
            .set_status(TOO_MANY_REQUESTS_STATUS)
            .send(Self::payload(next_valid_request_date));
    }
}
