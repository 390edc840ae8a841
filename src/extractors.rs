//! Copyright (c) 2026, Kirky.X
//!
//! MIT License
//!
//! 身份提取器
//!
//! 从请求上下文中提取调用方身份（本地计数键）以及全局聚合的作用域。
//!
//! # 提取器
//!
//! - [`IpKeyExtractor`]: 客户端 IP，可选从代理头读取
//! - [`HeaderKeyExtractor`]: 指定 HTTP 头的值
//! - [`FnKeyExtractor`]: 自定义函数
//! - [`CompositeKeyExtractor`]: 按顺序尝试多个提取器
//! - [`IpScopeExtractor`]: 客户端所在网段（IPv4 /24，IPv6 /64），用于全局聚合

use crate::constants::{DEFAULT_IPV4_SCOPE_BITS, DEFAULT_IPV6_SCOPE_BITS};
use ahash::AHashMap as HashMap;
use async_trait::async_trait;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

// ============================================================================
// 请求上下文
// ============================================================================

/// 请求上下文
///
/// 与宿主框架无关的请求表示，原样传递给拒绝处理器。
#[derive(Clone, Default)]
pub struct RequestContext {
    /// 客户端网络地址
    pub client_ip: Option<String>,
    /// HTTP头（键为小写）
    pub headers: HashMap<String, String>,
    /// 请求路径
    pub path: String,
    /// 请求方法
    pub method: String,
}

impl std::fmt::Debug for RequestContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // 脱敏 headers
        let headers: HashMap<&str, &str> = self
            .headers
            .iter()
            .map(|(k, v)| {
                let v = if k.contains("auth") || k.contains("cookie") || k.contains("key") {
                    "***"
                } else {
                    v.as_str()
                };
                (k.as_str(), v)
            })
            .collect();

        f.debug_struct("RequestContext")
            .field("client_ip", &self.client_ip)
            .field("headers", &headers)
            .field("path", &self.path)
            .field("method", &self.method)
            .finish()
    }
}

impl RequestContext {
    /// 创建新的请求上下文
    pub fn new() -> Self {
        Self::default()
    }

    /// 添加HTTP头
    pub fn with_header(mut self, key: &str, value: &str) -> Self {
        self.headers.insert(key.to_lowercase(), value.to_string());
        self
    }

    /// 设置客户端IP
    pub fn with_client_ip(mut self, ip: &str) -> Self {
        self.client_ip = Some(ip.to_string());
        self
    }

    /// 设置请求路径
    pub fn with_path(mut self, path: &str) -> Self {
        self.path = path.to_string();
        self
    }

    /// 设置请求方法
    pub fn with_method(mut self, method: &str) -> Self {
        self.method = method.to_string();
        self
    }

    /// 获取HTTP头（不区分大小写）
    pub fn get_header(&self, key: &str) -> Option<&String> {
        self.headers.get(&key.to_lowercase())
    }
}

// ============================================================================
// 提取器接口
// ============================================================================

/// 身份提取器 trait
///
/// 提取过程可以是异步的（例如查询会话存储），只影响延迟，不影响正确性。
#[async_trait]
pub trait KeyExtractor: Send + Sync {
    /// 从请求上下文中提取身份
    ///
    /// # 返回
    /// - `Some(identity)`: 成功提取
    /// - `None`: 无法提取，调用方使用 `"unknown"`
    async fn extract(&self, context: &RequestContext) -> Option<String>;

    /// 获取提取器名称
    fn name(&self) -> &str;
}

// ============================================================================
// IP提取器
// ============================================================================

/// IP提取器
///
/// 按优先级检查配置的代理头，最后回退到 `client_ip`。
#[derive(Debug, Clone, Default)]
pub struct IpKeyExtractor {
    /// HTTP头名称列表（按优先级顺序）
    header_names: Vec<String>,
}

impl IpKeyExtractor {
    /// 只使用 `client_ip`
    pub fn new() -> Self {
        Self::default()
    }

    /// 先检查代理头，再回退到 `client_ip`
    ///
    /// # 示例
    /// ```rust
    /// use antiflood::extractors::IpKeyExtractor;
    ///
    /// let extractor = IpKeyExtractor::from_headers(["X-Real-IP", "X-Forwarded-For"]);
    /// ```
    pub fn from_headers<I, S>(header_names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        Self {
            header_names: header_names
                .into_iter()
                .map(|s| s.as_ref().to_string())
                .collect(),
        }
    }

    /// 解析 IP 或 IP 列表
    ///
    /// X-Forwarded-For 格式为 `client, proxy1, proxy2`，取最左边的地址。
    fn parse_ip(value: &str) -> Option<IpAddr> {
        value
            .split(',')
            .map(str::trim)
            .find(|s| !s.is_empty())
            .and_then(|s| s.parse::<IpAddr>().ok())
    }

    /// 提取客户端地址
    pub fn client_addr(&self, context: &RequestContext) -> Option<IpAddr> {
        self.header_names
            .iter()
            .filter_map(|name| context.get_header(name))
            .find_map(|value| Self::parse_ip(value))
            .or_else(|| context.client_ip.as_deref().and_then(Self::parse_ip))
    }
}

#[async_trait]
impl KeyExtractor for IpKeyExtractor {
    async fn extract(&self, context: &RequestContext) -> Option<String> {
        self.client_addr(context).map(|ip| ip.to_string())
    }

    fn name(&self) -> &str {
        "IpKeyExtractor"
    }
}

// ============================================================================
// HTTP头提取器
// ============================================================================

/// HTTP头提取器
///
/// 例如按 `X-User-Id` 或 `X-API-Key` 计数。
#[derive(Debug, Clone)]
pub struct HeaderKeyExtractor {
    header_name: String,
}

impl HeaderKeyExtractor {
    pub fn new(header_name: &str) -> Self {
        Self {
            header_name: header_name.to_string(),
        }
    }
}

#[async_trait]
impl KeyExtractor for HeaderKeyExtractor {
    async fn extract(&self, context: &RequestContext) -> Option<String> {
        context
            .get_header(&self.header_name)
            .map(|v| v.trim())
            .filter(|v| !v.is_empty())
            .map(str::to_string)
    }

    fn name(&self) -> &str {
        &self.header_name
    }
}

// ============================================================================
// 自定义提取器
// ============================================================================

/// 自定义提取器
pub struct FnKeyExtractor<F>
where
    F: Fn(&RequestContext) -> Option<String> + Send + Sync,
{
    extractor_fn: F,
    name: String,
}

impl<F> FnKeyExtractor<F>
where
    F: Fn(&RequestContext) -> Option<String> + Send + Sync,
{
    /// # 示例
    /// ```rust
    /// use antiflood::extractors::FnKeyExtractor;
    ///
    /// let extractor = FnKeyExtractor::new("tenant", |ctx| {
    ///     ctx.get_header("X-Tenant").cloned()
    /// });
    /// ```
    pub fn new(name: &str, extractor_fn: F) -> Self {
        Self {
            extractor_fn,
            name: name.to_string(),
        }
    }
}

#[async_trait]
impl<F> KeyExtractor for FnKeyExtractor<F>
where
    F: Fn(&RequestContext) -> Option<String> + Send + Sync,
{
    async fn extract(&self, context: &RequestContext) -> Option<String> {
        (self.extractor_fn)(context)
    }

    fn name(&self) -> &str {
        &self.name
    }
}

// ============================================================================
// 组合提取器
// ============================================================================

/// 组合提取器
///
/// 按顺序尝试多个提取器，返回第一个成功的结果。
#[derive(Default)]
pub struct CompositeKeyExtractor {
    extractors: Vec<Box<dyn KeyExtractor>>,
}

impl CompositeKeyExtractor {
    pub fn new(extractors: Vec<Box<dyn KeyExtractor>>) -> Self {
        Self { extractors }
    }

    /// 添加提取器
    pub fn add_extractor(mut self, extractor: Box<dyn KeyExtractor>) -> Self {
        self.extractors.push(extractor);
        self
    }
}

#[async_trait]
impl KeyExtractor for CompositeKeyExtractor {
    async fn extract(&self, context: &RequestContext) -> Option<String> {
        for extractor in &self.extractors {
            if let Some(identity) = extractor.extract(context).await {
                return Some(identity);
            }
        }
        None
    }

    fn name(&self) -> &str {
        "CompositeKeyExtractor"
    }
}

// ============================================================================
// 全局作用域提取器
// ============================================================================

/// 网段作用域提取器
///
/// 把客户端地址映射到所在网段，同一网段的调用方共享一个全局聚合。
#[derive(Debug, Clone)]
pub struct IpScopeExtractor {
    ip: IpKeyExtractor,
    ipv4_bits: u8,
    ipv6_bits: u8,
}

impl Default for IpScopeExtractor {
    fn default() -> Self {
        Self::new(DEFAULT_IPV4_SCOPE_BITS, DEFAULT_IPV6_SCOPE_BITS)
    }
}

impl IpScopeExtractor {
    /// 前缀长度分别截断到 32 和 128
    pub fn new(ipv4_bits: u8, ipv6_bits: u8) -> Self {
        Self {
            ip: IpKeyExtractor::new(),
            ipv4_bits: ipv4_bits.min(32),
            ipv6_bits: ipv6_bits.min(128),
        }
    }

    /// 使用指定的 IP 提取器（例如读取代理头）
    pub fn with_ip_extractor(mut self, ip: IpKeyExtractor) -> Self {
        self.ip = ip;
        self
    }

    /// 地址所在网段，格式为 `network/bits`
    pub fn network(&self, addr: IpAddr) -> String {
        match addr {
            IpAddr::V4(v4) => {
                let bits = u32::from(self.ipv4_bits);
                let mask = u32::MAX.checked_shl(32 - bits).unwrap_or(0);
                let network = Ipv4Addr::from(u32::from(v4) & mask);
                format!("{}/{}", network, bits)
            }
            IpAddr::V6(v6) => {
                let bits = u32::from(self.ipv6_bits);
                let mask = u128::MAX.checked_shl(128 - bits).unwrap_or(0);
                let network = Ipv6Addr::from(u128::from(v6) & mask);
                format!("{}/{}", network, bits)
            }
        }
    }
}

#[async_trait]
impl KeyExtractor for IpScopeExtractor {
    async fn extract(&self, context: &RequestContext) -> Option<String> {
        self.ip.client_addr(context).map(|addr| self.network(addr))
    }

    fn name(&self) -> &str {
        "IpScopeExtractor"
    }
}
