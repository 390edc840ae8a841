//! 配置模块
//!
//! 定义准入配置结构，支持 YAML、TOML 和 JSON 加载。
//!
//! 所有字段都有默认值，配置文件中可以只给出需要覆盖的键。
//! 配置在 [`GovernorBuilder::build`](crate::governor::GovernorBuilder::build) 时校验一次，之后不可变。

use crate::constants::*;
use crate::error::AntifloodError;
use crate::fallback::FallbackStrategy;
use crate::storage::RegistrationPolicy;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// 本地（按调用方）准入配置
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AntifloodConfig {
    /// 每个窗口内允许的最大尝试次数
    pub tries: u64,
    /// 未达到上限时的窗口长度（毫秒）
    pub time_limit_ms: u64,
    /// 达到上限后的封禁时长（毫秒）
    pub time_blocked_ms: u64,
    /// 存储键命名空间
    pub prefix: String,
    /// 存储故障时的降级策略
    pub fallback: FallbackStrategy,
    /// 全局聚合配置，缺省时不启用全局层
    pub global: Option<GlobalConfig>,
}

impl Default for AntifloodConfig {
    fn default() -> Self {
        Self {
            tries: DEFAULT_TRIES,
            time_limit_ms: DEFAULT_TIME_LIMIT_MS,
            time_blocked_ms: DEFAULT_TIME_BLOCKED_MS,
            prefix: DEFAULT_PREFIX.to_string(),
            fallback: FallbackStrategy::default(),
            global: None,
        }
    }
}

impl AntifloodConfig {
    pub fn time_limit(&self) -> Duration {
        Duration::from_millis(self.time_limit_ms)
    }

    pub fn time_blocked(&self) -> Duration {
        Duration::from_millis(self.time_blocked_ms)
    }

    /// 校验配置
    pub fn validate(&self) -> Result<(), String> {
        if self.tries == 0 {
            return Err("tries 必须大于 0".to_string());
        }
        if self.time_limit_ms == 0 {
            return Err("time_limit_ms 必须大于 0".to_string());
        }
        if self.time_blocked_ms == 0 {
            return Err("time_blocked_ms 必须大于 0".to_string());
        }
        validate_prefix("prefix", &self.prefix)?;

        if let Some(global) = &self.global {
            global
                .validate()
                .map_err(|e| format!("全局配置校验失败: {}", e))?;

            if global.prefix == self.prefix {
                return Err(format!(
                    "全局前缀不能与本地前缀相同: {:?}",
                    global.prefix
                ));
            }
        }

        Ok(())
    }

    /// 从 YAML 字符串加载
    pub fn from_yaml_str(yaml: &str) -> Result<Self, AntifloodError> {
        Ok(serde_yaml::from_str(yaml)?)
    }

    /// 从 TOML 字符串加载
    pub fn from_toml_str(toml: &str) -> Result<Self, AntifloodError> {
        Ok(toml::from_str(toml)?)
    }

    /// 从 JSON 字符串加载
    pub fn from_json_str(json: &str) -> Result<Self, AntifloodError> {
        Ok(serde_json::from_str(json)?)
    }

    /// 从文件加载，按扩展名选择格式（`yaml`/`yml`、`toml`、`json`）
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, AntifloodError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)?;

        let extension = path
            .extension()
            .and_then(|ext| ext.to_str())
            .map(str::to_lowercase);

        match extension.as_deref() {
            Some("yaml") | Some("yml") => Self::from_yaml_str(&content),
            Some("toml") => Self::from_toml_str(&content),
            Some("json") => Self::from_json_str(&content),
            other => Err(AntifloodError::ConfigError(format!(
                "不支持的配置文件格式: {:?}",
                other
            ))),
        }
    }
}

/// 全局聚合配置
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct GlobalConfig {
    /// 聚合键命名空间
    pub prefix: String,
    /// 触发全局封禁的成员数
    pub blocks_limit: u64,
    /// 未达到 `blocks_limit` 时的聚合窗口（毫秒）
    pub time_limit_ms: u64,
    /// 达到 `blocks_limit` 时的聚合窗口（毫秒）
    pub time_blocked_ms: u64,
    /// 已存在的成员再次登记时是否重新计时
    pub reset_time_on_retry: bool,
}

impl Default for GlobalConfig {
    fn default() -> Self {
        Self {
            prefix: DEFAULT_GLOBAL_PREFIX.to_string(),
            blocks_limit: DEFAULT_BLOCKS_LIMIT,
            time_limit_ms: DEFAULT_GLOBAL_TIME_LIMIT_MS,
            time_blocked_ms: DEFAULT_GLOBAL_TIME_BLOCKED_MS,
            reset_time_on_retry: DEFAULT_RESET_TIME_ON_RETRY,
        }
    }
}

impl GlobalConfig {
    pub fn time_limit(&self) -> Duration {
        Duration::from_millis(self.time_limit_ms)
    }

    pub fn time_blocked(&self) -> Duration {
        Duration::from_millis(self.time_blocked_ms)
    }

    /// 登记参数，窗口由存储按登记时的成员数选择
    pub fn registration_policy(&self) -> RegistrationPolicy {
        RegistrationPolicy {
            blocks_limit: self.blocks_limit,
            time_limit: self.time_limit(),
            time_blocked: self.time_blocked(),
            reset_time_on_retry: self.reset_time_on_retry,
        }
    }

    /// 校验配置
    pub fn validate(&self) -> Result<(), String> {
        if self.blocks_limit == 0 {
            return Err("blocks_limit 必须大于 0".to_string());
        }
        if self.time_limit_ms == 0 {
            return Err("time_limit_ms 必须大于 0".to_string());
        }
        if self.time_blocked_ms == 0 {
            return Err("time_blocked_ms 必须大于 0".to_string());
        }
        validate_prefix("prefix", &self.prefix)
    }
}

fn validate_prefix(field: &str, prefix: &str) -> Result<(), String> {
    if prefix.len() > MAX_PREFIX_LENGTH {
        return Err(format!(
            "{} 长度不能超过 {} 字节 (当前 {})",
            field,
            MAX_PREFIX_LENGTH,
            prefix.len()
        ));
    }
    Ok(())
}
