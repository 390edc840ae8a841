//! 监控和追踪模块
//!
//! - `monitoring` 特性：Prometheus 指标，作为通知扩展订阅全部结果
//! - `telemetry` 特性：基于 tracing-subscriber 的日志初始化
//!
//! # 示例
//!
//! ```rust,ignore
//! use antiflood::prelude::*;
//! use antiflood::telemetry::Metrics;
//! use std::sync::Arc;
//!
//! let metrics = Arc::new(Metrics::new()?);
//! let governor = Governor::builder()
//!     .extension(metrics.extension())
//!     .build()?;
//!
//! println!("{}", metrics.gather());
//! ```

#[cfg(feature = "telemetry")]
use crate::error::AntifloodError;

#[cfg(feature = "monitoring")]
pub use metrics::Metrics;

#[cfg(feature = "monitoring")]
mod metrics {
    use crate::decision::{DecisionSource, Outcome};
    use crate::notify::{AdmissionEvent, Extension, Subscriber};
    use prometheus::{Encoder, IntCounterVec, Opts, Registry, TextEncoder};
    use std::sync::Arc;
    use tracing::error;

    /// 准入指标
    #[derive(Clone)]
    pub struct Metrics {
        /// 按结果和来源统计的评估次数
        admissions_total: IntCounterVec,
        registry: Registry,
    }

    impl std::fmt::Debug for Metrics {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            f.debug_struct("Metrics").finish_non_exhaustive()
        }
    }

    fn source_label(source: DecisionSource) -> &'static str {
        match source {
            DecisionSource::Local => "local",
            DecisionSource::Global => "global",
            DecisionSource::Fallback => "fallback",
        }
    }

    impl Metrics {
        /// 创建指标并注册到独立的注册表
        pub fn new() -> Result<Self, prometheus::Error> {
            let registry = Registry::new();

            let admissions_total = IntCounterVec::new(
                Opts::new(
                    "antiflood_admissions_total",
                    "Total number of admission evaluations",
                ),
                &["outcome", "source"],
            )?;
            registry.register(Box::new(admissions_total.clone()))?;

            Ok(Self {
                admissions_total,
                registry,
            })
        }

        /// 记录一个事件
        pub fn record(&self, event: &AdmissionEvent) {
            self.admissions_total
                .with_label_values(&[event.kind.as_str(), source_label(event.source)])
                .inc();
        }

        /// 某个结果和来源的累计次数
        pub fn count(&self, outcome: Outcome, source: DecisionSource) -> u64 {
            self.admissions_total
                .with_label_values(&[outcome.as_str(), source_label(source)])
                .get()
        }

        /// 订阅全部结果的扩展
        pub fn extension(self: &Arc<Self>) -> impl Extension + 'static {
            let metrics = self.clone();
            move |subscriber: &mut Subscriber| {
                let metrics = metrics.clone();
                subscriber.subscribe_all(move |event| {
                    metrics.record(event);
                    Ok(())
                });
            }
        }

        /// 导出文本格式
        pub fn gather(&self) -> String {
            let encoder = TextEncoder::new();
            let metric_families = self.registry.gather();
            let mut buffer = Vec::new();
            if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
                error!("Failed to encode metrics: {}", e);
                return String::new();
            }
            String::from_utf8(buffer).unwrap_or_default()
        }

        pub fn registry(&self) -> &Registry {
            &self.registry
        }
    }

}

/// 初始化 tracing 日志
///
/// 优先使用 `RUST_LOG`，未设置时使用 `filter`（例如 `"antiflood=debug"`）。
#[cfg(feature = "telemetry")]
pub fn init_tracing(filter: &str) -> Result<(), AntifloodError> {
    use tracing_subscriber::EnvFilter;

    let env_filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(filter))
        .map_err(|e| AntifloodError::ConfigError(format!("无效的日志过滤器: {}", e)))?;

    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .try_init()
        .map_err(|e| AntifloodError::ConfigError(format!("日志初始化失败: {}", e)))?;

    tracing::info!("Tracing initialized");
    Ok(())
}
