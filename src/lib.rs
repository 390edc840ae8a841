//! Copyright (c) 2026, Kirky.X
//!
//! MIT License
//!
//! Antiflood - Fixed-window request admission
//!
//! Counts attempts per caller inside a fixed window and blocks a caller once it
//! reaches the configured number of tries. An optional second tier counts how
//! many callers of one scope (for example a /24 network) are blocked and rejects
//! the whole scope once enough of them are.
//!
//! # API Layers
//!
//! ## Prelude (Quick Start)
//!
//! Use `use antiflood::prelude::*;` to import all commonly used types.
//!
//! ## Core API
//!
//! - [`Governor`] - Admission entry point
//! - [`AntifloodConfig`] / [`GlobalConfig`] - Configuration
//! - [`Outcome`] - `Allowed`, `LimitJustReached` or `Blocked`
//! - [`CounterStore`] / [`GlobalStore`] - Pluggable storage contracts
//! - [`AntifloodError`] / [`StorageError`] - Error types
//!
//! ## Extensions
//!
//! Observers subscribe to outcomes through [`Extension`]s registered on the
//! [`GovernorBuilder`]. They see every outcome and can never change it.
//!
//! ## Feature-gated
//!
//! - Redis storage (requires `redis` feature)
//! - Prometheus metrics extension (requires `monitoring` feature)
//! - tracing-subscriber setup (requires `telemetry` feature)
//!
//! # Examples
//!
//! ```rust
//! use antiflood::prelude::*;
//!
//! #[tokio::main]
//! async fn main() {
//!     let config = AntifloodConfig {
//!         tries: 3,
//!         ..Default::default()
//!     };
//!     let governor = Governor::new(config).unwrap();
//!     let ctx = RequestContext::new().with_client_ip("203.0.113.9");
//!
//!     for _ in 0..3 {
//!         assert!(governor.evaluate(&ctx).await.is_admitted());
//!     }
//!     assert_eq!(governor.evaluate(&ctx).await.outcome, Outcome::Blocked);
//! }
//! ```

pub mod prelude;

pub mod clock;
pub mod config;
pub mod constants;
pub mod decision;
pub mod error;
pub mod extractors;
pub mod fallback;
pub mod governor;
pub mod key;
#[cfg(feature = "redis")]
pub mod lua_scripts;
pub mod notify;
#[cfg(feature = "redis")]
pub mod redis_storage;
pub mod response;
pub mod storage;
#[cfg(any(feature = "telemetry", feature = "monitoring"))]
pub mod telemetry;

pub use clock::{Clock, MockClock, SystemClock};
pub use config::{AntifloodConfig, GlobalConfig};
pub use decision::{decide, Decision, DecisionSource, Outcome, Thresholds};
pub use error::{AntifloodError, ObserverError, StorageError};
pub use extractors::{
    CompositeKeyExtractor, FnKeyExtractor, HeaderKeyExtractor, IpKeyExtractor, IpScopeExtractor,
    KeyExtractor, RequestContext,
};
pub use fallback::FallbackStrategy;
pub use governor::{Admission, Governor, GovernorBuilder, Handled};
#[cfg(feature = "redis")]
pub use lua_scripts::{LuaScriptType, LuaScripts};
pub use notify::{AdmissionEvent, Extension, NotificationHub, OutcomeKind, Subscriber};
#[cfg(feature = "redis")]
pub use redis_storage::{RedisConfig, RedisStorage};
pub use response::{RejectionHandler, Response, TooManyRequests};
pub use storage::{AdmissionStore, CounterRecord, CounterStore, GlobalStore, MemoryStorage};
#[cfg(feature = "monitoring")]
pub use telemetry::Metrics;
