//! Prelude module - Commonly used types for quick imports
//!
//! `use antiflood::prelude::*;` brings in everything needed to build a
//! [`Governor`], evaluate requests and observe outcomes.

// Core types - always available
pub use crate::config::{AntifloodConfig, GlobalConfig};
pub use crate::decision::{DecisionSource, Outcome};
pub use crate::error::{AntifloodError, ObserverError, StorageError};
pub use crate::fallback::FallbackStrategy;
pub use crate::governor::{Admission, Governor, GovernorBuilder, Handled};

// Identity
pub use crate::extractors::{HeaderKeyExtractor, IpKeyExtractor, KeyExtractor, RequestContext};

// Observers and rejection
pub use crate::notify::{AdmissionEvent, Extension, OutcomeKind, Subscriber};
pub use crate::response::{RejectionHandler, Response, TooManyRequests};

// Storage
pub use crate::clock::{Clock, MockClock, SystemClock};
pub use crate::storage::{CounterStore, GlobalStore, MemoryStorage, RegistrationPolicy};

// Feature-gated exports
#[cfg(feature = "redis")]
pub use crate::redis_storage::{RedisConfig, RedisStorage};

#[cfg(feature = "monitoring")]
pub use crate::telemetry::Metrics;
