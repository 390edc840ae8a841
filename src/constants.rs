//! Copyright (c) 2026, Kirky.X
//!
//! MIT License
//!
//! Centralized configuration constants for Antiflood.
//!
//! Every default of the configuration surface lives here so that the
//! serde defaults, the builder and the documentation agree on one value.

/// Default window for non-terminal counts (1 minute).
///
/// A counter that has not yet reached `tries` expires after this long.
pub const DEFAULT_TIME_LIMIT_MS: u64 = 60_000;

/// Default blocked duration once the limit is reached (5 minutes).
pub const DEFAULT_TIME_BLOCKED_MS: u64 = 5 * 60_000;

/// Default maximum attempts per window.
pub const DEFAULT_TRIES: u64 = 10;

/// Default key namespace for per-caller counters.
pub const DEFAULT_PREFIX: &str = "";

// ============================================================================
// Global tier
// ============================================================================

/// Default key namespace for aggregate records.
pub const DEFAULT_GLOBAL_PREFIX: &str = "global";

/// Number of blocked members that trips the global block.
pub const DEFAULT_BLOCKS_LIMIT: u64 = 10;

/// Default aggregate window while below `blocks_limit` (30 minutes).
pub const DEFAULT_GLOBAL_TIME_LIMIT_MS: u64 = 1_800_000;

/// Default aggregate window once `blocks_limit` is reached (1 hour).
pub const DEFAULT_GLOBAL_TIME_BLOCKED_MS: u64 = 3_600_000;

/// Re-registering an existing member does not restart the aggregate window by default.
pub const DEFAULT_RESET_TIME_ON_RETRY: bool = false;

// ============================================================================
// Identity / keys
// ============================================================================

/// Maximum prefix length accepted by configuration validation.
///
/// Keeps store keys bounded; the digest part is always 44 characters.
pub const MAX_PREFIX_LENGTH: usize = 256;

/// Identity used when no identity can be extracted from a request.
pub const UNKNOWN_IDENTITY: &str = "unknown";

/// IPv4 prefix length used by the default global scope extractor.
pub const DEFAULT_IPV4_SCOPE_BITS: u8 = 24;

/// IPv6 prefix length used by the default global scope extractor.
pub const DEFAULT_IPV6_SCOPE_BITS: u8 = 64;

// ============================================================================
// Counter writes
// ============================================================================

/// Read-decide-write attempts before a conflicting counter write is reported
/// as a storage error.
pub const MAX_WRITE_ATTEMPTS: u32 = 5;

// ============================================================================
// Rejection payload
// ============================================================================

/// HTTP status written by the default rejection handler.
pub const TOO_MANY_REQUESTS_STATUS: u16 = 429;

/// Text of the default rejection payload.
pub const TOO_MANY_REQUESTS_TEXT: &str = "Too many requests.";

// ============================================================================
// Memory storage
// ============================================================================

/// Default interval of the background expiry sweep (1 minute).
pub const DEFAULT_CLEANUP_INTERVAL_SECS: u64 = 60;
