//! Utility helpers shared by connectors, cache and coordinator.
//!
//! This module contains:
//! - Time helpers
//! - Timestamp parsing / formatting for the wire formats
//! - Key construction helpers
//! - Poison-tolerant lock helpers
//!
//! IMPORTANT:
//! - No platform-specific logic should live here.
//! - This module must remain lightweight and deterministic.
//!

use std::sync::{Mutex, MutexGuard, RwLock, RwLockReadGuard, RwLockWriteGuard};

use chrono::{DateTime, NaiveDateTime, Utc};
use log::warn;

/// Wire format used on the outbound channel and by the upstream simulators.
///
/// ISO-8601 local date-time (UTC), millisecond precision,
/// e.g. `2024-05-01T10:15:30.123`.
const TIMESTAMP_FORMAT: &str = "%Y-%m-%dT%H:%M:%S%.3f";

/// Returns the current UTC time.
pub fn now() -> DateTime<Utc> {
    Utc::now()
}

/// Parses a producer timestamp.
///
/// Accepted forms:
/// - RFC 3339 with offset   ("2024-05-01T10:15:30.123Z")
/// - ISO local date-time    ("2024-05-01T10:15:30.123456"), read as UTC
///
/// Returns `None` for anything else.
pub fn parse_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    let raw = raw.trim();

    if let Ok(ts) = DateTime::parse_from_rfc3339(raw) {
        return Some(ts.with_timezone(&Utc));
    }

    raw.parse::<NaiveDateTime>().ok().map(|naive| naive.and_utc())
}

/// Parses a producer timestamp, falling back to "now".
///
/// Losing a price point is worse than an approximate timestamp,
/// so an unparseable value never rejects the record.
pub fn parse_timestamp_or_now(raw: &str, context: &str) -> DateTime<Utc> {
    parse_timestamp(raw).unwrap_or_else(|| {
        warn!("Unparseable timestamp '{}' for {} - using current time", raw, context);
        now()
    })
}

pub fn format_timestamp(ts: &DateTime<Utc>) -> String {
    ts.format(TIMESTAMP_FORMAT).to_string()
}

/// Fully-qualified instrument key.
///
/// Examples:
/// - ("PF1", "PF1_USDTRY") -> "PF1_PF1_USDTRY"
/// - ("", "USDTRY")        -> "USDTRY"
///
pub fn qualified_key(platform: &str, instrument: &str) -> String {
    if platform.is_empty() {
        instrument.to_string()
    } else {
        format!("{}_{}", platform, instrument)
    }
}

// ------------------------------------------------------------
// Lock helpers
// ------------------------------------------------------------
//
// Guarded state in this crate stays valid even if a holder
// panicked mid-update (sets, timestamps, handles), so poisoned
// locks are recovered instead of propagating the panic.
//
pub fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| {
        warn!("Mutex was poisoned, recovering");
        poisoned.into_inner()
    })
}

pub fn read<T>(lock: &RwLock<T>) -> RwLockReadGuard<'_, T> {
    lock.read().unwrap_or_else(|poisoned| {
        warn!("RwLock was poisoned, recovering");
        poisoned.into_inner()
    })
}

pub fn write<T>(lock: &RwLock<T>) -> RwLockWriteGuard<'_, T> {
    lock.write().unwrap_or_else(|poisoned| {
        warn!("RwLock was poisoned, recovering");
        poisoned.into_inner()
    })
}
