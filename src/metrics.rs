//! Prometheus metrics for parleyd.
//!
//! The registry is process-wide; exposition over HTTP belongs to a
//! collaborator that can call [`gather`].

use lazy_static::lazy_static;
use prometheus::{Encoder, IntCounter, IntGauge, Registry, TextEncoder};

lazy_static! {
    /// Global Prometheus registry for all metrics.
    pub static ref REGISTRY: Registry = Registry::new();

    /// Sessions currently connected.
    // SAFETY: metrics init at startup via lazy_static, panic acceptable if prometheus fails
    pub static ref SESSIONS_ONLINE: IntGauge = IntGauge::new(
        "parley_sessions_online",
        "Sessions currently connected"
    ).expect("SESSIONS_ONLINE metric creation failed");

    /// Topics currently loaded into memory.
    // SAFETY: metrics init at startup via lazy_static, panic acceptable if prometheus fails
    pub static ref ACTIVE_TOPICS: IntGauge = IntGauge::new(
        "parley_active_topics",
        "Topics currently running"
    ).expect("ACTIVE_TOPICS metric creation failed");

    /// Video calls being established or in progress.
    // SAFETY: metrics init at startup via lazy_static, panic acceptable if prometheus fails
    pub static ref LIVE_CALLS: IntGauge = IntGauge::new(
        "parley_live_calls",
        "Video calls in progress"
    ).expect("LIVE_CALLS metric creation failed");

    /// Total messages queued to sessions.
    // SAFETY: metrics init at startup via lazy_static, panic acceptable if prometheus fails
    pub static ref MESSAGES_SENT: IntCounter = IntCounter::new(
        "parley_messages_sent_total",
        "Messages queued to sessions"
    ).expect("MESSAGES_SENT metric creation failed");

    /// Outbound messages dropped because a session queue was full.
    // SAFETY: metrics init at startup via lazy_static, panic acceptable if prometheus fails
    pub static ref OUTBOUND_DROPPED: IntCounter = IntCounter::new(
        "parley_outbound_dropped_total",
        "Outbound messages dropped on full session queues"
    ).expect("OUTBOUND_DROPPED metric creation failed");

    /// User-cache updates dropped because the update queue was full.
    // SAFETY: metrics init at startup via lazy_static, panic acceptable if prometheus fails
    pub static ref CACHE_UPDATES_DROPPED: IntCounter = IntCounter::new(
        "parley_cache_updates_dropped_total",
        "User-cache updates dropped on a full queue"
    ).expect("CACHE_UPDATES_DROPPED metric creation failed");
}

/// Register all metrics with the global registry. Call once at startup.
pub fn init() {
    let collectors: [Box<dyn prometheus::core::Collector>; 6] = [
        Box::new(SESSIONS_ONLINE.clone()),
        Box::new(ACTIVE_TOPICS.clone()),
        Box::new(LIVE_CALLS.clone()),
        Box::new(MESSAGES_SENT.clone()),
        Box::new(OUTBOUND_DROPPED.clone()),
        Box::new(CACHE_UPDATES_DROPPED.clone()),
    ];
    for collector in collectors {
        if let Err(e) = REGISTRY.register(collector) {
            tracing::debug!(error = %e, "metric already registered");
        }
    }
}

/// Encode the current metric values in the Prometheus text format.
pub fn gather() -> String {
    let encoder = TextEncoder::new();
    let mut buf = Vec::new();
    if let Err(e) = encoder.encode(&REGISTRY.gather(), &mut buf) {
        tracing::warn!(error = %e, "failed to encode metrics");
        return String::new();
    }
    String::from_utf8(buf).unwrap_or_default()
}
