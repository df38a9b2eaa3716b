//! Typed error kinds shared across the pipeline stages.
//!
//! Components return `anyhow::Result` at their own boundaries but wrap
//! failures that downstream code needs to branch on (retry vs. skip vs.
//! mark the tick unavailable) in one of these variants first.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ObservatoryError {
    /// A venue call failed in a way that is likely to succeed on retry
    /// within the same tick (timeout, connection reset, 5xx).
    #[error("adapter transient error for venue {venue}: {source}")]
    AdapterTransient {
        venue: String,
        #[source]
        source: anyhow::Error,
    },

    /// Retries were exhausted for this tick; the venue is excluded from
    /// the remaining stages until the next PriceCollector cycle.
    #[error("adapter unavailable for venue {venue} this tick: {reason}")]
    AdapterUnavailable { venue: String, reason: String },

    /// A quote or order book was older than the staleness budget.
    #[error("stale data for {venue}/{symbol}: age {age_secs}s exceeds budget")]
    StaleData {
        venue: String,
        symbol: String,
        age_secs: u64,
    },

    /// Two venues' symbols mapped to the same base symbol but disagree on
    /// what they represent (e.g. wrapped vs. native asset).
    #[error("token mismatch for {base_symbol} between {venue_a} and {venue_b}")]
    TokenMismatch {
        base_symbol: String,
        venue_a: String,
        venue_b: String,
    },

    /// A signal failed a safety predicate (crossed book, non-finite price,
    /// position-to-exit-liquidity ratio, etc.) and was rejected.
    #[error("safety rejection for {base_symbol} {low_venue}/{high_venue}: {reason}")]
    SafetyRejection {
        base_symbol: String,
        low_venue: String,
        high_venue: String,
        reason: String,
    },

    /// A bounded channel between pipeline stages was full.
    #[error("queue overflow in {queue_name}, dropping item")]
    QueueOverflow { queue_name: String },

    /// A durable-store write failed.
    #[error("persistence failure during {operation}: {source}")]
    PersistenceFailure {
        operation: String,
        #[source]
        source: anyhow::Error,
    },

    /// The Notifier failed to deliver an alert.
    #[error("notifier failure delivering to {chat_id}: {source}")]
    NotifierFailure {
        chat_id: String,
        #[source]
        source: anyhow::Error,
    },
}
