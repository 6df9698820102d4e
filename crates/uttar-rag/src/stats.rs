//! Response-time aggregation for daily stats.
//!
//! The relational store recomputes each (tenant, date) row from raw message
//! rows inside the same transaction that inserts a message; this module owns
//! the arithmetic so the writer and the rebuild path share it.

/// Average and p95 (nearest-rank) of response times, in milliseconds.
/// Sorts in place. Empty input yields (0, 0).
pub fn response_time_aggregates(times_ms: &mut Vec<i64>) -> (i64, i64) {
    if times_ms.is_empty() {
        return (0, 0);
    }
    times_ms.sort_unstable();

    let sum: i64 = times_ms.iter().sum();
    let avg = sum / times_ms.len() as i64;

    let rank = ((0.95 * times_ms.len() as f64).ceil() as usize).clamp(1, times_ms.len());
    let p95 = times_ms[rank - 1];

    (avg, p95)
}
