//! Reactive controller for the commerce API's cost-based rate limit.
//!
//! Every GraphQL response carries a cost telemetry record. The controller is
//! purely reactive: it looks at the telemetry that came back and decides how
//! long to wait before the next page. It does not pre-budget requests, and
//! missing telemetry means no delay — the server will surface failures on
//! its own.

use std::time::Duration;

/// Added on top of the computed restore wait.
pub const SAFETY_MARGIN: Duration = Duration::from_millis(200);

/// Share of the maximum bucket kept as headroom before delays kick in.
const BUFFER_RATIO: f64 = 0.20;

/// Cost telemetry from one GraphQL response.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ThrottleStatus {
    pub currently_available: f64,
    pub maximum_available: f64,
    pub restore_rate: f64,
    pub requested_query_cost: f64,
}

/// Delay to observe before the next request, if any.
///
/// No delay while the bucket holds more than a 20% buffer, or while the last
/// query's cost still fits in what is available. Otherwise wait for the
/// deficit to restore, rounded up to whole seconds, plus a small margin.
pub fn delay_for(status: &ThrottleStatus) -> Option<Duration> {
    let buffer = status.maximum_available * BUFFER_RATIO;
    if status.currently_available > buffer {
        return None;
    }
    if status.requested_query_cost <= status.currently_available {
        return None;
    }
    if status.restore_rate <= 0.0 {
        // Degenerate telemetry; treat as unknown.
        return None;
    }

    let deficit = status.requested_query_cost - status.currently_available;
    let restore_secs = (deficit / status.restore_rate).ceil();
    Some(Duration::from_secs_f64(restore_secs) + SAFETY_MARGIN)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn status(
        currently_available: f64,
        maximum_available: f64,
        restore_rate: f64,
        requested_query_cost: f64,
    ) -> ThrottleStatus {
        ThrottleStatus {
            currently_available,
            maximum_available,
            restore_rate,
            requested_query_cost,
        }
    }

    #[test]
    fn no_delay_while_the_bucket_is_above_the_buffer() {
        // 20% of 1000 is 200; 500 available is comfortably above it
        assert_eq!(delay_for(&status(500.0, 1000.0, 50.0, 600.0)), None);
    }

    #[test]
    fn no_delay_when_the_next_query_still_fits() {
        // below the buffer, but the cost fits in what is available
        assert_eq!(delay_for(&status(150.0, 1000.0, 50.0, 100.0)), None);
    }

    #[test]
    fn waits_for_the_deficit_to_restore() {
        // deficit of 350 at 50 points/sec rounds up to 7s, plus the margin
        let delay = delay_for(&status(150.0, 1000.0, 50.0, 500.0)).expect("expected a delay");
        assert_eq!(delay, Duration::from_secs(7) + SAFETY_MARGIN);
    }

    #[test]
    fn fractional_restore_times_round_up() {
        // deficit of 10 at 3 points/sec is 3.33s, rounded up to 4s
        let delay = delay_for(&status(0.0, 1000.0, 3.0, 10.0)).expect("expected a delay");
        assert_eq!(delay, Duration::from_secs(4) + SAFETY_MARGIN);
    }

    #[test]
    fn degenerate_restore_rate_means_no_delay() {
        assert_eq!(delay_for(&status(0.0, 1000.0, 0.0, 500.0)), None);
    }

    #[test]
    fn boundary_sits_exactly_on_the_buffer() {
        // exactly at the buffer is not above it, and the cost exceeds what
        // is available, so a delay applies
        let delay = delay_for(&status(200.0, 1000.0, 100.0, 300.0)).expect("expected a delay");
        assert_eq!(delay, Duration::from_secs(1) + SAFETY_MARGIN);
    }
}
