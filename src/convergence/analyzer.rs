//! Pure classification logic for an open tracking's latest sample: has
//! this spread converged, diverged further, or simply run out the clock.
//!
//! A tracking that diverges doesn't linger waiting for a second
//! confirmation sample — the alert and the close happen on the same
//! classification call, one atomic state transition, because by the time
//! a second sample confirms it the opportunity has usually already moved
//! on.

use crate::models::{ConvergenceReason, TrackingOutcome};

pub struct ConvergenceThresholds {
    /// Spread at or below this is considered converged.
    pub converge_at_pct: f64,
    /// Spread at or above `initial * diverge_multiplier` is considered a
    /// divergence rather than noise around the initial reading.
    pub diverge_multiplier: f64,
    pub expire_after_secs: f64,
}

/// `None` means "still open, keep polling."
pub fn classify(
    initial_spread_pct: f64,
    latest_spread_pct: f64,
    elapsed_secs: f64,
    thresholds: &ConvergenceThresholds,
) -> Option<TrackingOutcome> {
    if latest_spread_pct <= thresholds.converge_at_pct {
        return Some(TrackingOutcome::Converged);
    }

    if initial_spread_pct > 0.0 && latest_spread_pct >= initial_spread_pct * thresholds.diverge_multiplier {
        return Some(TrackingOutcome::Diverged);
    }

    if elapsed_secs >= thresholds.expire_after_secs {
        return Some(TrackingOutcome::Expired);
    }

    None
}

/// Adaptive poll interval for a tracking of a given age: young trackings
/// move fast and are worth checking often; the cadence backs off in five
/// tiers as a tracking ages so a long-lived divergence doesn't burn a poll
/// slot every few seconds forever.
///
/// | age            | interval |
/// |----------------|----------|
/// | 0-5 min        | 5s       |
/// | 5-30 min       | 30s      |
/// | 30 min-2h      | 60s      |
/// | 2h-24h         | 300s     |
/// | 24h+           | 900s     |
pub fn poll_interval_secs(age_secs: f64) -> f64 {
    const MINUTE: f64 = 60.0;
    const HOUR: f64 = 3600.0;
    if age_secs < 5.0 * MINUTE {
        5.0
    } else if age_secs < 30.0 * MINUTE {
        30.0
    } else if age_secs < 2.0 * HOUR {
        60.0
    } else if age_secs < 24.0 * HOUR {
        300.0
    } else {
        900.0
    }
}

/// C8.A: classify which side of a closed tracking moved to produce the
/// convergence, by comparing the first and last recorded snapshots.
///
/// A short-lived tracking (<15 min) where depth dropped sharply on either
/// side reads as another actor having already taken the arb rather than
/// organic price movement. Otherwise the reason follows whichever side
/// moved the most, with `unknown` reserved for moves too small to explain
/// the convergence at all.
pub fn classify_convergence_reason(
    low_change_pct: f64,
    high_change_pct: f64,
    duration_minutes: f64,
    low_depth_drop_pct: f64,
    high_depth_drop_pct: f64,
) -> ConvergenceReason {
    if duration_minutes < 15.0 && (low_depth_drop_pct >= 30.0 || high_depth_drop_pct >= 30.0) {
        return ConvergenceReason::ArbActivity;
    }

    let low_moved = low_change_pct.abs();
    let high_moved = high_change_pct.abs();

    if low_moved < 1.0 && high_moved < 1.0 {
        return ConvergenceReason::Unknown;
    }

    if low_change_pct > 1.0 && low_moved > 2.0 * high_moved {
        return ConvergenceReason::BuyUp;
    }

    if high_change_pct < -1.0 && high_moved > 2.0 * low_moved {
        return ConvergenceReason::SellDown;
    }

    ConvergenceReason::Both
}

#[cfg(test)]
mod tests {
    use super::*;

    fn thresholds() -> ConvergenceThresholds {
        ConvergenceThresholds {
            converge_at_pct: 0.1,
            diverge_multiplier: 1.5,
            expire_after_secs: 3600.0,
        }
    }

    #[test]
    fn classifies_convergence_when_spread_collapses() {
        let outcome = classify(0.5, 0.05, 30.0, &thresholds());
        assert_eq!(outcome, Some(TrackingOutcome::Converged));
    }

    #[test]
    fn classifies_divergence_when_spread_widens_past_multiplier() {
        let outcome = classify(0.5, 0.8, 30.0, &thresholds());
        assert_eq!(outcome, Some(TrackingOutcome::Diverged));
    }

    #[test]
    fn classifies_expiry_once_the_clock_runs_out() {
        let outcome = classify(0.5, 0.4, 4000.0, &thresholds());
        assert_eq!(outcome, Some(TrackingOutcome::Expired));
    }

    #[test]
    fn remains_open_when_nothing_has_changed() {
        let outcome = classify(0.5, 0.45, 30.0, &thresholds());
        assert_eq!(outcome, None);
    }

    #[test]
    fn poll_interval_backs_off_across_the_five_tiers() {
        assert_eq!(poll_interval_secs(0.0), 5.0);
        assert_eq!(poll_interval_secs(4.0 * 60.0), 5.0);
        assert_eq!(poll_interval_secs(6.0 * 60.0), 30.0);
        assert_eq!(poll_interval_secs(45.0 * 60.0), 60.0);
        assert_eq!(poll_interval_secs(3.0 * 3600.0), 300.0);
        assert_eq!(poll_interval_secs(25.0 * 3600.0), 900.0);
    }

    #[test]
    fn classifies_arb_activity_when_depth_vanishes_quickly() {
        let reason = classify_convergence_reason(0.2, -0.1, 5.0, 40.0, 5.0);
        assert_eq!(reason, ConvergenceReason::ArbActivity);
    }

    #[test]
    fn classifies_buy_up_when_low_side_dominates_the_move() {
        let reason = classify_convergence_reason(2.0, -0.2, 20.0, 0.0, 0.0);
        assert_eq!(reason, ConvergenceReason::BuyUp);
    }

    #[test]
    fn classifies_sell_down_when_high_side_dominates_the_move() {
        let reason = classify_convergence_reason(0.1, -2.0, 20.0, 0.0, 0.0);
        assert_eq!(reason, ConvergenceReason::SellDown);
    }

    #[test]
    fn classifies_unknown_when_neither_side_moved() {
        let reason = classify_convergence_reason(0.2, -0.3, 20.0, 0.0, 0.0);
        assert_eq!(reason, ConvergenceReason::Unknown);
    }

    #[test]
    fn classifies_both_when_sides_move_comparably() {
        let reason = classify_convergence_reason(1.5, -1.3, 20.0, 0.0, 0.0);
        assert_eq!(reason, ConvergenceReason::Both);
    }
}
