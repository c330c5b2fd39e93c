use std::time::Duration;

use tokio::time::Instant;

pub fn now() -> Instant {
    Instant::now()
}

/// Lease shortened by the drift margin: `lease - lease * factor`.
pub fn drift_adjusted(lease: Duration, factor: f64) -> Duration {
    let factor = if factor.is_finite() {
        factor.clamp(0.0, 1.0)
    } else {
        0.0
    };
    lease.saturating_sub(lease.mul_f64(factor))
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::drift_adjusted;

    #[test]
    fn drift_margin_is_subtracted() {
        let lease = Duration::from_secs(10);
        assert_eq!(drift_adjusted(lease, 0.25), Duration::from_millis(7500));
        assert_eq!(drift_adjusted(lease, 0.0), lease);
    }

    #[test]
    fn out_of_range_factor_is_clamped() {
        let lease = Duration::from_secs(4);
        assert_eq!(drift_adjusted(lease, 2.0), Duration::ZERO);
        assert_eq!(drift_adjusted(lease, -1.0), lease);
        assert_eq!(drift_adjusted(lease, f64::NAN), lease);
    }
}
