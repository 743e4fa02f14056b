use flint::logging;
use flint::math::GridSquare;
use std::time::{Duration, Instant};

/// Alerts raised by the health monitor. Advisory only: recovery is the router loop's job.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum HealthAlert {
    ProlongedMismatch { seconds: u64 },
}

/// Watches the connected-zone-vs-position relationship independently of RPC outcomes, so a
/// wedged transition is noticed even when every call is succeeding.
pub struct HealthMonitor {
    mismatch_since: Option<Instant>,
    alert_after: Duration,
    last_alert: Option<Instant>,
    log: logging::Logger,
}

impl HealthMonitor {
    pub fn new<'a, L: Into<Option<&'a logging::Logger>>>(alert_after: Duration, log: L) -> HealthMonitor {
        HealthMonitor {
            mismatch_since: None,
            alert_after,
            last_alert: None,
            log: logging::child(log),
        }
    }

    /// Observes one router tick. Returns an alert when a mismatch has persisted beyond the
    /// threshold; re-alerts at most once per threshold interval.
    pub fn observe(
        &mut self,
        connected_zone: Option<GridSquare>,
        own_zone: GridSquare,
        now: Instant,
    ) -> Option<HealthAlert> {
        let mismatched = match connected_zone {
            Some(zone) => zone != own_zone,
            None => false,
        };

        if !mismatched {
            self.mismatch_since = None;
            self.last_alert = None;
            return None;
        }

        let since = *self.mismatch_since.get_or_insert(now);
        let elapsed = now.duration_since(since);

        if elapsed < self.alert_after {
            return None;
        }

        let due = self
            .last_alert
            .map_or(true, |last| now.duration_since(last) >= self.alert_after);

        if !due {
            return None;
        }

        self.last_alert = Some(now);

        let alert = HealthAlert::ProlongedMismatch {
            seconds: elapsed.as_secs(),
        };

        logging::warn!(self.log, "PROLONGED_MISMATCH";
                       "own_zone" => ?own_zone,
                       "connected_zone" => ?connected_zone,
                       "seconds" => elapsed.as_secs());

        Some(alert)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_no_alert_when_aligned() {
        let mut monitor = HealthMonitor::new(Duration::from_millis(100), None);
        let now = Instant::now();

        assert!(monitor
            .observe(Some(GridSquare::new(0, 0)), GridSquare::new(0, 0), now)
            .is_none());
    }

    #[test]
    fn test_alert_after_threshold() {
        let mut monitor = HealthMonitor::new(Duration::from_millis(100), None);
        let start = Instant::now();

        let connected = Some(GridSquare::new(0, 0));
        let own = GridSquare::new(1, 0);

        assert!(monitor.observe(connected, own, start).is_none());
        assert!(monitor
            .observe(connected, own, start + Duration::from_millis(50))
            .is_none());

        let alert = monitor.observe(connected, own, start + Duration::from_millis(150));
        assert!(matches!(alert, Some(HealthAlert::ProlongedMismatch { .. })));

        // Throttled until another interval passes
        assert!(monitor
            .observe(connected, own, start + Duration::from_millis(200))
            .is_none());
    }

    #[test]
    fn test_recovery_clears_state() {
        let mut monitor = HealthMonitor::new(Duration::from_millis(100), None);
        let start = Instant::now();

        let own = GridSquare::new(1, 0);
        monitor.observe(Some(GridSquare::new(0, 0)), own, start);
        monitor.observe(Some(own), own, start + Duration::from_millis(50));

        // Mismatch restarts from zero afterwards
        assert!(monitor
            .observe(Some(GridSquare::new(0, 0)), own, start + Duration::from_millis(200))
            .is_none());
    }

    #[test]
    fn test_disconnected_is_not_a_mismatch() {
        let mut monitor = HealthMonitor::new(Duration::from_millis(100), None);

        assert!(monitor
            .observe(None, GridSquare::new(0, 0), Instant::now())
            .is_none());
    }
}
