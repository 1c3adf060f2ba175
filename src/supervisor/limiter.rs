use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};

/// At most `max_restarts` automatic restarts per rolling `window`.
#[derive(Debug, Clone)]
pub struct RestartLimiter {
    max_restarts: usize,
    window: TimeDelta,
}

impl RestartLimiter {
    pub fn new(max_restarts: u32, window: Duration) -> Self {
        Self {
            max_restarts: max_restarts as usize,
            window: TimeDelta::from_std(window).unwrap_or(TimeDelta::MAX),
        }
    }

    /// Forget restarts that fell out of the window, then record one at
    /// `now` if the budget allows. Returns whether it was recorded.
    pub fn try_record(&self, history: &mut Vec<DateTime<Utc>>, now: DateTime<Utc>) -> bool {
        history.retain(|at| now.signed_duration_since(*at) < self.window);
        if history.len() >= self.max_restarts {
            return false;
        }
        history.push(now);
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allows_up_to_the_limit_inside_the_window() {
        let limiter = RestartLimiter::new(3, Duration::from_secs(600));
        let mut history = Vec::new();
        let t0 = Utc::now();

        for i in 0..3 {
            assert!(limiter.try_record(&mut history, t0 + TimeDelta::seconds(i)));
        }
        assert!(!limiter.try_record(&mut history, t0 + TimeDelta::seconds(10)));
        assert_eq!(history.len(), 3);
    }

    #[test]
    fn old_restarts_age_out() {
        let limiter = RestartLimiter::new(2, Duration::from_secs(600));
        let t0 = Utc::now();
        let mut history = vec![t0, t0 + TimeDelta::seconds(30)];

        assert!(!limiter.try_record(&mut history, t0 + TimeDelta::seconds(599)));
        assert!(limiter.try_record(&mut history, t0 + TimeDelta::seconds(601)));
        assert_eq!(history.len(), 2);
    }

    #[test]
    fn zero_budget_never_restarts() {
        let limiter = RestartLimiter::new(0, Duration::from_secs(600));
        assert!(!limiter.try_record(&mut Vec::new(), Utc::now()));
    }
}
