use chrono::TimeDelta;
use common::ConfigError;

/// Escalating delays between webhook delivery attempts.
///
/// The delay after the n-th failed attempt is `steps[n - 1]`; once the table
/// is exhausted the last step is reused.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackoffSchedule {
    steps: Vec<TimeDelta>,
}

impl BackoffSchedule {
    pub const DEFAULT_SECS: [i64; 5] = [60, 300, 900, 3600, 7200];

    /// Builds a schedule from delays in seconds.
    ///
    /// The table must be non-empty, positive and non-decreasing.
    pub fn from_secs(secs: &[i64]) -> Result<Self, ConfigError> {
        if secs.is_empty() {
            return Err(ConfigError::invalid("webhook.backoff", "table is empty"));
        }
        if let Some(bad) = secs.iter().find(|s| **s <= 0) {
            return Err(ConfigError::invalid(
                "webhook.backoff",
                format!("delay {bad}s is not positive"),
            ));
        }
        if secs.windows(2).any(|w| w[1] < w[0]) {
            return Err(ConfigError::invalid(
                "webhook.backoff",
                "delays must be non-decreasing",
            ));
        }

        Ok(Self {
            steps: secs.iter().map(|s| TimeDelta::seconds(*s)).collect(),
        })
    }

    /// Returns the wait before the next attempt, given the number of attempts
    /// already made.
    pub fn delay_for(&self, attempts: u32) -> TimeDelta {
        let index = (attempts.saturating_sub(1) as usize).min(self.steps.len() - 1);
        self.steps[index]
    }

    pub fn steps(&self) -> &[TimeDelta] {
        &self.steps
    }
}

impl Default for BackoffSchedule {
    fn default() -> Self {
        Self {
            steps: Self::DEFAULT_SECS
                .iter()
                .map(|s| TimeDelta::seconds(*s))
                .collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_table() {
        let backoff = BackoffSchedule::default();
        assert_eq!(backoff.delay_for(1), TimeDelta::seconds(60));
        assert_eq!(backoff.delay_for(2), TimeDelta::seconds(300));
        assert_eq!(backoff.delay_for(3), TimeDelta::seconds(900));
        assert_eq!(backoff.delay_for(4), TimeDelta::seconds(3600));
        assert_eq!(backoff.delay_for(5), TimeDelta::seconds(7200));
    }

    #[test]
    fn test_last_step_is_reused() {
        let backoff = BackoffSchedule::default();
        assert_eq!(backoff.delay_for(9), TimeDelta::seconds(7200));
        assert_eq!(backoff.delay_for(u32::MAX), TimeDelta::seconds(7200));
    }

    #[test]
    fn test_monotonic() {
        let backoff = BackoffSchedule::default();
        for attempts in 1..8 {
            assert!(backoff.delay_for(attempts + 1) >= backoff.delay_for(attempts));
        }
    }

    #[test]
    fn test_rejects_bad_tables() {
        assert!(BackoffSchedule::from_secs(&[]).is_err());
        assert!(BackoffSchedule::from_secs(&[60, 0]).is_err());
        assert!(BackoffSchedule::from_secs(&[300, 60]).is_err());
        assert_eq!(
            BackoffSchedule::from_secs(&[1, 2]).unwrap().delay_for(0),
            TimeDelta::seconds(1)
        );
    }
}
