use serde::{Deserialize, Serialize};
use std::str::FromStr;
use std::time::Duration;

/// Request issuance limits of one client instance
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RestrictionPolicy {
    /// Sustained rate of the token bucket
    pub max_requests_per_second: f64,
    /// Bucket capacity: requests that may go out back to back
    pub burst: u32,
    /// Upper bound on calls in flight at once
    pub max_concurrent_batch_commands: usize,
    /// Cooldown applied after the server reports an exhausted limit
    pub sleep_interval_ms: u64,
}

impl Default for RestrictionPolicy {
    fn default() -> Self {
        Self {
            max_requests_per_second: 2.0,
            burst: 50,
            max_concurrent_batch_commands: 6,
            sleep_interval_ms: 1_000,
        }
    }
}

impl RestrictionPolicy {
    /// Conservative preset for long-running bulk jobs
    pub fn batch_processing() -> Self {
        Self {
            max_requests_per_second: 1.0,
            burst: 10,
            max_concurrent_batch_commands: 1,
            sleep_interval_ms: 2_000,
        }
    }

    /// Spacing between sustained requests; `None` when the rate has no
    /// representable non-zero period
    pub fn min_interval(&self) -> Option<Duration> {
        if !(self.max_requests_per_second.is_finite() && self.max_requests_per_second > 0.0) {
            return None;
        }
        Duration::try_from_secs_f64(1.0 / self.max_requests_per_second)
            .ok()
            .filter(|period| !period.is_zero())
    }

    pub fn sleep_interval(&self) -> Duration {
        Duration::from_millis(self.sleep_interval_ms)
    }

    pub fn validate(&self) -> Result<(), String> {
        if !(self.max_requests_per_second.is_finite() && self.max_requests_per_second > 0.0) {
            return Err("max_requests_per_second must be positive".to_string());
        }
        if self.min_interval().is_none() {
            return Err(format!(
                "max_requests_per_second {} is out of range",
                self.max_requests_per_second
            ));
        }
        if self.burst == 0 {
            return Err("burst must be at least 1".to_string());
        }
        if self.max_concurrent_batch_commands == 0 {
            return Err("max_concurrent_batch_commands must be at least 1".to_string());
        }
        Ok(())
    }
}

impl FromStr for RestrictionPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "" | "default" => Ok(Self::default()),
            "batch-processing" | "batch_processing" => Ok(Self::batch_processing()),
            other => Err(format!("unknown restriction preset '{}'", other)),
        }
    }
}
