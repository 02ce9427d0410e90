//! Session timing and retry configuration.

use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::retry::RetryPolicy;

/// Every timing and retry constant the session uses.
///
/// Missing keys in a TOML file take their default.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Extra start-session attempts while the device answers busy.
    pub busy_retries: u32,
    pub busy_retry_delay_ms: u64,
    /// Growth of the busy retry delay; 1.0 keeps it fixed.
    pub busy_backoff: f64,
    pub busy_max_delay_ms: u64,
    /// Extra response reads after a command-channel timeout; the default
    /// gives eight reads in total.
    pub response_retries: u32,
    pub response_retry_delay_ms: u64,
    /// Paper-present polls for sheet-feeder scans.
    pub paper_polls: u32,
    /// Ready polls at the end of warm-up.
    pub calibration_polls: u32,
    /// Transparency lamp polls.
    pub lamp_polls: u32,
    pub poll_interval_ms: u64,
    /// Pause between abort and the second start attempt of a wedged device.
    pub hang_recovery_delay_ms: u64,
    /// Pause before asking again after an empty image block.
    pub empty_block_delay_ms: u64,
    /// Upper bound of reads when draining stale data.
    pub drain_max_reads: u32,
    /// Interrupt channel wait between protocol steps.
    pub interrupt_poll_ms: u64,
    /// Answer time-sync requests from the device.
    pub time_sync: bool,
    /// Tone curve exponent when the request has none.
    pub gamma: f64,
    /// Command channel timeout of the USB transport.
    pub usb_timeout_ms: u64,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            busy_retries: 10,
            busy_retry_delay_ms: 1000,
            busy_backoff: 1.0,
            busy_max_delay_ms: 1000,
            response_retries: 7,
            response_retry_delay_ms: 1000,
            paper_polls: 10,
            calibration_polls: 60,
            lamp_polls: 20,
            poll_interval_ms: 1000,
            hang_recovery_delay_ms: 500,
            empty_block_delay_ms: 10,
            drain_max_reads: 32,
            interrupt_poll_ms: 10,
            time_sync: true,
            gamma: 2.0,
            usb_timeout_ms: 20_000,
        }
    }
}

impl SessionConfig {
    /// Load configuration from a TOML file
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path.as_ref())
            .with_context(|| format!("reading config {}", path.as_ref().display()))?;
        let config: SessionConfig = toml::from_str(&content)?;
        Ok(config)
    }

    /// Save configuration to a TOML file
    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let content = toml::to_string_pretty(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Same retry budgets, no sleeping. For simulations and tests.
    pub fn without_delays(mut self) -> Self {
        self.busy_retry_delay_ms = 0;
        self.busy_max_delay_ms = 0;
        self.response_retry_delay_ms = 0;
        self.poll_interval_ms = 0;
        self.hang_recovery_delay_ms = 0;
        self.empty_block_delay_ms = 0;
        self.interrupt_poll_ms = 0;
        self
    }

    pub fn busy_policy(&self) -> RetryPolicy {
        RetryPolicy::fixed(self.busy_retries, ms(self.busy_retry_delay_ms))
            .with_backoff(self.busy_backoff, ms(self.busy_max_delay_ms))
    }

    pub fn response_policy(&self) -> RetryPolicy {
        RetryPolicy::fixed(self.response_retries, ms(self.response_retry_delay_ms))
    }

    pub fn paper_policy(&self) -> RetryPolicy {
        RetryPolicy::fixed(self.paper_polls, ms(self.poll_interval_ms))
    }

    pub fn calibration_policy(&self) -> RetryPolicy {
        RetryPolicy::fixed(self.calibration_polls, ms(self.poll_interval_ms))
    }

    pub fn lamp_policy(&self) -> RetryPolicy {
        RetryPolicy::fixed(self.lamp_polls, ms(self.poll_interval_ms))
    }

    pub fn hang_recovery_delay(&self) -> Duration {
        ms(self.hang_recovery_delay_ms)
    }

    pub fn empty_block_delay(&self) -> Duration {
        ms(self.empty_block_delay_ms)
    }

    pub fn interrupt_poll(&self) -> Duration {
        ms(self.interrupt_poll_ms)
    }

    pub fn usb_timeout(&self) -> Duration {
        ms(self.usb_timeout_ms)
    }
}

fn ms(value: u64) -> Duration {
    Duration::from_millis(value)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_match_device_timings() {
        let config = SessionConfig::default();
        assert_eq!(config.busy_policy().max_retries, 10);
        assert_eq!(config.busy_policy().delay_for(3), Duration::from_secs(1));
        assert_eq!(config.response_policy().max_retries, 7);
        assert_eq!(config.empty_block_delay(), Duration::from_millis(10));
    }

    #[test]
    fn test_partial_toml_uses_defaults() {
        let config: SessionConfig = toml::from_str("paper_polls = 3\ngamma = 1.8\n").unwrap();
        assert_eq!(config.paper_polls, 3);
        assert_eq!(config.gamma, 1.8);
        assert_eq!(config.calibration_polls, 60);
    }

    #[test]
    fn test_save_and_load() {
        let path = std::env::temp_dir().join(format!("ccdscan-config-{}.toml", std::process::id()));
        let config = SessionConfig::default().without_delays();
        config.save_to_file(&path).unwrap();
        let loaded = SessionConfig::load_from_file(&path).unwrap();
        std::fs::remove_file(&path).ok();
        assert_eq!(loaded, config);
        assert!(loaded.busy_policy().delay_for(0).is_zero());
    }
}
