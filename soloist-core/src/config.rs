//! Timing configuration with the cross-component budget checked at build time.
//!
//! The whole liveness argument rests on one chain of inequalities:
//!
//! ```text
//! store_timeout ≤ survey_timeout < refresh_interval × refresh_failure_budget < lease_ttl
//! ```
//!
//! A leader that cannot reach the store gives up strictly before its lease can
//! expire under it, and a surveyed subscribe always resolves within one lease
//! term. [`ConfigBuilder::finish`] refuses any instantiation that breaks the
//! chain, so a [`Config`] in hand is proof the budget holds.

use std::time::Duration;

use thiserror::Error;

/// A configuration rejected by [`ConfigBuilder::finish`].
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("invalid configuration: {0}")]
pub struct InvalidConfig(String);

/// Unvalidated timing knobs. Call [`ConfigBuilder::finish`] to obtain a
/// usable [`Config`].
#[derive(Clone, Debug)]
pub struct ConfigBuilder {
    /// Bound on every single lease-store request.
    pub store_timeout: Duration,
    /// Bound on one survey round-trip. Must be strictly less than the lease
    /// TTL so a routed subscribe cannot outlive the lease it was routed on.
    pub survey_timeout: Duration,
    /// Bound on opening the upstream producer.
    pub open_timeout: Duration,
    /// Bound on one outbound delivery (bus publish or client write). An
    /// overrun drops the message rather than stalling the stream.
    pub delivery_timeout: Duration,
    /// Leader-side lease refresh period.
    pub refresh_interval: Duration,
    /// Period of the per-subscription lease watch loop. Jittered per
    /// subscription to avoid thundering re-checks.
    pub check_interval: Duration,
    /// Requested lease TTL. Followers detect a crashed leader after at most
    /// this long.
    pub lease_ttl: Duration,
    /// Consecutive refresh failures a leader tolerates before preemptively
    /// tearing its streams down.
    pub refresh_failure_budget: u32,
    /// Transient survey failures tolerated per subscribe.
    pub survey_retry_budget: u32,
    /// Consecutive store failures tolerated by a subscription's watch loop.
    pub watch_retry_budget: u32,
    /// Transient store failures tolerated per subscribe-path store call.
    pub store_retry_budget: u32,
    /// Time allowed for teardown to unwind. At most one survey timeout.
    pub shutdown_grace: Duration,
}

impl Default for ConfigBuilder {
    fn default() -> Self {
        Self {
            store_timeout: Duration::from_millis(200),
            survey_timeout: Duration::from_secs(1),
            open_timeout: Duration::from_secs(5),
            delivery_timeout: Duration::from_secs(1),
            refresh_interval: Duration::from_secs(3),
            check_interval: Duration::from_secs(1),
            lease_ttl: Duration::from_secs(10),
            refresh_failure_budget: 3,
            survey_retry_budget: 3,
            watch_retry_budget: 3,
            store_retry_budget: 3,
            shutdown_grace: Duration::from_secs(1),
        }
    }
}

impl ConfigBuilder {
    /// Validate the timeout chain and freeze the configuration.
    ///
    /// # Errors
    ///
    /// Returns [`InvalidConfig`] if any duration is zero, any budget is zero,
    /// or the §5 inequality chain does not hold.
    pub fn finish(self) -> Result<Config, InvalidConfig> {
        fn nonzero(name: &str, d: Duration) -> Result<(), InvalidConfig> {
            if d.is_zero() {
                return Err(InvalidConfig(format!("{name} must be nonzero")));
            }
            Ok(())
        }
        nonzero("store_timeout", self.store_timeout)?;
        nonzero("survey_timeout", self.survey_timeout)?;
        nonzero("open_timeout", self.open_timeout)?;
        nonzero("delivery_timeout", self.delivery_timeout)?;
        nonzero("refresh_interval", self.refresh_interval)?;
        nonzero("check_interval", self.check_interval)?;
        nonzero("lease_ttl", self.lease_ttl)?;
        nonzero("shutdown_grace", self.shutdown_grace)?;
        for (name, budget) in [
            ("refresh_failure_budget", self.refresh_failure_budget),
            ("survey_retry_budget", self.survey_retry_budget),
            ("watch_retry_budget", self.watch_retry_budget),
            ("store_retry_budget", self.store_retry_budget),
        ] {
            if budget == 0 {
                return Err(InvalidConfig(format!("{name} must be at least 1")));
            }
        }

        if self.store_timeout > self.survey_timeout {
            return Err(InvalidConfig(
                "store_timeout must not exceed survey_timeout".into(),
            ));
        }
        let refresh_window = self.refresh_interval * self.refresh_failure_budget;
        if self.survey_timeout >= refresh_window {
            return Err(InvalidConfig(
                "survey_timeout must be strictly less than refresh_interval * refresh_failure_budget"
                    .into(),
            ));
        }
        if refresh_window >= self.lease_ttl {
            return Err(InvalidConfig(
                "refresh_interval * refresh_failure_budget must be strictly less than lease_ttl"
                    .into(),
            ));
        }
        if self.lease_ttl < 3 * self.refresh_interval {
            return Err(InvalidConfig(
                "lease_ttl must be at least 3 * refresh_interval".into(),
            ));
        }
        if self.check_interval >= self.lease_ttl {
            return Err(InvalidConfig(
                "check_interval must be strictly less than lease_ttl".into(),
            ));
        }
        if self.shutdown_grace > self.survey_timeout {
            return Err(InvalidConfig(
                "shutdown_grace must not exceed survey_timeout".into(),
            ));
        }
        Ok(Config(self))
    }
}

/// Validated timing configuration; construct via [`ConfigBuilder::finish`].
#[derive(Clone, Debug)]
pub struct Config(ConfigBuilder);

impl Config {
    /// Bound on every single lease-store request.
    #[must_use]
    pub fn store_timeout(&self) -> Duration {
        self.0.store_timeout
    }

    /// Bound on one survey round-trip.
    #[must_use]
    pub fn survey_timeout(&self) -> Duration {
        self.0.survey_timeout
    }

    /// Bound on opening the upstream producer.
    #[must_use]
    pub fn open_timeout(&self) -> Duration {
        self.0.open_timeout
    }

    /// Bound on one outbound delivery.
    #[must_use]
    pub fn delivery_timeout(&self) -> Duration {
        self.0.delivery_timeout
    }

    /// Leader-side lease refresh period.
    #[must_use]
    pub fn refresh_interval(&self) -> Duration {
        self.0.refresh_interval
    }

    /// Period of the per-subscription lease watch loop.
    #[must_use]
    pub fn check_interval(&self) -> Duration {
        self.0.check_interval
    }

    /// Requested lease TTL.
    #[must_use]
    pub fn lease_ttl(&self) -> Duration {
        self.0.lease_ttl
    }

    /// Consecutive refresh failures a leader tolerates before standing down.
    #[must_use]
    pub fn refresh_failure_budget(&self) -> u32 {
        self.0.refresh_failure_budget
    }

    /// Transient survey failures tolerated per subscribe.
    #[must_use]
    pub fn survey_retry_budget(&self) -> u32 {
        self.0.survey_retry_budget
    }

    /// Consecutive store failures tolerated by a subscription's watch loop.
    #[must_use]
    pub fn watch_retry_budget(&self) -> u32 {
        self.0.watch_retry_budget
    }

    /// Transient store failures tolerated per subscribe-path store call.
    #[must_use]
    pub fn store_retry_budget(&self) -> u32 {
        self.0.store_retry_budget
    }

    /// Time allowed for teardown to unwind.
    #[must_use]
    pub fn shutdown_grace(&self) -> Duration {
        self.0.shutdown_grace
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::ConfigBuilder;

    #[test]
    fn default_instantiation_is_valid() {
        ConfigBuilder::default().finish().unwrap();
    }

    #[test]
    fn rejects_store_timeout_above_survey_timeout() {
        let cfg = ConfigBuilder {
            store_timeout: Duration::from_secs(2),
            ..ConfigBuilder::default()
        };
        cfg.finish().unwrap_err();
    }

    #[test]
    fn rejects_refresh_window_reaching_ttl() {
        let cfg = ConfigBuilder {
            refresh_interval: Duration::from_secs(3),
            refresh_failure_budget: 4,
            lease_ttl: Duration::from_secs(10),
            ..ConfigBuilder::default()
        };
        cfg.finish().unwrap_err();
    }

    #[test]
    fn rejects_short_ttl() {
        let cfg = ConfigBuilder {
            lease_ttl: Duration::from_secs(8),
            ..ConfigBuilder::default()
        };
        cfg.finish().unwrap_err();
    }

    #[test]
    fn rejects_zero_budgets() {
        let cfg = ConfigBuilder {
            watch_retry_budget: 0,
            ..ConfigBuilder::default()
        };
        cfg.finish().unwrap_err();
    }

    #[test]
    fn rejects_survey_timeout_reaching_refresh_window() {
        let cfg = ConfigBuilder {
            survey_timeout: Duration::from_secs(9),
            ..ConfigBuilder::default()
        };
        cfg.finish().unwrap_err();
    }
}
