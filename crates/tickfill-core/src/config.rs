//! Sync run configuration.

use std::fmt::{Display, Formatter};
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::dedup::DuplicatePolicy;
use crate::{CoreError, ValidationError};

/// What a failed adapter or store call holds back.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum FailureScope {
    /// Abandon the cycle; every unfinished entity is retried next cycle.
    #[default]
    RetryAll,
    /// Only the failing entity stays pending; the cycle continues.
    IsolateEntity,
}

impl FailureScope {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::RetryAll => "retry-all",
            Self::IsolateEntity => "isolate-entity",
        }
    }
}

impl Display for FailureScope {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for FailureScope {
    type Err = ValidationError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "retry-all" | "retry_all" => Ok(Self::RetryAll),
            "isolate-entity" | "isolate_entity" => Ok(Self::IsolateEntity),
            other => Err(ValidationError::InvalidFailureScope {
                value: other.to_owned(),
            }),
        }
    }
}

/// Knobs of one sync run. Every field has a default; durations are written
/// as seconds in config files.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// Entities handled between progress log lines.
    pub batch_size: usize,
    /// Overwrite records that already exist.
    pub force_update: bool,
    /// Pause after each entity's fetch, and after a failed cycle.
    #[serde(with = "secs")]
    pub pacing: Duration,
    /// Window size when there is no usable latest record.
    pub default_size: usize,
    /// Fetch each entity at most once.
    pub one_shot: bool,
    pub duplicate_policy: DuplicatePolicy,
    /// Drop a same-day last bar that may still be forming.
    pub trim_unfinished_period: bool,
    #[serde(with = "secs")]
    pub adapter_timeout: Duration,
    pub failure_scope: FailureScope,
    /// Stop after this many cycles even if entities remain unfinished.
    pub max_cycles: Option<usize>,
    /// Bars are stamped with their open time rather than their close.
    pub bar_timestamp_is_open: bool,
    /// Margin after session close before a same-day bar counts as final.
    #[serde(with = "secs")]
    pub unfinished_grace: Duration,
    /// Open-period waits longer than this trigger a backoff sleep.
    #[serde(with = "secs")]
    pub backoff_threshold: Duration,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            batch_size: 10,
            force_update: false,
            pacing: Duration::from_secs(5),
            default_size: 2000,
            one_shot: false,
            duplicate_policy: DuplicatePolicy::AppendSuffix,
            trim_unfinished_period: false,
            adapter_timeout: Duration::from_secs(30),
            failure_scope: FailureScope::RetryAll,
            max_cycles: None,
            bar_timestamp_is_open: false,
            unfinished_grace: Duration::from_secs(120),
            backoff_threshold: Duration::from_secs(30),
        }
    }
}

impl SyncConfig {
    /// Load from a JSON file; missing keys keep their defaults.
    pub fn from_json_file(path: &Path) -> Result<Self, CoreError> {
        let raw = std::fs::read_to_string(path)?;
        let config: Self = serde_json::from_str(&raw)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.batch_size == 0 {
            return Err(ValidationError::NonPositive { field: "batch_size" });
        }
        if self.default_size == 0 {
            return Err(ValidationError::NonPositive { field: "default_size" });
        }
        if self.adapter_timeout.is_zero() {
            return Err(ValidationError::NonPositive { field: "adapter_timeout" });
        }
        if self.max_cycles == Some(0) {
            return Err(ValidationError::NonPositive { field: "max_cycles" });
        }
        Ok(())
    }

    #[must_use]
    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size;
        self
    }

    #[must_use]
    pub fn with_force_update(mut self, force_update: bool) -> Self {
        self.force_update = force_update;
        self
    }

    #[must_use]
    pub fn with_pacing(mut self, pacing: Duration) -> Self {
        self.pacing = pacing;
        self
    }

    #[must_use]
    pub fn with_default_size(mut self, default_size: usize) -> Self {
        self.default_size = default_size;
        self
    }

    #[must_use]
    pub fn with_one_shot(mut self, one_shot: bool) -> Self {
        self.one_shot = one_shot;
        self
    }

    #[must_use]
    pub fn with_duplicate_policy(mut self, policy: DuplicatePolicy) -> Self {
        self.duplicate_policy = policy;
        self
    }

    #[must_use]
    pub fn with_trim_unfinished_period(mut self, trim: bool) -> Self {
        self.trim_unfinished_period = trim;
        self
    }

    #[must_use]
    pub fn with_adapter_timeout(mut self, timeout: Duration) -> Self {
        self.adapter_timeout = timeout;
        self
    }

    #[must_use]
    pub fn with_failure_scope(mut self, scope: FailureScope) -> Self {
        self.failure_scope = scope;
        self
    }

    #[must_use]
    pub fn with_max_cycles(mut self, max_cycles: Option<usize>) -> Self {
        self.max_cycles = max_cycles;
        self
    }

    #[must_use]
    pub fn with_bar_timestamp_is_open(mut self, is_open: bool) -> Self {
        self.bar_timestamp_is_open = is_open;
        self
    }

    #[must_use]
    pub fn with_unfinished_grace(mut self, grace: Duration) -> Self {
        self.unfinished_grace = grace;
        self
    }

    #[must_use]
    pub fn with_backoff_threshold(mut self, threshold: Duration) -> Self {
        self.backoff_threshold = threshold;
        self
    }
}

mod secs {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_f64(value.as_secs_f64())
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let seconds = f64::deserialize(deserializer)?;
        Duration::try_from_secs_f64(seconds).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let config = SyncConfig::default();
        assert_eq!(config.batch_size, 10);
        assert!(!config.force_update);
        assert_eq!(config.pacing, Duration::from_secs(5));
        assert_eq!(config.default_size, 2000);
        assert_eq!(config.duplicate_policy, DuplicatePolicy::AppendSuffix);
        assert_eq!(config.failure_scope, FailureScope::RetryAll);
        assert_eq!(config.unfinished_grace, Duration::from_secs(120));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn partial_json_keeps_defaults() {
        let config: SyncConfig = serde_json::from_str(
            r#"{"pacing": 0.5, "duplicate_policy": "drop", "failure_scope": "isolate-entity"}"#,
        )
        .expect("config");
        assert_eq!(config.pacing, Duration::from_millis(500));
        assert_eq!(config.duplicate_policy, DuplicatePolicy::Drop);
        assert_eq!(config.failure_scope, FailureScope::IsolateEntity);
        assert_eq!(config.default_size, 2000);
    }

    #[test]
    fn zero_sizes_are_rejected() {
        let err = SyncConfig::default().with_default_size(0).validate().expect_err("invalid");
        assert_eq!(err, ValidationError::NonPositive { field: "default_size" });
    }
}
