//! Per-batch id collision handling.

use std::collections::HashSet;
use std::fmt::{Display, Formatter};
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::domain::PersistedRecord;
use crate::ValidationError;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum DuplicatePolicy {
    /// Rename the later record to `{id}_{n}`.
    #[default]
    AppendSuffix,
    /// Discard the later record.
    Drop,
}

impl DuplicatePolicy {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::AppendSuffix => "append-suffix",
            Self::Drop => "drop",
        }
    }
}

impl Display for DuplicatePolicy {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DuplicatePolicy {
    type Err = ValidationError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "append-suffix" | "append_suffix" | "add" => Ok(Self::AppendSuffix),
            "drop" | "ignore" => Ok(Self::Drop),
            other => Err(ValidationError::InvalidDuplicatePolicy {
                value: other.to_owned(),
            }),
        }
    }
}

/// Makes ids unique within one batch, walking records in arrival order.
#[derive(Debug, Clone, Copy)]
pub struct DuplicateResolver {
    policy: DuplicatePolicy,
}

impl DuplicateResolver {
    pub const fn new(policy: DuplicatePolicy) -> Self {
        Self { policy }
    }

    /// The collision counter `n` is shared by the whole batch and starts at 1.
    pub fn resolve(&self, batch: Vec<PersistedRecord>) -> Vec<PersistedRecord> {
        let mut seen = HashSet::with_capacity(batch.len());
        let mut collisions = 0_usize;
        let mut resolved = Vec::with_capacity(batch.len());

        for mut record in batch {
            if seen.contains(&record.id) {
                match self.policy {
                    DuplicatePolicy::Drop => {
                        debug!(id = %record.id, "dropping duplicate record");
                        continue;
                    }
                    DuplicatePolicy::AppendSuffix => {
                        let original = record.id.clone();
                        loop {
                            collisions += 1;
                            let candidate = format!("{original}_{collisions}");
                            if !seen.contains(&candidate) {
                                record.id = candidate;
                                break;
                            }
                        }
                        debug!(from = %original, to = %record.id, "renamed duplicate record");
                    }
                }
            }

            seen.insert(record.id.clone());
            resolved.push(record);
        }

        resolved
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    fn record(id: &str) -> PersistedRecord {
        PersistedRecord {
            id: id.to_string(),
            entity_id: String::from("E"),
            code: String::from("e"),
            timestamp: None,
            level: None,
            fields: BTreeMap::new(),
        }
    }

    fn ids(records: &[PersistedRecord]) -> Vec<&str> {
        records.iter().map(|record| record.id.as_str()).collect()
    }

    #[test]
    fn append_suffix_keeps_both() {
        let resolved = DuplicateResolver::new(DuplicatePolicy::AppendSuffix)
            .resolve(vec![record("X"), record("X")]);
        assert_eq!(ids(&resolved), vec!["X", "X_1"]);
    }

    #[test]
    fn drop_keeps_first() {
        let resolved =
            DuplicateResolver::new(DuplicatePolicy::Drop).resolve(vec![record("X"), record("X")]);
        assert_eq!(ids(&resolved), vec!["X"]);
    }

    #[test]
    fn counter_is_shared_across_the_batch() {
        let resolved = DuplicateResolver::new(DuplicatePolicy::AppendSuffix).resolve(vec![
            record("X"),
            record("X"),
            record("Y"),
            record("Y"),
            record("X"),
        ]);
        assert_eq!(ids(&resolved), vec!["X", "X_1", "Y", "Y_2", "X_3"]);
    }

    #[test]
    fn suffix_skips_ids_already_in_the_batch() {
        let resolved = DuplicateResolver::new(DuplicatePolicy::AppendSuffix)
            .resolve(vec![record("X_1"), record("X"), record("X")]);
        assert_eq!(ids(&resolved), vec!["X_1", "X", "X_2"]);
    }

    #[test]
    fn parses_policy_aliases() {
        assert_eq!("add".parse::<DuplicatePolicy>(), Ok(DuplicatePolicy::AppendSuffix));
        assert_eq!("drop".parse::<DuplicatePolicy>(), Ok(DuplicatePolicy::Drop));
        assert!("keep".parse::<DuplicatePolicy>().is_err());
    }
}
