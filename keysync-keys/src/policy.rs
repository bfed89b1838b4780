//! Rotation timing
// Copyright 2025 Francisco F. Pinochet
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.


use chrono::{DateTime, Duration, Utc};
use keysync_types::KeyEntry;

use crate::error::{KeyError, KeyResult};

/// Outcome of evaluating the policy against a repository
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RotationDecision {
    Due,
    NotDue { remaining: Duration },
    /// No staging key (or no timestamp on it): the repository is not set up
    Unevaluable,
}

/// When to rotate the token-signing keys.
///
/// The staging key (index 0) is promoted on every rotation, so its age is the
/// time since the last rotation. Rotation interval:
///
/// ```text
/// token_expiration / (max_active_keys - 2)      (floor division)
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RotationPolicy {
    token_expiration_secs: i64,
    max_active_keys: u32,
}

impl RotationPolicy {
    pub const MIN_ACTIVE_KEYS: u32 = 3;

    pub fn new(token_expiration_secs: i64, max_active_keys: u32) -> KeyResult<Self> {
        if max_active_keys < Self::MIN_ACTIVE_KEYS {
            return Err(KeyError::Configuration(format!(
                "max_active_keys must be at least {} (got {})",
                Self::MIN_ACTIVE_KEYS,
                max_active_keys
            )));
        }
        Ok(Self {
            token_expiration_secs,
            max_active_keys,
        })
    }

    pub fn token_expiration_secs(&self) -> i64 {
        self.token_expiration_secs
    }

    pub fn max_active_keys(&self) -> u32 {
        self.max_active_keys
    }

    pub fn rotation_interval_secs(&self) -> i64 {
        self.token_expiration_secs
            .div_euclid(i64::from(self.max_active_keys) - 2)
    }

    /// Rotation interval as a duration, saturating at `Duration::MAX`
    pub fn rotation_interval(&self) -> Duration {
        Duration::try_seconds(self.rotation_interval_secs()).unwrap_or(Duration::MAX)
    }

    /// Operators set a non-positive expiration to force rotation on demand
    pub fn is_forced(&self) -> bool {
        self.token_expiration_secs <= 0
    }

    pub fn is_rotation_due(&self, staging_age: Duration) -> bool {
        self.is_forced() || staging_age >= self.rotation_interval()
    }

    /// Evaluate against the current staging key
    pub fn evaluate(&self, staging: Option<&KeyEntry>, now: DateTime<Utc>) -> RotationDecision {
        let Some(last_modified) = staging.and_then(|entry| entry.last_modified) else {
            return RotationDecision::Unevaluable;
        };

        let age = now - last_modified;
        if self.is_rotation_due(age) {
            RotationDecision::Due
        } else {
            let remaining = self
                .rotation_interval()
                .checked_sub(&age)
                .unwrap_or(Duration::MAX);
            RotationDecision::NotDue { remaining }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn staging_at(last_modified: DateTime<Utc>) -> KeyEntry {
        KeyEntry::new(0, "staging").with_last_modified(last_modified)
    }

    #[test]
    fn test_interval_formula() {
        assert_eq!(RotationPolicy::new(3600, 3).unwrap().rotation_interval_secs(), 3600);
        assert_eq!(RotationPolicy::new(3600, 4).unwrap().rotation_interval_secs(), 1800);
        assert_eq!(RotationPolicy::new(3600, 5).unwrap().rotation_interval_secs(), 1200);
        assert_eq!(RotationPolicy::new(100, 5).unwrap().rotation_interval_secs(), 33);
    }

    #[test]
    fn test_rejects_too_few_active_keys() {
        assert!(matches!(
            RotationPolicy::new(3600, 2),
            Err(KeyError::Configuration(_))
        ));
    }

    #[test]
    fn test_due_boundary() {
        let policy = RotationPolicy::new(3600, 3).unwrap();
        assert!(!policy.is_rotation_due(Duration::seconds(3599)));
        assert!(policy.is_rotation_due(Duration::seconds(3600)));
        assert!(policy.is_rotation_due(Duration::seconds(7200)));
    }

    #[test]
    fn test_non_positive_expiration_forces_rotation() {
        for expiration in [-1, 0] {
            let policy = RotationPolicy::new(expiration, 3).unwrap();
            assert!(policy.is_forced());
            assert!(policy.is_rotation_due(Duration::zero()));
            // Even a staging key stamped in the future
            assert!(policy.is_rotation_due(Duration::seconds(-30)));
        }
    }

    #[test]
    fn test_evaluate() {
        let policy = RotationPolicy::new(3600, 3).unwrap();
        let now = Utc::now();

        assert_eq!(
            policy.evaluate(Some(&staging_at(now - Duration::seconds(3600))), now),
            RotationDecision::Due
        );
        assert_eq!(
            policy.evaluate(Some(&staging_at(now - Duration::seconds(3599))), now),
            RotationDecision::NotDue {
                remaining: Duration::seconds(1)
            }
        );
    }

    #[test]
    fn test_huge_expiration_saturates() {
        let policy = RotationPolicy::new(10_000_000_000_000_000, 3).unwrap();
        let now = Utc::now();

        assert_eq!(policy.rotation_interval(), Duration::MAX);
        assert!(!policy.is_rotation_due(Duration::seconds(3600)));
        assert!(matches!(
            policy.evaluate(Some(&staging_at(now)), now),
            RotationDecision::NotDue { .. }
        ));
        // Staging key stamped in the future
        assert_eq!(
            policy.evaluate(Some(&staging_at(now + Duration::seconds(30))), now),
            RotationDecision::NotDue {
                remaining: Duration::MAX
            }
        );
    }

    #[test]
    fn test_missing_staging_key_is_unevaluable() {
        let policy = RotationPolicy::new(-1, 3).unwrap();
        assert_eq!(policy.evaluate(None, Utc::now()), RotationDecision::Unevaluable);
        assert_eq!(
            policy.evaluate(Some(&KeyEntry::new(0, "no timestamp")), Utc::now()),
            RotationDecision::Unevaluable
        );
    }
}
