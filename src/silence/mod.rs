//! Rule silencing.
//!
//! A silence suppresses a rule's alerts until a point in time. Entries are
//! kept in memory for the lifetime of the server and dropped lazily once
//! they expire.

use std::collections::HashMap;
use std::fmt;

use chrono::{DateTime, TimeDelta, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::RwLock;
use tracing::{debug, info};

#[derive(Debug, Error, PartialEq, Eq)]
pub enum SilenceError {
    #[error("rule path must not be empty")]
    EmptyPath,

    #[error("duration must be at least 1, got {0}")]
    DurationTooShort(u64),

    #[error("silence of {duration} {unit} is out of range")]
    OutOfRange { unit: SilenceUnit, duration: u64 },
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SilenceUnit {
    Seconds,
    #[default]
    Minutes,
    Hours,
    Days,
    Weeks,
}

impl SilenceUnit {
    fn seconds(self) -> i64 {
        match self {
            SilenceUnit::Seconds => 1,
            SilenceUnit::Minutes => 60,
            SilenceUnit::Hours => 60 * 60,
            SilenceUnit::Days => 24 * 60 * 60,
            SilenceUnit::Weeks => 7 * 24 * 60 * 60,
        }
    }
}

impl fmt::Display for SilenceUnit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SilenceUnit::Seconds => "seconds",
            SilenceUnit::Minutes => "minutes",
            SilenceUnit::Hours => "hours",
            SilenceUnit::Days => "days",
            SilenceUnit::Weeks => "weeks",
        };
        f.write_str(s)
    }
}

/// Request body for silencing a rule.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SilenceOptions {
    pub unit: SilenceUnit,
    pub duration: u64,
}

impl Default for SilenceOptions {
    fn default() -> Self {
        Self {
            unit: SilenceUnit::Minutes,
            duration: 1,
        }
    }
}

impl SilenceOptions {
    pub fn validate(&self) -> Result<(), SilenceError> {
        if self.duration < 1 {
            return Err(SilenceError::DurationTooShort(self.duration));
        }
        Ok(())
    }

    fn span(&self) -> Result<TimeDelta, SilenceError> {
        let out_of_range = || SilenceError::OutOfRange {
            unit: self.unit,
            duration: self.duration,
        };
        let secs = i64::try_from(self.duration)
            .ok()
            .and_then(|d| d.checked_mul(self.unit.seconds()))
            .ok_or_else(out_of_range)?;
        TimeDelta::try_seconds(secs).ok_or_else(out_of_range)
    }
}

/// An active silence.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Silence {
    pub path: String,
    pub unit: SilenceUnit,
    pub duration: u64,
    pub until: DateTime<Utc>,
}

#[derive(Debug, Default)]
pub struct SilenceRegistry {
    entries: RwLock<HashMap<String, Silence>>,
}

impl SilenceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Silence the rule at `path`, replacing any existing silence for it.
    /// Returns a one-line confirmation.
    pub async fn silence_rule(
        &self,
        path: &str,
        options: &SilenceOptions,
    ) -> Result<String, SilenceError> {
        self.silence_rule_at(path, options, Utc::now()).await
    }

    pub(crate) async fn silence_rule_at(
        &self,
        path: &str,
        options: &SilenceOptions,
        now: DateTime<Utc>,
    ) -> Result<String, SilenceError> {
        if path.trim().is_empty() {
            return Err(SilenceError::EmptyPath);
        }
        options.validate()?;
        let until = now
            .checked_add_signed(options.span()?)
            .ok_or(SilenceError::OutOfRange {
                unit: options.unit,
                duration: options.duration,
            })?;

        let silence = Silence {
            path: path.to_string(),
            unit: options.unit,
            duration: options.duration,
            until,
        };
        self.entries.write().await.insert(path.to_string(), silence);

        info!(path, until = %until.to_rfc3339(), "rule silenced");
        Ok(format!(
            "Silenced rule {path} for {} {} until {}",
            options.duration,
            options.unit,
            until.to_rfc3339()
        ))
    }

    /// Active silences, ordered by rule path.
    pub async fn active(&self) -> Vec<Silence> {
        self.active_at(Utc::now()).await
    }

    pub(crate) async fn active_at(&self, now: DateTime<Utc>) -> Vec<Silence> {
        self.prune(now).await;
        let mut list: Vec<Silence> = self.entries.read().await.values().cloned().collect();
        list.sort_by(|a, b| a.path.cmp(&b.path));
        list
    }

    async fn prune(&self, now: DateTime<Utc>) {
        let mut entries = self.entries.write().await;
        let before = entries.len();
        entries.retain(|_, s| s.until > now);
        let pruned = before - entries.len();
        if pruned > 0 {
            debug!(pruned, "expired silences removed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn at(rfc3339: &str) -> DateTime<Utc> {
        DateTime::parse_from_rfc3339(rfc3339).unwrap().with_timezone(&Utc)
    }

    #[test]
    fn test_options_defaults() {
        let opts: SilenceOptions = serde_json::from_str("{}").unwrap();
        assert_eq!(opts.unit, SilenceUnit::Minutes);
        assert_eq!(opts.duration, 1);

        let opts: SilenceOptions = serde_json::from_str(r#"{"unit":"weeks"}"#).unwrap();
        assert_eq!(opts.unit, SilenceUnit::Weeks);
        assert_eq!(opts.duration, 1);
    }

    #[test]
    fn test_options_reject_bad_input() {
        assert!(serde_json::from_str::<SilenceOptions>(r#"{"unit":"months"}"#).is_err());
        assert!(serde_json::from_str::<SilenceOptions>(r#"{"duration":-1}"#).is_err());
        assert!(serde_json::from_str::<SilenceOptions>(r#"{"until":"later"}"#).is_err());

        let zero: SilenceOptions = serde_json::from_str(r#"{"duration":0}"#).unwrap();
        assert_eq!(zero.validate(), Err(SilenceError::DurationTooShort(0)));
    }

    #[tokio::test]
    async fn test_silence_until_and_confirmation() {
        let registry = SilenceRegistry::new();
        let now = at("2024-03-01T12:00:00Z");
        let opts = SilenceOptions {
            unit: SilenceUnit::Hours,
            duration: 2,
        };

        let line = registry
            .silence_rule_at("prod/cpu.yaml", &opts, now)
            .await
            .unwrap();
        assert_eq!(
            line,
            "Silenced rule prod/cpu.yaml for 2 hours until 2024-03-01T14:00:00+00:00"
        );

        let active = registry.active_at(now).await;
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].until, at("2024-03-01T14:00:00Z"));
    }

    #[tokio::test]
    async fn test_expired_silences_are_pruned() {
        let registry = SilenceRegistry::new();
        let now = at("2024-03-01T12:00:00Z");
        registry
            .silence_rule_at("a.yaml", &SilenceOptions::default(), now)
            .await
            .unwrap();
        registry
            .silence_rule_at(
                "b.yaml",
                &SilenceOptions {
                    unit: SilenceUnit::Days,
                    duration: 1,
                },
                now,
            )
            .await
            .unwrap();

        let later = at("2024-03-01T12:05:00Z");
        let paths: Vec<String> = registry
            .active_at(later)
            .await
            .into_iter()
            .map(|s| s.path)
            .collect();
        assert_eq!(paths, vec!["b.yaml"]);
    }

    #[tokio::test]
    async fn test_resilencing_replaces_entry() {
        let registry = SilenceRegistry::new();
        let now = at("2024-03-01T12:00:00Z");
        registry
            .silence_rule_at("a.yaml", &SilenceOptions::default(), now)
            .await
            .unwrap();
        registry
            .silence_rule_at(
                "a.yaml",
                &SilenceOptions {
                    unit: SilenceUnit::Seconds,
                    duration: 10,
                },
                now,
            )
            .await
            .unwrap();

        let active = registry.active_at(now).await;
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].unit, SilenceUnit::Seconds);
    }

    #[tokio::test]
    async fn test_invalid_requests() {
        let registry = SilenceRegistry::new();
        let now = Utc::now();

        assert_eq!(
            registry.silence_rule_at(" ", &SilenceOptions::default(), now).await,
            Err(SilenceError::EmptyPath)
        );
        let huge = SilenceOptions {
            unit: SilenceUnit::Weeks,
            duration: u64::MAX,
        };
        assert!(matches!(
            registry.silence_rule_at("a.yaml", &huge, now).await,
            Err(SilenceError::OutOfRange { .. })
        ));
        assert!(registry.active_at(now).await.is_empty());
    }
}
