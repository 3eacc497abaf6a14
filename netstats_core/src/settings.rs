//! Tunables for polling, bucketing and retention
//!
//! Every field has a default, so an empty document is a valid
//! configuration.

use byte_unit::Byte;
use serde::Deserialize;

const HOUR: u64 = 60 * 60;
const DAY: u64 = 24 * HOUR;

fn default_poll_interval_seconds() -> u64 {
    30 * 60
}

fn default_time_cache_max_age_seconds() -> u64 {
    DAY
}

fn default_sample_enabled() -> bool {
    true
}

fn default_persist_threshold() -> Byte {
    Byte::from_u64(2 * 1024 * 1024)
}

/// Default value for the interface-level dimensions
#[must_use]
pub fn default_dev_config() -> DimensionConfig {
    DimensionConfig {
        bucket_duration_seconds: HOUR,
        rotate_age_seconds: 15 * DAY,
        delete_age_seconds: 90 * DAY,
        persist_bytes: None,
    }
}

/// Default value for the per-owner dimension
#[must_use]
pub fn default_uid_config() -> DimensionConfig {
    DimensionConfig {
        bucket_duration_seconds: 2 * HOUR,
        rotate_age_seconds: 15 * DAY,
        delete_age_seconds: 90 * DAY,
        persist_bytes: None,
    }
}

/// Default value for the per-owner-and-tag dimension
#[must_use]
pub fn default_uid_tag_config() -> DimensionConfig {
    DimensionConfig {
        bucket_duration_seconds: 2 * HOUR,
        rotate_age_seconds: 5 * DAY,
        delete_age_seconds: 15 * DAY,
        persist_bytes: None,
    }
}

fn seconds_to_ms(seconds: u64) -> i64 {
    i64::try_from(seconds.saturating_mul(1000)).unwrap_or(i64::MAX)
}

/// Bucketing and retention of one accounting dimension
#[derive(Debug, Clone, Copy, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct DimensionConfig {
    /// Width of each history bucket
    pub bucket_duration_seconds: u64,
    /// Age after which the active segment is closed
    pub rotate_age_seconds: u64,
    /// Age after which closed segments are deleted
    pub delete_age_seconds: u64,
    /// Pending bytes that trigger a persist, overriding
    /// [`Settings::persist_threshold`]
    #[serde(default)]
    pub persist_bytes: Option<Byte>,
}

impl DimensionConfig {
    /// Bucket width in milliseconds
    #[must_use]
    pub fn bucket_duration_ms(&self) -> i64 {
        seconds_to_ms(self.bucket_duration_seconds)
    }

    /// Rotate age in milliseconds
    #[must_use]
    pub fn rotate_age_ms(&self) -> i64 {
        seconds_to_ms(self.rotate_age_seconds)
    }

    /// Delete age in milliseconds
    #[must_use]
    pub fn delete_age_ms(&self) -> i64 {
        seconds_to_ms(self.delete_age_seconds)
    }
}

/// Service-wide settings
#[derive(Debug, Clone, Copy, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct Settings {
    /// Period of the poll alarm
    #[serde(default = "default_poll_interval_seconds")]
    pub poll_interval_seconds: u64,
    /// Trusted time older than this is refreshed before polling
    #[serde(default = "default_time_cache_max_age_seconds")]
    pub time_cache_max_age_seconds: u64,
    /// Emit a coarse usage sample after each poll
    #[serde(default = "default_sample_enabled")]
    pub sample_enabled: bool,
    /// Bytes after which the global alert fires, defaulting to the persist
    /// threshold
    #[serde(default)]
    pub global_alert_bytes: Option<Byte>,
    /// Pending bytes that trigger a persist in every dimension without its
    /// own override
    #[serde(default = "default_persist_threshold")]
    pub persist_threshold: Byte,
    /// Interface-level counters
    #[serde(default = "default_dev_config")]
    pub dev: DimensionConfig,
    /// Interface-level counters as reported per identity
    #[serde(default = "default_dev_config")]
    pub xt: DimensionConfig,
    /// Per-owner counters
    #[serde(default = "default_uid_config")]
    pub uid: DimensionConfig,
    /// Per-owner tagged counters
    #[serde(default = "default_uid_tag_config")]
    pub uid_tag: DimensionConfig,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            poll_interval_seconds: default_poll_interval_seconds(),
            time_cache_max_age_seconds: default_time_cache_max_age_seconds(),
            sample_enabled: default_sample_enabled(),
            global_alert_bytes: None,
            persist_threshold: default_persist_threshold(),
            dev: default_dev_config(),
            xt: default_dev_config(),
            uid: default_uid_config(),
            uid_tag: default_uid_tag_config(),
        }
    }
}

impl Settings {
    /// Time cache max age in milliseconds
    #[must_use]
    pub fn time_cache_max_age_ms(&self) -> i64 {
        seconds_to_ms(self.time_cache_max_age_seconds)
    }

    /// The global alert threshold, falling back to `persist_threshold`
    #[must_use]
    pub fn global_alert_bytes(&self, persist_threshold: u64) -> u64 {
        self.global_alert_bytes
            .map_or(persist_threshold, |b| b.as_u64())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_document_gives_defaults() {
        let settings: Settings = serde_yaml::from_str("{}").unwrap();
        assert_eq!(settings, Settings::default());
        assert_eq!(settings.dev.bucket_duration_ms(), 3_600_000);
        assert_eq!(settings.uid_tag.delete_age_ms(), 15 * 86_400_000);
        assert_eq!(settings.persist_threshold.as_u64(), 2 * 1024 * 1024);
        assert_eq!(settings.global_alert_bytes(42), 42);
    }

    #[test]
    fn byte_quantities_parse_with_units() {
        let contents = r#"
poll_interval_seconds: 60
persist_threshold: "512 KiB"
global_alert_bytes: "1 MiB"
uid:
  bucket_duration_seconds: 3600
  rotate_age_seconds: 86400
  delete_age_seconds: 172800
  persist_bytes: "64 KiB"
"#;
        let settings: Settings = serde_yaml::from_str(contents).unwrap();
        assert_eq!(settings.poll_interval_seconds, 60);
        assert_eq!(settings.persist_threshold.as_u64(), 512 * 1024);
        assert_eq!(settings.global_alert_bytes(0), 1024 * 1024);
        assert_eq!(settings.uid.persist_bytes.map(|b| b.as_u64()), Some(64 * 1024));
        assert_eq!(settings.xt, default_dev_config());
    }

    #[test]
    fn unknown_fields_are_rejected() {
        assert!(serde_yaml::from_str::<Settings>("polling: 5").is_err());
    }
}
