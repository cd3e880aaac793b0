//! Cache configuration.
//!
//! Defaults for resources that do not set their own freshness and deletion
//! windows. Can be read from a settings blob with serde:
//!
//! ```json
//! { "default_stale_after_ms": 10000, "default_delete_after_ms": 60000 }
//! ```

use std::time::Duration;

use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// Default freshness window.
pub const DEFAULT_STALE_AFTER: Duration = Duration::from_secs(5);

/// Default time an unobserved entry is kept before deletion.
pub const DEFAULT_DELETE_AFTER: Duration = Duration::from_secs(5 * 60);

/// Defaults applied by a [`ResourceCache`](crate::cache::ResourceCache).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// How long a loaded value stays fresh.
    #[serde(rename = "default_stale_after_ms", with = "millis")]
    pub default_stale_after: Duration,

    /// How long an entry with no subscribers survives.
    #[serde(rename = "default_delete_after_ms", with = "millis")]
    pub default_delete_after: Duration,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            default_stale_after: DEFAULT_STALE_AFTER,
            default_delete_after: DEFAULT_DELETE_AFTER,
        }
    }
}

impl CacheConfig {
    pub fn with_stale_after(mut self, stale_after: Duration) -> Self {
        self.default_stale_after = stale_after;
        self
    }

    pub fn with_delete_after(mut self, delete_after: Duration) -> Self {
        self.default_delete_after = delete_after;
        self
    }
}

mod millis {
    use super::*;

    pub fn serialize<S: Serializer>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        let millis = u64::try_from(duration.as_millis()).unwrap_or(u64::MAX);
        serializer.serialize_u64(millis)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn defaults() {
        let config = CacheConfig::default();
        assert_eq!(config.default_stale_after, Duration::from_secs(5));
        assert_eq!(config.default_delete_after, Duration::from_secs(300));
    }

    #[test]
    fn reads_millisecond_fields() {
        let config: CacheConfig = serde_json::from_value(json!({
            "default_stale_after_ms": 100,
            "default_delete_after_ms": 250,
        }))
        .unwrap();
        assert_eq!(config.default_stale_after, Duration::from_millis(100));
        assert_eq!(config.default_delete_after, Duration::from_millis(250));
    }

    #[test]
    fn missing_fields_fall_back_to_defaults() {
        let config: CacheConfig = serde_json::from_value(json!({ "default_stale_after_ms": 1 })).unwrap();
        assert_eq!(config.default_stale_after, Duration::from_millis(1));
        assert_eq!(config.default_delete_after, DEFAULT_DELETE_AFTER);
    }

    #[test]
    fn round_trips_through_json() {
        let config = CacheConfig::default().with_stale_after(Duration::from_millis(42));
        let json = serde_json::to_value(config).unwrap();
        assert_eq!(json["default_stale_after_ms"], 42);
    }
}
