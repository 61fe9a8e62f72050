use std::{str::FromStr, time::Duration};

use serde::{Deserialize, Serialize};

use crate::RetryPolicy;

/// Per-connection settings.
///
/// ```toml
/// response-capacity = 16
/// response-retry-interval = 500
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct ConnectionConfig {
    /// Two-way requests that may wait for a response at once; also the largest request id used.
    pub response_capacity: u32,
    /// Interval at which responses to incoming requests are resent until the transport accepts
    /// them.
    #[serde(with = "millis")]
    pub response_retry_interval: Duration,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        ConnectionConfig {
            response_capacity: 32,
            response_retry_interval: Duration::from_millis(200),
        }
    }
}

impl ConnectionConfig {
    pub fn with_response_capacity(mut self, capacity: u32) -> Self {
        self.response_capacity = capacity.max(1);
        self
    }

    pub fn with_response_retry_interval(mut self, interval: Duration) -> Self {
        self.response_retry_interval = interval;
        self
    }

    pub fn response_retry_policy(&self) -> RetryPolicy {
        RetryPolicy::retry_indefinitely(self.response_retry_interval, Duration::ZERO)
    }
}

impl FromStr for ConnectionConfig {
    type Err = toml::de::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        toml::from_str(s)
    }
}

mod millis {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(duration.as_millis().try_into().unwrap_or(u64::MAX))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_partial_toml() {
        let config: ConnectionConfig = "response-capacity = 4".parse().unwrap();
        assert_eq!(config.response_capacity, 4);
        assert_eq!(config.response_retry_interval, Duration::from_millis(200));
    }

    #[test]
    fn test_parse_full_toml() {
        let config: ConnectionConfig = "response-capacity = 2\nresponse-retry-interval = 1500"
            .parse()
            .unwrap();
        assert_eq!(
            config,
            ConnectionConfig::default()
                .with_response_capacity(2)
                .with_response_retry_interval(Duration::from_millis(1500))
        );
        assert!(config.response_retry_policy().is_unlimited());
    }

    #[test]
    fn test_unknown_types_rejected() {
        assert!("response-capacity = \"many\"".parse::<ConnectionConfig>().is_err());
    }
}
