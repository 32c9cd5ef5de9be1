use std::collections::HashMap;
use std::time::Duration;

use rdkafka::config::ClientConfig;
use serde::{Deserialize, Serialize};

/// Security protocol used to reach the brokers.
#[derive(Clone, Eq, PartialEq, Hash, Debug, Serialize, Deserialize)]
pub enum SecurityProtocol {
    #[serde(rename = "sasl_plaintext")]
    SaslPlaintext,
    #[serde(rename = "plaintext")]
    Plaintext,
    #[serde(rename = "sasl_ssl")]
    SaslSsl,
}

impl SecurityProtocol {
    fn as_rdkafka_option(&self) -> &'static str {
        match self {
            SecurityProtocol::SaslPlaintext => "SASL_PLAINTEXT",
            SecurityProtocol::Plaintext => "PLAINTEXT",
            SecurityProtocol::SaslSsl => "SASL_SSL",
        }
    }
}

impl Default for SecurityProtocol {
    fn default() -> SecurityProtocol {
        SecurityProtocol::Plaintext
    }
}

/// Configuration for a [`crate::stream::KafkaStreamAdapter`].
///
/// Grounded on the reference source's `externals/kafka` `CommonConfig`:
/// structured fields cover the common case, and `client_config` is an
/// escape hatch of raw `librdkafka` options that override whatever the
/// structured fields would otherwise produce.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct KafkaConfig {
    pub brokers: Vec<String>,
    pub topics: Vec<String>,
    pub group_id: String,

    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
    #[serde(default)]
    pub security_protocol: SecurityProtocol,
    #[serde(default)]
    pub ssl_ca_location: Option<String>,

    #[serde(default = "KafkaConfig::default_poll_timeout_ms")]
    pub poll_timeout_ms: u64,
    #[serde(default)]
    pub disable_commit: bool,

    /// Raw `librdkafka` options, applied after the structured fields above
    /// so they can override anything this struct would otherwise set.
    #[serde(default)]
    pub client_config: HashMap<String, String>,
}

impl KafkaConfig {
    fn default_poll_timeout_ms() -> u64 {
        1000
    }

    pub fn poll_timeout(&self) -> Duration {
        Duration::from_millis(self.poll_timeout_ms)
    }

    /// Builds the `rdkafka` client configuration this adapter's consumer
    /// (and any DLQ producer sharing the same broker config) should use.
    pub fn to_client_config(&self) -> ClientConfig {
        let mut config = ClientConfig::new();
        config
            .set("bootstrap.servers", self.brokers.join(","))
            .set("group.id", &self.group_id)
            .set("enable.auto.commit", "false")
            .set(
                "security.protocol",
                self.security_protocol.as_rdkafka_option(),
            );

        if let Some(username) = &self.username {
            config.set("sasl.username", username);
        }
        if let Some(password) = &self.password {
            config.set("sasl.password", password);
        }
        if let Some(ca) = &self.ssl_ca_location {
            config.set("ssl.ca.location", ca);
        }

        for (key, value) in &self.client_config {
            config.set(key, value);
        }
        config
    }
}

impl Default for KafkaConfig {
    fn default() -> KafkaConfig {
        KafkaConfig {
            brokers: Vec::new(),
            topics: Vec::new(),
            group_id: String::new(),
            username: None,
            password: None,
            security_protocol: SecurityProtocol::default(),
            ssl_ca_location: None,
            poll_timeout_ms: KafkaConfig::default_poll_timeout_ms(),
            disable_commit: false,
            client_config: HashMap::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_poll_timeout_is_one_second() {
        let config = KafkaConfig::default();
        assert_eq!(config.poll_timeout(), Duration::from_secs(1));
    }

    #[test]
    fn client_config_overrides_apply_last() {
        let mut config = KafkaConfig {
            brokers: vec!["broker-1:9092".to_string()],
            group_id: "orders-consumer".to_string(),
            ..KafkaConfig::default()
        };
        config
            .client_config
            .insert("group.id".to_string(), "overridden-group".to_string());
        let client_config = config.to_client_config();
        assert_eq!(
            client_config.get("group.id"),
            Some("overridden-group")
        );
    }
}
