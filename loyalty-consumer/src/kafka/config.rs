use rdkafka::ClientConfig;

/// Kafka consumer configuration builder.
///
/// Offsets are committed by hand once a message reaches a final outcome, so both
/// automatic commit and automatic offset store are always disabled.
pub struct ConsumerConfigBuilder {
    config: ClientConfig,
}

impl ConsumerConfigBuilder {
    pub fn new(bootstrap_servers: &str, group_id: &str) -> Self {
        let mut config = ClientConfig::new();

        config
            .set("bootstrap.servers", bootstrap_servers)
            .set("group.id", group_id)
            .set("enable.auto.offset.store", "false")
            .set("enable.auto.commit", "false")
            .set("partition.assignment.strategy", "roundrobin")
            .set("socket.timeout.ms", "10000")
            .set("session.timeout.ms", "30000")
            .set("heartbeat.interval.ms", "3000")
            .set("max.poll.interval.ms", "300000");

        Self { config }
    }

    /// Enable TLS/SSL for Kafka connection
    pub fn with_tls(mut self, enabled: bool) -> Self {
        if enabled {
            self.config
                .set("security.protocol", "ssl")
                .set("enable.ssl.certificate.verification", "false");
        }
        self
    }

    /// Where to start when the group has no committed offset for a partition.
    pub fn with_offset_reset(mut self, policy: &str) -> Self {
        self.config.set("auto.offset.reset", policy);
        self
    }

    pub fn build(self) -> ClientConfig {
        self.config
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_manual_commit_defaults() {
        let config = ConsumerConfigBuilder::new("localhost:9092", "loyalty-consumer-group")
            .with_offset_reset("latest")
            .build();

        assert_eq!(config.get("enable.auto.commit"), Some("false"));
        assert_eq!(config.get("enable.auto.offset.store"), Some("false"));
        assert_eq!(config.get("partition.assignment.strategy"), Some("roundrobin"));
        assert_eq!(config.get("group.id"), Some("loyalty-consumer-group"));
        assert_eq!(config.get("auto.offset.reset"), Some("latest"));
        assert_eq!(config.get("security.protocol"), None);
    }

    #[test]
    fn test_tls() {
        let config = ConsumerConfigBuilder::new("localhost:9092", "g")
            .with_tls(true)
            .build();
        assert_eq!(config.get("security.protocol"), Some("ssl"));
    }
}
