//! Broker configuration

use std::time::Duration;

/// Tuning knobs for a broker instance
#[derive(Debug, Clone)]
pub struct BrokerConfig {
    /// Minimum interval between deliveries to one paced client.
    ///
    /// Requests whose last-seen timestamp is closer than this to the current
    /// frame are deferred to the next cycle. The default is roughly half of
    /// one 30 fps frame period.
    pub delivery_threshold: Duration,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            delivery_threshold: Duration::from_millis(16),
        }
    }
}

impl BrokerConfig {
    /// Set the minimum inter-delivery interval for paced clients
    pub fn delivery_threshold(mut self, threshold: Duration) -> Self {
        self.delivery_threshold = threshold;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_threshold() {
        let config = BrokerConfig::default();
        assert_eq!(config.delivery_threshold, Duration::from_millis(16));
    }

    #[test]
    fn test_builder() {
        let config = BrokerConfig::default().delivery_threshold(Duration::from_millis(33));
        assert_eq!(config.delivery_threshold, Duration::from_millis(33));
    }
}
