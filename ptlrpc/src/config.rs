use std::time::Duration;

use crate::error::ConfigError;

/// Configuration for client endpoints and registries.
#[derive(Clone, Debug)]
pub struct RpcConfig {
    /// How long a sent request waits for its reply before the connection is
    /// marked for recovery.
    pub rpc_timeout: Duration,

    /// Maximum number of simultaneous in-flight calls per client endpoint.
    pub max_rpcs_in_flight: usize,

    /// Bucket count of registry hash tables. Must be a power of two.
    pub registry_hash_size: u32,
}

impl Default for RpcConfig {
    fn default() -> Self {
        Self {
            rpc_timeout: Duration::from_secs(100),
            max_rpcs_in_flight: 32,
            registry_hash_size: 128,
        }
    }
}

impl RpcConfig {
    /// Create a new configuration with specified parameters.
    pub fn new(rpc_timeout: Duration, max_rpcs_in_flight: usize) -> Self {
        Self {
            rpc_timeout,
            max_rpcs_in_flight,
            ..Self::default()
        }
    }

    /// Set the RPC timeout.
    pub fn with_rpc_timeout(mut self, timeout: Duration) -> Self {
        self.rpc_timeout = timeout;
        self
    }

    /// Set the in-flight bound.
    pub fn with_max_rpcs_in_flight(mut self, max: usize) -> Self {
        self.max_rpcs_in_flight = max;
        self
    }

    /// Set the registry hash size.
    pub fn with_registry_hash_size(mut self, size: u32) -> Self {
        self.registry_hash_size = size;
        self
    }

    /// Create a configuration for low-latency local networking.
    pub fn local_network() -> Self {
        Self {
            rpc_timeout: Duration::from_secs(5),
            max_rpcs_in_flight: 32,
            registry_hash_size: 64,
        }
    }

    /// Create a configuration for high-latency WAN networking.
    pub fn wan_network() -> Self {
        Self {
            rpc_timeout: Duration::from_secs(300),
            max_rpcs_in_flight: 8,
            registry_hash_size: 256,
        }
    }

    /// Check that the values can drive an endpoint.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.rpc_timeout.is_zero() {
            return Err(ConfigError::ZeroTimeout);
        }
        if self.max_rpcs_in_flight == 0 {
            return Err(ConfigError::ZeroInFlight);
        }
        if !self.registry_hash_size.is_power_of_two() {
            return Err(ConfigError::HashSize(self.registry_hash_size));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = RpcConfig::default();
        assert_eq!(config.rpc_timeout, Duration::from_secs(100));
        assert_eq!(config.max_rpcs_in_flight, 32);
        assert_eq!(config.registry_hash_size, 128);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_presets_validate() {
        assert!(RpcConfig::local_network().validate().is_ok());
        assert!(RpcConfig::wan_network().validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        assert_eq!(
            RpcConfig::default()
                .with_rpc_timeout(Duration::ZERO)
                .validate(),
            Err(ConfigError::ZeroTimeout)
        );
        assert_eq!(
            RpcConfig::default().with_max_rpcs_in_flight(0).validate(),
            Err(ConfigError::ZeroInFlight)
        );
        assert_eq!(
            RpcConfig::default().with_registry_hash_size(100).validate(),
            Err(ConfigError::HashSize(100))
        );
        assert_eq!(
            RpcConfig::default().with_registry_hash_size(0).validate(),
            Err(ConfigError::HashSize(0))
        );
    }
}
