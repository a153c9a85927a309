//! Node configuration

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::time::Duration;

use crate::error::MixnetError;
use crate::messages::NodeName;

/// Services a node installs at startup
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ServiceConfig {
    KeyGeneration,
    Board,
    Shuffle,
    Decryption,
    Signing,
}

impl ServiceConfig {
    pub fn all() -> Vec<ServiceConfig> {
        vec![
            ServiceConfig::KeyGeneration,
            ServiceConfig::Board,
            ServiceConfig::Shuffle,
            ServiceConfig::Decryption,
            ServiceConfig::Signing,
        ]
    }
}

/// Runtime configuration for one node
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct NodeConfig {
    /// Unique node name
    pub name: NodeName,

    /// Size of the shared worker pool
    pub max_concurrent_tasks: usize,

    /// Backoff between attempts to deliver a share to an unreachable peer
    pub share_retry_interval_ms: u64,

    /// Delay before re-processing a STORE that arrived ahead of GENERATE
    pub store_retry_interval_ms: u64,

    /// Backoff while a shuffle hop waits for its input
    pub shuffle_retry_interval_ms: u64,

    /// Upper bound on attempts per retry chain; `None` retries until shutdown
    pub max_retry_attempts: Option<u32>,

    /// Services installed, in dispatch order
    pub services: Vec<ServiceConfig>,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            name: String::new(),
            max_concurrent_tasks: 5,
            share_retry_interval_ms: 2000,
            store_retry_interval_ms: 1000,
            shuffle_retry_interval_ms: 500,
            max_retry_attempts: None,
            services: ServiceConfig::all(),
        }
    }
}

impl NodeConfig {
    /// Default configuration for the named node with every service installed
    pub fn new(name: impl Into<NodeName>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }

    pub fn with_retry_intervals(mut self, share: Duration, store: Duration) -> Self {
        self.share_retry_interval_ms = share.as_millis() as u64;
        self.store_retry_interval_ms = store.as_millis() as u64;
        self.shuffle_retry_interval_ms = store.as_millis() as u64;
        self
    }

    pub fn share_retry_interval(&self) -> Duration {
        Duration::from_millis(self.share_retry_interval_ms)
    }

    pub fn store_retry_interval(&self) -> Duration {
        Duration::from_millis(self.store_retry_interval_ms)
    }

    pub fn shuffle_retry_interval(&self) -> Duration {
        Duration::from_millis(self.shuffle_retry_interval_ms)
    }

    pub fn validate(&self) -> Result<(), MixnetError> {
        if self.name.trim().is_empty() {
            return Err(MixnetError::InvalidParameter(
                "node name must not be empty".to_string(),
            ));
        }
        if self.max_concurrent_tasks == 0 {
            return Err(MixnetError::InvalidParameter(
                "max_concurrent_tasks must be at least 1".to_string(),
            ));
        }
        if self.share_retry_interval_ms == 0
            || self.store_retry_interval_ms == 0
            || self.shuffle_retry_interval_ms == 0
        {
            return Err(MixnetError::InvalidParameter(
                "retry intervals must be non-zero".to_string(),
            ));
        }
        if self.max_retry_attempts == Some(0) {
            return Err(MixnetError::InvalidParameter(
                "max_retry_attempts must be at least 1 when set".to_string(),
            ));
        }

        let mut seen = HashSet::new();
        for service in &self.services {
            if !seen.insert(service) {
                return Err(MixnetError::InvalidParameter(format!(
                    "service {:?} configured twice",
                    service
                )));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = NodeConfig::new("A");
        assert_eq!(config.max_concurrent_tasks, 5);
        assert_eq!(config.share_retry_interval(), Duration::from_secs(2));
        assert_eq!(config.store_retry_interval(), Duration::from_secs(1));
        assert_eq!(config.max_retry_attempts, None);
        assert_eq!(config.services.len(), 5);
        config.validate().unwrap();
    }

    #[test]
    fn test_validation() {
        assert!(NodeConfig::default().validate().is_err());

        let mut config = NodeConfig::new("A");
        config.max_concurrent_tasks = 0;
        assert!(config.validate().is_err());

        let mut config = NodeConfig::new("A");
        config.services = vec![ServiceConfig::Board, ServiceConfig::Board];
        assert!(config.validate().is_err());

        let mut config = NodeConfig::new("A");
        config.max_retry_attempts = Some(0);
        assert!(config.validate().is_err());
    }
}
