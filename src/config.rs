use crate::connection::config::ConnectionConfig;
use crate::core::{Result, StoreError};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Entity cache settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Lifetime of a cached snapshot.
    pub ttl_secs: u64,
    /// Maximum number of cached snapshots.
    pub capacity: usize,
}

impl CacheConfig {
    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl_secs)
    }
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            ttl_secs: 15,
            capacity: 4096,
        }
    }
}

/// Everything a `Store` needs besides its schema and connector.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    pub connection: ConnectionConfig,
    pub cache: CacheConfig,
    /// Single-row counter table that hands out logical ids.
    pub id_counter_table: String,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            connection: ConnectionConfig::default(),
            cache: CacheConfig::default(),
            id_counter_table: "oids".to_string(),
        }
    }
}

impl StoreConfig {
    pub fn new(connection: ConnectionConfig) -> Self {
        Self {
            connection,
            ..Self::default()
        }
    }

    pub fn from_json(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json)
            .map_err(|e| StoreError::Configuration(format!("invalid store config: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        self.connection.validate().map_err(StoreError::Configuration)?;
        if self.cache.capacity == 0 {
            return Err(StoreError::Configuration("cache capacity must be > 0".into()));
        }
        if self.id_counter_table.is_empty() {
            return Err(StoreError::Configuration("id counter table cannot be empty".into()));
        }
        Ok(())
    }
}
