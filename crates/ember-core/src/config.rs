//! Configuration for the warm-session cache

use serde::{Deserialize, Serialize};

use crate::{CacheError, Result};

/// Default bound on concurrently loaded sessions
pub const DEFAULT_MAX_LOADED: usize = 4;

/// Configuration for a [`WarmCache`](crate::warm_cache::WarmCache)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WarmCacheConfig {
    /// Maximum number of sessions kept loaded at once
    pub max_loaded: usize,

    /// Disable the cache entirely: every entry loads eagerly at registration
    /// and is never evicted. Intended for A/B comparison and as an emergency
    /// fallback.
    pub skip_warm_cache: bool,
}

impl Default for WarmCacheConfig {
    fn default() -> Self {
        Self {
            max_loaded: DEFAULT_MAX_LOADED,
            skip_warm_cache: false,
        }
    }
}

impl WarmCacheConfig {
    /// Validate the configuration before constructing a cache
    pub fn validate(&self) -> Result<()> {
        if self.max_loaded == 0 {
            return Err(CacheError::configuration(
                "CONFIG_MAX_LOADED_ZERO",
                "max_loaded must be at least 1",
                "Set max_loaded to the number of sessions the device memory can hold",
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        let config = WarmCacheConfig::default();
        assert_eq!(config.max_loaded, DEFAULT_MAX_LOADED);
        assert!(!config.skip_warm_cache);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_zero_max_loaded_rejected() {
        let config = WarmCacheConfig {
            max_loaded: 0,
            ..Default::default()
        };
        let err = config.validate().unwrap_err();
        assert_eq!(err.code(), "CONFIG_MAX_LOADED_ZERO");
    }

    #[test]
    fn test_config_roundtrips_through_json() {
        let config = WarmCacheConfig {
            max_loaded: 2,
            skip_warm_cache: true,
        };
        let json = serde_json::to_string(&config).unwrap();
        let parsed: WarmCacheConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed.max_loaded, 2);
        assert!(parsed.skip_warm_cache);
    }
}
