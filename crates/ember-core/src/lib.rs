//! Ember Core - Warm-session cache for ONNX model serving
//!
//! This crate provides the admission and eviction engine that sits between a
//! model-serving host and its heavyweight inference sessions. The host may
//! register many model instances, but only a bounded number of sessions stay
//! loaded at once; reservations pin a session against eviction while it
//! serves a request.

// Module declarations
pub mod config;
pub mod descriptor;
pub mod loader;
pub mod warm_cache;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum CacheError {
    /// Key collisions during registration
    #[error("Registry error [{code}]: duplicate key '{key}'\nSuggestion: {suggestion}")]
    DuplicateKey {
        code: &'static str,
        key: String,
        suggestion: String,
    },

    /// Session construction failures reported by the loader
    #[error("Load error [{code}]: {message}\nModel: {name}\nSuggestion: {suggestion}")]
    Load {
        code: &'static str,
        name: String,
        message: String,
        suggestion: String,
        #[source]
        source: Option<anyhow::Error>,
    },

    /// Descriptor validation errors, caught before the loader runs
    #[error("Descriptor error [{code}]: {message}\nSuggestion: {suggestion}")]
    Descriptor {
        code: &'static str,
        message: String,
        suggestion: String,
    },

    /// Configuration validation errors
    #[error("Configuration error [{code}]: {message}\nSuggestion: {suggestion}")]
    Configuration {
        code: &'static str,
        message: String,
        suggestion: String,
    },

    /// Other unexpected errors
    #[error("Internal error [{code}]: {message}")]
    Internal {
        code: &'static str,
        message: String,
        #[source]
        source: Option<anyhow::Error>,
    },
}

pub type Result<T> = std::result::Result<T, CacheError>;

impl CacheError {
    /// Create a duplicate-key registration error
    pub fn duplicate_key<S>(key: S) -> Self
    where
        S: Into<String>,
    {
        Self::DuplicateKey {
            code: "REGISTRY_DUPLICATE_KEY",
            key: key.into(),
            suggestion: "Unregister the existing entry first or use a unique instance name"
                .to_string(),
        }
    }

    /// Create a load error without an underlying cause
    pub fn load<S1, S2>(name: S1, message: S2) -> Self
    where
        S1: Into<String>,
        S2: Into<String>,
    {
        Self::Load {
            code: "LOAD_FAILED",
            name: name.into(),
            message: message.into(),
            suggestion: "Check the model descriptor and the loader logs, then reserve again"
                .to_string(),
            source: None,
        }
    }

    /// Create a load error carrying the loader's underlying cause
    pub fn load_with_source<S1, S2>(name: S1, message: S2, source: anyhow::Error) -> Self
    where
        S1: Into<String>,
        S2: Into<String>,
    {
        Self::Load {
            code: "LOAD_FAILED",
            name: name.into(),
            message: message.into(),
            suggestion: "Check the model descriptor and the loader logs, then reserve again"
                .to_string(),
            source: Some(source),
        }
    }

    /// Create a descriptor validation error
    pub fn descriptor<S1, S2>(code: &'static str, message: S1, suggestion: S2) -> Self
    where
        S1: Into<String>,
        S2: Into<String>,
    {
        Self::Descriptor {
            code,
            message: message.into(),
            suggestion: suggestion.into(),
        }
    }

    /// Create a configuration validation error
    pub fn configuration<S1, S2>(code: &'static str, message: S1, suggestion: S2) -> Self
    where
        S1: Into<String>,
        S2: Into<String>,
    {
        Self::Configuration {
            code,
            message: message.into(),
            suggestion: suggestion.into(),
        }
    }

    /// Get the error code for programmatic handling
    pub fn code(&self) -> &'static str {
        match self {
            Self::DuplicateKey { code, .. } => code,
            Self::Load { code, .. } => code,
            Self::Descriptor { code, .. } => code,
            Self::Configuration { code, .. } => code,
            Self::Internal { code, .. } => code,
        }
    }
}

impl From<anyhow::Error> for CacheError {
    fn from(err: anyhow::Error) -> Self {
        Self::Internal {
            code: "INTERNAL_UNKNOWN",
            message: err.to_string(),
            source: Some(err),
        }
    }
}

/// Prelude module for common imports
pub mod prelude {
    pub use crate::{
        config::WarmCacheConfig,
        descriptor::{ModelDescriptor, ModelSource},
        loader::SessionLoader,
        warm_cache::{EntryHandle, Reservation, WarmCache, WarmCacheStats},
        CacheError, Result,
    };
}

// Re-export key types at the crate root
pub use config::WarmCacheConfig;
pub use descriptor::{ModelDescriptor, ModelSource};
pub use loader::SessionLoader;
pub use warm_cache::{EntryHandle, Reservation, WarmCache, WarmCacheStats};
