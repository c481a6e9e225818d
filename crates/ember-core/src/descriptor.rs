//! Model descriptors consumed by the session loader

use std::path::PathBuf;
use std::sync::Arc;

use crate::{CacheError, Result};

/// Where the model artifact lives
#[derive(Debug, Clone)]
pub enum ModelSource {
    /// ONNX file or directory on disk
    Path(PathBuf),
    /// Serialized model held in memory
    Memory(Arc<[u8]>),
}

/// Immutable description of a model, sufficient for the loader to build a
/// session. Owned by the cache entry it was registered with.
#[derive(Debug, Clone)]
pub struct ModelDescriptor {
    source: ModelSource,
    options: serde_json::Value,
}

impl ModelDescriptor {
    /// Describe a model stored on disk
    pub fn from_path<P>(path: P) -> Self
    where
        P: Into<PathBuf>,
    {
        Self {
            source: ModelSource::Path(path.into()),
            options: serde_json::Value::Null,
        }
    }

    /// Describe a model held in memory
    pub fn from_bytes<B>(bytes: B) -> Self
    where
        B: Into<Arc<[u8]>>,
    {
        Self {
            source: ModelSource::Memory(bytes.into()),
            options: serde_json::Value::Null,
        }
    }

    /// Attach opaque session options for the loader
    pub fn with_options(mut self, options: serde_json::Value) -> Self {
        self.options = options;
        self
    }

    pub fn source(&self) -> &ModelSource {
        &self.source
    }

    pub fn options(&self) -> &serde_json::Value {
        &self.options
    }

    /// Reject descriptors the loader cannot possibly act on
    pub fn validate(&self) -> Result<()> {
        match &self.source {
            ModelSource::Path(path) if path.as_os_str().is_empty() => Err(CacheError::descriptor(
                "DESCRIPTOR_EMPTY_PATH",
                "model path is empty",
                "Point the descriptor at the ONNX file or directory for this instance",
            )),
            ModelSource::Memory(bytes) if bytes.is_empty() => Err(CacheError::descriptor(
                "DESCRIPTOR_EMPTY_BLOB",
                "in-memory model blob is empty",
                "Pass the serialized model bytes, not an empty buffer",
            )),
            _ => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_path_descriptor_validates() {
        let descriptor = ModelDescriptor::from_path("/models/resnet50/model.onnx");
        assert!(descriptor.validate().is_ok());
        assert!(matches!(descriptor.source(), ModelSource::Path(_)));
    }

    #[test]
    fn test_empty_path_rejected() {
        let descriptor = ModelDescriptor::from_path("");
        let err = descriptor.validate().unwrap_err();
        assert_eq!(err.code(), "DESCRIPTOR_EMPTY_PATH");
    }

    #[test]
    fn test_empty_blob_rejected() {
        let descriptor = ModelDescriptor::from_bytes(Vec::new());
        let err = descriptor.validate().unwrap_err();
        assert_eq!(err.code(), "DESCRIPTOR_EMPTY_BLOB");
    }

    #[test]
    fn test_options_attach() {
        let descriptor = ModelDescriptor::from_bytes(vec![0x08, 0x01])
            .with_options(serde_json::json!({"intra_op_threads": 2}));
        assert_eq!(descriptor.options()["intra_op_threads"], 2);
    }
}
