//! Error types for protocol schemas
//!
//! Two families, deliberately separate:
//! - `SchemaLoadError`: the document could not be read or parsed at all
//! - `TypedError`: the document parsed but is internally inconsistent.
//!   These are data, returned by the validator, never raised.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;

/// Errors while reading a schema document
#[derive(Debug, thiserror::Error)]
pub enum SchemaLoadError {
    /// IO error during file read
    #[error("io error reading {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// YAML syntax error
    #[error("yaml syntax error: {0}")]
    Yaml(String),

    /// JSON syntax error
    #[error("json syntax error: {0}")]
    Json(String),

    /// No loader for the file extension
    #[error("no schema loader for extension: '{0}'")]
    UnsupportedExtension(String),
}

impl SchemaLoadError {
    /// Create IO error for path
    pub fn io_error(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }
}

/// Validation layer that detected a defect
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Layer {
    /// A required attribute is absent
    Structural,
    /// A cross-reference does not resolve
    Referential,
    /// A protocol rule beyond syntax is broken
    Semantic,
}

impl fmt::Display for Layer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Layer::Structural => f.write_str("structural"),
            Layer::Referential => f.write_str("referential"),
            Layer::Semantic => f.write_str("semantic"),
        }
    }
}

/// One schema defect
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TypedError {
    /// Layer assigned at detection time
    pub layer: Layer,
    /// Human-readable description
    pub message: String,
    /// Offending element id
    pub element: String,
}

impl TypedError {
    /// Structural defect
    pub fn structural(element: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(Layer::Structural, element, message)
    }

    /// Referential defect
    pub fn referential(element: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(Layer::Referential, element, message)
    }

    /// Semantic defect
    pub fn semantic(element: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(Layer::Semantic, element, message)
    }

    fn new(layer: Layer, element: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            layer,
            message: message.into(),
            element: element.into(),
        }
    }
}

impl fmt::Display for TypedError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}: {}", self.layer, self.element, self.message)
    }
}

/// A document failed validation and cannot become a trusted schema
#[derive(Debug, Clone, thiserror::Error)]
#[error("schema rejected with {} defect(s)", .errors.len())]
pub struct SchemaRejected {
    /// Every defect found, in layer order
    pub errors: Vec<TypedError>,
}

impl SchemaRejected {
    /// Defects detected by one layer
    pub fn in_layer(&self, layer: Layer) -> impl Iterator<Item = &TypedError> {
        self.errors.iter().filter(move |e| e.layer == layer)
    }
}

/// Any failure turning source text into a trusted schema
#[derive(Debug, thiserror::Error)]
pub enum SchemaError {
    /// Document could not be read or parsed
    #[error(transparent)]
    Load(#[from] SchemaLoadError),

    /// Document parsed but failed validation
    #[error(transparent)]
    Rejected(#[from] SchemaRejected),
}
