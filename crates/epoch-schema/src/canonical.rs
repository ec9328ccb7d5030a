//! Bundled canonical protocol
//!
//! The 12-phase protocol ships inside the crate so every binary and test
//! agrees on one definition without touching the filesystem.

use crate::document::SchemaDocument;
use crate::error::{SchemaError, SchemaLoadError};
use crate::protocol::ProtocolSchema;
use once_cell::sync::OnceCell;
use std::sync::Arc;

/// Source text of the canonical protocol
pub const SOURCE: &str = include_str!("../schemas/epoch-protocol.yaml");

static SCHEMA: OnceCell<Arc<ProtocolSchema>> = OnceCell::new();

/// Fresh, mutable copy of the canonical document
///
/// # Errors
/// Only if the bundled source stops parsing.
pub fn document() -> Result<SchemaDocument, SchemaLoadError> {
    SchemaDocument::from_yaml_str(SOURCE)
}

/// Validated canonical schema, built once per process
///
/// # Errors
/// Only if the bundled source stops parsing or validating.
pub fn schema() -> Result<Arc<ProtocolSchema>, SchemaError> {
    SCHEMA
        .get_or_try_init(|| {
            let schema = ProtocolSchema::from_yaml_str(SOURCE)?;
            tracing::debug!(
                "Canonical protocol '{}' v{} loaded",
                schema.name(),
                schema.version()
            );
            Ok(Arc::new(schema))
        })
        .cloned()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn schema_is_shared() {
        let a = schema().unwrap();
        let b = schema().unwrap();
        assert!(Arc::ptr_eq(&a, &b));
    }

    #[test]
    fn document_copies_are_independent() {
        let mut first = document().unwrap();
        first.phases.clear();
        assert_eq!(document().unwrap().phases.len(), 12);
    }
}
