//! Schema documents
//!
//! The untrusted, as-authored form of a protocol definition. Every attribute
//! is optional at this level: presence is checked by the structural layer of
//! the validator, not by the deserializer, so a document with missing fields
//! still loads and yields a full defect report.

use crate::error::SchemaLoadError;
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Root of a protocol schema document
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct SchemaDocument {
    /// Protocol name
    pub name: Option<String>,
    /// Document version
    pub version: Option<u32>,
    /// Enumeration blocks
    pub enums: EnumBlock,
    /// Declared roles
    pub roles: Vec<RoleDoc>,
    /// Declared phases, in document order
    pub phases: Vec<PhaseDoc>,
    /// Protocol constraints
    pub constraints: Vec<ConstraintDoc>,
    /// Cross-role handoff points
    pub handoffs: Vec<HandoffDoc>,
}

/// Enumeration blocks (domain types, vote types, severity levels, review axes)
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct EnumBlock {
    pub domains: Vec<String>,
    pub vote_types: Vec<String>,
    pub severities: Vec<String>,
    pub review_axes: Vec<String>,
    pub content_levels: Vec<String>,
}

/// `<role id>` element
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct RoleDoc {
    pub id: Option<String>,
    pub description: Option<String>,
}

/// `<phase id number domain>` element
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct PhaseDoc {
    pub id: Option<String>,
    pub number: Option<u8>,
    pub domain: Option<String>,
    pub name: Option<String>,
    /// Owning roles
    pub roles: Option<Vec<String>>,
    /// Whether the phase fans out into concurrent slices
    pub fan_out: bool,
    pub transitions: Vec<TransitionDoc>,
}

/// `<transition to-phase condition action>` element
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct TransitionDoc {
    pub to: Option<String>,
    pub condition: Option<String>,
    pub action: Option<String>,
    /// `forward` (default) or `revision`
    pub kind: Option<String>,
    pub gate: Option<GateDoc>,
}

/// Consensus gate attached to a transition
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct GateDoc {
    pub axes: Option<Vec<String>>,
    pub zero_blockers: bool,
}

/// `<constraint id given when then>` element
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct ConstraintDoc {
    pub id: Option<String>,
    pub given: Option<String>,
    pub when: Option<String>,
    pub then: Option<String>,
    pub severity: Option<String>,
}

/// `<handoff id source-role target-role at-phase content-level>` element
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct HandoffDoc {
    pub id: Option<String>,
    pub source_role: Option<String>,
    pub target_role: Option<String>,
    pub at_phase: Option<String>,
    pub content_level: Option<String>,
}

impl SchemaDocument {
    /// Parse a YAML document
    ///
    /// # Errors
    /// `Yaml` when the text is not a well-formed document.
    pub fn from_yaml_str(source: &str) -> Result<Self, SchemaLoadError> {
        serde_yaml::from_str(source).map_err(|e| SchemaLoadError::Yaml(e.to_string()))
    }

    /// Parse a JSON document
    ///
    /// # Errors
    /// `Json` when the text is not a well-formed document.
    pub fn from_json_str(source: &str) -> Result<Self, SchemaLoadError> {
        serde_json::from_str(source).map_err(|e| SchemaLoadError::Json(e.to_string()))
    }

    /// Load a document from disk, dispatching on the file extension
    ///
    /// `.yaml` / `.yml` and `.json` are supported.
    ///
    /// # Errors
    /// `Io` when the file cannot be read, `UnsupportedExtension` for any
    /// other extension, and the parser's error for malformed content.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, SchemaLoadError> {
        let path = path.as_ref();
        let extension = path
            .extension()
            .and_then(|e| e.to_str())
            .unwrap_or_default()
            .to_ascii_lowercase();

        let source = std::fs::read_to_string(path)
            .map_err(|e| SchemaLoadError::io_error(path, e))?;

        tracing::debug!("Loading schema document from {}", path.display());

        match extension.as_str() {
            "yaml" | "yml" => Self::from_yaml_str(&source),
            "json" => Self::from_json_str(&source),
            other => Err(SchemaLoadError::UnsupportedExtension(other.to_string())),
        }
    }

    /// Serialize back to YAML
    ///
    /// # Errors
    /// `Yaml` when serialization fails.
    pub fn to_yaml_string(&self) -> Result<String, SchemaLoadError> {
        serde_yaml::to_string(self).map_err(|e| SchemaLoadError::Yaml(e.to_string()))
    }

    /// Find a phase element by declared id
    #[must_use]
    pub fn phase(&self, id: &str) -> Option<&PhaseDoc> {
        self.phases.iter().find(|p| p.id.as_deref() == Some(id))
    }

    /// Mutable access to a phase element by declared id
    pub fn phase_mut(&mut self, id: &str) -> Option<&mut PhaseDoc> {
        self.phases.iter_mut().find(|p| p.id.as_deref() == Some(id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_fields_still_deserialize() {
        let doc = SchemaDocument::from_yaml_str(
            "phases:\n  - id: intake\n    transitions:\n      - to: requirements\n",
        )
        .unwrap();

        let intake = doc.phase("intake").unwrap();
        assert_eq!(intake.number, None);
        assert_eq!(intake.domain, None);
        assert_eq!(intake.transitions[0].to.as_deref(), Some("requirements"));
    }

    #[test]
    fn kebab_case_keys() {
        let doc = SchemaDocument::from_yaml_str(
            "handoffs:\n  - id: H1\n    source-role: architect\n    target-role: reviewer\n    at-phase: plan-review\n    content-level: full-provenance\n",
        )
        .unwrap();

        let handoff = &doc.handoffs[0];
        assert_eq!(handoff.source_role.as_deref(), Some("architect"));
        assert_eq!(handoff.content_level.as_deref(), Some("full-provenance"));
    }

    #[test]
    fn json_documents_load() {
        let doc =
            SchemaDocument::from_json_str(r#"{"name": "p", "enums": {"review-axes": ["a"]}}"#)
                .unwrap();
        assert_eq!(doc.enums.review_axes, vec!["a".to_string()]);
    }

    #[test]
    fn syntax_errors_are_load_errors() {
        let result = SchemaDocument::from_yaml_str("phases: [unclosed");
        assert!(matches!(result, Err(SchemaLoadError::Yaml(_))));
    }
}
