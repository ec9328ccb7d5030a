//! Epoch Schema - protocol definition and validation
//!
//! Everything needed to trust a protocol definition before an epoch runs
//! on it:
//! - Protocol vocabulary (phases, domains, roles, axes, votes)
//! - Schema documents loaded from YAML or JSON
//! - Three-layer validation (structural, referential, semantic)
//! - `ProtocolSchema`, the immutable validated form
//! - The bundled canonical 12-phase protocol
//!
//! # Example
//!
//! ```rust,ignore
//! use epoch_schema::{canonical, validate, PhaseId};
//!
//! let doc = canonical::document()?;
//! assert!(validate(&doc).is_empty());
//!
//! let schema = canonical::schema()?;
//! assert_eq!(schema.first_phase(), PhaseId::Intake);
//! ```

#![warn(unreachable_pub)]
#![allow(missing_docs)]

pub mod canonical;
pub mod document;
pub mod error;
pub mod protocol;
pub mod types;
pub mod validator;

pub use document::{
    ConstraintDoc, EnumBlock, GateDoc, HandoffDoc, PhaseDoc, RoleDoc, SchemaDocument,
    TransitionDoc,
};
pub use error::{Layer, SchemaError, SchemaLoadError, SchemaRejected, TypedError};
pub use protocol::{ConstraintSpec, Gate, HandoffSpec, PhaseSpec, ProtocolSchema, Transition};
pub use types::{
    ContentLevel, Domain, PhaseId, ReviewAxis, RoleId, Severity, TransitionKind,
    UnknownIdentifier, VoteType,
};
pub use validator::{validate, SchemaValidator};

/// Prelude module for common imports
pub mod prelude {
    //! Common imports for working with protocol schemas
    pub use crate::{
        PhaseId, ProtocolSchema, ReviewAxis, RoleId, SchemaDocument, Severity, TypedError,
        VoteType,
    };
}

/// Version of this crate
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
