//! Epoch Core - phase state machine and constraint evaluation
//!
//! Drives one epoch through the protocol defined by a validated
//! `ProtocolSchema`:
//! - `EpochState`: serializable per-epoch protocol state
//! - `ConstraintEvaluator`: pluggable rules plus the built-in clause grammar
//! - `EpochMachine`: the only way to change an epoch's state
//!
//! # Example
//!
//! ```rust,ignore
//! use epoch_core::EpochMachine;
//! use epoch_schema::{canonical, PhaseId};
//!
//! let mut machine = EpochMachine::from_schema(canonical::schema()?);
//! machine.advance(PhaseId::Requirements, "coordinator", "request captured")?;
//! assert_eq!(machine.phase(), PhaseId::Requirements);
//! ```

#![warn(unreachable_pub)]
#![allow(missing_docs)]

pub mod error;
pub mod evaluator;
pub mod machine;
pub mod state;

pub use error::{IllegalTransition, ProtocolError};
pub use evaluator::{
    evaluate, AdvisoryConstraint, Clause, ClauseRule, ConstraintEvaluator, EvaluationContext,
    Rule, UnparsedPredicate, Violation,
};
pub use machine::{EpochMachine, GateStatus};
pub use state::{EpochId, EpochState, TransitionRecord};

/// Prelude module for common imports
pub mod prelude {
    //! Common imports for driving epochs
    pub use crate::{
        ConstraintEvaluator, EpochId, EpochMachine, EpochState, IllegalTransition, ProtocolError,
        Violation,
    };
}

/// Version of this crate
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
