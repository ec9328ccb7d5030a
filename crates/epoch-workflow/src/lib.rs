//! Epoch Workflow - durable orchestration of epochs
//!
//! Runs epochs as long-lived, resumable flows on top of `epoch-core`:
//! - Journaled activities with retry and backoff
//! - Signals for phase completion, votes, blockers, rejection and cancel
//! - Parallel slice fan-out with a join barrier
//! - Review sub-flow deciding gated phases
//! - Hash-chained audit trail
//! - `Worker` hosting named flows and activities on a task queue
//! - JSON-lines command protocol for driving a worker from outside
//!
//! # Example
//!
//! ```rust,ignore
//! use epoch_schema::canonical;
//! use epoch_workflow::{Worker, WorkerOptions};
//!
//! let worker = Worker::new(WorkerOptions::default(), canonical::schema()?)
//!     .with_slices(runner);
//! let epoch = worker.start_epoch()?;
//! epoch.phase_complete("coordinator", "request captured", None).await?;
//! ```

#![warn(unreachable_pub)]
#![allow(missing_docs)]

pub mod activities;
pub mod audit;
pub mod command;
pub mod epoch;
pub mod error;
pub mod history;
pub mod retry;
pub mod review;
pub mod signal;
pub mod slice;
pub mod worker;

pub use activities::{
    ActivityHandler, ActivityRegistry, EpochActivities, TransitionLedger, ACTIVITY_NAMES,
};
pub use audit::{AuditError, AuditEvent, AuditEventKind, AuditSink, InMemoryAuditSink};
pub use command::{WorkerCommand, WorkerReply};
pub use epoch::{EpochOutcome, EpochRun};
pub use error::{ActivityError, WorkflowError};
pub use history::{HistoryEvent, HistoryStore, InMemoryHistory, WorkflowContext};
pub use retry::RetryPolicy;
pub use review::ReviewOutcome;
pub use signal::{EpochHandle, EpochSignal, SignalInbox};
pub use slice::{SliceId, SliceOutcome, SliceResult, SliceRunner, SliceSpec};
pub use worker::{
    FlowHandler, FlowRequest, Worker, WorkerOptions, EPOCH_FLOW, REVIEW_FLOW, SLICE_FLOW,
};

/// Prelude module for common imports
pub mod prelude {
    //! Common imports for hosting epochs
    pub use crate::{
        ActivityError, EpochHandle, EpochOutcome, FlowRequest, RetryPolicy, SliceResult,
        SliceRunner, SliceSpec, Worker, WorkerCommand, WorkerOptions, WorkerReply,
        WorkflowError,
    };
}

/// Version of this crate
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
