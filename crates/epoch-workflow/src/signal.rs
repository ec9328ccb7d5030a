//! External input to a running epoch
//!
//! Signals arrive over an mpsc channel and are journaled as they are
//! received. `SignalInbox` adds a deferral queue so a sub-flow can set aside
//! signals that belong to whoever runs next.

use crate::error::WorkflowError;
use crate::history::WorkflowContext;
use epoch_core::EpochId;
use epoch_schema::{PhaseId, ReviewAxis, VoteType};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use tokio::sync::mpsc;

/// Signal channel capacity per epoch
pub const SIGNAL_BUFFER: usize = 64;

/// Input accepted by an epoch flow
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "signal", rename_all = "kebab-case")]
pub enum EpochSignal {
    /// The current phase's work is done
    PhaseComplete {
        triggered_by: String,
        condition: String,
        /// Explicit target; the first forward transition when absent
        target: Option<PhaseId>,
    },
    Vote {
        axis: ReviewAxis,
        vote: VoteType,
    },
    Blockers {
        count: u32,
    },
    Reject {
        reason: String,
    },
    Cancel,
}

/// Sending side of an epoch's signal channel
#[derive(Debug, Clone)]
pub struct EpochHandle {
    epoch_id: EpochId,
    sender: mpsc::Sender<EpochSignal>,
}

impl EpochHandle {
    #[must_use]
    pub fn new(epoch_id: EpochId, sender: mpsc::Sender<EpochSignal>) -> Self {
        Self { epoch_id, sender }
    }

    #[inline]
    #[must_use]
    pub fn epoch_id(&self) -> EpochId {
        self.epoch_id
    }

    /// Deliver a signal
    ///
    /// # Errors
    /// `SignalsClosed` once the flow has finished.
    pub async fn send(&self, signal: EpochSignal) -> Result<(), WorkflowError> {
        self.sender
            .send(signal)
            .await
            .map_err(|_| WorkflowError::SignalsClosed(self.epoch_id))
    }

    /// Report the current phase complete
    ///
    /// # Errors
    /// `SignalsClosed` once the flow has finished.
    pub async fn phase_complete(
        &self,
        triggered_by: impl Into<String>,
        condition: impl Into<String>,
        target: Option<PhaseId>,
    ) -> Result<(), WorkflowError> {
        self.send(EpochSignal::PhaseComplete {
            triggered_by: triggered_by.into(),
            condition: condition.into(),
            target,
        })
        .await
    }

    /// Cast the latest vote on an axis
    ///
    /// # Errors
    /// `SignalsClosed` once the flow has finished.
    pub async fn vote(&self, axis: ReviewAxis, vote: VoteType) -> Result<(), WorkflowError> {
        self.send(EpochSignal::Vote { axis, vote }).await
    }

    /// Set the outstanding blocker count
    ///
    /// # Errors
    /// `SignalsClosed` once the flow has finished.
    pub async fn blockers(&self, count: u32) -> Result<(), WorkflowError> {
        self.send(EpochSignal::Blockers { count }).await
    }

    /// Reject the work under review
    ///
    /// # Errors
    /// `SignalsClosed` once the flow has finished.
    pub async fn reject(&self, reason: impl Into<String>) -> Result<(), WorkflowError> {
        self.send(EpochSignal::Reject {
            reason: reason.into(),
        })
        .await
    }

    /// Abandon the epoch
    ///
    /// # Errors
    /// `SignalsClosed` once the flow has finished.
    pub async fn cancel(&self) -> Result<(), WorkflowError> {
        self.send(EpochSignal::Cancel).await
    }

    /// Whether the flow stopped listening
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.sender.is_closed()
    }

    /// Resolves once the flow stopped listening
    pub async fn closed(&self) {
        self.sender.closed().await;
    }
}

/// Receiving side of an epoch's signal channel
#[derive(Debug)]
pub struct SignalInbox {
    receiver: mpsc::Receiver<EpochSignal>,
    deferred: VecDeque<EpochSignal>,
}

impl SignalInbox {
    #[must_use]
    pub fn new(receiver: mpsc::Receiver<EpochSignal>) -> Self {
        Self {
            receiver,
            deferred: VecDeque::new(),
        }
    }

    /// Channel pair for a new epoch
    #[must_use]
    pub fn channel(epoch_id: EpochId) -> (EpochHandle, Self) {
        let (sender, receiver) = mpsc::channel(SIGNAL_BUFFER);
        (EpochHandle::new(epoch_id, sender), Self::new(receiver))
    }

    /// Next signal: deferred ones first, then the journal, then the channel
    ///
    /// `None` once the channel is closed and nothing is left.
    ///
    /// # Errors
    /// Journal failures.
    pub async fn next(
        &mut self,
        ctx: &mut WorkflowContext,
    ) -> Result<Option<EpochSignal>, WorkflowError> {
        if let Some(signal) = self.deferred.pop_front() {
            return Ok(Some(signal));
        }
        self.next_fresh(ctx).await
    }

    /// Next signal from the journal or the channel, leaving deferred ones
    /// in place
    ///
    /// # Errors
    /// Journal failures.
    pub async fn next_fresh(
        &mut self,
        ctx: &mut WorkflowContext,
    ) -> Result<Option<EpochSignal>, WorkflowError> {
        let receiver = &mut self.receiver;
        ctx.receive(|| receiver.recv()).await
    }

    /// Remove a deferred `Cancel`, if one is waiting
    pub fn take_cancel(&mut self) -> bool {
        match self.deferred.iter().position(|s| *s == EpochSignal::Cancel) {
            Some(index) => {
                self.deferred.remove(index);
                true
            }
            None => false,
        }
    }

    /// Set a signal aside for the next reader
    pub fn defer(&mut self, signal: EpochSignal) {
        self.deferred.push_back(signal);
    }

    /// Signals set aside so far
    #[must_use]
    pub fn deferred(&self) -> usize {
        self.deferred.len()
    }
}
