//! Line-oriented command protocol
//!
//! A worker takes one JSON object per line and answers with one JSON object
//! per line:
//!
//! ```text
//! {"command":"start"}
//! {"reply":"started","epoch_id":"01J...","flow":"epoch"}
//! {"command":"signal","epoch_id":"01J...","signal":{"signal":"cancel"}}
//! {"reply":"delivered","epoch_id":"01J..."}
//! {"command":"wait","epoch_id":"01J..."}
//! {"reply":"finished","epoch_id":"01J...","completed":false,"phase":"intake","transitions":0}
//! ```
//!
//! `serve_lines` answers every command in order except `wait`, whose reply
//! is written once the epoch finishes so later commands are not held up.

use crate::error::WorkflowError;
use crate::signal::EpochSignal;
use crate::worker::{FlowRequest, Worker, EPOCH_FLOW};
use epoch_core::{EpochId, EpochState};
use epoch_schema::PhaseId;
use futures::stream::{FuturesUnordered, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt};

/// One request to a worker
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "command", rename_all = "kebab-case")]
pub enum WorkerCommand {
    /// Start a flow; the epoch flow when `flow` is absent
    Start {
        #[serde(default)]
        flow: Option<String>,
        #[serde(default)]
        epoch_id: Option<EpochId>,
        #[serde(default)]
        state: Option<EpochState>,
    },
    /// Deliver a signal to a running epoch
    Signal {
        epoch_id: EpochId,
        signal: EpochSignal,
    },
    /// Run one activity by name
    Activity {
        name: String,
        #[serde(default)]
        input: Value,
    },
    /// Block until an epoch finishes
    Wait { epoch_id: EpochId },
    /// List hosted epochs
    Running,
}

/// Answer to one command
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "reply", rename_all = "kebab-case")]
pub enum WorkerReply {
    Started {
        epoch_id: EpochId,
        flow: String,
    },
    Delivered {
        epoch_id: EpochId,
    },
    Output {
        activity: String,
        output: Value,
    },
    Finished {
        epoch_id: EpochId,
        completed: bool,
        phase: PhaseId,
        transitions: usize,
    },
    Running {
        epochs: Vec<EpochId>,
    },
    Error {
        message: String,
    },
}

impl From<WorkflowError> for WorkerReply {
    fn from(err: WorkflowError) -> Self {
        Self::Error {
            message: err.to_string(),
        }
    }
}

impl Worker {
    /// Carry out one command
    pub async fn execute(&self, command: WorkerCommand) -> WorkerReply {
        let reply = match command {
            WorkerCommand::Start {
                flow,
                epoch_id,
                state,
            } => {
                let flow = flow.unwrap_or_else(|| EPOCH_FLOW.to_string());
                self.start_flow(&flow, FlowRequest { epoch_id, state })
                    .map(|handle| WorkerReply::Started {
                        epoch_id: handle.epoch_id(),
                        flow,
                    })
            }
            WorkerCommand::Signal { epoch_id, signal } => self.signal(epoch_id, signal).await,
            WorkerCommand::Activity { name, input } => self
                .run_activity(&name, input)
                .await
                .map(|output| WorkerReply::Output {
                    activity: name,
                    output,
                }),
            WorkerCommand::Wait { epoch_id } => {
                self.wait(epoch_id).await.map(|outcome| WorkerReply::Finished {
                    epoch_id,
                    completed: outcome.is_completed(),
                    phase: outcome.state().phase,
                    transitions: outcome.state().history.len(),
                })
            }
            WorkerCommand::Running => Ok(WorkerReply::Running {
                epochs: self.running(),
            }),
        };

        reply.unwrap_or_else(|err| {
            tracing::warn!("Command failed: {}", err);
            err.into()
        })
    }

    /// Parse one JSON line, carry it out and render the reply as one line
    pub async fn execute_line(&self, line: &str) -> String {
        let reply = match parse_command(line) {
            Ok(command) => self.execute(command).await,
            Err(reply) => reply,
        };
        render(&reply)
    }

    /// Answer commands from `input` until it closes and every pending `wait`
    /// has been answered; returns how many replies were written
    ///
    /// # Errors
    /// Reading `input` or writing `output` failed.
    pub async fn serve_lines<R, W>(&self, input: R, mut output: W) -> std::io::Result<usize>
    where
        R: AsyncBufRead + Unpin,
        W: AsyncWrite + Unpin,
    {
        let mut lines = input.lines();
        let mut waits = FuturesUnordered::new();
        let mut open = true;
        let mut answered = 0;

        while open || !waits.is_empty() {
            let reply = tokio::select! {
                line = lines.next_line(), if open => match line? {
                    None => {
                        tracing::info!("Command input closed");
                        open = false;
                        continue;
                    }
                    Some(line) if line.trim().is_empty() => continue,
                    Some(line) => match parse_command(&line) {
                        Ok(WorkerCommand::Wait { epoch_id }) => {
                            waits.push(self.execute(WorkerCommand::Wait { epoch_id }));
                            continue;
                        }
                        Ok(command) => self.execute(command).await,
                        Err(reply) => reply,
                    },
                },
                Some(reply) = waits.next(), if !waits.is_empty() => reply,
            };

            output.write_all(render(&reply).as_bytes()).await?;
            output.write_all(b"\n").await?;
            output.flush().await?;
            answered += 1;
        }
        Ok(answered)
    }

    async fn signal(
        &self,
        epoch_id: EpochId,
        signal: EpochSignal,
    ) -> Result<WorkerReply, WorkflowError> {
        let handle = self
            .handle(epoch_id)
            .ok_or(WorkflowError::UnknownEpoch(epoch_id))?;
        handle.send(signal).await?;
        Ok(WorkerReply::Delivered { epoch_id })
    }
}

fn parse_command(line: &str) -> Result<WorkerCommand, WorkerReply> {
    serde_json::from_str(line).map_err(|e| WorkerReply::Error {
        message: format!("invalid command: {e}"),
    })
}

fn render(reply: &WorkerReply) -> String {
    serde_json::to_string(reply).unwrap_or_else(|e| {
        serde_json::json!({ "reply": "error", "message": e.to_string() }).to_string()
    })
}
