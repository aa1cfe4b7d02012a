//! Outbound per-node RPCs. The core never sends anything itself; it
//! posts requests to an agent queue owned by the surrounding
//! controller, which delivers (and retries) them asynchronously.

use chrono::{DateTime, Utc};
use tokio::sync::mpsc;

use crate::job::JobState;
use crate::{JobId, StepId, Uid};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AgentMessage {
    /// Deliver a signal to a step's tasks.
    SignalTasks {
        job_id: JobId,
        step_id: StepId,
        signal: u16,
    },
    /// Forcefully terminate a step's tasks.
    TerminateTasks {
        job_id: JobId,
        step_id: StepId,
        signal: u16,
    },
    /// A step ran past its time limit.
    KillTimeLimit {
        job_id: JobId,
        step_id: StepId,
        job_state: JobState,
        job_uid: Uid,
        nodes: String,
        start_time: DateTime<Utc>,
    },
    /// Tell the submitting client its step is over.
    StepComplete {
        job_id: JobId,
        step_id: StepId,
        host: String,
        port: u16,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AgentRequest {
    pub message: AgentMessage,
    pub retry: u8,
    pub hostlist: Vec<String>,
}

impl AgentRequest {
    pub fn new(message: AgentMessage, hostlist: Vec<String>) -> Self {
        AgentRequest {
            message,
            retry: 1,
            hostlist,
        }
    }
}

pub trait AgentQueue {
    fn queue_request(&self, request: AgentRequest);
}

/// Forwards requests into a channel drained by the controller's agent
/// task.
pub struct ChannelAgentQueue {
    sender: mpsc::UnboundedSender<AgentRequest>,
}

impl ChannelAgentQueue {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<AgentRequest>) {
        let (sender, receiver) = mpsc::unbounded_channel();
        (ChannelAgentQueue { sender }, receiver)
    }
}

impl AgentQueue for ChannelAgentQueue {
    fn queue_request(&self, request: AgentRequest) {
        if self.sender.send(request).is_err() {
            log::error!("agent queue receiver is gone, dropping request");
        }
    }
}

/// Discards every request; the default when no agent is attached.
pub struct NullAgent;

impl AgentQueue for NullAgent {
    fn queue_request(&self, _request: AgentRequest) {}
}
