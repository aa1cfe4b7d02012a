pub mod accounting;
pub mod agent;
pub mod checkpoint;
pub mod gres;
pub mod switch;

pub use accounting::{AccountingStorage, JobAccount, NoneAccounting};
pub use agent::{AgentMessage, AgentQueue, AgentRequest, ChannelAgentQueue, NullAgent};
pub use checkpoint::{
    CheckpointJobInfo, CheckpointOp, CheckpointPlugin, CheckpointReply, NoneCheckpoint,
};
pub use gres::{GresJobState, GresPlugin, GresStepState, NoneGres};
pub use switch::{NoneSwitch, SwitchJobInfo, SwitchPlugin};

/// The pluggable collaborators of the step manager. Defaults are the
/// no-op implementations plus an agent queue that drops requests.
pub struct Plugins {
    pub gres: Box<dyn GresPlugin>,
    pub switch: Box<dyn SwitchPlugin>,
    pub checkpoint: Box<dyn CheckpointPlugin>,
    pub accounting: Box<dyn AccountingStorage>,
    pub agent: Box<dyn AgentQueue>,
}

impl Default for Plugins {
    fn default() -> Self {
        Plugins {
            gres: Box::new(NoneGres),
            switch: Box::new(NoneSwitch),
            checkpoint: Box::new(NoneCheckpoint),
            accounting: Box::new(NoneAccounting),
            agent: Box::new(NullAgent),
        }
    }
}
