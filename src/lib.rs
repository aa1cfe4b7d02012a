pub mod common;

pub mod cluster;
pub mod job;
pub mod plugins;
pub mod step;

#[cfg(test)]
pub(crate) mod tests;

pub type JobId = u32;
pub type StepId = u32;
/// Index into the global node table.
pub type NodeId = u32;
pub type Uid = u32;

/// Sentinel for "value not provided" in requests and on the wire.
pub const NO_VAL: u32 = 0xffff_fffe;
pub const NO_VAL16: u16 = 0xfffe;
/// Sentinel for "unlimited"; for node counts it means "all nodes".
pub const INFINITE: u32 = 0xffff_ffff;

/// Step ids above this are reserved for NO_VAL and the batch script.
pub const MAX_STEP_ID: StepId = 0xffff_fff0;
/// Step id under which a job's batch script is accounted.
pub const BATCH_SCRIPT_STEP: StepId = 0xffff_fffb;

pub const SIGKILL: u16 = 9;

pub type Error = crate::common::error::StepError;
pub type Result<T> = std::result::Result<T, Error>;
