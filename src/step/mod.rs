pub mod cores;
pub mod info;
pub mod layout;
pub mod manager;
pub mod ports;
pub mod request;
pub mod select;
pub mod state;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::common::bitmap::Bitmap;
use crate::plugins::checkpoint::CheckpointJobInfo;
use crate::plugins::gres::GresStepState;
use crate::plugins::switch::SwitchJobInfo;
use crate::plugins::JobAccount;
use crate::{StepId, Uid, INFINITE, NO_VAL};

pub use layout::StepLayout;
pub use manager::StepManager;
pub use request::StepCreateRequest;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TaskDistribution {
    Cyclic,
    Block,
    CyclicCyclic,
    CyclicBlock,
    BlockCyclic,
    BlockBlock,
    Plane,
    Arbitrary,
}

impl TaskDistribution {
    /// Whether tasks rotate across nodes (the first distribution
    /// level), which the interconnect needs to know.
    pub fn is_cyclic(&self) -> bool {
        matches!(
            self,
            TaskDistribution::Cyclic
                | TaskDistribution::CyclicCyclic
                | TaskDistribution::CyclicBlock
        )
    }
}

/// One job step: a sub-allocation of its parent job actually running
/// tasks. Owned by the job's step list; plugin handles are owned here
/// and released on teardown.
pub struct StepRecord {
    pub step_id: StepId,
    pub cyclic_alloc: bool,
    /// Nodes the step may use; subset of the job's nodes.
    pub step_node_bitmap: Bitmap,
    /// Cores claimed by this step, at per-job core-bitmap offsets.
    pub core_bitmap_job: Option<Bitmap>,
    pub cpus_per_task: u16,
    /// CPU count as requested (before any overcommit rewriting).
    pub cpu_count: u32,
    /// MB per CPU, 0 when memory is not constrained.
    pub mem_per_cpu: u64,
    pub exclusive: bool,
    pub no_kill: bool,
    /// Minutes, INFINITE when unlimited.
    pub time_limit: u32,
    pub start_time: DateTime<Utc>,
    /// Seconds of run time accumulated before the last suspend.
    pub pre_sus_time: i64,
    /// Seconds spent suspended over the step's lifetime.
    pub tot_sus_time: i64,
    pub ckpt_time: DateTime<Utc>,
    pub ckpt_interval: u16,
    pub ckpt_dir: Option<String>,
    /// NO_VAL until a completion reports a return code.
    pub exit_code: u32,
    /// Which step-local nodes have reported completion; sized to the
    /// step's node count on first report.
    pub exit_node_bitmap: Option<Bitmap>,
    pub switch_job: Option<Box<dyn SwitchJobInfo>>,
    pub check_job: Option<Box<dyn CheckpointJobInfo>>,
    pub gres: Option<String>,
    pub gres_state: Option<Box<dyn GresStepState>>,
    pub resv_port_cnt: Option<u16>,
    pub resv_ports: Option<String>,
    pub resv_port_array: Vec<u16>,
    /// Client rendezvous endpoint.
    pub host: Option<String>,
    pub port: u16,
    pub name: Option<String>,
    pub network: Option<String>,
    pub batch_step: bool,
    /// Uid that issued a kill, if any.
    pub requid: Option<Uid>,
    pub jobacct: JobAccount,
    pub layout: Option<StepLayout>,
}

impl StepRecord {
    pub fn new(step_id: StepId, node_table_size: usize) -> Self {
        StepRecord {
            step_id,
            cyclic_alloc: false,
            step_node_bitmap: Bitmap::new(node_table_size),
            core_bitmap_job: None,
            cpus_per_task: 0,
            cpu_count: 0,
            mem_per_cpu: 0,
            exclusive: false,
            no_kill: false,
            time_limit: INFINITE,
            start_time: DateTime::<Utc>::MIN_UTC,
            pre_sus_time: 0,
            tot_sus_time: 0,
            ckpt_time: DateTime::<Utc>::MIN_UTC,
            ckpt_interval: 0,
            ckpt_dir: None,
            exit_code: NO_VAL,
            exit_node_bitmap: None,
            switch_job: None,
            check_job: None,
            gres: None,
            gres_state: None,
            resv_port_cnt: None,
            resv_ports: None,
            resv_port_array: Vec::new(),
            host: None,
            port: 0,
            name: None,
            network: None,
            batch_step: false,
            requid: None,
            jobacct: JobAccount::default(),
            layout: None,
        }
    }

    /// Node count of the step (its layout when present, otherwise the
    /// node bitmap).
    pub fn node_count(&self) -> usize {
        match &self.layout {
            Some(layout) => layout.node_cnt as usize,
            None => self.step_node_bitmap.count(),
        }
    }

    /// Seconds the step has been running, suspension-aware.
    pub fn run_time(
        &self,
        now: DateTime<Utc>,
        job_suspended: bool,
        job_suspend_time: Option<DateTime<Utc>>,
    ) -> i64 {
        if job_suspended {
            return self.pre_sus_time;
        }
        let begin = match job_suspend_time {
            Some(suspend) if suspend > self.start_time => suspend,
            _ => self.start_time,
        };
        self.pre_sus_time + now.signed_duration_since(begin).num_seconds()
    }
}
