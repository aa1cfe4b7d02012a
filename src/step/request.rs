use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::plugins::checkpoint::CheckpointOp;
use crate::plugins::JobAccount;
use crate::step::TaskDistribution;
use crate::{JobId, StepId, Uid};

/// A step creation request as it arrives from the RPC layer. Several
/// fields are rewritten during validation and node selection, so the
/// manager takes it by value.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepCreateRequest {
    pub job_id: JobId,
    pub user_id: Uid,
    pub min_nodes: u32,
    /// 0 means unlimited.
    pub max_nodes: u32,
    /// None lets the manager derive a task count.
    pub num_tasks: Option<u32>,
    /// Total CPUs wanted; 0 disables the CPU checks.
    pub cpu_count: u32,
    /// MB per CPU, 0 when memory is not constrained.
    pub mem_per_cpu: u64,
    pub gres: Option<String>,
    pub node_list: Option<String>,
    /// Reserve CPUs rather than overcommitting the job's.
    pub exclusive: bool,
    /// Allow CPU accounting to be relaxed.
    pub overcommit: bool,
    /// Survive node failure.
    pub no_kill: bool,
    pub immediate: bool,
    /// Skip this many of the job's nodes before selecting.
    pub relative: Option<u16>,
    pub task_dist: TaskDistribution,
    pub plane_size: u32,
    /// Minutes; None or 0 means unlimited.
    pub time_limit: Option<u32>,
    /// None: no ports; Some(0): derive from the task layout.
    pub resv_port_cnt: Option<u16>,
    pub ckpt_interval: u16,
    pub ckpt_dir: Option<String>,
    pub host: Option<String>,
    pub port: u16,
    pub name: Option<String>,
    pub network: Option<String>,
}

impl StepCreateRequest {
    /// A minimal request; tests and callers fill in the rest.
    pub fn new(job_id: JobId, user_id: Uid, num_tasks: u32) -> Self {
        StepCreateRequest {
            job_id,
            user_id,
            min_nodes: 1,
            max_nodes: 0,
            num_tasks: Some(num_tasks),
            cpu_count: 0,
            mem_per_cpu: 0,
            gres: None,
            node_list: None,
            exclusive: false,
            overcommit: false,
            no_kill: false,
            immediate: false,
            relative: None,
            task_dist: TaskDistribution::Block,
            plane_size: 0,
            time_limit: None,
            resv_port_cnt: None,
            ckpt_interval: 0,
            ckpt_dir: None,
            host: None,
            port: 0,
            name: None,
            network: None,
        }
    }

    pub fn log_request(&self) {
        log::debug!(
            "StepDesc: user_id={} job_id={} node_count={}-{} cpu_count={}",
            self.user_id,
            self.job_id,
            self.min_nodes,
            self.max_nodes,
            self.cpu_count
        );
        log::debug!(
            "   num_tasks={:?} relative={:?} task_dist={:?} node_list={:?}",
            self.num_tasks,
            self.relative,
            self.task_dist,
            self.node_list
        );
        log::debug!(
            "   host={:?} port={} name={:?} network={:?} exclusive={}",
            self.host,
            self.port,
            self.name,
            self.network,
            self.exclusive
        );
        log::debug!(
            "   mem_per_cpu={} resv_port_cnt={:?} immediate={} no_kill={}",
            self.mem_per_cpu,
            self.resv_port_cnt,
            self.immediate,
            self.no_kill
        );
        log::debug!(
            "   overcommit={} time_limit={:?} gres={:?}",
            self.overcommit,
            self.time_limit,
            self.gres
        );
    }
}

/// A completing node range reported by the node daemon.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepCompleteRequest {
    pub job_id: JobId,
    pub step_id: StepId,
    /// Step-local node range, zero origin, inclusive.
    pub range_first: u32,
    pub range_last: u32,
    pub step_rc: u32,
    pub jobacct: JobAccount,
}

#[derive(Debug, Clone)]
pub struct CheckpointRequest {
    pub job_id: JobId,
    pub step_id: StepId,
    pub op: CheckpointOp,
    pub data: u16,
    pub image_dir: Option<String>,
}

#[derive(Debug, Clone)]
pub struct CheckpointCompRequest {
    pub job_id: JobId,
    pub step_id: StepId,
    /// Present for a single task's completion.
    pub task_id: Option<u32>,
    pub begin_time: DateTime<Utc>,
    pub error_code: u32,
    pub error_msg: Option<String>,
}
