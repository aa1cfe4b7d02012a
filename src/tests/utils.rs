//! Shared fixtures for step manager tests.

use std::cell::RefCell;
use std::rc::Rc;

use chrono::{DateTime, Duration, TimeZone, Utc};

use crate::cluster::{ControllerConfig, NodeRecord, NodeTable};
use crate::common::bitmap::Bitmap;
use crate::job::{Job, JobResources, JobState};
use crate::plugins::{AgentQueue, AgentRequest, Plugins};
use crate::step::StepManager;
use crate::{JobId, INFINITE};

/// Deterministic "now" used across lifecycle tests.
pub fn t0() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 1, 1, 12, 0, 0).unwrap()
}

pub fn test_nodes(count: usize, cpus: u32) -> NodeTable {
    NodeTable::new(
        (0..count)
            .map(|i| NodeRecord::new(&format!("n{}", i), cpus))
            .collect(),
    )
}

/// A running job allocated the listed nodes, one socket with `cpus`
/// cores each.
pub fn test_job_on(
    nodes: &NodeTable,
    node_ids: &[usize],
    cpus: u32,
    memory_mb: Option<u64>,
) -> Job {
    let mut node_bitmap = Bitmap::new(nodes.len());
    for id in node_ids {
        node_bitmap.set(*id);
    }
    let resources = JobResources::homogeneous(node_bitmap.clone(), cpus, 1, cpus as u16, memory_mb);
    let nodes_str = nodes.bitmap_to_hostlist(&node_bitmap);
    Job {
        job_id: 1,
        user_id: 100,
        name: "sim".to_string(),
        partition: "debug".to_string(),
        partition_hidden: false,
        partition_max_time: INFINITE,
        account: None,
        network: None,
        state: JobState::Running,
        configuring: false,
        prolog_running: false,
        batch_flag: false,
        batch_host: None,
        nodes: nodes_str,
        node_bitmap,
        resources,
        gres: None,
        gres_state: None,
        total_cpus: cpus * node_ids.len() as u32,
        time_limit: 60,
        start_time: t0() - Duration::minutes(5),
        end_time: t0() + Duration::minutes(30),
        suspend_time: None,
        ckpt_interval: 0,
        ckpt_time: t0(),
        ckpt_dir: None,
        derived_exit_code: 0,
        db_indexed: true,
        next_step_id: 0,
        steps: Vec::new(),
    }
}

pub fn test_job(node_count: usize, cpus: u32, memory_mb: Option<u64>) -> Job {
    let nodes = test_nodes(node_count, cpus);
    let ids: Vec<usize> = (0..node_count).collect();
    test_job_on(&nodes, &ids, cpus, memory_mb)
}

/// Agent queue that records requests for assertions.
#[derive(Clone, Default)]
pub struct RecordingAgent {
    pub requests: Rc<RefCell<Vec<AgentRequest>>>,
}

impl RecordingAgent {
    pub fn len(&self) -> usize {
        self.requests.borrow().len()
    }

    pub fn take(&self) -> Vec<AgentRequest> {
        self.requests.borrow_mut().drain(..).collect()
    }
}

impl AgentQueue for RecordingAgent {
    fn queue_request(&self, request: AgentRequest) {
        self.requests.borrow_mut().push(request);
    }
}

/// Manager over `node_count` fresh nodes with a recording agent and a
/// single registered running job covering all of them.
pub fn test_manager(
    node_count: usize,
    cpus: u32,
    memory_mb: Option<u64>,
) -> (StepManager, RecordingAgent, JobId) {
    let nodes = test_nodes(node_count, cpus);
    let ids: Vec<usize> = (0..node_count).collect();
    let job = test_job_on(&nodes, &ids, cpus, memory_mb);
    let job_id = job.job_id;
    let agent = RecordingAgent::default();
    let mut plugins = Plugins::default();
    plugins.agent = Box::new(agent.clone());
    let mut manager = StepManager::new(ControllerConfig::default(), nodes, plugins);
    manager.add_job(job);
    (manager, agent, job_id)
}

/// GRES plugin answering fixed per-node usable CPU counts.
pub struct FixedGres {
    /// Usable CPUs honouring current step allocations.
    pub avail: Vec<u32>,
    /// Usable CPUs ignoring current step allocations.
    pub total: Vec<u32>,
}

#[derive(Debug)]
pub struct FixedGresState;

impl crate::plugins::GresStepState for FixedGresState {
    fn as_any(&self) -> &dyn std::any::Any {
        self
    }
    fn as_any_mut(&mut self) -> &mut dyn std::any::Any {
        self
    }
}

impl crate::plugins::GresPlugin for FixedGres {
    fn step_state_validate(
        &self,
        request: Option<&str>,
        _job_state: Option<&dyn crate::plugins::GresJobState>,
        _job_id: crate::JobId,
    ) -> crate::Result<Option<Box<dyn crate::plugins::GresStepState>>> {
        Ok(request.map(|_| Box::new(FixedGresState) as Box<dyn crate::plugins::GresStepState>))
    }

    fn step_test(
        &self,
        step_state: Option<&dyn crate::plugins::GresStepState>,
        _job_state: Option<&dyn crate::plugins::GresJobState>,
        node_index: usize,
        ignore_alloc: bool,
        _job_id: crate::JobId,
        _step_id: Option<crate::StepId>,
    ) -> u32 {
        if step_state.is_none() {
            return u32::MAX;
        }
        if ignore_alloc {
            self.total[node_index]
        } else {
            self.avail[node_index]
        }
    }

    fn step_alloc(
        &self,
        _step_state: Option<&mut dyn crate::plugins::GresStepState>,
        _job_state: Option<&mut dyn crate::plugins::GresJobState>,
        _node_index: usize,
        _cpus: u32,
        _job_id: crate::JobId,
        _step_id: crate::StepId,
    ) {
    }

    fn step_dealloc(
        &self,
        _step_state: Option<&mut dyn crate::plugins::GresStepState>,
        _job_state: Option<&mut dyn crate::plugins::GresJobState>,
        _node_index: usize,
        _cpus: u32,
        _job_id: crate::JobId,
        _step_id: crate::StepId,
    ) {
    }

    fn step_state_pack(
        &self,
        step_state: Option<&dyn crate::plugins::GresStepState>,
        buffer: &mut crate::common::pack::PackBuffer,
    ) {
        buffer.put_u8(step_state.is_some() as u8);
    }

    fn step_state_unpack(
        &self,
        buffer: &mut crate::common::pack::UnpackBuffer<'_>,
    ) -> Result<Option<Box<dyn crate::plugins::GresStepState>>, crate::common::pack::PackError>
    {
        Ok((buffer.get_u8()? != 0)
            .then(|| Box::new(FixedGresState) as Box<dyn crate::plugins::GresStepState>))
    }

    fn step_state_log(
        &self,
        _step_state: Option<&dyn crate::plugins::GresStepState>,
        _job_id: crate::JobId,
        _step_id: crate::StepId,
    ) {
    }
}

/// Switch plugin with partial-release support, recording every release.
#[derive(Clone, Default)]
pub struct PartialSwitch {
    pub full_releases: Rc<RefCell<Vec<String>>>,
    pub partial_releases: Rc<RefCell<Vec<String>>>,
}

#[derive(Debug)]
pub struct PartialSwitchInfo;

impl crate::plugins::SwitchJobInfo for PartialSwitchInfo {
    fn as_any(&self) -> &dyn std::any::Any {
        self
    }
    fn as_any_mut(&mut self) -> &mut dyn std::any::Any {
        self
    }
}

impl crate::plugins::SwitchPlugin for PartialSwitch {
    fn alloc_jobinfo(&self) -> Box<dyn crate::plugins::SwitchJobInfo> {
        Box::new(PartialSwitchInfo)
    }

    fn build_jobinfo(
        &self,
        _info: &mut dyn crate::plugins::SwitchJobInfo,
        _node_list: &str,
        _tasks_per_node: &[u32],
        _cyclic: bool,
        _network: Option<&str>,
    ) -> crate::Result<()> {
        Ok(())
    }

    fn pack_jobinfo(
        &self,
        _info: &dyn crate::plugins::SwitchJobInfo,
        _buffer: &mut crate::common::pack::PackBuffer,
    ) {
    }

    fn unpack_jobinfo(
        &self,
        _buffer: &mut crate::common::pack::UnpackBuffer<'_>,
    ) -> Result<Box<dyn crate::plugins::SwitchJobInfo>, crate::common::pack::PackError> {
        Ok(Box::new(PartialSwitchInfo))
    }

    fn job_step_complete(&self, _info: &mut dyn crate::plugins::SwitchJobInfo, node_list: &str) {
        self.full_releases.borrow_mut().push(node_list.to_string());
    }

    fn job_step_part_comp(&self, _info: &mut dyn crate::plugins::SwitchJobInfo, node_list: &str) {
        self.partial_releases.borrow_mut().push(node_list.to_string());
    }

    fn part_comp(&self) -> bool {
        true
    }

    fn job_step_allocated(
        &self,
        _info: &dyn crate::plugins::SwitchJobInfo,
        _node_list: Option<&str>,
    ) {
    }
}
