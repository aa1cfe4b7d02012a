//! The step lifecycle controller: create, signal, (partial) complete,
//! suspend/resume bookkeeping, time-limit enforcement, periodic
//! checkpoints. All operations run under the surrounding controller's
//! job/step write lock; nothing here blocks.

use chrono::{DateTime, Duration, Utc};

use crate::cluster::{ControllerConfig, NodeTable};
use crate::common::bitmap::Bitmap;
use crate::common::{hostlist, Map};
use crate::job::Job;
use crate::plugins::agent::{AgentMessage, AgentQueue, AgentRequest};
use crate::plugins::checkpoint::CheckpointReply;
use crate::plugins::gres::GresPlugin;
use crate::plugins::Plugins;
use crate::step::cores::{pick_step_cores, release_step_cores};
use crate::step::layout::step_layout_create;
use crate::step::ports::PortReservations;
use crate::step::request::{CheckpointCompRequest, CheckpointRequest, StepCompleteRequest};
use crate::step::select::pick_step_nodes;
use crate::step::{StepCreateRequest, StepRecord, TaskDistribution};
use crate::{JobId, NodeId, StepId, Uid, BATCH_SCRIPT_STEP, INFINITE, NO_VAL, SIGKILL};

/// Which steps a bulk deletion touches.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepFilter {
    All,
    /// Only steps without a switch allocation.
    NoSwitch,
}

pub struct StepManager {
    pub(crate) config: ControllerConfig,
    pub(crate) nodes: NodeTable,
    pub(crate) jobs: Map<JobId, Job>,
    pub(crate) ports: PortReservations,
    pub(crate) plugins: Plugins,
    /// Round-robin cursor spreading over-subscribed cores off core 0.
    pub(crate) last_core_inx: usize,
    pub(crate) last_job_update: DateTime<Utc>,
}

impl StepManager {
    pub fn new(config: ControllerConfig, nodes: NodeTable, plugins: Plugins) -> Self {
        let ports = PortReservations::new(
            config.resv_port_first,
            config.resv_port_last,
            nodes.len(),
        );
        StepManager {
            config,
            nodes,
            jobs: Map::default(),
            ports,
            plugins,
            last_core_inx: 0,
            last_job_update: DateTime::<Utc>::MIN_UTC,
        }
    }

    pub fn config(&self) -> &ControllerConfig {
        &self.config
    }

    pub fn nodes(&self) -> &NodeTable {
        &self.nodes
    }

    pub fn nodes_mut(&mut self) -> &mut NodeTable {
        &mut self.nodes
    }

    /// Change-detection timestamp, bumped on every mutation.
    pub fn last_update(&self) -> DateTime<Utc> {
        self.last_job_update
    }

    pub fn add_job(&mut self, job: Job) {
        assert!(self.jobs.insert(job.job_id, job).is_none());
    }

    pub fn remove_job(&mut self, job_id: JobId) -> Option<Job> {
        self.jobs.remove(&job_id)
    }

    pub fn get_job(&self, job_id: JobId) -> Option<&Job> {
        self.jobs.get(&job_id)
    }

    pub fn get_job_mut(&mut self, job_id: JobId) -> Option<&mut Job> {
        self.jobs.get_mut(&job_id)
    }

    pub fn jobs(&self) -> impl Iterator<Item = &Job> {
        self.jobs.values()
    }

    pub(crate) fn is_cluster_user(&self, uid: Uid) -> bool {
        uid == 0 || uid == self.config.cluster_user_id
    }

    /// Create a job step: validate the request, select nodes, lay out
    /// tasks, claim cores/CPUs/memory/GRES and register the record.
    /// Any failure after the record exists unwinds it completely.
    pub fn create_step(
        &mut self,
        mut spec: StepCreateRequest,
        batch_step: bool,
        now: DateTime<Utc>,
    ) -> crate::Result<StepId> {
        spec.log_request();
        let job_id = spec.job_id;
        let job = self.jobs.get_mut(&job_id).ok_or(crate::Error::InvalidJobId)?;

        if job.is_suspended() {
            return Err(crate::Error::Disabled);
        }
        if job.is_pending() {
            // A batch system may submit into an existing allocation;
            // a pending one means something upstream went wrong.
            return Err(crate::Error::DuplicateJobId);
        }
        if spec.user_id != job.user_id {
            return Err(crate::Error::AccessDenied);
        }
        if batch_step {
            log::info!(
                "user {} attempting to run batch script within an existing job",
                spec.user_id
            );
        }
        if job.is_finished() || job.end_time <= now {
            return Err(crate::Error::AlreadyDone);
        }
        if spec.task_dist == TaskDistribution::Arbitrary
            && self.config.switch_type == "switch/elan"
        {
            return Err(crate::Error::ArbitraryUnsupported);
        }

        test_strlen(spec.ckpt_dir.as_deref(), "ckpt_dir", 1024)?;
        test_strlen(spec.gres.as_deref(), "gres", 1024)?;
        test_strlen(spec.host.as_deref(), "host", 1024)?;
        test_strlen(spec.name.as_deref(), "name", 1024)?;
        test_strlen(spec.network.as_deref(), "network", 1024)?;
        test_strlen(spec.node_list.as_deref(), "node_list", 1024 * 64)?;

        // Overcommit with exclusive is not a legitimate combination;
        // fall back to exclusively allocating one CPU per task.
        // Otherwise overcommit suppresses the CPU checks entirely.
        let orig_cpu_count = spec.cpu_count;
        if spec.overcommit {
            if spec.exclusive {
                spec.overcommit = false;
                spec.cpu_count = spec.num_tasks.unwrap_or(0);
            } else {
                spec.cpu_count = 0;
            }
        }

        if spec.num_tasks == Some(0) {
            return Err(crate::Error::BadTaskCount);
        }

        // cpus_per_task is recovered by reversing what the launcher
        // did; 0 when the CPUs cannot be spread evenly.
        let cpus_per_task: u16 = match (spec.cpu_count, spec.num_tasks) {
            (0, _) => 0,
            (count, Some(tasks)) if count % tasks == 0 => (count / tasks).max(1) as u16,
            _ => 0,
        };

        let step_gres = self.plugins.gres.step_state_validate(
            spec.gres.as_deref(),
            job.gres_state.as_deref(),
            job_id,
        )?;

        let nodeset = pick_step_nodes(
            job,
            &mut spec,
            step_gres.as_deref(),
            cpus_per_task as u32,
            &self.nodes,
            &self.config,
            self.plugins.gres.as_ref(),
            now,
        )?;
        let node_count = nodeset.count() as u32;

        let num_tasks = match spec.num_tasks {
            Some(tasks) => tasks,
            None if spec.cpu_count != 0 => spec.cpu_count,
            None => node_count,
        };
        spec.num_tasks = Some(num_tasks);
        if num_tasks > node_count * self.config.max_tasks_per_node {
            log::error!("step has invalid task count: {}", num_tasks);
            return Err(crate::Error::BadTaskCount);
        }

        self.last_job_update = now;
        let step_id = {
            let job = self.jobs.get_mut(&job_id).unwrap();
            job.create_step_record(now)?.step_id
        };

        match self.build_step(
            &mut spec,
            step_id,
            step_gres,
            cpus_per_task,
            orig_cpu_count,
            nodeset,
            batch_step,
            now,
        ) {
            Ok(()) => Ok(step_id),
            Err(e) => {
                // unwind the partially constructed record
                let _ = self.delete_step_record(job_id, step_id);
                Err(e)
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn build_step(
        &mut self,
        spec: &mut StepCreateRequest,
        step_id: StepId,
        step_gres: Option<Box<dyn crate::plugins::gres::GresStepState>>,
        cpus_per_task: u16,
        orig_cpu_count: u32,
        nodeset: Bitmap,
        batch_step: bool,
        now: DateTime<Utc>,
    ) -> crate::Result<()> {
        let job_id = spec.job_id;
        let num_tasks = spec.num_tasks.unwrap();
        let picked_node_count = nodeset.count() as u32;

        // The step's own node list keeps the caller's ordering for an
        // arbitrary layout; everything else uses the picked bitmap.
        let step_node_list;
        if spec.node_list.is_some() && spec.task_dist == TaskDistribution::Arbitrary {
            step_node_list = spec.node_list.clone().unwrap();
            spec.node_list = Some(self.nodes.bitmap_to_hostlist(&nodeset));
        } else {
            step_node_list = self.nodes.bitmap_to_hostlist(&nodeset);
            spec.node_list = Some(step_node_list.clone());
        }
        log::debug!(
            "got {} and {:?} looking for {} nodes",
            step_node_list,
            spec.node_list,
            spec.min_nodes
        );

        let step_index;
        {
            let job = self.jobs.get_mut(&job_id).unwrap();
            let job_name = job.name.clone();
            let job_network = job.network.clone();
            let partition_max_time = job.partition_max_time;
            step_index = job.step_index(step_id).unwrap();
            let step = &mut job.steps[step_index];

            step.step_node_bitmap = nodeset;
            step.cyclic_alloc = spec.task_dist.is_cyclic();
            step.gres = spec.gres.clone();
            step.gres_state = step_gres;
            step.port = spec.port;
            step.host = spec.host.clone();
            step.batch_step = batch_step;
            step.cpus_per_task = cpus_per_task;
            step.mem_per_cpu = spec.mem_per_cpu;
            step.ckpt_interval = spec.ckpt_interval;
            step.ckpt_time = now;
            step.cpu_count = orig_cpu_count;
            step.exit_code = NO_VAL;
            step.exclusive = spec.exclusive;
            step.ckpt_dir = spec.ckpt_dir.clone();
            step.no_kill = spec.no_kill;

            // name and network default to the job's values
            step.name = spec
                .name
                .clone()
                .filter(|s| !s.is_empty())
                .or(Some(job_name));
            step.network = spec.network.clone().filter(|s| !s.is_empty()).or(job_network);

            // The time limit is recorded as submitted; allocation
            // limits may still cut the step short.
            step.time_limit = match spec.time_limit {
                None | Some(0) => INFINITE,
                Some(limit) if limit == INFINITE => INFINITE,
                Some(limit) => {
                    if limit > partition_max_time && self.config.enforce_part_limits {
                        log::info!(
                            "step time limit greater than partition's ({} > {})",
                            limit,
                            partition_max_time
                        );
                        return Err(crate::Error::InvalidTimeLimit);
                    }
                    limit
                }
            };
            self.plugins
                .gres
                .step_state_log(step.gres_state.as_deref(), job_id, step_id);
        }

        // a batch script needs no layout, ports or switch windows
        if !batch_step {
            let layout = {
                let job = self.jobs.get(&job_id).unwrap();
                let step = &job.steps[step_index];
                step_layout_create(
                    job,
                    step,
                    &step_node_list,
                    picked_node_count,
                    num_tasks,
                    cpus_per_task,
                    spec.task_dist,
                    spec.plane_size,
                    &self.config,
                    self.plugins.gres.as_ref(),
                )
                .map_err(|e| {
                    if spec.mem_per_cpu != 0 {
                        crate::Error::InvalidTaskMemory
                    } else {
                        e
                    }
                })?
            };

            // reserved port count defaults to the highest per-node
            // task count plus one
            let resv_port_cnt = match spec.resv_port_cnt {
                Some(0) => Some(layout.tasks.iter().max().copied().unwrap_or(0) as u16 + 1),
                other => other,
            };

            {
                let job = self.jobs.get_mut(&job_id).unwrap();
                let step = &mut job.steps[step_index];
                step.layout = Some(layout);
                if let Some(count) = resv_port_cnt {
                    step.resv_port_cnt = Some(count);
                    let (port_array, ports_str) =
                        self.ports.alloc(count, &step.step_node_bitmap)?;
                    step.resv_port_array = port_array;
                    step.resv_ports = Some(ports_str);
                }

                let mut switch_info = self.plugins.switch.alloc_jobinfo();
                {
                    let layout = step.layout.as_ref().unwrap();
                    if let Err(e) = self.plugins.switch.build_jobinfo(
                        switch_info.as_mut(),
                        &layout.node_list,
                        &layout.tasks,
                        step.cyclic_alloc,
                        step.network.as_deref(),
                    ) {
                        log::error!("switch jobinfo build failed: {}", e);
                        return Err(crate::Error::InterconnectFailure);
                    }
                }
                step.switch_job = Some(switch_info);

                Self::step_alloc_lps(
                    &self.config,
                    self.plugins.gres.as_ref(),
                    &self.nodes,
                    &mut self.last_core_inx,
                    job,
                    step_index,
                );
            }
        }

        let job = self.jobs.get_mut(&job_id).unwrap();
        job.steps[step_index].check_job = Some(self.plugins.checkpoint.alloc_jobinfo());

        if !job.db_indexed {
            self.plugins.accounting.job_start(job);
        }
        self.plugins
            .accounting
            .step_start(job, &job.steps[step_index]);
        Ok(())
    }

    /// Debit the job's per-node CPU/memory/GRES counters for a step
    /// and paint its cores.
    fn step_alloc_lps(
        config: &ControllerConfig,
        gres: &dyn GresPlugin,
        nodes: &NodeTable,
        last_core_inx: &mut usize,
        job: &mut Job,
        step_index: usize,
    ) {
        let job_id = job.job_id;
        let total_cpus = job.total_cpus;
        let Job {
            resources,
            steps,
            gres_state: job_gres,
            ..
        } = job;
        let step = &mut steps[step_index];

        if step.layout.is_none() {
            return; // batch step
        }

        let mut paint_cores = resources.core_bitmap.is_some();
        if step.core_bitmap_job.is_some() {
            // live reconfiguration, cores already recorded
            paint_cores = false;
        } else if !step.exclusive || step.cpu_count == total_cpus {
            // the step uses all of the job's cores, just copy the map
            step.core_bitmap_job = resources.core_bitmap.clone();
            paint_cores = false;
        }

        if step.mem_per_cpu != 0 && config.mem_reserved && !resources.has_memory() {
            log::error!(
                "step_alloc_lps: lack memory allocation details to enforce \
                 memory limits for job {}",
                job_id
            );
            step.mem_per_cpu = 0;
        }

        let node_positions: Vec<usize> = resources.node_bitmap.iter_ones().collect();
        let mut step_node_inx = 0usize;
        for (job_node_inx, i) in node_positions.iter().copied().enumerate() {
            if !step.step_node_bitmap.get(i) {
                continue;
            }
            let layout = step.layout.as_ref().unwrap();
            let task_cnt = layout.tasks[step_node_inx];
            // an overcommitted step can push cpus_used past cpus
            let cpus_alloc = task_cnt * step.cpus_per_task as u32;
            resources.cpus_used[job_node_inx] += cpus_alloc;
            gres.step_alloc(
                match &mut step.gres_state {
                    Some(b) => Some(&mut **b),
                    None => None,
                },
                match job_gres {
                    Some(b) => Some(&mut **b),
                    None => None,
                },
                job_node_inx,
                cpus_alloc,
                job_id,
                step.step_id,
            );
            if step.mem_per_cpu != 0 && config.mem_reserved {
                if let Some(memory_used) = resources.memory_used.as_mut() {
                    memory_used[job_node_inx] += step.mem_per_cpu * cpus_alloc as u64;
                }
            }
            if paint_cores {
                pick_step_cores(
                    &mut step.core_bitmap_job,
                    resources,
                    job_node_inx,
                    task_cnt,
                    step.cpus_per_task,
                    last_core_inx,
                );
            }
            log::debug!(
                "step alloc of {} procs: {} of {}",
                nodes.get(i as NodeId).name,
                resources.cpus_used[job_node_inx],
                resources.cpus[job_node_inx]
            );
            step_node_inx += 1;
            if step_node_inx == step.layout.as_ref().unwrap().node_cnt as usize {
                break;
            }
        }
        gres.step_state_log(step.gres_state.as_deref(), job_id, step.step_id);
    }

    /// Return a step's CPU/memory/GRES debits to the job and release
    /// its cores. Underflow clamps to zero and is logged.
    fn step_dealloc_lps(
        config: &ControllerConfig,
        gres: &dyn GresPlugin,
        nodes: &NodeTable,
        job: &mut Job,
        step_index: usize,
    ) {
        let job_id = job.job_id;
        let Job {
            resources,
            steps,
            gres_state: job_gres,
            ..
        } = job;
        let step = &mut steps[step_index];

        if step.layout.is_none() {
            return; // batch step
        }

        if step.mem_per_cpu != 0 && config.mem_reserved && !resources.has_memory() {
            log::error!(
                "step_dealloc_lps: lack memory allocation details to enforce \
                 memory limits for job {}",
                job_id
            );
            step.mem_per_cpu = 0;
        }

        let node_positions: Vec<usize> = resources.node_bitmap.iter_ones().collect();
        let mut step_node_inx = 0usize;
        for (job_node_inx, i) in node_positions.iter().copied().enumerate() {
            if !step.step_node_bitmap.get(i) {
                continue;
            }
            let layout = step.layout.as_ref().unwrap();
            let cpus_alloc = layout.tasks[step_node_inx] * step.cpus_per_task as u32;

            if resources.cpus_used[job_node_inx] >= cpus_alloc {
                resources.cpus_used[job_node_inx] -= cpus_alloc;
            } else {
                log::error!(
                    "step_dealloc_lps: cpu underflow for {}.{}",
                    job_id,
                    step.step_id
                );
                resources.cpus_used[job_node_inx] = 0;
            }
            gres.step_dealloc(
                match &mut step.gres_state {
                    Some(b) => Some(&mut **b),
                    None => None,
                },
                match job_gres {
                    Some(b) => Some(&mut **b),
                    None => None,
                },
                job_node_inx,
                cpus_alloc,
                job_id,
                step.step_id,
            );
            if step.mem_per_cpu != 0 && config.mem_reserved {
                let mem_use = step.mem_per_cpu * cpus_alloc as u64;
                let memory_used = resources.memory_used.as_mut().unwrap();
                if memory_used[job_node_inx] >= mem_use {
                    memory_used[job_node_inx] -= mem_use;
                } else {
                    log::error!(
                        "step_dealloc_lps: mem underflow for {}.{}",
                        job_id,
                        step.step_id
                    );
                    memory_used[job_node_inx] = 0;
                }
            }
            log::debug!(
                "step dealloc of {} procs: {} of {}",
                nodes.get(i as NodeId).name,
                resources.cpus_used[job_node_inx],
                resources.cpus[job_node_inx]
            );
            step_node_inx += 1;
            if step_node_inx == step.layout.as_ref().unwrap().node_cnt as usize {
                break;
            }
        }

        release_step_cores(step.core_bitmap_job.take(), resources);
    }

    /// Delete one step record, releasing switch windows, reserved
    /// ports and checkpoint state.
    pub fn delete_step_record(&mut self, job_id: JobId, step_id: StepId) -> crate::Result<()> {
        let job = self.jobs.get_mut(&job_id).ok_or(crate::Error::InvalidJobId)?;
        let mut step = job.remove_step(step_id).ok_or(crate::Error::InvalidJobId)?;
        self.last_job_update = Utc::now();
        if let Some(mut switch_info) = step.switch_job.take() {
            let node_list = step
                .layout
                .as_ref()
                .map(|l| l.node_list.clone())
                .unwrap_or_default();
            self.plugins
                .switch
                .job_step_complete(switch_info.as_mut(), &node_list);
        }
        if !step.resv_port_array.is_empty() {
            self.ports.free(&step.resv_port_array, &step.step_node_bitmap);
        }
        // checkpoint and accounting handles drop with the record
        Ok(())
    }

    /// Delete a job's step records, optionally keeping those with a
    /// live switch allocation.
    pub fn delete_step_records(&mut self, job_id: JobId, filter: StepFilter) {
        let Some(job) = self.jobs.get_mut(&job_id) else {
            return;
        };
        self.last_job_update = Utc::now();
        let steps = std::mem::take(&mut job.steps);
        for mut step in steps {
            if filter == StepFilter::NoSwitch && step.switch_job.is_some() {
                job.steps.push(step);
                continue;
            }
            if let Some(mut switch_info) = step.switch_job.take() {
                let node_list = step
                    .layout
                    .as_ref()
                    .map(|l| l.node_list.clone())
                    .unwrap_or_default();
                self.plugins
                    .switch
                    .job_step_complete(switch_info.as_mut(), &node_list);
            }
            if !step.resv_port_array.is_empty() {
                self.ports.free(&step.resv_port_array, &step.step_node_bitmap);
            }
        }
    }

    /// Signal a step's tasks. SIGKILL additionally records who asked
    /// and notifies the submitting client.
    pub fn signal_step(
        &mut self,
        job_id: JobId,
        step_id: StepId,
        signal: u16,
        uid: Uid,
    ) -> crate::Result<()> {
        let is_cluster_user = self.is_cluster_user(uid);
        let job = match self.jobs.get_mut(&job_id) {
            Some(job) => job,
            None => {
                log::error!("signal_step: invalid job id {}", job_id);
                return Err(crate::Error::InvalidJobId);
            }
        };
        if job.is_finished() {
            return Err(crate::Error::AlreadyDone);
        }
        if !job.is_running() {
            log::info!(
                "signal_step: step {}.{} can not be sent signal {} from state {:?}",
                job_id,
                step_id,
                signal,
                job.state
            );
            return Err(crate::Error::TransitionStateNoUpdate);
        }
        if job.user_id != uid && !is_cluster_user {
            log::error!("Security violation, JOB_CANCEL RPC from uid {}", uid);
            return Err(crate::Error::UserIdMissing);
        }
        let Some(step_index) = job.step_index(step_id) else {
            log::info!("signal_step: step {}.{} not found", job_id, step_id);
            return Err(crate::Error::InvalidJobId);
        };
        let step = &mut job.steps[step_index];
        if signal == SIGKILL {
            step.requid = Some(uid);
            srun_step_complete(self.plugins.agent.as_ref(), job_id, step);
        }
        signal_step_tasks(
            &self.nodes,
            &self.config,
            self.plugins.agent.as_ref(),
            job,
            &job.steps[step_index],
            signal,
            false,
        );
        Ok(())
    }

    /// Note normal completion of a step: stamp accounting, fold its
    /// exit code into the job's, return every debit and drop the
    /// record.
    pub fn complete_step(
        &mut self,
        job_id: JobId,
        step_id: StepId,
        uid: Uid,
        now: DateTime<Utc>,
    ) -> crate::Result<()> {
        let is_cluster_user = self.is_cluster_user(uid);
        let job = match self.jobs.get_mut(&job_id) {
            Some(job) => job,
            None => {
                log::info!("complete_step: invalid job id {}", job_id);
                return Err(crate::Error::InvalidJobId);
            }
        };
        if job.user_id != uid && !is_cluster_user {
            log::error!("Security violation, JOB_COMPLETE RPC from uid {}", uid);
            return Err(crate::Error::UserIdMissing);
        }
        let Some(step_index) = job.step_index(step_id) else {
            return Err(crate::Error::InvalidJobId);
        };

        self.plugins
            .accounting
            .step_complete(job, &job.steps[step_index]);
        let exit_code = job.steps[step_index].exit_code;
        if exit_code != NO_VAL {
            job.derived_exit_code = job.derived_exit_code.max(exit_code);
        }

        Self::step_dealloc_lps(
            &self.config,
            self.plugins.gres.as_ref(),
            &self.nodes,
            job,
            step_index,
        );

        self.last_job_update = now;
        self.delete_step_record(job_id, step_id).map_err(|_| {
            log::info!("complete_step: step {}.{} not found", job_id, step_id);
            crate::Error::AlreadyDone
        })
    }

    /// Record completion of a contiguous range of a step's nodes.
    /// Returns the count of nodes still pending and the step's highest
    /// return code so far. Ranges may repeat or arrive out of order.
    pub fn partial_complete(
        &mut self,
        req: &StepCompleteRequest,
        uid: Uid,
        _now: DateTime<Utc>,
    ) -> crate::Result<(u32, u32)> {
        let is_cluster_user = self.is_cluster_user(uid);
        let job = match self.jobs.get_mut(&req.job_id) {
            Some(job) => job,
            None => {
                log::info!("partial_complete: job {} invalid", req.job_id);
                return Err(crate::Error::InvalidJobId);
            }
        };
        if job.is_pending() {
            log::info!("partial_complete: job {} pending", req.job_id);
            return Err(crate::Error::JobPending);
        }
        if !is_cluster_user && uid != job.user_id {
            // normally from the node daemon, from the client on failures
            log::error!(
                "Security violation: STEP_COMPLETE RPC for job {} from uid {}",
                req.job_id,
                uid
            );
            return Err(crate::Error::UserIdMissing);
        }
        let Some(step_index) = job.step_index(req.step_id) else {
            log::info!(
                "partial_complete: step {}.{} invalid",
                req.job_id,
                req.step_id
            );
            return Err(crate::Error::InvalidJobId);
        };
        let step = &mut job.steps[step_index];

        if step.batch_step {
            // The batch script reports once; its record stays (and is
            // deleted again later), so nothing else happens here.
            step.exit_code = req.step_rc;
            step.jobacct.aggregate(&req.jobacct);
            return Ok((0, step.exit_code));
        }
        if req.range_last < req.range_first {
            log::error!(
                "partial_complete: job {} range={}-{}",
                req.job_id,
                req.range_first,
                req.range_last
            );
            return Err(crate::Error::InvalidRange);
        }

        step.jobacct.aggregate(&req.jobacct);

        let nodes = match &step.exit_node_bitmap {
            Some(bitmap) => bitmap.nbits(),
            None => step.step_node_bitmap.count(),
        };
        if req.range_last as usize >= nodes {
            log::error!(
                "partial_complete: job {} last={}, nodes={}",
                req.job_id,
                req.range_last,
                nodes
            );
            return Err(crate::Error::InvalidRange);
        }
        match step.exit_node_bitmap.as_mut() {
            None => {
                step.exit_node_bitmap = Some(Bitmap::new(nodes));
                step.exit_code = req.step_rc;
            }
            Some(_) => {
                step.exit_code = step.exit_code.max(req.step_rc);
            }
        }
        let exit_bitmap = step.exit_node_bitmap.as_mut().unwrap();
        exit_bitmap.set_range(req.range_first as usize, req.range_last as usize);
        let rem_nodes = exit_bitmap.clear_count() as u32;

        if rem_nodes == 0 {
            // release all switch windows
            if let Some(mut switch_info) = step.switch_job.take() {
                let node_list = step
                    .layout
                    .as_ref()
                    .map(|l| l.node_list.clone())
                    .unwrap_or_default();
                log::debug!(
                    "full switch release for step {}.{}, nodes {}",
                    req.job_id,
                    req.step_id,
                    node_list
                );
                self.plugins
                    .switch
                    .job_step_complete(switch_info.as_mut(), &node_list);
            }
        } else if self.plugins.switch.part_comp() && step.switch_job.is_some() {
            // release windows on the completed nodes only
            let names = step_range_to_hostlist(&self.nodes, step, req.range_first, req.range_last);
            let node_list = hostlist::compress(names.iter().map(|n| n.as_str()));
            log::debug!(
                "partial switch release for step {}.{}, nodes {}",
                req.job_id,
                req.step_id,
                node_list
            );
            self.plugins
                .switch
                .job_step_part_comp(step.switch_job.as_mut().unwrap().as_mut(), &node_list);
        }

        Ok((rem_nodes, step.exit_code))
    }

    /// Kill every step of the job with tasks on the given node, unless
    /// the step asked to survive node failure. Returns how many were
    /// killed.
    pub fn kill_step_on_node(&self, job_id: JobId, node_id: NodeId) -> usize {
        let Some(job) = self.jobs.get(&job_id) else {
            return 0;
        };
        let mut found = 0;
        for step in &job.steps {
            if step.no_kill || !step.step_node_bitmap.get(node_id as usize) {
                continue;
            }
            log::info!(
                "killing step {}.{} on node {}",
                job_id,
                step.step_id,
                self.nodes.get(node_id).name
            );
            srun_step_complete(self.plugins.agent.as_ref(), job_id, step);
            let host = if self.config.front_end {
                job.batch_host.clone().expect("front-end without batch host")
            } else {
                self.nodes.get(node_id).name.clone()
            };
            self.plugins.agent.queue_request(AgentRequest::new(
                AgentMessage::TerminateTasks {
                    job_id,
                    step_id: step.step_id,
                    signal: SIGKILL,
                },
                vec![host],
            ));
            found += 1;
        }
        found
    }

    /// Periodic tick: dispatch a kill to every running step that has
    /// outlived its limit, excluding suspended time.
    pub fn check_time_limit(&self, job_id: JobId, now: DateTime<Utc>) {
        let Some(job) = self.jobs.get(&job_id) else {
            return;
        };
        if !job.is_running() {
            return;
        }
        for step in &job.steps {
            if step.time_limit == INFINITE || step.time_limit == NO_VAL {
                continue;
            }
            let run_seconds =
                now.signed_duration_since(step.start_time).num_seconds() - step.tot_sus_time;
            let run_minutes = run_seconds / 60;
            if run_minutes >= step.time_limit as i64 {
                log::info!(
                    "check_time_limit: job {} step {} has timed out ({})",
                    job_id,
                    step.step_id,
                    step.time_limit
                );
                let hostlist = self.step_hostlist(job, step);
                if hostlist.is_empty() {
                    continue;
                }
                self.plugins.agent.queue_request(AgentRequest::new(
                    AgentMessage::KillTimeLimit {
                        job_id,
                        step_id: step.step_id,
                        job_state: job.state,
                        job_uid: job.user_id,
                        nodes: job.nodes.clone(),
                        start_time: job.start_time,
                    },
                    hostlist,
                ));
            }
        }
    }

    /// Update suspend bookkeeping for every step of a job. The job's
    /// `suspend_time` must still hold the previous resume instant.
    pub fn suspend_job_steps(&mut self, job_id: JobId, now: DateTime<Utc>) {
        let Some(job) = self.jobs.get_mut(&job_id) else {
            return;
        };
        for step in &mut job.steps {
            step.pre_sus_time += match job.suspend_time {
                Some(suspend) if suspend > step.start_time => {
                    now.signed_duration_since(suspend).num_seconds()
                }
                _ => now.signed_duration_since(step.start_time).num_seconds(),
            };
        }
        self.last_job_update = now;
    }

    /// Update resume bookkeeping; `suspend_time` must still hold the
    /// suspension instant.
    pub fn resume_job_steps(&mut self, job_id: JobId, now: DateTime<Utc>) {
        let Some(job) = self.jobs.get_mut(&job_id) else {
            return;
        };
        for step in &mut job.steps {
            step.tot_sus_time += match job.suspend_time {
                Some(suspend) if suspend < step.start_time => {
                    now.signed_duration_since(step.start_time).num_seconds()
                }
                Some(suspend) => now.signed_duration_since(suspend).num_seconds(),
                None => {
                    log::error!("resume of job {} without suspend time", job_id);
                    0
                }
            };
        }
        self.last_job_update = now;
    }

    /// Adjust the time limit of one step, or of every step when
    /// `step_id` is absent.
    pub fn update_step(
        &mut self,
        job_id: JobId,
        step_id: Option<StepId>,
        time_limit: u32,
        uid: Uid,
        now: DateTime<Utc>,
    ) -> crate::Result<()> {
        let operator = self.is_cluster_user(uid);
        let coord = {
            let job = self.jobs.get(&job_id).ok_or_else(|| {
                log::error!("update_step: invalid job id {}", job_id);
                crate::Error::InvalidJobId
            })?;
            self.plugins
                .accounting
                .is_user_acct_coord(uid, job.account.as_deref())
        };
        let job = self.jobs.get_mut(&job_id).unwrap();
        if job.user_id != uid && !operator && !coord {
            log::error!("Security violation, STEP_UPDATE RPC from uid {}", uid);
            return Err(crate::Error::UserIdMissing);
        }

        // no need to cap it: the job's own limit kills any step anyway
        let mut mod_cnt = 0;
        match step_id {
            None => {
                for step in &mut job.steps {
                    step.time_limit = time_limit;
                    mod_cnt += 1;
                    log::info!(
                        "Updating step {}.{} time limit to {}",
                        job_id,
                        step.step_id,
                        time_limit
                    );
                }
            }
            Some(step_id) => match job.find_step_mut(Some(step_id)) {
                Some(step) => {
                    step.time_limit = time_limit;
                    mod_cnt += 1;
                    log::info!(
                        "Updating step {}.{} time limit to {}",
                        job_id,
                        step_id,
                        time_limit
                    );
                }
                None => return Err(crate::Error::InvalidJobId),
            },
        }
        if mod_cnt > 0 {
            self.last_job_update = now;
        }
        Ok(())
    }

    /// Forward a checkpoint operation to the plugin for one step.
    pub fn checkpoint_step(
        &mut self,
        req: &CheckpointRequest,
        uid: Uid,
        now: DateTime<Utc>,
    ) -> crate::Result<CheckpointReply> {
        let job = self
            .jobs
            .get_mut(&req.job_id)
            .ok_or(crate::Error::InvalidJobId)?;
        if uid != job.user_id && uid != 0 {
            return Err(crate::Error::AccessDenied);
        }
        if job.is_pending() {
            return Err(crate::Error::JobPending);
        } else if job.is_suspended() {
            // the job cannot get cycles for a checkpoint while suspended
            return Err(crate::Error::Disabled);
        } else if !job.is_running() {
            return Err(crate::Error::AlreadyDone);
        }
        let Some(step_index) = job.step_index(req.step_id) else {
            return Err(crate::Error::InvalidJobId);
        };
        let job_id = job.job_id;
        let step = &mut job.steps[step_index];
        let base_dir = req
            .image_dir
            .clone()
            .or_else(|| step.ckpt_dir.clone())
            .unwrap_or_default();
        let image_dir = format!("{}/{}.{}", base_dir, job_id, req.step_id);
        let reply = self.plugins.checkpoint.op(
            job_id,
            req.step_id,
            match &mut step.check_job {
                Some(b) => Some(&mut **b),
                None => None,
            },
            req.op,
            req.data,
            &image_dir,
        )?;
        self.last_job_update = now;
        Ok(reply)
    }

    /// Note completion of a step checkpoint.
    pub fn checkpoint_comp(
        &mut self,
        req: &CheckpointCompRequest,
        uid: Uid,
        now: DateTime<Utc>,
    ) -> crate::Result<()> {
        let job = self
            .jobs
            .get_mut(&req.job_id)
            .ok_or(crate::Error::InvalidJobId)?;
        if uid != job.user_id && uid != 0 {
            return Err(crate::Error::AccessDenied);
        }
        if job.is_pending() {
            return Err(crate::Error::JobPending);
        } else if !job.is_running() && !job.is_suspended() {
            return Err(crate::Error::AlreadyDone);
        }
        let Some(step) = job.find_step_mut(Some(req.step_id)) else {
            return Err(crate::Error::InvalidJobId);
        };
        let info = step
            .check_job
            .as_deref_mut()
            .ok_or(crate::Error::Disabled)?;
        match req.task_id {
            None => self.plugins.checkpoint.comp(
                info,
                req.begin_time,
                req.error_code,
                req.error_msg.as_deref(),
            )?,
            Some(task_id) => self.plugins.checkpoint.task_comp(
                info,
                task_id,
                req.begin_time,
                req.error_code,
                req.error_msg.as_deref(),
            )?,
        }
        self.last_job_update = now;
        Ok(())
    }

    /// Periodic checkpoint trigger. Batch jobs checkpoint at the job
    /// level; everything else per step. Nothing fires right after a
    /// (re)start, so a job restarting from checkpoint is not
    /// immediately checkpointed again.
    pub fn step_checkpoint(&mut self, now: DateTime<Utc>) {
        if self.config.checkpoint_type == "checkpoint/none" {
            return;
        }
        for job in self.jobs.values_mut() {
            if !job.is_running() {
                continue;
            }
            if job.batch_flag && job.ckpt_interval != 0 {
                let interval = Duration::minutes(job.ckpt_interval as i64);
                if job.ckpt_time + interval > now || job.start_time + interval > now {
                    continue;
                }
                let base_dir = job.ckpt_dir.clone().unwrap_or_default();
                let image_dir = format!("{}/{}", base_dir, job.job_id);
                let _ = self.plugins.checkpoint.op(
                    job.job_id,
                    BATCH_SCRIPT_STEP,
                    None,
                    crate::plugins::checkpoint::CheckpointOp::Create,
                    0,
                    &image_dir,
                );
                job.ckpt_time = now;
                self.last_job_update = now;
                continue; // ignore periodic step checkpoints
            }
            let job_id = job.job_id;
            for step in &mut job.steps {
                if step.ckpt_interval == 0 {
                    continue;
                }
                let interval = Duration::minutes(step.ckpt_interval as i64);
                if step.ckpt_time + interval > now || step.start_time + interval > now {
                    continue;
                }
                step.ckpt_time = now;
                self.last_job_update = now;
                let base_dir = step.ckpt_dir.clone().unwrap_or_default();
                let image_dir = format!("{}/{}.{}", base_dir, job_id, step.step_id);
                let _ = self.plugins.checkpoint.op(
                    job_id,
                    step.step_id,
                    match &mut step.check_job {
                        Some(b) => Some(&mut **b),
                        None => None,
                    },
                    crate::plugins::checkpoint::CheckpointOp::Create,
                    0,
                    &image_dir,
                );
            }
        }
    }

    /// An epilog finished on one node: release its switch windows for
    /// any step that still holds them, when the plugin can do partial
    /// release.
    pub fn step_epilog_complete(&mut self, job_id: JobId, node_name: &str) -> usize {
        if !self.plugins.switch.part_comp() {
            return 0;
        }
        let Some(node_id) = self.nodes.find_by_name(node_name) else {
            return 0;
        };
        let Some(job) = self.jobs.get_mut(&job_id) else {
            return 0;
        };
        let mut released = 0;
        for step in &mut job.steps {
            if step.switch_job.is_none() || !step.step_node_bitmap.get(node_id as usize) {
                continue;
            }
            if step.exit_node_bitmap.is_some() {
                let offset = step
                    .step_node_bitmap
                    .iter_ones()
                    .take_while(|i| *i < node_id as usize)
                    .count();
                let exit_bitmap = step.exit_node_bitmap.as_mut().unwrap();
                if offset >= exit_bitmap.nbits() || exit_bitmap.get(offset) {
                    continue;
                }
                exit_bitmap.set(offset);
            }
            released += 1;
            log::debug!(
                "partial switch release for step {}.{}, epilog on {}",
                job_id,
                step.step_id,
                node_name
            );
            self.plugins
                .switch
                .job_step_part_comp(step.switch_job.as_mut().unwrap().as_mut(), node_name);
        }
        released
    }

    fn step_hostlist(&self, job: &Job, step: &StepRecord) -> Vec<String> {
        if self.config.front_end {
            vec![job.batch_host.clone().expect("front-end without batch host")]
        } else {
            self.nodes.names(&step.step_node_bitmap)
        }
    }
}

fn test_strlen(value: Option<&str>, name: &str, max_len: usize) -> crate::Result<()> {
    let len = value.map(|s| s.len()).unwrap_or(0);
    if len > max_len {
        log::info!(
            "step_create_request: strlen({}) too big ({} > {})",
            name,
            len,
            max_len
        );
        return Err(crate::Error::PathnameTooLong);
    }
    Ok(())
}

/// Tell the submitting client (if it left an endpoint) that the step
/// is done.
fn srun_step_complete(agent: &dyn AgentQueue, job_id: JobId, step: &StepRecord) {
    if let Some(host) = &step.host {
        if step.port != 0 {
            agent.queue_request(AgentRequest::new(
                AgentMessage::StepComplete {
                    job_id,
                    step_id: step.step_id,
                    host: host.clone(),
                    port: step.port,
                },
                vec![host.clone()],
            ));
        }
    }
}

/// Queue a signal to every node of a step (or the batch host on a
/// front-end system). No-op when the step has no nodes.
fn signal_step_tasks(
    nodes: &NodeTable,
    config: &ControllerConfig,
    agent: &dyn AgentQueue,
    job: &Job,
    step: &StepRecord,
    signal: u16,
    terminate: bool,
) {
    let hostlist = if config.front_end {
        vec![job.batch_host.clone().expect("front-end without batch host")]
    } else {
        nodes.names(&step.step_node_bitmap)
    };
    if hostlist.is_empty() {
        return;
    }
    let message = if terminate {
        AgentMessage::TerminateTasks {
            job_id: job.job_id,
            step_id: step.step_id,
            signal,
        }
    } else {
        AgentMessage::SignalTasks {
            job_id: job.job_id,
            step_id: step.step_id,
            signal,
        }
    };
    agent.queue_request(AgentRequest::new(message, hostlist));
}

/// Names of the step-local node range `[first, last]`.
fn step_range_to_hostlist(
    nodes: &NodeTable,
    step: &StepRecord,
    range_first: u32,
    range_last: u32,
) -> Vec<String> {
    step.step_node_bitmap
        .iter_ones()
        .enumerate()
        .filter(|(step_inx, _)| {
            *step_inx >= range_first as usize && *step_inx <= range_last as usize
        })
        .map(|(_, i)| nodes.get(i as NodeId).name.clone())
        .collect()
}

#[cfg(test)]
mod tests {
    use chrono::Duration;

    use crate::job::JobState;
    use crate::plugins::{AgentMessage, JobAccount};
    use crate::step::request::StepCompleteRequest;
    use crate::step::manager::StepFilter;
    use crate::step::StepCreateRequest;
    use crate::tests::utils::{test_manager, t0, FixedGres, PartialSwitch};
    use crate::{JobId, StepId, MAX_STEP_ID, SIGKILL};

    fn complete_req(
        job_id: JobId,
        step_id: StepId,
        first: u32,
        last: u32,
        rc: u32,
    ) -> StepCompleteRequest {
        StepCompleteRequest {
            job_id,
            step_id,
            range_first: first,
            range_last: last,
            step_rc: rc,
            jobacct: JobAccount::default(),
        }
    }

    #[test]
    fn test_create_step_basic_layout() {
        let (mut manager, _agent, job_id) = test_manager(2, 4, None);
        let mut spec = StepCreateRequest::new(job_id, 100, 4);
        spec.cpu_count = 8;
        let step_id = manager.create_step(spec, false, t0()).unwrap();

        let job = manager.get_job(job_id).unwrap();
        assert_eq!(job.resources.cpus_used, vec![4, 4]);
        let step = job.find_step(Some(step_id)).unwrap();
        assert_eq!(step.cpus_per_task, 2);
        let layout = step.layout.as_ref().unwrap();
        assert_eq!(layout.tasks, vec![2, 2]);
        assert_eq!(layout.node_list, "n[0-1]");
    }

    #[test]
    fn test_exclusive_steps_block_then_release() {
        let (mut manager, _agent, job_id) = test_manager(2, 4, None);
        let mut spec = StepCreateRequest::new(job_id, 100, 4);
        spec.cpu_count = 8;
        spec.exclusive = true;
        let first = manager.create_step(spec, false, t0()).unwrap();
        assert_eq!(
            manager.get_job(job_id).unwrap().resources.cpus_used,
            vec![4, 4]
        );

        let mut spec = StepCreateRequest::new(job_id, 100, 2);
        spec.cpu_count = 2;
        spec.exclusive = true;
        let err = manager.create_step(spec.clone(), false, t0()).unwrap_err();
        assert!(matches!(err, crate::Error::NodesBusy));

        manager.complete_step(job_id, first, 100, t0()).unwrap();
        assert_eq!(
            manager.get_job(job_id).unwrap().resources.cpus_used,
            vec![0, 0]
        );
        manager.create_step(spec, false, t0()).unwrap();
    }

    #[test]
    fn test_memory_constrained_selection() {
        let (mut manager, _agent, job_id) = test_manager(4, 8, Some(8192));
        let mut spec = StepCreateRequest::new(job_id, 100, 16);
        spec.cpu_count = 16;
        spec.mem_per_cpu = 1024;
        spec.min_nodes = 1;
        let step_id = manager.create_step(spec, false, t0()).unwrap();

        let job = manager.get_job(job_id).unwrap();
        let step = job.find_step(Some(step_id)).unwrap();
        assert_eq!(step.step_node_bitmap.count(), 2);
        assert_eq!(&job.resources.cpus_used[..2], &[8, 8]);
        assert_eq!(
            &job.resources.memory_used.as_ref().unwrap()[..2],
            &[8192, 8192]
        );
        assert_eq!(&job.resources.cpus_used[2..], &[0, 0]);
    }

    #[test]
    fn test_time_limit_kill_dispatched_once() {
        let (mut manager, agent, job_id) = test_manager(2, 4, None);
        let step_id = manager
            .create_step(StepCreateRequest::new(job_id, 100, 1), false, t0())
            .unwrap();
        {
            let job = manager.get_job_mut(job_id).unwrap();
            let step = job.find_step_mut(Some(step_id)).unwrap();
            step.time_limit = 1;
            step.tot_sus_time = 120;
            step.start_time = t0();
        }

        // 180 wall seconds minus 120 suspended is exactly the limit
        manager.check_time_limit(job_id, t0() + Duration::seconds(180));
        let requests = agent.take();
        assert_eq!(requests.len(), 1);
        match &requests[0].message {
            AgentMessage::KillTimeLimit {
                job_id: j,
                step_id: s,
                ..
            } => {
                assert_eq!((*j, *s), (job_id, step_id));
            }
            other => panic!("unexpected message {:?}", other),
        }

        // one minute earlier nothing fires
        manager.check_time_limit(job_id, t0() + Duration::seconds(110));
        assert_eq!(agent.len(), 0);
    }

    #[test]
    fn test_partial_complete_out_of_order() {
        let (mut manager, _agent, job_id) = test_manager(5, 4, None);
        let mut spec = StepCreateRequest::new(job_id, 100, 5);
        spec.min_nodes = 5;
        let step_id = manager.create_step(spec, false, t0()).unwrap();

        let (rem, rc) = manager
            .partial_complete(&complete_req(job_id, step_id, 2, 4, 0), 0, t0())
            .unwrap();
        assert_eq!((rem, rc), (2, 0));

        let (rem, rc) = manager
            .partial_complete(&complete_req(job_id, step_id, 0, 1, 3), 0, t0())
            .unwrap();
        assert_eq!((rem, rc), (0, 3));

        let job = manager.get_job(job_id).unwrap();
        let step = job.find_step(Some(step_id)).unwrap();
        let exit = step.exit_node_bitmap.as_ref().unwrap();
        assert_eq!(exit.count(), 5);
        assert_eq!(step.exit_code, 3);
        assert!(step.switch_job.is_none());

        // applying a range twice changes nothing
        let (rem, rc) = manager
            .partial_complete(&complete_req(job_id, step_id, 2, 4, 0), 0, t0())
            .unwrap();
        assert_eq!((rem, rc), (0, 3));

        // out-of-range completions are rejected
        let err = manager
            .partial_complete(&complete_req(job_id, step_id, 4, 7, 0), 0, t0())
            .unwrap_err();
        assert!(matches!(err, crate::Error::InvalidRange));
    }

    #[test]
    fn test_partial_complete_batch_step() {
        let (mut manager, _agent, job_id) = test_manager(1, 4, None);
        let step_id = manager
            .create_step(StepCreateRequest::new(job_id, 100, 1), true, t0())
            .unwrap();
        let (rem, rc) = manager
            .partial_complete(&complete_req(job_id, step_id, 0, 0, 7), 0, t0())
            .unwrap();
        assert_eq!((rem, rc), (0, 7));
        // the record survives and can still be deleted later
        let job = manager.get_job(job_id).unwrap();
        assert!(job.find_step(Some(step_id)).is_some());
        manager.delete_step_record(job_id, step_id).unwrap();
    }

    #[test]
    fn test_partial_switch_release() {
        let (mut manager, _agent, job_id) = test_manager(3, 4, None);
        let switch = PartialSwitch::default();
        manager.plugins.switch = Box::new(switch.clone());

        let mut spec = StepCreateRequest::new(job_id, 100, 3);
        spec.min_nodes = 3;
        let step_id = manager.create_step(spec, false, t0()).unwrap();

        manager
            .partial_complete(&complete_req(job_id, step_id, 1, 2, 0), 0, t0())
            .unwrap();
        assert_eq!(switch.partial_releases.borrow().as_slice(), ["n[1-2]"]);

        manager
            .partial_complete(&complete_req(job_id, step_id, 0, 0, 0), 0, t0())
            .unwrap();
        assert_eq!(switch.full_releases.borrow().len(), 1);
    }

    #[test]
    fn test_conservation_of_cpus_and_memory() {
        let (mut manager, _agent, job_id) = test_manager(2, 4, Some(4096));
        let mut spec = StepCreateRequest::new(job_id, 100, 2);
        spec.cpu_count = 4;
        spec.mem_per_cpu = 512;
        let first = manager.create_step(spec.clone(), false, t0()).unwrap();
        let _second = manager.create_step(spec, false, t0()).unwrap();

        let job = manager.get_job(job_id).unwrap();
        assert_eq!(job.resources.cpus_used, vec![4, 4]);
        assert_eq!(
            job.resources.memory_used.as_ref().unwrap(),
            &vec![2048, 2048]
        );

        manager.complete_step(job_id, first, 100, t0()).unwrap();
        let job = manager.get_job(job_id).unwrap();
        assert_eq!(job.resources.cpus_used.iter().sum::<u32>(), 4);
        assert_eq!(
            job.resources.memory_used.as_ref().unwrap().iter().sum::<u64>(),
            2048
        );
    }

    #[test]
    fn test_exclusive_core_bitmaps_disjoint() {
        let (mut manager, _agent, job_id) = test_manager(1, 4, None);
        let mut spec = StepCreateRequest::new(job_id, 100, 1);
        spec.cpu_count = 2;
        spec.exclusive = true;
        let first = manager.create_step(spec.clone(), false, t0()).unwrap();
        let second = manager.create_step(spec, false, t0()).unwrap();

        let job = manager.get_job(job_id).unwrap();
        let a = job
            .find_step(Some(first))
            .unwrap()
            .core_bitmap_job
            .as_ref()
            .unwrap();
        let b = job
            .find_step(Some(second))
            .unwrap()
            .core_bitmap_job
            .as_ref()
            .unwrap();
        assert_eq!(a.count(), 2);
        assert_eq!(b.count(), 2);
        assert!(!a.overlaps(b));
    }

    #[test]
    fn test_step_nodes_subset_of_up_job_nodes() {
        let (mut manager, _agent, job_id) = test_manager(3, 4, None);
        manager.nodes_mut().get_mut(2).responding = false;
        // not the job's first step, so the boot wait does not trigger
        manager.get_job_mut(job_id).unwrap().next_step_id = 1;

        let mut spec = StepCreateRequest::new(job_id, 100, 2);
        spec.min_nodes = 2;
        let step_id = manager.create_step(spec, false, t0()).unwrap();

        let up = manager.nodes().up_bitmap();
        let job = manager.get_job(job_id).unwrap();
        let step = job.find_step(Some(step_id)).unwrap();
        assert!(job.node_bitmap.is_superset_of(&step.step_node_bitmap));
        assert!(up.is_superset_of(&step.step_node_bitmap));
        assert!(!step.step_node_bitmap.get(2));
    }

    #[test]
    fn test_step_id_exhaustion() {
        let (mut manager, _agent, job_id) = test_manager(1, 4, None);
        manager.get_job_mut(job_id).unwrap().next_step_id = MAX_STEP_ID;
        let err = manager
            .create_step(StepCreateRequest::new(job_id, 100, 1), false, t0())
            .unwrap_err();
        assert!(matches!(err, crate::Error::TooManySteps));
    }

    #[test]
    fn test_overcommit_exclusive_coercion() {
        let (mut manager, _agent, job_id) = test_manager(1, 4, None);
        let mut spec = StepCreateRequest::new(job_id, 100, 2);
        spec.overcommit = true;
        spec.exclusive = true;
        let step_id = manager.create_step(spec, false, t0()).unwrap();

        let job = manager.get_job(job_id).unwrap();
        let step = job.find_step(Some(step_id)).unwrap();
        // exclusively allocated one CPU per task
        assert_eq!(step.cpus_per_task, 1);
        assert!(step.exclusive);
        // the record keeps the CPU count as originally requested
        assert_eq!(step.cpu_count, 0);
        assert_eq!(job.resources.cpus_used[0], 2);
    }

    #[test]
    fn test_create_rewind_on_failure() {
        let (mut manager, _agent, job_id) = test_manager(2, 4, None);
        manager.config.enforce_part_limits = true;
        manager.get_job_mut(job_id).unwrap().partition_max_time = 10;

        let mut spec = StepCreateRequest::new(job_id, 100, 1);
        spec.time_limit = Some(60);
        let err = manager.create_step(spec, false, t0()).unwrap_err();
        assert!(matches!(err, crate::Error::InvalidTimeLimit));

        let job = manager.get_job(job_id).unwrap();
        assert!(job.steps.is_empty());
        // the step id was consumed regardless
        assert_eq!(job.next_step_id, 1);
        assert_eq!(job.resources.cpus_used, vec![0, 0]);
    }

    #[test]
    fn test_gres_constrained_selection() {
        let (mut manager, _agent, job_id) = test_manager(2, 4, None);
        manager.plugins.gres = Box::new(FixedGres {
            avail: vec![4, 0],
            total: vec![4, 0],
        });
        let mut spec = StepCreateRequest::new(job_id, 100, 4);
        spec.cpu_count = 4;
        spec.gres = Some("gpu:1".to_string());
        let step_id = manager.create_step(spec, false, t0()).unwrap();

        let job = manager.get_job(job_id).unwrap();
        let step = job.find_step(Some(step_id)).unwrap();
        assert_eq!(step.step_node_bitmap.to_ranged_string(), "0");
        assert_eq!(step.layout.as_ref().unwrap().tasks, vec![4]);
    }

    #[test]
    fn test_signal_step_authorisation_and_kill() {
        let (mut manager, agent, job_id) = test_manager(2, 4, None);
        let mut spec = StepCreateRequest::new(job_id, 100, 2);
        spec.host = Some("login0".to_string());
        spec.port = 7100;
        let step_id = manager.create_step(spec, false, t0()).unwrap();

        let err = manager.signal_step(job_id, step_id, SIGKILL, 42).unwrap_err();
        assert!(matches!(err, crate::Error::UserIdMissing));
        assert_eq!(agent.len(), 0);

        manager.signal_step(job_id, step_id, SIGKILL, 100).unwrap();
        let requests = agent.take();
        assert_eq!(requests.len(), 2);
        assert!(matches!(
            requests[0].message,
            AgentMessage::StepComplete { port: 7100, .. }
        ));
        match &requests[1].message {
            AgentMessage::SignalTasks { signal, .. } => assert_eq!(*signal, SIGKILL),
            other => panic!("unexpected message {:?}", other),
        }
        let job = manager.get_job(job_id).unwrap();
        assert_eq!(job.find_step(Some(step_id)).unwrap().requid, Some(100));

        let err = manager.signal_step(job_id, 99, SIGKILL, 100).unwrap_err();
        assert!(matches!(err, crate::Error::InvalidJobId));
    }

    #[test]
    fn test_signal_requires_running_job() {
        let (mut manager, _agent, job_id) = test_manager(1, 4, None);
        let step_id = manager
            .create_step(StepCreateRequest::new(job_id, 100, 1), false, t0())
            .unwrap();
        manager.get_job_mut(job_id).unwrap().state = JobState::Suspended;
        let err = manager.signal_step(job_id, step_id, 15, 100).unwrap_err();
        assert!(matches!(err, crate::Error::TransitionStateNoUpdate));

        manager.get_job_mut(job_id).unwrap().state = JobState::Finished;
        let err = manager.signal_step(job_id, step_id, 15, 100).unwrap_err();
        assert!(matches!(err, crate::Error::AlreadyDone));
    }

    #[test]
    fn test_kill_step_on_node_honours_no_kill() {
        let (mut manager, agent, job_id) = test_manager(2, 4, None);
        let mut spec = StepCreateRequest::new(job_id, 100, 2);
        spec.min_nodes = 2;
        let victim = manager.create_step(spec.clone(), false, t0()).unwrap();
        spec.no_kill = true;
        let survivor = manager.create_step(spec, false, t0()).unwrap();

        assert_eq!(manager.kill_step_on_node(job_id, 0), 1);
        let requests = agent.take();
        assert_eq!(requests.len(), 1);
        match &requests[0].message {
            AgentMessage::TerminateTasks { step_id, signal, .. } => {
                assert_eq!(*step_id, victim);
                assert_eq!(*signal, SIGKILL);
            }
            other => panic!("unexpected message {:?}", other),
        }
        assert_eq!(requests[0].hostlist, vec!["n0".to_string()]);
        let _ = survivor;
    }

    #[test]
    fn test_suspend_resume_bookkeeping() {
        let (mut manager, _agent, job_id) = test_manager(1, 4, None);
        let step_id = manager
            .create_step(StepCreateRequest::new(job_id, 100, 1), false, t0())
            .unwrap();

        let suspend_at = t0() + Duration::seconds(100);
        manager.suspend_job_steps(job_id, suspend_at);
        {
            let job = manager.get_job_mut(job_id).unwrap();
            job.state = JobState::Suspended;
            job.suspend_time = Some(suspend_at);
        }

        let resume_at = suspend_at + Duration::seconds(50);
        manager.resume_job_steps(job_id, resume_at);
        {
            let job = manager.get_job_mut(job_id).unwrap();
            job.state = JobState::Running;
            job.suspend_time = Some(resume_at);
        }

        let job = manager.get_job(job_id).unwrap();
        let step = job.find_step(Some(step_id)).unwrap();
        assert_eq!(step.pre_sus_time, 100);
        assert_eq!(step.tot_sus_time, 50);
    }

    #[test]
    fn test_update_step_time_limits() {
        let (mut manager, _agent, job_id) = test_manager(2, 4, None);
        let a = manager
            .create_step(StepCreateRequest::new(job_id, 100, 1), false, t0())
            .unwrap();
        let b = manager
            .create_step(StepCreateRequest::new(job_id, 100, 1), false, t0())
            .unwrap();

        let err = manager.update_step(job_id, None, 30, 200, t0()).unwrap_err();
        assert!(matches!(err, crate::Error::UserIdMissing));

        manager.update_step(job_id, None, 30, 100, t0()).unwrap();
        let job = manager.get_job(job_id).unwrap();
        assert_eq!(job.find_step(Some(a)).unwrap().time_limit, 30);
        assert_eq!(job.find_step(Some(b)).unwrap().time_limit, 30);

        manager.update_step(job_id, Some(b), 45, 0, t0()).unwrap();
        let job = manager.get_job(job_id).unwrap();
        assert_eq!(job.find_step(Some(a)).unwrap().time_limit, 30);
        assert_eq!(job.find_step(Some(b)).unwrap().time_limit, 45);

        let err = manager
            .update_step(job_id, Some(99), 45, 0, t0())
            .unwrap_err();
        assert!(matches!(err, crate::Error::InvalidJobId));
    }

    #[test]
    fn test_delete_step_records_filter() {
        let (mut manager, _agent, job_id) = test_manager(2, 4, None);
        let with_switch = manager
            .create_step(StepCreateRequest::new(job_id, 100, 1), false, t0())
            .unwrap();
        let batch = manager
            .create_step(StepCreateRequest::new(job_id, 100, 1), true, t0())
            .unwrap();

        manager.delete_step_records(job_id, StepFilter::NoSwitch);
        let job = manager.get_job(job_id).unwrap();
        assert!(job.find_step(Some(with_switch)).is_some());
        assert!(job.find_step(Some(batch)).is_none());

        manager.delete_step_records(job_id, StepFilter::All);
        assert!(manager.get_job(job_id).unwrap().steps.is_empty());
    }

    #[test]
    fn test_epilog_complete_releases_windows() {
        let (mut manager, _agent, job_id) = test_manager(3, 4, None);
        let switch = PartialSwitch::default();
        manager.plugins.switch = Box::new(switch.clone());
        let mut spec = StepCreateRequest::new(job_id, 100, 3);
        spec.min_nodes = 3;
        manager.create_step(spec, false, t0()).unwrap();

        assert_eq!(manager.step_epilog_complete(job_id, "n1"), 1);
        assert_eq!(switch.partial_releases.borrow().as_slice(), ["n1"]);
        // a second epilog for the same node is not an error
        assert_eq!(manager.step_epilog_complete(job_id, "n1"), 1);
        assert_eq!(manager.step_epilog_complete(job_id, "bogus"), 0);
    }

    #[test]
    fn test_create_step_validation_errors() {
        let (mut manager, agent, job_id) = test_manager(1, 4, None);

        let err = manager
            .create_step(StepCreateRequest::new(77, 100, 1), false, t0())
            .unwrap_err();
        assert!(matches!(err, crate::Error::InvalidJobId));

        let err = manager
            .create_step(StepCreateRequest::new(job_id, 200, 1), false, t0())
            .unwrap_err();
        assert!(matches!(err, crate::Error::AccessDenied));

        let err = manager
            .create_step(StepCreateRequest::new(job_id, 100, 0), false, t0())
            .unwrap_err();
        assert!(matches!(err, crate::Error::BadTaskCount));

        let mut spec = StepCreateRequest::new(job_id, 100, 1);
        spec.name = Some("x".repeat(2000));
        let err = manager.create_step(spec, false, t0()).unwrap_err();
        assert!(matches!(err, crate::Error::PathnameTooLong));

        let mut spec = StepCreateRequest::new(job_id, 100, 1000);
        let err = manager.create_step(spec.clone(), false, t0()).unwrap_err();
        assert!(matches!(err, crate::Error::BadTaskCount));
        spec.num_tasks = Some(1);

        manager.get_job_mut(job_id).unwrap().state = JobState::Pending;
        let err = manager.create_step(spec.clone(), false, t0()).unwrap_err();
        assert!(matches!(err, crate::Error::DuplicateJobId));

        manager.get_job_mut(job_id).unwrap().state = JobState::Suspended;
        let err = manager.create_step(spec.clone(), false, t0()).unwrap_err();
        assert!(matches!(err, crate::Error::Disabled));

        manager.get_job_mut(job_id).unwrap().state = JobState::Finished;
        let err = manager.create_step(spec, false, t0()).unwrap_err();
        assert!(matches!(err, crate::Error::AlreadyDone));

        assert_eq!(agent.len(), 0);
        assert!(manager.get_job(job_id).unwrap().steps.is_empty());
    }

    #[test]
    fn test_arbitrary_distribution_rejected_on_elan() {
        let (mut manager, _agent, job_id) = test_manager(2, 4, None);
        manager.config.switch_type = "switch/elan".to_string();
        let mut spec = StepCreateRequest::new(job_id, 100, 2);
        spec.task_dist = crate::step::TaskDistribution::Arbitrary;
        spec.node_list = Some("n1,n0".to_string());
        let err = manager.create_step(spec, false, t0()).unwrap_err();
        assert!(matches!(err, crate::Error::ArbitraryUnsupported));
    }

    #[test]
    fn test_arbitrary_distribution_layout() {
        let (mut manager, _agent, job_id) = test_manager(2, 4, None);
        let mut spec = StepCreateRequest::new(job_id, 100, 3);
        spec.task_dist = crate::step::TaskDistribution::Arbitrary;
        spec.node_list = Some("n1,n0,n1".to_string());
        spec.min_nodes = 2;
        let step_id = manager.create_step(spec, false, t0()).unwrap();

        let job = manager.get_job(job_id).unwrap();
        let layout = job.find_step(Some(step_id)).unwrap().layout.as_ref().unwrap();
        assert_eq!(layout.node_list, "n1,n0,n1");
        assert_eq!(layout.tasks, vec![2, 1]);
        assert_eq!(layout.tids, vec![vec![0, 2], vec![1]]);
    }

    #[test]
    fn test_reserved_ports_derived_and_freed() {
        let (mut manager, _agent, job_id) = test_manager(2, 4, None);
        let mut spec = StepCreateRequest::new(job_id, 100, 4);
        spec.cpu_count = 8;
        spec.resv_port_cnt = Some(0); // derive from the layout
        let step_id = manager.create_step(spec, false, t0()).unwrap();

        let job = manager.get_job(job_id).unwrap();
        let step = job.find_step(Some(step_id)).unwrap();
        // max tasks on any node is 2, plus one
        assert_eq!(step.resv_port_cnt, Some(3));
        assert_eq!(step.resv_port_array.len(), 3);
        assert_eq!(step.resv_ports.as_deref(), Some("12000-12002"));

        manager.complete_step(job_id, step_id, 100, t0()).unwrap();
        // ports are reusable once the step is gone
        let mut spec = StepCreateRequest::new(job_id, 100, 1);
        spec.resv_port_cnt = Some(1);
        let next = manager.create_step(spec, false, t0()).unwrap();
        let job = manager.get_job(job_id).unwrap();
        assert_eq!(
            job.find_step(Some(next)).unwrap().resv_ports.as_deref(),
            Some("12000")
        );
    }

    #[test]
    fn test_complete_step_folds_exit_code() {
        let (mut manager, _agent, job_id) = test_manager(2, 4, None);
        let mut spec = StepCreateRequest::new(job_id, 100, 2);
        spec.min_nodes = 2;
        let step_id = manager.create_step(spec, false, t0()).unwrap();

        manager
            .partial_complete(&complete_req(job_id, step_id, 0, 1, 9), 0, t0())
            .unwrap();
        manager.complete_step(job_id, step_id, 100, t0()).unwrap();

        let job = manager.get_job(job_id).unwrap();
        assert!(job.steps.is_empty());
        assert_eq!(job.derived_exit_code, 9);
        assert_eq!(job.resources.cpus_used, vec![0, 0]);

        let err = manager.complete_step(job_id, step_id, 100, t0()).unwrap_err();
        assert!(matches!(err, crate::Error::InvalidJobId));
    }
}
