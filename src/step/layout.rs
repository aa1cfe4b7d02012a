//! Task layout: how many tasks land on each step node and which task
//! ids they get, for a chosen distribution policy.

use serde::{Deserialize, Serialize};
use smallvec::SmallVec;

use crate::cluster::ControllerConfig;
use crate::common::pack::{PackBuffer, PackError, UnpackBuffer};
use crate::common::hostlist;
use crate::job::Job;
use crate::plugins::gres::GresPlugin;
use crate::step::{StepRecord, TaskDistribution};

/// Materialised placement of a step's tasks (absent for batch steps).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepLayout {
    /// Ranged hostlist of the step's nodes; for an arbitrary
    /// distribution this is the caller's ordered list.
    pub node_list: String,
    pub node_cnt: u32,
    pub task_cnt: u32,
    /// Task count per step-local node.
    pub tasks: Vec<u32>,
    /// Task ids assigned to each step-local node.
    pub tids: Vec<Vec<u32>>,
}

impl StepLayout {
    pub fn pack(&self, buffer: &mut PackBuffer) {
        buffer.put_str(Some(&self.node_list));
        buffer.put_u32(self.node_cnt);
        buffer.put_u32(self.task_cnt);
        for count in &self.tasks {
            buffer.put_u32(*count);
        }
        for tids in &self.tids {
            buffer.put_u32(tids.len() as u32);
            for tid in tids {
                buffer.put_u32(*tid);
            }
        }
    }

    pub fn unpack(buffer: &mut UnpackBuffer<'_>) -> Result<StepLayout, PackError> {
        let node_list = buffer
            .get_str()?
            .ok_or_else(|| PackError::Malformed("layout without node list".to_string()))?;
        let node_cnt = buffer.get_u32()?;
        if node_cnt > 1 << 20 {
            return Err(PackError::Malformed("layout node count".to_string()));
        }
        let task_cnt = buffer.get_u32()?;
        let mut tasks = Vec::with_capacity(node_cnt as usize);
        for _ in 0..node_cnt {
            tasks.push(buffer.get_u32()?);
        }
        let mut tids = Vec::with_capacity(node_cnt as usize);
        for _ in 0..node_cnt {
            let count = buffer.get_u32()? as usize;
            if count > task_cnt as usize {
                return Err(PackError::Malformed("layout task ids".to_string()));
            }
            let mut node_tids = Vec::with_capacity(count);
            for _ in 0..count {
                node_tids.push(buffer.get_u32()?);
            }
            tids.push(node_tids);
        }
        Ok(StepLayout {
            node_list,
            node_cnt,
            task_cnt,
            tasks,
            tids,
        })
    }
}

/// Build the layout for a new step: derive per-node usable CPU counts
/// from the job's allocation, then distribute the tasks.
#[allow(clippy::too_many_arguments)]
pub fn step_layout_create(
    job: &Job,
    step: &StepRecord,
    step_node_list: &str,
    node_count: u32,
    num_tasks: u32,
    cpus_per_task: u16,
    task_dist: TaskDistribution,
    plane_size: u32,
    config: &ControllerConfig,
    gres: &dyn GresPlugin,
) -> crate::Result<StepLayout> {
    let resources = &job.resources;
    let mem_enforced = step.mem_per_cpu != 0 && config.mem_reserved && resources.has_memory();

    // cpus-per-node run-length pairs for the subset of nodes used by
    // this step
    let mut cpus_per_node: SmallVec<[u32; 8]> = SmallVec::new();
    let mut cpu_count_reps: SmallVec<[u32; 8]> = SmallVec::new();
    let mut set_nodes = 0u32;

    for (job_node_offset, i) in job.node_bitmap.iter_ones().enumerate() {
        if !step.step_node_bitmap.get(i) {
            continue;
        }
        let pos = match resources.node_index(i) {
            Some(pos) => pos,
            None => return Err(crate::Error::GenericError("node outside allocation".into())),
        };
        let mut usable_cpus = if step.exclusive {
            resources.cpus[pos] - resources.cpus_used[pos]
        } else {
            resources.cpus[pos]
        };
        if mem_enforced {
            let usable_mem = resources.memory_allocated.as_ref().unwrap()[pos]
                .saturating_sub(resources.memory_used.as_ref().unwrap()[pos])
                / step.mem_per_cpu;
            usable_cpus = usable_cpus.min(usable_mem as u32);
        }
        let gres_cpus = gres.step_test(
            step.gres_state.as_deref(),
            job.gres_state.as_deref(),
            job_node_offset,
            false,
            job.job_id,
            Some(step.step_id),
        );
        usable_cpus = usable_cpus.min(gres_cpus);
        if usable_cpus == 0 {
            log::error!("step layout for job {} has no usable cpus", job.job_id);
            return Err(crate::Error::BadTaskCount);
        }
        log::debug!("step_layout cpus = {} pos = {}", usable_cpus, pos);

        match cpus_per_node.last() {
            Some(last) if *last == usable_cpus => *cpu_count_reps.last_mut().unwrap() += 1,
            _ => {
                cpus_per_node.push(usable_cpus);
                cpu_count_reps.push(1);
            }
        }
        set_nodes += 1;
        if set_nodes == node_count {
            break;
        }
    }

    distribute_tasks(
        step_node_list,
        &cpus_per_node,
        &cpu_count_reps,
        node_count,
        num_tasks,
        cpus_per_task,
        task_dist,
        plane_size,
    )
}

/// Distribute `num_tasks` over the step's nodes according to the
/// distribution policy, producing per-node task counts and ids.
#[allow(clippy::too_many_arguments)]
pub fn distribute_tasks(
    node_list: &str,
    cpus_per_node: &[u32],
    cpu_count_reps: &[u32],
    node_cnt: u32,
    num_tasks: u32,
    cpus_per_task: u16,
    task_dist: TaskDistribution,
    plane_size: u32,
) -> crate::Result<StepLayout> {
    if num_tasks == 0 || node_cnt == 0 {
        return Err(crate::Error::BadTaskCount);
    }

    // expand the run-length cpu counts to one entry per node
    let mut cpus: Vec<u32> = Vec::with_capacity(node_cnt as usize);
    for (count, reps) in cpus_per_node.iter().zip(cpu_count_reps) {
        for _ in 0..*reps {
            cpus.push(*count);
        }
    }
    if cpus.len() != node_cnt as usize {
        return Err(crate::Error::BadDistribution);
    }

    let cpt = cpus_per_task.max(1) as u32;
    let capacity: Vec<u32> = cpus.iter().map(|c| c / cpt).collect();
    let mut tasks = vec![0u32; node_cnt as usize];
    let mut tids: Vec<Vec<u32>> = vec![Vec::new(); node_cnt as usize];

    match task_dist {
        TaskDistribution::Arbitrary => {
            let entries = hostlist::expand(node_list)
                .map_err(|_| crate::Error::BadDistribution)?;
            if entries.len() != num_tasks as usize {
                log::error!(
                    "arbitrary layout lists {} entries for {} tasks",
                    entries.len(),
                    num_tasks
                );
                return Err(crate::Error::BadDistribution);
            }
            let mut order: Vec<String> = Vec::new();
            for entry in &entries {
                if !order.contains(entry) {
                    order.push(entry.clone());
                }
            }
            if order.len() != node_cnt as usize {
                return Err(crate::Error::BadDistribution);
            }
            for (tid, entry) in entries.iter().enumerate() {
                let node = order.iter().position(|n| n == entry).unwrap();
                tasks[node] += 1;
                tids[node].push(tid as u32);
            }
        }
        TaskDistribution::Plane => {
            if plane_size == 0 {
                return Err(crate::Error::BadDistribution);
            }
            let mut remaining = num_tasks;
            let mut tid = 0u32;
            while remaining > 0 {
                for node in 0..node_cnt as usize {
                    let chunk = plane_size.min(remaining);
                    for _ in 0..chunk {
                        tasks[node] += 1;
                        tids[node].push(tid);
                        tid += 1;
                    }
                    remaining -= chunk;
                    if remaining == 0 {
                        break;
                    }
                }
            }
        }
        dist if dist.is_cyclic() => {
            // one task per node in turn while capacity lasts, then
            // round-robin regardless of capacity
            let mut remaining = num_tasks;
            let mut tid = 0u32;
            while remaining > 0 {
                let mut progressed = false;
                for node in 0..node_cnt as usize {
                    if remaining == 0 {
                        break;
                    }
                    if tasks[node] < capacity[node] {
                        tasks[node] += 1;
                        tids[node].push(tid);
                        tid += 1;
                        remaining -= 1;
                        progressed = true;
                    }
                }
                if !progressed {
                    for node in 0..node_cnt as usize {
                        if remaining == 0 {
                            break;
                        }
                        tasks[node] += 1;
                        tids[node].push(tid);
                        tid += 1;
                        remaining -= 1;
                    }
                }
            }
        }
        _ => {
            // block: fill each node to capacity, then round-robin the
            // overcommitted remainder
            let mut remaining = num_tasks;
            let mut tid = 0u32;
            for node in 0..node_cnt as usize {
                let take = capacity[node].min(remaining);
                for _ in 0..take {
                    tasks[node] += 1;
                    tids[node].push(tid);
                    tid += 1;
                }
                remaining -= take;
                if remaining == 0 {
                    break;
                }
            }
            while remaining > 0 {
                for node in 0..node_cnt as usize {
                    if remaining == 0 {
                        break;
                    }
                    tasks[node] += 1;
                    tids[node].push(tid);
                    tid += 1;
                    remaining -= 1;
                }
            }
        }
    }

    Ok(StepLayout {
        node_list: node_list.to_string(),
        node_cnt,
        task_cnt: num_tasks,
        tasks,
        tids,
    })
}
