//! Node selection for a new step: chooses a subset of the parent
//! job's nodes satisfying the request's node/CPU/memory/GRES shape.

use chrono::{DateTime, Duration, Utc};

use crate::cluster::{ControllerConfig, NodeTable};
use crate::common::bitmap::Bitmap;
use crate::job::Job;
use crate::plugins::gres::{GresPlugin, GresStepState};
use crate::step::{StepCreateRequest, TaskDistribution};
use crate::{NodeId, INFINITE};

/// Select nodes for a job step. Satisfies the super-set of the
/// request's constraints; several request fields are rewritten along
/// the way (overcommit coercions happen in the caller, node counts and
/// the node list here).
///
/// Returns all of a job's usable nodes when `min_nodes == INFINITE`.
pub fn pick_step_nodes(
    job: &mut Job,
    spec: &mut StepCreateRequest,
    step_gres: Option<&dyn GresStepState>,
    cpus_per_task: u32,
    nodes: &NodeTable,
    config: &ControllerConfig,
    gres: &dyn GresPlugin,
    now: DateTime<Utc>,
) -> crate::Result<Bitmap> {
    let up_nodes = nodes.up_bitmap();

    if job.node_bitmap.is_empty() {
        return Err(crate::Error::RequestedNodeConfigUnavailable);
    }
    if spec.max_nodes != 0 && spec.max_nodes < spec.min_nodes {
        return Err(crate::Error::InvalidNodeCount);
    }

    let mut nodes_avail = job.node_bitmap.clone();
    nodes_avail.intersect_with(&up_nodes);

    if spec.mem_per_cpu != 0 && !job.resources.has_memory() {
        log::error!(
            "job {} lacks memory allocation details to enforce memory limits",
            job.job_id
        );
        spec.mem_per_cpu = 0;
    }

    if job.next_step_id == 0 {
        if job.prolog_running {
            return Err(crate::Error::PrologRunning);
        }
        for i in job.node_bitmap.iter_ones() {
            let node = nodes.get(i as NodeId);
            if node.power_save || !node.responding {
                // Node is/was powered down; wait for it to respond.
                // Push the job's end time out to cover the boot.
                if job.time_limit != INFINITE {
                    job.end_time = now + Duration::minutes(job.time_limit as i64);
                }
                return Err(crate::Error::NodesBusy);
            }
        }
        job.configuring = false;
        log::debug!("Configuration for job {} complete", job.job_id);
    }

    // In exclusive mode just satisfy the processor count, skipping
    // nodes with no unused CPUs or insufficient unused memory.
    if spec.exclusive {
        return pick_exclusive(job, spec, step_gres, cpus_per_task, nodes, gres, nodes_avail, &up_nodes);
    }

    let mut usable_cpu_cnt: Option<Vec<u32>> = None;
    let mut mem_blocked_nodes = 0u32;
    let mut mem_blocked_cpus = 0u32;

    if (spec.mem_per_cpu != 0 && config.mem_reserved) || spec.gres.is_some() {
        let mut usable = vec![0u32; nodes.len()];
        let mut fail_mode = crate::Error::InvalidTaskMemory;
        for (node_inx, i) in job.resources.node_bitmap.iter_ones().enumerate() {
            if !nodes_avail.get(i) {
                continue; // node now DOWN
            }
            let mut total_cpus = job.resources.cpus[node_inx];
            let mut avail_cpus = total_cpus;
            usable[i] = avail_cpus;
            if spec.mem_per_cpu != 0 {
                // ignore current step allocations
                let alloc_mem = job.resources.memory_allocated.as_ref().unwrap()[node_inx];
                let tmp_cpus = (alloc_mem / spec.mem_per_cpu) as u32;
                total_cpus = total_cpus.min(tmp_cpus);
                // consider current step allocations
                let free_mem =
                    alloc_mem.saturating_sub(job.resources.memory_used.as_ref().unwrap()[node_inx]);
                let tmp_cpus = (free_mem / spec.mem_per_cpu) as u32;
                if tmp_cpus < avail_cpus {
                    avail_cpus = tmp_cpus;
                    usable[i] = avail_cpus;
                    fail_mode = crate::Error::InvalidTaskMemory;
                }
            }
            if spec.gres.is_some() {
                // ignore current step allocations
                let tmp_cpus = gres.step_test(
                    step_gres,
                    job.gres_state.as_deref(),
                    node_inx,
                    true,
                    job.job_id,
                    None,
                );
                total_cpus = total_cpus.min(tmp_cpus);
                // consider current step allocations
                let tmp_cpus = gres.step_test(
                    step_gres,
                    job.gres_state.as_deref(),
                    node_inx,
                    false,
                    job.job_id,
                    None,
                );
                if tmp_cpus < avail_cpus {
                    avail_cpus = tmp_cpus;
                    usable[i] = avail_cpus;
                    fail_mode = crate::Error::InvalidGres;
                }
            }
            let (avail_tasks, total_tasks) = if cpus_per_task > 0 {
                (avail_cpus / cpus_per_task, total_cpus / cpus_per_task)
            } else {
                (avail_cpus, total_cpus)
            };
            if avail_tasks == 0 {
                if spec.min_nodes == INFINITE {
                    // every node must satisfy an all-nodes request
                    return Err(if total_tasks == 0 {
                        fail_mode
                    } else {
                        crate::Error::NodesBusy
                    });
                }
                nodes_avail.unset(i);
                mem_blocked_nodes += 1;
                mem_blocked_cpus += total_cpus - avail_cpus;
            }
        }
        usable_cpu_cnt = Some(usable);
    }

    if spec.min_nodes == INFINITE {
        // use all nodes
        return Ok(nodes_avail);
    }

    let mut nodes_picked = Bitmap::new(nodes.len());
    let mut nodes_idle: Option<Bitmap> = None;

    if let Some(list) = spec.node_list.clone() {
        log::debug!("selected nodelist is {}", list);
        let selected = match nodes.hostlist_to_bitmap(&list) {
            Ok(selected) => selected,
            Err(e) => {
                log::info!("invalid node list {} for job {}: {}", list, job.job_id, e);
                return Err(crate::Error::RequestedNodeConfigUnavailable);
            }
        };
        if !job.node_bitmap.is_superset_of(&selected) {
            log::info!("requested nodes {} not part of job {}", list, job.job_id);
            return Err(crate::Error::RequestedNodeConfigUnavailable);
        }
        if !nodes_avail.is_superset_of(&selected) {
            log::info!("requested nodes {} have inadequate memory", list);
            return Err(crate::Error::InvalidTaskMemory);
        }

        let mut selected = Some(selected);
        if spec.task_dist == TaskDistribution::Arbitrary {
            if config.switch_type == "switch/elan" {
                // An arbitrary layout cannot be programmed on an elan
                // switch; fall back to a block layout over all nodes.
                log::info!(
                    "Can't do an ARBITRARY task layout with switch type elan. \
                     Switching DIST type to BLOCK"
                );
                spec.node_list = None;
                spec.task_dist = TaskDistribution::Block;
                selected = None;
                spec.min_nodes = nodes_avail.count() as u32;
            } else {
                spec.min_nodes = selected.as_ref().unwrap().count() as u32;
            }
        }
        if let Some(selected) = selected {
            let node_cnt = if spec.min_nodes != 0 || spec.max_nodes != 0 {
                selected.count() as u32
            } else {
                0
            };
            if spec.max_nodes != 0 && node_cnt > spec.max_nodes {
                log::info!(
                    "requested nodes {} exceed max node count for job step {}",
                    list,
                    job.job_id
                );
                return Err(crate::Error::RequestedNodeConfigUnavailable);
            } else if spec.min_nodes != 0 && node_cnt > spec.min_nodes {
                // more named than requested: treat the named nodes as
                // the pool and pick from it below
                nodes_avail = selected;
            } else {
                nodes_picked = selected.clone();
                nodes_avail.subtract(&selected);
            }
        }
    }

    if let Some(relative) = spec.relative {
        // skip the job's first `relative` nodes
        match nodes_avail.pick_count(relative as usize) {
            Some(relative_nodes) => nodes_avail.subtract(&relative_nodes),
            None => {
                log::info!(
                    "invalid relative value ({}) for job {}",
                    relative,
                    job.job_id
                );
                return Err(crate::Error::RequestedNodeConfigUnavailable);
            }
        }
    } else {
        let mut in_use = Bitmap::new(nodes.len());
        for step in &job.steps {
            log::debug!(
                "step {}.{} has nodes {}",
                job.job_id,
                step.step_id,
                step.step_node_bitmap.to_ranged_string()
            );
            in_use.union_with(&step.step_node_bitmap);
        }
        let mut idle = nodes_avail.clone();
        idle.subtract(&in_use);
        nodes_idle = Some(idle);
    }

    log::debug!(
        "step pick {}-{} nodes, avail:{} idle:{}",
        spec.min_nodes,
        spec.max_nodes,
        nodes_avail.to_ranged_string(),
        nodes_idle
            .as_ref()
            .map(|b| b.to_ranged_string())
            .unwrap_or_default()
    );

    // A specific processor count over a homogeneous allocation is just
    // a node count.
    if spec.cpu_count != 0 {
        if let Some(cpus_per_node) = job.resources.homogeneous_cpus() {
            let needed = (spec.cpu_count + cpus_per_node - 1) / cpus_per_node;
            if needed > spec.min_nodes {
                spec.min_nodes = needed;
            }
            if spec.max_nodes != 0 && spec.max_nodes < spec.min_nodes {
                log::info!(
                    "job step {} max node count incompatible with CPU count",
                    job.job_id
                );
                return Err(crate::Error::TooManyRequestedCpus);
            }
        }
    }

    if spec.min_nodes != 0 {
        let mut nodes_picked_cnt = nodes_picked.count() as u32;
        log::debug!("got {} {}", spec.min_nodes, nodes_picked_cnt);
        if let Some(idle) = nodes_idle.as_mut() {
            if idle.count() as u32 >= spec.min_nodes && spec.min_nodes > nodes_picked_cnt {
                let picked = idle
                    .pick_count((spec.min_nodes - nodes_picked_cnt) as usize)
                    .unwrap();
                nodes_picked.union_with(&picked);
                idle.subtract(&picked);
                nodes_avail.subtract(&picked);
                nodes_picked_cnt = spec.min_nodes;
            }
        }
        if spec.min_nodes > nodes_picked_cnt {
            match nodes_avail.pick_count((spec.min_nodes - nodes_picked_cnt) as usize) {
                Some(picked) => {
                    nodes_picked.union_with(&picked);
                    nodes_avail.subtract(&picked);
                }
                None => {
                    if spec.min_nodes
                        <= nodes_avail.count() as u32 + nodes_picked_cnt + mem_blocked_nodes
                    {
                        return Err(crate::Error::NodesBusy);
                    } else if !up_nodes.is_superset_of(&job.node_bitmap) {
                        return Err(crate::Error::NodeNotAvail);
                    }
                    return Err(crate::Error::RequestedNodeConfigUnavailable);
                }
            }
        }
    }

    if spec.cpu_count != 0 {
        // make sure the selected nodes have enough cpus
        let mut cpus_picked_cnt =
            count_cpus(job, &nodes_picked, usable_cpu_cnt.as_deref(), nodes, config);
        if spec.cpu_count > cpus_picked_cnt
            && (spec.max_nodes == 0 || spec.max_nodes > nodes_picked.count() as u32)
        {
            let mut nodes_picked_cnt = nodes_picked.count() as u32;
            while spec.cpu_count > cpus_picked_cnt {
                let node_tmp = match nodes_avail.pick_count(1) {
                    Some(node_tmp) => node_tmp,
                    None => break,
                };
                let cpu_cnt = count_cpus(job, &node_tmp, usable_cpu_cnt.as_deref(), nodes, config);
                if cpu_cnt == 0 {
                    // node not usable (insufficient memory for any CPU)
                    nodes_avail.subtract(&node_tmp);
                    continue;
                }
                nodes_picked.union_with(&node_tmp);
                nodes_avail.subtract(&node_tmp);
                nodes_picked_cnt += 1;
                if spec.min_nodes != 0 {
                    spec.min_nodes = nodes_picked_cnt;
                }
                cpus_picked_cnt += cpu_cnt;
                if spec.max_nodes != 0 && nodes_picked_cnt >= spec.max_nodes {
                    break;
                }
            }
        }

        if spec.cpu_count > cpus_picked_cnt {
            if spec.cpu_count <= cpus_picked_cnt + mem_blocked_cpus {
                return Err(crate::Error::NodesBusy);
            } else if !up_nodes.is_superset_of(&job.node_bitmap) {
                return Err(crate::Error::NodeNotAvail);
            }
            log::debug!(
                "have {} nodes with {} cpus which is less than what the user \
                 is asking for ({} cpus) aborting",
                nodes_picked.count(),
                cpus_picked_cnt,
                spec.cpu_count
            );
            return Err(crate::Error::RequestedNodeConfigUnavailable);
        }
    }

    Ok(nodes_picked)
}

fn pick_exclusive(
    job: &mut Job,
    spec: &mut StepCreateRequest,
    step_gres: Option<&dyn GresStepState>,
    cpus_per_task: u32,
    nodes: &NodeTable,
    gres: &dyn GresPlugin,
    mut nodes_avail: Bitmap,
    up_nodes: &Bitmap,
) -> crate::Result<Bitmap> {
    let requested_tasks = spec.num_tasks.unwrap_or(u32::MAX);
    let mut selected_nodes: Option<Bitmap> = None;

    if let Some(list) = &spec.node_list {
        let selected = match nodes.hostlist_to_bitmap(list) {
            Ok(selected) => selected,
            Err(e) => {
                log::info!(
                    "invalid node list ({}) for job step {}: {}",
                    list,
                    job.job_id,
                    e
                );
                return Err(crate::Error::RequestedNodeConfigUnavailable);
            }
        };
        if !job.node_bitmap.is_superset_of(&selected) {
            log::info!("selected nodes ({}) not in job {}", list, job.job_id);
            return Err(crate::Error::RequestedNodeConfigUnavailable);
        }
        if !up_nodes.is_superset_of(&selected) {
            log::info!("selected nodes ({}) are DOWN", list);
            return Err(crate::Error::RequestedNodeConfigUnavailable);
        }
        selected_nodes = Some(selected);
    }

    let mut nodes_picked_cnt = 0u32;
    let mut tasks_picked_cnt = 0u32;
    let mut total_task_cnt = 0u32;

    for (node_inx, i) in job.resources.node_bitmap.iter_ones().enumerate() {
        if !nodes_avail.get(i) {
            continue; // node now DOWN
        }
        let avail_cpus = job.resources.cpus[node_inx] - job.resources.cpus_used[node_inx];
        let total_cpus = job.resources.cpus[node_inx];
        let (mut avail_tasks, mut total_tasks) = if cpus_per_task > 0 {
            (avail_cpus / cpus_per_task, total_cpus / cpus_per_task)
        } else {
            (requested_tasks, requested_tasks)
        };
        if spec.mem_per_cpu != 0 {
            let total_mem = job.resources.memory_allocated.as_ref().unwrap()[node_inx];
            let avail_mem =
                total_mem.saturating_sub(job.resources.memory_used.as_ref().unwrap()[node_inx]);
            let mut task_cnt = (avail_mem / spec.mem_per_cpu) as u32;
            if cpus_per_task > 0 {
                task_cnt /= cpus_per_task;
            }
            avail_tasks = avail_tasks.min(task_cnt);
            let mut task_cnt = (total_mem / spec.mem_per_cpu) as u32;
            if cpus_per_task > 0 {
                task_cnt /= cpus_per_task;
            }
            total_tasks = total_tasks.min(task_cnt);
        }

        let mut gres_cnt = gres.step_test(
            step_gres,
            job.gres_state.as_deref(),
            node_inx,
            false,
            job.job_id,
            None,
        );
        if cpus_per_task > 0 {
            gres_cnt /= cpus_per_task;
        }
        avail_tasks = avail_tasks.min(gres_cnt);
        let mut gres_cnt = gres.step_test(
            step_gres,
            job.gres_state.as_deref(),
            node_inx,
            true,
            job.job_id,
            None,
        );
        if cpus_per_task > 0 {
            gres_cnt /= cpus_per_task;
        }
        total_tasks = total_tasks.min(gres_cnt);

        if spec.max_nodes != 0 && nodes_picked_cnt >= spec.max_nodes {
            nodes_avail.unset(i);
        } else if avail_tasks == 0
            || (selected_nodes.is_none()
                && nodes_picked_cnt >= spec.min_nodes
                && tasks_picked_cnt > 0
                && tasks_picked_cnt >= requested_tasks)
        {
            nodes_avail.unset(i);
            total_task_cnt = total_task_cnt.saturating_add(total_tasks);
        } else {
            nodes_picked_cnt += 1;
            tasks_picked_cnt = tasks_picked_cnt.saturating_add(avail_tasks);
            total_task_cnt = total_task_cnt.saturating_add(total_tasks);
        }
    }

    if let Some(selected) = selected_nodes {
        if selected != nodes_avail {
            // some required nodes have no available processors,
            // defer the request
            tasks_picked_cnt = 0;
        }
    }

    if tasks_picked_cnt >= requested_tasks {
        return Ok(nodes_avail);
    }
    if total_task_cnt >= requested_tasks {
        Err(crate::Error::NodesBusy)
    } else {
        Err(crate::Error::RequestedNodeConfigUnavailable)
    }
}

/// CPUs this job has allocated on the nodes of `bitmap`, substituting
/// `usable_cpu_cnt` (indexed by global node id) when provided. Falls
/// back to node-table CPU counts if the job lacks a CPU array.
pub fn count_cpus(
    job: &Job,
    bitmap: &Bitmap,
    usable_cpu_cnt: Option<&[u32]>,
    nodes: &NodeTable,
    config: &ControllerConfig,
) -> u32 {
    let mut sum = 0u32;
    if !job.resources.cpus.is_empty() {
        for (node_inx, i) in job.resources.node_bitmap.iter_ones().enumerate() {
            if !job.node_bitmap.get(i) || !bitmap.get(i) {
                // absent from current job or step bitmap
                continue;
            }
            sum += match usable_cpu_cnt {
                Some(usable) => usable[i],
                None => job.resources.cpus[node_inx],
            };
        }
    } else {
        log::error!("job {} lacks cpus array", job.job_id);
        for i in bitmap.iter_ones() {
            let node = nodes.get(i as NodeId);
            sum += if config.fast_schedule {
                node.config_cpus
            } else {
                node.cpus
            };
        }
    }
    sum
}
