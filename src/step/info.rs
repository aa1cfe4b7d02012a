//! Read-only step snapshots for client queries, packed with a
//! retroactively patched record count.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::common::pack::PackBuffer;
use crate::job::Job;
use crate::step::{StepManager, StepRecord};
use crate::{JobId, StepId, Uid};

/// One step as reported to clients.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepInfo {
    pub job_id: JobId,
    pub step_id: StepId,
    pub ckpt_interval: u16,
    pub user_id: Uid,
    pub cpu_count: u32,
    pub task_cnt: u32,
    pub time_limit: u32,
    pub start_time: DateTime<Utc>,
    /// Seconds, excluding suspended time.
    pub run_time: i64,
    pub partition: String,
    pub resv_ports: Option<String>,
    pub node_list: String,
    pub name: Option<String>,
    pub network: Option<String>,
    pub node_bitmap_fmt: String,
    pub ckpt_dir: Option<String>,
    pub gres: Option<String>,
}

impl StepInfo {
    pub fn pack(&self, buffer: &mut PackBuffer) {
        buffer.put_u32(self.job_id);
        buffer.put_u32(self.step_id);
        buffer.put_u16(self.ckpt_interval);
        buffer.put_u32(self.user_id);
        buffer.put_u32(self.cpu_count);
        buffer.put_u32(self.task_cnt);
        buffer.put_u32(self.time_limit);
        buffer.put_time(self.start_time.timestamp());
        buffer.put_time(self.run_time);
        buffer.put_str(Some(&self.partition));
        buffer.put_str(self.resv_ports.as_deref());
        buffer.put_str(Some(&self.node_list));
        buffer.put_str(self.name.as_deref());
        buffer.put_str(self.network.as_deref());
        buffer.put_str(Some(&self.node_bitmap_fmt));
        buffer.put_str(self.ckpt_dir.as_deref());
        buffer.put_str(self.gres.as_deref());
    }
}

impl StepManager {
    fn step_info(&self, job: &Job, step: &StepRecord, now: DateTime<Utc>) -> StepInfo {
        // On a front-end system the steps only execute on one node but
        // are reported against the job's entire allocation, which is
        // where they really run.
        let (task_cnt, node_list, bitmap) = if self.config.front_end {
            (job.total_cpus, job.nodes.clone(), &job.node_bitmap)
        } else {
            match &step.layout {
                Some(layout) => (
                    layout.task_cnt,
                    layout.node_list.clone(),
                    &step.step_node_bitmap,
                ),
                None => (job.total_cpus, job.nodes.clone(), &step.step_node_bitmap),
            }
        };
        StepInfo {
            job_id: job.job_id,
            step_id: step.step_id,
            ckpt_interval: step.ckpt_interval,
            user_id: job.user_id,
            cpu_count: step.cpu_count,
            task_cnt,
            time_limit: step.time_limit,
            start_time: step.start_time,
            run_time: step.run_time(now, job.is_suspended(), job.suspend_time),
            partition: job.partition.clone(),
            resv_ports: step.resv_ports.clone(),
            node_list,
            name: step.name.clone(),
            network: step.network.clone(),
            node_bitmap_fmt: bitmap.to_ranged_string(),
            ckpt_dir: step.ckpt_dir.clone(),
            gres: step.gres.clone(),
        }
    }

    fn visible_to(&self, job: &Job, uid: Uid, show_all: bool) -> bool {
        if !show_all && job.partition_hidden {
            return false;
        }
        if self.config.private_job_data
            && job.user_id != uid
            && !self.is_cluster_user(uid)
            && !self
                .plugins
                .accounting
                .is_user_acct_coord(uid, job.account.as_deref())
        {
            return false;
        }
        true
    }

    /// Snapshot the matching steps, applying visibility filters.
    pub fn step_info_list(
        &self,
        job_id: Option<JobId>,
        step_id: Option<StepId>,
        uid: Uid,
        show_all: bool,
        now: DateTime<Utc>,
    ) -> crate::Result<Vec<StepInfo>> {
        let mut infos = Vec::new();
        let mut valid_job = false;
        let mut jobs: Vec<&Job> = self.jobs.values().collect();
        jobs.sort_unstable_by_key(|job| job.job_id);
        for job in jobs {
            if let Some(id) = job_id {
                if job.job_id != id {
                    continue;
                }
            }
            if !self.visible_to(job, uid, show_all) {
                continue;
            }
            valid_job = true;
            for step in &job.steps {
                if let Some(id) = step_id {
                    if step.step_id != id {
                        continue;
                    }
                }
                infos.push(self.step_info(job, step, now));
            }
        }
        if !self.jobs.is_empty() && !valid_job && infos.is_empty() {
            return Err(crate::Error::InvalidJobId);
        }
        Ok(infos)
    }

    /// Pack the matching steps: `now`, a record count (patched in at
    /// the end) and one snapshot per step.
    pub fn pack_info_response(
        &self,
        job_id: Option<JobId>,
        step_id: Option<StepId>,
        uid: Uid,
        show_all: bool,
        now: DateTime<Utc>,
    ) -> crate::Result<Vec<u8>> {
        let mut buffer = PackBuffer::new();
        buffer.put_time(now.timestamp());
        let count_position = buffer.position();
        buffer.put_u32(0); // record count placeholder

        let infos = self.step_info_list(job_id, step_id, uid, show_all, now)?;
        for info in &infos {
            info.pack(&mut buffer);
        }
        buffer.patch_u32(count_position, infos.len() as u32);
        Ok(buffer.into_vec())
    }
}
