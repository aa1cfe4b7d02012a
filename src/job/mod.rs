pub mod resources;

use chrono::{DateTime, Utc};

use crate::common::bitmap::Bitmap;
use crate::plugins::gres::GresJobState;
use crate::step::StepRecord;
use crate::{JobId, StepId, Uid, INFINITE, MAX_STEP_ID};

pub use resources::JobResources;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobState {
    Pending,
    Running,
    Suspended,
    Finished,
}

/// The parent allocation a step is carved out of. The job exclusively
/// owns its step records; everything else here is read-mostly from the
/// step manager's point of view.
pub struct Job {
    pub job_id: JobId,
    pub user_id: Uid,
    pub name: String,
    pub partition: String,
    pub partition_hidden: bool,
    /// Partition time limit in minutes, INFINITE when none.
    pub partition_max_time: u32,
    pub account: Option<String>,
    pub network: Option<String>,
    pub state: JobState,
    /// Set until the first step confirms all nodes booted.
    pub configuring: bool,
    pub prolog_running: bool,
    /// Job was submitted as a batch script.
    pub batch_flag: bool,
    pub batch_host: Option<String>,
    /// Ranged hostlist of the allocation.
    pub nodes: String,
    pub node_bitmap: Bitmap,
    pub resources: JobResources,
    pub gres: Option<String>,
    pub gres_state: Option<Box<dyn GresJobState>>,
    pub total_cpus: u32,
    /// Minutes, INFINITE when unlimited.
    pub time_limit: u32,
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
    /// When suspended: the suspension instant; after a resume: the
    /// resume instant. The step bookkeeping depends on this overload.
    pub suspend_time: Option<DateTime<Utc>>,
    pub ckpt_interval: u16,
    pub ckpt_time: DateTime<Utc>,
    pub ckpt_dir: Option<String>,
    pub derived_exit_code: u32,
    /// Job has been registered with accounting storage.
    pub db_indexed: bool,
    pub next_step_id: StepId,
    pub steps: Vec<StepRecord>,
}

impl Job {
    #[inline]
    pub fn is_pending(&self) -> bool {
        self.state == JobState::Pending
    }

    #[inline]
    pub fn is_running(&self) -> bool {
        self.state == JobState::Running
    }

    #[inline]
    pub fn is_suspended(&self) -> bool {
        self.state == JobState::Suspended
    }

    #[inline]
    pub fn is_finished(&self) -> bool {
        self.state == JobState::Finished
    }

    /// Find a step; `None` matches the first one.
    pub fn find_step(&self, step_id: Option<StepId>) -> Option<&StepRecord> {
        match step_id {
            Some(id) => self.steps.iter().find(|s| s.step_id == id),
            None => self.steps.first(),
        }
    }

    pub fn find_step_mut(&mut self, step_id: Option<StepId>) -> Option<&mut StepRecord> {
        match step_id {
            Some(id) => self.steps.iter_mut().find(|s| s.step_id == id),
            None => self.steps.first_mut(),
        }
    }

    pub fn step_index(&self, step_id: StepId) -> Option<usize> {
        self.steps.iter().position(|s| s.step_id == step_id)
    }

    /// Append an empty step record with the next id. The highest ids
    /// are reserved, so creation fails once the counter reaches them.
    pub fn create_step_record(&mut self, now: DateTime<Utc>) -> crate::Result<&mut StepRecord> {
        if self.next_step_id >= MAX_STEP_ID {
            log::info!("job {} has reached its step id limit", self.job_id);
            return Err(crate::Error::TooManySteps);
        }
        let step_id = self.next_step_id;
        self.next_step_id += 1;
        let mut step = StepRecord::new(step_id, self.node_bitmap.nbits());
        step.start_time = now;
        step.ckpt_time = now;
        self.steps.push(step);
        Ok(self.steps.last_mut().unwrap())
    }

    /// Detach a step record; the caller releases its plugin state.
    pub fn remove_step(&mut self, step_id: StepId) -> Option<StepRecord> {
        let index = self.step_index(step_id)?;
        Some(self.steps.remove(index))
    }

    /// Minutes a step may still run before the job's own limit ends it.
    pub fn remaining_minutes(&self, now: DateTime<Utc>) -> u32 {
        if self.time_limit == INFINITE {
            return INFINITE;
        }
        let remaining = self.end_time.signed_duration_since(now).num_minutes();
        remaining.max(0) as u32
    }
}
