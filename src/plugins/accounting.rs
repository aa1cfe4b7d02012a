//! Accounting-storage hooks and the per-step usage record that
//! completing nodes report back.

use serde::{Deserialize, Serialize};

use crate::job::Job;
use crate::step::StepRecord;
use crate::Uid;

/// Aggregated usage of a step, merged as node reports arrive.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobAccount {
    pub user_cpu_sec: u64,
    pub sys_cpu_sec: u64,
    pub max_rss: u64,
    pub max_vsize: u64,
    pub tasks: u32,
}

impl JobAccount {
    pub fn aggregate(&mut self, other: &JobAccount) {
        self.user_cpu_sec += other.user_cpu_sec;
        self.sys_cpu_sec += other.sys_cpu_sec;
        self.max_rss = self.max_rss.max(other.max_rss);
        self.max_vsize = self.max_vsize.max(other.max_vsize);
        self.tasks += other.tasks;
    }
}

pub trait AccountingStorage {
    fn job_start(&self, job: &Job);

    fn step_start(&self, job: &Job, step: &StepRecord);

    fn step_complete(&self, job: &Job, step: &StepRecord);

    /// Whether `uid` coordinates the account the job runs under.
    fn is_user_acct_coord(&self, _uid: Uid, _account: Option<&str>) -> bool {
        false
    }
}

pub struct NoneAccounting;

impl AccountingStorage for NoneAccounting {
    fn job_start(&self, _job: &Job) {}
    fn step_start(&self, _job: &Job, _step: &StepRecord) {}
    fn step_complete(&self, _job: &Job, _step: &StepRecord) {}
}
