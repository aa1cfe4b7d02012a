//! Checkpoint plugin contract: per-step opaque state plus the
//! operations the controller forwards on behalf of clients.

use std::any::Any;
use std::fmt;

use chrono::{DateTime, Utc};

use crate::common::pack::{PackBuffer, PackError, UnpackBuffer};
use crate::{JobId, StepId};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CheckpointOp {
    Able,
    Disable,
    Enable,
    Create,
    Vacate,
    Error,
    Restart,
}

#[derive(Debug, Clone, Default)]
pub struct CheckpointReply {
    pub event_time: Option<DateTime<Utc>>,
    pub error_code: u32,
    pub error_msg: Option<String>,
}

pub trait CheckpointJobInfo: fmt::Debug {
    fn as_any(&self) -> &dyn Any;
    fn as_any_mut(&mut self) -> &mut dyn Any;
}

pub trait CheckpointPlugin {
    fn alloc_jobinfo(&self) -> Box<dyn CheckpointJobInfo>;

    fn pack_jobinfo(&self, info: &dyn CheckpointJobInfo, buffer: &mut PackBuffer);

    fn unpack_jobinfo(
        &self,
        buffer: &mut UnpackBuffer<'_>,
    ) -> Result<Box<dyn CheckpointJobInfo>, PackError>;

    /// Perform a checkpoint operation. `info` is absent for job-level
    /// (batch script) checkpoints.
    fn op(
        &self,
        job_id: JobId,
        step_id: StepId,
        info: Option<&mut dyn CheckpointJobInfo>,
        op: CheckpointOp,
        data: u16,
        image_dir: &str,
    ) -> crate::Result<CheckpointReply>;

    /// Note completion of a step checkpoint.
    fn comp(
        &self,
        info: &mut dyn CheckpointJobInfo,
        begin_time: DateTime<Utc>,
        error_code: u32,
        error_msg: Option<&str>,
    ) -> crate::Result<()>;

    /// Note completion of a single task's checkpoint.
    fn task_comp(
        &self,
        info: &mut dyn CheckpointJobInfo,
        task_id: u32,
        begin_time: DateTime<Utc>,
        error_code: u32,
        error_msg: Option<&str>,
    ) -> crate::Result<()>;
}

#[derive(Debug)]
struct NoneCheckpointInfo;

impl CheckpointJobInfo for NoneCheckpointInfo {
    fn as_any(&self) -> &dyn Any {
        self
    }
    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}

pub struct NoneCheckpoint;

impl CheckpointPlugin for NoneCheckpoint {
    fn alloc_jobinfo(&self) -> Box<dyn CheckpointJobInfo> {
        Box::new(NoneCheckpointInfo)
    }

    fn pack_jobinfo(&self, _info: &dyn CheckpointJobInfo, _buffer: &mut PackBuffer) {}

    fn unpack_jobinfo(
        &self,
        _buffer: &mut UnpackBuffer<'_>,
    ) -> Result<Box<dyn CheckpointJobInfo>, PackError> {
        Ok(Box::new(NoneCheckpointInfo))
    }

    fn op(
        &self,
        _job_id: JobId,
        _step_id: StepId,
        _info: Option<&mut dyn CheckpointJobInfo>,
        _op: CheckpointOp,
        _data: u16,
        _image_dir: &str,
    ) -> crate::Result<CheckpointReply> {
        Ok(CheckpointReply::default())
    }

    fn comp(
        &self,
        _info: &mut dyn CheckpointJobInfo,
        _begin_time: DateTime<Utc>,
        _error_code: u32,
        _error_msg: Option<&str>,
    ) -> crate::Result<()> {
        Ok(())
    }

    fn task_comp(
        &self,
        _info: &mut dyn CheckpointJobInfo,
        _task_id: u32,
        _begin_time: DateTime<Utc>,
        _error_code: u32,
        _error_msg: Option<&str>,
    ) -> crate::Result<()> {
        Ok(())
    }
}
