//! Generic consumable resource (GRES) accounting contract. The step
//! manager only sees opaque per-job and per-step state plus usable-CPU
//! answers; the plugin owns the actual bookkeeping.

use std::any::Any;
use std::fmt;

use crate::common::pack::{PackBuffer, PackError, UnpackBuffer};
use crate::{JobId, StepId};

pub trait GresJobState: fmt::Debug {
    fn as_any(&self) -> &dyn Any;
    fn as_any_mut(&mut self) -> &mut dyn Any;
}

pub trait GresStepState: fmt::Debug {
    fn as_any(&self) -> &dyn Any;
    fn as_any_mut(&mut self) -> &mut dyn Any;
}

pub trait GresPlugin {
    /// Parse and validate a step's GRES request against the job's
    /// allocation, producing the step's tracking state.
    fn step_state_validate(
        &self,
        request: Option<&str>,
        job_state: Option<&dyn GresJobState>,
        job_id: JobId,
    ) -> crate::Result<Option<Box<dyn GresStepState>>>;

    /// How many CPUs a step could use on one job-local node given its
    /// GRES request; `u32::MAX` when the request does not constrain
    /// the node. With `ignore_alloc` the answer disregards what other
    /// live steps currently hold.
    fn step_test(
        &self,
        step_state: Option<&dyn GresStepState>,
        job_state: Option<&dyn GresJobState>,
        node_index: usize,
        ignore_alloc: bool,
        job_id: JobId,
        step_id: Option<StepId>,
    ) -> u32;

    fn step_alloc(
        &self,
        step_state: Option<&mut dyn GresStepState>,
        job_state: Option<&mut dyn GresJobState>,
        node_index: usize,
        cpus: u32,
        job_id: JobId,
        step_id: StepId,
    );

    fn step_dealloc(
        &self,
        step_state: Option<&mut dyn GresStepState>,
        job_state: Option<&mut dyn GresJobState>,
        node_index: usize,
        cpus: u32,
        job_id: JobId,
        step_id: StepId,
    );

    fn step_state_pack(&self, step_state: Option<&dyn GresStepState>, buffer: &mut PackBuffer);

    fn step_state_unpack(
        &self,
        buffer: &mut UnpackBuffer<'_>,
    ) -> Result<Option<Box<dyn GresStepState>>, PackError>;

    fn step_state_log(&self, step_state: Option<&dyn GresStepState>, job_id: JobId, step_id: StepId);
}

/// "No GRES configured": rejects explicit requests, constrains nothing.
pub struct NoneGres;

impl GresPlugin for NoneGres {
    fn step_state_validate(
        &self,
        request: Option<&str>,
        _job_state: Option<&dyn GresJobState>,
        job_id: JobId,
    ) -> crate::Result<Option<Box<dyn GresStepState>>> {
        match request {
            Some(spec) if !spec.is_empty() => {
                log::info!("job {} requested gres ({}) but none is configured", job_id, spec);
                Err(crate::Error::InvalidGres)
            }
            _ => Ok(None),
        }
    }

    fn step_test(
        &self,
        _step_state: Option<&dyn GresStepState>,
        _job_state: Option<&dyn GresJobState>,
        _node_index: usize,
        _ignore_alloc: bool,
        _job_id: JobId,
        _step_id: Option<StepId>,
    ) -> u32 {
        u32::MAX
    }

    fn step_alloc(
        &self,
        _step_state: Option<&mut dyn GresStepState>,
        _job_state: Option<&mut dyn GresJobState>,
        _node_index: usize,
        _cpus: u32,
        _job_id: JobId,
        _step_id: StepId,
    ) {
    }

    fn step_dealloc(
        &self,
        _step_state: Option<&mut dyn GresStepState>,
        _job_state: Option<&mut dyn GresJobState>,
        _node_index: usize,
        _cpus: u32,
        _job_id: JobId,
        _step_id: StepId,
    ) {
    }

    fn step_state_pack(&self, _step_state: Option<&dyn GresStepState>, buffer: &mut PackBuffer) {
        buffer.put_u8(0);
    }

    fn step_state_unpack(
        &self,
        buffer: &mut UnpackBuffer<'_>,
    ) -> Result<Option<Box<dyn GresStepState>>, PackError> {
        match buffer.get_u8()? {
            0 => Ok(None),
            _ => Err(PackError::Malformed(
                "gres state present but no gres plugin configured".to_string(),
            )),
        }
    }

    fn step_state_log(
        &self,
        _step_state: Option<&dyn GresStepState>,
        _job_id: JobId,
        _step_id: StepId,
    ) {
    }
}
