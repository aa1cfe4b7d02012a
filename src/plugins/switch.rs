//! Interconnect (switch) plugin contract. The step manager allocates
//! an opaque per-step handle, asks the plugin to program it for the
//! step's node list, and releases windows on (partial) completion.

use std::any::Any;
use std::fmt;

use crate::common::pack::{PackBuffer, PackError, UnpackBuffer};

pub trait SwitchJobInfo: fmt::Debug {
    fn as_any(&self) -> &dyn Any;
    fn as_any_mut(&mut self) -> &mut dyn Any;
}

pub trait SwitchPlugin {
    fn alloc_jobinfo(&self) -> Box<dyn SwitchJobInfo>;

    fn build_jobinfo(
        &self,
        info: &mut dyn SwitchJobInfo,
        node_list: &str,
        tasks_per_node: &[u32],
        cyclic: bool,
        network: Option<&str>,
    ) -> crate::Result<()>;

    fn pack_jobinfo(&self, info: &dyn SwitchJobInfo, buffer: &mut PackBuffer);

    fn unpack_jobinfo(
        &self,
        buffer: &mut UnpackBuffer<'_>,
    ) -> Result<Box<dyn SwitchJobInfo>, PackError>;

    /// Release all switch windows held for the listed nodes.
    fn job_step_complete(&self, info: &mut dyn SwitchJobInfo, node_list: &str);

    /// Release windows on a subset of nodes.
    fn job_step_part_comp(&self, info: &mut dyn SwitchJobInfo, node_list: &str);

    /// Whether the plugin supports partial release at all.
    fn part_comp(&self) -> bool;

    /// Reattach windows for a recovered step.
    fn job_step_allocated(&self, info: &dyn SwitchJobInfo, node_list: Option<&str>);
}

#[derive(Debug)]
struct NoneSwitchInfo;

impl SwitchJobInfo for NoneSwitchInfo {
    fn as_any(&self) -> &dyn Any {
        self
    }
    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}

pub struct NoneSwitch;

impl SwitchPlugin for NoneSwitch {
    fn alloc_jobinfo(&self) -> Box<dyn SwitchJobInfo> {
        Box::new(NoneSwitchInfo)
    }

    fn build_jobinfo(
        &self,
        _info: &mut dyn SwitchJobInfo,
        _node_list: &str,
        _tasks_per_node: &[u32],
        _cyclic: bool,
        _network: Option<&str>,
    ) -> crate::Result<()> {
        Ok(())
    }

    fn pack_jobinfo(&self, _info: &dyn SwitchJobInfo, _buffer: &mut PackBuffer) {}

    fn unpack_jobinfo(
        &self,
        _buffer: &mut UnpackBuffer<'_>,
    ) -> Result<Box<dyn SwitchJobInfo>, PackError> {
        Ok(Box::new(NoneSwitchInfo))
    }

    fn job_step_complete(&self, _info: &mut dyn SwitchJobInfo, _node_list: &str) {}

    fn job_step_part_comp(&self, _info: &mut dyn SwitchJobInfo, _node_list: &str) {}

    fn part_comp(&self) -> bool {
        false
    }

    fn job_step_allocated(&self, _info: &dyn SwitchJobInfo, _node_list: Option<&str>) {}
}
