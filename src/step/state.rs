//! Step state dump/load for crash recovery. The field order is fixed;
//! two protocol versions are readable at once (the older one carries
//! no GRES plugin state but is otherwise identical).

use chrono::{DateTime, Utc};

use crate::common::bitmap::Bitmap;
use crate::common::pack::{PackBuffer, PackError, UnpackBuffer};
use crate::step::{StepLayout, StepManager};
use crate::{JobId, StepId, NO_VAL, NO_VAL16};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum StateVersion {
    V1,
    V2,
}

impl StateVersion {
    pub const CURRENT: StateVersion = StateVersion::V2;
}

impl StepManager {
    /// Serialise one step record. Always writes the current version;
    /// [`StepManager::load_step_state`] also reads the previous one.
    pub fn dump_step_state(
        &self,
        job_id: JobId,
        step_id: StepId,
        buffer: &mut PackBuffer,
    ) -> crate::Result<()> {
        let job = self.jobs.get(&job_id).ok_or(crate::Error::InvalidJobId)?;
        let step = job
            .find_step(Some(step_id))
            .ok_or(crate::Error::InvalidJobId)?;

        buffer.put_u32(step.step_id);
        buffer.put_u16(step.cyclic_alloc as u16);
        buffer.put_u16(step.port);
        buffer.put_u16(step.ckpt_interval);
        buffer.put_u16(step.cpus_per_task);
        buffer.put_u16(step.resv_port_cnt.unwrap_or(NO_VAL16));

        buffer.put_u8(step.no_kill as u8);

        buffer.put_u32(step.cpu_count);
        buffer.put_u64(step.mem_per_cpu);
        buffer.put_u32(step.exit_code);
        if step.exit_code != NO_VAL {
            // only present while a completion is actively in progress
            let fmt = step.exit_node_bitmap.as_ref().map(|b| b.to_ranged_string());
            buffer.put_str(fmt.as_deref());
            buffer.put_u16(
                step.exit_node_bitmap
                    .as_ref()
                    .map(|b| b.nbits() as u16)
                    .unwrap_or(0),
            );
        }
        match &step.core_bitmap_job {
            Some(bitmap) => {
                buffer.put_u32(bitmap.nbits() as u32);
                buffer.put_str(Some(&bitmap.to_ranged_string()));
            }
            None => buffer.put_u32(0),
        }

        buffer.put_u32(step.time_limit);
        buffer.put_time(step.start_time.timestamp());
        buffer.put_time(step.pre_sus_time);
        buffer.put_time(step.tot_sus_time);
        buffer.put_time(step.ckpt_time.timestamp());

        buffer.put_str(step.host.as_deref());
        buffer.put_str(step.resv_ports.as_deref());
        buffer.put_str(step.name.as_deref());
        buffer.put_str(step.network.as_deref());
        buffer.put_str(step.ckpt_dir.as_deref());

        buffer.put_str(step.gres.as_deref());
        self.plugins
            .gres
            .step_state_pack(step.gres_state.as_deref(), buffer);

        buffer.put_u16(step.batch_step as u16);
        if !step.batch_step {
            let layout = step
                .layout
                .as_ref()
                .ok_or_else(|| crate::Error::GenericError("step without layout".into()))?;
            layout.pack(buffer);
            match &step.switch_job {
                Some(info) => {
                    buffer.put_u8(1);
                    self.plugins.switch.pack_jobinfo(info.as_ref(), buffer);
                }
                None => buffer.put_u8(0),
            }
        }
        match &step.check_job {
            Some(info) => {
                buffer.put_u8(1);
                self.plugins.checkpoint.pack_jobinfo(info.as_ref(), buffer);
            }
            None => buffer.put_u8(0),
        }
        Ok(())
    }

    /// Recreate a step from dumped state, populating an existing
    /// record with the same id or allocating a new one.
    pub fn load_step_state(
        &mut self,
        job_id: JobId,
        buffer: &mut UnpackBuffer<'_>,
        version: StateVersion,
        now: DateTime<Utc>,
    ) -> crate::Result<StepId> {
        let step_id = buffer.get_u32()?;
        let cyclic_alloc = buffer.get_u16()?;
        let port = buffer.get_u16()?;
        let ckpt_interval = buffer.get_u16()?;
        let cpus_per_task = buffer.get_u16()?;
        let resv_port_cnt = buffer.get_u16()?;

        let no_kill = buffer.get_u8()?;

        let cpu_count = buffer.get_u32()?;
        let mem_per_cpu = buffer.get_u64()?;
        let exit_code = buffer.get_u32()?;
        let mut exit_bitmap_fmt = None;
        let mut exit_bitmap_bits = 0u16;
        if exit_code != NO_VAL {
            exit_bitmap_fmt = buffer.get_str()?;
            exit_bitmap_bits = buffer.get_u16()?;
        }
        let core_size = buffer.get_u32()?;
        let core_fmt = if core_size != 0 {
            buffer.get_str()?
        } else {
            None
        };

        let time_limit = buffer.get_u32()?;
        let start_time = buffer.get_time()?;
        let pre_sus_time = buffer.get_time()?;
        let tot_sus_time = buffer.get_time()?;
        let ckpt_time = buffer.get_time()?;

        let host = buffer.get_str()?;
        let resv_ports = buffer.get_str()?;
        let name = buffer.get_str()?;
        let network = buffer.get_str()?;
        let ckpt_dir = buffer.get_str()?;

        let gres = buffer.get_str()?;
        let gres_state = if version >= StateVersion::V2 {
            self.plugins.gres.step_state_unpack(buffer)?
        } else {
            None
        };

        let batch_step = buffer.get_u16()?;
        let mut layout = None;
        let mut switch_job = None;
        if batch_step == 0 {
            layout = Some(StepLayout::unpack(buffer)?);
            if buffer.get_u8()? != 0 {
                switch_job = Some(self.plugins.switch.unpack_jobinfo(buffer)?);
            }
        }
        let check_job = if buffer.get_u8()? != 0 {
            Some(self.plugins.checkpoint.unpack_jobinfo(buffer)?)
        } else {
            None
        };

        // validity tests as far as possible
        if cyclic_alloc > 1 {
            log::error!(
                "Invalid data for job {}.{}: cyclic_alloc={}",
                job_id,
                step_id,
                cyclic_alloc
            );
            return Err(PackError::Malformed("cyclic_alloc".to_string()).into());
        }
        if no_kill > 1 {
            log::error!(
                "Invalid data for job {}.{}: no_kill={}",
                job_id,
                step_id,
                no_kill
            );
            return Err(PackError::Malformed("no_kill".to_string()).into());
        }

        let exit_node_bitmap = match exit_bitmap_fmt {
            Some(fmt) => Some(
                Bitmap::from_ranged_string(exit_bitmap_bits as usize, &fmt)
                    .map_err(PackError::Malformed)?,
            ),
            None => None,
        };
        let core_bitmap_job = match core_fmt {
            Some(fmt) => Some(
                Bitmap::from_ranged_string(core_size as usize, &fmt)
                    .map_err(PackError::Malformed)?,
            ),
            None => None,
        };

        let step_node_bitmap = match &layout {
            Some(layout) => self
                .nodes
                .hostlist_to_bitmap(&layout.node_list)
                .map_err(PackError::Malformed)?,
            None => Bitmap::new(self.nodes.len()),
        };

        let job = self.jobs.get_mut(&job_id).ok_or(crate::Error::InvalidJobId)?;
        let step_index = match job.step_index(step_id) {
            Some(index) => index,
            None => {
                job.create_step_record(now)?;
                job.steps.len() - 1
            }
        };
        let step = &mut job.steps[step_index];

        step.step_id = step_id;
        step.cpu_count = cpu_count;
        step.cpus_per_task = cpus_per_task;
        step.cyclic_alloc = cyclic_alloc != 0;
        step.resv_port_cnt = (resv_port_cnt != NO_VAL16).then_some(resv_port_cnt);
        step.resv_ports = resv_ports;
        step.name = name;
        step.network = network;
        step.no_kill = no_kill != 0;
        step.ckpt_dir = ckpt_dir;
        step.gres = gres;
        step.gres_state = gres_state;
        step.port = port;
        step.ckpt_interval = ckpt_interval;
        step.mem_per_cpu = mem_per_cpu;
        step.host = host;
        step.batch_step = batch_step != 0;
        step.start_time = DateTime::from_timestamp(start_time, 0).unwrap_or_default();
        step.time_limit = time_limit;
        step.pre_sus_time = pre_sus_time;
        step.tot_sus_time = tot_sus_time;
        step.ckpt_time = DateTime::from_timestamp(ckpt_time, 0).unwrap_or_default();
        step.exit_code = exit_code;
        step.exit_node_bitmap = exit_node_bitmap;
        step.core_bitmap_job = core_bitmap_job;
        step.layout = layout;
        step.step_node_bitmap = step_node_bitmap;
        step.switch_job = switch_job;
        step.check_job = check_job;

        if let Some(info) = &step.switch_job {
            let node_list = step.layout.as_ref().map(|l| l.node_list.as_str());
            self.plugins.switch.job_step_allocated(info.as_ref(), node_list);
        }
        log::info!("recovered job step {}.{}", job_id, step_id);
        Ok(step_id)
    }
}

#[cfg(test)]
mod tests {
    use super::StateVersion;
    use crate::common::bitmap::Bitmap;
    use crate::common::pack::{PackBuffer, UnpackBuffer};
    use crate::step::StepCreateRequest;
    use crate::tests::utils::{test_manager, t0};
    use crate::NO_VAL16;

    #[test]
    fn test_dump_load_round_trip() {
        let (mut manager, _agent, job_id) = test_manager(2, 4, None);
        let mut spec = StepCreateRequest::new(job_id, 100, 4);
        spec.cpu_count = 8;
        spec.host = Some("login0".to_string());
        spec.port = 6817;
        spec.resv_port_cnt = Some(3);
        spec.time_limit = Some(45);
        let step_id = manager.create_step(spec, false, t0()).unwrap();

        // hand-paint a wide core bitmap with every 7th bit set
        {
            let step = manager
                .get_job_mut(job_id)
                .unwrap()
                .find_step_mut(Some(step_id))
                .unwrap();
            let mut bitmap = Bitmap::new(1024);
            for i in (0..1024).step_by(7) {
                bitmap.set(i);
            }
            step.core_bitmap_job = Some(bitmap);
        }

        let mut buffer = PackBuffer::new();
        manager.dump_step_state(job_id, step_id, &mut buffer).unwrap();
        let data = buffer.into_vec();

        // wipe the record, then recover it
        manager
            .get_job_mut(job_id)
            .unwrap()
            .remove_step(step_id)
            .unwrap();
        let loaded = manager
            .load_step_state(
                job_id,
                &mut UnpackBuffer::new(&data),
                StateVersion::CURRENT,
                t0(),
            )
            .unwrap();
        assert_eq!(loaded, step_id);

        let job = manager.get_job(job_id).unwrap();
        let step = job.find_step(Some(step_id)).unwrap();
        assert_eq!(step.cpus_per_task, 2);
        assert_eq!(step.cpu_count, 8);
        assert_eq!(step.time_limit, 45);
        assert_eq!(step.host.as_deref(), Some("login0"));
        assert_eq!(step.port, 6817);
        assert_eq!(step.resv_port_cnt, Some(3));
        assert_eq!(step.start_time, t0());
        let core = step.core_bitmap_job.as_ref().unwrap();
        assert_eq!(core.nbits(), 1024);
        assert_eq!(core.count(), (0..1024).step_by(7).count());
        assert!(core.get(7) && core.get(700));
        assert_eq!(step.step_node_bitmap.count(), 2);
        assert!(step.layout.is_some());
        assert!(step.switch_job.is_some());
        assert!(step.check_job.is_some());
    }

    #[test]
    fn test_load_rejects_corrupt_flags() {
        let (mut manager, _agent, job_id) = test_manager(1, 2, None);
        let step_id = manager
            .create_step(StepCreateRequest::new(job_id, 100, 1), false, t0())
            .unwrap();
        let mut buffer = PackBuffer::new();
        manager.dump_step_state(job_id, step_id, &mut buffer).unwrap();
        let mut data = buffer.into_vec();
        // cyclic_alloc is the u16 right after the step id
        data[5] = 9;
        let err = manager
            .load_step_state(
                job_id,
                &mut UnpackBuffer::new(&data),
                StateVersion::CURRENT,
                t0(),
            )
            .unwrap_err();
        assert!(matches!(err, crate::Error::StateFormat(_)));
    }

    #[test]
    fn test_load_older_version_without_gres_state() {
        let (mut manager, _agent, job_id) = test_manager(1, 2, None);

        // a hand-assembled batch step in the previous format, which
        // carries the gres request string but no plugin state
        let mut buffer = PackBuffer::new();
        buffer.put_u32(0); // step_id
        buffer.put_u16(0); // cyclic_alloc
        buffer.put_u16(0); // port
        buffer.put_u16(0); // ckpt_interval
        buffer.put_u16(0); // cpus_per_task
        buffer.put_u16(NO_VAL16); // resv_port_cnt
        buffer.put_u8(0); // no_kill
        buffer.put_u32(0); // cpu_count
        buffer.put_u64(0); // mem_per_cpu
        buffer.put_u32(crate::NO_VAL); // exit_code, no exit bitmap
        buffer.put_u32(0); // no core bitmap
        buffer.put_u32(crate::INFINITE); // time_limit
        buffer.put_time(t0().timestamp()); // start_time
        buffer.put_time(0); // pre_sus_time
        buffer.put_time(0); // tot_sus_time
        buffer.put_time(t0().timestamp()); // ckpt_time
        buffer.put_str(None); // host
        buffer.put_str(None); // resv_ports
        buffer.put_str(Some("batch")); // name
        buffer.put_str(None); // network
        buffer.put_str(None); // ckpt_dir
        buffer.put_str(None); // gres
        buffer.put_u16(1); // batch_step
        buffer.put_u8(0); // no checkpoint state

        let data = buffer.into_vec();
        let step_id = manager
            .load_step_state(job_id, &mut UnpackBuffer::new(&data), StateVersion::V1, t0())
            .unwrap();
        assert_eq!(step_id, 0);
        let job = manager.get_job(job_id).unwrap();
        let step = job.find_step(Some(0)).unwrap();
        assert!(step.batch_step);
        assert_eq!(step.time_limit, crate::INFINITE);
        assert_eq!(step.name.as_deref(), Some("batch"));
        assert!(step.gres_state.is_none());
    }
}
