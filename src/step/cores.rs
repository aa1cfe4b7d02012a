//! Core painting: marking (socket, core) cells of the job's core
//! bitmap as claimed by a step, and releasing them on completion.

use crate::common::bitmap::Bitmap;
use crate::job::JobResources;

/// Claim cores for `task_cnt` tasks of a step on one job-local node,
/// extending the step's core bitmap (created on first use).
///
/// Idle cores are taken first; if demand remains the step
/// over-subscribes cores already claimed by other steps, starting at a
/// rotating cursor so the extra load is not always stacked on core
/// zero. Over-subscribed cells are step-private: the job's "used"
/// shadow is not touched for them.
pub fn pick_step_cores(
    step_core_bitmap: &mut Option<Bitmap>,
    resources: &mut JobResources,
    job_node_inx: usize,
    task_cnt: u32,
    cpus_per_task: u16,
    last_core_inx: &mut usize,
) {
    let (sockets, cores) = resources.socket_core_count(job_node_inx);
    let node_base = resources.core_offset(job_node_inx, 0, 0);
    let offset =
        |socket: u16, core: u16| node_base + socket as usize * cores as usize + core as usize;

    let JobResources {
        core_bitmap,
        core_bitmap_used,
        ..
    } = resources;
    let Some(core_bitmap) = core_bitmap.as_ref() else {
        return;
    };
    let step_bits = step_core_bitmap.get_or_insert_with(|| Bitmap::new(core_bitmap.nbits()));
    let used = core_bitmap_used
        .as_mut()
        .expect("core bitmap without used shadow");

    let use_all_cores = task_cnt == cores as u32 * sockets as u32;
    let mut cpu_cnt = task_cnt;
    if cpus_per_task > 0 {
        cpu_cnt *= cpus_per_task as u32;
    }
    if cpu_cnt == 0 {
        return;
    }

    // select idle cores first
    for core_inx in 0..cores {
        for sock_inx in 0..sockets {
            let bit_offset = offset(sock_inx, core_inx);
            if !core_bitmap.get(bit_offset) {
                continue;
            }
            if !use_all_cores && used.get(bit_offset) {
                continue;
            }
            used.set(bit_offset);
            step_bits.set(bit_offset);
            cpu_cnt -= 1;
            if cpu_cnt == 0 {
                return;
            }
        }
    }
    if use_all_cores {
        return;
    }

    // Demand exceeds the idle cores: over-subscribe, rotating the
    // start core so repeated steps spread out.
    log::debug!("job step needs to over-subscribe cores");
    *last_core_inx = (*last_core_inx + 1) % cores as usize;
    for i in 0..cores {
        let core_inx = ((*last_core_inx + i as usize) % cores as usize) as u16;
        for sock_inx in 0..sockets {
            let bit_offset = offset(sock_inx, core_inx);
            if !core_bitmap.get(bit_offset) {
                continue;
            }
            if step_bits.get(bit_offset) {
                continue; // already taken by this step
            }
            step_bits.set(bit_offset);
            cpu_cnt -= 1;
            if cpu_cnt == 0 {
                return;
            }
        }
    }
}

/// Return a completed step's cores to the job: its claimed cells are
/// cleared from the job's "used" shadow.
pub fn release_step_cores(step_core_bitmap: Option<Bitmap>, resources: &mut JobResources) {
    if let (Some(step_bits), Some(used)) = (step_core_bitmap, resources.core_bitmap_used.as_mut()) {
        used.subtract(&step_bits);
    }
}

#[cfg(test)]
mod tests {
    use super::{pick_step_cores, release_step_cores};
    use crate::tests::utils::test_job;

    #[test]
    fn test_paint_idle_cores_first() {
        // one node, one socket with 4 cores
        let mut job = test_job(1, 4, None);
        let mut cursor = 0;

        let mut first = None;
        pick_step_cores(&mut first, &mut job.resources, 0, 1, 2, &mut cursor);
        let first = first.unwrap();
        assert_eq!(first.to_ranged_string(), "0-1");
        assert_eq!(
            job.resources.core_bitmap_used.as_ref().unwrap().count(),
            2
        );

        let mut second = None;
        pick_step_cores(&mut second, &mut job.resources, 0, 1, 2, &mut cursor);
        let second = second.unwrap();
        assert_eq!(second.to_ranged_string(), "2-3");
        assert!(!first.overlaps(&second));
        assert_eq!(
            job.resources.core_bitmap_used.as_ref().unwrap().count(),
            4
        );
    }

    #[test]
    fn test_oversubscribe_is_step_private() {
        let mut job = test_job(1, 4, None);
        let mut cursor = 0;

        let mut first = None;
        pick_step_cores(&mut first, &mut job.resources, 0, 4, 1, &mut cursor);
        assert_eq!(job.resources.core_bitmap_used.as_ref().unwrap().count(), 4);

        // no idle cores remain; the second step over-subscribes but
        // leaves the used shadow alone
        let mut second = None;
        pick_step_cores(&mut second, &mut job.resources, 0, 2, 1, &mut cursor);
        let second = second.unwrap();
        assert_eq!(second.count(), 2);
        assert_eq!(job.resources.core_bitmap_used.as_ref().unwrap().count(), 4);
        // rotated off core zero
        assert!(!second.get(0));
    }

    #[test]
    fn test_release_clears_used_shadow() {
        let mut job = test_job(1, 4, None);
        let mut cursor = 0;

        let mut bits = None;
        pick_step_cores(&mut bits, &mut job.resources, 0, 1, 2, &mut cursor);
        assert_eq!(job.resources.core_bitmap_used.as_ref().unwrap().count(), 2);
        release_step_cores(bits, &mut job.resources);
        assert_eq!(job.resources.core_bitmap_used.as_ref().unwrap().count(), 0);
    }
}
