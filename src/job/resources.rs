//! Read-mostly projection of a job's allocation. Arrays are indexed by
//! job-local node position (the rank of the node within the
//! allocation's node bitmap). Mutation happens only through the step
//! allocation/release paths and the core painter.

use crate::common::bitmap::Bitmap;

#[derive(Debug, Clone)]
pub struct JobResources {
    /// Nodes of the allocation, over the global node table.
    pub node_bitmap: Bitmap,
    /// Allocated CPUs per job-local node.
    pub cpus: Vec<u32>,
    /// CPUs currently claimed by live steps.
    pub cpus_used: Vec<u32>,
    /// Memory in MB, present only when memory is a tracked resource.
    pub memory_allocated: Option<Vec<u64>>,
    pub memory_used: Option<Vec<u64>>,
    pub sockets_per_node: Vec<u16>,
    pub cores_per_socket: Vec<u16>,
    /// Cores of the allocation as a flat (node, socket, core) bitset,
    /// with a parallel "claimed by a step" shadow.
    pub core_bitmap: Option<Bitmap>,
    pub core_bitmap_used: Option<Bitmap>,
}

impl JobResources {
    /// Allocation with identical nodes: `cpus` CPUs laid out as
    /// `sockets` x `cores` per node, optional memory per node.
    pub fn homogeneous(
        node_bitmap: Bitmap,
        cpus: u32,
        sockets: u16,
        cores: u16,
        memory_mb: Option<u64>,
    ) -> Self {
        let nhosts = node_bitmap.count();
        let core_bits = nhosts * sockets as usize * cores as usize;
        let mut core_bitmap = Bitmap::new(core_bits);
        if core_bits > 0 {
            core_bitmap.set_range(0, core_bits - 1);
        }
        JobResources {
            node_bitmap,
            cpus: vec![cpus; nhosts],
            cpus_used: vec![0; nhosts],
            memory_allocated: memory_mb.map(|m| vec![m; nhosts]),
            memory_used: memory_mb.map(|_| vec![0; nhosts]),
            sockets_per_node: vec![sockets; nhosts],
            cores_per_socket: vec![cores; nhosts],
            core_bitmap_used: Some(Bitmap::new(core_bits)),
            core_bitmap: Some(core_bitmap),
        }
    }

    #[inline]
    pub fn nhosts(&self) -> usize {
        self.cpus.len()
    }

    /// Job-local position of a global node id, if part of the
    /// allocation.
    pub fn node_index(&self, node_id: usize) -> Option<usize> {
        if node_id >= self.node_bitmap.nbits() || !self.node_bitmap.get(node_id) {
            return None;
        }
        Some(self.node_bitmap.iter_ones().take_while(|i| *i < node_id).count())
    }

    /// When every node has the same CPU count, that count.
    pub fn homogeneous_cpus(&self) -> Option<u32> {
        let first = *self.cpus.first()?;
        self.cpus.iter().all(|c| *c == first).then_some(first)
    }

    pub fn socket_core_count(&self, node_index: usize) -> (u16, u16) {
        (
            self.sockets_per_node[node_index],
            self.cores_per_socket[node_index],
        )
    }

    /// Offset of a (node, socket, core) cell in the flat core bitmaps.
    pub fn core_offset(&self, node_index: usize, socket: u16, core: u16) -> usize {
        let mut offset = 0usize;
        for i in 0..node_index {
            offset += self.sockets_per_node[i] as usize * self.cores_per_socket[i] as usize;
        }
        offset + socket as usize * self.cores_per_socket[node_index] as usize + core as usize
    }

    pub fn total_cores(&self) -> usize {
        self.sockets_per_node
            .iter()
            .zip(&self.cores_per_socket)
            .map(|(s, c)| *s as usize * *c as usize)
            .sum()
    }

    pub fn has_memory(&self) -> bool {
        self.memory_allocated.is_some() && self.memory_used.is_some()
    }
}
