use serde::Deserialize;

use crate::common::bitmap::Bitmap;
use crate::common::{hostlist, Map};
use crate::NodeId;

/// One entry of the global node table.
#[derive(Debug, Clone)]
pub struct NodeRecord {
    pub name: String,
    /// CPU count reported by the node.
    pub cpus: u32,
    /// CPU count from the cluster configuration.
    pub config_cpus: u32,
    pub up: bool,
    pub power_save: bool,
    pub responding: bool,
}

impl NodeRecord {
    pub fn new(name: &str, cpus: u32) -> Self {
        NodeRecord {
            name: name.to_string(),
            cpus,
            config_cpus: cpus,
            up: true,
            power_save: false,
            responding: true,
        }
    }
}

/// Dense global node table; node ids are stable indices into it.
pub struct NodeTable {
    records: Vec<NodeRecord>,
    by_name: Map<String, NodeId>,
}

impl NodeTable {
    pub fn new(records: Vec<NodeRecord>) -> Self {
        let by_name = records
            .iter()
            .enumerate()
            .map(|(i, r)| (r.name.clone(), i as NodeId))
            .collect();
        NodeTable { records, by_name }
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn get(&self, node_id: NodeId) -> &NodeRecord {
        &self.records[node_id as usize]
    }

    pub fn get_mut(&mut self, node_id: NodeId) -> &mut NodeRecord {
        &mut self.records[node_id as usize]
    }

    pub fn find_by_name(&self, name: &str) -> Option<NodeId> {
        self.by_name.get(name).copied()
    }

    /// Bitmap of nodes currently usable for scheduling.
    pub fn up_bitmap(&self) -> Bitmap {
        let mut bitmap = Bitmap::new(self.len());
        for (i, record) in self.records.iter().enumerate() {
            if record.up && record.responding && !record.power_save {
                bitmap.set(i);
            }
        }
        bitmap
    }

    /// Ranged hostlist string for the nodes selected by `bitmap`.
    pub fn bitmap_to_hostlist(&self, bitmap: &Bitmap) -> String {
        hostlist::compress(bitmap.iter_ones().map(|i| self.records[i].name.as_str()))
    }

    pub fn names(&self, bitmap: &Bitmap) -> Vec<String> {
        bitmap
            .iter_ones()
            .map(|i| self.records[i].name.clone())
            .collect()
    }

    /// Parse a hostlist string into a node bitmap. Unknown node names
    /// are an error.
    pub fn hostlist_to_bitmap(&self, list: &str) -> Result<Bitmap, String> {
        let mut bitmap = Bitmap::new(self.len());
        for name in hostlist::expand(list)? {
            let node_id = self
                .find_by_name(&name)
                .ok_or_else(|| format!("unknown node: {}", name))?;
            bitmap.set(node_id as usize);
        }
        Ok(bitmap)
    }
}

/// Controller-wide settings the step manager consults. Loadable from
/// TOML; every field has a default so partial files work.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ControllerConfig {
    pub switch_type: String,
    pub checkpoint_type: String,
    pub max_tasks_per_node: u32,
    /// Use configured rather than live CPU counts when a job lacks a
    /// CPU array.
    pub fast_schedule: bool,
    pub enforce_part_limits: bool,
    /// Memory is a consumable resource tracked per allocation.
    pub mem_reserved: bool,
    /// Uid the controller daemon runs under.
    pub cluster_user_id: u32,
    /// Steps execute via a single batch host fronting the allocation.
    pub front_end: bool,
    pub resv_port_first: u16,
    pub resv_port_last: u16,
    pub private_job_data: bool,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        ControllerConfig {
            switch_type: "switch/none".to_string(),
            checkpoint_type: "checkpoint/none".to_string(),
            max_tasks_per_node: 128,
            fast_schedule: true,
            enforce_part_limits: false,
            mem_reserved: true,
            cluster_user_id: 0,
            front_end: false,
            resv_port_first: 12000,
            resv_port_last: 12999,
            private_job_data: false,
        }
    }
}

impl ControllerConfig {
    pub fn from_toml(text: &str) -> crate::Result<Self> {
        toml::from_str(text).map_err(|e| crate::Error::GenericError(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::{ControllerConfig, NodeRecord, NodeTable};

    fn table() -> NodeTable {
        NodeTable::new((0..4).map(|i| NodeRecord::new(&format!("n{}", i), 8)).collect())
    }

    #[test]
    fn test_lookup_and_bitmaps() {
        let mut nodes = table();
        assert_eq!(nodes.find_by_name("n2"), Some(2));
        assert_eq!(nodes.find_by_name("x"), None);
        assert_eq!(nodes.up_bitmap().count(), 4);

        nodes.get_mut(1).responding = false;
        nodes.get_mut(3).power_save = true;
        assert_eq!(nodes.up_bitmap().to_ranged_string(), "0,2");
    }

    #[test]
    fn test_hostlist_round_trip() {
        let nodes = table();
        let bitmap = nodes.hostlist_to_bitmap("n[0-2]").unwrap();
        assert_eq!(bitmap.to_ranged_string(), "0-2");
        assert_eq!(nodes.bitmap_to_hostlist(&bitmap), "n[0-2]");
        assert!(nodes.hostlist_to_bitmap("n9").is_err());
    }

    #[test]
    fn test_config_from_toml() {
        let config = ControllerConfig::from_toml(
            r#"
            switch_type = "switch/elan"
            max_tasks_per_node = 64
            front_end = true
            "#,
        )
        .unwrap();
        assert_eq!(config.switch_type, "switch/elan");
        assert_eq!(config.max_tasks_per_node, 64);
        assert!(config.front_end);
        assert!(config.fast_schedule);
    }
}
