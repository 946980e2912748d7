//! # NUMA Topology and Worker Placement
//!
//! Workers are spread round-robin across NUMA nodes so that memory a worker
//! touches stays on its local node. Each worker gets an [`AffinityMask`] of
//! its node's cores, minus any cores reserved for the host (render thread,
//! audio, ...).
//!
//! ```text
//!   node 0: cores 0-3        node 1: cores 4-7
//!   reserved_cores = 1  →    core 0 excluded
//!
//!   worker 0 → node 0, mask {1,2,3}
//!   worker 1 → node 1, mask {4,5,6,7}
//!   worker 2 → node 0, mask {1,2,3}
//! ```
//!
//! Topology comes from `/sys/devices/system/node/node*/cpulist` on Linux and
//! falls back to one node holding every logical core elsewhere.

use std::fmt;
use std::fs;
use std::io;
use std::path::Path;

use tracing::debug;

/// Default sysfs location of NUMA node descriptions.
pub const SYSFS_NODE_ROOT: &str = "/sys/devices/system/node";

const WORD_BITS: usize = 64;

/// Set of logical cores a worker may run on.
#[derive(Clone, Default, PartialEq, Eq, Hash)]
pub struct AffinityMask {
    words: Vec<u64>,
}

impl AffinityMask {
    /// Empty mask.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Mask containing exactly `cores`.
    #[must_use]
    pub fn from_cores(cores: impl IntoIterator<Item = usize>) -> Self {
        let mut mask = Self::new();
        for core in cores {
            mask.set(core);
        }
        mask
    }

    /// Adds a core.
    pub fn set(&mut self, core: usize) {
        let word = core / WORD_BITS;
        if word >= self.words.len() {
            self.words.resize(word + 1, 0);
        }
        self.words[word] |= 1u64 << (core % WORD_BITS);
    }

    /// Whether `core` is in the mask.
    #[must_use]
    pub fn is_set(&self, core: usize) -> bool {
        self.words
            .get(core / WORD_BITS)
            .is_some_and(|w| w & (1u64 << (core % WORD_BITS)) != 0)
    }

    /// Number of cores in the mask.
    #[must_use]
    pub fn count(&self) -> usize {
        self.words.iter().map(|w| w.count_ones() as usize).sum()
    }

    /// Whether the mask is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.words.iter().all(|&w| w == 0)
    }

    /// Cores in ascending order.
    #[must_use]
    pub fn cores(&self) -> Vec<usize> {
        let mut cores = Vec::with_capacity(self.count());
        for (i, &word) in self.words.iter().enumerate() {
            let mut bits = word;
            while bits != 0 {
                cores.push(i * WORD_BITS + bits.trailing_zeros() as usize);
                bits &= bits - 1;
            }
        }
        cores
    }
}

impl fmt::Debug for AffinityMask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_set().entries(self.cores()).finish()
    }
}

/// One NUMA node and its logical cores.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct NumaNode {
    /// Node number as reported by the OS.
    pub id: usize,
    /// Logical cores on this node, ascending.
    pub cores: Vec<usize>,
}

impl NumaNode {
    /// Creates a node, sorting and deduplicating its cores.
    #[must_use]
    pub fn new(id: usize, mut cores: Vec<usize>) -> Self {
        cores.sort_unstable();
        cores.dedup();
        Self { id, cores }
    }
}

/// Where one worker should run.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct WorkerPlacement {
    /// Worker index in spawn order.
    pub worker_index: usize,
    /// NUMA node id.
    pub node: usize,
    /// Cores the worker may be pinned to.
    pub mask: AffinityMask,
}

/// Machine NUMA layout.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct NumaTopology {
    nodes: Vec<NumaNode>,
}

impl NumaTopology {
    /// Reads the topology from the OS, falling back to a single node.
    #[must_use]
    pub fn detect() -> Self {
        if cfg!(target_os = "linux") {
            match Self::from_sysfs(Path::new(SYSFS_NODE_ROOT)) {
                Ok(Some(topology)) => {
                    debug!(nodes = topology.node_count(), "NUMA topology detected");
                    return topology;
                }
                Ok(None) => {}
                Err(e) => debug!(error = %e, "NUMA topology unavailable"),
            }
        }
        Self::single_node(num_cpus::get())
    }

    /// One node holding cores `0..core_count` (at least one core).
    #[must_use]
    pub fn single_node(core_count: usize) -> Self {
        Self {
            nodes: vec![NumaNode::new(0, (0..core_count.max(1)).collect())],
        }
    }

    /// Builds an explicit topology. Empty nodes are dropped; with no cores
    /// at all a single one-core node is used.
    #[must_use]
    pub fn from_nodes(nodes: Vec<NumaNode>) -> Self {
        let mut nodes: Vec<_> = nodes.into_iter().filter(|n| !n.cores.is_empty()).collect();
        if nodes.is_empty() {
            return Self::single_node(1);
        }
        nodes.sort_by_key(|n| n.id);
        Self { nodes }
    }

    /// Parses `<root>/node<N>/cpulist` files.
    ///
    /// Returns `Ok(None)` when the directory holds no node entries.
    ///
    /// # Errors
    ///
    /// Returns the I/O error when `root` cannot be listed.
    pub fn from_sysfs(root: &Path) -> io::Result<Option<Self>> {
        let mut nodes = Vec::new();
        for dir_entry in fs::read_dir(root)? {
            let dir_entry = dir_entry?;
            let name = dir_entry.file_name();
            let Some(id) = name
                .to_str()
                .and_then(|n| n.strip_prefix("node"))
                .and_then(|n| n.parse::<usize>().ok())
            else {
                continue;
            };
            let Ok(list) = fs::read_to_string(dir_entry.path().join("cpulist")) else {
                continue;
            };
            if let Some(cores) = parse_cpu_list(&list) {
                nodes.push(NumaNode::new(id, cores));
            }
        }
        nodes.retain(|n| !n.cores.is_empty());
        if nodes.is_empty() {
            return Ok(None);
        }
        Ok(Some(Self::from_nodes(nodes)))
    }

    /// Nodes, ascending by id.
    #[must_use]
    pub fn nodes(&self) -> &[NumaNode] {
        &self.nodes
    }

    /// Number of nodes.
    #[must_use]
    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    /// Total logical cores.
    #[must_use]
    pub fn core_count(&self) -> usize {
        self.nodes.iter().map(|n| n.cores.len()).sum()
    }

    /// Node owning `core`.
    #[must_use]
    pub fn node_of_core(&self, core: usize) -> Option<usize> {
        self.nodes
            .iter()
            .find(|n| n.cores.binary_search(&core).is_ok())
            .map(|n| n.id)
    }

    /// Distributes `worker_count` workers round-robin across nodes.
    ///
    /// The lowest `reserved_cores` core numbers are excluded from every mask.
    /// Nodes left with no cores are skipped; if reservation empties the whole
    /// machine, masks fall back to every core.
    #[must_use]
    pub fn plan_placements(&self, worker_count: usize, reserved_cores: usize) -> Vec<WorkerPlacement> {
        let mut all_cores: Vec<usize> = self.nodes.iter().flat_map(|n| n.cores.iter().copied()).collect();
        all_cores.sort_unstable();
        let reserved: Vec<usize> = all_cores.iter().copied().take(reserved_cores).collect();

        let mut usable: Vec<(usize, AffinityMask)> = self
            .nodes
            .iter()
            .map(|n| {
                let mask = AffinityMask::from_cores(
                    n.cores.iter().copied().filter(|c| !reserved.contains(c)),
                );
                (n.id, mask)
            })
            .filter(|(_, mask)| !mask.is_empty())
            .collect();

        if usable.is_empty() {
            let node = self.nodes.first().map_or(0, |n| n.id);
            usable.push((node, AffinityMask::from_cores(all_cores)));
        }

        (0..worker_count)
            .map(|worker_index| {
                let (node, mask) = &usable[worker_index % usable.len()];
                WorkerPlacement {
                    worker_index,
                    node: *node,
                    mask: mask.clone(),
                }
            })
            .collect()
    }
}

/// Parses a kernel cpu list such as `"0-3,8,10-11"`.
///
/// Returns `None` on malformed input.
#[must_use]
pub fn parse_cpu_list(list: &str) -> Option<Vec<usize>> {
    let mut cores = Vec::new();
    for part in list.trim().split(',').map(str::trim).filter(|p| !p.is_empty()) {
        match part.split_once('-') {
            Some((start, end)) => {
                let start: usize = start.trim().parse().ok()?;
                let end: usize = end.trim().parse().ok()?;
                if end < start {
                    return None;
                }
                cores.extend(start..=end);
            }
            None => cores.push(part.parse().ok()?),
        }
    }
    Some(cores)
}

/// Pins the calling thread to the cores in `mask`.
///
/// # Errors
///
/// Returns the OS error, `InvalidInput` for an empty mask, or `Unsupported`
/// off Linux.
#[cfg(target_os = "linux")]
#[allow(unsafe_code)]
pub fn pin_current_thread(mask: &AffinityMask) -> io::Result<()> {
    let capacity = std::mem::size_of::<libc::cpu_set_t>() * 8;
    let cores: Vec<usize> = mask.cores().into_iter().filter(|&c| c < capacity).collect();
    if cores.is_empty() {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            "affinity mask has no usable cores",
        ));
    }

    // SAFETY: a zeroed cpu_set_t is valid, every core index is below the set
    // capacity, and pid 0 targets the calling thread.
    unsafe {
        let mut set: libc::cpu_set_t = std::mem::zeroed();
        libc::CPU_ZERO(&mut set);
        for core in cores {
            libc::CPU_SET(core, &mut set);
        }
        if libc::sched_setaffinity(0, std::mem::size_of::<libc::cpu_set_t>(), &set) != 0 {
            return Err(io::Error::last_os_error());
        }
    }
    Ok(())
}

/// Pins the calling thread to the cores in `mask`.
///
/// # Errors
///
/// Always `Unsupported` on this platform.
#[cfg(not(target_os = "linux"))]
pub fn pin_current_thread(_mask: &AffinityMask) -> io::Result<()> {
    Err(io::Error::new(
        io::ErrorKind::Unsupported,
        "thread affinity is not supported on this platform",
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn two_nodes() -> NumaTopology {
        NumaTopology::from_nodes(vec![
            NumaNode::new(1, vec![4, 5, 6, 7]),
            NumaNode::new(0, vec![3, 2, 1, 0]),
        ])
    }

    #[test]
    fn test_parse_cpu_list() {
        assert_eq!(parse_cpu_list("0-3,8,10-11\n"), Some(vec![0, 1, 2, 3, 8, 10, 11]));
        assert_eq!(parse_cpu_list("5"), Some(vec![5]));
        assert_eq!(parse_cpu_list(""), Some(vec![]));
        assert_eq!(parse_cpu_list("3-1"), None);
        assert_eq!(parse_cpu_list("a-b"), None);
    }

    #[test]
    fn test_affinity_mask() {
        let mut mask = AffinityMask::from_cores([0, 63, 64, 130]);
        assert!(mask.is_set(63) && mask.is_set(64) && mask.is_set(130));
        assert!(!mask.is_set(1));
        assert_eq!(mask.count(), 4);
        mask.set(1);
        assert_eq!(mask.cores(), vec![0, 1, 63, 64, 130]);
        assert!(AffinityMask::new().is_empty());
    }

    #[test]
    fn test_round_robin_across_nodes() {
        let topology = two_nodes();
        assert_eq!(topology.nodes()[0].id, 0);
        assert_eq!(topology.core_count(), 8);
        assert_eq!(topology.node_of_core(5), Some(1));

        let placements = topology.plan_placements(3, 1);
        assert_eq!(placements.len(), 3);
        assert_eq!(placements[0].node, 0);
        assert_eq!(placements[0].mask.cores(), vec![1, 2, 3]);
        assert_eq!(placements[1].node, 1);
        assert_eq!(placements[1].mask.cores(), vec![4, 5, 6, 7]);
        assert_eq!(placements[2].node, 0);
    }

    #[test]
    fn test_reservation_skips_emptied_node() {
        let placements = two_nodes().plan_placements(2, 4);
        assert!(placements.iter().all(|p| p.node == 1));

        // Reserving everything falls back to the full machine
        let placements = two_nodes().plan_placements(1, 100);
        assert_eq!(placements[0].mask.count(), 8);
    }

    #[test]
    fn test_from_sysfs_layout() {
        let root = std::env::temp_dir().join(format!("delve-numa-{}", std::process::id()));
        let _ = fs::remove_dir_all(&root);
        fs::create_dir_all(root.join("node0")).unwrap();
        fs::create_dir_all(root.join("node1")).unwrap();
        fs::create_dir_all(root.join("power")).unwrap();
        fs::write(root.join("node0/cpulist"), "0-1\n").unwrap();
        fs::write(root.join("node1/cpulist"), "2,3\n").unwrap();

        let topology = NumaTopology::from_sysfs(&root).unwrap().unwrap();
        assert_eq!(topology.node_count(), 2);
        assert_eq!(topology.nodes()[1].cores, vec![2, 3]);

        fs::remove_dir_all(&root).unwrap();
    }

    #[test]
    fn test_detect_always_has_cores() {
        let topology = NumaTopology::detect();
        assert!(topology.node_count() >= 1);
        assert!(topology.core_count() >= 1);
    }
}
