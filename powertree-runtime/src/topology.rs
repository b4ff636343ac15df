//! Topology facts
//!
//! Package, tile, and CPU counts queried once at initialization, plus one
//! representative logical CPU per package and per tile. Register requests
//! for a `(domain, index)` pair are routed to that representative.
//!
//! Logical CPUs are addressed by dense slot. Offline CPUs leave holes in the
//! kernel's numbering, so each slot also records the kernel CPU id its
//! register file is opened under.

use crate::error::{Error, Result};
use powertree_common::Domain;
use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

const SYSFS_CPU: &str = "/sys/devices/system/cpu";

/// Read-only hardware topology of one node
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Topology {
    hw_cpus: usize,
    /// Kernel CPU id of each slot, ascending
    cpu_ids: Vec<usize>,
    /// First slot of each package
    package_cpus: Vec<usize>,
    /// First slot of each tile (L2 sharing group)
    tile_cpus: Vec<usize>,
}

impl Topology {
    /// Build a topology where CPUs are numbered contiguously by package and tile
    pub fn new(packages: usize, tiles: usize, hw_cpus: usize, logical_cpus: usize) -> Result<Self> {
        if packages == 0 || tiles == 0 || hw_cpus == 0 || logical_cpus == 0 {
            return Err(Error::Configuration(format!(
                "empty topology: packages={} tiles={} hw_cpus={} logical_cpus={}",
                packages, tiles, hw_cpus, logical_cpus
            )));
        }
        if logical_cpus % packages != 0 || logical_cpus % tiles != 0 || tiles % packages != 0 {
            return Err(Error::Configuration(format!(
                "uneven topology: {} logical cpus over {} packages and {} tiles",
                logical_cpus, packages, tiles
            )));
        }
        if hw_cpus > logical_cpus {
            return Err(Error::Configuration(format!(
                "{} hardware cpus exceed {} logical cpus",
                hw_cpus, logical_cpus
            )));
        }

        let per_package = logical_cpus / packages;
        let per_tile = logical_cpus / tiles;
        Ok(Self {
            hw_cpus,
            cpu_ids: (0..logical_cpus).collect(),
            package_cpus: (0..packages).map(|p| p * per_package).collect(),
            tile_cpus: (0..tiles).map(|t| t * per_tile).collect(),
        })
    }

    /// Discover the running node's topology from sysfs
    pub fn detect() -> Result<Self> {
        Self::from_sysfs(Path::new(SYSFS_CPU))
    }

    pub(crate) fn from_sysfs(root: &Path) -> Result<Self> {
        let entries = fs::read_dir(root).map_err(|e| {
            Error::Configuration(format!("cannot read {}: {}", root.display(), e))
        })?;

        let mut cpus: Vec<usize> = entries
            .filter_map(|entry| entry.ok())
            .filter_map(|entry| {
                let name = entry.file_name();
                let id = name.to_str()?.strip_prefix("cpu")?;
                id.parse::<usize>().ok()
            })
            .collect();
        cpus.sort_unstable();

        // The kernel drops topology/ for offline CPUs
        cpus.retain(|&cpu| {
            let dir = root.join(format!("cpu{}", cpu));
            let online = dir.join("topology").is_dir()
                && read_value::<u8>(&dir.join("online")).map_or(true, |v| v != 0);
            if !online {
                tracing::debug!("cpu{} is offline, skipped", cpu);
            }
            online
        });

        if cpus.is_empty() {
            return Err(Error::Configuration(format!(
                "no online cpus listed under {}",
                root.display()
            )));
        }

        // Keys map to the lowest slot seen for them
        let mut packages: BTreeMap<u64, usize> = BTreeMap::new();
        let mut cores: BTreeMap<(u64, u64), usize> = BTreeMap::new();
        let mut tiles: BTreeMap<String, usize> = BTreeMap::new();

        for (slot, &cpu) in cpus.iter().enumerate() {
            let dir = root.join(format!("cpu{}", cpu));
            let package: u64 = read_value(&dir.join("topology/physical_package_id"))?;
            let core: u64 = read_value(&dir.join("topology/core_id"))?;
            packages.entry(package).or_insert(slot);
            cores.entry((package, core)).or_insert(slot);

            // L2 sharing group; a CPU without one is its own tile
            let tile_key = fs::read_to_string(dir.join("cache/index2/shared_cpu_list"))
                .map(|s| s.trim().to_string())
                .unwrap_or_else(|_| format!("core-{}-{}", package, core));
            tiles.entry(tile_key).or_insert(slot);
        }

        let mut package_cpus: Vec<usize> = packages.into_values().collect();
        let mut tile_cpus: Vec<usize> = tiles.into_values().collect();
        package_cpus.sort_unstable();
        tile_cpus.sort_unstable();

        tracing::debug!(
            "detected topology: {} packages, {} tiles, {} cores, {} cpus",
            package_cpus.len(),
            tile_cpus.len(),
            cores.len(),
            cpus.len()
        );

        Ok(Self {
            hw_cpus: cores.len(),
            cpu_ids: cpus,
            package_cpus,
            tile_cpus,
        })
    }

    pub fn num_package(&self) -> usize {
        self.package_cpus.len()
    }

    pub fn num_tile(&self) -> usize {
        self.tile_cpus.len()
    }

    pub fn num_hw_cpu(&self) -> usize {
        self.hw_cpus
    }

    pub fn num_logical_cpu(&self) -> usize {
        self.cpu_ids.len()
    }

    /// Kernel CPU id behind logical slot `slot`
    pub fn cpu_id(&self, slot: usize) -> Option<usize> {
        self.cpu_ids.get(slot).copied()
    }

    /// Number of addressable indices in `domain`
    pub fn count(&self, domain: Domain) -> usize {
        match domain {
            Domain::Package => self.num_package(),
            Domain::Cpu => self.num_logical_cpu(),
            Domain::Tile => self.num_tile(),
            // One board, served by a fixed CPU regardless of CPU count
            Domain::BoardMemory => 1,
        }
    }

    /// Logical slot whose register file serves `(domain, index)`
    pub fn cpu_for(&self, domain: Domain, index: usize) -> Result<usize> {
        let count = self.count(domain);
        if index >= count {
            return Err(Error::InvalidDomain {
                domain,
                index,
                count,
            });
        }
        Ok(match domain {
            Domain::Package => self.package_cpus[index],
            Domain::Cpu => index,
            Domain::Tile => self.tile_cpus[index],
            Domain::BoardMemory => 0,
        })
    }
}

fn read_value<T: std::str::FromStr>(path: &Path) -> Result<T> {
    let text = fs::read_to_string(path)
        .map_err(|e| Error::Configuration(format!("cannot read {}: {}", path.display(), e)))?;
    text.trim()
        .parse()
        .map_err(|_| Error::Configuration(format!("malformed value in {}", path.display())))
}
