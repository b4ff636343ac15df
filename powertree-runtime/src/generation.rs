//! Hardware generations
//!
//! Each supported server generation is identified by
//! `platform_id = (cpu_family << 8) + cpu_model` and carries an immutable
//! register offset table. Variants differ in which power planes exist and
//! in how DRAM energy is scaled.

use crate::error::{Error, Result};
use crate::msr::{MsrAccess, MsrDescriptor};
use powertree_common::Domain;
use std::fs;
use std::io::{self, Write};
use tracing::debug;

/// Known platform ids
pub mod platform_id {
    pub const SANDY_BRIDGE_E: i32 = 0x62D;
    pub const IVY_BRIDGE_E: i32 = 0x63E;
    pub const HASWELL_E: i32 = 0x63F;
    pub const BROADWELL_E: i32 = 0x64F;
    pub const KNIGHTS_LANDING: i32 = 0x657;
}

const MASK_48: u64 = 0xFFFF_FFFF_FFFF;

const COMMON_MSRS: &[MsrDescriptor] = &[
    MsrDescriptor { name: "RAPL_POWER_UNIT", offset: 0x606, write_mask: 0 },
    MsrDescriptor { name: "PKG_POWER_LIMIT", offset: 0x610, write_mask: 0x00FF_FFFF_00FF_FFFF },
    MsrDescriptor { name: "PKG_ENERGY_STATUS", offset: 0x611, write_mask: 0 },
    MsrDescriptor { name: "PKG_POWER_INFO", offset: 0x614, write_mask: 0 },
    MsrDescriptor { name: "DRAM_POWER_LIMIT", offset: 0x618, write_mask: 0x00FF_FFFF },
    MsrDescriptor { name: "DRAM_ENERGY_STATUS", offset: 0x619, write_mask: 0 },
    MsrDescriptor { name: "DRAM_POWER_INFO", offset: 0x61C, write_mask: 0 },
    MsrDescriptor { name: "PLATFORM_INFO", offset: 0xCE, write_mask: 0 },
    MsrDescriptor { name: "IA32_PERF_STATUS", offset: 0x198, write_mask: 0 },
    MsrDescriptor { name: "IA32_PERF_CTL", offset: 0x199, write_mask: 0xFFFF },
    MsrDescriptor { name: "IA32_FIXED_CTR0", offset: 0x309, write_mask: MASK_48 },
    MsrDescriptor { name: "IA32_FIXED_CTR1", offset: 0x30A, write_mask: MASK_48 },
    MsrDescriptor { name: "IA32_FIXED_CTR2", offset: 0x30B, write_mask: MASK_48 },
    MsrDescriptor { name: "IA32_FIXED_CTR_CTRL", offset: 0x38D, write_mask: 0xFFF },
    MsrDescriptor { name: "IA32_PERF_GLOBAL_CTRL", offset: 0x38F, write_mask: 0x7_0000_000F },
    MsrDescriptor { name: "IA32_PERF_GLOBAL_OVF_CTRL", offset: 0x390, write_mask: 0xC000_0007_0000_000F },
    MsrDescriptor { name: "IA32_PERFEVTSEL0", offset: 0x186, write_mask: 0xFFFF_FFFF },
    MsrDescriptor { name: "IA32_PMC0", offset: 0xC1, write_mask: MASK_48 },
];

const PP0_MSRS: &[MsrDescriptor] = &[
    MsrDescriptor { name: "PP0_POWER_LIMIT", offset: 0x638, write_mask: 0x00FF_FFFF },
    MsrDescriptor { name: "PP0_ENERGY_STATUS", offset: 0x639, write_mask: 0 },
];

/// Fixed counters enabled in user and kernel mode
const FIXED_CTR_CTRL_VALUE: u64 = 0x333;
/// Three fixed counters plus PMC0
const PERF_GLOBAL_CTRL_VALUE: u64 = 0x7_0000_0001;
/// Last-level cache misses, user and kernel, enabled
const PERFEVTSEL0_VALUE: u64 = 0x43_412E;

/// Server generation with RAPL support
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Generation {
    SandyBridgeE,
    IvyBridgeE,
    HaswellE,
    BroadwellE,
    KnightsLanding,
}

impl Generation {
    pub const ALL: [Generation; 5] = [
        Generation::SandyBridgeE,
        Generation::IvyBridgeE,
        Generation::HaswellE,
        Generation::BroadwellE,
        Generation::KnightsLanding,
    ];

    pub fn platform_id(self) -> i32 {
        match self {
            Generation::SandyBridgeE => platform_id::SANDY_BRIDGE_E,
            Generation::IvyBridgeE => platform_id::IVY_BRIDGE_E,
            Generation::HaswellE => platform_id::HASWELL_E,
            Generation::BroadwellE => platform_id::BROADWELL_E,
            Generation::KnightsLanding => platform_id::KNIGHTS_LANDING,
        }
    }

    pub fn from_platform_id(id: i32) -> Option<Self> {
        Self::ALL.into_iter().find(|g| g.platform_id() == id)
    }

    pub fn model_supported(id: i32) -> bool {
        Self::from_platform_id(id).is_some()
    }

    pub fn platform_name(self) -> &'static str {
        match self {
            Generation::SandyBridgeE => "Sandy Bridge E",
            Generation::IvyBridgeE => "Ivy Bridge E",
            Generation::HaswellE => "Haswell E",
            Generation::BroadwellE => "Broadwell E",
            Generation::KnightsLanding => "Knights Landing",
        }
    }

    /// Whether the core power plane (PP0) is exposed
    pub fn has_pp0(self) -> bool {
        !matches!(self, Generation::KnightsLanding)
    }

    /// Fixed DRAM energy unit in joules, when the generation ignores
    /// `RAPL_POWER_UNIT` for the memory plane
    pub fn dram_energy_units(self) -> Option<f64> {
        match self {
            Generation::SandyBridgeE | Generation::IvyBridgeE => None,
            Generation::HaswellE | Generation::BroadwellE | Generation::KnightsLanding => {
                Some(1.0 / 65536.0)
            }
        }
    }

    /// Offset table for this generation
    pub fn msr_table(self) -> Vec<MsrDescriptor> {
        let mut table = COMMON_MSRS.to_vec();
        if self.has_pp0() {
            table.extend_from_slice(PP0_MSRS);
        }
        table
    }

    /// Write the `msr-safe` whitelist for this generation, sorted by offset.
    ///
    /// Needs no register access, so it can run before the node is set up
    /// for unprivileged use.
    pub fn whitelist(self, out: &mut dyn Write) -> io::Result<()> {
        let mut table = self.msr_table();
        table.sort_by_key(|desc| desc.offset);

        writeln!(out, "# MSR      Write Mask         # Comment")?;
        for desc in table {
            writeln!(out, "0x{:08x} 0x{:016x} # \"{}\"", desc.offset, desc.write_mask, desc.name)?;
        }
        Ok(())
    }

    /// Program the performance counters read by the sampling path on every CPU
    pub fn initialize_msrs(self, access: &MsrAccess) -> Result<()> {
        for cpu in 0..access.topology().num_logical_cpu() {
            access.write_msr(Domain::Cpu, cpu, "IA32_PERF_GLOBAL_CTRL", 0)?;
            access.write_msr(Domain::Cpu, cpu, "IA32_PERFEVTSEL0", PERFEVTSEL0_VALUE)?;
            access.write_msr(Domain::Cpu, cpu, "IA32_FIXED_CTR_CTRL", FIXED_CTR_CTRL_VALUE)?;
            access.write_msr(Domain::Cpu, cpu, "IA32_PERF_GLOBAL_CTRL", PERF_GLOBAL_CTRL_VALUE)?;
        }
        debug!("{}: counters programmed", self.platform_name());
        Ok(())
    }
}

impl std::fmt::Display for Generation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.platform_name())
    }
}

/// Platform id of the running node, from `/proc/cpuinfo`
pub fn current_platform_id() -> Result<i32> {
    let cpuinfo = fs::read_to_string("/proc/cpuinfo")
        .map_err(|e| Error::Configuration(format!("cannot read /proc/cpuinfo: {}", e)))?;
    parse_cpuinfo(&cpuinfo)
}

fn parse_cpuinfo(cpuinfo: &str) -> Result<i32> {
    let mut family = None;
    let mut model = None;
    for line in cpuinfo.lines() {
        let Some((key, value)) = line.split_once(':') else {
            // Blank line ends the first processor block
            if family.is_some() && model.is_some() {
                break;
            }
            continue;
        };
        match key.trim() {
            "cpu family" => family = value.trim().parse::<i32>().ok(),
            "model" => model = value.trim().parse::<i32>().ok(),
            _ => {}
        }
    }
    match (family, model) {
        (Some(family), Some(model)) => Ok((family << 8) + model),
        _ => Err(Error::Configuration(
            "cpu family or model missing from /proc/cpuinfo".to_string(),
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_whitelist_without_device() {
        let mut out = Vec::new();
        Generation::KnightsLanding.whitelist(&mut out).unwrap();
        let text = String::from_utf8(out).unwrap();
        assert!(text.contains("0x00000610 0x00ffffff00ffffff # \"PKG_POWER_LIMIT\""));
        assert!(!text.contains("PP0_POWER_LIMIT"));
        assert_eq!(text.lines().count(), Generation::KnightsLanding.msr_table().len() + 1);
    }

    #[test]
    fn test_platform_ids() {
        assert_eq!(Generation::from_platform_id(0x63F), Some(Generation::HaswellE));
        assert_eq!(Generation::from_platform_id(0x657), Some(Generation::KnightsLanding));
        assert!(!Generation::model_supported(0x655));
        for generation in Generation::ALL {
            assert!(Generation::model_supported(generation.platform_id()));
        }
    }

    #[test]
    fn test_tables_have_unique_names_and_offsets() {
        for generation in Generation::ALL {
            let table = generation.msr_table();
            let mut names: Vec<_> = table.iter().map(|d| d.name).collect();
            let mut offsets: Vec<_> = table.iter().map(|d| d.offset).collect();
            names.sort_unstable();
            names.dedup();
            offsets.sort_unstable();
            offsets.dedup();
            assert_eq!(names.len(), table.len());
            assert_eq!(offsets.len(), table.len());
        }
    }

    #[test]
    fn test_knl_has_no_pp0() {
        let knl = Generation::KnightsLanding.msr_table();
        assert!(knl.iter().all(|d| !d.name.starts_with("PP0_")));
        let hsx = Generation::HaswellE.msr_table();
        assert!(hsx.iter().any(|d| d.name == "PP0_ENERGY_STATUS"));
    }

    #[test]
    fn test_dram_energy_units() {
        assert_eq!(Generation::SandyBridgeE.dram_energy_units(), None);
        assert_eq!(Generation::BroadwellE.dram_energy_units(), Some(1.0 / 65536.0));
    }

    #[test]
    fn test_parse_cpuinfo() {
        let text = "processor\t: 0\nvendor_id\t: GenuineIntel\ncpu family\t: 6\nmodel\t\t: 63\n\
                    model name\t: Intel(R) Xeon(R) CPU E5-2698 v3\n\nprocessor\t: 1\ncpu family\t: 6\nmodel\t\t: 79\n";
        assert_eq!(parse_cpuinfo(text).unwrap(), platform_id::HASWELL_E);
        assert!(parse_cpuinfo("processor : 0\n").is_err());
    }
}
