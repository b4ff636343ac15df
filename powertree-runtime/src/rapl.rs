//! RAPL platform
//!
//! Samples package, core, and memory energy plus the fixed performance
//! counters, and enforces power budgets through the package PL1 limit.

use crate::error::{Error, Result};
use crate::generation::Generation;
use crate::msr::MsrAccess;
use crate::platform::{
    monotonic_now, BufferIndex, Platform, PowerBounds, Signal, SignalDescriptor, SignalSample,
};
use parking_lot::Mutex;
use powertree_common::{Affinity, Domain, PolicyMessage, PolicyMode};
use std::collections::HashMap;
use tracing::{debug, info, warn};

pub const DESCRIPTION: &str = "rapl";

const POWER_FIELD_MASK: u64 = 0x7FFF;
const PL1_ENABLE: u64 = 1 << 15;
const PL1_CLAMP: u64 = 1 << 16;
const PL1_TIME_WINDOW_MASK: u64 = 0x7F << 17;
const PL2_MASK: u64 = 0x00FF_FFFF << 32;

/// Units decoded from `RAPL_POWER_UNIT`
#[derive(Debug, Clone, Copy, PartialEq)]
struct Units {
    power: f64,
    energy: f64,
    dram_energy: f64,
}

impl Units {
    fn decode(raw: u64, generation: Generation) -> Self {
        let power = 1.0 / (1u64 << (raw & 0xF)) as f64;
        let energy = 1.0 / (1u64 << ((raw >> 8) & 0x1F)) as f64;
        Self {
            power,
            energy,
            dram_energy: generation.dram_energy_units().unwrap_or(energy),
        }
    }
}

/// RAPL platform over a borrowed register layer
pub struct RaplPlatform<'a> {
    msr: &'a MsrAccess,
    units: Units,
    bounds: PowerBounds,
    tdp: f64,
    nominal_hz: f64,
    /// PL1 time window found at start, per package
    time_windows: Vec<u64>,
    descriptors: Vec<SignalDescriptor>,
    index: BufferIndex,
    /// Last value written per (cpu, offset)
    last_written: Mutex<HashMap<(usize, u64), u64>>,
}

impl<'a> RaplPlatform<'a> {
    pub fn new(msr: &'a MsrAccess) -> Result<Self> {
        let generation = msr.generation();
        let topo = msr.topology();

        let units = Units::decode(msr.read_msr(Domain::Package, 0, "RAPL_POWER_UNIT")?, generation);

        let info = msr.read_msr(Domain::Package, 0, "PKG_POWER_INFO")?;
        let tdp = (info & POWER_FIELD_MASK) as f64 * units.power;
        let min = ((info >> 16) & POWER_FIELD_MASK) as f64 * units.power;
        let max = ((info >> 32) & POWER_FIELD_MASK) as f64 * units.power;
        let bounds = PowerBounds {
            lower: min,
            upper: if max > 0.0 { max } else { tdp },
        };
        if bounds.upper <= 0.0 || bounds.lower > bounds.upper {
            return Err(Error::Configuration(format!(
                "implausible package power range {} W .. {} W",
                bounds.lower, bounds.upper
            )));
        }

        let ratio = (msr.read_msr(Domain::Package, 0, "PLATFORM_INFO")? >> 8) & 0xFF;
        let nominal_hz = ratio as f64 * 1e8;

        let mut time_windows = Vec::with_capacity(topo.num_package());
        for pkg in 0..topo.num_package() {
            let limit = msr.read_msr(Domain::Package, pkg, "PKG_POWER_LIMIT")?;
            time_windows.push(limit & PL1_TIME_WINDOW_MASK);
        }

        let (descriptors, index) = Self::plan(msr, units)?;

        info!(
            "{} platform: tdp {:.1} W, bounds {:.1}..{:.1} W, {} signals",
            generation,
            tdp,
            bounds.lower,
            bounds.upper,
            index.num_slot
        );

        Ok(Self {
            msr,
            units,
            bounds,
            tdp,
            nominal_hz,
            time_windows,
            descriptors,
            index,
            last_written: Mutex::new(HashMap::new()),
        })
    }

    fn plan(msr: &MsrAccess, units: Units) -> Result<(Vec<SignalDescriptor>, BufferIndex)> {
        let topo = msr.topology();
        let mut descriptors = Vec::new();

        let mut group = |domain: Domain, signal: Signal, register: &'static str, scale: f64| -> Result<usize> {
            let base = descriptors.len();
            let offset = msr.msr_offset(register)?;
            for index in 0..topo.count(domain) {
                descriptors.push(SignalDescriptor {
                    domain,
                    index,
                    signal,
                    register,
                    cpu: topo.cpu_for(domain, index)?,
                    offset,
                    scale,
                });
            }
            Ok(base)
        };

        let package_energy = group(Domain::Package, Signal::PackageEnergy, "PKG_ENERGY_STATUS", units.energy)?;
        let pp0_energy = if msr.generation().has_pp0() {
            Some(group(Domain::Package, Signal::Pp0Energy, "PP0_ENERGY_STATUS", units.energy)?)
        } else {
            None
        };
        let dram_energy = group(Domain::Package, Signal::DramEnergy, "DRAM_ENERGY_STATUS", units.dram_energy)?;
        let inst_retired = group(Domain::Cpu, Signal::InstRetired, "IA32_FIXED_CTR0", 1.0)?;
        let clk_unhalted_core = group(Domain::Cpu, Signal::ClkUnhaltedCore, "IA32_FIXED_CTR1", 1.0)?;
        let clk_unhalted_ref = group(Domain::Cpu, Signal::ClkUnhaltedRef, "IA32_FIXED_CTR2", 1.0)?;
        let llc_victims = group(Domain::Tile, Signal::LlcVictims, "IA32_PMC0", 1.0)?;

        let num_slot = descriptors.len();
        Ok((
            descriptors,
            BufferIndex {
                package_energy,
                pp0_energy,
                dram_energy,
                inst_retired,
                clk_unhalted_core,
                clk_unhalted_ref,
                llc_victims,
                num_slot,
            },
        ))
    }

    /// Thermal design power per package, in watts
    pub fn tdp(&self) -> f64 {
        self.tdp
    }

    fn write_if_changed(&self, domain: Domain, index: usize, register: &'static str, value: u64) -> Result<bool> {
        let key = (
            self.msr.topology().cpu_for(domain, index)?,
            self.msr.msr_offset(register)?,
        );
        if self.last_written.lock().get(&key) == Some(&value) {
            return Ok(false);
        }
        self.msr.write_msr(domain, index, register, value)?;
        self.last_written.lock().insert(key, value);
        Ok(true)
    }

    fn enforce_frequency(&self, mhz: u32) -> Result<()> {
        let ratio = (mhz / 100) as u64;
        let mut written = 0;
        for cpu in 0..self.msr.topology().num_logical_cpu() {
            if self.write_if_changed(Domain::Cpu, cpu, "IA32_PERF_CTL", ratio << 8)? {
                written += 1;
            }
        }
        debug!("frequency {} MHz: {} cpus updated", mhz, written);
        Ok(())
    }

    fn enforce_package_limit(&self, watts: f64) -> Result<()> {
        let clamped = self.bounds.clamp(watts);
        if clamped != watts {
            warn!(
                "package limit {:.1} W outside {:.1}..{:.1} W, clamped to {:.1} W",
                watts, self.bounds.lower, self.bounds.upper, clamped
            );
        }
        let raw = ((clamped / self.units.power).round() as u64) & POWER_FIELD_MASK;

        for (pkg, window) in self.time_windows.iter().enumerate() {
            let current = self.msr.read_msr(Domain::Package, pkg, "PKG_POWER_LIMIT")?;
            let value = (current & PL2_MASK) | window | PL1_CLAMP | PL1_ENABLE | raw;
            if self.write_if_changed(Domain::Package, pkg, "PKG_POWER_LIMIT", value)? {
                debug!("package {} limit {:.1} W", pkg, clamped);
            }
        }
        Ok(())
    }
}

impl Platform for RaplPlatform<'_> {
    fn description(&self) -> &'static str {
        DESCRIPTION
    }

    fn control_domain(&self) -> Domain {
        Domain::Package
    }

    fn capacity(&self) -> usize {
        self.index.num_slot
    }

    fn sample(&self, buffer: &mut [SignalSample]) -> Result<usize> {
        let required = self.capacity();
        if buffer.len() < required {
            return Err(Error::BufferTooSmall {
                required,
                actual: buffer.len(),
            });
        }

        let timestamp = monotonic_now();
        let batch = self.msr.batch();
        for (slot, desc) in buffer.iter_mut().zip(&self.descriptors) {
            let raw = batch.read(desc.cpu, desc.offset).map_err(|source| Error::RegisterIo {
                domain: desc.domain,
                index: desc.index,
                register: desc.register.to_string(),
                source,
            })?;
            let raw = raw & ((1u64 << desc.signal.counter_width()) - 1);
            *slot = SignalSample {
                domain: desc.domain,
                index: desc.index,
                signal: desc.signal,
                timestamp,
                raw,
                value: raw as f64 * desc.scale,
            };
        }
        Ok(required)
    }

    fn enforce_policy(&self, region_id: u64, policy: &PolicyMessage) -> Result<()> {
        if policy.is_unknown() {
            debug!("region {:#x}: no policy decided yet", region_id);
            return Ok(());
        }
        let mode = policy
            .mode()
            .ok_or_else(|| Error::Protocol(format!("invalid policy mode {}", policy.mode)))?;

        if mode == PolicyMode::Shutdown {
            info!("region {:#x}: shutdown policy, restoring registers", region_id);
            return self.reset();
        }

        let flags = policy.flags();
        let affinity = flags
            .affinity()
            .map_err(|e| Error::Protocol(e.to_string()))?;
        if mode.is_hybrid() || flags.num_max_perf() != 0 || affinity != Affinity::Unset {
            return Err(Error::UnsupportedGranularity {
                requested: Domain::Cpu,
                supported: self.control_domain(),
            });
        }

        if mode.is_frequency_uniform() && flags.frequency_mhz() != 0 {
            return self.enforce_frequency(flags.frequency_mhz());
        }

        let per_package = if mode == PolicyMode::TdpBalanceStatic && flags.tdp_percent() != 0 {
            self.tdp * flags.tdp_percent() as f64 / 100.0
        } else {
            if !policy.power_budget.is_finite() || policy.power_budget <= 0.0 {
                return Err(Error::Protocol(format!(
                    "invalid power budget {}",
                    policy.power_budget
                )));
            }
            policy.power_budget / self.msr.topology().num_package() as f64
        };
        debug!("region {:#x}: {:?} at {:.1} W per package", region_id, mode, per_package);
        self.enforce_package_limit(per_package)
    }

    fn bound(&self) -> PowerBounds {
        self.bounds
    }

    fn buffer_index(&self) -> &BufferIndex {
        &self.index
    }

    fn signal_descriptors(&self) -> &[SignalDescriptor] {
        &self.descriptors
    }

    fn nominal_frequency(&self) -> f64 {
        self.nominal_hz
    }

    fn reset(&self) -> Result<()> {
        self.last_written.lock().clear();
        self.msr.reset_msrs()
    }

    fn model_supported(platform_id: i32, description: &str) -> bool {
        description == DESCRIPTION && Generation::model_supported(platform_id)
    }
}
