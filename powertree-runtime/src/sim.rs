//! In-memory register backend
//!
//! Stands in for `/dev/cpu/*/msr` on machines without RAPL or without
//! privileges. Every CPU shares one register bank keyed by `(cpu, offset)`;
//! clones of a [`SimBackend`] observe the same bank, so a test can poke
//! registers behind the runtime's back.

use crate::msr::{RegisterBackend, RegisterFile};
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::io;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

/// 1/8 W power, 2^-14 J energy, 2^-10 s time
pub const SIM_POWER_UNIT: u64 = 0xA_0E03;
pub const SIM_TDP_WATTS: u64 = 120;
pub const SIM_MIN_WATTS: u64 = 60;
pub const SIM_MAX_WATTS: u64 = 180;
/// Nominal ratio, in 100 MHz steps
pub const SIM_NOMINAL_RATIO: u64 = 21;

#[derive(Default)]
struct Bank {
    registers: Mutex<HashMap<(usize, u64), u64>>,
    writes: AtomicU64,
    fail_io: AtomicBool,
    fail_open: Mutex<HashSet<usize>>,
}

/// Simulated register files for `num_cpu` logical CPUs
#[derive(Clone)]
pub struct SimBackend {
    num_cpu: usize,
    bank: Arc<Bank>,
}

impl SimBackend {
    /// A bank seeded with plausible RAPL defaults on every CPU
    pub fn new(num_cpu: usize) -> Self {
        let sim = Self {
            num_cpu,
            bank: Arc::new(Bank::default()),
        };
        let units = SIM_POWER_UNIT & 0xF;
        let watts = |w: u64| w << units;
        let pl1 = watts(SIM_TDP_WATTS) | (1 << 15) | (0x6E << 17);
        let pl2 = watts(SIM_MAX_WATTS) | (1 << 15) | (0x21 << 17);
        for cpu in 0..num_cpu {
            sim.set(cpu, 0x606, SIM_POWER_UNIT);
            sim.set(
                cpu,
                0x614,
                watts(SIM_TDP_WATTS) | (watts(SIM_MIN_WATTS) << 16) | (watts(SIM_MAX_WATTS) << 32),
            );
            sim.set(cpu, 0x610, pl1 | (pl2 << 32));
            sim.set(cpu, 0x61C, watts(SIM_TDP_WATTS / 4));
            sim.set(cpu, 0xCE, SIM_NOMINAL_RATIO << 8);
            sim.set(cpu, 0x198, SIM_NOMINAL_RATIO << 8);
            sim.set(cpu, 0x199, SIM_NOMINAL_RATIO << 8);
        }
        sim
    }

    pub fn num_cpu(&self) -> usize {
        self.num_cpu
    }

    pub fn get(&self, cpu: usize, offset: u64) -> u64 {
        self.bank
            .registers
            .lock()
            .get(&(cpu, offset))
            .copied()
            .unwrap_or(0)
    }

    /// Set a register without counting it as a write
    pub fn set(&self, cpu: usize, offset: u64, value: u64) {
        self.bank.registers.lock().insert((cpu, offset), value);
    }

    /// Add `delta` to a counter, wrapping at `width` bits
    pub fn advance(&self, cpu: usize, offset: u64, delta: u64, width: u32) {
        let mask = if width >= 64 { u64::MAX } else { (1u64 << width) - 1 };
        let mut registers = self.bank.registers.lock();
        let value = registers.entry((cpu, offset)).or_insert(0);
        *value = value.wrapping_add(delta) & mask;
    }

    /// Writes issued through register files opened from this bank
    pub fn write_count(&self) -> u64 {
        self.bank.writes.load(Ordering::Relaxed)
    }

    /// Make every read and write fail until cleared
    pub fn fail_io(&self, fail: bool) {
        self.bank.fail_io.store(fail, Ordering::Relaxed);
    }

    /// Make opening `cpu`'s register file fail
    pub fn fail_open(&self, cpu: usize) {
        self.bank.fail_open.lock().insert(cpu);
    }
}

impl RegisterBackend for SimBackend {
    fn open(&self, cpu: usize) -> io::Result<Box<dyn RegisterFile>> {
        if cpu >= self.num_cpu || self.bank.fail_open.lock().contains(&cpu) {
            return Err(io::Error::new(
                io::ErrorKind::NotFound,
                format!("no simulated cpu {}", cpu),
            ));
        }
        Ok(Box::new(SimFile {
            cpu,
            bank: Arc::clone(&self.bank),
        }))
    }

    fn describe(&self, cpu: usize) -> String {
        format!("sim:cpu{}", cpu)
    }
}

struct SimFile {
    cpu: usize,
    bank: Arc<Bank>,
}

impl SimFile {
    fn check(&self) -> io::Result<()> {
        if self.bank.fail_io.load(Ordering::Relaxed) {
            return Err(io::Error::from_raw_os_error(libc::EIO));
        }
        Ok(())
    }
}

impl RegisterFile for SimFile {
    fn read_at(&self, offset: u64) -> io::Result<u64> {
        self.check()?;
        Ok(self
            .bank
            .registers
            .lock()
            .get(&(self.cpu, offset))
            .copied()
            .unwrap_or(0))
    }

    fn write_at(&self, offset: u64, value: u64) -> io::Result<()> {
        self.check()?;
        self.bank.registers.lock().insert((self.cpu, offset), value);
        self.bank.writes.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_clones_share_bank() {
        let sim = SimBackend::new(2);
        let other = sim.clone();
        let file = other.open(1).unwrap();
        file.write_at(0x199, 0x1200).unwrap();
        assert_eq!(sim.get(1, 0x199), 0x1200);
        assert_eq!(sim.write_count(), 1);
        assert!(sim.open(2).is_err());
    }

    #[test]
    fn test_advance_wraps() {
        let sim = SimBackend::new(1);
        sim.set(0, 0x611, 0xFFFF_FFF0);
        sim.advance(0, 0x611, 0x20, 32);
        assert_eq!(sim.get(0, 0x611), 0x10);
    }

    #[test]
    fn test_seeded_power_info() {
        let sim = SimBackend::new(1);
        let info = sim.get(0, 0x614);
        assert_eq!(info & 0x7FFF, 960);
        assert_eq!((info >> 16) & 0x7FFF, 480);
        assert_eq!((info >> 32) & 0x7FFF, 1440);
    }
}
