//! Platform abstraction
//!
//! A [`Platform`] turns the register layer into a fixed list of signals that
//! can be sampled in one batch, and translates policy messages into register
//! writes at its control granularity.

use crate::error::Result;
use powertree_common::{Domain, PolicyMessage, Timespec};

/// Hardware signal read by the sampling path
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Signal {
    PackageEnergy,
    Pp0Energy,
    DramEnergy,
    InstRetired,
    ClkUnhaltedCore,
    ClkUnhaltedRef,
    LlcVictims,
}

impl Signal {
    /// Bits the hardware counter holds before wrapping
    pub fn counter_width(self) -> u32 {
        match self {
            Signal::PackageEnergy | Signal::Pp0Energy | Signal::DramEnergy => 32,
            _ => 48,
        }
    }

    pub fn is_energy(self) -> bool {
        self.counter_width() == 32
    }
}

/// One entry of a sample buffer
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SignalSample {
    pub domain: Domain,
    pub index: usize,
    pub signal: Signal,
    pub timestamp: Timespec,
    /// Counter value, masked to the counter width
    pub raw: u64,
    /// `raw` in signal units (joules for energy, counts otherwise)
    pub value: f64,
}

impl SignalSample {
    pub const EMPTY: SignalSample = SignalSample {
        domain: Domain::Package,
        index: 0,
        signal: Signal::PackageEnergy,
        timestamp: Timespec::new(0, 0),
        raw: 0,
        value: 0.0,
    };
}

impl Default for SignalSample {
    fn default() -> Self {
        Self::EMPTY
    }
}

/// Pre-resolved sampling plan entry
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SignalDescriptor {
    pub domain: Domain,
    pub index: usize,
    pub signal: Signal,
    pub register: &'static str,
    pub(crate) cpu: usize,
    pub(crate) offset: u64,
    pub scale: f64,
}

/// Where each signal family starts in the sample buffer.
///
/// Slot of `(signal, index)` is `base + index`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BufferIndex {
    pub package_energy: usize,
    pub pp0_energy: Option<usize>,
    pub dram_energy: usize,
    pub inst_retired: usize,
    pub clk_unhalted_core: usize,
    pub clk_unhalted_ref: usize,
    pub llc_victims: usize,
    pub num_slot: usize,
}

impl BufferIndex {
    pub fn base(&self, signal: Signal) -> Option<usize> {
        match signal {
            Signal::PackageEnergy => Some(self.package_energy),
            Signal::Pp0Energy => self.pp0_energy,
            Signal::DramEnergy => Some(self.dram_energy),
            Signal::InstRetired => Some(self.inst_retired),
            Signal::ClkUnhaltedCore => Some(self.clk_unhalted_core),
            Signal::ClkUnhaltedRef => Some(self.clk_unhalted_ref),
            Signal::LlcVictims => Some(self.llc_victims),
        }
    }
}

/// Enforceable power range per control domain, in watts
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PowerBounds {
    pub lower: f64,
    pub upper: f64,
}

impl PowerBounds {
    pub fn clamp(&self, watts: f64) -> f64 {
        watts.max(self.lower).min(self.upper)
    }

    pub fn contains(&self, watts: f64) -> bool {
        watts >= self.lower && watts <= self.upper
    }
}

/// Sampling and enforcement front end for one hardware family
pub trait Platform {
    /// Short identifier matched by [`Platform::model_supported`]
    fn description(&self) -> &'static str;

    /// Finest domain the platform can enforce policy on
    fn control_domain(&self) -> Domain;

    /// Number of entries one [`Platform::sample`] call fills
    fn capacity(&self) -> usize;

    /// Read every signal into `buffer[..capacity()]` under one timestamp
    fn sample(&self, buffer: &mut [SignalSample]) -> Result<usize>;

    /// Translate `policy` into register writes
    fn enforce_policy(&self, region_id: u64, policy: &PolicyMessage) -> Result<()>;

    /// Power range enforceable per control domain
    fn bound(&self) -> PowerBounds;

    fn buffer_index(&self) -> &BufferIndex;

    fn signal_descriptors(&self) -> &[SignalDescriptor];

    /// Nominal core frequency in Hz
    fn nominal_frequency(&self) -> f64;

    /// Revert every register this platform changed
    fn reset(&self) -> Result<()>;

    fn model_supported(platform_id: i32, description: &str) -> bool
    where
        Self: Sized;
}

/// Current `CLOCK_MONOTONIC` time
pub fn monotonic_now() -> Timespec {
    let mut ts = libc::timespec {
        tv_sec: 0,
        tv_nsec: 0,
    };
    // SAFETY: ts is a valid out-pointer; CLOCK_MONOTONIC is always available
    unsafe {
        libc::clock_gettime(libc::CLOCK_MONOTONIC, &mut ts);
    }
    Timespec::new(ts.tv_sec as i64, ts.tv_nsec as i64)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counter_widths() {
        assert_eq!(Signal::PackageEnergy.counter_width(), 32);
        assert_eq!(Signal::DramEnergy.counter_width(), 32);
        assert_eq!(Signal::InstRetired.counter_width(), 48);
        assert_eq!(Signal::LlcVictims.counter_width(), 48);
    }

    #[test]
    fn test_bounds_clamp() {
        let bounds = PowerBounds {
            lower: 60.0,
            upper: 180.0,
        };
        assert_eq!(bounds.clamp(10.0), 60.0);
        assert_eq!(bounds.clamp(100.0), 100.0);
        assert_eq!(bounds.clamp(500.0), 180.0);
        assert!(bounds.contains(180.0));
    }

    #[test]
    fn test_monotonic_now_advances() {
        let a = monotonic_now();
        let b = monotonic_now();
        assert!(b >= a);
    }
}
