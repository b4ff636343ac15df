// SPDX-License-Identifier: GPL-2.0-only
// Copyright (C) 2024 Ankit Kumar Pandey <ankitkpandey1@gmail.com>

//! Policy flag bitmask.
//!
//! `PolicyMessage::flags` packs several discretized control knobs into
//! disjoint bit ranges. The layout is a closed, versioned contract:
//!
//! ```text
//!  63            28 27  25 24      18 17 16 15       8 7        0
//! +----------------+------+----------+-----+----------+----------+
//! |    reserved    | goal | tdp pct  | aff | big cpus | freq/100 |
//! +----------------+------+----------+-----+----------+----------+
//! ```
//!
//! Numeric fields (frequency step, big-CPU count, TDP percent) are binary
//! weighted. Affinity and goal are one-hot; two bits set in the same range
//! is a decode error.

use core::fmt;

/// Bump whenever a range below moves or changes width.
pub const FLAGS_PROTOCOL_VERSION: u32 = 1;

const FREQ_SHIFT: u32 = 0;
const FREQ_MASK: u64 = 0xFF;
const BIG_CPU_SHIFT: u32 = 8;
const BIG_CPU_MASK: u64 = 0xFF << BIG_CPU_SHIFT;
const AFFINITY_COMPACT: u64 = 1 << 16;
const AFFINITY_SCATTER: u64 = 1 << 17;
const AFFINITY_MASK: u64 = AFFINITY_COMPACT | AFFINITY_SCATTER;
const TDP_SHIFT: u32 = 18;
const TDP_MASK: u64 = 0x7F << TDP_SHIFT;
const GOAL_CPU: u64 = 1 << 25;
const GOAL_NETWORK: u64 = 1 << 26;
const GOAL_MEMORY: u64 = 1 << 27;
const GOAL_MASK: u64 = GOAL_CPU | GOAL_NETWORK | GOAL_MEMORY;

/// Every bit assigned by protocol version 1.
pub const DEFINED_BITS: u64 = FREQ_MASK | BIG_CPU_MASK | AFFINITY_MASK | TDP_MASK | GOAL_MASK;

/// Largest frequency expressible in the 8-bit step field.
pub const MAX_FREQUENCY_MHZ: u32 = 255 * 100;

/// Thread placement for the active CPU set
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Affinity {
    #[default]
    Unset,
    Compact,
    Scatter,
}

/// Optimization goal hint for deciders
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Goal {
    #[default]
    Unset,
    CpuEfficiency,
    NetworkEfficiency,
    MemoryEfficiency,
}

/// Errors produced when encoding or decoding flag ranges
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlagsError {
    /// Value does not fit its bit range
    OutOfRange {
        field: &'static str,
        value: u32,
        max: u32,
    },
    /// More than one one-hot bit set in a range
    Conflicting { field: &'static str },
}

impl fmt::Display for FlagsError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FlagsError::OutOfRange { field, value, max } => {
                write!(f, "{} value {} exceeds maximum {}", field, value, max)
            }
            FlagsError::Conflicting { field } => {
                write!(f, "{} has more than one value set", field)
            }
        }
    }
}

/// Typed view over the `flags` word of a policy message
#[repr(transparent)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct PolicyFlags(u64);

impl PolicyFlags {
    pub const fn from_bits(bits: u64) -> Self {
        Self(bits)
    }

    pub const fn bits(self) -> u64 {
        self.0
    }

    /// Bits set outside the ranges defined by this protocol version
    pub const fn reserved_bits(self) -> u64 {
        self.0 & !DEFINED_BITS
    }

    #[inline]
    fn replace(&mut self, mask: u64, value: u64) {
        self.0 = (self.0 & !mask) | (value & mask);
    }

    /// Requested CPU frequency in MHz, 0 when unset
    pub fn frequency_mhz(self) -> u32 {
        ((self.0 & FREQ_MASK) >> FREQ_SHIFT) as u32 * 100
    }

    /// Encode a frequency target, truncated to 100 MHz steps
    pub fn set_frequency_mhz(&mut self, mhz: u32) -> Result<(), FlagsError> {
        if mhz > MAX_FREQUENCY_MHZ {
            return Err(FlagsError::OutOfRange {
                field: "frequency_mhz",
                value: mhz,
                max: MAX_FREQUENCY_MHZ,
            });
        }
        self.replace(FREQ_MASK, ((mhz / 100) as u64) << FREQ_SHIFT);
        Ok(())
    }

    /// Number of CPUs that run at maximum performance, 0 when unset
    pub fn num_max_perf(self) -> u32 {
        ((self.0 & BIG_CPU_MASK) >> BIG_CPU_SHIFT) as u32
    }

    pub fn set_num_max_perf(&mut self, count: u32) -> Result<(), FlagsError> {
        if count > 0xFF {
            return Err(FlagsError::OutOfRange {
                field: "num_max_perf",
                value: count,
                max: 0xFF,
            });
        }
        self.replace(BIG_CPU_MASK, (count as u64) << BIG_CPU_SHIFT);
        Ok(())
    }

    pub fn affinity(self) -> Result<Affinity, FlagsError> {
        match self.0 & AFFINITY_MASK {
            0 => Ok(Affinity::Unset),
            AFFINITY_COMPACT => Ok(Affinity::Compact),
            AFFINITY_SCATTER => Ok(Affinity::Scatter),
            _ => Err(FlagsError::Conflicting { field: "affinity" }),
        }
    }

    pub fn set_affinity(&mut self, affinity: Affinity) {
        let bits = match affinity {
            Affinity::Unset => 0,
            Affinity::Compact => AFFINITY_COMPACT,
            Affinity::Scatter => AFFINITY_SCATTER,
        };
        self.replace(AFFINITY_MASK, bits);
    }

    /// Fraction of thermal design power, in percent; 0 when unset
    pub fn tdp_percent(self) -> u32 {
        ((self.0 & TDP_MASK) >> TDP_SHIFT) as u32
    }

    pub fn set_tdp_percent(&mut self, percent: u32) -> Result<(), FlagsError> {
        if percent > 100 {
            return Err(FlagsError::OutOfRange {
                field: "tdp_percent",
                value: percent,
                max: 100,
            });
        }
        self.replace(TDP_MASK, (percent as u64) << TDP_SHIFT);
        Ok(())
    }

    pub fn goal(self) -> Result<Goal, FlagsError> {
        match self.0 & GOAL_MASK {
            0 => Ok(Goal::Unset),
            GOAL_CPU => Ok(Goal::CpuEfficiency),
            GOAL_NETWORK => Ok(Goal::NetworkEfficiency),
            GOAL_MEMORY => Ok(Goal::MemoryEfficiency),
            _ => Err(FlagsError::Conflicting { field: "goal" }),
        }
    }

    pub fn set_goal(&mut self, goal: Goal) {
        let bits = match goal {
            Goal::Unset => 0,
            Goal::CpuEfficiency => GOAL_CPU,
            Goal::NetworkEfficiency => GOAL_NETWORK,
            Goal::MemoryEfficiency => GOAL_MEMORY,
        };
        self.replace(GOAL_MASK, bits);
    }
}

impl From<u64> for PolicyFlags {
    fn from(bits: u64) -> Self {
        Self(bits)
    }
}

impl From<PolicyFlags> for u64 {
    fn from(flags: PolicyFlags) -> Self {
        flags.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ranges_are_disjoint() {
        let ranges = [FREQ_MASK, BIG_CPU_MASK, AFFINITY_MASK, TDP_MASK, GOAL_MASK];
        for (i, a) in ranges.iter().enumerate() {
            for b in ranges.iter().skip(i + 1) {
                assert_eq!(a & b, 0, "ranges {:#x} and {:#x} overlap", a, b);
            }
        }
        assert_eq!(DEFINED_BITS, 0x0FFF_FFFF);
    }

    #[test]
    fn test_fields_do_not_disturb_each_other() {
        let mut flags = PolicyFlags::default();
        flags.set_frequency_mhz(1800).unwrap();
        flags.set_num_max_perf(24).unwrap();
        flags.set_affinity(Affinity::Compact);
        flags.set_tdp_percent(75).unwrap();
        flags.set_goal(Goal::MemoryEfficiency);

        assert_eq!(flags.frequency_mhz(), 1800);
        assert_eq!(flags.num_max_perf(), 24);
        assert_eq!(flags.affinity(), Ok(Affinity::Compact));
        assert_eq!(flags.tdp_percent(), 75);
        assert_eq!(flags.goal(), Ok(Goal::MemoryEfficiency));

        // Overwriting one range keeps the others
        flags.set_affinity(Affinity::Scatter);
        flags.set_frequency_mhz(3400).unwrap();
        assert_eq!(flags.affinity(), Ok(Affinity::Scatter));
        assert_eq!(flags.frequency_mhz(), 3400);
        assert_eq!(flags.num_max_perf(), 24);
        assert_eq!(flags.tdp_percent(), 75);
        assert_eq!(flags.reserved_bits(), 0);
    }

    #[test]
    fn test_frequency_truncates_to_step() {
        let mut flags = PolicyFlags::default();
        flags.set_frequency_mhz(1850).unwrap();
        assert_eq!(flags.frequency_mhz(), 1800);
        assert!(flags.set_frequency_mhz(MAX_FREQUENCY_MHZ + 100).is_err());
    }

    #[test]
    fn test_out_of_range_rejected() {
        let mut flags = PolicyFlags::default();
        assert_eq!(
            flags.set_tdp_percent(101),
            Err(FlagsError::OutOfRange {
                field: "tdp_percent",
                value: 101,
                max: 100
            })
        );
        assert!(flags.set_num_max_perf(256).is_err());
        assert_eq!(flags.bits(), 0);
    }

    #[test]
    fn test_conflicting_one_hot_bits() {
        let flags = PolicyFlags::from_bits(AFFINITY_COMPACT | AFFINITY_SCATTER);
        assert_eq!(
            flags.affinity(),
            Err(FlagsError::Conflicting { field: "affinity" })
        );

        let flags = PolicyFlags::from_bits(GOAL_CPU | GOAL_MEMORY);
        assert!(flags.goal().is_err());
    }

    #[test]
    fn test_legacy_bit_positions() {
        // Bit positions are part of the wire contract
        assert_eq!(PolicyFlags::from_bits(1 << 0).frequency_mhz(), 100);
        assert_eq!(PolicyFlags::from_bits(1 << 15).num_max_perf(), 128);
        assert_eq!(PolicyFlags::from_bits(1 << 18).tdp_percent(), 1);
        assert_eq!(PolicyFlags::from_bits(1 << 24).tdp_percent(), 64);
        assert_eq!(
            PolicyFlags::from_bits(1 << 26).goal(),
            Ok(Goal::NetworkEfficiency)
        );
    }
}
