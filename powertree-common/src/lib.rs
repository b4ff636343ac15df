// SPDX-License-Identifier: GPL-2.0-only
// Copyright (C) 2024 Ankit Kumar Pandey <ankitkpandey1@gmail.com>

//! # powertree-common
//!
//! Control-plane message types shared by every level of the power
//! management tree and by the instrumented application.
//!
//! All wire and shared-memory types are `#[repr(C)]` with explicit padding,
//! so a message copied to bytes at one tree level decodes to the identical
//! bytes at the next one.
//!
//! ## Message flow
//!
//! ```text
//!            PolicyMessage (root -> leaf)
//!   root  ------------------------------->  leaf  --> enforce_policy()
//!         <-------------------------------        <-- ProfMessage (app)
//!            SampleMessage (leaf -> root)
//! ```
//!
//! The node-local handshake between the leaf controller and the application
//! lives in [`CtlMessage`], which is placed in shared memory and touched only
//! through atomics.

#![no_std]

pub mod flags;

pub use flags::{Affinity, FlagsError, Goal, PolicyFlags, FLAGS_PROTOCOL_VERSION};

use core::fmt;
use core::sync::atomic::{AtomicI32, AtomicU32, Ordering};

// ============================================================================
// Domains
// ============================================================================

/// Granularity at which a register or a policy applies
#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Domain {
    Package = 0,
    Cpu = 1,
    Tile = 2,
    BoardMemory = 3,
}

impl Domain {
    pub const fn name(self) -> &'static str {
        match self {
            Domain::Package => "package",
            Domain::Cpu => "cpu",
            Domain::Tile => "tile",
            Domain::BoardMemory => "board_memory",
        }
    }
}

impl fmt::Display for Domain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl TryFrom<u32> for Domain {
    type Error = ();

    fn try_from(value: u32) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(Domain::Package),
            1 => Ok(Domain::Cpu),
            2 => Ok(Domain::Tile),
            3 => Ok(Domain::BoardMemory),
            _ => Err(()),
        }
    }
}

// ============================================================================
// Policy modes
// ============================================================================

/// Power management mode carried by a policy
#[repr(i32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PolicyMode {
    TdpBalanceStatic = 1,
    FreqUniformStatic = 2,
    FreqHybridStatic = 3,
    PerfBalanceDynamic = 4,
    FreqUniformDynamic = 5,
    FreqHybridDynamic = 6,
    Shutdown = 255,
}

impl PolicyMode {
    /// Static modes are fixed for the whole job; dynamic ones are re-decided
    #[inline]
    pub fn is_dynamic(self) -> bool {
        matches!(
            self,
            PolicyMode::PerfBalanceDynamic
                | PolicyMode::FreqUniformDynamic
                | PolicyMode::FreqHybridDynamic
        )
    }

    /// Hybrid modes run a subset of CPUs at a different frequency
    #[inline]
    pub fn is_hybrid(self) -> bool {
        matches!(
            self,
            PolicyMode::FreqHybridStatic | PolicyMode::FreqHybridDynamic
        )
    }

    #[inline]
    pub fn is_frequency_uniform(self) -> bool {
        matches!(
            self,
            PolicyMode::FreqUniformStatic | PolicyMode::FreqUniformDynamic
        )
    }
}

impl TryFrom<i32> for PolicyMode {
    type Error = ();

    fn try_from(value: i32) -> Result<Self, Self::Error> {
        match value {
            1 => Ok(PolicyMode::TdpBalanceStatic),
            2 => Ok(PolicyMode::FreqUniformStatic),
            3 => Ok(PolicyMode::FreqHybridStatic),
            4 => Ok(PolicyMode::PerfBalanceDynamic),
            5 => Ok(PolicyMode::FreqUniformDynamic),
            6 => Ok(PolicyMode::FreqHybridDynamic),
            255 => Ok(PolicyMode::Shutdown),
            _ => Err(()),
        }
    }
}

/// Mode value of [`UNKNOWN_POLICY`]; the only non-mode value accepted on the wire
pub const MODE_UNKNOWN: i32 = -1;

// ============================================================================
// Runtime / application status (handshake state machine)
// ============================================================================

/// Handshake phase of the leaf controller or the application
///
/// ```text
/// UNDEFINED -> INITIALIZED -> ACTIVE -> REPORT -> READY
///     \____________\______________\________\________\___> SHUTDOWN
/// ```
///
/// Transitions only move forward. `SHUTDOWN` is reachable from every state
/// and is terminal.
#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default)]
pub enum Status {
    /// Nobody has attached
    #[default]
    Undefined = 0,

    /// Runtime published the shared region, application may attach
    Initialized = 1,

    /// Application is emitting profile messages
    Active = 2,

    /// Runtime is finalizing the statistics of the current epoch
    Report = 3,

    /// Runtime applied the next policy, application may continue
    Ready = 4,

    /// Teardown; the cpu_rank table is no longer valid
    Shutdown = 5,
}

impl Status {
    /// Whether a word currently holding `self` may be moved to `next`
    #[inline]
    pub fn may_advance_to(self, next: Status) -> bool {
        next == Status::Shutdown || (self != Status::Shutdown && next >= self)
    }

    #[inline]
    pub fn is_shutdown(self) -> bool {
        matches!(self, Status::Shutdown)
    }
}

impl TryFrom<u32> for Status {
    type Error = ();

    fn try_from(value: u32) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(Status::Undefined),
            1 => Ok(Status::Initialized),
            2 => Ok(Status::Active),
            3 => Ok(Status::Report),
            4 => Ok(Status::Ready),
            5 => Ok(Status::Shutdown),
            _ => Err(()),
        }
    }
}

// ============================================================================
// Time
// ============================================================================

/// Monotonic time stamp with the layout of `struct timespec`
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Timespec {
    pub sec: i64,
    pub nsec: i64,
}

impl Timespec {
    pub const fn new(sec: i64, nsec: i64) -> Self {
        Self { sec, nsec }
    }

    pub const fn from_nanos(ns: u64) -> Self {
        Self {
            sec: (ns / 1_000_000_000) as i64,
            nsec: (ns % 1_000_000_000) as i64,
        }
    }

    pub const fn as_nanos(&self) -> i128 {
        self.sec as i128 * 1_000_000_000 + self.nsec as i128
    }

    /// Seconds elapsed from `earlier` to `self` (negative if `earlier` is later)
    pub fn seconds_since(&self, earlier: &Timespec) -> f64 {
        (self.sec - earlier.sec) as f64 + (self.nsec - earlier.nsec) as f64 * 1e-9
    }
}

// ============================================================================
// Wire messages
// ============================================================================

/// Error decoding a message received from another tree level
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecodeError {
    /// Buffer shorter than the fixed message size
    Truncated { expected: usize, actual: usize },
    /// Mode is neither a known mode nor [`MODE_UNKNOWN`]
    InvalidMode(i32),
}

impl fmt::Display for DecodeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DecodeError::Truncated { expected, actual } => {
                write!(f, "truncated message: expected {} bytes, got {}", expected, actual)
            }
            DecodeError::InvalidMode(mode) => write!(f, "invalid policy mode {}", mode),
        }
    }
}

macro_rules! wire_message {
    ($ty:ty, $size:expr) => {
        impl $ty {
            /// Encoded size in bytes
            pub const WIRE_SIZE: usize = $size;

            /// Raw bytes of the message as laid out in memory
            #[inline]
            pub fn to_bytes(&self) -> [u8; $size] {
                // SAFETY: the type is repr(C), Copy, and has no implicit padding
                // (asserted below), so every byte is initialized.
                unsafe { core::mem::transmute::<$ty, [u8; $size]>(*self) }
            }

            #[inline]
            fn read_raw(bytes: &[u8]) -> Result<Self, DecodeError> {
                if bytes.len() < Self::WIRE_SIZE {
                    return Err(DecodeError::Truncated {
                        expected: Self::WIRE_SIZE,
                        actual: bytes.len(),
                    });
                }
                // SAFETY: length checked; every bit pattern is a valid value
                // for the integer and float fields of this type.
                Ok(unsafe { core::ptr::read_unaligned(bytes.as_ptr() as *const $ty) })
            }
        }

        const _: () = assert!(
            core::mem::size_of::<$ty>() == $size,
            concat!(stringify!($ty), " must have no implicit padding")
        );
    };
}

/// Policy sent down the tree for one region
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PolicyMessage {
    /// 64-bit region identifier, unique within a job
    pub region_id: u64,

    /// [`PolicyMode`] as its raw discriminant
    pub mode: i32,

    _pad0: u32,

    /// [`PolicyFlags`] bits
    pub flags: u64,

    /// Samples to collect before sending one up the tree
    pub num_sample: i32,

    _pad1: u32,

    /// Power budget in Watts
    pub power_budget: f64,
}

wire_message!(PolicyMessage, 40);

impl PolicyMessage {
    pub const fn new(
        region_id: u64,
        mode: PolicyMode,
        flags: PolicyFlags,
        num_sample: i32,
        power_budget: f64,
    ) -> Self {
        Self {
            region_id,
            mode: mode as i32,
            _pad0: 0,
            flags: flags.bits(),
            num_sample,
            _pad1: 0,
            power_budget,
        }
    }

    /// Typed mode, `None` for [`UNKNOWN_POLICY`] or corrupt values
    #[inline]
    pub fn mode(&self) -> Option<PolicyMode> {
        PolicyMode::try_from(self.mode).ok()
    }

    #[inline]
    pub fn flags(&self) -> PolicyFlags {
        PolicyFlags::from_bits(self.flags)
    }

    pub fn is_unknown(&self) -> bool {
        self.mode == MODE_UNKNOWN
    }

    /// Decode a message produced by [`PolicyMessage::to_bytes`]
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, DecodeError> {
        let msg = Self::read_raw(bytes)?;
        if msg.mode != MODE_UNKNOWN && PolicyMode::try_from(msg.mode).is_err() {
            return Err(DecodeError::InvalidMode(msg.mode));
        }
        Ok(msg)
    }
}

/// Placeholder policy before any decision has been made
pub const UNKNOWN_POLICY: PolicyMessage = PolicyMessage {
    region_id: GLOBAL_POLICY_REGION,
    mode: MODE_UNKNOWN,
    _pad0: 0,
    flags: 0,
    num_sample: -1,
    _pad1: 0,
    power_budget: -1.0,
};

/// Whether two policies carry the same control intent.
///
/// Compares `region_id`, `mode`, `flags`, and the bit pattern of
/// `power_budget`. `num_sample` is a reporting cadence hint and is ignored.
#[inline]
pub fn is_policy_equal(a: &PolicyMessage, b: &PolicyMessage) -> bool {
    a.region_id == b.region_id
        && a.mode == b.mode
        && a.flags == b.flags
        && a.power_budget.to_bits() == b.power_budget.to_bits()
}

/// Aggregated telemetry sent up the tree
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SampleMessage {
    pub rank: i32,
    _pad0: u32,
    pub region_id: u64,
    /// Elapsed time in the region, seconds
    pub runtime: f64,
    /// Energy consumed in the region, joules
    pub energy: f64,
    /// Average frequency in the region, Hz
    pub frequency: f64,
}

wire_message!(SampleMessage, 40);

impl SampleMessage {
    pub const fn new(rank: i32, region_id: u64, runtime: f64, energy: f64, frequency: f64) -> Self {
        Self {
            rank,
            _pad0: 0,
            region_id,
            runtime,
            energy,
            frequency,
        }
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, DecodeError> {
        Self::read_raw(bytes)
    }

    pub fn is_invalid(&self) -> bool {
        self.rank == INVALID_SAMPLE.rank
    }
}

/// Sample reported when no valid data exists
pub const INVALID_SAMPLE: SampleMessage = SampleMessage {
    rank: -1,
    _pad0: 0,
    region_id: 0,
    runtime: -1.0,
    energy: -1.0,
    frequency: -1.0,
};

/// Raw per-rank progress event produced by application instrumentation
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ProfMessage {
    pub rank: i32,
    _pad0: u32,
    pub region_id: u64,
    pub timestamp: Timespec,
    /// Fraction of the region completed, 0.0 on entry and 1.0 on exit
    pub progress: f64,
}

wire_message!(ProfMessage, 40);

impl ProfMessage {
    pub const fn new(rank: i32, region_id: u64, timestamp: Timespec, progress: f64) -> Self {
        Self {
            rank,
            _pad0: 0,
            region_id,
            timestamp,
            progress,
        }
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, DecodeError> {
        Self::read_raw(bytes)
    }

    #[inline]
    pub fn is_entry(&self) -> bool {
        self.progress == 0.0
    }

    #[inline]
    pub fn is_exit(&self) -> bool {
        self.progress == 1.0
    }
}

// ============================================================================
// Control message (runtime <-> application shared memory)
// ============================================================================

/// Rejected status word transition
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InvalidTransition {
    /// Raw value found in the word
    pub from: u32,
    pub to: Status,
}

impl fmt::Display for InvalidTransition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match Status::try_from(self.from) {
            Ok(from) => write!(f, "invalid status transition {:?} -> {:?}", from, self.to),
            Err(()) => write!(f, "invalid status transition {} -> {:?}", self.from, self.to),
        }
    }
}

/// `cpu_rank` entry for a CPU with no rank pinned to it
pub const CPU_UNAFFINITIZED: i32 = -1;

/// Node-local handshake block shared by the leaf controller and the application
///
/// Each field has exactly one writer:
/// - `ctl_status`, `cpu_rank`: leaf controller
/// - `app_status`: application
///
/// Status words are stored with `Release` and loaded with `Acquire`, so the
/// `cpu_rank` table written before a status change is visible to whoever
/// observes that change.
#[repr(C)]
#[derive(Debug)]
pub struct CtlMessage {
    pub ctl_status: AtomicU32,
    pub app_status: AtomicU32,
    pub cpu_rank: [AtomicI32; config::MAX_NUM_CPU],
}

impl CtlMessage {
    pub const fn new() -> Self {
        Self {
            ctl_status: AtomicU32::new(Status::Undefined as u32),
            app_status: AtomicU32::new(Status::Undefined as u32),
            cpu_rank: [const { AtomicI32::new(CPU_UNAFFINITIZED) }; config::MAX_NUM_CPU],
        }
    }

    #[inline]
    fn advance(word: &AtomicU32, next: Status) -> Result<Status, InvalidTransition> {
        word.fetch_update(Ordering::AcqRel, Ordering::Acquire, |raw| {
            match Status::try_from(raw) {
                Ok(current) if current.may_advance_to(next) => Some(next as u32),
                // A corrupt word can still be forced to SHUTDOWN
                Err(()) if next == Status::Shutdown => Some(next as u32),
                _ => None,
            }
        })
        .map(|prev| Status::try_from(prev).unwrap_or(Status::Undefined))
        .map_err(|from| InvalidTransition { from, to: next })
    }

    /// Runtime status, `None` if the word holds an unknown value
    #[inline]
    pub fn ctl_status(&self) -> Option<Status> {
        Status::try_from(self.ctl_status.load(Ordering::Acquire)).ok()
    }

    /// Application status, `None` if the word holds an unknown value
    #[inline]
    pub fn app_status(&self) -> Option<Status> {
        Status::try_from(self.app_status.load(Ordering::Acquire)).ok()
    }

    /// Advance the runtime status; returns the previous status
    pub fn set_ctl_status(&self, next: Status) -> Result<Status, InvalidTransition> {
        Self::advance(&self.ctl_status, next)
    }

    /// Advance the application status; returns the previous status
    pub fn set_app_status(&self, next: Status) -> Result<Status, InvalidTransition> {
        Self::advance(&self.app_status, next)
    }

    /// Record the rank pinned to `cpu`; ignored for CPUs past the table
    #[inline]
    pub fn set_cpu_rank(&self, cpu: usize, rank: i32) {
        if let Some(slot) = self.cpu_rank.get(cpu) {
            slot.store(rank, Ordering::Relaxed);
        }
    }

    /// Rank pinned to `cpu`, `None` if unaffinitized or the table is torn down
    #[inline]
    pub fn cpu_rank(&self, cpu: usize) -> Option<i32> {
        if matches!(self.ctl_status(), Some(Status::Shutdown) | None) {
            return None;
        }
        match self.cpu_rank.get(cpu)?.load(Ordering::Relaxed) {
            CPU_UNAFFINITIZED => None,
            rank => Some(rank),
        }
    }

    /// Whether the leaf controller may read hardware counters and progress
    pub fn sampling_permitted(&self) -> bool {
        match (self.ctl_status(), self.app_status()) {
            (Some(ctl), Some(app)) => {
                ctl >= Status::Initialized
                    && app >= Status::Active
                    && !ctl.is_shutdown()
                    && !app.is_shutdown()
            }
            _ => false,
        }
    }

    /// Whether either party requested teardown
    pub fn is_shutdown(&self) -> bool {
        self.ctl_status() == Some(Status::Shutdown) || self.app_status() == Some(Status::Shutdown)
    }
}

impl Default for CtlMessage {
    fn default() -> Self {
        Self::new()
    }
}

// ============================================================================
// Configuration constants
// ============================================================================

/// Region identifier of the job-wide policy
pub const GLOBAL_POLICY_REGION: u64 = 0;

/// Configuration constants
pub mod config {
    /// Capacity of the `cpu_rank` table in [`crate::CtlMessage`]
    pub const MAX_NUM_CPU: usize = 768;

    /// Default sampling interval in nanoseconds (5ms)
    pub const DEFAULT_SAMPLE_INTERVAL_NS: u64 = 5 * 1_000_000;

    /// Default bound on waiting for the policy shared-memory lock (10ms)
    pub const DEFAULT_LOCK_TIMEOUT_NS: u64 = 10 * 1_000_000;

    /// Default profile queue depth per node
    pub const DEFAULT_PROF_QUEUE_DEPTH: usize = 4096;
}

/// Shared-memory object names
pub mod shm_names {
    pub const CTL: &str = "/powertree-ctl";
    pub const POLICY: &str = "/powertree-policy";
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use core::mem::{offset_of, size_of};

    #[test]
    fn test_message_layouts() {
        assert_eq!(size_of::<PolicyMessage>(), 40);
        assert_eq!(offset_of!(PolicyMessage, region_id), 0);
        assert_eq!(offset_of!(PolicyMessage, mode), 8);
        assert_eq!(offset_of!(PolicyMessage, flags), 16);
        assert_eq!(offset_of!(PolicyMessage, num_sample), 24);
        assert_eq!(offset_of!(PolicyMessage, power_budget), 32);

        assert_eq!(size_of::<SampleMessage>(), 40);
        assert_eq!(offset_of!(SampleMessage, region_id), 8);
        assert_eq!(offset_of!(SampleMessage, frequency), 32);

        assert_eq!(size_of::<ProfMessage>(), 40);
        assert_eq!(offset_of!(ProfMessage, timestamp), 16);
        assert_eq!(offset_of!(ProfMessage, progress), 32);
    }

    #[test]
    fn test_ctl_message_layout() {
        assert_eq!(offset_of!(CtlMessage, ctl_status), 0);
        assert_eq!(offset_of!(CtlMessage, app_status), 4);
        assert_eq!(offset_of!(CtlMessage, cpu_rank), 8);
        assert_eq!(size_of::<CtlMessage>(), 8 + 4 * config::MAX_NUM_CPU);
    }

    #[test]
    fn test_policy_round_trip_is_byte_identical() {
        let mut flags = PolicyFlags::default();
        flags.set_tdp_percent(80).unwrap();
        let policy = PolicyMessage::new(0xDEAD_BEEF_0000_0042, PolicyMode::TdpBalanceStatic, flags, 8, 185.5);

        let bytes = policy.to_bytes();
        let decoded = PolicyMessage::from_bytes(&bytes).unwrap();
        assert_eq!(decoded.to_bytes(), bytes);
        assert_eq!(decoded.region_id, policy.region_id);
        assert_eq!(decoded.mode(), Some(PolicyMode::TdpBalanceStatic));
        assert_eq!(decoded.flags().tdp_percent(), 80);
        assert_eq!(decoded.num_sample, 8);
        assert_eq!(decoded.power_budget, 185.5);
    }

    #[test]
    fn test_unknown_policy_survives_the_wire() {
        let decoded = PolicyMessage::from_bytes(&UNKNOWN_POLICY.to_bytes()).unwrap();
        assert!(decoded.is_unknown());
        assert_eq!(decoded.mode(), None);
    }

    #[test]
    fn test_policy_decode_rejects_bad_input() {
        let bytes = UNKNOWN_POLICY.to_bytes();
        assert_eq!(
            PolicyMessage::from_bytes(&bytes[..39]),
            Err(DecodeError::Truncated {
                expected: 40,
                actual: 39
            })
        );

        let mut corrupt = PolicyMessage::new(1, PolicyMode::Shutdown, PolicyFlags::default(), 1, 0.0);
        corrupt.mode = 77;
        assert_eq!(
            PolicyMessage::from_bytes(&corrupt.to_bytes()),
            Err(DecodeError::InvalidMode(77))
        );
    }

    #[test]
    fn test_policy_equality_ignores_num_sample() {
        let a = PolicyMessage::new(7, PolicyMode::PerfBalanceDynamic, PolicyFlags::default(), 4, 250.0);
        let mut b = a;
        b.num_sample = 16;
        assert!(is_policy_equal(&a, &b));
        assert!(is_policy_equal(&b, &a));

        b.power_budget = 251.0;
        assert!(!is_policy_equal(&a, &b));
        assert!(!is_policy_equal(&b, &a));
    }

    #[test]
    fn test_policy_equality_is_reflexive_for_nan_budget() {
        let p = PolicyMessage::new(1, PolicyMode::PerfBalanceDynamic, PolicyFlags::default(), 1, f64::NAN);
        assert!(is_policy_equal(&p, &p));
    }

    #[test]
    fn test_sample_and_prof_round_trip() {
        let sample = SampleMessage::new(3, 99, 1.5, 420.0, 2.1e9);
        assert_eq!(SampleMessage::from_bytes(&sample.to_bytes()), Ok(sample));

        let prof = ProfMessage::new(3, 99, Timespec::new(12, 500), 0.25);
        assert_eq!(ProfMessage::from_bytes(&prof.to_bytes()), Ok(prof));
        assert!(INVALID_SAMPLE.is_invalid());
    }

    #[test]
    fn test_status_transitions() {
        assert!(Status::Undefined.may_advance_to(Status::Initialized));
        assert!(Status::Initialized.may_advance_to(Status::Initialized));
        assert!(Status::Active.may_advance_to(Status::Ready));
        assert!(!Status::Ready.may_advance_to(Status::Active));
        assert!(Status::Undefined.may_advance_to(Status::Shutdown));
        assert!(!Status::Shutdown.may_advance_to(Status::Ready));
        assert!(Status::Shutdown.may_advance_to(Status::Shutdown));
    }

    #[test]
    fn test_ctl_message_handshake() {
        let ctl = CtlMessage::new();
        assert_eq!(ctl.ctl_status(), Some(Status::Undefined));
        assert_eq!(ctl.app_status(), Some(Status::Undefined));
        assert!(!ctl.sampling_permitted());

        ctl.set_cpu_rank(0, 4);
        ctl.set_ctl_status(Status::Initialized).unwrap();
        assert!(!ctl.sampling_permitted());

        ctl.set_app_status(Status::Active).unwrap();
        assert!(ctl.sampling_permitted());
        assert_eq!(ctl.cpu_rank(0), Some(4));
        assert_eq!(ctl.cpu_rank(1), None);
        assert_eq!(ctl.cpu_rank(config::MAX_NUM_CPU), None);

        assert_eq!(
            ctl.set_ctl_status(Status::Undefined),
            Err(InvalidTransition {
                from: Status::Initialized as u32,
                to: Status::Undefined
            })
        );

        assert_eq!(ctl.set_ctl_status(Status::Shutdown), Ok(Status::Initialized));
        assert!(!ctl.sampling_permitted());
        assert!(ctl.is_shutdown());
        assert_eq!(ctl.cpu_rank(0), None);
    }

    #[test]
    fn test_corrupt_status_word() {
        let ctl = CtlMessage::new();
        ctl.app_status.store(42, Ordering::Release);
        assert_eq!(ctl.app_status(), None);
        assert!(ctl.set_app_status(Status::Active).is_err());
        assert!(ctl.set_app_status(Status::Shutdown).is_ok());
    }

    #[test]
    fn test_domain_conversion() {
        assert_eq!(Domain::try_from(0), Ok(Domain::Package));
        assert_eq!(Domain::try_from(3), Ok(Domain::BoardMemory));
        assert_eq!(Domain::try_from(4), Err(()));
    }

    #[test]
    fn test_timespec_arithmetic() {
        let a = Timespec::from_nanos(1_500_000_000);
        assert_eq!(a, Timespec::new(1, 500_000_000));
        let b = Timespec::new(3, 0);
        let err = b.seconds_since(&a) - 1.5;
        assert!(err < 1e-12 && err > -1e-12);
        assert_eq!(b.as_nanos(), 3_000_000_000);
    }
}
