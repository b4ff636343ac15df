//! Profile aggregation
//!
//! Application threads push [`ProfMessage`]s into a bounded lock-free queue.
//! The leaf controller drains it once per control cycle and pairs region
//! entries with exits to produce one node-level [`SampleMessage`] per
//! completed region, using node counters accumulated from the sample buffers.

use crate::platform::{Signal, SignalDescriptor, SignalSample};
use crossbeam::queue::ArrayQueue;
use powertree_common::{ProfMessage, SampleMessage, Timespec};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::{debug, warn};

/// Bounded queue between application threads and the leaf controller
pub struct ProfQueue {
    queue: ArrayQueue<ProfMessage>,
    dropped: AtomicU64,
}

impl ProfQueue {
    pub fn new(capacity: usize) -> Self {
        Self {
            queue: ArrayQueue::new(capacity.max(1)),
            dropped: AtomicU64::new(0),
        }
    }

    /// Enqueue without blocking. Returns false and counts the message as
    /// dropped when the queue is full.
    pub fn push(&self, msg: ProfMessage) -> bool {
        match self.queue.push(msg) {
            Ok(()) => true,
            Err(_) => {
                let dropped = self.dropped.fetch_add(1, Ordering::Relaxed) + 1;
                if dropped.is_power_of_two() {
                    warn!("profile queue full, {} messages dropped", dropped);
                }
                false
            }
        }
    }

    pub fn pop(&self) -> Option<ProfMessage> {
        self.queue.pop()
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.queue.capacity()
    }

    /// Messages rejected because the queue was full
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

/// Node-wide totals since the accumulator started
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct NodeCounters {
    /// Package plus memory energy, in joules
    pub energy_j: f64,
    pub inst_retired: u64,
    pub clk_core: u64,
    pub clk_ref: u64,
    pub llc_victims: u64,
}

/// Wrap-corrected accumulation of raw counter samples
pub struct CounterAccumulator {
    plan: Vec<(Signal, f64)>,
    previous: Vec<Option<u64>>,
    totals: NodeCounters,
}

impl CounterAccumulator {
    pub fn new(descriptors: &[SignalDescriptor]) -> Self {
        Self {
            plan: descriptors.iter().map(|d| (d.signal, d.scale)).collect(),
            previous: vec![None; descriptors.len()],
            totals: NodeCounters::default(),
        }
    }

    /// Fold one sample buffer into the totals. The first buffer only
    /// establishes the baseline.
    pub fn update(&mut self, buffer: &[SignalSample]) {
        for ((sample, &(signal, scale)), prev) in
            buffer.iter().zip(&self.plan).zip(self.previous.iter_mut())
        {
            if let Some(last) = prev.replace(sample.raw) {
                let delta = wrapping_delta(last, sample.raw, signal.counter_width());
                match signal {
                    Signal::PackageEnergy | Signal::DramEnergy => {
                        self.totals.energy_j += delta as f64 * scale;
                    }
                    // Core plane energy is already part of the package total
                    Signal::Pp0Energy => {}
                    Signal::InstRetired => self.totals.inst_retired += delta,
                    Signal::ClkUnhaltedCore => self.totals.clk_core += delta,
                    Signal::ClkUnhaltedRef => self.totals.clk_ref += delta,
                    Signal::LlcVictims => self.totals.llc_victims += delta,
                }
            }
        }
    }

    pub fn totals(&self) -> NodeCounters {
        self.totals
    }
}

/// Difference between two readings of a `width`-bit counter that may have
/// wrapped once
#[inline]
pub fn wrapping_delta(previous: u64, current: u64, width: u32) -> u64 {
    let mask = if width >= 64 { u64::MAX } else { (1u64 << width) - 1 };
    current.wrapping_sub(previous) & mask
}

struct OpenRegion {
    /// Node counters when the first rank entered
    counters: NodeCounters,
    /// First rank to enter, reported as the sample's rank
    rank: i32,
    /// Entry time of every rank still inside
    inside: HashMap<i32, Timespec>,
    /// Longest completed rank runtime so far
    runtime: f64,
}

/// Reduces the ranks of one node into node-level region samples.
///
/// A region opens when its first rank enters and closes when the last rank
/// inside exits. The closing sample carries the slowest rank's runtime and
/// the node energy consumed over the whole span, counted once no matter how
/// many ranks shared it.
pub struct RegionAggregator {
    nominal_hz: f64,
    open: HashMap<u64, OpenRegion>,
}

impl RegionAggregator {
    pub fn new(nominal_hz: f64) -> Self {
        Self {
            nominal_hz,
            open: HashMap::new(),
        }
    }

    /// Feed one profile message. Returns a sample when it closes a region.
    pub fn record(&mut self, msg: &ProfMessage, counters: &NodeCounters) -> Option<SampleMessage> {
        if msg.is_entry() {
            let region = self.open.entry(msg.region_id).or_insert_with(|| OpenRegion {
                counters: *counters,
                rank: msg.rank,
                inside: HashMap::new(),
                runtime: 0.0,
            });
            region.inside.insert(msg.rank, msg.timestamp);
            return None;
        }
        if !msg.is_exit() {
            return None;
        }

        let Some(region) = self.open.get_mut(&msg.region_id) else {
            debug!(
                "rank {} exited region {:#x} without entering it",
                msg.rank, msg.region_id
            );
            return None;
        };
        let Some(entered) = region.inside.remove(&msg.rank) else {
            debug!(
                "rank {} exited region {:#x} without entering it",
                msg.rank, msg.region_id
            );
            return None;
        };
        region.runtime = region.runtime.max(msg.timestamp.seconds_since(&entered));
        if !region.inside.is_empty() {
            return None;
        }

        let region = self.open.remove(&msg.region_id)?;
        let clk_core = counters.clk_core.saturating_sub(region.counters.clk_core);
        let clk_ref = counters.clk_ref.saturating_sub(region.counters.clk_ref);
        let frequency = if clk_ref > 0 {
            clk_core as f64 / clk_ref as f64 * self.nominal_hz
        } else {
            0.0
        };

        Some(SampleMessage::new(
            region.rank,
            msg.region_id,
            region.runtime,
            counters.energy_j - region.counters.energy_j,
            frequency,
        ))
    }

    /// Regions with at least one rank still inside
    pub fn open_regions(&self) -> usize {
        self.open.len()
    }

    /// Forget every open region, returning how many were dropped
    pub fn clear(&mut self) -> usize {
        let dropped = self.open.len();
        if dropped > 0 {
            warn!("discarding {} regions that never completed", dropped);
        }
        self.open.clear();
        dropped
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use powertree_common::Domain;

    fn descriptor(signal: Signal, scale: f64) -> SignalDescriptor {
        SignalDescriptor {
            domain: Domain::Package,
            index: 0,
            signal,
            register: "TEST",
            cpu: 0,
            offset: 0,
            scale,
        }
    }

    fn sample(signal: Signal, raw: u64) -> SignalSample {
        SignalSample {
            signal,
            raw,
            ..SignalSample::EMPTY
        }
    }

    #[test]
    fn test_queue_overflow_counts_drops() {
        let queue = ProfQueue::new(2);
        let msg = ProfMessage::new(0, 1, Timespec::new(0, 0), 0.0);
        assert!(queue.push(msg));
        assert!(queue.push(msg));
        assert!(!queue.push(msg));
        assert_eq!(queue.dropped(), 1);
        assert_eq!(queue.len(), 2);
        assert!(queue.pop().is_some());
        assert!(queue.push(msg));
    }

    #[test]
    fn test_wrapping_delta() {
        assert_eq!(wrapping_delta(10, 25, 32), 15);
        assert_eq!(wrapping_delta(0xFFFF_FFF0, 0x10, 32), 0x20);
        assert_eq!(wrapping_delta(0xFFFF_FFFF_FFFF, 1, 48), 2);
    }

    #[test]
    fn test_accumulator_handles_energy_wrap() {
        let plan = [
            descriptor(Signal::PackageEnergy, 0.5),
            descriptor(Signal::Pp0Energy, 0.5),
            descriptor(Signal::ClkUnhaltedCore, 1.0),
        ];
        let mut acc = CounterAccumulator::new(&plan);

        acc.update(&[
            sample(Signal::PackageEnergy, 0xFFFF_FFFE),
            sample(Signal::Pp0Energy, 0),
            sample(Signal::ClkUnhaltedCore, 100),
        ]);
        assert_eq!(acc.totals(), NodeCounters::default());

        acc.update(&[
            sample(Signal::PackageEnergy, 2),
            sample(Signal::Pp0Energy, 4),
            sample(Signal::ClkUnhaltedCore, 300),
        ]);
        let totals = acc.totals();
        assert_eq!(totals.energy_j, 2.0);
        assert_eq!(totals.clk_core, 200);
    }

    #[test]
    fn test_region_pairing() {
        let mut agg = RegionAggregator::new(2.0e9);
        let mut counters = NodeCounters {
            energy_j: 10.0,
            clk_core: 1000,
            clk_ref: 1000,
            ..NodeCounters::default()
        };

        let entry = ProfMessage::new(3, 0x42, Timespec::new(1, 0), 0.0);
        assert!(agg.record(&entry, &counters).is_none());
        assert_eq!(agg.open_regions(), 1);

        let midway = ProfMessage::new(3, 0x42, Timespec::new(1, 500), 0.5);
        assert!(agg.record(&midway, &counters).is_none());

        counters.energy_j = 25.0;
        counters.clk_core = 2500;
        counters.clk_ref = 2000;
        let exit = ProfMessage::new(3, 0x42, Timespec::new(3, 500_000_000), 1.0);
        let sample = agg.record(&exit, &counters).unwrap();
        assert_eq!(sample.rank, 3);
        assert_eq!(sample.region_id, 0x42);
        assert_eq!(sample.runtime, 2.5);
        assert_eq!(sample.energy, 15.0);
        assert_eq!(sample.frequency, 3.0e9);
        assert_eq!(agg.open_regions(), 0);
    }

    #[test]
    fn test_shared_region_counts_node_energy_once() {
        let mut agg = RegionAggregator::new(2.0e9);
        let mut counters = NodeCounters {
            energy_j: 100.0,
            ..NodeCounters::default()
        };

        for rank in 0..4 {
            let entry = ProfMessage::new(rank, 0x77, Timespec::new(10, 0), 0.0);
            assert!(agg.record(&entry, &counters).is_none());
        }
        assert_eq!(agg.open_regions(), 1);

        counters.energy_j = 108.0;
        for rank in 0..3 {
            let exit = ProfMessage::new(rank, 0x77, Timespec::new(11, 0), 1.0);
            assert!(agg.record(&exit, &counters).is_none());
        }
        // Slowest rank closes the region
        let exit = ProfMessage::new(3, 0x77, Timespec::new(12, 500_000_000), 1.0);
        let sample = agg.record(&exit, &counters).unwrap();
        assert_eq!(sample.rank, 0);
        assert_eq!(sample.energy, 8.0);
        assert_eq!(sample.runtime, 2.5);
        assert_eq!(agg.open_regions(), 0);
    }

    #[test]
    fn test_clear_drops_abandoned_regions() {
        let mut agg = RegionAggregator::new(2.0e9);
        let counters = NodeCounters::default();
        agg.record(&ProfMessage::new(0, 1, Timespec::new(1, 0), 0.0), &counters);
        agg.record(&ProfMessage::new(1, 2, Timespec::new(1, 0), 0.0), &counters);
        assert_eq!(agg.clear(), 2);
        assert_eq!(agg.open_regions(), 0);
        assert!(agg
            .record(&ProfMessage::new(0, 1, Timespec::new(2, 0), 1.0), &counters)
            .is_none());
    }

    #[test]
    fn test_exit_without_entry_ignored() {
        let mut agg = RegionAggregator::new(2.0e9);
        let exit = ProfMessage::new(0, 7, Timespec::new(1, 0), 1.0);
        assert!(agg.record(&exit, &NodeCounters::default()).is_none());
    }
}
