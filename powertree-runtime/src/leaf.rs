//! Leaf controller
//!
//! Drives one node: gates sampling on the control-block handshake, turns
//! sample buffers and profile messages into per-region samples reported
//! every `num_sample` cycles, and applies policies without re-enforcing one
//! that is already in effect.

use crate::error::{Error, Result};
use crate::platform::{Platform, SignalSample};
use crate::prof::{CounterAccumulator, NodeCounters, ProfQueue, RegionAggregator};
use crate::shmem::{CtlShmem, PolicyShmemHandle};
use powertree_common::{config, is_policy_equal, shm_names, CtlMessage, PolicyMessage, SampleMessage, Status};
use std::ops::Deref;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Leaf controller configuration
#[derive(Debug, Clone)]
pub struct ControllerConfig {
    /// Period of the control loop
    pub sample_interval: Duration,

    /// Bounded wait on the policy block mutex
    pub lock_timeout: Duration,

    /// Profile messages buffered between control cycles
    pub prof_queue_depth: usize,

    /// Control block name
    pub ctl_name: String,

    /// Policy block name
    pub policy_name: String,
}

impl ControllerConfig {
    /// Create the control block under `ctl_name`
    pub fn create_ctl(&self) -> Result<CtlShmem> {
        CtlShmem::create(&self.ctl_name)
    }

    /// Create the policy block under `policy_name`, locked with `lock_timeout`
    pub fn create_policy(&self) -> Result<PolicyShmemHandle> {
        PolicyShmemHandle::create(&self.policy_name, self.lock_timeout)
    }

    /// Attach to the policy block published by the job launcher
    pub fn attach_policy(&self) -> Result<PolicyShmemHandle> {
        PolicyShmemHandle::attach(&self.policy_name, self.lock_timeout)
    }
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            sample_interval: Duration::from_nanos(config::DEFAULT_SAMPLE_INTERVAL_NS),
            lock_timeout: Duration::from_nanos(config::DEFAULT_LOCK_TIMEOUT_NS),
            prof_queue_depth: config::DEFAULT_PROF_QUEUE_DEPTH,
            ctl_name: shm_names::CTL.to_string(),
            policy_name: shm_names::POLICY.to_string(),
        }
    }
}

/// Leaf controller builder
pub struct Builder {
    config: ControllerConfig,
}

impl Builder {
    pub fn new() -> Self {
        Self {
            config: ControllerConfig::default(),
        }
    }

    pub fn sample_interval(mut self, interval: Duration) -> Self {
        self.config.sample_interval = interval;
        self
    }

    pub fn lock_timeout(mut self, timeout: Duration) -> Self {
        self.config.lock_timeout = timeout;
        self
    }

    pub fn prof_queue_depth(mut self, depth: usize) -> Self {
        self.config.prof_queue_depth = depth;
        self
    }

    pub fn ctl_name(mut self, name: impl Into<String>) -> Self {
        self.config.ctl_name = name.into();
        self
    }

    pub fn policy_name(mut self, name: impl Into<String>) -> Self {
        self.config.policy_name = name.into();
        self
    }

    pub fn config(&self) -> &ControllerConfig {
        &self.config
    }

    /// Build a controller for `platform` talking through `ctl`
    pub fn build<P, C>(self, platform: P, ctl: C) -> LeafController<P, C>
    where
        P: Platform,
        C: Deref<Target = CtlMessage>,
    {
        LeafController::new(self.config, platform, ctl)
    }
}

impl Default for Builder {
    fn default() -> Self {
        Self::new()
    }
}

/// Per-node control loop state
pub struct LeafController<P, C> {
    config: ControllerConfig,
    platform: P,
    ctl: C,
    queue: Arc<ProfQueue>,
    buffer: Vec<SignalSample>,
    accumulator: CounterAccumulator,
    aggregator: RegionAggregator,
    last_policy: Option<PolicyMessage>,
    /// Control cycles per report, from the policy's `num_sample`
    report_every: u32,
    cycles: u32,
    pending: Vec<SampleMessage>,
}

impl<P, C> LeafController<P, C>
where
    P: Platform,
    C: Deref<Target = CtlMessage>,
{
    fn new(config: ControllerConfig, platform: P, ctl: C) -> Self {
        let capacity = platform.capacity();
        Self {
            queue: Arc::new(ProfQueue::new(config.prof_queue_depth)),
            buffer: vec![SignalSample::EMPTY; capacity],
            accumulator: CounterAccumulator::new(platform.signal_descriptors()),
            aggregator: RegionAggregator::new(platform.nominal_frequency()),
            last_policy: None,
            report_every: 1,
            cycles: 0,
            pending: Vec::new(),
            config,
            platform,
            ctl,
        }
    }

    pub fn config(&self) -> &ControllerConfig {
        &self.config
    }

    pub fn platform(&self) -> &P {
        &self.platform
    }

    pub fn ctl(&self) -> &CtlMessage {
        &self.ctl
    }

    /// Queue handle for application threads
    pub fn queue(&self) -> Arc<ProfQueue> {
        Arc::clone(&self.queue)
    }

    /// Policy currently in effect, if any
    pub fn last_policy(&self) -> Option<&PolicyMessage> {
        self.last_policy.as_ref()
    }

    pub fn counters(&self) -> NodeCounters {
        self.accumulator.totals()
    }

    /// Regions some rank entered and has not yet left
    pub fn open_regions(&self) -> usize {
        self.aggregator.open_regions()
    }

    /// Most recent sample buffer
    pub fn samples(&self) -> &[SignalSample] {
        &self.buffer
    }

    /// Publish the cpu-to-rank table and mark the runtime `INITIALIZED`.
    ///
    /// `cpu_rank[cpu]` is the rank pinned to `cpu`.
    pub fn publish(&self, cpu_rank: &[i32]) -> Result<()> {
        if cpu_rank.len() > config::MAX_NUM_CPU {
            return Err(Error::Configuration(format!(
                "{} cpus exceed the control block limit of {}",
                cpu_rank.len(),
                config::MAX_NUM_CPU
            )));
        }
        for (cpu, &rank) in cpu_rank.iter().enumerate() {
            self.ctl.set_cpu_rank(cpu, rank);
        }
        // Release store publishes the table written above
        self.ctl.set_ctl_status(Status::Initialized)?;
        info!("published ranks for {} cpus", cpu_rank.len());
        Ok(())
    }

    /// Control cycles between reports up the tree
    pub fn report_every(&self) -> u32 {
        self.report_every
    }

    /// One control cycle: sample, accumulate, and close finished regions.
    ///
    /// Completed region samples are held back and returned together on
    /// every `report_every`-th cycle; other cycles return nothing.
    pub fn step(&mut self) -> Result<Vec<SampleMessage>> {
        if !self.ctl.sampling_permitted() {
            return Err(Error::NotActive);
        }

        self.platform.sample(&mut self.buffer)?;
        self.accumulator.update(&self.buffer);
        let totals = self.accumulator.totals();

        while let Some(msg) = self.queue.pop() {
            if let Some(sample) = self.aggregator.record(&msg, &totals) {
                self.pending.push(sample);
            }
        }

        self.cycles += 1;
        if self.cycles < self.report_every {
            return Ok(Vec::new());
        }
        self.cycles = 0;
        if !self.pending.is_empty() {
            debug!("reporting {} completed regions", self.pending.len());
        }
        Ok(std::mem::take(&mut self.pending))
    }

    /// Enforce `policy` unless it equals the one in effect.
    ///
    /// Returns whether the platform was asked to enforce. On failure the
    /// previous policy stays in effect.
    pub fn apply_policy(&mut self, policy: &PolicyMessage) -> Result<bool> {
        if let Some(last) = &self.last_policy {
            if is_policy_equal(last, policy) {
                self.set_report_every(policy.num_sample);
                return Ok(false);
            }
        }

        match self.platform.enforce_policy(policy.region_id, policy) {
            Ok(()) => {
                self.last_policy = Some(*policy);
                self.set_report_every(policy.num_sample);
                Ok(true)
            }
            Err(e) => {
                if e.is_transient() {
                    warn!("policy enforcement failed, keeping previous policy: {}", e);
                }
                Err(e)
            }
        }
    }

    /// Read the job policy block and enforce what it holds.
    ///
    /// The read waits at most the block's lock timeout. When the lock cannot
    /// be taken, or nothing has been published yet, the last known-good
    /// policy stays in effect. Returns the policy in effect afterwards.
    pub fn poll_policy(&mut self, shmem: &PolicyShmemHandle) -> Result<Option<PolicyMessage>> {
        match shmem.read_policy() {
            Ok(Some(policy)) => {
                self.apply_policy(&policy)?;
            }
            Ok(None) => {}
            Err(Error::LockTimeout(timeout)) => {
                warn!(
                    "policy block {} busy for {:?}, keeping last policy",
                    shmem.name(),
                    timeout
                );
            }
            Err(e) => return Err(e),
        }
        Ok(self.last_policy)
    }

    fn set_report_every(&mut self, num_sample: i32) {
        let every = u32::try_from(num_sample).unwrap_or(0).max(1);
        if every != self.report_every {
            debug!("reporting every {} cycles", every);
            self.report_every = every;
            self.cycles = 0;
        }
    }

    /// Report phase: `REPORT`, apply the final policy, `READY`.
    ///
    /// Requires the application to have reached `ACTIVE`.
    pub fn finish_epoch(&mut self, policy: &PolicyMessage) -> Result<bool> {
        match self.ctl.app_status() {
            Some(status) if status >= Status::Active && !status.is_shutdown() => {}
            _ => return Err(Error::NotActive),
        }

        self.ctl.set_ctl_status(Status::Report)?;
        let applied = self.apply_policy(policy)?;
        self.ctl.set_ctl_status(Status::Ready)?;
        info!("epoch finished, policy {}", if applied { "applied" } else { "unchanged" });
        Ok(applied)
    }

    /// Mark `SHUTDOWN` and restore every register the platform changed
    pub fn shutdown(&mut self) -> Result<()> {
        self.ctl.set_ctl_status(Status::Shutdown)?;
        self.last_policy = None;
        self.aggregator.clear();
        self.pending.clear();
        let result = self.platform.reset();
        info!(
            "leaf controller shut down ({} profile messages dropped)",
            self.queue.dropped()
        );
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::generation::platform_id;
    use crate::msr::MsrAccess;
    use crate::rapl::RaplPlatform;
    use crate::sim::SimBackend;
    use crate::topology::Topology;
    use powertree_common::{PolicyFlags, PolicyMode, ProfMessage, Timespec};
    use std::sync::Barrier;

    fn msr() -> (SimBackend, MsrAccess) {
        let sim = SimBackend::new(4);
        let topo = Topology::new(1, 2, 4, 4).unwrap();
        let msr = MsrAccess::initialize(topo, &sim, platform_id::BROADWELL_E).unwrap();
        (sim, msr)
    }

    #[test]
    fn test_builder_defaults() {
        let builder = Builder::new().lock_timeout(Duration::from_millis(3));
        assert_eq!(builder.config().lock_timeout, Duration::from_millis(3));
        assert_eq!(builder.config().sample_interval, Duration::from_millis(5));
        assert_eq!(builder.config().ctl_name, "/powertree-ctl");
    }

    #[test]
    fn test_step_requires_handshake() {
        let (_sim, msr) = msr();
        let rapl = RaplPlatform::new(&msr).unwrap();
        let mut leaf = Builder::new().build(rapl, Box::new(CtlMessage::new()));

        assert!(matches!(leaf.step(), Err(Error::NotActive)));
        leaf.publish(&[0, 0, 1, 1]).unwrap();
        assert!(matches!(leaf.step(), Err(Error::NotActive)));

        leaf.ctl().set_app_status(Status::Active).unwrap();
        assert!(leaf.step().unwrap().is_empty());
        assert_eq!(leaf.ctl().cpu_rank(2), Some(1));
    }

    #[test]
    fn test_region_sample_from_queue() {
        let (sim, msr) = msr();
        let rapl = RaplPlatform::new(&msr).unwrap();
        let mut leaf = Builder::new().build(rapl, Box::new(CtlMessage::new()));
        leaf.publish(&[0; 4]).unwrap();
        leaf.ctl().set_app_status(Status::Active).unwrap();
        leaf.step().unwrap();

        let queue = leaf.queue();
        queue.push(ProfMessage::new(0, 9, Timespec::new(10, 0), 0.0));
        leaf.step().unwrap();

        // 8 J at 2^-14 J units
        sim.advance(0, 0x611, 8 << 14, 32);
        for cpu in 0..4 {
            sim.advance(cpu, 0x30A, 3000, 48);
            sim.advance(cpu, 0x30B, 1500, 48);
        }
        queue.push(ProfMessage::new(0, 9, Timespec::new(12, 0), 1.0));
        let samples = leaf.step().unwrap();

        assert_eq!(samples.len(), 1);
        assert_eq!(samples[0].region_id, 9);
        assert_eq!(samples[0].runtime, 2.0);
        assert_eq!(samples[0].energy, 8.0);
        assert_eq!(samples[0].frequency, 2.0 * 2.1e9);
    }

    #[test]
    fn test_equal_policy_applied_once() {
        let (sim, msr) = msr();
        let rapl = RaplPlatform::new(&msr).unwrap();
        let mut leaf = Builder::new().build(rapl, Box::new(CtlMessage::new()));

        let policy = PolicyMessage::new(0, PolicyMode::PerfBalanceDynamic, PolicyFlags::default(), 1, 100.0);
        assert!(leaf.apply_policy(&policy).unwrap());
        let writes = sim.write_count();

        let mut resent = policy;
        resent.num_sample = 8;
        assert!(!leaf.apply_policy(&resent).unwrap());
        assert_eq!(sim.write_count(), writes);
    }

    #[test]
    fn test_failed_policy_keeps_previous() {
        let (_sim, msr) = msr();
        let rapl = RaplPlatform::new(&msr).unwrap();
        let mut leaf = Builder::new().build(rapl, Box::new(CtlMessage::new()));

        let good = PolicyMessage::new(0, PolicyMode::PerfBalanceDynamic, PolicyFlags::default(), 1, 100.0);
        leaf.apply_policy(&good).unwrap();
        let hybrid = PolicyMessage::new(0, PolicyMode::FreqHybridDynamic, PolicyFlags::default(), 1, 100.0);
        assert!(leaf.apply_policy(&hybrid).is_err());
        assert_eq!(leaf.last_policy(), Some(&good));
    }

    #[test]
    fn test_finish_epoch_and_shutdown() {
        let (sim, msr) = msr();
        let original = sim.get(0, 0x610);
        let rapl = RaplPlatform::new(&msr).unwrap();
        let mut leaf = Builder::new().build(rapl, Box::new(CtlMessage::new()));
        let policy = PolicyMessage::new(0, PolicyMode::PerfBalanceDynamic, PolicyFlags::default(), 1, 90.0);

        assert!(matches!(leaf.finish_epoch(&policy), Err(Error::NotActive)));

        leaf.publish(&[0; 4]).unwrap();
        leaf.ctl().set_app_status(Status::Active).unwrap();
        assert!(leaf.finish_epoch(&policy).unwrap());
        assert_eq!(leaf.ctl().ctl_status(), Some(Status::Ready));
        assert_ne!(sim.get(0, 0x610), original);

        // A rank that never leaves its region
        leaf.queue().push(ProfMessage::new(2, 0x55, Timespec::new(1, 0), 0.0));
        leaf.step().unwrap();
        assert_eq!(leaf.open_regions(), 1);

        leaf.shutdown().unwrap();
        assert_eq!(leaf.open_regions(), 0);
        assert_eq!(leaf.ctl().ctl_status(), Some(Status::Shutdown));
        assert_eq!(sim.get(0, 0x610), original);
        assert!(matches!(leaf.step(), Err(Error::NotActive)));
    }

    #[test]
    fn test_samples_reported_every_num_sample_cycles() {
        let (_sim, msr) = msr();
        let rapl = RaplPlatform::new(&msr).unwrap();
        let mut leaf = Builder::new().build(rapl, Box::new(CtlMessage::new()));
        leaf.publish(&[0; 4]).unwrap();
        leaf.ctl().set_app_status(Status::Active).unwrap();

        let policy = PolicyMessage::new(0, PolicyMode::PerfBalanceDynamic, PolicyFlags::default(), 3, 100.0);
        leaf.apply_policy(&policy).unwrap();
        assert_eq!(leaf.report_every(), 3);

        let queue = leaf.queue();
        queue.push(ProfMessage::new(0, 5, Timespec::new(1, 0), 0.0));
        queue.push(ProfMessage::new(0, 5, Timespec::new(2, 0), 1.0));
        assert!(leaf.step().unwrap().is_empty());
        assert!(leaf.step().unwrap().is_empty());
        let samples = leaf.step().unwrap();
        assert_eq!(samples.len(), 1);
        assert_eq!(samples[0].region_id, 5);
        assert!(leaf.step().unwrap().is_empty());

        // Cadence follows num_sample even when the policy is otherwise equal
        let mut faster = policy;
        faster.num_sample = 1;
        assert!(!leaf.apply_policy(&faster).unwrap());
        assert_eq!(leaf.report_every(), 1);
    }

    #[test]
    fn test_poll_policy_keeps_last_while_locked() {
        let (sim, msr) = msr();
        let rapl = RaplPlatform::new(&msr).unwrap();
        let name = format!("/powertree-leaf-poll-{}", std::process::id());
        let mut leaf = Builder::new()
            .policy_name(name)
            .lock_timeout(Duration::from_millis(20))
            .build(rapl, Box::new(CtlMessage::new()));
        let launcher = leaf.config().create_policy().unwrap();
        let node = leaf.config().attach_policy().unwrap();
        assert_eq!(node.timeout(), Duration::from_millis(20));

        assert_eq!(leaf.poll_policy(&node).unwrap(), None);

        let good = PolicyMessage::new(0, PolicyMode::PerfBalanceDynamic, PolicyFlags::default(), 1, 100.0);
        launcher.write_policy(&good).unwrap();
        assert_eq!(leaf.poll_policy(&node).unwrap(), Some(good));
        let writes = sim.write_count();

        let held = Barrier::new(2);
        let release = Barrier::new(2);
        std::thread::scope(|s| {
            s.spawn(|| {
                let _guard = launcher.lock().unwrap();
                held.wait();
                release.wait();
            });
            held.wait();
            assert_eq!(leaf.poll_policy(&node).unwrap(), Some(good));
            release.wait();
        });
        assert_eq!(sim.write_count(), writes);
        assert_eq!(leaf.last_policy(), Some(&good));
    }
}
