//! Sample latency benchmark
//!
//! Measures how long one `sample()` batch takes for a node of the given
//! shape, while application threads flood the profile queue, to check that
//! the control loop fits comfortably inside its sampling interval.

use clap::Parser;
use powertree_common::{config, CtlMessage, ProfMessage, Status, Timespec};
use powertree_runtime::generation::platform_id;
use powertree_runtime::{DevMsr, LeafBuilder, MsrAccess, RaplPlatform, SimBackend, Topology};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

/// Sampling hot-path latency benchmark
#[derive(Parser, Debug)]
#[command(author, version, about)]
struct Args {
    /// Control cycles to measure
    #[arg(short, long, default_value_t = 10_000)]
    cycles: u64,

    /// Packages of the simulated node
    #[arg(long, default_value_t = 2)]
    packages: usize,

    /// Tiles of the simulated node
    #[arg(long, default_value_t = 36)]
    tiles: usize,

    /// Logical CPUs of the simulated node
    #[arg(long, default_value_t = 72)]
    cpus: usize,

    /// Application threads pushing profile messages
    #[arg(short = 'a', long, default_value_t = 4)]
    app_threads: usize,

    /// Read the real msr devices of this node instead of simulating
    #[arg(long)]
    hardware: bool,
}

struct LatencyHistogram {
    buckets: [u64; 32],
}

impl LatencyHistogram {
    fn new() -> Self {
        Self { buckets: [0; 32] }
    }

    fn record(&mut self, latency_us: u64) {
        // Bucket index: log2(latency_us + 1), clamped to 31
        let bucket = (64 - (latency_us + 1).leading_zeros()).min(31) as usize;
        self.buckets[bucket] += 1;
    }

    fn percentile(&self, p: f64) -> u64 {
        let total: u64 = self.buckets.iter().sum();
        let target = (total as f64 * p / 100.0) as u64;
        let mut count = 0u64;
        for (i, bucket) in self.buckets.iter().enumerate() {
            count += bucket;
            if count >= target {
                return 1u64 << i;
            }
        }
        1 << 31
    }
}

fn main() {
    let args = Args::parse();

    tracing_subscriber::fmt().with_env_filter("info").init();

    tracing::info!("Sample latency benchmark");
    tracing::info!("  Cycles: {}", args.cycles);
    tracing::info!("  Node: {} packages, {} tiles, {} cpus", args.packages, args.tiles, args.cpus);
    tracing::info!("  Application threads: {}", args.app_threads);

    let msr = if args.hardware {
        let topology = Topology::detect().expect("topology detection failed");
        let id = powertree_runtime::current_platform_id().expect("platform id detection failed");
        MsrAccess::initialize(topology, &DevMsr::new(), id).expect("register access failed")
    } else {
        let topology = Topology::new(args.packages, args.tiles, args.cpus, args.cpus)
            .expect("invalid node shape");
        let sim = SimBackend::new(args.cpus);
        MsrAccess::initialize(topology, &sim, platform_id::BROADWELL_E).expect("simulated registers failed")
    };

    let rapl = RaplPlatform::new(&msr).expect("RAPL platform setup failed");
    let mut leaf = LeafBuilder::new().build(rapl, Box::new(CtlMessage::new()));
    leaf.publish(&vec![0; args.cpus.min(config::MAX_NUM_CPU)])
        .expect("publish failed");
    leaf.ctl().set_app_status(Status::Active).expect("handshake failed");

    let stop = Arc::new(AtomicBool::new(false));
    let pushed = Arc::new(AtomicU64::new(0));
    let queue = leaf.queue();
    let mut app_handles = Vec::new();
    for rank in 0..args.app_threads {
        let stop_clone = stop.clone();
        let pushed_clone = pushed.clone();
        let queue = queue.clone();
        let handle = thread::Builder::new()
            .name(format!("app-{}", rank))
            .spawn(move || {
                let mut region = 0u64;
                while !stop_clone.load(Ordering::Relaxed) {
                    let now = Timespec::from_nanos(region);
                    let progress = (region % 2) as f64;
                    if queue.push(ProfMessage::new(rank as i32, region / 2, now, progress)) {
                        pushed_clone.fetch_add(1, Ordering::Relaxed);
                    }
                    region += 1;
                    thread::sleep(Duration::from_micros(50));
                }
            })
            .unwrap();
        app_handles.push(handle);
    }

    let mut histogram = LatencyHistogram::new();
    let mut completed = 0usize;
    let started = Instant::now();
    for _ in 0..args.cycles {
        let start = Instant::now();
        match leaf.step() {
            Ok(samples) => completed += samples.len(),
            Err(e) => tracing::warn!("step failed: {}", e),
        }
        histogram.record(start.elapsed().as_micros() as u64);
    }
    let elapsed = started.elapsed();

    stop.store(true, Ordering::Release);
    for handle in app_handles {
        handle.join().unwrap();
    }
    if let Err(e) = leaf.shutdown() {
        tracing::warn!("shutdown failed: {}", e);
    }

    let interval_us = config::DEFAULT_SAMPLE_INTERVAL_NS / 1000;
    let p99 = histogram.percentile(99.0);

    tracing::info!("\n=== Results ===");
    tracing::info!("Cycles/second: {:.0}", args.cycles as f64 / elapsed.as_secs_f64());
    tracing::info!("Profile messages pushed: {}", pushed.load(Ordering::Relaxed));
    tracing::info!("Profile messages dropped: {}", queue.dropped());
    tracing::info!("Region samples produced: {}", completed);
    tracing::info!("");
    tracing::info!("Step latency distribution:");
    tracing::info!("  p50:  {} µs", histogram.percentile(50.0));
    tracing::info!("  p95:  {} µs", histogram.percentile(95.0));
    tracing::info!("  p99:  {} µs", p99);
    tracing::info!("  p99.9: {} µs", histogram.percentile(99.9));

    if p99 > interval_us / 2 {
        tracing::warn!("p99 step latency exceeds half the {} µs sampling interval", interval_us);
    }
}
