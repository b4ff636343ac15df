// SPDX-License-Identifier: GPL-2.0-only
// Copyright (C) 2024 Ankit Kumar Pandey <ankitkpandey1@gmail.com>

//! powertree-msr - operator tool for the powertree register access layer
//!
//! Prints the register whitelist for `msr-safe`, reports platform facts,
//! samples package power, and enforces a policy until interrupted. Every
//! register changed by this process is restored on exit.

use anyhow::{bail, Context, Result};
use clap::{ArgGroup, Parser, Subcommand};
use powertree_common::{PolicyFlags, PolicyMessage, PolicyMode, GLOBAL_POLICY_REGION};
use powertree_runtime::generation::platform_id;
use powertree_runtime::prof::wrapping_delta;
use powertree_runtime::{
    current_platform_id, DevMsr, Generation, MsrAccess, Platform, RaplPlatform, Signal, SignalSample,
    SimBackend, Topology,
};
use std::io::Write;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

/// powertree register access tool
///
/// Talks to `/dev/cpu/*/msr` (or `msr_safe`) on supported server
/// generations, or to an in-memory register bank with `--simulate`.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Use the in-memory register bank instead of the msr devices
    #[arg(long, global = true)]
    simulate: bool,

    /// Open /dev/cpu/*/msr_safe instead of /dev/cpu/*/msr
    #[arg(long, global = true)]
    msr_safe: bool,

    /// Override the detected platform id, e.g. 0x63F
    #[arg(long, global = true, value_parser = parse_platform_id)]
    platform_id: Option<i32>,

    /// Packages of the simulated node
    #[arg(long, global = true, default_value_t = 2)]
    sim_packages: usize,

    /// Tiles of the simulated node
    #[arg(long, global = true, default_value_t = 8)]
    sim_tiles: usize,

    /// Logical CPUs of the simulated node
    #[arg(long, global = true, default_value_t = 16)]
    sim_cpus: usize,

    /// Enable debug output (overridden by RUST_LOG)
    #[arg(short, long, global = true)]
    debug: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Print the register whitelist in msr-safe format
    Whitelist,

    /// Show generation, topology, and power bounds
    Info,

    /// Print package power every interval
    Sample {
        /// Sampling interval in milliseconds
        #[arg(short, long, default_value_t = 1000)]
        interval_ms: u64,

        /// Number of intervals to print (0 runs until interrupted)
        #[arg(short, long, default_value_t = 0)]
        count: u64,
    },

    /// Enforce a node policy until interrupted, then restore registers
    #[command(group(
        ArgGroup::new("target")
            .required(true)
            .args(["budget", "frequency_mhz", "tdp_percent"])
    ))]
    Enforce {
        /// Node power budget in watts, split evenly across packages
        #[arg(long)]
        budget: Option<f64>,

        /// Uniform CPU frequency in MHz
        #[arg(long)]
        frequency_mhz: Option<u32>,

        /// Package limit as a percentage of TDP
        #[arg(long)]
        tdp_percent: Option<u32>,
    },
}

fn parse_platform_id(s: &str) -> std::result::Result<i32, String> {
    let parsed = match s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        Some(hex) => i32::from_str_radix(hex, 16),
        None => s.parse(),
    };
    parsed.map_err(|e| format!("invalid platform id {:?}: {}", s, e))
}

fn init_tracing(debug: bool) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(if debug { "debug" } else { "info" }));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn open_node(args: &Args) -> Result<MsrAccess> {
    if args.simulate {
        let topology = Topology::new(args.sim_packages, args.sim_tiles, args.sim_cpus, args.sim_cpus)
            .context("Invalid simulated topology")?;
        let sim = SimBackend::new(args.sim_cpus);
        let id = target_generation(args)?.platform_id();
        info!("simulating {} cpus, platform id {:#x}", args.sim_cpus, id);
        return MsrAccess::initialize(topology, &sim, id).context("Failed to initialize simulated registers");
    }

    let topology = Topology::detect().context("Failed to detect topology")?;
    let id = match args.platform_id {
        Some(id) => id,
        None => current_platform_id().context("Failed to detect platform id")?,
    };
    let backend = if args.msr_safe {
        DevMsr::msr_safe()
    } else {
        DevMsr::new()
    };
    MsrAccess::initialize(topology, &backend, id).context("Failed to initialize register access")
}

fn install_interrupt() -> Result<Arc<AtomicBool>> {
    let running = Arc::new(AtomicBool::new(true));
    let r = running.clone();
    ctrlc::set_handler(move || {
        info!("Received interrupt, shutting down...");
        r.store(false, Ordering::SeqCst);
    })
    .context("Error setting Ctrl-C handler")?;
    Ok(running)
}

fn main() -> Result<()> {
    let args = Args::parse();
    init_tracing(args.debug);

    if let Command::Whitelist = args.command {
        return whitelist(&args);
    }

    let msr = open_node(&args)?;
    let result = match &args.command {
        Command::Whitelist => unreachable!("handled without register access"),
        Command::Info => print_info(&msr),
        Command::Sample { interval_ms, count } => {
            sample(&msr, Duration::from_millis(*interval_ms), *count)
        }
        Command::Enforce {
            budget,
            frequency_mhz,
            tdp_percent,
        } => enforce(&msr, *budget, *frequency_mhz, *tdp_percent),
    };

    if let Err(e) = msr.reset_msrs() {
        warn!("Failed to restore registers: {}", e);
    }
    msr.close();
    result
}

fn target_generation(args: &Args) -> Result<Generation> {
    let id = match args.platform_id {
        Some(id) => id,
        None if args.simulate => platform_id::HASWELL_E,
        None => current_platform_id().context("Failed to detect platform id")?,
    };
    match Generation::from_platform_id(id) {
        Some(generation) => Ok(generation),
        None => bail!("Unsupported platform id {:#x}", id),
    }
}

fn whitelist(args: &Args) -> Result<()> {
    let generation = target_generation(args)?;
    let stdout = std::io::stdout();
    let mut out = stdout.lock();
    generation.whitelist(&mut out).context("Failed to write whitelist")?;
    out.flush()?;
    Ok(())
}

fn print_info(msr: &MsrAccess) -> Result<()> {
    let rapl = RaplPlatform::new(msr).context("Failed to set up RAPL platform")?;
    let topo = msr.topology();
    let bounds = rapl.bound();

    println!("platform:        {} ({:#x})", msr.platform_name(), msr.generation().platform_id());
    println!(
        "topology:        {} packages, {} tiles, {} cores, {} cpus",
        topo.num_package(),
        topo.num_tile(),
        topo.num_hw_cpu(),
        topo.num_logical_cpu()
    );
    println!("control domain:  {}", rapl.control_domain());
    println!("package tdp:     {:.1} W", rapl.tdp());
    println!("package bounds:  {:.1} .. {:.1} W", bounds.lower, bounds.upper);
    println!("nominal freq:    {:.0} MHz", rapl.nominal_frequency() / 1e6);
    println!("signals:         {}", rapl.capacity());
    Ok(())
}

fn sample(msr: &MsrAccess, interval: Duration, count: u64) -> Result<()> {
    let rapl = RaplPlatform::new(msr).context("Failed to set up RAPL platform")?;
    let running = install_interrupt()?;
    let index = rapl.buffer_index().clone();
    let descriptors = rapl.signal_descriptors();
    let num_package = msr.topology().num_package();

    let mut previous = vec![SignalSample::EMPTY; rapl.capacity()];
    let mut current = vec![SignalSample::EMPTY; rapl.capacity()];
    rapl.sample(&mut previous).context("Initial sample failed")?;

    let mut printed = 0;
    while running.load(Ordering::SeqCst) && (count == 0 || printed < count) {
        std::thread::sleep(interval);
        match rapl.sample(&mut current) {
            Ok(_) => {}
            Err(e) if e.is_transient() => {
                warn!("Sample failed, skipping interval: {}", e);
                continue;
            }
            Err(e) => return Err(e).context("Sampling failed"),
        }

        let elapsed = current[0].timestamp.seconds_since(&previous[0].timestamp);
        if elapsed <= 0.0 {
            bail!("Monotonic clock did not advance");
        }
        let watts = |base: usize, pkg: usize| {
            let slot = base + pkg;
            let signal: Signal = descriptors[slot].signal;
            let delta = wrapping_delta(previous[slot].raw, current[slot].raw, signal.counter_width());
            delta as f64 * descriptors[slot].scale / elapsed
        };

        let mut line = String::new();
        for pkg in 0..num_package {
            line.push_str(&format!("pkg{} {:7.2} W", pkg, watts(index.package_energy, pkg)));
            if let Some(pp0) = index.pp0_energy {
                line.push_str(&format!("  core {:7.2} W", watts(pp0, pkg)));
            }
            line.push_str(&format!("  dram {:6.2} W   ", watts(index.dram_energy, pkg)));
        }
        println!("{}", line.trim_end());

        std::mem::swap(&mut previous, &mut current);
        printed += 1;
    }
    Ok(())
}

fn enforce(
    msr: &MsrAccess,
    budget: Option<f64>,
    frequency_mhz: Option<u32>,
    tdp_percent: Option<u32>,
) -> Result<()> {
    let rapl = RaplPlatform::new(msr).context("Failed to set up RAPL platform")?;
    let mut flags = PolicyFlags::default();

    let policy = if let Some(mhz) = frequency_mhz {
        flags
            .set_frequency_mhz(mhz)
            .map_err(|e| anyhow::anyhow!("{}", e))?;
        PolicyMessage::new(GLOBAL_POLICY_REGION, PolicyMode::FreqUniformStatic, flags, 1, -1.0)
    } else if let Some(pct) = tdp_percent {
        flags
            .set_tdp_percent(pct)
            .map_err(|e| anyhow::anyhow!("{}", e))?;
        PolicyMessage::new(GLOBAL_POLICY_REGION, PolicyMode::TdpBalanceStatic, flags, 1, -1.0)
    } else if let Some(watts) = budget {
        PolicyMessage::new(GLOBAL_POLICY_REGION, PolicyMode::TdpBalanceStatic, flags, 1, watts)
    } else {
        bail!("No policy target given");
    };

    let running = install_interrupt()?;
    rapl.enforce_policy(GLOBAL_POLICY_REGION, &policy)
        .context("Failed to enforce policy")?;
    info!("policy enforced, press Ctrl-C to restore registers");

    while running.load(Ordering::SeqCst) {
        std::thread::sleep(Duration::from_millis(200));
    }

    rapl.reset().context("Failed to restore registers")?;
    info!("registers restored");
    Ok(())
}
