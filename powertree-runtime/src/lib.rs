//! # powertree runtime
//!
//! Hardware-facing control plane of a hierarchical power-management runtime.
//!
//! A leaf controller on each node reads energy and performance counters from
//! model-specific registers, enforces power policies by writing them back,
//! and exchanges policy and telemetry with the instrumented application
//! through shared memory. Parents in the tree fold child samples upward and
//! split policies downward.
//!
//! ## Key Components
//!
//! - **Register access** ([`msr`]): per-CPU register files, offset tables per
//!   hardware [`generation`], masked writes, whitelist, reset
//! - **Platform** ([`platform`], [`rapl`]): batch sampling and policy
//!   enforcement at package granularity
//! - **Shared memory** ([`shmem`]): control block handshake and the
//!   mutex-guarded policy block
//! - **Leaf controller** ([`leaf`]): the per-node control loop
//! - **Tree folding** ([`tree`]): sample reduction and policy splitting
//!
//! ## Usage
//!
//! ```rust,no_run
//! use powertree_runtime::{current_platform_id, ControllerConfig, DevMsr, LeafBuilder, MsrAccess, RaplPlatform, Topology};
//!
//! # fn main() -> powertree_runtime::Result<()> {
//! let msr = MsrAccess::initialize(Topology::detect()?, &DevMsr::new(), current_platform_id()?)?;
//! let rapl = RaplPlatform::new(&msr)?;
//! let config = ControllerConfig::default();
//! let ctl = config.create_ctl()?;
//! let policy = config.attach_policy()?;
//! let mut leaf = LeafBuilder::new().build(rapl, ctl);
//!
//! leaf.publish(&[0, 0, 1, 1])?;
//! loop {
//!     leaf.poll_policy(&policy)?;
//!     match leaf.step() {
//!         Ok(_samples) => { /* send samples up the tree */ }
//!         Err(powertree_runtime::Error::NotActive) if leaf.ctl().is_shutdown() => break,
//!         Err(powertree_runtime::Error::NotActive) => {}
//!         Err(e) if e.is_transient() => {}
//!         Err(e) => return Err(e),
//!     }
//!     std::thread::sleep(leaf.config().sample_interval);
//! }
//! leaf.shutdown()
//! # }
//! ```

pub mod error;
pub mod generation;
pub mod leaf;
pub mod msr;
pub mod platform;
pub mod prof;
pub mod rapl;
pub mod shmem;
pub mod sim;
pub mod topology;
pub mod tree;

pub use error::{Error, Result};
pub use generation::{current_platform_id, Generation};
pub use leaf::{Builder as LeafBuilder, ControllerConfig, LeafController};
pub use msr::{DevMsr, MsrAccess, MsrDescriptor, MsrRef, RegisterBackend, RegisterFile};
pub use platform::{BufferIndex, Platform, PowerBounds, Signal, SignalDescriptor, SignalSample};
pub use rapl::RaplPlatform;
pub use shmem::{CtlShmem, PolicyShmem, PolicyShmemHandle};
pub use sim::SimBackend;
pub use topology::Topology;
pub use tree::{fold_samples, split_policy, PolicyRelay};

/// Re-export common types
pub use powertree_common::{
    is_policy_equal, CtlMessage, Domain, PolicyFlags, PolicyMessage, PolicyMode, ProfMessage,
    SampleMessage, Status, Timespec, INVALID_SAMPLE, UNKNOWN_POLICY,
};
