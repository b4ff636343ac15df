//! Register access layer
//!
//! Opens one model-specific register file per logical CPU and resolves
//! `(domain, index, register)` requests against the immutable offset table
//! of the detected hardware generation.
//!
//! Writes are restricted to each register's write mask and performed as
//! read-modify-write so bits outside the mask are preserved. The value a
//! register held before its first write is remembered so that
//! [`MsrAccess::reset_msrs`] can put it back.

use crate::error::{Error, Result};
use crate::generation::Generation;
use crate::topology::Topology;
use parking_lot::{Mutex, RwLock, RwLockReadGuard};
use powertree_common::Domain;
use std::collections::{BTreeMap, HashMap};
use std::fs::{File, OpenOptions};
use std::io::{self, Write};
use std::os::unix::fs::FileExt;
use std::path::PathBuf;
use tracing::{debug, info, warn};

/// One entry of a generation's offset table
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MsrDescriptor {
    pub name: &'static str,
    pub offset: u64,
    /// Bits a write may alter; 0 marks a read-only register
    pub write_mask: u64,
}

/// Register reference: by table name or by raw offset
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MsrRef<'a> {
    Name(&'a str),
    Offset(u64),
}

impl<'a> From<&'a str> for MsrRef<'a> {
    fn from(name: &'a str) -> Self {
        MsrRef::Name(name)
    }
}

impl From<u64> for MsrRef<'_> {
    fn from(offset: u64) -> Self {
        MsrRef::Offset(offset)
    }
}

impl std::fmt::Display for MsrRef<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MsrRef::Name(name) => f.write_str(name),
            MsrRef::Offset(offset) => write!(f, "{:#x}", offset),
        }
    }
}

/// Positioned 64-bit access to one CPU's register file
pub trait RegisterFile: Send + Sync {
    fn read_at(&self, offset: u64) -> io::Result<u64>;
    fn write_at(&self, offset: u64, value: u64) -> io::Result<()>;
}

/// Source of per-CPU register files
pub trait RegisterBackend {
    fn open(&self, cpu: usize) -> io::Result<Box<dyn RegisterFile>>;

    /// Human-readable location of `cpu`'s register file, for logs
    fn describe(&self, cpu: usize) -> String;
}

/// Linux `msr` / `msr-safe` character devices
#[derive(Debug, Clone)]
pub struct DevMsr {
    template: String,
}

impl DevMsr {
    /// `/dev/cpu/<cpu>/msr`, requires CAP_SYS_RAWIO
    pub fn new() -> Self {
        Self::with_template("/dev/cpu/{cpu}/msr")
    }

    /// `/dev/cpu/<cpu>/msr_safe`, access limited to an installed whitelist
    pub fn msr_safe() -> Self {
        Self::with_template("/dev/cpu/{cpu}/msr_safe")
    }

    /// Path template where `{cpu}` is replaced with the CPU number
    pub fn with_template(template: impl Into<String>) -> Self {
        Self {
            template: template.into(),
        }
    }

    fn path(&self, cpu: usize) -> PathBuf {
        PathBuf::from(self.template.replace("{cpu}", &cpu.to_string()))
    }
}

impl Default for DevMsr {
    fn default() -> Self {
        Self::new()
    }
}

impl RegisterBackend for DevMsr {
    fn open(&self, cpu: usize) -> io::Result<Box<dyn RegisterFile>> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(self.path(cpu))?;
        Ok(Box::new(MsrFile { file }))
    }

    fn describe(&self, cpu: usize) -> String {
        self.path(cpu).display().to_string()
    }
}

struct MsrFile {
    file: File,
}

impl RegisterFile for MsrFile {
    fn read_at(&self, offset: u64) -> io::Result<u64> {
        let mut buf = [0u8; 8];
        self.file.read_exact_at(&mut buf, offset)?;
        Ok(u64::from_ne_bytes(buf))
    }

    fn write_at(&self, offset: u64, value: u64) -> io::Result<()> {
        self.file.write_all_at(&value.to_ne_bytes(), offset)
    }
}

type Handles = Vec<Option<Box<dyn RegisterFile>>>;

/// Per-node register access for one hardware generation
pub struct MsrAccess {
    topology: Topology,
    generation: Generation,
    handles: RwLock<Handles>,
    by_name: HashMap<&'static str, MsrDescriptor>,
    by_offset: HashMap<u64, MsrDescriptor>,
    /// Value before the first write, keyed by (cpu, offset)
    saved: Mutex<BTreeMap<(usize, u64), u64>>,
}

impl MsrAccess {
    /// Select the generation for `platform_id`, open every CPU's register
    /// file, and program the generation's fixed counters.
    pub fn initialize(
        topology: Topology,
        backend: &dyn RegisterBackend,
        platform_id: i32,
    ) -> Result<Self> {
        let generation =
            Generation::from_platform_id(platform_id).ok_or(Error::UnsupportedPlatform(platform_id))?;
        let access = Self::open(topology, backend, generation)?;
        generation.initialize_msrs(&access)?;
        info!(
            "register access ready: {} ({:#x}), {} cpus",
            generation.platform_name(),
            platform_id,
            access.topology.num_logical_cpu()
        );
        Ok(access)
    }

    fn open(topology: Topology, backend: &dyn RegisterBackend, generation: Generation) -> Result<Self> {
        let mut handles: Handles = Vec::with_capacity(topology.num_logical_cpu());
        for slot in 0..topology.num_logical_cpu() {
            let cpu = topology
                .cpu_id(slot)
                .ok_or_else(|| Error::Configuration(format!("no cpu id for slot {}", slot)))?;
            let handle = backend.open(cpu).map_err(|e| {
                Error::Configuration(format!(
                    "cannot open register file {}: {}",
                    backend.describe(cpu),
                    e
                ))
            })?;
            debug!("opened {}", backend.describe(cpu));
            handles.push(Some(handle));
        }

        let mut by_name = HashMap::new();
        let mut by_offset = HashMap::new();
        for desc in generation.msr_table() {
            if by_name.insert(desc.name, desc).is_some() {
                return Err(Error::Configuration(format!("duplicate register {}", desc.name)));
            }
            by_offset.insert(desc.offset, desc);
        }

        Ok(Self {
            topology,
            generation,
            handles: RwLock::new(handles),
            by_name,
            by_offset,
            saved: Mutex::new(BTreeMap::new()),
        })
    }

    pub fn generation(&self) -> Generation {
        self.generation
    }

    pub fn platform_name(&self) -> &'static str {
        self.generation.platform_name()
    }

    pub fn topology(&self) -> &Topology {
        &self.topology
    }

    /// Look up a register's offset by name
    pub fn msr_offset(&self, name: &str) -> Result<u64> {
        Ok(self.descriptor(name)?.offset)
    }

    pub fn descriptor(&self, name: &str) -> Result<&MsrDescriptor> {
        self.by_name
            .get(name)
            .ok_or_else(|| Error::UnknownRegister(name.to_string()))
    }

    fn resolve_offset(&self, reg: MsrRef<'_>) -> Result<u64> {
        match reg {
            MsrRef::Name(name) => self.msr_offset(name),
            MsrRef::Offset(offset) => Ok(offset),
        }
    }

    fn io_error(domain: Domain, index: usize, reg: MsrRef<'_>, source: io::Error) -> Error {
        Error::RegisterIo {
            domain,
            index,
            register: reg.to_string(),
            source,
        }
    }

    /// Read a register of the CPU serving `(domain, index)`
    pub fn read_msr<'r>(&self, domain: Domain, index: usize, reg: impl Into<MsrRef<'r>>) -> Result<u64> {
        let reg = reg.into();
        let cpu = self.topology.cpu_for(domain, index)?;
        let offset = self.resolve_offset(reg)?;
        self.batch()
            .read(cpu, offset)
            .map_err(|e| Self::io_error(domain, index, reg, e))
    }

    /// Write the masked bits of a register of the CPU serving `(domain, index)`.
    ///
    /// `value` must not set bits outside the register's write mask. Bits
    /// outside the mask keep their current hardware value.
    pub fn write_msr<'r>(
        &self,
        domain: Domain,
        index: usize,
        reg: impl Into<MsrRef<'r>>,
        value: u64,
    ) -> Result<()> {
        let reg = reg.into();
        let cpu = self.topology.cpu_for(domain, index)?;
        let desc = match reg {
            MsrRef::Name(name) => *self.descriptor(name)?,
            MsrRef::Offset(offset) => *self
                .by_offset
                .get(&offset)
                .ok_or_else(|| Error::UnknownRegister(format!("{:#x}", offset)))?,
        };

        if desc.write_mask == 0 || value & !desc.write_mask != 0 {
            return Err(Error::WriteMask {
                register: desc.name.to_string(),
                value,
                mask: desc.write_mask,
            });
        }

        let batch = self.batch();
        let current = batch
            .read(cpu, desc.offset)
            .map_err(|e| Self::io_error(domain, index, reg, e))?;
        self.saved.lock().entry((cpu, desc.offset)).or_insert(current);

        let next = (current & !desc.write_mask) | value;
        batch
            .write(cpu, desc.offset, next)
            .map_err(|e| Self::io_error(domain, index, reg, e))?;

        debug!(
            "wrote {} on cpu {} ({} {}): {:#x} -> {:#x}",
            desc.name, cpu, domain, index, current, next
        );
        Ok(())
    }

    /// Hold the handle table for a run of raw reads
    pub(crate) fn batch(&self) -> Batch<'_> {
        Batch {
            handles: self.handles.read(),
        }
    }

    /// Emit the offset table for a privileged register-access front end.
    ///
    /// One line per register, sorted by offset:
    /// `0x<offset:08x> 0x<write_mask:016x> # "<name>"`
    pub fn whitelist(&self, out: &mut dyn Write) -> io::Result<()> {
        self.generation.whitelist(out)
    }

    /// Restore every register written through this layer to its original value.
    ///
    /// Best effort and idempotent: closed handles and failed writes are
    /// logged and skipped, the first failure is returned once every register
    /// has been attempted.
    pub fn reset_msrs(&self) -> Result<()> {
        let saved: Vec<((usize, u64), u64)> =
            self.saved.lock().iter().map(|(k, v)| (*k, *v)).collect();
        let batch = self.batch();
        let mut first_error = None;

        for ((cpu, offset), value) in saved {
            let name = self.by_offset.get(&offset).map(|d| d.name).unwrap_or("unknown");
            if let Err(e) = batch.write(cpu, offset, value) {
                warn!("failed to restore {} on cpu {}: {}", name, cpu, e);
                if first_error.is_none() {
                    first_error = Some(Error::RegisterIo {
                        domain: Domain::Cpu,
                        index: cpu,
                        register: name.to_string(),
                        source: e,
                    });
                }
            } else {
                debug!("restored {} on cpu {} to {:#x}", name, cpu, value);
            }
        }

        match first_error {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    /// Close every register file. Later I/O fails with `RegisterIo`.
    pub fn close(&self) {
        let mut handles = self.handles.write();
        for handle in handles.iter_mut() {
            handle.take();
        }
        info!("closed register files");
    }
}

/// Read access to the handle table without re-locking per register
pub(crate) struct Batch<'a> {
    handles: RwLockReadGuard<'a, Handles>,
}

impl Batch<'_> {
    #[inline]
    fn handle(&self, cpu: usize) -> io::Result<&dyn RegisterFile> {
        match self.handles.get(cpu) {
            Some(Some(handle)) => Ok(&**handle),
            Some(None) => Err(io::Error::new(
                io::ErrorKind::NotConnected,
                format!("register file for cpu {} is closed", cpu),
            )),
            None => Err(io::Error::new(
                io::ErrorKind::NotFound,
                format!("no register file for cpu {}", cpu),
            )),
        }
    }

    #[inline]
    pub(crate) fn read(&self, cpu: usize, offset: u64) -> io::Result<u64> {
        self.handle(cpu)?.read_at(offset)
    }

    #[inline]
    pub(crate) fn write(&self, cpu: usize, offset: u64, value: u64) -> io::Result<()> {
        self.handle(cpu)?.write_at(offset, value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::generation::platform_id;
    use crate::sim::SimBackend;

    fn access() -> (SimBackend, MsrAccess) {
        let topo = Topology::new(2, 4, 8, 8).unwrap();
        let sim = SimBackend::new(8);
        let msr = MsrAccess::initialize(topo, &sim, platform_id::HASWELL_E).unwrap();
        (sim, msr)
    }

    #[test]
    fn test_access_is_shareable() {
        static_assertions::assert_impl_all!(MsrAccess: Send, Sync);
    }

    #[test]
    fn test_unsupported_platform() {
        let topo = Topology::new(1, 1, 1, 1).unwrap();
        let sim = SimBackend::new(1);
        match MsrAccess::initialize(topo, &sim, 0x6A7) {
            Err(Error::UnsupportedPlatform(id)) => assert_eq!(id, 0x6A7),
            other => panic!("expected UnsupportedPlatform, got {:?}", other.err()),
        }
    }

    #[test]
    fn test_open_failure_is_configuration_error() {
        let topo = Topology::new(1, 1, 2, 2).unwrap();
        let sim = SimBackend::new(2);
        sim.fail_open(1);
        assert!(matches!(
            MsrAccess::initialize(topo, &sim, platform_id::HASWELL_E),
            Err(Error::Configuration(_))
        ));
    }

    #[test]
    fn test_handles_follow_kernel_cpu_ids() {
        let root = std::env::temp_dir().join(format!("powertree-msr-sparse-{}", std::process::id()));
        for (cpu, pkg) in [(0, 0), (1, 1), (4, 0), (5, 1)] {
            let dir = root.join(format!("cpu{}", cpu)).join("topology");
            std::fs::create_dir_all(&dir).unwrap();
            std::fs::write(dir.join("physical_package_id"), format!("{}\n", pkg)).unwrap();
            std::fs::write(dir.join("core_id"), format!("{}\n", cpu / 4)).unwrap();
        }
        std::fs::create_dir_all(root.join("cpu2")).unwrap();
        std::fs::create_dir_all(root.join("cpu3")).unwrap();
        let topo = Topology::from_sysfs(&root).unwrap();
        std::fs::remove_dir_all(&root).unwrap();

        let sim = SimBackend::new(6);
        sim.fail_open(2);
        sim.fail_open(3);
        let msr = MsrAccess::initialize(topo, &sim, platform_id::HASWELL_E).unwrap();

        sim.set(4, 0x611, 0xABCD);
        sim.set(5, 0x611, 0x1234);
        assert_eq!(msr.read_msr(Domain::Cpu, 2, "PKG_ENERGY_STATUS").unwrap(), 0xABCD);
        assert_eq!(msr.read_msr(Domain::Cpu, 3, 0x611u64).unwrap(), 0x1234);
        assert_eq!(msr.read_msr(Domain::Package, 1, 0x611u64).unwrap(), sim.get(1, 0x611));
    }

    #[test]
    fn test_name_and_offset_reads_agree() {
        let (sim, msr) = access();
        sim.set(4, 0x611, 0x1234_5678);
        let offset = msr.msr_offset("PKG_ENERGY_STATUS").unwrap();
        assert_eq!(offset, 0x611);
        let by_name = msr.read_msr(Domain::Package, 1, "PKG_ENERGY_STATUS").unwrap();
        let by_offset = msr.read_msr(Domain::Package, 1, offset).unwrap();
        assert_eq!(by_name, 0x1234_5678);
        assert_eq!(by_name, by_offset);
    }

    #[test]
    fn test_unknown_register() {
        let (_sim, msr) = access();
        assert!(matches!(msr.msr_offset("NOT_A_REGISTER"), Err(Error::UnknownRegister(_))));
        assert!(matches!(
            msr.read_msr(Domain::Cpu, 0, "NOT_A_REGISTER"),
            Err(Error::UnknownRegister(_))
        ));
        assert!(matches!(
            msr.write_msr(Domain::Cpu, 0, 0xDEAD_u64, 1),
            Err(Error::UnknownRegister(_))
        ));
    }

    #[test]
    fn test_write_preserves_bits_outside_mask() {
        let (sim, msr) = access();
        // Lock bit (63) lies outside the mask
        sim.set(0, 0x610, 1 << 63);
        msr.write_msr(Domain::Package, 0, "PKG_POWER_LIMIT", 0x0001_83C0)
            .unwrap();
        let value = msr.read_msr(Domain::Package, 0, "PKG_POWER_LIMIT").unwrap();
        assert_eq!(value, (1 << 63) | 0x0001_83C0);
    }

    #[test]
    fn test_write_outside_mask_rejected() {
        let (sim, msr) = access();
        sim.set(0, 0x610, 0);
        let before = sim.write_count();
        match msr.write_msr(Domain::Package, 0, "PKG_POWER_LIMIT", 1 << 63) {
            Err(Error::WriteMask { mask, .. }) => assert_eq!(mask, 0x00FF_FFFF_00FF_FFFF),
            other => panic!("expected WriteMask, got {:?}", other),
        }
        assert!(matches!(
            msr.write_msr(Domain::Package, 0, "PKG_ENERGY_STATUS", 0),
            Err(Error::WriteMask { .. })
        ));
        assert_eq!(sim.write_count(), before);
        assert_eq!(sim.get(0, 0x610), 0);
    }

    #[test]
    fn test_invalid_domain_index() {
        let (_sim, msr) = access();
        assert!(matches!(
            msr.read_msr(Domain::Package, 2, "PKG_ENERGY_STATUS"),
            Err(Error::InvalidDomain { count: 2, .. })
        ));
        assert!(matches!(
            msr.write_msr(Domain::Cpu, 8, "IA32_PERF_CTL", 0x1500),
            Err(Error::InvalidDomain { count: 8, .. })
        ));
    }

    #[test]
    fn test_io_failure_carries_context() {
        let (sim, msr) = access();
        sim.fail_io(true);
        match msr.read_msr(Domain::Tile, 2, "IA32_PMC0") {
            Err(Error::RegisterIo {
                domain,
                index,
                register,
                ..
            }) => {
                assert_eq!(domain, Domain::Tile);
                assert_eq!(index, 2);
                assert_eq!(register, "IA32_PMC0");
            }
            other => panic!("expected RegisterIo, got {:?}", other),
        }
    }

    #[test]
    fn test_reset_restores_and_is_idempotent() {
        let (sim, msr) = access();
        sim.set(0, 0x199, 0x1800);
        msr.write_msr(Domain::Cpu, 0, "IA32_PERF_CTL", 0x0C00).unwrap();
        msr.write_msr(Domain::Cpu, 0, "IA32_PERF_CTL", 0x0E00).unwrap();
        assert_eq!(sim.get(0, 0x199), 0x0E00);

        msr.reset_msrs().unwrap();
        assert_eq!(sim.get(0, 0x199), 0x1800);
        msr.reset_msrs().unwrap();
        assert_eq!(sim.get(0, 0x199), 0x1800);
    }

    #[test]
    fn test_reset_after_close_is_best_effort() {
        let (_sim, msr) = access();
        msr.write_msr(Domain::Cpu, 1, "IA32_PERF_CTL", 0x0C00).unwrap();
        msr.close();
        assert!(matches!(msr.reset_msrs(), Err(Error::RegisterIo { .. })));
        assert!(matches!(
            msr.read_msr(Domain::Cpu, 0, "IA32_PERF_STATUS"),
            Err(Error::RegisterIo { .. })
        ));
    }

    #[test]
    fn test_whitelist_format() {
        let (_sim, msr) = access();
        let mut out = Vec::new();
        msr.whitelist(&mut out).unwrap();
        let text = String::from_utf8(out).unwrap();
        let mut lines = text.lines();
        assert!(lines.next().unwrap().starts_with('#'));
        assert!(text.contains("0x00000610 0x00ffffff00ffffff # \"PKG_POWER_LIMIT\""));
        assert!(text.contains("0x00000611 0x0000000000000000 # \"PKG_ENERGY_STATUS\""));

        let offsets: Vec<u64> = lines
            .map(|l| u64::from_str_radix(&l[2..10], 16).unwrap())
            .collect();
        assert_eq!(offsets.len(), msr.generation().msr_table().len());
        assert!(offsets.windows(2).all(|w| w[0] < w[1]));
    }

    #[test]
    fn test_initialize_programs_counters() {
        let (sim, _msr) = access();
        for cpu in 0..8 {
            assert_eq!(sim.get(cpu, 0x38D), 0x333);
            assert_eq!(sim.get(cpu, 0x38F), 0x7_0000_0001);
        }
    }
}
