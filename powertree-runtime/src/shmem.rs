//! Node-local shared memory
//!
//! Two POSIX shared-memory objects connect the leaf controller to the
//! instrumented application:
//!
//! - the control block ([`CtlShmem`]) carrying the status handshake and the
//!   cpu-to-rank table, synchronized by atomics;
//! - the policy block ([`PolicyShmemHandle`]) carrying the static job-wide
//!   policy, guarded by a process-shared robust mutex.
//!
//! Objects are initialized under a private staging name and then linked to
//! their public name, so a peer never attaches to uninitialized contents.
//! The creator unlinks the name when dropped. Neither side ever destroys the
//! mapping or the mutex under its peer.

use crate::error::{Error, Result};
use powertree_common::{CtlMessage, PolicyMessage, UNKNOWN_POLICY};
use std::cell::UnsafeCell;
use std::ffi::CString;
use std::fs::{self, File};
use std::io;
use std::marker::PhantomData;
use std::mem::size_of;
use std::ops::Deref;
use std::os::unix::io::FromRawFd;
use std::path::Path;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

/// Where glibc places POSIX shared-memory objects
const SHM_DIR: &str = "/dev/shm";

static STAGING_SEQ: AtomicU32 = AtomicU32::new(0);
use tracing::{debug, info, warn};

/// A `T` living in a named shared-memory object
pub struct SharedRegion<T> {
    ptr: NonNull<T>,
    name: CString,
    owner: bool,
    // Keep the mapping alive
    _mmap: memmap2::MmapMut,
}

// Access to T goes through its own synchronization (atomics or the mutex)
unsafe impl<T: Sync> Send for SharedRegion<T> {}
unsafe impl<T: Sync> Sync for SharedRegion<T> {}

impl<T> SharedRegion<T> {
    fn shm_name(name: &str) -> Result<CString> {
        if !name.starts_with('/') || name.len() < 2 || name[1..].contains('/') {
            return Err(Error::Configuration(format!(
                "shared memory name {:?} must be a single '/'-prefixed component",
                name
            )));
        }
        CString::new(name)
            .map_err(|_| Error::Configuration(format!("shared memory name {:?} contains NUL", name)))
    }

    /// Create `name` with contents already written by `init`.
    ///
    /// `init` runs on a mapping no peer can reach. The public name appears
    /// only after it returns, and creation fails if the name exists.
    fn create_with(name: &str, init: impl FnOnce(*mut T) -> Result<()>) -> Result<Self> {
        let c_name = Self::shm_name(name)?;
        let staging = format!(
            "{}.staging-{}-{}",
            name,
            std::process::id(),
            STAGING_SEQ.fetch_add(1, Ordering::Relaxed)
        );
        // Dropping on error unlinks the staging object
        let mut region = Self::open(&staging, true)?;
        init(region.as_ptr())?;

        let dir = Path::new(SHM_DIR);
        fs::hard_link(dir.join(&staging[1..]), dir.join(&name[1..])).map_err(Error::Shmem)?;

        // SAFETY: the staging name is a valid C string
        if unsafe { libc::shm_unlink(region.name.as_ptr()) } != 0 {
            warn!(
                "failed to unlink staging object {}: {}",
                staging,
                io::Error::last_os_error()
            );
        }
        region.name = c_name;
        debug!("published shared memory {}", name);
        Ok(region)
    }

    fn open(name: &str, create: bool) -> Result<Self> {
        let c_name = Self::shm_name(name)?;
        let flags = if create {
            libc::O_CREAT | libc::O_EXCL | libc::O_RDWR
        } else {
            libc::O_RDWR
        };

        // SAFETY: c_name is a valid NUL-terminated string
        let fd = unsafe { libc::shm_open(c_name.as_ptr(), flags, 0o600) };
        if fd < 0 {
            return Err(Error::Shmem(io::Error::last_os_error()));
        }
        // SAFETY: fd was just returned by shm_open and is owned by nobody else
        let file = unsafe { File::from_raw_fd(fd) };

        let size = size_of::<T>();
        if create {
            if let Err(e) = file.set_len(size as u64) {
                // SAFETY: c_name is valid; the object was created above
                unsafe { libc::shm_unlink(c_name.as_ptr()) };
                return Err(Error::Shmem(e));
            }
        } else {
            let actual = file.metadata()?.len();
            if actual < size as u64 {
                return Err(Error::Protocol(format!(
                    "shared memory {} holds {} bytes, expected {}",
                    name, actual, size
                )));
            }
        }

        // SAFETY: the object is at least `size` bytes; concurrent access from
        // the peer goes through T's atomics or lock
        let mmap = match unsafe { memmap2::MmapOptions::new().len(size).map_mut(&file) } {
            Ok(mmap) => mmap,
            Err(e) => {
                if create {
                    // SAFETY: as above
                    unsafe { libc::shm_unlink(c_name.as_ptr()) };
                }
                return Err(Error::Shmem(e));
            }
        };

        let ptr = NonNull::new(mmap.as_ptr() as *mut T)
            .ok_or_else(|| Error::Shmem(io::Error::other("mmap returned null")))?;

        debug!(
            "{} shared memory {} ({} bytes)",
            if create { "created" } else { "attached" },
            name,
            size
        );

        Ok(Self {
            ptr,
            name: c_name,
            owner: create,
            _mmap: mmap,
        })
    }

    /// Object name, including the leading '/'
    pub fn name(&self) -> &str {
        self.name.to_str().unwrap_or("<invalid>")
    }

    pub fn is_owner(&self) -> bool {
        self.owner
    }

    fn as_ptr(&self) -> *mut T {
        self.ptr.as_ptr()
    }
}

impl<T> Deref for SharedRegion<T> {
    type Target = T;

    fn deref(&self) -> &T {
        // SAFETY: the mapping is live and was initialized by the creator
        unsafe { self.ptr.as_ref() }
    }
}

impl<T> Drop for SharedRegion<T> {
    fn drop(&mut self) {
        if self.owner {
            // SAFETY: name is a valid C string
            let rc = unsafe { libc::shm_unlink(self.name.as_ptr()) };
            if rc != 0 {
                warn!(
                    "failed to unlink {:?}: {}",
                    self.name,
                    io::Error::last_os_error()
                );
            }
        }
    }
}

/// Control block mapping shared with the application
pub struct CtlShmem {
    region: SharedRegion<CtlMessage>,
}

impl CtlShmem {
    /// Create the control block in the `UNDEFINED` state with every CPU
    /// unaffinitized
    pub fn create(name: &str) -> Result<Self> {
        let region = SharedRegion::<CtlMessage>::create_with(name, |ctl| {
            // SAFETY: staging mapping of the right size, unreachable by peers
            unsafe { ctl.write(CtlMessage::new()) };
            Ok(())
        })?;
        info!("control block {} ready", name);
        Ok(Self { region })
    }

    /// Attach to a control block created by the peer
    pub fn attach(name: &str) -> Result<Self> {
        Ok(Self {
            region: SharedRegion::open(name, false)?,
        })
    }

    pub fn name(&self) -> &str {
        self.region.name()
    }
}

impl Deref for CtlShmem {
    type Target = CtlMessage;

    fn deref(&self) -> &CtlMessage {
        &self.region
    }
}

/// Policy block layout shared across processes
#[repr(C)]
pub struct PolicyShmem {
    is_init: UnsafeCell<i32>,
    lock: UnsafeCell<libc::pthread_mutex_t>,
    policy: UnsafeCell<PolicyMessage>,
}

// Fields are only touched while holding the process-shared mutex
unsafe impl Sync for PolicyShmem {}

/// Handle on a policy block
pub struct PolicyShmemHandle {
    region: SharedRegion<PolicyShmem>,
    timeout: Duration,
}

impl PolicyShmemHandle {
    /// Create the policy block with an initialized robust mutex and no policy
    pub fn create(name: &str, timeout: Duration) -> Result<Self> {
        let region = SharedRegion::<PolicyShmem>::create_with(name, |shmem| {
            // SAFETY: staging mapping unreachable by peers; attr lives on this
            // stack frame and is destroyed before return
            unsafe {
                let mut attr: libc::pthread_mutexattr_t = std::mem::zeroed();
                check(libc::pthread_mutexattr_init(&mut attr))?;
                let rc = (|| {
                    check(libc::pthread_mutexattr_setpshared(
                        &mut attr,
                        libc::PTHREAD_PROCESS_SHARED,
                    ))?;
                    check(libc::pthread_mutexattr_setrobust(
                        &mut attr,
                        libc::PTHREAD_MUTEX_ROBUST,
                    ))?;
                    check(libc::pthread_mutex_init(
                        UnsafeCell::raw_get(std::ptr::addr_of!((*shmem).lock)),
                        &attr,
                    ))
                })();
                libc::pthread_mutexattr_destroy(&mut attr);
                rc?;

                *UnsafeCell::raw_get(std::ptr::addr_of!((*shmem).is_init)) = 0;
                *UnsafeCell::raw_get(std::ptr::addr_of!((*shmem).policy)) = UNKNOWN_POLICY;
            }
            Ok(())
        })?;

        info!("policy block {} ready", name);
        Ok(Self { region, timeout })
    }

    /// Attach to a policy block created by the peer
    pub fn attach(name: &str, timeout: Duration) -> Result<Self> {
        Ok(Self {
            region: SharedRegion::open(name, false)?,
            timeout,
        })
    }

    pub fn name(&self) -> &str {
        self.region.name()
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub(crate) fn lock(&self) -> Result<PolicyGuard<'_>> {
        let mutex = self.region.lock.get();
        let deadline = deadline_after(self.timeout);

        // SAFETY: mutex was initialized by the creator and stays mapped
        let rc = unsafe { libc::pthread_mutex_timedlock(mutex, &deadline) };
        match rc {
            0 => {}
            libc::ETIMEDOUT => return Err(Error::LockTimeout(self.timeout)),
            libc::EOWNERDEAD => {
                warn!("{}: previous lock holder died, recovering", self.name());
                // SAFETY: we own the mutex in the inconsistent state
                check(unsafe { libc::pthread_mutex_consistent(mutex) })?;
            }
            rc => return Err(Error::Shmem(io::Error::from_raw_os_error(rc))),
        }
        Ok(PolicyGuard {
            shmem: &self.region,
            _not_send: PhantomData,
        })
    }

    /// Publish a policy for every reader
    pub fn write_policy(&self, policy: &PolicyMessage) -> Result<()> {
        let guard = self.lock()?;
        // SAFETY: guarded by the mutex
        unsafe {
            *guard.shmem.policy.get() = *policy;
            *guard.shmem.is_init.get() = 1;
        }
        debug!("{}: policy for region {:#x} published", self.name(), policy.region_id);
        Ok(())
    }

    /// Copy of the current policy, `None` until one has been written
    pub fn read_policy(&self) -> Result<Option<PolicyMessage>> {
        let guard = self.lock()?;
        // SAFETY: guarded by the mutex
        unsafe {
            if *guard.shmem.is_init.get() == 0 {
                return Ok(None);
            }
            Ok(Some(*guard.shmem.policy.get()))
        }
    }

    /// Take the lock and never release it, as a crashed holder would
    #[cfg(test)]
    fn abandon_lock(&self) -> Result<()> {
        std::mem::forget(self.lock()?);
        Ok(())
    }
}

pub(crate) struct PolicyGuard<'a> {
    shmem: &'a PolicyShmem,
    // pthread mutexes must be unlocked by the locking thread
    _not_send: PhantomData<*const ()>,
}

impl Drop for PolicyGuard<'_> {
    fn drop(&mut self) {
        // SAFETY: this guard holds the lock
        unsafe { libc::pthread_mutex_unlock(self.shmem.lock.get()) };
    }
}

fn check(rc: libc::c_int) -> Result<()> {
    if rc == 0 {
        Ok(())
    } else {
        Err(Error::Shmem(io::Error::from_raw_os_error(rc)))
    }
}

/// Absolute `CLOCK_REALTIME` deadline, as `pthread_mutex_timedlock` expects
fn deadline_after(timeout: Duration) -> libc::timespec {
    let mut now = libc::timespec {
        tv_sec: 0,
        tv_nsec: 0,
    };
    // SAFETY: valid out-pointer
    unsafe { libc::clock_gettime(libc::CLOCK_REALTIME, &mut now) };

    let mut nsec = now.tv_nsec as i64 + timeout.subsec_nanos() as i64;
    let mut sec = now.tv_sec as i64 + timeout.as_secs() as i64;
    if nsec >= 1_000_000_000 {
        nsec -= 1_000_000_000;
        sec += 1;
    }
    libc::timespec {
        tv_sec: sec as libc::time_t,
        tv_nsec: nsec as _,
    }
}
