//! Memory hygiene for the sensitive byte regions.
//!
//! Pinning (mlock) and the dump exclusion are best-effort, the kernel may
//! refuse either of them (`RLIMIT_MEMLOCK` for eg). A refused pin is logged
//! and never returned. Wiping always happens.

use std::fmt;
use std::io::Write;
use std::ops::{Deref, DerefMut};

use log::{debug, warn};
use sodiumoxide::utils;

/// Pins the allocation behind `buf`, spare capacity included, so its pages
/// are never written to swap.
pub fn lock(buf: &mut Vec<u8>) -> bool {
    if buf.capacity() == 0 {
        return true;
    }

    if !mlock(buf.as_ptr(), buf.capacity()) {
        warn!("Unable to mlock {} bytes, continuing unpinned", buf.capacity());
        return false;
    }
    true
}

/// Releases a pin taken by [`lock`].
pub fn unlock(buf: &mut Vec<u8>) -> std::io::Result<()> {
    if buf.capacity() == 0 {
        return Ok(());
    }

    if !munlock(buf.as_ptr(), buf.capacity()) {
        return Err(std::io::Error::last_os_error());
    }
    Ok(())
}

/// Zeroes `bytes` in a way the optimizer is not allowed to elide.
pub fn wipe(bytes: &mut [u8]) {
    utils::memzero(bytes);
}

/// Asks the kernel to leave the pages backing `bytes` out of core dumps.
#[cfg(target_os = "linux")]
pub fn exclude_from_dumps(bytes: &[u8]) {
    if bytes.is_empty() {
        return;
    }

    // madvise wants a page aligned start, widen the range to cover the pages
    let page = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
    let page = if page > 0 { page as usize } else { 4096 };

    let start = bytes.as_ptr() as usize;
    let aligned = start & !(page - 1);
    let len = bytes.len() + (start - aligned);

    let ret = unsafe { libc::madvise(aligned as *mut libc::c_void, len, libc::MADV_DONTDUMP) };
    if ret != 0 {
        warn!(
            "madvise(MADV_DONTDUMP) failed: {}",
            std::io::Error::last_os_error()
        );
    }
}

#[cfg(not(target_os = "linux"))]
pub fn exclude_from_dumps(_bytes: &[u8]) {}

/// Sets the core dump size limit to zero for the whole process.
#[cfg(unix)]
pub fn disable_core_dumps() -> std::io::Result<()> {
    let limit = libc::rlimit {
        rlim_cur: 0,
        rlim_max: 0,
    };

    if unsafe { libc::setrlimit(libc::RLIMIT_CORE, &limit) } != 0 {
        return Err(std::io::Error::last_os_error());
    }
    debug!("Core dumps disabled");
    Ok(())
}

#[cfg(not(unix))]
pub fn disable_core_dumps() -> std::io::Result<()> {
    Ok(())
}

/// Growable staging buffer for plaintext in transit.
///
/// The allocation is pinned while it holds data. Growing moves the data into
/// a fresh pinned allocation and wipes the old one, so no stale copies are
/// left behind in freed memory. Dropping wipes.
pub struct Scratch {
    buf: Vec<u8>,
    locked: bool,
}

impl Scratch {
    pub fn with_capacity(capacity: usize) -> Self {
        let mut buf = Vec::with_capacity(capacity);
        let locked = lock(&mut buf);
        Scratch { buf, locked }
    }

    /// Fixed size, zero filled, used as a pinned chunk buffer.
    pub fn zeroed(len: usize) -> Self {
        let mut scratch = Scratch::with_capacity(len);
        scratch.buf.resize(len, 0);
        scratch
    }

    pub fn extend_from_slice(&mut self, data: &[u8]) {
        let needed = self.buf.len() + data.len();

        if needed > self.buf.capacity() {
            let capacity = needed.max(self.buf.capacity() * 2).max(64);

            let mut grown = Vec::with_capacity(capacity);
            let grown_locked = lock(&mut grown);
            grown.extend_from_slice(&self.buf);

            let mut old = std::mem::replace(&mut self.buf, grown);
            release(&mut old, self.locked);
            self.locked = grown_locked;
        }

        self.buf.extend_from_slice(data);
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    /// Hands the bytes over still pinned, along with whether the pin took.
    /// The caller takes over wiping and unlocking.
    pub fn into_pinned(mut self) -> (Vec<u8>, bool) {
        let locked = std::mem::replace(&mut self.locked, false);
        (std::mem::take(&mut self.buf), locked)
    }
}

impl Deref for Scratch {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        &self.buf
    }
}

impl DerefMut for Scratch {
    fn deref_mut(&mut self) -> &mut [u8] {
        &mut self.buf
    }
}

impl Write for Scratch {
    fn write(&mut self, data: &[u8]) -> std::io::Result<usize> {
        self.extend_from_slice(data);
        Ok(data.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

impl fmt::Debug for Scratch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Scratch")
            .field("len", &self.buf.len())
            .field("locked", &self.locked)
            .finish()
    }
}

impl Drop for Scratch {
    fn drop(&mut self) {
        release(&mut self.buf, self.locked);
    }
}

#[cfg(unix)]
fn mlock(ptr: *const u8, len: usize) -> bool {
    unsafe { libc::mlock(ptr as *const libc::c_void, len) == 0 }
}

#[cfg(unix)]
fn munlock(ptr: *const u8, len: usize) -> bool {
    unsafe { libc::munlock(ptr as *const libc::c_void, len) == 0 }
}

#[cfg(not(unix))]
fn mlock(_ptr: *const u8, _len: usize) -> bool {
    false
}

#[cfg(not(unix))]
fn munlock(_ptr: *const u8, _len: usize) -> bool {
    true
}

fn release(buf: &mut Vec<u8>, locked: bool) {
    wipe(buf);
    if locked {
        if let Err(e) = unlock(buf) {
            warn!("Unable to munlock {} bytes of scratch: {}", buf.capacity(), e);
        }
    }
    buf.clear();
}
