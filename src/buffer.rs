use std::fmt;

use log::{debug, warn};
use parking_lot::{RwLock, RwLockWriteGuard};
use time::{Duration, OffsetDateTime};

use crate::crypto;
use crate::error::{Error, StoreError};
use crate::hash::{self, Digest};
use crate::memory::{self, Scratch};

/// One package, its bytes and everything governing its lifetime.
///
/// All mutable state sits behind a lock private to the buffer, downloads of
/// different buffers never contend with each other.
pub struct SecureBuffer {
    name: String,
    state: RwLock<State>,
}

pub(crate) struct State {
    bytes: Vec<u8>,
    checksum: Digest,
    encrypted: bool,
    downloads: u64,
    // 0 is unlimited
    download_limit: u64,
    expires_at: Option<OffsetDateTime>,
    pinned: bool,
    destroyed: bool,
}

/// Result of a successful checkout, the caller hands `bytes` out.
pub(crate) struct Checkout {
    pub bytes: Scratch,
    pub exhausted: bool,
}

impl SecureBuffer {
    /// Takes ownership of `bytes`, which must already be in their stored
    /// form (ciphertext if `encrypted`). The checksum is taken over them.
    pub fn new(name: impl Into<String>, bytes: Vec<u8>, encrypted: bool) -> Result<Self, Error> {
        Ok(SecureBuffer::with_pin(name.into(), bytes, encrypted, false))
    }

    /// Like [`SecureBuffer::new`], taking over the pin of a scratch buffer so
    /// the bytes are never unpinned on the way in.
    pub fn from_scratch(
        name: impl Into<String>,
        bytes: Scratch,
        encrypted: bool,
    ) -> Result<Self, Error> {
        let (bytes, pinned) = bytes.into_pinned();
        if pinned {
            memory::exclude_from_dumps(&bytes);
        }
        Ok(SecureBuffer::with_pin(name.into(), bytes, encrypted, pinned))
    }

    fn with_pin(name: String, bytes: Vec<u8>, encrypted: bool, pinned: bool) -> Self {
        SecureBuffer {
            name,
            state: RwLock::new(State {
                checksum: hash::digest_of(&bytes),
                bytes,
                encrypted,
                downloads: 0,
                download_limit: 0,
                expires_at: None,
                pinned,
                destroyed: false,
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn compute_checksum(&self) -> Result<Digest, Error> {
        let state = self.state.read();
        hash::digest(&mut &state.bytes[..])
    }

    /// Recomputes the checksum and compares it against the admission one.
    pub fn validate_checksum(&self) -> Result<bool, Error> {
        let state = self.state.read();
        state.validate_checksum()
    }

    /// Expires the buffer `expiration` from now, see [`crate::duration::parse`].
    /// Calling it again resets the deadline.
    pub fn set_expiration(&self, expiration: &str) -> Result<(), Error> {
        let duration = crate::duration::parse(expiration)?;
        self.expire_in(duration);
        Ok(())
    }

    pub fn expire_in(&self, duration: Duration) {
        let mut state = self.state.write();
        state.expires_at = Some(OffsetDateTime::now_utc() + duration);
    }

    pub fn expires_at(&self) -> Option<OffsetDateTime> {
        self.state.read().expires_at
    }

    pub fn is_expired(&self) -> bool {
        self.state.read().is_expired()
    }

    /// Parses a base 10 download cap, `"0"` disables the cap.
    pub fn set_download_limit(&self, limit: &str) -> Result<(), Error> {
        self.limit_downloads(parse_download_limit(limit)?);
        Ok(())
    }

    pub fn limit_downloads(&self, limit: u64) {
        self.state.write().download_limit = limit;
    }

    pub fn download_limit(&self) -> u64 {
        self.state.read().download_limit
    }

    pub fn downloads(&self) -> u64 {
        self.state.read().downloads
    }

    pub fn is_encrypted(&self) -> bool {
        self.state.read().encrypted
    }

    pub fn is_destroyed(&self) -> bool {
        self.state.read().destroyed
    }

    pub fn len(&self) -> usize {
        self.state.read().bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Pins the bytes against swap and keeps them out of core dumps.
    /// Best-effort, a refusal from the kernel is only logged.
    pub fn pin(&self) {
        let mut state = self.state.write();
        if state.destroyed || state.pinned {
            return;
        }

        state.pinned = memory::lock(&mut state.bytes);
        memory::exclude_from_dumps(&state.bytes);
    }

    pub fn is_pinned(&self) -> bool {
        self.state.read().pinned
    }

    /// Zeroes the bytes, then releases the pin. Destroying twice is a no-op.
    ///
    /// The bytes are gone even when unpinning fails, the error is still
    /// reported.
    pub fn destroy(&self) -> Result<(), Error> {
        self.state.write().destroy()
    }

    pub(crate) fn write(&self) -> RwLockWriteGuard<'_, State> {
        self.state.write()
    }
}

pub(crate) fn parse_download_limit(limit: &str) -> Result<u64, Error> {
    limit
        .trim()
        .parse()
        .map_err(|_| Error::parse("download limit", limit))
}

impl State {
    fn validate_checksum(&self) -> Result<bool, Error> {
        Ok(hash::digest(&mut &self.bytes[..])? == self.checksum)
    }

    fn is_expired(&self) -> bool {
        match self.expires_at {
            Some(deadline) => OffsetDateTime::now_utc() >= deadline,
            None => false,
        }
    }

    fn is_exhausted(&self) -> bool {
        self.download_limit > 0 && self.downloads >= self.download_limit
    }

    pub(crate) fn destroy(&mut self) -> Result<(), Error> {
        if self.destroyed {
            return Ok(());
        }
        self.destroyed = true;

        memory::wipe(&mut self.bytes);
        let unpinned = if self.pinned {
            self.pinned = false;
            memory::unlock(&mut self.bytes)
        } else {
            Ok(())
        };
        self.bytes = Vec::new();

        debug!("Buffer destroyed after {} downloads", self.downloads);
        Ok(unpinned?)
    }

    /// Performs one download under the write lock.
    ///
    /// Expired and exhausted buffers are destroyed on the spot. A checksum
    /// mismatch and a failed decryption yield the same error.
    pub(crate) fn checkout(&mut self, password: Option<&str>) -> Result<Checkout, Error> {
        if self.destroyed {
            return Err(StoreError::NotFound.into());
        }
        if self.is_expired() {
            self.destroy()?;
            return Err(StoreError::NotFound.into());
        }
        if self.is_exhausted() {
            self.destroy()?;
            return Err(StoreError::LimitReached.into());
        }

        if !self.validate_checksum()? {
            warn!("Checksum mismatch, refusing download");
            return Err(Error::IntegrityError);
        }

        let bytes = if self.encrypted {
            let password = password.ok_or(Error::IntegrityError)?;
            crypto::decrypt(&self.bytes, password).map_err(|_| Error::IntegrityError)?
        } else {
            let mut bytes = Scratch::with_capacity(self.bytes.len());
            bytes.extend_from_slice(&self.bytes);
            bytes
        };

        self.downloads += 1;
        Ok(Checkout {
            bytes,
            exhausted: self.is_exhausted(),
        })
    }
}

impl Drop for State {
    fn drop(&mut self) {
        if let Err(e) = self.destroy() {
            warn!("Unable to cleanly destroy buffer on drop: {}", e);
        }
    }
}

impl fmt::Debug for SecureBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.read();
        f.debug_struct("SecureBuffer")
            .field("name", &"****")
            .field("len", &state.bytes.len())
            .field("encrypted", &state.encrypted)
            .field("downloads", &state.downloads)
            .field("download_limit", &state.download_limit)
            .field("expires_at", &state.expires_at)
            .field("destroyed", &state.destroyed)
            .finish()
    }
}
