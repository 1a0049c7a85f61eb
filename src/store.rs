use std::fmt;
use std::ops::Deref;
use std::sync::Arc;

use log::{debug, error, info, warn};
use parking_lot::RwLock;

use crate::buffer::SecureBuffer;
use crate::crypto;
use crate::error::{Error, StoreError};
use crate::hash;
use crate::memory::Scratch;
use crate::name;
use crate::pack;

/// Registry of every live [`SecureBuffer`].
///
/// Membership has its own lock, separate from the per buffer ones. Inserts
/// and removals are exclusive, lookups share. Name lookups always walk the
/// whole registry and compare fixed width digests in constant time, so the
/// timing leaks neither how much of a guessed handle matched, its length, nor
/// where it sits.
pub struct SecureStore {
    buffers: RwLock<Vec<Arc<SecureBuffer>>>,
}

impl SecureStore {
    pub fn new() -> Result<Self, Error> {
        crypto::init()?;

        Ok(SecureStore {
            buffers: RwLock::new(Vec::new()),
        })
    }

    /// Registers `buffer` and pins it. A clashing name destroys `buffer`.
    pub fn add(&self, buffer: SecureBuffer) -> Result<Arc<SecureBuffer>, Error> {
        let mut buffers = self.buffers.write();

        if find(&buffers, buffer.name()).is_some() {
            if let Err(e) = buffer.destroy() {
                warn!("Unable to destroy rejected buffer: {}", e);
            }
            return Err(StoreError::DuplicateName.into());
        }

        buffer.pin();
        let buffer = Arc::new(buffer);
        buffers.push(buffer.clone());

        debug!("Added buffer, {} live", buffers.len());
        Ok(buffer)
    }

    pub fn get(&self, name: &str) -> Option<Arc<SecureBuffer>> {
        let buffers = self.buffers.read();
        find(&buffers, name).map(|idx| buffers[idx].clone())
    }

    pub fn exists(&self, name: &str) -> bool {
        let buffers = self.buffers.read();
        find(&buffers, name).is_some()
    }

    pub fn len(&self) -> usize {
        self.buffers.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.buffers.read().is_empty()
    }

    /// Draws handles until one is not in use.
    pub fn unique_name(&self) -> String {
        loop {
            let name = name::generate();
            if !self.exists(&name) {
                return name;
            }
        }
    }

    /// Wipes the buffer and drops it from the registry.
    ///
    /// The buffer leaves the registry even if unpinning it failed, its bytes
    /// are gone by then. That failure is still returned.
    pub fn destroy(&self, name: &str) -> Result<(), Error> {
        let buffer = {
            let mut buffers = self.buffers.write();
            let idx = find(&buffers, name).ok_or(StoreError::NotFound)?;
            buffers.swap_remove(idx)
        };

        buffer.destroy()
    }

    /// Removes this exact buffer, if it still is in the registry.
    fn destroy_buffer(&self, buffer: &Arc<SecureBuffer>) -> Result<(), Error> {
        {
            let mut buffers = self.buffers.write();
            let idx = buffers
                .iter()
                .position(|b| Arc::ptr_eq(b, buffer))
                .ok_or(StoreError::NotFound)?;
            buffers.swap_remove(idx);
        }

        buffer.destroy()
    }

    /// Destroys every buffer, for shutdown. Keeps going past failures and
    /// reports the first one.
    pub fn destroy_all(&self) -> Result<(), Error> {
        let drained: Vec<Arc<SecureBuffer>> = std::mem::take(&mut *self.buffers.write());
        let count = drained.len();

        let mut first = None;
        for buffer in drained {
            if let Err(e) = buffer.destroy() {
                error!("Unable to destroy buffer: {}", e);
                first.get_or_insert(e);
            }
        }

        info!("Destroyed {} buffers", count);
        first.map_or(Ok(()), Err)
    }

    /// Destroys every expired buffer, returns how many went.
    ///
    /// Failures are logged and skipped, one bad buffer never stops the rest
    /// from being reaped.
    pub fn reap_expired(&self) -> usize {
        let expired: Vec<Arc<SecureBuffer>> = self
            .buffers
            .read()
            .iter()
            .filter(|b| b.is_expired())
            .cloned()
            .collect();

        let mut reaped = 0;
        for buffer in expired {
            match self.destroy_buffer(&buffer) {
                Ok(()) => reaped += 1,
                // Raced with a download or an explicit destroy
                Err(Error::StoreError(StoreError::NotFound)) => (),
                Err(e) => error!("Unable to reap buffer: {}", e),
            }
        }

        if reaped > 0 {
            debug!("Reaped {} expired buffers", reaped);
        }
        reaped
    }

    /// Hands out one copy of the package, decrypted with `password` if it
    /// was uploaded encrypted.
    ///
    /// Unknown, expired and exhausted handles are refused, the last two are
    /// destroyed. The buffer is also destroyed once this download uses up
    /// its limit.
    pub fn download(&self, name: &str, password: Option<&str>) -> Result<Download, Error> {
        let buffer = self.get(name).ok_or(StoreError::NotFound)?;

        let outcome = buffer.write().checkout(password);
        let checkout = match outcome {
            Ok(checkout) => checkout,
            Err(e) => {
                if buffer.is_destroyed() {
                    self.forget(&buffer);
                }
                return Err(e);
            }
        };

        if checkout.exhausted {
            debug!("Download limit reached, destroying buffer");
            match self.destroy_buffer(&buffer) {
                Ok(()) | Err(Error::StoreError(StoreError::NotFound)) => (),
                Err(e) => warn!("Unable to destroy exhausted buffer: {}", e),
            }
        }

        Ok(Download::new(buffer.name(), checkout.bytes))
    }

    // Drops an already destroyed buffer from the registry
    fn forget(&self, buffer: &Arc<SecureBuffer>) {
        let mut buffers = self.buffers.write();
        if let Some(idx) = buffers.iter().position(|b| Arc::ptr_eq(b, buffer)) {
            buffers.swap_remove(idx);
        }
    }
}

// Visits every entry and never exits early
fn find(buffers: &[Arc<SecureBuffer>], name: &str) -> Option<usize> {
    let wanted = hash::digest_of(name.as_bytes());
    let mut found = None;

    for (idx, buffer) in buffers.iter().enumerate() {
        let equal = hash::digest_of(buffer.name().as_bytes()) == wanted;

        if equal && found.is_none() {
            found = Some(idx);
        }
    }
    found
}

/// Bytes of one download, pinned while alive and wiped on drop.
pub struct Download {
    name: String,
    bytes: Scratch,
}

impl Download {
    fn new(name: &str, bytes: Scratch) -> Self {
        Download {
            name: name.to_string(),
            bytes,
        }
    }

    /// Attachment name for the download response.
    pub fn file_name(&self) -> String {
        format!("{}.{}", self.name, pack::EXTENSION)
    }

    pub fn content_type(&self) -> &'static str {
        pack::CONTENT_TYPE
    }
}

impl fmt::Debug for Download {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Download")
            .field("name", &"****")
            .field("len", &self.bytes.len())
            .finish()
    }
}

impl Deref for Download {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        &self.bytes
    }
}

#[cfg(test)]
mod test_store {
    use super::*;
    use std::thread;
    use time::Duration;

    fn store() -> SecureStore {
        SecureStore::new().unwrap()
    }

    fn buffer(name: &str, data: &[u8]) -> SecureBuffer {
        SecureBuffer::new(name, data.to_vec(), false).unwrap()
    }

    #[test]
    fn add_exists_destroy() {
        let store = store();
        store.add(buffer("blueotter", b"data")).unwrap();

        assert!(store.exists("blueotter"));
        assert!(!store.exists("blueotte"));
        assert!(!store.exists("blueotterr"));
        assert!(!store.exists("BLUEOTTER"));
        assert!(!store.exists(""));

        store.destroy("blueotter").unwrap();
        assert!(!store.exists("blueotter"));
        assert!(store.is_empty());
    }

    #[test]
    fn get_is_shared() {
        let store = store();
        let added = store.add(buffer("redfrog", b"data")).unwrap();
        let got = store.get("redfrog").unwrap();

        assert!(Arc::ptr_eq(&added, &got));
        assert!(store.get("greenfrog").is_none());
    }

    #[test]
    fn duplicate_name() {
        let store = store();
        store.add(buffer("dup", b"one")).unwrap();

        assert!(matches!(
            store.add(buffer("dup", b"two")),
            Err(Error::StoreError(StoreError::DuplicateName))
        ));
        assert_eq!(store.len(), 1);
        assert_eq!(&store.download("dup", None).unwrap()[..], b"one");
    }

    #[test]
    fn destroy_unknown() {
        let store = store();
        let err = store.destroy("nothing").unwrap_err();
        assert!(err.is_not_found());
    }

    #[test]
    fn destroyed_buffer_is_wiped() {
        let store = store();
        let held = store.add(buffer("held", &[0x42; 256])).unwrap();

        store.destroy("held").unwrap();
        assert!(held.is_destroyed());
        assert!(held.is_empty());
    }

    #[test]
    fn destroy_all() {
        let store = store();
        let mut held = Vec::new();
        for i in 0..10 {
            held.push(store.add(buffer(&format!("buf{}", i), b"data")).unwrap());
        }

        store.destroy_all().unwrap();
        assert!(store.is_empty());
        assert!(held.iter().all(|b| b.is_destroyed()));
    }

    #[test]
    fn unique_names() {
        let store = store();
        for _ in 0..50 {
            let name = store.unique_name();
            store.add(buffer(&name, b"x")).unwrap();
        }
        assert_eq!(store.len(), 50);
    }

    #[test]
    fn download_limit_two() {
        let store = store();
        let buf = buffer("limited", b"payload");
        buf.set_download_limit("2").unwrap();
        store.add(buf).unwrap();

        assert_eq!(&store.download("limited", None).unwrap()[..], b"payload");
        assert!(store.exists("limited"));

        assert_eq!(&store.download("limited", None).unwrap()[..], b"payload");
        assert!(!store.exists("limited"));

        assert!(store.download("limited", None).unwrap_err().is_not_found());
    }

    #[test]
    fn download_limit_zero_is_unlimited() {
        let store = store();
        let buf = buffer("unlimited", b"payload");
        buf.set_download_limit("0").unwrap();
        store.add(buf).unwrap();

        for _ in 0..5 {
            store.download("unlimited", None).unwrap();
        }
        assert!(store.exists("unlimited"));
    }

    #[test]
    fn download_expired_is_gone() {
        let store = store();
        let buf = buffer("stale", b"payload");
        buf.expire_in(Duration::seconds(-1));
        let held = store.add(buf).unwrap();

        assert!(store.download("stale", None).unwrap_err().is_not_found());
        assert!(!store.exists("stale"));
        assert!(held.is_destroyed());
    }

    #[test]
    fn download_encrypted() {
        let store = store();
        let sealed = crypto::encrypt(b"payload", "pw").unwrap();
        store
            .add(SecureBuffer::new("sealed", sealed, true).unwrap())
            .unwrap();

        assert!(matches!(
            store.download("sealed", Some("wrong")),
            Err(Error::IntegrityError)
        ));
        assert!(matches!(store.download("sealed", None), Err(Error::IntegrityError)));

        let download = store.download("sealed", Some("pw")).unwrap();
        assert_eq!(&download[..], b"payload");
        assert_eq!(download.file_name(), "sealed.tar.zst");
        assert_eq!(download.content_type(), pack::CONTENT_TYPE);

        // Failed attempts don't count
        assert_eq!(store.get("sealed").unwrap().downloads(), 1);
    }

    #[test]
    fn reap_expired() {
        let store = store();
        let stale = buffer("stale", b"x");
        stale.expire_in(Duration::ZERO);
        store.add(stale).unwrap();

        let fresh = buffer("fresh", b"x");
        fresh.set_expiration("1h").unwrap();
        store.add(fresh).unwrap();
        store.add(buffer("forever", b"x")).unwrap();

        assert_eq!(store.reap_expired(), 1);
        assert!(!store.exists("stale"));
        assert!(store.exists("fresh"));
        assert!(store.exists("forever"));
        assert_eq!(store.reap_expired(), 0);
    }

    #[test]
    fn concurrent_adds() {
        let store = Arc::new(store());
        let n = 32;

        let handles: Vec<_> = (0..n)
            .map(|i| {
                let store = store.clone();
                thread::spawn(move || {
                    store.add(buffer(&format!("writer{}", i), b"x")).unwrap();
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(store.len(), n);
        for i in 0..n {
            assert!(store.exists(&format!("writer{}", i)));
        }
    }

    #[test]
    fn concurrent_downloads_respect_limit() {
        let store = Arc::new(store());
        let buf = buffer("contended", b"payload");
        buf.limit_downloads(3);
        store.add(buf).unwrap();

        let handles: Vec<_> = (0..16)
            .map(|_| {
                let store = store.clone();
                thread::spawn(move || store.download("contended", None).is_ok())
            })
            .collect();
        let ok = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(|ok| *ok)
            .count();

        assert_eq!(ok, 3);
        assert!(!store.exists("contended"));
    }

    #[test]
    fn concurrent_add_destroy_reap() {
        let store = Arc::new(store());

        let handles: Vec<_> = (0..8)
            .map(|t| {
                let store = store.clone();
                thread::spawn(move || {
                    for i in 0..50 {
                        let name = format!("churn{}x{}", t, i);
                        let buf = buffer(&name, b"x");
                        if i % 2 == 0 {
                            buf.expire_in(Duration::ZERO);
                        }
                        store.add(buf).unwrap();
                        if i % 3 == 0 {
                            let _ = store.destroy(&name);
                        }
                        store.reap_expired();
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        store.reap_expired();

        // Odd and not a multiple of 3
        let expected = (0..50).filter(|i| i % 2 == 1 && i % 3 != 0).count() * 8;
        assert_eq!(store.len(), expected);
    }
}
