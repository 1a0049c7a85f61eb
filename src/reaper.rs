use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam::channel::{bounded, select, tick, Sender};
use log::{debug, error};

use crate::store::SecureStore;

pub const DEFAULT_INTERVAL: Duration = Duration::from_secs(1);

/// Background thread evicting expired buffers every `interval`.
pub struct Reaper {
    shutdown: Option<Sender<()>>,
    handle: Option<JoinHandle<()>>,
}

impl Reaper {
    pub fn spawn(store: Arc<SecureStore>, interval: Duration) -> std::io::Result<Reaper> {
        let (shutdown, stop) = bounded::<()>(1);

        let handle = thread::Builder::new()
            .name("reaper".to_string())
            .spawn(move || {
                let ticker = tick(interval);
                debug!("Reaper running every {:?}", interval);

                loop {
                    select! {
                        recv(ticker) -> _ => {
                            store.reap_expired();
                        },
                        // Either an explicit shutdown or the handle was dropped
                        recv(stop) -> _ => break,
                    }
                }

                debug!("Reaper stopped");
            })?;

        Ok(Reaper {
            shutdown: Some(shutdown),
            handle: Some(handle),
        })
    }

    /// Stops the thread and waits for the scan in progress, if any.
    pub fn shutdown(mut self) {
        self.stop();
    }

    fn stop(&mut self) {
        if let Some(shutdown) = self.shutdown.take() {
            let _ = shutdown.send(());
        }
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                error!("Reaper thread panicked");
            }
        }
    }
}

impl Drop for Reaper {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod test_reaper {
    use super::*;
    use crate::buffer::SecureBuffer;
    use std::time::Instant;

    #[test]
    fn reaps_within_an_interval() {
        let store = Arc::new(SecureStore::new().unwrap());
        let buf = SecureBuffer::new("shortlived", b"payload".to_vec(), false).unwrap();
        buf.set_expiration("1s").unwrap();
        store.add(buf).unwrap();

        let interval = Duration::from_millis(100);
        let reaper = Reaper::spawn(store.clone(), interval).unwrap();

        let buf = store.get("shortlived").unwrap();
        assert!(!buf.is_expired());
        drop(buf);

        let start = Instant::now();
        while store.exists("shortlived") {
            assert!(start.elapsed() < Duration::from_secs(5), "never reaped");
            thread::sleep(Duration::from_millis(10));
        }

        reaper.shutdown();
    }

    #[test]
    fn leaves_live_buffers() {
        let store = Arc::new(SecureStore::new().unwrap());
        store
            .add(SecureBuffer::new("forever", b"x".to_vec(), false).unwrap())
            .unwrap();

        let reaper = Reaper::spawn(store.clone(), Duration::from_millis(10)).unwrap();
        thread::sleep(Duration::from_millis(100));
        drop(reaper);

        assert!(store.exists("forever"));
    }

    #[test]
    fn shutdown_is_prompt() {
        let store = Arc::new(SecureStore::new().unwrap());
        let reaper = Reaper::spawn(store, Duration::from_secs(3600)).unwrap();

        let start = Instant::now();
        reaper.shutdown();
        assert!(start.elapsed() < Duration::from_secs(5));
    }
}
