// src/progress.rs

//! Polling reader for the task progress file.
//!
//! The task writes a single integer in `0..=100` to a well-known file; a
//! background thread polls it and notifies listeners when the value
//! changes. Writes are not synchronised with reads, so anything that does
//! not parse is ignored.

use std::fmt;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use tracing::{debug, warn};
use uuid::Uuid;

pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(500);

pub trait ProgressListener: Send + Sync {
    fn on_progress(&self, value: u8);
}

impl<F> ProgressListener for F
where
    F: Fn(u8) + Send + Sync,
{
    fn on_progress(&self, value: u8) {
        self(value)
    }
}

type Listeners = Arc<Mutex<Vec<Arc<dyn ProgressListener>>>>;

struct Polling {
    path: PathBuf,
    stop_tx: mpsc::Sender<()>,
    handle: JoinHandle<()>,
}

impl Polling {
    fn shutdown(self) {
        // A closed channel means the poller is already gone.
        if self.stop_tx.send(()).is_err() {
            debug!(path = %self.path.display(), "progress reader already stopped");
        }
        // A listener stopping its own reader must not join itself.
        if self.handle.thread().id() == thread::current().id() {
            debug!(path = %self.path.display(), "progress reader stopped from a listener");
            return;
        }
        if self.handle.join().is_err() {
            warn!(path = %self.path.display(), "progress reader thread panicked");
        }
        debug!(path = %self.path.display(), "progress reader stopped");
    }
}

/// Every method takes `&self`; listeners may call back into the reader
/// (or whatever owns it) while a poll is in progress.
pub struct ProgressFileReader {
    interval: Duration,
    listeners: Listeners,
    progress: Arc<AtomicU8>,
    polling: Mutex<Option<Polling>>,
}

impl fmt::Debug for ProgressFileReader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProgressFileReader")
            .field("interval", &self.interval)
            .field("path", &self.path())
            .field("progress", &self.progress())
            .finish()
    }
}

impl Default for ProgressFileReader {
    fn default() -> Self {
        Self::with_interval(DEFAULT_POLL_INTERVAL)
    }
}

impl ProgressFileReader {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_interval(interval: Duration) -> Self {
        Self {
            interval,
            listeners: Arc::new(Mutex::new(Vec::new())),
            progress: Arc::new(AtomicU8::new(0)),
            polling: Mutex::new(None),
        }
    }

    fn polling(&self) -> MutexGuard<'_, Option<Polling>> {
        self.polling.lock().unwrap_or_else(|p| p.into_inner())
    }

    pub fn register(&self, listener: Arc<dyn ProgressListener>) {
        self.listeners
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .push(listener);
    }

    pub fn unregister(&self, listener: &Arc<dyn ProgressListener>) -> bool {
        let mut listeners = self.listeners.lock().unwrap_or_else(|p| p.into_inner());
        let before = listeners.len();
        listeners.retain(|l| !Arc::ptr_eq(l, listener));
        listeners.len() != before
    }

    /// Last successfully parsed value, `0` before any.
    pub fn progress(&self) -> u8 {
        self.progress.load(Ordering::SeqCst)
    }

    pub fn path(&self) -> Option<PathBuf> {
        self.polling().as_ref().map(|p| p.path.clone())
    }

    pub fn is_started(&self) -> bool {
        self.polling().is_some()
    }

    /// Create (or clear) a unique progress file in `dir` and start polling
    /// it. A running poller is stopped first.
    pub fn start(&self, dir: &Path, base_name: &str) -> io::Result<PathBuf> {
        self.stop();

        let path = dir.join(format!(".{base_name}-{}.progress", Uuid::new_v4()));
        std::fs::write(&path, b"")?;
        self.progress.store(0, Ordering::SeqCst);

        let (stop_tx, stop_rx) = mpsc::channel();
        let poller = Poller {
            path: path.clone(),
            listeners: Arc::clone(&self.listeners),
            progress: Arc::clone(&self.progress),
            last_seen: None,
        };
        let interval = self.interval;
        let handle = thread::Builder::new()
            .name("progress-reader".into())
            .spawn(move || poller.run(interval, stop_rx))?;

        debug!(path = %path.display(), "progress reader started");
        let previous = self.polling().replace(Polling {
            path: path.clone(),
            stop_tx,
            handle,
        });
        if let Some(previous) = previous {
            previous.shutdown();
        }
        Ok(path)
    }

    /// Stop polling and join the poller thread. The thread is joined
    /// outside the lock, so a listener running meanwhile can still use the
    /// reader.
    pub fn stop(&self) {
        let polling = self.polling().take();
        if let Some(polling) = polling {
            polling.shutdown();
        }
    }
}

impl Drop for ProgressFileReader {
    fn drop(&mut self) {
        self.stop();
    }
}

struct Poller {
    path: PathBuf,
    listeners: Listeners,
    progress: Arc<AtomicU8>,
    last_seen: Option<u8>,
}

impl Poller {
    fn run(mut self, interval: Duration, stop_rx: mpsc::Receiver<()>) {
        loop {
            match stop_rx.recv_timeout(interval) {
                Err(RecvTimeoutError::Timeout) => self.poll(),
                Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
            }
        }
    }

    fn poll(&mut self) {
        let Ok(content) = std::fs::read_to_string(&self.path) else {
            return;
        };
        let Some(value) = parse_progress(&content) else {
            return;
        };
        if self.last_seen == Some(value) {
            return;
        }
        self.last_seen = Some(value);
        self.progress.store(value, Ordering::SeqCst);

        let listeners: Vec<_> = self
            .listeners
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .clone();
        for listener in listeners {
            listener.on_progress(value);
        }
    }
}

fn parse_progress(content: &str) -> Option<u8> {
    content.trim().parse::<u8>().ok().filter(|v| *v <= 100)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_accepts_only_percentages() {
        assert_eq!(parse_progress("42\n"), Some(42));
        assert_eq!(parse_progress(" 100 "), Some(100));
        assert_eq!(parse_progress("0"), Some(0));
        assert_eq!(parse_progress("101"), None);
        assert_eq!(parse_progress("-1"), None);
        assert_eq!(parse_progress("4 2"), None);
        assert_eq!(parse_progress(""), None);
        assert_eq!(parse_progress("fifty"), None);
    }

    #[test]
    fn stop_without_start_is_harmless() {
        let reader = ProgressFileReader::new();
        reader.stop();
        assert!(!reader.is_started());
    }

    #[test]
    fn listener_may_use_the_reader_while_it_stops() {
        let dir = tempfile::tempdir().unwrap();
        let reader = Arc::new(ProgressFileReader::with_interval(Duration::from_millis(10)));
        let (seen_tx, seen_rx) = mpsc::channel();
        let weak = Arc::downgrade(&reader);
        reader.register(Arc::new(move |_v: u8| {
            thread::sleep(Duration::from_millis(200));
            if let Some(reader) = weak.upgrade() {
                seen_tx.send((reader.progress(), reader.is_started())).unwrap();
            }
        }));
        let path = reader.start(dir.path(), "task").unwrap();
        std::fs::write(&path, "60").unwrap();
        thread::sleep(Duration::from_millis(50));

        reader.stop();
        let (progress, _) = seen_rx.recv_timeout(Duration::from_secs(2)).unwrap();
        assert_eq!(progress, 60);
        assert!(!reader.is_started());
    }

    #[test]
    fn unregister_removes_by_identity() {
        let reader = ProgressFileReader::new();
        let a: Arc<dyn ProgressListener> = Arc::new(|_v: u8| {});
        let b: Arc<dyn ProgressListener> = Arc::new(|_v: u8| {});
        reader.register(a.clone());
        reader.register(b.clone());
        assert!(reader.unregister(&a));
        assert!(!reader.unregister(&a));
        assert!(reader.unregister(&b));
    }
}
