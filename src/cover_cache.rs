//! Content-addressed cover art cache with deduplicated, cancellable downloads.
//!
//! Covers live at `<cache-root>/<unique-identifier>.jpg`. At most one transfer
//! per identifier is in flight; every request for the same album while it runs
//! shares that task, including its cancellation. A request that arrives while
//! a cancelled transfer is still winding down is queued behind it.

use std::collections::HashMap;
use std::fs;
use std::io::{ErrorKind, Read};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::time::Duration;

use log::{debug, info, warn};
use tokio::sync::broadcast;
use uuid::Uuid;

use crate::cover_transport::{CoverTransport, ShutdownHook};
use crate::error::LibraryError;
use crate::foreground::ForegroundHandle;
use crate::model::Album;
use crate::protocol::{CoverMessage, Message};
use crate::server_registry::Server;
use crate::worker_pool::{lock_or_recover, WorkerPool};

const CHUNK_SIZE: usize = 16 * 1024;
pub const DEFAULT_MAX_COVER_BYTES: u64 = 20 * 1024 * 1024;

/// Terminal result of a cover request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CoverOutcome {
    Success(Vec<u8>),
    Failed(LibraryError),
    Cancelled,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskState {
    Created,
    Running,
    Completed,
    Cancelled,
    Failed,
}

impl TaskState {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Cancelled | Self::Failed)
    }
}

type OutcomeCallback = Box<dyn FnOnce(CoverOutcome) + Send + 'static>;

struct TaskInner {
    state: TaskState,
    outcome: Option<CoverOutcome>,
    callbacks: Vec<OutcomeCallback>,
}

/// One download. The terminal transition happens exactly once, under the state
/// lock; callbacks registered before it run once it happens, callbacks
/// registered after it run immediately.
struct CoverTask {
    identifier: String,
    cancel_requested: AtomicBool,
    inner: Mutex<TaskInner>,
    settled: Condvar,
    shutdown: Mutex<Option<ShutdownHook>>,
}

impl CoverTask {
    fn new(identifier: &str) -> Arc<Self> {
        Arc::new(Self {
            identifier: identifier.to_string(),
            cancel_requested: AtomicBool::new(false),
            inner: Mutex::new(TaskInner {
                state: TaskState::Created,
                outcome: None,
                callbacks: Vec::new(),
            }),
            settled: Condvar::new(),
            shutdown: Mutex::new(None),
        })
    }

    fn already_failed(identifier: &str, error: LibraryError) -> Arc<Self> {
        let task = Self::new(identifier);
        task.finish(CoverOutcome::Failed(error));
        task
    }

    fn is_cancelled(&self) -> bool {
        self.cancel_requested.load(Ordering::SeqCst)
    }

    fn state(&self) -> TaskState {
        lock_or_recover(&self.inner).state
    }

    fn mark_running(&self) -> bool {
        let mut inner = lock_or_recover(&self.inner);
        if inner.state != TaskState::Created {
            return false;
        }
        inner.state = TaskState::Running;
        true
    }

    fn settle(&self, mut inner: MutexGuard<'_, TaskInner>, outcome: CoverOutcome) -> bool {
        if inner.state.is_terminal() {
            return false;
        }
        inner.state = match outcome {
            CoverOutcome::Success(_) => TaskState::Completed,
            CoverOutcome::Failed(_) => TaskState::Failed,
            CoverOutcome::Cancelled => TaskState::Cancelled,
        };
        inner.outcome = Some(outcome.clone());
        let callbacks = std::mem::take(&mut inner.callbacks);
        drop(inner);
        self.settled.notify_all();
        for callback in callbacks {
            callback(outcome.clone());
        }
        true
    }

    fn finish(&self, outcome: CoverOutcome) -> bool {
        self.settle(lock_or_recover(&self.inner), outcome)
    }

    /// Requests cancellation and shuts down the open transfer, if any. A task
    /// that already committed keeps its outcome.
    fn cancel(&self) -> bool {
        let inner = lock_or_recover(&self.inner);
        if inner.state.is_terminal() {
            return false;
        }
        self.cancel_requested.store(true, Ordering::SeqCst);
        let settled = self.settle(inner, CoverOutcome::Cancelled);
        let shutdown = lock_or_recover(&self.shutdown).take();
        if let Some(shutdown) = shutdown {
            shutdown();
        }
        settled
    }

    /// Keeps `shutdown` for a later `cancel`. Returns false, dropping the hook,
    /// when the task was cancelled already.
    fn arm_shutdown(&self, shutdown: Option<ShutdownHook>) -> bool {
        let mut slot = lock_or_recover(&self.shutdown);
        if self.is_cancelled() {
            return false;
        }
        *slot = shutdown;
        true
    }

    fn disarm_shutdown(&self) {
        lock_or_recover(&self.shutdown).take();
    }

    /// Runs `write` and settles as `Success`, unless the task was cancelled first.
    fn commit<F>(&self, bytes: Vec<u8>, write: F) -> bool
    where
        F: FnOnce(&[u8]) -> Result<(), LibraryError>,
    {
        let inner = lock_or_recover(&self.inner);
        if inner.state.is_terminal() {
            return false;
        }
        let outcome = if self.is_cancelled() {
            CoverOutcome::Cancelled
        } else {
            match write(&bytes) {
                Ok(()) => CoverOutcome::Success(bytes),
                Err(err) => CoverOutcome::Failed(err),
            }
        };
        self.settle(inner, outcome)
    }

    fn on_settled(&self, callback: OutcomeCallback) {
        let mut inner = lock_or_recover(&self.inner);
        match inner.outcome.clone() {
            Some(outcome) => {
                drop(inner);
                callback(outcome);
            }
            None => inner.callbacks.push(callback),
        }
    }

    fn wait(&self, timeout: Duration) -> Option<CoverOutcome> {
        let inner = lock_or_recover(&self.inner);
        let (inner, _) = match self
            .settled
            .wait_timeout_while(inner, timeout, |inner| inner.outcome.is_none())
        {
            Ok(result) => result,
            Err(poisoned) => poisoned.into_inner(),
        };
        inner.outcome.clone()
    }
}

/// Caller's view of a cover request. Several handles may share one task.
#[derive(Clone)]
pub struct CoverHandle {
    task: Arc<CoverTask>,
    foreground: ForegroundHandle,
}

impl CoverHandle {
    pub fn identifier(&self) -> &str {
        &self.task.identifier
    }

    pub fn state(&self) -> TaskState {
        self.task.state()
    }

    /// The outcome if the task already settled.
    pub fn outcome(&self) -> Option<CoverOutcome> {
        lock_or_recover(&self.task.inner).outcome.clone()
    }

    /// Cancels the shared task; every handle attached to it observes `Cancelled`.
    pub fn cancel(&self) {
        if self.task.cancel() {
            debug!("CoverArtCache: cancelled {}", self.task.identifier);
        }
    }

    /// Blocks up to `timeout` for the outcome.
    pub fn wait(&self, timeout: Duration) -> Option<CoverOutcome> {
        self.task.wait(timeout)
    }

    /// Delivers the outcome to `callback` on the foreground queue, once.
    pub fn on_complete<F>(&self, callback: F)
    where
        F: FnOnce(CoverOutcome) + Send + 'static,
    {
        let foreground = self.foreground.clone();
        self.task.on_settled(Box::new(move |outcome| {
            foreground.post(move || callback(outcome));
        }));
    }
}

/// A task together with what its worker needs to run it.
struct Download {
    task: Arc<CoverTask>,
    target: PathBuf,
    url: Option<String>,
}

struct InFlight {
    current: Arc<CoverTask>,
    /// Started once `current`, which was cancelled, has left its worker.
    queued: Option<Download>,
}

impl InFlight {
    /// The task a new request for the same identifier should share.
    fn live_task(&self) -> Option<Arc<CoverTask>> {
        match &self.queued {
            Some(queued) if !queued.task.is_cancelled() => Some(Arc::clone(&queued.task)),
            Some(_) => None,
            None if !self.current.is_cancelled() => Some(Arc::clone(&self.current)),
            None => None,
        }
    }
}

struct CacheShared {
    cache_root: PathBuf,
    max_bytes: u64,
    in_flight: Mutex<HashMap<String, InFlight>>,
}

/// Disk-backed album cover cache.
#[derive(Clone)]
pub struct CoverArtCache {
    shared: Arc<CacheShared>,
    transport: Arc<dyn CoverTransport>,
    pool: WorkerPool,
    foreground: ForegroundHandle,
    bus_sender: broadcast::Sender<Message>,
}

impl CoverArtCache {
    pub fn new(
        cache_root: PathBuf,
        max_bytes: u64,
        transport: Arc<dyn CoverTransport>,
        pool: WorkerPool,
        foreground: ForegroundHandle,
        bus_sender: broadcast::Sender<Message>,
    ) -> Self {
        Self {
            shared: Arc::new(CacheShared {
                cache_root,
                max_bytes,
                in_flight: Mutex::new(HashMap::new()),
            }),
            transport,
            pool,
            foreground,
            bus_sender,
        }
    }

    pub fn cache_root(&self) -> &Path {
        &self.shared.cache_root
    }

    pub fn local_cover_path(&self, album: &Album) -> PathBuf {
        album.local_cover_path(&self.shared.cache_root)
    }

    pub fn in_flight_count(&self) -> usize {
        lock_or_recover(&self.shared.in_flight).len()
    }

    fn handle_for(&self, task: Arc<CoverTask>) -> CoverHandle {
        CoverHandle {
            task,
            foreground: self.foreground.clone(),
        }
    }

    /// Returns a handle for `album`'s cover, attaching to a running download
    /// when there is one.
    ///
    /// A cover already on disk resolves without a server. Otherwise a missing
    /// server, album path or cover URL yields an already failed handle.
    pub fn fetch_cover(&self, album: &Album, server: Option<&Server>) -> CoverHandle {
        let identifier = album.unique_identifier().to_string();
        let target = self.local_cover_path(album);
        let on_disk = target.is_file();

        let mut in_flight = lock_or_recover(&self.shared.in_flight);
        if let Some(task) = in_flight.get(&identifier).and_then(InFlight::live_task) {
            debug!("CoverArtCache: attaching to running download for '{}'", album.name);
            return self.handle_for(task);
        }

        let url = if on_disk {
            None
        } else {
            match Self::cover_url(album, server) {
                Ok(url) => Some(url),
                Err(err) => {
                    debug!("CoverArtCache: cannot fetch cover for '{}': {}", album.name, err);
                    return self.handle_for(CoverTask::already_failed(&identifier, err));
                }
            }
        };

        let task = CoverTask::new(&identifier);
        self.track_settlement(&task, target.clone());
        let download = Download {
            task: Arc::clone(&task),
            target,
            url,
        };
        match in_flight.get_mut(&identifier) {
            Some(entry) => {
                debug!(
                    "CoverArtCache: '{}' waits for a cancelled transfer to stop",
                    album.name
                );
                entry.queued = Some(download);
            }
            None => {
                in_flight.insert(
                    identifier,
                    InFlight {
                        current: Arc::clone(&task),
                        queued: None,
                    },
                );
                drop(in_flight);
                self.submit(download);
            }
        }
        self.handle_for(task)
    }

    fn submit(&self, download: Download) {
        let task = Arc::clone(&download.task);
        let cache = self.clone();
        let submitted = self.pool.execute(move || {
            let _drained = DrainGuard {
                cache: &cache,
                task: &download.task,
            };
            run_task(
                &cache.shared,
                cache.transport.as_ref(),
                &download.task,
                &download.target,
                download.url.as_deref(),
            );
        });
        if !submitted {
            task.finish(CoverOutcome::Failed(LibraryError::Transport(
                "no worker available for download".to_string(),
            )));
            self.drained(&task);
        }
    }

    /// Called once `task` no longer runs on a worker. Starts the queued
    /// request for the same identifier, or forgets the identifier.
    fn drained(&self, task: &Arc<CoverTask>) {
        let next = {
            let mut in_flight = lock_or_recover(&self.shared.in_flight);
            let Some(entry) = in_flight.get_mut(&task.identifier) else {
                return;
            };
            if !Arc::ptr_eq(&entry.current, task) {
                return;
            }
            match entry.queued.take() {
                Some(next) if !next.task.is_cancelled() => {
                    entry.current = Arc::clone(&next.task);
                    Some(next)
                }
                _ => {
                    in_flight.remove(&task.identifier);
                    None
                }
            }
        };
        if let Some(next) = next {
            debug!("CoverArtCache: starting queued download for {}", next.task.identifier);
            self.submit(next);
        }
    }

    fn cover_url(album: &Album, server: Option<&Server>) -> Result<String, LibraryError> {
        let server = server.ok_or(LibraryError::NoServerConfigured)?;
        let path = album
            .path
            .as_deref()
            .filter(|path| !path.is_empty())
            .ok_or_else(|| LibraryError::NoPathForEntity(album.name.clone()))?;
        server
            .cover_url(path)
            .ok_or_else(|| LibraryError::UrlConstructionFailed(path.to_string()))
    }

    /// Announces the task's outcome on the bus.
    fn track_settlement(&self, task: &Arc<CoverTask>, target: PathBuf) {
        let bus_sender = self.bus_sender.clone();
        let identifier = task.identifier.clone();
        task.on_settled(Box::new(move |outcome| {
            let message = match outcome {
                CoverOutcome::Success(_) => CoverMessage::CoverCached {
                    identifier,
                    path: target,
                },
                CoverOutcome::Failed(error) => CoverMessage::CoverFailed { identifier, error },
                CoverOutcome::Cancelled => CoverMessage::CoverCancelled { identifier },
            };
            let _ = bus_sender.send(Message::Cover(message));
        }));
    }

    /// Cancels every running and queued download. None of them writes a file.
    pub fn cancel_all(&self) {
        let tasks: Vec<Arc<CoverTask>> = lock_or_recover(&self.shared.in_flight)
            .values()
            .flat_map(|entry| {
                let queued = entry.queued.as_ref().map(|download| Arc::clone(&download.task));
                std::iter::once(Arc::clone(&entry.current)).chain(queued)
            })
            .collect();
        if !tasks.is_empty() {
            info!("CoverArtCache: cancelling {} download(s)", tasks.len());
        }
        for task in tasks {
            task.cancel();
        }
    }
}

/// Releases the in-flight slot when the worker leaves the task, even if the
/// task panicked.
struct DrainGuard<'a> {
    cache: &'a CoverArtCache,
    task: &'a Arc<CoverTask>,
}

impl Drop for DrainGuard<'_> {
    fn drop(&mut self) {
        self.task.finish(CoverOutcome::Failed(LibraryError::Transport(
            "download stopped unexpectedly".to_string(),
        )));
        self.cache.drained(self.task);
    }
}

fn run_task(
    shared: &CacheShared,
    transport: &dyn CoverTransport,
    task: &CoverTask,
    target: &Path,
    url: Option<&str>,
) {
    if !task.mark_running() || task.is_cancelled() {
        return;
    }

    match fs::read(target) {
        Ok(bytes) => {
            debug!("CoverArtCache: disk hit for {}", task.identifier);
            task.finish(CoverOutcome::Success(bytes));
            return;
        }
        Err(err) if err.kind() == ErrorKind::NotFound => {}
        Err(err) => warn!(
            "CoverArtCache: failed to read cached cover {}: {}",
            target.display(),
            err
        ),
    }

    let Some(url) = url else {
        task.finish(CoverOutcome::Failed(LibraryError::Transport(format!(
            "cached cover {} is unreadable",
            target.display()
        ))));
        return;
    };

    match download(transport, task, url, shared.max_bytes) {
        Ok(Some(bytes)) => {
            let committed = task.commit(bytes, |bytes| {
                write_atomically(&shared.cache_root, target, bytes)
            });
            if committed {
                debug!("CoverArtCache: stored {}", target.display());
            }
        }
        Ok(None) => {
            task.finish(CoverOutcome::Cancelled);
        }
        Err(err) => {
            warn!("CoverArtCache: download of {} failed: {}", url, err);
            task.finish(CoverOutcome::Failed(err));
        }
    }
}

/// Reads the body in fixed chunks. `Ok(None)` means the task was cancelled.
fn download(
    transport: &dyn CoverTransport,
    task: &CoverTask,
    url: &str,
    max_bytes: u64,
) -> Result<Option<Vec<u8>>, LibraryError> {
    let body = transport.open(url)?;
    let mut reader = body.reader;
    if !task.arm_shutdown(body.shutdown) {
        return Ok(None);
    }
    let result = read_body(reader.as_mut(), task, max_bytes);
    task.disarm_shutdown();
    result
}

fn read_body(
    reader: &mut dyn Read,
    task: &CoverTask,
    max_bytes: u64,
) -> Result<Option<Vec<u8>>, LibraryError> {
    let mut bytes = Vec::new();
    let mut chunk = vec![0u8; CHUNK_SIZE];
    loop {
        let read = match reader.read(&mut chunk) {
            Ok(0) => break,
            Ok(read) => read,
            Err(err) if err.kind() == ErrorKind::Interrupted => continue,
            Err(_) if task.is_cancelled() => return Ok(None),
            Err(err) => {
                return Err(LibraryError::Transport(format!(
                    "failed to read cover body: {err}"
                )))
            }
        };
        bytes.extend_from_slice(&chunk[..read]);
        if bytes.len() as u64 > max_bytes {
            return Err(LibraryError::Transport(format!(
                "cover exceeds {max_bytes} bytes"
            )));
        }
        if task.is_cancelled() {
            return Ok(None);
        }
    }

    if bytes.is_empty() {
        return Err(LibraryError::Transport("cover response was empty".to_string()));
    }
    Ok(Some(bytes))
}

fn write_atomically(cache_root: &Path, target: &Path, bytes: &[u8]) -> Result<(), LibraryError> {
    fs::create_dir_all(cache_root).map_err(|err| {
        LibraryError::WriteFailed(format!(
            "failed to create cache directory {}: {err}",
            cache_root.display()
        ))
    })?;
    let temp_path = cache_root.join(format!(".{}.tmp", Uuid::new_v4()));
    fs::write(&temp_path, bytes).map_err(|err| {
        LibraryError::WriteFailed(format!("failed to write {}: {err}", temp_path.display()))
    })?;
    if let Err(err) = fs::rename(&temp_path, target) {
        let _ = fs::remove_file(&temp_path);
        return Err(LibraryError::WriteFailed(format!(
            "failed to move cover into {}: {err}",
            target.display()
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::fs;
    use std::io::{self, Read};
    use std::path::PathBuf;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::sync::{Arc, Condvar, Mutex};
    use std::time::{Duration, SystemTime, UNIX_EPOCH};

    use tokio::sync::broadcast;

    use super::{CoverArtCache, CoverOutcome, TaskState};
    use crate::cover_transport::{CoverBody, CoverTransport};
    use crate::error::LibraryError;
    use crate::foreground::ForegroundQueue;
    use crate::model::Album;
    use crate::protocol::{CoverMessage, Message};
    use crate::server_registry::{HttpDirectory, Server};
    use crate::worker_pool::WorkerPool;

    const WAIT: Duration = Duration::from_secs(5);

    #[derive(Default)]
    struct Gate {
        open: Mutex<bool>,
        changed: Condvar,
    }

    impl Gate {
        fn open(&self) {
            *self.open.lock().expect("gate lock") = true;
            self.changed.notify_all();
        }

        /// Returns false when `aborted` was raised before the gate opened.
        fn wait(&self, aborted: &AtomicBool) -> bool {
            let mut open = self.open.lock().expect("gate lock");
            while !*open && !aborted.load(Ordering::SeqCst) {
                open = self.changed.wait(open).expect("gate wait");
            }
            !aborted.load(Ordering::SeqCst)
        }

        fn abort(&self, aborted: &AtomicBool) {
            let _open = self.open.lock().expect("gate lock");
            aborted.store(true, Ordering::SeqCst);
            self.changed.notify_all();
        }
    }

    /// Body that yields one chunk, then blocks on the gate before the rest.
    struct GatedBody {
        chunks: Vec<Vec<u8>>,
        gate: Arc<Gate>,
        aborted: Arc<AtomicBool>,
        active: Arc<AtomicUsize>,
    }

    impl Read for GatedBody {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            if self.chunks.is_empty() {
                return Ok(0);
            }
            if self.chunks.len() == 1 && !self.gate.wait(&self.aborted) {
                return Err(io::Error::new(io::ErrorKind::ConnectionAborted, "shut down"));
            }
            let chunk = self.chunks.remove(0);
            buf[..chunk.len()].copy_from_slice(&chunk);
            Ok(chunk.len())
        }
    }

    impl Drop for GatedBody {
        fn drop(&mut self) {
            self.active.fetch_sub(1, Ordering::SeqCst);
        }
    }

    struct FakeTransport {
        opens: AtomicUsize,
        active: Arc<AtomicUsize>,
        max_active: AtomicUsize,
        gate: Arc<Gate>,
        fail: Option<LibraryError>,
    }

    impl FakeTransport {
        fn new(gate_open: bool) -> Arc<Self> {
            let gate = Arc::new(Gate::default());
            if gate_open {
                gate.open();
            }
            Arc::new(Self::with_gate(gate, None))
        }

        fn with_gate(gate: Arc<Gate>, fail: Option<LibraryError>) -> Self {
            Self {
                opens: AtomicUsize::new(0),
                active: Arc::new(AtomicUsize::new(0)),
                max_active: AtomicUsize::new(0),
                gate,
                fail,
            }
        }

        fn opens(&self) -> usize {
            self.opens.load(Ordering::SeqCst)
        }

        fn max_active(&self) -> usize {
            self.max_active.load(Ordering::SeqCst)
        }
    }

    impl CoverTransport for FakeTransport {
        fn open(&self, _url: &str) -> Result<CoverBody, LibraryError> {
            self.opens.fetch_add(1, Ordering::SeqCst);
            if let Some(err) = &self.fail {
                return Err(err.clone());
            }
            let active = self.active.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_active.fetch_max(active, Ordering::SeqCst);
            let aborted = Arc::new(AtomicBool::new(false));
            let body = GatedBody {
                chunks: vec![b"\xff\xd8first".to_vec(), b"second".to_vec()],
                gate: Arc::clone(&self.gate),
                aborted: Arc::clone(&aborted),
                active: Arc::clone(&self.active),
            };
            let gate = Arc::clone(&self.gate);
            Ok(CoverBody::new(Box::new(body)).with_shutdown(move || gate.abort(&aborted)))
        }
    }

    fn eventually(mut condition: impl FnMut() -> bool) -> bool {
        let deadline = std::time::Instant::now() + WAIT;
        while std::time::Instant::now() < deadline {
            if condition() {
                return true;
            }
            std::thread::sleep(Duration::from_millis(10));
        }
        condition()
    }

    fn unique_temp_dir(label: &str) -> PathBuf {
        let nonce = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("system clock before epoch")
            .as_nanos();
        std::env::temp_dir().join(format!("mpdshelf_covers_{label}_{nonce}"))
    }

    struct Harness {
        queue: ForegroundQueue,
        cache: CoverArtCache,
        transport: Arc<FakeTransport>,
        bus: broadcast::Receiver<Message>,
        root: PathBuf,
    }

    fn harness(label: &str, transport: Arc<FakeTransport>) -> Harness {
        let queue = ForegroundQueue::new();
        let root = unique_temp_dir(label);
        let (bus_sender, bus) = broadcast::channel(64);
        let cache = CoverArtCache::new(
            root.clone(),
            1024,
            transport.clone(),
            WorkerPool::new("cover-test", 2),
            queue.handle(),
            bus_sender,
        );
        Harness {
            queue,
            cache,
            transport,
            bus,
            root,
        }
    }

    fn server() -> Server {
        Server::new("test", "127.0.0.1", 6600)
            .with_cover_strategy(Arc::new(HttpDirectory::new("http://127.0.0.1:8080")))
    }

    fn album() -> Album {
        Album::with_details("Blue", "Joni Mitchell/Blue", "Joni Mitchell", "Folk", "1971")
    }

    fn other_album(name: &str) -> Album {
        Album::with_details(name, format!("Joni Mitchell/{name}"), "Joni Mitchell", "Folk", "")
    }

    #[test]
    fn test_download_is_written_to_identifier_path() {
        let harness = harness("write", FakeTransport::new(true));
        let handle = harness.cache.fetch_cover(&album(), Some(&server()));
        let outcome = handle.wait(WAIT).expect("download should settle");

        assert_eq!(outcome, CoverOutcome::Success(b"\xff\xd8firstsecond".to_vec()));
        assert_eq!(handle.state(), TaskState::Completed);
        let target = harness.root.join(format!("{}.jpg", album().unique_identifier()));
        assert_eq!(fs::read(&target).expect("cover file"), b"\xff\xd8firstsecond");
        let leftovers = fs::read_dir(&harness.root)
            .expect("cache dir")
            .filter_map(Result::ok)
            .filter(|entry| entry.file_name().to_string_lossy().ends_with(".tmp"))
            .count();
        assert_eq!(leftovers, 0);
        let _ = fs::remove_dir_all(&harness.root);
    }

    #[test]
    fn test_concurrent_requests_share_one_transfer() {
        let harness = harness("dedup", FakeTransport::new(false));
        let first = harness.cache.fetch_cover(&album(), Some(&server()));
        let second = harness.cache.fetch_cover(&album(), Some(&server()));
        assert_eq!(harness.cache.in_flight_count(), 1);

        harness.transport.gate.open();
        let first = first.wait(WAIT).expect("first should settle");
        let second = second.wait(WAIT).expect("second should settle");
        assert_eq!(first, second);
        assert!(matches!(first, CoverOutcome::Success(_)));
        assert_eq!(harness.transport.opens(), 1);
        let _ = fs::remove_dir_all(&harness.root);
    }

    #[test]
    fn test_cancel_before_completion_writes_nothing() {
        let harness = harness("cancel", FakeTransport::new(false));
        let first = harness.cache.fetch_cover(&album(), Some(&server()));
        let second = harness.cache.fetch_cover(&album(), Some(&server()));

        second.cancel();
        harness.transport.gate.open();

        assert_eq!(first.wait(WAIT), Some(CoverOutcome::Cancelled));
        assert_eq!(second.wait(WAIT), Some(CoverOutcome::Cancelled));
        std::thread::sleep(Duration::from_millis(100));
        assert!(!harness.cache.local_cover_path(&album()).exists());
        assert_eq!(harness.cache.in_flight_count(), 0);
    }

    #[test]
    fn test_cancel_all_cancels_running_downloads() {
        let mut harness = harness("switch", FakeTransport::new(false));
        let handle = harness.cache.fetch_cover(&album(), Some(&server()));
        harness.cache.cancel_all();
        harness.transport.gate.open();

        assert_eq!(handle.wait(WAIT), Some(CoverOutcome::Cancelled));
        std::thread::sleep(Duration::from_millis(100));
        assert!(!harness.cache.local_cover_path(&album()).exists());

        let mut saw_cancelled = false;
        while let Ok(message) = harness.bus.try_recv() {
            if let Message::Cover(CoverMessage::CoverCancelled { .. }) = message {
                saw_cancelled = true;
            }
        }
        assert!(saw_cancelled);
    }

    #[test]
    fn test_refetch_after_cancel_waits_for_the_first_transfer() {
        let harness = harness("refetch", FakeTransport::new(false));
        let first = harness.cache.fetch_cover(&album(), Some(&server()));
        assert!(eventually(|| harness.transport.opens() == 1));

        first.cancel();
        let second = harness.cache.fetch_cover(&album(), Some(&server()));
        assert_ne!(second.state(), TaskState::Cancelled);
        harness.transport.gate.open();

        assert_eq!(first.wait(WAIT), Some(CoverOutcome::Cancelled));
        assert_eq!(
            second.wait(WAIT),
            Some(CoverOutcome::Success(b"\xff\xd8firstsecond".to_vec()))
        );
        assert_eq!(harness.transport.opens(), 2);
        assert_eq!(harness.transport.max_active(), 1);
        assert!(harness.cache.local_cover_path(&album()).is_file());
        assert!(eventually(|| harness.cache.in_flight_count() == 0));
        let _ = fs::remove_dir_all(&harness.root);
    }

    #[test]
    fn test_cancel_all_frees_workers_for_new_downloads() {
        let harness = harness("starved", FakeTransport::new(false));
        let court = harness
            .cache
            .fetch_cover(&other_album("Court and Spark"), Some(&server()));
        let hejira = harness.cache.fetch_cover(&other_album("Hejira"), Some(&server()));
        assert!(eventually(|| harness.transport.opens() == 2));

        harness.cache.cancel_all();
        let blue = harness.cache.fetch_cover(&album(), Some(&server()));
        assert!(eventually(|| blue.state() == TaskState::Running));
        assert_eq!(court.outcome(), Some(CoverOutcome::Cancelled));
        assert_eq!(hejira.outcome(), Some(CoverOutcome::Cancelled));

        harness.transport.gate.open();
        assert!(matches!(blue.wait(WAIT), Some(CoverOutcome::Success(_))));
        assert_eq!(harness.transport.opens(), 3);
        let _ = fs::remove_dir_all(&harness.root);
    }

    #[test]
    fn test_cached_file_resolves_without_network() {
        let harness = harness("hit", FakeTransport::new(true));
        fs::create_dir_all(&harness.root).expect("create cache dir");
        fs::write(harness.cache.local_cover_path(&album()), b"cached").expect("seed cover");

        let handle = harness.cache.fetch_cover(&album(), None);
        assert_eq!(
            handle.wait(WAIT),
            Some(CoverOutcome::Success(b"cached".to_vec()))
        );
        assert_eq!(harness.transport.opens(), 0);
        let _ = fs::remove_dir_all(&harness.root);
    }

    #[test]
    fn test_preconditions_fail_synchronously() {
        let harness = harness("preconditions", FakeTransport::new(true));

        let no_server = harness.cache.fetch_cover(&album(), None);
        assert_eq!(
            no_server.outcome(),
            Some(CoverOutcome::Failed(LibraryError::NoServerConfigured))
        );

        let no_path = harness.cache.fetch_cover(&Album::new("Loose"), Some(&server()));
        assert_eq!(
            no_path.outcome(),
            Some(CoverOutcome::Failed(LibraryError::NoPathForEntity("Loose".to_string())))
        );

        let bare_server = Server::new("bare", "127.0.0.1", 6600);
        let no_url = harness.cache.fetch_cover(&album(), Some(&bare_server));
        assert_eq!(
            no_url.outcome(),
            Some(CoverOutcome::Failed(LibraryError::UrlConstructionFailed(
                "Joni Mitchell/Blue".to_string()
            )))
        );
        assert_eq!(harness.transport.opens(), 0);
        assert_eq!(harness.cache.in_flight_count(), 0);
    }

    #[test]
    fn test_oversized_body_fails_without_file() {
        let transport = FakeTransport::new(true);
        let queue = ForegroundQueue::new();
        let root = unique_temp_dir("oversized");
        let (bus_sender, _bus) = broadcast::channel(8);
        let cache = CoverArtCache::new(
            root.clone(),
            4,
            transport,
            WorkerPool::new("cover-test", 1),
            queue.handle(),
            bus_sender,
        );
        let outcome = cache
            .fetch_cover(&album(), Some(&server()))
            .wait(WAIT)
            .expect("download should settle");
        assert!(matches!(outcome, CoverOutcome::Failed(LibraryError::Transport(_))));
        assert!(!cache.local_cover_path(&album()).exists());
    }

    #[test]
    fn test_transport_failure_is_reported() {
        let transport = Arc::new(FakeTransport::with_gate(
            Arc::new(Gate::default()),
            Some(LibraryError::Transport("HTTP 404".to_string())),
        ));
        let harness = harness("failure", transport);
        let outcome = harness
            .cache
            .fetch_cover(&album(), Some(&server()))
            .wait(WAIT);
        assert_eq!(
            outcome,
            Some(CoverOutcome::Failed(LibraryError::Transport("HTTP 404".to_string())))
        );
    }

    #[test]
    fn test_on_complete_runs_on_foreground_queue() {
        let harness = harness("callback", FakeTransport::new(true));
        let handle = harness.cache.fetch_cover(&album(), Some(&server()));
        let seen = Arc::new(Mutex::new(None));
        let writer = Arc::clone(&seen);
        handle.on_complete(move |outcome| {
            *writer.lock().expect("seen lock") = Some(outcome);
        });
        assert!(harness
            .queue
            .run_until(WAIT, || seen.lock().expect("seen lock").is_some()));
        assert!(matches!(
            seen.lock().expect("seen lock").clone(),
            Some(CoverOutcome::Success(_))
        ));
        let _ = fs::remove_dir_all(&harness.root);
    }
}
