//! Storage seam for the operation log.
//!
//! [`LogStore`] is the small slice of a durable file system the log needs:
//! whole-file reads, truncating and appending writers, atomic rename,
//! removal, and a write lease that can only be reclaimed once its owner is
//! gone.
//! [`TokioLogStore`] backs it with the local file system; [`MemLogStore`]
//! keeps everything in memory and loses unsynced bytes when a writer is
//! dropped, which is how tests model a crash.

use std::{
    collections::{HashMap, HashSet},
    ffi::OsString,
    future::Future,
    io,
    path::{Path, PathBuf},
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex as StdMutex, MutexGuard, PoisonError,
    },
};

use async_lock::Mutex;
use once_cell::sync::Lazy;
use tokio::{fs, io::AsyncWriteExt};
use ulid::Ulid;

/// What [`LogStore::recover_lease`] found on a log.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LeaseStatus {
    /// Nobody held the lease.
    Free,
    /// The lease belonged to a writer that is gone and was removed.
    Reclaimed,
    /// A live writer still owns the lease; it was left in place.
    Held {
        /// Owner as recorded in the lease.
        owner: String,
    },
}

/// Durable file operations used by [`crate::oplog::OperationLog`].
pub trait LogStore {
    /// Writer handed out by [`LogStore::create`] and [`LogStore::append`].
    type Writer: LogWriter;

    /// Whether a file exists at `path`.
    fn exists(&self, path: &Path) -> impl Future<Output = io::Result<bool>> + Send;

    /// Read the whole file.
    fn read(&self, path: &Path) -> impl Future<Output = io::Result<Vec<u8>>> + Send;

    /// Create or truncate `path` and open it for writing.
    fn create(&self, path: &Path) -> impl Future<Output = io::Result<Self::Writer>> + Send;

    /// Open `path` for appending and take its write lease.
    ///
    /// Fails with [`io::ErrorKind::AlreadyExists`] while another writer holds
    /// the lease.
    fn append(&self, path: &Path) -> impl Future<Output = io::Result<Self::Writer>> + Send;

    /// Atomically replace `to` with `from`.
    fn rename(&self, from: &Path, to: &Path) -> impl Future<Output = io::Result<()>> + Send;

    /// Remove the file at `path`.
    fn remove(&self, path: &Path) -> impl Future<Output = io::Result<()>> + Send;

    /// Drop a write lease left behind by a writer that never closed.
    ///
    /// A lease whose owner is still alive is never removed and is reported
    /// as [`LeaseStatus::Held`].
    fn recover_lease(&self, path: &Path) -> impl Future<Output = io::Result<LeaseStatus>> + Send;
}

/// Sequential writer over a log file.
pub trait LogWriter: Send {
    /// Buffer `buf` at the end of the file.
    fn write_all(&mut self, buf: &[u8]) -> impl Future<Output = io::Result<()>> + Send;

    /// Make every byte written so far durable.
    fn sync(&mut self) -> impl Future<Output = io::Result<()>> + Send;

    /// Sync, then release the handle and any lease it holds.
    fn close(self) -> impl Future<Output = io::Result<()>> + Send;
}

fn lease_path(path: &Path) -> PathBuf {
    let mut name = path
        .file_name()
        .map(OsString::from)
        .unwrap_or_else(|| OsString::from("log"));
    name.push(".lease");
    path.with_file_name(name)
}

/// [`LogStore`] over the local file system.
///
/// The write lease is a `<log>.lease` sidecar created exclusively and holding
/// `<ulid> <pid>` of its owner. A writer dropped without [`LogWriter::close`]
/// leaves the sidecar behind, exactly like a crashed controller. The lease is
/// live while its ulid belongs to an open writer of this process, or while
/// the recording process still runs when it is another one.
#[derive(Debug, Clone, Copy, Default)]
pub struct TokioLogStore;

/// Writer produced by [`TokioLogStore`].
#[derive(Debug)]
pub struct TokioLogWriter {
    file: fs::File,
    lease: Option<(PathBuf, Ulid)>,
}

static LIVE_LEASES: Lazy<StdMutex<HashSet<Ulid>>> = Lazy::new(Default::default);

fn live_leases() -> MutexGuard<'static, HashSet<Ulid>> {
    LIVE_LEASES.lock().unwrap_or_else(PoisonError::into_inner)
}

#[cfg(target_os = "linux")]
async fn process_alive(pid: u32) -> bool {
    fs::metadata(format!("/proc/{pid}")).await.is_ok()
}

// without a portable probe every foreign owner counts as alive
#[cfg(not(target_os = "linux"))]
async fn process_alive(_pid: u32) -> bool {
    true
}

async fn lease_owner_alive(owner: &str) -> bool {
    let mut tokens = owner.split_whitespace();
    let (Some(id), Some(pid), None) = (tokens.next(), tokens.next(), tokens.next()) else {
        return true;
    };
    let (Ok(id), Ok(pid)) = (Ulid::from_string(id), pid.parse::<u32>()) else {
        return true;
    };
    if pid == std::process::id() {
        let live = live_leases().contains(&id);
        return live;
    }
    process_alive(pid).await
}

impl TokioLogStore {
    async fn ensure_parent(path: &Path) -> io::Result<()> {
        match path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => fs::create_dir_all(parent).await,
            _ => Ok(()),
        }
    }

    async fn sync_parent(path: &Path) -> io::Result<()> {
        // skipped where directories cannot be opened
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            if let Ok(dir) = fs::File::open(parent).await {
                dir.sync_all().await?;
            }
        }
        Ok(())
    }
}

impl LogStore for TokioLogStore {
    type Writer = TokioLogWriter;

    async fn exists(&self, path: &Path) -> io::Result<bool> {
        match fs::metadata(path).await {
            Ok(_) => Ok(true),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(false),
            Err(err) => Err(err),
        }
    }

    async fn read(&self, path: &Path) -> io::Result<Vec<u8>> {
        fs::read(path).await
    }

    async fn create(&self, path: &Path) -> io::Result<TokioLogWriter> {
        Self::ensure_parent(path).await?;
        let file = fs::File::create(path).await?;
        Ok(TokioLogWriter { file, lease: None })
    }

    async fn append(&self, path: &Path) -> io::Result<TokioLogWriter> {
        Self::ensure_parent(path).await?;
        let lease = lease_path(path);
        let mut marker = fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&lease)
            .await?;
        let id = Ulid::new();
        live_leases().insert(id);
        let owner = format!("{} {}\n", id, std::process::id());
        let recorded = async {
            marker.write_all(owner.as_bytes()).await?;
            marker.sync_all().await
        }
        .await;
        if let Err(err) = recorded {
            live_leases().remove(&id);
            let _ = fs::remove_file(&lease).await;
            return Err(err);
        }

        let opened = fs::OpenOptions::new()
            .append(true)
            .create(true)
            .open(path)
            .await;
        match opened {
            Ok(file) => Ok(TokioLogWriter {
                file,
                lease: Some((lease, id)),
            }),
            Err(err) => {
                live_leases().remove(&id);
                let _ = fs::remove_file(&lease).await;
                Err(err)
            }
        }
    }

    async fn rename(&self, from: &Path, to: &Path) -> io::Result<()> {
        fs::rename(from, to).await?;
        Self::sync_parent(to).await
    }

    async fn remove(&self, path: &Path) -> io::Result<()> {
        fs::remove_file(path).await
    }

    async fn recover_lease(&self, path: &Path) -> io::Result<LeaseStatus> {
        let lease = lease_path(path);
        let owner = match fs::read(&lease).await {
            Ok(bytes) => String::from_utf8_lossy(&bytes).trim().to_string(),
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(LeaseStatus::Free),
            Err(err) => return Err(err),
        };
        if lease_owner_alive(&owner).await {
            return Ok(LeaseStatus::Held { owner });
        }
        match fs::remove_file(&lease).await {
            Ok(()) => Ok(LeaseStatus::Reclaimed),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(LeaseStatus::Free),
            Err(err) => Err(err),
        }
    }
}

impl LogWriter for TokioLogWriter {
    async fn write_all(&mut self, buf: &[u8]) -> io::Result<()> {
        self.file.write_all(buf).await
    }

    async fn sync(&mut self) -> io::Result<()> {
        self.file.flush().await?;
        self.file.sync_all().await
    }

    async fn close(mut self) -> io::Result<()> {
        self.sync().await?;
        if let Some((lease, id)) = self.lease.take() {
            let removed = fs::remove_file(&lease).await;
            live_leases().remove(&id);
            removed?;
        }
        Ok(())
    }
}

impl Drop for TokioLogWriter {
    fn drop(&mut self) {
        // the sidecar stays on disk; only the owner dies
        if let Some((_, id)) = &self.lease {
            live_leases().remove(id);
        }
    }
}

#[derive(Debug, Default)]
struct MemState {
    files: HashMap<PathBuf, Vec<u8>>,
    // alive flag shared with the owning writer
    leases: HashMap<PathBuf, Arc<AtomicBool>>,
}

/// In-memory [`LogStore`].
///
/// Bytes written through a [`MemLogWriter`] become visible only on
/// [`LogWriter::sync`]; dropping a writer discards whatever was not synced
/// and keeps its lease, like a process that died mid-write. Such a lease is
/// dead and can be reclaimed; the lease of a writer still in scope cannot.
#[derive(Debug, Clone, Default)]
pub struct MemLogStore {
    state: Arc<Mutex<MemState>>,
}

/// Writer produced by [`MemLogStore`].
#[derive(Debug)]
pub struct MemLogWriter {
    state: Arc<Mutex<MemState>>,
    path: PathBuf,
    pending: Vec<u8>,
    lease: Option<Arc<AtomicBool>>,
}

impl MemLogStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Durable contents of `path`, if present.
    pub async fn contents(&self, path: &Path) -> Option<Vec<u8>> {
        self.state.lock().await.files.get(path).cloned()
    }

    /// Install a file directly, bypassing writers.
    pub async fn install(&self, path: impl Into<PathBuf>, data: impl Into<Vec<u8>>) {
        self.state
            .lock()
            .await
            .files
            .insert(path.into(), data.into());
    }

    /// Whether a write lease, live or left by a dead writer, sits on `path`.
    pub async fn lease_held(&self, path: &Path) -> bool {
        self.state.lock().await.leases.contains_key(path)
    }
}

fn not_found(path: &Path) -> io::Error {
    io::Error::new(
        io::ErrorKind::NotFound,
        format!("{} does not exist", path.display()),
    )
}

impl LogStore for MemLogStore {
    type Writer = MemLogWriter;

    async fn exists(&self, path: &Path) -> io::Result<bool> {
        Ok(self.state.lock().await.files.contains_key(path))
    }

    async fn read(&self, path: &Path) -> io::Result<Vec<u8>> {
        self.contents(path).await.ok_or_else(|| not_found(path))
    }

    async fn create(&self, path: &Path) -> io::Result<MemLogWriter> {
        self.state
            .lock()
            .await
            .files
            .insert(path.to_path_buf(), Vec::new());
        Ok(MemLogWriter {
            state: Arc::clone(&self.state),
            path: path.to_path_buf(),
            pending: Vec::new(),
            lease: None,
        })
    }

    async fn append(&self, path: &Path) -> io::Result<MemLogWriter> {
        let mut state = self.state.lock().await;
        if state.leases.contains_key(path) {
            return Err(io::Error::new(
                io::ErrorKind::AlreadyExists,
                format!("write lease on {} is held", path.display()),
            ));
        }
        let alive = Arc::new(AtomicBool::new(true));
        state
            .leases
            .insert(path.to_path_buf(), Arc::clone(&alive));
        state.files.entry(path.to_path_buf()).or_default();
        Ok(MemLogWriter {
            state: Arc::clone(&self.state),
            path: path.to_path_buf(),
            pending: Vec::new(),
            lease: Some(alive),
        })
    }

    async fn rename(&self, from: &Path, to: &Path) -> io::Result<()> {
        let mut state = self.state.lock().await;
        let data = state.files.remove(from).ok_or_else(|| not_found(from))?;
        state.files.insert(to.to_path_buf(), data);
        Ok(())
    }

    async fn remove(&self, path: &Path) -> io::Result<()> {
        self.state
            .lock()
            .await
            .files
            .remove(path)
            .map(|_| ())
            .ok_or_else(|| not_found(path))
    }

    async fn recover_lease(&self, path: &Path) -> io::Result<LeaseStatus> {
        let mut state = self.state.lock().await;
        let status = match state.leases.get(path) {
            None => LeaseStatus::Free,
            Some(alive) if alive.load(Ordering::Acquire) => LeaseStatus::Held {
                owner: "in-memory writer".to_string(),
            },
            Some(_) => LeaseStatus::Reclaimed,
        };
        if status == LeaseStatus::Reclaimed {
            state.leases.remove(path);
        }
        Ok(status)
    }
}

impl LogWriter for MemLogWriter {
    async fn write_all(&mut self, buf: &[u8]) -> io::Result<()> {
        self.pending.extend_from_slice(buf);
        Ok(())
    }

    async fn sync(&mut self) -> io::Result<()> {
        let mut state = self.state.lock().await;
        let file = state
            .files
            .get_mut(&self.path)
            .ok_or_else(|| not_found(&self.path))?;
        file.append(&mut self.pending);
        Ok(())
    }

    async fn close(mut self) -> io::Result<()> {
        self.sync().await?;
        if let Some(alive) = self.lease.take() {
            alive.store(false, Ordering::Release);
            let mut state = self.state.lock().await;
            if state
                .leases
                .get(&self.path)
                .is_some_and(|held| Arc::ptr_eq(held, &alive))
            {
                state.leases.remove(&self.path);
            }
        }
        Ok(())
    }
}

impl Drop for MemLogWriter {
    fn drop(&mut self) {
        if let Some(alive) = &self.lease {
            alive.store(false, Ordering::Release);
        }
    }
}
