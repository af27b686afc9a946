//! FTP-backed virtual file system.
//!
//! Emulates directory operations for trees stored on a remote FTP server,
//! layered on a managed pool of pre-authenticated control sessions so that
//! handshake and login overhead never dominates latency.

use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use futures_util::stream::{FuturesUnordered, StreamExt};
use tokio::sync::{mpsc, Notify};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

use crate::ftp::FtpSession;
use crate::params::ConnectionParameters;
use crate::pool::{FtpPool, PooledFtp};
use crate::trie::{self, PathTrie};
use crate::types::FtpKitError;

/// One directory visited during [`FtpFileSystem::walk`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WalkEntry {
    pub path: PathBuf,
    pub dirs: Vec<PathBuf>,
    pub files: Vec<PathBuf>,
}

pub struct FtpFileSystem {
    params: ConnectionParameters,
    pool: Arc<FtpPool>,
}

impl FtpFileSystem {
    /// Open a file system with its own connection pool.
    pub async fn open(params: ConnectionParameters) -> Result<Self, FtpKitError> {
        params.validate()?;
        let pool = Arc::new(FtpPool::new(params.clone()));
        pool.open().await?;
        Ok(Self { params, pool })
    }

    /// Wrap an already opened pool (shared with the orchestrator).
    pub fn from_pool(params: ConnectionParameters, pool: Arc<FtpPool>) -> Self {
        Self { params, pool }
    }

    pub fn pool(&self) -> &Arc<FtpPool> {
        &self.pool
    }

    pub async fn close(&self) -> Result<(), FtpKitError> {
        self.pool.close().await
    }

    /// Acquire a session, run `f` on a worker thread, release the session.
    async fn with_session<T, F>(&self, f: F) -> Result<T, FtpKitError>
    where
        F: FnOnce(&mut FtpSession) -> Result<T, FtpKitError> + Send + 'static,
        T: Send + 'static,
    {
        let mut pooled = self.pool.get().await?;
        let joined = self
            .pool
            .run_blocking(move || {
                let result = f(&mut pooled);
                (pooled, result)
            })
            .await;
        match joined {
            Ok((pooled, result)) => {
                self.pool.release(pooled).await?;
                result
            }
            // The worker thread died; its session closed with it.
            Err(e) => Err(e),
        }
    }

    /// List a remote directory, split into subdirectories and files.
    pub async fn listdir(
        &self,
        path: impl AsRef<Path>,
    ) -> Result<(Vec<PathBuf>, Vec<PathBuf>), FtpKitError> {
        let path = path.as_ref().to_path_buf();
        debug!("Listing remote directory: {}", path.display());
        self.with_session(move |session| list_dir_blocking(session, &path))
            .await
    }

    /// Traverse a remote directory tree in parallel.
    ///
    /// Spawns `max_workers` workers that share the pool; entries surface in
    /// unspecified cross-directory order. The first listing failure stops
    /// the whole walk. Dropping the returned [`Walk`] cancels the workers,
    /// each of which releases its pooled session.
    pub fn walk(&self, root: impl AsRef<Path>) -> Walk {
        let root = root.as_ref().to_path_buf();
        let cancel = CancellationToken::new();
        let (out_tx, out_rx) = mpsc::unbounded_channel();
        let queue = Arc::new(WalkQueue::new(root));

        for _ in 0..self.params.max_workers {
            tokio::spawn(walk_worker(
                self.pool.clone(),
                queue.clone(),
                out_tx.clone(),
                cancel.clone(),
            ));
        }

        Walk {
            output: out_rx,
            cancel,
            failed: false,
        }
    }

    /// Create every directory in `paths` on the server, including missing
    /// ancestors. Already-existing directories are skipped, so repeated
    /// calls are idempotent. Remote paths must be absolute.
    pub async fn makedirs<P: AsRef<Path>>(&self, paths: &[P]) -> Result<(), FtpKitError> {
        let mut paths_trie = PathTrie::new();
        for path in paths {
            let raw = path.as_ref().to_string_lossy();
            let normalized = trie::normalize(&raw);
            if normalized.is_empty() {
                continue;
            }
            if !normalized.starts_with('/') {
                return Err(FtpKitError::Config(format!(
                    "Remote paths must be absolute: {raw}"
                )));
            }
            paths_trie.insert(&normalized);
        }

        let targets = paths_trie.all_paths();
        if targets.is_empty() {
            return Ok(());
        }

        self.with_session(move |session| {
            for path in &targets {
                // The server root always exists.
                if path == "/" {
                    continue;
                }
                // CWD success means the directory is already there.
                if session.cwd(path).is_ok() {
                    continue;
                }
                debug!("Creating a new directory: {path}");
                session.mkdir(path).map_err(|e| {
                    error!("Remote directory could not be created: {e}");
                    FtpKitError::Ftp(format!(
                        "Unable to create directory on FTP server: {path}."
                    ))
                })?;
            }
            Ok(())
        })
        .await
    }

    /// Delete one remote file.
    pub async fn rm(&self, path: impl AsRef<Path>) -> Result<(), FtpKitError> {
        let path = path.as_ref().to_path_buf();
        self.with_session(move |session| {
            debug!("Attempting to delete: {}", path.display());
            session.rm(&path.to_string_lossy()).map_err(|e| {
                error!("Could not delete file due to an unexpected FTP server response: {e}");
                FtpKitError::Ftp(format!(
                    "FTP server refused to delete file: {}",
                    path.display()
                ))
            })?;
            debug!("File deletion succeeded: {}", path.display());
            Ok(())
        })
        .await
    }

    /// Recursively delete a remote directory tree: every file in parallel
    /// over the pool, then the directories children-first on one session.
    /// `/` itself is never removed.
    pub async fn rmtree(&self, path: impl AsRef<Path>) -> Result<(), FtpKitError> {
        let root = path.as_ref().to_path_buf();

        let mut dirs: VecDeque<PathBuf> = VecDeque::new();
        dirs.push_back(root.clone());
        let mut files: Vec<PathBuf> = Vec::new();

        let mut walk = self.walk(&root);
        while let Some(item) = walk.next().await {
            let entry = item?;
            dirs.extend(entry.dirs);
            files.extend(entry.files);
        }
        drop(walk);

        debug!("Deleting {} files from the FTP server...", files.len());
        let mut deletions: FuturesUnordered<_> =
            files.into_iter().map(|file| self.rm(file)).collect();
        let mut failed = false;
        while let Some(result) = deletions.next().await {
            if let Err(e) = result {
                error!("File deletion task failed: {e}");
                failed = true;
            }
        }
        if failed {
            return Err(FtpKitError::WalkWorker(
                "A file deletion task failed on the FTP server.".to_string(),
            ));
        }

        debug!("Deleting {} directories...", dirs.len());
        self.with_session(move |session| {
            while let Some(dir) = dirs.pop_back() {
                if dir == Path::new("/") {
                    continue;
                }
                debug!("Attempting to delete: {}", dir.display());
                session.rmdir(&dir.to_string_lossy()).map_err(|e| {
                    error!("Remote directory could not be removed: {e}");
                    FtpKitError::Ftp(format!(
                        "Failed to remove directory '{}' from the FTP server.",
                        dir.display()
                    ))
                })?;
                debug!("Remote directory removed: {}", dir.display());
            }
            Ok(())
        })
        .await
    }

    /// Whether the remote path is a directory (probed with `CWD`; the
    /// session's working directory is restored afterwards).
    pub async fn isdir(&self, path: impl AsRef<Path>) -> Result<bool, FtpKitError> {
        let path = path.as_ref().to_string_lossy().into_owned();
        self.with_session(move |session| {
            let previous = session.pwd().map_err(|e| {
                FtpKitError::Ftp(format!("Failed to check if path is a directory: {path}: {e}"))
            })?;
            if session.cwd(&path).is_err() {
                return Ok(false);
            }
            session.cwd(&previous).map_err(|e| {
                FtpKitError::Ftp(format!(
                    "Failed to restore the working directory to {previous}: {e}"
                ))
            })?;
            Ok(true)
        })
        .await
    }

    /// Whether the remote path is a regular file (probed with `SIZE`).
    pub async fn isfile(&self, path: impl AsRef<Path>) -> Result<bool, FtpKitError> {
        let path = path.as_ref().to_string_lossy().into_owned();
        self.with_session(move |session| Ok(session.size(&path).is_ok()))
            .await
    }
}

/// Run `LIST -a` in `path` and parse the Unix long-format output.
fn list_dir_blocking(
    session: &mut FtpSession,
    path: &Path,
) -> Result<(Vec<PathBuf>, Vec<PathBuf>), FtpKitError> {
    let lines = session.list_all(&path.to_string_lossy()).map_err(|e| {
        error!("The FTP server returned an error during directory listing: {e}");
        FtpKitError::Ftp(format!("Failed to list this directory: {}", path.display()))
    })?;
    Ok(parse_list_output(path, &lines))
}

/// Split `LIST -a` output lines into directory and file paths under `path`.
fn parse_list_output(path: &Path, lines: &[String]) -> (Vec<PathBuf>, Vec<PathBuf>) {
    let mut dirs = Vec::new();
    let mut files = Vec::new();

    for line in lines {
        // A valid line begins with a 10-character permission field.
        if line.is_empty() || line.len() < 10 {
            continue;
        }
        let Some(name) = name_field(line) else {
            continue;
        };
        if name == "." || name == ".." {
            continue;
        }
        // Symlink entries report "name -> target"; keep the link name.
        let name = if line.starts_with('l') {
            match name.split_once(" -> ") {
                Some((link, _)) => link,
                None => name,
            }
        } else {
            name
        };

        let abspath = path.join(name);
        if line.starts_with('d') {
            dirs.push(abspath);
        } else {
            files.push(abspath);
        }
    }

    (dirs, files)
}

/// The name portion of a Unix listing line: everything from the ninth
/// whitespace-separated field onward, so names containing spaces survive.
/// Lines with fewer fields fall back to their last field.
fn name_field(line: &str) -> Option<&str> {
    let mut rest = line.trim();
    for _ in 0..8 {
        let Some(split_at) = rest.find(char::is_whitespace) else {
            return line.split_whitespace().last();
        };
        rest = rest[split_at..].trim_start();
    }
    if rest.is_empty() {
        None
    } else {
        Some(rest)
    }
}

/// Shared state of one walk: the directory task queue and its in-flight
/// accounting.
struct WalkQueue {
    dirs: std::sync::Mutex<VecDeque<PathBuf>>,
    /// Directories discovered but not yet fully processed; the walk is
    /// complete when this drops to zero.
    pending: AtomicUsize,
    notify: Notify,
}

impl WalkQueue {
    fn new(root: PathBuf) -> Self {
        let mut dirs = VecDeque::new();
        dirs.push_back(root);
        Self {
            dirs: std::sync::Mutex::new(dirs),
            pending: AtomicUsize::new(1),
            notify: Notify::new(),
        }
    }

    fn push(&self, dir: PathBuf) {
        self.pending.fetch_add(1, Ordering::AcqRel);
        if let Ok(mut dirs) = self.dirs.lock() {
            dirs.push_back(dir);
        }
        self.notify.notify_one();
    }

    fn pop(&self) -> Option<PathBuf> {
        self.dirs.lock().ok().and_then(|mut dirs| dirs.pop_front())
    }

    /// Mark one directory as fully processed; true when it was the last.
    fn task_done(&self) -> bool {
        self.pending.fetch_sub(1, Ordering::AcqRel) == 1
    }
}

async fn walk_worker(
    pool: Arc<FtpPool>,
    queue: Arc<WalkQueue>,
    out: mpsc::UnboundedSender<Result<WalkEntry, FtpKitError>>,
    cancel: CancellationToken,
) {
    // Hold one pooled session for the lifetime of this worker.
    let mut pooled: PooledFtp = tokio::select! {
        _ = cancel.cancelled() => return,
        acquired = pool.get() => match acquired {
            Ok(pooled) => pooled,
            Err(e) => {
                let _ = out.send(Err(e));
                cancel.cancel();
                return;
            }
        },
    };

    loop {
        if cancel.is_cancelled() {
            break;
        }
        let Some(dir) = queue.pop() else {
            // Nothing queued right now: wait for more work or shutdown.
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = queue.notify.notified() => {}
            }
            continue;
        };

        let job = {
            let dir = dir.clone();
            let mut session = pooled;
            pool.run_blocking(move || {
                let listed = list_dir_blocking(&mut session, &dir);
                (session, listed)
            })
        };

        match job.await {
            Ok((session, Ok((dirs, files)))) => {
                pooled = session;
                for subdir in &dirs {
                    queue.push(subdir.clone());
                }
                let _ = out.send(Ok(WalkEntry {
                    path: dir,
                    dirs,
                    files,
                }));
                if queue.task_done() {
                    // All discovered directories processed; wake everyone up.
                    cancel.cancel();
                    break;
                }
            }
            Ok((session, Err(e))) => {
                pooled = session;
                let _ = out.send(Err(e));
                cancel.cancel();
                break;
            }
            Err(e) => {
                // The blocking job died and took the session with it.
                let _ = out.send(Err(e));
                cancel.cancel();
                return;
            }
        }
    }

    if let Err(e) = pool.release(pooled).await {
        warn!("Could not return a walk session to the pool: {e}");
    }
}

/// Async producer of [`WalkEntry`] values; see [`FtpFileSystem::walk`].
pub struct Walk {
    output: mpsc::UnboundedReceiver<Result<WalkEntry, FtpKitError>>,
    cancel: CancellationToken,
    failed: bool,
}

impl Walk {
    /// The next visited directory, or `None` once the traversal finished.
    /// The first worker error surfaces exactly once and ends the walk.
    pub async fn next(&mut self) -> Option<Result<WalkEntry, FtpKitError>> {
        if self.failed {
            return None;
        }
        match self.output.recv().await {
            Some(Ok(entry)) => Some(Ok(entry)),
            Some(Err(e)) => {
                self.failed = true;
                self.cancel.cancel();
                Some(Err(FtpKitError::WalkWorker(format!(
                    "Walk worker error: {e}"
                ))))
            }
            None => None,
        }
    }
}

impl Drop for Walk {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lines(raw: &[&str]) -> Vec<String> {
        raw.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_parse_list_output_mixed_entries() {
        let listing = lines(&[
            "drwxr-xr-x   2 owner group        4096 Oct 27 09:12 dir",
            "-rw-r--r--   1 owner group         512 Oct 27 09:15 text.txt",
            "lrwxrwxrwx   1 owner group          11 Oct 27 09:17 symlink -> test.txt",
            "",
            "error",
            "drwxr-xr-x   2 owner group        4096 Oct 27 09:20 .",
            "drwxr-xr-x   2 owner group        4096 Oct 27 09:21 ..",
        ]);
        let (dirs, files) = parse_list_output(Path::new("/"), &listing);

        assert_eq!(dirs, vec![PathBuf::from("/dir")]);
        assert_eq!(
            files,
            vec![PathBuf::from("/text.txt"), PathBuf::from("/symlink")]
        );
    }

    #[test]
    fn test_parse_list_output_name_with_spaces() {
        let listing = lines(&[
            "-rw-r--r--   1 owner group         512 Oct 27 09:15 with spaces.txt",
        ]);
        let (dirs, files) = parse_list_output(Path::new("/data"), &listing);

        assert!(dirs.is_empty());
        assert_eq!(files, vec![PathBuf::from("/data/with spaces.txt")]);
    }

    #[test]
    fn test_parse_list_output_skips_short_lines() {
        let listing = lines(&["-rw-r--r", "x", ""]);
        let (dirs, files) = parse_list_output(Path::new("/"), &listing);
        assert!(dirs.is_empty());
        assert!(files.is_empty());
    }

    #[test]
    fn test_parse_list_output_joins_under_listing_path() {
        let listing = lines(&[
            "drwxr-xr-x   2 owner group        4096 Oct 27 09:12 nested",
        ]);
        let (dirs, _) = parse_list_output(Path::new("/a/b"), &listing);
        assert_eq!(dirs, vec![PathBuf::from("/a/b/nested")]);
    }

    #[test]
    fn test_name_field_takes_ninth_field_onward() {
        let line = "lrwxrwxrwx   1 owner group          11 Oct 27 09:17 symlink -> test.txt";
        assert_eq!(name_field(line), Some("symlink -> test.txt"));
    }

    #[tokio::test]
    async fn test_makedirs_rejects_relative_remote_paths() {
        // Validation happens before any session is acquired, so a closed
        // pool never gets touched.
        let params = ConnectionParameters::new(
            "127.0.0.1",
            crate::params::Credentials::new("test", "test"),
        )
        .unwrap();
        let pool = Arc::new(FtpPool::new(params.clone()));
        let fs = FtpFileSystem::from_pool(params, pool);

        let err = fs.makedirs(&["relative/path"]).await.unwrap_err();
        assert!(matches!(err, FtpKitError::Config(_)));
    }

    #[tokio::test]
    async fn test_listdir_on_closed_pool() {
        let params = ConnectionParameters::new(
            "127.0.0.1",
            crate::params::Credentials::new("test", "test"),
        )
        .unwrap();
        let pool = Arc::new(FtpPool::new(params.clone()));
        let fs = FtpFileSystem::from_pool(params, pool);

        let err = fs.listdir("/").await.unwrap_err();
        assert!(matches!(err, FtpKitError::PoolNotOpen));
    }

    #[tokio::test]
    #[ignore = "requires a live FTP server on 127.0.0.1:21"]
    async fn test_makedirs_walk_rmtree_cycle() {
        let mut params = ConnectionParameters::new(
            "127.0.0.1",
            crate::params::Credentials::new("test", "test"),
        )
        .unwrap();
        params.max_connections = 2;
        params.max_workers = 4;
        let fs = FtpFileSystem::open(params).await.unwrap();

        fs.makedirs(&["/1"]).await.unwrap();
        fs.makedirs(&["/1/2/3"]).await.unwrap();
        fs.makedirs(&["/2/3", "/2/3/4", "/2/5"]).await.unwrap();
        // Second pass over existing directories must be a no-op.
        fs.makedirs(&["/1/2/3"]).await.unwrap();

        let expected = ["/1", "/1/2", "/1/2/3", "/2", "/2/3", "/2/3/4", "/2/5"];
        for dir in expected {
            assert!(fs.isdir(dir).await.unwrap(), "{dir} should exist");
        }

        let mut visited = Vec::new();
        let mut walk = fs.walk("/");
        while let Some(entry) = walk.next().await {
            visited.push(entry.unwrap().path);
        }
        drop(walk);
        assert_eq!(visited.len(), expected.len() + 1);

        fs.rmtree("/").await.unwrap();
        let (dirs, files) = fs.listdir("/").await.unwrap();
        assert!(dirs.is_empty());
        assert!(files.is_empty());

        fs.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_walk_surfaces_pool_errors_once() {
        // Workers cannot acquire sessions from a closed pool, so the walk
        // fails fast with a single worker error.
        let params = ConnectionParameters::new(
            "127.0.0.1",
            crate::params::Credentials::new("test", "test"),
        )
        .unwrap();
        let pool = Arc::new(FtpPool::new(params.clone()));
        let fs = FtpFileSystem::from_pool(params, pool);

        let mut walk = fs.walk("/");
        let first = walk.next().await;
        assert!(matches!(first, Some(Err(FtpKitError::WalkWorker(_)))));
        assert!(walk.next().await.is_none());
    }
}
