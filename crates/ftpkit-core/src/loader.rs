//! Transfer orchestrator: dispatches uploads and downloads by source and
//! destination shape, then fans batches out over worker threads.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use futures_util::stream::{FuturesUnordered, StreamExt};
use tokio::sync::Semaphore;
use tracing::{error, info, warn};

use crate::fs::FtpFileSystem;
use crate::params::ConnectionParameters;
use crate::pool::FtpPool;
use crate::transfer;
use crate::types::FtpKitError;

pub const DEFAULT_LOG_INTERVAL: usize = 10;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TransferDirection {
    Download,
    Upload,
}

impl TransferDirection {
    fn progress_prefix(&self) -> &'static str {
        match self {
            Self::Download => "Downloaded",
            Self::Upload => "Uploaded",
        }
    }

    fn finished_prefix(&self) -> &'static str {
        match self {
            Self::Download => "All downloads finished",
            Self::Upload => "All uploads finished",
        }
    }
}

/// Destination of a batch transfer: either one directory receiving every
/// file, or one explicit path per source.
#[derive(Debug, Clone)]
pub enum BatchDest {
    Dir(PathBuf),
    Paths(Vec<PathBuf>),
}

/// High-level upload/download front end over the transfer engine and the
/// FTP file system.
pub struct FtpLoader {
    params: ConnectionParameters,
    workers: Arc<Semaphore>,
    log_interval: usize,
}

impl FtpLoader {
    pub fn new(params: ConnectionParameters) -> Result<Self, FtpKitError> {
        params.validate()?;
        let workers = Arc::new(Semaphore::new(params.max_workers));
        Ok(Self {
            params,
            workers,
            log_interval: DEFAULT_LOG_INTERVAL,
        })
    }

    pub fn log_interval(&self) -> usize {
        self.log_interval
    }

    /// How many completions pass between progress log lines.
    pub fn set_log_interval(&mut self, interval: usize) -> Result<(), FtpKitError> {
        if interval == 0 {
            return Err(FtpKitError::Config(
                "log_interval must be a positive integer".to_string(),
            ));
        }
        self.log_interval = interval;
        Ok(())
    }

    /// Download a remote file or directory tree.
    ///
    /// Shape dispatch: file→file, file→directory, and directory→directory
    /// (tree walk preserving relative paths). A trailing `*` on the source
    /// means "all contents" and is stripped.
    pub async fn download(&self, src: &str, dst: &str) -> Result<(), FtpKitError> {
        let src = src.trim_end_matches('*');
        match (is_dir_path(src), is_dir_path(dst)) {
            (false, false) => {
                self.download_many(
                    &[PathBuf::from(src)],
                    BatchDest::Paths(vec![PathBuf::from(dst)]),
                )
                .await
            }
            (false, true) => {
                self.download_many(&[PathBuf::from(src)], BatchDest::Dir(PathBuf::from(dst)))
                    .await
            }
            (true, false) => {
                error!("Only directory destinations are valid for directory sources.");
                Err(FtpKitError::Config(format!(
                    "Cannot download a directory into: {dst}"
                )))
            }
            (true, true) => {
                let fs = self.filesystem().await?;
                let collected = collect_remote_tree(&fs, src, dst).await;
                let closed = fs.close().await;
                let pairs = collected?;
                closed?;

                if pairs.is_empty() {
                    warn!("No files were found in the remote directory: {src}");
                    return Ok(());
                }
                let (srcs, dsts): (Vec<_>, Vec<_>) = pairs.into_iter().unzip();
                self.download_many(&srcs, BatchDest::Paths(dsts)).await
            }
        }
    }

    /// Download a batch of remote files. Directory paths are rejected on
    /// both sides; an explicit destination list must match the source list
    /// in length.
    pub async fn download_many(
        &self,
        srcs: &[PathBuf],
        dst: BatchDest,
    ) -> Result<(), FtpKitError> {
        if srcs
            .iter()
            .any(|src| is_dir_path(&src.to_string_lossy()))
        {
            error!("It is not feasible to handle directories during FTP batch downloading.");
            return Err(FtpKitError::Config(
                "Only file paths are allowed for batch downloads.".to_string(),
            ));
        }
        let dsts = resolve_batch_destinations(srcs, dst)?;
        self.run_batch(srcs, &dsts, TransferDirection::Download)
            .await
    }

    /// Upload a local file or directory tree.
    ///
    /// The source side is classified with real filesystem metadata; the
    /// remote destination side with the path-shape classifier.
    pub async fn upload(&self, src: &str, dst: &str) -> Result<(), FtpKitError> {
        let src = src.trim_end_matches('*');
        let src_path = Path::new(src);
        match (src_path.is_dir(), is_dir_path(dst)) {
            (false, false) => {
                self.upload_many(
                    &[PathBuf::from(src)],
                    BatchDest::Paths(vec![PathBuf::from(dst)]),
                )
                .await
            }
            (false, true) => {
                self.upload_many(&[PathBuf::from(src)], BatchDest::Dir(PathBuf::from(dst)))
                    .await
            }
            (true, false) => {
                error!("Only directory destinations are valid for directory sources.");
                Err(FtpKitError::Config(format!(
                    "Cannot upload a directory into: {dst}"
                )))
            }
            (true, true) => {
                let files = collect_local_files(src_path)?;
                if files.is_empty() {
                    warn!("No files were found in the local directory: {src}");
                    return Ok(());
                }
                let dsts = map_through_base(&files, src_path, Path::new(dst));
                self.upload_many(&files, BatchDest::Paths(dsts)).await
            }
        }
    }

    /// Upload a batch of local files. All destination parent directories
    /// are created in one pass before any transfer begins, so the parallel
    /// uploads never collide on server-side `MKD`.
    pub async fn upload_many(&self, srcs: &[PathBuf], dst: BatchDest) -> Result<(), FtpKitError> {
        if srcs.iter().any(|src| src.is_dir()) {
            error!("It is not feasible to handle directories during FTP batch uploading.");
            return Err(FtpKitError::Config(
                "Only file paths are allowed for batch uploads.".to_string(),
            ));
        }
        let dsts = resolve_batch_destinations(srcs, dst)?;

        let parents = distinct_parents(&dsts);
        if !parents.is_empty() {
            let fs = self.filesystem().await?;
            let made = fs.makedirs(&parents).await;
            let closed = fs.close().await;
            made?;
            closed?;
        }

        self.run_batch(srcs, &dsts, TransferDirection::Upload).await
    }

    /// Open a file system whose pool borrows this loader's worker permits.
    async fn filesystem(&self) -> Result<FtpFileSystem, FtpKitError> {
        let pool = Arc::new(FtpPool::with_workers(
            self.params.clone(),
            self.workers.clone(),
        ));
        pool.open().await?;
        Ok(FtpFileSystem::from_pool(self.params.clone(), pool))
    }

    /// Fan one worker-thread job per transfer out over the permit budget,
    /// consuming completions as they finish. The first failure aborts the
    /// batch; unfinished jobs are dropped and their results discarded.
    async fn run_batch(
        &self,
        srcs: &[PathBuf],
        dsts: &[PathBuf],
        direction: TransferDirection,
    ) -> Result<(), FtpKitError> {
        let total = srcs.len();
        let mut jobs: FuturesUnordered<_> = srcs
            .iter()
            .zip(dsts)
            .map(|(src, dst)| {
                let params = self.params.clone();
                let workers = self.workers.clone();
                let src = src.clone();
                let dst = dst.clone();
                async move {
                    let permit = workers
                        .acquire_owned()
                        .await
                        .map_err(|_| FtpKitError::Cancelled)?;
                    tokio::task::spawn_blocking(move || {
                        let _permit = permit;
                        match direction {
                            TransferDirection::Download => {
                                transfer::download_file(&params, &src.to_string_lossy(), &dst)
                            }
                            TransferDirection::Upload => {
                                transfer::upload_file(&params, &src, &dst.to_string_lossy())
                            }
                        }
                    })
                    .await
                    .map_err(|e| FtpKitError::Ftp(format!("Transfer task failed: {e}")))?
                    .map(|_| ())
                }
            })
            .collect();

        let mut completed = 0usize;
        while let Some(result) = jobs.next().await {
            result?;
            completed += 1;
            if completed % self.log_interval == 0 {
                info!("{}: {} / {}", direction.progress_prefix(), completed, total);
            }
        }
        info!("{}: {} / {}", direction.finished_prefix(), total, total);
        Ok(())
    }
}

/// Whether a path string names a directory: it ends with the separator, or
/// its basename has no extension and is not hidden.
pub(crate) fn is_dir_path(path: &str) -> bool {
    if path.ends_with('/') {
        return true;
    }
    let path = Path::new(path);
    let hidden = path
        .file_name()
        .map(|name| name.to_string_lossy().starts_with('.'))
        .unwrap_or(false);
    !(hidden || path.extension().is_some())
}

/// Expand a batch destination into one concrete path per source.
fn resolve_batch_destinations(
    srcs: &[PathBuf],
    dst: BatchDest,
) -> Result<Vec<PathBuf>, FtpKitError> {
    match dst {
        BatchDest::Dir(dir) => Ok(srcs
            .iter()
            .map(|src| dir.join(src.file_name().unwrap_or_default()))
            .collect()),
        BatchDest::Paths(paths) => {
            if paths.len() != srcs.len() {
                error!("Length of source list does not match length of destination list.");
                return Err(FtpKitError::Config(
                    "Source and destination path counts must be equal.".to_string(),
                ));
            }
            if paths
                .iter()
                .any(|path| is_dir_path(&path.to_string_lossy()))
            {
                error!("One or more target paths are directories.");
                return Err(FtpKitError::Config(
                    "Directories are not supported in an explicit destination list.".to_string(),
                ));
            }
            Ok(paths)
        }
    }
}

/// Distinct parent directories of the destinations, for the `makedirs`
/// pre-pass.
fn distinct_parents(dsts: &[PathBuf]) -> Vec<PathBuf> {
    let mut parents: Vec<PathBuf> = dsts
        .iter()
        .filter_map(|dst| dst.parent())
        .filter(|parent| !parent.as_os_str().is_empty())
        .map(Path::to_path_buf)
        .collect();
    parents.sort();
    parents.dedup();
    parents
}

/// Map every file under `base` to the same relative location under `dst`.
/// A file equal to `base` itself keeps only its basename.
fn map_through_base(files: &[PathBuf], base: &Path, dst: &Path) -> Vec<PathBuf> {
    files
        .iter()
        .map(|file| match file.strip_prefix(base) {
            Ok(relative) if !relative.as_os_str().is_empty() => dst.join(relative),
            _ => dst.join(file.file_name().unwrap_or_default()),
        })
        .collect()
}

/// Recursively enumerate every regular file under `root`, sorted for
/// deterministic batch ordering.
fn collect_local_files(root: &Path) -> Result<Vec<PathBuf>, FtpKitError> {
    let mut files = Vec::new();
    let mut stack = vec![root.to_path_buf()];
    while let Some(dir) = stack.pop() {
        let entries = std::fs::read_dir(&dir).map_err(|e| {
            FtpKitError::LocalIo(format!(
                "Failed to read local directory {}: {e}",
                dir.display()
            ))
        })?;
        for entry in entries {
            let entry = entry.map_err(|e| {
                FtpKitError::LocalIo(format!(
                    "Failed to read an entry of {}: {e}",
                    dir.display()
                ))
            })?;
            let file_type = entry.file_type().map_err(|e| {
                FtpKitError::LocalIo(format!("Failed to stat {}: {e}", entry.path().display()))
            })?;
            if file_type.is_dir() {
                stack.push(entry.path());
            } else {
                files.push(entry.path());
            }
        }
    }
    files.sort();
    Ok(files)
}

/// Walk the remote tree under `src`, pairing every file with its
/// destination below `dst` (relative paths preserved).
async fn collect_remote_tree(
    fs: &FtpFileSystem,
    src: &str,
    dst: &str,
) -> Result<Vec<(PathBuf, PathBuf)>, FtpKitError> {
    let src_root = PathBuf::from(src);
    let dst_root = PathBuf::from(dst);
    let mut pairs = Vec::new();

    let mut walk = fs.walk(&src_root);
    while let Some(item) = walk.next().await {
        let entry = item?;
        for file in entry.files {
            let target = match file.strip_prefix(&src_root) {
                Ok(relative) => dst_root.join(relative),
                Err(_) => dst_root.join(file.file_name().unwrap_or_default()),
            };
            pairs.push((file, target));
        }
    }
    Ok(pairs)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::params::Credentials;

    fn loader() -> FtpLoader {
        let params =
            ConnectionParameters::new("127.0.0.1", Credentials::new("test", "test")).unwrap();
        FtpLoader::new(params).unwrap()
    }

    #[test]
    fn test_is_dir_path() {
        assert!(is_dir_path("/"));
        assert!(is_dir_path("/images/"));
        assert!(is_dir_path("/images"));
        assert!(is_dir_path("images"));
        assert!(!is_dir_path("/a/b.txt"));
        assert!(!is_dir_path("archive.tar.gz"));
        assert!(!is_dir_path("/.hidden"));
        assert!(!is_dir_path(".env"));
        assert!(is_dir_path("/.hidden/"));
    }

    #[test]
    fn test_log_interval_rejects_zero() {
        let mut loader = loader();
        assert_eq!(loader.log_interval(), DEFAULT_LOG_INTERVAL);
        assert!(loader.set_log_interval(0).is_err());
        loader.set_log_interval(1).unwrap();
        assert_eq!(loader.log_interval(), 1);
    }

    #[test]
    fn test_resolve_batch_destinations_into_directory() {
        let srcs = vec![PathBuf::from("/a/1.png"), PathBuf::from("/b/c/2.png")];
        let dsts =
            resolve_batch_destinations(&srcs, BatchDest::Dir(PathBuf::from("./out"))).unwrap();
        assert_eq!(
            dsts,
            vec![PathBuf::from("./out/1.png"), PathBuf::from("./out/2.png")]
        );
    }

    #[test]
    fn test_resolve_batch_destinations_zips_explicit_paths() {
        let srcs = vec![PathBuf::from("/a/1.png"), PathBuf::from("/a/2.png")];
        let paths = vec![PathBuf::from("x/1.png"), PathBuf::from("x/2.png")];
        let dsts =
            resolve_batch_destinations(&srcs, BatchDest::Paths(paths.clone())).unwrap();
        assert_eq!(dsts, paths);
    }

    #[test]
    fn test_resolve_batch_destinations_rejects_length_mismatch() {
        let srcs = vec![PathBuf::from("/a/1.png"), PathBuf::from("/a/2.png")];
        let err = resolve_batch_destinations(&srcs, BatchDest::Paths(vec!["x/1.png".into()]))
            .unwrap_err();
        assert!(matches!(err, FtpKitError::Config(_)));
    }

    #[test]
    fn test_resolve_batch_destinations_rejects_directory_targets() {
        let srcs = vec![PathBuf::from("/a/1.png")];
        let err =
            resolve_batch_destinations(&srcs, BatchDest::Paths(vec!["out/".into()])).unwrap_err();
        assert!(matches!(err, FtpKitError::Config(_)));
    }

    #[tokio::test]
    async fn test_download_many_rejects_directory_sources() {
        let err = loader()
            .download_many(
                &[PathBuf::from("/images/")],
                BatchDest::Dir(PathBuf::from("./out")),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, FtpKitError::Config(_)));
    }

    #[tokio::test]
    async fn test_download_rejects_directory_to_file() {
        let err = loader().download("/images/", "./out.txt").await.unwrap_err();
        assert!(matches!(err, FtpKitError::Config(_)));
    }

    #[test]
    fn test_distinct_parents() {
        let dsts = vec![
            PathBuf::from("/images/a.png"),
            PathBuf::from("/images/b.png"),
            PathBuf::from("/images/test/c.png"),
            PathBuf::from("/d.png"),
        ];
        assert_eq!(
            distinct_parents(&dsts),
            vec![
                PathBuf::from("/"),
                PathBuf::from("/images"),
                PathBuf::from("/images/test"),
            ]
        );
    }

    #[test]
    fn test_map_through_base() {
        let base = PathBuf::from("tmp");
        let files = vec![
            PathBuf::from("tmp/1.txt"),
            PathBuf::from("tmp/1/1.txt"),
            PathBuf::from("tmp/2/2.txt"),
        ];
        assert_eq!(
            map_through_base(&files, &base, Path::new("/")),
            vec![
                PathBuf::from("/1.txt"),
                PathBuf::from("/1/1.txt"),
                PathBuf::from("/2/2.txt"),
            ]
        );
    }

    #[test]
    fn test_collect_local_files() {
        let tmp = tempfile::TempDir::new().unwrap();
        std::fs::write(tmp.path().join("1.txt"), "one").unwrap();
        std::fs::create_dir(tmp.path().join("sub")).unwrap();
        std::fs::write(tmp.path().join("sub").join("2.txt"), "two").unwrap();

        let files = collect_local_files(tmp.path()).unwrap();
        assert_eq!(
            files,
            vec![tmp.path().join("1.txt"), tmp.path().join("sub/2.txt")]
        );
    }

    #[test]
    fn test_collect_local_files_missing_root() {
        let tmp = tempfile::TempDir::new().unwrap();
        let err = collect_local_files(&tmp.path().join("missing")).unwrap_err();
        assert!(matches!(err, FtpKitError::LocalIo(_)));
    }

    #[tokio::test]
    #[ignore = "requires a live FTP server on 127.0.0.1:21"]
    async fn test_upload_download_round_trip() {
        let tmp = tempfile::TempDir::new().unwrap();
        std::fs::write(tmp.path().join("1.txt"), "one").unwrap();
        std::fs::create_dir(tmp.path().join("1")).unwrap();
        std::fs::write(tmp.path().join("1").join("1.txt"), "nested one").unwrap();
        std::fs::create_dir(tmp.path().join("2")).unwrap();
        std::fs::write(tmp.path().join("2").join("2.txt"), "nested two").unwrap();

        let params =
            ConnectionParameters::new("127.0.0.1", Credentials::new("test", "test")).unwrap();
        let mut loader = FtpLoader::new(params.clone()).unwrap();
        loader.set_log_interval(1).unwrap();

        loader
            .upload(&tmp.path().display().to_string(), "/")
            .await
            .unwrap();

        let out = tempfile::TempDir::new().unwrap();
        loader
            .download("/", &format!("{}/", out.path().display()))
            .await
            .unwrap();

        assert_eq!(std::fs::read_to_string(out.path().join("1.txt")).unwrap(), "one");
        assert_eq!(
            std::fs::read_to_string(out.path().join("1/1.txt")).unwrap(),
            "nested one"
        );
        assert_eq!(
            std::fs::read_to_string(out.path().join("2/2.txt")).unwrap(),
            "nested two"
        );

        let fs = crate::fs::FtpFileSystem::open(params).await.unwrap();
        fs.rmtree("/").await.unwrap();
        fs.close().await.unwrap();
    }
}
