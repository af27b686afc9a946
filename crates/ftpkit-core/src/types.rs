// ─── Error Types ────────────────────────────────────

/// Errors surfaced by the FTP pool, file system, transfer engine and
/// orchestrator. Variants carry a message naming the failing path or
/// endpoint.
#[derive(Debug, thiserror::Error)]
pub enum FtpKitError {
    #[error("Config error: {0}")]
    Config(String),

    #[error("FTP error: {0}")]
    Ftp(String),

    #[error("Local I/O error: {0}")]
    LocalIo(String),

    #[error("Connection pool is not initialized or is closed.")]
    PoolNotOpen,

    #[error("{0}")]
    WalkWorker(String),

    #[error("Operation cancelled")]
    Cancelled,
}

impl From<FtpKitError> for String {
    fn from(err: FtpKitError) -> String {
        err.to_string()
    }
}
