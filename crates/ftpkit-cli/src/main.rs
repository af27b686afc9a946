use std::path::{Path, PathBuf};

use clap::{ArgAction, Parser, Subcommand};
use tracing::{error, info};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

use ftpkit_core::loader::{BatchDest, FtpLoader};
use ftpkit_core::params::{ConnectionParameters, Credentials};
use ftpkit_core::types::FtpKitError;

/// POSIX EX_CONFIG: configuration or validation failure.
const EXIT_CONFIG: i32 = 78;

#[derive(Parser)]
#[command(
    name = "ftpkit",
    version,
    disable_version_flag = true,
    about = "A command-line tool for FTP file transfers and management."
)]
struct Cli {
    #[arg(short = 'v', long = "version", action = ArgAction::Version, help = "Print version")]
    version: Option<bool>,

    /// FTP server host name.
    #[arg(short = 'H', long, env = "FTPKIT_HOST")]
    host: String,

    /// FTP server port; 0 omits the port from URLs.
    #[arg(short = 'P', long, env = "FTPKIT_PORT", default_value_t = 21)]
    port: u16,

    #[arg(short = 'u', long, env = "FTPKIT_USERNAME")]
    username: String,

    #[arg(short = 'p', long, env = "FTPKIT_PASSWORD", hide_env_values = true)]
    password: String,

    /// Connect and pool-initialization timeout in seconds.
    #[arg(long, env = "FTPKIT_TIMEOUT", default_value_t = 30)]
    timeout: u64,

    /// Size of the FTP connection pool.
    #[arg(long, env = "FTPKIT_MAX_CONNECTIONS", default_value_t = 10)]
    max_connections: usize,

    /// Worker-thread budget; three times the pool size is a good default.
    #[arg(long, env = "FTPKIT_MAX_WORKERS", default_value_t = 30)]
    max_workers: usize,

    /// Completions between transfer progress log lines.
    #[arg(long, env = "FTPKIT_LOG_INTERVAL", default_value_t = 10)]
    log_interval: usize,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Download files or directories.
    Download {
        /// Remote file(s) or directory(ies) on the FTP server to download.
        #[arg(short, long, required = true, num_args = 1.., value_name = "SRC")]
        src: Vec<String>,

        /// Local destination path(s) for the downloaded files.
        #[arg(short, long, required = true, num_args = 1.., value_name = "DST")]
        dst: Vec<String>,
    },
    /// Upload local files or directories.
    Upload {
        /// Local file(s) or directory(ies) to upload to the FTP server.
        #[arg(short, long, required = true, num_args = 1.., value_name = "SRC")]
        src: Vec<String>,

        /// Remote destination path(s) on the FTP server.
        #[arg(short, long, required = true, num_args = 1.., value_name = "DST")]
        dst: Vec<String>,
    },
}

fn init_logging() {
    let log_path = std::env::var("FTPKIT_LOG_PATH")
        .map(PathBuf::from)
        .unwrap_or_else(|_| std::env::temp_dir().join("ftpkit.log"));
    let log_dir = log_path
        .parent()
        .filter(|parent| !parent.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."))
        .to_path_buf();
    let log_file = log_path
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_else(|| "ftpkit.log".to_string());
    let file_appender = tracing_appender::rolling::never(log_dir, log_file);

    let filter = EnvFilter::try_from_env("FTPKIT_LOG").unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .with(
            tracing_subscriber::fmt::layer()
                .with_ansi(false)
                .with_writer(file_appender),
        )
        .init();
}

fn connection_parameters(cli: &Cli) -> Result<ConnectionParameters, FtpKitError> {
    let mut params = ConnectionParameters::new(
        cli.host.clone(),
        Credentials::new(cli.username.clone(), cli.password.clone()),
    )?;
    params.port = cli.port;
    params.timeout_secs = cli.timeout;
    params.max_connections = cli.max_connections;
    params.max_workers = cli.max_workers;
    params.validate()?;
    Ok(params)
}

/// Single-item source and destination lists are demoted to the scalar entry
/// points, which adds directory-tree dispatch; a single destination with
/// several sources means "into this directory".
async fn run_download(
    loader: &FtpLoader,
    srcs: &[String],
    dsts: &[String],
) -> Result<(), FtpKitError> {
    if srcs.len() == 1 && dsts.len() == 1 {
        return loader.download(&srcs[0], &dsts[0]).await;
    }
    let src_paths: Vec<PathBuf> = srcs.iter().map(PathBuf::from).collect();
    if dsts.len() == 1 {
        loader
            .download_many(&src_paths, BatchDest::Dir(PathBuf::from(&dsts[0])))
            .await
    } else {
        loader
            .download_many(
                &src_paths,
                BatchDest::Paths(dsts.iter().map(PathBuf::from).collect()),
            )
            .await
    }
}

async fn run_upload(
    loader: &FtpLoader,
    srcs: &[String],
    dsts: &[String],
) -> Result<(), FtpKitError> {
    if srcs.len() == 1 && dsts.len() == 1 {
        return loader.upload(&srcs[0], &dsts[0]).await;
    }
    let src_paths: Vec<PathBuf> = srcs.iter().map(PathBuf::from).collect();
    if dsts.len() == 1 {
        loader
            .upload_many(&src_paths, BatchDest::Dir(PathBuf::from(&dsts[0])))
            .await
    } else {
        loader
            .upload_many(
                &src_paths,
                BatchDest::Paths(dsts.iter().map(PathBuf::from).collect()),
            )
            .await
    }
}

fn exit_code_for(err: &FtpKitError) -> i32 {
    match err {
        FtpKitError::Config(_) => EXIT_CONFIG,
        _ => 1,
    }
}

async fn run() -> i32 {
    // Load a .env from the working directory first; explicit flags and
    // real environment variables take precedence.
    dotenvy::dotenv().ok();

    let cli = Cli::parse();
    init_logging();

    let params = match connection_parameters(&cli) {
        Ok(params) => params,
        Err(e) => {
            error!("Failed to load configuration.");
            error!("{e}");
            return EXIT_CONFIG;
        }
    };

    let mut loader = match FtpLoader::new(params) {
        Ok(loader) => loader,
        Err(e) => {
            error!("{e}");
            return EXIT_CONFIG;
        }
    };
    if let Err(e) = loader.set_log_interval(cli.log_interval) {
        error!("{e}");
        return EXIT_CONFIG;
    }

    let operation = async {
        match &cli.command {
            Command::Download { src, dst } => run_download(&loader, src, dst).await,
            Command::Upload { src, dst } => run_upload(&loader, src, dst).await,
        }
    };

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("Abort this program runtime as a consequence of a keyboard interrupt.");
            0
        }
        result = operation => match result {
            Ok(()) => 0,
            Err(e) => {
                error!("An unexpected error occurred at this program runtime: {e}");
                exit_code_for(&e)
            }
        }
    }
}

#[tokio::main]
async fn main() {
    let code = run().await;
    std::process::exit(code);
}
