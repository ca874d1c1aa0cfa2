mod daemon;
mod io;
mod logging;
mod rpc;

#[cfg(test)]
mod test_utils;

use clap::Parser;
use daemon::{
    CodeStyle, EditFormatRequest, FormatterConfigBuilder, FormatterSession, TerminationReporter,
};
use logging::{LogConfig, init_logging};

use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::info;

/// CLI arguments for the formatter daemon client
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// File to format
    #[arg(value_name = "FILE")]
    file: PathBuf,

    /// Path to the formatter daemon binary (overrides FMTD_PATH env var)
    #[arg(long, value_name = "PATH")]
    daemon_path: Option<String>,

    /// Launch the daemon on a remote host over SSH
    #[arg(long, value_name = "HOST")]
    ssh_host: Option<String>,

    /// Offset of the selection to format
    #[arg(long, value_name = "OFFSET")]
    selection_offset: Option<i64>,

    /// Length of the selection to format
    #[arg(long, value_name = "LENGTH")]
    selection_length: Option<i64>,

    /// Format only the selection instead of the whole file
    #[arg(long)]
    selection_only: bool,

    /// Line length to wrap at
    #[arg(long, value_name = "COLUMNS")]
    line_length: Option<u32>,

    /// Code style profile (0 = daemon default)
    #[arg(long, value_name = "CODE")]
    style: Option<u32>,

    /// Per-request timeout in seconds
    #[arg(long, value_name = "SECONDS")]
    request_timeout: Option<u64>,

    /// Extra arguments passed through to the daemon
    #[arg(long = "daemon-arg", value_name = "ARG")]
    daemon_args: Vec<String>,

    /// Daemon-side instrumentation log file
    #[arg(long, value_name = "FILE")]
    instrumentation_log_file: Option<PathBuf>,

    /// Log level (overrides RUST_LOG env var)
    #[arg(long, value_name = "LEVEL")]
    log_level: Option<String>,

    /// Log file path (overrides FMTD_LOG_FILE env var)
    #[arg(long, value_name = "FILE")]
    log_file: Option<PathBuf>,
}

/// Resolve the daemon binary path from CLI args and environment
fn resolve_daemon_path(daemon_path_arg: Option<String>) -> String {
    // Priority: CLI arg > FMTD_PATH env var > "fmtd" default
    daemon_path_arg
        .or_else(|| std::env::var("FMTD_PATH").ok())
        .unwrap_or_else(|| "fmtd".to_string())
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    // Initialize logging with configuration from env vars and CLI args
    let log_config = LogConfig::from_env().with_overrides(args.log_level.clone(), args.log_file.clone());

    if let Err(e) = init_logging(log_config) {
        eprintln!("Failed to initialize logging: {e}");
        std::process::exit(1);
    }

    let daemon_path = resolve_daemon_path(args.daemon_path.clone());
    info!("Using formatter daemon: {}", daemon_path);

    let mut builder = FormatterConfigBuilder::new()
        .binary_path(&daemon_path)
        .add_args(args.daemon_args.clone());

    if let Some(host) = &args.ssh_host {
        builder = builder.ssh_host(host);
    }
    if let Some(length) = args.line_length {
        builder = builder.line_length(length);
    }
    if let Some(code) = args.style {
        builder = builder.code_style(CodeStyle { code });
    }
    if let Some(seconds) = args.request_timeout {
        builder = builder.request_timeout(Duration::from_secs(seconds));
    }
    if let Some(path) = &args.instrumentation_log_file {
        builder = builder.instrumentation_log_file(path);
    }

    let config = match builder.build() {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Invalid configuration: {e}");
            std::process::exit(1);
        }
    };

    let reporter = Arc::new(TerminationReporter::new());
    let session = FormatterSession::spawn(config, reporter).await?;

    // Held until exit; dropping it would unregister the callback
    let _termination_reports = session.reporter().subscribe(|report| {
        if report.during_startup {
            eprintln!("The formatter daemon could not be started.");
        } else {
            eprintln!("The formatter daemon terminated unexpectedly.");
        }
    });

    session.wait_ready().await?;
    let client = session.client();
    info!(
        "Formatter daemon ready: version {}",
        client.capabilities().version()
    );

    let mut request = EditFormatRequest::whole_file(args.file.to_string_lossy());
    if let Some(offset) = args.selection_offset {
        request.selection_offset = offset;
    }
    if let Some(length) = args.selection_length {
        request.selection_length = length;
    }
    if args.selection_only {
        request.selection_only = Some(true);
    }

    let started = Instant::now();
    let response = session.format(request).await;
    crate::log_timing!(tracing::Level::DEBUG, "edit.format", started.elapsed());

    let response = match response {
        Ok(response) => response,
        Err(e) => {
            eprintln!("Format failed: {e}");
            session.close().await.ok();
            std::process::exit(1);
        }
    };

    println!("{}", serde_json::to_string_pretty(&response)?);

    session.close().await?;
    Ok(())
}
