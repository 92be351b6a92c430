//! Picobridge - device session broker
//!
//! Accepts persistent TCP connections from embedded devices and exposes each
//! one to local processes as a file pair or a pseudo-terminal.

use anyhow::Context;
use clap::Parser;
use picobridge_core::cli::{print_exit_codes, CliResult, ExitCodes};
use picobridge_core::config::{BrokerConfig, LogOutput, LoggingConfig};
use picobridge_core::{BrokerService, ChannelKind, NAME, VERSION};
use std::path::PathBuf;
use std::process::ExitCode;
use tracing::{error, info};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::prelude::*;
use tracing_subscriber::{fmt, EnvFilter};

/// Picobridge CLI
#[derive(Parser, Debug)]
#[command(
    name = "picobridge",
    version,
    about = "Bridge persistent device TCP connections to files or pseudo-terminals",
    long_about = None
)]
struct Cli {
    /// Config file (defaults to the per-user config location)
    #[arg(short, long, env = "PICOBRIDGE_CONFIG")]
    config: Option<PathBuf>,

    /// Listen port
    #[arg(short, long)]
    port: Option<u16>,

    /// Bind address
    #[arg(long)]
    host: Option<String>,

    /// Channel mode (files, pty)
    #[arg(short, long)]
    mode: Option<ChannelKind>,

    /// Directory for command/response files
    #[arg(short, long)]
    dir: Option<PathBuf>,

    /// Directory for pty symlinks
    #[arg(long)]
    symlink_dir: Option<PathBuf>,

    /// Debounce window in milliseconds
    #[arg(long)]
    debounce_ms: Option<u64>,

    /// Disconnect grace window in milliseconds
    #[arg(long)]
    grace_ms: Option<u64>,

    /// Record commands and responses to this file
    #[arg(long)]
    traffic_log: Option<PathBuf>,

    /// Verbose output
    #[arg(short, long, conflicts_with = "quiet")]
    verbose: bool,

    /// Quiet mode (warnings and errors only)
    #[arg(short, long)]
    quiet: bool,

    /// Print the effective configuration as TOML and exit
    #[arg(long)]
    print_config: bool,

    /// Print the exit code table and exit
    #[arg(long)]
    exit_codes: bool,
}

impl Cli {
    fn apply(&self, config: &mut BrokerConfig) {
        if let Some(port) = self.port {
            config.listen.port = port;
        }
        if let Some(host) = &self.host {
            config.listen.host.clone_from(host);
        }
        if let Some(mode) = self.mode {
            config.channel.mode = mode;
        }
        if let Some(dir) = &self.dir {
            config.channel.directory.clone_from(dir);
        }
        if let Some(dir) = &self.symlink_dir {
            config.channel.symlink_directory.clone_from(dir);
        }
        if let Some(ms) = self.debounce_ms {
            config.timing.debounce_ms = ms;
        }
        if let Some(ms) = self.grace_ms {
            config.timing.grace_ms = ms;
        }
        if let Some(path) = &self.traffic_log {
            config.traffic_log.enabled = true;
            config.traffic_log.path.clone_from(path);
        }
        if self.verbose {
            config.logging.level = "debug".to_string();
        } else if self.quiet {
            config.logging.level = "warn".to_string();
        }
    }
}

fn init_tracing(logging: &LoggingConfig) -> anyhow::Result<Option<WorkerGuard>> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&logging.level))
        .with_context(|| format!("invalid log level '{}'", logging.level))?;

    let (file_layer, guard) = match &logging.directory {
        Some(dir) => {
            let appender = RollingFileAppender::builder()
                .rotation(Rotation::DAILY)
                .filename_prefix("picobridge")
                .filename_suffix("log")
                .build(dir)
                .with_context(|| format!("cannot log to {}", dir.display()))?;
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let layer = fmt::layer().with_writer(writer).with_ansi(false);
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };

    let registry = tracing_subscriber::registry().with(filter).with(file_layer);
    match logging.format {
        LogOutput::Text => registry.with(fmt::layer()).init(),
        LogOutput::Json => registry.with(fmt::layer().json()).init(),
    }

    Ok(guard)
}

async fn wait_for_signal() -> std::io::Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        let mut terminate = signal(SignalKind::terminate())?;
        tokio::select! {
            result = tokio::signal::ctrl_c() => result?,
            _ = terminate.recv() => {}
        }
    }

    #[cfg(not(unix))]
    tokio::signal::ctrl_c().await?;

    Ok(())
}

async fn run(cli: &Cli) -> CliResult {
    let loaded = match &cli.config {
        Some(path) => BrokerConfig::load_from(path),
        None => BrokerConfig::load(),
    };
    let mut config = match loaded {
        Ok(config) => config,
        Err(e) => return e.into(),
    };
    cli.apply(&mut config);

    if let Err(e) = config.validate() {
        return e.into();
    }

    if cli.print_config {
        return match config.to_toml() {
            Ok(text) => CliResult::success_with_message(text),
            Err(e) => e.into(),
        };
    }

    let _guard = match init_tracing(&config.logging) {
        Ok(guard) => guard,
        Err(e) => return CliResult::error(ExitCodes::CONFIG_ERROR, format!("{:#}", e)),
    };

    info!("Starting {} v{}", NAME, VERSION);

    let service = match BrokerService::start(&config).await {
        Ok(service) => service,
        Err(e) => {
            error!("{}", e);
            return e.into();
        }
    };

    let signalled = wait_for_signal().await;
    info!("Shutdown requested");
    service.shutdown().await;

    match signalled {
        Ok(()) => CliResult::success(),
        Err(e) => CliResult::error(
            ExitCodes::INTERNAL_ERROR,
            format!("Signal handling failed: {}", e),
        ),
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    if cli.exit_codes {
        print_exit_codes();
        return ExitCode::SUCCESS;
    }

    let result = run(&cli).await;
    match (&result, result.message()) {
        (CliResult::Success(_), Some(msg)) => println!("{}", msg),
        (CliResult::Error(..), Some(msg)) => eprintln!("Error: {}", msg),
        _ => {}
    }
    result.to_exit_code()
}
