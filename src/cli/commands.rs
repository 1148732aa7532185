use std::io;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;

use crate::cli::shell::{run_shell, ShellOptions};
use crate::core::{
    dispatch::{SessionQueue, TraceOptions, TraceWriter},
    gateway::{CardServices, PresenceChange, PresenceListener},
    reader::PcscServices,
    session::{select_reader, Session},
};

#[derive(Parser)]
#[command(name = "apdu-shell")]
#[command(about = "Interactive shell for sending APDU commands to a smart card")]
#[command(version)]
pub struct Cli {
    /// Enable verbose logging
    #[arg(short, long)]
    pub verbose: bool,

    /// Enable debug logging
    #[arg(short, long)]
    pub debug: bool,

    /// Prefix trace lines with the local time
    #[arg(short, long)]
    pub timestamps: bool,

    /// Describe status words in the response trace
    #[arg(short, long)]
    pub explain: bool,

    /// Card presence polling interval in milliseconds
    #[arg(long, default_value_t = 500, value_name = "MS")]
    pub poll_interval: u64,
}

pub fn run_cli() -> Result<()> {
    let cli = Cli::parse();

    // Set up logging
    let log_level = if cli.debug {
        log::LevelFilter::Debug
    } else if cli.verbose {
        log::LevelFilter::Info
    } else {
        log::LevelFilter::Warn
    };

    env_logger::Builder::from_default_env()
        .filter_level(log_level)
        .init();

    let services = PcscServices::new()
        .context("Failed to initialize PCSC")?
        .with_poll_interval(Duration::from_millis(cli.poll_interval));

    let reader = select_reader(&services)?;
    log::info!("Using reader: {reader}");

    let trace = Arc::new(TraceWriter::new(
        io::stdout(),
        TraceOptions {
            timestamps: cli.timestamps,
            explain_status: cli.explain,
        },
    ));

    let queue = SessionQueue::new();
    let mut forward = queue.presence_listener();
    let echo = Arc::clone(&trace);
    let echo_reader = reader.clone();
    services
        .subscribe_presence(Box::new(move |change: PresenceChange| {
            echo.presence(&change, &echo_reader);
            forward.on_presence_change(change);
        }))
        .context("Failed to start card monitoring")?;

    let session = queue.spawn(Session::new(Box::new(services), reader, trace));

    let stdin = io::stdin();
    let mut stdout = io::stdout();
    let options = ShellOptions {
        show_timing: cli.verbose || cli.debug,
    };
    run_shell(&session, stdin.lock(), &mut stdout, options)?;

    session.shutdown();
    Ok(())
}
