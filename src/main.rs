//! scriptsift - JavaScript reference discovery with per-domain records.
//!
//! CLI entry point.

use clap::Parser;
use scriptsift::config::{ClearConfig, ShowConfig, StoreArgs};
use scriptsift::store::FileStore;
use scriptsift::notify::ConsoleOutput;
use scriptsift::{Commands, Config, Message, RecordService, Reply, ScanConfig, Scanner, SetupConfig};
use std::fs;
use std::process::ExitCode;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> ExitCode {
    let config = Config::parse();

    let filter = if config.verbose {
        EnvFilter::new("scriptsift=debug,info")
    } else {
        EnvFilter::new("scriptsift=info,warn")
    };

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    // Exit promptly on SIGTERM/SIGINT.
    tokio::spawn(async {
        #[cfg(unix)]
        {
            use tokio::signal::unix::{signal, SignalKind};
            let (Ok(mut sigterm), Ok(mut sigint)) =
                (signal(SignalKind::terminate()), signal(SignalKind::interrupt()))
            else {
                error!("Failed to register signal handlers");
                return;
            };

            tokio::select! {
                _ = sigterm.recv() => {},
                _ = sigint.recv() => {},
            }
        }

        #[cfg(not(unix))]
        {
            let _ = tokio::signal::ctrl_c().await;
        }

        eprintln!("\nSignal received, exiting...");
        std::process::exit(130);
    });

    let outcome = match config.command.clone() {
        Commands::Scan(scan_config) => run_scan(scan_config, config.verbose).await,
        Commands::Show(show_config) => run_show(show_config).await,
        Commands::Clear(clear_config) => run_clear(clear_config).await,
        Commands::Setup(setup_config) => run_setup(setup_config).await,
    };

    match outcome {
        Ok(()) => ExitCode::SUCCESS,
        Err(code) => code,
    }
}

async fn run_scan(scan_config: ScanConfig, verbose: bool) -> Result<(), ExitCode> {
    let targets = scan_config.load_targets().map_err(|e| {
        error!("Failed to load targets: {}", e);
        ExitCode::FAILURE
    })?;

    if targets.is_empty() {
        error!("No targets specified. Use positional arguments or -f <file>.");
        return Err(ExitCode::FAILURE);
    }

    let store = scan_config.store.open().map_err(|e| {
        error!("Failed to open record store: {}", e);
        ExitCode::FAILURE
    })?;

    let scanner = Scanner::new(&scan_config, store, verbose).map_err(|e| {
        error!("Failed to create scanner: {}", e);
        ExitCode::FAILURE
    })?;

    if !scan_config.json {
        print_banner();
    }

    let reports = scanner.scan_multiple(targets).await;

    if scan_config.json || scan_config.output.is_some() {
        let json = serde_json::to_string_pretty(&reports).map_err(|e| {
            error!("Failed to serialize reports: {}", e);
            ExitCode::FAILURE
        })?;
        match &scan_config.output {
            Some(output_path) => {
                fs::write(output_path, &json).map_err(|e| {
                    error!("Failed to write output file: {}", e);
                    ExitCode::FAILURE
                })?;
                info!("Results written to: {:?}", output_path);
            }
            None => println!("{}", json),
        }
    }

    let failed_writes: usize = reports.iter().map(|r| r.failed_writes).sum();
    if failed_writes > 0 {
        error!("{} record write(s) failed", failed_writes);
        return Err(ExitCode::FAILURE);
    }

    Ok(())
}

async fn run_show(show_config: ShowConfig) -> Result<(), ExitCode> {
    let service = open_service(&show_config.store)?;
    let message = Message::Query {
        domain: show_config.domain.clone(),
    };

    let record = match service.handle(message).await {
        Ok(Reply::Record(record)) => record,
        Ok(_) => None,
        Err(e) => {
            error!("Query failed: {}", e);
            return Err(ExitCode::FAILURE);
        }
    };

    match (record, show_config.json) {
        (Some(record), true) => match serde_json::to_string_pretty(&record) {
            Ok(json) => println!("{}", json),
            Err(e) => {
                error!("Failed to serialize record: {}", e);
                return Err(ExitCode::FAILURE);
            }
        },
        (Some(record), false) => ConsoleOutput::default().print_record(&show_config.domain, &record),
        (None, true) => println!("null"),
        (None, false) => ConsoleOutput::default().print_info(&format!("No record for {}", show_config.domain)),
    }
    Ok(())
}

async fn run_clear(clear_config: ClearConfig) -> Result<(), ExitCode> {
    let service = open_service(&clear_config.store)?;
    match service
        .handle(Message::Clear {
            domain: clear_config.domain.clone(),
        })
        .await
    {
        Ok(_) => {
            ConsoleOutput::default().print_info(&format!("Cleared record for {}", clear_config.domain));
            Ok(())
        }
        Err(e) => {
            error!("Clear failed: {}", e);
            Err(ExitCode::FAILURE)
        }
    }
}

fn open_service(store: &StoreArgs) -> Result<RecordService<FileStore>, ExitCode> {
    let merger = store.merger().map_err(|e| {
        error!("Failed to open record store: {}", e);
        ExitCode::FAILURE
    })?;
    Ok(RecordService::new(merger))
}

async fn run_setup(setup_config: SetupConfig) -> Result<(), ExitCode> {
    eprintln!("Setting up Chromium browser...");
    match scriptsift::browser::download_chrome(setup_config.force).await {
        Ok(path) => {
            eprintln!("Chromium ready at: {}", path.display());
            Ok(())
        }
        Err(e) => {
            error!("Setup failed: {}", e);
            Err(ExitCode::FAILURE)
        }
    }
}

fn print_banner() {
    println!();
    println!("\x1b[36m╔══════════════════════════════════════════════════════════════╗\x1b[0m");
    println!("\x1b[36m║                   SCRIPTSIFT v0.1.0                          ║\x1b[0m");
    println!("\x1b[36m║        Script Reference Discovery & Domain Records           ║\x1b[0m");
    println!("\x1b[36m╚══════════════════════════════════════════════════════════════╝\x1b[0m");
    println!();
}
