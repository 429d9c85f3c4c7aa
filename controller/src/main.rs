//! Dockyard controller - Entry Point
//!
//! Manages a fleet of Docker hosts and the Compose stacks deployed on them.

use std::collections::HashMap;
use std::env;

use anyhow::{Context, Result};
use colored::Colorize;
use tracing::{error, info};

use dockyard::app::options::AppOptions;
use dockyard::app::run::run;
use dockyard::filesys::file::File;
use dockyard::logs::{init_logging, LogOptions};
use dockyard::storage::hosts::load_hosts;
use dockyard::storage::layout::StorageLayout;
use dockyard::storage::settings::Settings;
use dockyard::utils::version_info;
use dockyard::vault::{MasterKey, Vault};

#[tokio::main]
async fn main() {
    // Parse command line arguments
    let args: Vec<String> = env::args().collect();
    let mut cli_args: HashMap<String, String> = HashMap::new();

    for arg in args.iter().skip(1) {
        if let Some((key, value)) = arg.split_once('=') {
            // Handle --key=value format
            let clean_key = key.trim_start_matches('-');
            cli_args.insert(clean_key.to_string(), value.to_string());
        } else if arg.starts_with("--") {
            // Handle standalone flags like --version
            let clean_key = arg.trim_start_matches('-');
            cli_args.insert(clean_key.to_string(), "true".to_string());
        }
    }

    // Print version and exit
    let version = version_info();
    if cli_args.contains_key("version") {
        match serde_json::to_string_pretty(&version) {
            Ok(json) => println!("{}", json),
            Err(_) => println!("{}", version.version),
        }
        return;
    }

    let settings_file = match cli_args.get("settings") {
        Some(path) => File::new(path),
        None => StorageLayout::default().settings_file(),
    };

    if cli_args.contains_key("check-config") {
        if let Err(e) = check_config(&settings_file).await {
            eprintln!("{} {:#}", "✗".red().bold(), e);
            std::process::exit(1);
        }
        return;
    }

    if let Err(e) = start(&settings_file).await {
        eprintln!("Failed to run the controller: {:#}", e);
        std::process::exit(1);
    }
}

async fn start(settings_file: &File) -> Result<()> {
    let settings = Settings::load_or_default(settings_file)
        .await
        .with_context(|| format!("loading {}", settings_file.path().display()))?;

    // Initialize logging; the guard flushes file logs on exit
    let log_options = LogOptions {
        log_level: settings.log_level.clone(),
        log_dir: settings.log_dir.clone(),
        json_format: settings.log_json,
        ..Default::default()
    };
    let _log_guard = init_logging(log_options).context("initializing logging")?;

    let options = AppOptions::from_settings(&settings);
    info!(
        "Running Dockyard {} with data directory {}",
        version_info().version,
        options.storage.layout.base_dir.display()
    );

    run(options, await_shutdown_signal()).await.map_err(|e| {
        error!("Controller stopped with an error: {}", e);
        anyhow::Error::new(e)
    })
}

/// Validate settings, master key and host configuration without starting anything
async fn check_config(settings_file: &File) -> Result<()> {
    let settings = Settings::load_or_default(settings_file)
        .await
        .with_context(|| format!("loading {}", settings_file.path().display()))?;
    println!(
        "{} settings {}",
        "✓".green().bold(),
        settings_file.path().display()
    );

    let key = MasterKey::from_env(&settings.master_key_env).context("reading the master key")?;
    let vault = Vault::new(Some(key)).context("building the vault")?;
    println!(
        "{} master key from {}",
        "✓".green().bold(),
        settings.master_key_env.cyan()
    );

    match &settings.hosts_file {
        Some(path) => {
            let file = File::new(path);
            let specs = load_hosts(&file, &vault)
                .await
                .with_context(|| format!("loading {}", path.display()))?;
            println!(
                "{} {} hosts in {}",
                "✓".green().bold(),
                specs.len(),
                path.display()
            );
            for spec in specs {
                println!(
                    "    {} {} ({})",
                    spec.name.bold(),
                    spec.connection.endpoint(),
                    spec.connection.kind()
                );
            }
        }
        None => println!("{} no host configuration file", "-".yellow()),
    }

    let options = AppOptions::from_settings(&settings);
    println!(
        "{} data directory {}",
        "✓".green().bold(),
        options.storage.layout.base_dir.display()
    );
    Ok(())
}

async fn await_shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let (mut sigterm, mut sigint) =
            match (signal(SignalKind::terminate()), signal(SignalKind::interrupt())) {
                (Ok(sigterm), Ok(sigint)) => (sigterm, sigint),
                _ => {
                    error!("Unable to install signal handlers, falling back to Ctrl+C");
                    let _ = tokio::signal::ctrl_c().await;
                    return;
                }
            };

        tokio::select! {
            _ = sigterm.recv() => {
                info!("SIGTERM received, shutting down...");
            }
            _ = sigint.recv() => {
                info!("SIGINT received, shutting down...");
            }
        }
    }

    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
        info!("Ctrl+C received, shutting down...");
    }
}
