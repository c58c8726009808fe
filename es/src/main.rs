//! EventSync - collector-driven event dispatch
//!
//! CLI entry point for running collectors and event handlers.

use std::fs;

use clap::Parser;
use eyre::{Context, Result};
use tokio::signal::unix::{SignalKind, signal};
use tracing::{debug, info};

use eventsync::app::App;
use eventsync::cli::{Cli, Command, get_log_path};
use eventsync::config::Config;
use eventsync::plugin::{PluginRegistry, core_plugin};

fn setup_logging(cli_log_level: Option<&str>, config_log_level: Option<&str>) -> Result<()> {
    // Note: Can't log params here since logging isn't initialized yet
    let log_path = get_log_path();
    if let Some(log_dir) = log_path.parent() {
        fs::create_dir_all(log_dir).context("Failed to create log directory")?;
    }

    // Determine log level with priority: CLI --log-level > config file > default (INFO)
    let level = match cli_log_level.or(config_log_level) {
        Some(s) => match s.to_uppercase().as_str() {
            "TRACE" => tracing::Level::TRACE,
            "DEBUG" => tracing::Level::DEBUG,
            "INFO" => tracing::Level::INFO,
            "WARN" | "WARNING" => tracing::Level::WARN,
            "ERROR" => tracing::Level::ERROR,
            _ => {
                eprintln!("Warning: Unknown log-level '{}', defaulting to INFO", s);
                tracing::Level::INFO
            }
        },
        None => tracing::Level::INFO,
    };

    let log_file = fs::File::create(&log_path).context("Failed to create log file")?;

    tracing_subscriber::fmt()
        .with_writer(log_file)
        .with_ansi(false)
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env().add_directive(level.into()))
        .init();

    info!("Logging initialized (level: {:?})", level);
    Ok(())
}

fn build_registry() -> Result<PluginRegistry> {
    let mut registry = PluginRegistry::new();
    registry.register(core_plugin()?)?;
    Ok(registry)
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Load log level from config file early (before full config load)
    let config_log_level = Config::load_log_level(cli.config.as_ref());

    // Setup logging with priority: CLI > config > INFO default
    setup_logging(cli.log_level.as_deref(), config_log_level.as_deref()).context("Failed to setup logging")?;

    let config = Config::load(cli.config.as_ref()).context("Failed to load configuration")?;
    config.validate().context("Invalid configuration")?;

    info!(
        collectors = config.collectors.len(),
        handlers = config.event_handlers.len(),
        "EventSync loaded config"
    );

    debug!(command = ?cli.command, "main: dispatching command");
    match cli.command {
        Command::Run { once } => cmd_run(config, once).await,
        Command::Check => cmd_check(config),
    }
}

async fn cmd_run(config: Config, once: bool) -> Result<()> {
    debug!(once, "cmd_run: called");
    let mut app = App::new(config, build_registry()?);
    app.load_from_config()?;

    if once {
        app.run_once().await?;
        println!("Run complete; see {} for details", get_log_path().display());
        return Ok(());
    }

    app.start();
    println!("EventSync running ({} services). Press Ctrl-C to stop.", app.services().len());

    let mut sigint = signal(SignalKind::interrupt())?;
    let mut sigterm = signal(SignalKind::terminate())?;
    tokio::select! {
        _ = sigint.recv() => info!("SIGINT received - stopping"),
        _ = sigterm.recv() => info!("SIGTERM received - stopping"),
    }

    app.shutdown().await
}

fn cmd_check(config: Config) -> Result<()> {
    debug!("cmd_check: called");
    let registry = build_registry()?;

    println!("Plugins:");
    for plugin in registry.plugins() {
        println!(
            "  {} {}{}",
            plugin.name,
            plugin.version,
            if plugin.enabled { "" } else { " (disabled)" }
        );
        println!("    collectors:     {}", plugin.collector_names().join(", "));
        println!("    event handlers: {}", plugin.event_handler_names().join(", "));
    }

    println!("Collectors:");
    for collector in &config.collectors {
        registry
            .create_collector(collector)
            .with_context(|| format!("Collector for model '{}'", collector.model))?;
        println!("  {} <- {}/{}", collector.model, collector.plugin, collector.collector);
    }

    println!("Event handlers:");
    for handler in &config.event_handlers {
        let built = registry
            .create_event_handler(handler)
            .with_context(|| format!("Event handler {}/{}", handler.plugin, handler.handler))?;
        println!("  {} -> {}/{}", built.event_name(), handler.plugin, handler.handler);
    }

    println!("Configuration OK");
    Ok(())
}
