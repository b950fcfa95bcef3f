//! sipwitch-pbx process entry point: parses the CLI, loads and validates
//! configuration, sets up logging, and drives the engine's lifecycle.
//!
//! Grounded on the teacher's `main.rs` (`Cli`/`Commands` via `clap`,
//! `load_configuration`, signal-driven shutdown) with the gateway's
//! TDMoE/FreeTDM start-up sequence replaced by the engine's worker pool +
//! background expirer + control channel.

use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use tokio::signal;
use tracing::{error, info};

use sipwitch_pbx::{
    config::PbxConfig, engine::Engine, transport::UdpTransport, utils::setup_logging, Result,
};

#[derive(Parser)]
#[command(name = "sipwitch-pbx")]
#[command(about = "SIP proxy and registrar core for small-to-mid PBX deployments")]
#[command(version = sipwitch_pbx::VERSION)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,

    /// Configuration file path
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, default_value = "info")]
    log_level: String,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the PBX core (default)
    Start,
    /// Validate configuration and exit
    ValidateConfig,
    /// Print a default configuration to stdout or a file
    GenerateConfig {
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
}

/// Process exit codes, picked up by the process supervisor.
const EXIT_NORMAL: i32 = 0;
const EXIT_RESTART: i32 = 1;
const EXIT_CONFIG_ERROR: i32 = 2;

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let code = match run(cli).await {
        Ok(code) => code,
        Err(e) => {
            error!("fatal: {e}");
            EXIT_CONFIG_ERROR
        }
    };
    std::process::exit(code);
}

async fn run(cli: Cli) -> Result<i32> {
    let mut config = load_configuration(&cli)?;
    config.logging.level = cli.log_level.clone();
    setup_logging(&config.logging)?;

    info!(
        node_id = config.general.node_id.as_str(),
        "starting {} v{}", sipwitch_pbx::NAME, sipwitch_pbx::VERSION
    );

    match cli.command {
        Some(Commands::ValidateConfig) => {
            config.validate()?;
            println!("configuration is valid");
            println!("  node id: {}", config.general.node_id);
            println!("  sip port: {}", config.sip.port);
            println!("  registry keysize: {}", config.registry.keysize);
            println!("  worker threads: {}", config.stack.worker_threads);
            Ok(EXIT_NORMAL)
        }
        Some(Commands::GenerateConfig { output }) => {
            let text = toml::to_string_pretty(&config)
                .map_err(|e| sipwitch_pbx::Error::internal(format!("serialize: {e}")))?;
            match output {
                Some(path) => {
                    std::fs::write(&path, text)?;
                    println!("default configuration written to {}", path.display());
                }
                None => println!("{text}"),
            }
            Ok(EXIT_NORMAL)
        }
        Some(Commands::Start) | None => start_engine(config).await,
    }
}

fn load_configuration(cli: &Cli) -> Result<PbxConfig> {
    let config = if let Some(path) = &cli.config {
        PbxConfig::load_from_file(path)?
    } else {
        match PbxConfig::load_from_env() {
            Ok(config) => config,
            Err(_) => PbxConfig::default_config(),
        }
    };
    config.validate()?;
    Ok(config)
}

async fn start_engine(config: PbxConfig) -> Result<i32> {
    let transport = UdpTransport::bind(&config.sip)
        .await
        .map_err(|e| sipwitch_pbx::Error::fatal(format!("transport bind failed: {e}")))?;
    info!(addr = %transport.local_addr(), "sip transport bound");

    let engine = Arc::new(Engine::new(config, Arc::new(transport)));
    engine.start()?;

    tokio::select! {
        _ = wait_for_shutdown_signal() => {
            info!("received shutdown signal");
        }
        _ = wait_until_engine_stopped(Arc::clone(&engine)) => {
            info!("engine requested shutdown via control channel");
        }
    }

    let restart = engine.restart_requested();
    engine.stop().await;
    info!("sipwitch-pbx shutdown complete");
    Ok(if restart { EXIT_RESTART } else { EXIT_NORMAL })
}

async fn wait_for_shutdown_signal() {
    match signal::ctrl_c().await {
        Ok(()) => {}
        Err(e) => error!("unable to listen for shutdown signal: {e}"),
    }
}

async fn wait_until_engine_stopped(engine: Arc<Engine>) {
    loop {
        if engine.is_shutting_down() {
            return;
        }
        tokio::time::sleep(std::time::Duration::from_millis(200)).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_generation_serializes() {
        let config = PbxConfig::default_config();
        let text = toml::to_string_pretty(&config).unwrap();
        assert!(text.contains("node_id"));
    }
}
