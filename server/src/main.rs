use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing::{error, info};

use marcus_core::error::{ErrorKind, MarcusError};
use marcus_server::config::Config;
use marcus_server::telemetry::{init_telemetry, log_config_validation, log_startup_info};
use marcus_server::{initialize_app, stdio};
use protocol::HttpServer;

/// Exit codes: 0 success, 1 generic failure, 2 configuration error,
/// 3 persistence corruption.
const EXIT_FAILURE: i32 = 1;
const EXIT_CONFIG: i32 = 2;
const EXIT_STORAGE_CORRUPT: i32 = 3;

#[derive(Parser)]
#[command(name = "marcus")]
#[command(about = "Marcus multi-agent coordination server")]
#[command(version = env!("CARGO_PKG_VERSION"))]
struct Cli {
    /// Configuration file path
    #[arg(short, long, env = "MARCUS_CONFIG_PATH", global = true)]
    config: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Start the coordination server
    Start {
        /// Port override for the HTTP listener
        #[arg(long)]
        port: Option<u16>,

        /// Listen address override
        #[arg(long)]
        listen_addr: Option<String>,

        /// Log level override
        #[arg(long, env = "MARCUS_LOG_LEVEL")]
        log_level: Option<String>,

        /// Serve tool calls over stdin/stdout instead of HTTP
        #[arg(long)]
        stdio: bool,
    },
    /// Ask a running instance to shut down gracefully
    Stop,
    /// Query a running instance's health
    Status,
}

#[tokio::main]
async fn main() {
    dotenv::dotenv().ok();
    let cli = Cli::parse();

    let exit_code = match run(cli).await {
        Ok(()) => 0,
        Err(err) => {
            error!(error = %format!("{err:#}"), "Command failed");
            eprintln!("Error: {err:#}");
            exit_code_for(&err)
        }
    };
    std::process::exit(exit_code);
}

async fn run(cli: Cli) -> Result<()> {
    match cli.command {
        Command::Start {
            port,
            listen_addr,
            log_level,
            stdio: use_stdio,
        } => {
            let mut config = Config::load(cli.config.as_deref())?;
            if let Some(port) = port {
                config.server.port = port;
            }
            if let Some(listen_addr) = listen_addr {
                config.server.listen_addr = listen_addr;
            }
            if let Some(log_level) = log_level {
                config.logging.level = log_level;
            }

            init_telemetry(&config.logging).context("Failed to initialize telemetry")?;
            log_config_validation(&config);
            config
                .validate()
                .map_err(|e| e.context("Configuration validation failed"))?;
            log_startup_info(&config);

            start_server(config, use_stdio).await
        }
        Command::Stop => {
            let config = Config::load(cli.config.as_deref())?;
            let url = format!("http://{}/shutdown", config.server_address());
            let response = reqwest::Client::new()
                .post(&url)
                .send()
                .await
                .with_context(|| format!("No running instance reachable at {url}"))?;
            anyhow::ensure!(
                response.status().is_success(),
                "Shutdown request failed with status {}",
                response.status()
            );
            println!("Shutdown requested");
            Ok(())
        }
        Command::Status => {
            let config = Config::load(cli.config.as_deref())?;
            let url = format!("http://{}/health", config.server_address());
            let response = reqwest::Client::new()
                .get(&url)
                .send()
                .await
                .with_context(|| format!("No running instance reachable at {url}"))?;
            let body: serde_json::Value = response.json().await?;
            println!("{}", serde_json::to_string_pretty(&body)?);
            Ok(())
        }
    }
}

async fn start_server(config: Config, use_stdio: bool) -> Result<()> {
    let dispatcher = initialize_app(&config)
        .await
        .context("Failed to initialize application")?;

    if use_stdio {
        info!("Marcus server ready (stdio transport)");
        return stdio::run_stdio(dispatcher).await;
    }

    let (shutdown_tx, mut shutdown_rx) = tokio::sync::mpsc::channel(1);
    let server = HttpServer::new(dispatcher).with_shutdown(shutdown_tx.clone());
    let addr = config.server_address();

    // Signal handling feeds the same channel as POST /shutdown
    tokio::spawn(async move {
        wait_for_signal().await;
        let _ = shutdown_tx.send(()).await;
    });

    println!("Marcus server listening on http://{addr}");
    tokio::select! {
        result = server.serve(&addr) => {
            result.context("HTTP server error")
        }
        _ = shutdown_rx.recv() => {
            info!("Shutdown signal received; stopping server");
            println!("Marcus server shut down cleanly");
            Ok(())
        }
    }
}

async fn wait_for_signal() {
    #[cfg(unix)]
    {
        let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("Failed to register SIGTERM handler");
        let mut sigint = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::interrupt())
            .expect("Failed to register SIGINT handler");
        tokio::select! {
            _ = sigterm.recv() => info!("Received SIGTERM"),
            _ = sigint.recv() => info!("Received SIGINT"),
        }
    }

    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c()
            .await
            .expect("Failed to listen for ctrl+c");
        info!("Received Ctrl+C");
    }
}

fn exit_code_for(err: &anyhow::Error) -> i32 {
    if let Some(marcus) = err.downcast_ref::<MarcusError>() {
        return match marcus.kind {
            ErrorKind::Configuration => EXIT_CONFIG,
            ErrorKind::Storage => EXIT_STORAGE_CORRUPT,
            _ => EXIT_FAILURE,
        };
    }
    // Configuration-phase anyhow errors carry their own context string
    let message = format!("{err:#}");
    if message.contains("Configuration validation failed")
        || message.contains("Failed to deserialize configuration")
        || message.contains("Failed to build configuration")
    {
        EXIT_CONFIG
    } else {
        EXIT_FAILURE
    }
}
