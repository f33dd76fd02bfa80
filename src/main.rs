//! Webshell - remote shell gateway with per-session sandboxes.
//!
//! Usage:
//!   webshell serve [--port 3001]          # Start HTTP server
//!   webshell check -- <command> [args]    # Classify a command offline

use clap::{Args, Parser, Subcommand};
use std::net::{IpAddr, SocketAddr};
use std::process::exit;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;
use webshell::config::{
    DockerConfig, ServiceConfig, DEFAULT_COMMAND_TIMEOUT_MS, DEFAULT_CONTAINER_PREFIX,
    DEFAULT_IDLE_TIMEOUT_SECS, DEFAULT_IMAGE, DEFAULT_MAX_OUTPUT_BYTES,
    DEFAULT_SWEEP_INTERVAL_SECS,
};
use webshell::http_server;
use webshell::sandbox::DockerProvider;
use webshell::shell::ShellService;
use webshell::validator::{CommandValidator, DEFAULT_SANDBOX_USER};

#[derive(Parser, Debug)]
#[command(name = "webshell")]
#[command(about = "Remote shell gateway with sandboxed sessions")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Start the HTTP server
    Serve(ServeArgs),
    /// Classify a command against the admission policy and print the verdict
    Check {
        /// Sandbox account whose home directory bounds chown
        #[arg(long, env = "WEBSHELL_SANDBOX_USER", default_value = DEFAULT_SANDBOX_USER)]
        sandbox_user: String,

        /// Command line to classify
        #[arg(required = true, trailing_var_arg = true, allow_hyphen_values = true)]
        command: Vec<String>,
    },
}

#[derive(Args, Debug)]
struct ServeArgs {
    /// Address to bind
    #[arg(long, env = "WEBSHELL_HOST", default_value = "0.0.0.0")]
    host: IpAddr,

    /// Port to listen on
    #[arg(long, env = "PORT", default_value_t = 3001)]
    port: u16,

    /// Idle time after which a session is reaped
    #[arg(long, env = "WEBSHELL_IDLE_TIMEOUT_SECS", default_value_t = DEFAULT_IDLE_TIMEOUT_SECS)]
    idle_timeout_secs: u64,

    /// Period of the idle-session sweep
    #[arg(long, env = "WEBSHELL_SWEEP_INTERVAL_SECS", default_value_t = DEFAULT_SWEEP_INTERVAL_SECS)]
    sweep_interval_secs: u64,

    /// Wall-clock limit for a single command
    #[arg(long, env = "WEBSHELL_COMMAND_TIMEOUT_MS", default_value_t = DEFAULT_COMMAND_TIMEOUT_MS)]
    command_timeout_ms: u64,

    /// Sandbox account whose home directory bounds chown
    #[arg(long, env = "WEBSHELL_SANDBOX_USER", default_value = DEFAULT_SANDBOX_USER)]
    sandbox_user: String,

    /// Container image for session sandboxes
    #[arg(long, env = "WEBSHELL_IMAGE", default_value = DEFAULT_IMAGE)]
    image: String,

    /// Name prefix for session containers
    #[arg(long, env = "WEBSHELL_CONTAINER_PREFIX", default_value = DEFAULT_CONTAINER_PREFIX)]
    container_prefix: String,

    /// Docker CLI binary
    #[arg(long, env = "WEBSHELL_DOCKER_BIN", default_value = "docker")]
    docker_bin: String,

    /// Memory limit per container (e.g. 256m)
    #[arg(long, env = "WEBSHELL_MEMORY")]
    memory: Option<String>,

    /// Process limit per container
    #[arg(long, env = "WEBSHELL_PIDS_LIMIT")]
    pids_limit: Option<u32>,

    /// Bytes of stdout and of stderr kept per command; the rest is truncated
    #[arg(long, env = "WEBSHELL_MAX_OUTPUT_BYTES", default_value_t = DEFAULT_MAX_OUTPUT_BYTES)]
    max_output_bytes: usize,

    /// Browser origin allowed by CORS (repeatable)
    #[arg(
        long = "allowed-origin",
        env = "WEBSHELL_ALLOWED_ORIGINS",
        value_delimiter = ',',
        default_values = ["http://localhost:3000", "http://127.0.0.1:3000"]
    )]
    allowed_origins: Vec<String>,
}

impl ServeArgs {
    fn service_config(&self) -> ServiceConfig {
        ServiceConfig {
            idle_timeout: Duration::from_secs(self.idle_timeout_secs),
            sweep_interval: Duration::from_secs(self.sweep_interval_secs.max(1)),
            command_timeout: Duration::from_millis(self.command_timeout_ms),
            sandbox_user: self.sandbox_user.clone(),
            allowed_origins: self.allowed_origins.clone(),
        }
    }

    fn docker_config(&self) -> DockerConfig {
        DockerConfig {
            docker_bin: self.docker_bin.clone(),
            image: self.image.clone(),
            container_prefix: self.container_prefix.clone(),
            memory: self.memory.clone(),
            pids_limit: self.pids_limit,
            no_network: true,
            max_output_bytes: self.max_output_bytes,
        }
    }
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Serve(args) => {
            let config = args.service_config();
            let provider = Arc::new(DockerProvider::new(args.docker_config()));
            let service = ShellService::new(provider, &config);
            let addr = SocketAddr::new(args.host, args.port);

            if let Err(e) = http_server::run_server(addr, service, &config, shutdown_signal()).await {
                error!("Server error: {}", e);
                exit(1);
            }
        }
        Commands::Check {
            sandbox_user,
            command,
        } => {
            let raw = command.join(" ");
            let verdict = CommandValidator::new(&sandbox_user).classify(&raw);
            match serde_json::to_string_pretty(&verdict) {
                Ok(json) => println!("{json}"),
                Err(e) => {
                    eprintln!("Error: {}", e);
                    exit(1);
                }
            }
            exit(if verdict.allowed { 0 } else { 2 });
        }
    }
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!("Failed to listen for shutdown signal: {}", e);
        std::future::pending::<()>().await;
    }
    info!("Shutdown signal received, stopping server...");
}
