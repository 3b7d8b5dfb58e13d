//! Warden - control-plane agent for a VPN gateway

use std::path::PathBuf;

use clap::{Parser, Subcommand};

use warden::agent::Agent;
use warden::config::AgentConfig;
use warden::{pki, telemetry};

/// Warden - mTLS gRPC control-plane agent for a VPN gateway
#[derive(Parser, Debug)]
#[command(name = "warden", version, about, long_about = None)]
struct Cli {
    /// Path to the YAML configuration file
    #[arg(
        short = 'c',
        long = "config",
        env = "WARDEN_CONFIG",
        default_value = warden::DEFAULT_CONFIG_PATH,
        global = true
    )]
    config: PathBuf,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the agent (default mode)
    ///
    /// Loads the configuration, generates TLS material when it is missing and
    /// auto-generation is on, and serves the gRPC API until SIGINT or SIGTERM.
    Serve,

    /// Generate a bootstrap CA and agent certificate
    Gencert(GencertArgs),
}

/// Certificate generation arguments
#[derive(Parser, Debug)]
struct GencertArgs {
    /// Directory for ca.crt, agent.crt and agent.key
    #[arg(short = 'o', long)]
    output_dir: PathBuf,

    /// Host name for the certificate subjects and SAN
    #[arg(long)]
    hostname: String,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Every TLS config in the process uses aws-lc-rs
    if let Err(e) = rustls::crypto::aws_lc_rs::default_provider().install_default() {
        eprintln!(
            "CRITICAL: Failed to install aws-lc-rs crypto provider: {:?}. \
             The agent cannot serve TLS without it.",
            e
        );
        std::process::exit(1);
    }

    let cli = Cli::parse();

    match cli.command {
        Some(Commands::Gencert(args)) => run_gencert(args),
        Some(Commands::Serve) | None => run_serve(cli.config).await,
    }
}

/// Run the agent until a shutdown signal
async fn run_serve(config_path: PathBuf) -> anyhow::Result<()> {
    let config = AgentConfig::load(&config_path)
        .map_err(|e| anyhow::anyhow!("Failed to load {}: {}", config_path.display(), e))?;
    telemetry::init_tracing(&config.logging)?;
    let meter_provider = telemetry::init_metrics(&config.telemetry)?;

    tracing::info!(
        version = env!("CARGO_PKG_VERSION"),
        config = %config_path.display(),
        "Warden starting"
    );

    let agent = Agent::from_config(config)?;
    let result = agent.run(shutdown_signal()).await;

    if let Some(provider) = meter_provider {
        if let Err(e) = provider.shutdown() {
            tracing::warn!(error = %e, "Failed to flush metrics");
        }
    }
    result?;
    Ok(())
}

/// Generate certificates and print how to recognise them
fn run_gencert(args: GencertArgs) -> anyhow::Result<()> {
    let material = pki::bootstrap(&args.output_dir, &args.hostname)?;

    println!("=== Warden Certificates ===");
    println!("CA certificate:    {}", material.paths.ca_cert.display());
    println!("Agent certificate: {}", material.paths.cert.display());
    println!("Agent key:         {}", material.paths.key.display());
    println!();
    println!("Subject:          {}", material.subject);
    println!("CA fingerprint:   {}", material.ca_fingerprint);
    println!("Cert fingerprint: {}", material.cert_fingerprint);
    println!("Valid from:       {}", material.valid_from);
    println!("Valid until:      {}", material.valid_until);
    Ok(())
}

/// Resolves on SIGINT or SIGTERM
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to listen for SIGINT");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => tracing::info!("Received SIGINT"),
        _ = terminate => tracing::info!("Received SIGTERM"),
    }
}
