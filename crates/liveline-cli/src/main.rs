//! Liveline - WebSocket bridge to a streaming generative service

use anyhow::{Context, Result};
use clap::Parser;
use colored::Colorize;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use liveline_config::LivelineConfig;
use liveline_gateway::GatewayServer;

mod chat;
mod commands;

use commands::{Cli, Commands};

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&cli.log_level));
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(filter)
        .init();

    let result = match &cli.command {
        Commands::Serve { host, port } => run_serve(&cli, host.as_deref(), *port).await,
        Commands::Chat {
            url,
            client_id,
            system_prompt,
            voice,
        } => chat::run(url, client_id, system_prompt, voice.as_deref()).await,
    };

    if let Err(e) = result {
        eprintln!("{}: {:#}", "Error".red().bold(), e);
        std::process::exit(1);
    }
}

async fn run_serve(cli: &Cli, host: Option<&str>, port: Option<u16>) -> Result<()> {
    let config = liveline_config::load_config(cli.config.as_deref())
        .context("failed to load configuration")?;
    let (host, port) = bind_address(&config, host, port);

    if config.upstream.api_key.is_none() {
        tracing::warn!(
            "No upstream API key configured; set GOOGLE_API_KEY or upstream.api_key"
        );
    }

    println!(
        "{} ws://{}:{}/ws/{{client_id}}",
        "Listening on".cyan().bold(),
        host,
        port
    );

    GatewayServer::new(&config)
        .start_with_shutdown(&host, port, shutdown_signal())
        .await
        .context("gateway server failed")?;

    println!("{}", "Gateway stopped".dimmed());
    Ok(())
}

fn bind_address(config: &LivelineConfig, host: Option<&str>, port: Option<u16>) -> (String, u16) {
    (
        host.map(str::to_string)
            .unwrap_or_else(|| config.server.host.clone()),
        port.unwrap_or(config.server.port),
    )
}

/// Wait for SIGTERM or SIGINT (Ctrl+C).
async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();

    #[cfg(unix)]
    {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = ctrl_c => {}
                    _ = sigterm.recv() => {}
                }
            }
            Err(e) => {
                tracing::warn!(error = %e, "Failed to install SIGTERM handler");
                ctrl_c.await.ok();
            }
        }
    }

    #[cfg(not(unix))]
    {
        ctrl_c.await.ok();
    }

    tracing::info!("Received shutdown signal");
}
