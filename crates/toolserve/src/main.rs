use std::process::ExitCode;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use toolserve::cli::Cli;
use toolserve::{router, AppState};
use toolserve_core::{config, CommandDependencyManager, ToolEngine};

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    if let Err(err) = toolserve::logging::init(cli.log_file.as_deref()) {
        eprintln!("{err:#}");
        return ExitCode::FAILURE;
    }

    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            tracing::error!("{err:#}");
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    let loaded = config::load(&cli.config_file_path)?;
    tracing::info!(
        "Tool configuration of tool {} loaded successfully.",
        loaded.tool.tool_name
    );
    if let Some(minutes) = cli.timeout {
        tracing::info!("Tool timeout set to : {minutes} minutes.");
    }

    let dependencies = Arc::new(CommandDependencyManager::new(cli.dependency_tool.clone()));
    let engine = ToolEngine::with_dependencies(loaded.tool, cli.engine_settings(), dependencies);
    let request_limit = usize::try_from(cli.request_limit).context("request limit out of range")?;
    let state = AppState::new(engine, loaded.document, request_limit);

    let addr = cli.addr();
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;
    tracing::info!("Starting toolserve on http://{addr}");

    axum::serve(listener, router(state))
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    tracing::info!("Shutting down");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        tracing::warn!(error = %err, "Failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
}
