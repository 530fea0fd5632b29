use std::path::PathBuf;

use anyhow::Context;
use clap::Parser;

use mcp_router::config;
use mcp_router::RunOptions;

/// Route one MCP client identity onto many backend MCP servers.
#[derive(Debug, Parser)]
#[command(name = "mcp-router", version, about)]
struct Args {
    /// Configuration file (defaults to $MCP_ROUTER_CONFIG, then <data dir>/router.yaml).
    #[arg(long, value_name = "PATH")]
    config: Option<PathBuf>,

    /// Log to stdout even if the config asks for a log file.
    #[arg(long)]
    log_stdout: bool,

    /// Do not poll for servers, whatever the config says.
    #[arg(long)]
    no_discovery: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let (router_config, path) =
        config::load_or_default(args.config.as_deref()).context("failed to load configuration")?;

    mcp_router::init_tracing(&router_config.logging, args.log_stdout)?;
    match &path {
        Some(path) => tracing::info!(path = %path.display(), "loaded configuration"),
        None => tracing::info!("no configuration file found, using defaults"),
    }

    mcp_router::run(
        router_config,
        RunOptions {
            no_discovery: args.no_discovery,
        },
    )
    .await
}
