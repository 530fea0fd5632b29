pub mod config;
pub mod discovery;
pub mod errors;
pub mod events;
pub mod protocol;
pub mod router;
pub mod transport;

use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;

use config::{LogFormat, LoggingConfig, RouterConfig};
use discovery::{DiscoveryService, DockerSource};
use router::Router;
use transport::DefaultTransportFactory;

/// Return the platform-standard data directory for the router.
///
/// - macOS: `~/Library/Application Support/mcp-router/`
/// - Windows: `{FOLDERID_RoamingAppData}\mcp-router\`
/// - Linux: `$XDG_DATA_HOME/mcp-router/` (fallback `~/.local/share/...`)
///
/// Falls back to `~/.mcp-router/` only if none of the above can be resolved.
pub fn data_dir() -> PathBuf {
    match dirs::data_dir() {
        Some(dir) => dir.join("mcp-router"),
        None => dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".mcp-router"),
    }
}

// ─── Logging ─────────────────────────────────────────────────────────────────

/// Old log files kept next to the current one.
const KEEP_LOGS: u32 = 3;

/// Initialize the tracing subscriber.
///
/// With `logging.to_file` (and unless `force_stdout`) logs go to
/// `<data dir>/router.log`, the previous runs' files shifted to `.1`..`.3`.
/// Otherwise logs go to stdout. `RUST_LOG` overrides the default filter.
pub fn init_tracing(logging: &LoggingConfig, force_stdout: bool) -> anyhow::Result<()> {
    use tracing_subscriber::fmt;
    use tracing_subscriber::fmt::writer::BoxMakeWriter;
    use tracing_subscriber::EnvFilter;

    let to_file = logging.to_file && !force_stdout;
    let log_dir = data_dir();
    let log_path = log_dir.join("router.log");

    let mut rotation = Ok(());
    let writer = if to_file {
        std::fs::create_dir_all(&log_dir)
            .with_context(|| format!("failed to create {}", log_dir.display()))?;
        rotation = rotate_logs(&log_path, KEEP_LOGS);
        let file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&log_path)
            .with_context(|| format!("failed to open {}", log_path.display()))?;
        // Unbuffered, so every event reaches the file as it is written.
        BoxMakeWriter::new(Arc::new(file))
    } else {
        BoxMakeWriter::new(std::io::stdout)
    };

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("mcp_router=info,warn"));
    let builder = fmt::fmt()
        .with_env_filter(filter)
        .with_writer(writer)
        .with_ansi(!to_file)
        .with_target(true);
    let installed = match logging.format {
        LogFormat::Json => builder.json().try_init(),
        LogFormat::Text => builder.try_init(),
    };
    installed.map_err(|e| anyhow::anyhow!("failed to install tracing subscriber: {e}"))?;

    let destination = if to_file {
        log_path.display().to_string()
    } else {
        "stdout".to_string()
    };
    tracing::info!(
        version = env!("CARGO_PKG_VERSION"),
        log = %destination,
        pid = std::process::id(),
        "=== mcp-router starting ==="
    );
    if let Err(e) = rotation {
        tracing::warn!(error = %e, "could not rotate old log files");
    }
    Ok(())
}

/// Shift `current` to `current.1`, `.1` to `.2` and so on, dropping
/// `current.{keep}`. Gaps in the chain are fine.
fn rotate_logs(current: &Path, keep: u32) -> std::io::Result<()> {
    let numbered = |n: u32| {
        let mut name = current.as_os_str().to_owned();
        name.push(format!(".{n}"));
        PathBuf::from(name)
    };
    let missing_ok = |result: std::io::Result<()>| match result {
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        other => other,
    };

    if keep == 0 {
        return missing_ok(std::fs::remove_file(current));
    }
    missing_ok(std::fs::remove_file(numbered(keep)))?;
    for n in (1..=keep).rev() {
        let from = if n == 1 {
            current.to_path_buf()
        } else {
            numbered(n - 1)
        };
        missing_ok(std::fs::rename(&from, numbered(n)))?;
    }
    Ok(())
}

// ─── Bootstrap ───────────────────────────────────────────────────────────────

/// Runtime switches that come from the command line rather than the file.
#[derive(Debug, Clone, Copy, Default)]
pub struct RunOptions {
    /// Skip container discovery even when the config enables it.
    pub no_discovery: bool,
}

/// Run the router until Ctrl-C.
pub async fn run(config: RouterConfig, options: RunOptions) -> anyhow::Result<()> {
    run_until(config, options, async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "failed to listen for ctrl-c");
        }
    })
    .await
}

/// Run the router until `shutdown` completes.
///
/// Registers the static servers, optionally connects to them, starts
/// discovery, then on shutdown stops discovery before disconnecting every
/// server.
pub async fn run_until<F>(
    config: RouterConfig,
    options: RunOptions,
    shutdown: F,
) -> anyhow::Result<()>
where
    F: Future<Output = ()>,
{
    config.validate().context("invalid configuration")?;

    let factory = Arc::new(DefaultTransportFactory::new(config.socket_config()));
    let router = Router::new(factory, config.client_settings());

    for record in &config.servers {
        router
            .register_server(record.clone())
            .await
            .with_context(|| format!("failed to register server '{}'", record.id))?;
    }
    tracing::info!(count = config.servers.len(), "registered static servers");

    if config.connect_on_start {
        let failures = router.connect_to_all_servers().await;
        for (id, e) in &failures {
            tracing::warn!(server = %id, error = %e, "initial connect failed");
        }
        tracing::info!(
            connected = router.connected_servers().len(),
            failed = failures.len(),
            "initial connect pass complete"
        );
    }

    let discovery = if config.discovery.enabled && !options.no_discovery {
        let source = DockerSource::new(&config.discovery.docker_endpoint)
            .context("failed to create docker discovery source")?;
        let service = DiscoveryService::new(
            Arc::new(source),
            Arc::new(router.clone()),
            config.discovery_settings(),
        );
        service.start().await;
        Some(service)
    } else {
        tracing::info!("discovery disabled");
        None
    };

    shutdown.await;
    tracing::info!("shutting down");

    if let Some(service) = discovery {
        service.stop().await;
    }
    router.shutdown().await;

    tracing::info!("=== mcp-router stopped ===");
    Ok(())
}
