//! funcurl CLI entry point.
//!
//! `funcurl serve` runs the local simulation server; `funcurl invoke`
//! dispatches a single Function URL event read as JSON and prints the
//! response envelope.

use std::io::Read;
use std::path::PathBuf;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use funcurl_common::{ConfigFile, OriginKind, RuntimeConfig};
use funcurl_server::server::parse_bind_addr;
use funcurl_server::{AppState, EdgeServer, InboundEvent, ServerConfig};

#[derive(Debug, Parser)]
#[command(name = "funcurl", version, about = "Function URL edge router")]
struct Cli {
    /// Emit logs as JSON.
    #[arg(long, global = true)]
    log_json: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Run the local simulation server.
    Serve(ServeArgs),
    /// Dispatch one inbound event and print the envelope.
    Invoke(InvokeArgs),
}

#[derive(Debug, clap::Args)]
struct ServeArgs {
    /// TOML configuration file.
    #[arg(long, short, env = "FUNCURL_CONFIG")]
    config: Option<PathBuf>,

    /// Bind address, overriding the config file.
    #[arg(long, env = "BIND_ADDR")]
    bind: Option<String>,

    /// Directory served in place of the object store.
    #[arg(long)]
    object_store_root: Option<PathBuf>,

    /// Directory served in place of the source host.
    #[arg(long)]
    source_host_root: Option<PathBuf>,

    /// Add permissive CORS headers.
    #[arg(long)]
    cors: bool,
}

#[derive(Debug, clap::Args)]
struct InvokeArgs {
    /// Event JSON file; stdin when omitted.
    #[arg(long)]
    event: Option<PathBuf>,

    /// TOML configuration file.
    #[arg(long, short, env = "FUNCURL_CONFIG")]
    config: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.log_json);

    match cli.command {
        Command::Serve(args) => serve(args).await,
        Command::Invoke(args) => invoke(args).await,
    }
}

fn init_tracing(json: bool) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "info,funcurl=debug".into());
    let registry = tracing_subscriber::registry().with(filter);
    if json {
        registry.with(tracing_subscriber::fmt::layer().json()).init();
    } else {
        registry.with(tracing_subscriber::fmt::layer()).init();
    }
}

/// Load the config file (if any) and the runtime configuration, preferring
/// the file's `[runtime]` table over the environment.
fn load_config(path: Option<&PathBuf>) -> anyhow::Result<(ConfigFile, RuntimeConfig)> {
    let file = match path {
        Some(path) => ConfigFile::from_file(path)
            .with_context(|| format!("Failed to load {}", path.display()))?,
        None => ConfigFile::default(),
    };
    let runtime = match &file.runtime {
        Some(runtime) => runtime.clone(),
        None => RuntimeConfig::from_env().context("Failed to read runtime configuration")?,
    };
    Ok((file, runtime))
}

async fn serve(args: ServeArgs) -> anyhow::Result<()> {
    info!("Starting funcurl");

    let (mut file, runtime) = load_config(args.config.as_ref())?;
    if args.object_store_root.is_some() {
        file.simulation.object_store_root = args.object_store_root;
    }
    if args.source_host_root.is_some() {
        file.simulation.source_host_root = args.source_host_root;
    }
    if let Some(bind) = args.bind {
        file.server.bind_addr = bind;
    }
    file.server.cors |= args.cors;

    let simulation_root = match runtime.origin.main {
        OriginKind::ObjectStore => file.simulation.object_store_root.as_deref(),
        OriginKind::SourceHost => file.simulation.source_host_root.as_deref(),
    };

    let state = AppState::new(&runtime, simulation_root)
        .context("Failed to initialize runtime")?
        .with_clear_cache_per_request(file.server.clear_cache_per_request);

    parse_bind_addr(&file.server.bind_addr)
        .context("Invalid bind address. Expected format: 'host:port' (e.g., '127.0.0.1:3210')")?;
    let server_config = ServerConfig::from_file(&file.server)?;

    info!(
        bind_addr = %server_config.bind_addr,
        origin = ?runtime.origin.main,
        current_path = %runtime.origin.current_path(),
        simulated = simulation_root.is_some(),
        "Configuration loaded"
    );
    info!("Server initialized. Available endpoints:");
    info!("  GET    /_funcurl/health  - Health check");
    info!("  GET    /_funcurl/cache   - Module cache statistics");
    info!("  DELETE /_funcurl/cache   - Clear the module cache");
    info!("  *      /*                - Function URL dispatch");

    EdgeServer::new(state, server_config).run().await?;

    Ok(())
}

async fn invoke(args: InvokeArgs) -> anyhow::Result<()> {
    let (file, runtime) = load_config(args.config.as_ref())?;

    let raw = match &args.event {
        Some(path) => std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read {}", path.display()))?,
        None => {
            let mut raw = String::new();
            std::io::stdin()
                .read_to_string(&mut raw)
                .context("Failed to read event from stdin")?;
            raw
        }
    };
    let event: InboundEvent = serde_json::from_str(&raw).context("Event is not valid JSON")?;

    let simulation_root = match runtime.origin.main {
        OriginKind::ObjectStore => file.simulation.object_store_root.as_deref(),
        OriginKind::SourceHost => file.simulation.source_host_root.as_deref(),
    };
    let state = AppState::new(&runtime, simulation_root).context("Failed to initialize runtime")?;

    let envelope = state.dispatcher().dispatch(&event).await;
    println!("{}", serde_json::to_string_pretty(&envelope)?);

    Ok(())
}
