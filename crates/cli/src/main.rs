mod db_commands;
mod doctor_commands;
mod metrics_server;
mod run_commands;

use std::path::PathBuf;

use {
    anyhow::Context,
    clap::{Parser, Subcommand},
    herald_config::HeraldConfig,
    tracing::info,
    tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt},
};

#[derive(Parser)]
#[command(name = "herald", about = "Herald: database change feed for Telegram", version)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,

    /// Log level (trace, debug, info, warn, error).
    #[arg(long, global = true, default_value = "info")]
    log_level: String,

    /// Output logs as JSON instead of human-readable.
    #[arg(long, global = true, default_value_t = false)]
    json_logs: bool,

    /// Config file (overrides discovery of herald.{toml,yaml,yml,json}).
    #[arg(long, global = true, env = "HERALD_CONFIG")]
    config: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// Start sources and deliver changes (default when no subcommand is provided).
    Run,
    /// Validate the config and check the environment.
    Doctor,
    /// Enqueue one message and flush it.
    Send {
        /// Chat id or @channel.
        #[arg(long)]
        to: String,
        /// Forum topic id.
        #[arg(long)]
        thread: Option<String>,
        #[arg(short, long)]
        message: String,
        /// Send the message as-is instead of escaping it for MarkdownV2.
        #[arg(long, default_value_t = false)]
        raw: bool,
    },
    /// Install change triggers on every configured Postgres database.
    InstallTriggers,
    /// Show the most recent delivery audit records (sqlite backend).
    Audit {
        #[arg(short = 'n', long, default_value_t = 20)]
        limit: u32,
    },
}

fn init_telemetry(cli: &Cli) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&cli.log_level));

    let registry = tracing_subscriber::registry().with(filter);

    if cli.json_logs {
        registry
            .with(fmt::layer().json().with_target(true).with_thread_ids(false))
            .init();
    } else {
        registry
            .with(
                fmt::layer()
                    .with_target(false)
                    .with_thread_ids(false)
                    .with_ansi(true),
            )
            .init();
    }
}

fn load_config(cli: &Cli) -> anyhow::Result<HeraldConfig> {
    match &cli.config {
        Some(path) => herald_config::load_config(path)
            .with_context(|| format!("failed to load {}", path.display())),
        None => Ok(herald_config::discover_and_load()),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();

    init_telemetry(&cli);

    info!(version = env!("CARGO_PKG_VERSION"), "herald starting");

    match &cli.command {
        None | Some(Commands::Run) => run_commands::handle_run(load_config(&cli)?).await,
        Some(Commands::Doctor) => doctor_commands::handle_doctor(cli.config.as_deref()).await,
        Some(Commands::Send {
            to,
            thread,
            message,
            raw,
        }) => {
            run_commands::handle_send(
                load_config(&cli)?,
                to.clone(),
                thread.clone(),
                message,
                *raw,
            )
            .await
        },
        Some(Commands::InstallTriggers) => {
            db_commands::handle_install_triggers(&load_config(&cli)?).await
        },
        Some(Commands::Audit { limit }) => {
            db_commands::handle_audit(&load_config(&cli)?, *limit).await
        },
    }
}
