use clap::{
    ArgGroup,
    Parser,
    Subcommand,
};
use color_eyre::eyre::{
    Result,
    WrapErr,
};
use session_orchestrator::config::NetworkEnv;
use std::path::{
    Path,
    PathBuf,
};
use tracing_appender::{
    non_blocking::WorkerGuard,
    rolling,
};
use tracing_subscriber::{
    EnvFilter,
    fmt,
};

mod app;

#[derive(Parser, Debug)]
#[command(
    name = "wager-cli",
    about = "Play the VRF dice game from the terminal",
    version,
    group(
        ArgGroup::new("network")
            .args(["local", "testnet", "mainnet"])
            .required(true)
    )
)]
struct Args {
    /// Use the local development deployment
    #[arg(long)]
    local: bool,

    /// Use the public testnet deployment
    #[arg(long)]
    testnet: bool,

    /// Use the mainnet deployment
    #[arg(long)]
    mainnet: bool,

    /// Config file to use instead of the network's stored config
    #[arg(long)]
    config: Option<String>,

    /// Override the ledger gateway URL
    #[arg(long)]
    gateway_url: Option<String>,

    /// Player address (0x-prefixed hex)
    #[arg(long)]
    identity: String,

    /// Write logs to a daily rolling file
    #[arg(short, long, default_value = "false")]
    tracing: bool,

    /// Directory for log files
    #[arg(long, default_value = "logs")]
    log_dir: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug, Clone)]
pub enum Command {
    /// Show the current game and the actions available
    Status,
    /// Place a bet on a value
    Bet {
        #[arg(long)]
        value: u32,
        #[arg(long)]
        wager: u128,
    },
    /// Settle a game whose randomness has arrived
    Resolve,
    /// Cancel a game the oracle never answered
    Recover {
        /// Submit now instead of waiting for the game to be flagged stuck
        #[arg(long)]
        force: bool,
    },
    /// Follow the session live until interrupted
    Watch,
    /// Lifetime totals for this player
    Stats,
    /// Recently settled games
    History {
        #[arg(long, default_value = "10")]
        limit: usize,
    },
}

fn init_tracing(log_dir: &Path) -> WorkerGuard {
    let appender = rolling::daily(log_dir, "wager-cli.log");
    let (writer, guard) = tracing_appender::non_blocking(appender);
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,session_orchestrator=debug"));
    let _ = fmt()
        .with_env_filter(filter)
        .with_writer(writer)
        .with_ansi(false)
        .try_init();
    guard
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    color_eyre::install()?;
    let args = Args::parse();
    let _guard = args.tracing.then(|| init_tracing(&args.log_dir));

    let env = if args.local {
        NetworkEnv::Local
    } else if args.testnet {
        NetworkEnv::Testnet
    } else {
        NetworkEnv::Mainnet
    };
    let identity = args
        .identity
        .parse()
        .wrap_err("parsing --identity")?;
    let settings = app::Settings {
        env,
        config_path: args.config,
        gateway_url: args.gateway_url,
        identity,
    };
    app::run(settings, args.command).await
}
