use anyhow::Context;
use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;

use tubecast::commands::{self, AppContext, BatchArgs, UploadArgs};
use tubecast::{config, single_instance};

#[derive(Debug, Parser)]
#[command(name = "tubecast", version, about = "Resumable video uploads to YouTube")]
struct Cli {
    /// Log at debug level
    #[arg(long, short, global = true)]
    verbose: bool,

    /// Opens the interactive menu when omitted
    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Upload a single video
    Upload(UploadArgs),
    /// Upload every video in a folder, one after another
    Batch(BatchArgs),
    /// List recent uploads on the channel
    List {
        #[arg(long, short = 'n', default_value_t = commands::DEFAULT_LIST_COUNT)]
        count: u32,
    },
    /// Show details of one video
    Info { video_id: String },
    /// List the channel's playlists
    Playlists,
    /// Configure defaults interactively
    Setup,
    /// Show today's API quota usage
    Quota,
    /// List interrupted uploads that can be resumed
    Sessions,
    /// Show locally recorded upload outcomes
    History {
        #[arg(long, short = 'n', default_value_t = 20)]
        count: u32,
    },
}

fn init_logging(level: &str, verbose: bool) {
    let level = if verbose { "debug" } else { level };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level))
        .format_timestamp(None)
        .init();
}

async fn run(cli: Cli) -> anyhow::Result<i32> {
    let config = config::load_config().context("Failed to load configuration")?;
    init_logging(&config.log_level, cli.verbose);
    log::debug!("Starting tubecast {}", env!("CARGO_PKG_VERSION"));

    if let Some(Command::Setup) = cli.command {
        return Ok(commands::setup(config)?);
    }

    let _instance = single_instance::acquire()?;
    let cancel = CancellationToken::new();
    single_instance::register_cancel_handler(cancel.clone())?;

    let mut ctx = AppContext::open(config, cancel)
        .await
        .context("Failed to open the state database")?;

    let code = match cli.command {
        None => commands::interactive(&mut ctx).await?,
        Some(Command::Upload(args)) => commands::upload(&ctx, args).await?,
        Some(Command::Batch(args)) => commands::batch(&ctx, args).await?,
        Some(Command::List { count }) => commands::list(&ctx, count).await?,
        Some(Command::Info { video_id }) => commands::info(&ctx, &video_id).await?,
        Some(Command::Playlists) => commands::playlists(&ctx).await?,
        Some(Command::Quota) => commands::quota(&ctx).await?,
        Some(Command::Sessions) => commands::sessions(&ctx).await?,
        Some(Command::History { count }) => commands::history(&ctx, count).await?,
        Some(Command::Setup) => 0,
    };
    Ok(code)
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    let code = match run(cli).await {
        Ok(code) => code,
        Err(e) => {
            log::error!("{:#}", e);
            eprintln!("Error: {:#}", e);
            1
        }
    };
    std::process::exit(code);
}
