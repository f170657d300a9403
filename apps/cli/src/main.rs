//! MediaFetch CLI - Command-line media fetcher
//!
//! Resumable downloads, batches, and segmented streams from the terminal.

mod commands;
mod output;
mod progress;

use anyhow::Result;
use clap::{Parser, Subcommand};
use mediafetch_core::{default_data_dir, MediaFetch, Paths};
use std::path::PathBuf;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter};

/// MediaFetch - resumable media downloads
#[derive(Parser)]
#[command(name = "mediafetch")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
struct Cli {
    /// Data directory for settings, job metadata and the media database
    #[arg(long, env = "MEDIAFETCH_DATA_DIR", global = true)]
    data_dir: Option<PathBuf>,

    /// Output format
    #[arg(long, default_value = "human", global = true)]
    output: OutputFormat,

    /// Verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, clap::ValueEnum)]
enum OutputFormat {
    Human,
    Json,
    Table,
}

#[derive(Clone, Copy, Debug, clap::ValueEnum)]
enum KindArg {
    UrlList,
    Profile,
    Collection,
}

#[derive(Subcommand)]
enum Commands {
    /// Download one media URL
    Get {
        /// Page or file URL
        url: String,

        /// Directory to save into (defaults to the configured download dir)
        #[arg(short, long)]
        dir: Option<PathBuf>,

        /// Exact output file name
        #[arg(short, long)]
        name: Option<String>,

        /// Extension to use when the source doesn't imply one
        #[arg(short, long)]
        format: Option<String>,

        /// Expected SHA-256 of the file
        #[arg(long)]
        checksum: Option<String>,

        /// Extra request header, as "Name: value"
        #[arg(short = 'H', long = "header")]
        headers: Vec<String>,
    },

    /// Download many URLs as one batch
    Batch {
        /// URLs to download
        urls: Vec<String>,

        /// Read URLs from a file, one per line
        #[arg(long)]
        file: Option<PathBuf>,

        /// How inputs are interpreted
        #[arg(long, default_value = "url-list")]
        kind: KindArg,

        /// Items downloaded at once
        #[arg(short = 'j', long)]
        jobs: Option<usize>,

        /// Directory to save into
        #[arg(short, long)]
        dir: Option<PathBuf>,

        /// Extension to use when the source doesn't imply one
        #[arg(short, long)]
        format: Option<String>,

        /// Skip items whose output file already exists
        #[arg(long, default_value_t = true, action = clap::ArgAction::Set)]
        skip_existing: bool,
    },

    /// Download a segmented stream from its playlist
    Stream {
        /// Media playlist URL
        url: String,

        /// Output file
        #[arg(value_name = "OUTPUT")]
        dest: PathBuf,
    },

    /// List transfer jobs
    Jobs,

    /// Resume a paused or failed transfer job
    Resume {
        /// Job ID
        id: String,
    },

    /// Pause a transfer job
    Pause {
        /// Job ID
        id: String,
    },

    /// Remove a transfer job and its partial data
    Remove {
        /// Job ID
        id: String,
    },

    /// Retry a failed media item
    Retry {
        /// Media ID
        id: String,
    },

    /// Show manager and engine status
    Status,

    /// Show or update settings
    Config {
        #[command(subcommand)]
        action: Option<ConfigAction>,
    },

    /// Generate shell completions
    Completions {
        /// Shell to generate completions for
        shell: clap_complete::Shell,
    },
}

#[derive(Subcommand)]
pub enum ConfigAction {
    /// Show all settings
    Show,

    /// Print the settings file path
    Path,

    /// Get a setting
    Get {
        /// Setting key
        key: String,
    },

    /// Set a setting
    Set {
        /// Setting key
        key: String,

        /// New value
        value: String,
    },

    /// Reset to defaults
    Reset,
}

fn init_logging(verbose: bool) {
    let default_level = if verbose { "debug" } else { "warn" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(std::io::stderr).with_target(false))
        .init();
}

/// Token cancelled on the first Ctrl-C
fn interrupt_token() -> CancellationToken {
    let token = CancellationToken::new();
    let trigger = token.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            trigger.cancel();
        }
    });
    token
}

async fn run(
    app: &MediaFetch,
    command: Commands,
    format: OutputFormat,
    interrupt: &CancellationToken,
) -> Result<()> {
    match command {
        Commands::Get {
            url,
            dir,
            name,
            format: ext,
            checksum,
            headers,
        } => {
            let options = commands::get_options(dir, name, ext, checksum, &headers)?;
            commands::get(app, &url, options, format, interrupt).await
        }

        Commands::Batch {
            urls,
            file,
            kind,
            jobs,
            dir,
            format: ext,
            skip_existing,
        } => {
            let urls = commands::collect_urls(urls, file).await?;
            let config = commands::batch_config(app, jobs, dir, ext, skip_existing);
            commands::batch(app, kind, urls, config, format, interrupt).await
        }

        Commands::Stream { url, dest } => {
            commands::stream(app, &url, &dest, format, interrupt).await
        }

        Commands::Jobs => commands::list_jobs(app, format).await,

        Commands::Resume { id } => commands::resume(app, &id, format, interrupt).await,

        Commands::Pause { id } => commands::pause(app, &id, format).await,

        Commands::Remove { id } => commands::remove(app, &id, format).await,

        Commands::Retry { id } => commands::retry(app, &id, format).await,

        Commands::Status => commands::status(app, format).await,

        // Handled before the data directory is opened
        Commands::Config { .. } | Commands::Completions { .. } => Ok(()),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    let data_dir = cli.data_dir.unwrap_or_else(default_data_dir);
    let format = cli.output;

    let command = match cli.command {
        Commands::Completions { shell } => {
            use clap::CommandFactory;
            clap_complete::generate(
                shell,
                &mut Cli::command(),
                "mediafetch",
                &mut std::io::stdout(),
            );
            return Ok(());
        }
        Commands::Config { action } => {
            return commands::config_action(&Paths::new(data_dir), action, format).await;
        }
        command => command,
    };

    tracing::debug!(data_dir = %data_dir.display(), "opening data directory");
    let app = MediaFetch::open(data_dir).await?;
    let interrupt = interrupt_token();

    let result = run(&app, command, format, &interrupt).await;
    if let Err(e) = &result {
        tracing::debug!(error = %e, "command failed");
    }

    app.shutdown().await;
    result
}
