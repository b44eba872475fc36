use anyhow::Result;
use clap::{CommandFactory, Parser};
use color_eyre::config::HookBuilder;
use std::path::{Path, PathBuf};
use tracing_subscriber::EnvFilter;

mod handlers;

/// ossxfer - resumable multipart transfers for S3-compatible object storage
#[derive(Parser, Debug)]
#[command(name = "ossxfer")]
#[command(version)]
#[command(about = "Upload, download and copy objects of any size, resumably", long_about = None)]
struct Cli {
    /// Configuration file (default: ~/.config/ossxfer/config.toml)
    #[arg(long, global = true, env = "OSSXFER_CONFIG")]
    config: Option<PathBuf>,

    /// Subcommand to run
    #[command(subcommand)]
    command: Commands,
}

#[derive(clap::Subcommand, Debug)]
enum Commands {
    /// Upload a local file
    Upload {
        /// Local file
        file: PathBuf,
        /// Destination as <bucket>/<key>
        target: String,
        /// Content type (guessed from the file name when omitted)
        #[arg(long)]
        content_type: Option<String>,
        #[command(flatten)]
        transfer: TransferArgs,
    },

    /// Download an object to a local file
    Download {
        /// Source as <bucket>/<key>
        source: String,
        /// Local file
        file: PathBuf,
        /// Byte range, e.g. bytes=0-1023
        #[arg(long)]
        range: Option<String>,
        /// Object version
        #[arg(long)]
        version_id: Option<String>,
        #[command(flatten)]
        transfer: TransferArgs,
    },

    /// Copy an object on the server side
    Copy {
        /// Source as <bucket>/<key>
        source: String,
        /// Destination as <bucket>/<key>
        target: String,
        /// Source object version
        #[arg(long)]
        version_id: Option<String>,
        /// Storage class of the copy
        #[arg(long)]
        storage_class: Option<String>,
        #[command(flatten)]
        transfer: TransferArgs,
    },

    /// Configuration management
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },

    /// Shell completion
    Completion {
        /// Shell type (bash, zsh, fish, elvish, powershell)
        shell: String,
    },
}

#[derive(clap::Subcommand, Debug)]
enum ConfigAction {
    /// Show the current configuration
    Show,
    /// Validate the configuration
    Validate,
}

/// Per-call overrides of the `[transfer]` settings
#[derive(clap::Args, Debug, Clone, Default)]
pub struct TransferArgs {
    /// Bytes per part
    #[arg(long)]
    pub part_size: Option<u64>,
    /// Parts in flight at once
    #[arg(long)]
    pub parallel: Option<usize>,
    /// Record progress so an interrupted transfer can resume
    #[arg(long)]
    pub checkpoint: bool,
    /// Where checkpoint files live (implies --checkpoint)
    #[arg(long)]
    pub checkpoint_dir: Option<PathBuf>,
    /// Keep uploaded parts when a transfer fails
    #[arg(long)]
    pub leave_parts: bool,
    /// Re-check already downloaded bytes when resuming
    #[arg(long)]
    pub verify_data: bool,
    /// Hide the progress bar
    #[arg(long)]
    pub no_progress: bool,
}

fn init_logging(config: Option<&Path>) {
    // RUST_LOG wins; otherwise the configured level, otherwise warnings only
    let level = handlers::load(config)
        .ok()
        .and_then(|c| c.logging)
        .map(|l| l.level)
        .unwrap_or_else(|| "warn".to_string());

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level)),
        )
        .with_writer(std::io::stderr)
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    // Setup error handling
    if let Err(e) = HookBuilder::default().install() {
        eprintln!("Warning: Failed to install error handler: {}", e);
    }

    let cli = Cli::parse();
    let config = cli.config.as_deref();
    init_logging(config);

    match cli.command {
        Commands::Upload {
            file,
            target,
            content_type,
            transfer,
        } => handlers::handle_upload(config, &file, &target, content_type, &transfer).await,
        Commands::Download {
            source,
            file,
            range,
            version_id,
            transfer,
        } => {
            handlers::handle_download(config, &source, &file, range.as_deref(), version_id, &transfer)
                .await
        }
        Commands::Copy {
            source,
            target,
            version_id,
            storage_class,
            transfer,
        } => {
            handlers::handle_copy(config, &source, &target, version_id, storage_class, &transfer)
                .await
        }
        Commands::Config { action } => {
            let action_str = match action {
                ConfigAction::Show => "show",
                ConfigAction::Validate => "validate",
            };
            handlers::handle_config(config, action_str).await
        }
        Commands::Completion { shell } => {
            handlers::handle_completion(&shell, &mut Cli::command()).await
        }
    }
}
