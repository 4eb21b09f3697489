use anyhow::{Context as AnyhowContext, Result};
use clap::{Args, Parser, Subcommand, ValueEnum};
use sentinel_engine::EngineConfig;
use std::path::{Path, PathBuf};

mod commands;
mod input;

#[derive(Parser)]
#[command(name = "sentinel")]
#[command(about = "Content moderation engine for chat communities", long_about = None)]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Quiet mode: log only warnings/errors (stdout is reserved for JSON)
    #[arg(long, global = true)]
    quiet: bool,

    /// Engine config file (TOML)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Directory for activity and community snapshots (overrides the config file)
    #[arg(long, global = true)]
    state_dir: Option<PathBuf>,

    /// Directory of known scam images (overrides the config file)
    #[arg(long, global = true)]
    corpus_dir: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// Check JSON-lines messages and print one JSON line per verdict
    Check(InputArgs),

    /// Like `check`, but keep running and reload the corpus when it changes
    Run(InputArgs),

    /// Compare one local image against the scam-image corpus
    #[command(name = "scan-image")]
    ScanImage(PathArgs),

    /// Register an image as a known scam image
    #[command(name = "add-scam")]
    AddScam(PathArgs),

    /// Update a community's moderation settings
    Set(SetArgs),

    /// Print every word order of a phrase
    Permutations(PhraseArgs),
}

#[derive(Args)]
struct InputArgs {
    /// JSON-lines file with one message per line (defaults to stdin)
    #[arg(long)]
    input: Option<PathBuf>,

    /// Read attachments given as local paths or file:// URLs (trusted input only)
    #[arg(long)]
    local_attachments: bool,
}

impl InputArgs {
    fn apply(&self, config: &mut EngineConfig) {
        if self.local_attachments {
            config.images.allow_local_files = true;
        }
    }
}

#[derive(Args)]
struct PathArgs {
    /// Image file
    path: PathBuf,
}

#[derive(Args)]
struct SetArgs {
    /// Community id
    #[arg(long)]
    community: String,

    /// Channel receiving moderation reports (empty string clears it)
    #[arg(long)]
    log_channel: Option<String>,

    /// Channel receiving community events (empty string clears it)
    #[arg(long)]
    events_channel: Option<String>,

    /// NSFW image classification for this community
    #[arg(long, value_enum)]
    nsfw: Option<Toggle>,
}

#[derive(Args)]
struct PhraseArgs {
    phrase: String,
}

#[derive(Clone, Copy, ValueEnum)]
enum Toggle {
    On,
    Off,
}

impl Toggle {
    const fn enabled(self) -> bool {
        matches!(self, Self::On)
    }
}

fn init_logging(cli: &Cli) {
    let mut builder =
        env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"));
    if cli.quiet {
        builder.filter_level(log::LevelFilter::Warn);
    } else if cli.verbose {
        builder.filter_level(log::LevelFilter::Debug);
    }
    if !cli.verbose {
        builder.filter_module("ort", log::LevelFilter::Off);
    }
    builder.target(env_logger::Target::Stderr).init();
}

fn load_config(
    path: Option<&Path>,
    state_dir: Option<PathBuf>,
    corpus_dir: Option<PathBuf>,
) -> Result<EngineConfig> {
    let mut config = EngineConfig::load(path).context("Failed to load engine config")?;
    if let Some(dir) = state_dir {
        config.state_dir = dir;
    }
    if let Some(dir) = corpus_dir {
        config.corpus_dir = dir;
    }
    Ok(config)
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(&cli);

    if let Commands::Permutations(args) = &cli.command {
        return commands::permutations(&args.phrase);
    }

    let mut config = load_config(cli.config.as_deref(), cli.state_dir, cli.corpus_dir)?;
    match cli.command {
        Commands::Check(args) => {
            args.apply(&mut config);
            commands::check(config, args.input.as_deref(), false).await?;
        }
        Commands::Run(args) => {
            args.apply(&mut config);
            commands::check(config, args.input.as_deref(), true).await?;
        }
        Commands::ScanImage(args) => commands::scan_image(config, &args.path).await?,
        Commands::AddScam(args) => commands::add_scam(&config, &args.path).await?,
        Commands::Set(args) => {
            commands::set_community(
                &config,
                &args.community,
                args.log_channel,
                args.events_channel,
                args.nsfw.map(Toggle::enabled),
            )
            .await?;
        }
        Commands::Permutations(_) => {}
    }
    Ok(())
}
