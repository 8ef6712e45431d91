use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};

#[derive(Parser)]
#[command(
    name = "vault",
    about = "Vault — versioned, replicable file trees on signed append-only logs",
    version
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,

    /// Drive directory
    #[arg(short, long, global = true, default_value = ".vault")]
    pub dir: PathBuf,

    /// TOML file with drive options
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    #[command(flatten)]
    pub overrides: OptionOverrides,

    #[arg(short, long, global = true)]
    pub verbose: bool,
}

/// Per-flag overrides of the drive options file.
#[derive(Args, Debug, Default)]
pub struct OptionOverrides {
    /// Only download content that is read
    #[arg(long, global = true)]
    pub sparse: bool,
    /// Follow new versions as they arrive
    #[arg(long, global = true)]
    pub latest: bool,
    #[arg(long, global = true)]
    pub metadata_cache_size: Option<usize>,
    #[arg(long, global = true)]
    pub content_cache_size: Option<usize>,
    #[arg(long, global = true)]
    pub tree_cache_size: Option<usize>,
}

#[derive(Subcommand)]
pub enum Command {
    /// Generate a keypair
    Keygen,
    /// Create a new drive
    Init(InitArgs),
    /// Show keys, version and sizes
    Info,
    /// Write a file into the drive
    Put(PutArgs),
    /// Print a file
    Cat(CatArgs),
    /// List a directory
    Ls(LsArgs),
    /// Remove a file
    Rm(PathArgs),
    /// Create a directory
    Mkdir(PathArgs),
    /// List metadata entries
    Log(LogArgs),
    /// Copy every block of one drive into a replica directory
    Sync(SyncArgs),
}

#[derive(Args)]
pub struct InitArgs {
    /// Hex secret key to create the drive with
    #[arg(long)]
    pub secret_key: Option<String>,
}

#[derive(Args)]
pub struct PutArgs {
    /// Path inside the drive
    pub path: String,
    /// Local file to read, or `-` for stdin
    pub source: String,
}

#[derive(Args)]
pub struct CatArgs {
    pub path: String,
    /// Read as of this version
    #[arg(long = "version", value_name = "N")]
    pub at: Option<u64>,
    /// Fail instead of downloading missing content
    #[arg(long)]
    pub cached: bool,
}

#[derive(Args)]
pub struct LsArgs {
    #[arg(default_value = "/")]
    pub path: String,
    #[arg(long = "version", value_name = "N")]
    pub at: Option<u64>,
    /// Show size and entry for each child
    #[arg(short, long)]
    pub long: bool,
}

#[derive(Args)]
pub struct PathArgs {
    pub path: String,
}

#[derive(Args)]
pub struct LogArgs {
    #[arg(short = 'n', long)]
    pub limit: Option<usize>,
}

#[derive(Args)]
pub struct SyncArgs {
    /// Directory of the source drive
    pub source: PathBuf,
    /// Directory of the replica; created if missing
    pub target: PathBuf,
}
