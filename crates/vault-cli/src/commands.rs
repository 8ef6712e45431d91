use std::io::{Read, Write};
use std::path::Path;

use anyhow::{bail, Context};
use chrono::{DateTime, Utc};
use colored::Colorize;
use tracing::debug;
use vault_drive::{Drive, DriveOptions, Entry, ReadOptions, SecretKey};

use crate::cli::*;

pub async fn run_command(cli: Cli) -> anyhow::Result<()> {
    let options = load_options(&cli)?;
    match cli.command {
        Command::Keygen => cmd_keygen(),
        Command::Init(args) => cmd_init(&cli.dir, options, args).await,
        Command::Info => cmd_info(&open(&cli.dir, options).await?).await,
        Command::Put(args) => cmd_put(&open(&cli.dir, options).await?, args).await,
        Command::Cat(args) => cmd_cat(&open(&cli.dir, options).await?, args).await,
        Command::Ls(args) => cmd_ls(&open(&cli.dir, options).await?, args).await,
        Command::Rm(args) => {
            let drive = open(&cli.dir, options).await?;
            let version = drive.unlink(&args.path).await?;
            println!("{} Removed {} (version {})", "✓".green(), args.path.bold(), version);
            drive.close().await?;
            Ok(())
        }
        Command::Mkdir(args) => {
            let drive = open(&cli.dir, options).await?;
            let version = drive.mkdir(&args.path).await?;
            println!("{} Created {} (version {})", "✓".green(), args.path.bold(), version);
            drive.close().await?;
            Ok(())
        }
        Command::Log(args) => cmd_log(&open(&cli.dir, options).await?, args).await,
        Command::Sync(args) => cmd_sync(options, args).await,
    }
}

/// Options file first, then flags.
fn load_options(cli: &Cli) -> anyhow::Result<DriveOptions> {
    let mut options = match &cli.config {
        Some(path) => DriveOptions::load(path)
            .with_context(|| format!("loading options from {}", path.display()))?,
        None => DriveOptions::default(),
    };
    let o = &cli.overrides;
    options.sparse |= o.sparse;
    options.latest |= o.latest;
    if let Some(n) = o.metadata_cache_size {
        options.metadata_cache_size = n;
    }
    if let Some(n) = o.content_cache_size {
        options.content_cache_size = n;
    }
    if let Some(n) = o.tree_cache_size {
        options.tree_cache_size = n;
    }
    Ok(options)
}

async fn open(dir: &Path, options: DriveOptions) -> anyhow::Result<Drive> {
    if !dir.exists() {
        bail!("no drive at {} (run `vault init` first)", dir.display());
    }
    debug!(dir = %dir.display(), sparse = options.sparse, latest = options.latest, "opening drive");
    Drive::open_dir(dir, None, options)
        .await
        .with_context(|| format!("opening drive at {}", dir.display()))
}

async fn cmd_init(dir: &Path, mut options: DriveOptions, args: InitArgs) -> anyhow::Result<()> {
    if let Some(secret) = args.secret_key {
        options.secret_key = Some(secret);
    }
    let drive = Drive::open_dir(dir, None, options)
        .await
        .with_context(|| format!("creating drive at {}", dir.display()))?;
    println!("{} Initialized drive in {}", "✓".green().bold(), dir.display().to_string().bold());
    println!("  Key: {}", drive.key().to_string().cyan());
    println!("  Version: {}", drive.version());
    drive.close().await?;
    Ok(())
}

async fn cmd_info(drive: &Drive) -> anyhow::Result<()> {
    println!("Key:       {}", drive.key().to_string().cyan());
    println!("Discovery: {}", drive.discovery_key().to_hex().dimmed());
    let access = if drive.writable() { "read-write".green() } else { "read-only".yellow() };
    println!("Access:    {}", access);
    println!("Version:   {}", drive.version().to_string().bold());
    println!(
        "Metadata:  {} blocks, {} downloaded",
        drive.metadata().length(),
        drive.metadata().downloaded()
    );
    match drive.content() {
        Some(content) => {
            let feed = content.feed();
            println!(
                "Content:   {} blocks, {} bytes, {} downloaded",
                feed.length(),
                feed.byte_length(),
                feed.downloaded()
            );
            println!("           key {}", feed.key().to_string().dimmed());
        }
        None => println!("Content:   {}", "not linked yet".yellow()),
    }
    drive.close().await?;
    Ok(())
}

async fn cmd_put(drive: &Drive, args: PutArgs) -> anyhow::Result<()> {
    let data = if args.source == "-" {
        let mut buf = Vec::new();
        std::io::stdin()
            .read_to_end(&mut buf)
            .context("reading stdin")?;
        buf
    } else {
        std::fs::read(&args.source).with_context(|| format!("reading {}", args.source))?
    };
    let size = data.len();
    let version = drive.write_file(&args.path, data).await?;
    println!(
        "{} Wrote {} ({} bytes, version {})",
        "✓".green(),
        args.path.bold(),
        size,
        version
    );
    drive.close().await?;
    Ok(())
}

async fn cmd_cat(drive: &Drive, args: CatArgs) -> anyhow::Result<()> {
    let opts = ReadOptions { cached: args.cached };
    let data = match args.at {
        Some(version) => drive.checkout(version).read_file_with(&args.path, opts).await?,
        None => drive.read_file_with(&args.path, opts).await?,
    };
    std::io::stdout().write_all(&data)?;
    drive.close().await?;
    Ok(())
}

async fn cmd_ls(drive: &Drive, args: LsArgs) -> anyhow::Result<()> {
    let view = drive.checkout(args.at.unwrap_or_else(|| drive.version()));
    let names = view.readdir(&args.path).await?;
    let base = args.path.trim_end_matches('/');
    for name in names {
        let child = format!("{base}/{name}");
        let stat = view.stat(&child).await?;
        let shown = if stat.is_directory() {
            format!("{name}/").blue().bold()
        } else {
            name.normal()
        };
        if args.long {
            let entry = stat.entry.map_or_else(|| "-".to_string(), |e| e.to_string());
            println!("{:o} {:>10} {:>6}  {}", stat.mode, stat.size, entry, shown);
        } else {
            println!("{shown}");
        }
    }
    drive.close().await?;
    Ok(())
}

async fn cmd_log(drive: &Drive, args: LogArgs) -> anyhow::Result<()> {
    let history = drive.history(drive.version()).await?;
    let skip = args
        .limit
        .map_or(0, |limit| history.len().saturating_sub(limit));
    for (index, entry) in history.into_iter().skip(skip) {
        println!("{}", describe(index, &entry));
    }
    drive.close().await?;
    Ok(())
}

fn describe(index: u64, entry: &Entry) -> String {
    let when = DateTime::<Utc>::from_timestamp_millis(entry.mtime)
        .map(|t| t.format("%Y-%m-%d %H:%M:%S").to_string())
        .unwrap_or_default();
    let (action, detail) = match entry.content() {
        Some(range) => ("put".green(), format!("{} bytes", range.byte_length)),
        None if entry.is_directory() => ("mkdir".blue(), String::new()),
        None => ("rm".red(), String::new()),
    };
    format!(
        "{:>6}  {}  {:<5} {} {}",
        index.to_string().yellow(),
        when.dimmed(),
        action,
        entry.path,
        detail.dimmed()
    )
}

/// Replicate `source` into `target` over an in-process stream until the
/// replica holds every block.
async fn cmd_sync(mut options: DriveOptions, args: SyncArgs) -> anyhow::Result<()> {
    options.secret_key = None;
    options.sparse = false;
    options.sparse_metadata = false;
    let source = open(&args.source, options.clone()).await?;
    let target = Drive::open_dir(&args.target, Some(source.key()), options)
        .await
        .with_context(|| format!("opening replica at {}", args.target.display()))?;

    debug!(source = %source.key(), target = %args.target.display(), "starting sync");
    let (a, b) = tokio::io::duplex(1024 * 1024);
    source.replicate(a).await?;
    target.replicate(b).await?;

    let version = source.version();
    target.metadata().wait_for_length(version).await?;
    target.metadata().download(0..version).await?;
    if let Some(source_content) = source.content() {
        let content = target.content_ready().await?;
        let length = source_content.feed().length();
        content.feed().wait_for_length(length).await?;
        content.feed().download(0..length).await?;
    }
    println!(
        "{} Synced {} into {} (version {})",
        "✓".green().bold(),
        source.key().to_string().cyan(),
        args.target.display(),
        version
    );
    target.close().await?;
    source.close().await?;
    Ok(())
}

/// Print a fresh keypair for `init --secret-key`.
fn cmd_keygen() -> anyhow::Result<()> {
    let secret = SecretKey::generate();
    let options = DriveOptions::default().with_secret_key(&secret);
    println!("Public key: {}", secret.public_key().to_string().cyan());
    println!("Secret key: {}", options.secret_key.unwrap_or_default());
    Ok(())
}
