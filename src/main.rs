//! nexusbridge - installs a Nexus Mods Collection directly into an
//! existing Mod Organizer 2 instance.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::Parser;
use tracing_subscriber::EnvFilter;

use nexusbridge::collection::{
    self, get_filename_candidates, CollectionDb, CollectionInstaller, InstallPhase,
    InstallProgress, InstallerConfig, ModDbEntry,
};
use nexusbridge::downloaders::NexusDownloader;
use nexusbridge::loot;

#[derive(Parser)]
#[command(name = "nexusbridge")]
#[command(author = "Nexus Bridge")]
#[command(version)]
#[command(about = "Install a Nexus Mods Collection directly into a Mod Organizer 2 instance")]
struct Cli {
    /// Collection URL (nexusmods.com/.../collections/<slug>) or path to a collection.json file
    collection_url: String,

    /// Path to the Mod Organizer 2 instance to install into
    mo2_path: PathBuf,

    /// Skip confirmation prompts and take the default action everywhere
    #[arg(short = 'y', long)]
    yes: bool,

    /// MO2 profile to write the mod/plugin order into (created if absent)
    #[arg(long, default_value = "Default")]
    profile: String,

    /// Resolve the collection and print a machine-readable summary without installing
    #[arg(long)]
    query: bool,

    /// Consume a single nxm:// link to satisfy one queued download (non-premium manual flow)
    #[arg(long, value_name = "nxm-url")]
    nxm: Option<String>,

    /// Override the download/install worker pool size (default: detected hardware concurrency)
    #[arg(long)]
    concurrent: Option<usize>,

    /// Enable verbose logging (use RUST_LOG=debug for more detail)
    #[arg(short, long)]
    verbose: bool,
}

/// Resolve the Nexus API key: env var, then `nexus_apikey.txt` in cwd, then
/// `<user-config-dir>/nexusbridge/apikey.txt`.
fn resolve_api_key() -> Result<String> {
    if let Ok(key) = std::env::var("NEXUS_API_KEY") {
        if !key.trim().is_empty() {
            return Ok(key.trim().to_string());
        }
    }

    if let Ok(key) = std::fs::read_to_string("nexus_apikey.txt") {
        let key = key.trim();
        if !key.is_empty() {
            return Ok(key.to_string());
        }
    }

    if let Some(config_dir) = dirs::config_dir() {
        let path = config_dir.join("nexusbridge").join("apikey.txt");
        if let Ok(key) = std::fs::read_to_string(&path) {
            let key = key.trim();
            if !key.is_empty() {
                return Ok(key.to_string());
            }
        }
    }

    bail!(
        "No Nexus API key found. Set NEXUS_API_KEY, create ./nexus_apikey.txt, \
         or write one to <config-dir>/nexusbridge/apikey.txt"
    )
}

/// Resolve `collection_url_or_path` to a local collection.json, downloading it first if needed.
async fn resolve_collection_path(input: &str, api_key: &str, output_dir: &PathBuf) -> Result<PathBuf> {
    if collection::is_url(input) {
        let url_info = collection::parse_collection_url(input)
            .with_context(|| format!("Could not parse collection URL: {}", input))?;
        collection::fetch_collection(&url_info, api_key, output_dir).await
    } else {
        let path = PathBuf::from(input);
        if !path.exists() {
            bail!("Collection file not found: {}", path.display());
        }
        Ok(path)
    }
}

async fn run_query(
    collection_path: &PathBuf,
    api_key: &str,
    mo2_path: &PathBuf,
    game_path: Option<PathBuf>,
) -> Result<()> {
    let collection = collection::load_collection(collection_path)?;

    let mut db = CollectionDb::in_memory()?;
    db.import_collection(&collection)?;

    let stats = db.get_mod_stats()?;
    let all_pending: Vec<ModDbEntry> = db.get_pending_downloads()?;

    let downloads_dir = mo2_path.join("downloads");
    let mut to_download = Vec::new();
    let mut already_have = 0usize;
    for m in all_pending {
        let on_disk = get_filename_candidates(&m).iter().any(|name| {
            std::fs::metadata(downloads_dir.join(name))
                .map(|meta| meta.len() == m.file_size.max(0) as u64)
                .unwrap_or(false)
        });
        if on_disk {
            already_have += 1;
        } else {
            to_download.push(m);
        }
    }

    let download_bytes: u64 = to_download.iter().map(|m| m.file_size.max(0) as u64).sum();
    let install_bytes: u64 = db
        .get_all_mods()?
        .iter()
        .map(|m| m.file_size.max(0) as u64)
        .sum();

    let premium = match NexusDownloader::new(api_key) {
        Ok(nexus) => nexus.validate().await.map(|info| info.is_premium).unwrap_or(false),
        Err(_) => false,
    };

    println!("COLLECTION_NAME:{}", collection.get_name());
    println!("GAME:{}", collection.get_domain_name());
    println!("TOTAL_MODS:{}", stats.total);
    println!("TO_DOWNLOAD:{}", to_download.len());
    println!("ALREADY_HAVE:{}", already_have);
    println!(
        "SKIPPED:{}",
        stats.total.saturating_sub(already_have + to_download.len())
    );
    println!("DOWNLOAD_BYTES:{}", download_bytes);
    println!("INSTALL_BYTES:{}", install_bytes);
    for m in &to_download {
        println!("QUEUE_ITEM:{}:{}:{}:{}", m.mod_id, m.file_id, m.file_size.max(0), m.name);
    }
    println!("Premium: {}", if premium { "Yes" } else { "No" });

    if game_path.is_none() {
        tracing::warn!(
            "Could not resolve the game installation path from {}",
            mo2_path.display()
        );
    }

    Ok(())
}

/// Renders installer progress events as the stdout protocol consumed by
/// wrapping GUIs: phase banners, per-item download/install lines, and a
/// final stats summary. Always written regardless of terminal capability;
/// log records (gated behind `-v`/`RUST_LOG`) go to stderr separately.
fn print_progress(progress: InstallProgress) {
    match progress {
        InstallProgress::PhaseStarted { phase, message } => {
            println!("Phase {}: {}", phase_number(phase), message);
        }
        InstallProgress::PhaseCompleted { phase } => {
            println!("Phase {} complete.", phase_number(phase));
        }
        InstallProgress::Downloading {
            mod_name,
            current,
            total,
            mod_index,
            mod_count,
        } => {
            let pct = if total > 0 {
                (current as f64 / total as f64) * 100.0
            } else {
                0.0
            };
            println!(
                "[{}/{}] Downloading: {} - {:.1} / {:.1} MB ({:.0}%)",
                mod_index,
                mod_count,
                mod_name,
                current as f64 / 1_048_576.0,
                total as f64 / 1_048_576.0,
                pct
            );
        }
        InstallProgress::Extracting {
            mod_name,
            current,
            total,
        } => {
            println!("[{}/{}] Extracting: {}", current, total, mod_name);
        }
        InstallProgress::Installing {
            mod_name,
            current,
            total,
        } => {
            println!("[{}/{}] {} - Done!", current, total, mod_name);
        }
        InstallProgress::Error { message } => {
            println!("Error: {}", message);
        }
        InstallProgress::Stats { stats } => {
            println!(
                "Downloaded: {} / Installed: {} / Failed: {} ({:.0}% installed, {:.0}% downloaded)",
                stats.downloaded + stats.extracted + stats.installed,
                stats.installed,
                stats.failed,
                stats.progress_percent(),
                stats.download_progress_percent(),
            );
        }
    }
}

/// Stable 1-based phase numbering for the progress banners, independent of
/// the enum's declaration order.
fn phase_number(phase: InstallPhase) -> u8 {
    match phase {
        InstallPhase::ParseCollection => 1,
        InstallPhase::SetupMo2 => 2,
        InstallPhase::DownloadMods => 3,
        InstallPhase::ValidateArchives => 4,
        InstallPhase::ExtractFiles => 5,
        InstallPhase::ProcessFomods => 6,
        InstallPhase::GenerateModlist => 7,
        InstallPhase::GeneratePlugins => 8,
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    if cli.verbose || std::env::var("RUST_LOG").is_ok() {
        tracing_subscriber::fmt()
            .with_env_filter(
                EnvFilter::from_default_env().add_directive(
                    if cli.verbose {
                        "nexusbridge=debug".parse()?
                    } else {
                        "nexusbridge=warn".parse()?
                    },
                ),
            )
            .init();
    }

    let api_key = resolve_api_key()?;

    if !cli.mo2_path.exists() && !cli.query {
        bail!("MO2 path does not exist: {}", cli.mo2_path.display());
    }

    let downloads_dir = cli.mo2_path.join("downloads");
    let collection_path = resolve_collection_path(&cli.collection_url, &api_key, &downloads_dir).await?;

    if cli.query {
        let game_path = loot::resolve_game_path(&cli.mo2_path);
        return run_query(&collection_path, &api_key, &cli.mo2_path, game_path).await;
    }

    let game_path = loot::resolve_game_path(&cli.mo2_path).with_context(|| {
        format!(
            "Could not locate a Skyrim Special Edition installation from {}",
            cli.mo2_path.display()
        )
    })?;

    let db_path = cli.mo2_path.join("nexusbridge.db");

    let mut config = InstallerConfig {
        collection_path,
        output_dir: cli.mo2_path.clone(),
        game_path,
        nexus_api_key: api_key,
        profile: cli.profile,
        yes: cli.yes,
        ..Default::default()
    };
    if let Some(concurrent) = cli.concurrent {
        config.concurrent_downloads = concurrent;
    }

    if let Some(nxm_url) = cli.nxm {
        config.nxm_mode = true;
        config.nxm_url = Some(nxm_url);

        let mut installer = CollectionInstaller::new(config, &db_path)?;
        let path = installer.install_single_nxm().await?;
        println!("Downloaded: {}", path.display());
        return Ok(());
    }

    println!("nexusbridge - installing collection into {}", cli.mo2_path.display());
    println!("Concurrent operations: {}", config.concurrent_downloads);
    println!();

    let mut installer = CollectionInstaller::new(config, &db_path)?;
    installer.set_progress_callback(Arc::new(print_progress));
    installer.install().await?;

    println!("\nInstallation complete!");

    Ok(())
}
