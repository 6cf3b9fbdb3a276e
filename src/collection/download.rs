//! Download phase coordinator for collection installations.
//!
//! Handles parallel downloads from Nexus with:
//! - Rate limit tracking and exponential backoff
//! - NXM browser mode fallback
//! - Progress display with multi-progress bars
//! - Auto-retry on failures
//! - Size verification

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use futures::stream::{self, StreamExt};
use indicatif::{MultiProgress, ProgressBar, ProgressStyle};
use rayon::prelude::*;
use tokio::sync::Mutex;
use tracing::info;

use crate::downloaders::{download_file_with_progress, HttpClient, NexusDownloader};

use super::db::{CollectionDb, ModDbEntry, ModStatus};
use super::verify::compute_md5;

/// Max retries for network operations
const MAX_RETRIES: u32 = 3;
/// Delay between retries
const RETRY_DELAY: Duration = Duration::from_secs(2);
/// Max retries for rate limit errors (429)
const MAX_RATE_LIMIT_RETRIES: u32 = 10;
/// Initial delay for rate limit retry (increases exponentially)
const RATE_LIMIT_BASE_DELAY: Duration = Duration::from_secs(30);
/// Additional retry waves run on still-failed tasks after the first pass
const MAX_DOWNLOAD_WAVES: u32 = 3;
/// Pause between retry waves
const WAVE_RETRY_DELAY: Duration = Duration::from_secs(2);

/// Download statistics
#[derive(Debug, Default, Clone)]
pub struct DownloadStats {
    pub downloaded: usize,
    pub skipped: usize,
    pub failed: usize,
    pub manual: usize,
}

/// Information about a failed download
#[derive(Debug, Clone)]
pub struct FailedDownloadInfo {
    pub name: String,
    pub mod_id: i64,
    pub file_id: i64,
    pub error: String,
    pub expected_size: u64,
}

/// Shared state for download coordination
struct DownloadContext {
    nexus: NexusDownloader,
    http: HttpClient,
    game_domain: String,
    downloads_dir: PathBuf,
    multi_progress: MultiProgress,
    overall_pb: ProgressBar,
    // Counters
    downloaded: AtomicUsize,
    skipped: AtomicUsize,
    failed: AtomicUsize,
    failed_downloads: Mutex<Vec<FailedDownloadInfo>>,
}

/// Download all pending mods for a collection
pub async fn download_mods(
    db: &CollectionDb,
    downloads_dir: &Path,
    nexus_api_key: &str,
    game_domain: &str,
    concurrency: usize,
    allow_unattended_continue: bool,
) -> Result<DownloadStats> {
    // Get mods that need downloading
    let pending_mods = db.get_mods_by_status(ModStatus::Pending)?;

    if pending_mods.is_empty() {
        info!("No mods need downloading");
        return Ok(DownloadStats::default());
    }

    // Check what's already downloaded (verify with MD5 if available) - PARALLEL
    println!("Checking {} existing downloads (parallel)...", pending_mods.len());

    // Setup progress bar
    let check_pb = ProgressBar::new(pending_mods.len() as u64);
    check_pb.set_style(
        ProgressStyle::default_bar()
            .template("{spinner:.green} [{elapsed_precise}] Checking [{bar:40.cyan/blue}] {pos}/{len} | {msg}")
            .unwrap()
            .progress_chars("=>-"),
    );
    check_pb.enable_steady_tick(Duration::from_millis(100));

    let already_count = AtomicUsize::new(0);
    let corrupted_count = AtomicUsize::new(0);
    let check_pb = Arc::new(check_pb);

    // Check in parallel, collect results
    #[derive(Debug)]
    enum CheckResult {
        AlreadyDownloaded { id: i64, path: String },
        NeedDownload(ModDbEntry),
        Corrupted(ModDbEntry),
    }

    let results: Vec<CheckResult> = pending_mods
        .into_par_iter()
        .map(|mod_entry| {
            // Try multiple filename patterns - folder_name (unique), then logical_filename (legacy)
            let candidates = get_filename_candidates(&mod_entry);
            let output_path = candidates.iter()
                .map(|f| downloads_dir.join(f))
                .find(|p| p.exists());

            let result = if let Some(output_path) = output_path {
                if let Ok(meta) = fs::metadata(&output_path) {
                    let actual_size = meta.len();

                    // Skip empty files
                    if actual_size == 0 {
                        let _ = fs::remove_file(&output_path);
                        CheckResult::NeedDownload(mod_entry)
                    } else if !mod_entry.md5.is_empty() {
                        // If we have an MD5 hash, verify it
                        match compute_md5(&output_path) {
                            Ok(actual_md5) => {
                                if actual_md5.eq_ignore_ascii_case(&mod_entry.md5) {
                                    // MD5 matches - file is good
                                    already_count.fetch_add(1, Ordering::Relaxed);
                                    CheckResult::AlreadyDownloaded {
                                        id: mod_entry.id,
                                        path: output_path.to_string_lossy().to_string(),
                                    }
                                } else {
                                    // MD5 mismatch - corrupted or wrong version
                                    let _ = fs::remove_file(&output_path);
                                    corrupted_count.fetch_add(1, Ordering::Relaxed);
                                    CheckResult::Corrupted(mod_entry)
                                }
                            }
                            Err(_) => {
                                // Can't read file - re-download
                                let _ = fs::remove_file(&output_path);
                                corrupted_count.fetch_add(1, Ordering::Relaxed);
                                CheckResult::Corrupted(mod_entry)
                            }
                        }
                    } else {
                        // No MD5 to verify - accept if file has reasonable size (>1KB)
                        if actual_size > 1000 {
                            already_count.fetch_add(1, Ordering::Relaxed);
                            CheckResult::AlreadyDownloaded {
                                id: mod_entry.id,
                                path: output_path.to_string_lossy().to_string(),
                            }
                        } else {
                            let _ = fs::remove_file(&output_path);
                            corrupted_count.fetch_add(1, Ordering::Relaxed);
                            CheckResult::Corrupted(mod_entry)
                        }
                    }
                } else {
                    CheckResult::NeedDownload(mod_entry)
                }
            } else {
                CheckResult::NeedDownload(mod_entry)
            };

            check_pb.inc(1);
            check_pb.set_message(format!(
                "OK:{} Corrupt:{}",
                already_count.load(Ordering::Relaxed),
                corrupted_count.load(Ordering::Relaxed)
            ));

            result
        })
        .collect();

    check_pb.finish_and_clear();

    // Process results sequentially (database updates)
    let mut need_download: Vec<ModDbEntry> = Vec::new();
    let mut already_downloaded = 0usize;

    for result in results {
        match result {
            CheckResult::AlreadyDownloaded { id, path } => {
                db.mark_mod_downloaded(id, &path)?;
                already_downloaded += 1;
            }
            CheckResult::NeedDownload(mod_entry) => {
                need_download.push(mod_entry);
            }
            CheckResult::Corrupted(mod_entry) => {
                need_download.push(mod_entry);
            }
        }
    }

    let corrupted = corrupted_count.load(Ordering::Relaxed);
    if corrupted > 0 {
        println!("Found {} corrupted/mismatched archives - will re-download", corrupted);
    }

    if already_downloaded > 0 {
        println!("Found {} archives already downloaded", already_downloaded);
    }

    if need_download.is_empty() {
        info!("All needed archives already downloaded!");
        return Ok(DownloadStats {
            downloaded: 0,
            skipped: already_downloaded,
            failed: 0,
            manual: 0,
        });
    }

    info!("Need to download {} mods", need_download.len());

    // Create Nexus client and validate API key + Premium status
    let nexus = NexusDownloader::new(nexus_api_key)?;

    // Validate and check Premium status before downloading
    println!("Validating Nexus API key...");
    let user_info = nexus
        .validate()
        .await
        .context("Failed to validate Nexus API key")?;

    if user_info.is_premium {
        println!(
            "✓ Logged in as '{}' (Premium) - Direct API downloads enabled (20,000/day limit)",
            user_info.name
        );
    } else {
        bail!(
            "Logged in as '{}' (Free) - the free tier's API does not vend direct download links. \
             Re-run with --nxm <nxm-url> to satisfy downloads one at a time via the browser manual flow.",
            user_info.name
        );
    }

    // Show current rate limits
    let limits = nexus.rate_limits();
    println!(
        "Rate limits: {}/{} hourly, {}/{} daily",
        limits.hourly_remaining, limits.hourly_limit,
        limits.daily_remaining, limits.daily_limit
    );

    // Setup progress display
    let multi_progress = MultiProgress::new();
    let overall_pb = multi_progress.add(ProgressBar::new(need_download.len() as u64));
    overall_pb.set_style(
        ProgressStyle::default_bar()
            .template("{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} ({percent}%) | {msg}")
            .unwrap()
            .progress_chars("=>-"),
    );
    overall_pb.enable_steady_tick(Duration::from_millis(100));
    overall_pb.set_message("Starting downloads...");

    // Create shared context
    let ctx = Arc::new(DownloadContext {
        nexus,
        http: HttpClient::new()?,
        game_domain: game_domain.to_string(),
        downloads_dir: downloads_dir.to_path_buf(),
        multi_progress,
        overall_pb,
        downloaded: AtomicUsize::new(0),
        skipped: AtomicUsize::new(0),
        failed: AtomicUsize::new(0),
        failed_downloads: Mutex::new(Vec::new()),
    });

    // Process downloads in parallel, with retry waves on still-failed tasks
    let mut remaining = need_download;
    let mut wave_concurrency = concurrency;

    for wave in 0..=MAX_DOWNLOAD_WAVES {
        if remaining.is_empty() {
            break;
        }

        if wave > 0 {
            println!(
                "\nRetry wave {}/{}: {} archive(s) still failing...",
                wave, MAX_DOWNLOAD_WAVES, remaining.len()
            );
            tokio::time::sleep(WAVE_RETRY_DELAY).await;
            wave_concurrency = wave_concurrency.min(4);
            ctx.failed.store(0, Ordering::Relaxed);
            ctx.failed_downloads.lock().await.clear();
        }

        let results: Vec<(ModDbEntry, PathBuf, DownloadResult)> = stream::iter(remaining)
            .map(|mod_entry| {
                let ctx = Arc::clone(&ctx);
                async move {
                    let filename = get_filename(&mod_entry);
                    let output_path = ctx.downloads_dir.join(&filename);
                    let result = process_mod_download(&ctx, &mod_entry, &output_path).await;
                    (mod_entry, output_path, result)
                }
            })
            .buffer_unordered(wave_concurrency)
            .collect()
            .await;

        remaining = Vec::new();
        for (mod_entry, output_path, result) in results {
            match result {
                DownloadResult::Success | DownloadResult::Skipped => {
                    db.mark_mod_downloaded(mod_entry.id, output_path.to_string_lossy().as_ref())?;
                }
                DownloadResult::Failed => {
                    remaining.push(mod_entry);
                }
            }
        }
    }

    ctx.overall_pb.finish_and_clear();

    if !remaining.is_empty() {
        if allow_unattended_continue {
            println!(
                "\n{} archive(s) failed after {} retry wave(s); continuing (--yes).",
                remaining.len(),
                MAX_DOWNLOAD_WAVES
            );
        } else {
            print!(
                "\n{} archive(s) failed after {} retry wave(s). Continue anyway? [y/N] ",
                remaining.len(),
                MAX_DOWNLOAD_WAVES
            );
            std::io::Write::flush(&mut std::io::stdout()).ok();
            let mut answer = String::new();
            std::io::stdin().read_line(&mut answer).ok();
            if !answer.trim().eq_ignore_ascii_case("y") {
                bail!("Aborted: {} archive(s) could not be downloaded", remaining.len());
            }
        }
    }

    // Collect stats
    let stats = DownloadStats {
        downloaded: ctx.downloaded.load(Ordering::Relaxed),
        skipped: ctx.skipped.load(Ordering::Relaxed) + already_downloaded,
        failed: ctx.failed.load(Ordering::Relaxed),
        manual: 0,
    };

    // Print failed download instructions
    let failed_downloads = ctx.failed_downloads.lock().await;
    if !failed_downloads.is_empty() {
        println!("\n=== Failed Downloads ({}) ===", failed_downloads.len());
        println!("These downloads failed. Try manually downloading to: {}\n", downloads_dir.display());

        for (i, fd) in failed_downloads.iter().enumerate() {
            let url = format!(
                "https://www.nexusmods.com/{}/mods/{}?tab=files&file_id={}",
                game_domain, fd.mod_id, fd.file_id
            );
            println!("{}. {}", i + 1, fd.name);
            println!("   URL: {}", url);
            println!("   Error: {}", fd.error);
            println!("   Expected size: {} bytes ({:.2} MB)", fd.expected_size, fd.expected_size as f64 / 1024.0 / 1024.0);
            println!();
        }

        println!("After downloading, run the command again to continue.\n");
    }

    // Print summary
    println!("\n=== Download Summary ===");
    println!("Downloaded: {}", stats.downloaded);
    println!("Skipped:    {}", stats.skipped);
    println!("Failed:     {}", stats.failed);

    // Print Nexus rate limits
    let limits = ctx.nexus.rate_limits();
    println!(
        "\nNexus API: {}/{} hourly, {}/{} daily",
        limits.hourly_remaining, limits.hourly_limit,
        limits.daily_remaining, limits.daily_limit
    );

    Ok(stats)
}

/// Get the primary filename for a mod download (used when saving new downloads)
fn get_filename(mod_entry: &ModDbEntry) -> String {
    // Use folder_name first - it's unique because it contains mod_id-file_id suffix
    // logical_filename can be generic (e.g., "Main File") and cause collisions
    let base = if !mod_entry.folder_name.is_empty() {
        &mod_entry.folder_name
    } else if !mod_entry.logical_filename.is_empty() {
        &mod_entry.logical_filename
    } else if !mod_entry.name.is_empty() {
        &mod_entry.name
    } else {
        // Last resort: use mod_id and file_id
        return format!("mod_{}_file_{}", mod_entry.mod_id, mod_entry.file_id);
    };

    // Return as-is - don't force any extension
    // The actual file format will be detected by magic bytes during extraction
    base.clone()
}

/// Get candidate filenames to check for existing downloads
/// Returns multiple names to handle legacy downloads that may use different naming
pub fn get_filename_candidates(mod_entry: &ModDbEntry) -> Vec<String> {
    let mut candidates = Vec::new();

    // Primary: folder_name (unique with mod_id-file_id)
    if !mod_entry.folder_name.is_empty() {
        candidates.push(mod_entry.folder_name.clone());
    }

    // Fallback: logical_filename (what Nexus calls the file - may be generic)
    if !mod_entry.logical_filename.is_empty()
        && (candidates.is_empty() || mod_entry.logical_filename != mod_entry.folder_name)
    {
        candidates.push(mod_entry.logical_filename.clone());
    }

    // Last resort: mod name
    if candidates.is_empty() && !mod_entry.name.is_empty() {
        candidates.push(mod_entry.name.clone());
    }

    // Ultimate fallback
    if candidates.is_empty() {
        candidates.push(format!("mod_{}_file_{}", mod_entry.mod_id, mod_entry.file_id));
    }

    candidates
}

/// Result of processing a single download
#[derive(Debug, Clone, Copy)]
enum DownloadResult {
    Success,
    Skipped,
    Failed,
}

/// Process a single mod download
async fn process_mod_download(
    ctx: &DownloadContext,
    mod_entry: &ModDbEntry,
    output_path: &Path,
) -> DownloadResult {
    // Check if file already exists with correct size
    if output_path.exists() {
        if let Ok(meta) = fs::metadata(output_path) {
            if meta.len() == mod_entry.file_size as u64 {
                ctx.skipped.fetch_add(1, Ordering::Relaxed);
                ctx.overall_pb.inc(1);
                update_overall_message(ctx);
                return DownloadResult::Skipped;
            }
        }
    }

    // Create progress bar for this download
    let pb = ctx.multi_progress.insert_before(&ctx.overall_pb, ProgressBar::new(mod_entry.file_size as u64));
    pb.set_style(
        ProgressStyle::default_bar()
            .template("  {spinner:.blue} {wide_msg} [{bar:30.white/dim}] {bytes}/{total_bytes} {bytes_per_sec}")
            .unwrap()
            .progress_chars("=>-"),
    );
    pb.enable_steady_tick(Duration::from_millis(100));

    // Truncate filename for display
    let display_name = truncate_name(&mod_entry.name, 40);
    pb.set_message(display_name.clone());

    // Choose download method based on source type
    let result = if mod_entry.source_type == "direct" && !mod_entry.source_url.is_empty() {
        // Direct download from URL (e.g., GitHub releases)
        pb.set_message(format!("{} (direct)", display_name));
        download_direct_url(ctx, mod_entry, output_path, &pb).await
    } else {
        // Download from Nexus
        download_nexus_mod(ctx, mod_entry, output_path, &pb).await
    };

    let source_label = if mod_entry.source_type == "direct" { "Direct" } else { "Nexus" };

    match result {
        Ok(()) => {
            pb.finish_and_clear();
            ctx.downloaded.fetch_add(1, Ordering::Relaxed);
            ctx.overall_pb.inc(1);
            update_overall_message(ctx);
            DownloadResult::Success
        }
        Err(e) => {
            pb.finish_and_clear();
            ctx.failed.fetch_add(1, Ordering::Relaxed);
            ctx.overall_pb.inc(1);
            let error_msg = root_cause(&e);
            ctx.overall_pb.println(format!(
                "FAIL [{}] {} - {}",
                source_label, truncate_name(&mod_entry.name, 30), error_msg
            ));
            // Record failed download
            ctx.failed_downloads.lock().await.push(FailedDownloadInfo {
                name: mod_entry.name.clone(),
                mod_id: mod_entry.mod_id,
                file_id: mod_entry.file_id,
                error: error_msg,
                expected_size: mod_entry.file_size as u64,
            });
            DownloadResult::Failed
        }
    }
}

/// Update the overall progress bar message with current stats
fn update_overall_message(ctx: &DownloadContext) {
    let downloaded = ctx.downloaded.load(Ordering::Relaxed);
    let skipped = ctx.skipped.load(Ordering::Relaxed);
    let failed = ctx.failed.load(Ordering::Relaxed);
    ctx.overall_pb.set_message(format!(
        "OK:{} Skip:{} Fail:{}",
        downloaded, skipped, failed
    ));
}

/// Truncate a name for display
fn truncate_name(name: &str, max_len: usize) -> String {
    if name.len() <= max_len {
        name.to_string()
    } else {
        format!("{}...", &name[..max_len - 3])
    }
}

/// Extract the root cause error message
fn root_cause(e: &anyhow::Error) -> String {
    let root = e.root_cause();
    let msg = root.to_string();
    if msg.len() > 80 {
        format!("{}...", &msg[..77])
    } else {
        msg
    }
}

/// Download a mod from Nexus (with retry)
async fn download_nexus_mod(
    ctx: &DownloadContext,
    mod_entry: &ModDbEntry,
    output_path: &Path,
    pb: &ProgressBar,
) -> Result<()> {
    let mut attempt = 0u32;
    let mut rate_limit_retries = 0u32;
    let display_name = truncate_name(&mod_entry.name, 40);
    let expected_size = mod_entry.file_size as u64;

    loop {
        attempt += 1;

        // Reset progress bar for retry
        if attempt > 1 {
            pb.set_position(0);
            pb.set_message(display_name.clone());
            // Remove partial file if exists
            let _ = std::fs::remove_file(output_path);
        }

        let result = download_nexus_mod_inner(ctx, mod_entry, output_path, pb).await;

        match result {
            Ok(()) => {
                // Verify file was created
                match std::fs::metadata(output_path) {
                    Ok(meta) => {
                        let actual_size = meta.len();

                        // Check for obvious failures (empty file or error page)
                        if actual_size == 0 {
                            let _ = std::fs::remove_file(output_path);
                            if attempt < MAX_RETRIES {
                                tokio::time::sleep(RETRY_DELAY).await;
                                continue;
                            } else {
                                bail!("Downloaded empty file after {} attempts", MAX_RETRIES);
                            }
                        }

                        // Check for suspiciously small files (likely error pages)
                        if actual_size < 1000 && expected_size > 10000 {
                            let _ = std::fs::remove_file(output_path);
                            if attempt < MAX_RETRIES {
                                tokio::time::sleep(RETRY_DELAY).await;
                                continue;
                            } else {
                                bail!("Downloaded file too small ({} bytes)", actual_size);
                            }
                        }

                        // Verify MD5 hash if we have one
                        let expected_md5 = &mod_entry.md5;
                        if !expected_md5.is_empty() {
                            match compute_md5(output_path) {
                                Ok(actual_md5) => {
                                    if !actual_md5.eq_ignore_ascii_case(expected_md5) {
                                        // MD5 mismatch - delete and retry
                                        let _ = std::fs::remove_file(output_path);
                                        if attempt < MAX_RETRIES {
                                            ctx.overall_pb.println(format!(
                                                "MD5 mismatch for {}, retrying...",
                                                truncate_name(&mod_entry.name, 30)
                                            ));
                                            tokio::time::sleep(RETRY_DELAY).await;
                                            continue;
                                        } else {
                                            bail!(
                                                "MD5 mismatch after {} attempts: expected {}, got {}",
                                                MAX_RETRIES, expected_md5, actual_md5
                                            );
                                        }
                                    }
                                }
                                Err(e) => {
                                    // Can't compute MD5 - treat as failure
                                    let _ = std::fs::remove_file(output_path);
                                    if attempt < MAX_RETRIES {
                                        tokio::time::sleep(RETRY_DELAY).await;
                                        continue;
                                    } else {
                                        bail!("Cannot verify MD5: {}", e);
                                    }
                                }
                            }
                        }
                    }
                    Err(_e) => {
                        // File doesn't exist after download - retry
                        if attempt < MAX_RETRIES {
                            tokio::time::sleep(RETRY_DELAY).await;
                            continue;
                        } else {
                            bail!("Download failed after {} attempts", MAX_RETRIES);
                        }
                    }
                }
                return Ok(());
            }
            Err(e) => {
                let error_str = format!("{:#}", e);
                let is_rate_limit = error_str.contains("429") || error_str.to_lowercase().contains("rate limit");

                if is_rate_limit {
                    rate_limit_retries += 1;
                    if rate_limit_retries <= MAX_RATE_LIMIT_RETRIES {
                        // Exponential backoff: 30s, 60s, 120s, 240s, 300s (capped)
                        let delay_secs = (RATE_LIMIT_BASE_DELAY.as_secs() << (rate_limit_retries - 1).min(3)).min(300);
                        pb.set_message(format!("Rate limited, waiting {}s...", delay_secs));
                        ctx.overall_pb.println(format!(
                            "Rate limit hit for {}, waiting {}s (retry {}/{})",
                            truncate_name(&mod_entry.name, 25), delay_secs, rate_limit_retries, MAX_RATE_LIMIT_RETRIES
                        ));
                        tokio::time::sleep(Duration::from_secs(delay_secs)).await;
                        continue;
                    }
                } else if attempt < MAX_RETRIES {
                    // Regular retry for network errors
                    tokio::time::sleep(RETRY_DELAY).await;
                    continue;
                }

                return Err(e);
            }
        }
    }
}

/// Inner download function (single attempt)
async fn download_nexus_mod_inner(
    ctx: &DownloadContext,
    mod_entry: &ModDbEntry,
    output_path: &Path,
    pb: &ProgressBar,
) -> Result<()> {
    // Get download link from Nexus (cast i64 to u64 for API)
    let url: String = ctx.nexus
        .get_download_link(
            &ctx.game_domain,
            mod_entry.mod_id as u64,
            mod_entry.file_id as u64,
        )
        .await
        .with_context(|| format!(
            "Nexus: {}/mods/{}/files/{}",
            ctx.game_domain, mod_entry.mod_id, mod_entry.file_id
        ))?;

    // Download the file - don't pass expected size to avoid internal mismatch errors
    // We'll verify size ourselves in the retry loop
    download_file_with_progress(&ctx.http, &url, output_path, None, Some(pb)).await?;

    Ok(())
}

// ============================================================================
// Direct URL Downloads (GitHub, etc.)
// ============================================================================

/// Download a file directly from a URL (for non-Nexus sources like GitHub)
async fn download_direct_url(
    ctx: &DownloadContext,
    mod_entry: &ModDbEntry,
    output_path: &Path,
    pb: &ProgressBar,
) -> Result<()> {
    let url = &mod_entry.source_url;
    let expected_size = mod_entry.file_size as u64;
    let display_name = truncate_name(&mod_entry.name, 40);

    let mut attempt = 0u32;

    loop {
        attempt += 1;

        // Reset progress bar for retry
        if attempt > 1 {
            pb.set_position(0);
            pb.set_message(format!("{} (retry {})", display_name, attempt));
            let _ = std::fs::remove_file(output_path);
        }

        // Download directly from URL
        let result = download_file_with_progress(&ctx.http, url, output_path, Some(expected_size), Some(pb)).await;

        match result {
            Ok(_bytes_downloaded) => {
                // Verify file was created with correct size
                if let Ok(meta) = std::fs::metadata(output_path) {
                    if meta.len() == expected_size {
                        return Ok(());
                    } else if attempt < MAX_RETRIES {
                        // Size mismatch, retry
                        let _ = std::fs::remove_file(output_path);
                        tokio::time::sleep(RETRY_DELAY).await;
                        continue;
                    } else {
                        bail!("Size mismatch: expected {} bytes, got {} bytes", expected_size, meta.len());
                    }
                } else if attempt < MAX_RETRIES {
                    tokio::time::sleep(RETRY_DELAY).await;
                    continue;
                } else {
                    bail!("Download failed - file not created after {} attempts", MAX_RETRIES);
                }
            }
            Err(e) => {
                if attempt < MAX_RETRIES {
                    tokio::time::sleep(RETRY_DELAY).await;
                    continue;
                }
                return Err(e);
            }
        }
    }
}

// ============================================================================
// Single nxm:// link consumption
// ============================================================================

/// A parsed `nxm://` link, as produced by Nexus Mods' "Download with Manager" button.
///
/// Format: `nxm://<game_domain>/mods/<mod_id>/files/<file_id>?key=<key>&expires=<expires>`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NxmLink {
    pub game_domain: String,
    pub mod_id: u64,
    pub file_id: u64,
    pub key: String,
    pub expires: u64,
}

/// Parses a single `nxm://` URL.
pub fn parse_nxm_url(url: &str) -> Result<NxmLink> {
    let rest = url
        .strip_prefix("nxm://")
        .context("nxm link must start with nxm://")?;

    let (path, query) = rest.split_once('?').unwrap_or((rest, ""));
    let mut segments = path.split('/');

    let game_domain = segments
        .next()
        .filter(|s| !s.is_empty())
        .context("nxm link is missing a game domain")?
        .to_string();

    if segments.next() != Some("mods") {
        bail!("nxm link is missing the 'mods' path segment");
    }
    let mod_id: u64 = segments
        .next()
        .context("nxm link is missing a mod id")?
        .parse()
        .context("nxm link has a non-numeric mod id")?;

    if segments.next() != Some("files") {
        bail!("nxm link is missing the 'files' path segment");
    }
    let file_id: u64 = segments
        .next()
        .context("nxm link is missing a file id")?
        .parse()
        .context("nxm link has a non-numeric file id")?;

    let mut key = None;
    let mut expires = None;
    for pair in query.split('&') {
        if let Some((k, v)) = pair.split_once('=') {
            match k {
                "key" => key = Some(v.to_string()),
                "expires" => expires = v.parse::<u64>().ok(),
                _ => {}
            }
        }
    }

    Ok(NxmLink {
        game_domain,
        mod_id,
        file_id,
        key: key.context("nxm link is missing the 'key' query parameter")?,
        expires: expires.context("nxm link is missing the 'expires' query parameter")?,
    })
}

/// Downloads the single mod file referenced by an `nxm://` link: resolves
/// one file, downloads it straight into `downloads_dir`, and marks the
/// matching database entry (if the mod/file id pair is part of the current
/// collection) as downloaded.
pub async fn download_single_nxm(
    db: &CollectionDb,
    downloads_dir: &Path,
    nexus_api_key: &str,
    nxm_url: &str,
) -> Result<PathBuf> {
    let link = parse_nxm_url(nxm_url)?;

    let nexus = NexusDownloader::new(nexus_api_key)?;
    let download_url = nexus
        .get_download_link_with_nxm_key(&link.game_domain, link.mod_id, link.file_id, &link.key, link.expires)
        .await
        .context("failed to resolve nxm download link")?;

    let entry = db
        .get_all_mods()?
        .into_iter()
        .find(|m| m.mod_id as u64 == link.mod_id && m.file_id as u64 == link.file_id);

    let filename = entry
        .as_ref()
        .map(get_filename)
        .unwrap_or_else(|| format!("{}-{}.nxm", link.mod_id, link.file_id));

    fs::create_dir_all(downloads_dir)?;
    let output_path = downloads_dir.join(&filename);

    let http = HttpClient::new()?;
    let expected_size = entry.as_ref().map(|m| m.file_size as u64);
    download_file_with_progress(&http, &download_url, &output_path, expected_size, None).await?;

    if let Some(entry) = entry {
        db.mark_mod_downloaded(entry.id, output_path.to_string_lossy().as_ref())?;
    }

    info!("Downloaded {} via nxm link", filename);
    Ok(output_path)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_get_filename() {
        let mod_entry = ModDbEntry {
            id: 1,
            name: "Test Mod".to_string(),
            folder_name: "TestMod".to_string(),
            logical_filename: "test_mod-1.0.zip".to_string(),
            md5: "abc123".to_string(),
            file_size: 1000,
            mod_id: 123,
            file_id: 456,
            source_type: "nexus".to_string(),
            source_url: "".to_string(),
            deploy_type: "".to_string(),
            phase: 0,
            status: "pending".to_string(),
            local_path: None,
            choices_json: None,
            error_message: None,
            fomod_validated: false,
            fomod_valid: false,
            fomod_error: None,
            fomod_module_name: None,
            hashes_json: None,
        };

        // folder_name is used first (contains mod_id-file_id for uniqueness)
        assert_eq!(get_filename(&mod_entry), "TestMod");

        let mod_entry_no_folder = ModDbEntry {
            folder_name: "".to_string(),
            ..mod_entry
        };
        // When folder_name is empty, falls back to logical_filename
        assert_eq!(get_filename(&mod_entry_no_folder), "test_mod-1.0.zip");
    }

    #[test]
    fn test_truncate_name() {
        assert_eq!(truncate_name("short", 10), "short");
        assert_eq!(truncate_name("this is a very long name", 10), "this is...");
    }

    #[test]
    fn test_parse_nxm_url() {
        let link = parse_nxm_url(
            "nxm://skyrimspecialedition/mods/1234/files/5678?key=abc123&expires=1700000000",
        )
        .unwrap();

        assert_eq!(link.game_domain, "skyrimspecialedition");
        assert_eq!(link.mod_id, 1234);
        assert_eq!(link.file_id, 5678);
        assert_eq!(link.key, "abc123");
        assert_eq!(link.expires, 1700000000);
    }

    #[test]
    fn test_parse_nxm_url_missing_scheme() {
        assert!(parse_nxm_url("https://example.com").is_err());
    }

    #[test]
    fn test_parse_nxm_url_missing_key() {
        assert!(parse_nxm_url("nxm://skyrimspecialedition/mods/1/files/2?expires=1").is_err());
    }

    #[test]
    fn test_parse_nxm_url_non_numeric_ids() {
        assert!(parse_nxm_url("nxm://skyrimspecialedition/mods/abc/files/2?key=k&expires=1").is_err());
    }
}
