//! Download handlers for mod archives.
//!
//! Supports Nexus Mods (premium and NXM-linked downloads) and plain HTTP
//! direct downloads, plus a manual fallback for sources that need a
//! browser in the loop.

mod http;
mod nexus;

pub use http::{download_file, download_file_with_progress, HttpClient};
pub use nexus::{NexusDownloader, NexusRateLimits};

use anyhow::{Context, Result};
use std::future::Future;
use std::time::Duration;
use tokio::time::sleep;
use tracing::{info, warn};

/// Default retry configuration
pub const MAX_RETRIES: u32 = 3;
pub const RETRY_DELAY: Duration = Duration::from_secs(5);

/// Download result with metadata
#[derive(Debug)]
pub struct DownloadResult {
    pub path: std::path::PathBuf,
    pub size: u64,
    pub retries_used: u32,
}

/// Wrapper that adds retry logic to any async download function
pub async fn with_retry<F, Fut, T>(operation_name: &str, max_retries: u32, mut f: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut last_error = None;

    for attempt in 1..=max_retries {
        match f().await {
            Ok(result) => {
                if attempt > 1 {
                    info!("{} succeeded on attempt {}/{}", operation_name, attempt, max_retries);
                }
                return Ok(result);
            }
            Err(e) => {
                warn!(
                    "{} failed (attempt {}/{}): {}",
                    operation_name, attempt, max_retries, e
                );
                last_error = Some(e);

                if attempt < max_retries {
                    info!("Retrying in {} seconds...", RETRY_DELAY.as_secs());
                    sleep(RETRY_DELAY).await;
                }
            }
        }
    }

    Err(last_error.unwrap()).with_context(|| {
        format!(
            "{} failed after {} attempts",
            operation_name, max_retries
        )
    })
}

