use crate::config::PrePullConfig;
use crate::copier::ImageCopier;
use crate::error::{PullThroughError, Result};
use crate::reference::strip_registry_host;
use futures::future;
use std::sync::Arc;
use std::time::Instant;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PrePullSummary {
    pub succeeded: usize,
    pub failed: usize,
    /// Nothing ran because no list is configured or the marker already exists
    pub skipped: bool,
    pub marker_written: bool,
}

/// Image references from a list file: one per line, `#` starts a comment
pub fn parse_image_list(raw: &str) -> Vec<String> {
    raw.lines()
        .map(|line| line.split('#').next().unwrap_or("").trim())
        .filter(|line| !line.is_empty())
        .map(str::to_string)
        .collect()
}

/// Start the pre-pull in the background. Its result is only logged.
pub fn spawn_pre_pull<C: ImageCopier>(
    config: PrePullConfig,
    source: String,
    copier: Arc<C>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        if let Err(e) = run_pre_pull(&config, &source, copier).await {
            error!(error = %e, "Pre-pull failed");
        }
    })
}

/// Copy every listed image once, then write the marker if all succeeded
pub async fn run_pre_pull<C: ImageCopier>(
    config: &PrePullConfig,
    source: &str,
    copier: Arc<C>,
) -> Result<PrePullSummary> {
    let Some(list_file) = &config.image_list_file else {
        debug!("No pre-pull image list configured");
        return Ok(PrePullSummary {
            skipped: true,
            ..Default::default()
        });
    };

    if tokio::fs::try_exists(&config.marker_file).await? {
        info!(
            marker = %config.marker_file.display(),
            "Pre-pull marker present, skipping image list"
        );
        return Ok(PrePullSummary {
            skipped: true,
            ..Default::default()
        });
    }

    let raw = tokio::fs::read_to_string(list_file).await.map_err(|e| {
        PullThroughError::Config(format!(
            "Failed to read image list {}: {}",
            list_file.display(),
            e
        ))
    })?;
    let images = parse_image_list(&raw);

    let started = Instant::now();
    info!(
        list = %list_file.display(),
        images = images.len(),
        concurrency = config.concurrency,
        "copying images from list file"
    );

    let semaphore = Arc::new(tokio::sync::Semaphore::new(config.concurrency.max(1)));
    let handles: Vec<_> = images
        .into_iter()
        .map(|image| {
            let semaphore = semaphore.clone();
            let copier = copier.clone();
            let source = source.to_string();
            tokio::spawn(async move {
                let _permit = semaphore
                    .acquire_owned()
                    .await
                    .map_err(|e| PullThroughError::Copy(format!("pre-pull aborted: {}", e)))?;
                debug!("[prepull] Starting copy: {}", image);
                let destination = strip_registry_host(&image);
                match copier.copy(&source, &image, destination).await {
                    Ok(()) => {
                        info!("[prepull] Completed: {}", image);
                        Ok(())
                    }
                    Err(e) => {
                        error!("[prepull] Failed: {} - {}", image, e);
                        Err(e)
                    }
                }
            })
        })
        .collect();

    let mut summary = PrePullSummary::default();
    for result in future::join_all(handles).await {
        match result {
            Ok(Ok(())) => summary.succeeded += 1,
            Ok(Err(_)) => summary.failed += 1,
            Err(e) => {
                error!("[prepull] Task panicked: {}", e);
                summary.failed += 1;
            }
        }
    }

    if summary.failed == 0 {
        if let Some(parent) = config.marker_file.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::File::create(&config.marker_file).await?;
        summary.marker_written = true;
        info!(
            succeeded = summary.succeeded,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "copying images from list file done"
        );
    } else {
        warn!(
            succeeded = summary.succeeded,
            failed = summary.failed,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Pre-pull finished with failures, marker not written"
        );
    }

    Ok(summary)
}
