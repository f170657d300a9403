//! CLI command implementations

use crate::output::{format_bytes, format_speed, print_json, truncate};
use crate::progress::{stream_bar, BatchBar, TransferProgress};
use crate::{ConfigAction, KindArg, OutputFormat};
use anyhow::{anyhow, bail, Context, Result};
use console::style;
use mediafetch_core::{load_settings, save_settings, DownloadOptions, MediaFetch, Paths};
use mediafetch_types::{
    BatchConfig, BatchJob, BatchKind, BatchStatus, DownloadOutcome, ItemStatus, Settings,
    TransferJob, TransferStatus,
};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

impl From<KindArg> for BatchKind {
    fn from(kind: KindArg) -> Self {
        match kind {
            KindArg::UrlList => BatchKind::UrlList,
            KindArg::Profile => BatchKind::Profile,
            KindArg::Collection => BatchKind::Collection,
        }
    }
}

// ============================================================================
// Download Commands
// ============================================================================

pub fn get_options(
    dir: Option<PathBuf>,
    name: Option<String>,
    format: Option<String>,
    checksum: Option<String>,
    headers: &[String],
) -> Result<DownloadOptions> {
    Ok(DownloadOptions {
        output_dir: dir,
        file_name: name,
        format,
        headers: parse_headers(headers)?,
        checksum,
        progress: None,
    })
}

fn parse_headers(raw: &[String]) -> Result<BTreeMap<String, String>> {
    raw.iter()
        .map(|header| {
            let (name, value) = header
                .split_once(':')
                .ok_or_else(|| anyhow!("Header must look like \"Name: value\": {}", header))?;
            Ok((name.trim().to_string(), value.trim().to_string()))
        })
        .collect()
}

pub async fn get(
    app: &MediaFetch,
    url: &str,
    mut options: DownloadOptions,
    format: OutputFormat,
    interrupt: &CancellationToken,
) -> Result<()> {
    let (sink, renderer) = TransferProgress::new(format == OutputFormat::Human).spawn();
    options.progress = Some(sink);

    let result = tokio::select! {
        result = app.manager().download(url, options) => Some(result),
        _ = interrupt.cancelled() => None,
    };

    let Some(result) = result else {
        // Stopping the workers pauses the transfer and checkpoints it
        app.manager().stop().await;
        let _ = renderer.await;
        bail!("Interrupted; run the same command again to resume");
    };
    let _ = renderer.await;

    let outcome = result?;
    match format {
        OutputFormat::Json => print_json(&outcome)?,
        OutputFormat::Human | OutputFormat::Table => print_outcome(&outcome),
    }

    Ok(())
}

fn print_outcome(outcome: &DownloadOutcome) {
    if outcome.cached {
        println!(
            "{} Already downloaded: {}",
            style("✓").green().bold(),
            style(outcome.file_path.display()).cyan()
        );
        return;
    }

    println!(
        "{} Saved {}",
        style("✓").green().bold(),
        style(outcome.file_path.display()).cyan()
    );
    if let Some(size) = outcome.file_size {
        println!("  Size: {}", format_bytes(size));
    }
    println!("  Took: {:.1}s", outcome.elapsed_ms as f64 / 1000.0);
    if let Some(ref id) = outcome.job_id {
        println!("  Job: {}", style(id).dim());
    }
    if !outcome.persisted {
        println!(
            "  {}",
            style("Warning: the media database could not be updated").yellow()
        );
    }
}

pub async fn retry(app: &MediaFetch, media_id: &str, format: OutputFormat) -> Result<()> {
    let (sink, renderer) = TransferProgress::new(format == OutputFormat::Human).spawn();
    let options = DownloadOptions {
        progress: Some(sink),
        ..Default::default()
    };

    let result = app.manager().retry(media_id, options).await;
    let _ = renderer.await;

    let outcome = result?;
    match format {
        OutputFormat::Json => print_json(&outcome)?,
        OutputFormat::Human | OutputFormat::Table => print_outcome(&outcome),
    }
    Ok(())
}

// ============================================================================
// Batch Commands
// ============================================================================

/// URLs from the command line followed by those in `file`.
/// Blank lines and `#` comments in the file are ignored.
pub async fn collect_urls(mut urls: Vec<String>, file: Option<PathBuf>) -> Result<Vec<String>> {
    if let Some(path) = file {
        let content = tokio::fs::read_to_string(&path)
            .await
            .with_context(|| format!("Failed to read {}", path.display()))?;
        urls.extend(
            content
                .lines()
                .map(str::trim)
                .filter(|line| !line.is_empty() && !line.starts_with('#'))
                .map(str::to_string),
        );
    }

    if urls.is_empty() {
        bail!("No URLs given; pass them as arguments or with --file");
    }
    Ok(urls)
}

pub fn batch_config(
    app: &MediaFetch,
    jobs: Option<usize>,
    dir: Option<PathBuf>,
    format: Option<String>,
    skip_existing: bool,
) -> BatchConfig {
    BatchConfig {
        max_concurrent: jobs.unwrap_or(app.settings().max_concurrent).max(1),
        output_dir: dir,
        format,
        skip_existing,
        ..Default::default()
    }
}

pub async fn batch(
    app: &MediaFetch,
    kind: KindArg,
    urls: Vec<String>,
    config: BatchConfig,
    format: OutputFormat,
    interrupt: &CancellationToken,
) -> Result<()> {
    let batches = app.batches();
    let job = batches.start_batch(kind.into(), urls, config)?;
    let bar = BatchBar::new(format == OutputFormat::Human);
    let mut ticker = tokio::time::interval(Duration::from_millis(200));
    let mut cancelled = false;

    let finished = loop {
        tokio::select! {
            finished = batches.wait(&job.id) => break finished?,
            _ = interrupt.cancelled(), if !cancelled => {
                cancelled = true;
                batches.cancel_batch(&job.id)?;
            }
            _ = ticker.tick() => {
                if let Some(snapshot) = batches.batch(&job.id) {
                    bar.update(&snapshot.progress);
                }
            }
        }
    };
    bar.finish();

    match format {
        OutputFormat::Json => print_json(&finished)?,
        OutputFormat::Table => print_batch_table(&finished),
        OutputFormat::Human => print_batch_summary(&finished),
    }

    if finished.status == BatchStatus::Failed {
        bail!("Every item in batch {} failed", finished.id);
    }
    Ok(())
}

fn print_batch_summary(job: &BatchJob) {
    let icon = match job.status {
        BatchStatus::Completed => style("✓").green().bold(),
        BatchStatus::Partial => style("!").yellow().bold(),
        _ => style("✗").red().bold(),
    };

    println!(
        "{} Batch {} {}{}",
        icon,
        style(&job.id).dim(),
        job.status,
        if job.cancelled { " (cancelled)" } else { "" }
    );
    println!(
        "  {} completed, {} failed, {} skipped of {}",
        style(job.progress.completed).green(),
        style(job.progress.failed).red(),
        style(job.progress.skipped).dim(),
        job.progress.total
    );

    for result in job.results.iter().filter(|r| r.status == ItemStatus::Failed) {
        println!(
            "  {} {}: {}",
            style("✗").red(),
            result.url,
            style(result.error.as_deref().unwrap_or("unknown error")).red()
        );
    }
}

fn print_batch_table(job: &BatchJob) {
    use tabled::{Table, Tabled};

    #[derive(Tabled)]
    struct ItemRow {
        url: String,
        status: String,
        size: String,
        detail: String,
    }

    let rows: Vec<ItemRow> = job
        .results
        .iter()
        .map(|r| ItemRow {
            url: truncate(&r.url, 50),
            status: format!("{:?}", r.status),
            size: r.size.map(format_bytes).unwrap_or_else(|| "?".to_string()),
            detail: r
                .error
                .clone()
                .or_else(|| r.file_path.as_ref().map(|p| p.display().to_string()))
                .unwrap_or_default(),
        })
        .collect();

    println!("{}", Table::new(rows));
}

// ============================================================================
// Stream Commands
// ============================================================================

pub async fn stream(
    app: &MediaFetch,
    url: &str,
    dest: &Path,
    format: OutputFormat,
    interrupt: &CancellationToken,
) -> Result<()> {
    let (tx, renderer) = stream_bar(format == OutputFormat::Human);
    let result = app.streams().download(url, dest, Some(tx), interrupt).await;
    let _ = renderer.await;

    let summary = match result {
        Ok(summary) => summary,
        Err(e) if e.is_cancelled() => bail!("Interrupted; no output was written"),
        Err(e) => return Err(e.into()),
    };

    match format {
        OutputFormat::Json => print_json(&summary)?,
        OutputFormat::Human | OutputFormat::Table => {
            println!(
                "{} Saved {} ({} segments, {})",
                style("✓").green().bold(),
                style(summary.output.display()).cyan(),
                summary.segments,
                format_bytes(summary.bytes)
            );
        }
    }
    Ok(())
}

// ============================================================================
// Job Commands
// ============================================================================

pub async fn list_jobs(app: &MediaFetch, format: OutputFormat) -> Result<()> {
    let jobs = app.engine().jobs().await;

    match format {
        OutputFormat::Json => print_json(&jobs)?,
        OutputFormat::Table => {
            use tabled::{Table, Tabled};

            #[derive(Tabled)]
            struct JobRow {
                id: String,
                file: String,
                size: String,
                progress: String,
                status: String,
            }

            let rows: Vec<JobRow> = jobs
                .iter()
                .map(|job| JobRow {
                    id: job.id.clone(),
                    file: truncate(&file_label(job), 30),
                    size: job
                        .file_size
                        .map(format_bytes)
                        .unwrap_or_else(|| "?".to_string()),
                    progress: format!("{:.1}%", job.percent()),
                    status: job.status.to_string(),
                })
                .collect();

            println!("{}", Table::new(rows));
        }
        OutputFormat::Human => {
            if jobs.is_empty() {
                println!("{}", style("No transfer jobs").dim());
                return Ok(());
            }

            for job in &jobs {
                print_job(job);
            }
            println!();
            println!("{} job(s) total", style(jobs.len()).bold());
        }
    }

    Ok(())
}

fn file_label(job: &TransferJob) -> String {
    job.file_path
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_else(|| job.file_path.display().to_string())
}

fn print_job(job: &TransferJob) {
    let status_icon = match job.status {
        TransferStatus::Completed => style("✓").green(),
        TransferStatus::Downloading | TransferStatus::Initializing => style("↓").cyan(),
        TransferStatus::Paused => style("⏸").yellow(),
        TransferStatus::Failed => style("✗").red(),
        TransferStatus::Pending => style("·").dim(),
    };

    println!(
        "{} {} {} [{}]",
        status_icon,
        style(file_label(job)).bold(),
        style(format!("{:.1}%", job.percent())).dim(),
        style(job.status).dim()
    );
    println!("    ID: {}", job.id);
    println!("    URL: {}", job.url);
    match job.file_size {
        Some(size) => println!(
            "    Size: {} / {}",
            format_bytes(job.downloaded),
            format_bytes(size)
        ),
        None => println!("    Downloaded: {}", format_bytes(job.downloaded)),
    }
    if job.speed > 0 {
        println!("    Speed: {}", format_speed(job.speed));
    }
    if let Some(ref error) = job.last_error {
        println!("    Error: {}", style(error).red());
    }
}

pub async fn resume(
    app: &MediaFetch,
    id: &str,
    format: OutputFormat,
    interrupt: &CancellationToken,
) -> Result<()> {
    let (sink, renderer) = TransferProgress::new(format == OutputFormat::Human).spawn();
    let result = app.engine().resume_download(id, Some(sink), interrupt).await;
    let _ = renderer.await;

    let job = match result {
        Ok(job) => job,
        Err(e) if e.is_cancelled() => bail!("Interrupted; job {} is paused", id),
        Err(e) => return Err(e.into()),
    };

    match format {
        OutputFormat::Json => print_json(&job)?,
        OutputFormat::Human | OutputFormat::Table => {
            println!(
                "{} Saved {}",
                style("✓").green().bold(),
                style(job.file_path.display()).cyan()
            );
        }
    }
    Ok(())
}

pub async fn pause(app: &MediaFetch, id: &str, format: OutputFormat) -> Result<()> {
    let job = app.engine().pause_job(id).await?;
    match format {
        OutputFormat::Json => print_json(&job)?,
        OutputFormat::Human | OutputFormat::Table => {
            println!(
                "{} Job {} is {} at {:.1}%",
                style("✓").green().bold(),
                job.id,
                job.status,
                job.percent()
            );
        }
    }
    Ok(())
}

pub async fn remove(app: &MediaFetch, id: &str, _format: OutputFormat) -> Result<()> {
    app.engine().delete_job(id).await?;
    println!("{} Job removed", style("✓").green().bold());
    Ok(())
}

pub async fn status(app: &MediaFetch, format: OutputFormat) -> Result<()> {
    let status = app.manager().status().await;
    let jobs = app.engine().jobs().await;
    let paused = jobs
        .iter()
        .filter(|j| j.status == TransferStatus::Paused)
        .count();

    match format {
        OutputFormat::Json => print_json(&serde_json::json!({
            "manager": status,
            "jobs": jobs.len(),
            "paused_jobs": paused,
            "data_dir": app.paths().data_dir,
        }))?,
        OutputFormat::Human | OutputFormat::Table => {
            println!("MediaFetch Status:");
            println!();
            println!("  Data directory: {}", app.paths().data_dir.display());
            println!(
                "  Workers: {} ({})",
                status.workers,
                if status.running { "running" } else { "stopped" }
            );
            println!("  Queue: {}/{}", status.queued, status.queue_capacity);
            println!("  Active transfers: {}", status.active_transfers);
            println!("  Known jobs: {} ({} paused)", jobs.len(), paused);
        }
    }
    Ok(())
}

// ============================================================================
// Config Commands
// ============================================================================

pub async fn config_action(
    paths: &Paths,
    action: Option<ConfigAction>,
    format: OutputFormat,
) -> Result<()> {
    match action {
        None | Some(ConfigAction::Show) => {
            let settings = load_settings(&paths.settings_file).await?;

            match format {
                OutputFormat::Json => print_json(&settings)?,
                _ => print_settings(&settings),
            }
        }

        Some(ConfigAction::Path) => {
            println!("{}", paths.settings_file.display());
        }

        Some(ConfigAction::Get { key }) => {
            let settings = load_settings(&paths.settings_file).await?;
            let value = serde_json::to_value(&settings)?;
            let entry = value
                .get(&key)
                .ok_or_else(|| anyhow!("Unknown config key: {}", key))?;

            match entry {
                serde_json::Value::String(s) => println!("{}", s),
                other => println!("{}", other),
            }
        }

        Some(ConfigAction::Set { key, value }) => {
            let settings = load_settings(&paths.settings_file).await?;
            let mut map = match serde_json::to_value(&settings)? {
                serde_json::Value::Object(map) => map,
                _ => bail!("Settings did not serialize to an object"),
            };
            if !map.contains_key(&key) {
                bail!("Unknown config key: {}", key);
            }

            // Numbers and booleans parse as JSON; anything else is a string
            let parsed = serde_json::from_str(&value)
                .unwrap_or_else(|_| serde_json::Value::String(value.clone()));
            map.insert(key.clone(), parsed);

            let updated: Settings = serde_json::from_value(serde_json::Value::Object(map))
                .with_context(|| format!("Invalid value for {}: {}", key, value))?;
            save_settings(&paths.settings_file, &updated).await?;
            println!("{} Config updated", style("✓").green().bold());
        }

        Some(ConfigAction::Reset) => {
            save_settings(&paths.settings_file, &Settings::default()).await?;
            println!("{} Settings reset to defaults", style("✓").green().bold());
        }
    }

    Ok(())
}

fn print_settings(settings: &Settings) {
    println!("MediaFetch Configuration:");
    println!();
    println!("  Download directory: {}", settings.download_dir.display());
    println!("  Workers: {}", settings.max_workers);
    println!("  Queue capacity: {}", settings.queue_capacity);
    println!("  Max concurrent (batches, streams): {}", settings.max_concurrent);
    println!(
        "  Retries: {} (delay {}ms, linear)",
        settings.max_retries, settings.retry_delay_ms
    );
    println!("  Checkpoint every: {}", format_bytes(settings.checkpoint_bytes));
    println!(
        "  Timeouts: connect {}s, request {}s",
        settings.connect_timeout_secs, settings.request_timeout_secs
    );
    println!("  File naming: {}", settings.file_naming);
    println!("  Default extension: {}", settings.default_extension);
    println!("  Require checksum: {}", settings.require_checksum);
}
