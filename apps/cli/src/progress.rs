//! Progress bar utilities for CLI transfers

use crate::output::format_eta;
use console::style;
use indicatif::{MultiProgress, ProgressBar, ProgressDrawTarget, ProgressStyle};
use mediafetch_core::{ProgressSink, StreamProgress};
use mediafetch_types::{BatchProgress, ProgressUpdate, TransferStatus};
use std::collections::HashMap;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

fn bytes_style() -> ProgressStyle {
    ProgressStyle::default_bar()
        .template("{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {bytes}/{total_bytes} ({bytes_per_sec}) {msg}")
        .unwrap_or_else(|_| ProgressStyle::default_bar())
        .progress_chars("█▓▒░  ")
}

fn count_style() -> ProgressStyle {
    ProgressStyle::default_bar()
        .template("{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} {msg}")
        .unwrap_or_else(|_| ProgressStyle::default_bar())
        .progress_chars("█▓▒░  ")
}

/// Progress bars for transfer jobs, keyed by job id
pub struct TransferProgress {
    multi: MultiProgress,
    bars: HashMap<String, ProgressBar>,
}

impl TransferProgress {
    pub fn new(visible: bool) -> Self {
        let multi = if visible {
            MultiProgress::new()
        } else {
            MultiProgress::with_draw_target(ProgressDrawTarget::hidden())
        };

        Self {
            multi,
            bars: HashMap::new(),
        }
    }

    /// Channel for engine updates plus the task that renders them.
    /// The task ends once every sender is dropped.
    pub fn spawn(mut self) -> (ProgressSink, JoinHandle<()>) {
        let (tx, mut rx) = mpsc::channel::<ProgressUpdate>(256);
        let handle = tokio::spawn(async move {
            while let Some(update) = rx.recv().await {
                self.handle_update(&update);
            }
            self.clear();
        });
        (tx, handle)
    }

    fn handle_update(&mut self, update: &ProgressUpdate) {
        let multi = &self.multi;
        let pb = self
            .bars
            .entry(update.job_id.clone())
            .or_insert_with(|| {
                let pb = multi.add(ProgressBar::new(0));
                pb.set_style(bytes_style());
                pb
            });

        if let Some(total) = update.total {
            pb.set_length(total);
        }
        pb.set_position(update.downloaded);

        match update.status {
            TransferStatus::Completed => {
                pb.finish_with_message(format!("{} done", style("✓").green().bold()));
            }
            TransferStatus::Failed => {
                pb.abandon_with_message(format!("{} failed", style("✗").red().bold()));
            }
            TransferStatus::Paused => {
                pb.abandon_with_message(format!("{} paused", style("⏸").yellow()));
            }
            _ => {
                let eta = update.eta_secs.map(format_eta).unwrap_or_default();
                pb.set_message(eta);
            }
        }
    }

    fn clear(&mut self) {
        for (_, pb) in self.bars.drain() {
            if !pb.is_finished() {
                pb.finish_and_clear();
            }
        }
    }
}

/// Bar counting finished stream segments
pub fn stream_bar(visible: bool) -> (mpsc::Sender<StreamProgress>, JoinHandle<()>) {
    let pb = if visible {
        ProgressBar::new(0)
    } else {
        ProgressBar::hidden()
    };
    pb.set_style(count_style());
    pb.set_message("segments");

    let (tx, mut rx) = mpsc::channel::<StreamProgress>(256);
    let handle = tokio::spawn(async move {
        while let Some(progress) = rx.recv().await {
            pb.set_length(progress.total as u64);
            pb.set_position(progress.completed as u64);
        }
        pb.finish_and_clear();
    });
    (tx, handle)
}

/// Bar tracking finished batch items
pub struct BatchBar {
    pb: ProgressBar,
}

impl BatchBar {
    pub fn new(visible: bool) -> Self {
        let pb = if visible {
            ProgressBar::new(0)
        } else {
            ProgressBar::hidden()
        };
        pb.set_style(count_style());
        Self { pb }
    }

    pub fn update(&self, progress: &BatchProgress) {
        self.pb.set_length(progress.total as u64);
        self.pb.set_position(progress.finished() as u64);
        self.pb.set_message(format!(
            "{} failed, {} skipped, {} running",
            progress.failed, progress.skipped, progress.in_progress
        ));
    }

    pub fn finish(&self) {
        self.pb.finish_and_clear();
    }
}
