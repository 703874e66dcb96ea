//! Thread-safe progress accounting shared by hashing, upload and download.
//!
//! A [`ProgressTracker`] accumulates processed and skipped counts, throttles
//! calls into the caller's [`ProgressCallback`], and latches cancellation:
//! once the callback returns `false`, every later report returns `false`
//! without calling back again.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::constants::{DEFAULT_FILES_IN_CHUNK, DEFAULT_PROGRESS_INTERVAL_SECS};
use crate::progress::ProgressCallback;

/// Stage of file processing a tracker reports on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ProgressStatus {
    None,
    PreparingInProgress,
    UploadInProgress,
    DownloadInProgress,
}

impl ProgressStatus {
    /// Verb used at the start of progress messages.
    pub fn verb(&self) -> &'static str {
        match self {
            ProgressStatus::None => "",
            ProgressStatus::PreparingInProgress => "Processed",
            ProgressStatus::UploadInProgress => "Uploaded",
            ProgressStatus::DownloadInProgress => "Downloaded",
        }
    }
}

/// Snapshot handed to the progress callback.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProgressReportMetadata {
    pub status: ProgressStatus,
    /// Percentage complete, rounded to one decimal place.
    pub progress: f64,
    pub progress_message: String,
}

/// Final statistics for a hashing, upload or download pass.
///
/// `skipped_*` means "cache hit" for hashing and "already in the CAS or a
/// duplicate hash" for upload.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SummaryStatistics {
    /// Wall-clock seconds spent.
    pub total_time: f64,
    pub total_files: u64,
    pub total_bytes: u64,
    pub processed_files: u64,
    /// Bytes transferred, including parts of a multipart upload that was
    /// cancelled before completing.
    pub processed_bytes: u64,
    pub skipped_files: u64,
    pub skipped_bytes: u64,
    /// Processed bytes per second.
    pub transfer_rate: f64,
}

impl SummaryStatistics {
    /// Rate in bytes per second, zero when no time has elapsed.
    pub fn compute_transfer_rate(processed_bytes: u64, total_time: f64) -> f64 {
        if total_time > 0.0 {
            processed_bytes as f64 / total_time
        } else {
            0.0
        }
    }

    /// Add another pass's statistics into this one and recompute the rate.
    pub fn aggregate(&mut self, other: &SummaryStatistics) -> &mut Self {
        self.total_time += other.total_time;
        self.total_files += other.total_files;
        self.total_bytes += other.total_bytes;
        self.processed_files += other.processed_files;
        self.processed_bytes += other.processed_bytes;
        self.skipped_files += other.skipped_files;
        self.skipped_bytes += other.skipped_bytes;
        self.transfer_rate = Self::compute_transfer_rate(self.processed_bytes, self.total_time);
        self
    }
}

impl fmt::Display for SummaryStatistics {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Processed {} files ({}), skipped {} files ({}), of {} files ({}) in {:.2}s, {}/s",
            self.processed_files,
            human_readable_file_size(self.processed_bytes),
            self.skipped_files,
            human_readable_file_size(self.skipped_bytes),
            self.total_files,
            human_readable_file_size(self.total_bytes),
            self.total_time,
            human_readable_file_size(self.transfer_rate as u64),
        )
    }
}

/// Download statistics, with the number of files written under each root.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DownloadSummaryStatistics {
    #[serde(flatten)]
    pub summary: SummaryStatistics,
    pub file_counts_by_root_directory: BTreeMap<String, u64>,
}

impl DownloadSummaryStatistics {
    /// Add another download's statistics, summing per-root counts.
    pub fn aggregate(&mut self, other: &DownloadSummaryStatistics) -> &mut Self {
        self.summary.aggregate(&other.summary);
        for (root, count) in &other.file_counts_by_root_directory {
            *self
                .file_counts_by_root_directory
                .entry(root.clone())
                .or_insert(0) += count;
        }
        self
    }

    /// Drop the per-root breakdown.
    pub fn convert_to_summary_statistics(&self) -> SummaryStatistics {
        self.summary.clone()
    }
}

/// Format a byte count with 1000-based units, e.g. `1.5 KB`.
///
/// Values that round up to the next unit are shown in that unit, so
/// 999999 bytes prints as `1.0 MB`.
pub fn human_readable_file_size(size_in_bytes: u64) -> String {
    const POSTFIXES: [&str; 6] = ["B", "KB", "MB", "GB", "TB", "PB"];

    let mut converted: f64 = size_in_bytes as f64;
    let mut rounded: f64 = 0.0;
    for postfix in POSTFIXES {
        rounded = (converted * 100.0).round() / 100.0;
        if rounded < 1000.0 {
            return format!("{} {}", format_decimal(rounded), postfix);
        }
        converted /= 1000.0;
    }
    format!("{} {}", format_decimal(rounded), POSTFIXES[POSTFIXES.len() - 1])
}

fn format_decimal(value: f64) -> String {
    if value.fract() == 0.0 {
        format!("{:.1}", value)
    } else {
        format!("{}", value)
    }
}

#[derive(Debug, Default)]
struct Counters {
    total_files: u64,
    total_bytes: u64,
    processed_files: u64,
    processed_bytes: u64,
    skipped_files: u64,
    skipped_bytes: u64,
    files_per_chunk: u64,
    completed_files_in_chunk: u64,
    last_report: Option<Instant>,
    total_time: Option<Duration>,
}

/// Accumulates progress for one operation and reports it to the caller.
///
/// A report is sent on the first call, whenever `interval` has elapsed since
/// the previous report, whenever a chunk of files completes, and when
/// processed plus skipped reaches the total.
pub struct ProgressTracker {
    status: ProgressStatus,
    on_progress: Option<Arc<dyn ProgressCallback<ProgressReportMetadata>>>,
    interval: Duration,
    max_files_in_chunk: u64,
    counters: Mutex<Counters>,
    continue_reporting: AtomicBool,
    started: Instant,
}

impl ProgressTracker {
    /// Create a tracker with the default 1s interval and 50-file chunk.
    ///
    /// # Arguments
    /// * `status` - Stage being tracked; selects the message verb
    /// * `on_progress` - Optional callback; returning `false` cancels
    pub fn new(
        status: ProgressStatus,
        on_progress: Option<Arc<dyn ProgressCallback<ProgressReportMetadata>>>,
    ) -> Self {
        Self {
            status,
            on_progress,
            interval: Duration::from_secs(DEFAULT_PROGRESS_INTERVAL_SECS),
            max_files_in_chunk: DEFAULT_FILES_IN_CHUNK,
            counters: Mutex::new(Counters {
                files_per_chunk: 1,
                ..Counters::default()
            }),
            continue_reporting: AtomicBool::new(true),
            started: Instant::now(),
        }
    }

    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    pub fn with_files_in_chunk(mut self, files_in_chunk: u64) -> Self {
        self.max_files_in_chunk = files_in_chunk.max(1);
        self
    }

    pub fn status(&self) -> ProgressStatus {
        self.status
    }

    /// Record how much work the operation will do.
    ///
    /// Small batches report after every file; batches larger than the
    /// chunk size report once per chunk.
    pub fn set_total_files(&self, total_files: u64, total_bytes: u64) {
        let mut counters = self.counters.lock();
        counters.total_files = total_files;
        counters.total_bytes = total_bytes;
        counters.files_per_chunk = if total_files > self.max_files_in_chunk {
            self.max_files_in_chunk
        } else {
            1
        };
    }

    /// Byte-level hook for chunked transfers.
    ///
    /// # Arguments
    /// * `bytes_amount` - Bytes moved since the previous call
    /// * `current_file_done` - Whether this call completes a file
    ///
    /// # Returns
    /// `false` once the operation has been cancelled.
    pub fn track_progress_callback(&self, bytes_amount: u64, current_file_done: bool) -> bool {
        let mut counters = self.counters.lock();
        counters.processed_bytes += bytes_amount;
        if current_file_done {
            counters.processed_files += 1;
            counters.completed_files_in_chunk += 1;
        }
        self.report_locked(&mut counters)
    }

    /// Count whole files as processed.
    pub fn increase_processed(&self, num_files: u64, file_bytes: u64) {
        let mut counters = self.counters.lock();
        counters.processed_files += num_files;
        counters.completed_files_in_chunk += num_files;
        counters.processed_bytes += file_bytes;
    }

    /// Count whole files as skipped.
    pub fn increase_skipped(&self, num_files: u64, file_bytes: u64) {
        let mut counters = self.counters.lock();
        counters.skipped_files += num_files;
        counters.completed_files_in_chunk += num_files;
        counters.skipped_bytes += file_bytes;
    }

    /// Report progress if any trigger condition holds.
    ///
    /// # Returns
    /// `false` once the operation has been cancelled.
    pub fn report_progress(&self) -> bool {
        let mut counters = self.counters.lock();
        self.report_locked(&mut counters)
    }

    /// Whether the operation should keep going. Does not call back.
    pub fn continue_reporting(&self) -> bool {
        self.continue_reporting.load(Ordering::SeqCst)
    }

    fn report_locked(&self, counters: &mut Counters) -> bool {
        if !self.continue_reporting.load(Ordering::SeqCst) {
            return false;
        }

        let now: Instant = Instant::now();
        let due: bool = match counters.last_report {
            None => true,
            Some(last) => now.duration_since(last) >= self.interval,
        } || counters.completed_files_in_chunk >= counters.files_per_chunk
            || counters.processed_files + counters.skipped_files == counters.total_files;

        if due {
            if let Some(callback) = &self.on_progress {
                let metadata: ProgressReportMetadata = self.report_metadata(counters);
                if !callback.on_progress(&metadata) {
                    log::debug!("Progress callback requested cancellation");
                    self.continue_reporting.store(false, Ordering::SeqCst);
                }
            }
            counters.last_report = Some(now);
            counters.completed_files_in_chunk = 0;
        }

        self.continue_reporting.load(Ordering::SeqCst)
    }

    fn report_metadata(&self, counters: &Counters) -> ProgressReportMetadata {
        let plural: &str = if counters.total_files == 1 { "" } else { "s" };
        let verb: &str = self.status.verb();

        if counters.total_bytes == 0 && counters.total_files != 0 {
            let completed_files: u64 = counters.processed_files + counters.skipped_files;
            return ProgressReportMetadata {
                status: self.status,
                progress: round_one_decimal(
                    completed_files as f64 / counters.total_files as f64 * 100.0,
                ),
                progress_message: format!(
                    "{} {}/{} file{}",
                    verb, completed_files, counters.total_files, plural
                ),
            };
        }

        let completed_bytes: u64 = counters.processed_bytes + counters.skipped_bytes;
        let progress: f64 = if counters.total_bytes > 0 {
            round_one_decimal(completed_bytes as f64 / counters.total_bytes as f64 * 100.0)
        } else {
            0.0
        };

        ProgressReportMetadata {
            status: self.status,
            progress,
            progress_message: format!(
                "{} {} / {} of {} file{}",
                verb,
                human_readable_file_size(completed_bytes),
                human_readable_file_size(counters.total_bytes),
                counters.total_files,
                plural
            ),
        }
    }

    /// Freeze the elapsed time used for the summary.
    pub fn stop_timer(&self) {
        let mut counters = self.counters.lock();
        if counters.total_time.is_none() {
            counters.total_time = Some(self.started.elapsed());
        }
    }

    /// Override the elapsed time used for the summary.
    pub fn set_total_time(&self, total_time: Duration) {
        self.counters.lock().total_time = Some(total_time);
    }

    /// Statistics so far. Uses the frozen time if [`stop_timer`](Self::stop_timer) was called.
    pub fn get_summary_statistics(&self) -> SummaryStatistics {
        let counters = self.counters.lock();
        let total_time: f64 = counters
            .total_time
            .unwrap_or_else(|| self.started.elapsed())
            .as_secs_f64();

        SummaryStatistics {
            total_time,
            total_files: counters.total_files,
            total_bytes: counters.total_bytes,
            processed_files: counters.processed_files,
            processed_bytes: counters.processed_bytes,
            skipped_files: counters.skipped_files,
            skipped_bytes: counters.skipped_bytes,
            transfer_rate: SummaryStatistics::compute_transfer_rate(
                counters.processed_bytes,
                total_time,
            ),
        }
    }

    /// Download statistics with per-root file counts.
    ///
    /// # Arguments
    /// * `downloaded_paths_by_root` - Local root directory to the files written under it
    pub fn get_download_summary_statistics(
        &self,
        downloaded_paths_by_root: &HashMap<String, Vec<String>>,
    ) -> DownloadSummaryStatistics {
        DownloadSummaryStatistics {
            summary: self.get_summary_statistics(),
            file_counts_by_root_directory: downloaded_paths_by_root
                .iter()
                .map(|(root, paths)| (root.clone(), paths.len() as u64))
                .collect(),
        }
    }
}

impl fmt::Debug for ProgressTracker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProgressTracker")
            .field("status", &self.status)
            .field("interval", &self.interval)
            .field("continue_reporting", &self.continue_reporting())
            .finish()
    }
}

fn round_one_decimal(value: f64) -> f64 {
    (value * 10.0).round() / 10.0
}
