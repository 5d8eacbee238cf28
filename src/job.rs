//! Job model: descriptors, states and the shared status cell.
//!
//! The UI thread reads job status once per rendered frame while a worker
//! task mutates it, so scalar progress fields are atomics and only state
//! transitions and strings take a short lock.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use serde::Serialize;
use tokio_util::sync::CancellationToken;

/// Immutable catalog record for one game, supplied by the catalog store
/// by value.
#[derive(Debug, Clone)]
pub struct GameDescriptor {
    pub platform_id: String,
    pub source_id: String,
    /// Canonical game name; doubles as the job key.
    pub name: String,
    /// Direct box-art URL used as the scraper's cache fallback.
    pub image_url: Option<String>,
    pub download_url: String,
    /// Whether nested archives should be unpacked automatically.
    pub is_extractable: bool,
    /// Whether a single output file may be renamed to the canonical name.
    pub can_be_renamed: bool,
}

/// Lifecycle states of a download job.
///
/// `Queued → Downloading → Processing → Scraping → Completed`, with any
/// active state able to divert to `Cancelling → Cancelled` or `Error`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    Queued,
    Downloading,
    Processing,
    Scraping,
    Completed,
    Cancelling,
    Cancelled,
    Error,
}

impl JobState {
    /// Active states count against the scheduler's slot cap.
    pub fn is_active(self) -> bool {
        matches!(
            self,
            JobState::Downloading | JobState::Processing | JobState::Scraping | JobState::Cancelling
        )
    }

    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            JobState::Completed | JobState::Cancelled | JobState::Error
        )
    }
}

/// Point-in-time view of one job, polled by the UI every frame.
#[derive(Debug, Clone, Serialize)]
pub struct JobStatus {
    pub key: String,
    pub platform_id: String,
    pub state: JobState,
    /// 0–100; 0 while the total size is unknown.
    pub progress: f32,
    pub current_bytes: u64,
    pub total_bytes: u64,
    pub bytes_per_second: f64,
    /// Present during Processing.
    pub current_operation: Option<String>,
    /// Present in the Error state.
    pub error_message: Option<String>,
    /// Present while Queued; 1 = next in line.
    pub queue_position: Option<usize>,
}

#[derive(Debug)]
struct SlowFields {
    state: JobState,
    current_operation: Option<String>,
    error_message: Option<String>,
    queue_position: Option<usize>,
}

/// Shared status cell for one job. The scheduler owns the job's lifetime;
/// the worker holds a reference for status writes.
#[derive(Debug)]
pub struct JobShared {
    pub game: GameDescriptor,
    pub cancel: CancellationToken,
    current_bytes: AtomicU64,
    total_bytes: AtomicU64,
    speed_bits: AtomicU64,
    slow: Mutex<SlowFields>,
}

impl JobShared {
    pub fn new(game: GameDescriptor) -> Self {
        Self {
            game,
            cancel: CancellationToken::new(),
            current_bytes: AtomicU64::new(0),
            total_bytes: AtomicU64::new(0),
            speed_bits: AtomicU64::new(0),
            slow: Mutex::new(SlowFields {
                state: JobState::Queued,
                current_operation: None,
                error_message: None,
                queue_position: None,
            }),
        }
    }

    /// Unique key among tracked jobs.
    pub fn key(&self) -> &str {
        &self.game.name
    }

    pub fn state(&self) -> JobState {
        self.slow.lock().unwrap().state
    }

    pub fn set_state(&self, state: JobState) {
        let mut slow = self.slow.lock().unwrap();
        // A cancelling job only moves forward to a terminal state; stage
        // transitions from a worker that has not yet observed the token
        // must not resurface it as active.
        if slow.state == JobState::Cancelling && !state.is_terminal() {
            return;
        }
        slow.state = state;
        if state != JobState::Queued {
            slow.queue_position = None;
        }
        if state != JobState::Processing {
            slow.current_operation = None;
        }
    }

    /// Transition to Error with a human-readable message. A job already
    /// in Cancelling resolves to Cancelled instead; the failure was just
    /// the cancellation tearing the stage down.
    pub fn set_error(&self, message: impl Into<String>) {
        let mut slow = self.slow.lock().unwrap();
        if slow.state == JobState::Cancelling {
            slow.state = JobState::Cancelled;
        } else {
            slow.state = JobState::Error;
            slow.error_message = Some(message.into());
        }
        slow.current_operation = None;
        slow.queue_position = None;
    }

    pub fn set_queue_position(&self, position: Option<usize>) {
        self.slow.lock().unwrap().queue_position = position;
    }

    pub fn set_current_bytes(&self, bytes: u64) {
        self.current_bytes.store(bytes, Ordering::Relaxed);
    }

    pub fn set_total_bytes(&self, bytes: u64) {
        self.total_bytes.store(bytes, Ordering::Relaxed);
    }

    pub fn total_bytes(&self) -> u64 {
        self.total_bytes.load(Ordering::Relaxed)
    }

    pub fn set_bytes_per_second(&self, speed: f64) {
        self.speed_bits.store(speed.to_bits(), Ordering::Relaxed);
    }

    /// Snapshot the job for UI polling.
    pub fn status(&self) -> JobStatus {
        let current = self.current_bytes.load(Ordering::Relaxed);
        let total = self.total_bytes.load(Ordering::Relaxed);
        let progress = if total > 0 {
            (current as f32 / total as f32 * 100.0).min(100.0)
        } else {
            0.0
        };

        let slow = self.slow.lock().unwrap();
        JobStatus {
            key: self.game.name.clone(),
            platform_id: self.game.platform_id.clone(),
            state: slow.state,
            progress,
            current_bytes: current,
            total_bytes: total,
            bytes_per_second: f64::from_bits(self.speed_bits.load(Ordering::Relaxed)),
            current_operation: slow.current_operation.clone(),
            error_message: slow.error_message.clone(),
            queue_position: slow.queue_position,
        }
    }
}

/// Converter sub-step reporting, mirrored into `current_operation`.
pub trait OperationReporter: Send + Sync {
    fn set_operation(&self, operation: &str);
}

impl OperationReporter for JobShared {
    fn set_operation(&self, operation: &str) {
        self.slow.lock().unwrap().current_operation = Some(operation.to_string());
    }
}

/// Human-readable byte count for UI display.
pub fn format_size(bytes: u64) -> String {
    const UNITS: &[&str] = &["B", "KB", "MB", "GB", "TB"];
    let mut size = bytes as f64;
    for unit in UNITS {
        if size < 1024.0 {
            return format!("{size:.2} {unit}");
        }
        size /= 1024.0;
    }
    format!("{size:.2} PB")
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;

    /// Reporter that discards operations, for converter tests.
    pub struct NullReporter;

    impl OperationReporter for NullReporter {
        fn set_operation(&self, _operation: &str) {}
    }

    pub fn descriptor(name: &str, platform: &str) -> GameDescriptor {
        GameDescriptor {
            platform_id: platform.to_string(),
            source_id: "test-source".to_string(),
            name: name.to_string(),
            image_url: None,
            download_url: String::new(),
            is_extractable: true,
            can_be_renamed: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_classification() {
        assert!(JobState::Downloading.is_active());
        assert!(JobState::Cancelling.is_active());
        assert!(!JobState::Queued.is_active());
        assert!(JobState::Completed.is_terminal());
        assert!(JobState::Error.is_terminal());
        assert!(!JobState::Scraping.is_terminal());
    }

    #[test]
    fn test_progress_unknown_total() {
        let job = JobShared::new(test_support::descriptor("Game", "SFC"));
        job.set_current_bytes(500);
        assert_eq!(job.status().progress, 0.0);

        job.set_total_bytes(1000);
        assert_eq!(job.status().progress, 50.0);
    }

    #[test]
    fn test_error_clears_operation_and_position() {
        let job = JobShared::new(test_support::descriptor("Game", "SFC"));
        job.set_state(JobState::Processing);
        job.set_operation("Extracting archive");
        job.set_error("download failed: HTTP 404");

        let status = job.status();
        assert_eq!(status.state, JobState::Error);
        assert_eq!(
            status.error_message.as_deref(),
            Some("download failed: HTTP 404")
        );
        assert!(status.current_operation.is_none());
        assert!(status.queue_position.is_none());
    }

    #[test]
    fn test_cancelling_sticks_until_terminal() {
        let job = JobShared::new(test_support::descriptor("Game", "SFC"));
        job.set_state(JobState::Cancelling);

        // A late worker stage transition must not resurface the job as
        // active.
        job.set_state(JobState::Downloading);
        assert_eq!(job.state(), JobState::Cancelling);
        job.set_state(JobState::Processing);
        assert_eq!(job.state(), JobState::Cancelling);

        job.set_state(JobState::Cancelled);
        assert_eq!(job.state(), JobState::Cancelled);
    }

    #[test]
    fn test_error_while_cancelling_resolves_to_cancelled() {
        let job = JobShared::new(test_support::descriptor("Game", "SFC"));
        job.set_state(JobState::Cancelling);
        job.set_error("connection reset");

        let status = job.status();
        assert_eq!(status.state, JobState::Cancelled);
        assert!(status.error_message.is_none());
    }

    #[test]
    fn test_format_size() {
        assert_eq!(format_size(512), "512.00 B");
        assert_eq!(format_size(2048), "2.00 KB");
        assert_eq!(format_size(5 * 1024 * 1024), "5.00 MB");
    }
}
