//! Terminal-state notifications.
//!
//! The scheduler reports job outcomes through an injected sink so the
//! embedding frontend can toast or log them without the pipeline knowing
//! about any UI.

use tracing::{info, warn};

/// Terminal outcome of one job.
#[derive(Debug, Clone)]
pub enum JobEvent {
    Completed { key: String },
    Failed { key: String, message: String },
    Cancelled { key: String },
}

/// Receives terminal job events from the scheduler.
pub trait NotificationSink: Send + Sync {
    fn notify(&self, event: &JobEvent);
}

/// Default sink that writes events to the log.
#[derive(Debug, Default)]
pub struct LogSink;

impl NotificationSink for LogSink {
    fn notify(&self, event: &JobEvent) {
        match event {
            JobEvent::Completed { key } => info!("Download completed: {}", key),
            JobEvent::Failed { key, message } => warn!("Download failed: {}: {}", key, message),
            JobEvent::Cancelled { key } => info!("Download cancelled: {}", key),
        }
    }
}
