//! Progress event schema
//!
//! Events carry the wire shape consumed by SSE/WebSocket bridges:
//! `{type, status, progress, total, processed, message}` with `progress`
//! normalized into `[0, 1]`.

use crate::types::round2;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Stage tag carried by every progress event
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProgressStatus {
    /// Candidate IP rows are being written
    Inserting,
    /// A probe run is underway
    InProgress,
    /// Terminal event for the operation
    Completed,
}

impl fmt::Display for ProgressStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProgressStatus::Inserting => f.write_str("inserting"),
            ProgressStatus::InProgress => f.write_str("in_progress"),
            ProgressStatus::Completed => f.write_str("completed"),
        }
    }
}

/// One progress update published on the bus
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProgressEvent {
    #[serde(rename = "type")]
    pub kind: String,
    pub status: ProgressStatus,
    pub progress: f64,
    pub total: usize,
    pub processed: usize,
    pub message: String,
}

impl ProgressEvent {
    fn new(status: ProgressStatus, processed: usize, total: usize, message: &str) -> Self {
        let progress = if total == 0 {
            0.0
        } else {
            round2(processed as f64 / total as f64)
        };
        Self {
            kind: "progress".to_string(),
            status,
            progress: progress.clamp(0.0, 1.0),
            total,
            processed,
            message: message.to_string(),
        }
    }

    /// Batch of candidate rows committed
    pub fn inserting(processed: usize, total: usize, message: &str) -> Self {
        Self::new(ProgressStatus::Inserting, processed, total, message)
    }

    /// Probe batch finished
    pub fn in_progress(processed: usize, total: usize, message: &str) -> Self {
        Self::new(ProgressStatus::InProgress, processed, total, message)
    }

    /// Terminal event; `progress` pinned to 1.0
    pub fn completed(processed: usize, total: usize, message: &str) -> Self {
        let mut event = Self::new(ProgressStatus::Completed, processed, total, message);
        event.progress = 1.0;
        event
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_progress_fraction() {
        let event = ProgressEvent::inserting(500, 2000, "writing candidate rows");
        assert_eq!(event.kind, "progress");
        assert_eq!(event.status, ProgressStatus::Inserting);
        assert_eq!(event.progress, 0.25);
        assert_eq!(event.total, 2000);
        assert_eq!(event.processed, 500);
    }

    #[test]
    fn test_zero_total_does_not_divide() {
        let event = ProgressEvent::in_progress(0, 0, "empty run");
        assert_eq!(event.progress, 0.0);
    }

    #[test]
    fn test_completed_pins_progress() {
        let event = ProgressEvent::completed(7, 100, "done early");
        assert_eq!(event.status, ProgressStatus::Completed);
        assert_eq!(event.progress, 1.0);
    }

    #[test]
    fn test_wire_shape() {
        let event = ProgressEvent::completed(4, 4, "candidate update finished");
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "progress");
        assert_eq!(json["status"], "completed");
        assert_eq!(json["progress"], 1.0);
        assert_eq!(json["total"], 4);
        assert_eq!(json["processed"], 4);

        let back: ProgressEvent = serde_json::from_value(json).unwrap();
        assert_eq!(back, event);
    }
}
