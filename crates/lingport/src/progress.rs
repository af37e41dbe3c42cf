//! Conversion progress events for real-time status streaming.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

/// Phase of a conversion task.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ConversionPhase {
    Started,
    Converting,
    Validating,
    Deriving,
    Completed,
    Failed,
}

impl std::fmt::Display for ConversionPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConversionPhase::Started => write!(f, "Started"),
            ConversionPhase::Converting => write!(f, "Converting"),
            ConversionPhase::Validating => write!(f, "Validating"),
            ConversionPhase::Deriving => write!(f, "Deriving"),
            ConversionPhase::Completed => write!(f, "Completed"),
            ConversionPhase::Failed => write!(f, "Failed"),
        }
    }
}

/// Which pipe a tool output line came from.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum OutputStream {
    Stdout,
    Stderr,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConversionEvent {
    pub project_id: String,
    pub task_id: String,
    pub file_id: String,
    pub phase: ConversionPhase,
    pub message: String,
    pub timestamp: DateTime<Utc>,
    /// Set for tool output lines.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stream: Option<OutputStream>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub line: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ConversionEvent {
    pub fn new(
        project_id: &str,
        task_id: &str,
        file_id: &str,
        phase: ConversionPhase,
        message: impl Into<String>,
    ) -> Self {
        Self {
            project_id: project_id.to_string(),
            task_id: task_id.to_string(),
            file_id: file_id.to_string(),
            phase,
            message: message.into(),
            timestamp: Utc::now(),
            stream: None,
            line: None,
            error: None,
        }
    }

    pub fn with_line(mut self, stream: OutputStream, line: impl Into<String>) -> Self {
        self.stream = Some(stream);
        self.line = Some(line.into());
        self
    }

    pub fn with_error(mut self, error: impl Into<String>) -> Self {
        self.error = Some(error.into());
        self
    }
}

pub trait ProgressReporter: Send + Sync {
    fn report(&self, event: ConversionEvent);
}

/// Reporter that drops every event.
pub struct NoopProgress;

impl ProgressReporter for NoopProgress {
    fn report(&self, _event: ConversionEvent) {}
}

/// Fans events out to any number of subscribers.
///
/// Slow subscribers lose the oldest events rather than blocking the
/// executor.
#[derive(Clone)]
pub struct BroadcastProgress {
    sender: broadcast::Sender<ConversionEvent>,
}

impl BroadcastProgress {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ConversionEvent> {
        self.sender.subscribe()
    }
}

impl Default for BroadcastProgress {
    fn default() -> Self {
        Self::new(256)
    }
}

impl ProgressReporter for BroadcastProgress {
    fn report(&self, event: ConversionEvent) {
        // No receivers is not an error.
        let _ = self.sender.send(event);
    }
}
