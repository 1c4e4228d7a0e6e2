//! Progress events for sync and classification.
//!
//! Producers push events into a [`ProgressSink`]; consumers read them in order
//! from the matching [`ProgressStream`]. Delivery is fire-and-forget: dropping
//! the stream does not stop the work that feeds it.

use std::pin::Pin;
use std::task::{Context, Poll};

use futures::Stream;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::domain::AccountId;

/// One step of an account cycle.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ProgressEvent {
    Connecting { account_id: AccountId },
    SelectingFolder { folder: String },
    CheckingNew,
    FoundMessages { total: usize },
    Downloading { current: usize, total: usize },
    Classifying { total: usize },
    ClassifyingProgress { current: usize, total: usize },
    /// Something was skipped but the cycle goes on.
    Warning { message: String },
    Success { new_messages: usize, skipped: usize },
    Error { error: String },
    /// Terminal event of an account cycle.
    Complete {
        new_messages: usize,
        classified_count: usize,
    },
}

impl ProgressEvent {
    /// The `status` discriminant as serialised.
    pub fn status(&self) -> &'static str {
        match self {
            ProgressEvent::Connecting { .. } => "connecting",
            ProgressEvent::SelectingFolder { .. } => "selecting_folder",
            ProgressEvent::CheckingNew => "checking_new",
            ProgressEvent::FoundMessages { .. } => "found_messages",
            ProgressEvent::Downloading { .. } => "downloading",
            ProgressEvent::Classifying { .. } => "classifying",
            ProgressEvent::ClassifyingProgress { .. } => "classifying_progress",
            ProgressEvent::Warning { .. } => "warning",
            ProgressEvent::Success { .. } => "success",
            ProgressEvent::Error { .. } => "error",
            ProgressEvent::Complete { .. } => "complete",
        }
    }
}

/// Write end of a progress channel. Cheap to clone.
#[derive(Debug, Clone, Default)]
pub struct ProgressSink {
    tx: Option<mpsc::UnboundedSender<ProgressEvent>>,
}

impl ProgressSink {
    /// A connected sink and its stream.
    pub fn channel() -> (Self, ProgressStream) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx: Some(tx) }, ProgressStream { rx })
    }

    /// A sink that discards everything.
    pub fn noop() -> Self {
        Self { tx: None }
    }

    /// Publishes an event. A gone consumer is not an error.
    pub fn emit(&self, event: ProgressEvent) {
        tracing::trace!(status = event.status(), "progress");
        if let Some(tx) = &self.tx {
            let _ = tx.send(event);
        }
    }
}

/// Read end of a progress channel.
#[derive(Debug)]
pub struct ProgressStream {
    rx: mpsc::UnboundedReceiver<ProgressEvent>,
}

impl ProgressStream {
    /// Events already queued, without waiting.
    pub fn drain(&mut self) -> Vec<ProgressEvent> {
        let mut events = Vec::new();
        while let Ok(event) = self.rx.try_recv() {
            events.push(event);
        }
        events
    }
}

impl Stream for ProgressStream {
    type Item = ProgressEvent;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.rx.poll_recv(cx)
    }
}
