//! Ordered job progress events with an enforced terminal-event invariant.
//!
//! The pipeline talks to the transport through a [`ProgressSender`]; the
//! transport drains the paired receiver and encodes whatever arrives. The
//! sender owns the stream invariants so no transport can violate them:
//! percentages never decrease, exactly one terminal event is emitted, and
//! nothing follows it.

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::debug;

use crate::domain::job::RenderResult;

/// One line of the job stream.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ProgressEvent {
    Progress { progress: u8, status: String },
    Error { message: String },
    Complete { result: RenderResult },
}

impl ProgressEvent {
    pub fn is_terminal(&self) -> bool {
        matches!(self, ProgressEvent::Error { .. } | ProgressEvent::Complete { .. })
    }
}

/// Create a paired sender and receiver for one job's stream.
pub fn progress_channel(capacity: usize) -> (ProgressSender, mpsc::Receiver<ProgressEvent>) {
    let (tx, rx) = mpsc::channel(capacity);
    (
        ProgressSender {
            tx,
            last_percent: 0,
            terminated: false,
        },
        rx,
    )
}

/// Writing half of a job stream. Not clonable: one job, one writer.
#[derive(Debug)]
pub struct ProgressSender {
    tx: mpsc::Sender<ProgressEvent>,
    last_percent: u8,
    terminated: bool,
}

impl ProgressSender {
    /// Emit a progress milestone. Percentages are clamped so the stream
    /// never moves backwards even if stages report out of order.
    pub async fn progress(&mut self, percent: u8, status: impl Into<String>) {
        let percent = percent.max(self.last_percent);
        self.last_percent = percent;
        self.send(ProgressEvent::Progress {
            progress: percent,
            status: status.into(),
        })
        .await;
    }

    /// Emit the terminal error event and latch the stream shut.
    pub async fn error(&mut self, message: impl Into<String>) {
        let event = ProgressEvent::Error {
            message: message.into(),
        };
        self.send(event).await;
        self.terminated = true;
    }

    /// Emit the terminal completion event and latch the stream shut.
    pub async fn complete(&mut self, result: RenderResult) {
        self.send(ProgressEvent::Complete { result }).await;
        self.terminated = true;
    }

    async fn send(&mut self, event: ProgressEvent) {
        if self.terminated {
            debug!(
                target = "application::progress",
                terminal = event.is_terminal(),
                "dropping event emitted after terminal"
            );
            return;
        }
        // A closed receiver means the caller went away; the job keeps
        // running to completion so cleanup still happens.
        if self.tx.send(event).await.is_err() {
            debug!(
                target = "application::progress",
                "caller disconnected before stream ended"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn drain(rx: &mut mpsc::Receiver<ProgressEvent>) -> Vec<ProgressEvent> {
        let mut events = Vec::new();
        while let Ok(event) = rx.try_recv() {
            events.push(event);
        }
        events
    }

    #[tokio::test]
    async fn percentages_never_decrease() {
        let (mut tx, mut rx) = progress_channel(8);
        tx.progress(60, "writing frames").await;
        tx.progress(20, "late starter").await;
        tx.progress(80, "rendered").await;

        let percents: Vec<u8> = drain(&mut rx)
            .into_iter()
            .map(|event| match event {
                ProgressEvent::Progress { progress, .. } => progress,
                other => panic!("unexpected event: {other:?}"),
            })
            .collect();
        assert_eq!(percents, vec![60, 60, 80]);
    }

    #[tokio::test]
    async fn nothing_follows_the_terminal_event() {
        let (mut tx, mut rx) = progress_channel(8);
        tx.progress(10, "preparing").await;
        tx.error("boom").await;
        tx.progress(90, "finalizing").await;
        tx.error("boom again").await;

        let events = drain(&mut rx);
        assert_eq!(events.len(), 2);
        assert!(events[1].is_terminal());
    }

    #[tokio::test]
    async fn stream_closes_when_sender_drops() {
        let (mut tx, mut rx) = progress_channel(8);
        tx.error("done").await;
        drop(tx);

        assert!(matches!(
            rx.recv().await,
            Some(ProgressEvent::Error { .. })
        ));
        assert!(rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn sending_to_a_gone_caller_does_not_panic() {
        let (mut tx, rx) = progress_channel(1);
        drop(rx);
        tx.progress(10, "preparing").await;
        tx.complete(RenderResult {
            success: true,
            video_url: None,
            video_path: None,
            logs: Vec::new(),
            is_mock: None,
            code: String::new(),
        })
        .await;
    }

    #[test]
    fn events_serialize_to_the_wire_shape() {
        let event = ProgressEvent::Progress {
            progress: 60,
            status: "Writing video frames".into(),
        };
        let json = serde_json::to_value(&event).expect("serialize");
        assert_eq!(json["type"], "progress");
        assert_eq!(json["progress"], 60);

        let event = ProgressEvent::Error {
            message: "no good".into(),
        };
        let json = serde_json::to_value(&event).expect("serialize");
        assert_eq!(json["type"], "error");
        assert_eq!(json["message"], "no good");
    }
}
