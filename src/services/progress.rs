// Progress sinks: push-only, best-effort receivers of (percentage, message) events

use parking_lot::Mutex;
use tokio::sync::broadcast;
use tracing::info;

use crate::core::types::{CaseId, ProgressEvent};

/// Receiver of pipeline progress.
///
/// `report` must not block and must not fail; a sink that cannot deliver drops the event.
pub trait ProgressSink: Send + Sync {
    fn report(&self, case_id: &CaseId, event: ProgressEvent);
}

/// Discards every event
pub struct NullProgress;

impl ProgressSink for NullProgress {
    fn report(&self, _case_id: &CaseId, _event: ProgressEvent) {}
}

/// Logs every event at INFO
pub struct TracingProgress;

impl ProgressSink for TracingProgress {
    fn report(&self, case_id: &CaseId, event: ProgressEvent) {
        info!(case_id = %case_id, "[{:>3}%] {}", event.percentage, event.message);
    }
}

/// Progress event tagged with its case, as sent over the broadcast channel
#[derive(Debug, Clone, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CaseProgress {
    pub case_id: CaseId,
    #[serde(flatten)]
    pub event: ProgressEvent,
}

/// Fans events out to any number of subscribers (the SSE endpoint).
///
/// Send errors (no subscribers) are ignored; slow subscribers lag and lose events.
#[derive(Clone)]
pub struct BroadcastProgress {
    sender: broadcast::Sender<CaseProgress>,
}

impl BroadcastProgress {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<CaseProgress> {
        self.sender.subscribe()
    }
}

impl ProgressSink for BroadcastProgress {
    fn report(&self, case_id: &CaseId, event: ProgressEvent) {
        let _ = self.sender.send(CaseProgress {
            case_id: case_id.clone(),
            event,
        });
    }
}

/// Forwards to two sinks (log and broadcast, for the HTTP service)
pub struct TeeProgress<A, B> {
    pub first: A,
    pub second: B,
}

impl<A: ProgressSink, B: ProgressSink> ProgressSink for TeeProgress<A, B> {
    fn report(&self, case_id: &CaseId, event: ProgressEvent) {
        self.first.report(case_id, event.clone());
        self.second.report(case_id, event);
    }
}

/// Keeps every event in memory
#[derive(Default)]
pub struct RecordingProgress {
    events: Mutex<Vec<ProgressEvent>>,
}

impl RecordingProgress {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<ProgressEvent> {
        self.events.lock().clone()
    }

    pub fn percentages(&self) -> Vec<u8> {
        self.events.lock().iter().map(|e| e.percentage).collect()
    }
}

impl ProgressSink for RecordingProgress {
    fn report(&self, _case_id: &CaseId, event: ProgressEvent) {
        self.events.lock().push(event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn event(percentage: u8) -> ProgressEvent {
        ProgressEvent {
            percentage,
            message: format!("step {}", percentage),
        }
    }

    #[test]
    fn test_broadcast_without_subscribers_does_not_fail() {
        let sink = BroadcastProgress::new(4);
        sink.report(&CaseId::new("a"), event(10));
    }

    #[tokio::test]
    async fn test_broadcast_delivers_to_subscriber() {
        let sink = BroadcastProgress::new(4);
        let mut rx = sink.subscribe();
        sink.report(&CaseId::new("a"), event(40));

        let received = rx.recv().await.unwrap();
        assert_eq!(received.case_id.as_str(), "a");
        assert_eq!(received.event.percentage, 40);
    }

    #[test]
    fn test_tee_and_recording() {
        let tee = TeeProgress {
            first: RecordingProgress::new(),
            second: RecordingProgress::new(),
        };
        tee.report(&CaseId::new("a"), event(20));
        tee.report(&CaseId::new("a"), event(100));
        assert_eq!(tee.first.percentages(), vec![20, 100]);
        assert_eq!(tee.second.events().len(), 2);
    }

    #[test]
    fn test_case_progress_serialization() {
        let json = serde_json::to_value(CaseProgress {
            case_id: CaseId::new("c1"),
            event: event(70),
        })
        .unwrap();
        assert_eq!(json["caseId"], "c1");
        assert_eq!(json["percentage"], 70);
    }
}
