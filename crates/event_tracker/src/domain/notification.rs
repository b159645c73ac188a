use common::domain::{EventRecord, IgnoreReason, TrackOutcome};
use std::sync::Mutex;
use tokio::sync::broadcast;
use tracing::trace;

/// Payload of an `Ignored` notification
#[derive(Debug, Clone, PartialEq)]
pub struct IgnoredEvent {
    pub reason: IgnoreReason,
    pub category: String,
    pub identifier: String,
    pub details: serde_json::Value,
}

/// Lifecycle notifications published by the tracker
#[derive(Debug, Clone, PartialEq)]
pub enum TrackerNotification {
    /// A record was written by `track_event`
    Tracked(EventRecord),
    Immediate(EventRecord),
    Deferred(EventRecord),
    Ignored(IgnoredEvent),
    /// A due record was drained
    Processed(EventRecord),
    ConfigUpdated(EventRecord),
    /// Failure inside the background processor
    Error(String),
}

/// Result of `EventTrackerService::track_event`
#[derive(Debug, Clone, PartialEq)]
pub struct TrackResult {
    pub outcome: TrackOutcome,
    /// The record as persisted; `None` when admission was denied
    pub record: Option<EventRecord>,
    /// Set when `outcome` is `Ignored`
    pub reason: Option<IgnoreReason>,
}

/// Fan-out of tracker notifications over a broadcast channel.
///
/// Sends never block. Once closed, nothing further is delivered and new
/// subscribers see a closed channel.
pub(crate) struct Notifier {
    sender: Mutex<Option<broadcast::Sender<TrackerNotification>>>,
}

impl Notifier {
    pub(crate) fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self {
            sender: Mutex::new(Some(sender)),
        }
    }

    pub(crate) fn subscribe(&self) -> broadcast::Receiver<TrackerNotification> {
        let sender = self.sender.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        match sender.as_ref() {
            Some(sender) => sender.subscribe(),
            None => broadcast::channel(1).1,
        }
    }

    pub(crate) fn notify(&self, notification: TrackerNotification) {
        let sender = self.sender.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        if let Some(sender) = sender.as_ref() {
            // An error only means nobody is subscribed
            if sender.send(notification).is_err() {
                trace!("notification dropped, no subscribers");
            }
        }
    }

    pub(crate) fn close(&self) {
        self.sender
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::broadcast::error::TryRecvError;

    #[test]
    fn test_subscribers_receive_notifications() {
        let notifier = Notifier::new(8);
        let mut rx = notifier.subscribe();

        notifier.notify(TrackerNotification::Error("boom".to_string()));

        assert_eq!(
            rx.try_recv().unwrap(),
            TrackerNotification::Error("boom".to_string())
        );
    }

    #[test]
    fn test_notify_without_subscribers_is_silent() {
        let notifier = Notifier::new(8);
        notifier.notify(TrackerNotification::Error("nobody listening".to_string()));
    }

    #[test]
    fn test_close_stops_delivery() {
        let notifier = Notifier::new(8);
        let mut rx = notifier.subscribe();

        notifier.close();
        notifier.notify(TrackerNotification::Error("late".to_string()));

        assert_eq!(rx.try_recv(), Err(TryRecvError::Closed));
        let mut late = notifier.subscribe();
        assert_eq!(late.try_recv(), Err(TryRecvError::Closed));
    }
}
