//! Workflow event bus
//!
//! Services emit a [`HealthEvent`] after each committed change. Delivery is
//! fire-and-forget: emitting with no subscribers is a no-op, and a slow
//! subscriber lags rather than blocking the emitter.

use std::sync::Arc;

use tokio::sync::broadcast;
use tracing::{debug, info, trace};

/// Events emitted by services after commit
#[derive(Debug, Clone, PartialEq)]
pub enum HealthEvent {
    PrincipalRegistered {
        id: String,
        role: String,
    },
    RecordSubmitted {
        record_id: String,
        owner_id: String,
        data_type: String,
    },
    ConsentUpdated {
        record_id: String,
        consent_id: String,
        research_use: bool,
    },
    AccessRequested {
        request_id: String,
        record_id: String,
        requester_id: String,
    },
    AccessResponded {
        request_id: String,
        status: String,
        policy_id: Option<String>,
    },
    DatasetAccessed {
        record_id: String,
        grantee_id: String,
    },
    TokensCredited {
        principal_id: String,
        kind: String,
        amount: i64,
    },
    Notified {
        principal_id: String,
        kind: String,
    },
}

/// Trait for event listeners
pub trait EventListener: Send + Sync {
    fn on_event(&self, event: &HealthEvent);
}

pub struct EventBus {
    sender: broadcast::Sender<HealthEvent>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::with_capacity(1024)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    pub fn emit(&self, event: HealthEvent) {
        trace!(event = ?event, "Emitting health event");
        // No subscribers is fine
        let _ = self.sender.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<HealthEvent> {
        self.sender.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

/// Audit trail of workflow events
pub struct LoggingEventListener;

impl EventListener for LoggingEventListener {
    fn on_event(&self, event: &HealthEvent) {
        match event {
            HealthEvent::RecordSubmitted { record_id, owner_id, data_type } => {
                info!(record = %record_id, owner = %owner_id, data_type = %data_type, "Record submitted");
            }
            HealthEvent::ConsentUpdated { record_id, consent_id, research_use } => {
                info!(record = %record_id, consent = %consent_id, research_use, "Consent updated");
            }
            HealthEvent::AccessRequested { request_id, record_id, requester_id } => {
                info!(request = %request_id, record = %record_id, requester = %requester_id, "Access requested");
            }
            HealthEvent::AccessResponded { request_id, status, policy_id } => {
                info!(request = %request_id, status = %status, policy = ?policy_id, "Access request answered");
            }
            HealthEvent::DatasetAccessed { record_id, grantee_id } => {
                info!(record = %record_id, grantee = %grantee_id, "Dataset accessed");
            }
            _ => {
                debug!(event = ?event, "Health event");
            }
        }
    }
}

/// Spawn a background task that logs all events
pub fn spawn_logging_listener(event_bus: Arc<EventBus>) -> tokio::task::JoinHandle<()> {
    let mut receiver = event_bus.subscribe();
    let listener = LoggingEventListener;

    tokio::spawn(async move {
        loop {
            match receiver.recv().await {
                Ok(event) => listener.on_event(&event),
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    debug!(skipped = n, "Event listener lagged, skipped events");
                }
                Err(broadcast::error::RecvError::Closed) => {
                    debug!("Event bus closed, stopping listener");
                    break;
                }
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::time::{timeout, Duration};

    #[tokio::test]
    async fn test_emit_receive() {
        let bus = EventBus::new();
        let mut receiver = bus.subscribe();

        bus.emit(HealthEvent::AccessRequested {
            request_id: "req-1".into(),
            record_id: "rec-1".into(),
            requester_id: "lab".into(),
        });

        let event = timeout(Duration::from_millis(100), receiver.recv())
            .await
            .expect("timeout")
            .expect("receive error");

        match event {
            HealthEvent::AccessRequested { request_id, .. } => assert_eq!(request_id, "req-1"),
            other => panic!("Wrong event: {:?}", other),
        }
    }

    #[test]
    fn test_emit_without_subscribers() {
        let bus = EventBus::new();
        assert_eq!(bus.subscriber_count(), 0);
        bus.emit(HealthEvent::Notified {
            principal_id: "p".into(),
            kind: "access_request".into(),
        });
    }
}
