//! Notification service
//!
//! Rows are written by the workflows inside their own transactions; this
//! service reads the inbox, flips read state, and publishes committed
//! notifications on the event bus.

use std::sync::Arc;

use serde::Serialize;

use crate::db::notifications::{self, Notification};
use crate::db::HealthDb;
use crate::error::HealthError;

use super::events::{EventBus, HealthEvent};

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Inbox {
    pub notifications: Vec<Notification>,
    pub unread_count: i64,
}

pub struct NotificationService {
    db: Arc<HealthDb>,
    events: Arc<EventBus>,
}

impl NotificationService {
    pub fn new(db: Arc<HealthDb>, events: Arc<EventBus>) -> Self {
        Self { db, events }
    }

    pub fn inbox(&self, principal_id: &str, unread_only: bool) -> Result<Inbox, HealthError> {
        self.db.with_conn(|conn| {
            Ok(Inbox {
                notifications: notifications::list_for_principal(conn, principal_id, unread_only)?,
                unread_count: notifications::unread_count(conn, principal_id)?,
            })
        })
    }

    /// Only the addressee may mark a notification read
    pub fn mark_read(&self, id: &str, principal_id: &str) -> Result<(), HealthError> {
        let changed = self.db.with_conn(|conn| notifications::mark_read(conn, id, principal_id))?;
        if changed {
            Ok(())
        } else {
            Err(HealthError::NotFound(format!("notification {}", id)))
        }
    }

    pub fn unread_count(&self, principal_id: &str) -> Result<i64, HealthError> {
        self.db.with_conn(|conn| notifications::unread_count(conn, principal_id))
    }

    /// Broadcast a notification that has been committed
    pub fn publish(&self, notification: &Notification) {
        self.events.emit(HealthEvent::Notified {
            principal_id: notification.principal_id.clone(),
            kind: notification.kind.clone(),
        });
    }
}
