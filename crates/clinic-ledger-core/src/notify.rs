//! Cross-tab change notification.
//!
//! Every open [`crate::Repository`] on one database is a "tab". Tabs on the
//! same database share a [`ChangeHub`]; after a committed patient write the
//! writing tab publishes a [`ChangeEvent`] to every other tab. Delivery is
//! best-effort and carries no ordering guarantee across tabs: receivers
//! treat an event as a cue to re-read, never as the data itself. Each tab's
//! queue is bounded; events for a tab that is not draining it are dropped.

use std::sync::{Arc, Mutex, PoisonError};

use crossbeam_channel::{bounded, Receiver, Sender, TrySendError};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::models::Patient;

/// A committed patient mutation.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum ChangeEvent {
    PatientAdded(Patient),
    PatientUpdated(Patient),
    PatientDeleted { id: String },
}

impl ChangeEvent {
    /// ID of the patient the event refers to.
    pub fn patient_id(&self) -> &str {
        match self {
            ChangeEvent::PatientAdded(p) | ChangeEvent::PatientUpdated(p) => &p.id,
            ChangeEvent::PatientDeleted { id } => id,
        }
    }

    /// Wire form: `{"type": "patient_added", "data": {...}}`.
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

/// Events held for one subscriber before further events are dropped.
pub const QUEUE_CAPACITY: usize = 256;

struct Subscriber {
    tab_id: String,
    tx: Sender<ChangeEvent>,
}

/// Broadcast medium shared by all tabs of one database.
#[derive(Clone, Default)]
pub struct ChangeHub {
    subscribers: Arc<Mutex<Vec<Subscriber>>>,
}

impl ChangeHub {
    pub fn new() -> Self {
        Self::default()
    }

    /// Endpoint for a newly opened tab.
    pub fn open_tab(&self) -> ChangeNotifier {
        ChangeNotifier {
            hub: self.clone(),
            tab_id: uuid::Uuid::new_v4().to_string(),
        }
    }

    fn subscribe(&self, tab_id: &str) -> Receiver<ChangeEvent> {
        let (tx, rx) = bounded(QUEUE_CAPACITY);
        self.subscribers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(Subscriber {
                tab_id: tab_id.to_string(),
                tx,
            });
        rx
    }

    fn publish(&self, from_tab: &str, event: &ChangeEvent) -> usize {
        let mut subscribers = self
            .subscribers
            .lock()
            .unwrap_or_else(PoisonError::into_inner);

        let mut delivered = 0;
        // Drop subscribers whose receiver has gone away
        subscribers.retain(|sub| {
            if sub.tab_id == from_tab {
                return true;
            }
            match sub.tx.try_send(event.clone()) {
                Ok(()) => {
                    delivered += 1;
                    true
                }
                Err(TrySendError::Full(_)) => {
                    debug!(tab = %sub.tab_id, "change queue full, event dropped");
                    true
                }
                Err(TrySendError::Disconnected(_)) => false,
            }
        });
        delivered
    }
}

/// One tab's view of the hub.
#[derive(Clone)]
pub struct ChangeNotifier {
    hub: ChangeHub,
    tab_id: String,
}

impl ChangeNotifier {
    /// Identifier of this tab.
    pub fn tab_id(&self) -> &str {
        &self.tab_id
    }

    /// Receive events published by other tabs.
    pub fn subscribe(&self) -> Receiver<ChangeEvent> {
        self.hub.subscribe(&self.tab_id)
    }

    /// Fire-and-forget broadcast to every other tab. Returns the number of
    /// receivers the event was handed to.
    pub fn publish(&self, event: &ChangeEvent) -> usize {
        let delivered = self.hub.publish(&self.tab_id, event);
        debug!(
            tab = %self.tab_id,
            patient = event.patient_id(),
            delivered,
            "broadcast change"
        );
        delivered
    }
}
