//! Emergency lifecycle notifications
//!
//! Publish-once-per-transition pub/sub using Tokio broadcast channels.
//! Observers (status indicators, monitors) subscribe independently; nothing
//! polls the orchestrator's internal state.
//!
//! The payload shape is consumed outside this crate and must stay exactly
//! `{"active": bool, "pressure": number, "reason"?: string}`.

use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::broadcast;
use tracing::debug;

/// Event name under which notifications are published.
pub const EMERGENCY_EVENT: &str = "resource-emergency";

/// Channel capacity for broadcast
const CHANNEL_CAPACITY: usize = 64;

/// Notifications kept for late observers
const HISTORY_LEN: usize = 32;

/// Emitted on every emergency transition, in either direction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EmergencyNotification {
    pub active: bool,
    pub pressure: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

impl EmergencyNotification {
    pub fn entered(pressure: f64, reason: impl Into<String>) -> Self {
        Self {
            active: true,
            pressure,
            reason: Some(reason.into()),
        }
    }

    pub fn exited(pressure: f64) -> Self {
        Self {
            active: false,
            pressure,
            reason: None,
        }
    }

    pub fn event_name(&self) -> &'static str {
        EMERGENCY_EVENT
    }
}

/// Shared reference to NotificationBus
pub type SharedNotificationBus = Arc<NotificationBus>;

/// Broadcast bus for [`EmergencyNotification`]s.
pub struct NotificationBus {
    sender: broadcast::Sender<EmergencyNotification>,
    history: Mutex<VecDeque<EmergencyNotification>>,
    published: AtomicU64,
}

impl NotificationBus {
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(CHANNEL_CAPACITY);
        Self {
            sender,
            history: Mutex::new(VecDeque::with_capacity(HISTORY_LEN)),
            published: AtomicU64::new(0),
        }
    }

    pub fn shared(self) -> SharedNotificationBus {
        Arc::new(self)
    }

    /// Publish to all subscribers. Returns the number of receivers reached;
    /// having none is not an error.
    pub fn publish(&self, notification: EmergencyNotification) -> usize {
        self.published.fetch_add(1, Ordering::Relaxed);
        {
            let mut history = self.history.lock().unwrap_or_else(PoisonError::into_inner);
            if history.len() == HISTORY_LEN {
                history.pop_front();
            }
            history.push_back(notification.clone());
        }

        let active = notification.active;
        match self.sender.send(notification) {
            Ok(count) => {
                debug!(event = EMERGENCY_EVENT, active, receivers = count, "Notification published");
                count
            }
            Err(_) => {
                debug!(event = EMERGENCY_EVENT, active, "Notification published (no receivers)");
                0
            }
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<EmergencyNotification> {
        self.sender.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }

    pub fn has_subscribers(&self) -> bool {
        self.sender.receiver_count() > 0
    }

    /// Total notifications published since construction.
    pub fn published_count(&self) -> u64 {
        self.published.load(Ordering::Relaxed)
    }

    /// Most recent notifications, oldest first.
    pub fn recent(&self) -> Vec<EmergencyNotification> {
        self.history
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .cloned()
            .collect()
    }
}

impl Default for NotificationBus {
    fn default() -> Self {
        Self::new()
    }
}
