//! User-visible error slot
//!
//! Holds at most one message. Publishing replaces whatever is shown;
//! nothing clears it except an explicit [`ErrorChannel::clear`] or the next
//! publish. Observers follow changes through a watch receiver.

use chrono::{DateTime, Utc};
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::watch;
use tracing::{debug, warn};

/// A message currently shown to the user
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ErrorNotice {
    /// Text shown to the user
    pub message: String,
    /// Increases with every publish, so repeated identical messages differ
    pub sequence: u64,
    /// When it was published
    pub published_at: DateTime<Utc>,
}

/// Single-slot error display
pub struct ErrorChannel {
    slot: watch::Sender<Option<ErrorNotice>>,
    sequence: AtomicU64,
}

impl Default for ErrorChannel {
    fn default() -> Self {
        Self::new()
    }
}

impl ErrorChannel {
    pub fn new() -> Self {
        let (slot, _) = watch::channel(None);
        Self {
            slot,
            sequence: AtomicU64::new(0),
        }
    }

    /// Show `message`, replacing any previous one
    pub fn publish(&self, message: impl Into<String>) {
        let message = message.into();
        let sequence = self.sequence.fetch_add(1, Ordering::SeqCst) + 1;
        warn!("{}", message);
        self.slot.send_replace(Some(ErrorNotice {
            message,
            sequence,
            published_at: Utc::now(),
        }));
    }

    /// Hide the current message; a no-op when nothing is shown
    pub fn clear(&self) {
        let cleared = self.slot.send_if_modified(|slot| slot.take().is_some());
        if cleared {
            debug!("Error message cleared");
        }
    }

    /// The notice currently shown, if any
    pub fn current(&self) -> Option<ErrorNotice> {
        self.slot.borrow().clone()
    }

    /// Text of the notice currently shown, if any
    pub fn message(&self) -> Option<String> {
        self.slot.borrow().as_ref().map(|n| n.message.clone())
    }

    pub fn is_visible(&self) -> bool {
        self.slot.borrow().is_some()
    }

    /// Follow the slot as it changes
    pub fn subscribe(&self) -> watch::Receiver<Option<ErrorNotice>> {
        self.slot.subscribe()
    }
}
