//! Card presence notifications.
//!
//! Publishing never blocks, and nothing piles up if nobody's listening: the
//! channel holds one event, and a new one replaces whatever wasn't read yet.

use crossbeam_channel::{Receiver, Sender, TryRecvError, TrySendError};
use serde::{Deserialize, Serialize};
use tracing::trace;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Event {
    #[serde(rename = "Card present")]
    CardPresent,
    #[serde(rename = "Card NOT present")]
    CardAbsent,
    #[serde(rename = "Reader error")]
    ReaderError,
}

/// Wire format: `{"Event":"Card present"}`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    #[serde(rename = "Event")]
    pub event: Event,
}

impl From<Event> for Message {
    fn from(event: Event) -> Self {
        Self { event }
    }
}

impl Event {
    pub fn to_json(self) -> crate::Result<String> {
        Ok(serde_json::to_string(&Message::from(self))?)
    }
}

/// Publishing end. Cheap to clone.
#[derive(Debug, Clone)]
pub struct Publisher {
    tx: Sender<Event>,
    // Kept so the publisher can evict a stale event itself.
    rx: Receiver<Event>,
}

/// Receiving end.
#[derive(Debug, Clone)]
pub struct Subscriber {
    rx: Receiver<Event>,
}

pub fn channel() -> (Publisher, Subscriber) {
    let (tx, rx) = crossbeam_channel::bounded(1);
    (
        Publisher {
            tx,
            rx: rx.clone(),
        },
        Subscriber { rx },
    )
}

impl Publisher {
    pub fn publish(&self, event: Event) {
        let mut event = event;
        loop {
            match self.tx.try_send(event) {
                Ok(()) => return,
                Err(TrySendError::Full(ev)) => {
                    // Drop the stale one; if a subscriber got there first, fine.
                    if let Ok(stale) = self.rx.try_recv() {
                        trace!(?stale, "Replacing unread event");
                    }
                    event = ev;
                }
                // Unreachable while we hold a receiver ourselves.
                Err(TrySendError::Disconnected(_)) => return,
            }
        }
    }
}

impl Subscriber {
    /// The latest unread event, if any.
    pub fn latest(&self) -> Option<Event> {
        match self.rx.try_recv() {
            Ok(event) => Some(event),
            Err(TryRecvError::Empty | TryRecvError::Disconnected) => None,
        }
    }

    /// Blocks until the next event.
    pub fn recv(&self) -> Option<Event> {
        self.rx.recv().ok()
    }

    pub fn recv_timeout(&self, timeout: std::time::Duration) -> Option<Event> {
        self.rx.recv_timeout(timeout).ok()
    }
}
