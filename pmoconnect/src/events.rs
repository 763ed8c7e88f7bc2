use std::sync::Arc;

use crossbeam_channel::{Receiver, Sender, unbounded};
use parking_lot::Mutex;
use pmoupnp::PeerIdentifier;

/// Événements publiés par le [`PeerWatcher`](crate::PeerWatcher).
#[derive(Debug, Clone, PartialEq)]
pub enum WatcherEvent {
    /// L'ensemble des pairs disponibles a changé
    AvailablePeersChanged { peers: Vec<PeerIdentifier> },
}

#[derive(Clone, Default)]
pub struct WatcherEventBus {
    subscribers: Arc<Mutex<Vec<Sender<WatcherEvent>>>>,
}

impl WatcherEventBus {
    pub fn new() -> Self {
        Self {
            subscribers: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn subscribe(&self) -> Receiver<WatcherEvent> {
        let (tx, rx) = unbounded::<WatcherEvent>();
        self.subscribers.lock().push(tx);
        rx
    }

    pub(crate) fn broadcast(&self, event: WatcherEvent) {
        let mut subscribers = self.subscribers.lock();
        subscribers.retain(|tx| tx.send(event.clone()).is_ok());
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.lock().len()
    }
}
