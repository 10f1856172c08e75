use std::sync::{Arc, Mutex};
use std::time::Duration;

use crossbeam_channel::{Receiver, Sender, TrySendError};

/// Zero-payload broadcast trigger: "recompute and resend now".
///
/// Every subscriber gets its own one-slot channel, so repeated sends before a
/// subscriber looks are coalesced into one wake-up. Delivery is at-least-once
/// and unordered with respect to records.
#[derive(Clone, Default)]
pub struct BackendSignal {
    subscribers: Arc<Mutex<Vec<Sender<()>>>>,
}

pub struct SignalReceiver {
    rx: Receiver<()>,
}

impl BackendSignal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&self) -> SignalReceiver {
        let (tx, rx) = crossbeam_channel::bounded(1);
        self.lock().push(tx);
        SignalReceiver { rx }
    }

    /// Wakes all subscribers. Dropped subscribers are pruned.
    pub fn send(&self) {
        self.lock()
            .retain(|tx| !matches!(tx.try_send(()), Err(TrySendError::Disconnected(_))));
    }

    pub fn subscriber_count(&self) -> usize {
        self.lock().len()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Vec<Sender<()>>> {
        self.subscribers.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl SignalReceiver {
    /// Consumes a pending wake-up, if any.
    pub fn recv(&self) -> bool {
        self.rx.try_recv().is_ok()
    }

    pub fn wait(&self, timeout: Duration) -> bool {
        self.rx.recv_timeout(timeout).is_ok()
    }
}
