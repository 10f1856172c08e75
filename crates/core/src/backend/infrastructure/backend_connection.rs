use std::time::Duration;

use crossbeam_channel::{Receiver, Sender, TrySendError};

use crate::backend::domain::compute_data::ComputeData;

/// Bounded, ordered channel of records between two stages.
///
/// Clones share the same queue, so several producers may hold a clone
/// (multi-producer mode). Records from one producer stay in order; records
/// from different producers interleave arbitrarily. Capacity is kept tiny
/// (1-2 slots) so live video favours freshness over completeness.
pub struct BackendConnection<T = ComputeData> {
    tx: Sender<T>,
    rx: Receiver<T>,
    capacity: usize,
}

impl<T> Clone for BackendConnection<T> {
    fn clone(&self) -> Self {
        Self {
            tx: self.tx.clone(),
            rx: self.rx.clone(),
            capacity: self.capacity,
        }
    }
}

impl<T> BackendConnection<T> {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        let (tx, rx) = crossbeam_channel::bounded(capacity);
        Self { tx, rx, capacity }
    }

    /// Non-blocking write. A full connection hands the record back so the
    /// producer can hold it and retry on a later tick.
    pub fn write(&self, record: T) -> Result<(), T> {
        match self.tx.try_send(record) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(record)) | Err(TrySendError::Disconnected(record)) => {
                Err(record)
            }
        }
    }

    /// Whether at least `n` records are waiting to be read.
    pub fn is_full_read(&self, n: usize) -> bool {
        self.rx.len() >= n
    }

    /// Waits up to `timeout` for a record.
    pub fn read(&self, timeout: Duration) -> Option<T> {
        if timeout.is_zero() {
            return self.rx.try_recv().ok();
        }
        self.rx.recv_timeout(timeout).ok()
    }

    pub fn len(&self) -> usize {
        self.rx.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rx.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

/// A record a producer could not deliver yet.
///
/// The producer keeps exactly one held record and retries it on every tick
/// until the consumer frees a slot; it never duplicates or drops it silently.
pub struct PendingRecord<T = ComputeData> {
    record: Option<T>,
    retries: u64,
}

impl<T> Default for PendingRecord<T> {
    fn default() -> Self {
        Self {
            record: None,
            retries: 0,
        }
    }
}

impl<T> PendingRecord<T> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_holding(&self) -> bool {
        self.record.is_some()
    }

    /// Takes ownership of `record`. Any previously held record is returned.
    pub fn hold(&mut self, record: T) -> Option<T> {
        self.retries = 0;
        self.record.replace(record)
    }

    /// Tries to deliver the held record. Returns `true` once nothing is held.
    pub fn try_deliver(&mut self, connection: &BackendConnection<T>) -> bool {
        let Some(record) = self.record.take() else {
            return true;
        };
        match connection.write(record) {
            Ok(()) => {
                self.retries = 0;
                true
            }
            Err(record) => {
                self.record = Some(record);
                self.retries += 1;
                false
            }
        }
    }

    /// Failed delivery attempts for the currently held record.
    pub fn retries(&self) -> u64 {
        self.retries
    }

    pub fn take(&mut self) -> Option<T> {
        self.retries = 0;
        self.record.take()
    }
}
