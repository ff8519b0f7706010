//! The message channel seam between the engine and the hypervisor transport.
//!
//! The transport itself (ring buffers, interrupts, channel offers) is owned by the host. The
//! engine only needs a reliable, ordered, packet-oriented pipe plus a way to block until the
//! response for a given transaction shows up.

use std::collections::HashMap;
use std::sync::{Condvar, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    #[error("transaction 0x{0:x} already has a request in flight")]
    TransactionBusy(u64),

    #[error("no response for transaction 0x{id:x} within {timeout:?}")]
    TimedOut { id: u64, timeout: Duration },

    #[error("transaction 0x{0:x} was cancelled")]
    Cancelled(u64),

    #[error("channel closed")]
    Closed,

    #[error("send failed: {0}")]
    Send(String),
}

/// Outbound half of the synthvid channel plus transaction correlation.
///
/// `transaction_id` is `REQUEST_TRANSACTION_BASE_ID + <message type>`; for requests that expect a
/// response it is the key of the response type, so at most one request per response type can be
/// outstanding.
pub trait Transport: Send + Sync {
    /// Queues a packet without waiting for any response.
    fn send(&self, packet: &[u8], transaction_id: u64) -> Result<(), TransportError>;

    /// Sends a packet and blocks until [`Transport::complete_transaction`] is called for
    /// `transaction_id`, or until `timeout` elapses.
    fn send_and_await(
        &self,
        packet: &[u8],
        transaction_id: u64,
        timeout: Duration,
    ) -> Result<Vec<u8>, TransportError>;

    /// Delivers a response to a blocked [`Transport::send_and_await`] caller.
    ///
    /// Returns `false` if nobody is waiting on `transaction_id`.
    fn complete_transaction(&self, transaction_id: u64, response: &[u8]) -> bool;

    /// Size of the MMIO range the host set aside for the framebuffer, if it reported one.
    fn mmio_byte_count(&self) -> Option<u64>;
}

/// Table of in-flight transactions, for transports that correlate responses themselves.
///
/// A slot is created by [`begin`](Self::begin), filled by [`complete`](Self::complete) and
/// consumed by [`wait`](Self::wait). Waiters block on a condition variable; nothing spins.
#[derive(Debug, Default)]
pub struct PendingTransactions {
    slots: Mutex<HashMap<u64, Option<Vec<u8>>>>,
    delivered: Condvar,
}

impl PendingTransactions {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<u64, Option<Vec<u8>>>> {
        self.slots.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Reserves the slot for `id`. Must be called before the request hits the wire so that a
    /// fast response cannot be lost.
    pub fn begin(&self, id: u64) -> Result<(), TransportError> {
        let mut slots = self.lock();
        if slots.contains_key(&id) {
            return Err(TransportError::TransactionBusy(id));
        }
        slots.insert(id, None);
        Ok(())
    }

    pub fn complete(&self, id: u64, response: &[u8]) -> bool {
        let mut slots = self.lock();
        match slots.get_mut(&id) {
            Some(slot) if slot.is_none() => {
                *slot = Some(response.to_vec());
                drop(slots);
                self.delivered.notify_all();
                true
            }
            // Unknown id, or a duplicate response for one already delivered.
            _ => false,
        }
    }

    pub fn wait(&self, id: u64, timeout: Duration) -> Result<Vec<u8>, TransportError> {
        let slots = self.lock();
        let (mut slots, _) = self
            .delivered
            .wait_timeout_while(slots, timeout, |slots| matches!(slots.get(&id), Some(None)))
            .unwrap_or_else(PoisonError::into_inner);

        match slots.remove(&id) {
            Some(Some(response)) => Ok(response),
            Some(None) => Err(TransportError::TimedOut { id, timeout }),
            None => Err(TransportError::Cancelled(id)),
        }
    }

    /// Drops the slot for `id`, waking any waiter with [`TransportError::Cancelled`].
    pub fn cancel(&self, id: u64) {
        let removed = self.lock().remove(&id).is_some();
        if removed {
            self.delivered.notify_all();
        }
    }

    pub fn is_pending(&self, id: u64) -> bool {
        matches!(self.lock().get(&id), Some(None))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn second_begin_for_same_key_is_busy() {
        let pending = PendingTransactions::new();
        pending.begin(1).unwrap();
        assert_eq!(pending.begin(1), Err(TransportError::TransactionBusy(1)));
        // Different key is independent.
        pending.begin(2).unwrap();
    }

    #[test]
    fn response_delivered_before_wait_is_kept() {
        let pending = PendingTransactions::new();
        pending.begin(7).unwrap();
        assert!(pending.complete(7, &[1, 2, 3]));
        assert_eq!(pending.wait(7, Duration::from_millis(1)).unwrap(), vec![1, 2, 3]);
        assert!(!pending.is_pending(7));
    }

    #[test]
    fn unknown_and_duplicate_completions_are_rejected() {
        let pending = PendingTransactions::new();
        assert!(!pending.complete(9, &[]));

        pending.begin(9).unwrap();
        assert!(pending.complete(9, &[1]));
        assert!(!pending.complete(9, &[2]));
        assert_eq!(pending.wait(9, Duration::ZERO).unwrap(), vec![1]);
    }

    #[test]
    fn wait_times_out_and_frees_the_slot() {
        let pending = PendingTransactions::new();
        pending.begin(3).unwrap();
        let err = pending.wait(3, Duration::from_millis(10)).unwrap_err();
        assert!(matches!(err, TransportError::TimedOut { id: 3, .. }));

        // Slot is gone, so a late response is refused and the key can be reused.
        assert!(!pending.complete(3, &[0]));
        pending.begin(3).unwrap();
    }

    #[test]
    fn waiter_is_woken_from_another_thread() {
        let pending = Arc::new(PendingTransactions::new());
        pending.begin(5).unwrap();

        let completer = {
            let pending = Arc::clone(&pending);
            thread::spawn(move || {
                while !pending.complete(5, &[0xAB]) {
                    thread::yield_now();
                }
            })
        };

        assert_eq!(pending.wait(5, Duration::from_secs(5)).unwrap(), vec![0xAB]);
        completer.join().unwrap();
    }

    #[test]
    fn cancel_wakes_waiter() {
        let pending = Arc::new(PendingTransactions::new());
        pending.begin(4).unwrap();

        let canceller = {
            let pending = Arc::clone(&pending);
            thread::spawn(move || pending.cancel(4))
        };

        let res = pending.wait(4, Duration::from_secs(5));
        canceller.join().unwrap();
        // The cancel can land before or after the wait started; either way no response arrives.
        assert_eq!(res, Err(TransportError::Cancelled(4)));
    }
}
