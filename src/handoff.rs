//! Cross-thread publish hand-off: the pending-message queue a publisher
//! drops its message into, and the receiver ledger the Dispatcher posts
//! the recipient count back through.
//!
//! This matches spec.md's `msg_mtx`/`receiver_mtx` lock table; the
//! queue's `msg_mtx` is never held simultaneously with the receiver
//! lock or a routing-table lock. The "msg condition" in that table is
//! realized by the wake-pipe rather than a second `Condvar` here — the
//! dispatcher's single blocking wait point is the poller, not this
//! queue, so nothing ever calls `Condvar::wait` on new work arriving.

use std::collections::HashMap;
use std::os::unix::io::RawFd;
use std::sync::{Condvar, Mutex};

/// One fan-out job: a publisher's channel + payload, keyed by the
/// publisher's own fd so a publisher can never have two jobs in flight
/// (spec.md §4.3 — the caller must own the fd for the call's duration).
pub struct PendingMessage {
    pub publisher_fd: RawFd,
    pub channel: Vec<u8>,
    pub payload: Vec<u8>,
}

/// FIFO-by-insertion queue of pending publishes. `enqueue` overwrites any
/// existing entry for the same `publisher_fd` rather than appending a
/// second one — per spec.md's invariant that a publisher_fd appears at
/// most once at any instant.
pub struct PendingQueue {
    state: Mutex<PendingState>,
    high_water: usize,
}

#[derive(Default)]
struct PendingState {
    order: Vec<RawFd>,
    by_fd: HashMap<RawFd, (Vec<u8>, Vec<u8>)>,
}

impl PendingQueue {
    pub fn new(high_water: usize) -> Self {
        Self { state: Mutex::new(PendingState::default()), high_water }
    }

    /// Inserts or overwrites the pending job for `publisher_fd`.
    pub fn enqueue(&self, publisher_fd: RawFd, channel: Vec<u8>, payload: Vec<u8>) {
        let mut state = self.state.lock().unwrap();
        if state.by_fd.insert(publisher_fd, (channel, payload)).is_none() {
            state.order.push(publisher_fd);
        }
        if state.order.len() > self.high_water {
            log::warn!(
                "pending publish queue holds {} in-flight publishers, above the {} high-water mark",
                state.order.len(),
                self.high_water
            );
        }
    }

    /// Pops the oldest pending job, if any, in FIFO order.
    pub fn pop(&self) -> Option<PendingMessage> {
        let mut state = self.state.lock().unwrap();
        while !state.order.is_empty() {
            let fd = state.order.remove(0);
            if let Some((channel, payload)) = state.by_fd.remove(&fd) {
                return Some(PendingMessage { publisher_fd: fd, channel, payload });
            }
            // fd was already drained by a racing pop under a reused slot;
            // keep scanning rather than returning a phantom entry.
        }
        None
    }

    #[cfg(test)]
    pub fn is_empty(&self) -> bool {
        self.state.lock().unwrap().order.is_empty()
    }
}

/// Where the Dispatcher posts a publish's recipient count, and where the
/// blocked publisher picks it up. Keyed by publisher_fd, same as the
/// queue above.
#[derive(Default)]
pub struct ReceiverLedger {
    state: Mutex<HashMap<RawFd, usize>>,
    cond: Condvar,
}

impl ReceiverLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Posts `count` for `publisher_fd` and wakes every waiter. Called
    /// only by the Dispatcher thread, after fan-out completes.
    pub fn post(&self, publisher_fd: RawFd, count: usize) {
        let mut state = self.state.lock().unwrap();
        state.insert(publisher_fd, count);
        self.cond.notify_all();
    }

    /// Blocks until `publisher_fd`'s count has been posted, then removes
    /// and returns it. Called by the publishing thread.
    pub fn await_count(&self, publisher_fd: RawFd) -> usize {
        let mut state = self.state.lock().unwrap();
        loop {
            if let Some(count) = state.remove(&publisher_fd) {
                return count;
            }
            state = self.cond.wait(state).unwrap();
        }
    }

    /// Wakes every blocked publisher without posting a real count, used
    /// by shutdown to release anyone mid-`publish` rather than leaving
    /// them parked forever. Posts `0` for every fd a caller names.
    pub fn release_all(&self, publisher_fds: &[RawFd]) {
        let mut state = self.state.lock().unwrap();
        for &fd in publisher_fds {
            state.entry(fd).or_insert(0);
        }
        self.cond.notify_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn enqueue_overwrites_same_publisher() {
        let q = PendingQueue::new(1024);
        q.enqueue(1, b"a".to_vec(), b"first".to_vec());
        q.enqueue(1, b"a".to_vec(), b"second".to_vec());
        let msg = q.pop().expect("one job");
        assert_eq!(msg.payload, b"second");
        assert!(q.is_empty());
    }

    #[test]
    fn pop_is_fifo_across_publishers() {
        let q = PendingQueue::new(1024);
        q.enqueue(1, b"a".to_vec(), b"one".to_vec());
        q.enqueue(2, b"b".to_vec(), b"two".to_vec());
        assert_eq!(q.pop().unwrap().publisher_fd, 1);
        assert_eq!(q.pop().unwrap().publisher_fd, 2);
        assert!(q.pop().is_none());
    }

    #[test]
    fn ledger_round_trip() {
        let ledger = ReceiverLedger::new();
        ledger.post(7, 3);
        assert_eq!(ledger.await_count(7), 3);
    }

    #[test]
    fn ledger_blocks_until_posted() {
        use std::sync::Arc;
        use std::thread;
        use std::time::Duration;

        let ledger = Arc::new(ReceiverLedger::new());
        let waiter = {
            let ledger = Arc::clone(&ledger);
            thread::spawn(move || ledger.await_count(42))
        };
        thread::sleep(Duration::from_millis(20));
        ledger.post(42, 9);
        assert_eq!(waiter.join().unwrap(), 9);
    }
}
