//! End-to-end scenarios against a mock `Connection`, covering the
//! concrete cases a real protocol layer would exercise: single and
//! double delivery, unsubscribe-all receipts, mid-fan-out write
//! failures, and shutdown cleanup.

use std::collections::VecDeque;
use std::os::unix::io::RawFd;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use fanoutd::{Connection, PubSub, PubSubConfig, ReadStatus, WriteStatus};

/// One recorded call to `construct_publish_reply`.
#[derive(Debug, Clone, PartialEq, Eq)]
struct Delivery {
    matched_key: Vec<u8>,
    channel: Vec<u8>,
    payload: Vec<u8>,
    is_pattern: bool,
}

struct MockConn {
    fd: RawFd,
    peer: String,
    is_reply: bool,
    deliveries: Arc<Mutex<Vec<Delivery>>>,
    write_results: Arc<Mutex<VecDeque<WriteStatus>>>,
}

impl MockConn {
    fn new(fd: RawFd, peer: &str) -> (Self, Arc<Mutex<Vec<Delivery>>>, Arc<Mutex<VecDeque<WriteStatus>>>) {
        let deliveries = Arc::new(Mutex::new(Vec::new()));
        let write_results = Arc::new(Mutex::new(VecDeque::new()));
        let conn = Self {
            fd,
            peer: peer.to_string(),
            is_reply: false,
            deliveries: Arc::clone(&deliveries),
            write_results: Arc::clone(&write_results),
        };
        (conn, deliveries, write_results)
    }
}

impl Connection for MockConn {
    fn fd(&self) -> RawFd {
        self.fd
    }

    fn peer(&self) -> &str {
        &self.peer
    }

    fn read_request(&mut self) -> ReadStatus {
        ReadStatus::ReadAll
    }

    fn send_reply(&mut self) -> WriteStatus {
        self.write_results
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or(WriteStatus::WriteAll)
    }

    fn construct_publish_reply(
        &mut self,
        matched_key: &[u8],
        channel: &[u8],
        payload: &[u8],
        is_pattern: bool,
    ) {
        self.deliveries.lock().unwrap().push(Delivery {
            matched_key: matched_key.to_vec(),
            channel: channel.to_vec(),
            payload: payload.to_vec(),
            is_pattern,
        });
    }

    fn is_reply(&self) -> bool {
        self.is_reply
    }

    fn set_is_reply(&mut self, pending: bool) {
        self.is_reply = pending;
    }
}

/// A real, non-blocking socket pair so the connection's fd is valid for
/// `epoll_ctl`/`poll(2)` registration. Only one end is ever handed to
/// the engine; the other is kept alive for the test's duration and
/// closed on drop.
struct FdPair {
    engine_side: RawFd,
    other_side: RawFd,
}

impl FdPair {
    fn new() -> Self {
        let mut fds = [0 as RawFd; 2];
        let rc = unsafe {
            libc::socketpair(libc::AF_UNIX, libc::SOCK_STREAM, 0, fds.as_mut_ptr())
        };
        assert_eq!(rc, 0, "socketpair failed");
        Self { engine_side: fds[0], other_side: fds[1] }
    }
}

impl Drop for FdPair {
    fn drop(&mut self) {
        unsafe {
            libc::close(self.other_side);
        }
        // engine_side is closed by the engine itself once torn down; if
        // a test exits before that happens this leaks one fd, which is
        // acceptable for a short-lived test process.
    }
}

fn new_registered(engine: &PubSub, peer: &str) -> (RawFd, FdPair, Arc<Mutex<Vec<Delivery>>>, Arc<Mutex<VecDeque<WriteStatus>>>) {
    let pair = FdPair::new();
    let fd = pair.engine_side;
    let (conn, deliveries, write_results) = MockConn::new(fd, peer);
    engine.register(Box::new(conn)).expect("register");
    (fd, pair, deliveries, write_results)
}

fn start_engine() -> PubSub {
    let engine = PubSub::new(PubSubConfig::new()).expect("engine init");
    engine.run();
    engine
}

#[test]
fn single_exact_subscriber_receives_one_message() {
    let engine = start_engine();
    let (fd_a, _pair_a, deliveries_a, _) = new_registered(&engine, "A");
    let (fd_b, _pair_b, _, _) = new_registered(&engine, "B");

    let receipts = engine.subscribe(fd_a, &[b"news".to_vec()], false);
    assert_eq!(receipts, vec![(b"news".to_vec(), 1)]);

    let count = engine.publish(fd_b, b"news".to_vec(), b"hi".to_vec());
    assert_eq!(count, 1);

    let recorded = deliveries_a.lock().unwrap();
    assert_eq!(
        recorded.as_slice(),
        &[Delivery {
            matched_key: b"news".to_vec(),
            channel: b"news".to_vec(),
            payload: b"hi".to_vec(),
            is_pattern: false,
        }]
    );

    engine.stop();
}

#[test]
fn exact_and_pattern_subscriber_both_receive() {
    let engine = start_engine();
    let (fd_a, _pair_a, deliveries_a, _) = new_registered(&engine, "A");
    let (fd_c, _pair_c, deliveries_c, _) = new_registered(&engine, "C");
    let (fd_b, _pair_b, _, _) = new_registered(&engine, "B");

    engine.subscribe(fd_a, &[b"n.*".to_vec()], true);
    engine.subscribe(fd_c, &[b"news".to_vec()], false);

    let count = engine.publish(fd_b, b"news".to_vec(), b"x".to_vec());
    assert_eq!(count, 2);

    assert!(deliveries_a.lock().unwrap()[0].is_pattern);
    assert!(!deliveries_c.lock().unwrap()[0].is_pattern);

    engine.stop();
}

#[test]
fn unsubscribe_all_emits_decreasing_receipts_and_tears_down() {
    let engine = start_engine();
    let (fd_a, _pair_a, _, _) = new_registered(&engine, "A");

    let receipts = engine.subscribe(
        fd_a,
        &[b"a".to_vec(), b"b".to_vec(), b"c".to_vec()],
        false,
    );
    assert_eq!(
        receipts,
        vec![(b"a".to_vec(), 1), (b"b".to_vec(), 2), (b"c".to_vec(), 3)]
    );

    let (unsub_receipts, total) = engine.unsubscribe(fd_a, &[], false);
    assert_eq!(
        unsub_receipts,
        vec![(b"a".to_vec(), 2), (b"b".to_vec(), 1), (b"c".to_vec(), 0)]
    );
    assert_eq!(total, 0);

    let (exact, _pattern) = engine.snapshot();
    for subs in exact.values() {
        assert!(!subs.contains(&fd_a));
    }

    engine.stop();
}

#[test]
fn write_error_tears_down_subscriber_mid_fanout() {
    let engine = start_engine();
    let (fd_a, _pair_a, _, write_results_a) = new_registered(&engine, "A");
    let (fd_b, _pair_b, _, _) = new_registered(&engine, "B");

    engine.subscribe(fd_a, &[b"ch".to_vec()], false);
    write_results_a.lock().unwrap().push_back(WriteStatus::WriteError);

    let count = engine.publish(fd_b, b"ch".to_vec(), b"x".to_vec());
    assert_eq!(count, 0);

    // Give the dispatcher a moment to finish the teardown it triggers
    // after releasing the table locks (publish only waits for the
    // ledger entry, which is posted before teardown runs).
    std::thread::sleep(Duration::from_millis(20));

    let (exact, _pattern) = engine.snapshot();
    assert!(exact.get(b"ch".as_slice()).map_or(true, |s| s.is_empty()));

    let count_again = engine.publish(fd_b, b"ch".to_vec(), b"x".to_vec());
    assert_eq!(count_again, 0);

    engine.stop();
}

#[test]
fn publish_with_no_subscribers_returns_zero() {
    let engine = start_engine();
    let (fd_b, _pair_b, _, _) = new_registered(&engine, "B");

    let count = engine.publish(fd_b, b"nobody-home".to_vec(), b"x".to_vec());
    assert_eq!(count, 0);

    engine.stop();
}

#[test]
fn unsubscribe_all_exact_leaves_patterns_intact() {
    let engine = start_engine();
    let (fd_a, _pair_a, _, _) = new_registered(&engine, "A");

    engine.subscribe(fd_a, &[b"a".to_vec(), b"b".to_vec()], false);
    engine.subscribe(fd_a, &[b"p*".to_vec()], true);

    let (_receipts, total) = engine.unsubscribe(fd_a, &[], false);
    assert_eq!(total, 1);

    let (_exact, pattern) = engine.snapshot();
    assert!(pattern.get(b"p*".as_slice()).map_or(false, |s| s.contains(&fd_a)));

    engine.stop();
}

#[test]
fn concurrent_publishers_all_complete_with_distinct_fds() {
    // publisher_fd is purely a hand-off key (spec.md §4.3) — it does not
    // need to name a registered connection, so plain integers stand in
    // for 1000 distinct publisher identities without opening any fds.
    let engine = start_engine();
    const PUBLISHERS: i32 = 1000;

    let handles: Vec<_> = (0..PUBLISHERS)
        .map(|i| {
            let engine = engine.clone();
            std::thread::spawn(move || engine.publish(i, b"busy".to_vec(), b"x".to_vec()))
        })
        .collect();

    for handle in handles {
        assert_eq!(handle.join().unwrap(), 0);
    }

    engine.stop();
}

#[test]
fn two_overlapping_patterns_deliver_twice() {
    let engine = start_engine();
    let (fd_a, _pair_a, deliveries_a, _) = new_registered(&engine, "A");
    let (fd_b, _pair_b, _, _) = new_registered(&engine, "B");

    engine.subscribe(fd_a, &[b"a*".to_vec(), b"*b".to_vec()], true);

    let count = engine.publish(fd_b, b"ab".to_vec(), b"x".to_vec());
    assert_eq!(count, 2);
    assert_eq!(deliveries_a.lock().unwrap().len(), 2);

    engine.stop();
}

#[test]
fn shutdown_closes_every_connection_once() {
    let engine = start_engine();
    let (fd_a, pair_a, _, _) = new_registered(&engine, "A");
    let (fd_b, pair_b, _, _) = new_registered(&engine, "B");
    engine.subscribe(fd_a, &[b"x".to_vec()], false);
    engine.subscribe(fd_b, &[b"x".to_vec()], false);

    engine.stop();
    std::thread::sleep(Duration::from_millis(50));

    // The engine already closed these fds during Cleanup; closing them
    // again here would be a double-close. Instead assert the fd is no
    // longer valid by checking fcntl fails with EBADF.
    for fd in [fd_a, fd_b] {
        let rc = unsafe { libc::fcntl(fd, libc::F_GETFD) };
        assert_eq!(rc, -1, "fd {fd} should have been closed by Cleanup");
    }

    // Prevent the FdPair destructors from closing the peer sides twice;
    // they only ever owned `other_side`, which is unaffected by Cleanup.
    drop(pair_a);
    drop(pair_b);
}
