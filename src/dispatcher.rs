//! The reactor loop and the fan-out/teardown machinery it drives.
//!
//! `Shared` is the state every thread touches: the two routing tables,
//! the connection registry, the hand-off queue/ledger, the poller, and
//! the wake-pipe. `Dispatcher` is just the loop that owns iterating it;
//! `subscribe`/`unsubscribe`/`publish` are plain methods on `Shared` so
//! worker threads can call them without going through the dispatcher at
//! all — the only thing the dispatcher thread does exclusively is the
//! loop body in `run_loop` (socket I/O and fan-out delivery).

use std::collections::HashMap;
use std::os::unix::io::RawFd;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock};

use crate::conn::{Connection, WriteStatus};
use crate::error::Result;
use crate::glob::glob_match;
use crate::handoff::{PendingQueue, ReceiverLedger};
use crate::poller::{DefaultPoller, Interest, Poller};
use crate::registry::ConnRegistry;
use crate::routing::RoutingTable;
use crate::wake::WakePipe;
use crate::PubSubConfig;

pub(crate) struct Shared {
    exact: Mutex<RoutingTable>,
    pattern: Mutex<RoutingTable>,
    registry: RwLock<ConnRegistry>,
    pending: PendingQueue,
    ledger: ReceiverLedger,
    poller: Arc<dyn Poller>,
    wake: WakePipe,
    shutdown: AtomicBool,
}

impl Shared {
    pub(crate) fn new(config: PubSubConfig) -> Result<Arc<Self>> {
        let poller: Arc<dyn Poller> = Arc::new(DefaultPoller::new()?);
        let wake = WakePipe::new()?;
        poller.add(wake.read_fd(), Interest::READ)?;
        let registry = RwLock::new(ConnRegistry::new(Arc::clone(&poller)));
        Ok(Arc::new(Self {
            exact: Mutex::new(RoutingTable::new()),
            pattern: Mutex::new(RoutingTable::new()),
            registry,
            pending: PendingQueue::new(config.pending_queue_high_water),
            ledger: ReceiverLedger::new(),
            poller,
            wake,
            shutdown: AtomicBool::new(false),
        }))
    }

    /// Hands a freshly accepted connection's ownership to the engine.
    /// Must happen before the connection's first `subscribe` call.
    pub(crate) fn register(&self, conn: Box<dyn Connection>) -> Result<()> {
        self.registry.write().unwrap().register(conn, Interest::READ)
    }

    pub(crate) fn publish(&self, publisher_fd: RawFd, channel: Vec<u8>, payload: Vec<u8>) -> usize {
        self.pending.enqueue(publisher_fd, channel, payload);
        if let Err(err) = self.wake.wake() {
            log::warn!("failed to wake dispatcher for publish: {err}");
        }
        self.ledger.await_count(publisher_fd)
    }

    pub(crate) fn subscribe(
        &self,
        fd: RawFd,
        channels: &[Vec<u8>],
        is_pattern: bool,
    ) -> Vec<(Vec<u8>, usize)> {
        {
            let registry = self.registry.read().unwrap();
            if !registry.contains(fd) {
                log::warn!("subscribe on unregistered fd {fd}");
                return Vec::new();
            }
        }

        let table = if is_pattern { &self.pattern } else { &self.exact };
        let mut receipts = Vec::with_capacity(channels.len());
        for channel in channels {
            table.lock().unwrap().subscribe(channel, fd);
            // Two separate statements: a combined expression would keep
            // both `MutexGuard` temporaries alive until the end of the
            // `let`, holding both leaf locks at once.
            let exact_count = self.exact.lock().unwrap().subscriber_count(fd);
            let pattern_count = self.pattern.lock().unwrap().subscriber_count(fd);
            receipts.push((channel.clone(), exact_count + pattern_count));
        }
        receipts
    }

    /// Returns the per-channel receipts (mirroring input order, or the
    /// previously-held set when `channels` is empty) and the
    /// connection's combined exact+pattern subscription total after the
    /// operation. The connection is torn down — removed from every
    /// structure and its fd closed — if that combined total reaches
    /// zero, regardless of which kind was just cleared.
    pub(crate) fn unsubscribe(
        &self,
        fd: RawFd,
        channels: &[Vec<u8>],
        is_pattern: bool,
    ) -> (Vec<(Vec<u8>, usize)>, usize) {
        let table = if is_pattern { &self.pattern } else { &self.exact };

        let receipts = if channels.is_empty() {
            table.lock().unwrap().unsubscribe_all(fd)
        } else {
            let mut t = table.lock().unwrap();
            channels
                .iter()
                .map(|channel| (channel.clone(), t.unsubscribe(channel, fd)))
                .collect()
        };

        let exact_count = self.exact.lock().unwrap().subscriber_count(fd);
        let pattern_count = self.pattern.lock().unwrap().subscriber_count(fd);
        let total = exact_count + pattern_count;

        if total == 0 {
            teardown_connection(self, fd);
        }

        (receipts, total)
    }

    pub(crate) fn snapshot(&self) -> (HashMap<Vec<u8>, Vec<RawFd>>, HashMap<Vec<u8>, Vec<RawFd>>) {
        let exact = self.exact.lock().unwrap().snapshot();
        let pattern = self.pattern.lock().unwrap().snapshot();
        (exact, pattern)
    }

    pub(crate) fn request_shutdown(&self) {
        self.shutdown.store(true, Ordering::Release);
        if let Err(err) = self.wake.wake() {
            log::warn!("failed to wake dispatcher for shutdown: {err}");
        }
    }
}

/// The event loop. Holds no state of its own beyond the `Arc<Shared>` —
/// it exists only so `PubSub::run` has something to spawn a thread
/// around.
pub(crate) struct Dispatcher {
    shared: Arc<Shared>,
}

impl Dispatcher {
    pub(crate) fn new(shared: Arc<Shared>) -> Self {
        Self { shared }
    }

    pub(crate) fn run_loop(&self) {
        while !self.shared.shutdown.load(Ordering::Acquire) {
            let events = match self.shared.poller.poll(None) {
                Ok(events) => events,
                Err(err) => {
                    log::error!("poll failed: {err}");
                    continue;
                }
            };
            for event in events {
                if event.fd == self.shared.wake.read_fd() {
                    self.shared.wake.drain();
                    while let Some(msg) = self.shared.pending.pop() {
                        let count = fan_out(&self.shared, &msg.channel, &msg.payload);
                        self.shared.ledger.post(msg.publisher_fd, count);
                    }
                } else {
                    service_connection(&self.shared, event);
                }
            }
        }
        cleanup(&self.shared);
    }
}

fn flush_reply(conn: &mut dyn Connection) -> WriteStatus {
    let status = conn.send_reply();
    if status == WriteStatus::WriteAll {
        conn.set_is_reply(false);
    }
    status
}

/// Delivers `payload` on `channel` to every subscriber of the exact and
/// pattern tables, returning the number of `WriteAll` deliveries.
/// Failing subscribers are collected into a side vector and torn down
/// only after both table locks have been released — the fix for the
/// iteration-invalidation hazard a connection destroyed mid-scan would
/// otherwise cause.
///
/// `registry_rwlock` is taken once, outermost, for the whole fan-out —
/// not re-acquired per subscriber inside the table-lock scopes — so its
/// nesting order never inverts against `teardown_connection`'s
/// registry-then-tables order.
fn fan_out(shared: &Shared, channel: &[u8], payload: &[u8]) -> usize {
    let mut count = 0usize;
    let mut failed = Vec::new();
    let mut registry = shared.registry.write().unwrap();

    {
        let exact = shared.exact.lock().unwrap();
        for (key, subs) in exact.iter() {
            if key != channel {
                continue;
            }
            for &fd in subs {
                deliver(&mut registry, fd, key, channel, payload, false, &mut count, &mut failed);
            }
        }
    }
    {
        let pattern = shared.pattern.lock().unwrap();
        for (key, subs) in pattern.iter() {
            if !glob_match(key, channel) {
                continue;
            }
            for &fd in subs {
                deliver(&mut registry, fd, key, channel, payload, true, &mut count, &mut failed);
            }
        }
    }

    drop(registry);
    for fd in failed {
        teardown_connection(shared, fd);
    }

    count
}

#[allow(clippy::too_many_arguments)]
fn deliver(
    registry: &mut ConnRegistry,
    fd: RawFd,
    matched_key: &[u8],
    channel: &[u8],
    payload: &[u8],
    is_pattern: bool,
    count: &mut usize,
    failed: &mut Vec<RawFd>,
) {
    let conn = match registry.get_mut(fd) {
        Some(conn) => conn,
        None => return,
    };
    conn.construct_publish_reply(matched_key, channel, payload, is_pattern);
    conn.set_is_reply(true);
    match flush_reply(conn) {
        WriteStatus::WriteAll => *count += 1,
        WriteStatus::WriteHalf => {
            let _ = registry.rearm(fd, Interest::READ_WRITE);
        }
        WriteStatus::WriteError => failed.push(fd),
    }
}

/// Services one ready subscriber descriptor (spec §4.1 Case B).
fn service_connection(shared: &Shared, event: crate::poller::Event) {
    let fd = event.fd;
    let mut registry = shared.registry.write().unwrap();

    if !registry.contains(fd) {
        registry.forget_poller(fd);
        return;
    }

    let mut close = event.error_or_hangup;

    if !close && event.writable {
        let pending = registry.get_mut(fd).map(|c| c.is_reply()).unwrap_or(false);
        if pending {
            let _ = registry.rearm(fd, Interest::READ);
            match flush_reply(registry.get_mut(fd).expect("checked above")) {
                WriteStatus::WriteAll => {}
                WriteStatus::WriteHalf => {
                    let _ = registry.rearm(fd, Interest::READ_WRITE);
                    return;
                }
                WriteStatus::WriteError => close = true,
            }
        }
    }

    if !close && event.readable {
        let status = registry.get_mut(fd).expect("checked above").read_request();
        if !status.is_recoverable() {
            close = true;
        } else {
            let pending = registry.get_mut(fd).expect("checked above").is_reply();
            if pending {
                match flush_reply(registry.get_mut(fd).expect("checked above")) {
                    WriteStatus::WriteAll => {}
                    WriteStatus::WriteHalf => {
                        let _ = registry.rearm(fd, Interest::READ_WRITE);
                    }
                    WriteStatus::WriteError => close = true,
                }
            }
        }
    }

    if close {
        drop(registry);
        teardown_connection(shared, fd);
    }
}

/// Removes `fd` from both routing tables and the registry, then closes
/// its descriptor. Safe to call from any thread — worker threads reach
/// it via `unsubscribe`, the dispatcher reaches it via fan-out failures
/// and Case B teardown. `registry_rwlock` (write) is the outermost lock
/// acquired here, around the two leaf table locks, per spec.md's lock
/// ordering discipline.
fn teardown_connection(shared: &Shared, fd: RawFd) {
    let mut registry = shared.registry.write().unwrap();
    shared.exact.lock().unwrap().remove_conn(fd);
    shared.pattern.lock().unwrap().remove_conn(fd);
    if let Some(conn) = registry.take(fd) {
        drop(registry);
        unsafe {
            libc::close(conn.fd());
        }
    }
}

fn cleanup(shared: &Shared) {
    let mut still_pending = Vec::new();
    while let Some(msg) = shared.pending.pop() {
        still_pending.push(msg.publisher_fd);
    }
    shared.ledger.release_all(&still_pending);

    let conns = shared.registry.write().unwrap().drain();
    for conn in conns {
        unsafe {
            libc::close(conn.fd());
        }
    }
}
