//! A publish/subscribe dispatch engine for line-oriented server
//! frameworks.
//!
//! `PubSub` owns a dedicated I/O thread that multiplexes client
//! connections against an exact-channel routing table and a
//! glob-pattern routing table, and delivers publisher-supplied messages
//! to every matching subscriber. A publish call blocks its caller until
//! the dispatcher has finished fanning the message out and returns the
//! number of subscribers that actually received it.
//!
//! Protocol parsing, reply-buffer construction, and the accept loop
//! that produces [`Connection`] objects are external collaborators —
//! see the [`conn`] module for the contract this crate expects of them.

pub mod conn;
pub mod error;
pub mod glob;

mod dispatcher;
mod handoff;
mod poller;
mod registry;
mod routing;
mod wake;

pub use conn::{Connection, ReadStatus, WriteStatus};
pub use error::{Error, Result};
pub use glob::glob_match;

use std::collections::HashMap;
use std::os::unix::io::RawFd;
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use dispatcher::{Dispatcher, Shared};

/// Construction-time configuration. Most tunables the original source
/// hard-codes (buffer sizes, initial poller capacity) are either fixed
/// or grow on demand here, so there's only one knob so far — kept as a
/// struct rather than a bare `new()` so later additions don't become a
/// breaking API change.
#[derive(Debug, Clone)]
pub struct PubSubConfig {
    /// Logs a warning the first time the pending-publish queue holds
    /// more than this many distinct in-flight publishers at once. Purely
    /// observational — the queue itself has no capacity limit.
    pub pending_queue_high_water: usize,
}

impl Default for PubSubConfig {
    fn default() -> Self {
        Self { pending_queue_high_water: 1024 }
    }
}

impl PubSubConfig {
    pub fn new() -> Self {
        Self::default()
    }
}

/// The engine's public handle. Cheap to clone (it's a thin `Arc`
/// wrapper) — every clone shares the same routing tables, registry, and
/// dispatcher thread.
#[derive(Clone)]
pub struct PubSub {
    shared: Arc<Shared>,
}

impl PubSub {
    /// Allocates the engine: creates the wake-pipe (both ends
    /// non-blocking) and registers its read end with the poller. Does
    /// not start the dispatcher thread — call [`PubSub::run`] for that.
    pub fn new(config: PubSubConfig) -> Result<Self> {
        Ok(Self { shared: Shared::new(config)? })
    }

    /// Hands ownership of a freshly accepted connection to the engine.
    /// Must be called before the connection's first `subscribe`.
    pub fn register(&self, conn: Box<dyn Connection>) -> Result<()> {
        self.shared.register(conn)
    }

    /// Publishes `payload` on `channel` as `publisher_fd`, blocking
    /// until the dispatcher has fanned it out to every matching
    /// subscriber. Returns the number of subscribers that received a
    /// `WriteAll`.
    ///
    /// `publisher_fd` is only ever used as a hand-off key — it need not
    /// itself be a subscriber, but it must be unique and stable for the
    /// duration of this call (ordinarily the publishing connection's own
    /// fd).
    pub fn publish(&self, publisher_fd: RawFd, channel: Vec<u8>, payload: Vec<u8>) -> usize {
        self.shared.publish(publisher_fd, channel, payload)
    }

    /// Subscribes `fd` — which must already be registered — to each of
    /// `channels`, exact or glob-pattern depending on `is_pattern`.
    /// Returns one `(channel, total_subscriptions)` receipt per input
    /// channel, in input order, where the count is the connection's
    /// combined exact+pattern subscription total after that channel's
    /// addition.
    pub fn subscribe(
        &self,
        fd: RawFd,
        channels: &[Vec<u8>],
        is_pattern: bool,
    ) -> Vec<(Vec<u8>, usize)> {
        self.shared.subscribe(fd, channels, is_pattern)
    }

    /// Unsubscribes `fd` from `channels` (or, if empty, from every
    /// channel/pattern of the requested kind). Returns the per-channel
    /// receipts and the connection's combined exact+pattern subscription
    /// total afterward. If that total reaches zero the connection is
    /// torn down: removed from every structure and its descriptor
    /// closed.
    pub fn unsubscribe(
        &self,
        fd: RawFd,
        channels: &[Vec<u8>],
        is_pattern: bool,
    ) -> (Vec<(Vec<u8>, usize)>, usize) {
        self.shared.unsubscribe(fd, channels, is_pattern)
    }

    /// A point-in-time copy of the exact and pattern routing tables, for
    /// introspection (e.g. a `PUBSUB CHANNELS`-style admin command).
    pub fn snapshot(&self) -> (HashMap<Vec<u8>, Vec<RawFd>>, HashMap<Vec<u8>, Vec<RawFd>>) {
        self.shared.snapshot()
    }

    /// Spawns the dispatcher thread and returns a handle to join it.
    /// Call [`PubSub::stop`] to request shutdown; the returned handle's
    /// `join` completes once Cleanup has closed every registered fd.
    pub fn run(&self) -> JoinHandle<()> {
        let shared = Arc::clone(&self.shared);
        thread::Builder::new()
            .name("pubsub-dispatcher".into())
            .spawn(move || Dispatcher::new(shared).run_loop())
            .expect("failed to spawn dispatcher thread")
    }

    /// Signals the dispatcher thread to exit after its current
    /// iteration and wakes it so the signal is observed promptly even
    /// while it is blocked in the poller.
    pub fn stop(&self) {
        self.shared.request_shutdown()
    }
}
