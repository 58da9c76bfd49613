//! The connection registry: the authoritative descriptor → connection
//! map the dispatcher polls, plus the poller registration that goes with
//! it.
//!
//! `epoll_ctl`/`poll(2)` registration calls are cheap and, on Linux, safe
//! to issue concurrently with another thread blocked in `epoll_wait` on
//! the same epoll instance — so `Poller` (see `poller.rs`) is handed out
//! as an `Arc` and is internally synchronized. `ConnRegistry` itself is
//! not: callers wrap it in a `RwLock` (spec.md's `registry_rwlock`), the
//! same lock `remove_connection` takes as its outermost lock.

use std::collections::HashMap;
use std::os::unix::io::RawFd;
use std::sync::Arc;

use crate::conn::Connection;
use crate::error::Result;
use crate::poller::{Interest, Poller};

pub struct ConnRegistry {
    conns: HashMap<RawFd, Box<dyn Connection>>,
    poller: Arc<dyn Poller>,
}

impl ConnRegistry {
    pub fn new(poller: Arc<dyn Poller>) -> Self {
        Self { conns: HashMap::new(), poller }
    }

    /// Registers a brand-new connection: arms the poller for `interest`
    /// and takes ownership of `conn`. A no-op on the poller side if the
    /// fd is already registered (re-subscribing an existing connection).
    pub fn register(&mut self, conn: Box<dyn Connection>, interest: Interest) -> Result<()> {
        let fd = conn.fd();
        let peer = conn.peer().to_string();
        let already_present = self.conns.contains_key(&fd);
        self.conns.insert(fd, conn);
        let result = if already_present {
            self.poller.modify(fd, interest)
        } else {
            self.poller.add(fd, interest)
        };
        match &result {
            Ok(()) => log::debug!(
                "admitted connection fd={fd} peer={peer} ({} registered)",
                self.len()
            ),
            Err(err) => log::error!("failed to register fd={fd} peer={peer} with poller: {err}"),
        }
        result
    }

    pub fn get_mut(&mut self, fd: RawFd) -> Option<&mut (dyn Connection + '_)> {
        self.conns.get_mut(&fd).map(|c| c.as_mut())
    }

    pub fn contains(&self, fd: RawFd) -> bool {
        self.conns.contains_key(&fd)
    }

    pub fn len(&self) -> usize {
        self.conns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.conns.is_empty()
    }

    pub fn rearm(&self, fd: RawFd, interest: Interest) -> Result<()> {
        let result = self.poller.modify(fd, interest);
        if let Err(err) = &result {
            log::warn!("failed to rearm poller interest for fd={fd}: {err}");
        }
        result
    }

    /// Removes `fd` from the registry and deregisters it from the
    /// poller, without closing the descriptor or dropping the
    /// connection's buffers beyond what `Drop` does — the caller is
    /// responsible for closing the fd (spec.md §4.5).
    pub fn take(&mut self, fd: RawFd) -> Option<Box<dyn Connection>> {
        let conn = self.conns.remove(&fd);
        if let Some(conn) = &conn {
            if let Err(err) = self.poller.delete(fd) {
                log::warn!("failed to deregister fd={fd} from poller: {err}");
            }
            log::debug!(
                "tore down connection fd={fd} peer={} ({} remaining)",
                conn.peer(),
                self.len()
            );
        }
        conn
    }

    /// Deregisters `fd` from the poller only, leaving the registry
    /// entry untouched — used for stale readiness on an fd the registry
    /// no longer knows about.
    pub fn forget_poller(&self, fd: RawFd) {
        if let Err(err) = self.poller.delete(fd) {
            log::warn!("failed to deregister stale fd={fd} from poller: {err}");
        }
    }

    /// Drains every connection out, for shutdown `Cleanup`.
    pub fn drain(&mut self) -> Vec<Box<dyn Connection>> {
        let conns: Vec<_> = self.conns.drain().map(|(_, c)| c).collect();
        log::debug!("cleanup draining {} connections", conns.len());
        for conn in &conns {
            if let Err(err) = self.poller.delete(conn.fd()) {
                log::warn!("failed to deregister fd={} from poller during cleanup: {err}", conn.fd());
            }
        }
        debug_assert!(self.is_empty(), "drain must leave the registry empty");
        conns
    }
}
