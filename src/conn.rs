//! The outbound contract the engine expects from a client connection.
//!
//! Everything in this module is a collaborator, not something this crate
//! implements: protocol parsing, request framing, and reply-buffer
//! construction belong to the surrounding server framework. The
//! dispatcher only ever calls these methods from its own thread (see the
//! concurrency notes in `dispatcher.rs`).

use std::os::unix::io::RawFd;

/// Outcome of a read attempt on a connection's socket.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadStatus {
    /// The full request was read and, if applicable, dispatched.
    ReadAll,
    /// A partial request was read; more bytes are needed.
    ReadHalf,
    /// The underlying read() failed.
    ReadError,
    /// The peer closed the connection.
    ReadClose,
    /// The read buffer is full and the request still hasn't terminated.
    FullError,
    /// The bytes read do not parse as a valid request.
    ParseError,
    /// The request parsed but the connection could not act on it.
    DealError,
}

impl ReadStatus {
    /// `true` for the two statuses that keep the connection alive.
    pub fn is_recoverable(self) -> bool {
        matches!(self, ReadStatus::ReadAll | ReadStatus::ReadHalf)
    }
}

/// Outcome of a write attempt on a connection's socket.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteStatus {
    /// The entire pending reply was written.
    WriteAll,
    /// Only part of the reply was written; the socket is backpressured.
    WriteHalf,
    /// The underlying write() failed.
    WriteError,
}

/// A single client connection, owned exclusively by the engine's
/// connection registry once it has been handed over via `subscribe`.
///
/// No entry point callable from worker threads (`subscribe`,
/// `unsubscribe`, `publish`) ever calls a method on this trait — all
/// socket I/O is confined to the dispatcher thread. `Sync` is required
/// even so: the registry sits behind a `RwLock`, and `RwLock<T>: Sync`
/// needs `T: Sync`, not just `Send`, for `Arc<Shared>` itself to be
/// `Send` into the dispatcher thread.
pub trait Connection: Send + Sync {
    /// The connection's file descriptor. Stable for the connection's
    /// lifetime; it is the only key used to look the connection up in
    /// the registry.
    fn fd(&self) -> RawFd;

    /// The peer's address. Used by the registry's admission/teardown
    /// log lines; otherwise opaque to the engine.
    fn peer(&self) -> &str;

    /// Reads and parses one request from the socket, if possible.
    fn read_request(&mut self) -> ReadStatus;

    /// Flushes whatever reply bytes are currently buffered.
    fn send_reply(&mut self) -> WriteStatus;

    /// Prepares the bytes of a publish notification for the next
    /// `send_reply`. `matched_key` is the channel name for an exact
    /// subscription, or the pattern text for a pattern subscription.
    fn construct_publish_reply(
        &mut self,
        matched_key: &[u8],
        channel: &[u8],
        payload: &[u8],
        is_pattern: bool,
    );

    /// Whether a reply is currently buffered and needs `send_reply`.
    fn is_reply(&self) -> bool;

    /// Marks whether a reply is pending.
    fn set_is_reply(&mut self, pending: bool);
}
