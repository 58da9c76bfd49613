//! The wake-pipe: how a publisher on a worker thread makes sure the
//! dispatcher's blocking poll returns even if no subscriber socket has
//! anything to say.

use std::os::unix::io::RawFd;

use crate::error::{Error, Result};

/// A non-blocking, close-on-exec pipe. The read end is registered with
/// the poller; the write end is poked once per `publish` call.
///
/// Multiple `publish` calls can coalesce into a single readable byte —
/// the dispatcher does not rely on one byte of wake-up per message, it
/// drains the pending queue to empty on every wake (see
/// `dispatcher.rs`).
pub struct WakePipe {
    read_fd: RawFd,
    write_fd: RawFd,
}

impl WakePipe {
    pub fn new() -> Result<Self> {
        let mut fds = [0 as RawFd; 2];
        let rc = unsafe { libc::pipe(fds.as_mut_ptr()) };
        if rc != 0 {
            return Err(Error::EngineInit("wake pipe", std::io::Error::last_os_error()));
        }
        let (read_fd, write_fd) = (fds[0], fds[1]);
        for fd in [read_fd, write_fd] {
            set_nonblocking(fd)?;
        }
        Ok(Self { read_fd, write_fd })
    }

    pub fn read_fd(&self) -> RawFd {
        self.read_fd
    }

    /// Writes exactly one byte, non-blocking. A full pipe means a wake
    /// is already scheduled, so `EAGAIN`/`EWOULDBLOCK` is not an error.
    pub fn wake(&self) -> Result<()> {
        let byte = [0u8; 1];
        let n = unsafe { libc::write(self.write_fd, byte.as_ptr() as *const _, 1) };
        if n < 0 {
            let err = std::io::Error::last_os_error();
            if err.kind() == std::io::ErrorKind::WouldBlock {
                log::debug!("wake pipe full, a wake is already pending");
                return Ok(());
            }
            return Err(Error::Io(err));
        }
        Ok(())
    }

    /// Drains whatever is currently buffered in the pipe. Readiness only
    /// guarantees at least one byte; this consumes all of them so a
    /// coalesced burst of wakes doesn't leave stale bytes for the next
    /// iteration.
    pub fn drain(&self) {
        let mut buf = [0u8; 64];
        loop {
            let n = unsafe { libc::read(self.read_fd, buf.as_mut_ptr() as *mut _, buf.len()) };
            if n <= 0 {
                break;
            }
        }
    }
}

impl Drop for WakePipe {
    fn drop(&mut self) {
        unsafe {
            libc::close(self.read_fd);
            libc::close(self.write_fd);
        }
    }
}

fn set_nonblocking(fd: RawFd) -> Result<()> {
    let flags = unsafe { libc::fcntl(fd, libc::F_GETFL) };
    if flags < 0 {
        return Err(Error::Io(std::io::Error::last_os_error()));
    }
    let rc = unsafe { libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK) };
    if rc < 0 {
        return Err(Error::Io(std::io::Error::last_os_error()));
    }
    Ok(())
}
