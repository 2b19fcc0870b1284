//! Session operations abstraction
//!
//! [`SessionOps`] is the seam between the connection driver and the
//! transport: readiness polling plus plain read/write/close. The production
//! implementation wraps a `TcpStream` and polls its file descriptor; tests
//! drive the connection state machine with scripted in-memory sessions.

use super::Result;
use std::io::{self, Read, Write};
use std::net::TcpStream;
use std::os::fd::AsRawFd;
use std::time::Duration;

/// Which stream directions the caller wants readiness for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Interest {
    pub readable: bool,
    pub writable: bool,
}

/// Which directions are actually ready.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Readiness {
    pub readable: bool,
    pub writable: bool,
}

/// Session operations trait
pub trait SessionOps {
    /// Wait up to `timeout` for the requested readiness.
    fn poll(&self, interest: Interest, timeout: Option<Duration>) -> Result<Readiness>;

    /// Read available bytes; `Ok(0)` means the peer closed its write side.
    fn read(&mut self, buf: &mut [u8]) -> Result<usize>;

    /// Write bytes, returning how many the stream accepted.
    fn write(&mut self, buf: &[u8]) -> Result<usize>;

    /// Close the session.
    fn close(&mut self) -> Result<()>;
}

/// Plain file descriptor session over a TCP stream.
pub struct FdSessionOps {
    stream: TcpStream,
}

impl FdSessionOps {
    pub fn new(stream: TcpStream) -> Self {
        FdSessionOps { stream }
    }

    pub fn stream(&self) -> &TcpStream {
        &self.stream
    }
}

impl SessionOps for FdSessionOps {
    fn poll(&self, interest: Interest, timeout: Option<Duration>) -> Result<Readiness> {
        use libc::{poll, pollfd, POLLHUP, POLLIN, POLLOUT};

        let mut events = 0;
        if interest.readable {
            events |= POLLIN;
        }
        if interest.writable {
            events |= POLLOUT;
        }

        let mut pfd = pollfd {
            fd: self.stream.as_raw_fd(),
            events,
            revents: 0,
        };

        let timeout_ms = timeout.map(|d| d.as_millis() as i32).unwrap_or(-1);

        let result = unsafe { poll(&mut pfd as *mut pollfd, 1, timeout_ms) };
        if result < 0 {
            return Err(io::Error::last_os_error().into());
        }

        Ok(Readiness {
            // A hangup must surface as readable so the driver observes EOF.
            readable: pfd.revents & (POLLIN | POLLHUP) != 0,
            writable: pfd.revents & POLLOUT != 0,
        })
    }

    fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        Ok(self.stream.read(buf)?)
    }

    fn write(&mut self, buf: &[u8]) -> Result<usize> {
        Ok(self.stream.write(buf)?)
    }

    fn close(&mut self) -> Result<()> {
        use std::net::Shutdown;
        self.stream.shutdown(Shutdown::Both)?;
        Ok(())
    }
}
