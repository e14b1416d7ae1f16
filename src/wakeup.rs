//! Wakeup channel for breaking the NAT thread out of its poll wait
//!
//! Any thread writes a single byte into a pipe whose read end sits at
//! index 0 of the poll set. A counter tracks bytes written but not yet
//! drained so the NAT thread reads no more than necessary. Extra bytes
//! are harmless; a lost byte only delays the next round until the
//! timer-clamped timeout expires.

use std::io;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::sync::atomic::{AtomicU64, Ordering};

use anyhow::{bail, Result};
use log::*;

/// Upper bound on bytes drained in one poll round.
const DRAIN_CHUNK: u64 = 1024;

pub struct WakeupChannel {
    read_fd: OwnedFd,
    write_fd: OwnedFd,
    /// Bytes written minus bytes drained.
    outstanding: AtomicU64,
}

impl WakeupChannel {
    pub fn new() -> Result<Self> {
        let mut fds = [0 as RawFd; 2];
        if unsafe { libc::pipe(fds.as_mut_ptr()) } != 0 {
            bail!(
                "failed to create wakeup pipe: {}",
                io::Error::last_os_error()
            );
        }
        let read_fd = unsafe { OwnedFd::from_raw_fd(fds[0]) };
        let write_fd = unsafe { OwnedFd::from_raw_fd(fds[1]) };
        set_nonblocking(read_fd.as_raw_fd())?;
        set_nonblocking(write_fd.as_raw_fd())?;
        Ok(Self {
            read_fd,
            write_fd,
            outstanding: AtomicU64::new(0),
        })
    }

    /// Pollable read end, bound to index 0 of the poll set.
    pub fn reader_fd(&self) -> RawFd {
        self.read_fd.as_raw_fd()
    }

    /// Writes one byte to steer the poller out of its wait.
    ///
    /// Write failures are logged and otherwise ignored; the next timer
    /// tick still advances the loop.
    pub fn notify(&self) {
        let byte = [0u8; 1];
        let written =
            unsafe { libc::write(self.write_fd.as_raw_fd(), byte.as_ptr().cast(), 1) };
        if written == 1 {
            self.outstanding.fetch_add(1, Ordering::SeqCst);
        } else {
            warn!(
                "wakeup channel write failed: {}",
                io::Error::last_os_error()
            );
        }
    }

    /// Drains up to `min(1024, outstanding)` bytes from the read end and
    /// subtracts what was actually read from the outstanding counter.
    pub fn drain(&self) {
        let pending = self.outstanding.load(Ordering::SeqCst).min(DRAIN_CHUNK);
        if pending == 0 {
            return;
        }
        let mut buf = [0u8; DRAIN_CHUNK as usize];
        let read = unsafe {
            libc::read(
                self.read_fd.as_raw_fd(),
                buf.as_mut_ptr().cast(),
                pending as usize,
            )
        };
        if read > 0 {
            self.outstanding.fetch_sub(read as u64, Ordering::SeqCst);
        }
    }

    /// Bytes written but not yet drained.
    pub fn bytes_outstanding(&self) -> u64 {
        self.outstanding.load(Ordering::SeqCst)
    }
}

fn set_nonblocking(fd: RawFd) -> Result<()> {
    let flags = unsafe { libc::fcntl(fd, libc::F_GETFL) };
    if flags < 0 || unsafe { libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK) } < 0 {
        bail!(
            "failed to configure wakeup pipe: {}",
            io::Error::last_os_error()
        );
    }
    Ok(())
}
