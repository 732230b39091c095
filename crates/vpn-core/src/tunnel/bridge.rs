//! The external-TUN-factory socket pair.
//!
//! The legacy tunnel library expects to create and own its own TUN
//! device. To keep this core's single-captured-TUN architecture intact,
//! bring-up instead hands the library one end of a connected,
//! message-boundary-preserving socket pair (`SOCK_SEQPACKET`) and has it
//! poll that as if it were a TUN. `app_fd` stays with this core as the
//! client's submit/receive surface; `lib_fd` goes to the library driver.
//!
//! `app_fd`/`lib_fd` are distinct owned handles, each polled from its own
//! task, so the type system expresses the bridge's ownership split: only
//! the legacy client ever touches `app_fd`, and only the spawned library
//! driver task ever touches `lib_fd`.

use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};

use tokio::io::unix::AsyncFd;
use tokio::io::Interest;

use crate::error::CoreError;

/// One side of the bridge: a `SOCK_SEQPACKET` unix socket wrapped in
/// `AsyncFd` so tokio can drive readiness without an extra runtime
/// dependency for a socket kind `tokio::net` doesn't expose directly.
pub struct BridgeEnd {
    fd: AsyncFd<OwnedFd>,
}

impl BridgeEnd {
    fn new(fd: OwnedFd) -> std::io::Result<Self> {
        Ok(Self {
            fd: AsyncFd::with_interest(fd, Interest::READABLE | Interest::WRITABLE)?,
        })
    }

    /// One write equals one packet (`SOCK_SEQPACKET` message boundary).
    /// On `EAGAIN` the write is retried after the socket becomes
    /// writable again, matching the bridge's re-queue-and-retry contract.
    pub async fn send(&self, packet: &[u8]) -> std::io::Result<()> {
        loop {
            let mut guard = self.fd.writable().await?;
            let result = guard.try_io(|fd| {
                // SAFETY: `fd` is a valid, open socket for the duration of this call.
                let rc = unsafe {
                    libc::send(
                        fd.as_raw_fd(),
                        packet.as_ptr() as *const libc::c_void,
                        packet.len(),
                        0,
                    )
                };
                if rc < 0 {
                    Err(std::io::Error::last_os_error())
                } else {
                    Ok(())
                }
            });
            match result {
                Ok(inner) => return inner,
                Err(_would_block) => continue,
            }
        }
    }

    /// Reads exactly one message into `buf`, returning its length.
    pub async fn recv(&self, buf: &mut [u8]) -> std::io::Result<usize> {
        loop {
            let mut guard = self.fd.readable().await?;
            let result = guard.try_io(|fd| {
                // SAFETY: `buf` is valid for `buf.len()` bytes for the duration of this call.
                let rc = unsafe {
                    libc::recv(
                        fd.as_raw_fd(),
                        buf.as_mut_ptr() as *mut libc::c_void,
                        buf.len(),
                        0,
                    )
                };
                if rc < 0 {
                    Err(std::io::Error::last_os_error())
                } else {
                    Ok(rc as usize)
                }
            });
            match result {
                Ok(inner) => return inner,
                Err(_would_block) => continue,
            }
        }
    }

    pub fn raw_fd(&self) -> RawFd {
        self.fd.get_ref().as_raw_fd()
    }
}

/// Creates a connected `SOCK_SEQPACKET` pair, yielding `(app_fd, lib_fd)`.
pub fn create_pair() -> Result<(BridgeEnd, BridgeEnd), CoreError> {
    let (a, b) = raw_socketpair()?;
    let app = BridgeEnd::new(a)?;
    let lib = BridgeEnd::new(b)?;
    Ok((app, lib))
}

fn raw_socketpair() -> std::io::Result<(OwnedFd, OwnedFd)> {
    let mut fds: [libc::c_int; 2] = [0, 0];
    // SAFETY: `fds` is a valid two-element buffer for `socketpair` to
    // write the resulting file descriptors into.
    let rc = unsafe { libc::socketpair(libc::AF_UNIX, libc::SOCK_SEQPACKET, 0, fds.as_mut_ptr()) };
    if rc != 0 {
        return Err(std::io::Error::last_os_error());
    }
    // SAFETY: `socketpair` returned success, so both descriptors are
    // open and uniquely owned by this call; nothing else holds them.
    let a = unsafe { OwnedFd::from_raw_fd(fds[0]) };
    let b = unsafe { OwnedFd::from_raw_fd(fds[1]) };
    Ok((a, b))
}
