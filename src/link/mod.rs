//! # SCO Link Access
//!
//! The call's audio socket as seen by the bridge. The [`Link`] trait is the
//! seam between the stream engine and the kernel: [`ScoSocket`] implements it
//! over a raw descriptor handed to us by the call-control service, tests
//! implement it with scripted behaviour.
//!
//! Errors are reported as `std::io::Error` and classified by `ErrorKind`:
//! - `WouldBlock` / `Interrupted`: try again
//! - `NotConnected`: the controller has not finished routing yet
//! - `TimedOut`: the baseband connection timed out

pub mod handshake;

use nix::poll::{poll, PollFd, PollFlags, PollTimeout};
use nix::sys::socket::{self, sockopt, MsgFlags};
use std::io;
use std::os::fd::{AsFd, AsRawFd, OwnedFd, RawFd};
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::config::LinkConfig;

/// Operations the bridge needs from a call's audio link.
///
/// Shared between the handshake and both workers, so every method takes
/// `&self`. Closing is not part of the trait: the link is closed when its
/// owner drops the last reference.
pub trait Link: Send + Sync {
    /// Receive into `buf`. An empty `buf` is the deferred-accept trigger.
    fn recv(&self, buf: &mut [u8]) -> io::Result<usize>;

    /// Send one packet.
    fn send(&self, buf: &[u8]) -> io::Result<usize>;

    /// Wait until a receive would not block. `Ok(false)` on timeout.
    fn wait_readable(&self, timeout: Duration) -> io::Result<bool>;

    /// Pending socket error, if any (`SO_ERROR`).
    fn take_error(&self) -> io::Result<Option<io::Error>>;
}

/// Transient link conditions that warrant a retry instead of giving up.
pub fn is_transient(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted
    )
}

/// A connected (or deferred) SCO socket.
///
/// Owns the descriptor; dropping the socket closes it.
#[derive(Debug)]
pub struct ScoSocket {
    fd: OwnedFd,
}

impl ScoSocket {
    pub fn from_owned_fd(fd: OwnedFd) -> Self {
        Self { fd }
    }
}

impl AsRawFd for ScoSocket {
    fn as_raw_fd(&self) -> RawFd {
        self.fd.as_raw_fd()
    }
}

impl Link for ScoSocket {
    fn recv(&self, buf: &mut [u8]) -> io::Result<usize> {
        Ok(socket::recv(self.fd.as_raw_fd(), buf, MsgFlags::empty())?)
    }

    fn send(&self, buf: &[u8]) -> io::Result<usize> {
        Ok(socket::send(self.fd.as_raw_fd(), buf, MsgFlags::MSG_NOSIGNAL)?)
    }

    fn wait_readable(&self, timeout: Duration) -> io::Result<bool> {
        let millis = u16::try_from(timeout.as_millis()).unwrap_or(u16::MAX);
        let mut fds = [PollFd::new(self.fd.as_fd(), PollFlags::POLLIN)];
        if poll(&mut fds, PollTimeout::from(millis))? == 0 {
            return Ok(false);
        }
        // Errors and hangups are reported as readable so recv surfaces them
        Ok(fds[0].revents().map_or(false, |revents| {
            revents.intersects(PollFlags::POLLIN | PollFlags::POLLERR | PollFlags::POLLHUP)
        }))
    }

    fn take_error(&self) -> io::Result<Option<io::Error>> {
        let err = socket::getsockopt(&self.fd, sockopt::SocketError)?;
        Ok((err != 0).then(|| io::Error::from_raw_os_error(err)))
    }
}

impl Drop for ScoSocket {
    fn drop(&mut self) {
        debug!(fd = self.fd.as_raw_fd(), "Closing SCO link");
    }
}

/// Switch the adapter to transparent voice so mSBC frames reach us untouched.
///
/// Runs once at startup. Returns whether the setting was applied; callers
/// should not offer wideband when it was not.
pub async fn apply_voice_setting(config: &LinkConfig) -> bool {
    let Some((program, args)) = config.voice_setting_command.split_first() else {
        info!("No voice setting command configured, assuming adapter is already transparent");
        return true;
    };

    match tokio::process::Command::new(program).args(args).status().await {
        Ok(status) if status.success() => {
            info!(command = ?config.voice_setting_command, "Adapter voice setting set to transparent");
            true
        }
        Ok(status) => {
            warn!(command = ?config.voice_setting_command, %status, "Voice setting command failed");
            false
        }
        Err(e) => {
            warn!(command = ?config.voice_setting_command, error = %e, "Could not run voice setting command");
            false
        }
    }
}
