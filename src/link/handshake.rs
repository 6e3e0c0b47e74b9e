//! # Link Handshake
//!
//! Moves a freshly delivered SCO socket from the kernel's deferred-accept
//! state to a state where audio flows:
//!
//! 1. **Accept trigger**: a zero-length receive releases the deferred accept
//! 2. **Routing kickstart**: some controllers only start forwarding SCO data
//!    to the host after the host has tried to write
//! 3. **Settle**: the HCI connection-complete event races with the above
//! 4. **Health check**: read the pending socket error for the log
//!
//! Nothing here fails the session. The receive worker's own retry policy copes
//! with a link that is still coming up.

use std::io;
use std::thread;
use std::time::Duration;
use tracing::{debug, info, warn};

use super::Link;

/// What the accept trigger observed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AcceptOutcome {
    /// Zero bytes: the deferred accept fired, the connection is being set up
    Triggered,
    /// Data was already waiting on the link
    DataPending(usize),
    /// The receive failed; the handshake carried on regardless
    Failed(io::ErrorKind),
}

/// Summary of one handshake, logged by the session controller.
#[derive(Debug, Clone)]
pub struct HandshakeReport {
    pub accept: AcceptOutcome,
    /// Kickstart writes issued (1..=attempts)
    pub kickstart_writes: u32,
    /// Whether one of the kickstart writes went through
    pub kickstart_delivered: bool,
    /// Pending socket error after settling, if any
    pub pending_error: Option<String>,
}

/// Handshake parameters.
#[derive(Debug, Clone)]
pub struct HandshakeSettings {
    pub kickstart_attempts: u32,
    /// Size of the zero-filled kickstart packet
    pub kickstart_len: usize,
    pub settle_delay: Duration,
}

/// Run the four handshake steps against `link`.
pub fn perform(link: &dyn Link, settings: &HandshakeSettings) -> HandshakeReport {
    let accept = trigger_accept(link);
    let (kickstart_writes, kickstart_delivered) = kickstart(link, settings);

    if !settings.settle_delay.is_zero() {
        thread::sleep(settings.settle_delay);
    }

    let pending_error = match link.take_error() {
        Ok(None) => None,
        Ok(Some(e)) => {
            warn!(error = %e, "Link reports a pending error after handshake");
            Some(e.to_string())
        }
        Err(e) => {
            warn!(error = %e, "Could not query link error state");
            Some(e.to_string())
        }
    };

    let report = HandshakeReport {
        accept,
        kickstart_writes,
        kickstart_delivered,
        pending_error,
    };
    debug!(?report, "Link handshake finished");
    report
}

fn trigger_accept(link: &dyn Link) -> AcceptOutcome {
    match link.recv(&mut []) {
        Ok(0) => {
            debug!("Deferred accept triggered, connection is being established");
            AcceptOutcome::Triggered
        }
        Ok(n) => {
            debug!(bytes = n, "Data already available on link");
            AcceptOutcome::DataPending(n)
        }
        Err(e) => {
            warn!(error = %e, "Accept trigger failed, continuing");
            AcceptOutcome::Failed(e.kind())
        }
    }
}

/// Returns (writes issued, delivered).
fn kickstart(link: &dyn Link, settings: &HandshakeSettings) -> (u32, bool) {
    let zeros = vec![0u8; settings.kickstart_len];
    let mut writes = 0;

    for attempt in 1..=settings.kickstart_attempts {
        writes = attempt;
        match link.send(&zeros) {
            Ok(_) => {
                debug!(attempt, "Kickstart write delivered");
                return (writes, true);
            }
            Err(e) if e.kind() == io::ErrorKind::NotConnected => {
                debug!(attempt, "Kickstart write: not connected yet");
            }
            Err(e) => {
                warn!(attempt, error = %e, "Kickstart write failed, giving up on kickstart");
                break;
            }
        }
    }

    (writes, false)
}
