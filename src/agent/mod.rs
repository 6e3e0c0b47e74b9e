//! # Agent Dispatcher
//!
//! Registers the bridge as the audio agent of the call-control service and
//! feeds its notifications, one at a time, into the [`SessionController`].
//!
//! ## Lifecycle:
//! 1. Register for the codecs the controller supports, retrying while the
//!    service is not up yet
//! 2. Dispatch `new_connection` / `release` until the service releases us,
//!    goes away, or shutdown is requested
//! 3. After a release, stop the session and register again
//!
//! Between notifications the dispatcher reaps sessions whose workers have
//! both ended on their own.

pub mod ofono;

use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

use crate::audio::CodecId;
use crate::config::AgentConfig;
use crate::error::{BridgeError, BridgeResult};
use crate::link::Link;
use crate::session::SessionController;

/// How long one wait for a bus notification may block.
pub const BUS_POLL_INTERVAL: Duration = Duration::from_secs(1);

/// A notification ready for the controller.
pub enum AgentEvent<L> {
    NewConnection { card: String, codec: CodecId, link: L },
    /// The service released the agent
    Release,
    /// The service went away without a release
    Disconnected,
}

/// The call-control service as seen by the dispatcher.
pub trait CallControl {
    type Link: Link + 'static;

    /// Register as audio agent for `codecs`.
    ///
    /// `BridgeError::BusUnavailable` means the service is not reachable and
    /// the attempt may be repeated.
    fn register(&mut self, codecs: &[CodecId]) -> BridgeResult<()>;

    /// Wait up to `timeout` for the next notification.
    fn next_event(&mut self, timeout: Duration) -> BridgeResult<Option<AgentEvent<Self::Link>>>;

    /// Withdraw the registration on the way out. Failures are only logged.
    fn unregister(&mut self) {}
}

/// Retry policy for registration.
#[derive(Debug, Clone)]
pub struct RegisterPolicy {
    pub timeout: Duration,
    pub interval: Duration,
}

impl From<&AgentConfig> for RegisterPolicy {
    fn from(config: &AgentConfig) -> Self {
        Self {
            timeout: config.register_timeout(),
            interval: config.register_retry(),
        }
    }
}

/// Why [`dispatch`] returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchOutcome {
    /// The service released us or disappeared; register again
    Released,
    Shutdown,
}

/// Register, retrying while the service is unavailable.
///
/// Returns `Ok(false)` if shutdown was requested before registration
/// succeeded.
pub fn register_with_retry<C: CallControl>(
    bus: &mut C,
    codecs: &[CodecId],
    policy: &RegisterPolicy,
    shutdown: &AtomicBool,
) -> BridgeResult<bool> {
    let started = Instant::now();
    let mut attempts = 0u32;

    loop {
        if shutdown.load(Ordering::SeqCst) {
            return Ok(false);
        }

        attempts += 1;
        match bus.register(codecs) {
            Ok(()) => {
                info!(?codecs, attempts, "Registered as audio agent");
                return Ok(true);
            }
            Err(e) if e.is_retryable() && started.elapsed() < policy.timeout => {
                debug!(attempts, error = %e, "Call-control service not available yet");
                thread::sleep(policy.interval);
            }
            Err(e) => {
                error!(attempts, error = %e, "Agent registration failed");
                return Err(e);
            }
        }
    }
}

/// Feed notifications to the controller until released or shut down.
pub fn dispatch<C: CallControl>(
    bus: &mut C,
    controller: &mut SessionController,
    shutdown: &AtomicBool,
    poll: Duration,
) -> BridgeResult<DispatchOutcome> {
    loop {
        if shutdown.load(Ordering::SeqCst) {
            return Ok(DispatchOutcome::Shutdown);
        }

        let event = match bus.next_event(poll) {
            Ok(event) => event,
            Err(BridgeError::Protocol(msg)) => {
                warn!(error = %msg, "Ignoring malformed bus message");
                None
            }
            Err(e) => return Err(e),
        };

        match event {
            Some(AgentEvent::NewConnection { card, codec, link }) => {
                info!(card, %codec, "New connection");
                if let Err(e) = controller.new_connection(&card, link, codec) {
                    warn!(card, error = %e, "Connection not taken over");
                }
            }
            Some(AgentEvent::Release) => {
                info!("Agent released by call-control service");
                controller.release();
                return Ok(DispatchOutcome::Released);
            }
            Some(AgentEvent::Disconnected) => {
                warn!("Call-control service went away");
                controller.release();
                return Ok(DispatchOutcome::Released);
            }
            None => {}
        }

        controller.reap_finished();
    }
}

/// Register and dispatch until shutdown; re-register after every release.
///
/// Errors are fatal: registration was rejected, the service stayed away past
/// the registration timeout, or the bus failed.
pub fn run<C: CallControl>(
    bus: &mut C,
    controller: &mut SessionController,
    policy: &RegisterPolicy,
    shutdown: &AtomicBool,
    poll: Duration,
) -> BridgeResult<()> {
    let codecs = controller.supported_codecs();

    loop {
        if !register_with_retry(bus, &codecs, policy, shutdown)? {
            break;
        }
        match dispatch(bus, controller, shutdown, poll)? {
            DispatchOutcome::Released => continue,
            DispatchOutcome::Shutdown => {
                bus.unregister();
                break;
            }
        }
    }

    if let Some(session) = controller.active_session() {
        info!(
            session_id = %session.id,
            card = session.card.as_str(),
            codec = %session.codec,
            rate = session.sample_rate.hz(),
            duration_seconds = session.duration_seconds(),
            "Stopping active session for shutdown"
        );
    }
    controller.release();
    info!("Agent dispatcher stopped");
    Ok(())
}
