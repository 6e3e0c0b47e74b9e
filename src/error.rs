//! # Error Handling
//!
//! Error types shared by the bridge components.
//!
//! Per-chunk and per-frame failures never reach this type: the stream workers
//! absorb them locally (retry, resync, silence). What remains are failures a
//! caller has to act on:
//! - **Registration**: the call-control service is absent or refused us (fatal at startup)
//! - **Protocol**: the bus sent something we cannot interpret
//! - **Bus**: D-Bus failures, sorted into "not there yet" and "refused" by
//!   the `From<zbus::Error>` conversion
//! - **Transform**: the codec library could not be initialised
//! - **Io / Config**: plumbing underneath all of the above

use thiserror::Error;

const ERROR_SERVICE_UNKNOWN: &str = "org.freedesktop.DBus.Error.ServiceUnknown";
const ERROR_NAME_HAS_NO_OWNER: &str = "org.freedesktop.DBus.Error.NameHasNoOwner";

#[derive(Debug, Error)]
pub enum BridgeError {
    /// Configuration file or environment variable problems
    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),

    /// The call-control service is not reachable (yet)
    #[error("Call-control service unavailable: {0}")]
    BusUnavailable(String),

    /// The call-control service refused the agent registration
    #[error("Agent registration rejected: {0}")]
    RegistrationRejected(String),

    /// A bus message could not be decoded or arrived out of order
    #[error("Bus protocol error: {0}")]
    Protocol(String),

    /// The codec transform library failed or is missing
    #[error("Codec transform error: {0}")]
    Transform(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// The telephony service not (yet) owning its name is retryable; any other
/// refused method call is a rejection.
impl From<zbus::Error> for BridgeError {
    fn from(err: zbus::Error) -> Self {
        match err {
            zbus::Error::MethodError(name, detail, _) => {
                BridgeError::from_method_error(name.as_str(), detail.as_deref())
            }
            zbus::Error::FDO(err) => match *err {
                zbus::fdo::Error::ServiceUnknown(detail) | zbus::fdo::Error::NameHasNoOwner(detail) => {
                    BridgeError::BusUnavailable(detail)
                }
                other => BridgeError::RegistrationRejected(other.to_string()),
            },
            err @ (zbus::Error::InputOutput(_) | zbus::Error::Address(_)) => {
                BridgeError::BusUnavailable(err.to_string())
            }
            other => BridgeError::Protocol(other.to_string()),
        }
    }
}

impl BridgeError {
    /// Classify a D-Bus error reply by its error name.
    pub fn from_method_error(name: &str, detail: Option<&str>) -> Self {
        let message = format!("{}: {}", name, detail.unwrap_or_default());
        match name {
            ERROR_SERVICE_UNKNOWN | ERROR_NAME_HAS_NO_OWNER => BridgeError::BusUnavailable(message),
            _ => BridgeError::RegistrationRejected(message),
        }
    }

    /// Registration should be retried on this error rather than abort startup.
    pub fn is_retryable(&self) -> bool {
        matches!(self, BridgeError::BusUnavailable(_))
    }
}

/// Shorthand for results carrying a [`BridgeError`].
pub type BridgeResult<T> = Result<T, BridgeError>;
