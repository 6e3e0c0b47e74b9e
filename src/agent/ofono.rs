//! # oFono Handsfree Audio Agent
//!
//! The bridge registers with oFono's `org.ofono.HandsfreeAudioManager` and
//! exports `org.ofono.HandsfreeAudioAgent` on the system bus. oFono hands
//! over each call's SCO socket through `NewConnection(o card, h fd, y codec)`
//! and calls `Release()` when it drops the agent.
//!
//! ## Threads:
//! - zbus runs the exported methods on its own executor thread; they only
//!   queue an [`AgentEvent`]
//! - a watcher thread turns oFono leaving the bus into `Disconnected`
//! - the dispatcher drains the queue through [`CallControl::next_event`] and
//!   is the only thread touching the session controller

use std::os::fd::OwnedFd;
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::thread;
use std::time::Duration;
use tracing::{debug, info, warn};
use zbus::blocking::{connection, fdo::DBusProxy, Connection, Proxy};
use zbus::zvariant::{self, ObjectPath, OwnedObjectPath};

use super::{AgentEvent, CallControl};
use crate::audio::CodecId;
use crate::config::AgentConfig;
use crate::error::{BridgeError, BridgeResult};
use crate::link::ScoSocket;

/// Interface the agent registers with, on oFono's root object.
pub const MANAGER_INTERFACE: &str = "org.ofono.HandsfreeAudioManager";

type EventSender = Sender<AgentEvent<ScoSocket>>;

/// The exported agent object.
pub struct AudioAgent {
    events: EventSender,
}

#[zbus::interface(name = "org.ofono.HandsfreeAudioAgent")]
impl AudioAgent {
    /// A call's audio socket. Dropping `fd` on any error closes it.
    fn new_connection(
        &self,
        card: OwnedObjectPath,
        fd: zvariant::OwnedFd,
        codec: u8,
    ) -> zbus::fdo::Result<()> {
        let codec = CodecId::try_from(codec).map_err(zbus::fdo::Error::InvalidArgs)?;
        debug!(card = card.as_str(), %codec, "NewConnection from oFono");

        let event = AgentEvent::NewConnection {
            card: card.as_str().to_string(),
            codec,
            link: ScoSocket::from_owned_fd(OwnedFd::from(fd)),
        };
        self.events
            .send(event)
            .map_err(|_| zbus::fdo::Error::Failed("agent is shutting down".to_string()))
    }

    fn release(&self) {
        debug!("Release from oFono");
        if self.events.send(AgentEvent::Release).is_err() {
            debug!("Release arrived after the dispatcher stopped");
        }
    }
}

/// [`CallControl`] over the system bus.
///
/// ## Fields:
/// - **service** / **agent_path**: from [`AgentConfig`]
/// - **connection**: opened on the first registration and kept for the
///   life of the process, so the agent object stays exported between calls
/// - **sender** / **events**: queue from the exported object to the dispatcher
pub struct OfonoClient {
    service: String,
    agent_path: String,
    connection: Option<Connection>,
    sender: EventSender,
    events: Receiver<AgentEvent<ScoSocket>>,
}

impl OfonoClient {
    pub fn new(config: &AgentConfig) -> Self {
        let (sender, events) = mpsc::channel();
        Self {
            service: config.service.clone(),
            agent_path: config.agent_path.clone(),
            connection: None,
            sender,
            events,
        }
    }

    /// Connect to the system bus, export the agent and watch the service.
    fn connect(&self) -> BridgeResult<Connection> {
        let agent = AudioAgent {
            events: self.sender.clone(),
        };
        let conn = connection::Builder::system()
            .and_then(|builder| builder.serve_at(self.agent_path.as_str(), agent))
            .and_then(|builder| builder.build())
            .map_err(|e| BridgeError::BusUnavailable(format!("system bus: {}", e)))?;

        watch_service(&conn, &self.service, self.sender.clone())?;
        info!(path = %self.agent_path, "Audio agent exported on the system bus");
        Ok(conn)
    }

    fn agent_object_path(&self) -> BridgeResult<ObjectPath<'_>> {
        ObjectPath::try_from(self.agent_path.as_str())
            .map_err(|e| BridgeError::Protocol(format!("invalid agent path {}: {}", self.agent_path, e)))
    }

    fn manager<'a>(&'a self, conn: &Connection) -> BridgeResult<Proxy<'a>> {
        Proxy::new(conn, self.service.as_str(), "/", MANAGER_INTERFACE).map_err(BridgeError::from)
    }
}

impl CallControl for OfonoClient {
    type Link = ScoSocket;

    fn register(&mut self, codecs: &[CodecId]) -> BridgeResult<()> {
        // Anything queued before this registration belongs to the last one
        while self.events.try_recv().is_ok() {}

        let conn = match self.connection.take() {
            Some(conn) => conn,
            None => self.connect()?,
        };

        let codecs: Vec<u8> = codecs.iter().map(|&codec| u8::from(codec)).collect();
        let result = self.agent_object_path().and_then(|path| {
            self.manager(&conn)?
                .call::<_, _, ()>("Register", &(path, codecs))
                .map_err(BridgeError::from)
        });

        self.connection = Some(conn);
        result
    }

    fn next_event(&mut self, timeout: Duration) -> BridgeResult<Option<AgentEvent<ScoSocket>>> {
        match self.events.recv_timeout(timeout) {
            Ok(event) => Ok(Some(event)),
            Err(RecvTimeoutError::Timeout) => Ok(None),
            Err(RecvTimeoutError::Disconnected) => {
                Err(BridgeError::BusUnavailable("agent event queue closed".to_string()))
            }
        }
    }

    fn unregister(&mut self) {
        let Some(conn) = self.connection.as_ref() else {
            return;
        };
        let result = self.agent_object_path().and_then(|path| {
            self.manager(conn)?
                .call::<_, _, ()>("Unregister", &(path,))
                .map_err(BridgeError::from)
        });
        match result {
            Ok(()) => info!("Audio agent unregistered"),
            Err(e) => debug!(error = %e, "Unregister failed"),
        }
    }
}

/// Queue `Disconnected` whenever `service` loses its bus name.
fn watch_service(conn: &Connection, service: &str, events: EventSender) -> BridgeResult<()> {
    let dbus = DBusProxy::new(conn).map_err(BridgeError::from)?;
    let changes = dbus
        .receive_name_owner_changed_with_args(&[(0, service)])
        .map_err(BridgeError::from)?;

    thread::Builder::new()
        .name("ofono-watch".to_string())
        .spawn(move || {
            for signal in changes {
                let vanished = signal
                    .args()
                    .map(|args| args.new_owner().is_none())
                    .unwrap_or(false);
                if !vanished {
                    continue;
                }
                warn!("oFono left the system bus");
                if events.send(AgentEvent::Disconnected).is_err() {
                    break;
                }
            }
        })?;
    Ok(())
}
