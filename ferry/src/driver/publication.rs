//! Driver-side publications.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};

use crate::channel::{ChannelIdentity, ChannelUri, ControlMode};
use crate::driver::commands::ClientId;
use crate::net::Endpoint;

/// A client's handle on a driver publication.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Owner {
    pub client: ClientId,
    pub registration_id: i64,
}

/// A destination added to a `control-mode=manual` publication.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Destination {
    pub registration_id: i64,
    pub endpoint: Endpoint,
}

/// Where a network publication sends to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Target {
    /// A unicast endpoint, optionally one added as a manual destination.
    Endpoint {
        endpoint: Endpoint,
        destination: Option<i64>,
    },
    /// Any receiver that names this control address.
    Control(Endpoint),
}

impl Target {
    /// Whether a receiving channel is reached by this target.
    #[must_use]
    pub fn accepts(&self, channel: &ChannelIdentity) -> bool {
        match *self {
            Self::Endpoint { endpoint, .. } => {
                channel.endpoint == Some(endpoint) && channel.control.is_none()
            }
            Self::Control(control) => channel.control == Some(control),
        }
    }

    #[must_use]
    pub const fn destination(&self) -> Option<i64> {
        match *self {
            Self::Endpoint { destination, .. } => destination,
            Self::Control(_) => None,
        }
    }
}

/// State shared by network and IPC publications.
#[derive(Debug)]
pub struct PublicationCore {
    /// Registration id of the first add; shared publications keep it.
    pub registration_id: i64,
    pub session_id: i32,
    pub stream_id: i32,
    pub exclusive: bool,
    pub position: Arc<AtomicI64>,
    pub connected: Arc<AtomicBool>,
    pub owners: Vec<Owner>,
}

impl PublicationCore {
    #[must_use]
    pub fn new(registration_id: i64, session_id: i32, stream_id: i32, exclusive: bool) -> Self {
        Self {
            registration_id,
            session_id,
            stream_id,
            exclusive,
            position: Arc::new(AtomicI64::new(0)),
            connected: Arc::new(AtomicBool::new(false)),
            owners: Vec::new(),
        }
    }

    #[must_use]
    pub fn position(&self) -> i64 {
        self.position.load(Ordering::Acquire)
    }

    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Acquire)
    }

    pub fn set_connected(&self, connected: bool) {
        self.connected.store(connected, Ordering::Release);
    }

    /// Drops the owner with `registration_id`. Returns `true` if found.
    pub fn remove_owner(&mut self, registration_id: i64) -> bool {
        let before = self.owners.len();
        self.owners.retain(|o| o.registration_id != registration_id);
        before != self.owners.len()
    }

    /// Drops every owner belonging to `client`.
    pub fn remove_client(&mut self, client: ClientId) {
        self.owners.retain(|o| o.client != client);
    }
}

#[derive(Debug)]
pub struct NetworkPublication {
    pub core: PublicationCore,
    pub channel: ChannelUri,
    pub destinations: Vec<Destination>,
}

impl NetworkPublication {
    #[must_use]
    pub fn new(core: PublicationCore, channel: ChannelUri) -> Self {
        Self {
            core,
            channel,
            destinations: Vec::new(),
        }
    }

    #[must_use]
    pub fn is_manual(&self) -> bool {
        self.channel.control_mode() == Some(ControlMode::Manual)
    }

    /// Everything this publication currently sends to.
    #[must_use]
    pub fn targets(&self) -> Vec<Target> {
        match self.channel.control_mode() {
            Some(ControlMode::Manual) => self
                .destinations
                .iter()
                .map(|d| Target::Endpoint {
                    endpoint: d.endpoint,
                    destination: Some(d.registration_id),
                })
                .collect(),
            Some(ControlMode::Dynamic) => self.channel.control().map(Target::Control).into_iter().collect(),
            None => self
                .channel
                .endpoint()
                .map(|endpoint| Target::Endpoint {
                    endpoint,
                    destination: None,
                })
                .into_iter()
                .collect(),
        }
    }

    /// The target reaching `channel`, if any.
    #[must_use]
    pub fn target_for(&self, channel: &ChannelIdentity) -> Option<Target> {
        self.targets().into_iter().find(|t| t.accepts(channel))
    }

    pub fn remove_destination(&mut self, registration_id: i64) -> Option<Destination> {
        let idx = self
            .destinations
            .iter()
            .position(|d| d.registration_id == registration_id)?;
        Some(self.destinations.remove(idx))
    }
}

#[derive(Debug)]
pub struct IpcPublication {
    pub core: PublicationCore,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn publication(channel: &str) -> NetworkPublication {
        NetworkPublication::new(
            PublicationCore::new(1, 100, 10, false),
            ChannelUri::parse(channel).unwrap(),
        )
    }

    fn identity(channel: &str) -> ChannelIdentity {
        ChannelUri::parse(channel).unwrap().identity()
    }

    #[test]
    fn unicast_reaches_matching_endpoint_only() {
        let publication = publication("ferry:udp?endpoint=localhost:10000");
        assert!(publication.target_for(&identity("ferry:udp?endpoint=localhost:10000")).is_some());
        assert!(publication.target_for(&identity("ferry:udp?endpoint=localhost:10001")).is_none());
        assert!(
            publication
                .target_for(&identity("ferry:udp?endpoint=localhost:10000|control=localhost:9"))
                .is_none()
        );
    }

    #[test]
    fn manual_targets_are_destinations() {
        let mut publication = publication("ferry:udp?control-mode=manual");
        let channel = identity("ferry:udp?endpoint=localhost:10000");
        assert!(publication.targets().is_empty());

        publication.destinations.push(Destination {
            registration_id: 55,
            endpoint: Endpoint::localhost(10000),
        });
        assert_eq!(publication.target_for(&channel).and_then(|t| t.destination()), Some(55));

        assert!(publication.remove_destination(55).is_some());
        assert!(publication.remove_destination(55).is_none());
        assert!(publication.target_for(&channel).is_none());
    }

    #[test]
    fn dynamic_reaches_receivers_naming_control() {
        let publication = publication("ferry:udp?control-mode=dynamic|control=127.0.0.1:10000");
        let receiver = identity("ferry:udp?control=127.0.0.1:10000|endpoint=127.0.0.1:10001|gtag=1");
        let target = publication.target_for(&receiver).unwrap();
        assert_eq!(target.destination(), None);
        assert!(publication.target_for(&identity("ferry:udp?endpoint=127.0.0.1:10001")).is_none());
    }

    #[test]
    fn owners() {
        let mut core = PublicationCore::new(1, 100, 10, false);
        let a = ClientId::generate();
        let b = ClientId::generate();
        core.owners.push(Owner { client: a, registration_id: 1 });
        core.owners.push(Owner { client: b, registration_id: 2 });
        core.owners.push(Owner { client: a, registration_id: 3 });
        assert!(core.remove_owner(2));
        assert!(!core.remove_owner(2));
        core.remove_client(a);
        assert!(core.owners.is_empty());
    }
}
