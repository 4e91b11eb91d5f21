//! Driver conductor.
//!
//! Responsibilities:
//! - Own canonical state: client sessions, publications, subscriptions, images.
//! - Apply client commands and answer each one on the client's queue.
//! - Run the loopback media stage that turns publications into images.
//! - Expire images and clients whose liveness deadline has passed.
//! - Reject images on request and fan error frames out to the senders.
//!
//! Everything happens on one thread inside [`Conductor::do_work`], which takes
//! the current time explicitly.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicI64, Ordering};

use crate::channel::{ChannelError, ChannelIdentity, ChannelUri, Media};
use crate::config::DriverConfig;
use crate::counters::{SystemCounter, SystemCounters};
use crate::driver::clients::ClientSessions;
use crate::driver::commands::{
    COMMAND_QUEUE_CAPACITY, ClientCommand, ClientId, ClientMessage, DriverMessage, ErrorCode,
};
use crate::driver::dispatcher::{self, DispatchError};
use crate::driver::image::{
    Image, ImageKey, ImageRegistry, ImageState, RegistryError, Subscriber, TerminalEvent,
};
use crate::driver::liveness::LivenessTimer;
use crate::driver::publication::{
    Destination, IpcPublication, NetworkPublication, Owner, PublicationCore,
};
use crate::error_log::ErrorLog;
use crate::net::{Endpoint, EndpointError};
use crate::queue::mpsc;
use crate::timing::{Duration, Micros, MonoInstant, WheelError};
use crate::trace::{debug, info, trace, warn};

type Instant = MonoInstant<Micros>;

/// Upper bound on commands handled per duty cycle.
const MAX_COMMANDS_PER_CYCLE: usize = 256;

#[derive(Debug, thiserror::Error)]
pub enum ConductorError {
    #[error(transparent)]
    Channel(#[from] ChannelError),
    #[error(transparent)]
    Registry(#[from] RegistryError),
    #[error(transparent)]
    Dispatch(#[from] DispatchError),
    #[error(transparent)]
    Timer(#[from] WheelError),
    #[error("unknown publication registrationId={0}")]
    UnknownPublication(i64),
    #[error("unknown subscription registrationId={0}")]
    UnknownSubscription(i64),
    #[error("unknown destination registrationId={0}")]
    UnknownDestination(i64),
    #[error("publication registrationId={0} does not accept destinations (control-mode=manual required)")]
    NotManual(i64),
}

impl ConductorError {
    /// Wire code reported to the client.
    #[must_use]
    pub fn error_code(&self) -> ErrorCode {
        match self {
            Self::Channel(ChannelError::Address {
                source: EndpointError::UnknownHost(_),
                ..
            }) => ErrorCode::UnknownHost,
            Self::Channel(_) | Self::NotManual(_) => ErrorCode::InvalidChannel,
            Self::Registry(RegistryError::UnknownImage(_)) => ErrorCode::UnknownImage,
            Self::Dispatch(e) => e.error_code(),
            Self::UnknownPublication(_) => ErrorCode::UnknownPublication,
            Self::UnknownSubscription(_) => ErrorCode::UnknownSubscription,
            Self::Registry(_) | Self::Timer(_) | Self::UnknownDestination(_) => {
                ErrorCode::GenericError
            }
        }
    }
}

/// A client subscription as the conductor tracks it.
#[derive(Debug, Clone, Copy)]
struct SubscriptionLink {
    client: ClientId,
    identity: ChannelIdentity,
    stream_id: i32,
}

impl SubscriptionLink {
    const fn is_ipc(&self) -> bool {
        matches!(self.identity.media, Media::Ipc)
    }
}

/// One publication reaching one subscription during a media cycle.
#[derive(Debug, Clone, Copy)]
struct Observation {
    publication: i64,
    position: i64,
    key: ImageKey,
    subscriber: Subscriber,
}

pub struct Conductor {
    /// Command inbox shared by all clients.
    inbox: mpsc::Consumer<ClientMessage, COMMAND_QUEUE_CAPACITY>,
    clients: ClientSessions,
    images: ImageRegistry,
    liveness: LivenessTimer,
    /// Network publications by original registration id.
    network_publications: BTreeMap<i64, NetworkPublication>,
    /// IPC publications by original registration id.
    ipc_publications: BTreeMap<i64, IpcPublication>,
    /// Subscriptions by registration id.
    subscriptions: BTreeMap<i64, SubscriptionLink>,
    /// `(publication, subscription)` pairs already announced over IPC.
    ipc_links: BTreeSet<(i64, i64)>,
    counters: Arc<SystemCounters>,
    error_log: Arc<ErrorLog>,
    /// Correlation id source shared with clients.
    ids: Arc<AtomicI64>,
    image_liveness_timeout: Duration<Micros>,
    client_liveness_timeout: Duration<Micros>,
}

impl Conductor {
    #[must_use]
    pub fn new(
        config: &DriverConfig,
        inbox: mpsc::Consumer<ClientMessage, COMMAND_QUEUE_CAPACITY>,
        counters: Arc<SystemCounters>,
        error_log: Arc<ErrorLog>,
        ids: Arc<AtomicI64>,
        now: Instant,
    ) -> Self {
        Self {
            inbox,
            clients: ClientSessions::new(Arc::clone(&counters)),
            images: ImageRegistry::new(),
            liveness: LivenessTimer::new(config.wheel_config(), now),
            network_publications: BTreeMap::new(),
            ipc_publications: BTreeMap::new(),
            subscriptions: BTreeMap::new(),
            ipc_links: BTreeSet::new(),
            counters,
            error_log,
            ids,
            image_liveness_timeout: Duration::from_std(config.image_liveness_timeout),
            client_liveness_timeout: Duration::from_std(config.client_liveness_timeout),
        }
    }

    /// Runs one duty cycle. Returns the amount of work done; zero means idle.
    pub fn do_work(&mut self, now: Instant) -> usize {
        let mut work = 0;
        while work < MAX_COMMANDS_PER_CYCLE {
            let Some(msg) = self.inbox.pop() else {
                break;
            };
            self.on_message(msg, now);
            work += 1;
        }
        work += self.run_media(now);
        work += self.poll_liveness(now);
        work += self.check_clients(now);
        work
    }

    /// Tells every client the driver is going away.
    pub fn on_close(&mut self) {
        info!(clients = self.clients.len(), "conductor closing");
        self.clients.broadcast(&DriverMessage::Shutdown);
    }

    #[must_use]
    pub fn images(&self) -> &ImageRegistry {
        &self.images
    }

    fn next_correlation_id(&self) -> i64 {
        self.ids.fetch_add(1, Ordering::AcqRel)
    }

    fn next_session_id(&self) -> i32 {
        loop {
            let candidate: i32 = rand::random();
            let taken = self
                .network_publications
                .values()
                .map(|p| &p.core)
                .chain(self.ipc_publications.values().map(|p| &p.core))
                .any(|core| core.session_id == candidate);
            if !taken {
                return candidate;
            }
        }
    }

    fn on_message(&mut self, msg: ClientMessage, now: Instant) {
        match msg {
            ClientMessage::Hello(hello) => {
                let id = hello.id;
                if self.clients.accept(hello, now) {
                    info!(client = %id, "client connected");
                    self.clients.send(id, DriverMessage::Welcome);
                } else {
                    warn!(client = %id, "duplicate hello ignored");
                }
            }
            ClientMessage::Command { client, command } => {
                if self.clients.contains(client) {
                    self.on_command(client, command, now);
                } else {
                    warn!(client = %client, command = ?command, "command from unknown client ignored");
                }
            }
        }
    }

    fn on_command(&mut self, client: ClientId, command: ClientCommand, now: Instant) {
        self.clients.touch(client, now);
        let (correlation_id, result) = match command {
            ClientCommand::Keepalive => return,
            ClientCommand::Disconnect => {
                info!(client = %client, "client disconnected");
                self.release_client(client);
                return;
            }
            ClientCommand::AddPublication {
                correlation_id,
                channel,
                stream_id,
                exclusive,
            } => (
                correlation_id,
                self.on_add_publication(client, correlation_id, &channel, stream_id, exclusive),
            ),
            ClientCommand::RemovePublication {
                correlation_id,
                registration_id,
            } => (
                correlation_id,
                self.on_remove_publication(client, correlation_id, registration_id),
            ),
            ClientCommand::AddSubscription {
                correlation_id,
                channel,
                stream_id,
            } => (
                correlation_id,
                self.on_add_subscription(client, correlation_id, &channel, stream_id),
            ),
            ClientCommand::RemoveSubscription {
                correlation_id,
                registration_id,
            } => (
                correlation_id,
                self.on_remove_subscription(client, correlation_id, registration_id),
            ),
            ClientCommand::AddDestination {
                correlation_id,
                publication_registration_id,
                channel,
            } => (
                correlation_id,
                self.on_add_destination(client, correlation_id, publication_registration_id, &channel),
            ),
            ClientCommand::RemoveDestination {
                correlation_id,
                publication_registration_id,
                destination_registration_id,
            } => (
                correlation_id,
                self.on_remove_destination(
                    client,
                    correlation_id,
                    publication_registration_id,
                    destination_registration_id,
                ),
            ),
            ClientCommand::RejectImage {
                correlation_id,
                image_correlation_id,
                position,
                reason,
            } => (
                correlation_id,
                self.on_reject_image(client, correlation_id, image_correlation_id, position, &reason, now),
            ),
        };

        if let Err(e) = result {
            debug!(client = %client, correlation_id, error = %e, "command failed");
            self.clients.send(
                client,
                DriverMessage::Error {
                    correlation_id,
                    code: e.error_code(),
                    message: e.to_string(),
                },
            );
        }
    }

    fn on_add_publication(
        &mut self,
        client: ClientId,
        correlation_id: i64,
        channel: &str,
        stream_id: i32,
        exclusive: bool,
    ) -> Result<(), ConductorError> {
        let uri = ChannelUri::parse(channel)?;
        uri.validate_for_publication()?;
        let owner = Owner {
            client,
            registration_id: correlation_id,
        };

        let ipc = uri.is_ipc();
        let core = if ipc {
            let shared = if exclusive {
                None
            } else {
                self.ipc_publications
                    .iter()
                    .find(|(_, p)| !p.core.exclusive && p.core.stream_id == stream_id)
                    .map(|(id, _)| *id)
            };
            let id = match shared {
                Some(id) => id,
                None => {
                    let session_id = self.next_session_id();
                    self.ipc_publications.insert(
                        correlation_id,
                        IpcPublication {
                            core: PublicationCore::new(correlation_id, session_id, stream_id, exclusive),
                        },
                    );
                    correlation_id
                }
            };
            &mut self
                .ipc_publications
                .get_mut(&id)
                .ok_or(ConductorError::UnknownPublication(id))?
                .core
        } else {
            let shared = if exclusive {
                None
            } else {
                self.network_publications
                    .iter()
                    .find(|(_, p)| {
                        !p.core.exclusive && p.core.stream_id == stream_id && p.channel == uri
                    })
                    .map(|(id, _)| *id)
            };
            let id = match shared {
                Some(id) => id,
                None => {
                    let session_id = self.next_session_id();
                    self.network_publications.insert(
                        correlation_id,
                        NetworkPublication::new(
                            PublicationCore::new(correlation_id, session_id, stream_id, exclusive),
                            uri,
                        ),
                    );
                    correlation_id
                }
            };
            &mut self
                .network_publications
                .get_mut(&id)
                .ok_or(ConductorError::UnknownPublication(id))?
                .core
        };

        core.owners.push(owner);
        info!(
            client = %client,
            registration_id = correlation_id,
            original_registration_id = core.registration_id,
            session_id = core.session_id,
            stream_id,
            exclusive,
            channel,
            "publication added"
        );
        self.clients.send(
            client,
            DriverMessage::PublicationReady {
                correlation_id,
                original_registration_id: core.registration_id,
                session_id: core.session_id,
                stream_id: core.stream_id,
                exclusive: core.exclusive,
                position: Arc::clone(&core.position),
                connected: Arc::clone(&core.connected),
            },
        );
        if ipc {
            let original_registration_id = core.registration_id;
            self.link_ipc_publication(original_registration_id);
        }
        Ok(())
    }

    fn on_remove_publication(
        &mut self,
        client: ClientId,
        correlation_id: i64,
        registration_id: i64,
    ) -> Result<(), ConductorError> {
        let owner = Owner {
            client,
            registration_id,
        };
        if let Some((&id, publication)) = self
            .network_publications
            .iter_mut()
            .find(|(_, p)| p.core.owners.contains(&owner))
        {
            publication.core.remove_owner(registration_id);
            if publication.core.owners.is_empty() {
                debug!(registration_id = id, "network publication closed");
                publication.core.set_connected(false);
                self.network_publications.remove(&id);
            }
        } else if let Some((&id, publication)) = self
            .ipc_publications
            .iter_mut()
            .find(|(_, p)| p.core.owners.contains(&owner))
        {
            publication.core.remove_owner(registration_id);
            if publication.core.owners.is_empty() {
                self.close_ipc_publication(id);
            }
        } else {
            return Err(ConductorError::UnknownPublication(registration_id));
        }
        self.clients
            .send(client, DriverMessage::OperationSuccess { correlation_id });
        Ok(())
    }

    fn close_ipc_publication(&mut self, id: i64) {
        let Some(publication) = self.ipc_publications.remove(&id) else {
            return;
        };
        debug!(registration_id = id, "ipc publication closed");
        publication.core.set_connected(false);
        let linked: Vec<i64> = self.ipc_links_of(id).collect();
        for subscription in linked {
            self.ipc_links.remove(&(id, subscription));
            if let Some(link) = self.subscriptions.get(&subscription) {
                self.clients.send(
                    link.client,
                    DriverMessage::UnavailableImage {
                        subscription_registration_id: subscription,
                        correlation_id: id,
                        stream_id: publication.core.stream_id,
                    },
                );
            }
        }
    }

    fn on_add_subscription(
        &mut self,
        client: ClientId,
        correlation_id: i64,
        channel: &str,
        stream_id: i32,
    ) -> Result<(), ConductorError> {
        let uri = ChannelUri::parse(channel)?;
        uri.validate_for_subscription()?;
        self.subscriptions.insert(
            correlation_id,
            SubscriptionLink {
                client,
                identity: uri.identity(),
                stream_id,
            },
        );
        info!(client = %client, registration_id = correlation_id, stream_id, channel, "subscription added");
        self.clients
            .send(client, DriverMessage::SubscriptionReady { correlation_id });
        self.link_ipc_subscription(correlation_id);
        Ok(())
    }

    fn on_remove_subscription(
        &mut self,
        client: ClientId,
        correlation_id: i64,
        registration_id: i64,
    ) -> Result<(), ConductorError> {
        match self.subscriptions.get(&registration_id) {
            Some(link) if link.client == client => {}
            _ => return Err(ConductorError::UnknownSubscription(registration_id)),
        }
        self.subscriptions.remove(&registration_id);
        self.detach_subscription(registration_id);
        self.clients
            .send(client, DriverMessage::OperationSuccess { correlation_id });
        Ok(())
    }

    /// Drops a subscription's IPC links and any image left without subscribers.
    fn detach_subscription(&mut self, registration_id: i64) {
        let unlinked: Vec<i64> = self
            .ipc_links
            .iter()
            .filter(|(_, s)| *s == registration_id)
            .map(|(p, _)| *p)
            .collect();
        for publication_id in unlinked {
            self.ipc_links.remove(&(publication_id, registration_id));
            let linked = self.ipc_links_of(publication_id).next().is_some();
            if let Some(publication) = self.ipc_publications.get(&publication_id) {
                publication.core.set_connected(linked);
            }
        }
        for orphan in self.images.remove_subscriber(registration_id) {
            debug!(image = orphan, "image closed, no subscribers left");
            self.liveness.cancel(orphan);
            if let Err(e) = self.images.transition(orphan, ImageState::Terminal) {
                warn!(image = orphan, error = %e, "orphaned image not terminal");
            }
            self.images.remove(orphan);
        }
    }

    fn find_network_publication(
        &mut self,
        client: ClientId,
        registration_id: i64,
    ) -> Result<&mut NetworkPublication, ConductorError> {
        let owner = Owner {
            client,
            registration_id,
        };
        self.network_publications
            .values_mut()
            .find(|p| p.core.owners.contains(&owner))
            .ok_or(ConductorError::UnknownPublication(registration_id))
    }

    fn on_add_destination(
        &mut self,
        client: ClientId,
        correlation_id: i64,
        publication_registration_id: i64,
        channel: &str,
    ) -> Result<(), ConductorError> {
        let uri = ChannelUri::parse(channel)?;
        uri.validate_for_destination()?;
        let endpoint = uri.endpoint().ok_or(ChannelError::Unsupported(
            "destination requires a udp endpoint",
        ))?;

        let publication = self.find_network_publication(client, publication_registration_id)?;
        if !publication.is_manual() {
            return Err(ConductorError::NotManual(publication_registration_id));
        }
        publication.destinations.push(Destination {
            registration_id: correlation_id,
            endpoint,
        });
        info!(
            publication = publication_registration_id,
            destination = correlation_id,
            endpoint = %endpoint,
            "destination added"
        );
        self.clients
            .send(client, DriverMessage::OperationSuccess { correlation_id });
        Ok(())
    }

    fn on_remove_destination(
        &mut self,
        client: ClientId,
        correlation_id: i64,
        publication_registration_id: i64,
        destination_registration_id: i64,
    ) -> Result<(), ConductorError> {
        let publication = self.find_network_publication(client, publication_registration_id)?;
        publication
            .remove_destination(destination_registration_id)
            .ok_or(ConductorError::UnknownDestination(destination_registration_id))?;
        debug!(
            publication = publication_registration_id,
            destination = destination_registration_id,
            "destination removed"
        );
        self.clients
            .send(client, DriverMessage::OperationSuccess { correlation_id });
        Ok(())
    }

    /// Rejects an image on behalf of one of its subscribers.
    ///
    /// The caller is answered before the fan-out. Error frames are queued
    /// before the unavailable-image notifications for the same image.
    fn on_reject_image(
        &mut self,
        client: ClientId,
        correlation_id: i64,
        image_id: i64,
        position: i64,
        reason: &str,
        now: Instant,
    ) -> Result<(), ConductorError> {
        dispatcher::validate_reason(reason)?;
        self.images.transition(image_id, ImageState::RejectRequested)?;
        self.clients
            .send(client, DriverMessage::OperationSuccess { correlation_id });

        let image = self
            .images
            .get(image_id)
            .ok_or(RegistryError::UnknownImage(image_id))?;
        info!(
            client = %client,
            image = image_id,
            position,
            image_position = image.position(),
            reason,
            "image rejected"
        );
        self.error_log.record(
            ErrorCode::ImageRejected,
            &format!("image rejected correlationId={image_id} {}: {reason}", image.key),
            now,
        );

        let fanout = dispatcher::dispatch(image, reason, self.network_publications.values());
        let mut sent = 0_i64;
        for (owner, frame) in fanout.frames {
            if self.clients.send(owner, DriverMessage::PublicationError(frame)) {
                sent += 1;
            }
        }
        self.counters.add(SystemCounter::ErrorFramesSent, sent);
        for id in &fanout.matched_publications {
            if let Some(publication) = self.network_publications.get(id) {
                publication.core.set_connected(false);
            }
        }

        let event = self.images.transition(image_id, ImageState::Terminal)?;
        self.images.remove(image_id);
        let Some(event) = event else {
            return Ok(());
        };

        let until = now + self.image_liveness_timeout;
        self.images.quarantine(event.key, image_id, until);
        if let Err(e) = self.liveness.arm(image_id, until) {
            warn!(image = image_id, error = %e, "cannot arm quarantine timer, lifting it now");
            self.images.release(image_id);
        }
        self.notify_unavailable(&event);
        Ok(())
    }

    fn notify_unavailable(&self, event: &TerminalEvent) {
        for subscriber in &event.subscribers {
            self.clients.send(
                subscriber.client,
                DriverMessage::UnavailableImage {
                    subscription_registration_id: subscriber.subscription_registration_id,
                    correlation_id: event.correlation_id,
                    stream_id: event.key.stream_id,
                },
            );
        }
    }

    /// Loopback media: every publication heartbeats every reachable
    /// subscription once per cycle.
    fn run_media(&mut self, now: Instant) -> usize {
        if self.network_publications.is_empty() {
            return 0;
        }
        let mut by_stream: BTreeMap<i32, Vec<(i64, &SubscriptionLink)>> = BTreeMap::new();
        for (&registration_id, link) in &self.subscriptions {
            if !link.is_ipc() {
                by_stream.entry(link.stream_id).or_default().push((registration_id, link));
            }
        }

        let mut observations = Vec::new();
        for publication in self.network_publications.values() {
            let core = &publication.core;
            let Some(candidates) = by_stream.get(&core.stream_id) else {
                continue;
            };
            for target in publication.targets() {
                for &(registration_id, link) in candidates {
                    if !target.accepts(&link.identity) {
                        continue;
                    }
                    observations.push(Observation {
                        publication: core.registration_id,
                        position: core.position(),
                        key: ImageKey {
                            channel: link.identity,
                            session_id: core.session_id,
                            stream_id: core.stream_id,
                        },
                        subscriber: Subscriber {
                            client: link.client,
                            subscription_registration_id: registration_id,
                        },
                    });
                }
            }
        }

        let mut work = 0;
        let mut fed = BTreeSet::new();
        for observation in observations {
            let (live, changed) = self.observe(observation, now);
            if live {
                fed.insert(observation.publication);
            }
            if changed {
                work += 1;
            }
        }
        for (id, publication) in &self.network_publications {
            publication.core.set_connected(fed.contains(id));
        }

        work
    }

    /// Applies one observation. Returns `(image is live, something changed)`.
    fn observe(&mut self, obs: Observation, now: Instant) -> (bool, bool) {
        let deadline = now + self.image_liveness_timeout;
        let key = obs.key;

        if let Some(existing) = self.images.find(&key.channel, key.session_id, key.stream_id) {
            if existing.state != ImageState::Active {
                return (false, false);
            }
            let id = existing.correlation_id;
            if let Err(e) = self.liveness.arm(id, deadline) {
                warn!(image = id, error = %e, "cannot refresh image liveness");
            }
            let Some(image) = self.images.get_mut(id) else {
                return (false, false);
            };
            image.advance_position(obs.position);
            image.liveness_deadline = deadline;
            if image.subscribers.contains(&obs.subscriber) {
                return (true, false);
            }
            image.subscribers.push(obs.subscriber);
            let available = available_image(image, obs.subscriber);
            self.clients.send(obs.subscriber.client, available);
            return (true, true);
        }

        if let Some(until) = self.images.quarantined_until(&key) {
            trace!(key = %key, until = %until, "image creation blocked by rejection");
            return (false, false);
        }

        let id = self.next_correlation_id();
        let source = key.channel.endpoint.unwrap_or_else(Endpoint::unspecified);
        let mut image = Image::new(id, key, source, deadline);
        image.advance_position(obs.position);
        image.subscribers.push(obs.subscriber);
        let available = available_image(&image, obs.subscriber);

        if let Err(e) = self.images.insert(image) {
            trace!(key = %key, error = %e, "image not created");
            return (false, false);
        }
        if let Err(e) = self.liveness.arm(id, deadline) {
            warn!(image = id, error = %e, "cannot arm image liveness, dropping image");
            self.images.remove(id);
            return (false, false);
        }
        self.counters.increment(SystemCounter::ImagesCreated);
        info!(image = id, key = %key, source = %source, "image available");
        self.clients.send(obs.subscriber.client, available);
        (true, true)
    }

    /// Links a new IPC publication to every IPC subscription on its stream.
    fn link_ipc_publication(&mut self, publication_id: i64) {
        let Some(publication) = self.ipc_publications.get(&publication_id) else {
            return;
        };
        let stream_id = publication.core.stream_id;
        let subscriptions: Vec<i64> = self
            .subscriptions
            .iter()
            .filter(|(_, link)| link.is_ipc() && link.stream_id == stream_id)
            .map(|(id, _)| *id)
            .collect();
        for subscription_id in subscriptions {
            self.link_ipc(publication_id, subscription_id);
        }
    }

    /// Links a new IPC subscription to every IPC publication on its stream.
    fn link_ipc_subscription(&mut self, subscription_id: i64) {
        let Some(link) = self.subscriptions.get(&subscription_id) else {
            return;
        };
        if !link.is_ipc() {
            return;
        }
        let stream_id = link.stream_id;
        let publications: Vec<i64> = self
            .ipc_publications
            .iter()
            .filter(|(_, p)| p.core.stream_id == stream_id)
            .map(|(id, _)| *id)
            .collect();
        for publication_id in publications {
            self.link_ipc(publication_id, subscription_id);
        }
    }

    /// Announces one publication to one subscription, at most once.
    fn link_ipc(&mut self, publication_id: i64, subscription_id: i64) {
        let (Some(publication), Some(link)) = (
            self.ipc_publications.get(&publication_id),
            self.subscriptions.get(&subscription_id),
        ) else {
            return;
        };
        if !self.ipc_links.insert((publication_id, subscription_id)) {
            return;
        }
        let core = &publication.core;
        core.set_connected(true);
        self.clients.send(
            link.client,
            DriverMessage::AvailableImage {
                subscription_registration_id: subscription_id,
                correlation_id: publication_id,
                session_id: core.session_id,
                stream_id: core.stream_id,
                source_address: Endpoint::unspecified(),
                position: Arc::clone(&core.position),
            },
        );
    }

    /// Subscriptions an IPC publication is linked to.
    fn ipc_links_of(&self, publication_id: i64) -> impl Iterator<Item = i64> + '_ {
        self.ipc_links
            .range((publication_id, i64::MIN)..=(publication_id, i64::MAX))
            .map(|(_, subscription)| *subscription)
    }

    fn poll_liveness(&mut self, now: Instant) -> usize {
        let expired: Vec<i64> = self.liveness.poll(now).collect();
        let work = expired.len();
        for id in expired {
            match self.images.get(id).map(|image| image.state) {
                Some(ImageState::Active) => self.expire_image(id),
                Some(state) => {
                    warn!(image = id, state = ?state, "liveness expiry for image mid-transition");
                }
                None => {
                    if self.images.release(id) {
                        debug!(image = id, "rejection quarantine lifted");
                    }
                }
            }
        }
        work
    }

    /// Ordinary liveness expiry: terminal without an error frame.
    fn expire_image(&mut self, id: i64) {
        let event = match self.images.transition(id, ImageState::Terminal) {
            Ok(Some(event)) => event,
            Ok(None) => return,
            Err(e) => {
                warn!(image = id, error = %e, "cannot expire image");
                return;
            }
        };
        debug_assert!(!event.error_frame_owed);
        self.images.remove(id);
        self.counters.increment(SystemCounter::ImageLivenessTimeouts);
        info!(image = id, key = %event.key, "image liveness timeout");
        self.notify_unavailable(&event);
    }

    fn check_clients(&mut self, now: Instant) -> usize {
        let expired = self.clients.expired(now, self.client_liveness_timeout);
        let work = expired.len();
        for (client, timed_out) in expired {
            if timed_out {
                warn!(client = %client, "client liveness timeout");
                self.counters.increment(SystemCounter::ClientTimeouts);
                self.clients.send(client, DriverMessage::ClientTimeout);
            } else {
                debug!(client = %client, "client went away without disconnecting");
            }
            self.release_client(client);
        }
        work
    }

    /// Releases everything a client holds and forgets its session.
    fn release_client(&mut self, client: ClientId) {
        self.network_publications.retain(|_, p| {
            p.core.remove_client(client);
            if p.core.owners.is_empty() {
                p.core.set_connected(false);
                return false;
            }
            true
        });

        for publication in self.ipc_publications.values_mut() {
            publication.core.remove_client(client);
        }
        let closed: Vec<i64> = self
            .ipc_publications
            .iter()
            .filter(|(_, p)| p.core.owners.is_empty())
            .map(|(id, _)| *id)
            .collect();
        for id in closed {
            self.close_ipc_publication(id);
        }

        let subscriptions: Vec<i64> = self
            .subscriptions
            .iter()
            .filter(|(_, link)| link.client == client)
            .map(|(id, _)| *id)
            .collect();
        for id in subscriptions {
            self.subscriptions.remove(&id);
            self.detach_subscription(id);
        }

        self.clients.remove(client);
    }
}

fn available_image(image: &Image, subscriber: Subscriber) -> DriverMessage {
    DriverMessage::AvailableImage {
        subscription_registration_id: subscriber.subscription_registration_id,
        correlation_id: image.correlation_id,
        session_id: image.key.session_id,
        stream_id: image.key.stream_id,
        source_address: image.source_address,
        position: Arc::clone(&image.position),
    }
}
