//! Client session facade.
//!
//! A [`Client`] is one process's view of the driver: it adds publications and
//! subscriptions, rejects images, and drains its notification queue from
//! [`Client::poll`]. Image availability is routed to the owning
//! [`Subscription`]'s event queue; error frames go to the configured
//! [`PublicationErrorFrameHandler`].
//!
//! Command calls send one command and then wait, bounded by
//! [`ClientConfig::driver_timeout`], for the matching response. Notifications
//! that arrive in the meantime are processed as `poll()` would.

pub mod publication;
pub mod subscription;

use std::cell::RefCell;
use std::collections::{BTreeMap, VecDeque};
use std::rc::{Rc, Weak};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::config::{ClientConfig, ConfigError};
use crate::counters::{SystemCounter, SystemCounters};
use crate::driver::DriverConnector;
use crate::driver::commands::{
    ClientCommand, ClientHello, ClientId, ClientMessage, DriverMessage, ErrorCode,
    NOTIFICATION_QUEUE_CAPACITY, NotificationConsumer,
};
use crate::driver::dispatcher::ErrorFrame;
use crate::queue::{Timeout, spsc};
use crate::trace::{debug, info, trace, warn};

pub use publication::{OfferError, Publication};
pub use subscription::{Image, ImageEvent, Subscription};

use subscription::PendingEvent;

/// Error frame as seen by the owner of an affected publication.
pub type PublicationErrorFrame = ErrorFrame;

/// Receives error frames for the client's publications.
///
/// Called from [`Client::poll`] (and from command calls that are waiting for
/// a response) on the thread that owns the client.
pub trait PublicationErrorFrameHandler: Send + Sync {
    fn on_publication_error(&self, frame: &PublicationErrorFrame);
}

impl<F> PublicationErrorFrameHandler for F
where
    F: Fn(&PublicationErrorFrame) + Send + Sync,
{
    fn on_publication_error(&self, frame: &PublicationErrorFrame) {
        self(frame);
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    /// Rejected locally before anything was sent to the driver.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    /// The driver answered the command with an error.
    #[error("driver error {code}: {message}")]
    Driver { code: ErrorCode, message: String },
    #[error("timed out waiting for the driver")]
    Timeout,
    /// The driver dropped notifications because the queue was full; local
    /// state may be stale.
    #[error("{0} notification(s) dropped by the driver")]
    NotificationsDropped(u64),
    #[error("driver command queue full")]
    QueueFull,
    #[error("unexpected response to correlationId={0}")]
    UnexpectedResponse(i64),
    #[error(transparent)]
    Config(#[from] ConfigError),
    /// The driver timed this client out; it must reconnect.
    #[error("client timed out by the driver")]
    ClientTimeout,
    #[error("driver shut down")]
    Shutdown,
}

/// Why the driver stopped serving this client.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Closed {
    TimedOut,
    Shutdown,
}

impl Closed {
    const fn error(self) -> ClientError {
        match self {
            Self::TimedOut => ClientError::ClientTimeout,
            Self::Shutdown => ClientError::Shutdown,
        }
    }
}

/// A connected client.
///
/// Not `Send`: subscriptions share their event queues with the client through
/// `Rc`. Dropping the client tells the driver to release its resources.
pub struct Client {
    id: ClientId,
    connector: DriverConnector,
    notifications: NotificationConsumer,
    /// Incremented by the conductor for each notification it had to drop.
    dropped: Arc<AtomicU64>,
    dropped_seen: u64,
    config: ClientConfig,
    last_keepalive: minstant::Instant,
    subscriptions: BTreeMap<i64, Weak<RefCell<VecDeque<PendingEvent>>>>,
    closed: Option<Closed>,
}

impl Client {
    /// Connects to a driver and completes the handshake.
    ///
    /// # Errors
    ///
    /// [`ClientError::Config`] for an invalid configuration,
    /// [`ClientError::QueueFull`] if the driver inbox is full,
    /// [`ClientError::Timeout`] if the driver does not answer within
    /// `driver_timeout`.
    pub fn connect(connector: &DriverConnector, config: ClientConfig) -> Result<Self, ClientError> {
        config.validate()?;
        let (tx, rx) = spsc::channel::<DriverMessage, NOTIFICATION_QUEUE_CAPACITY>();
        let id = ClientId::generate();
        let dropped = Arc::new(AtomicU64::new(0));

        debug!(client = %id, "connecting to driver");
        connector
            .inbox
            .push(ClientMessage::Hello(ClientHello {
                id,
                notifications: tx,
                dropped: Arc::clone(&dropped),
            }))
            .map_err(|_| ClientError::QueueFull)?;

        let deadline = minstant::Instant::now() + config.driver_timeout;
        loop {
            let remaining = remaining(deadline).ok_or(ClientError::Timeout)?;
            match rx.pop_blocking(remaining) {
                Some(DriverMessage::Welcome) => break,
                Some(DriverMessage::Shutdown) => return Err(ClientError::Shutdown),
                Some(_) => continue,
                None => return Err(ClientError::Timeout),
            }
        }
        info!(client = %id, "connected to driver");

        Ok(Self {
            id,
            connector: connector.clone(),
            notifications: rx,
            dropped,
            dropped_seen: 0,
            config,
            last_keepalive: minstant::Instant::now(),
            subscriptions: BTreeMap::new(),
            closed: None,
        })
    }

    #[must_use]
    pub const fn id(&self) -> ClientId {
        self.id
    }

    /// Process-wide system counters.
    #[must_use]
    pub fn counters(&self) -> &SystemCounters {
        &self.connector.counters
    }

    /// Adds a publication, sharing an existing one on the same channel and
    /// stream if there is one.
    ///
    /// # Errors
    ///
    /// [`ClientError::Driver`] if the driver refuses the channel, or any
    /// error from waiting for the response.
    pub fn add_publication(&mut self, channel: &str, stream_id: i32) -> Result<Publication, ClientError> {
        self.add_publication_inner(channel, stream_id, false)
    }

    /// Adds a publication with its own session that is never shared.
    ///
    /// # Errors
    ///
    /// As [`add_publication`](Self::add_publication).
    pub fn add_exclusive_publication(
        &mut self,
        channel: &str,
        stream_id: i32,
    ) -> Result<Publication, ClientError> {
        self.add_publication_inner(channel, stream_id, true)
    }

    fn add_publication_inner(
        &mut self,
        channel: &str,
        stream_id: i32,
        exclusive: bool,
    ) -> Result<Publication, ClientError> {
        let correlation_id = self.connector.next_correlation_id();
        match self.request(
            correlation_id,
            ClientCommand::AddPublication {
                correlation_id,
                channel: channel.to_owned(),
                stream_id,
                exclusive,
            },
        )? {
            DriverMessage::PublicationReady {
                original_registration_id,
                session_id,
                stream_id,
                exclusive,
                position,
                connected,
                ..
            } => Ok(Publication::new(
                correlation_id,
                original_registration_id,
                channel.to_owned(),
                session_id,
                stream_id,
                exclusive,
                position,
                connected,
            )),
            _ => Err(ClientError::UnexpectedResponse(correlation_id)),
        }
    }

    /// Releases this client's hold on a publication.
    ///
    /// # Errors
    ///
    /// Any error from waiting for the response.
    pub fn close_publication(&mut self, publication: Publication) -> Result<(), ClientError> {
        let correlation_id = self.connector.next_correlation_id();
        self.request(
            correlation_id,
            ClientCommand::RemovePublication {
                correlation_id,
                registration_id: publication.correlation_id(),
            },
        )
        .map(drop)
    }

    /// Adds a subscription.
    ///
    /// # Errors
    ///
    /// [`ClientError::Driver`] if the driver refuses the channel, or any
    /// error from waiting for the response.
    pub fn add_subscription(&mut self, channel: &str, stream_id: i32) -> Result<Subscription, ClientError> {
        let correlation_id = self.connector.next_correlation_id();
        match self.request(
            correlation_id,
            ClientCommand::AddSubscription {
                correlation_id,
                channel: channel.to_owned(),
                stream_id,
            },
        )? {
            DriverMessage::SubscriptionReady { .. } => {
                let pending = Rc::new(RefCell::new(VecDeque::new()));
                self.subscriptions
                    .insert(correlation_id, Rc::downgrade(&pending));
                Ok(Subscription::new(
                    correlation_id,
                    channel.to_owned(),
                    stream_id,
                    pending,
                ))
            }
            _ => Err(ClientError::UnexpectedResponse(correlation_id)),
        }
    }

    /// Removes a subscription. Its images go away with it.
    ///
    /// # Errors
    ///
    /// Any error from waiting for the response.
    pub fn close_subscription(&mut self, subscription: Subscription) -> Result<(), ClientError> {
        let registration_id = subscription.registration_id();
        self.subscriptions.remove(&registration_id);
        let correlation_id = self.connector.next_correlation_id();
        self.request(
            correlation_id,
            ClientCommand::RemoveSubscription {
                correlation_id,
                registration_id,
            },
        )
        .map(drop)
    }

    /// Adds a destination to a `control-mode=manual` publication. Returns the
    /// destination's registration id, which error frames for images reached
    /// through it will carry.
    ///
    /// # Errors
    ///
    /// [`ClientError::Driver`] if the publication is not manual or the
    /// channel has no endpoint, or any error from waiting for the response.
    pub fn add_destination(&mut self, publication: &Publication, channel: &str) -> Result<i64, ClientError> {
        let correlation_id = self.connector.next_correlation_id();
        self.request(
            correlation_id,
            ClientCommand::AddDestination {
                correlation_id,
                publication_registration_id: publication.correlation_id(),
                channel: channel.to_owned(),
            },
        )?;
        Ok(correlation_id)
    }

    /// # Errors
    ///
    /// [`ClientError::Driver`] for an unknown destination, or any error from
    /// waiting for the response.
    pub fn remove_destination(
        &mut self,
        publication: &Publication,
        destination_registration_id: i64,
    ) -> Result<(), ClientError> {
        let correlation_id = self.connector.next_correlation_id();
        self.request(
            correlation_id,
            ClientCommand::RemoveDestination {
                correlation_id,
                publication_registration_id: publication.correlation_id(),
                destination_registration_id,
            },
        )
        .map(drop)
    }

    /// Asks the driver to reject `image`.
    ///
    /// On success the owners of matching publications receive an error frame
    /// carrying `reason`, and the subscription later sees the image become
    /// unavailable.
    ///
    /// # Errors
    ///
    /// - [`ClientError::InvalidArgument`] if `reason` does not fit the local
    ///   command buffer. Nothing is sent.
    /// - [`ClientError::Driver`] with [`ErrorCode::GenericError`] if `reason`
    ///   is longer than an error frame allows, or [`ErrorCode::UnknownImage`]
    ///   if the driver has no such image (IPC images included).
    pub fn reject_image(&mut self, image: &Image, reason: &str) -> Result<(), ClientError> {
        let max = self.config.max_command_length();
        if reason.len() > max {
            return Err(ClientError::InvalidArgument(format!(
                "reason length {} exceeds max command length {max}",
                reason.len()
            )));
        }
        let correlation_id = self.connector.next_correlation_id();
        debug!(client = %self.id, image = image.correlation_id(), "rejecting image");
        self.request(
            correlation_id,
            ClientCommand::RejectImage {
                correlation_id,
                image_correlation_id: image.correlation_id(),
                position: image.position(),
                reason: reason.to_owned(),
            },
        )
        .map(drop)
    }

    /// Sends a keepalive when due and drains pending notifications.
    ///
    /// Returns the number of notifications processed.
    ///
    /// # Errors
    ///
    /// [`ClientError::NotificationsDropped`] once after the driver dropped
    /// notifications for this client; [`ClientError::ClientTimeout`] or
    /// [`ClientError::Shutdown`] once the driver stopped serving it.
    pub fn poll(&mut self) -> Result<usize, ClientError> {
        if let Some(closed) = self.closed {
            return Err(closed.error());
        }
        let now = minstant::Instant::now();
        if now.duration_since(self.last_keepalive) >= self.config.keepalive_interval
            && self.send(ClientCommand::Keepalive).is_ok()
        {
            self.last_keepalive = now;
        }
        self.check_dropped()?;

        self.drain()
    }

    /// Disconnects from the driver. Same as dropping the client.
    pub fn close(self) {}

    fn send(&self, command: ClientCommand) -> Result<(), ClientError> {
        if let Some(closed) = self.closed {
            return Err(closed.error());
        }
        self.connector
            .inbox
            .push(ClientMessage::Command {
                client: self.id,
                command,
            })
            .map_err(|_| ClientError::QueueFull)
    }

    fn drain(&mut self) -> Result<usize, ClientError> {
        let mut work = 0;
        while let Some(msg) = self.notifications.pop() {
            self.on_notification(msg)?;
            work += 1;
        }
        Ok(work)
    }

    /// Sends a command and waits for its response.
    ///
    /// Pending notifications are handled first so the response finds room in
    /// the queue. Dropped notifications are left for [`poll`](Self::poll) to
    /// report: the driver has acted on the command either way.
    fn request(&mut self, correlation_id: i64, command: ClientCommand) -> Result<DriverMessage, ClientError> {
        self.drain()?;
        self.send(command)?;
        self.await_response(correlation_id)
    }

    fn check_dropped(&mut self) -> Result<(), ClientError> {
        let dropped = self.dropped.load(Ordering::Acquire);
        if dropped > self.dropped_seen {
            let missed = dropped - self.dropped_seen;
            self.dropped_seen = dropped;
            warn!(client = %self.id, missed, "driver dropped notifications");
            return Err(ClientError::NotificationsDropped(missed));
        }
        Ok(())
    }

    /// Waits for the response to `correlation_id`, processing everything else.
    fn await_response(&mut self, correlation_id: i64) -> Result<DriverMessage, ClientError> {
        let deadline = minstant::Instant::now() + self.config.driver_timeout;
        loop {
            let remaining = remaining(deadline).ok_or(ClientError::Timeout)?;
            let Some(msg) = self.notifications.pop_blocking(remaining) else {
                return Err(ClientError::Timeout);
            };
            if response_id(&msg) != Some(correlation_id) {
                self.on_notification(msg)?;
                continue;
            }
            return match msg {
                DriverMessage::Error { code, message, .. } => Err(ClientError::Driver { code, message }),
                other => Ok(other),
            };
        }
    }

    fn on_notification(&mut self, msg: DriverMessage) -> Result<(), ClientError> {
        match msg {
            DriverMessage::PublicationError(frame) => {
                self.connector
                    .counters
                    .increment(SystemCounter::ErrorFramesReceived);
                debug!(
                    client = %self.id,
                    registration_id = frame.registration_id,
                    code = %frame.error_code,
                    "publication error frame"
                );
                if let Some(handler) = &self.config.error_frame_handler {
                    handler.on_publication_error(&frame);
                }
            }
            DriverMessage::AvailableImage {
                subscription_registration_id,
                correlation_id,
                session_id,
                stream_id,
                source_address,
                position,
            } => self.route(
                subscription_registration_id,
                PendingEvent::Available(Image::new(
                    correlation_id,
                    subscription_registration_id,
                    session_id,
                    stream_id,
                    source_address,
                    position,
                )),
            ),
            DriverMessage::UnavailableImage {
                subscription_registration_id,
                correlation_id,
                ..
            } => self.route(
                subscription_registration_id,
                PendingEvent::Unavailable(correlation_id),
            ),
            DriverMessage::ClientTimeout => {
                warn!(client = %self.id, "timed out by driver");
                self.closed = Some(Closed::TimedOut);
                return Err(ClientError::ClientTimeout);
            }
            DriverMessage::Shutdown => {
                info!(client = %self.id, "driver shut down");
                self.closed = Some(Closed::Shutdown);
                return Err(ClientError::Shutdown);
            }
            other => {
                trace!(client = %self.id, message = ?other, "unsolicited driver message");
            }
        }
        Ok(())
    }

    fn route(&mut self, subscription_registration_id: i64, event: PendingEvent) {
        match self
            .subscriptions
            .get(&subscription_registration_id)
            .and_then(Weak::upgrade)
        {
            Some(pending) => pending.borrow_mut().push_back(event),
            None => {
                self.subscriptions.remove(&subscription_registration_id);
            }
        }
    }
}

impl Drop for Client {
    fn drop(&mut self) {
        if self.closed.is_none() {
            let _ = self.send(ClientCommand::Disconnect);
            debug!(client = %self.id, "client closed");
        }
    }
}

/// Correlation id of a command response.
const fn response_id(msg: &DriverMessage) -> Option<i64> {
    match msg {
        DriverMessage::PublicationReady { correlation_id, .. }
        | DriverMessage::SubscriptionReady { correlation_id }
        | DriverMessage::OperationSuccess { correlation_id }
        | DriverMessage::Error { correlation_id, .. } => Some(*correlation_id),
        _ => None,
    }
}

fn remaining(deadline: minstant::Instant) -> Option<Timeout> {
    deadline
        .checked_duration_since(minstant::Instant::now())
        .map(Timeout::Duration)
}
