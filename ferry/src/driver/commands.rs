//! Messages exchanged between clients and the conductor.

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64};

use crate::driver::dispatcher::ErrorFrame;
use crate::net::Endpoint;
use crate::queue::spsc;

/// Capacity of the conductor's command inbox (shared by all clients).
pub const COMMAND_QUEUE_CAPACITY: usize = 1024;

/// Capacity of each client's notification queue.
pub const NOTIFICATION_QUEUE_CAPACITY: usize = 1024;

/// Sentinel for absent ids on the wire.
pub const NULL_VALUE: i64 = -1;

pub type NotificationProducer = spsc::Producer<DriverMessage, NOTIFICATION_QUEUE_CAPACITY>;
pub type NotificationConsumer = spsc::Consumer<DriverMessage, NOTIFICATION_QUEUE_CAPACITY>;

/// Unique identifier for a client connection.
///
/// Combines the process ID with a random nonce so several clients in one
/// process stay distinct.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ClientId {
    pid: u32,
    nonce: u32,
}

impl ClientId {
    #[must_use]
    pub fn generate() -> Self {
        Self {
            pid: std::process::id(),
            nonce: rand::random(),
        }
    }
}

impl fmt::Display for ClientId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{:08x}", self.pid, self.nonce)
    }
}

/// Error codes carried in [`DriverMessage::Error`] and error frames.
///
/// Values are stable and part of the protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(i32)]
pub enum ErrorCode {
    InvalidChannel = 1,
    UnknownSubscription = 2,
    UnknownPublication = 3,
    UnknownHost = 9,
    GenericError = 11,
    ImageRejected = 13,
    UnknownImage = 16,
}

impl ErrorCode {
    #[must_use]
    pub const fn value(self) -> i32 {
        self as i32
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::InvalidChannel => "INVALID_CHANNEL",
            Self::UnknownSubscription => "UNKNOWN_SUBSCRIPTION",
            Self::UnknownPublication => "UNKNOWN_PUBLICATION",
            Self::UnknownHost => "UNKNOWN_HOST",
            Self::GenericError => "GENERIC_ERROR",
            Self::ImageRejected => "IMAGE_REJECTED",
            Self::UnknownImage => "UNKNOWN_IMAGE",
        };
        f.write_str(name)
    }
}

/// First message from a client. Hands the conductor the producer end of the
/// client's notification queue.
pub struct ClientHello {
    pub id: ClientId,
    pub notifications: NotificationProducer,
    /// Bumped by the conductor for every notification that did not fit.
    pub dropped: Arc<AtomicU64>,
}

impl fmt::Debug for ClientHello {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientHello").field("id", &self.id).finish_non_exhaustive()
    }
}

/// Commands sent by a connected client.
///
/// Commands that expect a response carry the `correlation_id` the response
/// will echo. For add commands it also becomes the new resource's
/// registration id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientCommand {
    /// Keep-alive signal to prevent timeout.
    Keepalive,
    /// Graceful disconnect; releases everything the client holds.
    Disconnect,
    AddPublication {
        correlation_id: i64,
        channel: String,
        stream_id: i32,
        exclusive: bool,
    },
    RemovePublication {
        correlation_id: i64,
        registration_id: i64,
    },
    AddSubscription {
        correlation_id: i64,
        channel: String,
        stream_id: i32,
    },
    RemoveSubscription {
        correlation_id: i64,
        registration_id: i64,
    },
    /// Adds a destination to a `control-mode=manual` publication.
    AddDestination {
        correlation_id: i64,
        publication_registration_id: i64,
        channel: String,
    },
    RemoveDestination {
        correlation_id: i64,
        publication_registration_id: i64,
        destination_registration_id: i64,
    },
    RejectImage {
        correlation_id: i64,
        image_correlation_id: i64,
        position: i64,
        reason: String,
    },
}

/// Messages sent from client to conductor.
#[derive(Debug)]
pub enum ClientMessage {
    Hello(ClientHello),
    Command { client: ClientId, command: ClientCommand },
}

/// Messages sent from conductor to a client.
#[derive(Debug, Clone)]
pub enum DriverMessage {
    /// Handshake acknowledgment.
    Welcome,
    PublicationReady {
        correlation_id: i64,
        /// Registration id of the driver publication; differs from
        /// `correlation_id` when an existing publication is shared.
        original_registration_id: i64,
        session_id: i32,
        stream_id: i32,
        exclusive: bool,
        position: Arc<AtomicI64>,
        connected: Arc<AtomicBool>,
    },
    SubscriptionReady {
        correlation_id: i64,
    },
    /// Generic success for commands without a richer response.
    OperationSuccess {
        correlation_id: i64,
    },
    Error {
        correlation_id: i64,
        code: ErrorCode,
        message: String,
    },
    AvailableImage {
        subscription_registration_id: i64,
        correlation_id: i64,
        session_id: i32,
        stream_id: i32,
        source_address: Endpoint,
        position: Arc<AtomicI64>,
    },
    UnavailableImage {
        subscription_registration_id: i64,
        correlation_id: i64,
        stream_id: i32,
    },
    PublicationError(ErrorFrame),
    /// The conductor timed this client out and released its resources.
    ClientTimeout,
    /// Driver is shutting down.
    Shutdown,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_code_values_are_stable() {
        assert_eq!(ErrorCode::InvalidChannel.value(), 1);
        assert_eq!(ErrorCode::UnknownHost.value(), 9);
        assert_eq!(ErrorCode::GenericError.value(), 11);
        assert_eq!(ErrorCode::ImageRejected.value(), 13);
        assert_eq!(ErrorCode::UnknownImage.value(), 16);
        assert_eq!(ErrorCode::ImageRejected.to_string(), "IMAGE_REJECTED");
    }

    #[test]
    fn client_ids_differ() {
        let a = ClientId::generate();
        let b = ClientId::generate();
        assert_eq!(a.pid, b.pid);
        assert_ne!(a, b);
        assert!(a.to_string().starts_with(&std::process::id().to_string()));
    }
}
