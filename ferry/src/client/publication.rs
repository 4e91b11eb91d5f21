//! Client-side publication handle.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};

/// Largest frame the loopback media carries.
pub const MTU_LENGTH: usize = 8192;

/// Header prepended to every data frame.
pub const DATA_HEADER_LENGTH: usize = 32;

/// Frames start on this boundary; positions advance in multiples of it.
pub const FRAME_ALIGNMENT: usize = 32;

/// Largest payload a single `offer` accepts.
pub const MAX_PAYLOAD_LENGTH: usize = MTU_LENGTH - DATA_HEADER_LENGTH;

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum OfferError {
    /// No image is currently fed by this publication.
    #[error("publication is not connected")]
    NotConnected,
    #[error("payload of {len} bytes exceeds max of {max}")]
    PayloadTooLarge { len: usize, max: usize },
}

/// A client's handle on a driver publication.
///
/// Position and connection state are shared with the driver. Several clients
/// holding the same non-exclusive publication see the same values.
#[derive(Debug)]
pub struct Publication {
    correlation_id: i64,
    registration_id: i64,
    channel: String,
    session_id: i32,
    stream_id: i32,
    exclusive: bool,
    position: Arc<AtomicI64>,
    connected: Arc<AtomicBool>,
}

impl Publication {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        correlation_id: i64,
        registration_id: i64,
        channel: String,
        session_id: i32,
        stream_id: i32,
        exclusive: bool,
        position: Arc<AtomicI64>,
        connected: Arc<AtomicBool>,
    ) -> Self {
        Self {
            correlation_id,
            registration_id,
            channel,
            session_id,
            stream_id,
            exclusive,
            position,
            connected,
        }
    }

    /// Appends one message and returns the new stream position.
    ///
    /// # Errors
    ///
    /// [`OfferError::NotConnected`] while no subscriber receives this
    /// publication, [`OfferError::PayloadTooLarge`] past
    /// [`MAX_PAYLOAD_LENGTH`].
    pub fn offer(&self, payload: &[u8]) -> Result<i64, OfferError> {
        if payload.len() > MAX_PAYLOAD_LENGTH {
            return Err(OfferError::PayloadTooLarge {
                len: payload.len(),
                max: MAX_PAYLOAD_LENGTH,
            });
        }
        if !self.is_connected() {
            return Err(OfferError::NotConnected);
        }
        let length = aligned_frame_length(payload.len());
        Ok(self.position.fetch_add(length, Ordering::AcqRel) + length)
    }

    #[must_use]
    pub fn position(&self) -> i64 {
        self.position.load(Ordering::Acquire)
    }

    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Acquire)
    }

    /// Registration id of the driver publication. Shared publications report
    /// the id of the first add; error frames carry this value.
    #[must_use]
    pub const fn registration_id(&self) -> i64 {
        self.registration_id
    }

    /// Id of this particular add.
    #[must_use]
    pub const fn correlation_id(&self) -> i64 {
        self.correlation_id
    }

    #[must_use]
    pub fn channel(&self) -> &str {
        &self.channel
    }

    #[must_use]
    pub const fn session_id(&self) -> i32 {
        self.session_id
    }

    #[must_use]
    pub const fn stream_id(&self) -> i32 {
        self.stream_id
    }

    #[must_use]
    pub const fn is_exclusive(&self) -> bool {
        self.exclusive
    }
}

/// Header plus payload, rounded up to [`FRAME_ALIGNMENT`].
const fn aligned_frame_length(payload: usize) -> i64 {
    let framed = (payload + DATA_HEADER_LENGTH + FRAME_ALIGNMENT - 1) & !(FRAME_ALIGNMENT - 1);
    framed as i64
}
