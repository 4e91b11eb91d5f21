//! Image registry.
//!
//! An image is the receive side of one publisher's stream at one receiving
//! channel. The registry is the conductor's authoritative table of them and
//! enforces that each [`ImageKey`] maps to at most one live image. After a
//! rejection the key stays quarantined until the conductor releases it.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::sync::atomic::{AtomicI64, Ordering};

use crate::channel::ChannelIdentity;
use crate::driver::commands::ClientId;
use crate::net::Endpoint;
use crate::timing::{Micros, MonoInstant};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RegistryError {
    #[error("Unable to resolve image for correlationId={0}")]
    UnknownImage(i64),
    #[error("image already exists for {key} (correlationId={existing})")]
    DuplicateImage { key: ImageKey, existing: i64 },
    #[error("illegal image transition {from:?} -> {to:?} for correlationId={correlation_id}")]
    IllegalTransition {
        correlation_id: i64,
        from: ImageState,
        to: ImageState,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ImageState {
    Active,
    RejectRequested,
    /// Absorbing; the image is removed right after reaching it.
    Terminal,
}

/// Publisher identity at a receiving channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ImageKey {
    pub channel: ChannelIdentity,
    pub session_id: i32,
    pub stream_id: i32,
}

impl std::fmt::Display for ImageKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "session={} stream={}", self.session_id, self.stream_id)?;
        if let Some(endpoint) = self.channel.endpoint {
            write!(f, " endpoint={endpoint}")?;
        }
        Ok(())
    }
}

/// A subscription an image is delivered to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Subscriber {
    pub client: ClientId,
    pub subscription_registration_id: i64,
}

#[derive(Debug)]
pub struct Image {
    pub correlation_id: i64,
    pub key: ImageKey,
    /// Receiving endpoint, as seen by the publisher.
    pub source_address: Endpoint,
    pub position: Arc<AtomicI64>,
    pub state: ImageState,
    pub liveness_deadline: MonoInstant<Micros>,
    pub subscribers: Vec<Subscriber>,
}

impl Image {
    #[must_use]
    pub fn new(
        correlation_id: i64,
        key: ImageKey,
        source_address: Endpoint,
        liveness_deadline: MonoInstant<Micros>,
    ) -> Self {
        Self {
            correlation_id,
            key,
            source_address,
            position: Arc::new(AtomicI64::new(0)),
            state: ImageState::Active,
            liveness_deadline,
            subscribers: Vec::new(),
        }
    }

    #[must_use]
    pub fn position(&self) -> i64 {
        self.position.load(Ordering::Acquire)
    }

    /// Positions only move forward.
    pub fn advance_position(&self, position: i64) {
        self.position.fetch_max(position, Ordering::AcqRel);
    }
}

/// Produced when an image reaches [`ImageState::Terminal`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TerminalEvent {
    pub correlation_id: i64,
    pub key: ImageKey,
    pub subscribers: Vec<Subscriber>,
    /// `true` when the image was explicitly rejected.
    pub error_frame_owed: bool,
}

#[derive(Debug, Clone, Copy)]
struct Quarantine {
    correlation_id: i64,
    until: MonoInstant<Micros>,
}

#[derive(Debug, Default)]
pub struct ImageRegistry {
    images: BTreeMap<i64, Image>,
    by_key: HashMap<ImageKey, i64>,
    quarantined: HashMap<ImageKey, Quarantine>,
}

impl ImageRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn find(&self, channel: &ChannelIdentity, session_id: i32, stream_id: i32) -> Option<&Image> {
        let key = ImageKey {
            channel: *channel,
            session_id,
            stream_id,
        };
        self.by_key.get(&key).and_then(|id| self.images.get(id))
    }

    #[must_use]
    pub fn get(&self, correlation_id: i64) -> Option<&Image> {
        self.images.get(&correlation_id)
    }

    pub fn get_mut(&mut self, correlation_id: i64) -> Option<&mut Image> {
        self.images.get_mut(&correlation_id)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.images.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.images.is_empty()
    }

    /// Adds a new image.
    ///
    /// # Errors
    ///
    /// [`RegistryError::DuplicateImage`] if the key already has an image or
    /// is quarantined after a rejection.
    pub fn insert(&mut self, image: Image) -> Result<(), RegistryError> {
        let key = image.key;
        if let Some(&existing) = self.by_key.get(&key) {
            return Err(RegistryError::DuplicateImage { key, existing });
        }
        if let Some(q) = self.quarantined.get(&key) {
            return Err(RegistryError::DuplicateImage {
                key,
                existing: q.correlation_id,
            });
        }
        self.by_key.insert(key, image.correlation_id);
        self.images.insert(image.correlation_id, image);
        Ok(())
    }

    /// Moves an image forward through its lifecycle.
    ///
    /// Returns a [`TerminalEvent`] when the image becomes terminal. The image
    /// stays in the registry until [`remove`](Self::remove).
    ///
    /// # Errors
    ///
    /// [`RegistryError::UnknownImage`] for an absent id,
    /// [`RegistryError::IllegalTransition`] for anything but a forward move.
    pub fn transition(
        &mut self,
        correlation_id: i64,
        to: ImageState,
    ) -> Result<Option<TerminalEvent>, RegistryError> {
        let image = self
            .images
            .get_mut(&correlation_id)
            .ok_or(RegistryError::UnknownImage(correlation_id))?;
        let from = image.state;
        if to <= from {
            return Err(RegistryError::IllegalTransition {
                correlation_id,
                from,
                to,
            });
        }
        image.state = to;
        Ok((to == ImageState::Terminal).then(|| TerminalEvent {
            correlation_id,
            key: image.key,
            subscribers: image.subscribers.clone(),
            error_frame_owed: from == ImageState::RejectRequested,
        }))
    }

    /// Removes an image. Idempotent.
    pub fn remove(&mut self, correlation_id: i64) -> Option<Image> {
        let image = self.images.remove(&correlation_id)?;
        if self.by_key.get(&image.key) == Some(&correlation_id) {
            self.by_key.remove(&image.key);
        }
        Some(image)
    }

    /// Blocks new images for `key` until [`release`](Self::release) is called
    /// with the same `correlation_id`.
    pub fn quarantine(&mut self, key: ImageKey, correlation_id: i64, until: MonoInstant<Micros>) {
        self.quarantined.insert(
            key,
            Quarantine {
                correlation_id,
                until,
            },
        );
    }

    /// Lifts the quarantine placed for `correlation_id`. Returns `false` if
    /// there was none.
    pub fn release(&mut self, correlation_id: i64) -> bool {
        let before = self.quarantined.len();
        self.quarantined.retain(|_, q| q.correlation_id != correlation_id);
        self.quarantined.len() != before
    }

    /// Deadline of the quarantine on `key`, if any.
    #[must_use]
    pub fn quarantined_until(&self, key: &ImageKey) -> Option<MonoInstant<Micros>> {
        self.quarantined.get(key).map(|q| q.until)
    }

    /// Detaches a subscription from every image. Returns the ids of images
    /// left without subscribers.
    pub fn remove_subscriber(&mut self, subscription_registration_id: i64) -> Vec<i64> {
        let mut orphaned = Vec::new();
        for image in self.images.values_mut() {
            let before = image.subscribers.len();
            image
                .subscribers
                .retain(|s| s.subscription_registration_id != subscription_registration_id);
            if before != image.subscribers.len() && image.subscribers.is_empty() {
                orphaned.push(image.correlation_id);
            }
        }
        orphaned
    }
}
