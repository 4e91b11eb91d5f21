//! Client-side subscription and image handles.
//!
//! Availability changes are not delivered through callbacks. The owning
//! [`Client`](crate::client::Client) queues them on the subscription during
//! its `poll()`, and the subscription applies them on its own `poll()` or
//! [`take_events`](Subscription::take_events).

use std::cell::RefCell;
use std::collections::VecDeque;
use std::rc::Rc;
use std::sync::Arc;
use std::sync::atomic::{AtomicI64, Ordering};

use crate::net::Endpoint;

/// One publisher's stream as received by a subscription.
#[derive(Debug, Clone)]
pub struct Image {
    correlation_id: i64,
    subscription_registration_id: i64,
    session_id: i32,
    stream_id: i32,
    source_address: Endpoint,
    position: Arc<AtomicI64>,
}

impl Image {
    pub(crate) fn new(
        correlation_id: i64,
        subscription_registration_id: i64,
        session_id: i32,
        stream_id: i32,
        source_address: Endpoint,
        position: Arc<AtomicI64>,
    ) -> Self {
        Self {
            correlation_id,
            subscription_registration_id,
            session_id,
            stream_id,
            source_address,
            position,
        }
    }

    /// Unique per image; a replacement for the same publisher gets a new one.
    #[must_use]
    pub const fn correlation_id(&self) -> i64 {
        self.correlation_id
    }

    #[must_use]
    pub const fn subscription_registration_id(&self) -> i64 {
        self.subscription_registration_id
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
    pub const fn source_address(&self) -> Endpoint {
        self.source_address
    }

    /// Position received so far.
    #[must_use]
    pub fn position(&self) -> i64 {
        self.position.load(Ordering::Acquire)
    }
}

/// Availability change observed by a subscription.
#[derive(Debug, Clone)]
pub enum ImageEvent {
    Available(Image),
    Unavailable(Image),
}

/// What the client hands over before the subscription applies it.
#[derive(Debug)]
pub(crate) enum PendingEvent {
    Available(Image),
    Unavailable(i64),
}

#[derive(Debug)]
struct Tracked {
    image: Image,
    /// Position as of the last `poll()`.
    consumed: i64,
}

/// A client's subscription.
#[derive(Debug)]
pub struct Subscription {
    registration_id: i64,
    channel: String,
    stream_id: i32,
    pending: Rc<RefCell<VecDeque<PendingEvent>>>,
    images: Vec<Tracked>,
    events: Vec<ImageEvent>,
}

impl Subscription {
    pub(crate) fn new(
        registration_id: i64,
        channel: String,
        stream_id: i32,
        pending: Rc<RefCell<VecDeque<PendingEvent>>>,
    ) -> Self {
        Self {
            registration_id,
            channel,
            stream_id,
            pending,
            images: Vec::new(),
            events: Vec::new(),
        }
    }

    /// Applies availability changes and consumes whatever the images received
    /// since the last call. Returns the number of images that advanced.
    pub fn poll(&mut self) -> usize {
        self.apply_pending();
        let mut advanced = 0;
        for tracked in &mut self.images {
            let position = tracked.image.position();
            if position > tracked.consumed {
                tracked.consumed = position;
                advanced += 1;
            }
        }
        advanced
    }

    /// Availability changes since the previous call, oldest first.
    pub fn take_events(&mut self) -> Vec<ImageEvent> {
        self.apply_pending();
        std::mem::take(&mut self.events)
    }

    fn apply_pending(&mut self) {
        let drained: Vec<PendingEvent> = self.pending.borrow_mut().drain(..).collect();
        for event in drained {
            match event {
                PendingEvent::Available(image) => {
                    if self
                        .images
                        .iter()
                        .any(|t| t.image.correlation_id == image.correlation_id)
                    {
                        continue;
                    }
                    self.events.push(ImageEvent::Available(image.clone()));
                    self.images.push(Tracked { image, consumed: 0 });
                }
                PendingEvent::Unavailable(correlation_id) => {
                    if let Some(idx) = self
                        .images
                        .iter()
                        .position(|t| t.image.correlation_id == correlation_id)
                    {
                        let tracked = self.images.remove(idx);
                        self.events.push(ImageEvent::Unavailable(tracked.image));
                    }
                }
            }
        }
    }

    #[must_use]
    pub const fn registration_id(&self) -> i64 {
        self.registration_id
    }

    #[must_use]
    pub fn channel(&self) -> &str {
        &self.channel
    }

    #[must_use]
    pub const fn stream_id(&self) -> i32 {
        self.stream_id
    }

    /// Whether at least one image is available, as of the last poll.
    #[must_use]
    pub fn is_connected(&self) -> bool {
        !self.images.is_empty()
    }

    #[must_use]
    pub fn image_count(&self) -> usize {
        self.images.len()
    }

    #[must_use]
    pub fn image_at(&self, index: usize) -> Option<&Image> {
        self.images.get(index).map(|t| &t.image)
    }

    #[must_use]
    pub fn image_by_correlation_id(&self, correlation_id: i64) -> Option<&Image> {
        self.images
            .iter()
            .map(|t| &t.image)
            .find(|image| image.correlation_id == correlation_id)
    }

    pub fn images(&self) -> impl Iterator<Item = &Image> {
        self.images.iter().map(|t| &t.image)
    }
}
