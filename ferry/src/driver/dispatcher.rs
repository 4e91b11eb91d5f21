//! Error frames for rejected images.
//!
//! A rejection produces one [`ErrorFrame`] per distinct client holding a
//! publication that transmits to the rejected image. Frames are owned values;
//! nothing in them refers back to conductor state.

use std::collections::BTreeSet;

use crate::driver::commands::{ClientId, ErrorCode, NULL_VALUE};
use crate::driver::image::Image;
use crate::driver::publication::NetworkPublication;
use crate::net::Endpoint;

/// Longest rejection reason, in bytes, that fits an error frame.
pub const MAX_ERROR_MESSAGE_LENGTH: usize = 512;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DispatchError {
    #[error("error message too long: {length} bytes exceeds max of {max}")]
    MessageTooLong { length: usize, max: usize },
}

impl DispatchError {
    #[must_use]
    pub const fn error_code(&self) -> ErrorCode {
        match self {
            Self::MessageTooLong { .. } => ErrorCode::GenericError,
        }
    }
}

/// Error report delivered to the owner of a publication.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ErrorFrame {
    pub error_code: ErrorCode,
    pub error_message: String,
    /// Original registration id of the affected publication.
    pub registration_id: i64,
    /// Set when the image was reached through a manual destination.
    pub destination_registration_id: Option<i64>,
    pub group_tag: Option<i64>,
    /// Receiver address as seen by the publisher.
    pub source_address: Endpoint,
    pub session_id: i32,
    pub stream_id: i32,
}

impl ErrorFrame {
    /// Destination id with absence mapped to [`NULL_VALUE`].
    #[must_use]
    pub fn destination_registration_id_or_null(&self) -> i64 {
        self.destination_registration_id.unwrap_or(NULL_VALUE)
    }
}

/// Result of fanning out one rejection.
#[derive(Debug, Default)]
pub struct Dispatch {
    pub frames: Vec<(ClientId, ErrorFrame)>,
    /// Registration ids of publications that transmit to the image.
    pub matched_publications: Vec<i64>,
}

/// Checks a rejection reason against the frame limit.
///
/// # Errors
///
/// [`DispatchError::MessageTooLong`] past [`MAX_ERROR_MESSAGE_LENGTH`] bytes.
pub fn validate_reason(reason: &str) -> Result<(), DispatchError> {
    if reason.len() > MAX_ERROR_MESSAGE_LENGTH {
        return Err(DispatchError::MessageTooLong {
            length: reason.len(),
            max: MAX_ERROR_MESSAGE_LENGTH,
        });
    }
    Ok(())
}

/// Builds the frames for a rejected `image`.
///
/// The reason must already have passed [`validate_reason`].
pub fn dispatch<'a>(
    image: &Image,
    reason: &str,
    publications: impl IntoIterator<Item = &'a NetworkPublication>,
) -> Dispatch {
    let mut out = Dispatch::default();
    let mut notified = BTreeSet::new();
    let key = &image.key;

    for publication in publications {
        let core = &publication.core;
        if core.session_id != key.session_id || core.stream_id != key.stream_id {
            continue;
        }
        let Some(target) = publication.target_for(&key.channel) else {
            continue;
        };
        out.matched_publications.push(core.registration_id);

        let frame = ErrorFrame {
            error_code: ErrorCode::ImageRejected,
            error_message: reason.to_owned(),
            registration_id: core.registration_id,
            destination_registration_id: target.destination(),
            group_tag: key.channel.group_tag.or_else(|| publication.channel.group_tag()),
            source_address: image.source_address,
            session_id: key.session_id,
            stream_id: key.stream_id,
        };
        for owner in &core.owners {
            if notified.insert(owner.client) {
                out.frames.push((owner.client, frame.clone()));
            }
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::ChannelUri;
    use crate::driver::image::ImageKey;
    use crate::driver::publication::{Destination, Owner, PublicationCore};
    use crate::timing::MonoInstant;

    fn image_at(channel: &str, session_id: i32) -> Image {
        let identity = ChannelUri::parse(channel).unwrap().identity();
        Image::new(
            1000,
            ImageKey {
                channel: identity,
                session_id,
                stream_id: 10,
            },
            identity.endpoint.unwrap(),
            MonoInstant::new(0),
        )
    }

    fn publication(channel: &str, registration_id: i64, session_id: i32, owners: &[ClientId]) -> NetworkPublication {
        let mut core = PublicationCore::new(registration_id, session_id, 10, false);
        for (i, client) in owners.iter().enumerate() {
            core.owners.push(Owner {
                client: *client,
                registration_id: registration_id + i64::try_from(i).unwrap(),
            });
        }
        NetworkPublication::new(core, ChannelUri::parse(channel).unwrap())
    }

    #[test]
    fn reason_limits() {
        validate_reason(&"x".repeat(MAX_ERROR_MESSAGE_LENGTH)).unwrap();
        let err = validate_reason(&"x".repeat(1024)).unwrap_err();
        assert_eq!(
            err,
            DispatchError::MessageTooLong {
                length: 1024,
                max: MAX_ERROR_MESSAGE_LENGTH
            }
        );
        assert_eq!(err.error_code(), ErrorCode::GenericError);
    }

    #[test]
    fn one_frame_per_distinct_client() {
        let (a, b) = (ClientId::generate(), ClientId::generate());
        let image = image_at("ferry:udp?endpoint=localhost:10000", 7);
        let shared = publication("ferry:udp?endpoint=localhost:10000", 1, 7, &[a, b, a]);

        let dispatch = dispatch(&image, "Needs to be closed", [&shared]);
        assert_eq!(dispatch.frames.len(), 2);
        assert_eq!(dispatch.matched_publications, vec![1]);
        for (_, frame) in &dispatch.frames {
            assert_eq!(frame.registration_id, 1);
            assert_eq!(frame.error_code, ErrorCode::ImageRejected);
            assert_eq!(frame.error_message, "Needs to be closed");
            assert_eq!(frame.destination_registration_id_or_null(), NULL_VALUE);
            assert_eq!(frame.source_address, Endpoint::localhost(10000));
        }
    }

    #[test]
    fn unrelated_publications_get_nothing() {
        let (a, b, c) = (ClientId::generate(), ClientId::generate(), ClientId::generate());
        let image = image_at("ferry:udp?endpoint=localhost:10000", 7);
        let other_session = publication("ferry:udp?endpoint=localhost:10000", 1, 8, &[a]);
        let other_endpoint = publication("ferry:udp?endpoint=localhost:10001", 2, 7, &[b]);
        let matching = publication("ferry:udp?endpoint=localhost:10000", 3, 7, &[c]);

        let dispatch = dispatch(&image, "bye", [&other_session, &other_endpoint, &matching]);
        assert_eq!(dispatch.frames.len(), 1);
        assert_eq!(dispatch.frames[0].0, c);
        assert_eq!(dispatch.matched_publications, vec![3]);
    }

    #[test]
    fn manual_destination_attribution() {
        let a = ClientId::generate();
        let image = image_at("ferry:udp?endpoint=localhost:10000", 7);
        let mut mdc = publication("ferry:udp?control-mode=manual", 1, 7, &[a]);
        mdc.destinations.push(Destination {
            registration_id: 40,
            endpoint: Endpoint::localhost(10001),
        });
        mdc.destinations.push(Destination {
            registration_id: 41,
            endpoint: Endpoint::localhost(10000),
        });

        let dispatch = dispatch(&image, "bye", [&mdc]);
        assert_eq!(dispatch.frames[0].1.destination_registration_id, Some(41));
    }

    #[test]
    fn group_tag_prefers_receiver_then_flow_control() {
        let a = ClientId::generate();
        let dynamic = publication(
            "ferry:udp?control-mode=dynamic|control=127.0.0.1:10000|fc=tagged,g:1001",
            1,
            7,
            &[a],
        );

        let tagged = image_at("ferry:udp?control=127.0.0.1:10000|endpoint=127.0.0.1:10001|gtag=2002", 7);
        let frame = &dispatch(&tagged, "bye", [&dynamic]).frames[0].1;
        assert_eq!(frame.group_tag, Some(2002));
        assert_eq!(frame.source_address, "127.0.0.1:10001".parse().unwrap());

        let untagged = image_at("ferry:udp?control=127.0.0.1:10000|endpoint=127.0.0.1:10001", 7);
        let frame = &dispatch(&untagged, "bye", [&dynamic]).frames[0].1;
        assert_eq!(frame.group_tag, Some(1001));
    }
}
