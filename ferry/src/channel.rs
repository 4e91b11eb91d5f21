//! Channel URIs.
//!
//! ```text
//! ferry:udp?endpoint=localhost:10000
//! ferry:udp?control=localhost:10000|control-mode=dynamic|fc=tagged,g:1001
//! ferry:udp?control-mode=manual
//! ferry:ipc
//! ```
//!
//! Parameters are `key=value` pairs separated by `|`. Known keys are parsed
//! into typed fields; anything else is kept verbatim and otherwise ignored.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use crate::net::{Endpoint, EndpointError};

const SCHEME: &str = "ferry:";

pub const ENDPOINT_PARAM: &str = "endpoint";
pub const CONTROL_PARAM: &str = "control";
pub const CONTROL_MODE_PARAM: &str = "control-mode";
pub const GROUP_TAG_PARAM: &str = "gtag";
pub const FLOW_CONTROL_PARAM: &str = "fc";

/// The IPC channel string.
pub const IPC_CHANNEL: &str = "ferry:ipc";

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ChannelError {
    #[error("channel must start with 'ferry:': {0}")]
    MissingScheme(String),
    #[error("unknown media '{0}'")]
    UnknownMedia(String),
    #[error("malformed parameter '{0}', expected key=value")]
    MalformedParam(String),
    #[error("invalid value for '{key}': {value}")]
    InvalidValue { key: &'static str, value: String },
    #[error("invalid address for '{key}': {source}")]
    Address {
        key: &'static str,
        #[source]
        source: EndpointError,
    },
    #[error("{0}")]
    Unsupported(&'static str),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Media {
    Udp,
    Ipc,
}

/// Multi-destination mode of a publication channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ControlMode {
    /// Destinations are added and removed explicitly by the client.
    Manual,
    /// Receivers find the publication through its control address.
    Dynamic,
}

/// A parsed channel string.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelUri {
    media: Media,
    endpoint: Option<Endpoint>,
    control: Option<Endpoint>,
    control_mode: Option<ControlMode>,
    gtag: Option<i64>,
    fc_group_tag: Option<i64>,
    params: BTreeMap<String, String>,
}

/// The parts of a channel that identify where images are received.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ChannelIdentity {
    pub media: Media,
    pub endpoint: Option<Endpoint>,
    pub control: Option<Endpoint>,
    pub group_tag: Option<i64>,
}

impl ChannelUri {
    /// Parses a channel string.
    ///
    /// # Errors
    ///
    /// Returns [`ChannelError`] for an unknown scheme or media, a parameter
    /// without `=`, or a known parameter whose value does not parse.
    pub fn parse(s: &str) -> Result<Self, ChannelError> {
        let rest = s
            .strip_prefix(SCHEME)
            .ok_or_else(|| ChannelError::MissingScheme(s.to_owned()))?;
        let (media, query) = rest.split_once('?').unwrap_or((rest, ""));
        let media = match media {
            "udp" => Media::Udp,
            "ipc" => Media::Ipc,
            other => return Err(ChannelError::UnknownMedia(other.to_owned())),
        };

        let mut uri = Self {
            media,
            endpoint: None,
            control: None,
            control_mode: None,
            gtag: None,
            fc_group_tag: None,
            params: BTreeMap::new(),
        };

        for pair in query.split('|').filter(|p| !p.is_empty()) {
            let (key, value) = pair
                .split_once('=')
                .ok_or_else(|| ChannelError::MalformedParam(pair.to_owned()))?;
            match key {
                ENDPOINT_PARAM => uri.endpoint = Some(parse_address(ENDPOINT_PARAM, value)?),
                CONTROL_PARAM => uri.control = Some(parse_address(CONTROL_PARAM, value)?),
                CONTROL_MODE_PARAM => {
                    uri.control_mode = Some(match value {
                        "manual" => ControlMode::Manual,
                        "dynamic" => ControlMode::Dynamic,
                        _ => return Err(invalid(CONTROL_MODE_PARAM, value)),
                    });
                }
                GROUP_TAG_PARAM => {
                    uri.gtag = Some(value.parse().map_err(|_| invalid(GROUP_TAG_PARAM, value))?);
                }
                FLOW_CONTROL_PARAM => uri.fc_group_tag = parse_fc_group_tag(value)?,
                _ => {}
            }
            uri.params.insert(key.to_owned(), value.to_owned());
        }
        Ok(uri)
    }

    #[must_use]
    pub const fn media(&self) -> Media {
        self.media
    }

    #[must_use]
    pub const fn is_ipc(&self) -> bool {
        matches!(self.media, Media::Ipc)
    }

    #[must_use]
    pub const fn endpoint(&self) -> Option<Endpoint> {
        self.endpoint
    }

    #[must_use]
    pub const fn control(&self) -> Option<Endpoint> {
        self.control
    }

    #[must_use]
    pub const fn control_mode(&self) -> Option<ControlMode> {
        self.control_mode
    }

    /// Group tag from `gtag=`, falling back to the `g:` part of `fc=`.
    #[must_use]
    pub fn group_tag(&self) -> Option<i64> {
        self.gtag.or(self.fc_group_tag)
    }

    /// Raw value of any parameter, including unrecognised ones.
    #[must_use]
    pub fn param(&self, key: &str) -> Option<&str> {
        self.params.get(key).map(String::as_str)
    }

    #[must_use]
    pub fn identity(&self) -> ChannelIdentity {
        ChannelIdentity {
            media: self.media,
            endpoint: self.endpoint,
            control: self.control,
            group_tag: self.gtag,
        }
    }

    /// Checks the channel can back a publication.
    ///
    /// # Errors
    ///
    /// UDP publications need an `endpoint`, `control-mode=manual`, or
    /// `control-mode=dynamic` together with a `control` address.
    pub fn validate_for_publication(&self) -> Result<(), ChannelError> {
        if self.is_ipc() {
            return Ok(());
        }
        match self.control_mode {
            Some(ControlMode::Manual) => Ok(()),
            Some(ControlMode::Dynamic) if self.control.is_none() => Err(
                ChannelError::Unsupported("control-mode=dynamic requires a control address"),
            ),
            Some(ControlMode::Dynamic) => Ok(()),
            None if self.endpoint.is_none() => Err(ChannelError::Unsupported(
                "udp publication requires an endpoint or a control-mode",
            )),
            None => Ok(()),
        }
    }

    /// Checks the channel can back a subscription.
    ///
    /// # Errors
    ///
    /// UDP subscriptions need an `endpoint` and must not set `control-mode`.
    pub fn validate_for_subscription(&self) -> Result<(), ChannelError> {
        if self.is_ipc() {
            return Ok(());
        }
        if self.control_mode.is_some() {
            return Err(ChannelError::Unsupported(
                "control-mode is only valid on publications",
            ));
        }
        if self.endpoint.is_none() {
            return Err(ChannelError::Unsupported(
                "udp subscription requires an endpoint",
            ));
        }
        Ok(())
    }

    /// Checks the channel can be added as a manual destination.
    ///
    /// # Errors
    ///
    /// Destinations must be UDP with an `endpoint`.
    pub fn validate_for_destination(&self) -> Result<(), ChannelError> {
        if self.is_ipc() || self.endpoint.is_none() {
            return Err(ChannelError::Unsupported(
                "destination requires a udp endpoint",
            ));
        }
        Ok(())
    }
}

impl FromStr for ChannelUri {
    type Err = ChannelError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl fmt::Display for ChannelUri {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let media = match self.media {
            Media::Udp => "udp",
            Media::Ipc => "ipc",
        };
        write!(f, "{SCHEME}{media}")?;
        for (i, (k, v)) in self.params.iter().enumerate() {
            let sep = if i == 0 { '?' } else { '|' };
            write!(f, "{sep}{k}={v}")?;
        }
        Ok(())
    }
}

fn invalid(key: &'static str, value: &str) -> ChannelError {
    ChannelError::InvalidValue {
        key,
        value: value.to_owned(),
    }
}

fn parse_address(key: &'static str, value: &str) -> Result<Endpoint, ChannelError> {
    value
        .parse()
        .map_err(|source| ChannelError::Address { key, source })
}

/// Extracts `<tag>` from `tagged,g:<tag>[/<min>]`; other strategies carry none.
fn parse_fc_group_tag(value: &str) -> Result<Option<i64>, ChannelError> {
    let Some(group) = value.split(',').find_map(|part| part.strip_prefix("g:")) else {
        return Ok(None);
    };
    let tag = group.split_once('/').map_or(group, |(tag, _)| tag);
    tag.parse()
        .map(Some)
        .map_err(|_| invalid(FLOW_CONTROL_PARAM, value))
}
