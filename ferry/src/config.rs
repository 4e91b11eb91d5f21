//! Driver and client configuration.
//!
//! Both contexts carry sensible defaults, builder-style setters and a
//! `validate()` step. Environment overrides use `FERRY_*` variables parsed
//! with the helpers in [`parse`].

pub mod parse;

use std::fmt;
use std::num::{NonZeroU64, NonZeroUsize};
use std::sync::Arc;
use std::time::Duration;

use crate::client::PublicationErrorFrameHandler;
use crate::timing::{PowerOfTwo, WheelConfig};
use parse::{ParseError, parse_bool, parse_duration, parse_size64};

pub const IMAGE_LIVENESS_TIMEOUT_ENV: &str = "FERRY_IMAGE_LIVENESS_TIMEOUT";
pub const PUBLICATION_CONNECTION_TIMEOUT_ENV: &str = "FERRY_PUBLICATION_CONNECTION_TIMEOUT";
pub const CLIENT_LIVENESS_TIMEOUT_ENV: &str = "FERRY_CLIENT_LIVENESS_TIMEOUT";
pub const IDLE_SLEEP_ENV: &str = "FERRY_IDLE_SLEEP";
pub const PRINT_CONFIGURATION_ENV: &str = "FERRY_PRINT_CONFIGURATION";
pub const DRIVER_TIMEOUT_ENV: &str = "FERRY_DRIVER_TIMEOUT";
pub const KEEPALIVE_INTERVAL_ENV: &str = "FERRY_KEEPALIVE_INTERVAL";
pub const COMMAND_BUFFER_CAPACITY_ENV: &str = "FERRY_COMMAND_BUFFER_CAPACITY";

const DEFAULT_TIMER_SLOTS: PowerOfTwo = match PowerOfTwo::new(1024) {
    Some(slots) => slots,
    None => panic!("timer slots must be a power of two"),
};

/// Smallest accepted client command buffer.
pub const MIN_COMMAND_BUFFER_CAPACITY: usize = 4 * 1024;

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("{var}={value}: {source}")]
    Env {
        var: &'static str,
        value: String,
        #[source]
        source: ParseError,
    },
    #[error("invalid configuration: {0}")]
    Invalid(&'static str),
}

fn lookup_with<T>(
    lookup: &impl Fn(&str) -> Option<String>,
    var: &'static str,
    parse: impl Fn(&str) -> Result<T, ParseError>,
) -> Result<Option<T>, ConfigError> {
    lookup(var)
        .map(|value| {
            parse(&value).map_err(|source| ConfigError::Env { var, value, source })
        })
        .transpose()
}

/// Driver configuration.
#[derive(Debug, Clone)]
pub struct DriverConfig {
    /// How long an image may go without a heartbeat, and how long a rejected
    /// image blocks a replacement for the same publisher.
    ///
    /// **Default**: 3s
    pub image_liveness_timeout: Duration,

    /// Upper bound for a publication to notice it lost its receivers.
    ///
    /// **Default**: 5s
    pub publication_connection_timeout: Duration,

    /// Clients silent for longer than this are timed out.
    ///
    /// **Default**: 10s
    pub client_liveness_timeout: Duration,

    /// Conductor sleep when a duty cycle did no work.
    ///
    /// **Default**: 1ms
    pub idle_sleep: Duration,

    /// Timer wheel slot count (power of two).
    pub timer_slots: PowerOfTwo,

    /// Timer wheel granularity.
    ///
    /// **Default**: 1ms
    pub timer_tick: Duration,

    /// Maximum number of concurrently armed image timers.
    pub timer_capacity: NonZeroUsize,

    /// Log the effective configuration when the driver starts.
    pub print_configuration: bool,
}

impl Default for DriverConfig {
    fn default() -> Self {
        Self {
            image_liveness_timeout: Duration::from_secs(3),
            publication_connection_timeout: Duration::from_secs(5),
            client_liveness_timeout: Duration::from_secs(10),
            idle_sleep: Duration::from_millis(1),
            timer_slots: DEFAULT_TIMER_SLOTS,
            timer_tick: Duration::from_millis(1),
            timer_capacity: NonZeroUsize::new(4096).unwrap_or(NonZeroUsize::MIN),
            print_configuration: false,
        }
    }
}

impl DriverConfig {
    /// Defaults overridden by any `FERRY_*` variables in the environment.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Env`] if a variable is set but does not parse.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|var| std::env::var(var).ok())
    }

    /// Like [`from_env`](Self::from_env) but reads variables through `lookup`.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Env`] if a variable is set but does not parse.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let mut config = Self::default();
        if let Some(v) = lookup_with(&lookup, IMAGE_LIVENESS_TIMEOUT_ENV, parse_duration)? {
            config.image_liveness_timeout = v;
        }
        if let Some(v) = lookup_with(&lookup, PUBLICATION_CONNECTION_TIMEOUT_ENV, parse_duration)? {
            config.publication_connection_timeout = v;
        }
        if let Some(v) = lookup_with(&lookup, CLIENT_LIVENESS_TIMEOUT_ENV, parse_duration)? {
            config.client_liveness_timeout = v;
        }
        if let Some(v) = lookup_with(&lookup, IDLE_SLEEP_ENV, parse_duration)? {
            config.idle_sleep = v;
        }
        if let Some(v) = lookup_with(&lookup, PRINT_CONFIGURATION_ENV, parse_bool)? {
            config.print_configuration = v;
        }
        Ok(config)
    }

    #[must_use]
    pub const fn with_image_liveness_timeout(mut self, timeout: Duration) -> Self {
        self.image_liveness_timeout = timeout;
        self
    }

    #[must_use]
    pub const fn with_publication_connection_timeout(mut self, timeout: Duration) -> Self {
        self.publication_connection_timeout = timeout;
        self
    }

    #[must_use]
    pub const fn with_client_liveness_timeout(mut self, timeout: Duration) -> Self {
        self.client_liveness_timeout = timeout;
        self
    }

    #[must_use]
    pub const fn with_idle_sleep(mut self, sleep: Duration) -> Self {
        self.idle_sleep = sleep;
        self
    }

    /// Checks cross-field constraints.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Invalid`] naming the first violated constraint.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.image_liveness_timeout.is_zero() {
            return Err(ConfigError::Invalid("image_liveness_timeout must be > 0"));
        }
        if self.image_liveness_timeout > self.publication_connection_timeout {
            return Err(ConfigError::Invalid(
                "image_liveness_timeout must not exceed publication_connection_timeout",
            ));
        }
        if self.client_liveness_timeout.is_zero() {
            return Err(ConfigError::Invalid("client_liveness_timeout must be > 0"));
        }
        if self.timer_tick.is_zero() {
            return Err(ConfigError::Invalid("timer_tick must be > 0"));
        }
        if self.timer_tick > self.image_liveness_timeout {
            return Err(ConfigError::Invalid(
                "timer_tick must not exceed image_liveness_timeout",
            ));
        }
        Ok(())
    }

    /// Wheel settings in microseconds, the conductor's clock unit.
    pub(crate) fn wheel_config(&self) -> WheelConfig {
        let tick_us = u64::try_from(self.timer_tick.as_micros()).unwrap_or(u64::MAX);
        WheelConfig {
            slots: self.timer_slots,
            tick: NonZeroU64::new(tick_us).unwrap_or(NonZeroU64::MIN),
            capacity: self.timer_capacity,
        }
    }
}

/// Client configuration.
#[derive(Clone)]
pub struct ClientConfig {
    /// Bound on waiting for the driver (connect handshake, command responses).
    ///
    /// **Default**: 10s
    pub driver_timeout: Duration,

    /// How often `poll()` tells the driver the client is alive.
    ///
    /// **Default**: 500ms
    pub keepalive_interval: Duration,

    /// Size of the local buffer commands are encoded into. The longest single
    /// command is an eighth of this.
    ///
    /// **Default**: 1 MiB
    pub command_buffer_capacity: usize,

    /// Receives error frames for this client's publications.
    pub error_frame_handler: Option<Arc<dyn PublicationErrorFrameHandler>>,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            driver_timeout: Duration::from_secs(10),
            keepalive_interval: Duration::from_millis(500),
            command_buffer_capacity: 1024 * 1024,
            error_frame_handler: None,
        }
    }
}

impl fmt::Debug for ClientConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientConfig")
            .field("driver_timeout", &self.driver_timeout)
            .field("keepalive_interval", &self.keepalive_interval)
            .field("command_buffer_capacity", &self.command_buffer_capacity)
            .field("error_frame_handler", &self.error_frame_handler.is_some())
            .finish()
    }
}

impl ClientConfig {
    /// Defaults overridden by any `FERRY_*` variables in the environment.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Env`] if a variable is set but does not parse.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|var| std::env::var(var).ok())
    }

    /// Like [`from_env`](Self::from_env) but reads variables through `lookup`.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Env`] if a variable is set but does not parse.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let mut config = Self::default();
        if let Some(v) = lookup_with(&lookup, DRIVER_TIMEOUT_ENV, parse_duration)? {
            config.driver_timeout = v;
        }
        if let Some(v) = lookup_with(&lookup, KEEPALIVE_INTERVAL_ENV, parse_duration)? {
            config.keepalive_interval = v;
        }
        if let Some(v) = lookup_with(&lookup, COMMAND_BUFFER_CAPACITY_ENV, parse_size64)? {
            config.command_buffer_capacity = usize::try_from(v).unwrap_or(usize::MAX);
        }
        Ok(config)
    }

    #[must_use]
    pub const fn with_driver_timeout(mut self, timeout: Duration) -> Self {
        self.driver_timeout = timeout;
        self
    }

    #[must_use]
    pub const fn with_keepalive_interval(mut self, interval: Duration) -> Self {
        self.keepalive_interval = interval;
        self
    }

    #[must_use]
    pub const fn with_command_buffer_capacity(mut self, capacity: usize) -> Self {
        self.command_buffer_capacity = capacity;
        self
    }

    /// Installs the handler called for each error frame received by this client.
    #[must_use]
    pub fn with_error_frame_handler(
        mut self,
        handler: impl PublicationErrorFrameHandler + 'static,
    ) -> Self {
        self.error_frame_handler = Some(Arc::new(handler));
        self
    }

    /// Longest command, in bytes, that fits the local command buffer.
    #[must_use]
    pub const fn max_command_length(&self) -> usize {
        self.command_buffer_capacity / 8
    }

    /// # Errors
    ///
    /// Returns [`ConfigError::Invalid`] naming the first violated constraint.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.driver_timeout.is_zero() {
            return Err(ConfigError::Invalid("driver_timeout must be > 0"));
        }
        if self.keepalive_interval.is_zero() {
            return Err(ConfigError::Invalid("keepalive_interval must be > 0"));
        }
        if self.command_buffer_capacity < MIN_COMMAND_BUFFER_CAPACITY {
            return Err(ConfigError::Invalid("command_buffer_capacity below 4 KiB"));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| ((*k).to_owned(), (*v).to_owned()))
            .collect();
        move |k| map.get(k).cloned()
    }

    #[test]
    fn driver_defaults_are_valid() {
        DriverConfig::default().validate().unwrap();
    }

    #[test]
    fn driver_env_overrides() {
        let config = DriverConfig::from_lookup(lookup(&[
            (IMAGE_LIVENESS_TIMEOUT_ENV, "1234ms"),
            (CLIENT_LIVENESS_TIMEOUT_ENV, "2s"),
            (PRINT_CONFIGURATION_ENV, "yes"),
        ]))
        .unwrap();
        assert_eq!(config.image_liveness_timeout, Duration::from_millis(1234));
        assert_eq!(config.client_liveness_timeout, Duration::from_secs(2));
        assert_eq!(config.publication_connection_timeout, Duration::from_secs(5));
        assert!(config.print_configuration);
    }

    #[test]
    fn driver_env_parse_failure_names_variable() {
        let err = DriverConfig::from_lookup(lookup(&[(IDLE_SLEEP_ENV, "soon")])).unwrap_err();
        assert!(matches!(err, ConfigError::Env { var: IDLE_SLEEP_ENV, .. }));
        assert!(err.to_string().starts_with("FERRY_IDLE_SLEEP=soon"));
    }

    #[test]
    fn liveness_may_not_exceed_connection_timeout() {
        let config = DriverConfig::default()
            .with_image_liveness_timeout(Duration::from_secs(6))
            .with_publication_connection_timeout(Duration::from_secs(5));
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn wheel_config_uses_micros() {
        let wheel = DriverConfig::default().wheel_config();
        assert_eq!(wheel.tick.get(), 1_000);
        assert_eq!(wheel.slots.get(), 1024);
    }

    #[test]
    fn client_command_length_is_eighth_of_buffer() {
        let config = ClientConfig::default();
        assert_eq!(config.max_command_length(), 128 * 1024);
        config.validate().unwrap();

        let config = ClientConfig::from_lookup(lookup(&[(COMMAND_BUFFER_CAPACITY_ENV, "64k")])).unwrap();
        assert_eq!(config.max_command_length(), 8 * 1024);
    }

    #[test]
    fn client_rejects_tiny_buffer() {
        let config = ClientConfig::default().with_command_buffer_capacity(1024);
        assert!(config.validate().is_err());
    }

    #[test]
    fn zero_client_durations_are_invalid() {
        // Busy spinning is allowed.
        assert!(DriverConfig::default().with_idle_sleep(Duration::ZERO).validate().is_ok());
        let client = ClientConfig::default().with_driver_timeout(Duration::ZERO);
        assert!(matches!(client.validate(), Err(ConfigError::Invalid(_))));
        let client = ClientConfig::default().with_keepalive_interval(Duration::ZERO);
        assert!(matches!(client.validate(), Err(ConfigError::Invalid(_))));
    }
}
