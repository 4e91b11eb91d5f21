//! In-process media driver.
//!
//! # Architecture
//!
//! A single conductor thread owns every table. Clients talk to it over two
//! kinds of bounded queue:
//!
//! ```text
//! client ──ClientMessage──> [mpsc inbox] ──> conductor
//! client <──DriverMessage── [spsc, one per client] <──┘
//! ```
//!
//! Commands are answered in the order they were accepted. Notifications the
//! conductor raises on its own (available/unavailable images, error frames)
//! share the same per-client queue, so a client sees an image's error frame
//! before it sees the image go away.
//!
//! # Images and rejection
//!
//! Publications reach matching subscriptions through a loopback media stage
//! that runs once per duty cycle; each pass counts as a heartbeat and keeps
//! the image alive. A subscriber may reject an image: the conductor answers
//! the caller, sends one error frame to every client owning a publication that
//! transmits to the image, then retires the image. The same publisher cannot
//! produce a new image at that receiver until the image liveness timeout has
//! passed.
//!
//! # Example
//!
//! ```
//! use ferry::config::{ClientConfig, DriverConfig};
//! use ferry::driver::Driver;
//! use ferry::client::Client;
//!
//! let driver = Driver::spawn(DriverConfig::default())?;
//! let client = Client::connect(&driver.connector(), ClientConfig::default())?;
//! // ... add publications and subscriptions, poll ...
//! client.close();
//! driver.shutdown();
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```

pub mod clients;
pub mod commands;
pub mod conductor;
pub mod dispatcher;
pub mod image;
pub mod liveness;
pub mod publication;

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::thread::{self, JoinHandle};

use crate::config::{ConfigError, DriverConfig};
use crate::counters::SystemCounters;
use crate::error_log::ErrorLog;
use crate::queue::mpsc;
use crate::timing::{Micros, Now};
use crate::trace::{debug, info};

use commands::{COMMAND_QUEUE_CAPACITY, ClientMessage};
use conductor::Conductor;

/// Error spawning the driver.
#[derive(Debug, thiserror::Error)]
pub enum DriverError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    /// Failed to start the conductor thread.
    #[error("failed to spawn conductor thread: {0}")]
    Spawn(std::io::Error),
}

/// What a client needs to reach a running driver. Cheap to clone.
#[derive(Clone)]
pub struct DriverConnector {
    pub(crate) inbox: mpsc::Producer<ClientMessage, COMMAND_QUEUE_CAPACITY>,
    pub(crate) counters: Arc<SystemCounters>,
    pub(crate) ids: Arc<AtomicI64>,
}

impl DriverConnector {
    /// Next correlation id, unique across the driver and all its clients.
    pub(crate) fn next_correlation_id(&self) -> i64 {
        self.ids.fetch_add(1, Ordering::AcqRel)
    }
}

impl std::fmt::Debug for DriverConnector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DriverConnector").finish_non_exhaustive()
    }
}

/// Handle to a running driver.
///
/// Dropping the handle signals shutdown but does not wait for the conductor.
/// Use [`Driver::shutdown`] to join it.
pub struct Driver {
    shutdown_flag: Arc<AtomicBool>,
    conductor_handle: Option<JoinHandle<()>>,
    connector: DriverConnector,
    error_log: Arc<ErrorLog>,
}

impl Driver {
    /// Validates `config` and starts the conductor thread.
    ///
    /// # Errors
    ///
    /// [`DriverError::Config`] if the configuration is inconsistent,
    /// [`DriverError::Spawn`] if the thread cannot be created.
    pub fn spawn(config: DriverConfig) -> Result<Self, DriverError> {
        config.validate()?;
        if config.print_configuration {
            info!(config = ?config, "driver configuration");
        }
        info!(
            image_liveness_timeout_ms = config.image_liveness_timeout.as_millis() as u64,
            client_liveness_timeout_ms = config.client_liveness_timeout.as_millis() as u64,
            "driver starting"
        );

        let (inbox, consumer) = mpsc::channel::<ClientMessage, COMMAND_QUEUE_CAPACITY>();
        let counters = Arc::new(SystemCounters::new());
        let error_log = Arc::new(ErrorLog::new(Arc::clone(&counters)));
        let ids = Arc::new(AtomicI64::new(1));
        let shutdown_flag = Arc::new(AtomicBool::new(false));

        let mut conductor = Conductor::new(
            &config,
            consumer,
            Arc::clone(&counters),
            Arc::clone(&error_log),
            Arc::clone(&ids),
            Micros::now(),
        );
        let flag = Arc::clone(&shutdown_flag);
        let idle_sleep = config.idle_sleep;

        debug!("spawning conductor thread");
        let conductor_handle = thread::Builder::new()
            .name("ferry-conductor".into())
            .spawn(move || {
                info!("conductor thread started");
                while !flag.load(Ordering::Relaxed) {
                    if conductor.do_work(Micros::now()) == 0 {
                        thread::sleep(idle_sleep);
                    }
                }
                conductor.on_close();
                info!("conductor thread exiting");
            })
            .map_err(DriverError::Spawn)?;

        info!("driver started");
        Ok(Self {
            shutdown_flag,
            conductor_handle: Some(conductor_handle),
            connector: DriverConnector {
                inbox,
                counters,
                ids,
            },
            error_log,
        })
    }

    /// Handle for [`Client::connect`](crate::client::Client::connect).
    #[must_use]
    pub fn connector(&self) -> DriverConnector {
        self.connector.clone()
    }

    #[must_use]
    pub fn counters(&self) -> &SystemCounters {
        &self.connector.counters
    }

    /// Distinct errors the driver has observed, such as image rejections.
    #[must_use]
    pub fn error_log(&self) -> &ErrorLog {
        &self.error_log
    }

    /// Signals shutdown and waits for the conductor to exit.
    ///
    /// Connected clients receive a shutdown notification.
    pub fn shutdown(mut self) {
        info!("driver shutdown initiated");
        self.shutdown_flag.store(true, Ordering::Relaxed);
        if let Some(handle) = self.conductor_handle.take() {
            debug!("waiting for conductor thread to exit");
            let _ = handle.join();
        }
        info!("driver shutdown complete");
    }
}

impl Drop for Driver {
    fn drop(&mut self) {
        self.shutdown_flag.store(true, Ordering::Relaxed);
    }
}
