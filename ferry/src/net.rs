//! Network addressing primitives.
//!
//! The driver never opens sockets; endpoints only identify where a stream is
//! sent from or to, so that images and publications can be matched.

pub mod endpoint;

pub use endpoint::{Endpoint, EndpointError};
