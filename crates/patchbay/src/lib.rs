//! Patchbay
//!
//! Device hub application: configuration, logging and the serial and HTTP
//! transports around [`patchbay_core`].

pub mod config;
pub mod http;
pub mod logging;
pub mod serial;

pub use config::{ConfigError, HubConfig};
