//! # rfqlink Core Library
//!
//! Session engine for talking to an RFQ test controller over a serial link.

#![warn(missing_docs)]
#![cfg_attr(docsrs, feature(doc_cfg))]

//!
//! This library provides:
//! - Connection lifecycle management (open, handshake, close)
//! - A background frame reader that splits the CR-delimited byte stream
//! - The transmit path for ASCII commands
//! - An ordered event stream for the presentation layer
//! - A simulated controller for running without hardware
//!
//! ## Example
//!
//! ```rust,ignore
//! use rfqlink_core::prelude::*;
//!
//! let mut link = ConnectionManager::new(LinkConfig::default());
//! link.open(PortDescriptor::new("/dev/ttyUSB0", "RFQ controller"))?;
//! link.send("status")?;
//!
//! while let Some(event) = link.poll_event(std::time::Duration::from_millis(100)) {
//!     println!("{:?}", event);
//! }
//! link.close()?;
//! ```

pub mod config;
pub mod demo;
pub mod protocol;

/// Re-export commonly used types
pub mod prelude {
    pub use crate::config::LinkConfig;
    pub use crate::demo::{DemoDevice, DemoOpener};
    pub use crate::protocol::{
        ConnectionError, ConnectionManager, ConnectionState, Dispatcher, Frame, LinkEvent,
        PortDescriptor, TransmitError,
    };
}

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
