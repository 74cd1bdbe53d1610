//! filepull library
//!
//! A coordinator pulls files from remote agents over long-lived TCP
//! connections; agents stream each file back in bounded base64 chunks and the
//! coordinator reassembles them on disk.

pub mod api;
pub mod api_client;
pub mod cli;
pub mod config;
pub mod envelope;
pub mod error;
pub mod executor;
pub mod log;
pub mod logger;
pub mod net_async;
pub mod protocol;
pub mod protocol_core;
pub mod registry;
pub mod session;
pub mod transport;

pub use error::TransferError;
