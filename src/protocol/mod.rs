//! Camera bridge protocol.
//!
//! - `message`: JSON wire types (commands, results, events)
//! - `client`: `ProtocolClient`, request/response correlation plus event demultiplexing

pub mod client;
pub mod message;

pub use client::{ClientConfig, ConnectionState, ProtocolClient, DEFAULT_SCHEMA_VERSION};
pub use message::{CommandResult, VideoData, VIDEO_DATA_EVENT};
