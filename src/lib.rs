//! Lapwatch
//!
//! Live camera ingestion for lap counting: pulls the encoded livestream of a
//! camera over the device's websocket protocol, decodes it into raw BGR frames
//! through an external ffmpeg process, runs each frame past a lap-counting
//! analyzer and records the annotated result.
//!
//! # Architecture
//!
//! ```text
//!   device --ws--> ProtocolClient --bytes--> StreamDecoder --frames--> FrameAnalyzer --> FrameSink
//!                        ^                                                  |
//!                        |                                               laps
//!   HTTP api ------> Controller (Idle/Running/Stopping, idle watchdog) <----+
//! ```
//!
//! # Module Structure
//!
//! - `protocol`: websocket client, command/result correlation and the video event stream
//! - `decoder`: external decoding process and fixed-size frame reassembly
//! - `controller`: session lifecycle, stop signal and idle-timeout watchdog
//! - `analysis` / `sink`: per-frame collaborators driven by a session
//! - `api`: HTTP control surface
//! - `config`: file and environment configuration for the daemon

pub mod analysis;
pub mod api;
pub mod config;
pub mod controller;
pub mod decoder;
pub mod error;
pub mod frame;
pub mod protocol;
pub mod sink;

pub use analysis::{FrameAnalyzer, Zone, ZoneLapCounter, ZoneSettings};
pub use api::{ApiConfig, ApiHandle, ApiServer};
pub use config::LapwatchConfig;
pub use controller::{
    AnalyzerFactory, Controller, ControllerStatus, RunState, SessionSettings, SinkFactory,
};
pub use decoder::{DecoderConfig, FeedHandle, FrameAssembler, StreamDecoder};
pub use error::{IngestError, Result};
pub use frame::{RawFrame, StreamMetadata};
pub use protocol::{ClientConfig, ConnectionState, ProtocolClient};
pub use sink::{FrameSink, RecordingSink};
