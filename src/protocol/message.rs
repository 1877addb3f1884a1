//! Wire messages exchanged with the camera bridge.
//!
//! Outbound commands are `{"messageId", "command", ...fields}`. Inbound frames are
//! either results (`type = "result"`) correlated by `messageId`, or unsolicited
//! events (`type = "event"`).

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::{IngestError, Result};
use crate::frame::{StreamMetadata, DEFAULT_FPS};

pub const SET_API_SCHEMA: &str = "set_api_schema";
pub const START_LIVESTREAM: &str = "device.start_livestream";
pub const VIDEO_DATA_EVENT: &str = "livestream video data";

/// A command ready to be serialized onto the socket.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OutboundCommand {
    pub message_id: String,
    pub command: String,
    #[serde(flatten)]
    pub fields: Map<String, Value>,
}

impl OutboundCommand {
    pub fn new(message_id: String, command: &str) -> Self {
        Self {
            message_id,
            command: command.to_string(),
            fields: Map::new(),
        }
    }

    pub fn with_field(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.fields.insert(key.to_string(), value.into());
        self
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }
}

/// Every inbound frame this client understands.
#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum Inbound {
    Result(CommandResult),
    Event { event: EventBody },
    #[serde(other)]
    Other,
}

#[derive(Clone, Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CommandResult {
    pub message_id: String,
    #[serde(default)]
    pub success: bool,
    #[serde(default)]
    pub result: Option<Value>,
    #[serde(default)]
    pub error_code: Option<String>,
}

impl CommandResult {
    /// The `result.async` flag reported by start-type commands.
    pub fn is_async(&self) -> Option<bool> {
        self.result.as_ref()?.get("async")?.as_bool()
    }

    pub fn failure_reason(&self) -> String {
        match &self.error_code {
            Some(code) => code.clone(),
            None => "unspecified failure".to_string(),
        }
    }
}

#[derive(Clone, Debug, Deserialize)]
pub struct EventBody {
    pub event: String,
    #[serde(default)]
    pub metadata: Option<VideoMetadata>,
    #[serde(default)]
    pub buffer: Option<EventBuffer>,
}

#[derive(Clone, Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VideoMetadata {
    pub video_width: Option<u32>,
    pub video_height: Option<u32>,
    #[serde(rename = "videoFPS")]
    pub video_fps: Option<u32>,
}

#[derive(Clone, Debug, Default, Deserialize)]
pub struct EventBuffer {
    #[serde(default)]
    pub data: Vec<u8>,
}

/// A `livestream video data` event, reduced to what the pipeline consumes.
#[derive(Clone, Debug)]
pub struct VideoData {
    pub metadata: Option<VideoMetadata>,
    pub payload: Vec<u8>,
}

impl EventBody {
    /// Returns the video payload when this is a video-data event.
    pub fn into_video_data(self) -> Option<VideoData> {
        if self.event != VIDEO_DATA_EVENT {
            return None;
        }
        Some(VideoData {
            metadata: self.metadata,
            payload: self.buffer.map(|b| b.data).unwrap_or_default(),
        })
    }
}

impl VideoMetadata {
    /// Geometry for the session. Width and height are mandatory; fps falls back to 15.
    pub fn to_stream_metadata(&self) -> Result<StreamMetadata> {
        let width = self
            .video_width
            .filter(|w| *w > 0)
            .ok_or_else(|| IngestError::Protocol("video data event missing videoWidth".into()))?;
        let height = self
            .video_height
            .filter(|h| *h > 0)
            .ok_or_else(|| IngestError::Protocol("video data event missing videoHeight".into()))?;
        let fps = self.video_fps.filter(|f| *f > 0).unwrap_or(DEFAULT_FPS);
        Ok(StreamMetadata { width, height, fps })
    }
}

/// Parse one inbound text frame. Non-JSON or unknown shapes yield an error.
pub fn parse_inbound(raw: &str) -> Result<Inbound> {
    Ok(serde_json::from_str(raw)?)
}
