//! A simulated camera bridge speaking the device websocket protocol, plus
//! in-memory session collaborators for driving the controller in tests.

#![allow(dead_code)]

use std::net::{TcpListener, TcpStream};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use serde_json::{json, Value};
use tungstenite::Message;

use lapwatch::{
    AnalyzerFactory, ClientConfig, DecoderConfig, FrameAnalyzer, FrameSink, RawFrame,
    SessionSettings, SinkFactory, StreamMetadata,
};

pub const SERIAL: &str = "T8113T7223242231";

/// What the simulated device does once a client asks for the livestream.
#[derive(Clone, Debug)]
pub struct DeviceScript {
    pub width: u32,
    pub height: u32,
    pub fps: Option<u32>,
    /// Frames to stream before closing; `None` streams until the client goes away.
    pub frames: Option<usize>,
    /// Payload bytes per video event. Need not divide the frame size.
    pub chunk: usize,
    /// Pause between video events.
    pub interval: Duration,
    pub reject_schema: bool,
    /// When false, `device.start_livestream` is never answered.
    pub answer_start: bool,
    /// Precede every result with a failed result for an identifier nobody issued.
    pub stray_result: bool,
    /// Precede every result with a text frame that is not JSON.
    pub malformed_frame: bool,
    /// Send the first video event before the `device.start_livestream` result.
    pub video_before_ack: bool,
}

impl Default for DeviceScript {
    fn default() -> Self {
        Self {
            width: 10,
            height: 10,
            fps: Some(15),
            frames: Some(5),
            chunk: 300,
            interval: Duration::ZERO,
            reject_schema: false,
            answer_start: true,
            stray_result: false,
            malformed_frame: false,
            video_before_ack: false,
        }
    }
}

pub struct SimDevice {
    pub url: String,
    commands: Arc<Mutex<Vec<Value>>>,
    connections: Arc<AtomicUsize>,
}

impl SimDevice {
    pub fn spawn(script: DeviceScript) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").expect("bind simulated device");
        let url = format!("ws://{}", listener.local_addr().expect("device addr"));
        let commands = Arc::new(Mutex::new(Vec::new()));
        let connections = Arc::new(AtomicUsize::new(0));

        let commands_thread = commands.clone();
        let connections_thread = connections.clone();
        std::thread::spawn(move || {
            for stream in listener.incoming() {
                let Ok(stream) = stream else { break };
                connections_thread.fetch_add(1, Ordering::SeqCst);
                let script = script.clone();
                let commands = commands_thread.clone();
                std::thread::spawn(move || serve(stream, script, commands));
            }
        });

        Self {
            url,
            commands,
            connections,
        }
    }

    /// Every command received so far, across connections.
    pub fn commands(&self) -> Vec<Value> {
        self.commands.lock().unwrap().clone()
    }

    pub fn connections(&self) -> usize {
        self.connections.load(Ordering::SeqCst)
    }
}

/// Frame `index` of the simulated stream: every byte equals `index mod 256`.
pub fn frame_bytes(index: usize, width: u32, height: u32) -> Vec<u8> {
    vec![(index % 256) as u8; width as usize * height as usize * 3]
}

fn serve(stream: TcpStream, script: DeviceScript, commands: Arc<Mutex<Vec<Value>>>) {
    let Ok(mut ws) = tungstenite::accept(stream) else {
        return;
    };
    let hello = json!({
        "type": "version",
        "driverVersion": "2.4.0",
        "serverVersion": "1.9.0",
        "minSchemaVersion": 0,
        "maxSchemaVersion": 21
    });
    if ws.send(Message::Text(hello.to_string())).is_err() {
        return;
    }

    loop {
        let text = match ws.read() {
            Ok(Message::Text(text)) => text,
            Ok(Message::Close(_)) | Err(_) => return,
            Ok(_) => continue,
        };
        let Ok(cmd) = serde_json::from_str::<Value>(&text) else {
            continue;
        };
        commands.lock().unwrap().push(cmd.clone());
        let id = cmd["messageId"].as_str().unwrap_or_default().to_string();
        if send_clutter(&mut ws, &script).is_err() {
            return;
        }

        let outcome = match cmd["command"].as_str() {
            Some("set_api_schema") if script.reject_schema => {
                send_json(&mut ws, failure(&id, "schema_incompatible"))
            }
            Some("set_api_schema") => send_json(&mut ws, success(&id, json!({}))),
            Some("device.start_livestream") if !script.answer_start => Ok(()),
            Some("device.start_livestream") => {
                if start_livestream(&mut ws, &id, &script).is_ok() {
                    let _ = ws.close(None);
                    let _ = ws.flush();
                }
                return;
            }
            _ => send_json(&mut ws, failure(&id, "unknown_command")),
        };
        if outcome.is_err() {
            return;
        }
    }
}

type DeviceSocket = tungstenite::WebSocket<TcpStream>;

/// Traffic a real bridge may interleave ahead of a command result.
fn send_clutter(ws: &mut DeviceSocket, script: &DeviceScript) -> tungstenite::Result<()> {
    if script.stray_result {
        send_json(ws, failure("schema", "unrelated"))?;
    }
    if script.malformed_frame {
        ws.send(Message::Text("{not json".to_string()))?;
    }
    Ok(())
}

fn start_livestream(ws: &mut DeviceSocket, id: &str, script: &DeviceScript) -> tungstenite::Result<()> {
    // Unrelated traffic ahead of the result must not confuse correlation.
    let noise = json!({
        "type": "event",
        "event": {"source": "device", "event": "property changed", "name": "battery"}
    });
    send_json(ws, noise)?;
    let ack = success(id, json!({"async": true}));
    if script.video_before_ack {
        return stream_video(ws, script, Some(ack));
    }
    send_json(ws, ack)?;
    stream_video(ws, script, None)
}

/// Streams the scripted video. A held-back `ack` goes out right after the first event.
fn stream_video(
    ws: &mut DeviceSocket,
    script: &DeviceScript,
    mut ack: Option<Value>,
) -> tungstenite::Result<()> {
    let chunk = script.chunk.max(1);
    let mut send_piece = |ws: &mut DeviceSocket, piece: &[u8]| -> tungstenite::Result<()> {
        send_json(ws, video_event(script, piece))?;
        match ack.take() {
            Some(ack) => send_json(ws, ack),
            None => Ok(()),
        }
    };
    match script.frames {
        Some(count) => {
            let stream: Vec<u8> = (0..count)
                .flat_map(|i| frame_bytes(i, script.width, script.height))
                .collect();
            if stream.is_empty() {
                // Degenerate geometry still announces itself.
                send_piece(ws, &[])?;
            }
            for piece in stream.chunks(chunk) {
                send_piece(ws, piece)?;
                pause(script.interval);
            }
        }
        None => {
            for index in 0.. {
                let frame = frame_bytes(index, script.width, script.height);
                for piece in frame.chunks(chunk) {
                    send_piece(ws, piece)?;
                }
                pause(script.interval);
            }
        }
    }
    Ok(())
}

fn pause(interval: Duration) {
    if !interval.is_zero() {
        std::thread::sleep(interval);
    }
}

fn send_json(ws: &mut DeviceSocket, value: Value) -> tungstenite::Result<()> {
    ws.send(Message::Text(value.to_string()))
}

fn success(id: &str, result: Value) -> Value {
    json!({"type": "result", "messageId": id, "success": true, "result": result})
}

fn failure(id: &str, code: &str) -> Value {
    json!({"type": "result", "messageId": id, "success": false, "errorCode": code})
}

fn video_event(script: &DeviceScript, data: &[u8]) -> Value {
    let mut metadata = json!({
        "videoCodec": "h264",
        "videoWidth": script.width,
        "videoHeight": script.height
    });
    if let Some(fps) = script.fps {
        metadata["videoFPS"] = json!(fps);
    }
    json!({
        "type": "event",
        "event": {
            "source": "device",
            "event": "livestream video data",
            "serialNumber": SERIAL,
            "buffer": {"type": "Buffer", "data": data},
            "metadata": metadata
        }
    })
}

// ----------------------------------------------------------------------------
// Session collaborators
// ----------------------------------------------------------------------------

/// Counts a lap every `every` frames (never, when `every` is zero).
pub struct ScriptedLaps {
    every: u64,
    seen: u64,
    laps: u64,
}

impl FrameAnalyzer for ScriptedLaps {
    fn process(&mut self, frame: RawFrame) -> anyhow::Result<RawFrame> {
        self.seen += 1;
        if self.every > 0 && self.seen % self.every == 0 {
            self.laps += 1;
        }
        Ok(frame)
    }

    fn lap_count(&self) -> u64 {
        self.laps
    }
}

pub fn analyzers(every: u64) -> AnalyzerFactory {
    Arc::new(move || {
        Box::new(ScriptedLaps {
            every,
            seen: 0,
            laps: 0,
        }) as Box<dyn FrameAnalyzer>
    })
}

/// Frames written by every session, shared with the test.
#[derive(Clone, Default)]
pub struct Captured {
    pub frames: Arc<Mutex<Vec<RawFrame>>>,
    pub meta: Arc<Mutex<Option<StreamMetadata>>>,
    pub closed: Arc<AtomicU64>,
}

impl Captured {
    pub fn frame_count(&self) -> usize {
        self.frames.lock().unwrap().len()
    }

    pub fn sinks(&self) -> SinkFactory {
        let captured = self.clone();
        Arc::new(
            move |meta: &StreamMetadata| -> anyhow::Result<Box<dyn FrameSink>> {
                *captured.meta.lock().unwrap() = Some(*meta);
                Ok(Box::new(CaptureSink {
                    captured: captured.clone(),
                }))
            },
        )
    }

    /// Poll until at least `count` frames were written.
    pub fn wait_for_frames(&self, count: usize, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        while Instant::now() < deadline {
            if self.frame_count() >= count {
                return true;
            }
            std::thread::sleep(Duration::from_millis(10));
        }
        self.frame_count() >= count
    }
}

struct CaptureSink {
    captured: Captured,
}

impl FrameSink for CaptureSink {
    fn write(&mut self, frame: &RawFrame) -> anyhow::Result<()> {
        self.captured.frames.lock().unwrap().push(frame.clone());
        Ok(())
    }

    fn close(&mut self) -> anyhow::Result<()> {
        self.captured.closed.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// Session settings pointing at `device`, decoding with `cat` so raw BGR passes through.
pub fn passthrough_settings(device: &SimDevice, idle_timeout: Duration) -> SessionSettings {
    SessionSettings {
        client: client_config(&device.url),
        decoder: DecoderConfig::passthrough("cat"),
        idle_timeout,
    }
}

pub fn client_config(url: &str) -> ClientConfig {
    ClientConfig {
        url: url.to_string(),
        device_serial: SERIAL.to_string(),
        response_timeout: Duration::from_secs(5),
        ..ClientConfig::default()
    }
}
