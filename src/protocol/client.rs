//! Websocket client for the camera bridge.
//!
//! A single pump thread owns the socket. It writes queued commands and reads every
//! inbound frame, routing results to the waiter registered under their `messageId`
//! and video-data events to an in-order queue. Command calls block on their own
//! reply channel, so events that arrive while a command is outstanding are queued
//! rather than discarded.

use std::collections::HashMap;
use std::io::ErrorKind;
use std::net::TcpStream;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender, TryRecvError};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use tungstenite::stream::MaybeTlsStream;
use tungstenite::{Message, WebSocket};

use super::message::{
    parse_inbound, CommandResult, Inbound, OutboundCommand, VideoData, SET_API_SCHEMA,
    START_LIVESTREAM,
};
use crate::error::{IngestError, Result};
use crate::frame::StreamMetadata;

type Socket = WebSocket<MaybeTlsStream<TcpStream>>;
type PendingTable = Arc<Mutex<HashMap<String, Sender<CommandResult>>>>;

/// Read timeout on the socket; bounds how long a queued command waits to be written.
const POLL_INTERVAL: Duration = Duration::from_millis(25);

/// Default schema version spoken to the bridge.
pub const DEFAULT_SCHEMA_VERSION: u32 = 18;

/// Configuration for a protocol client.
#[derive(Clone, Debug)]
pub struct ClientConfig {
    /// Websocket URL (e.g., "ws://homeassistant.local:3000")
    pub url: String,
    /// Serial number of the camera to stream from.
    pub device_serial: String,
    pub schema_version: u32,
    /// Upper bound on every blocking wait for a reply or the first video event.
    pub response_timeout: Duration,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            url: "ws://127.0.0.1:3000".to_string(),
            device_serial: String::new(),
            schema_version: DEFAULT_SCHEMA_VERSION,
            response_timeout: Duration::from_secs(30),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connected,
    SchemaNegotiated,
    Streaming,
    Closed,
}

pub struct ProtocolClient {
    config: ClientConfig,
    state: ConnectionState,
    outbound: Option<Sender<String>>,
    pending: PendingTable,
    events: Option<Receiver<VideoData>>,
    shutdown: Arc<AtomicBool>,
    pump: Option<JoinHandle<()>>,
    issued: u64,
}

impl ProtocolClient {
    pub fn new(config: ClientConfig) -> Self {
        Self {
            config,
            state: ConnectionState::Disconnected,
            outbound: None,
            pending: Arc::new(Mutex::new(HashMap::new())),
            events: None,
            shutdown: Arc::new(AtomicBool::new(false)),
            pump: None,
            issued: 0,
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    /// Open the websocket and start the pump thread.
    pub fn connect(&mut self) -> Result<()> {
        if self.state != ConnectionState::Disconnected {
            return Err(IngestError::Connection(format!(
                "client is {:?}; a client holds at most one connection",
                self.state
            )));
        }
        log::info!("protocol: connecting to {}", self.config.url);
        let (mut socket, _response) = tungstenite::connect(self.config.url.as_str())
            .map_err(|e| IngestError::Connection(format!("{}: {}", self.config.url, e)))?;

        match socket.get_mut() {
            MaybeTlsStream::Plain(stream) => stream
                .set_read_timeout(Some(POLL_INTERVAL))
                .map_err(|e| IngestError::Connection(format!("configure socket: {}", e)))?,
            _ => {
                return Err(IngestError::Connection(
                    "only plain ws:// transports are supported".to_string(),
                ))
            }
        }

        let (outbound_tx, outbound_rx) = mpsc::channel();
        let (events_tx, events_rx) = mpsc::channel();
        let pending = self.pending.clone();
        let shutdown = self.shutdown.clone();
        let pump = thread::Builder::new()
            .name("protocol-pump".to_string())
            .spawn(move || run_pump(socket, outbound_rx, pending, events_tx, shutdown))
            .map_err(|e| IngestError::Connection(format!("spawn pump thread: {}", e)))?;

        self.outbound = Some(outbound_tx);
        self.events = Some(events_rx);
        self.pump = Some(pump);
        self.state = ConnectionState::Connected;
        log::info!("protocol: connected");
        Ok(())
    }

    /// Declare the protocol schema version for subsequent commands.
    pub fn negotiate_schema(&mut self, version: u32) -> Result<()> {
        let id = self.next_message_id("schema");
        let cmd =
            OutboundCommand::new(id.clone(), SET_API_SCHEMA).with_field("schemaVersion", version);
        log::info!("protocol: setting api schema {} (msgId={})", version, id);
        self.send_command(cmd)?;
        self.state = ConnectionState::SchemaNegotiated;
        log::info!("protocol: schema {} accepted", version);
        Ok(())
    }

    /// Ask the device to stream, then wait for the first video-data event.
    ///
    /// Returns the first payload chunk and the stream geometry it announced.
    pub fn start_livestream(&mut self, device_id: &str) -> Result<(Vec<u8>, StreamMetadata)> {
        let id = self.next_message_id("start_ls");
        let cmd = OutboundCommand::new(id.clone(), START_LIVESTREAM)
            .with_field("version", self.config.schema_version)
            .with_field("serialNumber", device_id);
        log::info!(
            "protocol: starting livestream for {} (msgId={})",
            device_id,
            id
        );
        let ack = self.send_command(cmd)?;
        log::info!(
            "protocol: start_livestream acknowledged (async={:?})",
            ack.is_async()
        );

        let events = self.events.as_ref().ok_or_else(|| {
            IngestError::Protocol("event stream already handed to a listener".to_string())
        })?;
        let first = match events.recv_timeout(self.config.response_timeout) {
            Ok(video) => video,
            Err(RecvTimeoutError::Timeout) => {
                return Err(IngestError::Protocol(
                    "timed out waiting for the first video data event".to_string(),
                ))
            }
            Err(RecvTimeoutError::Disconnected) => {
                return Err(IngestError::Connection(
                    "connection closed before video data arrived".to_string(),
                ))
            }
        };
        let metadata = first
            .metadata
            .as_ref()
            .ok_or_else(|| {
                IngestError::Protocol("first video data event carried no metadata".to_string())
            })?
            .to_stream_metadata()?;
        self.state = ConnectionState::Streaming;
        log::info!(
            "protocol: stream metadata {}x{} @ {} fps",
            metadata.width,
            metadata.height,
            metadata.fps
        );
        Ok((first.payload, metadata))
    }

    /// Forward every subsequent video-data payload to `on_data` on a background thread.
    ///
    /// The thread ends when the connection closes; errors never propagate out of it.
    pub fn listen<F>(&mut self, mut on_data: F) -> Result<JoinHandle<()>>
    where
        F: FnMut(Vec<u8>) + Send + 'static,
    {
        let events = self.events.take().ok_or_else(|| {
            IngestError::Protocol("not connected or listener already running".to_string())
        })?;
        thread::Builder::new()
            .name("protocol-listener".to_string())
            .spawn(move || {
                let mut forwarded = 0u64;
                for video in events.iter() {
                    forwarded += 1;
                    on_data(video.payload);
                }
                log::debug!("protocol: listener finished after {} events", forwarded);
            })
            .map_err(|e| IngestError::Session(format!("spawn listener thread: {}", e)))
    }

    /// Close the connection. Safe to call repeatedly or before `connect`.
    pub fn close(&mut self) -> Result<()> {
        self.shutdown.store(true, Ordering::SeqCst);
        self.outbound = None;
        let joined = match self.pump.take() {
            Some(pump) => pump
                .join()
                .map_err(|_| IngestError::Connection("protocol pump thread panicked".to_string())),
            None => Ok(()),
        };
        if self.state != ConnectionState::Closed && self.state != ConnectionState::Disconnected {
            log::info!("protocol: connection closed");
        }
        self.state = ConnectionState::Closed;
        joined
    }

    fn next_message_id(&mut self, prefix: &str) -> String {
        self.issued += 1;
        let millis = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis())
            .unwrap_or_default();
        format!("{}_{}_{}", prefix, millis, self.issued)
    }

    /// Send a command and block until the result bearing its identifier arrives.
    fn send_command(&mut self, cmd: OutboundCommand) -> Result<CommandResult> {
        let outbound = self
            .outbound
            .as_ref()
            .ok_or_else(|| IngestError::Connection("not connected".to_string()))?;
        let id = cmd.message_id.clone();
        let json = cmd.to_json()?;

        let (tx, rx) = mpsc::channel();
        lock(&self.pending).insert(id.clone(), tx);
        if outbound.send(json).is_err() {
            lock(&self.pending).remove(&id);
            return Err(IngestError::Connection("connection closed".to_string()));
        }

        match rx.recv_timeout(self.config.response_timeout) {
            Ok(result) if result.success => Ok(result),
            Ok(result) => Err(IngestError::Protocol(format!(
                "{} failed: {}",
                cmd.command,
                result.failure_reason()
            ))),
            Err(RecvTimeoutError::Timeout) => {
                lock(&self.pending).remove(&id);
                Err(IngestError::Protocol(format!(
                    "timed out waiting for result of {}",
                    id
                )))
            }
            Err(RecvTimeoutError::Disconnected) => Err(IngestError::Connection(format!(
                "connection closed while awaiting {}",
                id
            ))),
        }
    }
}

impl Drop for ProtocolClient {
    fn drop(&mut self) {
        let _ = self.close();
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

fn run_pump(
    mut socket: Socket,
    outbound: Receiver<String>,
    pending: PendingTable,
    events: Sender<VideoData>,
    shutdown: Arc<AtomicBool>,
) {
    let reason = loop {
        if shutdown.load(Ordering::SeqCst) {
            let _ = socket.close(None);
            let _ = socket.flush();
            break "closed by client".to_string();
        }
        if let Err(reason) = drain_outbound(&mut socket, &outbound) {
            break reason;
        }
        match socket.read() {
            Ok(Message::Text(text)) => route(&text, &pending, &events),
            Ok(Message::Binary(bytes)) => match std::str::from_utf8(&bytes) {
                Ok(text) => route(text, &pending, &events),
                Err(_) => log::debug!(
                    "protocol: skipping non-utf8 binary frame ({} bytes)",
                    bytes.len()
                ),
            },
            Ok(Message::Close(_)) => break "closed by peer".to_string(),
            Ok(_) => {}
            Err(tungstenite::Error::Io(err))
                if matches!(err.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut) => {}
            Err(tungstenite::Error::ConnectionClosed) | Err(tungstenite::Error::AlreadyClosed) => {
                break "closed".to_string()
            }
            Err(err) => break format!("read failed: {}", err),
        }
    };
    // Drop the command queue before failing waiters so no command can be enqueued
    // after the table is cleared.
    drop(outbound);
    lock(&pending).clear();
    log::info!("protocol: pump stopped ({})", reason);
}

fn drain_outbound(socket: &mut Socket, outbound: &Receiver<String>) -> std::result::Result<(), String> {
    loop {
        match outbound.try_recv() {
            Ok(json) => socket
                .send(Message::Text(json))
                .map_err(|e| format!("send failed: {}", e))?,
            Err(TryRecvError::Empty) => return Ok(()),
            Err(TryRecvError::Disconnected) => {
                let _ = socket.close(None);
                let _ = socket.flush();
                return Err("client dropped".to_string());
            }
        }
    }
}

fn route(text: &str, pending: &PendingTable, events: &Sender<VideoData>) {
    match parse_inbound(text) {
        Ok(Inbound::Result(result)) => {
            let waiter = lock(pending).remove(&result.message_id);
            match waiter {
                Some(tx) => {
                    let _ = tx.send(result);
                }
                None => log::debug!(
                    "protocol: ignoring result for unknown messageId {}",
                    result.message_id
                ),
            }
        }
        Ok(Inbound::Event { event }) => {
            if let Some(video) = event.into_video_data() {
                let _ = events.send(video);
            }
        }
        Ok(Inbound::Other) => {}
        Err(err) => log::debug!(
            "protocol: skipping malformed frame ({} bytes): {}",
            text.len(),
            err
        ),
    }
}
