//! Session lifecycle controller.
//!
//! One `Controller` supervises at most one ingestion session at a time. The
//! session runs on its own thread and exclusively owns the protocol client, the
//! decoder, the analyzer and the sink. The control side only touches the run
//! state, the stop flag and the published lap count.
//!
//! ```text
//!   Idle --start()--> Running --stop()--> Stopping --teardown--> Idle
//!                        |                                        ^
//!                        +--- idle timeout / stream end / error --+
//! ```

use serde::Serialize;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crate::analysis::{draw_lap_label, FrameAnalyzer};
use crate::decoder::{DecoderConfig, FeedHandle, StreamDecoder};
use crate::error::Result;
use crate::frame::StreamMetadata;
use crate::protocol::{ClientConfig, ProtocolClient};
use crate::sink::FrameSink;

/// Sessions end automatically after this long without a new lap.
pub const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_secs(5 * 60);

/// Builds a fresh analyzer for every session.
pub type AnalyzerFactory = Arc<dyn Fn() -> Box<dyn FrameAnalyzer> + Send + Sync>;

/// Opens the sink for a session once the stream geometry is known.
pub type SinkFactory =
    Arc<dyn Fn(&StreamMetadata) -> anyhow::Result<Box<dyn FrameSink>> + Send + Sync>;

#[derive(Clone, Debug)]
pub struct SessionSettings {
    pub client: ClientConfig,
    pub decoder: DecoderConfig,
    pub idle_timeout: Duration,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RunState {
    Idle,
    Running,
    Stopping,
}

/// Snapshot returned by `Controller::status`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub struct ControllerStatus {
    pub running: bool,
    pub laps: u64,
}

/// Why a session's frame loop ended.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SessionEnd {
    Stopped,
    IdleTimeout,
    StreamEnded,
}

/// Run state and session numbering, guarded together.
struct Run {
    state: RunState,
    /// Sessions started so far. The active session, if any, has this number.
    started: u64,
    /// Highest session number that has fully torn down.
    finished: u64,
}

struct Shared {
    run: Mutex<Run>,
    idle: Condvar,
    stop: AtomicBool,
    laps: AtomicU64,
}

impl Shared {
    fn run(&self) -> MutexGuard<'_, Run> {
        self.run.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

pub struct Controller {
    settings: SessionSettings,
    analyzers: AnalyzerFactory,
    sinks: SinkFactory,
    shared: Arc<Shared>,
    worker: Mutex<Option<(u64, JoinHandle<()>)>>,
}

impl Controller {
    pub fn new(settings: SessionSettings, analyzers: AnalyzerFactory, sinks: SinkFactory) -> Self {
        Self {
            settings,
            analyzers,
            sinks,
            shared: Arc::new(Shared {
                run: Mutex::new(Run {
                    state: RunState::Idle,
                    started: 0,
                    finished: 0,
                }),
                idle: Condvar::new(),
                stop: AtomicBool::new(false),
                laps: AtomicU64::new(0),
            }),
            worker: Mutex::new(None),
        }
    }

    /// Launch a session in the background. Returns `false` if one is already active.
    ///
    /// Does not wait for the stream to begin; connection failures surface in the log.
    pub fn start(&self) -> bool {
        let finished = {
            let run = self.shared.run();
            if run.state != RunState::Idle {
                return false;
            }
            run.finished
        };
        self.reap_worker(Some(finished));

        // Spawned outside the lock so `status` never waits on process creation.
        let decoder = match StreamDecoder::spawn(self.settings.decoder.clone()) {
            Ok(decoder) => decoder,
            Err(err) => {
                log::error!("session: cannot start: {}", err);
                return false;
            }
        };

        let mut run = self.shared.run();
        if run.state != RunState::Idle {
            // Lost a race with a concurrent start; the unused decoder is closed on drop.
            return false;
        }
        let session = Session {
            client: ProtocolClient::new(self.settings.client.clone()),
            decoder,
            analyzer: (self.analyzers)(),
            sink: None,
            listener: None,
            torn_down: false,
        };

        self.shared.stop.store(false, Ordering::SeqCst);
        self.shared.laps.store(0, Ordering::SeqCst);
        run.started += 1;
        let generation = run.started;
        run.state = RunState::Running;

        let shared = self.shared.clone();
        let settings = self.settings.clone();
        let sinks = self.sinks.clone();
        let spawned = thread::Builder::new()
            .name("ingest-session".to_string())
            .spawn(move || run_session(session, generation, shared, settings, sinks));
        match spawned {
            Ok(handle) => {
                *self.worker() = Some((generation, handle));
                log::info!("session: {} started", generation);
                true
            }
            Err(err) => {
                log::error!("session: cannot spawn worker: {}", err);
                run.state = RunState::Idle;
                run.finished = generation;
                false
            }
        }
    }

    /// Signal the running session to stop and block until it has torn down.
    ///
    /// Returns `false` if no session is running.
    pub fn stop(&self) -> bool {
        let mut run = self.shared.run();
        if run.state != RunState::Running {
            return false;
        }
        run.state = RunState::Stopping;
        let generation = run.started;
        self.shared.stop.store(true, Ordering::SeqCst);
        log::info!("session: stop requested for session {}", generation);
        // Wait for this session only; a later start may already be running.
        while run.finished < generation {
            run = self
                .shared
                .idle
                .wait(run)
                .unwrap_or_else(PoisonError::into_inner);
        }
        drop(run);
        self.reap_worker(Some(generation));
        true
    }

    pub fn status(&self) -> ControllerStatus {
        let state = self.shared.run().state;
        ControllerStatus {
            running: state != RunState::Idle,
            laps: self.shared.laps.load(Ordering::SeqCst),
        }
    }

    pub fn state(&self) -> RunState {
        self.shared.run().state
    }

    /// Block until the controller is idle or `timeout` passes. Returns whether it is idle.
    pub fn wait_idle(&self, timeout: Duration) -> bool {
        let run = self.shared.run();
        let (run, _) = self
            .shared
            .idle
            .wait_timeout_while(run, timeout, |r| r.state != RunState::Idle)
            .unwrap_or_else(PoisonError::into_inner);
        run.state == RunState::Idle
    }

    fn worker(&self) -> MutexGuard<'_, Option<(u64, JoinHandle<()>)>> {
        self.worker.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Join the stored worker if its session number is at most `upto` (any, if `None`).
    fn reap_worker(&self, upto: Option<u64>) {
        let handle = {
            let mut slot = self.worker();
            match slot.as_ref() {
                Some((generation, _)) if upto.map_or(true, |max| *generation <= max) => {
                    slot.take().map(|(_, handle)| handle)
                }
                _ => None,
            }
        };
        if let Some(handle) = handle {
            if handle.join().is_err() {
                log::error!("session: worker thread panicked");
            }
        }
    }
}

impl Drop for Controller {
    fn drop(&mut self) {
        self.stop();
        self.reap_worker(None);
    }
}

// ----------------------------------------------------------------------------
// Session
// ----------------------------------------------------------------------------

/// Resources owned by one run. Torn down exactly once, also on unwind.
struct Session {
    client: ProtocolClient,
    decoder: StreamDecoder,
    analyzer: Box<dyn FrameAnalyzer>,
    sink: Option<Box<dyn FrameSink>>,
    listener: Option<JoinHandle<()>>,
    torn_down: bool,
}

impl Session {
    fn teardown(&mut self) {
        if self.torn_down {
            return;
        }
        self.torn_down = true;
        if let Err(err) = self.decoder.close() {
            log::warn!("session: decoder close failed: {}", err);
        }
        if let Err(err) = self.client.close() {
            log::warn!("session: client close failed: {}", err);
        }
        if let Some(listener) = self.listener.take() {
            if listener.join().is_err() {
                log::warn!("session: listener thread panicked");
            }
        }
        if let Some(mut sink) = self.sink.take() {
            if let Err(err) = sink.close() {
                log::warn!("session: sink close failed: {:#}", err);
            }
        }
        log::info!(
            "session: total laps counted: {}",
            self.analyzer.lap_count()
        );
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.teardown();
    }
}

/// Marks session `.1` finished when its thread exits, panics included.
struct IdleOnExit(Arc<Shared>, u64);

impl Drop for IdleOnExit {
    fn drop(&mut self) {
        let mut run = self.0.run();
        run.finished = run.finished.max(self.1);
        if run.started == self.1 {
            run.state = RunState::Idle;
        }
        drop(run);
        self.0.idle.notify_all();
    }
}

/// Closes the decoder input once the listener that owns it finishes.
struct InputGuard(FeedHandle);

impl InputGuard {
    fn feed(&self, bytes: &[u8]) {
        self.0.feed(bytes);
    }
}

impl Drop for InputGuard {
    fn drop(&mut self) {
        self.0.close();
    }
}

/// Tracks time since the lap count last increased.
struct IdleWatchdog {
    laps: u64,
    last_progress: Instant,
    timeout: Duration,
}

impl IdleWatchdog {
    fn new(laps: u64, timeout: Duration) -> Self {
        Self {
            laps,
            last_progress: Instant::now(),
            timeout,
        }
    }

    fn observe(&mut self, laps: u64) {
        if laps > self.laps {
            self.laps = laps;
            self.last_progress = Instant::now();
        }
    }

    fn expired(&self) -> bool {
        self.last_progress.elapsed() > self.timeout
    }
}

fn run_session(
    session: Session,
    generation: u64,
    shared: Arc<Shared>,
    settings: SessionSettings,
    sinks: SinkFactory,
) {
    // Declared before the session so it drops after it: Idle only once torn down.
    let _idle = IdleOnExit(shared.clone(), generation);
    let mut session = session;
    match drive(&mut session, &shared, &settings, &sinks) {
        Ok(end) => log::info!("session: ended ({:?})", end),
        Err(err) => log::error!("session: failed: {}", err),
    }
    session.teardown();
}

fn drive(
    session: &mut Session,
    shared: &Shared,
    settings: &SessionSettings,
    sinks: &SinkFactory,
) -> Result<SessionEnd> {
    let Session {
        client,
        decoder,
        analyzer,
        sink,
        listener,
        ..
    } = session;

    client.connect()?;
    client.negotiate_schema(settings.client.schema_version)?;
    let (first, meta) = client.start_livestream(&settings.client.device_serial)?;
    decoder.feed(&first);

    let input = InputGuard(decoder.feeder());
    *listener = Some(client.listen(move |bytes| input.feed(&bytes))?);

    let out = sink.insert(sinks(&meta)?);
    let mut watchdog = IdleWatchdog::new(analyzer.lap_count(), settings.idle_timeout);

    for frame in decoder.frames(meta.width, meta.height) {
        if shared.stop.load(Ordering::SeqCst) {
            return Ok(SessionEnd::Stopped);
        }
        let mut annotated = analyzer.process(frame)?;
        let laps = analyzer.lap_count();
        shared.laps.store(laps, Ordering::SeqCst);
        watchdog.observe(laps);
        draw_lap_label(&mut annotated, laps);
        out.write(&annotated)?;
        if watchdog.expired() {
            log::info!(
                "session: no new lap for {:?}, stopping automatically",
                settings.idle_timeout
            );
            return Ok(SessionEnd::IdleTimeout);
        }
    }
    Ok(SessionEnd::StreamEnded)
}
