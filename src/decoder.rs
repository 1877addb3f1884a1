//! Stream reassembly through an external decoding process.
//!
//! `StreamDecoder` spawns the decoder with piped stdin/stdout. Encoded bytes are
//! pushed into stdin through a cloneable `FeedHandle`; raw BGR24 output is read in
//! bounded chunks and re-cut into whole frames by `FrameAssembler`, so I/O chunk
//! boundaries never leak into frame boundaries.

use std::io::{ErrorKind, Read, Write};
use std::process::{Child, ChildStdin, ChildStdout, Command, ExitStatus, Stdio};
use std::sync::{Arc, Mutex, PoisonError, TryLockError};
use std::thread;
use std::time::{Duration, Instant};

use crate::error::{IngestError, Result};
use crate::frame::{frame_len, RawFrame};

/// Size of a single read from the decoder's stdout.
pub const READ_CHUNK_BYTES: usize = 4096;

/// Pause after an empty read while the decoder is still alive.
const EMPTY_READ_BACKOFF: Duration = Duration::from_millis(10);
const EXIT_POLL: Duration = Duration::from_millis(20);

/// How to launch the decoding process.
#[derive(Clone, Debug)]
pub struct DecoderConfig {
    pub program: String,
    pub args: Vec<String>,
    /// How long `close` waits for a graceful exit before killing the process.
    pub shutdown_grace: Duration,
}

impl DecoderConfig {
    /// H.264 in on stdin, bgr24 rawvideo out on stdout.
    pub fn ffmpeg(program: &str) -> Self {
        let args = [
            "-hide_banner",
            "-loglevel",
            "error",
            "-fflags",
            "nobuffer",
            "-i",
            "pipe:0",
            "-f",
            "rawvideo",
            "-pix_fmt",
            "bgr24",
            "pipe:1",
        ];
        Self {
            program: program.to_string(),
            args: args.iter().map(|a| a.to_string()).collect(),
            shutdown_grace: Duration::from_secs(2),
        }
    }

    /// A process that copies stdin to stdout unchanged (e.g. `cat`), for raw input.
    pub fn passthrough(program: &str) -> Self {
        Self {
            program: program.to_string(),
            args: Vec::new(),
            shutdown_grace: Duration::from_secs(2),
        }
    }
}

impl Default for DecoderConfig {
    fn default() -> Self {
        Self::ffmpeg("ffmpeg")
    }
}

// ----------------------------------------------------------------------------
// FeedHandle
// ----------------------------------------------------------------------------

/// Write side of the decoder. Clones share the same pipe.
#[derive(Clone)]
pub struct FeedHandle {
    stdin: Arc<Mutex<Option<ChildStdin>>>,
}

impl FeedHandle {
    fn new(stdin: ChildStdin) -> Self {
        Self {
            stdin: Arc::new(Mutex::new(Some(stdin))),
        }
    }

    /// Best-effort write. A closed pipe or an exited decoder is not an error.
    pub fn feed(&self, bytes: &[u8]) {
        let mut guard = self.stdin.lock().unwrap_or_else(PoisonError::into_inner);
        let Some(stdin) = guard.as_mut() else {
            return;
        };
        if let Err(err) = stdin.write_all(bytes) {
            if err.kind() == ErrorKind::BrokenPipe {
                log::debug!("decoder: input pipe closed, dropping further writes");
            } else {
                log::warn!("decoder: write failed: {}", err);
            }
            *guard = None;
        }
    }

    /// Close the input pipe so the decoder sees end-of-stream.
    pub fn close(&self) {
        self.stdin
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
    }

    /// Like `close`, but gives up instead of waiting on a writer blocked in `feed`.
    fn try_close(&self) -> bool {
        match self.stdin.try_lock() {
            Ok(mut guard) => {
                guard.take();
                true
            }
            Err(TryLockError::Poisoned(poisoned)) => {
                poisoned.into_inner().take();
                true
            }
            Err(TryLockError::WouldBlock) => false,
        }
    }

    pub fn is_closed(&self) -> bool {
        self.stdin
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_none()
    }
}

// ----------------------------------------------------------------------------
// FrameAssembler
// ----------------------------------------------------------------------------

/// Accumulates arbitrary byte chunks and cuts them into fixed-size frames.
///
/// Holds at most one partial frame between calls to `next_frame`.
#[derive(Debug)]
pub struct FrameAssembler {
    frame_len: usize,
    buf: Vec<u8>,
}

impl FrameAssembler {
    pub fn new(frame_len: usize) -> Self {
        Self {
            frame_len,
            buf: Vec::with_capacity(frame_len.saturating_mul(2)),
        }
    }

    pub fn push(&mut self, chunk: &[u8]) {
        self.buf.extend_from_slice(chunk);
    }

    /// Slice the front full frame off the buffer, if one is complete.
    pub fn next_frame(&mut self) -> Option<Vec<u8>> {
        if self.frame_len == 0 || self.buf.len() < self.frame_len {
            return None;
        }
        let rest = self.buf.split_off(self.frame_len);
        Some(std::mem::replace(&mut self.buf, rest))
    }

    /// Bytes of the trailing partial frame.
    pub fn pending_len(&self) -> usize {
        self.buf.len()
    }
}

// ----------------------------------------------------------------------------
// StreamDecoder
// ----------------------------------------------------------------------------

pub struct StreamDecoder {
    config: DecoderConfig,
    child: Child,
    input: FeedHandle,
    output: Option<ChildStdout>,
    exit: Option<ExitStatus>,
}

impl StreamDecoder {
    /// Spawn the decoding process. Failure here is fatal for the session.
    pub fn spawn(config: DecoderConfig) -> Result<Self> {
        let mut child = Command::new(&config.program)
            .args(&config.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .spawn()
            .map_err(|e| IngestError::DecoderUnavailable(format!("{}: {}", config.program, e)))?;

        let (stdin, stdout) = match (child.stdin.take(), child.stdout.take()) {
            (Some(stdin), Some(stdout)) => (stdin, stdout),
            _ => {
                let _ = child.kill();
                let _ = child.wait();
                return Err(IngestError::DecoderUnavailable(
                    "decoder pipes were not captured".to_string(),
                ));
            }
        };
        log::info!(
            "decoder: spawned {} (pid {})",
            config.program,
            child.id()
        );
        Ok(Self {
            config,
            child,
            input: FeedHandle::new(stdin),
            output: Some(stdout),
            exit: None,
        })
    }

    pub fn feed(&self, bytes: &[u8]) {
        self.input.feed(bytes);
    }

    /// A handle other threads can use to feed this decoder.
    pub fn feeder(&self) -> FeedHandle {
        self.input.clone()
    }

    /// Lazy, infinite sequence of decoded frames.
    ///
    /// The output pipe is handed to the first caller; later calls get an empty sequence.
    pub fn frames(&mut self, width: u32, height: u32) -> Frames<'_> {
        let len = frame_len(width, height);
        let mut output = self.output.take();
        if len == 0 {
            log::warn!("decoder: refusing to slice {}x{} frames", width, height);
            output = None;
        }
        Frames {
            child: &mut self.child,
            output,
            assembler: FrameAssembler::new(len),
            chunk: vec![0u8; READ_CHUNK_BYTES],
            width,
            height,
            sequence: 0,
        }
    }

    /// Close stdin, wait up to the grace period, then kill.
    pub fn close(&mut self) -> Result<()> {
        if self.exit.is_some() {
            return Ok(());
        }
        self.output = None;
        if !self.input.try_close() {
            log::debug!("decoder: input busy, skipping graceful close");
        }

        let status = wait_or_kill(&mut self.child, self.config.shutdown_grace, "decoder")?;
        self.exit = Some(status);
        self.input.close();
        Ok(())
    }
}

/// Wait up to `grace` for `child` to exit on its own, then kill it.
pub(crate) fn wait_or_kill(
    child: &mut Child,
    grace: Duration,
    label: &str,
) -> std::io::Result<ExitStatus> {
    let deadline = Instant::now() + grace;
    loop {
        match child.try_wait()? {
            Some(status) => {
                log::info!("{}: exited with {}", label, status);
                return Ok(status);
            }
            None if Instant::now() >= deadline => {
                log::warn!("{}: did not exit within {:?}, killing", label, grace);
                child.kill()?;
                return child.wait();
            }
            None => thread::sleep(EXIT_POLL),
        }
    }
}

impl Drop for StreamDecoder {
    fn drop(&mut self) {
        if let Err(err) = self.close() {
            log::warn!("decoder: close on drop failed: {}", err);
        }
    }
}

/// Iterator over decoded frames. Ends when the decoder exits or its output fails.
pub struct Frames<'a> {
    child: &'a mut Child,
    output: Option<ChildStdout>,
    assembler: FrameAssembler,
    chunk: Vec<u8>,
    width: u32,
    height: u32,
    sequence: u64,
}

impl Frames<'_> {
    fn finish(&mut self) -> Option<RawFrame> {
        self.output = None;
        None
    }
}

impl Iterator for Frames<'_> {
    type Item = RawFrame;

    fn next(&mut self) -> Option<RawFrame> {
        loop {
            if let Some(bytes) = self.assembler.next_frame() {
                let frame = RawFrame::from_decoded(bytes, self.width, self.height, self.sequence);
                self.sequence += 1;
                return Some(frame);
            }
            let output = self.output.as_mut()?;
            match output.read(&mut self.chunk) {
                Ok(0) => match self.child.try_wait() {
                    Ok(Some(status)) => {
                        log::info!(
                            "decoder: output ended ({}), {} trailing bytes withheld",
                            status,
                            self.assembler.pending_len()
                        );
                        return self.finish();
                    }
                    Ok(None) => thread::sleep(EMPTY_READ_BACKOFF),
                    Err(err) => {
                        log::warn!("decoder: cannot poll process: {}", err);
                        return self.finish();
                    }
                },
                Ok(n) => self.assembler.push(&self.chunk[..n]),
                Err(err) if err.kind() == ErrorKind::Interrupted => {}
                Err(err) => {
                    log::warn!("decoder: read failed: {}", err);
                    return self.finish();
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frames_from_chunks(frame_len: usize, chunks: &[&[u8]]) -> (Vec<Vec<u8>>, usize) {
        let mut assembler = FrameAssembler::new(frame_len);
        let mut out = Vec::new();
        for chunk in chunks {
            assembler.push(chunk);
            while let Some(frame) = assembler.next_frame() {
                out.push(frame);
            }
        }
        (out, assembler.pending_len())
    }

    #[test]
    fn slicing_is_independent_of_chunking() {
        let stream: Vec<u8> = (0..1000u32).map(|i| (i % 251) as u8).collect();

        let whole = frames_from_chunks(300, &[&stream]);
        let singles: Vec<&[u8]> = stream.chunks(1).collect();
        let bytewise = frames_from_chunks(300, &singles);
        let odd: Vec<&[u8]> = stream.chunks(77).collect();
        let uneven = frames_from_chunks(300, &odd);

        assert_eq!(whole.0.len(), 3);
        assert_eq!(whole, bytewise);
        assert_eq!(whole, uneven);
        assert!(whole.0.iter().all(|f| f.len() == 300));
        assert_eq!(whole.0[1][0], stream[300]);
        // 1000 - 3 * 300 bytes stay buffered until completed.
        assert_eq!(whole.1, 100);
    }

    #[test]
    fn partial_frame_is_withheld_until_complete() {
        let mut assembler = FrameAssembler::new(4);
        assembler.push(&[1, 2, 3]);
        assert!(assembler.next_frame().is_none());
        assembler.push(&[4, 5]);
        assert_eq!(assembler.next_frame(), Some(vec![1, 2, 3, 4]));
        assert!(assembler.next_frame().is_none());
        assert_eq!(assembler.pending_len(), 1);
    }

    #[test]
    fn zero_length_frames_never_yield() {
        let mut assembler = FrameAssembler::new(0);
        assembler.push(&[1, 2, 3]);
        assert!(assembler.next_frame().is_none());
    }

    #[test]
    fn missing_program_is_decoder_unavailable() {
        let result = StreamDecoder::spawn(DecoderConfig::passthrough(
            "/nonexistent/lapwatch-decoder",
        ));
        assert!(matches!(result, Err(IngestError::DecoderUnavailable(_))));
    }

    #[cfg(unix)]
    #[test]
    fn passthrough_process_yields_whole_frames() {
        let mut decoder = StreamDecoder::spawn(DecoderConfig::passthrough("cat")).unwrap();
        let feeder = decoder.feeder();
        let writer = thread::spawn(move || {
            let data: Vec<u8> = (0..650u32).map(|i| i as u8).collect();
            for chunk in data.chunks(33) {
                feeder.feed(chunk);
            }
            feeder.close();
        });

        let frames: Vec<RawFrame> = decoder.frames(10, 10).collect();
        writer.join().unwrap();

        assert_eq!(frames.len(), 2);
        assert!(frames.iter().all(|f| f.len() == 300));
        assert_eq!(frames[0].sequence, 0);
        assert_eq!(frames[1].sequence, 1);
        assert_eq!(frames[1].as_bytes()[0], 300u32 as u8);

        // Non-restartable.
        assert_eq!(decoder.frames(10, 10).count(), 0);
        decoder.close().unwrap();
        decoder.close().unwrap();
    }

    #[cfg(unix)]
    #[test]
    fn feed_after_close_is_swallowed() {
        let mut decoder = StreamDecoder::spawn(DecoderConfig::passthrough("cat")).unwrap();
        decoder.close().unwrap();
        decoder.feed(&[1, 2, 3]);
        assert!(decoder.feeder().is_closed());
    }
}
