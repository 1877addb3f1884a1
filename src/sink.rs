//! Frame sinks: where processed frames end up.

use anyhow::{anyhow, Context, Result};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::{Child, ChildStdin, Command, Stdio};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use crate::decoder::wait_or_kill;
use crate::frame::{RawFrame, StreamMetadata};

/// Accepts every processed frame of a session.
pub trait FrameSink: Send {
    fn write(&mut self, frame: &RawFrame) -> Result<()>;

    /// Release the sink. Called exactly once at teardown, even after write failures.
    fn close(&mut self) -> Result<()>;
}

/// `record_<unix_secs>.mp4` inside `dir`.
pub fn recording_path(dir: &Path) -> PathBuf {
    let secs = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or_default();
    dir.join(format!("record_{}.mp4", secs))
}

/// Encodes raw BGR frames to an MPEG-4 file through an ffmpeg child process.
pub struct RecordingSink {
    path: PathBuf,
    child: Child,
    stdin: Option<ChildStdin>,
    frames_written: u64,
    shutdown_grace: Duration,
}

impl RecordingSink {
    pub fn open(program: &str, path: &Path, meta: &StreamMetadata) -> Result<Self> {
        let size = format!("{}x{}", meta.width, meta.height);
        let fps = meta.fps.to_string();
        let mut child = Command::new(program)
            .args([
                "-hide_banner",
                "-loglevel",
                "error",
                "-y",
                "-f",
                "rawvideo",
                "-pix_fmt",
                "bgr24",
                "-s",
                size.as_str(),
                "-r",
                fps.as_str(),
                "-i",
                "pipe:0",
                "-c:v",
                "mpeg4",
                "-q:v",
                "5",
            ])
            .arg(path)
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()
            .with_context(|| format!("spawn recorder {}", program))?;
        let stdin = child.stdin.take();
        if stdin.is_none() {
            let _ = child.kill();
            let _ = child.wait();
            return Err(anyhow!("recorder stdin was not captured"));
        }
        log::info!("sink: recording {} @ {} fps to {}", size, fps, path.display());
        Ok(Self {
            path: path.to_path_buf(),
            child,
            stdin,
            frames_written: 0,
            shutdown_grace: Duration::from_secs(5),
        })
    }
}

impl FrameSink for RecordingSink {
    fn write(&mut self, frame: &RawFrame) -> Result<()> {
        let stdin = self
            .stdin
            .as_mut()
            .ok_or_else(|| anyhow!("recorder already closed"))?;
        stdin
            .write_all(frame.as_bytes())
            .with_context(|| format!("write frame {} to recorder", frame.sequence))?;
        self.frames_written += 1;
        Ok(())
    }

    fn close(&mut self) -> Result<()> {
        if self.stdin.take().is_none() {
            return Ok(());
        }
        wait_or_kill(&mut self.child, self.shutdown_grace, "recorder")
            .context("wait for recorder")?;
        log::info!(
            "sink: wrote {} frames to {}",
            self.frames_written,
            self.path.display()
        );
        Ok(())
    }
}

impl Drop for RecordingSink {
    fn drop(&mut self) {
        let _ = self.close();
    }
}
