use anyhow::{anyhow, Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;
use std::time::Duration;

use crate::analysis::{Zone, ZoneSettings};
use crate::controller::{SessionSettings, DEFAULT_IDLE_TIMEOUT};
use crate::decoder::DecoderConfig;
use crate::protocol::{ClientConfig, DEFAULT_SCHEMA_VERSION};

const DEFAULT_WS_URL: &str = "ws://homeassistant.local:3000";
const DEFAULT_API_ADDR: &str = "127.0.0.1:8080";
const DEFAULT_FFMPEG: &str = "ffmpeg";
const DEFAULT_RECORD_DIR: &str = ".";
const DEFAULT_RESPONSE_TIMEOUT_SECS: u64 = 30;

#[derive(Debug, Deserialize, Default)]
struct LapwatchConfigFile {
    device: Option<DeviceConfigFile>,
    decoder: Option<DecoderConfigFile>,
    session: Option<SessionConfigFile>,
    api: Option<ApiConfigFile>,
    zones: Option<ZoneConfigFile>,
}

#[derive(Debug, Deserialize, Default)]
struct DeviceConfigFile {
    url: Option<String>,
    serial: Option<String>,
    schema_version: Option<u32>,
    response_timeout_secs: Option<u64>,
}

#[derive(Debug, Deserialize, Default)]
struct DecoderConfigFile {
    program: Option<String>,
    args: Option<Vec<String>>,
}

#[derive(Debug, Deserialize, Default)]
struct SessionConfigFile {
    idle_timeout_secs: Option<u64>,
    record_dir: Option<PathBuf>,
    recorder_program: Option<String>,
}

#[derive(Debug, Deserialize, Default)]
struct ApiConfigFile {
    addr: Option<String>,
}

#[derive(Debug, Deserialize, Default)]
struct ZoneConfigFile {
    start: Option<Zone>,
    end: Option<Zone>,
    motion_threshold: Option<f32>,
    process_every_n_frames: Option<u32>,
    annotate: Option<bool>,
}

#[derive(Debug, Clone)]
pub struct LapwatchConfig {
    pub device: DeviceSettings,
    pub decoder: DecoderConfig,
    pub idle_timeout: Duration,
    pub record_dir: PathBuf,
    pub recorder_program: String,
    pub api_addr: String,
    pub zones: ZoneSettings,
}

#[derive(Debug, Clone)]
pub struct DeviceSettings {
    pub url: String,
    pub serial: String,
    pub schema_version: u32,
    pub response_timeout: Duration,
}

impl LapwatchConfig {
    /// Load from `LAPWATCH_CONFIG` (if set), then apply environment overrides.
    pub fn load() -> Result<Self> {
        let config_path = std::env::var("LAPWATCH_CONFIG").ok();
        Self::load_from(config_path.as_deref().map(Path::new))
    }

    pub fn load_from(path: Option<&Path>) -> Result<Self> {
        let file_cfg = match path {
            Some(path) => Some(read_config_file(path)?),
            None => None,
        };
        let mut cfg = Self::from_file(file_cfg.unwrap_or_default());
        cfg.apply_env()?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Settings for the lifecycle controller's sessions.
    pub fn session_settings(&self) -> SessionSettings {
        SessionSettings {
            client: ClientConfig {
                url: self.device.url.clone(),
                device_serial: self.device.serial.clone(),
                schema_version: self.device.schema_version,
                response_timeout: self.device.response_timeout,
            },
            decoder: self.decoder.clone(),
            idle_timeout: self.idle_timeout,
        }
    }

    fn from_file(file: LapwatchConfigFile) -> Self {
        let device = file.device.unwrap_or_default();
        let device = DeviceSettings {
            url: device.url.unwrap_or_else(|| DEFAULT_WS_URL.to_string()),
            serial: device.serial.unwrap_or_default(),
            schema_version: device.schema_version.unwrap_or(DEFAULT_SCHEMA_VERSION),
            response_timeout: Duration::from_secs(
                device
                    .response_timeout_secs
                    .unwrap_or(DEFAULT_RESPONSE_TIMEOUT_SECS),
            ),
        };

        let decoder_file = file.decoder.unwrap_or_default();
        let program = decoder_file
            .program
            .unwrap_or_else(|| DEFAULT_FFMPEG.to_string());
        let decoder = match decoder_file.args {
            Some(args) => DecoderConfig {
                args,
                ..DecoderConfig::passthrough(&program)
            },
            None => DecoderConfig::ffmpeg(&program),
        };

        let session = file.session.unwrap_or_default();
        let idle_timeout = session
            .idle_timeout_secs
            .map(Duration::from_secs)
            .unwrap_or(DEFAULT_IDLE_TIMEOUT);
        let record_dir = session
            .record_dir
            .unwrap_or_else(|| PathBuf::from(DEFAULT_RECORD_DIR));
        let recorder_program = session
            .recorder_program
            .unwrap_or_else(|| DEFAULT_FFMPEG.to_string());

        let api_addr = file
            .api
            .and_then(|api| api.addr)
            .unwrap_or_else(|| DEFAULT_API_ADDR.to_string());

        let defaults = ZoneSettings::default();
        let zones = match file.zones {
            Some(zones) => ZoneSettings {
                start: zones.start.unwrap_or(defaults.start),
                end: zones.end.unwrap_or(defaults.end),
                motion_threshold: zones.motion_threshold.unwrap_or(defaults.motion_threshold),
                process_every_n_frames: zones
                    .process_every_n_frames
                    .unwrap_or(defaults.process_every_n_frames),
                annotate: zones.annotate.unwrap_or(defaults.annotate),
            },
            None => defaults,
        };

        Self {
            device,
            decoder,
            idle_timeout,
            record_dir,
            recorder_program,
            api_addr,
            zones,
        }
    }

    fn apply_env(&mut self) -> Result<()> {
        if let Some(url) = non_blank_env("LAPWATCH_WS_URL") {
            self.device.url = url;
        }
        if let Some(serial) = non_blank_env("LAPWATCH_DEVICE_SERIAL") {
            self.device.serial = serial;
        }
        if let Some(version) = non_blank_env("LAPWATCH_SCHEMA_VERSION") {
            self.device.schema_version = version
                .parse()
                .map_err(|_| anyhow!("LAPWATCH_SCHEMA_VERSION must be an integer"))?;
        }
        if let Some(program) = non_blank_env("LAPWATCH_FFMPEG") {
            self.decoder.program = program.clone();
            self.recorder_program = program;
        }
        if let Some(secs) = non_blank_env("LAPWATCH_IDLE_TIMEOUT_SECS") {
            let secs: u64 = secs.parse().map_err(|_| {
                anyhow!("LAPWATCH_IDLE_TIMEOUT_SECS must be an integer number of seconds")
            })?;
            self.idle_timeout = Duration::from_secs(secs);
        }
        if let Some(dir) = non_blank_env("LAPWATCH_RECORD_DIR") {
            self.record_dir = PathBuf::from(dir);
        }
        if let Some(addr) = non_blank_env("LAPWATCH_API_ADDR") {
            self.api_addr = addr;
        }
        Ok(())
    }

    fn validate(&self) -> Result<()> {
        let url = url::Url::parse(&self.device.url)
            .with_context(|| format!("invalid device url '{}'", self.device.url))?;
        // The client speaks plain websockets only.
        if url.scheme() != "ws" {
            return Err(anyhow!(
                "device url must use ws://, got '{}://'",
                url.scheme()
            ));
        }
        validate_serial(&self.device.serial)?;
        if self.device.response_timeout.is_zero() {
            return Err(anyhow!("response timeout must be greater than zero"));
        }
        if self.idle_timeout.is_zero() {
            return Err(anyhow!("idle timeout must be greater than zero"));
        }
        if self.decoder.program.trim().is_empty() {
            return Err(anyhow!("decoder program must not be empty"));
        }
        if self.zones.start.is_empty() || self.zones.end.is_empty() {
            return Err(anyhow!("start and end zones must have positive width and height"));
        }
        if self.zones.process_every_n_frames == 0 {
            return Err(anyhow!("process_every_n_frames must be at least 1"));
        }
        if !self.zones.motion_threshold.is_finite() || self.zones.motion_threshold < 0.0 {
            return Err(anyhow!("motion_threshold must be a non-negative number"));
        }
        Ok(())
    }
}

/// Device serial numbers are short uppercase alphanumerics (e.g. "T8113T7223242231").
pub fn validate_serial(serial: &str) -> Result<()> {
    static SERIAL_RE: OnceLock<regex::Regex> = OnceLock::new();
    let re = SERIAL_RE.get_or_init(|| {
        regex::Regex::new(r"^[A-Za-z0-9_-]{1,64}$").expect("serial pattern is valid")
    });
    if serial.is_empty() {
        return Err(anyhow!(
            "device serial is required (set device.serial or LAPWATCH_DEVICE_SERIAL)"
        ));
    }
    if !re.is_match(serial) {
        return Err(anyhow!("device serial '{}' is malformed", serial));
    }
    Ok(())
}

fn non_blank_env(key: &str) -> Option<String> {
    std::env::var(key)
        .ok()
        .filter(|value| !value.trim().is_empty())
}

fn read_config_file(path: &Path) -> Result<LapwatchConfigFile> {
    let raw = std::fs::read_to_string(path)
        .map_err(|e| anyhow!("failed to read config file {}: {}", path.display(), e))?;
    let is_toml = path
        .extension()
        .is_some_and(|ext| ext.eq_ignore_ascii_case("toml"));
    let cfg = if is_toml {
        toml::from_str(&raw).map_err(|e| anyhow!("invalid config file {}: {}", path.display(), e))?
    } else {
        serde_json::from_str(&raw)
            .map_err(|e| anyhow!("invalid config file {}: {}", path.display(), e))?
    };
    Ok(cfg)
}
