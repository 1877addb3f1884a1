//! lapwatchd - lap counting daemon
//!
//! This daemon:
//! 1. Loads configuration (file + environment)
//! 2. Builds the session controller (zone lap counter, mp4 recorder)
//! 3. Serves the control API, or runs a single session with `--once`

use anyhow::Result;
use clap::Parser;
use std::path::PathBuf;
use std::sync::{mpsc, Arc};
use std::time::Duration;

use lapwatch::{
    api::{ApiConfig, ApiServer},
    sink::recording_path,
    AnalyzerFactory, Controller, FrameAnalyzer, FrameSink, LapwatchConfig, RecordingSink,
    SinkFactory, StreamMetadata, ZoneLapCounter,
};

#[derive(Parser, Debug)]
#[command(author, version, about = "Live lap counting from a camera livestream")]
struct Args {
    /// Config file (JSON, or TOML when the extension is .toml).
    #[arg(long, env = "LAPWATCH_CONFIG")]
    config: Option<PathBuf>,

    /// Start a session immediately instead of waiting for GET /start.
    #[arg(long)]
    autostart: bool,

    /// Run one session in the foreground without the control API.
    #[arg(long)]
    once: bool,
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let args = Args::parse();
    let config = LapwatchConfig::load_from(args.config.as_deref())?;
    log::info!(
        "lapwatchd {} for device {} via {}",
        env!("CARGO_PKG_VERSION"),
        config.device.serial,
        config.device.url
    );

    let controller = Arc::new(Controller::new(
        config.session_settings(),
        analyzer_factory(&config),
        sink_factory(&config),
    ));

    let (tx, rx) = mpsc::channel();
    ctrlc::set_handler(move || {
        let _ = tx.send(());
    })
    .expect("error setting Ctrl-C handler");

    if args.once {
        return run_once(&controller, &rx);
    }

    let api_config = ApiConfig {
        addr: config.api_addr.clone(),
    };
    let api_handle = ApiServer::new(api_config, controller.clone()).spawn()?;
    log::info!("control api listening on {}", api_handle.addr);

    if args.autostart && !controller.start() {
        log::warn!("autostart failed; waiting for GET /start");
    }

    log::info!("lapwatchd waiting for shutdown signal (Ctrl-C)...");
    let _ = rx.recv();
    log::info!("shutdown signal received, stopping...");
    controller.stop();
    api_handle.stop()?;
    Ok(())
}

fn run_once(controller: &Controller, shutdown: &mpsc::Receiver<()>) -> Result<()> {
    if !controller.start() {
        return Err(anyhow::anyhow!("session failed to start"));
    }
    loop {
        if controller.wait_idle(Duration::from_millis(250)) {
            break;
        }
        if shutdown.try_recv().is_ok() {
            log::info!("shutdown signal received, stopping session...");
            controller.stop();
            break;
        }
    }
    let status = controller.status();
    log::info!("session finished with {} laps", status.laps);
    Ok(())
}

fn analyzer_factory(config: &LapwatchConfig) -> AnalyzerFactory {
    let zones = config.zones.clone();
    Arc::new(move || Box::new(ZoneLapCounter::new(zones.clone())) as Box<dyn FrameAnalyzer>)
}

fn sink_factory(config: &LapwatchConfig) -> SinkFactory {
    let program = config.recorder_program.clone();
    let dir = config.record_dir.clone();
    Arc::new(
        move |meta: &StreamMetadata| -> anyhow::Result<Box<dyn FrameSink>> {
            std::fs::create_dir_all(&dir)?;
            let path = recording_path(&dir);
            Ok(Box::new(RecordingSink::open(&program, &path, meta)?))
        },
    )
}
