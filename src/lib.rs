pub mod config;
pub mod device;
pub mod serial;
pub mod telemetry;

use std::path::PathBuf;

use anyhow::Context;
use clap::Parser;
use tokio::sync::mpsc;

use config::SupervisorSettings;
use device::commands::LaserToggleOutcome;
use device::mock::MockDevice;
use device::{DeviceHandle, DeviceManager, SpdcDriver};
use telemetry::PollEvent;

#[derive(Parser, Debug)]
#[command(name = "spdc-supervisor", about = "Supervise an SPDC laser and peltier driver board", version)]
pub struct Cli {
    /// Serial port the board is attached to, e.g. /dev/ttyACM0
    #[arg(short, long, required_unless_present = "simulate")]
    pub port: Option<String>,

    /// JSON settings file; missing fields fall back to defaults
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Overrides the level from the settings file (RUST_LOG wins over both)
    #[arg(long)]
    pub log_level: Option<String>,

    /// Run against an in-memory EPPS board instead of a serial port
    #[arg(long)]
    pub simulate: bool,

    /// Toggle the temperature loops once after connecting
    #[arg(long)]
    pub power_toggle: bool,

    /// Toggle the laser once after connecting, ramping to this current (mA) if it was off
    #[arg(long, value_name = "MA")]
    pub laser_toggle: Option<f64>,

    /// Stop after this many telemetry cycles; runs until Ctrl-C otherwise
    #[arg(long)]
    pub cycles: Option<u64>,
}

pub fn run() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let settings = match &cli.config {
        Some(path) => SupervisorSettings::load(path)?,
        None => SupervisorSettings::default(),
    };
    let level = cli.log_level.clone().unwrap_or_else(|| settings.log_level.clone());
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level)).init();

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("failed to start async runtime")?;
    runtime.block_on(supervise(cli, settings))
}

async fn supervise(cli: Cli, settings: SupervisorSettings) -> anyhow::Result<()> {
    let handle: Box<dyn DeviceHandle> = if cli.simulate {
        log::info!("Using simulated EPPS board");
        Box::new(MockDevice::epps())
    } else {
        let port = cli.port.as_deref().context("no serial port given")?;
        let driver = SpdcDriver::open(port, &settings)
            .await
            .with_context(|| format!("failed to open {}", port))?;
        Box::new(driver)
    };

    let manager = DeviceManager::new(settings);
    let (summary, mut events) = manager.connect(handle).await?;
    if !summary.identity.contains(SpdcDriver::DEVICE_IDENTIFIER) {
        log::warn!("'{}' does not look like an SPDC driver board", summary.identity);
    }
    log::info!(
        "Session {}: {} board, laser {} mA (limit {} mA), power {}, laser {}",
        summary.session_id,
        summary.mode,
        summary.laser_current,
        summary.laser_current_limit,
        summary.panel.power_indicator.colour(),
        summary.panel.laser_indicator.colour()
    );

    let result = drive(&manager, &cli, &mut events).await;
    // the board is closed on every exit path, including a faulted session
    if let Err(e) = manager.disconnect().await {
        log::error!("Disconnect failed: {}", e);
    }
    result
}

async fn drive(manager: &DeviceManager, cli: &Cli, events: &mut mpsc::Receiver<PollEvent>) -> anyhow::Result<()> {
    if cli.power_toggle {
        let outcome = manager.request_power_toggle().await?;
        log::info!("Power toggle: {:?}", outcome);
    }
    if let Some(setpoint) = cli.laser_toggle {
        match manager.request_laser_toggle(setpoint).await? {
            LaserToggleOutcome::Anomaly { laser_on, laser_power } => {
                log::warn!("Laser left alone, board is mid-transition (on={}, power={})", laser_on, laser_power)
            }
            outcome => log::info!("Laser toggle: {:?}", outcome),
        }
    }

    let mut seen = 0u64;
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                log::info!("Interrupted, shutting down");
                return Ok(());
            }
            event = events.recv() => match event {
                Some(PollEvent::Snapshot(event)) => {
                    let panel = event.snapshot.panel_state();
                    println!("{}", serde_json::to_string(&event)?);
                    log::debug!(
                        "Cycle {}: power {}, laser {}, controls {}",
                        event.cycle,
                        panel.power_indicator.colour(),
                        panel.laser_indicator.colour(),
                        if panel.current_control_enabled { "enabled" } else { "disabled" }
                    );
                    seen += 1;
                    if cli.cycles.is_some_and(|n| seen >= n) {
                        return Ok(());
                    }
                }
                Some(PollEvent::Terminated(fault)) => anyhow::bail!("session ended: {}", fault.message),
                None => return Ok(()),
            }
        }
    }
}
