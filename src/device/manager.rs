use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, RwLock};
use uuid::Uuid;

use super::commands::{self, LaserToggleOutcome, PowerToggleOutcome};
use super::status::PanelState;
use super::{AccessSerializer, DeviceError, DeviceHandle, DeviceMode, Field, Result};
use crate::config::SupervisorSettings;
use crate::telemetry::{PollEvent, TelemetryPoller};

/// What the front end needs to draw right after connecting.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConnectionSummary {
    pub identity: String,
    pub mode: DeviceMode,
    pub panel: PanelState,
    pub laser_current: f64,
    pub laser_current_limit: f64,
    pub session_id: Uuid,
}

/// Registers read once while connecting, before polling starts.
struct Probe {
    identity: String,
    mode: DeviceMode,
    panel: PanelState,
    laser_current: f64,
    laser_current_limit: f64,
}

/// A connected device together with its poller.
struct Session {
    access: AccessSerializer,
    mode: DeviceMode,
    identity: String,
    poller: Option<TelemetryPoller>,
}

/// Owns at most one device session and serialises every operation on it.
pub struct DeviceManager {
    settings: SupervisorSettings,
    session: RwLock<Option<Session>>,
}

impl DeviceManager {
    pub fn new(settings: SupervisorSettings) -> Self {
        Self {
            settings,
            session: RwLock::new(None),
        }
    }

    pub fn settings(&self) -> &SupervisorSettings {
        &self.settings
    }

    /// Take ownership of `handle`, classify the board and start polling it.
    pub async fn connect(&self, mut handle: Box<dyn DeviceHandle>) -> Result<(ConnectionSummary, mpsc::Receiver<PollEvent>)> {
        let mut session_guard = self.session.write().await;
        if session_guard.is_some() {
            return Err(DeviceError::AlreadyConnected);
        }

        if let Err(e) = self.settings.validate() {
            let _ = handle.close().await;
            return Err(e);
        }

        let probe = match Self::probe(handle.as_mut()).await {
            Ok(probe) => probe,
            Err(e) => {
                log::error!("Failed to initialise device: {}", e);
                let _ = handle.close().await;
                return Err(e);
            }
        };
        log::info!("Connected to {} device '{}'", probe.mode, probe.identity);

        let access = AccessSerializer::new(handle);
        let (poller, events) = match TelemetryPoller::start(access.clone(), probe.mode, &self.settings) {
            Ok(started) => started,
            Err(e) => {
                let _ = access.acquire().await.close().await;
                return Err(e);
            }
        };

        let summary = ConnectionSummary {
            identity: probe.identity.clone(),
            mode: probe.mode,
            panel: probe.panel,
            laser_current: probe.laser_current,
            laser_current_limit: probe.laser_current_limit,
            session_id: poller.session_id(),
        };
        *session_guard = Some(Session {
            access,
            mode: probe.mode,
            identity: probe.identity,
            poller: Some(poller),
        });
        Ok((summary, events))
    }

    async fn probe(device: &mut dyn DeviceHandle) -> Result<Probe> {
        let identity = device.identity().await?;
        let mode = commands::classify_mode(&identity);
        log::info!("Device identifies as '{}', classified {}", identity, mode);

        let power = device.power_register().await?;
        let status = device.status_register().await?;
        let laser_current_limit = device.read(Field::LaserCurrentLimit).await?;
        let laser_current = device.read(Field::LaserCurrent).await?;

        Ok(Probe {
            identity,
            mode,
            panel: PanelState::from_registers(power, status),
            laser_current,
            laser_current_limit,
        })
    }

    /// Stop polling, wait for the poller to let go of the device, then close it.
    pub async fn disconnect(&self) -> Result<()> {
        let mut session_guard = self.session.write().await;
        let mut session = session_guard.take().ok_or(DeviceError::NotConnected)?;

        if let Some(poller) = session.poller.take() {
            let exit = poller.stop().await;
            log::debug!("Poller for '{}' exited: {:?}", session.identity, exit);
        }

        let mut device = session.access.acquire().await;
        device.close().await?;
        log::info!("Disconnected from '{}'", session.identity);
        Ok(())
    }

    pub async fn is_connected(&self) -> bool {
        self.session.read().await.is_some()
    }

    pub async fn device_mode(&self) -> Option<DeviceMode> {
        self.session.read().await.as_ref().map(|s| s.mode)
    }

    /// False once the poll loop has ended on its own, e.g. after a fatal fault.
    pub async fn is_polling(&self) -> bool {
        self.session
            .read()
            .await
            .as_ref()
            .and_then(|s| s.poller.as_ref())
            .map(|p| !p.is_finished())
            .unwrap_or(false)
    }

    pub fn request_mode_classification(&self, identity: &str) -> DeviceMode {
        commands::classify_mode(identity)
    }

    pub async fn request_power_toggle(&self) -> Result<PowerToggleOutcome> {
        let session_guard = self.session.read().await;
        let session = session_guard.as_ref().ok_or(DeviceError::NotConnected)?;
        let mut device = session.access.acquire_timeout(self.settings.command_acquire_timeout()).await?;
        commands::power_toggle(&mut **device, session.mode).await
    }

    /// `setpoint` is the current (mA) to ramp to when switching on.
    pub async fn request_laser_toggle(&self, setpoint: f64) -> Result<LaserToggleOutcome> {
        let session_guard = self.session.read().await;
        let session = session_guard.as_ref().ok_or(DeviceError::NotConnected)?;
        let mut device = session.access.acquire_timeout(self.settings.command_acquire_timeout()).await?;
        commands::laser_toggle(&mut **device, setpoint, self.settings.laser_settle()).await
    }

    /// Change the running laser current.
    pub async fn set_laser_current(&self, current: f64) -> Result<()> {
        self.write_field(Field::LaserCurrent, current).await
    }

    pub async fn set_peltier_temp_setpoint(&self, temperature: f64) -> Result<()> {
        self.write_field(Field::PeltierTempSetpoint, temperature).await
    }

    async fn write_field(&self, field: Field, value: f64) -> Result<()> {
        let session_guard = self.session.read().await;
        let session = session_guard.as_ref().ok_or(DeviceError::NotConnected)?;
        let mut device = session.access.acquire_timeout(self.settings.command_acquire_timeout()).await?;
        device.write(field, value).await?;
        log::info!("Set {} to {} {}", field.mnemonic(), value, field.unit());
        Ok(())
    }

    /// The current the laser ran at before it was last switched off.
    pub async fn last_laser_current(&self) -> Result<Option<f64>> {
        let session_guard = self.session.read().await;
        let session = session_guard.as_ref().ok_or(DeviceError::NotConnected)?;
        let device = session.access.acquire_timeout(self.settings.command_acquire_timeout()).await?;
        Ok(device.last_laser_current())
    }
}

impl Drop for DeviceManager {
    fn drop(&mut self) {
        if let Ok(session) = self.session.try_read() {
            if session.is_some() {
                log::warn!("Device manager dropped with a live session; call disconnect() first");
            }
        }
    }
}

impl Default for DeviceManager {
    fn default() -> Self {
        Self::new(SupervisorSettings::default())
    }
}
