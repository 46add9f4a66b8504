use std::time::{Duration, Instant};

use chrono::Utc;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout};
use uuid::Uuid;

use super::types::{PollEvent, SessionFault, TelemetryEvent};
use crate::config::SupervisorSettings;
use crate::device::{AccessSerializer, DeviceHandle, DeviceMode, Field, Result, TelemetrySnapshot};

/// How a poll loop ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollExit {
    /// Stop was requested.
    Stopped,
    /// A non-transient device error ended the session.
    Faulted,
    /// The event receiver was dropped.
    ConsumerGone,
    /// The loop did not acknowledge the stop in time and was cancelled.
    Aborted,
}

/// Background task that snapshots the device every poll interval.
pub struct TelemetryPoller {
    session_id: Uuid,
    task_handle: JoinHandle<PollExit>,
    stop_tx: mpsc::Sender<()>,
    stop_timeout: Duration,
}

impl TelemetryPoller {
    /// Spawn the poll loop. Events arrive on the returned receiver.
    ///
    /// Fails with [`DeviceError::Config`](crate::device::DeviceError::Config) when `settings` do not validate.
    pub fn start(
        access: AccessSerializer,
        mode: DeviceMode,
        settings: &SupervisorSettings,
    ) -> Result<(Self, mpsc::Receiver<PollEvent>)> {
        settings.validate()?;
        let (stop_tx, stop_rx) = mpsc::channel(1);
        let (events_tx, events_rx) = mpsc::channel(settings.event_capacity);
        let session_id = Uuid::new_v4();
        let interval = settings.poll_interval();

        let task_handle = tokio::spawn(async move {
            Self::polling_loop(session_id, access, mode, interval, events_tx, stop_rx).await
        });

        let poller = Self {
            session_id,
            task_handle,
            stop_tx,
            stop_timeout: settings.stop_timeout(),
        };
        Ok((poller, events_rx))
    }

    pub fn session_id(&self) -> Uuid {
        self.session_id
    }

    pub fn is_finished(&self) -> bool {
        self.task_handle.is_finished()
    }

    /// Ask the loop to exit and wait until it has.
    ///
    /// Once this returns the loop holds no access guard and will not touch the
    /// device again, so the handle may be closed.
    pub async fn stop(self) -> PollExit {
        let Self {
            session_id,
            mut task_handle,
            stop_tx,
            stop_timeout,
        } = self;

        // the loop may already be gone; that is fine
        let _ = stop_tx.send(()).await;

        match timeout(stop_timeout, &mut task_handle).await {
            Ok(Ok(exit)) => exit,
            Ok(Err(e)) => {
                log::error!("Poll session {} task failed: {}", session_id, e);
                PollExit::Aborted
            }
            Err(_) => {
                log::warn!("Poll session {} did not stop within {:?}, cancelling", session_id, stop_timeout);
                task_handle.abort();
                let _ = task_handle.await;
                PollExit::Aborted
            }
        }
    }

    async fn polling_loop(
        session_id: Uuid,
        access: AccessSerializer,
        mode: DeviceMode,
        interval: Duration,
        events_tx: mpsc::Sender<PollEvent>,
        mut stop_rx: mpsc::Receiver<()>,
    ) -> PollExit {
        let session_started = Utc::now();
        let start_time = Instant::now();
        let mut last = TelemetrySnapshot::default();
        let mut cycle = 0u64;
        let mut stale_cycles = 0u64;

        log::info!("Starting telemetry polling for {} device (session {}, every {:?})", mode, session_id, interval);

        let exit = loop {
            tokio::select! {
                _ = stop_rx.recv() => break PollExit::Stopped,
                _ = sleep(interval) => {}
            }

            let result = {
                let mut device = tokio::select! {
                    _ = stop_rx.recv() => break PollExit::Stopped,
                    guard = access.acquire() => guard,
                };
                read_snapshot(&mut **device).await
            };

            let (snapshot, stale) = match result {
                Ok(snapshot) => (snapshot, false),
                Err(e) if e.is_transient() => {
                    stale_cycles += 1;
                    log::debug!("Poll cycle {} timed out, repeating previous snapshot", cycle + 1);
                    (last.clone(), true)
                }
                Err(e) => {
                    log::error!("Telemetry polling for session {} failed: {}", session_id, e);
                    // a stalled consumer must not hold up a stop request
                    tokio::select! {
                        _ = stop_rx.recv() => {
                            log::warn!("Stop requested before session {} fault was delivered", session_id);
                        }
                        _ = events_tx.send(PollEvent::Terminated(SessionFault::from(&e))) => {}
                    }
                    break PollExit::Faulted;
                }
            };

            cycle += 1;
            last = snapshot.clone();
            let event = TelemetryEvent {
                session_id,
                session_started,
                now: Utc::now(),
                elapsed: start_time.elapsed(),
                cycle,
                snapshot,
                mode,
                stale,
            };

            match events_tx.try_send(PollEvent::Snapshot(event)) {
                Ok(()) => {}
                Err(TrySendError::Full(_)) => {
                    log::warn!("Telemetry consumer is lagging, dropped cycle {}", cycle);
                }
                Err(TrySendError::Closed(_)) => {
                    log::info!("Telemetry consumer went away");
                    break PollExit::ConsumerGone;
                }
            }
        };

        log::info!(
            "Stopped telemetry polling for session {} ({:?}, ran for {:?}, {} cycles, {} stale)",
            session_id,
            exit,
            start_time.elapsed(),
            cycle,
            stale_cycles
        );
        exit
    }
}

/// Read the seven telemetry fields in one guarded burst.
pub async fn read_snapshot(device: &mut dyn DeviceHandle) -> Result<TelemetrySnapshot> {
    let laser_current = device.read(Field::LaserCurrent).await?;
    let peltier_temp = device.read(Field::PeltierTemp).await?;
    let peltier_voltage = device.read(Field::PeltierVoltage).await?;
    let pconst_p = device.read(Field::PConstP).await?;
    let pconst_i = device.read(Field::PConstI).await?;
    let power = device.power_register().await?;
    let status = device.status_register().await?;

    Ok(TelemetrySnapshot {
        laser_current,
        peltier_temp,
        peltier_voltage,
        pconst_p,
        pconst_i,
        power,
        status,
        captured_at: Some(Instant::now()),
    })
}
