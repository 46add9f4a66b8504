//! Power and laser toggles as read-decide-write sequences.
//!
//! Callers pass the handle out of an [`AccessSerializer`](super::AccessSerializer)
//! guard and keep the guard for the whole call, settle delay included.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::time::sleep;

use super::status::{
    is_laser_on, is_laser_power_capable, is_peltier_active, STATUS_HEATER_LOOP, STATUS_PELTIER_LOOP,
};
use super::{DeviceError, DeviceHandle, DeviceMode, Field, Result};

/// Pause after switching the laser so its current settles before anyone polls it.
pub const LASER_SETTLE: Duration = Duration::from_millis(20);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PowerToggleOutcome {
    PoweredOn,
    PoweredOff,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum LaserToggleOutcome {
    SwitchedOn { setpoint: f64 },
    SwitchedOff { cached_current: f64 },
    /// Exactly one of the laser status bits was set. Nothing was written.
    Anomaly { laser_on: bool, laser_power: bool },
}

/// Board family from its identity string.
pub fn classify_mode(identity: &str) -> DeviceMode {
    DeviceMode::classify(identity)
}

/// Start the temperature loops if the supply is idle, otherwise stop them.
///
/// A failure part way through is rolled back on a best-effort basis, so the
/// supply ends up as it was before the call.
pub async fn power_toggle(device: &mut dyn DeviceHandle, mode: DeviceMode) -> Result<PowerToggleOutcome> {
    let status = device.status_register().await?;

    if !is_peltier_active(status) {
        let result = power_on(device, mode).await;
        if let Err(e) = result {
            log::warn!("Power on failed ({}), switching the loops back off", e);
            rollback("peltier loop off", device.peltier_loop_off().await);
            rollback("heater loop off", device.heater_loop_off().await);
            return Err(e);
        }
        log::info!("Power on ({} board)", mode);
        Ok(PowerToggleOutcome::PoweredOn)
    } else {
        let result = power_off(device).await;
        if let Err(e) = result {
            log::warn!("Power off failed ({}), restarting the loops that were running", e);
            if status & STATUS_PELTIER_LOOP != 0 {
                rollback("peltier loop on", device.peltier_loop_on().await);
            }
            if status & STATUS_HEATER_LOOP != 0 {
                rollback("heater loop on", device.heater_loop_on().await);
            }
            return Err(e);
        }
        log::info!("Power off ({} board)", mode);
        Ok(PowerToggleOutcome::PoweredOff)
    }
}

async fn power_on(device: &mut dyn DeviceHandle, mode: DeviceMode) -> Result<()> {
    device.peltier_loop_on().await?;
    if mode.has_heater_loop() {
        device.heater_loop_on().await?;
    }
    Ok(())
}

async fn power_off(device: &mut dyn DeviceHandle) -> Result<()> {
    device.peltier_loop_off().await?;
    // harmless on CPPS boards, which have no heater loop running
    device.heater_loop_off().await
}

/// Switch the laser between its two steady states.
///
/// From fully off the laser is reset and ramped to `setpoint`; from fully on
/// the running current is remembered on the handle before switching off.
/// Either way a failed switch is undone before the error is returned.
pub async fn laser_toggle(device: &mut dyn DeviceHandle, setpoint: f64, settle: Duration) -> Result<LaserToggleOutcome> {
    let status = device.status_register().await?;
    let laser_on = is_laser_on(status);
    let laser_power = is_laser_power_capable(status);

    match (laser_on, laser_power) {
        (false, false) => {
            let result = switch_laser_on(device, setpoint).await;
            if let Err(e) = result {
                log::warn!("Laser on failed ({}), switching it back off", e);
                rollback("laser off", device.laser_off().await);
                return Err(e);
            }
            sleep(settle).await;
            log::info!("Laser on at {:.3} mA", setpoint);
            Ok(LaserToggleOutcome::SwitchedOn { setpoint })
        }
        (true, true) => {
            let current = device.read(Field::LaserCurrent).await?;
            device.remember_laser_current(current);
            let result = device.laser_off().await;
            if let Err(e) = result {
                log::warn!("Laser off failed ({}), restoring {:.3} mA", e, current);
                rollback("laser on", device.laser_on(current).await);
                return Err(e);
            }
            sleep(settle).await;
            log::info!("Laser off (was {:.3} mA)", current);
            Ok(LaserToggleOutcome::SwitchedOff { cached_current: current })
        }
        (laser_on, laser_power) => {
            log::warn!(
                "Laser toggle ignored: inconsistent status 0x{:04X} (on={}, power={})",
                status,
                laser_on,
                laser_power
            );
            Ok(LaserToggleOutcome::Anomaly { laser_on, laser_power })
        }
    }
}

async fn switch_laser_on(device: &mut dyn DeviceHandle, setpoint: f64) -> Result<()> {
    // laser_on() with stale internal state can mis-set the current
    device.laser_off().await?;
    device.laser_on(setpoint).await
}

/// Compensating calls are best effort; the caller sees the original error.
fn rollback(step: &str, result: Result<()>) {
    match result {
        Ok(()) => log::debug!("Rolled back with {}", step),
        // the board refuses a restore that is already in place
        Err(DeviceError::LaserAlreadyOn) => log::debug!("Nothing to roll back for {}", step),
        Err(e) => log::error!("Rollback ({}) failed, board state may be inconsistent: {}", step, e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::mock::{DeviceCall, MockDevice, MockFault};
    use crate::device::status::{self, POWER_LASER, STATUS_LASER_ON};

    #[tokio::test]
    async fn test_power_toggle_epps_drives_heater_loop() {
        let mut mock = MockDevice::epps();
        let outcome = power_toggle(&mut mock, DeviceMode::Epps).await.unwrap();

        assert_eq!(outcome, PowerToggleOutcome::PoweredOn);
        assert_eq!(mock.writes(), vec![DeviceCall::PeltierLoopOn, DeviceCall::HeaterLoopOn]);
    }

    #[tokio::test]
    async fn test_power_toggle_cpps_skips_heater_loop() {
        let mut mock = MockDevice::cpps();
        power_toggle(&mut mock, DeviceMode::Cpps).await.unwrap();

        assert_eq!(mock.writes(), vec![DeviceCall::PeltierLoopOn]);
    }

    #[tokio::test]
    async fn test_power_toggle_twice_returns_to_idle() {
        let mut mock = MockDevice::epps();
        assert!(!status::is_peltier_active(mock.status()));

        power_toggle(&mut mock, DeviceMode::Epps).await.unwrap();
        assert!(status::is_peltier_active(mock.status()));

        mock.clear_calls();
        let outcome = power_toggle(&mut mock, DeviceMode::Epps).await.unwrap();
        assert_eq!(outcome, PowerToggleOutcome::PoweredOff);
        assert!(!status::is_peltier_active(mock.status()));
        assert_eq!(mock.writes(), vec![DeviceCall::PeltierLoopOff, DeviceCall::HeaterLoopOff]);
    }

    #[tokio::test]
    async fn test_power_off_always_stops_heater_loop() {
        let mut mock = MockDevice::cpps();
        power_toggle(&mut mock, DeviceMode::Cpps).await.unwrap();
        mock.clear_calls();

        power_toggle(&mut mock, DeviceMode::Cpps).await.unwrap();
        assert_eq!(mock.writes(), vec![DeviceCall::PeltierLoopOff, DeviceCall::HeaterLoopOff]);
    }

    #[tokio::test]
    async fn test_laser_toggle_on_resets_before_ramping() {
        let mut mock = MockDevice::epps();
        let outcome = laser_toggle(&mut mock, 17.5, Duration::ZERO).await.unwrap();

        assert_eq!(outcome, LaserToggleOutcome::SwitchedOn { setpoint: 17.5 });
        assert_eq!(mock.writes(), vec![DeviceCall::LaserOff, DeviceCall::LaserOn(17.5)]);
        assert_eq!(mock.field(Field::LaserCurrent), 17.5);
    }

    #[tokio::test]
    async fn test_laser_toggle_round_trip_caches_current() {
        let mut mock = MockDevice::epps();
        laser_toggle(&mut mock, 22.0, Duration::ZERO).await.unwrap();
        // the running current drifts away from the setpoint
        mock.set_field(Field::LaserCurrent, 21.8);
        mock.clear_calls();

        let outcome = laser_toggle(&mut mock, 5.0, Duration::ZERO).await.unwrap();
        assert_eq!(outcome, LaserToggleOutcome::SwitchedOff { cached_current: 21.8 });
        assert_eq!(mock.last_laser_current(), Some(21.8));
        assert!(!status::is_laser_on(mock.status()));
        assert!(!status::is_laser_power_capable(mock.status()));
        assert_eq!(
            mock.calls(),
            vec![DeviceCall::StatusRegister, DeviceCall::Read(Field::LaserCurrent), DeviceCall::LaserOff]
        );
    }

    #[tokio::test]
    async fn test_laser_toggle_transitional_state_writes_nothing() {
        for (power, loops) in [(POWER_LASER, 0), (0, STATUS_LASER_ON)] {
            let mut mock = MockDevice::epps();
            mock.force_registers(power, loops);

            let outcome = laser_toggle(&mut mock, 10.0, Duration::ZERO).await.unwrap();
            assert!(matches!(outcome, LaserToggleOutcome::Anomaly { .. }));
            assert!(mock.writes().is_empty());
        }
    }

    #[tokio::test]
    async fn test_laser_toggle_waits_for_settle() {
        let mut mock = MockDevice::epps();
        let started = std::time::Instant::now();
        laser_toggle(&mut mock, 10.0, LASER_SETTLE).await.unwrap();
        assert!(started.elapsed() >= LASER_SETTLE);
    }

    #[tokio::test]
    async fn test_timeout_on_status_read_surfaces_without_mutation() {
        let mut mock = MockDevice::epps();
        mock.fail_next(MockFault::Timeout);

        let err = power_toggle(&mut mock, DeviceMode::Epps).await.unwrap_err();
        assert!(matches!(err, DeviceError::Timeout));
        assert!(mock.writes().is_empty());
        assert_eq!(mock.power(), 0);
    }

    #[test]
    fn test_classify_mode() {
        assert_eq!(classify_mode("SPDC driver, svn-05"), DeviceMode::Cpps);
        assert_eq!(classify_mode("unknown-fw-1.0"), DeviceMode::Epps);
    }

    #[tokio::test]
    async fn test_failed_heater_start_switches_peltier_back_off() {
        let mut mock = MockDevice::epps();
        // status read, peltier loop on, heater loop on
        mock.inject_fault(2, MockFault::Timeout);

        let err = power_toggle(&mut mock, DeviceMode::Epps).await.unwrap_err();
        assert!(matches!(err, DeviceError::Timeout));
        assert_eq!((mock.power(), mock.status()), (0, 0));
        assert_eq!(
            mock.writes(),
            vec![
                DeviceCall::PeltierLoopOn,
                DeviceCall::HeaterLoopOn,
                DeviceCall::PeltierLoopOff,
                DeviceCall::HeaterLoopOff,
            ]
        );
    }

    #[tokio::test]
    async fn test_failed_power_off_restarts_running_loops() {
        let mut mock = MockDevice::epps();
        power_toggle(&mut mock, DeviceMode::Epps).await.unwrap();
        let before = (mock.power(), mock.status());
        mock.clear_calls();
        mock.inject_fault(2, MockFault::Timeout);

        let err = power_toggle(&mut mock, DeviceMode::Epps).await.unwrap_err();
        assert!(matches!(err, DeviceError::Timeout));
        assert_eq!((mock.power(), mock.status()), before);
        assert!(status::is_peltier_active(mock.status()));
    }

    #[tokio::test]
    async fn test_failed_laser_off_keeps_laser_and_caches_current() {
        let mut mock = MockDevice::epps();
        laser_toggle(&mut mock, 18.0, Duration::ZERO).await.unwrap();
        let before = (mock.power(), mock.status());
        mock.clear_calls();
        // status read, current read, laser off
        mock.inject_fault(2, MockFault::Timeout);

        let err = laser_toggle(&mut mock, 5.0, Duration::ZERO).await.unwrap_err();
        assert!(matches!(err, DeviceError::Timeout));
        assert_eq!((mock.power(), mock.status()), before);
        assert_eq!(mock.field(Field::LaserCurrent), 18.0);
        assert_eq!(mock.last_laser_current(), Some(18.0));
    }

    #[tokio::test]
    async fn test_failed_laser_on_leaves_laser_off() {
        let mut mock = MockDevice::epps();
        // status read, reset, laser on
        mock.inject_fault(2, MockFault::Timeout);

        let err = laser_toggle(&mut mock, 12.0, Duration::ZERO).await.unwrap_err();
        assert!(matches!(err, DeviceError::Timeout));
        assert_eq!((mock.power(), mock.status()), (0, 0));
        assert_eq!(mock.writes().last(), Some(&DeviceCall::LaserOff));
    }
}
