//! In-memory SPDC board.
//!
//! Behaves like the firmware as seen through [`SpdcDriver`](super::SpdcDriver):
//! loop commands drive the supply lines, the upper status bits mirror the
//! POWER register, and switching the laser on while current flows is refused.
//! Every call is logged, faults can be scheduled by call index, and
//! overlapping calls from two owners are detected.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;

use super::driver::check_range;
use super::status::{
    POWER_LASER, POWER_PELTIER, STATUS_HEATER_LOOP, STATUS_LASER_ON, STATUS_PELTIER_LOOP,
};
use super::{DeviceError, DeviceHandle, Field, Result, CPPS_IDENTITIES};

/// A call made against the simulated board.
#[derive(Debug, Clone, PartialEq)]
pub enum DeviceCall {
    Read(Field),
    Write(Field, f64),
    PowerRegister,
    StatusRegister,
    Identity,
    PeltierLoopOn,
    PeltierLoopOff,
    HeaterLoopOn,
    HeaterLoopOff,
    LaserOn(f64),
    LaserOff,
    Close,
}

impl DeviceCall {
    /// True for calls that change device state.
    pub fn is_write(&self) -> bool {
        !matches!(
            self,
            DeviceCall::Read(_) | DeviceCall::PowerRegister | DeviceCall::StatusRegister | DeviceCall::Identity
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MockFault {
    /// The call fails once with a transient timeout.
    Timeout,
    /// The board disappears; this and every later call fail.
    ConnectionLost,
}

struct MockState {
    identity: String,
    power: u32,
    loops: u32,
    fields: HashMap<Field, f64>,
    calls: Vec<DeviceCall>,
    faults: HashMap<usize, MockFault>,
    unplugged: bool,
    in_flight: bool,
    overlap_detected: bool,
    closed: bool,
}

/// Cloneable handle to one simulated board; clones share state.
#[derive(Clone)]
pub struct MockDevice {
    state: Arc<Mutex<MockState>>,
    last_laser_current: Option<f64>,
    op_delay: Duration,
}

impl MockDevice {
    pub fn new(identity: &str) -> Self {
        let fields = HashMap::from([
            (Field::LaserCurrent, 0.0),
            (Field::LaserCurrentLimit, 50.0),
            (Field::PeltierTemp, 24.87),
            (Field::PeltierTempSetpoint, 25.0),
            (Field::PeltierVoltage, 0.0),
            (Field::PeltierVoltageLimit, 2.0),
            (Field::PConstP, 1.5),
            (Field::PConstI, 0.1),
            (Field::HeaterTemp, 23.1),
            (Field::HeaterTempSetpoint, 30.0),
            (Field::HeaterVoltage, 0.0),
            (Field::HeaterVoltageLimit, 8.0),
        ]);
        Self {
            state: Arc::new(Mutex::new(MockState {
                identity: identity.to_string(),
                power: 0,
                loops: 0,
                fields,
                calls: Vec::new(),
                faults: HashMap::new(),
                unplugged: false,
                in_flight: false,
                overlap_detected: false,
                closed: false,
            })),
            last_laser_current: None,
            op_delay: Duration::ZERO,
        }
    }

    pub fn cpps() -> Self {
        Self::new(CPPS_IDENTITIES[0])
    }

    pub fn epps() -> Self {
        Self::new("S-15 Instruments EPPS driver, firmware svn-9. Serial: SPDCSDR-42")
    }

    /// Make every call take `delay`, widening the window in which overlapping
    /// access would be caught.
    pub fn with_op_delay(mut self, delay: Duration) -> Self {
        self.op_delay = delay;
        self
    }

    fn lock(&self) -> MutexGuard<'_, MockState> {
        // a panicking test thread must not hide the state from the others
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Fail the call with zero-based index `call_index` (counted over all calls).
    pub fn inject_fault(&self, call_index: usize, fault: MockFault) {
        self.lock().faults.insert(call_index, fault);
    }

    /// Fail the next call.
    pub fn fail_next(&self, fault: MockFault) {
        let mut state = self.lock();
        let next = state.calls.len();
        state.faults.insert(next, fault);
    }

    /// Every call from now on fails with a lost connection.
    pub fn unplug(&self) {
        self.lock().unplugged = true;
    }

    /// Force raw register contents, e.g. to put the board in a transitional state.
    pub fn force_registers(&self, power: u32, loops: u32) {
        let mut state = self.lock();
        state.power = power;
        state.loops = loops;
    }

    pub fn set_field(&self, field: Field, value: f64) {
        self.lock().fields.insert(field, value);
    }

    pub fn field(&self, field: Field) -> f64 {
        self.lock().fields.get(&field).copied().unwrap_or_default()
    }

    pub fn power(&self) -> u32 {
        self.lock().power
    }

    pub fn status(&self) -> u32 {
        self.lock().status()
    }

    pub fn calls(&self) -> Vec<DeviceCall> {
        self.lock().calls.clone()
    }

    pub fn writes(&self) -> Vec<DeviceCall> {
        self.lock().calls.iter().filter(|c| c.is_write()).cloned().collect()
    }

    pub fn clear_calls(&self) {
        let mut state = self.lock();
        state.calls.clear();
        state.faults.clear();
    }

    pub fn overlap_detected(&self) -> bool {
        self.lock().overlap_detected
    }

    pub fn is_closed(&self) -> bool {
        self.lock().closed
    }

    /// Log the call, apply any scheduled fault and mark the board busy.
    fn begin(&self, call: DeviceCall) -> Result<()> {
        let mut state = self.lock();
        let index = state.calls.len();
        state.calls.push(call);

        if state.in_flight {
            state.overlap_detected = true;
        }
        if state.closed {
            return Err(DeviceError::ConnectionLost("port closed".into()));
        }
        match state.faults.remove(&index) {
            Some(MockFault::ConnectionLost) => state.unplugged = true,
            Some(MockFault::Timeout) if !state.unplugged => return Err(DeviceError::Timeout),
            _ => {}
        }
        if state.unplugged {
            return Err(DeviceError::ConnectionLost("device unplugged".into()));
        }
        state.in_flight = true;
        Ok(())
    }

    async fn run<T>(&self, call: DeviceCall, apply: impl FnOnce(&mut MockState) -> Result<T>) -> Result<T> {
        self.begin(call)?;
        if !self.op_delay.is_zero() {
            tokio::time::sleep(self.op_delay).await;
        }
        let mut state = self.lock();
        state.in_flight = false;
        apply(&mut state)
    }
}

impl MockState {
    fn status(&self) -> u32 {
        // bits 8 and 9 mirror the supply lines
        self.loops | (self.power << 8)
    }

    fn get(&self, field: Field) -> f64 {
        self.fields.get(&field).copied().unwrap_or_default()
    }

    fn laser_limit(&self) -> f64 {
        self.get(Field::LaserCurrentLimit)
    }
}

#[async_trait]
impl DeviceHandle for MockDevice {
    async fn read(&mut self, field: Field) -> Result<f64> {
        self.run(DeviceCall::Read(field), |s| Ok(s.get(field))).await
    }

    async fn write(&mut self, field: Field, value: f64) -> Result<()> {
        self.run(DeviceCall::Write(field, value), |s| {
            if !field.is_writable() {
                return Err(DeviceError::Protocol(format!("{} is read-only", field.mnemonic())));
            }
            let (low, high) = match field {
                Field::LaserCurrent => (0.0, s.laser_limit()),
                Field::PeltierVoltage => {
                    let limit = s.get(Field::PeltierVoltageLimit);
                    (-limit, limit)
                }
                Field::HeaterVoltage => (0.0, s.get(Field::HeaterVoltageLimit)),
                Field::PeltierTempSetpoint => (20.0, 50.0),
                Field::HeaterTempSetpoint => (20.0, 100.0),
                _ => (0.0, f64::MAX),
            };
            check_range(field.mnemonic(), value, low, high, field.unit())?;
            s.fields.insert(field, value);
            Ok(())
        })
        .await
    }

    async fn power_register(&mut self) -> Result<u32> {
        self.run(DeviceCall::PowerRegister, |s| Ok(s.power)).await
    }

    async fn status_register(&mut self) -> Result<u32> {
        self.run(DeviceCall::StatusRegister, |s| Ok(s.status())).await
    }

    async fn identity(&mut self) -> Result<String> {
        self.run(DeviceCall::Identity, |s| Ok(s.identity.clone())).await
    }

    async fn peltier_loop_on(&mut self) -> Result<()> {
        self.run(DeviceCall::PeltierLoopOn, |s| {
            s.loops |= STATUS_PELTIER_LOOP;
            s.power |= POWER_PELTIER;
            Ok(())
        })
        .await
    }

    async fn peltier_loop_off(&mut self) -> Result<()> {
        self.run(DeviceCall::PeltierLoopOff, |s| {
            s.loops &= !STATUS_PELTIER_LOOP;
            s.fields.insert(Field::PeltierVoltage, 0.0);
            if s.loops & STATUS_HEATER_LOOP == 0 {
                s.power &= !POWER_PELTIER;
            }
            Ok(())
        })
        .await
    }

    async fn heater_loop_on(&mut self) -> Result<()> {
        self.run(DeviceCall::HeaterLoopOn, |s| {
            s.loops |= STATUS_HEATER_LOOP;
            s.power |= POWER_PELTIER;
            Ok(())
        })
        .await
    }

    async fn heater_loop_off(&mut self) -> Result<()> {
        self.run(DeviceCall::HeaterLoopOff, |s| {
            s.loops &= !STATUS_HEATER_LOOP;
            s.fields.insert(Field::HeaterVoltage, 0.0);
            if s.loops & STATUS_PELTIER_LOOP == 0 {
                s.power &= !POWER_PELTIER;
            }
            Ok(())
        })
        .await
    }

    async fn laser_on(&mut self, current: f64) -> Result<()> {
        self.run(DeviceCall::LaserOn(current), |s| {
            check_range("Laser current", current, 0.0, s.laser_limit(), "mA")?;
            if s.get(Field::LaserCurrent) != 0.0 {
                return Err(DeviceError::LaserAlreadyOn);
            }
            s.power |= POWER_LASER;
            s.loops |= STATUS_LASER_ON;
            s.fields.insert(Field::LaserCurrent, current);
            Ok(())
        })
        .await
    }

    async fn laser_off(&mut self) -> Result<()> {
        self.run(DeviceCall::LaserOff, |s| {
            s.fields.insert(Field::LaserCurrent, 0.0);
            s.loops &= !STATUS_LASER_ON;
            s.power &= !POWER_LASER;
            Ok(())
        })
        .await
    }

    fn remember_laser_current(&mut self, current: f64) {
        self.last_laser_current = Some(current);
    }

    fn last_laser_current(&self) -> Option<f64> {
        self.last_laser_current
    }

    async fn close(&mut self) -> Result<()> {
        let mut state = self.lock();
        state.calls.push(DeviceCall::Close);
        state.closed = true;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::status;

    #[tokio::test]
    async fn test_loops_drive_supply_and_status_mirror() {
        let mut mock = MockDevice::epps();
        mock.peltier_loop_on().await.unwrap();
        mock.heater_loop_on().await.unwrap();
        let s = mock.status_register().await.unwrap();
        assert!(status::is_peltier_active(s));

        mock.peltier_loop_off().await.unwrap();
        assert!(status::is_peltier_on(mock.power()), "heater loop still holds the supply");
        mock.heater_loop_off().await.unwrap();
        assert!(!status::is_peltier_on(mock.power()));
        assert!(!status::is_peltier_active(mock.status()));
    }

    #[tokio::test]
    async fn test_laser_on_then_off() {
        let mut mock = MockDevice::cpps();
        mock.laser_on(20.0).await.unwrap();
        let s = mock.status_register().await.unwrap();
        assert!(status::is_laser_on(s) && status::is_laser_power_capable(s));
        assert!(matches!(mock.laser_on(5.0).await, Err(DeviceError::LaserAlreadyOn)));

        mock.laser_off().await.unwrap();
        assert_eq!(mock.field(Field::LaserCurrent), 0.0);
        assert_eq!(mock.power() & POWER_LASER, 0);
    }

    #[tokio::test]
    async fn test_scheduled_faults() {
        let mut mock = MockDevice::epps();
        mock.inject_fault(1, MockFault::Timeout);
        assert!(mock.read(Field::PeltierTemp).await.is_ok());
        assert!(matches!(mock.read(Field::PeltierTemp).await, Err(DeviceError::Timeout)));
        assert!(mock.read(Field::PeltierTemp).await.is_ok());

        mock.fail_next(MockFault::ConnectionLost);
        assert!(matches!(mock.identity().await, Err(DeviceError::ConnectionLost(_))));
        assert!(matches!(mock.identity().await, Err(DeviceError::ConnectionLost(_))));
        assert!(!mock.overlap_detected());
    }

    #[tokio::test]
    async fn test_failed_call_does_not_mutate() {
        let mut mock = MockDevice::epps();
        mock.fail_next(MockFault::Timeout);
        assert!(mock.peltier_loop_on().await.is_err());
        assert_eq!(mock.power(), 0);
        assert_eq!(mock.writes(), vec![DeviceCall::PeltierLoopOn]);
    }
}
