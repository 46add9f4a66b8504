use std::time::Duration;

use async_trait::async_trait;

use super::status::{POWER_LASER, POWER_PELTIER};
use super::{DeviceError, Field, Result};
use crate::config::SupervisorSettings;
use crate::serial::SerialInterface;

/// Operations the supervisor needs from a driver board.
///
/// Every call may fail with [`DeviceError::Timeout`]; callers reach a handle
/// only through an [`AccessSerializer`](super::AccessSerializer) guard.
#[async_trait]
pub trait DeviceHandle: Send {
    async fn read(&mut self, field: Field) -> Result<f64>;
    async fn write(&mut self, field: Field, value: f64) -> Result<()>;
    async fn power_register(&mut self) -> Result<u32>;
    async fn status_register(&mut self) -> Result<u32>;
    async fn identity(&mut self) -> Result<String>;

    async fn peltier_loop_on(&mut self) -> Result<()>;
    async fn peltier_loop_off(&mut self) -> Result<()>;
    async fn heater_loop_on(&mut self) -> Result<()>;
    async fn heater_loop_off(&mut self) -> Result<()>;

    async fn laser_on(&mut self, current: f64) -> Result<()>;
    async fn laser_off(&mut self) -> Result<()>;

    /// Host-side memory of the current in use before the last switch-off.
    fn remember_laser_current(&mut self, current: f64);
    fn last_laser_current(&self) -> Option<f64>;

    async fn close(&mut self) -> Result<()>;
}

// Bounds fixed by the firmware; the rest are read back from the board.
const LASER_CURRENT_LIMIT_MAX: f64 = 97.0;
const PELTIER_VOLTAGE_LIMIT_MAX: f64 = 2.5;
const HEATER_VOLTAGE_LIMIT_MAX: f64 = 10.0;
const PELTIER_SETPOINT_RANGE: (f64, f64) = (20.0, 50.0);
const HEATER_SETPOINT_RANGE: (f64, f64) = (20.0, 100.0);
const LOOP_CONSTANT_RANGE: (f64, f64) = (0.0, 10.0);
const SAVE_TIMEOUT: Duration = Duration::from_secs(1);

/// Driver for S-Fifteen SPDC driver boards over their serial command set.
pub struct SpdcDriver {
    interface: SerialInterface,
    last_laser_current: Option<f64>,
}

impl SpdcDriver {
    /// Substring present in the identity of every SPDC driver board.
    pub const DEVICE_IDENTIFIER: &'static str = "SPDC";

    pub fn new(interface: SerialInterface) -> Self {
        Self {
            interface,
            last_laser_current: None,
        }
    }

    pub async fn open(port_name: &str, settings: &SupervisorSettings) -> Result<Self> {
        let mut interface = SerialInterface::new(settings.serial_timeout());
        interface.connect(port_name, settings.baud_rate).await?;
        Ok(Self::new(interface))
    }

    pub fn interface(&self) -> &SerialInterface {
        &self.interface
    }

    async fn query(&mut self, command: &str) -> Result<String> {
        Ok(self.interface.getresponse(command, None).await?)
    }

    async fn query_f64(&mut self, command: &str) -> Result<f64> {
        let reply = self.query(command).await?;
        reply
            .trim()
            .parse()
            .map_err(|_| DeviceError::Protocol(format!("{} returned '{}'", command, reply)))
    }

    async fn query_u32(&mut self, command: &str) -> Result<u32> {
        let reply = self.query(command).await?;
        reply
            .trim()
            .parse()
            .map_err(|_| DeviceError::Protocol(format!("{} returned '{}'", command, reply)))
    }

    async fn send(&mut self, command: &str) -> Result<()> {
        Ok(self.interface.writeline(command).await?)
    }

    pub async fn help(&mut self) -> Result<String> {
        Ok(self.interface.getresponses("HELP", None).await?.join("\n"))
    }

    pub async fn reset(&mut self) -> Result<()> {
        self.send("*RST").await
    }

    /// Persist the current settings on the board. Saving takes longer than a normal reply.
    pub async fn save_settings(&mut self) -> Result<String> {
        Ok(self.interface.getresponse("SAVE", Some(SAVE_TIMEOUT)).await?)
    }

    pub async fn heater_loop(&mut self) -> Result<bool> {
        Ok(self.query_u32("HLOOP?").await? != 0)
    }

    pub async fn peltier_loop(&mut self) -> Result<bool> {
        Ok(self.query_u32("PLOOP?").await? != 0)
    }

    pub async fn power(&mut self) -> Result<u32> {
        self.query_u32("POWER?").await
    }

    /// Set the supply enable lines: bit 0 heater/peltier, bit 1 laser.
    pub async fn set_power(&mut self, value: u32) -> Result<()> {
        if value > (POWER_PELTIER | POWER_LASER) {
            return Err(DeviceError::OutOfRange {
                what: "Power",
                value: value as f64,
                low: 0.0,
                high: 3.0,
                unit: "",
            });
        }
        self.send(&format!("POWER {}", value)).await
    }

    pub async fn status(&mut self) -> Result<u32> {
        self.query_u32("STATUS?").await
    }

    async fn limits_for(&mut self, field: Field) -> Result<(f64, f64)> {
        Ok(match field {
            Field::LaserCurrent => (0.0, self.query_f64("LLIMIT?").await?),
            Field::PeltierVoltage => {
                let limit = self.query_f64("PLIMIT?").await?;
                (-limit, limit)
            }
            Field::HeaterVoltage => (0.0, self.query_f64("HLIMIT?").await?),
            Field::LaserCurrentLimit => (0.0, LASER_CURRENT_LIMIT_MAX),
            Field::PeltierVoltageLimit => (0.0, PELTIER_VOLTAGE_LIMIT_MAX),
            Field::HeaterVoltageLimit => (0.0, HEATER_VOLTAGE_LIMIT_MAX),
            Field::PeltierTempSetpoint => PELTIER_SETPOINT_RANGE,
            Field::HeaterTempSetpoint => HEATER_SETPOINT_RANGE,
            Field::PConstP | Field::PConstI => LOOP_CONSTANT_RANGE,
            Field::PeltierTemp | Field::HeaterTemp => {
                return Err(DeviceError::Protocol(format!("{} is read-only", field.mnemonic())))
            }
        })
    }

    async fn power_on_lines(&mut self, lines: u32) -> Result<()> {
        let power = self.power().await?;
        self.set_power(power | lines).await
    }

    async fn power_off_lines(&mut self, lines: u32) -> Result<()> {
        let power = self.power().await?;
        self.set_power(power & !lines & (POWER_PELTIER | POWER_LASER)).await
    }
}

pub(crate) fn check_range(what: &'static str, value: f64, low: f64, high: f64, unit: &'static str) -> Result<()> {
    if value.is_finite() && low <= value && value <= high {
        Ok(())
    } else {
        Err(DeviceError::OutOfRange {
            what,
            value,
            low,
            high,
            unit,
        })
    }
}

fn describe(field: Field) -> &'static str {
    match field {
        Field::LaserCurrent => "Laser current",
        Field::LaserCurrentLimit => "Laser current limit",
        Field::PeltierTemp => "Peltier temperature",
        Field::PeltierTempSetpoint => "Peltier temp setpoint",
        Field::PeltierVoltage => "Peltier voltage",
        Field::PeltierVoltageLimit => "Peltier voltage limit",
        Field::PConstP => "Peltier P constant",
        Field::PConstI => "Peltier I constant",
        Field::HeaterTemp => "Heater temperature",
        Field::HeaterTempSetpoint => "Heater temp setpoint",
        Field::HeaterVoltage => "Heater voltage",
        Field::HeaterVoltageLimit => "Heater voltage limit",
    }
}

#[async_trait]
impl DeviceHandle for SpdcDriver {
    async fn read(&mut self, field: Field) -> Result<f64> {
        self.query_f64(&format!("{}?", field.mnemonic())).await
    }

    async fn write(&mut self, field: Field, value: f64) -> Result<()> {
        let (low, high) = self.limits_for(field).await?;
        check_range(describe(field), value, low, high, field.unit())?;
        self.send(&format!("{} {:.3}", field.mnemonic(), value)).await
    }

    async fn power_register(&mut self) -> Result<u32> {
        self.power().await
    }

    async fn status_register(&mut self) -> Result<u32> {
        self.status().await
    }

    async fn identity(&mut self) -> Result<String> {
        self.query("*IDN?").await
    }

    async fn peltier_loop_on(&mut self) -> Result<()> {
        self.send("PLOOP 1").await?;
        self.power_on_lines(POWER_PELTIER).await
    }

    async fn peltier_loop_off(&mut self) -> Result<()> {
        // the loop holds its last voltage when stopped
        self.send("PLOOP 0").await?;
        self.write(Field::PeltierVoltage, 0.0).await?;
        if !self.heater_loop().await? {
            self.power_off_lines(POWER_PELTIER).await?;
        }
        Ok(())
    }

    async fn heater_loop_on(&mut self) -> Result<()> {
        self.send("HLOOP 1").await?;
        self.power_on_lines(POWER_PELTIER).await
    }

    async fn heater_loop_off(&mut self) -> Result<()> {
        self.send("HLOOP 0").await?;
        self.write(Field::HeaterVoltage, 0.0).await?;
        if !self.peltier_loop().await? {
            self.power_off_lines(POWER_PELTIER).await?;
        }
        Ok(())
    }

    async fn laser_on(&mut self, current: f64) -> Result<()> {
        let limit = self.query_f64("LLIMIT?").await?;
        check_range("Laser current", current, 0.0, limit, "mA")?;
        if self.read(Field::LaserCurrent).await? != 0.0 {
            return Err(DeviceError::LaserAlreadyOn);
        }

        self.power_on_lines(POWER_LASER).await?;
        self.send("ON").await?;
        self.write(Field::LaserCurrent, current).await
    }

    async fn laser_off(&mut self) -> Result<()> {
        self.write(Field::LaserCurrent, 0.0).await?;
        self.send("OFF").await?;
        self.power_off_lines(POWER_LASER).await
    }

    fn remember_laser_current(&mut self, current: f64) {
        self.last_laser_current = Some(current);
    }

    fn last_laser_current(&self) -> Option<f64> {
        self.last_laser_current
    }

    async fn close(&mut self) -> Result<()> {
        self.interface.disconnect();
        Ok(())
    }
}
