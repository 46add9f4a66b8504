//! Meaning of the power and status register bits.
//!
//! Every other module asks these functions; nothing else masks register bits.

use serde::{Deserialize, Serialize};

/// POWER register: heater/peltier supply lines enabled.
pub const POWER_PELTIER: u32 = 0x01;
/// POWER register: laser supply lines enabled.
pub const POWER_LASER: u32 = 0x02;

/// STATUS register: crystal heater loop running.
pub const STATUS_HEATER_LOOP: u32 = 0x01;
/// STATUS register: laser peltier loop running.
pub const STATUS_PELTIER_LOOP: u32 = 0x02;
/// STATUS register: laser output on.
pub const STATUS_LASER_ON: u32 = 0x04;
/// STATUS register: heater/peltier supply active.
pub const STATUS_PELTIER_ACTIVE: u32 = 0x100;
/// STATUS register: laser supply active.
pub const STATUS_LASER_POWER: u32 = 0x200;

pub fn is_peltier_on(power: u32) -> bool {
    power & POWER_PELTIER != 0
}

pub fn is_laser_capable(power: u32) -> bool {
    power & POWER_LASER != 0
}

pub fn is_laser_on(status: u32) -> bool {
    status & STATUS_LASER_ON != 0
}

pub fn is_peltier_active(status: u32) -> bool {
    status & STATUS_PELTIER_ACTIVE != 0
}

pub fn is_laser_power_capable(status: u32) -> bool {
    status & STATUS_LASER_POWER != 0
}

/// Laser is supplied and emitting; gates the current setpoint control.
pub fn laser_ready(power: u32, status: u32) -> bool {
    is_laser_capable(power) && is_laser_on(status)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct StatusFlags {
    pub peltier_on: bool,
    pub laser_capable: bool,
    pub laser_on: bool,
    pub peltier_active: bool,
    pub laser_power_capable: bool,
}

impl StatusFlags {
    pub fn decode(power: u32, status: u32) -> Self {
        Self {
            peltier_on: is_peltier_on(power),
            laser_capable: is_laser_capable(power),
            laser_on: is_laser_on(status),
            peltier_active: is_peltier_active(status),
            laser_power_capable: is_laser_power_capable(status),
        }
    }

    pub fn laser_ready(&self) -> bool {
        self.laser_capable && self.laser_on
    }
}

/// Colour of an on/off indicator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum IndicatorState {
    /// Green.
    Active,
    /// Red.
    Inactive,
    /// Grey; no device or the session has failed.
    Disabled,
}

impl IndicatorState {
    fn from_flag(on: bool) -> Self {
        if on {
            IndicatorState::Active
        } else {
            IndicatorState::Inactive
        }
    }

    pub fn colour(&self) -> &'static str {
        match self {
            IndicatorState::Active => "green",
            IndicatorState::Inactive => "red",
            IndicatorState::Disabled => "grey",
        }
    }
}

/// What a front panel should show for a pair of register reads.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PanelState {
    pub power_indicator: IndicatorState,
    pub laser_indicator: IndicatorState,
    pub current_control_enabled: bool,
}

impl PanelState {
    pub fn from_registers(power: u32, status: u32) -> Self {
        let ready = laser_ready(power, status);
        Self {
            power_indicator: IndicatorState::from_flag(is_peltier_on(power)),
            laser_indicator: IndicatorState::from_flag(ready),
            current_control_enabled: ready,
        }
    }

    pub fn disabled() -> Self {
        Self {
            power_indicator: IndicatorState::Disabled,
            laser_indicator: IndicatorState::Disabled,
            current_control_enabled: false,
        }
    }
}
