use std::fmt;
use std::time::Instant;

use serde::{Deserialize, Serialize};

use super::status::{PanelState, StatusFlags};

/// Identity strings reported by CPPS firmware. Everything else is an EPPS board.
pub const CPPS_IDENTITIES: [&str; 3] = [
    "SPDC driver, svn-05",
    "S-15 Instruments SPDC source driver, firmware svn-5. Serial: SPDCSDR-10",
    "S-15 Instruments SPDC source driver, firmware svn-7. Serial: SPDCSDR-99",
];

/// Board family, fixed for the lifetime of a connection.
///
/// EPPS boards carry a crystal heater loop alongside the laser peltier loop;
/// CPPS boards only have the peltier loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DeviceMode {
    #[serde(rename = "CPPS")]
    Cpps,
    #[serde(rename = "EPPS")]
    Epps,
}

impl DeviceMode {
    /// Classify a board from its `*IDN?` reply. Only exact matches count as CPPS.
    pub fn classify(identity: &str) -> Self {
        if CPPS_IDENTITIES.contains(&identity) {
            DeviceMode::Cpps
        } else {
            DeviceMode::Epps
        }
    }

    pub fn has_heater_loop(&self) -> bool {
        matches!(self, DeviceMode::Epps)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            DeviceMode::Cpps => "CPPS",
            DeviceMode::Epps => "EPPS",
        }
    }
}

impl fmt::Display for DeviceMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Analog quantities exposed by the board.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Field {
    LaserCurrent,
    LaserCurrentLimit,
    PeltierTemp,
    PeltierTempSetpoint,
    PeltierVoltage,
    PeltierVoltageLimit,
    PConstP,
    PConstI,
    HeaterTemp,
    HeaterTempSetpoint,
    HeaterVoltage,
    HeaterVoltageLimit,
}

impl Field {
    /// Query mnemonic without the trailing `?`.
    pub fn mnemonic(&self) -> &'static str {
        match self {
            Field::LaserCurrent => "LCURRENT",
            Field::LaserCurrentLimit => "LLIMIT",
            Field::PeltierTemp => "PTEMP",
            Field::PeltierTempSetpoint => "PSETTEMP",
            Field::PeltierVoltage => "PVOLT",
            Field::PeltierVoltageLimit => "PLIMIT",
            Field::PConstP => "PCONSTP",
            Field::PConstI => "PCONSTI",
            Field::HeaterTemp => "HTEMP",
            Field::HeaterTempSetpoint => "HSETTEMP",
            Field::HeaterVoltage => "HVOLT",
            Field::HeaterVoltageLimit => "HLIMIT",
        }
    }

    /// Measured quantities cannot be written.
    pub fn is_writable(&self) -> bool {
        !matches!(self, Field::PeltierTemp | Field::HeaterTemp)
    }

    pub fn unit(&self) -> &'static str {
        match self {
            Field::LaserCurrent | Field::LaserCurrentLimit => "mA",
            Field::PeltierTemp | Field::PeltierTempSetpoint | Field::HeaterTemp | Field::HeaterTempSetpoint => "°C",
            Field::PeltierVoltage | Field::PeltierVoltageLimit | Field::HeaterVoltage | Field::HeaterVoltageLimit => "V",
            Field::PConstP => "V/K",
            Field::PConstI => "V/(Ks)",
        }
    }
}

/// One poll cycle's worth of device readings.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TelemetrySnapshot {
    pub laser_current: f64,
    pub peltier_temp: f64,
    pub peltier_voltage: f64,
    pub pconst_p: f64,
    pub pconst_i: f64,
    pub power: u32,
    pub status: u32,
    /// `None` for the zero snapshot emitted before any successful read.
    #[serde(skip)]
    pub captured_at: Option<Instant>,
}

impl TelemetrySnapshot {
    pub fn flags(&self) -> StatusFlags {
        StatusFlags::decode(self.power, self.status)
    }

    pub fn panel_state(&self) -> PanelState {
        PanelState::from_registers(self.power, self.status)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classify_known_cpps_identity() {
        assert_eq!(DeviceMode::classify("SPDC driver, svn-05"), DeviceMode::Cpps);
        for identity in CPPS_IDENTITIES {
            assert_eq!(DeviceMode::classify(identity), DeviceMode::Cpps);
        }
    }

    #[test]
    fn test_classify_unknown_identity_as_epps() {
        assert_eq!(DeviceMode::classify("unknown-fw-1.0"), DeviceMode::Epps);
        assert_eq!(DeviceMode::classify(""), DeviceMode::Epps);
        // prefix and whitespace variants are not exact matches
        assert_eq!(DeviceMode::classify("SPDC driver, svn-05 "), DeviceMode::Epps);
        assert_eq!(DeviceMode::classify("SPDC driver"), DeviceMode::Epps);
    }

    #[test]
    fn test_mode_serializes_as_firmware_family_name() {
        assert_eq!(serde_json::to_string(&DeviceMode::Cpps).unwrap(), "\"CPPS\"");
        assert_eq!(serde_json::to_string(&DeviceMode::Epps).unwrap(), "\"EPPS\"");
        assert!(DeviceMode::Epps.has_heater_loop());
        assert!(!DeviceMode::Cpps.has_heater_loop());
    }
}
