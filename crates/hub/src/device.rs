use serde::{Deserialize, Serialize};

use crate::names;

// ---------------------------------------------------------------------------
// Device status
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DeviceStatus {
    NotFound,
    Warning,
    Error,
    Working,
}

impl DeviceStatus {
    /// Rank used when several status bits are set at once.
    fn severity(self) -> u8 {
        match self {
            Self::Working => 0,
            Self::Warning => 1,
            Self::NotFound => 2,
            Self::Error => 3,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::NotFound => "NotFound",
            Self::Warning => "Warning",
            Self::Error => "Error",
            Self::Working => "Working",
        }
    }
}

// ---------------------------------------------------------------------------
// Logical devices
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DeviceKind {
    Pump,
    Lamp,
    WaterLevel,
    PpmMeter,
    PhMeter,
    Turbidimeter,
    Temperature,
    UpperLevel,
    Bridge,
    System,
}

impl DeviceKind {
    pub const ALL: [DeviceKind; 10] = [
        Self::Pump,
        Self::Lamp,
        Self::WaterLevel,
        Self::PpmMeter,
        Self::PhMeter,
        Self::Turbidimeter,
        Self::Temperature,
        Self::UpperLevel,
        Self::Bridge,
        Self::System,
    ];

    /// Devices whose status comes from a flag byte in the telemetry burst.
    pub const REPORTED: [DeviceKind; 8] = [
        Self::Pump,
        Self::Lamp,
        Self::WaterLevel,
        Self::PpmMeter,
        Self::PhMeter,
        Self::Turbidimeter,
        Self::Temperature,
        Self::UpperLevel,
    ];

    pub fn name(self) -> &'static str {
        match self {
            Self::Pump => names::PUMP,
            Self::Lamp => names::LAMP,
            Self::WaterLevel => names::WATER_LEVEL,
            Self::PpmMeter => names::PPM_METER,
            Self::PhMeter => names::PH_METER,
            Self::Turbidimeter => names::TURBIDIMETER,
            Self::Temperature => names::TEMPERATURE,
            Self::UpperLevel => names::UPPER_LEVEL,
            Self::Bridge => names::BRIDGE,
            Self::System => names::SYSTEM,
        }
    }
}

// ---------------------------------------------------------------------------
// Status bit tables
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy)]
pub struct StatusBit {
    pub mask: u8,
    pub status: DeviceStatus,
    pub text: &'static str,
}

const fn bit(shift: u8, status: DeviceStatus, text: &'static str) -> StatusBit {
    StatusBit {
        mask: 1 << shift,
        status,
        text,
    }
}

use DeviceStatus::{Error, NotFound, Warning};

const PUMP_BITS: &[StatusBit] = &[
    bit(0, NotFound, "Pump not present"),
    bit(1, Error, "Pump overcurrent!"),
];

const LAMP_BITS: &[StatusBit] = &[bit(0, Error, "AC voltage for lamp not present")];

const WATER_LEVEL_BITS: &[StatusBit] = &[
    bit(0, NotFound, "No water level sensor"),
    bit(1, Error, "No water!"),
    bit(2, Error, "Water level sensor error"),
];

const PPM_BITS: &[StatusBit] = &[
    bit(0, NotFound, "No PPM meter found"),
    bit(1, Warning, "System incomplete for calculating PPM"),
    bit(2, Warning, "PPM sensor wrong value"),
];

const PH_BITS: &[StatusBit] = &[bit(0, NotFound, "PH sensor not found")];

const TEMPERATURE_BITS: &[StatusBit] = &[
    bit(0, NotFound, "Temperature sensor not found"),
    bit(1, Error, "Temperature sensor error"),
    bit(2, Warning, "Temperature sensor wrong data"),
];

const UPPER_BITS: &[StatusBit] = &[bit(0, NotFound, "Upper level sensor not found")];

const TURBIDIMETER_BITS: &[StatusBit] = &[
    bit(0, NotFound, "Turbidimeter not found"),
    bit(1, Error, "Turbidimeter error"),
];

pub fn status_bits(kind: DeviceKind) -> &'static [StatusBit] {
    match kind {
        DeviceKind::Pump => PUMP_BITS,
        DeviceKind::Lamp => LAMP_BITS,
        DeviceKind::WaterLevel => WATER_LEVEL_BITS,
        DeviceKind::PpmMeter => PPM_BITS,
        DeviceKind::PhMeter => PH_BITS,
        DeviceKind::Temperature => TEMPERATURE_BITS,
        DeviceKind::UpperLevel => UPPER_BITS,
        DeviceKind::Turbidimeter => TURBIDIMETER_BITS,
        DeviceKind::Bridge | DeviceKind::System => &[],
    }
}

/// Evaluate a device's flag byte: the most severe set bit decides the
/// status (Error > NotFound > Warning) and the text lists every set bit.
pub fn evaluate(kind: DeviceKind, flags: u8) -> (DeviceStatus, String) {
    let mut status = DeviceStatus::Working;
    let mut lines = Vec::new();

    for b in status_bits(kind) {
        if flags & b.mask == 0 {
            continue;
        }
        lines.push(b.text);
        if b.status.severity() > status.severity() {
            status = b.status;
        }
    }

    if lines.is_empty() {
        (DeviceStatus::Working, "Works fine".to_string())
    } else {
        (status, lines.join("\n"))
    }
}

// ---------------------------------------------------------------------------
// Telemetry payload
// ---------------------------------------------------------------------------

/// One telemetry burst from the multi-sensor controller.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct MultiControllerTelem {
    pub pump_state: bool,
    pub lamp_state: bool,
    pub upper_state: bool,
    pub water_level: f64,
    pub ph: f64,
    pub ppm: f64,
    pub turbidimeter: f64,
    pub temperature: f64,
    pub pump_status: u8,
    pub lamp_status: u8,
    pub water_level_status: u8,
    pub upper_status: u8,
    pub ppm_status: u8,
    pub ph_status: u8,
    pub temperature_status: u8,
    pub turbidimeter_status: u8,
}

impl MultiControllerTelem {
    pub fn status_flags(&self, kind: DeviceKind) -> u8 {
        match kind {
            DeviceKind::Pump => self.pump_status,
            DeviceKind::Lamp => self.lamp_status,
            DeviceKind::WaterLevel => self.water_level_status,
            DeviceKind::UpperLevel => self.upper_status,
            DeviceKind::PpmMeter => self.ppm_status,
            DeviceKind::PhMeter => self.ph_status,
            DeviceKind::Temperature => self.temperature_status,
            DeviceKind::Turbidimeter => self.turbidimeter_status,
            DeviceKind::Bridge | DeviceKind::System => 0,
        }
    }
}

// ===========================================================================
// Tests
// ===========================================================================
