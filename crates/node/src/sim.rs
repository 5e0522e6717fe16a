//! Stateful multi-controller simulator for local development.
//!
//! Models the hardware the hub drives:
//! - A reservoir whose level drops while the pump floods the upper tank
//! - An upper tank that fills while pumping and drains back when idle
//! - A float switch that closes once the upper tank is full
//! - Slowly wandering water-quality readings with per-reading noise
//! - Per-device status bytes, with scenario-specific faults

use serde::Serialize;
use std::fmt;

// ---------------------------------------------------------------------------
// Gaussian approximation (no extra dependency)
// ---------------------------------------------------------------------------

/// Approximate a sample from N(0,1) using the Irwin-Hall method:
/// sum of 12 uniform [0,1) values minus 6.
fn approx_std_normal() -> f64 {
    let mut sum: f64 = 0.0;
    for _ in 0..12 {
        sum += fastrand::f64();
    }
    sum - 6.0
}

fn gaussian(mean: f64, sigma: f64) -> f64 {
    mean + sigma * approx_std_normal()
}

// ---------------------------------------------------------------------------
// Scenario presets
// ---------------------------------------------------------------------------

/// Pre-configured simulation profiles selectable via `SIM_SCENARIO`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scenario {
    /// Every sensor present, tank fills in about a minute.
    Normal,
    /// Upper level sensor missing. The hub should refuse swing mode.
    NoUpper,
    /// Pump too weak to fill the upper tank. The hub should hit its flood
    /// timeout.
    SlowFill,
    /// Reservoir starts almost empty and reports "No water!" once it runs dry.
    Dry,
}

impl Scenario {
    pub fn from_str_lossy(s: &str) -> Self {
        match s.to_ascii_lowercase().as_str() {
            "no_upper" | "noupper" => Self::NoUpper,
            "slow_fill" | "slowfill" => Self::SlowFill,
            "dry" => Self::Dry,
            _ => Self::Normal,
        }
    }
}

impl fmt::Display for Scenario {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Normal => write!(f, "normal"),
            Self::NoUpper => write!(f, "no_upper"),
            Self::SlowFill => write!(f, "slow_fill"),
            Self::Dry => write!(f, "dry"),
        }
    }
}

// ---------------------------------------------------------------------------
// Telemetry payload
// ---------------------------------------------------------------------------

/// One telemetry burst, in the shape the hub decodes.
#[derive(Debug, Clone, Default, Serialize)]
pub struct Telemetry {
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

const UPPER_NOT_FOUND: u8 = 1 << 0;
const WATER_LEVEL_NO_WATER: u8 = 1 << 1;

/// Reservoir percentage below which the level sensor reports "No water!".
const DRY_THRESHOLD: f64 = 5.0;

// ---------------------------------------------------------------------------
// Simulator
// ---------------------------------------------------------------------------

/// A slowly wandering reading with mean reversion.
struct Drift {
    value: f64,
    center: f64,
    walk_sigma: f64,
    noise_sigma: f64,
}

impl Drift {
    fn new(center: f64, walk_sigma: f64, noise_sigma: f64) -> Self {
        Self {
            value: center,
            center,
            walk_sigma,
            noise_sigma,
        }
    }

    fn step(&mut self) -> f64 {
        let pull = 0.05 * (self.center - self.value);
        self.value += pull + gaussian(0.0, self.walk_sigma);
        self.value + gaussian(0.0, self.noise_sigma)
    }
}

pub struct MultiControllerSim {
    scenario: Scenario,

    pump_on: bool,
    lamp_on: bool,

    /// Reservoir level, percent.
    reservoir: f64,
    /// Upper tank fill, 0.0 (empty) to 1.0 (float switch closed).
    upper_fill: f64,

    /// Upper tank fill gained per second of pumping.
    fill_rate: f64,
    /// Upper tank fill lost per second while the pump is off.
    drain_rate: f64,
    /// Reservoir percent moved per unit of upper tank fill.
    reservoir_per_fill: f64,

    ph: Drift,
    ppm: Drift,
    turbidity: Drift,
    temperature: Drift,
}

impl MultiControllerSim {
    pub fn new(scenario: Scenario) -> Self {
        let (reservoir, fill_rate) = match scenario {
            Scenario::Normal | Scenario::NoUpper => (80.0, 1.0 / 60.0),
            Scenario::SlowFill => (80.0, 1.0 / 600.0),
            Scenario::Dry => (12.0, 1.0 / 60.0),
        };

        Self {
            scenario,
            pump_on: false,
            lamp_on: false,
            reservoir,
            upper_fill: 0.0,
            fill_rate,
            drain_rate: 1.0 / 90.0,
            reservoir_per_fill: 20.0,
            ph: Drift::new(6.0, 0.01, 0.02),
            ppm: Drift::new(900.0, 3.0, 8.0),
            turbidity: Drift::new(4.0, 0.05, 0.1),
            temperature: Drift::new(21.5, 0.02, 0.05),
        }
    }

    pub fn scenario(&self) -> Scenario {
        self.scenario
    }

    pub fn set_pump(&mut self, on: bool) {
        self.pump_on = on;
    }

    pub fn set_lamp(&mut self, on: bool) {
        self.lamp_on = on;
    }

    /// Advance the water model by `dt_s` seconds.
    pub fn step(&mut self, dt_s: f64) {
        let before = self.upper_fill;

        if self.pump_on && self.reservoir > 0.0 {
            self.upper_fill = (self.upper_fill + self.fill_rate * dt_s).min(1.0);
        } else if !self.pump_on {
            self.upper_fill = (self.upper_fill - self.drain_rate * dt_s).max(0.0);
        }

        let moved = self.upper_fill - before;
        self.reservoir = (self.reservoir - moved * self.reservoir_per_fill).clamp(0.0, 100.0);
    }

    pub fn upper_flooded(&self) -> bool {
        self.scenario != Scenario::NoUpper && self.upper_fill >= 1.0
    }

    pub fn reservoir(&self) -> f64 {
        self.reservoir
    }

    /// Sample every sensor and build the next telemetry burst.
    pub fn telemetry(&mut self) -> Telemetry {
        let mut telem = Telemetry {
            pump_state: self.pump_on,
            lamp_state: self.lamp_on,
            upper_state: self.upper_flooded(),
            water_level: (self.reservoir + gaussian(0.0, 0.3)).clamp(0.0, 100.0),
            ph: self.ph.step().clamp(0.0, 14.0),
            ppm: self.ppm.step().max(0.0),
            turbidimeter: self.turbidity.step().max(0.0),
            temperature: self.temperature.step(),
            ..Telemetry::default()
        };

        if self.scenario == Scenario::NoUpper {
            telem.upper_status |= UPPER_NOT_FOUND;
        }
        if self.reservoir < DRY_THRESHOLD {
            telem.water_level_status |= WATER_LEVEL_NO_WATER;
        }

        telem
    }
}

// ===========================================================================
// Tests
// ===========================================================================
