use chrono::DateTime;
use chrono::Utc;

/// The reported electrical state of the charge controller
#[derive(Debug, Clone, PartialEq)]
pub struct Reading {
    /// The instantaneous charge current in A
    pub charging_current_a: f64,
    /// The battery voltage in V
    pub battery_voltage_v: f64,
    /// The solar panel voltage in V
    pub panel_voltage_v: f64,
    /// The charging power in W
    pub charging_power_w: f64,
    /// The charged capacity in Ah
    pub charging_capacity_ah: f64,
    /// The energy harvested today in Wh
    pub energy_daily_wh: f64,
    /// When the frame carrying this reading was completed. Set locally, the device sends no clock.
    pub captured_at: DateTime<Utc>,
}

/// A bare voltage from the controller's secondary report format.
///
/// Only used for diagnostics, it never stands in for a full [`Reading`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct VoltageSample {
    pub voltage_v: f64,
    pub captured_at: DateTime<Utc>,
}
