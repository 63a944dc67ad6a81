use std::sync::Arc;
use std::sync::PoisonError;
use std::sync::RwLock;

use chrono::DateTime;
use chrono::Utc;

use crate::reading::Reading;
use crate::reading::VoltageSample;

#[derive(Debug, Default)]
struct Latest {
    reading: Option<Reading>,
    updated_at: Option<DateTime<Utc>>,
    voltage_sample: Option<VoltageSample>,
}

/// The most recent telemetry, shared between the link session and whoever reports it.
///
/// Cloning is cheap and every clone sees the same values. Last write wins.
#[derive(Debug, Clone, Default)]
pub struct TelemetryStore {
    latest: Arc<RwLock<Latest>>,
}

impl TelemetryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get_last_reading(&self) -> Option<Reading> {
        self.read().reading.clone()
    }

    /// When the last reading was published.
    pub fn last_updated(&self) -> Option<DateTime<Utc>> {
        self.read().updated_at
    }

    pub fn last_voltage_sample(&self) -> Option<VoltageSample> {
        self.read().voltage_sample
    }

    pub(crate) fn publish(&self, reading: Reading) {
        let mut latest = self.latest.write().unwrap_or_else(PoisonError::into_inner);
        latest.updated_at = Some(Utc::now());
        latest.reading = Some(reading);
    }

    pub(crate) fn publish_voltage_sample(&self, sample: VoltageSample) {
        self.latest.write().unwrap_or_else(PoisonError::into_inner).voltage_sample = Some(sample);
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, Latest> {
        self.latest.read().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
fn reading(battery_voltage_v: f64) -> Reading {
    Reading {
        charging_current_a: 1.5,
        battery_voltage_v,
        panel_voltage_v: 18.2,
        charging_power_w: 20.0,
        charging_capacity_ah: 12.0,
        energy_daily_wh: 140.0,
        captured_at: Utc::now(),
    }
}

#[test]
fn test_empty_store() {
    let store = TelemetryStore::new();
    assert_eq!(store.get_last_reading(), None);
    assert_eq!(store.last_updated(), None);
    assert_eq!(store.last_voltage_sample(), None);
}

#[test]
fn test_last_write_wins_across_clones() {
    let store = TelemetryStore::new();
    let reader = store.clone();
    store.publish(reading(12.6));
    store.publish(reading(12.9));
    assert_eq!(reader.get_last_reading().map(|r| r.battery_voltage_v), Some(12.9));
    assert!(reader.last_updated().is_some());
}

#[test]
fn test_voltage_sample_does_not_touch_reading() {
    let store = TelemetryStore::new();
    let sample = VoltageSample { voltage_v: 12.8, captured_at: Utc::now() };
    store.publish_voltage_sample(sample);
    assert_eq!(store.last_voltage_sample(), Some(sample));
    assert_eq!(store.get_last_reading(), None);
    assert_eq!(store.last_updated(), None);
}

#[test]
fn test_concurrent_readers_and_writer() {
    let store = TelemetryStore::new();
    let handles: Vec<_> = (0..4)
        .map(|_| {
            let store = store.clone();
            std::thread::spawn(move || {
                for _ in 0..100 {
                    if let Some(r) = store.get_last_reading() {
                        assert!(r.battery_voltage_v >= 10.0);
                    }
                }
            })
        })
        .collect();
    for i in 0..100 {
        store.publish(reading(10.0 + i as f64 / 10.0));
    }
    for handle in handles {
        handle.join().unwrap();
    }
    assert_eq!(store.get_last_reading().map(|r| r.battery_voltage_v), Some(10.0 + 99.0 / 10.0));
}
