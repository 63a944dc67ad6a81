use chrono::DateTime;
use chrono::Utc;

use crate::reading::Reading;
use crate::reading::VoltageSample;

/// Shortest frame that carries every field of the primary report.
pub const MIN_FRAME_LEN: usize = 23;

/// Length of the secondary report, a bare voltage in V/100.
const VOLTAGE_SAMPLE_LEN: usize = 4;

/// What a completed frame turned out to hold.
#[derive(Debug, Clone, PartialEq)]
pub enum Decoded {
    Reading(Reading),
    VoltageSample(VoltageSample),
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DecodeError {
    #[error("frame truncated: {len} characters, at least {} required", MIN_FRAME_LEN)]
    Truncated { len: usize },
    #[error("frame is not ASCII: {0}")]
    NotAscii(String),
    #[error("field {field} is not a number: {raw:?}")]
    InvalidField { field: &'static str, raw: String },
}

/// Decode a completed frame.
///
/// The primary report is a run of fixed width decimal fields:
///
/// Offset | Width | Field                | Unit
/// 0      | 3     | charging current     | A/10
/// 3      | 3     | battery voltage      | V/10
/// 6      | 3     | charging power       | W
/// 9      | 2     | reserved             |
/// 11     | 3     | charging capacity    | Ah
/// 14     | 3     | reserved             |
/// 17     | 3     | energy today         | Wh
/// 20     | 3     | panel voltage        | V/10
/// 23     | ..    | trailer              |
///
/// A frame of exactly four digits is the secondary report and decodes to a
/// [`VoltageSample`]. Any other frame shorter than [`MIN_FRAME_LEN`] is rejected
/// without looking at its fields.
pub fn decode(frame: &[u8], captured_at: DateTime<Utc>) -> Result<Decoded, DecodeError> {
    let text = std::str::from_utf8(frame)
        .ok()
        .filter(|s| s.is_ascii())
        .ok_or_else(|| DecodeError::NotAscii(hex::encode(frame)))?;

    if text.len() == VOLTAGE_SAMPLE_LEN && text.bytes().all(|b| b.is_ascii_digit()) {
        let voltage_v = field(text, "voltage", 0, VOLTAGE_SAMPLE_LEN)? as f64 / 100.0;
        return Ok(Decoded::VoltageSample(VoltageSample { voltage_v, captured_at }));
    }

    if text.len() < MIN_FRAME_LEN {
        return Err(DecodeError::Truncated { len: text.len() });
    }

    Ok(Decoded::Reading(Reading {
        charging_current_a: field(text, "charging_current", 0, 3)? as f64 / 10.0,
        battery_voltage_v: field(text, "battery_voltage", 3, 3)? as f64 / 10.0,
        charging_power_w: field(text, "charging_power", 6, 3)? as f64,
        charging_capacity_ah: field(text, "charging_capacity", 11, 3)? as f64,
        energy_daily_wh: field(text, "energy_daily", 17, 3)? as f64,
        panel_voltage_v: field(text, "panel_voltage", 20, 3)? as f64 / 10.0,
        captured_at,
    }))
}

/// Parse the non-negative decimal at `offset..offset + width`.
fn field(text: &str, name: &'static str, offset: usize, width: usize) -> Result<u32, DecodeError> {
    let raw = &text[offset..offset + width];
    // u32::from_str accepts a leading '+', which is not a digit on this wire
    if !raw.bytes().all(|b| b.is_ascii_digit()) {
        return Err(DecodeError::InvalidField { field: name, raw: raw.to_string() });
    }
    raw.parse().map_err(|_| DecodeError::InvalidField { field: name, raw: raw.to_string() })
}

#[cfg(test)]
fn at() -> DateTime<Utc> {
    DateTime::from_timestamp(1_760_000_000, 0).unwrap()
}

#[test]
fn test_decode_happy() {
    let frame = b"00112805000128000050128T";
    let expected = Reading {
        charging_current_a: 0.1,
        battery_voltage_v: 12.8,
        charging_power_w: 50.0,
        charging_capacity_ah: 128.0,
        energy_daily_wh: 50.0,
        panel_voltage_v: 12.8,
        captured_at: at(),
    };
    assert_eq!(decode(frame, at()), Ok(Decoded::Reading(expected)));
}

#[test]
fn test_decode_is_idempotent() {
    let frame = b"04513212300045007612189";
    let first = decode(frame, at()).unwrap();
    let second = decode(frame, at()).unwrap();
    assert_eq!(first, second);
    let (Decoded::Reading(a), Decoded::Reading(b)) = (first, second) else {
        panic!("expected readings");
    };
    assert_eq!(a.charging_current_a.to_bits(), b.charging_current_a.to_bits());
    assert_eq!(a.panel_voltage_v.to_bits(), b.panel_voltage_v.to_bits());
}

#[test]
fn test_decode_ignores_reserved_and_trailer() {
    let frame = b"001128050XX128???050128 anything at all";
    let Decoded::Reading(reading) = decode(frame, at()).unwrap() else {
        panic!("expected a reading");
    };
    assert_eq!(reading.charging_capacity_ah, 128.0);
    assert_eq!(reading.energy_daily_wh, 50.0);
}

#[test]
fn test_decode_truncated() {
    let frame = b"0011280500012800005012";
    assert_eq!(decode(frame, at()), Err(DecodeError::Truncated { len: 22 }));
    assert_eq!(decode(b"", at()), Err(DecodeError::Truncated { len: 0 }));
}

#[test]
fn test_decode_bad_field_fails_whole_frame() {
    let frame = b"001128050001280000501-8";
    assert_eq!(
        decode(frame, at()),
        Err(DecodeError::InvalidField { field: "panel_voltage", raw: "1-8".to_string() })
    );
    let frame = b"+0112805000128000050128";
    assert!(matches!(
        decode(frame, at()),
        Err(DecodeError::InvalidField { field: "charging_current", .. })
    ));
}

#[test]
fn test_decode_voltage_sample() {
    let expected = VoltageSample { voltage_v: 12.8, captured_at: at() };
    assert_eq!(decode(b"1280", at()), Ok(Decoded::VoltageSample(expected)));
    assert_eq!(decode(b"12a0", at()), Err(DecodeError::Truncated { len: 4 }));
}

#[test]
fn test_decode_not_ascii() {
    assert!(matches!(decode(&[0xc3, 0xa9], at()), Err(DecodeError::NotAscii(_))));
}
