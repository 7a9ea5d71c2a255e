//! GATT characteristic decoding.
//!
//! When connected, a scale reports through one of three characteristics:
//! - Weight Measurement (0x2A9D), the standard weight-scale profile
//! - Body Composition Measurement (0x2A9C), in the Mi Scale 2 layout
//! - A vendor history characteristic carrying a 10-byte weight record
//!
//! Older scales also broadcast the Mi Scale 2 layout as service data under
//! 0x181B / 0x181D, so [`parse_body_composition`] serves both paths.

use chrono::{NaiveDate, NaiveDateTime};
use tracing::trace;
use uuid::Uuid;

use crate::objects::{is_complete_impedance, is_plausible_weight};

/// Expand a 16-bit assigned number onto the Bluetooth base UUID.
#[must_use]
pub const fn uuid16(short: u16) -> Uuid {
    Uuid::from_u128(((short as u128) << 96) | 0x0000_0000_0000_1000_8000_0080_5f9b_34fb)
}

/// The 16-bit short form of a UUID on the Bluetooth base, if it is one.
#[must_use]
pub fn short_uuid(uuid: Uuid) -> Option<u16> {
    let value = uuid.as_u128();
    let base = uuid16(0).as_u128();
    #[allow(clippy::cast_possible_truncation)]
    let short = (value >> 96) as u16;
    (value & !(0xFFFF_u128 << 96) == base && value >> 112 == 0).then_some(short)
}

/// MiBeacon service (0xFE95).
pub const MIBEACON_SERVICE: Uuid = uuid16(0xFE95);
/// Weight Scale service (0x181D).
pub const WEIGHT_SCALE_SERVICE: Uuid = uuid16(0x181D);
/// Body Composition service (0x181B).
pub const BODY_COMPOSITION_SERVICE: Uuid = uuid16(0x181B);

/// Weight Measurement characteristic (0x2A9D).
pub const WEIGHT_MEASUREMENT: Uuid = uuid16(0x2A9D);
/// Body Composition Measurement characteristic (0x2A9C).
pub const BODY_COMPOSITION_MEASUREMENT: Uuid = uuid16(0x2A9C);
/// Vendor history characteristic exposed by Xiaomi scales.
pub const XIAOMI_HISTORY: Uuid = Uuid::from_u128(0x0000_2a2f_0000_3512_2118_0009_af10_0700);

/// Services that identify a scale during discovery.
pub const SCALE_SERVICES: [Uuid; 3] = [MIBEACON_SERVICE, WEIGHT_SCALE_SERVICE, BODY_COMPOSITION_SERVICE];

/// Characteristics the manager subscribes to after connecting.
pub const MEASUREMENT_CHARACTERISTICS: [Uuid; 3] =
    [WEIGHT_MEASUREMENT, BODY_COMPOSITION_MEASUREMENT, XIAOMI_HISTORY];

const LB_TO_KG: f64 = 0.453_592;
const JIN_TO_KG: f64 = 0.5;

/// Consecutive samples required before a 0x2A9D reading counts as stable.
pub const STABLE_SAMPLE_COUNT: u32 = 3;
/// Maximum drift between samples still considered the same reading.
pub const STABLE_TOLERANCE_KG: f64 = 0.05;

/// A decoded 0x2A9D Weight Measurement.
#[derive(Debug, Clone, PartialEq)]
pub struct WeightMeasurement {
    /// Weight in kilograms.
    pub weight_kg: f64,
    /// The scale reported pounds.
    pub is_imperial: bool,
    /// Scale clock at the time of measurement.
    pub device_time: Option<NaiveDateTime>,
    /// User index on multi-user scales.
    pub user_id: Option<u8>,
    /// Body mass index computed by the scale.
    pub bmi: Option<f64>,
    /// Height in centimetres used for the BMI.
    pub height_cm: Option<f64>,
}

/// A stable reading in the Mi Scale 2 body-composition layout.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BodyComposition {
    /// Weight in kilograms.
    pub weight_kg: f64,
    /// Complete impedance, when the scale measured one.
    pub impedance_ohm: Option<u16>,
    /// The user stepped off.
    pub load_removed: bool,
    /// Scale clock at the time of measurement.
    pub device_time: Option<NaiveDateTime>,
}

/// A stable reading from the vendor 10-byte weight record.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct XiaomiWeight {
    /// Weight in kilograms.
    pub weight_kg: f64,
    /// The user stepped off.
    pub load_removed: bool,
}

/// A stable sample produced by any characteristic.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GattSample {
    /// Weight in kilograms.
    pub weight_kg: f64,
    /// Complete impedance, if reported.
    pub impedance_ohm: Option<u16>,
}

fn read_u16(data: &[u8], offset: usize) -> Option<u16> {
    Some(u16::from_le_bytes([*data.get(offset)?, *data.get(offset + 1)?]))
}

fn read_datetime(data: &[u8], offset: usize) -> Option<NaiveDateTime> {
    let year = read_u16(data, offset)?;
    let field = |i: usize| data.get(offset + i).copied().map(u32::from);
    NaiveDate::from_ymd_opt(i32::from(year), field(2)?, field(3)?)?
        .and_hms_opt(field(4)?, field(5)?, field(6)?)
}

/// Parse a Weight Measurement (0x2A9D) value.
///
/// This characteristic carries no stability bit; feed the result through a
/// [`StabilityTracker`].
#[must_use]
pub fn parse_weight_measurement(data: &[u8]) -> Option<WeightMeasurement> {
    let flags = *data.first()?;
    let raw = f64::from(read_u16(data, 1)?);
    let is_imperial = flags & 0x01 != 0;
    let weight_kg = if is_imperial {
        raw * 0.01 * LB_TO_KG
    } else {
        raw * 0.005
    };

    let mut measurement = WeightMeasurement {
        weight_kg,
        is_imperial,
        device_time: None,
        user_id: None,
        bmi: None,
        height_cm: None,
    };

    let mut offset = 3;
    if flags & 0x02 != 0 && data.len() >= offset + 7 {
        measurement.device_time = read_datetime(data, offset);
        offset += 7;
    }
    if flags & 0x04 != 0 && data.len() > offset {
        measurement.user_id = Some(data[offset]);
        offset += 1;
    }
    if flags & 0x08 != 0 {
        if let (Some(bmi), Some(height)) = (read_u16(data, offset), read_u16(data, offset + 2)) {
            measurement.bmi = Some(f64::from(bmi) * 0.1);
            measurement.height_cm = Some(f64::from(height) * 0.1);
        }
    }

    Some(measurement)
}

/// Parse the 13-byte Mi Scale 2 body-composition layout.
///
/// Returns `None` for short input, unstable readings, or implausible weights.
#[must_use]
pub fn parse_body_composition(data: &[u8]) -> Option<BodyComposition> {
    if data.len() < 13 {
        return None;
    }

    let is_imperial = data[0] & 0x01 != 0;
    let control = data[1];
    if control & 0x20 == 0 {
        trace!("body composition reading not yet stable");
        return None;
    }

    let raw_weight = f64::from(read_u16(data, 11)?);
    let weight_kg = if is_imperial {
        raw_weight / 100.0 * LB_TO_KG
    } else {
        raw_weight / 200.0
    };
    if !is_plausible_weight(weight_kg) {
        trace!(weight_kg, "body composition weight outside plausible range");
        return None;
    }

    let impedance_ohm = (control & 0x02 != 0)
        .then(|| read_u16(data, 9))
        .flatten()
        .filter(|&raw| is_complete_impedance(raw));

    Some(BodyComposition {
        weight_kg,
        impedance_ohm,
        load_removed: control & 0x80 != 0,
        device_time: read_datetime(data, 2),
    })
}

/// Parse the vendor 10-byte weight record.
#[must_use]
pub fn parse_xiaomi_weight(data: &[u8]) -> Option<XiaomiWeight> {
    if data.len() < 10 {
        return None;
    }

    let flags = data[0];
    if flags & 0x20 == 0 {
        return None;
    }

    let raw = f64::from(read_u16(data, 1)?);
    let weight_kg = if flags & 0x10 != 0 {
        raw / 100.0 * JIN_TO_KG
    } else if flags & 0x04 != 0 {
        raw / 100.0 * LB_TO_KG
    } else if flags & 0x02 != 0 {
        raw / 200.0
    } else {
        raw / 100.0
    };

    is_plausible_weight(weight_kg).then_some(XiaomiWeight {
        weight_kg,
        load_removed: flags & 0x80 != 0,
    })
}

/// Declares a 0x2A9D reading stable after consecutive similar samples.
#[derive(Debug, Clone)]
pub struct StabilityTracker {
    required: u32,
    tolerance_kg: f64,
    count: u32,
    last_kg: Option<f64>,
}

impl Default for StabilityTracker {
    fn default() -> Self {
        Self::new(STABLE_SAMPLE_COUNT, STABLE_TOLERANCE_KG)
    }
}

impl StabilityTracker {
    /// Create a tracker.
    #[must_use]
    pub const fn new(required: u32, tolerance_kg: f64) -> Self {
        Self {
            required,
            tolerance_kg,
            count: 0,
            last_kg: None,
        }
    }

    /// Record a sample; returns `true` once the reading has settled.
    pub fn observe(&mut self, weight_kg: f64) -> bool {
        self.count = match self.last_kg {
            Some(last) if (weight_kg - last).abs() <= self.tolerance_kg => self.count + 1,
            _ => 1,
        };
        self.last_kg = Some(weight_kg);
        self.count >= self.required
    }

    /// Forget all samples.
    pub fn reset(&mut self) {
        self.count = 0;
        self.last_kg = None;
    }
}

/// Routes characteristic notifications to the matching parser.
#[derive(Debug, Clone, Default)]
pub struct NotificationDecoder {
    tracker: StabilityTracker,
}

impl NotificationDecoder {
    /// Decode one notification; returns a sample only for stable readings.
    pub fn decode(&mut self, characteristic: Uuid, value: &[u8]) -> Option<GattSample> {
        match characteristic {
            WEIGHT_MEASUREMENT => {
                let measurement = parse_weight_measurement(value)?;
                if !self.tracker.observe(measurement.weight_kg) {
                    return None;
                }
                self.tracker.reset();
                is_plausible_weight(measurement.weight_kg).then_some(GattSample {
                    weight_kg: measurement.weight_kg,
                    impedance_ohm: None,
                })
            }
            BODY_COMPOSITION_MEASUREMENT => {
                parse_body_composition(value).map(|reading| GattSample {
                    weight_kg: reading.weight_kg,
                    impedance_ohm: reading.impedance_ohm,
                })
            }
            XIAOMI_HISTORY => parse_xiaomi_weight(value).map(|reading| GattSample {
                weight_kg: reading.weight_kg,
                impedance_ohm: None,
            }),
            other => {
                trace!(%other, "notification from unhandled characteristic");
                None
            }
        }
    }

    /// Reset stability tracking, e.g. after a reconnect.
    pub fn reset(&mut self) {
        self.tracker.reset();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn approx(a: f64, b: f64) -> bool {
        (a - b).abs() < 1e-9
    }

    #[test]
    fn test_uuid16_expansion() {
        assert_eq!(
            WEIGHT_MEASUREMENT.to_string(),
            "00002a9d-0000-1000-8000-00805f9b34fb"
        );
        assert_eq!(short_uuid(MIBEACON_SERVICE), Some(0xFE95));
        assert_eq!(short_uuid(XIAOMI_HISTORY), None);
    }

    #[test]
    fn test_weight_measurement_metric() {
        // 14000 * 0.005 = 70 kg
        let m = parse_weight_measurement(&[0x00, 0xB0, 0x36]).unwrap();
        assert!(approx(m.weight_kg, 70.0));
        assert!(!m.is_imperial);
        assert!(m.device_time.is_none());
    }

    #[test]
    fn test_weight_measurement_imperial() {
        // 15432 * 0.01 lb
        let [lo, hi] = 15_432u16.to_le_bytes();
        let m = parse_weight_measurement(&[0x01, lo, hi]).unwrap();
        assert!(m.is_imperial);
        assert!(approx(m.weight_kg, 154.32 * 0.453_592));
    }

    #[test]
    fn test_weight_measurement_optional_fields() {
        let data = [
            0x0E, 0xB0, 0x36, // timestamp | user | bmi+height
            0xE9, 0x07, 3, 14, 7, 30, 5, // 2025-03-14 07:30:05
            2,    // user
            0xE1, 0x00, // bmi 22.5
            0xD6, 0x06, // height 175.0
        ];
        let m = parse_weight_measurement(&data).unwrap();
        assert_eq!(
            m.device_time.unwrap().to_string(),
            "2025-03-14 07:30:05"
        );
        assert_eq!(m.user_id, Some(2));
        assert!(approx(m.bmi.unwrap(), 22.5));
        assert!(approx(m.height_cm.unwrap(), 175.0));
    }

    #[test]
    fn test_weight_measurement_too_short() {
        assert!(parse_weight_measurement(&[0x00, 0xB0]).is_none());
    }

    fn body_composition(unit: u8, control: u8, impedance: u16, raw_weight: u16) -> Vec<u8> {
        let mut data = vec![unit, control, 0xE9, 0x07, 1, 2, 3, 4, 5];
        data.extend(impedance.to_le_bytes());
        data.extend(raw_weight.to_le_bytes());
        data
    }

    #[test]
    fn test_body_composition_stable_with_impedance() {
        let reading = parse_body_composition(&body_composition(0x02, 0x22, 480, 14_000)).unwrap();
        assert!(approx(reading.weight_kg, 70.0));
        assert_eq!(reading.impedance_ohm, Some(480));
        assert!(reading.device_time.is_some());
    }

    #[test]
    fn test_body_composition_impedance_requires_flag_and_range() {
        let reading = parse_body_composition(&body_composition(0x02, 0x20, 480, 14_000)).unwrap();
        assert_eq!(reading.impedance_ohm, None);
        let reading = parse_body_composition(&body_composition(0x02, 0x22, 5000, 14_000)).unwrap();
        assert_eq!(reading.impedance_ohm, None);
    }

    #[test]
    fn test_body_composition_unstable_returns_nothing() {
        assert!(parse_body_composition(&body_composition(0x02, 0x02, 480, 14_000)).is_none());
    }

    #[test]
    fn test_body_composition_pounds() {
        let reading = parse_body_composition(&body_composition(0x03, 0x20, 0, 15_432)).unwrap();
        assert!(approx(reading.weight_kg, 154.32 * 0.453_592));
    }

    #[test]
    fn test_xiaomi_weight_units() {
        let record = |flags: u8, raw: u16| {
            let mut data = vec![flags];
            data.extend(raw.to_le_bytes());
            data.extend([0; 7]);
            data
        };
        assert!(approx(parse_xiaomi_weight(&record(0x22, 14_000)).unwrap().weight_kg, 70.0));
        assert!(approx(parse_xiaomi_weight(&record(0x30, 14_000)).unwrap().weight_kg, 70.0));
        assert!(approx(
            parse_xiaomi_weight(&record(0x24, 15_432)).unwrap().weight_kg,
            154.32 * 0.453_592
        ));
        assert!(parse_xiaomi_weight(&record(0x02, 14_000)).is_none());
        assert!(parse_xiaomi_weight(&record(0x22, 14_000)[..9]).is_none());
    }

    #[test]
    fn test_stability_tracker() {
        let mut tracker = StabilityTracker::default();
        assert!(!tracker.observe(70.0));
        assert!(!tracker.observe(70.04));
        assert!(tracker.observe(70.02));

        tracker.reset();
        assert!(!tracker.observe(70.0));
        assert!(!tracker.observe(71.0));
        assert!(!tracker.observe(71.0));
        assert!(tracker.observe(71.03));
    }

    #[test]
    fn test_decoder_emits_once_per_settled_reading() {
        let mut decoder = NotificationDecoder::default();
        let sample = [0x00, 0xB0, 0x36];
        assert!(decoder.decode(WEIGHT_MEASUREMENT, &sample).is_none());
        assert!(decoder.decode(WEIGHT_MEASUREMENT, &sample).is_none());
        let emitted = decoder.decode(WEIGHT_MEASUREMENT, &sample).unwrap();
        assert!(approx(emitted.weight_kg, 70.0));
        assert!(decoder.decode(WEIGHT_MEASUREMENT, &sample).is_none());
    }

    #[test]
    fn test_decoder_routes_body_composition() {
        let mut decoder = NotificationDecoder::default();
        let sample = decoder
            .decode(
                BODY_COMPOSITION_MEASUREMENT,
                &body_composition(0x02, 0x22, 480, 14_000),
            )
            .unwrap();
        assert_eq!(sample.impedance_ohm, Some(480));
        assert!(decoder.decode(uuid16(0x2A37), &[0x00, 0x50]).is_none());
    }
}
