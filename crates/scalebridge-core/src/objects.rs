//! MiBeacon object (TLV) parsing.
//!
//! Each record is `type (1) | length (1) | value (length)`. A payload may
//! carry several records; weight and impedance can arrive together.

use tracing::trace;

/// Object type of a weight record.
pub const WEIGHT_OBJECT_TYPE: u8 = 0x16;

/// Object type of an impedance record.
pub const IMPEDANCE_OBJECT_TYPE: u8 = 0x17;

/// Lowest plausible weight; anything below is treated as a corrupt frame.
pub const MIN_WEIGHT_KG: f64 = 2.0;

/// Highest plausible weight.
pub const MAX_WEIGHT_KG: f64 = 300.0;

/// Lowest impedance considered a real electrode reading.
pub const MIN_IMPEDANCE_OHM: u16 = 100;

/// Highest impedance considered a real electrode reading.
pub const MAX_IMPEDANCE_OHM: u16 = 1200;

const WEIGHT_RECORD_LEN: usize = 6;
const IMPEDANCE_RECORD_LEN: usize = 4;
const TLV_HEADER_LEN: usize = 2;

const CONTROL_IMPEDANCE_STARTED: u8 = 0x02;
const CONTROL_STABLE: u8 = 0x20;
const CONTROL_WEIGHT_REMOVED: u8 = 0x80;

const WEIGHT_DIVISOR: f64 = 200.0;

/// A stable weight reading.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct WeightObject {
    /// Weight in kilograms.
    pub weight_kg: f64,
    /// The reading has settled.
    pub is_stable: bool,
    /// The user stepped off.
    pub weight_removed: bool,
    /// The scale has started measuring impedance.
    pub impedance_measurement_started: bool,
}

/// An impedance reading.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ImpedanceObject {
    /// Raw impedance in ohms, kept even when implausible.
    pub impedance_ohm: u16,
    /// `true` only for values within the plausible range.
    pub is_complete: bool,
}

impl ImpedanceObject {
    /// The impedance value, only when complete.
    #[must_use]
    pub const fn usable_ohm(&self) -> Option<u16> {
        if self.is_complete {
            Some(self.impedance_ohm)
        } else {
            None
        }
    }
}

/// Whatever objects a payload carried.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct ObjectSet {
    /// Stable, plausible weight.
    pub weight: Option<WeightObject>,
    /// Impedance, complete or not.
    pub impedance: Option<ImpedanceObject>,
}

impl ObjectSet {
    /// No recognized object was found.
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.weight.is_none() && self.impedance.is_none()
    }
}

/// Convert a raw weight value to kilograms.
#[must_use]
pub fn weight_from_raw(raw: u16) -> f64 {
    f64::from(raw) / WEIGHT_DIVISOR
}

/// Whether a weight lies within the sanity range.
#[must_use]
pub fn is_plausible_weight(weight_kg: f64) -> bool {
    (MIN_WEIGHT_KG..=MAX_WEIGHT_KG).contains(&weight_kg)
}

/// Whether an impedance value is a complete electrode reading.
#[must_use]
pub const fn is_complete_impedance(raw: u16) -> bool {
    raw != 0 && raw >= MIN_IMPEDANCE_OHM && raw <= MAX_IMPEDANCE_OHM
}

/// Parse a weight record starting at its type byte.
///
/// Returns `None` unless the record is a stable weight within range.
#[must_use]
pub fn parse_weight_object(record: &[u8]) -> Option<WeightObject> {
    if record.len() < WEIGHT_RECORD_LEN || record[0] != WEIGHT_OBJECT_TYPE {
        return None;
    }

    let control = record[2];
    let raw = u16::from_le_bytes([record[4], record[5]]);
    let weight_kg = weight_from_raw(raw);
    let is_stable = control & CONTROL_STABLE != 0;

    if !is_stable {
        trace!(weight_kg, "weight not yet stable");
        return None;
    }
    if !is_plausible_weight(weight_kg) {
        trace!(weight_kg, "weight outside plausible range");
        return None;
    }

    Some(WeightObject {
        weight_kg,
        is_stable,
        weight_removed: control & CONTROL_WEIGHT_REMOVED != 0,
        impedance_measurement_started: control & CONTROL_IMPEDANCE_STARTED != 0,
    })
}

/// Parse an impedance record starting at its type byte.
#[must_use]
pub fn parse_impedance_object(record: &[u8]) -> Option<ImpedanceObject> {
    if record.len() < IMPEDANCE_RECORD_LEN || record[0] != IMPEDANCE_OBJECT_TYPE {
        return None;
    }

    let impedance_ohm = u16::from_le_bytes([record[2], record[3]]);
    let is_complete = is_complete_impedance(impedance_ohm);
    if !is_complete {
        trace!(impedance_ohm, "impedance incomplete or implausible");
    }

    Some(ImpedanceObject {
        impedance_ohm,
        is_complete,
    })
}

/// Walk a payload of TLV records and collect weight and impedance objects.
///
/// Unknown record types are skipped; a record whose declared length runs
/// past the buffer ends the walk.
#[must_use]
pub fn extract_objects(payload: &[u8]) -> ObjectSet {
    let mut objects = ObjectSet::default();
    let mut offset = 0;

    while payload.len() - offset >= TLV_HEADER_LEN {
        let object_type = payload[offset];
        let end = offset + TLV_HEADER_LEN + usize::from(payload[offset + 1]);
        let Some(record) = payload.get(offset..end) else {
            trace!(offset, object_type, "truncated object record");
            break;
        };

        match object_type {
            WEIGHT_OBJECT_TYPE => {
                if let Some(weight) = parse_weight_object(record) {
                    objects.weight = Some(weight);
                }
            }
            IMPEDANCE_OBJECT_TYPE => {
                if let Some(impedance) = parse_impedance_object(record) {
                    objects.impedance = Some(impedance);
                }
            }
            other => trace!(object_type = other, "skipping unknown object"),
        }

        offset = end;
    }

    objects
}
