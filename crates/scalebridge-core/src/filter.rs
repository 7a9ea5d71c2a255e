//! Scale discovery filtering.
//!
//! Decides which visible peripheral, if any, the manager should bind to.
//! Once an address is bound, nothing else is ever considered.

use std::collections::BTreeSet;

use once_cell::sync::Lazy;
use regex::{Regex, RegexBuilder};
use uuid::Uuid;

use crate::characteristic::SCALE_SERVICES;
use crate::types::MacAddress;

/// Advertised-name patterns of the supported scale family.
pub const SCALE_NAME_PATTERNS: &[&str] = &[
    r"^MIBFS",
    r"^MIBCS",
    r"^XMTZC",
    r"^MI_?SCALE",
    r"mi\s*scale",
    r"body.*scale",
    r"xiaomi.*scale",
    r"scale.*s400",
];

static SCALE_NAME_RES: Lazy<Vec<Regex>> = Lazy::new(|| {
    SCALE_NAME_PATTERNS
        .iter()
        .filter_map(|pattern| {
            RegexBuilder::new(pattern)
                .case_insensitive(true)
                .build()
                .ok()
        })
        .collect()
});

/// A peripheral seen during the current scan.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct VisiblePeripheral {
    /// Device address.
    pub address: MacAddress,
    /// Advertised local name.
    pub name: Option<String>,
    /// Advertised service UUIDs, including those only present as service data.
    pub service_uuids: Vec<Uuid>,
}

/// Outcome of [`select_device`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Selection {
    /// Bind to this device.
    Select(MacAddress),
    /// Keep scanning.
    Wait,
}

/// Whether an advertised name belongs to the scale family.
#[must_use]
pub fn matches_scale_name(name: &str) -> bool {
    SCALE_NAME_RES.iter().any(|re| re.is_match(name))
}

/// Whether a peripheral looks like a supported scale.
#[must_use]
pub fn is_scale_candidate(peripheral: &VisiblePeripheral) -> bool {
    peripheral
        .name
        .as_deref()
        .is_some_and(matches_scale_name)
        || peripheral
            .service_uuids
            .iter()
            .any(|uuid| SCALE_SERVICES.contains(uuid))
}

/// Pick a device to bind to.
///
/// With a bound address, only that address can be selected and other
/// peripherals are not inspected. Without one, exactly one distinct
/// candidate is selected; zero or several mean [`Selection::Wait`].
#[must_use]
pub fn select_device(visible: &[VisiblePeripheral], bound: Option<MacAddress>) -> Selection {
    if let Some(bound) = bound {
        return if visible.iter().any(|p| p.address == bound) {
            Selection::Select(bound)
        } else {
            Selection::Wait
        };
    }

    let candidates: BTreeSet<MacAddress> = visible
        .iter()
        .filter(|p| is_scale_candidate(p))
        .map(|p| p.address)
        .collect();

    match candidates.len() {
        1 => candidates
            .into_iter()
            .next()
            .map_or(Selection::Wait, Selection::Select),
        _ => Selection::Wait,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::characteristic::{uuid16, MIBEACON_SERVICE};

    fn peripheral(address: &str, name: Option<&str>) -> VisiblePeripheral {
        VisiblePeripheral {
            address: address.parse().unwrap(),
            name: name.map(str::to_string),
            service_uuids: Vec::new(),
        }
    }

    #[test]
    fn test_name_patterns() {
        for name in [
            "MIBFS",
            "MIBCS",
            "XMTZC05HM",
            "MI_SCALE",
            "MISCALE",
            "Mi Scale 2",
            "Xiaomi Body Composition Scale S400",
            "Body Fat Scale",
            "mi scale",
        ] {
            assert!(matches_scale_name(name), "{name} should match");
        }
        for name in ["AirPods", "Mi Band 7", "Kitchen Scale"] {
            assert!(!matches_scale_name(name), "{name} should not match");
        }
    }

    #[test]
    fn test_bound_address_never_selects_others() {
        let bound: MacAddress = "AA:BB:CC:DD:EE:FF".parse().unwrap();
        let visible = vec![peripheral("11:22:33:44:55:66", Some("MIBFS"))];
        assert_eq!(select_device(&visible, Some(bound)), Selection::Wait);
    }

    #[test]
    fn test_bound_address_selected_when_visible() {
        let bound: MacAddress = "AA:BB:CC:DD:EE:FF".parse().unwrap();
        let visible = vec![
            peripheral("11:22:33:44:55:66", Some("MIBFS")),
            peripheral("AA:BB:CC:DD:EE:FF", None),
        ];
        assert_eq!(select_device(&visible, Some(bound)), Selection::Select(bound));
    }

    #[test]
    fn test_unbound_single_candidate() {
        let visible = vec![
            peripheral("11:22:33:44:55:66", Some("Phone")),
            peripheral("AA:BB:CC:DD:EE:FF", Some("MIBFS")),
            peripheral("AA:BB:CC:DD:EE:FF", Some("MIBFS")),
        ];
        assert_eq!(
            select_device(&visible, None),
            Selection::Select("AA:BB:CC:DD:EE:FF".parse().unwrap())
        );
    }

    #[test]
    fn test_unbound_service_uuid_candidate() {
        let mut scale = peripheral("AA:BB:CC:DD:EE:FF", None);
        scale.service_uuids.push(MIBEACON_SERVICE);
        let mut other = peripheral("11:22:33:44:55:66", None);
        other.service_uuids.push(uuid16(0x180F));
        assert_eq!(
            select_device(&[other, scale], None),
            Selection::Select("AA:BB:CC:DD:EE:FF".parse().unwrap())
        );
    }

    #[test]
    fn test_unbound_no_or_many_candidates_waits() {
        assert_eq!(select_device(&[], None), Selection::Wait);
        let unknown = vec![peripheral("11:22:33:44:55:66", Some("Speaker"))];
        assert_eq!(select_device(&unknown, None), Selection::Wait);
        let two = vec![
            peripheral("11:22:33:44:55:66", Some("MIBFS")),
            peripheral("AA:BB:CC:DD:EE:FF", Some("MIBCS")),
        ];
        assert_eq!(select_device(&two, None), Selection::Wait);
    }

    #[test]
    fn test_selection_is_deterministic() {
        let visible = vec![peripheral("AA:BB:CC:DD:EE:FF", Some("MIBFS"))];
        assert_eq!(select_device(&visible, None), select_device(&visible, None));
    }
}
