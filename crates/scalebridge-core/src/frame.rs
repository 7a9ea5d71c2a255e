//! MiBeacon advertisement envelope decoding.
//!
//! Layout (all multi-byte fields little-endian):
//!
//! | offset | size | field                                  |
//! |--------|------|----------------------------------------|
//! | 0      | 2    | frame control                          |
//! | 2      | 2    | product id                             |
//! | 4      | 1    | frame counter                          |
//! | 5      | 6    | address, wire order (if `has_address`) |
//! | ..     | 1    | capability (if `has_capability`)       |
//! | ..     | rest | object payload (if `has_object`)       |

use tracing::trace;

use crate::types::MacAddress;

/// Service UUID (16-bit) under which MiBeacon frames are advertised.
pub const MIBEACON_SERVICE_UUID16: u16 = 0xFE95;

const HEADER_LEN: usize = 5;
const ADDRESS_LEN: usize = 6;

const ENCRYPTED: u16 = 0x0008;
const HAS_ADDRESS: u16 = 0x0010;
const HAS_CAPABILITY: u16 = 0x0020;
const HAS_OBJECT: u16 = 0x0040;
const MESH: u16 = 0x0080;
const REGISTERED: u16 = 0x0100;
const BINDING_CONFIRMED: u16 = 0x0200;

/// Every bit inspected by [`FrameControl::from_word`].
pub const FLAG_MASK: u16 = ENCRYPTED
    | HAS_ADDRESS
    | HAS_CAPABILITY
    | HAS_OBJECT
    | MESH
    | REGISTERED
    | BINDING_CONFIRMED;

/// Frame-control flags.
#[allow(clippy::struct_excessive_bools)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FrameControl {
    /// Object payload is AES-CCM encrypted.
    pub is_encrypted: bool,
    /// A 6-byte address follows the header.
    pub has_address: bool,
    /// A capability byte follows the address.
    pub has_capability: bool,
    /// An object payload follows.
    pub has_object: bool,
    /// Mesh device.
    pub is_mesh: bool,
    /// Device has been registered.
    pub is_registered: bool,
    /// Binding has been confirmed.
    pub is_binding_confirmed: bool,
    version: u8,
}

impl FrameControl {
    /// Decode flags from a frame-control word.
    #[must_use]
    pub const fn from_word(word: u16) -> Self {
        #[allow(clippy::cast_possible_truncation)]
        let version = (word >> 12) as u8;
        Self {
            is_encrypted: word & ENCRYPTED != 0,
            has_address: word & HAS_ADDRESS != 0,
            has_capability: word & HAS_CAPABILITY != 0,
            has_object: word & HAS_OBJECT != 0,
            is_mesh: word & MESH != 0,
            is_registered: word & REGISTERED != 0,
            is_binding_confirmed: word & BINDING_CONFIRMED != 0,
            version,
        }
    }

    /// Re-encode the seven flags and the version nibble.
    #[must_use]
    pub const fn to_word(self) -> u16 {
        let mut word = (self.version as u16) << 12;
        if self.is_encrypted {
            word |= ENCRYPTED;
        }
        if self.has_address {
            word |= HAS_ADDRESS;
        }
        if self.has_capability {
            word |= HAS_CAPABILITY;
        }
        if self.has_object {
            word |= HAS_OBJECT;
        }
        if self.is_mesh {
            word |= MESH;
        }
        if self.is_registered {
            word |= REGISTERED;
        }
        if self.is_binding_confirmed {
            word |= BINDING_CONFIRMED;
        }
        word
    }

    /// Protocol version (bits 12..=15).
    #[must_use]
    pub const fn version(self) -> u8 {
        self.version
    }
}

/// A decoded MiBeacon envelope.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AdvertisementFrame {
    /// Decoded flags.
    pub frame_control: FrameControl,
    /// The raw frame-control word, needed for the AAD.
    pub frame_control_word: u16,
    /// Product identifier.
    pub product_id: u16,
    /// Per-advertisement counter.
    pub frame_counter: u8,
    /// Advertiser address in canonical order.
    pub address: Option<MacAddress>,
    /// Capability byte.
    pub capability: Option<u8>,
    /// Object payload, plaintext or encrypted per `frame_control.is_encrypted`.
    pub payload: Option<Vec<u8>>,
}

/// Decode a MiBeacon service-data buffer.
///
/// Returns `None` for input shorter than the header or with a truncated
/// address or capability section; such advertisements are simply ignored.
#[must_use]
pub fn decode_frame(data: &[u8]) -> Option<AdvertisementFrame> {
    if data.len() < HEADER_LEN {
        trace!(len = data.len(), "advertisement shorter than MiBeacon header");
        return None;
    }

    let frame_control_word = u16::from_le_bytes([data[0], data[1]]);
    let frame_control = FrameControl::from_word(frame_control_word);
    let product_id = u16::from_le_bytes([data[2], data[3]]);
    let frame_counter = data[4];
    let mut rest = &data[HEADER_LEN..];

    let address = if frame_control.has_address {
        let Some(bytes) = rest.get(..ADDRESS_LEN) else {
            trace!("MiBeacon address section truncated");
            return None;
        };
        let mut wire = [0u8; ADDRESS_LEN];
        wire.copy_from_slice(bytes);
        rest = &rest[ADDRESS_LEN..];
        Some(MacAddress::from_wire(wire))
    } else {
        None
    };

    let capability = if frame_control.has_capability {
        let (&byte, tail) = rest.split_first()?;
        rest = tail;
        Some(byte)
    } else {
        None
    };

    let payload = (frame_control.has_object && !rest.is_empty()).then(|| rest.to_vec());

    Some(AdvertisementFrame {
        frame_control,
        frame_control_word,
        product_id,
        frame_counter,
        address,
        capability,
        payload,
    })
}
