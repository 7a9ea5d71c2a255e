//! MiBeacon payload encryption.
//!
//! Encrypted payloads use AES-128-CCM with a 4-byte MIC. Neither the nonce
//! nor the AAD is transmitted; both are rebuilt from frame fields:
//!
//! - nonce (12): address in wire order, product id LE, frame counter,
//!   3-byte extension counter
//! - AAD (4): frame-control word LE, product id LE
//!
//! The payload is laid out as `ciphertext || ext_counter(3) || mic(4)`.

use std::fmt;
use std::str::FromStr;

use aes::Aes128;
use ccm::aead::generic_array::GenericArray;
use ccm::aead::{Aead, KeyInit, Payload};
use ccm::consts::{U12, U4};
use ccm::Ccm;
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::config::normalize_bind_key;
use crate::error::{Result, ScaleError};
use crate::frame::{decode_frame, AdvertisementFrame};
use crate::types::MacAddress;

/// Bind key length in bytes.
pub const KEY_LEN: usize = 16;
/// Nonce length in bytes.
pub const NONCE_LEN: usize = 12;
/// AAD length in bytes.
pub const AAD_LEN: usize = 4;
/// Extension counter length in bytes.
pub const EXT_COUNTER_LEN: usize = 3;
/// Message integrity check length in bytes.
pub const MIC_LEN: usize = 4;
/// Smallest payload that can hold one encrypted byte.
pub const MIN_ENCRYPTED_PAYLOAD_LEN: usize = 1 + EXT_COUNTER_LEN + MIC_LEN;

type MiBeaconCipher = Ccm<Aes128, U4, U12>;

/// A 16-byte AES key shared with the scale.
#[derive(Clone, PartialEq, Eq, Zeroize, ZeroizeOnDrop)]
pub struct BindKey([u8; KEY_LEN]);

impl BindKey {
    /// Wrap raw key bytes.
    #[must_use]
    pub const fn new(bytes: [u8; KEY_LEN]) -> Self {
        Self(bytes)
    }

    /// Raw key bytes.
    #[must_use]
    pub const fn as_bytes(&self) -> &[u8; KEY_LEN] {
        &self.0
    }

    fn cipher(&self) -> MiBeaconCipher {
        MiBeaconCipher::new(GenericArray::from_slice(&self.0))
    }
}

impl FromStr for BindKey {
    type Err = ScaleError;

    /// Parse 32 hex characters, optionally grouped with `:`, `-` or spaces.
    fn from_str(s: &str) -> Result<Self> {
        let mut normalized = normalize_bind_key(s);
        let mut bytes = [0u8; KEY_LEN];
        let decoded = hex::decode_to_slice(&normalized, &mut bytes);
        normalized.zeroize();
        match decoded {
            Ok(()) => Ok(Self(bytes)),
            Err(err) => {
                bytes.zeroize();
                Err(ScaleError::InvalidKey(format!(
                    "expected 32 hexadecimal characters: {err}"
                )))
            }
        }
    }
}

impl fmt::Debug for BindKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("BindKey(<redacted>)")
    }
}

/// Build the 12-byte CCM nonce.
#[must_use]
pub fn build_nonce(
    address: MacAddress,
    product_id: u16,
    frame_counter: u8,
    ext_counter: Option<[u8; EXT_COUNTER_LEN]>,
) -> [u8; NONCE_LEN] {
    let mut nonce = [0u8; NONCE_LEN];
    nonce[..6].copy_from_slice(&address.to_wire());
    nonce[6..8].copy_from_slice(&product_id.to_le_bytes());
    nonce[8] = frame_counter;
    nonce[9..].copy_from_slice(&ext_counter.unwrap_or_default());
    nonce
}

/// Build the 4-byte additional authenticated data.
#[must_use]
pub fn build_aad(frame_control_word: u16, product_id: u16) -> [u8; AAD_LEN] {
    let [fc0, fc1] = frame_control_word.to_le_bytes();
    let [pid0, pid1] = product_id.to_le_bytes();
    [fc0, fc1, pid0, pid1]
}

/// Decrypt the object payload of an encrypted frame.
///
/// `address` is the advertiser; frames often omit it and rely on the
/// radio-level address instead.
///
/// # Errors
///
/// - [`ScaleError::PayloadTooShort`] if the payload cannot hold ciphertext,
///   extension counter and MIC
/// - [`ScaleError::DecryptionFailed`] if the MIC does not verify
pub fn decrypt_payload(
    key: &BindKey,
    frame: &AdvertisementFrame,
    address: MacAddress,
) -> Result<Vec<u8>> {
    let payload = frame.payload.as_deref().unwrap_or_default();
    if payload.len() < MIN_ENCRYPTED_PAYLOAD_LEN {
        return Err(ScaleError::PayloadTooShort {
            len: payload.len(),
            min: MIN_ENCRYPTED_PAYLOAD_LEN,
        });
    }

    let (ciphertext, trailer) = payload.split_at(payload.len() - EXT_COUNTER_LEN - MIC_LEN);
    let (ext, mic) = trailer.split_at(EXT_COUNTER_LEN);
    let ext_counter = [ext[0], ext[1], ext[2]];

    let nonce = build_nonce(address, frame.product_id, frame.frame_counter, Some(ext_counter));
    let aad = build_aad(frame.frame_control_word, frame.product_id);

    let mut sealed = Vec::with_capacity(ciphertext.len() + MIC_LEN);
    sealed.extend_from_slice(ciphertext);
    sealed.extend_from_slice(mic);

    key.cipher()
        .decrypt(
            GenericArray::from_slice(&nonce),
            Payload {
                msg: &sealed,
                aad: &aad,
            },
        )
        .map_err(|_| ScaleError::DecryptionFailed)
}

/// Encrypt a plaintext object payload into the MiBeacon layout.
///
/// # Errors
///
/// Returns [`ScaleError::DecryptionFailed`] if the cipher rejects the input.
pub fn encrypt_payload(
    key: &BindKey,
    address: MacAddress,
    frame_control_word: u16,
    product_id: u16,
    frame_counter: u8,
    ext_counter: [u8; EXT_COUNTER_LEN],
    plaintext: &[u8],
) -> Result<Vec<u8>> {
    let nonce = build_nonce(address, product_id, frame_counter, Some(ext_counter));
    let aad = build_aad(frame_control_word, product_id);

    let sealed = key
        .cipher()
        .encrypt(
            GenericArray::from_slice(&nonce),
            Payload {
                msg: plaintext,
                aad: &aad,
            },
        )
        .map_err(|_| ScaleError::DecryptionFailed)?;

    let (ciphertext, mic) = sealed.split_at(sealed.len() - MIC_LEN);
    let mut payload = Vec::with_capacity(sealed.len() + EXT_COUNTER_LEN);
    payload.extend_from_slice(ciphertext);
    payload.extend_from_slice(&ext_counter);
    payload.extend_from_slice(mic);
    Ok(payload)
}

/// A captured encrypted advertisement used to check a candidate key.
#[derive(Debug, Clone, Copy)]
pub struct KeySample<'a> {
    /// Raw MiBeacon service data.
    pub service_data: &'a [u8],
    /// Radio-level address, used when the frame carries none.
    pub address: Option<MacAddress>,
    /// Known plaintext; when absent, a verifying MIC is a match.
    pub plaintext: Option<&'a [u8]>,
}

/// Check whether `candidate` decrypts `sample`.
///
/// Malformed keys and samples are reported as no match.
#[must_use]
pub fn test_key(candidate: &str, sample: &KeySample<'_>) -> bool {
    let Ok(key) = candidate.parse::<BindKey>() else {
        return false;
    };
    let Some(frame) = decode_frame(sample.service_data) else {
        return false;
    };
    let Some(address) = frame.address.or(sample.address) else {
        return false;
    };

    match decrypt_payload(&key, &frame, address) {
        Ok(plaintext) => sample
            .plaintext
            .map_or(true, |expected| expected == plaintext.as_slice()),
        Err(_) => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    const KEY: &str = "00112233445566778899aabbccddeeff";
    const FRAME_CONTROL: u16 = 0x5858; // encrypted | address | object | version 5
    const PRODUCT_ID: u16 = 0x3346;

    fn address() -> MacAddress {
        "AA:BB:CC:DD:EE:FF".parse().unwrap()
    }

    fn encrypted_service_data(key: &BindKey, plaintext: &[u8]) -> Vec<u8> {
        let payload = encrypt_payload(
            key,
            address(),
            FRAME_CONTROL,
            PRODUCT_ID,
            0x21,
            [0x01, 0x02, 0x03],
            plaintext,
        )
        .unwrap();
        let mut data = FRAME_CONTROL.to_le_bytes().to_vec();
        data.extend(PRODUCT_ID.to_le_bytes());
        data.push(0x21);
        data.extend(address().to_wire());
        data.extend(payload);
        data
    }

    #[test]
    fn test_key_parsing() {
        assert!(KEY.parse::<BindKey>().is_ok());
        assert!("00:11:22:33:44:55:66:77:88:99:AA:BB:CC:DD:EE:FF"
            .parse::<BindKey>()
            .is_ok());
        assert!("0011 2233 4455 6677 8899 aabb ccdd eeff"
            .parse::<BindKey>()
            .is_ok());
        assert!(matches!(
            "0011".parse::<BindKey>(),
            Err(ScaleError::InvalidKey(_))
        ));
        assert!(matches!(
            "zz112233445566778899aabbccddeeff".parse::<BindKey>(),
            Err(ScaleError::InvalidKey(_))
        ));
    }

    #[test]
    fn test_key_debug_is_redacted() {
        let key: BindKey = KEY.parse().unwrap();
        assert_eq!(format!("{key:?}"), "BindKey(<redacted>)");
    }

    #[test]
    fn test_nonce_layout() {
        let nonce = build_nonce(address(), 0x3346, 0x21, Some([0x01, 0x02, 0x03]));
        assert_eq!(
            nonce,
            [0xFF, 0xEE, 0xDD, 0xCC, 0xBB, 0xAA, 0x46, 0x33, 0x21, 0x01, 0x02, 0x03]
        );
        let nonce = build_nonce(address(), 0x3346, 0x21, None);
        assert_eq!(&nonce[9..], &[0, 0, 0]);
    }

    #[test]
    fn test_aad_layout() {
        assert_eq!(build_aad(0x5858, 0x3346), [0x58, 0x58, 0x46, 0x33]);
    }

    #[test]
    fn test_decrypt_recovers_plaintext() {
        let key: BindKey = KEY.parse().unwrap();
        let plaintext = [0x16, 0x04, 0x20, 0x00, 0xB0, 0x36];
        let data = encrypted_service_data(&key, &plaintext);
        let frame = decode_frame(&data).unwrap();
        assert!(frame.frame_control.is_encrypted);

        let decrypted = decrypt_payload(&key, &frame, frame.address.unwrap()).unwrap();
        assert_eq!(decrypted, plaintext);
    }

    #[test]
    fn test_wrong_key_fails_decryption() {
        let key: BindKey = KEY.parse().unwrap();
        let other: BindKey = "ffeeddccbbaa99887766554433221100".parse().unwrap();
        let data = encrypted_service_data(&key, &[0x17, 0x02, 0xE0, 0x01]);
        let frame = decode_frame(&data).unwrap();

        assert!(matches!(
            decrypt_payload(&other, &frame, address()),
            Err(ScaleError::DecryptionFailed)
        ));
    }

    #[test]
    fn test_tampered_aad_fails_decryption() {
        let key: BindKey = KEY.parse().unwrap();
        let mut data = encrypted_service_data(&key, &[0x17, 0x02, 0xE0, 0x01]);
        data[2] ^= 0x01;
        let frame = decode_frame(&data).unwrap();
        assert!(decrypt_payload(&key, &frame, address()).is_err());
    }

    #[test]
    fn test_short_payload_rejected_before_decryption() {
        let key: BindKey = KEY.parse().unwrap();
        let mut data = vec![0x58, 0x58, 0x46, 0x33, 0x21];
        data.extend(address().to_wire());
        data.extend([0u8; 7]);
        let frame = decode_frame(&data).unwrap();
        assert!(matches!(
            decrypt_payload(&key, &frame, address()),
            Err(ScaleError::PayloadTooShort { len: 7, min: 8 })
        ));
    }

    #[test]
    fn test_key_testing_utility() {
        let key: BindKey = KEY.parse().unwrap();
        let plaintext = [0x17, 0x02, 0xE0, 0x01];
        let data = encrypted_service_data(&key, &plaintext);

        let sample = KeySample {
            service_data: &data,
            address: None,
            plaintext: Some(&plaintext),
        };
        assert!(test_key(KEY, &sample));
        assert!(!test_key("ffeeddccbbaa99887766554433221100", &sample));
        assert!(!test_key("not a key", &sample));

        let wrong_plaintext = KeySample {
            plaintext: Some(&[0x00]),
            ..sample
        };
        assert!(!test_key(KEY, &wrong_plaintext));
    }

    proptest! {
        #[test]
        fn prop_nonce_is_deterministic(
            bytes in any::<[u8; 6]>(),
            product_id in any::<u16>(),
            counter in any::<u8>(),
            ext in any::<[u8; 3]>(),
        ) {
            let mac = MacAddress(bytes);
            let first = build_nonce(mac, product_id, counter, Some(ext));
            let second = build_nonce(mac, product_id, counter, Some(ext));
            prop_assert_eq!(first, second);

            let mut reversed = bytes;
            reversed.reverse();
            prop_assert_eq!(&first[..6], &reversed[..]);
        }
    }
}
