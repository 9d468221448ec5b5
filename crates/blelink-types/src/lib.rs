//! Platform-agnostic types for blelink.
//!
//! This crate holds the pieces of the wire format that do not depend on a
//! Bluetooth stack, so they can be reused by tooling that never touches a
//! radio.
//!
//! # Features
//!
//! - [`SampleWindow`]: decoding of the fixed 128-byte sample payload
//! - Characteristic identifier parsing (full UUID or 16-bit short form)
//! - [`ParseError`] for malformed payloads and identifiers
//!
//! # Example
//!
//! ```
//! use blelink_types::{SampleWindow, SAMPLE_PAYLOAD_LEN};
//!
//! let payload = vec![0u8; SAMPLE_PAYLOAD_LEN];
//! let window = SampleWindow::from_bytes(&payload).unwrap();
//! assert_eq!(window.as_slice().len(), 64);
//! ```

pub mod error;
pub mod sample;
pub mod uuid;

pub use error::{ParseError, ParseResult};
pub use sample::{SAMPLE_PAYLOAD_LEN, SAMPLES_PER_WINDOW, SampleWindow};
pub use crate::uuid::parse_characteristic;

#[cfg(test)]
mod tests {
    use super::*;

    fn sequential_payload() -> Vec<u8> {
        (0u16..64).flat_map(|v| v.to_le_bytes()).collect()
    }

    // --- SampleWindow decoding ---

    #[test]
    fn test_decode_sequential_values() {
        let window = SampleWindow::from_bytes(&sequential_payload()).unwrap();

        let expected: Vec<u16> = (0..64).collect();
        assert_eq!(window.as_slice(), expected.as_slice());
    }

    #[test]
    fn test_decode_is_little_endian() {
        let mut payload = vec![0u8; SAMPLE_PAYLOAD_LEN];
        payload[0] = 0x34;
        payload[1] = 0x12;
        payload[126] = 0xFF;
        payload[127] = 0xFF;

        let window = SampleWindow::from_bytes(&payload).unwrap();
        assert_eq!(window.as_slice()[0], 0x1234);
        assert_eq!(window.as_slice()[63], u16::MAX);
    }

    #[test]
    fn test_decode_rejects_short_payload() {
        let payload = vec![0u8; 127];

        let err = SampleWindow::from_bytes(&payload).unwrap_err();
        assert_eq!(
            err,
            ParseError::InvalidLength {
                expected: 128,
                actual: 127
            }
        );
        assert!(err.to_string().contains("requires 128 bytes"));
    }

    #[test]
    fn test_decode_rejects_long_payload() {
        let payload = vec![0u8; 130];
        assert!(SampleWindow::from_bytes(&payload).is_err());
    }

    #[test]
    fn test_decode_rejects_empty_payload() {
        assert!(SampleWindow::from_bytes(&[]).is_err());
    }

    #[test]
    fn test_to_bytes_matches_wire_format() {
        let payload = sequential_payload();
        let window = SampleWindow::from_bytes(&payload).unwrap();
        assert_eq!(window.to_bytes(), payload);
    }

    #[test]
    fn test_window_from_slice_wrong_length() {
        let samples = [1u16; 10];
        let result = SampleWindow::try_from(&samples[..]);
        assert!(matches!(
            result,
            Err(ParseError::InvalidLength {
                expected: 64,
                actual: 10
            })
        ));
    }

    #[test]
    fn test_window_debug_is_compact() {
        let window = SampleWindow::from_bytes(&sequential_payload()).unwrap();
        let debug = format!("{:?}", window);
        assert!(debug.contains("first: 0"));
        assert!(debug.contains("last: 63"));
    }

    // --- Characteristic identifiers ---

    #[test]
    fn test_parse_full_uuid() {
        let uuid = parse_characteristic("f0cd3001-95da-4f4b-9ac8-aa55d312af0c").unwrap();
        assert_eq!(uuid.to_string(), "f0cd3001-95da-4f4b-9ac8-aa55d312af0c");
    }

    #[test]
    fn test_parse_short_form() {
        let expected = "00002a19-0000-1000-8000-00805f9b34fb";
        assert_eq!(parse_characteristic("2a19").unwrap().to_string(), expected);
        assert_eq!(parse_characteristic("0x2A19").unwrap().to_string(), expected);
        assert_eq!(parse_characteristic(" 2A19 ").unwrap().to_string(), expected);
    }

    #[test]
    fn test_parse_invalid_characteristic() {
        for input in ["", "2a1", "2a19a", "zzzz", "+a19", "not-a-uuid"] {
            let err = parse_characteristic(input).unwrap_err();
            assert!(
                matches!(err, ParseError::InvalidCharacteristic(_)),
                "{input:?} should be rejected"
            );
        }
    }

    #[test]
    fn test_base_uuid_short_zero() {
        assert_eq!(crate::uuid::from_short(0), crate::uuid::BLUETOOTH_BASE_UUID);
    }

    mod proptests {
        use super::*;
        use proptest::prelude::*;

        proptest! {
            #[test]
            fn decode_rejects_any_other_length(data in proptest::collection::vec(any::<u8>(), 0..512)) {
                prop_assume!(data.len() != SAMPLE_PAYLOAD_LEN);
                prop_assert!(SampleWindow::from_bytes(&data).is_err());
            }

            #[test]
            fn decode_accepts_any_exact_payload(data in proptest::collection::vec(any::<u8>(), SAMPLE_PAYLOAD_LEN)) {
                let window = SampleWindow::from_bytes(&data).unwrap();
                prop_assert_eq!(window.as_slice()[0], u16::from_le_bytes([data[0], data[1]]));
                prop_assert_eq!(window.len(), SAMPLES_PER_WINDOW);
            }
        }
    }
}
