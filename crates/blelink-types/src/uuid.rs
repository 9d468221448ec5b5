//! Bluetooth characteristic identifiers.
//!
//! Characteristics are addressed by 128-bit UUIDs. SIG-assigned attributes
//! are usually written in their 16-bit short form (`2a19`), which expands
//! into the Bluetooth base UUID.

use uuid::{Uuid, uuid};

use crate::error::ParseError;

/// The Bluetooth base UUID (`00000000-0000-1000-8000-00805f9b34fb`).
pub const BLUETOOTH_BASE_UUID: Uuid = uuid!("00000000-0000-1000-8000-00805f9b34fb");

/// Expand a 16-bit SIG short identifier into a full UUID.
///
/// ```
/// use blelink_types::uuid::from_short;
///
/// assert_eq!(
///     from_short(0x2a19).to_string(),
///     "00002a19-0000-1000-8000-00805f9b34fb"
/// );
/// ```
#[must_use]
pub const fn from_short(short: u16) -> Uuid {
    Uuid::from_u128(BLUETOOTH_BASE_UUID.as_u128() | ((short as u128) << 96))
}

/// Parse a characteristic identifier supplied by a caller.
///
/// Accepts a full UUID in any form the `uuid` crate understands, or a 16-bit
/// short form with or without a `0x` prefix (case-insensitive).
///
/// # Errors
///
/// Returns [`ParseError::InvalidCharacteristic`] for anything else.
pub fn parse_characteristic(input: &str) -> Result<Uuid, ParseError> {
    let trimmed = input.trim();

    if let Ok(uuid) = Uuid::parse_str(trimmed) {
        return Ok(uuid);
    }

    let short = trimmed
        .strip_prefix("0x")
        .or_else(|| trimmed.strip_prefix("0X"))
        .unwrap_or(trimmed);

    if short.len() == 4
        && short.chars().all(|c| c.is_ascii_hexdigit())
        && let Ok(value) = u16::from_str_radix(short, 16)
    {
        return Ok(from_short(value));
    }

    Err(ParseError::InvalidCharacteristic(input.to_string()))
}
