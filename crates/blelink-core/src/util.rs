//! Utility functions for blelink-core.
//!
//! Identifier and name helpers shared by discovery, the btleplug backend and
//! the mock radio.

use btleplug::platform::PeripheralId;

/// Address reported by platforms that hide the real Bluetooth address.
const HIDDEN_ADDRESS: &str = "00:00:00:00:00:00";

/// Format a peripheral ID as a string.
///
/// On macOS, peripheral IDs are UUIDs. On other platforms, they may be
/// MAC addresses or other formats. This function extracts the useful
/// identifier string.
pub fn format_peripheral_id(id: &PeripheralId) -> String {
    format!("{:?}", id)
        .trim_start_matches("PeripheralId(")
        .trim_end_matches(')')
        .to_string()
}

/// Create an identifier string from an address and peripheral ID.
///
/// On macOS where addresses are 00:00:00:00:00:00, uses the peripheral ID.
/// On other platforms, uses the Bluetooth address.
pub fn create_identifier(address: &str, peripheral_id: &PeripheralId) -> String {
    choose_identifier(address, || format_peripheral_id(peripheral_id))
}

fn choose_identifier(address: &str, fallback: impl FnOnce() -> String) -> String {
    if address == HIDDEN_ADDRESS {
        fallback()
    } else {
        address.to_string()
    }
}

/// Normalise an advertised name for comparison: trimmed and case-folded.
pub fn normalize_name(name: &str) -> String {
    name.trim().to_lowercase()
}

/// Compare two device identifiers, ignoring ASCII case.
///
/// MAC addresses are printed upper-case by some stacks and lower-case by
/// others; macOS UUID identifiers vary the same way.
pub fn same_identifier(a: &str, b: &str) -> bool {
    a.trim().eq_ignore_ascii_case(b.trim())
}
