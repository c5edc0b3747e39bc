//! GATT UUID normalization, default session targets, and scan constants.
//!
//! Every UUID that enters the core (advertisements, discovered services,
//! discovered characteristics, configured targets) is passed through
//! [`normalize_uuid`] so comparisons are plain string equality on the
//! 32-digit lowercase form:
//!
//! ```text
//! "ec00"                                 → 0000ec0000001000800000805f9b34fb
//! "0x2A37"                               → 00002a3700001000800000805f9b34fb
//! "0000EC0E-0000-1000-8000-00805F9B34FB" → 0000ec0e00001000800000805f9b34fb
//! ```

use uuid::Uuid;

// ── Bluetooth base UUID ───────────────────────────────────────────────────────

/// The Bluetooth SIG base UUID `00000000-0000-1000-8000-00805F9B34FB`.
///
/// 16-bit and 32-bit assigned numbers are shorthand for this UUID with the
/// top 32 bits replaced by the short value.
pub const BLUETOOTH_BASE_UUID: Uuid = Uuid::from_u128(0x00000000_0000_1000_8000_00805f9b34fb);

/// Mask selecting the 96 low bits shared by every base-range UUID.
const BASE_SUFFIX_MASK: u128 = (1u128 << 96) - 1;

// ── Default session target ────────────────────────────────────────────────────

/// Service UUID the session binds to when no target is configured.
pub const DEFAULT_SERVICE_UUID: &str = "ec00";

/// Characteristic UUID (inside [`DEFAULT_SERVICE_UUID`]) used for
/// read / write / notify when no target is configured.
pub const DEFAULT_CHARACTERISTIC_UUID: &str = "ec0e";

// ── Scan defaults ─────────────────────────────────────────────────────────────

/// Scan duration in seconds before the adapter stops on its own.
pub const DEFAULT_SCAN_TIMEOUT_SECS: u64 = 10;

/// Upper bound in seconds on a single connect or discovery step.
pub const DEFAULT_STEP_TIMEOUT_SECS: u64 = 15;

// ── Normalization ─────────────────────────────────────────────────────────────

/// Normalize a UUID string to the 32-digit lowercase form without dashes.
///
/// | Input length (hex digits) | Result |
/// |---|---|
/// | 4 | `0000XXXX` + base suffix |
/// | 8 | `XXXXXXXX` + base suffix |
/// | 32 | unchanged apart from case |
///
/// An optional `0x` prefix, surrounding whitespace, braces, and dashes are
/// ignored. Input that is not a UUID at all is returned trimmed and
/// lowercased so that comparisons stay deterministic.
///
/// ```
/// # use ble_session::protocol::normalize_uuid;
/// assert_eq!(normalize_uuid("ec00"), "0000ec0000001000800000805f9b34fb");
/// assert_eq!(
///     normalize_uuid("0000ec00-0000-1000-8000-00805F9B34FB"),
///     "0000ec0000001000800000805f9b34fb"
/// );
/// ```
pub fn normalize_uuid(input: &str) -> String {
    match parse_uuid(input) {
        Some(uuid) => uuid.simple().to_string(),
        None => input.trim().to_ascii_lowercase(),
    }
}

/// Parse a UUID in any of the forms accepted by [`normalize_uuid`].
pub fn parse_uuid(input: &str) -> Option<Uuid> {
    let trimmed = input.trim();
    let trimmed = trimmed
        .strip_prefix("0x")
        .or_else(|| trimmed.strip_prefix("0X"))
        .unwrap_or(trimmed)
        .trim_start_matches('{')
        .trim_end_matches('}');
    let digits: String = trimmed.chars().filter(|c| *c != '-').collect();
    if !digits.chars().all(|c| c.is_ascii_hexdigit()) {
        return None;
    }

    match digits.len() {
        4 => u16::from_str_radix(&digits, 16)
            .ok()
            .map(|short| from_short(u32::from(short))),
        8 => u32::from_str_radix(&digits, 16).ok().map(from_short),
        32 => Uuid::try_parse(&digits).ok(),
        _ => None,
    }
}

/// Return the 4-digit shorthand of a base-range UUID, if it has one.
///
/// This is the inverse of the 4-digit case of [`normalize_uuid`]:
/// `normalize_uuid(&short_uuid(u).unwrap()) == normalize_uuid(u)` for every
/// UUID that has a 16-bit form.
pub fn short_uuid(input: &str) -> Option<String> {
    let value = parse_uuid(input)?.as_u128();
    let base = BLUETOOTH_BASE_UUID.as_u128();
    if value & BASE_SUFFIX_MASK != base & BASE_SUFFIX_MASK {
        return None;
    }
    let head = (value >> 96) as u32;
    if head > u32::from(u16::MAX) {
        return None;
    }
    Some(format!("{head:04x}"))
}

/// `true` when both strings name the same UUID after normalization.
pub fn uuid_eq(a: &str, b: &str) -> bool {
    normalize_uuid(a) == normalize_uuid(b)
}

fn from_short(short: u32) -> Uuid {
    Uuid::from_u128(BLUETOOTH_BASE_UUID.as_u128() | (u128::from(short) << 96))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn expands_16_bit_shorthand() {
        assert_eq!(normalize_uuid("ec00"), "0000ec0000001000800000805f9b34fb");
        assert_eq!(normalize_uuid("0x2A37"), "00002a3700001000800000805f9b34fb");
        assert_eq!(normalize_uuid(" 180D "), "0000180d00001000800000805f9b34fb");
    }

    #[test]
    fn expands_32_bit_shorthand() {
        assert_eq!(normalize_uuid("0000ec0e"), "0000ec0e00001000800000805f9b34fb");
        assert_eq!(normalize_uuid("12345678"), "1234567800001000800000805f9b34fb");
    }

    #[test]
    fn full_uuids_are_only_reformatted() {
        let canonical = "273e0001-4c4d-454d-96be-f03bac821358";
        assert_eq!(normalize_uuid(canonical), "273e00014c4d454d96bef03bac821358");
        assert_eq!(
            normalize_uuid("{0000EC0E-0000-1000-8000-00805F9B34FB}"),
            "0000ec0e00001000800000805f9b34fb"
        );
    }

    #[test]
    fn normalization_is_idempotent() {
        for input in ["ec00", "2a37", "273e0001-4c4d-454d-96be-f03bac821358", "garbage"] {
            let once = normalize_uuid(input);
            assert_eq!(normalize_uuid(&once), once, "input {input}");
        }
    }

    #[test]
    fn short_form_round_trips() {
        let long = normalize_uuid("ec0e");
        assert_eq!(short_uuid(&long).as_deref(), Some("ec0e"));
        assert_eq!(normalize_uuid(&short_uuid(&long).unwrap()), long);
    }

    #[test]
    fn vendor_uuids_have_no_short_form() {
        assert_eq!(short_uuid("273e0001-4c4d-454d-96be-f03bac821358"), None);
        assert_eq!(short_uuid("1234567800001000800000805f9b34fb"), None);
    }

    #[test]
    fn invalid_input_is_lowercased_not_rejected() {
        assert_eq!(normalize_uuid("  Not-A-UUID "), "not-a-uuid");
        assert_eq!(parse_uuid("xyz0"), None);
        assert_eq!(parse_uuid("abc"), None);
    }

    #[test]
    fn equality_ignores_representation() {
        assert!(uuid_eq("EC00", "0000ec00-0000-1000-8000-00805f9b34fb"));
        assert!(!uuid_eq("ec00", "ec0e"));
    }
}
