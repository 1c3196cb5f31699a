//! BLE Service and Characteristic UUIDs.
//!
//! ELM327-style BLE adapters expose a vendor service whose write and notify
//! characteristic UUIDs vary between models, so characteristics are matched
//! by a short UUID fragment rather than by exact UUID.

use uuid::Uuid;

/// OBD adapter service UUID (16-bit `FFF0` on the Bluetooth base UUID).
pub const OBD_SERVICE_UUID: Uuid = Uuid::from_u128(0x0000_fff0_0000_1000_8000_00805f9b34fb);

/// Fragment identifying the write characteristic within the OBD service.
pub const WRITE_CHARACTERISTIC_FRAGMENT: &str = "fff2";

/// Fragment identifying the notify characteristic within the OBD service.
pub const NOTIFY_CHARACTERISTIC_FRAGMENT: &str = "fff1";

/// Check whether a UUID contains the given fragment, ignoring case.
///
/// An empty fragment never matches.
pub fn matches_fragment(uuid: &Uuid, fragment: &str) -> bool {
    let fragment = fragment.trim();
    if fragment.is_empty() {
        return false;
    }

    uuid.to_string().contains(&fragment.to_ascii_lowercase())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_uuid_format() {
        let service = OBD_SERVICE_UUID.to_string();
        assert_eq!(service, "0000fff0-0000-1000-8000-00805f9b34fb");
    }

    #[test]
    fn test_matches_fragment_case_insensitive() {
        let write = Uuid::from_u128(0x0000_fff2_0000_1000_8000_00805f9b34fb);
        assert!(matches_fragment(&write, "fff2"));
        assert!(matches_fragment(&write, "FFF2"));
        assert!(matches_fragment(&write, " FfF2 "));
        assert!(!matches_fragment(&write, "fff1"));
    }

    #[test]
    fn test_empty_fragment_never_matches() {
        assert!(!matches_fragment(&OBD_SERVICE_UUID, ""));
        assert!(!matches_fragment(&OBD_SERVICE_UUID, "   "));
    }
}
