//! USB/IP status codes
//!
//! The URB channel reports transfer outcomes as negated Linux errno values;
//! the op channel uses a simple OK/NA status word. Both are part of the wire
//! contract with `vhci_hcd` and must not drift.

/// Op-channel status: request completed
pub const ST_OK: u32 = 0x00;
/// Op-channel status: request failed / device not available
pub const ST_NA: u32 = 0x01;

/// Endpoint stalled
pub const EPIPE: i32 = 32;
/// Device disconnected mid-transfer
pub const ENODEV: i32 = 19;
/// Transfer deadline exceeded
pub const ETIMEDOUT: i32 = 110;
/// Transfer cancelled by UNLINK
pub const ECONNRESET: i32 = 104;
/// Device returned more data than the buffer allowed
pub const EOVERFLOW: i32 = 75;
/// Protocol-level transfer failure (catch-all)
pub const EPROTO: i32 = 71;
/// URB rejected before submission (bad parameters)
pub const EINVAL: i32 = 22;

/// Success status for the URB channel
pub const URB_OK: i32 = 0;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_errno_values_match_linux() {
        // These exact values are observed by vhci_hcd; a wrong constant
        // produces undiagnosable client-side behavior.
        assert_eq!(-EPIPE, -32);
        assert_eq!(-ENODEV, -19);
        assert_eq!(-ETIMEDOUT, -110);
        assert_eq!(-ECONNRESET, -104);
        assert_eq!(-EOVERFLOW, -75);
        assert_eq!(-EPROTO, -71);
        assert_eq!(-EINVAL, -22);
    }
}
