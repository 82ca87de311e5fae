//! WebTransport application error codes.
//!
//! WebTransport shares the HTTP/3 stream reset space, so the 32-bit
//! application codes are transposed into a reserved range with a GREASE
//! gap every 0x1f values. The mapping is a bijection; HTTP/3 codes that
//! fall into a gap or outside the range are not WebTransport codes.

/// First HTTP/3 error code of the WebTransport range.
const FIRST: u64 = 0x52e4a40fa8db;

/// Sent on streams that waited too long for their session to appear.
///
/// This value lives directly in the HTTP/3 reset space, outside the
/// mapped application range.
pub const WEBTRANSPORT_BUFFERED_STREAM_REJECTED: quinn::VarInt =
    quinn::VarInt::from_u32(0x3994bd84);

/// Transpose a WebTransport application error code into the HTTP/3 space.
pub fn error_to_http3(code: u32) -> u64 {
    let code = code as u64;
    FIRST + code + code / 0x1e
}

/// Recover a WebTransport application error code from an HTTP/3 code.
///
/// Returns `None` for codes outside the reserved range and for the
/// GREASE values inside it; those resets are not WebTransport resets.
pub fn error_from_http3(code: u64) -> Option<u32> {
    let shifted = code.checked_sub(FIRST)?;
    // Every 0x1f-th value in the range is GREASE and never produced by
    // error_to_http3.
    if shifted % 0x1f == 0x1e {
        return None;
    }
    let wt = shifted - shifted / 0x1f;
    u32::try_from(wt).ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn roundtrip() {
        let samples = [
            0u32,
            1,
            0x1d,
            0x1e,
            0x1f,
            0x29,
            0x41,
            0x100,
            0xdead_beef,
            u32::MAX - 1,
            u32::MAX,
        ];
        for code in samples {
            let http = error_to_http3(code);
            assert_eq!(error_from_http3(http), Some(code), "code {code:#x}");
        }
    }

    #[test]
    fn monotonic_with_gaps() {
        // Adjacent application codes are adjacent on the wire except when
        // they straddle a GREASE value.
        assert_eq!(error_to_http3(0), FIRST);
        assert_eq!(error_to_http3(0x1d), FIRST + 0x1d);
        assert_eq!(error_to_http3(0x1e), FIRST + 0x1f);
    }

    #[test]
    fn rejects_grease_values() {
        assert_eq!(error_from_http3(FIRST + 0x1e), None);
        assert_eq!(error_from_http3(FIRST + 0x1e + 0x1f), None);
    }

    #[test]
    fn rejects_out_of_range() {
        assert_eq!(error_from_http3(0), None);
        assert_eq!(error_from_http3(FIRST - 1), None);
        assert_eq!(error_from_http3(error_to_http3(u32::MAX) + 2), None);
        assert_eq!(
            error_from_http3(WEBTRANSPORT_BUFFERED_STREAM_REJECTED.into_inner()),
            None
        );
    }
}
