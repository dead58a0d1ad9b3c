// transport/zero.rs
//
// Zero detection: the hierarchical sampled probe and the full-slice scan.

/// Bytes read per probe anchor.
pub const SAMPLE_LEN: u64 = 8 * 1024;

/// Slices at or above this size get the sampled probe before a full read.
pub const SAMPLED_PROBE_MIN: u64 = 4 * 1024 * 1024;

/// Anchored probe offsets for a slice of `len` bytes: start, 25 %, 50 %,
/// 75 % and end, each aligned down to the sample size so reads stay
/// 8 KiB-granular.
pub fn probe_offsets(len: u64) -> [u64; 5] {
    debug_assert!(len >= SAMPLED_PROBE_MIN);
    let align = |offset: u64| (offset / SAMPLE_LEN) * SAMPLE_LEN;
    [
        0,
        align(len / 4),
        align(len / 2),
        align(len / 4 * 3),
        len - SAMPLE_LEN,
    ]
}

/// True iff every byte of `buf` is zero.
///
/// Compares 8-byte lanes with a byte-wise tail; the lane loop vectorises
/// well and short-circuits on the first nonzero lane.
pub fn is_all_zero(buf: &[u8]) -> bool {
    let (prefix, lanes, suffix) = unsafe { buf.align_to::<u64>() };
    prefix.iter().all(|&b| b == 0)
        && lanes.iter().all(|&lane| lane == 0)
        && suffix.iter().all(|&b| b == 0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn probe_offsets_are_sample_aligned() {
        let offsets = probe_offsets(4 * 1024 * 1024);
        for offset in offsets {
            assert_eq!(offset % SAMPLE_LEN, 0, "offset {} misaligned", offset);
        }
        assert_eq!(offsets[0], 0);
        assert_eq!(offsets[4], 4 * 1024 * 1024 - SAMPLE_LEN);
    }

    #[test]
    fn probe_offsets_cover_distinct_regions() {
        let len = 32 * 1024 * 1024;
        let offsets = probe_offsets(len);
        for window in offsets.windows(2) {
            assert!(window[0] < window[1]);
        }
        for offset in offsets {
            assert!(offset + SAMPLE_LEN <= len);
        }
    }

    #[test]
    fn zero_scan_accepts_all_zero() {
        assert!(is_all_zero(&[]));
        assert!(is_all_zero(&[0u8; 7]));
        assert!(is_all_zero(&vec![0u8; 1024 * 1024]));
    }

    #[test]
    fn zero_scan_catches_single_nonzero_byte() {
        let mut buf = vec![0u8; 64 * 1024];
        for position in [0, 1, 7, 8, 9, 63 * 1024, 64 * 1024 - 1] {
            buf[position] = 1;
            assert!(!is_all_zero(&buf), "missed byte at {}", position);
            buf[position] = 0;
        }
    }

    #[test]
    fn zero_scan_handles_unaligned_slices() {
        let buf = vec![0u8; 4096];
        assert!(is_all_zero(&buf[1..]));
        assert!(is_all_zero(&buf[3..4093]));

        let mut buf = vec![0u8; 4096];
        buf[2048] = 0xFF;
        assert!(!is_all_zero(&buf[1..]));
    }
}
