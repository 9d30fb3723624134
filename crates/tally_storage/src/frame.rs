//! On-disk frame format.
//!
//! ```text
//! | magic "TLOG" (4) | version u16 LE | payload_len u32 LE | payload | crc32 LE |
//! ```
//!
//! The checksum covers header and payload.

use crate::error::{StorageError, StorageResult};

/// Magic bytes identifying a frame.
pub const FRAME_MAGIC: [u8; 4] = *b"TLOG";

/// Current frame format version.
pub const FRAME_VERSION: u16 = 1;

const HEADER_SIZE: usize = 4 + 2 + 4;
const CRC_SIZE: usize = 4;

/// Largest payload a single frame may carry.
pub(crate) const MAX_PAYLOAD_SIZE: usize = u32::MAX as usize;

/// Wraps a payload in a checksummed frame.
pub(crate) fn encode_frame(payload: &[u8]) -> StorageResult<Vec<u8>> {
    if payload.len() > MAX_PAYLOAD_SIZE {
        return Err(StorageError::BatchTooLarge {
            size: payload.len(),
        });
    }

    let mut frame = Vec::with_capacity(HEADER_SIZE + payload.len() + CRC_SIZE);
    frame.extend_from_slice(&FRAME_MAGIC);
    frame.extend_from_slice(&FRAME_VERSION.to_le_bytes());
    frame.extend_from_slice(&(payload.len() as u32).to_le_bytes());
    frame.extend_from_slice(payload);
    let crc = compute_crc32(&frame);
    frame.extend_from_slice(&crc.to_le_bytes());
    Ok(frame)
}

/// Result of scanning a log for frames.
#[derive(Debug)]
pub(crate) struct ScannedLog<'a> {
    /// Payloads of every valid frame, in log order.
    pub payloads: Vec<&'a [u8]>,
    /// Length of the valid prefix; anything after it is a torn tail.
    pub valid_len: u64,
}

/// Splits a log into frame payloads.
///
/// A damaged *last* frame is a torn write and simply ends the log. A
/// damaged frame followed by more bytes is real corruption and is
/// reported as an error.
pub(crate) fn scan_frames(bytes: &[u8]) -> StorageResult<ScannedLog<'_>> {
    let mut payloads = Vec::new();
    let mut pos = 0usize;

    while pos < bytes.len() {
        let offset = pos as u64;
        let remaining = &bytes[pos..];

        if remaining.len() < HEADER_SIZE {
            break;
        }

        if remaining[0..4] != FRAME_MAGIC {
            return Err(StorageError::corrupted(offset, "invalid frame magic"));
        }

        let version = u16::from_le_bytes([remaining[4], remaining[5]]);
        if version > FRAME_VERSION {
            return Err(StorageError::corrupted(
                offset,
                format!("unsupported frame version {version}"),
            ));
        }

        let payload_len =
            u32::from_le_bytes([remaining[6], remaining[7], remaining[8], remaining[9]]) as usize;
        let total_len = HEADER_SIZE + payload_len + CRC_SIZE;

        if remaining.len() < total_len {
            break;
        }

        let body_end = HEADER_SIZE + payload_len;
        let stored_crc = u32::from_le_bytes([
            remaining[body_end],
            remaining[body_end + 1],
            remaining[body_end + 2],
            remaining[body_end + 3],
        ]);
        let computed_crc = compute_crc32(&remaining[..body_end]);

        if stored_crc != computed_crc {
            if remaining.len() == total_len {
                break;
            }
            return Err(StorageError::ChecksumMismatch {
                expected: stored_crc,
                actual: computed_crc,
            });
        }

        payloads.push(&remaining[HEADER_SIZE..body_end]);
        pos += total_len;
    }

    let valid_len = payloads
        .iter()
        .map(|p| (HEADER_SIZE + p.len() + CRC_SIZE) as u64)
        .sum();

    Ok(ScannedLog {
        payloads,
        valid_len,
    })
}

/// Computes CRC32 checksum for data (IEEE polynomial).
pub fn compute_crc32(data: &[u8]) -> u32 {
    const CRC32_TABLE: [u32; 256] = {
        let mut table = [0u32; 256];
        let mut i = 0;
        while i < 256 {
            let mut crc = i as u32;
            let mut j = 0;
            while j < 8 {
                if crc & 1 != 0 {
                    crc = (crc >> 1) ^ 0xEDB8_8320;
                } else {
                    crc >>= 1;
                }
                j += 1;
            }
            table[i] = crc;
            i += 1;
        }
        table
    };

    let mut crc = 0xFFFF_FFFF_u32;
    for &byte in data {
        let index = ((crc ^ u32::from(byte)) & 0xFF) as usize;
        crc = (crc >> 8) ^ CRC32_TABLE[index];
    }
    !crc
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn crc32_known_value() {
        assert_eq!(compute_crc32(b"123456789"), 0xCBF4_3926);
        assert_eq!(compute_crc32(b""), 0);
    }

    #[test]
    fn scan_reads_back_frames() {
        let mut log = encode_frame(b"first").unwrap();
        log.extend(encode_frame(b"second").unwrap());

        let scanned = scan_frames(&log).unwrap();
        assert_eq!(scanned.payloads, vec![&b"first"[..], &b"second"[..]]);
        assert_eq!(scanned.valid_len, log.len() as u64);
    }

    #[test]
    fn incomplete_tail_ends_log() {
        let mut log = encode_frame(b"complete").unwrap();
        let valid = log.len() as u64;
        let torn = encode_frame(b"torn write").unwrap();
        log.extend_from_slice(&torn[..torn.len() - 3]);

        let scanned = scan_frames(&log).unwrap();
        assert_eq!(scanned.payloads.len(), 1);
        assert_eq!(scanned.valid_len, valid);
    }

    #[test]
    fn bad_checksum_on_last_frame_is_torn_tail() {
        let mut log = encode_frame(b"ok").unwrap();
        let valid = log.len() as u64;
        let mut last = encode_frame(b"flipped").unwrap();
        let n = last.len();
        last[n - 1] ^= 0xFF;
        log.extend(last);

        let scanned = scan_frames(&log).unwrap();
        assert_eq!(scanned.payloads.len(), 1);
        assert_eq!(scanned.valid_len, valid);
    }

    #[test]
    fn bad_checksum_mid_log_is_corruption() {
        let mut first = encode_frame(b"flipped").unwrap();
        first[HEADER_SIZE] ^= 0xFF;
        let mut log = first;
        log.extend(encode_frame(b"after").unwrap());

        assert!(matches!(
            scan_frames(&log),
            Err(StorageError::ChecksumMismatch { .. })
        ));
    }

    #[test]
    fn wrong_magic_is_corruption() {
        let mut log = encode_frame(b"x").unwrap();
        log[0] = b'X';
        assert!(matches!(
            scan_frames(&log),
            Err(StorageError::Corrupted { offset: 0, .. })
        ));
    }
}
