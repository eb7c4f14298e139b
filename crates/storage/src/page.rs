//! On-page object format.
//!
//! Every data page starts with a 2-byte free-length prefix, followed
//! by (header, segment bytes) records packed from a cursor. Remaining
//! free space carries the 0xFF fill pattern.
//!
//! # Page layout (big-endian)
//!
//! ```text
//! offset 0:  page free length       (2 bytes, unsigned)
//! then, repeated records:
//!   OID                             (8 bytes, signed, always positive)
//!   object total length             (4 bytes, signed)
//!   overflow pointer                (8 bytes, signed; null sentinel = 0)
//!   segment length                  (2 bytes, unsigned)
//!   segment bytes                   (segment length bytes)
//! remaining free space: 0xFF fill
//! ```
//!
//! The OID, total length, and overflow pointer are stored as signed
//! fields; a set sign bit or a negative total length can only come
//! from media or logic failure and decodes as corruption.

use byteorder::{BigEndian, ByteOrder};
use orion_core::{Error, ObjectPtr, Oid, Result};

/// Size of the free-length prefix at the start of every data page.
pub const FREE_LEN_SIZE: usize = 2;

/// Encoded size of an object segment header.
pub const OBJECT_HEADER_SIZE: usize = 8 + 4 + 8 + 2;

/// Fill byte for free space and freed records.
pub const FREE_FILL: u8 = 0xFF;

/// Usable bytes on a data page (everything after the prefix).
pub fn usable_size(page_size: usize) -> usize {
    page_size - FREE_LEN_SIZE
}

/// Smallest record worth packing: a header plus one payload byte.
/// A remainder below this is abandoned to the page's free count.
pub fn min_record_size() -> usize {
    OBJECT_HEADER_SIZE + 1
}

/// Per-segment metadata preceding the segment bytes on a page.
///
/// Chain invariants: the sum of `seg_len` across the overflow chain
/// equals `total_len`, and every segment stores the same `oid` and
/// `total_len`. Violations decode or validate as corruption; they are
/// never repaired.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ObjectHeader {
    /// Owning object.
    pub oid: Oid,
    /// Total object length across the whole chain.
    pub total_len: u32,
    /// Next segment, or null if this is the last.
    pub overflow: ObjectPtr,
    /// Bytes of this segment on this page.
    pub seg_len: u16,
}

impl ObjectHeader {
    /// Encode into exactly [`OBJECT_HEADER_SIZE`] bytes.
    pub fn encode(&self, buf: &mut [u8]) {
        debug_assert!(buf.len() >= OBJECT_HEADER_SIZE);
        BigEndian::write_u64(&mut buf[0..8], self.oid.as_u64());
        BigEndian::write_u32(&mut buf[8..12], self.total_len);
        BigEndian::write_u64(&mut buf[12..20], self.overflow.as_u64());
        BigEndian::write_u16(&mut buf[20..22], self.seg_len);
    }

    /// Decode from [`OBJECT_HEADER_SIZE`] bytes read at `at`.
    ///
    /// `at` is only used for error context.
    pub fn decode(buf: &[u8], at: ObjectPtr) -> Result<Self> {
        debug_assert!(buf.len() >= OBJECT_HEADER_SIZE);
        let raw_oid = BigEndian::read_u64(&buf[0..8]);
        let total_len = BigEndian::read_u32(&buf[8..12]);
        let raw_overflow = BigEndian::read_u64(&buf[12..20]);
        let seg_len = BigEndian::read_u16(&buf[20..22]);

        if raw_oid == 0 || raw_oid > i64::MAX as u64 {
            return Err(Error::corrupt(format!(
                "invalid header oid {raw_oid:#x} at {at}"
            )));
        }
        if total_len > i32::MAX as u32 {
            return Err(Error::corrupt(format!(
                "negative object length at {at}"
            )));
        }
        if raw_overflow > i64::MAX as u64 {
            return Err(Error::corrupt(format!(
                "negative overflow pointer at {at}"
            )));
        }
        Ok(ObjectHeader {
            oid: Oid::new(raw_oid),
            total_len,
            overflow: ObjectPtr::from_raw(raw_overflow),
            seg_len,
        })
    }

    /// Encoded record size of this segment (header + payload).
    pub fn record_size(&self) -> usize {
        OBJECT_HEADER_SIZE + self.seg_len as usize
    }
}

/// Byte offset of the overflow-pointer field within an encoded header.
/// Used to relink a chain without rewriting the whole header.
pub const OVERFLOW_FIELD_OFFSET: usize = 12;

/// Encode an overflow pointer for an in-place field patch.
pub fn encode_overflow(ptr: ObjectPtr) -> [u8; 8] {
    let mut buf = [0u8; 8];
    BigEndian::write_u64(&mut buf, ptr.as_u64());
    buf
}

/// Decode a page's free-length prefix, validating its range.
pub fn decode_free_length(buf: &[u8; FREE_LEN_SIZE], page: u64, page_size: usize) -> Result<usize> {
    let free = BigEndian::read_u16(buf) as usize;
    if free > usable_size(page_size) {
        return Err(Error::corrupt(format!(
            "free length {free} out of range on page {page}"
        )));
    }
    Ok(free)
}

/// Encode a page's free-length prefix.
pub fn encode_free_length(free: usize) -> [u8; FREE_LEN_SIZE] {
    debug_assert!(free <= u16::MAX as usize);
    let mut buf = [0u8; FREE_LEN_SIZE];
    BigEndian::write_u16(&mut buf, free as u16);
    buf
}

/// Build the image of a freshly allocated data page: maximal free
/// length, rest 0xFF.
pub fn fresh_page_image(page_size: usize) -> Vec<u8> {
    let mut image = vec![FREE_FILL; page_size];
    image[..FREE_LEN_SIZE].copy_from_slice(&encode_free_length(usable_size(page_size)));
    image
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_round_trip() {
        let header = ObjectHeader {
            oid: Oid::new(0x0123_4567_89ab),
            total_len: 70_000,
            overflow: ObjectPtr::from_raw(0x1000),
            seg_len: 512,
        };
        let mut buf = [0u8; OBJECT_HEADER_SIZE];
        header.encode(&mut buf);
        let decoded = ObjectHeader::decode(&buf, ObjectPtr::from_raw(0x40)).unwrap();
        assert_eq!(decoded, header);
    }

    #[test]
    fn header_layout_is_big_endian_and_bit_exact() {
        let header = ObjectHeader {
            oid: Oid::new(0x0102_0304_0506_0708),
            total_len: 0x0A0B_0C0D,
            overflow: ObjectPtr::from_raw(0x1112_1314_1516_1718),
            seg_len: 0x2122,
        };
        let mut buf = [0u8; OBJECT_HEADER_SIZE];
        header.encode(&mut buf);
        assert_eq!(
            buf,
            [
                0x01, 0x02, 0x03, 0x04, 0x05, 0x06, 0x07, 0x08, // oid
                0x0A, 0x0B, 0x0C, 0x0D, // total length
                0x11, 0x12, 0x13, 0x14, 0x15, 0x16, 0x17, 0x18, // overflow
                0x21, 0x22, // segment length
            ]
        );
        assert_eq!(&buf[OVERFLOW_FIELD_OFFSET..OVERFLOW_FIELD_OFFSET + 8], &buf[12..20]);
    }

    #[test]
    fn decode_rejects_null_oid() {
        let header = ObjectHeader {
            oid: Oid::new(1),
            total_len: 0,
            overflow: ObjectPtr::NULL,
            seg_len: 0,
        };
        let mut buf = [0u8; OBJECT_HEADER_SIZE];
        header.encode(&mut buf);
        buf[0..8].copy_from_slice(&[0; 8]);
        let err = ObjectHeader::decode(&buf, ObjectPtr::from_raw(0)).unwrap_err();
        assert!(matches!(err, Error::Corrupt { .. }));
    }

    #[test]
    fn decode_rejects_negative_fields() {
        let mut buf = [0u8; OBJECT_HEADER_SIZE];
        ObjectHeader {
            oid: Oid::new(1),
            total_len: 1,
            overflow: ObjectPtr::NULL,
            seg_len: 1,
        }
        .encode(&mut buf);

        // Sign bit on the oid
        let mut bad = buf;
        bad[0] = 0x80;
        assert!(ObjectHeader::decode(&bad, ObjectPtr::NULL).is_err());

        // Sign bit on the total length
        let mut bad = buf;
        bad[8] = 0x80;
        assert!(ObjectHeader::decode(&bad, ObjectPtr::NULL).is_err());

        // Sign bit on the overflow pointer
        let mut bad = buf;
        bad[12] = 0x80;
        assert!(ObjectHeader::decode(&bad, ObjectPtr::NULL).is_err());
    }

    #[test]
    fn free_length_range_check() {
        let page_size = 256;
        let ok = encode_free_length(usable_size(page_size));
        assert_eq!(
            decode_free_length(&ok, 3, page_size).unwrap(),
            usable_size(page_size)
        );
        let bad = encode_free_length(usable_size(page_size) + 1);
        assert!(decode_free_length(&bad, 3, page_size).is_err());
    }

    #[test]
    fn fresh_page_is_all_free() {
        let image = fresh_page_image(128);
        assert_eq!(image.len(), 128);
        assert_eq!(
            decode_free_length(&[image[0], image[1]], 0, 128).unwrap(),
            126
        );
        assert!(image[FREE_LEN_SIZE..].iter().all(|&b| b == FREE_FILL));
    }
}
