//! Redo record codec.
//!
//! # Record framing
//!
//! ```text
//! ┌──────────────────┬────────────────┬────────────────────┬───────────┐
//! │ Length (4 bytes) │ Format Ver (1) │ Payload (variable) │ CRC32 (4) │
//! └──────────────────┴────────────────┴────────────────────┴───────────┘
//! ```
//!
//! Length covers everything after itself (version + payload + CRC).
//! The CRC is computed over the version byte and the payload. All
//! integers are big-endian.
//!
//! # Payload
//!
//! One kind byte, then the kind's fields:
//!
//! ```text
//! 1 BEGIN               txn (8)
//! 2 STORE               txn (8) | oid (8) | cid (8) | image len (4) | image
//! 3 CHECKPOINT          txn (8)
//! 4 COMMIT              txn (8)
//! 5 ROLLBACK            txn (8)
//! 6 START-DB-CHECKPOINT count (4) | count × (txn (8) | position (8))
//! 7 END-DB-CHECKPOINT   (empty)
//! ```

use byteorder::{BigEndian, ByteOrder};
use crc32fast::Hasher;
use orion_core::{Cid, Error, LogPosition, Oid, RedoRecord, Result, TxnId};

/// Current record format version.
pub const RECORD_FORMAT_VERSION: u8 = 1;

/// Bytes of framing around a payload (length + version + CRC).
pub const FRAME_OVERHEAD: usize = 4 + 1 + 4;

/// Upper bound on a sane record length field; anything larger is a
/// torn or corrupt frame, not a real record.
pub const MAX_RECORD_LEN: u32 = 1 << 30;

const KIND_BEGIN: u8 = 1;
const KIND_STORE: u8 = 2;
const KIND_CHECKPOINT: u8 = 3;
const KIND_COMMIT: u8 = 4;
const KIND_ROLLBACK: u8 = 5;
const KIND_START_DB_CHECKPOINT: u8 = 6;
const KIND_END_DB_CHECKPOINT: u8 = 7;

/// Encode a record's payload (kind byte + fields).
pub fn encode_payload(record: &RedoRecord) -> Vec<u8> {
    let mut out = Vec::with_capacity(16);
    match record {
        RedoRecord::Begin { txn } => {
            out.push(KIND_BEGIN);
            push_u64(&mut out, txn.as_u64());
        }
        RedoRecord::Store {
            txn,
            oid,
            cid,
            image,
        } => {
            out.reserve(29 + image.len());
            out.push(KIND_STORE);
            push_u64(&mut out, txn.as_u64());
            push_u64(&mut out, oid.as_u64());
            push_u64(&mut out, cid.as_u64());
            push_u32(&mut out, image.len() as u32);
            out.extend_from_slice(image);
        }
        RedoRecord::Checkpoint { txn } => {
            out.push(KIND_CHECKPOINT);
            push_u64(&mut out, txn.as_u64());
        }
        RedoRecord::Commit { txn } => {
            out.push(KIND_COMMIT);
            push_u64(&mut out, txn.as_u64());
        }
        RedoRecord::Rollback { txn } => {
            out.push(KIND_ROLLBACK);
            push_u64(&mut out, txn.as_u64());
        }
        RedoRecord::StartDbCheckpoint { active } => {
            out.push(KIND_START_DB_CHECKPOINT);
            push_u32(&mut out, active.len() as u32);
            for (txn, position) in active {
                push_u64(&mut out, txn.as_u64());
                push_u64(&mut out, position.as_u64());
            }
        }
        RedoRecord::EndDbCheckpoint => out.push(KIND_END_DB_CHECKPOINT),
    }
    out
}

/// Decode a payload produced by [`encode_payload`].
pub fn decode_payload(payload: &[u8]) -> Result<RedoRecord> {
    let mut r = Reader::new(payload);
    let kind = r.u8()?;
    let record = match kind {
        KIND_BEGIN => RedoRecord::Begin {
            txn: TxnId::new(r.u64()?),
        },
        KIND_STORE => {
            let txn = TxnId::new(r.u64()?);
            let oid = Oid::new(r.u64()?);
            let cid = Cid::new(r.u64()?);
            let len = r.u32()? as usize;
            let image = r.bytes(len)?.to_vec();
            RedoRecord::Store {
                txn,
                oid,
                cid,
                image,
            }
        }
        KIND_CHECKPOINT => RedoRecord::Checkpoint {
            txn: TxnId::new(r.u64()?),
        },
        KIND_COMMIT => RedoRecord::Commit {
            txn: TxnId::new(r.u64()?),
        },
        KIND_ROLLBACK => RedoRecord::Rollback {
            txn: TxnId::new(r.u64()?),
        },
        KIND_START_DB_CHECKPOINT => {
            let count = r.u32()? as usize;
            let mut active = Vec::with_capacity(count);
            for _ in 0..count {
                let txn = TxnId::new(r.u64()?);
                let position = LogPosition::from_raw(r.u64()?);
                active.push((txn, position));
            }
            RedoRecord::StartDbCheckpoint { active }
        }
        KIND_END_DB_CHECKPOINT => RedoRecord::EndDbCheckpoint,
        other => {
            return Err(Error::corrupt(format!("unknown redo record kind {other}")));
        }
    };
    r.finish()?;
    Ok(record)
}

/// Frame a payload: length, version, payload, CRC.
pub fn frame(payload: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(payload.len() + FRAME_OVERHEAD);
    let len = (1 + payload.len() + 4) as u32;
    let mut len_buf = [0u8; 4];
    BigEndian::write_u32(&mut len_buf, len);
    out.extend_from_slice(&len_buf);
    out.push(RECORD_FORMAT_VERSION);
    out.extend_from_slice(payload);

    let mut hasher = Hasher::new();
    hasher.update(&[RECORD_FORMAT_VERSION]);
    hasher.update(payload);
    let mut crc_buf = [0u8; 4];
    BigEndian::write_u32(&mut crc_buf, hasher.finalize());
    out.extend_from_slice(&crc_buf);
    out
}

/// Unframe a record body (`frame` output minus the 4 length bytes),
/// verifying version and CRC, and decode the payload.
pub fn unframe(body: &[u8]) -> Result<RedoRecord> {
    if body.len() < 5 {
        return Err(Error::corrupt("redo record frame too short"));
    }
    let version = body[0];
    if version != RECORD_FORMAT_VERSION {
        return Err(Error::corrupt(format!(
            "unsupported redo record version {version}"
        )));
    }
    let payload = &body[1..body.len() - 4];
    let stored_crc = BigEndian::read_u32(&body[body.len() - 4..]);

    let mut hasher = Hasher::new();
    hasher.update(&[version]);
    hasher.update(payload);
    if hasher.finalize() != stored_crc {
        return Err(Error::corrupt("redo record CRC mismatch"));
    }
    decode_payload(payload)
}

fn push_u32(out: &mut Vec<u8>, value: u32) {
    let mut buf = [0u8; 4];
    BigEndian::write_u32(&mut buf, value);
    out.extend_from_slice(&buf);
}

fn push_u64(out: &mut Vec<u8>, value: u64) {
    let mut buf = [0u8; 8];
    BigEndian::write_u64(&mut buf, value);
    out.extend_from_slice(&buf);
}

struct Reader<'a> {
    data: &'a [u8],
    at: usize,
}

impl<'a> Reader<'a> {
    fn new(data: &'a [u8]) -> Self {
        Reader { data, at: 0 }
    }

    fn bytes(&mut self, len: usize) -> Result<&'a [u8]> {
        if self.at + len > self.data.len() {
            return Err(Error::corrupt("redo record payload truncated"));
        }
        let slice = &self.data[self.at..self.at + len];
        self.at += len;
        Ok(slice)
    }

    fn u8(&mut self) -> Result<u8> {
        Ok(self.bytes(1)?[0])
    }

    fn u32(&mut self) -> Result<u32> {
        Ok(BigEndian::read_u32(self.bytes(4)?))
    }

    fn u64(&mut self) -> Result<u64> {
        Ok(BigEndian::read_u64(self.bytes(8)?))
    }

    fn finish(&self) -> Result<()> {
        if self.at != self.data.len() {
            return Err(Error::corrupt("trailing bytes in redo record payload"));
        }
        Ok(())
    }
}
