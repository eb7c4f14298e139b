//! Redo log implementations.
//!
//! `MemoryRedoLog` keeps records in a vector (positions are indexes);
//! `FileRedoLog` appends CRC-framed records to segment files named
//! `redo-NNNNNN.seg`, rotating to a new segment when the current one
//! exceeds the configured size.
//!
//! # Segment layout
//!
//! ```text
//! ┌────────────────────────────────────┐
//! │ Segment Header (32 bytes)          │
//! ├────────────────────────────────────┤
//! │ Record 1                           │
//! ├────────────────────────────────────┤
//! │ ...                                │
//! └────────────────────────────────────┘
//! ```
//!
//! A log position encodes (segment number, byte offset in segment):
//! the segment lives in the high 24 bits, the offset in the low 40.

use crate::record::{self, MAX_RECORD_LEN};
use byteorder::{BigEndian, ByteOrder};
use orion_core::{AppendOutcome, Error, LogPosition, RedoLog, RedoRecord, Result, TxnId};
use parking_lot::Mutex;
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, warn};
use uuid::Uuid;

/// Magic bytes identifying a redo-log segment file: "ORLG"
pub const SEGMENT_MAGIC: [u8; 4] = *b"ORLG";

/// Current segment format version
pub const SEGMENT_FORMAT_VERSION: u32 = 1;

/// Size of the segment header in bytes
pub const SEGMENT_HEADER_SIZE: u64 = 32;

const OFFSET_BITS: u64 = 40;
const OFFSET_MASK: u64 = (1 << OFFSET_BITS) - 1;

fn make_position(segment: u64, offset: u64) -> LogPosition {
    debug_assert!(offset <= OFFSET_MASK);
    LogPosition::from_raw((segment << OFFSET_BITS) | offset)
}

fn split_position(position: LogPosition) -> (u64, u64) {
    let raw = position.as_u64();
    (raw >> OFFSET_BITS, raw & OFFSET_MASK)
}

// ---------------------------------------------------------------------------
// MemoryRedoLog
// ---------------------------------------------------------------------------

struct MemLogInner {
    records: Vec<RedoRecord>,
    next_txn: u64,
}

/// In-memory redo log. Positions are record indexes; nothing is
/// durable.
pub struct MemoryRedoLog {
    inner: Mutex<MemLogInner>,
}

impl MemoryRedoLog {
    /// Create an empty log.
    pub fn new() -> Self {
        MemoryRedoLog {
            inner: Mutex::new(MemLogInner {
                records: Vec::new(),
                next_txn: 1,
            }),
        }
    }

    /// Number of records appended so far.
    pub fn len(&self) -> usize {
        self.inner.lock().records.len()
    }

    /// Whether the log is empty.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for MemoryRedoLog {
    fn default() -> Self {
        Self::new()
    }
}

impl RedoLog for MemoryRedoLog {
    fn append(&self, record: &RedoRecord) -> Result<AppendOutcome> {
        let mut inner = self.inner.lock();
        let (stored, assigned_txn) = assign_begin_txn(record, &mut inner.next_txn);
        let position = LogPosition::from_raw(inner.records.len() as u64);
        inner.records.push(stored);
        Ok(AppendOutcome {
            position,
            assigned_txn,
        })
    }

    fn read(&self, position: LogPosition) -> Result<RedoRecord> {
        let inner = self.inner.lock();
        inner
            .records
            .get(position.as_u64() as usize)
            .cloned()
            .ok_or(Error::LogPositionNotFound(position))
    }

    fn scan(&self, from: LogPosition) -> Result<Vec<(LogPosition, RedoRecord)>> {
        let inner = self.inner.lock();
        Ok(inner
            .records
            .iter()
            .enumerate()
            .skip(from.as_u64() as usize)
            .map(|(i, r)| (LogPosition::from_raw(i as u64), r.clone()))
            .collect())
    }

    fn sync(&self) -> Result<()> {
        Ok(())
    }
}

/// Resolve the transaction id for an append: BEGIN records with the
/// unassigned placeholder get a fresh id from the log's counter;
/// anything else passes through (bumping the counter past explicit
/// BEGIN ids so they are never reissued).
fn assign_begin_txn(record: &RedoRecord, next_txn: &mut u64) -> (RedoRecord, Option<TxnId>) {
    match record {
        RedoRecord::Begin { txn } if *txn == TxnId::UNASSIGNED => {
            let assigned = TxnId::new(*next_txn);
            *next_txn += 1;
            (RedoRecord::Begin { txn: assigned }, Some(assigned))
        }
        RedoRecord::Begin { txn } => {
            *next_txn = (*next_txn).max(txn.as_u64() + 1);
            (record.clone(), Some(*txn))
        }
        other => (other.clone(), None),
    }
}

// ---------------------------------------------------------------------------
// FileRedoLog
// ---------------------------------------------------------------------------

struct FileLogInner {
    file: File,
    segment: u64,
    write_offset: u64,
    next_txn: u64,
    has_unsynced: bool,
}

/// Segmented file-backed redo log.
pub struct FileRedoLog {
    dir: PathBuf,
    uuid: Uuid,
    max_segment_size: u64,
    inner: Mutex<FileLogInner>,
}

impl FileRedoLog {
    /// Open (or create) the log in `dir`, rotating segments at
    /// `max_segment_size` bytes.
    pub fn open(dir: impl AsRef<Path>, max_segment_size: u64) -> Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        std::fs::create_dir_all(&dir)?;
        let max_segment_size = max_segment_size.clamp(SEGMENT_HEADER_SIZE + 64, OFFSET_MASK);

        let segments = list_segments(&dir)?;
        if segments.is_empty() {
            let uuid = Uuid::new_v4();
            let file = create_segment(&dir, 1, uuid)?;
            debug!(target: "orion::log", dir = %dir.display(), "redo log created");
            return Ok(FileRedoLog {
                dir,
                uuid,
                max_segment_size,
                inner: Mutex::new(FileLogInner {
                    file,
                    segment: 1,
                    write_offset: SEGMENT_HEADER_SIZE,
                    next_txn: 1,
                    has_unsynced: false,
                }),
            });
        }

        // Existing log: validate headers, find the max transaction id
        // across every segment, and the end of the last valid record
        // in the final segment.
        let mut uuid = None;
        let mut max_txn = 0u64;
        let mut last_end = SEGMENT_HEADER_SIZE;
        for (i, &segment) in segments.iter().enumerate() {
            let is_last = i == segments.len() - 1;
            let path = segment_path(&dir, segment);
            let mut file = OpenOptions::new().read(true).open(&path)?;
            let header_uuid = read_segment_header(&mut file, segment)?;
            match uuid {
                None => uuid = Some(header_uuid),
                Some(u) if u != header_uuid => {
                    return Err(Error::corrupt(format!(
                        "segment {segment} belongs to a different log"
                    )));
                }
                Some(_) => {}
            }
            let (entries, end) = scan_segment(&mut file, segment, is_last)?;
            for (_, record) in &entries {
                if let Some(txn) = record.txn() {
                    max_txn = max_txn.max(txn.as_u64());
                }
            }
            if is_last {
                last_end = end;
            }
        }

        let last_segment = *segments.last().expect("non-empty");
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(segment_path(&dir, last_segment))?;
        // Drop any torn tail so new appends start on a record boundary
        file.set_len(last_end)?;
        Ok(FileRedoLog {
            dir,
            uuid: uuid.expect("at least one segment"),
            max_segment_size,
            inner: Mutex::new(FileLogInner {
                file,
                segment: last_segment,
                write_offset: last_end,
                next_txn: max_txn + 1,
                has_unsynced: false,
            }),
        })
    }

    /// Identity stamped into every segment header.
    pub fn uuid(&self) -> Uuid {
        self.uuid
    }
}

impl RedoLog for FileRedoLog {
    fn append(&self, record: &RedoRecord) -> Result<AppendOutcome> {
        let mut inner = self.inner.lock();
        let (stored, assigned_txn) = assign_begin_txn(record, &mut inner.next_txn);
        let framed = record::frame(&record::encode_payload(&stored));

        // Rotate when this record would push the segment past its
        // budget (never rotate an empty segment: oversized single
        // records are allowed to overshoot).
        if inner.write_offset > SEGMENT_HEADER_SIZE
            && inner.write_offset + framed.len() as u64 > self.max_segment_size
        {
            let next = inner.segment + 1;
            inner.file.sync_data()?;
            inner.file = create_segment(&self.dir, next, self.uuid)?;
            inner.segment = next;
            inner.write_offset = SEGMENT_HEADER_SIZE;
            debug!(target: "orion::log", segment = next, "redo log rotated");
        }

        let position = make_position(inner.segment, inner.write_offset);
        let write_offset = inner.write_offset;
        inner.file.seek(SeekFrom::Start(write_offset))?;
        inner.file.write_all(&framed)?;
        inner.write_offset += framed.len() as u64;

        if stored.requires_flush() {
            inner.file.sync_data()?;
            inner.has_unsynced = false;
        } else {
            inner.has_unsynced = true;
        }
        Ok(AppendOutcome {
            position,
            assigned_txn,
        })
    }

    fn read(&self, position: LogPosition) -> Result<RedoRecord> {
        let (segment, offset) = split_position(position);
        let mut inner = self.inner.lock();
        if segment == inner.segment {
            if offset >= inner.write_offset {
                return Err(Error::LogPositionNotFound(position));
            }
            read_record_at(&mut inner.file, offset).ok_or(Error::LogPositionNotFound(position))?
        } else {
            let path = segment_path(&self.dir, segment);
            let mut file = OpenOptions::new()
                .read(true)
                .open(&path)
                .map_err(|_| Error::LogPositionNotFound(position))?;
            read_record_at(&mut file, offset).ok_or(Error::LogPositionNotFound(position))?
        }
    }

    fn scan(&self, from: LogPosition) -> Result<Vec<(LogPosition, RedoRecord)>> {
        let (from_segment, from_offset) = split_position(from);
        let inner = self.inner.lock();
        let current = inner.segment;
        drop(inner);

        let mut out = Vec::new();
        for segment in list_segments(&self.dir)? {
            if segment < from_segment {
                continue;
            }
            let is_last = segment == current;
            let path = segment_path(&self.dir, segment);
            let mut file = OpenOptions::new().read(true).open(&path)?;
            read_segment_header(&mut file, segment)?;
            let (entries, _) = scan_segment(&mut file, segment, is_last)?;
            for (position, record) in entries {
                if segment == from_segment && position.as_u64() & OFFSET_MASK < from_offset {
                    continue;
                }
                out.push((position, record));
            }
        }
        Ok(out)
    }

    fn sync(&self) -> Result<()> {
        let mut inner = self.inner.lock();
        if inner.has_unsynced {
            inner.file.sync_data()?;
            inner.has_unsynced = false;
        }
        Ok(())
    }
}

fn segment_path(dir: &Path, segment: u64) -> PathBuf {
    dir.join(format!("redo-{segment:06}.seg"))
}

fn list_segments(dir: &Path) -> Result<Vec<u64>> {
    let mut segments = Vec::new();
    for entry in std::fs::read_dir(dir)? {
        let name = entry?.file_name();
        let name = name.to_string_lossy();
        if let Some(number) = name
            .strip_prefix("redo-")
            .and_then(|rest| rest.strip_suffix(".seg"))
            .and_then(|digits| digits.parse::<u64>().ok())
        {
            segments.push(number);
        }
    }
    segments.sort_unstable();
    Ok(segments)
}

fn create_segment(dir: &Path, segment: u64, uuid: Uuid) -> Result<File> {
    let mut file = OpenOptions::new()
        .create_new(true)
        .read(true)
        .write(true)
        .open(segment_path(dir, segment))?;
    let mut header = [0u8; SEGMENT_HEADER_SIZE as usize];
    header[0..4].copy_from_slice(&SEGMENT_MAGIC);
    BigEndian::write_u32(&mut header[4..8], SEGMENT_FORMAT_VERSION);
    BigEndian::write_u64(&mut header[8..16], segment);
    header[16..32].copy_from_slice(uuid.as_bytes());
    file.write_all(&header)?;
    file.sync_data()?;
    Ok(file)
}

fn read_segment_header(file: &mut File, segment: u64) -> Result<Uuid> {
    let mut header = [0u8; SEGMENT_HEADER_SIZE as usize];
    file.seek(SeekFrom::Start(0))?;
    file.read_exact(&mut header)?;
    if header[0..4] != SEGMENT_MAGIC {
        return Err(Error::corrupt(format!("bad magic in segment {segment}")));
    }
    let version = BigEndian::read_u32(&header[4..8]);
    if version != SEGMENT_FORMAT_VERSION {
        return Err(Error::corrupt(format!(
            "unsupported segment format version {version}"
        )));
    }
    let stored = BigEndian::read_u64(&header[8..16]);
    if stored != segment {
        return Err(Error::corrupt(format!(
            "segment file {segment} says it is segment {stored}"
        )));
    }
    Ok(Uuid::from_bytes(header[16..32].try_into().expect("16 uuid bytes")))
}

/// Read the framed record starting at `offset`. Returns `None` when
/// the bytes there do not form a complete valid record.
fn read_record_at(file: &mut File, offset: u64) -> Option<Result<RedoRecord>> {
    file.seek(SeekFrom::Start(offset)).ok()?;
    let mut len_buf = [0u8; 4];
    file.read_exact(&mut len_buf).ok()?;
    let len = BigEndian::read_u32(&len_buf);
    if len < 5 || len > MAX_RECORD_LEN {
        return None;
    }
    let mut body = vec![0u8; len as usize];
    file.read_exact(&mut body).ok()?;
    Some(record::unframe(&body))
}

/// Scan a segment from its header to the last complete record.
/// Returns the records with their positions and the offset one past
/// the final valid record. A torn or invalid record ends the scan: in
/// the last (active) segment that is the expected crash artifact; in
/// an earlier segment it is corruption.
fn scan_segment(
    file: &mut File,
    segment: u64,
    is_last: bool,
) -> Result<(Vec<(LogPosition, RedoRecord)>, u64)> {
    let mut entries = Vec::new();
    let mut offset = SEGMENT_HEADER_SIZE;
    loop {
        match read_record_at(file, offset) {
            None => break,
            Some(Err(err)) => {
                if is_last {
                    warn!(target: "orion::log", segment, offset, "torn redo record ends scan: {err}");
                    break;
                }
                return Err(err);
            }
            Some(Ok(record)) => {
                let mut len_buf = [0u8; 4];
                file.seek(SeekFrom::Start(offset))?;
                file.read_exact(&mut len_buf)?;
                let frame_len = 4 + BigEndian::read_u32(&len_buf) as u64;
                entries.push((make_position(segment, offset), record));
                offset += frame_len;
            }
        }
    }
    Ok((entries, offset))
}
