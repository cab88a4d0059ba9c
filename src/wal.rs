// Write-ahead log - durability and recovery
// Fixed-field little-endian records, one mutex over the file handle, an
// atomic sequence counter bumped under that mutex. Appends are fully
// serialized: on-disk order equals sequence order.

use std::fs::{self, File, OpenOptions};
use std::io::{self, BufReader, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::{SystemTime, UNIX_EPOCH};

use bytes::{BufMut, Bytes, BytesMut};
use tracing::{debug, warn};

use crate::{KvError, Result};

// seq (u64) + ts (u64) + op (u8)
const RECORD_HEADER_LEN: usize = 17;
const LEN_FIELD: usize = 8;

// ==================== Record Types ====================

/// Durable operation tag. Read verbs are never logged.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum WalOp {
    Put = 0,
    Delete = 1,
}

impl WalOp {
    fn from_u8(raw: u8) -> Option<WalOp> {
        match raw {
            0 => Some(WalOp::Put),
            1 => Some(WalOp::Delete),
            _ => None,
        }
    }
}

/// Tuning knobs for a log instance. The size ceilings bound what a valid
/// record may claim in its length fields; replay treats anything more than
/// twice the ceiling as corruption rather than a torn tail.
#[derive(Debug, Clone)]
pub struct WalOptions {
    pub sync_writes: bool,
    pub buffer_size: usize,
    pub max_key_size: usize,
    pub max_value_size: usize,
}

impl Default for WalOptions {
    fn default() -> Self {
        Self {
            sync_writes: true,
            buffer_size: 8192,
            max_key_size: 1024,
            max_value_size: 65536,
        }
    }
}

struct WalRecord {
    seq: u64,
    op: WalOp,
    key: Bytes,
    value: Bytes,
}

enum ReadOutcome {
    Record(WalRecord),
    /// Clean end of file on a record boundary.
    Eof,
    /// The final record is shorter than its declared framing.
    TornTail,
}

// ==================== Write-Ahead Log ====================

#[derive(Debug)]
struct WalFile {
    handle: File,
    // Reused append serialization buffer; buffer_size seeds its capacity.
    scratch: BytesMut,
}

/// Append-only binary record log with monotonic sequence numbers.
#[derive(Debug)]
pub struct WriteAheadLog {
    path: PathBuf,
    options: WalOptions,
    file: Mutex<WalFile>,
    next_seq: AtomicU64,
}

impl WriteAheadLog {
    /// Open the log at `path`, creating it if missing, and recover the next
    /// sequence number with a single forward scan of the existing records.
    pub fn open(path: impl Into<PathBuf>, options: WalOptions) -> Result<Self> {
        let path = path.into();
        let handle = open_log_file(&path)?;

        let wal = Self {
            file: Mutex::new(WalFile {
                handle,
                scratch: BytesMut::with_capacity(options.buffer_size),
            }),
            next_seq: AtomicU64::new(0),
            path,
            options,
        };
        wal.recover_sequence()?;
        Ok(wal)
    }

    /// Highest assigned sequence number plus one; 0 for an empty log.
    pub fn next_seq(&self) -> u64 {
        self.next_seq.load(Ordering::Relaxed)
    }

    /// Append one record and, when `sync_writes` is set, force it to stable
    /// storage before returning. On any error the record must be considered
    /// not durable and the caller must not mutate the map.
    pub fn append(&self, op: WalOp, key: &[u8], value: &[u8]) -> Result<()> {
        let mut guard = self.file.lock().unwrap();
        let seq = self.next_seq.fetch_add(1, Ordering::Relaxed);
        let ts = wall_clock_millis();

        let WalFile { handle, scratch } = &mut *guard;
        scratch.clear();
        scratch.reserve(RECORD_HEADER_LEN + 2 * LEN_FIELD + key.len() + value.len());
        scratch.put_u64_le(seq);
        scratch.put_u64_le(ts);
        scratch.put_u8(op as u8);
        scratch.put_u64_le(key.len() as u64);
        scratch.put_slice(key);
        scratch.put_u64_le(value.len() as u64);
        scratch.put_slice(value);

        handle.write_all(scratch)?;
        if self.options.sync_writes {
            handle.sync_data()?;
        }
        Ok(())
    }

    /// Replay every complete record in file order, feeding Puts to
    /// `apply_put` and Deletes to `apply_delete`. Returns the number of
    /// records applied.
    ///
    /// A short read while decoding the final record discards it silently;
    /// everything already applied stands. Length fields beyond twice the
    /// configured ceilings, or an unknown op tag, are reported as fatal
    /// corruption. The sequence counter is advanced past the highest seq
    /// seen so later appends never reuse a number.
    pub fn replay<P, D>(&self, mut apply_put: P, mut apply_delete: D) -> Result<u64>
    where
        P: FnMut(Bytes, Bytes),
        D: FnMut(Bytes),
    {
        let guard = self.file.lock().unwrap();
        let mut handle = &guard.handle;
        handle.seek(SeekFrom::Start(0))?;
        let mut reader = BufReader::new(handle);

        let mut applied = 0u64;
        loop {
            match read_record(&mut reader, &self.options)? {
                ReadOutcome::Record(record) => {
                    self.next_seq
                        .fetch_max(record.seq.saturating_add(1), Ordering::Relaxed);
                    match record.op {
                        WalOp::Put => apply_put(record.key, record.value),
                        WalOp::Delete => apply_delete(record.key),
                    }
                    applied += 1;
                }
                ReadOutcome::Eof => break,
                ReadOutcome::TornTail => {
                    debug!(path = %self.path.display(), "discarding torn record at log tail");
                    break;
                }
            }
        }
        Ok(applied)
    }

    /// Delete the underlying file and start over from sequence 0.
    pub fn clear(&self) -> Result<()> {
        let mut guard = self.file.lock().unwrap();
        fs::remove_file(&self.path)?;
        guard.handle = open_log_file(&self.path)?;
        guard.scratch.clear();
        self.next_seq.store(0, Ordering::Relaxed);
        Ok(())
    }

    /// Current file length in bytes.
    pub fn size(&self) -> Result<u64> {
        let guard = self.file.lock().unwrap();
        Ok(guard.handle.metadata()?.len())
    }

    /// Force buffered data to stable storage. Appends already sync when
    /// `sync_writes` is set; this is the shutdown flush for when it is not.
    pub fn sync(&self) -> Result<()> {
        let guard = self.file.lock().unwrap();
        guard.handle.sync_data()?;
        Ok(())
    }

    // Forward scan for the next sequence number; an empty file yields 0.
    // A torn tail is chopped off here so that records appended later keep
    // the file a pure concatenation of complete records.
    fn recover_sequence(&self) -> Result<()> {
        let guard = self.file.lock().unwrap();
        let mut handle = &guard.handle;
        let file_len = handle.metadata()?.len();
        if file_len == 0 {
            return Ok(());
        }
        handle.seek(SeekFrom::Start(0))?;
        let mut reader = BufReader::new(handle);

        let mut valid_len: u64 = 0;
        let mut torn = false;
        loop {
            match read_record(&mut reader, &self.options)? {
                ReadOutcome::Record(record) => {
                    valid_len += (RECORD_HEADER_LEN + 2 * LEN_FIELD) as u64
                        + record.key.len() as u64
                        + record.value.len() as u64;
                    self.next_seq
                        .fetch_max(record.seq.saturating_add(1), Ordering::Relaxed);
                }
                ReadOutcome::Eof => break,
                ReadOutcome::TornTail => {
                    torn = true;
                    break;
                }
            }
        }

        if torn {
            warn!(
                path = %self.path.display(),
                dropped = file_len - valid_len,
                "truncating torn record at log tail"
            );
            guard.handle.set_len(valid_len)?;
        }
        Ok(())
    }
}

// ==================== Record Decoding ====================

fn open_log_file(path: &Path) -> Result<File> {
    let handle = OpenOptions::new()
        .read(true)
        .append(true)
        .create(true)
        .open(path)?;
    Ok(handle)
}

enum Fill {
    Full,
    Empty,
    Partial,
}

// read_exact, except EOF is reported rather than treated as an error:
// Empty when no bytes were available at all, Partial when the stream ended
// mid-buffer.
fn read_exact_or_eof(reader: &mut impl Read, buf: &mut [u8]) -> io::Result<Fill> {
    let mut filled = 0;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..]) {
            Ok(0) => {
                return Ok(if filled == 0 { Fill::Empty } else { Fill::Partial });
            }
            Ok(n) => filled += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(Fill::Full)
}

fn read_record(reader: &mut impl Read, options: &WalOptions) -> Result<ReadOutcome> {
    let mut header = [0u8; RECORD_HEADER_LEN];
    match read_exact_or_eof(reader, &mut header)? {
        Fill::Full => {}
        Fill::Empty => return Ok(ReadOutcome::Eof),
        Fill::Partial => return Ok(ReadOutcome::TornTail),
    }

    let seq = u64::from_le_bytes(header[0..8].try_into().unwrap());
    // ts is advisory; parsed and discarded.
    let raw_op = header[16];
    let op = match WalOp::from_u8(raw_op) {
        Some(op) => op,
        // Truncation can only shorten the tail, never rewrite bytes, so an
        // unknown tag means the framing broke earlier in the file.
        None => {
            return Err(KvError::Corrupt(format!(
                "unknown op tag {} in record seq {}",
                raw_op, seq
            )));
        }
    };

    let key = match read_sized_field(reader, 2 * options.max_key_size, "key", seq)? {
        Some(field) => field,
        None => return Ok(ReadOutcome::TornTail),
    };
    let value = match read_sized_field(reader, 2 * options.max_value_size, "value", seq)? {
        Some(field) => field,
        None => return Ok(ReadOutcome::TornTail),
    };

    Ok(ReadOutcome::Record(WalRecord { seq, op, key, value }))
}

// One length-prefixed field. None means the record is torn; a length claim
// beyond `ceiling` is corruption.
fn read_sized_field(
    reader: &mut impl Read,
    ceiling: usize,
    what: &str,
    seq: u64,
) -> Result<Option<Bytes>> {
    let mut len_bytes = [0u8; LEN_FIELD];
    match read_exact_or_eof(reader, &mut len_bytes)? {
        Fill::Full => {}
        Fill::Empty | Fill::Partial => return Ok(None),
    }
    let len = u64::from_le_bytes(len_bytes);

    if len > ceiling as u64 {
        return Err(KvError::Corrupt(format!(
            "{} length {} exceeds ceiling {} in record seq {}",
            what, len, ceiling, seq
        )));
    }

    let mut field = vec![0u8; len as usize];
    match read_exact_or_eof(reader, &mut field)? {
        Fill::Full => Ok(Some(Bytes::from(field))),
        Fill::Empty | Fill::Partial => Ok(None),
    }
}

fn wall_clock_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
