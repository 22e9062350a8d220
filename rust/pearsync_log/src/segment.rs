//! Segment file I/O for block persistence.
//!
//! Each writer log is a directory of segment files. File format:
//!   [MAGIC:4][VERSION:u32]  (header, 8 bytes)
//!   [StoredBlock]*          (variable-length records)
//!
//! Record format:
//!   [seq:u64][payload_len:u32][payload:bytes][signature:64][crc32:u32]
//!
//! CRC32 covers: seq + payload + signature bytes. The CRC guards against
//! torn local writes; cryptographic verification happens before a block is
//! ever handed to this layer. Segment naming: `log-{first_seq}-{epoch}.seg`.

use std::fs::{File, OpenOptions};
use std::io::{self, BufReader, BufWriter, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use crc32fast::Hasher;
use pearsync_core::keys::{Signature, SIGNATURE_LEN};
use thiserror::Error;

use crate::block::Block;

/// Magic bytes identifying a pearsync log segment.
pub const MAGIC: [u8; 4] = *b"PSLG";

/// Current segment format version.
pub const VERSION: u32 = 1;

/// Header size in bytes (magic + version).
pub const HEADER_SIZE: u64 = 8;

#[derive(Debug, Error)]
pub enum SegmentError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
    #[error("invalid magic bytes")]
    BadMagic,
    #[error("unsupported version: {0}")]
    BadVersion(u32),
    #[error("CRC mismatch at seq {seq}: expected {expected:#010x}, got {actual:#010x}")]
    CrcMismatch {
        seq: u64,
        expected: u32,
        actual: u32,
    },
    #[error("truncated record at offset {0}")]
    TruncatedRecord(u64),
}

/// Byte size of a block's on-disk record.
pub fn record_size(payload_len: usize) -> u64 {
    // seq(8) + payload_len(4) + payload + signature(64) + crc(4)
    8 + 4 + payload_len as u64 + SIGNATURE_LEN as u64 + 4
}

// ---------------------------------------------------------------------------
// Writer
// ---------------------------------------------------------------------------

pub struct SegmentWriter {
    writer: BufWriter<File>,
    path: PathBuf,
    bytes_written: u64,
}

impl SegmentWriter {
    /// Create a new segment file with header.
    pub fn new(dir: &Path, first_seq: u64, epoch_secs: u64) -> Result<Self, SegmentError> {
        let path = dir.join(format!("log-{first_seq}-{epoch_secs}.seg"));
        let file = OpenOptions::new()
            .create_new(true)
            .write(true)
            .open(&path)?;
        let mut writer = BufWriter::new(file);

        let mut header = [0u8; HEADER_SIZE as usize];
        header[..4].copy_from_slice(&MAGIC);
        header[4..].copy_from_slice(&VERSION.to_le_bytes());
        writer.write_all(&header)?;
        writer.flush()?;

        Ok(Self {
            writer,
            path,
            bytes_written: HEADER_SIZE,
        })
    }

    /// Re-open an existing segment for appending.
    pub fn open_append(path: &Path) -> Result<Self, SegmentError> {
        validate_header(path)?;

        let file = OpenOptions::new().append(true).open(path)?;
        let bytes_written = file.metadata()?.len();
        let writer = BufWriter::new(file);

        Ok(Self {
            writer,
            path: path.to_path_buf(),
            bytes_written,
        })
    }

    /// Append a verified block. Does NOT fsync.
    pub fn append(&mut self, block: &Block) -> Result<(), SegmentError> {
        let crc = compute_crc(block.seq, &block.payload, block.signature.as_bytes());

        let mut record = Vec::with_capacity(record_size(block.payload.len()) as usize);
        record.extend_from_slice(&block.seq.to_le_bytes());
        record.extend_from_slice(&(block.payload.len() as u32).to_le_bytes());
        record.extend_from_slice(&block.payload);
        record.extend_from_slice(block.signature.as_bytes());
        record.extend_from_slice(&crc.to_le_bytes());
        self.writer.write_all(&record)?;

        self.bytes_written += record.len() as u64;
        Ok(())
    }

    /// Flush internal buffers and fsync to disk.
    pub fn sync(&mut self) -> Result<(), SegmentError> {
        self.writer.flush()?;
        self.writer.get_ref().sync_all()?;
        Ok(())
    }

    pub fn bytes_written(&self) -> u64 {
        self.bytes_written
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

// ---------------------------------------------------------------------------
// Reader
// ---------------------------------------------------------------------------

#[derive(Debug)]
pub struct SegmentReader {
    path: PathBuf,
}

impl SegmentReader {
    /// Open and validate a segment file header.
    pub fn open(path: &Path) -> Result<Self, SegmentError> {
        validate_header(path)?;
        Ok(Self {
            path: path.to_path_buf(),
        })
    }

    /// Iterate all blocks in the segment, validating CRC for each.
    pub fn iter(&self) -> Result<SegmentIter, SegmentError> {
        let file = File::open(&self.path)?;
        let file_len = file.metadata()?.len();
        let mut reader = BufReader::new(file);
        reader.seek(SeekFrom::Start(HEADER_SIZE))?;
        Ok(SegmentIter {
            reader,
            offset: HEADER_SIZE,
            file_len,
        })
    }

    /// Read the block with the given seq, if this segment holds it.
    pub fn find(&self, seq: u64) -> Result<Option<Block>, SegmentError> {
        for block in self.iter()? {
            let block = block?;
            if block.seq == seq {
                return Ok(Some(block));
            }
            if block.seq > seq {
                break;
            }
        }
        Ok(None)
    }
}

fn validate_header(path: &Path) -> Result<(), SegmentError> {
    let mut f = File::open(path)?;
    let mut magic = [0u8; 4];
    f.read_exact(&mut magic)?;
    if magic != MAGIC {
        return Err(SegmentError::BadMagic);
    }
    let mut ver_buf = [0u8; 4];
    f.read_exact(&mut ver_buf)?;
    let ver = u32::from_le_bytes(ver_buf);
    if ver != VERSION {
        return Err(SegmentError::BadVersion(ver));
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Iterator
// ---------------------------------------------------------------------------

pub struct SegmentIter {
    reader: BufReader<File>,
    offset: u64,
    file_len: u64,
}

impl SegmentIter {
    fn read_exact_or_torn(&mut self, buf: &mut [u8], start: u64) -> Result<(), SegmentError> {
        match self.reader.read_exact(buf) {
            Ok(()) => {
                self.offset += buf.len() as u64;
                Ok(())
            }
            Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => {
                Err(SegmentError::TruncatedRecord(start))
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Read one record; torn reads surface as `TruncatedRecord` at the
    /// record's start offset so recovery can cut there.
    fn read_record(&mut self) -> Result<Block, SegmentError> {
        let record_start = self.offset;

        // Fixed prefix: seq + payload_len.
        let mut prefix = [0u8; 12];
        self.read_exact_or_torn(&mut prefix, record_start)?;
        let seq = u64::from_le_bytes(prefix[..8].try_into().unwrap());
        let payload_len = u32::from_le_bytes(prefix[8..].try_into().unwrap()) as usize;

        // Variable tail: payload + signature + crc, in one read.
        let mut tail = vec![0u8; payload_len + SIGNATURE_LEN + 4];
        self.read_exact_or_torn(&mut tail, record_start)?;

        let payload = tail[..payload_len].to_vec();
        let mut sig = [0u8; SIGNATURE_LEN];
        sig.copy_from_slice(&tail[payload_len..payload_len + SIGNATURE_LEN]);
        let crc_on_disk =
            u32::from_le_bytes(tail[payload_len + SIGNATURE_LEN..].try_into().unwrap());

        let crc_computed = compute_crc(seq, &payload, &sig);
        if crc_on_disk != crc_computed {
            return Err(SegmentError::CrcMismatch {
                seq,
                expected: crc_computed,
                actual: crc_on_disk,
            });
        }

        Ok(Block {
            seq,
            payload,
            signature: Signature(sig),
        })
    }
}

impl Iterator for SegmentIter {
    type Item = Result<Block, SegmentError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.offset >= self.file_len {
            return None;
        }
        Some(self.read_record())
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

/// Compute CRC32 over seq + payload + signature.
fn compute_crc(seq: u64, payload: &[u8], signature: &[u8]) -> u32 {
    let mut h = Hasher::new();
    h.update(&seq.to_le_bytes());
    h.update(payload);
    h.update(signature);
    h.finalize()
}

/// Parse segment filename into (first_seq, epoch_secs).
/// Expected format: `log-{seq}-{epoch}.seg`
pub fn parse_segment_name(filename: &str) -> Option<(u64, u64)> {
    let stem = filename.strip_suffix(".seg")?;
    let parts: Vec<&str> = stem.splitn(3, '-').collect();
    if parts.len() != 3 || parts[0] != "log" {
        return None;
    }
    let seq = parts[1].parse().ok()?;
    let epoch = parts[2].parse().ok()?;
    Some((seq, epoch))
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use pearsync_core::keys::Keypair;
    use tempfile::TempDir;

    use crate::block::GENESIS_HASH;

    fn make_block(kp: &Keypair, seq: u64, payload: &[u8]) -> Block {
        Block::sign(kp, &GENESIS_HASH, seq, payload.to_vec())
    }

    #[test]
    fn write_read_single_block() {
        let dir = TempDir::new().unwrap();
        let kp = Keypair::generate();
        let block = make_block(&kp, 0, b"hello world");

        let mut writer = SegmentWriter::new(dir.path(), 0, 1000).unwrap();
        writer.append(&block).unwrap();
        writer.sync().unwrap();

        let reader = SegmentReader::open(writer.path()).unwrap();
        let blocks: Vec<Block> = reader.iter().unwrap().map(|b| b.unwrap()).collect();
        assert_eq!(blocks, vec![block]);
    }

    #[test]
    fn write_multiple_and_find() {
        let dir = TempDir::new().unwrap();
        let kp = Keypair::generate();
        let mut writer = SegmentWriter::new(dir.path(), 0, 2000).unwrap();
        for i in 0..10 {
            writer
                .append(&make_block(&kp, i, format!("payload-{i}").as_bytes()))
                .unwrap();
        }
        writer.sync().unwrap();

        let reader = SegmentReader::open(writer.path()).unwrap();
        let found = reader.find(7).unwrap().unwrap();
        assert_eq!(found.payload, b"payload-7");
        assert!(reader.find(99).unwrap().is_none());
    }

    #[test]
    fn corrupt_record_detected() {
        let dir = TempDir::new().unwrap();
        let kp = Keypair::generate();
        let mut writer = SegmentWriter::new(dir.path(), 0, 3000).unwrap();
        writer.append(&make_block(&kp, 0, b"data")).unwrap();
        writer.sync().unwrap();
        let path = writer.path().to_path_buf();
        drop(writer);

        // Flip a payload byte on disk.
        let mut bytes = std::fs::read(&path).unwrap();
        let idx = HEADER_SIZE as usize + 8 + 4; // first payload byte
        bytes[idx] ^= 0xff;
        std::fs::write(&path, &bytes).unwrap();

        let reader = SegmentReader::open(&path).unwrap();
        let err = reader.iter().unwrap().next().unwrap().unwrap_err();
        assert!(matches!(err, SegmentError::CrcMismatch { seq: 0, .. }));
    }

    #[test]
    fn torn_tail_detected() {
        let dir = TempDir::new().unwrap();
        let kp = Keypair::generate();
        let mut writer = SegmentWriter::new(dir.path(), 0, 4000).unwrap();
        writer.append(&make_block(&kp, 0, b"whole")).unwrap();
        writer.append(&make_block(&kp, 1, b"torn")).unwrap();
        writer.sync().unwrap();
        let path = writer.path().to_path_buf();
        drop(writer);

        // Chop the last 10 bytes, simulating a torn write.
        let bytes = std::fs::read(&path).unwrap();
        std::fs::write(&path, &bytes[..bytes.len() - 10]).unwrap();

        let reader = SegmentReader::open(&path).unwrap();
        let mut iter = reader.iter().unwrap();
        assert_eq!(iter.next().unwrap().unwrap().payload, b"whole");
        assert!(matches!(
            iter.next().unwrap().unwrap_err(),
            SegmentError::TruncatedRecord(_)
        ));
    }

    #[test]
    fn bad_magic_rejected() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("bad.seg");
        std::fs::write(&path, b"BAAD\x01\x00\x00\x00").unwrap();
        assert!(matches!(
            SegmentReader::open(&path).unwrap_err(),
            SegmentError::BadMagic
        ));
    }

    #[test]
    fn bad_version_rejected() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("badver.seg");
        let mut data = Vec::new();
        data.extend_from_slice(&MAGIC);
        data.extend_from_slice(&9u32.to_le_bytes());
        std::fs::write(&path, &data).unwrap();
        assert!(matches!(
            SegmentReader::open(&path).unwrap_err(),
            SegmentError::BadVersion(9)
        ));
    }

    #[test]
    fn parse_segment_names() {
        assert_eq!(parse_segment_name("log-0-1000.seg"), Some((0, 1000)));
        assert_eq!(
            parse_segment_name("log-42-1700000000.seg"),
            Some((42, 1700000000))
        );
        assert_eq!(parse_segment_name("wal-1-2.seg"), None);
        assert_eq!(parse_segment_name("log-x-2.seg"), None);
        assert_eq!(parse_segment_name("log-1.seg"), None);
    }
}
