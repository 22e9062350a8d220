//! Crash recovery for a writer log's segment directory.
//!
//! Scans segments in first-seq order, validates every record's CRC32 and
//! the per-log seq continuity, folds the chain hash, and truncates the
//! last segment at the first corruption point. Records past a seq gap are
//! discarded: a log is only usable as a contiguous prefix.

use std::fs::{self, OpenOptions};
use std::path::{Path, PathBuf};

use crate::block::GENESIS_HASH;
use crate::segment::{parse_segment_name, SegmentError, SegmentReader, HEADER_SIZE};

/// Result of a recovery pass.
#[derive(Debug)]
pub struct RecoveryResult {
    /// Contiguous block count (== next seq to append).
    pub length: u64,
    /// Chain hash of the last valid block (genesis hash if empty).
    pub head_hash: [u8; 32],
    /// Bytes truncated from a torn segment tail (0 if clean).
    pub truncated_bytes: u64,
    /// Segment files in ascending first-seq order, with their first seq.
    pub segments: Vec<(PathBuf, u64)>,
}

/// Run crash recovery over all segments in `dir`.
///
/// Only the last segment can be partially valid; a segment with a bad
/// header is skipped entirely. On the first bad CRC or torn record the
/// containing segment is truncated at the last valid record boundary.
pub fn recover(dir: &Path) -> Result<RecoveryResult, SegmentError> {
    let mut segments = list_segments(dir)?;
    segments.sort_by_key(|(_, first_seq)| *first_seq);
    let all_paths: Vec<PathBuf> = segments.iter().map(|(p, _)| p.clone()).collect();

    let mut length: u64 = 0;
    let mut head_hash = GENESIS_HASH;
    let mut truncated_bytes: u64 = 0;
    let mut kept = Vec::new();

    'segments: for (path, first_seq) in segments {
        let reader = match SegmentReader::open(&path) {
            Ok(r) => r,
            Err(SegmentError::BadMagic | SegmentError::BadVersion(_)) => continue,
            Err(e) => return Err(e),
        };

        if first_seq != length {
            // Gap between segments; everything past it is unusable.
            tracing::warn!(
                segment = %path.display(),
                expected = length,
                found = first_seq,
                "segment gap, discarding tail"
            );
            break;
        }

        let mut last_valid_offset = HEADER_SIZE;
        let mut seg_blocks: u64 = 0;

        for block in reader.iter()? {
            match block {
                Ok(block) if block.seq == length => {
                    head_hash = block.chain_hash(&head_hash);
                    length += 1;
                    seg_blocks += 1;
                    last_valid_offset += crate::segment::record_size(block.payload.len());
                }
                Ok(block) => {
                    tracing::warn!(
                        segment = %path.display(),
                        expected = length,
                        found = block.seq,
                        "out-of-order record, truncating"
                    );
                    truncated_bytes += truncate_at(&path, last_valid_offset)?;
                    if seg_blocks > 0 {
                        kept.push((path.clone(), first_seq));
                    }
                    break 'segments;
                }
                Err(SegmentError::CrcMismatch { .. } | SegmentError::TruncatedRecord(_)) => {
                    truncated_bytes += truncate_at(&path, last_valid_offset)?;
                    if seg_blocks > 0 {
                        kept.push((path.clone(), first_seq));
                    }
                    break 'segments;
                }
                Err(e) => return Err(e),
            }
        }

        kept.push((path, first_seq));
    }

    // Segments past a gap or truncation point (and unreadable ones) are
    // removed; leaving them would let stale records fold into the chain
    // once appends reach their seqs again.
    for path in all_paths {
        if path.exists() && !kept.iter().any(|(kept_path, _)| *kept_path == path) {
            truncated_bytes += fs::metadata(&path).map(|m| m.len()).unwrap_or(0);
            let _ = fs::remove_file(&path);
        }
    }

    if truncated_bytes > 0 {
        tracing::info!(truncated_bytes, length, "log recovered with truncation");
    }

    Ok(RecoveryResult {
        length,
        head_hash,
        truncated_bytes,
        segments: kept,
    })
}

fn list_segments(dir: &Path) -> Result<Vec<(PathBuf, u64)>, SegmentError> {
    let mut out = Vec::new();
    if !dir.exists() {
        return Ok(out);
    }
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        let name = entry.file_name();
        if let Some((first_seq, _epoch)) = parse_segment_name(&name.to_string_lossy()) {
            out.push((entry.path(), first_seq));
        }
    }
    Ok(out)
}

/// Truncate a segment file at `offset`; returns bytes removed. A segment
/// left with only its header is deleted outright.
fn truncate_at(path: &Path, offset: u64) -> Result<u64, SegmentError> {
    let file_len = fs::metadata(path)?.len();
    if offset >= file_len {
        return Ok(0);
    }
    if offset <= HEADER_SIZE {
        fs::remove_file(path)?;
        return Ok(file_len);
    }
    let file = OpenOptions::new().write(true).open(path)?;
    file.set_len(offset)?;
    file.sync_all()?;
    Ok(file_len - offset)
}

// ===========================================================================
// Tests
// ===========================================================================
