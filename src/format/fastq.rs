//! FASTQ parsing and record resynchronization
//!
//! A FASTQ record is four lines: `@header`, sequence, `+header`, quality.
//! Resynchronizing at an arbitrary byte offset is the interesting part: a
//! quality line may begin with `@` or `+`, so a single line tells little.
//! The classifier reads the first character of up to four consecutive lines
//! and decides which line of a record the window landed on:
//!
//! | c0      | c1  | c2  | window covers lines | next record |
//! |---------|-----|-----|---------------------|-------------|
//! | `@`     | ≠`@`| *   | 1,2,…               | line 0      |
//! | `@`     | `@` | *   | 4,1,…               | line 1      |
//! | `+`     | `@` | ≠`@`| 4,1,2               | line 1      |
//! | `+`     | `@` | `@` | 3,4,1               | line 2      |
//! | `+`     | ≠`@`| *   | 3,4                 | line 2      |
//! | *       | `+` | *   | 2,3                 | line 3      |
//! | ≠`@`,≠`+`| `@`| *   | 4,1                 | line 1      |
//! | otherwise           | not FASTQ           | fail        |
//!
//! Ties resolve to the earliest plausible offset so that no record is ever
//! skipped. Sequence lines cannot begin with `@` or `+` (those are not
//! alphabet characters), which is what makes the three-line lookahead
//! sufficient. A window that ends before the deciding line is indeterminate
//! and reports "no record start here" (the window end); callers that can see
//! more of the file widen the window, and at end of file that answer is the
//! truth. Two adjacent windows classified independently agree on the record
//! boundary between them, so partition seams lose nothing.

use std::sync::atomic::{AtomicU64, Ordering};

use crate::error::{Error, Result};
use crate::partition::Range;

use super::{ReadId, SequenceRecord};

#[inline]
fn is_eol(b: u8) -> bool {
    b == b'\n' || b == b'\r'
}

/// Locates the first record start at or after `range.start`.
///
/// `block` holds the file bytes of `range`; offset 0 counts as a line start
/// even without a preceding newline. Returns `range.end` when the window
/// ends before a record start appears, and fails when the window has line
/// structure that cannot belong to a FASTQ file.
pub fn find_record_start(block: &[u8], range: &Range) -> Result<u64> {
    debug_assert_eq!(block.len() as u64, range.len());

    let mut first = [0u8; 4];
    let mut offsets = [range.end; 4];
    let mut found = 0usize;
    let mut at_line_start = range.start == 0;

    for (i, &b) in block.iter().enumerate() {
        if is_eol(b) {
            at_line_start = true;
        } else if at_line_start {
            first[found] = b;
            offsets[found] = range.start + i as u64;
            found += 1;
            if found == 4 {
                break;
            }
            at_line_start = false;
        }
    }

    let (c0, c1, c2) = (first[0], first[1], first[2]);
    let pos = if found >= 1 && c0 == b'@' {
        if found < 2 {
            // header or quality? the next line decides; without it the
            // window holds no determinable record start
            range.end
        } else if c1 == b'@' {
            offsets[1]
        } else {
            offsets[0]
        }
    } else if found >= 1 && c0 == b'+' {
        if found >= 2 && c1 == b'@' {
            if found < 3 {
                // separator+quality and quality+header both match; the
                // third line decides
                range.end
            } else if c2 == b'@' {
                offsets[2]
            } else {
                offsets[1]
            }
        } else {
            offsets[2]
        }
    } else if found >= 2 && c1 == b'+' {
        offsets[3]
    } else if found >= 2 && c1 == b'@' {
        offsets[1]
    } else if found < 2 {
        // ran out of lines before the classification resolved: the window
        // holds no record start
        range.end
    } else {
        return Err(Error::format(
            range.start,
            format!(
                "window {}..{} contains no FASTQ record marker",
                range.start, range.end
            ),
        ));
    };
    Ok(pos)
}

/// Iterator over the records of a record-aligned block
pub struct FastqRecords<'a> {
    block: &'a [u8],
    pos: usize,
    base_offset: u64,
    file_id: u32,
    ordinals: &'a AtomicU64,
}

impl<'a> FastqRecords<'a> {
    /// `base_offset` is the file offset of `block[0]`, which must be a
    /// record start (or end of data). `ordinals` assigns rank-local read
    /// ordinals across all concurrently parsing threads.
    pub fn new(block: &'a [u8], base_offset: u64, file_id: u32, ordinals: &'a AtomicU64) -> Self {
        Self {
            block,
            pos: 0,
            base_offset,
            file_id,
            ordinals,
        }
    }

    /// Consumes one line, without its terminator. `None` at end of block.
    fn next_line(&mut self) -> Option<&'a [u8]> {
        if self.pos >= self.block.len() {
            return None;
        }
        let start = self.pos;
        let rest = &self.block[start..];
        let end = match memchr::memchr(b'\n', rest) {
            Some(p) => {
                self.pos = start + p + 1;
                start + p
            }
            None => {
                self.pos = self.block.len();
                self.block.len()
            }
        };
        let mut line = &self.block[start..end];
        if let [head @ .., b'\r'] = line {
            line = head;
        }
        Some(line)
    }

    fn parse_record(&mut self) -> Result<SequenceRecord<'a>> {
        let rec_offset = self.base_offset + self.pos as u64;

        let header_line = self.next_line().expect("caller checked for data");
        if header_line.first() != Some(&b'@') {
            return Err(Error::format(rec_offset, "expected '@' at record start"));
        }

        let seq = self
            .next_line()
            .ok_or_else(|| Error::format(rec_offset, "truncated record"))?;
        let plus_line = self
            .next_line()
            .ok_or_else(|| Error::format(rec_offset, "truncated record"))?;
        if plus_line.first() != Some(&b'+') {
            return Err(Error::format(rec_offset, "expected '+' separator"));
        }
        let qual = self
            .next_line()
            .ok_or_else(|| Error::format(rec_offset, "truncated record"))?;

        if seq.len() != qual.len() {
            return Err(Error::format(
                rec_offset,
                format!(
                    "sequence length {} does not match quality length {}",
                    seq.len(),
                    qual.len()
                ),
            ));
        }

        Ok(SequenceRecord {
            id: ReadId {
                file_id: self.file_id,
                ordinal: self.ordinals.fetch_add(1, Ordering::Relaxed),
                offset: rec_offset,
            },
            header: &header_line[1..],
            seq,
            qual: Some(qual),
        })
    }
}

impl<'a> Iterator for FastqRecords<'a> {
    type Item = Result<SequenceRecord<'a>>;

    fn next(&mut self) -> Option<Self::Item> {
        while self.pos < self.block.len() && is_eol(self.block[self.pos]) {
            self.pos += 1;
        }
        if self.pos >= self.block.len() {
            return None;
        }
        match self.parse_record() {
            Ok(record) => Some(Ok(record)),
            Err(e) => {
                // structural corruption is fatal; stop iterating
                self.pos = self.block.len();
                Some(Err(e))
            }
        }
    }
}
