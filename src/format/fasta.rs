//! FASTA parsing and record alignment
//!
//! FASTA records begin with `>` at a line start and run until the next `>`
//! header or end of data. Sequences may span multiple lines; the parser
//! keeps the raw span (terminators included) and leaves skipping them to the
//! consumer, so records stay single contiguous borrows.

use std::sync::atomic::{AtomicU64, Ordering};

use memchr::memmem;

use crate::error::{Error, Result};
use crate::partition::Range;

use super::{ReadId, SequenceRecord};

/// Finds the first record start at or after `range.start`: offset 0 when the
/// window opens on a `>`, otherwise the first `>` following a newline.
/// Returns `range.end` when the window holds no record start.
pub fn find_record_start(block: &[u8], range: &Range) -> u64 {
    debug_assert_eq!(block.len() as u64, range.len());
    if range.start == 0 && block.first() == Some(&b'>') {
        return 0;
    }
    match memmem::find(block, b"\n>") {
        Some(p) => range.start + p as u64 + 1,
        None => range.end,
    }
}

/// Iterator over the records of a record-aligned block
pub struct FastaRecords<'a> {
    block: &'a [u8],
    pos: usize,
    base_offset: u64,
    file_id: u32,
    ordinals: &'a AtomicU64,
}

impl<'a> FastaRecords<'a> {
    pub fn new(block: &'a [u8], base_offset: u64, file_id: u32, ordinals: &'a AtomicU64) -> Self {
        Self {
            block,
            pos: 0,
            base_offset,
            file_id,
            ordinals,
        }
    }
}

impl<'a> Iterator for FastaRecords<'a> {
    type Item = Result<SequenceRecord<'a>>;

    fn next(&mut self) -> Option<Self::Item> {
        while self.pos < self.block.len()
            && (self.block[self.pos] == b'\n' || self.block[self.pos] == b'\r')
        {
            self.pos += 1;
        }
        if self.pos >= self.block.len() {
            return None;
        }

        let rec_start = self.pos;
        if self.block[rec_start] != b'>' {
            self.pos = self.block.len();
            return Some(Err(Error::format(
                self.base_offset + rec_start as u64,
                "expected '>' at record start",
            )));
        }

        // header runs to the end of the line
        let rest = &self.block[rec_start..];
        let header_end = memchr::memchr(b'\n', rest)
            .map(|p| rec_start + p)
            .unwrap_or(self.block.len());
        let mut header = &self.block[rec_start + 1..header_end];
        if let [head @ .., b'\r'] = header {
            header = head;
        }

        // sequence spans to the next header or the end of the block; the
        // boundary search starts at the header's own terminator so that a
        // header-only record yields an empty sequence
        let seq_start = (header_end + 1).min(self.block.len());
        let seq_end = memmem::find(&self.block[header_end..], b"\n>")
            .map(|p| header_end + p + 1)
            .unwrap_or(self.block.len());
        self.pos = seq_end;

        Some(Ok(SequenceRecord {
            id: ReadId {
                file_id: self.file_id,
                ordinal: self.ordinals.fetch_add(1, Ordering::Relaxed),
                offset: self.base_offset + rec_start as u64,
            },
            header,
            seq: &self.block[seq_start..seq_end],
            qual: None,
        }))
    }
}
