//! Sequence file formats
//!
//! The loader hands out raw byte blocks; this module turns them back into
//! records. Both supported formats share two obligations: locating the start
//! of a record from an arbitrary byte offset (so block seams can be aligned
//! without coordination) and parsing a record-aligned block into a stream of
//! borrowed records.
//!
//! Parsed records borrow into the block they were read from and must not
//! outlive it; anything that leaves the parsing pass copies what it needs.

use std::sync::atomic::AtomicU64;

use crate::error::Result;
use crate::partition::Range;

pub mod fasta;
pub mod fastq;

/// Input format of a sequence file. Detection heuristics live with the
/// caller; the core is told which format it is reading.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SeqFormat {
    Fastq,
    Fasta,
}

impl SeqFormat {
    /// Finds the first record start at or after `range.start`.
    ///
    /// `block` holds the file bytes of `range`. Returns `range.end` when no
    /// record starts inside the window.
    pub fn find_record_start(&self, block: &[u8], range: &Range) -> Result<u64> {
        match self {
            SeqFormat::Fastq => fastq::find_record_start(block, range),
            SeqFormat::Fasta => Ok(fasta::find_record_start(block, range)),
        }
    }

    /// Iterates the records of a record-aligned block.
    pub fn records<'a>(
        &self,
        block: &'a [u8],
        base_offset: u64,
        file_id: u32,
        ordinals: &'a AtomicU64,
    ) -> RecordIter<'a> {
        match self {
            SeqFormat::Fastq => {
                RecordIter::Fastq(fastq::FastqRecords::new(block, base_offset, file_id, ordinals))
            }
            SeqFormat::Fasta => {
                RecordIter::Fasta(fasta::FastaRecords::new(block, base_offset, file_id, ordinals))
            }
        }
    }
}

/// Identity of a read within one indexing job
///
/// Encodes the originating file, the rank-local read ordinal, and the byte
/// offset of the record start. Ordinals are drawn from a shared counter, so
/// they are unique within a rank but carry no cross-thread ordering.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReadId {
    pub file_id: u32,
    pub ordinal: u64,
    pub offset: u64,
}

/// One parsed sequence record, borrowing into its block
///
/// `seq` may contain line terminators (multi-line FASTA); consumers skip
/// them via the alphabet's ignore code. `qual` is present for FASTQ only and
/// has exactly one character per sequence character.
#[derive(Debug, Clone, Copy)]
pub struct SequenceRecord<'a> {
    pub id: ReadId,
    pub header: &'a [u8],
    pub seq: &'a [u8],
    pub qual: Option<&'a [u8]>,
}

/// Record iterator over either format
pub enum RecordIter<'a> {
    Fastq(fastq::FastqRecords<'a>),
    Fasta(fasta::FastaRecords<'a>),
}

impl<'a> Iterator for RecordIter<'a> {
    type Item = Result<SequenceRecord<'a>>;

    fn next(&mut self) -> Option<Self::Item> {
        match self {
            RecordIter::Fastq(it) => it.next(),
            RecordIter::Fasta(it) => it.next(),
        }
    }
}
