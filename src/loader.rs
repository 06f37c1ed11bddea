//! Memory-mapped, record-aligned file loading
//!
//! Loading happens at two levels. The file's byte range is block-partitioned
//! across ranks; each rank maps its partition (an L1 block) with both ends
//! moved to record boundaries so no record is split or double-counted at a
//! seam. Within a rank, worker threads carve the L1 block into L2 blocks by
//! bumping a shared atomic cursor; each L2 block is again record-aligned, so
//! a thread can parse its block without looking at its neighbors.
//!
//! Seam consistency needs no coordination: adjacent owners run the same
//! resynchronization at the same boundary offset and therefore agree on
//! where the first whole record after it begins. Records spanning a nominal
//! boundary belong to the block on the left, which extends past its nominal
//! end to cover them.

use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use memmap2::{Mmap, MmapOptions};

use crate::error::{Error, Result};
use crate::format::SeqFormat;
use crate::partition::{block_partition, Range};

/// Nominal L2 block size when the caller does not specify one (one page).
pub const DEFAULT_CHUNK_SIZE: usize = 4096;

const PAGE_SIZE: u64 = 4096;

/// Per-rank view of one input file
pub struct FileLoader {
    file: File,
    path: PathBuf,
    file_len: u64,
    format: SeqFormat,
    world_size: usize,
    rank: usize,
    chunk_size: u64,
    l1_served: bool,
}

impl FileLoader {
    /// Opens `path` and stands ready to serve this rank's L1 block.
    ///
    /// # Panics
    ///
    /// Panics on an inconsistent topology (`rank >= world_size`, zero
    /// threads, zero chunk size).
    pub fn open<P: AsRef<Path>>(
        path: P,
        format: SeqFormat,
        world_size: usize,
        rank: usize,
        thread_count: usize,
        chunk_size: usize,
    ) -> Result<Self> {
        assert!(world_size > 0 && rank < world_size, "rank outside world");
        assert!(thread_count > 0, "thread count must be positive");
        assert!(chunk_size > 0, "chunk size must be positive");

        let path = path.as_ref();
        let file = File::open(path).map_err(|e| Error::FileOpen {
            path: path.to_path_buf(),
            source: e,
        })?;
        let file_len = file.metadata()?.len();
        tracing::debug!(
            path = %path.display(),
            file_len,
            world_size,
            rank,
            thread_count,
            chunk_size,
            "opened input file"
        );

        Ok(Self {
            file,
            path: path.to_path_buf(),
            file_len,
            format,
            world_size,
            rank,
            chunk_size: chunk_size as u64,
            l1_served: false,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn file_len(&self) -> u64 {
        self.file_len
    }

    /// Maps the pages covering `range`; returns the map and the file offset
    /// of its first byte.
    fn map_window(&self, range: &Range) -> Result<(Mmap, u64)> {
        let base = range.align_to_page(PAGE_SIZE);
        let len = (range.end - base) as usize;
        let mmap = unsafe { MmapOptions::new().offset(base).len(len).map(&self.file)? };
        Ok((mmap, base))
    }

    /// Maps `probe` and resynchronizes to the first record start inside it.
    fn find_boundary(&self, probe: &Range) -> Result<u64> {
        if probe.is_empty() {
            return Ok(probe.start);
        }
        let (mmap, base) = self.map_window(probe)?;
        let slice = &mmap[(probe.start - base) as usize..];
        self.format.find_record_start(slice, probe)
    }

    /// Resolves a partition boundary to the first record start at or after
    /// it. The probe window starts one partition step wide and doubles until
    /// it captures a record start or hits the end of the file, so a record
    /// longer than a partition cannot split a seam. The computation depends
    /// only on the boundary offset and the uniform step, which is what makes
    /// the two ranks sharing a seam agree on it independently.
    fn align_boundary(&self, boundary: u64, step: u64) -> Result<u64> {
        if boundary == 0 {
            return Ok(0);
        }
        if boundary >= self.file_len {
            return Ok(self.file_len);
        }
        let mut window = step.max(1);
        loop {
            let probe = Range::new(boundary, (boundary + window).min(self.file_len));
            let pos = self.find_boundary(&probe)?;
            if pos < probe.end || probe.end >= self.file_len {
                return Ok(pos.min(self.file_len));
            }
            window *= 2;
        }
    }

    /// Maps and returns this rank's record-aligned L1 block, or `None` once
    /// the rank's share of the file is exhausted (including the case where
    /// the share holds no complete record).
    pub fn next_l1_block(&mut self) -> Result<Option<L1Block>> {
        if self.l1_served {
            return Ok(None);
        }
        self.l1_served = true;

        let own = block_partition(self.file_len, self.world_size)[self.rank];
        if own.is_empty() {
            return Ok(None);
        }

        let step = own.step.max(1);
        let start = self.align_boundary(own.start, step)?;
        let end = self.align_boundary(own.end, step)?;
        if start >= end {
            return Ok(None);
        }

        let range = Range {
            start,
            end,
            overlap: end.saturating_sub(own.end),
            step: own.step,
        };
        let (mmap, map_base) = self.map_window(&range)?;
        tracing::debug!(
            rank = self.rank,
            nominal_start = own.start,
            nominal_end = own.end,
            start,
            end,
            "aligned and mapped L1 block"
        );
        Ok(Some(L1Block {
            mmap,
            map_base,
            range,
            format: self.format,
            chunk_size: self.chunk_size,
            cursor: AtomicU64::new(range.start),
        }))
    }
}

/// One rank's mapped, record-aligned region of the file
///
/// Owns the mapping; L2 blocks borrow from it, so the region stays mapped
/// for exactly as long as any thread still parses it.
pub struct L1Block {
    mmap: Mmap,
    map_base: u64,
    range: Range,
    format: SeqFormat,
    chunk_size: u64,
    /// Next nominal L2 start, bumped by `chunk_size` per acquisition.
    cursor: AtomicU64,
}

/// A record-aligned slice of an L1 block, served to one worker thread
#[derive(Debug, Clone, Copy)]
pub struct L2Block<'a> {
    pub data: &'a [u8],
    pub range: Range,
}

impl L1Block {
    pub fn range(&self) -> Range {
        self.range
    }

    pub fn data(&self) -> &[u8] {
        self.slice(&self.range)
    }

    fn slice(&self, r: &Range) -> &[u8] {
        &self.mmap[(r.start - self.map_base) as usize..(r.end - self.map_base) as usize]
    }

    /// Claims the next L2 block for a worker thread.
    ///
    /// Thread-safe: claiming is one atomic fetch-add on the shared cursor.
    /// Both ends of the returned block are record-aligned; the end may
    /// extend past the nominal `chunk_size` grid to cover a record that
    /// straddles it. Returns `None` when the block is exhausted.
    pub fn next_l2_block(&self, tid: usize) -> Result<Option<L2Block<'_>>> {
        loop {
            let s = self.cursor.fetch_add(self.chunk_size, Ordering::Relaxed);
            if s >= self.range.end {
                return Ok(None);
            }
            let nominal_end = (s + self.chunk_size).min(self.range.end);

            let start = if s == self.range.start {
                s
            } else {
                let probe = Range::new(s, self.range.end);
                self.format.find_record_start(self.slice(&probe), &probe)?
            };
            let end = if nominal_end >= self.range.end {
                self.range.end
            } else {
                let probe = Range::new(nominal_end, self.range.end);
                self.format.find_record_start(self.slice(&probe), &probe)?
            };

            // a chunk may hold no record start at all (swallowed by the
            // previous block's extension); skip to the next one
            if start >= end {
                continue;
            }
            let range = Range {
                start,
                end,
                overlap: end.saturating_sub(nominal_end),
                step: self.chunk_size,
            };
            tracing::trace!(tid, start, end, "serving L2 block");
            return Ok(Some(L2Block {
                data: self.slice(&range),
                range,
            }));
        }
    }

    /// Rewinds the L2 cursor for another pass over the block.
    pub fn reset_l2_partitioner(&self) {
        self.cursor.store(self.range.start, Ordering::Relaxed);
    }
}
