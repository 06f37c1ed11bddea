//! # kmerix
//!
//! A distributed k-mer indexing engine for biological sequence data. Given a
//! FASTQ or FASTA file shared by a group of cooperating ranks, `kmerix`
//! builds an in-memory associative index mapping every length-k substring of
//! the input reads to its occurrences: originating read, offset within the
//! read, and a quality score derived from the Phred values under the window.
//!
//! ## Pipeline
//!
//! ```text
//! ┌────────────┐  L1 block   ┌────────────┐  records   ┌─────────────┐
//! │ FileLoader │────────────▶│ L2 blocks  │───────────▶│   parser    │
//! │   (mmap)   │  per rank   │ per thread │            │ fastq/fasta │
//! └────────────┘             └────────────┘            └──────┬──────┘
//!                                                             │ reads
//! ┌─────────────┐  local inserts, and remote inserts   ┌──────▼──────┐
//! │ local shard │  coalesced per destination rank and  │ KmerWindows │
//! │ (multimap)  │◀─ settled by the collective flush ───│  generator  │
//! └─────────────┘                                      └─────────────┘
//! ```
//!
//! Ranks communicate through a [`Transport`] handle with message-passing
//! semantics (point-to-point FIFO per pair, barrier, allreduce); the crate
//! ships [`ChannelTransport`] for in-process groups. Small cross-rank
//! insertions are coalesced into large messages by the [`comm`] layer and
//! settled collectively by [`DistributedIndex::flush`].
//!
//! ## Example
//!
//! ```no_run
//! use kmerix::{ChannelTransport, DistributedIndex, IndexConfig, DNA};
//!
//! # fn main() -> kmerix::Result<()> {
//! let transport = ChannelTransport::group(1).pop().unwrap();
//! let config = IndexConfig::new(21, &DNA);
//! let index = DistributedIndex::new(transport, config)?;
//! let stats = index.build("reads.fq")?;
//! println!("indexed {} k-mers from {} reads", stats.kmers, stats.reads);
//! # Ok(())
//! # }
//! ```

pub mod alphabet;
pub mod comm;
mod error;
pub mod format;
pub mod generator;
pub mod index;
pub mod kmer;
pub mod loader;
pub mod partition;
pub mod quality;

pub use alphabet::{Alphabet, DNA, DNA16, DNA5, PROTEIN};
pub use comm::{ChannelTransport, CommLayer, Transport};
pub use error::{Error, Result};
pub use format::{ReadId, SeqFormat, SequenceRecord};
pub use generator::{KmerHit, KmerWindows};
pub use index::{BuildStats, DistributedIndex, EntryValue, IndexConfig, LocalShard};
pub use kmer::{Kmer, KmerSpec, MAX_KMER_WORDS};
pub use loader::{FileLoader, L1Block, L2Block};
pub use partition::Range;
pub use quality::{QualityWindow, SangerEncoder};
