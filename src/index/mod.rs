//! Hash-partitioned distributed k-mer index
//!
//! Every k-mer has exactly one owning rank, derived from a stable hash of
//! its packed value. Insertions for remote owners are serialized and
//! coalesced through the communication layer; insertions for the local rank
//! go straight into the shard. After a collective [`flush`], each rank's
//! shard holds precisely the entries whose key hashes to it, and queries can
//! be answered by a single request/response round-trip with the owner.
//!
//! [`flush`]: DistributedIndex::flush
//!
//! The build pipeline lives here too: the loader maps the rank's L1 block, a
//! scoped pool of worker threads pulls record-aligned L2 blocks off the
//! shared cursor, parses records, rolls k-mer windows, and routes every
//! emission through [`DistributedIndex::insert`].

use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use byteorder::{ByteOrder, LittleEndian};
use parking_lot::{Condvar, Mutex};

use crate::alphabet::Alphabet;
use crate::comm::{CommLayer, Transport};
use crate::error::{Error, Result};
use crate::format::{ReadId, SeqFormat};
use crate::generator::KmerWindows;
use crate::kmer::{Kmer, KmerSpec, MAX_KMER_WORDS};
use crate::loader::{FileLoader, L1Block, DEFAULT_CHUNK_SIZE};
use crate::quality::SangerEncoder;

mod shard;

pub use shard::{EntryValue, LocalShard};

/// Coalesced insertion traffic.
const TAG_INSERT: u8 = 1;
/// Query requests, sent directly.
const TAG_QUERY: u8 = 2;
/// Query responses, sent directly by the owner's receiver thread.
const TAG_QUERY_RESP: u8 = 3;

/// Serialized size of an [`EntryValue`].
const VALUE_WIRE_SIZE: usize = 4 + 8 + 8 + 4 + 8;

/// Tunables of one index instance
#[derive(Debug, Clone, Copy)]
pub struct IndexConfig {
    /// Window length.
    pub k: usize,
    pub alphabet: &'static Alphabet,
    pub format: SeqFormat,
    /// Worker threads per rank.
    pub thread_count: usize,
    /// Nominal L2 block size in bytes.
    pub chunk_size: usize,
    /// Per-destination communication buffer capacity in bytes.
    pub buffer_capacity: usize,
    /// File id recorded in every read id emitted by `build`.
    pub file_id: u32,
}

impl IndexConfig {
    /// Defaults: FASTQ input, hardware thread count, one-page L2 blocks,
    /// 64 KiB communication buffers.
    pub fn new(k: usize, alphabet: &'static Alphabet) -> Self {
        Self {
            k,
            alphabet,
            format: SeqFormat::Fastq,
            thread_count: std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(1),
            chunk_size: DEFAULT_CHUNK_SIZE,
            buffer_capacity: 64 * 1024,
            file_id: 0,
        }
    }
}

/// Counters accumulated by one `build` pass
///
/// Recoverable incidents (characters outside the alphabet) appear here and
/// nowhere else.
#[derive(Debug, Default, Clone, Copy)]
pub struct BuildStats {
    pub reads: u64,
    pub kmers: u64,
    pub invalid_chars: u64,
    pub l2_blocks: u64,
}

impl BuildStats {
    fn absorb(&mut self, other: &BuildStats) {
        self.reads += other.reads;
        self.kmers += other.kmers;
        self.invalid_chars += other.invalid_chars;
        self.l2_blocks += other.l2_blocks;
    }
}

/// Outstanding remote queries, fulfilled by the receiver thread
struct QueryTable {
    pending: Mutex<std::collections::HashMap<u64, Option<Vec<EntryValue>>>>,
    cv: Condvar,
}

impl QueryTable {
    fn new() -> Self {
        Self {
            pending: Mutex::new(std::collections::HashMap::new()),
            cv: Condvar::new(),
        }
    }

    fn register(&self, id: u64) {
        self.pending.lock().insert(id, None);
    }

    fn fulfill(&self, id: u64, values: Vec<EntryValue>) {
        let mut pending = self.pending.lock();
        if let Some(slot) = pending.get_mut(&id) {
            *slot = Some(values);
            self.cv.notify_all();
        }
    }

    fn wait(&self, id: u64) -> Vec<EntryValue> {
        let mut pending = self.pending.lock();
        loop {
            if matches!(pending.get(&id), Some(Some(_))) {
                return pending.remove(&id).flatten().unwrap_or_default();
            }
            self.cv.wait(&mut pending);
        }
    }
}

fn encode_value(out: &mut Vec<u8>, v: &EntryValue) {
    let mut tmp = [0u8; 8];
    LittleEndian::write_u32(&mut tmp[..4], v.read_id.file_id);
    out.extend_from_slice(&tmp[..4]);
    LittleEndian::write_u64(&mut tmp, v.read_id.ordinal);
    out.extend_from_slice(&tmp);
    LittleEndian::write_u64(&mut tmp, v.read_id.offset);
    out.extend_from_slice(&tmp);
    LittleEndian::write_u32(&mut tmp[..4], v.offset);
    out.extend_from_slice(&tmp[..4]);
    LittleEndian::write_f64(&mut tmp, v.quality);
    out.extend_from_slice(&tmp);
}

fn decode_value(bytes: &[u8]) -> EntryValue {
    EntryValue {
        read_id: ReadId {
            file_id: LittleEndian::read_u32(&bytes[0..4]),
            ordinal: LittleEndian::read_u64(&bytes[4..12]),
            offset: LittleEndian::read_u64(&bytes[12..20]),
        },
        offset: LittleEndian::read_u32(&bytes[20..24]),
        quality: LittleEndian::read_f64(&bytes[24..32]),
    }
}

fn encode_kmer(out: &mut Vec<u8>, kmer: &Kmer) {
    let mut tmp = [0u8; 8];
    for &w in kmer.words() {
        LittleEndian::write_u64(&mut tmp, w);
        out.extend_from_slice(&tmp);
    }
}

fn decode_kmer(spec: KmerSpec, bytes: &[u8]) -> Kmer {
    let mut words = [0u64; MAX_KMER_WORDS];
    for (i, word) in words[..spec.n_words()].iter_mut().enumerate() {
        *word = LittleEndian::read_u64(&bytes[i * 8..i * 8 + 8]);
    }
    Kmer::from_words(spec, &words[..spec.n_words()])
}

/// One rank's handle on the distributed index
pub struct DistributedIndex<T: Transport> {
    spec: KmerSpec,
    config: IndexConfig,
    comm: CommLayer<T>,
    shard: Arc<LocalShard>,
    queries: Arc<QueryTable>,
    next_query: AtomicU64,
}

impl<T: Transport> DistributedIndex<T> {
    /// Wires the shard, the query table, and the communication layer
    /// together and starts the background threads. Collective: every rank of
    /// the transport group must construct its index.
    pub fn new(transport: T, config: IndexConfig) -> Result<Self> {
        let spec = KmerSpec::for_alphabet(config.k, config.alphabet)?;
        let transport = Arc::new(transport);
        let shard = Arc::new(LocalShard::new());
        let queries = Arc::new(QueryTable::new());
        let mut comm = CommLayer::new(Arc::clone(&transport), config.buffer_capacity, TAG_INSERT);

        let entry_size = spec.n_bytes() + VALUE_WIRE_SIZE;

        {
            let shard = Arc::clone(&shard);
            comm.register_handler(
                TAG_INSERT,
                Box::new(move |_src, payload| {
                    for entry in payload.chunks_exact(entry_size) {
                        let kmer = decode_kmer(spec, entry);
                        let value = decode_value(&entry[spec.n_bytes()..]);
                        shard.insert(kmer, value);
                    }
                }),
            );
        }
        {
            // owner side of a query: look up and respond straight through
            // the transport, not the coalescing path
            let shard = Arc::clone(&shard);
            let transport = Arc::clone(&transport);
            comm.register_handler(
                TAG_QUERY,
                Box::new(move |src, payload| {
                    let id = LittleEndian::read_u64(&payload[..8]);
                    let kmer = decode_kmer(spec, &payload[8..]);
                    let values = shard.get(&kmer);
                    let mut resp = Vec::with_capacity(12 + values.len() * VALUE_WIRE_SIZE);
                    let mut tmp = [0u8; 8];
                    LittleEndian::write_u64(&mut tmp, id);
                    resp.extend_from_slice(&tmp);
                    LittleEndian::write_u32(&mut tmp[..4], values.len() as u32);
                    resp.extend_from_slice(&tmp[..4]);
                    for v in &values {
                        encode_value(&mut resp, v);
                    }
                    if let Err(e) = transport.send(src, TAG_QUERY_RESP, resp) {
                        tracing::error!(src, "query response failed: {e}");
                    }
                }),
            );
        }
        {
            let queries = Arc::clone(&queries);
            comm.register_handler(
                TAG_QUERY_RESP,
                Box::new(move |_src, payload| {
                    let id = LittleEndian::read_u64(&payload[..8]);
                    let count = LittleEndian::read_u32(&payload[8..12]) as usize;
                    let mut values = Vec::with_capacity(count);
                    for chunk in payload[12..].chunks_exact(VALUE_WIRE_SIZE) {
                        values.push(decode_value(chunk));
                    }
                    queries.fulfill(id, values);
                }),
            );
        }
        comm.start();

        Ok(Self {
            spec,
            config,
            comm,
            shard,
            queries,
            next_query: AtomicU64::new(0),
        })
    }

    pub fn rank(&self) -> usize {
        self.comm.rank()
    }

    pub fn world_size(&self) -> usize {
        self.comm.world_size()
    }

    pub fn spec(&self) -> KmerSpec {
        self.spec
    }

    pub fn config(&self) -> &IndexConfig {
        &self.config
    }

    /// The rank owning this key.
    pub fn owner_of(&self, kmer: &Kmer) -> usize {
        (kmer.partition_hash() % self.world_size() as u64) as usize
    }

    /// Routes one entry to its owner: local shard insert, or serialize into
    /// the owner's communication buffer.
    pub fn insert(&self, kmer: &Kmer, value: EntryValue) -> Result<()> {
        let dst = self.owner_of(kmer);
        if dst == self.rank() {
            self.shard.insert(*kmer, value);
            return Ok(());
        }
        let mut bytes = Vec::with_capacity(self.spec.n_bytes() + VALUE_WIRE_SIZE);
        encode_kmer(&mut bytes, kmer);
        encode_value(&mut bytes, &value);
        self.comm.send_buffered(dst, &bytes)
    }

    /// Collective: quiesces the communication layer. Afterwards every rank's
    /// shard holds exactly the entries whose key it owns.
    pub fn flush(&self) -> Result<()> {
        self.comm.flush()
    }

    /// Collective rendezvous of all ranks.
    pub fn barrier(&self) {
        self.comm.transport().barrier();
    }

    /// Entries held locally.
    pub fn local_size(&self) -> u64 {
        self.shard.n_entries()
    }

    /// Collective: total entries across all ranks.
    pub fn size(&self) -> u64 {
        self.comm.transport().allreduce_sum(self.local_size())
    }

    pub fn local_shard(&self) -> &LocalShard {
        &self.shard
    }

    /// Looks a key up wherever it lives. A local key is answered from the
    /// shard; a remote key dispatches a request to the owner and blocks for
    /// the response.
    pub fn query(&self, kmer: &Kmer) -> Result<Vec<EntryValue>> {
        let dst = self.owner_of(kmer);
        if dst == self.rank() {
            return Ok(self.shard.get(kmer));
        }
        let id = self.next_query.fetch_add(1, Ordering::Relaxed);
        self.queries.register(id);
        let mut payload = Vec::with_capacity(8 + self.spec.n_bytes());
        let mut tmp = [0u8; 8];
        LittleEndian::write_u64(&mut tmp, id);
        payload.extend_from_slice(&tmp);
        encode_kmer(&mut payload, kmer);
        self.comm.send_direct(dst, TAG_QUERY, payload)?;
        Ok(self.queries.wait(id))
    }

    /// Collective: indexes one file. Every rank loads its record-aligned L1
    /// block, worker threads pull L2 blocks and stream emissions into the
    /// index, and a final flush leaves the index fully partitioned.
    pub fn build<P: AsRef<Path>>(&self, path: P) -> Result<BuildStats> {
        let mut loader = FileLoader::open(
            path,
            self.config.format,
            self.world_size(),
            self.rank(),
            self.config.thread_count,
            self.config.chunk_size,
        )?;
        let encoder = SangerEncoder::new();
        let ordinals = AtomicU64::new(0);
        let mut stats = BuildStats::default();

        while let Some(l1) = loader.next_l1_block()? {
            let block_stats: Result<BuildStats> = std::thread::scope(|scope| {
                let mut handles = Vec::with_capacity(self.config.thread_count);
                for tid in 0..self.config.thread_count {
                    let l1 = &l1;
                    let encoder = &encoder;
                    let ordinals = &ordinals;
                    handles.push(scope.spawn(move || self.run_worker(l1, tid, encoder, ordinals)));
                }
                let mut total = BuildStats::default();
                for handle in handles {
                    let ws = handle.join().map_err(|_| Error::WorkerPanic)??;
                    total.absorb(&ws);
                }
                Ok(total)
            });
            stats.absorb(&block_stats?);
        }

        self.flush()?;
        tracing::info!(
            rank = self.rank(),
            reads = stats.reads,
            kmers = stats.kmers,
            invalid_chars = stats.invalid_chars,
            local_entries = self.local_size(),
            "index build complete"
        );
        Ok(stats)
    }

    fn run_worker(
        &self,
        l1: &L1Block,
        tid: usize,
        encoder: &SangerEncoder,
        ordinals: &AtomicU64,
    ) -> Result<BuildStats> {
        let mut ws = BuildStats::default();
        while let Some(l2) = l1.next_l2_block(tid)? {
            ws.l2_blocks += 1;
            for record in
                self.config
                    .format
                    .records(l2.data, l2.range.start, self.config.file_id, ordinals)
            {
                let record = record?;
                ws.reads += 1;
                let mut windows = KmerWindows::new(&record, self.spec, self.config.alphabet, encoder);
                for hit in windows.by_ref() {
                    ws.kmers += 1;
                    self.insert(
                        &hit.kmer,
                        EntryValue {
                            read_id: record.id,
                            offset: hit.offset,
                            quality: hit.quality,
                        },
                    )?;
                }
                ws.invalid_chars += windows.invalid_chars();
                if ws.reads % 20_000 == 0 {
                    tracing::debug!(rank = self.rank(), tid, reads = ws.reads, "indexing progress");
                }
            }
        }
        Ok(ws)
    }
}
