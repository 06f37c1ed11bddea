//! Packed k-mer values
//!
//! A k-mer is a fixed-length window over a sequence, stored as a bit-packed
//! integer spread over an array of machine words. The shape of the packing
//! (window length, bits per character, word count) is carried at runtime in a
//! [`KmerSpec`] rather than in the type, so one value type serves every
//! alphabet; the inner loops dispatch on the spec's word count and group
//! width.
//!
//! Layout: characters are appended by shifting the word array left by one
//! group and ORing the new code into the low bits of word 0, so the first
//! character of the window occupies the most significant group and the word
//! array, read as a little-endian multiword integer, compares in the same
//! order as the character string. Unused high bits of the top word are
//! padding and are kept at zero by every mutating operation.
//!
//! Reversal and reverse-complement run in O(nWords) for group widths 2, 4,
//! and 8 via word-parallel bit swizzles (word swap, byte swap, in-word group
//! swap, then a shift to drop the padding); widths 3, 5, and 7 fall back to
//! a group-at-a-time loop.

use std::cmp::Ordering;
use std::hash::{BuildHasher, Hash, Hasher};

use bytemuck::cast_slice;

use crate::alphabet::{Alphabet, INVALID_CODE, SKIP_CODE};
use crate::error::{Error, Result};

/// Number of storage words in a k-mer value. Bounds the supported window
/// length at construction time: `k * bits_per_char <= MAX_KMER_WORDS * 64`.
pub const MAX_KMER_WORDS: usize = 4;

/// Fixed seeds for the rank-partitioning hash. Every rank must derive the
/// same owner for the same key, so the hasher state cannot be randomized.
const PARTITION_SEEDS: [u64; 4] = [
    0x243f_6a88_85a3_08d3,
    0x1319_8a2e_0370_7344,
    0xa409_3822_299f_31d0,
    0x082e_fa98_ec4e_6c89,
];

/// Runtime shape of a k-mer packing
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KmerSpec {
    k: u16,
    bits_per_char: u8,
    n_words: u8,
    /// Mask selecting the used bits of the top word.
    top_mask: u64,
}

impl KmerSpec {
    /// Validates and derives a packing shape.
    ///
    /// # Errors
    ///
    /// [`Error::UnsupportedWidth`] for a group width outside {2, 3, 4, 5, 7, 8},
    /// [`Error::Overflow`] when the window does not fit the word array.
    ///
    /// # Panics
    ///
    /// Panics if `k` is zero.
    pub fn new(k: usize, bits_per_char: u8) -> Result<Self> {
        assert!(k > 0, "k-mer length must be positive");
        match bits_per_char {
            2 | 3 | 4 | 5 | 7 | 8 => {}
            w => return Err(Error::UnsupportedWidth(w)),
        }
        let used_bits = k * bits_per_char as usize;
        if used_bits > MAX_KMER_WORDS * 64 {
            return Err(Error::Overflow {
                k,
                bits_per_char,
                capacity: MAX_KMER_WORDS * 64,
            });
        }
        let rem = used_bits % 64;
        let top_mask = if rem == 0 { u64::MAX } else { (1u64 << rem) - 1 };
        Ok(Self {
            k: k as u16,
            bits_per_char,
            n_words: used_bits.div_ceil(64) as u8,
            top_mask,
        })
    }

    /// Shape for `k` characters of the given alphabet.
    pub fn for_alphabet(k: usize, alphabet: &Alphabet) -> Result<Self> {
        Self::new(k, alphabet.bits_per_char)
    }

    pub fn k(&self) -> usize {
        self.k as usize
    }

    pub fn bits_per_char(&self) -> u8 {
        self.bits_per_char
    }

    pub fn n_words(&self) -> usize {
        self.n_words as usize
    }

    pub fn total_bits(&self) -> usize {
        self.k as usize * self.bits_per_char as usize
    }

    /// Serialized width of one k-mer of this shape.
    pub fn n_bytes(&self) -> usize {
        self.n_words() * 8
    }
}

/// A packed k-mer value
///
/// Plain `Copy` data; cloning a k-mer severs any tie to the sequence it was
/// read from.
#[derive(Clone, Copy, Debug)]
pub struct Kmer {
    spec: KmerSpec,
    words: [u64; MAX_KMER_WORDS],
}

impl Kmer {
    /// An empty (all-zero) value of the given shape.
    pub fn new(spec: KmerSpec) -> Self {
        Self {
            spec,
            words: [0; MAX_KMER_WORDS],
        }
    }

    /// Builds a value from raw storage words, masking the padding bits.
    ///
    /// # Panics
    ///
    /// Panics if `words.len()` differs from the spec's word count.
    pub fn from_words(spec: KmerSpec, words: &[u64]) -> Self {
        assert_eq!(words.len(), spec.n_words());
        let mut out = Self::new(spec);
        out.words[..words.len()].copy_from_slice(words);
        out.words[spec.n_words() - 1] &= spec.top_mask;
        out
    }

    /// Packs exactly `k` ASCII characters. Returns `None` if the input
    /// contains a character outside the alphabet or has the wrong length
    /// (ignorable bytes such as newlines are skipped, not counted).
    pub fn from_ascii(spec: KmerSpec, alphabet: &Alphabet, seq: &[u8]) -> Option<Self> {
        let mut kmer = Self::new(spec);
        let mut n = 0usize;
        for &c in seq {
            match alphabet.code(c) {
                SKIP_CODE => continue,
                INVALID_CODE => return None,
                code => {
                    kmer.append(code);
                    n += 1;
                }
            }
        }
        (n == spec.k()).then_some(kmer)
    }

    pub fn spec(&self) -> KmerSpec {
        self.spec
    }

    /// The used storage words, least significant first.
    pub fn words(&self) -> &[u64] {
        &self.words[..self.spec.n_words()]
    }

    /// Resets the value to all zeros.
    pub fn clear(&mut self) {
        self.words = [0; MAX_KMER_WORDS];
    }

    /// Rolls one character into the window: shifts the array left by one
    /// group, ORs the code into the low bits, clears the padding.
    #[inline]
    pub fn append(&mut self, code: u8) {
        let b = self.spec.bits_per_char as u32;
        let n = self.spec.n_words();
        for i in (1..n).rev() {
            self.words[i] = (self.words[i] << b) | (self.words[i - 1] >> (64 - b));
        }
        self.words[0] = (self.words[0] << b) | u64::from(code);
        self.words[n - 1] &= self.spec.top_mask;
    }

    /// Reads the group at an absolute bit offset, possibly straddling a word
    /// boundary.
    #[inline]
    fn get_group(&self, bit: usize) -> u64 {
        let b = self.spec.bits_per_char as u32;
        let mask = (1u64 << b) - 1;
        let w = bit / 64;
        let off = (bit % 64) as u32;
        let mut g = self.words[w] >> off;
        if off + b > 64 {
            g |= self.words[w + 1] << (64 - off);
        }
        g & mask
    }

    /// ORs a group into zeroed storage at an absolute bit offset.
    #[inline]
    fn set_group(words: &mut [u64; MAX_KMER_WORDS], bit: usize, b: u32, g: u64) {
        let w = bit / 64;
        let off = (bit % 64) as u32;
        words[w] |= g << off;
        if off + b > 64 {
            words[w + 1] |= g >> (64 - off);
        }
    }

    /// Reverses the character order of the window.
    pub fn reverse(&self) -> Kmer {
        let words = match self.spec.bits_per_char {
            2 | 4 | 8 => self.reverse_words_swar(),
            _ => self.reverse_words_serial(),
        };
        Kmer {
            spec: self.spec,
            words,
        }
    }

    /// Reverses the window and complements every character.
    pub fn reverse_complement(&self, alphabet: &Alphabet) -> Kmer {
        debug_assert_eq!(alphabet.bits_per_char, self.spec.bits_per_char);
        if self.spec.bits_per_char == 2 && alphabet.xor_complement {
            // Complement is bitwise negation of every group, so negate the
            // whole array and reuse the word-parallel reversal.
            let mut c = *self;
            let n = self.spec.n_words();
            for w in &mut c.words[..n] {
                *w = !*w;
            }
            c.words[n - 1] &= self.spec.top_mask;
            return c.reverse();
        }
        let b = self.spec.bits_per_char as u32;
        let k = self.spec.k();
        let mut words = [0u64; MAX_KMER_WORDS];
        for j in 0..k {
            let g = self.get_group((k - 1 - j) * b as usize);
            let c = alphabet.complement(g as u8);
            Self::set_group(&mut words, j * b as usize, b, u64::from(c));
        }
        Kmer {
            spec: self.spec,
            words,
        }
    }

    /// Word-parallel reversal for group widths dividing 8: word swap, byte
    /// swap, in-word group swap, then a right shift to drop the padding that
    /// the full-array reversal moved to the bottom.
    fn reverse_words_swar(&self) -> [u64; MAX_KMER_WORDS] {
        let n = self.spec.n_words();
        let b = self.spec.bits_per_char;
        let mut out = [0u64; MAX_KMER_WORDS];
        for i in 0..n {
            out[i] = reverse_groups_u64(self.words[n - 1 - i], b);
        }
        let pad = (n * 64 - self.spec.total_bits()) as u32;
        if pad > 0 {
            for i in 0..n - 1 {
                out[i] = (out[i] >> pad) | (out[i + 1] << (64 - pad));
            }
            out[n - 1] >>= pad;
        }
        out[n - 1] &= self.spec.top_mask;
        out
    }

    /// Group-at-a-time reversal; correct for every supported width.
    fn reverse_words_serial(&self) -> [u64; MAX_KMER_WORDS] {
        let b = self.spec.bits_per_char as u32;
        let k = self.spec.k();
        let mut words = [0u64; MAX_KMER_WORDS];
        for j in 0..k {
            let g = self.get_group((k - 1 - j) * b as usize);
            Self::set_group(&mut words, j * b as usize, b, g);
        }
        words
    }

    /// Stable, well-spread hash over the value bytes; identical on every
    /// rank, used to derive the owning rank of a key.
    pub fn partition_hash(&self) -> u64 {
        let state = ahash::RandomState::with_seeds(
            PARTITION_SEEDS[0],
            PARTITION_SEEDS[1],
            PARTITION_SEEDS[2],
            PARTITION_SEEDS[3],
        );
        let mut h = state.build_hasher();
        h.write(cast_slice(self.words()));
        h.finish()
    }

    /// Decodes the window back to its ASCII characters.
    pub fn decode(&self, alphabet: &Alphabet) -> String {
        let b = self.spec.bits_per_char as usize;
        let k = self.spec.k();
        let mut s = String::with_capacity(k);
        for i in 0..k {
            let g = self.get_group((k - 1 - i) * b);
            s.push(alphabet.to_ascii(g as u8) as char);
        }
        s
    }
}

/// Reverses the fixed-width bit groups of a single word.
#[inline]
fn reverse_groups_u64(x: u64, bits_per_char: u8) -> u64 {
    let x = x.swap_bytes();
    match bits_per_char {
        8 => x,
        4 => ((x & 0x0F0F_0F0F_0F0F_0F0F) << 4) | ((x >> 4) & 0x0F0F_0F0F_0F0F_0F0F),
        2 => {
            let x = ((x & 0x0F0F_0F0F_0F0F_0F0F) << 4) | ((x >> 4) & 0x0F0F_0F0F_0F0F_0F0F);
            ((x & 0x3333_3333_3333_3333) << 2) | ((x >> 2) & 0x3333_3333_3333_3333)
        }
        w => unreachable!("no word-parallel reversal for {w}-bit groups"),
    }
}

impl PartialEq for Kmer {
    fn eq(&self, other: &Self) -> bool {
        debug_assert_eq!(self.spec, other.spec);
        self.words == other.words
    }
}

impl Eq for Kmer {}

impl PartialOrd for Kmer {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Kmer {
    /// Unsigned comparison from the most significant word down. With the
    /// append layout this coincides with character-wise lexicographic order.
    fn cmp(&self, other: &Self) -> Ordering {
        debug_assert_eq!(self.spec, other.spec);
        for i in (0..MAX_KMER_WORDS).rev() {
            match self.words[i].cmp(&other.words[i]) {
                Ordering::Equal => continue,
                ord => return ord,
            }
        }
        Ordering::Equal
    }
}

impl Hash for Kmer {
    fn hash<H: Hasher>(&self, state: &mut H) {
        state.write(cast_slice(self.words()));
    }
}

#[cfg(test)]
mod testing {
    use super::*;
    use crate::alphabet::{DNA, DNA16, DNA5, PROTEIN};

    /// Builds a k-mer by appending a deterministic but irregular code
    /// pattern, for widths that have no shipped alphabet.
    fn patterned(spec: KmerSpec) -> Kmer {
        let max = 1u64 << spec.bits_per_char();
        let mut kmer = Kmer::new(spec);
        for i in 0..spec.k() as u64 {
            kmer.append(((i * 7 + 3) % max) as u8);
        }
        kmer
    }

    #[test]
    fn test_rolling_append_dna() {
        // k=4 over {A=0,C=1,G=2,T=3}; the window over "ACGTAC" takes the
        // values ACGT, CGTA, GTAC.
        let spec = KmerSpec::new(4, 2).unwrap();
        let mut kmer = Kmer::new(spec);
        let expected = [0b00011011u64, 0b01101100, 0b10110001];
        let mut seen = Vec::new();
        for (i, &c) in b"ACGTAC".iter().enumerate() {
            kmer.append(DNA.code(c));
            if i >= 3 {
                seen.push(kmer.words()[0]);
            }
        }
        assert_eq!(seen, expected);
    }

    #[test]
    fn test_append_matches_from_ascii() {
        let spec = KmerSpec::for_alphabet(4, &DNA).unwrap();
        let direct = Kmer::from_ascii(spec, &DNA, b"GTAC").unwrap();
        assert_eq!(direct.words()[0], 0b10110001);
    }

    #[test]
    fn test_reverse_and_complement_dna() {
        let spec = KmerSpec::for_alphabet(4, &DNA).unwrap();
        let kmer = Kmer::from_ascii(spec, &DNA, b"ACGT").unwrap();

        let rev = kmer.reverse();
        assert_eq!(rev, Kmer::from_ascii(spec, &DNA, b"TGCA").unwrap());
        assert_eq!(rev.decode(&DNA), "TGCA");

        // ACGT is its own reverse complement
        let rc = kmer.reverse_complement(&DNA);
        assert_eq!(rc, kmer);
    }

    #[test]
    fn test_reverse_longer_dna() {
        let spec = KmerSpec::for_alphabet(21, &DNA).unwrap();
        let fwd = Kmer::from_ascii(spec, &DNA, b"ACGTACGTTGCAACGTACGTT").unwrap();
        let rev = Kmer::from_ascii(spec, &DNA, b"TTGCATGCAACGTTGCATGCA").unwrap();
        assert_eq!(fwd.reverse(), rev);
    }

    /// Raw word vectors for the 112-bit value 0xabba56781234deadbeef01c0ffee
    /// and its group reversals, originally derived from a bignum reference.
    #[test]
    fn test_reverse_raw_words_2bit() {
        let spec = KmerSpec::new(56, 2).unwrap();
        let kmer = Kmer::from_words(spec, &[0xdeadbeef01c0ffee, 0x0000abba56781234]);
        let expected = Kmer::from_words(spec, &[0x7ab71c842d95aeea, 0x0000bbff0340fbbe]);
        assert_eq!(kmer.reverse(), expected);
        assert_eq!(kmer.reverse().reverse(), kmer);
    }

    #[test]
    fn test_reverse_raw_words_4bit() {
        let spec = KmerSpec::new(28, 4).unwrap();
        let kmer = Kmer::from_words(spec, &[0xdeadbeef01c0ffee, 0x0000abba56781234]);
        let expected = Kmer::from_words(spec, &[0xdaed43218765abba, 0x0000eeff0c10feeb]);
        assert_eq!(kmer.reverse(), expected);
    }

    #[test]
    fn test_reverse_raw_words_7bit() {
        let spec = KmerSpec::new(16, 7).unwrap();
        let kmer = Kmer::from_words(spec, &[0xdeadbeef01c0ffee, 0x0000abba56781234]);
        let expected = Kmer::from_words(spec, &[0xd6bda6440cf2b755, 0x0000ddfc18ee1777]);
        assert_eq!(kmer.reverse(), expected);
    }

    #[test]
    fn test_swar_and_serial_reversal_agree() {
        for (k, bpc) in [(31usize, 2u8), (56, 2), (13, 4), (28, 4), (7, 8), (16, 8)] {
            let spec = KmerSpec::new(k, bpc).unwrap();
            let kmer = patterned(spec);
            assert_eq!(
                kmer.reverse_words_swar(),
                kmer.reverse_words_serial(),
                "k={k} bpc={bpc}"
            );
        }
    }

    #[test]
    fn test_double_reverse_identity_all_widths() {
        for (k, bpc) in [
            (31usize, 2u8),
            (21, 3),
            (43, 3),
            (15, 4),
            (12, 5),
            (25, 5),
            (9, 7),
            (7, 8),
        ] {
            let spec = KmerSpec::new(k, bpc).unwrap();
            let kmer = patterned(spec);
            assert_eq!(kmer.reverse().reverse(), kmer, "k={k} bpc={bpc}");
        }
    }

    #[test]
    fn test_double_reverse_complement_identity() {
        let spec = KmerSpec::for_alphabet(17, &DNA).unwrap();
        let kmer = Kmer::from_ascii(spec, &DNA, b"ACGGTTACGTAACCGGT").unwrap();
        assert_eq!(kmer.reverse_complement(&DNA).reverse_complement(&DNA), kmer);

        let spec5 = KmerSpec::for_alphabet(11, &DNA5).unwrap();
        let kmer5 = Kmer::from_ascii(spec5, &DNA5, b"ACGNTTACGTN").unwrap();
        assert_eq!(
            kmer5.reverse_complement(&DNA5).reverse_complement(&DNA5),
            kmer5
        );

        let spec16 = KmerSpec::for_alphabet(9, &DNA16).unwrap();
        let kmer16 = Kmer::from_ascii(spec16, &DNA16, b"ACGRYSWTN").unwrap();
        assert_eq!(
            kmer16.reverse_complement(&DNA16).reverse_complement(&DNA16),
            kmer16
        );
    }

    #[test]
    fn test_reverse_complement_dna5() {
        let spec = KmerSpec::for_alphabet(5, &DNA5).unwrap();
        let kmer = Kmer::from_ascii(spec, &DNA5, b"ACGTN").unwrap();
        assert_eq!(
            kmer.reverse_complement(&DNA5),
            Kmer::from_ascii(spec, &DNA5, b"NACGT").unwrap()
        );
    }

    #[test]
    fn test_protein_reverse() {
        let spec = KmerSpec::for_alphabet(6, &PROTEIN).unwrap();
        let kmer = Kmer::from_ascii(spec, &PROTEIN, b"MKVLYA").unwrap();
        assert_eq!(kmer.reverse().decode(&PROTEIN), "AYLVKM");
    }

    #[test]
    fn test_padding_stays_clear() {
        // 43 * 3 = 129 bits: three words, one used bit in the top word.
        let spec = KmerSpec::new(43, 3).unwrap();
        let mut kmer = patterned(spec);
        assert_eq!(kmer.words()[2] & !1, 0);
        kmer.append(6);
        assert_eq!(kmer.words()[2] & !1, 0);
        let rev = kmer.reverse();
        assert_eq!(rev.words()[2] & !1, 0);
    }

    #[test]
    fn test_from_words_masks_padding() {
        let spec = KmerSpec::new(4, 2).unwrap();
        let kmer = Kmer::from_words(spec, &[u64::MAX]);
        assert_eq!(kmer.words()[0], 0xFF);
    }

    #[test]
    fn test_ordering_matches_string_order() {
        let spec = KmerSpec::for_alphabet(4, &DNA).unwrap();
        let acgt = Kmer::from_ascii(spec, &DNA, b"ACGT").unwrap();
        let actt = Kmer::from_ascii(spec, &DNA, b"ACTT").unwrap();
        let tttt = Kmer::from_ascii(spec, &DNA, b"TTTT").unwrap();
        assert!(acgt < actt);
        assert!(actt < tttt);
        assert!(acgt == acgt);
        assert!(tttt > acgt);

        // multi-word ordering follows the leading characters
        let long = KmerSpec::for_alphabet(40, &DNA).unwrap();
        let a = Kmer::from_ascii(long, &DNA, b"AACGTACGTACGTACGTACGTACGTACGTACGTACGTACG").unwrap();
        let b = Kmer::from_ascii(long, &DNA, b"CAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAA").unwrap();
        assert!(a < b);
    }

    #[test]
    fn test_from_ascii_rejects_invalid() {
        let spec = KmerSpec::for_alphabet(4, &DNA).unwrap();
        assert!(Kmer::from_ascii(spec, &DNA, b"ACNT").is_none());
        assert!(Kmer::from_ascii(spec, &DNA, b"ACG").is_none());
        // newlines are skipped, not counted
        assert!(Kmer::from_ascii(spec, &DNA, b"AC\nGT").is_some());
    }

    #[test]
    fn test_spec_rejects_overflow() {
        assert!(matches!(
            KmerSpec::new(129, 2),
            Err(Error::Overflow { .. })
        ));
        assert!(matches!(KmerSpec::new(52, 5), Err(Error::Overflow { .. })));
        assert!(KmerSpec::new(128, 2).is_ok());
    }

    #[test]
    fn test_spec_rejects_unsupported_width() {
        assert!(matches!(
            KmerSpec::new(10, 6),
            Err(Error::UnsupportedWidth(6))
        ));
        assert!(matches!(
            KmerSpec::new(10, 1),
            Err(Error::UnsupportedWidth(1))
        ));
    }

    #[test]
    fn test_partition_hash_is_spread() {
        // All 4^8 DNA 8-mers across 4 buckets: each bucket should hold
        // roughly a quarter.
        let spec = KmerSpec::for_alphabet(8, &DNA).unwrap();
        let mut buckets = [0usize; 4];
        for v in 0..(1u32 << 16) {
            let mut kmer = Kmer::new(spec);
            for i in 0..8 {
                kmer.append(((v >> (2 * i)) & 0b11) as u8);
            }
            buckets[(kmer.partition_hash() % 4) as usize] += 1;
        }
        let mean = (1usize << 16) / 4;
        for (i, &count) in buckets.iter().enumerate() {
            assert!(
                count > mean / 2 && count < mean * 3 / 2,
                "bucket {i} holds {count} of {mean} expected"
            );
        }
    }

    #[test]
    fn test_partition_hash_deterministic() {
        let spec = KmerSpec::for_alphabet(12, &DNA).unwrap();
        let a = Kmer::from_ascii(spec, &DNA, b"ACGTACGTACGT").unwrap();
        let b = Kmer::from_ascii(spec, &DNA, b"ACGTACGTACGT").unwrap();
        assert_eq!(a.partition_hash(), b.partition_hash());
    }

    #[test]
    fn test_decode_round_trip() {
        let spec = KmerSpec::for_alphabet(10, &DNA).unwrap();
        let kmer = Kmer::from_ascii(spec, &DNA, b"ACGTTGCAAC").unwrap();
        assert_eq!(kmer.decode(&DNA), "ACGTTGCAAC");
    }

    #[test]
    fn test_randomized_reversal_properties() {
        use rand::rngs::StdRng;
        use rand::{Rng, SeedableRng};

        let mut rng = StdRng::seed_from_u64(0x5eed);
        for _ in 0..200 {
            let bpc = [2u8, 3, 4, 5, 7, 8][rng.gen_range(0..6)];
            let max_k = MAX_KMER_WORDS * 64 / bpc as usize;
            let k = rng.gen_range(1..=max_k);
            let spec = KmerSpec::new(k, bpc).unwrap();

            let mut kmer = Kmer::new(spec);
            let mut codes = Vec::with_capacity(k);
            for _ in 0..k {
                let code = rng.gen_range(0..(1u64 << bpc)) as u8;
                codes.push(code);
                kmer.append(code);
            }

            // reversal mirrors the appended codes
            let mut mirrored = Kmer::new(spec);
            for &code in codes.iter().rev() {
                mirrored.append(code);
            }
            assert_eq!(kmer.reverse(), mirrored, "k={k} bpc={bpc}");
            assert_eq!(kmer.reverse().reverse(), kmer, "k={k} bpc={bpc}");

            // both reversal paths agree bit for bit
            if matches!(bpc, 2 | 4 | 8) {
                assert_eq!(kmer.reverse_words_swar(), kmer.reverse_words_serial());
            }
        }
    }
}
