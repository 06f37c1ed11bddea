//! Rolling k-mer emission over sequence records
//!
//! [`KmerWindows`] walks one record and yields `(k-mer, offset, quality)`
//! for every full window, pulling rather than pushing so the caller decides
//! where emissions go. A character outside the alphabet breaks the window:
//! nothing spanning it is emitted, accumulation restarts behind it, and the
//! incident is visible only as a counter. Ignorable bytes (the newlines of a
//! multi-line FASTA sequence) are passed over without breaking the window
//! and without consuming a character offset.

use crate::alphabet::{Alphabet, INVALID_CODE, SKIP_CODE};
use crate::format::SequenceRecord;
use crate::kmer::{Kmer, KmerSpec};
use crate::quality::{QualityWindow, SangerEncoder};

/// One emitted window
#[derive(Debug, Clone, Copy)]
pub struct KmerHit {
    pub kmer: Kmer,
    /// Character offset of the window start within the read.
    pub offset: u32,
    /// Combined log2 correctness probability of the window; zero when the
    /// record carries no quality line.
    pub quality: f64,
}

/// Pull iterator over the k-mer windows of one record
pub struct KmerWindows<'a> {
    seq: &'a [u8],
    qual: Option<&'a [u8]>,
    alphabet: &'static Alphabet,
    encoder: &'a SangerEncoder,
    kmer: Kmer,
    window: QualityWindow,
    /// Byte cursor into `seq`.
    pos: usize,
    /// Character offset of the next character (ignorable bytes excluded).
    char_pos: usize,
    /// Valid characters accumulated since the last window break.
    filled: usize,
    invalid_chars: u64,
}

impl<'a> KmerWindows<'a> {
    pub fn new(
        record: &SequenceRecord<'a>,
        spec: KmerSpec,
        alphabet: &'static Alphabet,
        encoder: &'a SangerEncoder,
    ) -> Self {
        debug_assert_eq!(alphabet.bits_per_char, spec.bits_per_char());
        Self {
            seq: record.seq,
            qual: record.qual,
            alphabet,
            encoder,
            kmer: Kmer::new(spec),
            window: QualityWindow::new(spec.k()),
            pos: 0,
            char_pos: 0,
            filled: 0,
            invalid_chars: 0,
        }
    }

    /// Characters skipped because they were outside the alphabet.
    pub fn invalid_chars(&self) -> u64 {
        self.invalid_chars
    }
}

impl Iterator for KmerWindows<'_> {
    type Item = KmerHit;

    fn next(&mut self) -> Option<KmerHit> {
        let k = self.kmer.spec().k();
        while self.pos < self.seq.len() {
            let byte = self.seq[self.pos];
            let qual_byte = self.qual.map(|q| q[self.pos]);
            self.pos += 1;

            match self.alphabet.code(byte) {
                SKIP_CODE => continue,
                INVALID_CODE => {
                    self.invalid_chars += 1;
                    self.filled = 0;
                    self.kmer.clear();
                    self.window.clear();
                    self.char_pos += 1;
                }
                code => {
                    self.kmer.append(code);
                    if let Some(q) = qual_byte {
                        self.window.push(self.encoder.log_prob(q));
                    }
                    self.char_pos += 1;
                    self.filled += 1;
                    if self.filled >= k {
                        return Some(KmerHit {
                            kmer: self.kmer,
                            offset: (self.char_pos - k) as u32,
                            quality: if self.qual.is_some() {
                                self.window.score()
                            } else {
                                0.0
                            },
                        });
                    }
                }
            }
        }
        None
    }
}

#[cfg(test)]
mod testing {
    use super::*;
    use crate::alphabet::DNA;
    use crate::format::ReadId;

    fn record<'a>(seq: &'a [u8], qual: Option<&'a [u8]>) -> SequenceRecord<'a> {
        SequenceRecord {
            id: ReadId {
                file_id: 0,
                ordinal: 0,
                offset: 0,
            },
            header: b"test",
            seq,
            qual,
        }
    }

    fn hits(seq: &[u8], qual: Option<&[u8]>, k: usize) -> (Vec<KmerHit>, u64) {
        let spec = KmerSpec::for_alphabet(k, &DNA).unwrap();
        let encoder = SangerEncoder::new();
        let rec = record(seq, qual);
        let mut windows = KmerWindows::new(&rec, spec, &DNA, &encoder);
        let mut out = Vec::new();
        for hit in windows.by_ref() {
            out.push(hit);
        }
        (out, windows.invalid_chars())
    }

    #[test]
    fn test_emission_count_and_offsets() {
        let (out, invalid) = hits(b"ACGTACGTAC", None, 4);
        assert_eq!(out.len(), 10 - 4 + 1);
        assert_eq!(invalid, 0);
        for (i, hit) in out.iter().enumerate() {
            assert_eq!(hit.offset as usize, i);
        }
    }

    #[test]
    fn test_emitted_values_roll() {
        let spec = KmerSpec::for_alphabet(4, &DNA).unwrap();
        let (out, _) = hits(b"ACGTAC", None, 4);
        assert_eq!(out.len(), 3);
        assert_eq!(out[0].kmer, Kmer::from_ascii(spec, &DNA, b"ACGT").unwrap());
        assert_eq!(out[1].kmer, Kmer::from_ascii(spec, &DNA, b"CGTA").unwrap());
        assert_eq!(out[2].kmer, Kmer::from_ascii(spec, &DNA, b"GTAC").unwrap());
    }

    #[test]
    fn test_short_record_emits_nothing() {
        let (out, _) = hits(b"ACG", None, 4);
        assert!(out.is_empty());
    }

    #[test]
    fn test_invalid_character_breaks_window() {
        // no window may span the N; emission restarts after it
        let spec = KmerSpec::for_alphabet(3, &DNA).unwrap();
        let (out, invalid) = hits(b"ACGTNACGT", None, 3);
        assert_eq!(invalid, 1);
        assert_eq!(out.len(), 4);
        let offsets: Vec<u32> = out.iter().map(|h| h.offset).collect();
        assert_eq!(offsets, vec![0, 1, 5, 6]);
        assert_eq!(out[2].kmer, Kmer::from_ascii(spec, &DNA, b"ACG").unwrap());
    }

    #[test]
    fn test_consecutive_invalid_characters() {
        let (out, invalid) = hits(b"ACNNNGT", None, 2);
        assert_eq!(invalid, 3);
        let offsets: Vec<u32> = out.iter().map(|h| h.offset).collect();
        assert_eq!(offsets, vec![0, 5]);
    }

    #[test]
    fn test_quality_follows_window() {
        let encoder = SangerEncoder::new();
        let (out, _) = hits(b"ACGTA", Some(b"IJKLM"), 3);
        assert_eq!(out.len(), 3);
        for (i, hit) in out.iter().enumerate() {
            let expected: f64 = b"IJKLM"[i..i + 3]
                .iter()
                .map(|&c| encoder.log_prob(c))
                .sum();
            assert!((hit.quality - expected).abs() < 1e-9);
        }
    }

    #[test]
    fn test_quality_window_resets_on_invalid() {
        // the '!' under the N never leaks into a later window
        let encoder = SangerEncoder::new();
        let (out, _) = hits(b"ACNGTA", Some(b"II!JKL"), 2);
        let offsets: Vec<u32> = out.iter().map(|h| h.offset).collect();
        assert_eq!(offsets, vec![0, 3, 4]);
        assert!(out.iter().all(|h| h.quality.is_finite()));
        let expected: f64 = [b'J', b'K'].iter().map(|&c| encoder.log_prob(c)).sum();
        assert!((out[1].quality - expected).abs() < 1e-9);
    }

    #[test]
    fn test_newlines_skipped_without_breaking() {
        // multi-line FASTA sequence: the window crosses the line boundary
        let spec = KmerSpec::for_alphabet(4, &DNA).unwrap();
        let (out, invalid) = hits(b"ACG\nTAC\n", None, 4);
        assert_eq!(invalid, 0);
        assert_eq!(out.len(), 3);
        assert_eq!(out[0].kmer, Kmer::from_ascii(spec, &DNA, b"ACGT").unwrap());
        assert_eq!(out[0].offset, 0);
        assert_eq!(out[2].offset, 2);
    }

    #[test]
    fn test_fasta_quality_defaults_to_zero() {
        let (out, _) = hits(b"ACGT", None, 4);
        assert_eq!(out[0].quality, 0.0);
    }
}
