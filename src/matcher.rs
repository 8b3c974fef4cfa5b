use anyhow::Result;
use custom_error::custom_error;
use std::sync::Arc;

use crate::sequence::{self, hamming_distance, sequence_mask};

custom_error! {pub MatcherError
    BadBase{sequence: String} = "Barcode {sequence} contains a base outside of ACGT.  Valid barcodes may not contain N or ambiguity codes",
    LengthMismatch{sequence: String, expected: usize} = "Barcode {sequence} does not match the dictionary length of {expected} bases",
    LabelCount{labels: usize, barcodes: usize} = "{labels} labels were supplied for {barcodes} barcodes",
    Empty = "Barcode dictionary is empty",
}

/// Sentinel match index for a query with no dictionary entry within the mismatch bound
pub const NO_MATCH: u64 = u64::MAX;
/// Sentinel for a distance that is unknown or outside the mismatch bound.  Distances are
/// carried in 6 bits so 63 is reserved
pub const UNKNOWN_DIST: u8 = 63;

/// An immutable dictionary of valid barcodes, packed 2 bits per base, with one label per
/// barcode.  Labels default to the barcode sequence itself when none are supplied
#[derive(Debug)]
pub struct BarcodeSet {
    bases: usize,
    words: Vec<u64>,
    labels: Arc<Vec<String>>,
}

impl BarcodeSet {
    /// Packs and validates a barcode dictionary.  All sequences must share one length of
    /// at most 32 bases and contain only A, C, G, and T
    pub fn new<S, L>(sequences: &[S], labels: Option<&[L]>) -> Result<Self>
    where
        S: AsRef<str>,
        L: AsRef<str>,
    {
        let bases = sequences.first().ok_or(MatcherError::Empty)?.as_ref().len();
        let mut words = Vec::with_capacity(sequences.len());
        for sequence in sequences {
            let sequence = sequence.as_ref();
            if sequence.len() != bases {
                return Err(MatcherError::LengthMismatch {
                    sequence: sequence.to_string(),
                    expected: bases,
                }
                .into());
            }
            let (word, n_flags) = sequence::encode(sequence)?;
            if n_flags != 0 {
                return Err(MatcherError::BadBase {
                    sequence: sequence.to_string(),
                }
                .into());
            }
            words.push(word);
        }
        let labels = match labels {
            Some(labels) => {
                if labels.len() != sequences.len() {
                    return Err(MatcherError::LabelCount {
                        labels: labels.len(),
                        barcodes: sequences.len(),
                    }
                    .into());
                }
                labels.iter().map(|label| label.as_ref().to_string()).collect()
            }
            None => sequences
                .iter()
                .map(|sequence| sequence.as_ref().to_string())
                .collect(),
        };
        Ok(BarcodeSet {
            bases,
            words,
            labels: Arc::new(labels),
        })
    }

    /// Barcode length in bases
    pub fn bases(&self) -> usize {
        self.bases
    }

    /// Number of barcodes in the dictionary
    pub fn len(&self) -> usize {
        self.words.len()
    }

    pub fn is_empty(&self) -> bool {
        self.words.is_empty()
    }

    /// The packed barcode words
    pub fn words(&self) -> &[u64] {
        &self.words
    }

    /// The barcode labels, index aligned with the words
    pub fn labels(&self) -> &[String] {
        &self.labels
    }

    pub(crate) fn shared_labels(&self) -> Arc<Vec<String>> {
        Arc::clone(&self.labels)
    }
}

/// Match results for one chunk of queries against one dictionary.  All vectors share the
/// chunk length, so index i holds the result for query i
pub struct MatchResult {
    /// Dictionary index of the best match, or [NO_MATCH] when nothing fell within bound
    pub matches: Vec<u64>,
    /// Mismatch count to the best match, or [UNKNOWN_DIST]
    pub dist: Vec<u8>,
    /// Mismatch count to the next best dictionary entry, or [UNKNOWN_DIST]
    pub second_best_dist: Vec<u8>,
    labels: Arc<Vec<String>>,
}

impl MatchResult {
    pub(crate) fn new(matches: Vec<u64>, quality: Vec<u16>, labels: Arc<Vec<String>>) -> Self {
        // The wire form packs both distances into 12 bits, best in the low 6
        let dist = quality.iter().map(|packed| (packed & 63) as u8).collect();
        let second_best_dist = quality.iter().map(|packed| (packed >> 6) as u8).collect();
        MatchResult {
            matches,
            dist,
            second_best_dist,
            labels,
        }
    }

    pub fn len(&self) -> usize {
        self.matches.len()
    }

    pub fn is_empty(&self) -> bool {
        self.matches.is_empty()
    }

    /// Label of the best match for query index, or None when the query had no match
    /// within the mismatch bound
    pub fn label(&self, index: usize) -> Option<&str> {
        let best = *self.matches.get(index)?;
        if best == NO_MATCH {
            return None;
        }
        self.labels.get(best as usize).map(String::as_str)
    }
}

/// The query interface shared by the match engines.  Engines are constructed from a
/// dictionary up front and are immutable afterwards, so one engine can be shared across
/// threads by reference for the life of a pipeline
pub trait BarcodeMatcher: Send + Sync {
    /// The dictionary this engine was built over
    fn dictionary(&self) -> &BarcodeSet;

    /// Matches one chunk of packed queries, returning the parallel arrays of best match
    /// index and packed quality.  Query time never errors; a query with no candidate
    /// within bound yields the sentinels instead
    fn match_chunk(&self, words: &[u64], n_flags: &[u64]) -> (Vec<u64>, Vec<u16>);

    /// Barcode length in bases
    fn bases(&self) -> usize {
        self.dictionary().bases()
    }

    /// Matches one chunk and unpacks the wire form into a [MatchResult] carrying the
    /// dictionary labels
    fn match_all(&self, words: &[u64], n_flags: &[u64]) -> MatchResult {
        let (matches, quality) = self.match_chunk(words, n_flags);
        MatchResult::new(matches, quality, self.dictionary().shared_labels())
    }
}

pub(crate) fn pack_quality(dist: u32, second_best_dist: u32) -> u16 {
    let dist = dist.min(UNKNOWN_DIST as u32) as u16;
    let second_best_dist = second_best_dist.min(UNKNOWN_DIST as u32) as u16;
    dist | second_best_dist << 6
}

/// Exhaustive match engine.  Every query is compared against every dictionary entry, so
/// there is no limit on mismatches, but the cost grows with the dictionary.  Best choice
/// under roughly 100 valid barcodes; use [crate::hash::HashMatcher] above that
///
/// # Example
/// ```
/// use barcode_match::matcher::{BarcodeMatcher, ListMatcher};
/// use barcode_match::sequence::encode_range;
///
/// let matcher = ListMatcher::new(&["ATGC", "TGAC"], Some(&["one", "two"][..])).unwrap();
/// let reads = vec!["TCAC".to_string()];
/// let (words, n_flags) = encode_range(&reads, 0, 4);
/// let result = matcher.match_all(&words, &n_flags);
/// assert_eq!(result.matches, vec![1]);
/// assert_eq!(result.dist, vec![1]);
/// assert_eq!(result.label(0), Some("two"));
/// ```
pub struct ListMatcher {
    dictionary: BarcodeSet,
    mask: u64,
}

impl ListMatcher {
    pub fn new<S, L>(sequences: &[S], labels: Option<&[L]>) -> Result<Self>
    where
        S: AsRef<str>,
        L: AsRef<str>,
    {
        let dictionary = BarcodeSet::new(sequences, labels)?;
        let mask = sequence_mask(dictionary.bases());
        Ok(ListMatcher { dictionary, mask })
    }
}

impl BarcodeMatcher for ListMatcher {
    fn dictionary(&self) -> &BarcodeSet {
        &self.dictionary
    }

    fn match_chunk(&self, words: &[u64], n_flags: &[u64]) -> (Vec<u64>, Vec<u16>) {
        let mut matches = Vec::with_capacity(words.len());
        let mut quality = Vec::with_capacity(words.len());
        for (&query, &query_flags) in words.iter().zip(n_flags) {
            let mut best = NO_MATCH;
            let mut best_dist = 64u32;
            let mut second_dist = 64u32;
            for (index, &word) in self.dictionary.words().iter().enumerate() {
                let dist = hamming_distance(query, word, self.mask, query_flags);
                if dist < best_dist {
                    second_dist = best_dist;
                    best_dist = dist;
                    best = index as u64;
                } else if dist < second_dist {
                    // A tie for best lands here, leaving the lowest index as the match
                    // with the runner up distance equal to the best
                    second_dist = dist;
                }
            }
            matches.push(best);
            quality.push(pack_quality(best_dist, second_dist));
        }
        (matches, quality)
    }
}
