//! Mismatch tolerant DNA barcode matching for multiplexed sequencing assays.
//!
//! Reads from single cell and multiplexed libraries carry short barcodes (sample index,
//! cell barcode, UMI, feature tag) that have to be identified against dictionaries of
//! valid sequences while tolerating a bounded number of base substitutions.  Barcodes
//! are packed 2 bits per base into 64 bit words and matched by one of two engines:
//!
//! * [matcher::ListMatcher] scans the whole dictionary per query.  No limit on
//!   mismatches, best for small dictionaries.
//! * [hash::HashMatcher] indexes disjoint sub-sequences of every barcode in their own
//!   hash tables and probes precomputed mismatch neighborhoods, so queries stay fast
//!   against dictionaries of a million valid barcodes.
//!
//! Both report the best match, its mismatch count, and the mismatch count of the
//! runner up, so callers can demand unambiguous hits.
//!
//! [pipeline::FastqPipeline] drives the engines over 2 to 4 synchronized FASTQ files
//! (plain or gzip) in fixed size chunks on a worker pool, publishes the match arrays
//! per chunk, and can write filtered records back out with read names rebuilt from a
//! template of barcode labels and read name attributes.

pub mod hash;
pub mod info;
pub mod io;
pub mod matcher;
pub mod pipeline;
pub mod sequence;

pub use crate::hash::{optimal_subsequences, HashMatcher};
pub use crate::matcher::{
    BarcodeMatcher, BarcodeSet, ListMatcher, MatchResult, NO_MATCH, UNKNOWN_DIST,
};
pub use crate::pipeline::FastqPipeline;
