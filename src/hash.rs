use ahash::AHashMap;
use anyhow::{bail, Result};
use itertools::Itertools;

use crate::matcher::{pack_quality, BarcodeMatcher, BarcodeSet, NO_MATCH};
use crate::sequence::{hamming_distance, sequence_mask};

/// One sub-sequence index.  The base mask selects this partition's bit pairs, the xor
/// deltas enumerate every neighbor of a key within the partition's mismatch radius, and
/// the table maps a masked key to the dictionary indices sharing it
struct Partition {
    base_mask: u64,
    neighbor_xors: Vec<u64>,
    table: AHashMap<u64, Vec<u32>>,
}

/// Multi-index hash match engine after Norouzi et al. (arXiv:1307.2982).  Barcode
/// positions are split across disjoint sub-sequences, each indexed in its own hash
/// table.  Any dictionary entry within the total mismatch bound must agree with a query
/// on some partition to within that partition's smaller radius, so probing each table
/// with a precomputed neighborhood finds every true candidate.  Fast for large
/// dictionaries and small mismatch bounds; for 10x style cell barcodes (16 bases, about
/// a million valid sequences) use max_mismatches 1 with 2 sub-sequences
pub struct HashMatcher {
    dictionary: BarcodeSet,
    max_mismatches: usize,
    mask: u64,
    partitions: Vec<Partition>,
}

impl HashMatcher {
    /// Builds the partition plan, neighbor enumerations, and per-partition tables.  All
    /// of the enumeration work happens here so query time only probes
    pub fn new<S, L>(
        sequences: &[S],
        labels: Option<&[L]>,
        max_mismatches: usize,
        subsequence_count: usize,
    ) -> Result<Self>
    where
        S: AsRef<str>,
        L: AsRef<str>,
    {
        let dictionary = BarcodeSet::new(sequences, labels)?;
        let bases = dictionary.bases();
        if subsequence_count == 0 || subsequence_count > bases {
            bail!(
                "Subsequence count of {} is outside the valid range of 1 through the barcode length of {}",
                subsequence_count,
                bases
            );
        }

        let position_sets = striped_positions(bases, subsequence_count);
        let radii = partition_radii(max_mismatches, subsequence_count);
        let mut partitions = Vec::with_capacity(subsequence_count);
        for (positions, radius) in position_sets.iter().zip(radii) {
            let base_mask = base_mask(positions);
            // A partition handed a radius below zero never probes.  At least one
            // partition always keeps a workable radius, which is what guarantees every
            // true match is still found
            let neighbor_xors = match radius {
                Some(radius) => neighbor_xors(positions, radius),
                None => Vec::new(),
            };
            let mut table: AHashMap<u64, Vec<u32>> = AHashMap::new();
            for (index, &word) in dictionary.words().iter().enumerate() {
                table.entry(word & base_mask).or_default().push(index as u32);
            }
            partitions.push(Partition {
                base_mask,
                neighbor_xors,
                table,
            });
        }

        let mask = sequence_mask(bases);
        Ok(HashMatcher {
            dictionary,
            max_mismatches,
            mask,
            partitions,
        })
    }
}

impl BarcodeMatcher for HashMatcher {
    fn dictionary(&self) -> &BarcodeSet {
        &self.dictionary
    }

    fn match_chunk(&self, words: &[u64], n_flags: &[u64]) -> (Vec<u64>, Vec<u16>) {
        let bound = self.max_mismatches as u32;
        let mut matches = Vec::with_capacity(words.len());
        let mut quality = Vec::with_capacity(words.len());
        // Epoch stamps mark which candidates have been scored for the current query, so
        // a candidate surfacing from several partitions is only scored once and clearing
        // between queries costs nothing
        let mut visited = vec![0u32; self.dictionary.len()];
        let mut epoch = 0u32;
        for (&query, &query_flags) in words.iter().zip(n_flags) {
            epoch += 1;
            let mut best = NO_MATCH;
            let mut best_dist = 64u32;
            let mut second_dist = 64u32;
            for partition in &self.partitions {
                let key = query & partition.base_mask;
                for &delta in &partition.neighbor_xors {
                    if let Some(candidates) = partition.table.get(&(key ^ delta)) {
                        for &candidate in candidates {
                            if visited[candidate as usize] == epoch {
                                continue;
                            }
                            visited[candidate as usize] = epoch;
                            let dist = hamming_distance(
                                query,
                                self.dictionary.words()[candidate as usize],
                                self.mask,
                                query_flags,
                            );
                            // Ties go to the lowest dictionary index, so candidate
                            // discovery order across partitions never shows through
                            if dist < best_dist
                                || (dist == best_dist && (candidate as u64) < best)
                            {
                                second_dist = best_dist;
                                best_dist = dist;
                                best = candidate as u64;
                            } else if dist < second_dist {
                                second_dist = dist;
                            }
                        }
                    }
                }
            }
            // Anything past the bound reports as the sentinels rather than a weak match
            if best_dist > bound {
                best = NO_MATCH;
                best_dist = 64;
            }
            if second_dist > bound {
                second_dist = 64;
            }
            matches.push(best);
            quality.push(pack_quality(best_dist, second_dist));
        }
        (matches, quality)
    }
}

/// Assigns base positions to sub-sequences in stripes, so partition b holds positions
/// b, b+count, b+2*count and so on.  Striping spreads any conserved stretch of the
/// dictionary across partitions instead of concentrating it in one.  Partitions are
/// sorted shortest first so the cheaper probes run before the larger tables
fn striped_positions(bases: usize, subsequence_count: usize) -> Vec<Vec<usize>> {
    let mut position_sets = (0..subsequence_count)
        .map(|first| (first..bases).step_by(subsequence_count).collect::<Vec<usize>>())
        .collect::<Vec<Vec<usize>>>();
    position_sets.sort_by_key(Vec::len);
    position_sets
}

/// Splits the total mismatch bound across sorted partitions.  With a base radius of
/// bound / count and a remainder, the first remainder + 1 partitions probe at the base
/// radius and the rest one lower.  None marks a partition whose radius would fall below
/// zero, which simply never probes
fn partition_radii(max_mismatches: usize, subsequence_count: usize) -> Vec<Option<usize>> {
    let base_radius = max_mismatches / subsequence_count;
    let remainder = max_mismatches % subsequence_count;
    (0..subsequence_count)
        .map(|index| {
            if index <= remainder {
                Some(base_radius)
            } else {
                base_radius.checked_sub(1)
            }
        })
        .collect()
}

/// Mask selecting the bit pairs of the given base positions
fn base_mask(positions: &[usize]) -> u64 {
    positions
        .iter()
        .fold(0u64, |mask, &position| mask | 3u64 << (2 * position))
}

/// Every xor delta that moves a masked key to a neighbor within the mismatch radius:
/// for each subset of up to radius positions, each way of flipping those positions to
/// one of the three other bases.  The count comes to the sum of 3^i * C(positions, i)
/// for i from 0 through radius
fn neighbor_xors(positions: &[usize], radius: usize) -> Vec<u64> {
    let radius = radius.min(positions.len());
    let mut xors = Vec::new();
    for changed in 0..=radius {
        for subset in positions.iter().copied().combinations(changed) {
            for assignment in 0..3usize.pow(changed as u32) {
                let mut delta = 0u64;
                let mut remaining = assignment;
                for &position in &subset {
                    delta |= ((remaining % 3 + 1) as u64)
                        << (2 * position);
                    remaining /= 3;
                }
                xors.push(delta);
            }
        }
    }
    xors
}

/// n choose k without the factorials overflowing
fn choose(n: usize, k: usize) -> f64 {
    if k > n {
        return 0.0;
    }
    let mut product = 1f64;
    for i in 1..=k {
        product *= (n + 1 - i) as f64 / i as f64;
    }
    product
}

/// Modeled probe cost of one partitioning: for every partition, the expected candidate
/// chain length plus one, times the neighborhood size.  Assumes a mismatch check costs
/// about the same as a table probe
fn modeled_cost(
    dictionary_size: usize,
    bases: usize,
    subsequence_count: usize,
    max_mismatches: usize,
) -> f64 {
    let short = bases / subsequence_count;
    let long_count = bases - subsequence_count * short;
    let short_count = subsequence_count - long_count;
    let lengths = (0..short_count)
        .map(|_| short)
        .chain((0..long_count).map(|_| short + 1));
    let base_radius = max_mismatches / subsequence_count;
    let remainder = max_mismatches % subsequence_count;
    lengths
        .enumerate()
        .map(|(index, length)| {
            let radius = if index <= remainder {
                base_radius
            } else {
                match base_radius.checked_sub(1) {
                    Some(radius) => radius,
                    None => return 0.0,
                }
            };
            let probes: f64 = (0..=radius.min(length))
                .map(|changed| 3f64.powi(changed as i32) * choose(length, changed))
                .sum();
            (1.0 + dictionary_size as f64 / 4f64.powi(length as i32)) * probes
        })
        .sum()
}

/// Estimates the sub-sequence count with the lowest modeled probe cost for a dictionary
/// of the given size, barcode length, and mismatch bound, by scanning counts upward
/// until the cost stops improving.  A recommendation only; any count from 1 through the
/// barcode length is valid
///
/// # Example
/// ```
/// use barcode_match::hash::optimal_subsequences;
///
/// assert_eq!(optimal_subsequences(1_000_000, 16, 1), 2);
/// ```
pub fn optimal_subsequences(
    dictionary_size: usize,
    bases: usize,
    max_mismatches: usize,
) -> usize {
    let mut best_cost = modeled_cost(dictionary_size, bases, 1, max_mismatches);
    let mut subsequence_count = 1;
    while subsequence_count < bases {
        let cost = modeled_cost(
            dictionary_size,
            bases,
            subsequence_count + 1,
            max_mismatches,
        );
        if cost < best_cost {
            best_cost = cost;
            subsequence_count += 1;
        } else {
            break;
        }
    }
    subsequence_count
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::matcher::{ListMatcher, MatchResult, UNKNOWN_DIST};
    use crate::sequence::encode_range;
    use rand::rngs::StdRng;
    use rand::seq::SliceRandom;
    use rand::{Rng, SeedableRng};

    fn encode_queries(reads: &[&str], bases: usize) -> (Vec<u64>, Vec<u64>) {
        let reads = reads.iter().map(|read| read.to_string()).collect::<Vec<String>>();
        encode_range(&reads, 0, bases)
    }

    /// Counts mismatched base pairs in a packed xor delta
    fn pair_count(delta: u64) -> u32 {
        let folded = delta | delta >> 1;
        (folded & 0x5555_5555_5555_5555).count_ones()
    }

    #[test]
    fn striped_plan_is_deterministic() {
        assert_eq!(
            striped_positions(10, 3),
            vec![vec![1, 4, 7], vec![2, 5, 8], vec![0, 3, 6, 9]]
        );
        assert_eq!(striped_positions(4, 1), vec![vec![0, 1, 2, 3]]);
    }

    #[test]
    fn radii_split_by_pigeonhole() {
        assert_eq!(partition_radii(10, 3), vec![Some(3), Some(3), Some(2)]);
        assert_eq!(partition_radii(1, 3), vec![Some(0), Some(0), None]);
        assert_eq!(partition_radii(0, 2), vec![Some(0), None]);
    }

    #[test]
    fn neighbor_enumeration_is_complete() {
        // Compare the generated deltas against a brute force sweep of every word whose
        // set pairs sit inside the partition mask and number at most the radius
        let positions = vec![0usize, 2, 3];
        let radius = 2;
        let mask = base_mask(&positions);
        let mut generated = neighbor_xors(&positions, radius);
        generated.sort_unstable();
        let full_bases = 4;
        let mut expected = (0..1u64 << (2 * full_bases))
            .filter(|delta| delta & !mask == 0 && pair_count(*delta) <= radius as u32)
            .collect::<Vec<u64>>();
        expected.sort_unstable();
        assert_eq!(generated, expected);
    }

    #[test]
    fn neighbor_count_follows_formula() {
        // 1 + 3*5 + 9*C(5,2) = 106
        let positions = vec![0usize, 1, 2, 3, 4];
        assert_eq!(neighbor_xors(&positions, 2).len(), 106);
    }

    #[test]
    fn agrees_with_list_matcher_on_basics() {
        let sequences = ["ATGC", "TGAC", "ACAA", "CGAT"];
        let labels = ["one", "two", "three", "four"];
        let matcher = HashMatcher::new(&sequences, Some(&labels[..]), 2, 3).unwrap();
        let (words, n_flags) = encode_queries(&["ATGC", "TCAC", "ACAA", "CAAG"], 4);
        let result = matcher.match_all(&words, &n_flags);
        assert_eq!(result.matches, vec![0, 1, 2, 3]);
        assert_eq!(result.dist, vec![0, 1, 0, 2]);
        let found = (0..result.len())
            .map(|index| result.label(index).unwrap())
            .collect::<Vec<&str>>();
        assert_eq!(found, labels);
    }

    #[test]
    fn all_different_dictionary_still_matches() {
        // Every dictionary entry sits at the full barcode length from the query, which
        // forces the skipped partition path when the per-partition radius runs out
        let sequences = ["AAAAAAAAAA", "TTTTTTTTTT", "GGGGGGGGGG"];
        for subsequence_count in 1..=3 {
            let matcher =
                HashMatcher::new(&sequences, None::<&[&str]>, 10, subsequence_count).unwrap();
            let (words, n_flags) = encode_queries(&["CCCCCCCCCC"], 10);
            let result = matcher.match_all(&words, &n_flags);
            assert_eq!(result.matches, vec![0], "count {}", subsequence_count);
            assert_eq!(result.dist, vec![10], "count {}", subsequence_count);
            assert_eq!(result.second_best_dist, vec![10], "count {}", subsequence_count);
        }
    }

    #[test]
    fn out_of_bound_query_yields_sentinels() {
        let matcher = HashMatcher::new(&["AAAA", "TTTT"], None::<&[&str]>, 1, 2).unwrap();
        let (words, n_flags) = encode_queries(&["GGGG"], 4);
        let result = matcher.match_all(&words, &n_flags);
        assert_eq!(result.matches, vec![NO_MATCH]);
        assert_eq!(result.dist, vec![UNKNOWN_DIST]);
        assert_eq!(result.second_best_dist, vec![UNKNOWN_DIST]);
    }

    #[test]
    fn subsequence_count_must_fit_barcode() {
        assert!(HashMatcher::new(&["ACGT"], None::<&[&str]>, 1, 0).is_err());
        assert!(HashMatcher::new(&["ACGT"], None::<&[&str]>, 1, 5).is_err());
    }

    fn random_sequence(rng: &mut StdRng, bases: usize, alphabet: &[char]) -> String {
        (0..bases).map(|_| *alphabet.choose(rng).unwrap()).collect()
    }

    fn random_mismatches(rng: &mut StdRng, reference: &str, count: usize) -> String {
        let mut bases = reference.chars().collect::<Vec<char>>();
        let mut positions = (0..bases.len()).collect::<Vec<usize>>();
        positions.shuffle(rng);
        for &position in positions.iter().take(count) {
            bases[position] = *['A', 'T', 'G', 'C', 'N'].choose(rng).unwrap();
        }
        bases.into_iter().collect()
    }

    /// The hash engine must agree with the exhaustive engine wherever the true value
    /// falls within bound, and may only substitute sentinels where it does not
    fn assert_results_agree(reference: &MatchResult, result: &MatchResult, bound: u8) {
        for index in 0..reference.len() {
            if reference.dist[index] <= bound {
                assert_eq!(result.matches[index], reference.matches[index]);
                assert_eq!(result.dist[index], reference.dist[index]);
            } else {
                assert_eq!(result.matches[index], NO_MATCH);
                assert_eq!(result.dist[index], UNKNOWN_DIST);
            }
            if reference.second_best_dist[index] <= bound {
                assert_eq!(result.second_best_dist[index], reference.second_best_dist[index]);
            } else {
                assert_eq!(result.second_best_dist[index], UNKNOWN_DIST);
            }
        }
    }

    #[test]
    fn agrees_with_list_matcher_on_random_queries() {
        let mut rng = StdRng::seed_from_u64(88172645463325252);
        let bases = 8;
        let sequences = (0..10)
            .map(|_| random_sequence(&mut rng, bases, &['A', 'T', 'G', 'C']))
            .collect::<Vec<String>>();
        let queries = (0..100)
            .map(|_| {
                let reference = sequences.choose(&mut rng).unwrap().clone();
                let count = rng.gen_range(0..=bases);
                random_mismatches(&mut rng, &reference, count)
            })
            .collect::<Vec<String>>();
        let (words, n_flags) = encode_range(&queries, 0, bases);

        let list_matcher = ListMatcher::new(&sequences, None::<&[&str]>).unwrap();
        let reference = list_matcher.match_all(&words, &n_flags);

        for max_mismatches in 0..bases {
            for subsequence_count in 1..=3 {
                let matcher = HashMatcher::new(
                    &sequences,
                    None::<&[&str]>,
                    max_mismatches,
                    subsequence_count,
                )
                .unwrap();
                let result = matcher.match_all(&words, &n_flags);
                assert_results_agree(&reference, &result, max_mismatches as u8);
            }
        }
    }

    #[test]
    fn cost_model_recommendations() {
        // Large dictionary with a single tolerated mismatch favors two sub-sequences,
        // the published guidance for 10x style barcodes
        assert_eq!(optimal_subsequences(1_000_000, 16, 1), 2);
        assert_eq!(optimal_subsequences(10, 8, 1), 2);
        // Never outside the valid range
        for bases in 1..=16 {
            let recommended = optimal_subsequences(1000, bases, 2);
            assert!(recommended >= 1 && recommended <= bases);
        }
    }
}
