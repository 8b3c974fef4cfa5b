use custom_error::custom_error;

custom_error! {pub SequenceError
    BadLength{length: usize} = "Sequence of {length} bases cannot be packed into a 64 bit word.  The maximum is 32 bases",
}

/// Maximum number of bases that fit in one packed word at 2 bits per base
pub const MAX_BASES: usize = 32;

/// Packs a DNA sequence into a 64 bit word, 2 bits per base, along with a flag word
/// marking which positions held an 'N' or any other non-ACGT character.  The base at
/// position i occupies bits 2i..2i+2 with A=0, C=1, G=2, T=3.  Flagged positions pack
/// as 0 and set the low bit of their pair within the flag word so they stay aligned
/// with the sequence word.
///
/// # Example
/// ```
/// use barcode_match::sequence::encode;
///
/// let (word, n_flags) = encode("ACGT").unwrap();
/// assert_eq!(word, 0b11_10_01_00);
/// assert_eq!(n_flags, 0);
///
/// let (_, n_flags) = encode("ANGT").unwrap();
/// assert_eq!(n_flags, 0b00_00_01_00);
/// ```
pub fn encode(sequence: &str) -> Result<(u64, u64), SequenceError> {
    if sequence.len() > MAX_BASES {
        return Err(SequenceError::BadLength {
            length: sequence.len(),
        });
    }
    let mut word = 0u64;
    let mut n_flags = 0u64;
    for (position, base) in sequence.bytes().enumerate() {
        match base {
            b'A' => (),
            b'C' => word |= 1u64 << (2 * position),
            b'G' => word |= 2u64 << (2 * position),
            b'T' => word |= 3u64 << (2 * position),
            _ => n_flags |= 1u64 << (2 * position),
        }
    }
    Ok((word, n_flags))
}

/// Unpacks a 2 bit packed word back into its text sequence.  Any position with its
/// flag bit set decodes as 'N' no matter what the underlying 2 bits hold
pub fn decode(word: u64, n_flags: u64, bases: usize) -> String {
    let mut sequence = String::with_capacity(bases);
    for position in 0..bases {
        if n_flags >> (2 * position) & 1 == 1 {
            sequence.push('N');
            continue;
        }
        sequence.push(match word >> (2 * position) & 3 {
            0 => 'A',
            1 => 'C',
            2 => 'G',
            _ => 'T',
        });
    }
    sequence
}

/// Packs the window [start, end) of every read into one word per read.  Reads shorter
/// than the window have the missing positions flagged, which counts them as guaranteed
/// mismatches during matching instead of panicking on a truncated read
pub fn encode_range(sequences: &[String], start: usize, end: usize) -> (Vec<u64>, Vec<u64>) {
    debug_assert!(end >= start && end - start <= MAX_BASES);
    let mut words = Vec::with_capacity(sequences.len());
    let mut n_flags = Vec::with_capacity(sequences.len());
    for sequence in sequences {
        let bytes = sequence.as_bytes();
        let mut word = 0u64;
        let mut flags = 0u64;
        for (position, source) in (start..end).enumerate() {
            match bytes.get(source) {
                Some(b'A') => (),
                Some(b'C') => word |= 1u64 << (2 * position),
                Some(b'G') => word |= 2u64 << (2 * position),
                Some(b'T') => word |= 3u64 << (2 * position),
                _ => flags |= 1u64 << (2 * position),
            }
        }
        words.push(word);
        n_flags.push(flags);
    }
    (words, n_flags)
}

/// Returns the mask covering the 2k low bits used by a sequence of k bases
pub fn sequence_mask(bases: usize) -> u64 {
    if bases >= MAX_BASES {
        u64::MAX
    } else {
        (1u64 << (2 * bases)) - 1
    }
}

/// Hamming distance between two packed words over the masked positions.  The flag word
/// is the OR of both sequences' N flags so every flagged position counts as exactly one
/// mismatch.  XOR leaves a non-zero bit pair wherever the bases differ; folding the high
/// bit of each pair into the low bit and counting the low bits turns that into a base
/// count
///
/// # Example
/// ```
/// use barcode_match::sequence::{encode, hamming_distance, sequence_mask};
///
/// let (a, a_flags) = encode("ATGC").unwrap();
/// let (b, b_flags) = encode("TTGN").unwrap();
/// let distance = hamming_distance(a, b, sequence_mask(4), a_flags | b_flags);
/// assert_eq!(distance, 2);
/// ```
pub fn hamming_distance(a: u64, b: u64, mask: u64, n_flags: u64) -> u32 {
    let mut mismatches = ((a ^ b) | n_flags) & mask;
    mismatches |= mismatches >> 1;
    (mismatches & 0x5555_5555_5555_5555).count_ones()
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Character level mismatch count with 'N' on either side counting as a mismatch
    fn text_distance(a: &str, b: &str) -> u32 {
        a.chars()
            .zip(b.chars())
            .filter(|(x, y)| x != y || *x == 'N' || *y == 'N')
            .count() as u32
    }

    #[test]
    fn round_trip() {
        for sequence in [
            "",
            "A",
            "ACGT",
            "TTTTTTTTTT",
            "ANGTNCCA",
            "NNNN",
            "ACGTACGTACGTACGTACGTACGTACGTACGT",
        ] {
            let (word, n_flags) = encode(sequence).unwrap();
            assert_eq!(decode(word, n_flags, sequence.len()), sequence);
        }
    }

    #[test]
    fn non_acgt_characters_flagged() {
        let (word, n_flags) = encode("AxG.").unwrap();
        assert_eq!(decode(word, n_flags, 4), "ANGN");
    }

    #[test]
    fn too_long_rejected() {
        let sequence = "A".repeat(33);
        assert!(encode(&sequence).is_err());
    }

    #[test]
    fn distance_matches_text_comparison() {
        let sequences = [
            ("ATGC", "ATGC"),
            ("ATGC", "TGCA"),
            ("ATGC", "ATGN"),
            ("NTGC", "ATGN"),
            ("AAAAAAAAAA", "TTTTTTTTTT"),
            ("ACGTACGTACGTACGTACGTACGTACGTACGT", "TCGTACGTACGTACGTACGTACGTACGTACGA"),
            ("", ""),
        ];
        for (a, b) in sequences {
            let (word_a, flags_a) = encode(a).unwrap();
            let (word_b, flags_b) = encode(b).unwrap();
            let distance =
                hamming_distance(word_a, word_b, sequence_mask(a.len()), flags_a | flags_b);
            assert_eq!(distance, text_distance(a, b), "{} vs {}", a, b);
        }
    }

    #[test]
    fn window_encode_matches_substring_encode() {
        let reads = vec!["CATTAGCGTA".to_string(), "GGCCNATTAC".to_string()];
        let (words, n_flags) = encode_range(&reads, 2, 8);
        for (read, (word, flags)) in reads.iter().zip(words.iter().zip(n_flags.iter())) {
            let (expected_word, expected_flags) = encode(&read[2..8]).unwrap();
            assert_eq!((*word, *flags), (expected_word, expected_flags));
        }
    }

    #[test]
    fn window_past_read_end_is_flagged() {
        let reads = vec!["ACGT".to_string()];
        let (words, n_flags) = encode_range(&reads, 2, 6);
        // GT packs normally, the two missing bases come back as N
        assert_eq!(decode(words[0], n_flags[0], 4), "GTNN");
    }

    #[test]
    fn empty_window_is_always_equal() {
        let reads = vec!["ACGT".to_string(), "TTTT".to_string()];
        let (words, n_flags) = encode_range(&reads, 2, 2);
        let distance = hamming_distance(words[0], words[1], sequence_mask(0), n_flags[0] | n_flags[1]);
        assert_eq!(distance, 0);
    }
}
