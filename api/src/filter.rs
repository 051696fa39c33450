//! The leaf test: GC%-in-range plus an optional packed substring match.

use crate::error::{KbitError, Result};
use crate::kmer::{encode_kmer, gc_count, reverse_complement, NUC_TO_DIGIT};

/// One precomputed substring occurrence test: `v` matches iff
/// `(v ^ bits) & mask == 0`.
#[derive(Debug, Clone, Copy)]
pub struct Pattern {
    pub mask: u64,
    pub bits: u64,
}

/// Filters applied to every candidate `kout`-mer before emission.
#[derive(Debug, Clone)]
pub struct LeafFilter {
    kout: usize,
    gc_min_pct: u32,
    gc_max_pct: u32,
    patterns: Vec<Pattern>,
    substring_set: bool,
}

impl LeafFilter {
    pub fn new(
        kout: usize,
        gc_min_pct: u32,
        gc_max_pct: u32,
        substring: Option<&str>,
        reverse_complement_too: bool,
    ) -> Result<Self> {
        if gc_min_pct > 100 || gc_max_pct > 100 || gc_min_pct > gc_max_pct {
            return Err(KbitError::BadInput(
                "GC range must satisfy 0 <= gc-min <= gc-max <= 100".to_string(),
            ));
        }

        let mut patterns = Vec::new();
        let mut substring_set = false;
        if let Some(sub) = substring {
            if !sub.is_empty() {
                substring_set = true;
                append_patterns(&mut patterns, sub.as_bytes(), kout)?;
                if reverse_complement_too {
                    let rc = reverse_complement(sub.as_bytes());
                    // A palindromic substring would only duplicate the
                    // forward patterns.
                    if !rc.eq_ignore_ascii_case(sub.as_bytes()) {
                        append_patterns(&mut patterns, &rc, kout)?;
                    }
                }
            }
        }

        Ok(LeafFilter {
            kout,
            gc_min_pct,
            gc_max_pct,
            patterns,
            substring_set,
        })
    }

    /// True when `value` passes both the GC predicate and, if configured,
    /// the substring test. Exact integer arithmetic throughout:
    /// `gc*100` must land in `[gc_min*kout, gc_max*kout]`.
    pub fn accepts(&self, value: u64) -> bool {
        let gc = gc_count(value, self.kout) * 100;
        if gc < self.gc_min_pct * self.kout as u32 || gc > self.gc_max_pct * self.kout as u32 {
            return false;
        }
        if self.substring_set {
            return self
                .patterns
                .iter()
                .any(|p| (value ^ p.bits) & p.mask == 0);
        }
        true
    }

    #[cfg(test)]
    pub(crate) fn pattern_count(&self) -> usize {
        self.patterns.len()
    }
}

/// Builds one `(mask, bits)` pair per alignment of `sub` inside a
/// `kout`-mer.
fn append_patterns(patterns: &mut Vec<Pattern>, sub: &[u8], kout: usize) -> Result<()> {
    let m = sub.len();
    if m > kout {
        return Err(KbitError::BadInput(format!(
            "substring of length {} is longer than the output k={}",
            m, kout
        )));
    }
    for &c in sub {
        if NUC_TO_DIGIT[c as usize] > 3 {
            return Err(KbitError::BadInput(format!(
                "non-ACGT character {:?} in substring",
                char::from(c)
            )));
        }
    }
    let sub_bits = encode_kmer(sub, m)?;
    let base_mask = if m >= 32 { u64::MAX } else { (1u64 << (2 * m)) - 1 };
    for pos in 0..=(kout - m) {
        let shift = 2 * (kout - m - pos);
        patterns.push(Pattern {
            mask: base_mask << shift,
            bits: sub_bits << shift,
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kmer::encode_kmer;

    #[test]
    fn gc_band_is_an_exact_integer_check() {
        // 10 GC out of 18 -> 55.55..%, inside [40, 60] but outside [56, 60].
        let v = encode_kmer(b"CGCGCCAAAATTTTGGGG", 18).unwrap();
        let f = LeafFilter::new(18, 40, 60, None, false).unwrap();
        assert!(f.accepts(v));
        let f = LeafFilter::new(18, 56, 60, None, false).unwrap();
        assert!(!f.accepts(v));
        let f = LeafFilter::new(18, 0, 100, None, false).unwrap();
        assert!(f.accepts(v));
    }

    #[test]
    fn substring_found_at_every_offset() {
        let f = LeafFilter::new(8, 0, 100, Some("CGCG"), false).unwrap();
        assert_eq!(f.pattern_count(), 5);
        for pad in 0..=4 {
            let mut s = vec![b'A'; 8];
            s[pad..pad + 4].copy_from_slice(b"CGCG");
            let v = encode_kmer(&s, 8).unwrap();
            assert!(f.accepts(v), "offset {}", pad);
        }
        assert!(!f.accepts(encode_kmer(b"AAAAAAAA", 8).unwrap()));
        assert!(!f.accepts(encode_kmer(b"CGACGACG", 8).unwrap()));
    }

    #[test]
    fn reverse_complement_adds_patterns() {
        let f = LeafFilter::new(10, 0, 100, Some("CCGCA"), true).unwrap();
        // rc(CCGCA) = TGCGG
        assert!(f.accepts(encode_kmer(b"AATGCGGAAA", 10).unwrap()));
        let f = LeafFilter::new(10, 0, 100, Some("CCGCA"), false).unwrap();
        assert!(!f.accepts(encode_kmer(b"AATGCGGAAA", 10).unwrap()));
    }

    #[test]
    fn palindromic_substring_is_not_duplicated() {
        let fwd = LeafFilter::new(8, 0, 100, Some("ACGT"), false).unwrap();
        let both = LeafFilter::new(8, 0, 100, Some("ACGT"), true).unwrap();
        assert_eq!(fwd.pattern_count(), both.pattern_count());
    }

    #[test]
    fn empty_substring_disables_the_test() {
        let f = LeafFilter::new(8, 0, 100, Some(""), true).unwrap();
        assert!(f.accepts(encode_kmer(b"AAAAAAAA", 8).unwrap()));
    }

    #[test]
    fn oversized_or_invalid_substring_rejected() {
        assert!(matches!(
            LeafFilter::new(4, 0, 100, Some("ACGTA"), false),
            Err(KbitError::BadInput(_))
        ));
        assert!(matches!(
            LeafFilter::new(8, 0, 100, Some("ACNT"), false),
            Err(KbitError::BadInput(_))
        ));
        assert!(matches!(
            LeafFilter::new(8, 60, 40, None, false),
            Err(KbitError::BadInput(_))
        ));
    }
}
