#[cfg(test)]
mod tests {
    use kelpie::kelpie::kmers::*;

    /* --------------------------------------------------------------------- */
    /*  pack / expand round trip                                             */
    /* --------------------------------------------------------------------- */

    #[test]
    fn pack_expand_roundtrip() {
        for s in ["ACGT", "AAAAA", "GATTACA", "TTTTTTTTTTTTTTTT"] {
            let k = s.len();
            let packed = pack(s.as_bytes(), 0, k).unwrap();
            assert_eq!(expand(packed, k), s);
        }
    }

    #[test]
    fn pack_is_left_aligned() {
        // "A" packs to the zero word; "T" to 11 in the top two bits
        assert_eq!(pack(b"A", 0, 1).unwrap(), 0);
        assert_eq!(pack(b"T", 0, 1).unwrap(), 0xC000_0000_0000_0000);
        // Low bits stay zero for k < 32
        let packed = pack(b"ACGTACGT", 0, 8).unwrap();
        assert_eq!(packed & 0x0000_FFFF_FFFF_FFFF, 0);
    }

    #[test]
    fn pack_rejects_bad_windows() {
        assert!(pack(b"ACGN", 0, 4).is_none());
        assert!(pack(b"ACG", 0, 4).is_none()); // over-runs
        assert!(pack(b"ACGT", 2, 4).is_none());
    }

    #[test]
    fn pack_k32_boundary() {
        // Maximum k fills the whole word and must not shift by 64
        let s = "ACGTACGTACGTACGTACGTACGTACGTACGT";
        let packed = pack(s.as_bytes(), 0, 32).unwrap();
        assert_eq!(expand(packed, 32), s);
        assert_eq!(expand(revcomp(packed, 32), 32), revcomp_seq(s));
        assert_eq!(revcomp(revcomp(packed, 32), 32), packed);
    }

    #[test]
    fn incremental_matches_pack() {
        let seq = b"GATTACAGATTACAGATTACAGATTACAGATTACA";
        let k = 12;
        let mut m = pack(seq, 0, k).unwrap();
        for i in 1..=seq.len() - k {
            m = incremental(m, seq[i + k - 1], k).unwrap();
            assert_eq!(m, pack(seq, i, k).unwrap());
        }
    }

    /* --------------------------------------------------------------------- */
    /*  revcomp / canonical invariants                                       */
    /* --------------------------------------------------------------------- */

    #[test]
    fn revcomp_involution() {
        for s in ["ACGTTGCA", "AAAACCCC", "GATTACAGATTACA"] {
            let k = s.len();
            let m = pack(s.as_bytes(), 0, k).unwrap();
            assert_eq!(revcomp(revcomp(m, k), k), m);
            assert_eq!(expand(revcomp(m, k), k), revcomp_seq(s));
        }
    }

    #[test]
    fn canonical_collapses_orientation() {
        for s in ["ACGGTTAC", "TTTTACGT", "GATTACAT", "ACGT"] {
            let k = s.len();
            let m = pack(s.as_bytes(), 0, k).unwrap();
            let rc = revcomp(m, k);
            assert_eq!(canonical(m, k), canonical(rc, k));
            // The canonical form is never larger than its own revcomp
            let c = canonical(m, k);
            assert!(c <= revcomp(c, k));
            assert_eq!(c, m.min(rc));
        }
    }

    /* --------------------------------------------------------------------- */
    /*  substitution variants                                                */
    /* --------------------------------------------------------------------- */

    #[test]
    fn single_subs_cover_every_position() {
        let k = 6;
        let m = pack(b"ACGTAC", 0, k).unwrap();
        let subs = all_single_subs(m, k);
        assert_eq!(subs.len(), 4 * k);
        assert!(subs.contains(&m));
        assert!(subs.contains(&pack(b"TCGTAC", 0, k).unwrap()));
        assert!(subs.contains(&pack(b"ACGTAT", 0, k).unwrap()));
    }

    #[test]
    fn double_subs_include_two_changes() {
        let k = 4;
        let m = pack(b"AAAA", 0, k).unwrap();
        let subs = all_double_subs(m, k);
        assert!(subs.contains(&pack(b"TTAA", 0, k).unwrap()));
        assert!(subs.contains(&m));
        // Deduplicated
        let mut sorted = subs.clone();
        sorted.dedup();
        assert_eq!(sorted.len(), subs.len());
    }

    #[test]
    fn last_base_variants_only_touch_the_end() {
        let k = 5;
        let m = pack(b"ACGTA", 0, k).unwrap();
        let vars = last_base_variants(m, k);
        let expanded: Vec<String> = vars.iter().map(|&v| expand(v, k)).collect();
        assert_eq!(expanded, vec!["ACGTA", "ACGTC", "ACGTG", "ACGTT"]);
    }

    #[test]
    fn successors_shift_one_base() {
        let k = 5;
        let m = pack(b"ACGTA", 0, k).unwrap();
        let succ = successors(m, k);
        let expanded: Vec<String> = succ.iter().map(|&v| expand(v, k)).collect();
        assert_eq!(expanded, vec!["CGTAA", "CGTAC", "CGTAG", "CGTAT"]);
    }

    /* --------------------------------------------------------------------- */
    /*  low complexity / contexts / fingerprints                             */
    /* --------------------------------------------------------------------- */

    #[test]
    fn low_complexity_flags_repeats() {
        let poly_a = pack(&[b'A'; 32], 0, 32).unwrap();
        assert!(low_complexity(poly_a, 32));
        let at = pack(b"ATATATATATATATATATATATATATATATAT", 0, 32).unwrap();
        assert!(low_complexity(at, 32));
        let mixed = pack(b"ACGGTCATTGCAAGGTCCATAGCGTACTGATC", 0, 32).unwrap();
        assert!(!low_complexity(mixed, 32));
    }

    #[test]
    fn context_hash_is_window_stable() {
        let seq = b"ACGGTCATTGCAAGGTCCATAGCGTACTGATCACGGTCATTGCAAGGTCCAT";
        let h1 = hash_context(seq, 0, 40, 32).unwrap();
        let h2 = hash_context(seq, 0, 40, 32).unwrap();
        assert_eq!(h1, h2);
        // A different window hashes differently here
        let h3 = hash_context(seq, 4, 40, 32).unwrap();
        assert_ne!(h1, h3);
        // Too-short windows are rejected
        assert!(hash_context(seq, 0, 20, 32).is_none());
    }

    #[test]
    fn xor_pair_of_identical_kmers_is_zero() {
        let m = pack(b"ACGGTCATTGCAAGGTCCATAGCGTACTGATC", 0, 32).unwrap();
        assert_eq!(xor_pair(m, m), 0);
        let other = pack(b"TCGGTCATTGCAAGGTCCATAGCGTACTGATC", 0, 32).unwrap();
        assert_ne!(xor_pair(m, other), 0);
    }

    #[test]
    fn tile_counts_every_window() {
        let seq = b"ACGGTCATTGCAAGGTCCATAGCGTACTGATCAA";
        let tiles = tile(seq, 32);
        assert_eq!(tiles.len(), seq.len() - 32 + 1);
        assert_eq!(tiles[0], pack(seq, 0, 32).unwrap());
        assert_eq!(tiles[2], pack(seq, 2, 32).unwrap());
    }

    #[test]
    fn revcomp_seq_basics() {
        assert_eq!(revcomp_seq("ACGT"), "ACGT");
        assert_eq!(revcomp_seq("AACC"), "GGTT");
        assert_eq!(revcomp_seq("GATTACA"), "TGTAATC");
    }
}
