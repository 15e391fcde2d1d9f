#[cfg(test)]
mod tests {
    use kelpie::kelpie::kmers::{expand, revcomp_seq};
    use kelpie::kelpie::primers::*;
    use kelpie::kelpie::reads::RawRead;
    use kelpie::kelpie::scan::scan_partition;

    /* --------------------------------------------------------------------- */
    /*  IUPAC expansion                                                      */
    /* --------------------------------------------------------------------- */

    #[test]
    fn iupac_codes_expand_to_their_bases() {
        assert_eq!(iupac_bases(b'A').unwrap(), b"A");
        assert_eq!(iupac_bases(b'Y').unwrap(), b"CT");
        assert_eq!(iupac_bases(b'N').unwrap(), b"ACGT");
        assert_eq!(iupac_bases(b'y').unwrap(), b"CT"); // case-insensitive
        assert!(iupac_bases(b'X').is_none());
    }

    #[test]
    fn pattern_mismatch_counting_respects_degeneracy() {
        assert_eq!(mismatches_vs_pattern(b"ACGT", b"ACGT"), 0);
        assert_eq!(mismatches_vs_pattern(b"ACGT", b"ACGY"), 0); // T matches Y
        assert_eq!(mismatches_vs_pattern(b"ACGA", b"ACGY"), 1); // A does not
        assert_eq!(mismatches_vs_pattern(b"TTTT", b"ACGT"), 3);
    }

    #[test]
    fn revcomp_pattern_complements_codes() {
        assert_eq!(revcomp_pattern("ACGT"), "ACGT");
        assert_eq!(revcomp_pattern("AAAA"), "TTTT");
        assert_eq!(revcomp_pattern("RY"), "RY");
        assert_eq!(revcomp_pattern("ACGY"), "RCGT");
    }

    /* --------------------------------------------------------------------- */
    /*  head/core split and variant sets                                     */
    /* --------------------------------------------------------------------- */

    #[test]
    fn head_core_split_follows_three_quarters_rule() {
        // 20 bases: core = max(15, 15) = 15, head = 5
        let p = Primer::build("ACGTACGTACGTACGTACGT", 0).unwrap();
        assert_eq!(p.core_len, 15);
        assert_eq!(p.head_len, 5);

        // A primer of exactly core-minimum length has no head
        let p = Primer::build("ACGTACGTACGTACG", 0).unwrap();
        assert_eq!(p.core_len, 15);
        assert_eq!(p.head_len, 0);
        assert!(p.heads.is_empty());

        // 32 bases: core = 24, head = 8
        let p = Primer::build("ACGTACGTACGTACGTACGTACGTACGTACGT", 0).unwrap();
        assert_eq!(p.core_len, 24);
        assert_eq!(p.head_len, 8);
    }

    #[test]
    fn primer_longer_than_packed_word_fails() {
        let long = "A".repeat(33);
        assert!(Primer::build(&long, 0).is_err());
        assert!(Primer::build("ACGTACGTXCGT", 0).is_err());
    }

    #[test]
    fn exact_primer_has_single_variant_per_part() {
        let p = Primer::build("ACGTACGTACGTACGTACGT", 0).unwrap();
        assert_eq!(p.heads.len(), 1);
        assert_eq!(p.cores.len(), 1);
    }

    #[test]
    fn one_mismatch_budget_expands_substitutions() {
        let p = Primer::build("ACGTACGTACGTACGTACGT", 1).unwrap();
        // head: 5 positions x 3 alternatives + exact
        assert_eq!(p.heads.len(), 1 + 5 * 3);
        // core: 15 positions x 3 alternatives + exact
        assert_eq!(p.cores.len(), 1 + 15 * 3);
    }

    #[test]
    fn degenerate_base_doubles_the_core() {
        // Y in the core expands to C and T before substitutions
        let p = Primer::build("ACGTACGTACGTACGTACGY", 0).unwrap();
        assert_eq!(p.cores.len(), 2);
    }

    #[test]
    fn degenerate_latch_locks_the_core_tail() {
        // 6 ambiguity codes in 15 bases is degenerate; the last two core
        // bases never get substituted
        let p = Primer::build("RRYYRWACGTACGCG", 1).unwrap();
        assert_eq!(p.head_len, 0);
        for &core in &p.cores {
            let s = expand(core, p.core_len);
            assert!(s.ends_with("CG"), "latched tail changed in {}", s);
        }
    }

    /* --------------------------------------------------------------------- */
    /*  scanner classification                                               */
    /* --------------------------------------------------------------------- */

    const FWD: &str = "GTGCCAGCAGCCGCGGTAA";
    const RVS: &str = "GGACTACACGGGTATCTAAT";
    const BODY: &str = "TCAGGCATTACGGATCCGTTAAGCTCAGTGACTGAACGTACTTGCAGGACCTAATGGCAT";

    fn read(header: &str, seq: String) -> RawRead {
        RawRead {
            header: header.to_string(),
            seq,
        }
    }

    #[test]
    fn scanner_classifies_and_trims_forward_hits() {
        let primers = PrimerSet::build(FWD, RVS, 1, 1).unwrap();
        // Primer at offset 7, body after it
        let seq = format!("TTCCGGA{}{}", FWD, BODY);
        let scan = scan_partition(&[read("r1", seq)], &primers);

        assert_eq!(scan.hits[0].len(), 1);
        let hit = &scan.hits[0][0];
        assert!(hit.seq.starts_with(FWD));
        assert!(hit.header.ends_with(";FP"));
        assert_eq!(hit.matched, FWD);
        assert_eq!(scan.index.len(), 1);
    }

    #[test]
    fn scanner_finds_reverse_complement_hits_at_the_tail() {
        let primers = PrimerSet::build(FWD, RVS, 1, 1).unwrap();
        let tp = revcomp_seq(RVS); // RP' orientation
        let seq = format!("{}{}TTGACCA", BODY, tp);
        let scan = scan_partition(&[read("r1", seq.clone())], &primers);

        assert_eq!(scan.hits[3].len(), 1);
        let hit = &scan.hits[3][0];
        assert!(hit.seq.ends_with(&tp));
        assert!(hit.header.ends_with(";RP'"));
        // Trimmed to the primer edge, trailing bases gone
        assert_eq!(hit.seq.len(), BODY.len() + tp.len());
    }

    #[test]
    fn scanner_accepts_one_mismatch_within_budget() {
        let primers = PrimerSet::build(FWD, RVS, 1, 1).unwrap();
        // One substitution inside the core
        let mut primer = FWD.to_string();
        primer.replace_range(10..11, "A"); // C -> A
        assert_ne!(primer, FWD);
        let seq = format!("{}{}", primer, BODY);
        let scan = scan_partition(&[read("r1", seq)], &primers);
        assert_eq!(scan.hits[0].len(), 1);
    }

    #[test]
    fn scanner_rejects_head_plus_core_over_budget() {
        let primers = PrimerSet::build(FWD, RVS, 1, 1).unwrap();
        // One substitution in the head and one in the core is two total
        let mut primer = FWD.to_string();
        primer.replace_range(1..2, "A"); // head: T -> A
        primer.replace_range(10..11, "A"); // core: C -> A
        let seq = format!("{}{}", primer, BODY);
        let scan = scan_partition(&[read("r1", seq)], &primers);
        assert_eq!(scan.total_hits(), 0);
    }

    #[test]
    fn scanner_skips_primer_free_reads() {
        let primers = PrimerSet::build(FWD, RVS, 1, 1).unwrap();
        let scan = scan_partition(&[read("r1", BODY.to_string())], &primers);
        assert_eq!(scan.total_hits(), 0);
        assert!(scan.index.is_empty());
    }
}
