#[cfg(test)]
mod tests {
    use kelpie::cli::TraceLog;
    use kelpie::kelpie::denoise::denoise;
    use kelpie::kelpie::extend::{ExtendOutcome, ExtendParams, Extender};
    use kelpie::kelpie::filter::{build_region_filter, prep_starting_reads, trim_adapters, FilterParams};
    use kelpie::kelpie::kmers::revcomp_seq;
    use kelpie::kelpie::primers::PrimerSet;
    use kelpie::kelpie::reads::{RawRead, ReadSource};
    use kelpie::kelpie::scan::scan_partition;
    use kelpie::kelpie::select::select_reads;
    use kelpie::kelpie::starts::prepare_starting_reads;
    use kelpie::kelpie::tables::build_tables;
    use std::sync::Arc;

    const FWD: &str = "GTGCCAGCAGCCGCGGTAA";
    const RVS: &str = "GGACTACACGGGTATCTAAT";

    /// Bodies differ at positions 25 and 46 (both organisms share every
    /// other base), so the two variant sites sit within one k-mer of each
    /// other and the extender can never build a chimera.
    fn body(site1: char, site2: char) -> String {
        format!(
            "TCAGGCATTACGGATCCGTTAAGCT{}AGTGACTGAACGTACTTGCA{}GACCTAATGGCAT",
            site1, site2
        )
    }

    fn amplicon(body: &str) -> String {
        format!("{}{}{}", FWD, body, revcomp_seq(RVS))
    }

    /// 80 bp sliding windows over the amplicon, three copies each, the way
    /// a deeply sequenced organism would present after region filtering.
    fn windows(org: &str, amp: &str, offsets: &[usize]) -> Vec<RawRead> {
        let mut reads = Vec::new();
        for &off in offsets {
            for copy in 0..3 {
                reads.push(RawRead {
                    header: format!("{}_{}_{}", org, off, copy),
                    seq: amp[off..off + 80].to_string(),
                });
            }
        }
        reads
    }

    /// Drive every phase the binary would: scan, filter, select, tables,
    /// denoise, prep, extend.
    fn run_pipeline(reads: Vec<RawRead>, min_length: Option<usize>) -> ExtendOutcome {
        let log = TraceLog::disabled();
        let primers = PrimerSet::build(FWD, RVS, 1, 1).unwrap();
        let longest = reads.iter().map(|r| r.seq.len()).max().unwrap();
        let source = ReadSource::Memory {
            files: vec![Arc::new(reads)],
            longest_read: longest,
        };

        let scans = vec![vec![scan_partition(
            &source.load_partition(0, 0).unwrap(),
            &primers,
        )]];

        let mut prepped = prep_starting_reads(&scans);
        trim_adapters(&mut prepped);
        let region = build_region_filter(
            &source,
            &scans,
            &prepped,
            &FilterParams {
                strict: false,
                drop_low_complexity: true,
                length_hint: None,
            },
            &log,
        )
        .unwrap();

        let mut selection = select_reads(&source, &scans, &region.kmers, false, &log).unwrap();
        let tables = build_tables(&selection.reads, longest, &log);
        let stats = denoise(&tables, &selection.reads, 2, &log);
        let prepared = prepare_starting_reads(&tables, &mut selection, &primers, &log);
        assert!(!prepared.reads.is_empty(), "no starting reads survived");

        let extender = Extender::new(
            &tables,
            &selection,
            &stats,
            &primers,
            &prepared,
            ExtendParams {
                max_extended_length: 4000,
                min_extended_length: min_length,
                pair_check_size: 60,
            },
        );
        extender.run(&log)
    }

    /* --------------------------------------------------------------------- */
    /*  single organism, exact reconstruction                                */
    /* --------------------------------------------------------------------- */

    #[test]
    fn single_organism_yields_its_body() {
        let body_a = body('C', 'G');
        let amp = amplicon(&body_a);
        let outcome = run_pipeline(windows("a", &amp, &[0, 10, 19]), None);

        assert_eq!(outcome.amplicons.len(), 1);
        let a = &outcome.amplicons[0];
        assert_eq!(a.seq, body_a);
        assert_eq!(a.fp, FWD);
        assert_eq!(a.tp.as_deref(), Some(revcomp_seq(RVS).as_str()));
        assert!(outcome.discards.is_empty());
    }

    /* --------------------------------------------------------------------- */
    /*  two organisms separate cleanly                                       */
    /* --------------------------------------------------------------------- */

    #[test]
    fn two_organisms_separate_without_chimeras() {
        let body_a = body('C', 'G');
        let body_b = body('T', 'A');
        let mut reads = windows("a", &amplicon(&body_a), &[0, 10, 19]);
        reads.extend(windows("b", &amplicon(&body_b), &[0, 10, 19]));
        let outcome = run_pipeline(reads, None);

        assert_eq!(outcome.amplicons.len(), 2);
        let mut seqs: Vec<&str> = outcome.amplicons.iter().map(|a| a.seq.as_str()).collect();
        seqs.sort_unstable();
        let mut expected = vec![body_a.as_str(), body_b.as_str()];
        expected.sort_unstable();
        assert_eq!(seqs, expected);
        assert!(outcome.amplicons.iter().all(|a| a.tp.is_some()));
    }

    /* --------------------------------------------------------------------- */
    /*  missing terminating primer: -min rescues, otherwise discarded        */
    /* --------------------------------------------------------------------- */

    #[test]
    fn missing_tp_is_rescued_by_min_length() {
        // No read reaches the reverse primer region
        let body_a = body('C', 'G');
        let amp = amplicon(&body_a);
        let reads = windows("a", &amp, &[0, 10]);

        let outcome = run_pipeline(reads.clone(), Some(60));
        assert_eq!(outcome.amplicons.len(), 1);
        let a = &outcome.amplicons[0];
        assert!(a.tp.is_none());
        assert!(a.seq.starts_with(&body_a[..40]));
        assert!(outcome.discards.is_empty());

        // Without -min the same extension lands in the discards pile
        let outcome = run_pipeline(reads, None);
        assert!(outcome.amplicons.is_empty());
        assert_eq!(outcome.discards.len(), 1);
        // Every starting read produced this same de-duplicated extension
        assert!(outcome.discards[0].1 >= 3);
        assert!(outcome.discards[0].0.starts_with(&body_a[..40]));
    }
}
