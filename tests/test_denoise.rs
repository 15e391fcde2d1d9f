#[cfg(test)]
mod tests {
    use kelpie::cli::TraceLog;
    use kelpie::kelpie::denoise::denoise;
    use kelpie::kelpie::kmers::pack;
    use kelpie::kelpie::select::SelectedRead;
    use kelpie::kelpie::tables::build_tables;

    const BASE: &str = "ACGGTCATTGCAAGGTCCATAGCGTACTGATCCGATACGTTGCCAGGTATCGAATGCCTAGGTTACGCAGATCCGGAACTTGTCAGCATCCGTTAGGCAT";

    fn selected(header: &str, seq: String) -> SelectedRead {
        SelectedRead {
            header: header.to_string(),
            seq,
            partition: 0,
            primer: None,
        }
    }

    /* --------------------------------------------------------------------- */
    /*  error k-mers are nulled, real ones survive                           */
    /* --------------------------------------------------------------------- */

    #[test]
    fn lone_substitution_error_is_culled() {
        // Ten clean copies plus one read with a substitution at position 50
        let mut reads: Vec<SelectedRead> = (0..10)
            .map(|i| selected(&format!("c{}", i), BASE.to_string()))
            .collect();
        let mut erred = BASE.to_string();
        assert_eq!(&erred[50..51], "C");
        erred.replace_range(50..51, "A");
        reads.push(selected("err", erred.clone()));

        let log = TraceLog::disabled();
        let tables = build_tables(&reads, BASE.len(), &log);

        // Depths before: clean 32-mers away from the error appear in all
        // 11 reads, error 32-mers only in the one bad read
        let clean_kmer = pack(BASE.as_bytes(), 0, 32).unwrap();
        let error_kmer = pack(erred.as_bytes(), 30, 32).unwrap();
        assert_eq!(tables.depth(clean_kmer), 11);
        assert_eq!(tables.depth(error_kmer), 1);

        let stats = denoise(&tables, &reads, 2, &log);

        // The error k-mer is gone, the real one keeps its count
        assert_eq!(tables.depth(error_kmer), 0);
        assert_eq!(tables.depth(clean_kmer), 11);
        // The k-mer displaced by the error keeps its 10 clean copies
        let real_kmer = pack(BASE.as_bytes(), 30, 32).unwrap();
        assert_eq!(tables.depth(real_kmer), 10);

        // Per-read stats reflect the denoised table
        assert_eq!(stats.len(), reads.len());
        assert_eq!(stats[0].min_depth, 10);
        assert_eq!(stats[0].initial_good_depth, 11);
        assert!(stats[0].avg_depth >= 10);
    }

    #[test]
    fn uniform_coverage_is_left_alone() {
        let reads: Vec<SelectedRead> = (0..5)
            .map(|i| selected(&format!("c{}", i), BASE.to_string()))
            .collect();
        let log = TraceLog::disabled();
        let tables = build_tables(&reads, BASE.len(), &log);
        let stats = denoise(&tables, &reads, 2, &log);

        for i in 0..=BASE.len() - 32 {
            let m = pack(BASE.as_bytes(), i, 32).unwrap();
            assert_eq!(tables.depth(m), 5, "kmer at {} was touched", i);
        }
        assert_eq!(stats[0].min_depth, 5);
        assert_eq!(stats[0].harmonic_mean_depth, 5);
    }

    /* --------------------------------------------------------------------- */
    /*  denoise never raises a count                                         */
    /* --------------------------------------------------------------------- */

    #[test]
    fn denoise_is_monotone() {
        let mut reads: Vec<SelectedRead> = (0..8)
            .map(|i| selected(&format!("c{}", i), BASE.to_string()))
            .collect();
        let mut erred = BASE.to_string();
        erred.replace_range(20..21, "T");
        reads.push(selected("err", erred));

        let log = TraceLog::disabled();
        let tables = build_tables(&reads, BASE.len(), &log);
        let before: Vec<(u64, u32)> = (0..=BASE.len() - 32)
            .map(|i| {
                let m = pack(BASE.as_bytes(), i, 32).unwrap();
                (m, tables.depth(m))
            })
            .collect();

        denoise(&tables, &reads, 2, &log);
        for (m, pre) in before {
            assert!(tables.depth(m) <= pre);
        }
    }
}
