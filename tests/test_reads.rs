#[cfg(test)]
mod tests {
    use kelpie::kelpie::reads::*;
    use std::fs;

    /* --------------------------------------------------------------------- */
    /*  quality trimming                                                     */
    /* --------------------------------------------------------------------- */

    #[test]
    fn qual_trim_cuts_the_low_tail() {
        // 50 bases at q40 then 10 at q2 (phred+33)
        let mut qual = vec![b'I'; 50];
        qual.extend(vec![b'#'; 10]);
        assert_eq!(qual_trim_len(&qual, 30, 33), 51);

        // Uniformly good quality is untouched
        assert_eq!(qual_trim_len(&vec![b'I'; 60], 30, 33), 60);

        // Threshold 0 disables trimming
        assert_eq!(qual_trim_len(&qual, 0, 33), 60);
    }

    #[test]
    fn phred_offset_sniffing() {
        assert_eq!(sniff_phred_offset(b"IIII##"), 33); // '#' < 64
        assert_eq!(sniff_phred_offset(b"hhhhhh"), 64); // all >= 64
    }

    #[test]
    fn dark_cycle_tails_are_stripped() {
        let mut seq = format!("{}{}", "ACGGTCATTGCAAGGTCCATAGCGTACTGATC", "G".repeat(20));
        strip_dark_cycle_tail(&mut seq);
        assert_eq!(seq, "ACGGTCATTGCAAGGTCCATAGCGTACTGATC");

        // A mixed tail is left alone
        let mut seq = "ACGGTCATTGCAAGGTCCATAGCGTACTGATCGGGGGGGGAGGGGGG".to_string();
        let before = seq.clone();
        strip_dark_cycle_tail(&mut seq);
        assert_eq!(seq, before);

        // The poly-A form (zero packed word) is stripped too
        let mut seq = format!("{}{}", "ACGGTCATTGCAAGGTCCATAGCGTACTGATC", "A".repeat(16));
        strip_dark_cycle_tail(&mut seq);
        assert_eq!(seq, "ACGGTCATTGCAAGGTCCATAGCGTACTGATC");
    }

    /* --------------------------------------------------------------------- */
    /*  in-memory ingestion                                                  */
    /* --------------------------------------------------------------------- */

    const SEQ_A: &str = "ACGGTCATTGCAAGGTCCATAGCGTACTGATCCGATACGTTGCC";
    const SEQ_B: &str = "TTGACCAGGTATCGAATGCCTAGGTTACGCAGATCCGGAACTTG";

    #[test]
    fn in_memory_ingest_keeps_clean_reads_and_drops_the_rest() {
        let dir = tempfile::tempdir().unwrap();
        let fasta = dir.path().join("in.fa");
        fs::write(
            &fasta,
            format!(
                ">good1\n{}\n>short\nACGT\n>withn\nACGTNACGTNACGTNACGTNACGTNACGTNACGTN\n>good2\n{}\n",
                SEQ_A, SEQ_B
            ),
        )
        .unwrap();

        let source =
            ingest_in_memory(&[fasta], false, &IngestOptions::default()).unwrap();
        assert_eq!(source.n_files(), 1);
        assert_eq!(source.total_reads(0), 2);
        assert_eq!(source.longest_read(), SEQ_A.len());

        let reads = source.load_partition(0, 0).unwrap();
        assert_eq!(reads[0].header, "good1");
        assert_eq!(reads[0].seq, SEQ_A);
        assert_eq!(reads[1].seq, SEQ_B);
    }

    #[test]
    fn fastq_ingest_applies_quality_trimming() {
        let dir = tempfile::tempdir().unwrap();
        let fastq = dir.path().join("in.fq");
        // 40 good bases then 10 bad ones; the trimmed read keeps 41
        let seq = format!("{}{}", SEQ_A, "ACGTACGTAC");
        let qual = format!("{}{}", "I".repeat(44), "#".repeat(10));
        fs::write(&fastq, format!("@r1\n{}\n+\n{}\n", seq, qual)).unwrap();

        let source =
            ingest_in_memory(&[fastq], false, &IngestOptions::default()).unwrap();
        assert_eq!(source.total_reads(0), 1);
        let reads = source.load_partition(0, 0).unwrap();
        assert_eq!(reads[0].seq.len(), 45);
        assert!(SEQ_A.starts_with(&reads[0].seq[..44]));
    }

    /* --------------------------------------------------------------------- */
    /*  partitioned temp files                                               */
    /* --------------------------------------------------------------------- */

    #[test]
    fn partition_files_round_trip_through_metadata() {
        let dir = tempfile::tempdir().unwrap();
        let fasta = dir.path().join("in.fa");
        let mut content = String::new();
        let mut seqs = Vec::new();
        for i in 0..7 {
            // Rotate the two base sequences so every read is distinct
            let seq = format!("{}{}", &SEQ_A[i..], &SEQ_B[..i]);
            content.push_str(&format!(">r{}\n{}\n", i, seq));
            seqs.push(seq);
        }
        fs::write(&fasta, content).unwrap();

        let tmp = dir.path().join("tmp");
        let source = ingest_partitioned(
            &[fasta],
            false,
            &IngestOptions::default(),
            &tmp,
            "kelp",
            3,
        )
        .unwrap();

        // 7 reads at 3 per partition: 3 + 3 + 1
        assert_eq!(source.n_partitions(0), 3);
        assert_eq!(source.total_reads(0), 7);
        let part1 = source.load_partition(0, 1).unwrap();
        assert_eq!(part1.len(), 3);
        assert_eq!(part1[0].header, "r3");
        assert_eq!(part1[0].seq, seqs[3]);

        // The metadata sidecar resumes the same layout
        let resumed = resume_partitioned(&tmp, "kelp").unwrap();
        assert_eq!(resumed.n_partitions(0), 3);
        assert_eq!(resumed.total_reads(0), 7);
        assert_eq!(resumed.longest_read(), source.longest_read());
        let part2 = resumed.load_partition(0, 2).unwrap();
        assert_eq!(part2.len(), 1);
        assert_eq!(part2[0].header, "r6");
    }

    #[test]
    fn paired_inputs_split_by_glob_order() {
        let dir = tempfile::tempdir().unwrap();
        let r1 = dir.path().join("s_R1.fa");
        let r2 = dir.path().join("s_R2.fa");
        fs::write(&r1, format!(">a/1\n{}\n", SEQ_A)).unwrap();
        fs::write(&r2, format!(">a/2\n{}\n", SEQ_B)).unwrap();

        let source =
            ingest_in_memory(&[r1, r2], true, &IngestOptions::default()).unwrap();
        assert_eq!(source.n_files(), 2);
        assert_eq!(source.total_reads(0), 1);
        assert_eq!(source.total_reads(1), 1);
        assert_eq!(source.load_partition(1, 0).unwrap()[0].seq, SEQ_B);
    }
}
