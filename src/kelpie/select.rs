use crate::cli::TraceLog;
use crate::kelpie::kmers::{self, KMER_SIZE};
use crate::kelpie::primers::PrimerType;
use crate::kelpie::reads::ReadSource;
use crate::kelpie::scan::PartitionScan;
use anyhow::Result;
use fxhash::{FxHashMap, FxHashSet};
use rayon::prelude::*;

const K: usize = KMER_SIZE;

/// One read that passed the region filter, mutable through cleaning and
/// trimming, read-only once extension starts.
#[derive(Debug, Clone)]
pub struct SelectedRead {
    pub header: String,
    pub seq: String,
    pub partition: usize,
    /// The primer found in this read, if any. FP' reads are stored
    /// reverse-complemented so every starting read begins at the forward
    /// primer.
    pub primer: Option<PrimerType>,
}

pub struct Selection {
    pub reads: Vec<SelectedRead>,
    /// Partner selected-index per read; -1 when the mate was not selected
    /// or inputs are unpaired.
    pub pairs: Option<Vec<i32>>,
}

/// Two of the read's three thirds must contain a filter hit.
fn passes_thirds(seq: &[u8], filter: &FxHashSet<u64>) -> bool {
    if seq.len() < K {
        return false;
    }
    let mut hits = [false; 3];
    for (i, &m) in kmers::tile(seq, K).iter().enumerate() {
        if filter.contains(&m) {
            hits[(i * 3 / seq.len()).min(2)] = true;
        }
    }
    hits.iter().filter(|&&h| h).count() >= 2
}

/// Strip the pair-number decorations a sequencer leaves on a header, so
/// R1/R2 mates compare equal.
fn stripped_header(header: &str) -> &str {
    let head = header.split_whitespace().next().unwrap_or(header);
    head.trim_end_matches("/1").trim_end_matches("/2")
}

/// One pass over every read against the completed region filter.
///
/// Primer-bearing reads short-circuit: they re-enter from the scan lists,
/// already trimmed and tagged. Everything else must pass the
/// two-of-three-thirds k-mer support rule.
pub fn select_reads(
    source: &ReadSource,
    scans: &[Vec<PartitionScan>],
    filter: &FxHashSet<u64>,
    paired: bool,
    log: &TraceLog,
) -> Result<Selection> {
    let n_files = source.n_files();
    let mut reads: Vec<SelectedRead> = Vec::new();
    // (file, stripped header) → selected index, for pair linkage
    let mut by_header: Vec<FxHashMap<String, usize>> = vec![FxHashMap::default(); n_files];

    for file in 0..n_files {
        let n_parts = source.n_partitions(file);
        let per_part: Vec<Vec<SelectedRead>> = (0..n_parts)
            .into_par_iter()
            .map(|part| -> Result<Vec<SelectedRead>> {
                let raw = source.load_partition(file, part)?;
                let scan = &scans[file][part];
                let mut out = Vec::new();
                for (record_no, read) in raw.iter().enumerate() {
                    if let Some(&loc) = scan.index.get(&(record_no as u32)) {
                        let t = PrimerType::from_bits(loc >> 30);
                        let hit = &scan.hits[t as usize][(loc & 0x3FFF_FFFF) as usize];
                        let seq = if t == PrimerType::FPrc {
                            kmers::revcomp_seq(&hit.seq)
                        } else {
                            hit.seq.clone()
                        };
                        out.push(SelectedRead {
                            header: hit.header.clone(),
                            seq,
                            partition: part,
                            primer: Some(t),
                        });
                    } else if passes_thirds(read.seq.as_bytes(), filter) {
                        out.push(SelectedRead {
                            header: read.header.clone(),
                            seq: read.seq.clone(),
                            partition: part,
                            primer: None,
                        });
                    }
                }
                Ok(out)
            })
            .collect::<Result<_>>()?;

        for part_reads in per_part {
            for r in part_reads {
                if paired && n_files == 2 {
                    let key = stripped_header(
                        r.header
                            .rsplit_once(';')
                            .map(|(h, _)| h)
                            .unwrap_or(&r.header),
                    )
                    .to_string();
                    by_header[file].insert(key, reads.len());
                }
                reads.push(r);
            }
        }
    }

    log.line(|| format!("selected {} reads", reads.len()));

    // Bidirectional pair index, only where the stripped headers agree
    let pairs = if paired && n_files == 2 {
        let mut pairs = vec![-1i32; reads.len()];
        for (key, &i) in &by_header[0] {
            if let Some(&j) = by_header[1].get(key) {
                pairs[i] = j as i32;
                pairs[j] = i as i32;
            }
        }
        Some(pairs)
    } else {
        None
    };

    Ok(Selection { reads, pairs })
}
