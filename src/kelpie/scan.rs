use crate::kelpie::kmers;
use crate::kelpie::primers::{mismatches_vs_pattern, Primer, PrimerSet, PrimerType};
use crate::kelpie::reads::RawRead;
use fxhash::FxHashMap;

/// One read found to contain a primer, trimmed to the primer edge with the
/// primer preserved.
#[derive(Debug, Clone)]
pub struct PrimerHit {
    /// Record number within the partition it came from.
    pub record_no: u32,
    pub primer_type: PrimerType,
    pub header: String,
    pub seq: String,
    /// The actual primer-region bases that matched, for the usage report.
    pub matched: String,
}

/// Scan result for one partition: four per-type hit lists plus a
/// recordNo → location index with the primer type in the top two bits.
#[derive(Default)]
pub struct PartitionScan {
    pub hits: [Vec<PrimerHit>; 4],
    pub index: FxHashMap<u32, u32>,
    /// (primer type, matched bases) → occurrences
    pub primer_counts: FxHashMap<(u8, String), u64>,
}

impl PartitionScan {
    pub fn total_hits(&self) -> usize {
        self.hits.iter().map(|h| h.len()).sum()
    }
}

const TYPE_SHIFT: u32 = 30;

/// Encode (primer type, position in that type's list).
#[inline]
fn encode_location(t: PrimerType, pos: usize) -> u32 {
    ((t as u32) << TYPE_SHIFT) | (pos as u32 & ((1 << TYPE_SHIFT) - 1))
}

/// Find the first primer occurrence in `seq` for one oriented primer.
/// Returns the head-start offset of the match.
fn find_primer(seq: &[u8], primer: &Primer) -> Option<usize> {
    let c = primer.core_len;
    let h = primer.head_len;
    if seq.len() < primer.len() {
        return None;
    }
    let mut core: Option<u64> = None;
    for cp in 0..=seq.len() - c {
        core = match core {
            None => kmers::pack(seq, cp, c),
            Some(prev) => kmers::incremental(prev, seq[cp + c - 1], c),
        };
        let packed = match core {
            Some(m) => m,
            None => continue,
        };
        if cp < h || !primer.cores.contains(&packed) {
            continue;
        }
        if h > 0 {
            match kmers::pack(seq, cp - h, h) {
                Some(head) if primer.heads.contains(&head) => {}
                _ => continue,
            }
        }
        // Head and core both matched; recount against the degenerate
        // pattern so the total stays within the mismatch budget.
        let s = cp - h;
        let window = &seq[s..s + primer.len()];
        if mismatches_vs_pattern(window, &primer.pattern) <= primer.allowed_mismatches {
            return Some(s);
        }
    }
    None
}

/// Scan every read of a partition for all four primer orientations.
///
/// The first matching orientation in FP, RP, FP', RP' order classifies the
/// read. FP/RP hits keep the read from the primer onwards; FP'/RP' hits
/// keep it up to and including the primer (reverse-complemented later when
/// the extension direction is canonicalised).
pub fn scan_partition(reads: &[RawRead], primers: &PrimerSet) -> PartitionScan {
    let mut scan = PartitionScan::default();

    for (record_no, read) in reads.iter().enumerate() {
        let seq = read.seq.as_bytes();
        let hit = [
            PrimerType::FP,
            PrimerType::RP,
            PrimerType::FPrc,
            PrimerType::RPrc,
        ]
        .into_iter()
        .find_map(|t| find_primer(seq, primers.get(t)).map(|s| (t, s)));

        let (t, s) = match hit {
            Some(h) => h,
            None => continue,
        };
        let primer = primers.get(t);
        let matched = read.seq[s..s + primer.len()].to_string();
        let trimmed = match t {
            PrimerType::FP | PrimerType::RP => read.seq[s..].to_string(),
            PrimerType::FPrc | PrimerType::RPrc => read.seq[..s + primer.len()].to_string(),
        };

        let list = &mut scan.hits[t as usize];
        scan.index
            .insert(record_no as u32, encode_location(t, list.len()));
        *scan
            .primer_counts
            .entry((t as u8, matched.clone()))
            .or_insert(0) += 1;
        list.push(PrimerHit {
            record_no: record_no as u32,
            primer_type: t,
            header: format!("{}{}", read.header, t.tag()),
            seq: trimmed,
            matched,
        });
    }
    scan
}
