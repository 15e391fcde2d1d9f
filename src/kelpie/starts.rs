use crate::cli::TraceLog;
use crate::kelpie::kmers::{self, KMER_SIZE};
use crate::kelpie::primers::{PrimerSet, PrimerType};
use crate::kelpie::select::Selection;
use crate::kelpie::tables::ExtensionTables;
use fxhash::{FxHashMap, FxHashSet};
use rayon::prelude::*;

const K: usize = KMER_SIZE;

/// Cumulative base changes allowed before a read is declared unclean.
const MAX_CLEAN_CHANGES: usize = 2;

/// Depth ratio below the previous good depth at which a k-mer is weak.
const WEAK_FACTOR: u32 = 10;

/// Depth ratio at which an alternative is "much deeper" than the current.
const DEEPER_FACTOR: u32 = 8;

/// One cleaned starting read, ready for extension.
#[derive(Debug, Clone)]
pub struct StartingRead {
    pub selected_index: usize,
    pub seq: String,
    /// Leading primer-stub bases, trimmed off when the extension is
    /// emitted (the deferred 5' trim).
    pub stub_len: usize,
}

pub struct PreparedStarts {
    /// Sorted by selected index, the extension iteration order.
    pub reads: Vec<StartingRead>,
    /// Per context-length index: hashes of the length-L prefixes of all
    /// cleaned starting reads.
    pub starting_contexts: Vec<FxHashSet<u64>>,
}

enum CleanOutcome {
    Clean(String),
    /// Position of the first failure, for the forward-trim fallback.
    Unclean(usize),
}

/// Clean, trim and extend every primer-bearing starting read, then salvage
/// reads whose primer is only partially present.
pub fn prepare_starting_reads(
    tables: &ExtensionTables,
    selection: &mut Selection,
    primers: &PrimerSet,
    log: &TraceLog,
) -> PreparedStarts {
    let primer_len = primers.fwd.len();
    let front_trim = primer_len - primer_len / 2;
    let stub_len = primer_len / 2;
    let min_context = tables.context_lengths.first().copied().unwrap_or(0);

    // Starting reads begin at the forward primer (FP as found, FP'
    // re-oriented at selection time)
    let starting: Vec<usize> = selection
        .reads
        .iter()
        .enumerate()
        .filter(|(_, r)| matches!(r.primer, Some(PrimerType::FP) | Some(PrimerType::FPrc)))
        .map(|(i, _)| i)
        .collect();

    // Record oriented prefixes at every offset inside the primer, so the
    // rescue pass can align partial-primer reads
    let window = min_context.max(SHORTEST_PREFIX);
    let mut prefixes: FxHashMap<String, usize> = FxHashMap::default();
    for &i in &starting {
        let seq = &selection.reads[i].seq;
        if seq.len() < window {
            continue;
        }
        for off in 0..=primer_len.min(seq.len() - window) {
            prefixes
                .entry(seq[off..off + window].to_string())
                .or_insert(off);
        }
    }

    // Rescue: a non-starting read whose leading (or, reverse-complemented,
    // trailing) window lines up inside a recorded prefix is a starting
    // read the primer scan missed
    let mut rescued: Vec<(usize, usize)> = Vec::new(); // (selected index, offset)
    for (i, r) in selection.reads.iter().enumerate() {
        if r.primer.is_some() || r.seq.len() < window {
            continue;
        }
        if let Some(&off) = prefixes.get(&r.seq[..window]) {
            rescued.push((i, off));
            continue;
        }
        let rc = kmers::revcomp_seq(&r.seq);
        if let Some(&off) = prefixes.get(&rc[..window]) {
            rescued.push((i, off));
        }
    }
    log.line(|| format!("{} starting reads, {} rescued", starting.len(), rescued.len()));

    // Work list: (selected index, bases to drop at 5', stub remaining)
    let mut work: Vec<(usize, usize, usize)> = starting
        .iter()
        .map(|&i| (i, front_trim, stub_len))
        .collect();
    for &(i, off) in &rescued {
        if off <= front_trim {
            work.push((i, front_trim - off, stub_len));
        } else {
            work.push((i, 0, primer_len.saturating_sub(off)));
        }
    }
    work.sort_unstable_by_key(|&(i, _, _)| i);

    // Clean in parallel on copies; the atomic table cells make the
    // concurrent count adjustments benign
    let all_reads = &selection.reads;
    let rescued_set: FxHashSet<usize> = rescued.iter().map(|&(i, _)| i).collect();
    let cleaned: Vec<Option<StartingRead>> = work
        .par_iter()
        .map(|&(i, drop, stub)| {
            let r = &all_reads[i];
            let oriented = if rescued_set.contains(&i)
                && !prefixes.contains_key(r.seq.get(..window).unwrap_or(""))
            {
                kmers::revcomp_seq(&r.seq)
            } else {
                r.seq.clone()
            };
            if oriented.len() <= drop + K {
                return None;
            }
            let mut seq = oriented[drop..].to_string();

            seq = match clean_forward(tables, &seq) {
                CleanOutcome::Clean(s) => s,
                CleanOutcome::Unclean(fwd_fail) => {
                    // Retry against the other strand, restoring the
                    // orientation afterwards
                    let rc = kmers::revcomp_seq(&seq);
                    match clean_forward(tables, &rc) {
                        CleanOutcome::Clean(s) => kmers::revcomp_seq(&s),
                        CleanOutcome::Unclean(_) => {
                            // Trim back to the last good base of the
                            // forward pass
                            let keep = fwd_fail + K - 1;
                            if keep < K {
                                return None;
                            }
                            seq.truncate(keep);
                            seq
                        }
                    }
                }
            };

            if seq.len() < min_context {
                extend_short_read(tables, &mut seq, min_context);
            }
            if seq.len() < K {
                return None;
            }
            Some(StartingRead {
                selected_index: i,
                seq,
                stub_len: stub,
            })
        })
        .collect();

    let mut reads: Vec<StartingRead> = cleaned.into_iter().flatten().collect();
    reads.sort_unstable_by_key(|r| r.selected_index);

    // Write the cleaned sequences back; selected reads freeze after this
    for r in &reads {
        selection.reads[r.selected_index].seq = r.seq.clone();
    }

    // Prefix hashes per context length gate the first extension steps
    let starting_contexts: Vec<FxHashSet<u64>> = tables
        .context_lengths
        .iter()
        .map(|&length| {
            reads
                .iter()
                .filter(|r| r.seq.len() >= length)
                .filter_map(|r| kmers::hash_context(r.seq.as_bytes(), 0, length, K))
                .collect()
        })
        .collect();

    PreparedStarts {
        reads,
        starting_contexts,
    }
}

const SHORTEST_PREFIX: usize = 40;

/// Forward cleaning pass: at each position, a weak k-mer may have its last
/// base replaced by the alternative with better downstream-follower
/// support. More than `MAX_CLEAN_CHANGES` replacements declares the read
/// unclean at the position of the last attempt.
fn clean_forward(tables: &ExtensionTables, seq: &str) -> CleanOutcome {
    let mut bytes = seq.as_bytes().to_vec();
    if bytes.len() < K {
        return CleanOutcome::Unclean(0);
    }
    let mut changes = 0usize;
    let mut prev_good: u32 = 0;
    let mut i = 0usize;

    while i + K <= bytes.len() {
        let m = match kmers::pack(&bytes, i, K) {
            Some(m) => m,
            None => return CleanOutcome::Unclean(i),
        };
        let d = tables.depth(m);
        let weak = d == 0 || (prev_good > 0 && d * WEAK_FACTOR < prev_good);
        if !weak {
            prev_good = d;
            i += 1;
            continue;
        }

        // Compare the last-base alternatives on follower support and depth
        let own_follower = follower_depth(tables, &bytes, i, m);
        let best = kmers::last_base_variants(m, K)
            .into_iter()
            .filter(|&v| v != m)
            .map(|v| {
                let dv = tables.depth(v);
                let fv = follower_depth(tables, &bytes, i, v);
                (v, dv, fv)
            })
            .max_by_key(|&(_, dv, fv)| (fv, dv));

        let replace = match best {
            Some((v, dv, fv)) if dv > 0 && (fv > own_follower || dv > DEEPER_FACTOR * d.max(1)) => {
                Some(v)
            }
            _ => None,
        };

        match replace {
            Some(v) => {
                changes += 1;
                if changes > MAX_CLEAN_CHANGES {
                    return CleanOutcome::Unclean(i);
                }
                apply_change(tables, &mut bytes, i, v);
                prev_good = tables.depth(v);
                i += 1;
            }
            None => {
                if d == 0 {
                    return CleanOutcome::Unclean(i);
                }
                prev_good = d;
                i += 1;
            }
        }
    }
    CleanOutcome::Clean(String::from_utf8(bytes).expect("ACGT only"))
}

/// Depth of the k-mer that follows `variant` in the read.
fn follower_depth(tables: &ExtensionTables, bytes: &[u8], i: usize, variant: u64) -> u32 {
    if i + K >= bytes.len() {
        return 0;
    }
    kmers::incremental(variant, bytes[i + K], K)
        .map(|f| tables.depth(f))
        .unwrap_or(0)
}

/// Replace the base at the end of the k-mer starting at `i`, keeping the
/// k-mer and context tables consistent: counts of every window touching
/// the changed base are decremented in their old form and incremented in
/// the new one.
fn apply_change(tables: &ExtensionTables, bytes: &mut Vec<u8>, i: usize, new_kmer: u64) {
    let p = i + K - 1;
    let old = bytes.clone();
    let new_base = kmers::BASES[((new_kmer >> (64 - 2 * K)) & 0x3) as usize] as u8;
    bytes[p] = new_base;

    // k-mer windows overlapping position p
    let lo = p.saturating_sub(K - 1);
    let hi = (p + 1).min(bytes.len().saturating_sub(K - 1));
    for start in lo..hi {
        if let Some(m) = kmers::pack(&old, start, K) {
            tables.decrement_kmer(m);
        }
        if let Some(m) = kmers::pack(bytes, start, K) {
            tables.increment_kmer(m);
        }
    }

    // Context windows overlapping position p, at every kept length
    for (idx, &length) in tables.context_lengths.iter().enumerate() {
        if bytes.len() < length {
            break;
        }
        let lo = (p + 1).saturating_sub(length);
        let hi = (p + 1).min(bytes.len() - length + 1);
        for start in lo..hi {
            if let Some(h) = kmers::hash_context(&old, start, length, K) {
                tables.decrement_context(idx, h);
            }
            if let Some(h) = kmers::hash_context(bytes, start, length, K) {
                tables.increment_context(idx, h);
            }
        }
    }
}

/// Append the most plausible next base until the read is long enough to
/// carry a context, a fork appears, or no viable base remains.
fn extend_short_read(tables: &ExtensionTables, seq: &mut String, min_context: usize) {
    while seq.len() < min_context {
        let bytes = seq.as_bytes();
        let last = match kmers::pack(bytes, bytes.len() - K, K) {
            Some(m) => m,
            None => return,
        };
        let depths: Vec<(usize, u32)> = kmers::successors(last, K)
            .into_iter()
            .enumerate()
            .map(|(b, v)| (b, tables.depth(v)))
            .collect();
        let deepest = depths.iter().map(|&(_, d)| d).max().unwrap_or(0);
        if deepest == 0 {
            return;
        }
        let viable: Vec<usize> = depths
            .iter()
            .filter(|&&(_, d)| d > 0 && d * 4 > deepest)
            .map(|&(b, _)| b)
            .collect();
        if viable.len() != 1 {
            return; // forked or dead
        }
        let base = kmers::BASES[viable[0]];

        // Once a context fits, it must already be known
        let grown = format!("{}{}", seq, base);
        if grown.len() >= min_context {
            let idx = context_index(tables, grown.len());
            if let Some(idx) = idx {
                let length = tables.context_lengths[idx];
                let start = grown.len() - length;
                match kmers::hash_context(grown.as_bytes(), start, length, K) {
                    Some(h) if tables.context_depth(idx, h) > 0 => {}
                    _ => return,
                }
            }
        }
        seq.push(base);
    }
}

/// Longest kept context length that fits `avail` bases.
pub fn context_index(tables: &ExtensionTables, avail: usize) -> Option<usize> {
    tables
        .context_lengths
        .iter()
        .rposition(|&l| l <= avail)
}
