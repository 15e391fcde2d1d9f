use crate::cli::TraceLog;
use crate::kelpie::filter::{CONTEXT_STRIDE, SHORTEST_CONTEXT_LENGTH};
use crate::kelpie::kmers::{self, KMER_SIZE};
use crate::kelpie::select::SelectedRead;
use fxhash::FxHashMap;
use rayon::prelude::*;
use std::sync::atomic::{AtomicU32, Ordering};

const K: usize = KMER_SIZE;

/// The denoised k-mer table plus the family of context tables used by the
/// extender. Map shapes are frozen once built; counts are atomic cells so
/// the starting-read cleaner can adjust them in place (benign races on the
/// context tables are accepted, the denoiser has already driven error
/// k-mers to zero).
pub struct ExtensionTables {
    pub kmers: FxHashMap<u64, AtomicU32>,
    pub context_lengths: Vec<usize>,
    pub contexts: Vec<FxHashMap<u64, AtomicU32>>,
}

impl ExtensionTables {
    /// Depth of a k-mer, canonicalised.
    #[inline]
    pub fn depth(&self, kmer: u64) -> u32 {
        self.kmers
            .get(&kmers::canonical(kmer, K))
            .map(|c| c.load(Ordering::Relaxed))
            .unwrap_or(0)
    }

    #[inline]
    pub fn context_depth(&self, length_idx: usize, hash: u64) -> u32 {
        self.contexts[length_idx]
            .get(&hash)
            .map(|c| c.load(Ordering::Relaxed))
            .unwrap_or(0)
    }

    /// Bump a k-mer count. A k-mer absent from the frozen table is ignored;
    /// cleaning only ever promotes variants that already have depth.
    pub fn increment_kmer(&self, kmer: u64) {
        if let Some(c) = self.kmers.get(&kmers::canonical(kmer, K)) {
            c.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn decrement_kmer(&self, kmer: u64) {
        if let Some(c) = self.kmers.get(&kmers::canonical(kmer, K)) {
            let _ = c.fetch_update(Ordering::Relaxed, Ordering::Relaxed, |v| {
                if v > 0 {
                    Some(v - 1)
                } else {
                    None
                }
            });
        }
    }

    pub fn increment_context(&self, length_idx: usize, hash: u64) {
        if let Some(c) = self.contexts[length_idx].get(&hash) {
            c.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn decrement_context(&self, length_idx: usize, hash: u64) {
        if let Some(c) = self.contexts[length_idx].get(&hash) {
            let _ = c.fetch_update(Ordering::Relaxed, Ordering::Relaxed, |v| {
                if v > 0 {
                    Some(v - 1)
                } else {
                    None
                }
            });
        }
    }

    /// Null a k-mer's count outright (denoise cull).
    pub fn zero_kmer(&self, canonical_kmer: u64) {
        if let Some(c) = self.kmers.get(&canonical_kmer) {
            c.store(0, Ordering::Relaxed);
        }
    }
}

/// Build the canonical k-mer table and the context tables from the
/// selected reads.
///
/// The k-mer table is counted in thread-local maps merged afterwards; each
/// context length is counted independently in parallel, tiling every read
/// in forward and reverse-complement form. Upper context lengths whose
/// table stays below ¼ of the largest are dropped.
pub fn build_tables(reads: &[SelectedRead], longest_read: usize, log: &TraceLog) -> ExtensionTables {
    // Canonical k-mer counts
    let chunk = (reads.len() / rayon::current_num_threads().max(1)).max(1);
    let locals: Vec<FxHashMap<u64, u32>> = reads
        .par_chunks(chunk)
        .map(|chunk| {
            let mut local: FxHashMap<u64, u32> = FxHashMap::default();
            for r in chunk {
                for m in kmers::tile(r.seq.as_bytes(), K) {
                    *local.entry(kmers::canonical(m, K)).or_insert(0) += 1;
                }
            }
            local
        })
        .collect();
    let mut kmer_counts: FxHashMap<u64, u32> = FxHashMap::default();
    for local in locals {
        for (m, c) in local {
            *kmer_counts.entry(m).or_insert(0) += c;
        }
    }

    // Context tables, one per length
    let lengths: Vec<usize> = {
        let mut v = Vec::new();
        let mut l = SHORTEST_CONTEXT_LENGTH;
        while l <= longest_read {
            v.push(l);
            l += CONTEXT_STRIDE;
        }
        v
    };

    let mut tables: Vec<FxHashMap<u64, u32>> = lengths
        .par_iter()
        .map(|&length| {
            let mut table: FxHashMap<u64, u32> = FxHashMap::default();
            for r in reads {
                count_contexts(r.seq.as_bytes(), length, &mut table);
                let rc = kmers::revcomp_seq(&r.seq);
                count_contexts(rc.as_bytes(), length, &mut table);
            }
            table
        })
        .collect();

    // Truncate sparse upper lengths: scan down from the longest, the first
    // table over ¼ of the largest is the last one kept
    let largest = tables.iter().map(|t| t.len()).max().unwrap_or(0);
    let mut keep = tables.len();
    while keep > 1 && tables[keep - 1].len() * 4 <= largest {
        keep -= 1;
    }
    tables.truncate(keep);
    let kept_lengths: Vec<usize> = lengths[..keep].to_vec();

    log.line(|| {
        format!(
            "tables: {} kmers, context lengths {}..{} ({} kept)",
            kmer_counts.len(),
            kept_lengths.first().copied().unwrap_or(0),
            kept_lengths.last().copied().unwrap_or(0),
            kept_lengths.len()
        )
    });

    ExtensionTables {
        kmers: kmer_counts
            .into_iter()
            .map(|(m, c)| (m, AtomicU32::new(c)))
            .collect(),
        context_lengths: kept_lengths,
        contexts: tables
            .into_iter()
            .map(|t| {
                t.into_iter()
                    .map(|(h, c)| (h, AtomicU32::new(c)))
                    .collect()
            })
            .collect(),
    }
}

fn count_contexts(seq: &[u8], length: usize, table: &mut FxHashMap<u64, u32>) {
    if seq.len() < length {
        return;
    }
    for start in 0..=seq.len() - length {
        if let Some(h) = kmers::hash_context(seq, start, length, K) {
            *table.entry(h).or_insert(0) += 1;
        }
    }
}
