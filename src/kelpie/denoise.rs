use crate::cli::TraceLog;
use crate::kelpie::filter::SHORTEST_CONTEXT_LENGTH;
use crate::kelpie::kmers::{self, KMER_SIZE};
use crate::kelpie::select::SelectedRead;
use crate::kelpie::tables::ExtensionTables;
use fxhash::FxHashMap;
use rayon::prelude::*;

const K: usize = KMER_SIZE;

/// Depth divisor standing in for the sequencing error rate (1%).
pub const ERROR_RATE: u32 = 100;

/// Depth ratio at which a single-substitution variant displaces a dubious
/// first k-mer.
const DUBIOUS_FACTOR: u32 = 4;

/// Depth statistics for one selected read, computed after the error
/// k-mers have been nulled. C10 derives per-read acceptance floors from
/// these.
#[derive(Debug, Clone, Copy, Default)]
pub struct ReadStats {
    pub avg_depth: u32,
    pub harmonic_mean_depth: u32,
    pub min_depth: u32,
    pub initial_good_depth: u32,
}

/// Votes collected while sweeping one read.
#[derive(Default)]
struct Votes {
    to_cull: FxHashMap<u64, u32>,
    deemed_ok: FxHashMap<u64, u32>,
}

impl Votes {
    fn merge(&mut self, other: Votes) {
        for (m, v) in other.to_cull {
            *self.to_cull.entry(m).or_insert(0) += v;
        }
        for (m, v) in other.deemed_ok {
            *self.deemed_ok.entry(m).or_insert(0) += v;
        }
    }
}

/// Walk every selected read, vote error k-mers for culling, then
/// reconcile the votes and null the losers' counts in the table.
/// Returns the per-read stats used by the extender.
pub fn denoise(
    tables: &ExtensionTables,
    reads: &[SelectedRead],
    min_depth: u32,
    log: &TraceLog,
) -> Vec<ReadStats> {
    // Per-thread vote maps, merged after the sweep (no per-entry locking)
    let chunk = (reads.len() / rayon::current_num_threads().max(1)).max(1);
    let locals: Vec<Votes> = reads
        .par_chunks(chunk)
        .map(|chunk| {
            let mut votes = Votes::default();
            for r in chunk {
                sweep_read(tables, r.seq.as_bytes(), &mut votes);
            }
            votes
        })
        .collect();
    let mut votes = Votes::default();
    for local in locals {
        votes.merge(local);
    }

    // Reconciliation: a k-mer is culled when the cull votes overwhelm the
    // deemed-OK votes and the OK support is itself marginal
    let mut culled = 0usize;
    for (&m, &cull) in &votes.to_cull {
        let ok = votes.deemed_ok.get(&m).copied().unwrap_or(0);
        if cull > 5 * ok && ok <= min_depth.max(ok / ERROR_RATE) {
            tables.zero_kmer(m);
            culled += 1;
        }
    }
    log.line(|| {
        format!(
            "denoise: {} kmers culled of {} voted ({} deemed ok)",
            culled,
            votes.to_cull.len(),
            votes.deemed_ok.len()
        )
    });

    // Stats over the denoised table
    reads
        .par_iter()
        .map(|r| read_stats(tables, r.seq.as_bytes()))
        .collect()
}

/// Mean of the non-zero depths.
fn avg_nonzero(depths: &[u32]) -> f64 {
    let (sum, n) = depths
        .iter()
        .filter(|&&d| d > 0)
        .fold((0u64, 0u64), |(s, n), &d| (s + d as u64, n + 1));
    if n == 0 {
        0.0
    } else {
        sum as f64 / n as f64
    }
}

fn harmonic_mean(depths: impl Iterator<Item = u32>) -> f64 {
    let mut inv = 0.0f64;
    let mut n = 0u32;
    for d in depths {
        if d > 0 {
            inv += 1.0 / d as f64;
            n += 1;
        }
    }
    if n == 0 || inv == 0.0 {
        0.0
    } else {
        n as f64 / inv
    }
}

/// The read's "median" k-mer: the non-noise k-mer whose log-distance to
/// the average depth is smallest.
fn median_kmer(tiles: &[u64], depths: &[u32], avg: f64) -> Option<u64> {
    let ln_avg = avg.max(1.0).ln();
    tiles
        .iter()
        .zip(depths.iter())
        .filter(|(_, &d)| d > 0)
        .min_by(|(_, &a), (_, &b)| {
            let da = ((a as f64).ln() - ln_avg).abs();
            let db = ((b as f64).ln() - ln_avg).abs();
            da.partial_cmp(&db).unwrap()
        })
        .map(|(&m, _)| m)
}

/// Per-read noise floor from the last-base variants of the median k-mer,
/// falling back to 1% of the average depth.
fn noise_floor(tables: &ExtensionTables, median: u64, avg: f64) -> u32 {
    let fallback = ((avg / ERROR_RATE as f64).ceil() as u32).max(1);
    let min_variant = kmers::last_base_variants(median, K)
        .into_iter()
        .filter(|&v| v != median)
        .map(|v| tables.depth(v))
        .min()
        .unwrap_or(0);
    if min_variant > 0 {
        min_variant
    } else {
        fallback
    }
}

/// Crater test: the harmonic mean of the next k depths sits near the noise
/// floor while the window after it recovers toward the previous good
/// depth.
fn crater_at(depths: &[u32], i: usize, floor: u32, prev_good: u32) -> bool {
    if i + 2 * K > depths.len() || prev_good == 0 {
        return false;
    }
    let hm = harmonic_mean(depths[i..i + K].iter().copied());
    if hm > 2.0 * floor as f64 {
        return false;
    }
    let mean2: f64 =
        depths[i + K..i + 2 * K].iter().map(|&d| d as f64).sum::<f64>() / K as f64;
    mean2 * 2.0 >= prev_good as f64
}

/// Redemption check: the read's own follower of the flagged k-mer is
/// deeper than the follower of its deepest last-base alternative.
fn redeemed(tables: &ExtensionTables, seq: &[u8], i: usize, tiles: &[u64]) -> bool {
    if i + K >= seq.len() {
        return false;
    }
    let next_base = seq[i + K];
    let current = tiles[i];
    let own_follower = match kmers::incremental(current, next_base, K) {
        Some(f) => tables.depth(f),
        None => return false,
    };
    let deepest_alt = kmers::last_base_variants(current, K)
        .into_iter()
        .filter(|&v| v != current)
        .max_by_key(|&v| tables.depth(v));
    let alt_follower = deepest_alt
        .and_then(|v| kmers::incremental(v, next_base, K))
        .map(|f| tables.depth(f))
        .unwrap_or(0);
    own_follower > alt_follower
}

/// One read's sweep: flag error k-mers for culling, vote survivors as
/// deemed-OK.
fn sweep_read(tables: &ExtensionTables, seq: &[u8], votes: &mut Votes) {
    let tiles = kmers::tile(seq, K);
    let n = tiles.len();
    if n == 0 {
        return;
    }
    let depths: Vec<u32> = tiles.iter().map(|&m| tables.depth(m)).collect();
    let avg = avg_nonzero(&depths);
    let max_depth = depths.iter().copied().max().unwrap_or(0);

    let median = match median_kmer(&tiles, &depths, avg) {
        Some(m) => m,
        None => return, // every k-mer already at zero
    };
    let floor = noise_floor(tables, median, avg);

    let mut culled = vec![false; n];
    let mut prev_good: u32 = 0;

    // First-k-mer rule: a weak start is compared against its
    // single-substitution variants before the sweep trusts it
    let first_dubious = depths[0] < (avg / 2.0) as u32
        || seq.len() < SHORTEST_CONTEXT_LENGTH
        || depths[0] < max_depth / ERROR_RATE;
    if first_dubious {
        let deepest_var = kmers::all_single_subs(tiles[0], K)
            .into_iter()
            .map(|v| tables.depth(v))
            .max()
            .unwrap_or(0);
        if deepest_var > DUBIOUS_FACTOR * depths[0].max(1) {
            culled[0] = true;
            prev_good = deepest_var;
        }
    }

    let mut i = if culled[0] { 1 } else { 0 };
    while i < n {
        let d = depths[i];
        let variant_total: u32 = kmers::last_base_variants(tiles[i], K)
            .into_iter()
            .map(|v| tables.depth(v))
            .sum();

        let mut flag = d <= floor
            || d <= (variant_total + ERROR_RATE - 1) / ERROR_RATE
            || (prev_good > 0 && d < prev_good / ERROR_RATE)
            || crater_at(&depths, i, floor, prev_good);

        if flag && redeemed(tables, seq, i, &tiles) {
            flag = false;
        }

        if flag {
            culled[i] = true;
            // Propagate the cull until the depth recovers
            let recover = prev_good.max(2 * floor);
            i += 1;
            while i < n && depths[i] * 2 < recover {
                culled[i] = true;
                i += 1;
            }
        } else {
            prev_good = d;
            i += 1;
        }
    }

    // A leading block no deeper than anything that was culled is a
    // residual error run; cull it retroactively
    let max_culled = culled
        .iter()
        .zip(depths.iter())
        .filter(|(&c, _)| c)
        .map(|(_, &d)| d)
        .max()
        .unwrap_or(0);
    if max_culled > 0 {
        let block_end = culled.iter().position(|&c| c).unwrap_or(n);
        if depths[..block_end].iter().all(|&d| d <= max_culled) {
            for flag in culled[..block_end].iter_mut() {
                *flag = true;
            }
        }
    }

    // Votes. Accepted k-mers within K/4 bases of a cull, or in reads too
    // short to carry a context, never vote deemed-OK.
    let short_read = seq.len() < SHORTEST_CONTEXT_LENGTH;
    for (i, &m) in tiles.iter().enumerate() {
        let canon = kmers::canonical(m, K);
        if culled[i] {
            *votes.to_cull.entry(canon).or_insert(0) += 1;
        } else if !short_read && !near_culled(&culled, i, K / 4) {
            *votes.deemed_ok.entry(canon).or_insert(0) += 1;
        }
    }
}

fn near_culled(culled: &[bool], i: usize, window: usize) -> bool {
    let lo = i.saturating_sub(window);
    let hi = (i + window + 1).min(culled.len());
    culled[lo..hi].iter().any(|&c| c)
}

/// Depth stats for one read over the denoised table.
fn read_stats(tables: &ExtensionTables, seq: &[u8]) -> ReadStats {
    let depths: Vec<u32> = kmers::tile(seq, K)
        .iter()
        .map(|&m| tables.depth(m))
        .collect();
    let nonzero: Vec<u32> = depths.iter().copied().filter(|&d| d > 0).collect();
    if nonzero.is_empty() {
        return ReadStats::default();
    }
    ReadStats {
        avg_depth: (nonzero.iter().map(|&d| d as u64).sum::<u64>() / nonzero.len() as u64) as u32,
        harmonic_mean_depth: harmonic_mean(nonzero.iter().copied()).round() as u32,
        min_depth: nonzero.iter().copied().min().unwrap(),
        initial_good_depth: depths.iter().copied().find(|&d| d > 0).unwrap_or(0),
    }
}
