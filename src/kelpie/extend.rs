use crate::cli::TraceLog;
use crate::kelpie::denoise::ReadStats;
use crate::kelpie::kmers::{self, KMER_SIZE};
use crate::kelpie::primers::PrimerSet;
use crate::kelpie::select::Selection;
use crate::kelpie::starts::{PreparedStarts, StartingRead};
use crate::kelpie::tables::ExtensionTables;
use fxhash::{FxHashMap, FxHashSet};
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use rayon::prelude::*;
use smallvec::SmallVec;
use std::sync::Mutex;

const K: usize = KMER_SIZE;

/// Fork-tree depth cap.
const MAX_RECURSION: usize = 10;

/// Context depth a variant must exceed to win the context down-select.
const CONTEXT_MIN_DEPTH: u32 = 2;

/// Distance between the two k-mers of a loop-trap pair. Enough for
/// amplicons up to several kilobases.
const TRAP_DISTANCE: usize = 48;

pub struct ExtendParams {
    pub max_extended_length: usize,
    pub min_extended_length: Option<usize>,
    pub pair_check_size: usize,
}

/// The result of extending one (partial) starting read.
#[derive(Debug, Clone)]
pub struct Extension {
    pub seq: String,
    pub tp_reached: bool,
    pub was_abandoned: bool,
    pub cost: u32,
    pub coin_tossed: bool,
    pub mean_depth: f64,
    pub avg_depth: f64,
}

#[derive(Debug, Clone)]
pub struct Amplicon {
    pub seq: String,
    pub fp: String,
    /// The matched terminating primer bases, or `None` for a `-min` rescue.
    pub tp: Option<String>,
}

pub struct ExtendOutcome {
    pub amplicons: Vec<Amplicon>,
    /// Discarded extension → multiplicity.
    pub discards: Vec<(String, usize)>,
}

/// Everything accumulated along one extension path. Cloned at forks.
#[derive(Clone)]
struct PathState {
    seq: Vec<u8>,
    depth_sum: f64,
    inv_depth_sum: f64,
    accepted: u32,
    last_accepted_depth: u32,
    loop_trap: FxHashSet<u32>,
    /// Base positions where a fork was resolved, for pair weighting.
    fork_positions: Vec<usize>,
    last_fork_len: usize,
}

impl PathState {
    fn harmonic_mean(&self) -> f64 {
        if self.inv_depth_sum == 0.0 {
            0.0
        } else {
            self.accepted as f64 / self.inv_depth_sum
        }
    }

    fn avg_depth(&self) -> f64 {
        if self.accepted == 0 {
            0.0
        } else {
            self.depth_sum / self.accepted as f64
        }
    }

    fn accept(&mut self, depth: u32) {
        self.accepted += 1;
        self.depth_sum += depth as f64;
        if depth > 0 {
            self.inv_depth_sum += 1.0 / depth as f64;
        }
        self.last_accepted_depth = depth;
    }
}

pub struct Extender<'a> {
    tables: &'a ExtensionTables,
    selection: &'a Selection,
    stats: &'a [ReadStats],
    primers: &'a PrimerSet,
    starts: &'a PreparedStarts,
    params: ExtendParams,
    /// starting-read sequence → finished extension (no coin, no abandon)
    cache: Mutex<FxHashMap<String, Extension>>,
    /// hashed RC pair-target → coverage score
    pair_cache: Mutex<FxHashMap<u64, f64>>,
    /// leading k-mer of each selected read (and of its RC) → read ids
    read_index: FxHashMap<u64, SmallVec<[u32; 4]>>,
}

impl<'a> Extender<'a> {
    pub fn new(
        tables: &'a ExtensionTables,
        selection: &'a Selection,
        stats: &'a [ReadStats],
        primers: &'a PrimerSet,
        starts: &'a PreparedStarts,
        params: ExtendParams,
    ) -> Extender<'a> {
        let mut read_index: FxHashMap<u64, SmallVec<[u32; 4]>> = FxHashMap::default();
        for (i, r) in selection.reads.iter().enumerate() {
            if let Some(m) = kmers::pack(r.seq.as_bytes(), 0, K) {
                read_index.entry(m).or_default().push(i as u32);
            }
            let rc = kmers::revcomp_seq(&r.seq);
            if let Some(m) = kmers::pack(rc.as_bytes(), 0, K) {
                read_index.entry(m).or_default().push(i as u32);
            }
        }
        Extender {
            tables,
            selection,
            stats,
            primers,
            starts,
            params,
            cache: Mutex::new(FxHashMap::default()),
            pair_cache: Mutex::new(FxHashMap::default()),
            read_index,
        }
    }

    /// Extend every cleaned starting read, then trim, de-duplicate and
    /// split the results into amplicons and discards.
    pub fn run(&self, log: &TraceLog) -> ExtendOutcome {
        let extensions: Vec<Extension> = self
            .starts
            .reads
            .par_iter()
            .map(|sr| self.extend_starting_read(sr))
            .collect();

        // Emit in sorted starting-read order for determinism
        let mut amplicons: Vec<Amplicon> = Vec::new();
        let mut seen: FxHashSet<String> = FxHashSet::default();
        let mut discards: FxHashMap<String, usize> = FxHashMap::default();
        let mut discard_order: Vec<String> = Vec::new();

        for (sr, ext) in self.starts.reads.iter().zip(extensions.iter()) {
            let (trimmed, tp) = self.trim_extension(sr, ext);
            if trimmed.len() < K {
                continue;
            }
            let keep = tp.is_some()
                || self
                    .params
                    .min_extended_length
                    .map(|min| trimmed.len() >= min)
                    .unwrap_or(false);
            if keep {
                if seen.insert(trimmed.clone()) {
                    amplicons.push(Amplicon {
                        seq: trimmed,
                        fp: String::from_utf8_lossy(&self.primers.fwd.pattern).into_owned(),
                        tp,
                    });
                }
            } else {
                let entry = discards.entry(trimmed.clone()).or_insert(0);
                if *entry == 0 {
                    discard_order.push(trimmed);
                }
                *entry += 1;
            }
        }

        log.line(|| {
            format!(
                "extension: {} amplicons, {} distinct discards",
                amplicons.len(),
                discard_order.len()
            )
        });

        ExtendOutcome {
            amplicons,
            discards: discard_order
                .into_iter()
                .map(|s| {
                    let n = discards[&s];
                    (s, n)
                })
                .collect(),
        }
    }

    fn extend_starting_read(&self, sr: &StartingRead) -> Extension {
        if let Some(hit) = self.cache.lock().unwrap().get(&sr.seq) {
            return hit.clone();
        }

        let read_stats = self.stats.get(sr.selected_index).copied().unwrap_or_default();
        let mut state = PathState {
            seq: sr.seq.as_bytes().to_vec(),
            depth_sum: 0.0,
            inv_depth_sum: 0.0,
            accepted: 0,
            last_accepted_depth: read_stats.initial_good_depth.max(1),
            loop_trap: FxHashSet::default(),
            fork_positions: Vec::new(),
            last_fork_len: 0,
        };
        // Seed the running means from the read itself
        for m in kmers::tile(&state.seq, K) {
            let d = self.tables.depth(m);
            if d > 0 {
                state.accept(d);
            }
        }

        // The tie-break coin is seeded per starting read so reruns agree
        let mut rng = ChaCha8Rng::seed_from_u64(sr.selected_index as u64);
        let ext = self.extend_path(1, state, &mut rng);

        if !ext.coin_tossed && !ext.was_abandoned {
            self.cache
                .lock()
                .unwrap()
                .insert(sr.seq.clone(), ext.clone());
        }
        ext
    }

    /// One level of the extension tree: grow base by base until the
    /// terminating primer, a dead end, or a fork that survives every
    /// down-select, then recurse per surviving variant and choose.
    fn extend_path(&self, level: usize, mut state: PathState, rng: &mut ChaCha8Rng) -> Extension {
        loop {
            if state.seq.len() >= self.params.max_extended_length {
                return self.finish(state, false, false, false, 0);
            }
            if self.at_terminating_primer(&state.seq) {
                return self.finish(state, true, false, false, 0);
            }

            let last = match kmers::pack(&state.seq, state.seq.len() - K, K) {
                Some(m) => m,
                None => return self.finish(state, false, false, false, 0),
            };

            // Cheap viability on raw next-k-mer depth
            let depths: [u32; 4] = {
                let succ = kmers::successors(last, K);
                [
                    self.tables.depth(succ[0]),
                    self.tables.depth(succ[1]),
                    self.tables.depth(succ[2]),
                    self.tables.depth(succ[3]),
                ]
            };
            let strongest = depths.iter().copied().max().unwrap_or(0);
            if strongest == 0 {
                return self.finish(state, false, false, false, 0);
            }
            let floor = ((state.harmonic_mean() / 4.0) as u32)
                .max(state.last_accepted_depth / 2)
                .max(1);
            let mut survivors: SmallVec<[usize; 4]> = (0..4)
                .filter(|&b| {
                    let d = depths[b];
                    d > 0 && (d >= floor || d * 4 >= strongest || d * 4 >= state.last_accepted_depth)
                })
                .collect();
            if survivors.is_empty() {
                return self.finish(state, false, false, false, 0);
            }

            // Early in a starting read the grown prefix must still look
            // like some starting read's prefix
            self.apply_starting_context_gate(&state.seq, &mut survivors);
            if survivors.is_empty() {
                return self.finish(state, false, false, false, 0);
            }

            // Context down-select, longest table first
            if survivors.len() > 1 {
                self.downselect_by_context(&state.seq, &mut survivors);
            }

            // Paired-read resolution
            if survivors.len() > 1 && self.selection.pairs.is_some() {
                self.downselect_by_pairs(&state, &mut survivors);
            }

            if survivors.len() > 1 {
                if level >= MAX_RECURSION {
                    return self.finish(state, false, true, false, 0);
                }
                return self.explore_fork(level, state, survivors, depths, rng);
            }

            // Single survivor: accept the base and continue
            let b = survivors[0];
            if !self.accept_base(&mut state, b, depths[b]) {
                return self.finish(state, false, true, false, 0);
            }
        }
    }

    /// Recurse into every surviving variant and choose among the returned
    /// branches: a lone TP wins; multiple TPs go to the strictly lowest
    /// cost, ties broken by a depth-weighted coin; with no TP the longest
    /// extension is returned (and will likely be discarded).
    fn explore_fork(
        &self,
        level: usize,
        state: PathState,
        survivors: SmallVec<[usize; 4]>,
        depths: [u32; 4],
        rng: &mut ChaCha8Rng,
    ) -> Extension {
        let fork_pos = state.seq.len();
        let cost_add = if fork_pos <= state.last_fork_len + 1 { 2 } else { 1 };

        let mut branches: Vec<Extension> = Vec::with_capacity(survivors.len());
        for &b in &survivors {
            let mut branch = state.clone();
            branch.fork_positions.push(fork_pos);
            branch.last_fork_len = fork_pos;
            if !self.accept_base(&mut branch, b, depths[b]) {
                branches.push(self.finish(branch, false, true, false, cost_add));
                continue;
            }
            let mut ext = self.extend_path(level + 1, branch, rng);
            ext.cost += cost_add;
            branches.push(ext);
        }

        let tp_branches: Vec<usize> = (0..branches.len())
            .filter(|&i| branches[i].tp_reached)
            .collect();

        match tp_branches.len() {
            1 => branches.swap_remove(tp_branches[0]),
            0 => {
                // Longest extension survives as the best effort
                let best = (0..branches.len())
                    .max_by_key(|&i| branches[i].seq.len())
                    .unwrap();
                branches.swap_remove(best)
            }
            _ => {
                let min_cost = tp_branches
                    .iter()
                    .map(|&i| branches[i].cost)
                    .min()
                    .unwrap();
                let cheapest: Vec<usize> = tp_branches
                    .into_iter()
                    .filter(|&i| branches[i].cost == min_cost)
                    .collect();
                if cheapest.len() == 1 {
                    branches.swap_remove(cheapest[0])
                } else {
                    // Weighted random on average depth
                    let total: f64 = cheapest.iter().map(|&i| branches[i].avg_depth).sum();
                    let mut pick = cheapest[0];
                    if total > 0.0 {
                        let mut roll = rng.gen::<f64>() * total;
                        for &i in &cheapest {
                            roll -= branches[i].avg_depth;
                            if roll <= 0.0 {
                                pick = i;
                                break;
                            }
                        }
                    }
                    let mut chosen = branches.swap_remove(pick);
                    chosen.coin_tossed = true;
                    chosen
                }
            }
        }
    }

    /// Append one base, update the accumulators, and check the loop trap.
    /// Returns false when the trap fires (a cycle).
    fn accept_base(&self, state: &mut PathState, base: usize, depth: u32) -> bool {
        state.seq.push(kmers::BASES[base] as u8);
        state.accept(depth);
        let len = state.seq.len();
        if len >= K + TRAP_DISTANCE {
            let current = kmers::pack(&state.seq, len - K, K);
            let predecessor = kmers::pack(&state.seq, len - K - TRAP_DISTANCE, K);
            if let (Some(c), Some(p)) = (current, predecessor) {
                if !state.loop_trap.insert(kmers::xor_pair(p, c)) {
                    return false;
                }
            }
        }
        true
    }

    fn finish(
        &self,
        state: PathState,
        tp_reached: bool,
        was_abandoned: bool,
        coin_tossed: bool,
        cost: u32,
    ) -> Extension {
        Extension {
            mean_depth: state.harmonic_mean(),
            avg_depth: state.avg_depth(),
            seq: String::from_utf8(state.seq).expect("ACGT only"),
            tp_reached,
            was_abandoned,
            cost,
            coin_tossed,
        }
    }

    /// Does the tail of `seq` end in a terminating primer (head + core of
    /// the reverse primer's reverse complement)?
    fn at_terminating_primer(&self, seq: &[u8]) -> bool {
        let tp = &self.primers.rvs_rc;
        let p = tp.len();
        if seq.len() < p {
            return false;
        }
        let s = seq.len() - p;
        let core_ok = kmers::pack(seq, s + tp.head_len, tp.core_len)
            .map(|c| tp.cores.contains(&c))
            .unwrap_or(false);
        if !core_ok {
            return false;
        }
        if tp.head_len == 0 {
            return true;
        }
        kmers::pack(seq, s, tp.head_len)
            .map(|h| tp.heads.contains(&h))
            .unwrap_or(false)
    }

    /// While the grown prefix is still no longer than a kept context
    /// length, it must hash into the starting-context set for that length.
    fn apply_starting_context_gate(&self, seq: &[u8], survivors: &mut SmallVec<[usize; 4]>) {
        let grown = seq.len() + 1;
        let idx = match self
            .tables
            .context_lengths
            .iter()
            .position(|&l| l == grown)
        {
            Some(idx) => idx,
            None => return,
        };
        let set = &self.starts.starting_contexts[idx];
        if set.is_empty() {
            return;
        }
        survivors.retain(|&mut b| {
            let mut buf = seq.to_vec();
            buf.push(kmers::BASES[b] as u8);
            kmers::hash_context(&buf, 0, grown, K)
                .map(|h| set.contains(&h))
                .unwrap_or(false)
        });
    }

    /// Walk the context tables from the longest length that fits down to
    /// the shortest; the first length where exactly one variant clears the
    /// depth threshold decides. If several still clear it at the shortest
    /// length, they all stay.
    fn downselect_by_context(&self, seq: &[u8], survivors: &mut SmallVec<[usize; 4]>) {
        let grown = seq.len() + 1;
        let mut buf = seq.to_vec();
        buf.push(b'A');
        let p = buf.len() - 1;

        let top = self
            .tables
            .context_lengths
            .iter()
            .rposition(|&l| l <= grown);
        let top = match top {
            Some(t) => t,
            None => return,
        };

        for idx in (0..=top).rev() {
            let length = self.tables.context_lengths[idx];
            let start = grown - length;
            let mut live: SmallVec<[usize; 4]> = SmallVec::new();
            for &b in survivors.iter() {
                buf[p] = kmers::BASES[b] as u8;
                if let Some(h) = kmers::hash_context(&buf, start, length, K) {
                    if self.tables.context_depth(idx, h) > CONTEXT_MIN_DEPTH {
                        live.push(b);
                    }
                }
            }
            if live.len() == 1 {
                *survivors = live;
                return;
            }
            if idx == 0 && live.len() > 1 {
                *survivors = live;
            }
        }
    }

    /// Resolve a fork with the mate evidence: reverse-complement the
    /// candidate tail and score how well selected reads cover it, with
    /// fork-history positions counted double. Variants far below the best
    /// coverage drop out.
    fn downselect_by_pairs(&self, state: &PathState, survivors: &mut SmallVec<[usize; 4]>) {
        let seq = &state.seq;
        let pcs = self.params.pair_check_size;
        if seq.len() + 1 < pcs {
            return;
        }
        let mut coverages: SmallVec<[(usize, f64); 4]> = SmallVec::new();
        for &b in survivors.iter() {
            let mut tail = seq[seq.len() + 1 - pcs..].to_vec();
            tail.push(kmers::BASES[b] as u8);
            let target = kmers::revcomp_seq(std::str::from_utf8(&tail).expect("ACGT only"));
            let key = fxhash::hash64(&target);
            let cached = self.pair_cache.lock().unwrap().get(&key).copied();
            let cov = match cached {
                Some(c) => c,
                None => {
                    let c = self.pair_coverage(target.as_bytes(), state);
                    self.pair_cache.lock().unwrap().insert(key, c);
                    c
                }
            };
            coverages.push((b, cov));
        }
        let max_cov = coverages
            .iter()
            .map(|&(_, c)| c)
            .fold(0.0f64, f64::max);
        if max_cov <= 0.0 {
            return;
        }
        survivors.retain(|&mut b| {
            coverages
                .iter()
                .find(|&&(vb, _)| vb == b)
                .map(|&(_, c)| c * 2.0 >= max_cov)
                .unwrap_or(false)
        });
    }

    /// Coverage of the RC target by selected reads that align to it,
    /// weighted double where the alignment spans a fork position.
    fn pair_coverage(&self, target: &[u8], state: &PathState) -> f64 {
        let mut coverage = 0.0f64;
        let ext_len = state.seq.len() + 1;
        if target.len() < K {
            return 0.0;
        }
        for offset in 0..=target.len() - K {
            let m = match kmers::pack(target, offset, K) {
                Some(m) => m,
                None => continue,
            };
            let ids = match self.read_index.get(&m) {
                Some(ids) => ids,
                None => continue,
            };
            for &id in ids {
                let read = &self.selection.reads[id as usize];
                let overlap = read.seq.len().min(target.len() - offset);
                let slice = &target[offset..offset + overlap];
                let matches = read.seq.as_bytes().starts_with(slice)
                    || kmers::revcomp_seq(&read.seq).as_bytes().starts_with(slice);
                if !matches {
                    continue;
                }
                // Target position t maps to extension position ext_len-1-t
                let hi = ext_len - 1 - offset;
                let lo = ext_len.saturating_sub(offset + overlap);
                let spans_fork = state
                    .fork_positions
                    .iter()
                    .any(|&f| f >= lo && f <= hi);
                coverage += if spans_fork { 2.0 } else { 1.0 };
            }
        }
        coverage
    }

    /// Deferred 5' stub trim plus the 3' terminating-primer trim.
    fn trim_extension(&self, sr: &StartingRead, ext: &Extension) -> (String, Option<String>) {
        let mut seq = ext.seq.clone();
        if sr.stub_len > 0 && seq.len() > sr.stub_len {
            seq.drain(..sr.stub_len);
        }
        let tp = &self.primers.rvs_rc;
        let p = tp.len();
        let mut matched = None;
        if seq.len() >= p {
            let s = seq.len() - p;
            let window = &seq.as_bytes()[s..];
            if crate::kelpie::primers::mismatches_vs_pattern(window, &tp.pattern)
                <= tp.allowed_mismatches
            {
                matched = Some(seq[s..].to_string());
                seq.truncate(s);
            }
        }
        (seq, matched)
    }
}
