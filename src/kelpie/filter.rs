use crate::cli::TraceLog;
use crate::kelpie::kmers::{self, KMER_SIZE};
use crate::kelpie::reads::ReadSource;
use crate::kelpie::scan::PartitionScan;
use anyhow::Result;
use fxhash::{FxHashMap, FxHashSet};
use rayon::prelude::*;

/// Shortest context length recorded in any context table.
pub const SHORTEST_CONTEXT_LENGTH: usize = 40;
/// Context lengths advance in steps of this many bases.
pub const CONTEXT_STRIDE: usize = 4;
/// Gap between the two k-mers of an ending-filter / loop-trap pair.
pub const PAIR_GAP: usize = 16;

/// As-read depth at which a k-mer with no reverse-complement coverage is
/// treated as sequencing-adapter carry-over.
const HDUB_MIN_DEPTH: u32 = 16;

const K: usize = KMER_SIZE;

/// Context lengths that fit reads up to `longest_read`.
pub fn context_lengths(longest_read: usize) -> Vec<usize> {
    let mut lengths = Vec::new();
    let mut l = SHORTEST_CONTEXT_LENGTH;
    while l <= longest_read {
        lengths.push(l);
        l += CONTEXT_STRIDE;
    }
    lengths
}

/// Index of the longest context length that fits in `avail` bases.
fn longest_fitting(lengths: &[usize], avail: usize) -> Option<usize> {
    if avail < SHORTEST_CONTEXT_LENGTH {
        return None;
    }
    let idx = (avail - SHORTEST_CONTEXT_LENGTH) / CONTEXT_STRIDE;
    Some(idx.min(lengths.len() - 1))
}

/* ------------------------------------------------------------------------- */
/*  Starting-read preparation                                                */
/* ------------------------------------------------------------------------- */

/// Primer-bearing reads oriented for filter growth: `fwd` reads start at
/// the forward primer, `rvs` reads at the reverse primer.
pub struct PreppedReads {
    pub fwd: Vec<String>,
    pub rvs: Vec<String>,
}

/// Orient every primer hit: FP/RP reads as found, FP'/RP' reads
/// reverse-complemented so each starts at its primer.
pub fn prep_starting_reads(scans: &[Vec<PartitionScan>]) -> PreppedReads {
    let mut fwd = Vec::new();
    let mut rvs = Vec::new();
    for file_scans in scans {
        for scan in file_scans {
            for hit in &scan.hits[0] {
                fwd.push(hit.seq.clone());
            }
            for hit in &scan.hits[2] {
                fwd.push(kmers::revcomp_seq(&hit.seq));
            }
            for hit in &scan.hits[1] {
                rvs.push(hit.seq.clone());
            }
            for hit in &scan.hits[3] {
                rvs.push(kmers::revcomp_seq(&hit.seq));
            }
        }
    }
    PreppedReads { fwd, rvs }
}

/// Adapter (HDUB) trap: a k-mer deep as-read whose reverse complement is
/// never seen marks a sequencing-adapter boundary. Reads are truncated at
/// the first such k-mer. Returns the number of trimmed reads.
pub fn trim_adapters(prepped: &mut PreppedReads) -> usize {
    let mut depth: FxHashMap<u64, u32> = FxHashMap::default();
    for seq in prepped.fwd.iter().chain(prepped.rvs.iter()) {
        for m in kmers::tile(seq.as_bytes(), K) {
            *depth.entry(m).or_insert(0) += 1;
        }
    }

    let mut trimmed = 0usize;
    for seq in prepped.fwd.iter_mut().chain(prepped.rvs.iter_mut()) {
        let tiles = kmers::tile(seq.as_bytes(), K);
        let boundary = tiles.iter().position(|&m| {
            depth.get(&m).copied().unwrap_or(0) >= HDUB_MIN_DEPTH
                && depth.get(&kmers::revcomp(m, K)).copied().unwrap_or(0) == 0
        });
        if let Some(pos) = boundary {
            if pos >= K {
                seq.truncate(pos);
                trimmed += 1;
            }
        }
    }
    trimmed
}

/* ------------------------------------------------------------------------- */
/*  Filter state                                                             */
/* ------------------------------------------------------------------------- */

/// One strand direction of a growing region filter.
pub struct DirectionFilter {
    pub kmers: FxHashSet<u64>,
    /// Per context-length index: k-mers that carry a context at that length.
    pub context_exists: Vec<FxHashSet<u64>>,
    /// Per context-length index: hashed contexts.
    pub contexts: Vec<FxHashSet<u64>>,
    /// Longest registered context-length index per k-mer; shorter entries
    /// are removed when a longer one is inserted.
    longest_ctx: FxHashMap<u64, u8>,
    /// XOR-pair fingerprints harvested from the opposite-primer reads.
    pub ending: FxHashSet<u32>,
}

impl DirectionFilter {
    fn new(n_lengths: usize) -> DirectionFilter {
        DirectionFilter {
            kmers: FxHashSet::default(),
            context_exists: vec![FxHashSet::default(); n_lengths],
            contexts: vec![FxHashSet::default(); n_lengths],
            longest_ctx: FxHashMap::default(),
            ending: FxHashSet::default(),
        }
    }

    /// Tile an oriented read into the filter. Contexts are recorded at the
    /// longest length that fits between each k-mer and the read end;
    /// shorter redundant registrations for the same k-mer are dropped.
    /// Returns the k-mers newly added by this read.
    fn tile_read(&mut self, seq: &str, lengths: &[usize]) -> Vec<u64> {
        let bytes = seq.as_bytes();
        let tiles = kmers::tile(bytes, K);
        let mut added = Vec::new();
        for (i, &m) in tiles.iter().enumerate() {
            if self.kmers.insert(m) {
                added.push(m);
            }
            let avail = bytes.len() - i;
            let idx = match longest_fitting(lengths, avail) {
                Some(idx) => idx,
                None => continue,
            };
            match self.longest_ctx.get(&m) {
                Some(&prev) if prev as usize >= idx => continue,
                Some(&prev) => {
                    // A longer context supersedes the shorter registration
                    self.context_exists[prev as usize].remove(&m);
                }
                None => {}
            }
            if let Some(h) = kmers::hash_context(bytes, i, lengths[idx], K) {
                self.longest_ctx.insert(m, idx as u8);
                self.context_exists[idx].insert(m);
                self.contexts[idx].insert(h);
            }
        }
        added
    }

    /// Verify a candidate read against the context tables: walk down from
    /// the longest length that fits the read, accept on the first level
    /// where the read's leading k-mer is registered and the read's own
    /// prefix context hashes into the table.
    fn verify_context(&self, seq: &[u8], first_kmer: u64, lengths: &[usize]) -> bool {
        let top = match longest_fitting(lengths, seq.len()) {
            Some(idx) => idx,
            None => return false,
        };
        for idx in (0..=top).rev() {
            if !self.context_exists[idx].contains(&first_kmer) {
                continue;
            }
            if let Some(h) = kmers::hash_context(seq, 0, lengths[idx], K) {
                if self.contexts[idx].contains(&h) {
                    return true;
                }
            }
        }
        false
    }

    /// Is this oriented read crossing into the opposite primer cloud?
    /// More than ¾ of its tail XOR-pairs must hit the ending filter.
    fn is_ending(&self, tiles: &[u64]) -> bool {
        if tiles.len() <= PAIR_GAP {
            return false;
        }
        let n_pairs = tiles.len() - PAIR_GAP;
        let start = n_pairs.saturating_sub(PAIR_GAP);
        let examined = n_pairs - start;
        if examined == 0 {
            return false;
        }
        let hits = (start..n_pairs)
            .filter(|&i| self.ending.contains(&kmers::xor_pair(tiles[i], tiles[i + PAIR_GAP])))
            .count();
        hits * 4 > examined * 3
    }
}

/// The pair of direction filters grown from one input file.
pub struct FileFilter {
    pub dirs: [DirectionFilter; 2],
}

/* ------------------------------------------------------------------------- */
/*  Iterative growth                                                         */
/* ------------------------------------------------------------------------- */

pub struct FilterParams {
    pub strict: bool,
    pub drop_low_complexity: bool,
    /// Expected amplicon length range from `--length`, drives the
    /// iteration cap.
    pub length_hint: Option<(usize, usize)>,
}

pub struct RegionFilterResult {
    /// Combined, RC-closed region filter.
    pub kmers: FxHashSet<u64>,
    pub total_ending_reads: usize,
    pub iterations_per_file: Vec<usize>,
}

struct Retained {
    direction: usize,
    seq: String,
    partition: usize,
    record_no: u32,
}

fn max_iterations(length_hint: Option<(usize, usize)>) -> usize {
    match length_hint {
        Some((_, max)) => (max / 25).max(10),
        None => 50,
    }
}

/// Grow per-file region filters outward from the primer-bearing reads
/// until the clouds meet or the exhaustion criteria trip, then combine the
/// files into one RC-closed filter.
pub fn build_region_filter(
    source: &ReadSource,
    scans: &[Vec<PartitionScan>],
    prepped: &PreppedReads,
    params: &FilterParams,
    log: &TraceLog,
) -> Result<RegionFilterResult> {
    let lengths = context_lengths(source.longest_read().max(SHORTEST_CONTEXT_LENGTH));
    let n_files = source.n_files();

    // Every file's filter starts from the same primer-derived seed
    let seed = build_seed(prepped, &lengths);
    let reads_expected_init = prepped.fwd.len().min(prepped.rvs.len()).max(1);

    let mut file_filters: Vec<FileFilter> = Vec::with_capacity(n_files);
    let mut total_ending = 0usize;
    let mut iterations_per_file = Vec::with_capacity(n_files);
    // Ending reads seen per file, used to pre-mark mate records
    let mut ending_records: Vec<Vec<(usize, u32)>> = vec![Vec::new(); n_files];

    for file in 0..n_files {
        let mut filter = clone_seed(&seed);
        let n_parts = source.n_partitions(file);

        // Primer-bearing reads are already tiled into the seed
        let mut tiled: Vec<FxHashSet<u32>> = (0..n_parts)
            .map(|p| scans[file][p].index.keys().copied().collect())
            .collect();

        // Mate records of the other file's ending reads are treated as
        // already tiled when the partitions align record-for-record
        if n_files == 2 {
            let mate = 1 - file;
            if !ending_records[mate].is_empty() && partitions_align(source, file, mate) {
                for &(p, r) in &ending_records[mate] {
                    tiled[p].insert(r);
                }
            }
        }

        let cap = max_iterations(params.length_hint);
        let mut reads_expected = reads_expected_init;
        let mut file_ending = 0usize;
        let mut matched_total = 0usize;
        let mut prev_matched = 0usize;
        let mut low_add_streak = 0usize;
        let mut iterations = 0usize;

        for iteration in 1..=cap {
            iterations = iteration;

            // Match phase: read-only on the filter, parallel by partition
            let retained_by_part: Vec<Vec<Retained>> = (0..n_parts)
                .into_par_iter()
                .map(|part| -> Result<Vec<Retained>> {
                    let reads = source.load_partition(file, part)?;
                    let mut out = Vec::new();
                    for (record_no, read) in reads.iter().enumerate() {
                        let record_no = record_no as u32;
                        if tiled[part].contains(&record_no) {
                            continue;
                        }
                        if let Some((direction, oriented)) =
                            match_read(&read.seq, &filter, &lengths, params.drop_low_complexity)
                        {
                            out.push(Retained {
                                direction,
                                seq: oriented,
                                partition: part,
                                record_no,
                            });
                        }
                    }
                    Ok(out)
                })
                .collect::<Result<_>>()?;

            // Add phase: sequential merge into the filter
            let mut matched = 0usize;
            let mut adding = 0usize;
            let mut ending_now = 0usize;
            let mut iteration_adds: Vec<(Vec<u64>, bool)> = Vec::new();

            for retained in retained_by_part {
                for r in retained {
                    tiled[r.partition].insert(r.record_no);
                    matched += 1;
                    let tiles = kmers::tile(r.seq.as_bytes(), K);
                    let is_ending = filter.dirs[r.direction].is_ending(&tiles);
                    if is_ending {
                        ending_now += 1;
                        ending_records[file].push((r.partition, r.record_no));
                    }
                    let added = filter.dirs[r.direction].tile_read(&r.seq, &lengths);
                    if !added.is_empty() {
                        adding += 1;
                    }
                    iteration_adds.push((added, is_ending));
                }
            }
            matched_total += matched;
            file_ending += ending_now;

            log.line(|| {
                format!(
                    "filter file {} iteration {}: matched {} adding {} ending {}",
                    file, iteration, matched, adding, ending_now
                )
            });

            // Revise the expectation when the region is clearly larger
            if matched_total > 5 * reads_expected_init {
                reads_expected = matched_total;
            }

            // Termination checks, in the documented order
            if adding < 5.max(matched_total / 1000) {
                low_add_streak += 1;
            } else {
                low_add_streak = 0;
            }
            if low_add_streak >= 2 {
                break;
            }
            if file_ending > 0 && ending_now * 100 < file_ending {
                break;
            }
            if file_ending > reads_expected && prev_matched > 0 && matched * 2 <= prev_matched {
                break;
            }
            if matched_total > 2 * reads_expected {
                // Run-away growth: keep only the k-mers contributed by
                // ending reads this iteration
                for (added, is_ending) in &iteration_adds {
                    if *is_ending {
                        continue;
                    }
                    for m in added {
                        for d in &mut filter.dirs {
                            d.kmers.remove(m);
                            if let Some(idx) = d.longest_ctx.remove(m) {
                                d.context_exists[idx as usize].remove(m);
                            }
                        }
                    }
                }
                break;
            }
            prev_matched = matched;
        }

        total_ending += file_ending;
        iterations_per_file.push(iterations);
        file_filters.push(filter);
    }

    let kmers = combine_filters(&file_filters, params.strict);
    Ok(RegionFilterResult {
        kmers,
        total_ending_reads: total_ending,
        iterations_per_file,
    })
}

/// Can records of `a` be matched index-for-index with records of `b`?
fn partitions_align(source: &ReadSource, a: usize, b: usize) -> bool {
    if source.n_partitions(a) != source.n_partitions(b) {
        return false;
    }
    source.total_reads(a) == source.total_reads(b)
}

/// Orient a candidate read against the filter: as-is when its first k-mer
/// is in a direction's cloud, reverse-complemented when only its last
/// k-mer's RC is. Context verification gates acceptance either way.
fn match_read(
    seq: &str,
    filter: &FileFilter,
    lengths: &[usize],
    drop_low_complexity: bool,
) -> Option<(usize, String)> {
    let bytes = seq.as_bytes();
    if bytes.len() < K {
        return None;
    }
    if let Some(first) = kmers::pack(bytes, 0, K) {
        for (d, dir) in filter.dirs.iter().enumerate() {
            if dir.kmers.contains(&first) {
                if drop_low_complexity && kmers::low_complexity(first, K) {
                    return None;
                }
                if dir.verify_context(bytes, first, lengths) {
                    return Some((d, seq.to_string()));
                }
            }
        }
    }
    if let Some(last) = kmers::pack(bytes, bytes.len() - K, K) {
        let rc_last = kmers::revcomp(last, K);
        for (d, dir) in filter.dirs.iter().enumerate() {
            if dir.kmers.contains(&rc_last) {
                if drop_low_complexity && kmers::low_complexity(rc_last, K) {
                    return None;
                }
                let oriented = kmers::revcomp_seq(seq);
                if dir.verify_context(oriented.as_bytes(), rc_last, lengths) {
                    return Some((d, oriented));
                }
            }
        }
    }
    None
}

/// Seed both direction filters from the oriented primer reads, and build
/// each direction's ending filter from the opposite direction's reads
/// brought into the same orientation.
fn build_seed(prepped: &PreppedReads, lengths: &[usize]) -> FileFilter {
    let mut fwd = DirectionFilter::new(lengths.len());
    let mut rvs = DirectionFilter::new(lengths.len());

    for seq in &prepped.fwd {
        fwd.tile_read(seq, lengths);
    }
    for seq in &prepped.rvs {
        rvs.tile_read(seq, lengths);
    }

    // Growth from the forward primer ends where the reverse-primer reads
    // live; fingerprint those reads in forward orientation
    for seq in &prepped.rvs {
        let rc = kmers::revcomp_seq(seq);
        let tiles = kmers::tile(rc.as_bytes(), K);
        for i in 0..tiles.len().saturating_sub(PAIR_GAP) {
            fwd.ending.insert(kmers::xor_pair(tiles[i], tiles[i + PAIR_GAP]));
        }
    }
    for seq in &prepped.fwd {
        let rc = kmers::revcomp_seq(seq);
        let tiles = kmers::tile(rc.as_bytes(), K);
        for i in 0..tiles.len().saturating_sub(PAIR_GAP) {
            rvs.ending.insert(kmers::xor_pair(tiles[i], tiles[i + PAIR_GAP]));
        }
    }

    FileFilter { dirs: [fwd, rvs] }
}

fn clone_seed(seed: &FileFilter) -> FileFilter {
    let clone_dir = |d: &DirectionFilter| DirectionFilter {
        kmers: d.kmers.clone(),
        context_exists: d.context_exists.clone(),
        contexts: d.contexts.clone(),
        longest_ctx: d.longest_ctx.clone(),
        ending: d.ending.clone(),
    };
    FileFilter {
        dirs: [clone_dir(&seed.dirs[0]), clone_dir(&seed.dirs[1])],
    }
}

/// Combine per-file filters: strict pairing intersects the files
/// (orientation-insensitively), loose unions them. The result is closed
/// under reverse complement either way.
fn combine_filters(files: &[FileFilter], strict: bool) -> FxHashSet<u64> {
    let union_of = |f: &FileFilter| -> FxHashSet<u64> {
        f.dirs[0].kmers.union(&f.dirs[1].kmers).copied().collect()
    };

    let mut combined: FxHashSet<u64> = if strict && files.len() == 2 {
        let a = union_of(&files[0]);
        let b = union_of(&files[1]);
        a.iter()
            .filter(|&&m| b.contains(&m) || b.contains(&kmers::revcomp(m, K)))
            .copied()
            .collect()
    } else {
        let mut all = FxHashSet::default();
        for f in files {
            all.extend(union_of(f));
        }
        all
    };

    let rcs: Vec<u64> = combined.iter().map(|&m| kmers::revcomp(m, K)).collect();
    combined.extend(rcs);
    combined
}
