use crate::kelpie::kmers;
use anyhow::{bail, Context, Result};
use needletail::parse_fastx_file;
use std::fs::File;
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Reads per partition file in unfiltered mode.
pub const READS_PER_PARTITION: usize = 5_000_000;

/// Default sliding-window quality floor for FASTQ tail trimming.
pub const DEFAULT_MIN_QUAL: u8 = 30;

const QUAL_WINDOW: usize = 10;

/// One quality-trimmed, ACGT-only read.
#[derive(Debug, Clone)]
pub struct RawRead {
    pub header: String,
    pub seq: String,
}

#[derive(Debug, Clone, Copy)]
pub struct IngestOptions {
    pub min_qual: u8,
    /// Reads shorter than this after trimming are dropped.
    pub min_len: usize,
}

impl Default for IngestOptions {
    fn default() -> Self {
        IngestOptions {
            min_qual: DEFAULT_MIN_QUAL,
            min_len: kmers::KMER_SIZE,
        }
    }
}

/// Where the working reads live: in memory (pre-filtered inputs) or in
/// partitioned single-line-FASTA temp files (raw WGS inputs).
pub enum ReadSource {
    Memory {
        /// One array per file in a pair.
        files: Vec<Arc<Vec<RawRead>>>,
        longest_read: usize,
    },
    Partitioned(PartitionSet),
}

pub struct PartitionSet {
    pub dir: PathBuf,
    pub prefix: String,
    /// `files[file_in_pair][partition]`
    pub files: Vec<Vec<PartitionFile>>,
    pub longest_read: usize,
}

pub struct PartitionFile {
    pub path: PathBuf,
    pub reads: usize,
}

impl ReadSource {
    pub fn n_files(&self) -> usize {
        match self {
            ReadSource::Memory { files, .. } => files.len(),
            ReadSource::Partitioned(ps) => ps.files.len(),
        }
    }

    pub fn n_partitions(&self, file: usize) -> usize {
        match self {
            ReadSource::Memory { .. } => 1,
            ReadSource::Partitioned(ps) => ps.files[file].len(),
        }
    }

    pub fn total_reads(&self, file: usize) -> usize {
        match self {
            ReadSource::Memory { files, .. } => files[file].len(),
            ReadSource::Partitioned(ps) => ps.files[file].iter().map(|p| p.reads).sum(),
        }
    }

    pub fn longest_read(&self) -> usize {
        match self {
            ReadSource::Memory { longest_read, .. } => *longest_read,
            ReadSource::Partitioned(ps) => ps.longest_read,
        }
    }

    /// Load one partition of one file. Memory sources hand back their
    /// single shared array; partitioned sources read the temp file.
    pub fn load_partition(&self, file: usize, partition: usize) -> Result<Arc<Vec<RawRead>>> {
        match self {
            ReadSource::Memory { files, .. } => Ok(files[file].clone()),
            ReadSource::Partitioned(ps) => {
                let pf = &ps.files[file][partition];
                Ok(Arc::new(load_single_line_fasta(&pf.path)?))
            }
        }
    }
}

/* ------------------------------------------------------------------------- */
/*  Trimming                                                                 */
/* ------------------------------------------------------------------------- */

/// Kept length after sliding-window 3' quality trimming.
///
/// * `qual`   – raw quality bytes from the file
/// * `offset` – phred offset (33 or 64), sniffed per file
pub fn qual_trim_len(qual: &[u8], min_qual: u8, offset: u8) -> usize {
    let mut keep = qual.len();
    while keep > 0 {
        let start = keep.saturating_sub(QUAL_WINDOW);
        let window = &qual[start..keep];
        let sum: u32 = window
            .iter()
            .map(|&q| q.saturating_sub(offset) as u32)
            .sum();
        if sum >= min_qual as u32 * window.len() as u32 {
            break;
        }
        keep -= 1;
    }
    keep
}

/// Sniff the phred offset from a sample of quality bytes.
/// Anything below '@' (64) can only be phred+33.
pub fn sniff_phred_offset(sample: &[u8]) -> u8 {
    if sample.iter().any(|&q| q < 64) {
        33
    } else {
        64
    }
}

/// Strip an Illumina dark-cycle tail: a terminal run of a single base
/// whose last 16-mer packs to a uniform word (all-G from two-channel
/// chemistry, or the all-A zero word).
pub fn strip_dark_cycle_tail(seq: &mut String) {
    let bytes = seq.as_bytes();
    if bytes.len() < 16 {
        return;
    }
    let last = bytes[bytes.len() - 1];
    if last != b'G' && last != b'A' {
        return;
    }
    let tail = &bytes[bytes.len() - 16..];
    if !tail.iter().all(|&b| b == last) {
        return;
    }
    let run_start = bytes
        .iter()
        .rposition(|&b| b != last)
        .map(|p| p + 1)
        .unwrap_or(0);
    seq.truncate(run_start);
}

/// Apply quality trim, dark-cycle strip and the length/ACGT gate.
/// Returns `None` when the read should be dropped.
fn clean_read(header: &[u8], seq: &[u8], qual: Option<&[u8]>, offset: u8, opts: &IngestOptions) -> Option<RawRead> {
    let keep = match qual {
        Some(q) => qual_trim_len(q, opts.min_qual, offset),
        None => seq.len(),
    };
    let mut s = String::from_utf8_lossy(&seq[..keep]).to_uppercase();
    strip_dark_cycle_tail(&mut s);
    if s.len() < opts.min_len || !s.bytes().all(kmers::is_acgt) {
        return None;
    }
    Some(RawRead {
        header: String::from_utf8_lossy(header).into_owned(),
        seq: s,
    })
}

/* ------------------------------------------------------------------------- */
/*  Ingestion                                                                */
/* ------------------------------------------------------------------------- */

/// Group input paths by file-in-pair. Paired inputs alternate R1/R2 in
/// glob-expansion order; unpaired inputs all land in file 0.
fn group_by_pair(paths: &[PathBuf], paired: bool) -> Vec<Vec<PathBuf>> {
    if paired {
        let mut groups = vec![Vec::new(), Vec::new()];
        for (i, p) in paths.iter().enumerate() {
            groups[i % 2].push(p.clone());
        }
        groups
    } else {
        vec![paths.to_vec()]
    }
}

/// Sniff the phred offset of one file from its first records.
fn sniff_file_offset(path: &Path) -> Result<u8> {
    let mut reader = parse_fastx_file(path)
        .with_context(|| format!("opening {:?}", path))?;
    let mut sample = Vec::new();
    let mut n = 0;
    while let Some(rec) = reader.next() {
        let rec = rec.with_context(|| format!("reading {:?}", path))?;
        if let Some(q) = rec.qual() {
            sample.extend_from_slice(q);
        }
        n += 1;
        if n >= 1000 || sample.len() > 100_000 {
            break;
        }
    }
    Ok(sniff_phred_offset(&sample))
}

/// Pre-filtered mode: everything into memory, one array per file in a pair.
pub fn ingest_in_memory(paths: &[PathBuf], paired: bool, opts: &IngestOptions) -> Result<ReadSource> {
    let groups = group_by_pair(paths, paired);
    let mut files = Vec::with_capacity(groups.len());
    let mut longest = 0usize;

    for group in &groups {
        let mut reads: Vec<RawRead> = Vec::new();
        for path in group {
            let offset = sniff_file_offset(path)?;
            let mut reader = parse_fastx_file(path)
                .with_context(|| format!("opening {:?}", path))?;
            while let Some(rec) = reader.next() {
                let rec = rec.with_context(|| format!("reading {:?}", path))?;
                if let Some(r) = clean_read(rec.id(), &rec.seq(), rec.qual(), offset, opts) {
                    longest = longest.max(r.seq.len());
                    reads.push(r);
                }
            }
        }
        files.push(Arc::new(reads));
    }

    Ok(ReadSource::Memory {
        files,
        longest_read: longest,
    })
}

/// Unfiltered mode: stream every input into partition files of
/// `reads_per_partition` single-line-FASTA records, one writer per file in
/// a pair, plus the metadata sidecar for `--kept` resumption.
pub fn ingest_partitioned(
    paths: &[PathBuf],
    paired: bool,
    opts: &IngestOptions,
    tmp_dir: &Path,
    prefix: &str,
    reads_per_partition: usize,
) -> Result<ReadSource> {
    std::fs::create_dir_all(tmp_dir)
        .with_context(|| format!("creating temp dir {:?}", tmp_dir))?;
    let groups = group_by_pair(paths, paired);

    // One sequential writer per file in the pair
    let results: Vec<Result<(Vec<PartitionFile>, usize)>> = groups
        .iter()
        .enumerate()
        .map(|(file_idx, group)| write_partitions(group, file_idx, opts, tmp_dir, prefix, reads_per_partition))
        .collect();

    let mut files = Vec::new();
    let mut longest = 0usize;
    for r in results {
        let (parts, file_longest) = r?;
        longest = longest.max(file_longest);
        files.push(parts);
    }

    let ps = PartitionSet {
        dir: tmp_dir.to_path_buf(),
        prefix: prefix.to_string(),
        files,
        longest_read: longest,
    };
    write_metadata(&ps)?;
    Ok(ReadSource::Partitioned(ps))
}

fn write_partitions(
    group: &[PathBuf],
    file_idx: usize,
    opts: &IngestOptions,
    tmp_dir: &Path,
    prefix: &str,
    reads_per_partition: usize,
) -> Result<(Vec<PartitionFile>, usize)> {
    let mut parts: Vec<PartitionFile> = Vec::new();
    let mut writer: Option<BufWriter<File>> = None;
    let mut in_partition = 0usize;
    let mut longest = 0usize;

    for path in group {
        let offset = sniff_file_offset(path)?;
        let mut reader = parse_fastx_file(path)
            .with_context(|| format!("opening {:?}", path))?;
        while let Some(rec) = reader.next() {
            let rec = rec.with_context(|| format!("reading {:?}", path))?;
            let read = match clean_read(rec.id(), &rec.seq(), rec.qual(), offset, opts) {
                Some(r) => r,
                None => continue,
            };
            longest = longest.max(read.seq.len());

            if writer.is_none() || in_partition == reads_per_partition {
                if let Some(mut w) = writer.take() {
                    w.flush().context("flushing partition file")?;
                }
                let part_path =
                    tmp_dir.join(format!("{}_{}_{}.tmp", prefix, parts.len(), file_idx));
                writer = Some(BufWriter::new(File::create(&part_path).with_context(
                    || format!("creating partition file {:?}", part_path),
                )?));
                parts.push(PartitionFile {
                    path: part_path,
                    reads: 0,
                });
                in_partition = 0;
            }
            let w = writer.as_mut().unwrap();
            writeln!(w, ">{}", read.header).context("writing partition record")?;
            writeln!(w, "{}", read.seq).context("writing partition record")?;
            in_partition += 1;
            parts.last_mut().unwrap().reads += 1;
        }
    }
    if let Some(mut w) = writer.take() {
        w.flush().context("flushing partition file")?;
    }
    Ok((parts, longest))
}

fn metadata_path(dir: &Path, prefix: &str) -> PathBuf {
    dir.join(format!("{}_kept_metadata.txt", prefix))
}

/// Sidecar format: `longest<TAB>N`, then `<basename><TAB>readCount` per
/// partition file.
fn write_metadata(ps: &PartitionSet) -> Result<()> {
    let path = metadata_path(&ps.dir, &ps.prefix);
    let mut w = BufWriter::new(
        File::create(&path).with_context(|| format!("creating metadata {:?}", path))?,
    );
    writeln!(w, "longest\t{}", ps.longest_read)?;
    for parts in &ps.files {
        for pf in parts {
            let base = pf.path.file_name().unwrap().to_string_lossy();
            writeln!(w, "{}\t{}", base, pf.reads)?;
        }
    }
    w.flush()?;
    Ok(())
}

/// Resume from a preserved temp directory, skipping ingestion entirely.
pub fn resume_partitioned(kept_dir: &Path, prefix: &str) -> Result<ReadSource> {
    let meta = metadata_path(kept_dir, prefix);
    let reader = BufReader::new(
        File::open(&meta).with_context(|| format!("opening kept metadata {:?}", meta))?,
    );
    let mut longest = 0usize;
    let mut files: Vec<Vec<PartitionFile>> = Vec::new();

    for (lineno, line) in reader.lines().enumerate() {
        let line = line.context("reading kept metadata")?;
        let mut fields = line.split('\t');
        let name = fields.next().unwrap_or("");
        let value: usize = fields
            .next()
            .and_then(|v| v.parse().ok())
            .with_context(|| format!("bad metadata line {}", lineno + 1))?;
        if lineno == 0 {
            if name != "longest" {
                bail!("kept metadata {:?} does not start with a 'longest' line", meta);
            }
            longest = value;
            continue;
        }
        // Partition basenames end in `_<partition>_<fileInPair>.tmp`
        let stem = name.strip_suffix(".tmp").unwrap_or(name);
        let file_idx: usize = stem
            .rsplit('_')
            .next()
            .and_then(|v| v.parse().ok())
            .with_context(|| format!("bad partition name '{}' in metadata", name))?;
        while files.len() <= file_idx {
            files.push(Vec::new());
        }
        files[file_idx].push(PartitionFile {
            path: kept_dir.join(name),
            reads: value,
        });
    }
    if files.is_empty() {
        bail!("kept metadata {:?} lists no partition files", meta);
    }
    Ok(ReadSource::Partitioned(PartitionSet {
        dir: kept_dir.to_path_buf(),
        prefix: prefix.to_string(),
        files,
        longest_read: longest,
    }))
}

/// Read one single-line-FASTA partition file back into memory.
pub fn load_single_line_fasta(path: &Path) -> Result<Vec<RawRead>> {
    let reader = BufReader::new(
        File::open(path).with_context(|| format!("opening partition {:?}", path))?,
    );
    let mut reads = Vec::new();
    let mut header: Option<String> = None;
    for line in reader.lines() {
        let line = line.with_context(|| format!("reading partition {:?}", path))?;
        match header.take() {
            None => {
                let h = line
                    .strip_prefix('>')
                    .with_context(|| format!("malformed partition record in {:?}", path))?;
                header = Some(h.to_string());
            }
            Some(h) => reads.push(RawRead {
                header: h,
                seq: line,
            }),
        }
    }
    Ok(reads)
}
