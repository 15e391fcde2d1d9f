use crate::kelpie::kmers::KMER_SIZE;
use anyhow::{bail, Context, Result};
use clap::Parser;
use std::path::PathBuf;

/// Command-line options for the inter-primer amplicon assembler
#[derive(Parser)]
#[command(
    name = "kelpie",
    about = "Extract and assemble full-length inter-primer amplicons from short reads",
    long_about = "Extract and assemble full-length inter-primer amplicons from short reads.


EXAMPLES:
    // 16S V4 from pre-filtered reads
    $ kelpie -f GTGYCAGCMGCCGCGGTAA -r GGACTACNVGGGTWTCTAAT --filtered 16S_V4_reads.fa 16S_V4_amplicons.fa

    // COI from raw WGS files, two mate files, strict pairing
    $ kelpie -f GGWACWGGWTGAACWGTWTAYCCYCC -r TANACYTCNGGRTGNCCRAARAAYCA -t 8 'sample_R?.fastq.gz' COI.fa
    ",
    version = "0.1.0"
)]
pub struct Cli {
    /// Forward primer, 5'→3', IUPAC ambiguity codes allowed [sequence]
    #[clap(short = 'f', long, value_parser, required = true, help_heading = "Core")]
    pub forward_primer: String,

    /// Reverse primer, 5'→3' on the opposite strand [sequence]
    #[clap(short = 'r', long, value_parser, required = true, help_heading = "Core")]
    pub reverse_primer: String,

    /// Input read files or glob patterns, then the output FASTA name.
    ///
    /// The last value is always the output file; everything before it is
    /// expanded as input (FASTA/FASTQ, optionally gzipped).
    #[clap(required = true, num_args = 2..)]
    pub files: Vec<String>,

    /// Number of threads, or 'max' for every core [integer|max]
    #[clap(short = 't', long, help_heading = "Core")]
    pub threads: Option<String>,

    /// Inputs were already filtered down to the region; keep them in memory [flag]
    #[clap(long, conflicts_with = "unfiltered", help_heading = "Core")]
    pub filtered: bool,

    /// Inputs are raw WGS reads; partition them through temp files [flag]
    #[clap(long, help_heading = "Core")]
    pub unfiltered: bool,

    /// Treat input files as R1/R2 pairs in glob order [flag]
    #[clap(long, conflicts_with = "unpaired", help_heading = "Core")]
    pub paired: bool,

    /// Treat every input file independently [flag]
    #[clap(long, help_heading = "Core")]
    pub unpaired: bool,

    /// Keep only region k-mers present in both mate files [flag]
    #[clap(long, conflicts_with = "loose", help_heading = "Filtering")]
    pub strict: bool,

    /// Keep region k-mers found in either mate file [flag]
    #[clap(long, help_heading = "Filtering")]
    pub loose: bool,

    /// Primer mismatch budget: 'N' for both, or 'Nf+Mr' [string]
    #[clap(long = "mm", alias = "mismatches", default_value = "1", help_heading = "Primers")]
    pub mismatches: String,

    /// Emit extensions at least this long even without a terminating primer [integer]
    #[clap(long = "min", alias = "min-length", help_heading = "Extension")]
    pub min_length: Option<usize>,

    /// Expected amplicon length 'N' or 'N-M'; drives iteration caps [string]
    #[clap(long, help_heading = "Extension")]
    pub length: Option<String>,

    /// Depth floor for k-mer retention [integer]
    #[clap(long = "mindepth", default_value = "2", help_heading = "Filtering")]
    pub min_depth: u32,

    /// FASTQ 3' sliding-window quality floor; 0 disables trimming [integer]
    #[clap(long = "qualtrim", alias = "qt", default_value = "30", help_heading = "Filtering")]
    pub qual_trim: u8,

    /// Keep low-complexity k-mers in the region filter [flag]
    #[clap(long = "noLCF", alias = "no-lcf", help_heading = "Filtering")]
    pub no_lcf: bool,

    /// Write the selected region reads to Kelpie_filtered_reads_<TAG>.fa [string]
    #[clap(long, help_heading = "Files")]
    pub save: Option<String>,

    /// Write a per-primer occurrence report [flag]
    #[clap(long, help_heading = "Files")]
    pub primers: bool,

    /// Directory for partitioned temp files [path]
    #[clap(long, help_heading = "Files")]
    pub tmp: Option<PathBuf>,

    /// Resume from preserved temp files written by an earlier run [path]
    #[clap(long, help_heading = "Files")]
    pub kept: Option<PathBuf>,

    /// Write a debug trace to KelpieLog.txt [flag]
    #[clap(long, help_heading = "Files")]
    pub log: bool,
}

impl Cli {
    /// Split the positional values into expanded input paths and the
    /// output name, expanding glob patterns in order.
    pub fn split_files(&self) -> Result<(Vec<PathBuf>, PathBuf)> {
        let (inputs, output) = self.files.split_at(self.files.len() - 1);
        let mut paths = Vec::new();
        for pattern in inputs {
            let before = paths.len();
            for entry in
                glob::glob(pattern).with_context(|| format!("bad input pattern '{}'", pattern))?
            {
                paths.push(entry.context("expanding input pattern")?);
            }
            if paths.len() == before {
                // Not a pattern match; accept a literal path so missing
                // files fail with a clear open error later
                paths.push(PathBuf::from(pattern));
            }
        }
        Ok((paths, PathBuf::from(&output[0])))
    }

    /// Thread-pool size: explicit count, 'max', or half the cores.
    pub fn resolve_threads(&self) -> Result<usize> {
        match self.threads.as_deref() {
            None => Ok((num_threads_available() / 2).max(1)),
            Some("max") => Ok(num_threads_available()),
            Some(v) => v
                .parse::<usize>()
                .ok()
                .filter(|&n| n >= 1)
                .with_context(|| format!("bad thread count '{}'", v)),
        }
    }

    /// Mismatch budgets: 'N' applies to both primers, 'Nf+Mr' splits them.
    pub fn resolve_mismatches(&self) -> Result<(usize, usize)> {
        let v = &self.mismatches;
        if let Some((f, r)) = v.split_once('+') {
            let f = f.trim_end_matches(['f', 'F']);
            let r = r.trim_end_matches(['r', 'R']);
            let mf = f
                .parse()
                .with_context(|| format!("bad mismatch budget '{}'", v))?;
            let mr = r
                .parse()
                .with_context(|| format!("bad mismatch budget '{}'", v))?;
            Ok((mf, mr))
        } else {
            let m = v
                .parse()
                .with_context(|| format!("bad mismatch budget '{}'", v))?;
            Ok((m, m))
        }
    }

    /// Expected amplicon length range from 'N' or 'N-M'.
    pub fn resolve_length(&self) -> Result<Option<(usize, usize)>> {
        match &self.length {
            None => Ok(None),
            Some(v) => {
                let (lo, hi) = match v.split_once('-') {
                    Some((lo, hi)) => (
                        lo.parse().with_context(|| format!("bad length '{}'", v))?,
                        hi.parse().with_context(|| format!("bad length '{}'", v))?,
                    ),
                    None => {
                        let n: usize = v.parse().with_context(|| format!("bad length '{}'", v))?;
                        (n, n)
                    }
                };
                if lo == 0 || hi < lo {
                    bail!("bad length range '{}'", v);
                }
                Ok(Some((lo, hi)))
            }
        }
    }

    pub fn is_paired(&self, n_inputs: usize) -> bool {
        if self.unpaired {
            return false;
        }
        self.paired || (n_inputs > 1 && n_inputs % 2 == 0)
    }

    pub fn is_strict(&self) -> bool {
        !self.loose
    }

    /// Cross-field validation that clap cannot express.
    pub fn validate(&self) -> Result<()> {
        let floor = KMER_SIZE + self.forward_primer.len() + self.reverse_primer.len();
        if let Some(min) = self.min_length {
            if min < floor {
                bail!(
                    "-min {} is below the hard floor of {} (k-mer size plus both primers)",
                    min,
                    floor
                );
            }
        }
        if self.kept.is_some() && self.filtered {
            bail!("--kept resumes partitioned temp files and conflicts with --filtered");
        }
        Ok(())
    }
}

fn num_threads_available() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
}
