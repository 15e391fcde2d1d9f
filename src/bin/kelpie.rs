use anyhow::{bail, Context, Result};
use clap::Parser;
use indicatif::{ProgressBar, ProgressStyle};
use kelpie::cli::io::{write_output, write_primer_report, write_saved_reads};
use kelpie::cli::opts::Cli;
use kelpie::cli::TraceLog;
use kelpie::kelpie::scan::PartitionScan;
use kelpie::kelpie::{denoise, extend, filter, primers, reads, scan, select, starts, tables};
use rayon::prelude::*;
use std::path::Path;
use std::sync::Arc;
use std::time::Instant;

fn main() {
    // Catch and handle errors so temp state is reported, not swallowed
    if let Err(e) = run() {
        eprintln!("{:?}", e);
        std::process::exit(1);
    }
    std::process::exit(0);
}

fn run() -> Result<()> {
    let start_time = Instant::now();
    let opt = Cli::parse();
    opt.validate()?;

    let (inputs, output) = opt.split_files()?;
    if inputs.is_empty() {
        bail!("no input files matched");
    }
    let paired = opt.is_paired(inputs.len());
    let (mm_f, mm_r) = opt.resolve_mismatches()?;
    let length_hint = opt.resolve_length()?;

    rayon::ThreadPoolBuilder::new()
        .num_threads(opt.resolve_threads()?)
        .build_global()
        .context("building Rayon thread pool")?;

    let log = if opt.log {
        TraceLog::create(Path::new("KelpieLog.txt"))?
    } else {
        TraceLog::disabled()
    };

    println!("Start: Expanding primers");
    let primer_set =
        primers::PrimerSet::build(&opt.forward_primer, &opt.reverse_primer, mm_f, mm_r)?;

    println!("Start: Reading inputs");
    let ingest_opts = reads::IngestOptions {
        min_qual: opt.qual_trim,
        ..Default::default()
    };
    let prefix = output
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| "kelpie".to_string());
    let source = if let Some(kept) = &opt.kept {
        reads::resume_partitioned(kept, &prefix)?
    } else if opt.filtered {
        reads::ingest_in_memory(&inputs, paired, &ingest_opts)?
    } else {
        let tmp_dir = opt.tmp.clone().unwrap_or_else(std::env::temp_dir);
        reads::ingest_partitioned(
            &inputs,
            paired,
            &ingest_opts,
            &tmp_dir,
            &prefix,
            reads::READS_PER_PARTITION,
        )?
    };

    if paired && source.n_files() == 2 && source.total_reads(0) != source.total_reads(1) {
        println!(
            "WARNING — mate files differ in read counts ({} vs {}); pair resolution may be incomplete",
            source.total_reads(0),
            source.total_reads(1)
        );
    }

    println!("Start: Scanning for primers");
    let total_parts: usize = (0..source.n_files()).map(|f| source.n_partitions(f)).sum();
    let pb = progress_bar(total_parts);
    let scans: Vec<Vec<PartitionScan>> = (0..source.n_files())
        .map(|file| {
            (0..source.n_partitions(file))
                .into_par_iter()
                .map(|part| -> Result<PartitionScan> {
                    let part_reads = source.load_partition(file, part)?;
                    let s = scan::scan_partition(&part_reads, &primer_set);
                    pb.inc(1);
                    Ok(s)
                })
                .collect::<Result<_>>()
        })
        .collect::<Result<_>>()?;
    pb.finish_with_message("| Finished primer scan");

    let starting_hits: usize = scans
        .iter()
        .flatten()
        .map(|s| s.hits[0].len() + s.hits[2].len())
        .sum();
    if starting_hits == 0 {
        bail!("No starting primer reads found");
    }
    if opt.primers {
        write_primer_report(&output, &scans)?;
    }

    println!("Start: Building region filter");
    let mut prepped = filter::prep_starting_reads(&scans);
    let trimmed = filter::trim_adapters(&mut prepped);
    log.line(|| format!("adapter trap trimmed {} primer reads", trimmed));
    let filter_params = filter::FilterParams {
        strict: opt.is_strict() && paired && source.n_files() == 2,
        drop_low_complexity: !opt.no_lcf,
        length_hint,
    };
    let region = filter::build_region_filter(&source, &scans, &prepped, &filter_params, &log)?;
    if region.total_ending_reads == 0 {
        println!(
            "WARNING — no overlap found in primer-derived reads. Results may be unreliable"
        );
    }

    println!("Start: Selecting region reads");
    let mut selection = select_with_progress(&source, &scans, &region, paired, &log)?;
    if let Some(tag) = &opt.save {
        write_saved_reads(&output, tag, &selection)?;
    }

    println!("Start: Building extension tables");
    let ext_tables = tables::build_tables(&selection.reads, source.longest_read(), &log);

    println!("Start: Denoising k-mer table");
    let stats = denoise::denoise(&ext_tables, &selection.reads, opt.min_depth, &log);

    println!("Start: Preparing starting reads");
    let prepared = starts::prepare_starting_reads(&ext_tables, &mut selection, &primer_set, &log);
    if prepared.reads.is_empty() {
        bail!("No starting primer reads found");
    }

    println!("Start: Extending starting reads");
    let max_extended = length_hint
        .map(|(_, hi)| hi + primer_set.fwd.len() + primer_set.rvs.len() + 100)
        .unwrap_or(4000);
    let ext_params = extend::ExtendParams {
        max_extended_length: max_extended,
        min_extended_length: opt.min_length,
        pair_check_size: source.longest_read().min(100).max(48),
    };
    let extender = extend::Extender::new(
        &ext_tables,
        &selection,
        &stats,
        &primer_set,
        &prepared,
        ext_params,
    );
    let outcome = extender.run(&log);

    println!("Start: Writing amplicons");
    write_output(&output, &outcome)?;
    summarise(&outcome);
    log.flush();

    println!("Elapsed time: {:.2?}", start_time.elapsed());
    Ok(())
}

fn progress_bar(len: usize) -> Arc<ProgressBar> {
    let pb = Arc::new(ProgressBar::new(len as u64));
    pb.set_style(
        ProgressStyle::default_bar()
            .template("       {bar:40} {pos}/{len} [{elapsed_precise}] {msg}")
            .unwrap(),
    );
    pb
}

fn select_with_progress(
    source: &reads::ReadSource,
    scans: &[Vec<PartitionScan>],
    region: &filter::RegionFilterResult,
    paired: bool,
    log: &TraceLog,
) -> Result<select::Selection> {
    let selection = select::select_reads(source, scans, &region.kmers, paired, log)?;
    println!(
        "       {} reads selected from {} region kmers",
        selection.reads.len(),
        region.kmers.len()
    );
    Ok(selection)
}

/// Amplicon count and length spread, printed at the end of the run.
fn summarise(outcome: &extend::ExtendOutcome) {
    if outcome.amplicons.is_empty() {
        println!("No amplicons reconstructed");
        return;
    }
    let mut lengths: Vec<usize> = outcome.amplicons.iter().map(|a| a.seq.len()).collect();
    lengths.sort_unstable();
    println!(
        "{} amplicons, lengths {}..{} (median {})",
        lengths.len(),
        lengths.first().unwrap(),
        lengths.last().unwrap(),
        lengths[lengths.len() / 2]
    );
    let discarded: usize = outcome.discards.iter().map(|&(_, n)| n).sum();
    if discarded > 0 {
        println!(
            "{} extensions discarded ({} distinct)",
            discarded,
            outcome.discards.len()
        );
    }
}
