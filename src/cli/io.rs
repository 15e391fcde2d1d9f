use crate::kelpie::extend::ExtendOutcome;
use crate::kelpie::scan::PartitionScan;
use crate::kelpie::select::Selection;
use anyhow::{Context, Result};
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;
use std::sync::Mutex;

/// Optional debug trace. Lines are only formatted when the log was
/// requested, so the closures cost nothing in normal runs.
pub struct TraceLog {
    inner: Option<Mutex<BufWriter<File>>>,
}

impl TraceLog {
    pub fn disabled() -> TraceLog {
        TraceLog { inner: None }
    }

    pub fn create(path: &Path) -> Result<TraceLog> {
        let file = File::create(path).with_context(|| format!("creating log {:?}", path))?;
        Ok(TraceLog {
            inner: Some(Mutex::new(BufWriter::new(file))),
        })
    }

    pub fn line<F: FnOnce() -> String>(&self, msg: F) {
        if let Some(w) = &self.inner {
            let mut w = w.lock().unwrap();
            let _ = writeln!(w, "{}", msg());
        }
    }

    pub fn flush(&self) {
        if let Some(w) = &self.inner {
            let _ = w.lock().unwrap().flush();
        }
    }
}

/// Write the reconstructed amplicons and, beside them, the de-duplicated
/// discards with their multiplicities.
///
/// * Amplicon headers: `>Rn;FP=<forward primer>;TP=<matched bases|noTPFound>`
/// * Discard headers:  `>Dn;size=<multiplicity>`
pub fn write_output(output: &Path, outcome: &ExtendOutcome) -> Result<()> {
    let mut w = BufWriter::new(
        File::create(output).with_context(|| format!("creating output {:?}", output))?,
    );
    for (n, a) in outcome.amplicons.iter().enumerate() {
        let tp = a.tp.as_deref().unwrap_or("noTPFound");
        writeln!(w, ">R{};FP={};TP={}", n + 1, a.fp, tp).context("writing amplicon")?;
        writeln!(w, "{}", a.seq).context("writing amplicon")?;
    }
    w.flush()?;

    if !outcome.discards.is_empty() {
        let discard_path = sibling_path(output, "_discards");
        let mut w = BufWriter::new(
            File::create(&discard_path)
                .with_context(|| format!("creating discards {:?}", discard_path))?,
        );
        for (n, (seq, size)) in outcome.discards.iter().enumerate() {
            writeln!(w, ">D{};size={}", n + 1, size).context("writing discard")?;
            writeln!(w, "{}", seq).context("writing discard")?;
        }
        w.flush()?;
    }
    Ok(())
}

/// Per-primer occurrence report: one line per distinct matched primer
/// sequence, grouped by orientation.
pub fn write_primer_report(output: &Path, scans: &[Vec<PartitionScan>]) -> Result<()> {
    let path = sibling_path(output, "_primers");
    let path = path.with_extension("txt");
    let mut counts: Vec<((u8, String), u64)> = {
        let mut merged = fxhash::FxHashMap::<(u8, String), u64>::default();
        for file_scans in scans {
            for scan in file_scans {
                for (key, n) in &scan.primer_counts {
                    *merged.entry(key.clone()).or_insert(0) += n;
                }
            }
        }
        merged.into_iter().collect()
    };
    counts.sort_unstable_by(|a, b| a.0.cmp(&b.0));

    let mut w = BufWriter::new(
        File::create(&path).with_context(|| format!("creating primer report {:?}", path))?,
    );
    writeln!(w, "primer\tsequence\tcount")?;
    for ((t, seq), n) in counts {
        let label = match t {
            0 => "FP",
            1 => "RP",
            2 => "FP'",
            _ => "RP'",
        };
        writeln!(w, "{}\t{}\t{}", label, seq, n)?;
    }
    w.flush()?;
    Ok(())
}

/// Save the selected reads; the file round-trips as `--filtered` input.
pub fn write_saved_reads(output: &Path, tag: &str, selection: &Selection) -> Result<()> {
    let dir = output.parent().unwrap_or(Path::new("."));
    let path = dir.join(format!("Kelpie_filtered_reads_{}.fa", tag));
    let mut w = BufWriter::new(
        File::create(&path).with_context(|| format!("creating saved reads {:?}", path))?,
    );
    for r in &selection.reads {
        writeln!(w, ">{}", r.header)?;
        writeln!(w, "{}", r.seq)?;
    }
    w.flush()?;
    Ok(())
}

/// `<stem><suffix>.<ext>` next to `path`.
fn sibling_path(path: &Path, suffix: &str) -> std::path::PathBuf {
    let stem = path.file_stem().unwrap_or_default().to_string_lossy();
    let ext = path
        .extension()
        .map(|e| format!(".{}", e.to_string_lossy()))
        .unwrap_or_default();
    path.with_file_name(format!("{}{}{}", stem, suffix, ext))
}
