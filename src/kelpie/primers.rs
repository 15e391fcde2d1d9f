use crate::kelpie::kmers::{self, MAX_K};
use anyhow::{bail, Result};
use fxhash::FxHashSet;

/// Bases at the 3' end of a degenerate primer core that are never
/// substituted (the latch).
pub const DEGENERATE_HCL: usize = 2;

/// Concrete bases represented by one IUPAC code.
pub fn iupac_bases(code: u8) -> Option<&'static [u8]> {
    match code.to_ascii_uppercase() {
        b'A' => Some(b"A"),
        b'C' => Some(b"C"),
        b'G' => Some(b"G"),
        b'T' => Some(b"T"),
        b'R' => Some(b"AG"),
        b'Y' => Some(b"CT"),
        b'M' => Some(b"AC"),
        b'K' => Some(b"GT"),
        b'S' => Some(b"CG"),
        b'W' => Some(b"AT"),
        b'H' => Some(b"ACT"),
        b'B' => Some(b"CGT"),
        b'V' => Some(b"ACG"),
        b'D' => Some(b"AGT"),
        b'N' | b'I' => Some(b"ACGT"),
        _ => None,
    }
}

/// Does `base` satisfy the IUPAC `code`?
#[inline]
pub fn matches_code(base: u8, code: u8) -> bool {
    iupac_bases(code)
        .map(|set| set.contains(&base.to_ascii_uppercase()))
        .unwrap_or(false)
}

/// Count positions of `seq` that fall outside the degenerate pattern.
pub fn mismatches_vs_pattern(seq: &[u8], pattern: &[u8]) -> usize {
    seq.iter()
        .zip(pattern.iter())
        .filter(|(&b, &p)| !matches_code(b, p))
        .count()
}

/// Complement of a single IUPAC code.
fn comp_code(code: u8) -> u8 {
    match code.to_ascii_uppercase() {
        b'A' => b'T',
        b'T' => b'A',
        b'C' => b'G',
        b'G' => b'C',
        b'R' => b'Y',
        b'Y' => b'R',
        b'M' => b'K',
        b'K' => b'M',
        b'S' => b'S',
        b'W' => b'W',
        b'H' => b'D',
        b'D' => b'H',
        b'B' => b'V',
        b'V' => b'B',
        b'I' => b'N',
        _ => b'N',
    }
}

/// Reverse complement of a degenerate pattern.
pub fn revcomp_pattern(pattern: &str) -> String {
    pattern
        .bytes()
        .rev()
        .map(|b| comp_code(b) as char)
        .collect()
}

/// One primer in one orientation, expanded for fast scanning.
///
/// The primer is split into a head and a core (`core = max(⌊3·len/4⌋, 15)`).
/// `heads` and `cores` hold every packed concrete variant within the
/// mismatch budget; the scanner tests core membership first, then the head,
/// then recounts mismatches against `pattern`.
pub struct Primer {
    /// Degenerate pattern, oriented the way it is scanned.
    pub pattern: Vec<u8>,
    pub head_len: usize,
    pub core_len: usize,
    /// Packed head variants. Empty when `head_len` is 0.
    pub heads: FxHashSet<u64>,
    /// Packed core variants.
    pub cores: FxHashSet<u64>,
    /// Total mismatches allowed when recounting a head+core hit.
    pub allowed_mismatches: usize,
}

impl Primer {
    pub fn len(&self) -> usize {
        self.head_len + self.core_len
    }

    /// Expand `pattern` into its head/core variant sets.
    ///
    /// Returns an error for primers longer than 32 bases (the packed-word
    /// limit) or containing unknown codes.
    pub fn build(pattern: &str, mismatches: usize) -> Result<Primer> {
        let pat = pattern.to_ascii_uppercase().into_bytes();
        let len = pat.len();
        if len == 0 {
            bail!("empty primer");
        }
        if len > MAX_K {
            bail!("primer '{}' is longer than {} bases", pattern, MAX_K);
        }
        for &b in &pat {
            if iupac_bases(b).is_none() {
                bail!("primer '{}' contains unknown base '{}'", pattern, b as char);
            }
        }

        let core_len = ((3 * len) / 4).max(15).min(len);
        let head_len = len - core_len;

        // The latch only applies to degenerate primers (>= 20% ambiguity codes)
        let degenerate_bases = pat.iter().filter(|&&b| !kmers::is_acgt(b)).count();
        let locked_tail = if degenerate_bases * 5 >= len {
            DEGENERATE_HCL.min(core_len)
        } else {
            0
        };

        // Split the budget between head and core. A budget of 1 allows the
        // single mismatch on either side; the scanner's recount against the
        // degenerate pattern rejects combined head+core totals over budget.
        let (head_mm, core_mm) = match mismatches {
            0 => (0, 0),
            1 => (1usize.min(head_len), 1),
            m => {
                let core_share = (m * core_len) / len;
                ((m - core_share).min(head_len), core_share.max(1))
            }
        };

        let heads = if head_len > 0 {
            pack_variants(&pat[..head_len], head_mm, 0)?
        } else {
            FxHashSet::default()
        };
        let cores = pack_variants(&pat[head_len..], core_mm, locked_tail)?;

        Ok(Primer {
            pattern: pat,
            head_len,
            core_len,
            heads,
            cores,
            allowed_mismatches: mismatches,
        })
    }
}

/// Expand a (possibly degenerate) pattern segment into all concrete
/// variants within `mismatches` substitutions, packed.
///
/// * `locked_tail` – number of 3' bases excluded from substitution
fn pack_variants(pattern: &[u8], mismatches: usize, locked_tail: usize) -> Result<FxHashSet<u64>> {
    // Product enumeration of the degenerate codes
    let mut concrete: Vec<Vec<u8>> = vec![Vec::with_capacity(pattern.len())];
    for &code in pattern {
        let bases = iupac_bases(code).expect("validated earlier");
        let mut next = Vec::with_capacity(concrete.len() * bases.len());
        for prefix in &concrete {
            for &b in bases {
                let mut v = prefix.clone();
                v.push(b);
                next.push(v);
            }
        }
        concrete = next;
    }

    // Substitution rounds on top of the concrete expansions
    let sub_range = pattern.len() - locked_tail;
    let mut variants: FxHashSet<Vec<u8>> = concrete.into_iter().collect();
    for _ in 0..mismatches {
        let mut added: Vec<Vec<u8>> = Vec::new();
        for v in &variants {
            for pos in 0..sub_range {
                for &b in b"ACGT" {
                    if v[pos] != b {
                        let mut s = v.clone();
                        s[pos] = b;
                        added.push(s);
                    }
                }
            }
        }
        variants.extend(added);
    }

    let k = pattern.len();
    let mut packed = FxHashSet::default();
    for v in &variants {
        if let Some(p) = kmers::pack(v, 0, k) {
            packed.insert(p);
        }
    }
    Ok(packed)
}

/// Which primer matched a read.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PrimerType {
    /// Forward primer at the 5' end
    FP = 0,
    /// Reverse primer at the 5' end (other end of the region)
    RP = 1,
    /// Reverse complement of the forward primer at the 3' end
    FPrc = 2,
    /// Reverse complement of the reverse primer at the 3' end
    RPrc = 3,
}

impl PrimerType {
    pub fn tag(&self) -> &'static str {
        match self {
            PrimerType::FP => ";FP",
            PrimerType::RP => ";RP",
            PrimerType::FPrc => ";FP'",
            PrimerType::RPrc => ";RP'",
        }
    }

    pub fn from_bits(bits: u32) -> PrimerType {
        match bits & 0x3 {
            0 => PrimerType::FP,
            1 => PrimerType::RP,
            2 => PrimerType::FPrc,
            _ => PrimerType::RPrc,
        }
    }
}

/// The four primer orientations kept for scanning: F, R, F' = revcomp(F),
/// R' = revcomp(R). The terminating primer during extension is R'.
pub struct PrimerSet {
    pub fwd: Primer,
    pub rvs: Primer,
    pub fwd_rc: Primer,
    pub rvs_rc: Primer,
}

impl PrimerSet {
    pub fn build(forward: &str, reverse: &str, mm_f: usize, mm_r: usize) -> Result<PrimerSet> {
        Ok(PrimerSet {
            fwd: Primer::build(forward, mm_f)?,
            rvs: Primer::build(reverse, mm_r)?,
            fwd_rc: Primer::build(&revcomp_pattern(forward), mm_f)?,
            rvs_rc: Primer::build(&revcomp_pattern(reverse), mm_r)?,
        })
    }

    pub fn get(&self, t: PrimerType) -> &Primer {
        match t {
            PrimerType::FP => &self.fwd,
            PrimerType::RP => &self.rvs,
            PrimerType::FPrc => &self.fwd_rc,
            PrimerType::RPrc => &self.rvs_rc,
        }
    }

    /// The longer of the two primers, used for 3' trim windows.
    pub fn max_len(&self) -> usize {
        self.fwd.len().max(self.rvs.len())
    }
}
