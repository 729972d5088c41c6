use std::collections::HashSet;
use std::fs;
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};

use crossbeam_channel::Receiver;
use flate2::write::GzEncoder;
use flate2::Compression;
use itertools::Itertools;
use tracing::{debug, info, warn};

use glycoscreen::{Ranking, SummaryRow};

use crate::proc::{CombinationResult, FragmentOutcome, VerificationRow};
use crate::types::RANKINGS_DIR;

/// A tab-separated output table, optionally gzip-compressed
pub enum TableWriter {
    Plain(BufWriter<fs::File>),
    Gzip(GzEncoder<BufWriter<fs::File>>),
}

impl TableWriter {
    pub fn create(path: &Path) -> io::Result<Self> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let handle = BufWriter::new(fs::File::create(path)?);
        let compressed = path
            .extension()
            .map(|ext| ext.eq_ignore_ascii_case("gz"))
            .unwrap_or_default();
        if compressed {
            Ok(Self::Gzip(GzEncoder::new(handle, Compression::best())))
        } else {
            Ok(Self::Plain(handle))
        }
    }

    pub fn finish(self) -> io::Result<()> {
        match self {
            Self::Plain(mut handle) => handle.flush(),
            Self::Gzip(encoder) => encoder.finish()?.flush(),
        }
    }
}

impl Write for TableWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self {
            Self::Plain(handle) => handle.write(buf),
            Self::Gzip(encoder) => encoder.write(buf),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match self {
            Self::Plain(handle) => handle.flush(),
            Self::Gzip(encoder) => encoder.flush(),
        }
    }
}

/// The path of table `name` under `dir`, with `.gz` appended when compressing
pub fn table_path(dir: &Path, name: &str, compress: bool) -> PathBuf {
    if compress {
        dir.join(format!("{name}.gz"))
    } else {
        dir.join(name)
    }
}

fn file_safe(name: &str) -> String {
    name.chars()
        .map(|c| {
            if c.is_alphanumeric() || matches!(c, '-' | '_' | '.' | '+') {
                c
            } else {
                '_'
            }
        })
        .collect()
}

fn ranking_dir(output_dir: &Path, ranking: &Ranking) -> PathBuf {
    output_dir
        .join(RANKINGS_DIR)
        .join(file_safe(&ranking.molecule))
        .join(file_safe(&ranking.adduct))
}

pub fn ranking_path(output_dir: &Path, ranking: &Ranking, compress: bool) -> PathBuf {
    let dir = ranking_dir(output_dir, ranking);
    table_path(&dir, &format!("{}.tsv", file_safe(&ranking.spectrum)), compress)
}

/// Like [`ranking_path`], but never returns a path already in `claimed`.
///
/// Spectrum names that sanitize to the same file name get a numeric suffix.
pub fn claim_ranking_path(
    claimed: &mut HashSet<PathBuf>,
    output_dir: &Path,
    ranking: &Ranking,
    compress: bool,
) -> PathBuf {
    let path = ranking_path(output_dir, ranking, compress);
    if claimed.insert(path.clone()) {
        return path;
    }
    let dir = ranking_dir(output_dir, ranking);
    let stem = file_safe(&ranking.spectrum);
    let mut suffix = 2usize;
    loop {
        let candidate = table_path(&dir, &format!("{stem}_{suffix}.tsv"), compress);
        if claimed.insert(candidate.clone()) {
            warn!(
                "Ranking for {} would overwrite {}, writing it to {} instead",
                ranking.spectrum,
                path.display(),
                candidate.display()
            );
            return candidate;
        }
        suffix += 1;
    }
}

pub fn write_ranking<W: Write>(writer: &mut W, ranking: &Ranking) -> io::Result<()> {
    writeln!(
        writer,
        "rank\tcandidate\tcosine\ttanimoto\tnbCommonPeaks\tnbPeaks1\tnbPeaks2\tsolution\tnote"
    )?;
    for (i, row) in ranking.iter().enumerate() {
        writeln!(
            writer,
            "{}\t{}\t{:.6}\t{:.6}\t{}\t{}\t{}\t{}\t{}",
            i + 1,
            row.candidate,
            row.scores.cosine,
            row.scores.tanimoto,
            row.scores.nb_common_peaks,
            row.scores.nb_peaks1,
            row.scores.nb_peaks2,
            if row.is_solution { "*" } else { "" },
            if row.applicable { "" } else { "NA" },
        )?;
    }
    Ok(())
}

pub fn write_summary<W: Write>(writer: &mut W, rows: &[SummaryRow]) -> io::Result<()> {
    writeln!(
        writer,
        "molecule\tadduct\tspectrum\trank\ttotal\tsolutionScore\tbestCandidate\tbestScore"
    )?;
    for row in rows.iter() {
        if !row.applicable {
            writeln!(
                writer,
                "{}\t{}\t{}\tNA\t{}\tNA\tNA\tNA",
                row.molecule, row.adduct, row.spectrum, row.total,
            )?;
            continue;
        }
        writeln!(
            writer,
            "{}\t{}\t{}\t{}\t{}\t{:.6}\t{}\t{:.6}",
            row.molecule,
            row.adduct,
            row.spectrum,
            row.solution_rank,
            row.total,
            row.solution_score,
            row.best_candidate.as_deref().unwrap_or("NA"),
            row.best_score,
        )?;
    }
    Ok(())
}

pub fn write_precursors<W: Write>(writer: &mut W, outcomes: &[FragmentOutcome]) -> io::Result<()> {
    writeln!(writer, "candidate\tadduct\tprecursorNodes\tdescendantMasses")?;
    for outcome in outcomes.iter() {
        match outcome.subtree() {
            Some(subtree) => writeln!(
                writer,
                "{}\t{}\t{}\t{}",
                outcome.candidate,
                outcome.adduct,
                subtree.precursors.iter().map(|id| id.get()).join(","),
                subtree.masses.iter().map(|m| format!("{m:.4}")).join(","),
            )?,
            None => writeln!(writer, "{}\t{}\tNA\tNA", outcome.candidate, outcome.adduct)?,
        }
    }
    Ok(())
}

pub fn write_verification<W: Write>(writer: &mut W, rows: &[VerificationRow]) -> io::Result<()> {
    writeln!(
        writer,
        "molecule\tadduct\tspectrum\tvalidEdges\tinvalidEdges\tunknownNodes\tmatchedPeaks\tpeaksUnderPrecursor"
    )?;
    for row in rows.iter() {
        writeln!(
            writer,
            "{}\t{}\t{}\t{}\t{}\t{}\t{}\t{}",
            row.molecule,
            row.adduct,
            row.spectrum,
            row.report.valid_edges,
            row.report.invalid_edges.len(),
            row.report.unknown_nodes.len(),
            row.report.matched_peaks.len(),
            row.report.peaks_under_precursor(),
        )?;
    }
    Ok(())
}

/// Write each ranking as it arrives and collect the summary and verification rows in
/// combination order.
pub fn write_output_rankings(
    receiver: Receiver<(usize, CombinationResult)>,
    output_dir: PathBuf,
    compress: bool,
) -> io::Result<(Vec<SummaryRow>, Vec<VerificationRow>)> {
    let mut summaries = Vec::new();
    let mut verifications = Vec::new();
    let mut claimed = HashSet::new();
    let mut counter = 0usize;
    while let Ok((idx, result)) = receiver.recv() {
        counter += 1;
        let path = claim_ranking_path(&mut claimed, &output_dir, &result.ranking, compress);
        let mut writer = TableWriter::create(&path)?;
        write_ranking(&mut writer, &result.ranking)?;
        writer.finish()?;
        if counter % 1000 == 0 {
            let queue_size = receiver.len();
            info!("Completed Ranking {counter} | {queue_size} items in the write queue");
        }
        summaries.push((idx, SummaryRow::from_ranking(&result.ranking)));
        if let Some(row) = result.verification {
            verifications.push((idx, row));
        }
    }
    debug!("Wrote {counter} rankings under {}", output_dir.display());
    let summaries = summaries
        .into_iter()
        .sorted_by_key(|(i, _)| *i)
        .map(|(_, row)| row)
        .collect();
    let verifications = verifications
        .into_iter()
        .sorted_by_key(|(i, _)| *i)
        .map(|(_, row)| row)
        .collect();
    Ok((summaries, verifications))
}
