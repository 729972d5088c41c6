//! Rank candidate structures against an experimental spectrum and summarize where the
//! known-correct structure lands.
use std::cmp::Ordering;
use std::collections::{BTreeMap, HashMap};
use std::fmt::Display;
use std::str::FromStr;

use itertools::Itertools;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::rules::AdductLabel;
use crate::scorer::{ScoringResult, SpectrumComparator};
use crate::spectrum::ExperimentalSpectrum;

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Metric {
    #[default]
    Cosine,
    Tanimoto,
}

impl Metric {
    pub fn of(&self, result: &ScoringResult) -> f64 {
        match self {
            Metric::Cosine => result.cosine,
            Metric::Tanimoto => result.tanimoto,
        }
    }
}

impl Display for Metric {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Metric::Cosine => f.write_str("cosine"),
            Metric::Tanimoto => f.write_str("tanimoto"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("Unknown similarity metric {0:?}")]
pub struct UnknownMetric(pub String);

impl FromStr for Metric {
    type Err = UnknownMetric;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "cosine" => Ok(Self::Cosine),
            "tanimoto" => Ok(Self::Tanimoto),
            _ => Err(UnknownMetric(s.to_string())),
        }
    }
}

/// The fragment masses predicted for one candidate under one adduct
#[derive(Debug, Clone, PartialEq)]
pub enum PredictedMasses {
    Available(Vec<f64>),
    /// No masses can be attributed to this candidate, e.g. the precursor ion was not
    /// found in its fragmentation tree
    NotApplicable,
}

impl PredictedMasses {
    pub fn as_slice(&self) -> Option<&[f64]> {
        match self {
            PredictedMasses::Available(masses) => Some(masses),
            PredictedMasses::NotApplicable => None,
        }
    }

    pub fn is_applicable(&self) -> bool {
        matches!(self, Self::Available(_))
    }
}

/// Predicted masses for every candidate under a single adduct
#[derive(Debug, Clone, Default)]
pub struct MassIndex {
    pub adduct: AdductLabel,
    masses: HashMap<String, PredictedMasses>,
}

impl MassIndex {
    pub fn new(adduct: impl Into<AdductLabel>) -> Self {
        Self {
            adduct: adduct.into(),
            masses: HashMap::new(),
        }
    }

    pub fn insert(&mut self, candidate: impl Into<String>, masses: PredictedMasses) {
        self.masses.insert(candidate.into(), masses);
    }

    pub fn get(&self, candidate: &str) -> Option<&PredictedMasses> {
        self.masses.get(candidate)
    }

    pub fn len(&self) -> usize {
        self.masses.len()
    }

    pub fn is_empty(&self) -> bool {
        self.masses.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct RankingRow {
    pub candidate: String,
    pub score: f64,
    pub scores: ScoringResult,
    pub is_solution: bool,
    pub applicable: bool,
}

/// Candidates ordered by descending score for one (adduct, spectrum) combination
#[derive(Debug, Clone, PartialEq)]
pub struct Ranking {
    pub molecule: String,
    pub adduct: AdductLabel,
    pub spectrum: String,
    pub metric: Metric,
    pub rows: Vec<RankingRow>,
    /// The 1-based position of the solution row, or -1 when it is absent
    pub solution_rank: i64,
}

impl Ranking {
    pub fn total(&self) -> usize {
        self.rows.len()
    }

    pub fn best(&self) -> Option<&RankingRow> {
        self.rows.first()
    }

    pub fn solution(&self) -> Option<&RankingRow> {
        self.rows.iter().find(|r| r.is_solution)
    }

    /// Whether the solution could be scored at all. A solution whose masses were not
    /// predicted for this adduct has a position but no meaningful rank.
    pub fn solution_applicable(&self) -> bool {
        self.solution().map(|r| r.applicable).unwrap_or(true)
    }

    pub fn iter(&self) -> std::slice::Iter<'_, RankingRow> {
        self.rows.iter()
    }
}

/// Score every candidate in `candidates` against `spectrum` and sort by `metric`.
///
/// Candidates missing from `index` or marked [`PredictedMasses::NotApplicable`] are
/// kept with all-zero scores. Ties keep the order of `candidates`.
pub fn rank<'a, I, S>(
    candidates: I,
    index: &MassIndex,
    spectrum: &ExperimentalSpectrum,
    solution: &str,
    scorer: &S,
    metric: Metric,
) -> Ranking
where
    I: IntoIterator<Item = &'a str>,
    S: SpectrumComparator + ?Sized,
{
    let mut rows: Vec<RankingRow> = candidates
        .into_iter()
        .map(|name| {
            let masses = index.get(name).and_then(|m| m.as_slice());
            let scores = match masses {
                Some(masses) => scorer.compare(spectrum, masses),
                None => ScoringResult {
                    nb_peaks1: spectrum.len(),
                    ..Default::default()
                },
            };
            RankingRow {
                candidate: name.to_string(),
                score: metric.of(&scores),
                scores,
                is_solution: name == solution,
                applicable: masses.is_some(),
            }
        })
        .collect();

    rows.sort_by(|a, b| b.score.total_cmp(&a.score));

    let solution_rank = rows
        .iter()
        .position(|r| r.is_solution)
        .map(|i| i as i64 + 1)
        .unwrap_or(-1);

    Ranking {
        molecule: solution.to_string(),
        adduct: index.adduct.clone(),
        spectrum: spectrum.name.clone(),
        metric,
        rows,
        solution_rank,
    }
}

/// One line of the global summary table
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SummaryRow {
    pub molecule: String,
    pub adduct: AdductLabel,
    pub spectrum: String,
    pub metric: Metric,
    pub solution_rank: i64,
    pub total: usize,
    pub solution_score: f64,
    pub best_candidate: Option<String>,
    pub best_score: f64,
    /// `false` when the solution had no predicted masses for this adduct, in which case
    /// the rank and score columns are placeholders
    pub applicable: bool,
}

impl SummaryRow {
    pub fn from_ranking(ranking: &Ranking) -> Self {
        let best = ranking.best();
        Self {
            molecule: ranking.molecule.clone(),
            adduct: ranking.adduct.clone(),
            spectrum: ranking.spectrum.clone(),
            metric: ranking.metric,
            solution_rank: ranking.solution_rank,
            total: ranking.total(),
            solution_score: ranking.solution().map(|r| r.score).unwrap_or_default(),
            best_candidate: best.map(|r| r.candidate.clone()),
            best_score: best.map(|r| r.score).unwrap_or_default(),
            applicable: ranking.solution_applicable(),
        }
    }

    fn rank_key(&self) -> i64 {
        if self.solution_rank < 1 {
            i64::MAX
        } else {
            self.solution_rank
        }
    }
}

impl From<&Ranking> for SummaryRow {
    fn from(value: &Ranking) -> Self {
        Self::from_ranking(value)
    }
}

/// Reduce the summary to one row per molecule.
///
/// Rows scored with another metric, rows whose solution was not applicable and rows
/// whose best score is not positive are ignored.
/// The row with the lowest solution rank wins, with an absent solution ranked last, and
/// the higher solution score breaks ties. Molecules are returned in sorted order.
pub fn pick_best_per_molecule(rows: &[SummaryRow], metric: Metric) -> Vec<SummaryRow> {
    let mut groups: BTreeMap<&str, Vec<&SummaryRow>> = BTreeMap::new();
    for row in rows
        .iter()
        .filter(|r| r.metric == metric && r.applicable && r.best_score > 0.0)
    {
        groups.entry(row.molecule.as_str()).or_default().push(row);
    }
    groups
        .into_values()
        .filter_map(|group| {
            group
                .into_iter()
                .sorted_by(|a, b| match a.rank_key().cmp(&b.rank_key()) {
                    Ordering::Equal => b.solution_score.total_cmp(&a.solution_score),
                    ord => ord,
                })
                .next()
                .cloned()
        })
        .collect()
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::scorer::{ComparatorConfig, SimilarityScorer};

    fn index() -> MassIndex {
        let mut index = MassIndex::new("H");
        index.insert("C1", PredictedMasses::Available(vec![100.0, 200.0]));
        index.insert("C2", PredictedMasses::Available(vec![100.0, 150.0]));
        index.insert("C3", PredictedMasses::Available(vec![100.0, 200.0, 250.0]));
        index
    }

    fn spectrum() -> ExperimentalSpectrum {
        ExperimentalSpectrum::from_xy("scan", &[100.0, 200.0, 250.0], &[1.0, 1.0, 1.0])
    }

    #[test]
    fn test_rank_order() {
        let scorer = SimilarityScorer::new(ComparatorConfig::default());
        for metric in [Metric::Cosine, Metric::Tanimoto] {
            let ranking = rank(["C1", "C2", "C3"], &index(), &spectrum(), "C3", &scorer, metric);
            assert_eq!(ranking.rows[0].candidate, "C3");
            assert_eq!(ranking.rows[0].scores.nb_common_peaks, 3);
            assert_eq!(ranking.solution_rank, 1);
            assert_eq!(ranking.total(), 3);
            let names: Vec<_> = ranking.iter().map(|r| r.candidate.as_str()).collect();
            assert_eq!(names, ["C3", "C1", "C2"]);
        }
    }

    #[test]
    fn test_rank_definition() {
        let scorer = SimilarityScorer::default();
        let ranking = rank(["C1", "C2", "C3"], &index(), &spectrum(), "C2", &scorer, Metric::Tanimoto);
        let position = ranking.rows.iter().position(|r| r.candidate == "C2").unwrap();
        assert_eq!(ranking.solution_rank, position as i64 + 1);

        let ranking = rank(["C1", "C2", "C3"], &index(), &spectrum(), "C9", &scorer, Metric::Tanimoto);
        assert_eq!(ranking.solution_rank, -1);
        assert!(ranking.solution().is_none());
    }

    #[test]
    fn test_ties_are_stable() {
        let mut index = MassIndex::new("Na");
        index.insert("B", PredictedMasses::Available(vec![100.0]));
        index.insert("A", PredictedMasses::Available(vec![100.0]));
        index.insert("Z", PredictedMasses::NotApplicable);
        let scorer = SimilarityScorer::default();
        let ranking = rank(["Z", "B", "A", "Q"], &index, &spectrum(), "A", &scorer, Metric::Tanimoto);
        let names: Vec<_> = ranking.iter().map(|r| r.candidate.as_str()).collect();
        assert_eq!(names, ["B", "A", "Z", "Q"]);
        assert_eq!(ranking.solution_rank, 2);
        assert!(!ranking.rows[2].applicable);
        assert_eq!(ranking.rows[2].score, 0.0);
    }

    fn summary(molecule: &str, spectrum: &str, rank: i64, solution_score: f64, best_score: f64) -> SummaryRow {
        SummaryRow {
            molecule: molecule.to_string(),
            adduct: "H".to_string(),
            spectrum: spectrum.to_string(),
            metric: Metric::Cosine,
            solution_rank: rank,
            total: 3,
            solution_score,
            best_candidate: Some(molecule.to_string()),
            best_score,
            applicable: true,
        }
    }

    #[test]
    fn test_pick_best() {
        let rows = vec![
            summary("M1", "a", 2, 0.5, 0.7),
            summary("M1", "b", 1, 0.4, 0.4),
            summary("M1", "c", 1, 0.6, 0.6),
            summary("M2", "a", -1, 0.0, 0.9),
            summary("M2", "b", 3, 0.1, 0.8),
            summary("M3", "a", 1, 0.0, 0.0),
        ];
        let best = pick_best_per_molecule(&rows, Metric::Cosine);
        assert_eq!(best.len(), 2);
        assert_eq!(best[0].molecule, "M1");
        assert_eq!(best[0].spectrum, "c");
        assert_eq!(best[1].molecule, "M2");
        assert_eq!(best[1].spectrum, "b");

        assert!(pick_best_per_molecule(&rows, Metric::Tanimoto).is_empty());
    }

    #[test]
    fn test_summary_from_ranking() {
        let scorer = SimilarityScorer::default();
        let ranking = rank(["C1", "C2", "C3"], &index(), &spectrum(), "C1", &scorer, Metric::Tanimoto);
        let row = SummaryRow::from(&ranking);
        assert_eq!(row.solution_rank, 2);
        assert_eq!(row.best_candidate.as_deref(), Some("C3"));
        assert_eq!(row.best_score, 1.0);
        assert!(row.applicable);
        assert!((row.solution_score - 2.0 / 3.0).abs() < 1e-12);
        assert_eq!("Tanimoto".parse::<Metric>().unwrap(), Metric::Tanimoto);
        assert!("dice".parse::<Metric>().is_err());
    }

    #[test]
    fn test_unpredicted_solution_is_not_ranked() {
        let mut index = MassIndex::new("Na");
        index.insert("LNT", PredictedMasses::NotApplicable);
        index.insert("LNnT", PredictedMasses::Available(vec![100.0, 200.0]));
        let scorer = SimilarityScorer::default();

        let ranking = rank(["LNT", "LNnT"], &index, &spectrum(), "LNT", &scorer, Metric::Cosine);
        assert_eq!(ranking.best().map(|r| r.candidate.as_str()), Some("LNnT"));
        assert!(!ranking.solution_applicable());

        let row = SummaryRow::from_ranking(&ranking);
        assert!(!row.applicable);
        assert!(row.best_score > 0.0);
        assert!(pick_best_per_molecule(&[row], Metric::Cosine).is_empty());

        let mut none = MassIndex::new("Na");
        none.insert("LNT", PredictedMasses::NotApplicable);
        none.insert("LNnT", PredictedMasses::NotApplicable);
        let ranking = rank(["LNT", "LNnT"], &none, &spectrum(), "LNT", &scorer, Metric::Cosine);
        assert_eq!(ranking.solution_rank, 1);
        assert!(!SummaryRow::from(&ranking).applicable);

        let ranking = rank(["LNnT"], &index, &spectrum(), "LNT", &scorer, Metric::Cosine);
        assert!(ranking.solution_applicable());
    }
}
