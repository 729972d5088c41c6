use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use crossbeam_channel::Sender;
use mzpeaks::Tolerance;
use rayon::prelude::*;
use tracing::{debug, info, instrument, warn};

use glycoscreen::tree::{verify_subtree, VerificationReport};
use glycoscreen::{
    rank, AdductLabel, BoundedDispatcher, CandidateSet, DispatchError, EngineError,
    ExperimentalDatum, ExperimentalSpectrum, FragmentationEngine, FragmentationOptions,
    FragmentationRequest, FragmentationResult, MassIndex, Metric, NodeIdAllocator,
    PredictedMasses, PrecursorNotFound, PrecursorSubtree, Ranking, SimilarityScorer, Task,
};

use crate::args::PrecursorParams;
use crate::progress::ProgressRecord;
use crate::types::MassIndices;

/// The fragmentation of one candidate under one adduct
#[derive(Debug)]
pub struct FragmentOutcome {
    pub candidate: String,
    pub adduct: AdductLabel,
    pub result: FragmentationResult,
    /// Only populated when screening against a single isolated precursor
    pub precursor: Option<Result<PrecursorSubtree, PrecursorNotFound>>,
}

impl FragmentOutcome {
    pub fn predicted_masses(&self) -> PredictedMasses {
        match &self.precursor {
            None => PredictedMasses::Available(self.result.masses.clone()),
            Some(Ok(subtree)) => PredictedMasses::Available(subtree.masses.clone()),
            Some(Err(_)) => PredictedMasses::NotApplicable,
        }
    }

    pub fn subtree(&self) -> Option<&PrecursorSubtree> {
        self.precursor.as_ref().and_then(|p| p.as_ref().ok())
    }
}

pub type OutcomeIndex<'a> = HashMap<(&'a str, &'a str), &'a FragmentOutcome>;

pub fn index_outcomes(outcomes: &[FragmentOutcome]) -> OutcomeIndex<'_> {
    outcomes
        .iter()
        .map(|o| ((o.candidate.as_str(), o.adduct.as_str()), o))
        .collect()
}

fn fragmentation_task(
    engine: &dyn FragmentationEngine,
    request: FragmentationRequest,
    precursor: Option<PrecursorParams>,
) -> Result<FragmentOutcome, EngineError> {
    let mut allocator = NodeIdAllocator::new();
    let result = engine.fragment(&request, &mut allocator)?;
    let precursor = precursor.map(|params| {
        let subtree = result.tree.extract_precursor_subtree(params.mz, params.ppm);
        match &subtree {
            Ok(subtree) => debug!(
                "{} with {}: {} precursor nodes, {} descendant masses",
                request.candidate,
                request.adduct,
                subtree.precursors.len(),
                subtree.masses.len()
            ),
            Err(e) => warn!("{} with {}: {e}", request.candidate, request.adduct),
        }
        subtree
    });
    Ok(FragmentOutcome {
        candidate: request.candidate,
        adduct: request.adduct,
        result,
        precursor,
    })
}

/// Fragment every candidate under every adduct on at most `max_concurrency` lanes,
/// failing the whole batch on the first engine failure.
#[instrument(level = "debug", skip_all)]
pub fn fragment_candidates(
    engine: Arc<dyn FragmentationEngine>,
    candidates: &CandidateSet,
    scoped_rules: &[(AdductLabel, Arc<str>)],
    options: &FragmentationOptions,
    precursor: Option<PrecursorParams>,
    max_concurrency: usize,
) -> Result<(Vec<FragmentOutcome>, ProgressRecord), DispatchError<EngineError>> {
    let started = Instant::now();
    let mut tasks: Vec<Task<FragmentOutcome, EngineError>> =
        Vec::with_capacity(candidates.len() * scoped_rules.len());
    for candidate in candidates.iter() {
        for (adduct, rules) in scoped_rules.iter() {
            let engine = Arc::clone(&engine);
            let request = FragmentationRequest {
                candidate: candidate.name.clone(),
                adduct: adduct.clone(),
                structure: candidate.structure.clone(),
                rules: Arc::clone(rules),
                options: options.clone(),
            };
            tasks.push(Box::new(move || {
                fragmentation_task(engine.as_ref(), request, precursor)
            }));
        }
    }

    let outcomes = BoundedDispatcher::new(max_concurrency).run(tasks)?;
    let prog = ProgressRecord {
        fragmentations: outcomes.len(),
        precursors_not_found: outcomes
            .iter()
            .filter(|o| matches!(o.precursor, Some(Err(_))))
            .count(),
        ..Default::default()
    };
    info!(
        "Fragmented {} candidates under {} adducts in {:0.3?}",
        candidates.len(),
        scoped_rules.len(),
        started.elapsed()
    );
    Ok((outcomes, prog))
}

pub fn build_mass_indices(outcomes: &[FragmentOutcome], adducts: &[AdductLabel]) -> MassIndices {
    let mut indices: MassIndices = adducts
        .iter()
        .map(|a| (a.clone(), MassIndex::new(a.clone())))
        .collect();
    for outcome in outcomes.iter() {
        if let Some(index) = indices.get_mut(&outcome.adduct) {
            index.insert(outcome.candidate.clone(), outcome.predicted_masses());
        }
    }
    indices
}

/// The check of a solution's precursor subtree against one spectrum
#[derive(Debug, Clone)]
pub struct VerificationRow {
    pub molecule: String,
    pub adduct: AdductLabel,
    pub spectrum: String,
    pub report: VerificationReport,
}

#[derive(Debug)]
pub struct CombinationResult {
    pub ranking: Ranking,
    pub verification: Option<VerificationRow>,
}

fn verify_solution(
    outcome: &FragmentOutcome,
    datum: &ExperimentalDatum,
    spectrum: &ExperimentalSpectrum,
    error_tolerance: Tolerance,
) -> Option<VerificationRow> {
    let subtree = outcome.subtree()?;
    let tree = &outcome.result.tree;
    let filtered = tree.filter(|node| {
        node.masses
            .iter()
            .any(|m| spectrum.has_peak(m.mz, error_tolerance).is_some())
    })?;
    let report = verify_subtree(tree, &filtered, &subtree.precursors, spectrum, error_tolerance);
    Some(VerificationRow {
        molecule: datum.molecule.clone(),
        adduct: outcome.adduct.clone(),
        spectrum: spectrum.name.clone(),
        report,
    })
}

/// Rank every candidate for every (datum, adduct, spectrum) combination on the current
/// rayon pool, sending each result to `sender` tagged with its position.
#[allow(clippy::too_many_arguments)]
pub fn rank_combinations(
    data: &[ExperimentalDatum],
    candidates: &CandidateSet,
    indices: &MassIndices,
    outcomes: &OutcomeIndex<'_>,
    scorer: &SimilarityScorer,
    metric: Metric,
    verify: bool,
    sender: Sender<(usize, CombinationResult)>,
) -> ProgressRecord {
    let started = Instant::now();
    let error_tolerance = Tolerance::PPM(scorer.config.precision_ppm);
    let combinations: Vec<_> = data
        .iter()
        .flat_map(|datum| {
            indices.iter().flat_map(move |(adduct, index)| {
                datum
                    .spectra
                    .iter()
                    .map(move |spectrum| (datum, adduct, index, spectrum))
            })
        })
        .collect();
    debug!("Ranking {} combinations", combinations.len());

    let prog: ProgressRecord = combinations
        .into_par_iter()
        .enumerate()
        .map(|(i, (datum, adduct, index, spectrum))| {
            let ranking = rank(
                candidates.names(),
                index,
                spectrum,
                &datum.molecule,
                scorer,
                metric,
            );
            let verification = if verify {
                outcomes
                    .get(&(datum.molecule.as_str(), adduct.as_str()))
                    .and_then(|outcome| verify_solution(outcome, datum, spectrum, error_tolerance))
            } else {
                None
            };

            let mut prog = ProgressRecord {
                combinations: 1,
                spectra_scored: ranking.total(),
                ..Default::default()
            };
            if !ranking.solution_applicable() {
                prog.solutions_not_applicable = 1;
            } else {
                match ranking.solution_rank {
                    1 => prog.solutions_ranked_first = 1,
                    -1 => prog.solutions_missing = 1,
                    _ => {}
                }
            }
            if let Some(row) = verification.as_ref() {
                prog.invalid_edges = row.report.invalid_edges.len();
            }
            if let Err(e) = sender.send((i, CombinationResult { ranking, verification })) {
                warn!("Failed to send ranking {i}: {e}");
            }
            prog
        })
        .fold(ProgressRecord::default, ProgressRecord::sum)
        .sum();
    info!("Ranking Elapsed Time: {:0.3?}", started.elapsed());
    prog
}
