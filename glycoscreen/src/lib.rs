//! Screen candidate glycan structures against tandem mass spectra.
//!
//! * Reaction rule tables and their per-adduct subsets in [`rules`]
//! * An order-preserving, fail-fast bounded task runner in [`dispatch`]
//! * Fragmentation trees with identity-based precursor subtree extraction in [`tree`]
//! * Spectrum similarity in [`scorer`] and candidate ranking in [`ranking`]
pub mod dispatch;
pub mod engine;
pub mod loader;
pub mod ranking;
pub mod rules;
pub mod scorer;
pub mod spectrum;
pub mod tree;

pub use crate::dispatch::{run_bounded, BoundedDispatcher, DispatchError, Task};
pub use crate::engine::{
    CommandFragmenter, EngineError, FragmentationEngine, FragmentationOptions,
    FragmentationRequest, FragmentationResult, PrecomputedFragmenter,
};
pub use crate::loader::{
    load_datum_folders, Candidate, CandidateSet, ExperimentalDatum, FileSpectrumSource,
    LoaderError, SpectrumSource, StructureStore,
};
pub use crate::ranking::{
    pick_best_per_molecule, rank, MassIndex, Metric, PredictedMasses, Ranking, RankingRow,
    SummaryRow,
};
pub use crate::rules::{AdductLabel, RuleFileError, RuleTable};
pub use crate::scorer::{ComparatorConfig, ScoringResult, SimilarityScorer};
pub use crate::spectrum::ExperimentalSpectrum;
pub use crate::tree::{FragmentTree, NodeId, NodeIdAllocator, PrecursorNotFound, PrecursorSubtree};
