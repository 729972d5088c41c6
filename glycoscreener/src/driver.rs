use std::fs;
use std::io;
use std::path::PathBuf;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Instant;

use clap::Parser;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, warn};

use glycoscreen::dispatch::panic_message;
use glycoscreen::{
    load_datum_folders, pick_best_per_molecule, AdductLabel, CandidateSet, CommandFragmenter,
    DispatchError, EngineError, FileSpectrumSource, FragmentationEngine, FragmentationOptions,
    LoaderError, Metric, PrecomputedFragmenter, RuleFileError, RuleTable, SimilarityScorer,
};

use crate::args::{ArgMetric, ComparatorArgs, EngineKind, FragmentationArgs, PrecursorParams};
use crate::proc::{build_mass_indices, fragment_candidates, index_outcomes, rank_combinations};
use crate::progress::ProgressRecord;
use crate::types::{
    BEST_TABLE, BUFFER_SIZE, DEFAULT_MAX_CONCURRENCY, DEFAULT_OUTPUT_DIR, PRECURSORS_TABLE,
    SUMMARY_TABLE, VERIFICATION_TABLE,
};
use crate::write::{
    table_path, write_output_rankings, write_precursors, write_summary, write_verification,
    TableWriter,
};

#[derive(Debug, Error)]
pub enum GlycoScreenerError {
    #[error("An IO error occurred: {0}")]
    IOError(
        #[source]
        #[from]
        io::Error,
    ),
    #[error("Failed to read the reaction rule table {}: {source}", .path.display())]
    RuleFile {
        path: PathBuf,
        #[source]
        source: RuleFileError,
    },
    #[error(transparent)]
    Loader(#[from] LoaderError),
    #[error("Fragmentation failed: {0}")]
    Dispatch(#[from] DispatchError<EngineError>),
    #[error("No ionization labels remain in {} after excluding {excluded:?}", .path.display())]
    NoAdductLabels { path: PathBuf, excluded: Vec<String> },
    #[error("The {0} fragmentation engine requires an engine path")]
    MissingEnginePath(EngineKind),
    #[error("Failed to build the thread pool: {0}")]
    ThreadPool(#[from] rayon::ThreadPoolBuildError),
    #[error("Invalid configuration: {0}")]
    Configuration(#[from] figment::Error),
    #[error("The report writer terminated abnormally: {0}")]
    WriterPanicked(String),
}

/// Wait for the ranking writer, turning a panic into an error rather than empty tables
fn join_writer<T>(handle: JoinHandle<io::Result<T>>) -> Result<T, GlycoScreenerError> {
    match handle.join() {
        Ok(result) => Ok(result?),
        Err(payload) => Err(GlycoScreenerError::WriterPanicked(panic_message(
            payload.as_ref(),
        ))),
    }
}

/// Screen candidate glycan structures against tandem mass spectra of known molecules.
///
/// Every candidate is fragmented under every ionization adduct found in the reaction
/// rule table, and the predicted fragment masses are scored against each spectrum of
/// each datum folder. The rank of the known-correct candidate is reported per spectrum.
#[derive(Parser, Debug, Clone, Deserialize, Serialize)]
#[command(author, version)]
#[serde(default)]
pub struct GlycoScreener {
    /// The reaction rule table to fragment candidates with
    #[arg()]
    pub rules_file: PathBuf,

    /// A tab-separated table of candidate names and structures
    #[arg()]
    pub candidates_file: PathBuf,

    /// A directory holding one folder of spectra per known molecule, named after the
    /// molecule's candidate
    #[arg()]
    pub data_dir: PathBuf,

    /// The directory to write rankings and summary tables to
    #[arg(short = 'o', long = "output-dir", default_value = DEFAULT_OUTPUT_DIR)]
    pub output_dir: PathBuf,

    /// The path to write a log file to, in addition to STDERR
    #[arg(short = 'l', long = "log-file")]
    pub log_file: Option<PathBuf>,

    /// A TOML configuration file to read additional parameters from.
    ///
    /// Configurations are also read from `glycoscreener.toml` in the working directory.
    /// Environment variables prefixed with `GLYCOSCREENER_` will be read too.
    #[arg(long = "config-file")]
    pub config_file: Option<PathBuf>,

    /// The number of threads to rank with, passing a value < 1 to use all available threads
    #[arg(
        short='t',
        long="threads",
        default_value_t=-1,
    )]
    pub threads: i32,

    /// The maximum number of fragmentations to run at once
    #[arg(short = 'j', long = "max-concurrency", default_value_t = DEFAULT_MAX_CONCURRENCY)]
    pub max_concurrency: usize,

    /// How to obtain fragmentation trees
    #[arg(short = 'e', long = "engine", default_value_t = EngineKind::Precomputed)]
    pub engine: EngineKind,

    /// The directory of precomputed fragmentations, or the engine program to run
    #[arg(short = 'p', long = "engine-path")]
    pub engine_path: Option<PathBuf>,

    /// Extra arguments passed to the engine program
    #[arg(long = "engine-arg", allow_hyphen_values = true)]
    pub engine_args: Vec<String>,

    /// Ionization labels to leave out of the screen
    #[arg(short = 'x', long = "exclude-label", value_delimiter = ',')]
    pub exclude_labels: Vec<String>,

    /// The similarity metric candidates are ranked by
    #[arg(short = 'm', long = "metric", default_value_t = ArgMetric::Cosine)]
    pub metric: ArgMetric,

    /// The MS level of spectra to read from mzML and MGF files, defaulting to 3 when a
    /// precursor is isolated and 2 otherwise
    #[arg(long = "ms-level")]
    pub ms_level: Option<u8>,

    /// Isolate the precursor ion at this m/z and score only its descendant fragments
    #[arg(long = "precursor-mz")]
    pub precursor_mz: Option<f64>,

    /// The tolerance for matching the isolated precursor to tree nodes, in ppm
    #[arg(
        long = "precursor-ppm",
        default_value_t = 10.0,
        value_parser = crate::args::non_negative_float_f64
    )]
    pub precursor_ppm: f64,

    /// Write output tables gzip-compressed
    #[arg(short = 'z', long = "compress")]
    pub compress: bool,

    #[command(flatten)]
    pub comparator: ComparatorArgs,

    #[command(flatten)]
    pub fragmentation: FragmentationArgs,
}

impl Default for GlycoScreener {
    fn default() -> Self {
        Self {
            rules_file: PathBuf::new(),
            candidates_file: PathBuf::new(),
            data_dir: PathBuf::new(),
            output_dir: PathBuf::from(DEFAULT_OUTPUT_DIR),
            log_file: None,
            config_file: None,
            threads: -1,
            max_concurrency: DEFAULT_MAX_CONCURRENCY,
            engine: EngineKind::default(),
            engine_path: None,
            engine_args: Vec::new(),
            exclude_labels: Vec::new(),
            metric: ArgMetric::default(),
            ms_level: None,
            precursor_mz: None,
            precursor_ppm: 10.0,
            compress: false,
            comparator: ComparatorArgs::default(),
            fragmentation: FragmentationArgs::default(),
        }
    }
}

impl GlycoScreener {
    fn create_threadpool(&self) -> Result<rayon::ThreadPool, GlycoScreenerError> {
        let num_threads = if self.threads > 0 {
            self.threads as usize
        } else {
            thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(1)
        };
        debug!("Using {} cores", num_threads);
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(num_threads)
            .build()?;
        Ok(pool)
    }

    pub fn precursor(&self) -> Option<PrecursorParams> {
        self.precursor_mz.map(|mz| PrecursorParams {
            mz,
            ppm: self.precursor_ppm,
        })
    }

    pub fn effective_ms_level(&self) -> u8 {
        match (self.ms_level, self.precursor_mz) {
            (Some(level), _) => level,
            (None, Some(_)) => 3,
            (None, None) => 2,
        }
    }

    fn make_engine(&self) -> Result<Arc<dyn FragmentationEngine>, GlycoScreenerError> {
        let path = self
            .engine_path
            .clone()
            .ok_or(GlycoScreenerError::MissingEnginePath(self.engine))?;
        let engine: Arc<dyn FragmentationEngine> = match self.engine {
            EngineKind::Precomputed => Arc::new(PrecomputedFragmenter::new(path)),
            EngineKind::Command => {
                Arc::new(CommandFragmenter::new(path, self.engine_args.clone()))
            }
        };
        Ok(engine)
    }

    /// Read the rule table and split it into one rule text per retained ionization label
    fn scope_rules(&self) -> Result<Vec<(AdductLabel, Arc<str>)>, GlycoScreenerError> {
        let table =
            RuleTable::open_path(&self.rules_file).map_err(|source| GlycoScreenerError::RuleFile {
                path: self.rules_file.clone(),
                source,
            })?;
        let labels: Vec<AdductLabel> = table
            .discover_labels()
            .into_iter()
            .filter(|label| {
                let excluded = self.exclude_labels.iter().any(|x| x == label);
                if excluded {
                    debug!("Excluding ionization label {label}");
                }
                !excluded
            })
            .collect();
        if labels.is_empty() {
            return Err(GlycoScreenerError::NoAdductLabels {
                path: self.rules_file.clone(),
                excluded: self.exclude_labels.clone(),
            });
        }
        info!("Ionization labels: {}", labels.join(", "));
        Ok(labels
            .into_iter()
            .map(|label| {
                let scoped: Arc<str> = Arc::from(table.filter_by_label(&label).to_string());
                (label, scoped)
            })
            .collect())
    }

    pub fn main(&self) -> Result<(), GlycoScreenerError> {
        info!(
            "glycoscreener v{}",
            option_env!("CARGO_PKG_VERSION").unwrap_or("unknown")
        );
        info!("Rules: {}", self.rules_file.display());
        info!("Candidates: {}", self.candidates_file.display());
        info!("Data: {}", self.data_dir.display());
        info!("Output: {}", self.output_dir.display());
        let pool = self.create_threadpool()?;
        self.run_workflow(pool)
    }

    fn run_workflow(&self, pool: rayon::ThreadPool) -> Result<(), GlycoScreenerError> {
        let start = Instant::now();
        let scoped_rules = self.scope_rules()?;
        let adducts: Vec<AdductLabel> = scoped_rules.iter().map(|(a, _)| a.clone()).collect();

        let candidates = CandidateSet::open_path(&self.candidates_file)?;
        info!("Loaded {} candidates", candidates.len());

        let engine = self.make_engine()?;
        let options: FragmentationOptions = self.fragmentation.clone().into();
        let precursor = self.precursor();
        if let Some(p) = precursor.as_ref() {
            info!("Isolating precursor m/z {:.4} within {} ppm", p.mz, p.ppm);
        }
        let (outcomes, mut prog) = fragment_candidates(
            engine,
            &candidates,
            &scoped_rules,
            &options,
            precursor,
            self.max_concurrency,
        )?;
        let indices = build_mass_indices(&outcomes, &adducts);

        let source = FileSpectrumSource::new(self.effective_ms_level());
        let data = load_datum_folders(&self.data_dir, &source)?;
        for datum in data.iter() {
            if !candidates.contains(&datum.molecule) {
                warn!(
                    "{} is not among the candidates, its solution rank will be -1",
                    datum.molecule
                );
            }
        }

        fs::create_dir_all(&self.output_dir)?;
        let metric: Metric = self.metric.into();
        let scorer = SimilarityScorer::new(self.comparator.into());
        let outcome_index = index_outcomes(&outcomes);

        let (send_ranked, recv_ranked) = crossbeam_channel::bounded(BUFFER_SIZE);
        let output_dir = self.output_dir.clone();
        let compress = self.compress;
        let write_task =
            thread::spawn(move || write_output_rankings(recv_ranked, output_dir, compress));

        let ranked = pool.install(|| {
            rank_combinations(
                &data,
                &candidates,
                &indices,
                &outcome_index,
                &scorer,
                metric,
                precursor.is_some(),
                send_ranked,
            )
        });
        prog += ranked;

        let (summaries, verifications) = join_writer(write_task)?;

        self.write_table(SUMMARY_TABLE, |w| write_summary(w, &summaries))?;
        let best = pick_best_per_molecule(&summaries, metric);
        self.write_table(BEST_TABLE, |w| write_summary(w, &best))?;
        if precursor.is_some() {
            self.write_table(PRECURSORS_TABLE, |w| write_precursors(w, &outcomes))?;
            self.write_table(VERIFICATION_TABLE, |w| write_verification(w, &verifications))?;
        }

        self.log_progress(&prog);
        info!("Total Elapsed Time: {:0.3?}", start.elapsed());
        Ok(())
    }

    fn write_table<F>(&self, name: &str, write: F) -> io::Result<()>
    where
        F: FnOnce(&mut TableWriter) -> io::Result<()>,
    {
        let path = table_path(&self.output_dir, name, self.compress);
        let mut writer = TableWriter::create(&path)?;
        write(&mut writer)?;
        writer.finish()?;
        debug!("Wrote {}", path.display());
        Ok(())
    }

    fn log_progress(&self, prog: &ProgressRecord) {
        info!("Fragmentations: {}", prog.fragmentations);
        if self.precursor_mz.is_some() {
            info!("Precursors Not Found: {}", prog.precursors_not_found);
            info!("Invalid Edges: {}", prog.invalid_edges);
            info!("Solutions Not Applicable: {}", prog.solutions_not_applicable);
        }
        info!(
            "Combinations: {} | Spectra Scored: {}",
            prog.combinations, prog.spectra_scored
        );
        info!(
            "Solutions Ranked First: {} | Solutions Missing: {}",
            prog.solutions_ranked_first, prog.solutions_missing
        );
    }
}
