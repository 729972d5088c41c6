use std::collections::BTreeMap;

use glycoscreen::{AdductLabel, MassIndex};

pub(crate) type MassIndices = BTreeMap<AdductLabel, MassIndex>;

pub(crate) const BUFFER_SIZE: usize = 10_000;
pub(crate) const DEFAULT_MAX_CONCURRENCY: usize = 4;
pub(crate) const DEFAULT_OUTPUT_DIR: &str = "glycoscreener-output";
pub const CONFIG_FILE: &str = "glycoscreener.toml";
pub const ENV_PREFIX: &str = "GLYCOSCREENER_";

pub(crate) const RANKINGS_DIR: &str = "rankings";
pub(crate) const SUMMARY_TABLE: &str = "summary.tsv";
pub(crate) const BEST_TABLE: &str = "best.tsv";
pub(crate) const PRECURSORS_TABLE: &str = "precursors.tsv";
pub(crate) const VERIFICATION_TABLE: &str = "verification.tsv";
