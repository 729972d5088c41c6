use std::fmt::Display;

use clap::{Args, ValueEnum};
use serde::{Deserialize, Serialize};

use glycoscreen::{ComparatorConfig, FragmentationOptions, Metric};

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ArgMetric {
    #[default]
    /// Weighted cosine similarity of the aligned peak vectors
    Cosine,
    /// The fraction of shared peaks over all distinct peaks
    Tanimoto,
}

impl From<ArgMetric> for Metric {
    fn from(value: ArgMetric) -> Self {
        match value {
            ArgMetric::Cosine => Metric::Cosine,
            ArgMetric::Tanimoto => Metric::Tanimoto,
        }
    }
}

impl Display for ArgMetric {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let metric: Metric = (*self).into();
        write!(f, "{metric}")
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EngineKind {
    #[default]
    /// Read fragmentations stored as `<engine-path>/<candidate>/<adduct>.json`
    Precomputed,
    /// Run the program at `engine-path` once per candidate and adduct, exchanging JSON
    /// over STDIN and STDOUT
    Command,
}

impl Display for EngineKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Precomputed => f.write_str("precomputed"),
            Self::Command => f.write_str("command"),
        }
    }
}

pub(crate) fn non_negative_float_f64(s: &str) -> Result<f64, String> {
    let value = s.parse::<f64>().map_err(|e| e.to_string())?;
    if value < 0.0 {
        Err(format!("`{s}` is less than zero"))
    } else {
        Ok(value)
    }
}

/// Peak weighting and matching for spectrum comparison
#[derive(Args, Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ComparatorArgs {
    /// The exponent applied to peak m/z when weighting peaks
    #[arg(long = "mass-power", default_value_t = 3.0)]
    pub mass_power: f64,

    /// The exponent applied to peak intensity when weighting peaks
    #[arg(long = "intensity-power", default_value_t = 0.6)]
    pub intensity_power: f64,

    /// The matching tolerance between predicted and experimental peaks, in ppm
    #[arg(
        long = "precision-ppm",
        default_value_t = 10.0,
        value_parser = non_negative_float_f64
    )]
    pub precision_ppm: f64,
}

impl Default for ComparatorArgs {
    fn default() -> Self {
        make_default_comparator_config().into()
    }
}

impl From<ComparatorConfig> for ComparatorArgs {
    fn from(value: ComparatorConfig) -> Self {
        Self {
            mass_power: value.mass_power,
            intensity_power: value.intensity_power,
            precision_ppm: value.precision_ppm,
        }
    }
}

impl From<ComparatorArgs> for ComparatorConfig {
    fn from(value: ComparatorArgs) -> Self {
        ComparatorConfig::new(value.mass_power, value.intensity_power, value.precision_ppm)
    }
}

/// Knobs passed through to the fragmentation engine
#[derive(Args, Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FragmentationArgs {
    /// The ionization techniques the engine may apply
    #[arg(long = "ionization", default_values_t = ["esi".to_string()])]
    pub ionizations: Vec<String>,

    /// The ionization modes the engine may apply
    #[arg(long = "mode", default_values_t = ["positive".to_string()])]
    pub modes: Vec<String>,

    /// The maximum depth of the fragmentation tree
    #[arg(long = "max-depth", default_value_t = 5)]
    pub max_depth: u32,

    /// The maximum number of reactions applied across the whole tree
    #[arg(long = "limit-reactions", default_value_t = 500)]
    pub limit_reactions: u32,

    /// The minimum number of ionizations per fragmentation path
    #[arg(long = "min-ionizations", default_value_t = 1)]
    pub min_ionizations: u32,

    /// The maximum number of ionizations per fragmentation path
    #[arg(long = "max-ionizations", default_value_t = 1)]
    pub max_ionizations: u32,

    /// The minimum number of reactions per fragmentation step
    #[arg(long = "min-reactions", default_value_t = 0)]
    pub min_reactions: u32,

    /// The maximum number of reactions per fragmentation step
    #[arg(long = "max-reactions", default_value_t = 1)]
    pub max_reactions: u32,
}

impl Default for FragmentationArgs {
    fn default() -> Self {
        make_default_fragmentation_options().into()
    }
}

impl From<FragmentationOptions> for FragmentationArgs {
    fn from(value: FragmentationOptions) -> Self {
        Self {
            ionizations: value.ionizations,
            modes: value.modes,
            max_depth: value.max_depth,
            limit_reactions: value.limit_reactions,
            min_ionizations: value.min_ionizations,
            max_ionizations: value.max_ionizations,
            min_reactions: value.min_reactions,
            max_reactions: value.max_reactions,
        }
    }
}

impl From<FragmentationArgs> for FragmentationOptions {
    fn from(value: FragmentationArgs) -> Self {
        Self {
            ionizations: value.ionizations,
            modes: value.modes,
            max_depth: value.max_depth,
            limit_reactions: value.limit_reactions,
            min_ionizations: value.min_ionizations,
            max_ionizations: value.max_ionizations,
            min_reactions: value.min_reactions,
            max_reactions: value.max_reactions,
        }
    }
}

/// Isolation of a single precursor ion for MS3 screening
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PrecursorParams {
    pub mz: f64,
    pub ppm: f64,
}

pub fn make_default_comparator_config() -> ComparatorConfig {
    ComparatorConfig::default()
}

pub fn make_default_fragmentation_options() -> FragmentationOptions {
    FragmentationOptions::default()
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_defaults_agree() {
        let config: ComparatorConfig = ComparatorArgs::default().into();
        assert_eq!(config, ComparatorConfig::default());
        let options: FragmentationOptions = FragmentationArgs::default().into();
        assert_eq!(options, FragmentationOptions::default());
        assert_eq!(ArgMetric::Tanimoto.to_string(), "tanimoto");
    }
}
