use mzpeaks::prelude::*;
use serde::{Deserialize, Serialize};

use crate::spectrum::ExperimentalSpectrum;

/// Peak weighting and matching parameters for spectrum comparison
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct ComparatorConfig {
    pub mass_power: f64,
    pub intensity_power: f64,
    pub precision_ppm: f64,
}

impl Default for ComparatorConfig {
    fn default() -> Self {
        Self {
            mass_power: 3.0,
            intensity_power: 0.6,
            precision_ppm: 10.0,
        }
    }
}

impl ComparatorConfig {
    pub fn new(mass_power: f64, intensity_power: f64, precision_ppm: f64) -> Self {
        Self {
            mass_power,
            intensity_power,
            precision_ppm,
        }
    }

    /// The absolute matching window around `mz`
    #[inline]
    pub fn tolerance_at(&self, mz: f64) -> f64 {
        mz * self.precision_ppm / 1e6
    }

    #[inline]
    pub fn weight(&self, mz: f64, intensity: f64) -> f64 {
        mz.powf(self.mass_power) * intensity.powf(self.intensity_power)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct ScoringResult {
    pub cosine: f64,
    pub tanimoto: f64,
    pub nb_common_peaks: usize,
    /// The number of experimental peaks
    pub nb_peaks1: usize,
    /// The number of predicted masses
    pub nb_peaks2: usize,
}

impl ScoringResult {
    pub fn is_zero(&self) -> bool {
        self.nb_common_peaks == 0
    }
}

pub trait SpectrumComparator {
    fn compare(&self, experimental: &ExperimentalSpectrum, predicted: &[f64]) -> ScoringResult;
}

/// Compares an experimental peak list with a set of predicted fragment masses.
///
/// Predicted masses carry unit intensity. Both sides are aligned with a single merge
/// pass, and each point is weighted by `mz ^ mass_power * intensity ^ intensity_power`
/// before the cosine is taken.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct SimilarityScorer {
    pub config: ComparatorConfig,
}

impl SimilarityScorer {
    pub fn new(config: ComparatorConfig) -> Self {
        Self { config }
    }

    pub fn score(&self, experimental: &ExperimentalSpectrum, predicted: &[f64]) -> ScoringResult {
        let nb_peaks1 = experimental.len();
        let nb_peaks2 = predicted.len();
        if nb_peaks1 == 0 || nb_peaks2 == 0 {
            return ScoringResult {
                nb_peaks1,
                nb_peaks2,
                ..Default::default()
            };
        }

        let mut predicted: Vec<f64> = predicted.to_vec();
        predicted.sort_by(|a, b| a.total_cmp(b));

        let mut dot = 0.0;
        let mut norm_experimental = 0.0;
        let mut norm_predicted = 0.0;
        let mut nb_common_peaks = 0usize;

        let peaks = &experimental.peaks;
        let (mut i, mut j) = (0usize, 0usize);
        while i < peaks.len() && j < predicted.len() {
            let peak = &peaks[i];
            let mz = predicted[j];
            let exp_weight = self.config.weight(peak.mz(), peak.intensity() as f64);
            let pred_weight = self.config.weight(mz, 1.0);
            if (peak.mz() - mz).abs() <= self.config.tolerance_at(peak.mz()) {
                dot += exp_weight * pred_weight;
                norm_experimental += exp_weight * exp_weight;
                norm_predicted += pred_weight * pred_weight;
                nb_common_peaks += 1;
                i += 1;
                j += 1;
            } else if peak.mz() < mz {
                norm_experimental += exp_weight * exp_weight;
                i += 1;
            } else {
                norm_predicted += pred_weight * pred_weight;
                j += 1;
            }
        }
        for peak in peaks.iter().skip(i) {
            let w = self.config.weight(peak.mz(), peak.intensity() as f64);
            norm_experimental += w * w;
        }
        for mz in predicted.iter().skip(j) {
            let w = self.config.weight(*mz, 1.0);
            norm_predicted += w * w;
        }

        let denom = norm_experimental.sqrt() * norm_predicted.sqrt();
        let cosine = if denom > 0.0 { dot / denom } else { 0.0 };
        let tanimoto =
            nb_common_peaks as f64 / (nb_peaks1 + nb_peaks2 - nb_common_peaks) as f64;

        ScoringResult {
            cosine,
            tanimoto,
            nb_common_peaks,
            nb_peaks1,
            nb_peaks2,
        }
    }
}

impl SpectrumComparator for SimilarityScorer {
    fn compare(&self, experimental: &ExperimentalSpectrum, predicted: &[f64]) -> ScoringResult {
        self.score(experimental, predicted)
    }
}

/// Score `predicted` against `experimental` with a one-off [`SimilarityScorer`]
pub fn score(
    config: &ComparatorConfig,
    experimental: &ExperimentalSpectrum,
    predicted: &[f64],
) -> ScoringResult {
    SimilarityScorer::new(*config).score(experimental, predicted)
}

#[cfg(test)]
mod test {
    use super::*;

    fn spectrum() -> ExperimentalSpectrum {
        ExperimentalSpectrum::from_xy("s", &[100.0, 200.0, 250.0], &[10.0, 50.0, 20.0])
    }

    #[test]
    fn test_exact_match() {
        let spectrum = ExperimentalSpectrum::from_xy("s", &[100.0, 200.0, 250.0], &[1.0, 1.0, 1.0]);
        let result = score(&ComparatorConfig::default(), &spectrum, &[250.0, 100.0, 200.0]);
        assert_eq!(result.nb_common_peaks, 3);
        assert_eq!(result.tanimoto, 1.0);
        assert!((result.cosine - 1.0).abs() < 1e-9, "{}", result.cosine);
    }

    #[test]
    fn test_partial_match() {
        let result = score(&ComparatorConfig::default(), &spectrum(), &[100.0, 150.0]);
        assert_eq!(result.nb_common_peaks, 1);
        assert_eq!(result.nb_peaks1, 3);
        assert_eq!(result.nb_peaks2, 2);
        assert!((result.tanimoto - 0.25).abs() < 1e-12);
        assert!(result.cosine > 0.0 && result.cosine < 1.0);
    }

    #[test]
    fn test_ppm_window() {
        let config = ComparatorConfig::new(0.0, 1.0, 10.0);
        let within = score(&config, &spectrum(), &[200.0019]);
        assert_eq!(within.nb_common_peaks, 1);
        let outside = score(&config, &spectrum(), &[200.0021]);
        assert_eq!(outside.nb_common_peaks, 0);
        assert_eq!(outside.cosine, 0.0);
    }

    #[test]
    fn test_empty_sides() {
        let result = score(&ComparatorConfig::default(), &spectrum(), &[]);
        assert_eq!(result.cosine, 0.0);
        assert_eq!(result.tanimoto, 0.0);
        assert_eq!(result.nb_peaks1, 3);

        let empty = ExperimentalSpectrum::from_xy("e", &[], &[]);
        let result = score(&ComparatorConfig::default(), &empty, &[100.0]);
        assert_eq!(result.nb_peaks2, 1);
        assert!(result.is_zero());
    }

    #[test]
    fn test_idempotent() {
        let scorer = SimilarityScorer::new(ComparatorConfig::new(2.0, 0.5, 20.0));
        let masses = [100.0005, 150.0, 249.999];
        let first = scorer.score(&spectrum(), &masses);
        let second = scorer.score(&spectrum(), &masses);
        assert_eq!(first, second);
        assert_eq!(first.cosine.to_bits(), second.cosine.to_bits());
        assert_eq!(first.tanimoto.to_bits(), second.tanimoto.to_bits());
    }
}
