use mzpeaks::prelude::*;
use mzpeaks::{CentroidPeak, PeakSet, Tolerance};

/// A named, peak-picked experimental spectrum
#[derive(Debug, Clone, Default)]
pub struct ExperimentalSpectrum {
    pub name: String,
    pub peaks: PeakSet,
}

impl ExperimentalSpectrum {
    pub fn new(name: impl Into<String>, peaks: PeakSet) -> Self {
        Self {
            name: name.into(),
            peaks,
        }
    }

    pub fn from_pairs<I: IntoIterator<Item = (f64, f32)>>(name: impl Into<String>, pairs: I) -> Self {
        let peaks: Vec<CentroidPeak> = pairs
            .into_iter()
            .map(|(mz, intensity)| CentroidPeak::new(mz, intensity, 0))
            .collect();
        Self::new(name, PeakSet::new(peaks))
    }

    /// Build a spectrum from parallel m/z and intensity arrays
    pub fn from_xy(name: impl Into<String>, x: &[f64], y: &[f32]) -> Self {
        Self::from_pairs(name, x.iter().copied().zip(y.iter().copied()))
    }

    pub fn len(&self) -> usize {
        self.peaks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn iter(&self) -> impl Iterator<Item = &CentroidPeak> {
        self.peaks.iter()
    }

    /// The peak m/z values in ascending order
    pub fn masses(&self) -> Vec<f64> {
        self.peaks.iter().map(|p| p.mz).collect()
    }

    pub fn has_peak(&self, mz: f64, error_tolerance: Tolerance) -> Option<&CentroidPeak> {
        self.peaks.has_peak(mz, error_tolerance)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_sorted_on_build() {
        let spectrum = ExperimentalSpectrum::from_xy("s", &[250.0, 100.0, 200.0], &[3.0, 1.0, 2.0]);
        assert_eq!(spectrum.len(), 3);
        assert_eq!(spectrum.masses(), vec![100.0, 200.0, 250.0]);
        let hit = spectrum.has_peak(200.001, Tolerance::PPM(10.0)).unwrap();
        assert_eq!(hit.intensity, 2.0);
        assert!(spectrum.has_peak(201.0, Tolerance::PPM(10.0)).is_none());
    }
}
