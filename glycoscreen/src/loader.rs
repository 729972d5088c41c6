//! Candidate structures and experimental datum folders.
use std::collections::HashMap;
use std::fs;
use std::io::{self, BufRead};
use std::path::{Path, PathBuf};

use mzdata::prelude::*;
use mzdata::spectrum::SignalContinuity;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::spectrum::ExperimentalSpectrum;

/// An opaque reference to a candidate's structure, passed as-is to the fragmentation engine
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct StructureHandle(String);

impl StructureHandle {
    pub fn new(raw: impl Into<String>) -> Self {
        Self(raw.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for StructureHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Candidate {
    pub name: String,
    pub structure: StructureHandle,
}

impl Candidate {
    pub fn new(name: impl Into<String>, structure: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            structure: StructureHandle::new(structure),
        }
    }
}

#[derive(Debug, Error)]
pub enum LoaderError {
    #[error("An IO error occurred while reading {}: {source}", .path.display())]
    IOError {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("Candidate {name:?} is defined more than once (line {line})")]
    DuplicateCandidate { name: String, line: usize },
    #[error("Malformed candidate entry on line {line}: {content:?}")]
    MalformedCandidate { line: usize, content: String },
    #[error("Unknown candidate {0:?}")]
    UnknownCandidate(String),
    #[error("{} did not yield any usable peak data", .0.display())]
    NoPeakData(PathBuf),
    #[error("Malformed peak list entry in {} on line {line}: {content:?}", .path.display())]
    MalformedPeakList {
        path: PathBuf,
        line: usize,
        content: String,
    },
    #[error("Unsupported spectrum file format: {}", .0.display())]
    UnsupportedFormat(PathBuf),
    #[error("Failed to pick peaks from spectrum {index} of {}: {message}", .path.display())]
    PeakPicking {
        path: PathBuf,
        index: usize,
        message: String,
    },
}

impl LoaderError {
    fn io(path: &Path, source: io::Error) -> Self {
        Self::IOError {
            path: path.to_path_buf(),
            source,
        }
    }
}

/// A collection of named candidate structures
pub trait StructureStore {
    fn list(&self) -> &[Candidate];

    fn get(&self, name: &str) -> Result<&Candidate, LoaderError> {
        self.list()
            .iter()
            .find(|c| c.name == name)
            .ok_or_else(|| LoaderError::UnknownCandidate(name.to_string()))
    }
}

/// Candidate structures in file order, with unique names
#[derive(Debug, Clone, Default)]
pub struct CandidateSet {
    candidates: Vec<Candidate>,
    by_name: HashMap<String, usize>,
}

impl CandidateSet {
    pub fn new(candidates: Vec<Candidate>) -> Result<Self, LoaderError> {
        let mut by_name = HashMap::with_capacity(candidates.len());
        for (i, c) in candidates.iter().enumerate() {
            if by_name.insert(c.name.clone(), i).is_some() {
                return Err(LoaderError::DuplicateCandidate {
                    name: c.name.clone(),
                    line: i + 1,
                });
            }
        }
        Ok(Self {
            candidates,
            by_name,
        })
    }

    /// Read `name<TAB>structure` lines, skipping blank lines and `#` comments
    pub fn from_tsv<R: BufRead>(reader: R) -> Result<Self, LoaderError> {
        let mut candidates = Vec::new();
        let mut by_name = HashMap::new();
        for (i, line) in reader.lines().enumerate() {
            let line = line.map_err(|e| LoaderError::io(Path::new("<candidates>"), e))?;
            let lineno = i + 1;
            let content = line.trim_end_matches(['\r', '\n']);
            if content.trim().is_empty() || content.starts_with('#') {
                continue;
            }
            let Some((name, structure)) = content.split_once('\t') else {
                return Err(LoaderError::MalformedCandidate {
                    line: lineno,
                    content: content.to_string(),
                });
            };
            let (name, structure) = (name.trim(), structure.trim());
            if name.is_empty() || structure.is_empty() {
                return Err(LoaderError::MalformedCandidate {
                    line: lineno,
                    content: content.to_string(),
                });
            }
            if by_name.insert(name.to_string(), candidates.len()).is_some() {
                return Err(LoaderError::DuplicateCandidate {
                    name: name.to_string(),
                    line: lineno,
                });
            }
            candidates.push(Candidate::new(name, structure));
        }
        Ok(Self {
            candidates,
            by_name,
        })
    }

    pub fn open_path<P: AsRef<Path>>(path: P) -> Result<Self, LoaderError> {
        let path = path.as_ref();
        let handle = fs::File::open(path).map_err(|e| LoaderError::io(path, e))?;
        let candidates = Self::from_tsv(io::BufReader::new(handle))?;
        info!("Loaded {} candidates from {}", candidates.len(), path.display());
        Ok(candidates)
    }

    pub fn len(&self) -> usize {
        self.candidates.len()
    }

    pub fn is_empty(&self) -> bool {
        self.candidates.is_empty()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Candidate> {
        self.candidates.iter()
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.candidates.iter().map(|c| c.name.as_str())
    }

    pub fn contains(&self, name: &str) -> bool {
        self.by_name.contains_key(name)
    }
}

impl StructureStore for CandidateSet {
    fn list(&self) -> &[Candidate] {
        &self.candidates
    }

    fn get(&self, name: &str) -> Result<&Candidate, LoaderError> {
        self.by_name
            .get(name)
            .map(|i| &self.candidates[*i])
            .ok_or_else(|| LoaderError::UnknownCandidate(name.to_string()))
    }
}

/// Produces peak-picked spectra from a file on disk
pub trait SpectrumSource {
    fn accepts(&self, path: &Path) -> bool;

    fn read_spectra(&self, path: &Path) -> Result<Vec<ExperimentalSpectrum>, LoaderError>;
}

const PEAK_LIST_EXTENSIONS: &[&str] = &["txt", "tsv", "xy"];
const MZDATA_EXTENSIONS: &[&str] = &["mzml", "mgf"];

fn extension_of(path: &Path) -> Option<String> {
    path.extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_lowercase())
}

fn stem_of(path: &Path) -> String {
    path.file_stem()
        .map(|s| s.to_string_lossy().to_string())
        .unwrap_or_default()
}

/// Reads two-column peak lists directly and mzML/MGF files through `mzdata`, keeping
/// only scans at `ms_level`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileSpectrumSource {
    pub ms_level: u8,
}

impl Default for FileSpectrumSource {
    fn default() -> Self {
        Self { ms_level: 2 }
    }
}

impl FileSpectrumSource {
    pub fn new(ms_level: u8) -> Self {
        Self { ms_level }
    }

    /// Parse whitespace-separated `mz intensity` lines. A non-numeric line before the
    /// first peak is treated as a column header.
    pub fn read_peak_list(&self, path: &Path) -> Result<ExperimentalSpectrum, LoaderError> {
        let handle = fs::File::open(path).map_err(|e| LoaderError::io(path, e))?;
        let mut pairs: Vec<(f64, f32)> = Vec::new();
        for (i, line) in io::BufReader::new(handle).lines().enumerate() {
            let line = line.map_err(|e| LoaderError::io(path, e))?;
            let content = line.trim();
            if content.is_empty() || content.starts_with('#') {
                continue;
            }
            let mut tokens = content
                .split(|c: char| c.is_whitespace() || c == ',')
                .filter(|t| !t.is_empty());
            let parsed = match (tokens.next(), tokens.next()) {
                (Some(mz), Some(intensity)) => mz
                    .parse::<f64>()
                    .ok()
                    .zip(intensity.parse::<f32>().ok()),
                _ => None,
            };
            match parsed {
                Some(pair) => pairs.push(pair),
                None if pairs.is_empty() => {
                    debug!("Skipping header line {content:?} in {}", path.display());
                }
                None => {
                    return Err(LoaderError::MalformedPeakList {
                        path: path.to_path_buf(),
                        line: i + 1,
                        content: content.to_string(),
                    })
                }
            }
        }
        if pairs.is_empty() {
            return Err(LoaderError::NoPeakData(path.to_path_buf()));
        }
        Ok(ExperimentalSpectrum::from_pairs(stem_of(path), pairs))
    }

    pub fn read_mzdata(&self, path: &Path) -> Result<Vec<ExperimentalSpectrum>, LoaderError> {
        let reader = mzdata::MZReader::open_path(path).map_err(|e| LoaderError::io(path, e))?;
        let stem = stem_of(path);
        let mut spectra = Vec::new();
        for (index, mut scan) in reader
            .into_iter()
            .filter(|s| s.ms_level() == self.ms_level)
            .enumerate()
        {
            let peaks = match scan.signal_continuity() {
                SignalContinuity::Profile => {
                    scan.pick_peaks(1.0).map_err(|e| LoaderError::PeakPicking {
                        path: path.to_path_buf(),
                        index,
                        message: format!("{e:?}"),
                    })?;
                    scan.peaks.take()
                }
                _ => scan.try_build_centroids().ok().cloned(),
            };
            match peaks {
                Some(peaks) if peaks.len() > 0 => {
                    spectra.push(ExperimentalSpectrum::new(format!("{stem}:{index}"), peaks));
                }
                _ => {
                    warn!("Spectrum {} of {} has no peaks", scan.id(), path.display());
                }
            }
        }
        if spectra.is_empty() {
            return Err(LoaderError::NoPeakData(path.to_path_buf()));
        }
        Ok(spectra)
    }
}

impl SpectrumSource for FileSpectrumSource {
    fn accepts(&self, path: &Path) -> bool {
        extension_of(path)
            .map(|ext| {
                PEAK_LIST_EXTENSIONS.contains(&ext.as_str())
                    || MZDATA_EXTENSIONS.contains(&ext.as_str())
            })
            .unwrap_or_default()
    }

    fn read_spectra(&self, path: &Path) -> Result<Vec<ExperimentalSpectrum>, LoaderError> {
        match extension_of(path) {
            Some(ext) if PEAK_LIST_EXTENSIONS.contains(&ext.as_str()) => {
                Ok(vec![self.read_peak_list(path)?])
            }
            Some(ext) if MZDATA_EXTENSIONS.contains(&ext.as_str()) => self.read_mzdata(path),
            _ => Err(LoaderError::UnsupportedFormat(path.to_path_buf())),
        }
    }
}

/// The spectra acquired for one known molecule
#[derive(Debug, Clone, Default)]
pub struct ExperimentalDatum {
    /// The name of the known-correct candidate, taken from the folder name
    pub molecule: String,
    pub folder: PathBuf,
    pub spectra: Vec<ExperimentalSpectrum>,
}

impl ExperimentalDatum {
    pub fn len(&self) -> usize {
        self.spectra.len()
    }

    pub fn is_empty(&self) -> bool {
        self.spectra.is_empty()
    }
}

fn sorted_entries(path: &Path) -> Result<Vec<PathBuf>, LoaderError> {
    let mut entries = fs::read_dir(path)
        .map_err(|e| LoaderError::io(path, e))?
        .map(|entry| entry.map(|e| e.path()))
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| LoaderError::io(path, e))?;
    entries.sort();
    Ok(entries)
}

/// Read one datum folder. Unreadable files are logged and skipped.
pub fn load_datum_folder<S: SpectrumSource + ?Sized>(
    folder: &Path,
    source: &S,
) -> Result<ExperimentalDatum, LoaderError> {
    let molecule = folder
        .file_name()
        .map(|s| s.to_string_lossy().to_string())
        .unwrap_or_default();
    let mut spectra = Vec::new();
    for path in sorted_entries(folder)? {
        if !path.is_file() || !source.accepts(&path) {
            continue;
        }
        match source.read_spectra(&path) {
            Ok(batch) => spectra.extend(batch),
            Err(e) => warn!("Skipping {}: {e}", path.display()),
        }
    }
    if spectra.is_empty() {
        return Err(LoaderError::NoPeakData(folder.to_path_buf()));
    }
    Ok(ExperimentalDatum {
        molecule,
        folder: folder.to_path_buf(),
        spectra,
    })
}

/// Read every datum folder under `root` in sorted order, skipping folders that yield
/// no spectra.
pub fn load_datum_folders<S: SpectrumSource + ?Sized>(
    root: &Path,
    source: &S,
) -> Result<Vec<ExperimentalDatum>, LoaderError> {
    let mut data = Vec::new();
    for folder in sorted_entries(root)? {
        if !folder.is_dir() {
            continue;
        }
        match load_datum_folder(&folder, source) {
            Ok(datum) => {
                debug!(
                    "Loaded {} spectra for {} from {}",
                    datum.len(),
                    datum.molecule,
                    folder.display()
                );
                data.push(datum);
            }
            Err(e) => warn!("Skipping datum folder {}: {e}", folder.display()),
        }
    }
    info!("Loaded {} experimental data from {}", data.len(), root.display());
    Ok(data)
}

#[cfg(test)]
mod test {
    use super::*;

    const CANDIDATES: &str = "# name\tstructure\nLNT\tGal(b1-3)GlcNAc(b1-3)Gal(b1-4)Glc\n\nLNnT\tGal(b1-4)GlcNAc(b1-3)Gal(b1-4)Glc\r\n";

    #[test]
    fn test_candidates() {
        let candidates = CandidateSet::from_tsv(io::Cursor::new(CANDIDATES)).unwrap();
        assert_eq!(candidates.len(), 2);
        assert_eq!(candidates.names().collect::<Vec<_>>(), ["LNT", "LNnT"]);
        let lnnt = candidates.get("LNnT").unwrap();
        assert_eq!(lnnt.structure.as_str(), "Gal(b1-4)GlcNAc(b1-3)Gal(b1-4)Glc");
        assert!(matches!(
            candidates.get("2'-FL"),
            Err(LoaderError::UnknownCandidate(_))
        ));
        assert_eq!(candidates.list().len(), 2);
    }

    #[test]
    fn test_duplicate_candidates() {
        let text = "A\tx\nB\ty\nA\tz\n";
        match CandidateSet::from_tsv(io::Cursor::new(text)) {
            Err(LoaderError::DuplicateCandidate { name, line }) => {
                assert_eq!(name, "A");
                assert_eq!(line, 3);
            }
            other => panic!("Expected a duplicate error, got {other:?}"),
        }
        assert!(matches!(
            CandidateSet::from_tsv(io::Cursor::new("no-tab-here\n")),
            Err(LoaderError::MalformedCandidate { line: 1, .. })
        ));
    }

    #[test]
    fn test_peak_list() {
        let source = FileSpectrumSource::default();
        let spectrum = source
            .read_peak_list(Path::new("./tests/data/datum/LNT/scan_01.txt"))
            .unwrap();
        assert_eq!(spectrum.name, "scan_01");
        assert_eq!(spectrum.len(), 4);
        assert_eq!(spectrum.masses()[0], 163.06);
    }

    #[test_log::test]
    fn test_datum_folders() {
        let source = FileSpectrumSource::default();
        let data = load_datum_folders(Path::new("./tests/data/datum"), &source).unwrap();
        let molecules: Vec<_> = data.iter().map(|d| d.molecule.as_str()).collect();
        assert_eq!(molecules, ["LNT", "LNnT"]);
        let names: Vec<_> = data[0].spectra.iter().map(|s| s.name.as_str()).collect();
        assert_eq!(names, ["scan_01", "scan_02"]);
        let names: Vec<_> = data[1].spectra.iter().map(|s| s.name.as_str()).collect();
        assert_eq!(names, ["ms2:0"]);
        assert_eq!(data[1].spectra[0].len(), 3);
    }
}
