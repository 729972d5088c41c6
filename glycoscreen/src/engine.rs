//! The seam to the external fragmentation engine.
//!
//! A [`FragmentationEngine`] turns a candidate structure and a label-scoped rule set into
//! a list of fragment masses and a fragmentation tree. Two adapters are provided: one
//! that runs an external program speaking JSON over stdin and stdout, and one that reads
//! results computed ahead of time from a directory.
use std::fs;
use std::io::{self, Write};
use std::path::PathBuf;
use std::process::{Command, ExitStatus, Stdio};
use std::sync::Arc;
use std::thread;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, trace};

use crate::loader::StructureHandle;
use crate::rules::AdductLabel;
use crate::tree::{FragmentNode, FragmentTree, NodeIdAllocator};

/// Pass-through knobs handed to the fragmentation engine
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct FragmentationOptions {
    pub ionizations: Vec<String>,
    pub modes: Vec<String>,
    pub max_depth: u32,
    pub limit_reactions: u32,
    pub min_ionizations: u32,
    pub max_ionizations: u32,
    pub min_reactions: u32,
    pub max_reactions: u32,
}

impl Default for FragmentationOptions {
    fn default() -> Self {
        Self {
            ionizations: vec!["esi".to_string()],
            modes: vec!["positive".to_string()],
            max_depth: 5,
            limit_reactions: 500,
            min_ionizations: 1,
            max_ionizations: 1,
            min_reactions: 0,
            max_reactions: 1,
        }
    }
}

#[derive(Debug, Clone)]
pub struct FragmentationRequest {
    pub candidate: String,
    pub adduct: AdductLabel,
    pub structure: StructureHandle,
    /// The rule file text scoped to `adduct`
    pub rules: Arc<str>,
    pub options: FragmentationOptions,
}

#[derive(Debug, Serialize)]
struct EnginePayload<'a> {
    structure: &'a str,
    rules: &'a str,
    options: &'a FragmentationOptions,
}

/// The JSON document an engine produces for one request
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EngineOutput {
    #[serde(default)]
    pub masses: Vec<f64>,
    pub tree: FragmentNode,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub render: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct FragmentationResult {
    /// Predicted masses, ascending
    pub masses: Vec<f64>,
    pub tree: FragmentTree,
    pub render: Option<String>,
}

impl FragmentationResult {
    pub fn from_output(output: EngineOutput, allocator: &mut NodeIdAllocator) -> Self {
        let mut masses = output.masses;
        masses.sort_by(|a, b| a.total_cmp(b));
        let tree = FragmentTree::build(&output.tree, allocator);
        Self {
            masses,
            tree,
            render: output.render,
        }
    }
}

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("An IO error occurred while running the fragmentation engine: {0}")]
    IOError(
        #[from]
        #[source]
        io::Error,
    ),
    #[error("Failed to decode the fragmentation engine output: {0}")]
    Decode(
        #[from]
        #[source]
        serde_json::Error,
    ),
    #[error("The fragmentation engine exited with {status}: {stderr}")]
    CommandFailed { status: ExitStatus, stderr: String },
    #[error("No precomputed fragmentation for {candidate} with {adduct} at {}", .path.display())]
    MissingPrecomputed {
        candidate: String,
        adduct: AdductLabel,
        path: PathBuf,
    },
}

pub trait FragmentationEngine: Send + Sync {
    fn run(&self, request: &FragmentationRequest) -> Result<EngineOutput, EngineError>;

    fn fragment(
        &self,
        request: &FragmentationRequest,
        allocator: &mut NodeIdAllocator,
    ) -> Result<FragmentationResult, EngineError> {
        let output = self.run(request)?;
        let result = FragmentationResult::from_output(output, allocator);
        debug!(
            "Fragmented {} with {}: {} masses, {} tree nodes",
            request.candidate,
            request.adduct,
            result.masses.len(),
            result.tree.len()
        );
        Ok(result)
    }
}

/// Runs an external program once per request, writing the request as JSON to its
/// stdin and reading an [`EngineOutput`] from its stdout
#[derive(Debug, Clone)]
pub struct CommandFragmenter {
    pub program: PathBuf,
    pub args: Vec<String>,
}

impl CommandFragmenter {
    pub fn new(program: impl Into<PathBuf>, args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args,
        }
    }
}

impl FragmentationEngine for CommandFragmenter {
    fn run(&self, request: &FragmentationRequest) -> Result<EngineOutput, EngineError> {
        let payload = serde_json::to_vec(&EnginePayload {
            structure: request.structure.as_str(),
            rules: &request.rules,
            options: &request.options,
        })?;
        trace!(
            "Invoking {} for {} with {}",
            self.program.display(),
            request.candidate,
            request.adduct
        );
        let mut child = Command::new(&self.program)
            .args(&self.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()?;

        // stdin is fed while stdout drains
        let stdin = child.stdin.take();
        let writer = thread::spawn(move || -> io::Result<()> {
            if let Some(mut stdin) = stdin {
                stdin.write_all(&payload)?;
            }
            Ok(())
        });
        let output = child.wait_with_output()?;
        let fed = writer.join();

        // a non-zero exit outranks a broken stdin pipe
        if !output.status.success() {
            if let Ok(Err(e)) = &fed {
                debug!("Engine exited before reading its input: {e}");
            }
            return Err(EngineError::CommandFailed {
                status: output.status,
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }
        match fed {
            Ok(result) => result?,
            Err(_) => {
                return Err(EngineError::IOError(io::Error::new(
                    io::ErrorKind::BrokenPipe,
                    "stdin writer panicked",
                )))
            }
        }
        Ok(serde_json::from_slice(&output.stdout)?)
    }
}

/// Reads results stored as `<root>/<candidate>/<adduct>.json`
#[derive(Debug, Clone)]
pub struct PrecomputedFragmenter {
    pub root: PathBuf,
}

impl PrecomputedFragmenter {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn path_for(&self, candidate: &str, adduct: &str) -> PathBuf {
        self.root.join(candidate).join(format!("{adduct}.json"))
    }
}

impl FragmentationEngine for PrecomputedFragmenter {
    fn run(&self, request: &FragmentationRequest) -> Result<EngineOutput, EngineError> {
        let path = self.path_for(&request.candidate, &request.adduct);
        if !path.is_file() {
            return Err(EngineError::MissingPrecomputed {
                candidate: request.candidate.clone(),
                adduct: request.adduct.clone(),
                path,
            });
        }
        let handle = io::BufReader::new(fs::File::open(&path)?);
        Ok(serde_json::from_reader(handle)?)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn request(candidate: &str, adduct: &str) -> FragmentationRequest {
        FragmentationRequest {
            candidate: candidate.to_string(),
            adduct: adduct.to_string(),
            structure: StructureHandle::new("Gal(b1-4)Glc"),
            rules: Arc::from("rules"),
            options: FragmentationOptions::default(),
        }
    }

    #[test]
    fn test_precomputed() {
        let engine = PrecomputedFragmenter::new("./tests/data/fragments");
        let mut allocator = NodeIdAllocator::new();
        let result = engine.fragment(&request("Lactose", "H"), &mut allocator).unwrap();
        assert_eq!(result.masses, vec![163.06, 181.07, 325.11, 343.12]);
        assert_eq!(result.tree.len(), 4);
        assert_eq!(allocator.walks(), 1);
        assert!(result.render.is_none());

        match engine.run(&request("Lactose", "K")) {
            Err(EngineError::MissingPrecomputed { adduct, .. }) => assert_eq!(adduct, "K"),
            other => panic!("Expected a missing fragmentation, got {other:?}"),
        }
    }

    #[test]
    fn test_options_wire_format() {
        let text = serde_json::to_string(&FragmentationOptions::default()).unwrap();
        assert!(text.contains("\"maxDepth\":5"));
        assert!(text.contains("\"limitReactions\":500"));
        let options: FragmentationOptions = serde_json::from_str(r#"{"maxReactions": 3}"#).unwrap();
        assert_eq!(options.max_reactions, 3);
        assert_eq!(options.max_depth, 5);
    }

    #[cfg(unix)]
    #[test]
    fn test_command_failure() {
        let engine = CommandFragmenter::new("sh", vec!["-c".into(), "cat > /dev/null; echo boom >&2; exit 3".into()]);
        match engine.run(&request("Lactose", "H")) {
            Err(EngineError::CommandFailed { stderr, .. }) => assert_eq!(stderr, "boom"),
            other => panic!("Expected a failed command, got {other:?}"),
        }
    }

    #[cfg(unix)]
    #[test]
    fn test_command_exits_without_reading() {
        let engine = CommandFragmenter::new("sh", vec!["-c".into(), "echo boom >&2; exit 3".into()]);
        let mut big = request("Lactose", "H");
        big.rules = Arc::from("x".repeat(1 << 20));
        for req in [request("Lactose", "H"), big] {
            match engine.run(&req) {
                Err(EngineError::CommandFailed { status, stderr }) => {
                    assert_eq!(stderr, "boom");
                    assert_eq!(status.code(), Some(3));
                }
                other => panic!("Expected a failed command, got {other:?}"),
            }
        }
    }

    #[cfg(unix)]
    #[test]
    fn test_command_round_trip() {
        let engine = CommandFragmenter::new(
            "sh",
            vec![
                "-c".into(),
                r#"cat > /dev/null; echo '{"masses": [300.0, 100.0], "tree": {"masses": [{"mz": 300.0}], "children": [{"masses": [{"mz": 100.0}]}]}}'"#.into(),
            ],
        );
        let mut allocator = NodeIdAllocator::new();
        let result = engine.fragment(&request("Lactose", "H"), &mut allocator).unwrap();
        assert_eq!(result.masses, vec![100.0, 300.0]);
        assert_eq!(result.tree.len(), 2);
    }
}
