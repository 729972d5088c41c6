//! Fragmentation trees materialized into an integer-id arena.
//!
//! A fragmentation engine hands back a nested tree of fragments. Before the tree is
//! used for anything, it is walked once in pre-order by a [`NodeIdAllocator`], which
//! gives every node a [`NodeId`] that is unique within that tree and fills the
//! `parent_of` and `children_of` indices. All ancestry questions are answered from
//! those indices, never by comparing fragment masses: two fragments with identical
//! m/z on different branches are different nodes.
use std::collections::{BTreeSet, HashMap};
use std::hash::Hash;

use identity_hash::{BuildIdentityHasher, IdentityHashable};
use mzpeaks::Tolerance;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, warn};

use crate::spectrum::ExperimentalSpectrum;

#[derive(
    Debug, Default, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct NodeId(usize);

impl NodeId {
    pub fn new(value: usize) -> Self {
        Self(value)
    }

    pub fn get(&self) -> usize {
        self.0
    }
}

impl Hash for NodeId {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        state.write_usize(self.0);
    }
}

impl IdentityHashable for NodeId {}

impl std::fmt::Display for NodeId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "#{}", self.0)
    }
}

pub type NodeIdMap<V> = HashMap<NodeId, V, BuildIdentityHasher<NodeId>>;

/// Hands out [`NodeId`]s for one tree walk at a time.
///
/// Each call to [`NodeIdAllocator::new_tree_walk`] starts numbering from zero again,
/// so ids are only meaningful within the tree they were assigned in.
#[derive(Debug, Default, Clone)]
pub struct NodeIdAllocator {
    next: usize,
    walks: usize,
}

impl NodeIdAllocator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn new_tree_walk(&mut self) {
        self.next = 0;
        self.walks += 1;
    }

    pub fn next_id(&mut self) -> NodeId {
        let id = NodeId(self.next);
        self.next += 1;
        id
    }

    /// The number of tree walks started with this allocator
    pub fn walks(&self) -> usize {
        self.walks
    }
}

/// One m/z value associated with a fragment
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MassInfo {
    pub mz: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
}

impl MassInfo {
    pub fn new(mz: f64) -> Self {
        Self { mz, label: None }
    }
}

impl From<f64> for MassInfo {
    fn from(value: f64) -> Self {
        Self::new(value)
    }
}

/// The nested tree shape produced by a fragmentation engine
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FragmentNode {
    #[serde(default)]
    pub masses: Vec<MassInfo>,
    #[serde(default)]
    pub children: Vec<FragmentNode>,
}

impl FragmentNode {
    pub fn new<I: IntoIterator<Item = f64>>(masses: I) -> Self {
        Self {
            masses: masses.into_iter().map(MassInfo::new).collect(),
            children: Vec::new(),
        }
    }

    pub fn with_child(mut self, child: FragmentNode) -> Self {
        self.children.push(child);
        self
    }
}

/// A node of a [`FragmentTree`]
#[derive(Debug, Clone, PartialEq)]
pub struct TreeNode {
    pub id: NodeId,
    pub masses: Vec<MassInfo>,
}

impl TreeNode {
    pub fn matches_mz(&self, mz: f64, error_tolerance: Tolerance) -> bool {
        self.masses.iter().any(|m| error_tolerance.test(m.mz, mz))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Error)]
#[error("No fragment lies within {ppm} ppm of the precursor m/z {target_mz}")]
pub struct PrecursorNotFound {
    pub target_mz: f64,
    pub ppm: f64,
}

/// The fragments that descend from an isolated precursor ion
#[derive(Debug, Clone, PartialEq)]
pub struct PrecursorSubtree {
    /// The outermost nodes matching the precursor m/z, in pre-order
    pub precursors: Vec<NodeId>,
    /// Every node reachable from a precursor, the precursors included
    pub descendants: BTreeSet<NodeId>,
    /// The distinct masses carried by `descendants`, ascending
    pub masses: Vec<f64>,
}

/// A fragmentation tree stored as a flat, pre-ordered node array with parent and
/// children indices.
#[derive(Debug, Clone, Default)]
pub struct FragmentTree {
    nodes: Vec<TreeNode>,
    positions: NodeIdMap<usize>,
    parent_of: NodeIdMap<NodeId>,
    children_of: NodeIdMap<Vec<NodeId>>,
}

impl FragmentTree {
    /// Materialize `root` with a single pre-order walk, starting a new walk on `allocator`
    pub fn build(root: &FragmentNode, allocator: &mut NodeIdAllocator) -> Self {
        allocator.new_tree_walk();
        let mut tree = Self::default();
        let mut stack: Vec<(&FragmentNode, Option<NodeId>)> = vec![(root, None)];
        while let Some((node, parent)) = stack.pop() {
            let id = allocator.next_id();
            tree.positions.insert(id, tree.nodes.len());
            tree.nodes.push(TreeNode {
                id,
                masses: node.masses.clone(),
            });
            tree.children_of.insert(id, Vec::with_capacity(node.children.len()));
            if let Some(parent) = parent {
                tree.parent_of.insert(id, parent);
                tree.children_of.entry(parent).or_default().push(id);
            }
            for child in node.children.iter().rev() {
                stack.push((child, Some(id)));
            }
        }
        tree
    }

    pub fn from_root(root: &FragmentNode) -> Self {
        Self::build(root, &mut NodeIdAllocator::new())
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn root(&self) -> Option<NodeId> {
        self.nodes.first().map(|n| n.id)
    }

    pub fn get(&self, id: NodeId) -> Option<&TreeNode> {
        self.positions.get(&id).map(|i| &self.nodes[*i])
    }

    pub fn contains(&self, id: NodeId) -> bool {
        self.positions.contains_key(&id)
    }

    /// Iterate over the nodes in pre-order
    pub fn iter(&self) -> std::slice::Iter<'_, TreeNode> {
        self.nodes.iter()
    }

    pub fn parent_of(&self, id: NodeId) -> Option<NodeId> {
        self.parent_of.get(&id).copied()
    }

    pub fn children_of(&self, id: NodeId) -> &[NodeId] {
        self.children_of
            .get(&id)
            .map(|c| c.as_slice())
            .unwrap_or_default()
    }

    pub fn has_edge(&self, parent: NodeId, child: NodeId) -> bool {
        self.children_of(parent).contains(&child)
    }

    /// The chain of ancestors of `id`, nearest first, ending at the root
    pub fn ancestors(&self, id: NodeId) -> Vec<NodeId> {
        let mut chain = Vec::new();
        let mut current = id;
        while let Some(parent) = self.parent_of(current) {
            chain.push(parent);
            current = parent;
        }
        chain
    }

    pub fn is_descendant_of(&self, id: NodeId, ancestor: NodeId) -> bool {
        let mut current = id;
        while let Some(parent) = self.parent_of(current) {
            if parent == ancestor {
                return true;
            }
            current = parent;
        }
        false
    }

    /// Every mass in the tree, deduplicated and ascending
    pub fn all_masses(&self) -> Vec<f64> {
        collect_masses(self.nodes.iter())
    }

    /// Locate the outermost nodes carrying a mass within `ppm` of `target_mz`.
    ///
    /// The walk does not descend below a matching node, so a node nested under another
    /// match is never reported on its own.
    pub fn find_precursor_nodes(&self, target_mz: f64, ppm: f64) -> Vec<NodeId> {
        let error_tolerance = Tolerance::PPM(ppm);
        let mut found = Vec::new();
        let mut stack: Vec<NodeId> = self.root().into_iter().collect();
        while let Some(id) = stack.pop() {
            let Some(node) = self.get(id) else {
                continue;
            };
            if node.matches_mz(target_mz, error_tolerance) {
                found.push(id);
                continue;
            }
            stack.extend(self.children_of(id).iter().rev().copied());
        }
        found
    }

    /// Collect every node reachable from `precursors` through the children index.
    pub fn descendants(&self, precursors: &[NodeId]) -> BTreeSet<NodeId> {
        let mut members = BTreeSet::new();
        let mut stack: Vec<NodeId> = precursors
            .iter()
            .copied()
            .filter(|id| self.contains(*id))
            .collect();
        while let Some(id) = stack.pop() {
            if !members.insert(id) {
                continue;
            }
            stack.extend(self.children_of(id).iter().copied());
        }
        members
    }

    /// The union of masses carried by `members`, deduplicated and ascending
    pub fn extract_masses(&self, members: &BTreeSet<NodeId>) -> Vec<f64> {
        collect_masses(members.iter().filter_map(|id| self.get(*id)))
    }

    pub fn extract_precursor_subtree(
        &self,
        target_mz: f64,
        ppm: f64,
    ) -> Result<PrecursorSubtree, PrecursorNotFound> {
        let precursors = self.find_precursor_nodes(target_mz, ppm);
        if precursors.is_empty() {
            return Err(PrecursorNotFound { target_mz, ppm });
        }
        let descendants = self.descendants(&precursors);
        let masses = self.extract_masses(&descendants);
        debug!(
            "Found {} precursor nodes for {target_mz} with {} descendants",
            precursors.len(),
            descendants.len()
        );
        Ok(PrecursorSubtree {
            precursors,
            descendants,
            masses,
        })
    }

    /// Build the sub-tree of nodes satisfying `predicate` together with all of their
    /// ancestors, keeping the original ids.
    pub fn filter<P: Fn(&TreeNode) -> bool>(&self, predicate: P) -> Option<FilteredNode> {
        let mut keep: NodeIdMap<bool> = NodeIdMap::default();
        // Children always follow their parent in pre-order, so a reverse scan sees
        // every child before its parent.
        for node in self.nodes.iter().rev() {
            let kept = predicate(node)
                || self
                    .children_of(node.id)
                    .iter()
                    .any(|c| keep.get(c).copied().unwrap_or_default());
            keep.insert(node.id, kept);
        }
        let root = self.root()?;
        if !keep.get(&root).copied().unwrap_or_default() {
            return None;
        }
        Some(self.materialize_filtered(root, &keep))
    }

    fn materialize_filtered(&self, id: NodeId, keep: &NodeIdMap<bool>) -> FilteredNode {
        let masses = self.get(id).map(|n| n.masses.clone()).unwrap_or_default();
        let children = self
            .children_of(id)
            .iter()
            .filter(|c| keep.get(c).copied().unwrap_or_default())
            .map(|c| self.materialize_filtered(*c, keep))
            .collect();
        FilteredNode {
            id,
            masses,
            children,
        }
    }
}

fn collect_masses<'a, I: Iterator<Item = &'a TreeNode>>(nodes: I) -> Vec<f64> {
    let mut masses: Vec<f64> = nodes.flat_map(|n| n.masses.iter().map(|m| m.mz)).collect();
    masses.sort_by(|a, b| a.total_cmp(b));
    masses.dedup();
    masses
}

/// A sub-tree claimed to be taken from a [`FragmentTree`], carrying the original ids
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FilteredNode {
    pub id: NodeId,
    #[serde(default)]
    pub masses: Vec<MassInfo>,
    #[serde(default)]
    pub children: Vec<FilteredNode>,
}

impl FilteredNode {
    pub fn iter(&self) -> impl Iterator<Item = &FilteredNode> {
        let mut stack = vec![self];
        std::iter::from_fn(move || {
            let node = stack.pop()?;
            stack.extend(node.children.iter().rev());
            Some(node)
        })
    }

    /// The number of nodes in this sub-tree, counting `self`
    pub fn node_count(&self) -> usize {
        self.iter().count()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Edge {
    pub parent: NodeId,
    pub child: NodeId,
}

/// The ancestry of a filtered node that matched an experimental peak
#[derive(Debug, Clone, PartialEq)]
pub struct PeakAncestry {
    pub node: NodeId,
    pub mz: f64,
    pub peak_mz: f64,
    /// The node followed by its ancestors in the original tree, ending at the root
    pub path: Vec<NodeId>,
    /// The nearest node on `path` recorded as a precursor
    pub precursor: Option<NodeId>,
}

impl PeakAncestry {
    pub fn under_precursor(&self) -> bool {
        self.precursor.is_some()
    }
}

/// The outcome of checking a filtered tree against the tree it was taken from
#[derive(Debug, Clone, Default, PartialEq)]
pub struct VerificationReport {
    pub valid_edges: usize,
    pub invalid_edges: Vec<Edge>,
    /// Filtered nodes whose id does not exist in the original tree
    pub unknown_nodes: Vec<NodeId>,
    pub matched_peaks: Vec<PeakAncestry>,
}

impl VerificationReport {
    pub fn is_consistent(&self) -> bool {
        self.invalid_edges.is_empty() && self.unknown_nodes.is_empty()
    }

    pub fn peaks_under_precursor(&self) -> usize {
        self.matched_peaks
            .iter()
            .filter(|p| p.under_precursor())
            .count()
    }
}

/// Check that every edge of `filtered` exists in `original` and trace the ancestry of
/// every filtered node matching a peak of `spectrum`.
///
/// Inconsistencies are logged and reported, never fatal.
pub fn verify_subtree(
    original: &FragmentTree,
    filtered: &FilteredNode,
    precursors: &[NodeId],
    spectrum: &ExperimentalSpectrum,
    error_tolerance: Tolerance,
) -> VerificationReport {
    let mut report = VerificationReport::default();
    let mut stack = vec![filtered];
    while let Some(node) = stack.pop() {
        if !original.contains(node.id) {
            warn!("Filtered node {} does not exist in the original tree", node.id);
            report.unknown_nodes.push(node.id);
        }
        for child in node.children.iter() {
            if original.has_edge(node.id, child.id) {
                report.valid_edges += 1;
            } else {
                warn!(
                    "Filtered edge {} -> {} cannot be traced to the original tree (original parent {:?})",
                    node.id,
                    child.id,
                    original.parent_of(child.id)
                );
                report.invalid_edges.push(Edge {
                    parent: node.id,
                    child: child.id,
                });
            }
        }
        stack.extend(node.children.iter().rev());

        for mass in node.masses.iter() {
            if let Some(peak) = spectrum.has_peak(mass.mz, error_tolerance) {
                let mut path = vec![node.id];
                path.extend(original.ancestors(node.id));
                let precursor = path.iter().copied().find(|id| precursors.contains(id));
                report.matched_peaks.push(PeakAncestry {
                    node: node.id,
                    mz: mass.mz,
                    peak_mz: peak.mz,
                    path,
                    precursor,
                });
            }
        }
    }
    debug!(
        "Verified filtered tree: {} valid edges, {} invalid edges, {} matched peaks",
        report.valid_edges,
        report.invalid_edges.len(),
        report.matched_peaks.len()
    );
    report
}
