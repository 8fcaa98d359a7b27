//! # Revision Trees
//!
//! Every document owns one [`RevTree`]: a forest of branches recording every
//! revision this store has heard of, whether or not it holds the body.
//!
//! ```text
//!   pos=1                              (generation of the branch root)
//!   1-a ──► 2-b ──► 3-c                leaf (winner)
//!            │
//!            └────► 3-d (deleted)      leaf (deleted conflict)
//!
//!   pos=4                              (a stemmed, disjoint branch)
//!   4-x ──► 5-y                        leaf (conflict)
//! ```
//!
//! ## Representation
//!
//! A branch is a [`RevPath`]: the generation of its root plus an owned
//! [`RevNode`] whose children are kept sorted by hash. Nodes are addressed by
//! `(generation, hash)`, never by pointer, so merging two trees is a walk that
//! unifies equal addresses. Nothing is shared between trees; merge clones its
//! input and returns a fresh tree.
//!
//! On disk a branch is flat: its nodes in pre-order, each naming its parent's
//! index, so the stored JSON is the same depth however long the history is.
//!
//! ## Merge Outcomes
//!
//! | Outcome | Meaning |
//! |---------|---------|
//! | `NewLeaf` | The incoming branch extends an existing leaf (normal update) |
//! | `NewBranch` | The incoming branch forks below a leaf (conflict) |
//! | `InternalNode` | Every incoming revision was already known |
//!
//! ## Invariants
//!
//! - Generations strictly increase from root to leaf
//! - A `(generation, hash)` pair appears at most once
//! - Stemming removes ancestors only; leaves, and therefore the winner, survive

use std::cmp::Ordering;
use std::collections::{BTreeSet, VecDeque};
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::types::RevId;

// =============================================================================
// Nodes and Branches
// =============================================================================

/// Whether this store holds the body of a revision.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RevStatus {
    /// Body stored locally.
    Available,
    /// Known only by id (an ancestor learned from history).
    Missing,
}

fn is_false(b: &bool) -> bool {
    !*b
}

/// One revision in a branch.
///
/// Branches can be as deep as the stemming limit, so nothing here recurses:
/// clone, equality, drop and the stored form all work on the flattened
/// pre-order list or an explicit stack.
pub struct RevNode {
    /// Hash part of the revision id.
    pub hash: String,
    /// Whether the body is held locally.
    pub status: RevStatus,
    /// Tombstone flag.
    pub deleted: bool,
    /// Descendants, sorted by hash.
    pub children: Vec<RevNode>,
}

impl RevNode {
    /// Creates a childless node.
    pub fn new(hash: impl Into<String>, status: RevStatus, deleted: bool) -> Self {
        Self {
            hash: hash.into(),
            status,
            deleted,
            children: Vec::new(),
        }
    }

    fn is_leaf(&self) -> bool {
        self.children.is_empty()
    }
}

impl Clone for RevNode {
    fn clone(&self) -> Self {
        rebuild(flatten(self)).unwrap_or_else(|| RevNode::new(self.hash.clone(), self.status, self.deleted))
    }
}

impl PartialEq for RevNode {
    fn eq(&self, other: &Self) -> bool {
        flatten(self) == flatten(other)
    }
}

impl Eq for RevNode {}

impl fmt::Debug for RevNode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(flatten(self)).finish()
    }
}

impl Drop for RevNode {
    fn drop(&mut self) {
        let mut pending = std::mem::take(&mut self.children);
        while let Some(mut node) = pending.pop() {
            pending.append(&mut node.children);
        }
    }
}

/// A branch rooted at generation `pos`.
///
/// Stored as `{"pos": 1, "nodes": [...]}` with the nodes in pre-order, each
/// naming its parent by index.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "FlatPath", into = "FlatPath")]
pub struct RevPath {
    /// Generation of `root`.
    pub pos: u64,
    /// First node of the branch.
    pub root: RevNode,
}

impl RevPath {
    /// Builds a linear branch from root-first nodes.
    ///
    /// Returns `None` for an empty node list.
    pub fn linear(pos: u64, nodes: Vec<RevNode>) -> Option<Self> {
        let mut iter = nodes.into_iter().rev();
        let mut current = iter.next()?;
        for mut parent in iter {
            parent.children = vec![current];
            current = parent;
        }
        Some(Self { pos, root: current })
    }
}

// =============================================================================
// Stored Form
// =============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
struct FlatNode {
    hash: String,
    status: RevStatus,
    #[serde(default, skip_serializing_if = "is_false")]
    deleted: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    parent: Option<usize>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct FlatPath {
    pos: u64,
    nodes: Vec<FlatNode>,
}

impl From<RevPath> for FlatPath {
    fn from(path: RevPath) -> Self {
        FlatPath {
            pos: path.pos,
            nodes: flatten(&path.root),
        }
    }
}

impl TryFrom<FlatPath> for RevPath {
    type Error = String;

    fn try_from(flat: FlatPath) -> Result<Self, Self::Error> {
        let root = rebuild(flat.nodes).ok_or_else(|| format!("malformed branch at pos {}", flat.pos))?;
        Ok(RevPath { pos: flat.pos, root })
    }
}

/// Lists a subtree in pre-order, children in stored order.
fn flatten(root: &RevNode) -> Vec<FlatNode> {
    let mut out = Vec::new();
    let mut stack: Vec<(&RevNode, Option<usize>)> = vec![(root, None)];
    while let Some((node, parent)) = stack.pop() {
        let idx = out.len();
        out.push(FlatNode {
            hash: node.hash.clone(),
            status: node.status,
            deleted: node.deleted,
            parent,
        });
        for child in node.children.iter().rev() {
            stack.push((child, Some(idx)));
        }
    }
    out
}

/// Inverse of [`flatten`]. `None` unless node 0 is the only root and every
/// parent index points backwards.
fn rebuild(flat: Vec<FlatNode>) -> Option<RevNode> {
    let mut parents = Vec::with_capacity(flat.len());
    let mut slots = Vec::with_capacity(flat.len());
    for (i, node) in flat.into_iter().enumerate() {
        match node.parent {
            None if i == 0 => {}
            Some(p) if p < i => {}
            _ => return None,
        }
        parents.push(node.parent);
        slots.push(Some(RevNode::new(node.hash, node.status, node.deleted)));
    }
    // Children come after their parent, so walking backwards finishes every
    // subtree before attaching it.
    for i in (1..slots.len()).rev() {
        let mut node = slots[i].take()?;
        node.children.reverse();
        let parent = parents[i]?;
        slots[parent].as_mut()?.children.push(node);
    }
    let mut root = slots.into_iter().next().flatten()?;
    root.children.reverse();
    Some(root)
}

/// The `_revisions` shape: newest hash first, `start` is the newest generation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Revisions {
    /// Generation of `ids[0]`.
    pub start: u64,
    /// Hashes from newest to oldest.
    pub ids: Vec<String>,
}

/// A leaf of the tree with its flags.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Leaf {
    /// Full revision id of the leaf.
    pub rev: RevId,
    /// Tombstone flag.
    pub deleted: bool,
    /// Whether the body is held locally.
    pub status: RevStatus,
}

/// One root-to-leaf chain, as produced by [`RevTree::root_to_leaf`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LeafPath {
    /// Generation of `nodes[0]`.
    pub pos: u64,
    /// Root-first nodes (children cleared).
    pub nodes: Vec<RevNode>,
}

/// How an incoming branch related to the existing tree.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergeConflict {
    /// Extended an existing leaf.
    NewLeaf,
    /// Forked a second leaf from an ancestor.
    NewBranch,
    /// Nothing new.
    InternalNode,
}

/// Result of [`RevTree::merge`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MergeOutcome {
    /// The merged (and stemmed) tree.
    pub tree: RevTree,
    /// Relation of the incoming branch to the previous tree.
    pub conflicts: MergeConflict,
    /// Revisions removed by stemming.
    pub stemmed_revs: Vec<RevId>,
}

// =============================================================================
// Revision Tree
// =============================================================================

/// All known revisions of one document.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RevTree {
    paths: Vec<RevPath>,
}

impl RevTree {
    /// An empty tree (document never written).
    pub fn new() -> Self {
        Self::default()
    }

    /// Builds a tree from branches, sorted by root generation.
    pub fn from_paths(mut paths: Vec<RevPath>) -> Self {
        paths.sort_by_key(|p| p.pos);
        Self { paths }
    }

    /// The branches of this tree.
    pub fn paths(&self) -> &[RevPath] {
        &self.paths
    }

    /// True if no revision is known.
    pub fn is_empty(&self) -> bool {
        self.paths.is_empty()
    }

    // =========================================================================
    // Merge
    // =========================================================================

    /// Merges one incoming branch, then stems to `stem_depth`.
    ///
    /// Pure: `self` is untouched. Merging a branch the tree already fully
    /// contains yields [`MergeConflict::InternalNode`] and an equal tree.
    pub fn merge(&self, path: RevPath, stem_depth: usize) -> MergeOutcome {
        let (merged, conflicts) = do_merge(self.paths.clone(), path, false);
        let (paths, stemmed_revs) = stem(merged, stem_depth);
        MergeOutcome {
            tree: RevTree { paths },
            conflicts,
            stemmed_revs,
        }
    }

    /// Prunes every root-to-leaf path to at most `depth` nodes.
    ///
    /// Returns the revisions that no longer appear in the tree.
    pub fn stem(&self, depth: usize) -> (RevTree, Vec<RevId>) {
        let (paths, revs) = stem(self.paths.clone(), depth);
        (RevTree { paths }, revs)
    }

    // =========================================================================
    // Queries
    // =========================================================================

    /// Every leaf, in branch order.
    pub fn leaves(&self) -> Vec<Leaf> {
        let mut leaves = Vec::new();
        self.traverse(|pos, node| {
            if node.is_leaf() {
                leaves.push(Leaf {
                    rev: RevId::new(pos, node.hash.clone()),
                    deleted: node.deleted,
                    status: node.status,
                });
            }
        });
        leaves
    }

    /// The winning leaf: not deleted beats deleted, then higher generation,
    /// then lexicographically greater hash.
    pub fn winning_leaf(&self) -> Option<Leaf> {
        self.leaves().into_iter().max_by(compare_leaves)
    }

    /// Revision id of the winning leaf.
    pub fn winning_rev(&self) -> Option<RevId> {
        self.winning_leaf().map(|leaf| leaf.rev)
    }

    /// True if the winning leaf is a tombstone (or the tree is empty).
    pub fn winning_is_deleted(&self) -> bool {
        self.winning_leaf().map(|leaf| leaf.deleted).unwrap_or(true)
    }

    /// Non-deleted leaves other than the winner, in descending winner order.
    pub fn conflicts(&self) -> Vec<RevId> {
        self.losing_leaves(false)
    }

    /// Deleted leaves other than the winner.
    pub fn deleted_conflicts(&self) -> Vec<RevId> {
        self.losing_leaves(true)
    }

    fn losing_leaves(&self, deleted: bool) -> Vec<RevId> {
        let mut leaves = self.leaves();
        leaves.sort_by(|a, b| compare_leaves(b, a));
        leaves
            .into_iter()
            .skip(1)
            .filter(|leaf| leaf.deleted == deleted)
            .map(|leaf| leaf.rev)
            .collect()
    }

    /// Looks up the node for `rev`.
    pub fn node(&self, rev: &RevId) -> Option<&RevNode> {
        self.paths.iter().find_map(|path| {
            if rev.generation < path.pos {
                return None;
            }
            find_node(&path.root, rev.generation - path.pos, &rev.hash)
        })
    }

    /// True if `rev` is anywhere in the tree.
    pub fn contains(&self, rev: &RevId) -> bool {
        self.node(rev).is_some()
    }

    /// Tombstone flag of `rev`, if known.
    pub fn is_deleted(&self, rev: &RevId) -> Option<bool> {
        self.node(rev).map(|n| n.deleted)
    }

    /// True if `rev` is a leaf.
    pub fn is_leaf(&self, rev: &RevId) -> bool {
        self.node(rev).map(RevNode::is_leaf).unwrap_or(false)
    }

    /// Every revision id in the tree.
    pub fn all_revs(&self) -> Vec<RevId> {
        let mut revs = Vec::new();
        self.traverse(|pos, node| revs.push(RevId::new(pos, node.hash.clone())));
        revs
    }

    /// All root-to-leaf chains.
    pub fn root_to_leaf(&self) -> Vec<LeafPath> {
        root_to_leaf(&self.paths)
    }

    /// History of `rev` in `_revisions` shape (newest first).
    pub fn ancestry(&self, rev: &RevId) -> Option<Revisions> {
        for path in self.root_to_leaf() {
            let Some(idx) = path
                .nodes
                .iter()
                .enumerate()
                .position(|(i, n)| path.pos + i as u64 == rev.generation && n.hash == rev.hash)
            else {
                continue;
            };
            let ids = path.nodes[..=idx]
                .iter()
                .rev()
                .map(|n| n.hash.clone())
                .collect();
            return Some(Revisions {
                start: rev.generation,
                ids,
            });
        }
        None
    }

    /// The leaf `rev` leads to: `rev` itself if it is a leaf, otherwise the
    /// winning leaf among the chains passing through it.
    pub fn latest(&self, rev: &RevId) -> Option<RevId> {
        self.root_to_leaf()
            .into_iter()
            .filter(|path| {
                rev.generation >= path.pos
                    && path
                        .nodes
                        .get((rev.generation - path.pos) as usize)
                        .map(|n| n.hash == rev.hash)
                        .unwrap_or(false)
            })
            .filter_map(|path| {
                let last = path.nodes.last()?;
                Some(Leaf {
                    rev: RevId::new(path.pos + path.nodes.len() as u64 - 1, last.hash.clone()),
                    deleted: last.deleted,
                    status: last.status,
                })
            })
            .max_by(compare_leaves)
            .map(|leaf| leaf.rev)
    }

    /// Of `revs`, those not present in the tree (input order kept).
    pub fn missing_revs(&self, revs: &[RevId]) -> Vec<RevId> {
        revs.iter().filter(|r| !self.contains(r)).cloned().collect()
    }

    /// Visits every node with its generation, depth-first.
    fn traverse<F: FnMut(u64, &RevNode)>(&self, mut visit: F) {
        let mut stack: Vec<(u64, &RevNode)> =
            self.paths.iter().map(|p| (p.pos, &p.root)).collect();
        while let Some((pos, node)) = stack.pop() {
            visit(pos, node);
            for child in &node.children {
                stack.push((pos + 1, child));
            }
        }
    }
}

/// Total order used to pick the winner.
fn compare_leaves(a: &Leaf, b: &Leaf) -> Ordering {
    (!a.deleted)
        .cmp(&!b.deleted)
        .then(a.rev.generation.cmp(&b.rev.generation))
        .then_with(|| a.rev.hash.cmp(&b.rev.hash))
}

/// Child indices leading from `root` to the node `depth` levels below it
/// whose hash is `hash`.
fn route_to(root: &RevNode, depth: u64, hash: &str) -> Option<Vec<usize>> {
    let mut trail: Vec<(&RevNode, usize)> = vec![(root, 0)];
    let mut route = Vec::new();
    while let Some(top) = trail.last_mut() {
        let node = top.0;
        let at_depth = route.len() as u64 == depth;
        if at_depth && node.hash == hash {
            return Some(route);
        }
        if !at_depth && top.1 < node.children.len() {
            let idx = top.1;
            top.1 += 1;
            route.push(idx);
            trail.push((&node.children[idx], 0));
        } else {
            trail.pop();
            route.pop();
        }
    }
    None
}

fn find_node<'a>(root: &'a RevNode, depth: u64, hash: &str) -> Option<&'a RevNode> {
    let mut node = root;
    for idx in route_to(root, depth, hash)? {
        node = node.children.get(idx)?;
    }
    Some(node)
}

fn find_node_mut<'a>(root: &'a mut RevNode, depth: u64, hash: &str) -> Option<&'a mut RevNode> {
    let route = route_to(root, depth, hash)?;
    let mut node = root;
    for idx in route {
        node = node.children.get_mut(idx)?;
    }
    Some(node)
}

// =============================================================================
// Merge Internals
// =============================================================================

/// Unifies `incoming` into `existing`; both roots share an address.
///
/// Breadth-first over matching pairs. Status becomes `Available` if either
/// side has the body; the last new leaf or branch recorded is the outcome.
fn merge_nodes(existing: &mut RevNode, incoming: RevNode) -> Option<MergeConflict> {
    let mut conflicts = None;
    let mut queue = VecDeque::from([(existing, incoming)]);

    while let Some((target, mut source)) = queue.pop_front() {
        if source.status == RevStatus::Available {
            target.status = RevStatus::Available;
        }

        let mut matched = Vec::new();
        for child in std::mem::take(&mut source.children) {
            if target.children.is_empty() {
                conflicts = Some(MergeConflict::NewLeaf);
                target.children.push(child);
            } else if target.children.iter().any(|c| c.hash == child.hash) {
                matched.push(child);
            } else {
                conflicts = Some(MergeConflict::NewBranch);
                let idx = target.children.partition_point(|c| c.hash < child.hash);
                target.children.insert(idx, child);
            }
        }

        for child in target.children.iter_mut() {
            if let Some(i) = matched.iter().position(|m| m.hash == child.hash) {
                queue.push_back((child, matched.swap_remove(i)));
            }
        }
    }
    conflicts
}

/// Merges a branch into a forest.
///
/// When `dont_expand` is false, branches rooted at different generations are
/// aligned by walking the earlier one down to the later one's root.
fn do_merge(tree: Vec<RevPath>, mut path: RevPath, dont_expand: bool) -> (Vec<RevPath>, MergeConflict) {
    if tree.is_empty() {
        return (vec![path], MergeConflict::NewLeaf);
    }

    let mut restree = Vec::with_capacity(tree.len() + 1);
    let mut conflicts: Option<MergeConflict> = None;
    let mut merged = false;
    let mut absorbed = false;

    for mut branch in tree {
        if branch.pos == path.pos && branch.root.hash == path.root.hash {
            let c = merge_nodes(&mut branch.root, path.root.clone());
            conflicts = conflicts.or(c);
            merged = true;
            restree.push(branch);
        } else if dont_expand {
            restree.push(branch);
        } else if branch.pos < path.pos {
            let depth = path.pos - branch.pos;
            if let Some(parent) = find_node_mut(&mut branch.root, depth, &path.root.hash) {
                let c = merge_nodes(parent, path.root.clone());
                conflicts = conflicts.or(c);
                merged = true;
            }
            restree.push(branch);
        } else {
            let depth = branch.pos - path.pos;
            let target = if depth > 0 {
                find_node_mut(&mut path.root, depth, &branch.root.hash)
            } else {
                None
            };
            match target {
                Some(parent) => {
                    let c = merge_nodes(parent, branch.root);
                    conflicts = conflicts.or(c);
                    merged = true;
                    absorbed = true;
                }
                None => restree.push(branch),
            }
        }
    }

    if !merged || absorbed {
        restree.push(path);
    }
    restree.sort_by_key(|p| p.pos);
    (restree, conflicts.unwrap_or(MergeConflict::InternalNode))
}

fn root_to_leaf(paths: &[RevPath]) -> Vec<LeafPath> {
    let mut result = Vec::new();
    let mut stack: Vec<(u64, &RevNode, Vec<RevNode>)> =
        paths.iter().map(|p| (p.pos, &p.root, Vec::new())).collect();

    while let Some((pos, node, mut history)) = stack.pop() {
        history.push(RevNode::new(node.hash.clone(), node.status, node.deleted));
        if node.is_leaf() {
            result.push(LeafPath {
                pos: pos + 1 - history.len() as u64,
                nodes: history,
            });
            continue;
        }
        if let Some((last, rest)) = node.children.split_last() {
            for child in rest {
                stack.push((pos + 1, child, history.clone()));
            }
            stack.push((pos + 1, last, history));
        }
    }
    result.reverse();
    result
}

fn stem(paths: Vec<RevPath>, depth: usize) -> (Vec<RevPath>, Vec<RevId>) {
    let depth = depth.max(1);
    let mut stemmed: BTreeSet<RevId> = BTreeSet::new();
    let mut result: Vec<RevPath> = Vec::new();

    for leaf_path in root_to_leaf(&paths) {
        let num_stemmed = leaf_path.nodes.len().saturating_sub(depth);
        for (i, node) in leaf_path.nodes.iter().take(num_stemmed).enumerate() {
            stemmed.insert(RevId::new(leaf_path.pos + i as u64, node.hash.clone()));
        }
        let nodes: Vec<RevNode> = leaf_path.nodes.into_iter().skip(num_stemmed).collect();
        let Some(branch) = RevPath::linear(leaf_path.pos + num_stemmed as u64, nodes) else {
            continue;
        };
        result = if result.is_empty() {
            vec![branch]
        } else {
            do_merge(result, branch, true).0
        };
    }

    if !stemmed.is_empty() {
        let tree = RevTree { paths: result };
        stemmed.retain(|rev| !tree.contains(rev));
        result = tree.paths;
    }
    (result, stemmed.into_iter().collect())
}

// =============================================================================
// Tests
// =============================================================================
