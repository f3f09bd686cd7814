//! Tree partitioning
//!
//! Splits a tree rooted at the leader into `k` two-level subtrees
//! (root, subleader, leaves) that all share the same root, and rebuilds a
//! subtree around a new subleader when the current one does not answer.

use std::collections::HashSet;
use std::sync::Arc;

use cosi_network::{Roster, Tree};
use tracing::debug;

use crate::error::{ProtocolError, ProtocolResult};

/// Ordered list of subtrees sharing the same root
#[derive(Debug, Clone)]
pub struct ProtocolTree {
    trees: Vec<Arc<Tree>>,
}

impl ProtocolTree {
    /// Split `tree` into `k` subtrees.
    ///
    /// `k` is clamped to the number of non-root nodes. Non-root nodes keep
    /// their tree order; the first `(n - 1) % k` groups get one extra node.
    /// A single-node tree yields one root-only tree.
    pub fn partition(tree: &Tree, k: usize) -> ProtocolResult<Self> {
        if k == 0 {
            return Err(ProtocolError::InvalidSubtree(
                "invalid number of subtrees".to_string(),
            ));
        }

        let roster = tree.roster().clone();
        let root = tree.root();
        let n_nodes = tree.size();

        if n_nodes == 1 {
            let single = Tree::from_edges(roster, root, &[])?;
            return Ok(Self {
                trees: vec![Arc::new(single)],
            });
        }

        let k = k.min(n_nodes - 1);
        let others: Vec<usize> = tree
            .node_indices()
            .into_iter()
            .filter(|&i| i != root)
            .collect();

        let base = others.len() / k;
        let extra = others.len() % k;

        let mut trees = Vec::with_capacity(k);
        let mut offset = 0;
        for group in 0..k {
            let size = base + usize::from(group < extra);
            let mut indices = Vec::with_capacity(size + 1);
            indices.push(root);
            indices.extend_from_slice(&others[offset..offset + size]);
            offset += size;

            trees.push(Arc::new(gen_subtree(&roster, &indices)?));
        }

        debug!(nodes = n_nodes, subtrees = k, "partitioned tree");
        Ok(Self { trees })
    }

    pub fn len(&self) -> usize {
        self.trees.len()
    }

    pub fn is_empty(&self) -> bool {
        self.trees.is_empty()
    }

    pub fn get(&self, position: usize) -> Option<&Arc<Tree>> {
        self.trees.get(position)
    }

    pub fn trees(&self) -> &[Arc<Tree>] {
        &self.trees
    }

    pub fn into_trees(self) -> Vec<Arc<Tree>> {
        self.trees
    }

    /// Replace the subtree at `position` by its regenerated version
    pub fn regenerate(&mut self, position: usize) -> ProtocolResult<Arc<Tree>> {
        let current = self.trees.get(position).ok_or_else(|| {
            ProtocolError::InvalidSubtree(format!("no subtree at position {}", position))
        })?;
        let regenerated = Arc::new(regen_subtree(current)?);
        self.trees[position] = regenerated.clone();
        Ok(regenerated)
    }

    /// Roster indices of the subleaders
    pub fn subleaders(&self) -> Vec<usize> {
        self.trees
            .iter()
            .filter_map(|t| t.children_of(t.root()).first().copied())
            .collect()
    }

    /// Roster indices of the leaves, subtree by subtree
    pub fn leaves(&self) -> Vec<usize> {
        self.trees
            .iter()
            .flat_map(|t| {
                t.children_of(t.root())
                    .iter()
                    .flat_map(|&s| t.children_of(s).to_vec())
                    .collect::<Vec<_>>()
            })
            .collect()
    }
}

/// Build `root -> subleader -> leaves` from `[root, subleader, leaf...]`
pub fn gen_subtree(roster: &Arc<Roster>, indices: &[usize]) -> ProtocolResult<Tree> {
    if indices.len() < 2 {
        return Err(ProtocolError::InvalidSubtree(
            "a subtree needs a root and a subleader".to_string(),
        ));
    }
    if let Some(&bad) = indices.iter().find(|&&i| i >= roster.len()) {
        return Err(ProtocolError::InvalidSubtree(format!(
            "index {} out of range for roster of {}",
            bad,
            roster.len()
        )));
    }

    let (root, subleader) = (indices[0], indices[1]);
    if root == subleader {
        return Err(ProtocolError::InvalidSubtree(
            "subleader cannot be the root".to_string(),
        ));
    }

    let mut seen = HashSet::with_capacity(indices.len());
    if !indices.iter().all(|i| seen.insert(*i)) {
        return Err(ProtocolError::InvalidSubtree(
            "duplicate node in subtree".to_string(),
        ));
    }

    let mut edges = Vec::with_capacity(indices.len() - 1);
    edges.push((root, subleader));
    edges.extend(indices[2..].iter().map(|&leaf| (subleader, leaf)));

    Ok(Tree::from_edges(roster.clone(), root, &edges)?)
}

/// Rotate a subtree: the first leaf becomes subleader, the unresponsive
/// subleader moves to the end of the leaves.
///
/// Candidates are only ever tried forward in roster order, so once the next
/// candidate has a lower index than the failing subleader every node has
/// been tried.
pub fn regen_subtree(tree: &Tree) -> ProtocolResult<Tree> {
    let root = tree.root();
    let subleader = *tree
        .children_of(root)
        .first()
        .ok_or(ProtocolError::SubleadersExhausted)?;

    let mut nodes = vec![root];
    nodes.extend_from_slice(tree.children_of(subleader));

    if nodes.len() < 2 || subleader > nodes[1] {
        return Err(ProtocolError::SubleadersExhausted);
    }

    nodes.push(subleader);
    debug!(old = subleader, new = nodes[1], "regenerating subtree");
    gen_subtree(tree.roster(), &nodes)
}
