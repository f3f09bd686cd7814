//! Communication trees over a roster
//!
//! Trees are arenas of nodes addressed by roster index. A tree value is never
//! mutated after construction; repairing a tree means building a new one.

use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::Utc;
use cosi_signer::BlsPublicKey;

use crate::error::{NetworkError, NetworkResult};
use crate::roster::Roster;

/// Tree identifier
pub type TreeId = String;

/// Node of a tree, labelled by its roster index
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TreeNode {
    pub roster_index: usize,
    pub parent: Option<usize>,
    pub children: Vec<usize>,
}

/// Rooted tree over roster indices
#[derive(Debug, Clone)]
pub struct Tree {
    id: TreeId,
    roster: Arc<Roster>,
    root: usize,
    /// Nodes in insertion order, root first
    nodes: Vec<TreeNode>,
}

impl Tree {
    /// Root with every other roster member as a direct child
    pub fn star(roster: Arc<Roster>, root: usize) -> NetworkResult<Self> {
        let edges: Vec<(usize, usize)> = (0..roster.len())
            .filter(|&i| i != root)
            .map(|i| (root, i))
            .collect();
        Self::from_edges(roster, root, &edges)
    }

    /// Build a tree from `(parent, child)` edges. Parents must appear in the
    /// tree before their children.
    pub fn from_edges(
        roster: Arc<Roster>,
        root: usize,
        edges: &[(usize, usize)],
    ) -> NetworkResult<Self> {
        let check = |index: usize| -> NetworkResult<()> {
            if index >= roster.len() {
                return Err(NetworkError::InvalidTree(format!(
                    "index {} out of range for roster of {}",
                    index,
                    roster.len()
                )));
            }
            Ok(())
        };

        check(root)?;
        let mut tree = Self {
            id: generate_tree_id(),
            roster: roster.clone(),
            root,
            nodes: vec![TreeNode {
                roster_index: root,
                parent: None,
                children: Vec::new(),
            }],
        };

        let mut seen: HashSet<usize> = HashSet::from([root]);
        for &(parent, child) in edges {
            check(child)?;
            if !seen.insert(child) {
                return Err(NetworkError::InvalidTree(format!(
                    "index {} appears twice",
                    child
                )));
            }
            let position = tree.position(parent).ok_or_else(|| {
                NetworkError::InvalidTree(format!("parent {} not in tree", parent))
            })?;
            tree.nodes[position].children.push(child);
            tree.nodes.push(TreeNode {
                roster_index: child,
                parent: Some(parent),
                children: Vec::new(),
            });
        }

        Ok(tree)
    }

    fn position(&self, index: usize) -> Option<usize> {
        self.nodes.iter().position(|n| n.roster_index == index)
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn roster(&self) -> &Arc<Roster> {
        &self.roster
    }

    /// Roster index of the root
    pub fn root(&self) -> usize {
        self.root
    }

    /// Number of nodes in the tree
    pub fn size(&self) -> usize {
        self.nodes.len()
    }

    pub fn contains(&self, index: usize) -> bool {
        self.position(index).is_some()
    }

    pub fn node(&self, index: usize) -> Option<&TreeNode> {
        self.position(index).map(|p| &self.nodes[p])
    }

    pub fn parent_of(&self, index: usize) -> Option<usize> {
        self.node(index).and_then(|n| n.parent)
    }

    pub fn children_of(&self, index: usize) -> &[usize] {
        self.node(index).map(|n| n.children.as_slice()).unwrap_or(&[])
    }

    pub fn is_root(&self, index: usize) -> bool {
        self.root == index
    }

    pub fn is_leaf(&self, index: usize) -> bool {
        self.node(index).map(|n| n.children.is_empty()).unwrap_or(false)
    }

    /// Roster indices of all nodes, root first
    pub fn node_indices(&self) -> Vec<usize> {
        self.nodes.iter().map(|n| n.roster_index).collect()
    }

    /// Length of the longest root-to-leaf path in edges
    pub fn depth(&self) -> usize {
        self.nodes
            .iter()
            .map(|n| {
                let mut depth = 0;
                let mut current = n.parent;
                while let Some(p) = current {
                    depth += 1;
                    current = self.parent_of(p);
                }
                depth
            })
            .max()
            .unwrap_or(0)
    }

    /// Public keys of the whole roster, in roster order
    pub fn publics(&self) -> Vec<BlsPublicKey> {
        self.roster.publics()
    }
}

fn generate_tree_id() -> TreeId {
    static COUNTER: AtomicU64 = AtomicU64::new(0);

    let seq = COUNTER.fetch_add(1, Ordering::SeqCst);
    let timestamp = Utc::now().timestamp_micros();
    format!("tree_{:016x}_{:08x}", timestamp, seq)
}
