//! Physical and logical topology model
//!
//! A node's position in the cluster is a mixed-radix coordinate vector over
//! the physical dimensions, dimension 0 varying fastest. For every
//! collective operation the map holds one logical topology per dimension;
//! the logical view of a dimension is the group of nodes sharing all other
//! coordinates.

use crate::error::{SimError, SimResult};
use crate::types::{AlgorithmKind, CollectiveKind, DimId, GroupKind, NodeId};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Decompose a node id into per-dimension coordinates.
pub fn coordinates(node: NodeId, dims: &[usize]) -> Vec<usize> {
    let mut rest = node;
    dims.iter()
        .map(|&d| {
            let c = rest % d;
            rest /= d;
            c
        })
        .collect()
}

/// Recompose a node id from coordinates.
pub fn node_at(coords: &[usize], dims: &[usize]) -> NodeId {
    let mut id = 0;
    let mut stride = 1;
    for (c, d) in coords.iter().zip(dims) {
        id += c * stride;
        stride *= d;
    }
    id
}

/// Ordered members of one dimension's group as seen from `node`.
fn dim_members(node: NodeId, dims: &[usize], dim: DimId) -> Vec<NodeId> {
    let mut coords = coordinates(node, dims);
    (0..dims[dim])
        .map(|c| {
            coords[dim] = c;
            node_at(&coords, dims)
        })
        .collect()
}

/// Ring view of one dimension.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RingTopology {
    pub dim: DimId,
    pub members: Vec<NodeId>,
    pub index: usize,
}

impl RingTopology {
    pub fn size(&self) -> usize {
        self.members.len()
    }

    pub fn next(&self) -> NodeId {
        self.members[(self.index + 1) % self.members.len()]
    }

    pub fn prev(&self) -> NodeId {
        let n = self.members.len();
        self.members[(self.index + n - 1) % n]
    }
}

/// One binary tree over a dimension's members, heap layout over positions.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BinaryTree {
    pub dim: DimId,
    pub members: Vec<NodeId>,
    /// This node's position in `members`.
    pub index: usize,
    pub parent: Option<NodeId>,
    pub children: Vec<NodeId>,
}

impl BinaryTree {
    /// Build the tree over `members`; `index` is the caller's position.
    pub fn build(dim: DimId, members: Vec<NodeId>, index: usize) -> Self {
        let n = members.len();
        let parent = if index == 0 {
            None
        } else {
            Some(members[(index - 1) / 2])
        };
        let mut children = Vec::new();
        for child in [2 * index + 1, 2 * index + 2] {
            if child < n {
                children.push(members[child]);
            }
        }
        Self {
            dim,
            members,
            index,
            parent,
            children,
        }
    }

    pub fn is_root(&self) -> bool {
        self.parent.is_none()
    }
}

/// Two overlaid binary trees providing bandwidth parity; the mirror tree is
/// built over the reversed member order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DoubleBinaryTree {
    pub dim: DimId,
    pub primary: BinaryTree,
    pub mirror: BinaryTree,
}

impl DoubleBinaryTree {
    pub fn build(dim: DimId, members: Vec<NodeId>, index: usize) -> Self {
        let mut reversed = members.clone();
        reversed.reverse();
        let mirror_index = members.len() - 1 - index;
        Self {
            dim,
            primary: BinaryTree::build(dim, members, index),
            mirror: BinaryTree::build(dim, reversed, mirror_index),
        }
    }
}

/// Fully connected view of one dimension.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DirectTopology {
    pub dim: DimId,
    pub members: Vec<NodeId>,
    pub index: usize,
}

/// Logical collective topology of one dimension.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum LogicalTopology {
    Ring(RingTopology),
    Tree(DoubleBinaryTree),
    Direct(DirectTopology),
}

impl LogicalTopology {
    fn build(kind: AlgorithmKind, dim: DimId, members: Vec<NodeId>, index: usize) -> Self {
        match kind {
            AlgorithmKind::DoubleBinaryTree => {
                LogicalTopology::Tree(DoubleBinaryTree::build(dim, members, index))
            }
            AlgorithmKind::Direct | AlgorithmKind::NcclFlowModel => {
                LogicalTopology::Direct(DirectTopology {
                    dim,
                    members,
                    index,
                })
            }
            // Ring also backs halving/doubling, which only needs the
            // ordered member list.
            AlgorithmKind::Ring | AlgorithmKind::HalvingDoubling => {
                LogicalTopology::Ring(RingTopology {
                    dim,
                    members,
                    index,
                })
            }
        }
    }

    pub fn members(&self) -> &[NodeId] {
        match self {
            LogicalTopology::Ring(r) => &r.members,
            LogicalTopology::Tree(t) => &t.primary.members,
            LogicalTopology::Direct(d) => &d.members,
        }
    }

    pub fn size(&self) -> usize {
        self.members().len()
    }
}

/// Per-operation algorithm selection, one entry per dimension. When fewer
/// entries than dimensions are configured, the last entry repeats; a
/// dimension produced by `break_dimension` inherits the entry of the
/// dimension it was split from.
pub type PerOpAlgorithms = HashMap<CollectiveKind, Vec<AlgorithmKind>>;

/// Static description of one node's position in every logical topology.
#[derive(Debug, Clone)]
pub struct TopologyMap {
    node: NodeId,
    dims: Vec<usize>,
    per_op_algos: PerOpAlgorithms,
    per_op: HashMap<CollectiveKind, Vec<LogicalTopology>>,
}

impl TopologyMap {
    pub fn new(node: NodeId, dims: Vec<usize>, per_op_algos: PerOpAlgorithms) -> SimResult<Self> {
        if dims.is_empty() || dims.iter().any(|&d| d == 0) {
            return Err(SimError::config(format!("invalid dimensions {dims:?}")));
        }
        let mut map = Self {
            node,
            dims,
            per_op_algos,
            per_op: HashMap::new(),
        };
        map.regenerate();
        Ok(map)
    }

    pub fn node(&self) -> NodeId {
        self.node
    }

    pub fn dims(&self) -> &[usize] {
        &self.dims
    }

    pub fn num_nodes(&self) -> usize {
        self.dims.iter().product()
    }

    /// Algorithm configured for `op` on `dim`.
    pub fn algorithm(&self, op: CollectiveKind, dim: DimId) -> AlgorithmKind {
        let algos = &self.per_op_algos[&op];
        *algos.get(dim).unwrap_or_else(|| algos.last().unwrap())
    }

    /// Logical topology of `dim` for `op`.
    pub fn logical(&self, op: CollectiveKind, dim: DimId) -> &LogicalTopology {
        &self.per_op[&op][dim]
    }

    /// Ordered members of `dim` as seen from this node.
    pub fn members(&self, dim: DimId) -> Vec<NodeId> {
        dim_members(self.node, &self.dims, dim)
    }

    fn regenerate(&mut self) {
        let node = self.node;
        let dims = self.dims.clone();
        let mut per_op = HashMap::new();
        for (&op, algos) in &self.per_op_algos {
            let list = (0..dims.len())
                .map(|d| {
                    let kind = *algos.get(d).unwrap_or_else(|| algos.last().unwrap());
                    let members = dim_members(node, &dims, d);
                    let index = coordinates(node, &dims)[d];
                    LogicalTopology::build(kind, d, members, index)
                })
                .collect();
            per_op.insert(op, list);
        }
        self.per_op = per_op;
    }

    /// Split one dimension so that the prefix product of the leading
    /// dimensions equals `target`. Finds the dimension `k` where the prefix
    /// product first exceeds `target` and splits it into `(a, b)` with
    /// `a = target / prefix_before_k`. Regenerates every logical topology.
    ///
    /// One-shot operation during initialization; a no-op when a prefix
    /// already matches. Returns the split `(dim, a)` so callers can mirror
    /// it into the network description.
    pub fn break_dimension(&mut self, target: usize) -> SimResult<Option<(usize, usize)>> {
        if target <= 1 {
            return Ok(None);
        }
        let total = self.num_nodes();
        if target > total || total % target != 0 {
            return Err(SimError::config(format!(
                "group size {target} does not divide cluster size {total}"
            )));
        }

        let mut prefix = 1usize;
        for k in 0..self.dims.len() {
            let next = prefix * self.dims[k];
            if next == target {
                // Already aligned to a dimension boundary.
                return Ok(None);
            }
            if next > target {
                if target % prefix != 0 {
                    return Err(SimError::config(format!(
                        "group size {target} does not align with dims {:?}",
                        self.dims
                    )));
                }
                let a = target / prefix;
                if self.dims[k] % a != 0 {
                    return Err(SimError::config(format!(
                        "cannot split dimension {k} ({}) by {a}",
                        self.dims[k]
                    )));
                }
                let b = self.dims[k] / a;
                self.dims.splice(k..=k, [a, b]);
                // The split dimension's algorithm entry covers both halves.
                for algos in self.per_op_algos.values_mut() {
                    if k < algos.len() {
                        let kind = algos[k];
                        algos.insert(k, kind);
                    }
                }
                self.regenerate();
                return Ok(Some((k, a)));
            }
            prefix = next;
        }
        Ok(None)
    }
}

/// Dimension masks of each parallelism group, derived from the group sizes
/// in the workload header. Dimensions are ordered innermost first: tensor
/// dims, then expert dims, then the remaining data dims, with pipeline dims
/// outermost.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroupMap {
    masks: HashMap<GroupKind, Vec<bool>>,
}

impl GroupMap {
    pub fn derive(dims: &[usize], tp: usize, ep: usize, pp: usize) -> SimResult<Self> {
        let total: usize = dims.iter().product();
        let dp_total = total / tp.max(1) / pp.max(1);
        if ep.max(1) > dp_total || dp_total % ep.max(1) != 0 {
            return Err(SimError::config(format!(
                "expert group {ep} does not divide data group {dp_total}"
            )));
        }

        let boundary = |group: usize| -> SimResult<usize> {
            let mut prefix = 1usize;
            let mut idx = 0;
            while prefix < group {
                if idx >= dims.len() {
                    return Err(SimError::config(format!(
                        "group size {group} does not align with dims {dims:?}"
                    )));
                }
                prefix *= dims[idx];
                idx += 1;
            }
            if prefix != group {
                return Err(SimError::config(format!(
                    "group size {group} does not align with dims {dims:?}"
                )));
            }
            Ok(idx)
        };

        let t = boundary(tp.max(1))?;
        let e = boundary(tp.max(1) * ep.max(1))?;
        let p = boundary(total / pp.max(1))?;
        if e > p {
            return Err(SimError::config(
                "expert dimensions overlap pipeline dimensions".to_string(),
            ));
        }

        let mask = |from: usize, to: usize| -> Vec<bool> {
            (0..dims.len()).map(|d| d >= from && d < to).collect()
        };

        let mut masks = HashMap::new();
        masks.insert(GroupKind::Tp, mask(0, t));
        masks.insert(GroupKind::Ep, mask(t, e));
        masks.insert(GroupKind::Dp, mask(t, p));
        masks.insert(GroupKind::DpEp, mask(e, p));
        masks.insert(GroupKind::Pp, mask(p, dims.len()));
        Ok(Self { masks })
    }

    pub fn mask(&self, group: GroupKind) -> &[bool] {
        &self.masks[&group]
    }
}
