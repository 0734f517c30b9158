//! Hierarchical sparse data-structure tree (SNode tree)
//!
//! An SNode describes how one level of the sparse structure stores its
//! children. The tree is read-only input for code generation: the struct
//! compiler materializes LLVM types and per-node runtime accessors from it,
//! and the statement visitor addresses cells through those accessors.
//!
//! Invariants: the root has no parent; `place` nodes are leaves; only
//! allocation-typed nodes (`dense`, `dynamic`) have array-shaped storage.

use serde::{Deserialize, Serialize};

use crate::types::DataType;

/// Identifier of an SNode within its tree.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SNodeId(pub u32);

impl SNodeId {
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

/// How a level stores its children.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SNodeType {
    Root,
    Dense,
    Place,
    Dynamic,
}

impl SNodeType {
    pub fn name(self) -> &'static str {
        match self {
            SNodeType::Root => "root",
            SNodeType::Dense => "dense",
            SNodeType::Place => "place",
            SNodeType::Dynamic => "dynamic",
        }
    }

    /// Type name used to select the generic runtime accessor family,
    /// e.g. `Dense_lookup_element`.
    pub fn runtime_name(self) -> &'static str {
        match self {
            SNodeType::Root => "Root",
            SNodeType::Dense => "Dense",
            SNodeType::Place => "Place",
            SNodeType::Dynamic => "Dynamic",
        }
    }
}

/// One node of the sparse tree.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SNode {
    pub id: SNodeId,
    pub ty: SNodeType,
    pub parent: Option<SNodeId>,
    pub children: Vec<SNodeId>,
    /// Cell-index bits per coordinate axis, in axis order. The linearized
    /// cell index packs these high-to-low; `refine_coordinates` unpacks
    /// them again.
    pub index_bits: Vec<u32>,
    pub bitmasked: bool,
    pub morton: bool,
    /// Scalar type stored here; `place` nodes only.
    pub dtype: Option<DataType>,
}

impl SNode {
    /// log2 of the allocation capacity.
    pub fn total_num_bits(&self) -> u32 {
        self.index_bits.iter().sum()
    }

    pub fn max_num_elements(&self) -> i32 {
        1 << self.total_num_bits()
    }

    /// Unique name used for generated types and per-node functions.
    pub fn node_type_name(&self) -> String {
        format!("S{}{}", self.id.0, self.ty.name())
    }

    pub fn get_ch_from_parent_func_name(&self) -> String {
        format!("{}_get_ch_from_parent", self.node_type_name())
    }

    pub fn refine_coordinates_func_name(&self) -> String {
        format!("{}_refine_coordinates", self.node_type_name())
    }

    /// Whether a failed non-activating lookup must fall back to an ambient
    /// element.
    pub fn has_ambient(&self) -> bool {
        self.ty == SNodeType::Dynamic
    }

    pub fn is_place(&self) -> bool {
        self.ty == SNodeType::Place
    }
}

/// The whole tree, indexed by [`SNodeId`].
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SNodeTree {
    nodes: Vec<SNode>,
}

impl SNodeTree {
    /// Create a tree containing only the root.
    pub fn new() -> Self {
        let mut tree = Self { nodes: Vec::new() };
        tree.push(SNodeType::Root, None, Vec::new(), None);
        tree
    }

    pub fn root_id(&self) -> SNodeId {
        SNodeId(0)
    }

    pub fn node(&self, id: SNodeId) -> &SNode {
        &self.nodes[id.index()]
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn nodes(&self) -> impl Iterator<Item = &SNode> {
        self.nodes.iter()
    }

    /// Add a `dense` level under `parent` with the given per-axis bits.
    pub fn dense(&mut self, parent: SNodeId, index_bits: &[u32]) -> SNodeId {
        self.push(SNodeType::Dense, Some(parent), index_bits.to_vec(), None)
    }

    /// Add a scalar leaf under `parent`.
    pub fn place(&mut self, parent: SNodeId, dtype: DataType) -> SNodeId {
        self.push(SNodeType::Place, Some(parent), Vec::new(), Some(dtype))
    }

    /// Add a `dynamic` level under `parent`. Recognized by the data model but
    /// not lowered by this codegen core.
    pub fn dynamic(&mut self, parent: SNodeId, index_bits: &[u32]) -> SNodeId {
        self.push(SNodeType::Dynamic, Some(parent), index_bits.to_vec(), None)
    }

    /// Position of `child` among `parent`'s children.
    pub fn child_position(&self, parent: SNodeId, child: SNodeId) -> Option<u32> {
        self.node(parent)
            .children
            .iter()
            .position(|&c| c == child)
            .map(|p| p as u32)
    }

    fn push(
        &mut self,
        ty: SNodeType,
        parent: Option<SNodeId>,
        index_bits: Vec<u32>,
        dtype: Option<DataType>,
    ) -> SNodeId {
        let id = SNodeId(self.nodes.len() as u32);
        self.nodes.push(SNode {
            id,
            ty,
            parent,
            children: Vec::new(),
            index_bits,
            bitmasked: false,
            morton: false,
            dtype,
        });
        if let Some(parent) = parent {
            self.nodes[parent.index()].children.push(id);
        }
        id
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tree_construction() {
        let mut tree = SNodeTree::new();
        let root = tree.root_id();
        let dense = tree.dense(root, &[4]);
        let place = tree.place(dense, DataType::F32);

        assert_eq!(tree.len(), 3);
        assert_eq!(tree.node(root).parent, None);
        assert_eq!(tree.node(dense).parent, Some(root));
        assert_eq!(tree.node(place).parent, Some(dense));
        assert_eq!(tree.child_position(root, dense), Some(0));
        assert_eq!(tree.child_position(dense, place), Some(0));
    }

    #[test]
    fn capacity_and_names() {
        let mut tree = SNodeTree::new();
        let root = tree.root_id();
        let dense = tree.dense(root, &[3, 2]);

        let node = tree.node(dense);
        assert_eq!(node.total_num_bits(), 5);
        assert_eq!(node.max_num_elements(), 32);
        assert_eq!(node.node_type_name(), "S1dense");
        assert_eq!(node.get_ch_from_parent_func_name(), "S1dense_get_ch_from_parent");
        assert_eq!(
            node.refine_coordinates_func_name(),
            "S1dense_refine_coordinates"
        );
        assert_eq!(tree.node(root).max_num_elements(), 1);
    }

    #[test]
    fn place_nodes_are_leaves() {
        let mut tree = SNodeTree::new();
        let root = tree.root_id();
        let place = tree.place(root, DataType::I32);
        let node = tree.node(place);
        assert!(node.is_place());
        assert!(node.children.is_empty());
        assert_eq!(node.dtype, Some(DataType::I32));
    }
}
