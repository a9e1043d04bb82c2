//! Tree vertices with lazy-free cost propagation
//!
//! A vertex owns its manifold state (allocated and freed through the atlas)
//! and sits in a tree held together by strong parent references and weak
//! child back-references. Cost-to-come and depth are kept eagerly consistent
//! through the cost cascade: every mutation that touches a vertex's chain
//! routes through `update_cost_and_depth`, which walks the descendant
//! subtree depth-first so a child is never observed before its parent.

use std::cell::RefCell;
use std::rc::{Rc, Weak};

use crate::common::types::{StateId, VertexId};
use crate::manifold::atlas::AtlasStateSpace;
use crate::planning::cost::{Cost, CostHelper};
use crate::planning::id_generator::IdGenerator;

/// Shared-ownership handle to a vertex
pub type VertexPtr = Rc<RefCell<Vertex>>;

const EXPIRED_WHILE_COLLECTING: &str =
    "A child back-reference was found to have expired while collecting the children of a vertex.";
const EXPIRED_WHILE_REMOVING: &str =
    "A child back-reference was found to have expired while removing a child from a vertex.";
const EXPIRED_WHILE_CASCADING: &str =
    "A child back-reference was found to have expired while updating descendant costs.";

/// A search-tree vertex of the batch-informed planner
pub struct Vertex {
    id: VertexId,
    atlas: Rc<AtlasStateSpace>,
    cost_helper: Rc<dyn CostHelper>,
    state: StateId,
    is_root: bool,
    parent: Option<VertexPtr>,
    children: Vec<Weak<RefCell<Vertex>>>,
    edge_cost: Cost,
    cost: Cost,
    depth: usize,
    is_new: bool,
    expanded_to_samples: bool,
    expanded_to_vertices: bool,
    pruned: bool,
}

impl Vertex {
    /// Create a vertex with a fresh state allocated through the atlas. A
    /// root vertex starts at the identity cost; all others start
    /// disconnected at the infinite cost.
    pub fn new(
        atlas: Rc<AtlasStateSpace>,
        cost_helper: Rc<dyn CostHelper>,
        ids: &IdGenerator,
        root: bool,
    ) -> VertexPtr {
        let state = atlas.alloc_state();
        let cost = if root {
            cost_helper.identity_cost()
        } else {
            cost_helper.infinite_cost()
        };
        let edge_cost = cost_helper.infinite_cost();
        Rc::new(RefCell::new(Vertex {
            id: ids.next_id(),
            atlas,
            cost_helper,
            state,
            is_root: root,
            parent: None,
            children: Vec::new(),
            edge_cost,
            cost,
            depth: 0,
            is_new: true,
            expanded_to_samples: false,
            expanded_to_vertices: false,
            pruned: false,
        }))
    }

    fn assert_not_pruned(&self) {
        if self.pruned {
            panic!("Attempting to access a pruned vertex.");
        }
    }

    pub fn id(&self) -> VertexId {
        self.assert_not_pruned();
        self.id
    }

    /// The manifold state owned by this vertex
    pub fn state(&self) -> StateId {
        self.assert_not_pruned();
        self.state
    }

    pub fn is_root(&self) -> bool {
        self.assert_not_pruned();
        self.is_root
    }

    pub fn has_parent(&self) -> bool {
        self.assert_not_pruned();
        self.parent.is_some()
    }

    pub fn is_in_tree(&self) -> bool {
        self.assert_not_pruned();
        self.is_root || self.parent.is_some()
    }

    pub fn depth(&self) -> usize {
        self.assert_not_pruned();
        if !self.is_root && self.parent.is_none() {
            panic!("Attempting to get the depth of a vertex that does not have a parent yet is not root.");
        }
        self.depth
    }

    pub fn parent(&self) -> VertexPtr {
        self.assert_not_pruned();
        match &self.parent {
            Some(parent) => Rc::clone(parent),
            None if self.is_root => {
                panic!("Attempting to access the parent of the root vertex.")
            }
            None => panic!("Attempting to access the parent of a vertex that does not have one."),
        }
    }

    /// Attach this vertex to a parent. Requires that the vertex has no
    /// parent and is not root.
    pub fn add_parent(&mut self, new_parent: &VertexPtr, edge_cost: Cost, cascade: bool) {
        self.assert_not_pruned();
        if self.parent.is_some() {
            panic!("Attempting to add a parent to a vertex that already has one.");
        }
        if self.is_root {
            panic!("Attempting to add a parent to the root vertex, which cannot have a parent.");
        }
        self.parent = Some(Rc::clone(new_parent));
        self.edge_cost = edge_cost;
        self.update_cost_and_depth(cascade);
    }

    /// Detach this vertex from its parent, making it disconnected (infinite
    /// cost). With `cascade`, descendant costs also become infinite.
    pub fn remove_parent(&mut self, cascade: bool) {
        self.assert_not_pruned();
        if self.is_root {
            panic!("Attempting to remove the parent of the root vertex, which cannot have a parent.");
        }
        if self.parent.is_none() {
            panic!("Attempting to remove the parent of a vertex that does not have a parent.");
        }
        self.parent = None;
        self.update_cost_and_depth(cascade);
    }

    pub fn has_children(&self) -> bool {
        self.assert_not_pruned();
        !self.children.is_empty()
    }

    /// Strong handles to all children. An expired back-reference is a
    /// programming error: a dying child must have de-registered itself.
    pub fn children(&self) -> Vec<VertexPtr> {
        self.assert_not_pruned();
        self.children
            .iter()
            .map(|w| w.upgrade().expect(EXPIRED_WHILE_COLLECTING))
            .collect()
    }

    /// Record a child back-reference. With `cascade`, the child's cost and
    /// depth are refreshed from this vertex (the child's incoming edge must
    /// come from this vertex for the cascade to be meaningful).
    pub fn add_child(&mut self, child: &VertexPtr, cascade: bool) {
        self.assert_not_pruned();
        self.children.push(Rc::downgrade(child));
        if cascade {
            let from_parent = (self.cost, self.depth);
            child
                .borrow_mut()
                .update_with_fallback(Some(from_parent), true);
        }
    }

    /// Remove a child by id with a swap-and-pop. Not finding the child is a
    /// programming error.
    pub fn remove_child(&mut self, child: &VertexPtr, cascade: bool) {
        self.assert_not_pruned();
        let child_id = child.borrow().id;
        let position = self
            .children
            .iter()
            .position(|w| w.upgrade().expect(EXPIRED_WHILE_REMOVING).borrow().id == child_id);
        let Some(position) = position else {
            panic!(
                "Attempting to remove a child vertex not present in the parent's list of children."
            );
        };
        self.children.swap_remove(position);
        if cascade {
            let from_parent = (self.cost, self.depth);
            child
                .borrow_mut()
                .update_with_fallback(Some(from_parent), true);
        }
    }

    pub fn cost(&self) -> Cost {
        self.assert_not_pruned();
        self.cost
    }

    /// Cost of the incoming edge; meaningful only with a parent
    pub fn edge_in_cost(&self) -> Cost {
        self.assert_not_pruned();
        if self.parent.is_none() {
            panic!("Attempting to access the incoming-edge cost of a vertex without a parent.");
        }
        self.edge_cost
    }

    /// The single canonical cost propagator; all mutators route through it.
    ///
    /// Root vertices take the identity cost and depth 0; disconnected
    /// vertices take the infinite cost; otherwise the cost is
    /// combine(parent cost, edge cost) and the depth is parent depth + 1.
    /// With `cascade`, the descendant subtree is updated depth-first.
    pub fn update_cost_and_depth(&mut self, cascade: bool) {
        self.assert_not_pruned();
        self.update_with_fallback(None, cascade);
    }

    fn update_with_fallback(&mut self, parent_values: Option<(Cost, usize)>, cascade: bool) {
        if self.is_root {
            self.cost = self.cost_helper.identity_cost();
            self.depth = 0;
        } else if self.parent.is_none() {
            self.cost = self.cost_helper.infinite_cost();
            self.depth = 0;
        } else {
            let parent = Rc::clone(self.parent.as_ref().unwrap());
            // The parent cell is unborrowable exactly when this update was
            // cascaded from the parent itself, which then supplies its
            // freshly computed values.
            let (parent_cost, parent_depth) = match parent.try_borrow() {
                Ok(p) => (p.cost, p.depth),
                Err(_) => parent_values
                    .expect("Re-entrant cost update without the parent's values."),
            };
            self.cost = self.cost_helper.combine_costs(parent_cost, self.edge_cost);
            self.depth = parent_depth + 1;
        }

        if cascade {
            let own = (self.cost, self.depth);
            for weak in &self.children {
                let child = weak.upgrade().expect(EXPIRED_WHILE_CASCADING);
                child.borrow_mut().update_with_fallback(Some(own), true);
            }
        }
    }

    pub fn is_new(&self) -> bool {
        self.assert_not_pruned();
        self.is_new
    }

    pub fn mark_new(&mut self) {
        self.assert_not_pruned();
        self.is_new = true;
    }

    pub fn mark_old(&mut self) {
        self.assert_not_pruned();
        self.is_new = false;
    }

    pub fn has_been_expanded_to_samples(&self) -> bool {
        self.assert_not_pruned();
        self.expanded_to_samples
    }

    pub fn mark_expanded_to_samples(&mut self) {
        self.assert_not_pruned();
        self.expanded_to_samples = true;
    }

    pub fn mark_unexpanded_to_samples(&mut self) {
        self.assert_not_pruned();
        self.expanded_to_samples = false;
    }

    pub fn has_been_expanded_to_vertices(&self) -> bool {
        self.assert_not_pruned();
        self.expanded_to_vertices
    }

    pub fn mark_expanded_to_vertices(&mut self) {
        self.assert_not_pruned();
        self.expanded_to_vertices = true;
    }

    pub fn mark_unexpanded_to_vertices(&mut self) {
        self.assert_not_pruned();
        self.expanded_to_vertices = false;
    }

    pub fn is_pruned(&self) -> bool {
        self.pruned
    }

    /// Make the vertex inert: every operation other than `is_pruned` and
    /// `mark_unpruned` becomes a programming error.
    pub fn mark_pruned(&mut self) {
        self.assert_not_pruned();
        self.pruned = true;
    }

    pub fn mark_unpruned(&mut self) {
        self.pruned = false;
    }

    /// Quietly drop a child entry during the child's destruction
    fn scrub_child(&mut self, id: VertexId) {
        self.children
            .retain(|w| w.upgrade().map_or(false, |c| c.borrow().id != id));
    }
}

impl Drop for Vertex {
    fn drop(&mut self) {
        // De-register from the parent so its child list never holds an
        // expired reference; skipped when the parent is mid-mutation.
        if let Some(parent) = self.parent.take() {
            if let Ok(mut p) = parent.try_borrow_mut() {
                p.scrub_child(self.id);
            }
        }
        self.atlas.free_state(self.state);
    }
}
