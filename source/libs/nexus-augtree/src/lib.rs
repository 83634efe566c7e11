// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Arena-backed augmented red-black tree (no_std)
//! OWNERS: @kernel-mm-team
//! STATUS: Functional
//! API_STABILITY: Unstable
//! TEST_COVERAGE: Unit tests + property tests (tests/props.rs)
//! PUBLIC API: AugTree<T>, Augment, NodeId
//! INVARIANTS: Keys unique; red-black shape; every node summary equals
//!   `summarize(value, left.summary, right.summary)` after each public call
//!
//! Nodes live in a slab (`Vec<Option<Node>>` plus a free-index stack), so links
//! are indices instead of raw pointers. Summaries are recomputed bottom-up by
//! the tree itself: after every rotation for the two rotated nodes, and along
//! the path to the root after insert, remove and [`AugTree::update`].

#![cfg_attr(not(test), no_std)]
#![forbid(unsafe_code)]

extern crate alloc;

use alloc::vec::Vec;
use core::cmp::Ordering;
use core::fmt;

/// Values stored in an [`AugTree`].
pub trait Augment {
    /// Ordering key; unique within one tree.
    type Key: Ord + Copy;
    /// Per-subtree aggregate maintained by the tree.
    type Summary: Copy;

    /// Returns the ordering key of this value.
    fn key(&self) -> Self::Key;

    /// Computes the summary of the subtree rooted at a node holding `self`.
    fn summarize(&self, left: Option<&Self::Summary>, right: Option<&Self::Summary>)
        -> Self::Summary;
}

/// Stable handle to a node; invalidated when the node is removed.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(u32);

impl NodeId {
    #[inline]
    const fn index(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Color {
    Red,
    Black,
}

struct Node<T: Augment> {
    value: T,
    summary: T::Summary,
    parent: Option<NodeId>,
    left: Option<NodeId>,
    right: Option<NodeId>,
    color: Color,
}

/// Red-black tree keyed by [`Augment::key`] with a maintained subtree summary.
pub struct AugTree<T: Augment> {
    slots: Vec<Option<Node<T>>>,
    free: Vec<u32>,
    root: Option<NodeId>,
    len: usize,
}

impl<T: Augment> Default for AugTree<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Augment> AugTree<T> {
    /// Creates an empty tree.
    pub const fn new() -> Self {
        Self { slots: Vec::new(), free: Vec::new(), root: None, len: 0 }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Root node; `None` for an empty tree.
    pub fn root(&self) -> Option<NodeId> {
        self.root
    }

    pub fn left(&self, id: NodeId) -> Option<NodeId> {
        self.node(id).left
    }

    pub fn right(&self, id: NodeId) -> Option<NodeId> {
        self.node(id).right
    }

    pub fn parent(&self, id: NodeId) -> Option<NodeId> {
        self.node(id).parent
    }

    /// Borrows the value stored at `id`.
    pub fn get(&self, id: NodeId) -> &T {
        &self.node(id).value
    }

    /// Returns the summary of the subtree rooted at `id`.
    pub fn summary(&self, id: NodeId) -> &T::Summary {
        &self.node(id).summary
    }

    /// Returns `true` when `id` refers to a live node.
    pub fn contains_id(&self, id: NodeId) -> bool {
        matches!(self.slots.get(id.index()), Some(Some(_)))
    }

    /// Inserts `value`; gives it back if its key is already present.
    pub fn insert(&mut self, value: T) -> Result<NodeId, T> {
        let key = value.key();
        let mut parent = None;
        let mut go_left = false;
        let mut cursor = self.root;
        while let Some(id) = cursor {
            parent = Some(id);
            match key.cmp(&self.node(id).value.key()) {
                Ordering::Less => {
                    go_left = true;
                    cursor = self.node(id).left;
                }
                Ordering::Greater => {
                    go_left = false;
                    cursor = self.node(id).right;
                }
                Ordering::Equal => return Err(value),
            }
        }

        let summary = value.summarize(None, None);
        let node = Node { value, summary, parent, left: None, right: None, color: Color::Red };
        let id = self.alloc(node);
        match parent {
            None => self.root = Some(id),
            Some(p) if go_left => self.node_mut(p).left = Some(id),
            Some(p) => self.node_mut(p).right = Some(id),
        }
        self.len += 1;
        self.recompute_upward(parent);
        self.insert_fixup(id);
        Ok(id)
    }

    /// Removes the node `id` and returns its value.
    pub fn remove(&mut self, id: NodeId) -> T {
        let (z_left, z_right, z_parent, z_color) = {
            let z = self.node(id);
            (z.left, z.right, z.parent, z.color)
        };

        let mut removed_color = z_color;
        let x;
        let x_parent;
        match (z_left, z_right) {
            (None, _) => {
                x = z_right;
                x_parent = z_parent;
                self.transplant(id, z_right);
            }
            (Some(_), None) => {
                x = z_left;
                x_parent = z_parent;
                self.transplant(id, z_left);
            }
            (Some(zl), Some(zr)) => {
                let y = self.minimum(zr);
                removed_color = self.node(y).color;
                x = self.node(y).right;
                if self.node(y).parent == Some(id) {
                    x_parent = Some(y);
                } else {
                    x_parent = self.node(y).parent;
                    self.transplant(y, x);
                    self.node_mut(y).right = Some(zr);
                    self.node_mut(zr).parent = Some(y);
                }
                self.transplant(id, Some(y));
                self.node_mut(y).left = Some(zl);
                self.node_mut(zl).parent = Some(y);
                self.node_mut(y).color = z_color;
            }
        }

        self.recompute_upward(x_parent);
        if removed_color == Color::Black {
            self.delete_fixup(x, x_parent);
        }

        self.len -= 1;
        self.release(id)
    }

    /// Mutates the value at `id` in place and re-augments its ancestors.
    ///
    /// The closure must not move the key past either neighbour.
    pub fn update<R>(&mut self, id: NodeId, f: impl FnOnce(&mut T) -> R) -> R {
        let out = f(&mut self.node_mut(id).value);
        debug_assert!(self.prev(id).map_or(true, |p| self.get(p).key() < self.get(id).key()));
        debug_assert!(self.next(id).map_or(true, |n| self.get(id).key() < self.get(n).key()));
        self.recompute_upward(Some(id));
        out
    }

    /// Descends using `cmp`, which orders the target relative to the visited value.
    pub fn search(&self, mut cmp: impl FnMut(&T) -> Ordering) -> Option<NodeId> {
        let mut cursor = self.root;
        while let Some(id) = cursor {
            cursor = match cmp(&self.node(id).value) {
                Ordering::Less => self.node(id).left,
                Ordering::Greater => self.node(id).right,
                Ordering::Equal => return Some(id),
            };
        }
        None
    }

    /// Returns the node with the greatest key that is `<= key`.
    pub fn floor(&self, key: T::Key) -> Option<NodeId> {
        let mut best = None;
        let mut cursor = self.root;
        while let Some(id) = cursor {
            match self.node(id).value.key().cmp(&key) {
                Ordering::Greater => cursor = self.node(id).left,
                Ordering::Equal => return Some(id),
                Ordering::Less => {
                    best = Some(id);
                    cursor = self.node(id).right;
                }
            }
        }
        best
    }

    /// Returns the node with the smallest key that is `>= key`.
    pub fn ceil(&self, key: T::Key) -> Option<NodeId> {
        let mut best = None;
        let mut cursor = self.root;
        while let Some(id) = cursor {
            match self.node(id).value.key().cmp(&key) {
                Ordering::Less => cursor = self.node(id).right,
                Ordering::Equal => return Some(id),
                Ordering::Greater => {
                    best = Some(id);
                    cursor = self.node(id).left;
                }
            }
        }
        best
    }

    /// Node with the smallest key.
    pub fn first(&self) -> Option<NodeId> {
        self.root.map(|r| self.minimum(r))
    }

    /// Node with the largest key.
    pub fn last(&self) -> Option<NodeId> {
        self.root.map(|r| self.maximum(r))
    }

    /// In-order successor.
    pub fn next(&self, id: NodeId) -> Option<NodeId> {
        if let Some(r) = self.node(id).right {
            return Some(self.minimum(r));
        }
        let mut child = id;
        let mut parent = self.node(id).parent;
        while let Some(p) = parent {
            if self.node(p).left == Some(child) {
                return Some(p);
            }
            child = p;
            parent = self.node(p).parent;
        }
        None
    }

    /// In-order predecessor.
    pub fn prev(&self, id: NodeId) -> Option<NodeId> {
        if let Some(l) = self.node(id).left {
            return Some(self.maximum(l));
        }
        let mut child = id;
        let mut parent = self.node(id).parent;
        while let Some(p) = parent {
            if self.node(p).right == Some(child) {
                return Some(p);
            }
            child = p;
            parent = self.node(p).parent;
        }
        None
    }

    /// Iterates values in key order.
    pub fn iter(&self) -> Iter<'_, T> {
        Iter { tree: self, next: self.first() }
    }

    /// Node ids in key order; handy when the caller mutates while walking.
    pub fn ids(&self) -> Vec<NodeId> {
        self.iter().map(|(id, _)| id).collect()
    }

    /// Drains every value in key order, leaving the tree empty.
    pub fn drain(&mut self) -> Vec<T> {
        let ids = self.ids();
        let mut slots = core::mem::take(&mut self.slots);
        self.free.clear();
        self.root = None;
        self.len = 0;
        ids.into_iter()
            .filter_map(|id| slots.get_mut(id.index()).and_then(Option::take))
            .map(|node| node.value)
            .collect()
    }

    /// Checks red-black shape, parent links, key order and summaries.
    pub fn verify(&self) -> Result<(), &'static str>
    where
        T::Summary: PartialEq,
    {
        if let Some(root) = self.root {
            if self.node(root).parent.is_some() {
                return Err("root has a parent");
            }
            if self.node(root).color != Color::Black {
                return Err("root is red");
            }
        }
        let mut count = 0;
        self.verify_subtree(self.root, &mut count)?;
        if count != self.len {
            return Err("length mismatch");
        }
        let mut last = None;
        for (_, value) in self.iter() {
            let key = value.key();
            if last.map_or(false, |prev| prev >= key) {
                return Err("keys out of order");
            }
            last = Some(key);
        }
        Ok(())
    }

    fn verify_subtree(&self, id: Option<NodeId>, count: &mut usize) -> Result<usize, &'static str>
    where
        T::Summary: PartialEq,
    {
        let Some(id) = id else {
            return Ok(1);
        };
        *count += 1;
        let node = self.node(id);
        for child in [node.left, node.right].into_iter().flatten() {
            if self.node(child).parent != Some(id) {
                return Err("broken parent link");
            }
            if node.color == Color::Red && self.node(child).color == Color::Red {
                return Err("red node with red child");
            }
        }
        let lh = self.verify_subtree(node.left, count)?;
        let rh = self.verify_subtree(node.right, count)?;
        if lh != rh {
            return Err("black height mismatch");
        }
        let l = node.left.map(|c| self.node(c).summary);
        let r = node.right.map(|c| self.node(c).summary);
        if node.value.summarize(l.as_ref(), r.as_ref()) != node.summary {
            return Err("stale summary");
        }
        Ok(lh + usize::from(node.color == Color::Black))
    }

    fn node(&self, id: NodeId) -> &Node<T> {
        match self.slots.get(id.index()) {
            Some(Some(node)) => node,
            _ => panic!("augtree: stale node id {}", id),
        }
    }

    fn node_mut(&mut self, id: NodeId) -> &mut Node<T> {
        match self.slots.get_mut(id.index()) {
            Some(Some(node)) => node,
            _ => panic!("augtree: stale node id {}", id),
        }
    }

    fn alloc(&mut self, node: Node<T>) -> NodeId {
        if let Some(index) = self.free.pop() {
            self.slots[index as usize] = Some(node);
            NodeId(index)
        } else {
            self.slots.push(Some(node));
            NodeId((self.slots.len() - 1) as u32)
        }
    }

    fn release(&mut self, id: NodeId) -> T {
        match self.slots.get_mut(id.index()).and_then(Option::take) {
            Some(node) => {
                self.free.push(id.0);
                node.value
            }
            None => panic!("augtree: stale node id {}", id),
        }
    }

    fn color(&self, id: Option<NodeId>) -> Color {
        id.map_or(Color::Black, |id| self.node(id).color)
    }

    fn minimum(&self, mut id: NodeId) -> NodeId {
        while let Some(l) = self.node(id).left {
            id = l;
        }
        id
    }

    fn maximum(&self, mut id: NodeId) -> NodeId {
        while let Some(r) = self.node(id).right {
            id = r;
        }
        id
    }

    /// Augment callback: recomputes the summary of `id` from its children.
    fn recompute(&mut self, id: NodeId) {
        let node = self.node(id);
        let left = node.left.map(|c| self.node(c).summary);
        let right = node.right.map(|c| self.node(c).summary);
        let summary = node.value.summarize(left.as_ref(), right.as_ref());
        self.node_mut(id).summary = summary;
    }

    fn recompute_upward(&mut self, mut cursor: Option<NodeId>) {
        while let Some(id) = cursor {
            self.recompute(id);
            cursor = self.node(id).parent;
        }
    }

    fn replace_child(&mut self, parent: Option<NodeId>, old: NodeId, new: Option<NodeId>) {
        match parent {
            None => self.root = new,
            Some(p) => {
                if self.node(p).left == Some(old) {
                    self.node_mut(p).left = new;
                } else {
                    self.node_mut(p).right = new;
                }
            }
        }
    }

    fn transplant(&mut self, old: NodeId, new: Option<NodeId>) {
        let parent = self.node(old).parent;
        self.replace_child(parent, old, new);
        if let Some(n) = new {
            self.node_mut(n).parent = parent;
        }
    }

    fn rotate_left(&mut self, x: NodeId) {
        let Some(y) = self.node(x).right else {
            return;
        };
        let y_left = self.node(y).left;
        self.node_mut(x).right = y_left;
        if let Some(b) = y_left {
            self.node_mut(b).parent = Some(x);
        }
        let parent = self.node(x).parent;
        self.node_mut(y).parent = parent;
        self.replace_child(parent, x, Some(y));
        self.node_mut(y).left = Some(x);
        self.node_mut(x).parent = Some(y);
        self.recompute(x);
        self.recompute(y);
    }

    fn rotate_right(&mut self, x: NodeId) {
        let Some(y) = self.node(x).left else {
            return;
        };
        let y_right = self.node(y).right;
        self.node_mut(x).left = y_right;
        if let Some(b) = y_right {
            self.node_mut(b).parent = Some(x);
        }
        let parent = self.node(x).parent;
        self.node_mut(y).parent = parent;
        self.replace_child(parent, x, Some(y));
        self.node_mut(y).right = Some(x);
        self.node_mut(x).parent = Some(y);
        self.recompute(x);
        self.recompute(y);
    }

    fn insert_fixup(&mut self, mut z: NodeId) {
        while let Some(p) = self.node(z).parent {
            if self.node(p).color != Color::Red {
                break;
            }
            // A red parent is never the root, so the grandparent exists.
            let Some(g) = self.node(p).parent else {
                break;
            };
            if self.node(g).left == Some(p) {
                let uncle = self.node(g).right;
                if self.color(uncle) == Color::Red {
                    if let Some(u) = uncle {
                        self.node_mut(u).color = Color::Black;
                    }
                    self.node_mut(p).color = Color::Black;
                    self.node_mut(g).color = Color::Red;
                    z = g;
                } else {
                    let mut p = p;
                    if self.node(p).right == Some(z) {
                        z = p;
                        self.rotate_left(z);
                        p = match self.node(z).parent {
                            Some(p) => p,
                            None => break,
                        };
                    }
                    self.node_mut(p).color = Color::Black;
                    self.node_mut(g).color = Color::Red;
                    self.rotate_right(g);
                }
            } else {
                let uncle = self.node(g).left;
                if self.color(uncle) == Color::Red {
                    if let Some(u) = uncle {
                        self.node_mut(u).color = Color::Black;
                    }
                    self.node_mut(p).color = Color::Black;
                    self.node_mut(g).color = Color::Red;
                    z = g;
                } else {
                    let mut p = p;
                    if self.node(p).left == Some(z) {
                        z = p;
                        self.rotate_right(z);
                        p = match self.node(z).parent {
                            Some(p) => p,
                            None => break,
                        };
                    }
                    self.node_mut(p).color = Color::Black;
                    self.node_mut(g).color = Color::Red;
                    self.rotate_left(g);
                }
            }
        }
        if let Some(root) = self.root {
            self.node_mut(root).color = Color::Black;
        }
    }

    fn delete_fixup(&mut self, mut x: Option<NodeId>, mut parent: Option<NodeId>) {
        while x != self.root && self.color(x) == Color::Black {
            let Some(p) = parent else {
                break;
            };
            if self.node(p).left == x {
                let Some(mut w) = self.node(p).right else {
                    break;
                };
                if self.node(w).color == Color::Red {
                    self.node_mut(w).color = Color::Black;
                    self.node_mut(p).color = Color::Red;
                    self.rotate_left(p);
                    w = match self.node(p).right {
                        Some(w) => w,
                        None => break,
                    };
                }
                let (wl, wr) = (self.node(w).left, self.node(w).right);
                if self.color(wl) == Color::Black && self.color(wr) == Color::Black {
                    self.node_mut(w).color = Color::Red;
                    x = Some(p);
                    parent = self.node(p).parent;
                } else {
                    if self.color(wr) == Color::Black {
                        if let Some(wl) = wl {
                            self.node_mut(wl).color = Color::Black;
                        }
                        self.node_mut(w).color = Color::Red;
                        self.rotate_right(w);
                        w = match self.node(p).right {
                            Some(w) => w,
                            None => break,
                        };
                    }
                    let parent_color = self.node(p).color;
                    self.node_mut(w).color = parent_color;
                    self.node_mut(p).color = Color::Black;
                    if let Some(wr) = self.node(w).right {
                        self.node_mut(wr).color = Color::Black;
                    }
                    self.rotate_left(p);
                    x = self.root;
                    parent = None;
                }
            } else {
                let Some(mut w) = self.node(p).left else {
                    break;
                };
                if self.node(w).color == Color::Red {
                    self.node_mut(w).color = Color::Black;
                    self.node_mut(p).color = Color::Red;
                    self.rotate_right(p);
                    w = match self.node(p).left {
                        Some(w) => w,
                        None => break,
                    };
                }
                let (wl, wr) = (self.node(w).left, self.node(w).right);
                if self.color(wl) == Color::Black && self.color(wr) == Color::Black {
                    self.node_mut(w).color = Color::Red;
                    x = Some(p);
                    parent = self.node(p).parent;
                } else {
                    if self.color(wl) == Color::Black {
                        if let Some(wr) = wr {
                            self.node_mut(wr).color = Color::Black;
                        }
                        self.node_mut(w).color = Color::Red;
                        self.rotate_left(w);
                        w = match self.node(p).left {
                            Some(w) => w,
                            None => break,
                        };
                    }
                    let parent_color = self.node(p).color;
                    self.node_mut(w).color = parent_color;
                    self.node_mut(p).color = Color::Black;
                    if let Some(wl) = self.node(w).left {
                        self.node_mut(wl).color = Color::Black;
                    }
                    self.rotate_right(p);
                    x = self.root;
                    parent = None;
                }
            }
        }
        if let Some(x) = x {
            self.node_mut(x).color = Color::Black;
        }
    }
}

/// In-order iterator returned by [`AugTree::iter`].
pub struct Iter<'a, T: Augment> {
    tree: &'a AugTree<T>,
    next: Option<NodeId>,
}

impl<'a, T: Augment> Iterator for Iter<'a, T> {
    type Item = (NodeId, &'a T);

    fn next(&mut self) -> Option<Self::Item> {
        let id = self.next?;
        self.next = self.tree.next(id);
        Some((id, self.tree.get(id)))
    }
}
