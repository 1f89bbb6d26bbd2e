//! Intrusive AVL tree keyed by a 64-bit value
//!
//! The scheduler's timer tree orders timers by absolute expiry tick; the
//! clock DPC repeatedly takes the minimum, and timer cancellation removes
//! arbitrary nodes. Duplicate keys are permitted; removal is by node, so
//! no lookup ever has to disambiguate equal keys.
//!
//! The links are embedded in the owning structure; the tree never
//! allocates. Balance factors follow the `height(right) - height(left)`
//! convention.

use core::ptr;

/// Embedded tree links plus the ordering key.
#[repr(C)]
pub struct AvlNode {
    parent: *mut AvlNode,
    left: *mut AvlNode,
    right: *mut AvlNode,
    balance: i8,
    /// Ordering key; for timers, the absolute expiry tick.
    pub key: u64,
}

impl AvlNode {
    pub const fn new() -> Self {
        Self {
            parent: ptr::null_mut(),
            left: ptr::null_mut(),
            right: ptr::null_mut(),
            balance: 0,
            key: 0,
        }
    }

    fn reset(&mut self) {
        self.parent = ptr::null_mut();
        self.left = ptr::null_mut();
        self.right = ptr::null_mut();
        self.balance = 0;
    }

    unsafe fn minimum(mut node: *mut AvlNode) -> *mut AvlNode {
        while !(*node).left.is_null() {
            node = (*node).left;
        }
        node
    }
}

impl Default for AvlNode {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Side {
    Left,
    Right,
}

/// Intrusive AVL tree. Not synchronized; the timer tree is consulted only
/// under the dispatcher lock.
#[repr(C)]
pub struct AvlTree {
    root: *mut AvlNode,
    count: usize,
}

impl AvlTree {
    pub const fn new() -> Self {
        Self {
            root: ptr::null_mut(),
            count: 0,
        }
    }

    pub fn init(&mut self) {
        self.root = ptr::null_mut();
        self.count = 0;
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.root.is_null()
    }

    #[inline]
    pub fn count(&self) -> usize {
        self.count
    }

    /// The node with the smallest key, or null.
    pub fn first(&self) -> *mut AvlNode {
        if self.root.is_null() {
            return ptr::null_mut();
        }
        unsafe { AvlNode::minimum(self.root) }
    }

    /// Insert `node` with its `key` already set.
    ///
    /// # Safety
    /// The node must not currently be in any tree.
    pub unsafe fn insert(&mut self, node: *mut AvlNode) {
        (*node).reset();

        if self.root.is_null() {
            self.root = node;
            self.count = 1;
            return;
        }

        let key = (*node).key;
        let mut cursor = self.root;
        loop {
            if key < (*cursor).key {
                if (*cursor).left.is_null() {
                    (*cursor).left = node;
                    break;
                }
                cursor = (*cursor).left;
            } else {
                if (*cursor).right.is_null() {
                    (*cursor).right = node;
                    break;
                }
                cursor = (*cursor).right;
            }
        }
        (*node).parent = cursor;
        self.count += 1;
        self.retrace_insert(node);
    }

    /// Remove `node` from the tree.
    ///
    /// # Safety
    /// The node must be in this tree.
    pub unsafe fn remove(&mut self, node: *mut AvlNode) {
        let left = (*node).left;
        let right = (*node).right;

        if !left.is_null() && !right.is_null() {
            // Two children: splice the in-order successor into this
            // node's position, then retrace from where the successor
            // was detached.
            let succ = AvlNode::minimum(right);
            let succ_parent = (*succ).parent;
            let succ_right = (*succ).right;

            let (retrace_from, retrace_side);
            if succ_parent == node {
                // Successor is the immediate right child; it keeps its
                // own right subtree and the height loss is on its right.
                retrace_from = succ;
                retrace_side = Side::Right;
            } else {
                (*succ_parent).left = succ_right;
                if !succ_right.is_null() {
                    (*succ_right).parent = succ_parent;
                }
                (*succ).right = right;
                (*right).parent = succ;
                retrace_from = succ_parent;
                retrace_side = Side::Left;
            }

            (*succ).left = left;
            (*left).parent = succ;
            (*succ).balance = (*node).balance;
            (*succ).parent = (*node).parent;
            self.replace_child((*node).parent, node, succ);

            self.retrace_delete(retrace_from, retrace_side);
        } else {
            let child = if left.is_null() { right } else { left };
            let parent = (*node).parent;
            if !child.is_null() {
                (*child).parent = parent;
            }
            if parent.is_null() {
                self.root = child;
            } else {
                let side = if (*parent).left == node {
                    (*parent).left = child;
                    Side::Left
                } else {
                    (*parent).right = child;
                    Side::Right
                };
                self.retrace_delete(parent, side);
            }
        }

        (*node).reset();
        self.count -= 1;
    }

    unsafe fn replace_child(&mut self, parent: *mut AvlNode, old: *mut AvlNode, new: *mut AvlNode) {
        if parent.is_null() {
            self.root = new;
        } else if (*parent).left == old {
            (*parent).left = new;
        } else {
            (*parent).right = new;
        }
    }

    unsafe fn retrace_insert(&mut self, mut node: *mut AvlNode) {
        loop {
            let parent = (*node).parent;
            if parent.is_null() {
                return;
            }
            if (*parent).left == node {
                (*parent).balance -= 1;
                match (*parent).balance {
                    0 => return,
                    -1 => node = parent,
                    _ => {
                        // -2: left-heavy overflow
                        if (*node).balance == -1 {
                            self.rotate_right(parent);
                        } else {
                            self.rotate_left_right(parent);
                        }
                        return;
                    }
                }
            } else {
                (*parent).balance += 1;
                match (*parent).balance {
                    0 => return,
                    1 => node = parent,
                    _ => {
                        // +2: right-heavy overflow
                        if (*node).balance == 1 {
                            self.rotate_left(parent);
                        } else {
                            self.rotate_right_left(parent);
                        }
                        return;
                    }
                }
            }
        }
    }

    /// Retrace after a deletion; `side` names the child subtree of
    /// `parent` whose height shrank by one.
    unsafe fn retrace_delete(&mut self, mut parent: *mut AvlNode, mut side: Side) {
        loop {
            (*parent).balance += if side == Side::Left { 1 } else { -1 };

            let subroot;
            match (*parent).balance {
                1 | -1 => return,
                0 => subroot = parent,
                2 => {
                    let right = (*parent).right;
                    let rb = (*right).balance;
                    if rb >= 0 {
                        self.rotate_left(parent);
                        if rb == 0 {
                            return;
                        }
                        subroot = right;
                    } else {
                        let z = (*right).left;
                        self.rotate_right_left(parent);
                        subroot = z;
                    }
                }
                _ => {
                    // -2
                    let left = (*parent).left;
                    let lb = (*left).balance;
                    if lb <= 0 {
                        self.rotate_right(parent);
                        if lb == 0 {
                            return;
                        }
                        subroot = left;
                    } else {
                        let z = (*left).right;
                        self.rotate_left_right(parent);
                        subroot = z;
                    }
                }
            }

            let grandparent = (*subroot).parent;
            if grandparent.is_null() {
                return;
            }
            side = if (*grandparent).left == subroot {
                Side::Left
            } else {
                Side::Right
            };
            parent = grandparent;
        }
    }

    unsafe fn rotate_left(&mut self, x: *mut AvlNode) {
        let y = (*x).right;
        let parent = (*x).parent;

        (*x).right = (*y).left;
        if !(*y).left.is_null() {
            (*(*y).left).parent = x;
        }
        (*y).left = x;
        (*y).parent = parent;
        (*x).parent = y;
        self.replace_child(parent, x, y);

        if (*y).balance == 0 {
            // Only possible during deletion retrace.
            (*x).balance = 1;
            (*y).balance = -1;
        } else {
            (*x).balance = 0;
            (*y).balance = 0;
        }
    }

    unsafe fn rotate_right(&mut self, x: *mut AvlNode) {
        let y = (*x).left;
        let parent = (*x).parent;

        (*x).left = (*y).right;
        if !(*y).right.is_null() {
            (*(*y).right).parent = x;
        }
        (*y).right = x;
        (*y).parent = parent;
        (*x).parent = y;
        self.replace_child(parent, x, y);

        if (*y).balance == 0 {
            (*x).balance = -1;
            (*y).balance = 1;
        } else {
            (*x).balance = 0;
            (*y).balance = 0;
        }
    }

    unsafe fn rotate_right_left(&mut self, x: *mut AvlNode) {
        let y = (*x).right;
        let z = (*y).left;
        let zb = (*z).balance;
        let parent = (*x).parent;

        (*y).left = (*z).right;
        if !(*z).right.is_null() {
            (*(*z).right).parent = y;
        }
        (*z).right = y;
        (*y).parent = z;

        (*x).right = (*z).left;
        if !(*z).left.is_null() {
            (*(*z).left).parent = x;
        }
        (*z).left = x;
        (*x).parent = z;

        (*z).parent = parent;
        self.replace_child(parent, x, z);

        (*x).balance = if zb > 0 { -1 } else { 0 };
        (*y).balance = if zb < 0 { 1 } else { 0 };
        (*z).balance = 0;
    }

    unsafe fn rotate_left_right(&mut self, x: *mut AvlNode) {
        let y = (*x).left;
        let z = (*y).right;
        let zb = (*z).balance;
        let parent = (*x).parent;

        (*y).right = (*z).left;
        if !(*z).left.is_null() {
            (*(*z).left).parent = y;
        }
        (*z).left = y;
        (*y).parent = z;

        (*x).left = (*z).right;
        if !(*z).right.is_null() {
            (*(*z).right).parent = x;
        }
        (*z).right = x;
        (*x).parent = z;

        (*z).parent = parent;
        self.replace_child(parent, x, z);

        (*x).balance = if zb < 0 { 1 } else { 0 };
        (*y).balance = if zb > 0 { -1 } else { 0 };
        (*z).balance = 0;
    }
}

impl Default for AvlTree {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Recursively compute height and verify the balance invariant.
    unsafe fn check(node: *mut AvlNode) -> i32 {
        if node.is_null() {
            return 0;
        }
        let lh = check((*node).left);
        let rh = check((*node).right);
        assert_eq!(
            (*node).balance as i32,
            rh - lh,
            "balance factor mismatch at key {}",
            (*node).key
        );
        assert!((rh - lh).abs() <= 1, "unbalanced at key {}", (*node).key);
        // Rotations can move an equal key to either side, so the ordering
        // check is non-strict both ways.
        if !(*node).left.is_null() {
            assert_eq!((*(*node).left).parent, node);
            assert!((*(*node).left).key <= (*node).key);
        }
        if !(*node).right.is_null() {
            assert_eq!((*(*node).right).parent, node);
            assert!((*(*node).right).key >= (*node).key);
        }
        1 + lh.max(rh)
    }

    unsafe fn drain_sorted(tree: &mut AvlTree) -> Vec<u64> {
        let mut out = Vec::new();
        while !tree.is_empty() {
            let min = tree.first();
            out.push((*min).key);
            tree.remove(min);
            check(tree.root);
        }
        out
    }

    #[test]
    fn test_insert_extract_sorted() {
        let mut tree = AvlTree::new();
        let keys = [50u64, 20, 90, 10, 30, 70, 100, 60, 80, 40, 25, 5, 95];
        let mut nodes: Vec<AvlNode> = keys.iter().map(|_| AvlNode::new()).collect();

        unsafe {
            for (node, &key) in nodes.iter_mut().zip(keys.iter()) {
                node.key = key;
                tree.insert(node);
                check(tree.root);
            }
            assert_eq!(tree.count(), keys.len());

            let mut sorted = keys.to_vec();
            sorted.sort();
            assert_eq!(drain_sorted(&mut tree), sorted);
        }
    }

    #[test]
    fn test_duplicate_keys() {
        let mut tree = AvlTree::new();
        let mut nodes: Vec<AvlNode> = (0..6).map(|_| AvlNode::new()).collect();

        unsafe {
            for (i, node) in nodes.iter_mut().enumerate() {
                node.key = if i % 2 == 0 { 7 } else { 3 };
                tree.insert(node);
                check(tree.root);
            }
            assert_eq!(drain_sorted(&mut tree), vec![3, 3, 3, 7, 7, 7]);
        }
    }

    #[test]
    fn test_remove_interior_nodes() {
        let mut tree = AvlTree::new();
        // Deterministic pseudo-random order.
        let mut keys = Vec::new();
        let mut x: u64 = 1;
        for _ in 0..64 {
            x = x.wrapping_mul(6364136223846793005).wrapping_add(1442695040888963407);
            keys.push(x >> 33);
        }
        let mut nodes: Vec<AvlNode> = keys.iter().map(|_| AvlNode::new()).collect();

        unsafe {
            for (node, &key) in nodes.iter_mut().zip(keys.iter()) {
                node.key = key;
                tree.insert(node);
            }
            check(tree.root);

            // Remove every third node, from the middle out.
            let mut remaining: Vec<u64> = Vec::new();
            for (i, node) in nodes.iter_mut().enumerate() {
                if i % 3 == 0 {
                    tree.remove(node as *mut AvlNode);
                    check(tree.root);
                } else {
                    remaining.push(keys[i]);
                }
            }
            remaining.sort();
            assert_eq!(drain_sorted(&mut tree), remaining);
        }
    }
}
