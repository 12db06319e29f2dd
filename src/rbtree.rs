//! An intrusive red-black tree.
//!
//! The tree never allocates: callers own the [`RbNode`]s and link them in and
//! out. That lets [`FreeList`](crate::FreeList) keep its free-block index
//! inside the free blocks themselves. For ordinary use, [`RbTree::insert_with`]
//! places nodes in memory from any [`Allocator`].
//!
//! The balancing follows the classic OpenBSD `tree.h` red-black tree: insert
//! colors the new node red and repairs red-red edges with recoloring and two
//! rotation primitives, and remove splices out the node (or its in-order
//! successor) and repairs black height on the way up.
//!
//! Ordering comes from a plain comparison function. Equal keys are allowed
//! when inserting with `allow_duplicates`, in which case they go to the left
//! of their equal.

use core::cmp::Ordering;
use core::fmt;
use core::marker::PhantomData;
use core::mem::{align_of, size_of};
use core::ops::ControlFlow;
use core::ptr::{self, NonNull};

use crate::allocators::{Allocator, ALIGN};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Color {
    Black,
    Red,
}

/// Traversal order for [`RbTree::traverse`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Order {
    Pre,
    In,
    Post,
}

/// A tree node. The links are managed by the tree; `data` is the caller's.
#[repr(C)]
pub struct RbNode<T> {
    left: *mut RbNode<T>,
    right: *mut RbNode<T>,
    parent: *mut RbNode<T>,
    color: Color,
    pub data: T,
}

impl<T> RbNode<T> {
    /// A node that is not linked into any tree yet.
    pub const fn new(data: T) -> Self {
        RbNode {
            left: ptr::null_mut(),
            right: ptr::null_mut(),
            parent: ptr::null_mut(),
            color: Color::Red,
            data,
        }
    }

    pub fn left(&self) -> Option<NonNull<RbNode<T>>> {
        NonNull::new(self.left)
    }

    pub fn right(&self) -> Option<NonNull<RbNode<T>>> {
        NonNull::new(self.right)
    }

    pub fn parent(&self) -> Option<NonNull<RbNode<T>>> {
        NonNull::new(self.parent)
    }

    pub fn color(&self) -> Color {
        self.color
    }
}

/// Null links count as black.
unsafe fn is_red<T>(node: *mut RbNode<T>) -> bool {
    !node.is_null() && (*node).color == Color::Red
}

unsafe fn is_black<T>(node: *mut RbNode<T>) -> bool {
    !is_red(node)
}

pub struct RbTree<T> {
    root: *mut RbNode<T>,
    len: usize,
    cmp: fn(&T, &T) -> Ordering,
}

// The tree only links nodes it was given; whoever owns the nodes decides
// where they may go.
unsafe impl<T: Send> Send for RbTree<T> {}

impl<T: Ord> Default for RbTree<T> {
    fn default() -> Self {
        Self::new(T::cmp)
    }
}

impl<T> RbTree<T> {
    pub const fn new(cmp: fn(&T, &T) -> Ordering) -> Self {
        RbTree {
            root: ptr::null_mut(),
            len: 0,
            cmp,
        }
    }

    pub fn root(&self) -> Option<NonNull<RbNode<T>>> {
        NonNull::new(self.root)
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.root.is_null()
    }

    /// Forget every node without touching them.
    pub fn clear(&mut self) {
        self.root = ptr::null_mut();
        self.len = 0;
    }

    unsafe fn rotate_left(&mut self, elm: *mut RbNode<T>) {
        let tmp = (*elm).right;
        (*elm).right = (*tmp).left;
        if !(*tmp).left.is_null() {
            (*(*tmp).left).parent = elm;
        }
        (*tmp).parent = (*elm).parent;
        self.replace_child((*elm).parent, elm, tmp);
        (*tmp).left = elm;
        (*elm).parent = tmp;
    }

    unsafe fn rotate_right(&mut self, elm: *mut RbNode<T>) {
        let tmp = (*elm).left;
        (*elm).left = (*tmp).right;
        if !(*tmp).right.is_null() {
            (*(*tmp).right).parent = elm;
        }
        (*tmp).parent = (*elm).parent;
        self.replace_child((*elm).parent, elm, tmp);
        (*tmp).right = elm;
        (*elm).parent = tmp;
    }

    /// Point whichever link of `parent` held `old` (or the root) at `new`.
    unsafe fn replace_child(
        &mut self,
        parent: *mut RbNode<T>,
        old: *mut RbNode<T>,
        new: *mut RbNode<T>,
    ) {
        if parent.is_null() {
            self.root = new;
        } else if (*parent).left == old {
            (*parent).left = new;
        } else {
            (*parent).right = new;
        }
    }

    unsafe fn insert_color(&mut self, mut elm: *mut RbNode<T>) {
        loop {
            let mut parent = (*elm).parent;
            if !is_red(parent) {
                break;
            }
            // A red parent is never the root, so the grandparent exists.
            let gparent = (*parent).parent;

            if parent == (*gparent).left {
                let uncle = (*gparent).right;
                if is_red(uncle) {
                    (*uncle).color = Color::Black;
                    (*parent).color = Color::Black;
                    (*gparent).color = Color::Red;
                    elm = gparent;
                    continue;
                }
                if (*parent).right == elm {
                    self.rotate_left(parent);
                    core::mem::swap(&mut parent, &mut elm);
                }
                (*parent).color = Color::Black;
                (*gparent).color = Color::Red;
                self.rotate_right(gparent);
            } else {
                let uncle = (*gparent).left;
                if is_red(uncle) {
                    (*uncle).color = Color::Black;
                    (*parent).color = Color::Black;
                    (*gparent).color = Color::Red;
                    elm = gparent;
                    continue;
                }
                if (*parent).left == elm {
                    self.rotate_right(parent);
                    core::mem::swap(&mut parent, &mut elm);
                }
                (*parent).color = Color::Black;
                (*gparent).color = Color::Red;
                self.rotate_left(gparent);
            }
        }
        (*self.root).color = Color::Black;
    }

    unsafe fn remove_color(&mut self, mut parent: *mut RbNode<T>, mut elm: *mut RbNode<T>) {
        while is_black(elm) && elm != self.root {
            if (*parent).left == elm {
                let mut sibling = (*parent).right;
                if is_red(sibling) {
                    (*sibling).color = Color::Black;
                    (*parent).color = Color::Red;
                    self.rotate_left(parent);
                    sibling = (*parent).right;
                }
                if is_black((*sibling).left) && is_black((*sibling).right) {
                    (*sibling).color = Color::Red;
                    elm = parent;
                    parent = (*elm).parent;
                } else {
                    if is_black((*sibling).right) {
                        let near = (*sibling).left;
                        if !near.is_null() {
                            (*near).color = Color::Black;
                        }
                        (*sibling).color = Color::Red;
                        self.rotate_right(sibling);
                        sibling = (*parent).right;
                    }
                    (*sibling).color = (*parent).color;
                    (*parent).color = Color::Black;
                    if !(*sibling).right.is_null() {
                        (*(*sibling).right).color = Color::Black;
                    }
                    self.rotate_left(parent);
                    elm = self.root;
                    break;
                }
            } else {
                let mut sibling = (*parent).left;
                if is_red(sibling) {
                    (*sibling).color = Color::Black;
                    (*parent).color = Color::Red;
                    self.rotate_right(parent);
                    sibling = (*parent).left;
                }
                if is_black((*sibling).left) && is_black((*sibling).right) {
                    (*sibling).color = Color::Red;
                    elm = parent;
                    parent = (*elm).parent;
                } else {
                    if is_black((*sibling).left) {
                        let near = (*sibling).right;
                        if !near.is_null() {
                            (*near).color = Color::Black;
                        }
                        (*sibling).color = Color::Red;
                        self.rotate_left(sibling);
                        sibling = (*parent).left;
                    }
                    (*sibling).color = (*parent).color;
                    (*parent).color = Color::Black;
                    if !(*sibling).left.is_null() {
                        (*(*sibling).left).color = Color::Black;
                    }
                    self.rotate_right(parent);
                    elm = self.root;
                    break;
                }
            }
        }
        if !elm.is_null() {
            (*elm).color = Color::Black;
        }
    }

    /// Link `node` into the tree.
    ///
    /// Without `allow_duplicates`, an existing node that compares equal is
    /// returned and `node` is left alone. Otherwise `node` is returned.
    ///
    /// # Safety
    ///
    /// `node` must be valid, not already in a tree, and stay valid and
    /// unmoved until it is removed or the tree is cleared.
    pub unsafe fn insert(
        &mut self,
        node: NonNull<RbNode<T>>,
        allow_duplicates: bool,
    ) -> NonNull<RbNode<T>> {
        let elm = node.as_ptr();
        let mut parent = ptr::null_mut();
        let mut tmp = self.root;
        let mut comp = Ordering::Equal;

        while !tmp.is_null() {
            parent = tmp;
            comp = (self.cmp)(&(*elm).data, &(*parent).data);
            tmp = match comp {
                Ordering::Less => (*tmp).left,
                Ordering::Greater => (*tmp).right,
                Ordering::Equal if allow_duplicates => (*tmp).left,
                Ordering::Equal => return NonNull::new_unchecked(tmp),
            };
        }

        (*elm).parent = parent;
        (*elm).left = ptr::null_mut();
        (*elm).right = ptr::null_mut();
        (*elm).color = Color::Red;

        if parent.is_null() {
            self.root = elm;
        } else if comp == Ordering::Greater {
            (*parent).right = elm;
        } else {
            (*parent).left = elm;
        }

        self.insert_color(elm);
        self.len += 1;
        node
    }

    /// Unlink `node` from the tree and return it.
    ///
    /// # Safety
    ///
    /// `node` must currently be linked into this tree.
    pub unsafe fn remove(&mut self, node: NonNull<RbNode<T>>) -> NonNull<RbNode<T>> {
        assert!(self.len > 0, "[RbTree]: empty");

        let old = node.as_ptr();
        let child;
        let mut parent;
        let color;

        if (*old).left.is_null() || (*old).right.is_null() {
            child = if (*old).left.is_null() {
                (*old).right
            } else {
                (*old).left
            };
            parent = (*old).parent;
            color = (*old).color;
            if !child.is_null() {
                (*child).parent = parent;
            }
            self.replace_child(parent, old, child);
        } else {
            // Two children: splice out the in-order successor and put it in
            // `old`'s place.
            let mut elm = (*old).right;
            while !(*elm).left.is_null() {
                elm = (*elm).left;
            }
            child = (*elm).right;
            parent = (*elm).parent;
            color = (*elm).color;
            if !child.is_null() {
                (*child).parent = parent;
            }
            self.replace_child(parent, elm, child);
            if (*elm).parent == old {
                parent = elm;
            }

            (*elm).left = (*old).left;
            (*elm).right = (*old).right;
            (*elm).parent = (*old).parent;
            (*elm).color = (*old).color;

            self.replace_child((*old).parent, old, elm);
            (*(*old).left).parent = elm;
            if !(*old).right.is_null() {
                (*(*old).right).parent = elm;
            }
        }

        if color == Color::Black {
            self.remove_color(parent, child);
        }

        self.len -= 1;
        node
    }

    /// Find a node comparing equal to `data`.
    pub fn search(&self, data: &T) -> Option<NonNull<RbNode<T>>> {
        let mut it = self.root;
        while !it.is_null() {
            unsafe {
                it = match (self.cmp)(data, &(*it).data) {
                    Ordering::Equal => return NonNull::new(it),
                    Ordering::Less => (*it).left,
                    Ordering::Greater => (*it).right,
                };
            }
        }
        None
    }

    /// Number of levels in the tree.
    pub fn depth(&self) -> usize {
        fn depth<T>(node: *mut RbNode<T>) -> usize {
            if node.is_null() {
                return 0;
            }
            unsafe { 1 + depth((*node).left).max(depth((*node).right)) }
        }
        depth(self.root)
    }

    /// Walk the tree, calling `visit(parent, node)` for every node in the
    /// given order.
    ///
    /// If `visit` breaks, the walk stops there and returns that
    /// `(parent, node)` pair.
    #[allow(clippy::type_complexity)]
    pub fn traverse<F>(
        &self,
        order: Order,
        mut visit: F,
    ) -> Option<(Option<NonNull<RbNode<T>>>, NonNull<RbNode<T>>)>
    where
        F: FnMut(Option<&RbNode<T>>, &RbNode<T>) -> ControlFlow<()>,
    {
        fn walk<T, F>(
            order: Order,
            parent: *mut RbNode<T>,
            node: *mut RbNode<T>,
            visit: &mut F,
        ) -> ControlFlow<(*mut RbNode<T>, *mut RbNode<T>)>
        where
            F: FnMut(Option<&RbNode<T>>, &RbNode<T>) -> ControlFlow<()>,
        {
            if node.is_null() {
                return ControlFlow::Continue(());
            }

            fn here<T, F>(
                parent: *mut RbNode<T>,
                node: *mut RbNode<T>,
                visit: &mut F,
            ) -> ControlFlow<(*mut RbNode<T>, *mut RbNode<T>)>
            where
                F: FnMut(Option<&RbNode<T>>, &RbNode<T>) -> ControlFlow<()>,
            {
                match unsafe { visit(parent.as_ref(), &*node) } {
                    ControlFlow::Break(()) => ControlFlow::Break((parent, node)),
                    ControlFlow::Continue(()) => ControlFlow::Continue(()),
                }
            }

            let (left, right) = unsafe { ((*node).left, (*node).right) };
            match order {
                Order::Pre => {
                    here(parent, node, visit)?;
                    walk(order, node, left, visit)?;
                    walk(order, node, right, visit)
                }
                Order::In => {
                    walk(order, node, left, visit)?;
                    here(parent, node, visit)?;
                    walk(order, node, right, visit)
                }
                Order::Post => {
                    walk(order, node, left, visit)?;
                    walk(order, node, right, visit)?;
                    here(parent, node, visit)
                }
            }
        }

        match walk(order, ptr::null_mut(), self.root, &mut visit) {
            ControlFlow::Continue(()) => None,
            ControlFlow::Break((parent, node)) => Some((NonNull::new(parent), NonNull::new(node)?)),
        }
    }

    /// In-order iterator over the nodes' data.
    pub fn iter(&self) -> Iter<'_, T> {
        let mut first = self.root;
        unsafe {
            while !first.is_null() && !(*first).left.is_null() {
                first = (*first).left;
            }
        }
        Iter {
            next: first,
            _tree: PhantomData,
        }
    }

    /// Check the red-black invariants and the ordering.
    pub fn validate(&self) -> TreeValidity {
        let mut validity = TreeValidity {
            red_root: unsafe { is_red(self.root) },
            ..Default::default()
        };

        // Returns the black height of the subtree.
        fn check<T>(
            tree: &RbTree<T>,
            node: *mut RbNode<T>,
            validity: &mut TreeValidity,
            count: &mut usize,
        ) -> usize {
            if node.is_null() {
                return 1;
            }
            *count += 1;
            unsafe {
                let (left, right) = ((*node).left, (*node).right);
                if is_red(node) && (is_red(left) || is_red(right)) {
                    validity.red_red += 1;
                }
                for child in [left, right] {
                    if !child.is_null() && (*child).parent != node {
                        validity.broken_parents += 1;
                    }
                }
                if !left.is_null() && (tree.cmp)(&(*left).data, &(*node).data) == Ordering::Greater
                {
                    validity.out_of_order += 1;
                }
                if !right.is_null() && (tree.cmp)(&(*right).data, &(*node).data) == Ordering::Less
                {
                    validity.out_of_order += 1;
                }

                let lh = check(tree, left, validity, count);
                let rh = check(tree, right, validity, count);
                if lh != rh {
                    validity.black_height_mismatches += 1;
                }
                lh.max(rh) + usize::from(is_black(node))
            }
        }

        let mut count = 0;
        check(self, self.root, &mut validity, &mut count);
        validity.len_mismatch = count != self.len;
        validity
    }

    /// Draw the tree sideways, one node per line, using `fmt_node` for the
    /// node itself.
    pub fn fmt_tree<W, F>(&self, out: &mut W, mut fmt_node: F) -> fmt::Result
    where
        W: fmt::Write,
        F: FnMut(&mut W, &RbNode<T>) -> fmt::Result,
    {
        fn draw<T, W, F>(
            out: &mut W,
            node: *mut RbNode<T>,
            prefix: &mut String,
            is_left: bool,
            fmt_node: &mut F,
        ) -> fmt::Result
        where
            W: fmt::Write,
            F: FnMut(&mut W, &RbNode<T>) -> fmt::Result,
        {
            if node.is_null() {
                return Ok(());
            }
            let node = unsafe { &*node };
            write!(out, "{}{}", prefix, if is_left { "|__" } else { "\\__" })?;
            fmt_node(out, node)?;
            writeln!(out)?;

            let len = prefix.len();
            prefix.push_str(if is_left { "|   " } else { "    " });
            draw(out, node.left, prefix, true, fmt_node)?;
            draw(out, node.right, prefix, false, fmt_node)?;
            prefix.truncate(len);
            Ok(())
        }

        draw(out, self.root, &mut String::new(), false, &mut fmt_node)
    }

    /// Allocate a node for `data` from `alloc` and insert it.
    ///
    /// If duplicates are not allowed and an equal node exists, the new node
    /// is given back to `alloc` and the existing one is returned.
    pub fn insert_with(
        &mut self,
        alloc: &mut dyn Allocator,
        data: T,
        allow_duplicates: bool,
    ) -> NonNull<RbNode<T>> {
        assert!(
            align_of::<RbNode<T>>() <= ALIGN,
            "[RbTree]: node alignment exceeds what allocators guarantee"
        );

        let node: NonNull<RbNode<T>> = alloc.alloc(1, size_of::<RbNode<T>>()).cast();
        unsafe {
            node.as_ptr().write(RbNode::new(data));
            let inserted = self.insert(node, allow_duplicates);
            if inserted != node {
                ptr::drop_in_place(node.as_ptr());
                alloc.free(node.cast());
            }
            inserted
        }
    }

    /// Remove `node`, drop its data and give its memory back to `alloc`.
    ///
    /// # Safety
    ///
    /// `node` must be linked into this tree and have been allocated from
    /// `alloc` (as [`insert_with`](Self::insert_with) does).
    pub unsafe fn remove_and_free(&mut self, alloc: &mut dyn Allocator, node: NonNull<RbNode<T>>) {
        let node = self.remove(node);
        ptr::drop_in_place(node.as_ptr());
        alloc.free(node.cast());
    }

    /// Drop and free every node, leaving the tree empty.
    ///
    /// # Safety
    ///
    /// Every node must have been allocated from `alloc`.
    pub unsafe fn destroy(&mut self, alloc: &mut dyn Allocator) {
        let mut nodes = Vec::with_capacity(self.len);
        self.traverse(Order::Post, |_, node| {
            nodes.push(NonNull::from(node));
            ControlFlow::Continue(())
        });
        for node in nodes {
            ptr::drop_in_place(node.as_ptr());
            alloc.free(node.cast());
        }
        self.clear();
    }
}

pub struct Iter<'tree, T> {
    next: *mut RbNode<T>,
    _tree: PhantomData<&'tree RbTree<T>>,
}

impl<'tree, T> Iterator for Iter<'tree, T> {
    type Item = &'tree T;

    fn next(&mut self) -> Option<Self::Item> {
        let node = self.next;
        if node.is_null() {
            return None;
        }

        unsafe {
            // In-order successor: leftmost of the right subtree, or the first
            // ancestor we reach from its left side.
            if !(*node).right.is_null() {
                let mut it = (*node).right;
                while !(*it).left.is_null() {
                    it = (*it).left;
                }
                self.next = it;
            } else {
                let mut child = node;
                let mut parent = (*node).parent;
                while !parent.is_null() && (*parent).right == child {
                    child = parent;
                    parent = (*parent).parent;
                }
                self.next = parent;
            }
            Some(&(*node).data)
        }
    }
}

impl<'tree, T> IntoIterator for &'tree RbTree<T> {
    type Item = &'tree T;
    type IntoIter = Iter<'tree, T>;

    fn into_iter(self) -> Self::IntoIter {
        self.iter()
    }
}

/// Every way a tree was found to break the red-black rules.
#[derive(Default, Debug)]
pub struct TreeValidity {
    pub red_root: bool,
    /// Red nodes with a red child.
    pub red_red: usize,
    /// Nodes whose subtrees have different black heights.
    pub black_height_mismatches: usize,
    /// Children on the wrong side of their parent.
    pub out_of_order: usize,
    /// Children whose parent link doesn't point back.
    pub broken_parents: usize,
    /// The node count doesn't match the tracked size.
    pub len_mismatch: bool,
}

impl TreeValidity {
    pub fn is_valid(&self) -> bool {
        !self.red_root
            && self.red_red == 0
            && self.black_height_mismatches == 0
            && self.out_of_order == 0
            && self.broken_parents == 0
            && !self.len_mismatch
    }
}

impl<T: fmt::Display> fmt::Display for RbTree<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.fmt_tree(f, |out, node| {
            let tag = match node.color {
                Color::Red => "(R)",
                Color::Black => "(B)",
            };
            write!(out, "{} {}", tag, node.data)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use rand::seq::SliceRandom;
    use rand::{Rng, SeedableRng};
    use test_log::test;

    use crate::{Arena, FreeList};

    fn assert_valid<T>(tree: &RbTree<T>) {
        let validity = tree.validate();
        assert!(validity.is_valid(), "{:?}", validity);
    }

    #[test]
    fn test_insert_sorted() {
        let mut arena = Arena::new(4096);
        let mut tree = RbTree::default();

        for i in 0..100u64 {
            tree.insert_with(&mut arena, i, false);
            assert_valid(&tree);
        }

        assert_eq!(tree.len(), 100);
        assert!(tree.iter().copied().eq(0..100));
        // Balanced: at most 2 * log2(n + 1) levels.
        assert!(tree.depth() <= 14, "depth {}", tree.depth());
        assert!(tree.search(&42).is_some());
        assert!(tree.search(&100).is_none());
    }

    #[test]
    fn test_no_duplicates() {
        let mut arena = Arena::new(1024);
        let mut tree = RbTree::default();

        let first = tree.insert_with(&mut arena, 5u32, false);
        let again = tree.insert_with(&mut arena, 5u32, false);
        assert_eq!(first, again);
        assert_eq!(tree.len(), 1);
    }

    #[test]
    fn test_duplicates_go_left() {
        let mut arena = Arena::new(1024);
        let mut tree = RbTree::new(|a: &(u32, u32), b: &(u32, u32)| a.0.cmp(&b.0));

        let root = tree.insert_with(&mut arena, (7, 0), true);
        let dup = tree.insert_with(&mut arena, (7, 1), true);
        assert_ne!(root, dup);
        assert_eq!(tree.len(), 2);
        unsafe {
            assert_eq!(root.as_ref().left(), Some(dup));
            assert_eq!(dup.as_ref().parent(), Some(root));
        }
        // In order: the newer duplicate comes first.
        let order: Vec<_> = tree.iter().map(|&(_, tag)| tag).collect();
        assert_eq!(order, [1, 0]);
        assert_valid(&tree);
    }

    #[test]
    fn test_random_insert_remove() {
        let seed: u64 = rand::thread_rng().gen();
        log::info!("Using seed {}", seed);
        let mut rng = rand::rngs::StdRng::seed_from_u64(seed);

        let mut free_list = FreeList::new(64 * 1024);
        let mut tree = RbTree::default();
        let mut nodes = Vec::new();

        for _ in 0..2000 {
            let remove = !nodes.is_empty() && rng.gen_bool(0.4);
            if remove {
                let idx = rng.gen_range(0..nodes.len());
                let node = nodes.swap_remove(idx);
                unsafe { tree.remove_and_free(&mut free_list, node) };
            } else {
                let value: u32 = rng.gen_range(0..200);
                nodes.push(tree.insert_with(&mut free_list, value, true));
            }

            assert_valid(&tree);
            assert_eq!(tree.len(), nodes.len());
            let values: Vec<u32> = tree.iter().copied().collect();
            assert!(values.windows(2).all(|w| w[0] <= w[1]));
        }

        nodes.shuffle(&mut rng);
        for node in nodes {
            unsafe { tree.remove_and_free(&mut free_list, node) };
            assert_valid(&tree);
        }
        assert!(tree.is_empty());
        assert!(free_list.validate().is_valid());
    }

    #[test]
    fn test_traverse_orders() {
        let mut arena = Arena::new(1024);
        let mut tree = RbTree::default();
        for i in [2u8, 1, 3] {
            tree.insert_with(&mut arena, i, false);
        }

        let collect = |order| {
            let mut seen = Vec::new();
            let stopped = tree.traverse(order, |_, node| {
                seen.push(node.data);
                ControlFlow::Continue(())
            });
            assert!(stopped.is_none());
            seen
        };
        assert_eq!(collect(Order::Pre), [2, 1, 3]);
        assert_eq!(collect(Order::In), [1, 2, 3]);
        assert_eq!(collect(Order::Post), [1, 3, 2]);
    }

    #[test]
    fn test_traverse_stops_early() {
        let mut arena = Arena::new(4096);
        let mut tree = RbTree::default();
        for i in 0..20u16 {
            tree.insert_with(&mut arena, i, false);
        }

        let mut visited = 0;
        let (parent, node) = tree
            .traverse(Order::In, |_, node| {
                visited += 1;
                if node.data == 7 {
                    ControlFlow::Break(())
                } else {
                    ControlFlow::Continue(())
                }
            })
            .unwrap();

        assert_eq!(visited, 8);
        unsafe {
            assert_eq!(node.as_ref().data, 7);
            assert_eq!(node.as_ref().parent(), parent);
        }
    }

    #[test]
    fn test_destroy() {
        let mut free_list = FreeList::new(4096);
        let mut tree = RbTree::default();
        for i in 0..50u64 {
            tree.insert_with(&mut free_list, i * 3, false);
        }
        assert!(free_list.stats().occupied > 0);

        unsafe { tree.destroy(&mut free_list) };
        assert!(tree.is_empty());
        assert_eq!(tree.len(), 0);
        assert_eq!(free_list.stats().occupied, 0);
    }

    #[test]
    fn test_display() {
        let mut arena = Arena::new(1024);
        let mut tree = RbTree::default();
        for i in [2u8, 1, 3] {
            tree.insert_with(&mut arena, i, false);
        }
        let drawn = tree.to_string();
        assert_eq!(drawn, "\\__(B) 2\n    |__(R) 1\n    \\__(R) 3\n");
    }
}
