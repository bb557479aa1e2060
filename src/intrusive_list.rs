//! Intrusive doubly-linked list for O(1) free list management.
//!
//! Nodes live inside the memory they describe: a free area is its own list
//! node, with the header as the node's data and the links right behind it.
//! The list never allocates and never owns its nodes.

use std::marker::PhantomData;
use std::ptr::{NonNull, addr_of_mut};

/// A node in an intrusive doubly-linked list.
///
/// `data` comes first so that a pointer to the node is also a pointer to the
/// data. The links are only meaningful while the node is linked.
#[derive(Debug)]
#[repr(C)]
pub struct IntrusiveNode<T> {
    pub(crate) data: T,
    pub(crate) prev: Option<NonNull<Self>>,
    pub(crate) next: Option<NonNull<Self>>,
}

impl<T> IntrusiveNode<T> {
    /// Clears the links of a node whose memory may hold arbitrary bytes.
    ///
    /// # Safety
    ///
    /// `node` must be valid for writes and must not be linked in any list.
    pub unsafe fn reset_links(node: NonNull<Self>) {
        let node = node.as_ptr();
        // SAFETY: caller guarantees node is writable; the links have no drop glue
        unsafe {
            addr_of_mut!((*node).prev).write(None);
            addr_of_mut!((*node).next).write(None);
        }
    }

    /// Returns `true` if this node has a neighbour in its list.
    pub const fn is_linked(&self) -> bool {
        self.prev.is_some() || self.next.is_some()
    }
}

/// An intrusive doubly-linked list.
///
/// # Safety
///
/// The caller must ensure that:
/// - Nodes stay valid while linked in the list
/// - Nodes are only linked in one list at a time
pub struct IntrusiveList<T> {
    head: Option<NonNull<IntrusiveNode<T>>>,
    tail: Option<NonNull<IntrusiveNode<T>>>,
    len: usize,
}

impl<T> IntrusiveList<T> {
    /// Creates a new empty intrusive list.
    pub const fn new() -> Self {
        Self {
            head: None,
            tail: None,
            len: 0,
        }
    }

    /// Returns the number of nodes in the list.
    pub const fn len(&self) -> usize {
        self.len
    }

    /// Returns `true` if the list is empty.
    pub const fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Pushes a node to the front of the list.
    ///
    /// # Safety
    ///
    /// The caller must ensure:
    /// - `node` points to a valid node with cleared links
    /// - `node` is not already in any list
    pub unsafe fn push_front(&mut self, node: NonNull<IntrusiveNode<T>>) {
        // SAFETY: Caller guarantees node is valid and unlinked
        let node_ref = unsafe { &mut *node.as_ptr() };
        debug_assert!(!node_ref.is_linked(), "node is already linked");

        node_ref.prev = None;
        node_ref.next = self.head;

        if let Some(old_head) = self.head {
            // SAFETY: head is valid if present
            unsafe {
                (*old_head.as_ptr()).prev = Some(node);
            }
        } else {
            self.tail = Some(node);
        }

        self.head = Some(node);
        self.len += 1;
    }

    /// Pops a node from the front of the list.
    ///
    /// Returns `None` if the list is empty.
    pub fn pop_front(&mut self) -> Option<NonNull<IntrusiveNode<T>>> {
        let head = self.head?;

        // SAFETY: head is valid if present
        unsafe {
            let head_ref = &mut *head.as_ptr();
            self.head = head_ref.next;

            if let Some(new_head) = self.head {
                (*new_head.as_ptr()).prev = None;
            } else {
                self.tail = None;
            }

            head_ref.prev = None;
            head_ref.next = None;
        }

        self.len -= 1;
        Some(head)
    }

    /// Removes a specific node from the list.
    ///
    /// # Safety
    ///
    /// `node` must point to a valid node that is currently in this list.
    pub unsafe fn remove(&mut self, node: NonNull<IntrusiveNode<T>>) {
        // SAFETY: Caller guarantees node is valid and in this list
        let node_ref = unsafe { &mut *node.as_ptr() };

        match node_ref.prev {
            // SAFETY: linked neighbours are valid
            Some(prev) => unsafe { (*prev.as_ptr()).next = node_ref.next },
            None => self.head = node_ref.next,
        }
        match node_ref.next {
            // SAFETY: linked neighbours are valid
            Some(next) => unsafe { (*next.as_ptr()).prev = node_ref.prev },
            None => self.tail = node_ref.prev,
        }

        node_ref.prev = None;
        node_ref.next = None;
        self.len -= 1;
    }

    /// Returns the head of the list without removing it.
    #[cfg(test)]
    pub const fn peek_front(&self) -> Option<NonNull<IntrusiveNode<T>>> {
        self.head
    }

    /// Iterates over the nodes from head to tail.
    pub const fn iter(&self) -> Iter<'_, T> {
        Iter {
            next: self.head,
            _list: PhantomData,
        }
    }
}

/// Iterator over the nodes of an [`IntrusiveList`].
pub struct Iter<'a, T> {
    next: Option<NonNull<IntrusiveNode<T>>>,
    _list: PhantomData<&'a IntrusiveList<T>>,
}

impl<T> Iterator for Iter<'_, T> {
    type Item = NonNull<IntrusiveNode<T>>;

    fn next(&mut self) -> Option<Self::Item> {
        let node = self.next?;
        // SAFETY: linked nodes are valid while the list is borrowed
        self.next = unsafe { (*node.as_ptr()).next };
        Some(node)
    }
}

// SAFETY: The list only contains raw pointers which are Send if T is Send
unsafe impl<T: Send> Send for IntrusiveList<T> {}

// SAFETY: The list only contains raw pointers which are Sync if T is Sync
unsafe impl<T: Sync> Sync for IntrusiveList<T> {}
