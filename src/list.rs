use std::{marker::PhantomData, ptr::NonNull};

/// Non-null pointer to `T`.
pub(crate) type Link<T> = Option<NonNull<T>>;

pub(crate) struct Node<T> {
    /// Pointer to the next node of the list
    pub next: Link<Self>,
    /// Pointer to the previous node of the list
    pub prev: Link<Self>,
    /// Element of the node
    pub data: T,
}

/// Doubly linked list whose nodes live inside of memory the allocator owns.
///
/// Pool blocks use this list: the node describing a pool block is written at
/// the very beginning of the reservation it describes, so the list never needs
/// to allocate anything itself.
///
/// ```text
///  +-----------------------+      +-----------------------+
///  | Node<PoolBlock> | ... | <--> | Node<PoolBlock> | ... |
///  +-----------------------+      +-----------------------+
///       reservation 1                  reservation 2
/// ```
pub(crate) struct List<T> {
    head: Link<Node<T>>,
    tail: Link<Node<T>>,
    len: usize,
    marker: PhantomData<T>,
}

pub(crate) struct Iter<'a, T> {
    current: Link<Node<T>>,
    remaining: usize,
    marker: PhantomData<&'a T>,
}

impl<T> List<T> {
    pub const fn new() -> Self {
        Self {
            head: None,
            tail: None,
            len: 0,
            marker: PhantomData,
        }
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    #[inline]
    pub fn first(&self) -> Link<Node<T>> {
        self.head
    }

    #[inline]
    #[cfg(test)]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Appends a new node to the Linked List.
    ///
    /// It is very important for us that, because we are the actual memory
    /// allocator, this method can not make allocations itself. Therefor,
    /// it has to receive the `addr` where this node has to be written.
    ///
    /// **SAFETY**: Caller must guarantee that `addr` is valid for writes of a
    /// `Node<T>`, properly aligned and not used by anything else.
    pub unsafe fn append(&mut self, data: T, addr: NonNull<u8>) -> NonNull<Node<T>> {
        let node = addr.cast::<Node<T>>();

        unsafe {
            node.as_ptr().write(Node {
                next: None,
                prev: self.tail,
                data,
            });

            if let Some(mut tail) = self.tail {
                tail.as_mut().next = Some(node);
            } else {
                self.head = Some(node);
            }
        }

        self.tail = Some(node);
        self.len += 1;

        node
    }

    /// Unlinks `node` from the list. The memory of the node is left untouched.
    ///
    /// **SAFETY**: `node` must currently belong to this list.
    pub unsafe fn remove(&mut self, node: NonNull<Node<T>>) {
        unsafe {
            let prev = node.as_ref().prev;
            let next = node.as_ref().next;

            match prev {
                Some(mut prev) => prev.as_mut().next = next,
                None => self.head = next,
            }

            match next {
                Some(mut next) => next.as_mut().prev = prev,
                None => self.tail = prev,
            }
        }

        self.len -= 1;
    }

    /// Iterates over the node pointers, so callers can both read and unlink them.
    pub fn nodes(&self) -> Iter<'_, T> {
        Iter {
            current: self.head,
            remaining: self.len,
            marker: PhantomData,
        }
    }
}

impl<T> Default for List<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<'a, T> Iterator for Iter<'a, T> {
    type Item = NonNull<Node<T>>;

    fn next(&mut self) -> Option<Self::Item> {
        let node = self.current?;

        unsafe {
            self.current = node.as_ref().next;
        }
        self.remaining -= 1;

        Some(node)
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        (self.remaining, Some(self.remaining))
    }
}

/// Previous/next indices of a record that is linked into an [`IndexList`].
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Links {
    pub prev: Option<u32>,
    pub next: Option<u32>,
}

/// Records stored in a slot table that can be linked into an [`IndexList`].
pub(crate) trait Linked {
    fn links(&self) -> &Links;
    fn links_mut(&mut self) -> &mut Links;
}

/// Doubly linked list of slot indices.
///
/// The list itself only stores head, tail and length; the links live inside
/// of the records of the slot table the indices point into. Push and remove
/// are O(1) and nothing is ever aliased through raw pointers.
#[derive(Debug, Default, Clone, Copy)]
pub(crate) struct IndexList {
    head: Option<u32>,
    tail: Option<u32>,
    len: usize,
}

impl IndexList {
    pub const fn new() -> Self {
        Self { head: None, tail: None, len: 0 }
    }

    #[cfg(test)]
    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    #[cfg(test)]
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    #[cfg(test)]
    #[inline]
    pub fn first(&self) -> Option<u32> {
        self.head
    }

    pub fn push_back<T: Linked>(&mut self, slots: &mut [T], index: u32) {
        *slots[index as usize].links_mut() = Links { prev: self.tail, next: None };

        match self.tail {
            Some(tail) => slots[tail as usize].links_mut().next = Some(index),
            None => self.head = Some(index),
        }

        self.tail = Some(index);
        self.len += 1;
    }

    /// Unlinks `index`. It must currently be linked into this list.
    pub fn remove<T: Linked>(&mut self, slots: &mut [T], index: u32) {
        let Links { prev, next } = *slots[index as usize].links();

        match prev {
            Some(prev) => slots[prev as usize].links_mut().next = next,
            None => self.head = next,
        }

        match next {
            Some(next) => slots[next as usize].links_mut().prev = prev,
            None => self.tail = prev,
        }

        *slots[index as usize].links_mut() = Links::default();
        self.len -= 1;
    }

    /// Iterates over the indices in list order.
    pub fn iter<'a, T: Linked>(&self, slots: &'a [T]) -> IndexIter<'a, T> {
        IndexIter { slots, current: self.head }
    }

    pub fn clear(&mut self) {
        *self = Self::new();
    }
}

pub(crate) struct IndexIter<'a, T> {
    slots: &'a [T],
    current: Option<u32>,
}

impl<'a, T: Linked> Iterator for IndexIter<'a, T> {
    type Item = u32;

    fn next(&mut self) -> Option<u32> {
        let index = self.current?;
        self.current = self.slots[index as usize].links().next;

        Some(index)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::mem::MaybeUninit;

    #[test]
    fn new_list_is_empty() {
        let list: List<u8> = List::new();

        assert_eq!(list.len(), 0);
        assert!(list.is_empty());
        assert!(list.nodes().next().is_none());
    }

    #[test]
    fn placement_append_and_remove() {
        let mut storage: [MaybeUninit<Node<u32>>; 3] = [const { MaybeUninit::uninit() }; 3];
        let mut list = List::new();

        unsafe {
            let nodes: Vec<_> = storage
                .iter_mut()
                .enumerate()
                .map(|(i, slot)| list.append(i as u32, NonNull::new_unchecked(slot.as_mut_ptr().cast())))
                .collect();

            assert_eq!(list.len(), 3);

            // Removing the head used to be the tricky case.
            list.remove(nodes[0]);
            let values: Vec<u32> = list.nodes().map(|n| n.as_ref().data).collect();
            assert_eq!(values, vec![1, 2]);

            list.remove(nodes[2]);
            list.remove(nodes[1]);
            assert!(list.is_empty());
            assert!(list.first().is_none());
        }
    }

    #[derive(Default)]
    struct Item {
        links: Links,
    }

    impl Linked for Item {
        fn links(&self) -> &Links {
            &self.links
        }

        fn links_mut(&mut self) -> &mut Links {
            &mut self.links
        }
    }

    #[test]
    fn index_list_push_remove() {
        let mut slots: Vec<Item> = (0..5).map(|_| Item::default()).collect();
        let mut list = IndexList::new();

        for i in [4, 0, 2] {
            list.push_back(&mut slots, i);
        }
        assert_eq!(list.iter(&slots).collect::<Vec<_>>(), vec![4, 0, 2]);

        list.remove(&mut slots, 0);
        assert_eq!(list.iter(&slots).collect::<Vec<_>>(), vec![4, 2]);

        list.remove(&mut slots, 4);
        list.remove(&mut slots, 2);
        assert!(list.is_empty());
        assert_eq!(list.first(), None);
        assert_eq!(slots[2].links, Links::default());
    }
}
