/// Stable index of an entry inside an [`LruList`]. Indices of removed entries are recycled.
pub type EntryId = usize;

#[derive(Debug)]
struct Node<V> {
    value: V,
    prev: Option<EntryId>,
    next: Option<EntryId>,
}

/// Doubly linked recency list stored in an arena. `head` is the most recently used entry.
#[derive(Debug)]
pub struct LruList<V> {
    slots: Vec<Option<Node<V>>>,
    free: Vec<EntryId>,
    head: Option<EntryId>,
    tail: Option<EntryId>,
    len: usize,
}
impl<V> Default for LruList<V> {
    fn default() -> Self {
        LruList {
            slots: Vec::new(),
            free: Vec::new(),
            head: None,
            tail: None,
            len: 0,
        }
    }
}

impl<V> LruList<V> {
    pub fn new() -> Self { Self::default() }
    pub fn len(&self) -> usize { self.len }
    pub fn is_empty(&self) -> bool { self.len == 0 }
    /// Least recently used entry
    pub fn tail(&self) -> Option<EntryId> { self.tail }
    pub fn head(&self) -> Option<EntryId> { self.head }

    pub fn get(&self, id: EntryId) -> Option<&V> { self.node(id).map(|n| &n.value) }
    pub fn get_mut(&mut self, id: EntryId) -> Option<&mut V> {
        self.slots.get_mut(id).and_then(|s| s.as_mut()).map(|n| &mut n.value)
    }

    /// Inserts `value` as the most recently used entry.
    pub fn push_front(&mut self, value: V) -> EntryId {
        let node = Node {
            value,
            prev: None,
            next: None,
        };
        let id = match self.free.pop() {
            Some(id) => {
                self.slots[id] = Some(node);
                id
            }
            None => {
                self.slots.push(Some(node));
                self.slots.len() - 1
            }
        };
        self.link_front(id);
        self.len += 1;
        id
    }

    /// Moves an entry to the front. O(1).
    pub fn promote(&mut self, id: EntryId) {
        if self.head == Some(id) || self.node(id).is_none() {
            return;
        }
        self.unlink(id);
        self.link_front(id);
    }

    pub fn remove(&mut self, id: EntryId) -> Option<V> {
        self.node(id)?;
        self.unlink(id);
        let node = self.slots[id].take()?;
        self.free.push(id);
        self.len -= 1;
        Some(node.value)
    }

    pub fn clear(&mut self) {
        self.slots.clear();
        self.free.clear();
        self.head = None;
        self.tail = None;
        self.len = 0;
    }

    /// Iterates from most to least recently used.
    pub fn iter(&self) -> impl Iterator<Item = (EntryId, &V)> + '_ {
        let mut cur = self.head;
        std::iter::from_fn(move || {
            let id = cur?;
            let node = self.node(id)?;
            cur = node.next;
            Some((id, &node.value))
        })
    }

    fn node(&self, id: EntryId) -> Option<&Node<V>> { self.slots.get(id).and_then(|s| s.as_ref()) }
    fn node_mut(&mut self, id: EntryId) -> Option<&mut Node<V>> { self.slots.get_mut(id).and_then(|s| s.as_mut()) }

    fn unlink(&mut self, id: EntryId) {
        let (prev, next) = match self.node_mut(id) {
            Some(node) => (node.prev.take(), node.next.take()),
            None => return,
        };
        match prev {
            Some(p) => {
                if let Some(n) = self.node_mut(p) {
                    n.next = next;
                }
            }
            None => self.head = next,
        }
        match next {
            Some(n) => {
                if let Some(node) = self.node_mut(n) {
                    node.prev = prev;
                }
            }
            None => self.tail = prev,
        }
    }

    fn link_front(&mut self, id: EntryId) {
        let old_head = self.head;
        if let Some(node) = self.node_mut(id) {
            node.prev = None;
            node.next = old_head;
        }
        if let Some(h) = old_head {
            if let Some(node) = self.node_mut(h) {
                node.prev = Some(id);
            }
        }
        self.head = Some(id);
        if self.tail.is_none() {
            self.tail = Some(id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn order(list: &LruList<&'static str>) -> Vec<&'static str> { list.iter().map(|(_, v)| *v).collect() }

    #[test]
    fn push_front_orders_by_recency() {
        let mut list = LruList::new();
        list.push_front("a");
        list.push_front("b");
        list.push_front("c");
        assert_eq!(order(&list), vec!["c", "b", "a"]);
        assert_eq!(list.get(list.tail().unwrap()), Some(&"a"));
    }

    #[test]
    fn promote_moves_to_head() {
        let mut list = LruList::new();
        let a = list.push_front("a");
        list.push_front("b");
        list.push_front("c");
        list.promote(a);
        assert_eq!(order(&list), vec!["a", "c", "b"]);
        assert_eq!(list.get(list.tail().unwrap()), Some(&"b"));
    }

    #[test]
    fn remove_relinks_neighbours_and_recycles_slot() {
        let mut list = LruList::new();
        list.push_front("a");
        let b = list.push_front("b");
        list.push_front("c");
        assert_eq!(list.remove(b), Some("b"));
        assert_eq!(list.remove(b), None);
        assert_eq!(order(&list), vec!["c", "a"]);
        assert_eq!(list.len(), 2);

        let d = list.push_front("d");
        assert_eq!(d, b);
        assert_eq!(order(&list), vec!["d", "c", "a"]);
    }

    #[test]
    fn removing_last_entry_empties_list() {
        let mut list = LruList::new();
        let a = list.push_front("a");
        list.remove(a);
        assert!(list.is_empty());
        assert_eq!(list.head(), None);
        assert_eq!(list.tail(), None);
    }
}
