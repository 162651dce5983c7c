//! Fixed-size hash table with circular per-bucket chains.
//!
//! Each bucket is the head of a circular singly-linked chain: an empty bucket
//! links to itself, and the last node of a chain links back to its bucket
//! rather than to a null terminator. Removing a node walks its chain from the
//! bucket to find the predecessor, so nodes never need a back pointer.
//!
//! Nodes live in a [`SlotMap`] arena and are addressed by [`NodeId`]. The
//! table never resizes; callers size it for the expected load when they
//! create it.

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};

use slotmap::{new_key_type, SlotMap};

use crate::error::{Error, Result};

new_key_type! {
    /// Handle to a node stored in an [`HTable`].
    pub struct NodeId;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Link {
    Bucket(usize),
    Node(NodeId),
}

#[derive(Debug)]
struct Node<T> {
    bucket: usize,
    next: Link,
    value: T,
}

/// Open-chained hash table keyed by a caller-computed hash.
#[derive(Debug)]
pub struct HTable<T> {
    buckets: Vec<Link>,
    nodes: SlotMap<NodeId, Node<T>>,
}

/// Hash a string key for use with [`HTable`].
pub fn hash_str(key: &str) -> u64 {
    let mut hasher = DefaultHasher::new();
    key.hash(&mut hasher);
    hasher.finish()
}

impl<T> HTable<T> {
    /// Create a table with a fixed number of buckets.
    pub fn new(buckets: usize) -> Result<Self> {
        if buckets == 0 {
            return Err(Error::Param("hash table needs at least one bucket".into()));
        }

        let mut slots = Vec::new();
        slots.try_reserve_exact(buckets).map_err(|_| Error::Memory)?;
        slots.extend((0..buckets).map(Link::Bucket));

        Ok(Self {
            buckets: slots,
            nodes: SlotMap::with_key(),
        })
    }

    pub fn bucket_count(&self) -> usize {
        self.buckets.len()
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// True when the bucket chain is a bare self-loop.
    pub fn is_bucket_empty(&self, bucket: usize) -> bool {
        self.buckets[bucket] == Link::Bucket(bucket)
    }

    /// True if `id` is currently linked into this table.
    pub fn contains(&self, id: NodeId) -> bool {
        self.nodes.contains_key(id)
    }

    pub fn get(&self, id: NodeId) -> Option<&T> {
        self.nodes.get(id).map(|node| &node.value)
    }

    pub fn get_mut(&mut self, id: NodeId) -> Option<&mut T> {
        self.nodes.get_mut(id).map(|node| &mut node.value)
    }

    fn bucket_of(&self, hash: u64) -> usize {
        (hash % self.buckets.len() as u64) as usize
    }

    fn next_of(&self, link: Link) -> Link {
        match link {
            Link::Bucket(b) => self.buckets[b],
            Link::Node(id) => self.nodes[id].next,
        }
    }

    fn set_next(&mut self, link: Link, next: Link) {
        match link {
            Link::Bucket(b) => self.buckets[b] = next,
            Link::Node(id) => self.nodes[id].next = next,
        }
    }

    /// Insert `value` at the head of the chain for `hash`.
    pub fn add(&mut self, hash: u64, value: T) -> NodeId {
        let bucket = self.bucket_of(hash);
        let next = self.buckets[bucket];
        let id = self.nodes.insert(Node { bucket, next, value });
        self.buckets[bucket] = Link::Node(id);
        id
    }

    /// Insert `value` right after `existing`, in the same chain.
    ///
    /// Returns `None` if `existing` is not in the table.
    pub fn insert_after(&mut self, existing: NodeId, value: T) -> Option<NodeId> {
        let prev = self.nodes.get(existing)?;
        let bucket = prev.bucket;
        let next = prev.next;

        let id = self.nodes.insert(Node { bucket, next, value });
        self.nodes[existing].next = Link::Node(id);
        Some(id)
    }

    /// Unlink `id` from its chain and return its value.
    pub fn remove(&mut self, id: NodeId) -> Option<T> {
        let node = self.nodes.get(id)?;
        let head = Link::Bucket(node.bucket);
        let after = node.next;

        let mut cur = head;
        loop {
            let next = self.next_of(cur);
            if next == Link::Node(id) {
                self.set_next(cur, after);
                break;
            }
            // Every node is reachable from its own bucket.
            debug_assert_ne!(next, head, "node missing from its chain");
            if next == head {
                break;
            }
            cur = next;
        }

        self.nodes.remove(id).map(|node| node.value)
    }

    /// Iterate the chain holding every node added under `hash`.
    ///
    /// The chain may also hold nodes whose hash collides on the same bucket,
    /// callers compare their own keys.
    pub fn get_head(&self, hash: u64) -> Chain<'_, T> {
        let bucket = self.bucket_of(hash);
        Chain {
            table: self,
            head: Link::Bucket(bucket),
            cur: self.buckets[bucket],
        }
    }

    /// Iterate every node, bucket by bucket.
    pub fn iter(&self) -> impl Iterator<Item = (NodeId, &T)> + '_ {
        (0..self.buckets.len()).flat_map(move |bucket| Chain {
            table: self,
            head: Link::Bucket(bucket),
            cur: self.buckets[bucket],
        })
    }

    /// Drop every node and reset each bucket to a self-loop.
    pub fn clear(&mut self) {
        self.nodes.clear();
        for (i, link) in self.buckets.iter_mut().enumerate() {
            *link = Link::Bucket(i);
        }
    }
}

/// Iterator over one bucket chain.
pub struct Chain<'a, T> {
    table: &'a HTable<T>,
    head: Link,
    cur: Link,
}

impl<'a, T> Iterator for Chain<'a, T> {
    type Item = (NodeId, &'a T);

    fn next(&mut self) -> Option<Self::Item> {
        if self.cur == self.head {
            return None;
        }
        let Link::Node(id) = self.cur else {
            return None;
        };
        let node = &self.table.nodes[id];
        self.cur = node.next;
        Some((id, &node.value))
    }
}
