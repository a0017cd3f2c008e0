//! Open-chaining hash table with a small inline bucket array.
//!
//! Tables start with [`SMALL_TABLE_SIZE`] buckets stored inline and grow by a
//! factor of four, rehashing every entry, once the average chain length
//! reaches [`REBUILD_MULTIPLIER`].

use std::borrow::Borrow;

use smallvec::SmallVec;

pub const SMALL_TABLE_SIZE: usize = 4;
/// Average entries per bucket that triggers a rebuild.
pub const REBUILD_MULTIPLIER: usize = 3;

const INITIAL_DOWN_SHIFT: u32 = 28;
const INITIAL_MASK: usize = 0x3;

/// How a key is compared and hashed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyKind {
    /// Variable-length string, compared by content.
    String,
    /// A single machine word, compared by identity.
    OneWord,
    /// A fixed number of 32-bit words, compared elementwise.
    MultiWord(usize),
}

/// A key type the table knows how to hash into its bucket array.
///
/// `down_shift` and `mask` describe the current bucket array: the result
/// must be `<= mask`.
pub trait HashKey: Eq {
    const KIND: KeyKind;

    fn hash_index(&self, down_shift: u32, mask: usize) -> usize;
}

fn random_index(i: usize, down_shift: u32, mask: usize) -> usize {
    (i.wrapping_mul(1103515245) >> down_shift) & mask
}

impl HashKey for str {
    const KIND: KeyKind = KeyKind::String;

    fn hash_index(&self, _down_shift: u32, mask: usize) -> usize {
        let hash = self
            .bytes()
            .fold(0u32, |hash, b| hash.wrapping_mul(9).wrapping_add(u32::from(b)));
        hash as usize & mask
    }
}

impl HashKey for String {
    const KIND: KeyKind = KeyKind::String;

    fn hash_index(&self, down_shift: u32, mask: usize) -> usize {
        self.as_str().hash_index(down_shift, mask)
    }
}

impl HashKey for usize {
    const KIND: KeyKind = KeyKind::OneWord;

    fn hash_index(&self, down_shift: u32, mask: usize) -> usize {
        random_index(*self, down_shift, mask)
    }
}

impl<const N: usize> HashKey for [u32; N] {
    const KIND: KeyKind = KeyKind::MultiWord(N);

    fn hash_index(&self, down_shift: u32, mask: usize) -> usize {
        let sum = self
            .iter()
            .fold(0usize, |sum, &word| sum.wrapping_add(word as usize));
        random_index(sum, down_shift, mask)
    }
}

struct TableEntry<K, V> {
    key: K,
    value: V,
    next: Option<Box<TableEntry<K, V>>>,
}

type Chain<K, V> = Option<Box<TableEntry<K, V>>>;

pub struct HashTable<K, V> {
    buckets: SmallVec<[Chain<K, V>; SMALL_TABLE_SIZE]>,
    num_entries: usize,
    rebuild_size: usize,
    down_shift: u32,
    mask: usize,
}

impl<K: HashKey, V> Default for HashTable<K, V> {
    fn default() -> Self {
        Self::new()
    }
}

impl<K: HashKey, V> HashTable<K, V> {
    pub fn new() -> Self {
        Self {
            buckets: empty_buckets(SMALL_TABLE_SIZE),
            num_entries: 0,
            rebuild_size: SMALL_TABLE_SIZE * REBUILD_MULTIPLIER,
            down_shift: INITIAL_DOWN_SHIFT,
            mask: INITIAL_MASK,
        }
    }

    pub fn key_kind(&self) -> KeyKind {
        K::KIND
    }

    /// Insert `value` under `key`, returning the value it replaced.
    pub fn add(&mut self, key: K, value: V) -> Option<V> {
        let index = self.index_for(&key);
        if let Some(entry) = find_mut(&mut self.buckets[index], &key) {
            return Some(std::mem::replace(&mut entry.value, value));
        }

        let next = self.buckets[index].take();
        self.buckets[index] = Some(Box::new(TableEntry { key, value, next }));
        self.num_entries += 1;

        if self.num_entries >= self.rebuild_size {
            self.rebuild();
        }
        None
    }

    /// Remove `key`, returning its value.
    pub fn remove<Q>(&mut self, key: &Q) -> Option<V>
    where
        K: Borrow<Q>,
        Q: HashKey + ?Sized,
    {
        let index = self.index_for(key);
        let mut cursor = &mut self.buckets[index];
        while cursor
            .as_ref()
            .is_some_and(|entry| entry.key.borrow() != key)
        {
            cursor = match cursor {
                Some(entry) => &mut entry.next,
                None => break,
            };
        }

        let mut removed = cursor.take()?;
        *cursor = removed.next.take();
        self.num_entries -= 1;
        Some(removed.value)
    }

    pub fn lookup<Q>(&self, key: &Q) -> Option<&V>
    where
        K: Borrow<Q>,
        Q: HashKey + ?Sized,
    {
        let index = self.index_for(key);
        let mut cursor = self.buckets[index].as_deref();
        while let Some(entry) = cursor {
            if entry.key.borrow() == key {
                return Some(&entry.value);
            }
            cursor = entry.next.as_deref();
        }
        None
    }

    pub fn lookup_mut<Q>(&mut self, key: &Q) -> Option<&mut V>
    where
        K: Borrow<Q>,
        Q: HashKey + ?Sized,
    {
        let index = self.index_for(key);
        find_mut(&mut self.buckets[index], key).map(|entry| &mut entry.value)
    }

    pub fn contains_key<Q>(&self, key: &Q) -> bool
    where
        K: Borrow<Q>,
        Q: HashKey + ?Sized,
    {
        self.lookup(key).is_some()
    }

    pub fn entry_count(&self) -> usize {
        self.num_entries
    }

    pub fn is_empty(&self) -> bool {
        self.num_entries == 0
    }

    pub fn bucket_count(&self) -> usize {
        self.buckets.len()
    }

    /// The first value in iteration order.
    pub fn get_first(&self) -> Option<&V> {
        self.iter().next().map(|(_, value)| value)
    }

    /// Remove and return the first entry in iteration order.
    pub fn remove_next(&mut self) -> Option<(K, V)> {
        let chain = self.buckets.iter_mut().find(|chain| chain.is_some())?;
        let mut removed = chain.take()?;
        *chain = removed.next.take();
        self.num_entries -= 1;
        Some((removed.key, removed.value))
    }

    /// Entries in bucket order, most recently inserted first within a bucket.
    /// The order is unrelated across a rebuild.
    pub fn iter(&self) -> Iter<'_, K, V> {
        Iter {
            buckets: &self.buckets,
            next_index: 0,
            next_entry: None,
        }
    }

    fn index_for<Q: HashKey + ?Sized>(&self, key: &Q) -> usize {
        key.hash_index(self.down_shift, self.mask)
    }

    fn rebuild(&mut self) {
        let new_size = self.buckets.len() * 4;
        let old = std::mem::replace(&mut self.buckets, empty_buckets(new_size));
        self.rebuild_size *= 4;
        self.down_shift = self.down_shift.saturating_sub(2);
        self.mask = (self.mask << 2) | 0x3;

        for mut chain in old {
            while let Some(mut entry) = chain {
                chain = entry.next.take();
                let index = self.index_for(&entry.key);
                entry.next = self.buckets[index].take();
                self.buckets[index] = Some(entry);
            }
        }

        tracing::trace!(buckets = new_size, entries = self.num_entries, "hash table rebuilt");
    }
}

fn empty_buckets<K, V>(len: usize) -> SmallVec<[Chain<K, V>; SMALL_TABLE_SIZE]> {
    std::iter::repeat_with(|| None).take(len).collect()
}

fn find_mut<'a, K, V, Q>(chain: &'a mut Chain<K, V>, key: &Q) -> Option<&'a mut TableEntry<K, V>>
where
    K: Borrow<Q>,
    Q: Eq + ?Sized,
{
    let mut cursor = chain.as_deref_mut();
    while let Some(entry) = cursor {
        if entry.key.borrow() == key {
            return Some(entry);
        }
        cursor = entry.next.as_deref_mut();
    }
    None
}

impl<K, V> Drop for HashTable<K, V> {
    // unlink chains iteratively so long chains don't recurse on drop
    fn drop(&mut self) {
        for chain in self.buckets.iter_mut() {
            let mut next = chain.take();
            while let Some(mut entry) = next {
                next = entry.next.take();
            }
        }
    }
}

pub struct Iter<'a, K, V> {
    buckets: &'a [Chain<K, V>],
    next_index: usize,
    next_entry: Option<&'a TableEntry<K, V>>,
}

impl<'a, K, V> Iterator for Iter<'a, K, V> {
    type Item = (&'a K, &'a V);

    fn next(&mut self) -> Option<Self::Item> {
        while self.next_entry.is_none() {
            let chain = self.buckets.get(self.next_index)?;
            self.next_index += 1;
            self.next_entry = chain.as_deref();
        }

        let entry = self.next_entry?;
        self.next_entry = entry.next.as_deref();
        Some((&entry.key, &entry.value))
    }
}

impl<'a, K: HashKey, V> IntoIterator for &'a HashTable<K, V> {
    type Item = (&'a K, &'a V);
    type IntoIter = Iter<'a, K, V>;

    fn into_iter(self) -> Self::IntoIter {
        self.iter()
    }
}
