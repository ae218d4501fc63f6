use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use bytes::Bytes;
use parking_lot::Mutex;

use crate::peer::PieceId;

/// Least-recently-used cache of verified pieces with a byte budget.
///
/// The cache is only an acceleration layer: every entry also exists on disk,
/// so eviction never loses data. Pieces larger than the whole budget are not
/// cached at all.
pub struct PieceCache {
    lru: Mutex<LruList>,
    capacity: usize,
}

struct LruList {
    order: VecDeque<PieceId>,
    data: HashMap<PieceId, Bytes>,
    memory_used: usize,
}

impl LruList {
    fn new() -> Self {
        Self {
            order: VecDeque::new(),
            data: HashMap::new(),
            memory_used: 0,
        }
    }

    fn insert(&mut self, key: PieceId, data: Bytes) {
        self.memory_used += data.len();
        if let Some(old) = self.data.insert(key.clone(), data) {
            self.memory_used -= old.len();
            self.move_to_back(&key);
        } else {
            self.order.push_back(key);
        }
    }

    fn pop_front(&mut self) -> Option<(PieceId, Bytes)> {
        while let Some(key) = self.order.pop_front() {
            if let Some(data) = self.data.remove(&key) {
                self.memory_used -= data.len();
                return Some((key, data));
            }
        }
        None
    }

    fn move_to_back(&mut self, key: &PieceId) {
        if self.data.contains_key(key) {
            self.order.retain(|k| k != key);
            self.order.push_back(key.clone());
        }
    }
}

impl PieceCache {
    /// Creates a cache holding at most `capacity` bytes of piece data.
    pub fn new(capacity: usize) -> Arc<Self> {
        Arc::new(Self {
            lru: Mutex::new(LruList::new()),
            capacity,
        })
    }

    /// Returns the cached piece and marks it most recently used.
    pub fn get(&self, key: &PieceId) -> Option<Bytes> {
        let mut lru = self.lru.lock();
        let data = lru.data.get(key).cloned()?;
        lru.move_to_back(key);
        Some(data)
    }

    /// Inserts a piece, evicting least recently used entries over budget.
    pub fn insert(&self, key: PieceId, data: Bytes) {
        if data.len() > self.capacity {
            return;
        }

        let mut lru = self.lru.lock();
        lru.insert(key, data);
        while lru.memory_used > self.capacity {
            match lru.pop_front() {
                Some((evicted, _)) => tracing::trace!("evicted piece {} from cache", evicted),
                None => break,
            }
        }
    }

    pub fn contains(&self, key: &PieceId) -> bool {
        self.lru.lock().data.contains_key(key)
    }

    pub fn memory_used(&self) -> usize {
        self.lru.lock().memory_used
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.lru.lock().data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn piece(index: u32) -> PieceId {
        PieceId::new("file", index)
    }

    #[test]
    fn test_insert_and_get() {
        let cache = PieceCache::new(1024);
        cache.insert(piece(0), Bytes::from_static(b"abcd"));

        assert_eq!(cache.get(&piece(0)), Some(Bytes::from_static(b"abcd")));
        assert_eq!(cache.memory_used(), 4);
        assert!(cache.get(&piece(1)).is_none());
    }

    #[test]
    fn test_evicts_least_recently_used() {
        let cache = PieceCache::new(300);
        cache.insert(piece(0), Bytes::from(vec![0u8; 100]));
        cache.insert(piece(1), Bytes::from(vec![1u8; 100]));
        cache.insert(piece(2), Bytes::from(vec![2u8; 100]));

        // Touch piece 0 so piece 1 becomes the eviction candidate.
        assert!(cache.get(&piece(0)).is_some());
        cache.insert(piece(3), Bytes::from(vec![3u8; 100]));

        assert!(cache.contains(&piece(0)));
        assert!(!cache.contains(&piece(1)));
        assert!(cache.contains(&piece(2)));
        assert!(cache.contains(&piece(3)));
        assert_eq!(cache.memory_used(), 300);
    }

    #[test]
    fn test_replace_updates_memory() {
        let cache = PieceCache::new(1000);
        cache.insert(piece(0), Bytes::from(vec![0u8; 100]));
        cache.insert(piece(0), Bytes::from(vec![0u8; 40]));

        assert_eq!(cache.len(), 1);
        assert_eq!(cache.memory_used(), 40);
    }

    #[test]
    fn test_oversized_piece_not_cached() {
        let cache = PieceCache::new(10);
        cache.insert(piece(0), Bytes::from(vec![0u8; 11]));

        assert!(cache.is_empty());
        assert_eq!(cache.memory_used(), 0);
    }
}
