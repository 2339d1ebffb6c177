// Algorithm-selection cache
//
// Picking a native convolution algorithm means benchmarking every candidate,
// which costs far more than the convolution itself. Spatial shapes and
// channel counts are fixed after setup, so the choice depends only on the
// local mini-batch width: each width is tuned once and the token reused.
//
// Entries are never evicted. A run sees very few distinct widths (the full
// batch and a trailing partial batch).
//
// Lookup and insertion happen under one lock, so two threads hitting the
// same new width run the query once.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Mutex, MutexGuard, PoisonError};

use kiln_core::Result;
use log::{debug, trace};

/// Maps local mini-batch width to an algorithm token.
pub struct AlgorithmCache<A> {
    operation: &'static str,
    entries: Mutex<HashMap<usize, A>>,
}

impl<A: Copy + fmt::Debug> AlgorithmCache<A> {
    /// An empty cache; `operation` names the convolution it tunes in logs.
    pub fn new(operation: &'static str) -> Self {
        AlgorithmCache {
            operation,
            entries: Mutex::new(HashMap::new()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<usize, A>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Cached token for `width`, or the result of `select` stored under it.
    ///
    /// A failed selection leaves the cache unchanged.
    pub fn get_or_try_insert_with<F>(&self, width: usize, select: F) -> Result<A>
    where
        F: FnOnce() -> Result<A>,
    {
        let mut entries = self.lock();
        if let Some(&algo) = entries.get(&width) {
            trace!("{} algorithm cache hit: width {width} -> {algo:?}", self.operation);
            return Ok(algo);
        }
        let algo = select()?;
        debug!("{} algorithm selected for width {width}: {algo:?}", self.operation);
        entries.insert(width, algo);
        Ok(algo)
    }

    pub fn get(&self, width: usize) -> Option<A> {
        self.lock().get(&width).copied()
    }

    pub fn insert(&self, width: usize, algo: A) {
        self.lock().insert(width, algo);
    }

    pub fn contains(&self, width: usize) -> bool {
        self.lock().contains_key(&width)
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    pub fn clear(&self) {
        self.lock().clear();
    }
}

impl<A: Copy + fmt::Debug> Clone for AlgorithmCache<A> {
    fn clone(&self) -> Self {
        AlgorithmCache {
            operation: self.operation,
            entries: Mutex::new(self.lock().clone()),
        }
    }
}

impl<A: Copy + fmt::Debug> fmt::Debug for AlgorithmCache<A> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AlgorithmCache")
            .field("operation", &self.operation)
            .field("entries", &*self.lock())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kiln_core::Error;
    use std::cell::Cell;

    #[test]
    fn selects_once_per_width() -> Result<()> {
        let cache = AlgorithmCache::new("forward");
        let queries = Cell::new(0);
        let select = |algo: u32| {
            let queries = &queries;
            move || {
                queries.set(queries.get() + 1);
                Ok(algo)
            }
        };
        assert_eq!(cache.get_or_try_insert_with(32, select(1))?, 1);
        assert_eq!(cache.get_or_try_insert_with(32, select(2))?, 1);
        assert_eq!(queries.get(), 1);

        assert_eq!(cache.get_or_try_insert_with(7, select(3))?, 3);
        assert_eq!(cache.get_or_try_insert_with(7, select(4))?, 3);
        assert_eq!(queries.get(), 2);
        assert_eq!(cache.len(), 2);
        Ok(())
    }

    #[test]
    fn failed_selection_is_not_cached() {
        let cache: AlgorithmCache<u32> = AlgorithmCache::new("forward");
        assert!(cache
            .get_or_try_insert_with(4, || Err(Error::msg("no algorithm")))
            .is_err());
        assert!(!cache.contains(4));
        assert!(cache.is_empty());
    }

    #[test]
    fn clones_evolve_independently() {
        let cache = AlgorithmCache::new("backward filter");
        cache.insert(16, 5u32);
        let copy = cache.clone();
        copy.insert(8, 6);
        assert_eq!(copy.get(16), Some(5));
        assert!(!cache.contains(8));
    }
}
