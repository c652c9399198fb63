//! Compiled-program cache keyed by expression text.
//!
//! Sharded read-mostly maps plus striped compile locks: a lookup only takes the
//! read lock of its shard, so it never waits on an unrelated compilation. A miss
//! takes the stripe lock for its key and re-checks before compiling, which means a
//! given expression text is compiled at most once even when many callers hit it
//! first at the same time. Entries live as long as the cache; the number of
//! distinct expressions is bounded by the rule catalog.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use tracing::debug;
use xxhash_rust::xxh3::xxh3_64;

use crate::error::AuthzResult;

const N_SHARDS: usize = 16;
const N_LOCKS: usize = 64;

struct Shard<P> {
    map: RwLock<HashMap<String, Arc<P>>>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStats {
    pub entries: usize,
    pub compiles: u64,
    pub hits: u64,
}

pub struct ProgramCache<P> {
    shards: Vec<Shard<P>>,
    compile_locks: Vec<Mutex<()>>,
    compiles: AtomicU64,
    hits: AtomicU64,
}

impl<P> Default for ProgramCache<P> {
    fn default() -> Self {
        Self::new()
    }
}

impl<P> std::fmt::Debug for ProgramCache<P> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProgramCache").field("stats", &self.stats()).finish()
    }
}

impl<P> ProgramCache<P> {
    pub fn new() -> Self {
        let mut shards = Vec::with_capacity(N_SHARDS);
        for _ in 0..N_SHARDS { shards.push(Shard { map: RwLock::new(HashMap::new()) }); }
        let mut compile_locks = Vec::with_capacity(N_LOCKS);
        for _ in 0..N_LOCKS { compile_locks.push(Mutex::new(())); }
        Self { shards, compile_locks, compiles: AtomicU64::new(0), hits: AtomicU64::new(0) }
    }

    #[inline]
    fn shard_idx(expression: &str) -> usize { (xxh3_64(expression.as_bytes()) as usize) & (N_SHARDS - 1) }
    #[inline]
    fn lock_idx(expression: &str) -> usize { ((xxh3_64(expression.as_bytes()) >> 32) as usize) & (N_LOCKS - 1) }

    pub fn get(&self, expression: &str) -> Option<Arc<P>> {
        self.shards[Self::shard_idx(expression)].map.read().get(expression).cloned()
    }

    /// Return the cached program for `expression`, compiling it with `compile` on first use.
    /// A failed compilation is not cached; the next caller will try again and fail the same way.
    pub fn get_or_compile<F>(&self, expression: &str, compile: F) -> AuthzResult<Arc<P>>
    where
        F: FnOnce(&str) -> AuthzResult<P>,
    {
        let si = Self::shard_idx(expression);
        if let Some(p) = self.shards[si].map.read().get(expression).cloned() {
            self.hits.fetch_add(1, Ordering::Relaxed);
            return Ok(p);
        }
        let _g = self.compile_locks[Self::lock_idx(expression)].lock();
        // Recheck after acquiring the stripe lock
        if let Some(p) = self.shards[si].map.read().get(expression).cloned() {
            self.hits.fetch_add(1, Ordering::Relaxed);
            return Ok(p);
        }
        debug!(target: "authz", "compiling expression: {}", expression);
        let program = Arc::new(compile(expression)?);
        self.compiles.fetch_add(1, Ordering::Relaxed);
        self.shards[si].map.write().insert(expression.to_string(), program.clone());
        Ok(program)
    }

    pub fn len(&self) -> usize {
        self.shards.iter().map(|s| s.map.read().len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            entries: self.len(),
            compiles: self.compiles.load(Ordering::Relaxed),
            hits: self.hits.load(Ordering::Relaxed),
        }
    }
}
