//! Bounded, lazily grown pool of interpreter instances.
//!
//! Instances are created on demand up to `capacity`; after that, `acquire` waits
//! for one to be released, up to the caller's deadline. A guard hands the
//! instance back on drop.

use std::fmt;
use std::ops::{Deref, DerefMut};
use std::time::Instant;

use parking_lot::{Condvar, Mutex};

use crate::error::{AuthzError, AuthzResult};

struct State<T> {
    idle: Vec<T>,
    created: usize,
}

type Factory<T> = Box<dyn Fn() -> AuthzResult<T> + Send + Sync>;

pub struct Pool<T> {
    state: Mutex<State<T>>,
    available: Condvar,
    capacity: usize,
    factory: Factory<T>,
}

impl<T> fmt::Debug for Pool<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let st = self.state.lock();
        f.debug_struct("Pool")
            .field("capacity", &self.capacity)
            .field("created", &st.created)
            .field("idle", &st.idle.len())
            .finish()
    }
}

impl<T> Pool<T> {
    pub fn new<F>(capacity: usize, factory: F) -> Self
    where
        F: Fn() -> AuthzResult<T> + Send + Sync + 'static,
    {
        Self {
            state: Mutex::new(State { idle: Vec::new(), created: 0 }),
            available: Condvar::new(),
            capacity: capacity.max(1),
            factory: Box::new(factory),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Number of instances created so far (idle or checked out).
    pub fn created(&self) -> usize {
        self.state.lock().created
    }

    pub fn idle(&self) -> usize {
        self.state.lock().idle.len()
    }

    /// Take an instance, creating one if under capacity, otherwise waiting for a
    /// release. Without a deadline the wait is unbounded.
    pub fn acquire(&self, deadline: Option<Instant>) -> AuthzResult<PoolGuard<'_, T>> {
        let mut st = self.state.lock();
        loop {
            if let Some(item) = st.idle.pop() {
                return Ok(PoolGuard { pool: self, item: Some(item) });
            }
            if st.created < self.capacity {
                st.created += 1;
                drop(st);
                return match (self.factory)() {
                    Ok(item) => Ok(PoolGuard { pool: self, item: Some(item) }),
                    Err(e) => {
                        self.forget_one();
                        Err(e)
                    }
                };
            }
            match deadline {
                Some(d) => {
                    let timed_out = self.available.wait_until(&mut st, d).timed_out();
                    if timed_out && st.idle.is_empty() && st.created >= self.capacity {
                        return Err(AuthzError::Pool(format!(
                            "no interpreter released before deadline ({} in use)",
                            st.created
                        )));
                    }
                }
                None => self.available.wait(&mut st),
            }
        }
    }

    fn release(&self, item: T) {
        self.state.lock().idle.push(item);
        self.available.notify_one();
    }

    /// Give up a slot so a fresh instance can be created in its place.
    fn forget_one(&self) {
        let mut st = self.state.lock();
        st.created = st.created.saturating_sub(1);
        drop(st);
        self.available.notify_one();
    }
}

pub struct PoolGuard<'a, T> {
    pool: &'a Pool<T>,
    item: Option<T>,
}

impl<T> PoolGuard<'_, T> {
    /// Drop the instance instead of returning it, e.g. after it was left in a bad state.
    pub fn discard(mut self) {
        self.item = None;
        self.pool.forget_one();
    }
}

impl<T> std::fmt::Debug for PoolGuard<'_, T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PoolGuard").field("held", &self.item.is_some()).finish()
    }
}

impl<T> Deref for PoolGuard<'_, T> {
    type Target = T;
    fn deref(&self) -> &T {
        // item is only None after discard(), which consumes the guard
        self.item.as_ref().unwrap_or_else(|| unreachable!("pool guard used after discard"))
    }
}

impl<T> DerefMut for PoolGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        self.item.as_mut().unwrap_or_else(|| unreachable!("pool guard used after discard"))
    }
}

impl<T> Drop for PoolGuard<'_, T> {
    fn drop(&mut self) {
        if let Some(item) = self.item.take() {
            self.pool.release(item);
        }
    }
}
