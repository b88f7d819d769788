//! A small bounded connection pool.
//!
//! Connections are opened lazily up to `capacity`. The free list lives behind a
//! mutex; [`ConnectionPool::acquire`] parks on a condvar when every connection is
//! checked out. A [`PooledConnection`] is owned by exactly one worker and goes back
//! to the free list when dropped.

use log::debug;
use std::ops::{Deref, DerefMut};
use std::sync::{Condvar, Mutex, MutexGuard, PoisonError};

type Connector<C> = Box<dyn Fn() -> Result<C, String> + Send + Sync>;

struct PoolState<C> {
    idle: Vec<C>,
    /// Connections currently open, idle or checked out.
    open: usize,
}

pub struct ConnectionPool<C> {
    state: Mutex<PoolState<C>>,
    available: Condvar,
    capacity: usize,
    connect: Connector<C>,
}

impl<C> ConnectionPool<C> {
    pub fn new<F>(capacity: usize, connect: F) -> Self
    where
        F: Fn() -> Result<C, String> + Send + Sync + 'static,
    {
        ConnectionPool {
            state: Mutex::new(PoolState {
                idle: Vec::with_capacity(capacity),
                open: 0,
            }),
            available: Condvar::new(),
            capacity: capacity.max(1),
            connect: Box::new(connect),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    fn lock(&self) -> MutexGuard<'_, PoolState<C>> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Check out a connection, blocking until one is free.
    pub fn acquire(&self) -> Result<PooledConnection<'_, C>, String> {
        let mut state = self.lock();
        loop {
            if let Some(conn) = state.idle.pop() {
                return Ok(PooledConnection::new(self, conn));
            }
            if state.open < self.capacity {
                state.open += 1;
                let opened = state.open;
                drop(state);
                return match (self.connect)() {
                    Ok(conn) => {
                        debug!("Pool: opened connection {}/{}", opened, self.capacity);
                        Ok(PooledConnection::new(self, conn))
                    }
                    Err(e) => {
                        self.lock().open -= 1;
                        self.available.notify_one();
                        Err(e)
                    }
                };
            }
            state = self.available.wait(state).unwrap_or_else(PoisonError::into_inner);
        }
    }

    fn release(&self, conn: C) {
        self.lock().idle.push(conn);
        self.available.notify_one();
    }

    fn forget(&self) {
        self.lock().open -= 1;
        self.available.notify_one();
    }

    pub fn idle_count(&self) -> usize {
        self.lock().idle.len()
    }
}

pub struct PooledConnection<'p, C> {
    pool: &'p ConnectionPool<C>,
    conn: Option<C>,
}

impl<'p, C> PooledConnection<'p, C> {
    fn new(pool: &'p ConnectionPool<C>, conn: C) -> Self {
        PooledConnection { pool, conn: Some(conn) }
    }

    /// Close this connection instead of returning it, e.g. after it broke mid-transaction.
    pub fn discard(mut self) {
        if self.conn.take().is_some() {
            self.pool.forget();
        }
    }
}

impl<C> Deref for PooledConnection<'_, C> {
    type Target = C;

    fn deref(&self) -> &C {
        // only `discard` and `drop` take the connection, both consume `self`
        match self.conn.as_ref() {
            Some(c) => c,
            None => unreachable!("pooled connection used after release"),
        }
    }
}

impl<C> DerefMut for PooledConnection<'_, C> {
    fn deref_mut(&mut self) -> &mut C {
        match self.conn.as_mut() {
            Some(c) => c,
            None => unreachable!("pooled connection used after release"),
        }
    }
}

impl<C> Drop for PooledConnection<'_, C> {
    fn drop(&mut self) {
        if let Some(conn) = self.conn.take() {
            self.pool.release(conn);
        }
    }
}
