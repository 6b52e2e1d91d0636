//! Bounded worker pools for the engine.
//!
//! The batch verbs fan out one task per independent sub-tree. A task may
//! spawn further tasks for deeper sub-trees and the batch joins them all at
//! the end, so the pool must let a running task schedule and wait on its
//! descendants without deadlock. Structured scopes over a work-stealing pool
//! give exactly that: `scope` returns only when every transitively spawned
//! task has finished, and a worker that reaches the join steals pending
//! tasks instead of blocking a slot.

use crate::Error;
use std::sync::Arc;

pub struct WorkerPool {
    pool: rayon::ThreadPool,
}

impl WorkerPool {
    pub fn new(threads: usize) -> Result<WorkerPool, Error> {
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(threads.max(1))
            .build()
            .map_err(|e| Error::AssertionFailed("worker pool construction failed").with_context(e.to_string()))?;
        Ok(WorkerPool { pool })
    }

    pub fn threads(&self) -> usize {
        self.pool.current_num_threads()
    }

    /// Runs `op` on the pool; `op` and anything it spawns complete before
    /// this returns.
    pub fn scope<'scope, OP, T>(&self, op: OP) -> T
    where
        OP: FnOnce(&rayon::Scope<'scope>) -> T + Send + 'scope,
        T: Send,
    {
        self.pool.scope(op)
    }
}

/// The façade wires one pool for tree traversal and one for bulk I/O walks.
pub struct WorkerPools {
    pub cpu: WorkerPool,
    pub io: WorkerPool,
}

impl WorkerPools {
    pub fn new(cpu_threads: usize, io_threads: usize) -> Result<Arc<WorkerPools>, Error> {
        Ok(Arc::new(WorkerPools {
            cpu: WorkerPool::new(cpu_threads)?,
            io: WorkerPool::new(io_threads)?,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Mutex;

    #[test]
    fn scope_joins_all_spawned_tasks() {
        let pool = WorkerPool::new(4).unwrap();
        let counter = AtomicU32::new(0);
        pool.scope(|s| {
            for _ in 0..100 {
                s.spawn(|_| {
                    counter.fetch_add(1, Ordering::SeqCst);
                });
            }
        });
        assert_eq!(counter.load(Ordering::SeqCst), 100);
    }

    #[test]
    fn nested_spawn_does_not_deadlock() {
        // a task spawning sub-tasks and joining at the scope must complete
        // even on a single-thread pool
        let pool = WorkerPool::new(1).unwrap();
        let log = Mutex::new(Vec::new());
        pool.scope(|s| {
            s.spawn(|s| {
                log.lock().unwrap().push("parent");
                s.spawn(|s| {
                    log.lock().unwrap().push("child");
                    s.spawn(|_| {
                        log.lock().unwrap().push("grandchild");
                    });
                });
            });
        });
        let log = log.into_inner().unwrap();
        assert_eq!(log.len(), 3);
        assert_eq!(log[0], "parent");
    }

    #[test]
    fn scope_returns_value() {
        let pool = WorkerPool::new(2).unwrap();
        let n = pool.scope(|_| 17);
        assert_eq!(n, 17);
    }
}
