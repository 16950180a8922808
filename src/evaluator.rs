use std::collections::BTreeMap;

use parking_lot::{Condvar, Mutex};

use crate::cpv::Cpv;
use crate::eclass::EclassCache;
use crate::error::{Error, Result};

/// Something that can source a package's build script and report its
/// metadata variables.
///
/// The returned map must carry the plain metadata keys (`DEPEND`, `SLOT`,
/// ...) and `INHERITED` as a space separated eclass list.
pub trait Evaluator: Send {
    fn get_keys(&mut self, cpv: &Cpv, eclasses: &EclassCache) -> Result<BTreeMap<String, String>>;
}

impl<F> Evaluator for F
where
    F: FnMut(&Cpv, &EclassCache) -> Result<BTreeMap<String, String>> + Send,
{
    fn get_keys(&mut self, cpv: &Cpv, eclasses: &EclassCache) -> Result<BTreeMap<String, String>> {
        self(cpv, eclasses)
    }
}

/// A pool of reusable evaluators.
pub trait EvaluatorPool: Send + Sync {
    /// Take an evaluator, blocking until one is available.
    fn acquire(&self) -> Result<Box<dyn Evaluator>>;

    /// Hand an evaluator back.
    fn release(&self, evaluator: Box<dyn Evaluator>);
}

/// An evaluator checked out of a pool; returned on drop.
pub struct EvaluatorGuard<'a> {
    pool: &'a dyn EvaluatorPool,
    evaluator: Option<Box<dyn Evaluator>>,
}

impl<'a> EvaluatorGuard<'a> {
    /// Acquire an evaluator, blocking until the pool has one.
    pub fn checkout(pool: &'a dyn EvaluatorPool) -> Result<Self> {
        let evaluator = pool.acquire()?;
        Ok(EvaluatorGuard {
            pool,
            evaluator: Some(evaluator),
        })
    }

    /// Run the checked-out evaluator for `cpv`.
    pub fn get_keys(&mut self, cpv: &Cpv, eclasses: &EclassCache) -> Result<BTreeMap<String, String>> {
        match self.evaluator.as_mut() {
            Some(evaluator) => evaluator.get_keys(cpv, eclasses),
            None => Err(Error::Evaluator {
                package: cpv.to_string(),
                message: "evaluator already released".to_string(),
            }),
        }
    }
}

impl Drop for EvaluatorGuard<'_> {
    fn drop(&mut self) {
        if let Some(evaluator) = self.evaluator.take() {
            self.pool.release(evaluator);
        }
    }
}

type Spawner = Box<dyn Fn() -> Result<Box<dyn Evaluator>> + Send + Sync>;

struct PoolState {
    idle: Vec<Box<dyn Evaluator>>,
    live: usize,
}

/// Pool that spawns evaluators on demand, up to a fixed number.
pub struct BoundedPool {
    spawn: Spawner,
    max: usize,
    state: Mutex<PoolState>,
    available: Condvar,
}

impl BoundedPool {
    /// A pool holding at most `max` evaluators (at least one).
    pub fn new<F>(max: usize, spawn: F) -> Self
    where
        F: Fn() -> Result<Box<dyn Evaluator>> + Send + Sync + 'static,
    {
        BoundedPool {
            spawn: Box::new(spawn),
            max: max.max(1),
            state: Mutex::new(PoolState {
                idle: Vec::new(),
                live: 0,
            }),
            available: Condvar::new(),
        }
    }

    /// Number of evaluators spawned so far and not lost to a failed spawn.
    pub fn live(&self) -> usize {
        self.state.lock().live
    }

    /// Evaluators waiting to be checked out.
    pub fn idle(&self) -> usize {
        self.state.lock().idle.len()
    }
}

impl EvaluatorPool for BoundedPool {
    fn acquire(&self) -> Result<Box<dyn Evaluator>> {
        let mut state = self.state.lock();
        loop {
            if let Some(evaluator) = state.idle.pop() {
                return Ok(evaluator);
            }
            if state.live < self.max {
                state.live += 1;
                drop(state);
                return match (self.spawn)() {
                    Ok(evaluator) => Ok(evaluator),
                    Err(e) => {
                        self.state.lock().live -= 1;
                        self.available.notify_one();
                        Err(e)
                    }
                };
            }
            self.available.wait(&mut state);
        }
    }

    fn release(&self, evaluator: Box<dyn Evaluator>) {
        self.state.lock().idle.push(evaluator);
        self.available.notify_one();
    }
}
