use std::sync::Arc;

use spin::Mutex;

use crate::{error::Error, Result};

struct AdmissionInner {
    max: usize,
    cur: Mutex<usize>,
}

/// Counts concurrent executions on this worker.
///
/// Admission is never queued: a request that does not fit fails immediately
/// with [`Error::WorkerBusy`] and the caller's scheduler is expected to
/// retry elsewhere. Exclusive admission claims every slot at once so the run
/// sees an otherwise idle machine.
#[derive(Clone)]
pub struct AdmissionGuard(Arc<AdmissionInner>);

impl AdmissionGuard {
    /// `max_threads == 0` means hardware concurrency.
    pub fn new(max_threads: usize) -> Self {
        let max = match max_threads {
            0 => std::thread::available_parallelism().map(|n| n.get()).unwrap_or(1),
            n => n,
        };
        AdmissionGuard(Arc::new(AdmissionInner {
            max,
            cur: Mutex::new(0),
        }))
    }

    pub fn max_threads(&self) -> usize {
        self.0.max
    }

    #[cfg(test)]
    fn in_flight(&self) -> usize {
        *self.0.cur.lock()
    }

    /// Claim one slot, or every slot when `exclusive`.
    pub fn admit(&self, exclusive: bool) -> Result<AdmissionPermit> {
        let mut cur = self.0.cur.lock();
        if exclusive {
            if *cur != 0 {
                return Err(Error::WorkerBusy { exclusive: true });
            }
            *cur = self.0.max;
        } else {
            if *cur >= self.0.max {
                return Err(Error::WorkerBusy { exclusive: false });
            }
            *cur += 1;
        }
        Ok(AdmissionPermit {
            guard: self.0.clone(),
            exclusive,
        })
    }
}

/// Scoped right to run; gives the slot(s) back on drop.
pub struct AdmissionPermit {
    guard: Arc<AdmissionInner>,
    exclusive: bool,
}

impl Drop for AdmissionPermit {
    fn drop(&mut self) {
        let mut cur = self.guard.cur.lock();
        *cur = if self.exclusive { 0 } else { *cur - 1 };
    }
}
