//! Background parsing on a bounded worker pool.

use crate::entity::EntityHandle;
use crate::packet::FormatError;
use anyhow::{Context, Result};
use log::debug;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::sync::{Arc, PoisonError};
use std::time::{Duration, Instant};

/// A finished `Entity::load`, handed back to the render thread.
pub struct LoadOutcome {
    pub handle: EntityHandle,
    pub result: Result<(), FormatError>,
    pub elapsed: Duration,
}

pub struct Loader {
    pool: rayon::ThreadPool,
    tx: Sender<LoadOutcome>,
    rx: Receiver<LoadOutcome>,
    in_flight: Arc<AtomicUsize>,
}

impl Loader {
    pub fn new(threads: usize) -> Result<Self> {
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(threads.max(1))
            .thread_name(|i| format!("calview-loader-{i}"))
            .build()
            .context("Failed to start loader threads")?;
        let (tx, rx) = mpsc::channel();
        Ok(Self { pool, tx, rx, in_flight: Arc::new(AtomicUsize::new(0)) })
    }

    pub fn threads(&self) -> usize {
        self.pool.current_num_threads()
    }

    /// Parses the entity behind `handle` on a worker, holding its lock for the duration.
    /// The outcome is delivered through [`Loader::drain`].
    pub fn spawn(&self, handle: EntityHandle) {
        let tx = self.tx.clone();
        self.in_flight.fetch_add(1, Ordering::SeqCst);
        self.pool.spawn(move || {
            let started = Instant::now();
            let result = {
                let mut entity = handle.lock().unwrap_or_else(PoisonError::into_inner);
                let result = entity.load();
                debug!("{}: parsed in {:.1} ms", entity.core().caption, started.elapsed().as_secs_f64() * 1000.0);
                result
            };
            // The receiver only goes away with the scene; a late result is dropped with it.
            let _ = tx.send(LoadOutcome { handle, result, elapsed: started.elapsed() });
        });
    }

    /// Outcomes that have arrived so far, without blocking.
    pub fn drain(&self) -> Vec<LoadOutcome> {
        let outcomes: Vec<_> = self.rx.try_iter().collect();
        self.in_flight.fetch_sub(outcomes.len(), Ordering::SeqCst);
        outcomes
    }

    /// Blocks until one outcome arrives or `timeout` passes.
    pub fn wait(&self, timeout: Duration) -> Option<LoadOutcome> {
        match self.rx.recv_timeout(timeout) {
            Ok(outcome) => {
                self.in_flight.fetch_sub(1, Ordering::SeqCst);
                Some(outcome)
            }
            Err(RecvTimeoutError::Timeout | RecvTimeoutError::Disconnected) => None,
        }
    }

    /// Loads spawned but not yet drained.
    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entity::{new_handle, EntityCore, EntitySource, PointCloudEntity};

    #[test]
    fn outcomes_come_back_through_the_channel() {
        let loader = Loader::new(2).expect("pool");
        assert_eq!(loader.threads(), 2);
        let source = EntitySource::Bytes { name: "broken".into(), data: vec![0u8; 3].into() };
        let core = EntityCore::new("broken").with_source(source);
        loader.spawn(new_handle(Box::new(PointCloudEntity::new(core))));
        assert_eq!(loader.in_flight(), 1);

        let outcome = loader.wait(Duration::from_secs(10)).expect("outcome");
        assert!(outcome.result.is_err() || !outcome.handle.lock().unwrap().core().valid);
        assert_eq!(loader.in_flight(), 0);
        assert!(loader.drain().is_empty());
    }
}
