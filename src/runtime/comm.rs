// In: src/runtime/comm.rs

//! The coordination substrate between workers: rank and size, a barrier, a
//! broadcast from one worker to all, and an abort that releases everyone.
//!
//! The engine only sees the object-safe [`Communicator`] trait. `LocalCommunicator`
//! implements it for a fleet of threads in one process.

use std::any::Any;
use std::fmt;
use std::sync::Arc;

use parking_lot::{Condvar, Mutex};

use crate::error::{PipelineError, Result};

/// A broadcast value.
pub type Payload = Arc<dyn Any + Send + Sync>;

pub trait Communicator: Send + Sync {
    fn rank(&self) -> usize;

    fn size(&self) -> usize;

    /// Blocks until every worker has reached the barrier, or fails with
    /// [`PipelineError::Aborted`] once any worker aborts.
    fn barrier(&self) -> Result<()>;

    /// Collective: the root supplies `value`, every worker gets it back.
    fn broadcast_any(&self, root: usize, value: Option<Payload>) -> Result<Payload>;

    /// Marks the fleet as failed and wakes every waiting worker.
    fn abort(&self, reason: &str);
}

/// Typed broadcast on top of [`Communicator::broadcast_any`].
pub fn broadcast<T>(comm: &dyn Communicator, root: usize, value: Option<T>) -> Result<T>
where
    T: Any + Clone + Send + Sync,
{
    let payload = value.map(|v| Arc::new(v) as Payload);
    let received = comm.broadcast_any(root, payload)?;
    received.downcast_ref::<T>().cloned().ok_or_else(|| {
        PipelineError::Aborted(format!(
            "broadcast from worker {} carried an unexpected type",
            root
        ))
    })
}

//==================================================================================
// In-process fleet
//==================================================================================

#[derive(Default)]
struct FleetState {
    arrived: usize,
    generation: u64,
    aborted: Option<String>,
    payload: Option<Payload>,
}

struct Fleet {
    size: usize,
    state: Mutex<FleetState>,
    released: Condvar,
}

/// One endpoint of a fleet of threads sharing a barrier.
#[derive(Clone)]
pub struct LocalCommunicator {
    rank: usize,
    fleet: Arc<Fleet>,
}

impl fmt::Debug for LocalCommunicator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LocalCommunicator")
            .field("rank", &self.rank)
            .field("size", &self.fleet.size)
            .finish()
    }
}

impl LocalCommunicator {
    /// Creates `size` connected endpoints, one per worker, in rank order.
    pub fn fleet(size: usize) -> Vec<LocalCommunicator> {
        let fleet = Arc::new(Fleet {
            size,
            state: Mutex::new(FleetState::default()),
            released: Condvar::new(),
        });
        (0..size)
            .map(|rank| LocalCommunicator {
                rank,
                fleet: Arc::clone(&fleet),
            })
            .collect()
    }

    pub fn is_aborted(&self) -> bool {
        self.fleet.state.lock().aborted.is_some()
    }

    /// The reason given by the first worker that aborted.
    pub fn abort_reason(&self) -> Option<String> {
        self.fleet.state.lock().aborted.clone()
    }
}

impl Communicator for LocalCommunicator {
    fn rank(&self) -> usize {
        self.rank
    }

    fn size(&self) -> usize {
        self.fleet.size
    }

    fn barrier(&self) -> Result<()> {
        let mut state = self.fleet.state.lock();
        if let Some(reason) = &state.aborted {
            return Err(PipelineError::Aborted(reason.clone()));
        }

        let generation = state.generation;
        state.arrived += 1;
        if state.arrived == self.fleet.size {
            state.arrived = 0;
            state.generation += 1;
            self.fleet.released.notify_all();
            return Ok(());
        }

        while state.generation == generation && state.aborted.is_none() {
            self.fleet.released.wait(&mut state);
        }
        match &state.aborted {
            Some(reason) if state.generation == generation => Err(PipelineError::Aborted(reason.clone())),
            _ => Ok(()),
        }
    }

    fn broadcast_any(&self, root: usize, value: Option<Payload>) -> Result<Payload> {
        if self.rank == root {
            let value = value.ok_or_else(|| {
                PipelineError::Aborted(format!("broadcast root {} supplied no value", root))
            })?;
            self.fleet.state.lock().payload = Some(value);
        }
        self.barrier()?;
        let received = self.fleet.state.lock().payload.clone();
        // Nobody may start the next broadcast until every worker has read this one.
        self.barrier()?;
        received.ok_or_else(|| PipelineError::Aborted("broadcast carried no value".to_string()))
    }

    fn abort(&self, reason: &str) {
        let mut state = self.fleet.state.lock();
        if state.aborted.is_none() {
            log::error!("worker {} aborts the fleet: {}", self.rank, reason);
            state.aborted = Some(reason.to_string());
        }
        self.fleet.released.notify_all();
    }
}
