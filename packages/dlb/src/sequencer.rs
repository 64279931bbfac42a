//! Bounded-parallel sequencer for pending redos.
//!
//! One sequencer exists per root context. It owns the submitted task
//! futures and polls them itself; nothing is ever spawned, so all task
//! code runs on the thread that drives the sequencer (cooperative
//! single-threaded scheduling). Parallelism comes only from tasks that
//! await external events, such as helper subprocesses.
//!
//! Tasks make progress exactly while someone awaits one of the driving
//! operations ([`Sequencer::complete`], [`Sequencer::complete_all`], a
//! back-pressured [`Sequencer::submit`]). Results are consumed once.

use std::cell::RefCell;
use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::rc::Rc;
use std::task::Poll;
use std::time::Duration;

use futures::future::LocalBoxFuture;
use tracing::trace;

use crate::error::RedoError;

/// Identifies one submitted task within its sequencer.
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug, derive_more::Display)]
#[display("task {_0}")]
pub struct TaskId(u64);

struct State<T> {
    max_parallel: usize,
    next_tid: u64,
    /// Submitted but not yet started (no free slot at submission time).
    pending: VecDeque<(TaskId, LocalBoxFuture<'static, T>)>,
    /// Started and not yet finished; polled by [`Sequencer::drive_until`].
    running: Vec<(TaskId, LocalBoxFuture<'static, T>)>,
    /// Finished and not yet consumed. `None` marks a cancelled task.
    finished: HashMap<TaskId, Option<T>>,
}

impl<T> State<T> {
    fn promote(&mut self) -> bool {
        let mut promoted = false;
        while self.running.len() < self.max_parallel {
            let Some(task) = self.pending.pop_front() else {
                break;
            };
            trace!(tid = %task.0, "task started");
            self.running.push(task);
            promoted = true;
        }
        promoted
    }

    fn is_known(&self, tid: TaskId) -> bool {
        self.pending.iter().any(|(t, _)| *t == tid)
            || self.running.iter().any(|(t, _)| *t == tid)
    }
}

/// Bounded-parallel FIFO task sequencer; see the module documentation.
pub struct Sequencer<T> {
    state: Rc<RefCell<State<T>>>,
}

impl<T> Clone for Sequencer<T> {
    fn clone(&self) -> Self {
        Sequencer {
            state: Rc::clone(&self.state),
        }
    }
}

impl<T> fmt::Debug for Sequencer<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.borrow();
        f.debug_struct("Sequencer")
            .field("max_parallel", &state.max_parallel)
            .field("pending", &state.pending.len())
            .field("running", &state.running.len())
            .field("finished", &state.finished.len())
            .finish()
    }
}

impl<T: 'static> Sequencer<T> {
    pub fn new(max_parallel: usize) -> Self {
        Sequencer {
            state: Rc::new(RefCell::new(State {
                max_parallel: max_parallel.max(1),
                next_tid: 0,
                pending: VecDeque::new(),
                running: Vec::new(),
                finished: HashMap::new(),
            })),
        }
    }

    pub fn max_parallel(&self) -> usize {
        self.state.borrow().max_parallel
    }

    /// Changes the concurrency cap; takes effect at the next promotion.
    pub fn set_max_parallel(&self, max_parallel: usize) {
        self.state.borrow_mut().max_parallel = max_parallel.max(1);
    }

    /// True while a driving operation is polling tasks, in which case every
    /// other sequencer operation is forbidden (a task must not drive its
    /// own sequencer).
    pub fn is_driving(&self) -> bool {
        self.state.try_borrow_mut().is_err()
    }

    fn guard(&self, operation: &'static str) -> Result<std::cell::RefMut<'_, State<T>>, RedoError> {
        self.state
            .try_borrow_mut()
            .map_err(|_| RedoError::ForbiddenInRedo { operation })
    }

    /// Submits a task. The task starts immediately when the running set has
    /// spare capacity; otherwise the caller is driven (back-pressure) until
    /// a slot frees up or `timeout` elapses.
    pub async fn submit(
        &self,
        task: LocalBoxFuture<'static, T>,
        timeout: Option<Duration>,
    ) -> Result<TaskId, RedoError> {
        let tid = {
            let mut state = self.guard("submit")?;
            let tid = TaskId(state.next_tid);
            state.next_tid += 1;
            state.pending.push_back((tid, task));
            state.promote();
            trace!(%tid, "task submitted");
            tid
        };
        let started = self.drive_until(timeout, |state| {
            !state.pending.iter().any(|(t, _)| *t == tid)
        });
        match started.await {
            Ok(()) => Ok(tid),
            Err(e) => {
                // the task never started; forget it
                let mut state = self.state.borrow_mut();
                state.pending.retain(|(t, _)| *t != tid);
                Err(e)
            }
        }
    }

    /// Drives until the given task has finished (or was cancelled).
    pub async fn complete(&self, tid: TaskId) -> Result<(), RedoError> {
        self.drive_until(None, move |state| !state.is_known(tid)).await
    }

    /// Drives until no task is pending or running.
    pub async fn complete_all(&self, timeout: Option<Duration>) -> Result<(), RedoError> {
        self.drive_until(timeout, |state| {
            state.pending.is_empty() && state.running.is_empty()
        })
        .await
    }

    /// Cancels every pending and running task. A cancelled task's result
    /// reports as cancelled when consumed.
    pub fn cancel_all(&self) -> Result<(), RedoError> {
        let mut state = self.guard("cancel_all")?;
        let mut dropped: Vec<TaskId> = state.pending.drain(..).map(|(tid, _)| tid).collect();
        dropped.extend(state.running.drain(..).map(|(tid, _)| tid));
        for tid in dropped {
            trace!(%tid, "task cancelled");
            state.finished.insert(tid, None);
        }
        Ok(())
    }

    /// Returns a finished task's result, once and only once.
    pub fn consume(&self, tid: TaskId) -> Result<T, RedoError> {
        let mut state = self.guard("consume")?;
        match state.finished.remove(&tid) {
            Some(Some(value)) => Ok(value),
            Some(None) => Err(RedoError::Cancelled),
            None => Err(RedoError::AlreadyConsumed),
        }
    }

    /// True iff the task has finished and its result is still unconsumed.
    pub fn is_finished(&self, tid: TaskId) -> bool {
        self.state.borrow().finished.contains_key(&tid)
    }

    /// Drains every unconsumed result.
    pub fn consume_all(&self) -> Result<Vec<(TaskId, Option<T>)>, RedoError> {
        let mut state = self.guard("consume_all")?;
        Ok(state.finished.drain().collect())
    }

    /// Polls the running tasks until `done` holds. `done` is evaluated
    /// against quiescent state only (between task polls).
    async fn drive_until(
        &self,
        timeout: Option<Duration>,
        done: impl Fn(&State<T>) -> bool,
    ) -> Result<(), RedoError> {
        let drive = futures::future::poll_fn(|cx| {
            let mut state = match self.state.try_borrow_mut() {
                Ok(state) => state,
                // a task is driving already; that task must not wait here
                Err(_) => return Poll::Ready(Err(RedoError::ForbiddenInRedo {
                    operation: "waiting on the sequencer from inside a redo",
                })),
            };
            loop {
                let mut progressed = false;
                let mut i = 0;
                while i < state.running.len() {
                    match state.running[i].1.as_mut().poll(cx) {
                        Poll::Ready(value) => {
                            let (tid, _) = state.running.swap_remove(i);
                            trace!(%tid, "task finished");
                            state.finished.insert(tid, Some(value));
                            progressed = true;
                        }
                        Poll::Pending => i += 1,
                    }
                }
                progressed |= state.promote();
                if !progressed {
                    break;
                }
            }
            if done(&state) {
                Poll::Ready(Ok(()))
            } else {
                Poll::Pending
            }
        });
        match timeout {
            None => drive.await,
            Some(limit) => tokio::time::timeout(limit, drive)
                .await
                .unwrap_or(Err(RedoError::Timeout)),
        }
    }
}
