//! `Scheduler`: the external collaborator providing CPU pinning, timers, and
//! softirq-style bottom-half dispatch. Interrupt handling and per-CPU timer
//! wheels are out of scope; this trait is the seam.

use std::sync::Arc;
use std::time::Duration;

/// A unit of deferred work, identified so `Scheduler::cancel` can remove it
/// again (close() must be able to cancel reactivation timers).
pub type TimerId = u64;

pub type Task = Box<dyn FnOnce() + Send>;

pub trait Scheduler: Send + Sync {
    /// Spawn `task` pinned to `cpu`. Completion callbacks and softirq work
    /// for a channel always run on its pinned CPU.
    fn spawn_pinned(&self, cpu: usize, task: Task);

    /// Arm a one-shot timer that runs `task` after `delay`. Returns an id
    /// that can later be passed to `cancel`.
    fn timer_after(&self, delay: Duration, task: Task) -> TimerId;

    /// Cancel a previously armed timer; no-op if it already fired.
    fn cancel(&self, id: TimerId);

    /// Register a bottom-half callback to run on `cpu`'s softirq context.
    fn run_softirq(&self, cpu: usize, task: Task);
}

/// Deterministic, single-threaded test double. All "spawned" and "softirq"
/// work runs inline on the caller's thread; timers are stored in a min-heap
/// keyed by a logical clock that tests advance explicitly with `advance`.
pub struct FakeScheduler {
    inner: parking_lot::Mutex<FakeSchedulerState>,
}

struct FakeSchedulerState {
    next_timer_id: TimerId,
    timers: Vec<(TimerId, u64, Option<Task>)>,
    now: u64,
}

impl FakeScheduler {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            inner: parking_lot::Mutex::new(FakeSchedulerState {
                next_timer_id: 1,
                timers: Vec::new(),
                now: 0,
            }),
        })
    }

    /// Advances the logical clock by `delta_ns` and fires any timers whose
    /// deadline has passed.
    pub fn advance(&self, delta_ns: u64) {
        let mut due = Vec::new();
        {
            let mut state = self.inner.lock();
            state.now += delta_ns;
            let now = state.now;
            for slot in state.timers.iter_mut() {
                if slot.1 <= now {
                    if let Some(task) = slot.2.take() {
                        due.push(task);
                    }
                }
            }
            state.timers.retain(|(_, _, task)| task.is_some());
        }
        for task in due {
            task();
        }
    }
}

impl Scheduler for FakeScheduler {
    fn spawn_pinned(&self, _cpu: usize, task: Task) {
        task();
    }

    fn timer_after(&self, delay: Duration, task: Task) -> TimerId {
        let mut state = self.inner.lock();
        let id = state.next_timer_id;
        state.next_timer_id += 1;
        let deadline = state.now + delay.as_nanos() as u64;
        state.timers.push((id, deadline, Some(task)));
        id
    }

    fn cancel(&self, id: TimerId) {
        let mut state = self.inner.lock();
        state.timers.retain(|(timer_id, _, _)| *timer_id != id);
    }

    fn run_softirq(&self, _cpu: usize, task: Task) {
        task();
    }
}
