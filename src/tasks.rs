/// Cooperative task system and host-facing synchronization primitives.
///
/// The event loop is single-threaded: awaiting a task runs the loop on
/// the current thread until the task completes. Suspension points are
/// the task's own yields (a `Pending` poll or a timer sleep); there is
/// no preemption. Cancellation is cooperative: `cancel` sets a flag
/// the task observes at its next suspension point, finishing it with a
/// `Cancelled` outcome. Ready tasks run in FIFO order of `call_soon`;
/// timers fire in monotonic-deadline order.
///
/// Tasks come in two bodies. Host code spawns poll closures and drives
/// them with `await_task`/`await_timeout`. Scripts spawn callables
/// through the `spawn` builtin; the loop cannot execute those itself,
/// so `dispatch_next` hands them to the driver (the engine's
/// `drive_task`), which runs the call and reports back via `complete`.
/// The evaluator itself never yields between statements; `sleep` and
/// `async_await` are its only suspension points.

use crate::exceptions::Thrown;
use crate::value::Value;
use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap, VecDeque};
use std::time::{Duration, Instant};

pub type TaskId = u64;

#[derive(Debug, Clone)]
pub enum TaskOutcome {
    Completed(Value),
    /// The task's callable raised; awaiting it re-raises.
    Failed(Thrown),
    Cancelled,
    TimedOut,
    Stopped,
}

/// What a task reports when polled.
pub enum TaskPoll {
    Ready(Value),
    /// Yield; the loop will poll again after currently queued tasks.
    Pending,
    /// Yield until the duration elapses.
    Sleep(Duration),
}

pub struct TaskContext {
    pub cancelled: bool,
}

pub type StepFn = Box<dyn FnMut(&TaskContext) -> TaskPoll + Send>;

enum TaskBody {
    /// Host-provided poll closure.
    Step(StepFn),
    /// A script callable; a driver runs it to completion in one go.
    Call { callee: Value, args: Vec<Value> },
    /// Taken out by a driver; completion arrives via `complete`.
    InFlight,
}

struct Task {
    body: TaskBody,
    cancelled: bool,
    outcome: Option<TaskOutcome>,
}

/// One turn of the loop, as seen by a driver.
pub enum Dispatch {
    /// Nothing runnable; the payload is the next timer deadline.
    Idle(Option<Instant>),
    /// A host task was polled, or a settled id was skipped.
    Polled,
    /// A script task to execute; report back with `complete`.
    Script { id: TaskId, callee: Value, args: Vec<Value> },
}

pub struct EventLoop {
    tasks: HashMap<TaskId, Task>,
    ready: VecDeque<TaskId>,
    timers: BinaryHeap<Reverse<(Instant, u64, TaskId)>>,
    next_id: TaskId,
    timer_seq: u64,
    stopped: bool,
}

impl EventLoop {
    pub fn new() -> Self {
        EventLoop {
            tasks: HashMap::new(),
            ready: VecDeque::new(),
            timers: BinaryHeap::new(),
            next_id: 1,
            timer_seq: 0,
            stopped: false,
        }
    }

    /// Create a host task and schedule its first poll.
    pub fn spawn(&mut self, step: StepFn) -> TaskId {
        self.spawn_body(TaskBody::Step(step))
    }

    /// Create a script task around a callable; the driver executes it
    /// on dispatch.
    pub fn spawn_call(&mut self, callee: Value, args: Vec<Value>) -> TaskId {
        self.spawn_body(TaskBody::Call { callee, args })
    }

    fn spawn_body(&mut self, body: TaskBody) -> TaskId {
        let id = self.next_id;
        self.next_id += 1;
        self.tasks.insert(id, Task { body, cancelled: false, outcome: None });
        self.call_soon(id);
        id
    }

    pub fn call_soon(&mut self, id: TaskId) {
        if !self.stopped {
            self.ready.push_back(id);
        }
    }

    /// Cooperative cancellation; takes effect at the task's next
    /// suspension point.
    pub fn cancel(&mut self, id: TaskId) {
        if let Some(task) = self.tasks.get_mut(&id) {
            task.cancelled = true;
        }
    }

    pub fn outcome(&self, id: TaskId) -> Option<TaskOutcome> {
        self.tasks.get(&id).and_then(|t| t.outcome.clone())
    }

    /// Settle a task whose body a driver took out via `dispatch_next`.
    pub fn complete(&mut self, id: TaskId, outcome: TaskOutcome) {
        if let Some(task) = self.tasks.get_mut(&id) {
            if task.outcome.is_none() {
                task.outcome = Some(outcome);
            }
        }
    }

    /// Move due timers to the ready queue, then take one turn: poll a
    /// host task inline, or hand a script task out to the driver.
    pub fn dispatch_next(&mut self) -> Dispatch {
        let now = Instant::now();
        while let Some(Reverse((deadline, _, id))) = self.timers.peek().copied() {
            if deadline > now {
                break;
            }
            self.timers.pop();
            self.ready.push_back(id);
        }

        let Some(id) = self.ready.pop_front() else {
            return Dispatch::Idle(self.next_deadline());
        };
        let Some(task) = self.tasks.get_mut(&id) else { return Dispatch::Polled };
        if task.outcome.is_some() {
            return Dispatch::Polled;
        }
        if task.cancelled {
            task.outcome = Some(TaskOutcome::Cancelled);
            return Dispatch::Polled;
        }

        match &mut task.body {
            TaskBody::Step(step) => {
                let ctx = TaskContext { cancelled: task.cancelled };
                match step(&ctx) {
                    TaskPoll::Ready(value) => {
                        task.outcome = Some(TaskOutcome::Completed(value));
                    }
                    TaskPoll::Pending => self.ready.push_back(id),
                    TaskPoll::Sleep(duration) => {
                        let seq = self.timer_seq;
                        self.timer_seq += 1;
                        self.timers.push(Reverse((now + duration, seq, id)));
                    }
                }
                Dispatch::Polled
            }
            TaskBody::Call { .. } => {
                let TaskBody::Call { callee, args } =
                    std::mem::replace(&mut task.body, TaskBody::InFlight)
                else {
                    unreachable!("body variant checked above");
                };
                Dispatch::Script { id, callee, args }
            }
            // Already in a driver's hands; nothing to do this turn.
            TaskBody::InFlight => Dispatch::Polled,
        }
    }

    fn next_deadline(&self) -> Option<Instant> {
        self.timers.peek().map(|Reverse((deadline, _, _))| *deadline)
    }

    /// Run the loop until the task completes. This host-facing driver
    /// cannot execute script bodies; those settle as `Stopped` here,
    /// the engine's `drive_task` is the driver that runs them.
    pub fn await_task(&mut self, id: TaskId) -> TaskOutcome {
        loop {
            if let Some(outcome) = self.outcome(id) {
                return outcome;
            }
            if self.stopped {
                return TaskOutcome::Stopped;
            }
            match self.dispatch_next() {
                Dispatch::Polled => {}
                Dispatch::Script { id: script, .. } => {
                    self.complete(script, TaskOutcome::Stopped);
                }
                Dispatch::Idle(Some(deadline)) => {
                    let now = Instant::now();
                    if deadline > now {
                        std::thread::sleep(deadline - now);
                    }
                }
                // Nothing queued and nothing sleeping: the task can
                // never complete.
                Dispatch::Idle(None) => return TaskOutcome::Stopped,
            }
        }
    }

    /// Like `await_task`, but gives up after `ms` milliseconds with a
    /// `TimedOut` outcome. The task itself is NOT cancelled; callers
    /// that want it gone cancel explicitly.
    pub fn await_timeout(&mut self, id: TaskId, ms: u64) -> TaskOutcome {
        let deadline = Instant::now() + Duration::from_millis(ms);
        loop {
            if let Some(outcome) = self.outcome(id) {
                return outcome;
            }
            if self.stopped {
                return TaskOutcome::Stopped;
            }
            if Instant::now() >= deadline {
                return TaskOutcome::TimedOut;
            }
            match self.dispatch_next() {
                Dispatch::Polled => {}
                Dispatch::Script { id: script, .. } => {
                    self.complete(script, TaskOutcome::Stopped);
                }
                Dispatch::Idle(next) => {
                    let wake = next.map(|d| d.min(deadline)).unwrap_or(deadline);
                    let now = Instant::now();
                    if wake > now {
                        std::thread::sleep((wake - now).min(Duration::from_millis(5)));
                    }
                }
            }
        }
    }

    /// Unwind: pending tasks are dropped without running and report
    /// `Stopped`.
    pub fn stop(&mut self) {
        self.stopped = true;
        self.ready.clear();
        self.timers.clear();
        for task in self.tasks.values_mut() {
            if task.outcome.is_none() {
                task.outcome = Some(TaskOutcome::Stopped);
            }
        }
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped
    }
}

impl Default for EventLoop {
    fn default() -> Self {
        EventLoop::new()
    }
}

// ---------------------------------------------------------------------------
// Host synchronization primitives
// ---------------------------------------------------------------------------

/// Value-holding mutex for host threads sharing data with scripts.
pub struct HostMutex {
    inner: parking_lot::Mutex<Value>,
}

impl HostMutex {
    pub fn new(value: Value) -> Self {
        HostMutex { inner: parking_lot::Mutex::new(value) }
    }

    pub fn with<R>(&self, f: impl FnOnce(&mut Value) -> R) -> R {
        f(&mut self.inner.lock())
    }
}

pub struct HostRwLock {
    inner: parking_lot::RwLock<Value>,
}

impl HostRwLock {
    pub fn new(value: Value) -> Self {
        HostRwLock { inner: parking_lot::RwLock::new(value) }
    }

    pub fn read<R>(&self, f: impl FnOnce(&Value) -> R) -> R {
        f(&self.inner.read())
    }

    pub fn write<R>(&self, f: impl FnOnce(&mut Value) -> R) -> R {
        f(&mut self.inner.write())
    }
}

/// Counting semaphore built on a condvar.
pub struct Semaphore {
    permits: parking_lot::Mutex<usize>,
    available: parking_lot::Condvar,
}

impl Semaphore {
    pub fn new(permits: usize) -> Self {
        Semaphore {
            permits: parking_lot::Mutex::new(permits),
            available: parking_lot::Condvar::new(),
        }
    }

    pub fn acquire(&self) {
        let mut permits = self.permits.lock();
        while *permits == 0 {
            self.available.wait(&mut permits);
        }
        *permits -= 1;
    }

    pub fn try_acquire(&self) -> bool {
        let mut permits = self.permits.lock();
        if *permits == 0 {
            return false;
        }
        *permits -= 1;
        true
    }

    pub fn release(&self) {
        *self.permits.lock() += 1;
        self.available.notify_one();
    }
}

pub struct AtomicCounter {
    value: std::sync::atomic::AtomicI64,
}

impl AtomicCounter {
    pub fn new(value: i64) -> Self {
        AtomicCounter { value: std::sync::atomic::AtomicI64::new(value) }
    }

    pub fn load(&self) -> i64 {
        self.value.load(std::sync::atomic::Ordering::SeqCst)
    }

    pub fn store(&self, value: i64) {
        self.value.store(value, std::sync::atomic::Ordering::SeqCst)
    }

    pub fn add(&self, delta: i64) -> i64 {
        self.value.fetch_add(delta, std::sync::atomic::Ordering::SeqCst) + delta
    }

    pub fn compare_exchange(&self, current: i64, new: i64) -> bool {
        self.value
            .compare_exchange(
                current,
                new,
                std::sync::atomic::Ordering::SeqCst,
                std::sync::atomic::Ordering::SeqCst,
            )
            .is_ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tasks_complete_in_fifo_order() {
        let mut el = EventLoop::new();
        let log = std::sync::Arc::new(parking_lot::Mutex::new(Vec::new()));

        let l1 = log.clone();
        let a = el.spawn(Box::new(move |_| {
            l1.lock().push("a");
            TaskPoll::Ready(Value::Num(1.0))
        }));
        let l2 = log.clone();
        let b = el.spawn(Box::new(move |_| {
            l2.lock().push("b");
            TaskPoll::Ready(Value::Num(2.0))
        }));

        assert!(matches!(el.await_task(b), TaskOutcome::Completed(_)));
        assert!(matches!(el.await_task(a), TaskOutcome::Completed(_)));
        assert_eq!(*log.lock(), vec!["a", "b"]);
    }

    #[test]
    fn pending_tasks_are_rescheduled() {
        let mut el = EventLoop::new();
        let mut polls = 0;
        let id = el.spawn(Box::new(move |_| {
            polls += 1;
            if polls < 3 {
                TaskPoll::Pending
            } else {
                TaskPoll::Ready(Value::Num(polls as f64))
            }
        }));
        match el.await_task(id) {
            TaskOutcome::Completed(Value::Num(n)) => assert_eq!(n, 3.0),
            other => panic!("unexpected outcome: {:?}", other),
        }
    }

    #[test]
    fn cancel_is_observed_at_the_next_suspension_point() {
        let mut el = EventLoop::new();
        let id = el.spawn(Box::new(|_| TaskPoll::Pending));
        el.cancel(id);
        assert!(matches!(el.await_task(id), TaskOutcome::Cancelled));
    }

    #[test]
    fn await_timeout_does_not_cancel() {
        let mut el = EventLoop::new();
        let id = el.spawn(Box::new(|_| TaskPoll::Sleep(Duration::from_millis(200))));
        assert!(matches!(el.await_timeout(id, 10), TaskOutcome::TimedOut));
        // The task is still alive and can still complete.
        assert!(el.outcome(id).is_none());
    }

    #[test]
    fn timers_fire_in_deadline_order() {
        let mut el = EventLoop::new();
        let log = std::sync::Arc::new(parking_lot::Mutex::new(Vec::new()));

        let l1 = log.clone();
        let mut slept1 = false;
        let slow = el.spawn(Box::new(move |_| {
            if !slept1 {
                slept1 = true;
                return TaskPoll::Sleep(Duration::from_millis(30));
            }
            l1.lock().push("slow");
            TaskPoll::Ready(Value::Null)
        }));
        let l2 = log.clone();
        let mut slept2 = false;
        let fast = el.spawn(Box::new(move |_| {
            if !slept2 {
                slept2 = true;
                return TaskPoll::Sleep(Duration::from_millis(5));
            }
            l2.lock().push("fast");
            TaskPoll::Ready(Value::Null)
        }));

        el.await_task(slow);
        el.await_task(fast);
        assert_eq!(*log.lock(), vec!["fast", "slow"]);
    }

    #[test]
    fn stop_unwinds_pending_tasks() {
        let mut el = EventLoop::new();
        let id = el.spawn(Box::new(|_| TaskPoll::Pending));
        el.stop();
        assert!(matches!(el.await_task(id), TaskOutcome::Stopped));
    }

    #[test]
    fn script_tasks_are_handed_to_the_driver() {
        let mut el = EventLoop::new();
        let id = el.spawn_call(Value::Null, vec![Value::Num(7.0)]);
        match el.dispatch_next() {
            Dispatch::Script { id: got, callee, args } => {
                assert_eq!(got, id);
                assert!(matches!(callee, Value::Null));
                assert_eq!(args.len(), 1);
                el.complete(got, TaskOutcome::Completed(Value::Num(9.0)));
            }
            _ => panic!("expected a script dispatch"),
        }
        assert!(matches!(
            el.outcome(id),
            Some(TaskOutcome::Completed(Value::Num(n))) if n == 9.0
        ));
    }

    #[test]
    fn cancelled_script_task_never_reaches_the_driver() {
        let mut el = EventLoop::new();
        let id = el.spawn_call(Value::Null, Vec::new());
        el.cancel(id);
        assert!(matches!(el.dispatch_next(), Dispatch::Polled));
        assert!(matches!(el.outcome(id), Some(TaskOutcome::Cancelled)));
    }

    #[test]
    fn semaphore_counts_permits() {
        let sem = Semaphore::new(1);
        assert!(sem.try_acquire());
        assert!(!sem.try_acquire());
        sem.release();
        assert!(sem.try_acquire());
    }

    #[test]
    fn atomic_counter_compare_exchange() {
        let counter = AtomicCounter::new(5);
        assert!(counter.compare_exchange(5, 9));
        assert!(!counter.compare_exchange(5, 1));
        assert_eq!(counter.load(), 9);
        assert_eq!(counter.add(1), 10);
    }
}
