//! Cooperative single-thread scheduler.
//!
//! All core tasks are `!Send` futures multiplexed on one OS thread through a
//! tokio current-thread runtime and `LocalSet`. Shared state is plain
//! `Rc`/`Cell`; there is no preemption and no in-process locking for core
//! invariants. Tasks suspend only at designated points: storage and network
//! waits, timers, explicit yields, and the offload boundary.
//!
//! Wakeups are *notes*: counted, lossless signals. `notify` increments the
//! counter and schedules the task only on the 0→1 transition; `wait`
//! consumes one note and returns immediately when a note arrived before the
//! wait. No predicate loops are needed around suspension.
//!
//! Interruption is cooperative and recoverable: `interrupt` sets a flag and
//! posts a wake, and the task observes [`Error::Interrupted`] at its next
//! interruption point, unwinding with every scoped resource released on the
//! way out. Termination (`Task::terminate`) cannot be suppressed; the task's
//! future is dropped at its next suspension and only destructors run.

pub mod offload;
pub mod pool;

use std::{
    cell::{Cell, RefCell},
    fmt,
    future::{poll_fn, Future},
    pin::Pin,
    rc::Rc,
    task::{Context, Poll, Waker},
    time::Duration,
};

use tokio::time::Instant;
use tracing::warn;

use crate::error::{Error, Result};

pub use offload::Offload;
pub use pool::Pool;

/// Default slice warning threshold; a cooperative task holding the thread
/// longer than this between suspensions is logged.
pub const DEFAULT_SLICE_WARN: Duration = Duration::from_millis(50);

#[derive(Debug, Clone, Copy)]
pub struct SliceCfg {
    pub warn: Duration,
    /// When set, a slice exceeding this raises an interrupt against the
    /// offending task. Off by default.
    pub interrupt: Option<Duration>,
}

impl Default for SliceCfg {
    fn default() -> Self {
        Self {
            warn: DEFAULT_SLICE_WARN,
            interrupt: None,
        }
    }
}

thread_local! {
    static SLICE_CFG: Cell<SliceCfg> = Cell::new(SliceCfg::default());
}

tokio::task_local! {
    static CURRENT: TaskCtl;
}

/// Counted, lossless wakeup primitive shared by a task and its notifiers.
#[derive(Clone, Default)]
pub struct Note {
    inner: Rc<NoteInner>,
}

#[derive(Default)]
struct NoteInner {
    count: Cell<i64>,
    interrupted: Cell<bool>,
    waker: RefCell<Option<Waker>>,
}

impl Note {
    pub fn new() -> Self {
        Self::default()
    }

    /// Post one note. Wakes the waiter only on the 0→1 transition; further
    /// notes accumulate and are consumed by later waits.
    pub fn notify(&self) {
        let count = self.inner.count.get();
        self.inner.count.set(count + 1);
        if count == 0 {
            self.wake();
        }
    }

    /// Request cooperative interruption; observed at the next interruption
    /// point or wait.
    pub fn interrupt(&self) {
        self.inner.interrupted.set(true);
        self.wake();
    }

    pub fn interruption_requested(&self) -> bool {
        self.inner.interrupted.get()
    }

    /// Check-and-clear the interruption flag.
    pub fn interruption_point(&self) -> Result<()> {
        if self.inner.interrupted.replace(false) {
            Err(Error::Interrupted)
        } else {
            Ok(())
        }
    }

    pub fn pending(&self) -> i64 {
        self.inner.count.get()
    }

    /// Identity comparison; two handles to the same underlying note.
    pub fn same_as(&self, other: &Note) -> bool {
        Rc::ptr_eq(&self.inner, &other.inner)
    }

    /// Suspend until a note arrives. Returns immediately when one already
    /// has; consumes exactly one note either way.
    pub async fn wait(&self) -> Result<()> {
        poll_fn(|cx| self.poll_wait(cx)).await
    }

    fn poll_wait(&self, cx: &mut Context<'_>) -> Poll<Result<()>> {
        if self.inner.interrupted.replace(false) {
            return Poll::Ready(Err(Error::Interrupted));
        }
        let count = self.inner.count.get();
        if count > 0 {
            self.inner.count.set(count - 1);
            return Poll::Ready(Ok(()));
        }
        *self.inner.waker.borrow_mut() = Some(cx.waker().clone());
        Poll::Pending
    }

    /// Suspend with a relative deadline. `Ok(remaining)` on a note, with
    /// `Duration::ZERO` meaning the wait timed out.
    pub async fn wait_for(&self, timeout: Duration) -> Result<Duration> {
        self.wait_until(Instant::now() + timeout).await
    }

    /// Suspend with an absolute deadline; see [`Note::wait_for`].
    pub async fn wait_until(&self, deadline: Instant) -> Result<Duration> {
        match tokio::time::timeout_at(deadline, self.wait()).await {
            Ok(result) => result.map(|()| {
                deadline
                    .checked_duration_since(Instant::now())
                    .filter(|d| !d.is_zero())
                    .unwrap_or(Duration::from_nanos(1))
            }),
            Err(_) => Ok(Duration::ZERO),
        }
    }

    fn wake(&self) {
        if let Some(waker) = self.inner.waker.borrow_mut().take() {
            waker.wake();
        }
    }
}

/// Per-task control block: the task's note plus its name for diagnostics.
/// Cloned into the task itself (reachable via [`current`]) and held by the
/// [`Task`] handle.
#[derive(Clone)]
pub struct TaskCtl {
    name: Rc<str>,
    note: Note,
}

impl TaskCtl {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn note(&self) -> &Note {
        &self.note
    }
}

impl fmt::Debug for TaskCtl {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskCtl")
            .field("name", &self.name)
            .field("notes", &self.note.pending())
            .finish()
    }
}

/// Handle to a spawned task.
pub struct Task {
    ctl: TaskCtl,
    handle: Option<tokio::task::JoinHandle<()>>,
}

impl Task {
    pub fn name(&self) -> &str {
        self.ctl.name()
    }

    pub fn notify(&self) {
        self.ctl.note.notify();
    }

    /// Cooperative, recoverable cancellation.
    pub fn interrupt(&self) {
        self.ctl.note.interrupt();
    }

    /// Non-suppressible cancellation: the future is dropped at its next
    /// suspension point; handlers only release resources.
    pub fn terminate(&self) {
        if let Some(handle) = &self.handle {
            handle.abort();
        }
    }

    pub fn is_finished(&self) -> bool {
        self.handle
            .as_ref()
            .map_or(true, tokio::task::JoinHandle::is_finished)
    }

    /// Detach: the runtime owns the task's lifetime from here on.
    pub fn detach(mut self) {
        self.handle.take();
    }

    pub async fn join(mut self) -> Result<()> {
        match self.handle.take() {
            Some(handle) => handle.await.map_err(|err| {
                if err.is_cancelled() {
                    Error::Interrupted
                } else {
                    Error::Storage(format!("task panicked: {err}"))
                }
            }),
            None => Ok(()),
        }
    }
}

/// Spawn a task onto the current `LocalSet`, queued behind the ready tasks
/// (the POST discipline). The returned handle notifies, interrupts, and
/// joins it.
pub fn spawn<F>(name: impl Into<String>, future: F) -> Task
where
    F: Future<Output = ()> + 'static,
{
    let name: Rc<str> = Rc::from(name.into());
    let ctl = TaskCtl {
        name: name.clone(),
        note: Note::new(),
    };

    let slice = SLICE_CFG.with(Cell::get);
    let timed = Timed {
        inner: Box::pin(CURRENT.scope(ctl.clone(), future)),
        ctl: ctl.clone(),
        slice,
    };

    let handle = tokio::task::spawn_local(timed);
    Task {
        ctl,
        handle: Some(handle),
    }
}

/// Spawn and immediately yield so the child runs before the caller resumes
/// (the DISPATCH discipline).
pub async fn spawn_dispatch<F>(name: impl Into<String>, future: F) -> Task
where
    F: Future<Output = ()> + 'static,
{
    let task = spawn(name, future);
    yield_now().await;
    task
}

/// Control block of the calling task. `None` outside a spawned task (e.g.
/// on the scheduler's root future).
pub fn current() -> Option<TaskCtl> {
    CURRENT.try_with(Clone::clone).ok()
}

/// Suspension and interruption from within the running task, in the style
/// of a `this_task` namespace.
pub async fn wait() -> Result<()> {
    match current() {
        Some(ctl) => ctl.note.wait().await,
        None => Err(Error::Interrupted),
    }
}

pub async fn wait_for(timeout: Duration) -> Result<Duration> {
    match current() {
        Some(ctl) => ctl.note.wait_for(timeout).await,
        None => Err(Error::Interrupted),
    }
}

pub fn interruption_point() -> Result<()> {
    match current() {
        Some(ctl) => ctl.note.interruption_point(),
        None => Ok(()),
    }
}

/// Reschedule the calling task at the end of the ready queue.
pub async fn yield_now() {
    tokio::task::yield_now().await;
}

/// Suspend ignoring notes until the deadline. Still an interruption point.
pub async fn sleep(duration: Duration) -> Result<()> {
    interruption_point()?;
    tokio::time::sleep(duration).await;
    interruption_point()
}

/// The scheduler harness: a current-thread runtime plus a `LocalSet`. All
/// core code runs inside [`Scheduler::block_on`].
pub struct Scheduler {
    runtime: tokio::runtime::Runtime,
    slice: SliceCfg,
}

impl Scheduler {
    pub fn new(slice: SliceCfg) -> Result<Self> {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()?;
        Ok(Self { runtime, slice })
    }

    pub fn block_on<F: Future>(&self, future: F) -> F::Output {
        SLICE_CFG.with(|cfg| cfg.set(self.slice));
        let local = tokio::task::LocalSet::new();
        local.block_on(&self.runtime, future)
    }
}

/// Wrapper timing every poll of a task against the slice thresholds.
struct Timed {
    inner: Pin<Box<dyn Future<Output = ()>>>,
    ctl: TaskCtl,
    slice: SliceCfg,
}

impl Future for Timed {
    type Output = ();

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<()> {
        let this = self.get_mut();
        let start = std::time::Instant::now();
        let result = this.inner.as_mut().poll(cx);
        let elapsed = start.elapsed();

        if elapsed >= this.slice.warn {
            warn!(task = %this.ctl.name(), ?elapsed, "slice exceeded warning threshold");
        }
        if let Some(limit) = this.slice.interrupt {
            if elapsed >= limit && !matches!(result, Poll::Ready(())) {
                this.ctl.note.interrupt();
            }
        }

        result
    }
}
