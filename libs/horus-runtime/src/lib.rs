use std::{
    cell::Cell,
    future::Future,
    pin::{Pin, pin},
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    task::{Context, Poll, Waker},
    thread::Thread,
    time::Duration,
};

pub mod function;
pub mod future;
pub mod one_of;
pub mod owned;
pub mod remote;
pub mod struc_con;
pub mod util;

mod time;

pub use future::{AnyFuture, FutureExt, TryFutureExt};
pub use maitake::sync;
pub use maitake::task::JoinHandle;
pub use time::{SleepUntil, sleep, sleep_until};

#[cfg(feature = "derive")]
pub use horus_runtime_macros::{main, test};

#[doc(hidden)]
pub mod __private {
    pub use paste::paste;
}

thread_local! {
    static EXEC: Executor = Executor::default();
}

#[derive(Debug, thiserror::Error)]
#[cfg_attr(feature = "miette", derive(miette::Diagnostic))]
pub enum Error {
    #[error("executor already running on this thread")]
    #[cfg_attr(
        feature = "miette",
        diagnostic(
            code(horus::runtime::nested_run),
            help("spawn the future instead of calling `run` from inside a task")
        )
    )]
    ExecutorAlreadyRunning,
    #[error("event loop shut down")]
    #[cfg_attr(feature = "miette", diagnostic(code(horus::runtime::shutdown)))]
    Shutdown,
    #[error("task dropped before completion")]
    JoinFailed,
    #[error(transparent)]
    Elapsed(#[from] future::Elapsed),
}

pub struct Executor {
    scheduler: maitake::scheduler::LocalScheduler,
    timer: maitake::time::Timer,
    parker: Parker,
    running: Cell<bool>,
}

impl Default for Executor {
    fn default() -> Self {
        Executor {
            scheduler: maitake::scheduler::LocalScheduler::new(),
            timer: maitake::time::Timer::new(time::clock()),
            parker: Parker::current(),
            running: Cell::new(false),
        }
    }
}

struct RunningGuard<'a>(&'a Cell<bool>);

impl Drop for RunningGuard<'_> {
    fn drop(&mut self) {
        self.0.set(false);
    }
}

impl Executor {
    /// Drives `func()` to completion, running spawned tasks and timers in between.
    ///
    /// Tasks still pending when the main future completes stay on this thread's scheduler and
    /// resume on the next `run`.
    pub fn run<O, F>(&self, func: impl FnOnce() -> F) -> Result<O, Error>
    where
        F: Future<Output = O> + 'static,
        O: 'static,
    {
        if self.running.replace(true) {
            return Err(Error::ExecutorAlreadyRunning);
        }
        let _guard = RunningGuard(&self.running);

        let main_task = self.spawn(func());
        let mut main_task = pin!(main_task);
        let waker = self.parker.waker();
        let mut cx = Context::from_waker(&waker);
        loop {
            self.timer.try_turn();
            let tick = self.scheduler.tick();
            if let Poll::Ready(output) = main_task.as_mut().poll(&mut cx) {
                return output.map_err(|_| Error::JoinFailed);
            }
            let turn = self.timer.try_turn();
            if !tick.has_remaining && turn.as_ref().map(|t| t.expired == 0).unwrap_or(true) {
                self.parker
                    .park(turn.and_then(|turn| turn.time_to_next_deadline()));
            }
        }
    }

    pub fn spawn<F>(&self, future: F) -> JoinHandle<F::Output>
    where
        F: Future + 'static,
        F::Output: 'static,
    {
        self.scheduler.spawn(Unparking {
            future,
            parker: self.parker.clone(),
            waker: None,
        })
    }

    pub(crate) fn with<R>(f: impl for<'a> FnOnce(&'a Self) -> R) -> R {
        EXEC.with(|exec| f(exec))
    }

    /// Like [`Executor::with`], but returns `None` while the thread-local is being torn down.
    pub(crate) fn try_with<R>(f: impl for<'a> FnOnce(&'a Self) -> R) -> Option<R> {
        EXEC.try_with(|exec| f(exec)).ok()
    }
}

/// Parks the loop thread while nothing is runnable. Wakers handed to tasks unpark it, so a wake
/// from another thread is never missed while the loop sleeps.
#[derive(Clone)]
struct Parker {
    thread: Thread,
    notified: Arc<AtomicBool>,
}

impl Parker {
    fn current() -> Self {
        Parker {
            thread: std::thread::current(),
            notified: Arc::new(AtomicBool::new(false)),
        }
    }

    fn unpark(&self) {
        if !self.notified.swap(true, Ordering::AcqRel) {
            self.thread.unpark();
        }
    }

    fn park(&self, timeout: Option<Duration>) {
        if self.notified.swap(false, Ordering::AcqRel) {
            return;
        }
        match timeout {
            Some(timeout) => std::thread::park_timeout(timeout),
            None => std::thread::park(),
        }
        self.notified.store(false, Ordering::Release);
    }

    fn waker(&self) -> Waker {
        let parker = self.clone();
        waker_fn::waker_fn(move || parker.unpark())
    }
}

/// Wraps a spawned future so that waking it also unparks the loop thread.
#[pin_project::pin_project]
struct Unparking<F> {
    #[pin]
    future: F,
    parker: Parker,
    // (scheduler waker, combined waker), rebuilt when the scheduler hands out a new one
    waker: Option<(Waker, Waker)>,
}

impl<F: Future> Future for Unparking<F> {
    type Output = F::Output;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<F::Output> {
        let this = self.project();
        if this
            .waker
            .as_ref()
            .is_some_and(|(task, _)| !task.will_wake(cx.waker()))
        {
            *this.waker = None;
        }
        let parker = this.parker;
        let (_, waker) = this.waker.get_or_insert_with(|| {
            let task = cx.waker().clone();
            let inner = task.clone();
            let parker = parker.clone();
            let combined = waker_fn::waker_fn(move || {
                inner.wake_by_ref();
                parker.unpark();
            });
            (task, combined)
        });
        this.future.poll(&mut Context::from_waker(waker))
    }
}

/// Runs `func()` on this thread's executor until it completes.
///
/// # Panics
/// Panics if called from inside a future already driven by `run` on the same thread.
pub fn run<R, F>(func: impl FnOnce() -> F) -> R
where
    F: Future<Output = R> + 'static,
    R: 'static,
{
    match Executor::with(|e| e.run(func)) {
        Ok(output) => output,
        Err(err) => panic!("{err}"),
    }
}

pub fn spawn<F>(f: F) -> JoinHandle<F::Output>
where
    F: Future + 'static,
    F::Output: 'static,
{
    Executor::with(|exec| exec.spawn(f))
}

/// Like [`spawn`], but returns `None` instead of panicking once this thread's executor is gone.
///
/// Meant for `Drop` impls that may run during thread teardown.
pub fn try_spawn<F>(f: F) -> Option<JoinHandle<F::Output>>
where
    F: Future + 'static,
    F::Output: 'static,
{
    Executor::try_with(|exec| exec.spawn(f))
}

/// Yields to the event loop once, letting other ready tasks run.
pub async fn yield_now() {
    let mut yielded = false;
    std::future::poll_fn(|cx| {
        if yielded {
            return Poll::Ready(());
        }
        yielded = true;
        cx.waker().wake_by_ref();
        Poll::Pending
    })
    .await
}
