//! Submitting work to an event loop from other threads.
//!
//! A [`LoopHandle`] sends closures over a bounded channel to the thread running the loop, which
//! spawns them as local tasks. Callers then either block on a mutex/condvar pair
//! ([`LoopHandle::block_on`]) or await the result from another loop ([`LoopHandle::submit`]).
//! A loop that has exited, or that drops a submission without finishing it, resolves the caller
//! with [`Error::Shutdown`] instead of leaving it hanging.

use std::{
    cell::Cell,
    future::Future,
    pin::Pin,
    rc::Rc,
    sync::{Arc, Condvar, Mutex, MutexGuard},
    task::{Context, Poll, Waker},
};

use futures_lite::future;
use tracing::{debug, trace};

use crate::{
    Error,
    struc_con::{Joinable, Thread, ThreadBuilder},
    sync::WaitQueue,
    util::CancelToken,
};

type Job = Box<dyn FnOnce(Scope) + Send>;

pub const DEFAULT_CHANNEL_CAPACITY: usize = 64;

enum Slot<T> {
    Pending,
    Done(T),
    Taken,
    Abandoned,
}

struct CompletionState<T> {
    slot: Slot<T>,
    waker: Option<Waker>,
}

/// Result cell shared between the submitting thread and the loop thread.
struct Completion<T> {
    state: Mutex<CompletionState<T>>,
    condvar: Condvar,
}

impl<T> Completion<T> {
    fn new() -> Arc<Self> {
        Arc::new(Completion {
            state: Mutex::new(CompletionState {
                slot: Slot::Pending,
                waker: None,
            }),
            condvar: Condvar::new(),
        })
    }

    fn lock(&self) -> MutexGuard<'_, CompletionState<T>> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn resolve(&self, slot: Slot<T>) {
        let waker = {
            let mut state = self.lock();
            if !matches!(state.slot, Slot::Pending) {
                return;
            }
            state.slot = slot;
            state.waker.take()
        };
        self.condvar.notify_all();
        if let Some(waker) = waker {
            waker.wake();
        }
    }

    fn take(state: &mut CompletionState<T>) -> Option<Result<T, Error>> {
        match std::mem::replace(&mut state.slot, Slot::Taken) {
            Slot::Pending => {
                state.slot = Slot::Pending;
                None
            }
            Slot::Done(value) => Some(Ok(value)),
            Slot::Taken | Slot::Abandoned => Some(Err(Error::Shutdown)),
        }
    }

    fn wait(&self) -> Result<T, Error> {
        let mut state = self.lock();
        loop {
            if let Some(result) = Self::take(&mut state) {
                return result;
            }
            state = self
                .condvar
                .wait(state)
                .unwrap_or_else(|poisoned| poisoned.into_inner());
        }
    }
}

/// Resolves the completion as abandoned if the loop drops the submission before finishing it.
struct CompletionGuard<T> {
    completion: Option<Arc<Completion<T>>>,
}

impl<T> CompletionGuard<T> {
    fn complete(mut self, value: T) {
        if let Some(completion) = self.completion.take() {
            completion.resolve(Slot::Done(value));
        }
    }
}

impl<T> Drop for CompletionGuard<T> {
    fn drop(&mut self) {
        if let Some(completion) = self.completion.take() {
            trace!("remote submission dropped before completion");
            completion.resolve(Slot::Abandoned);
        }
    }
}

/// Future returned by [`LoopHandle::submit`].
#[must_use = "futures do nothing unless polled"]
pub struct RemoteFuture<T> {
    completion: Result<Arc<Completion<T>>, Option<Error>>,
}

impl<T> Future for RemoteFuture<T> {
    type Output = Result<T, Error>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        let completion = match &mut this.completion {
            Ok(completion) => completion,
            Err(err) => return Poll::Ready(Err(err.take().unwrap_or(Error::Shutdown))),
        };
        let mut state = completion.lock();
        if let Some(result) = Completion::take(&mut state) {
            return Poll::Ready(result);
        }
        match &state.waker {
            Some(waker) if waker.will_wake(cx.waker()) => {}
            _ => state.waker = Some(cx.waker().clone()),
        }
        Poll::Pending
    }
}

/// Cloneable, `Send` handle used by foreign threads to run futures on an event loop.
#[derive(Clone)]
pub struct LoopHandle {
    tx: flume::Sender<Job>,
}

impl LoopHandle {
    fn enqueue<T, F, Fut>(&self, f: F) -> Result<Arc<Completion<T>>, Error>
    where
        T: Send + 'static,
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = T> + 'static,
    {
        let completion = Completion::new();
        let guard = CompletionGuard {
            completion: Some(completion.clone()),
        };
        let job: Job = Box::new(move |scope: Scope| {
            scope.spawn(async move {
                let output = f().await;
                guard.complete(output);
            });
        });
        self.tx.send(job).map_err(|_| Error::Shutdown)?;
        Ok(completion)
    }

    /// Runs `f()` on the loop and blocks the calling thread until it resolves.
    ///
    /// Must not be called from the loop thread itself, which would deadlock.
    pub fn block_on<T, F, Fut>(&self, f: F) -> Result<T, Error>
    where
        T: Send + 'static,
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = T> + 'static,
    {
        self.enqueue(f)?.wait()
    }

    /// Runs `f()` on the loop, returning a future that any other executor can await.
    pub fn submit<T, F, Fut>(&self, f: F) -> RemoteFuture<T>
    where
        T: Send + 'static,
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = T> + 'static,
    {
        RemoteFuture {
            completion: self.enqueue(f).map_err(Some),
        }
    }

    /// Fire-and-forget: spawns `f()` on the loop without waiting for it.
    pub fn spawn<F, Fut>(&self, f: F) -> Result<(), Error>
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + 'static,
    {
        let job: Job = Box::new(move |scope: Scope| scope.spawn(f()));
        self.tx.send(job).map_err(|_| Error::Shutdown)
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_disconnected()
    }
}

/// Submissions spawned on the loop that have not finished yet.
struct InFlight {
    count: Cell<usize>,
    idle: WaitQueue,
}

impl InFlight {
    fn new() -> Rc<Self> {
        Rc::new(InFlight {
            count: Cell::new(0),
            idle: WaitQueue::new(),
        })
    }
}

/// Handed to each job so the task it spawns is counted and stops when the loop is cancelled.
struct Scope {
    in_flight: Rc<InFlight>,
    cancel: CancelToken,
}

impl Scope {
    fn spawn(self, work: impl Future<Output = ()> + 'static) {
        let Scope { in_flight, cancel } = self;
        in_flight.count.set(in_flight.count.get() + 1);
        crate::spawn(async move {
            // dropping `work` on cancellation resolves its caller with `Shutdown`
            future::race(work, cancel.wait()).await;
            in_flight.count.set(in_flight.count.get() - 1);
            if in_flight.count.get() == 0 {
                in_flight.idle.wake_all();
            }
        });
    }
}

/// Drains submissions from `rx` on the current loop until every handle is dropped or `cancel`
/// fires, then waits for the submissions still running.
async fn serve(rx: flume::Receiver<Job>, cancel: CancelToken) {
    let in_flight = InFlight::new();
    let drain = async {
        while let Ok(job) = rx.recv_async().await {
            job(Scope {
                in_flight: in_flight.clone(),
                cancel: cancel.child(),
            });
        }
        debug!("all loop handles dropped");
    };
    future::race(drain, cancel.wait()).await;
    let _ = in_flight
        .idle
        .wait_for(|| in_flight.count.get() == 0)
        .await;
}

/// An event loop running on a dedicated thread.
///
/// Dropping it cancels the loop; pending and future submissions resolve with
/// [`Error::Shutdown`].
pub struct EventLoop {
    handle: LoopHandle,
    thread: Option<Thread<()>>,
}

impl EventLoop {
    pub fn spawn_thread() -> Self {
        Self::with_capacity(DEFAULT_CHANNEL_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        let (tx, rx) = flume::bounded::<Job>(capacity);
        let thread = ThreadBuilder::default()
            .name("horus-event-loop")
            .event_loop_with_cancel(move |cancel| serve(rx, cancel));
        EventLoop {
            handle: LoopHandle { tx },
            thread: Some(thread),
        }
    }

    pub fn handle(&self) -> LoopHandle {
        self.handle.clone()
    }

    /// Stops the loop and waits for its thread to exit.
    pub fn shutdown(mut self) -> Result<(), Error> {
        self.stop()
    }

    fn stop(&mut self) -> Result<(), Error> {
        let Some(thread) = self.thread.take() else {
            return Ok(());
        };
        thread.cancel_token().cancel();
        futures_lite::future::block_on(thread.join())
    }
}

impl Drop for EventLoop {
    fn drop(&mut self) {
        if let Err(err) = self.stop() {
            debug!(?err, "event loop thread exited abnormally");
        }
    }
}

#[cfg(test)]
mod tests {
    use std::{cell::Cell, rc::Rc, time::Duration};

    use super::*;

    #[test]
    fn test_block_on_from_foreign_thread() {
        let event_loop = EventLoop::spawn_thread();
        let handle = event_loop.handle();
        let value = std::thread::spawn(move || {
            handle.block_on(|| async {
                crate::sleep(Duration::from_millis(5)).await;
                // loop-local state is fine inside the submitted future
                let counter = Rc::new(Cell::new(1));
                counter.set(counter.get() + 1);
                counter.get()
            })
        })
        .join()
        .unwrap();
        assert_eq!(value.unwrap(), 2);
    }

    #[test]
    fn test_submit_after_shutdown_fails() {
        let event_loop = EventLoop::spawn_thread();
        let handle = event_loop.handle();
        event_loop.shutdown().unwrap();
        assert!(matches!(
            handle.block_on(|| async { 1 }),
            Err(Error::Shutdown)
        ));
        let result = futures_lite::future::block_on(handle.submit(|| async { 1 }));
        assert!(matches!(result, Err(Error::Shutdown)));
    }

    #[test]
    fn test_pending_submission_resolves_on_shutdown() {
        let event_loop = EventLoop::spawn_thread();
        let handle = event_loop.handle();
        let waiter = std::thread::spawn(move || {
            handle.block_on(|| async {
                crate::sleep(Duration::from_secs(60)).await;
            })
        });
        std::thread::sleep(Duration::from_millis(20));
        drop(event_loop);
        assert!(matches!(waiter.join().unwrap(), Err(Error::Shutdown)));
    }

    #[crate::test]
    async fn test_submit_from_another_loop() {
        let event_loop = EventLoop::spawn_thread();
        let value = event_loop.handle().submit(|| async { 6 * 7 }).await;
        assert_eq!(value.unwrap(), 42);
    }
}
