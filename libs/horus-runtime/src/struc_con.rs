//! Structured concurrency across OS threads: blocking work and dedicated event-loop threads
//! whose lifetime is tied to a handle.

use std::{future::Future, marker::PhantomData, pin::Pin, task::Poll};

use futures_lite::future;

use crate::{
    Error,
    util::{CancelToken, OneshotRx, oneshot},
};

pub trait Joinable<T> {
    fn join(self) -> impl Future<Output = Result<T, Error>>;
    fn cancel(self);
}

pub struct Thread<T> {
    handle: std::thread::JoinHandle<()>,
    cancel_token: CancelToken,
    rx: OneshotRx<T>,
}

impl<T> Thread<T> {
    pub fn cancel_token(&self) -> &CancelToken {
        &self.cancel_token
    }

    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }
}

pub fn thread<T, F>(f: F) -> Thread<T>
where
    T: Send + 'static,
    F: FnOnce(CancelToken) -> T + Send + 'static,
{
    ThreadBuilder::default().thread(f)
}

/// Runs blocking `f` on its own thread and resolves with its result without blocking the loop.
pub async fn unblock<T, F>(f: F) -> Result<T, Error>
where
    T: Send + 'static,
    F: FnOnce() -> T + Send + 'static,
{
    thread(move |_| f()).join().await
}

impl<T: Send> Joinable<T> for Thread<T> {
    fn join(self) -> impl Future<Output = Result<T, Error>> {
        JoinFuture {
            f: self.rx.wait(),
            phantom_data: PhantomData,
            cancel_token: self.cancel_token,
            handle: Some(self.handle),
        }
    }

    fn cancel(self) {
        self.cancel_token.cancel();
    }
}

#[pin_project::pin_project(PinnedDrop)]
pub struct JoinFuture<T, F> {
    #[pin]
    f: F,
    phantom_data: PhantomData<T>,
    handle: Option<std::thread::JoinHandle<()>>,
    cancel_token: CancelToken,
}

#[pin_project::pinned_drop]
impl<T, F> PinnedDrop for JoinFuture<T, F> {
    fn drop(self: Pin<&mut Self>) {
        let this = self.project();
        this.cancel_token.cancel();
    }
}

impl<T, F> Future for JoinFuture<T, F>
where
    F: Future<Output = Option<T>>,
{
    type Output = Result<T, Error>;

    fn poll(self: Pin<&mut Self>, cx: &mut std::task::Context<'_>) -> Poll<Self::Output> {
        let this = self.project();
        let res = std::task::ready!(this.f.poll(cx));
        // the value is sent as the thread's last action, so this join is short
        if let Some(handle) = this.handle.take() {
            if handle.join().is_err() {
                return Poll::Ready(Err(Error::JoinFailed));
            }
        }
        Poll::Ready(res.ok_or(Error::JoinFailed))
    }
}

/// Spawns a thread running its own event loop until `f()` completes or the thread is cancelled.
pub fn event_loop<T, F, Fut>(f: F) -> Thread<Option<T>>
where
    T: Send + 'static,
    F: FnOnce() -> Fut + Send + 'static,
    Fut: Future<Output = T> + 'static,
{
    ThreadBuilder::default().event_loop(f)
}

#[derive(Default)]
pub struct ThreadBuilder {
    cancel_token: Option<CancelToken>,
    name: Option<String>,
}

impl ThreadBuilder {
    pub fn cancel_token(mut self, cancel_token: CancelToken) -> Self {
        self.cancel_token = Some(cancel_token);
        self
    }

    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn thread<T, F>(self, f: F) -> Thread<T>
    where
        T: Send + 'static,
        F: FnOnce(CancelToken) -> T + Send + 'static,
    {
        let (tx, rx) = oneshot::<T>();
        let cancel_token = self.cancel_token.unwrap_or_default();
        let thread_cancel_token = cancel_token.clone();
        let mut builder = std::thread::Builder::new();
        if let Some(name) = self.name {
            builder = builder.name(name);
        }
        let body = move || {
            tx.send(f(thread_cancel_token));
        };
        let handle = match builder.spawn(body) {
            Ok(handle) => handle,
            Err(err) => panic!("failed to spawn thread: {err}"),
        };
        Thread {
            handle,
            rx,
            cancel_token,
        }
    }

    pub fn event_loop<T, F, Fut>(self, f: F) -> Thread<Option<T>>
    where
        T: Send + 'static,
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = T> + 'static,
    {
        self.thread(|cancel| {
            crate::run(move || {
                future::race(async { Some(f().await) }, async move {
                    cancel.wait().await;
                    None
                })
            })
        })
    }

    pub fn event_loop_with_cancel<T, F, Fut>(self, f: F) -> Thread<T>
    where
        T: Send + 'static,
        F: FnOnce(CancelToken) -> Fut + Send + 'static,
        Fut: Future<Output = T> + 'static,
    {
        self.thread(|cancel| crate::run(move || f(cancel)))
    }
}
