use std::{
    future::Future,
    pin::Pin,
    task::{Context, Poll, ready},
    time::{Duration, Instant},
};

use pin_project::pin_project;

use crate::{SleepUntil, sleep_until};

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[cfg_attr(feature = "miette", derive(miette::Diagnostic))]
#[error("deadline elapsed")]
pub struct Elapsed;

/// Future returned by [`timeout`] and [`timeout_at`].
#[pin_project]
#[must_use = "futures do nothing unless polled"]
pub struct Timeout<F> {
    // dropped as soon as the deadline passes
    #[pin]
    future: Option<F>,
    #[pin]
    sleep: SleepUntil,
}

pub fn timeout<F: Future>(duration: Duration, future: F) -> Timeout<F> {
    timeout_at(Instant::now() + duration, future)
}

pub fn timeout_at<F: Future>(deadline: Instant, future: F) -> Timeout<F> {
    Timeout {
        future: Some(future),
        sleep: sleep_until(deadline),
    }
}

impl<F: Future> Future for Timeout<F> {
    type Output = Result<F::Output, Elapsed>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let mut this = self.project();
        let future = this
            .future
            .as_mut()
            .as_pin_mut()
            .expect("`Timeout` polled after completion");
        if let Poll::Ready(output) = future.poll(cx) {
            this.future.set(None);
            return Poll::Ready(Ok(output));
        }
        ready!(this.sleep.poll(cx));
        this.future.set(None);
        Poll::Ready(Err(Elapsed))
    }
}

/// [`Timeout`] for fallible futures, reporting expiry through the future's own error type.
#[pin_project]
#[must_use = "futures do nothing unless polled"]
pub struct WithTimeout<F> {
    #[pin]
    inner: Timeout<F>,
}

impl<F> WithTimeout<F> {
    pub(crate) fn new(inner: Timeout<F>) -> Self {
        Self { inner }
    }
}

impl<F, T, E> Future for WithTimeout<F>
where
    F: Future<Output = Result<T, E>>,
    E: From<Elapsed>,
{
    type Output = Result<T, E>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let result = ready!(self.project().inner.poll(cx));
        Poll::Ready(result.unwrap_or_else(|elapsed| Err(elapsed.into())))
    }
}
