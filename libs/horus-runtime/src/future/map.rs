use std::{
    future::Future,
    pin::Pin,
    task::{Context, Poll, ready},
};

use pin_project::pin_project;

#[pin_project]
#[must_use = "futures do nothing unless polled"]
pub struct Map<Fut, F> {
    #[pin]
    future: Fut,
    f: Option<F>,
}

impl<Fut, F> Map<Fut, F> {
    pub(crate) fn new(future: Fut, f: F) -> Self {
        Self { future, f: Some(f) }
    }
}

impl<Fut, F, T, U, E> Future for Map<Fut, F>
where
    Fut: Future<Output = Result<T, E>>,
    F: FnOnce(T) -> U,
{
    type Output = Result<U, E>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.project();
        let result = ready!(this.future.poll(cx));
        let f = this.f.take().expect("`Map` polled after completion");
        Poll::Ready(result.map(f))
    }
}

#[pin_project(project = ThenProj, project_replace = ThenReplace)]
#[must_use = "futures do nothing unless polled"]
pub enum Then<Fut1, Fut2, F> {
    First {
        #[pin]
        future: Fut1,
        f: F,
    },
    Second {
        #[pin]
        future: Fut2,
    },
    Done,
}

impl<Fut1, Fut2, F> Then<Fut1, Fut2, F> {
    pub(crate) fn new(future: Fut1, f: F) -> Self {
        Then::First { future, f }
    }
}

impl<Fut1, Fut2, F, T, U, E> Future for Then<Fut1, Fut2, F>
where
    Fut1: Future<Output = Result<T, E>>,
    Fut2: Future<Output = Result<U, E>>,
    F: FnOnce(T) -> Fut2,
{
    type Output = Result<U, E>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        loop {
            match self.as_mut().project() {
                ThenProj::First { future, .. } => {
                    let result = ready!(future.poll(cx));
                    let ThenReplace::First { f, .. } = self.as_mut().project_replace(Then::Done)
                    else {
                        unreachable!()
                    };
                    match result {
                        Ok(value) => self.set(Then::Second { future: f(value) }),
                        Err(err) => return Poll::Ready(Err(err)),
                    }
                }
                ThenProj::Second { future } => {
                    let output = ready!(future.poll(cx));
                    self.set(Then::Done);
                    return Poll::Ready(output);
                }
                ThenProj::Done => panic!("`Then` polled after completion"),
            }
        }
    }
}

#[pin_project(project = CatchProj, project_replace = CatchReplace)]
#[must_use = "futures do nothing unless polled"]
pub enum Catch<Fut1, Fut2, F> {
    Trying {
        #[pin]
        future: Fut1,
        handler: F,
    },
    Recovering {
        #[pin]
        future: Fut2,
    },
    Done,
}

impl<Fut1, Fut2, F> Catch<Fut1, Fut2, F> {
    pub(crate) fn new(future: Fut1, handler: F) -> Self {
        Catch::Trying { future, handler }
    }
}

impl<Fut1, Fut2, F, T, E, E2> Future for Catch<Fut1, Fut2, F>
where
    Fut1: Future<Output = Result<T, E>>,
    Fut2: Future<Output = Result<T, E2>>,
    F: FnOnce(E) -> Fut2,
{
    type Output = Result<T, E2>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        loop {
            match self.as_mut().project() {
                CatchProj::Trying { future, .. } => {
                    let result = ready!(future.poll(cx));
                    let CatchReplace::Trying { handler, .. } =
                        self.as_mut().project_replace(Catch::Done)
                    else {
                        unreachable!()
                    };
                    match result {
                        Ok(value) => return Poll::Ready(Ok(value)),
                        Err(err) => self.set(Catch::Recovering {
                            future: handler(err),
                        }),
                    }
                }
                CatchProj::Recovering { future } => {
                    let output = ready!(future.poll(cx));
                    self.set(Catch::Done);
                    return Poll::Ready(output);
                }
                CatchProj::Done => panic!("`Catch` polled after completion"),
            }
        }
    }
}
