use std::{
    future::Future,
    ops::ControlFlow,
    pin::Pin,
    task::{Context, Poll, ready},
};

use pin_project::pin_project;

// Steps that complete immediately are chained within one poll up to this many times before the
// loop yields back to the scheduler.
const STEPS_PER_POLL: usize = 64;

/// Future returned by [`loop_fn`].
#[pin_project]
#[must_use = "futures do nothing unless polled"]
pub struct Loop<S, F, Fut> {
    step: F,
    state: Option<S>,
    #[pin]
    current: Option<Fut>,
}

/// Repeatedly awaits `step(state)` until it breaks with a value or fails.
///
/// The next step is started from inside `poll`, so long-running loops use constant stack.
pub fn loop_fn<S, B, E, F, Fut>(init: S, step: F) -> Loop<S, F, Fut>
where
    F: FnMut(S) -> Fut,
    Fut: Future<Output = Result<ControlFlow<B, S>, E>>,
{
    Loop {
        step,
        state: Some(init),
        current: None,
    }
}

impl<S, B, E, F, Fut> Future for Loop<S, F, Fut>
where
    F: FnMut(S) -> Fut,
    Fut: Future<Output = Result<ControlFlow<B, S>, E>>,
{
    type Output = Result<B, E>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let mut this = self.project();
        for _ in 0..STEPS_PER_POLL {
            if let Some(future) = this.current.as_mut().as_pin_mut() {
                let output = ready!(future.poll(cx));
                this.current.set(None);
                match output {
                    Ok(ControlFlow::Continue(state)) => *this.state = Some(state),
                    Ok(ControlFlow::Break(value)) => return Poll::Ready(Ok(value)),
                    Err(err) => return Poll::Ready(Err(err)),
                }
            }
            let state = this.state.take().expect("`Loop` polled after completion");
            this.current.set(Some((this.step)(state)));
        }
        cx.waker().wake_by_ref();
        Poll::Pending
    }
}
