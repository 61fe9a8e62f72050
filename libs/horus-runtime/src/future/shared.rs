use std::{
    cell::RefCell,
    future::Future,
    pin::Pin,
    rc::Rc,
    sync::{Arc, Mutex},
    task::{Context, Poll, Waker},
};

use slab::Slab;

/// Wakers of every clone waiting on a [`Shared`] future. The inner future is polled with a
/// waker that wakes all of them, so any clone may drive it to completion.
#[derive(Default)]
struct Notifier {
    wakers: Mutex<Slab<Option<Waker>>>,
}

impl Notifier {
    fn lock(&self) -> std::sync::MutexGuard<'_, Slab<Option<Waker>>> {
        self.wakers
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn wake_all(&self) {
        let wakers: Vec<Waker> = self
            .lock()
            .iter_mut()
            .filter_map(|(_, waker)| waker.take())
            .collect();
        for waker in wakers {
            waker.wake();
        }
    }
}

enum State<F: Future> {
    Pending(Pin<Box<F>>),
    // taken out while one of the clones polls it
    Polling,
    Done(F::Output),
}

struct Inner<F: Future> {
    state: RefCell<State<F>>,
    notifier: Arc<Notifier>,
    waker: Waker,
}

/// A cloneable future. The wrapped future runs once and every clone resolves to a clone of its
/// output, including clones made after it finished.
#[must_use = "futures do nothing unless polled"]
pub struct Shared<F: Future> {
    inner: Rc<Inner<F>>,
    key: Option<usize>,
}

impl<F: Future> Shared<F>
where
    F::Output: Clone,
{
    pub(crate) fn new(future: F) -> Self {
        let notifier = Arc::new(Notifier::default());
        let waker = {
            let notifier = notifier.clone();
            waker_fn::waker_fn(move || notifier.wake_all())
        };
        Shared {
            inner: Rc::new(Inner {
                state: RefCell::new(State::Pending(Box::pin(future))),
                notifier,
                waker,
            }),
            key: None,
        }
    }

    /// The output, if the future has already completed.
    pub fn peek(&self) -> Option<F::Output> {
        match &*self.inner.state.borrow() {
            State::Done(output) => Some(output.clone()),
            _ => None,
        }
    }

    fn register(&mut self, waker: &Waker) {
        let mut wakers = self.inner.notifier.lock();
        match self.key.and_then(|key| wakers.get_mut(key)) {
            Some(Some(existing)) if existing.will_wake(waker) => {}
            Some(slot) => *slot = Some(waker.clone()),
            None => self.key = Some(wakers.insert(Some(waker.clone()))),
        }
    }
}

impl<F: Future> Clone for Shared<F> {
    fn clone(&self) -> Self {
        Shared {
            inner: self.inner.clone(),
            key: None,
        }
    }
}

impl<F: Future> Future for Shared<F>
where
    F::Output: Clone,
{
    type Output = F::Output;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<F::Output> {
        let this = self.get_mut();
        if let Some(output) = this.peek() {
            return Poll::Ready(output);
        }
        this.register(cx.waker());

        let state = std::mem::replace(&mut *this.inner.state.borrow_mut(), State::Polling);
        let mut future = match state {
            State::Pending(future) => future,
            // polled from inside the wrapped future; the outer poll wakes us when it finishes
            State::Polling => return Poll::Pending,
            State::Done(_) => unreachable!("checked by `peek` above"),
        };
        match future.as_mut().poll(&mut Context::from_waker(&this.inner.waker)) {
            Poll::Ready(output) => {
                *this.inner.state.borrow_mut() = State::Done(output.clone());
                this.inner.notifier.wake_all();
                Poll::Ready(output)
            }
            Poll::Pending => {
                *this.inner.state.borrow_mut() = State::Pending(future);
                Poll::Pending
            }
        }
    }
}

impl<F: Future> Drop for Shared<F> {
    fn drop(&mut self) {
        if let Some(key) = self.key.take() {
            self.inner.notifier.lock().try_remove(key);
        }
    }
}

#[cfg(test)]
mod tests {
    use std::{cell::Cell, time::Duration};

    use futures_lite::future::poll_once;

    use super::*;
    use crate::FutureExt;

    #[crate::test]
    async fn test_every_clone_gets_the_output() {
        let runs = Rc::new(Cell::new(0));
        let shared = {
            let runs = runs.clone();
            async move {
                runs.set(runs.get() + 1);
                crate::sleep(Duration::from_millis(5)).await;
                String::from("ready")
            }
        }
        .shared();
        let a = crate::spawn(shared.clone());
        let b = crate::spawn(shared.clone());
        assert_eq!(shared.await, "ready");
        assert_eq!(a.await.unwrap(), "ready");
        assert_eq!(b.await.unwrap(), "ready");
        assert_eq!(runs.get(), 1);
    }

    #[crate::test]
    async fn test_clone_after_completion() {
        let shared = async { 7 }.shared();
        assert_eq!(shared.peek(), None);
        assert_eq!(shared.clone().await, 7);
        assert_eq!(shared.peek(), Some(7));
        assert_eq!(shared.clone().await, 7);
    }

    #[crate::test]
    async fn test_dropping_the_driving_clone_hands_over() {
        let shared = async {
            crate::sleep(Duration::from_millis(5)).await;
            1u8
        }
        .shared();
        let mut first = shared.clone();
        assert!(poll_once(&mut first).await.is_none());
        let second = crate::spawn(shared.clone());
        drop(first);
        assert_eq!(second.await.unwrap(), 1);
    }
}
