use std::{
    future::Future,
    pin::Pin,
    task::{Context, Poll},
};

use pin_project::pin_project;

#[pin_project(project = ElemProj, project_replace = ElemReplace)]
enum Elem<F: Future> {
    Pending(#[pin] F),
    Done(F::Output),
    Taken,
}

/// Future returned by [`join_all`].
#[must_use = "futures do nothing unless polled"]
pub struct JoinAll<F: Future> {
    elems: Pin<Box<[Elem<F>]>>,
    remaining: usize,
}

/// Drives every future concurrently and resolves with all their outputs, in input order.
///
/// Completion waits for every future; an `Err` from one of them does not cancel the others.
/// Wrap items in [`catch`](crate::TryFutureExt::catch) for per-item recovery.
pub fn join_all<F: Future>(futures: impl IntoIterator<Item = F>) -> JoinAll<F> {
    let elems: Box<[Elem<F>]> = futures.into_iter().map(Elem::Pending).collect();
    let remaining = elems.len();
    JoinAll {
        elems: Box::into_pin(elems),
        remaining,
    }
}

impl<F: Future> JoinAll<F> {
    fn elems_mut(&mut self) -> impl Iterator<Item = Pin<&mut Elem<F>>> {
        // SAFETY: elements live in a pinned boxed slice that is never reallocated, and each one is
        // only handed out pinned.
        unsafe { self.elems.as_mut().get_unchecked_mut() }
            .iter_mut()
            .map(|elem| unsafe { Pin::new_unchecked(elem) })
    }
}

impl<F: Future> Future for JoinAll<F> {
    type Output = Vec<F::Output>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        let mut completed = 0;
        for mut elem in this.elems_mut() {
            if let ElemProj::Pending(future) = elem.as_mut().project() {
                if let Poll::Ready(output) = future.poll(cx) {
                    elem.set(Elem::Done(output));
                    completed += 1;
                }
            }
        }
        this.remaining -= completed;
        if this.remaining > 0 {
            return Poll::Pending;
        }
        let outputs = this
            .elems_mut()
            .filter_map(|elem| match elem.project_replace(Elem::Taken) {
                ElemReplace::Done(output) => Some(output),
                _ => None,
            })
            .collect();
        Poll::Ready(outputs)
    }
}

#[cfg(test)]
mod tests {
    use std::{cell::RefCell, rc::Rc, time::Duration};

    use super::*;
    use crate::AnyFuture;

    #[crate::test]
    async fn test_join_all_preserves_input_order() {
        let finished = Rc::new(RefCell::new(Vec::new()));
        let futures = [30u64, 10, 20].map(|ms| {
            let finished = finished.clone();
            AnyFuture::new(async move {
                crate::sleep(Duration::from_millis(ms)).await;
                finished.borrow_mut().push(ms);
                ms
            })
        });
        let outputs = join_all(futures).await;
        assert_eq!(outputs, vec![30, 10, 20]);
        assert_eq!(*finished.borrow(), vec![10, 20, 30]);
    }

    #[crate::test]
    async fn test_join_all_does_not_short_circuit() {
        let futures = vec![
            AnyFuture::new(async { Err::<u8, &str>("first") }),
            AnyFuture::new(async {
                crate::sleep(Duration::from_millis(5)).await;
                Ok(2)
            }),
        ];
        let outputs = join_all(futures).await;
        assert_eq!(outputs, vec![Err("first"), Ok(2)]);
    }

    #[crate::test]
    async fn test_join_all_empty() {
        let outputs = join_all(Vec::<std::future::Ready<u8>>::new()).await;
        assert!(outputs.is_empty());
    }
}
