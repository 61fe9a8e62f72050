use std::{
    future::Future,
    pin::Pin,
    task::{Context, Poll},
};

/// Future returned by [`race_all`].
#[must_use = "futures do nothing unless polled"]
pub struct RaceAll<F> {
    futures: Option<Pin<Box<[F]>>>,
}

/// Resolves with the output of whichever future finishes first, dropping the rest.
///
/// Resolves to `None` immediately when given no futures. Futures are polled in input order, so
/// earlier entries win ties.
pub fn race_all<F: Future>(futures: impl IntoIterator<Item = F>) -> RaceAll<F> {
    let futures: Box<[F]> = futures.into_iter().collect();
    RaceAll {
        futures: Some(Box::into_pin(futures)),
    }
}

impl<F: Future> Future for RaceAll<F> {
    type Output = Option<F::Output>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        let futures = this
            .futures
            .as_mut()
            .expect("`RaceAll` polled after completion");
        // SAFETY: the boxed slice is pinned and elements are only exposed through `Pin`.
        let slice = unsafe { futures.as_mut().get_unchecked_mut() };
        let winner = if slice.is_empty() {
            Some(None)
        } else {
            slice.iter_mut().find_map(|future| {
                match unsafe { Pin::new_unchecked(future) }.poll(cx) {
                    Poll::Ready(output) => Some(Some(output)),
                    Poll::Pending => None,
                }
            })
        };
        match winner {
            Some(output) => {
                this.futures = None;
                Poll::Ready(output)
            }
            None => Poll::Pending,
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::AnyFuture;

    #[crate::test]
    async fn test_race_all_first_wins() {
        let futures = [50u64, 5, 20].map(|ms| {
            AnyFuture::new(async move {
                crate::sleep(Duration::from_millis(ms)).await;
                ms
            })
        });
        assert_eq!(race_all(futures).await, Some(5));
    }

    #[crate::test]
    async fn test_race_all_empty() {
        assert_eq!(race_all(Vec::<AnyFuture<u8>>::new()).await, None);
    }
}
