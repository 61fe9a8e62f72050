//! Combinators over [`Future`]s that resolve to `Result<T, E>`.
//!
//! Errors travel in the `Err` channel and are never dropped: `map` and `then` skip them, `catch`
//! is the only combinator that looks at them. Every combinator is a plain state machine stored
//! inline in its parent, so chaining them does not allocate.

use std::{future::Future, time::Duration, time::Instant};

mod any;
mod join;
mod loop_fn;
mod map;
mod race;
mod shared;
mod timeout;

pub use any::AnyFuture;
pub use join::{JoinAll, join_all};
pub use loop_fn::{Loop, loop_fn};
pub use map::{Catch, Map, Then};
pub use race::{RaceAll, race_all};
pub use shared::Shared;
pub use timeout::{Elapsed, Timeout, WithTimeout, timeout, timeout_at};

/// Resolves with whichever of two futures finishes first, dropping the other.
pub use futures_lite::future::race;

/// Left-to-right application: `pipe!(x, a, b)` is `b(a(x))`.
///
/// ```
/// use horus_runtime::pipe;
///
/// let double = |x: u32| x * 2;
/// let describe = |x: u32| format!("{x}");
/// assert_eq!(pipe!(21, double, describe), "42");
/// ```
#[macro_export]
macro_rules! pipe {
    ($value:expr $(,)?) => { $value };
    ($value:expr, $op:expr $(, $rest:expr)* $(,)?) => {
        $crate::pipe!(($op)($value) $(, $rest)*)
    };
}

pub trait FutureExt: Future + Sized {
    /// Fails with [`Elapsed`] if the future has not completed within `duration`.
    fn timeout(self, duration: Duration) -> Timeout<Self> {
        timeout(duration, self)
    }

    fn timeout_at(self, deadline: Instant) -> Timeout<Self> {
        timeout_at(deadline, self)
    }

    /// Makes the future cloneable; every clone resolves to a clone of the output.
    fn shared(self) -> Shared<Self>
    where
        Self::Output: Clone,
    {
        Shared::new(self)
    }

    fn boxed_any(self) -> AnyFuture<Self::Output>
    where
        Self: 'static,
        Self::Output: 'static,
    {
        AnyFuture::new(self)
    }
}

impl<F: Future> FutureExt for F {}

pub trait TryFutureExt<T, E>: Future<Output = Result<T, E>> + Sized {
    fn map<U, F>(self, f: F) -> Map<Self, F>
    where
        F: FnOnce(T) -> U,
    {
        Map::new(self, f)
    }

    fn then<U, Fut, F>(self, f: F) -> Then<Self, Fut, F>
    where
        F: FnOnce(T) -> Fut,
        Fut: Future<Output = Result<U, E>>,
    {
        Then::new(self, f)
    }

    /// Hands errors to `handler`, which recovers with `Ok` or propagates with `Err`.
    fn catch<E2, Fut, F>(self, handler: F) -> Catch<Self, Fut, F>
    where
        F: FnOnce(E) -> Fut,
        Fut: Future<Output = Result<T, E2>>,
    {
        Catch::new(self, handler)
    }

    /// Like [`FutureExt::timeout`], with the timeout folded into the future's own error type.
    fn with_timeout(self, duration: Duration) -> WithTimeout<Self>
    where
        E: From<Elapsed>,
    {
        WithTimeout::new(timeout(duration, self))
    }

    fn with_deadline(self, deadline: Instant) -> WithTimeout<Self>
    where
        E: From<Elapsed>,
    {
        WithTimeout::new(timeout_at(deadline, self))
    }
}

impl<T, E, F: Future<Output = Result<T, E>>> TryFutureExt<T, E> for F {}

#[cfg(test)]
mod tests {
    use std::future::ready;

    use super::*;

    #[derive(Debug, PartialEq)]
    enum TestError {
        Disconnected,
        Other(&'static str),
        Elapsed,
    }

    impl From<Elapsed> for TestError {
        fn from(_: Elapsed) -> Self {
            TestError::Elapsed
        }
    }

    #[crate::test]
    async fn test_map_and_then() {
        let out = ready(Ok::<_, TestError>(20))
            .map(|x| x + 1)
            .then(|x| ready(Ok(x * 2)))
            .await;
        assert_eq!(out, Ok(42));
    }

    #[crate::test]
    async fn test_map_passes_errors_through() {
        let mut called = false;
        let out = ready(Err::<u8, _>(TestError::Other("boom")))
            .map(|x| {
                called = true;
                x
            })
            .await;
        assert_eq!(out, Err(TestError::Other("boom")));
        assert!(!called);
    }

    #[crate::test]
    async fn test_catch_recovers_matching_error() {
        let recovered = ready(Err::<u8, _>(TestError::Disconnected))
            .catch(|err| async move {
                match err {
                    TestError::Disconnected => Ok(0),
                    other => Err(other),
                }
            })
            .await;
        assert_eq!(recovered, Ok(0));

        let propagated = ready(Err::<u8, _>(TestError::Other("nope")))
            .catch(|err| async move {
                match err {
                    TestError::Disconnected => Ok(0),
                    other => Err(other),
                }
            })
            .await;
        assert_eq!(propagated, Err(TestError::Other("nope")));
    }

    #[crate::test]
    async fn test_with_timeout_folds_error() {
        let slow = async {
            crate::sleep(Duration::from_secs(10)).await;
            Ok::<_, TestError>(())
        };
        assert_eq!(
            slow.with_timeout(Duration::from_millis(10)).await,
            Err(TestError::Elapsed)
        );
        let fast = ready(Ok::<_, TestError>(1)).with_timeout(Duration::from_secs(1));
        assert_eq!(fast.await, Ok(1));
    }

    #[test]
    fn test_pipe_is_left_to_right() {
        let add_one = |x: i32| x + 1;
        let square = |x: i32| x * x;
        assert_eq!(pipe!(2, add_one, square), square(add_one(2)));
        assert_eq!(pipe!(2), 2);
    }
}
