use std::{
    future::Future,
    pin::Pin,
    sync::LazyLock,
    task::{Context, Poll, ready},
    time::{Duration, Instant},
};

use maitake::time::{Clock, Sleep, Timer};
use pin_project::pin_project;

use crate::Executor;

/// Timer wheel resolution. Wheel capacity is 64^6 ticks, so millisecond ticks cover sleeps of
/// roughly two years.
const TICK: Duration = Duration::from_millis(1);

static EPOCH: LazyLock<Instant> = LazyLock::new(Instant::now);

pub(crate) fn clock() -> Clock {
    Clock::new(TICK, || EPOCH.elapsed().as_millis() as u64).named("horus-monotonic")
}

pub fn sleep(duration: Duration) -> Sleep<'static> {
    // SAFETY: the timer lives in this thread's executor, which outlives every task it runs
    let timer: &'static Timer = unsafe { &*Executor::with(|e| &e.timer as *const _) };
    timer.sleep(duration)
}

/// Sleeps until `deadline`, never resolving before it.
///
/// The wheel rounds to whole ticks and may fire a tick early, so an early expiry re-arms for the
/// remainder.
pub fn sleep_until(deadline: Instant) -> SleepUntil {
    SleepUntil {
        deadline,
        sleep: None,
    }
}

#[pin_project]
#[must_use = "futures do nothing unless polled"]
pub struct SleepUntil {
    deadline: Instant,
    #[pin]
    sleep: Option<Sleep<'static>>,
}

impl SleepUntil {
    pub fn deadline(&self) -> Instant {
        self.deadline
    }

    pub fn is_elapsed(&self) -> bool {
        Instant::now() >= self.deadline
    }
}

impl Future for SleepUntil {
    type Output = ();

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<()> {
        let mut this = self.project();
        loop {
            let now = Instant::now();
            if now >= *this.deadline {
                this.sleep.set(None);
                return Poll::Ready(());
            }
            match this.sleep.as_mut().as_pin_mut() {
                Some(sleep) => {
                    ready!(sleep.poll(cx));
                    this.sleep.set(None);
                }
                None => this.sleep.set(Some(sleep(*this.deadline - now + TICK))),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[crate::test]
    async fn test_sleep_until_never_early() {
        for ms in [1, 3, 10] {
            let deadline = Instant::now() + Duration::from_millis(ms);
            sleep_until(deadline).await;
            assert!(Instant::now() >= deadline);
        }
    }

    #[crate::test]
    async fn test_sleep_until_past_deadline_is_ready() {
        let deadline = Instant::now() - Duration::from_millis(10);
        let sleep = sleep_until(deadline);
        assert!(sleep.is_elapsed());
        sleep.await;
    }

    #[crate::test]
    async fn test_dropped_sleep_does_not_fire() {
        let sleep = sleep_until(Instant::now() + Duration::from_secs(30));
        assert!(futures_lite::future::poll_once(sleep).await.is_none());
        // a dropped sleep leaves nothing behind that would keep the loop busy
        let start = Instant::now();
        sleep_until(start + Duration::from_millis(5)).await;
        assert!(start.elapsed() < Duration::from_secs(1));
    }
}
