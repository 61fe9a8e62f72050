use std::sync::{
    Arc, Mutex, Weak,
    atomic::{AtomicBool, Ordering},
};

use maitake::sync::WaitQueue;

/// Shared cancellation state. Firing it closes `waiters`, so every current and later wait
/// resolves, and fires every live child.
struct Signal {
    fired: AtomicBool,
    waiters: WaitQueue,
    children: Mutex<Vec<Weak<Signal>>>,
}

impl Signal {
    fn new() -> Arc<Self> {
        Arc::new(Signal {
            fired: AtomicBool::new(false),
            waiters: WaitQueue::new(),
            children: Mutex::new(Vec::new()),
        })
    }

    fn fire(&self) {
        if self.fired.swap(true, Ordering::AcqRel) {
            return;
        }
        self.waiters.close();
        let children = std::mem::take(
            &mut *self
                .children
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner()),
        );
        for child in children.iter().filter_map(Weak::upgrade) {
            child.fire();
        }
    }

    fn adopt(&self, child: &Arc<Signal>) {
        {
            let mut children = self
                .children
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            children.retain(|c| c.strong_count() > 0);
            children.push(Arc::downgrade(child));
        }
        // `fire` may have drained the list before the push
        if self.fired.load(Ordering::Acquire) {
            child.fire();
        }
    }
}

impl Drop for Signal {
    fn drop(&mut self) {
        // nobody is left to cancel this token, so release whatever hangs off it
        self.fire();
    }
}

/// Cooperative cancellation signal shared between a task and whoever may stop it.
///
/// Cancellation flows down: cancelling (or dropping every clone of) a token cancels its
/// children, and cancelling a child leaves the parent untouched.
#[derive(Clone)]
pub struct CancelToken {
    signal: Arc<Signal>,
}

impl Default for CancelToken {
    fn default() -> Self {
        CancelToken {
            signal: Signal::new(),
        }
    }
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.signal.fire();
    }

    pub fn is_cancelled(&self) -> bool {
        self.signal.fired.load(Ordering::Acquire)
    }

    /// Resolves once the token, or any of its ancestors, is cancelled.
    pub async fn wait(&self) {
        while self.signal.waiters.wait().await.is_ok() {}
    }

    pub fn child(&self) -> Self {
        let child = CancelToken::new();
        self.signal.adopt(&child.signal);
        child
    }

    pub fn drop_guard(self) -> CancelTokenDropGuard {
        CancelTokenDropGuard(self)
    }
}

/// Cancels its token when dropped.
pub struct CancelTokenDropGuard(CancelToken);

impl CancelTokenDropGuard {
    pub fn token(&self) -> &CancelToken {
        &self.0
    }
}

impl Drop for CancelTokenDropGuard {
    fn drop(&mut self) {
        self.0.cancel();
    }
}

/// Single value handed from one thread or task to another. Dropping the sender, with or without
/// a value, closes `ready`.
struct OneshotInner<T> {
    value: Mutex<Option<T>>,
    ready: WaitQueue,
}

/// Receiving half of [`oneshot`]; resolves to `None` if the sender is dropped without sending.
pub struct OneshotRx<T>(Arc<OneshotInner<T>>);

impl<T> OneshotRx<T> {
    pub async fn wait(self) -> Option<T> {
        while self.0.ready.wait().await.is_ok() {}
        self.0
            .value
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take()
    }
}

pub struct OneshotTx<T>(Arc<OneshotInner<T>>);

impl<T> OneshotTx<T> {
    pub fn send(self, value: T) {
        *self
            .0
            .value
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = Some(value);
    }
}

impl<T> Drop for OneshotTx<T> {
    fn drop(&mut self) {
        self.0.ready.close();
    }
}

pub fn oneshot<T>() -> (OneshotTx<T>, OneshotRx<T>) {
    let inner = Arc::new(OneshotInner {
        value: Mutex::new(None),
        ready: WaitQueue::new(),
    });
    (OneshotTx(inner.clone()), OneshotRx(inner))
}
