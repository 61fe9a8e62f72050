//! Single-owner values that can be reached from callbacks outliving the current stack frame.
//!
//! An [`Owned<T>`] is the only owner of its value. [`Borrowed<T>`] handles obtained from it can
//! be moved into spawned tasks and callbacks. By default a borrow does not keep the value alive
//! and every access asserts that the owner still exists; [`BorrowMode::Allocate`] borrows share
//! ownership instead. Both are `!Send`, so a borrow can never be used from another thread.

use std::{
    cell::RefCell,
    fmt,
    rc::{Rc, Weak},
};

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub enum BorrowMode {
    /// The borrow panics on access once the owner is gone.
    #[default]
    Assert,
    /// The borrow keeps the value alive.
    Allocate,
}

pub struct Owned<T> {
    inner: Rc<RefCell<T>>,
}

impl<T> Owned<T> {
    pub fn new(value: T) -> Self {
        Owned {
            inner: Rc::new(RefCell::new(value)),
        }
    }

    pub fn borrow(&self) -> Borrowed<T> {
        self.borrow_with(BorrowMode::Assert)
    }

    pub fn borrow_with(&self, mode: BorrowMode) -> Borrowed<T> {
        let inner = match mode {
            BorrowMode::Assert => BorrowedInner::Weak(Rc::downgrade(&self.inner)),
            BorrowMode::Allocate => BorrowedInner::Strong(self.inner.clone()),
        };
        Borrowed { inner }
    }

    pub fn with<R>(&self, f: impl FnOnce(&T) -> R) -> R {
        f(&self.inner.borrow())
    }

    /// # Panics
    /// Panics if called re-entrantly from inside another `with`/`with_mut` on the same value.
    pub fn with_mut<R>(&self, f: impl FnOnce(&mut T) -> R) -> R {
        f(&mut self.inner.borrow_mut())
    }

    /// Takes the value back, invalidating every [`BorrowMode::Assert`] borrow.
    ///
    /// Fails, returning `self`, while [`BorrowMode::Allocate`] borrows still share the value.
    pub fn into_inner(self) -> Result<T, Self> {
        Rc::try_unwrap(self.inner)
            .map(RefCell::into_inner)
            .map_err(|inner| Owned { inner })
    }
}

impl<T: Default> Default for Owned<T> {
    fn default() -> Self {
        Owned::new(T::default())
    }
}

impl<T: fmt::Debug> fmt::Debug for Owned<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.inner.try_borrow() {
            Ok(value) => f.debug_tuple("Owned").field(&*value).finish(),
            Err(_) => f.write_str("Owned(<borrowed>)"),
        }
    }
}

enum BorrowedInner<T> {
    Weak(Weak<RefCell<T>>),
    Strong(Rc<RefCell<T>>),
}

pub struct Borrowed<T> {
    inner: BorrowedInner<T>,
}

impl<T> Borrowed<T> {
    fn upgrade(&self) -> Option<Rc<RefCell<T>>> {
        match &self.inner {
            BorrowedInner::Weak(weak) => weak.upgrade(),
            BorrowedInner::Strong(rc) => Some(rc.clone()),
        }
    }

    /// # Panics
    /// Panics if the owner was dropped.
    pub fn with<R>(&self, f: impl FnOnce(&T) -> R) -> R {
        match self.try_with(f) {
            Some(out) => out,
            None => panic!("`Owned` value was dropped while borrowed"),
        }
    }

    /// # Panics
    /// Panics if the owner was dropped, or on re-entrant access.
    pub fn with_mut<R>(&self, f: impl FnOnce(&mut T) -> R) -> R {
        match self.upgrade() {
            Some(rc) => f(&mut rc.borrow_mut()),
            None => panic!("`Owned` value was dropped while borrowed"),
        }
    }

    pub fn try_with<R>(&self, f: impl FnOnce(&T) -> R) -> Option<R> {
        let rc = self.upgrade()?;
        let value = rc.borrow();
        Some(f(&value))
    }

    pub fn is_alive(&self) -> bool {
        match &self.inner {
            BorrowedInner::Weak(weak) => weak.strong_count() > 0,
            BorrowedInner::Strong(_) => true,
        }
    }

    pub fn mode(&self) -> BorrowMode {
        match self.inner {
            BorrowedInner::Weak(_) => BorrowMode::Assert,
            BorrowedInner::Strong(_) => BorrowMode::Allocate,
        }
    }
}

impl<T> Clone for Borrowed<T> {
    fn clone(&self) -> Self {
        let inner = match &self.inner {
            BorrowedInner::Weak(weak) => BorrowedInner::Weak(weak.clone()),
            BorrowedInner::Strong(rc) => BorrowedInner::Strong(rc.clone()),
        };
        Borrowed { inner }
    }
}

impl<T> fmt::Debug for Borrowed<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Borrowed")
            .field("mode", &self.mode())
            .field("alive", &self.is_alive())
            .finish()
    }
}
